//! Model-lifecycle orchestration.
//!
//! # Purpose
//! The gateway's write path: controller selection, model create and
//! destroy, access grants, and credential reconciliation. Every operation
//! validates the caller against the relevant ACL before acting, and
//! compound operations push to the downstream controller first so the
//! local store never claims state the controller refused.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::api::{
    ControllerApi, CreateModelArgs, ModelEntityCount, ModelInfo, ModelSummary, ModelUserInfo,
};
use crate::apiconn::{Connection, ConnectionCache, ReconnectHook};
use crate::auth::{check_access, effective_access, Identity};
use crate::clock::Clock;
use crate::error::{Error, Kind, Result};
use crate::params::{
    cloud_credential_tag, cloud_tag, user_tag, Access, Acl, CredentialPath, EntityPath, Life,
};
use crate::store::{ControllerDoc, CredentialDoc, Database, ModelCounts, ModelDoc};

/// Injectable random choice used by controller selection.
pub trait Chooser: Send + Sync + 'static {
    /// Returns a value in `0..n`. `n` is never zero.
    fn choose(&self, n: usize) -> usize;
}

pub struct RandomChooser;

impl Chooser for RandomChooser {
    fn choose(&self, n: usize) -> usize {
        rand::thread_rng().gen_range(0..n)
    }
}

/// Parameters for [`Manager::create_model`].
#[derive(Debug, Clone, Default)]
pub struct CreateModelParams {
    pub path: EntityPath,
    pub controller_path: Option<EntityPath>,
    pub credential: Option<CredentialPath>,
    pub cloud: String,
    pub region: Option<String>,
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// The orchestrator.
pub struct Manager {
    db: Arc<dyn Database>,
    cache: ConnectionCache,
    clock: Arc<dyn Clock>,
    chooser: Arc<dyn Chooser>,
    controller_admin_group: String,
    controller_uuid: String,
    uuid_masking: bool,
}

impl Manager {
    pub fn new(
        db: Arc<dyn Database>,
        cache: ConnectionCache,
        clock: Arc<dyn Clock>,
        chooser: Arc<dyn Chooser>,
        controller_admin_group: impl Into<String>,
        controller_uuid: impl Into<String>,
        uuid_masking: bool,
    ) -> Self {
        Self {
            db,
            cache,
            clock,
            chooser,
            controller_admin_group: controller_admin_group.into(),
            controller_uuid: controller_uuid.into(),
            uuid_masking,
        }
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn controller_uuid(&self) -> &str {
        &self.controller_uuid
    }

    /// Whether the caller belongs to the controller administrator group.
    pub fn is_controller_admin(&self, identity: &Identity) -> bool {
        identity.is(&self.controller_admin_group)
    }

    /// Opens an API connection to the named controller through the cache.
    pub async fn open_api(&self, path: &EntityPath) -> Result<Connection> {
        self.cache.open(path).await
    }

    /// Fetches a controller the caller may read.
    ///
    /// Missing entities under another user's namespace answer
    /// `Unauthorized` so existence is not leaked.
    pub async fn controller(
        &self,
        identity: &Identity,
        path: &EntityPath,
    ) -> Result<ControllerDoc> {
        match self.db.controller(path).await {
            Ok(ctl) => {
                if self.is_controller_admin(identity) {
                    return Ok(ctl);
                }
                check_access(identity, &ctl.path.user, &ctl.acl, Access::Read)?;
                Ok(ctl)
            }
            Err(err) if err.kind() == Kind::NotFound && !identity.is(&path.user) => {
                Err(err.mask_not_found())
            }
            Err(err) => Err(err),
        }
    }

    /// Fetches a credential the caller may use, with the same masking
    /// rule as [`Manager::controller`].
    pub async fn credential(
        &self,
        identity: &Identity,
        path: &CredentialPath,
    ) -> Result<CredentialDoc> {
        if !identity.is(&path.user) && !self.is_controller_admin(identity) {
            return Err(Error::Unauthorized("unauthorized".to_string()));
        }
        self.db.credential(path).await
    }

    /// All controllers the caller may read whose location matches the
    /// given cloud and region, ordered by path.
    pub async fn controllers_for(
        &self,
        identity: &Identity,
        cloud: Option<&str>,
        region: Option<&str>,
    ) -> Result<Vec<ControllerDoc>> {
        let mut matched = Vec::new();
        for ctl in self.db.list_controllers().await? {
            if !ctl.public {
                continue;
            }
            if let Some(cloud) = cloud {
                if ctl.location.get("cloud").map(String::as_str) != Some(cloud) {
                    continue;
                }
            }
            if let Some(region) = region {
                if ctl.location.get("region").map(String::as_str) != Some(region) {
                    continue;
                }
            }
            if effective_access(identity, &ctl.path.user, &ctl.acl).is_none()
                && !self.is_controller_admin(identity)
            {
                continue;
            }
            matched.push(ctl);
        }
        Ok(matched)
    }

    /// Picks a controller for a new model uniformly at random among the
    /// matching ones.
    pub async fn select_controller(
        &self,
        identity: &Identity,
        cloud: Option<&str>,
        region: Option<&str>,
    ) -> Result<ControllerDoc> {
        let matched = self.controllers_for(identity, cloud, region).await?;
        if matched.is_empty() {
            return Err(Error::NotFound("no matching controllers found".to_string()));
        }
        let index = self.chooser.choose(matched.len());
        Ok(matched.into_iter().nth(index).expect("index in range"))
    }

    /// Creates a model: resolves the credential, picks a controller,
    /// uploads the credential, creates the model remotely and persists the
    /// local row.
    pub async fn create_model(
        &self,
        identity: &Identity,
        params: CreateModelParams,
    ) -> Result<(ModelDoc, ModelInfo)> {
        if !identity.is(&params.path.user) && !self.is_controller_admin(identity) {
            return Err(Error::Unauthorized("unauthorized".to_string()));
        }

        // Resolve the credential before anything else so argument errors
        // surface without touching any controller.
        let credential = match &params.credential {
            Some(path) => {
                // A model's credential always belongs to the model's owner
                // and cloud.
                if path.cloud != params.cloud {
                    return Err(Error::BadRequest(format!(
                        "credential {path} cannot be used for cloud {:?}",
                        params.cloud
                    )));
                }
                if path.user != params.path.user {
                    return Err(Error::BadRequest(format!(
                        "credential {path} cannot be used for models owned by {:?}",
                        params.path.user
                    )));
                }
                Some(self.db.credential(path).await?)
            }
            None => {
                let mut creds = self
                    .db
                    .credentials_for_user_cloud(&params.path.user, &params.cloud)
                    .await?;
                match creds.len() {
                    0 => None,
                    1 => Some(creds.remove(0)),
                    _ => {
                        return Err(Error::AmbiguousChoice(
                            "more than one possible credential to use".to_string(),
                        ))
                    }
                }
            }
        };

        let ctl = match &params.controller_path {
            Some(path) => self.controller(identity, path).await?,
            None => self
                .select_controller(identity, Some(&params.cloud), params.region.as_deref())
                .await
                .map_err(|err| match err {
                    Error::NotFound(msg) => {
                        Error::NotFound(format!("cannot select controller: {msg}"))
                    }
                    other => other,
                })?,
        };

        // A local path collision fails before the controller is touched.
        match self.db.model(&params.path).await {
            Ok(_) => return Err(Error::AlreadyExists("already exists".to_string())),
            Err(err) if err.kind() == Kind::NotFound => {}
            Err(err) => return Err(err),
        }

        let conn = self.open_api(&ctl.path).await?;
        let result = self
            .create_model_on(identity, &params, credential, &ctl, &conn)
            .await;
        conn.close().await;
        result
    }

    async fn create_model_on(
        &self,
        identity: &Identity,
        params: &CreateModelParams,
        credential: Option<CredentialDoc>,
        ctl: &ControllerDoc,
        conn: &Connection,
    ) -> Result<(ModelDoc, ModelInfo)> {
        let credential_tag = match &credential {
            Some(cred) => {
                self.push_credential(conn.api(), cred, &ctl.path).await?;
                Some(cloud_credential_tag(&cred.path))
            }
            None => None,
        };

        let info = conn
            .api()
            .create_model(CreateModelArgs {
                name: params.path.name.clone(),
                owner_tag: user_tag(&params.path.user),
                cloud_tag: cloud_tag(&params.cloud),
                region: params.region.clone(),
                credential_tag,
                attributes: params.attributes.clone(),
            })
            .await?;

        let doc = ModelDoc {
            path: params.path.clone(),
            uuid: info.uuid.clone(),
            controller_path: ctl.path.clone(),
            cloud: params.cloud.clone(),
            cloud_region: info.cloud_region.clone(),
            credential: credential.as_ref().map(|c| c.path.clone()),
            creator: identity.user().to_string(),
            creation_time: self.clock.now(),
            default_series: info.default_series.clone(),
            life: Life::Alive,
            acl: Acl::default(),
            provider_type: ctl.cloud.provider_type.clone(),
            counts: ModelCounts::default(),
        };
        self.db.add_model(&doc).await?;
        metrics::counter!("jimm_models_created_total").increment(1);
        Ok((doc, self.massage_model_info(info)))
    }

    /// Uploads a credential to a controller and records the installation.
    /// Idempotent: re-uploading the same credential is harmless.
    async fn push_credential(
        &self,
        api: &Arc<dyn ControllerApi>,
        cred: &CredentialDoc,
        ctl_path: &EntityPath,
    ) -> Result<()> {
        push_credential(&self.db, api, cred, ctl_path).await
    }

    /// Destroys a model. The local row is marked dying and reaped by the
    /// monitor once the controller reports the model gone.
    pub async fn destroy_model(
        &self,
        identity: &Identity,
        uuid: &str,
        destroy_storage: Option<bool>,
        force: Option<bool>,
        max_wait: Option<Duration>,
    ) -> Result<()> {
        let model = self.db.model_from_uuid(uuid).await?;
        self.check_model_access(identity, &model, Access::Admin)?;

        let conn = self.open_api(&model.controller_path).await?;
        let result = conn
            .api()
            .destroy_model(uuid, destroy_storage, force, max_wait)
            .await;
        conn.close().await;
        result?;

        self.db
            .set_model_life(&model.controller_path, uuid, Life::Dying)
            .await?;
        metrics::counter!("jimm_models_destroyed_total").increment(1);
        Ok(())
    }

    /// Grants `target` access to a model. The downstream controller is
    /// updated first; the local ACL only changes once it accepts.
    pub async fn grant_model(
        &self,
        identity: &Identity,
        uuid: &str,
        target: &str,
        access: &str,
    ) -> Result<()> {
        let model = self.db.model_from_uuid(uuid).await?;
        self.check_model_access(identity, &model, Access::Admin)?;

        let conn = self.open_api(&model.controller_path).await?;
        let result = conn.api().grant_model(uuid, &user_tag(target), access).await;
        conn.close().await;
        result?;

        let mut acl = model.acl.clone();
        if !acl.read.iter().any(|entry| entry == target) {
            acl.read.push(target.to_string());
        }
        self.db.set_model_acl(&model.path, &acl).await
    }

    /// Revokes `target`'s access. As with grant, the controller is the
    /// authority: the local ACL changes only after it accepts.
    pub async fn revoke_model(
        &self,
        identity: &Identity,
        uuid: &str,
        target: &str,
        access: &str,
    ) -> Result<()> {
        let model = self.db.model_from_uuid(uuid).await?;
        self.check_model_access(identity, &model, Access::Admin)?;

        let conn = self.open_api(&model.controller_path).await?;
        let result = conn
            .api()
            .revoke_model(uuid, &user_tag(target), access)
            .await;
        conn.close().await;
        result?;

        let mut acl = model.acl.clone();
        acl.read.retain(|entry| entry != target);
        self.db.set_model_acl(&model.path, &acl).await
    }

    /// Write-through credential update: persist locally, then push to
    /// every controller holding a copy. Controllers that cannot be reached
    /// are queued for the monitor to retry on reconnect.
    pub async fn update_credential(&self, identity: &Identity, cred: &CredentialDoc) -> Result<()> {
        if !identity.is(&cred.path.user) && !self.is_controller_admin(identity) {
            return Err(Error::Unauthorized("unauthorized".to_string()));
        }
        self.db.update_credential(cred).await?;
        let stored = self.db.credential(&cred.path).await?;

        let mut failed = Vec::new();
        for ctl_path in stored.controllers.clone() {
            match self.open_api(&ctl_path).await {
                Ok(conn) => match self.push_credential(conn.api(), &stored, &ctl_path).await {
                    Ok(()) => conn.close().await,
                    Err(err) => {
                        tracing::warn!(
                            controller = %ctl_path,
                            credential = %stored.path,
                            error = %err,
                            "cannot push credential update"
                        );
                        // The connection is suspect; force a re-dial (and
                        // with it the pending-update retry) next time.
                        if matches!(err.kind(), Kind::ApiConnection | Kind::Unexpected) {
                            conn.evict().await;
                        } else {
                            conn.close().await;
                        }
                        failed.push(ctl_path);
                    }
                },
                Err(err) => {
                    tracing::warn!(
                        controller = %ctl_path,
                        credential = %stored.path,
                        error = %err,
                        "cannot reach controller for credential update"
                    );
                    failed.push(ctl_path);
                }
            }
        }
        if !failed.is_empty() {
            self.db.set_credential_updates(&failed, &stored.path).await?;
        }
        Ok(())
    }

    /// Pushes every credential queued for this controller. Also invoked by
    /// the connection cache's reconnect hook.
    pub async fn controller_update_credentials(
        &self,
        ctl_path: &EntityPath,
        api: &Arc<dyn ControllerApi>,
    ) -> Result<()> {
        controller_update_credentials(&self.db, ctl_path, api).await
    }

    /// Moves a model onto a different credential. The caller must
    /// administer the model and own (or be authorized on) the credential.
    pub async fn change_model_credential(
        &self,
        identity: &Identity,
        uuid: &str,
        cred_path: &CredentialPath,
    ) -> Result<()> {
        let model = self.db.model_from_uuid(uuid).await?;
        self.check_model_access(identity, &model, Access::Admin)?;
        let cred = self.credential(identity, cred_path).await?;

        let conn = self.open_api(&model.controller_path).await?;
        let result = async {
            self.push_credential(conn.api(), &cred, &model.controller_path)
                .await?;
            conn.api()
                .change_model_credential(uuid, &cloud_credential_tag(&cred.path))
                .await
        }
        .await;
        conn.close().await;
        result?;

        self.db.set_model_credential(&model.path, &cred.path).await
    }

    /// Fetches a model the caller may read at the given level.
    pub async fn model(
        &self,
        identity: &Identity,
        uuid: &str,
        level: Access,
    ) -> Result<ModelDoc> {
        let model = self.db.model_from_uuid(uuid).await?;
        self.check_model_access(identity, &model, level)?;
        Ok(model)
    }

    /// Model info for the gateway, built from the local mirror.
    pub async fn model_info(&self, identity: &Identity, uuid: &str) -> Result<ModelInfo> {
        let model = self.model(identity, uuid, Access::Read).await?;
        let controller_uuid = self.visible_controller_uuid(&model).await?;
        let mut users = vec![ModelUserInfo {
            user_name: model.path.user.clone(),
            access: "admin".to_string(),
        }];
        for (entries, access) in [
            (&model.acl.admin, "admin"),
            (&model.acl.write, "write"),
            (&model.acl.read, "read"),
        ] {
            for entry in entries {
                if users.iter().any(|u| &u.user_name == entry) {
                    continue;
                }
                users.push(ModelUserInfo {
                    user_name: entry.clone(),
                    access: access.to_string(),
                });
            }
        }
        Ok(self.massage_model_info(ModelInfo {
            name: model.path.name.clone(),
            uuid: model.uuid.clone(),
            controller_uuid,
            provider_type: model.provider_type.clone(),
            default_series: model.default_series.clone(),
            cloud_tag: cloud_tag(&model.cloud),
            cloud_region: model.cloud_region.clone(),
            cloud_credential_tag: model
                .credential
                .as_ref()
                .map(cloud_credential_tag)
                .unwrap_or_default(),
            owner_tag: user_tag(&model.path.user),
            life: model.life.to_string(),
            users,
            agent_version: None,
        }))
    }

    /// Models the caller may read, answered from the local mirror without
    /// fanning out to any controller.
    pub async fn list_models(&self, identity: &Identity) -> Result<Vec<ModelDoc>> {
        let mut visible = Vec::new();
        for model in self.db.list_models().await? {
            if self.model_access(identity, &model).is_some() {
                visible.push(model);
            }
        }
        Ok(visible)
    }

    /// Summaries for every model the caller may read, including machine
    /// and core counts from the mirrored machine rows.
    pub async fn list_model_summaries(&self, identity: &Identity) -> Result<Vec<ModelSummary>> {
        let mut summaries = Vec::new();
        for model in self.db.list_models().await? {
            let Some(access) = self.model_access(identity, &model) else {
                continue;
            };
            let provider_type = if model.provider_type.is_empty() {
                self.db.provider_type(&model.cloud).await?
            } else {
                model.provider_type.clone()
            };
            let machines = self.db.machines_for_model(&model.uuid).await?;
            let machine_count = machines.len() as i64;
            let core_count: i64 = machines
                .iter()
                .filter_map(|m| m.cores)
                .map(|c| c as i64)
                .sum();
            let controller_uuid = self.visible_controller_uuid(&model).await?;
            summaries.push(ModelSummary {
                name: model.path.name.clone(),
                uuid: model.uuid.clone(),
                controller_uuid,
                provider_type,
                default_series: model.default_series.clone(),
                cloud_tag: cloud_tag(&model.cloud),
                cloud_region: model.cloud_region.clone(),
                cloud_credential_tag: model
                    .credential
                    .as_ref()
                    .map(cloud_credential_tag)
                    .unwrap_or_default(),
                owner_tag: user_tag(&model.path.user),
                life: model.life.to_string(),
                user_access: access.to_string(),
                counts: vec![
                    ModelEntityCount {
                        entity: "machines".to_string(),
                        count: machine_count,
                    },
                    ModelEntityCount {
                        entity: "cores".to_string(),
                        count: core_count,
                    },
                ],
                admins: vec![model.path.user.clone()],
            });
        }
        Ok(summaries)
    }

    fn model_access(&self, identity: &Identity, model: &ModelDoc) -> Option<Access> {
        if self.is_controller_admin(identity) {
            return Some(Access::Admin);
        }
        effective_access(identity, &model.path.user, &model.acl)
    }

    fn check_model_access(
        &self,
        identity: &Identity,
        model: &ModelDoc,
        level: Access,
    ) -> Result<Access> {
        if self.is_controller_admin(identity) {
            return Ok(Access::Admin);
        }
        check_access(identity, &model.path.user, &model.acl, level)
    }

    async fn visible_controller_uuid(&self, model: &ModelDoc) -> Result<String> {
        if self.uuid_masking {
            return Ok(self.controller_uuid.clone());
        }
        let ctl = self.db.controller(&model.controller_path).await?;
        Ok(ctl.uuid)
    }

    /// Rewrites controller-scoped fields so the fleet looks like a single
    /// controller: the downstream UUID is masked and local users dropped.
    pub fn massage_model_info(&self, mut info: ModelInfo) -> ModelInfo {
        if self.uuid_masking {
            info.controller_uuid = self.controller_uuid.clone();
        }
        info.users.retain(|u| !u.user_name.ends_with("@local"));
        info
    }
}

/// Uploads (or revokes) one credential on a controller, keeping the
/// credential's controller set in step with what actually succeeded.
async fn push_credential(
    db: &Arc<dyn Database>,
    api: &Arc<dyn ControllerApi>,
    cred: &CredentialDoc,
    ctl_path: &EntityPath,
) -> Result<()> {
    let tag = cloud_credential_tag(&cred.path);
    if cred.revoked {
        api.revoke_credential(&tag).await?;
        db.credential_remove_controller(&cred.path, ctl_path).await?;
    } else {
        api.update_credential(&tag, &cred.auth_type, &cred.attributes)
            .await?;
        db.credential_add_controller(&cred.path, ctl_path).await?;
    }
    Ok(())
}

/// Drains the pending-update queue for one controller over an open
/// connection.
async fn controller_update_credentials(
    db: &Arc<dyn Database>,
    ctl_path: &EntityPath,
    api: &Arc<dyn ControllerApi>,
) -> Result<()> {
    for cred_path in db.pending_credential_updates(ctl_path).await? {
        let cred = match db.credential(&cred_path).await {
            Ok(cred) => cred,
            Err(err) if err.kind() == Kind::NotFound => {
                db.clear_credential_update(ctl_path, &cred_path).await?;
                continue;
            }
            Err(err) => return Err(err),
        };
        push_credential(db, api, &cred, ctl_path).await?;
        db.clear_credential_update(ctl_path, &cred_path).await?;
    }
    Ok(())
}

/// Reconnect hook re-uploading pending credentials, installed into the
/// connection cache at service wiring time.
pub struct CredentialRefresher {
    db: Arc<dyn Database>,
}

impl CredentialRefresher {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ReconnectHook for CredentialRefresher {
    async fn connected(&self, ctl: &ControllerDoc, api: &Arc<dyn ControllerApi>) -> Result<()> {
        controller_update_credentials(&self.db, &ctl.path, api).await
    }
}
