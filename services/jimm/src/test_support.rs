//! In-memory fakes for the external collaborators.
//!
//! # Purpose
//! A scriptable downstream controller, a dialer over a fleet of them, and a
//! static macaroon verifier. Tests drive the controller's delta and summary
//! streams directly and observe the calls JIMM makes against it.
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::api::{
    CloudCredentialInfo, ControllerApi, CreateModelArgs, Delta, DeltaEntity, DeltaWatcher, Dialer,
    ModelInfo, ModelSummary, ModelUserInfo, SummaryWatcher,
};
use crate::error::{Error, Result};
use crate::params::Life;
use crate::store::ControllerDoc;

/// Attribute names withheld from credential read-back, per auth type.
fn secret_attributes(auth_type: &str) -> &'static [&'static str] {
    match auth_type {
        "userpass" => &["password"],
        "oauth2" => &["client-secret"],
        _ => &[],
    }
}

#[derive(Debug, Clone)]
pub struct FakeModel {
    pub name: String,
    pub owner_tag: String,
    pub uuid: String,
    pub life: Life,
    pub cloud_tag: String,
    pub cloud_region: String,
    pub credential_tag: Option<String>,
    pub users: Vec<ModelUserInfo>,
}

#[derive(Debug, Clone)]
enum WatcherEvent {
    Deltas(Vec<Delta>),
    Failed(String),
}

#[derive(Default)]
struct FakeState {
    models: HashMap<String, FakeModel>,
    credentials: HashMap<String, (String, BTreeMap<String, String>)>,
}

/// An in-memory downstream controller.
pub struct FakeController {
    uuid: String,
    state: Mutex<FakeState>,
    deltas: broadcast::Sender<WatcherEvent>,
    summaries: broadcast::Sender<Vec<ModelSummary>>,
    supports_summaries: AtomicBool,
    unavailable: AtomicBool,
    next_model: AtomicUsize,
    closes: AtomicUsize,
}

impl FakeController {
    pub fn new(uuid: impl Into<String>) -> Arc<Self> {
        let (deltas, _) = broadcast::channel(64);
        let (summaries, _) = broadcast::channel(64);
        Arc::new(Self {
            uuid: uuid.into(),
            state: Mutex::new(FakeState::default()),
            deltas,
            summaries,
            supports_summaries: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
            next_model: AtomicUsize::new(1),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Refuse or allow dials to this controller.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::SeqCst)
    }

    pub fn set_supports_summaries(&self, supported: bool) {
        self.supports_summaries.store(supported, Ordering::SeqCst);
    }

    /// Number of times a connection to this controller has been closed.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Number of open all-watchers.
    pub fn watcher_count(&self) -> usize {
        self.deltas.receiver_count()
    }

    /// Number of open summary watchers.
    pub fn summary_watcher_count(&self) -> usize {
        self.summaries.receiver_count()
    }

    /// Sends a batch of deltas to every open all-watcher.
    pub fn push_deltas(&self, deltas: Vec<Delta>) {
        let _ = self.deltas.send(WatcherEvent::Deltas(deltas));
    }

    /// Makes every open all-watcher fail on its next read.
    pub fn fail_watchers(&self, message: &str) {
        let _ = self.deltas.send(WatcherEvent::Failed(message.to_string()));
    }

    /// Sends a batch of summaries to every open summary watcher.
    pub fn push_summaries(&self, summaries: Vec<ModelSummary>) {
        let _ = self.summaries.send(summaries);
    }

    pub fn model(&self, uuid: &str) -> Option<FakeModel> {
        self.state.lock().expect("state").models.get(uuid).cloned()
    }

    /// Fails API calls while the controller is unreachable, matching a
    /// severed transport rather than a polite error.
    fn check_up(&self) -> Result<()> {
        if self.is_unavailable() {
            return Err(Error::ApiConnection("connection is shut down".to_string()));
        }
        Ok(())
    }

    /// Drops a model as if the controller finished destroying it.
    pub fn complete_destroy(&self, uuid: &str) {
        let removed = self
            .state
            .lock()
            .expect("state")
            .models
            .remove(uuid)
            .is_some();
        if removed {
            self.push_deltas(vec![Delta {
                removed: true,
                entity: DeltaEntity::Model {
                    uuid: uuid.to_string(),
                    life: Life::Dead,
                },
            }]);
        }
    }

    /// Seeds a model without going through the create API.
    pub fn seed_model(&self, model: FakeModel) {
        self.state
            .lock()
            .expect("state")
            .models
            .insert(model.uuid.clone(), model);
    }

    fn model_info_locked(model: &FakeModel, controller_uuid: &str) -> ModelInfo {
        ModelInfo {
            name: model.name.clone(),
            uuid: model.uuid.clone(),
            controller_uuid: controller_uuid.to_string(),
            provider_type: "dummy".to_string(),
            default_series: "xenial".to_string(),
            cloud_tag: model.cloud_tag.clone(),
            cloud_region: model.cloud_region.clone(),
            cloud_credential_tag: model.credential_tag.clone().unwrap_or_default(),
            owner_tag: model.owner_tag.clone(),
            life: model.life.to_string(),
            users: model.users.clone(),
            agent_version: Some("2.0.0".to_string()),
        }
    }
}

#[async_trait]
impl ControllerApi for FakeController {
    async fn create_model(&self, args: CreateModelArgs) -> Result<ModelInfo> {
        self.check_up()?;
        let n = self.next_model.fetch_add(1, Ordering::SeqCst);
        let uuid = format!("00000000-0000-0000-0000-{n:012x}");
        let region = args
            .region
            .clone()
            .unwrap_or_else(|| "dummy-region".to_string());
        let model = FakeModel {
            name: args.name.clone(),
            owner_tag: args.owner_tag.clone(),
            uuid: uuid.clone(),
            life: Life::Alive,
            cloud_tag: args.cloud_tag.clone(),
            cloud_region: region,
            credential_tag: args.credential_tag.clone(),
            users: vec![ModelUserInfo {
                user_name: args
                    .owner_tag
                    .strip_prefix("user-")
                    .unwrap_or(&args.owner_tag)
                    .to_string(),
                access: "admin".to_string(),
            }],
        };
        let info = Self::model_info_locked(&model, &self.uuid);
        self.state
            .lock()
            .expect("state")
            .models
            .insert(uuid.clone(), model);
        self.push_deltas(vec![Delta {
            removed: false,
            entity: DeltaEntity::Model {
                uuid,
                life: Life::Alive,
            },
        }]);
        Ok(info)
    }

    async fn destroy_model(
        &self,
        uuid: &str,
        _destroy_storage: Option<bool>,
        _force: Option<bool>,
        _max_wait: Option<Duration>,
    ) -> Result<()> {
        self.check_up()?;
        let mut state = self.state.lock().expect("state");
        match state.models.get_mut(uuid) {
            Some(model) => {
                model.life = Life::Dying;
                drop(state);
                self.push_deltas(vec![Delta {
                    removed: false,
                    entity: DeltaEntity::Model {
                        uuid: uuid.to_string(),
                        life: Life::Dying,
                    },
                }]);
                Ok(())
            }
            // Destroying an already-gone model succeeds on the controller.
            None => Ok(()),
        }
    }

    async fn grant_model(&self, uuid: &str, user_tag: &str, access: &str) -> Result<()> {
        self.check_up()?;
        if !matches!(access, "read" | "write" | "admin") {
            return Err(Error::BadRequest(format!(
                "{access:?} model access not valid"
            )));
        }
        let mut state = self.state.lock().expect("state");
        let model = state
            .models
            .get_mut(uuid)
            .ok_or_else(|| Error::NotFound(format!("model {uuid:?} not found")))?;
        let user_name = user_tag.strip_prefix("user-").unwrap_or(user_tag);
        match model.users.iter_mut().find(|u| u.user_name == user_name) {
            Some(user) => user.access = access.to_string(),
            None => model.users.push(ModelUserInfo {
                user_name: user_name.to_string(),
                access: access.to_string(),
            }),
        }
        Ok(())
    }

    async fn revoke_model(&self, uuid: &str, user_tag: &str, access: &str) -> Result<()> {
        self.check_up()?;
        if !matches!(access, "read" | "write" | "admin") {
            return Err(Error::BadRequest(format!(
                "{access:?} model access not valid"
            )));
        }
        let mut state = self.state.lock().expect("state");
        let model = state
            .models
            .get_mut(uuid)
            .ok_or_else(|| Error::NotFound(format!("model {uuid:?} not found")))?;
        let user_name = user_tag.strip_prefix("user-").unwrap_or(user_tag);
        model.users.retain(|u| u.user_name != user_name);
        Ok(())
    }

    async fn model_info(&self, uuid: &str) -> Result<ModelInfo> {
        self.check_up()?;
        let state = self.state.lock().expect("state");
        state
            .models
            .get(uuid)
            .map(|m| Self::model_info_locked(m, &self.uuid))
            .ok_or_else(|| Error::NotFound(format!("model {uuid:?} not found")))
    }

    async fn update_credential(
        &self,
        tag: &str,
        auth_type: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.check_up()?;
        self.state
            .lock()
            .expect("state")
            .credentials
            .insert(tag.to_string(), (auth_type.to_string(), attributes.clone()));
        Ok(())
    }

    async fn revoke_credential(&self, tag: &str) -> Result<()> {
        self.check_up()?;
        self.state.lock().expect("state").credentials.remove(tag);
        Ok(())
    }

    async fn credential(&self, tag: &str) -> Result<CloudCredentialInfo> {
        self.check_up()?;
        let state = self.state.lock().expect("state");
        let (auth_type, attributes) = state.credentials.get(tag).ok_or_else(|| {
            let name = tag.rsplit('_').next().unwrap_or(tag);
            Error::NotFound(format!("credential {name:?} not found"))
        })?;
        let secrets = secret_attributes(auth_type);
        let mut visible = BTreeMap::new();
        let mut redacted = Vec::new();
        for (key, value) in attributes {
            if secrets.contains(&key.as_str()) {
                redacted.push(key.clone());
            } else {
                visible.insert(key.clone(), value.clone());
            }
        }
        Ok(CloudCredentialInfo {
            auth_type: auth_type.clone(),
            attributes: visible,
            redacted,
        })
    }

    async fn dump_model(&self, uuid: &str, simplified: bool) -> Result<String> {
        self.check_up()?;
        let state = self.state.lock().expect("state");
        let model = state
            .models
            .get(uuid)
            .ok_or_else(|| Error::NotFound(format!("model {uuid:?} not found")))?;
        Ok(format!(
            "model: {}\nuuid: {}\nsimplified: {simplified}\n",
            model.name, model.uuid
        ))
    }

    async fn dump_model_db(&self, uuid: &str) -> Result<serde_json::Value> {
        self.check_up()?;
        let state = self.state.lock().expect("state");
        let model = state
            .models
            .get(uuid)
            .ok_or_else(|| Error::NotFound(format!("model {uuid:?} not found")))?;
        Ok(serde_json::json!({
            "models": [{"name": model.name, "uuid": model.uuid}],
        }))
    }

    async fn change_model_credential(&self, uuid: &str, credential_tag: &str) -> Result<()> {
        self.check_up()?;
        let mut state = self.state.lock().expect("state");
        let model = state
            .models
            .get_mut(uuid)
            .ok_or_else(|| Error::NotFound(format!("model {uuid:?} not found")))?;
        model.credential_tag = Some(credential_tag.to_string());
        Ok(())
    }

    async fn watch_all_models(&self) -> Result<Box<dyn DeltaWatcher>> {
        self.check_up()?;
        Ok(Box::new(FakeDeltaWatcher {
            rx: self.deltas.subscribe(),
        }))
    }

    fn supports_model_summary_watcher(&self) -> bool {
        self.supports_summaries.load(Ordering::SeqCst)
    }

    async fn watch_all_model_summaries(&self) -> Result<Box<dyn SummaryWatcher>> {
        self.check_up()?;
        if !self.supports_model_summary_watcher() {
            return Err(Error::NotSupported(
                "model summary watcher not supported".to_string(),
            ));
        }
        Ok(Box::new(FakeSummaryWatcher {
            rx: self.summaries.subscribe(),
        }))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeDeltaWatcher {
    rx: broadcast::Receiver<WatcherEvent>,
}

#[async_trait]
impl DeltaWatcher for FakeDeltaWatcher {
    async fn next(&mut self) -> Result<Vec<Delta>> {
        loop {
            match self.rx.recv().await {
                Ok(WatcherEvent::Deltas(deltas)) => return Ok(deltas),
                Ok(WatcherEvent::Failed(message)) => {
                    return Err(Error::Unexpected(anyhow::anyhow!(message)))
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::Unexpected(anyhow::anyhow!("watcher closed")))
                }
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

struct FakeSummaryWatcher {
    rx: broadcast::Receiver<Vec<ModelSummary>>,
}

#[async_trait]
impl SummaryWatcher for FakeSummaryWatcher {
    async fn next(&mut self) -> Result<Vec<ModelSummary>> {
        loop {
            match self.rx.recv().await {
                Ok(summaries) => return Ok(summaries),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::Unexpected(anyhow::anyhow!("watcher closed")))
                }
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Dialer over a fleet of fake controllers, keyed by controller UUID.
#[derive(Default)]
pub struct FakeDialer {
    fleet: Mutex<HashMap<String, Arc<FakeController>>>,
    dials: AtomicUsize,
}

impl FakeDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, controller: Arc<FakeController>) {
        self.fleet
            .lock()
            .expect("fleet")
            .insert(controller.uuid.clone(), controller);
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(&self, ctl: &ControllerDoc) -> Result<Arc<dyn ControllerApi>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let fleet = self.fleet.lock().expect("fleet");
        let controller = fleet.get(&ctl.uuid).ok_or_else(|| {
            Error::ApiConnection(format!("cannot dial controller {:?}", ctl.path.to_string()))
        })?;
        if controller.is_unavailable() {
            return Err(Error::ApiConnection(format!(
                "cannot dial controller {:?}",
                ctl.path.to_string()
            )));
        }
        Ok(Arc::clone(controller) as Arc<dyn ControllerApi>)
    }
}

/// Macaroon verifier accepting a fixed token.
pub struct StaticMacaroons {
    token: String,
    username: String,
}

impl StaticMacaroons {
    pub fn new(token: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            username: username.into(),
        }
    }
}

#[async_trait]
impl crate::rpc::MacaroonVerifier for StaticMacaroons {
    async fn verify(&self, macaroons: &[String]) -> Result<BTreeMap<String, String>> {
        if macaroons.iter().any(|m| m == &self.token) {
            let mut attrs = BTreeMap::new();
            attrs.insert("username".to_string(), self.username.clone());
            Ok(attrs)
        } else {
            Err(Error::Unauthorized("macaroon discharge required".to_string()))
        }
    }

    async fn mint(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_destroy_model() {
        let ctl = FakeController::new("ctl-uuid");
        let info = ctl
            .create_model(CreateModelArgs {
                name: "m".to_string(),
                owner_tag: "user-bob@external".to_string(),
                cloud_tag: "cloud-dummy".to_string(),
                region: None,
                credential_tag: None,
                attributes: Default::default(),
            })
            .await
            .expect("create");
        assert_eq!(info.life, "alive");
        assert_eq!(info.cloud_region, "dummy-region");

        ctl.destroy_model(&info.uuid, None, None, None)
            .await
            .expect("destroy");
        assert_eq!(ctl.model(&info.uuid).expect("model").life, Life::Dying);

        ctl.complete_destroy(&info.uuid);
        let err = ctl.model_info(&info.uuid).await.expect_err("gone");
        assert_eq!(err.kind(), crate::error::Kind::NotFound);
    }

    #[tokio::test]
    async fn credential_redaction() {
        let ctl = FakeController::new("ctl-uuid");
        let attrs: BTreeMap<_, _> = [
            ("username".to_string(), "cloud-user".to_string()),
            ("password".to_string(), "cloud-pass".to_string()),
        ]
        .into_iter()
        .collect();
        ctl.update_credential("cloudcred-dummy_bob@external_cred", "userpass", &attrs)
            .await
            .expect("update");
        let info = ctl
            .credential("cloudcred-dummy_bob@external_cred")
            .await
            .expect("credential");
        assert_eq!(info.auth_type, "userpass");
        assert_eq!(info.attributes.get("username").map(String::as_str), Some("cloud-user"));
        assert!(!info.attributes.contains_key("password"));
        assert_eq!(info.redacted, vec!["password".to_string()]);
    }

    #[tokio::test]
    async fn watcher_sees_pushed_deltas_and_failures() {
        let ctl = FakeController::new("ctl-uuid");
        let mut watcher = ctl.watch_all_models().await.expect("watch");
        ctl.push_deltas(vec![Delta {
            removed: false,
            entity: DeltaEntity::Machine {
                model_uuid: "u-1".to_string(),
                id: "0".to_string(),
                cores: Some(2),
            },
        }]);
        let batch = watcher.next().await.expect("batch");
        assert_eq!(batch.len(), 1);

        ctl.fail_watchers("stream reset");
        let err = watcher.next().await.expect_err("failed");
        assert!(err.to_string().contains("stream reset"));
    }

    #[tokio::test]
    async fn unknown_access_is_rejected_verbatim() {
        let ctl = FakeController::new("ctl-uuid");
        let info = ctl
            .create_model(CreateModelArgs {
                name: "m".to_string(),
                owner_tag: "user-bob@external".to_string(),
                cloud_tag: "cloud-dummy".to_string(),
                region: None,
                credential_tag: None,
                attributes: Default::default(),
            })
            .await
            .expect("create");
        let err = ctl
            .grant_model(&info.uuid, "user-alice@external", "superpowers")
            .await
            .expect_err("bad access");
        assert_eq!(err.to_string(), "\"superpowers\" model access not valid");
    }
}
