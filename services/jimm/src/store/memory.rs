//! In-memory implementation of the metadata store.
//!
//! # Purpose
//! Implements [`Database`] entirely in memory using `HashMap`s guarded by
//! `tokio::sync::RwLock`. It backs tests and single-node deployments where
//! durability is not required.
//!
//! # Consistency
//! - Single-process consistency only: mutations take write locks, reads
//!   take read locks.
//! - The lease CAS is atomic under the controllers write lock, which is
//!   what the monitor protocol needs within one store.
use std::collections::{BTreeSet, HashMap};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    ApplicationDoc, ControllerDoc, ControllerStats, CredentialDoc, Database, MachineDoc,
    ModelCounts, ModelDoc, MonitorLease, UnitDoc,
};
use crate::error::{Error, Result};
use crate::params::{Acl, CredentialPath, EntityPath, Life};

/// In-memory metadata store.
#[derive(Default)]
pub struct MemoryDatabase {
    controllers: RwLock<HashMap<EntityPath, ControllerDoc>>,
    models: RwLock<HashMap<EntityPath, ModelDoc>>,
    credentials: RwLock<HashMap<CredentialPath, CredentialDoc>>,
    machines: RwLock<HashMap<(String, String), MachineDoc>>,
    applications: RwLock<HashMap<(String, String), ApplicationDoc>>,
    units: RwLock<HashMap<(String, String), UnitDoc>>,
    /// Credentials awaiting a push, per controller.
    pending_updates: RwLock<HashMap<EntityPath, BTreeSet<CredentialPath>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

fn controller_not_found(path: &EntityPath) -> Error {
    Error::NotFound(format!("controller {path:?} not found", path = path.to_string()))
}

fn model_not_found(path: &EntityPath) -> Error {
    Error::NotFound(format!("model {path:?} not found", path = path.to_string()))
}

fn credential_not_found(path: &CredentialPath) -> Error {
    Error::NotFound(format!("credential {path:?} not found", path = path.to_string()))
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn add_controller(&self, ctl: &ControllerDoc) -> Result<()> {
        let mut controllers = self.controllers.write().await;
        if controllers.contains_key(&ctl.path) {
            return Err(Error::AlreadyExists(format!(
                "controller {:?} already exists",
                ctl.path.to_string()
            )));
        }
        if controllers.values().any(|c| c.uuid == ctl.uuid) {
            return Err(Error::AlreadyExists(format!(
                "controller with uuid {:?} already exists",
                ctl.uuid
            )));
        }
        controllers.insert(ctl.path.clone(), ctl.clone());
        metrics::gauge!("jimm_controllers_total").set(controllers.len() as f64);
        Ok(())
    }

    async fn controller(&self, path: &EntityPath) -> Result<ControllerDoc> {
        self.controllers
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| controller_not_found(path))
    }

    async fn remove_controller(&self, path: &EntityPath) -> Result<()> {
        let in_use = self
            .models
            .read()
            .await
            .values()
            .any(|m| &m.controller_path == path);
        if in_use {
            return Err(Error::BadRequest(format!(
                "controller {:?} is still required by models",
                path.to_string()
            )));
        }
        let mut controllers = self.controllers.write().await;
        if controllers.remove(path).is_none() {
            return Err(controller_not_found(path));
        }
        metrics::gauge!("jimm_controllers_total").set(controllers.len() as f64);
        self.pending_updates.write().await.remove(path);
        Ok(())
    }

    async fn list_controllers(&self) -> Result<Vec<ControllerDoc>> {
        let mut items: Vec<_> = self.controllers.read().await.values().cloned().collect();
        items.sort_by(|a, b| {
            (&a.path.user, &a.path.name).cmp(&(&b.path.user, &b.path.name))
        });
        Ok(items)
    }

    async fn set_controller_available(&self, path: &EntityPath) -> Result<()> {
        let mut controllers = self.controllers.write().await;
        let ctl = controllers
            .get_mut(path)
            .ok_or_else(|| controller_not_found(path))?;
        ctl.unavailable_since = None;
        Ok(())
    }

    async fn set_controller_unavailable_at(&self, path: &EntityPath, t: SystemTime) -> Result<()> {
        let mut controllers = self.controllers.write().await;
        let ctl = controllers
            .get_mut(path)
            .ok_or_else(|| controller_not_found(path))?;
        // Keep the first observed failure time across retries.
        if ctl.unavailable_since.is_none() {
            ctl.unavailable_since = Some(t);
        }
        Ok(())
    }

    async fn set_controller_stats(&self, path: &EntityPath, stats: &ControllerStats) -> Result<()> {
        let mut controllers = self.controllers.write().await;
        let ctl = controllers
            .get_mut(path)
            .ok_or_else(|| controller_not_found(path))?;
        ctl.stats = *stats;
        Ok(())
    }

    async fn set_controller_acl(&self, path: &EntityPath, acl: &Acl) -> Result<()> {
        let mut controllers = self.controllers.write().await;
        let ctl = controllers
            .get_mut(path)
            .ok_or_else(|| controller_not_found(path))?;
        ctl.acl = acl.clone();
        Ok(())
    }

    async fn acquire_monitor_lease(
        &self,
        path: &EntityPath,
        old_expiry: Option<SystemTime>,
        old_owner: Option<&str>,
        new_expiry: SystemTime,
        new_owner: Option<&str>,
        now: SystemTime,
    ) -> Result<Option<SystemTime>> {
        let mut controllers = self.controllers.write().await;
        let ctl = controllers
            .get_mut(path)
            .ok_or_else(|| controller_not_found(path))?;

        let matches = match (&ctl.monitor_lease, old_expiry, old_owner) {
            (None, None, None) => true,
            (Some(lease), Some(expiry), Some(owner)) => {
                lease.expiry == expiry && lease.owner == owner
            }
            _ => false,
        };
        let expired = ctl
            .monitor_lease
            .as_ref()
            .map_or(true, |lease| lease.expiry <= now);
        if !matches && !expired {
            return Err(Error::LeaseUnavailable(format!(
                "controller {:?} monitor lease unavailable",
                path.to_string()
            )));
        }
        match new_owner {
            Some(owner) => {
                ctl.monitor_lease = Some(MonitorLease {
                    expiry: new_expiry,
                    owner: owner.to_string(),
                });
                Ok(Some(new_expiry))
            }
            None => {
                ctl.monitor_lease = None;
                Ok(None)
            }
        }
    }

    async fn add_model(&self, model: &ModelDoc) -> Result<()> {
        let mut models = self.models.write().await;
        if models.contains_key(&model.path) {
            return Err(Error::AlreadyExists("already exists".to_string()));
        }
        if models.values().any(|m| m.uuid == model.uuid) {
            return Err(Error::AlreadyExists(format!(
                "model with uuid {:?} already exists",
                model.uuid
            )));
        }
        models.insert(model.path.clone(), model.clone());
        metrics::gauge!("jimm_models_total").set(models.len() as f64);
        Ok(())
    }

    async fn model(&self, path: &EntityPath) -> Result<ModelDoc> {
        self.models
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| model_not_found(path))
    }

    async fn model_from_uuid(&self, uuid: &str) -> Result<ModelDoc> {
        self.models
            .read()
            .await
            .values()
            .find(|m| m.uuid == uuid)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("model {uuid:?} not found")))
    }

    async fn remove_model(&self, path: &EntityPath) -> Result<()> {
        let mut models = self.models.write().await;
        let removed = models.remove(path).ok_or_else(|| model_not_found(path))?;
        metrics::gauge!("jimm_models_total").set(models.len() as f64);
        drop(models);
        // Dependent rows follow the model.
        let uuid = removed.uuid;
        self.machines
            .write()
            .await
            .retain(|(model, _), _| model != &uuid);
        self.applications
            .write()
            .await
            .retain(|(model, _), _| model != &uuid);
        self.units
            .write()
            .await
            .retain(|(model, _), _| model != &uuid);
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelDoc>> {
        let mut items: Vec<_> = self.models.read().await.values().cloned().collect();
        items.sort_by(|a, b| {
            (&a.path.user, &a.path.name).cmp(&(&b.path.user, &b.path.name))
        });
        Ok(items)
    }

    async fn models_for_controller(&self, ctl: &EntityPath) -> Result<Vec<ModelDoc>> {
        let mut items: Vec<_> = self
            .models
            .read()
            .await
            .values()
            .filter(|m| &m.controller_path == ctl)
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            (&a.path.user, &a.path.name).cmp(&(&b.path.user, &b.path.name))
        });
        Ok(items)
    }

    async fn set_model_life(&self, ctl: &EntityPath, uuid: &str, life: Life) -> Result<()> {
        let mut models = self.models.write().await;
        if let Some(model) = models
            .values_mut()
            .find(|m| m.uuid == uuid && &m.controller_path == ctl)
        {
            model.life = life;
        }
        Ok(())
    }

    async fn update_model_counts(&self, uuid: &str, counts: ModelCounts) -> Result<()> {
        let mut models = self.models.write().await;
        let model = models
            .values_mut()
            .find(|m| m.uuid == uuid)
            .ok_or_else(|| Error::NotFound(format!("model {uuid:?} not found")))?;
        model.counts = counts;
        Ok(())
    }

    async fn set_model_acl(&self, path: &EntityPath, acl: &Acl) -> Result<()> {
        let mut models = self.models.write().await;
        let model = models.get_mut(path).ok_or_else(|| model_not_found(path))?;
        model.acl = acl.clone();
        Ok(())
    }

    async fn set_model_credential(&self, path: &EntityPath, cred: &CredentialPath) -> Result<()> {
        let mut models = self.models.write().await;
        let model = models.get_mut(path).ok_or_else(|| model_not_found(path))?;
        model.credential = Some(cred.clone());
        Ok(())
    }

    async fn update_credential(&self, cred: &CredentialDoc) -> Result<()> {
        let mut credentials = self.credentials.write().await;
        match credentials.get_mut(&cred.path) {
            Some(existing) => {
                // Upsert preserves the controller set, which is maintained
                // separately as pushes succeed.
                existing.auth_type = cred.auth_type.clone();
                existing.attributes = cred.attributes.clone();
                existing.revoked = cred.revoked;
            }
            None => {
                credentials.insert(cred.path.clone(), cred.clone());
            }
        }
        metrics::counter!("jimm_credential_updates_total").increment(1);
        Ok(())
    }

    async fn credential(&self, path: &CredentialPath) -> Result<CredentialDoc> {
        self.credentials
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| credential_not_found(path))
    }

    async fn credentials_for_user_cloud(
        &self,
        user: &str,
        cloud: &str,
    ) -> Result<Vec<CredentialDoc>> {
        let mut items: Vec<_> = self
            .credentials
            .read()
            .await
            .values()
            .filter(|c| c.path.user == user && c.path.cloud == cloud && !c.revoked)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.path.name.cmp(&b.path.name));
        Ok(items)
    }

    async fn credential_add_controller(
        &self,
        cred: &CredentialPath,
        ctl: &EntityPath,
    ) -> Result<()> {
        let mut credentials = self.credentials.write().await;
        let doc = credentials
            .get_mut(cred)
            .ok_or_else(|| credential_not_found(cred))?;
        doc.controllers.insert(ctl.clone());
        Ok(())
    }

    async fn credential_remove_controller(
        &self,
        cred: &CredentialPath,
        ctl: &EntityPath,
    ) -> Result<()> {
        let mut credentials = self.credentials.write().await;
        let doc = credentials
            .get_mut(cred)
            .ok_or_else(|| credential_not_found(cred))?;
        doc.controllers.remove(ctl);
        Ok(())
    }

    async fn set_credential_updates(
        &self,
        ctls: &[EntityPath],
        cred: &CredentialPath,
    ) -> Result<()> {
        let mut pending = self.pending_updates.write().await;
        for ctl in ctls {
            pending.entry(ctl.clone()).or_default().insert(cred.clone());
        }
        Ok(())
    }

    async fn pending_credential_updates(&self, ctl: &EntityPath) -> Result<Vec<CredentialPath>> {
        Ok(self
            .pending_updates
            .read()
            .await
            .get(ctl)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear_credential_update(
        &self,
        ctl: &EntityPath,
        cred: &CredentialPath,
    ) -> Result<()> {
        let mut pending = self.pending_updates.write().await;
        if let Some(set) = pending.get_mut(ctl) {
            set.remove(cred);
            if set.is_empty() {
                pending.remove(ctl);
            }
        }
        Ok(())
    }

    async fn update_machine(&self, machine: &MachineDoc) -> Result<()> {
        self.machines.write().await.insert(
            (machine.model_uuid.clone(), machine.id.clone()),
            machine.clone(),
        );
        Ok(())
    }

    async fn remove_machine(&self, model_uuid: &str, id: &str) -> Result<()> {
        self.machines
            .write()
            .await
            .remove(&(model_uuid.to_string(), id.to_string()));
        Ok(())
    }

    async fn machines_for_model(&self, model_uuid: &str) -> Result<Vec<MachineDoc>> {
        let mut items: Vec<_> = self
            .machines
            .read()
            .await
            .values()
            .filter(|m| m.model_uuid == model_uuid)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }

    async fn update_application(&self, app: &ApplicationDoc) -> Result<()> {
        self.applications
            .write()
            .await
            .insert((app.model_uuid.clone(), app.name.clone()), app.clone());
        Ok(())
    }

    async fn remove_application(&self, model_uuid: &str, name: &str) -> Result<()> {
        self.applications
            .write()
            .await
            .remove(&(model_uuid.to_string(), name.to_string()));
        Ok(())
    }

    async fn applications_for_model(&self, model_uuid: &str) -> Result<Vec<ApplicationDoc>> {
        let mut items: Vec<_> = self
            .applications
            .read()
            .await
            .values()
            .filter(|a| a.model_uuid == model_uuid)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    async fn update_unit(&self, unit: &UnitDoc) -> Result<()> {
        self.units
            .write()
            .await
            .insert((unit.model_uuid.clone(), unit.name.clone()), unit.clone());
        Ok(())
    }

    async fn remove_unit(&self, model_uuid: &str, name: &str) -> Result<()> {
        self.units
            .write()
            .await
            .remove(&(model_uuid.to_string(), name.to_string()));
        Ok(())
    }

    async fn units_for_model(&self, model_uuid: &str) -> Result<Vec<UnitDoc>> {
        let mut items: Vec<_> = self
            .units
            .read()
            .await
            .values()
            .filter(|u| u.model_uuid == model_uuid)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    async fn provider_type(&self, cloud: &str) -> Result<String> {
        self.controllers
            .read()
            .await
            .values()
            .find(|c| c.cloud.name == cloud)
            .map(|c| c.cloud.provider_type.clone())
            .ok_or_else(|| Error::NotFound(format!("cloud {cloud:?} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Kind;
    use std::time::{Duration, UNIX_EPOCH};

    fn controller(user: &str, name: &str) -> ControllerDoc {
        ControllerDoc {
            path: EntityPath::new(user, name),
            uuid: format!("{user}-{name}-uuid"),
            host_ports: vec![vec!["198.51.100.1:17070".to_string()]],
            ca_cert: String::new(),
            admin_user: "admin".to_string(),
            admin_secret: "hunter2".to_string(),
            cloud: super::super::CloudSpec {
                name: "dummy".to_string(),
                provider_type: "dummy".to_string(),
                auth_types: vec!["empty".to_string()],
                regions: vec!["dummy-region".to_string()],
            },
            location: Default::default(),
            public: true,
            acl: Acl::default(),
            unavailable_since: None,
            monitor_lease: None,
            stats: ControllerStats::default(),
        }
    }

    fn model(user: &str, name: &str, uuid: &str, ctl: &EntityPath) -> ModelDoc {
        ModelDoc {
            path: EntityPath::new(user, name),
            uuid: uuid.to_string(),
            controller_path: ctl.clone(),
            cloud: "dummy".to_string(),
            cloud_region: "dummy-region".to_string(),
            credential: None,
            creator: user.to_string(),
            creation_time: UNIX_EPOCH,
            default_series: "xenial".to_string(),
            life: Life::Alive,
            acl: Acl::default(),
            provider_type: "dummy".to_string(),
            counts: ModelCounts::default(),
        }
    }

    #[tokio::test]
    async fn controller_uniqueness() {
        let db = MemoryDatabase::new();
        db.add_controller(&controller("bob", "ctl")).await.expect("add");
        let err = db
            .add_controller(&controller("bob", "ctl"))
            .await
            .expect_err("dup path");
        assert_eq!(err.kind(), Kind::AlreadyExists);

        let mut other = controller("alice", "ctl");
        other.uuid = "bob-ctl-uuid".to_string();
        let err = db.add_controller(&other).await.expect_err("dup uuid");
        assert_eq!(err.kind(), Kind::AlreadyExists);
    }

    #[tokio::test]
    async fn controller_removal_requires_no_models() {
        let db = MemoryDatabase::new();
        let ctl = controller("bob", "ctl");
        db.add_controller(&ctl).await.expect("add");
        db.add_model(&model("bob", "m", "u-1", &ctl.path))
            .await
            .expect("model");

        let err = db.remove_controller(&ctl.path).await.expect_err("in use");
        assert_eq!(err.kind(), Kind::BadRequest);

        db.remove_model(&EntityPath::new("bob", "m")).await.expect("rm");
        db.remove_controller(&ctl.path).await.expect("remove");
    }

    #[tokio::test]
    async fn unavailable_since_keeps_first_failure() {
        let db = MemoryDatabase::new();
        let ctl = controller("bob", "ctl");
        db.add_controller(&ctl).await.expect("add");

        let first = UNIX_EPOCH + Duration::from_secs(100);
        let later = UNIX_EPOCH + Duration::from_secs(200);
        db.set_controller_unavailable_at(&ctl.path, first)
            .await
            .expect("set");
        db.set_controller_unavailable_at(&ctl.path, later)
            .await
            .expect("set again");
        let stored = db.controller(&ctl.path).await.expect("get");
        assert_eq!(stored.unavailable_since, Some(first));

        db.set_controller_available(&ctl.path).await.expect("clear");
        let stored = db.controller(&ctl.path).await.expect("get");
        assert_eq!(stored.unavailable_since, None);
    }

    #[tokio::test]
    async fn lease_cas_lifecycle() {
        let db = MemoryDatabase::new();
        let ctl = controller("bob", "ctl");
        db.add_controller(&ctl).await.expect("add");

        let now = UNIX_EPOCH + Duration::from_secs(1_000);
        let expiry1 = now + Duration::from_secs(60);

        // Fresh acquisition.
        let acquired = db
            .acquire_monitor_lease(&ctl.path, None, None, expiry1, Some("jimm-1"), now)
            .await
            .expect("acquire");
        assert_eq!(acquired, Some(expiry1));

        // A second instance cannot steal a live lease.
        let err = db
            .acquire_monitor_lease(
                &ctl.path,
                None,
                None,
                now + Duration::from_secs(90),
                Some("jimm-2"),
                now,
            )
            .await
            .expect_err("conflict");
        assert_eq!(err.kind(), Kind::LeaseUnavailable);

        // The holder renews with the matching pair.
        let expiry2 = now + Duration::from_secs(120);
        let renewed = db
            .acquire_monitor_lease(
                &ctl.path,
                Some(expiry1),
                Some("jimm-1"),
                expiry2,
                Some("jimm-1"),
                now,
            )
            .await
            .expect("renew");
        assert_eq!(renewed, Some(expiry2));

        // Anyone can claim an expired lease.
        let after = expiry2 + Duration::from_secs(1);
        let stolen = db
            .acquire_monitor_lease(
                &ctl.path,
                None,
                None,
                after + Duration::from_secs(60),
                Some("jimm-2"),
                after,
            )
            .await
            .expect("steal expired");
        assert_eq!(stolen, Some(after + Duration::from_secs(60)));

        // Drop by the new holder.
        let dropped = db
            .acquire_monitor_lease(
                &ctl.path,
                Some(after + Duration::from_secs(60)),
                Some("jimm-2"),
                after,
                None,
                after,
            )
            .await
            .expect("drop");
        assert_eq!(dropped, None);

        let err = db
            .acquire_monitor_lease(
                &EntityPath::new("bob", "missing"),
                None,
                None,
                after,
                Some("jimm-1"),
                after,
            )
            .await
            .expect_err("missing controller");
        assert_eq!(err.kind(), Kind::NotFound);
    }

    #[tokio::test]
    async fn model_uniqueness_and_lookup() {
        let db = MemoryDatabase::new();
        let ctl = controller("bob", "ctl");
        db.add_controller(&ctl).await.expect("add");
        db.add_model(&model("bob", "m", "u-1", &ctl.path))
            .await
            .expect("model");

        let err = db
            .add_model(&model("bob", "m", "u-2", &ctl.path))
            .await
            .expect_err("dup path");
        assert_eq!(err.kind(), Kind::AlreadyExists);

        let err = db
            .add_model(&model("bob", "m2", "u-1", &ctl.path))
            .await
            .expect_err("dup uuid");
        assert_eq!(err.kind(), Kind::AlreadyExists);

        let by_uuid = db.model_from_uuid("u-1").await.expect("uuid");
        assert_eq!(by_uuid.path, EntityPath::new("bob", "m"));

        let err = db
            .model(&EntityPath::new("bob", "missing"))
            .await
            .expect_err("missing");
        assert_eq!(err.to_string(), "model \"bob/missing\" not found");
    }

    #[tokio::test]
    async fn life_and_counts_updates() {
        let db = MemoryDatabase::new();
        let ctl = controller("bob", "ctl");
        db.add_controller(&ctl).await.expect("add");
        db.add_model(&model("bob", "m", "u-1", &ctl.path))
            .await
            .expect("model");

        db.set_model_life(&ctl.path, "u-1", Life::Dying)
            .await
            .expect("life");
        assert_eq!(
            db.model_from_uuid("u-1").await.expect("get").life,
            Life::Dying
        );

        // Unknown UUIDs are ignored: the controller hosts models JIMM does
        // not track.
        db.set_model_life(&ctl.path, "u-unknown", Life::Dead)
            .await
            .expect("ignored");

        let counts = ModelCounts {
            units: 3,
            machines: 2,
            applications: 1,
        };
        db.update_model_counts("u-1", counts).await.expect("counts");
        assert_eq!(db.model_from_uuid("u-1").await.expect("get").counts, counts);

        let err = db
            .update_model_counts("u-unknown", counts)
            .await
            .expect_err("missing");
        assert_eq!(err.kind(), Kind::NotFound);
    }

    #[tokio::test]
    async fn credential_upsert_preserves_controller_set() {
        let db = MemoryDatabase::new();
        let path = CredentialPath::new("dummy", "bob", "cred");
        db.update_credential(&CredentialDoc {
            path: path.clone(),
            auth_type: "empty".to_string(),
            attributes: Default::default(),
            revoked: false,
            controllers: Default::default(),
        })
        .await
        .expect("create");

        let ctl = EntityPath::new("bob", "ctl");
        db.credential_add_controller(&path, &ctl).await.expect("add ctl");

        db.update_credential(&CredentialDoc {
            path: path.clone(),
            auth_type: "userpass".to_string(),
            attributes: [("username".to_string(), "cloud-user".to_string())]
                .into_iter()
                .collect(),
            revoked: false,
            controllers: Default::default(),
        })
        .await
        .expect("update");

        let stored = db.credential(&path).await.expect("get");
        assert_eq!(stored.auth_type, "userpass");
        assert!(stored.controllers.contains(&ctl));

        db.credential_remove_controller(&path, &ctl)
            .await
            .expect("remove ctl");
        let stored = db.credential(&path).await.expect("get");
        assert!(stored.controllers.is_empty());
    }

    #[tokio::test]
    async fn pending_credential_updates_queue() {
        let db = MemoryDatabase::new();
        let cred = CredentialPath::new("dummy", "bob", "cred");
        let ctl1 = EntityPath::new("bob", "c1");
        let ctl2 = EntityPath::new("bob", "c2");

        db.set_credential_updates(&[ctl1.clone(), ctl2.clone()], &cred)
            .await
            .expect("set");
        assert_eq!(
            db.pending_credential_updates(&ctl1).await.expect("pending"),
            vec![cred.clone()]
        );

        db.clear_credential_update(&ctl1, &cred).await.expect("clear");
        assert!(db
            .pending_credential_updates(&ctl1)
            .await
            .expect("pending")
            .is_empty());
        assert_eq!(
            db.pending_credential_updates(&ctl2).await.expect("pending"),
            vec![cred]
        );
    }

    #[tokio::test]
    async fn entity_rows_follow_model_removal() {
        let db = MemoryDatabase::new();
        let ctl = controller("bob", "ctl");
        db.add_controller(&ctl).await.expect("add");
        db.add_model(&model("bob", "m", "u-1", &ctl.path))
            .await
            .expect("model");
        db.update_machine(&MachineDoc {
            model_uuid: "u-1".to_string(),
            id: "0".to_string(),
            cores: Some(4),
        })
        .await
        .expect("machine");
        db.update_unit(&UnitDoc {
            model_uuid: "u-1".to_string(),
            name: "app/0".to_string(),
            application: "app".to_string(),
        })
        .await
        .expect("unit");

        db.remove_model(&EntityPath::new("bob", "m")).await.expect("rm");
        assert!(db.machines_for_model("u-1").await.expect("machines").is_empty());
        assert!(db.units_for_model("u-1").await.expect("units").is_empty());
    }

    #[tokio::test]
    async fn provider_type_lookup() {
        let db = MemoryDatabase::new();
        db.add_controller(&controller("bob", "ctl")).await.expect("add");
        assert_eq!(db.provider_type("dummy").await.expect("type"), "dummy");
        let err = db.provider_type("aws").await.expect_err("missing");
        assert_eq!(err.kind(), Kind::NotFound);
    }
}
