//! Metadata store façade.
//!
//! # Purpose
//! Typed read/write interface over the document database holding JIMM's
//! aggregate state: controllers, models, credentials, machines,
//! applications, units and ACLs. The store exclusively owns persisted
//! entities; every other component goes through [`Database`].
//!
//! The in-memory implementation in [`memory`] backs tests and single-node
//! deployments. A durable backend would speak the document-store wire
//! protocol through the session pool in [`session`].
use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::params::{Acl, CredentialPath, EntityPath, Life};

pub mod memory;
pub mod session;

/// Cloud description embedded in a controller document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudSpec {
    pub name: String,
    pub provider_type: String,
    #[serde(default)]
    pub auth_types: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
}

/// Monitor lease embedded in a controller document.
///
/// Held by at most one JIMM instance at a time; renewal succeeds only when
/// the caller proves it knows the current (expiry, owner) pair or the lease
/// has expired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorLease {
    pub expiry: SystemTime,
    pub owner: String,
}

/// Aggregate statistics derived from a controller's delta stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerStats {
    pub model_count: u64,
    pub unit_count: u64,
    pub application_count: u64,
    pub machine_count: u64,
}

/// Per-model entity counts maintained by the monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCounts {
    pub units: u64,
    pub machines: u64,
    pub applications: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerDoc {
    pub path: EntityPath,
    pub uuid: String,
    /// Candidate address lists, one inner list per published endpoint.
    #[serde(default)]
    pub host_ports: Vec<Vec<String>>,
    #[serde(default)]
    pub ca_cert: String,
    pub admin_user: String,
    pub admin_secret: String,
    pub cloud: CloudSpec,
    /// Opaque location attributes; `cloud` and `region` drive selection.
    #[serde(default)]
    pub location: BTreeMap<String, String>,
    pub public: bool,
    #[serde(default)]
    pub acl: Acl,
    /// Set when a dial fails, cleared on the next successful dial.
    pub unavailable_since: Option<SystemTime>,
    pub monitor_lease: Option<MonitorLease>,
    #[serde(default)]
    pub stats: ControllerStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDoc {
    pub path: EntityPath,
    pub uuid: String,
    pub controller_path: EntityPath,
    pub cloud: String,
    pub cloud_region: String,
    pub credential: Option<CredentialPath>,
    pub creator: String,
    pub creation_time: SystemTime,
    pub default_series: String,
    pub life: Life,
    #[serde(default)]
    pub acl: Acl,
    pub provider_type: String,
    #[serde(default)]
    pub counts: ModelCounts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialDoc {
    pub path: CredentialPath,
    pub auth_type: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub revoked: bool,
    /// Controllers holding a current copy of this credential.
    #[serde(default)]
    pub controllers: BTreeSet<EntityPath>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineDoc {
    pub model_uuid: String,
    pub id: String,
    /// Processor cores reported by the downstream controller, when known.
    pub cores: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationDoc {
    pub model_uuid: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitDoc {
    pub model_uuid: String,
    pub name: String,
    pub application: String,
}

/// The metadata store interface.
///
/// Writes are entity-level and last-writer-wins unless documented
/// otherwise; the lease CAS is the one conditional operation.
#[async_trait]
pub trait Database: Send + Sync + 'static {
    // Controllers.
    async fn add_controller(&self, ctl: &ControllerDoc) -> Result<()>;
    async fn controller(&self, path: &EntityPath) -> Result<ControllerDoc>;
    /// Removes a controller. Fails while any model still references it.
    async fn remove_controller(&self, path: &EntityPath) -> Result<()>;
    /// All controllers ordered by path.
    async fn list_controllers(&self) -> Result<Vec<ControllerDoc>>;
    async fn set_controller_available(&self, path: &EntityPath) -> Result<()>;
    /// Records the time of a failed dial unless one is already recorded.
    async fn set_controller_unavailable_at(&self, path: &EntityPath, t: SystemTime) -> Result<()>;
    async fn set_controller_stats(&self, path: &EntityPath, stats: &ControllerStats) -> Result<()>;
    async fn set_controller_acl(&self, path: &EntityPath, acl: &Acl) -> Result<()>;

    /// Compare-and-swap on the monitor lease.
    ///
    /// Succeeds when the stored lease matches `(old_expiry, old_owner)` or
    /// has expired relative to `now`. `new_owner = None` drops the lease.
    /// Returns the authoritative new expiry, `None` after a drop.
    async fn acquire_monitor_lease(
        &self,
        path: &EntityPath,
        old_expiry: Option<SystemTime>,
        old_owner: Option<&str>,
        new_expiry: SystemTime,
        new_owner: Option<&str>,
        now: SystemTime,
    ) -> Result<Option<SystemTime>>;

    // Models.
    async fn add_model(&self, model: &ModelDoc) -> Result<()>;
    async fn model(&self, path: &EntityPath) -> Result<ModelDoc>;
    async fn model_from_uuid(&self, uuid: &str) -> Result<ModelDoc>;
    async fn remove_model(&self, path: &EntityPath) -> Result<()>;
    /// All models ordered by path.
    async fn list_models(&self) -> Result<Vec<ModelDoc>>;
    async fn models_for_controller(&self, ctl: &EntityPath) -> Result<Vec<ModelDoc>>;
    /// Updates the life of the model with the given UUID on the given
    /// controller. Models not present locally are ignored.
    async fn set_model_life(&self, ctl: &EntityPath, uuid: &str, life: Life) -> Result<()>;
    /// Updates per-model entity counts; not-found is an error the caller
    /// may choose to tolerate.
    async fn update_model_counts(&self, uuid: &str, counts: ModelCounts) -> Result<()>;
    async fn set_model_acl(&self, path: &EntityPath, acl: &Acl) -> Result<()>;
    async fn set_model_credential(&self, path: &EntityPath, cred: &CredentialPath) -> Result<()>;

    // Credentials.
    /// Upserts a credential's type, attributes and revocation flag,
    /// preserving its controller set.
    async fn update_credential(&self, cred: &CredentialDoc) -> Result<()>;
    async fn credential(&self, path: &CredentialPath) -> Result<CredentialDoc>;
    async fn credentials_for_user_cloud(
        &self,
        user: &str,
        cloud: &str,
    ) -> Result<Vec<CredentialDoc>>;
    async fn credential_add_controller(
        &self,
        cred: &CredentialPath,
        ctl: &EntityPath,
    ) -> Result<()>;
    async fn credential_remove_controller(
        &self,
        cred: &CredentialPath,
        ctl: &EntityPath,
    ) -> Result<()>;
    /// Marks a credential as needing a push to each listed controller.
    async fn set_credential_updates(
        &self,
        ctls: &[EntityPath],
        cred: &CredentialPath,
    ) -> Result<()>;
    async fn pending_credential_updates(&self, ctl: &EntityPath) -> Result<Vec<CredentialPath>>;
    async fn clear_credential_update(
        &self,
        ctl: &EntityPath,
        cred: &CredentialPath,
    ) -> Result<()>;

    // Machines, applications, units. Rows follow the delta stream.
    async fn update_machine(&self, machine: &MachineDoc) -> Result<()>;
    async fn remove_machine(&self, model_uuid: &str, id: &str) -> Result<()>;
    async fn machines_for_model(&self, model_uuid: &str) -> Result<Vec<MachineDoc>>;
    async fn update_application(&self, app: &ApplicationDoc) -> Result<()>;
    async fn remove_application(&self, model_uuid: &str, name: &str) -> Result<()>;
    async fn applications_for_model(&self, model_uuid: &str) -> Result<Vec<ApplicationDoc>>;
    async fn update_unit(&self, unit: &UnitDoc) -> Result<()>;
    async fn remove_unit(&self, model_uuid: &str, name: &str) -> Result<()>;
    async fn units_for_model(&self, model_uuid: &str) -> Result<Vec<UnitDoc>>;

    /// Provider type for a cloud, resolved from any controller hosting it.
    async fn provider_type(&self, cloud: &str) -> Result<String>;
}
