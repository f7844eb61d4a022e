//! Downstream controller API capability.
//!
//! # Purpose
//! The wire protocol spoken to downstream controllers is an external
//! collaborator; this module defines the capability surface the rest of
//! JIMM programs against: a dialer, a connection, and the delta/summary
//! watcher streams. `test_support` provides an in-memory controller
//! implementing all of it.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::params::Life;
use crate::store::ControllerDoc;

/// Entity kinds reported by the all-watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Model,
    Application,
    Machine,
    Unit,
}

/// Identity of an entity within the delta stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityId {
    pub kind: EntityKind,
    pub model_uuid: String,
    pub id: String,
}

/// One lifecycle change reported by the all-watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub removed: bool,
    pub entity: DeltaEntity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum DeltaEntity {
    Model {
        uuid: String,
        life: Life,
    },
    Application {
        model_uuid: String,
        name: String,
    },
    Machine {
        model_uuid: String,
        id: String,
        cores: Option<u64>,
    },
    Unit {
        model_uuid: String,
        name: String,
        application: String,
    },
}

impl DeltaEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            DeltaEntity::Model { .. } => EntityKind::Model,
            DeltaEntity::Application { .. } => EntityKind::Application,
            DeltaEntity::Machine { .. } => EntityKind::Machine,
            DeltaEntity::Unit { .. } => EntityKind::Unit,
        }
    }

    pub fn model_uuid(&self) -> &str {
        match self {
            DeltaEntity::Model { uuid, .. } => uuid,
            DeltaEntity::Application { model_uuid, .. } => model_uuid,
            DeltaEntity::Machine { model_uuid, .. } => model_uuid,
            DeltaEntity::Unit { model_uuid, .. } => model_uuid,
        }
    }

    pub fn entity_id(&self) -> EntityId {
        let id = match self {
            DeltaEntity::Model { uuid, .. } => uuid.clone(),
            DeltaEntity::Application { name, .. } => name.clone(),
            DeltaEntity::Machine { id, .. } => id.clone(),
            DeltaEntity::Unit { name, .. } => name.clone(),
        };
        EntityId {
            kind: self.kind(),
            model_uuid: self.model_uuid().to_string(),
            id,
        }
    }
}

/// Per-user access entry in a model info result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUserInfo {
    pub user_name: String,
    pub access: String,
}

/// Model information as reported over the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub uuid: String,
    pub controller_uuid: String,
    pub provider_type: String,
    pub default_series: String,
    pub cloud_tag: String,
    pub cloud_region: String,
    pub cloud_credential_tag: String,
    pub owner_tag: String,
    pub life: String,
    #[serde(default)]
    pub users: Vec<ModelUserInfo>,
    pub agent_version: Option<String>,
}

/// Entity count entry included in model summaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntityCount {
    pub entity: String,
    pub count: i64,
}

/// Model summary published on the hub and returned by the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub name: String,
    pub uuid: String,
    pub controller_uuid: String,
    pub provider_type: String,
    pub default_series: String,
    pub cloud_tag: String,
    pub cloud_region: String,
    pub cloud_credential_tag: String,
    pub owner_tag: String,
    pub life: String,
    pub user_access: String,
    #[serde(default)]
    pub counts: Vec<ModelEntityCount>,
    #[serde(default)]
    pub admins: Vec<String>,
}

/// Credential as reported back by a downstream controller. Secret-typed
/// attribute values are withheld and listed in `redacted`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudCredentialInfo {
    pub auth_type: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub redacted: Vec<String>,
}

/// Arguments for a remote model creation.
#[derive(Debug, Clone, Default)]
pub struct CreateModelArgs {
    pub name: String,
    pub owner_tag: String,
    pub cloud_tag: String,
    pub region: Option<String>,
    pub credential_tag: Option<String>,
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// Server-streaming all-watcher yielding batches of deltas.
#[async_trait]
pub trait DeltaWatcher: Send {
    async fn next(&mut self) -> Result<Vec<Delta>>;
    async fn stop(&mut self) -> Result<()>;
}

/// Model-summary watcher variant, advertised by newer controllers.
#[async_trait]
pub trait SummaryWatcher: Send {
    async fn next(&mut self) -> Result<Vec<ModelSummary>>;
    async fn stop(&mut self) -> Result<()>;
}

/// A live connection to a downstream controller.
#[async_trait]
pub trait ControllerApi: Send + Sync {
    async fn create_model(&self, args: CreateModelArgs) -> Result<ModelInfo>;
    async fn destroy_model(
        &self,
        uuid: &str,
        destroy_storage: Option<bool>,
        force: Option<bool>,
        max_wait: Option<Duration>,
    ) -> Result<()>;
    /// Access is passed through verbatim so unknown levels surface the
    /// controller's own error.
    async fn grant_model(&self, uuid: &str, user_tag: &str, access: &str) -> Result<()>;
    async fn revoke_model(&self, uuid: &str, user_tag: &str, access: &str) -> Result<()>;
    async fn model_info(&self, uuid: &str) -> Result<ModelInfo>;
    async fn update_credential(
        &self,
        tag: &str,
        auth_type: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<()>;
    async fn revoke_credential(&self, tag: &str) -> Result<()>;
    async fn credential(&self, tag: &str) -> Result<CloudCredentialInfo>;
    async fn change_model_credential(&self, uuid: &str, credential_tag: &str) -> Result<()>;
    /// Serialised model dump, passed back to clients as-is.
    async fn dump_model(&self, uuid: &str, simplified: bool) -> Result<String>;
    async fn dump_model_db(&self, uuid: &str) -> Result<serde_json::Value>;
    async fn watch_all_models(&self) -> Result<Box<dyn DeltaWatcher>>;
    fn supports_model_summary_watcher(&self) -> bool;
    async fn watch_all_model_summaries(&self) -> Result<Box<dyn SummaryWatcher>>;
    async fn ping(&self) -> Result<()>;
    /// Releases the underlying transport. Called by the connection cache
    /// once the last reference is gone.
    async fn close(&self);
}

/// Dials downstream controllers.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, ctl: &ControllerDoc) -> Result<Arc<dyn ControllerApi>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_ids_distinguish_kinds() {
        let unit = DeltaEntity::Unit {
            model_uuid: "u-1".to_string(),
            name: "app/0".to_string(),
            application: "app".to_string(),
        };
        let machine = DeltaEntity::Machine {
            model_uuid: "u-1".to_string(),
            id: "app/0".to_string(),
            cores: None,
        };
        assert_ne!(unit.entity_id(), machine.entity_id());
        assert_eq!(unit.entity_id().kind, EntityKind::Unit);
        assert_eq!(unit.model_uuid(), "u-1");
    }

    #[test]
    fn model_delta_id_is_its_uuid() {
        let model = DeltaEntity::Model {
            uuid: "u-2".to_string(),
            life: Life::Alive,
        };
        let id = model.entity_id();
        assert_eq!(id.id, "u-2");
        assert_eq!(id.model_uuid, "u-2");
    }
}
