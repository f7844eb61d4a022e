//! ModelManager facade (v2 through v5).
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::cloud::{Entities, ErrorResult, ErrorResults};
use super::{decode_params, encode_result, map_error, method, Registry, Session, WireError};
use crate::api::{ModelEntityCount, ModelInfo, ModelSummary, ModelUserInfo};
use crate::error::{Error, Kind, Result};
use crate::manager::CreateModelParams;
use crate::params::{
    model_tag, parse_cloud_credential_tag, parse_cloud_tag, parse_model_tag, parse_user_tag,
    user_tag, Access, EntityPath,
};

pub fn register(registry: &mut Registry) {
    let change_model_credential = method(change_model_credential);
    let create_model = method(create_model);
    let destroy_models_v4 = method(destroy_models);
    let destroy_models = method(destroy_models_legacy);
    let dump_models_v3 = method(dump_models);
    let dump_models = method(dump_models_db_map);
    let dump_models_db = method(dump_models_db);
    let list_model_summaries = method(list_model_summaries);
    let list_models = method(list_models);
    let model_info = method(model_info);
    let model_status = method(model_status);
    let modify_model_access = method(modify_model_access);

    registry.add_method("ModelManager", 2, "CreateModel", create_model.clone());
    registry.add_method("ModelManager", 2, "DestroyModels", destroy_models.clone());
    registry.add_method("ModelManager", 2, "DumpModels", dump_models.clone());
    registry.add_method("ModelManager", 2, "DumpModelsDB", dump_models_db.clone());
    registry.add_method("ModelManager", 2, "ListModels", list_models.clone());
    registry.add_method("ModelManager", 2, "ModelStatus", model_status.clone());
    registry.add_method("ModelManager", 2, "ModifyModelAccess", modify_model_access.clone());

    registry.add_method("ModelManager", 3, "CreateModel", create_model.clone());
    registry.add_method("ModelManager", 3, "DestroyModels", destroy_models);
    registry.add_method("ModelManager", 3, "DumpModels", dump_models_v3.clone());
    registry.add_method("ModelManager", 3, "DumpModelsDB", dump_models_db.clone());
    registry.add_method("ModelManager", 3, "ListModels", list_models.clone());
    registry.add_method("ModelManager", 3, "ModelInfo", model_info.clone());
    registry.add_method("ModelManager", 3, "ModelStatus", model_status.clone());
    registry.add_method("ModelManager", 3, "ModifyModelAccess", modify_model_access.clone());

    registry.add_method("ModelManager", 4, "CreateModel", create_model.clone());
    registry.add_method("ModelManager", 4, "DestroyModels", destroy_models_v4.clone());
    registry.add_method("ModelManager", 4, "DumpModels", dump_models_v3.clone());
    registry.add_method("ModelManager", 4, "DumpModelsDB", dump_models_db.clone());
    registry.add_method("ModelManager", 4, "ListModelSummaries", list_model_summaries.clone());
    registry.add_method("ModelManager", 4, "ListModels", list_models.clone());
    registry.add_method("ModelManager", 4, "ModelInfo", model_info.clone());
    registry.add_method("ModelManager", 4, "ModelStatus", model_status.clone());
    registry.add_method("ModelManager", 4, "ModifyModelAccess", modify_model_access.clone());

    registry.add_method("ModelManager", 5, "ChangeModelCredential", change_model_credential);
    registry.add_method("ModelManager", 5, "CreateModel", create_model);
    registry.add_method("ModelManager", 5, "DestroyModels", destroy_models_v4);
    registry.add_method("ModelManager", 5, "DumpModels", dump_models_v3);
    registry.add_method("ModelManager", 5, "DumpModelsDB", dump_models_db);
    registry.add_method("ModelManager", 5, "ListModelSummaries", list_model_summaries);
    registry.add_method("ModelManager", 5, "ListModels", list_models);
    registry.add_method("ModelManager", 5, "ModelInfo", model_info);
    registry.add_method("ModelManager", 5, "ModelStatus", model_status);
    registry.add_method("ModelManager", 5, "ModifyModelAccess", modify_model_access);
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ModelUserInfoWire {
    #[serde(rename = "user")]
    pub user_name: String,
    pub access: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ModelInfoWire {
    pub name: String,
    pub uuid: String,
    #[serde(rename = "controller-uuid")]
    pub controller_uuid: String,
    #[serde(rename = "provider-type")]
    pub provider_type: String,
    #[serde(rename = "default-series")]
    pub default_series: String,
    #[serde(rename = "cloud-tag")]
    pub cloud_tag: String,
    #[serde(rename = "cloud-region")]
    pub cloud_region: String,
    #[serde(rename = "cloud-credential-tag")]
    pub cloud_credential_tag: String,
    #[serde(rename = "owner-tag")]
    pub owner_tag: String,
    pub life: String,
    #[serde(default)]
    pub users: Vec<ModelUserInfoWire>,
    #[serde(rename = "agent-version", skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,
}

impl From<ModelInfo> for ModelInfoWire {
    fn from(info: ModelInfo) -> Self {
        Self {
            name: info.name,
            uuid: info.uuid,
            controller_uuid: info.controller_uuid,
            provider_type: info.provider_type,
            default_series: info.default_series,
            cloud_tag: info.cloud_tag,
            cloud_region: info.cloud_region,
            cloud_credential_tag: info.cloud_credential_tag,
            owner_tag: info.owner_tag,
            life: info.life,
            users: info
                .users
                .into_iter()
                .map(|ModelUserInfo { user_name, access }| ModelUserInfoWire { user_name, access })
                .collect(),
            agent_version: info.agent_version,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ModelCreateArgs {
    pub name: String,
    #[serde(rename = "owner-tag")]
    pub owner_tag: String,
    #[serde(rename = "cloud-tag", default)]
    pub cloud_tag: String,
    #[serde(rename = "region", default)]
    pub region: Option<String>,
    #[serde(rename = "cloud-credential-tag", default)]
    pub cloud_credential_tag: Option<String>,
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
}

async fn create_model(session: Arc<Session>, params: serde_json::Value) -> Result<serde_json::Value> {
    let identity = session.require_identity().await?;
    let args: ModelCreateArgs = decode_params(params)?;
    let owner = parse_user_tag(&args.owner_tag)?;
    if args.cloud_tag.is_empty() {
        return Err(Error::BadRequest(
            "no cloud specified for model; please specify one".to_string(),
        ));
    }
    let cloud = parse_cloud_tag(&args.cloud_tag)?;
    let credential = match &args.cloud_credential_tag {
        Some(tag) if !tag.is_empty() => Some(parse_cloud_credential_tag(tag)?),
        _ => None,
    };
    let (_, info) = session
        .manager()
        .create_model(
            &identity,
            CreateModelParams {
                path: EntityPath::new(owner, args.name),
                controller_path: None,
                credential,
                cloud,
                region: args.region,
                attributes: args.config,
            },
        )
        .await?;
    metrics::counter!("jimm_gateway_models_created_total").increment(1);
    encode_result(ModelInfoWire::from(info))
}

#[derive(Debug, Default, Deserialize)]
pub struct DestroyModelsParams {
    #[serde(default)]
    pub models: Vec<DestroyModelParams>,
}

#[derive(Debug, Deserialize)]
pub struct DestroyModelParams {
    #[serde(rename = "model-tag")]
    pub model_tag: String,
    #[serde(rename = "destroy-storage", default)]
    pub destroy_storage: Option<bool>,
    #[serde(default)]
    pub force: Option<bool>,
    #[serde(rename = "max-wait", default)]
    pub max_wait: Option<u64>,
}

/// DestroyModels for v3 and below always destroys storage.
async fn destroy_models_legacy(
    session: Arc<Session>,
    params: serde_json::Value,
) -> Result<serde_json::Value> {
    let args: Entities = decode_params(params)?;
    let models = args
        .entities
        .into_iter()
        .map(|entity| DestroyModelParams {
            model_tag: entity.tag,
            destroy_storage: Some(true),
            force: None,
            max_wait: None,
        })
        .collect();
    destroy(session, DestroyModelsParams { models }).await
}

async fn destroy_models(
    session: Arc<Session>,
    params: serde_json::Value,
) -> Result<serde_json::Value> {
    let args: DestroyModelsParams = decode_params(params)?;
    destroy(session, args).await
}

async fn destroy(session: Arc<Session>, args: DestroyModelsParams) -> Result<serde_json::Value> {
    let identity = session.require_identity().await?;
    let mut results = Vec::with_capacity(args.models.len());
    for model in args.models {
        let outcome = async {
            let uuid = parse_model_tag(&model.model_tag)?;
            session
                .manager()
                .destroy_model(
                    &identity,
                    &uuid,
                    model.destroy_storage,
                    model.force,
                    model.max_wait.map(Duration::from_secs),
                )
                .await
        }
        .await;
        let error = match outcome {
            Ok(()) => None,
            // It isn't an error to destroy an already destroyed model.
            Err(err) if err.kind() == Kind::NotFound => None,
            Err(err) => Some(map_error(&err)),
        };
        results.push(ErrorResult { error });
    }
    encode_result(ErrorResults { results })
}

#[derive(Debug, Default, Serialize)]
pub struct UserModelList {
    #[serde(rename = "user-models")]
    pub user_models: Vec<UserModel>,
}

#[derive(Debug, Serialize)]
pub struct UserModel {
    pub model: ModelWire,
    #[serde(rename = "last-connection")]
    pub last_connection: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ModelWire {
    pub name: String,
    pub uuid: String,
    #[serde(rename = "owner-tag")]
    pub owner_tag: String,
}

/// Models the caller can read, answered from the local mirror.
async fn list_models(session: Arc<Session>, _params: serde_json::Value) -> Result<serde_json::Value> {
    let identity = session.require_identity().await?;
    let models = session.manager().list_models(&identity).await?;
    encode_result(UserModelList {
        user_models: models
            .into_iter()
            .map(|model| UserModel {
                model: ModelWire {
                    name: model.path.name.clone(),
                    uuid: model.uuid,
                    owner_tag: user_tag(&model.path.user),
                },
                last_connection: None,
            })
            .collect(),
    })
}

#[derive(Debug, Default, Serialize)]
pub struct ModelSummaryResults {
    pub results: Vec<ModelSummaryResult>,
}

#[derive(Debug, Default, Serialize)]
pub struct ModelSummaryResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ModelSummaryWire>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Debug, Default, Serialize)]
pub struct ModelSummaryWire {
    pub name: String,
    pub uuid: String,
    #[serde(rename = "controller-uuid")]
    pub controller_uuid: String,
    #[serde(rename = "provider-type")]
    pub provider_type: String,
    #[serde(rename = "default-series")]
    pub default_series: String,
    #[serde(rename = "cloud-tag")]
    pub cloud_tag: String,
    #[serde(rename = "cloud-region")]
    pub cloud_region: String,
    #[serde(rename = "cloud-credential-tag")]
    pub cloud_credential_tag: String,
    #[serde(rename = "owner-tag")]
    pub owner_tag: String,
    pub life: String,
    #[serde(rename = "user-access")]
    pub user_access: String,
    #[serde(default)]
    pub counts: Vec<ModelEntityCountWire>,
}

#[derive(Debug, Serialize)]
pub struct ModelEntityCountWire {
    pub entity: String,
    pub count: i64,
}

impl From<ModelSummary> for ModelSummaryWire {
    fn from(summary: ModelSummary) -> Self {
        Self {
            name: summary.name,
            uuid: summary.uuid,
            controller_uuid: summary.controller_uuid,
            provider_type: summary.provider_type,
            default_series: summary.default_series,
            cloud_tag: summary.cloud_tag,
            cloud_region: summary.cloud_region,
            cloud_credential_tag: summary.cloud_credential_tag,
            owner_tag: summary.owner_tag,
            life: summary.life,
            user_access: summary.user_access,
            counts: summary
                .counts
                .into_iter()
                .map(|ModelEntityCount { entity, count }| ModelEntityCountWire { entity, count })
                .collect(),
        }
    }
}

async fn list_model_summaries(
    session: Arc<Session>,
    _params: serde_json::Value,
) -> Result<serde_json::Value> {
    let identity = session.require_identity().await?;
    let summaries = session.manager().list_model_summaries(&identity).await?;
    encode_result(ModelSummaryResults {
        results: summaries
            .into_iter()
            .map(|summary| ModelSummaryResult {
                result: Some(summary.into()),
                error: None,
            })
            .collect(),
    })
}

#[derive(Debug, Default, Serialize)]
pub struct ModelInfoResults {
    pub results: Vec<ModelInfoResult>,
}

#[derive(Debug, Default, Serialize)]
pub struct ModelInfoResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ModelInfoWire>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

async fn model_info(session: Arc<Session>, params: serde_json::Value) -> Result<serde_json::Value> {
    let identity = session.require_identity().await?;
    let args: Entities = decode_params(params)?;
    let mut results = Vec::with_capacity(args.entities.len());
    for entity in args.entities {
        let outcome = async {
            let uuid = parse_model_tag(&entity.tag)?;
            session
                .manager()
                .model_info(&identity, &uuid)
                .await
                // Not-found maps to unauthorized so model existence is
                // never leaked.
                .map_err(Error::mask_not_found)
        }
        .await;
        results.push(match outcome {
            Ok(info) => ModelInfoResult {
                result: Some(info.into()),
                error: None,
            },
            Err(err) => ModelInfoResult {
                result: None,
                error: Some(map_error(&err)),
            },
        });
    }
    encode_result(ModelInfoResults { results })
}

#[derive(Debug, Default, Serialize)]
pub struct ModelStatusResults {
    pub results: Vec<ModelStatusResult>,
}

#[derive(Debug, Default, Serialize)]
pub struct ModelStatusResult {
    #[serde(rename = "model-tag", skip_serializing_if = "String::is_empty")]
    pub model_tag: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub life: String,
    #[serde(rename = "owner-tag", skip_serializing_if = "String::is_empty")]
    pub owner_tag: String,
    #[serde(rename = "hosted-machine-count")]
    pub hosted_machine_count: u64,
    #[serde(rename = "application-count")]
    pub application_count: u64,
    #[serde(rename = "unit-count")]
    pub unit_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

async fn model_status(session: Arc<Session>, params: serde_json::Value) -> Result<serde_json::Value> {
    let identity = session.require_identity().await?;
    let args: Entities = decode_params(params)?;
    let mut results = Vec::with_capacity(args.entities.len());
    for entity in args.entities {
        let outcome = async {
            let uuid = parse_model_tag(&entity.tag)?;
            session
                .manager()
                .model(&identity, &uuid, Access::Read)
                .await
                .map_err(Error::mask_not_found)
        }
        .await;
        results.push(match outcome {
            Ok(model) => ModelStatusResult {
                model_tag: model_tag(&model.uuid),
                life: model.life.to_string(),
                owner_tag: user_tag(&model.path.user),
                hosted_machine_count: model.counts.machines,
                application_count: model.counts.applications,
                unit_count: model.counts.units,
                error: None,
            },
            Err(err) => ModelStatusResult {
                error: Some(map_error(&err)),
                ..Default::default()
            },
        });
    }
    encode_result(ModelStatusResults { results })
}

#[derive(Debug, Default, Deserialize)]
pub struct ModifyModelAccessRequest {
    #[serde(default)]
    pub changes: Vec<ModifyModelAccess>,
}

#[derive(Debug, Deserialize)]
pub struct ModifyModelAccess {
    #[serde(rename = "user-tag")]
    pub user_tag: String,
    pub action: String,
    pub access: String,
    #[serde(rename = "model-tag")]
    pub model_tag: String,
}

async fn modify_model_access(
    session: Arc<Session>,
    params: serde_json::Value,
) -> Result<serde_json::Value> {
    let identity = session.require_identity().await?;
    let args: ModifyModelAccessRequest = decode_params(params)?;
    let mut results = Vec::with_capacity(args.changes.len());
    for change in args.changes {
        let outcome = async {
            let uuid = parse_model_tag(&change.model_tag)?;
            let target = parse_user_tag(&change.user_tag)?;
            match change.action.as_str() {
                "grant" => {
                    session
                        .manager()
                        .grant_model(&identity, &uuid, &target, &change.access)
                        .await
                }
                "revoke" => {
                    session
                        .manager()
                        .revoke_model(&identity, &uuid, &target, &change.access)
                        .await
                }
                action => Err(Error::BadRequest(format!("invalid action {action:?}"))),
            }
        }
        .await
        .map_err(Error::mask_not_found);
        results.push(ErrorResult {
            error: outcome.err().as_ref().map(map_error),
        });
    }
    encode_result(ErrorResults { results })
}

#[derive(Debug, Default, Deserialize)]
pub struct DumpModelRequest {
    #[serde(default)]
    pub entities: Vec<super::cloud::Entity>,
    #[serde(default)]
    pub simplified: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct StringResults {
    pub results: Vec<StringResult>,
}

#[derive(Debug, Default, Serialize)]
pub struct StringResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Debug, Default, Serialize)]
pub struct MapResults {
    pub results: Vec<MapResult>,
}

#[derive(Debug, Default, Serialize)]
pub struct MapResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// Fetches a model the caller administers and runs `dump` against its
/// controller. The dump is passed back without modification.
async fn dump_from_controller<T>(
    session: &Arc<Session>,
    tag: &str,
    dump: impl FnOnce(
        Arc<dyn crate::api::ControllerApi>,
        String,
    ) -> futures::future::BoxFuture<'static, Result<T>>,
) -> Result<T> {
    let identity = session.require_identity().await?;
    let uuid = parse_model_tag(tag)?;
    let model = session
        .manager()
        .model(&identity, &uuid, Access::Admin)
        .await
        .map_err(Error::mask_not_found)?;
    let conn = session.manager().open_api(&model.controller_path).await?;
    let result = dump(Arc::clone(conn.api()), model.uuid.clone()).await;
    conn.close().await;
    result
}

/// DumpModels for v3 onwards, returning the serialised dump.
async fn dump_models(session: Arc<Session>, params: serde_json::Value) -> Result<serde_json::Value> {
    let args: DumpModelRequest = decode_params(params)?;
    let mut results = Vec::with_capacity(args.entities.len());
    for entity in args.entities {
        let simplified = args.simplified;
        let outcome = dump_from_controller(&session, &entity.tag, move |api, uuid| {
            Box::pin(async move { api.dump_model(&uuid, simplified).await })
        })
        .await;
        results.push(match outcome {
            Ok(result) => StringResult {
                result: Some(result),
                error: None,
            },
            Err(err) => StringResult {
                result: None,
                error: Some(map_error(&err)),
            },
        });
    }
    encode_result(StringResults { results })
}

/// DumpModels for v2, which returned the dump as a structured map.
async fn dump_models_db_map(
    session: Arc<Session>,
    params: serde_json::Value,
) -> Result<serde_json::Value> {
    dump_models_db(session, params).await
}

async fn dump_models_db(
    session: Arc<Session>,
    params: serde_json::Value,
) -> Result<serde_json::Value> {
    let args: Entities = decode_params(params)?;
    let mut results = Vec::with_capacity(args.entities.len());
    for entity in args.entities {
        let outcome = dump_from_controller(&session, &entity.tag, |api, uuid| {
            Box::pin(async move { api.dump_model_db(&uuid).await })
        })
        .await;
        results.push(match outcome {
            Ok(result) => MapResult {
                result: Some(result),
                error: None,
            },
            Err(err) => MapResult {
                result: None,
                error: Some(map_error(&err)),
            },
        });
    }
    encode_result(MapResults { results })
}

#[derive(Debug, Default, Deserialize)]
pub struct ChangeModelCredentialsParams {
    #[serde(rename = "model-credentials", default)]
    pub models: Vec<ChangeModelCredentialParams>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeModelCredentialParams {
    #[serde(rename = "model-tag")]
    pub model_tag: String,
    #[serde(rename = "cloud-credential-tag")]
    pub cloud_credential_tag: String,
}

async fn change_model_credential(
    session: Arc<Session>,
    params: serde_json::Value,
) -> Result<serde_json::Value> {
    let identity = session.require_identity().await?;
    let args: ChangeModelCredentialsParams = decode_params(params)?;
    let mut results = Vec::with_capacity(args.models.len());
    for change in args.models {
        let outcome = async {
            let uuid = parse_model_tag(&change.model_tag)?;
            let cred = parse_cloud_credential_tag(&change.cloud_credential_tag)?;
            session
                .manager()
                .change_model_credential(&identity, &uuid, &cred)
                .await
        }
        .await
        .map_err(Error::mask_not_found);
        results.push(ErrorResult {
            error: outcome.err().as_ref().map(map_error),
        });
    }
    encode_result(ErrorResults { results })
}
