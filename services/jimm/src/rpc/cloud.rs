//! Cloud facade (v1): cloud metadata and credential management.
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{decode_params, encode_result, map_error, method, Registry, Session, WireError};
use crate::error::{Error, Result};
use crate::params::{
    cloud_tag, parse_cloud_credential_tag, parse_cloud_tag, parse_user_tag, CredentialPath,
};
use crate::store::CredentialDoc;

pub fn register(registry: &mut Registry) {
    registry.add_method("Cloud", 1, "Cloud", method(cloud));
    registry.add_method("Cloud", 1, "Clouds", method(clouds));
    registry.add_method("Cloud", 1, "Credentials", method(credentials));
    registry.add_method("Cloud", 1, "UpdateCredentials", method(update_credentials));
    registry.add_method("Cloud", 1, "RevokeCredential", method(revoke_credential));
}

#[derive(Debug, Default, Deserialize)]
pub struct Entities {
    #[serde(default)]
    pub entities: Vec<Entity>,
}

#[derive(Debug, Deserialize)]
pub struct Entity {
    pub tag: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CloudRegionWire {
    pub name: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CloudInfoWire {
    #[serde(rename = "type")]
    pub provider_type: String,
    #[serde(rename = "auth-types", default)]
    pub auth_types: Vec<String>,
    #[serde(default)]
    pub regions: Vec<CloudRegionWire>,
}

#[derive(Debug, Default, Serialize)]
pub struct CloudResults {
    pub results: Vec<CloudResult>,
}

#[derive(Debug, Default, Serialize)]
pub struct CloudResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud: Option<CloudInfoWire>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// Aggregates cloud metadata from every readable controller hosting the
/// cloud. An unknown cloud answers not-found.
async fn cloud_info(session: &Arc<Session>, name: &str) -> Result<CloudInfoWire> {
    let identity = session.require_identity().await?;
    let mut info = CloudInfoWire::default();
    for ctl in session
        .manager()
        .controllers_for(&identity, None, None)
        .await?
    {
        if ctl.cloud.name != name {
            continue;
        }
        info.provider_type = ctl.cloud.provider_type.clone();
        for auth_type in &ctl.cloud.auth_types {
            if !info.auth_types.contains(auth_type) {
                info.auth_types.push(auth_type.clone());
            }
        }
        for region in &ctl.cloud.regions {
            if !info.regions.iter().any(|r| &r.name == region) {
                info.regions.push(CloudRegionWire {
                    name: region.clone(),
                });
            }
        }
    }
    if info.provider_type.is_empty() {
        return Err(Error::NotFound(format!("cloud {name:?} not available")));
    }
    Ok(info)
}

async fn cloud(session: Arc<Session>, params: serde_json::Value) -> Result<serde_json::Value> {
    let args: Entities = decode_params(params)?;
    let mut results = Vec::with_capacity(args.entities.len());
    for entity in args.entities {
        let outcome = async {
            let name = parse_cloud_tag(&entity.tag)?;
            cloud_info(&session, &name).await
        }
        .await;
        results.push(match outcome {
            Ok(cloud) => CloudResult {
                cloud: Some(cloud),
                error: None,
            },
            Err(err) => CloudResult {
                cloud: None,
                error: Some(map_error(&err)),
            },
        });
    }
    encode_result(CloudResults { results })
}

#[derive(Debug, Default, Serialize)]
pub struct CloudsResult {
    pub clouds: BTreeMap<String, CloudInfoWire>,
}

async fn clouds(session: Arc<Session>, _params: serde_json::Value) -> Result<serde_json::Value> {
    let identity = session.require_identity().await?;
    let mut names = Vec::new();
    for ctl in session
        .manager()
        .controllers_for(&identity, None, None)
        .await?
    {
        if !names.contains(&ctl.cloud.name) {
            names.push(ctl.cloud.name.clone());
        }
    }
    let mut clouds = BTreeMap::new();
    for name in names {
        let info = cloud_info(&session, &name).await?;
        clouds.insert(cloud_tag(&name), info);
    }
    encode_result(CloudsResult { clouds })
}

#[derive(Debug, Default, Deserialize)]
pub struct UserClouds {
    #[serde(rename = "user-clouds", default)]
    pub user_clouds: Vec<UserCloud>,
}

#[derive(Debug, Deserialize)]
pub struct UserCloud {
    #[serde(rename = "user-tag")]
    pub user_tag: String,
    #[serde(rename = "cloud-tag")]
    pub cloud_tag: String,
}

#[derive(Debug, Default, Serialize)]
pub struct CloudCredentialsResults {
    pub results: Vec<CloudCredentialsResult>,
}

#[derive(Debug, Default, Serialize)]
pub struct CloudCredentialsResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<BTreeMap<String, CloudCredentialWire>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CloudCredentialWire {
    #[serde(rename = "auth-type")]
    pub auth_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

/// Lists the credentials a user holds for one cloud. Callers may only
/// enumerate their own credentials.
async fn credentials(session: Arc<Session>, params: serde_json::Value) -> Result<serde_json::Value> {
    let identity = session.require_identity().await?;
    let args: UserClouds = decode_params(params)?;
    let mut results = Vec::with_capacity(args.user_clouds.len());
    for entry in args.user_clouds {
        let outcome = async {
            let user = parse_user_tag(&entry.user_tag)?;
            if !identity.is(&user) {
                return Err(Error::Unauthorized("unauthorized".to_string()));
            }
            let cloud = parse_cloud_tag(&entry.cloud_tag)?;
            let mut credentials = BTreeMap::new();
            for cred in session
                .manager()
                .db()
                .credentials_for_user_cloud(&user, &cloud)
                .await?
            {
                credentials.insert(
                    cred.path.name.clone(),
                    CloudCredentialWire {
                        auth_type: cred.auth_type.clone(),
                        attributes: cred.attributes.clone(),
                    },
                );
            }
            Ok(credentials)
        }
        .await;
        results.push(match outcome {
            Ok(credentials) => CloudCredentialsResult {
                credentials: Some(credentials),
                error: None,
            },
            Err(err) => CloudCredentialsResult {
                credentials: None,
                error: Some(map_error(&err)),
            },
        });
    }
    encode_result(CloudCredentialsResults { results })
}

#[derive(Debug, Default, Deserialize)]
pub struct UsersCloudCredentials {
    #[serde(default)]
    pub users: Vec<UserCloudCredentials>,
}

#[derive(Debug, Deserialize)]
pub struct UserCloudCredentials {
    #[serde(rename = "user-tag")]
    pub user_tag: String,
    #[serde(rename = "cloud-tag")]
    pub cloud_tag: String,
    #[serde(default)]
    pub credentials: BTreeMap<String, CloudCredentialWire>,
}

#[derive(Debug, Default, Serialize)]
pub struct ErrorResults {
    pub results: Vec<ErrorResult>,
}

#[derive(Debug, Default, Serialize)]
pub struct ErrorResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

async fn update_credentials(
    session: Arc<Session>,
    params: serde_json::Value,
) -> Result<serde_json::Value> {
    let identity = session.require_identity().await?;
    let args: UsersCloudCredentials = decode_params(params)?;
    let mut results = Vec::with_capacity(args.users.len());
    for entry in args.users {
        let outcome = async {
            let user = parse_user_tag(&entry.user_tag)?;
            if !identity.is(&user) {
                return Err(Error::Unauthorized("unauthorized".to_string()));
            }
            let cloud = parse_cloud_tag(&entry.cloud_tag)?;
            for (name, cred) in entry.credentials {
                session
                    .manager()
                    .update_credential(
                        &identity,
                        &CredentialDoc {
                            path: CredentialPath::new(cloud.clone(), user.clone(), name),
                            auth_type: cred.auth_type,
                            attributes: cred.attributes,
                            revoked: false,
                            controllers: Default::default(),
                        },
                    )
                    .await?;
            }
            Ok(())
        }
        .await;
        results.push(ErrorResult {
            error: outcome.err().as_ref().map(map_error),
        });
    }
    encode_result(ErrorResults { results })
}

async fn revoke_credential(
    session: Arc<Session>,
    params: serde_json::Value,
) -> Result<serde_json::Value> {
    let identity = session.require_identity().await?;
    let args: Entities = decode_params(params)?;
    let mut results = Vec::with_capacity(args.entities.len());
    for entity in args.entities {
        let outcome = async {
            let path = parse_cloud_credential_tag(&entity.tag)?;
            // Revocation clears the stored attributes and pushes the
            // removal to every controller holding a copy.
            session
                .manager()
                .update_credential(
                    &identity,
                    &CredentialDoc {
                        path,
                        auth_type: String::new(),
                        attributes: BTreeMap::new(),
                        revoked: true,
                        controllers: Default::default(),
                    },
                )
                .await
        }
        .await;
        results.push(ErrorResult {
            error: outcome.err().as_ref().map(map_error),
        });
    }
    encode_result(ErrorResults { results })
}
