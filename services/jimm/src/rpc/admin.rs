//! Admin facade (v3): macaroon login and redirect information.
use serde::{Deserialize, Serialize};

use super::{decode_params, encode_result, method, Registry, Session};
use crate::auth::Identity;
use crate::error::{Error, Result};
use crate::params::user_tag;
use std::sync::Arc;

pub fn register(registry: &mut Registry) {
    registry.add_method("Admin", 3, "Login", method(login));
    registry.add_method("Admin", 3, "RedirectInfo", method(redirect_info));
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub macaroons: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LoginResult {
    #[serde(rename = "discharge-required", skip_serializing_if = "Option::is_none")]
    pub discharge_required: Option<String>,
    #[serde(
        rename = "discharge-required-error",
        skip_serializing_if = "Option::is_none"
    )]
    pub discharge_required_reason: Option<String>,
    #[serde(rename = "user-info", skip_serializing_if = "Option::is_none")]
    pub user_info: Option<AuthUserInfo>,
    #[serde(default)]
    pub facades: Vec<super::FacadeVersions>,
    #[serde(rename = "server-version")]
    pub server_version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthUserInfo {
    #[serde(rename = "display-name")]
    pub display_name: String,
    pub identity: String,
}

/// Macaroon-only authentication. An unverifiable macaroon produces a
/// discharge-required result rather than an error; local users are
/// rejected outright.
async fn login(session: Arc<Session>, params: serde_json::Value) -> Result<serde_json::Value> {
    let request: LoginRequest = decode_params(params)?;
    let attrs = match session.verifier().verify(&request.macaroons).await {
        Ok(attrs) => attrs,
        Err(err) => {
            let macaroon = session.verifier().mint().await?;
            return encode_result(LoginResult {
                discharge_required: Some(macaroon),
                discharge_required_reason: Some(err.to_string()),
                server_version: "2.0.0".to_string(),
                ..Default::default()
            });
        }
    };
    let username = attrs
        .get("username")
        .cloned()
        .ok_or_else(|| Error::Unauthorized("no username in macaroon".to_string()))?;
    if username.ends_with("@local") {
        return Err(Error::Unauthorized(format!(
            "unauthorized: local user {username:?}"
        )));
    }
    let username = username
        .strip_suffix("@external")
        .unwrap_or(&username)
        .to_string();
    let identity = Identity::resolve(username.clone(), session.resolver().as_ref()).await?;
    session.set_identity(identity).await;

    encode_result(LoginResult {
        user_info: Some(AuthUserInfo {
            display_name: username.clone(),
            identity: user_tag(&username),
        }),
        facades: session.registry().facade_versions(),
        server_version: "2.0.0".to_string(),
        ..Default::default()
    })
}

/// The gateway aggregates every model behind one endpoint, so clients are
/// never redirected.
async fn redirect_info(
    _session: Arc<Session>,
    _params: serde_json::Value,
) -> Result<serde_json::Value> {
    Err(Error::NotFound("not redirected".to_string()))
}
