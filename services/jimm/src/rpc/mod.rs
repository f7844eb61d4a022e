//! Gateway RPC surface.
//!
//! # Purpose
//! An explicit registry mapping `(facade, version, method)` tuples to
//! handlers, populated at startup by per-facade initializers. The
//! WebSocket transport itself is an external collaborator; it hands each
//! decoded request to [`Session::call`] and forwards the JSON result.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::auth::{Identity, IdentityResolver};
use crate::clock::Clock;
use crate::error::{Error, Kind, Result};
use crate::manager::Manager;

pub mod admin;
pub mod cloud;
pub mod modelmanager;
pub mod pinger;

/// Upper bound on one gateway request, covering any remote calls it makes.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Verifies macaroon bearer credentials and mints fresh ones for
/// discharge-required responses. The real implementation lives in the
/// macaroon bakery collaborator.
#[async_trait]
pub trait MacaroonVerifier: Send + Sync + 'static {
    /// Checks the presented macaroons, returning the asserted attributes
    /// (at least `username`) on success.
    async fn verify(&self, macaroons: &[String]) -> Result<BTreeMap<String, String>>;

    /// Mints a macaroon the client can discharge and present again.
    async fn mint(&self) -> Result<String>;
}

/// Error shape sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub code: String,
}

/// Maps internal errors to wire errors, preserving the message verbatim.
pub fn map_error(err: &Error) -> WireError {
    let code = match err.kind() {
        Kind::NotFound => "not found",
        Kind::Unauthorized => "unauthorized access",
        Kind::BadRequest => "bad request",
        Kind::AlreadyExists => "already exists",
        Kind::NotSupported => "not supported",
        _ => "",
    };
    WireError {
        message: err.to_string(),
        code: code.to_string(),
    }
}

fn call_not_implemented(root: &str, version: u32, method: &str) -> WireError {
    WireError {
        message: format!(
            "no such request - method {root}({version}).{method} is not implemented"
        ),
        code: "not implemented".to_string(),
    }
}

/// One facade name with its supported versions, reported at login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacadeVersions {
    pub name: String,
    pub versions: Vec<u32>,
}

type Handler = Arc<
    dyn Fn(
            Arc<Session>,
            serde_json::Value,
        ) -> futures::future::BoxFuture<'static, Result<serde_json::Value>>
        + Send
        + Sync,
>;

/// Wraps an async method into a registrable handler.
fn method<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<Session>, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    Arc::new(move |session, params| Box::pin(f(session, params)))
}

/// The `(facade, version, method)` dispatch table.
#[derive(Default)]
pub struct Registry {
    methods: HashMap<(String, u32, String), Handler>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_method(&mut self, root: &str, version: u32, name: &str, handler: Handler) {
        self.methods
            .insert((root.to_string(), version, name.to_string()), handler);
    }

    fn resolve(&self, root: &str, version: u32, name: &str) -> Option<Handler> {
        self.methods
            .get(&(root.to_string(), version, name.to_string()))
            .cloned()
    }

    /// The facade version table, sorted by name for stable login results.
    pub fn facade_versions(&self) -> Vec<FacadeVersions> {
        let mut versions: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for (root, version, _) in self.methods.keys() {
            let entry = versions.entry(root.clone()).or_default();
            if !entry.contains(version) {
                entry.push(*version);
            }
        }
        versions
            .into_iter()
            .map(|(name, mut versions)| {
                versions.sort_unstable();
                FacadeVersions { name, versions }
            })
            .collect()
    }
}

/// Builds the full registry: Admin v3, Cloud v1, ModelManager v2-v5 and
/// Pinger v1.
pub fn build_registry() -> Registry {
    let mut registry = Registry::new();
    admin::register(&mut registry);
    cloud::register(&mut registry);
    modelmanager::register(&mut registry);
    pinger::register(&mut registry);
    registry
}

/// Drops a connection whose client stops pinging.
pub struct HeartMonitor {
    clock: Arc<dyn Clock>,
    timeout: Duration,
    deadline: StdMutex<SystemTime>,
}

impl HeartMonitor {
    pub fn new(clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        let deadline = clock.now() + timeout;
        Self {
            clock,
            timeout,
            deadline: StdMutex::new(deadline),
        }
    }

    /// Signals that the connection is still alive.
    pub fn heartbeat(&self) {
        let mut deadline = self.deadline.lock().expect("deadline lock");
        *deadline = self.clock.now() + self.timeout;
    }

    /// Completes once the heartbeat deadline has passed.
    pub async fn dead(&self) {
        loop {
            let deadline = *self.deadline.lock().expect("deadline lock");
            let now = self.clock.now();
            match deadline.duration_since(now) {
                Ok(remaining) if !remaining.is_zero() => self.clock.sleep(remaining).await,
                _ => return,
            }
        }
    }
}

/// Per-connection state: the dispatcher plus the authenticated identity.
pub struct Session {
    manager: Arc<Manager>,
    verifier: Arc<dyn MacaroonVerifier>,
    resolver: Arc<dyn IdentityResolver>,
    registry: Arc<Registry>,
    heart: HeartMonitor,
    identity: RwLock<Option<Identity>>,
}

impl Session {
    pub fn new(
        manager: Arc<Manager>,
        verifier: Arc<dyn MacaroonVerifier>,
        resolver: Arc<dyn IdentityResolver>,
        registry: Arc<Registry>,
        clock: Arc<dyn Clock>,
        ping_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            verifier,
            resolver,
            registry,
            heart: HeartMonitor::new(clock, ping_timeout),
            identity: RwLock::new(None),
        })
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn heart(&self) -> &HeartMonitor {
        &self.heart
    }

    pub async fn identity(&self) -> Option<Identity> {
        self.identity.read().await.clone()
    }

    /// The authenticated identity, or `Unauthorized` before login.
    pub async fn require_identity(&self) -> Result<Identity> {
        self.identity
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Unauthorized("not logged in".to_string()))
    }

    pub(crate) async fn set_identity(&self, identity: Identity) {
        *self.identity.write().await = Some(identity);
    }

    pub(crate) fn verifier(&self) -> &Arc<dyn MacaroonVerifier> {
        &self.verifier
    }

    pub(crate) fn resolver(&self) -> &Arc<dyn IdentityResolver> {
        &self.resolver
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Dispatches one request. Wire errors carry the client-visible
    /// message and code.
    pub async fn call(
        self: &Arc<Self>,
        root: &str,
        version: u32,
        method_name: &str,
        params: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, WireError> {
        if root == "Admin" && version < 3 {
            return Err(WireError {
                message: "JAAS does not support login from old clients".to_string(),
                code: "not supported".to_string(),
            });
        }
        // Everything except login requires an authenticated connection.
        if self.identity.read().await.is_none() && root != "Admin" {
            return Err(call_not_implemented(root, version, method_name));
        }
        let handler = self
            .registry
            .resolve(root, version, method_name)
            .ok_or_else(|| call_not_implemented(root, version, method_name))?;
        match tokio::time::timeout(REQUEST_TIMEOUT, handler(Arc::clone(self), params)).await {
            Ok(result) => result.map_err(|err| map_error(&err)),
            Err(_) => Err(WireError {
                message: format!("{root}({version}).{method_name}: request timed out"),
                code: "timeout".to_string(),
            }),
        }
    }
}

/// Decodes handler parameters, mapping malformed payloads to bad-request.
pub(crate) fn decode_params<T: serde::de::DeserializeOwned>(params: serde_json::Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|err| Error::BadRequest(format!("cannot parse request parameters: {err}")))
}

pub(crate) fn encode_result<T: Serialize>(value: T) -> Result<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|err| Error::Unexpected(anyhow::anyhow!("cannot encode result: {err}")))
}
