//! Service wiring.
//!
//! # Purpose
//! Builds the component graph (store, connection cache, lease manager,
//! monitor supervisor, orchestrator, facade registry, JWKS rotator) from a
//! configuration and a set of capability implementations, and runs the
//! background workers. Keeping composition here keeps `main` small and
//! testable.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::api::{ControllerApi, Dialer, ModelSummary};
use crate::apiconn::ConnectionCache;
use crate::auth::{IdentityResolver, NoGroups};
use crate::clock::{Clock, WallClock};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::jwks::{JwksRotator, JwksStore, MemoryJwksStore};
use crate::lease::LeaseManager;
use crate::manager::{CredentialRefresher, Manager, RandomChooser};
use crate::monitor::Monitor;
use crate::rpc::{build_registry, MacaroonVerifier, Registry, Session};
use crate::store::memory::MemoryDatabase;
use crate::store::{ControllerDoc, Database};

/// How often the supervisor polls the store for new controllers.
const CONTROLLER_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// How often the JWKS rotator is prodded.
const JWKS_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Capability implementations injected into the service.
pub struct Dependencies {
    pub db: Arc<dyn Database>,
    pub dialer: Arc<dyn Dialer>,
    pub verifier: Arc<dyn MacaroonVerifier>,
    pub resolver: Arc<dyn IdentityResolver>,
    pub jwks_store: Arc<dyn JwksStore>,
    pub clock: Arc<dyn Clock>,
}

impl Dependencies {
    /// Standalone wiring: in-memory store and secret store, no group
    /// resolution, and stand-ins for the controller transport and the
    /// macaroon bakery. Useful for development and tests; production
    /// deployments replace the stand-ins with the real integrations.
    pub fn standalone() -> Self {
        Self {
            db: Arc::new(MemoryDatabase::new()),
            dialer: Arc::new(UnroutableDialer),
            verifier: Arc::new(DenyAllMacaroons),
            resolver: Arc::new(NoGroups),
            jwks_store: Arc::new(MemoryJwksStore::new()),
            clock: Arc::new(WallClock),
        }
    }
}

/// Dialer stand-in used when no controller transport is configured.
/// Every dial fails, so monitors mark controllers unavailable and retry.
struct UnroutableDialer;

#[async_trait]
impl Dialer for UnroutableDialer {
    async fn dial(&self, ctl: &ControllerDoc) -> Result<Arc<dyn ControllerApi>> {
        Err(Error::ApiConnection(format!(
            "no controller transport configured, cannot dial {:?}",
            ctl.path.to_string()
        )))
    }
}

/// Macaroon stand-in used when no bakery is configured: every login
/// receives a discharge-required response it can never satisfy.
struct DenyAllMacaroons;

#[async_trait]
impl MacaroonVerifier for DenyAllMacaroons {
    async fn verify(&self, _macaroons: &[String]) -> Result<BTreeMap<String, String>> {
        Err(Error::Unauthorized(
            "macaroon discharge required".to_string(),
        ))
    }

    async fn mint(&self) -> Result<String> {
        Ok(uuid::Uuid::new_v4().to_string())
    }
}

/// The assembled service.
pub struct Jimm {
    config: Config,
    deps_clock: Arc<dyn Clock>,
    verifier: Arc<dyn MacaroonVerifier>,
    resolver: Arc<dyn IdentityResolver>,
    jwks_store: Arc<dyn JwksStore>,
    pub manager: Arc<Manager>,
    pub registry: Arc<Registry>,
    pub hub: Arc<jimm_hub::Hub<ModelSummary>>,
    monitor: Monitor,
}

impl Jimm {
    pub fn new(config: Config, deps: Dependencies) -> Self {
        let hub: Arc<jimm_hub::Hub<ModelSummary>> = Arc::new(jimm_hub::Hub::new());
        let cache = ConnectionCache::new(
            Arc::clone(&deps.db),
            Arc::clone(&deps.dialer),
            Arc::clone(&deps.clock),
            Some(Arc::new(CredentialRefresher::new(Arc::clone(&deps.db)))),
        );
        let leases = Arc::new(LeaseManager::new(
            Arc::clone(&deps.db),
            Arc::clone(&deps.clock),
            config.lease_duration,
        ));
        let manager = Arc::new(Manager::new(
            Arc::clone(&deps.db),
            cache.clone(),
            Arc::clone(&deps.clock),
            Arc::new(RandomChooser),
            config.controller_admin_group.clone(),
            config.controller_uuid.clone(),
            config.controller_uuid_masking,
        ));
        // Each instance owns a distinct lease identity.
        let owner = format!("jimm-{}", uuid::Uuid::new_v4());
        let monitor = Monitor::new(
            Arc::clone(&deps.db),
            cache,
            leases,
            Arc::clone(&deps.clock),
            Arc::clone(&hub),
            owner,
            CONTROLLER_POLL_INTERVAL,
            config.api_connect_retry,
        );
        Self {
            config,
            deps_clock: deps.clock,
            verifier: deps.verifier,
            resolver: deps.resolver,
            jwks_store: deps.jwks_store,
            manager,
            registry: Arc::new(build_registry()),
            hub,
            monitor,
        }
    }

    /// Creates the per-connection state the transport layer drives.
    pub fn new_session(&self) -> Arc<Session> {
        Session::new(
            Arc::clone(&self.manager),
            Arc::clone(&self.verifier),
            Arc::clone(&self.resolver),
            Arc::clone(&self.registry),
            Arc::clone(&self.deps_clock),
            self.config.websocket_ping_timeout,
        )
    }

    /// Runs the background workers until `shutdown` fires: the controller
    /// monitor supervisor and the JWKS rotator. Every worker is joined
    /// before this returns.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let monitor_task = {
            let rx = shutdown.clone();
            let monitor = self.monitor;
            tokio::spawn(async move { monitor.run(rx).await })
        };

        let (jwks_tx, jwks_rx) = mpsc::channel(1);
        let rotator = JwksRotator::new(
            Arc::clone(&self.jwks_store),
            Arc::clone(&self.deps_clock),
        );
        let rotator_task = rotator.start(jwks_rx, self.deps_clock.now() + JWKS_CHECK_INTERVAL);
        let ticker = {
            let clock = Arc::clone(&self.deps_clock);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                // Prod once at startup so a missing JWKS is created
                // immediately, then on the regular check interval.
                loop {
                    if jwks_tx.send(()).await.is_err() {
                        return;
                    }
                    tokio::select! {
                        _ = clock.sleep(JWKS_CHECK_INTERVAL) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            })
        };

        let _ = shutdown.changed().await;
        let monitor_result = monitor_task
            .await
            .map_err(|err| Error::Unexpected(anyhow::anyhow!("monitor task failed: {err}")))?;
        let _ = ticker.await;
        let _ = rotator_task.await;
        monitor_result
    }
}
