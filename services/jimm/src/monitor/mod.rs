//! Controller monitoring.
//!
//! # Purpose
//! The supervisor polls the store for controllers, acquires the monitor
//! lease for any controller not already monitored by this instance, and
//! runs one [`controller`] worker per acquired lease. A runner keyed by
//! controller path guarantees at most one live worker per controller and
//! that every worker is awaited at shutdown.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::ModelSummary;
use crate::apiconn::ConnectionCache;
use crate::clock::Clock;
use crate::error::{Kind, Result};
use crate::lease::LeaseManager;
use crate::store::{ControllerDoc, Database};

mod controller;

use controller::{run_monitor, MonitorParams};

/// Keeps at most one live task per name and joins all of them on
/// shutdown.
struct Runner {
    tasks: HashMap<String, (watch::Sender<bool>, JoinHandle<()>)>,
}

impl Runner {
    fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Whether a task with this name is still running. Finished tasks are
    /// pruned so their slot can be reused.
    fn is_running(&mut self, name: &str) -> bool {
        if let Some((_, handle)) = self.tasks.get(name) {
            if handle.is_finished() {
                self.tasks.remove(name);
                return false;
            }
            return true;
        }
        false
    }

    fn run<F>(&mut self, name: &str, f: impl FnOnce(watch::Receiver<bool>) -> F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(f(rx));
        self.tasks.insert(name.to_string(), (tx, handle));
    }

    /// Cancels every task and waits for all of them.
    async fn shutdown(mut self) {
        for (tx, _) in self.tasks.values() {
            let _ = tx.send(true);
        }
        for (_, (_, handle)) in self.tasks.drain() {
            let _ = handle.await;
        }
    }
}

/// The monitor supervisor. One per JIMM instance.
pub struct Monitor {
    db: Arc<dyn Database>,
    cache: ConnectionCache,
    leases: Arc<LeaseManager>,
    clock: Arc<dyn Clock>,
    hub: Arc<jimm_hub::Hub<ModelSummary>>,
    /// This instance's identity, used as the lease owner.
    owner: String,
    poll_interval: Duration,
    api_connect_retry: Duration,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<dyn Database>,
        cache: ConnectionCache,
        leases: Arc<LeaseManager>,
        clock: Arc<dyn Clock>,
        hub: Arc<jimm_hub::Hub<ModelSummary>>,
        owner: impl Into<String>,
        poll_interval: Duration,
        api_connect_retry: Duration,
    ) -> Self {
        Self {
            db,
            cache,
            leases,
            clock,
            hub,
            owner: owner.into(),
            poll_interval,
            api_connect_retry,
        }
    }

    /// Runs until `shutdown` fires, spawning a monitor for every
    /// controller whose lease this instance can claim. Transient store
    /// errors are retried on the next poll tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut runner = Runner::new();
        loop {
            match self.db.list_controllers().await {
                Ok(controllers) => {
                    for ctl in controllers {
                        self.maybe_start_monitor(&mut runner, ctl).await;
                    }
                }
                Err(err) if err.kind() == Kind::DatabaseLocked => {
                    tracing::warn!(error = %err, "temporary error polling for controllers");
                }
                Err(err) => {
                    runner.shutdown().await;
                    return Err(err);
                }
            }
            tokio::select! {
                _ = self.clock.sleep(self.poll_interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        runner.shutdown().await;
        Ok(())
    }

    async fn maybe_start_monitor(&self, runner: &mut Runner, ctl: ControllerDoc) {
        let name = ctl.path.to_string();
        if runner.is_running(&name) {
            return;
        }
        if let Some(lease) = &ctl.monitor_lease {
            // A live lease held by another instance is respected; only our
            // own stale lease or an expired one may be (re)claimed.
            if lease.owner != self.owner && lease.expiry > self.clock.now() {
                return;
            }
        }
        let (old_expiry, old_owner) = match &ctl.monitor_lease {
            Some(lease) => (Some(lease.expiry), Some(lease.owner.clone())),
            None => (None, None),
        };
        let acquired = self
            .leases
            .acquire(
                &ctl.path,
                old_expiry,
                old_owner.as_deref(),
                Some(&self.owner),
            )
            .await;
        let expiry = match acquired {
            Ok(Some(expiry)) => expiry,
            Ok(None) => return,
            Err(err) if err.kind() == Kind::LeaseUnavailable => {
                // Another instance monitors this controller.
                tracing::debug!(controller = %ctl.path, "monitor lease held elsewhere");
                return;
            }
            Err(err) if err.kind() == Kind::NotFound => return,
            Err(err) => {
                tracing::warn!(controller = %ctl.path, error = %err, "cannot acquire monitor lease");
                return;
            }
        };
        let params = MonitorParams {
            db: Arc::clone(&self.db),
            cache: self.cache.clone(),
            leases: Arc::clone(&self.leases),
            clock: Arc::clone(&self.clock),
            hub: Arc::clone(&self.hub),
            path: ctl.path.clone(),
            owner: self.owner.clone(),
            api_connect_retry: self.api_connect_retry,
        };
        let path = ctl.path.clone();
        runner.run(&name, move |cancel| async move {
            tracing::info!(controller = %path, "starting controller monitor");
            match run_monitor(params, expiry, cancel).await {
                Ok(()) => tracing::info!(controller = %path, "controller monitor stopped"),
                Err(err) => match err.kind() {
                    // Lease loss and controller removal end the monitor
                    // quietly; the slot returns to the supervisor.
                    Kind::LeaseUnavailable | Kind::ControllerRemoved => {
                        tracing::info!(controller = %path, error = %err, "controller monitor stopped")
                    }
                    _ => {
                        tracing::error!(controller = %path, error = %err, "controller monitor failed")
                    }
                },
            }
        });
    }
}
