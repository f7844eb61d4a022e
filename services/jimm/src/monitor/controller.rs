//! Per-controller monitor worker.
//!
//! # Purpose
//! Holds the monitor lease for one controller and mirrors that controller's
//! state into the store: a lease loop renews exclusivity while a watcher
//! loop consumes the all-watcher delta stream, reduces it into aggregate
//! statistics and per-entity rows, and flushes updates after each batch.
//!
//! Both loops are rooted in one cancellation scope; the first terminal
//! error cancels the other loop, and shutdown attempts a best-effort lease
//! drop.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{oneshot, watch, Mutex};

use crate::api::{Delta, DeltaEntity, EntityId, ModelSummary};
use crate::apiconn::{Connection, ConnectionCache};
use crate::clock::Clock;
use crate::error::{Error, Kind, Result};
use crate::lease::LeaseManager;
use crate::params::{EntityPath, Life};
use crate::store::{
    ApplicationDoc, ControllerStats, Database, MachineDoc, ModelCounts, UnitDoc,
};

/// Maximum number of concurrent store updates a monitor may issue while
/// flushing one delta batch.
pub(super) const MAX_CONCURRENT_UPDATES: usize = 10;

pub(super) struct MonitorParams {
    pub db: Arc<dyn Database>,
    pub cache: ConnectionCache,
    pub leases: Arc<LeaseManager>,
    pub clock: Arc<dyn Clock>,
    pub hub: Arc<jimm_hub::Hub<ModelSummary>>,
    pub path: EntityPath,
    pub owner: String,
    pub api_connect_retry: Duration,
}

struct Shared {
    db: Arc<dyn Database>,
    cache: ConnectionCache,
    leases: Arc<LeaseManager>,
    clock: Arc<dyn Clock>,
    hub: Arc<jimm_hub::Hub<ModelSummary>>,
    path: EntityPath,
    owner: String,
    api_connect_retry: Duration,
    lease_expiry: Mutex<SystemTime>,
}

/// Runs a monitor until its lease is lost, the controller disappears, or
/// `shutdown` fires. Terminal lease loss and controller removal are
/// reported as errors so the supervisor can log them; shutdown returns Ok.
///
/// Three loops share one cancellation scope: the lease loop, the
/// all-watcher loop and the summary loop. The first to finish cancels the
/// others, and all are joined before returning.
pub(super) async fn run_monitor(
    params: MonitorParams,
    lease_expiry: SystemTime,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let shared = Arc::new(Shared {
        db: params.db,
        cache: params.cache,
        leases: params.leases,
        clock: params.clock,
        hub: params.hub,
        path: params.path,
        owner: params.owner,
        api_connect_retry: params.api_connect_retry,
        lease_expiry: Mutex::new(lease_expiry),
    });

    metrics::gauge!("jimm_monitors_running").increment(1.0);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut lease_task = {
        let shared = Arc::clone(&shared);
        let cancel = cancel_rx.clone();
        tokio::spawn(lease_loop(shared, cancel))
    };
    let mut watcher_task = {
        let shared = Arc::clone(&shared);
        let cancel = cancel_rx.clone();
        tokio::spawn(watcher_loop(shared, cancel))
    };
    let mut summary_task = {
        let shared = Arc::clone(&shared);
        tokio::spawn(summary_loop(shared, cancel_rx))
    };

    let mut shutdown = shutdown;
    let mut lease_done = None;
    let mut watcher_done = None;
    let mut summary_done = None;
    tokio::select! {
        _ = shutdown.changed() => {}
        result = &mut lease_task => lease_done = Some(flatten(result)),
        result = &mut watcher_task => watcher_done = Some(flatten(result)),
        result = &mut summary_task => summary_done = Some(flatten(result)),
    }
    let _ = cancel_tx.send(true);
    let lease = match lease_done {
        Some(result) => result,
        None => flatten(lease_task.await),
    };
    let watcher = match watcher_done {
        Some(result) => result,
        None => flatten(watcher_task.await),
    };
    let summary = match summary_done {
        Some(result) => result,
        None => flatten(summary_task.await),
    };

    metrics::gauge!("jimm_monitors_running").decrement(1.0);
    lease.and(watcher).and(summary)
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(err) => Err(Error::Unexpected(anyhow::anyhow!(
            "monitor task panicked: {err}"
        ))),
    }
}

/// Renews the lease at three quarters of the lease duration and drops it
/// on shutdown so another instance can take over promptly.
async fn lease_loop(shared: Arc<Shared>, mut cancel: watch::Receiver<bool>) -> Result<()> {
    loop {
        let expiry = *shared.lease_expiry.lock().await;
        let renew_at = expiry - shared.leases.duration() / 4;
        let sleep_for = renew_at
            .duration_since(shared.clock.now())
            .unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = shared.clock.sleep(sleep_for) => {}
            _ = cancel.changed() => {
                // Best-effort drop; the monitor might not restart here.
                let expiry = *shared.lease_expiry.lock().await;
                if let Err(err) = shared
                    .leases
                    .acquire(&shared.path, Some(expiry), Some(&shared.owner), None)
                    .await
                {
                    tracing::debug!(controller = %shared.path, error = %err, "cannot drop lease");
                }
                return Ok(());
            }
        }
        let expiry = *shared.lease_expiry.lock().await;
        match shared
            .leases
            .acquire(
                &shared.path,
                Some(expiry),
                Some(&shared.owner),
                Some(&shared.owner),
            )
            .await
        {
            Ok(Some(new_expiry)) => {
                tracing::debug!(controller = %shared.path, ?new_expiry, "lease renewed");
                *shared.lease_expiry.lock().await = new_expiry;
            }
            Ok(None) => {
                // A renewal never drops; treat as lost.
                return Err(Error::LeaseUnavailable(format!(
                    "controller {:?} monitor lease unavailable",
                    shared.path.to_string()
                )));
            }
            Err(err) => {
                tracing::info!(controller = %shared.path, error = %err, "cannot renew lease");
                return Err(monitoring_stopped(err, &shared.path));
            }
        }
    }
}

/// Maps store errors into the monitor's terminal error vocabulary.
fn monitoring_stopped(err: Error, path: &EntityPath) -> Error {
    match err.kind() {
        Kind::NotFound => Error::ControllerRemoved(format!(
            "controller {:?} has been removed",
            path.to_string()
        )),
        _ => err,
    }
}

/// Dials through the connection cache on a detached task so a cancelled
/// monitor cannot strand a dial in flight; an abandoned connection is
/// closed out of band.
fn spawn_dial(shared: &Arc<Shared>) -> oneshot::Receiver<Result<Connection>> {
    let (tx, rx) = oneshot::channel();
    let cache = shared.cache.clone();
    let path = shared.path.clone();
    tokio::spawn(async move {
        let result = cache.open(&path).await;
        if let Err(Ok(conn)) = tx.send(result) {
            conn.close().await;
        }
    });
    rx
}

async fn watcher_loop(shared: Arc<Shared>, mut cancel: watch::Receiver<bool>) -> Result<()> {
    loop {
        tracing::debug!(controller = %shared.path, "monitor dialing controller");
        let mut dial = spawn_dial(&shared);
        let dialed = tokio::select! {
            result = &mut dial => result,
            _ = cancel.changed() => return Ok(()),
        };
        match dialed {
            Ok(Ok(conn)) => {
                // The cache has already cleared the unavailability marker
                // and re-pushed pending credentials for this controller.
                match watch_session(&shared, &conn, &mut cancel).await {
                    Ok(()) => {
                        conn.close().await;
                        return Ok(());
                    }
                    Err(err) => {
                        tracing::info!(controller = %shared.path, error = %err, "watcher session ended");
                        // The connection is suspect; force the next dial to
                        // start from scratch.
                        conn.evict().await;
                    }
                }
            }
            Ok(Err(err)) => match err.kind() {
                Kind::ApiConnection => {
                    // The cache recorded the unavailability; retry after a
                    // while so we don't batter the network.
                    tracing::warn!(controller = %shared.path, error = %err, "cannot connect to controller");
                }
                Kind::NotFound => return Err(monitoring_stopped(err, &shared.path)),
                _ => return Err(err),
            },
            Err(_) => {
                return Err(Error::Unexpected(anyhow::anyhow!("dial task dropped")));
            }
        }
        tokio::select! {
            _ = shared.clock.sleep(shared.api_connect_retry) => {}
            _ = cancel.changed() => return Ok(()),
        }
    }
}

/// Summary-watcher variant. Exits quietly when the controller does not
/// advertise the summary watcher; otherwise it republishes summaries on
/// the hub until cancelled.
async fn summary_loop(shared: Arc<Shared>, mut cancel: watch::Receiver<bool>) -> Result<()> {
    loop {
        let mut dial = spawn_dial(&shared);
        let dialed = tokio::select! {
            result = &mut dial => result,
            _ = cancel.changed() => return Ok(()),
        };
        match dialed {
            Ok(Ok(conn)) => {
                if !conn.api().supports_model_summary_watcher() {
                    tracing::debug!(controller = %shared.path, "model summary watcher not supported");
                    conn.close().await;
                    return Ok(());
                }
                match summary_session(&shared, &conn, &mut cancel).await {
                    Ok(()) => {
                        conn.close().await;
                        return Ok(());
                    }
                    Err(err) if err.kind() == Kind::NotSupported => {
                        conn.close().await;
                        return Ok(());
                    }
                    Err(err) => {
                        tracing::info!(controller = %shared.path, error = %err, "summary watcher session ended");
                        conn.evict().await;
                    }
                }
            }
            // The main watcher loop owns unavailability handling and
            // terminal errors; this variant just waits and retries.
            Ok(Err(_)) => {}
            Err(_) => {
                return Err(Error::Unexpected(anyhow::anyhow!("dial task dropped")));
            }
        }
        tokio::select! {
            _ = shared.clock.sleep(shared.api_connect_retry) => {}
            _ = cancel.changed() => return Ok(()),
        }
    }
}

/// Deletes local rows for dying models the controller no longer knows,
/// so a crashed destroy cannot leave zombies behind.
async fn reconcile_dying_models(shared: &Shared, conn: &Connection) -> Result<()> {
    let models = shared.db.models_for_controller(&shared.path).await?;
    for model in models {
        if model.life != Life::Dying {
            continue;
        }
        match conn.api().model_info(&model.uuid).await {
            Ok(_) => {}
            Err(err) if err.kind() == Kind::NotFound => {
                tracing::info!(model = %model.path, "removing dying model absent from controller");
                shared.db.remove_model(&model.path).await?;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

async fn watch_session(
    shared: &Arc<Shared>,
    conn: &Connection,
    cancel: &mut watch::Receiver<bool>,
) -> Result<()> {
    reconcile_dying_models(shared, conn).await?;

    let mut watcher = conn.api().watch_all_models().await?;
    let mut reducer = DeltaReducer::new();
    loop {
        let batch = tokio::select! {
            result = watcher.next() => result?,
            _ = cancel.changed() => {
                let _ = watcher.stop().await;
                return Ok(());
            }
        };
        metrics::counter!("jimm_monitor_deltas_total").increment(batch.len() as u64);
        for delta in batch {
            reducer.add_delta(delta);
        }
        tracing::debug!(controller = %shared.path, "all deltas processed");
        reducer.flush(shared).await?;
    }
}

async fn summary_session(
    shared: &Arc<Shared>,
    conn: &Connection,
    cancel: &mut watch::Receiver<bool>,
) -> Result<()> {
    if !conn.api().supports_model_summary_watcher() {
        return Err(Error::NotSupported(format!(
            "controller {:?} does not support the model summary watcher",
            shared.path.to_string()
        )));
    }
    let mut watcher = conn.api().watch_all_model_summaries().await?;
    loop {
        let summaries = tokio::select! {
            result = watcher.next() => result?,
            _ = cancel.changed() => {
                let _ = watcher.stop().await;
                return Ok(());
            }
        };
        for mut summary in summaries {
            // Untracked models are dropped rather than published.
            match shared.db.model_from_uuid(&summary.uuid).await {
                Ok(_) => {}
                Err(err) if err.kind() == Kind::NotFound => continue,
                Err(err) => return Err(err),
            }
            // Local admin entries have no meaning outside the controller.
            summary.admins.retain(|admin| !admin.ends_with("@local"));
            shared.hub.publish(&summary.uuid.clone(), summary).await;
        }
    }
}

#[derive(Debug, Default)]
struct ModelScratch {
    life: Option<Life>,
    counts: ModelCounts,
    life_changed: bool,
    counts_changed: bool,
    /// Set when a removed model delta arrives; the flush deletes the local
    /// row if it was already dying.
    removed: bool,
}

/// Reduces a delta stream into controller statistics and per-model state.
///
/// The known-entity set distinguishes creates from updates so counters
/// reflect the number of distinct live entities observed so far.
#[derive(Debug)]
pub(super) struct DeltaReducer {
    entities: HashSet<EntityId>,
    stats: ControllerStats,
    stats_changed: bool,
    models: HashMap<String, ModelScratch>,
    rows: Vec<RowOp>,
}

/// Per-entity row updates accumulated during a batch and applied at flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum RowOp {
    PutMachine(MachineDoc),
    RemoveMachine { model_uuid: String, id: String },
    PutApplication(ApplicationDoc),
    RemoveApplication { model_uuid: String, name: String },
    PutUnit(UnitDoc),
    RemoveUnit { model_uuid: String, name: String },
}

impl DeltaReducer {
    pub(super) fn new() -> Self {
        Self {
            entities: HashSet::new(),
            stats: ControllerStats::default(),
            stats_changed: false,
            models: HashMap::new(),
            rows: Vec::new(),
        }
    }

    pub(super) fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    /// Returns the net count adjustment for this delta: +1 for the first
    /// sighting of an entity, -1 for the removal of a known one.
    fn adjust(&mut self, id: EntityId, removed: bool) -> i64 {
        if removed {
            // A second removal for the same id has no effect.
            if self.entities.remove(&id) {
                -1
            } else {
                0
            }
        } else if self.entities.insert(id) {
            1
        } else {
            0
        }
    }

    fn model_scratch(&mut self, uuid: &str) -> &mut ModelScratch {
        // Deltas for a model's entities may arrive before the model delta
        // itself; create the scratch entry with everything marked changed
        // so the first flush writes the counts even when they are zero.
        self.models.entry(uuid.to_string()).or_insert_with(|| ModelScratch {
            life: None,
            counts: ModelCounts::default(),
            life_changed: false,
            counts_changed: true,
            removed: false,
        })
    }

    pub(super) fn add_delta(&mut self, delta: Delta) {
        let id = delta.entity.entity_id();
        let removed = delta.removed;
        let diff = self.adjust(id, removed);
        match delta.entity {
            DeltaEntity::Model { uuid, life } => {
                if diff != 0 {
                    self.stats.model_count = add(self.stats.model_count, diff);
                    self.stats_changed = true;
                }
                let scratch = self.model_scratch(&uuid);
                let life = if removed { Life::Dead } else { life };
                if scratch.life != Some(life) {
                    scratch.life = Some(life);
                    scratch.life_changed = true;
                }
                if removed {
                    scratch.removed = true;
                }
            }
            DeltaEntity::Application { model_uuid, name } => {
                if diff != 0 {
                    self.stats.application_count = add(self.stats.application_count, diff);
                    self.stats_changed = true;
                    let scratch = self.model_scratch(&model_uuid);
                    scratch.counts.applications = add(scratch.counts.applications, diff);
                    scratch.counts_changed = true;
                }
                self.rows.push(if removed {
                    RowOp::RemoveApplication {
                        model_uuid,
                        name,
                    }
                } else {
                    RowOp::PutApplication(ApplicationDoc { model_uuid, name })
                });
            }
            DeltaEntity::Machine {
                model_uuid,
                id,
                cores,
            } => {
                if diff != 0 {
                    self.stats.machine_count = add(self.stats.machine_count, diff);
                    self.stats_changed = true;
                    let scratch = self.model_scratch(&model_uuid);
                    scratch.counts.machines = add(scratch.counts.machines, diff);
                    scratch.counts_changed = true;
                }
                self.rows.push(if removed {
                    RowOp::RemoveMachine { model_uuid, id }
                } else {
                    RowOp::PutMachine(MachineDoc {
                        model_uuid,
                        id,
                        cores,
                    })
                });
            }
            DeltaEntity::Unit {
                model_uuid,
                name,
                application,
            } => {
                if diff != 0 {
                    self.stats.unit_count = add(self.stats.unit_count, diff);
                    self.stats_changed = true;
                    let scratch = self.model_scratch(&model_uuid);
                    scratch.counts.units = add(scratch.counts.units, diff);
                    scratch.counts_changed = true;
                }
                self.rows.push(if removed {
                    RowOp::RemoveUnit { model_uuid, name }
                } else {
                    RowOp::PutUnit(UnitDoc {
                        model_uuid,
                        name,
                        application,
                    })
                });
            }
        }
    }

    /// Applies everything that changed during the batch, issuing updates
    /// concurrently but bounded, and waits for all of them. The batch
    /// boundary is a happens-before point for the next batch.
    async fn flush(&mut self, shared: &Shared) -> Result<()> {
        let mut ops: FuturesUnordered<futures::future::BoxFuture<'_, Result<()>>> =
            FuturesUnordered::new();
        let mut pending: Vec<futures::future::BoxFuture<'_, Result<()>>> = Vec::new();

        if self.stats_changed {
            let stats = self.stats;
            pending.push(Box::pin(async move {
                shared.db.set_controller_stats(&shared.path, &stats).await
            }));
        }
        for (uuid, scratch) in self.models.iter_mut() {
            if scratch.life_changed {
                let uuid = uuid.clone();
                let life = scratch.life.unwrap_or(Life::Dead);
                pending.push(Box::pin(async move {
                    shared.db.set_model_life(&shared.path, &uuid, life).await
                }));
            }
            if scratch.counts_changed {
                let uuid = uuid.clone();
                let counts = scratch.counts;
                pending.push(Box::pin(async move {
                    match shared.db.update_model_counts(&uuid, counts).await {
                        Ok(()) => Ok(()),
                        // Some models (e.g. the controller's own admin
                        // model) have no local row.
                        Err(err) if err.kind() == Kind::NotFound => {
                            tracing::debug!(model = %uuid, "no local row for model counts");
                            Ok(())
                        }
                        Err(err) => Err(err),
                    }
                }));
            }
            if scratch.removed {
                let uuid = uuid.clone();
                pending.push(Box::pin(async move {
                    match shared.db.model_from_uuid(&uuid).await {
                        // Only models already marked dying are reaped here.
                        Ok(model) if model.life == Life::Dying => {
                            shared.db.remove_model(&model.path).await
                        }
                        Ok(_) => Ok(()),
                        Err(err) if err.kind() == Kind::NotFound => Ok(()),
                        Err(err) => Err(err),
                    }
                }));
            }
            scratch.life_changed = false;
            scratch.counts_changed = false;
            scratch.removed = false;
        }
        for op in self.rows.drain(..) {
            pending.push(Box::pin(async move {
                match op {
                    RowOp::PutMachine(doc) => shared.db.update_machine(&doc).await,
                    RowOp::RemoveMachine { model_uuid, id } => {
                        shared.db.remove_machine(&model_uuid, &id).await
                    }
                    RowOp::PutApplication(doc) => shared.db.update_application(&doc).await,
                    RowOp::RemoveApplication { model_uuid, name } => {
                        shared.db.remove_application(&model_uuid, &name).await
                    }
                    RowOp::PutUnit(doc) => shared.db.update_unit(&doc).await,
                    RowOp::RemoveUnit { model_uuid, name } => {
                        shared.db.remove_unit(&model_uuid, &name).await
                    }
                }
            }));
        }
        self.stats_changed = false;

        let mut pending = pending.into_iter();
        for op in pending.by_ref().take(MAX_CONCURRENT_UPDATES) {
            ops.push(op);
        }
        while let Some(result) = ops.next().await {
            result?;
            if let Some(op) = pending.next() {
                ops.push(op);
            }
        }
        Ok(())
    }
}

fn add(count: u64, diff: i64) -> u64 {
    if diff >= 0 {
        count + diff as u64
    } else {
        count.saturating_sub(diff.unsigned_abs())
    }
}
