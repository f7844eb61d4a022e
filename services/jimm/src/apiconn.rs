//! Controller-keyed cache of open downstream API connections.
//!
//! # Purpose
//! Dialing a downstream controller is expensive, so live connections are
//! shared: handles are reference counted, a connection whose count drops to
//! zero stays cached for reuse, and at most one dial per controller is in
//! flight at any time. A caller that observes errors on a connection evicts
//! it, which forbids reuse and closes the transport once the last handle is
//! gone.
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::api::{ControllerApi, Dialer};
use crate::clock::Clock;
use crate::error::{Kind, Result};
use crate::params::EntityPath;
use crate::store::{ControllerDoc, Database};

/// Invoked after a fresh dial succeeds, before the connection is handed to
/// any caller. The orchestrator installs a hook here that re-uploads
/// credentials marked as pending for the controller.
#[async_trait]
pub trait ReconnectHook: Send + Sync + 'static {
    async fn connected(&self, ctl: &ControllerDoc, api: &Arc<dyn ControllerApi>) -> Result<()>;
}

enum Entry {
    /// A dial is in flight; waiters park on the notify.
    Dialing(Arc<Notify>),
    Ready(Arc<ConnState>),
}

/// State shared between the cache entry and every handle on one
/// connection. The transport closes once the state is evicted and the
/// last reference is gone, regardless of whether the cache still knows
/// about it.
struct ConnState {
    api: Arc<dyn ControllerApi>,
    refs: AtomicUsize,
    evicted: AtomicBool,
}

struct Shared {
    entries: Mutex<HashMap<EntityPath, Entry>>,
}

/// The connection cache. Cheap to clone; clones share the cache.
pub struct ConnectionCache {
    db: Arc<dyn Database>,
    dialer: Arc<dyn Dialer>,
    clock: Arc<dyn Clock>,
    hook: Option<Arc<dyn ReconnectHook>>,
    shared: Arc<Shared>,
}

impl Clone for ConnectionCache {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            dialer: Arc::clone(&self.dialer),
            clock: Arc::clone(&self.clock),
            hook: self.hook.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

/// A reference-counted handle on a cached connection.
///
/// Call [`Connection::close`] to return the reference to the cache or
/// [`Connection::evict`] when the connection is suspect. Dropping a handle
/// without closing releases the reference as a fallback.
pub struct Connection {
    shared: Arc<Shared>,
    path: EntityPath,
    state: Arc<ConnState>,
    released: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn api(&self) -> &Arc<dyn ControllerApi> {
        &self.state.api
    }

    pub fn controller_path(&self) -> &EntityPath {
        &self.path
    }

    /// Releases this reference. The connection stays cached for reuse
    /// unless it has been evicted, in which case the transport is closed
    /// once the last reference is gone.
    pub async fn close(mut self) {
        self.released = true;
        if let Some(api) = release(&self.state) {
            api.close().await;
        }
    }

    /// Removes the connection from the cache so the next `open` re-dials,
    /// then releases this reference. The transport closes once the last
    /// outstanding handle is gone.
    pub async fn evict(mut self) {
        self.released = true;
        self.state.evicted.store(true, Ordering::SeqCst);
        {
            let mut entries = self.shared.entries.lock().expect("cache lock");
            // Only remove the entry if it still refers to this connection;
            // a fresh dial may already have replaced it.
            if let Some(Entry::Ready(state)) = entries.get(&self.path) {
                if Arc::ptr_eq(state, &self.state) {
                    entries.remove(&self.path);
                }
            }
        }
        if let Some(api) = release(&self.state) {
            api.close().await;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(api) = release(&self.state) {
            // Last reference to an evicted connection dropped without an
            // explicit close; finish the transport shutdown off-task.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { api.close().await });
            }
        }
    }
}

/// Decrements the state's refcount. Returns the transport to close when
/// the connection was evicted and this was the last reference.
fn release(state: &Arc<ConnState>) -> Option<Arc<dyn ControllerApi>> {
    let remaining = state.refs.fetch_sub(1, Ordering::SeqCst) - 1;
    if remaining == 0 && state.evicted.load(Ordering::SeqCst) {
        Some(Arc::clone(&state.api))
    } else {
        None
    }
}

impl ConnectionCache {
    pub fn new(
        db: Arc<dyn Database>,
        dialer: Arc<dyn Dialer>,
        clock: Arc<dyn Clock>,
        hook: Option<Arc<dyn ReconnectHook>>,
    ) -> Self {
        Self {
            db,
            dialer,
            clock,
            hook,
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Opens a connection to the named controller, reusing a cached one
    /// when available and joining any dial already in flight.
    pub async fn open(&self, path: &EntityPath) -> Result<Connection> {
        loop {
            let notify = {
                let mut entries = self.shared.entries.lock().expect("cache lock");
                match entries.get(path) {
                    Some(Entry::Ready(state)) if !state.evicted.load(Ordering::SeqCst) => {
                        state.refs.fetch_add(1, Ordering::SeqCst);
                        return Ok(Connection {
                            shared: Arc::clone(&self.shared),
                            path: path.clone(),
                            state: Arc::clone(state),
                            released: false,
                        });
                    }
                    Some(Entry::Dialing(notify)) => Some(Arc::clone(notify)),
                    _ => {
                        entries.insert(path.clone(), Entry::Dialing(Arc::new(Notify::new())));
                        None
                    }
                }
            };
            match notify {
                Some(notify) => {
                    // Another caller owns the dial; wait for it to settle
                    // and retry against the updated entry.
                    notify.notified().await;
                }
                None => return self.dial(path).await,
            }
        }
    }

    /// Performs the dial this task owns, publishing the outcome to any
    /// waiters parked on the entry.
    async fn dial(&self, path: &EntityPath) -> Result<Connection> {
        let started = self.clock.now();
        let outcome: Result<(ControllerDoc, Arc<dyn ControllerApi>)> = async {
            let ctl = self.db.controller(path).await?;
            let api = self.dialer.dial(&ctl).await?;
            Ok((ctl, api))
        }
        .await;

        match outcome {
            Ok((ctl, api)) => {
                if let Err(err) = self.db.set_controller_available(path).await {
                    tracing::warn!(controller = %path, error = %err, "cannot clear controller unavailability");
                }
                if let Some(hook) = &self.hook {
                    if let Err(err) = hook.connected(&ctl, &api).await {
                        tracing::warn!(controller = %path, error = %err, "reconnect hook failed");
                    }
                }
                let state = Arc::new(ConnState {
                    api,
                    refs: AtomicUsize::new(1),
                    evicted: AtomicBool::new(false),
                });
                let mut entries = self.shared.entries.lock().expect("cache lock");
                if let Some(Entry::Dialing(notify)) = entries.remove(path) {
                    notify.notify_waiters();
                }
                entries.insert(path.clone(), Entry::Ready(Arc::clone(&state)));
                Ok(Connection {
                    shared: Arc::clone(&self.shared),
                    path: path.clone(),
                    state,
                    released: false,
                })
            }
            Err(err) => {
                if err.kind() == Kind::ApiConnection {
                    if let Err(mark_err) =
                        self.db.set_controller_unavailable_at(path, started).await
                    {
                        tracing::warn!(controller = %path, error = %mark_err, "cannot set controller unavailability");
                    }
                }
                let mut entries = self.shared.entries.lock().expect("cache lock");
                if let Some(Entry::Dialing(notify)) = entries.remove(path) {
                    notify.notify_waiters();
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        CloudCredentialInfo, CreateModelArgs, DeltaWatcher, ModelInfo, SummaryWatcher,
    };
    use crate::clock::WallClock;
    use crate::error::Error;
    use crate::store::memory::MemoryDatabase;
    use crate::store::CloudSpec;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct StubApi {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ControllerApi for StubApi {
        async fn create_model(&self, _args: CreateModelArgs) -> Result<ModelInfo> {
            unimplemented!("not used by cache tests")
        }
        async fn destroy_model(
            &self,
            _uuid: &str,
            _destroy_storage: Option<bool>,
            _force: Option<bool>,
            _max_wait: Option<Duration>,
        ) -> Result<()> {
            unimplemented!("not used by cache tests")
        }
        async fn grant_model(&self, _uuid: &str, _user: &str, _access: &str) -> Result<()> {
            unimplemented!("not used by cache tests")
        }
        async fn revoke_model(&self, _uuid: &str, _user: &str, _access: &str) -> Result<()> {
            unimplemented!("not used by cache tests")
        }
        async fn model_info(&self, _uuid: &str) -> Result<ModelInfo> {
            unimplemented!("not used by cache tests")
        }
        async fn update_credential(
            &self,
            _tag: &str,
            _auth_type: &str,
            _attributes: &BTreeMap<String, String>,
        ) -> Result<()> {
            unimplemented!("not used by cache tests")
        }
        async fn revoke_credential(&self, _tag: &str) -> Result<()> {
            unimplemented!("not used by cache tests")
        }
        async fn credential(&self, _tag: &str) -> Result<CloudCredentialInfo> {
            unimplemented!("not used by cache tests")
        }
        async fn change_model_credential(&self, _uuid: &str, _tag: &str) -> Result<()> {
            unimplemented!("not used by cache tests")
        }
        async fn dump_model(&self, _uuid: &str, _simplified: bool) -> Result<String> {
            unimplemented!("not used by cache tests")
        }
        async fn dump_model_db(&self, _uuid: &str) -> Result<serde_json::Value> {
            unimplemented!("not used by cache tests")
        }
        async fn watch_all_models(&self) -> Result<Box<dyn DeltaWatcher>> {
            unimplemented!("not used by cache tests")
        }
        fn supports_model_summary_watcher(&self) -> bool {
            false
        }
        async fn watch_all_model_summaries(&self) -> Result<Box<dyn SummaryWatcher>> {
            unimplemented!("not used by cache tests")
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct StubDialer {
        dials: AtomicUsize,
        fail: AtomicBool,
        gate: Option<Arc<Notify>>,
        last_closed: Mutex<Option<Arc<AtomicBool>>>,
    }

    impl StubDialer {
        fn new() -> Self {
            Self {
                dials: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                gate: None,
                last_closed: Mutex::new(None),
            }
        }

        fn gated() -> (Self, Arc<Notify>) {
            let gate = Arc::new(Notify::new());
            let dialer = Self {
                dials: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                gate: Some(Arc::clone(&gate)),
                last_closed: Mutex::new(None),
            };
            (dialer, gate)
        }
    }

    #[async_trait]
    impl Dialer for StubDialer {
        async fn dial(&self, _ctl: &ControllerDoc) -> Result<Arc<dyn ControllerApi>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::ApiConnection("cannot dial controller".to_string()));
            }
            let closed = Arc::new(AtomicBool::new(false));
            *self.last_closed.lock().expect("lock") = Some(Arc::clone(&closed));
            Ok(Arc::new(StubApi { closed }))
        }
    }

    async fn seed_controller(db: &MemoryDatabase) -> EntityPath {
        let path = EntityPath::new("bob", "ctl");
        let ctl = ControllerDoc {
            path: path.clone(),
            uuid: "ctl-uuid".to_string(),
            host_ports: vec![],
            ca_cert: String::new(),
            admin_user: "admin".to_string(),
            admin_secret: "hunter2".to_string(),
            cloud: CloudSpec::default(),
            location: Default::default(),
            public: true,
            acl: Default::default(),
            unavailable_since: None,
            monitor_lease: None,
            stats: Default::default(),
        };
        db.add_controller(&ctl).await.expect("controller");
        path
    }

    fn cache(
        db: Arc<MemoryDatabase>,
        dialer: Arc<StubDialer>,
        hook: Option<Arc<dyn ReconnectHook>>,
    ) -> ConnectionCache {
        ConnectionCache::new(db, dialer, Arc::new(WallClock), hook)
    }

    #[tokio::test]
    async fn connections_are_shared_and_reused() {
        let db = Arc::new(MemoryDatabase::new());
        let path = seed_controller(&db).await;
        let dialer = Arc::new(StubDialer::new());
        let cache = cache(Arc::clone(&db), Arc::clone(&dialer), None);

        let c1 = cache.open(&path).await.expect("open");
        let c2 = cache.open(&path).await.expect("open again");
        assert!(Arc::ptr_eq(c1.api(), c2.api()));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);

        // Closing both keeps the connection cached.
        c1.close().await;
        c2.close().await;
        let c3 = cache.open(&path).await.expect("reopen");
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
        c3.close().await;
    }

    #[tokio::test]
    async fn concurrent_dials_are_deduplicated() {
        let db = Arc::new(MemoryDatabase::new());
        let path = seed_controller(&db).await;
        let (dialer, gate) = StubDialer::gated();
        let dialer = Arc::new(dialer);
        let cache = cache(Arc::clone(&db), Arc::clone(&dialer), None);

        let open1 = {
            let cache = cache.clone();
            let path = path.clone();
            tokio::spawn(async move { cache.open(&path).await })
        };
        let open2 = {
            let cache = cache.clone();
            let path = path.clone();
            tokio::spawn(async move { cache.open(&path).await })
        };
        // Let both tasks race for the entry; only one reaches the dialer,
        // and the stored permit releases it even if it arrives late.
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();

        let c1 = open1.await.expect("join").expect("open");
        let c2 = open2.await.expect("join").expect("open");
        assert!(Arc::ptr_eq(c1.api(), c2.api()));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
        c1.close().await;
        c2.close().await;
    }

    #[tokio::test]
    async fn dial_failure_marks_unavailable_and_is_retried() {
        let db = Arc::new(MemoryDatabase::new());
        let path = seed_controller(&db).await;
        let dialer = Arc::new(StubDialer::new());
        dialer.fail.store(true, Ordering::SeqCst);
        let cache = cache(Arc::clone(&db), Arc::clone(&dialer), None);

        let err = cache.open(&path).await.expect_err("dial fails");
        assert_eq!(err.kind(), Kind::ApiConnection);
        assert!(db
            .controller(&path)
            .await
            .expect("controller")
            .unavailable_since
            .is_some());

        // A later call retries and clears the marker.
        dialer.fail.store(false, Ordering::SeqCst);
        let conn = cache.open(&path).await.expect("open");
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
        assert!(db
            .controller(&path)
            .await
            .expect("controller")
            .unavailable_since
            .is_none());
        conn.close().await;
    }

    #[tokio::test]
    async fn evicted_connections_are_not_reused() {
        let db = Arc::new(MemoryDatabase::new());
        let path = seed_controller(&db).await;
        let dialer = Arc::new(StubDialer::new());
        let cache = cache(Arc::clone(&db), Arc::clone(&dialer), None);

        let c1 = cache.open(&path).await.expect("open");
        let c2 = cache.open(&path).await.expect("open again");
        let closed = dialer
            .last_closed
            .lock()
            .expect("lock")
            .clone()
            .expect("dialed");

        c1.evict().await;
        // The transport stays open while c2 still holds a reference.
        assert!(!closed.load(Ordering::SeqCst));

        // A new open after eviction re-dials.
        let c3 = cache.open(&path).await.expect("redial");
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);

        c2.close().await;
        assert!(closed.load(Ordering::SeqCst));
        c3.close().await;
    }

    #[tokio::test]
    async fn reconnect_hook_runs_on_fresh_dial() {
        struct CountingHook {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl ReconnectHook for CountingHook {
            async fn connected(
                &self,
                _ctl: &ControllerDoc,
                _api: &Arc<dyn ControllerApi>,
            ) -> Result<()> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let db = Arc::new(MemoryDatabase::new());
        let path = seed_controller(&db).await;
        let dialer = Arc::new(StubDialer::new());
        let hook = Arc::new(CountingHook {
            calls: AtomicUsize::new(0),
        });
        let cache = cache(
            Arc::clone(&db),
            Arc::clone(&dialer),
            Some(Arc::clone(&hook) as Arc<dyn ReconnectHook>),
        );

        let c1 = cache.open(&path).await.expect("open");
        let c2 = cache.open(&path).await.expect("cached");
        // Only the fresh dial runs the hook.
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
        c1.close().await;
        c2.close().await;
    }

    #[tokio::test]
    async fn open_unknown_controller_is_not_found() {
        let db = Arc::new(MemoryDatabase::new());
        let dialer = Arc::new(StubDialer::new());
        let cache = cache(Arc::clone(&db), dialer, None);
        let err = cache
            .open(&EntityPath::new("bob", "missing"))
            .await
            .expect_err("missing");
        assert_eq!(err.kind(), Kind::NotFound);
    }
}
