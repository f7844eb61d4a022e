//! Fixed-capacity pool of document-store sessions.
//!
//! A failing backend must not poison long-lived handles, but dialing on
//! every request is too expensive. The pool keeps one cached session per
//! slot, hands slots out round-robin, and lazily replaces a session once a
//! caller reports it broken.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Dials new sessions into the document store.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: Send + Sync + 'static;

    async fn connect(&self) -> Result<Self::Session>;
}

/// A pooled session handle.
///
/// Handles acquired from the same slot share one underlying session.
/// `poison` marks the shared session unusable; the slot is re-dialled on
/// its next acquisition.
pub struct SessionHandle<S> {
    slot: Arc<Slot<S>>,
}

impl<S> Clone for SessionHandle<S> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<S> std::fmt::Debug for SessionHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").finish_non_exhaustive()
    }
}

impl<S> SessionHandle<S> {
    pub fn session(&self) -> &S {
        &self.slot.session
    }

    /// Marks the underlying session as broken after an observed I/O
    /// failure. Idempotent.
    pub fn poison(&self) {
        self.slot.poisoned.store(true, Ordering::SeqCst);
    }

    pub fn is_poisoned(&self) -> bool {
        self.slot.poisoned.load(Ordering::SeqCst)
    }
}

struct Slot<S> {
    session: S,
    poisoned: AtomicBool,
}

/// Fixed-capacity session pool.
pub struct SessionPool<C: Connector> {
    connector: C,
    slots: Mutex<Vec<Option<Arc<Slot<C::Session>>>>>,
    next: AtomicUsize,
    closed: AtomicBool,
}

impl<C: Connector> SessionPool<C> {
    pub fn new(connector: C, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::BadRequest(
                "session pool capacity must be non-zero".to_string(),
            ));
        }
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Ok(Self {
            connector,
            slots: Mutex::new(slots),
            next: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Acquires the next slot's session, dialing it if the slot is empty
    /// or its cached session has been poisoned.
    pub async fn session(&self) -> Result<SessionHandle<C::Session>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::BadRequest("session pool is closed".to_string()));
        }
        let capacity = {
            let slots = self.slots.lock().await;
            slots.len()
        };
        let index = self.next.fetch_add(1, Ordering::SeqCst) % capacity;

        let mut slots = self.slots.lock().await;
        let reusable = matches!(
            &slots[index],
            Some(slot) if !slot.poisoned.load(Ordering::SeqCst)
        );
        if !reusable {
            let session = self.connector.connect().await?;
            slots[index] = Some(Arc::new(Slot {
                session,
                poisoned: AtomicBool::new(false),
            }));
        }
        let slot = slots[index].as_ref().map(Arc::clone).expect("slot filled");
        Ok(SessionHandle { slot })
    }

    /// Drops every cached session. Outstanding handles keep their shared
    /// session alive until released; further acquisition fails.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut slots = self.slots.lock().await;
        for slot in slots.iter_mut() {
            *slot = None;
        }
    }
}
