//! Monitor lease acquisition and renewal.
//!
//! A lease is a compare-and-swap time-bounded claim on a controller record
//! granting exclusive monitoring rights to one JIMM instance. The store
//! performs the CAS; this manager supplies the timing policy.
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::clock::Clock;
use crate::error::Result;
use crate::params::EntityPath;
use crate::store::Database;

pub struct LeaseManager {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    duration: Duration,
}

impl LeaseManager {
    pub fn new(db: Arc<dyn Database>, clock: Arc<dyn Clock>, duration: Duration) -> Self {
        Self {
            db,
            clock,
            duration,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Acquires or renews the lease on `path`, always claiming a full
    /// lease duration from now. `new_owner = None` drops the lease.
    ///
    /// The returned expiry is authoritative; `None` means the lease was
    /// dropped. Conflicts surface as `LeaseUnavailable` and a missing
    /// controller as `NotFound`.
    pub async fn acquire(
        &self,
        path: &EntityPath,
        old_expiry: Option<SystemTime>,
        old_owner: Option<&str>,
        new_owner: Option<&str>,
    ) -> Result<Option<SystemTime>> {
        let now = self.clock.now();
        self.db
            .acquire_monitor_lease(path, old_expiry, old_owner, now + self.duration, new_owner, now)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::error::Kind;
    use crate::params::Acl;
    use crate::store::memory::MemoryDatabase;
    use crate::store::{CloudSpec, ControllerDoc, ControllerStats};
    use std::time::UNIX_EPOCH;

    async fn seed(db: &MemoryDatabase) -> EntityPath {
        let path = EntityPath::new("bob", "ctl");
        db.add_controller(&ControllerDoc {
            path: path.clone(),
            uuid: "ctl-uuid".to_string(),
            host_ports: vec![],
            ca_cert: String::new(),
            admin_user: "admin".to_string(),
            admin_secret: "hunter2".to_string(),
            cloud: CloudSpec::default(),
            location: Default::default(),
            public: true,
            acl: Acl::default(),
            unavailable_since: None,
            monitor_lease: None,
            stats: ControllerStats::default(),
        })
        .await
        .expect("controller");
        path
    }

    #[tokio::test]
    async fn acquire_renew_drop() {
        let db = Arc::new(MemoryDatabase::new());
        let path = seed(&db).await;
        let clock = TestClock::new(UNIX_EPOCH + Duration::from_secs(1_000));
        let leases = LeaseManager::new(
            Arc::clone(&db) as Arc<dyn Database>,
            Arc::new(clock.clone()),
            Duration::from_secs(60),
        );

        let expiry = leases
            .acquire(&path, None, None, Some("jimm-1"))
            .await
            .expect("acquire")
            .expect("expiry");
        assert_eq!(expiry, clock.now() + Duration::from_secs(60));

        // Renewal advances the expiry from the current time.
        clock.advance(Duration::from_secs(45));
        let renewed = leases
            .acquire(&path, Some(expiry), Some("jimm-1"), Some("jimm-1"))
            .await
            .expect("renew")
            .expect("expiry");
        assert!(renewed > expiry);

        // Another instance is refused while the lease is live.
        let err = leases
            .acquire(&path, None, None, Some("jimm-2"))
            .await
            .expect_err("conflict");
        assert_eq!(err.kind(), Kind::LeaseUnavailable);

        // Dropping requires the matching pair and clears the owner.
        let dropped = leases
            .acquire(&path, Some(renewed), Some("jimm-1"), None)
            .await
            .expect("drop");
        assert_eq!(dropped, None);

        // Now anyone may claim it.
        leases
            .acquire(&path, None, None, Some("jimm-2"))
            .await
            .expect("acquire after drop")
            .expect("expiry");
    }

    #[tokio::test]
    async fn expired_leases_are_claimable() {
        let db = Arc::new(MemoryDatabase::new());
        let path = seed(&db).await;
        let clock = TestClock::new(UNIX_EPOCH + Duration::from_secs(1_000));
        let leases = LeaseManager::new(
            Arc::clone(&db) as Arc<dyn Database>,
            Arc::new(clock.clone()),
            Duration::from_secs(60),
        );

        leases
            .acquire(&path, None, None, Some("jimm-1"))
            .await
            .expect("acquire");
        clock.advance(Duration::from_secs(61));
        leases
            .acquire(&path, None, None, Some("jimm-2"))
            .await
            .expect("claim expired")
            .expect("expiry");
    }

    #[tokio::test]
    async fn missing_controller_is_not_found() {
        let db = Arc::new(MemoryDatabase::new());
        let clock = TestClock::new(UNIX_EPOCH);
        let leases = LeaseManager::new(
            Arc::clone(&db) as Arc<dyn Database>,
            Arc::new(clock),
            Duration::from_secs(60),
        );
        let err = leases
            .acquire(&EntityPath::new("bob", "gone"), None, None, Some("jimm-1"))
            .await
            .expect_err("missing");
        assert_eq!(err.kind(), Kind::NotFound);
    }
}
