use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use jimm::api::Dialer;
use jimm::apiconn::{ConnectionCache, ReconnectHook};
use jimm::auth::NoGroups;
use jimm::clock::{Clock, WallClock};
use jimm::manager::{Chooser, CredentialRefresher, Manager};
use jimm::params::{Acl, CredentialPath, EntityPath};
use jimm::rpc::{build_registry, MacaroonVerifier, Registry, Session};
use jimm::store::memory::MemoryDatabase;
use jimm::store::{CloudSpec, ControllerDoc, CredentialDoc, Database};
use jimm::test_support::{FakeController, FakeDialer, StaticMacaroons};

pub const JIMM_UUID: &str = "914487b5-60e7-42bb-bd63-1adc3fd3a388";
pub const MACAROON: &str = "test-macaroon";

/// Chooser that always picks the first matching controller.
struct FirstChooser;

impl Chooser for FirstChooser {
    fn choose(&self, _n: usize) -> usize {
        0
    }
}

pub struct Harness {
    pub db: Arc<MemoryDatabase>,
    pub dialer: Arc<FakeDialer>,
    pub manager: Arc<Manager>,
    pub registry: Arc<Registry>,
}

pub fn harness() -> Harness {
    let db = Arc::new(MemoryDatabase::new());
    let dialer = Arc::new(FakeDialer::new());
    let clock: Arc<dyn Clock> = Arc::new(WallClock);
    let hook = Arc::new(CredentialRefresher::new(
        Arc::clone(&db) as Arc<dyn Database>
    ));
    let cache = ConnectionCache::new(
        Arc::clone(&db) as Arc<dyn Database>,
        Arc::clone(&dialer) as Arc<dyn Dialer>,
        Arc::clone(&clock),
        Some(hook as Arc<dyn ReconnectHook>),
    );
    let manager = Arc::new(Manager::new(
        Arc::clone(&db) as Arc<dyn Database>,
        cache,
        clock,
        Arc::new(FirstChooser),
        "controller-admin",
        JIMM_UUID,
        true,
    ));
    Harness {
        db,
        dialer,
        manager,
        registry: Arc::new(build_registry()),
    }
}

impl Harness {
    /// A gateway session whose macaroon asserts the given username.
    pub fn session(&self, username: &str) -> Arc<Session> {
        Session::new(
            Arc::clone(&self.manager),
            Arc::new(StaticMacaroons::new(MACAROON, username)) as Arc<dyn MacaroonVerifier>,
            Arc::new(NoGroups),
            Arc::clone(&self.registry),
            Arc::new(WallClock),
            Duration::from_secs(180),
        )
    }

    /// Logs the session in with the harness macaroon.
    pub async fn login(&self, session: &Arc<Session>) -> serde_json::Value {
        session
            .call(
                "Admin",
                3,
                "Login",
                serde_json::json!({ "macaroons": [MACAROON] }),
            )
            .await
            .expect("login")
    }

    pub async fn add_controller(
        &self,
        user: &str,
        name: &str,
        cloud: &str,
        region: &str,
    ) -> (EntityPath, Arc<FakeController>) {
        let path = EntityPath::new(user, name);
        let uuid = format!("{user}-{name}-uuid");
        self.db
            .add_controller(&ControllerDoc {
                path: path.clone(),
                uuid: uuid.clone(),
                host_ports: vec![vec!["198.51.100.1:17070".to_string()]],
                ca_cert: String::new(),
                admin_user: "admin".to_string(),
                admin_secret: "hunter2".to_string(),
                cloud: CloudSpec {
                    name: cloud.to_string(),
                    provider_type: cloud.to_string(),
                    auth_types: vec!["empty".to_string()],
                    regions: vec![region.to_string()],
                },
                location: [
                    ("cloud".to_string(), cloud.to_string()),
                    ("region".to_string(), region.to_string()),
                ]
                .into_iter()
                .collect(),
                public: true,
                acl: Acl {
                    read: vec!["everyone".to_string()],
                    write: vec![],
                    admin: vec![],
                },
                unavailable_since: None,
                monitor_lease: None,
                stats: Default::default(),
            })
            .await
            .expect("controller");
        let fake = FakeController::new(uuid);
        self.dialer.register(Arc::clone(&fake));
        (path, fake)
    }

    pub async fn add_credential(&self, cloud: &str, user: &str, name: &str) -> CredentialPath {
        let path = CredentialPath::new(cloud, user, name);
        self.db
            .update_credential(&CredentialDoc {
                path: path.clone(),
                auth_type: "empty".to_string(),
                attributes: BTreeMap::new(),
                revoked: false,
                controllers: Default::default(),
            })
            .await
            .expect("credential");
        path
    }
}
