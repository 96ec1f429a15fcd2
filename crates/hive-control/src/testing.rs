use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use hive_core::UserRole;
use hive_db::entities::audit_events;
use rand::Rng;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter};
use sea_orm_migration::MigratorTrait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::agents::AgentConfigManager;
use crate::assignments::Assignments;
use crate::config::ControlConfig;
use crate::health::{HealthMonitor, HealthProbe};
use crate::port_alloc::PortAllocator;
use crate::registry::{Instance, InstanceRegistry, NewInstance};
use crate::state::AppState;
use crate::supervisor::{CrashEvent, Supervisor};

/// Probe whose answer the test flips by hand.
pub(crate) struct StubProbe {
    pub healthy: AtomicBool,
    pub calls: AtomicUsize,
}

impl Default for StubProbe {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl HealthProbe for StubProbe {
    async fn probe(&self, _port: u16) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.healthy.load(Ordering::SeqCst)
    }
}

type Tweak = Box<dyn FnOnce(&mut ControlConfig) + Send>;

pub(crate) struct TestEnvBuilder {
    command: String,
    args: Vec<String>,
    ports: Option<(u16, u16)>,
    tweaks: Vec<Tweak>,
}

impl TestEnvBuilder {
    pub fn command(mut self, command: &str, args: &[&str]) -> Self {
        self.command = command.to_string();
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn ports(mut self, start: u16, end: u16) -> Self {
        self.ports = Some((start, end));
        self
    }

    pub fn configure(mut self, f: impl FnOnce(&mut ControlConfig) + Send + 'static) -> Self {
        self.tweaks.push(Box::new(f));
        self
    }

    pub async fn build(self) -> TestEnv {
        let dir = tempfile::tempdir().unwrap();
        let (start, end) = self.ports.unwrap_or_else(|| {
            let start = rand::thread_rng().gen_range(20_000u16..60_000);
            (start, start + 9)
        });

        let mut config = ControlConfig::from_lookup(|name| match name {
            "HIVE_MASTER_SECRET" => Some("test-master-secret".to_string()),
            "HIVE_JWT_SECRET" => Some("test-jwt-secret".to_string()),
            _ => None,
        })
        .unwrap();
        config.data_root = dir.path().join("data");
        config.database_url = format!("sqlite://{}?mode=rwc", dir.path().join("hive.db").display());
        config.port_range_start = start;
        config.port_range_end = end;
        config.instance_command = self.command;
        config.instance_args = self.args;
        config.start_timeout = Duration::from_secs(5);
        config.stop_timeout = Duration::from_secs(2);
        config.health_interval = Duration::from_secs(1);
        config.probe_timeout = Duration::from_secs(1);
        config.restart_backoff = Duration::from_millis(50);
        config.restart_backoff_max = Duration::from_millis(100);
        for tweak in self.tweaks {
            tweak(&mut config);
        }

        std::fs::create_dir_all(&config.data_root).unwrap();
        let db = hive_db::connect(&config.database_url).await.unwrap();
        hive_migration::Migrator::up(&db, None).await.unwrap();

        let probe = Arc::new(StubProbe::default());
        let (state, crash_rx) =
            AppState::with_probe(config.clone(), Arc::new(db), probe.clone()).unwrap();

        TestEnv {
            dir,
            db: state.db.clone(),
            config,
            ports: state.registry.ports().clone(),
            registry: state.registry.clone(),
            assignments: state.assignments.clone(),
            agents: state.agents.clone(),
            supervisor: state.supervisor.clone(),
            monitor: state.monitor.clone(),
            probe,
            crash_rx,
            state,
        }
    }
}

/// One isolated orchestrator: its own temp dir, sqlite file and port range.
pub(crate) struct TestEnv {
    pub dir: tempfile::TempDir,
    pub db: Arc<DatabaseConnection>,
    pub config: ControlConfig,
    pub ports: Arc<PortAllocator>,
    pub registry: InstanceRegistry,
    pub assignments: Assignments,
    pub agents: AgentConfigManager,
    pub supervisor: Supervisor,
    pub monitor: HealthMonitor,
    pub probe: Arc<StubProbe>,
    pub crash_rx: mpsc::UnboundedReceiver<CrashEvent>,
    pub state: AppState,
}

impl TestEnv {
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "sleep 30".to_string()],
            ports: None,
            tweaks: Vec::new(),
        }
    }

    pub async fn new() -> Self {
        Self::builder().build().await
    }

    pub async fn with_port_range(start: u16, end: u16) -> Self {
        Self::builder().ports(start, end).build().await
    }

    pub async fn create_instance(&self, name: &str) -> Instance {
        self.registry
            .create(NewInstance {
                name: name.to_string(),
                description: None,
                auto_start: false,
                max_users: 0,
            })
            .await
            .unwrap()
    }

    pub async fn create_user(&self, name: &str) -> Uuid {
        self.assignments
            .register_user(name, UserRole::User)
            .await
            .unwrap()
            .id
    }
}

pub(crate) async fn audit_actions(db: &DatabaseConnection, action: &str) -> usize {
    audit_events::Entity::find()
        .filter(audit_events::Column::Action.eq(action))
        .count(db)
        .await
        .unwrap() as usize
}

pub(crate) fn assert_no_slot(sup: &Supervisor, id: Uuid) {
    assert!(!sup.has_slot(id), "supervisor still tracks {id}");
}
