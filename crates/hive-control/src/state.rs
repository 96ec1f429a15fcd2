use std::{sync::Arc, time::Duration};

use sea_orm::DatabaseConnection;
use tokio::sync::mpsc;

use crate::agents::{AgentConfigManager, CredentialCipher};
use crate::assignments::Assignments;
use crate::config::ControlConfig;
use crate::error::{HiveError, HiveResult};
use crate::health::{HealthMonitor, HealthProbe, HttpHealthProbe};
use crate::port_alloc::PortAllocator;
use crate::proxy::ProxyRouter;
use crate::registry::InstanceRegistry;
use crate::supervisor::{CrashEvent, Supervisor};

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<ControlConfig>,
    pub db: Arc<DatabaseConnection>,
    pub registry: InstanceRegistry,
    pub assignments: Assignments,
    pub agents: AgentConfigManager,
    pub supervisor: Supervisor,
    pub monitor: HealthMonitor,
    pub proxy: ProxyRouter,
}

impl AppState {
    /// Wires every service over one database handle. The returned receiver
    /// carries crash notifications and belongs to the health monitor task.
    pub fn new(
        cfg: ControlConfig,
        db: Arc<DatabaseConnection>,
    ) -> HiveResult<(Self, mpsc::UnboundedReceiver<CrashEvent>)> {
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| HiveError::Upstream(format!("health client: {e}")))?;
        let probe = Arc::new(HttpHealthProbe::new(
            http,
            cfg.health_path.clone(),
            cfg.probe_timeout,
        ));
        Self::with_probe(cfg, db, probe)
    }

    pub fn with_probe(
        cfg: ControlConfig,
        db: Arc<DatabaseConnection>,
        probe: Arc<dyn HealthProbe>,
    ) -> HiveResult<(Self, mpsc::UnboundedReceiver<CrashEvent>)> {
        let cfg = Arc::new(cfg);
        let ports = Arc::new(PortAllocator::new(cfg.port_range_start, cfg.port_range_end));
        let registry = InstanceRegistry::new(db.clone(), ports, cfg.data_root.clone());
        let assignments = Assignments::new(db.clone());

        let upstream = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .map_err(|e| HiveError::Upstream(format!("agent client: {e}")))?;
        let agents = AgentConfigManager::new(
            db.clone(),
            CredentialCipher::from_master_secret(&cfg.master_secret),
            upstream,
        );

        let (supervisor, crash_rx) =
            Supervisor::new(cfg.clone(), registry.clone(), agents.clone(), probe.clone());
        let monitor = HealthMonitor::new(supervisor.clone(), cfg.clone(), probe);
        let proxy = ProxyRouter::new(supervisor.clone(), assignments.clone())?;

        Ok((
            Self {
                cfg,
                db,
                registry,
                assignments,
                agents,
                supervisor,
                monitor,
                proxy,
            },
            crash_rx,
        ))
    }
}
