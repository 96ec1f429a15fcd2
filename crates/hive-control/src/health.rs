use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use hive_core::{HealthStatus, InstanceStatus};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::config::ControlConfig;
use crate::error::HiveError;
use crate::supervisor::{CrashEvent, Supervisor};

/// Liveness check against an instance's local port.
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn probe(&self, port: u16) -> bool;
}

/// `GET http://127.0.0.1:{port}{path}`; any 2xx is healthy.
pub struct HttpHealthProbe {
    http: reqwest::Client,
    path: String,
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(http: reqwest::Client, path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            path: path.into(),
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{port}{}", self.path);
        match self.http.get(&url).timeout(self.timeout).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(port, error = %e, "health probe failed");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct HealthTracker {
    pub consecutive_failures: u32,
    pub auto_restarts: u32,
    pub restarts_total: u64,
    pub restarting: bool,
    /// Bumped by admin lifecycle actions; a pending restart loop from an
    /// older epoch exits without acting.
    #[serde(skip)]
    epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestartReason {
    Unhealthy,
    Crashed,
}

impl RestartReason {
    fn as_str(&self) -> &'static str {
        match self {
            RestartReason::Unhealthy => "health probes failing",
            RestartReason::Crashed => "process crashed",
        }
    }
}

/// Periodic prober and auto-restart driver.
#[derive(Clone)]
pub struct HealthMonitor {
    sup: Supervisor,
    cfg: Arc<ControlConfig>,
    probe: Arc<dyn HealthProbe>,
    trackers: Arc<DashMap<Uuid, HealthTracker>>,
}

impl HealthMonitor {
    pub fn new(sup: Supervisor, cfg: Arc<ControlConfig>, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            sup,
            cfg,
            probe,
            trackers: Arc::new(DashMap::new()),
        }
    }

    pub fn tracker(&self, id: Uuid) -> HealthTracker {
        self.trackers.get(&id).map(|t| *t).unwrap_or_default()
    }

    pub fn forget(&self, id: Uuid) {
        self.trackers.remove(&id);
    }

    /// Clear failure history after an admin start/stop/restart and abandon
    /// any auto-restart still waiting out its backoff.
    pub fn reset(&self, id: Uuid) {
        if let Some(mut t) = self.trackers.get_mut(&id) {
            let (restarts_total, epoch) = (t.restarts_total, t.epoch.wrapping_add(1));
            *t = HealthTracker {
                restarts_total,
                epoch,
                ..Default::default()
            };
        }
    }

    fn is_current(&self, id: Uuid, epoch: u64) -> bool {
        self.trackers.get(&id).is_some_and(|t| t.epoch == epoch)
    }

    pub fn spawn(
        self,
        crash_rx: mpsc::UnboundedReceiver<CrashEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(crash_rx, shutdown).await })
    }

    async fn run(
        self,
        mut crash_rx: mpsc::UnboundedReceiver<CrashEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.cfg.health_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = self.cfg.health_interval.as_secs(),
            threshold = self.cfg.failure_threshold,
            "health monitor started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                Some(ev) = crash_rx.recv() => self.on_crash(ev).await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("health monitor stopped");
    }

    /// Probe every Running instance once. Instances inside a lifecycle
    /// operation, or already restarting, are skipped this round.
    pub async fn sweep(&self) {
        let instances = match self.sup.registry().list().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "health sweep could not list instances");
                return;
            }
        };

        let mut set = tokio::task::JoinSet::new();
        for inst in instances {
            if inst.status != InstanceStatus::Running
                || self.sup.is_busy(inst.id)
                || self.tracker(inst.id).restarting
            {
                continue;
            }
            let probe = self.probe.clone();
            set.spawn(async move {
                let healthy = probe.probe(inst.port).await;
                (inst, healthy)
            });
        }

        while let Some(res) = set.join_next().await {
            let Ok((inst, healthy)) = res else { continue };
            self.record(inst.id, inst.auto_start, healthy).await;
        }
    }

    async fn record(&self, id: Uuid, auto_start: bool, healthy: bool) {
        let reg = self.sup.registry();
        let health = if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        if let Err(e) = reg.set_health(id, health).await {
            tracing::debug!(instance_id = %id, error = %e, "health update skipped");
            return;
        }

        let failures = {
            let mut t = self.trackers.entry(id).or_default();
            if healthy {
                t.consecutive_failures = 0;
                t.auto_restarts = 0;
            } else {
                t.consecutive_failures = t.consecutive_failures.saturating_add(1);
            }
            t.consecutive_failures
        };

        if healthy {
            return;
        }
        tracing::warn!(instance_id = %id, failures, "health probe failed");
        if failures >= self.cfg.failure_threshold {
            if auto_start {
                self.schedule_restart(id, RestartReason::Unhealthy);
            } else {
                tracing::warn!(instance_id = %id, failures, "instance unhealthy; auto-start disabled");
            }
        }
    }

    async fn on_crash(&self, ev: CrashEvent) {
        let inst = match self.sup.registry().get(ev.instance_id).await {
            Ok(i) => i,
            Err(_) => return,
        };
        if inst.auto_start {
            self.schedule_restart(inst.id, RestartReason::Crashed);
        } else {
            tracing::warn!(
                instance_id = %inst.id,
                exit_code = ?ev.exit_code,
                "instance crashed; auto-start disabled"
            );
        }
    }

    /// Restarts with exponential backoff until one succeeds or the
    /// consecutive-attempt budget is spent, which leaves the instance in Error.
    fn schedule_restart(&self, id: Uuid, reason: RestartReason) {
        let epoch = {
            let mut t = self.trackers.entry(id).or_default();
            if t.restarting {
                return;
            }
            t.restarting = true;
            t.consecutive_failures = 0;
            t.epoch
        };

        let this = self.clone();
        tokio::spawn(async move {
            this.restart_loop(id, epoch, reason).await;
            if let Some(mut t) = this.trackers.get_mut(&id) {
                if t.epoch == epoch {
                    t.restarting = false;
                    t.consecutive_failures = 0;
                }
            }
        });
    }

    async fn restart_loop(&self, id: Uuid, epoch: u64, reason: RestartReason) {
        loop {
            let attempt = {
                let Some(mut t) = self.trackers.get_mut(&id) else {
                    return;
                };
                if t.epoch != epoch {
                    return;
                }
                if t.auto_restarts >= self.cfg.max_auto_restarts {
                    None
                } else {
                    t.auto_restarts += 1;
                    t.restarts_total += 1;
                    Some(t.auto_restarts)
                }
            };
            let Some(attempt) = attempt else {
                self.give_up(id).await;
                return;
            };

            let delay = self.cfg.restart_delay(attempt);
            tracing::warn!(
                instance_id = %id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                reason = reason.as_str(),
                "scheduling auto-restart"
            );
            tokio::time::sleep(delay).await;
            if !self.is_current(id, epoch) {
                return;
            }

            match self.sup.recover(id).await {
                Ok(Some(_)) => {
                    tracing::info!(instance_id = %id, attempt, "auto-restart succeeded");
                    return;
                }
                Ok(None) => {
                    tracing::info!(instance_id = %id, "instance no longer failing; auto-restart dropped");
                    return;
                }
                Err(HiveError::InstanceNotFound(_)) => return,
                Err(e) => {
                    tracing::warn!(instance_id = %id, attempt, error = %e, "auto-restart failed");
                }
            }
        }
    }

    async fn give_up(&self, id: Uuid) {
        let msg = format!(
            "gave up after {} consecutive auto-restarts",
            self.cfg.max_auto_restarts
        );
        match self.sup.halt(id, msg.clone()).await {
            Ok(Some(_)) => tracing::error!(instance_id = %id, "{msg}"),
            Ok(None) => {}
            Err(e) => tracing::warn!(instance_id = %id, error = %e, "failed to record give-up"),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::testing::TestEnv;

    async fn wait_idle(monitor: &HealthMonitor, id: Uuid) {
        for _ in 0..200 {
            if !monitor.tracker(id).restarting {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("restart did not finish");
    }

    #[tokio::test]
    async fn three_failures_trigger_exactly_one_restart() {
        let env = TestEnv::builder()
            .command("/bin/sh", &["-c", "sleep 30"])
            .configure(|c| {
                c.restart_backoff = Duration::from_millis(200);
                c.restart_backoff_max = Duration::from_millis(200);
            })
            .build()
            .await;
        let inst = env.create_instance("a").await;
        env.registry
            .update(
                inst.id,
                crate::registry::InstancePatch {
                    auto_start: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        env.supervisor.start(inst.id).await.unwrap();
        let pid_before = env.supervisor.runtime_info(inst.id).unwrap().pid;

        env.probe.healthy.store(false, Ordering::SeqCst);
        env.monitor.sweep().await;
        env.monitor.sweep().await;
        assert_eq!(env.monitor.tracker(inst.id).consecutive_failures, 2);
        assert_eq!(
            env.registry.get(inst.id).await.unwrap().health,
            HealthStatus::Unhealthy
        );
        assert_eq!(env.monitor.tracker(inst.id).restarts_total, 0);

        env.monitor.sweep().await;
        assert!(env.monitor.tracker(inst.id).restarting);
        env.probe.healthy.store(true, Ordering::SeqCst);
        wait_idle(&env.monitor, inst.id).await;

        let t = env.monitor.tracker(inst.id);
        assert_eq!(t.restarts_total, 1);
        assert_eq!(t.consecutive_failures, 0);
        let after = env.registry.get(inst.id).await.unwrap();
        assert_eq!(after.status, InstanceStatus::Running);
        assert_ne!(env.supervisor.runtime_info(inst.id).unwrap().pid, pid_before);

        env.monitor.sweep().await;
        assert_eq!(env.monitor.tracker(inst.id).auto_restarts, 0);
        env.supervisor.stop(inst.id).await.unwrap();
    }

    #[tokio::test]
    async fn failing_instance_without_auto_start_is_left_alone() {
        let env = TestEnv::builder()
            .command("/bin/sh", &["-c", "sleep 30"])
            .build()
            .await;
        let inst = env.create_instance("a").await;
        env.supervisor.start(inst.id).await.unwrap();
        env.probe.healthy.store(false, Ordering::SeqCst);
        for _ in 0..5 {
            env.monitor.sweep().await;
        }
        let t = env.monitor.tracker(inst.id);
        assert_eq!(t.consecutive_failures, 5);
        assert_eq!(t.restarts_total, 0);
        assert_eq!(
            env.registry.get(inst.id).await.unwrap().status,
            InstanceStatus::Running
        );
        env.supervisor.stop(inst.id).await.unwrap();
    }

    #[tokio::test]
    async fn restart_budget_is_bounded() {
        let env = TestEnv::builder()
            .command("/bin/sh", &["-c", "sleep 30"])
            .configure(|c| {
                c.start_timeout = Duration::from_millis(300);
                c.restart_backoff = Duration::from_millis(10);
                c.restart_backoff_max = Duration::from_millis(20);
                c.max_auto_restarts = 2;
            })
            .build()
            .await;
        let inst = env.create_instance("a").await;
        env.registry
            .update(
                inst.id,
                crate::registry::InstancePatch {
                    auto_start: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        env.supervisor.start(inst.id).await.unwrap();

        env.probe.healthy.store(false, Ordering::SeqCst);
        for _ in 0..3 {
            env.monitor.sweep().await;
        }
        wait_idle(&env.monitor, inst.id).await;

        let t = env.monitor.tracker(inst.id);
        assert_eq!(t.restarts_total, 2);
        let after = env.registry.get(inst.id).await.unwrap();
        assert_eq!(after.status, InstanceStatus::Error);
        assert!(env.supervisor.live_port(inst.id).is_none());
    }

    async fn auto_start_env(tweak: impl FnOnce(&mut ControlConfig) + Send + 'static) -> (TestEnv, Uuid) {
        let env = TestEnv::builder()
            .command("/bin/sh", &["-c", "sleep 30"])
            .configure(tweak)
            .build()
            .await;
        let inst = env.create_instance("a").await;
        env.registry
            .update(
                inst.id,
                crate::registry::InstancePatch {
                    auto_start: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        env.supervisor.start(inst.id).await.unwrap();
        (env, inst.id)
    }

    #[tokio::test]
    async fn stop_during_backoff_is_not_undone() {
        let (env, id) = auto_start_env(|c| {
            c.restart_backoff = Duration::from_millis(800);
            c.restart_backoff_max = Duration::from_millis(800);
        })
        .await;

        env.probe.healthy.store(false, Ordering::SeqCst);
        for _ in 0..3 {
            env.monitor.sweep().await;
        }
        assert!(env.monitor.tracker(id).restarting);

        env.supervisor.stop(id).await.unwrap();
        wait_idle(&env.monitor, id).await;

        let after = env.registry.get(id).await.unwrap();
        assert_eq!(after.status, InstanceStatus::Stopped);
        assert!(env.supervisor.live_port(id).is_none());
    }

    #[tokio::test]
    async fn reset_abandons_pending_restart() {
        let (env, id) = auto_start_env(|c| {
            c.restart_backoff = Duration::from_millis(500);
            c.restart_backoff_max = Duration::from_millis(500);
        })
        .await;
        let pid = env.supervisor.runtime_info(id).unwrap().pid;

        env.probe.healthy.store(false, Ordering::SeqCst);
        for _ in 0..3 {
            env.monitor.sweep().await;
        }
        env.monitor.reset(id);
        let t = env.monitor.tracker(id);
        assert!(!t.restarting);
        assert_eq!(t.consecutive_failures, 0);
        assert_eq!(t.auto_restarts, 0);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(env.supervisor.runtime_info(id).unwrap().pid, pid);
        assert_eq!(env.registry.get(id).await.unwrap().status, InstanceStatus::Running);
        env.supervisor.stop(id).await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_budget_stops_a_still_running_instance() {
        let (env, id) = auto_start_env(|c| {
            c.restart_backoff = Duration::from_millis(10);
            c.restart_backoff_max = Duration::from_millis(10);
            c.max_auto_restarts = 1;
        })
        .await;

        // Round one: probes fail, the restart itself comes up healthy.
        env.probe.healthy.store(false, Ordering::SeqCst);
        for _ in 0..3 {
            env.monitor.sweep().await;
        }
        env.probe.healthy.store(true, Ordering::SeqCst);
        wait_idle(&env.monitor, id).await;
        assert_eq!(env.registry.get(id).await.unwrap().status, InstanceStatus::Running);
        assert_eq!(env.monitor.tracker(id).auto_restarts, 1);

        // Round two fails again before any healthy sweep: budget is spent.
        env.probe.healthy.store(false, Ordering::SeqCst);
        for _ in 0..3 {
            env.monitor.sweep().await;
        }
        wait_idle(&env.monitor, id).await;

        let after = env.registry.get(id).await.unwrap();
        assert_eq!(after.status, InstanceStatus::Error);
        assert_eq!(after.health, HealthStatus::Unhealthy);
        assert!(after.last_error.unwrap().contains("gave up"));
        assert!(env.supervisor.live_port(id).is_none());
        assert!(env.supervisor.runtime_info(id).unwrap().pid.is_none());
        assert_eq!(env.monitor.tracker(id).restarts_total, 1);
    }

    #[tokio::test]
    async fn transitioning_instances_are_skipped() {
        let env = TestEnv::builder()
            .command("/bin/sh", &["-c", "sleep 30"])
            .build()
            .await;
        let inst = env.create_instance("a").await;
        env.registry
            .set_status(inst.id, InstanceStatus::Stopping, None)
            .await
            .unwrap();
        env.probe.healthy.store(false, Ordering::SeqCst);
        env.monitor.sweep().await;
        assert_eq!(env.probe.calls.load(Ordering::SeqCst), 0);
        assert_eq!(env.monitor.tracker(inst.id).consecutive_failures, 0);
    }
}
