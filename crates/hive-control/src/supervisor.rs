use std::{
    collections::VecDeque,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hive_core::{HealthStatus, InstanceStatus};
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::{Mutex, Notify, mpsc, watch},
};
use uuid::Uuid;

use crate::agents::AgentConfigManager;
use crate::config::ControlConfig;
use crate::env::InstanceEnv;
use crate::error::{HiveError, HiveResult};
use crate::health::HealthProbe;
use crate::logs::{self, LogBuffer, LogSink, LogTail};
use crate::port_alloc::probe_tcp_port;
use crate::registry::{Instance, InstanceLayout, InstanceRegistry};

const INSTANCE_HOST: &str = "127.0.0.1";
const KILL_GRACE: Duration = Duration::from_secs(5);
const STARTUP_POLL: Duration = Duration::from_millis(250);
const PUMP_DRAIN: Duration = Duration::from_millis(500);
const STDERR_TAIL_LINES: usize = 20;
const STDERR_LINE_MAX: usize = 512;

/// Sent to the health monitor when a Running instance exits on its own.
#[derive(Debug, Clone)]
pub struct CrashEvent {
    pub instance_id: Uuid,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub at: DateTime<Utc>,
}

impl ExitInfo {
    fn from_status(res: &std::io::Result<ExitStatus>) -> Self {
        let (code, signal) = match res {
            Ok(st) => {
                #[cfg(unix)]
                let signal = std::os::unix::process::ExitStatusExt::signal(st);
                #[cfg(not(unix))]
                let signal = None;
                (st.code(), signal)
            }
            Err(_) => (None, None),
        };
        Self {
            code,
            signal,
            at: Utc::now(),
        }
    }

    fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(c), _) => format!("code {c}"),
            (None, Some(s)) => format!("signal {s}"),
            (None, None) => "unknown status".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeInfo {
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_exit: Option<ExitInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Running,
    Stopping,
}

struct Runtime {
    generation: u64,
    phase: Phase,
    alive: bool,
    pid: Option<u32>,
    port: Option<u16>,
    started_at: Option<DateTime<Utc>>,
    last_exit: Option<ExitInfo>,
    exit_rx: Option<watch::Receiver<Option<ExitInfo>>>,
    force_kill: Arc<Notify>,
    sink: Option<LogSink>,
    stderr_tail: VecDeque<String>,
}

/// One entry of the ownership table: the operation lock serializes
/// start/stop/restart/delete of a single instance.
struct Slot {
    op: Mutex<()>,
    runtime: std::sync::Mutex<Runtime>,
    logs: Arc<Mutex<LogBuffer>>,
}

impl Slot {
    fn new(max_lines: usize) -> Self {
        Self {
            op: Mutex::new(()),
            runtime: std::sync::Mutex::new(Runtime {
                generation: 0,
                phase: Phase::Idle,
                alive: false,
                pid: None,
                port: None,
                started_at: None,
                last_exit: None,
                exit_rx: None,
                force_kill: Arc::new(Notify::new()),
                sink: None,
                stderr_tail: VecDeque::new(),
            }),
            logs: Arc::new(Mutex::new(LogBuffer::new(max_lines))),
        }
    }

    fn rt(&self) -> std::sync::MutexGuard<'_, Runtime> {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum StartupOutcome {
    Healthy,
    Exited(ExitInfo),
    TimedOut,
}

struct Inner {
    cfg: Arc<ControlConfig>,
    registry: InstanceRegistry,
    agents: AgentConfigManager,
    probe: Arc<dyn HealthProbe>,
    slots: DashMap<Uuid, Arc<Slot>>,
    crash_tx: mpsc::UnboundedSender<CrashEvent>,
}

/// Owns every instance child process.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // Children must not outlive a crashed orchestrator.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

/// Signal the whole process group; children run in their own session.
#[cfg(unix)]
fn signal_group(pid: u32, sig: libc::c_int) {
    if let Ok(pgid) = i32::try_from(pid) {
        unsafe {
            libc::kill(-pgid, sig);
        }
    }
}

#[cfg(unix)]
fn send_term(pid: u32) {
    signal_group(pid, libc::SIGTERM);
}

#[cfg(not(unix))]
fn send_term(_pid: u32) {}

fn push_stderr(tail: &mut VecDeque<String>, line: &str) {
    let mut end = line.len().min(STDERR_LINE_MAX);
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    tail.push_back(line[..end].to_string());
    while tail.len() > STDERR_TAIL_LINES {
        tail.pop_front();
    }
}

async fn wait_exit(rx: &mut watch::Receiver<Option<ExitInfo>>, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, rx.wait_for(|v| v.is_some()))
        .await
        .is_ok_and(|r| r.is_ok())
}

impl Supervisor {
    pub fn new(
        cfg: Arc<ControlConfig>,
        registry: InstanceRegistry,
        agents: AgentConfigManager,
        probe: Arc<dyn HealthProbe>,
    ) -> (Self, mpsc::UnboundedReceiver<CrashEvent>) {
        let (crash_tx, crash_rx) = mpsc::unbounded_channel();
        let sup = Self {
            inner: Arc::new(Inner {
                cfg,
                registry,
                agents,
                probe,
                slots: DashMap::new(),
                crash_tx,
            }),
        };
        (sup, crash_rx)
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.inner.registry
    }

    /// Ownership entry for a known instance; unknown ids never get one.
    async fn slot(&self, id: Uuid) -> HiveResult<Arc<Slot>> {
        if let Some(slot) = self.inner.slots.get(&id) {
            return Ok(slot.clone());
        }
        self.inner.registry.get(id).await?;
        Ok(self
            .inner
            .slots
            .entry(id)
            .or_insert_with(|| Arc::new(Slot::new(self.inner.cfg.log_max_lines)))
            .clone())
    }

    /// True while a lifecycle operation holds the instance.
    pub fn is_busy(&self, id: Uuid) -> bool {
        self.inner
            .slots
            .get(&id)
            .map(|s| s.op.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Port of a process that passed its startup probe and is still alive.
    pub fn live_port(&self, id: Uuid) -> Option<u16> {
        let slot = self.inner.slots.get(&id)?.clone();
        let rt = slot.rt();
        (rt.alive && rt.phase == Phase::Running)
            .then_some(rt.port)
            .flatten()
    }

    pub fn runtime_info(&self, id: Uuid) -> Option<RuntimeInfo> {
        let slot = self.inner.slots.get(&id)?.clone();
        let rt = slot.rt();
        Some(RuntimeInfo {
            pid: rt.pid,
            started_at: rt.started_at,
            last_exit: rt.last_exit.clone(),
        })
    }

    pub async fn start(&self, id: Uuid) -> HiveResult<Instance> {
        let slot = self.slot(id).await?;
        let _op = slot.op.lock().await;
        self.start_locked(id, &slot).await
    }

    pub async fn stop(&self, id: Uuid) -> HiveResult<Instance> {
        let slot = self.slot(id).await?;
        let _op = slot.op.lock().await;
        self.stop_locked(id, &slot).await
    }

    /// Stop then start under one lock hold. A failed stop aborts before start.
    pub async fn restart(&self, id: Uuid) -> HiveResult<Instance> {
        let slot = self.slot(id).await?;
        let _op = slot.op.lock().await;
        self.stop_locked(id, &slot).await?;
        self.start_locked(id, &slot).await
    }

    /// Restart on behalf of the health monitor. Yields `None` without
    /// touching the process when the instance is no longer failing while
    /// Running or Error, e.g. an admin stopped it during the backoff.
    pub async fn recover(&self, id: Uuid) -> HiveResult<Option<Instance>> {
        let slot = self.slot(id).await?;
        let _op = slot.op.lock().await;
        let inst = self.inner.registry.get(id).await?;
        let failing = matches!(inst.status, InstanceStatus::Running | InstanceStatus::Error);
        if !inst.auto_start || !failing {
            return Ok(None);
        }
        self.stop_locked(id, &slot).await?;
        self.start_locked(id, &slot).await.map(Some)
    }

    /// Stop whatever is left of a failing instance and park it in Error.
    pub async fn halt(&self, id: Uuid, reason: String) -> HiveResult<Option<Instance>> {
        let slot = self.slot(id).await?;
        let _op = slot.op.lock().await;
        let inst = self.inner.registry.get(id).await?;
        if !matches!(inst.status, InstanceStatus::Running | InstanceStatus::Error) {
            return Ok(None);
        }
        let sink = slot.rt().sink.clone();
        if let Some(sink) = sink {
            sink.event(format!("halting: {reason}")).await;
        }
        self.stop_locked(id, &slot).await?;
        let reg = &self.inner.registry;
        reg.set_status(id, InstanceStatus::Error, Some(reason)).await?;
        reg.set_health(id, HealthStatus::Unhealthy).await?;
        reg.get(id).await.map(Some)
    }

    pub async fn delete(&self, id: Uuid) -> HiveResult<()> {
        let slot = self.slot(id).await?;
        let op = slot.op.lock().await;
        if slot.rt().alive {
            let status = self.inner.registry.get(id).await?.status;
            return Err(HiveError::InstanceMustBeStopped {
                id,
                status: status.to_string(),
            });
        }
        self.inner.registry.delete(id).await?;
        drop(op);
        self.inner.slots.remove(&id);
        self.inner.agents.forget_instance(id);
        Ok(())
    }

    pub async fn logs(&self, id: Uuid, cursor: u64, limit: usize) -> HiveResult<LogTail> {
        let limit = limit.clamp(1, 5000);
        let buffer = self.inner.slots.get(&id).map(|s| s.logs.clone());
        if let Some(buffer) = buffer {
            let (lines, next_cursor) = buffer.lock().await.tail_after(cursor, limit);
            if !lines.is_empty() || cursor != 0 {
                return Ok(LogTail {
                    lines,
                    next_cursor,
                    source: "memory",
                });
            }
        }

        let inst = self.inner.registry.get(id).await?;
        let lines = logs::tail_file(&inst.layout().console_log(), limit).await?;
        Ok(LogTail {
            lines,
            next_cursor: 0,
            source: "file",
        })
    }

    /// Stop every live process; used on orchestrator shutdown.
    pub async fn shutdown(&self) {
        let live: Vec<Uuid> = self
            .inner
            .slots
            .iter()
            .filter(|e| e.value().rt().alive)
            .map(|e| *e.key())
            .collect();
        let mut set = tokio::task::JoinSet::new();
        for id in live {
            let sup = self.clone();
            set.spawn(async move {
                if let Err(e) = sup.stop(id).await {
                    tracing::warn!(instance_id = %id, error = %e, "stop on shutdown failed");
                }
            });
        }
        while set.join_next().await.is_some() {}
    }

    async fn fail(&self, id: Uuid, err: &HiveError) {
        let reg = &self.inner.registry;
        if let Err(e) = reg
            .set_status(id, InstanceStatus::Error, Some(err.to_string()))
            .await
        {
            tracing::error!(instance_id = %id, error = %e, "failed to record start failure");
        }
        let _ = reg.set_health(id, HealthStatus::Unhealthy).await;
    }

    async fn ensure_port(&self, inst: &Instance) -> HiveResult<u16> {
        if probe_tcp_port(inst.port) {
            return Ok(inst.port);
        }
        tracing::warn!(instance_id = %inst.id, port = inst.port, "instance port held by another process");

        let ports = self.inner.registry.ports().clone();
        let mut held = Vec::new();
        let mut result = Err(HiveError::PortConflict { port: inst.port });
        for _ in 0..self.inner.cfg.port_conflict_retries {
            let Ok(candidate) = ports.allocate() else {
                break;
            };
            if !probe_tcp_port(candidate) {
                held.push(candidate);
                continue;
            }
            match self.inner.registry.set_port(inst.id, candidate).await {
                Ok(()) => {
                    ports.release(inst.port);
                    tracing::info!(
                        instance_id = %inst.id,
                        from = inst.port,
                        to = candidate,
                        "instance moved to a free port"
                    );
                    result = Ok(candidate);
                }
                Err(e) => {
                    ports.release(candidate);
                    result = Err(e);
                }
            }
            break;
        }
        for p in held {
            ports.release(p);
        }
        result
    }

    async fn build_env(&self, id: Uuid, layout: &InstanceLayout, port: u16) -> HiveResult<InstanceEnv> {
        let mut env = InstanceEnv::base(&self.inner.cfg.env_prefix, layout, port, INSTANCE_HOST)
            .with_host_passthrough(|k| std::env::var(k).ok());
        env.extend(self.inner.agents.render_env(id, layout).await?);
        Ok(env)
    }

    async fn start_locked(&self, id: Uuid, slot: &Arc<Slot>) -> HiveResult<Instance> {
        let inst = self.inner.registry.get(id).await?;
        let alive = slot.rt().alive;
        if alive && inst.status == InstanceStatus::Running {
            return Ok(inst);
        }
        if alive {
            tracing::warn!(instance_id = %id, status = %inst.status, "live process with stale status; killing");
            self.kill_and_reap(slot).await;
        }

        let reg = &self.inner.registry;
        reg.set_status(id, InstanceStatus::Starting, None).await?;
        reg.set_health(id, HealthStatus::Unknown).await?;

        let port = match self.ensure_port(&inst).await {
            Ok(p) => p,
            Err(e) => {
                self.fail(id, &e).await;
                return Err(e);
            }
        };

        let layout = inst.layout();
        let env = match self.build_env(id, &layout, port).await {
            Ok(env) => env,
            Err(e) => {
                self.fail(id, &e).await;
                return Err(e);
            }
        };
        for dir in [layout.db_dir(), layout.config_dir(), layout.worktrees_dir(), layout.logs_dir()] {
            if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                let err = HiveError::from(e);
                self.fail(id, &err).await;
                return Err(err);
            }
        }

        let sink = LogSink::new(
            slot.logs.clone(),
            logs::spawn_file_writer(layout.console_log()).await,
        );
        let cfg = &self.inner.cfg;
        sink.event(format!(
            "starting: {} {} (cwd {}) port={port}",
            cfg.instance_command,
            cfg.instance_args.join(" "),
            layout.root.display()
        ))
        .await;

        let mut cmd = Command::new(&cfg.instance_command);
        cmd.args(&cfg.instance_args)
            .current_dir(&layout.root)
            .env_clear()
            .envs(env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                let err =
                    HiveError::ProcessSpawnFailed(format!("{}: {e}", cfg.instance_command));
                sink.event(format!("spawn failed: {e}")).await;
                self.fail(id, &err).await;
                return Err(err);
            }
        };
        let pid = child.id();
        tracing::info!(instance_id = %id, port, pid = ?pid, "instance process spawned");

        let (exit_tx, mut exit_rx) = watch::channel(None);
        let (generation, force_kill) = {
            let mut rt = slot.rt();
            rt.generation += 1;
            rt.phase = Phase::Starting;
            rt.alive = true;
            rt.pid = pid;
            rt.port = Some(port);
            rt.started_at = Some(Utc::now());
            rt.exit_rx = Some(exit_rx.clone());
            rt.force_kill = Arc::new(Notify::new());
            rt.sink = Some(sink.clone());
            rt.stderr_tail.clear();
            (rt.generation, rt.force_kill.clone())
        };

        let mut pumps = Vec::new();
        if let Some(out) = child.stdout.take() {
            let sink = sink.clone();
            pumps.push(tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.emit(line).await;
                }
            }));
        }
        if let Some(err) = child.stderr.take() {
            let sink = sink.clone();
            let slot = slot.clone();
            pumps.push(tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    push_stderr(&mut slot.rt().stderr_tail, &line);
                    sink.emit(line).await;
                }
            }));
        }

        {
            let sup = self.clone();
            let slot = slot.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                let res = loop {
                    tokio::select! {
                        r = child.wait() => break r,
                        _ = force_kill.notified() => {
                            let _ = child.start_kill();
                        }
                    }
                };
                // Drain buffered output so the stderr tail is complete.
                let _ = tokio::time::timeout(PUMP_DRAIN, async {
                    for p in pumps {
                        let _ = p.await;
                    }
                })
                .await;
                sup.on_exit(id, slot, generation, ExitInfo::from_status(&res), exit_tx, sink)
                    .await;
            });
        }

        let timeout = cfg.start_timeout;
        let outcome = match tokio::time::timeout(timeout, self.await_startup(port, &mut exit_rx)).await {
            Ok(o) => o,
            Err(_) => StartupOutcome::TimedOut,
        };

        let outcome = match outcome {
            StartupOutcome::Healthy => {
                let mut rt = slot.rt();
                if rt.alive && rt.generation == generation {
                    rt.phase = Phase::Running;
                    StartupOutcome::Healthy
                } else {
                    StartupOutcome::Exited(rt.last_exit.clone().unwrap_or_else(|| ExitInfo {
                        code: None,
                        signal: None,
                        at: Utc::now(),
                    }))
                }
            }
            other => other,
        };

        match outcome {
            StartupOutcome::Healthy => {
                reg.set_status(id, InstanceStatus::Running, None).await?;
                reg.set_health(id, HealthStatus::Healthy).await?;
                sink.event(format!("healthy on port {port}")).await;
                tracing::info!(instance_id = %id, port, pid = ?pid, "instance running");
                reg.get(id).await
            }
            StartupOutcome::TimedOut => {
                sink.event(format!(
                    "not healthy within {}s; killing",
                    timeout.as_secs()
                ))
                .await;
                self.kill_and_reap(slot).await;
                let err = HiveError::HealthCheckTimeout {
                    id,
                    seconds: timeout.as_secs(),
                };
                tracing::warn!(instance_id = %id, port, "{err}");
                self.fail(id, &err).await;
                Err(err)
            }
            StartupOutcome::Exited(info) => {
                slot.rt().phase = Phase::Idle;
                let tail = slot.rt().stderr_tail.iter().cloned().collect::<Vec<_>>().join("\n");
                let mut msg = format!("exited during startup ({})", info.describe());
                if !tail.is_empty() {
                    msg.push_str(": ");
                    msg.push_str(&tail);
                }
                let err = HiveError::ProcessSpawnFailed(msg);
                tracing::warn!(instance_id = %id, exit = %info.describe(), "instance exited during startup");
                self.fail(id, &err).await;
                Err(err)
            }
        }
    }

    async fn await_startup(
        &self,
        port: u16,
        exit_rx: &mut watch::Receiver<Option<ExitInfo>>,
    ) -> StartupOutcome {
        loop {
            if let Some(info) = exit_rx.borrow().clone() {
                return StartupOutcome::Exited(info);
            }
            if self.inner.probe.probe(port).await {
                return StartupOutcome::Healthy;
            }
            tokio::select! {
                _ = tokio::time::sleep(STARTUP_POLL) => {}
                _ = exit_rx.changed() => {}
            }
        }
    }

    async fn stop_locked(&self, id: Uuid, slot: &Arc<Slot>) -> HiveResult<Instance> {
        let reg = &self.inner.registry;
        let inst = reg.get(id).await?;

        let (pid, exit_rx, sink) = {
            let mut rt = slot.rt();
            if !rt.alive {
                (None, None, None)
            } else {
                rt.phase = Phase::Stopping;
                (rt.pid, rt.exit_rx.clone(), rt.sink.clone())
            }
        };

        let Some(mut exit_rx) = exit_rx else {
            if inst.status != InstanceStatus::Stopped {
                let keep = (inst.status == InstanceStatus::Error)
                    .then(|| inst.last_error.clone())
                    .flatten();
                reg.set_status(id, InstanceStatus::Stopped, keep).await?;
                reg.set_health(id, HealthStatus::Unknown).await?;
                return reg.get(id).await;
            }
            return Ok(inst);
        };

        reg.set_status(id, InstanceStatus::Stopping, None).await?;
        let timeout = self.inner.cfg.stop_timeout;
        if let Some(sink) = &sink {
            sink.event(format!("stop requested (timeout {}s)", timeout.as_secs()))
                .await;
        }
        if let Some(pid) = pid {
            send_term(pid);
        }

        if !wait_exit(&mut exit_rx, timeout).await {
            if let Some(sink) = &sink {
                sink.event("did not exit in time; killing").await;
            }
            tracing::warn!(instance_id = %id, pid = ?pid, "graceful stop timed out; force-killing");
            self.kill_and_reap(slot).await;
        }

        slot.rt().phase = Phase::Idle;
        reg.set_status(id, InstanceStatus::Stopped, None).await?;
        reg.set_health(id, HealthStatus::Unknown).await?;
        tracing::info!(instance_id = %id, "instance stopped");
        reg.get(id).await
    }

    async fn kill_and_reap(&self, slot: &Arc<Slot>) {
        let (pid, exit_rx, force_kill) = {
            let mut rt = slot.rt();
            rt.phase = Phase::Stopping;
            (rt.pid, rt.exit_rx.clone(), rt.force_kill.clone())
        };
        #[cfg(unix)]
        if let Some(pid) = pid {
            signal_group(pid, libc::SIGKILL);
        }
        #[cfg(not(unix))]
        let _ = pid;
        force_kill.notify_one();
        if let Some(mut rx) = exit_rx {
            if !wait_exit(&mut rx, KILL_GRACE).await {
                tracing::error!(pid = ?pid, "process did not exit after SIGKILL");
            }
        }
    }

    async fn on_exit(
        &self,
        id: Uuid,
        slot: Arc<Slot>,
        generation: u64,
        info: ExitInfo,
        exit_tx: watch::Sender<Option<ExitInfo>>,
        sink: LogSink,
    ) {
        let crashed = {
            let mut rt = slot.rt();
            if rt.generation != generation {
                return;
            }
            rt.alive = false;
            rt.pid = None;
            rt.last_exit = Some(info.clone());
            let crashed = rt.phase == Phase::Running;
            if crashed {
                rt.phase = Phase::Idle;
            }
            crashed
        };
        let _ = exit_tx.send(Some(info.clone()));
        sink.event(format!("process exited ({})", info.describe())).await;
        if !crashed {
            return;
        }

        // Let any in-flight operation finish; it owns the status.
        let _op = slot.op.lock().await;
        if slot.rt().generation != generation {
            return;
        }
        match self.inner.registry.get(id).await {
            Ok(inst) if inst.status == InstanceStatus::Running => {}
            _ => return,
        }

        let tail = slot.rt().stderr_tail.iter().cloned().collect::<Vec<_>>().join("\n");
        let mut msg = format!("exited unexpectedly ({})", info.describe());
        if !tail.is_empty() {
            msg.push_str(": ");
            msg.push_str(&tail);
        }
        tracing::warn!(instance_id = %id, exit = %info.describe(), "instance crashed");
        let reg = &self.inner.registry;
        if let Err(e) = reg.set_status(id, InstanceStatus::Error, Some(msg)).await {
            tracing::error!(instance_id = %id, error = %e, "failed to record crash");
        }
        let _ = reg.set_health(id, HealthStatus::Unhealthy).await;
        let _ = self.inner.crash_tx.send(CrashEvent {
            instance_id: id,
            exit_code: info.code,
        });
    }
}


#[cfg(test)]
impl Supervisor {
    pub(crate) fn has_slot(&self, id: Uuid) -> bool {
        self.inner.slots.contains_key(&id)
    }
}
