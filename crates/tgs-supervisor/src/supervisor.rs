use std::{
    fmt, io,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use futures::{future::BoxFuture, FutureExt};
use serde::Serialize;
use tgs_core::{
    backoff::{Backoff, BackoffPolicy},
    config::{persist_config, ServiceConfig, SupervisorSettings},
    domain::WorkerStatus,
    utils::{format_uptime, iso_timestamp_utc},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Child,
    sync::{oneshot, watch, Mutex, RwLock},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

use crate::{invocation::WorkerInvocation, tail::OutputTail};

/// How long the OS gets to reap the worker after a forced kill.
const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn worker {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("worker pid {pid} did not exit after a forced kill")]
    Unkillable { pid: u32 },

    #[error("failed to persist config: {0}")]
    Persist(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    AlreadyRunning { pid: u32 },
}

impl StartOutcome {
    pub fn pid(self) -> u32 {
        match self {
            StartOutcome::Started { pid } | StartOutcome::AlreadyRunning { pid } => pid,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// `forced` is set when the grace period ran out and the worker was killed.
    Stopped { forced: bool },
    AlreadyStopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetConfigOutcome {
    pub restart_scheduled: bool,
}

/// How the last worker process ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExitRecord {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub at: String,
    /// False when the worker died without being asked to.
    pub expected: bool,
}

impl ExitRecord {
    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            at: iso_timestamp_utc(),
            expected: false,
        }
    }

    fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
            at: iso_timestamp_utc(),
            expected: false,
        }
    }
}

impl fmt::Display for ExitRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "signal {sig}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Point-in-time view of the worker, computed under the state lock.
#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    pub status: WorkerStatus,
    pub pid: Option<u32>,
    pub uptime: String,
    pub uptime_secs: u64,
    pub started_at: Option<String>,
    pub restarts: u64,
    pub last_exit: Option<ExitRecord>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SupervisorInfo {
    pub service: &'static str,
    pub version: &'static str,
    pub architecture: &'static str,
    pub supervisor_pid: u32,
    pub management_port: u16,
    pub worker_port: u16,
    pub worker_bin: String,
    pub restart_on_crash: bool,
    pub config_file: Option<String>,
}

struct TrackedProcess {
    pid: u32,
    generation: u64,
    started_at: DateTime<Utc>,
    started: Instant,
    exited: watch::Receiver<Option<ExitRecord>>,
    kill: Option<oneshot::Sender<()>>,
}

struct PendingRestart {
    id: u64,
    cancel: CancellationToken,
}

struct State {
    status: WorkerStatus,
    config: ServiceConfig,
    process: Option<TrackedProcess>,
    generation: u64,
    restarts: u64,
    last_exit: Option<ExitRecord>,
    crash_backoff: Backoff,
    pending: Option<PendingRestart>,
    pending_seq: u64,
}

impl State {
    /// Register a restart, replacing and cancelling any earlier one.
    fn queue_restart(&mut self) -> (u64, CancellationToken) {
        let cancel = CancellationToken::new();
        self.pending_seq += 1;
        let id = self.pending_seq;
        let previous = self.pending.replace(PendingRestart {
            id,
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        (id, cancel)
    }
}

struct Inner {
    settings: SupervisorSettings,
    /// Serializes start/stop/restart/set_config. Never taken while holding `state`.
    lifecycle: Mutex<()>,
    state: RwLock<State>,
    tail: Arc<Mutex<OutputTail>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scheduled {
    ConfigRestart,
    CrashRestart,
}

/// Owns the worker process.
///
/// Lifecycle operations are strictly serialized. Readers (`status`, `config`, `logs`)
/// only take the shared state lock and never wait on a transition in progress.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(settings: SupervisorSettings, config: ServiceConfig) -> Self {
        Self::with_backoff(settings, config, BackoffPolicy::default())
    }

    pub fn with_backoff(
        settings: SupervisorSettings,
        config: ServiceConfig,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                lifecycle: Mutex::new(()),
                state: RwLock::new(State {
                    status: WorkerStatus::Stopped,
                    config,
                    process: None,
                    generation: 0,
                    restarts: 0,
                    last_exit: None,
                    crash_backoff: Backoff::new(policy),
                    pending: None,
                    pending_seq: 0,
                }),
                tail: Arc::new(Mutex::new(OutputTail::default())),
            }),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    /// Spawn the worker. Success without a second process when it already runs.
    pub async fn start(&self) -> Result<StartOutcome, SupervisorError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.cancel_pending().await;
        self.spawn_worker().await
    }

    /// SIGTERM, wait out the grace period, then kill. Success when already stopped.
    pub async fn stop(&self) -> Result<StopOutcome, SupervisorError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.cancel_pending().await;
        let outcome = self.stop_worker().await;
        // A crash noticed while stopping may have queued a restart.
        self.cancel_pending().await;
        outcome
    }

    /// Stop, settle, start. Ends `stopped` when the new process cannot be spawned.
    pub async fn restart(&self) -> Result<StartOutcome, SupervisorError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.cancel_pending().await;
        self.restart_worker().await
    }

    /// Replace the config. A running worker is restarted shortly after, in the background.
    pub async fn set_config(&self, cfg: ServiceConfig) -> Result<SetConfigOutcome, SupervisorError> {
        cfg.validate()
            .map_err(|e| SupervisorError::InvalidConfig(e.to_string()))?;

        let _lifecycle = self.inner.lifecycle.lock().await;
        self.cancel_pending().await;

        if let Some(path) = &self.inner.settings.config_file {
            persist_config(path, &cfg).map_err(|e| SupervisorError::Persist(e.to_string()))?;
        }

        tracing::info!(config = %cfg.redacted(), "config replaced");
        let running = {
            let mut st = self.inner.state.write().await;
            st.config = cfg;
            st.process.is_some()
        };

        if running {
            self.schedule(self.inner.settings.config_restart_delay, Scheduled::ConfigRestart)
                .await;
        }
        Ok(SetConfigOutcome {
            restart_scheduled: running,
        })
    }

    pub async fn config(&self) -> ServiceConfig {
        self.inner.state.read().await.config.clone()
    }

    pub async fn status(&self) -> StatusSnapshot {
        let st = self.inner.state.read().await;
        let (pid, started_at, uptime) = match &st.process {
            Some(p) => (
                Some(p.pid),
                Some(p.started_at.to_rfc3339()),
                p.started.elapsed(),
            ),
            None => (None, None, Duration::ZERO),
        };

        StatusSnapshot {
            status: st.status,
            pid,
            uptime: format_uptime(uptime),
            uptime_secs: uptime.as_secs(),
            started_at,
            restarts: st.restarts,
            last_exit: st.last_exit.clone(),
        }
    }

    /// Newest worker output lines.
    pub async fn logs(&self, limit: Option<usize>) -> Vec<String> {
        self.inner.tail.lock().await.lines(limit)
    }

    pub async fn info(&self) -> SupervisorInfo {
        let settings = &self.inner.settings;
        SupervisorInfo {
            service: "tgs-supervisor",
            version: env!("CARGO_PKG_VERSION"),
            architecture: "dual-process",
            supervisor_pid: std::process::id(),
            management_port: settings.management_port,
            worker_port: self.inner.state.read().await.config.port,
            worker_bin: settings.worker_bin.display().to_string(),
            restart_on_crash: settings.restart_on_crash,
            config_file: settings
                .config_file
                .as_ref()
                .map(|p| p.display().to_string()),
        }
    }

    /// Stop the worker for good. Pending restarts are dropped.
    pub async fn shutdown(&self) -> Result<StopOutcome, SupervisorError> {
        tracing::info!("supervisor shutting down, stopping worker");
        self.stop().await
    }

    async fn cancel_pending(&self) {
        if let Some(pending) = self.inner.state.write().await.pending.take() {
            pending.cancel.cancel();
        }
    }

    async fn spawn_worker(&self) -> Result<StartOutcome, SupervisorError> {
        let inv = {
            let mut st = self.inner.state.write().await;
            if let Some(p) = &st.process {
                if p.exited.borrow().is_none() {
                    return Ok(StartOutcome::AlreadyRunning { pid: p.pid });
                }
            }
            st.status = WorkerStatus::Starting;
            WorkerInvocation::new(&self.inner.settings.worker_bin, &st.config)
        };

        let mut child = match inv.command().spawn() {
            Ok(child) => child,
            Err(source) => {
                let mut st = self.inner.state.write().await;
                st.status = WorkerStatus::Stopped;
                st.process = None;
                let program = inv.program.display().to_string();
                tracing::error!(program = %program, error = %source, "failed to spawn worker");
                return Err(SupervisorError::Spawn { program, source });
            }
        };

        let pid = child.id().unwrap_or_default();
        if let Some(stdout) = child.stdout.take() {
            self.drain_output(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            self.drain_output(stderr, "stderr");
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        let generation = {
            let mut st = self.inner.state.write().await;
            st.generation += 1;
            let generation = st.generation;
            st.process = Some(TrackedProcess {
                pid,
                generation,
                started_at: Utc::now(),
                started: Instant::now(),
                exited: exit_rx,
                kill: Some(kill_tx),
            });
            st.status = WorkerStatus::Running;
            generation
        };

        tokio::spawn(self.clone().monitor(child, generation, exit_tx, kill_rx));
        tracing::info!(pid, program = %inv.program.display(), "worker started");
        Ok(StartOutcome::Started { pid })
    }

    async fn stop_worker(&self) -> Result<StopOutcome, SupervisorError> {
        let (pid, mut exited, kill) = {
            let mut st = self.inner.state.write().await;
            let Some(p) = st.process.as_mut() else {
                st.status = WorkerStatus::Stopped;
                return Ok(StopOutcome::AlreadyStopped);
            };
            let handles = (p.pid, p.exited.clone(), p.kill.take());
            st.status = WorkerStatus::Stopping;
            handles
        };

        let grace = self.inner.settings.stop_grace;
        let mut forced = false;
        let mut unkillable = false;

        if exited.borrow().is_none() {
            let graceful = match terminate(pid) {
                Ok(()) => timeout(grace, wait_exit(&mut exited)).await.is_ok(),
                Err(e) => {
                    tracing::warn!(pid, error = %e, "failed to send SIGTERM to worker");
                    false
                }
            };

            if !graceful {
                forced = true;
                tracing::warn!(pid, grace_ms = grace.as_millis() as u64, "worker still running, killing");
                if let Some(kill) = kill {
                    let _ = kill.send(());
                }
                unkillable = timeout(KILL_WAIT, wait_exit(&mut exited)).await.is_err();
            }
        }

        let record = exited.borrow().clone();
        {
            // The handle is dropped even for a process that would not die, so a later
            // start is never blocked by it.
            let mut st = self.inner.state.write().await;
            st.process = None;
            st.status = WorkerStatus::Stopped;
            if let Some(mut record) = record {
                record.expected = true;
                st.last_exit = Some(record);
            }
        }

        if unkillable {
            tracing::error!(pid, "worker did not exit after kill");
            return Err(SupervisorError::Unkillable { pid });
        }
        tracing::info!(pid, forced, "worker stopped");
        Ok(StopOutcome::Stopped { forced })
    }

    async fn restart_worker(&self) -> Result<StartOutcome, SupervisorError> {
        self.stop_worker().await?;
        sleep(self.inner.settings.restart_settle).await;
        let outcome = self.spawn_worker().await?;
        self.inner.state.write().await.restarts += 1;
        Ok(outcome)
    }

    fn drain_output<R>(&self, reader: R, stream: &'static str)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tail = self.inner.tail.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(target: "worker", stream, "{line}");
                tail.lock().await.push_line(line);
            }
        });
    }

    /// Owns the child until it exits. Boxed: it re-enters the supervisor on a crash.
    fn monitor(
        self,
        mut child: Child,
        generation: u64,
        exit_tx: watch::Sender<Option<ExitRecord>>,
        kill_rx: oneshot::Receiver<()>,
    ) -> BoxFuture<'static, ()> {
        async move {
            let waited = tokio::select! {
                res = child.wait() => Some(res),
                _ = kill_rx => None,
            };
            let waited = match waited {
                Some(res) => res,
                None => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(error = %e, "failed to kill worker");
                    }
                    child.wait().await
                }
            };

            let record = match waited {
                Ok(status) => ExitRecord::from_status(status),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to wait for worker");
                    ExitRecord::unknown()
                }
            };
            exit_tx.send_replace(Some(record.clone()));
            self.on_exit(generation, record).await;
        }
        .boxed()
    }

    async fn on_exit(&self, generation: u64, record: ExitRecord) {
        let (id, cancel, delay) = {
            let mut st = self.inner.state.write().await;
            let (pid, ran_for) = match &st.process {
                Some(p) if p.generation == generation => (p.pid, p.started.elapsed()),
                _ => return,
            };
            if st.status == WorkerStatus::Stopping {
                return;
            }

            tracing::warn!(pid, exit = %record, "worker exited unexpectedly");
            st.process = None;
            st.status = WorkerStatus::Stopped;
            st.last_exit = Some(record);

            if !self.inner.settings.restart_on_crash {
                return;
            }
            st.crash_backoff.record_run(ran_for);
            let delay = st.crash_backoff.next_delay();
            // Queued in the same write as `Stopped`: a stop that sees the worker gone
            // also sees, and cancels, the restart.
            let (id, cancel) = st.queue_restart();
            (id, cancel, delay)
        };

        tracing::info!(delay_ms = delay.as_millis() as u64, "scheduling worker restart");
        self.launch(id, cancel, delay, Scheduled::CrashRestart);
    }

    async fn schedule(&self, delay: Duration, op: Scheduled) {
        let (id, cancel) = self.inner.state.write().await.queue_restart();
        self.launch(id, cancel, delay, op);
    }

    fn launch(&self, id: u64, cancel: CancellationToken, delay: Duration, op: Scheduled) {
        let sup = self.clone();
        tokio::spawn(async move { sup.run_scheduled(id, cancel, delay, op).await });
    }

    async fn run_scheduled(&self, id: u64, cancel: CancellationToken, mut delay: Duration, op: Scheduled) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(delay) => {}
            }

            let _lifecycle = self.inner.lifecycle.lock().await;
            if cancel.is_cancelled() {
                return;
            }

            let result = match op {
                Scheduled::ConfigRestart => self.restart_worker().await,
                Scheduled::CrashRestart => self.spawn_worker().await,
            };

            let mut st = self.inner.state.write().await;
            match result {
                Ok(outcome) => {
                    if op == Scheduled::CrashRestart
                        && matches!(outcome, StartOutcome::Started { .. })
                    {
                        st.restarts += 1;
                    }
                    if st.pending.as_ref().is_some_and(|p| p.id == id) {
                        st.pending = None;
                    }
                    tracing::info!(pid = outcome.pid(), ?op, "worker restarted");
                    return;
                }
                Err(e) if op == Scheduled::CrashRestart => {
                    delay = st.crash_backoff.next_delay();
                    tracing::error!(error = %e, delay_ms = delay.as_millis() as u64, "worker restart failed, retrying");
                }
                Err(e) => {
                    if st.pending.as_ref().is_some_and(|p| p.id == id) {
                        st.pending = None;
                    }
                    tracing::error!(error = %e, "config restart failed, worker left stopped");
                    return;
                }
            }
        }
    }
}

async fn wait_exit(exited: &mut watch::Receiver<Option<ExitRecord>>) {
    // A closed channel means the monitor is gone, so the process is too.
    let _ = exited.wait_for(Option::is_some).await;
}

#[cfg(unix)]
fn terminate(pid: u32) -> io::Result<()> {
    // pid 0 would signal our whole process group.
    let pid = libc::pid_t::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid worker pid"))?;

    // SAFETY: kill(2) takes plain integers and has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "graceful stop needs unix signals",
    ))
}
