//! Per-model process lifecycle.
//!
//! Each [`Process`] owns one upstream child: it spawns it on demand, pumps
//! its output into the log buffer and the memory tracker, health-checks it
//! to readiness, reverse-proxies requests to it, and tears it down on stop,
//! eviction, idle timeout, or shutdown.
//!
//! State machine: `Stopped → Starting → Ready → Stopping → Stopped`, with
//! `Shutdown` as the terminal state. Only these transitions are legal; all
//! of them go through the state watch channel so concurrent starters and
//! the scheduler can await the outcome.

use crate::config::{FitPolicy, LogStdout, ModelConfig, expand_macros_unchecked};
use crate::events::{Event, EventBus};
use crate::logbuffer::LogBuffer;
use crate::memory::{MemoryFootprint, MemoryTracker, signature_for_model};
use crate::metrics::{TokenMetrics, UsageScanner};
use crate::scheduler::SchedulerError;
use axum::body::Body;
use bytes::Bytes;
use hyper::{Request, Response, Uri};
use futures_util::future::BoxFuture;
use http_body::Frame;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use metrics::{counter, gauge, histogram};
use std::collections::HashMap;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Notify, Semaphore, watch};
// tokio's Instant so paused-time tests drive the TTL and LRU clocks.
use tokio::time::Instant;
use tracing::{debug, info, warn};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// How long `stop()` waits for in-flight requests to drain.
const DRAIN_GRACE: Duration = Duration::from_secs(30);
/// How long a terminated child gets before SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Starting,
    Ready,
    Stopping,
    Shutdown,
}

impl ProcessState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Ready => "ready",
            ProcessState::Stopping => "stopping",
            ProcessState::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStrategy {
    Graceful,
    Immediate,
}

#[derive(Debug, Clone, Error)]
pub enum ProcessError {
    #[error("process is shut down")]
    Shutdown,

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("failed to spawn upstream: {0}")]
    Spawn(String),

    #[error("upstream did not become ready within {0}s")]
    StartTimeout(u64),

    #[error("upstream failed during startup: {0}")]
    Health(String),

    #[error("upstream start failed: {0}")]
    StartFailed(String),

    #[error("process was stopped before the request could be proxied")]
    NotReady,

    #[error("upstream request failed: {0}")]
    Upstream(String),
}

/// Admission hook run at the `Stopped → Starting` boundary; bound to the
/// scheduler by the proxy manager.
pub type PreStartHook =
    Arc<dyn Fn(Process) -> BoxFuture<'static, Result<(), SchedulerError>> + Send + Sync>;

struct ProcessInner {
    id: String,
    config: ModelConfig,
    signature: String,
    health_check_timeout: Duration,
    log_to_stdout: LogStdout,

    state_tx: watch::Sender<ProcessState>,
    start_lock: Mutex<()>,
    start_generation: AtomicU64,
    last_start_error: StdMutex<Option<ProcessError>>,

    child: Mutex<Option<Child>>,

    in_flight: AtomicUsize,
    in_flight_changed: Notify,
    last_request_handled: StdMutex<Instant>,

    assigned_gpu: AtomicI32,
    runtime_env: StdMutex<HashMap<String, String>>,

    pre_start_hook: StdRwLock<Option<PreStartHook>>,
    concurrency: Option<Arc<Semaphore>>,

    tracker: Arc<MemoryTracker>,
    events: EventBus,
    upstream_logs: Arc<LogBuffer>,

    client: Client<HttpConnector, Body>,
}

pub struct Process {
    inner: Arc<ProcessInner>,
}

impl Clone for Process {
    fn clone(&self) -> Self {
        Process {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Non-owning handle, used by the scheduler's process provider to avoid a
/// reference cycle (process → hook → scheduler → provider → process).
pub struct WeakProcess(Weak<ProcessInner>);

impl WeakProcess {
    pub fn upgrade(&self) -> Option<Process> {
        self.0.upgrade().map(|inner| Process { inner })
    }
}

impl Process {
    pub fn new(
        id: &str,
        config: ModelConfig,
        health_check_timeout: Duration,
        log_to_stdout: LogStdout,
        tracker: Arc<MemoryTracker>,
        events: EventBus,
        upstream_logs: Arc<LogBuffer>,
    ) -> Self {
        let signature = signature_for_model(id, &config.cmd);
        let concurrency = if config.concurrency_limit > 0 {
            Some(Arc::new(Semaphore::new(config.concurrency_limit)))
        } else {
            None
        };
        let (state_tx, _) = watch::channel(ProcessState::Stopped);

        Process {
            inner: Arc::new(ProcessInner {
                id: id.to_string(),
                config,
                signature,
                health_check_timeout,
                log_to_stdout,
                state_tx,
                start_lock: Mutex::new(()),
                start_generation: AtomicU64::new(0),
                last_start_error: StdMutex::new(None),
                child: Mutex::new(None),
                in_flight: AtomicUsize::new(0),
                in_flight_changed: Notify::new(),
                last_request_handled: StdMutex::new(Instant::now()),
                assigned_gpu: AtomicI32::new(-1),
                runtime_env: StdMutex::new(HashMap::new()),
                pre_start_hook: StdRwLock::new(None),
                concurrency,
                tracker,
                events,
                upstream_logs,
                client: Client::builder(TokioExecutor::new()).build_http(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &ModelConfig {
        &self.inner.config
    }

    pub fn signature(&self) -> &str {
        &self.inner.signature
    }

    pub fn fit_policy(&self) -> FitPolicy {
        self.inner.config.fit_policy()
    }

    pub fn state(&self) -> ProcessState {
        *self.inner.state_tx.borrow()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn last_request_handled(&self) -> Instant {
        *self
            .inner
            .last_request_handled
            .lock()
            .expect("last request lock poisoned")
    }

    pub fn assigned_gpu(&self) -> i32 {
        self.inner.assigned_gpu.load(Ordering::SeqCst)
    }

    pub fn set_assigned_gpu(&self, index: i32) {
        self.inner.assigned_gpu.store(index, Ordering::SeqCst);
    }

    pub fn insert_runtime_env(&self, key: &str, value: String) {
        self.inner
            .runtime_env
            .lock()
            .expect("runtime env lock poisoned")
            .insert(key.to_string(), value);
    }

    pub fn runtime_env(&self) -> HashMap<String, String> {
        self.inner
            .runtime_env
            .lock()
            .expect("runtime env lock poisoned")
            .clone()
    }

    pub fn set_pre_start_hook(&self, hook: PreStartHook) {
        *self
            .inner
            .pre_start_hook
            .write()
            .expect("pre-start hook lock poisoned") = Some(hook);
    }

    pub fn downgrade(&self) -> WeakProcess {
        WeakProcess(Arc::downgrade(&self.inner))
    }

    /// Measured VRAM in MB: tracker value, or the config hint until the
    /// first live observation arrives.
    pub fn measured_vram_mb(&self) -> u64 {
        match self.inner.tracker.get(&self.inner.signature) {
            Some(footprint) => footprint.vram_mb,
            None => self.inner.config.initial_vram_mb,
        }
    }

    /// Measured host RAM in MB, with the same fallback rule.
    pub fn measured_cpu_mb(&self) -> u64 {
        match self.inner.tracker.get(&self.inner.signature) {
            Some(footprint) => footprint.cpu_mb,
            None => self.inner.config.initial_cpu_mb,
        }
    }

    /// The live-observed footprint only; `None` until a log line matched.
    pub fn runtime_footprint(&self) -> Option<MemoryFootprint> {
        self.inner.tracker.get(&self.inner.signature)
    }

    fn try_transition(&self, from: &[ProcessState], to: ProcessState) -> bool {
        let mut moved = false;
        self.inner.state_tx.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                moved = true;
                true
            } else {
                false
            }
        });
        if moved {
            debug!(model = %self.inner.id, state = to.as_str(), "State changed");
            self.inner.events.publish(Event::ProcessStateChanged {
                model: self.inner.id.clone(),
                state: to,
            });
        }
        moved
    }

    /// Ensure the process is `Ready`. Concurrent callers coalesce: the first
    /// one kicks off the transition, everyone waits on the state channel and
    /// shares the outcome.
    pub async fn start(&self) -> Result<(), ProcessError> {
        loop {
            let mut rx = self.inner.state_tx.subscribe();
            let seen = *rx.borrow_and_update();
            match seen {
                ProcessState::Ready => return Ok(()),
                ProcessState::Shutdown => return Err(ProcessError::Shutdown),
                ProcessState::Starting | ProcessState::Stopping => {
                    let settled = *rx
                        .wait_for(|s| {
                            matches!(
                                s,
                                ProcessState::Ready
                                    | ProcessState::Stopped
                                    | ProcessState::Shutdown
                            )
                        })
                        .await
                        .map_err(|_| ProcessError::Shutdown)?;
                    match settled {
                        ProcessState::Ready => return Ok(()),
                        ProcessState::Shutdown => return Err(ProcessError::Shutdown),
                        _ if seen == ProcessState::Starting => {
                            // Shared failure of the start we were waiting on.
                            let err = self
                                .inner
                                .last_start_error
                                .lock()
                                .expect("start error lock poisoned")
                                .clone();
                            return Err(err.unwrap_or(ProcessError::NotReady));
                        }
                        // Stopping settled into Stopped: retry the start.
                        _ => continue,
                    }
                }
                ProcessState::Stopped => {
                    {
                        let _guard = self.inner.start_lock.lock().await;
                        if self.state() != ProcessState::Stopped {
                            continue;
                        }
                        if !self.try_transition(&[ProcessState::Stopped], ProcessState::Starting)
                        {
                            continue;
                        }
                        *self
                            .inner
                            .last_start_error
                            .lock()
                            .expect("start error lock poisoned") = None;
                        // Run the actual start on its own task so a
                        // disconnecting client cannot abort it halfway through.
                        let process = self.clone();
                        tokio::spawn(async move { process.run_start_supervised().await });
                    }
                    let settled = *rx
                        .wait_for(|s| {
                            matches!(
                                s,
                                ProcessState::Ready
                                    | ProcessState::Stopped
                                    | ProcessState::Shutdown
                            )
                        })
                        .await
                        .map_err(|_| ProcessError::Shutdown)?;
                    return match settled {
                        ProcessState::Ready => Ok(()),
                        ProcessState::Shutdown => Err(ProcessError::Shutdown),
                        _ => {
                            let err = self
                                .inner
                                .last_start_error
                                .lock()
                                .expect("start error lock poisoned")
                                .clone();
                            Err(err.unwrap_or(ProcessError::NotReady))
                        }
                    };
                }
            }
        }
    }

    async fn run_start_supervised(&self) {
        let started = Instant::now();
        match self.run_start().await {
            Ok(()) => {
                histogram!("modelmux_start_duration_seconds", "model" => self.inner.id.clone())
                    .record(started.elapsed().as_secs_f64());
                counter!("modelmux_starts_total", "model" => self.inner.id.clone(), "outcome" => "ok")
                    .increment(1);
            }
            Err(e) => {
                warn!(model = %self.inner.id, error = %e, "Start failed");
                *self
                    .inner
                    .last_start_error
                    .lock()
                    .expect("start error lock poisoned") = Some(e);
                self.kill_child_group().await;
                self.release_assignment();
                self.try_transition(&[ProcessState::Starting], ProcessState::Stopped);
                counter!("modelmux_starts_total", "model" => self.inner.id.clone(), "outcome" => "error")
                    .increment(1);
            }
        }
    }

    async fn run_start(&self) -> Result<(), ProcessError> {
        let generation = self.inner.start_generation.fetch_add(1, Ordering::SeqCst) + 1;

        // Scheduler admission and placement; its error aborts the start.
        let hook = self
            .inner
            .pre_start_hook
            .read()
            .expect("pre-start hook lock poisoned")
            .clone();
        if let Some(hook) = hook {
            hook(self.clone()).await?;
        }

        let argv = split_command(&self.inner.config.cmd)
            .map_err(|e| ProcessError::Spawn(format!("bad cmd: {e}")))?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ProcessError::Spawn("empty cmd".to_string()))?;

        info!(model = %self.inner.id, cmd = %self.inner.config.cmd, "Starting upstream process");

        // Own process group so stop paths can signal the whole child tree.
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(self.runtime_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        for entry in &self.inner.config.env {
            if let Some((key, value)) = entry.split_once('=') {
                cmd.env(key, value);
            } else {
                warn!(model = %self.inner.id, entry = %entry, "Ignoring malformed env entry");
            }
        }

        let mut child = cmd.spawn().map_err(|e| ProcessError::Spawn(e.to_string()))?;

        if let Some(stdout) = child.stdout.take() {
            self.spawn_log_pump(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_log_pump(stderr, "stderr");
        }

        {
            let mut slot = self.inner.child.lock().await;
            *slot = Some(child);
        }

        self.wait_until_healthy().await?;

        if !self.try_transition(&[ProcessState::Starting], ProcessState::Ready) {
            // Evicted or shut down while the health check was passing.
            return Err(ProcessError::StartFailed(
                "stopped during startup".to_string(),
            ));
        }

        *self
            .inner
            .last_request_handled
            .lock()
            .expect("last request lock poisoned") = Instant::now();
        self.spawn_ttl_loop(generation);

        info!(model = %self.inner.id, "Upstream process is ready");
        Ok(())
    }

    async fn wait_until_healthy(&self) -> Result<(), ProcessError> {
        let url: Uri = format!(
            "{}{}",
            self.inner.config.proxy_url.trim_end_matches('/'),
            self.inner.config.check_endpoint
        )
        .parse()
        .map_err(|e| ProcessError::Spawn(format!("bad health URL: {e}")))?;

        let deadline = Instant::now() + self.inner.health_check_timeout;
        loop {
            if self.state() != ProcessState::Starting {
                return Err(ProcessError::StartFailed(
                    "stopped during startup".to_string(),
                ));
            }

            // A dead child will never become healthy.
            {
                let mut slot = self.inner.child.lock().await;
                if let Some(child) = slot.as_mut()
                    && let Ok(Some(status)) = child.try_wait()
                {
                    return Err(ProcessError::Health(format!(
                        "process exited with {status}"
                    )));
                }
            }

            let request = Request::builder()
                .method("GET")
                .uri(url.clone())
                .body(Body::empty())
                .map_err(|e| ProcessError::Spawn(e.to_string()))?;
            match self.inner.client.request(request).await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    debug!(model = %self.inner.id, status = %response.status(), "Not ready yet");
                }
                Err(e) => {
                    debug!(model = %self.inner.id, error = %e, "Health check not reachable yet");
                }
            }

            if Instant::now() >= deadline {
                return Err(ProcessError::StartTimeout(
                    self.inner.health_check_timeout.as_secs(),
                ));
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    fn spawn_log_pump(
        &self,
        stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
        name: &'static str,
    ) {
        let process = self.clone();
        tokio::spawn(async move {
            let reader = BufReader::new(stream);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let clean = strip_ansi(&line);
                if clean.is_empty() {
                    continue;
                }
                process.inner.upstream_logs.append(&clean);
                if process.inner.log_to_stdout.upstream_enabled() {
                    info!(target: "upstream", model = %process.inner.id, stream = name, "{}", clean);
                } else {
                    debug!(target: "upstream", model = %process.inner.id, stream = name, "{}", clean);
                }
                if let Some(footprint) = process
                    .inner
                    .tracker
                    .observe(&process.inner.signature, &clean)
                {
                    debug!(
                        model = %process.inner.id,
                        vram_mb = footprint.vram_mb,
                        cpu_mb = footprint.cpu_mb,
                        "Memory footprint updated"
                    );
                }
            }
        });
    }

    fn spawn_ttl_loop(&self, generation: u64) {
        let ttl = self.inner.config.ttl;
        if ttl == 0 {
            return;
        }
        let ttl = Duration::from_secs(ttl);
        let process = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if process.state() != ProcessState::Ready
                    || process.inner.start_generation.load(Ordering::SeqCst) != generation
                {
                    return;
                }
                if process.in_flight() == 0 && process.last_request_handled().elapsed() >= ttl {
                    info!(model = %process.inner.id, ttl_secs = ttl.as_secs(), "Idle TTL expired, unloading");
                    process.stop().await;
                    return;
                }
            }
        });
    }

    /// Reverse-proxy one request. Ensures `Ready` first (which may start the
    /// process and engage the scheduler), then streams the upstream response
    /// through. The in-flight count covers the full response body.
    pub async fn proxy_request(
        &self,
        request: Request<Body>,
    ) -> Result<Response<Body>, ProcessError> {
        self.start().await?;

        let guard = InFlightGuard::acquire(self);
        if self.state() != ProcessState::Ready {
            // Evicted between the readiness check and the forward.
            return Err(ProcessError::NotReady);
        }

        let permit = match &self.inner.concurrency {
            Some(semaphore) => Some(
                Arc::clone(semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| ProcessError::NotReady)?,
            ),
            None => None,
        };

        let started = Instant::now();
        let response = self
            .forward(request)
            .await
            .map_err(|e| ProcessError::Upstream(e.to_string()))?;

        if response.status().is_server_error() {
            debug!(model = %self.inner.id, status = %response.status(), "Upstream error passed through");
        }

        let (parts, body) = response.into_parts();
        let guarded = GuardedBody {
            inner: body,
            scanner: UsageScanner::new(),
            finisher: Some(RequestFinisher {
                model: self.inner.id.clone(),
                started,
                events: self.inner.events.clone(),
                _guard: guard,
                _permit: permit,
            }),
        };
        Ok(Response::from_parts(parts, Body::new(guarded)))
    }

    async fn forward(
        &self,
        mut request: Request<Body>,
    ) -> Result<Response<Body>, hyper_util::client::legacy::Error> {
        let path_and_query = request
            .uri()
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| "/".to_string());
        let uri: Uri = format!(
            "{}{}",
            self.inner.config.proxy_url.trim_end_matches('/'),
            path_and_query
        )
        .parse()
        .expect("proxy URL validated at config load");

        *request.uri_mut() = uri;
        request.headers_mut().remove("host");

        let response = self.inner.client.request(request).await?;
        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, Body::new(body)))
    }

    /// Graceful stop: drain, terminate, escalate.
    pub async fn stop(&self) {
        if !self.try_transition(&[ProcessState::Ready], ProcessState::Stopping) {
            return;
        }

        let deadline = Instant::now() + DRAIN_GRACE;
        while self.in_flight() > 0 {
            let remaining = deadline.duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(model = %self.inner.id, in_flight = self.in_flight(), "Drain grace expired");
                break;
            }
            let _ = tokio::time::timeout(
                remaining.min(Duration::from_millis(250)),
                self.inner.in_flight_changed.notified(),
            )
            .await;
        }

        self.terminate_gracefully().await;
        self.release_assignment();
        self.try_transition(&[ProcessState::Stopping], ProcessState::Stopped);
        info!(model = %self.inner.id, "Upstream process stopped");
    }

    /// Abort without drain: SIGKILL the child tree. Used for eviction and
    /// group swaps.
    pub async fn stop_immediately(&self) {
        if matches!(
            self.state(),
            ProcessState::Stopped | ProcessState::Shutdown
        ) {
            return;
        }
        self.kill_child_group().await;
        self.release_assignment();
        self.try_transition(
            &[
                ProcessState::Ready,
                ProcessState::Starting,
                ProcessState::Stopping,
            ],
            ProcessState::Stopped,
        );
        info!(model = %self.inner.id, "Upstream process killed");
    }

    /// Terminal stop: no restarts ever.
    pub async fn shutdown(&self) {
        self.kill_child_group().await;
        self.release_assignment();
        let previous = self.inner.state_tx.send_replace(ProcessState::Shutdown);
        if previous != ProcessState::Shutdown {
            self.inner.events.publish(Event::ProcessStateChanged {
                model: self.inner.id.clone(),
                state: ProcessState::Shutdown,
            });
        }
    }

    pub async fn stop_with(&self, strategy: StopStrategy) {
        match strategy {
            StopStrategy::Graceful => self.stop().await,
            StopStrategy::Immediate => self.stop_immediately().await,
        }
    }

    async fn terminate_gracefully(&self) {
        let pid = {
            let slot = self.inner.child.lock().await;
            slot.as_ref().and_then(|c| c.id())
        };
        let Some(pid) = pid else {
            self.reap_child().await;
            return;
        };

        if !self.inner.config.cmd_stop.trim().is_empty() {
            self.run_stop_command(pid).await;
        } else {
            signal_process_group(pid, libc::SIGTERM);
        }

        let exited = {
            let mut slot = self.inner.child.lock().await;
            match slot.as_mut() {
                Some(child) => tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok(),
                None => true,
            }
        };
        if !exited {
            warn!(model = %self.inner.id, "Upstream ignored graceful stop, sending SIGKILL");
            signal_process_group(pid, libc::SIGKILL);
        }
        self.reap_child().await;
    }

    async fn run_stop_command(&self, pid: u32) {
        let mut macros = HashMap::new();
        macros.insert("PID".to_string(), pid.to_string());
        let cmd_stop = expand_macros_unchecked(&self.inner.config.cmd_stop, &macros);

        let argv = match split_command(&cmd_stop) {
            Ok(argv) if !argv.is_empty() => argv,
            _ => {
                warn!(model = %self.inner.id, "cmdStop is malformed, falling back to SIGTERM");
                signal_process_group(pid, libc::SIGTERM);
                return;
            }
        };
        debug!(model = %self.inner.id, cmd = %cmd_stop, "Running stop command");
        match Command::new(&argv[0]).args(&argv[1..]).output().await {
            Ok(output) if !output.status.success() => {
                warn!(
                    model = %self.inner.id,
                    status = %output.status,
                    "Stop command failed, falling back to SIGTERM"
                );
                signal_process_group(pid, libc::SIGTERM);
            }
            Err(e) => {
                warn!(model = %self.inner.id, error = %e, "Stop command failed, falling back to SIGTERM");
                signal_process_group(pid, libc::SIGTERM);
            }
            Ok(_) => {}
        }
    }

    async fn kill_child_group(&self) {
        let pid = {
            let slot = self.inner.child.lock().await;
            slot.as_ref().and_then(|c| c.id())
        };
        if let Some(pid) = pid {
            signal_process_group(pid, libc::SIGKILL);
        }
        self.reap_child().await;
    }

    async fn reap_child(&self) {
        let mut slot = self.inner.child.lock().await;
        if let Some(mut child) = slot.take() {
            let _ = child.wait().await;
        }
    }

    fn release_assignment(&self) {
        self.inner.assigned_gpu.store(-1, Ordering::SeqCst);
        self.inner
            .runtime_env
            .lock()
            .expect("runtime env lock poisoned")
            .clear();
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: ProcessState) {
        self.inner.state_tx.send_replace(state);
    }

    #[cfg(test)]
    pub(crate) fn set_last_request_handled(&self, at: Instant) {
        *self
            .inner
            .last_request_handled
            .lock()
            .expect("last request lock poisoned") = at;
    }

    #[cfg(test)]
    pub(crate) fn add_in_flight(&self, delta: isize) {
        if delta >= 0 {
            self.inner
                .in_flight
                .fetch_add(delta as usize, Ordering::SeqCst);
        } else {
            self.inner
                .in_flight
                .fetch_sub((-delta) as usize, Ordering::SeqCst);
        }
    }
}

impl Drop for ProcessInner {
    fn drop(&mut self) {
        // Last handle gone: make sure no child outlives its supervisor.
        if let Ok(mut slot) = self.child.try_lock()
            && let Some(child) = slot.as_mut()
        {
            if let Some(pid) = child.id() {
                signal_process_group(pid, libc::SIGKILL);
            }
            let _ = child.start_kill();
        }
    }
}

/// Kill an entire process group.
fn signal_process_group(pid: u32, signal: libc::c_int) {
    // SAFETY: signalling a process group we spawned with process_group(0).
    unsafe {
        libc::kill(-(pid as libc::pid_t), signal);
    }
}

/// Strip ANSI escape sequences from a string.
pub(crate) fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            for c2 in chars.by_ref() {
                if c2.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out.trim_end().to_string()
}

/// Shell-free argv split: whitespace-separated tokens with single/double
/// quoting and backslash escapes. Line continuations (`\` at end of line)
/// collapse to spaces so multi-line YAML commands work.
pub fn split_command(cmd: &str) -> Result<Vec<String>, String> {
    let cmd = cmd.replace("\\\n", " ");
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = cmd.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else if c == '\\' && q == '"' {
                    match chars.next() {
                        Some(escaped) => current.push(escaped),
                        None => return Err("trailing backslash".to_string()),
                    }
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                '\\' => match chars.next() {
                    Some(escaped) => {
                        current.push(escaped);
                        in_token = true;
                    }
                    None => return Err("trailing backslash".to_string()),
                },
                c if c.is_whitespace() => {
                    if in_token {
                        argv.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }
    if quote.is_some() {
        return Err("unterminated quote".to_string());
    }
    if in_token {
        argv.push(current);
    }
    Ok(argv)
}

/// Tracks one request through the proxy; dropping it decrements the
/// in-flight count and stamps `last_request_handled` for LRU eviction.
struct InFlightGuard {
    inner: Arc<ProcessInner>,
}

impl InFlightGuard {
    fn acquire(process: &Process) -> InFlightGuard {
        let count = process.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("modelmux_in_flight", "model" => process.inner.id.clone()).set(count as f64);
        InFlightGuard {
            inner: Arc::clone(&process.inner),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let previous = self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        gauge!("modelmux_in_flight", "model" => self.inner.id.clone())
            .set(previous.saturating_sub(1) as f64);
        *self
            .inner
            .last_request_handled
            .lock()
            .expect("last request lock poisoned") = Instant::now();
        self.inner.in_flight_changed.notify_waiters();
    }
}

/// Emits request metrics exactly once when the response body completes (or
/// the client disconnects).
struct RequestFinisher {
    model: String,
    started: Instant,
    events: EventBus,
    _guard: InFlightGuard,
    _permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl RequestFinisher {
    fn complete(self, usage: Option<crate::metrics::Usage>) {
        let duration = self.started.elapsed();
        counter!("modelmux_requests_total", "model" => self.model.clone()).increment(1);
        histogram!("modelmux_request_duration_seconds", "model" => self.model.clone())
            .record(duration.as_secs_f64());
        self.events.publish(Event::TokenMetrics(TokenMetrics::new(
            self.model.clone(),
            usage,
            duration.as_millis() as u64,
        )));
        // _guard and _permit drop here.
    }
}

/// Response body wrapper that keeps the in-flight guard alive until the
/// stream is fully consumed and scans the bytes for a `usage` report.
struct GuardedBody {
    inner: Body,
    scanner: UsageScanner,
    finisher: Option<RequestFinisher>,
}

impl GuardedBody {
    fn finish(&mut self) {
        if let Some(finisher) = self.finisher.take() {
            finisher.complete(self.scanner.finish());
        }
    }
}

impl http_body::Body for GuardedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.scanner.push(data);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for GuardedBody {
    fn drop(&mut self) {
        // Client disconnects drop the body before end-of-stream.
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    fn test_process(id: &str) -> Process {
        test_process_with(id, ModelConfig {
            cmd: "mock-server --port 9999".to_string(),
            proxy_url: "http://localhost:9999".to_string(),
            check_endpoint: "/health".to_string(),
            ..ModelConfig::default()
        })
    }

    fn test_process_with(id: &str, config: ModelConfig) -> Process {
        Process::new(
            id,
            config,
            Duration::from_secs(1),
            LogStdout::Off,
            Arc::new(MemoryTracker::new()),
            EventBus::new(16),
            Arc::new(LogBuffer::new(64)),
        )
    }

    #[test]
    fn split_command_handles_quotes() {
        assert_eq!(
            split_command(r#"server --name "my model" --ctx 4096"#).unwrap(),
            vec!["server", "--name", "my model", "--ctx", "4096"]
        );
        assert_eq!(
            split_command("server 'single quoted arg'").unwrap(),
            vec!["server", "single quoted arg"]
        );
        assert_eq!(
            split_command(r#"server escaped\ space"#).unwrap(),
            vec!["server", "escaped space"]
        );
        assert_eq!(split_command("  ").unwrap(), Vec::<String>::new());
        assert!(split_command("server \"unterminated").is_err());
    }

    #[test]
    fn split_command_collapses_line_continuations() {
        let cmd = "server \\\n  --port 9000 \\\n  --ctx 4096";
        assert_eq!(
            split_command(cmd).unwrap(),
            vec!["server", "--port", "9000", "--ctx", "4096"]
        );
    }

    #[test]
    fn strip_ansi_removes_escapes() {
        assert_eq!(strip_ansi("hello"), "hello");
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m"), "red");
        assert_eq!(strip_ansi("\x1b[1;32mbold\x1b[0m text "), "bold text");
    }

    #[test]
    fn new_process_starts_stopped_and_unassigned() {
        let process = test_process("m");
        assert_eq!(process.state(), ProcessState::Stopped);
        assert_eq!(process.assigned_gpu(), -1);
        assert_eq!(process.in_flight(), 0);
    }

    #[test]
    fn transitions_follow_the_state_table() {
        let process = test_process("m");

        // Stopped -> Starting is the only legal exit from Stopped
        assert!(!process.try_transition(&[ProcessState::Ready], ProcessState::Stopping));
        assert!(process.try_transition(&[ProcessState::Stopped], ProcessState::Starting));
        assert_eq!(process.state(), ProcessState::Starting);

        // Starting -> Ready
        assert!(process.try_transition(&[ProcessState::Starting], ProcessState::Ready));

        // Ready -> Stopping -> Stopped
        assert!(process.try_transition(&[ProcessState::Ready], ProcessState::Stopping));
        assert!(process.try_transition(&[ProcessState::Stopping], ProcessState::Stopped));

        // double transition from the same source fails
        assert!(!process.try_transition(&[ProcessState::Stopping], ProcessState::Stopped));
    }

    #[test]
    fn measured_footprint_falls_back_to_hints_until_observed() {
        let tracker = Arc::new(MemoryTracker::new());
        let config = ModelConfig {
            cmd: "server --port 9000".to_string(),
            initial_vram_mb: 22000,
            initial_cpu_mb: 120000,
            ..ModelConfig::default()
        };
        let process = Process::new(
            "m",
            config,
            Duration::from_secs(1),
            LogStdout::Off,
            Arc::clone(&tracker),
            EventBus::new(16),
            Arc::new(LogBuffer::new(64)),
        );

        assert_eq!(process.measured_vram_mb(), 22000);
        assert_eq!(process.measured_cpu_mb(), 120000);
        assert!(process.runtime_footprint().is_none());

        tracker.set(process.signature(), MemoryFootprint::new(1616, 0));
        assert_eq!(process.measured_vram_mb(), 1616);
        assert_eq!(process.measured_cpu_mb(), 0);
        let footprint = process.runtime_footprint().unwrap();
        assert_eq!(footprint.vram_mb, 1616);
    }

    #[tokio::test]
    async fn stop_on_non_ready_process_is_a_noop() {
        let process = test_process("m");
        process.stop().await;
        assert_eq!(process.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn stop_immediately_releases_gpu_assignment() {
        let process = test_process("m");
        process.force_state(ProcessState::Ready);
        process.set_assigned_gpu(1);
        process.insert_runtime_env("CUDA_VISIBLE_DEVICES", "1".to_string());

        process.stop_immediately().await;

        assert_eq!(process.state(), ProcessState::Stopped);
        assert_eq!(process.assigned_gpu(), -1);
        assert!(process.runtime_env().is_empty());
    }

    #[tokio::test]
    async fn shutdown_is_terminal() {
        let process = test_process("m");
        process.shutdown().await;
        assert_eq!(process.state(), ProcessState::Shutdown);

        let err = process.start().await.unwrap_err();
        assert!(matches!(err, ProcessError::Shutdown));
    }

    #[tokio::test]
    async fn spawn_failure_resets_to_stopped() {
        let process = test_process_with(
            "m",
            ModelConfig {
                cmd: "/nonexistent/binary-for-sure --port 9000".to_string(),
                proxy_url: "http://localhost:9000".to_string(),
                check_endpoint: "/health".to_string(),
                ..ModelConfig::default()
            },
        );

        let err = process.start().await.unwrap_err();
        assert!(
            matches!(err, ProcessError::Spawn(_)),
            "unexpected error: {err:?}"
        );
        assert_eq!(process.state(), ProcessState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_unloads_idle_ready_process() {
        let process = test_process_with(
            "m",
            ModelConfig {
                cmd: "server --port 9000".to_string(),
                proxy_url: "http://localhost:9000".to_string(),
                check_endpoint: "/health".to_string(),
                ttl: 5,
                ..ModelConfig::default()
            },
        );
        process.force_state(ProcessState::Ready);
        process.set_last_request_handled(Instant::now());
        process.spawn_ttl_loop(process.inner.start_generation.load(Ordering::SeqCst));

        // Under the TTL nothing happens.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(process.state(), ProcessState::Ready);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(process.state(), ProcessState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_spares_busy_process() {
        let process = test_process_with(
            "m",
            ModelConfig {
                cmd: "server --port 9000".to_string(),
                proxy_url: "http://localhost:9000".to_string(),
                check_endpoint: "/health".to_string(),
                ttl: 2,
                ..ModelConfig::default()
            },
        );
        process.force_state(ProcessState::Ready);
        process.add_in_flight(1);
        process.spawn_ttl_loop(process.inner.start_generation.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(process.state(), ProcessState::Ready);
        process.add_in_flight(-1);
    }

    #[tokio::test]
    async fn in_flight_guard_counts_and_stamps_lru() {
        let process = test_process("m");
        let before = process.last_request_handled();
        {
            let _guard = InFlightGuard::acquire(&process);
            assert_eq!(process.in_flight(), 1);
            let _second = InFlightGuard::acquire(&process);
            assert_eq!(process.in_flight(), 2);
        }
        assert_eq!(process.in_flight(), 0);
        assert!(process.last_request_handled() >= before);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_drains_in_flight_before_terminating() {
        let process = test_process("m");
        process.force_state(ProcessState::Ready);
        process.add_in_flight(1);

        let stopper = process.clone();
        let handle = tokio::spawn(async move { stopper.stop().await });

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(process.state(), ProcessState::Stopping);

        process.add_in_flight(-1);
        handle.await.unwrap();
        assert_eq!(process.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn waiters_share_start_failure() {
        let process = test_process_with(
            "m",
            ModelConfig {
                cmd: "/nonexistent/binary-for-sure".to_string(),
                proxy_url: "http://localhost:9000".to_string(),
                check_endpoint: "/health".to_string(),
                ..ModelConfig::default()
            },
        );

        let a = process.clone();
        let b = process.clone();
        let (ra, rb) = tokio::join!(a.start(), b.start());
        assert!(ra.is_err());
        assert!(rb.is_err());
        assert_eq!(process.state(), ProcessState::Stopped);
    }
}
