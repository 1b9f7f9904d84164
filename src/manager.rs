//! The routing core: maps OpenAI-compatible requests to model processes,
//! coordinates group swaps, and exposes the administrative HTTP surface.
//!
//! Swap coordination: one mutex guards the exclusivity domain (the set of
//! `exclusive` groups). The mutex is released before any start engages the
//! scheduler, which has its own lock; the two are never held together.

use crate::config::{Config, MAX_BUFFERED_BODY_BYTES};
use crate::events::{Event, EventBus};
use crate::gpu::GpuAllocator;
use crate::group::ProcessGroup;
use crate::logbuffer::LogBuffer;
use crate::memory::MemoryTracker;
use crate::process::{Process, ProcessError, StopStrategy};
use crate::scheduler::{Scheduler, SchedulerError, SchedulerOptions};
use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{Response, StatusCode, request::Parts};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::future::join_all;
use http_body_util::{BodyExt, Limited};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How many times a request re-runs the group swap after losing a race to a
/// competing swap (its target evicted between swap and proxy).
const SWAP_RETRIES: usize = 3;

struct ManagerInner {
    config: Config,
    groups: HashMap<String, Arc<ProcessGroup>>,
    model_to_group: HashMap<String, String>,
    tracker: Arc<MemoryTracker>,
    events: EventBus,
    proxy_logs: Arc<LogBuffer>,
    upstream_logs: Arc<LogBuffer>,
    swap_lock: Mutex<()>,
    active_exclusive: StdMutex<Option<String>>,
}

pub struct ProxyManager {
    inner: Arc<ManagerInner>,
}

impl Clone for ProxyManager {
    fn clone(&self) -> Self {
        ProxyManager {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ProxyManager {
    pub fn new(config: Config, allocator: Arc<dyn GpuAllocator>) -> Self {
        let tracker = Arc::new(MemoryTracker::new());
        let events = EventBus::default();
        let upstream_logs = Arc::new(LogBuffer::default());
        let proxy_logs = Arc::new(LogBuffer::default());

        let health_check_timeout = Duration::from_secs(config.health_check_timeout);
        let mut processes: HashMap<String, Process> = HashMap::new();
        for id in config.model_ids_sorted() {
            let process = Process::new(
                &id,
                config.models[&id].clone(),
                health_check_timeout,
                config.log_to_stdout,
                Arc::clone(&tracker),
                events.clone(),
                Arc::clone(&upstream_logs),
            );
            processes.insert(id, process);
        }

        // The provider holds weak handles: process → hook → scheduler →
        // provider must not keep processes alive on its own.
        let weak: Vec<_> = processes.values().map(|p| p.downgrade()).collect();
        let scheduler = Arc::new(Scheduler::new(
            allocator,
            Box::new(move || weak.iter().filter_map(|w| w.upgrade()).collect()),
            SchedulerOptions {
                gpu_vram_cap_mb: config.gpu_vram_cap_mb,
                gpu_vram_caps_mb: config.gpu_vram_caps_mb.clone(),
                host_ram_cap_mb: config.host_ram_cap_mb,
            },
        ));

        for process in processes.values() {
            let scheduler = Arc::clone(&scheduler);
            process.set_pre_start_hook(Arc::new(move |p: Process| {
                let scheduler = Arc::clone(&scheduler);
                Box::pin(async move { scheduler.schedule(&p).await })
            }));
        }

        let mut groups = HashMap::new();
        let mut model_to_group = HashMap::new();
        for (group_id, group_config) in config.effective_groups() {
            let members: Vec<Process> = group_config
                .members
                .iter()
                .map(|m| processes[m].clone())
                .collect();
            for member in &group_config.members {
                model_to_group.insert(member.clone(), group_id.clone());
            }
            groups.insert(
                group_id.clone(),
                Arc::new(ProcessGroup::new(
                    &group_id,
                    group_config.swap,
                    group_config.exclusive,
                    members,
                )),
            );
        }

        ProxyManager {
            inner: Arc::new(ManagerInner {
                config,
                groups,
                model_to_group,
                tracker,
                events,
                proxy_logs,
                upstream_logs,
                swap_lock: Mutex::new(()),
                active_exclusive: StdMutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub fn memory_tracker(&self) -> &Arc<MemoryTracker> {
        &self.inner.tracker
    }

    pub fn proxy_logs(&self) -> &Arc<LogBuffer> {
        &self.inner.proxy_logs
    }

    pub fn upstream_logs(&self) -> &Arc<LogBuffer> {
        &self.inner.upstream_logs
    }

    pub fn find_process(&self, model_id: &str) -> Option<&Process> {
        let group_id = self.inner.model_to_group.get(model_id)?;
        self.inner.groups.get(group_id)?.member(model_id)
    }

    /// The HTTP surface: OpenAI-compatible inference routes plus the
    /// administrative API.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(|| async { "OK" }))
            .route("/v1/models", get(list_models_handler))
            .route("/v1/chat/completions", post(openai_handler))
            .route("/v1/completions", post(openai_handler))
            .route("/v1/embeddings", post(openai_handler))
            .route("/v1/rerank", post(openai_handler))
            .route("/v1/audio/{*rest}", post(openai_handler))
            .route("/v1/images/{*rest}", post(openai_handler))
            .route("/api/models", get(api_models_handler))
            .route("/api/models/unload", post(unload_all_handler))
            .route("/api/models/unload/{model}", post(unload_one_handler))
            .route("/api/models/load/{model}", post(load_one_handler))
            .with_state(self.clone())
    }

    async fn route_openai(&self, request: Request) -> Response<Body> {
        let started = Instant::now();
        let (parts, body) = request.into_parts();

        let bytes = match Limited::new(body, MAX_BUFFERED_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<http_body_util::LengthLimitError>() => {
                return error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
            }
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("failed to read request body: {e}"),
                );
            }
        };

        let Some(requested) = extract_model(&bytes) else {
            return error_response(
                StatusCode::BAD_REQUEST,
                "unable to determine model from request",
            );
        };
        let Some(model) = self.inner.config.real_model_name(&requested) else {
            warn!(requested = %requested, "Request for unknown model");
            return error_response(
                StatusCode::NOT_FOUND,
                &format!("model not found: {requested}"),
            );
        };

        for attempt in 0..SWAP_RETRIES {
            let group = self.swap_process_group(&model).await;
            let request = rebuild_request(&parts, &bytes);
            match group.proxy_request(&model, request).await {
                Ok(response) => {
                    self.log_proxy_line(&model, response.status(), started);
                    return response;
                }
                Err(ProcessError::NotReady) if attempt + 1 < SWAP_RETRIES => {
                    // Lost the swap race; the last swap wins and we re-enter.
                    debug!(model = %model, attempt, "Target evicted before proxy, retrying swap");
                    continue;
                }
                Err(e) => {
                    self.log_proxy_error(&model, &e, started);
                    return process_error_response(&model, e);
                }
            }
        }
        error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &format!("model {model} keeps being evicted; retry later"),
        )
    }

    /// Make `model`'s group the active one in the exclusivity domain,
    /// stopping the processes of competing exclusive groups. Serialized per
    /// domain; non-exclusive groups pass straight through.
    async fn swap_process_group(&self, model: &str) -> Arc<ProcessGroup> {
        let group_id = self
            .inner
            .model_to_group
            .get(model)
            .expect("model resolved against config")
            .clone();
        let group = Arc::clone(&self.inner.groups[&group_id]);
        if !group.exclusive() {
            return group;
        }

        let _guard = self.inner.swap_lock.lock().await;
        {
            let active = self
                .inner
                .active_exclusive
                .lock()
                .expect("active group lock poisoned");
            if active.as_deref() == Some(group_id.as_str()) {
                return group;
            }
        }

        let competitors: Vec<Arc<ProcessGroup>> = self
            .inner
            .groups
            .values()
            .filter(|g| g.exclusive() && g.id() != group_id)
            .cloned()
            .collect();
        if !competitors.is_empty() {
            info!(group = %group_id, "Swapping exclusive process group");
            join_all(
                competitors
                    .iter()
                    .map(|g| g.stop_all(StopStrategy::Immediate)),
            )
            .await;
        }

        *self
            .inner
            .active_exclusive
            .lock()
            .expect("active group lock poisoned") = Some(group_id);
        group
    }

    fn log_proxy_line(&self, model: &str, status: StatusCode, started: Instant) {
        let line = format!(
            "model={model} status={} duration_ms={}",
            status.as_u16(),
            started.elapsed().as_millis()
        );
        self.inner.proxy_logs.append(&line);
        if self.inner.config.log_to_stdout.proxy_enabled() {
            info!(target: "proxy", "{line}");
        } else {
            debug!(target: "proxy", "{line}");
        }
    }

    fn log_proxy_error(&self, model: &str, error: &ProcessError, started: Instant) {
        let line = format!(
            "model={model} error={error} duration_ms={}",
            started.elapsed().as_millis()
        );
        self.inner.proxy_logs.append(&line);
        info!(target: "proxy", "{line}");
    }

    fn model_status_list(&self) -> Vec<ModelStatus> {
        let mut statuses = Vec::new();
        for id in self.inner.config.model_ids_sorted() {
            let model = &self.inner.config.models[&id];
            let process = self.find_process(&id);
            let (state, measured_vram_mb, measured_cpu_mb) = match process {
                Some(p) => (
                    p.state().as_str(),
                    p.measured_vram_mb(),
                    p.measured_cpu_mb(),
                ),
                None => ("unknown", 0, 0),
            };
            statuses.push(ModelStatus {
                id: id.clone(),
                name: model.name.clone(),
                description: model.description.clone(),
                state: state.to_string(),
                unlisted: model.unlisted,
                measured_vram_mb,
                measured_cpu_mb,
                initial_vram_mb: model.initial_vram_mb,
                initial_cpu_mb: model.initial_cpu_mb,
                fit_policy: model.fit_policy.clone(),
            });
        }
        statuses
    }

    /// Stop every process in every group.
    pub async fn stop_all(&self, strategy: StopStrategy) {
        join_all(self.inner.groups.values().map(|g| g.stop_all(strategy))).await;
        *self
            .inner
            .active_exclusive
            .lock()
            .expect("active group lock poisoned") = None;
    }

    /// Terminal shutdown: every process reaches `Shutdown`, no restarts.
    pub async fn shutdown(&self) {
        join_all(self.inner.groups.values().map(|g| g.shutdown())).await;
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelStatus {
    id: String,
    name: String,
    description: String,
    state: String,
    unlisted: bool,
    #[serde(rename = "measuredVramMB")]
    measured_vram_mb: u64,
    #[serde(rename = "measuredCpuMB")]
    measured_cpu_mb: u64,
    #[serde(rename = "initialVramMB")]
    initial_vram_mb: u64,
    #[serde(rename = "initialCpuMB")]
    initial_cpu_mb: u64,
    fit_policy: String,
}

async fn openai_handler(State(manager): State<ProxyManager>, request: Request) -> Response<Body> {
    manager.route_openai(request).await
}

async fn list_models_handler(State(manager): State<ProxyManager>) -> Response<Body> {
    let mut data: Vec<serde_json::Value> = Vec::new();
    for id in manager.inner.config.model_ids_sorted() {
        if manager.inner.config.models[&id].unlisted {
            continue;
        }
        data.push(serde_json::json!({
            "id": id,
            "object": "model",
            "created": 0,
            "owned_by": "modelmux",
        }));
    }
    json_response(
        StatusCode::OK,
        &serde_json::json!({ "object": "list", "data": data }),
    )
}

async fn api_models_handler(State(manager): State<ProxyManager>) -> Response<Body> {
    json_response(
        StatusCode::OK,
        &serde_json::to_value(manager.model_status_list()).expect("statuses serialize"),
    )
}

async fn unload_all_handler(State(manager): State<ProxyManager>) -> Response<Body> {
    manager.stop_all(StopStrategy::Immediate).await;
    json_response(StatusCode::OK, &serde_json::json!({ "msg": "ok" }))
}

async fn unload_one_handler(
    State(manager): State<ProxyManager>,
    Path(model): Path<String>,
) -> Response<Body> {
    let Some(real) = manager.inner.config.real_model_name(&model) else {
        return error_response(StatusCode::NOT_FOUND, &format!("model not found: {model}"));
    };
    let Some(process) = manager.find_process(&real) else {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("process not found for model {model}"),
        );
    };
    process.stop_immediately().await;
    text_response(StatusCode::OK, "OK")
}

async fn load_one_handler(
    State(manager): State<ProxyManager>,
    Path(model): Path<String>,
) -> Response<Body> {
    let Some(real) = manager.inner.config.real_model_name(&model) else {
        return error_response(StatusCode::NOT_FOUND, &format!("model not found: {model}"));
    };
    let group = manager.swap_process_group(&real).await;
    match group.ensure_started(&real).await {
        Ok(()) => text_response(StatusCode::OK, "OK"),
        Err(e) => process_error_response(&real, e),
    }
}

/// Extract the model name from the JSON request body.
fn extract_model(body: &Bytes) -> Option<String> {
    let json: serde_json::Value = serde_json::from_slice(body).ok()?;
    json.get("model")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn rebuild_request(parts: &Parts, bytes: &Bytes) -> Request {
    let mut request = axum::http::Request::builder()
        .method(parts.method.clone())
        .uri(parts.uri.clone())
        .version(parts.version)
        .body(Body::from(bytes.clone()))
        .expect("rebuilding an already-valid request");
    *request.headers_mut() = parts.headers.clone();
    request
}

fn process_error_response(model: &str, error: ProcessError) -> Response<Body> {
    match &error {
        ProcessError::Scheduler(
            SchedulerError::InsufficientVram | SchedulerError::InsufficientHostRam,
        ) => {
            let body = serde_json::json!({
                "error": {
                    "message": format!("cannot schedule {model}: {error}"),
                    "type": "modelmux_error",
                }
            });
            Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .header("Content-Type", "application/json")
                .header("Retry-After", "30")
                .body(Body::from(body.to_string()))
                .expect("static response")
        }
        ProcessError::Scheduler(_) | ProcessError::Shutdown | ProcessError::NotReady => {
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &format!("model {model} unavailable: {error}"),
            )
        }
        ProcessError::Spawn(_)
        | ProcessError::StartTimeout(_)
        | ProcessError::Health(_)
        | ProcessError::StartFailed(_)
        | ProcessError::Upstream(_) => error_response(
            StatusCode::BAD_GATEWAY,
            &format!("model {model} failed: {error}"),
        ),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "type": "modelmux_error",
        }
    });
    json_response(status, &body)
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("static response")
}

fn text_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message.to_string()))
        .expect("static response")
}
