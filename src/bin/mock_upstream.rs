//! Mock inference backend for testing modelmux.
//!
//! Serves a minimal OpenAI-compatible surface plus a `/health` endpoint,
//! and can emit memory-report log lines on stdout so the memory tracker's
//! log pump has something to observe:
//!
//! ```text
//! mock_upstream --port 9001 --memory-log-format llama \
//!   --memory-log-vram-mb 46759 --memory-log-cpu-mb 248000
//! ```

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Parser, Debug, Clone)]
#[command(name = "mock_upstream")]
#[command(about = "Mock inference backend for testing")]
struct Args {
    /// Port to listen on (0 = pick a free port)
    #[arg(long, default_value = "0")]
    port: u16,

    /// Model name echoed in responses
    #[arg(long, default_value = "mock-model")]
    model: String,

    /// Delay before binding the listener (ms), to exercise health polling
    #[arg(long, default_value = "0")]
    startup_delay_ms: u64,

    /// Artificial latency per request (ms)
    #[arg(long, default_value = "0")]
    latency_ms: u64,

    /// Always fail /health with 503
    #[arg(long)]
    fail_health: bool,

    /// Memory log style: none | json | plain | llama
    #[arg(long, default_value = "none")]
    memory_log_format: String,

    /// VRAM figure for emitted memory logs (MB)
    #[arg(long, default_value = "0")]
    memory_log_vram_mb: u64,

    /// Host RAM figure for emitted memory logs (MB)
    #[arg(long, default_value = "0")]
    memory_log_cpu_mb: u64,

    /// Interval between memory log lines (ms)
    #[arg(long, default_value = "50")]
    memory_log_interval_ms: u64,

    /// How many memory log lines to emit
    #[arg(long, default_value = "4")]
    memory_log_count: u32,
}

struct MockState {
    args: Args,
    request_count: AtomicU64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.startup_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(args.startup_delay_ms)).await;
    }

    spawn_memory_logger(&args);

    let state = Arc::new(MockState {
        args: args.clone(),
        request_count: AtomicU64::new(0),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .fallback(fallback_echo)
        .with_state(state);

    let listener = TcpListener::bind(format!("127.0.0.1:{}", args.port)).await?;
    let actual_port = listener.local_addr()?.port();
    // Readiness marker for harnesses that watch stdout.
    println!("READY {actual_port}");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Emit memory-report lines the way real engines do, so the supervisor's
/// log pump can measure us.
fn spawn_memory_logger(args: &Args) {
    if args.memory_log_format == "none" || args.memory_log_count == 0 {
        return;
    }
    let args = args.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(args.memory_log_interval_ms));
        for _ in 0..args.memory_log_count {
            tick.tick().await;
            match args.memory_log_format.as_str() {
                "json" => {
                    println!(
                        r#"{{"vram_used_mb":{},"cpu_used_mb":{}}}"#,
                        args.memory_log_vram_mb, args.memory_log_cpu_mb
                    );
                }
                "plain" => {
                    println!(
                        "VRAM used: {} MiB RAM used: {} MiB",
                        args.memory_log_vram_mb, args.memory_log_cpu_mb
                    );
                }
                "llama" => {
                    println!(
                        "load_tensors: CUDA0 model buffer size = {}.00 MiB",
                        args.memory_log_vram_mb
                    );
                    if args.memory_log_cpu_mb > 0 {
                        println!(
                            "load_tensors: host buffer size = {}.00 MiB",
                            args.memory_log_cpu_mb
                        );
                    }
                }
                other => {
                    eprintln!("unknown memory log format: {other}");
                    return;
                }
            }
        }
    });
}

async fn health(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    if state.args.fail_health {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

#[derive(Deserialize)]
struct ChatRequest {
    #[serde(default)]
    model: String,
    #[serde(default)]
    stream: bool,
}

async fn chat_completions(
    State(state): State<Arc<MockState>>,
    Json(request): Json<ChatRequest>,
) -> impl IntoResponse {
    if state.args.latency_ms > 0 {
        tokio::time::sleep(Duration::from_millis(state.args.latency_ms)).await;
    }
    let count = state.request_count.fetch_add(1, Ordering::SeqCst) + 1;

    if request.stream {
        let chunk = serde_json::json!({
            "choices": [{"delta": {"content": format!("chunk {count}")}}],
        });
        let tail = serde_json::json!({
            "choices": [],
            "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30},
        });
        let body = format!("data: {chunk}\n\ndata: {tail}\n\ndata: [DONE]\n\n");
        return axum::response::Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/event-stream")
            .body(axum::body::Body::from(body))
            .expect("static response")
            .into_response();
    }

    Json(serde_json::json!({
        "id": format!("chatcmpl-mock-{count}"),
        "object": "chat.completion",
        "model": if request.model.is_empty() { state.args.model.clone() } else { request.model },
        "served_by": state.args.model,
        "request_number": count,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": format!("mock response #{count}")},
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30},
    }))
    .into_response()
}

async fn list_models(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "object": "list",
        "data": [{"id": state.args.model, "object": "model", "owned_by": "mock_upstream"}],
    }))
}

async fn fallback_echo(State(state): State<Arc<MockState>>, request: axum::extract::Request) -> impl IntoResponse {
    Json(serde_json::json!({
        "served_by": state.args.model,
        "path": request.uri().path(),
    }))
}
