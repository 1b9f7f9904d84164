//! End-to-end tests: real upstream processes behind the full stack.
//!
//! Each test builds a config whose `cmd` points at the `mock_upstream`
//! binary and drives requests through the router: manager → group →
//! scheduler → process → child.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use modelmux::{Config, GpuInfo, ProxyManager, StaticGpuAllocator, StopStrategy, build_app};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceExt;

fn mock_cmd(model: &str, extra: &str) -> String {
    format!(
        "{} --port ${{PORT}} --model {model} {extra}",
        env!("CARGO_BIN_EXE_mock_upstream")
    )
}

fn build(yaml: &str, gpus: Vec<GpuInfo>) -> (Router, ProxyManager, Arc<StaticGpuAllocator>) {
    let config = Config::from_yaml(yaml).expect("test config parses");
    let allocator = Arc::new(StaticGpuAllocator::new(gpus));
    let (router, manager) = build_app(config, allocator.clone());
    (router, manager, allocator)
}

async fn chat(router: &Router, model: &str) -> (StatusCode, Value) {
    let body = serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": "hello"}],
    });
    let response = router
        .clone()
        .oneshot(
            Request::post("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

async fn model_states(router: &Router) -> HashMap<String, Value> {
    let response = router
        .clone()
        .oneshot(Request::get("/api/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let list: Vec<Value> = serde_json::from_slice(&bytes).unwrap();
    list.into_iter()
        .map(|m| (m["id"].as_str().unwrap().to_string(), m))
        .collect()
}

async fn wait_for_state(router: &Router, model: &str, expected: &str, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let states = model_states(router).await;
        if states[model]["state"] == expected {
            return;
        }
        if Instant::now() > deadline {
            panic!(
                "model {model} never reached {expected}; states: {:?}",
                states
                    .iter()
                    .map(|(k, v)| (k.clone(), v["state"].clone()))
                    .collect::<Vec<_>>()
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn proxies_to_on_demand_upstream() {
    let yaml = format!(
        r#"
startPort: 21100
healthCheckTimeout: 10
models:
  alpha:
    cmd: "{}"
"#,
        mock_cmd("alpha-upstream", "")
    );
    let (router, manager, _) = build(&yaml, vec![]);

    let (status, json) = chat(&router, "alpha").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["served_by"], "alpha-upstream");

    let states = model_states(&router).await;
    assert_eq!(states["alpha"]["state"], "ready");

    // Administrative unload brings it back down.
    let response = router
        .clone()
        .oneshot(
            Request::post("/api/models/unload/alpha")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    wait_for_state(&router, "alpha", "stopped", Duration::from_secs(2)).await;

    manager.shutdown().await;
}

#[tokio::test]
async fn swaps_between_exclusive_models() {
    let yaml = format!(
        r#"
startPort: 21110
healthCheckTimeout: 10
models:
  alpha:
    cmd: "{}"
  beta:
    cmd: "{}"
"#,
        mock_cmd("alpha-upstream", ""),
        mock_cmd("beta-upstream", "")
    );
    let (router, manager, _) = build(&yaml, vec![]);

    let (status, json) = chat(&router, "alpha").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["served_by"], "alpha-upstream");

    // A request for beta displaces alpha's exclusive group.
    let (status, json) = chat(&router, "beta").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["served_by"], "beta-upstream");

    let states = model_states(&router).await;
    assert_eq!(states["alpha"]["state"], "stopped");
    assert_eq!(states["beta"]["state"], "ready");

    manager.shutdown().await;
}

#[tokio::test]
async fn tracker_measures_upstream_from_logs() {
    let yaml = format!(
        r#"
startPort: 21120
healthCheckTimeout: 10
models:
  alpha:
    cmd: "{}"
    initialVramMB: 1000
"#,
        mock_cmd(
            "alpha-upstream",
            "--memory-log-format llama --memory-log-vram-mb 4242 --memory-log-cpu-mb 512"
        )
    );
    let (router, manager, _) = build(&yaml, vec![]);

    let states = model_states(&router).await;
    // Before any observation the initial hint is the measurement.
    assert_eq!(states["alpha"]["measuredVramMB"], 1000);

    let (status, _) = chat(&router, "alpha").await;
    assert_eq!(status, StatusCode::OK);

    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let states = model_states(&router).await;
        if states["alpha"]["measuredVramMB"] == 4242 && states["alpha"]["measuredCpuMB"] == 512 {
            break;
        }
        if Instant::now() > deadline {
            panic!("tracker never observed the memory logs: {:?}", states["alpha"]);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn scheduler_evicts_idle_resident_for_new_model() {
    // One 24 GiB GPU; alpha and beta share a non-exclusive group so only
    // the scheduler decides who holds the card.
    let yaml = format!(
        r#"
startPort: 21130
healthCheckTimeout: 10
gpuVramCapMB: 24576
models:
  alpha:
    cmd: "{}"
    fitPolicy: evict_to_fit
    initialVramMB: 20000
  beta:
    cmd: "{}"
    fitPolicy: evict_to_fit
    initialVramMB: 23347
groups:
  pool:
    swap: false
    exclusive: false
    members: [alpha, beta]
"#,
        mock_cmd("alpha-upstream", ""),
        mock_cmd("beta-upstream", "")
    );
    let (router, manager, allocator) = build(
        &yaml,
        vec![GpuInfo {
            index: 0,
            free_mb: 24576,
            total_mb: 24576,
        }],
    );

    let (status, _) = chat(&router, "alpha").await;
    assert_eq!(status, StatusCode::OK);
    let alpha = manager.find_process("alpha").unwrap();
    assert_eq!(alpha.assigned_gpu(), 0);

    // Alpha has consumed the card: beta only fits if alpha goes.
    allocator.set_gpus(vec![GpuInfo {
        index: 0,
        free_mb: 4576,
        total_mb: 24576,
    }]);

    let (status, _) = chat(&router, "beta").await;
    assert_eq!(status, StatusCode::OK);

    let states = model_states(&router).await;
    assert_eq!(states["alpha"]["state"], "stopped");
    assert_eq!(states["beta"]["state"], "ready");
    assert_eq!(manager.find_process("beta").unwrap().assigned_gpu(), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn ttl_unloads_idle_model() {
    let yaml = format!(
        r#"
startPort: 21140
healthCheckTimeout: 10
models:
  alpha:
    cmd: "{}"
    ttl: 1
"#,
        mock_cmd("alpha-upstream", "")
    );
    let (router, manager, _) = build(&yaml, vec![]);

    let (status, _) = chat(&router, "alpha").await;
    assert_eq!(status, StatusCode::OK);

    wait_for_state(&router, "alpha", "stopped", Duration::from_secs(5)).await;

    // The next request starts it again.
    let (status, _) = chat(&router, "alpha").await;
    assert_eq!(status, StatusCode::OK);

    manager.shutdown().await;
}

#[tokio::test]
async fn failing_health_check_surfaces_as_bad_gateway() {
    let yaml = format!(
        r#"
startPort: 21150
healthCheckTimeout: 1
models:
  alpha:
    cmd: "{}"
"#,
        mock_cmd("alpha-upstream", "--fail-health")
    );
    let (router, manager, _) = build(&yaml, vec![]);

    let (status, json) = chat(&router, "alpha").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(json["error"]["message"].as_str().unwrap().contains("alpha"));

    // The process resets to stopped so a later request can retry.
    let states = model_states(&router).await;
    assert_eq!(states["alpha"]["state"], "stopped");

    manager.shutdown().await;
}

#[tokio::test]
async fn concurrent_requests_share_one_start() {
    let yaml = format!(
        r#"
startPort: 21160
healthCheckTimeout: 10
models:
  alpha:
    cmd: "{}"
"#,
        mock_cmd("alpha-upstream", "")
    );
    let (router, manager, _) = build(&yaml, vec![]);

    let results = futures_util::future::join_all((0..4).map(|_| chat(&router, "alpha"))).await;
    let mut request_numbers = Vec::new();
    for (status, json) in results {
        assert_eq!(status, StatusCode::OK);
        request_numbers.push(json["request_number"].as_u64().unwrap());
    }
    // One upstream served all four requests.
    request_numbers.sort_unstable();
    assert_eq!(request_numbers, vec![1, 2, 3, 4]);

    manager.shutdown().await;
}

#[tokio::test]
async fn streamed_responses_pass_through() {
    let yaml = format!(
        r#"
startPort: 21170
healthCheckTimeout: 10
models:
  alpha:
    cmd: "{}"
"#,
        mock_cmd("alpha-upstream", "")
    );
    let (router, manager, _) = build(&yaml, vec![]);

    let body = serde_json::json!({"model": "alpha", "stream": true, "messages": []});
    let response = router
        .clone()
        .oneshot(
            Request::post("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("data:"));
    assert!(text.contains("[DONE]"));

    manager.shutdown().await;
}

#[tokio::test]
async fn stop_all_then_restart_on_demand() {
    let yaml = format!(
        r#"
startPort: 21180
healthCheckTimeout: 10
models:
  alpha:
    cmd: "{}"
"#,
        mock_cmd("alpha-upstream", "")
    );
    let (router, manager, _) = build(&yaml, vec![]);

    let (status, _) = chat(&router, "alpha").await;
    assert_eq!(status, StatusCode::OK);

    manager.stop_all(StopStrategy::Immediate).await;
    let states = model_states(&router).await;
    assert_eq!(states["alpha"]["state"], "stopped");

    // stop is not shutdown: demand restarts the model.
    let (status, _) = chat(&router, "alpha").await;
    assert_eq!(status, StatusCode::OK);

    manager.shutdown().await;
}
