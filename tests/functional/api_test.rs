//! Functional tests for the HTTP surface

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tower::ServiceExt;

use dalle_studio::api::create_router;
use dalle_studio::client::{GeneratedImage, GenerationRequest, GenerationResult, ImageGenerator};
use dalle_studio::config::Settings;
use dalle_studio::queue::{DispatcherConfig, JobState};
use dalle_studio::session::Session;
use dalle_studio::AppState;

const PNG_BYTES: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

#[derive(Default)]
struct StubGenerator {
    delay: Duration,
    calls: Mutex<Vec<Instant>>,
}

impl StubGenerator {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ImageGenerator for StubGenerator {
    fn name(&self) -> &str {
        "stub"
    }

    async fn generate(&self, request: &GenerationRequest) -> GenerationResult {
        self.calls.lock().unwrap().push(Instant::now());
        tokio::time::sleep(self.delay).await;
        Ok(vec![GeneratedImage {
            data: PNG_BYTES.to_vec(),
            content_type: None,
            revised_prompt: Some(format!("{}, highly detailed", request.prompt)),
        }])
    }
}

struct TestApp {
    state: Arc<AppState>,
    router: Router,
    _dir: tempfile::TempDir,
}

fn app(connected: bool, rpm: u32, delay: Duration) -> TestApp {
    app_with(connected, rpm, delay, |_| {})
}

fn app_with(
    connected: bool,
    rpm: u32,
    delay: Duration,
    configure: impl FnOnce(&mut Settings),
) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings {
        save_dir: dir.path().join("images"),
        ..Settings::default()
    };
    configure(&mut settings);
    let state = Arc::new(AppState::new(settings));

    if connected {
        install(&state, Arc::new(StubGenerator::with_delay(delay)), rpm);
    }

    TestApp {
        router: create_router(state.clone()),
        state,
        _dir: dir,
    }
}

fn install(state: &AppState, generator: Arc<StubGenerator>, rpm: u32) -> Arc<Session> {
    let config = DispatcherConfig {
        margin: Duration::ZERO,
        ..state.settings.dispatcher_config(rpm)
    };
    state.install_session(Session::with_generator(generator, None, config, state.budget()))
}

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };

    let response = router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

async fn send_json(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = send(router, method, uri, body).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let app = app(false, 1, Duration::ZERO);
    let (status, body) = send_json(&app.router, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_settings_lists_form_options() {
    let app = app(false, 1, Duration::ZERO);
    let (status, body) = send_json(&app.router, Method::GET, "/api/settings", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["connection"]["deployment"], "Dalle3");
    assert_eq!(body["connection"]["has_key"], false);
    assert!(body["connection"].get("key").is_none());
    assert_eq!(body["generation"]["size"], "1024x1024");
    assert_eq!(
        body["options"]["size"],
        json!(["1024x1024", "1792x1024", "1024x1792"])
    );
    assert_eq!(body["options"]["api_version"], json!(["2024-02-01", "2024-02-15-preview"]));
}

#[tokio::test]
async fn test_generate_without_session() {
    let app = app(false, 1, Duration::ZERO);
    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/api/generate",
        Some(json!({ "prompt": "cat" })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "configuration_error");
    assert_eq!(body["error"]["code"], "no_session");
}

#[tokio::test]
async fn test_open_session_validates_connection() {
    let app = app(false, 1, Duration::ZERO);

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/api/session",
        Some(json!({ "key": "k", "endpoint": "not a url" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "configuration_error");

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/api/session",
        Some(json!({
            "key": "k",
            "endpoint": "https://example.openai.azure.com",
            "api_version": "2024-02-15-preview",
            "rpm": 4
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["connected"], true);
    assert_eq!(body["deployment"], "Dalle3");
    assert_eq!(body["api_version"], "2024-02-15-preview");
    assert_eq!(body["stats"]["rpm"], 4);

    let (status, _) = send(&app.router, Method::DELETE, "/api/session", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = send_json(&app.router, Method::GET, "/api/session", None).await;
    assert_eq!(body["connected"], false);
}

#[tokio::test]
async fn test_generate_rejects_invalid_parameters() {
    let app = app(true, 5, Duration::ZERO);

    for payload in [
        json!({ "prompt": "cat", "size": "800x800" }),
        json!({ "prompt": "" }),
        json!({ "prompt": "cat", "num": 0 }),
        json!({ "prompt": "cat", "style": "oil painting" }),
    ] {
        let (status, body) =
            send_json(&app.router, Method::POST, "/api/generate", Some(payload)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "validation_error");
    }

    assert!(app.state.jobs.is_empty());
}

#[tokio::test]
async fn test_generate_wait_view_and_save() {
    let app = app(true, 5, Duration::ZERO);

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/api/generate",
        Some(json!({ "prompt": "a cat on a mat", "num": 2, "quality": "hd" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let jobs = body["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 2);

    let id = jobs[0]["id"].as_str().unwrap().to_string();
    let (status, job) = send_json(
        &app.router,
        Method::GET,
        &format!("/api/jobs/{}?wait_secs=5", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["state"], "succeeded");
    assert_eq!(job["images"][0]["content_type"], "image/png");
    assert_eq!(
        job["images"][0]["revised_prompt"],
        "a cat on a mat, highly detailed"
    );

    let image_url = job["images"][0]["url"].as_str().unwrap().to_string();
    let (status, bytes) = send(&app.router, Method::GET, &image_url, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, PNG_BYTES.to_vec());

    let (status, saved) = send_json(
        &app.router,
        Method::POST,
        &format!("{}/save", image_url),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let saved_path = std::path::PathBuf::from(saved["path"].as_str().unwrap());
    assert!(saved_path.exists());
    assert!(saved_path.starts_with(app.state.settings.save_dir.as_path()));

    let (_, listed) = send_json(&app.router, Method::GET, "/api/jobs", None).await;
    assert_eq!(listed.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_cancel_queued_job() {
    let app = app(true, 1, Duration::ZERO);

    let (_, body) = send_json(
        &app.router,
        Method::POST,
        "/api/generate",
        Some(json!({ "prompt": "cat", "num": 2 })),
    )
    .await;
    let second = body["jobs"][1]["id"].as_str().unwrap().to_string();

    let (status, job) =
        send_json(&app.router, Method::DELETE, &format!("/api/jobs/{}", second), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["state"], "cancelled");

    // A finished job is forgotten on the second delete
    let (status, _) =
        send_json(&app.router, Method::DELETE, &format!("/api/jobs/{}", second), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) =
        send_json(&app.router, Method::GET, &format!("/api/jobs/{}", second), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "job_not_found");
}

#[tokio::test]
async fn test_dispatched_job_cannot_be_cancelled() {
    let app = app(true, 5, Duration::from_secs(30));

    let (_, body) = send_json(
        &app.router,
        Method::POST,
        "/api/generate",
        Some(json!({ "prompt": "cat" })),
    )
    .await;
    let id = body["jobs"][0]["id"].as_str().unwrap().to_string();

    let record = app.state.job(id.parse().unwrap()).unwrap();
    let mut rx = record.handle.subscribe();
    rx.wait_for(|state| matches!(state, JobState::Dispatched))
        .await
        .unwrap();

    let (status, body) =
        send_json(&app.router, Method::DELETE, &format!("/api/jobs/{}", id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["type"], "invalid_state_error");
}

#[tokio::test]
async fn test_closing_session_cancels_queued_jobs() {
    let app = app(true, 1, Duration::ZERO);

    let (_, body) = send_json(
        &app.router,
        Method::POST,
        "/api/generate",
        Some(json!({ "prompt": "cat", "num": 3 })),
    )
    .await;
    let last = body["jobs"][2]["id"].as_str().unwrap().to_string();

    let (status, _) = send(&app.router, Method::DELETE, "/api/session", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let record = app.state.job(last.parse().unwrap()).unwrap();
    assert!(matches!(record.handle.state(), JobState::Cancelled));
}

#[tokio::test]
async fn test_fractional_num_is_truncated() {
    let app = app(true, 5, Duration::ZERO);

    for (num, expected) in [(json!(2.0), 2), (json!(2.9), 2), (json!(1), 1)] {
        let (status, body) = send_json(
            &app.router,
            Method::POST,
            "/api/generate",
            Some(json!({ "prompt": "cat", "num": num })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["jobs"].as_array().unwrap().len(), expected);
    }

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/api/generate",
        Some(json!({ "prompt": "cat", "num": 0.5 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "validation_error");
}

#[tokio::test]
async fn test_malformed_body_uses_error_envelope() {
    let app = app(true, 5, Duration::ZERO);

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/api/generate",
        Some(json!({ "prompt": 5 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "validation_error");

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/api/session",
        Some(json!({ "key": "k" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "configuration_error");
}

#[tokio::test]
async fn test_fan_out_is_all_or_nothing() {
    let app = app_with(true, 1, Duration::ZERO, |s| s.max_queue_size = 2);

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/api/generate",
        Some(json!({ "prompt": "cat", "num": 3 })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "queue_full");
    assert!(app.state.jobs.is_empty());
    let session = app.state.current_session().unwrap();
    assert_eq!(session.dispatcher().stats().queued, 0);

    let (status, body) = send_json(
        &app.router,
        Method::POST,
        "/api/generate",
        Some(json!({ "prompt": "cat", "num": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["jobs"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_oldest_finished_jobs_are_evicted() {
    let app = app_with(true, 5, Duration::ZERO, |s| s.max_jobs = 2);

    let mut ids = Vec::new();
    for prompt in ["first", "second", "third"] {
        let (_, body) = send_json(
            &app.router,
            Method::POST,
            "/api/generate",
            Some(json!({ "prompt": prompt })),
        )
        .await;
        let id = body["jobs"][0]["id"].as_str().unwrap().to_string();
        let (_, job) = send_json(
            &app.router,
            Method::GET,
            &format!("/api/jobs/{}?wait_secs=5", id),
            None,
        )
        .await;
        assert_eq!(job["state"], "succeeded");
        ids.push(id);
    }

    assert_eq!(app.state.jobs.len(), 2);
    let (status, _) =
        send_json(&app.router, Method::GET, &format!("/api/jobs/{}", ids[0]), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) =
        send_json(&app.router, Method::GET, &format!("/api/jobs/{}", ids[2]), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_keeps_rate_budget() {
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::new(Settings {
        save_dir: dir.path().to_path_buf(),
        ..Settings::default()
    });
    let generator = Arc::new(StubGenerator::default());
    let t0 = Instant::now();

    let mut records = Vec::new();
    install(&state, generator.clone(), 2);
    let mut request = GenerationRequest::new("cat");
    request.num = 2;
    records.extend(state.submit(request.clone()).unwrap());
    for record in &records {
        record.handle.wait().await;
    }

    install(&state, generator.clone(), 2);
    records.extend(state.submit(request).unwrap());
    for record in &records {
        assert!(matches!(record.handle.wait().await, JobState::Succeeded(_)));
    }

    let offsets: Vec<Duration> = generator
        .calls
        .lock()
        .unwrap()
        .iter()
        .map(|t| *t - t0)
        .collect();
    let minute = Duration::from_secs(60);
    assert_eq!(offsets, vec![Duration::ZERO, Duration::ZERO, minute, minute]);
}
