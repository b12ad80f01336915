use std::{path::PathBuf, sync::Arc, time::Duration};

use apicase::{
    load_templates, CancellationFlag, CaseLoader, CaseRunner, CaseStatus,
    ChannelSink, Environment, ExecutionEvent, Orchestrator, RunOutcome,
    StepStatus, TestCase, VariableContext,
};
use axum::{
    extract::RawQuery,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

struct TestServer {
    base_url: String,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    async fn spawn() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();

        let app = Router::new()
            .route(
                "/login",
                post(|Json(body): Json<Value>| async move {
                    let valid = body["username"] == "alice"
                        && body["password"] == "secret";
                    if valid {
                        (
                            StatusCode::OK,
                            Json(json!({"data": {"token": "abc123"}})),
                        )
                    } else {
                        (
                            StatusCode::UNAUTHORIZED,
                            Json(json!({"error": "bad credentials"})),
                        )
                    }
                }),
            )
            .route(
                "/profile",
                get(|headers: HeaderMap| async move {
                    let authorized = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        == Some("Bearer abc123");
                    if authorized {
                        (
                            StatusCode::OK,
                            Json(json!({"data": {"name": "alice", "id": 7}})),
                        )
                    } else {
                        (
                            StatusCode::UNAUTHORIZED,
                            Json(json!({"error": "missing token"})),
                        )
                    }
                }),
            )
            .route(
                "/search",
                get(|RawQuery(query): RawQuery| async move {
                    format!("searched {}", query.unwrap_or_default())
                }),
            )
            .route("/text", get(|| async move { "Hello runner world" }))
            .route(
                "/slow",
                get(|| async move {
                    tokio::time::sleep(Duration::from_millis(1500)).await;
                    "done"
                }),
            );

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let server = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });

        let handle = tokio::spawn(async move {
            if let Err(err) = server.await {
                eprintln!("test server error: {err}");
            }
        });
        let base_url = format!("http://{addr}");

        Self {
            base_url,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                let _ = handle.await;
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn fixture(path: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(path)
}

fn load_case(path: &str) -> TestCase {
    CaseLoader::new()
        .load_case(fixture(path))
        .unwrap_or_else(|e| panic!("failed to load case {path}: {e:#}"))
}

fn orchestrator(base_url: &str) -> Orchestrator {
    let templates = load_templates(fixture("templates.yaml"))
        .expect("failed to load template catalog");
    Orchestrator::new(Arc::new(templates)).with_environment(Environment {
        base_url: Some(base_url.to_string()),
        ..Default::default()
    })
}

fn inline_case(yaml: &str) -> TestCase {
    TestCase::from_yaml(yaml).expect("failed to parse inline case")
}

#[tokio::test]
async fn login_token_flows_into_later_requests() {
    let server = TestServer::spawn().await;
    let orchestrator = orchestrator(&server.base_url);
    let case = load_case("login_flow.yaml");

    let mut vars = VariableContext::new();
    let result = orchestrator
        .run(&case, &mut vars, &CancellationFlag::new())
        .await;

    assert!(result.success, "case should succeed: {:#?}", result.steps);
    assert_eq!(result.case_id.as_deref(), Some("42"));
    assert_eq!(result.total_steps, 4, "disabled steps are not run");
    assert_eq!((result.passed, result.skipped), (3, 1));

    let names: Vec<&str> =
        result.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["login", "fetch profile", "search by name", "marker"]
    );

    let login = &result.steps[0];
    assert_eq!(login.extracted["token"], json!("abc123"));
    let request = login.request.as_ref().unwrap();
    assert_eq!(
        request.body,
        Some(json!({"username": "alice", "password": "secret"}))
    );

    let profile = &result.steps[1];
    assert_eq!(
        profile.request.as_ref().unwrap().headers["Authorization"],
        "Bearer abc123"
    );
    assert_eq!(profile.assertions["authorized"], true);
    assert_eq!(profile.assertions["name"], true);

    let search = &result.steps[2];
    assert!(search
        .request
        .as_ref()
        .unwrap()
        .url
        .ends_with("/search"));
    assert_eq!(
        search.response.as_ref().unwrap().body,
        json!("searched q=alice")
    );

    assert_eq!(result.steps[3].status, StepStatus::Skipped);
    assert_eq!(result.variables["display_name"], json!("alice"));
    assert_eq!(result.variables["query"], json!("alice"));

    server.shutdown().await;
}

#[tokio::test]
async fn failed_assertion_does_not_stop_the_case() {
    let server = TestServer::spawn().await;
    let orchestrator = orchestrator(&server.base_url);
    let case = load_case("missing_token.yaml");

    let mut vars = VariableContext::new();
    let result = orchestrator
        .run(&case, &mut vars, &CancellationFlag::new())
        .await;

    assert_eq!(result.overall_status, CaseStatus::Failure);
    assert!(!result.success);

    let profile = &result.steps[0];
    assert_eq!(profile.status, StepStatus::Failure);
    assert_eq!(profile.response.as_ref().unwrap().status, 401);
    assert_eq!(profile.assertions["authorized"], false);
    assert_eq!(
        profile.request.as_ref().unwrap().headers["Authorization"],
        "Bearer ${token}",
        "unknown variables are left as written"
    );

    assert_eq!(result.steps[1].status, StepStatus::Success);
    assert_eq!(result.steps[1].assertions["greeting"], true);

    server.shutdown().await;
}

#[tokio::test]
async fn unreachable_host_is_a_step_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let orchestrator = orchestrator(&format!("http://{addr}"));
    let case = inline_case(
        r#"
name: unreachable
steps:
  - step_order: 1
    api_template_id: text
  - step_order: 2
"#,
    );

    let mut vars = VariableContext::new();
    let result = orchestrator
        .run(&case, &mut vars, &CancellationFlag::new())
        .await;

    assert_eq!(result.overall_status, CaseStatus::Error);
    assert_eq!(result.steps[0].status, StepStatus::Error);
    assert!(result.steps[0].response.is_none());
    let error = result.steps[0].error.as_deref().unwrap();
    assert!(
        error.starts_with("connection failed"),
        "unexpected error: {error}"
    );
    assert_eq!(result.steps[1].status, StepStatus::Skipped);
    assert!(result.error.is_none());
}

#[tokio::test]
async fn template_timeout_is_reported() {
    let server = TestServer::spawn().await;
    let orchestrator = orchestrator(&server.base_url);
    let case = inline_case(
        r#"
name: too slow
steps:
  - step_order: 1
    api_template_id: slow_short_timeout
"#,
    );

    let mut vars = VariableContext::new();
    let result = orchestrator
        .run(&case, &mut vars, &CancellationFlag::new())
        .await;

    assert_eq!(result.steps[0].status, StepStatus::Error);
    assert_eq!(
        result.steps[0].error.as_deref(),
        Some("request timed out after 1s")
    );

    server.shutdown().await;
}

#[tokio::test]
async fn cancel_lets_the_in_flight_step_finish() {
    let server = TestServer::spawn().await;
    let (sink, mut events) = ChannelSink::new();
    let orchestrator = Arc::new(
        orchestrator(&server.base_url).with_sink(Arc::new(sink)),
    );
    let case = inline_case(
        r#"
name: cancelled mid-run
steps:
  - name: slow
    step_order: 1
    api_template_id: slow
  - name: text
    step_order: 2
    api_template_id: text
"#,
    );

    let handle = orchestrator.spawn(case, VariableContext::new());
    loop {
        match events.recv().await {
            Some(ExecutionEvent::StepStarted { step_order: 1, .. }) => break,
            Some(_) => continue,
            None => panic!("event stream closed before the first step started"),
        }
    }
    handle.cancel();

    let result = match handle.wait(Some(Duration::from_secs(10))).await {
        RunOutcome::Finished(result) => result,
        RunOutcome::Abandoned => panic!("run did not finish"),
    };

    assert!(result.cancelled);
    assert_eq!(result.overall_status, CaseStatus::Partial);
    assert_eq!(result.steps.len(), 1);
    assert_eq!(result.steps[0].status, StepStatus::Success);
    assert_eq!(result.steps[0].response.as_ref().unwrap().body, json!("done"));

    let mut finished = None;
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::CaseFinished { result } = event {
            finished = Some(result);
        }
    }
    assert_eq!(finished.map(|r| r.steps.len()), Some(1));

    server.shutdown().await;
}

#[tokio::test]
async fn bounded_wait_abandons_a_slow_run() {
    let server = TestServer::spawn().await;
    let orchestrator = Arc::new(orchestrator(&server.base_url));
    let case = inline_case(
        r#"
name: slow
steps:
  - step_order: 1
    api_template_id: slow
"#,
    );

    let handle = orchestrator.spawn(case, VariableContext::new());
    let outcome = handle.wait(Some(Duration::from_millis(100))).await;
    assert!(matches!(outcome, RunOutcome::Abandoned));

    server.shutdown().await;
}
