use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use chrono::Utc;
use http_body_util::BodyExt;
use tower::ServiceExt;

use dragnet_core::config::QueueConfig;
use dragnet_core::store::HeartbeatStore;
use dragnet_core::worker::{WorkerHeartbeat, WorkerState};
use dragnet_core::{AppError, TaskManager};

use crate::integration::common::{TEST_API_KEY, TestApp, setup_test_app, setup_test_app_no_auth};

fn get(uri: &str) -> Request<Body> {
    Request::get(uri)
        .header("authorization", format!("Bearer {TEST_API_KEY}"))
        .body(Body::empty())
        .unwrap()
}

fn send_json(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {TEST_API_KEY}"))
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

async fn json(response: Response) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

async fn enqueue(app: &TestApp, id: &str) -> Response {
    app.router
        .clone()
        .oneshot(send_json(
            "POST",
            "/v1/tasks",
            serde_json::json!({"id": id, "payload": {"name": id}}),
        ))
        .await
        .unwrap()
}

#[tokio::test]
async fn health_returns_200() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let json = json(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["database"], "ok");
}

#[tokio::test]
async fn unauthenticated_request_returns_401() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(Request::get("/v1/counts").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn wrong_api_key_returns_401() {
    let app = setup_test_app().await;

    let response = app
        .router
        .oneshot(
            Request::get("/v1/counts")
                .header("authorization", "Bearer wrong-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn no_admin_token_returns_403() {
    let app = setup_test_app_no_auth().await;

    let response = app
        .router
        .oneshot(
            Request::get("/v1/counts")
                .header("authorization", "Bearer any-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json(response).await["error"], "forbidden");
}

#[tokio::test]
async fn enqueue_is_idempotent() {
    let app = setup_test_app().await;

    let response = enqueue(&app, "acme").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(json(response).await["outcome"], "created");

    let response = enqueue(&app, "acme").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["outcome"], "duplicate");

    let response = app.router.clone().oneshot(get("/v1/counts")).await.unwrap();
    let counts = json(response).await;
    assert_eq!(counts["pending"], 1);
    assert_eq!(counts["total"], 1);
}

#[tokio::test]
async fn enqueue_rejects_invalid_input() {
    let app = setup_test_app().await;

    let response = enqueue(&app, "   ").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json(response).await["error"], "validation_error");

    let response = app
        .router
        .clone()
        .oneshot(send_json(
            "POST",
            "/v1/tasks",
            serde_json::json!({"id": "acme", "payload": {}, "max_attempts": 0}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn get_task_returns_details_or_404() {
    let app = setup_test_app().await;
    enqueue(&app, "acme").await;

    let response = app.router.clone().oneshot(get("/v1/tasks/acme")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let task = json(response).await;
    assert_eq!(task["id"], "acme");
    assert_eq!(task["state"], "pending");
    assert_eq!(task["attempts"], 0);
    assert_eq!(task["max_attempts"], 2);
    assert_eq!(task["payload"]["name"], "acme");

    let response = app.router.clone().oneshot(get("/v1/tasks/nobody")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json(response).await["error"], "not_found");
}

#[tokio::test]
async fn list_tasks_filters_by_state() {
    let app = setup_test_app().await;
    for id in ["a", "b", "c"] {
        enqueue(&app, id).await;
    }
    let tm = TaskManager::new(app.db.task_store(), QueueConfig::default());
    tm.claim("w1").await.unwrap().unwrap();

    let response = app
        .router
        .clone()
        .oneshot(get("/v1/tasks?state=pending"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let list = json(response).await;
    assert_eq!(list["total"], 2);
    assert_eq!(list["tasks"][0]["id"], "b");

    let response = app
        .router
        .clone()
        .oneshot(get("/v1/tasks?state=claimed"))
        .await
        .unwrap();
    let list = json(response).await;
    assert_eq!(list["total"], 1);
    assert_eq!(list["tasks"][0]["claimed_by"], "w1");

    let response = app
        .router
        .clone()
        .oneshot(get("/v1/tasks?state=running"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn revive_moves_failed_tasks_back_to_pending() {
    let app = setup_test_app().await;
    enqueue(&app, "acme").await;
    enqueue(&app, "beta").await;

    let tm = TaskManager::new(app.db.task_store(), QueueConfig::default());
    let task = tm.claim("w1").await.unwrap().unwrap();
    tm.ack_failure(&task.id, &AppError::permanent("no website"))
        .await
        .unwrap();

    let response = app
        .router
        .clone()
        .oneshot(send_json("POST", "/v1/tasks/acme/revive", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["state"], "pending");

    // Still pending, so a second revive is a conflict.
    let response = app
        .router
        .clone()
        .oneshot(send_json("POST", "/v1/tasks/beta/revive", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .router
        .clone()
        .oneshot(send_json("POST", "/v1/tasks/ghost/revive", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn reclaim_leaves_live_leases_alone() {
    let app = setup_test_app().await;
    enqueue(&app, "acme").await;
    let tm = TaskManager::new(app.db.task_store(), QueueConfig::default());
    tm.claim("w1").await.unwrap().unwrap();

    let response = app
        .router
        .clone()
        .oneshot(send_json("POST", "/v1/reclaim", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["total"], 0);
    assert_eq!(body["reclaimed"], serde_json::json!([]));
}

#[tokio::test]
async fn workers_lists_heartbeats() {
    let app = setup_test_app().await;
    let mut heartbeat = WorkerHeartbeat::new("host-1-0", Utc::now());
    heartbeat.state = WorkerState::Running;
    heartbeat.tasks_done = 7;
    app.db.task_store().beat(&heartbeat).await.unwrap();

    let response = app.router.clone().oneshot(get("/v1/workers")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["workers"][0]["worker_id"], "host-1-0");
    assert_eq!(body["workers"][0]["state"], "running");
    assert_eq!(body["workers"][0]["tasks_done"], 7);
    assert_eq!(body["workers"][0]["stalled"], false);
    assert_eq!(body["stalled"], 0);
}

#[tokio::test]
async fn rate_limit_can_be_read_and_changed() {
    let app = setup_test_app().await;

    let response = app.router.clone().oneshot(get("/v1/rate-limit")).await.unwrap();
    let body = json(response).await;
    assert_eq!(body["limit"], 60);
    assert_eq!(body["window_secs"], 60);

    let response = app
        .router
        .clone()
        .oneshot(send_json(
            "PUT",
            "/v1/rate-limit",
            serde_json::json!({"limit": 120}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.router.clone().oneshot(get("/v1/rate-limit")).await.unwrap();
    assert_eq!(json(response).await["limit"], 120);

    let response = app
        .router
        .clone()
        .oneshot(send_json(
            "PUT",
            "/v1/rate-limit",
            serde_json::json!({"limit": 0}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
