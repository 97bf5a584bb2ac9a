//! HTTP surface: auth, idempotency, request ids, and the end-to-end
//! register -> escrow -> release flow over the router.

mod common;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use common::*;
use serde_json::{json, Value};
use tower::ServiceExt;

use a2a_exchange::routes;

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Value, axum::http::HeaderMap) {
    let response = router.clone().oneshot(req).await.expect("infallible");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value, headers)
}

fn post(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn post_authed(path: &str, key: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {key}"))
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get_authed(path: &str, key: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .header(header::AUTHORIZATION, format!("Bearer {key}"))
        .body(Body::empty())
        .expect("request")
}

fn register_body(name: &str) -> Value {
    json!({
        "bot_name": name,
        "developer_id": "dev",
        "developer_name": "Test Dev",
        "contact_email": "test@test.dev",
        "skills": ["testing"],
    })
}

async fn register(router: &Router, name: &str) -> (String, String) {
    let (status, body, _) = send(router, post("/v1/accounts/register", register_body(name))).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["account"]["id"].as_str().expect("account id").to_string();
    let key = body["api_key"].as_str().expect("api key").to_string();
    assert!(key.starts_with("ate_"));
    (id, key)
}

#[tokio::test]
async fn health_is_public_on_all_prefixes() {
    let ex = setup().await;
    let router = routes::router(ex.state.clone());

    for path in ["/health", "/v1/health", "/api/v1/health"] {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        let (status, body, _) = send(&router, req).await;
        assert_eq!(status, StatusCode::OK, "{path}");
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "a2a-settlement-exchange");
    }
}

#[tokio::test]
async fn register_escrow_release_flow() {
    let ex = setup().await;
    let router = routes::router(ex.state.clone());

    let (provider_id, _provider_key) = register(&router, "ProviderBot").await;
    let (_requester_id, requester_key) = register(&router, "RequesterBot").await;

    let (status, body, _) = send(
        &router,
        post_authed(
            "/v1/exchange/escrow",
            &requester_key,
            json!({"provider_id": provider_id, "amount": 50}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["fee_amount"], 2);
    assert_eq!(body["total_held"], 52);
    let escrow_id = body["escrow_id"].as_str().unwrap().to_string();

    let (status, body, _) = send(
        &router,
        post_authed(
            "/v1/exchange/release",
            &requester_key,
            json!({"escrow_id": escrow_id}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "released");
    assert_eq!(body["amount_paid"], 50);

    let (status, body, _) = send(
        &router,
        get_authed("/v1/exchange/balance", &requester_key),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["available"], 48);
    assert_eq!(body["held_in_escrow"], 0);
}

#[tokio::test]
async fn duplicate_bot_name_conflicts() {
    let ex = setup().await;
    let router = routes::router(ex.state.clone());

    register(&router, "SameBot").await;
    let (status, body, _) =
        send(&router, post("/v1/accounts/register", register_body("SameBot"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("already exists"));
}

#[tokio::test]
async fn missing_auth_yields_envelope_with_request_id() {
    let ex = setup().await;
    let router = routes::router(ex.state.clone());

    let (status, body, headers) = send(
        &router,
        post("/v1/exchange/escrow", json!({"provider_id": "x", "amount": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "AUTH_REQUIRED");

    let request_id = body["error"]["request_id"].as_str().unwrap();
    assert!(request_id.starts_with("req_"));
    assert_eq!(
        headers.get("x-request-id").and_then(|v| v.to_str().ok()),
        Some(request_id)
    );
}

#[tokio::test]
async fn request_id_is_echoed_when_supplied() {
    let ex = setup().await;
    let router = routes::router(ex.state.clone());

    let req = Request::builder()
        .uri("/health")
        .header("x-request-id", "req_custom123")
        .body(Body::empty())
        .unwrap();
    let (_, _, headers) = send(&router, req).await;
    assert_eq!(
        headers.get("x-request-id").and_then(|v| v.to_str().ok()),
        Some("req_custom123")
    );
}

#[tokio::test]
async fn idempotent_replay_is_byte_identical() {
    let ex = setup().await;
    let router = routes::router(ex.state.clone());

    let (provider_id, _) = register(&router, "ProviderBot").await;
    let (_, requester_key) = register(&router, "RequesterBot").await;

    let body = json!({"provider_id": provider_id, "amount": 10, "task_id": "idem-task"});
    let make_req = || {
        let mut req = post_authed("/v1/exchange/escrow", &requester_key, body.clone());
        req.headers_mut()
            .insert("idempotency-key", "key-1".parse().unwrap());
        req
    };

    let first = router.clone().oneshot(make_req()).await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    let first_bytes = axum::body::to_bytes(first.into_body(), usize::MAX)
        .await
        .unwrap();

    let second = router.clone().oneshot(make_req()).await.unwrap();
    assert_eq!(second.status(), StatusCode::CREATED);
    let second_bytes = axum::body::to_bytes(second.into_body(), usize::MAX)
        .await
        .unwrap();

    assert_eq!(first_bytes, second_bytes, "replay must be byte-identical");

    // only one escrow was actually created
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM escrows")
        .fetch_one(ex.state.store.pool())
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn idempotency_key_reuse_with_new_body_conflicts() {
    let ex = setup().await;
    let router = routes::router(ex.state.clone());

    let (provider_id, _) = register(&router, "ProviderBot").await;
    let (_, requester_key) = register(&router, "RequesterBot").await;

    let mut req = post_authed(
        "/v1/exchange/escrow",
        &requester_key,
        json!({"provider_id": provider_id, "amount": 10}),
    );
    req.headers_mut()
        .insert("idempotency-key", "key-reused".parse().unwrap());
    let (status, _, _) = send(&router, req).await;
    assert_eq!(status, StatusCode::CREATED);

    let mut req = post_authed(
        "/v1/exchange/escrow",
        &requester_key,
        json!({"provider_id": provider_id, "amount": 99}),
    );
    req.headers_mut()
        .insert("idempotency-key", "key-reused".parse().unwrap());
    let (status, body, _) = send(&router, req).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "IDEMPOTENCY_CONFLICT");
}

#[tokio::test]
async fn directory_filters_by_skill() {
    let ex = setup().await;
    let router = routes::router(ex.state.clone());

    register(&router, "TesterBot").await;
    create_account(&ex.state, "UnrelatedBot", 100).await;

    let req = Request::builder()
        .uri("/v1/accounts/directory?skill=testing")
        .body(Body::empty())
        .unwrap();
    let (status, body, _) = send(&router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["bots"][0]["bot_name"], "TesterBot");
}

#[tokio::test]
async fn rotate_key_keeps_old_key_valid_within_grace() {
    let ex = setup().await;
    let router = routes::router(ex.state.clone());

    let (_, old_key) = register(&router, "RotatorBot").await;

    let (status, body, _) = send(
        &router,
        post_authed("/v1/accounts/rotate-key", &old_key, json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let new_key = body["api_key"].as_str().unwrap().to_string();
    assert_ne!(new_key, old_key);

    // both keys authenticate inside the grace window
    for key in [&old_key, &new_key] {
        let (status, _, _) = send(&router, get_authed("/v1/exchange/balance", key)).await;
        assert_eq!(status, StatusCode::OK);
    }
}

#[tokio::test]
async fn suspend_requires_operator() {
    let ex = setup().await;
    let router = routes::router(ex.state.clone());

    let (target_id, _) = register(&router, "TargetBot").await;
    let (_, peer_key) = register(&router, "PeerBot").await;

    let (status, body, _) = send(
        &router,
        post_authed(
            "/v1/accounts/admin/suspend",
            &peer_key,
            json!({"account_id": target_id}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "FORBIDDEN");
}

#[tokio::test]
async fn frozen_account_maps_to_http_423() {
    let ex = setup().await;
    let router = routes::router(ex.state.clone());

    let (provider_id, _) = register(&router, "ProviderBot").await;
    let (requester_id, requester_key) = register(&router, "RequesterBot").await;
    set_daily_spend_limit(&ex.state, &requester_id, 30).await;

    let escrow = |amount: i64, task: &str| {
        post_authed(
            "/v1/exchange/escrow",
            &requester_key,
            json!({"provider_id": provider_id, "amount": amount, "task_id": task}),
        )
    };

    let (status, _, _) = send(&router, escrow(20, "a")).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body, _) = send(&router, escrow(20, "b")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "SPEND_LIMIT_BREACHED");

    let (status, body, _) = send(&router, escrow(1, "c")).await;
    assert_eq!(status, StatusCode::LOCKED);
    assert_eq!(body["error"]["code"], "ACCOUNT_FROZEN");
}
