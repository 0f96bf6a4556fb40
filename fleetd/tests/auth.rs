use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use fleetd::{
    config::{AuthConfig, Config},
    http::build_router,
    wiring,
};
use tower::ServiceExt;

async fn router_with_admin_token(token: &str) -> (axum::Router, fleetd::state::AppState) {
    let cfg = Config {
        auth: AuthConfig { admin_tokens: vec![token.to_string()] },
        ..Config::default()
    };
    let state = wiring::build_state(&cfg).await.unwrap();
    (build_router(state.clone()), state)
}

async fn json_body(res: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn rejects_when_missing_credentials() {
    let (router, _) = router_with_admin_token("secret").await;

    let res = router
        .oneshot(Request::get("/me").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(res).await;
    assert_eq!(body["error"]["code"], "AUTH_REQUIRED");
}

#[tokio::test]
async fn rejects_invalid_token() {
    let (router, _) = router_with_admin_token("secret").await;

    let res = router
        .oneshot(
            Request::get("/me")
                .header(header::AUTHORIZATION, "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(res).await;
    assert_eq!(body["error"]["code"], "AUTH_FAILED");
}

#[tokio::test]
async fn register_then_me_round_trips() {
    let (router, _) = router_with_admin_token("secret").await;

    let res = router
        .clone()
        .oneshot(
            Request::post("/auth/register")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"email":"owner@example.com","password":"hunter2hunter2"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body = json_body(res).await;
    let token = body["token"].as_str().unwrap().to_string();
    assert!(body["user"].get("password_hash").is_none());

    let res = router
        .oneshot(
            Request::get("/me")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["email"], "owner@example.com");
}

#[tokio::test]
async fn login_rejects_bad_password() {
    let (router, _) = router_with_admin_token("secret").await;

    let res = router
        .clone()
        .oneshot(
            Request::post("/auth/register")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"email":"owner@example.com","password":"hunter2hunter2"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    let res = router
        .oneshot(
            Request::post("/auth/login")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"email":"owner@example.com","password":"wrongwrong"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_routes_require_the_admin_claim() {
    let (router, _) = router_with_admin_token("secret").await;

    // regular users get 403
    let res = router
        .clone()
        .oneshot(
            Request::post("/auth/register")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"email":"pleb@example.com","password":"hunter2hunter2"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    let token = json_body(res).await["token"].as_str().unwrap().to_string();

    let res = router
        .clone()
        .oneshot(
            Request::get("/admin/fleet/hubs")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    // the static operator token passes, constant-time compared
    let res = router
        .oneshot(
            Request::get("/admin/fleet/hubs")
                .header(header::AUTHORIZATION, "Bearer secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}
