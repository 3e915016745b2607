pub mod health;
pub mod quota;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::quota::middleware::throttle_by_origin;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/v1/quota/check", post(quota::handle_check))
        .route("/v1/quota/reserve", post(quota::handle_reserve))
        .route("/v1/quota/commit", post(quota::handle_commit))
        .route("/v1/quota/release", post(quota::handle_release))
        .route("/v1/quota/refund", post(quota::handle_refund))
        .route("/v1/quota/usage", get(quota::handle_usage))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            throttle_by_origin,
        ));

    Router::new()
        .route("/health", get(health::health_handler))
        .nest("/api", api)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
        response::Response,
    };
    use chrono::{DateTime, Duration, Utc};
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::*;
    use crate::accounts::memory::InMemoryAccountStore;
    use crate::config::Config;
    use crate::quota::clock::SystemClock;
    use crate::quota::evaluator::QuotaEvaluator;
    use crate::quota::policy::PolicyTable;
    use crate::quota::store::{CounterStore, InMemoryCounterStore, QuotaCounter, StoreError};
    use crate::quota::tier::CounterKey;

    fn app_with(policies: PolicyTable, store: Arc<dyn CounterStore>) -> (Router, Arc<InMemoryAccountStore>) {
        let accounts = Arc::new(InMemoryAccountStore::default());
        let state = AppState {
            quota: Arc::new(QuotaEvaluator::new(policies, store, Arc::new(SystemClock))),
            accounts: accounts.clone(),
            config: Config::for_tests(),
        };
        (build_router(state), accounts)
    }

    fn app() -> (Router, Arc<InMemoryAccountStore>) {
        app_with(PolicyTable::defaults(), Arc::new(InMemoryCounterStore::new()))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> Response {
        app.clone().oneshot(request).await.unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let response = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_check_exhausts_free_chat_quota() {
        let (app, accounts) = app();
        let user = accounts.insert("free", true);
        let req = json!({ "user_id": user, "action": "ai_chat" });

        for expected in [4, 3, 2, 1, 0] {
            let response = send(&app, post_json("/api/v1/quota/check", req.clone())).await;
            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            assert_eq!(body["allowed"], true);
            assert_eq!(body["remaining"], expected);
        }

        let response = send(&app, post_json("/api/v1/quota/check", req)).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry: u64 = response.headers()[header::RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry > 23 * 3600 && retry <= 24 * 3600, "retry was {retry}");
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "QUOTA_EXHAUSTED");
        assert_eq!(body["upgrade_required"], false);
    }

    #[tokio::test]
    async fn test_check_tier_gate_requires_upgrade() {
        let (app, accounts) = app();
        let user = accounts.insert("free", true);
        let response = send(
            &app,
            post_json(
                "/api/v1/quota/check",
                json!({ "user_id": user, "action": "ai_suggestion" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "TIER_GATE_REJECTED");
        assert_eq!(body["upgrade_required"], true);
        assert_eq!(body["current_tier"], "free");
        assert_eq!(body["required_tier"], "pro");
    }

    #[tokio::test]
    async fn test_unknown_tier_gets_free_limits() {
        let (app, accounts) = app();
        let user = accounts.insert("gold", true);
        let response = send(
            &app,
            post_json(
                "/api/v1/quota/check",
                json!({ "user_id": user, "action": "docx_export" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_enterprise_unlimited_reports_null_remaining() {
        let (app, accounts) = app();
        let user = accounts.insert("enterprise", true);
        let response = send(
            &app,
            post_json(
                "/api/v1/quota/check",
                json!({ "user_id": user, "action": "ai_suggestion" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["remaining"].is_null());
        assert!(body["limit"].is_null());
    }

    #[tokio::test]
    async fn test_missing_and_inactive_accounts() {
        let (app, accounts) = app();
        let response = send(
            &app,
            post_json(
                "/api/v1/quota/check",
                json!({ "user_id": Uuid::new_v4(), "action": "ai_chat" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let inactive = accounts.insert("pro", false);
        let response = send(
            &app,
            post_json(
                "/api/v1/quota/check",
                json!({ "user_id": inactive, "action": "ai_chat" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_usage_does_not_consume() {
        let (app, accounts) = app();
        let user = accounts.insert("pro", true);
        send(
            &app,
            post_json("/api/v1/quota/check", json!({ "user_id": user, "action": "ai_chat" })),
        )
        .await;

        let uri = format!("/api/v1/quota/usage?user_id={user}&action=ai_chat");
        for _ in 0..3 {
            let response = send(&app, Request::get(&uri).body(Body::empty()).unwrap()).await;
            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            assert_eq!(body["used"], 1);
            assert_eq!(body["remaining"], 99);
        }
    }

    #[tokio::test]
    async fn test_reserve_release_refunds_successful_logins() {
        let (app, _) = app();
        let attempt = json!({ "action": "auth_attempt" });

        for _ in 0..10 {
            let response = send(&app, post_json("/api/v1/quota/reserve", attempt.clone())).await;
            assert_eq!(response.status(), StatusCode::OK);
            let reservation = body_json(response).await["reservation"].clone();
            let response = send(&app, post_json("/api/v1/quota/release", reservation)).await;
            assert_eq!(body_json(response).await["refunded"], true);
        }

        for _ in 0..5 {
            let response = send(&app, post_json("/api/v1/quota/reserve", attempt.clone())).await;
            let reservation = body_json(response).await["reservation"].clone();
            let response = send(&app, post_json("/api/v1/quota/commit", reservation)).await;
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
        }

        let response = send(&app, post_json("/api/v1/quota/reserve", attempt)).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_release_cannot_be_replayed() {
        let (app, _) = app();
        let attempt = json!({ "action": "auth_attempt" });
        let response = send(&app, post_json("/api/v1/quota/reserve", attempt.clone())).await;
        let first = body_json(response).await["reservation"].clone();
        let response = send(&app, post_json("/api/v1/quota/commit", first.clone())).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        for _ in 0..20 {
            let response = send(&app, post_json("/api/v1/quota/reserve", attempt.clone())).await;
            if response.status() == StatusCode::OK {
                let reservation = body_json(response).await["reservation"].clone();
                send(&app, post_json("/api/v1/quota/commit", reservation)).await;
            }
            let response = send(&app, post_json("/api/v1/quota/release", first.clone())).await;
            assert_eq!(body_json(response).await["refunded"], false);
        }

        let mut forged = first;
        forged["id"] = json!(Uuid::new_v4());
        let response = send(&app, post_json("/api/v1/quota/release", forged)).await;
        assert_eq!(body_json(response).await["refunded"], false);
    }

    #[tokio::test]
    async fn test_deleting_resume_allows_another() {
        let (app, accounts) = app();
        let user = accounts.insert("free", true);
        let req = json!({ "user_id": user, "action": "resume_create" });

        let response = send(&app, post_json("/api/v1/quota/check", req.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = send(&app, post_json("/api/v1/quota/check", req.clone())).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = send(&app, post_json("/api/v1/quota/refund", req.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["refunded"], true);

        let response = send(&app, post_json("/api/v1/quota/check", req)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["remaining"], 0);
    }

    #[tokio::test]
    async fn test_refund_ignored_for_metered_actions() {
        let (app, accounts) = app();
        let user = accounts.insert("free", true);
        let req = json!({ "user_id": user, "action": "ai_chat" });
        send(&app, post_json("/api/v1/quota/check", req.clone())).await;
        let response = send(&app, post_json("/api/v1/quota/refund", req)).await;
        assert_eq!(body_json(response).await["refunded"], false);

        let uri = format!("/api/v1/quota/usage?user_id={user}&action=ai_chat");
        let response = send(&app, Request::get(&uri).body(Body::empty()).unwrap()).await;
        assert_eq!(body_json(response).await["used"], 1);
    }

    #[tokio::test]
    async fn test_origin_throttle_applies_to_api_routes() {
        let policies = PolicyTable::defaults()
            .with_overrides_json(
                r#"{ "api_request": { "tiers": { "free": {
                    "max_requests": 2, "window": { "kind": "rolling", "window_ms": 60000 } } } } }"#,
            )
            .unwrap();
        let (app, accounts) = app_with(policies, Arc::new(InMemoryCounterStore::new()));
        let user = accounts.insert("pro", true);
        let uri = format!("/api/v1/quota/usage?user_id={user}&action=ai_chat");

        let first = send(&app, Request::get(&uri).body(Body::empty()).unwrap()).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["ratelimit-limit"], "2");
        assert_eq!(first.headers()["ratelimit-remaining"], "1");
        send(&app, Request::get(&uri).body(Body::empty()).unwrap()).await;

        let third = send(&app, Request::get(&uri).body(Body::empty()).unwrap()).await;
        assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);

        // /health is outside the throttle.
        let health = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(health.status(), StatusCode::OK);
    }

    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn peek(&self, _: &CounterKey) -> Result<Option<QuotaCounter>, StoreError> {
            Err(StoreError::Unavailable("timeout".into()))
        }
        async fn reset_and_increment(
            &self,
            _: &CounterKey,
            _: Option<DateTime<Utc>>,
            _: DateTime<Utc>,
            _: Duration,
        ) -> Result<QuotaCounter, StoreError> {
            Err(StoreError::Unavailable("timeout".into()))
        }
        async fn try_increment(&self, _: &CounterKey) -> Result<QuotaCounter, StoreError> {
            Err(StoreError::Unavailable("timeout".into()))
        }
        async fn hold(&self, _: &CounterKey, _: DateTime<Utc>, _: Uuid) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("timeout".into()))
        }
        async fn settle(&self, _: &CounterKey, _: Uuid) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("timeout".into()))
        }
        async fn decrement(
            &self,
            _: &CounterKey,
            _: Uuid,
        ) -> Result<Option<QuotaCounter>, StoreError> {
            Err(StoreError::Unavailable("timeout".into()))
        }
        async fn refund(&self, _: &CounterKey) -> Result<Option<QuotaCounter>, StoreError> {
            Err(StoreError::Unavailable("timeout".into()))
        }
    }

    #[tokio::test]
    async fn test_store_outage_fails_open_for_throttle_and_closed_for_checks() {
        let (app, accounts) = app_with(PolicyTable::defaults(), Arc::new(DownStore));
        let user = accounts.insert("pro", true);
        let response = send(
            &app,
            post_json("/api/v1/quota/check", json!({ "user_id": user, "action": "ai_chat" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["error"]["code"], "QUOTA_UNAVAILABLE");
    }
}
