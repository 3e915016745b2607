use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::quota::evaluator::{Decision, Denial, QuotaError};
use crate::quota::middleware::apply_rate_limit_headers;

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    /// An expected, user-facing quota denial. Never logged as an error.
    #[error("Quota denied for {}", .0.action)]
    QuotaDenied(Box<Decision>),

    #[error("Quota store unavailable: {0}")]
    QuotaUnavailable(#[from] QuotaError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Please authenticate".to_string(),
            ),
            AppError::QuotaDenied(decision) => return quota_denied_response(decision),
            AppError::QuotaUnavailable(e) => {
                tracing::error!("Quota store error: {e}");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "QUOTA_UNAVAILABLE",
                    "Usage limits cannot be verified right now".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}

/// 429 with enough structure for a client to render "try again in N seconds"
/// or "upgrade to tier T".
fn quota_denied_response(decision: &Decision) -> Response {
    let (code, message, required_tier) = match decision.denial {
        Some(Denial::TierGateRejected { required_tier }) => (
            "TIER_GATE_REJECTED",
            match required_tier {
                Some(t) => format!("{} requires the {t} plan or higher", decision.action),
                None => format!("{} is not available on any plan", decision.action),
            },
            required_tier,
        ),
        _ => (
            "QUOTA_EXHAUSTED",
            format!("{} limit reached. Please try again later.", decision.action),
            None,
        ),
    };
    let retry_after_secs = decision.retry_after_secs();

    let body = Json(json!({
        "error": {
            "code": code,
            "message": message
        },
        "action": decision.action,
        "retry_after_secs": retry_after_secs,
        "upgrade_required": decision.is_tier_gated(),
        "current_tier": decision.tier,
        "required_tier": required_tier,
        "limit": decision.limit,
        "resets_at": decision.resets_at,
    }));

    let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    apply_rate_limit_headers(response.headers_mut(), decision);
    if let Some(secs) = retry_after_secs {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::tier::{ActionKind, Tier};
    use std::time::Duration;

    fn decision(denial: Denial, retry_after: Option<Duration>) -> Decision {
        Decision {
            action: ActionKind::AiChat,
            tier: Tier::Free,
            allowed: false,
            limit: Some(5),
            remaining: Some(0),
            retry_after,
            resets_at: None,
            reset_after: retry_after,
            denial: Some(denial),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_exhausted_sets_retry_after() {
        let d = decision(Denial::QuotaExhausted, Some(Duration::from_secs(3600)));
        let response = AppError::QuotaDenied(Box::new(d)).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "3600");
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "QUOTA_EXHAUSTED");
        assert_eq!(body["retry_after_secs"], 3600);
        assert_eq!(body["upgrade_required"], false);
        assert_eq!(body["current_tier"], "free");
    }

    #[tokio::test]
    async fn test_tier_gate_requests_upgrade() {
        let d = decision(
            Denial::TierGateRejected {
                required_tier: Some(Tier::Pro),
            },
            None,
        );
        let response = AppError::QuotaDenied(Box::new(d)).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "TIER_GATE_REJECTED");
        assert_eq!(body["upgrade_required"], true);
        assert_eq!(body["required_tier"], "pro");
        assert!(body["retry_after_secs"].is_null());
    }
}
