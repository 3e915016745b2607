//! HTTP glue for the quota subsystem: client-origin extraction, the
//! per-origin request throttle and the `RateLimit-*` response headers.

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{request::Parts, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::errors::AppError;
use crate::quota::evaluator::Decision;
use crate::quota::tier::{ActionKind, Subject, Tier};
use crate::state::AppState;

static RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
static RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
static RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

/// Network origin of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOrigin(pub IpAddr);

#[async_trait]
impl FromRequestParts<AppState> for ClientOrigin {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        Ok(ClientOrigin(resolve_origin(
            &parts.headers,
            peer,
            state.config.trust_proxy,
        )))
    }
}

/// First `X-Forwarded-For` hop when behind a trusted proxy, else the socket peer.
pub fn resolve_origin(headers: &HeaderMap, peer: Option<IpAddr>, trust_proxy: bool) -> IpAddr {
    let forwarded = trust_proxy
        .then(|| headers.get("x-forwarded-for"))
        .flatten()
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|hop| hop.trim().parse::<IpAddr>().ok());

    forwarded
        .or(peer)
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// Throttles every request by network origin. Fails open: a counter store
/// outage must not take the whole API down.
pub async fn throttle_by_origin(
    State(state): State<AppState>,
    origin: ClientOrigin,
    request: Request,
    next: Next,
) -> Response {
    let subject = Subject::Origin(origin.0);
    match state
        .quota
        .check(subject, ActionKind::ApiRequest, Tier::Free)
        .await
    {
        Ok(decision) if decision.allowed => {
            let mut response = next.run(request).await;
            apply_rate_limit_headers(response.headers_mut(), &decision);
            response
        }
        Ok(decision) => AppError::QuotaDenied(Box::new(decision)).into_response(),
        Err(e) => {
            warn!("Origin throttling skipped for {subject}: {e}");
            next.run(request).await
        }
    }
}

/// Adds `RateLimit-Limit`, `RateLimit-Remaining` and `RateLimit-Reset`.
/// Unlimited decisions carry no headers.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    let (Some(limit), Some(remaining)) = (decision.limit, decision.remaining) else {
        return;
    };
    headers.insert(RATELIMIT_LIMIT.clone(), HeaderValue::from(limit));
    headers.insert(RATELIMIT_REMAINING.clone(), HeaderValue::from(remaining));
    if let Some(reset) = decision.reset_after {
        let secs = reset.as_secs() + u64::from(reset.subsec_nanos() > 0);
        headers.insert(RATELIMIT_RESET.clone(), HeaderValue::from(secs));
    }
}
