//! Authorization seam: API-key management and admin login are handled by
//! an external collaborator, not this crate. This trait is the
//! well-defined entry point such a collaborator plugs into; the gateway
//! itself ships only a permissive no-op.

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::state::AppState;

#[async_trait]
pub trait AuthLayer: Send + Sync {
    /// Whether the caller-presented `Authorization` header value (if any)
    /// may proceed. Called once per request, ahead of routing.
    async fn authorize(&self, authorization: Option<&str>) -> bool;
}

/// Ships by default: every request is authorized. A real deployment
/// swaps this for an `AuthLayer` backed by its own API-key store.
pub struct NoopAuth;

#[async_trait]
impl AuthLayer for NoopAuth {
    async fn authorize(&self, _authorization: Option<&str>) -> bool {
        true
    }
}

pub async fn auth_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let header = req.headers().get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    if state.auth.authorize(header).await {
        next.run(req).await
    } else {
        (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
    }
}
