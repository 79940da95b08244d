//! HTTP-01 challenge responder for the plaintext listener.
//!
//! Requests under `/.well-known/acme-challenge/` are answered with the key
//! authorization held by the certificate manager. Everything else falls through
//! to the application handler untouched.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use super::Provisioner;

pub const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

pub(super) fn wrap(provisioner: Provisioner, handler: Router) -> Router {
    Router::new()
        .route("/.well-known/acme-challenge/{token}", get(answer_challenge))
        .fallback_service(handler)
        .with_state(provisioner)
}

async fn answer_challenge(
    State(provisioner): State<Provisioner>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(strip_port)
        .unwrap_or_default();

    if !provisioner.allow_list().permits(host) {
        tracing::warn!(host = %host, "Rejecting ACME challenge for host outside allow-list");
        return (StatusCode::FORBIDDEN, "host not allowed").into_response();
    }

    match provisioner.key_authorization(&token) {
        Some(key_auth) => {
            tracing::info!(host = %host, token = %token, "Answering ACME HTTP-01 challenge");
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain")],
                key_auth,
            )
                .into_response()
        }
        None => {
            tracing::debug!(token = %token, "Unknown ACME challenge token");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// Remove an optional `:port` suffix, leaving bracketed IPv6 literals intact.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.split_inclusive(']').next().unwrap_or(host);
    }
    host.split(':').next().unwrap_or(host)
}
