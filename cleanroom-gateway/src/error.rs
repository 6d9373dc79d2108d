//! Gateway error taxonomy and HTTP mapping (`spec.md` §4.6, §7).
//!
//! Denials return a short JSON body carrying the machine-readable error
//! code and nothing about the policy that produced it
//! ("no policy details" per §7's user-visible-behavior note).

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Errors the gateway's HTTP surface can produce.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// No scope is registered for the request's source IP.
    #[error("scope.unknown_source")]
    UnknownSource,
    /// No scope is registered for the request's scope-token header.
    #[error("gateway.unknown_scope")]
    UnknownScope,
    /// A scope key was registered twice (`spec.md` §3 `GatewayScope`).
    #[error("gateway.duplicate_scope: {0}")]
    DuplicateScope(String),
    /// The request's normalized path failed `spec.md` §4.6's validation.
    #[error("gateway.bad_path: {0}")]
    BadPath(String),
    /// The target host:port is not on the scope's compiled-policy allow-list.
    #[error("gateway.host_not_allowed")]
    HostNotAllowed,
    /// `git-receive-pack` (push) was requested; gateway never allows it.
    #[error("git.push_denied")]
    GitPushDenied,
    /// A `/git/...` request did not match a recognized git subpath.
    #[error("git.unsupported")]
    GitUnsupported,
    /// No route matched the request path.
    #[error("gateway.route_unknown")]
    RouteUnknown,
    /// The upstream proxy request itself failed (DNS, TLS, connect, ...).
    #[error("gateway.upstream_failed: {0}")]
    UpstreamFailed(String),
}

impl GatewayError {
    /// The stable, machine-readable dotted error code, matching the
    /// variant names `spec.md` §7 enumerates.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::UnknownSource => "scope.unknown_source",
            Self::UnknownScope => "gateway.unknown_scope",
            Self::DuplicateScope(_) => "gateway.duplicate_scope",
            Self::BadPath(_) => "gateway.bad_path",
            Self::HostNotAllowed => "gateway.host_not_allowed",
            Self::GitPushDenied => "git.push_denied",
            Self::GitUnsupported => "git.unsupported",
            Self::RouteUnknown => "gateway.route_unknown",
            Self::UpstreamFailed(_) => "gateway.upstream_failed",
        }
    }

    const fn status(&self) -> StatusCode {
        match self {
            Self::UnknownSource => StatusCode::FORBIDDEN,
            Self::UnknownScope => StatusCode::FORBIDDEN,
            Self::DuplicateScope(_) => StatusCode::CONFLICT,
            Self::BadPath(_) => StatusCode::BAD_REQUEST,
            Self::HostNotAllowed => StatusCode::FORBIDDEN,
            Self::GitPushDenied => StatusCode::FORBIDDEN,
            Self::GitUnsupported => StatusCode::BAD_REQUEST,
            Self::RouteUnknown => StatusCode::NOT_FOUND,
            Self::UpstreamFailed(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        tracing::warn!(code, "gateway denied request");
        (status, Json(json!({ "error": code }))).into_response()
    }
}
