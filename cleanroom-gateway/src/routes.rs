//! Gateway HTTP routes (`spec.md` §4.6).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::Router;
use cleanroom_core::capability::{CredentialProvider, ScopeKey, ScopeRegistry};
use cleanroom_core::CompiledPolicy;
use serde_json::json;

use crate::error::GatewayError;
use crate::git::{self, GitOperation};
use crate::path::canonicalise_path;
use crate::scope::SCOPE_TOKEN_HEADER;

/// Shared state for every gateway request handler.
#[derive(Clone)]
pub struct GatewayState {
    /// Resolves a request to its originating sandbox's compiled policy.
    pub scope_registry: Arc<dyn ScopeRegistry>,
    /// Resolves upstream bearer credentials by host.
    pub credential_provider: Arc<dyn CredentialProvider>,
    /// Client used to proxy allowed requests upstream.
    pub http_client: reqwest::Client,
}

/// Builds the gateway's router: `/git/...`, `/meta/health`, and a
/// `gateway.route_unknown` fallback (`spec.md` §4.6).
#[must_use]
pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/meta/health", get(health))
        .route("/git/{*rest}", any(git_proxy))
        .fallback(route_unknown)
        .with_state(state)
}

/// `GET /meta/health` always returns 200.
async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

/// Any path not matched by an explicit route.
async fn route_unknown() -> GatewayError {
    GatewayError::RouteUnknown
}

/// Resolves the (sandbox id, policy) scope for an incoming request: the
/// scope-token header takes priority over source-IP scoping, per
/// `spec.md` §9's Open Question resolution (token scoping is the portable
/// path and the only one load-bearing for conformance).
fn resolve_scope(
    state: &GatewayState,
    remote: SocketAddr,
    headers: &HeaderMap,
) -> Result<(String, CompiledPolicy), GatewayError> {
    if let Some(token) = headers
        .get(SCOPE_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        return state
            .scope_registry
            .lookup(&ScopeKey::Token(token.to_owned()))
            .ok_or(GatewayError::UnknownScope);
    }

    state
        .scope_registry
        .lookup(&ScopeKey::SourceIp(remote.ip()))
        .ok_or(GatewayError::UnknownSource)
}

/// `/git/<host>/<repo-path>...` (`spec.md` §4.6).
async fn git_proxy(
    State(state): State<GatewayState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let (_sandbox_id, policy) = resolve_scope(&state, remote, &headers)?;
    let path = canonicalise_path(uri.path())?;
    let query = uri.query();
    let op = git::classify(&path, query, &method);

    let host = match op {
        GitOperation::ReceivePack => return Err(GatewayError::GitPushDenied),
        GitOperation::Unsupported => return Err(GatewayError::GitUnsupported),
        GitOperation::UploadPackInfo { host, .. } | GitOperation::UploadPackService { host, .. } => {
            host
        }
    };

    if !policy.permits(&host, 443) {
        return Err(GatewayError::HostNotAllowed);
    }

    proxy_to_upstream(&state, &host, &path, query, method, headers, &body).await
}

/// Forwards an allowed request to `https://<host>/<path>[?query]`,
/// injecting a bearer credential when the provider resolves one
/// (`spec.md` §4.6 credential-provider contract).
fn upstream_url(host: &str, path: &str, query: Option<&str>) -> String {
    let rest = path
        .strip_prefix(&format!("/git/{host}"))
        .unwrap_or(path);
    let mut url = format!("https://{host}{rest}");
    if let Some(q) = query {
        url.push('?');
        url.push_str(q);
    }
    url
}

async fn proxy_to_upstream(
    state: &GatewayState,
    host: &str,
    path: &str,
    query: Option<&str>,
    method: Method,
    mut headers: HeaderMap,
    body: &[u8],
) -> Result<Response, GatewayError> {
    let url = upstream_url(host, path, query);

    headers.remove(axum::http::header::HOST);
    headers.remove(axum::http::header::CONTENT_LENGTH);
    headers.remove(SCOPE_TOKEN_HEADER);

    if let Some(token) = state.credential_provider.resolve(host) {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
            headers.insert(axum::http::header::AUTHORIZATION, value);
        }
    }

    let upstream = state
        .http_client
        .request(method, &url)
        .headers(headers)
        .body(body.to_vec())
        .send()
        .await
        .map_err(|e| GatewayError::UpstreamFailed(e.to_string()))?;

    let status = upstream.status();
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if let Ok(name) = HeaderName::from_bytes(name.as_str().as_bytes()) {
            response_headers.insert(name, value.clone());
        }
    }
    let response_body = upstream
        .bytes()
        .await
        .map_err(|e| GatewayError::UpstreamFailed(e.to_string()))?;

    let mut response = Response::builder().status(status);
    if let Some(map) = response.headers_mut() {
        *map = response_headers;
    }
    response
        .body(axum::body::Body::from(response_body))
        .map_err(|e| GatewayError::UpstreamFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cleanroom_core::capability::EnvCredentialProvider;
    use std::net::IpAddr;

    fn sample_policy() -> CompiledPolicy {
        let image_ref = format!("ghcr.io/x/y@sha256:{}", "a".repeat(64));
        CompiledPolicy::compile(1, image_ref, "deny", vec![]).unwrap()
    }

    fn state_with(registry: crate::InMemoryScopeRegistry) -> GatewayState {
        GatewayState {
            scope_registry: std::sync::Arc::new(registry),
            credential_provider: std::sync::Arc::new(EnvCredentialProvider::new(vec![])),
            http_client: reqwest::Client::new(),
        }
    }

    #[test]
    fn upstream_url_strips_git_host_prefix_and_keeps_query() {
        let url = upstream_url(
            "github.com",
            "/git/github.com/owner/repo.git/info/refs",
            Some("service=git-upload-pack"),
        );
        assert_eq!(
            url,
            "https://github.com/owner/repo.git/info/refs?service=git-upload-pack"
        );
    }

    #[test]
    fn resolve_scope_prefers_token_header_over_source_ip() {
        let registry = crate::InMemoryScopeRegistry::new();
        registry
            .register(
                cleanroom_core::capability::ScopeKey::Token("tok-1".to_owned()),
                "sb-1".to_owned(),
                sample_policy(),
            )
            .unwrap();
        let state = state_with(registry);
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(SCOPE_TOKEN_HEADER),
            HeaderValue::from_static("tok-1"),
        );
        let remote: SocketAddr = "10.0.0.1:9000".parse().unwrap();

        let (sandbox_id, _) = resolve_scope(&state, remote, &headers).unwrap();
        assert_eq!(sandbox_id, "sb-1");
    }

    #[test]
    fn resolve_scope_falls_back_to_source_ip() {
        let registry = crate::InMemoryScopeRegistry::new();
        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        registry
            .register(
                cleanroom_core::capability::ScopeKey::SourceIp(ip),
                "sb-2".to_owned(),
                sample_policy(),
            )
            .unwrap();
        let state = state_with(registry);
        let remote: SocketAddr = "10.0.0.7:9000".parse().unwrap();

        let (sandbox_id, _) = resolve_scope(&state, remote, &HeaderMap::new()).unwrap();
        assert_eq!(sandbox_id, "sb-2");
    }

    #[test]
    fn resolve_scope_reports_unknown_source_without_header() {
        let state = state_with(crate::InMemoryScopeRegistry::new());
        let remote: SocketAddr = "10.0.0.9:9000".parse().unwrap();

        let err = resolve_scope(&state, remote, &HeaderMap::new()).unwrap_err();
        assert_eq!(err.code(), "scope.unknown_source");
    }

    #[test]
    fn resolve_scope_reports_unknown_scope_for_unregistered_token() {
        let state = state_with(crate::InMemoryScopeRegistry::new());
        let remote: SocketAddr = "10.0.0.9:9000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(SCOPE_TOKEN_HEADER),
            HeaderValue::from_static("missing"),
        );

        let err = resolve_scope(&state, remote, &headers).unwrap_err();
        assert_eq!(err.code(), "gateway.unknown_scope");
    }
}
