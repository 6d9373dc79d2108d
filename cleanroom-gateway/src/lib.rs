//! Policy-scoped egress gateway brokering outbound network access from
//! Cleanroom guests (`spec.md` §4.6).
//!
//! Guests have no direct network access; every outbound connection is
//! routed through this gateway, which resolves the requesting sandbox's
//! scope, checks the request's target host against that sandbox's
//! compiled policy, and proxies allowed requests upstream with injected
//! credentials.

mod error;
mod git;
mod path;
mod routes;
mod scope;

pub use error::GatewayError;
pub use git::GitOperation;
pub use path::canonicalise_path;
pub use routes::{build_router, GatewayState};
pub use scope::{InMemoryScopeRegistry, SCOPE_TOKEN_HEADER};

use std::net::SocketAddr;
use std::sync::Arc;

use cleanroom_core::capability::{CredentialProvider, ScopeRegistry};
use cleanroom_core::Result;

/// The gateway's default listen address (`spec.md` §4.6).
pub const DEFAULT_GATEWAY_ADDR: &str = "0.0.0.0:8170";

/// The egress gateway server: binds an HTTP listener and serves
/// [`routes::build_router`] until cancelled.
pub struct Gateway {
    addr: SocketAddr,
    state: GatewayState,
}

impl Gateway {
    /// Builds a gateway bound to `addr`, backed by `scope_registry` for
    /// scope resolution and `credential_provider` for upstream credential
    /// injection.
    #[must_use]
    pub fn new(
        addr: SocketAddr,
        scope_registry: Arc<dyn ScopeRegistry>,
        credential_provider: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            addr,
            state: GatewayState {
                scope_registry,
                credential_provider,
                http_client: reqwest::Client::new(),
            },
        }
    }

    /// Binds `addr` and serves requests until the process is signalled to
    /// stop. Returns once the listener is closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address cannot be bound.
    pub async fn serve(self) -> Result<()> {
        let router = build_router(self.state).into_make_service_with_connect_info::<SocketAddr>();
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!(addr = %self.addr, "gateway listening");
        axum::serve(listener, router).await?;
        Ok(())
    }
}
