//! # mcp-oauth-gateway
//!
//! An OAuth 2.1 front door for an MCP server that only understands a static
//! shared secret.
//!
//! The gateway acts as an authorization server towards MCP clients, delegating
//! the human login to GitHub, and as a reverse proxy towards the backend. It
//! keeps track of the backend's `Mcp-Session-Id` per caller so that clients
//! which drop the header between requests stay on the same session.
//!
//! ## Features
//!
//! - **Authorization server**: dynamic registration, authorize, token and revoke
//!   endpoints with PKCE (S256) and refresh token rotation
//! - **Upstream login**: pluggable [`IdentityProvider`], GitHub out of the box
//! - **Two credential schemes**: the backend's static secret is accepted as-is,
//!   OAuth access tokens are swapped for it before forwarding
//! - **Streaming relay**: `text/event-stream` responses are forwarded chunk by chunk
//! - **Pluggable storage**: [`ArtifactStore`] trait with an in-memory implementation
//!
//! ## Example
//!
//! ```rust,no_run
//! use mcp_oauth_gateway::{
//!     GitHubProvider, MemoryStore, OAuthProxyServer, ProxyConfig, UpstreamConfig,
//! };
//! use url::Url;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProxyConfig::new(
//!     Url::parse("https://mcp.example.com")?,
//!     Url::parse("http://localhost:3003")?,
//! )
//! .with_static_secret("backend-secret");
//! let github = GitHubProvider::new(
//!     UpstreamConfig::github("client-id", "client-secret"),
//!     config.callback_url(),
//! );
//!
//! let proxy = OAuthProxyServer::builder()
//!     .config(config)
//!     .store(MemoryStore::new())
//!     .provider(github)
//!     .build()?;
//! proxy.spawn_sweeper();
//!
//! let app = proxy.router();
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod authority;
pub mod bridge;
pub mod config;
pub mod error;
#[cfg(feature = "axum")]
pub mod gateway;
pub mod memory_store;
#[cfg(feature = "axum")]
pub mod server;
pub mod session;
pub mod store;
pub mod token;
pub mod upstream;

#[cfg(all(test, feature = "axum"))]
mod testing;

pub use auth::Credential;
pub use authority::{AuthInfo, AuthorizationParams, OAuthAuthority, TokenResponse};
pub use bridge::IdentityBridge;
pub use config::{ProxyConfig, UpstreamConfig};
pub use error::{Error, Result};
#[cfg(feature = "axum")]
pub use gateway::ProxyGateway;
pub use memory_store::MemoryStore;
#[cfg(feature = "axum")]
pub use server::{OAuthProxyServer, OAuthProxyServerBuilder};
pub use session::SessionAffinity;
pub use store::{
    ArtifactStore, AuthorizationCode, PendingLogin, RegisteredClient, SweepReport, TokenPair,
};
pub use upstream::{GitHubProvider, IdentityProvider, UpstreamIdentity};
