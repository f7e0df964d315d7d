use std::time::Duration;
use url::Url;

/// Scopes advertised to downstream clients when none are configured.
pub const DEFAULT_SCOPES: &[&str] = &["mcp:tools", "mcp:read", "mcp:write"];

/// Configuration for the OAuth gateway
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Public address of this proxy, used as the OAuth issuer
    pub host: Url,

    /// Base URL of the backend MCP server
    pub backend: Url,

    /// Path on the backend that receives proxied protocol requests
    pub backend_path: String,

    /// Static shared secret understood by the backend
    pub static_secret: Option<String>,

    /// Scopes advertised in discovery metadata
    pub scopes_supported: Vec<String>,

    /// Human readable name for the protected resource
    pub resource_name: String,

    /// Access token lifetime in seconds (default: 3600 = 1 hour)
    pub access_token_expiry_seconds: i64,

    /// Refresh token lifetime in seconds (default: 30 days)
    pub refresh_token_expiry_seconds: i64,

    /// Authorization code lifetime in seconds (default: 600 = 10 minutes)
    pub code_expiry_seconds: i64,

    /// Lifetime of an abandoned upstream login (default: 600 = 10 minutes)
    pub pending_login_expiry_seconds: i64,

    /// How often expired artifacts are swept from the store
    pub sweep_interval: Duration,
}

impl ProxyConfig {
    /// Create a new configuration with sensible defaults
    pub fn new(host: impl Into<Url>, backend: impl Into<Url>) -> Self {
        Self {
            host: host.into(),
            backend: backend.into(),
            backend_path: "/mcp".to_string(),
            static_secret: None,
            scopes_supported: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            resource_name: "MCP Server".to_string(),
            access_token_expiry_seconds: 3600,
            refresh_token_expiry_seconds: 30 * 24 * 3600,
            code_expiry_seconds: 600,
            pending_login_expiry_seconds: 600,
            sweep_interval: Duration::from_secs(3600),
        }
    }

    /// Set the static shared secret
    pub fn with_static_secret(mut self, secret: impl Into<String>) -> Self {
        self.static_secret = Some(secret.into());
        self
    }

    /// Set the backend path that proxied requests are sent to
    pub fn with_backend_path(mut self, path: impl Into<String>) -> Self {
        self.backend_path = path.into();
        self
    }

    /// Set custom scopes
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes_supported = scopes;
        self
    }

    /// Set the resource name shown in protected resource metadata
    pub fn with_resource_name(mut self, name: impl Into<String>) -> Self {
        self.resource_name = name.into();
        self
    }

    /// Set access token expiry in seconds
    pub fn with_access_token_expiry(mut self, seconds: i64) -> Self {
        self.access_token_expiry_seconds = seconds;
        self
    }

    /// Set refresh token expiry in seconds
    pub fn with_refresh_token_expiry(mut self, seconds: i64) -> Self {
        self.refresh_token_expiry_seconds = seconds;
        self
    }

    /// Set authorization code expiry in seconds
    pub fn with_code_expiry(mut self, seconds: i64) -> Self {
        self.code_expiry_seconds = seconds;
        self
    }

    /// Set pending upstream login expiry in seconds
    pub fn with_pending_login_expiry(mut self, seconds: i64) -> Self {
        self.pending_login_expiry_seconds = seconds;
        self
    }

    /// Set the sweep interval
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Issuer identifier without a trailing slash
    pub fn issuer(&self) -> &str {
        self.host.as_str().trim_end_matches('/')
    }

    pub fn authorization_server_metadata_url(&self) -> String {
        format!("{}/.well-known/oauth-authorization-server", self.issuer())
    }

    pub fn protected_resource_metadata_url(&self) -> String {
        format!("{}/.well-known/oauth-protected-resource", self.issuer())
    }

    /// Where the upstream identity provider sends the browser back to
    pub fn callback_url(&self) -> String {
        format!("{}/oauth/callback", self.issuer())
    }

    /// Full URL of the backend protocol endpoint
    pub fn backend_endpoint(&self) -> String {
        format!(
            "{}/{}",
            self.backend.as_str().trim_end_matches('/'),
            self.backend_path.trim_start_matches('/')
        )
    }

    /// Health endpoint of the backend, probed by `/health`
    pub fn backend_health_url(&self) -> String {
        format!("{}/health", self.backend.as_str().trim_end_matches('/'))
    }
}

/// Configuration for the upstream identity provider
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub client_id: String,
    pub client_secret: String,

    /// Browser-facing authorization endpoint
    pub authorize_url: Url,

    /// Code-for-token exchange endpoint
    pub token_url: Url,

    /// Endpoint returning the authenticated user
    pub user_url: Url,

    /// Scope requested from the provider
    pub scope: String,
}

impl UpstreamConfig {
    /// GitHub OAuth app endpoints
    pub fn github(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            authorize_url: Url::parse("https://github.com/login/oauth/authorize")
                .expect("valid url"),
            token_url: Url::parse("https://github.com/login/oauth/access_token")
                .expect("valid url"),
            user_url: Url::parse("https://api.github.com/user").expect("valid url"),
            scope: "read:user".to_string(),
        }
    }

    /// Point the provider at different endpoints (self-hosted GitHub Enterprise, tests)
    pub fn with_endpoints(mut self, authorize_url: Url, token_url: Url, user_url: Url) -> Self {
        self.authorize_url = authorize_url;
        self.token_url = token_url;
        self.user_url = user_url;
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }
}
