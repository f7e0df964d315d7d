use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A client created through dynamic registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredClient {
    pub client_id: String,
    /// Absent for public clients (`token_endpoint_auth_method = "none"`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub redirect_uris: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub token_endpoint_auth_method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Unix timestamp
    pub client_id_issued_at: i64,
}

impl RegisteredClient {
    pub fn allows_redirect(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.iter().any(|uri| uri == redirect_uri)
    }
}

/// A single-use authorization code bound to a client, redirect and PKCE challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationCode {
    pub code: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub resource: Option<String>,
    /// Caller-supplied opaque state, echoed back verbatim
    pub state: Option<String>,
    pub code_challenge: String,
    pub code_challenge_method: String,
    /// Upstream identity that approved this code
    pub subject: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl AuthorizationCode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Access/refresh token pair minted by a successful exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: i64,
    pub refresh_token: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub resource: Option<String>,
    pub subject: Option<String>,
    pub created_at: DateTime<Utc>,
    /// The stored pair is reclaimable after this instant
    pub refresh_expires_at: DateTime<Utc>,
}

impl TokenPair {
    pub fn access_expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::seconds(self.expires_in)
    }

    pub fn is_access_expired(&self, now: DateTime<Utc>) -> bool {
        self.access_expires_at() < now
    }

    pub fn is_refresh_expired(&self, now: DateTime<Utc>) -> bool {
        self.refresh_expires_at < now
    }
}

/// Correlation state for a login delegated to the upstream identity provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLogin {
    /// Random value sent upstream as `state`
    pub correlation: String,
    pub client_id: String,
    pub redirect_uri: String,
    /// The downstream client's own state
    pub state: Option<String>,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub scopes: Vec<String>,
    pub resource: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl PendingLogin {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Counts of artifacts removed by a sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub codes: u64,
    pub tokens: u64,
    pub pending_logins: u64,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.codes == 0 && self.tokens == 0 && self.pending_logins == 0
    }
}

/// Storage abstraction for OAuth artifacts.
///
/// Lookups treat expired entries as absent whether or not a sweep has run.
/// `take_*` operations remove and return in one step, so concurrent callers
/// racing on the same key see at most one `Some`.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store a newly registered client
    async fn register_client(&self, client: RegisteredClient) -> Result<()>;

    /// Get a client by its ID
    async fn get_client(&self, client_id: &str) -> Result<Option<RegisteredClient>>;

    /// Store an authorization code
    async fn put_code(&self, code: AuthorizationCode) -> Result<()>;

    /// Get an unexpired authorization code without consuming it
    async fn get_code(&self, code: &str) -> Result<Option<AuthorizationCode>>;

    /// Get and remove an unexpired authorization code
    async fn take_code(&self, code: &str) -> Result<Option<AuthorizationCode>>;

    /// Delete an authorization code
    async fn delete_code(&self, code: &str) -> Result<()>;

    /// Store a token pair
    async fn put_token(&self, token: TokenPair) -> Result<()>;

    /// Get a token pair by access token, absent once the access token has expired
    async fn get_token(&self, access_token: &str) -> Result<Option<TokenPair>>;

    /// Get and remove a token pair by refresh token
    async fn take_token_by_refresh(&self, refresh_token: &str) -> Result<Option<TokenPair>>;

    /// Delete the token pair holding this access or refresh token
    async fn delete_token(&self, token: &str) -> Result<()>;

    /// Store pending upstream login state
    async fn put_pending_login(&self, login: PendingLogin) -> Result<()>;

    /// Get and remove pending upstream login state by correlation value
    async fn take_pending_login(&self, correlation: &str) -> Result<Option<PendingLogin>>;

    /// Remove every artifact whose expiry has passed
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport>;
}
