//! Credential extraction and classification for proxied requests.

use crate::authority::{AuthInfo, OAuthAuthority};
use crate::error::{Error, Result};
use crate::store::ArtifactStore;

/// How a presented bearer credential authenticated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// The static shared secret, forwarded to the backend as-is
    Direct,
    /// An access token issued by this proxy
    OAuth(AuthInfo),
}

/// Extracts a bearer token from an Authorization header value.
///
/// Returns the token if present and non-empty, or None otherwise.
pub fn extract_bearer_token(auth_header: &str) -> Option<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Classify `token` as the static secret or one of our access tokens.
///
/// The static secret is compared first, so it never touches the store.
pub async fn classify_credential<S: ArtifactStore>(
    token: &str,
    static_secret: Option<&str>,
    authority: &OAuthAuthority<S>,
) -> Result<Credential> {
    if static_secret.is_some_and(|secret| secret == token) {
        return Ok(Credential::Direct);
    }

    match authority.validate_token(token).await {
        Ok(info) => Ok(Credential::OAuth(info)),
        Err(Error::InvalidOrExpiredToken) => {
            tracing::warn!("rejected credential {}", credential_prefix(token));
            Err(Error::InvalidOrExpiredToken)
        }
        Err(e) => Err(e),
    }
}

/// Short prefix of a credential, safe to log
pub fn credential_prefix(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{}...", prefix)
}
