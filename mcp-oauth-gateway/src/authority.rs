//! Authorization-code grant: code issuance, single-use exchange, token validation.

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::store::{ArtifactStore, AuthorizationCode, RegisteredClient, TokenPair};
use crate::token::generate_token;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use url::Url;

/// Parameters of an authorization request, already validated for shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationParams {
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub resource: Option<String>,
    pub state: Option<String>,
    pub code_challenge: String,
    pub code_challenge_method: String,
}

/// Where to send the browser after a code has been minted
#[derive(Debug, Clone)]
pub struct AuthorizationRedirect {
    pub code: String,
    pub url: Url,
}

/// Token endpoint response body (RFC 6749 §5.1)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub refresh_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl From<&TokenPair> for TokenResponse {
    fn from(pair: &TokenPair) -> Self {
        Self {
            access_token: pair.access_token.clone(),
            token_type: pair.token_type.clone(),
            expires_in: pair.expires_in,
            refresh_token: pair.refresh_token.clone(),
            scope: join_scopes(&pair.scopes),
        }
    }
}

/// What a validated access token grants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub client_id: String,
    pub scopes: Vec<String>,
    pub resource: Option<String>,
    pub subject: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Issues and validates this proxy's own OAuth artifacts
pub struct OAuthAuthority<S: ArtifactStore> {
    store: Arc<S>,
    code_expiry: Duration,
    access_token_expiry_seconds: i64,
    refresh_token_expiry: Duration,
}

impl<S: ArtifactStore> Clone for OAuthAuthority<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            code_expiry: self.code_expiry,
            access_token_expiry_seconds: self.access_token_expiry_seconds,
            refresh_token_expiry: self.refresh_token_expiry,
        }
    }
}

impl<S: ArtifactStore> OAuthAuthority<S> {
    pub fn new(store: Arc<S>, config: &ProxyConfig) -> Self {
        Self {
            store,
            code_expiry: Duration::seconds(config.code_expiry_seconds),
            access_token_expiry_seconds: config.access_token_expiry_seconds,
            refresh_token_expiry: Duration::seconds(config.refresh_token_expiry_seconds),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Mint an authorization code for `client` and build the redirect back to it.
    ///
    /// The redirect URI must be one the client registered; nothing is stored otherwise.
    pub async fn authorize(
        &self,
        client: &RegisteredClient,
        params: AuthorizationParams,
        subject: Option<String>,
    ) -> Result<AuthorizationRedirect> {
        if !client.allows_redirect(&params.redirect_uri) {
            tracing::warn!(
                "client {} requested unregistered redirect_uri {}",
                client.client_id,
                params.redirect_uri
            );
            return Err(Error::UnregisteredRedirectUri);
        }

        let mut url = Url::parse(&params.redirect_uri)
            .map_err(|e| Error::InvalidRequest(format!("invalid redirect_uri: {}", e)))?;

        let code = generate_token();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("code", &code);
            if let Some(state) = &params.state {
                query.append_pair("state", state);
            }
        }

        self.store
            .put_code(AuthorizationCode {
                code: code.clone(),
                client_id: client.client_id.clone(),
                redirect_uri: params.redirect_uri,
                scopes: params.scopes,
                resource: params.resource,
                state: params.state,
                code_challenge: params.code_challenge,
                code_challenge_method: params.code_challenge_method,
                subject,
                expires_at: Utc::now() + self.code_expiry,
            })
            .await?;

        tracing::info!("issued authorization code for client {}", client.client_id);

        Ok(AuthorizationRedirect { code, url })
    }

    /// PKCE challenge and method bound to an unexpired code
    pub async fn challenge_for_code(&self, code: &str) -> Result<(String, String)> {
        let stored = self
            .store
            .get_code(code)
            .await?
            .ok_or(Error::InvalidAuthorizationCode)?;
        Ok((stored.code_challenge, stored.code_challenge_method))
    }

    /// Exchange a code for a token pair. Succeeds at most once per code.
    pub async fn exchange_code(
        &self,
        client: &RegisteredClient,
        code: &str,
        redirect_uri: Option<&str>,
    ) -> Result<TokenResponse> {
        let stored = self
            .store
            .get_code(code)
            .await?
            .ok_or(Error::InvalidAuthorizationCode)?;

        if stored.client_id != client.client_id {
            tracing::warn!(
                "client {} presented a code issued to {}",
                client.client_id,
                stored.client_id
            );
            return Err(Error::CodeClientMismatch);
        }

        if let Some(redirect_uri) = redirect_uri {
            if redirect_uri != stored.redirect_uri {
                return Err(Error::InvalidAuthorizationCode);
            }
        }

        // The take is the single point of consumption; a concurrent exchange
        // that got past the read above loses here.
        let stored = self
            .store
            .take_code(code)
            .await?
            .ok_or(Error::InvalidAuthorizationCode)?;

        let pair = self
            .mint_token_pair(
                &stored.client_id,
                stored.scopes,
                stored.resource,
                stored.subject,
            )
            .await?;

        tracing::info!("exchanged authorization code for client {}", client.client_id);

        Ok(TokenResponse::from(&pair))
    }

    /// Rotate a refresh token into a fresh token pair
    pub async fn exchange_refresh_token(
        &self,
        client: &RegisteredClient,
        refresh_token: &str,
    ) -> Result<TokenResponse> {
        let previous = self
            .store
            .take_token_by_refresh(refresh_token)
            .await?
            .ok_or_else(|| Error::InvalidGrant("invalid refresh token".to_string()))?;

        if previous.client_id != client.client_id {
            tracing::warn!(
                "client {} presented a refresh token issued to {}, revoking it",
                client.client_id,
                previous.client_id
            );
            return Err(Error::InvalidGrant(
                "refresh token issued to a different client".to_string(),
            ));
        }

        let pair = self
            .mint_token_pair(
                &previous.client_id,
                previous.scopes,
                previous.resource,
                previous.subject,
            )
            .await?;

        tracing::info!("rotated refresh token for client {}", client.client_id);

        Ok(TokenResponse::from(&pair))
    }

    /// Check an access token presented on a proxied request
    pub async fn validate_token(&self, token: &str) -> Result<AuthInfo> {
        let pair = self
            .store
            .get_token(token)
            .await?
            .ok_or(Error::InvalidOrExpiredToken)?;

        if pair.is_access_expired(Utc::now()) {
            return Err(Error::InvalidOrExpiredToken);
        }

        Ok(AuthInfo {
            expires_at: pair.access_expires_at(),
            client_id: pair.client_id,
            scopes: pair.scopes,
            resource: pair.resource,
            subject: pair.subject,
        })
    }

    /// Delete the token pair holding `token` (access or refresh value)
    pub async fn revoke(&self, token: &str) -> Result<()> {
        self.store.delete_token(token).await?;
        tracing::info!("revoked token");
        Ok(())
    }

    async fn mint_token_pair(
        &self,
        client_id: &str,
        scopes: Vec<String>,
        resource: Option<String>,
        subject: Option<String>,
    ) -> Result<TokenPair> {
        let created_at = Utc::now();
        let pair = TokenPair {
            access_token: generate_token(),
            token_type: "Bearer".to_string(),
            expires_in: self.access_token_expiry_seconds,
            refresh_token: generate_token(),
            client_id: client_id.to_string(),
            scopes,
            resource,
            subject,
            created_at,
            refresh_expires_at: created_at + self.refresh_token_expiry,
        };
        self.store.put_token(pair.clone()).await?;
        Ok(pair)
    }
}

impl<S: ArtifactStore + 'static> OAuthAuthority<S> {
    /// Periodically reclaim expired artifacts.
    ///
    /// Validation checks expiry inline, so this only bounds storage growth.
    pub fn spawn_sweeper(&self, interval: std::time::Duration) -> JoinHandle<()> {
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.sweep_expired(Utc::now()).await {
                    Ok(report) if !report.is_empty() => tracing::info!(
                        "OAuth cleanup: deleted {} codes, {} tokens, {} pending logins",
                        report.codes,
                        report.tokens,
                        report.pending_logins
                    ),
                    Ok(_) => {}
                    Err(e) => tracing::error!("OAuth cleanup failed: {}", e),
                }
            }
        })
    }
}

pub(crate) fn join_scopes(scopes: &[String]) -> Option<String> {
    if scopes.is_empty() {
        None
    } else {
        Some(scopes.join(" "))
    }
}

pub(crate) fn split_scopes(scope: Option<&str>) -> Vec<String> {
    scope
        .map(|s| s.split_whitespace().map(String::from).collect())
        .unwrap_or_default()
}
