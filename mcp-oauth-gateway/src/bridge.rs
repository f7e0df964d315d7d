//! Delegates the human login step to the upstream identity provider and turns
//! a successful upstream callback into one of our own authorization codes.

use crate::authority::{AuthorizationParams, AuthorizationRedirect, OAuthAuthority};
use crate::error::{Error, Result};
use crate::store::{ArtifactStore, PendingLogin, RegisteredClient};
use crate::token::generate_random_string;
use crate::upstream::IdentityProvider;
use chrono::{Duration, Utc};
use std::sync::Arc;
use url::Url;

pub struct IdentityBridge<S: ArtifactStore, P: IdentityProvider> {
    authority: OAuthAuthority<S>,
    provider: Arc<P>,
    pending_login_expiry: Duration,
}

impl<S: ArtifactStore, P: IdentityProvider> Clone for IdentityBridge<S, P> {
    fn clone(&self) -> Self {
        Self {
            authority: self.authority.clone(),
            provider: self.provider.clone(),
            pending_login_expiry: self.pending_login_expiry,
        }
    }
}

impl<S: ArtifactStore, P: IdentityProvider> IdentityBridge<S, P> {
    pub fn new(
        authority: OAuthAuthority<S>,
        provider: Arc<P>,
        pending_login_expiry_seconds: i64,
    ) -> Self {
        Self {
            authority,
            provider,
            pending_login_expiry: Duration::seconds(pending_login_expiry_seconds),
        }
    }

    /// Remember the client's request and send the browser to the provider
    pub async fn begin_login(
        &self,
        client: &RegisteredClient,
        params: AuthorizationParams,
    ) -> Result<Url> {
        if !client.allows_redirect(&params.redirect_uri) {
            tracing::warn!(
                "client {} requested unregistered redirect_uri {}",
                client.client_id,
                params.redirect_uri
            );
            return Err(Error::UnregisteredRedirectUri);
        }

        let correlation = generate_random_string(32);
        self.authority
            .store()
            .put_pending_login(PendingLogin {
                correlation: correlation.clone(),
                client_id: client.client_id.clone(),
                redirect_uri: params.redirect_uri,
                state: params.state,
                code_challenge: params.code_challenge,
                code_challenge_method: params.code_challenge_method,
                scopes: params.scopes,
                resource: params.resource,
                expires_at: Utc::now() + self.pending_login_expiry,
            })
            .await?;

        tracing::info!("starting upstream login for client {}", client.client_id);

        Ok(self.provider.authorization_url(&correlation))
    }

    /// Finish an upstream login and mint the code for the original client
    pub async fn complete_login(
        &self,
        code: Option<&str>,
        state: Option<&str>,
    ) -> Result<AuthorizationRedirect> {
        let (Some(code), Some(state)) = (code, state) else {
            return Err(Error::MissingCallbackParameters);
        };

        let pending = self
            .authority
            .store()
            .take_pending_login(state)
            .await?
            .ok_or(Error::UnknownOrExpiredLoginState)?;

        let identity = self.provider.exchange_code(code).await.map_err(|e| match e {
            Error::UpstreamAuthFailure(_) => e,
            other => Error::UpstreamAuthFailure(other.to_string()),
        })?;

        let client = self
            .authority
            .store()
            .get_client(&pending.client_id)
            .await?
            .ok_or(Error::InvalidClient)?;

        self.authority
            .authorize(
                &client,
                AuthorizationParams {
                    redirect_uri: pending.redirect_uri,
                    scopes: pending.scopes,
                    resource: pending.resource,
                    state: pending.state,
                    code_challenge: pending.code_challenge,
                    code_challenge_method: pending.code_challenge_method,
                },
                Some(identity.login),
            )
            .await
    }
}
