//! Upstream identity provider used to authenticate the human behind a login.

use crate::config::UpstreamConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

/// The user the upstream provider vouched for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamIdentity {
    pub id: String,
    pub login: String,
}

/// An OAuth identity provider this proxy delegates login to
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Short provider name reported by the health endpoint
    fn name(&self) -> &str;

    /// Browser URL that starts the upstream login, carrying `correlation` as its state
    fn authorization_url(&self, correlation: &str) -> Url;

    /// Redeem the upstream authorization code and resolve the user
    async fn exchange_code(&self, code: &str) -> Result<UpstreamIdentity>;
}

#[derive(Debug, Deserialize)]
struct GitHubTokenResponse {
    access_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubUser {
    id: u64,
    login: String,
}

/// GitHub OAuth app
#[derive(Clone)]
pub struct GitHubProvider {
    config: UpstreamConfig,
    callback_url: String,
    http: reqwest::Client,
}

impl GitHubProvider {
    pub fn new(config: UpstreamConfig, callback_url: impl Into<String>) -> Self {
        Self {
            config,
            callback_url: callback_url.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl IdentityProvider for GitHubProvider {
    fn name(&self) -> &str {
        "github"
    }

    fn authorization_url(&self, correlation: &str) -> Url {
        let mut url = self.config.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.callback_url)
            .append_pair("scope", &self.config.scope)
            .append_pair("state", correlation);
        url
    }

    async fn exchange_code(&self, code: &str) -> Result<UpstreamIdentity> {
        let token: GitHubTokenResponse = self
            .http
            .post(self.config.token_url.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", self.callback_url.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::UpstreamAuthFailure(format!("token request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| Error::UpstreamAuthFailure(format!("token request rejected: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::UpstreamAuthFailure(format!("invalid token response: {}", e)))?;

        let access_token = match (token.access_token, token.error) {
            (Some(access_token), None) => access_token,
            (_, error) => {
                return Err(Error::UpstreamAuthFailure(format!(
                    "{}: {}",
                    error.as_deref().unwrap_or("no access token"),
                    token.error_description.as_deref().unwrap_or("")
                )));
            }
        };

        let user: GitHubUser = self
            .http
            .get(self.config.user_url.clone())
            .bearer_auth(&access_token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header(reqwest::header::USER_AGENT, "mcp-oauth-gateway")
            .send()
            .await
            .map_err(|e| Error::UpstreamAuthFailure(format!("user request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| Error::UpstreamAuthFailure(format!("user request rejected: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::UpstreamAuthFailure(format!("invalid user response: {}", e)))?;

        tracing::info!("upstream login completed for {}", user.login);

        Ok(UpstreamIdentity {
            id: user.id.to_string(),
            login: user.login,
        })
    }
}

#[cfg(all(test, feature = "axum"))]
mod tests {
    use super::*;
    use axum::{
        Form, Json, Router,
        http::HeaderMap,
        routing::{get, post},
    };
    use std::collections::HashMap;

    async fn mock_github() -> Url {
        async fn token(Form(form): Form<HashMap<String, String>>) -> Json<serde_json::Value> {
            if form.get("code").map(String::as_str) == Some("good") {
                Json(serde_json::json!({ "access_token": "gho_abc", "token_type": "bearer" }))
            } else {
                Json(serde_json::json!({
                    "error": "bad_verification_code",
                    "error_description": "The code passed is incorrect or expired."
                }))
            }
        }

        async fn user(headers: HeaderMap) -> Json<serde_json::Value> {
            assert_eq!(headers["authorization"], "Bearer gho_abc");
            assert!(headers.contains_key("user-agent"));
            Json(serde_json::json!({ "id": 583231, "login": "octocat" }))
        }

        let app = Router::new()
            .route("/login/oauth/access_token", post(token))
            .route("/user", get(user));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{}", addr)).unwrap()
    }

    fn provider(base: &Url) -> GitHubProvider {
        let config = UpstreamConfig::github("gh-id", "gh-secret").with_endpoints(
            base.join("/login/oauth/authorize").unwrap(),
            base.join("/login/oauth/access_token").unwrap(),
            base.join("/user").unwrap(),
        );
        GitHubProvider::new(config, "https://proxy.example.com/oauth/callback")
    }

    #[test]
    fn test_authorization_url_carries_correlation() {
        let provider = GitHubProvider::new(
            UpstreamConfig::github("gh-id", "gh-secret"),
            "https://proxy.example.com/oauth/callback",
        );
        let url = provider.authorization_url("corr-123");
        assert_eq!(url.host_str(), Some("github.com"));

        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(query["client_id"], "gh-id");
        assert_eq!(query["state"], "corr-123");
        assert_eq!(query["scope"], "read:user");
        assert_eq!(
            query["redirect_uri"],
            "https://proxy.example.com/oauth/callback"
        );
    }

    #[tokio::test]
    async fn test_exchange_code_resolves_user() {
        let base = mock_github().await;
        let identity = provider(&base).exchange_code("good").await.unwrap();
        assert_eq!(
            identity,
            UpstreamIdentity {
                id: "583231".to_string(),
                login: "octocat".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_exchange_code_surfaces_provider_error() {
        let base = mock_github().await;
        let err = provider(&base).exchange_code("bad").await.unwrap_err();
        match err {
            Error::UpstreamAuthFailure(message) => {
                assert!(message.contains("bad_verification_code"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
