use crate::{
    authority::{AuthorizationParams, OAuthAuthority, split_scopes},
    bridge::IdentityBridge,
    config::ProxyConfig,
    error::{Error, Result},
    gateway::ProxyGateway,
    session::SessionAffinity,
    store::{ArtifactStore, RegisteredClient},
    token::{generate_random_string, generate_token, verify_pkce},
    upstream::IdentityProvider,
};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{any, get, post},
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use url::Url;

/// OAuth authorization server and authenticating gateway in front of one
/// MCP backend.
pub struct OAuthProxyServer<S, P>
where
    S: ArtifactStore,
    P: IdentityProvider,
{
    config: Arc<ProxyConfig>,
    authority: OAuthAuthority<S>,
    bridge: IdentityBridge<S, P>,
    gateway: ProxyGateway<S>,
    provider: Arc<P>,
    http: reqwest::Client,
}

impl<S, P> Clone for OAuthProxyServer<S, P>
where
    S: ArtifactStore,
    P: IdentityProvider,
{
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            authority: self.authority.clone(),
            bridge: self.bridge.clone(),
            gateway: self.gateway.clone(),
            provider: self.provider.clone(),
            http: self.http.clone(),
        }
    }
}

impl<S, P> OAuthProxyServer<S, P>
where
    S: ArtifactStore + 'static,
    P: IdentityProvider + 'static,
{
    /// Create a new OAuth proxy server builder.
    pub fn builder() -> OAuthProxyServerBuilder<S, P> {
        OAuthProxyServerBuilder::default()
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn authority(&self) -> &OAuthAuthority<S> {
        &self.authority
    }

    /// Start the periodic sweep of expired artifacts.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        self.authority.spawn_sweeper(self.config.sweep_interval)
    }

    /// Create the axum router with all OAuth endpoints and the proxied endpoint.
    pub fn router(&self) -> Router {
        let mcp_path = format!("/{}", self.config.backend_path.trim_start_matches('/'));
        Router::new()
            .route(
                "/.well-known/oauth-authorization-server",
                get(handle_oauth_metadata),
            )
            .route(
                "/.well-known/oauth-protected-resource",
                get(handle_protected_resource_metadata),
            )
            .route("/oauth/register", post(handle_register))
            .route("/oauth/authorize", get(handle_authorize))
            .route("/oauth/callback", get(handle_callback))
            .route("/oauth/token", post(handle_token))
            .route("/oauth/revoke", post(handle_revoke))
            .route("/health", get(handle_health))
            .route(&mcp_path, any(handle_mcp))
            .with_state(self.clone())
    }
}

/// Builder for [`OAuthProxyServer`]
pub struct OAuthProxyServerBuilder<S, P> {
    config: Option<ProxyConfig>,
    store: Option<Arc<S>>,
    provider: Option<Arc<P>>,
}

impl<S, P> Default for OAuthProxyServerBuilder<S, P> {
    fn default() -> Self {
        Self {
            config: None,
            store: None,
            provider: None,
        }
    }
}

impl<S, P> OAuthProxyServerBuilder<S, P>
where
    S: ArtifactStore + 'static,
    P: IdentityProvider + 'static,
{
    pub fn config(mut self, config: ProxyConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn store(mut self, store: S) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn provider(mut self, provider: P) -> Self {
        self.provider = Some(Arc::new(provider));
        self
    }

    pub fn build(self) -> Result<OAuthProxyServer<S, P>> {
        let config = Arc::new(
            self.config
                .ok_or_else(|| Error::InvalidRequest("config required".to_string()))?,
        );
        let store = self
            .store
            .ok_or_else(|| Error::InvalidRequest("store required".to_string()))?;
        let provider = self
            .provider
            .ok_or_else(|| Error::InvalidRequest("provider required".to_string()))?;

        let authority = OAuthAuthority::new(store, &config);
        let bridge = IdentityBridge::new(
            authority.clone(),
            provider.clone(),
            config.pending_login_expiry_seconds,
        );
        let gateway = ProxyGateway::new(
            config.clone(),
            authority.clone(),
            Arc::new(SessionAffinity::new()),
        );

        Ok(OAuthProxyServer {
            config,
            authority,
            bridge,
            gateway,
            provider,
            http: reqwest::Client::new(),
        })
    }
}

// Discovery

/// Handle OAuth authorization server metadata discovery (RFC 8414)
async fn handle_oauth_metadata<S, P>(State(server): State<OAuthProxyServer<S, P>>) -> Response
where
    S: ArtifactStore + 'static,
    P: IdentityProvider + 'static,
{
    let issuer = server.config.issuer();

    Json(serde_json::json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{}/oauth/authorize", issuer),
        "token_endpoint": format!("{}/oauth/token", issuer),
        "registration_endpoint": format!("{}/oauth/register", issuer),
        "revocation_endpoint": format!("{}/oauth/revoke", issuer),
        "scopes_supported": server.config.scopes_supported,
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "code_challenge_methods_supported": ["S256"],
        "token_endpoint_auth_methods_supported": ["client_secret_post", "none"],
        "revocation_endpoint_auth_methods_supported": ["client_secret_post", "none"],
    }))
    .into_response()
}

/// Handle protected resource metadata discovery (RFC 9728)
async fn handle_protected_resource_metadata<S, P>(
    State(server): State<OAuthProxyServer<S, P>>,
) -> Response
where
    S: ArtifactStore + 'static,
    P: IdentityProvider + 'static,
{
    let issuer = server.config.issuer();

    Json(serde_json::json!({
        "resource": issuer,
        "authorization_servers": [issuer],
        "scopes_supported": server.config.scopes_supported,
        "bearer_methods_supported": ["header"],
        "resource_name": server.config.resource_name,
    }))
    .into_response()
}

// Registration

#[derive(Debug, Deserialize)]
struct RegistrationRequest {
    redirect_uris: Option<Vec<String>>,
    client_name: Option<String>,
    grant_types: Option<Vec<String>>,
    response_types: Option<Vec<String>>,
    token_endpoint_auth_method: Option<String>,
    scope: Option<String>,
}

/// Handle dynamic client registration (RFC 7591)
async fn handle_register<S, P>(
    State(server): State<OAuthProxyServer<S, P>>,
    body: Bytes,
) -> Result<Response>
where
    S: ArtifactStore + 'static,
    P: IdentityProvider + 'static,
{
    let request: RegistrationRequest = serde_json::from_slice(&body)
        .map_err(|e| Error::InvalidClientMetadata(format!("invalid JSON: {}", e)))?;

    let redirect_uris = request
        .redirect_uris
        .filter(|uris| !uris.is_empty())
        .ok_or_else(|| Error::InvalidClientMetadata("redirect_uris required".to_string()))?;
    for uri in &redirect_uris {
        Url::parse(uri).map_err(|e| {
            Error::InvalidClientMetadata(format!("invalid redirect_uri {}: {}", uri, e))
        })?;
    }

    let auth_method = request
        .token_endpoint_auth_method
        .unwrap_or_else(|| "client_secret_post".to_string());
    let client_secret = match auth_method.as_str() {
        "none" => None,
        "client_secret_post" => Some(generate_token()),
        other => {
            return Err(Error::InvalidClientMetadata(format!(
                "unsupported token_endpoint_auth_method: {}",
                other
            )));
        }
    };

    let client = RegisteredClient {
        client_id: generate_random_string(32),
        client_secret,
        redirect_uris,
        client_name: request.client_name,
        grant_types: request
            .grant_types
            .unwrap_or_else(|| vec!["authorization_code".into(), "refresh_token".into()]),
        response_types: request
            .response_types
            .unwrap_or_else(|| vec!["code".into()]),
        token_endpoint_auth_method: auth_method,
        scope: request.scope,
        client_id_issued_at: chrono::Utc::now().timestamp(),
    };

    server.authority.store().register_client(client.clone()).await?;

    tracing::info!(
        "registered client {} ({})",
        client.client_id,
        client.client_name.as_deref().unwrap_or("unnamed")
    );

    Ok((StatusCode::CREATED, Json(client)).into_response())
}

// Authorization

#[derive(Debug, Deserialize)]
struct AuthorizeQuery {
    response_type: Option<String>,
    client_id: Option<String>,
    redirect_uri: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
    scope: Option<String>,
    state: Option<String>,
    resource: Option<String>,
}

/// Handle an authorization request by starting the upstream login.
///
/// Until the redirect URI is known to belong to the client, failures are
/// reported directly; after that they go back to the client as redirect errors.
async fn handle_authorize<S, P>(
    State(server): State<OAuthProxyServer<S, P>>,
    Query(params): Query<AuthorizeQuery>,
) -> Result<Response>
where
    S: ArtifactStore + 'static,
    P: IdentityProvider + 'static,
{
    let client_id = params
        .client_id
        .as_deref()
        .ok_or_else(|| Error::InvalidRequest("client_id required".to_string()))?;

    tracing::info!("handling authorize request for client_id: {}", client_id);

    let client = server
        .authority
        .store()
        .get_client(client_id)
        .await?
        .ok_or_else(|| Error::InvalidRequest(format!("unknown client_id: {}", client_id)))?;

    let redirect_uri = match params.redirect_uri {
        Some(uri) => uri,
        None if client.redirect_uris.len() == 1 => client.redirect_uris[0].clone(),
        None => {
            return Err(Error::InvalidRequest(
                "redirect_uri required when several are registered".to_string(),
            ));
        }
    };
    if !client.allows_redirect(&redirect_uri) {
        return Err(Error::UnregisteredRedirectUri);
    }

    let state = params.state;
    let redirect_error = |error: &str, description: &str| {
        authorization_error_redirect(&redirect_uri, error, description, state.as_deref())
    };

    if params.response_type.as_deref() != Some("code") {
        return redirect_error(
            "unsupported_response_type",
            "response_type must be code",
        );
    }
    let Some(code_challenge) = params.code_challenge else {
        return redirect_error("invalid_request", "code_challenge required");
    };
    if params.code_challenge_method.as_deref() != Some("S256") {
        return redirect_error("invalid_request", "code_challenge_method must be S256");
    }

    let scopes = split_scopes(params.scope.as_deref());
    if let Some(allowed) = client.scope.as_deref() {
        let allowed = split_scopes(Some(allowed));
        if let Some(scope) = scopes.iter().find(|s| !allowed.contains(s)) {
            return redirect_error("invalid_scope", &format!("scope {} not allowed", scope));
        }
    }

    let upstream_url = server
        .bridge
        .begin_login(
            &client,
            AuthorizationParams {
                redirect_uri: redirect_uri.clone(),
                scopes,
                resource: params.resource,
                state: state.clone(),
                code_challenge,
                code_challenge_method: "S256".to_string(),
            },
        )
        .await?;

    tracing::info!("redirecting to upstream identity provider");

    Ok(found(upstream_url.as_str()))
}

fn authorization_error_redirect(
    redirect_uri: &str,
    error: &str,
    description: &str,
    state: Option<&str>,
) -> Result<Response> {
    let mut url = Url::parse(redirect_uri)
        .map_err(|e| Error::InvalidRequest(format!("invalid redirect_uri: {}", e)))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("error", error);
        query.append_pair("error_description", description);
        if let Some(state) = state {
            query.append_pair("state", state);
        }
    }
    Ok(found(url.as_str()))
}

fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
}

/// Handle the upstream identity provider's redirect back to us
async fn handle_callback<S, P>(
    State(server): State<OAuthProxyServer<S, P>>,
    Query(params): Query<CallbackQuery>,
) -> Response
where
    S: ArtifactStore + 'static,
    P: IdentityProvider + 'static,
{
    match server
        .bridge
        .complete_login(params.code.as_deref(), params.state.as_deref())
        .await
    {
        Ok(redirect) => {
            tracing::info!("upstream login complete, redirecting client");
            found(redirect.url.as_str())
        }
        Err(Error::MissingCallbackParameters) => {
            tracing::error!("missing code or state in callback");
            (StatusCode::BAD_REQUEST, "Missing code or state parameter").into_response()
        }
        Err(e) => {
            tracing::error!("OAuth callback failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "OAuth authentication failed").into_response()
        }
    }
}

// Token endpoint

#[derive(Debug, Deserialize)]
struct TokenRequest {
    grant_type: Option<String>,
    code: Option<String>,
    code_verifier: Option<String>,
    redirect_uri: Option<String>,
    refresh_token: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RevokeRequest {
    token: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

/// Parse a request body as JSON or form data depending on its content type
fn parse_body<T: serde::de::DeserializeOwned>(headers: &HeaderMap, body: &[u8]) -> Result<T> {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"));

    if is_json {
        serde_json::from_slice(body)
            .map_err(|e| Error::InvalidRequest(format!("invalid JSON: {}", e)))
    } else {
        serde_urlencoded::from_bytes(body)
            .map_err(|e| Error::InvalidRequest(format!("invalid form data: {}", e)))
    }
}

/// Resolve the client and check its secret when it was issued one
async fn authenticate_client<S: ArtifactStore>(
    authority: &OAuthAuthority<S>,
    client_id: Option<&str>,
    client_secret: Option<&str>,
) -> Result<RegisteredClient> {
    let client_id =
        client_id.ok_or_else(|| Error::InvalidRequest("client_id required".to_string()))?;
    let client = authority
        .store()
        .get_client(client_id)
        .await?
        .ok_or(Error::InvalidClient)?;

    if let Some(expected) = client.client_secret.as_deref() {
        if client_secret != Some(expected) {
            tracing::warn!("client {} failed authentication", client_id);
            return Err(Error::InvalidClient);
        }
    }

    Ok(client)
}

/// Handle token request (exchange code for tokens or refresh tokens).
async fn handle_token<S, P>(
    State(server): State<OAuthProxyServer<S, P>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response>
where
    S: ArtifactStore + 'static,
    P: IdentityProvider + 'static,
{
    tracing::info!("handling token request");

    let params: TokenRequest = parse_body(&headers, &body)?;
    let client = authenticate_client(
        &server.authority,
        params.client_id.as_deref(),
        params.client_secret.as_deref(),
    )
    .await?;

    let tokens = match params.grant_type.as_deref() {
        Some("authorization_code") => {
            let code = params
                .code
                .as_deref()
                .ok_or_else(|| Error::InvalidRequest("code required".to_string()))?;
            let verifier = params
                .code_verifier
                .as_deref()
                .ok_or_else(|| Error::InvalidRequest("code_verifier required".to_string()))?;

            let (challenge, method) = server.authority.challenge_for_code(code).await?;
            if !verify_pkce(verifier, &challenge, &method) {
                tracing::warn!("PKCE verification failed for client {}", client.client_id);
                return Err(Error::InvalidGrant(
                    "code_verifier does not match the challenge".to_string(),
                ));
            }

            server
                .authority
                .exchange_code(&client, code, params.redirect_uri.as_deref())
                .await?
        }
        Some("refresh_token") => {
            let refresh_token = params
                .refresh_token
                .as_deref()
                .ok_or_else(|| Error::InvalidRequest("refresh_token required".to_string()))?;
            server
                .authority
                .exchange_refresh_token(&client, refresh_token)
                .await?
        }
        Some(_) => return Err(Error::UnsupportedGrantType),
        None => return Err(Error::InvalidRequest("grant_type required".to_string())),
    };

    Ok((
        [
            (header::CACHE_CONTROL, "no-store"),
            (header::PRAGMA, "no-cache"),
        ],
        Json(tokens),
    )
        .into_response())
}

/// Handle token revocation (RFC 7009).
async fn handle_revoke<S, P>(
    State(server): State<OAuthProxyServer<S, P>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response>
where
    S: ArtifactStore + 'static,
    P: IdentityProvider + 'static,
{
    tracing::info!("handling revoke request");

    let params: RevokeRequest = parse_body(&headers, &body)?;
    authenticate_client(
        &server.authority,
        params.client_id.as_deref(),
        params.client_secret.as_deref(),
    )
    .await?;

    let token = params
        .token
        .as_deref()
        .ok_or_else(|| Error::InvalidRequest("token required".to_string()))?;
    server.authority.revoke(token).await?;

    Ok(Json(serde_json::json!({})).into_response())
}

// Health and proxy

/// Report proxy liveness together with the backend's own health
async fn handle_health<S, P>(State(server): State<OAuthProxyServer<S, P>>) -> Response
where
    S: ArtifactStore + 'static,
    P: IdentityProvider + 'static,
{
    let probe = async {
        server
            .http
            .get(server.config.backend_health_url())
            .send()
            .await?
            .error_for_status()?
            .json::<serde_json::Value>()
            .await
    };

    match probe.await {
        Ok(backend) => Json(serde_json::json!({
            "proxy": "ok",
            "oauth": server.provider.name(),
            "backend": backend,
        }))
        .into_response(),
        Err(e) => {
            tracing::warn!("backend health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "proxy": "ok",
                    "oauth": server.provider.name(),
                    "backend": "unreachable",
                    "error": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}

/// Proxy a protocol request to the backend
async fn handle_mcp<S, P>(
    State(server): State<OAuthProxyServer<S, P>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response
where
    S: ArtifactStore + 'static,
    P: IdentityProvider + 'static,
{
    tracing::debug!("proxying {} request", method);
    server.gateway.handle(method, headers, body).await
}
