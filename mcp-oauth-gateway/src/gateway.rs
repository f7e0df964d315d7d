//! Authenticating, session-sticky reverse proxy in front of the MCP backend.

use crate::auth::{Credential, classify_credential, credential_prefix, extract_bearer_token};
use crate::authority::OAuthAuthority;
use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::session::SessionAffinity;
use crate::store::ArtifactStore;
use axum::{
    Json,
    body::{Body, Bytes},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use std::sync::Arc;

/// Header carrying the backend-assigned session identifier
pub const SESSION_HEADER: HeaderName = HeaderName::from_static("mcp-session-id");

/// Header advertising where OAuth discovery starts
pub const AUTHORIZATION_SERVER_HEADER: HeaderName =
    HeaderName::from_static("x-oauth-authorization-server");

/// Detail returned with a 500; the underlying error is only logged
const PROXY_ERROR_MESSAGE: &str = "The request could not be relayed to the MCP backend";

/// Headers never copied from a streamed backend response
const STREAM_SKIPPED_HEADERS: &[&str] = &[
    "transfer-encoding",
    "content-encoding",
    "content-length",
    "connection",
    "cache-control",
    "mcp-session-id",
];

pub struct ProxyGateway<S: ArtifactStore> {
    config: Arc<ProxyConfig>,
    authority: OAuthAuthority<S>,
    sessions: Arc<SessionAffinity>,
    http: reqwest::Client,
}

impl<S: ArtifactStore> Clone for ProxyGateway<S> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            authority: self.authority.clone(),
            sessions: self.sessions.clone(),
            http: self.http.clone(),
        }
    }
}

impl<S: ArtifactStore> ProxyGateway<S> {
    pub fn new(
        config: Arc<ProxyConfig>,
        authority: OAuthAuthority<S>,
        sessions: Arc<SessionAffinity>,
    ) -> Self {
        Self {
            config,
            authority,
            sessions,
            http: reqwest::Client::new(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionAffinity> {
        &self.sessions
    }

    /// Handle one request to the protected endpoint. Never fails; every
    /// error becomes a response.
    pub async fn handle(&self, method: Method, headers: HeaderMap, body: Bytes) -> Response {
        if method == Method::OPTIONS {
            return self.preflight();
        }

        match self.forward(method, &headers, body).await {
            Ok(response) => response,
            Err(Error::MissingCredential) => self.challenge(
                "No authorization token provided",
                "Authentication required. Please use OAuth.",
            ),
            Err(Error::InvalidOrExpiredToken) => {
                self.challenge("Invalid or expired token", "Invalid or expired token")
            }
            Err(e) => {
                tracing::error!("proxy error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({
                        "error": "Internal proxy error",
                        "message": PROXY_ERROR_MESSAGE,
                    })),
                )
                    .into_response()
            }
        }
    }

    fn preflight(&self) -> Response {
        let mut response = StatusCode::OK.into_response();
        if let Ok(value) = HeaderValue::from_str(&self.config.authorization_server_metadata_url()) {
            response
                .headers_mut()
                .insert(AUTHORIZATION_SERVER_HEADER, value);
        }
        response
    }

    fn challenge(&self, description: &str, message: &str) -> Response {
        let challenge = format!(
            "Bearer realm=\"{}\", resource_metadata=\"{}\", error=\"invalid_token\", error_description=\"{}\"",
            self.config.issuer(),
            self.config.protected_resource_metadata_url(),
            description
        );
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, challenge)],
            Json(serde_json::json!({ "error": message })),
        )
            .into_response()
    }

    async fn forward(&self, method: Method, headers: &HeaderMap, body: Bytes) -> Result<Response> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(extract_bearer_token)
            .ok_or(Error::MissingCredential)?;

        let credential =
            classify_credential(token, self.config.static_secret.as_deref(), &self.authority)
                .await?;

        let outbound_secret = match &credential {
            Credential::Direct => token,
            Credential::OAuth(info) => {
                tracing::debug!("OAuth credential for client {}", info.client_id);
                self.config.static_secret.as_deref().unwrap_or(token)
            }
        };

        let session_id = if is_initialize_request(&body) {
            tracing::debug!("initialize request, not forwarding a session id");
            None
        } else {
            match self.sessions.get(token).await {
                Some(bound) => Some(bound),
                None => headers
                    .get(&SESSION_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from),
            }
        };

        let mut request = self
            .http
            .request(method.clone(), self.config.backend_endpoint())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .bearer_auth(outbound_secret);
        if let Some(session_id) = &session_id {
            request = request.header(SESSION_HEADER, session_id.as_str());
        }
        if method != Method::GET && method != Method::HEAD && !body.is_empty() {
            request = request.body(body);
        }

        let upstream = request
            .send()
            .await
            .map_err(|e| Error::BackendUnreachable(e.to_string()))?;

        let returned_session = upstream.headers().get(&SESSION_HEADER).cloned();
        let mut response = relay(upstream).await?;

        if let Some(session) = returned_session {
            if let Ok(session_id) = session.to_str() {
                tracing::debug!(
                    "binding {} to backend session {}",
                    credential_prefix(token),
                    session_id
                );
                self.sessions.set(token, session_id).await;
            }
            response.headers_mut().insert(SESSION_HEADER, session);
        }
        Ok(response)
    }
}

async fn relay(upstream: reqwest::Response) -> Result<Response> {
    let status = upstream.status();
    let is_event_stream = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("text/event-stream"));

    if is_event_stream {
        let mut builder = Response::builder().status(status);
        for (name, value) in upstream.headers() {
            if !STREAM_SKIPPED_HEADERS.contains(&name.as_str()) {
                builder = builder.header(name, value);
            }
        }

        let stream = upstream
            .bytes_stream()
            .map(|result| result.map_err(std::io::Error::other));

        return builder
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .body(Body::from_stream(stream))
            .map_err(|e| Error::Internal(format!("failed to build response: {}", e)));
    }

    if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT {
        return Ok(status.into_response());
    }

    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| Error::BackendUnreachable(e.to_string()))?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| Error::MalformedBackendResponse(e.to_string()))?;

    Ok((status, Json(value)).into_response())
}

/// Whether a request body opens a new protocol session.
///
/// Bodies that are not JSON, or carry no `initialize` call, are not.
pub fn is_initialize_request(body: &[u8]) -> bool {
    fn is_initialize(message: &serde_json::Value) -> bool {
        message.get("method").and_then(|m| m.as_str()) == Some("initialize")
    }

    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(serde_json::Value::Array(batch)) => batch.iter().any(is_initialize),
        Ok(message) => is_initialize(&message),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use crate::testing::{self, Seen};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use url::Url;

    async fn gateway(backend: Url) -> (ProxyGateway<MemoryStore>, String) {
        let config = Arc::new(testing::config(backend));
        let authority = OAuthAuthority::new(Arc::new(MemoryStore::new()), &config);
        let token = testing::issue_access_token(&authority).await;
        let gateway = ProxyGateway::new(config, authority, Arc::new(SessionAffinity::new()));
        (gateway, token)
    }

    fn headers(token: Option<&str>, session: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            headers.insert(
                header::AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
            );
        }
        if let Some(session) = session {
            headers.insert(SESSION_HEADER, HeaderValue::from_str(session).unwrap());
        }
        headers
    }

    fn rpc(method: &str) -> Bytes {
        Bytes::from(
            serde_json::json!({ "jsonrpc": "2.0", "id": 1, "method": method }).to_string(),
        )
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn seen_sessions(seen: &Seen) -> Vec<Option<String>> {
        seen.lock()
            .unwrap()
            .iter()
            .map(|r| r.session.clone())
            .collect()
    }

    #[test]
    fn test_initialize_detection() {
        assert!(is_initialize_request(&rpc("initialize")));
        assert!(!is_initialize_request(&rpc("tools/list")));
        assert!(is_initialize_request(
            br#"[{"method":"notifications/x"},{"method":"initialize"}]"#
        ));
        assert!(!is_initialize_request(b"not json"));
        assert!(!is_initialize_request(b""));
    }

    #[tokio::test]
    async fn test_initialize_then_tools_list_reuses_session() {
        let (backend, seen) = testing::spawn_backend().await;
        let (gateway, token) = gateway(backend).await;

        let response = gateway
            .handle(Method::POST, headers(Some(&token), None), rpc("initialize"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[&SESSION_HEADER], "s1");

        let response = gateway
            .handle(Method::POST, headers(Some(&token), None), rpc("tools/list"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["result"]["tools"], serde_json::json!([]));

        assert_eq!(seen_sessions(&seen), vec![None, Some("s1".to_string())]);
        let requests = seen.lock().unwrap().clone();
        for request in &requests {
            assert_eq!(request.authorization.as_deref(), Some("Bearer static-secret"));
            assert_eq!(
                request.accept.as_deref(),
                Some("application/json, text/event-stream")
            );
        }
        assert!(requests[1].body.contains("tools/list"));
    }

    #[tokio::test]
    async fn test_bound_session_wins_over_caller_supplied() {
        let (backend, seen) = testing::spawn_backend().await;
        let (gateway, token) = gateway(backend).await;

        gateway
            .handle(Method::POST, headers(Some(&token), None), rpc("initialize"))
            .await;
        gateway
            .handle(
                Method::POST,
                headers(Some(&token), Some("caller-chosen")),
                rpc("tools/list"),
            )
            .await;

        assert_eq!(seen_sessions(&seen)[1].as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_caller_session_used_when_nothing_bound() {
        let (backend, seen) = testing::spawn_backend().await;
        let (gateway, _) = gateway(backend).await;

        gateway
            .handle(
                Method::POST,
                headers(Some("static-secret"), Some("caller-sid")),
                rpc("tools/list"),
            )
            .await;

        assert_eq!(seen_sessions(&seen), vec![Some("caller-sid".to_string())]);
    }

    #[tokio::test]
    async fn test_initialize_never_forwards_session() {
        let (backend, seen) = testing::spawn_backend().await;
        let (gateway, token) = gateway(backend).await;

        gateway
            .handle(Method::POST, headers(Some(&token), None), rpc("initialize"))
            .await;
        gateway
            .handle(
                Method::POST,
                headers(Some(&token), Some("stale")),
                rpc("initialize"),
            )
            .await;

        assert_eq!(seen_sessions(&seen), vec![None, None]);
    }

    #[tokio::test]
    async fn test_static_secret_forwarded_verbatim() {
        let (backend, seen) = testing::spawn_backend().await;
        let (gateway, _) = gateway(backend).await;

        let response = gateway
            .handle(
                Method::POST,
                headers(Some("static-secret"), None),
                rpc("tools/list"),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            seen.lock().unwrap()[0].authorization.as_deref(),
            Some("Bearer static-secret")
        );
    }

    #[tokio::test]
    async fn test_oauth_token_passes_through_without_static_secret() {
        let (backend, seen) = testing::spawn_backend().await;
        let config = Arc::new(ProxyConfig::new(
            Url::parse("https://proxy.example.com").unwrap(),
            backend,
        ));
        let authority = OAuthAuthority::new(Arc::new(MemoryStore::new()), &config);
        let token = testing::issue_access_token(&authority).await;
        let gateway = ProxyGateway::new(config, authority, Arc::new(SessionAffinity::new()));

        gateway
            .handle(Method::POST, headers(Some(&token), None), rpc("tools/list"))
            .await;
        assert_eq!(
            seen.lock().unwrap()[0].authorization,
            Some(format!("Bearer {}", token))
        );
    }

    #[tokio::test]
    async fn test_missing_credential_is_challenged_without_backend_call() {
        let (backend, seen) = testing::spawn_backend().await;
        let (gateway, _) = gateway(backend).await;

        let response = gateway
            .handle(Method::POST, headers(None, None), rpc("tools/list"))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let challenge = response.headers()[header::WWW_AUTHENTICATE].to_str().unwrap();
        assert!(challenge.starts_with("Bearer realm=\"https://proxy.example.com\""));
        assert!(challenge.contains(
            "resource_metadata=\"https://proxy.example.com/.well-known/oauth-protected-resource\""
        ));
        assert!(challenge.contains("error_description=\"No authorization token provided\""));
        assert_eq!(
            body_json(response).await,
            serde_json::json!({ "error": "Authentication required. Please use OAuth." })
        );
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_token_is_rejected() {
        let (backend, seen) = testing::spawn_backend().await;
        let (gateway, _) = gateway(backend).await;

        let response = gateway
            .handle(Method::POST, headers(Some("forged"), None), rpc("tools/list"))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
        assert_eq!(
            body_json(response).await,
            serde_json::json!({ "error": "Invalid or expired token" })
        );
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_event_stream_relayed_in_order() {
        let (backend, _) = testing::spawn_backend().await;
        let (gateway, token) = gateway(backend).await;

        let response = gateway
            .handle(Method::POST, headers(Some(&token), None), rpc("stream"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(response.headers()["x-backend"], "mock");
        assert_eq!(response.headers()[&SESSION_HEADER], "s1");

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(
            &bytes[..],
            b"data: one\n\ndata: two\n\ndata: three\n\n".as_slice()
        );
    }

    #[tokio::test]
    async fn test_event_stream_chunk_reaches_caller_before_backend_finishes() {
        let (backend, gate) = testing::spawn_gated_stream_backend().await;
        let (gateway, token) = gateway(backend).await;

        let response = gateway
            .handle(Method::POST, headers(Some(&token), None), rpc("tools/call"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let mut body = response.into_body().into_data_stream();

        let first = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("first event should arrive while the backend holds the stream")
            .unwrap()
            .unwrap();
        assert_eq!(&first[..], b"data: one\n\n".as_slice());

        gate.release.notify_one();
        let mut rest = Vec::new();
        while let Some(chunk) = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .unwrap()
        {
            rest.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(rest, b"data: two\n\ndata: three\n\n".to_vec());
    }

    #[tokio::test]
    async fn test_caller_disconnect_releases_backend_stream() {
        let (backend, gate) = testing::spawn_gated_stream_backend().await;
        let (gateway, token) = gateway(backend).await;

        let response = gateway
            .handle(Method::POST, headers(Some(&token), None), rpc("tools/call"))
            .await;
        let mut body = response.into_body().into_data_stream();
        let first = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&first[..], b"data: one\n\n".as_slice());
        assert!(!gate.dropped.load(Ordering::SeqCst));

        drop(body);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !gate.dropped.load(Ordering::SeqCst) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "backend stream still open after the caller went away"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_accepted_relayed_as_bare_status() {
        let (backend, _) = testing::spawn_backend().await;
        let (gateway, token) = gateway(backend).await;

        let response = gateway
            .handle(
                Method::POST,
                headers(Some(&token), None),
                rpc("notifications/initialized"),
            )
            .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn test_backend_status_is_preserved() {
        let (backend, seen) = testing::spawn_backend().await;
        let (gateway, token) = gateway(backend).await;

        let response = gateway
            .handle(Method::GET, headers(Some(&token), None), Bytes::new())
            .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(seen.lock().unwrap()[0].method, "GET");
    }

    #[tokio::test]
    async fn test_malformed_backend_json_is_server_error() {
        let (backend, _) = testing::spawn_backend().await;
        let (gateway, token) = gateway(backend).await;

        let response = gateway
            .handle(Method::POST, headers(Some(&token), None), rpc("broken"))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!response.headers().contains_key(&SESSION_HEADER));
        assert_eq!(body_json(response).await["error"], "Internal proxy error");
        assert!(gateway.sessions().get(&token).await.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_server_error() {
        let backend = testing::dead_backend().await;
        let port = backend.port().unwrap().to_string();
        let (gateway, token) = gateway(backend).await;

        let response = gateway
            .handle(Method::POST, headers(Some(&token), None), rpc("tools/list"))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Internal proxy error");
        let message = body["message"].as_str().unwrap();
        assert_eq!(message, PROXY_ERROR_MESSAGE);
        assert!(!message.contains("127.0.0.1"));
        assert!(!message.contains(&port));
    }

    #[tokio::test]
    async fn test_preflight_advertises_authorization_server() {
        let (gateway, _) = gateway(testing::dead_backend().await).await;

        let response = gateway
            .handle(Method::OPTIONS, HeaderMap::new(), Bytes::new())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[&AUTHORIZATION_SERVER_HEADER],
            "https://proxy.example.com/.well-known/oauth-authorization-server"
        );
    }
}
