//! Shared fixtures for unit tests: a recording mock MCP backend and helpers
//! for minting access tokens.

use crate::authority::{AuthorizationParams, OAuthAuthority};
use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::memory_store::MemoryStore;
use crate::store::{ArtifactStore, RegisteredClient};
use crate::upstream::{IdentityProvider, UpstreamIdentity};
use async_trait::async_trait;
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::Notify;
use url::Url;

/// What the mock backend saw on one request
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub authorization: Option<String>,
    pub session: Option<String>,
    pub accept: Option<String>,
    pub body: String,
}

pub type Seen = Arc<Mutex<Vec<SeenRequest>>>;

async fn mcp(
    State(seen): State<Seen>,
    method: axum::http::Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };
    let body = String::from_utf8_lossy(&body).to_string();
    seen.lock().unwrap().push(SeenRequest {
        method: method.to_string(),
        authorization: header("authorization"),
        session: header("mcp-session-id"),
        accept: header("accept"),
        body: body.clone(),
    });

    let rpc: serde_json::Value = serde_json::from_str(&body).unwrap_or_default();
    match rpc.get("method").and_then(|m| m.as_str()) {
        Some("initialize") => (
            [("mcp-session-id", "s1")],
            Json(serde_json::json!({ "jsonrpc": "2.0", "id": rpc["id"], "result": {} })),
        )
            .into_response(),
        Some("notifications/initialized") => StatusCode::ACCEPTED.into_response(),
        Some("stream") => {
            let chunks = ["data: one\n\n", "data: two\n\n", "data: three\n\n"]
                .into_iter()
                .map(|chunk| Ok::<_, std::io::Error>(Bytes::from(chunk)));
            Response::builder()
                .header("content-type", "text/event-stream")
                .header("mcp-session-id", "s1")
                .header("x-backend", "mock")
                .body(Body::from_stream(futures::stream::iter(chunks)))
                .unwrap()
        }
        Some("broken") => (
            [("content-type", "application/json"), ("mcp-session-id", "s2")],
            "{not json",
        )
            .into_response(),
        Some(_) => Json(serde_json::json!({
            "jsonrpc": "2.0",
            "id": rpc["id"],
            "result": { "tools": [] },
        }))
        .into_response(),
        None => (
            StatusCode::METHOD_NOT_ALLOWED,
            Json(serde_json::json!({ "error": "no method" })),
        )
            .into_response(),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Serve the mock backend on an ephemeral port
pub async fn spawn_backend() -> (Url, Seen) {
    let seen: Seen = Arc::default();
    let app = Router::new()
        .route("/mcp", any(mcp))
        .route("/health", get(health))
        .with_state(seen.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (Url::parse(&format!("http://{}", addr)).unwrap(), seen)
}

/// Handles on a backend that sends one event, then holds the stream open
#[derive(Clone, Default)]
pub struct GatedStream {
    /// Lets the backend send the remaining events
    pub release: Arc<Notify>,
    /// Set once the backend's response body has been dropped
    pub dropped: Arc<AtomicBool>,
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

async fn gated_stream(State(gate): State<GatedStream>) -> Response {
    let state = (0u8, gate.release.clone(), DropFlag(gate.dropped.clone()));
    let events = futures::stream::unfold(state, |(step, release, flag)| async move {
        let chunk = match step {
            0 => "data: one\n\n",
            1 => {
                release.notified().await;
                "data: two\n\n"
            }
            2 => "data: three\n\n",
            _ => return None,
        };
        Some((
            Ok::<_, std::io::Error>(Bytes::from(chunk)),
            (step + 1, release, flag),
        ))
    });
    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(events))
        .unwrap()
}

/// Serve a [`GatedStream`] backend on an ephemeral port
pub async fn spawn_gated_stream_backend() -> (Url, GatedStream) {
    let gate = GatedStream::default();
    let app = Router::new()
        .route("/mcp", any(gated_stream))
        .with_state(gate.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (Url::parse(&format!("http://{}", addr)).unwrap(), gate)
}

/// An address nothing listens on
pub async fn dead_backend() -> Url {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    Url::parse(&format!("http://{}", addr)).unwrap()
}

pub fn config(backend: Url) -> ProxyConfig {
    ProxyConfig::new(Url::parse("https://proxy.example.com").unwrap(), backend)
        .with_static_secret("static-secret")
}

pub fn public_client() -> RegisteredClient {
    RegisteredClient {
        client_id: "test-client".to_string(),
        client_secret: None,
        redirect_uris: vec!["https://app.example/cb".to_string()],
        client_name: Some("Test".to_string()),
        grant_types: vec!["authorization_code".to_string(), "refresh_token".to_string()],
        response_types: vec!["code".to_string()],
        token_endpoint_auth_method: "none".to_string(),
        scope: None,
        client_id_issued_at: 0,
    }
}

/// Register the test client and mint an access token for it
pub async fn issue_access_token(authority: &OAuthAuthority<MemoryStore>) -> String {
    let client = public_client();
    authority
        .store()
        .register_client(client.clone())
        .await
        .unwrap();
    let redirect = authority
        .authorize(
            &client,
            AuthorizationParams {
                redirect_uri: "https://app.example/cb".to_string(),
                scopes: vec!["mcp:tools".to_string()],
                resource: None,
                state: None,
                code_challenge: "challenge".to_string(),
                code_challenge_method: "S256".to_string(),
            },
            None,
        )
        .await
        .unwrap();
    authority
        .exchange_code(&client, &redirect.code, None)
        .await
        .unwrap()
        .access_token
}

/// Identity provider that accepts the upstream code `upstream-ok`
pub struct FakeProvider;

#[async_trait]
impl IdentityProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    fn authorization_url(&self, correlation: &str) -> Url {
        let mut url = Url::parse("https://idp.example/authorize").unwrap();
        url.query_pairs_mut().append_pair("state", correlation);
        url
    }

    async fn exchange_code(&self, code: &str) -> Result<UpstreamIdentity> {
        if code == "upstream-ok" {
            Ok(UpstreamIdentity {
                id: "1".to_string(),
                login: "octocat".to_string(),
            })
        } else {
            Err(Error::UpstreamAuthFailure("bad code".to_string()))
        }
    }
}
