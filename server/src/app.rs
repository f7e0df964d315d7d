use axum::{
    Router,
    extract::{Request, State},
    http::{HeaderValue, Method, header},
    middleware::{self, Next},
    response::Response,
};
use mcp_oauth_gateway::{
    ArtifactStore, IdentityProvider, OAuthProxyServer,
    gateway::{AUTHORIZATION_SERVER_HEADER, SESSION_HEADER},
};
use miette::{IntoDiagnostic, Result};
use tower_http::cors::{Any, CorsLayer};

/// Where OAuth discovery starts, advertised on `OPTIONS` to the proxied path
#[derive(Clone)]
struct DiscoveryHint {
    mcp_path: String,
    metadata_url: HeaderValue,
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            SESSION_HEADER,
        ])
        .expose_headers([SESSION_HEADER, AUTHORIZATION_SERVER_HEADER])
}

/// The CORS layer answers every `OPTIONS` itself, so the hint is added on
/// the way out instead of by the gateway.
async fn advertise_authorization_server(
    State(hint): State<DiscoveryHint>,
    request: Request,
    next: Next,
) -> Response {
    let advertise = request.method() == Method::OPTIONS && request.uri().path() == hint.mcp_path;
    let mut response = next.run(request).await;
    if advertise {
        response
            .headers_mut()
            .insert(AUTHORIZATION_SERVER_HEADER, hint.metadata_url);
    }
    response
}

/// Full application: proxy routes behind CORS, with the discovery hint outermost.
pub fn app<S, P>(proxy: &OAuthProxyServer<S, P>) -> Result<Router>
where
    S: ArtifactStore + 'static,
    P: IdentityProvider + 'static,
{
    let config = proxy.config();
    let hint = DiscoveryHint {
        mcp_path: format!("/{}", config.backend_path.trim_start_matches('/')),
        metadata_url: HeaderValue::from_str(&config.authorization_server_metadata_url())
            .into_diagnostic()?,
    };

    Ok(proxy
        .router()
        .layer(cors_layer())
        .layer(middleware::from_fn_with_state(
            hint,
            advertise_authorization_server,
        )))
}
