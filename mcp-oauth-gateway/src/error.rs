pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Authorization-flow errors
    #[error("unregistered redirect_uri")]
    UnregisteredRedirectUri,
    #[error("invalid authorization code")]
    InvalidAuthorizationCode,
    #[error("authorization code issued to a different client")]
    CodeClientMismatch,

    // Authentication errors
    #[error("no authorization token provided")]
    MissingCredential,
    #[error("invalid or expired access token")]
    InvalidOrExpiredToken,

    // Upstream login errors
    #[error("missing code or state parameter")]
    MissingCallbackParameters,
    #[error("unknown or expired login state")]
    UnknownOrExpiredLoginState,
    #[error("upstream authentication failed: {0}")]
    UpstreamAuthFailure(String),

    // Backend errors
    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),
    #[error("malformed backend response: {0}")]
    MalformedBackendResponse(String),

    // OAuth protocol errors
    #[error("invalid_request: {0}")]
    InvalidRequest(String),
    #[error("invalid_client")]
    InvalidClient,
    #[error("invalid_grant: {0}")]
    InvalidGrant(String),
    #[error("unsupported_grant_type")]
    UnsupportedGrantType,
    #[error("invalid_client_metadata: {0}")]
    InvalidClientMetadata(String),

    // Storage errors
    #[error("storage error: {0}")]
    Storage(String),

    // Generic errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// OAuth 2.0 error code for the token, authorize and registration endpoints.
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            Error::InvalidAuthorizationCode | Error::CodeClientMismatch | Error::InvalidGrant(_) => {
                "invalid_grant"
            }
            Error::InvalidClient => "invalid_client",
            Error::UnsupportedGrantType => "unsupported_grant_type",
            Error::InvalidClientMetadata(_) => "invalid_client_metadata",
            Error::UnregisteredRedirectUri | Error::InvalidRequest(_) => "invalid_request",
            Error::MissingCredential | Error::InvalidOrExpiredToken => "invalid_token",
            _ => "server_error",
        }
    }
}

// axum IntoResponse implementation
#[cfg(feature = "axum")]
impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        use axum::Json;
        use axum::http::{StatusCode, header};

        let status = match self {
            Error::MissingCredential | Error::InvalidOrExpiredToken => {
                return (
                    StatusCode::UNAUTHORIZED,
                    [(
                        header::WWW_AUTHENTICATE,
                        format!(
                            "Bearer error=\"invalid_token\", error_description=\"{}\"",
                            self
                        ),
                    )],
                    Json(serde_json::json!({ "error": "Invalid or expired token" })),
                )
                    .into_response();
            }
            Error::InvalidClient => StatusCode::UNAUTHORIZED,
            Error::UnregisteredRedirectUri
            | Error::InvalidAuthorizationCode
            | Error::CodeClientMismatch
            | Error::MissingCallbackParameters
            | Error::InvalidRequest(_)
            | Error::InvalidGrant(_)
            | Error::UnsupportedGrantType
            | Error::InvalidClientMetadata(_) => StatusCode::BAD_REQUEST,
            _ => {
                tracing::error!("request failed: {}", self);
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({
                        "error": "server_error",
                        "error_description": "internal server error",
                    })),
                )
                    .into_response();
            }
        };

        let body = serde_json::json!({
            "error": self.oauth_error_code(),
            "error_description": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}
