use mcp_oauth_gateway::{GitHubProvider, OAuthProxyServer, ProxyConfig, UpstreamConfig};
use miette::{IntoDiagnostic, Result, miette};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use std::str::FromStr;
use tracing_subscriber::EnvFilter;
use url::Url;

mod app;
mod store;

use store::SqliteStore;

async fn init_db(db_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(db_url)
        .into_diagnostic()?
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(options).await.into_diagnostic()?;

    let migration_sql = include_str!("../migrations/001_oauth_schema.sql");
    sqlx::raw_sql(migration_sql)
        .execute(&pool)
        .await
        .into_diagnostic()?;

    Ok(pool)
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn required_env(name: &str) -> Result<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| miette!("{} must be set", name))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "server=debug,mcp_oauth_gateway=debug,info".into()),
        )
        .init();

    let port: u16 = env_or("PROXY_PORT", "3002").parse().into_diagnostic()?;
    let base_url =
        Url::parse(&env_or("BASE_URL", &format!("http://localhost:{}", port))).into_diagnostic()?;
    let backend_url =
        Url::parse(&env_or("MCP_BACKEND_URL", "http://localhost:3003")).into_diagnostic()?;
    let github_client_id = required_env("GITHUB_CLIENT_ID")?;
    let github_client_secret = required_env("GITHUB_CLIENT_SECRET")?;
    let db_url = env_or("DATABASE_URL", "sqlite:oauth.db");

    let mut config = ProxyConfig::new(base_url, backend_url);
    match std::env::var("AUTH_TOKEN") {
        Ok(secret) if !secret.is_empty() => config = config.with_static_secret(secret),
        _ => tracing::warn!(
            "AUTH_TOKEN not set, OAuth access tokens will be forwarded to the backend unchanged"
        ),
    }

    let github = GitHubProvider::new(
        UpstreamConfig::github(github_client_id, github_client_secret),
        config.callback_url(),
    );

    let pool = init_db(&db_url).await?;

    let proxy = OAuthProxyServer::builder()
        .config(config)
        .store(SqliteStore::new(pool))
        .provider(github)
        .build()
        .into_diagnostic()?;
    proxy.spawn_sweeper();

    let config = proxy.config();
    let issuer = config.issuer();
    tracing::info!("OAuth proxy listening on port {}", port);
    tracing::info!("  Issuer: {}", issuer);
    tracing::info!("  Backend: {}", config.backend_endpoint());
    tracing::info!("  Metadata: {}", config.authorization_server_metadata_url());
    tracing::info!("  Register: {}/oauth/register", issuer);
    tracing::info!("  Callback: {}", config.callback_url());

    let router = app::app(&proxy)?;

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .into_diagnostic()?;
    axum::serve(listener, router).await.into_diagnostic()?;
    Ok(())
}
