use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use mcp_oauth_gateway::{
    ArtifactStore, AuthorizationCode, Error, PendingLogin, RegisteredClient, Result, SweepReport,
    TokenPair,
};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

/// SQLite-backed artifact store. Consumption uses `DELETE ... RETURNING` so a
/// code or refresh token is handed out at most once.
#[derive(Clone)]
pub struct SqliteStore {
    db: SqlitePool,
}

impl SqliteStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }
}

fn storage(e: impl std::fmt::Display) -> Error {
    Error::Storage(e.to_string())
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>> {
    let value: String = row.try_get(column).map_err(storage)?;
    Ok(DateTime::parse_from_rfc3339(&value)
        .map_err(storage)?
        .with_timezone(&Utc))
}

fn parse_scopes(row: &SqliteRow) -> Result<Vec<String>> {
    let scopes: String = row.try_get("scopes").map_err(storage)?;
    Ok(scopes.split_whitespace().map(String::from).collect())
}

fn code_from_row(row: &SqliteRow) -> Result<AuthorizationCode> {
    Ok(AuthorizationCode {
        code: row.try_get("code").map_err(storage)?,
        client_id: row.try_get("client_id").map_err(storage)?,
        redirect_uri: row.try_get("redirect_uri").map_err(storage)?,
        scopes: parse_scopes(row)?,
        resource: row.try_get("resource").map_err(storage)?,
        state: row.try_get("state").map_err(storage)?,
        code_challenge: row.try_get("code_challenge").map_err(storage)?,
        code_challenge_method: row.try_get("code_challenge_method").map_err(storage)?,
        subject: row.try_get("subject").map_err(storage)?,
        expires_at: parse_timestamp(row, "expires_at")?,
    })
}

fn token_from_row(row: &SqliteRow) -> Result<TokenPair> {
    Ok(TokenPair {
        access_token: row.try_get("access_token").map_err(storage)?,
        token_type: row.try_get("token_type").map_err(storage)?,
        expires_in: row.try_get("expires_in").map_err(storage)?,
        refresh_token: row.try_get("refresh_token").map_err(storage)?,
        client_id: row.try_get("client_id").map_err(storage)?,
        scopes: parse_scopes(row)?,
        resource: row.try_get("resource").map_err(storage)?,
        subject: row.try_get("subject").map_err(storage)?,
        created_at: parse_timestamp(row, "created_at")?,
        refresh_expires_at: parse_timestamp(row, "refresh_expires_at")?,
    })
}

fn pending_login_from_row(row: &SqliteRow) -> Result<PendingLogin> {
    Ok(PendingLogin {
        correlation: row.try_get("correlation").map_err(storage)?,
        client_id: row.try_get("client_id").map_err(storage)?,
        redirect_uri: row.try_get("redirect_uri").map_err(storage)?,
        state: row.try_get("state").map_err(storage)?,
        code_challenge: row.try_get("code_challenge").map_err(storage)?,
        code_challenge_method: row.try_get("code_challenge_method").map_err(storage)?,
        scopes: parse_scopes(row)?,
        resource: row.try_get("resource").map_err(storage)?,
        expires_at: parse_timestamp(row, "expires_at")?,
    })
}

#[async_trait]
impl ArtifactStore for SqliteStore {
    async fn register_client(&self, client: RegisteredClient) -> Result<()> {
        let metadata = serde_json::to_string(&client).map_err(storage)?;
        sqlx::query(
            r#"
            INSERT INTO oauth_clients (client_id, metadata, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(&client.client_id)
        .bind(metadata)
        .bind(timestamp(Utc::now()))
        .execute(&self.db)
        .await
        .map_err(storage)?;

        Ok(())
    }

    async fn get_client(&self, client_id: &str) -> Result<Option<RegisteredClient>> {
        let row = sqlx::query("SELECT metadata FROM oauth_clients WHERE client_id = ?")
            .bind(client_id)
            .fetch_optional(&self.db)
            .await
            .map_err(storage)?;

        match row {
            Some(row) => {
                let metadata: String = row.try_get("metadata").map_err(storage)?;
                Ok(Some(serde_json::from_str(&metadata).map_err(storage)?))
            }
            None => Ok(None),
        }
    }

    async fn put_code(&self, code: AuthorizationCode) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO oauth_codes (code, client_id, redirect_uri, scopes, resource, state, code_challenge, code_challenge_method, subject, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&code.code)
        .bind(&code.client_id)
        .bind(&code.redirect_uri)
        .bind(code.scopes.join(" "))
        .bind(&code.resource)
        .bind(&code.state)
        .bind(&code.code_challenge)
        .bind(&code.code_challenge_method)
        .bind(&code.subject)
        .bind(timestamp(code.expires_at))
        .execute(&self.db)
        .await
        .map_err(storage)?;

        Ok(())
    }

    async fn get_code(&self, code: &str) -> Result<Option<AuthorizationCode>> {
        let row = sqlx::query("SELECT * FROM oauth_codes WHERE code = ?")
            .bind(code)
            .fetch_optional(&self.db)
            .await
            .map_err(storage)?;

        let now = Utc::now();
        Ok(row
            .map(|row| code_from_row(&row))
            .transpose()?
            .filter(|code| !code.is_expired(now)))
    }

    async fn take_code(&self, code: &str) -> Result<Option<AuthorizationCode>> {
        let row = sqlx::query("DELETE FROM oauth_codes WHERE code = ? RETURNING *")
            .bind(code)
            .fetch_optional(&self.db)
            .await
            .map_err(storage)?;

        let now = Utc::now();
        Ok(row
            .map(|row| code_from_row(&row))
            .transpose()?
            .filter(|code| !code.is_expired(now)))
    }

    async fn delete_code(&self, code: &str) -> Result<()> {
        sqlx::query("DELETE FROM oauth_codes WHERE code = ?")
            .bind(code)
            .execute(&self.db)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn put_token(&self, token: TokenPair) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO oauth_tokens (access_token, refresh_token, token_type, expires_in, client_id, scopes, resource, subject, created_at, refresh_expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&token.access_token)
        .bind(&token.refresh_token)
        .bind(&token.token_type)
        .bind(token.expires_in)
        .bind(&token.client_id)
        .bind(token.scopes.join(" "))
        .bind(&token.resource)
        .bind(&token.subject)
        .bind(timestamp(token.created_at))
        .bind(timestamp(token.refresh_expires_at))
        .execute(&self.db)
        .await
        .map_err(storage)?;

        Ok(())
    }

    async fn get_token(&self, access_token: &str) -> Result<Option<TokenPair>> {
        let row = sqlx::query("SELECT * FROM oauth_tokens WHERE access_token = ?")
            .bind(access_token)
            .fetch_optional(&self.db)
            .await
            .map_err(storage)?;

        let now = Utc::now();
        Ok(row
            .map(|row| token_from_row(&row))
            .transpose()?
            .filter(|token| !token.is_access_expired(now)))
    }

    async fn take_token_by_refresh(&self, refresh_token: &str) -> Result<Option<TokenPair>> {
        let row = sqlx::query("DELETE FROM oauth_tokens WHERE refresh_token = ? RETURNING *")
            .bind(refresh_token)
            .fetch_optional(&self.db)
            .await
            .map_err(storage)?;

        let now = Utc::now();
        Ok(row
            .map(|row| token_from_row(&row))
            .transpose()?
            .filter(|token| !token.is_refresh_expired(now)))
    }

    async fn delete_token(&self, token: &str) -> Result<()> {
        sqlx::query("DELETE FROM oauth_tokens WHERE access_token = ? OR refresh_token = ?")
            .bind(token)
            .bind(token)
            .execute(&self.db)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn put_pending_login(&self, login: PendingLogin) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO oauth_pending_logins (correlation, client_id, redirect_uri, state, code_challenge, code_challenge_method, scopes, resource, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&login.correlation)
        .bind(&login.client_id)
        .bind(&login.redirect_uri)
        .bind(&login.state)
        .bind(&login.code_challenge)
        .bind(&login.code_challenge_method)
        .bind(login.scopes.join(" "))
        .bind(&login.resource)
        .bind(timestamp(login.expires_at))
        .execute(&self.db)
        .await
        .map_err(storage)?;

        Ok(())
    }

    async fn take_pending_login(&self, correlation: &str) -> Result<Option<PendingLogin>> {
        let row =
            sqlx::query("DELETE FROM oauth_pending_logins WHERE correlation = ? RETURNING *")
                .bind(correlation)
                .fetch_optional(&self.db)
                .await
                .map_err(storage)?;

        let now = Utc::now();
        Ok(row
            .map(|row| pending_login_from_row(&row))
            .transpose()?
            .filter(|login| !login.is_expired(now)))
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let cutoff = timestamp(now);

        let codes = sqlx::query("DELETE FROM oauth_codes WHERE expires_at < ?")
            .bind(&cutoff)
            .execute(&self.db)
            .await
            .map_err(storage)?
            .rows_affected();

        let tokens = sqlx::query("DELETE FROM oauth_tokens WHERE refresh_expires_at < ?")
            .bind(&cutoff)
            .execute(&self.db)
            .await
            .map_err(storage)?
            .rows_affected();

        let pending_logins = sqlx::query("DELETE FROM oauth_pending_logins WHERE expires_at < ?")
            .bind(&cutoff)
            .execute(&self.db)
            .await
            .map_err(storage)?
            .rows_affected();

        Ok(SweepReport {
            codes,
            tokens,
            pending_logins,
        })
    }
}
