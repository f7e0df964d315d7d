//! In-memory [`ArtifactStore`], suitable for single-process deployments and tests.

use crate::error::Result;
use crate::store::{
    ArtifactStore, AuthorizationCode, PendingLogin, RegisteredClient, SweepReport, TokenPair,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct TokenTable {
    by_access: HashMap<String, TokenPair>,
    access_by_refresh: HashMap<String, String>,
}

impl TokenTable {
    fn remove_access(&mut self, access_token: &str) -> Option<TokenPair> {
        let pair = self.by_access.remove(access_token)?;
        self.access_by_refresh.remove(&pair.refresh_token);
        Some(pair)
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    clients: Arc<RwLock<HashMap<String, RegisteredClient>>>,
    codes: Arc<RwLock<HashMap<String, AuthorizationCode>>>,
    tokens: Arc<RwLock<TokenTable>>,
    pending_logins: Arc<RwLock<HashMap<String, PendingLogin>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn register_client(&self, client: RegisteredClient) -> Result<()> {
        self.clients
            .write()
            .await
            .insert(client.client_id.clone(), client);
        Ok(())
    }

    async fn get_client(&self, client_id: &str) -> Result<Option<RegisteredClient>> {
        Ok(self.clients.read().await.get(client_id).cloned())
    }

    async fn put_code(&self, code: AuthorizationCode) -> Result<()> {
        self.codes.write().await.insert(code.code.clone(), code);
        Ok(())
    }

    async fn get_code(&self, code: &str) -> Result<Option<AuthorizationCode>> {
        let now = Utc::now();
        Ok(self
            .codes
            .read()
            .await
            .get(code)
            .filter(|c| !c.is_expired(now))
            .cloned())
    }

    async fn take_code(&self, code: &str) -> Result<Option<AuthorizationCode>> {
        let now = Utc::now();
        Ok(self
            .codes
            .write()
            .await
            .remove(code)
            .filter(|c| !c.is_expired(now)))
    }

    async fn delete_code(&self, code: &str) -> Result<()> {
        self.codes.write().await.remove(code);
        Ok(())
    }

    async fn put_token(&self, token: TokenPair) -> Result<()> {
        let mut table = self.tokens.write().await;
        table
            .access_by_refresh
            .insert(token.refresh_token.clone(), token.access_token.clone());
        table.by_access.insert(token.access_token.clone(), token);
        Ok(())
    }

    async fn get_token(&self, access_token: &str) -> Result<Option<TokenPair>> {
        let now = Utc::now();
        Ok(self
            .tokens
            .read()
            .await
            .by_access
            .get(access_token)
            .filter(|t| !t.is_access_expired(now))
            .cloned())
    }

    async fn take_token_by_refresh(&self, refresh_token: &str) -> Result<Option<TokenPair>> {
        let now = Utc::now();
        let mut table = self.tokens.write().await;
        let Some(access_token) = table.access_by_refresh.get(refresh_token).cloned() else {
            return Ok(None);
        };
        Ok(table
            .remove_access(&access_token)
            .filter(|t| !t.is_refresh_expired(now)))
    }

    async fn delete_token(&self, token: &str) -> Result<()> {
        let mut table = self.tokens.write().await;
        if table.remove_access(token).is_none() {
            if let Some(access_token) = table.access_by_refresh.get(token).cloned() {
                table.remove_access(&access_token);
            }
        }
        Ok(())
    }

    async fn put_pending_login(&self, login: PendingLogin) -> Result<()> {
        self.pending_logins
            .write()
            .await
            .insert(login.correlation.clone(), login);
        Ok(())
    }

    async fn take_pending_login(&self, correlation: &str) -> Result<Option<PendingLogin>> {
        let now = Utc::now();
        Ok(self
            .pending_logins
            .write()
            .await
            .remove(correlation)
            .filter(|l| !l.is_expired(now)))
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        {
            let mut codes = self.codes.write().await;
            let before = codes.len();
            codes.retain(|_, c| !c.is_expired(now));
            report.codes = (before - codes.len()) as u64;
        }

        {
            let mut table = self.tokens.write().await;
            let expired: Vec<String> = table
                .by_access
                .values()
                .filter(|t| t.is_refresh_expired(now))
                .map(|t| t.access_token.clone())
                .collect();
            for access_token in &expired {
                table.remove_access(access_token);
            }
            report.tokens = expired.len() as u64;
        }

        {
            let mut logins = self.pending_logins.write().await;
            let before = logins.len();
            logins.retain(|_, l| !l.is_expired(now));
            report.pending_logins = (before - logins.len()) as u64;
        }

        Ok(report)
    }
}
