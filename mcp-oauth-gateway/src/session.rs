use std::collections::HashMap;
use tokio::sync::RwLock;

/// Maps a caller's bearer credential to the backend session it was assigned.
///
/// Kept in memory only; a restart forgets every binding and callers simply
/// initialize again.
#[derive(Debug, Default)]
pub struct SessionAffinity {
    bindings: RwLock<HashMap<String, String>>,
}

impl SessionAffinity {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, credential: &str) -> Option<String> {
        self.bindings.read().await.get(credential).cloned()
    }

    /// Bind `credential` to `session_id`, replacing any earlier binding
    pub async fn set(&self, credential: &str, session_id: &str) {
        self.bindings
            .write()
            .await
            .insert(credential.to_string(), session_id.to_string());
    }

    pub async fn len(&self) -> usize {
        self.bindings.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bindings.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_last_write_wins() {
        let affinity = SessionAffinity::new();
        assert!(affinity.get("tok").await.is_none());

        affinity.set("tok", "s1").await;
        affinity.set("tok", "s2").await;
        affinity.set("other", "s3").await;

        assert_eq!(affinity.get("tok").await.as_deref(), Some("s2"));
        assert_eq!(affinity.get("other").await.as_deref(), Some("s3"));
        assert_eq!(affinity.len().await, 2);
    }
}
