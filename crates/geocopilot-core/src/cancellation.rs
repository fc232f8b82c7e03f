use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Live cancellation tokens keyed by conversation or run id.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any token already registered under `key`.
    pub async fn create(&self, key: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .write()
            .await
            .insert(key.to_string(), token.clone());
        token
    }

    pub async fn get(&self, key: &str) -> Option<CancellationToken> {
        self.tokens.read().await.get(key).cloned()
    }

    pub async fn cancel(&self, key: &str) -> bool {
        match self.tokens.read().await.get(key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, key: &str) {
        self.tokens.write().await.remove(key);
    }
}
