use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::RwLock;

/// Source of the bearer token injected into every backend call.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn bearer_token(&self) -> Option<SecretString>;

    /// Forget the stored credential (session expired or user signed out).
    async fn clear(&self);
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    token: RwLock<Option<SecretString>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(SecretString::new(token.into()))),
        }
    }

    pub async fn set_token(&self, token: impl Into<String>) {
        *self.token.write().await = Some(SecretString::new(token.into()));
    }

    pub async fn has_token(&self) -> bool {
        self.token.read().await.is_some()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn bearer_token(&self) -> Option<SecretString> {
        self.token
            .read()
            .await
            .as_ref()
            .map(|t| SecretString::new(t.expose_secret().clone()))
    }

    async fn clear(&self) {
        *self.token.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_lifecycle() {
        let store = MemoryCredentialStore::new();
        assert!(store.bearer_token().await.is_none());

        store.set_token("abc").await;
        let token = store.bearer_token().await.unwrap();
        assert_eq!(token.expose_secret(), "abc");

        store.clear().await;
        assert!(!store.has_token().await);
    }

    #[tokio::test]
    async fn test_token_debug_is_redacted() {
        let store = MemoryCredentialStore::with_token("super_secret");
        let token = store.bearer_token().await.unwrap();
        assert!(!format!("{token:?}").contains("super_secret"));
    }
}
