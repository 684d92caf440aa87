use std::{
    future::Future,
    sync::{Arc, RwLock},
    time::{Duration, SystemTime},
};

use thiserror::Error;

use crate::error::{ClientError, ErrorCategory};

/// Bearer token with its absolute expiry.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: SystemTime,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_at: SystemTime) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    pub fn expiring_in(token: impl Into<String>, lifetime: Duration) -> Self {
        Self::new(token, SystemTime::now() + lifetime)
    }

    /// `expires_at - grace`, saturating at the epoch.
    pub fn refresh_due(&self, grace: Duration) -> SystemTime {
        self.expires_at
            .checked_sub(grace)
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("no token available")]
    NotFound,
    #[error("credential provider unavailable: {0}")]
    Unavailable(String),
    #[error("credential provider failure: {0}")]
    Backend(String),
}

impl From<CredentialError> for ClientError {
    fn from(err: CredentialError) -> Self {
        let code = match err {
            CredentialError::NotFound => "token_not_found",
            CredentialError::Unavailable(_) => "credentials_unavailable",
            CredentialError::Backend(_) => "credentials_failed",
        };
        ClientError::new(ErrorCategory::Auth, code, err.to_string())
    }
}

/// Supplies fresh access tokens.
pub trait CredentialProvider: Send + Sync + 'static {
    fn fetch_token(&self) -> impl Future<Output = Result<AccessToken, CredentialError>> + Send;
}

/// Provider backed by a token set from the outside.
#[derive(Clone, Default)]
pub struct InMemoryCredentials {
    current: Arc<RwLock<Option<AccessToken>>>,
}

impl InMemoryCredentials {
    pub fn new(token: AccessToken) -> Self {
        Self {
            current: Arc::new(RwLock::new(Some(token))),
        }
    }

    pub fn set(&self, token: AccessToken) -> Result<(), CredentialError> {
        let mut current = self
            .current
            .write()
            .map_err(|_| CredentialError::Backend("poisoned lock".to_owned()))?;
        *current = Some(token);
        Ok(())
    }

    pub fn clear(&self) -> Result<(), CredentialError> {
        let mut current = self
            .current
            .write()
            .map_err(|_| CredentialError::Backend("poisoned lock".to_owned()))?;
        current.take();
        Ok(())
    }

    fn current(&self) -> Result<AccessToken, CredentialError> {
        let current = self
            .current
            .read()
            .map_err(|_| CredentialError::Backend("poisoned lock".to_owned()))?;
        current.clone().ok_or(CredentialError::NotFound)
    }
}

impl CredentialProvider for InMemoryCredentials {
    async fn fetch_token(&self) -> Result<AccessToken, CredentialError> {
        self.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingProvider;

    impl CredentialProvider for FailingProvider {
        async fn fetch_token(&self) -> Result<AccessToken, CredentialError> {
            Err(CredentialError::Unavailable("idp down".into()))
        }
    }

    #[tokio::test]
    async fn in_memory_credentials_return_latest_token() {
        let credentials = InMemoryCredentials::default();
        assert_eq!(
            credentials.fetch_token().await,
            Err(CredentialError::NotFound)
        );

        let token = AccessToken::expiring_in("abc", Duration::from_secs(60));
        credentials.set(token.clone()).expect("set should work");
        assert_eq!(credentials.fetch_token().await, Ok(token));

        credentials.clear().expect("clear should work");
        assert_eq!(
            credentials.fetch_token().await,
            Err(CredentialError::NotFound)
        );
    }

    #[tokio::test]
    async fn provider_failures_map_to_auth_errors() {
        let err: ClientError = FailingProvider
            .fetch_token()
            .await
            .expect_err("provider is down")
            .into();
        assert_eq!(err.category, ErrorCategory::Auth);
        assert_eq!(err.code, "credentials_unavailable");
    }

    #[test]
    fn computes_refresh_due_with_grace() {
        let expires_at = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let token = AccessToken::new("abc", expires_at);
        assert_eq!(
            token.refresh_due(Duration::from_secs(30)),
            SystemTime::UNIX_EPOCH + Duration::from_secs(970)
        );
        assert!(token.is_expired(expires_at));
        assert!(!format!("{token:?}").contains("abc"));
    }
}
