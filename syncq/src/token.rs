//! Access token caching with single-flight refresh.
//!
//! All workers share one [`TokenManager`]. The cached [`Token`] is replaced wholesale when it is
//! about to expire, and however many workers ask for a token while it is being refreshed, only one
//! request reaches the [`TokenProvider`].
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tokio::sync::Mutex;

/// An access credential for the remote API.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    value: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    pub fn new(value: impl Into<String>, issued_at: DateTime<Utc>, lifetime: TimeDelta) -> Self {
        Self {
            value: value.into(),
            issued_at,
            expires_at: issued_at
                .checked_add_signed(lifetime)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Whether the token can still be handed out, leaving `margin` before it expires.
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: TimeDelta) -> bool {
        self.expires_at
            .checked_sub_signed(margin)
            .is_some_and(|refresh_at| now < refresh_at)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Client credentials presented to the token provider.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("Credentials rejected by the token provider: {0}")]
    Rejected(String),
    #[error("Token provider unavailable: {0}")]
    Unavailable(String),
}

/// Issues access tokens for the remote API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Requests a new token, returning its opaque value.
    async fn refresh(&self, credentials: &Credentials) -> Result<String, CredentialError>;
}

struct RefreshOutcome {
    error: Option<CredentialError>,
}

/// Caches the shared access token and refreshes it on demand.
pub struct TokenManager {
    provider: Arc<dyn TokenProvider>,
    credentials: Credentials,
    lifetime: TimeDelta,
    safety_margin: TimeDelta,
    cached: RwLock<Option<Arc<Token>>>,
    refresh: Mutex<RefreshOutcome>,
    generation: AtomicU64,
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("credentials", &self.credentials)
            .field("lifetime", &self.lifetime)
            .field("safety_margin", &self.safety_margin)
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    pub fn new(
        provider: Arc<dyn TokenProvider>,
        credentials: Credentials,
        lifetime: TimeDelta,
        safety_margin: TimeDelta,
    ) -> Self {
        Self {
            provider,
            credentials,
            lifetime,
            safety_margin,
            cached: RwLock::new(None),
            refresh: Mutex::new(RefreshOutcome { error: None }),
            generation: AtomicU64::new(0),
        }
    }

    /// Returns the cached token, refreshing it first if it is missing or about to expire.
    pub async fn get_token(&self) -> Result<Arc<Token>, CredentialError> {
        self.get_token_at(Utc::now()).await
    }

    pub(crate) async fn get_token_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Arc<Token>, CredentialError> {
        let observed = self.generation.load(Ordering::Acquire);
        if let Some(token) = self.fresh_token(now) {
            return Ok(token);
        }

        let mut outcome = self.refresh.lock().await;

        // A refresh finished while we were waiting: share its outcome.
        if self.generation.load(Ordering::Acquire) != observed {
            if let Some(error) = &outcome.error {
                return Err(error.clone());
            }
            if let Some(token) = self.cached_token() {
                return Ok(token);
            }
        }
        if let Some(token) = self.fresh_token(now) {
            return Ok(token);
        }

        tracing::debug!("Refreshing access token");
        let result = self.provider.refresh(&self.credentials).await;
        let result = match result {
            Ok(value) => {
                let token = Arc::new(Token::new(value, now, self.lifetime));
                self.store(Some(token.clone()));
                outcome.error = None;
                tracing::info!(expires_at = %token.expires_at, "Obtained new access token");
                Ok(token)
            }
            Err(error) => {
                tracing::warn!(?error, "Failed to refresh access token: {error}");
                outcome.error = Some(error.clone());
                Err(error)
            }
        };
        self.generation.fetch_add(1, Ordering::Release);
        result
    }

    /// Drops `token` from the cache if it is still the cached one, so the next caller refreshes.
    ///
    /// Used when the remote API rejected a token before its expiry.
    pub fn invalidate(&self, token: &Token) {
        if let Ok(mut cached) = self.cached.write() {
            if cached.as_deref() == Some(token) {
                tracing::debug!("Invalidating rejected access token");
                *cached = None;
            }
        }
    }

    fn cached_token(&self) -> Option<Arc<Token>> {
        self.cached.read().ok().and_then(|cached| cached.clone())
    }

    fn fresh_token(&self, now: DateTime<Utc>) -> Option<Arc<Token>> {
        self.cached_token()
            .filter(|token| token.is_fresh(now, self.safety_margin))
    }

    fn store(&self, token: Option<Arc<Token>>) {
        if let Ok(mut cached) = self.cached.write() {
            *cached = token;
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use futures::future::join_all;

    use crate::testing::StaticTokenProvider;

    use super::*;

    fn credentials() -> Credentials {
        Credentials {
            client_id: "syncqd".to_owned(),
            client_secret: "hunter2".to_owned(),
        }
    }

    fn manager(provider: impl TokenProvider + 'static) -> TokenManager {
        TokenManager::new(
            Arc::new(provider),
            credentials(),
            TimeDelta::seconds(3600),
            TimeDelta::seconds(60),
        )
    }

    #[test]
    fn secrets_are_redacted() {
        let token = Token::new("secret-token", Utc::now(), TimeDelta::hours(1));

        assert!(!format!("{token:?}").contains("secret-token"));
        assert!(!format!("{:?}", credentials()).contains("hunter2"));
    }

    #[test]
    fn freshness_respects_margin() {
        let now = Utc::now();
        let token = Token::new("t", now, TimeDelta::seconds(3600));

        assert!(token.is_fresh(now, TimeDelta::seconds(60)));
        assert!(token.is_fresh(now + TimeDelta::seconds(3539), TimeDelta::seconds(60)));
        assert!(!token.is_fresh(now + TimeDelta::seconds(3540), TimeDelta::seconds(60)));
    }

    #[test]
    fn huge_lifetime_saturates() {
        let now = Utc::now();
        let token = Token::new("t", now, TimeDelta::MAX);

        assert_eq!(token.expires_at, DateTime::<Utc>::MAX_UTC);
        assert!(token.is_fresh(now, TimeDelta::seconds(60)));
        assert!(!token.is_fresh(now, TimeDelta::MAX));
    }

    #[tokio::test]
    async fn cached_token_is_reused() {
        let mut provider = MockTokenProvider::new();
        provider
            .expect_refresh()
            .times(1)
            .returning(|_| Ok("token-1".to_owned()));
        let manager = manager(provider);
        let now = Utc::now();

        let first = manager.get_token_at(now).await.unwrap();
        let second = manager
            .get_token_at(now + TimeDelta::seconds(600))
            .await
            .unwrap();

        assert_eq!(first.value(), "token-1");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn expiring_token_is_replaced() {
        let mut provider = MockTokenProvider::new();
        let mut seq = mockall::Sequence::new();
        provider
            .expect_refresh()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok("token-1".to_owned()));
        provider
            .expect_refresh()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok("token-2".to_owned()));
        let manager = manager(provider);
        let now = Utc::now();

        manager.get_token_at(now).await.unwrap();
        let later = now + TimeDelta::seconds(3550);
        let token = manager.get_token_at(later).await.unwrap();

        assert_eq!(token.value(), "token-2");
        assert_eq!(token.issued_at, later);
        assert_eq!(token.expires_at, later + TimeDelta::seconds(3600));
    }

    #[tokio::test]
    async fn refresh_failure_is_propagated() {
        let mut provider = MockTokenProvider::new();
        provider
            .expect_refresh()
            .times(1)
            .returning(|_| Err(CredentialError::Rejected("invalid_client".to_owned())));
        let manager = manager(provider);

        assert_matches!(
            manager.get_token().await,
            Err(CredentialError::Rejected(reason)) if reason == "invalid_client"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_refresh() {
        let mut provider = MockTokenProvider::new();
        provider
            .expect_refresh()
            .times(1)
            .returning(|_| Ok("token-1".to_owned()));
        let manager = Arc::new(manager(provider));

        let tokens = join_all((0..16).map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_token().await })
        }))
        .await;

        for token in tokens {
            assert_eq!(token.unwrap().unwrap().value(), "token-1");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_refresh_is_single_flight() {
        let provider = Arc::new(
            StaticTokenProvider::new("token-1").with_delay(Duration::from_millis(500)),
        );
        let manager = Arc::new(TokenManager::new(
            provider.clone(),
            credentials(),
            TimeDelta::seconds(3600),
            TimeDelta::seconds(60),
        ));

        let results = join_all((0..8).map(|_| manager.get_token())).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(provider.refreshes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_callers_share_a_failed_refresh() {
        let provider = Arc::new(
            StaticTokenProvider::failing(CredentialError::Unavailable("timeout".to_owned()))
                .with_delay(Duration::from_millis(500)),
        );
        let manager = TokenManager::new(
            provider.clone(),
            credentials(),
            TimeDelta::seconds(3600),
            TimeDelta::seconds(60),
        );

        let results = join_all((0..8).map(|_| manager.get_token())).await;

        assert!(results
            .iter()
            .all(|result| matches!(result, Err(CredentialError::Unavailable(_)))));
        assert_eq!(provider.refreshes(), 1);

        // Later callers try again.
        assert!(manager.get_token().await.is_err());
        assert_eq!(provider.refreshes(), 2);
    }

    #[tokio::test]
    async fn invalidate_only_drops_matching_token() {
        let provider = Arc::new(StaticTokenProvider::new("token-1"));
        let manager = TokenManager::new(
            provider.clone(),
            credentials(),
            TimeDelta::seconds(3600),
            TimeDelta::seconds(60),
        );

        let token = manager.get_token().await.unwrap();
        manager.invalidate(&Token::new("other", Utc::now(), TimeDelta::hours(1)));
        manager.get_token().await.unwrap();
        assert_eq!(provider.refreshes(), 1);

        manager.invalidate(&token);
        manager.get_token().await.unwrap();
        assert_eq!(provider.refreshes(), 2);
    }
}
