use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{SAFETY_MARGIN, Token, TokenError, TokenSource};

/// Callback invoked with every newly refreshed token.
pub type RefreshObserver = Box<dyn Fn(&Token) + Send + Sync>;

struct CacheState {
    token: Option<Token>,
    /// Completed refresh attempts, successful or not.
    attempts: u64,
    /// Failure of the latest attempt, cleared by the next success.
    last_failure: Option<TokenError>,
}

/// Holds the access token for one identity.
///
/// Reads of a fresh token never wait. Refreshes are serialized by an async
/// gate; a caller that waited on the gate first checks whether another
/// caller already finished an attempt and, if so, returns that attempt's
/// result instead of calling the endpoint again.
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    margin: Duration,
    state: Mutex<CacheState>,
    refresh_gate: tokio::sync::Mutex<()>,
    observer: Option<RefreshObserver>,
}

impl TokenCache {
    /// Creates an empty cache that refreshes through `source`.
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            margin: SAFETY_MARGIN,
            state: Mutex::new(CacheState {
                token: None,
                attempts: 0,
                last_failure: None,
            }),
            refresh_gate: tokio::sync::Mutex::new(()),
            observer: None,
        }
    }

    /// Pre-seeds a credential of unknown lifetime.
    pub fn with_seed(self, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            debug!("using pre-seeded access token");
            self.lock_state().token = Some(Token::unbounded(value));
        }
        self
    }

    /// Overrides the default ten-minute safety margin.
    pub fn with_safety_margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }

    /// Registers a callback run after each successful refresh.
    pub fn on_refresh(mut self, observer: RefreshObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Returns the cached token without checking its freshness.
    pub fn peek(&self) -> Option<Token> {
        self.lock_state().token.clone()
    }

    /// Number of refresh attempts made so far.
    pub fn refresh_attempts(&self) -> u64 {
        self.lock_state().attempts
    }

    /// Returns a usable token, refreshing it when stale or when forced.
    pub async fn get(&self, force_refresh: bool) -> Result<Token, TokenError> {
        let observed = {
            let state = self.lock_state();
            if !force_refresh
                && let Some(token) = state.token.as_ref()
                && token.is_fresh(Instant::now(), self.margin)
            {
                return Ok(token.clone());
            }
            state.attempts
        };

        self.refresh_once(observed, |token| {
            !force_refresh && token.is_fresh(Instant::now(), self.margin)
        })
        .await
    }

    /// Returns a replacement for a token the remote side refused.
    ///
    /// When the cache already holds a different fresh token, that token is
    /// returned without contacting the endpoint; otherwise one refresh runs,
    /// shared with every caller that was refused the same token.
    pub async fn get_after_rejection(&self, rejected: &Token) -> Result<Token, TokenError> {
        let replaces = |token: &Token| {
            token.value() != rejected.value() && token.is_fresh(Instant::now(), self.margin)
        };
        let observed = {
            let state = self.lock_state();
            if let Some(token) = state.token.as_ref()
                && replaces(token)
            {
                return Ok(token.clone());
            }
            state.attempts
        };

        self.refresh_once(observed, replaces).await
    }

    /// Takes the refresh gate and refreshes unless another caller finished an
    /// attempt since `observed`, or the cached token satisfies `usable`.
    async fn refresh_once<F>(&self, observed: u64, usable: F) -> Result<Token, TokenError>
    where
        F: Fn(&Token) -> bool,
    {
        let _gate = self.refresh_gate.lock().await;

        {
            let state = self.lock_state();
            if state.attempts != observed {
                debug!("token refresh already completed by another caller");
                return match &state.last_failure {
                    Some(err) => Err(err.clone()),
                    None => state
                        .token
                        .clone()
                        .ok_or_else(|| TokenError::Malformed("refresh left no token".into())),
                };
            }
            if let Some(token) = state.token.as_ref()
                && usable(token)
            {
                return Ok(token.clone());
            }
        }

        self.refresh().await
    }

    /// Calls the identity endpoint. Must run with the refresh gate held.
    async fn refresh(&self) -> Result<Token, TokenError> {
        let requested_at = Instant::now();
        info!("refreshing access token");
        let result = self.source.fetch_token().await;

        let mut state = self.lock_state();
        state.attempts += 1;
        match result {
            Ok(grant) => {
                let token = Token::new(grant.access_token, requested_at + grant.expires_in);
                state.token = Some(token.clone());
                state.last_failure = None;
                drop(state);

                info!(expires_in_secs = grant.expires_in.as_secs(), "access token refreshed");
                if let Some(observer) = &self.observer {
                    observer(&token);
                }
                Ok(token)
            }
            Err(err) => {
                warn!(error = %err, "access token refresh failed");
                state.last_failure = Some(err.clone());
                Err(err)
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
