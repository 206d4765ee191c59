use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

/// A bearer credential and its absolute expiry.
///
/// `expires_at == None` marks a pre-seeded credential whose lifetime is
/// unknown; it counts as fresh until a caller forces a refresh.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    value: String,
    expires_at: Option<Instant>,
}

impl Token {
    pub fn new(value: impl Into<String>, expires_at: Instant) -> Self {
        Self {
            value: value.into(),
            expires_at: Some(expires_at),
        }
    }

    /// A credential with unknown expiry (debug/testing seed).
    pub fn unbounded(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expires_at: None,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// Lifetime left at `now`, or `None` when unknown.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }

    /// Whether more than `margin` of lifetime is left at `now`.
    pub fn is_fresh(&self, now: Instant, margin: Duration) -> bool {
        match self.expires_at {
            Some(at) => now + margin < at,
            None => true,
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown: String = self.value.chars().take(6).collect();
        f.debug_struct("Token")
            .field("value", &format_args!("{shown}…"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
