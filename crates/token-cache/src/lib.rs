//! Shared access token with single-flight refresh.
//!
//! One [`TokenCache`] owns the credential for one identity. Callers ask for
//! a token; the cache hands back the current one while it has more than
//! [`SAFETY_MARGIN`] left and otherwise refreshes it through a
//! [`TokenSource`]. Concurrent callers that all find the token stale share
//! a single refresh call.

mod cache;
mod token;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub use cache::{RefreshObserver, TokenCache};
pub use token::Token;

/// Remaining lifetime below which a token is refreshed proactively.
pub const SAFETY_MARGIN: Duration = Duration::from_secs(600);

/// Lifetime assumed when the identity endpoint omits `expires_in`.
pub const DEFAULT_TTL: Duration = Duration::from_secs(7200);

/// Errors from a token refresh.
///
/// Cloneable so one failed refresh can be handed to every caller that
/// waited on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("identity endpoint unreachable: {0}")]
    Unavailable(String),

    #[error("identity endpoint rejected the credentials: {code} {message}")]
    Rejected { code: i64, message: String },

    #[error("malformed token response: {0}")]
    Malformed(String),
}

/// A freshly issued credential.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in: Duration,
}

/// Boxed future returned by [`TokenSource::fetch_token`].
pub type TokenFuture<'a> = Pin<Box<dyn Future<Output = Result<TokenGrant, TokenError>> + Send + 'a>>;

/// The remote identity endpoint.
///
/// Implemented by the HTTP client; tests substitute counting mocks.
pub trait TokenSource: Send + Sync {
    /// Requests a brand-new access token.
    fn fetch_token(&self) -> TokenFuture<'_>;
}
