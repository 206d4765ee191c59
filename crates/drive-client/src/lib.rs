//! WeCom WeDrive upload API.
//!
//! [`DriveApi`] is the seam the upload engine talks to: three calls for the
//! chunked upload protocol. [`Client`] implements it over HTTPS with
//! `reqwest`, and also serves as the [`wedrive_token_cache::TokenSource`]
//! for the `gettoken` identity endpoint.

pub mod client;
pub mod types;

use std::future::Future;
use std::pin::Pin;

pub use client::Client;
pub use types::{InitOutcome, UploadInitRequest, UploadPartRequest};

/// `errcode` values meaning the access token is invalid or expired.
pub const AUTH_FAILURE_CODES: [i64; 3] = [40014, 42001, 41001];

/// `errcode` the platform returns when it is temporarily overloaded.
pub const SYSTEM_BUSY_CODE: i64 = -1;

/// Errors from the WeDrive API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("unexpected response: {0}")]
    Malformed(String),
}

impl ApiError {
    /// The platform `errcode`, when the failure came from the API itself.
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether a fresh access token might make the call succeed.
    pub fn is_auth_failure(&self) -> bool {
        self.code().is_some_and(|c| AUTH_FAILURE_CODES.contains(&c))
    }

    /// Whether the same call may succeed if simply repeated later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::Remote { code, .. } => *code == SYSTEM_BUSY_CODE,
            Self::Json(_) | Self::Malformed(_) => false,
        }
    }
}

/// Boxed future returned by [`DriveApi`] calls.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// The chunked upload protocol: initiate, upload parts, finish.
///
/// Every call takes the current access token explicitly; token lifecycle
/// belongs to the caller.
pub trait DriveApi: Send + Sync {
    /// Opens an upload session, or reports that the content already exists.
    fn upload_init<'a>(
        &'a self,
        access_token: &'a str,
        request: &'a UploadInitRequest,
    ) -> ApiFuture<'a, InitOutcome>;

    /// Uploads one block of an open session.
    fn upload_part<'a>(
        &'a self,
        access_token: &'a str,
        request: &'a UploadPartRequest,
    ) -> ApiFuture<'a, ()>;

    /// Closes the session and returns the new file id.
    fn upload_finish<'a>(&'a self, access_token: &'a str, upload_key: &'a str)
    -> ApiFuture<'a, String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(code: i64) -> ApiError {
        ApiError::Remote {
            code,
            message: String::new(),
        }
    }

    #[test]
    fn auth_failure_codes_are_recognized() {
        for code in AUTH_FAILURE_CODES {
            assert!(remote(code).is_auth_failure(), "{code}");
            assert!(!remote(code).is_transient(), "{code}");
        }
        assert!(!remote(44001).is_auth_failure());
        assert!(!ApiError::Malformed("x".into()).is_auth_failure());
    }

    #[test]
    fn transient_classification() {
        assert!(remote(SYSTEM_BUSY_CODE).is_transient());
        assert!(!remote(44001).is_transient());
        assert!(
            ApiError::Status {
                status: 502,
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            !ApiError::Status {
                status: 404,
                body: String::new()
            }
            .is_transient()
        );
        assert!(!ApiError::Malformed("no key".into()).is_transient());
    }

    #[test]
    fn code_only_for_remote_errors() {
        assert_eq!(remote(42001).code(), Some(42001));
        assert_eq!(ApiError::Malformed("x".into()).code(), None);
    }
}
