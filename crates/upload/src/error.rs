//! Upload error types.

use std::fmt;
use std::path::PathBuf;

use wedrive_drive_client::ApiError;
use wedrive_token_cache::TokenError;

/// Protocol step an error happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initiate,
    /// Upload of the block with this 1-based index.
    Part(u32),
    Finish,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiate => f.write_str("initiate"),
            Self::Part(index) => write!(f, "part {index}"),
            Self::Finish => f.write_str("finish"),
        }
    }
}

/// Errors produced while uploading a file.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("{phase}: network error: {source}")]
    TransientNetwork { phase: Phase, source: ApiError },

    #[error("{phase}: access token rejected (errcode {code})")]
    AuthExpired { phase: Phase, code: i64 },

    #[error("{phase}: rejected by remote: {code} {message}")]
    RemoteRejected {
        phase: Phase,
        code: i64,
        message: String,
    },

    #[error("{phase}: unexpected response: {source}")]
    Protocol { phase: Phase, source: ApiError },

    #[error("I/O error on {}: {source}", path.display())]
    LocalIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{} is empty", .0.display())]
    EmptyFile(PathBuf),

    #[error("token refresh failed: {0}")]
    Token(#[from] TokenError),

    #[error("cancelled")]
    Cancelled,

    #[error("invalid block size {0}: must be a positive multiple of 64")]
    InvalidBlockSize(usize),

    #[error("upload task failed: {0}")]
    Task(String),
}

impl UploadError {
    /// Maps a failed API call onto the retry taxonomy.
    pub(crate) fn from_api(phase: Phase, err: ApiError) -> Self {
        if err.is_auth_failure() {
            let code = err.code().unwrap_or_default();
            return Self::AuthExpired { phase, code };
        }
        if err.is_transient() {
            return Self::TransientNetwork { phase, source: err };
        }
        match err {
            ApiError::Remote { code, message } => Self::RemoteRejected {
                phase,
                code,
                message,
            },
            ApiError::Status { status, body } => Self::RemoteRejected {
                phase,
                code: i64::from(status),
                message: body,
            },
            other => Self::Protocol {
                phase,
                source: other,
            },
        }
    }

    pub(crate) fn local_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::LocalIo {
            path: path.into(),
            source,
        }
    }

    /// Whether this failure may clear up on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork { .. } | Self::AuthExpired { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(code: i64) -> ApiError {
        ApiError::Remote {
            code,
            message: "msg".into(),
        }
    }

    #[test]
    fn phase_display() {
        assert_eq!(Phase::Initiate.to_string(), "initiate");
        assert_eq!(Phase::Part(7).to_string(), "part 7");
        assert_eq!(Phase::Finish.to_string(), "finish");
    }

    #[test]
    fn api_errors_map_onto_taxonomy() {
        assert!(matches!(
            UploadError::from_api(Phase::Initiate, remote(42001)),
            UploadError::AuthExpired {
                phase: Phase::Initiate,
                code: 42001
            }
        ));
        assert!(matches!(
            UploadError::from_api(Phase::Part(2), remote(-1)),
            UploadError::TransientNetwork {
                phase: Phase::Part(2),
                ..
            }
        ));
        assert!(matches!(
            UploadError::from_api(Phase::Finish, remote(44001)),
            UploadError::RemoteRejected { code: 44001, .. }
        ));
        assert!(matches!(
            UploadError::from_api(
                Phase::Finish,
                ApiError::Status {
                    status: 403,
                    body: "forbidden".into()
                }
            ),
            UploadError::RemoteRejected { code: 403, .. }
        ));
        assert!(matches!(
            UploadError::from_api(Phase::Initiate, ApiError::Malformed("x".into())),
            UploadError::Protocol { .. }
        ));
    }

    #[test]
    fn only_network_and_auth_are_retryable() {
        assert!(UploadError::from_api(Phase::Initiate, remote(-1)).is_retryable());
        assert!(UploadError::from_api(Phase::Initiate, remote(40014)).is_retryable());
        assert!(!UploadError::from_api(Phase::Initiate, remote(1)).is_retryable());
        assert!(!UploadError::Cancelled.is_retryable());
    }

    #[test]
    fn error_messages_name_the_phase() {
        let err = UploadError::from_api(Phase::Part(3), remote(44001));
        assert_eq!(err.to_string(), "part 3: rejected by remote: 44001 msg");
        let err = UploadError::EmptyFile("a/b.txt".into());
        assert_eq!(err.to_string(), "a/b.txt is empty");
    }
}
