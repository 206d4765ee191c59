//! Chunked, content-addressed WeDrive upload engine.
//!
//! # Pipeline
//!
//! 1. **Hash**: fingerprint the file block by block on the blocking pool
//! 2. **Initiate**: offer the fingerprints; identical content short-circuits
//! 3. **Parts**: upload blocks under a bounded number of concurrent tasks
//! 4. **Finish**: close the session and obtain the file id
//!
//! Every network call goes through [`wedrive_drive_client::DriveApi`] with a
//! token from a shared [`wedrive_token_cache::TokenCache`].

pub mod coordinator;
pub mod error;
pub mod retry;
pub mod sweep;
pub mod types;

pub use coordinator::UploadCoordinator;
pub use error::{Phase, UploadError};
pub use retry::{Backoff, RetryPolicy};
pub use sweep::{SweepReport, sweep_directory};
pub use types::{UploadConfig, UploadEvent, UploadOutcome, UploadState, UploadTarget};
pub use wedrive_block_hash::DEFAULT_BLOCK_SIZE;
