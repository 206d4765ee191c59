//! Block fingerprints for WeDrive uploads.
//!
//! The drive deduplicates uploads by comparing a per-block list of SHA-1
//! register states. Every block except the last contributes the running
//! state (five words, each little-endian) after its bytes were absorbed;
//! the last block contributes the ordinary SHA-1 digest of the whole file.

mod blocks;
mod state;

pub use blocks::{BlockHasher, BlockHashes};
pub use state::StateSha1;

/// Default block size: 2 MiB, the drive's fixed upload part size.
pub const DEFAULT_BLOCK_SIZE: usize = 2 * 1024 * 1024;

/// Errors produced by the block-hash crate.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("block size {0} is not a positive multiple of 64 bytes")]
    InvalidBlockSize(usize),
}
