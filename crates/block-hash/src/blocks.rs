use std::io::{ErrorKind, Read};
use std::path::Path;

use tracing::debug;

use crate::{DEFAULT_BLOCK_SIZE, HashError, StateSha1};

/// Ordered per-block fingerprint of a file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockHashes {
    /// One 40-character hex string per block, in file order.
    pub hashes: Vec<String>,
    /// Total number of bytes hashed.
    pub total_len: u64,
}

impl BlockHashes {
    /// Number of blocks (and upload parts) in the file.
    pub fn block_count(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

/// Splits a byte stream into fixed-size blocks and fingerprints each one.
///
/// One SHA-1 runs over the whole stream. Non-final blocks emit
/// [`StateSha1::state_hex`]; the final block emits the real digest.
#[derive(Debug, Clone, Copy)]
pub struct BlockHasher {
    block_size: usize,
}

impl Default for BlockHasher {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl BlockHasher {
    /// Creates a hasher for `block_size`-byte blocks.
    ///
    /// The size must be a positive multiple of 64 so block boundaries line
    /// up with SHA-1 compression boundaries.
    pub fn new(block_size: usize) -> Result<Self, HashError> {
        if block_size == 0 || block_size % 64 != 0 {
            return Err(HashError::InvalidBlockSize(block_size));
        }
        Ok(Self { block_size })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Fingerprints the file at `path`.
    pub fn hash_file(&self, path: &Path) -> Result<BlockHashes, HashError> {
        let file = std::fs::File::open(path)?;
        let result = self.hash_reader(file)?;
        debug!(
            path = %path.display(),
            blocks = result.block_count(),
            bytes = result.total_len,
            "block hashes computed"
        );
        Ok(result)
    }

    /// Fingerprints an in-memory buffer.
    pub fn hash_bytes(&self, data: &[u8]) -> BlockHashes {
        let mut sha = StateSha1::new();
        let total = data.len().div_ceil(self.block_size);
        let mut hashes = Vec::with_capacity(total);
        for (i, block) in data.chunks(self.block_size).enumerate() {
            sha.update(block);
            if i + 1 == total {
                hashes.push(sha.finalize_hex());
            } else {
                hashes.push(sha.state_hex());
            }
        }
        BlockHashes {
            hashes,
            total_len: sha.len(),
        }
    }

    /// Fingerprints an arbitrary stream.
    ///
    /// The stream length need not be known: one block of read-ahead tells
    /// whether the current block is the last.
    pub fn hash_reader<R: Read>(&self, mut reader: R) -> Result<BlockHashes, HashError> {
        let mut sha = StateSha1::new();
        let mut hashes = Vec::new();
        let mut current = vec![0u8; self.block_size];
        let mut next = vec![0u8; self.block_size];

        let mut current_len = read_full(&mut reader, &mut current)?;
        while current_len > 0 {
            sha.update(&current[..current_len]);

            let next_len = if current_len == self.block_size {
                read_full(&mut reader, &mut next)?
            } else {
                0
            };
            if next_len == 0 {
                hashes.push(sha.finalize_hex());
                break;
            }
            hashes.push(sha.state_hex());

            std::mem::swap(&mut current, &mut next);
            current_len = next_len;
        }

        Ok(BlockHashes {
            hashes,
            total_len: sha.len(),
        })
    }
}

/// Reads until `buf` is full or the stream ends. Returns the bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
