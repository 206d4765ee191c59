//! Data types for the upload flow.

use wedrive_block_hash::DEFAULT_BLOCK_SIZE;

use crate::retry::RetryPolicy;

/// Where uploaded files land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub space_id: String,
    /// Folder id; the space id itself means the space root.
    pub parent_id: String,
}

impl UploadTarget {
    /// Targets the root folder of `space_id`.
    pub fn space_root(space_id: impl Into<String>) -> Self {
        let space_id = space_id.into();
        Self {
            parent_id: space_id.clone(),
            space_id,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = parent_id.into();
        self
    }
}

/// Tunables of an [`crate::UploadCoordinator`].
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub target: UploadTarget,
    /// Bytes per block. Positive multiple of 64.
    pub block_size: usize,
    /// Part uploads allowed in flight at once.
    pub max_concurrent_parts: usize,
    pub part_retry: RetryPolicy,
    /// Retry policy of Initiate and Finish.
    pub control_retry: RetryPolicy,
    pub skip_push_card: bool,
}

impl UploadConfig {
    pub fn new(target: UploadTarget) -> Self {
        Self {
            target,
            block_size: DEFAULT_BLOCK_SIZE,
            max_concurrent_parts: 3,
            part_retry: RetryPolicy::part(),
            control_retry: RetryPolicy::control(),
            skip_push_card: false,
        }
    }
}

/// Lifecycle of a single upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Hashing,
    Initiating,
    UploadingParts,
    Finishing,
    Done,
    Failed,
}

/// Progress event emitted during an upload.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    StateChanged { file: String, state: UploadState },
    /// Fingerprinting finished.
    Hashed {
        file: String,
        blocks: usize,
        bytes: u64,
    },
    PartUploaded {
        file: String,
        index: u32,
        completed: usize,
        total: usize,
    },
    Completed {
        file: String,
        file_id: String,
        deduplicated: bool,
    },
    Failed { file: String, error: String },
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub file_id: String,
    /// The service already had this content; no bytes were sent.
    pub deduplicated: bool,
    pub parts_uploaded: usize,
}
