//! Upload coordinator: drives one file through hash, initiate, parts and
//! finish, emitting progress events and honoring cancellation.

use std::io::{Error as IoError, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wedrive_block_hash::{BlockHasher, BlockHashes, HashError};
use wedrive_drive_client::{DriveApi, InitOutcome, UploadInitRequest, UploadPartRequest};
use wedrive_token_cache::{Token, TokenCache};

use crate::error::{Phase, UploadError};
use crate::retry::{RetryPolicy, cancellable, with_retry};
use crate::types::{UploadConfig, UploadEvent, UploadOutcome, UploadState};

/// Uploads files to one WeDrive target.
pub struct UploadCoordinator {
    api: Arc<dyn DriveApi>,
    tokens: Arc<TokenCache>,
    config: UploadConfig,
    hasher: BlockHasher,
    events_tx: mpsc::Sender<UploadEvent>,
    events_rx: Option<mpsc::Receiver<UploadEvent>>,
    cancel: CancellationToken,
}

impl UploadCoordinator {
    /// Creates a coordinator. Fails if the configured block size is unusable.
    pub fn new(
        api: Arc<dyn DriveApi>,
        tokens: Arc<TokenCache>,
        config: UploadConfig,
    ) -> Result<Self, UploadError> {
        let hasher = BlockHasher::new(config.block_size)
            .map_err(|_| UploadError::InvalidBlockSize(config.block_size))?;
        let (events_tx, events_rx) = mpsc::channel(256);
        Ok(Self {
            api,
            tokens,
            config,
            hasher,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        })
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.events_rx.take()
    }

    /// Returns the token that [`Self::upload`] observes.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Uploads the file at `path`, cancellable through [`Self::cancel_token`].
    pub async fn upload(&self, path: &Path) -> Result<UploadOutcome, UploadError> {
        self.upload_with_cancel(path, self.cancel.clone()).await
    }

    /// Uploads the file at `path`, stopping at the next suspension point once
    /// `cancel` fires.
    pub async fn upload_with_cancel(
        &self,
        path: &Path,
        cancel: CancellationToken,
    ) -> Result<UploadOutcome, UploadError> {
        let file = path.display().to_string();
        let result = self.run(path, &file, &cancel).await;

        match &result {
            Ok(outcome) => {
                self.set_state(&file, UploadState::Done);
                self.emit(UploadEvent::Completed {
                    file: file.clone(),
                    file_id: outcome.file_id.clone(),
                    deduplicated: outcome.deduplicated,
                });
                info!(
                    file = %file,
                    file_id = %outcome.file_id,
                    deduplicated = outcome.deduplicated,
                    parts = outcome.parts_uploaded,
                    "upload completed"
                );
            }
            Err(e) => {
                self.set_state(&file, UploadState::Failed);
                self.emit(UploadEvent::Failed {
                    file: file.clone(),
                    error: e.to_string(),
                });
                if matches!(e, UploadError::Cancelled) {
                    warn!(file = %file, "upload cancelled");
                } else {
                    error!(file = %file, error = %e, "upload failed");
                }
            }
        }
        result
    }

    async fn run(
        &self,
        path: &Path,
        file: &str,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                UploadError::local_io(
                    path,
                    IoError::new(ErrorKind::InvalidInput, "path has no file name"),
                )
            })?;

        self.set_state(file, UploadState::Hashing);
        let hashes = self.hash(path, cancel).await?;
        if hashes.is_empty() {
            return Err(UploadError::EmptyFile(path.to_path_buf()));
        }
        let block_count = hashes.block_count();
        self.emit(UploadEvent::Hashed {
            file: file.to_string(),
            blocks: block_count,
            bytes: hashes.total_len,
        });

        self.set_state(file, UploadState::Initiating);
        let request = UploadInitRequest {
            space_id: self.config.target.space_id.clone(),
            parent_id: self.config.target.parent_id.clone(),
            file_name,
            size: hashes.total_len,
            block_sha: hashes.hashes,
            skip_push_card: self.config.skip_push_card,
        };
        let drive = self.api.as_ref();
        let init = &request;
        let outcome = with_retry(
            &self.config.control_retry,
            Phase::Initiate,
            &self.tokens,
            cancel,
            move |token: Token| async move { drive.upload_init(token.value(), init).await },
        )
        .await?;

        let upload_key = match outcome {
            InitOutcome::Exists { file_id } => {
                info!(file = %file, "content already stored, skipping transfer");
                return Ok(UploadOutcome {
                    file_id,
                    deduplicated: true,
                    parts_uploaded: 0,
                });
            }
            InitOutcome::Session { upload_key } => upload_key,
        };
        debug!(
            file = %file,
            upload_key = %short_key(&upload_key),
            blocks = block_count,
            "upload session opened"
        );

        self.set_state(file, UploadState::UploadingParts);
        let parts_uploaded = self
            .upload_parts(path, file, &upload_key, block_count, cancel)
            .await?;

        self.set_state(file, UploadState::Finishing);
        let key = upload_key.as_str();
        let file_id = with_retry(
            &self.config.control_retry,
            Phase::Finish,
            &self.tokens,
            cancel,
            move |token: Token| async move { drive.upload_finish(token.value(), key).await },
        )
        .await?;

        Ok(UploadOutcome {
            file_id,
            deduplicated: false,
            parts_uploaded,
        })
    }

    /// Fingerprints the file on the blocking pool.
    async fn hash(&self, path: &Path, cancel: &CancellationToken) -> Result<BlockHashes, UploadError> {
        let hasher = self.hasher;
        let owned = path.to_path_buf();
        let task = tokio::task::spawn_blocking(move || hasher.hash_file(&owned));

        match cancellable(cancel, task).await? {
            Ok(Ok(hashes)) => Ok(hashes),
            Ok(Err(HashError::Io(e))) => Err(UploadError::local_io(path, e)),
            Ok(Err(HashError::InvalidBlockSize(size))) => Err(UploadError::InvalidBlockSize(size)),
            Err(e) => Err(UploadError::Task(e.to_string())),
        }
    }

    /// Streams the blocks of `path` through at most `max_concurrent_parts`
    /// upload tasks. Returns the number of parts uploaded.
    ///
    /// The next block is read only once a slot is free. After the first
    /// failure no further block is read; tasks already running are awaited.
    async fn upload_parts(
        &self,
        path: &Path,
        file: &str,
        upload_key: &str,
        total: usize,
        cancel: &CancellationToken,
    ) -> Result<usize, UploadError> {
        let mut source = tokio::fs::File::open(path)
            .await
            .map_err(|e| UploadError::local_io(path, e))?;
        let upload_key: Arc<str> = Arc::from(upload_key);
        let capacity = self.config.max_concurrent_parts.max(1);
        let mut tasks = JoinSet::new();
        let mut progress = PartProgress {
            completed: 0,
            total,
            failure: None,
        };

        for index in 1..=total {
            while let Some(joined) = tasks.try_join_next() {
                self.record(file, &mut progress, joined);
            }
            while progress.failure.is_none() && tasks.len() >= capacity {
                if let Some(joined) = tasks.join_next().await {
                    self.record(file, &mut progress, joined);
                }
            }
            if progress.failure.is_some() {
                break;
            }

            let read = cancellable(cancel, read_block(&mut source, self.hasher.block_size())).await;
            let block = match read {
                Ok(Ok(block)) if !block.is_empty() => block,
                Ok(Ok(_)) => {
                    let eof = IoError::new(ErrorKind::UnexpectedEof, "file shrank during upload");
                    progress.fail(UploadError::local_io(path, eof));
                    break;
                }
                Ok(Err(e)) => {
                    progress.fail(UploadError::local_io(path, e));
                    break;
                }
                Err(e) => {
                    progress.fail(e);
                    break;
                }
            };

            tasks.spawn(upload_part(PartJob {
                api: Arc::clone(&self.api),
                tokens: Arc::clone(&self.tokens),
                policy: self.config.part_retry,
                cancel: cancel.clone(),
                upload_key: Arc::clone(&upload_key),
                index: index as u32,
                block,
            }));
        }

        while let Some(joined) = tasks.join_next().await {
            self.record(file, &mut progress, joined);
        }

        match progress.failure {
            Some(e) => Err(e),
            None => Ok(progress.completed),
        }
    }

    fn record(
        &self,
        file: &str,
        progress: &mut PartProgress,
        joined: Result<Result<u32, UploadError>, JoinError>,
    ) {
        match joined {
            Ok(Ok(index)) => {
                progress.completed += 1;
                debug!(file = %file, index, completed = progress.completed, total = progress.total, "part uploaded");
                self.emit(UploadEvent::PartUploaded {
                    file: file.to_string(),
                    index,
                    completed: progress.completed,
                    total: progress.total,
                });
            }
            Ok(Err(e)) => progress.fail(e),
            Err(e) => progress.fail(UploadError::Task(e.to_string())),
        }
    }

    fn set_state(&self, file: &str, state: UploadState) {
        debug!(file = %file, ?state, "upload state");
        self.emit(UploadEvent::StateChanged {
            file: file.to_string(),
            state,
        });
    }

    fn emit(&self, event: UploadEvent) {
        let _ = self.events_tx.try_send(event);
    }
}

struct PartProgress {
    completed: usize,
    total: usize,
    /// First failure seen; later ones are dropped.
    failure: Option<UploadError>,
}

impl PartProgress {
    fn fail(&mut self, err: UploadError) {
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }
}

struct PartJob {
    api: Arc<dyn DriveApi>,
    tokens: Arc<TokenCache>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    upload_key: Arc<str>,
    index: u32,
    block: Vec<u8>,
}

async fn upload_part(job: PartJob) -> Result<u32, UploadError> {
    let PartJob {
        api,
        tokens,
        policy,
        cancel,
        upload_key,
        index,
        block,
    } = job;

    let request = UploadPartRequest {
        upload_key: upload_key.to_string(),
        index,
        file_base64_content: STANDARD.encode(&block),
    };
    drop(block);

    let drive = api.as_ref();
    let part = &request;
    with_retry(&policy, Phase::Part(index), &tokens, &cancel, move |token: Token| async move {
        drive.upload_part(token.value(), part).await
    })
    .await?;
    Ok(index)
}

/// Reads up to `size` bytes. Shorter only at end of file.
async fn read_block(file: &mut tokio::fs::File, size: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Upload keys are bearer-like; only a prefix goes to the logs.
fn short_key(key: &str) -> String {
    let prefix: String = key.chars().take(8).collect();
    if prefix.len() < key.len() {
        format!("{prefix}...")
    } else {
        prefix
    }
}
