//! Request and response bodies of the WeDrive API.

use serde::{Deserialize, Serialize};

use crate::ApiError;

/// Body of `wedrive/file_upload_init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadInitRequest {
    #[serde(rename = "spaceid")]
    pub space_id: String,
    #[serde(rename = "fatherid")]
    pub parent_id: String,
    pub file_name: String,
    pub size: u64,
    /// Per-block fingerprints, in block order.
    pub block_sha: Vec<String>,
    pub skip_push_card: bool,
}

/// Body of `wedrive/file_upload_part`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadPartRequest {
    pub upload_key: String,
    /// 1-based block index.
    pub index: u32,
    pub file_base64_content: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct UploadFinishRequest<'a> {
    pub upload_key: &'a str,
}

/// What the service answered to an initiate call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    /// Identical content is already stored; no parts are needed.
    Exists { file_id: String },
    /// A new session was opened.
    Session { upload_key: String },
}

/// Status fields carried by every response.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    #[serde(default)]
    pub errcode: i64,
    #[serde(default)]
    pub errmsg: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    pub access_token: String,
    pub expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct InitResponse {
    #[serde(default)]
    pub hit_exist: bool,
    #[serde(default)]
    pub upload_key: String,
    #[serde(default)]
    pub fileid: String,
}

impl InitResponse {
    pub fn into_outcome(self) -> Result<InitOutcome, ApiError> {
        if self.hit_exist {
            if self.fileid.is_empty() {
                return Err(ApiError::Malformed("hit_exist without fileid".into()));
            }
            return Ok(InitOutcome::Exists {
                file_id: self.fileid,
            });
        }
        if self.upload_key.is_empty() {
            return Err(ApiError::Malformed("missing upload_key".into()));
        }
        Ok(InitOutcome::Session {
            upload_key: self.upload_key,
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct FinishResponse {
    #[serde(default)]
    pub fileid: String,
}
