//! Upload placeholders and the lifecycle of a resumable upload session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use thiserror::Error;

/// Placeholder record kept by the metadata service while an upload is in
/// flight. Its `size` counts against the owner's quota until it is deleted.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Upload {
    /// Object key the finished content will live under.
    pub key: String,

    /// Bucket the finished content will live in.
    pub bucket: String,

    /// Storage multipart session token. `None` until the session is started,
    /// and for placeholders that only reserve quota.
    pub upload_id: Option<String>,

    pub owner_id: String,

    /// Declared name of the file being uploaded.
    pub name: String,

    pub mime_type: String,

    /// Declared size in bytes.
    pub size: i64,

    pub parent_id: String,

    /// Existing file whose content this upload replaces, if any.
    pub file_id: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// Fields needed to create an upload placeholder.
#[derive(Clone, Debug)]
pub struct NewUpload {
    pub key: String,
    pub bucket: String,
    pub owner_id: String,
    pub name: String,
    pub mime_type: String,
    pub size: i64,
    pub parent_id: String,
    pub file_id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadState {
    Initiated,
    Transferring,
    Completing,
    Done,
    Aborted,
}

impl UploadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadState::Done | UploadState::Aborted)
    }

    fn can_advance_to(self, next: UploadState) -> bool {
        use UploadState::*;
        matches!(
            (self, next),
            (Initiated, Transferring)
                | (Initiated, Completing)
                | (Transferring, Completing)
                | (Initiated, Aborted)
                | (Transferring, Aborted)
                | (Completing, Aborted)
                | (Completing, Done)
        )
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("upload cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub from: UploadState,
    pub to: UploadState,
}

/// In-process view of one resumable upload, built from its placeholder.
#[derive(Clone, Debug)]
pub struct UploadSession {
    pub upload_id: String,
    pub key: String,
    pub bucket: String,
    pub owner_id: String,
    pub name: String,
    pub mime_type: String,
    pub parent_id: String,
    pub declared_size: i64,
    pub final_size: Option<i64>,
    pub target_file_id: Option<String>,
    pub state: UploadState,
}

impl UploadSession {
    pub fn new(upload_id: impl Into<String>, placeholder: Upload) -> Self {
        Self {
            upload_id: upload_id.into(),
            key: placeholder.key,
            bucket: placeholder.bucket,
            owner_id: placeholder.owner_id,
            name: placeholder.name,
            mime_type: placeholder.mime_type,
            parent_id: placeholder.parent_id,
            declared_size: placeholder.size,
            final_size: None,
            target_file_id: placeholder.file_id,
            state: UploadState::Initiated,
        }
    }

    /// Move to `next`, rejecting any transition out of a terminal state or
    /// backwards through the lifecycle.
    pub fn advance(&mut self, next: UploadState) -> Result<(), InvalidTransition> {
        if !self.state.can_advance_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}
