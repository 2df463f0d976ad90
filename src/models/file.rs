//! Represents a file or folder record held by the metadata service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// MIME type marking a record as a folder. Folders have no stored object.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.drive.folder";

/// Parent id of a top-level file: the owner's implicit root, never stored.
pub const ROOT_PARENT: &str = "";

/// A single node in an owner's file tree.
///
/// The record holds metadata only; content lives in object storage under
/// `(bucket, key)`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct File {
    /// Unique identifier assigned by the metadata service.
    pub id: String,

    /// User that owns this file.
    pub owner_id: String,

    /// Containing folder, or [`ROOT_PARENT`] for the owner's root.
    pub parent_id: String,

    /// Bucket holding the content.
    pub bucket: String,

    /// Object key inside `bucket`. Empty for folders.
    pub key: String,

    /// Size in bytes.
    pub size: i64,

    /// Content type (MIME type).
    #[serde(rename = "type")]
    pub mime_type: String,

    /// Display name.
    pub name: String,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl File {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }
}

/// Fields needed to create a file record.
#[derive(Clone, Debug)]
pub struct NewFile {
    /// Id to create the record under; the backend assigns one when `None`.
    pub id: Option<String>,
    pub owner_id: String,
    pub parent_id: String,
    pub bucket: String,
    pub key: String,
    pub size: i64,
    pub mime_type: String,
    pub name: String,
}

/// Partial update applied by `UpdateFiles`. `None` leaves a column untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePatch {
    pub owner_id: Option<String>,
    pub parent_id: Option<String>,
    pub bucket: Option<String>,
    pub key: Option<String>,
    pub size: Option<i64>,
    pub mime_type: Option<String>,
}

impl FilePatch {
    pub fn is_empty(&self) -> bool {
        *self == FilePatch::default()
    }

    /// Patch restoring every column this patch would change to its value in
    /// `original`.
    pub fn inverse(&self, original: &File) -> FilePatch {
        FilePatch {
            owner_id: self.owner_id.as_ref().map(|_| original.owner_id.clone()),
            parent_id: self.parent_id.as_ref().map(|_| original.parent_id.clone()),
            bucket: self.bucket.as_ref().map(|_| original.bucket.clone()),
            key: self.key.as_ref().map(|_| original.key.clone()),
            size: self.size.map(|_| original.size),
            mime_type: self.mime_type.as_ref().map(|_| original.mime_type.clone()),
        }
    }
}
