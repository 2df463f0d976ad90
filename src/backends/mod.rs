//! Contracts of the remote services the gateway orchestrates.
//!
//! Each service is a trait so the orchestration code can run against the
//! bundled local implementations ([`sqlite`], [`disk`]) or any remote client
//! exposing the same operations.

pub mod disk;
pub mod sqlite;

use crate::models::{
    file::{File, FilePatch, NewFile},
    permission::{Permission, Role},
    quota::{Quota, User},
    transfer::TransferJob,
    upload::{NewUpload, Upload},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{io, sync::Arc};
use thiserror::Error;
use tokio::sync::mpsc;

/// Largest object a single copy request may move. Larger objects need a
/// multipart part-copy.
pub const MAX_SINGLE_COPY_BYTES: u64 = 5 * 1024 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

#[async_trait]
pub trait MetadataService: Send + Sync {
    async fn get_file_by_id(&self, id: &str) -> BackendResult<File>;

    /// Every file below `folder_id`, at any depth. Order is unspecified.
    async fn get_descendants_by_id(&self, folder_id: &str) -> BackendResult<Vec<File>>;

    async fn create_file(&self, file: NewFile) -> BackendResult<File>;

    /// Create an upload placeholder, reserving `upload.size` against the
    /// owner's quota. Fails with `ResourceExhausted` if it does not fit.
    async fn create_upload(&self, upload: NewUpload) -> BackendResult<Upload>;

    async fn get_upload_by_id(&self, upload_id: &str) -> BackendResult<Upload>;

    /// Attach the storage session token to the placeholder at `(key, bucket)`.
    async fn update_upload_id(&self, key: &str, bucket: &str, upload_id: &str)
    -> BackendResult<()>;

    async fn delete_upload_by_id(&self, upload_id: &str) -> BackendResult<Upload>;

    async fn delete_upload_by_key(&self, key: &str, bucket: &str) -> BackendResult<Upload>;

    /// Apply `patch` to every id. Returns the ids that could not be updated.
    async fn update_files(&self, ids: &[String], patch: &FilePatch) -> BackendResult<Vec<String>>;

    async fn delete_file(&self, id: &str) -> BackendResult<File>;

    /// Mint a fresh, unused object key.
    async fn generate_key(&self) -> BackendResult<String>;
}

#[async_trait]
pub trait PermissionService: Send + Sync {
    /// Whether `user_id` holds at least `role` on `file_id` through an
    /// explicit record. Returns `NotFound` when no record exists at all, and
    /// `Ok(false)` when a record exists but is insufficient.
    async fn is_permitted(&self, file_id: &str, user_id: &str, role: Role) -> BackendResult<bool>;

    async fn get_permission(&self, file_id: &str, user_id: &str) -> BackendResult<Permission>;

    async fn create_permission(&self, permission: Permission) -> BackendResult<Permission>;

    async fn delete_permission(&self, file_id: &str, user_id: &str) -> BackendResult<Permission>;
}

/// What storage reports about a finished object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub size: i64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
}

#[derive(Clone, Debug)]
pub struct UploadPartRequest {
    pub part_number: u32,
    pub data: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartAck {
    pub part_number: u32,
    pub etag: String,
}

/// Both halves of a bidirectional part stream.
///
/// Dropping `requests` signals end of input; storage then closes `acks` after
/// acknowledging everything it received. An `Err` on `acks` ends the stream.
pub struct PartStream {
    pub requests: mpsc::Sender<UploadPartRequest>,
    pub acks: mpsc::Receiver<BackendResult<PartAck>>,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        data: Bytes,
    ) -> BackendResult<ObjectInfo>;

    /// Start a multipart session and return its token.
    async fn upload_init(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> BackendResult<String>;

    /// Open the part stream of a session. Parts must arrive numbered
    /// 1, 2, 3, … with no gaps; anything else is rejected.
    async fn upload_part(&self, bucket: &str, key: &str, upload_id: &str)
    -> BackendResult<PartStream>;

    async fn upload_complete(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> BackendResult<ObjectInfo>;

    async fn upload_abort(&self, bucket: &str, key: &str, upload_id: &str) -> BackendResult<()>;

    /// Copy an object of at most [`MAX_SINGLE_COPY_BYTES`].
    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> BackendResult<ObjectInfo>;

    /// Copy the inclusive byte range `first..=last` of a source object as the
    /// next part of a multipart session on the destination.
    #[allow(clippy::too_many_arguments)]
    async fn upload_part_copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        upload_id: &str,
        part_number: u32,
        range: (u64, u64),
    ) -> BackendResult<PartAck>;

    /// Delete `keys` from `bucket`. Missing keys count as deleted. Returns the
    /// keys that could not be removed.
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> BackendResult<Vec<String>>;
}

#[async_trait]
pub trait QuotaService: Send + Sync {
    async fn get_owner_quota(&self, owner_id: &str) -> BackendResult<Quota>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user_by_id(&self, user_id: &str) -> BackendResult<User>;
}

/// Durable record of in-flight transfer sagas.
#[async_trait]
pub trait TransferJournal: Send + Sync {
    async fn save(&self, job: &TransferJob) -> BackendResult<()>;

    async fn remove(&self, job_id: &str) -> BackendResult<()>;

    async fn list_unfinished(&self) -> BackendResult<Vec<TransferJob>>;
}

/// Handles to every backend the gateway talks to.
#[derive(Clone)]
pub struct Backends {
    pub metadata: Arc<dyn MetadataService>,
    pub permissions: Arc<dyn PermissionService>,
    pub storage: Arc<dyn ObjectStorage>,
    pub quota: Arc<dyn QuotaService>,
    pub users: Arc<dyn UserDirectory>,
    pub journal: Arc<dyn TransferJournal>,
}
