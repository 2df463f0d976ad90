//! Resumable uploads: init → streamed part transfer → complete or abort.
//!
//! Part sends are strictly sequential, numbered from 1 in the order bytes
//! leave the inbound stream. A single reader task drains the storage
//! acknowledgements so a storage-side failure is noticed between sends; it
//! reports through a one-slot error channel and is always joined before the
//! transfer returns.

use crate::{
    backends::{BackendError, Backends, PartAck, PartStream, UploadPartRequest},
    errors::{GatewayError, GatewayResult},
    models::{
        bucket::bucket_for_owner,
        file::{FOLDER_MIME_TYPE, File, FilePatch, NewFile, ROOT_PARENT},
        permission::Role,
        upload::{NewUpload, UploadSession, UploadState},
    },
    services::{key_lock::KeyedLocks, permission_resolver::PermissionResolver},
};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, pin_mut};
use std::io;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Smallest part object storage accepts (except for the last one).
pub const MIN_PART_BYTES: i64 = 5 * 1024 * 1024;
/// Largest part object storage accepts.
pub const MAX_PART_BYTES: i64 = 5 * 1024 * 1024 * 1024;
/// Target number of parts per upload.
const PARTS_PER_UPLOAD: i64 = 50;
/// Largest body accepted by a direct (non-resumable) upload.
pub const MAX_MEDIA_BYTES: usize = 5 * 1024 * 1024;

/// Bytes per part for an upload of `declared_size` bytes.
pub fn part_size(declared_size: i64) -> usize {
    (declared_size / PARTS_PER_UPLOAD).clamp(MIN_PART_BYTES, MAX_PART_BYTES) as usize
}

/// What a client declares when starting an upload.
#[derive(Clone, Debug)]
pub struct InitUpload {
    pub name: String,
    pub mime_type: String,
    pub declared_size: i64,
    pub parent_id: String,
}

#[derive(Clone)]
pub struct UploadService {
    backends: Backends,
    resolver: PermissionResolver,
    /// Uploads with a part transfer in flight in this process.
    active: KeyedLocks,
}

impl UploadService {
    pub fn new(backends: Backends, resolver: PermissionResolver) -> Self {
        Self {
            backends,
            resolver,
            active: KeyedLocks::new(),
        }
    }

    /// Start a resumable upload of a new file owned by `requester`.
    pub async fn init(&self, requester: &str, req: InitUpload) -> GatewayResult<UploadSession> {
        validate_declaration(&req)?;
        self.check_parent(requester, &req.parent_id).await?;

        let key = self.backends.metadata.generate_key().await?;
        self.start_session(NewUpload {
            key,
            bucket: bucket_for_owner(requester),
            owner_id: requester.to_string(),
            name: req.name,
            mime_type: req.mime_type,
            size: req.declared_size,
            parent_id: req.parent_id,
            file_id: None,
        })
        .await
    }

    /// Start a resumable upload replacing the content of an existing file.
    /// The placeholder is charged to the file's owner.
    pub async fn init_update(
        &self,
        requester: &str,
        file_id: &str,
        declared_size: i64,
        mime_type: Option<String>,
    ) -> GatewayResult<UploadSession> {
        if declared_size < 0 {
            return Err(GatewayError::Validation("upload size must not be negative".into()));
        }
        self.resolver.authorize(requester, file_id, Role::Write).await?;
        let file = self.backends.metadata.get_file_by_id(file_id).await?;
        if file.is_folder() {
            return Err(GatewayError::Validation(format!(
                "{} is a folder and has no content",
                file_id
            )));
        }

        self.start_session(NewUpload {
            key: file.key,
            bucket: file.bucket,
            owner_id: file.owner_id,
            name: file.name,
            mime_type: mime_type.unwrap_or(file.mime_type),
            size: declared_size,
            parent_id: file.parent_id,
            file_id: Some(file.id),
        })
        .await
    }

    /// Stream `body` into the session `upload_id`, then complete it. Any
    /// failure aborts the session.
    ///
    /// Runs on its own task: a dropped request surfaces as a body error and
    /// still reaches `abort`.
    pub async fn transfer_parts<S>(
        &self,
        requester: &str,
        upload_id: &str,
        expected_total: Option<i64>,
        body: S,
    ) -> GatewayResult<File>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let this = self.clone();
        let requester = requester.to_string();
        let upload_id = upload_id.to_string();
        tokio::spawn(async move {
            this.run_transfer(&requester, &upload_id, expected_total, body)
                .await
        })
        .await
        .map_err(|err| GatewayError::Internal(format!("upload task failed: {}", err)))?
    }

    /// Turn the session's finished multipart object into a file record.
    pub async fn complete(&self, session: &mut UploadSession) -> GatewayResult<File> {
        session.advance(UploadState::Completing)?;

        let storage = &self.backends.storage;
        let info = match storage
            .upload_complete(&session.bucket, &session.key, &session.upload_id)
            .await
        {
            Ok(info) => info,
            Err(err) => {
                self.abort(session).await;
                return Err(err.into());
            }
        };
        session.final_size = Some(info.size);

        // A stale placeholder only over-reserves quota; failing here would
        // strand the finished object instead.
        if let Err(err) = self
            .backends
            .metadata
            .delete_upload_by_id(&session.upload_id)
            .await
        {
            warn!("failed to delete placeholder of upload {}: {}", session.upload_id, err);
        }

        let mime_type = info
            .content_type
            .clone()
            .unwrap_or_else(|| session.mime_type.clone());
        let recorded = match session.target_file_id.clone() {
            Some(file_id) => self.record_update(&file_id, info.size, mime_type).await,
            None => {
                self.backends
                    .metadata
                    .create_file(NewFile {
                        id: None,
                        owner_id: session.owner_id.clone(),
                        parent_id: session.parent_id.clone(),
                        bucket: session.bucket.clone(),
                        key: session.key.clone(),
                        size: info.size,
                        mime_type,
                        name: session.name.clone(),
                    })
                    .await
            }
        };

        match recorded {
            Ok(file) => {
                session.advance(UploadState::Done)?;
                info!(
                    "completed upload {} as file {} ({} bytes, etag {})",
                    session.upload_id,
                    file.id,
                    info.size,
                    info.etag.as_deref().unwrap_or("-")
                );
                Ok(file)
            }
            Err(err) => {
                if session.target_file_id.is_none() {
                    self.discard_object(&session.bucket, &session.key).await;
                } else {
                    warn!(
                        "content of {} replaced but its record was not updated: {}",
                        session.key, err
                    );
                }
                session.advance(UploadState::Aborted)?;
                Err(err.into())
            }
        }
    }

    /// Abandon the session: abort the storage session, then drop the
    /// placeholder. Both are attempted once; failures are only logged.
    pub async fn abort(&self, session: &mut UploadSession) {
        if session.state.is_terminal() {
            return;
        }

        if let Err(err) = self
            .backends
            .storage
            .upload_abort(&session.bucket, &session.key, &session.upload_id)
            .await
        {
            warn!("failed to abort storage upload {}: {}", session.upload_id, err);
        }
        if let Err(err) = self
            .backends
            .metadata
            .delete_upload_by_id(&session.upload_id)
            .await
        {
            warn!("failed to delete placeholder of upload {}: {}", session.upload_id, err);
        }

        if let Err(err) = session.advance(UploadState::Aborted) {
            debug!("{}", err);
        }
        info!("aborted upload {}", session.upload_id);
    }

    /// Single-request upload of a small body, or folder creation when the
    /// MIME type is the folder type.
    pub async fn upload_media(
        &self,
        requester: &str,
        req: InitUpload,
        data: Bytes,
    ) -> GatewayResult<File> {
        if req.name.trim().is_empty() {
            return Err(GatewayError::Validation("file name is required".into()));
        }
        if data.len() > MAX_MEDIA_BYTES {
            return Err(GatewayError::Validation(format!(
                "direct uploads are limited to {} bytes",
                MAX_MEDIA_BYTES
            )));
        }
        self.check_parent(requester, &req.parent_id).await?;

        let metadata = &self.backends.metadata;
        let bucket = bucket_for_owner(requester);
        if req.mime_type == FOLDER_MIME_TYPE {
            if !data.is_empty() {
                return Err(GatewayError::Validation("folders cannot have content".into()));
            }
            let folder = metadata
                .create_file(NewFile {
                    id: None,
                    owner_id: requester.to_string(),
                    parent_id: req.parent_id,
                    bucket,
                    key: String::new(),
                    size: 0,
                    mime_type: FOLDER_MIME_TYPE.to_string(),
                    name: req.name,
                })
                .await?;
            return Ok(folder);
        }

        let key = metadata.generate_key().await?;
        metadata
            .create_upload(NewUpload {
                key: key.clone(),
                bucket: bucket.clone(),
                owner_id: requester.to_string(),
                name: req.name.clone(),
                mime_type: req.mime_type.clone(),
                size: data.len() as i64,
                parent_id: req.parent_id.clone(),
                file_id: None,
            })
            .await?;

        let stored = self
            .backends
            .storage
            .put_object(&bucket, &key, Some(&req.mime_type), data)
            .await;
        if let Err(err) = metadata.delete_upload_by_key(&key, &bucket).await {
            warn!("failed to delete placeholder {}/{}: {}", bucket, key, err);
        }
        let info = stored?;

        let created = metadata
            .create_file(NewFile {
                id: None,
                owner_id: requester.to_string(),
                parent_id: req.parent_id,
                bucket: bucket.clone(),
                key: key.clone(),
                size: info.size,
                mime_type: req.mime_type,
                name: req.name,
            })
            .await;
        match created {
            Ok(file) => Ok(file),
            Err(err) => {
                self.discard_object(&bucket, &key).await;
                Err(err.into())
            }
        }
    }

    async fn start_session(&self, upload: NewUpload) -> GatewayResult<UploadSession> {
        let metadata = &self.backends.metadata;
        let storage = &self.backends.storage;

        let placeholder = metadata.create_upload(upload).await?;
        let (bucket, key) = (placeholder.bucket.clone(), placeholder.key.clone());

        let upload_id = match storage
            .upload_init(&bucket, &key, Some(&placeholder.mime_type))
            .await
        {
            Ok(upload_id) => upload_id,
            Err(err) => {
                self.discard_placeholder(&key, &bucket).await;
                return Err(err.into());
            }
        };

        if let Err(err) = metadata.update_upload_id(&key, &bucket, &upload_id).await {
            if let Err(abort_err) = storage.upload_abort(&bucket, &key, &upload_id).await {
                warn!("failed to abort storage upload {}: {}", upload_id, abort_err);
            }
            self.discard_placeholder(&key, &bucket).await;
            return Err(err.into());
        }

        info!(
            "initiated upload {} for {}/{} ({} bytes declared)",
            upload_id, bucket, key, placeholder.size
        );
        Ok(UploadSession::new(upload_id, placeholder))
    }

    async fn run_transfer<S>(
        &self,
        requester: &str,
        upload_id: &str,
        expected_total: Option<i64>,
        body: S,
    ) -> GatewayResult<File>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let _guard = self.active.try_acquire(upload_id).ok_or_else(|| {
            GatewayError::Conflict(format!("upload {} is already transferring", upload_id))
        })?;

        let placeholder = self.backends.metadata.get_upload_by_id(upload_id).await?;
        match &placeholder.file_id {
            Some(file_id) => {
                self.resolver
                    .authorize(requester, file_id, Role::Write)
                    .await?;
            }
            None if placeholder.owner_id != requester => {
                return Err(GatewayError::Forbidden(format!(
                    "upload {} belongs to another user",
                    upload_id
                )));
            }
            None => {}
        }
        if let Some(total) = expected_total {
            if total != placeholder.size {
                return Err(GatewayError::Validation(format!(
                    "content range total {} does not match declared size {}",
                    total, placeholder.size
                )));
            }
        }

        let mut session = UploadSession::new(upload_id, placeholder);
        match self.send_parts(&mut session, body).await {
            Ok(()) => self.complete(&mut session).await,
            Err(err) => {
                warn!("upload {} failed: {}", upload_id, err);
                self.abort(&mut session).await;
                Err(err)
            }
        }
    }

    async fn send_parts<S>(&self, session: &mut UploadSession, body: S) -> GatewayResult<()>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let PartStream { requests, mut acks } = self
            .backends
            .storage
            .upload_part(&session.bucket, &session.key, &session.upload_id)
            .await?;

        let (err_tx, mut err_rx) = mpsc::channel::<BackendError>(1);
        let reader = tokio::spawn(async move {
            let mut acked: Vec<PartAck> = Vec::new();
            while let Some(ack) = acks.recv().await {
                match ack {
                    Ok(ack) => acked.push(ack),
                    Err(err) => {
                        let _ = err_tx.try_send(err);
                        break;
                    }
                }
            }
            acked
        });

        let sent = self.pump(session, requests, &mut err_rx, body).await;
        let acked = reader
            .await
            .map_err(|err| GatewayError::Internal(format!("ack reader failed: {}", err)));

        let sent = sent?;
        let acked = acked?;
        if let Ok(err) = err_rx.try_recv() {
            return Err(err.into());
        }
        if !acked.iter().map(|ack| ack.part_number).eq(1..=sent) {
            return Err(GatewayError::Internal(format!(
                "storage acknowledged {} of {} parts",
                acked.len(),
                sent
            )));
        }
        debug!(
            "upload {} sent {} parts, last etag {:?}",
            session.upload_id,
            sent,
            acked.last().map(|ack| ack.etag.as_str())
        );
        Ok(())
    }

    /// Cut the inbound stream into parts and send them in order. Returns the
    /// number of parts sent. `requests` is dropped on return, which ends the
    /// storage stream.
    async fn pump<S>(
        &self,
        session: &mut UploadSession,
        requests: mpsc::Sender<UploadPartRequest>,
        err_rx: &mut mpsc::Receiver<BackendError>,
        body: S,
    ) -> GatewayResult<u32>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let chunk_size = part_size(session.declared_size);
        let mut buffer = BytesMut::new();
        let mut received: i64 = 0;
        let mut part_number: u32 = 0;

        pin_mut!(body);
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|err| {
                GatewayError::Validation(format!("reading upload body: {}", err))
            })?;
            received += chunk.len() as i64;
            if received > session.declared_size {
                return Err(GatewayError::Validation(format!(
                    "body exceeds declared size of {} bytes",
                    session.declared_size
                )));
            }
            buffer.extend_from_slice(&chunk);

            while buffer.len() >= chunk_size {
                let part = buffer.split_to(chunk_size).freeze();
                part_number += 1;
                send_part(session, &requests, err_rx, part_number, part).await?;
            }
        }

        if received != session.declared_size {
            return Err(GatewayError::Validation(format!(
                "body ended after {} of {} declared bytes",
                received, session.declared_size
            )));
        }
        if !buffer.is_empty() {
            part_number += 1;
            send_part(session, &requests, err_rx, part_number, buffer.freeze()).await?;
        }
        Ok(part_number)
    }

    async fn check_parent(&self, requester: &str, parent_id: &str) -> GatewayResult<()> {
        if parent_id == ROOT_PARENT {
            return Ok(());
        }
        self.resolver
            .authorize(requester, parent_id, Role::Write)
            .await?;
        let parent = self.backends.metadata.get_file_by_id(parent_id).await?;
        if !parent.is_folder() {
            return Err(GatewayError::Validation(format!(
                "parent {} is not a folder",
                parent_id
            )));
        }
        Ok(())
    }

    async fn record_update(
        &self,
        file_id: &str,
        size: i64,
        mime_type: String,
    ) -> Result<File, BackendError> {
        let patch = FilePatch {
            size: Some(size),
            mime_type: Some(mime_type),
            ..Default::default()
        };
        let metadata = &self.backends.metadata;
        let failed = metadata.update_files(&[file_id.to_string()], &patch).await?;
        if !failed.is_empty() {
            return Err(BackendError::NotFound(format!("file `{}`", file_id)));
        }
        metadata.get_file_by_id(file_id).await
    }

    async fn discard_placeholder(&self, key: &str, bucket: &str) {
        if let Err(err) = self.backends.metadata.delete_upload_by_key(key, bucket).await {
            warn!("failed to delete placeholder {}/{}: {}", bucket, key, err);
        }
    }

    async fn discard_object(&self, bucket: &str, key: &str) {
        match self
            .backends
            .storage
            .delete_objects(bucket, &[key.to_string()])
            .await
        {
            Ok(failed) if failed.is_empty() => {}
            Ok(_) => warn!("object {}/{} left without a file record", bucket, key),
            Err(err) => warn!("failed to delete object {}/{}: {}", bucket, key, err),
        }
    }
}

async fn send_part(
    session: &mut UploadSession,
    requests: &mpsc::Sender<UploadPartRequest>,
    err_rx: &mut mpsc::Receiver<BackendError>,
    part_number: u32,
    data: Bytes,
) -> GatewayResult<()> {
    if let Ok(err) = err_rx.try_recv() {
        return Err(err.into());
    }
    if session.state == UploadState::Initiated {
        session.advance(UploadState::Transferring)?;
    }
    if requests
        .send(UploadPartRequest { part_number, data })
        .await
        .is_err()
    {
        return Err(match err_rx.try_recv() {
            Ok(err) => err.into(),
            Err(_) => BackendError::Unavailable("part stream closed by storage".into()).into(),
        });
    }
    Ok(())
}

fn validate_declaration(req: &InitUpload) -> GatewayResult<()> {
    if req.name.trim().is_empty() {
        return Err(GatewayError::Validation("file name is required".into()));
    }
    if req.declared_size < 0 {
        return Err(GatewayError::Validation("upload size must not be negative".into()));
    }
    if req.mime_type == FOLDER_MIME_TYPE {
        return Err(GatewayError::Validation("folders are not uploaded".into()));
    }
    Ok(())
}
