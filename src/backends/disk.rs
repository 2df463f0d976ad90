//! src/backends/disk.rs
//!
//! DiskObjectStorage — object storage on local disk. Objects are sharded
//! beneath `base_path/{bucket}/{shard}/{shard}/{key}`; multipart sessions
//! stage their parts under `base_path/.multipart/{upload_id}/` until they are
//! completed or aborted.

use super::{
    BackendError, BackendResult, MAX_SINGLE_COPY_BYTES, ObjectInfo, ObjectStorage, PartAck,
    PartStream, UploadPartRequest,
};
use async_trait::async_trait;
use bytes::Bytes;
use md5::Context;
use std::{
    collections::HashMap,
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::mpsc,
};
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const MULTIPART_DIR: &str = ".multipart";
const COPY_BUFFER_BYTES: usize = 64 * 1024;
const PART_STREAM_DEPTH: usize = 4;

#[derive(Clone, Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    content_type: Option<String>,
    /// Number of the part the session accepts next.
    next_part: u32,
}

#[derive(Clone)]
pub struct DiskObjectStorage {
    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
    sessions: Arc<Mutex<HashMap<String, PendingUpload>>>,
}

impl DiskObjectStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    fn ensure_key_safe(key: &str) -> BackendResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(BackendError::InvalidArgument(format!("object key `{}`", key)));
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(BackendError::InvalidArgument(format!("object key `{}`", key)));
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(BackendError::InvalidArgument(format!("object key `{}`", key)));
        }
        Ok(())
    }

    fn ensure_bucket_safe(bucket: &str) -> BackendResult<()> {
        let valid = !bucket.is_empty()
            && !bucket.starts_with('.')
            && bucket
                .chars()
                .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'));
        if valid {
            Ok(())
        } else {
            Err(BackendError::InvalidArgument(format!("bucket `{}`", bucket)))
        }
    }

    fn bucket_root(&self, bucket: &str) -> PathBuf {
        self.base_path.join(bucket)
    }

    /// Two-level shard identifiers from MD5(bucket/key), as lowercase hex.
    fn object_shards(bucket: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket, key);
        let mut path = self.bucket_root(bucket);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn staging_dir(&self, upload_id: &str) -> PathBuf {
        self.base_path.join(MULTIPART_DIR).join(upload_id)
    }

    fn part_path(staging: &Path, part_number: u32) -> PathBuf {
        staging.join(format!("{:05}", part_number))
    }

    fn session(&self, upload_id: &str, bucket: &str, key: &str) -> BackendResult<PendingUpload> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        match sessions.get(upload_id) {
            Some(s) if s.bucket == bucket && s.key == key => Ok(s.clone()),
            _ => Err(BackendError::NotFound(format!("upload `{}`", upload_id))),
        }
    }

    /// Accept `part_number` only if it is the next one the session expects.
    fn claim_part(&self, upload_id: &str, part_number: u32) -> BackendResult<()> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let session = sessions
            .get_mut(upload_id)
            .ok_or_else(|| BackendError::NotFound(format!("upload `{}`", upload_id)))?;
        if part_number != session.next_part {
            return Err(BackendError::InvalidArgument(format!(
                "part {} out of order, expected {}",
                part_number, session.next_part
            )));
        }
        session.next_part += 1;
        Ok(())
    }

    async fn object_size(&self, bucket: &str, key: &str) -> BackendResult<u64> {
        let path = self.object_path(bucket, key);
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(BackendError::NotFound(
                format!("object `{}` in bucket `{}`", key, bucket),
            )),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_part(staging: &Path, part_number: u32, data: &[u8]) -> BackendResult<String> {
        let path = Self::part_path(staging, part_number);
        let mut file = File::create(&path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(format!("{:x}", md5::compute(data)))
    }

    /// Move a fully written temp file into place. Objects are overwritten.
    async fn commit_tmp(tmp_path: &Path, file_path: &Path) -> BackendResult<()> {
        if let Err(err) = fs::rename(tmp_path, file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(file_path).await?;
                fs::rename(tmp_path, file_path).await?;
            } else {
                let _ = fs::remove_file(tmp_path).await;
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Create the destination directory and a temp file next to it.
    async fn open_tmp(&self, bucket: &str, key: &str) -> BackendResult<(PathBuf, PathBuf, File)> {
        let file_path = self.object_path(bucket, key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            BackendError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let file = File::create(&tmp_path).await?;
        Ok((file_path, tmp_path, file))
    }

    /// Recursively remove empty directories up to `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    async fn remove_object(&self, bucket: &str, key: &str) -> io::Result<()> {
        let file_path = self.object_path(bucket, key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed object {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("object {} already missing", file_path.display());
            }
            Err(err) => return Err(err),
        }
        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.bucket_root(bucket)).await;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for DiskObjectStorage {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        data: Bytes,
    ) -> BackendResult<ObjectInfo> {
        Self::ensure_bucket_safe(bucket)?;
        Self::ensure_key_safe(key)?;
        let (file_path, tmp_path, mut file) = self.open_tmp(bucket, key).await?;

        let written = async {
            file.write_all(&data).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        Self::commit_tmp(&tmp_path, &file_path).await?;

        Ok(ObjectInfo {
            size: data.len() as i64,
            content_type: content_type.map(str::to_string),
            etag: Some(format!("{:x}", md5::compute(&data))),
        })
    }

    async fn upload_init(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> BackendResult<String> {
        Self::ensure_bucket_safe(bucket)?;
        Self::ensure_key_safe(key)?;
        let upload_id = Uuid::new_v4().simple().to_string();
        fs::create_dir_all(self.staging_dir(&upload_id)).await?;

        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                upload_id.clone(),
                PendingUpload {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    content_type: content_type.map(str::to_string),
                    next_part: 1,
                },
            );
        debug!("started multipart upload {} for {}/{}", upload_id, bucket, key);
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> BackendResult<PartStream> {
        self.session(upload_id, bucket, key)?;
        let (req_tx, mut req_rx) = mpsc::channel::<UploadPartRequest>(PART_STREAM_DEPTH);
        let (ack_tx, ack_rx) = mpsc::channel::<BackendResult<PartAck>>(PART_STREAM_DEPTH);

        let store = self.clone();
        let upload_id = upload_id.to_string();
        tokio::spawn(async move {
            let staging = store.staging_dir(&upload_id);
            while let Some(req) = req_rx.recv().await {
                let result = match store.claim_part(&upload_id, req.part_number) {
                    Ok(()) => Self::write_part(&staging, req.part_number, &req.data)
                        .await
                        .map(|etag| PartAck {
                            part_number: req.part_number,
                            etag,
                        }),
                    Err(err) => Err(err),
                };
                let failed = result.is_err();
                if ack_tx.send(result).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(PartStream {
            requests: req_tx,
            acks: ack_rx,
        })
    }

    async fn upload_complete(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> BackendResult<ObjectInfo> {
        let session = self.session(upload_id, bucket, key)?;
        let staging = self.staging_dir(upload_id);
        let (file_path, tmp_path, mut out) = self.open_tmp(bucket, key).await?;

        let mut digest = Context::new();
        let mut size: i64 = 0;
        let assembled: BackendResult<()> = async {
            let mut buf = vec![0u8; COPY_BUFFER_BYTES];
            for part_number in 1..session.next_part {
                let mut part = File::open(Self::part_path(&staging, part_number)).await?;
                loop {
                    let n = part.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    digest.consume(&buf[..n]);
                    out.write_all(&buf[..n]).await?;
                    size += n as i64;
                }
            }
            out.flush().await?;
            out.sync_all().await?;
            Ok(())
        }
        .await;
        if let Err(err) = assembled {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        Self::commit_tmp(&tmp_path, &file_path).await?;

        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(upload_id);
        if let Err(err) = fs::remove_dir_all(&staging).await {
            debug!("failed to remove staging dir {}: {}", staging.display(), err);
        }

        Ok(ObjectInfo {
            size,
            content_type: session.content_type,
            etag: Some(format!("{:x}", digest.compute())),
        })
    }

    async fn upload_abort(&self, bucket: &str, key: &str, upload_id: &str) -> BackendResult<()> {
        self.session(upload_id, bucket, key)?;
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(upload_id);
        let staging = self.staging_dir(upload_id);
        match fs::remove_dir_all(&staging).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> BackendResult<ObjectInfo> {
        Self::ensure_bucket_safe(dst_bucket)?;
        Self::ensure_key_safe(dst_key)?;
        let size = self.object_size(src_bucket, src_key).await?;
        if size > MAX_SINGLE_COPY_BYTES {
            return Err(BackendError::InvalidArgument(format!(
                "object `{}` is {} bytes, above the single copy limit",
                src_key, size
            )));
        }

        let src_path = self.object_path(src_bucket, src_key);
        let (file_path, tmp_path, tmp) = self.open_tmp(dst_bucket, dst_key).await?;
        drop(tmp);
        if let Err(err) = fs::copy(&src_path, &tmp_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        Self::commit_tmp(&tmp_path, &file_path).await?;

        Ok(ObjectInfo {
            size: size as i64,
            content_type: None,
            etag: None,
        })
    }

    async fn upload_part_copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        upload_id: &str,
        part_number: u32,
        range: (u64, u64),
    ) -> BackendResult<PartAck> {
        self.session(upload_id, dst_bucket, dst_key)?;
        let (first, last) = range;
        let size = self.object_size(src_bucket, src_key).await?;
        if first > last || last >= size {
            return Err(BackendError::InvalidArgument(format!(
                "range {}-{} outside object of {} bytes",
                first, last, size
            )));
        }
        self.claim_part(upload_id, part_number)?;

        let mut src = File::open(self.object_path(src_bucket, src_key)).await?;
        src.seek(SeekFrom::Start(first)).await?;
        let mut limited = src.take(last - first + 1);
        let mut part = File::create(Self::part_path(&self.staging_dir(upload_id), part_number)).await?;
        let mut digest = Context::new();
        let mut buf = vec![0u8; COPY_BUFFER_BYTES];
        loop {
            let n = limited.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            digest.consume(&buf[..n]);
            part.write_all(&buf[..n]).await?;
        }
        part.flush().await?;

        Ok(PartAck {
            part_number,
            etag: format!("{:x}", digest.compute()),
        })
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> BackendResult<Vec<String>> {
        Self::ensure_bucket_safe(bucket)?;
        let mut failed = Vec::new();
        for key in keys {
            if Self::ensure_key_safe(key).is_err() {
                failed.push(key.clone());
                continue;
            }
            if let Err(err) = self.remove_object(bucket, key).await {
                debug!("failed to delete {}/{}: {}", bucket, key, err);
                failed.push(key.clone());
            }
        }
        Ok(failed)
    }
}
