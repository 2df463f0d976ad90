//! In-memory stand-ins for every backend, with a shared call log and
//! switchable faults.

use crate::{
    backends::{
        BackendError, BackendResult, Backends, MetadataService, ObjectInfo, ObjectStorage,
        PartAck, PartStream, PermissionService, QuotaService, TransferJournal,
        UploadPartRequest, UserDirectory,
    },
    models::{
        bucket::bucket_for_owner,
        file::{FOLDER_MIME_TYPE, File, FilePatch, NewFile},
        permission::{Permission, Role},
        quota::{Quota, User},
        transfer::{TransferJob, TransferPhase},
        upload::{NewUpload, Upload},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::mpsc;

const DEFAULT_QUOTA: i64 = 1 << 50;

#[derive(Default)]
struct Faults {
    permission_checks: bool,
    copy_keys: HashSet<String>,
    update_ids: HashSet<String>,
    create_names: HashSet<String>,
    part: Option<u32>,
    abort: bool,
    bind_upload_id: bool,
    journal_phase: Option<TransferPhase>,
    keep_journal: bool,
    lost_create_names: HashSet<String>,
}

struct Session {
    content_type: Option<String>,
    parts: BTreeMap<u32, Bytes>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    files: BTreeMap<String, File>,
    uploads: Vec<Upload>,
    permissions: HashMap<(String, String), Permission>,
    quotas: HashMap<String, i64>,
    users: HashSet<String>,
    objects: BTreeMap<(String, String), Bytes>,
    sessions: HashMap<String, Session>,
    parts: Vec<(u32, usize)>,
    jobs: BTreeMap<String, TransferJob>,
    events: Vec<String>,
    faults: Faults,
}

impl State {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn used_by(&self, owner_id: &str) -> i64 {
        let files: i64 = self
            .files
            .values()
            .filter(|f| f.owner_id == owner_id && !f.is_folder())
            .map(|f| f.size)
            .sum();
        let reserved: i64 = self
            .uploads
            .iter()
            .filter(|u| u.owner_id == owner_id)
            .map(|u| u.size)
            .sum();
        files + reserved
    }
}

#[derive(Clone, Default)]
pub struct FakeCloud {
    state: Arc<Mutex<State>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        let cloud = Self::default();
        for user in ["alice", "bob", "carol"] {
            cloud.add_user(user);
        }
        cloud
    }

    pub fn backends(&self) -> Backends {
        let this = Arc::new(self.clone());
        Backends {
            metadata: this.clone(),
            permissions: this.clone(),
            storage: this.clone(),
            quota: this.clone(),
            users: this.clone(),
            journal: this,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn events(&self) -> Vec<String> {
        self.lock().events.clone()
    }

    pub fn add_user(&self, id: &str) {
        self.lock().users.insert(id.to_string());
    }

    pub fn set_quota(&self, owner_id: &str, limit: i64) {
        self.lock().quotas.insert(owner_id.to_string(), limit);
    }

    /// A file of `size` bytes whose stored object holds its name.
    pub fn add_file(&self, owner_id: &str, parent_id: &str, name: &str, size: i64) -> File {
        let mut state = self.lock();
        let id = state.next("file");
        let key = state.next("key");
        let file = seed(&id, owner_id, parent_id, &key, size, "application/octet-stream", name);
        state.objects.insert(
            (file.bucket.clone(), key),
            Bytes::copy_from_slice(name.as_bytes()),
        );
        state.files.insert(id, file.clone());
        file
    }

    pub fn add_folder(&self, owner_id: &str, parent_id: &str, name: &str) -> File {
        let mut state = self.lock();
        let id = state.next("folder");
        let folder = seed(&id, owner_id, parent_id, "", 0, FOLDER_MIME_TYPE, name);
        state.files.insert(id, folder.clone());
        folder
    }

    pub fn grant(&self, file_id: &str, user_id: &str, role: Role) {
        self.lock().permissions.insert(
            (file_id.to_string(), user_id.to_string()),
            Permission {
                file_id: file_id.to_string(),
                user_id: user_id.to_string(),
                role,
                creator_id: "test".into(),
            },
        );
    }

    pub fn set_parent(&self, file_id: &str, parent_id: &str) {
        if let Some(file) = self.lock().files.get_mut(file_id) {
            file.parent_id = parent_id.to_string();
        }
    }

    pub fn file(&self, id: &str) -> Option<File> {
        self.lock().files.get(id).cloned()
    }

    pub fn files_owned_by(&self, owner_id: &str) -> Vec<File> {
        self.lock()
            .files
            .values()
            .filter(|f| f.owner_id == owner_id)
            .cloned()
            .collect()
    }

    pub fn has_permission(&self, file_id: &str, user_id: &str) -> bool {
        self.lock()
            .permissions
            .contains_key(&(file_id.to_string(), user_id.to_string()))
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.lock().uploads.clone()
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn objects_in(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Stored parts as `(part_number, len)`, in arrival order.
    pub fn part_log(&self) -> Vec<(u32, usize)> {
        self.lock().parts.clone()
    }

    pub fn journal(&self) -> Vec<TransferJob> {
        self.lock().jobs.values().cloned().collect()
    }

    pub fn fail_permission_checks(&self) {
        self.lock().faults.permission_checks = true;
    }

    pub fn fail_copy_of(&self, src_key: &str) {
        self.lock().faults.copy_keys.insert(src_key.to_string());
    }

    pub fn fail_update_of(&self, file_id: &str) {
        self.lock().faults.update_ids.insert(file_id.to_string());
    }

    pub fn fail_create_named(&self, name: &str) {
        self.lock().faults.create_names.insert(name.to_string());
    }

    pub fn fail_part(&self, part_number: u32) {
        self.lock().faults.part = Some(part_number);
    }

    pub fn fail_abort(&self) {
        self.lock().faults.abort = true;
    }

    pub fn fail_upload_id_binding(&self) {
        self.lock().faults.bind_upload_id = true;
    }

    /// Refuse journal saves of jobs entering `phase`.
    pub fn fail_journal_phase(&self, phase: TransferPhase) {
        self.lock().faults.journal_phase = Some(phase);
    }

    /// Ignore journal removals, as if the process died before finishing.
    pub fn keep_journal(&self) {
        self.lock().faults.keep_journal = true;
    }

    /// Create the record named `name` but report a failure to the caller.
    pub fn lose_create_reply_of(&self, name: &str) {
        self.lock().faults.lost_create_names.insert(name.to_string());
    }
}

fn seed(
    id: &str,
    owner_id: &str,
    parent_id: &str,
    key: &str,
    size: i64,
    mime_type: &str,
    name: &str,
) -> File {
    let now = Utc::now();
    File {
        id: id.to_string(),
        owner_id: owner_id.to_string(),
        parent_id: parent_id.to_string(),
        bucket: bucket_for_owner(owner_id),
        key: key.to_string(),
        size,
        mime_type: mime_type.to_string(),
        name: name.to_string(),
        created_at: now,
        updated_at: now,
    }
}

fn unavailable(what: &str) -> BackendError {
    BackendError::Unavailable(format!("injected {} failure", what))
}

#[async_trait]
impl MetadataService for FakeCloud {
    async fn get_file_by_id(&self, id: &str) -> BackendResult<File> {
        let mut state = self.lock();
        state.events.push(format!("get_file:{}", id));
        state
            .files
            .get(id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("file `{}`", id)))
    }

    async fn get_descendants_by_id(&self, folder_id: &str) -> BackendResult<Vec<File>> {
        let mut state = self.lock();
        state.events.push(format!("get_descendants:{}", folder_id));
        let mut found = Vec::new();
        let mut seen = HashSet::from([folder_id.to_string()]);
        let mut frontier = vec![folder_id.to_string()];
        while let Some(parent) = frontier.pop() {
            for file in state.files.values().filter(|f| f.parent_id == parent) {
                if seen.insert(file.id.clone()) {
                    frontier.push(file.id.clone());
                    found.push(file.clone());
                }
            }
        }
        Ok(found)
    }

    async fn create_file(&self, file: NewFile) -> BackendResult<File> {
        let mut state = self.lock();
        state.events.push(format!("create_file:{}", file.name));
        if state.faults.create_names.contains(&file.name) {
            return Err(unavailable("create"));
        }
        let id = match file.id {
            Some(id) => id,
            None => state.next("file"),
        };
        let lost = state.faults.lost_create_names.contains(&file.name);
        let now = Utc::now();
        let created = File {
            id: id.clone(),
            owner_id: file.owner_id,
            parent_id: file.parent_id,
            bucket: file.bucket,
            key: file.key,
            size: file.size,
            mime_type: file.mime_type,
            name: file.name,
            created_at: now,
            updated_at: now,
        };
        state.files.insert(id, created.clone());
        if lost {
            return Err(unavailable("create reply"));
        }
        Ok(created)
    }

    async fn create_upload(&self, upload: NewUpload) -> BackendResult<Upload> {
        let mut state = self.lock();
        state.events.push(format!("create_upload:{}", upload.key));
        if state
            .uploads
            .iter()
            .any(|u| u.key == upload.key && u.bucket == upload.bucket)
        {
            return Err(BackendError::AlreadyExists(format!("upload `{}`", upload.key)));
        }
        let limit = state
            .quotas
            .get(&upload.owner_id)
            .copied()
            .unwrap_or(DEFAULT_QUOTA);
        if state.used_by(&upload.owner_id) + upload.size > limit {
            return Err(BackendError::ResourceExhausted(format!(
                "quota of {}",
                upload.owner_id
            )));
        }
        let placeholder = Upload {
            key: upload.key,
            bucket: upload.bucket,
            upload_id: None,
            owner_id: upload.owner_id,
            name: upload.name,
            mime_type: upload.mime_type,
            size: upload.size,
            parent_id: upload.parent_id,
            file_id: upload.file_id,
            created_at: Utc::now(),
        };
        state.uploads.push(placeholder.clone());
        Ok(placeholder)
    }

    async fn get_upload_by_id(&self, upload_id: &str) -> BackendResult<Upload> {
        let mut state = self.lock();
        state.events.push(format!("get_upload:{}", upload_id));
        state
            .uploads
            .iter()
            .find(|u| u.upload_id.as_deref() == Some(upload_id))
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("upload `{}`", upload_id)))
    }

    async fn update_upload_id(&self, key: &str, bucket: &str, upload_id: &str) -> BackendResult<()> {
        let mut state = self.lock();
        state.events.push(format!("update_upload_id:{}", key));
        if state.faults.bind_upload_id {
            return Err(BackendError::Unavailable("metadata write refused".into()));
        }
        let placeholder = state
            .uploads
            .iter_mut()
            .find(|u| u.key == key && u.bucket == bucket)
            .ok_or_else(|| BackendError::NotFound(format!("upload `{}`", key)))?;
        placeholder.upload_id = Some(upload_id.to_string());
        Ok(())
    }

    async fn delete_upload_by_id(&self, upload_id: &str) -> BackendResult<Upload> {
        let mut state = self.lock();
        state.events.push(format!("delete_upload_by_id:{}", upload_id));
        let index = state
            .uploads
            .iter()
            .position(|u| u.upload_id.as_deref() == Some(upload_id))
            .ok_or_else(|| BackendError::NotFound(format!("upload `{}`", upload_id)))?;
        Ok(state.uploads.remove(index))
    }

    async fn delete_upload_by_key(&self, key: &str, bucket: &str) -> BackendResult<Upload> {
        let mut state = self.lock();
        state.events.push(format!("delete_upload_by_key:{}", key));
        let index = state
            .uploads
            .iter()
            .position(|u| u.key == key && u.bucket == bucket)
            .ok_or_else(|| BackendError::NotFound(format!("upload `{}`", key)))?;
        Ok(state.uploads.remove(index))
    }

    async fn update_files(&self, ids: &[String], patch: &FilePatch) -> BackendResult<Vec<String>> {
        let mut state = self.lock();
        let mut failed = Vec::new();
        for id in ids {
            state.events.push(format!("update_files:{}", id));
            if state.faults.update_ids.contains(id) {
                failed.push(id.clone());
                continue;
            }
            let Some(file) = state.files.get_mut(id) else {
                failed.push(id.clone());
                continue;
            };
            if let Some(owner_id) = &patch.owner_id {
                file.owner_id = owner_id.clone();
            }
            if let Some(parent_id) = &patch.parent_id {
                file.parent_id = parent_id.clone();
            }
            if let Some(bucket) = &patch.bucket {
                file.bucket = bucket.clone();
            }
            if let Some(key) = &patch.key {
                file.key = key.clone();
            }
            if let Some(size) = patch.size {
                file.size = size;
            }
            if let Some(mime_type) = &patch.mime_type {
                file.mime_type = mime_type.clone();
            }
            file.updated_at = Utc::now();
        }
        Ok(failed)
    }

    async fn delete_file(&self, id: &str) -> BackendResult<File> {
        let mut state = self.lock();
        state.events.push(format!("delete_file:{}", id));
        state
            .files
            .remove(id)
            .ok_or_else(|| BackendError::NotFound(format!("file `{}`", id)))
    }

    async fn generate_key(&self) -> BackendResult<String> {
        Ok(self.lock().next("key"))
    }
}

#[async_trait]
impl PermissionService for FakeCloud {
    async fn is_permitted(&self, file_id: &str, user_id: &str, role: Role) -> BackendResult<bool> {
        let mut state = self.lock();
        state.events.push(format!("is_permitted:{}", file_id));
        if state.faults.permission_checks {
            return Err(unavailable("permission"));
        }
        state
            .permissions
            .get(&(file_id.to_string(), user_id.to_string()))
            .map(|p| p.role.satisfies(role))
            .ok_or_else(|| BackendError::NotFound(format!("permission on `{}`", file_id)))
    }

    async fn get_permission(&self, file_id: &str, user_id: &str) -> BackendResult<Permission> {
        self.lock()
            .permissions
            .get(&(file_id.to_string(), user_id.to_string()))
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("permission on `{}`", file_id)))
    }

    async fn create_permission(&self, permission: Permission) -> BackendResult<Permission> {
        self.lock().permissions.insert(
            (permission.file_id.clone(), permission.user_id.clone()),
            permission.clone(),
        );
        Ok(permission)
    }

    async fn delete_permission(&self, file_id: &str, user_id: &str) -> BackendResult<Permission> {
        let mut state = self.lock();
        state
            .events
            .push(format!("delete_permission:{}:{}", file_id, user_id));
        state
            .permissions
            .remove(&(file_id.to_string(), user_id.to_string()))
            .ok_or_else(|| BackendError::NotFound(format!("permission on `{}`", file_id)))
    }
}

#[async_trait]
impl ObjectStorage for FakeCloud {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        data: Bytes,
    ) -> BackendResult<ObjectInfo> {
        let mut state = self.lock();
        state.events.push(format!("put_object:{}", key));
        let size = data.len() as i64;
        state
            .objects
            .insert((bucket.to_string(), key.to_string()), data);
        Ok(ObjectInfo {
            size,
            content_type: content_type.map(str::to_string),
            etag: None,
        })
    }

    async fn upload_init(
        &self,
        _bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> BackendResult<String> {
        let mut state = self.lock();
        state.events.push(format!("upload_init:{}", key));
        let upload_id = state.next("upload");
        state.sessions.insert(
            upload_id.clone(),
            Session {
                content_type: content_type.map(str::to_string),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> BackendResult<PartStream> {
        if !self.lock().sessions.contains_key(upload_id) {
            return Err(BackendError::NotFound(format!("upload `{}`", upload_id)));
        }

        let (requests, mut incoming) = mpsc::channel::<UploadPartRequest>(4);
        let (ack_tx, acks) = mpsc::channel(4);
        let cloud = self.clone();
        let upload_id = upload_id.to_string();
        tokio::spawn(async move {
            let mut expected = 1;
            while let Some(part) = incoming.recv().await {
                let result = cloud.store_part(&upload_id, expected, part);
                let failed = result.is_err();
                if ack_tx.send(result).await.is_err() || failed {
                    break;
                }
                expected += 1;
            }
        });
        Ok(PartStream { requests, acks })
    }

    async fn upload_complete(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> BackendResult<ObjectInfo> {
        let mut state = self.lock();
        state.events.push(format!("upload_complete:{}", key));
        let session = state
            .sessions
            .remove(upload_id)
            .ok_or_else(|| BackendError::NotFound(format!("upload `{}`", upload_id)))?;
        let data: Vec<u8> = session.parts.values().flat_map(|p| p.iter().copied()).collect();
        let size = data.len() as i64;
        state
            .objects
            .insert((bucket.to_string(), key.to_string()), Bytes::from(data));
        Ok(ObjectInfo {
            size,
            content_type: session.content_type,
            etag: None,
        })
    }

    async fn upload_abort(&self, _bucket: &str, _key: &str, upload_id: &str) -> BackendResult<()> {
        let mut state = self.lock();
        state.events.push(format!("upload_abort:{}", upload_id));
        state.sessions.remove(upload_id);
        if state.faults.abort {
            return Err(unavailable("abort"));
        }
        Ok(())
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> BackendResult<ObjectInfo> {
        let mut state = self.lock();
        state
            .events
            .push(format!("copy_object:{}->{}", src_key, dst_key));
        if state.faults.copy_keys.contains(src_key) {
            return Err(unavailable("copy"));
        }
        let data = state
            .objects
            .get(&(src_bucket.to_string(), src_key.to_string()))
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("object `{}`", src_key)))?;
        let size = data.len() as i64;
        state
            .objects
            .insert((dst_bucket.to_string(), dst_key.to_string()), data);
        Ok(ObjectInfo {
            size,
            content_type: None,
            etag: None,
        })
    }

    async fn upload_part_copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        _dst_bucket: &str,
        _dst_key: &str,
        upload_id: &str,
        part_number: u32,
        range: (u64, u64),
    ) -> BackendResult<PartAck> {
        let mut state = self.lock();
        state.events.push(format!(
            "upload_part_copy:{}:{}-{}",
            part_number, range.0, range.1
        ));
        if state.faults.copy_keys.contains(src_key) {
            return Err(unavailable("copy"));
        }
        let data = state
            .objects
            .get(&(src_bucket.to_string(), src_key.to_string()))
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("object `{}`", src_key)))?;
        let first = (range.0 as usize).min(data.len());
        let last = (range.1 as usize + 1).min(data.len());
        let session = state
            .sessions
            .get_mut(upload_id)
            .ok_or_else(|| BackendError::NotFound(format!("upload `{}`", upload_id)))?;
        session.parts.insert(part_number, data.slice(first..last));
        Ok(PartAck {
            part_number,
            etag: format!("etag-{}", part_number),
        })
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> BackendResult<Vec<String>> {
        let mut state = self.lock();
        for key in keys {
            state.events.push(format!("delete_object:{}/{}", bucket, key));
            state.objects.remove(&(bucket.to_string(), key.clone()));
        }
        Ok(Vec::new())
    }
}

impl FakeCloud {
    fn store_part(
        &self,
        upload_id: &str,
        expected: u32,
        part: UploadPartRequest,
    ) -> BackendResult<PartAck> {
        let mut state = self.lock();
        state.events.push(format!("upload_part:{}", part.part_number));
        if state.faults.part == Some(part.part_number) {
            return Err(unavailable("part"));
        }
        if part.part_number != expected {
            return Err(BackendError::InvalidArgument(format!(
                "expected part {}, got {}",
                expected, part.part_number
            )));
        }
        let len = part.data.len();
        let session = state
            .sessions
            .get_mut(upload_id)
            .ok_or_else(|| BackendError::NotFound(format!("upload `{}`", upload_id)))?;
        session.parts.insert(part.part_number, part.data);
        state.parts.push((part.part_number, len));
        Ok(PartAck {
            part_number: part.part_number,
            etag: format!("etag-{}", part.part_number),
        })
    }
}

#[async_trait]
impl QuotaService for FakeCloud {
    async fn get_owner_quota(&self, owner_id: &str) -> BackendResult<Quota> {
        let mut state = self.lock();
        state.events.push(format!("get_quota:{}", owner_id));
        let limit = state.quotas.get(owner_id).copied().unwrap_or(DEFAULT_QUOTA);
        Ok(Quota {
            owner_id: owner_id.to_string(),
            limit,
            used: state.used_by(owner_id),
        })
    }
}

#[async_trait]
impl UserDirectory for FakeCloud {
    async fn get_user_by_id(&self, user_id: &str) -> BackendResult<User> {
        let state = self.lock();
        if !state.users.contains(user_id) {
            return Err(BackendError::NotFound(format!("user `{}`", user_id)));
        }
        Ok(User {
            id: user_id.to_string(),
            name: user_id.to_string(),
            created_at: Utc::now(),
        })
    }
}

#[async_trait]
impl TransferJournal for FakeCloud {
    async fn save(&self, job: &TransferJob) -> BackendResult<()> {
        let mut state = self.lock();
        state.events.push(format!("journal:{}", job.phase));
        if state.faults.journal_phase == Some(job.phase) {
            return Err(unavailable("journal"));
        }
        state.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn remove(&self, job_id: &str) -> BackendResult<()> {
        let mut state = self.lock();
        if !state.faults.keep_journal {
            state.jobs.remove(job_id);
        }
        Ok(())
    }

    async fn list_unfinished(&self) -> BackendResult<Vec<TransferJob>> {
        Ok(self.lock().jobs.values().cloned().collect())
    }
}
