//! Copy/move of a file or folder subtree to another owner.
//!
//! A transfer is a saga over storage and metadata:
//!
//! 1. storage copy: every object is copied to a fresh key in the
//!    destination bucket, in parallel;
//! 2. metadata commit: MOVE repoints the existing records, COPY recreates
//!    the tree depth-first under the destination owner;
//! 3. source cleanup (MOVE only): source objects are deleted once every
//!    record points at the copies.
//!
//! A failing phase compensates its own effects and everything before it. The
//! job is journaled before each phase so [`TransferService::recover`] can
//! finish the work a crashed process left behind.

use crate::{
    backends::{BackendError, BackendResult, Backends, MAX_SINGLE_COPY_BYTES, ObjectStorage},
    errors::{GatewayError, GatewayResult},
    models::{
        bucket::bucket_for_owner,
        file::{File, FilePatch, NewFile, ROOT_PARENT},
        permission::Role,
        transfer::{StepStatus, TransferJob, TransferMode, TransferPhase},
        upload::NewUpload,
    },
    services::permission_resolver::PermissionResolver,
};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::Arc,
};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuotaPolicy {
    /// Refuse transfers that do not fit the destination quota.
    Enforce,
    /// Log the shortfall and transfer anyway.
    ReportOnly,
}

#[derive(Clone, Debug)]
pub struct TransferSettings {
    /// Upper bound on per-file backend calls in flight across all transfers.
    pub concurrency: usize,
    pub quota_policy: QuotaPolicy,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            concurrency: 16,
            quota_policy: QuotaPolicy::Enforce,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TransferRequest {
    pub requester_id: String,
    pub file_id: String,
    pub dest_owner_id: String,
    /// Folder of the destination owner to land in; empty for their root.
    pub new_parent_id: String,
    pub mode: TransferMode,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOutcome {
    /// Id of the transferred file at the destination.
    pub id: String,
    pub mode: TransferMode,
    pub files: usize,
}

struct CopyTask {
    file_id: String,
    src_bucket: String,
    src_key: String,
    dest_key: String,
    size: i64,
}

#[derive(Clone)]
pub struct TransferService {
    backends: Backends,
    resolver: PermissionResolver,
    settings: TransferSettings,
    permits: Arc<Semaphore>,
}

impl TransferService {
    pub fn new(backends: Backends, resolver: PermissionResolver, settings: TransferSettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.concurrency.max(1)));
        Self {
            backends,
            resolver,
            settings,
            permits,
        }
    }

    /// Run a transfer to completion. The saga runs on its own task, so a
    /// caller that goes away does not stop it halfway.
    pub async fn transfer(&self, req: TransferRequest) -> GatewayResult<TransferOutcome> {
        let this = self.clone();
        tokio::spawn(async move { this.run(req).await })
            .await
            .map_err(|err| GatewayError::Internal(format!("transfer task failed: {}", err)))?
    }

    /// Compensate or finish every journaled transfer. Returns how many were
    /// handled.
    pub async fn recover(&self) -> GatewayResult<usize> {
        let jobs = self.backends.journal.list_unfinished().await?;
        let count = jobs.len();
        for job in jobs {
            info!(
                "recovering {} transfer {} left in {}",
                job.mode, job.id, job.phase
            );
            match job.phase {
                TransferPhase::Planned | TransferPhase::StorageCopy => {
                    self.discard_keys(&job, job.planned_keys()).await;
                }
                TransferPhase::MetadataCommit => {
                    match job.mode {
                        TransferMode::Move => {
                            let files: Vec<&File> = job.files.iter().collect();
                            self.revert_moves(&job, &files).await;
                        }
                        TransferMode::Copy => self.discard_created(&job).await,
                    }
                    self.discard_keys(&job, job.planned_keys()).await;
                }
                TransferPhase::SourceCleanup => {
                    self.delete_sources(&job).await;
                    self.drop_stale_grants(&job).await;
                }
            }
            self.finish(&job).await;
        }
        Ok(count)
    }

    async fn run(&self, req: TransferRequest) -> GatewayResult<TransferOutcome> {
        let mut job = self.prepare(&req).await?;
        self.reserve(&mut job).await?;

        let result = match self.checkpoint(&mut job).await {
            Ok(()) => self.execute(&mut job).await,
            Err(err) => Err(err),
        };
        self.finish(&job).await;

        match &result {
            Ok(outcome) => info!(
                "{} of {} to {} finished as {} ({} files)",
                job.mode, req.file_id, job.dest_owner_id, outcome.id, outcome.files
            ),
            Err(err) => warn!("{} of {} to {} failed: {}", job.mode, req.file_id, job.dest_owner_id, err),
        }
        result
    }

    /// Validate, authorize, snapshot the subtree and check capacity. Nothing
    /// is written.
    async fn prepare(&self, req: &TransferRequest) -> GatewayResult<TransferJob> {
        if req.file_id.is_empty() {
            return Err(GatewayError::Validation("fileId is required".into()));
        }
        if req.dest_owner_id.is_empty() {
            return Err(GatewayError::Validation("userId is required".into()));
        }

        let metadata = &self.backends.metadata;
        let file = metadata.get_file_by_id(&req.file_id).await?;
        match req.mode {
            TransferMode::Move => {
                if file.owner_id != req.requester_id {
                    return Err(GatewayError::Forbidden(format!(
                        "only the owner can move {}",
                        file.id
                    )));
                }
                if file.owner_id == req.dest_owner_id {
                    return Err(GatewayError::Validation(format!(
                        "{} is already owned by {}",
                        file.id, req.dest_owner_id
                    )));
                }
            }
            TransferMode::Copy => {
                self.resolver
                    .authorize(&req.requester_id, &file.id, Role::Read)
                    .await?;
            }
        }

        self.backends.users.get_user_by_id(&req.dest_owner_id).await?;
        if req.new_parent_id != ROOT_PARENT {
            self.resolver
                .authorize(&req.dest_owner_id, &req.new_parent_id, Role::Write)
                .await?;
            let parent = metadata.get_file_by_id(&req.new_parent_id).await?;
            if !parent.is_folder() {
                return Err(GatewayError::Validation(format!(
                    "{} is not a folder",
                    parent.id
                )));
            }
        }

        let mut files = vec![file.clone()];
        if file.is_folder() {
            files.extend(metadata.get_descendants_by_id(&file.id).await?);
        }
        if files.iter().any(|f| f.id == req.new_parent_id) {
            return Err(GatewayError::Validation(
                "cannot transfer a folder into itself".into(),
            ));
        }

        let job = TransferJob::new(
            req.mode,
            req.requester_id.clone(),
            req.dest_owner_id.clone(),
            bucket_for_owner(&req.dest_owner_id),
            req.new_parent_id.clone(),
            files,
        );

        let quota = self.backends.quota.get_owner_quota(&job.dest_owner_id).await?;
        let required = job.total_size();
        if !quota.fits(required) {
            match self.settings.quota_policy {
                QuotaPolicy::Enforce => {
                    return Err(GatewayError::ResourceExhausted {
                        required,
                        available: quota.available(),
                    });
                }
                QuotaPolicy::ReportOnly => warn!(
                    "{} needs {} bytes but only {} are available, transferring anyway",
                    job.dest_owner_id,
                    required,
                    quota.available()
                ),
            }
        }
        Ok(job)
    }

    /// Hold the destination quota with a placeholder for the saga's lifetime
    /// and plan every destination key.
    async fn reserve(&self, job: &mut TransferJob) -> GatewayResult<()> {
        let metadata = &self.backends.metadata;
        let root = job
            .root()
            .cloned()
            .ok_or_else(|| GatewayError::Internal("empty transfer".into()))?;

        let key = metadata.generate_key().await?;
        let placeholder = NewUpload {
            key: key.clone(),
            bucket: job.dest_bucket.clone(),
            owner_id: job.dest_owner_id.clone(),
            name: root.name.clone(),
            mime_type: root.mime_type.clone(),
            size: job.total_size(),
            parent_id: job.new_parent_id.clone(),
            file_id: None,
        };
        match metadata.create_upload(placeholder).await {
            Ok(_) => job.placeholder_key = Some(key),
            Err(BackendError::ResourceExhausted(msg))
                if self.settings.quota_policy == QuotaPolicy::ReportOnly =>
            {
                warn!("transfer {} runs without a quota reservation: {}", job.id, msg);
            }
            Err(err) => return Err(err.into()),
        }

        let ids: Vec<String> = job.objects().map(|f| f.id.clone()).collect();
        for id in ids {
            match metadata.generate_key().await {
                Ok(dest_key) => job.plan_copy(id, dest_key),
                Err(err) => {
                    self.finish(job).await;
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    async fn execute(&self, job: &mut TransferJob) -> GatewayResult<TransferOutcome> {
        job.phase = TransferPhase::StorageCopy;
        self.checkpoint(job).await?;
        self.copy_objects(job).await?;

        job.phase = TransferPhase::MetadataCommit;
        if let Err(err) = self.checkpoint(job).await {
            self.discard_keys(job, job.copied_keys()).await;
            return Err(GatewayError::partial(TransferPhase::MetadataCommit, err));
        }
        match job.mode {
            TransferMode::Move => self.repoint(job).await,
            TransferMode::Copy => self.duplicate(job).await,
        }
    }

    async fn copy_objects(&self, job: &mut TransferJob) -> GatewayResult<()> {
        let planned: &TransferJob = job;
        let tasks: Vec<CopyTask> = planned
            .objects()
            .filter_map(|f| {
                Some(CopyTask {
                    file_id: f.id.clone(),
                    src_bucket: f.bucket.clone(),
                    src_key: f.key.clone(),
                    dest_key: planned.dest_key(&f.id)?.to_string(),
                    size: f.size,
                })
            })
            .collect();
        debug!("transfer {} copies {} objects", job.id, tasks.len());

        let storage = Arc::clone(&self.backends.storage);
        let dest_bucket = job.dest_bucket.clone();
        let results = self
            .fan_out(tasks, move |task| {
                let storage = Arc::clone(&storage);
                let dest_bucket = dest_bucket.clone();
                async move {
                    let result = copy_one(storage.as_ref(), &task, &dest_bucket).await;
                    (task.file_id, result)
                }
            })
            .await;

        let mut first_err = None;
        for (file_id, result) in results {
            match result {
                Ok(()) => job.set_storage_status(&file_id, StepStatus::Succeeded),
                Err(err) => {
                    warn!("copy of {} failed: {}", file_id, err);
                    job.set_storage_status(&file_id, StepStatus::Failed);
                    first_err.get_or_insert(err);
                }
            }
        }
        if job.storage_complete() {
            return Ok(());
        }

        self.discard_keys(job, job.copied_keys()).await;
        let cause = first_err
            .map(GatewayError::from)
            .unwrap_or_else(|| GatewayError::Internal("copy worker lost".into()));
        Err(GatewayError::partial(TransferPhase::StorageCopy, cause))
    }

    async fn repoint(&self, job: &mut TransferJob) -> GatewayResult<TransferOutcome> {
        let planned: &TransferJob = job;
        let patches: Vec<(String, FilePatch)> = planned
            .files
            .iter()
            .map(|f| (f.id.clone(), move_patch(planned, f)))
            .collect();
        let results = self.apply_patches(patches).await;

        let mut first_err = None;
        for (file_id, result) in results {
            let result = match result {
                Ok(failed) if failed.is_empty() => Ok(()),
                Ok(_) => Err(BackendError::Internal(format!("update of {} rejected", file_id))),
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => {
                    let id = file_id.clone();
                    job.set_metadata_status(&file_id, StepStatus::Succeeded, Some(id));
                }
                Err(err) => {
                    warn!("repointing {} failed: {}", file_id, err);
                    job.set_metadata_status(&file_id, StepStatus::Failed, None);
                    first_err.get_or_insert(err);
                }
            }
        }

        if !job.metadata_complete() {
            let committed: Vec<File> = job.committed_files().into_iter().cloned().collect();
            let committed: Vec<&File> = committed.iter().collect();
            self.revert_moves(job, &committed).await;
            self.discard_keys(job, job.copied_keys()).await;
            let cause = first_err
                .map(GatewayError::from)
                .unwrap_or_else(|| GatewayError::Internal("metadata worker lost".into()));
            return Err(GatewayError::partial(TransferPhase::MetadataCommit, cause));
        }

        // Sources may only go once the journal says so: recovery of an
        // unfinished commit reverts the records onto them.
        job.phase = TransferPhase::SourceCleanup;
        match self.checkpoint(job).await {
            Ok(()) => {
                self.delete_sources(job).await;
                self.drop_stale_grants(job).await;
            }
            Err(err) => warn!(
                "transfer {} could not journal source cleanup, keeping {} source objects: {}",
                job.id,
                job.objects().count(),
                err
            ),
        }

        Ok(TransferOutcome {
            id: job.root().map(|f| f.id.clone()).unwrap_or_default(),
            mode: job.mode,
            files: job.files.len(),
        })
    }

    async fn duplicate(&self, job: &mut TransferJob) -> GatewayResult<TransferOutcome> {
        let Some(root) = job.root().cloned() else {
            return Err(GatewayError::Internal("empty transfer".into()));
        };
        let mut children: HashMap<String, Vec<File>> = HashMap::new();
        for file in job.files.iter().skip(1) {
            children
                .entry(file.parent_id.clone())
                .or_default()
                .push(file.clone());
        }

        let mut failure = None;
        let mut pending = vec![(root, job.new_parent_id.clone())];
        while let Some((file, parent_id)) = pending.pop() {
            // Journal the record id before the record exists, so recovery
            // can remove it whatever happens after the create call.
            let record_id = Uuid::new_v4().to_string();
            job.created.push(record_id.clone());
            if let Err(err) = self.checkpoint(job).await {
                failure = Some(err);
                break;
            }

            let new_file = NewFile {
                id: Some(record_id),
                owner_id: job.dest_owner_id.clone(),
                parent_id,
                bucket: job.dest_bucket.clone(),
                key: job.dest_key(&file.id).unwrap_or_default().to_string(),
                size: file.size,
                mime_type: file.mime_type.clone(),
                name: file.name.clone(),
            };
            let created = match self.backends.metadata.create_file(new_file).await {
                Ok(created) => created,
                Err(err) => {
                    warn!("recreating {} failed: {}", file.id, err);
                    job.set_metadata_status(&file.id, StepStatus::Failed, None);
                    failure = Some(GatewayError::from(err));
                    break;
                }
            };

            job.set_metadata_status(&file.id, StepStatus::Succeeded, Some(created.id.clone()));
            if let Some(kids) = children.remove(&file.id) {
                pending.extend(kids.into_iter().rev().map(|kid| (kid, created.id.clone())));
            }
        }

        if failure.is_none() && !job.metadata_complete() {
            failure = Some(GatewayError::Internal(
                "snapshot holds files outside the transferred tree".into(),
            ));
        }
        if let Some(err) = failure {
            self.discard_created(job).await;
            self.discard_keys(job, job.copied_keys()).await;
            return Err(GatewayError::partial(TransferPhase::MetadataCommit, err));
        }

        Ok(TransferOutcome {
            id: job.created.first().cloned().unwrap_or_default(),
            mode: job.mode,
            files: job.created.len(),
        })
    }

    /// Run `work` for every item, at most `concurrency` at a time across the
    /// whole process. Results come back in completion order.
    async fn fan_out<T, O, F, Fut>(&self, items: Vec<T>, work: F) -> Vec<O>
    where
        T: Send + 'static,
        O: Send + 'static,
        F: Fn(T) -> Fut,
        Fut: Future<Output = O> + Send + 'static,
    {
        let mut set = JoinSet::new();
        for item in items {
            let permits = Arc::clone(&self.permits);
            let fut = work(item);
            set.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                fut.await
            });
        }

        let mut results = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => warn!("transfer worker failed: {}", err),
            }
        }
        results
    }

    async fn apply_patches(
        &self,
        patches: Vec<(String, FilePatch)>,
    ) -> Vec<(String, BackendResult<Vec<String>>)> {
        let metadata = Arc::clone(&self.backends.metadata);
        self.fan_out(patches, move |(file_id, patch)| {
            let metadata = Arc::clone(&metadata);
            async move {
                let result = metadata
                    .update_files(std::slice::from_ref(&file_id), &patch)
                    .await;
                (file_id, result)
            }
        })
        .await
    }

    async fn checkpoint(&self, job: &mut TransferJob) -> GatewayResult<()> {
        job.touch();
        self.backends.journal.save(job).await?;
        Ok(())
    }

    /// Release the quota placeholder and forget the job.
    async fn finish(&self, job: &TransferJob) {
        if let Some(key) = &job.placeholder_key {
            if let Err(err) = self
                .backends
                .metadata
                .delete_upload_by_key(key, &job.dest_bucket)
                .await
            {
                if !err.is_not_found() {
                    warn!("failed to release placeholder of transfer {}: {}", job.id, err);
                }
            }
        }
        if let Err(err) = self.backends.journal.remove(&job.id).await {
            warn!("failed to drop transfer {} from the journal: {}", job.id, err);
        }
    }

    async fn discard_keys(&self, job: &TransferJob, keys: Vec<String>) {
        if keys.is_empty() {
            return;
        }
        match self
            .backends
            .storage
            .delete_objects(&job.dest_bucket, &keys)
            .await
        {
            Ok(failed) if failed.is_empty() => {
                debug!("transfer {} discarded {} copies", job.id, keys.len())
            }
            Ok(failed) => warn!(
                "transfer {} left {} orphaned copies in {}",
                job.id,
                failed.len(),
                job.dest_bucket
            ),
            Err(err) => warn!("transfer {} could not discard copies: {}", job.id, err),
        }
    }

    /// Delete the records a COPY created, children first.
    async fn discard_created(&self, job: &TransferJob) {
        for id in job.created.iter().rev() {
            match self.backends.metadata.delete_file(id).await {
                Ok(_) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => warn!("transfer {} left record {} behind: {}", job.id, id, err),
            }
        }
    }

    async fn revert_moves(&self, job: &TransferJob, files: &[&File]) {
        let patches: Vec<(String, FilePatch)> = files
            .iter()
            .map(|f| (f.id.clone(), move_patch(job, f).inverse(f)))
            .collect();
        let results = self.apply_patches(patches).await;

        for (file_id, result) in results {
            match result {
                Ok(failed) if failed.is_empty() => {}
                Ok(_) => warn!("transfer {} could not restore {}", job.id, file_id),
                Err(err) => warn!("transfer {} could not restore {}: {}", job.id, file_id, err),
            }
        }
    }

    async fn delete_sources(&self, job: &TransferJob) {
        let mut by_bucket: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for file in job.objects() {
            by_bucket
                .entry(file.bucket.as_str())
                .or_default()
                .push(file.key.clone());
        }
        for (bucket, keys) in by_bucket {
            match self.backends.storage.delete_objects(bucket, &keys).await {
                Ok(failed) if failed.is_empty() => {}
                Ok(failed) => warn!(
                    "transfer {} left {} source objects in {}",
                    job.id,
                    failed.len(),
                    bucket
                ),
                Err(err) => warn!("transfer {} could not delete sources: {}", job.id, err),
            }
        }
    }

    /// The new owner's explicit grants on moved files would shadow ownership.
    async fn drop_stale_grants(&self, job: &TransferJob) {
        let ids: Vec<String> = job.files.iter().map(|f| f.id.clone()).collect();
        let permissions = Arc::clone(&self.backends.permissions);
        let dest_owner = job.dest_owner_id.clone();
        let results = self
            .fan_out(ids, move |file_id| {
                let permissions = Arc::clone(&permissions);
                let dest_owner = dest_owner.clone();
                async move {
                    let result = permissions.delete_permission(&file_id, &dest_owner).await;
                    (file_id, result)
                }
            })
            .await;

        for (file_id, result) in results {
            match result {
                Ok(_) => debug!("dropped grant of {} on {}", job.dest_owner_id, file_id),
                Err(err) if err.is_not_found() => {}
                Err(err) => warn!("could not drop grant on {}: {}", file_id, err),
            }
        }
    }
}

/// Patch moving `file` to the destination of `job`.
fn move_patch(job: &TransferJob, file: &File) -> FilePatch {
    let is_root = job.root().is_some_and(|root| root.id == file.id);
    FilePatch {
        owner_id: Some(job.dest_owner_id.clone()),
        bucket: Some(job.dest_bucket.clone()),
        key: job.dest_key(&file.id).map(str::to_string),
        parent_id: is_root.then(|| job.new_parent_id.clone()),
        ..Default::default()
    }
}

async fn copy_one(storage: &dyn ObjectStorage, task: &CopyTask, dest_bucket: &str) -> BackendResult<()> {
    if (task.size as u64) <= MAX_SINGLE_COPY_BYTES {
        storage
            .copy_object(&task.src_bucket, &task.src_key, dest_bucket, &task.dest_key)
            .await?;
        return Ok(());
    }

    let upload_id = storage.upload_init(dest_bucket, &task.dest_key, None).await?;
    let copied = copy_ranges(storage, task, dest_bucket, &upload_id).await;
    if copied.is_err() {
        if let Err(err) = storage.upload_abort(dest_bucket, &task.dest_key, &upload_id).await {
            warn!("failed to abort part copy {}: {}", upload_id, err);
        }
    }
    copied
}

/// Copy an object too large for a single copy as a series of ranged parts.
async fn copy_ranges(
    storage: &dyn ObjectStorage,
    task: &CopyTask,
    dest_bucket: &str,
    upload_id: &str,
) -> BackendResult<()> {
    let size = task.size as u64;
    let mut first = 0;
    let mut part_number = 0;
    while first < size {
        let last = (first + MAX_SINGLE_COPY_BYTES).min(size) - 1;
        part_number += 1;
        storage
            .upload_part_copy(
                &task.src_bucket,
                &task.src_key,
                dest_bucket,
                &task.dest_key,
                upload_id,
                part_number,
                (first, last),
            )
            .await?;
        first = last + 1;
    }
    storage
        .upload_complete(dest_bucket, &task.dest_key, upload_id)
        .await?;
    Ok(())
}
