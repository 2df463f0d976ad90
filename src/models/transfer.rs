//! Bookkeeping for a copy/move saga.
//!
//! A [`TransferJob`] is journaled before every phase so that a restarted
//! gateway can finish or compensate work a crashed process left behind.

use super::file::File;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    Copy,
    Move,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMode::Copy => f.write_str("copy"),
            TransferMode::Move => f.write_str("move"),
        }
    }
}

impl FromStr for TransferMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "copy" => Ok(TransferMode::Copy),
            "move" => Ok(TransferMode::Move),
            other => Err(format!("unknown transfer type `{}`", other)),
        }
    }
}

/// Saga phases, in execution order.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    /// Snapshot taken, destination keys planned, nothing written yet.
    Planned,
    /// Objects are being copied to the destination bucket.
    StorageCopy,
    /// Metadata is being repointed (move) or duplicated (copy).
    MetadataCommit,
    /// Metadata committed; source objects are being deleted (move only).
    SourceCleanup,
}

impl fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferPhase::Planned => "planned",
            TransferPhase::StorageCopy => "storage_copy",
            TransferPhase::MetadataCommit => "metadata_commit",
            TransferPhase::SourceCleanup => "source_cleanup",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Succeeded,
    Failed,
}

/// Outcome of copying one file's object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StorageCopyStatus {
    pub status: StepStatus,
    /// Destination key, planned before the copy starts.
    pub dest_key: String,
}

/// Outcome of repointing or duplicating one file's record.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MetadataStatus {
    pub status: StepStatus,
    /// Id of the record that now represents the file at the destination.
    pub new_file_id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TransferJob {
    pub id: String,
    pub mode: TransferMode,
    pub requester_id: String,
    pub dest_owner_id: String,
    pub dest_bucket: String,
    /// Parent the top-level file lands under at the destination.
    pub new_parent_id: String,
    /// Snapshot of the transferred file followed by all its descendants.
    pub files: Vec<File>,
    /// Key of the upload placeholder reserving destination quota.
    pub placeholder_key: Option<String>,
    pub phase: TransferPhase,
    pub storage: BTreeMap<String, StorageCopyStatus>,
    pub metadata: BTreeMap<String, MetadataStatus>,
    /// Record ids reserved for the copy, in creation order. Journaled before
    /// each record is created, so some may not exist.
    pub created: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferJob {
    pub fn new(
        mode: TransferMode,
        requester_id: impl Into<String>,
        dest_owner_id: impl Into<String>,
        dest_bucket: impl Into<String>,
        new_parent_id: impl Into<String>,
        files: Vec<File>,
    ) -> Self {
        let now = Utc::now();
        let metadata = files
            .iter()
            .map(|f| {
                (
                    f.id.clone(),
                    MetadataStatus {
                        status: StepStatus::Pending,
                        new_file_id: None,
                    },
                )
            })
            .collect();
        Self {
            id: Uuid::new_v4().to_string(),
            mode,
            requester_id: requester_id.into(),
            dest_owner_id: dest_owner_id.into(),
            dest_bucket: dest_bucket.into(),
            new_parent_id: new_parent_id.into(),
            files,
            placeholder_key: None,
            phase: TransferPhase::Planned,
            storage: BTreeMap::new(),
            metadata,
            created: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The file the transfer was requested for.
    pub fn root(&self) -> Option<&File> {
        self.files.first()
    }

    /// Files that own an object in storage.
    pub fn objects(&self) -> impl Iterator<Item = &File> {
        self.files.iter().filter(|f| !f.is_folder())
    }

    pub fn total_size(&self) -> i64 {
        self.objects().map(|f| f.size).sum()
    }

    pub fn plan_copy(&mut self, file_id: impl Into<String>, dest_key: impl Into<String>) {
        self.storage.insert(
            file_id.into(),
            StorageCopyStatus {
                status: StepStatus::Pending,
                dest_key: dest_key.into(),
            },
        );
    }

    pub fn set_storage_status(&mut self, file_id: &str, status: StepStatus) {
        if let Some(entry) = self.storage.get_mut(file_id) {
            entry.status = status;
        }
    }

    pub fn set_metadata_status(
        &mut self,
        file_id: &str,
        status: StepStatus,
        new_file_id: Option<String>,
    ) {
        if let Some(entry) = self.metadata.get_mut(file_id) {
            entry.status = status;
            if new_file_id.is_some() {
                entry.new_file_id = new_file_id;
            }
        }
    }

    pub fn dest_key(&self, file_id: &str) -> Option<&str> {
        self.storage.get(file_id).map(|s| s.dest_key.as_str())
    }

    /// Every planned copy succeeded. Entries left pending count as failures.
    pub fn storage_complete(&self) -> bool {
        self.storage
            .values()
            .all(|s| s.status == StepStatus::Succeeded)
    }

    pub fn metadata_complete(&self) -> bool {
        self.metadata
            .values()
            .all(|s| s.status == StepStatus::Succeeded)
    }

    /// Destination keys whose copy is known to have succeeded.
    pub fn copied_keys(&self) -> Vec<String> {
        self.storage
            .values()
            .filter(|s| s.status == StepStatus::Succeeded)
            .map(|s| s.dest_key.clone())
            .collect()
    }

    /// Every planned destination key, whatever its recorded status.
    pub fn planned_keys(&self) -> Vec<String> {
        self.storage.values().map(|s| s.dest_key.clone()).collect()
    }

    /// Files whose metadata step succeeded.
    pub fn committed_files(&self) -> Vec<&File> {
        self.files
            .iter()
            .filter(|f| {
                self.metadata
                    .get(&f.id)
                    .is_some_and(|m| m.status == StepStatus::Succeeded)
            })
            .collect()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::file::FOLDER_MIME_TYPE;

    fn file(id: &str, parent: &str, size: i64, folder: bool) -> File {
        File {
            id: id.into(),
            owner_id: "alice".into(),
            parent_id: parent.into(),
            bucket: "alice".into(),
            key: if folder { String::new() } else { format!("key-{id}") },
            size,
            mime_type: if folder {
                FOLDER_MIME_TYPE.into()
            } else {
                "text/plain".into()
            },
            name: id.into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn totals_skip_folders() {
        let job = TransferJob::new(
            TransferMode::Copy,
            "alice",
            "bob",
            "bob",
            "",
            vec![
                file("d", "", 0, true),
                file("a", "d", 5, false),
                file("b", "d", 7, false),
            ],
        );
        assert_eq!(job.total_size(), 12);
        assert_eq!(job.objects().count(), 2);
        assert_eq!(job.root().map(|f| f.id.as_str()), Some("d"));
    }

    #[test]
    fn pending_copies_are_not_complete() {
        let mut job = TransferJob::new(
            TransferMode::Move,
            "alice",
            "bob",
            "bob",
            "",
            vec![file("a", "", 1, false), file("b", "", 1, false)],
        );
        job.plan_copy("a", "new-a");
        job.plan_copy("b", "new-b");
        job.set_storage_status("a", StepStatus::Succeeded);

        assert!(!job.storage_complete());
        assert_eq!(job.copied_keys(), vec!["new-a".to_string()]);
        assert_eq!(job.planned_keys().len(), 2);
    }

    #[test]
    fn mode_parses_from_query_values() {
        assert_eq!("COPY".parse::<TransferMode>(), Ok(TransferMode::Copy));
        assert_eq!("move".parse::<TransferMode>(), Ok(TransferMode::Move));
        assert!("swap".parse::<TransferMode>().is_err());
    }
}
