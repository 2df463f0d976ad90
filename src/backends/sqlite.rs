//! src/backends/sqlite.rs
//!
//! SqliteBackend — local stand-in for the metadata, permission, quota, user
//! directory and journal services, backed by one SQLite database.

use super::{
    BackendError, BackendResult, MetadataService, PermissionService, QuotaService,
    TransferJournal, UserDirectory,
};
use crate::models::{
    file::{FOLDER_MIME_TYPE, File, FilePatch, NewFile},
    permission::{Permission, Role},
    quota::{Quota, User},
    transfer::TransferJob,
    upload::{NewUpload, Upload},
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{FromRow, QueryBuilder, SqliteConnection, SqlitePool, sqlite::Sqlite};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Schema applied by [`SqliteBackend::migrate`].
pub const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");

const FILE_COLUMNS: &str =
    "id, owner_id, parent_id, bucket, key, size, mime_type, name, created_at, updated_at";
const UPLOAD_COLUMNS: &str =
    "key, bucket, upload_id, owner_id, name, mime_type, size, parent_id, file_id, created_at";

#[derive(Clone)]
pub struct SqliteBackend {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,

    /// Quota limit for owners without a row in `quotas`.
    default_quota: i64,
}

#[derive(FromRow)]
struct PermissionRow {
    file_id: String,
    user_id: String,
    role: String,
    creator_id: String,
}

impl TryFrom<PermissionRow> for Permission {
    type Error = BackendError;

    fn try_from(row: PermissionRow) -> Result<Self, Self::Error> {
        let role = row.role.parse::<Role>().map_err(BackendError::Internal)?;
        Ok(Permission {
            file_id: row.file_id,
            user_id: row.user_id,
            role,
            creator_id: row.creator_id,
        })
    }
}

impl SqliteBackend {
    pub fn new(db: Arc<SqlitePool>, default_quota: i64) -> Self {
        Self { db, default_quota }
    }

    /// Run the embedded schema statements. Every statement is idempotent.
    pub async fn migrate(&self) -> BackendResult<usize> {
        let statements = MIGRATION_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(statements.len())
    }

    /// Register a user in the directory if it is not known yet.
    pub async fn ensure_user(&self, id: &str, name: &str) -> BackendResult<()> {
        sqlx::query(
            "INSERT INTO users (id, name, created_at) VALUES (?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(id)
        .bind(name)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn quota_on(&self, conn: &mut SqliteConnection, owner_id: &str) -> BackendResult<Quota> {
        let limit: Option<i64> =
            sqlx::query_scalar("SELECT limit_bytes FROM quotas WHERE owner_id = ?")
                .bind(owner_id)
                .fetch_optional(&mut *conn)
                .await?;

        let used: i64 = sqlx::query_scalar(
            "SELECT (SELECT COALESCE(SUM(size), 0) FROM files WHERE owner_id = ? AND mime_type != ?)
                  + (SELECT COALESCE(SUM(size), 0) FROM uploads WHERE owner_id = ?)",
        )
        .bind(owner_id)
        .bind(FOLDER_MIME_TYPE)
        .bind(owner_id)
        .fetch_one(&mut *conn)
        .await?;

        Ok(Quota {
            owner_id: owner_id.to_string(),
            limit: limit.unwrap_or(self.default_quota),
            used,
        })
    }
}

/// Map a missing row to `NotFound(what)`.
fn not_found(what: impl FnOnce() -> String) -> impl FnOnce(sqlx::Error) -> BackendError {
    move |err| match err {
        sqlx::Error::RowNotFound => BackendError::NotFound(what()),
        other => BackendError::Sqlx(other),
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[async_trait]
impl MetadataService for SqliteBackend {
    async fn get_file_by_id(&self, id: &str) -> BackendResult<File> {
        sqlx::query_as::<_, File>(&format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?"))
            .bind(id)
            .fetch_one(&*self.db)
            .await
            .map_err(not_found(|| format!("file `{}`", id)))
    }

    async fn get_descendants_by_id(&self, folder_id: &str) -> BackendResult<Vec<File>> {
        // UNION (not UNION ALL) keeps a corrupted, cyclic parent chain finite.
        let sql = format!(
            "WITH RECURSIVE tree(id) AS (
                 SELECT id FROM files WHERE parent_id = ?
                 UNION
                 SELECT f.id FROM files f JOIN tree ON f.parent_id = tree.id
             )
             SELECT {FILE_COLUMNS} FROM files WHERE id IN (SELECT id FROM tree) AND id != ?"
        );
        let rows = sqlx::query_as::<_, File>(&sql)
            .bind(folder_id)
            .bind(folder_id)
            .fetch_all(&*self.db)
            .await?;
        Ok(rows)
    }

    async fn create_file(&self, file: NewFile) -> BackendResult<File> {
        let now = Utc::now();
        let sql = format!(
            "INSERT INTO files (id, owner_id, parent_id, bucket, key, size, mime_type, name,
                                created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {FILE_COLUMNS}"
        );
        let id = file.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let created = sqlx::query_as::<_, File>(&sql)
            .bind(id)
            .bind(&file.owner_id)
            .bind(&file.parent_id)
            .bind(&file.bucket)
            .bind(&file.key)
            .bind(file.size)
            .bind(&file.mime_type)
            .bind(&file.name)
            .bind(now)
            .bind(now)
            .fetch_one(&*self.db)
            .await?;
        Ok(created)
    }

    async fn create_upload(&self, upload: NewUpload) -> BackendResult<Upload> {
        let mut tx = self.db.begin().await?;
        let quota = self.quota_on(&mut tx, &upload.owner_id).await?;
        if !quota.fits(upload.size) {
            return Err(BackendError::ResourceExhausted(format!(
                "owner `{}` has {} bytes available, {} requested",
                upload.owner_id,
                quota.available(),
                upload.size
            )));
        }

        let sql = format!(
            "INSERT INTO uploads (key, bucket, upload_id, owner_id, name, mime_type, size,
                                  parent_id, file_id, created_at)
             VALUES (?, ?, NULL, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {UPLOAD_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, Upload>(&sql)
            .bind(&upload.key)
            .bind(&upload.bucket)
            .bind(&upload.owner_id)
            .bind(&upload.name)
            .bind(&upload.mime_type)
            .bind(upload.size)
            .bind(&upload.parent_id)
            .bind(&upload.file_id)
            .bind(Utc::now())
            .fetch_one(&mut *tx)
            .await;

        let created = match inserted {
            Ok(row) => row,
            Err(err) if is_unique_violation(&err) => {
                return Err(BackendError::AlreadyExists(format!(
                    "upload `{}/{}`",
                    upload.bucket, upload.key
                )));
            }
            Err(err) => return Err(err.into()),
        };
        tx.commit().await?;
        Ok(created)
    }

    async fn get_upload_by_id(&self, upload_id: &str) -> BackendResult<Upload> {
        sqlx::query_as::<_, Upload>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM uploads WHERE upload_id = ?"
        ))
        .bind(upload_id)
        .fetch_one(&*self.db)
        .await
        .map_err(not_found(|| format!("upload `{}`", upload_id)))
    }

    async fn update_upload_id(
        &self,
        key: &str,
        bucket: &str,
        upload_id: &str,
    ) -> BackendResult<()> {
        let result = sqlx::query("UPDATE uploads SET upload_id = ? WHERE key = ? AND bucket = ?")
            .bind(upload_id)
            .bind(key)
            .bind(bucket)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BackendError::NotFound(format!("upload `{}/{}`", bucket, key)));
        }
        Ok(())
    }

    async fn delete_upload_by_id(&self, upload_id: &str) -> BackendResult<Upload> {
        sqlx::query_as::<_, Upload>(&format!(
            "DELETE FROM uploads WHERE upload_id = ? RETURNING {UPLOAD_COLUMNS}"
        ))
        .bind(upload_id)
        .fetch_one(&*self.db)
        .await
        .map_err(not_found(|| format!("upload `{}`", upload_id)))
    }

    async fn delete_upload_by_key(&self, key: &str, bucket: &str) -> BackendResult<Upload> {
        sqlx::query_as::<_, Upload>(&format!(
            "DELETE FROM uploads WHERE key = ? AND bucket = ? RETURNING {UPLOAD_COLUMNS}"
        ))
        .bind(key)
        .bind(bucket)
        .fetch_one(&*self.db)
        .await
        .map_err(not_found(|| format!("upload `{}/{}`", bucket, key)))
    }

    async fn update_files(&self, ids: &[String], patch: &FilePatch) -> BackendResult<Vec<String>> {
        if patch.is_empty() {
            return Err(BackendError::InvalidArgument("empty file patch".into()));
        }
        let mut failed = Vec::new();
        for id in ids {
            let mut builder = QueryBuilder::<Sqlite>::new("UPDATE files SET updated_at = ");
            builder.push_bind(Utc::now());
            if let Some(owner_id) = &patch.owner_id {
                builder.push(", owner_id = ");
                builder.push_bind(owner_id);
            }
            if let Some(parent_id) = &patch.parent_id {
                builder.push(", parent_id = ");
                builder.push_bind(parent_id);
            }
            if let Some(bucket) = &patch.bucket {
                builder.push(", bucket = ");
                builder.push_bind(bucket);
            }
            if let Some(key) = &patch.key {
                builder.push(", key = ");
                builder.push_bind(key);
            }
            if let Some(size) = patch.size {
                builder.push(", size = ");
                builder.push_bind(size);
            }
            if let Some(mime_type) = &patch.mime_type {
                builder.push(", mime_type = ");
                builder.push_bind(mime_type);
            }
            builder.push(" WHERE id = ");
            builder.push_bind(id);

            match builder.build().execute(&*self.db).await {
                Ok(result) if result.rows_affected() == 1 => {}
                Ok(_) => failed.push(id.clone()),
                Err(err) => {
                    debug!("update of file {} failed: {}", id, err);
                    failed.push(id.clone());
                }
            }
        }
        Ok(failed)
    }

    async fn delete_file(&self, id: &str) -> BackendResult<File> {
        let mut tx = self.db.begin().await?;
        let deleted = sqlx::query_as::<_, File>(&format!(
            "DELETE FROM files WHERE id = ? RETURNING {FILE_COLUMNS}"
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(not_found(|| format!("file `{}`", id)))?;

        sqlx::query("DELETE FROM permissions WHERE file_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn generate_key(&self) -> BackendResult<String> {
        Ok(Uuid::new_v4().simple().to_string())
    }
}

#[async_trait]
impl PermissionService for SqliteBackend {
    async fn is_permitted(&self, file_id: &str, user_id: &str, role: Role) -> BackendResult<bool> {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT role FROM permissions WHERE file_id = ? AND user_id = ?")
                .bind(file_id)
                .bind(user_id)
                .fetch_optional(&*self.db)
                .await?;

        match stored {
            None => Err(BackendError::NotFound(format!(
                "permission of `{}` on `{}`",
                user_id, file_id
            ))),
            Some(value) => {
                let granted = value.parse::<Role>().map_err(BackendError::Internal)?;
                Ok(granted.satisfies(role))
            }
        }
    }

    async fn get_permission(&self, file_id: &str, user_id: &str) -> BackendResult<Permission> {
        sqlx::query_as::<_, PermissionRow>(
            "SELECT file_id, user_id, role, creator_id FROM permissions
             WHERE file_id = ? AND user_id = ?",
        )
        .bind(file_id)
        .bind(user_id)
        .fetch_one(&*self.db)
        .await
        .map_err(not_found(|| {
            format!("permission of `{}` on `{}`", user_id, file_id)
        }))?
        .try_into()
    }

    async fn create_permission(&self, permission: Permission) -> BackendResult<Permission> {
        if permission.role == Role::Owner {
            return Err(BackendError::InvalidArgument(
                "owner role is implied by ownership and cannot be granted".into(),
            ));
        }
        sqlx::query(
            "INSERT INTO permissions (file_id, user_id, role, creator_id) VALUES (?, ?, ?, ?)
             ON CONFLICT(file_id, user_id) DO UPDATE SET
                 role = excluded.role,
                 creator_id = excluded.creator_id",
        )
        .bind(&permission.file_id)
        .bind(&permission.user_id)
        .bind(permission.role.as_str())
        .bind(&permission.creator_id)
        .execute(&*self.db)
        .await?;
        Ok(permission)
    }

    async fn delete_permission(&self, file_id: &str, user_id: &str) -> BackendResult<Permission> {
        sqlx::query_as::<_, PermissionRow>(
            "DELETE FROM permissions WHERE file_id = ? AND user_id = ?
             RETURNING file_id, user_id, role, creator_id",
        )
        .bind(file_id)
        .bind(user_id)
        .fetch_one(&*self.db)
        .await
        .map_err(not_found(|| {
            format!("permission of `{}` on `{}`", user_id, file_id)
        }))?
        .try_into()
    }
}

#[async_trait]
impl QuotaService for SqliteBackend {
    async fn get_owner_quota(&self, owner_id: &str) -> BackendResult<Quota> {
        let mut conn = self.db.acquire().await?;
        self.quota_on(&mut conn, owner_id).await
    }
}

#[async_trait]
impl UserDirectory for SqliteBackend {
    async fn get_user_by_id(&self, user_id: &str) -> BackendResult<User> {
        sqlx::query_as::<_, User>("SELECT id, name, created_at FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_one(&*self.db)
            .await
            .map_err(not_found(|| format!("user `{}`", user_id)))
    }
}

#[async_trait]
impl TransferJournal for SqliteBackend {
    async fn save(&self, job: &TransferJob) -> BackendResult<()> {
        let body = serde_json::to_string(job)
            .map_err(|err| BackendError::Internal(format!("encoding transfer job: {}", err)))?;
        sqlx::query(
            "INSERT INTO transfer_jobs (id, phase, body, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 phase = excluded.phase,
                 body = excluded.body,
                 updated_at = excluded.updated_at",
        )
        .bind(&job.id)
        .bind(job.phase.to_string())
        .bind(body)
        .bind(job.updated_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn remove(&self, job_id: &str) -> BackendResult<()> {
        sqlx::query("DELETE FROM transfer_jobs WHERE id = ?")
            .bind(job_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    async fn list_unfinished(&self) -> BackendResult<Vec<TransferJob>> {
        let bodies: Vec<(String, String)> =
            sqlx::query_as("SELECT id, body FROM transfer_jobs ORDER BY updated_at ASC")
                .fetch_all(&*self.db)
                .await?;

        let mut jobs = Vec::with_capacity(bodies.len());
        for (id, body) in bodies {
            match serde_json::from_str::<TransferJob>(&body) {
                Ok(job) => jobs.push(job),
                Err(err) => warn!("skipping unreadable transfer job {}: {}", id, err),
            }
        }
        Ok(jobs)
    }
}
