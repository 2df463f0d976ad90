//! Storage quota of an owner and the users known to the directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Capacity of an owner, in bytes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Quota {
    pub owner_id: String,
    pub limit: i64,
    /// Bytes held by files plus bytes reserved by upload placeholders.
    pub used: i64,
}

impl Quota {
    pub fn available(&self) -> i64 {
        (self.limit - self.used).max(0)
    }

    pub fn fits(&self, size: i64) -> bool {
        size <= self.available()
    }
}

/// A user known to the user directory.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}
