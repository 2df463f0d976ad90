//! Roles and explicit permission grants.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Permission level a user holds on a file, ordered by privilege.
///
/// `Owner` is never stored in a permission record; it is implied when the
/// user owns the file (or for the user's own root).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    None,
    Read,
    Write,
    Owner,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::None => "NONE",
            Role::Read => "READ",
            Role::Write => "WRITE",
            Role::Owner => "OWNER",
        }
    }

    pub fn satisfies(self, required: Role) -> bool {
        self >= required
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "NONE" => Ok(Role::None),
            "READ" => Ok(Role::Read),
            "WRITE" => Ok(Role::Write),
            "OWNER" => Ok(Role::Owner),
            other => Err(format!("unknown role `{}`", other)),
        }
    }
}

/// An explicit grant of `role` on `file_id` to `user_id`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub file_id: String,
    pub user_id: String,
    pub role: Role,
    /// User that created the grant.
    pub creator_id: String,
}
