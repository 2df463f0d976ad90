//! Effective-role resolution over the file hierarchy.
//!
//! The closest node carrying an explicit permission record for the user
//! decides the outcome. Only the *absence* of a record at a node lets the walk
//! continue to its parent; an insufficient record stops it, so a folder can
//! revoke access its ancestors would otherwise grant.

use crate::{
    backends::{BackendError, Backends},
    errors::{GatewayError, GatewayResult},
    models::{
        file::ROOT_PARENT,
        permission::{Permission, Role},
    },
};
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Granted {
        role: Role,
        /// The explicit record that granted access. `None` for ownership.
        record: Option<Permission>,
    },
    Denied,
}

impl Resolution {
    fn owner() -> Self {
        Resolution::Granted {
            role: Role::Owner,
            record: None,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Resolution::Granted { role, .. } => *role,
            Resolution::Denied => Role::None,
        }
    }

    pub fn allows(&self, required: Role) -> bool {
        matches!(self, Resolution::Granted { role, .. } if role.satisfies(required))
    }
}

/// What one level of the hierarchy says about the user.
#[derive(Debug)]
enum LevelOutcome {
    Granted(Permission),
    Denied,
    /// No record for the user at this node.
    Unset,
}

#[derive(Clone)]
pub struct PermissionResolver {
    backends: Backends,
    max_depth: usize,
}

impl PermissionResolver {
    pub fn new(backends: Backends, max_depth: usize) -> Self {
        Self {
            backends,
            max_depth: max_depth.max(1),
        }
    }

    /// Resolve the role `user_id` holds on `file_id` for an operation that
    /// needs `required`.
    pub async fn resolve(
        &self,
        user_id: &str,
        file_id: &str,
        required: Role,
    ) -> GatewayResult<Resolution> {
        if file_id == ROOT_PARENT {
            return Ok(Resolution::owner());
        }

        let file = self.backends.metadata.get_file_by_id(file_id).await?;
        if file.owner_id == user_id {
            return Ok(Resolution::owner());
        }

        let mut node = file.id;
        let mut parent = file.parent_id;
        for _ in 0..self.max_depth {
            match self.level(user_id, &node, required).await? {
                LevelOutcome::Granted(record) => {
                    debug!("{} granted {} on {} via {}", user_id, record.role, file_id, node);
                    return Ok(Resolution::Granted {
                        role: record.role,
                        record: Some(record),
                    });
                }
                LevelOutcome::Denied => {
                    debug!("{} denied on {} by record at {}", user_id, file_id, node);
                    return Ok(Resolution::Denied);
                }
                LevelOutcome::Unset => {}
            }

            if parent == ROOT_PARENT {
                return Ok(Resolution::Denied);
            }
            let next = self.backends.metadata.get_file_by_id(&parent).await?;
            node = next.id;
            parent = next.parent_id;
        }

        Err(GatewayError::Internal(format!(
            "permission walk for {} exceeded {} levels",
            file_id, self.max_depth
        )))
    }

    /// Resolve and turn anything short of `required` into `Forbidden`.
    pub async fn authorize(
        &self,
        user_id: &str,
        file_id: &str,
        required: Role,
    ) -> GatewayResult<Resolution> {
        let resolution = self.resolve(user_id, file_id, required).await?;
        if resolution.allows(required) {
            Ok(resolution)
        } else {
            Err(GatewayError::Forbidden(format!(
                "{} role required on {}, caller has {}",
                required,
                file_id,
                resolution.role()
            )))
        }
    }

    async fn level(&self, user_id: &str, node: &str, required: Role) -> GatewayResult<LevelOutcome> {
        let permissions = &self.backends.permissions;
        match permissions.is_permitted(node, user_id, required).await {
            Ok(true) => {
                let record = permissions.get_permission(node, user_id).await?;
                Ok(LevelOutcome::Granted(record))
            }
            Ok(false) => Ok(LevelOutcome::Denied),
            Err(BackendError::NotFound(_)) => Ok(LevelOutcome::Unset),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeCloud;

    fn resolver(cloud: &FakeCloud) -> PermissionResolver {
        PermissionResolver::new(cloud.backends(), 16)
    }

    #[tokio::test]
    async fn root_is_owned_without_backend_calls() {
        let cloud = FakeCloud::new();
        let resolution = resolver(&cloud).resolve("anyone", "", Role::Write).await.unwrap();

        assert_eq!(resolution.role(), Role::Owner);
        assert!(cloud.events().is_empty());
    }

    #[tokio::test]
    async fn owner_wins_over_records() {
        let cloud = FakeCloud::new();
        let file = cloud.add_file("alice", "", "doc", 1);
        cloud.grant(&file.id, "alice", Role::Read);

        let resolution = resolver(&cloud)
            .resolve("alice", &file.id, Role::Write)
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::owner());
    }

    #[tokio::test]
    async fn absent_record_climbs_to_parent_grant() {
        let cloud = FakeCloud::new();
        let parent = cloud.add_folder("alice", "", "shared");
        let file = cloud.add_file("alice", &parent.id, "doc", 1);
        cloud.grant(&parent.id, "bob", Role::Read);

        let resolution = resolver(&cloud)
            .resolve("bob", &file.id, Role::Read)
            .await
            .unwrap();
        match resolution {
            Resolution::Granted { role, record } => {
                assert_eq!(role, Role::Read);
                assert_eq!(record.map(|r| r.file_id), Some(parent.id));
            }
            Resolution::Denied => panic!("expected a grant"),
        }
    }

    #[tokio::test]
    async fn explicit_record_stops_the_walk() {
        let cloud = FakeCloud::new();
        let parent = cloud.add_folder("alice", "", "shared");
        let file = cloud.add_file("alice", &parent.id, "doc", 1);
        cloud.grant(&file.id, "bob", Role::Read);
        cloud.grant(&parent.id, "bob", Role::Write);

        let resolution = resolver(&cloud)
            .resolve("bob", &file.id, Role::Write)
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Denied);

        let checked_parent = cloud
            .events()
            .iter()
            .any(|e| e == &format!("is_permitted:{}", parent.id));
        assert!(!checked_parent, "walk must not reach the parent");
    }

    #[tokio::test]
    async fn no_record_anywhere_is_denied() {
        let cloud = FakeCloud::new();
        let parent = cloud.add_folder("alice", "", "private");
        let file = cloud.add_file("alice", &parent.id, "doc", 1);

        let resolution = resolver(&cloud)
            .resolve("bob", &file.id, Role::Read)
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Denied);
        assert!(resolver(&cloud).authorize("bob", &file.id, Role::Read).await.is_err());
    }

    #[tokio::test]
    async fn cyclic_parent_chain_is_bounded() {
        let cloud = FakeCloud::new();
        let a = cloud.add_folder("alice", "", "a");
        let b = cloud.add_folder("alice", &a.id, "b");
        cloud.set_parent(&a.id, &b.id);

        let err = PermissionResolver::new(cloud.backends(), 8)
            .resolve("bob", &b.id, Role::Read)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
    }

    #[tokio::test]
    async fn backend_failures_surface_as_upstream() {
        let cloud = FakeCloud::new();
        let file = cloud.add_file("alice", "", "doc", 1);
        cloud.fail_permission_checks();

        let err = resolver(&cloud)
            .resolve("bob", &file.id, Role::Read)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Upstream(BackendError::Unavailable(_))));
    }
}
