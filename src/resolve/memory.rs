use std::{
    path::Path,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use serde::Deserialize;

use crate::models::IdentifierType;

use super::store::{DirectoryGroup, DirectoryUser, GroupRef, IdentityStore, StoreError};

/// In-memory directory for local development and testing.
/// Uses `Arc<RwLock<...>>` so it can be `Clone`d and seeded after being
/// handed to the resolver.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    users: Arc<RwLock<Vec<DirectoryUser>>>,
    groups: Arc<RwLock<Vec<DirectoryGroup>>>,
}

#[derive(Deserialize)]
struct DirectorySeed {
    #[serde(default)]
    users: Vec<DirectoryUser>,
    #[serde(default)]
    groups: Vec<DirectoryGroup>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load users and groups from a JSON file of the form
    /// `{"users": [...], "groups": [...]}`.
    pub async fn from_seed_file(path: &Path) -> Result<Self, StoreError> {
        let raw = tokio::fs::read(path)
            .await
            .map_err(|e| StoreError::backend("read directory seed", e))?;
        let seed: DirectorySeed = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::invalid_record("read directory seed", e))?;

        tracing::info!(
            path = %path.display(),
            users = seed.users.len(),
            groups = seed.groups.len(),
            "seeded in-memory directory"
        );

        Ok(Self {
            users: Arc::new(RwLock::new(seed.users)),
            groups: Arc::new(RwLock::new(seed.groups)),
        })
    }

    pub fn with_user(self, user: DirectoryUser) -> Self {
        self.users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(user);
        self
    }

    pub fn with_group(self, group: DirectoryGroup) -> Self {
        self.groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(group);
        self
    }
}

#[async_trait]
impl IdentityStore for MemoryDirectory {
    type User = DirectoryUser;

    async fn find_users(
        &self,
        kind: IdentifierType,
        identifier: &str,
    ) -> Result<Vec<DirectoryUser>, StoreError> {
        let users = self
            .users
            .read()
            .map_err(|e| StoreError::backend("find users", format!("Lock error: {e}")))?;

        Ok(users
            .iter()
            .filter(|user| match kind {
                IdentifierType::Email => user.email.eq_ignore_ascii_case(identifier),
                IdentifierType::Username => user.username == identifier,
            })
            .cloned()
            .collect())
    }

    async fn find_groups(&self, name: &str) -> Result<Vec<GroupRef>, StoreError> {
        let groups = self
            .groups
            .read()
            .map_err(|e| StoreError::backend("find groups", format!("Lock error: {e}")))?;

        Ok(groups
            .iter()
            .filter(|group| group.name.eq_ignore_ascii_case(name))
            .map(DirectoryGroup::group_ref)
            .collect())
    }

    async fn group_members(&self, group_id: &str) -> Result<Vec<DirectoryUser>, StoreError> {
        let member_ids = {
            let groups = self
                .groups
                .read()
                .map_err(|e| StoreError::backend("group members", format!("Lock error: {e}")))?;
            match groups.iter().find(|group| group.id == group_id) {
                Some(group) => group.members.clone(),
                None => return Ok(Vec::new()),
            }
        };

        let users = self
            .users
            .read()
            .map_err(|e| StoreError::backend("group members", format!("Lock error: {e}")))?;

        Ok(member_ids
            .iter()
            .filter_map(|id| users.iter().find(|user| &user.id == id).cloned())
            .collect())
    }
}
