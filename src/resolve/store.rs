use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::IdentifierType;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("identity store misconfigured: {0}")]
    Configuration(String),

    #[error("identity store unreachable during {operation}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("identity store returned {status} during {operation}")]
    Status { operation: &'static str, status: u16 },

    #[error("identity store rejected the service credentials ({status})")]
    Authentication { status: u16 },

    #[error("identity store backend failed during {operation}")]
    Backend {
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("malformed record returned during {operation}")]
    InvalidRecord {
        operation: &'static str,
        #[source]
        source: BoxError,
    },
}

impl StoreError {
    pub fn backend(operation: &'static str, source: impl Into<BoxError>) -> Self {
        StoreError::Backend {
            operation,
            source: source.into(),
        }
    }

    pub fn invalid_record(operation: &'static str, source: impl Into<BoxError>) -> Self {
        StoreError::InvalidRecord {
            operation,
            source: source.into(),
        }
    }
}

/// A group found by name. Only the id is needed to expand it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupRef {
    pub id: String,
    pub name: String,
}

/// Read-only view of an identity provider.
///
/// `User` is the provider's own record type. The resolver never looks inside
/// it; records are only converted to generic maps for the response.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    type User: Serialize + Send + Sync;

    /// Exact-match user lookup. More than one result means the identifier is
    /// ambiguous in this store.
    async fn find_users(
        &self,
        kind: IdentifierType,
        identifier: &str,
    ) -> Result<Vec<Self::User>, StoreError>;

    /// Groups whose name equals `name`, ignoring ASCII case. Partial matches
    /// are never returned.
    async fn find_groups(&self, name: &str) -> Result<Vec<GroupRef>, StoreError>;

    /// Direct members of a group, in the store's member order. Sub-groups are
    /// not expanded.
    async fn group_members(&self, group_id: &str) -> Result<Vec<Self::User>, StoreError>;
}

/// User record shared by the table-backed directories.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(rename = "firstName", default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(rename = "lastName", default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

/// Group record shared by the table-backed directories. `members` holds user
/// ids in membership order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub members: Vec<String>,
}

impl DirectoryGroup {
    pub fn group_ref(&self) -> GroupRef {
        GroupRef {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}
