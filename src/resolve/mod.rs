//! Identity resolution.
//!
//! Maps loosely typed identity claims (an email address, a username) onto the
//! identity provider's canonical records. An email that matches no user may
//! name a group instead, in which case the group's direct members are
//! returned.

pub mod dynamo;
pub mod keycloak;
pub mod memory;
pub mod store;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    models::{EntityIdentifier, EntityResolution, EntityResolutionRequest, IdentifierType},
    representation::{to_generic_map, RepresentationError},
};

use self::store::{IdentityStore, StoreError};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("at least one entity identifier is required")]
    EmptyRequest,

    #[error("type required for identifier '{identifier}'")]
    TypeRequired { identifier: String },

    #[error("unknown type '{kind}' for identifier '{identifier}'")]
    UnsupportedType { kind: String, identifier: String },

    #[error("looking up identity records")]
    Store(#[from] StoreError),

    #[error("serializing entity representation")]
    Representation(#[from] RepresentationError),
}

impl ResolveError {
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ResolveError::EmptyRequest
                | ResolveError::TypeRequired { .. }
                | ResolveError::UnsupportedType { .. }
        )
    }
}

/// Object-safe entry point so the HTTP layer does not need to know which
/// store backs the resolver.
#[async_trait]
pub trait EntityResolve: Send + Sync {
    async fn resolve(
        &self,
        request: &EntityResolutionRequest,
    ) -> Result<Vec<EntityResolution>, ResolveError>;
}

pub struct EntityResolver<S> {
    store: S,
}

impl<S: IdentityStore> EntityResolver<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    async fn resolve_one(
        &self,
        kind: IdentifierType,
        identifier: &str,
    ) -> Result<Vec<Map<String, Value>>, ResolveError> {
        let users = self.store.find_users(kind, identifier).await?;

        let records = match users.len() {
            1 => {
                tracing::debug!(identifier, "user found");
                users
            }
            0 if kind == IdentifierType::Email => self.expand_group(identifier).await?,
            0 => {
                tracing::debug!(identifier, "no user found");
                Vec::new()
            }
            count => {
                tracing::warn!(identifier, count, "ambiguous user lookup, leaving unresolved");
                Vec::new()
            }
        };

        records
            .iter()
            .map(|record| to_generic_map(record).map_err(ResolveError::from))
            .collect()
    }

    async fn expand_group(&self, name: &str) -> Result<Vec<S::User>, ResolveError> {
        let groups = self.store.find_groups(name).await?;

        match groups.as_slice() {
            [group] => {
                let members = self.store.group_members(&group.id).await?;
                tracing::debug!(
                    group_id = %group.id,
                    members = members.len(),
                    "expanded group"
                );
                Ok(members)
            }
            [] => {
                tracing::debug!(name, "no user or group found");
                Ok(Vec::new())
            }
            _ => {
                tracing::warn!(
                    name,
                    matches = groups.len(),
                    "ambiguous group lookup, leaving unresolved"
                );
                Ok(Vec::new())
            }
        }
    }
}

#[async_trait]
impl<S: IdentityStore> EntityResolve for EntityResolver<S> {
    async fn resolve(
        &self,
        request: &EntityResolutionRequest,
    ) -> Result<Vec<EntityResolution>, ResolveError> {
        let validated = validate_request(request)?;

        let mut resolutions = Vec::with_capacity(validated.len());
        for (kind, original) in validated {
            tracing::debug!(kind = kind.as_str(), identifier = %original.identifier, "resolving entity");
            let representations = self.resolve_one(kind, &original.identifier).await?;
            resolutions.push(EntityResolution {
                original_identifier: original.clone(),
                representations,
            });
        }

        Ok(resolutions)
    }
}

/// Check every identifier before any store call is made.
pub fn validate_request(
    request: &EntityResolutionRequest,
) -> Result<Vec<(IdentifierType, &EntityIdentifier)>, ResolveError> {
    if request.identifiers.is_empty() {
        return Err(ResolveError::EmptyRequest);
    }

    request
        .identifiers
        .iter()
        .map(|ident| Ok((identifier_type(ident)?, ident)))
        .collect()
}

fn identifier_type(ident: &EntityIdentifier) -> Result<IdentifierType, ResolveError> {
    match ident.kind.as_str() {
        IdentifierType::EMAIL => Ok(IdentifierType::Email),
        IdentifierType::USERNAME => Ok(IdentifierType::Username),
        "" => Err(ResolveError::TypeRequired {
            identifier: ident.identifier.clone(),
        }),
        other => Err(ResolveError::UnsupportedType {
            kind: other.to_string(),
            identifier: ident.identifier.clone(),
        }),
    }
}
