use std::{borrow::Cow, collections::HashMap};

use async_trait::async_trait;
use aws_sdk_dynamodb::{types::AttributeValue, Client};
use serde::de::DeserializeOwned;
use serde_dynamo::aws_sdk_dynamodb_1::from_item;

use crate::{config::DynamoDirectoryConfig, models::IdentifierType};

use super::store::{DirectoryGroup, DirectoryUser, GroupRef, IdentityStore, StoreError};

/// Directory kept in two DynamoDB tables. Users are looked up through the
/// email and username GSIs, groups through the name GSI. A group item lists
/// its members' user ids in membership order.
///
/// Emails are expected to be stored lower-case; email lookups lower-case the
/// identifier so they ignore case like the other backends. Usernames match
/// exactly.
#[derive(Clone)]
pub struct DynamoDirectory {
    client: Client,
    config: DynamoDirectoryConfig,
}

impl DynamoDirectory {
    pub fn new(client: Client, config: DynamoDirectoryConfig) -> Self {
        Self { client, config }
    }

    /// Build a client from the ambient AWS configuration.
    pub async fn connect(config: DynamoDirectoryConfig) -> Self {
        let sdk_config = aws_config::load_from_env().await;
        tracing::info!(
            users_table = %config.users_table,
            groups_table = %config.groups_table,
            "using DynamoDB directory backend"
        );
        Self::new(Client::new(&sdk_config), config)
    }

    async fn query_index<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        table: &str,
        index: &str,
        attribute: &str,
        value: &str,
    ) -> Result<Vec<T>, StoreError> {
        let mut records = Vec::new();
        let mut exclusive_start_key = None;

        loop {
            let response = self
                .client
                .query()
                .table_name(table)
                .index_name(index)
                .key_condition_expression("#key = :value")
                .expression_attribute_names("#key", attribute)
                .expression_attribute_values(":value", AttributeValue::S(value.to_string()))
                .set_exclusive_start_key(exclusive_start_key)
                .send()
                .await
                .map_err(|e| StoreError::backend(operation, e))?;

            for item in response.items.unwrap_or_default() {
                records.push(decode(operation, item)?);
            }

            if response.last_evaluated_key.is_none() {
                return Ok(records);
            }

            exclusive_start_key = response.last_evaluated_key;
        }
    }

    async fn get_by_id<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        table: &str,
        id: &str,
    ) -> Result<Option<T>, StoreError> {
        let response = self
            .client
            .get_item()
            .table_name(table)
            .key("id", AttributeValue::S(id.to_string()))
            .send()
            .await
            .map_err(|e| StoreError::backend(operation, e))?;

        response.item.map(|item| decode(operation, item)).transpose()
    }
}

fn lookup_key(kind: IdentifierType, identifier: &str) -> Cow<'_, str> {
    match kind {
        IdentifierType::Email => Cow::Owned(identifier.to_ascii_lowercase()),
        IdentifierType::Username => Cow::Borrowed(identifier),
    }
}

fn decode<T: DeserializeOwned>(
    operation: &'static str,
    item: HashMap<String, AttributeValue>,
) -> Result<T, StoreError> {
    from_item(item).map_err(|e| StoreError::invalid_record(operation, e))
}

#[async_trait]
impl IdentityStore for DynamoDirectory {
    type User = DirectoryUser;

    async fn find_users(
        &self,
        kind: IdentifierType,
        identifier: &str,
    ) -> Result<Vec<DirectoryUser>, StoreError> {
        let index = match kind {
            IdentifierType::Email => &self.config.users_email_index,
            IdentifierType::Username => &self.config.users_username_index,
        };

        self.query_index(
            "find users",
            &self.config.users_table,
            index,
            kind.as_str(),
            &lookup_key(kind, identifier),
        )
        .await
    }

    async fn find_groups(&self, name: &str) -> Result<Vec<GroupRef>, StoreError> {
        let groups: Vec<DirectoryGroup> = self
            .query_index(
                "find groups",
                &self.config.groups_table,
                &self.config.groups_name_index,
                "name",
                name,
            )
            .await?;

        Ok(groups.iter().map(DirectoryGroup::group_ref).collect())
    }

    async fn group_members(&self, group_id: &str) -> Result<Vec<DirectoryUser>, StoreError> {
        let Some(group) = self
            .get_by_id::<DirectoryGroup>("group members", &self.config.groups_table, group_id)
            .await?
        else {
            return Ok(Vec::new());
        };

        let mut members = Vec::with_capacity(group.members.len());
        for member_id in &group.members {
            match self
                .get_by_id("group members", &self.config.users_table, member_id)
                .await?
            {
                Some(user) => members.push(user),
                None => tracing::warn!(
                    group_id,
                    member_id = %member_id,
                    "group member missing from users table"
                ),
            }
        }

        Ok(members)
    }
}
