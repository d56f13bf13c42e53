use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use url::Url;

use crate::{config::KeycloakConfig, models::IdentifierType};

use super::store::{GroupRef, IdentityStore, StoreError};

/// Tokens this close to expiry are treated as already expired.
const TOKEN_EXPIRY_SKEW_SECS: i64 = 30;
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 60;
/// Admin API list endpoints return at most this many entries per request.
const PAGE_SIZE: usize = 100;

/// User representation as returned by the Keycloak admin API. Fields this
/// service does not name are kept in `extra` so they survive into the
/// generic representation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeycloakUser {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<BTreeMap<String, Vec<String>>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Group as returned by `GET /groups?search=`. The search matches by
/// substring and returns top-level groups, with matching descendants nested
/// under `subGroups`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeycloakGroup {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    sub_groups: Vec<KeycloakGroup>,
}

impl KeycloakGroup {
    fn collect_named(&self, name: &str, found: &mut Vec<GroupRef>) {
        if self.name.eq_ignore_ascii_case(name) {
            found.push(GroupRef {
                id: self.id.clone(),
                name: self.name.clone(),
            });
        }
        for sub_group in &self.sub_groups {
            sub_group.collect_named(name, found);
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(TOKEN_EXPIRY_SKEW_SECS) < self.expires_at
    }
}

/// Keycloak realm reached through its admin REST API with a
/// client-credentials service account.
///
/// The access token is cached until shortly before it expires. Refreshes are
/// single-flight: callers that find the token stale queue on `refresh` and
/// the first one through fetches a new token for all of them.
pub struct KeycloakDirectory {
    client: reqwest::Client,
    config: KeycloakConfig,
    token: RwLock<Option<Arc<AccessToken>>>,
    refresh: Mutex<()>,
}

impl KeycloakDirectory {
    pub fn new(config: KeycloakConfig) -> Result<Self, StoreError> {
        if config.url.cannot_be_a_base() {
            return Err(StoreError::Configuration(format!(
                "{} cannot be used as a base URL",
                config.url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| StoreError::Configuration(format!("building HTTP client: {e}")))?;

        if config.legacy {
            tracing::warn!("using legacy connection mode for Keycloak < 17");
        }

        Ok(Self {
            client,
            config,
            token: RwLock::new(None),
            refresh: Mutex::new(()),
        })
    }

    /// Authenticate the service account. Used at startup so bad credentials
    /// surface before the first request.
    pub async fn login(&self) -> Result<(), StoreError> {
        tracing::debug!(
            url = %self.config.url,
            realm = %self.config.realm,
            "connecting to keycloak"
        );
        self.access_token().await.map(|_| ())
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.config.url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                StoreError::Configuration(format!(
                    "{} cannot be used as a base URL",
                    self.config.url
                ))
            })?;
            path.pop_if_empty();
            if self.config.legacy {
                path.push("auth");
            }
            path.extend(segments);
        }
        Ok(url)
    }

    async fn cached_token(&self) -> Option<Arc<AccessToken>> {
        self.token
            .read()
            .await
            .as_ref()
            .filter(|token| token.is_fresh(Utc::now()))
            .cloned()
    }

    async fn access_token(&self) -> Result<Arc<AccessToken>, StoreError> {
        if let Some(token) = self.cached_token().await {
            return Ok(token);
        }

        let _refreshing = self.refresh.lock().await;
        // Someone else may have refreshed while this caller waited.
        if let Some(token) = self.cached_token().await {
            return Ok(token);
        }

        let token = Arc::new(self.request_token().await?);
        *self.token.write().await = Some(token.clone());
        Ok(token)
    }

    /// Drop `stale` from the cache unless it has already been replaced.
    async fn invalidate(&self, stale: &Arc<AccessToken>) {
        let mut token = self.token.write().await;
        if token
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, stale))
        {
            tracing::debug!("invalidating rejected access token");
            *token = None;
        }
    }

    async fn request_token(&self) -> Result<AccessToken, StoreError> {
        let url = self.endpoint(&[
            "realms",
            self.config.realm.as_str(),
            "protocol",
            "openid-connect",
            "token",
        ])?;

        let response = self
            .client
            .post(url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|source| StoreError::Transport {
                operation: "login",
                source,
            })?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            tracing::warn!(status = status.as_u16(), "keycloak rejected service credentials");
            return Err(StoreError::Authentication {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(StoreError::Status {
                operation: "login",
                status: status.as_u16(),
            });
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| StoreError::invalid_record("login", e))?;
        let lifetime = body
            .expires_in
            .and_then(Duration::try_seconds)
            .unwrap_or_else(|| Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS));

        tracing::debug!(
            expires_in = lifetime.num_seconds(),
            "obtained service account token"
        );

        Ok(AccessToken {
            value: body.access_token,
            expires_at: Utc::now() + lifetime,
        })
    }

    async fn admin_get<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<T, StoreError> {
        let mut path = vec!["admin", "realms", self.config.realm.as_str()];
        path.extend_from_slice(segments);
        let url = self.endpoint(&path)?;

        let token = self.access_token().await?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&token.value)
            .query(query)
            .send()
            .await
            .map_err(|source| StoreError::Transport { operation, source })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.invalidate(&token).await;
            return Err(StoreError::Authentication {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            tracing::error!(operation, status = status.as_u16(), "keycloak request failed");
            return Err(StoreError::Status {
                operation,
                status: status.as_u16(),
            });
        }

        response
            .json()
            .await
            .map_err(|e| StoreError::invalid_record(operation, e))
    }

    /// Fetch every page of a list endpoint with `first`/`max`, stopping at
    /// the first short page.
    async fn admin_list<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<Vec<T>, StoreError> {
        let max = PAGE_SIZE.to_string();
        let mut records = Vec::new();
        loop {
            let first = records.len().to_string();
            let mut paged = query.to_vec();
            paged.push(("first", first.as_str()));
            paged.push(("max", max.as_str()));

            let page: Vec<T> = self.admin_get(operation, segments, &paged).await?;
            let fetched = page.len();
            records.extend(page);
            if fetched < PAGE_SIZE {
                return Ok(records);
            }
        }
    }
}

#[async_trait]
impl IdentityStore for KeycloakDirectory {
    type User = KeycloakUser;

    async fn find_users(
        &self,
        kind: IdentifierType,
        identifier: &str,
    ) -> Result<Vec<KeycloakUser>, StoreError> {
        self.admin_get(
            "find users",
            &["users"],
            &[(kind.as_str(), identifier), ("exact", "true")],
        )
        .await
    }

    async fn find_groups(&self, name: &str) -> Result<Vec<GroupRef>, StoreError> {
        let groups: Vec<KeycloakGroup> = self
            .admin_list("find groups", &["groups"], &[("search", name)])
            .await?;

        let mut found = Vec::new();
        for group in &groups {
            group.collect_named(name, &mut found);
        }
        Ok(found)
    }

    async fn group_members(&self, group_id: &str) -> Result<Vec<KeycloakUser>, StoreError> {
        self.admin_list("group members", &["groups", group_id, "members"], &[])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use wiremock::{
        matchers::{body_string_contains, header, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use crate::{
        models::{EntityIdentifier, EntityResolutionRequest},
        resolve::{EntityResolve, EntityResolver},
    };

    fn config(server: &MockServer, legacy: bool) -> KeycloakConfig {
        KeycloakConfig {
            url: Url::parse(&server.uri()).unwrap(),
            realm: "tdf".to_string(),
            client_id: "tdf-entity-resolution-service".to_string(),
            client_secret: "secret".to_string(),
            legacy,
            request_timeout: std::time::Duration::from_secs(5),
        }
    }

    async fn mount_token(server: &MockServer, prefix: &str, expires_in: i64, expected: u64) {
        Mock::given(method("POST"))
            .and(path(format!(
                "{prefix}/realms/tdf/protocol/openid-connect/token"
            )))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains("client_id=tdf-entity-resolution-service"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "service-token",
                "expires_in": expires_in,
                "token_type": "Bearer"
            })))
            .expect(expected)
            .mount(server)
            .await;
    }

    fn bob() -> Value {
        json!({
            "id": "bobid",
            "username": "bob",
            "email": "bob@sample.org",
            "enabled": true,
            "createdTimestamp": 1650000000000i64
        })
    }

    fn alice() -> Value {
        json!({"id": "aliceid", "username": "alice", "email": "alice@sample.org"})
    }

    #[tokio::test]
    async fn test_find_users_by_email() {
        let server = MockServer::start().await;
        mount_token(&server, "", 300, 1).await;
        Mock::given(method("GET"))
            .and(path("/admin/realms/tdf/users"))
            .and(query_param("email", "bob@sample.org"))
            .and(query_param("exact", "true"))
            .and(header("authorization", "Bearer service-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([bob()])))
            .mount(&server)
            .await;

        let directory = KeycloakDirectory::new(config(&server, false)).unwrap();
        let users = directory
            .find_users(IdentifierType::Email, "bob@sample.org")
            .await
            .unwrap();

        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, "bobid");
        assert_eq!(users[0].extra["createdTimestamp"], json!(1650000000000i64));
    }

    #[tokio::test]
    async fn test_legacy_mode_prefixes_paths() {
        let server = MockServer::start().await;
        mount_token(&server, "/auth", 300, 1).await;
        Mock::given(method("GET"))
            .and(path("/auth/admin/realms/tdf/users"))
            .and(query_param("username", "bob"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([bob()])))
            .expect(1)
            .mount(&server)
            .await;

        let directory = KeycloakDirectory::new(config(&server, true)).unwrap();
        let users = directory
            .find_users(IdentifierType::Username, "bob")
            .await
            .unwrap();

        assert_eq!(users[0].username.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_token_is_cached_across_calls() {
        let server = MockServer::start().await;
        mount_token(&server, "", 300, 1).await;
        Mock::given(method("GET"))
            .and(path("/admin/realms/tdf/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(2)
            .mount(&server)
            .await;

        let directory = KeycloakDirectory::new(config(&server, false)).unwrap();
        directory.login().await.unwrap();
        directory
            .find_users(IdentifierType::Email, "a@sample.org")
            .await
            .unwrap();
        directory
            .find_users(IdentifierType::Email, "b@sample.org")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let server = MockServer::start().await;
        mount_token(&server, "", 300, 1).await;
        Mock::given(method("GET"))
            .and(path("/admin/realms/tdf/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(4)
            .mount(&server)
            .await;

        let directory = KeycloakDirectory::new(config(&server, false)).unwrap();
        let (a, b, c, d) = tokio::join!(
            directory.find_users(IdentifierType::Email, "a@sample.org"),
            directory.find_users(IdentifierType::Email, "b@sample.org"),
            directory.find_users(IdentifierType::Username, "c"),
            directory.find_users(IdentifierType::Username, "d"),
        );

        for result in [a, b, c, d] {
            assert!(result.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_token_inside_expiry_skew_is_refreshed() {
        let server = MockServer::start().await;
        mount_token(&server, "", TOKEN_EXPIRY_SKEW_SECS - 10, 2).await;
        Mock::given(method("GET"))
            .and(path("/admin/realms/tdf/groups"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let directory = KeycloakDirectory::new(config(&server, false)).unwrap();
        directory.find_groups("group1@sample.org").await.unwrap();
        directory.find_groups("group1@sample.org").await.unwrap();
    }

    #[tokio::test]
    async fn test_unauthorized_response_invalidates_token() {
        let server = MockServer::start().await;
        mount_token(&server, "", 300, 2).await;
        Mock::given(method("GET"))
            .and(path("/admin/realms/tdf/users"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/admin/realms/tdf/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([bob()])))
            .mount(&server)
            .await;

        let directory = KeycloakDirectory::new(config(&server, false)).unwrap();

        let err = directory
            .find_users(IdentifierType::Email, "bob@sample.org")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Authentication { status: 401 }));

        let users = directory
            .find_users(IdentifierType::Email, "bob@sample.org")
            .await
            .unwrap();
        assert_eq!(users.len(), 1);
    }

    #[tokio::test]
    async fn test_login_with_bad_credentials_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/realms/tdf/protocol/openid-connect/token"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": "unauthorized_client"
            })))
            .mount(&server)
            .await;

        let directory = KeycloakDirectory::new(config(&server, false)).unwrap();
        let err = directory.login().await.unwrap_err();

        assert!(matches!(err, StoreError::Authentication { status: 401 }));
    }

    #[tokio::test]
    async fn test_server_error_is_reported_with_operation() {
        let server = MockServer::start().await;
        mount_token(&server, "", 300, 1).await;
        Mock::given(method("GET"))
            .and(path("/admin/realms/tdf/groups/group1id/members"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let directory = KeycloakDirectory::new(config(&server, false)).unwrap();
        let err = directory.group_members("group1id").await.unwrap_err();

        assert!(matches!(
            err,
            StoreError::Status {
                operation: "group members",
                status: 500
            }
        ));
    }

    #[tokio::test]
    async fn test_resolver_expands_keycloak_group() {
        let server = MockServer::start().await;
        mount_token(&server, "", 300, 1).await;
        Mock::given(method("GET"))
            .and(path("/admin/realms/tdf/users"))
            .and(query_param("email", "group1@sample.org"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/admin/realms/tdf/groups"))
            .and(query_param("search", "group1@sample.org"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "group1id", "name": "group1@sample.org", "path": "/group1@sample.org", "subGroups": []}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/admin/realms/tdf/groups/group1id/members"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([bob(), alice()])))
            .mount(&server)
            .await;

        let resolver =
            EntityResolver::new(KeycloakDirectory::new(config(&server, false)).unwrap());
        let resolutions = resolver
            .resolve(&EntityResolutionRequest {
                identifiers: vec![EntityIdentifier::new(
                    "group1@sample.org",
                    IdentifierType::Email,
                )],
            })
            .await
            .unwrap();

        let representations = &resolutions[0].representations;
        assert_eq!(representations.len(), 2);
        assert_eq!(representations[0]["id"], json!("bobid"));
        assert_eq!(representations[0]["createdTimestamp"], json!(1650000000000i64));
        assert_eq!(representations[1]["id"], json!("aliceid"));
        assert!(representations[1].get("firstName").is_none());
    }

    #[tokio::test]
    async fn test_nested_group_is_matched_instead_of_its_parent() {
        let server = MockServer::start().await;
        mount_token(&server, "", 300, 1).await;
        Mock::given(method("GET"))
            .and(path("/admin/realms/tdf/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/admin/realms/tdf/groups"))
            .and(query_param("search", "group1@sample.org"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "id": "orgid",
                "name": "org",
                "path": "/org",
                "subGroups": [
                    {"id": "group1id", "name": "group1@sample.org", "path": "/org/group1@sample.org", "subGroups": []}
                ]
            }])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/admin/realms/tdf/groups/orgid/members"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "ceoid", "username": "ceo"}
            ])))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/admin/realms/tdf/groups/group1id/members"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([bob(), alice()])))
            .mount(&server)
            .await;

        let resolver =
            EntityResolver::new(KeycloakDirectory::new(config(&server, false)).unwrap());
        let resolutions = resolver
            .resolve(&EntityResolutionRequest {
                identifiers: vec![EntityIdentifier::new(
                    "group1@sample.org",
                    IdentifierType::Email,
                )],
            })
            .await
            .unwrap();

        let ids: Vec<&Value> = resolutions[0]
            .representations
            .iter()
            .map(|representation| &representation["id"])
            .collect();
        assert_eq!(ids, vec![&json!("bobid"), &json!("aliceid")]);
    }

    #[tokio::test]
    async fn test_find_groups_drops_substring_matches() {
        let server = MockServer::start().await;
        mount_token(&server, "", 300, 1).await;
        Mock::given(method("GET"))
            .and(path("/admin/realms/tdf/groups"))
            .and(query_param("search", "group1@sample.org"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "group1id", "name": "Group1@sample.org", "subGroups": []},
                {"id": "subgroup1id", "name": "subgroup1@sample.org", "subGroups": []}
            ])))
            .mount(&server)
            .await;

        let directory = KeycloakDirectory::new(config(&server, false)).unwrap();
        let groups = directory.find_groups("group1@sample.org").await.unwrap();

        assert_eq!(
            groups,
            vec![GroupRef {
                id: "group1id".to_string(),
                name: "Group1@sample.org".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_group_members_are_fetched_page_by_page() {
        let server = MockServer::start().await;
        mount_token(&server, "", 300, 1).await;
        let first_page: Vec<Value> = (0..PAGE_SIZE)
            .map(|i| json!({"id": format!("user{i}"), "username": format!("user{i}")}))
            .collect();
        Mock::given(method("GET"))
            .and(path("/admin/realms/tdf/groups/group1id/members"))
            .and(query_param("first", "0"))
            .and(query_param("max", PAGE_SIZE.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(Value::Array(first_page)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/admin/realms/tdf/groups/group1id/members"))
            .and(query_param("first", PAGE_SIZE.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([bob(), alice()])))
            .expect(1)
            .mount(&server)
            .await;

        let directory = KeycloakDirectory::new(config(&server, false)).unwrap();
        let members = directory.group_members("group1id").await.unwrap();

        assert_eq!(members.len(), PAGE_SIZE + 2);
        assert_eq!(members[0].id, "user0");
        assert_eq!(members[PAGE_SIZE - 1].id, format!("user{}", PAGE_SIZE - 1));
        assert_eq!(members[PAGE_SIZE].id, "bobid");
        assert_eq!(members[PAGE_SIZE + 1].id, "aliceid");
    }
}
