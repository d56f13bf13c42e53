use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// A single attribute granted to an entity, e.g.
/// `https://example.org/attr/Classification/value/COI`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityAttribute {
    pub attribute: String,
    #[serde(
        rename = "displayName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub display_name: Option<String>,
}

/// Entitlements for one entity. `entity_identifier` is opaque and defined by
/// the identity provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityEntitlement {
    #[serde(rename = "entity_identifier")]
    pub entity_id: String,
    #[serde(rename = "entity_attributes", default)]
    pub attributes: Vec<EntityAttribute>,
}

/// Body of `POST /entitlements`.
///
/// The primary entity is the requestor (a person entity for PE auth, a client
/// for direct grants). Secondary entities are the clients acting on its
/// behalf. The context object is free-form IdP context handed to the policy
/// engine; it may arrive as an escaped JSON string or inline.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct EntitlementsRequest {
    #[serde(rename = "primary_entity_id", default)]
    pub primary_entity_id: String,
    #[serde(
        rename = "secondary_entity_ids",
        default,
        deserialize_with = "null_as_empty"
    )]
    pub secondary_entity_ids: Vec<String>,
    #[serde(
        rename = "entitlement_context_obj",
        default,
        deserialize_with = "context_as_text"
    )]
    pub context_object: Option<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Normalizes the context to JSON text: strings are taken verbatim (and
/// validated later), inline values are re-serialized, `null` means absent.
fn context_as_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(text) if text.is_empty() => Ok(None),
        Value::String(text) => Ok(Some(text)),
        other => Ok(Some(other.to_string())),
    }
}

/// Identifier types the resolver knows how to look up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IdentifierType {
    Email,
    Username,
}

impl IdentifierType {
    pub const EMAIL: &'static str = "email";
    pub const USERNAME: &'static str = "username";

    pub fn as_str(self) -> &'static str {
        match self {
            IdentifierType::Email => Self::EMAIL,
            IdentifierType::Username => Self::USERNAME,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityIdentifier {
    pub identifier: String,
    /// Kept as the raw wire string so that a missing type and an unknown type
    /// can be told apart during validation.
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl EntityIdentifier {
    pub fn new(identifier: impl Into<String>, kind: IdentifierType) -> Self {
        Self {
            identifier: identifier.into(),
            kind: kind.as_str().to_string(),
        }
    }
}

/// One resolution result per requested identifier. Zero representations
/// means the identifier did not resolve; more than one means it resolved to a
/// group and was expanded to the group's direct members.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityResolution {
    #[serde(rename = "original_id")]
    pub original_identifier: EntityIdentifier,
    #[serde(rename = "EntityRepresentations", default)]
    pub representations: Vec<Map<String, Value>>,
}

/// Body of `POST /resolve`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(from = "ResolutionRequestWire")]
pub struct EntityResolutionRequest {
    pub identifiers: Vec<EntityIdentifier>,
}

/// Accepts both the canonical `entity_identifiers` list and the shorthand
/// `{"type": "...", "identifiers": ["..."]}` where every identifier shares a
/// type.
#[derive(Deserialize)]
struct ResolutionRequestWire {
    #[serde(default)]
    entity_identifiers: Vec<EntityIdentifier>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    identifiers: Vec<String>,
}

impl From<ResolutionRequestWire> for EntityResolutionRequest {
    fn from(wire: ResolutionRequestWire) -> Self {
        let mut identifiers = wire.entity_identifiers;
        let kind = wire.kind.unwrap_or_default();
        identifiers.extend(wire.identifiers.into_iter().map(|identifier| EntityIdentifier {
            identifier,
            kind: kind.clone(),
        }));
        Self { identifiers }
    }
}
