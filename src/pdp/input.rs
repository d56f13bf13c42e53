use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// The generic document handed to the policy engine as `input`.
pub type InputDocument = Map<String, Value>;

#[derive(Debug, Error)]
pub enum InputDocumentError {
    #[error("deserialize generic entitlement context JSON input document")]
    ContextUnmarshal(#[source] serde_json::Error),

    #[error("re-marshalling input document")]
    OutputMarshal(#[source] serde_json::Error),

    #[error("deserialize final JSON input document")]
    FinalUnmarshal(#[source] serde_json::Error),
}

impl InputDocumentError {
    /// Context problems come from the caller; the other two mean the typed
    /// document itself could not be converted.
    pub fn is_client_error(&self) -> bool {
        matches!(self, InputDocumentError::ContextUnmarshal(_))
    }
}

#[derive(Debug, Serialize)]
struct DecisionInputDocument<'a> {
    primary_entity: &'a str,
    secondary_entities: &'a [String],
    entitlement_context: Map<String, Value>,
}

/// Assemble the engine input from the request fields.
///
/// The context is parsed into a generic object first so it gets embedded as
/// a JSON object rather than an escaped string. The typed document is then
/// converted into a dynamic value tree with [`to_dynamic`].
pub fn build_input_document(
    primary_entity: &str,
    secondary_entities: &[String],
    context_json: &str,
) -> Result<InputDocument, InputDocumentError> {
    let context_json = if context_json.trim().is_empty() {
        "{}"
    } else {
        context_json
    };

    let entitlement_context = serde_json::from_str::<Option<Map<String, Value>>>(context_json)
        .map_err(|e| {
            tracing::warn!(error = %e, "entitlement context is not a JSON object");
            InputDocumentError::ContextUnmarshal(e)
        })?
        .unwrap_or_default();

    let document = DecisionInputDocument {
        primary_entity,
        secondary_entities,
        entitlement_context,
    };

    let input = to_dynamic(&document)?;
    tracing::debug!(?input, "built decision input document");
    Ok(input)
}

/// Typed-to-dynamic conversion: serialize to bytes, then deserialize the
/// bytes into a `Map<String, Value>`. Each stage has its own error.
pub fn to_dynamic<T: Serialize>(document: &T) -> Result<InputDocument, InputDocumentError> {
    let bytes = serde_json::to_vec(document).map_err(InputDocumentError::OutputMarshal)?;
    serde_json::from_slice(&bytes).map_err(InputDocumentError::FinalUnmarshal)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use serde_json::json;

    #[test]
    fn test_empty_context_becomes_empty_object() {
        let input = build_input_document("bobid", &[], "").unwrap();

        assert_eq!(input["entitlement_context"], json!({}));
        assert_eq!(input["primary_entity"], json!("bobid"));
        assert_eq!(input["secondary_entities"], json!([]));
    }

    #[test]
    fn test_null_context_becomes_empty_object() {
        let input = build_input_document("bobid", &[], "null").unwrap();
        assert_eq!(input["entitlement_context"], json!({}));
    }

    #[test]
    fn test_context_is_embedded_as_object_not_string() {
        let secondaries = vec!["client-1".to_string(), "client-2".to_string()];
        let input =
            build_input_document("bobid", &secondaries, r#"{"somekey":{"nested":[1,2]}}"#)
                .unwrap();

        assert_eq!(
            Value::Object(input),
            json!({
                "primary_entity": "bobid",
                "secondary_entities": ["client-1", "client-2"],
                "entitlement_context": {"somekey": {"nested": [1, 2]}}
            })
        );
    }

    #[test]
    fn test_invalid_context_is_context_unmarshal_error() {
        let err = build_input_document("bobid", &[], "{not json").unwrap_err();
        assert!(matches!(err, InputDocumentError::ContextUnmarshal(_)));
        assert!(err.is_client_error());
    }

    #[test]
    fn test_non_object_context_is_rejected() {
        let err = build_input_document("bobid", &[], "[1, 2, 3]").unwrap_err();
        assert!(matches!(err, InputDocumentError::ContextUnmarshal(_)));
    }

    #[test]
    fn test_to_dynamic_flags_non_object_documents() {
        let err = to_dynamic(&"just a string").unwrap_err();
        assert!(matches!(err, InputDocumentError::FinalUnmarshal(_)));
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_to_dynamic_flags_unserializable_documents() {
        let mut document = HashMap::new();
        document.insert((1, 2), "tuple keys cannot be JSON object keys");

        let err = to_dynamic(&document).unwrap_err();
        assert!(matches!(err, InputDocumentError::OutputMarshal(_)));
    }
}
