use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use url::Url;

use crate::config::{env_or, parse_env, ConfigError};

/// Only variables in this namespace may be substituted into the engine
/// configuration.
pub const ENGINE_ENV_PREFIX: &str = "OPA_";
pub const PULL_CREDENTIAL_VAR: &str = "OPA_POLICYBUNDLE_PULLCRED";
const LEGACY_PULL_CREDENTIAL_PLACEHOLDER: &str = "${CR_PAT}";

pub const DEFAULT_DECISION_PATH: &str = "opentdf/entitlement/generated_entitlements";

/// How the policy engine is reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineLaunch {
    /// Spawn `binary` as a child server listening on `listen_addr`.
    Process {
        binary: PathBuf,
        listen_addr: SocketAddr,
    },
    /// Attach to an engine that is already running.
    Remote { url: Url },
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub config_path: PathBuf,
    pub launch: EngineLaunch,
    pub decision_path: String,
    pub startup_timeout: Duration,
    pub decision_timeout: Duration,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let launch = match env::var("OPA_URL").ok().filter(|v| !v.trim().is_empty()) {
            Some(url) => EngineLaunch::Remote {
                url: Url::parse(url.trim()).map_err(|e| ConfigError::InvalidValue {
                    key: "OPA_URL".to_string(),
                    reason: e.to_string(),
                })?,
            },
            None => EngineLaunch::Process {
                binary: PathBuf::from(env_or("OPA_BINARY", "opa")),
                listen_addr: parse_env(
                    "OPA_LISTEN_ADDR",
                    SocketAddr::from(([127, 0, 0, 1], 8181)),
                )?,
            },
        };

        let decision_path = env_or("OPA_DECISION_PATH", DEFAULT_DECISION_PATH);
        validate_decision_path(&decision_path)?;

        Ok(Self {
            config_path: PathBuf::from(env_or(
                "OPA_CONFIG_PATH",
                "/etc/opa/config/opa-config.yaml",
            )),
            launch,
            decision_path,
            startup_timeout: Duration::from_secs(parse_env("OPA_ENGINE_STARTUP_TIMEOUT", 90)?),
            decision_timeout: Duration::from_secs(parse_env("OPA_DECISION_TIMEOUT", 30)?),
        })
    }
}

/// Decision paths are slash-separated rule names. Anything else (empty
/// segments, `..`, query characters) is refused so the path cannot escape the
/// engine's data API.
pub fn validate_decision_path(path: &str) -> Result<(), ConfigError> {
    let valid = !path.is_empty()
        && path.split('/').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        });

    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            key: "OPA_DECISION_PATH".to_string(),
            reason: format!("'{path}' is not a slash-separated rule path"),
        })
    }
}

/// Replace `${OPA_*}` placeholders in the engine configuration with values
/// from `vars`. Placeholders outside the namespace are left as-is.
/// `${CR_PAT}` resolves to the pull credential, or to an empty string when it
/// is not set.
pub fn substitute_engine_vars<I>(config: &str, vars: I) -> String
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut rendered = config.to_string();
    let mut pull_credential = String::new();

    for (key, value) in vars {
        if !key.starts_with(ENGINE_ENV_PREFIX) {
            continue;
        }
        if key == PULL_CREDENTIAL_VAR {
            pull_credential = value.clone();
        }
        rendered = rendered.replace(&format!("${{{key}}}"), &value);
    }

    rendered.replace(LEGACY_PULL_CREDENTIAL_PLACEHOLDER, &pull_credential)
}

/// Read the engine configuration file and substitute placeholders from the
/// process environment.
pub async fn load_engine_config(path: &std::path::Path) -> std::io::Result<String> {
    tracing::info!(path = %path.display(), "loading policy engine configuration");
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(substitute_engine_vars(&raw, env::vars()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const CONFIG_WITH_CR_PAT: &str = "services:\n  policy-registry:\n    url: https://ghcr.io\n    type: oci\n    credentials:\n      bearer:\n        token: \"${CR_PAT}\"";

    #[test]
    fn test_substitute_replaces_legacy_placeholder() {
        let rendered = substitute_engine_vars(
            CONFIG_WITH_CR_PAT,
            vars(&[(PULL_CREDENTIAL_VAR, "myvalue")]),
        );

        assert!(!rendered.contains("${CR_PAT}"));
        assert!(rendered.contains("token: \"myvalue\""));
    }

    #[test]
    fn test_substitute_legacy_placeholder_defaults_to_empty() {
        let rendered = substitute_engine_vars(CONFIG_WITH_CR_PAT, vars(&[]));
        assert!(rendered.contains("token: \"\""));
    }

    #[test]
    fn test_substitute_replaces_namespaced_variables() {
        let config = "token: \"${OPA_POLICYBUNDLE_PULLCRED}\"\nurl: ${OPA_BUNDLE_URL}";
        let rendered = substitute_engine_vars(
            config,
            vars(&[
                (PULL_CREDENTIAL_VAR, "myvalue"),
                ("OPA_BUNDLE_URL", "https://bundles.example.org"),
            ]),
        );

        assert_eq!(
            rendered,
            "token: \"myvalue\"\nurl: https://bundles.example.org"
        );
    }

    #[test]
    fn test_substitute_ignores_variables_outside_namespace() {
        let config = "token: \"${MY_SECRET}\"";
        let rendered = substitute_engine_vars(config, vars(&[("MY_SECRET", "myvalue")]));
        assert_eq!(rendered, config);
    }

    #[test]
    fn test_substitute_keeps_values_containing_equals() {
        let rendered = substitute_engine_vars(
            "token: ${OPA_TOKEN}",
            vars(&[("OPA_TOKEN", "abc==")]),
        );
        assert_eq!(rendered, "token: abc==");
    }

    #[test]
    fn test_validate_decision_path() {
        assert!(validate_decision_path(DEFAULT_DECISION_PATH).is_ok());
        assert!(validate_decision_path("entitlement/generated_entitlements").is_ok());
        assert!(validate_decision_path("").is_err());
        assert!(validate_decision_path("opentdf//entitlement").is_err());
        assert!(validate_decision_path("../v1/policies").is_err());
        assert!(validate_decision_path("opentdf/entitlement?pretty=true").is_err());
    }

    #[tokio::test]
    async fn test_load_engine_config_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "decision_logs:\n  console: true\n").unwrap();

        let rendered = load_engine_config(file.path()).await.unwrap();
        assert_eq!(rendered, "decision_logs:\n  console: true\n");
    }

    #[tokio::test]
    async fn test_load_engine_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_engine_config(&dir.path().join("missing.yaml")).await;
        assert!(result.is_err());
    }
}
