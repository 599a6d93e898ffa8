//! Layered settings: built-in defaults, then an optional TOML file, then the
//! environment. Later layers override earlier ones field by field.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::credential::{DEFAULT_SCOPES, OAuthClientConfig};
use crate::orchestrator::{DEFAULT_ROLE, GrantSettings};
use crate::secret::SecretString;
use crate::stack::{ExecutionLimits, PulumiCliExecutor};

pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:3000/oauth2callback";
pub const DEFAULT_APPLY_TIMEOUT_SECS: u64 = 900;
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(ConfigError::Invalid {
                key: "log.format",
                reason: format!("expected `pretty` or `json`, got `{other}`"),
            }),
        }
    }
}

/// One source's worth of settings; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigLayer {
    oauth: OAuthLayer,
    pulumi: PulumiLayer,
    grant: GrantLayer,
    log: LogLayer,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct OAuthLayer {
    client_id: Option<String>,
    client_secret: Option<SecretString>,
    redirect_uri: Option<String>,
    scopes: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PulumiLayer {
    work_dir: Option<PathBuf>,
    binary: Option<PathBuf>,
    access_token: Option<SecretString>,
    apply_timeout_secs: Option<u64>,
    command_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct GrantLayer {
    member: Option<String>,
    role: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct LogLayer {
    level: Option<String>,
    format: Option<LogFormat>,
}

impl ConfigLayer {
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "loading config file");
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::TomlParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads the environment through `lookup`. Empty values count as unset.
    pub fn from_env(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let secs = |name: &str, key: &'static str| {
            var(name)
                .map(|value| {
                    value
                        .trim()
                        .parse::<u64>()
                        .map_err(|err| ConfigError::Invalid {
                            key,
                            reason: err.to_string(),
                        })
                })
                .transpose()
        };
        let apply_timeout_secs = secs("PULUMI_APPLY_TIMEOUT_SECS", "pulumi.apply_timeout_secs")?;
        let command_timeout_secs =
            secs("PULUMI_COMMAND_TIMEOUT_SECS", "pulumi.command_timeout_secs")?;
        let format = var("LOG_FORMAT")
            .map(|value| value.parse::<LogFormat>())
            .transpose()?;

        Ok(Self {
            oauth: OAuthLayer {
                client_id: var("CLIENT_ID"),
                client_secret: var("CLIENT_SECRET").map(SecretString::from),
                redirect_uri: var("REDIRECT_URI"),
                scopes: None,
            },
            pulumi: PulumiLayer {
                work_dir: var("PULUMI_WORK_DIR").map(PathBuf::from),
                binary: var("PULUMI_BINARY").map(PathBuf::from),
                access_token: var("PULUMI_ACCESS_TOKEN").map(SecretString::from),
                apply_timeout_secs,
                command_timeout_secs,
            },
            grant: GrantLayer {
                member: var("GRANT_MEMBER"),
                role: var("GRANT_ROLE"),
            },
            log: LogLayer {
                level: var("LOG_LEVEL"),
                format,
            },
        })
    }

    /// Fields set in `over` win.
    fn merge(self, over: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            oauth: OAuthLayer {
                client_id: over.oauth.client_id.or(self.oauth.client_id),
                client_secret: over.oauth.client_secret.or(self.oauth.client_secret),
                redirect_uri: over.oauth.redirect_uri.or(self.oauth.redirect_uri),
                scopes: over.oauth.scopes.or(self.oauth.scopes),
            },
            pulumi: PulumiLayer {
                work_dir: over.pulumi.work_dir.or(self.pulumi.work_dir),
                binary: over.pulumi.binary.or(self.pulumi.binary),
                access_token: over.pulumi.access_token.or(self.pulumi.access_token),
                apply_timeout_secs: over
                    .pulumi
                    .apply_timeout_secs
                    .or(self.pulumi.apply_timeout_secs),
                command_timeout_secs: over
                    .pulumi
                    .command_timeout_secs
                    .or(self.pulumi.command_timeout_secs),
            },
            grant: GrantLayer {
                member: over.grant.member.or(self.grant.member),
                role: over.grant.role.or(self.grant.role),
            },
            log: LogLayer {
                level: over.log.level.or(self.log.level),
                format: over.log.format.or(self.log.format),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<SecretString>,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PulumiSettings {
    pub work_dir: PathBuf,
    pub binary: PathBuf,
    pub access_token: Option<SecretString>,
    pub apply_timeout: Duration,
    pub command_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    pub oauth: OAuthSettings,
    pub pulumi: PulumiSettings,
    pub grant: GrantSettings,
    pub log: LogSettings,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self::from_layer(ConfigLayer::default())
    }
}

impl ProvisionConfig {
    /// Resolves defaults < `path` (when given) < process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |name| std::env::var(name).ok())
    }

    pub fn load_with(
        path: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => ConfigLayer::from_toml_file(path)?,
            None => ConfigLayer::default(),
        };
        let env = ConfigLayer::from_env(lookup)?;
        Ok(Self::from_layer(ConfigLayer::default().merge(file).merge(env)))
    }

    fn from_layer(layer: ConfigLayer) -> Self {
        Self {
            oauth: OAuthSettings {
                client_id: layer.oauth.client_id,
                client_secret: layer.oauth.client_secret,
                redirect_uri: layer
                    .oauth
                    .redirect_uri
                    .unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string()),
                scopes: layer
                    .oauth
                    .scopes
                    .unwrap_or_else(|| DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect()),
            },
            pulumi: PulumiSettings {
                work_dir: layer.pulumi.work_dir.unwrap_or_else(|| PathBuf::from("infra")),
                binary: layer.pulumi.binary.unwrap_or_else(|| PathBuf::from("pulumi")),
                access_token: layer.pulumi.access_token,
                apply_timeout: Duration::from_secs(
                    layer
                        .pulumi
                        .apply_timeout_secs
                        .unwrap_or(DEFAULT_APPLY_TIMEOUT_SECS),
                ),
                command_timeout: Duration::from_secs(
                    layer
                        .pulumi
                        .command_timeout_secs
                        .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS),
                ),
            },
            grant: GrantSettings {
                member: layer.grant.member,
                role: layer.grant.role.unwrap_or_else(|| DEFAULT_ROLE.to_string()),
            },
            log: LogSettings {
                level: layer.log.level.unwrap_or_else(|| "info".to_string()),
                format: layer.log.format.unwrap_or_default(),
            },
        }
    }

    /// Checks the settings every identity-provider call needs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.oauth_client().map(|_| ())
    }

    pub fn oauth_client(&self) -> Result<OAuthClientConfig, ConfigError> {
        let client_id = self
            .oauth
            .client_id
            .as_deref()
            .ok_or(ConfigError::Missing("oauth.client_id"))?;
        let client_secret = self
            .oauth
            .client_secret
            .clone()
            .filter(|secret| !secret.is_empty())
            .ok_or(ConfigError::Missing("oauth.client_secret"))?;
        let redirect_uri =
            Url::parse(&self.oauth.redirect_uri).map_err(|err| ConfigError::Invalid {
                key: "oauth.redirect_uri",
                reason: err.to_string(),
            })?;
        Ok(OAuthClientConfig::new(client_id, client_secret, redirect_uri)
            .with_scopes(self.oauth.scopes.clone()))
    }

    pub fn require_member(&self) -> Result<&str, ConfigError> {
        self.grant
            .member
            .as_deref()
            .ok_or(ConfigError::Missing("grant.member"))
    }

    pub fn pulumi_executor(&self) -> Result<PulumiCliExecutor, ConfigError> {
        let limits = ExecutionLimits {
            apply_timeout: self.pulumi.apply_timeout,
            command_timeout: self.pulumi.command_timeout,
            ..ExecutionLimits::default()
        };
        let executor = PulumiCliExecutor::new(&self.pulumi.work_dir, limits)
            .map_err(|err| ConfigError::Invalid {
                key: "pulumi.work_dir",
                reason: err.to_string(),
            })?
            .with_binary(&self.pulumi.binary);
        Ok(match &self.pulumi.access_token {
            Some(token) => executor.with_access_token(token.clone()),
            None => executor,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_without_sources() {
        let config = ProvisionConfig::load_with(None, env(&[])).unwrap();
        assert_eq!(config.oauth.redirect_uri, DEFAULT_REDIRECT_URI);
        assert_eq!(config.oauth.scopes.len(), 2);
        assert_eq!(config.pulumi.work_dir, PathBuf::from("infra"));
        assert_eq!(config.pulumi.apply_timeout, Duration::from_secs(900));
        assert_eq!(config.pulumi.command_timeout, Duration::from_secs(120));
        assert_eq!(config.grant.role, "roles/bigquery.dataViewer");
        assert_eq!(config.log.format, LogFormat::Pretty);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("oauth.client_id"))
        ));
        assert!(matches!(
            config.require_member(),
            Err(ConfigError::Missing("grant.member"))
        ));
    }

    #[test]
    fn env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gbq-provision.toml");
        std::fs::write(
            &path,
            r#"
[oauth]
client_id = "from-file"
client_secret = "file-secret"
scopes = ["https://www.googleapis.com/auth/bigquery"]

[grant]
member = "user:alice@example.com"

[log]
format = "json"
"#,
        )
        .unwrap();

        let config = ProvisionConfig::load_with(
            Some(&path),
            env(&[("CLIENT_ID", "from-env"), ("GRANT_ROLE", "roles/bigquery.dataEditor")]),
        )
        .unwrap();
        assert_eq!(config.oauth.client_id.as_deref(), Some("from-env"));
        assert_eq!(config.oauth.scopes.len(), 1);
        assert_eq!(config.require_member().unwrap(), "user:alice@example.com");
        assert_eq!(config.grant.role, "roles/bigquery.dataEditor");
        assert_eq!(config.log.format, LogFormat::Json);
        let client = config.oauth_client().unwrap();
        assert_eq!(client.client_id(), "from-env");
        assert_eq!(client.client_secret().expose(), "file-secret");
    }

    #[test]
    fn empty_env_values_are_unset() {
        let config =
            ProvisionConfig::load_with(None, env(&[("CLIENT_ID", ""), ("LOG_LEVEL", " ")])).unwrap();
        assert!(config.oauth.client_id.is_none());
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(matches!(
            ProvisionConfig::load_with(None, env(&[("PULUMI_APPLY_TIMEOUT_SECS", "soon")])),
            Err(ConfigError::Invalid {
                key: "pulumi.apply_timeout_secs",
                ..
            })
        ));
        assert!(matches!(
            ProvisionConfig::load_with(None, env(&[("PULUMI_COMMAND_TIMEOUT_SECS", "-1")])),
            Err(ConfigError::Invalid {
                key: "pulumi.command_timeout_secs",
                ..
            })
        ));
        assert!(matches!(
            ProvisionConfig::load_with(None, env(&[("LOG_FORMAT", "xml")])),
            Err(ConfigError::Invalid {
                key: "log.format",
                ..
            })
        ));

        let config = ProvisionConfig::load_with(
            None,
            env(&[
                ("CLIENT_ID", "id"),
                ("CLIENT_SECRET", "secret"),
                ("REDIRECT_URI", "not a url"),
            ]),
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                key: "oauth.redirect_uri",
                ..
            })
        ));
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[oauth]\nclient = \"typo\"\n").unwrap();
        assert!(matches!(
            ProvisionConfig::load_with(Some(&path), env(&[])),
            Err(ConfigError::TomlParse { .. })
        ));
    }

    #[test]
    fn pulumi_executor_requires_project_dir() {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = dir.path().to_string_lossy().into_owned();
        let config = ProvisionConfig::load_with(None, env(&[("PULUMI_WORK_DIR", work_dir.as_str())])).unwrap();
        assert!(matches!(
            config.pulumi_executor(),
            Err(ConfigError::Invalid {
                key: "pulumi.work_dir",
                ..
            })
        ));

        std::fs::write(dir.path().join("Pulumi.yaml"), "name: gbq-integration\n").unwrap();
        let executor = config.pulumi_executor().unwrap();
        assert_eq!(executor.work_dir(), dir.path());
    }
}
