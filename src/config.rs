use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::last_path_segment;
use crate::error::SubmitError;

pub const CONFIG_FILE_NAME: &str = "portal-submit.json";
pub const PROD_URL: &str = "https://www.encodeproject.org";
pub const DEV_URL: &str = "https://test.encodedcc.org";

pub const LAB_PROP: &str = "lab";
pub const AWARD_PROP: &str = "award";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub portal: PortalEntry,
    /// Default values for required properties, keyed by property name.
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
    #[serde(default)]
    pub submission: SubmissionEntry,
    #[serde(default)]
    pub storage: StorageEntry,
    #[serde(default)]
    pub transfer: TransferEntry,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PortalEntry {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub database_reads: Option<bool>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SubmissionEntry {
    #[serde(default)]
    pub dry_run: Option<bool>,
    #[serde(default)]
    pub require_aliases: Option<bool>,
    #[serde(default)]
    pub extend_array_values: Option<bool>,
    #[serde(default)]
    pub upload_file: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct StorageEntry {
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct TransferEntry {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub poll_attempts: Option<u32>,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
}

/// Values read once from the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub mode: Option<String>,
    pub api_key: Option<String>,
    pub secret_key: Option<String>,
    pub lab: Option<String>,
    pub award: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub gcp_project: Option<String>,
    pub gcp_access_token: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            mode: env_value("DCC_MODE"),
            api_key: env_value("DCC_API_KEY"),
            secret_key: env_value("DCC_SECRET_KEY"),
            lab: env_value("DCC_LAB"),
            award: env_value("DCC_AWARD"),
            aws_access_key_id: env_value("AWS_ACCESS_KEY_ID"),
            aws_secret_access_key: env_value("AWS_SECRET_ACCESS_KEY"),
            gcp_project: env_value("GCP_PROJECT"),
            gcp_access_token: env_value("GOOGLE_OAUTH_ACCESS_TOKEN"),
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Process-wide default property values. Built once at startup and only read afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessDefaults {
    values: BTreeMap<String, Value>,
    alias_prefix: Option<String>,
}

impl ProcessDefaults {
    pub fn new(values: BTreeMap<String, Value>) -> Self {
        let alias_prefix = values
            .get(LAB_PROP)
            .and_then(Value::as_str)
            .map(last_path_segment)
            .filter(|lab| !lab.is_empty())
            .map(str::to_string);
        Self {
            values,
            alias_prefix,
        }
    }

    pub fn get(&self, property: &str) -> Option<&Value> {
        self.values.get(property)
    }

    pub fn alias_prefix(&self) -> Option<&str> {
        self.alias_prefix.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PortalCredentials {
    pub api_key: String,
    pub secret_key: String,
}

#[derive(Debug, Clone)]
pub struct PortalSettings {
    pub url: String,
    pub credentials: Option<PortalCredentials>,
    pub database_reads: bool,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct SubmissionSettings {
    pub dry_run: bool,
    pub require_aliases: bool,
    pub extend_array_values: bool,
    pub upload_file: bool,
}

impl Default for SubmissionSettings {
    fn default() -> Self {
        Self {
            dry_run: false,
            require_aliases: true,
            extend_array_values: true,
            upload_file: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub region: String,
}

#[derive(Debug, Clone)]
pub struct AwsAccessKey {
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub project: Option<String>,
    pub access_token: Option<String>,
    pub aws_source: Option<AwsAccessKey>,
    pub poll_attempts: u32,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub schema_version: u32,
    pub portal: PortalSettings,
    pub defaults: ProcessDefaults,
    pub submission: SubmissionSettings,
    pub storage: StorageSettings,
    pub transfer: TransferSettings,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<Settings, SubmitError> {
        let config = match Self::locate(path)? {
            Some(config_path) => {
                let content = fs::read_to_string(&config_path)
                    .map_err(|_| SubmitError::ConfigRead(config_path.clone()))?;
                serde_json::from_str(&content)
                    .map_err(|err| SubmitError::ConfigParse(err.to_string()))?
            }
            None => Config::default(),
        };
        Self::resolve_config(config, EnvOverrides::from_env())
    }

    fn locate(path: Option<&str>) -> Result<Option<PathBuf>, SubmitError> {
        if let Some(path) = path {
            let explicit = PathBuf::from(path);
            if !explicit.exists() {
                return Err(SubmitError::MissingConfig);
            }
            return Ok(Some(explicit));
        }
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Ok(Some(local));
        }
        Ok(ProjectDirs::from("org", "portal-submit", "portal-submit")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
            .filter(|candidate| candidate.exists()))
    }

    pub fn resolve_config(config: Config, env: EnvOverrides) -> Result<Settings, SubmitError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let mode = env
            .mode
            .or(config.portal.mode)
            .unwrap_or_else(|| "prod".to_string());
        let url = portal_url(&mode)?;
        let api_key = env.api_key.or(config.portal.api_key);
        let secret_key = env.secret_key.or(config.portal.secret_key);
        let credentials = match (api_key, secret_key) {
            (Some(api_key), Some(secret_key)) => Some(PortalCredentials {
                api_key,
                secret_key,
            }),
            (None, None) => None,
            _ => {
                return Err(SubmitError::InvalidConfig(
                    "portal api_key and secret_key must be set together".to_string(),
                ));
            }
        };

        let mut defaults = config.defaults;
        if let Some(lab) = env.lab {
            defaults.insert(LAB_PROP.to_string(), Value::String(lab));
        }
        if let Some(award) = env.award {
            defaults.insert(AWARD_PROP.to_string(), Value::String(award));
        }

        let base = SubmissionSettings::default();
        let submission = SubmissionSettings {
            dry_run: config.submission.dry_run.unwrap_or(base.dry_run),
            require_aliases: config
                .submission
                .require_aliases
                .unwrap_or(base.require_aliases),
            extend_array_values: config
                .submission
                .extend_array_values
                .unwrap_or(base.extend_array_values),
            upload_file: config.submission.upload_file.unwrap_or(base.upload_file),
        };

        let aws_source = match (env.aws_access_key_id, env.aws_secret_access_key) {
            (Some(access_key_id), Some(secret_access_key)) => Some(AwsAccessKey {
                access_key_id,
                secret_access_key,
            }),
            _ => None,
        };

        Ok(Settings {
            schema_version,
            portal: PortalSettings {
                url,
                credentials,
                // Reads skip the search index unless turned off.
                database_reads: config.portal.database_reads.unwrap_or(true),
                timeout: Duration::from_secs(config.portal.timeout_secs.unwrap_or(60)),
            },
            defaults: ProcessDefaults::new(defaults),
            submission,
            storage: StorageSettings {
                region: config
                    .storage
                    .region
                    .unwrap_or_else(|| "us-west-2".to_string()),
            },
            transfer: TransferSettings {
                project: env.gcp_project.or(config.transfer.project),
                access_token: env.gcp_access_token.or(config.transfer.access_token),
                aws_source,
                poll_attempts: config.transfer.poll_attempts.unwrap_or(30),
                poll_interval: Duration::from_secs(
                    config.transfer.poll_interval_secs.unwrap_or(20),
                ),
            },
        })
    }
}

/// Maps `prod`/`dev` or a bare host or full URL onto a base URL without trailing slash.
pub fn portal_url(mode: &str) -> Result<String, SubmitError> {
    let mode = mode.trim();
    let url = match mode {
        "prod" => PROD_URL.to_string(),
        "dev" => DEV_URL.to_string(),
        "" => return Err(SubmitError::InvalidConfig("empty portal mode".to_string())),
        other if other.starts_with("http://") || other.starts_with("https://") => {
            other.to_string()
        }
        other if other.contains('.') => format!("https://{other}"),
        other => {
            return Err(SubmitError::InvalidConfig(format!(
                "unknown portal mode '{other}' (expected prod, dev, a host or a URL)"
            )));
        }
    };
    Ok(url.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn empty_config_resolves_to_prod_defaults() {
        let settings =
            ConfigLoader::resolve_config(Config::default(), EnvOverrides::default()).unwrap();
        assert_eq!(settings.schema_version, 1);
        assert_eq!(settings.portal.url, PROD_URL);
        assert!(settings.portal.credentials.is_none());
        assert!(settings.defaults.is_empty());
        assert!(settings.submission.require_aliases);
        assert!(!settings.submission.dry_run);
    }

    #[test]
    fn env_lab_feeds_defaults_and_alias_prefix() {
        let env = EnvOverrides {
            lab: Some("/labs/michael-snyder/".to_string()),
            award: Some("U54HG006996".to_string()),
            ..EnvOverrides::default()
        };
        let settings = ConfigLoader::resolve_config(Config::default(), env).unwrap();
        assert_eq!(
            settings.defaults.get(LAB_PROP),
            Some(&json!("/labs/michael-snyder/"))
        );
        assert_eq!(settings.defaults.alias_prefix(), Some("michael-snyder"));
        assert_eq!(settings.defaults.get(AWARD_PROP), Some(&json!("U54HG006996")));
    }

    #[test]
    fn half_credentials_are_rejected() {
        let env = EnvOverrides {
            api_key: Some("key".to_string()),
            ..EnvOverrides::default()
        };
        let err = ConfigLoader::resolve_config(Config::default(), env).unwrap_err();
        assert_matches!(err, SubmitError::InvalidConfig(_));
    }

    #[test]
    fn portal_modes() {
        assert_eq!(portal_url("dev").unwrap(), DEV_URL);
        assert_eq!(
            portal_url("demo.encodedcc.org").unwrap(),
            "https://demo.encodedcc.org"
        );
        assert_eq!(
            portal_url("https://api.data.igvf.org/").unwrap(),
            "https://api.data.igvf.org"
        );
        assert_matches!(portal_url("staging"), Err(SubmitError::InvalidConfig(_)));
    }
}
