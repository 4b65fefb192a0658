use std::io::Write;
use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::json;

use portal_submit::config::{Config, ConfigLoader, DEV_URL, EnvOverrides};
use portal_submit::error::SubmitError;

fn parse(content: &str) -> Config {
    serde_json::from_str(content).unwrap()
}

#[test]
fn parse_full_config() {
    let config = parse(
        r#"{
            "schema_version": 1,
            "portal": {"mode": "dev", "api_key": "KEY", "secret_key": "SECRET", "timeout_secs": 5},
            "defaults": {"lab": "/labs/michael-snyder/", "award": "U54HG006996"},
            "submission": {"require_aliases": false, "extend_array_values": false},
            "storage": {"region": "us-east-1"},
            "transfer": {"project": "encode-transfers", "poll_attempts": 3, "poll_interval_secs": 7}
        }"#,
    );
    let settings = ConfigLoader::resolve_config(config, EnvOverrides::default()).unwrap();

    assert_eq!(settings.portal.url, DEV_URL);
    assert_eq!(settings.portal.timeout, Duration::from_secs(5));
    assert!(settings.portal.database_reads);
    let credentials = settings.portal.credentials.unwrap();
    assert_eq!(credentials.api_key, "KEY");
    assert_eq!(settings.defaults.alias_prefix(), Some("michael-snyder"));
    assert!(!settings.submission.require_aliases);
    assert!(!settings.submission.extend_array_values);
    assert!(settings.submission.upload_file);
    assert_eq!(settings.storage.region, "us-east-1");
    assert_eq!(settings.transfer.project.as_deref(), Some("encode-transfers"));
    assert_eq!(settings.transfer.poll_attempts, 3);
    assert_eq!(settings.transfer.poll_interval, Duration::from_secs(7));
    assert!(settings.transfer.aws_source.is_none());
}

#[test]
fn environment_wins_over_file() {
    let config = parse(
        r#"{"portal": {"mode": "dev"}, "defaults": {"lab": "/labs/other/"},
            "transfer": {"project": "from-file"}}"#,
    );
    let env = EnvOverrides {
        mode: Some("https://demo.encodedcc.org/".to_string()),
        lab: Some("/labs/michael-snyder/".to_string()),
        gcp_project: Some("from-env".to_string()),
        aws_access_key_id: Some("AKIA".to_string()),
        aws_secret_access_key: Some("secret".to_string()),
        ..EnvOverrides::default()
    };
    let settings = ConfigLoader::resolve_config(config, env).unwrap();
    assert_eq!(settings.portal.url, "https://demo.encodedcc.org");
    assert_eq!(settings.defaults.get("lab"), Some(&json!("/labs/michael-snyder/")));
    assert_eq!(settings.transfer.project.as_deref(), Some("from-env"));
    assert!(settings.transfer.aws_source.is_some());
}

#[test]
fn database_reads_can_be_turned_off() {
    let config = parse(r#"{"portal": {"mode": "dev", "database_reads": false}}"#);
    let settings = ConfigLoader::resolve_config(config, EnvOverrides::default()).unwrap();
    assert!(!settings.portal.database_reads);
}

#[test]
fn unknown_mode_is_rejected() {
    let config = parse(r#"{"portal": {"mode": "staging"}}"#);
    assert_matches!(
        ConfigLoader::resolve_config(config, EnvOverrides::default()),
        Err(SubmitError::InvalidConfig(_))
    );
}

#[test]
fn explicit_config_path_must_exist() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("portal-submit.json");
    assert_matches!(
        ConfigLoader::resolve(missing.to_str()),
        Err(SubmitError::MissingConfig)
    );
}

#[test]
fn malformed_config_file_is_a_parse_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"{\"portal\": {\"mode\": ").unwrap();
    assert_matches!(
        ConfigLoader::resolve(file.path().to_str()),
        Err(SubmitError::ConfigParse(_))
    );
}
