use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use cinder_config::{ConfigError, SettingsSource, SettingsStore, load_settings_with};

#[test]
fn document_and_overrides_merge() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("settings.json");
    fs::write(
        &path,
        r#"{
            "streaming": {"enabled": true, "port": 8900},
            "scheduling": {"unmetered_only": true},
            "storage": {"download_dir": "/data/downloads"}
        }"#,
    )?;

    let overrides: HashMap<&str, &str> = HashMap::from([("CINDER_DOWNLOAD_DIR", "/mnt/other")]);
    let settings = load_settings_with(Some(&path), |name| {
        overrides.get(name).map(|value| (*value).to_string())
    })?;

    assert!(settings.streaming.enabled);
    assert_eq!(settings.streaming.port, 8900);
    assert!(settings.scheduling.unmetered_only);
    assert_eq!(
        settings.storage.download_dir,
        Some(PathBuf::from("/mnt/other"))
    );

    let store = SettingsStore::new(settings);
    assert_eq!(store.snapshot().streaming.port, 8900);
    Ok(())
}

#[test]
fn malformed_document_is_a_parse_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("settings.json");
    fs::write(&path, "{ not json")?;

    let err = load_settings_with(Some(&path), |_| None).expect_err("parse failure");
    assert!(matches!(err, ConfigError::Parse { .. }));
    Ok(())
}

#[test]
fn document_failing_validation_is_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("settings.json");
    fs::write(&path, r#"{"ip_filter": {"enabled": true}}"#)?;

    let err = load_settings_with(Some(&path), |_| None).expect_err("validation failure");
    assert!(matches!(
        err,
        ConfigError::InvalidField {
            section: "ip_filter",
            ..
        }
    ));
    Ok(())
}
