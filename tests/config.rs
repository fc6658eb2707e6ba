use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;

use scenariolink::config::ConfigLoader;
use scenariolink::error::ScenarioLinkError;

#[test]
fn resolve_reads_file_overrides() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("scenariolink.json");
    fs::write(
        &path,
        r#"{
            "api_base": "https://sandbox.zenodo.org/api/",
            "request_timeout_secs": 5,
            "max_attempts": 4,
            "unfold_command": ["python", "-m", "unfold_cli"]
        }"#,
    )
    .unwrap();

    let settings = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(settings.api_base, "https://sandbox.zenodo.org/api/");
    assert_eq!(settings.request_timeout, Duration::from_secs(5));
    assert_eq!(settings.max_attempts, 4);
    assert_eq!(settings.unfold_command, vec!["python", "-m", "unfold_cli"]);
    assert!(settings.catalog_url.ends_with("list.csv"));
}

#[test]
fn explicit_missing_file_is_read_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(ScenarioLinkError::ConfigRead(_))
    );
}

#[test]
fn malformed_file_is_parse_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("scenariolink.json");
    fs::write(&path, r#"{"max_attempts": "twice"}"#).unwrap();
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(ScenarioLinkError::ConfigParse(_))
    );
}

#[test]
fn unknown_keys_are_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("scenariolink.json");
    fs::write(&path, r#"{"cache": "/tmp"}"#).unwrap();
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(ScenarioLinkError::ConfigParse(_))
    );
}
