//! Integration tests for layered configuration loading

use serde::Deserialize;
use std::io::Write;
use vigil_core::{ConfigLoader, LoggingConfig, Validatable, VigilError};

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
struct Scheduling {
    workers: u32,
    eager: bool,
}

fn write_temp(suffix: &str, content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_toml_file_layer() {
    let file = write_temp(".toml", "[scheduling]\nworkers = 4\neager = true\n");
    let scheduling: Scheduling = ConfigLoader::new()
        .with_file(file.path())
        .unwrap()
        .load_section("scheduling")
        .unwrap();
    assert_eq!(
        scheduling,
        Scheduling {
            workers: 4,
            eager: true
        }
    );
}

#[test]
fn test_required_file_missing_fails() {
    let err = ConfigLoader::new()
        .with_file("/definitely/not/here.toml")
        .unwrap()
        .load_section::<Scheduling>("scheduling")
        .unwrap_err();
    assert!(matches!(err, VigilError::Configuration(_)));
}

#[test]
fn test_env_overrides_file() {
    let file = write_temp(".json", r#"{"scheduling": {"workers": 2, "eager": false}}"#);
    temp_env::with_var("VIGILTEST_SCHEDULING__WORKERS", Some("9"), || {
        let scheduling: Scheduling = ConfigLoader::new()
            .with_file(file.path())
            .unwrap()
            .with_env("VIGILTEST")
            .load_section("scheduling")
            .unwrap();
        assert_eq!(scheduling.workers, 9);
        assert!(!scheduling.eager);
    });
}

#[test]
fn test_logging_section() {
    let logging: LoggingConfig = ConfigLoader::new()
        .with_str("[logging]\nfilter = \"vigil_commanding=trace\"\njson = true", vigil_core::ConfigFormat::Toml)
        .load_section("logging")
        .unwrap();
    assert!(logging.json);
    assert!(logging.is_valid());
}
