//! Integration tests for configuration loading

use pothole_edge::infra::Config;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[device]
id = "truck-42"

[backend]
url = "https://potholes.example.com/"
username = "truck-42"
password = "hunter2"
timeout_ms = 3000

[fusion]
window_timeout_ms = 1500
cooldown_ms = 4000
vision_high_confidence = 0.85
vibration_threshold = 0.5

[delivery]
poll_interval_secs = 5
backoff_base_ms = 500
backoff_max_ms = 60000
max_attempts = 4

[store]
dir = "/var/lib/pothole/buffer"

[metrics]
interval_secs = 15
prometheus_port = 9091
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.device_id(), "truck-42");
    assert_eq!(config.backend_url(), "https://potholes.example.com");
    assert_eq!(config.backend_username(), "truck-42");
    assert_eq!(config.backend_timeout(), Duration::from_millis(3000));
    assert_eq!(config.window_timeout(), Duration::from_millis(1500));
    assert_eq!(config.cooldown(), Duration::from_millis(4000));
    assert_eq!(config.vision_high_confidence(), 0.85);
    assert_eq!(config.vibration_threshold(), 0.5);
    assert_eq!(config.poll_interval(), Duration::from_secs(5));
    assert_eq!(config.backoff_base(), Duration::from_millis(500));
    assert_eq!(config.max_attempts(), 4);
    assert_eq!(config.store_dir(), "/var/lib/pothole/buffer");
    assert_eq!(config.prometheus_port(), 9091);

    // Unset options keep their defaults
    assert_eq!(config.model_confidence_threshold(), 0.25);
    assert_eq!(config.detection_label(), "pothole");
    assert_eq!(config.max_auth_retries(), 2);
    assert_eq!(config.token_refresh_margin(), Duration::from_secs(60));
}

#[test]
fn test_missing_backend_section_is_an_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[device]\nid = \"x\"\n").unwrap();
    temp_file.flush().unwrap();

    assert!(Config::from_file(temp_file.path()).is_err());
}

#[test]
fn test_invalid_values_are_rejected() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file
        .write_all(
            br#"
[backend]
url = "http://localhost:8080"
username = "d"
password = "p"

[fusion]
model_confidence_threshold = 1.5
"#,
        )
        .unwrap();
    temp_file.flush().unwrap();

    let err = Config::from_file(temp_file.path()).unwrap_err();
    assert!(format!("{:#}", err).contains("model_confidence_threshold"));
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.backend_url(), "http://localhost:8080");
    assert_eq!(config.window_timeout(), Duration::from_millis(2000));
    assert_eq!(config.cooldown(), Duration::from_millis(5000));
    assert_eq!(config.config_file(), "default");
}

#[test]
fn test_bundled_dev_config_loads() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/dev.toml");
    let config = Config::from_file(path).unwrap();
    assert_eq!(config.device_id(), "dev-truck-01");
    assert_eq!(config.backend_url(), "http://localhost:8080");
}
