//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device_id")]
    pub id: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { id: default_device_id() }
    }
}

fn default_device_id() -> String {
    "pothole-edge".to_string()
}

#[derive(Clone, Deserialize)]
pub struct BackendConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_backend_timeout_ms")]
    pub timeout_ms: u64,
    /// Pending backlog size above which a health probe runs before draining
    #[serde(default = "default_health_check_backlog")]
    pub health_check_backlog: usize,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("timeout_ms", &self.timeout_ms)
            .field("health_check_backlog", &self.health_check_backlog)
            .finish_non_exhaustive()
    }
}

fn default_backend_timeout_ms() -> u64 {
    10_000
}

fn default_health_check_backlog() -> usize {
    20
}

#[derive(Debug, Clone, Deserialize)]
pub struct FusionConfig {
    /// Minimum detector confidence for a detection to count as vision evidence
    #[serde(default = "default_model_confidence_threshold")]
    pub model_confidence_threshold: f64,
    #[serde(default = "default_detection_label")]
    pub detection_label: String,
    #[serde(default = "default_window_timeout_ms")]
    pub window_timeout_ms: u64,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Vision confidence that confirms an incident without other sensors
    #[serde(default = "default_vision_high_confidence")]
    pub vision_high_confidence: f64,
    #[serde(default = "default_vibration_threshold")]
    pub vibration_threshold: f64,
    /// Distance increase over the road baseline that counts as a drop (cm)
    #[serde(default = "default_ultrasonic_drop_cm")]
    pub ultrasonic_drop_cm: f64,
    #[serde(default = "default_ultrasonic_baseline_alpha")]
    pub ultrasonic_baseline_alpha: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            model_confidence_threshold: default_model_confidence_threshold(),
            detection_label: default_detection_label(),
            window_timeout_ms: default_window_timeout_ms(),
            cooldown_ms: default_cooldown_ms(),
            vision_high_confidence: default_vision_high_confidence(),
            vibration_threshold: default_vibration_threshold(),
            ultrasonic_drop_cm: default_ultrasonic_drop_cm(),
            ultrasonic_baseline_alpha: default_ultrasonic_baseline_alpha(),
        }
    }
}

fn default_model_confidence_threshold() -> f64 {
    0.25
}

fn default_detection_label() -> String {
    "pothole".to_string()
}

fn default_window_timeout_ms() -> u64 {
    2000
}

fn default_cooldown_ms() -> u64 {
    5000
}

fn default_vision_high_confidence() -> f64 {
    0.9
}

fn default_vibration_threshold() -> f64 {
    0.6
}

fn default_ultrasonic_drop_cm() -> f64 {
    4.0
}

fn default_ultrasonic_baseline_alpha() -> f64 {
    0.1
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_detector_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_detector_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self { interval_ms: default_detector_interval_ms(), timeout_ms: default_detector_timeout_ms() }
    }
}

fn default_detector_interval_ms() -> u64 {
    200
}

fn default_detector_timeout_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Failed attempts after which a record is dead-lettered
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_auth_retries")]
    pub max_auth_retries: u32,
    #[serde(default = "default_token_refresh_margin_secs")]
    pub token_refresh_margin_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_attempts: default_max_attempts(),
            max_auth_retries: default_max_auth_retries(),
            token_refresh_margin_secs: default_token_refresh_margin_secs(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    300_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_max_auth_retries() -> u32 {
    2
}

fn default_token_refresh_margin_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_dir")]
    pub dir: String,
    /// In-memory events held while the disk is unwritable
    #[serde(default = "default_overflow_capacity")]
    pub overflow_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { dir: default_store_dir(), overflow_capacity: default_overflow_capacity() }
    }
}

fn default_store_dir() -> String {
    "offline_buffer".to_string()
}

fn default_overflow_capacity() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default)]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs(), prometheus_port: 0 }
    }
}

fn default_metrics_interval_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Clone)]
pub struct Config {
    device_id: String,
    backend_url: String,
    backend_username: String,
    backend_password: String,
    backend_timeout_ms: u64,
    health_check_backlog: usize,
    model_confidence_threshold: f64,
    detection_label: String,
    window_timeout_ms: u64,
    cooldown_ms: u64,
    vision_high_confidence: f64,
    vibration_threshold: f64,
    ultrasonic_drop_cm: f64,
    ultrasonic_baseline_alpha: f64,
    detector_interval_ms: u64,
    detector_timeout_ms: u64,
    poll_interval_secs: u64,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
    max_attempts: u32,
    max_auth_retries: u32,
    token_refresh_margin_secs: u64,
    store_dir: String,
    overflow_capacity: usize,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

// Hand-written so the password never reaches a log line
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("device_id", &self.device_id)
            .field("backend_url", &self.backend_url)
            .field("backend_username", &self.backend_username)
            .field("backend_password", &"<redacted>")
            .field("window_timeout_ms", &self.window_timeout_ms)
            .field("cooldown_ms", &self.cooldown_ms)
            .field("vision_high_confidence", &self.vision_high_confidence)
            .field("store_dir", &self.store_dir)
            .field("config_file", &self.config_file)
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        let fusion = FusionConfig::default();
        let detector = DetectorConfig::default();
        let delivery = DeliveryConfig::default();
        let store = StoreConfig::default();
        let metrics = MetricsConfig::default();
        Self {
            device_id: default_device_id(),
            backend_url: "http://localhost:8080".to_string(),
            backend_username: "device".to_string(),
            backend_password: String::new(),
            backend_timeout_ms: default_backend_timeout_ms(),
            health_check_backlog: default_health_check_backlog(),
            model_confidence_threshold: fusion.model_confidence_threshold,
            detection_label: fusion.detection_label,
            window_timeout_ms: fusion.window_timeout_ms,
            cooldown_ms: fusion.cooldown_ms,
            vision_high_confidence: fusion.vision_high_confidence,
            vibration_threshold: fusion.vibration_threshold,
            ultrasonic_drop_cm: fusion.ultrasonic_drop_cm,
            ultrasonic_baseline_alpha: fusion.ultrasonic_baseline_alpha,
            detector_interval_ms: detector.interval_ms,
            detector_timeout_ms: detector.timeout_ms,
            poll_interval_secs: delivery.poll_interval_secs,
            backoff_base_ms: delivery.backoff_base_ms,
            backoff_max_ms: delivery.backoff_max_ms,
            max_attempts: delivery.max_attempts,
            max_auth_retries: delivery.max_auth_retries,
            token_refresh_margin_secs: delivery.token_refresh_margin_secs,
            store_dir: store.dir,
            overflow_capacity: store.overflow_capacity,
            metrics_interval_secs: metrics.interval_secs,
            prometheus_port: metrics.prometheus_port,
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self {
            device_id: toml_config.device.id,
            backend_url: toml_config.backend.url.trim_end_matches('/').to_string(),
            backend_username: toml_config.backend.username,
            backend_password: toml_config.backend.password,
            backend_timeout_ms: toml_config.backend.timeout_ms,
            health_check_backlog: toml_config.backend.health_check_backlog,
            model_confidence_threshold: toml_config.fusion.model_confidence_threshold,
            detection_label: toml_config.fusion.detection_label,
            window_timeout_ms: toml_config.fusion.window_timeout_ms,
            cooldown_ms: toml_config.fusion.cooldown_ms,
            vision_high_confidence: toml_config.fusion.vision_high_confidence,
            vibration_threshold: toml_config.fusion.vibration_threshold,
            ultrasonic_drop_cm: toml_config.fusion.ultrasonic_drop_cm,
            ultrasonic_baseline_alpha: toml_config.fusion.ultrasonic_baseline_alpha,
            detector_interval_ms: toml_config.detector.interval_ms,
            detector_timeout_ms: toml_config.detector.timeout_ms,
            poll_interval_secs: toml_config.delivery.poll_interval_secs,
            backoff_base_ms: toml_config.delivery.backoff_base_ms,
            backoff_max_ms: toml_config.delivery.backoff_max_ms,
            max_attempts: toml_config.delivery.max_attempts,
            max_auth_retries: toml_config.delivery.max_auth_retries,
            token_refresh_margin_secs: toml_config.delivery.token_refresh_margin_secs,
            store_dir: toml_config.store.dir,
            overflow_capacity: toml_config.store.overflow_capacity,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file: path.display().to_string(),
        };
        config.validate().with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Reject values that would break the fusion or delivery invariants
    fn validate(&self) -> anyhow::Result<()> {
        let unit = 0.0..=1.0;
        if !unit.contains(&self.model_confidence_threshold) {
            anyhow::bail!("fusion.model_confidence_threshold must be within [0, 1]");
        }
        if !unit.contains(&self.vision_high_confidence) {
            anyhow::bail!("fusion.vision_high_confidence must be within [0, 1]");
        }
        if self.vision_high_confidence < self.model_confidence_threshold {
            anyhow::bail!("fusion.vision_high_confidence must not be below model_confidence_threshold");
        }
        if !(self.ultrasonic_baseline_alpha > 0.0 && self.ultrasonic_baseline_alpha <= 1.0) {
            anyhow::bail!("fusion.ultrasonic_baseline_alpha must be within (0, 1]");
        }
        if self.window_timeout_ms == 0 {
            anyhow::bail!("fusion.window_timeout_ms must be positive");
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            anyhow::bail!("delivery.backoff_max_ms must not be below backoff_base_ms");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("delivery.max_attempts must be at least 1");
        }
        if self.overflow_capacity == 0 {
            anyhow::bail!("store.overflow_capacity must be at least 1");
        }
        Ok(())
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    /// Load configuration from an explicit path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    pub fn backend_username(&self) -> &str {
        &self.backend_username
    }

    pub fn backend_password(&self) -> &str {
        &self.backend_password
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn health_check_backlog(&self) -> usize {
        self.health_check_backlog
    }

    pub fn model_confidence_threshold(&self) -> f64 {
        self.model_confidence_threshold
    }

    pub fn detection_label(&self) -> &str {
        &self.detection_label
    }

    pub fn window_timeout(&self) -> Duration {
        Duration::from_millis(self.window_timeout_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn vision_high_confidence(&self) -> f64 {
        self.vision_high_confidence
    }

    pub fn vibration_threshold(&self) -> f64 {
        self.vibration_threshold
    }

    pub fn ultrasonic_drop_cm(&self) -> f64 {
        self.ultrasonic_drop_cm
    }

    pub fn ultrasonic_baseline_alpha(&self) -> f64 {
        self.ultrasonic_baseline_alpha
    }

    pub fn detector_interval(&self) -> Duration {
        Duration::from_millis(self.detector_interval_ms)
    }

    pub fn detector_timeout(&self) -> Duration {
        Duration::from_millis(self.detector_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn max_auth_retries(&self) -> u32 {
        self.max_auth_retries
    }

    pub fn token_refresh_margin(&self) -> Duration {
        Duration::from_secs(self.token_refresh_margin_secs)
    }

    pub fn store_dir(&self) -> &str {
        &self.store_dir
    }

    pub fn overflow_capacity(&self) -> usize {
        self.overflow_capacity
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder for tests and tools that need an isolated store directory
    pub fn with_store_dir(mut self, dir: &str) -> Self {
        self.store_dir = dir.to_string();
        self
    }

    /// Builder for tests that need fast retries
    pub fn with_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.backoff_base_ms = base_ms;
        self.backoff_max_ms = max_ms;
        self
    }

    /// Builder for tests that exercise the dead-letter ceiling
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Builder for tests that need small overflow buffers
    pub fn with_overflow_capacity(mut self, capacity: usize) -> Self {
        self.overflow_capacity = capacity;
        self
    }

    pub fn with_health_check_backlog(mut self, backlog: usize) -> Self {
        self.health_check_backlog = backlog;
        self
    }

    pub fn with_poll_interval_secs(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    pub fn with_detector(mut self, interval_ms: u64, timeout_ms: u64) -> Self {
        self.detector_interval_ms = interval_ms;
        self.detector_timeout_ms = timeout_ms;
        self
    }
}
