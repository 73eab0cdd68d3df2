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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareMode {
    /// Timing board on a serial port
    Serial,
    /// In-process simulated lanes
    Sim,
}

impl HardwareMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HardwareMode::Serial => "serial",
            HardwareMode::Sim => "sim",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "race-timer".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Minimum interval between two triggers on one lane
    pub debounce_ms: u64,
    /// Lane times this close are a tie
    pub tie_tolerance_ms: u64,
    /// Racing longer than this finishes the race with DNF lanes
    pub max_race_ms: u64,
    /// Finished races kept in memory
    pub history_size: usize,
    /// Capacity of the ordered input queue
    pub queue_capacity: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 5,
            tie_tolerance_ms: 1,
            max_race_ms: 10_000,
            history_size: 50,
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub mode: HardwareMode,
    pub device: String,
    pub baud: u32,
    /// Bound on waiting for a command acknowledgment
    pub ack_timeout_ms: u64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            mode: HardwareMode::Serial,
            device: "/dev/ttyUSB0".to_string(),
            baud: 115_200,
            ack_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Simulated lane times; 0 means the car never reaches the finish gate
    pub lane1_ms: u64,
    pub lane2_ms: u64,
    /// Delay between load and both lanes reporting armed
    pub arm_delay_ms: u64,
    /// Delay before a command is acknowledged
    pub ack_delay_ms: u64,
    /// Emit a second finish edge shortly after the first
    pub bounce: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            lane1_ms: 2345,
            lane2_ms: 2400,
            arm_delay_ms: 200,
            ack_delay_ms: 5,
            bounce: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Per-observer queue bound
    pub subscriber_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self { subscriber_capacity: 256 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Command/status HTTP port (0 to disable)
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Events publish to `<topic_prefix>/<event name>`
    pub topic_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 1883,
            topic_prefix: "race".to_string(),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 10 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub simulator: SimulatorConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Race timing parameters handed to the state machine and sensor gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingSettings {
    pub debounce: Duration,
    pub tie_tolerance: Duration,
    pub max_race: Duration,
    pub history_size: usize,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(5),
            tie_tolerance: Duration::from_millis(1),
            max_race: Duration::from_secs(10),
            history_size: 50,
        }
    }
}

/// Simulated hardware behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimSettings {
    pub lane_times: [Option<Duration>; 2],
    pub arm_delay: Duration,
    pub ack_delay: Duration,
    pub bounce: bool,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            lane_times: [Some(Duration::from_millis(2345)), Some(Duration::from_millis(2400))],
            arm_delay: Duration::from_millis(200),
            ack_delay: Duration::from_millis(5),
            bounce: true,
        }
    }
}

fn lane_time(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    timing: TimingSettings,
    queue_capacity: usize,
    hardware_mode: HardwareMode,
    serial_device: String,
    serial_baud: u32,
    ack_timeout_ms: u64,
    sim: SimSettings,
    subscriber_capacity: usize,
    http_port: u16,
    mqtt_enabled: bool,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_topic_prefix: String,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
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

        let config = Self::from_toml(toml_config, path.display().to_string());
        config.validate().with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        let t = toml_config.timing;
        let sim = toml_config.simulator;
        Self {
            site_id: toml_config.site.id,
            timing: TimingSettings {
                debounce: Duration::from_millis(t.debounce_ms),
                tie_tolerance: Duration::from_millis(t.tie_tolerance_ms),
                max_race: Duration::from_millis(t.max_race_ms),
                history_size: t.history_size,
            },
            queue_capacity: t.queue_capacity,
            hardware_mode: toml_config.hardware.mode,
            serial_device: toml_config.hardware.device,
            serial_baud: toml_config.hardware.baud,
            ack_timeout_ms: toml_config.hardware.ack_timeout_ms,
            sim: SimSettings {
                lane_times: [lane_time(sim.lane1_ms), lane_time(sim.lane2_ms)],
                arm_delay: Duration::from_millis(sim.arm_delay_ms),
                ack_delay: Duration::from_millis(sim.ack_delay_ms),
                bounce: sim.bounce,
            },
            subscriber_capacity: toml_config.broadcast.subscriber_capacity,
            http_port: toml_config.http.port,
            mqtt_enabled: toml_config.mqtt.enabled,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_topic_prefix: toml_config.mqtt.topic_prefix,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file,
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.queue_capacity > 0, "timing.queue_capacity must be > 0");
        anyhow::ensure!(self.subscriber_capacity > 0, "broadcast.subscriber_capacity must be > 0");
        anyhow::ensure!(self.ack_timeout_ms > 0, "hardware.ack_timeout_ms must be > 0");
        anyhow::ensure!(self.timing.max_race > Duration::ZERO, "timing.max_race_ms must be > 0");
        anyhow::ensure!(self.metrics_interval_secs > 0, "metrics.interval_secs must be > 0");
        Ok(())
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn timing(&self) -> TimingSettings {
        self.timing
    }

    pub fn debounce_ms(&self) -> u64 {
        self.timing.debounce.as_millis() as u64
    }

    pub fn tie_tolerance_ms(&self) -> u64 {
        self.timing.tie_tolerance.as_millis() as u64
    }

    pub fn max_race_ms(&self) -> u64 {
        self.timing.max_race.as_millis() as u64
    }

    pub fn history_size(&self) -> usize {
        self.timing.history_size
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn hardware_mode(&self) -> HardwareMode {
        self.hardware_mode
    }

    pub fn serial_device(&self) -> &str {
        &self.serial_device
    }

    pub fn serial_baud(&self) -> u32 {
        self.serial_baud
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn sim(&self) -> SimSettings {
        self.sim
    }

    pub fn subscriber_capacity(&self) -> usize {
        self.subscriber_capacity
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn mqtt_enabled(&self) -> bool {
        self.mqtt_enabled
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_topic_prefix(&self) -> &str {
        &self.mqtt_topic_prefix
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.site_id(), "race-timer");
        assert_eq!(config.debounce_ms(), 5);
        assert_eq!(config.tie_tolerance_ms(), 1);
        assert_eq!(config.max_race_ms(), 10_000);
        assert_eq!(config.history_size(), 50);
        assert_eq!(config.hardware_mode(), HardwareMode::Serial);
        assert_eq!(config.ack_timeout(), Duration::from_secs(2));
        assert_eq!(config.http_port(), 8080);
        assert!(!config.mqtt_enabled());
        assert_eq!(config.timing(), TimingSettings::default());
        assert_eq!(config.sim(), SimSettings::default());
    }

    #[test]
    fn test_resolve_config_path_default() {
        let args: Vec<String> = vec!["race-timer".to_string()];
        if env::var("CONFIG_FILE").is_err() {
            assert_eq!(Config::resolve_config_path(&args), "config/dev.toml");
        }
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> =
            vec!["race-timer".to_string(), "--config".to_string(), "config/track.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/track.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg_equals() {
        let args: Vec<String> =
            vec!["race-timer".to_string(), "--config=config/gym.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/gym.toml");
    }

    #[test]
    fn test_partial_toml_uses_section_defaults() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
[timing]
tie_tolerance_ms = 2

[hardware]
mode = "sim"
"#,
        )
        .unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string());
        assert_eq!(config.tie_tolerance_ms(), 2);
        assert_eq!(config.debounce_ms(), 5);
        assert_eq!(config.hardware_mode(), HardwareMode::Sim);
        assert_eq!(config.serial_baud(), 115_200);
    }

    #[test]
    fn test_simulator_zero_lane_never_finishes() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
[simulator]
lane1_ms = 1900
lane2_ms = 2000
"#,
        )
        .unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string());
        assert_eq!(config.sim().lane_times[0], Some(Duration::from_millis(1900)));

        let toml_config: TomlConfig = toml::from_str("[simulator]\nlane2_ms = 0\n").unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string());
        assert_eq!(config.sim().lane_times[1], None);
    }
}
