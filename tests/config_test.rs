//! Integration tests for configuration loading

use race_timer::infra::{Config, HardwareMode};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(content.as_bytes()).unwrap();
    temp_file.flush().unwrap();
    temp_file
}

#[test]
fn test_load_config_from_file() {
    let temp_file = write_config(
        r#"
[site]
id = "track-7"

[timing]
debounce_ms = 8
tie_tolerance_ms = 2
max_race_ms = 6000
history_size = 10
queue_capacity = 64

[hardware]
mode = "sim"
device = "/dev/ttyACM1"
baud = 57600
ack_timeout_ms = 500

[simulator]
lane1_ms = 1800
lane2_ms = 0
arm_delay_ms = 50
ack_delay_ms = 2
bounce = false

[broadcast]
subscriber_capacity = 32

[http]
port = 9090

[mqtt]
enabled = true
host = "broker.local"
port = 1884
topic_prefix = "track7"
username = "timer"

[metrics]
interval_secs = 15
"#,
    );

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "track-7");
    assert_eq!(config.debounce_ms(), 8);
    assert_eq!(config.tie_tolerance_ms(), 2);
    assert_eq!(config.max_race_ms(), 6000);
    assert_eq!(config.history_size(), 10);
    assert_eq!(config.queue_capacity(), 64);
    assert_eq!(config.hardware_mode(), HardwareMode::Sim);
    assert_eq!(config.serial_device(), "/dev/ttyACM1");
    assert_eq!(config.serial_baud(), 57600);
    assert_eq!(config.ack_timeout(), Duration::from_millis(500));
    assert_eq!(config.subscriber_capacity(), 32);
    assert_eq!(config.http_port(), 9090);
    assert!(config.mqtt_enabled());
    assert_eq!(config.mqtt_host(), "broker.local");
    assert_eq!(config.mqtt_port(), 1884);
    assert_eq!(config.mqtt_topic_prefix(), "track7");
    assert_eq!(config.mqtt_username(), Some("timer"));
    assert_eq!(config.mqtt_password(), None);
    assert_eq!(config.metrics_interval_secs(), 15);

    let sim = config.sim();
    assert_eq!(sim.lane_times, [Some(Duration::from_millis(1800)), None]);
    assert_eq!(sim.arm_delay, Duration::from_millis(50));
    assert!(!sim.bounce);

    let timing = config.timing();
    assert_eq!(timing.debounce, Duration::from_millis(8));
    assert_eq!(timing.max_race, Duration::from_secs(6));
}

#[test]
fn test_zero_capacity_is_rejected() {
    let temp_file = write_config(
        r#"
[broadcast]
subscriber_capacity = 0
"#,
    );

    let err = Config::from_file(temp_file.path()).unwrap_err();
    assert!(format!("{:#}", err).contains("broadcast.subscriber_capacity must be > 0"));
}

#[test]
fn test_unknown_hardware_mode_is_rejected() {
    let temp_file = write_config(
        r#"
[hardware]
mode = "usb"
"#,
    );

    assert!(Config::from_file(temp_file.path()).is_err());
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.config_file(), "default");
    assert_eq!(config.hardware_mode(), HardwareMode::Serial);
    assert_eq!(config.mqtt_host(), "localhost");
    assert_eq!(config.mqtt_port(), 1883);
    assert!(!config.mqtt_enabled());
}

#[test]
fn test_shipped_configs_parse() {
    let dev = Config::from_file("config/dev.toml").unwrap();
    assert_eq!(dev.hardware_mode(), HardwareMode::Sim);
    assert_eq!(dev.http_port(), 8080);

    let track = Config::from_file("config/track.toml").unwrap();
    assert_eq!(track.hardware_mode(), HardwareMode::Serial);
    assert!(track.mqtt_enabled());
    assert_eq!(track.debounce_ms(), 5);
}
