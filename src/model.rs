//! Data models for envmon.
//!
//! Readings arrive from two kinds of devices: ambient sensors
//! ([`EnvironmentReading`]) and laptop/system agents ([`SystemReading`]).
//! Both travel as camelCase JSON so that device firmware and dashboard
//! clients can use the same field names (`deviceId`, `airQuality`, ...).
//!
//! Request types carry `validator` annotations. Range checks happen at the
//! HTTP boundary; everything past it trusts the reading.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Location assigned to environment readings that do not name one.
pub const DEFAULT_LOCATION: &str = "Main Room";

/// One sample from an ambient environment sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentReading {
    pub device_id: String,
    pub location: String,
    pub timestamp: DateTime<Utc>,
    /// Degrees Celsius.
    pub temperature: Option<f64>,
    /// Relative humidity, percent.
    pub humidity: Option<f64>,
    /// Air quality index.
    pub air_quality: Option<f64>,
    /// Barometric pressure, hPa.
    pub pressure: Option<f64>,
    /// Light level, lux.
    pub light_level: Option<f64>,
}

impl EnvironmentReading {
    /// A reading with every metric absent. Useful as a base for struct update syntax.
    pub fn new(device_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            location: DEFAULT_LOCATION.to_string(),
            timestamp,
            temperature: None,
            humidity: None,
            air_quality: None,
            pressure: None,
            light_level: None,
        }
    }
}

/// One sample from a system agent running on a laptop or desktop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemReading {
    pub device_id: String,
    pub device_manufacturer: Option<String>,
    pub device_model: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub battery_percent: Option<f64>,
    pub is_charging: bool,
    pub cpu_load_percent: Option<f64>,
    pub uptime_seconds: Option<f64>,
    pub memory_used_percent: Option<f64>,
    #[serde(rename = "memoryTotalMB")]
    pub memory_total_mb: Option<f64>,
    #[serde(rename = "memoryFreeMB")]
    pub memory_free_mb: Option<f64>,
    pub brightness_percent: Option<f64>,
    pub volume_percent: Option<f64>,
    pub is_online: bool,
    pub network_type: Option<String>,
}

impl SystemReading {
    /// A reading with every metric absent, online and not charging.
    pub fn new(device_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            device_manufacturer: None,
            device_model: None,
            timestamp,
            battery_percent: None,
            is_charging: false,
            cpu_load_percent: None,
            uptime_seconds: None,
            memory_used_percent: None,
            memory_total_mb: None,
            memory_free_mb: None,
            brightness_percent: None,
            volume_percent: None,
            is_online: true,
            network_type: None,
        }
    }
}

/// Which family a reading belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingKind {
    Environment,
    System,
}

impl ReadingKind {
    /// Broadcast topic carrying raw readings of this kind.
    pub fn reading_topic(&self) -> &'static str {
        match self {
            ReadingKind::Environment => "newEnvironmentData",
            ReadingKind::System => "systemMetrics",
        }
    }

    /// Broadcast topic carrying admitted alerts for this kind.
    pub fn alert_topic(&self) -> &'static str {
        match self {
            ReadingKind::Environment => "alerts",
            ReadingKind::System => "systemAlerts",
        }
    }

    /// Human-readable label used in notification subjects.
    pub fn label(&self) -> &'static str {
        match self {
            ReadingKind::Environment => "Environment",
            ReadingKind::System => "System",
        }
    }
}

/// A validated reading of either kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reading {
    Environment(EnvironmentReading),
    System(SystemReading),
}

impl Reading {
    pub fn kind(&self) -> ReadingKind {
        match self {
            Reading::Environment(_) => ReadingKind::Environment,
            Reading::System(_) => ReadingKind::System,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            Reading::Environment(r) => &r.device_id,
            Reading::System(r) => &r.device_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Reading::Environment(r) => r.timestamp,
            Reading::System(r) => r.timestamp,
        }
    }
}

impl From<EnvironmentReading> for Reading {
    fn from(reading: EnvironmentReading) -> Self {
        Reading::Environment(reading)
    }
}

impl From<SystemReading> for Reading {
    fn from(reading: SystemReading) -> Self {
        Reading::System(reading)
    }
}

// ============================================================================
// Alerts
// ============================================================================

/// Direction of a threshold crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Low,
    High,
    Warning,
}

/// The bound an alert was raised against.
///
/// Simple rules carry the numeric bound; composite rules (two fields ANDed)
/// carry a description of both bounds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Threshold {
    Value(f64),
    Composite(String),
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::Value(v) => write!(f, "{v}"),
            Threshold::Composite(s) => f.write_str(s),
        }
    }
}

/// A detected threshold crossing, before cooldown filtering.
///
/// `key` is stable for a given physical condition, so it can be combined
/// with the device id to key the cooldown gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertCandidate {
    pub key: &'static str,
    pub metric: &'static str,
    pub level: AlertLevel,
    pub value: f64,
    pub threshold: Threshold,
    pub device_id: String,
    pub message: String,
}

// ============================================================================
// Requests
// ============================================================================

/// Request body for `POST /api/environment`.
///
/// All five metrics are required; `location` and `timestamp` are optional.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentReadingRequest {
    #[validate(required, length(min = 1, message = "deviceId must not be empty"))]
    pub device_id: Option<String>,

    #[validate(required, range(min = -50.0, max = 100.0))]
    pub temperature: Option<f64>,

    #[validate(required, range(min = 0.0, max = 100.0))]
    pub humidity: Option<f64>,

    #[validate(required, range(min = 0.0, max = 500.0))]
    pub air_quality: Option<f64>,

    #[validate(required, range(min = 800.0, max = 1200.0))]
    pub pressure: Option<f64>,

    #[validate(required, range(min = 0.0, max = 1000.0))]
    pub light_level: Option<f64>,

    pub location: Option<String>,

    pub timestamp: Option<DateTime<Utc>>,
}

impl EnvironmentReadingRequest {
    /// Convert a validated request into a reading, stamping `now` when the
    /// device did not send a timestamp.
    pub fn into_reading(self, now: DateTime<Utc>) -> EnvironmentReading {
        EnvironmentReading {
            device_id: self.device_id.unwrap_or_default(),
            location: self
                .location
                .unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
            timestamp: self.timestamp.unwrap_or(now),
            temperature: self.temperature,
            humidity: self.humidity,
            air_quality: self.air_quality,
            pressure: self.pressure,
            light_level: self.light_level,
        }
    }
}

/// Request body for `POST /api/system/metrics`.
///
/// Only `deviceId` is required. The timestamp is always server-assigned.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SystemReadingRequest {
    #[validate(required, length(min = 1, message = "deviceId must not be empty"))]
    pub device_id: Option<String>,

    pub device_manufacturer: Option<String>,
    pub device_model: Option<String>,

    #[validate(range(min = 0.0, max = 100.0))]
    pub battery_percent: Option<f64>,

    pub is_charging: Option<bool>,

    #[validate(range(min = 0.0, max = 100.0))]
    pub cpu_load_percent: Option<f64>,

    #[validate(range(min = 0.0))]
    pub uptime_seconds: Option<f64>,

    #[validate(range(min = 0.0, max = 100.0))]
    pub memory_used_percent: Option<f64>,

    #[serde(rename = "memoryTotalMB")]
    #[validate(range(min = 0.0))]
    pub memory_total_mb: Option<f64>,

    #[serde(rename = "memoryFreeMB")]
    #[validate(range(min = 0.0))]
    pub memory_free_mb: Option<f64>,

    #[validate(range(min = 0.0, max = 100.0))]
    pub brightness_percent: Option<f64>,

    #[validate(range(min = 0.0, max = 100.0))]
    pub volume_percent: Option<f64>,

    pub is_online: Option<bool>,

    pub network_type: Option<String>,
}

impl SystemReadingRequest {
    pub fn into_reading(self, now: DateTime<Utc>) -> SystemReading {
        SystemReading {
            device_id: self.device_id.unwrap_or_default(),
            device_manufacturer: self.device_manufacturer,
            device_model: self.device_model,
            timestamp: now,
            battery_percent: self.battery_percent,
            is_charging: self.is_charging.unwrap_or(false),
            cpu_load_percent: self.cpu_load_percent,
            uptime_seconds: self.uptime_seconds,
            memory_used_percent: self.memory_used_percent,
            memory_total_mb: self.memory_total_mb,
            memory_free_mb: self.memory_free_mb,
            brightness_percent: self.brightness_percent,
            volume_percent: self.volume_percent,
            is_online: self.is_online.unwrap_or(true),
            network_type: self.network_type,
        }
    }
}

/// Actions a system agent can be asked to perform on its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentCommand {
    OpenTaskManager,
    OpenBatterySettings,
    OpenBrightnessSettings,
    OpenSoundSettings,
    OpenNetworkSettings,
}

impl AgentCommand {
    pub const ALL: [AgentCommand; 5] = [
        AgentCommand::OpenTaskManager,
        AgentCommand::OpenBatterySettings,
        AgentCommand::OpenBrightnessSettings,
        AgentCommand::OpenSoundSettings,
        AgentCommand::OpenNetworkSettings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentCommand::OpenTaskManager => "open-task-manager",
            AgentCommand::OpenBatterySettings => "open-battery-settings",
            AgentCommand::OpenBrightnessSettings => "open-brightness-settings",
            AgentCommand::OpenSoundSettings => "open-sound-settings",
            AgentCommand::OpenNetworkSettings => "open-network-settings",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported command: {0}")]
pub struct UnsupportedCommand(pub String);

impl FromStr for AgentCommand {
    type Err = UnsupportedCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|command| command.as_str() == s)
            .ok_or_else(|| UnsupportedCommand(s.to_string()))
    }
}

fn supported_command(command: &str) -> Result<(), ValidationError> {
    match command.parse::<AgentCommand>() {
        Ok(_) => Ok(()),
        Err(_) => Err(ValidationError::new("unsupported_command")
            .with_message(Cow::Borrowed("Unsupported command"))),
    }
}

/// Request body for `POST /api/system/command`.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    #[validate(required, length(min = 1, message = "deviceId must not be empty"))]
    pub device_id: Option<String>,

    #[validate(required, custom(function = "supported_command"))]
    pub command: Option<String>,
}

/// Request body for `POST /api/recipients`.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RecipientRequest {
    #[validate(email)]
    pub email: String,

    pub name: Option<String>,

    /// Whether this address should receive alert notifications.
    #[serde(default = "default_notifications")]
    pub notifications: bool,
}

fn default_notifications() -> bool {
    true
}

// ============================================================================
// Queries and responses
// ============================================================================

/// Query parameters for the `/range` endpoints.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeQuery {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub device_id: Option<String>,
}

/// Query parameters for `GET /api/environment`.
#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: u32,

    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    50
}

/// Pagination metadata returned alongside a page of readings.
#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: i64,
    pub pages: i64,
}

/// Response for `GET /api/environment`.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentPage {
    pub data: Vec<EnvironmentReading>,
    pub pagination: Pagination,
}

/// Query parameters for `GET /api/environment/stats`.
#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    /// One of `1h`, `24h`, `7d`, `30d`. Anything else means `24h`.
    #[serde(default)]
    pub period: Option<String>,
}

impl StatsQuery {
    /// Lookback window for the requested period.
    pub fn lookback(&self) -> chrono::Duration {
        match self.period.as_deref() {
            Some("1h") => chrono::Duration::hours(1),
            Some("7d") => chrono::Duration::days(7),
            Some("30d") => chrono::Duration::days(30),
            _ => chrono::Duration::hours(24),
        }
    }
}

/// Aggregate statistics over environment readings.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentStats {
    pub avg_temperature: f64,
    pub avg_humidity: f64,
    pub avg_air_quality: f64,
    pub avg_pressure: f64,
    pub avg_light_level: f64,
    pub data_points: i64,
    pub min_temperature: Option<f64>,
    pub max_temperature: Option<f64>,
    pub min_humidity: Option<f64>,
    pub max_humidity: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_environment_request_requires_all_metrics() {
        let request: EnvironmentReadingRequest = serde_json::from_value(json!({
            "deviceId": "sensor-001",
            "temperature": 21.5,
            "humidity": 40
        }))
        .unwrap();

        let errors = request.validate().unwrap_err();
        // airQuality, pressure and lightLevel are missing
        assert_eq!(errors.field_errors().len(), 3);
    }

    #[test]
    fn test_environment_request_range_checks() {
        let request: EnvironmentReadingRequest = serde_json::from_value(json!({
            "deviceId": "sensor-001",
            "temperature": 120,
            "humidity": 40,
            "airQuality": 50,
            "pressure": 1013,
            "lightLevel": 300
        }))
        .unwrap();

        let errors = request.validate().unwrap_err();
        assert_eq!(errors.field_errors().len(), 1);
    }

    #[test]
    fn test_environment_request_defaults() {
        let now = Utc::now();
        let request: EnvironmentReadingRequest = serde_json::from_value(json!({
            "deviceId": "sensor-001",
            "temperature": 21.5,
            "humidity": 40,
            "airQuality": 50,
            "pressure": 1013,
            "lightLevel": 300
        }))
        .unwrap();
        assert!(request.validate().is_ok());

        let reading = request.into_reading(now);
        assert_eq!(reading.location, DEFAULT_LOCATION);
        assert_eq!(reading.timestamp, now);
        assert_eq!(reading.temperature, Some(21.5));
    }

    #[test]
    fn test_system_request_rejects_empty_device() {
        let request: SystemReadingRequest = serde_json::from_value(json!({
            "deviceId": "",
            "batteryPercent": 50
        }))
        .unwrap();

        assert!(request.validate().is_err());
    }

    #[test]
    fn test_system_request_wire_names() {
        let request: SystemReadingRequest = serde_json::from_value(json!({
            "deviceId": "laptop1",
            "memoryTotalMB": 16384,
            "memoryFreeMB": 2048
        }))
        .unwrap();
        assert!(request.validate().is_ok());

        let reading = request.into_reading(Utc::now());
        assert_eq!(reading.memory_total_mb, Some(16384.0));
        assert!(reading.is_online);
        assert!(!reading.is_charging);

        let value = serde_json::to_value(&reading).unwrap();
        assert_eq!(value["memoryFreeMB"], 2048.0);
        assert_eq!(value["deviceId"], "laptop1");
    }

    #[test]
    fn test_command_request_accepts_known_commands() {
        for command in AgentCommand::ALL {
            let request: CommandRequest = serde_json::from_value(json!({
                "deviceId": "laptop1",
                "command": command.as_str()
            }))
            .unwrap();
            assert!(request.validate().is_ok());
            assert_eq!(command.as_str().parse::<AgentCommand>(), Ok(command));
        }
    }

    #[test]
    fn test_command_request_rejects_unknown_command() {
        let request: CommandRequest = serde_json::from_value(json!({
            "deviceId": "laptop1",
            "command": "format-disk"
        }))
        .unwrap();

        let errors = request.validate().unwrap_err();
        assert_eq!(errors.field_errors().len(), 1);
        assert_eq!(
            "format-disk".parse::<AgentCommand>(),
            Err(UnsupportedCommand("format-disk".to_string()))
        );
    }

    #[test]
    fn test_command_request_requires_device() {
        let request: CommandRequest = serde_json::from_value(json!({
            "command": "open-task-manager"
        }))
        .unwrap();

        assert!(request.validate().is_err());
    }

    #[test]
    fn test_threshold_display() {
        assert_eq!(Threshold::Value(35.0).to_string(), "35");
        assert_eq!(Threshold::Value(12.5).to_string(), "12.5");
        assert_eq!(
            Threshold::Composite("cpu ≥ 90%".to_string()).to_string(),
            "cpu ≥ 90%"
        );
    }

    #[test]
    fn test_stats_period_lookback() {
        let query = StatsQuery {
            period: Some("7d".to_string()),
        };
        assert_eq!(query.lookback(), chrono::Duration::days(7));

        let query = StatsQuery {
            period: Some("bogus".to_string()),
        };
        assert_eq!(query.lookback(), chrono::Duration::hours(24));
    }
}
