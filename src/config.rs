//! Alert thresholds and cooldown intervals.
//!
//! Thresholds are resolved through a [`ThresholdProvider`], which hands out
//! a complete [`ThresholdConfig`] snapshot per evaluation. The environment
//! backed provider re-reads the process environment on every call so bounds
//! can be changed without a restart; a single evaluation always sees one
//! consistent snapshot.
//!
//! | Variable                        | Default |
//! |---------------------------------|---------|
//! | `ALERT_TEMP_HIGH`               | `35`    |
//! | `ALERT_TEMP_LOW`                | `0`     |
//! | `ALERT_HUMIDITY_HIGH`           | `85`    |
//! | `ALERT_HUMIDITY_LOW`            | `20`    |
//! | `ALERT_AQI_HIGH`                | `150`   |
//! | `ALERT_PRESSURE_LOW`            | `900`   |
//! | `ALERT_PRESSURE_HIGH`           | `1100`  |
//! | `ALERT_LIGHT_HIGH`              | `900`   |
//! | `ALERT_COOLDOWN_MINUTES`        | `15`    |
//! | `ALERT_BATTERY_LOW`             | `85`    |
//! | `ALERT_CPU_HIGH`                | `90`    |
//! | `ALERT_CPU_SUSTAINED_MINUTES`   | `30`    |
//! | `ALERT_VOLUME_HIGH`             | `90`    |
//! | `ALERT_MEMORY_HIGH`             | `90`    |
//! | `SYSTEM_ALERT_COOLDOWN_MINUTES` | value of `ALERT_COOLDOWN_MINUTES` |
//! | `ALERT_COOLDOWN_RETENTION_HOURS` | `24`   |

use chrono::Duration;

use crate::model::ReadingKind;

/// Bounds for the ambient environment rule set.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentThresholds {
    pub temperature_high: f64,
    pub temperature_low: f64,
    pub humidity_high: f64,
    pub humidity_low: f64,
    pub air_quality_high: f64,
    pub pressure_low: f64,
    pub pressure_high: f64,
    pub light_level_high: f64,
}

impl Default for EnvironmentThresholds {
    fn default() -> Self {
        Self {
            temperature_high: 35.0,
            temperature_low: 0.0,
            humidity_high: 85.0,
            humidity_low: 20.0,
            air_quality_high: 150.0,
            pressure_low: 900.0,
            pressure_high: 1100.0,
            light_level_high: 900.0,
        }
    }
}

/// Bounds for the device system rule set.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemThresholds {
    /// Battery at or below this percentage raises a warning.
    pub battery_low: f64,
    pub cpu_load_high: f64,
    /// How long (minutes of uptime) the load must have been running.
    pub cpu_sustained_minutes: f64,
    pub volume_high: f64,
    pub memory_used_high: f64,
}

impl Default for SystemThresholds {
    fn default() -> Self {
        Self {
            battery_low: 85.0,
            cpu_load_high: 90.0,
            cpu_sustained_minutes: 30.0,
            volume_high: 90.0,
            memory_used_high: 90.0,
        }
    }
}

/// Default cooldown between identical notifications.
const DEFAULT_COOLDOWN_MINUTES: f64 = 15.0;

/// Default minimum age before a cooldown entry may be pruned.
const DEFAULT_RETENTION_HOURS: f64 = 24.0;

/// A consistent snapshot of every alert bound and cooldown.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdConfig {
    pub environment: EnvironmentThresholds,
    pub system: SystemThresholds,
    pub environment_cooldown: Duration,
    pub system_cooldown: Duration,
    /// Floor on how long cooldown entries are kept, independent of the
    /// cooldowns themselves.
    pub cooldown_retention: Duration,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        let cooldown = minutes(DEFAULT_COOLDOWN_MINUTES);
        Self {
            environment: EnvironmentThresholds::default(),
            system: SystemThresholds::default(),
            environment_cooldown: cooldown,
            system_cooldown: cooldown,
            cooldown_retention: minutes(DEFAULT_RETENTION_HOURS * 60.0),
        }
    }
}

impl ThresholdConfig {
    /// Build a config from a variable lookup, falling back to defaults for
    /// anything missing, unparseable, or non-finite.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |name: &str, default: f64| -> f64 {
            lookup(name)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite())
                .unwrap_or(default)
        };

        let env = EnvironmentThresholds::default();
        let sys = SystemThresholds::default();

        let cooldown_minutes = number("ALERT_COOLDOWN_MINUTES", DEFAULT_COOLDOWN_MINUTES);
        let system_cooldown_minutes = number("SYSTEM_ALERT_COOLDOWN_MINUTES", cooldown_minutes);
        let retention_hours = number("ALERT_COOLDOWN_RETENTION_HOURS", DEFAULT_RETENTION_HOURS);

        Self {
            environment: EnvironmentThresholds {
                temperature_high: number("ALERT_TEMP_HIGH", env.temperature_high),
                temperature_low: number("ALERT_TEMP_LOW", env.temperature_low),
                humidity_high: number("ALERT_HUMIDITY_HIGH", env.humidity_high),
                humidity_low: number("ALERT_HUMIDITY_LOW", env.humidity_low),
                air_quality_high: number("ALERT_AQI_HIGH", env.air_quality_high),
                pressure_low: number("ALERT_PRESSURE_LOW", env.pressure_low),
                pressure_high: number("ALERT_PRESSURE_HIGH", env.pressure_high),
                light_level_high: number("ALERT_LIGHT_HIGH", env.light_level_high),
            },
            system: SystemThresholds {
                battery_low: number("ALERT_BATTERY_LOW", sys.battery_low),
                cpu_load_high: number("ALERT_CPU_HIGH", sys.cpu_load_high),
                cpu_sustained_minutes: number(
                    "ALERT_CPU_SUSTAINED_MINUTES",
                    sys.cpu_sustained_minutes,
                ),
                volume_high: number("ALERT_VOLUME_HIGH", sys.volume_high),
                memory_used_high: number("ALERT_MEMORY_HIGH", sys.memory_used_high),
            },
            environment_cooldown: minutes(cooldown_minutes),
            system_cooldown: minutes(system_cooldown_minutes),
            cooldown_retention: minutes(retention_hours * 60.0),
        }
    }

    /// Cooldown that applies to alerts from readings of the given kind.
    pub fn cooldown_for(&self, kind: ReadingKind) -> Duration {
        match kind {
            ReadingKind::Environment => self.environment_cooldown,
            ReadingKind::System => self.system_cooldown,
        }
    }

    /// The longest configured cooldown. Cooldown entries older than this
    /// can no longer suppress anything.
    pub fn longest_cooldown(&self) -> Duration {
        self.environment_cooldown.max(self.system_cooldown)
    }

    /// Age at which a cooldown entry may be pruned: the retention floor or
    /// the longest cooldown, whichever is larger.
    ///
    /// An entry pruned under this age could still suppress a candidate if
    /// a cooldown is later raised above the retention floor.
    pub fn prune_age(&self) -> Duration {
        self.longest_cooldown().max(self.cooldown_retention)
    }
}

/// Fractional minutes to a duration, clamping negatives to zero.
fn minutes(value: f64) -> Duration {
    Duration::milliseconds((value.max(0.0) * 60_000.0) as i64)
}

/// Source of threshold snapshots.
pub trait ThresholdProvider: Send + Sync {
    fn snapshot(&self) -> ThresholdConfig;
}

/// Reads thresholds from the process environment on every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvThresholds;

impl ThresholdProvider for EnvThresholds {
    fn snapshot(&self) -> ThresholdConfig {
        ThresholdConfig::from_lookup(|name| std::env::var(name).ok())
    }
}

/// Always returns the same snapshot.
#[derive(Debug, Clone, Default)]
pub struct FixedThresholds(pub ThresholdConfig);

impl ThresholdProvider for FixedThresholds {
    fn snapshot(&self) -> ThresholdConfig {
        self.0.clone()
    }
}
