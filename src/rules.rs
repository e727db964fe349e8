//! Threshold evaluation.
//!
//! A [`RuleSet`] is an ordered list of [`MetricRule`]s, each pulling one
//! metric out of a reading and trying its [`Check`]s in order. The first
//! check that holds produces the metric's only candidate, so a single
//! evaluation never reports both a high and a low crossing for one metric.
//!
//! The two concrete rule sets, [`ENVIRONMENT_RULES`] and [`SYSTEM_RULES`],
//! are plain data. Their declaration order is the output order.
//!
//! Evaluation is pure: no I/O, no clock, and a metric that is missing or
//! not a finite number is skipped.

use crate::config::ThresholdConfig;
use crate::model::{AlertCandidate, AlertLevel, EnvironmentReading, Reading, SystemReading, Threshold};

/// How a value is compared against its bound. Both are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    AtOrAbove,
    AtOrBelow,
}

impl Comparison {
    pub fn holds(self, value: f64, bound: f64) -> bool {
        match self {
            Comparison::AtOrAbove => value >= bound,
            Comparison::AtOrBelow => value <= bound,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Comparison::AtOrAbove => "≥",
            Comparison::AtOrBelow => "≤",
        }
    }
}

/// A comparison of one field of `R` against a configured bound.
pub struct Condition<R: 'static> {
    pub value: fn(&R) -> Option<f64>,
    pub comparison: Comparison,
    pub bound: fn(&ThresholdConfig) -> f64,
}

/// Extra condition ANDed onto a check, plus how to describe the combined bound.
pub struct Composite<R: 'static> {
    pub condition: Condition<R>,
    pub describe: fn(&ThresholdConfig) -> String,
}

/// One way a metric can cross a threshold.
pub struct Check<R: 'static> {
    pub key: &'static str,
    pub level: AlertLevel,
    pub comparison: Comparison,
    pub bound: fn(&ThresholdConfig) -> f64,
    pub composite: Option<Composite<R>>,
    pub message: fn(f64, &Threshold) -> String,
}

/// All checks for a single metric, tried in order.
pub struct MetricRule<R: 'static> {
    pub metric: &'static str,
    pub value: fn(&R) -> Option<f64>,
    pub checks: &'static [Check<R>],
}

/// An ordered collection of metric rules for one reading type.
pub struct RuleSet<R: 'static> {
    pub rules: &'static [MetricRule<R>],
}

impl<R> RuleSet<R> {
    /// Evaluate `reading` against `config`, returning candidates in rule order.
    pub fn evaluate(&self, reading: &R, device_id: &str, config: &ThresholdConfig) -> Vec<AlertCandidate> {
        let mut alerts = Vec::new();

        for rule in self.rules {
            let Some(value) = finite((rule.value)(reading)) else {
                continue;
            };

            let fired = rule.checks.iter().find(|check| {
                check.comparison.holds(value, (check.bound)(config))
                    && check.composite.as_ref().is_none_or(|c| {
                        finite((c.condition.value)(reading)).is_some_and(|other| {
                            c.condition.comparison.holds(other, (c.condition.bound)(config))
                        })
                    })
            });

            if let Some(check) = fired {
                let threshold = match &check.composite {
                    Some(c) => Threshold::Composite((c.describe)(config)),
                    None => Threshold::Value((check.bound)(config)),
                };
                alerts.push(AlertCandidate {
                    key: check.key,
                    metric: rule.metric,
                    level: check.level,
                    value,
                    message: (check.message)(value, &threshold),
                    threshold,
                    device_id: device_id.to_string(),
                });
            }
        }

        alerts
    }
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

/// Evaluate any reading against the rule set for its kind.
pub fn evaluate(reading: &Reading, config: &ThresholdConfig) -> Vec<AlertCandidate> {
    match reading {
        Reading::Environment(r) => ENVIRONMENT_RULES.evaluate(r, &r.device_id, config),
        Reading::System(r) => SYSTEM_RULES.evaluate(r, &r.device_id, config),
    }
}

// ============================================================================
// Environment rules
// ============================================================================

pub static ENVIRONMENT_RULES: RuleSet<EnvironmentReading> = RuleSet {
    rules: &[
        MetricRule {
            metric: "temperature",
            value: |r| r.temperature,
            checks: &[
                Check {
                    key: "temperatureHigh",
                    level: AlertLevel::High,
                    comparison: Comparison::AtOrAbove,
                    bound: |c| c.environment.temperature_high,
                    composite: None,
                    message: |v, t| format!("High temperature detected: {v:.1}°C (≥ {t}°C)"),
                },
                Check {
                    key: "temperatureLow",
                    level: AlertLevel::Low,
                    comparison: Comparison::AtOrBelow,
                    bound: |c| c.environment.temperature_low,
                    composite: None,
                    message: |v, t| format!("Low temperature detected: {v:.1}°C (≤ {t}°C)"),
                },
            ],
        },
        MetricRule {
            metric: "humidity",
            value: |r| r.humidity,
            checks: &[
                Check {
                    key: "humidityHigh",
                    level: AlertLevel::High,
                    comparison: Comparison::AtOrAbove,
                    bound: |c| c.environment.humidity_high,
                    composite: None,
                    message: |v, t| format!("High humidity: {v:.1}% (≥ {t}%)"),
                },
                Check {
                    key: "humidityLow",
                    level: AlertLevel::Low,
                    comparison: Comparison::AtOrBelow,
                    bound: |c| c.environment.humidity_low,
                    composite: None,
                    message: |v, t| format!("Low humidity: {v:.1}% (≤ {t}%)"),
                },
            ],
        },
        MetricRule {
            metric: "airQuality",
            value: |r| r.air_quality,
            checks: &[Check {
                key: "airQualityHigh",
                level: AlertLevel::High,
                comparison: Comparison::AtOrAbove,
                bound: |c| c.environment.air_quality_high,
                composite: None,
                message: |v, t| format!("Poor air quality detected: AQI {v} (≥ {t})"),
            }],
        },
        MetricRule {
            metric: "pressure",
            value: |r| r.pressure,
            checks: &[
                Check {
                    key: "pressureHigh",
                    level: AlertLevel::High,
                    comparison: Comparison::AtOrAbove,
                    bound: |c| c.environment.pressure_high,
                    composite: None,
                    message: |v, t| format!("High pressure: {v:.0} hPa (≥ {t})"),
                },
                Check {
                    key: "pressureLow",
                    level: AlertLevel::Low,
                    comparison: Comparison::AtOrBelow,
                    bound: |c| c.environment.pressure_low,
                    composite: None,
                    message: |v, t| format!("Low pressure: {v:.0} hPa (≤ {t})"),
                },
            ],
        },
        MetricRule {
            metric: "lightLevel",
            value: |r| r.light_level,
            checks: &[Check {
                key: "lightHigh",
                level: AlertLevel::High,
                comparison: Comparison::AtOrAbove,
                bound: |c| c.environment.light_level_high,
                composite: None,
                message: |v, t| format!("High light level: {v:.0} (≥ {t})"),
            }],
        },
    ],
};

// ============================================================================
// System rules
// ============================================================================

pub static SYSTEM_RULES: RuleSet<SystemReading> = RuleSet {
    rules: &[
        MetricRule {
            metric: "batteryPercent",
            value: |r| r.battery_percent,
            checks: &[Check {
                key: "batteryLow85",
                level: AlertLevel::Warning,
                comparison: Comparison::AtOrBelow,
                bound: |c| c.system.battery_low,
                composite: None,
                message: |v, t| format!("Low battery: {v:.0}% (≤ {t}%)"),
            }],
        },
        MetricRule {
            metric: "cpuLoadPercent",
            value: |r| r.cpu_load_percent,
            checks: &[Check {
                key: "cpuHighSustained",
                level: AlertLevel::Warning,
                comparison: Comparison::AtOrAbove,
                bound: |c| c.system.cpu_load_high,
                // Uptime stands in for time spent under load.
                composite: Some(Composite {
                    condition: Condition {
                        value: |r| r.uptime_seconds,
                        comparison: Comparison::AtOrAbove,
                        bound: |c| c.system.cpu_sustained_minutes * 60.0,
                    },
                    describe: |c| {
                        format!(
                            "≥ {}% for ≥ {} min",
                            c.system.cpu_load_high, c.system.cpu_sustained_minutes
                        )
                    },
                }),
                message: |v, t| format!("Sustained high CPU load: {v:.0}% ({t})"),
            }],
        },
        MetricRule {
            metric: "volumePercent",
            value: |r| r.volume_percent,
            checks: &[Check {
                key: "volumeHigh",
                level: AlertLevel::Warning,
                comparison: Comparison::AtOrAbove,
                bound: |c| c.system.volume_high,
                composite: None,
                message: |v, t| format!("High volume: {v:.0}% (≥ {t}%)"),
            }],
        },
        MetricRule {
            metric: "memoryUsedPercent",
            value: |r| r.memory_used_percent,
            checks: &[Check {
                key: "memoryHigh",
                level: AlertLevel::Warning,
                comparison: Comparison::AtOrAbove,
                bound: |c| c.system.memory_used_high,
                composite: None,
                message: |v, t| format!("High memory usage: {v:.0}% (≥ {t}%)"),
            }],
        },
    ],
};
