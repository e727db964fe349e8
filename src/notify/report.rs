//! Report rendering for system alert notifications.
//!
//! The dispatcher asks a [`ReportGenerator`] for one attachment per system
//! dispatch. Rendering is allowed to fail; the notification then goes out
//! without an attachment. [`TextReport`] is a dependency-free renderer that
//! lays out the same device and metrics tables a paginated document would.

use std::fmt::Write;

use async_trait::async_trait;

use crate::model::{AlertCandidate, SystemReading};

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Report rendering failed: {0}")]
    Render(String),
}

/// Everything a report is rendered from.
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot<'a> {
    pub company_name: &'a str,
    pub reading: &'a SystemReading,
    pub alerts: &'a [AlertCandidate],
}

#[async_trait]
pub trait ReportGenerator: Send + Sync {
    async fn render(&self, snapshot: &MetricsSnapshot<'_>) -> Result<Vec<u8>, ReportError>;

    fn content_type(&self) -> &'static str {
        "application/pdf"
    }

    fn extension(&self) -> &'static str {
        "pdf"
    }
}

/// Renders a plain-text report.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextReport;

/// Width of the label column.
const LABEL_WIDTH: usize = 16;

const MISSING: &str = "-";

impl TextReport {
    fn render_text(snapshot: &MetricsSnapshot<'_>) -> Result<String, std::fmt::Error> {
        let r = snapshot.reading;
        let mut out = String::new();

        writeln!(out, "{}", snapshot.company_name)?;
        writeln!(out, "System Metrics Alert Report")?;
        writeln!(out, "{}", "=".repeat(48))?;

        section(&mut out, "Device")?;
        row(&mut out, "Device ID", &r.device_id)?;
        row(&mut out, "Manufacturer", r.device_manufacturer.as_deref().unwrap_or(MISSING))?;
        row(&mut out, "Model", r.device_model.as_deref().unwrap_or(MISSING))?;
        row(&mut out, "Timestamp", &r.timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string())?;

        section(&mut out, "Metrics")?;
        let battery = match (percent(r.battery_percent), r.is_charging) {
            (b, true) => format!("{b} (Charging)"),
            (b, false) => b,
        };
        row(&mut out, "Battery", &battery)?;
        row(&mut out, "CPU Load", &percent(r.cpu_load_percent))?;
        row(&mut out, "Uptime", &uptime(r.uptime_seconds))?;
        row(&mut out, "Memory Used", &percent(r.memory_used_percent))?;
        row(&mut out, "Memory Total", &megabytes(r.memory_total_mb))?;
        row(&mut out, "Memory Free", &megabytes(r.memory_free_mb))?;
        row(&mut out, "Brightness", &percent(r.brightness_percent))?;
        row(&mut out, "Volume", &percent(r.volume_percent))?;
        let network = match (&r.network_type, r.is_online) {
            (Some(kind), true) => format!("Online ({kind})"),
            (Some(kind), false) => format!("Offline ({kind})"),
            (None, true) => "Online".to_string(),
            (None, false) => "Offline".to_string(),
        };
        row(&mut out, "Network", &network)?;

        if !snapshot.alerts.is_empty() {
            section(&mut out, "Alerts")?;
            for alert in snapshot.alerts {
                writeln!(out, "- {}", alert.message)?;
            }
        }

        writeln!(out)?;
        writeln!(
            out,
            "This report was generated automatically by {}.",
            snapshot.company_name
        )?;
        Ok(out)
    }
}

#[async_trait]
impl ReportGenerator for TextReport {
    async fn render(&self, snapshot: &MetricsSnapshot<'_>) -> Result<Vec<u8>, ReportError> {
        Self::render_text(snapshot)
            .map(String::into_bytes)
            .map_err(|e| ReportError::Render(e.to_string()))
    }

    fn content_type(&self) -> &'static str {
        "text/plain; charset=utf-8"
    }

    fn extension(&self) -> &'static str {
        "txt"
    }
}

fn section(out: &mut String, title: &str) -> std::fmt::Result {
    writeln!(out)?;
    writeln!(out, "{title}")?;
    writeln!(out, "{}", "-".repeat(title.len()))
}

fn row(out: &mut String, label: &str, value: &str) -> std::fmt::Result {
    writeln!(out, "{label:<LABEL_WIDTH$}{value}")
}

fn percent(value: Option<f64>) -> String {
    value.map_or_else(|| MISSING.to_string(), |v| format!("{v}%"))
}

fn megabytes(value: Option<f64>) -> String {
    value.map_or_else(|| MISSING.to_string(), |v| format!("{v} MB"))
}

fn uptime(seconds: Option<f64>) -> String {
    match seconds {
        Some(s) if s > 0.0 => {
            let total = s as u64;
            format!("{}h {}m", total / 3600, (total % 3600) / 60)
        }
        _ => MISSING.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[tokio::test]
    async fn renders_device_and_metric_rows() {
        let reading = SystemReading {
            device_manufacturer: Some("Lenovo".to_string()),
            battery_percent: Some(42.0),
            is_charging: true,
            uptime_seconds: Some(7260.0),
            memory_total_mb: Some(16384.0),
            network_type: Some("WiFi".to_string()),
            ..SystemReading::new("laptop1", Utc::now())
        };
        let snapshot = MetricsSnapshot {
            company_name: "Smart Environment Monitor",
            reading: &reading,
            alerts: &[],
        };

        let bytes = TextReport.render(&snapshot).await.unwrap();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.starts_with("Smart Environment Monitor"));
        assert!(text.contains("laptop1"));
        assert!(text.contains("Lenovo"));
        assert!(text.contains("42% (Charging)"));
        assert!(text.contains("2h 1m"));
        assert!(text.contains("16384 MB"));
        assert!(text.contains("Online (WiFi)"));
        assert!(!text.contains("Alerts"));
    }

    #[test]
    fn missing_values_render_as_dash() {
        assert_eq!(percent(None), MISSING);
        assert_eq!(uptime(Some(0.0)), MISSING);
        assert_eq!(megabytes(Some(512.0)), "512 MB");
    }

    #[test]
    fn text_report_advertises_plain_text() {
        assert_eq!(TextReport.extension(), "txt");
        assert!(TextReport.content_type().starts_with("text/plain"));
    }
}
