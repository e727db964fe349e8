//! Alert notification fan-out.
//!
//! [`Dispatcher::dispatch`] takes the alerts admitted for one reading and
//! - publishes them on the broadcast bus (always, exactly once),
//! - composes one shared [`NotificationJob`] (subject, summary, table and,
//!   for system readings, a rendered report),
//! - sends a copy to every recipient concurrently, each send with its own
//!   timeout.
//!
//! A failed send is logged and recorded in the [`DispatchReport`]; it never
//! affects the broadcast or the other recipients.

pub mod bus;
pub mod email;
pub mod report;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use html_escape::encode_text;
use tracing::{debug, info, warn};

use crate::model::{AlertCandidate, Reading, ReadingKind, SystemReading};
use bus::{EventBus, LiveEvent};
use email::{Attachment, DeliveryError, MessageChannel, OutgoingMessage};
use report::{MetricsSnapshot, ReportGenerator};

/// Company name used in report headers when none is configured.
pub const DEFAULT_COMPANY_NAME: &str = "Smart Environment Monitor";

/// Upper bound on a single recipient send.
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Source of addresses opted into alert notifications.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn notification_recipients(&self) -> anyhow::Result<Vec<String>>;
}

// ============================================================================
// NotificationJob
// ============================================================================

/// Everything needed to notify about one reading's alerts.
#[derive(Debug, Clone)]
pub struct NotificationJob {
    pub recipients: Vec<String>,
    pub subject: String,
    /// One-sentence summary shown above the table.
    pub summary: String,
    /// `(label, value)` rows for the alert table.
    pub rows: Vec<(String, String)>,
    pub attachment: Option<Attachment>,
    pub broadcast: LiveEvent,
}

impl NotificationJob {
    /// Compose the shared parts of a notification. Recipients are
    /// de-duplicated and blank addresses dropped.
    pub fn compose(alerts: &[AlertCandidate], reading: &Reading, recipients: Vec<String>) -> Self {
        let kind = reading.kind();
        let device = reading.device_id();
        let when = reading.timestamp().format("%Y-%m-%d %H:%M:%S UTC");

        let metrics: Vec<&str> = alerts.iter().map(|a| a.metric).collect();
        let subject = format!("{} Alert ({}) - {}", kind.label(), device, metrics.join(", "));

        let summary = match kind {
            ReadingKind::Environment => {
                format!("Threshold(s) exceeded at {when} for device {device}.")
            }
            ReadingKind::System => format!(
                "System thresholds triggered at {when} for device {device}. \
                 See attached report for details."
            ),
        };

        let mut rows: Vec<(String, String)> = alerts
            .iter()
            .map(|a| {
                (
                    a.metric.to_string(),
                    format!("{} (threshold {})", a.value, a.threshold),
                )
            })
            .collect();
        if let Reading::Environment(r) = reading {
            rows.push(("Location".to_string(), r.location.clone()));
        }

        let recipients: BTreeSet<String> = recipients
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();

        Self {
            recipients: recipients.into_iter().collect(),
            subject,
            summary,
            rows,
            attachment: None,
            broadcast: LiveEvent::from_serialize(kind.alert_topic(), &alerts),
        }
    }

    pub fn html(&self) -> String {
        let rows: String = self
            .rows
            .iter()
            .map(|(k, v)| {
                format!(
                    "<tr><td style=\"border:1px solid #eee;padding:8px;\">{}</td>\
                     <td style=\"border:1px solid #eee;padding:8px;\">{}</td></tr>",
                    encode_text(k),
                    encode_text(v)
                )
            })
            .collect();

        let footer = if self.attachment.is_some() {
            "A detailed report is attached."
        } else {
            "This notification was generated automatically."
        };

        format!(
            "<div style=\"font-family:Arial,sans-serif;max-width:640px;margin:0 auto;\">\
             <h2 style=\"color:#333;\">{}</h2>\
             <p style=\"color:#444;\">{}</p>\
             <table style=\"border-collapse:collapse;width:100%;margin-top:12px;\"><tbody>{}</tbody></table>\
             <p style=\"color:#999;font-size:12px;margin-top:8px;\">{}</p>\
             </div>",
            encode_text(&self.subject),
            encode_text(&self.summary),
            rows,
            footer
        )
    }

    pub fn text(&self) -> String {
        let mut out = format!("{}\n\n{}\n\n", self.subject, self.summary);
        for (k, v) in &self.rows {
            out.push_str(&format!("{k}: {v}\n"));
        }
        out
    }

    /// The message for each recipient, sharing one body and attachment.
    pub fn messages(&self) -> Vec<OutgoingMessage> {
        let html = self.html();
        let text = self.text();
        self.recipients
            .iter()
            .map(|to| OutgoingMessage {
                to: to.clone(),
                subject: self.subject.clone(),
                html: html.clone(),
                text: text.clone(),
                attachment: self.attachment.clone(),
            })
            .collect()
    }
}

// ============================================================================
// DispatchReport
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedDelivery {
    pub recipient: String,
    pub error: String,
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Whether the alert broadcast was published.
    pub broadcast: bool,
    pub sent: Vec<String>,
    pub failed: Vec<FailedDelivery>,
    /// Recipients that were not attempted because no message channel is configured.
    pub skipped: Vec<String>,
    pub attachment: bool,
}

impl DispatchReport {
    pub fn attempted(&self) -> usize {
        self.sent.len() + self.failed.len()
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

pub struct Dispatcher {
    bus: Arc<EventBus>,
    mailer: Option<Arc<dyn MessageChannel>>,
    reports: Option<Arc<dyn ReportGenerator>>,
    company_name: String,
    send_timeout: Duration,
}

impl Dispatcher {
    /// A dispatcher that only broadcasts. Add channels with the `with_*` methods.
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            mailer: None,
            reports: None,
            company_name: DEFAULT_COMPANY_NAME.to_string(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn MessageChannel>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    pub fn with_reports(mut self, reports: Arc<dyn ReportGenerator>) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn with_company_name(mut self, name: impl Into<String>) -> Self {
        self.company_name = name.into();
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Notify about `alerts` raised by `reading`.
    ///
    /// Never fails: every problem is logged and reflected in the report.
    pub async fn dispatch(
        &self,
        alerts: &[AlertCandidate],
        reading: &Reading,
        recipients: Vec<String>,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        if alerts.is_empty() {
            return report;
        }

        let mut job = NotificationJob::compose(alerts, reading, recipients);

        self.bus.publish(job.broadcast.clone());
        report.broadcast = true;

        if job.recipients.is_empty() {
            debug!(device_id = %reading.device_id(), "No notification recipients");
            return report;
        }

        let Some(mailer) = self.mailer.clone() else {
            warn!(
                recipient_count = job.recipients.len(),
                "No message channel configured, skipping alert emails"
            );
            report.skipped = job.recipients;
            return report;
        };

        if let Reading::System(r) = reading {
            job.attachment = self.render_report(r, alerts).await;
            report.attachment = job.attachment.is_some();
        }

        let handles: Vec<_> = job
            .messages()
            .into_iter()
            .map(|message| {
                let mailer = Arc::clone(&mailer);
                let timeout = self.send_timeout;
                let recipient = message.to.clone();
                let handle = tokio::spawn(async move {
                    match tokio::time::timeout(timeout, mailer.send(&message)).await {
                        Ok(result) => result,
                        Err(_) => Err(DeliveryError::Timeout(timeout.as_secs())),
                    }
                });
                (recipient, handle)
            })
            .collect();

        for (recipient, handle) in handles {
            let error = match handle.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(format!("send task failed: {e}")),
            };
            match error {
                None => report.sent.push(recipient),
                Some(error) => {
                    warn!(recipient = %recipient, error = %error, "Failed to send alert email");
                    report.failed.push(FailedDelivery { recipient, error });
                }
            }
        }

        info!(
            device_id = %reading.device_id(),
            alert_count = alerts.len(),
            sent = report.sent.len(),
            failed = report.failed.len(),
            "Alert notifications dispatched"
        );

        report
    }

    async fn render_report(
        &self,
        reading: &SystemReading,
        alerts: &[AlertCandidate],
    ) -> Option<Attachment> {
        let reports = self.reports.as_ref()?;

        let snapshot = MetricsSnapshot {
            company_name: &self.company_name,
            reading,
            alerts,
        };

        match reports.render(&snapshot).await {
            Ok(bytes) => Some(Attachment {
                filename: format!(
                    "system-alert-{}-{}.{}",
                    reading.device_id,
                    chrono::Utc::now().timestamp_millis(),
                    reports.extension()
                ),
                content_type: reports.content_type().to_string(),
                content: Arc::from(bytes),
            }),
            Err(e) => {
                warn!(
                    device_id = %reading.device_id,
                    error = %e,
                    "Report rendering failed, sending without attachment"
                );
                None
            }
        }
    }
}
