//! Ingestion pipeline.
//!
//! Each reading moves through
//! `persisted -> broadcast -> evaluated -> gated -> (dispatch started)`.
//! Only persistence can fail the request. Notification fan-out runs on a
//! detached task so the caller is acknowledged as soon as the reading is
//! stored and gated.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ThresholdProvider;
use crate::cooldown::CooldownGate;
use crate::model::{AlertCandidate, Reading};
use crate::notify::bus::{EventBus, LiveEvent};
use crate::notify::{DispatchReport, Dispatcher, RecipientDirectory};
use crate::rules;

/// Durable storage for accepted readings.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Store the reading and return its id.
    async fn persist(&self, reading: &Reading) -> anyhow::Result<i64>;
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("failed to persist reading: {0:#}")]
    Persistence(anyhow::Error),
}

/// Result of a successful ingestion.
#[derive(Debug)]
pub struct Ingested {
    pub id: i64,
    pub reading: Reading,
    /// Alerts that passed the cooldown gate.
    pub admitted: Vec<AlertCandidate>,
    /// Handle to the notification task, when one was started. Dropping it
    /// detaches the task.
    pub dispatch: Option<JoinHandle<DispatchReport>>,
}

/// Wires storage, evaluation, the cooldown gate and the dispatcher together.
pub struct Ingestor {
    store: Arc<dyn ReadingStore>,
    bus: Arc<EventBus>,
    thresholds: Arc<dyn ThresholdProvider>,
    gate: Arc<CooldownGate>,
    dispatcher: Arc<Dispatcher>,
    recipients: Arc<dyn RecipientDirectory>,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn ReadingStore>,
        bus: Arc<EventBus>,
        thresholds: Arc<dyn ThresholdProvider>,
        gate: Arc<CooldownGate>,
        dispatcher: Arc<Dispatcher>,
        recipients: Arc<dyn RecipientDirectory>,
    ) -> Self {
        Self {
            store,
            bus,
            thresholds,
            gate,
            dispatcher,
            recipients,
        }
    }

    pub async fn ingest(&self, reading: Reading) -> Result<Ingested, IngestError> {
        self.ingest_at(reading, Utc::now()).await
    }

    /// Run the pipeline with `now` as the cooldown clock.
    pub async fn ingest_at(
        &self,
        reading: Reading,
        now: DateTime<Utc>,
    ) -> Result<Ingested, IngestError> {
        let kind = reading.kind();

        let id = self
            .store
            .persist(&reading)
            .await
            .map_err(IngestError::Persistence)?;

        self.bus
            .publish(LiveEvent::from_serialize(kind.reading_topic(), &reading));

        let config = self.thresholds.snapshot();
        let candidates = rules::evaluate(&reading, &config);
        let candidate_count = candidates.len();
        let admitted = self
            .gate
            .admit(candidates, now, config.cooldown_for(kind));

        debug!(
            id,
            device_id = %reading.device_id(),
            candidates = candidate_count,
            admitted = admitted.len(),
            "Reading evaluated"
        );

        let dispatch = if admitted.is_empty() {
            None
        } else {
            info!(
                device_id = %reading.device_id(),
                alert_count = admitted.len(),
                "Alerts admitted, starting dispatch"
            );
            Some(self.spawn_dispatch(admitted.clone(), reading.clone()))
        };

        Ok(Ingested {
            id,
            reading,
            admitted,
            dispatch,
        })
    }

    fn spawn_dispatch(
        &self,
        alerts: Vec<AlertCandidate>,
        reading: Reading,
    ) -> JoinHandle<DispatchReport> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let directory = Arc::clone(&self.recipients);

        tokio::spawn(async move {
            let recipients = match directory.notification_recipients().await {
                Ok(recipients) => recipients,
                Err(e) => {
                    warn!(error = %e, "Failed to load notification recipients");
                    Vec::new()
                }
            };
            dispatcher.dispatch(&alerts, &reading, recipients).await
        })
    }

    /// Drop cooldown entries older than the configured prune age.
    ///
    /// The prune age never drops below the retention floor, so raising a
    /// cooldown after a sweep does not readmit a recently fired key unless
    /// the new cooldown exceeds the floor.
    pub fn prune_cooldowns(&self, now: DateTime<Utc>) -> usize {
        let max_age = self.thresholds.snapshot().prune_age();
        self.gate.prune(now, max_age)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::anyhow;
    use chrono::Duration;
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::config::{FixedThresholds, ThresholdConfig, ThresholdProvider};
    use crate::model::{EnvironmentReading, SystemReading};

    #[derive(Default)]
    struct MemoryStore {
        readings: Mutex<Vec<Reading>>,
        fail: bool,
    }

    #[async_trait]
    impl ReadingStore for MemoryStore {
        async fn persist(&self, reading: &Reading) -> anyhow::Result<i64> {
            if self.fail {
                return Err(anyhow!("disk full"));
            }
            let mut readings = self.readings.lock().unwrap();
            readings.push(reading.clone());
            Ok(readings.len() as i64)
        }
    }

    struct StaticDirectory(anyhow::Result<Vec<String>>);

    #[async_trait]
    impl RecipientDirectory for StaticDirectory {
        async fn notification_recipients(&self) -> anyhow::Result<Vec<String>> {
            match &self.0 {
                Ok(list) => Ok(list.clone()),
                Err(e) => Err(anyhow!("{e}")),
            }
        }
    }

    /// Thresholds that a test can change between calls.
    struct AdjustableThresholds(Mutex<ThresholdConfig>);

    impl ThresholdProvider for AdjustableThresholds {
        fn snapshot(&self) -> ThresholdConfig {
            self.0.lock().unwrap().clone()
        }
    }

    struct Harness {
        ingestor: Ingestor,
        store: Arc<MemoryStore>,
        bus: Arc<EventBus>,
        gate: Arc<CooldownGate>,
    }

    fn harness(store: MemoryStore, directory: StaticDirectory) -> Harness {
        harness_with(
            store,
            directory,
            Arc::new(FixedThresholds(ThresholdConfig::default())),
        )
    }

    fn harness_with(
        store: MemoryStore,
        directory: StaticDirectory,
        thresholds: Arc<dyn ThresholdProvider>,
    ) -> Harness {
        let store = Arc::new(store);
        let bus = Arc::new(EventBus::default());
        let gate = Arc::new(CooldownGate::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&bus)));
        let ingestor = Ingestor::new(
            store.clone(),
            Arc::clone(&bus),
            thresholds,
            Arc::clone(&gate),
            dispatcher,
            Arc::new(directory),
        );
        Harness {
            ingestor,
            store,
            bus,
            gate,
        }
    }

    fn hot_reading(at: DateTime<Utc>) -> Reading {
        EnvironmentReading {
            temperature: Some(40.0),
            humidity: Some(50.0),
            air_quality: Some(40.0),
            pressure: Some(1013.0),
            light_level: Some(300.0),
            ..EnvironmentReading::new("d1", at)
        }
        .into()
    }

    #[tokio::test]
    async fn repeated_condition_inside_cooldown_notifies_once() {
        let h = harness(MemoryStore::default(), StaticDirectory(Ok(vec![])));
        let t0 = Utc::now();

        let first = assert_ok!(h.ingestor.ingest_at(hot_reading(t0), t0).await);
        assert_eq!(first.admitted.len(), 1);
        assert_eq!(first.admitted[0].key, "temperatureHigh");
        let report = first.dispatch.unwrap().await.unwrap();
        assert!(report.broadcast);

        let t1 = t0 + Duration::minutes(5);
        let second = assert_ok!(h.ingestor.ingest_at(hot_reading(t1), t1).await);
        assert!(second.admitted.is_empty());
        assert!(second.dispatch.is_none());

        let t2 = t0 + Duration::minutes(15);
        let third = assert_ok!(h.ingestor.ingest_at(hot_reading(t2), t2).await);
        assert_eq!(third.admitted.len(), 1);

        assert_eq!(h.store.readings.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn broadcasts_raw_reading_before_alerts() {
        let h = harness(MemoryStore::default(), StaticDirectory(Ok(vec![])));
        let mut rx = h.bus.subscribe();
        let now = Utc::now();

        let ingested = assert_ok!(h.ingestor.ingest_at(hot_reading(now), now).await);
        ingested.dispatch.unwrap().await.unwrap();

        let raw = rx.recv().await.unwrap();
        assert_eq!(raw.topic, "newEnvironmentData");
        assert_eq!(raw.payload["deviceId"], "d1");

        let alerts = rx.recv().await.unwrap();
        assert_eq!(alerts.topic, "alerts");
        assert_eq!(alerts.payload.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persistence_failure_stops_the_pipeline() {
        let h = harness(
            MemoryStore {
                fail: true,
                ..Default::default()
            },
            StaticDirectory(Ok(vec![])),
        );
        let mut rx = h.bus.subscribe();
        let now = Utc::now();

        let err = assert_err!(h.ingestor.ingest_at(hot_reading(now), now).await);
        assert!(matches!(err, IngestError::Persistence(_)));
        assert_eq!(err.to_string(), "failed to persist reading: disk full");

        assert!(h.gate.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn quiet_reading_starts_no_dispatch() {
        let h = harness(MemoryStore::default(), StaticDirectory(Ok(vec![])));
        let now = Utc::now();
        let reading: Reading = SystemReading {
            battery_percent: Some(95.0),
            cpu_load_percent: Some(10.0),
            ..SystemReading::new("laptop1", now)
        }
        .into();

        let ingested = assert_ok!(h.ingestor.ingest_at(reading, now).await);
        assert_eq!(ingested.id, 1);
        assert!(ingested.admitted.is_empty());
        assert!(ingested.dispatch.is_none());
    }

    #[tokio::test]
    async fn directory_failure_still_broadcasts() {
        let h = harness(
            MemoryStore::default(),
            StaticDirectory(Err(anyhow!("directory offline"))),
        );
        let now = Utc::now();

        let ingested = assert_ok!(h.ingestor.ingest_at(hot_reading(now), now).await);
        let report = ingested.dispatch.unwrap().await.unwrap();

        assert!(report.broadcast);
        assert_eq!(report.attempted(), 0);
    }

    #[tokio::test]
    async fn prune_keeps_entries_inside_retention() {
        let h = harness(MemoryStore::default(), StaticDirectory(Ok(vec![])));
        let t0 = Utc::now();

        assert_ok!(h.ingestor.ingest_at(hot_reading(t0), t0).await);
        assert_eq!(h.ingestor.prune_cooldowns(t0 + Duration::minutes(16)), 0);
        assert_eq!(h.gate.len(), 1);
        assert_eq!(h.ingestor.prune_cooldowns(t0 + Duration::hours(24)), 1);
        assert!(h.gate.is_empty());
    }

    #[tokio::test]
    async fn cooldown_raised_after_prune_still_suppresses() {
        let thresholds = Arc::new(AdjustableThresholds(Mutex::new(ThresholdConfig::default())));
        let h = harness_with(
            MemoryStore::default(),
            StaticDirectory(Ok(vec![])),
            thresholds.clone(),
        );
        let t0 = Utc::now();

        let first = assert_ok!(h.ingestor.ingest_at(hot_reading(t0), t0).await);
        assert_eq!(first.admitted.len(), 1);

        // Sweep once the original 15 minute cooldown has lapsed.
        h.ingestor.prune_cooldowns(t0 + Duration::minutes(16));

        thresholds.0.lock().unwrap().environment_cooldown = Duration::minutes(60);

        let t1 = t0 + Duration::minutes(20);
        let second = assert_ok!(h.ingestor.ingest_at(hot_reading(t1), t1).await);
        assert!(second.admitted.is_empty());
    }
}
