//! Notification cooldown gate.
//!
//! [`CooldownGate`] remembers when each `(device, alert kind)` pair last
//! fired and drops candidates that fired again inside the cooldown window.
//! The whole map sits behind one mutex: the lookup and the write of the new
//! firing time happen under the same lock, so two readings racing for the
//! same key cannot both be admitted within one window.
//!
//! State lives in memory only. After a restart each active condition may
//! notify once more.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::model::AlertCandidate;

/// Device id used in cooldown keys when a candidate carries none.
const UNKNOWN_DEVICE: &str = "unknown";

/// Deduplicates alert candidates per device and alert kind.
#[derive(Debug, Default)]
pub struct CooldownGate {
    last_fired: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl CooldownGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter `candidates` down to those allowed to fire at `now`.
    ///
    /// A candidate is admitted when its key has never fired or fired at
    /// least `cooldown` ago. Admitted keys are stamped with `now` before the
    /// next candidate is looked at. Input order is preserved.
    pub fn admit(
        &self,
        candidates: Vec<AlertCandidate>,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> Vec<AlertCandidate> {
        let mut last_fired = self.lock();

        candidates
            .into_iter()
            .filter(|candidate| {
                let key = cooldown_key(candidate);
                let eligible = last_fired
                    .get(&key)
                    .is_none_or(|last| now.signed_duration_since(*last) >= cooldown);

                if eligible {
                    last_fired.insert(key, now);
                } else {
                    debug!(key = %key, "Alert suppressed by cooldown");
                }
                eligible
            })
            .collect()
    }

    /// Forget entries that are already at least `max_age` old.
    ///
    /// With `max_age` no shorter than any cooldown in use, a pruned entry
    /// would have admitted its next candidate anyway, so admission results
    /// do not change. Returns the number of entries removed.
    pub fn prune(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let mut last_fired = self.lock();
        let before = last_fired.len();
        last_fired.retain(|_, last| now.signed_duration_since(*last) < max_age);
        before - last_fired.len()
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        // The map is always left consistent, so a panic elsewhere while
        // holding the lock does not invalidate it.
        self.last_fired.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn cooldown_key(candidate: &AlertCandidate) -> String {
    let device = if candidate.device_id.is_empty() {
        UNKNOWN_DEVICE
    } else {
        candidate.device_id.as_str()
    };
    format!("{}:{}", device, candidate.key)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::{AlertLevel, Threshold};

    fn candidate(device: &str, key: &'static str) -> AlertCandidate {
        AlertCandidate {
            key,
            metric: "temperature",
            level: AlertLevel::High,
            value: 40.0,
            threshold: Threshold::Value(35.0),
            device_id: device.to_string(),
            message: String::new(),
        }
    }

    #[test]
    fn test_second_alert_inside_window_is_dropped() {
        let gate = CooldownGate::new();
        let t0 = Utc::now();
        let cooldown = Duration::minutes(15);

        let first = gate.admit(vec![candidate("d1", "temperatureHigh")], t0, cooldown);
        assert_eq!(first.len(), 1);

        let second = gate.admit(
            vec![candidate("d1", "temperatureHigh")],
            t0 + Duration::minutes(5),
            cooldown,
        );
        assert!(second.is_empty());
    }

    #[test]
    fn test_alert_admitted_once_window_has_elapsed() {
        let gate = CooldownGate::new();
        let t0 = Utc::now();
        let cooldown = Duration::minutes(15);

        gate.admit(vec![candidate("d1", "temperatureHigh")], t0, cooldown);

        let exactly = gate.admit(
            vec![candidate("d1", "temperatureHigh")],
            t0 + cooldown,
            cooldown,
        );
        assert_eq!(exactly.len(), 1);
    }

    #[test]
    fn test_suppressed_attempt_does_not_extend_window() {
        let gate = CooldownGate::new();
        let t0 = Utc::now();
        let cooldown = Duration::minutes(15);

        gate.admit(vec![candidate("d1", "humidityLow")], t0, cooldown);
        gate.admit(
            vec![candidate("d1", "humidityLow")],
            t0 + Duration::minutes(10),
            cooldown,
        );

        let later = gate.admit(
            vec![candidate("d1", "humidityLow")],
            t0 + Duration::minutes(16),
            cooldown,
        );
        assert_eq!(later.len(), 1);
    }

    #[test]
    fn test_keys_are_independent() {
        let gate = CooldownGate::new();
        let now = Utc::now();
        let cooldown = Duration::minutes(15);

        gate.admit(vec![candidate("d1", "temperatureHigh")], now, cooldown);

        let admitted = gate.admit(
            vec![
                candidate("d1", "temperatureHigh"),
                candidate("d1", "humidityHigh"),
                candidate("d2", "temperatureHigh"),
            ],
            now,
            cooldown,
        );

        let pairs: Vec<_> = admitted
            .iter()
            .map(|a| (a.device_id.as_str(), a.key))
            .collect();
        assert_eq!(pairs, vec![("d1", "humidityHigh"), ("d2", "temperatureHigh")]);
    }

    #[test]
    fn test_duplicate_key_in_one_batch_admitted_once() {
        let gate = CooldownGate::new();
        let admitted = gate.admit(
            vec![candidate("d1", "lightHigh"), candidate("d1", "lightHigh")],
            Utc::now(),
            Duration::minutes(15),
        );
        assert_eq!(admitted.len(), 1);
    }

    #[test]
    fn test_missing_device_uses_unknown_key() {
        let gate = CooldownGate::new();
        let now = Utc::now();
        let cooldown = Duration::minutes(15);

        gate.admit(vec![candidate("", "lightHigh")], now, cooldown);
        let again = gate.admit(vec![candidate("unknown", "lightHigh")], now, cooldown);

        assert!(again.is_empty());
    }

    #[test]
    fn test_clock_going_backwards_stays_suppressed() {
        let gate = CooldownGate::new();
        let now = Utc::now();
        let cooldown = Duration::minutes(15);

        gate.admit(vec![candidate("d1", "pressureLow")], now, cooldown);
        let earlier = gate.admit(
            vec![candidate("d1", "pressureLow")],
            now - Duration::minutes(1),
            cooldown,
        );
        assert!(earlier.is_empty());
    }

    #[test]
    fn test_prune_removes_only_expired_entries() {
        let gate = CooldownGate::new();
        let t0 = Utc::now();
        let cooldown = Duration::minutes(15);

        gate.admit(vec![candidate("d1", "temperatureHigh")], t0, cooldown);
        gate.admit(
            vec![candidate("d2", "temperatureHigh")],
            t0 + Duration::minutes(10),
            cooldown,
        );
        assert_eq!(gate.len(), 2);

        let removed = gate.prune(t0 + Duration::minutes(20), cooldown);
        assert_eq!(removed, 1);
        assert_eq!(gate.len(), 1);

        // d2 is still cooling down
        let admitted = gate.admit(
            vec![candidate("d2", "temperatureHigh")],
            t0 + Duration::minutes(20),
            cooldown,
        );
        assert!(admitted.is_empty());
    }

    #[test]
    fn test_concurrent_admission_fires_once() {
        let gate = Arc::new(CooldownGate::new());
        let now = Utc::now();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || {
                    gate.admit(
                        vec![candidate("d1", "temperatureHigh")],
                        now,
                        Duration::minutes(15),
                    )
                    .len()
                })
            })
            .collect();

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 1);
    }
}
