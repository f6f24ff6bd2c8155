//! Per-service failure tracking.
//!
//! A service opens after `failure_threshold` consecutive failed requests and
//! stays open until [`FailureTracker::reset`] is called. There is no
//! half-open probing: an open service is never contacted again on its own.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::notify::{Notification, Notifier};
use crate::{CoreError, UtcDateTime};

/// Circuit state of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
}

/// Failure tracker thresholds and checkpoint location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    /// JSON file the tracker state is saved to; `None` keeps it in memory only.
    pub checkpoint_path: Option<PathBuf>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            checkpoint_path: None,
        }
    }
}

/// Mutable failure bookkeeping for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureState {
    pub service_name: String,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_success: Option<UtcDateTime>,
    pub disabled: bool,
    #[serde(default)]
    pub opened_at: Option<UtcDateTime>,
}

impl FailureState {
    fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_owned(),
            consecutive_failures: 0,
            last_error: None,
            last_success: None,
            disabled: false,
            opened_at: None,
        }
    }
}

/// Read-only health view of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceHealth {
    pub service: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_success: Option<UtcDateTime>,
    pub opened_at: Option<UtcDateTime>,
}

impl From<&FailureState> for ServiceHealth {
    fn from(state: &FailureState) -> Self {
        Self {
            service: state.service_name.clone(),
            state: if state.disabled {
                CircuitState::Open
            } else {
                CircuitState::Closed
            },
            consecutive_failures: state.consecutive_failures,
            last_error: state.last_error.clone(),
            last_success: state.last_success,
            opened_at: state.opened_at,
        }
    }
}

/// What a recorded failure did to the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Still closed; the counter moved.
    Counted { consecutive_failures: u32 },
    /// This failure reached the threshold.
    Opened { consecutive_failures: u32 },
    /// The circuit was already open.
    AlreadyOpen { consecutive_failures: u32 },
}

impl FailureOutcome {
    pub const fn opened(self) -> bool {
        matches!(self, Self::Opened { .. })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    services: Vec<FailureState>,
}

/// Thread-safe per-service circuit breaker shared by every executor.
#[derive(Debug)]
pub struct FailureTracker {
    config: BreakerConfig,
    states: Mutex<HashMap<String, FailureState>>,
    notifier: Notifier,
}

impl Default for FailureTracker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl FailureTracker {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_notifier(config, Notifier::default())
    }

    pub fn with_notifier(config: BreakerConfig, notifier: Notifier) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
            notifier,
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// `false` once the service is open.
    pub fn allow(&self, service: &str) -> bool {
        self.states()
            .get(service)
            .is_none_or(|state| !state.disabled)
    }

    pub fn record_success(&self, service: &str) {
        let mut states = self.states();
        let state = states
            .entry(service.to_owned())
            .or_insert_with(|| FailureState::new(service));
        state.consecutive_failures = 0;
        state.last_success = Some(UtcDateTime::now());
    }

    pub fn record_failure(&self, service: &str, error: &str) -> FailureOutcome {
        let threshold = self.config.failure_threshold.max(1);
        let outcome = {
            let mut states = self.states();
            let state = states
                .entry(service.to_owned())
                .or_insert_with(|| FailureState::new(service));
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.last_error = Some(error.to_owned());

            if state.disabled {
                FailureOutcome::AlreadyOpen {
                    consecutive_failures: state.consecutive_failures,
                }
            } else if state.consecutive_failures >= threshold {
                state.disabled = true;
                state.opened_at = Some(UtcDateTime::now());
                FailureOutcome::Opened {
                    consecutive_failures: state.consecutive_failures,
                }
            } else {
                FailureOutcome::Counted {
                    consecutive_failures: state.consecutive_failures,
                }
            }
        };

        if let FailureOutcome::Opened {
            consecutive_failures,
        } = outcome
        {
            tracing::warn!(
                service,
                consecutive_failures,
                last_error = error,
                "circuit opened; service disabled until reset"
            );
            self.notifier.publish(Notification::CircuitOpened {
                service: service.to_owned(),
                consecutive_failures,
                last_error: error.to_owned(),
                at: UtcDateTime::now(),
            });
        }
        outcome
    }

    /// Closes the circuit and clears the counter. Returns whether the service was open.
    pub fn reset(&self, service: &str) -> bool {
        let was_open = {
            let mut states = self.states();
            match states.get_mut(service) {
                Some(state) => {
                    let was_open = state.disabled;
                    state.disabled = false;
                    state.consecutive_failures = 0;
                    state.opened_at = None;
                    was_open
                }
                None => false,
            }
        };

        self.notifier.dismiss(service);
        tracing::info!(service, was_open, "circuit reset");
        was_open
    }

    pub fn health(&self, service: &str) -> ServiceHealth {
        self.states()
            .get(service)
            .map(ServiceHealth::from)
            .unwrap_or_else(|| ServiceHealth::from(&FailureState::new(service)))
    }

    /// Health of every service seen so far, sorted by name.
    pub fn snapshot(&self) -> Vec<ServiceHealth> {
        let mut health: Vec<ServiceHealth> =
            self.states().values().map(ServiceHealth::from).collect();
        health.sort_by(|left, right| left.service.cmp(&right.service));
        health
    }

    /// Saves state to the configured checkpoint path. Returns `false` when none is configured.
    pub async fn checkpoint(&self) -> Result<bool, CoreError> {
        let Some(path) = self.config.checkpoint_path.clone() else {
            return Ok(false);
        };
        self.save(&path).await?;
        Ok(true)
    }

    /// Loads state from the configured checkpoint path, if any. Returns the number of services restored.
    pub async fn restore(&self) -> Result<usize, CoreError> {
        match self.config.checkpoint_path.clone() {
            Some(path) => self.load(&path).await,
            None => Ok(0),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<(), CoreError> {
        let mut services: Vec<FailureState> = self.states().values().cloned().collect();
        services.sort_by(|left, right| left.service_name.cmp(&right.service_name));
        let bytes = serde_json::to_vec_pretty(&Checkpoint { services })?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("breaker.json");
        let temp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));
        fs::write(&temp, bytes).await?;
        if let Err(error) = fs::rename(&temp, path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(error.into());
        }
        tracing::debug!(path = %path.display(), "failure tracker checkpoint saved");
        Ok(())
    }

    /// Replaces in-memory state with the checkpoint at `path`. A missing file restores nothing.
    pub async fn load(&self, path: &Path) -> Result<usize, CoreError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(error) => return Err(error.into()),
        };
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)?;
        let restored = checkpoint.services.len();

        let reopened: Vec<FailureState> = checkpoint
            .services
            .iter()
            .filter(|state| state.disabled)
            .cloned()
            .collect();
        {
            let mut states = self.states();
            states.clear();
            for state in checkpoint.services {
                states.insert(state.service_name.clone(), state);
            }
        }

        for state in reopened {
            self.notifier.publish(Notification::CircuitOpened {
                service: state.service_name.clone(),
                consecutive_failures: state.consecutive_failures,
                last_error: state.last_error.clone().unwrap_or_default(),
                at: state.opened_at.unwrap_or_else(UtcDateTime::now),
            });
        }
        tracing::debug!(path = %path.display(), restored, "failure tracker checkpoint loaded");
        Ok(restored)
    }

    fn states(&self) -> MutexGuard<'_, HashMap<String, FailureState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn opens_on_exactly_the_threshold_failure() {
        let tracker = FailureTracker::default();

        assert_eq!(
            tracker.record_failure("metar", "timeout"),
            FailureOutcome::Counted {
                consecutive_failures: 1
            }
        );
        assert!(!tracker.record_failure("metar", "timeout").opened());
        assert!(tracker.allow("metar"));

        assert!(tracker.record_failure("metar", "timeout").opened());
        assert!(!tracker.allow("metar"));
        assert_eq!(tracker.health("metar").state, CircuitState::Open);
    }

    #[test]
    fn success_resets_counter_but_not_history() {
        let tracker = FailureTracker::default();
        tracker.record_failure("readsb", "connection refused");
        tracker.record_failure("readsb", "connection refused");
        tracker.record_success("readsb");

        let health = tracker.health("readsb");
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.state, CircuitState::Closed);
        assert!(health.last_success.is_some());
        assert_eq!(health.last_error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn open_circuit_stays_open_until_reset() {
        let notifier = Notifier::default();
        let tracker = FailureTracker::with_notifier(BreakerConfig::default(), notifier.clone());
        for _ in 0..3 {
            tracker.record_failure("notam", "http 503");
        }
        assert_eq!(notifier.outstanding().len(), 1);

        tracker.record_success("notam");
        assert!(!tracker.allow("notam"), "success does not re-enable");

        assert!(tracker.reset("notam"));
        assert!(tracker.allow("notam"));
        assert_eq!(tracker.health("notam").consecutive_failures, 0);
        assert!(notifier.outstanding().is_empty());
    }

    #[test]
    fn unknown_service_is_closed() {
        let tracker = FailureTracker::default();
        assert!(tracker.allow("never-seen"));
        assert_eq!(tracker.health("never-seen").state, CircuitState::Closed);
        assert!(!tracker.reset("never-seen"));
    }

    #[tokio::test]
    async fn checkpoint_round_trip_keeps_open_circuits() {
        let dir = tempdir().expect("tempdir");
        let config = BreakerConfig {
            failure_threshold: 1,
            checkpoint_path: Some(dir.path().join("state").join("breaker.json")),
        };

        let tracker = FailureTracker::new(config.clone());
        tracker.record_failure("opensky", "http 500");
        tracker.record_success("metar");
        assert!(tracker.checkpoint().await.expect("saved"));

        let notifier = Notifier::default();
        let restored = FailureTracker::with_notifier(config, notifier.clone());
        assert_eq!(restored.restore().await.expect("loaded"), 2);
        assert!(!restored.allow("opensky"));
        assert!(restored.allow("metar"));
        assert_eq!(notifier.outstanding().len(), 1);
    }

    #[tokio::test]
    async fn missing_checkpoint_restores_nothing() {
        let dir = tempdir().expect("tempdir");
        let tracker = FailureTracker::default();
        let restored = tracker
            .load(&dir.path().join("absent.json"))
            .await
            .expect("missing file is fine");
        assert_eq!(restored, 0);
    }
}
