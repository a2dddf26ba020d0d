pub mod probe;
pub mod watchers;

pub use probe::{
    ConnectionSample, DiskSample, MemorySample, ProcProbe, ProcessInfo, SystemProbe,
};

use crate::config::MonitorConfig;
use crate::events::{AgentEvent, EventSender};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Alert severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Critical,
    Warning,
    Info,
}

/// A severity-classified host-health alert. Ephemeral: published on the
/// event bus, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub alert_type: String,
    pub message: String,
    pub details: Value,
    pub timestamp: String,
}

impl Alert {
    pub fn new(severity: AlertSeverity, alert_type: &str, message: String, details: Value) -> Self {
        Self {
            severity,
            alert_type: alert_type.to_string(),
            message,
            details,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Shared watcher state: config, probe, bus, and the rate-limit cache.
pub(crate) struct MonitorShared {
    pub(crate) config: MonitorConfig,
    pub(crate) probe: Arc<dyn SystemProbe>,
    pub(crate) events: EventSender,
    pub(crate) log_path: PathBuf,
    rate_cache: Mutex<HashMap<String, Instant>>,
}

impl MonitorShared {
    /// Same-key alerts are suppressed within the cooldown window,
    /// independent of the threshold-crossing logic.
    pub(crate) fn should_emit(&self, alert_type: &str, device: Option<&str>) -> bool {
        let key = match device {
            Some(device) => format!("{alert_type}:{device}"),
            None => alert_type.to_string(),
        };
        let cooldown = Duration::from_secs(self.config.alert_cooldown_secs);
        let mut cache = self.rate_cache.lock().unwrap();
        let now = Instant::now();
        if let Some(last) = cache.get(&key)
            && now.duration_since(*last) < cooldown
        {
            return false;
        }
        cache.insert(key, now);
        true
    }

    pub(crate) fn route(&self, alert: Alert, device: Option<&str>) {
        if !self.should_emit(&alert.alert_type, device) {
            tracing::debug!(alert_type = alert.alert_type.as_str(), "alert rate limited");
            return;
        }

        tracing::warn!(
            severity = ?alert.severity,
            alert_type = alert.alert_type.as_str(),
            "{}",
            alert.message
        );
        let _ = self.events.send(AgentEvent::SystemAlert(alert));
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.poll_interval_secs).max(Duration::from_millis(10))
    }

    pub(crate) fn slow_poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.slow_poll_interval_secs).max(Duration::from_millis(10))
    }

    pub(crate) fn sample_timeout(&self) -> Duration {
        Duration::from_secs(self.config.sample_timeout_secs.max(1))
    }
}

/// Owns the independent periodic watcher tasks.
pub struct MonitorManager {
    shared: Arc<MonitorShared>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl MonitorManager {
    pub fn new(
        config: MonitorConfig,
        log_path: PathBuf,
        probe: Arc<dyn SystemProbe>,
        events: EventSender,
    ) -> Self {
        Self {
            shared: Arc::new(MonitorShared {
                config,
                probe,
                events,
                log_path,
                rate_cache: Mutex::new(HashMap::new()),
            }),
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn start(&mut self) {
        if !self.shared.config.enabled || !self.tasks.is_empty() {
            return;
        }

        self.tasks.push(tokio::spawn(watchers::memory_watcher(
            Arc::clone(&self.shared),
            self.cancel.clone(),
        )));
        self.tasks.push(tokio::spawn(watchers::zombie_watcher(
            Arc::clone(&self.shared),
            self.cancel.clone(),
        )));
        self.tasks.push(tokio::spawn(watchers::disk_watcher(
            Arc::clone(&self.shared),
            self.cancel.clone(),
        )));
        self.tasks.push(tokio::spawn(watchers::network_watcher(
            Arc::clone(&self.shared),
            self.cancel.clone(),
        )));
        self.tasks.push(tokio::spawn(watchers::log_watcher(
            Arc::clone(&self.shared),
            self.cancel.clone(),
        )));

        tracing::info!(watchers = self.tasks.len(), "host monitoring started");
    }

    /// Cancel every watcher and wait for it to wind down.
    pub async fn stop(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        tracing::info!("host monitoring stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_bus;
    use crate::monitor::watchers::testing::NullProbe;

    fn shared_with_cooldown(secs: u64) -> Arc<MonitorShared> {
        let (tx, _rx) = event_bus(16);
        let config = MonitorConfig {
            alert_cooldown_secs: secs,
            ..MonitorConfig::default()
        };
        Arc::new(MonitorShared {
            config,
            probe: Arc::new(NullProbe),
            events: tx,
            log_path: PathBuf::from("/nonexistent"),
            rate_cache: Mutex::new(HashMap::new()),
        })
    }

    #[test]
    fn rate_cache_suppresses_within_cooldown() {
        let shared = shared_with_cooldown(300);
        assert!(shared.should_emit("memory", None));
        assert!(!shared.should_emit("memory", None));
        // Different alert type is an independent key.
        assert!(shared.should_emit("disk", None));
    }

    #[test]
    fn rate_cache_keys_per_device() {
        let shared = shared_with_cooldown(300);
        assert!(shared.should_emit("disk", Some("/dev/sda1")));
        assert!(shared.should_emit("disk", Some("/dev/sdb1")));
        assert!(!shared.should_emit("disk", Some("/dev/sda1")));
    }

    #[test]
    fn zero_cooldown_always_emits() {
        let shared = shared_with_cooldown(0);
        assert!(shared.should_emit("memory", None));
        assert!(shared.should_emit("memory", None));
    }

    #[tokio::test]
    async fn route_publishes_surviving_alert() {
        let (tx, mut rx) = event_bus(16);
        let shared = Arc::new(MonitorShared {
            config: MonitorConfig::default(),
            probe: Arc::new(NullProbe),
            events: tx,
            log_path: PathBuf::from("/nonexistent"),
            rate_cache: Mutex::new(HashMap::new()),
        });

        shared.route(
            Alert::new(
                AlertSeverity::Warning,
                "memory",
                "memory pressure high".into(),
                Value::Null,
            ),
            None,
        );

        match rx.recv().await.unwrap() {
            AgentEvent::SystemAlert(alert) => assert_eq!(alert.alert_type, "memory"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
