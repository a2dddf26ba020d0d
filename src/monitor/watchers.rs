use super::probe::{DiskSample, MemorySample};
use super::{Alert, AlertSeverity, MonitorShared};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Log lines carrying any of these fragments count as anomalous.
const LOG_ANOMALY_MARKERS: &[&str] = &["failed password", "segfault", "oom", "out of memory"];

const LOG_TAIL_LINES: usize = 100;

// ─── Classification (pure; alert only on upward threshold crossing) ─────────

pub(crate) fn classify_memory(
    sample: MemorySample,
    last_usage: f64,
    warn_pct: f64,
    crit_pct: f64,
) -> Option<Alert> {
    let rising = sample.usage_pct > last_usage;
    let details = json!({
        "usage_pct": sample.usage_pct,
        "used_gb": sample.used_gb,
        "available_gb": sample.available_gb,
        "total_gb": sample.total_gb,
        "swap_used_pct": sample.swap_used_pct,
    });

    if sample.usage_pct > crit_pct && rising {
        Some(Alert::new(
            AlertSeverity::Critical,
            "memory",
            format!(
                "memory pressure critical: {:.1}% ({:.1}GB used, {:.1}GB available)",
                sample.usage_pct, sample.used_gb, sample.available_gb
            ),
            details,
        ))
    } else if sample.usage_pct > warn_pct && rising {
        Some(Alert::new(
            AlertSeverity::Warning,
            "memory",
            format!(
                "memory pressure high: {:.1}% ({:.1}GB used, {:.1}GB available)",
                sample.usage_pct, sample.used_gb, sample.available_gb
            ),
            details,
        ))
    } else {
        None
    }
}

pub(crate) fn classify_zombies(
    count: usize,
    names: &[(i32, String)],
    last_count: usize,
    warn_count: usize,
    crit_count: usize,
) -> Option<Alert> {
    let rising = count > last_count;
    let details = json!({
        "count": count,
        "zombies": names.iter().take(10).collect::<Vec<_>>(),
    });

    if count > crit_count && rising {
        Some(Alert::new(
            AlertSeverity::Critical,
            "zombie",
            format!("{count} zombie processes detected"),
            details,
        ))
    } else if count > warn_count && rising {
        Some(Alert::new(
            AlertSeverity::Warning,
            "zombie",
            format!("{count} zombie processes detected"),
            details,
        ))
    } else {
        None
    }
}

pub(crate) fn classify_disk(
    sample: &DiskSample,
    last_free_pct: f64,
    warn_free_pct: f64,
    crit_free_pct: f64,
) -> Option<Alert> {
    let falling = sample.free_pct < last_free_pct;
    let used_pct = 100.0 - sample.free_pct;
    let details = json!({
        "device": sample.device,
        "mountpoint": sample.mountpoint,
        "used_pct": used_pct,
        "free_pct": sample.free_pct,
        "free_gb": sample.free_gb,
        "total_gb": sample.total_gb,
    });

    if sample.free_pct < crit_free_pct && falling {
        Some(Alert::new(
            AlertSeverity::Critical,
            "disk",
            format!(
                "disk {} critical: {:.1}% full ({:.1}GB free)",
                sample.device, used_pct, sample.free_gb
            ),
            details,
        ))
    } else if sample.free_pct < warn_free_pct && falling {
        Some(Alert::new(
            AlertSeverity::Warning,
            "disk",
            format!(
                "disk {} low: {:.1}% full ({:.1}GB free)",
                sample.device, used_pct, sample.free_gb
            ),
            details,
        ))
    } else {
        None
    }
}

pub(crate) fn find_log_anomaly(lines: &[String]) -> Option<&String> {
    lines.iter().find(|line| {
        let lowered = line.to_lowercase();
        LOG_ANOMALY_MARKERS
            .iter()
            .any(|marker| lowered.contains(marker))
    })
}

// ─── Watcher loops ──────────────────────────────────────────────────────────

pub(crate) async fn memory_watcher(shared: Arc<MonitorShared>, cancel: CancellationToken) {
    let mut last_usage = 0.0_f64;
    loop {
        if sleep_or_cancel(shared.poll_interval(), &cancel).await {
            return;
        }
        match timeout(shared.sample_timeout(), shared.probe.memory()).await {
            Ok(Ok(sample)) => {
                if let Some(alert) = classify_memory(
                    sample,
                    last_usage,
                    shared.config.memory_warn_pct,
                    shared.config.memory_crit_pct,
                ) {
                    shared.route(alert, None);
                }
                last_usage = sample.usage_pct;
            }
            Ok(Err(e)) => tracing::warn!("memory sample failed: {e}"),
            Err(_) => tracing::warn!("memory sample timed out"),
        }
    }
}

pub(crate) async fn zombie_watcher(shared: Arc<MonitorShared>, cancel: CancellationToken) {
    let mut last_count = 0_usize;
    loop {
        if sleep_or_cancel(shared.slow_poll_interval(), &cancel).await {
            return;
        }
        match timeout(shared.sample_timeout(), shared.probe.zombie_processes()).await {
            Ok(Ok(zombies)) => {
                let names: Vec<(i32, String)> =
                    zombies.iter().map(|z| (z.pid, z.name.clone())).collect();
                if let Some(alert) = classify_zombies(
                    zombies.len(),
                    &names,
                    last_count,
                    shared.config.zombie_warn_count,
                    shared.config.zombie_crit_count,
                ) {
                    shared.route(alert, None);
                }
                last_count = zombies.len();
            }
            Ok(Err(e)) => tracing::warn!("process-table sample failed: {e}"),
            Err(_) => tracing::warn!("process-table sample timed out"),
        }
    }
}

pub(crate) async fn disk_watcher(shared: Arc<MonitorShared>, cancel: CancellationToken) {
    let mut last_free: HashMap<String, f64> = HashMap::new();
    loop {
        if sleep_or_cancel(shared.slow_poll_interval(), &cancel).await {
            return;
        }
        match timeout(shared.sample_timeout(), shared.probe.disks()).await {
            Ok(Ok(disks)) => {
                for sample in disks {
                    let previous = last_free.get(&sample.device).copied().unwrap_or(100.0);
                    if let Some(alert) = classify_disk(
                        &sample,
                        previous,
                        shared.config.disk_warn_free_pct,
                        shared.config.disk_crit_free_pct,
                    ) {
                        shared.route(alert, Some(&sample.device));
                    }
                    last_free.insert(sample.device, sample.free_pct);
                }
            }
            Ok(Err(e)) => tracing::warn!("disk sample failed: {e}"),
            Err(_) => tracing::warn!("disk sample timed out"),
        }
    }
}

pub(crate) async fn network_watcher(shared: Arc<MonitorShared>, cancel: CancellationToken) {
    let mut known: HashSet<String> = HashSet::new();
    let mut seeded = false;
    let mut last_alerted = 0_usize;
    loop {
        if sleep_or_cancel(shared.poll_interval(), &cancel).await {
            return;
        }
        match timeout(shared.sample_timeout(), shared.probe.established_connections()).await {
            Ok(Ok(connections)) => {
                let current: HashSet<String> = connections
                    .iter()
                    .map(|c| format!("{}-{}", c.local, c.remote))
                    .collect();

                if seeded {
                    let fresh: Vec<&String> = current.difference(&known).collect();
                    if fresh.len() <= shared.config.net_new_conn_warn {
                        last_alerted = 0;
                    } else if fresh.len() > last_alerted {
                        shared.route(
                            Alert::new(
                                AlertSeverity::Warning,
                                "network",
                                format!("{} new peer connections detected", fresh.len()),
                                json!({
                                    "new_connections": fresh.iter().take(10).collect::<Vec<_>>(),
                                }),
                            ),
                            None,
                        );
                        last_alerted = fresh.len();
                    }
                } else {
                    seeded = true;
                }
                known = current;
            }
            Ok(Err(e)) => tracing::warn!("connection sample failed: {e}"),
            Err(_) => tracing::warn!("connection sample timed out"),
        }
    }
}

pub(crate) async fn log_watcher(shared: Arc<MonitorShared>, cancel: CancellationToken) {
    let mut last_reported: Option<String> = None;
    loop {
        if sleep_or_cancel(shared.poll_interval(), &cancel).await {
            return;
        }
        match timeout(
            shared.sample_timeout(),
            shared.probe.tail_log(&shared.log_path, LOG_TAIL_LINES),
        )
        .await
        {
            Ok(Ok(lines)) => {
                if let Some(line) = find_log_anomaly(&lines)
                    && last_reported.as_deref() != Some(line.as_str())
                {
                    let mut message = format!("log anomaly: {line}");
                    if message.chars().count() > 140 {
                        message = message.chars().take(140).collect();
                        message.push('…');
                    }
                    shared.route(
                        Alert::new(
                            AlertSeverity::Info,
                            "log",
                            message,
                            json!({ "log_line": line }),
                        ),
                        None,
                    );
                    last_reported = Some(line.clone());
                }
            }
            // Missing log files are routine; retry quietly next cycle.
            Ok(Err(e)) => tracing::debug!("log tail failed: {e}"),
            Err(_) => tracing::warn!("log tail timed out"),
        }
    }
}

/// Returns true when cancelled.
async fn sleep_or_cancel(period: std::time::Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(period) => false,
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testing {
    use crate::error::MonitorError;
    use crate::monitor::probe::{
        ConnectionSample, DiskSample, MemorySample, ProcessInfo, SystemProbe,
    };
    use async_trait::async_trait;
    use std::path::Path;

    /// Probe that has nothing to report.
    pub(crate) struct NullProbe;

    #[async_trait]
    impl SystemProbe for NullProbe {
        async fn memory(&self) -> Result<MemorySample, MonitorError> {
            Err(MonitorError::Sample("unavailable".into()))
        }

        async fn zombie_processes(&self) -> Result<Vec<ProcessInfo>, MonitorError> {
            Ok(Vec::new())
        }

        async fn disks(&self) -> Result<Vec<DiskSample>, MonitorError> {
            Ok(Vec::new())
        }

        async fn established_connections(&self) -> Result<Vec<ConnectionSample>, MonitorError> {
            Ok(Vec::new())
        }

        async fn tail_log(
            &self,
            _path: &Path,
            _max_lines: usize,
        ) -> Result<Vec<String>, MonitorError> {
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_sample(usage_pct: f64) -> MemorySample {
        MemorySample {
            usage_pct,
            used_gb: 14.0,
            available_gb: 2.0,
            total_gb: 16.0,
            swap_used_pct: 10.0,
        }
    }

    #[test]
    fn memory_alerts_only_on_upward_crossing() {
        // Crosses the warning threshold while rising: one alert.
        let alert = classify_memory(memory_sample(87.0), 80.0, 85.0, 90.0).unwrap();
        assert_eq!(alert.severity, AlertSeverity::Warning);

        // Still above threshold but not rising: silent.
        assert!(classify_memory(memory_sample(86.0), 87.0, 85.0, 90.0).is_none());

        // Crosses critical while rising: critical, not warning.
        let alert = classify_memory(memory_sample(93.0), 86.0, 85.0, 90.0).unwrap();
        assert_eq!(alert.severity, AlertSeverity::Critical);
    }

    #[test]
    fn memory_below_threshold_never_alerts() {
        assert!(classify_memory(memory_sample(50.0), 10.0, 85.0, 90.0).is_none());
    }

    #[test]
    fn zombie_severity_scales_with_count() {
        let names = vec![(101, "defunct-worker".to_string())];
        let warning = classify_zombies(7, &names, 3, 5, 10).unwrap();
        assert_eq!(warning.severity, AlertSeverity::Warning);

        let critical = classify_zombies(12, &names, 7, 5, 10).unwrap();
        assert_eq!(critical.severity, AlertSeverity::Critical);

        // Count steady: no alert even above threshold.
        assert!(classify_zombies(12, &names, 12, 5, 10).is_none());
    }

    #[test]
    fn disk_alerts_when_free_space_falls_past_threshold() {
        let sample = DiskSample {
            device: "/dev/sda1".into(),
            mountpoint: "/".into(),
            free_pct: 4.0,
            free_gb: 9.5,
            total_gb: 238.0,
        };
        let alert = classify_disk(&sample, 6.0, 20.0, 5.0).unwrap();
        assert_eq!(alert.severity, AlertSeverity::Critical);
        assert_eq!(alert.details["device"], "/dev/sda1");

        // Free space recovering: silent even below threshold.
        assert!(classify_disk(&sample, 3.0, 20.0, 5.0).is_none());
    }

    #[test]
    fn log_anomaly_matcher_is_case_insensitive() {
        let lines = vec![
            "Mar 01 12:00:00 host systemd[1]: started session".to_string(),
            "Mar 01 12:00:01 host kernel: app[420]: SEGFAULT at 0".to_string(),
        ];
        assert!(find_log_anomaly(&lines).unwrap().contains("SEGFAULT"));
        assert!(find_log_anomaly(&["all quiet".to_string()]).is_none());
    }
}
