use crate::error::MonitorError;
use async_trait::async_trait;
use std::path::Path;

/// One memory-pressure sample.
#[derive(Debug, Clone, Copy)]
pub struct MemorySample {
    pub usage_pct: f64,
    pub used_gb: f64,
    pub available_gb: f64,
    pub total_gb: f64,
    pub swap_used_pct: f64,
}

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: i32,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct DiskSample {
    pub device: String,
    pub mountpoint: String,
    pub free_pct: f64,
    pub free_gb: f64,
    pub total_gb: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionSample {
    pub local: String,
    pub remote: String,
}

/// Host metric source. Watchers sample exclusively through this seam so
/// tests can script pathological hosts.
#[async_trait]
pub trait SystemProbe: Send + Sync {
    async fn memory(&self) -> Result<MemorySample, MonitorError>;
    async fn zombie_processes(&self) -> Result<Vec<ProcessInfo>, MonitorError>;
    async fn disks(&self) -> Result<Vec<DiskSample>, MonitorError>;
    async fn established_connections(&self) -> Result<Vec<ConnectionSample>, MonitorError>;
    async fn tail_log(&self, path: &Path, max_lines: usize) -> Result<Vec<String>, MonitorError>;
}

/// Production probe reading `/proc` and `statvfs`. Blocking filesystem walks
/// are offloaded so the event loop is never stalled.
pub struct ProcProbe;

const GIB: f64 = 1_073_741_824.0;

#[async_trait]
impl SystemProbe for ProcProbe {
    async fn memory(&self) -> Result<MemorySample, MonitorError> {
        let meminfo = tokio::fs::read_to_string("/proc/meminfo")
            .await
            .map_err(|e| MonitorError::Sample(format!("/proc/meminfo: {e}")))?;
        parse_meminfo(&meminfo)
    }

    async fn zombie_processes(&self) -> Result<Vec<ProcessInfo>, MonitorError> {
        tokio::task::spawn_blocking(scan_zombies)
            .await
            .map_err(|e| MonitorError::Sample(e.to_string()))?
    }

    async fn disks(&self) -> Result<Vec<DiskSample>, MonitorError> {
        tokio::task::spawn_blocking(scan_disks)
            .await
            .map_err(|e| MonitorError::Sample(e.to_string()))?
    }

    async fn established_connections(&self) -> Result<Vec<ConnectionSample>, MonitorError> {
        let mut connections = Vec::new();
        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            match tokio::fs::read_to_string(table).await {
                Ok(content) => connections.extend(parse_established(&content)),
                Err(e) => tracing::debug!(table, "connection table unavailable: {e}"),
            }
        }
        Ok(connections)
    }

    async fn tail_log(&self, path: &Path, max_lines: usize) -> Result<Vec<String>, MonitorError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| MonitorError::Sample(format!("{}: {e}", path.display())))?;
        let lines: Vec<String> = content.lines().map(str::to_string).collect();
        let start = lines.len().saturating_sub(max_lines);
        Ok(lines[start..].to_vec())
    }
}

fn parse_meminfo(meminfo: &str) -> Result<MemorySample, MonitorError> {
    let field = |name: &str| -> Option<f64> {
        meminfo
            .lines()
            .find(|line| line.starts_with(name))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<f64>().ok())
            .map(|kb| kb * 1024.0)
    };

    let total = field("MemTotal:").ok_or_else(|| MonitorError::Sample("MemTotal missing".into()))?;
    let available =
        field("MemAvailable:").ok_or_else(|| MonitorError::Sample("MemAvailable missing".into()))?;
    let swap_total = field("SwapTotal:").unwrap_or(0.0);
    let swap_free = field("SwapFree:").unwrap_or(0.0);

    let used = total - available;
    let swap_used_pct = if swap_total > 0.0 {
        (swap_total - swap_free) / swap_total * 100.0
    } else {
        0.0
    };

    Ok(MemorySample {
        usage_pct: used / total * 100.0,
        used_gb: used / GIB,
        available_gb: available / GIB,
        total_gb: total / GIB,
        swap_used_pct,
    })
}

fn scan_zombies() -> Result<Vec<ProcessInfo>, MonitorError> {
    let entries =
        std::fs::read_dir("/proc").map_err(|e| MonitorError::Sample(format!("/proc: {e}")))?;

    let mut zombies = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some((name, state)) = parse_stat(&stat)
            && state == 'Z'
        {
            zombies.push(ProcessInfo { pid, name });
        }
    }
    Ok(zombies)
}

/// `/proc/[pid]/stat` is `pid (comm) state ...`; comm may itself contain
/// parentheses, so split at the last `)`.
fn parse_stat(stat: &str) -> Option<(String, char)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let name = stat.get(open + 1..close)?.to_string();
    let state = stat.get(close + 1..)?.split_whitespace().next()?.chars().next()?;
    Some((name, state))
}

fn scan_disks() -> Result<Vec<DiskSample>, MonitorError> {
    let mounts = std::fs::read_to_string("/proc/mounts")
        .map_err(|e| MonitorError::Sample(format!("/proc/mounts: {e}")))?;

    let mut seen = std::collections::HashSet::new();
    let mut disks = Vec::new();
    for line in mounts.lines() {
        let mut parts = line.split_whitespace();
        let (Some(device), Some(mountpoint)) = (parts.next(), parts.next()) else {
            continue;
        };
        // Loop mounts are squashfs images, not real capacity.
        if !device.starts_with("/dev/") || device.starts_with("/dev/loop") {
            continue;
        }
        if !seen.insert(device.to_string()) {
            continue;
        }
        if let Some(sample) = statvfs_sample(device, mountpoint) {
            disks.push(sample);
        }
    }
    Ok(disks)
}

fn statvfs_sample(device: &str, mountpoint: &str) -> Option<DiskSample> {
    let path = std::ffi::CString::new(mountpoint).ok()?;
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(path.as_ptr(), &raw mut stats) };
    if rc != 0 {
        return None;
    }

    let frsize = stats.f_frsize as f64;
    let total = stats.f_blocks as f64 * frsize;
    if total <= 0.0 {
        return None;
    }
    let free = stats.f_bavail as f64 * frsize;

    Some(DiskSample {
        device: device.to_string(),
        mountpoint: mountpoint.to_string(),
        free_pct: free / total * 100.0,
        free_gb: free / GIB,
        total_gb: total / GIB,
    })
}

fn parse_established(table: &str) -> Vec<ConnectionSample> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let _slot = parts.next()?;
            let local = parts.next()?;
            let remote = parts.next()?;
            let state = parts.next()?;
            // 01 = ESTABLISHED
            (state == "01").then(|| ConnectionSample {
                local: local.to_string(),
                remote: remote.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_parses_usage() {
        let meminfo = "MemTotal:       16000000 kB\n\
                       MemFree:         1000000 kB\n\
                       MemAvailable:    4000000 kB\n\
                       SwapTotal:       8000000 kB\n\
                       SwapFree:        6000000 kB\n";
        let sample = parse_meminfo(meminfo).unwrap();
        assert!((sample.usage_pct - 75.0).abs() < 0.01);
        assert!((sample.swap_used_pct - 25.0).abs() < 0.01);
        assert!(sample.total_gb > 14.0);
    }

    #[test]
    fn meminfo_without_available_errors() {
        let err = parse_meminfo("MemTotal: 1 kB\n").unwrap_err();
        assert!(err.to_string().contains("MemAvailable"));
    }

    #[test]
    fn stat_parses_names_with_parens() {
        let (name, state) = parse_stat("42 (tmux: server) Z 1 42").unwrap();
        assert_eq!(name, "tmux: server");
        assert_eq!(state, 'Z');
    }

    #[test]
    fn established_filter_matches_state_01() {
        let table = "  sl  local_address rem_address   st\n\
                     0: 0100007F:1F90 00000000:0000 0A\n\
                     1: 0100007F:AAAA C0A80001:0050 01\n";
        let conns = parse_established(table);
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].remote, "C0A80001:0050");
    }
}
