use crate::error::ConfigError;
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// State directory - computed from home, not serialized
    #[serde(skip)]
    pub state_dir: PathBuf,
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Reasoning-service API key. Overridable via FAMULUS_API_KEY.
    pub api_key: Option<String>,

    #[serde(default)]
    pub brain: BrainConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub actuator: ActuatorConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,
}

// ── Reasoning service ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrainConfig {
    /// Decision endpoint of the reasoning service
    #[serde(default = "default_brain_endpoint")]
    pub endpoint: String,
    /// Model used by the ambient brain (cheap, frequent calls)
    #[serde(default = "default_ambient_model")]
    pub ambient_model: String,
    /// Model used by the interactive brain (on-demand exchanges)
    #[serde(default = "default_interactive_model")]
    pub interactive_model: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_brain_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Sliding-window admission: max calls per window
    #[serde(default = "default_rate_max_calls")]
    pub rate_max_calls: usize,
    /// Sliding-window admission: window length in seconds
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,
}

fn default_brain_endpoint() -> String {
    "http://127.0.0.1:8709/v1/decide".into()
}

fn default_ambient_model() -> String {
    "companion-flash".into()
}

fn default_interactive_model() -> String {
    "companion-pro".into()
}

fn default_brain_timeout_secs() -> u64 {
    30
}

fn default_rate_max_calls() -> usize {
    60
}

fn default_rate_window_secs() -> u64 {
    60
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            endpoint: default_brain_endpoint(),
            ambient_model: default_ambient_model(),
            interactive_model: default_interactive_model(),
            request_timeout_secs: default_brain_timeout_secs(),
            rate_max_calls: default_rate_max_calls(),
            rate_window_secs: default_rate_window_secs(),
        }
    }
}

// ── Scheduling ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Default interval between ambient decisions (seconds)
    #[serde(default = "default_ambient_interval_secs")]
    pub ambient_interval_secs: u64,
    /// Short interval after the agent just acted (seconds)
    #[serde(default = "default_reaction_interval_secs")]
    pub reaction_interval_secs: u64,
    /// Anchor/behavior poll cadence (milliseconds)
    #[serde(default = "default_anchor_poll_ms")]
    pub anchor_poll_ms: u64,
    /// Bounded action-history ring capacity
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Episodic memory retention sweep cadence (seconds)
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Episodic facts older than this are swept (days)
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_ambient_interval_secs() -> u64 {
    45
}

fn default_reaction_interval_secs() -> u64 {
    10
}

fn default_anchor_poll_ms() -> u64 {
    500
}

fn default_history_capacity() -> usize {
    20
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_retention_days() -> u32 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            ambient_interval_secs: default_ambient_interval_secs(),
            reaction_interval_secs: default_reaction_interval_secs(),
            anchor_poll_ms: default_anchor_poll_ms(),
            history_capacity: default_history_capacity(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            retention_days: default_retention_days(),
        }
    }
}

// ── Actuator (embodiment service) ────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorConfig {
    /// Base URL of the embodiment HTTP API
    #[serde(default = "default_actuator_base_url")]
    pub base_url: String,
    /// Per-call timeout (milliseconds)
    #[serde(default = "default_actuator_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Entity-list cache TTL (milliseconds)
    #[serde(default = "default_entity_cache_ttl_ms")]
    pub entity_cache_ttl_ms: u64,
    /// Initial backoff after a transport failure (milliseconds)
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    /// Backoff ceiling (milliseconds)
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_actuator_base_url() -> String {
    "http://127.0.0.1:32456/api/v1".into()
}

fn default_actuator_timeout_ms() -> u64 {
    2500
}

fn default_entity_cache_ttl_ms() -> u64 {
    2000
}

fn default_backoff_initial_ms() -> u64 {
    1500
}

fn default_backoff_max_ms() -> u64 {
    12_000
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            base_url: default_actuator_base_url(),
            request_timeout_ms: default_actuator_timeout_ms(),
            entity_cache_ttl_ms: default_entity_cache_ttl_ms(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

// ── Host monitoring ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Master switch for the monitoring subsystem
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sample cadence for pressure/network checks (seconds)
    #[serde(default = "default_monitor_poll_secs")]
    pub poll_interval_secs: u64,
    /// Sample cadence for process/storage checks (seconds)
    #[serde(default = "default_monitor_slow_poll_secs")]
    pub slow_poll_interval_secs: u64,
    /// Per-sample collection timeout (seconds)
    #[serde(default = "default_sample_timeout_secs")]
    pub sample_timeout_secs: u64,
    /// Same-key alert suppression window (seconds)
    #[serde(default = "default_alert_cooldown_secs")]
    pub alert_cooldown_secs: u64,
    /// How often one alert type may pre-empt the scheduler (seconds)
    #[serde(default = "default_escalation_cooldown_secs")]
    pub escalation_cooldown_secs: u64,

    #[serde(default = "default_memory_warn_pct")]
    pub memory_warn_pct: f64,
    #[serde(default = "default_memory_crit_pct")]
    pub memory_crit_pct: f64,

    #[serde(default = "default_zombie_warn_count")]
    pub zombie_warn_count: usize,
    #[serde(default = "default_zombie_crit_count")]
    pub zombie_crit_count: usize,

    /// Disk alerts fire when *free* space drops below these
    #[serde(default = "default_disk_warn_free_pct")]
    pub disk_warn_free_pct: f64,
    #[serde(default = "default_disk_crit_free_pct")]
    pub disk_crit_free_pct: f64,

    #[serde(default = "default_net_new_conn_warn")]
    pub net_new_conn_warn: usize,

    /// Log file tailed for anomalies; `~` expands to home
    #[serde(default = "default_log_path")]
    pub log_path: String,
}

fn default_true() -> bool {
    true
}

fn default_monitor_poll_secs() -> u64 {
    30
}

fn default_monitor_slow_poll_secs() -> u64 {
    60
}

fn default_sample_timeout_secs() -> u64 {
    5
}

fn default_alert_cooldown_secs() -> u64 {
    300
}

fn default_escalation_cooldown_secs() -> u64 {
    300
}

fn default_memory_warn_pct() -> f64 {
    85.0
}

fn default_memory_crit_pct() -> f64 {
    90.0
}

fn default_zombie_warn_count() -> usize {
    5
}

fn default_zombie_crit_count() -> usize {
    10
}

fn default_disk_warn_free_pct() -> f64 {
    20.0
}

fn default_disk_crit_free_pct() -> f64 {
    5.0
}

fn default_net_new_conn_warn() -> usize {
    10
}

fn default_log_path() -> String {
    "/var/log/syslog".into()
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_monitor_poll_secs(),
            slow_poll_interval_secs: default_monitor_slow_poll_secs(),
            sample_timeout_secs: default_sample_timeout_secs(),
            alert_cooldown_secs: default_alert_cooldown_secs(),
            escalation_cooldown_secs: default_escalation_cooldown_secs(),
            memory_warn_pct: default_memory_warn_pct(),
            memory_crit_pct: default_memory_crit_pct(),
            zombie_warn_count: default_zombie_warn_count(),
            zombie_crit_count: default_zombie_crit_count(),
            disk_warn_free_pct: default_disk_warn_free_pct(),
            disk_crit_free_pct: default_disk_crit_free_pct(),
            net_new_conn_warn: default_net_new_conn_warn(),
            log_path: default_log_path(),
        }
    }
}

// ── Invocation gateway ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// EADDRINUSE: probe successive ports up to this many times
    #[serde(default = "default_bind_attempts")]
    pub bind_attempts: u32,
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_gateway_port() -> u16 {
    8770
}

fn default_bind_attempts() -> u32 {
    10
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            bind_attempts: default_bind_attempts(),
        }
    }
}

// ── Load / validate ──────────────────────────────────────────────

impl Config {
    /// Load `~/.famulus/config.toml`, creating it with defaults on first run.
    pub fn load_or_init() -> Result<Self, ConfigError> {
        let state_dir = Self::state_dir()?;
        fs::create_dir_all(&state_dir)?;
        let config_path = state_dir.join("config.toml");

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            toml::from_str::<Config>(&content)
                .map_err(|e| ConfigError::Load(format!("{}: {e}", config_path.display())))?
        } else {
            let config = Config::default();
            let serialized = toml::to_string_pretty(&config)
                .map_err(|e| ConfigError::Load(e.to_string()))?;
            fs::write(&config_path, serialized)?;
            config
        };

        config.state_dir = state_dir;
        config.config_path = config_path;

        if let Ok(key) = std::env::var("FAMULUS_API_KEY")
            && !key.trim().is_empty()
        {
            config.api_key = Some(key);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit state dir (tests, alternate profiles).
    pub fn from_state_dir(dir: &Path) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.state_dir = dir.to_path_buf();
        config.config_path = dir.join("config.toml");
        config.validate()?;
        Ok(config)
    }

    fn state_dir() -> Result<PathBuf, ConfigError> {
        let dirs = UserDirs::new()
            .ok_or_else(|| ConfigError::Load("cannot resolve home directory".into()))?;
        Ok(dirs.home_dir().join(".famulus"))
    }

    /// Expanded path of the monitored log file.
    pub fn monitor_log_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.monitor.log_path).into_owned())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.ambient_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "scheduler.ambient_interval_secs must be positive".into(),
            ));
        }
        if self.scheduler.reaction_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "scheduler.reaction_interval_secs must be positive".into(),
            ));
        }
        if self.brain.rate_max_calls == 0 || self.brain.rate_window_secs == 0 {
            return Err(ConfigError::Validation(
                "brain.rate_max_calls and brain.rate_window_secs must be positive".into(),
            ));
        }
        if self.actuator.backoff_initial_ms == 0
            || self.actuator.backoff_max_ms < self.actuator.backoff_initial_ms
        {
            return Err(ConfigError::Validation(
                "actuator backoff bounds must satisfy 0 < initial <= max".into(),
            ));
        }
        if self.monitor.memory_warn_pct > self.monitor.memory_crit_pct {
            return Err(ConfigError::Validation(
                "monitor.memory_warn_pct must not exceed memory_crit_pct".into(),
            ));
        }
        if self.monitor.disk_crit_free_pct > self.monitor.disk_warn_free_pct {
            return Err(ConfigError::Validation(
                "monitor.disk_crit_free_pct must not exceed disk_warn_free_pct".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.ambient_interval_secs, 45);
        assert_eq!(config.scheduler.reaction_interval_secs, 10);
        assert_eq!(config.actuator.request_timeout_ms, 2500);
        assert_eq!(config.gateway.port, 8770);
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.brain.rate_max_calls, 60);
        assert_eq!(config.monitor.alert_cooldown_secs, 300);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [scheduler]
            ambient_interval_secs = 90
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.ambient_interval_secs, 90);
        assert_eq!(config.scheduler.reaction_interval_secs, 10);
    }

    #[test]
    fn zero_ambient_interval_rejected() {
        let mut config = Config::default();
        config.scheduler.ambient_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_backoff_bounds_rejected() {
        let mut config = Config::default();
        config.actuator.backoff_initial_ms = 5000;
        config.actuator.backoff_max_ms = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_memory_thresholds_rejected() {
        let mut config = Config::default();
        config.monitor.memory_warn_pct = 95.0;
        config.monitor.memory_crit_pct = 90.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.actuator.base_url, config.actuator.base_url);
        assert_eq!(parsed.monitor.zombie_crit_count, 10);
    }
}
