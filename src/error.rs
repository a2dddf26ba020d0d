use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for `Famulus`.
///
/// Each subsystem defines its own error variant. Library callers can match on
/// these to decide recovery strategy; internal code continues to use
/// `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum FamulusError {
    // ── Config ───────────────────────────────────────────────────────────
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    // ── Reasoning service / brain ───────────────────────────────────────
    #[error("brain: {0}")]
    Brain(#[from] BrainError),

    // ── Actuator ────────────────────────────────────────────────────────
    #[error("actuator: {0}")]
    Actuator(#[from] ActuatorError),

    // ── Permissions ─────────────────────────────────────────────────────
    #[error("permission: {0}")]
    Permission(#[from] PermissionError),

    // ── Monitoring ──────────────────────────────────────────────────────
    #[error("monitor: {0}")]
    Monitor(#[from] MonitorError),

    // ── Persistent state ────────────────────────────────────────────────
    #[error("store: {0}")]
    Store(#[from] StoreError),

    // ── Gateway / invocation boundary ───────────────────────────────────
    #[error("gateway: {0}")]
    Gateway(#[from] GatewayError),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Reasoning-service errors ───────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum BrainError {
    #[error("reasoning service request failed: {0}")]
    Request(String),

    #[error("reasoning service timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("reasoning service returned malformed payload: {0}")]
    Malformed(String),
}

// ─── Actuator errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("actuator request failed: {0}")]
    Transport(String),

    #[error("actuator backoff active for {remaining_ms}ms")]
    BackoffActive { remaining_ms: u64 },

    #[error("entity {0} is stale and re-discovery found no replacement")]
    StaleEntity(i64),

    #[error("no active entities")]
    NoEntities,

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
}

// ─── Permission errors ──────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PermissionError {
    #[error("scope {scope} denied for {agent_id}")]
    Denied { agent_id: String, scope: String },

    #[error("unknown permission scope: {0}")]
    UnknownScope(String),

    #[error("unknown permission status: {0}")]
    UnknownStatus(String),

    #[error("ledger: {0}")]
    Ledger(String),
}

// ─── Monitor errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("sample collection failed: {0}")]
    Sample(String),

    #[error("sample collection timed out")]
    SampleTimeout,
}

// ─── Persistent-state errors ────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("open failed: {0}")]
    Open(String),

    #[error("query failed: {0}")]
    Query(String),
}

// ─── Gateway errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("bind failed after {1} attempts: {0}")]
    Bind(String, u32),

    #[error("invalid request: {0}")]
    BadRequest(String),
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, FamulusError>;
