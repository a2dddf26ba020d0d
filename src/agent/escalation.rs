use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-alert-type cooldown bounding how often a critical alert may pre-empt
/// the scheduler. Independent of the monitors' own alert rate limiting.
pub struct EscalationGate {
    cooldown: Duration,
    last_escalated: Mutex<HashMap<String, Instant>>,
}

impl EscalationGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_escalated: Mutex::new(HashMap::new()),
        }
    }

    /// True when this alert type may escalate now; claims the slot if so.
    pub fn allow(&self, alert_type: &str) -> bool {
        let mut cache = self.last_escalated.lock().unwrap();
        let now = Instant::now();
        if let Some(last) = cache.get(alert_type)
            && now.duration_since(*last) < self.cooldown
        {
            return false;
        }
        cache.insert(alert_type.to_string(), now);
        true
    }
}
