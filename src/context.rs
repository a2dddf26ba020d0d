use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Longest value accepted for any single context field.
const MAX_FIELD_LEN: usize = 512;

/// Window-title fragments that suggest credential material; matched
/// case-insensitively and redacted wholesale.
const SENSITIVE_TITLE_MARKERS: &[&str] = &["password", "passphrase", "secret", "private key"];

/// One observation of the desktop environment.
///
/// Produced by an external sensor collaborator, sanitized before it reaches
/// the decision loop, and replaced wholesale on each observation; never
/// mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextSnapshot {
    pub title: String,
    pub application: String,
    pub pid: i64,
    pub source: String,
    /// Structured extras (alert details, detected errors); absent by default.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub extras: Value,
}

impl ContextSnapshot {
    pub fn unknown() -> Self {
        Self {
            title: "Unknown".to_string(),
            application: "Unknown".to_string(),
            pid: -1,
            source: "initial".to_string(),
            extras: Value::Null,
        }
    }

    /// Copy with an extra structured field attached under `key`.
    pub fn with_extra(&self, key: &str, value: Value) -> Self {
        let mut snapshot = self.clone();
        match snapshot.extras {
            Value::Object(ref mut map) => {
                map.insert(key.to_string(), value);
            }
            _ => {
                let mut map = serde_json::Map::new();
                map.insert(key.to_string(), value);
                snapshot.extras = Value::Object(map);
            }
        }
        snapshot
    }

    pub fn as_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Source of raw context observations (sensor collaborator seam).
pub trait ContextSource: Send + Sync {
    fn current(&self) -> ContextSnapshot;
}

/// Strip control characters, cap field lengths, and redact titles that look
/// like they carry credential material.
pub fn sanitize(raw: ContextSnapshot) -> ContextSnapshot {
    ContextSnapshot {
        title: sanitize_title(&raw.title),
        application: sanitize_field(&raw.application),
        pid: raw.pid,
        source: sanitize_field(&raw.source),
        extras: raw.extras,
    }
}

fn sanitize_field(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    if cleaned.len() > MAX_FIELD_LEN {
        let mut end = MAX_FIELD_LEN;
        while !cleaned.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &cleaned[..end])
    } else {
        cleaned
    }
}

fn sanitize_title(title: &str) -> String {
    let lowered = title.to_lowercase();
    if SENSITIVE_TITLE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        return "[redacted]".to_string();
    }
    sanitize_field(title)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(title: &str) -> ContextSnapshot {
        ContextSnapshot {
            title: title.to_string(),
            application: "terminal".to_string(),
            pid: 4242,
            source: "sensor".to_string(),
            extras: Value::Null,
        }
    }

    #[test]
    fn sanitize_strips_control_chars() {
        let snapshot = sanitize(raw("hello\u{0007}world"));
        assert_eq!(snapshot.title, "helloworld");
    }

    #[test]
    fn sanitize_redacts_credential_titles() {
        let snapshot = sanitize(raw("KeePass - master Password entry"));
        assert_eq!(snapshot.title, "[redacted]");
    }

    #[test]
    fn sanitize_caps_long_fields() {
        let long = "x".repeat(2000);
        let snapshot = sanitize(raw(&long));
        assert!(snapshot.title.chars().count() <= MAX_FIELD_LEN + 1);
        assert!(snapshot.title.ends_with('…'));
    }

    #[test]
    fn with_extra_attaches_structured_detail() {
        let snapshot = ContextSnapshot::unknown()
            .with_extra("system_alert", serde_json::json!({"type": "memory"}));
        assert_eq!(snapshot.extras["system_alert"]["type"], "memory");
        // Original left untouched - snapshots are replaced, not mutated.
        assert!(ContextSnapshot::unknown().extras.is_null());
    }

    #[test]
    fn unknown_snapshot_shape() {
        let snapshot = ContextSnapshot::unknown();
        assert_eq!(snapshot.application, "Unknown");
        assert_eq!(snapshot.pid, -1);
    }
}
