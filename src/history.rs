use chrono::Utc;
use serde_json::Value;
use std::collections::VecDeque;

/// One executed action, kept as conversational grounding for future decisions.
#[derive(Debug, Clone)]
pub struct ActionHistoryEntry {
    pub timestamp: String,
    pub action: String,
    pub arguments: Value,
}

impl ActionHistoryEntry {
    pub fn summary(&self) -> String {
        format!("{}:{}", self.timestamp, self.action)
    }
}

/// Bounded ring of recent actions; oldest evicted first.
#[derive(Debug)]
pub struct ActionHistory {
    entries: VecDeque<ActionHistoryEntry>,
    capacity: usize,
}

impl ActionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, action: &str, arguments: Value) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(ActionHistoryEntry {
            timestamp: Utc::now().to_rfc3339(),
            action: action.to_string(),
            arguments,
        });
    }

    /// Summaries oldest-first, for the decision request payload.
    pub fn summaries(&self) -> Vec<String> {
        self.entries.iter().map(ActionHistoryEntry::summary).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
