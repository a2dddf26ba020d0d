use std::collections::BTreeMap;

const DECAY_RATE: f64 = 0.02;

/// Scalar emotional state nudging ambient decisions.
///
/// Values are clamped to [0, 1]. The snapshot is attached to every decision
/// request so the reasoning service can bias action selection (high boredom
/// favors playful actions, low energy favors restful ones).
#[derive(Debug, Clone)]
pub struct EmotionModel {
    boredom: f64,
    happiness: f64,
    energy: f64,
}

impl EmotionModel {
    pub fn new() -> Self {
        Self {
            boredom: 0.2,
            happiness: 0.6,
            energy: 0.8,
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("boredom".to_string(), round3(clamp(self.boredom))),
            ("happiness".to_string(), round3(clamp(self.happiness))),
            ("energy".to_string(), round3(clamp(self.energy))),
        ])
    }

    /// The agent chose to observe and wait.
    pub fn on_observe_only(&mut self, duration_secs: u64) {
        let duration = duration_secs as f64;
        self.adjust_boredom(0.05 + (duration / 300.0).min(0.1));
        self.adjust_energy(-0.02);
    }

    pub fn on_behavior(&mut self, behavior: &str) {
        let lowered = behavior.to_lowercase();
        if lowered.contains("sleep") {
            self.adjust_energy(0.2);
            self.adjust_boredom(-0.1);
        } else if ["dance", "jump", "run", "climb"]
            .iter()
            .any(|k| lowered.contains(k))
        {
            self.adjust_energy(-0.05);
            self.adjust_boredom(-0.08);
            self.adjust_happiness(0.05);
        } else if lowered.contains("sit") || lowered.contains("idle") {
            self.adjust_boredom(0.02);
        } else {
            self.adjust_boredom(-0.01);
        }
    }

    pub fn on_dialogue(&mut self) {
        self.adjust_happiness(0.04);
        self.adjust_boredom(-0.04);
    }

    /// Small decay toward baseline, applied once per ambient cycle.
    pub fn natural_decay(&mut self) {
        self.adjust_boredom(-DECAY_RATE);
        self.adjust_happiness(-DECAY_RATE / 2.0);
        self.adjust_energy(-DECAY_RATE / 3.0);
    }

    fn adjust_boredom(&mut self, delta: f64) {
        self.boredom = clamp(self.boredom + delta);
    }

    fn adjust_happiness(&mut self, delta: f64) {
        self.happiness = clamp(self.happiness + delta);
    }

    fn adjust_energy(&mut self, delta: f64) {
        self.energy = clamp(self.energy + delta);
    }
}

fn clamp(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_has_three_scalars_in_range() {
        let emotions = EmotionModel::new();
        let snapshot = emotions.snapshot();
        assert_eq!(snapshot.len(), 3);
        for value in snapshot.values() {
            assert!((0.0..=1.0).contains(value));
        }
    }

    #[test]
    fn observe_only_raises_boredom() {
        let mut emotions = EmotionModel::new();
        let before = emotions.snapshot()["boredom"];
        emotions.on_observe_only(60);
        assert!(emotions.snapshot()["boredom"] > before);
    }

    #[test]
    fn sleep_behavior_restores_energy() {
        let mut emotions = EmotionModel::new();
        emotions.on_behavior("Run");
        let tired = emotions.snapshot()["energy"];
        emotions.on_behavior("SleepOnFloor");
        assert!(emotions.snapshot()["energy"] > tired);
    }

    #[test]
    fn values_stay_clamped_under_repeated_updates() {
        let mut emotions = EmotionModel::new();
        for _ in 0..200 {
            emotions.on_observe_only(300);
        }
        assert!(emotions.snapshot()["boredom"] <= 1.0);
        for _ in 0..200 {
            emotions.natural_decay();
        }
        assert!(emotions.snapshot()["boredom"] >= 0.0);
    }

    #[test]
    fn dialogue_raises_happiness() {
        let mut emotions = EmotionModel::new();
        let before = emotions.snapshot()["happiness"];
        emotions.on_dialogue();
        assert!(emotions.snapshot()["happiness"] > before);
    }
}
