//! End-to-end flows through the mode controller: ambient decide/execute
//! cycles and critical-alert escalation.

use async_trait::async_trait;
use famulus::agent::{AgentParts, ModeController};
use famulus::brain::{ActionSpec, Decision, DecisionRequest, ProviderReply, ReasoningProvider, Turn};
use famulus::config::Config;
use famulus::context::ContextSnapshot;
use famulus::error::{BrainError, MonitorError};
use famulus::events::AgentEvent;
use famulus::monitor::{
    Alert, AlertSeverity, ConnectionSample, DiskSample, MemorySample, ProcessInfo, SystemProbe,
};
use famulus::permissions::AllowOnceGate;
use famulus::presenter::Presenter;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

struct ObserveProvider {
    decide_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ReasoningProvider for ObserveProvider {
    async fn decide(
        &self,
        _model: &str,
        _request: &DecisionRequest,
        _actions: &[ActionSpec],
    ) -> Result<ProviderReply, BrainError> {
        self.decide_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ProviderReply {
            decision: Some(Decision {
                action: "observe_and_wait".to_string(),
                arguments: json!({"duration_seconds": 45}),
            }),
            text: None,
        })
    }

    async fn converse(
        &self,
        _model: &str,
        _turns: &[Turn],
        _actions: &[ActionSpec],
    ) -> Result<ProviderReply, BrainError> {
        Ok(ProviderReply {
            decision: None,
            text: Some("done".to_string()),
        })
    }
}

struct QuietProbe;

#[async_trait]
impl SystemProbe for QuietProbe {
    async fn memory(&self) -> Result<MemorySample, MonitorError> {
        Ok(MemorySample {
            usage_pct: 10.0,
            used_gb: 1.6,
            available_gb: 14.4,
            total_gb: 16.0,
            swap_used_pct: 0.0,
        })
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

    async fn tail_log(&self, _path: &Path, _max_lines: usize) -> Result<Vec<String>, MonitorError> {
        Ok(Vec::new())
    }
}

struct SilentPresenter;

#[async_trait]
impl Presenter for SilentPresenter {
    async fn show_message(&self, _author: &str, _text: &str) {}
    async fn show_bubble(&self, _author: &str, _text: &str, _duration_secs: u64) {}
    async fn show_denial(&self, _action: &str, _reason: &str) {}
}

async fn controller_fixture(
    escalation_cooldown_secs: u64,
) -> (TempDir, Arc<AtomicUsize>, Arc<ModeController>) {
    let temp = TempDir::new().unwrap();
    let mut config = Config::from_state_dir(temp.path()).unwrap();
    // Monitors are driven by hand in these tests.
    config.monitor.enabled = false;
    config.monitor.escalation_cooldown_secs = escalation_cooldown_secs;
    // Keep the actuator pointed at a dead port with fast backoff.
    config.actuator.base_url = "http://127.0.0.1:9".to_string();
    config.actuator.request_timeout_ms = 50;
    config.actuator.backoff_initial_ms = 10;
    config.actuator.backoff_max_ms = 50;
    // Long ambient timer so only explicit wakes drive the loop.
    config.scheduler.ambient_interval_secs = 300;

    let decide_calls = Arc::new(AtomicUsize::new(0));
    let controller = ModeController::from_parts(AgentParts {
        config,
        provider: Arc::new(ObserveProvider {
            decide_calls: Arc::clone(&decide_calls),
        }),
        probe: Arc::new(QuietProbe),
        presenter: Arc::new(SilentPresenter),
        gate: Arc::new(AllowOnceGate),
        plugins: Vec::new(),
    })
    .await
    .unwrap();

    (temp, decide_calls, controller)
}

async fn wait_for_calls(calls: &AtomicUsize, expected: usize) {
    for _ in 0..200 {
        if calls.load(Ordering::SeqCst) >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "expected {expected} decide calls, saw {}",
        calls.load(Ordering::SeqCst)
    );
}

fn critical_alert(alert_type: &str) -> Alert {
    Alert::new(
        AlertSeverity::Critical,
        alert_type,
        format!("{alert_type} critical"),
        json!({"usage_pct": 93.0}),
    )
}

#[tokio::test]
async fn context_change_drives_one_decide_execute_cycle() {
    let (_temp, decide_calls, controller) = controller_fixture(300).await;
    let mut rx = controller.events().subscribe();
    controller.start().await;

    controller.update_context(ContextSnapshot {
        title: "zsh".to_string(),
        application: "terminal".to_string(),
        pid: 4242,
        source: "sensor".to_string(),
        extras: serde_json::Value::Null,
    });

    wait_for_calls(&decide_calls, 1).await;

    // The executed observe decision reports 45 s as the next interval.
    let executed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let AgentEvent::ActionExecuted {
                action,
                next_interval_secs,
            } = rx.recv().await.unwrap()
            {
                return (action, next_interval_secs);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(executed.0, "observe_and_wait");
    assert_eq!(executed.1, 45);

    // Exactly one history entry was recorded.
    let health = controller.health().await;
    assert_eq!(health.actions_recorded, 1);
    assert_eq!(health.mode, "ambient");

    controller.shutdown().await;
}

#[tokio::test]
async fn critical_alerts_escalate_once_per_cooldown() {
    let (_temp, decide_calls, controller) = controller_fixture(1).await;
    controller.start().await;

    let events = controller.events();

    // Two critical alerts of the same type inside the cooldown window:
    // exactly one escalation decision.
    events
        .send(AgentEvent::SystemAlert(critical_alert("memory")))
        .unwrap();
    events
        .send(AgentEvent::SystemAlert(critical_alert("memory")))
        .unwrap();

    wait_for_calls(&decide_calls, 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(decide_calls.load(Ordering::SeqCst), 1);

    // After the cooldown expires a third alert escalates again.
    tokio::time::sleep(Duration::from_millis(900)).await;
    events
        .send(AgentEvent::SystemAlert(critical_alert("memory")))
        .unwrap();
    wait_for_calls(&decide_calls, 2).await;

    controller.shutdown().await;
}

#[tokio::test]
async fn warning_alerts_do_not_escalate() {
    let (_temp, decide_calls, controller) = controller_fixture(1).await;
    controller.start().await;

    controller
        .events()
        .send(AgentEvent::SystemAlert(Alert::new(
            AlertSeverity::Warning,
            "disk",
            "disk low".to_string(),
            serde_json::Value::Null,
        )))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(decide_calls.load(Ordering::SeqCst), 0);

    controller.shutdown().await;
}

#[tokio::test]
async fn interactive_exchange_switches_modes_and_answers() {
    let (_temp, _decide_calls, controller) = controller_fixture(300).await;
    controller.start().await;

    let response = controller.handle_prompt("how are you?").await.unwrap();
    assert_eq!(response, "done");
    assert_eq!(controller.health().await.mode, "ambient");

    controller.shutdown().await;
}
