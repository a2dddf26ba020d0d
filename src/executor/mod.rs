pub mod plugins;

pub use plugins::{ActionPlugin, advertised_specs};

use crate::actuator::ActuatorClient;
use crate::brain::{ActionRunner, ActionSpec, Decision};
use crate::context::ContextSnapshot;
use crate::emotion::EmotionModel;
use crate::events::{AgentEvent, EventSender};
use crate::history::ActionHistory;
use crate::monitor::SystemProbe;
use crate::permissions::{
    ApprovalGate, GateDecision, PermissionLedger, PermissionRequest, PermissionStatus, Scope,
};
use crate::presenter::Presenter;
use crate::store::{ActionLog, EpisodicStore};
use async_trait::async_trait;
use rand::prelude::IndexedRandom;
use serde_json::{Value, json};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;

const COMPANION_AUTHOR: &str = "Companion";

/// Commands the agent may run autonomously.
const PROCESS_ALLOWLIST: &[&str] = &[
    "ls", "cat", "grep", "find", "wc", "head", "tail", "pwd", "stat", "echo", "uptime", "df",
];

const MAX_COMMAND_LEN: usize = 1000;
const MAX_CLIPBOARD_LEN: usize = 10_000;
const PROCESS_TIMEOUT: Duration = Duration::from_secs(10);
const CLIPBOARD_TIMEOUT: Duration = Duration::from_secs(2);

const FALLBACK_FACTS: &[&str] = &[
    "Octopuses have three hearts, and two of them stop when they swim.",
    "The first computer bug was an actual moth taped into a logbook.",
    "Honey found in ancient tombs is still edible after thousands of years.",
    "A day on Venus is longer than a year on Venus.",
];

/// Known actions, dispatched through an explicit table rather than string
/// lookup. Unrecognized names fall through to registered plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownAction {
    SetBehavior,
    ObserveAndWait,
    ShowDialogue,
    ShareFact,
    ReadClipboard,
    RunProcess,
    CaptureScreen,
    CheckSystemStatus,
    SaveMemory,
}

impl KnownAction {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "set_behavior" => Some(Self::SetBehavior),
            "observe_and_wait" => Some(Self::ObserveAndWait),
            "show_dialogue" => Some(Self::ShowDialogue),
            "share_fact" => Some(Self::ShareFact),
            "read_clipboard" => Some(Self::ReadClipboard),
            "run_process" => Some(Self::RunProcess),
            "capture_screen" => Some(Self::CaptureScreen),
            "check_system_status" => Some(Self::CheckSystemStatus),
            "save_memory" => Some(Self::SaveMemory),
            _ => None,
        }
    }

    /// Scope consulted before this action may run; `None` means ungated.
    pub fn required_scope(self) -> Option<Scope> {
        match self {
            Self::RunProcess => Some(Scope::ProcessRun),
            Self::ReadClipboard => Some(Scope::ClipboardRead),
            Self::CaptureScreen => Some(Scope::VisionReadScreen),
            _ => None,
        }
    }

    /// The advertised action set, one entry per request.
    pub fn specs(behaviors: &[String]) -> Vec<ActionSpec> {
        let behavior_desc = if behaviors.is_empty() {
            "Name of the behavior to trigger".to_string()
        } else {
            format!("One of: {}", behaviors.join(", "))
        };

        vec![
            ActionSpec {
                name: "set_behavior".into(),
                description: "Trigger a named behavior on the embodied companion".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "behavior_name": {"type": "string", "description": behavior_desc}
                    },
                    "required": ["behavior_name"]
                }),
            },
            ActionSpec {
                name: "observe_and_wait".into(),
                description: "Do nothing and watch; check back after the given duration".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "duration_seconds": {"type": "integer", "minimum": 1, "maximum": 300}
                    },
                    "required": ["duration_seconds"]
                }),
            },
            ActionSpec {
                name: "show_dialogue".into(),
                description: "Say something short in a speech bubble".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "text": {"type": "string"},
                        "duration_seconds": {"type": "integer"}
                    },
                    "required": ["text"]
                }),
            },
            ActionSpec {
                name: "share_fact".into(),
                description: "Share a light fact or tip with the user".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {"topic": {"type": "string"}}
                }),
            },
            ActionSpec {
                name: "read_clipboard".into(),
                description: "Read the user's clipboard (permission gated)".into(),
                parameters: json!({"type": "object", "properties": {}}),
            },
            ActionSpec {
                name: "run_process".into(),
                description: "Run an allow-listed read-only command (permission gated)".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {"command": {"type": "string"}},
                    "required": ["command"]
                }),
            },
            ActionSpec {
                name: "capture_screen".into(),
                description: "Capture a screenshot for later analysis (permission gated)".into(),
                parameters: json!({"type": "object", "properties": {}}),
            },
            ActionSpec {
                name: "check_system_status".into(),
                description: "Report memory, disk and process health".into(),
                parameters: json!({"type": "object", "properties": {}}),
            },
            ActionSpec {
                name: "save_memory".into(),
                description: "Remember a fact about the user or environment".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "fact": {"type": "string"},
                        "metadata": {"type": "string"}
                    },
                    "required": ["fact"]
                }),
            },
        ]
    }
}

/// Executes decisions and derives the next wake interval.
///
/// Handlers are pure with respect to the executor's internals: they receive
/// arguments plus a context snapshot and return how many seconds to wait
/// before the next ambient decision - long when only observing, short after
/// acting so the effect can be assessed quickly.
pub struct ActionExecutor {
    agent_id: String,
    history: Mutex<ActionHistory>,
    action_log: ActionLog,
    episodic: Arc<EpisodicStore>,
    ledger: Arc<PermissionLedger>,
    gate: Arc<dyn ApprovalGate>,
    actuator: Arc<ActuatorClient>,
    presenter: Arc<dyn Presenter>,
    probe: Arc<dyn SystemProbe>,
    emotions: Arc<Mutex<EmotionModel>>,
    events: EventSender,
    plugins: Vec<Arc<dyn ActionPlugin>>,
    ambient_interval_secs: u64,
    reaction_interval_secs: u64,
}

pub struct ExecutorParts {
    pub agent_id: String,
    pub history_capacity: usize,
    pub action_log: ActionLog,
    pub episodic: Arc<EpisodicStore>,
    pub ledger: Arc<PermissionLedger>,
    pub gate: Arc<dyn ApprovalGate>,
    pub actuator: Arc<ActuatorClient>,
    pub presenter: Arc<dyn Presenter>,
    pub probe: Arc<dyn SystemProbe>,
    pub emotions: Arc<Mutex<EmotionModel>>,
    pub events: EventSender,
    pub plugins: Vec<Arc<dyn ActionPlugin>>,
    pub ambient_interval_secs: u64,
    pub reaction_interval_secs: u64,
}

impl ActionExecutor {
    pub fn new(parts: ExecutorParts) -> Self {
        Self {
            agent_id: parts.agent_id,
            history: Mutex::new(ActionHistory::new(parts.history_capacity)),
            action_log: parts.action_log,
            episodic: parts.episodic,
            ledger: parts.ledger,
            gate: parts.gate,
            actuator: parts.actuator,
            presenter: parts.presenter,
            probe: parts.probe,
            emotions: parts.emotions,
            events: parts.events,
            plugins: parts.plugins,
            ambient_interval_secs: parts.ambient_interval_secs,
            reaction_interval_secs: parts.reaction_interval_secs,
        }
    }

    /// Recent action summaries for the decision request payload.
    pub fn recent_actions(&self) -> Vec<String> {
        self.history.lock().unwrap().summaries()
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().unwrap().len()
    }

    /// Execute one decision; returns seconds until the next ambient wake.
    pub async fn execute(
        &self,
        decision: &Decision,
        context: &ContextSnapshot,
    ) -> anyhow::Result<u64> {
        self.history
            .lock()
            .unwrap()
            .record(&decision.action, decision.arguments.clone());
        if let Err(error) = self
            .action_log
            .record(&decision.action, &decision.arguments)
            .await
        {
            // Fatal only for this write; the loop continues on memory state.
            tracing::warn!(%error, "action log write failed");
        }

        let known = KnownAction::parse(&decision.action);

        if let Some(scope) = known.and_then(KnownAction::required_scope)
            && !self.permission_granted(scope, decision).await?
        {
            return Ok(self.reaction_interval_secs);
        }

        let interval = match known {
            Some(action) => self.dispatch(action, decision, context).await?,
            None => self.try_plugins(decision).await,
        };

        let _ = self.events.send(AgentEvent::ActionExecuted {
            action: decision.action.clone(),
            next_interval_secs: interval,
        });
        Ok(interval)
    }

    /// Ledger check plus the interactive "ask" flow. True means proceed.
    async fn permission_granted(
        &self,
        scope: Scope,
        decision: &Decision,
    ) -> anyhow::Result<bool> {
        let status = match self.ledger.check(&self.agent_id, scope).await {
            Ok(status) => status,
            Err(error) => {
                tracing::warn!(%error, "ledger read failed; treating as ask");
                PermissionStatus::Ask
            }
        };

        match status {
            PermissionStatus::Allow => Ok(true),
            PermissionStatus::Deny => {
                self.presenter
                    .show_denial(&decision.action, &format!("{scope} is denied"))
                    .await;
                Ok(false)
            }
            PermissionStatus::Ask => {
                let request = PermissionRequest {
                    agent_id: self.agent_id.clone(),
                    scope,
                    action: decision.action.clone(),
                    args_summary: summarize_args(&decision.arguments),
                };
                let _ = self.events.send(AgentEvent::PermissionRequested {
                    agent_id: request.agent_id.clone(),
                    scope: scope.as_str().to_string(),
                    action: request.action.clone(),
                });

                match self.gate.request(&request).await? {
                    GateDecision::AllowOnce => Ok(true),
                    GateDecision::Deny { reason } => {
                        self.presenter.show_denial(&decision.action, &reason).await;
                        Ok(false)
                    }
                }
            }
        }
    }

    async fn dispatch(
        &self,
        action: KnownAction,
        decision: &Decision,
        context: &ContextSnapshot,
    ) -> anyhow::Result<u64> {
        let args = &decision.arguments;
        match action {
            KnownAction::SetBehavior => self.handle_set_behavior(args).await,
            KnownAction::ObserveAndWait => self.handle_observe_and_wait(args).await,
            KnownAction::ShowDialogue => self.handle_show_dialogue(args).await,
            KnownAction::ShareFact => self.handle_share_fact(args).await,
            KnownAction::ReadClipboard => self.handle_read_clipboard().await,
            KnownAction::RunProcess => self.handle_run_process(args).await,
            KnownAction::CaptureScreen => self.handle_capture_screen().await,
            KnownAction::CheckSystemStatus => self.handle_check_system_status().await,
            KnownAction::SaveMemory => self.handle_save_memory(args, context).await,
        }
    }

    async fn try_plugins(&self, decision: &Decision) -> u64 {
        for plugin in &self.plugins {
            let provides = plugin
                .provides()
                .iter()
                .any(|spec| spec.name == decision.action);
            if !provides {
                continue;
            }
            match plugin.execute(&decision.action, &decision.arguments).await {
                Ok(()) => return self.reaction_interval_secs,
                Err(error) => {
                    tracing::warn!(
                        plugin = plugin.name(),
                        action = decision.action.as_str(),
                        %error,
                        "plugin execution failed"
                    );
                }
            }
        }

        tracing::warn!(action = decision.action.as_str(), "unknown action; observing");
        self.flush_dialogue().await;
        self.ambient_interval_secs
    }

    // ── Handlers ────────────────────────────────────────────────────────

    async fn handle_set_behavior(&self, args: &Value) -> anyhow::Result<u64> {
        let behavior = args
            .get("behavior_name")
            .and_then(Value::as_str)
            .unwrap_or("Idle");

        match self.actuator.invoke(behavior).await {
            Ok(entity_id) => {
                self.emotions.lock().unwrap().on_behavior(behavior);
                let _ = self.events.send(AgentEvent::BehaviorChanged {
                    behavior: behavior.to_string(),
                    entity_id,
                });
                Ok(self.ambient_interval_secs)
            }
            Err(error) => {
                tracing::warn!(behavior, %error, "behavior trigger failed");
                Ok(self.reaction_interval_secs)
            }
        }
    }

    async fn handle_observe_and_wait(&self, args: &Value) -> anyhow::Result<u64> {
        let wait = args
            .get("duration_seconds")
            .and_then(Value::as_u64)
            .unwrap_or(self.ambient_interval_secs)
            .clamp(1, 300);
        tracing::debug!(wait, "observing");
        self.emotions.lock().unwrap().on_observe_only(wait);
        self.flush_dialogue().await;
        Ok(wait)
    }

    async fn handle_show_dialogue(&self, args: &Value) -> anyhow::Result<u64> {
        let text = args.get("text").and_then(Value::as_str).unwrap_or("...");
        let duration = args
            .get("duration_seconds")
            .and_then(Value::as_u64)
            .unwrap_or(6);
        self.presenter
            .show_bubble(COMPANION_AUTHOR, text, duration)
            .await;
        self.emotions.lock().unwrap().on_dialogue();
        Ok(self.reaction_interval_secs)
    }

    async fn handle_share_fact(&self, args: &Value) -> anyhow::Result<u64> {
        let topic = args.get("topic").and_then(Value::as_str);
        let fact = *FALLBACK_FACTS
            .choose(&mut rand::rng())
            .expect("fact list is non-empty");
        let line = match topic {
            Some(topic) => format!("About {topic}? Here's one: {fact}"),
            None => fact.to_string(),
        };
        self.presenter.show_bubble(COMPANION_AUTHOR, &line, 8).await;
        Ok(self.reaction_interval_secs)
    }

    async fn handle_read_clipboard(&self) -> anyhow::Result<u64> {
        match read_clipboard().await {
            Some(content) if !content.is_empty() => {
                let mut shown = content;
                if shown.len() > 500 {
                    let mut end = 500;
                    while !shown.is_char_boundary(end) {
                        end -= 1;
                    }
                    shown.truncate(end);
                }
                self.presenter
                    .show_message(COMPANION_AUTHOR, &format!("You copied: {shown}"))
                    .await;
            }
            _ => {
                self.presenter
                    .show_bubble(COMPANION_AUTHOR, "Clipboard is empty!", 3)
                    .await;
            }
        }
        Ok(self.reaction_interval_secs)
    }

    async fn handle_run_process(&self, args: &Value) -> anyhow::Result<u64> {
        let command = args.get("command").and_then(Value::as_str).unwrap_or("");
        let output = run_allowlisted_command(command).await;
        self.presenter
            .show_message(
                COMPANION_AUTHOR,
                &format!("Command: `{command}`\n\n{output}"),
            )
            .await;
        Ok(self.reaction_interval_secs)
    }

    async fn handle_capture_screen(&self) -> anyhow::Result<u64> {
        let path = std::env::temp_dir().join("famulus_screen.png");
        let captured = capture_screen(&path).await;
        if captured {
            tracing::info!(path = %path.display(), "screenshot captured");
            self.presenter
                .show_bubble(COMPANION_AUTHOR, "Screenshot saved!", 5)
                .await;
        } else {
            self.presenter
                .show_bubble(COMPANION_AUTHOR, "Couldn't take a screenshot!", 3)
                .await;
        }
        Ok(self.reaction_interval_secs)
    }

    async fn handle_check_system_status(&self) -> anyhow::Result<u64> {
        let mut parts = Vec::new();
        if let Ok(memory) = self.probe.memory().await {
            parts.push(format!(
                "Memory: {:.1}% used ({:.1}GB free)",
                memory.usage_pct, memory.available_gb
            ));
        }
        if let Ok(disks) = self.probe.disks().await
            && let Some(root) = disks.first()
        {
            parts.push(format!(
                "Disk {}: {:.1}% free ({:.1}GB)",
                root.device, root.free_pct, root.free_gb
            ));
        }
        if let Ok(zombies) = self.probe.zombie_processes().await {
            parts.push(format!("Zombie processes: {}", zombies.len()));
        }

        let status = if parts.is_empty() {
            "System status unavailable".to_string()
        } else {
            parts.join("\n")
        };
        self.presenter
            .show_message(COMPANION_AUTHOR, &format!("System status:\n{status}"))
            .await;
        Ok(self.reaction_interval_secs)
    }

    async fn handle_save_memory(
        &self,
        args: &Value,
        context: &ContextSnapshot,
    ) -> anyhow::Result<u64> {
        let Some(fact) = args.get("fact").and_then(Value::as_str) else {
            tracing::debug!("save_memory without fact; ignoring");
            return Ok(self.reaction_interval_secs);
        };

        let mut metadata = match args.get("metadata").and_then(Value::as_str) {
            Some(raw) => serde_json::from_str::<Value>(raw)
                .unwrap_or_else(|_| json!({ "note": raw })),
            None => json!({}),
        };
        if let Value::Object(ref mut map) = metadata {
            map.entry("context".to_string())
                .or_insert_with(|| context.as_json());
        }

        if let Err(error) = self.episodic.add(fact, Some(&metadata)).await {
            tracing::warn!(%error, "episodic write failed");
        }
        self.flush_dialogue().await;
        Ok(self.reaction_interval_secs)
    }

    /// Render dialogue the actuator queued for the presentation layer.
    async fn flush_dialogue(&self) {
        for line in self.actuator.drain_dialogue().await {
            self.presenter
                .show_bubble(&line.author, &line.text, line.duration_secs)
                .await;
        }
    }
}

#[async_trait]
impl ActionRunner for ActionExecutor {
    async fn run(&self, decision: &Decision, context: &ContextSnapshot) -> anyhow::Result<u64> {
        self.execute(decision, context).await
    }
}

// ─── Free helpers ───────────────────────────────────────────────────────────

fn summarize_args(args: &Value) -> String {
    let raw = args.to_string();
    if raw.len() > 200 {
        let mut end = 200;
        while !raw.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &raw[..end])
    } else {
        raw
    }
}

/// Run a read-only allow-listed command with a hard timeout.
async fn run_allowlisted_command(command: &str) -> String {
    if command.is_empty() {
        return "No command given".to_string();
    }
    if command.len() > MAX_COMMAND_LEN {
        return format!("Command too long (max {MAX_COMMAND_LEN} chars)");
    }

    let tokens: Vec<&str> = command.split_whitespace().collect();
    let Some(program) = tokens.first() else {
        return "No command given".to_string();
    };
    if !PROCESS_ALLOWLIST.contains(program) {
        tracing::warn!(program, "command blocked: not in allow-list");
        return format!("Command '{program}' is not permitted");
    }

    let child = tokio::process::Command::new(program)
        .args(&tokens[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(error) => return format!("Failed to start: {error}"),
    };

    match tokio::time::timeout(PROCESS_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let text = if stdout.trim().is_empty() {
                String::from_utf8_lossy(&output.stderr).into_owned()
            } else {
                stdout.into_owned()
            };
            let mut text = text;
            if text.len() > 1000 {
                let mut end = 1000;
                while !text.is_char_boundary(end) {
                    end -= 1;
                }
                text.truncate(end);
            }
            format!("Output:\n```\n{text}\n```")
        }
        Ok(Err(error)) => format!("Failed: {error}"),
        Err(_) => "Command timed out".to_string(),
    }
}

/// Try the Wayland clipboard tool, then the X11 one.
async fn read_clipboard() -> Option<String> {
    for invocation in [&["wl-paste"][..], &["xclip", "-selection", "clipboard", "-o"][..]] {
        let child = tokio::process::Command::new(invocation[0])
            .args(&invocation[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let Ok(mut child) = child else { continue };

        let Some(mut stdout) = child.stdout.take() else {
            continue;
        };
        let read = async {
            let mut buffer = Vec::new();
            stdout.read_to_end(&mut buffer).await.ok()?;
            child.wait().await.ok()?;
            Some(buffer)
        };
        if let Ok(Some(buffer)) = tokio::time::timeout(CLIPBOARD_TIMEOUT, read).await {
            let mut content = String::from_utf8_lossy(&buffer).into_owned();
            if content.len() > MAX_CLIPBOARD_LEN {
                let mut end = MAX_CLIPBOARD_LEN;
                while !content.is_char_boundary(end) {
                    end -= 1;
                }
                content.truncate(end);
                content.push_str("... [truncated]");
            }
            return Some(content);
        }
    }
    None
}

async fn capture_screen(path: &std::path::Path) -> bool {
    for invocation in [
        vec!["grim", path.to_str().unwrap_or_default()],
        vec!["gnome-screenshot", "-f", path.to_str().unwrap_or_default()],
    ] {
        let status = tokio::process::Command::new(invocation[0])
            .args(&invocation[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        if let Ok(Ok(status)) = tokio::time::timeout(Duration::from_secs(5), status).await
            && status.success()
        {
            return true;
        }
    }
    false
}

// ─── Tests ──────────────────────────────────────────────────────────────────
