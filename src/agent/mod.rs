mod escalation;

pub use escalation::EscalationGate;

use crate::actuator::ActuatorClient;
use crate::brain::{
    AmbientBrain, Decision, HttpReasoningService, InteractiveBrain, RateGovernor,
    ReasoningProvider,
};
use crate::config::Config;
use crate::context::{self, ContextSnapshot};
use crate::emotion::EmotionModel;
use crate::error::BrainError;
use crate::events::{self, AgentEvent, EventSender};
use crate::executor::{ActionExecutor, ActionPlugin, ExecutorParts, KnownAction, advertised_specs};
use crate::monitor::{Alert, AlertSeverity, MonitorManager, ProcProbe, SystemProbe};
use crate::permissions::{AllowOnceGate, ApprovalGate, PermissionLedger};
use crate::presenter::{LogPresenter, Presenter};
use crate::store::{ActionLog, EpisodicStore, open_state_pool};
use arc_swap::ArcSwap;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_BUS_CAPACITY: usize = 64;
const WORKING_MEMORY_CAPACITY: usize = 20;
const MEMORY_RECALL_LIMIT: usize = 5;

/// Operating modes. Only one is ever live, guarded by the mode gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    Ambient,
    Interactive,
}

impl AgentMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentMode::Ambient => "ambient",
            AgentMode::Interactive => "interactive",
        }
    }
}

/// Health snapshot served over the gateway.
#[derive(Debug, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub mode: &'static str,
    pub actuator_reachable: bool,
    pub uptime_seconds: u64,
    pub actions_recorded: usize,
}

/// Everything the controller needs that callers may want to substitute.
pub struct AgentParts {
    pub config: Config,
    pub provider: Arc<dyn ReasoningProvider>,
    pub probe: Arc<dyn SystemProbe>,
    pub presenter: Arc<dyn Presenter>,
    pub gate: Arc<dyn ApprovalGate>,
    pub plugins: Vec<Arc<dyn ActionPlugin>>,
}

/// Top-level state machine alternating between the ambient "ownership" mode
/// and the on-demand interactive mode.
///
/// The ambient loop wakes on a timer (duration = the interval returned by
/// the previous execute) or on a context-changed signal, whichever comes
/// first. Critical alerts pre-empt the timer through their own cooldown.
/// All decide+execute cycles - ambient, interactive, escalation - serialize
/// on one mode gate, so only one execution is ever in flight.
pub struct ModeController {
    config: Config,
    mode_gate: tokio::sync::Mutex<()>,
    interactive_active: AtomicBool,
    context: ArcSwap<ContextSnapshot>,
    context_changed: Notify,
    observations: Mutex<VecDeque<String>>,
    ambient_brain: AmbientBrain,
    interactive_brain: tokio::sync::Mutex<InteractiveBrain>,
    executor: Arc<ActionExecutor>,
    actuator: Arc<ActuatorClient>,
    presenter: Arc<dyn Presenter>,
    episodic: Arc<EpisodicStore>,
    emotions: Arc<Mutex<EmotionModel>>,
    events: EventSender,
    escalation: EscalationGate,
    monitors: tokio::sync::Mutex<MonitorManager>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    started_at: Instant,
}

impl ModeController {
    /// Assemble a controller with the production provider/probe/presenter.
    pub async fn build(config: Config) -> anyhow::Result<Arc<Self>> {
        let provider: Arc<dyn ReasoningProvider> = Arc::new(HttpReasoningService::new(
            &config.brain.endpoint,
            config.api_key.as_deref(),
            config.brain.request_timeout_secs,
        )?);
        Self::from_parts(AgentParts {
            config,
            provider,
            probe: Arc::new(ProcProbe),
            presenter: Arc::new(LogPresenter),
            gate: Arc::new(AllowOnceGate),
            plugins: Vec::new(),
        })
        .await
    }

    pub async fn from_parts(parts: AgentParts) -> anyhow::Result<Arc<Self>> {
        let config = parts.config;
        let pool = open_state_pool(&config.state_dir).await?;

        let governor = Arc::new(RateGovernor::new(
            config.brain.rate_max_calls,
            config.brain.rate_window_secs,
        ));
        let actuator = Arc::new(ActuatorClient::new(&config.actuator)?);
        let ledger = Arc::new(PermissionLedger::new(pool.clone()).await?);
        let episodic = Arc::new(EpisodicStore::new(pool.clone()).await?);
        let emotions = Arc::new(Mutex::new(EmotionModel::new()));
        let (events, _keepalive) = events::event_bus(EVENT_BUS_CAPACITY);

        let behaviors: Vec<String> = Vec::new();
        let specs = advertised_specs(KnownAction::specs(&behaviors), &parts.plugins);

        let executor = Arc::new(ActionExecutor::new(ExecutorParts {
            agent_id: "ambient".to_string(),
            history_capacity: config.scheduler.history_capacity,
            action_log: ActionLog::new(pool.clone()).await?,
            episodic: Arc::clone(&episodic),
            ledger,
            gate: parts.gate,
            actuator: Arc::clone(&actuator),
            presenter: Arc::clone(&parts.presenter),
            probe: Arc::clone(&parts.probe),
            emotions: Arc::clone(&emotions),
            events: events.clone(),
            plugins: parts.plugins,
            ambient_interval_secs: config.scheduler.ambient_interval_secs,
            reaction_interval_secs: config.scheduler.reaction_interval_secs,
        }));

        let ambient_brain = AmbientBrain::new(
            Arc::clone(&parts.provider),
            Arc::clone(&governor),
            specs.clone(),
            &config.brain.ambient_model,
            config.scheduler.ambient_interval_secs,
        );
        let interactive_brain = InteractiveBrain::new(
            parts.provider,
            governor,
            specs,
            &config.brain.interactive_model,
        );

        let monitors = MonitorManager::new(
            config.monitor.clone(),
            config.monitor_log_path(),
            parts.probe,
            events.clone(),
        );

        let escalation = EscalationGate::new(Duration::from_secs(
            config.monitor.escalation_cooldown_secs,
        ));

        Ok(Arc::new(Self {
            config,
            mode_gate: tokio::sync::Mutex::new(()),
            interactive_active: AtomicBool::new(false),
            context: ArcSwap::from_pointee(ContextSnapshot::unknown()),
            context_changed: Notify::new(),
            observations: Mutex::new(VecDeque::new()),
            ambient_brain,
            interactive_brain: tokio::sync::Mutex::new(interactive_brain),
            executor,
            actuator,
            presenter: parts.presenter,
            episodic,
            emotions,
            events,
            escalation,
            monitors: tokio::sync::Mutex::new(monitors),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            started_at: Instant::now(),
        }))
    }

    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Spawn the periodic tasks and start monitoring.
    pub async fn start(self: &Arc<Self>) {
        self.monitors.lock().await.start();

        // Subscribe before spawning so no alert published right after
        // start() can slip past the listener.
        let alert_rx = self.events.subscribe();

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(Arc::clone(self).ambient_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).alert_listener(alert_rx)));
        tasks.push(tokio::spawn(Arc::clone(self).anchor_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).cleanup_loop()));

        tracing::info!("agent started in ambient mode");
    }

    /// Cancel and await every periodic task, then stop the monitors.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.monitors.lock().await.stop().await;
        tracing::info!("agent stopped");
    }

    pub fn cancelled_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ── Context ─────────────────────────────────────────────────────────

    /// Replace the context snapshot wholesale and wake the ambient loop.
    /// Waking on change does not bypass permission checks or rate limiting.
    pub fn update_context(&self, raw: ContextSnapshot) {
        let sanitized = context::sanitize(raw);
        self.record_observation(&sanitized);
        let _ = self.events.send(AgentEvent::ContextChanged {
            application: sanitized.application.clone(),
            title: sanitized.title.clone(),
        });
        self.context.store(Arc::new(sanitized));
        self.context_changed.notify_one();
    }

    pub fn current_context(&self) -> Arc<ContextSnapshot> {
        self.context.load_full()
    }

    fn record_observation(&self, snapshot: &ContextSnapshot) {
        let mut observations = self.observations.lock().unwrap();
        if observations.len() == WORKING_MEMORY_CAPACITY {
            observations.pop_front();
        }
        observations.push_back(format!(
            "{}: {} - {}",
            Utc::now().to_rfc3339(),
            snapshot.application,
            snapshot.title
        ));
    }

    fn recent_observations(&self) -> Vec<String> {
        let observations = self.observations.lock().unwrap();
        observations
            .iter()
            .rev()
            .take(MEMORY_RECALL_LIMIT)
            .rev()
            .cloned()
            .collect()
    }

    async fn memory_excerpts(&self, context: &ContextSnapshot) -> Vec<String> {
        let mut excerpts = self.recent_observations();
        let query = format!("{} {}", context.title, context.application);
        match self.episodic.search(&query, MEMORY_RECALL_LIMIT).await {
            Ok(facts) => excerpts.extend(facts),
            Err(error) => tracing::warn!(%error, "episodic recall failed"),
        }
        excerpts
    }

    // ── Ambient loop ────────────────────────────────────────────────────

    async fn ambient_loop(self: Arc<Self>) {
        let mut interval = self.config.scheduler.ambient_interval_secs;
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = self.context_changed.notified() => {},
                () = tokio::time::sleep(Duration::from_secs(interval)) => {},
            }
            if self.cancel.is_cancelled() {
                return;
            }

            let _mode = self.mode_gate.lock().await;
            if self.interactive_active.load(Ordering::SeqCst) {
                interval = self.config.scheduler.ambient_interval_secs;
                continue;
            }
            interval = self.ambient_cycle().await;
        }
    }

    /// One decide+execute cycle. Caller holds the mode gate.
    async fn ambient_cycle(&self) -> u64 {
        let context = self.context.load_full();
        self.emotions.lock().unwrap().natural_decay();

        let recent_actions = self.executor.recent_actions();
        let memory_excerpts = self.memory_excerpts(&context).await;
        let emotional_state = self.emotions.lock().unwrap().snapshot();

        let decision = match self
            .ambient_brain
            .decide(&context, recent_actions, memory_excerpts, emotional_state)
            .await
        {
            Ok(decision) => decision,
            Err(error) => {
                // Transport failures never crash the loop; retry next wake.
                tracing::warn!(%error, "ambient decision failed");
                return self.config.scheduler.ambient_interval_secs;
            }
        };

        let _ = self.events.send(AgentEvent::DecisionMade {
            action: decision.action.clone(),
        });
        self.run_decision(&decision, &context).await
    }

    async fn run_decision(&self, decision: &Decision, context: &ContextSnapshot) -> u64 {
        match self.executor.execute(decision, context).await {
            Ok(interval) => interval,
            Err(error) => {
                tracing::warn!(action = decision.action.as_str(), %error, "execution failed");
                self.config.scheduler.reaction_interval_secs
            }
        }
    }

    // ── Interactive mode ────────────────────────────────────────────────

    /// Serve one external request/response exchange, then return to ambient.
    pub async fn handle_prompt(&self, prompt: &str) -> Result<String, BrainError> {
        let _mode = self.mode_gate.lock().await;
        self.interactive_active.store(true, Ordering::SeqCst);
        let _ = self.events.send(AgentEvent::ModeSwitched {
            mode: AgentMode::Interactive.as_str().to_string(),
        });
        tracing::info!("switched to interactive mode");

        let context = self.context.load_full();
        let mut brain = self.interactive_brain.lock().await;
        // Fresh conversation per exchange; nothing leaks across switches.
        brain.reset();
        let result = brain
            .respond(prompt, &context, self.executor.as_ref())
            .await;
        brain.reset();
        drop(brain);

        self.interactive_active.store(false, Ordering::SeqCst);
        let _ = self.events.send(AgentEvent::ModeSwitched {
            mode: AgentMode::Ambient.as_str().to_string(),
        });
        self.context_changed.notify_one();

        if let Ok(text) = &result
            && !text.is_empty()
        {
            self.presenter.show_message("Companion", text).await;
        }
        result
    }

    pub fn mode(&self) -> AgentMode {
        if self.interactive_active.load(Ordering::SeqCst) {
            AgentMode::Interactive
        } else {
            AgentMode::Ambient
        }
    }

    // ── Alert escalation ────────────────────────────────────────────────

    async fn alert_listener(self: Arc<Self>, mut rx: crate::events::EventReceiver) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                event = rx.recv() => match event {
                    Ok(AgentEvent::SystemAlert(alert)) => self.on_alert(alert).await,
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "alert listener lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }

    async fn on_alert(&self, alert: Alert) {
        match alert.severity {
            AlertSeverity::Critical => self.escalate(alert).await,
            AlertSeverity::Warning | AlertSeverity::Info => self.surface_alert(&alert).await,
        }
    }

    /// Out-of-band decision seeded with the alert, bypassing the wake timer.
    /// Bounded by its own per-alert-type cooldown, independent of the
    /// monitors' rate limiting.
    async fn escalate(&self, alert: Alert) {
        if !self.escalation.allow(&alert.alert_type) {
            tracing::debug!(
                alert_type = alert.alert_type.as_str(),
                "escalation rate limited"
            );
            self.surface_alert(&alert).await;
            return;
        }

        let context = self.context.load().with_extra(
            "system_alert",
            json!({
                "type": alert.alert_type,
                "message": alert.message,
                "details": alert.details,
            }),
        );

        let recent_actions = self.executor.recent_actions();
        let memory_excerpts = self.memory_excerpts(&context).await;
        let emotional_state = self.emotions.lock().unwrap().snapshot();

        // Serialize with the ambient path; execution stays single-flight.
        let _mode = self.mode_gate.lock().await;
        match self
            .ambient_brain
            .decide(&context, recent_actions, memory_excerpts, emotional_state)
            .await
        {
            Ok(decision) => {
                tracing::info!(
                    alert_type = alert.alert_type.as_str(),
                    action = decision.action.as_str(),
                    "escalated decision"
                );
                let _ = self.events.send(AgentEvent::DecisionMade {
                    action: decision.action.clone(),
                });
                self.run_decision(&decision, &context).await;
            }
            Err(error) => {
                tracing::error!(%error, "escalation decision failed");
                self.surface_alert(&alert).await;
            }
        }
    }

    async fn surface_alert(&self, alert: &Alert) {
        let (prefix, author) = match alert.severity {
            AlertSeverity::Critical => ("CRITICAL: ", "System Alert"),
            AlertSeverity::Warning => ("WARNING: ", "System Monitor"),
            AlertSeverity::Info => ("", "System Monitor"),
        };
        self.presenter
            .show_message(author, &format!("{prefix}{}", alert.message))
            .await;
    }

    // ── Anchor mirror ───────────────────────────────────────────────────

    /// Mirror the primary entity's anchor and behavior to the presenter,
    /// honoring actuator backoff when scheduling the next poll.
    async fn anchor_loop(self: Arc<Self>) {
        let poll = Duration::from_millis(self.config.scheduler.anchor_poll_ms.max(100));
        let idle = Duration::from_secs(2);
        let mut last_anchor: Option<(f64, f64)> = None;
        let mut last_behavior: Option<String> = None;

        loop {
            let entities = match self.actuator.discover().await {
                Ok(entities) => entities,
                Err(error) => {
                    tracing::debug!(%error, "entity poll failed");
                    let delay = poll.max(self.actuator.backoff_remaining().await);
                    if self.sleep_or_cancel(delay).await {
                        return;
                    }
                    continue;
                }
            };

            let Some(primary) = entities.first() else {
                if self.sleep_or_cancel(idle).await {
                    return;
                }
                continue;
            };

            let anchor = primary.anchor.map(|a| (a.x, a.y));
            if anchor != last_anchor {
                self.presenter.update_anchor(anchor).await;
                last_anchor = anchor;
            }

            if primary.active_behavior != last_behavior {
                if let Some(behavior) = &primary.active_behavior {
                    let _ = self.events.send(AgentEvent::BehaviorChanged {
                        behavior: behavior.clone(),
                        entity_id: primary.id,
                    });
                }
                last_behavior = primary.active_behavior.clone();
            }

            let delay = poll.max(self.actuator.backoff_remaining().await);
            if self.sleep_or_cancel(delay).await {
                return;
            }
        }
    }

    // ── Retention sweep ─────────────────────────────────────────────────

    async fn cleanup_loop(self: Arc<Self>) {
        let period = Duration::from_secs(self.config.scheduler.cleanup_interval_secs.max(60));
        loop {
            if self.sleep_or_cancel(period).await {
                return;
            }
            match self
                .episodic
                .cleanup_old(self.config.scheduler.retention_days)
                .await
            {
                Ok(swept) if swept > 0 => tracing::debug!(swept, "episodic facts swept"),
                Ok(_) => {}
                Err(error) => tracing::warn!(%error, "memory cleanup failed"),
            }
        }
    }

    async fn sleep_or_cancel(&self, period: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => true,
            () = tokio::time::sleep(period) => false,
        }
    }

    // ── Health ──────────────────────────────────────────────────────────

    pub async fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: if self.cancel.is_cancelled() {
                "stopped"
            } else {
                "healthy"
            },
            mode: self.mode().as_str(),
            actuator_reachable: self.actuator.discover().await.is_ok(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            actions_recorded: self.executor.history_len(),
        }
    }
}
