use super::{ActionSpec, Decision, DecisionRequest, RateGovernor, ReasoningProvider};
use crate::context::ContextSnapshot;
use crate::error::BrainError;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Single-shot decision brain driving the ambient loop.
///
/// One reasoning call per cycle. Transport failures propagate so the caller
/// can apply its own retry cadence; a call that succeeds but names no action
/// resolves to the default observe decision so the loop never stalls.
pub struct AmbientBrain {
    provider: Arc<dyn ReasoningProvider>,
    governor: Arc<RateGovernor>,
    actions: Vec<ActionSpec>,
    model: String,
    default_interval_secs: u64,
}

impl AmbientBrain {
    pub fn new(
        provider: Arc<dyn ReasoningProvider>,
        governor: Arc<RateGovernor>,
        actions: Vec<ActionSpec>,
        model: &str,
        default_interval_secs: u64,
    ) -> Self {
        Self {
            provider,
            governor,
            actions,
            model: model.to_string(),
            default_interval_secs,
        }
    }

    pub async fn decide(
        &self,
        context: &ContextSnapshot,
        recent_actions: Vec<String>,
        memory_excerpts: Vec<String>,
        emotional_state: BTreeMap<String, f64>,
    ) -> Result<Decision, BrainError> {
        let request =
            DecisionRequest::new(context, recent_actions, memory_excerpts, emotional_state);

        self.governor.acquire().await;
        match self
            .provider
            .decide(&self.model, &request, &self.actions)
            .await
        {
            Ok(reply) => {
                self.governor.record_success();
                Ok(reply.decision.unwrap_or_else(|| {
                    tracing::debug!("reasoning reply named no action; observing");
                    Decision::observe_default(self.default_interval_secs)
                }))
            }
            Err(error) => {
                self.governor.record_failure(&error);
                Err(error)
            }
        }
    }
}
