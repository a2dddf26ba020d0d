use super::{ActionSpec, Decision, RateGovernor, ReasoningProvider, Turn};
use crate::context::ContextSnapshot;
use crate::error::BrainError;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// Absolute upper bound on chained tool calls per user turn.
pub const CHAIN_HARD_CAP: u32 = 10;

const MAX_PROMPT_LEN: usize = 10_000;

/// Seam through which the brain executes the actions it proposes.
/// Implemented by the `ActionExecutor`; mocked in tests.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    /// Execute one decision; returns the next wake interval in seconds.
    async fn run(&self, decision: &Decision, context: &ContextSnapshot) -> anyhow::Result<u64>;
}

/// Multi-turn conversational brain serving on-demand exchanges.
///
/// Chained tool-calling is a bounded loop over typed conversation state: each
/// proposed action is executed, recorded as an `ActionPerformed` turn, and the
/// service is re-queried - until it answers with no further action or the
/// chain cap is hit. The accumulated text, with exact-duplicate sentences
/// collapsed, is the final reply.
pub struct InteractiveBrain {
    provider: Arc<dyn ReasoningProvider>,
    governor: Arc<RateGovernor>,
    actions: Vec<ActionSpec>,
    model: String,
    history: Vec<Turn>,
}

impl InteractiveBrain {
    pub fn new(
        provider: Arc<dyn ReasoningProvider>,
        governor: Arc<RateGovernor>,
        actions: Vec<ActionSpec>,
        model: &str,
    ) -> Self {
        Self {
            provider,
            governor,
            actions,
            model: model.to_string(),
            history: Vec::new(),
        }
    }

    pub async fn respond(
        &mut self,
        prompt: &str,
        context: &ContextSnapshot,
        runner: &dyn ActionRunner,
    ) -> Result<String, BrainError> {
        self.history.push(Turn::User {
            text: sanitize_prompt(prompt),
        });

        let mut collected = Vec::new();

        for step in 0..CHAIN_HARD_CAP {
            self.governor.acquire().await;
            let reply = match self
                .provider
                .converse(&self.model, &self.history, &self.actions)
                .await
            {
                Ok(reply) => {
                    self.governor.record_success();
                    reply
                }
                Err(error) => {
                    self.governor.record_failure(&error);
                    return Err(error);
                }
            };

            if let Some(text) = reply.text.as_deref()
                && !text.trim().is_empty()
            {
                collected.push(text.to_string());
                self.history.push(Turn::Assistant {
                    text: text.to_string(),
                });
            }

            let Some(decision) = reply.decision else {
                break;
            };

            tracing::info!(step, action = decision.action.as_str(), "chained action");
            let outcome = match runner.run(&decision, context).await {
                Ok(interval) => format!("executed; next check in {interval}s"),
                Err(error) => {
                    tracing::warn!(action = decision.action.as_str(), %error, "chained action failed");
                    format!("failed: {error}")
                }
            };
            self.history.push(Turn::ActionPerformed {
                action: decision.action,
                outcome,
            });
        }

        Ok(dedup_sentences(&collected.join(" ")))
    }

    /// Drop conversational state so it cannot leak across mode switches.
    pub fn reset(&mut self) {
        self.history.clear();
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

fn sanitize_prompt(prompt: &str) -> String {
    let cleaned: String = prompt
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    if cleaned.len() > MAX_PROMPT_LEN {
        let mut end = MAX_PROMPT_LEN;
        while !cleaned.is_char_boundary(end) {
            end -= 1;
        }
        tracing::warn!(
            original = cleaned.len(),
            truncated = end,
            "prompt truncated"
        );
        format!("{}... [truncated]", &cleaned[..end])
    } else {
        cleaned
    }
}

/// Collapse exact-duplicate sentences, preserving first-seen order.
fn dedup_sentences(text: &str) -> String {
    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    for sentence in split_sentences(text) {
        let trimmed = sentence.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            kept.push(trimmed.to_string());
        }
    }
    kept.join(" ")
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            let boundary = chars.peek().is_none_or(|(_, next)| next.is_whitespace());
            if boundary {
                let end = idx + c.len_utf8();
                sentences.push(&text[start..end]);
                start = end;
            }
        }
    }
    if start < text.len() {
        sentences.push(&text[start..]);
    }
    sentences
}
