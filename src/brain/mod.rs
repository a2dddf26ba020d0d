pub mod ambient;
pub mod governor;
pub mod interactive;

pub use ambient::AmbientBrain;
pub use governor::RateGovernor;
pub use interactive::{ActionRunner, InteractiveBrain, CHAIN_HARD_CAP};

use crate::context::ContextSnapshot;
use crate::error::BrainError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Exactly one proposed action plus arguments, as returned by a reasoning
/// call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: String,
    pub arguments: Value,
}

impl Decision {
    /// The baseline "observe, wait a bounded duration" decision substituted
    /// whenever a reasoning call succeeds but proposes no action.
    pub fn observe_default(duration_secs: u64) -> Self {
        Self {
            action: "observe_and_wait".to_string(),
            arguments: serde_json::json!({ "duration_seconds": duration_secs }),
        }
    }
}

/// JSON-schema-like description of one advertised action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Request payload for a single-shot ambient decision.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRequest {
    pub context: Value,
    pub recent_actions: Vec<String>,
    pub memory_excerpts: Vec<String>,
    pub emotional_state: BTreeMap<String, f64>,
}

impl DecisionRequest {
    pub fn new(
        context: &ContextSnapshot,
        recent_actions: Vec<String>,
        memory_excerpts: Vec<String>,
        emotional_state: BTreeMap<String, f64>,
    ) -> Self {
        Self {
            context: context.as_json(),
            recent_actions,
            memory_excerpts,
            emotional_state,
        }
    }
}

/// One turn of an interactive conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Turn {
    User { text: String },
    Assistant { text: String },
    ActionPerformed { action: String, outcome: String },
}

/// Zero-or-one structured action call plus optional free text.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderReply {
    pub decision: Option<Decision>,
    pub text: Option<String>,
}

/// Seam to the remote reasoning service.
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    async fn decide(
        &self,
        model: &str,
        request: &DecisionRequest,
        actions: &[ActionSpec],
    ) -> Result<ProviderReply, BrainError>;

    async fn converse(
        &self,
        model: &str,
        turns: &[Turn],
        actions: &[ActionSpec],
    ) -> Result<ProviderReply, BrainError>;
}

// ─── HTTP implementation ─────────────────────────────────────────────────────

#[derive(Serialize)]
struct DecideBody<'a> {
    model: &'a str,
    #[serde(flatten)]
    request: &'a DecisionRequest,
    actions: &'a [ActionSpec],
}

#[derive(Serialize)]
struct ConverseBody<'a> {
    model: &'a str,
    turns: &'a [Turn],
    actions: &'a [ActionSpec],
}

#[derive(Deserialize)]
struct WireReply {
    #[serde(default)]
    action: Option<WireAction>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct WireAction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Reasoning-service client speaking the JSON decision protocol.
pub struct HttpReasoningService {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    timeout_secs: u64,
}

impl HttpReasoningService {
    pub fn new(endpoint: &str, api_key: Option<&str>, timeout_secs: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.map(str::to_string),
            timeout_secs,
        })
    }

    async fn post<B: Serialize>(&self, body: &B) -> Result<ProviderReply, BrainError> {
        let mut request = self.client.post(&self.endpoint).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                BrainError::Timeout {
                    timeout_secs: self.timeout_secs,
                }
            } else {
                BrainError::Request(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrainError::Request(format!("{status}: {body}")));
        }

        let wire: WireReply = response
            .json()
            .await
            .map_err(|e| BrainError::Malformed(e.to_string()))?;

        Ok(ProviderReply {
            decision: wire.action.map(|a| Decision {
                action: a.name,
                arguments: a.arguments,
            }),
            text: wire.text,
        })
    }
}

#[async_trait]
impl ReasoningProvider for HttpReasoningService {
    async fn decide(
        &self,
        model: &str,
        request: &DecisionRequest,
        actions: &[ActionSpec],
    ) -> Result<ProviderReply, BrainError> {
        self.post(&DecideBody {
            model,
            request,
            actions,
        })
        .await
    }

    async fn converse(
        &self,
        model: &str,
        turns: &[Turn],
        actions: &[ActionSpec],
    ) -> Result<ProviderReply, BrainError> {
        self.post(&ConverseBody {
            model,
            turns,
            actions,
        })
        .await
    }
}
