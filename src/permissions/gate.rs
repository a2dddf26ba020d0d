use super::Scope;
use async_trait::async_trait;

/// A pending "ask" decision surfaced to whoever owns the approval UX.
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub agent_id: String,
    pub scope: Scope,
    pub action: String,
    pub args_summary: String,
}

/// Outcome of an approval request. `AllowOnce` never mutates the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    AllowOnce,
    Deny { reason: String },
}

/// Seam for the interactive confirmation step. The executor consults the
/// gate whenever the ledger answers `Ask`; a human-in-the-loop gate is a
/// drop-in replacement for the default.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn request(&self, request: &PermissionRequest) -> anyhow::Result<GateDecision>;
}

/// Default gate: log the grant and allow the single action.
pub struct AllowOnceGate;

#[async_trait]
impl ApprovalGate for AllowOnceGate {
    async fn request(&self, request: &PermissionRequest) -> anyhow::Result<GateDecision> {
        tracing::info!(
            agent_id = request.agent_id.as_str(),
            scope = request.scope.as_str(),
            action = request.action.as_str(),
            "granting one-time approval"
        );
        Ok(GateDecision::AllowOnce)
    }
}

/// Gate that refuses everything; useful for headless contexts where no one
/// can answer an approval prompt.
pub struct DenyAllGate {
    pub reason: String,
}

#[async_trait]
impl ApprovalGate for DenyAllGate {
    async fn request(&self, _request: &PermissionRequest) -> anyhow::Result<GateDecision> {
        Ok(GateDecision::Deny {
            reason: self.reason.clone(),
        })
    }
}
