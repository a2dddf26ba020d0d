use async_trait::async_trait;

/// Seam to the presentation collaborators (overlay, chat panel, desktop
/// notifications). The control core only needs three verbs; rendering is
/// someone else's problem.
#[async_trait]
pub trait Presenter: Send + Sync {
    /// Persistent chat-panel message.
    async fn show_message(&self, author: &str, text: &str);

    /// Transient speech bubble above the companion.
    async fn show_bubble(&self, author: &str, text: &str, duration_secs: u64);

    /// Short user-visible notice that an action was blocked.
    async fn show_denial(&self, action: &str, reason: &str);

    /// Companion anchor moved (or vanished); overlays may reposition.
    async fn update_anchor(&self, _anchor: Option<(f64, f64)>) {}
}

/// Default presenter: everything goes through tracing. Keeps the agent fully
/// operable headless.
pub struct LogPresenter;

#[async_trait]
impl Presenter for LogPresenter {
    async fn show_message(&self, author: &str, text: &str) {
        tracing::info!(author, "{text}");
    }

    async fn show_bubble(&self, author: &str, text: &str, duration_secs: u64) {
        tracing::info!(author, duration_secs, "{text}");
    }

    async fn show_denial(&self, action: &str, reason: &str) {
        tracing::warn!(action, "action blocked: {reason}");
    }
}
