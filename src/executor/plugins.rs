use crate::brain::ActionSpec;
use async_trait::async_trait;
use serde_json::Value;

/// Externally registered action provider.
///
/// Plugins are the bounded fallback for action names outside the built-in
/// set: the executor asks each plugin in registration order whether it
/// provides the name, and the first success wins.
#[async_trait]
pub trait ActionPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Action specs this plugin advertises to the reasoning service.
    fn provides(&self) -> Vec<ActionSpec>;

    async fn execute(&self, action: &str, args: &Value) -> anyhow::Result<()>;
}

/// Merge built-in specs with every plugin's advertised actions.
pub fn advertised_specs(
    builtin: Vec<ActionSpec>,
    plugins: &[std::sync::Arc<dyn ActionPlugin>],
) -> Vec<ActionSpec> {
    let mut specs = builtin;
    for plugin in plugins {
        for spec in plugin.provides() {
            if specs.iter().any(|existing| existing.name == spec.name) {
                tracing::warn!(
                    plugin = plugin.name(),
                    action = spec.name.as_str(),
                    "plugin action shadows an existing spec; skipping"
                );
                continue;
            }
            specs.push(spec);
        }
    }
    specs
}
