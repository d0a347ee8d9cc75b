//! Model-compatibility rules: given a parsed selector and a provider's
//! advertised list, decide whether the provider qualifies and which
//! provider-local model identifier to forward.

use crate::classifier::{classify, normalize, ModelSelector};
use crate::registry::ProviderSnapshot;

/// Resolve a selector against one provider. `Some(model)` is the identifier
/// to put in the forwarded `completion_request`:
/// tier and combined selectors resolve to a concrete advertised name, while
/// exact and addressed selectors keep the requested identifier as-is
/// (minus the `@handle` suffix for addressed ones).
pub fn resolve(selector: &ModelSelector, provider: &ProviderSnapshot) -> Option<String> {
    match selector {
        ModelSelector::Tier(tier) => provider
            .models
            .iter()
            .find(|m| classify(m).tier == *tier)
            .cloned(),
        ModelSelector::Combined { tier, substring } => provider
            .models
            .iter()
            .find(|m| classify(m).tier == *tier && m.to_lowercase().contains(substring.as_str()))
            .cloned(),
        ModelSelector::Addressed { model, handle } => {
            if provider.handle != *handle {
                return None;
            }
            let wanted = normalize(model);
            provider
                .models
                .iter()
                .any(|m| normalize(m) == wanted)
                .then(|| model.clone())
        }
        // No tier fallback for specific model requests.
        ModelSelector::Exact(requested) => {
            let wanted = normalize(requested);
            provider
                .models
                .iter()
                .any(|m| normalize(m) == wanted)
                .then(|| requested.clone())
        }
    }
}
