use llm_relay_core::classify::KeyAction;
use llm_relay_core::{Key, KeyPatch, KeyPool, PoolError};
use tracing::{info, warn};

/// Apply the key-state change that precedes a silent retry.
///
/// A `KeyNotFound` here means another request already deleted the key; that is not an error
/// for this request, which will simply be served by a different key.
pub(super) fn apply_key_action(pool: &KeyPool, key: &Key, action: KeyAction) {
    let result = match action {
        KeyAction::MarkRateLimited => pool.mark_rate_limited(key),
        KeyAction::Disable(reason) => pool.disable(key, reason),
        KeyAction::RequirePreamble => {
            let patch = KeyPatch {
                requires_preamble: Some(true),
                ..KeyPatch::default()
            };
            pool.update(key, None, &patch).map(|_| ())
        }
        KeyAction::RevokeCapability(cap) => {
            let patch = KeyPatch {
                remove_capability: Some(cap),
                ..KeyPatch::default()
            };
            pool.update(key, None, &patch).map(|_| ())
        }
        KeyAction::Delete => {
            if pool.delete(key) {
                info!(key = key.id(), service = %key.service(), "deleted invalid key");
            }
            Ok(())
        }
    };
    match result {
        Ok(()) | Err(PoolError::KeyNotFound(_)) => {}
        Err(err) => warn!(key = key.id(), ?action, "failed to update key before retry: {err}"),
    }
}

/// The advisory suffix for a no-key failure.
pub(super) fn no_key_advice(available: usize) -> String {
    match available {
        0 => "There are no more keys available for this vendor.".to_string(),
        1 => "1 more key is available for this vendor; try again in a moment.".to_string(),
        n => format!("{n} more keys are available for this vendor; try again in a moment."),
    }
}
