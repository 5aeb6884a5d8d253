//! Named test hooks between a side-effect and its state commit.
//!
//! In test builds (and under the `failpoints` feature) a hook can be
//! installed under a well-known name; firing it decides whether the worker
//! commits the state transition or skips it, simulating a crash after the
//! side-effect. Production builds compile the registry out entirely and
//! [`fire`] collapses to a no-op.

/// Fires right after a webhook POST succeeded, before the delivery is
/// marked.
pub const WEBHOOK_AFTER_POST: &str = "delivery.webhook.after_post_before_mark";

/// Fires right after an S3 PUT succeeded, before the delivery is marked.
pub const S3_AFTER_PUT: &str = "delivery.s3.after_put_before_mark";

/// What the worker should do after a failpoint fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailpointAction {
    /// Proceed normally.
    #[default]
    Continue,
    /// Skip the state commit, as if the process died after the
    /// side-effect. The claim stays in place and the delivery will be
    /// re-attempted after the reclaim window — receivers must dedupe.
    SkipCommit,
}

#[cfg(any(test, feature = "failpoints"))]
mod registry {
    use std::collections::HashMap;
    use std::sync::RwLock;

    use once_cell::sync::Lazy;

    use super::FailpointAction;

    type Hook = Box<dyn Fn() -> FailpointAction + Send + Sync>;

    static REGISTRY: Lazy<RwLock<HashMap<String, Hook>>> =
        Lazy::new(|| RwLock::new(HashMap::new()));

    /// Install a hook under a failpoint name.
    pub fn set<F>(name: &str, hook: F)
    where
        F: Fn() -> FailpointAction + Send + Sync + 'static,
    {
        REGISTRY
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Box::new(hook));
    }

    /// Remove a hook.
    pub fn clear(name: &str) {
        REGISTRY
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    pub(crate) fn fire(name: &str) -> FailpointAction {
        REGISTRY
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|hook| hook())
            .unwrap_or_default()
    }
}

#[cfg(any(test, feature = "failpoints"))]
pub use registry::{clear, set};

/// Evaluate a failpoint. Always [`FailpointAction::Continue`] in production
/// builds.
pub(crate) fn fire(name: &str) -> FailpointAction {
    #[cfg(any(test, feature = "failpoints"))]
    {
        registry::fire(name)
    }
    #[cfg(not(any(test, feature = "failpoints")))]
    {
        let _ = name;
        FailpointAction::Continue
    }
}
