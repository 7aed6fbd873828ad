//! Per-transition collection of hook responses.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::response::{HookResponse, lowest_non_zero};

/// Collects the responses of the hooks called during one transition.
///
/// Create one per transition and drop it afterwards. Not synchronized: guard
/// it with a lock if hooks are called concurrently.
#[derive(Debug, Clone, Default)]
pub struct HookResponseTracker {
    responses: BTreeMap<String, HookResponse>,
}

/// What the transition should do after its hooks ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    Proceed,
    Blocked {
        retry_after: Duration,
        message: String,
    },
}

impl HookResponseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the response of a hook, replacing any earlier one for it.
    pub fn add(&mut self, hook: impl Into<String>, response: HookResponse) {
        self.responses.insert(hook.into(), response);
    }

    pub fn get(&self, hook: &str) -> Option<&HookResponse> {
        self.responses.get(hook)
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    /// Lowest non-zero retry requested by any hook, zero if none asked.
    pub fn aggregate_retry_after(&self) -> Duration {
        let seconds = self
            .responses
            .values()
            .fold(0, |acc, r| lowest_non_zero(acc, r.retry_after_seconds));
        Duration::from_secs(u64::from(seconds))
    }

    /// Human friendly summary of the hooks holding the transition back.
    pub fn aggregate_message(&self) -> String {
        self.responses
            .iter()
            .filter(|(_, r)| r.is_blocking())
            .map(|(hook, r)| format!("hook {:?} is blocking: {}", hook, r.message))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn decision(&self) -> HookDecision {
        let retry_after = self.aggregate_retry_after();
        if retry_after.is_zero() {
            HookDecision::Proceed
        } else {
            HookDecision::Blocked {
                retry_after,
                message: self.aggregate_message(),
            }
        }
    }
}
