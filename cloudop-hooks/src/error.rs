//! Hook invocation errors.

use std::time::Duration;

use thiserror::Error;

use crate::catalog::Hook;

/// Errors raised while calling extension handlers.
///
/// Aggregating responses never fails; these only come from invocation.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("unknown hook: {0}")]
    UnknownHook(String),

    /// The handler answered with a failure status.
    #[error("extension {handler} failed {hook}: {message}")]
    Failed {
        hook: Hook,
        handler: String,
        message: String,
    },

    #[error("extension {handler} did not answer {hook} within {timeout:?}")]
    Timeout {
        hook: Hook,
        handler: String,
        timeout: Duration,
    },

    /// The handler could not be reached or answered garbage.
    #[error("extension {handler} unreachable for {hook}: {message}")]
    Transport {
        hook: Hook,
        handler: String,
        message: String,
    },
}

impl HookError {
    /// Whether calling the hook again may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, HookError::Timeout { .. } | HookError::Transport { .. })
    }
}
