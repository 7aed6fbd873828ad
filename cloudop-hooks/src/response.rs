//! Responses returned by extension handlers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Whether the handler processed the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    #[default]
    Success,
    Failure,
}

/// Answer of one hook invocation.
///
/// A non-zero `retry_after_seconds` both asks for a retry and marks the
/// response as blocking; there is no separate blocking flag on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookResponse {
    #[serde(default)]
    pub status: ResponseStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub retry_after_seconds: u32,
}

impl HookResponse {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn retry(retry_after_seconds: u32, message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Success,
            message: message.into(),
            retry_after_seconds,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Failure,
            message: message.into(),
            retry_after_seconds: 0,
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.retry_after_seconds != 0
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(u64::from(self.retry_after_seconds))
    }
}

/// Lowest of two retry values, where zero means "no retry requested".
pub(crate) fn lowest_non_zero(a: u32, b: u32) -> u32 {
    match (a, b) {
        (0, b) => b,
        (a, 0) => a,
        (a, b) => a.min(b),
    }
}
