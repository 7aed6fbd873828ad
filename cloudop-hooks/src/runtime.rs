//! Registry of extension handlers and hook invocation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::Hook;
use crate::error::HookError;
use crate::response::{HookResponse, ResponseStatus, lowest_non_zero};
use crate::tracker::HookResponseTracker;

/// Default time an extension handler gets to answer.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Context passed to every handler of a hook.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookRequest {
    pub hook: Hook,
    /// Resource going through the transition.
    pub resource: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub context: serde_json::Value,
}

impl HookRequest {
    pub fn new(hook: Hook, resource: impl Into<String>) -> Self {
        Self {
            hook,
            resource: resource.into(),
            context: serde_json::Value::Null,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// An independently-authored extension answering lifecycle hooks.
#[async_trait]
pub trait ExtensionHandler: Send + Sync {
    /// Stable name, used in tracker keys and log lines.
    fn name(&self) -> &str;

    /// Hooks this handler wants to be called for.
    fn hooks(&self) -> &[Hook];

    async fn call(&self, request: &HookRequest) -> Result<HookResponse, HookError>;
}

/// Calls registered extension handlers for lifecycle hooks.
pub struct HookRuntime {
    handlers: Vec<Arc<dyn ExtensionHandler>>,
    timeout: Duration,
}

impl HookRuntime {
    pub fn new(timeout: Duration) -> Self {
        Self {
            handlers: Vec::new(),
            timeout,
        }
    }

    pub fn register(&mut self, handler: Arc<dyn ExtensionHandler>) {
        info!(
            "Registered extension {} for {:?}",
            handler.name(),
            handler.hooks()
        );
        self.handlers.push(handler);
    }

    /// Handlers registered for `hook`, in registration order.
    pub fn handlers_for(&self, hook: Hook) -> impl Iterator<Item = &Arc<dyn ExtensionHandler>> {
        self.handlers
            .iter()
            .filter(move |h| h.hooks().contains(&hook))
    }

    /// Call every handler of the request's hook and merge their answers into
    /// one response: the lowest non-zero retry and all non-empty messages.
    pub async fn call_all(&self, request: &HookRequest) -> Result<HookResponse, HookError> {
        let mut merged = HookResponse::success();
        let mut messages = Vec::new();

        for handler in self.handlers_for(request.hook) {
            let response = self.call_one(handler.as_ref(), request).await?;
            merged.retry_after_seconds =
                lowest_non_zero(merged.retry_after_seconds, response.retry_after_seconds);
            if !response.message.is_empty() {
                messages.push(response.message);
            }
        }

        merged.message = messages.join(", ");
        Ok(merged)
    }

    /// Call every handler of the request's hook and record each answer in
    /// `tracker` under `"<hook>/<handler>"`.
    pub async fn track_all(
        &self,
        request: &HookRequest,
        tracker: &mut HookResponseTracker,
    ) -> Result<(), HookError> {
        for handler in self.handlers_for(request.hook) {
            let response = self.call_one(handler.as_ref(), request).await?;
            tracker.add(format!("{}/{}", request.hook, handler.name()), response);
        }
        Ok(())
    }

    async fn call_one(
        &self,
        handler: &dyn ExtensionHandler,
        request: &HookRequest,
    ) -> Result<HookResponse, HookError> {
        debug!(
            "Calling extension {} for {} on {}",
            handler.name(),
            request.hook,
            request.resource
        );

        let mut response = match tokio::time::timeout(self.timeout, handler.call(request)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(HookError::Timeout {
                    hook: request.hook,
                    handler: handler.name().to_string(),
                    timeout: self.timeout,
                });
            }
        };

        if response.status == ResponseStatus::Failure {
            return Err(HookError::Failed {
                hook: request.hook,
                handler: handler.name().to_string(),
                message: response.message,
            });
        }

        if response.is_blocking() && !request.hook.is_blocking() {
            warn!(
                "Extension {} asked to retry non-blocking hook {}, ignoring",
                handler.name(),
                request.hook
            );
            response.retry_after_seconds = 0;
        }

        Ok(response)
    }
}

impl Default for HookRuntime {
    fn default() -> Self {
        Self::new(DEFAULT_HOOK_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::tracker::HookDecision;

    struct StaticHandler {
        name: String,
        hooks: Vec<Hook>,
        response: HookResponse,
        delay: Duration,
    }

    impl StaticHandler {
        fn new(name: &str, hooks: &[Hook], response: HookResponse) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                hooks: hooks.to_vec(),
                response,
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl ExtensionHandler for StaticHandler {
        fn name(&self) -> &str {
            &self.name
        }

        fn hooks(&self) -> &[Hook] {
            &self.hooks
        }

        async fn call(&self, _request: &HookRequest) -> Result<HookResponse, HookError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.response.clone())
        }
    }

    fn request(hook: Hook) -> HookRequest {
        HookRequest::new(hook, "rg-1/vnet-1")
    }

    #[tokio::test]
    async fn test_call_all_merges_responses() {
        let mut runtime = HookRuntime::default();
        runtime.register(StaticHandler::new(
            "dns",
            &[Hook::BeforeDelete],
            HookResponse::retry(30, "records still referenced"),
        ));
        runtime.register(StaticHandler::new(
            "backup",
            &[Hook::BeforeDelete],
            HookResponse::retry(10, "snapshot running"),
        ));
        runtime.register(StaticHandler::new(
            "audit",
            &[Hook::AfterCreate],
            HookResponse::retry(5, "not called"),
        ));

        let merged = runtime.call_all(&request(Hook::BeforeDelete)).await.unwrap();

        assert_eq!(merged.retry_after_seconds, 10);
        assert_eq!(merged.message, "records still referenced, snapshot running");
    }

    #[tokio::test]
    async fn test_call_all_without_handlers_proceeds() {
        let runtime = HookRuntime::default();
        let merged = runtime.call_all(&request(Hook::BeforeCreate)).await.unwrap();
        assert_eq!(merged, HookResponse::success());
    }

    #[tokio::test]
    async fn test_failure_status_is_an_error() {
        let mut runtime = HookRuntime::default();
        runtime.register(StaticHandler::new(
            "policy",
            &[Hook::BeforeCreate],
            HookResponse::failure("region not allowed"),
        ));

        let err = runtime
            .call_all(&request(Hook::BeforeCreate))
            .await
            .unwrap_err();

        assert!(matches!(err, HookError::Failed { ref handler, .. } if handler == "policy"));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_retry_ignored_for_non_blocking_hook() {
        let mut runtime = HookRuntime::default();
        runtime.register(StaticHandler::new(
            "notify",
            &[Hook::AfterUpdate],
            HookResponse::retry(60, "please wait"),
        ));

        let mut tracker = HookResponseTracker::new();
        runtime
            .track_all(&request(Hook::AfterUpdate), &mut tracker)
            .await
            .unwrap();

        assert_eq!(tracker.decision(), HookDecision::Proceed);
    }

    #[tokio::test]
    async fn test_track_all_keys_by_handler() {
        let mut runtime = HookRuntime::default();
        runtime.register(StaticHandler::new(
            "dns",
            &[Hook::BeforeDelete],
            HookResponse::retry(30, "records still referenced"),
        ));
        runtime.register(StaticHandler::new(
            "backup",
            &[Hook::BeforeDelete],
            HookResponse::success(),
        ));

        let mut tracker = HookResponseTracker::new();
        runtime
            .track_all(&request(Hook::BeforeDelete), &mut tracker)
            .await
            .unwrap();

        assert_eq!(tracker.len(), 2);
        assert_eq!(
            tracker.decision(),
            HookDecision::Blocked {
                retry_after: Duration::from_secs(30),
                message: r#"hook "BeforeDelete/dns" is blocking: records still referenced"#
                    .to_string(),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_times_out() {
        let mut runtime = HookRuntime::new(Duration::from_secs(2));
        runtime.register(Arc::new(StaticHandler {
            name: "slow".to_string(),
            hooks: vec![Hook::BeforeUpdate],
            response: HookResponse::success(),
            delay: Duration::from_secs(5),
        }));

        let err = runtime
            .call_all(&request(Hook::BeforeUpdate))
            .await
            .unwrap_err();

        assert!(matches!(err, HookError::Timeout { .. }));
        assert!(err.is_transient());
    }
}
