//! Agent pass: drive every manifest resource one step towards its desired state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, error, info, warn};

use cloudop_async::{
    AsyncReconciler, OperationKind, OperationPhase, OperationStatusStore, ReconcileError,
    Reconciled, ReconcilerConfig, ResourceKey, ResourceSpec,
};
use cloudop_hooks::{
    Hook, HookDecision, HookRequest, HookResponseTracker, HookRuntime,
};

use crate::clients::{ArmClient, HttpExtension};
use crate::manifest::{DesiredState, ExtensionEntry, Manifest, ResourceEntry};
use crate::store::SqliteStatusStore;

/// Agent timing
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Service name recorded on conditions
    pub name: String,
    pub poll_interval: Duration,
    pub hook_timeout: Duration,
}

/// What one resource did during a pass
#[derive(Debug, Clone, PartialEq)]
enum Step {
    Ready,
    Pending(Duration),
    Blocked { retry_after: Duration },
    Failed { retry_after: Option<Duration> },
}

/// Outcome of one pass over the manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassSummary {
    pub ready: usize,
    pub pending: usize,
    pub blocked: usize,
    pub failed: usize,
    /// Earliest time any resource asked to be looked at again
    pub requeue_after: Option<Duration>,
}

impl PassSummary {
    fn record(&mut self, step: Step) {
        let requeue = match step {
            Step::Ready => {
                self.ready += 1;
                None
            }
            Step::Pending(after) => {
                self.pending += 1;
                Some(after)
            }
            Step::Blocked { retry_after } => {
                self.blocked += 1;
                Some(retry_after)
            }
            Step::Failed { retry_after } => {
                self.failed += 1;
                retry_after
            }
        };
        if let Some(after) = requeue {
            self.requeue_after = Some(self.requeue_after.map_or(after, |d| d.min(after)));
        }
    }

    /// Delay before the next pass, never longer than `resync`.
    pub fn next_pass(&self, resync: Duration) -> Duration {
        self.requeue_after.map_or(resync, |d| d.min(resync))
    }
}

pub struct ResourceAgent {
    reconciler: AsyncReconciler<ArmClient>,
    store: Arc<SqliteStatusStore>,
    http: Client,
    config: AgentConfig,
}

impl ResourceAgent {
    pub fn new(client: ArmClient, store: Arc<SqliteStatusStore>, config: AgentConfig) -> Self {
        let reconciler = AsyncReconciler::new(
            client,
            Arc::clone(&store) as Arc<dyn OperationStatusStore>,
            config.name.clone(),
            ReconcilerConfig {
                poll_interval: config.poll_interval,
            },
        );

        Self {
            reconciler,
            store,
            http: Client::new(),
            config,
        }
    }

    fn hook_runtime(&self, extensions: &[ExtensionEntry]) -> HookRuntime {
        let mut runtime = HookRuntime::new(self.config.hook_timeout);
        for entry in extensions {
            runtime.register(Arc::new(HttpExtension::new(entry, self.http.clone())));
        }
        runtime
    }

    /// Run one pass over the manifest. Resources this agent managed earlier
    /// but the manifest no longer lists are deleted.
    pub async fn apply(&self, manifest: &Manifest) -> Result<PassSummary> {
        let hooks = self.hook_runtime(&manifest.extensions);
        let mut summary = PassSummary::default();

        for entry in &manifest.resources {
            let step = match entry.state {
                DesiredState::Present => self.ensure_present(entry).await,
                DesiredState::Absent => self.ensure_absent(entry, &hooks).await,
            };
            summary.record(step);
        }

        let listed: HashSet<ResourceKey> = manifest.resources.iter().map(|e| e.key()).collect();
        for key in self.store.managed_resources().await? {
            if listed.contains(&key) {
                continue;
            }
            info!("Pruning {} (no longer in manifest)", key);
            let step = self.ensure_absent(&ResourceEntry::absent(&key), &hooks).await;
            summary.record(step);
        }

        info!(
            ready = summary.ready,
            pending = summary.pending,
            blocked = summary.blocked,
            failed = summary.failed,
            "Pass complete"
        );
        Ok(summary)
    }

    async fn ensure_present(&self, entry: &ResourceEntry) -> Step {
        let key = entry.key();

        // Recorded up front so a resource that already matches is still pruned later
        if let Err(e) = self.store.adopt(&key).await {
            return self.failed(e.into());
        }

        // A deletion still running has to finish before the resource can come back
        match self.reconciler.phase(&key).await {
            Ok(OperationPhase::OperationPending(op)) if op.kind == OperationKind::Delete => {
                debug!("Waiting for deletion of {} before recreating it", key);
                match self.reconciler.delete_resource(entry).await {
                    Ok(Reconciled::Ready(())) => {}
                    Ok(Reconciled::Pending { requeue_after, .. }) => {
                        return Step::Pending(requeue_after);
                    }
                    Err(e) => return self.failed(e),
                }
            }
            Ok(_) => {}
            Err(e) => return self.failed(e),
        }

        match self.reconciler.create_resource(entry).await {
            Ok(Reconciled::Ready(resource)) => {
                debug!(
                    id = ?resource.id,
                    provisioning_state = ?resource.provisioning_state(),
                    "{} is ready", key
                );
                Step::Ready
            }
            Ok(Reconciled::Pending { requeue_after, .. }) => Step::Pending(requeue_after),
            Err(e) => self.failed(e),
        }
    }

    async fn ensure_absent(&self, entry: &ResourceEntry, hooks: &HookRuntime) -> Step {
        let key = entry.key();

        let phase = match self.reconciler.phase(&key).await {
            Ok(phase) => phase,
            Err(e) => return self.failed(e),
        };

        match phase {
            // Already deleting; hooks were consulted when it started
            OperationPhase::OperationPending(op) if op.kind == OperationKind::Delete => {}
            // The pending operation is kept until the hooks let the deletion through
            OperationPhase::OperationPending(op) => {
                if let Some(step) = self.before_delete(&key, Some(op.kind), hooks).await {
                    return step;
                }
                warn!("{} of {} superseded by deletion", op.kind, key);
                if let Err(e) = self.reconciler.abandon_operation(&key).await {
                    return self.failed(e);
                }
            }
            OperationPhase::NoOperation => {
                if let Some(step) = self.before_delete(&key, None, hooks).await {
                    return step;
                }
            }
        }

        match self.reconciler.delete_resource(entry).await {
            Ok(Reconciled::Ready(())) => {
                if let Err(e) = self.store.forget(&key).await {
                    warn!("Failed to forget deleted {}: {}", key, e);
                }
                Step::Ready
            }
            Ok(Reconciled::Pending { requeue_after, .. }) => Step::Pending(requeue_after),
            Err(e) => self.failed(e),
        }
    }

    /// Run the BeforeDelete hooks. `Some` when the deletion must not start.
    /// `supersedes` names the pending operation a go-ahead would abandon.
    async fn before_delete(
        &self,
        key: &ResourceKey,
        supersedes: Option<OperationKind>,
        hooks: &HookRuntime,
    ) -> Option<Step> {
        let mut tracker = HookResponseTracker::new();
        let request = HookRequest::new(Hook::BeforeDelete, key.to_string()).with_context(json!({
            "resourceType": key.resource_type,
            "group": key.group,
            "name": key.name,
            "supersedes": supersedes.map(|kind| kind.as_str()),
        }));

        if let Err(e) = hooks.track_all(&request, &mut tracker).await {
            error!("BeforeDelete hooks failed for {}: {}", key, e);
            return Some(Step::Failed {
                retry_after: e.is_transient().then_some(self.config.poll_interval),
            });
        }

        match tracker.decision() {
            HookDecision::Proceed => None,
            HookDecision::Blocked {
                retry_after,
                message,
            } => {
                info!(
                    retry_after = ?retry_after,
                    "Deletion of {} blocked: {}", key, message
                );
                Some(Step::Blocked { retry_after })
            }
        }
    }

    fn failed(&self, e: ReconcileError) -> Step {
        if e.is_retryable() {
            warn!("Reconciliation will be retried: {}", e);
            Step::Failed {
                retry_after: Some(e.requeue_after().unwrap_or(self.config.poll_interval)),
            }
        } else {
            error!("Reconciliation failed: {}", e);
            Step::Failed { retry_after: None }
        }
    }
}
