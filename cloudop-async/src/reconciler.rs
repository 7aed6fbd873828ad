//! Resource reconciler for asynchronous provider operations.
//!
//! Per resource the reconciler moves through three phases:
//!
//! ```text
//! NoOperation ──start──► OperationPending ──is_done──► OperationDone ──► NoOperation
//!                            │    ▲
//!                            └────┘ not done: requeue, descriptor untouched
//! ```
//!
//! Nothing here sleeps or waits for completion. A pending pass returns
//! [`Reconciled::Pending`] and the caller's work queue schedules the next one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::client::{CreateOutcome, Creator, Deleter, FutureHandler, ResourceSpec};
use crate::error::{ClientError, ReconcileError, StoreError};
use crate::future::{OperationDescriptor, OperationKind, ResourceKey};
use crate::status::{OperationCondition, OperationStatusStore};

/// Default delay between polls of a pending operation.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Reconciler tuning.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Requeue delay returned while an operation is pending.
    pub poll_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Successful outcome of one reconciliation pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled<T> {
    /// The resource has converged.
    Ready(T),
    /// A provider operation is still running.
    Pending {
        operation: OperationDescriptor,
        requeue_after: Duration,
    },
}

impl<T> Reconciled<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Reconciled::Ready(_))
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Reconciled::Ready(_) => None,
            Reconciled::Pending { requeue_after, .. } => Some(*requeue_after),
        }
    }

    pub fn ready(self) -> Option<T> {
        match self {
            Reconciled::Ready(value) => Some(value),
            Reconciled::Pending { .. } => None,
        }
    }
}

/// Operation phase of a resource between passes.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationPhase {
    NoOperation,
    OperationPending(OperationDescriptor),
}

enum Poll<T> {
    Pending,
    Done(Option<T>),
}

/// Entry points exposed to the surrounding controller.
#[async_trait]
pub trait Reconciler<S: ResourceSpec>: Send + Sync {
    /// Create the resource, or update it when it differs from `spec`.
    async fn create_resource(&self, spec: &S) -> Result<Reconciled<S::Resource>, ReconcileError>;

    /// Delete the resource. Succeeds when it is already gone.
    async fn delete_resource(&self, spec: &S) -> Result<Reconciled<()>, ReconcileError>;
}

/// Reconciler that tracks operations started by `C` in a status store.
pub struct AsyncReconciler<C> {
    client: C,
    store: Arc<dyn OperationStatusStore>,
    service: String,
    config: ReconcilerConfig,
}

impl<C> AsyncReconciler<C> {
    pub fn new(
        client: C,
        store: Arc<dyn OperationStatusStore>,
        service: impl Into<String>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            client,
            store,
            service: service.into(),
            config,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn store(&self) -> &Arc<dyn OperationStatusStore> {
        &self.store
    }

    /// Service name recorded on operation conditions.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Report whether an operation is pending for the resource.
    pub async fn phase(&self, resource: &ResourceKey) -> Result<OperationPhase, ReconcileError> {
        Ok(match self.load_operation(resource).await? {
            Some(descriptor) => OperationPhase::OperationPending(descriptor),
            None => OperationPhase::NoOperation,
        })
    }

    /// Stop tracking the pending operation without polling it.
    ///
    /// The provider-side operation is not cancelled and may keep running.
    pub async fn abandon_operation(
        &self,
        resource: &ResourceKey,
    ) -> Result<Option<OperationDescriptor>, ReconcileError> {
        let pending = match self.store.get_operation(resource).await {
            Ok(pending) => pending,
            Err(StoreError::Corrupt { .. }) => None,
            Err(e) => return Err(e.into()),
        };
        if let Some(descriptor) = &pending {
            warn!(
                poll_url = %descriptor.poll.url,
                "Abandoning {} operation on {}", descriptor.kind, resource
            );
        }
        self.store.clear_operation(resource).await?;
        Ok(pending)
    }

    /// Create or update the resource described by `spec`.
    pub async fn create_resource<S>(
        &self,
        spec: &S,
    ) -> Result<Reconciled<S::Resource>, ReconcileError>
    where
        S: ResourceSpec,
        C: Creator<S>,
    {
        let resource = spec.key();

        if let Some(pending) = self.load_operation(&resource).await? {
            if pending.kind == OperationKind::Delete {
                return Err(ReconcileError::OperationInProgress {
                    resource,
                    pending: pending.kind,
                    requested: OperationKind::Create,
                });
            }
            return match self.poll(&resource, &pending).await? {
                Poll::Pending => Ok(self.pending(pending)),
                Poll::Done(Some(output)) => {
                    self.complete(&resource, pending.kind).await?;
                    Ok(Reconciled::Ready(output))
                }
                Poll::Done(None) => Err(self
                    .broken_result(
                        &resource,
                        pending.kind,
                        format!("{} completed without returning the resource", pending.kind),
                    )
                    .await),
            };
        }

        // Reading is not an operation: failures here record no condition
        let existing = match self.client.get(spec).await {
            Ok(existing) => existing,
            Err(err) if err.is_transient() => {
                warn!("Transient error reading {}: {}", resource, err);
                return Err(ReconcileError::Transient {
                    resource,
                    source: err,
                });
            }
            Err(err) => {
                error!("Failed to read {}: {}", resource, err);
                return Err(ReconcileError::Observe {
                    resource,
                    source: err,
                });
            }
        };
        let existing = match existing {
            Some(current) if spec.is_current(&current) => {
                debug!("{} is up to date", resource);
                return Ok(Reconciled::Ready(current));
            }
            other => other,
        };
        let kind = if existing.is_some() {
            OperationKind::Update
        } else {
            OperationKind::Create
        };

        info!("Starting {} of {}", kind, resource);
        match self.client.create_or_update_async(spec, existing.as_ref()).await {
            Ok(CreateOutcome::Completed(output)) => {
                self.store
                    .update_condition(&resource, OperationCondition::succeeded(&self.service, kind))
                    .await?;
                info!("{} of {} completed synchronously", kind, resource);
                Ok(Reconciled::Ready(output))
            }
            Ok(CreateOutcome::Started(descriptor)) => self.track(&resource, descriptor).await,
            Err(err) => Err(self.fail(&resource, kind, err).await),
        }
    }

    /// Delete the resource described by `spec`.
    pub async fn delete_resource<S>(&self, spec: &S) -> Result<Reconciled<()>, ReconcileError>
    where
        S: ResourceSpec,
        C: Deleter<S>,
    {
        let resource = spec.key();

        if let Some(pending) = self.load_operation(&resource).await? {
            if pending.kind != OperationKind::Delete {
                return Err(ReconcileError::OperationInProgress {
                    resource,
                    pending: pending.kind,
                    requested: OperationKind::Delete,
                });
            }
            return match self.poll(&resource, &pending).await? {
                Poll::Pending => Ok(self.pending(pending)),
                Poll::Done(_) => {
                    self.complete(&resource, pending.kind).await?;
                    Ok(Reconciled::Ready(()))
                }
            };
        }

        info!("Deleting {}", resource);
        match self.client.delete_async(spec).await {
            Ok(Some(descriptor)) => self.track(&resource, descriptor).await,
            Ok(None) => {
                self.store
                    .update_condition(
                        &resource,
                        OperationCondition::succeeded(&self.service, OperationKind::Delete),
                    )
                    .await?;
                info!("{} deleted", resource);
                Ok(Reconciled::Ready(()))
            }
            Err(err) if err.is_not_found() => {
                debug!("{} already deleted", resource);
                Ok(Reconciled::Ready(()))
            }
            Err(err) => Err(self.fail(&resource, OperationKind::Delete, err).await),
        }
    }

    async fn load_operation(
        &self,
        resource: &ResourceKey,
    ) -> Result<Option<OperationDescriptor>, ReconcileError> {
        match self.store.get_operation(resource).await {
            Ok(pending) => Ok(pending),
            Err(err @ StoreError::Corrupt { .. }) => {
                warn!("Resetting unreadable operation state of {}: {}", resource, err);
                self.store.clear_operation(resource).await?;
                Err(ReconcileError::Precondition {
                    resource: resource.clone(),
                    reason: format!("could not decode operation state, reset it: {err}"),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn poll(
        &self,
        resource: &ResourceKey,
        descriptor: &OperationDescriptor,
    ) -> Result<Poll<C::Output>, ReconcileError>
    where
        C: FutureHandler,
    {
        let done = match self.client.is_done(descriptor).await {
            Ok(done) => done,
            Err(err) => return Err(self.fail(resource, descriptor.kind, err).await),
        };
        if !done {
            debug!(
                poll_url = %descriptor.poll.url,
                "{} of {} still in progress", descriptor.kind, resource
            );
            return Ok(Poll::Pending);
        }

        match self.client.result(descriptor, descriptor.kind).await {
            Ok(output) => Ok(Poll::Done(output)),
            Err(err) => Err(self.fail(resource, descriptor.kind, err).await),
        }
    }

    /// Clear a finished operation and record its success.
    async fn complete(
        &self,
        resource: &ResourceKey,
        kind: OperationKind,
    ) -> Result<(), ReconcileError> {
        self.store.clear_operation(resource).await?;
        self.store
            .update_condition(resource, OperationCondition::succeeded(&self.service, kind))
            .await?;
        info!("{} of {} completed", kind, resource);
        Ok(())
    }

    /// The client reported completion but returned an unusable outcome. The
    /// operation is cleared and recorded as failed.
    async fn broken_result(
        &self,
        resource: &ResourceKey,
        kind: OperationKind,
        reason: String,
    ) -> ReconcileError {
        error!("{} of {} finished without a usable result: {}", kind, resource, reason);
        if let Err(e) = self.store.clear_operation(resource).await {
            return e.into();
        }
        let condition = OperationCondition::failed(&self.service, kind, reason.clone());
        if let Err(e) = self.store.update_condition(resource, condition).await {
            return e.into();
        }
        ReconcileError::Precondition {
            resource: resource.clone(),
            reason,
        }
    }

    async fn track<T>(
        &self,
        resource: &ResourceKey,
        descriptor: OperationDescriptor,
    ) -> Result<Reconciled<T>, ReconcileError> {
        self.store.set_operation(resource, &descriptor).await?;
        self.store
            .update_condition(
                resource,
                OperationCondition::in_progress(&self.service, descriptor.kind),
            )
            .await?;
        info!(
            poll_url = %descriptor.poll.url,
            "{} of {} in progress", descriptor.kind, resource
        );
        Ok(self.pending(descriptor))
    }

    fn pending<T>(&self, operation: OperationDescriptor) -> Reconciled<T> {
        Reconciled::Pending {
            operation,
            requeue_after: self.config.poll_interval,
        }
    }

    /// Classify a client error. Terminal failures clear the pending operation
    /// and are recorded on the resource; transient ones leave it untouched.
    async fn fail(
        &self,
        resource: &ResourceKey,
        kind: OperationKind,
        err: ClientError,
    ) -> ReconcileError {
        match err {
            err if err.is_transient() => {
                warn!("Transient error during {} of {}: {}", kind, resource, err);
                ReconcileError::Transient {
                    resource: resource.clone(),
                    source: err,
                }
            }
            ClientError::NotDone => ReconcileError::Precondition {
                resource: resource.clone(),
                reason: format!("{kind} result requested before the operation completed"),
            },
            ClientError::InvalidDescriptor(reason) => {
                warn!("Resetting unusable {} operation on {}: {}", kind, resource, reason);
                if let Err(e) = self.store.clear_operation(resource).await {
                    return e.into();
                }
                ReconcileError::Precondition {
                    resource: resource.clone(),
                    reason: format!("unusable {kind} operation state, reset it: {reason}"),
                }
            }
            err => {
                error!("{} of {} failed: {}", kind, resource, err);
                if let Err(e) = self.store.clear_operation(resource).await {
                    return e.into();
                }
                let condition = OperationCondition::failed(&self.service, kind, err.to_string());
                if let Err(e) = self.store.update_condition(resource, condition).await {
                    return e.into();
                }
                ReconcileError::Terminal {
                    resource: resource.clone(),
                    kind,
                    source: err,
                }
            }
        }
    }
}

#[async_trait]
impl<S, C> Reconciler<S> for AsyncReconciler<C>
where
    S: ResourceSpec + 'static,
    C: Creator<S> + Deleter<S>,
{
    async fn create_resource(&self, spec: &S) -> Result<Reconciled<S::Resource>, ReconcileError> {
        AsyncReconciler::create_resource(self, spec).await
    }

    async fn delete_resource(&self, spec: &S) -> Result<Reconciled<()>, ReconcileError> {
        AsyncReconciler::delete_resource(self, spec).await
    }
}
