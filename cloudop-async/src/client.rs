//! Capabilities a provider client can offer to the reconciler.
//!
//! A client implements only what its resource supports: a read-only resource
//! implements neither [`Creator`] nor [`Deleter`].

use async_trait::async_trait;

use crate::error::ClientError;
use crate::future::{OperationDescriptor, OperationKind, ResourceKey};

/// Desired state of a provider resource for one reconciliation pass.
pub trait ResourceSpec: Send + Sync {
    /// Resource as observed at the provider.
    type Resource: Send + Sync;
    /// Request body sent to create or update the resource.
    type Parameters: Send;

    fn key(&self) -> ResourceKey;

    /// Whether the observed resource already matches this spec.
    fn is_current(&self, existing: &Self::Resource) -> bool;

    /// Request body for a create (no `existing`) or an update merged over
    /// `existing`.
    fn parameters(&self, existing: Option<&Self::Resource>) -> Self::Parameters;
}

/// Result of starting a create or update.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome<R> {
    /// The provider finished the call synchronously.
    Completed(R),
    /// The provider accepted the call; poll the descriptor.
    Started(OperationDescriptor),
}

/// Polls operations started by this client.
#[async_trait]
pub trait FutureHandler: Send + Sync {
    /// Payload returned by a finished create or update.
    type Output: Send;

    /// Poll the provider once. `Ok(false)` means still running.
    async fn is_done(&self, future: &OperationDescriptor) -> Result<bool, ClientError>;

    /// Fetch the terminal outcome. Only valid after `is_done` returned true;
    /// fails with [`ClientError::NotDone`] otherwise. Delete operations yield
    /// `None`.
    async fn result(
        &self,
        future: &OperationDescriptor,
        kind: OperationKind,
    ) -> Result<Option<Self::Output>, ClientError>;
}

/// Creates or updates resources asynchronously.
#[async_trait]
pub trait Creator<S: ResourceSpec>: FutureHandler<Output = S::Resource> {
    /// Read the observed resource, `None` when it does not exist.
    async fn get(&self, spec: &S) -> Result<Option<S::Resource>, ClientError>;

    /// Start a create (no `existing`) or update of the resource.
    async fn create_or_update_async(
        &self,
        spec: &S,
        existing: Option<&S::Resource>,
    ) -> Result<CreateOutcome<S::Resource>, ClientError>;
}

/// Deletes resources asynchronously.
#[async_trait]
pub trait Deleter<S: ResourceSpec>: FutureHandler {
    /// Start deleting the resource. `Ok(None)` when the deletion finished
    /// synchronously or the resource was already gone.
    async fn delete_async(&self, spec: &S) -> Result<Option<OperationDescriptor>, ClientError>;
}
