//! Error types for provider clients, status stores and the reconciler.

use std::time::Duration;

use thiserror::Error;

use crate::future::{OperationKind, ResourceKey};

/// Errors raised by an [`OperationStatusStore`](crate::OperationStatusStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Persisted operation state could not be decoded.
    #[error("invalid operation state for {resource}: {reason}")]
    Corrupt { resource: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backing storage failed.
    #[error("storage backend: {0}")]
    Backend(String),
}

/// Errors raised by provider clients.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The target resource does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The provider refused the request (validation, quota, authorization).
    #[error("request rejected by provider ({code}): {message}")]
    Rejected { code: String, message: String },

    /// The operation ran and ended in failure.
    #[error("operation failed ({code}): {message}")]
    OperationFailed { code: String, message: String },

    /// Network failure, timeout or throttling. Safe to retry.
    #[error("transient provider error: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// `result` was called before the operation reached a terminal state.
    #[error("operation has not completed")]
    NotDone,

    /// The descriptor does not carry what this client needs to poll.
    #[error("invalid operation descriptor: {0}")]
    InvalidDescriptor(String),
}

impl ClientError {
    pub fn transient(message: impl Into<String>) -> Self {
        ClientError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transient { .. })
    }

    /// Provider-requested delay before retrying, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ClientError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Errors returned from a reconciliation pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Not retried here. The descriptor has been cleared so a later pass can
    /// start over if the desired state still differs.
    #[error("failed to {kind} {resource}: {source}")]
    Terminal {
        resource: ResourceKey,
        kind: OperationKind,
        #[source]
        source: ClientError,
    },

    /// Reading the observed resource failed for a non-transient reason. No
    /// operation was started and nothing is recorded on the resource.
    #[error("failed to read {resource}: {source}")]
    Observe {
        resource: ResourceKey,
        #[source]
        source: ClientError,
    },

    /// The persisted descriptor is left intact and re-polled next pass.
    #[error("transient error reconciling {resource}: {source}")]
    Transient {
        resource: ResourceKey,
        #[source]
        source: ClientError,
    },

    /// A different operation is already pending for the resource.
    #[error("{resource} has a pending {pending} operation, refusing to start {requested}")]
    OperationInProgress {
        resource: ResourceKey,
        pending: OperationKind,
        requested: OperationKind,
    },

    /// A client or store broke its contract.
    #[error("contract violation for {resource}: {reason}")]
    Precondition {
        resource: ResourceKey,
        reason: String,
    },

    #[error("operation status store: {0}")]
    Store(#[from] StoreError),
}

impl ReconcileError {
    /// Whether an identical pass may succeed later without intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReconcileError::Transient { .. } | ReconcileError::Store(StoreError::Backend(_))
        )
    }

    /// Backoff requested by the provider for retryable errors.
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            ReconcileError::Transient { source, .. } => source.retry_after(),
            _ => None,
        }
    }

    pub fn resource(&self) -> Option<&ResourceKey> {
        match self {
            ReconcileError::Terminal { resource, .. }
            | ReconcileError::Observe { resource, .. }
            | ReconcileError::Transient { resource, .. }
            | ReconcileError::OperationInProgress { resource, .. }
            | ReconcileError::Precondition { resource, .. } => Some(resource),
            ReconcileError::Store(_) => None,
        }
    }
}
