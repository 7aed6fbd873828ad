//! Operation state persisted in the owning resource's status.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::future::{OperationDescriptor, OperationKind, ResourceKey};

/// Progress of the latest operation a service ran against a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionStatus {
    InProgress,
    Succeeded,
    Failed,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::InProgress => "in_progress",
            ConditionStatus::Succeeded => "succeeded",
            ConditionStatus::Failed => "failed",
        }
    }
}

/// Condition recorded on the resource status for one reconciling service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationCondition {
    pub service: String,
    pub kind: OperationKind,
    pub status: ConditionStatus,
    pub message: Option<String>,
    pub last_transition: DateTime<Utc>,
}

impl OperationCondition {
    fn new(
        service: &str,
        kind: OperationKind,
        status: ConditionStatus,
        message: Option<String>,
    ) -> Self {
        Self {
            service: service.to_string(),
            kind,
            status,
            message,
            last_transition: Utc::now(),
        }
    }

    pub fn in_progress(service: &str, kind: OperationKind) -> Self {
        Self::new(service, kind, ConditionStatus::InProgress, None)
    }

    pub fn succeeded(service: &str, kind: OperationKind) -> Self {
        Self::new(service, kind, ConditionStatus::Succeeded, None)
    }

    pub fn failed(service: &str, kind: OperationKind, message: impl Into<String>) -> Self {
        Self::new(service, kind, ConditionStatus::Failed, Some(message.into()))
    }
}

/// Status fields owned by the async machinery for a single resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    /// At most one pending operation per resource.
    pub operation: Option<OperationDescriptor>,
    /// Latest condition per service.
    #[serde(default)]
    pub conditions: BTreeMap<String, OperationCondition>,
}

impl ResourceStatus {
    pub fn condition(&self, service: &str) -> Option<&OperationCondition> {
        self.conditions.get(service)
    }

    fn set_condition(&mut self, condition: OperationCondition) {
        self.conditions.insert(condition.service.clone(), condition);
    }
}

/// Persists operation descriptors against the resource that owns them.
///
/// Implementations must be durable: a descriptor written in one pass has to be
/// readable after a process restart.
#[async_trait]
pub trait OperationStatusStore: Send + Sync {
    /// Get the pending operation for a resource, if any.
    async fn get_operation(
        &self,
        resource: &ResourceKey,
    ) -> Result<Option<OperationDescriptor>, StoreError>;

    /// Record a newly started operation.
    async fn set_operation(
        &self,
        resource: &ResourceKey,
        descriptor: &OperationDescriptor,
    ) -> Result<(), StoreError>;

    /// Forget the pending operation. Clearing an absent operation is a no-op.
    async fn clear_operation(&self, resource: &ResourceKey) -> Result<(), StoreError>;

    /// Record the latest condition for the condition's service.
    async fn update_condition(
        &self,
        resource: &ResourceKey,
        condition: OperationCondition,
    ) -> Result<(), StoreError>;
}

/// In-memory store for embedding in a framework that persists
/// [`ResourceStatus`] itself, and for tests.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    statuses: RwLock<HashMap<ResourceKey, ResourceStatus>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current status of a resource.
    pub async fn status(&self, resource: &ResourceKey) -> Option<ResourceStatus> {
        self.statuses.read().await.get(resource).cloned()
    }
}

#[async_trait]
impl OperationStatusStore for MemoryStatusStore {
    async fn get_operation(
        &self,
        resource: &ResourceKey,
    ) -> Result<Option<OperationDescriptor>, StoreError> {
        Ok(self
            .statuses
            .read()
            .await
            .get(resource)
            .and_then(|s| s.operation.clone()))
    }

    async fn set_operation(
        &self,
        resource: &ResourceKey,
        descriptor: &OperationDescriptor,
    ) -> Result<(), StoreError> {
        let mut statuses = self.statuses.write().await;
        statuses.entry(resource.clone()).or_default().operation = Some(descriptor.clone());
        Ok(())
    }

    async fn clear_operation(&self, resource: &ResourceKey) -> Result<(), StoreError> {
        if let Some(status) = self.statuses.write().await.get_mut(resource) {
            status.operation = None;
        }
        Ok(())
    }

    async fn update_condition(
        &self,
        resource: &ResourceKey,
        condition: OperationCondition,
    ) -> Result<(), StoreError> {
        let mut statuses = self.statuses.write().await;
        statuses
            .entry(resource.clone())
            .or_default()
            .set_condition(condition);
        Ok(())
    }
}
