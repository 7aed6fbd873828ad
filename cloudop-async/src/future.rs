//! Serializable record of an in-flight provider operation.
//!
//! A descriptor round-trips through durable storage between reconciliation
//! passes, so it carries everything needed to re-issue a poll: the poll URL,
//! the method of the request that started the operation, and an opaque
//! provider payload.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Identifies a provider resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Provider resource type, e.g. `Microsoft.Network/virtualNetworks`.
    pub resource_type: String,
    /// Resource group (or equivalent scope) holding the resource.
    pub group: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(
        resource_type: impl Into<String>,
        group: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            group: group.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.resource_type, self.group, self.name)
    }
}

/// What the provider operation does to the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP method of the request that started the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    Put,
    Patch,
    Post,
    Delete,
}

/// Where and how to poll a pending operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollTarget {
    pub method: RequestMethod,
    /// URL that reports the operation's status.
    pub url: String,
    /// Provider-specific payload, opaque to the reconciler.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl PollTarget {
    pub fn new(method: RequestMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// An operation started against the provider and not yet finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    pub kind: OperationKind,
    pub resource_type: String,
    pub resource_name: String,
    pub poll: PollTarget,
    pub started_at: DateTime<Utc>,
}

impl OperationDescriptor {
    pub fn new(kind: OperationKind, resource: &ResourceKey, poll: PollTarget) -> Self {
        Self {
            kind,
            resource_type: resource.resource_type.clone(),
            resource_name: resource.name.clone(),
            poll,
            started_at: Utc::now(),
        }
    }

    /// Encode for storage in the owning resource's status.
    pub fn encode(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a descriptor previously produced by [`encode`](Self::encode).
    pub fn decode(resource: &ResourceKey, data: &str) -> Result<Self, StoreError> {
        serde_json::from_str(data).map_err(|e| StoreError::Corrupt {
            resource: resource.to_string(),
            reason: e.to_string(),
        })
    }
}
