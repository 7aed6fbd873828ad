//! Desired state read from a JSON manifest.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use cloudop_async::{ResourceKey, ResourceSpec};
use cloudop_hooks::Hook;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub resources: Vec<ResourceEntry>,
    #[serde(default)]
    pub extensions: Vec<ExtensionEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    #[default]
    Present,
    Absent,
}

/// One resource the agent keeps in its desired state.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceEntry {
    /// Provider resource type, e.g. `Microsoft.Network/virtualNetworks`
    #[serde(rename = "type")]
    pub resource_type: String,
    pub group: String,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub state: DesiredState,
}

impl ResourceEntry {
    /// Entry that only identifies a resource, used to delete resources that
    /// dropped out of the manifest.
    pub fn absent(key: &ResourceKey) -> Self {
        Self {
            resource_type: key.resource_type.clone(),
            group: key.group.clone(),
            name: key.name.clone(),
            location: None,
            properties: Map::new(),
            state: DesiredState::Absent,
        }
    }
}

/// A resource as the provider reports it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderResource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl ProviderResource {
    pub fn provisioning_state(&self) -> Option<&str> {
        self.properties
            .get("provisioningState")
            .and_then(Value::as_str)
    }
}

impl ResourceSpec for ResourceEntry {
    type Resource = ProviderResource;
    type Parameters = Value;

    fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.resource_type, &self.group, &self.name)
    }

    /// Current when every listed property matches; unlisted properties are
    /// owned by the provider.
    fn is_current(&self, existing: &ProviderResource) -> bool {
        if self.location.is_some() && existing.location != self.location {
            return false;
        }
        self.properties
            .iter()
            .all(|(k, v)| existing.properties.get(k) == Some(v))
    }

    fn parameters(&self, existing: Option<&ProviderResource>) -> Value {
        let mut properties = existing
            .map(|r| r.properties.clone())
            .unwrap_or_default();
        properties.remove("provisioningState");
        properties.extend(self.properties.clone());

        let mut body = Map::new();
        if let Some(location) = self
            .location
            .clone()
            .or_else(|| existing.and_then(|r| r.location.clone()))
        {
            body.insert("location".to_string(), Value::String(location));
        }
        body.insert("properties".to_string(), Value::Object(properties));
        Value::Object(body)
    }
}

/// An HTTP extension called for lifecycle hooks.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionEntry {
    pub name: String,
    pub url: String,
    pub hooks: Vec<Hook>,
}

impl Manifest {
    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.resources {
            if entry.resource_type.is_empty() || entry.group.is_empty() || entry.name.is_empty() {
                bail!("Resource entries need a type, group and name");
            }
            if !seen.insert(entry.key()) {
                bail!("Resource {} is listed more than once", entry.key());
            }
        }

        let mut names = HashSet::new();
        for ext in &self.extensions {
            if !names.insert(ext.name.as_str()) {
                bail!("Extension {} is listed more than once", ext.name);
            }
        }
        Ok(())
    }
}

pub async fn load(path: &Path) -> Result<Manifest> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    parse(&data).with_context(|| format!("Invalid manifest {}", path.display()))
}

fn parse(data: &str) -> Result<Manifest> {
    let manifest: Manifest = serde_json::from_str(data)?;
    manifest.validate()?;
    Ok(manifest)
}
