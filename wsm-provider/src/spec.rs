//! Provider-neutral machine descriptions and snapshot keys.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Label carrying the orchestrator's machine id on every container we create.
pub const MACHINE_LABEL: &str = "wsm.machine";
/// Label carrying the owning workspace id.
pub const WORKSPACE_LABEL: &str = "wsm.workspace";

/// What to run: image (or recipe-built image), limits and environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MachineSpec {
    pub image: String,

    #[serde(default)]
    pub memory_limit_mb: Option<u64>,

    #[serde(default)]
    pub cpu_limit: Option<f64>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Command override; empty keeps the image default.
    #[serde(default)]
    pub command: Vec<String>,
}

impl MachineSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = Some(mb);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Identity of the instance an adapter call provisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceTarget {
    pub machine_id: String,
    pub workspace_id: String,
    /// Provider-side name; stable before the provider assigns an id.
    pub name: String,
}

impl InstanceTarget {
    pub fn new(machine_id: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        let machine_id = machine_id.into();
        Self {
            name: format!("wsm-{machine_id}"),
            machine_id,
            workspace_id: workspace_id.into(),
        }
    }
}

/// Result of a successful create or restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedInstance {
    pub name: String,
    pub instance_id: String,
}

/// Opaque, provider-specific address of a stored snapshot.
///
/// The field set depends on the provider (the Docker adapter uses
/// `repository`, `tag` and `digest`). Keys are never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct InstanceKey(BTreeMap<String, String>);

impl InstanceKey {
    pub fn new<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceEventKind {
    Died,
    OutOfMemory,
}

/// Out-of-band notification pushed by the provider's monitoring channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceEvent {
    pub machine_id: String,
    pub instance_id: String,
    pub kind: InstanceEventKind,
    pub exit_code: Option<i64>,
    /// When the provider saw it happen, if it said.
    pub at: Option<DateTime<Utc>>,
}

impl InstanceEvent {
    pub fn died(machine_id: impl Into<String>, instance_id: impl Into<String>, exit_code: Option<i64>) -> Self {
        Self {
            machine_id: machine_id.into(),
            instance_id: instance_id.into(),
            kind: InstanceEventKind::Died,
            exit_code,
            at: None,
        }
    }

    pub fn out_of_memory(machine_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            instance_id: instance_id.into(),
            kind: InstanceEventKind::OutOfMemory,
            exit_code: None,
            at: None,
        }
    }

    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self
    }
}
