use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use wsm_provider::{InstanceKey, InstanceTarget, MachineSpec};

/// Lifecycle state of a machine.
///
/// `creating -> running -> stopping -> stopped -> removed`, with
/// `running -> crashed` on abnormal stop and `failed` reachable from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    Creating,
    Running,
    Stopping,
    Stopped,
    Crashed,
    Removed,
    Failed,
}

impl MachineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
            Self::Removed => "removed",
            Self::Failed => "failed",
        }
    }

    /// Whether the machine still holds provider resources that need a remove.
    pub fn is_removable(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Crashed)
    }

    /// Creating, running or stopping. A workspace has at most one such machine.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Creating | Self::Running | Self::Stopping)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MachineState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "crashed" => Ok(Self::Crashed),
            "removed" => Ok(Self::Removed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown machine state '{other}'")),
        }
    }
}

/// A provisioned compute unit backing one workspace.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Machine {
    pub id: String,
    pub workspace_id: String,
    /// Provider-side name, known before the provider assigns an id.
    pub name: String,
    pub provider: String,
    pub instance_id: Option<String>,
    /// Snapshot the machine was restored from, or the last one taken of it.
    pub instance_key: Option<InstanceKey>,
    pub state: MachineState,
    pub spec: MachineSpec,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the machine last entered `running`.
    #[serde(default)]
    pub running_since: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Machine {
    pub(crate) fn new(target: &InstanceTarget, provider: &str, spec: MachineSpec) -> Self {
        let now = Utc::now();
        Self {
            id: target.machine_id.clone(),
            workspace_id: target.workspace_id.clone(),
            name: target.name.clone(),
            provider: provider.to_string(),
            instance_id: None,
            instance_key: None,
            state: MachineState::Creating,
            spec,
            created_at: now,
            updated_at: now,
            running_since: None,
            error: None,
        }
    }

    /// Reference the provider understands: its id when known, else the name.
    pub fn instance_ref(&self) -> &str {
        self.instance_id.as_deref().unwrap_or(&self.name)
    }
}

/// Where a new machine's filesystem comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineSource {
    /// Fresh instance from the spec's image.
    Spec,
    /// Explicit restore; a missing snapshot is an error.
    Snapshot(InstanceKey),
    /// The workspace's latest stored snapshot, falling back to the spec.
    Recover,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StartMachineRequest {
    pub workspace_id: String,
    pub spec: MachineSpec,

    /// Restore from this snapshot instead of the spec's image.
    #[serde(default)]
    pub snapshot: Option<InstanceKey>,

    /// Restore from the workspace's latest snapshot when one exists.
    #[serde(default)]
    pub recover: bool,

    /// Deadline for create + start, in seconds.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

impl StartMachineRequest {
    pub fn new(workspace_id: impl Into<String>, spec: MachineSpec) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            spec,
            snapshot: None,
            recover: false,
            deadline_secs: None,
        }
    }

    pub fn from_snapshot(mut self, key: InstanceKey) -> Self {
        self.snapshot = Some(key);
        self
    }

    pub fn recover(mut self) -> Self {
        self.recover = true;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_secs = Some(deadline.as_secs());
        self
    }

    pub fn source(&self) -> MachineSource {
        match (&self.snapshot, self.recover) {
            (Some(key), _) => MachineSource::Snapshot(key.clone()),
            (None, true) => MachineSource::Recover,
            (None, false) => MachineSource::Spec,
        }
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, ToSchema)]
pub struct StopOptions {
    /// Take a snapshot before stopping; a failed snapshot aborts the stop.
    #[serde(default)]
    pub snapshot: bool,

    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

impl StopOptions {
    pub fn with_snapshot() -> Self {
        Self {
            snapshot: true,
            deadline_secs: None,
        }
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct MachineFilter {
    pub workspace_id: Option<String>,
    pub state: Option<MachineState>,
}

impl MachineFilter {
    pub fn matches(&self, machine: &Machine) -> bool {
        self.workspace_id
            .as_ref()
            .map_or(true, |ws| &machine.workspace_id == ws)
            && self.state.map_or(true, |state| machine.state == state)
    }
}

/// State change published by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineEvent {
    pub machine_id: String,
    pub workspace_id: String,
    pub state: MachineState,
    pub error: Option<String>,
}

impl MachineEvent {
    pub(crate) fn of(machine: &Machine) -> Self {
        Self {
            machine_id: machine.id.clone(),
            workspace_id: machine.workspace_id.clone(),
            state: machine.state,
            error: machine.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_strings() {
        for state in [
            MachineState::Creating,
            MachineState::Running,
            MachineState::Stopping,
            MachineState::Stopped,
            MachineState::Crashed,
            MachineState::Removed,
            MachineState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<MachineState>(), Ok(state));
        }
        assert!("paused".parse::<MachineState>().is_err());
    }

    #[test]
    fn request_source_prefers_explicit_snapshot() {
        let key = InstanceKey::new([("repository", "r"), ("tag", "t")]);
        let req = StartMachineRequest::new("w1", MachineSpec::new("img"))
            .recover()
            .from_snapshot(key.clone());
        assert_eq!(req.source(), MachineSource::Snapshot(key));

        let req = StartMachineRequest::new("w1", MachineSpec::new("img")).recover();
        assert_eq!(req.source(), MachineSource::Recover);
    }

    #[test]
    fn filter_matches_on_all_given_fields() {
        let target = InstanceTarget::new("m1", "w1");
        let mut machine = Machine::new(&target, "mock", MachineSpec::new("img"));
        machine.state = MachineState::Running;

        assert!(MachineFilter::default().matches(&machine));
        assert!(MachineFilter {
            workspace_id: Some("w1".into()),
            state: Some(MachineState::Running),
        }
        .matches(&machine));
        assert!(!MachineFilter {
            workspace_id: Some("w2".into()),
            state: None,
        }
        .matches(&machine));
    }

    #[test]
    fn instance_ref_falls_back_to_name() {
        let target = InstanceTarget::new("m1", "w1");
        let mut machine = Machine::new(&target, "mock", MachineSpec::new("img"));
        assert_eq!(machine.instance_ref(), "wsm-m1");
        machine.instance_id = Some("abc123".into());
        assert_eq!(machine.instance_ref(), "abc123");
    }
}
