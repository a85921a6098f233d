//! Parsing of the container runtime's event stream.
//!
//! Docker prints `{{json .}}` events with `Action`/`Actor` fields while Podman's
//! `--format json` uses `Status`/`Attributes`. Both shapes are accepted.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::spec::{InstanceEvent, InstanceEventKind, MACHINE_LABEL};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEvent {
    Docker(DockerEvent),
    Podman(PodmanEvent),
}

#[derive(Debug, Deserialize)]
struct DockerEvent {
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(rename = "Action")]
    action: String,
    #[serde(rename = "Actor")]
    actor: DockerActor,
    #[serde(rename = "timeNano", default)]
    time_nano: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct DockerActor {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct PodmanEvent {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
    #[serde(rename = "ContainerExitCode", default)]
    exit_code: Option<i64>,
    #[serde(rename = "Time", default)]
    time: Option<String>,
    #[serde(rename = "timeNano", default)]
    time_nano: Option<i64>,
}

fn event_kind(action: &str) -> Option<InstanceEventKind> {
    match action {
        "die" | "died" => Some(InstanceEventKind::Died),
        "oom" => Some(InstanceEventKind::OutOfMemory),
        _ => None,
    }
}

/// Parse one line of the event stream.
///
/// Returns `None` for events that are not container deaths or that belong to
/// containers this service did not create.
pub fn parse_event_line(line: &str) -> Option<InstanceEvent> {
    let raw: RawEvent = serde_json::from_str(line.trim()).ok()?;

    let (kind, action, id, attributes, exit_code, at) = match raw {
        RawEvent::Docker(e) => {
            let exit_code = e
                .actor
                .attributes
                .get("exitCode")
                .and_then(|c| c.parse().ok());
            let at = e.time_nano.map(DateTime::from_timestamp_nanos);
            (e.kind, e.action, e.actor.id, e.actor.attributes, exit_code, at)
        }
        RawEvent::Podman(e) => {
            let at = e.time_nano.map(DateTime::from_timestamp_nanos).or_else(|| {
                e.time
                    .as_deref()
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.with_timezone(&Utc))
            });
            (e.kind, e.status, e.id, e.attributes, e.exit_code, at)
        }
    };

    if !kind.is_empty() && kind != "container" {
        return None;
    }

    let event_kind = event_kind(&action)?;
    let machine_id = attributes.get(MACHINE_LABEL)?.clone();

    Some(InstanceEvent {
        machine_id,
        instance_id: id,
        kind: event_kind,
        exit_code: match event_kind {
            InstanceEventKind::Died => exit_code,
            InstanceEventKind::OutOfMemory => None,
        },
        at,
    })
}
