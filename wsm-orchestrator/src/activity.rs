//! Workspace activity tracking and idle expiry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::machine::{Machine, MachineState};
use crate::orchestrator::MachineOrchestrator;

#[derive(Debug, Clone)]
pub struct ActivityConfig {
    /// Default idle timeout for tracked workspaces; `None` never expires.
    pub idle_timeout: Option<Duration>,
    /// Maximum running time regardless of activity.
    pub run_timeout: Option<Duration>,
    pub sweep_interval: Duration,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(30 * 60)),
            run_timeout: None,
            sweep_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceActivityRecord {
    pub workspace_id: String,
    pub last_active: Instant,
    pub last_active_at: DateTime<Utc>,
    pub idle_timeout: Option<Duration>,
    pub running_since: Option<Instant>,
    /// Disarmed records are skipped by the sweep until re-armed.
    pub armed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    Idle,
    RunTimeout,
}

/// A sweep hit, still subject to [`ActivityTracker::confirm`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiry {
    pub workspace_id: String,
    pub reason: ExpiryReason,
    /// Last activity the sweep saw.
    pub observed: Instant,
}

pub struct ActivityTracker {
    records: Mutex<HashMap<String, WorkspaceActivityRecord>>,
    config: ActivityConfig,
}

impl ActivityTracker {
    pub fn new(config: ActivityConfig) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &ActivityConfig {
        &self.config
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, WorkspaceActivityRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn entry<'a>(
        &self,
        records: &'a mut HashMap<String, WorkspaceActivityRecord>,
        workspace_id: &str,
        now: Instant,
    ) -> &'a mut WorkspaceActivityRecord {
        records
            .entry(workspace_id.to_string())
            .or_insert_with(|| WorkspaceActivityRecord {
                workspace_id: workspace_id.to_string(),
                last_active: now,
                last_active_at: Utc::now(),
                idle_timeout: self.config.idle_timeout,
                running_since: None,
                armed: true,
            })
    }

    pub fn record_activity(&self, workspace_id: &str) {
        self.record_activity_at(workspace_id, Instant::now());
    }

    /// Reset the idle countdown. An older timestamp never moves it back.
    pub fn record_activity_at(&self, workspace_id: &str, at: Instant) {
        let mut records = self.records();
        let record = self.entry(&mut records, workspace_id, at);
        if at > record.last_active {
            record.last_active = at;
            record.last_active_at = Utc::now();
        }
        record.armed = true;
    }

    /// Start counting for a workspace whose machine is running.
    ///
    /// `idle_timeout` overrides the configured default.
    pub fn track(&self, workspace_id: &str, idle_timeout: Option<Duration>) {
        let now = Instant::now();
        let mut records = self.records();
        let record = self.entry(&mut records, workspace_id, now);
        if now > record.last_active {
            record.last_active = now;
            record.last_active_at = Utc::now();
        }
        record.running_since = Some(now);
        record.idle_timeout = idle_timeout.or(self.config.idle_timeout);
        record.armed = true;
        debug!(workspace_id, "Tracking workspace activity");
    }

    /// Stop expiring a workspace that no longer runs. Its last activity is kept.
    pub fn untrack(&self, workspace_id: &str) {
        if let Some(record) = self.records().get_mut(workspace_id) {
            record.running_since = None;
            record.armed = false;
        }
    }

    pub fn forget(&self, workspace_id: &str) {
        self.records().remove(workspace_id);
    }

    pub fn get(&self, workspace_id: &str) -> Option<WorkspaceActivityRecord> {
        self.records().get(workspace_id).cloned()
    }

    /// Collect and disarm every expired record.
    pub fn sweep(&self, now: Instant) -> Vec<Expiry> {
        let mut expired = Vec::new();

        for record in self.records().values_mut().filter(|r| r.armed) {
            let idle = record
                .idle_timeout
                .is_some_and(|timeout| now.saturating_duration_since(record.last_active) >= timeout);
            let overran = match (self.config.run_timeout, record.running_since) {
                (Some(limit), Some(since)) => now.saturating_duration_since(since) >= limit,
                _ => false,
            };

            let reason = if idle {
                ExpiryReason::Idle
            } else if overran {
                ExpiryReason::RunTimeout
            } else {
                continue;
            };

            record.armed = false;
            expired.push(Expiry {
                workspace_id: record.workspace_id.clone(),
                reason,
                observed: record.last_active,
            });
        }

        expired
    }

    /// Whether an expiry still holds: no newer activity for idle expiries,
    /// still running for run timeouts.
    pub fn confirm(&self, expiry: &Expiry) -> bool {
        self.records()
            .get(&expiry.workspace_id)
            .is_some_and(|record| match expiry.reason {
                ExpiryReason::Idle => record.last_active <= expiry.observed,
                ExpiryReason::RunTimeout => record.running_since.is_some(),
            })
    }

    /// Let the next sweep fire again for this workspace.
    pub fn rearm(&self, workspace_id: &str) {
        if let Some(record) = self.records().get_mut(workspace_id) {
            record.armed = true;
        }
    }
}

/// Receiver of confirmed expiries.
#[async_trait]
pub trait IdleTimeoutHandler: Send + Sync + 'static {
    async fn on_idle_timeout(&self, workspace_id: &str) -> Result<Option<Machine>>;
}

#[async_trait]
impl IdleTimeoutHandler for MachineOrchestrator {
    async fn on_idle_timeout(&self, workspace_id: &str) -> Result<Option<Machine>> {
        MachineOrchestrator::on_idle_timeout(self, workspace_id).await
    }
}

/// Sweep every `interval` and hand confirmed expiries to `handler`.
pub fn spawn_sweeper<H>(tracker: Arc<ActivityTracker>, handler: H, interval: Duration) -> JoinHandle<()>
where
    H: IdleTimeoutHandler + Clone,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            for expiry in tracker.sweep(Instant::now()) {
                let tracker = tracker.clone();
                let handler = handler.clone();
                tokio::spawn(async move { expire(&tracker, &handler, expiry).await });
            }
        }
    })
}

async fn expire<H: IdleTimeoutHandler>(tracker: &ActivityTracker, handler: &H, expiry: Expiry) {
    let workspace_id = expiry.workspace_id.as_str();

    if !tracker.confirm(&expiry) {
        debug!(workspace_id, "Activity after sweep, expiry cancelled");
        return;
    }

    info!(workspace_id, reason = ?expiry.reason, "Workspace expired");
    match handler.on_idle_timeout(workspace_id).await {
        Ok(Some(machine)) => info!(workspace_id, machine_id = %machine.id, "Expired workspace stopped"),
        Ok(None) => debug!(workspace_id, "Expired workspace had no running machine"),
        Err(e) if e.is_stale_state() => debug!(workspace_id, "Expired workspace changed state: {}", e),
        Err(e) => {
            error!(workspace_id, "Failed to stop expired workspace: {}", e);
            tracker.rearm(workspace_id);
        }
    }
}

/// Keep the tracker in step with machine state changes.
///
/// A workspace stays tracked while any of its machines runs. It is
/// untracked once none does, and forgotten once it has no machines left.
pub fn follow(tracker: Arc<ActivityTracker>, orchestrator: MachineOrchestrator) -> JoinHandle<()> {
    let mut events = orchestrator.subscribe();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match event.state {
                    MachineState::Running => tracker.track(&event.workspace_id, None),
                    MachineState::Stopped
                    | MachineState::Crashed
                    | MachineState::Failed
                    | MachineState::Removed => {
                        settle(&tracker, &orchestrator, &event.workspace_id)
                    }
                    MachineState::Creating | MachineState::Stopping => {}
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Activity tracker fell behind machine events")
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn settle(tracker: &ActivityTracker, orchestrator: &MachineOrchestrator, workspace_id: &str) {
    match orchestrator.machine_for_workspace(workspace_id) {
        Some(machine) if machine.state == MachineState::Running => {
            debug!(workspace_id, machine_id = %machine.id, "Workspace still has a running machine");
        }
        Some(_) => tracker.untrack(workspace_id),
        None => {
            tracker.forget(workspace_id);
            debug!(workspace_id, "Workspace has no machines, activity forgotten");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_secs(60);

    fn tracker() -> ActivityTracker {
        ActivityTracker::new(ActivityConfig {
            idle_timeout: Some(T),
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_fires_once_per_idle_period() {
        let tracker = tracker();
        let t0 = Instant::now();
        tracker.record_activity_at("w1", t0);

        assert!(tracker.sweep(t0 + T - Duration::from_secs(1)).is_empty());
        let hits = tracker.sweep(t0 + T);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].reason, ExpiryReason::Idle);
        assert!(tracker.sweep(t0 + T * 2).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn older_activity_does_not_rewind_countdown() {
        let tracker = tracker();
        let t0 = Instant::now();
        tracker.record_activity_at("w1", t0 + Duration::from_secs(30));
        tracker.record_activity_at("w1", t0);

        assert_eq!(
            tracker.get("w1").unwrap().last_active,
            t0 + Duration::from_secs(30)
        );
        assert!(tracker.sweep(t0 + T).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn newer_activity_cancels_pending_expiry() {
        let tracker = tracker();
        let t0 = Instant::now();
        tracker.record_activity_at("w1", t0);

        let hit = tracker.sweep(t0 + T).pop().unwrap();
        tracker.record_activity_at("w1", t0 + T);
        assert!(!tracker.confirm(&hit));

        // The activity re-armed the record with a fresh countdown.
        assert!(tracker.sweep(t0 + T + T / 2).is_empty());
        assert_eq!(tracker.sweep(t0 + T * 2).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn untracked_workspace_is_not_swept_until_rearmed() {
        let tracker = tracker();
        tracker.track("w1", None);
        tracker.untrack("w1");

        let later = Instant::now() + T * 2;
        assert!(tracker.sweep(later).is_empty());
        tracker.rearm("w1");
        assert_eq!(tracker.sweep(later).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_timeout_ignores_activity() {
        let tracker = ActivityTracker::new(ActivityConfig {
            idle_timeout: None,
            run_timeout: Some(T),
            ..Default::default()
        });
        let t0 = Instant::now();
        tracker.track("w1", None);
        tracker.record_activity_at("w1", t0 + T);

        let hits = tracker.sweep(t0 + T);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].reason, ExpiryReason::RunTimeout);
        assert!(tracker.confirm(&hits[0]));
    }

    #[tokio::test]
    async fn forget_drops_record() {
        let tracker = tracker();
        tracker.record_activity("w1");
        tracker.forget("w1");
        assert!(tracker.get("w1").is_none());
    }
}
