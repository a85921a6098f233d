use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use wsm_orchestrator::{ActivityConfig, MonitorConfig, OrchestratorConfig};
use wsm_provider::{InfrastructureConfig, RetryPolicy};

/// Service settings. Every field falls back to a `WSM_*` environment variable,
/// then to a built-in default.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_snapshot_repository")]
    pub snapshot_repository: String,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// 0 disables idle expiry.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// 0 disables the run timeout.
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,

    #[serde(default = "default_create_timeout")]
    pub create_timeout_secs: u64,

    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    #[serde(default = "default_snapshot_timeout")]
    pub snapshot_timeout_secs: u64,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_handler_workers")]
    pub handler_workers: usize,

    #[serde(default = "default_event_queue")]
    pub event_queue: usize,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn default_bind_addr() -> String {
    std::env::var("WSM_API_BIND").unwrap_or_else(|_| "0.0.0.0:3131".to_string())
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("WSM_API_DB_PATH") {
        return PathBuf::from(path);
    }

    if cfg!(windows) {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(appdata).join("wsm").join("api").join("wsm.db")
    } else {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".wsm").join("api").join("wsm.db")
    }
}

fn default_provider() -> String {
    std::env::var("WSM_PROVIDER").unwrap_or_else(|_| "docker".to_string())
}

fn default_snapshot_repository() -> String {
    std::env::var("WSM_SNAPSHOT_REPOSITORY").unwrap_or_else(|_| "wsm-snapshots".to_string())
}

fn default_sweep_interval() -> u64 {
    env_or("WSM_ACTIVITY_SWEEP_INTERVAL", 5)
}

fn default_idle_timeout() -> u64 {
    env_or("WSM_IDLE_TIMEOUT", 30 * 60)
}

fn default_run_timeout() -> u64 {
    env_or("WSM_RUN_TIMEOUT", 0)
}

fn default_create_timeout() -> u64 {
    env_or("WSM_CREATE_TIMEOUT", 300)
}

fn default_stop_timeout() -> u64 {
    env_or("WSM_STOP_TIMEOUT", 120)
}

fn default_snapshot_timeout() -> u64 {
    env_or("WSM_SNAPSHOT_TIMEOUT", 600)
}

fn default_retry_attempts() -> u32 {
    env_or("WSM_RETRY_ATTEMPTS", 3)
}

fn default_handler_workers() -> usize {
    env_or("WSM_HANDLER_WORKERS", 4)
}

fn default_event_queue() -> usize {
    env_or("WSM_EVENT_QUEUE", 256)
}

fn secs_or_disabled(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            provider: default_provider(),
            snapshot_repository: default_snapshot_repository(),
            sweep_interval_secs: default_sweep_interval(),
            idle_timeout_secs: default_idle_timeout(),
            run_timeout_secs: default_run_timeout(),
            create_timeout_secs: default_create_timeout(),
            stop_timeout_secs: default_stop_timeout(),
            snapshot_timeout_secs: default_snapshot_timeout(),
            retry_attempts: default_retry_attempts(),
            handler_workers: default_handler_workers(),
            event_queue: default_event_queue(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn infrastructure(&self) -> InfrastructureConfig {
        InfrastructureConfig::new(&self.provider)
            .with_snapshot_repository(&self.snapshot_repository)
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            create_timeout: Duration::from_secs(self.create_timeout_secs),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            snapshot_timeout: Duration::from_secs(self.snapshot_timeout_secs),
            retry: RetryPolicy::default().with_max_attempts(self.retry_attempts),
            event_capacity: self.event_queue,
        }
    }

    pub fn activity(&self) -> ActivityConfig {
        ActivityConfig {
            idle_timeout: secs_or_disabled(self.idle_timeout_secs),
            run_timeout: secs_or_disabled(self.run_timeout_secs),
            // A zero period would make tokio's interval panic.
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
        }
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            workers: self.handler_workers.max(1),
            queue: self.event_queue.max(1),
            ..MonitorConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeouts_disable_expiry() {
        let config = Config {
            idle_timeout_secs: 0,
            run_timeout_secs: 0,
            sweep_interval_secs: 0,
            ..Config::default()
        };

        let activity = config.activity();
        assert_eq!(activity.idle_timeout, None);
        assert_eq!(activity.run_timeout, None);
        assert_eq!(activity.sweep_interval, Duration::from_secs(1));
    }

    #[test]
    fn orchestrator_settings_follow_config() {
        let config = Config {
            create_timeout_secs: 30,
            stop_timeout_secs: 10,
            snapshot_timeout_secs: 60,
            retry_attempts: 0,
            event_queue: 16,
            ..Config::default()
        };

        let orchestrator = config.orchestrator();
        assert_eq!(orchestrator.create_timeout, Duration::from_secs(30));
        assert_eq!(orchestrator.stop_timeout, Duration::from_secs(10));
        assert_eq!(orchestrator.snapshot_timeout, Duration::from_secs(60));
        assert_eq!(orchestrator.retry.max_attempts, 1);
        assert_eq!(orchestrator.event_capacity, 16);
        assert_eq!(config.monitor().queue, 16);
    }

    #[test]
    fn infrastructure_uses_provider_and_repository() {
        let config = Config {
            provider: "podman".to_string(),
            snapshot_repository: "registry.local/snaps".to_string(),
            ..Config::default()
        };

        let infra = config.infrastructure();
        assert_eq!(infra.provider, "podman");
        assert_eq!(infra.snapshot_repository, "registry.local/snaps");
    }
}
