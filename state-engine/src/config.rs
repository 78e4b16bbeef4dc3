//! Engine runtime configuration.

use serde::Deserialize;
use serde::Serialize;

/// Default minimum session timeout, in milliseconds.
pub const DEFAULT_SESSION_TIMEOUT_MIN: u64 = 250;
/// Default maximum session timeout, in milliseconds.
pub const DEFAULT_SESSION_TIMEOUT_MAX: u64 = 300_000;
/// Default threshold of applied entries between snapshots.
pub const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 5000;
/// Default cap on unacknowledged event batches queued per session.
pub const DEFAULT_MAX_PENDING_EVENT_BATCHES: usize = 1024;

/// Log compaction and snapshot policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    /// A snapshot will be generated once the log has grown the specified
    /// number of entries since the last snapshot.
    LogsSinceLast(u64),
}

/// The runtime configuration for the state machine engine.
///
/// The default values used by this type should generally work well, but will
/// need to be tuned to the storage and workload of specific deployments.
///
/// ```
/// use state_engine::Config;
///
/// let config = Config::build("primary-engine".into())
///     .snapshot_policy(state_engine::SnapshotPolicy::LogsSinceLast(1000))
///     .validate()
///     .expect("failed to build engine config");
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this engine's cluster.
    pub cluster_name: String,
    /// The minimum session timeout honored for REGISTER entries, in milliseconds.
    pub session_timeout_min: u64,
    /// The maximum session timeout honored for REGISTER entries, in milliseconds.
    pub session_timeout_max: u64,
    /// The snapshot policy to use for a Raft log.
    pub snapshot_policy: SnapshotPolicy,
    /// The maximum number of unacknowledged event batches queued per session.
    ///
    /// A session over this cap is marked suspicious; the engine never removes
    /// a session on its own.
    pub max_pending_event_batches: usize,
}

impl Config {
    /// Start the builder process for a new `Config` instance.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            session_timeout_min: None,
            session_timeout_max: None,
            snapshot_policy: None,
            max_pending_event_batches: None,
        }
    }

    /// Clamp a requested session timeout into the configured bounds.
    pub fn clamp_session_timeout(&self, requested: u64) -> u64 {
        requested.max(self.session_timeout_min).min(self.session_timeout_max)
    }
}

/// A configuration builder to ensure that runtime config is valid.
#[derive(Debug)]
pub struct ConfigBuilder {
    cluster_name: String,
    session_timeout_min: Option<u64>,
    session_timeout_max: Option<u64>,
    snapshot_policy: Option<SnapshotPolicy>,
    max_pending_event_batches: Option<usize>,
}

impl ConfigBuilder {
    /// Set the minimum session timeout, in milliseconds.
    pub fn session_timeout_min(mut self, val: u64) -> Self {
        self.session_timeout_min = Some(val);
        self
    }

    /// Set the maximum session timeout, in milliseconds.
    pub fn session_timeout_max(mut self, val: u64) -> Self {
        self.session_timeout_max = Some(val);
        self
    }

    /// Set the snapshot policy.
    pub fn snapshot_policy(mut self, val: SnapshotPolicy) -> Self {
        self.snapshot_policy = Some(val);
        self
    }

    /// Set the cap on unacknowledged event batches queued per session.
    pub fn max_pending_event_batches(mut self, val: usize) -> Self {
        self.max_pending_event_batches = Some(val);
        self
    }

    /// Validate the state of this builder, returning a config object.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let session_timeout_min = self.session_timeout_min.unwrap_or(DEFAULT_SESSION_TIMEOUT_MIN);
        let session_timeout_max = self.session_timeout_max.unwrap_or(DEFAULT_SESSION_TIMEOUT_MAX);
        if session_timeout_min == 0 {
            return Err(ConfigError::InvalidSessionTimeout);
        }
        if session_timeout_min > session_timeout_max {
            return Err(ConfigError::InvalidSessionTimeout);
        }

        let snapshot_policy =
            self.snapshot_policy.unwrap_or(SnapshotPolicy::LogsSinceLast(DEFAULT_SNAPSHOT_THRESHOLD));
        let SnapshotPolicy::LogsSinceLast(threshold) = &snapshot_policy;
        if *threshold == 0 {
            return Err(ConfigError::InvalidSnapshotPolicy);
        }

        let max_pending_event_batches =
            self.max_pending_event_batches.unwrap_or(DEFAULT_MAX_PENDING_EVENT_BATCHES);
        if max_pending_event_batches == 0 {
            return Err(ConfigError::InvalidEventQueueCap);
        }

        Ok(Config {
            cluster_name: self.cluster_name,
            session_timeout_min,
            session_timeout_max,
            snapshot_policy,
            max_pending_event_batches,
        })
    }
}

/// A configuration error.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    /// The session timeout bounds are invalid.
    #[error("session timeout bounds must satisfy 0 < min <= max")]
    InvalidSessionTimeout,
    /// The snapshot policy is invalid.
    #[error("snapshot policy threshold must be greater than 0")]
    InvalidSnapshotPolicy,
    /// The per-session event queue cap is invalid.
    #[error("max pending event batches must be greater than 0")]
    InvalidEventQueueCap,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::build("test".into()).validate().unwrap();
        assert_eq!(cfg.cluster_name, "test");
        assert_eq!(cfg.session_timeout_min, DEFAULT_SESSION_TIMEOUT_MIN);
        assert_eq!(cfg.session_timeout_max, DEFAULT_SESSION_TIMEOUT_MAX);
        assert_eq!(cfg.snapshot_policy, SnapshotPolicy::LogsSinceLast(DEFAULT_SNAPSHOT_THRESHOLD));
    }

    #[test]
    fn test_invalid_session_timeout_bounds() {
        let res = Config::build("test".into()).session_timeout_min(5000).session_timeout_max(100).validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidSessionTimeout);

        let res = Config::build("test".into()).session_timeout_min(0).validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidSessionTimeout);
    }

    #[test]
    fn test_invalid_snapshot_policy() {
        let res = Config::build("test".into()).snapshot_policy(SnapshotPolicy::LogsSinceLast(0)).validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidSnapshotPolicy);
    }

    #[test]
    fn test_clamp_session_timeout() {
        let cfg = Config::build("test".into()).session_timeout_min(100).session_timeout_max(1000).validate().unwrap();
        assert_eq!(cfg.clamp_session_timeout(5), 100);
        assert_eq!(cfg.clamp_session_timeout(500), 500);
        assert_eq!(cfg.clamp_session_timeout(100_000), 1000);
    }
}
