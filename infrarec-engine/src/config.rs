//! Engine configuration.
//!
//! `EngineConfig` derives `clap::Args` so a front end can flatten it into
//! its own command line, and `Deserialize` for file-based configuration.

use std::time::Duration;

use clap::Args;
use serde::Deserialize;

use crate::poller::PollConfig;
use crate::schema::ObjectKind;

/// Tunables shared by every reconciliation in a session.
#[derive(Debug, Clone, PartialEq, Eq, Args, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Poll timeout in seconds, overriding each kind's default
    #[arg(long = "poll-timeout", env = "INFRAREC_POLL_TIMEOUT")]
    pub poll_timeout_secs: Option<u64>,

    /// First delay between poll reads in milliseconds
    #[arg(long = "poll-initial-interval", env = "INFRAREC_POLL_INITIAL_INTERVAL_MS")]
    pub poll_initial_interval_ms: Option<u64>,

    /// Upper bound of the poll delay in milliseconds
    #[arg(long = "poll-max-interval", env = "INFRAREC_POLL_MAX_INTERVAL_MS")]
    pub poll_max_interval_ms: Option<u64>,

    /// Plan against the caller's last-known state without reading the object first
    #[arg(long, env = "INFRAREC_SKIP_REFRESH")]
    pub skip_refresh: bool,

    /// Attempts per page when a list call fails transiently
    #[arg(long, env = "INFRAREC_LIST_RETRY_ATTEMPTS", default_value_t = 3)]
    pub list_retry_attempts: u32,

    /// Instances reconciled concurrently by a fleet apply
    #[arg(long, env = "INFRAREC_MAX_PARALLEL", default_value_t = 8)]
    pub max_parallel: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_timeout_secs: None,
            poll_initial_interval_ms: None,
            poll_max_interval_ms: None,
            skip_refresh: false,
            list_retry_attempts: 3,
            max_parallel: 8,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON configuration document; missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Poll parameters for `kind`: the kind's defaults with overrides applied.
    pub fn poll_config_for(&self, kind: &ObjectKind) -> PollConfig {
        let defaults = kind.poll_defaults();
        PollConfig {
            timeout: self
                .poll_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            initial_interval: self
                .poll_initial_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_interval),
            max_interval: self
                .poll_max_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_interval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::drg;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        engine: EngineConfig,
    }

    #[test]
    fn test_defaults_match_cli_defaults() {
        let cli = Cli::parse_from(["infrarec"]);
        assert_eq!(cli.engine.list_retry_attempts, 3);
        assert_eq!(cli.engine.max_parallel, 8);
        assert_eq!(cli.engine, EngineConfig::default());
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "infrarec",
            "--poll-timeout",
            "30",
            "--poll-max-interval",
            "2000",
            "--skip-refresh",
        ]);
        assert_eq!(cli.engine.poll_timeout_secs, Some(30));
        assert_eq!(cli.engine.poll_max_interval_ms, Some(2000));
        assert!(cli.engine.skip_refresh);
    }

    #[test]
    fn test_json_partial() {
        let config = EngineConfig::from_json(r#"{ "poll_timeout_secs": 45 }"#).unwrap();
        assert_eq!(config.poll_timeout_secs, Some(45));
        assert_eq!(config.list_retry_attempts, 3);
    }

    #[test]
    fn test_poll_config_overrides_kind_defaults() {
        let kind = drg();
        let config = EngineConfig {
            poll_timeout_secs: Some(60),
            ..EngineConfig::default()
        };
        let poll = config.poll_config_for(&kind);
        assert_eq!(poll.timeout, Duration::from_secs(60));
        assert_eq!(poll.initial_interval, kind.poll_defaults().initial_interval);
        assert_eq!(poll.max_interval, kind.poll_defaults().max_interval);
    }
}
