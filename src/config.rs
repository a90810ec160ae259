// config.rs - Platform configuration surface
//
//! Recognized options, all optional with defaults, loadable from the
//! process environment (`COORD_REQ_TIMEOUT=3`) and an optional TOML file.

use std::path::Path;
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

/// DF lookup mode for the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DfMode {
    /// Query the single required capability
    #[default]
    Need,
    /// Query everything live, then fall back to the capability query
    All,
}

impl<'de> Deserialize<'de> for DfMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.to_ascii_uppercase().as_str() {
            "NEED" => Ok(DfMode::Need),
            "ALL" => Ok(DfMode::All),
            other => Err(D::Error::custom(format!("unknown DF mode: {other:?}"))),
        }
    }
}

impl std::fmt::Display for DfMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DfMode::Need => "NEED",
            DfMode::All => "ALL",
        })
    }
}

/// Every knob the control plane reads
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Coordinator request wait, seconds
    pub coord_req_timeout: f64,

    /// Total specialist attempts per conversation
    pub coord_max_retries: u32,

    /// Max in-flight conversations
    pub coord_max_concurrency: usize,

    /// Cleanup grace window after the final reply, seconds
    pub coord_conv_grace_sec: f64,

    /// DF lookup mode
    pub coord_df_mode: DfMode,

    /// Max timeline entries kept per session
    pub coord_history_len: usize,

    /// KB reply wait, seconds
    pub coord_kb_timeout: f64,

    /// Required specialist capability
    pub need_cap: String,

    /// Presenter reply wait, seconds
    pub presenter_timeout: f64,

    /// DF heartbeat period, seconds
    pub df_heartbeat_sec: f64,

    /// Removal threshold multiplier over the heartbeat period
    pub df_ttl_multiplier: u32,

    /// DF garbage-collection period, seconds
    pub df_cleanup_period: f64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            coord_req_timeout: 10.0,
            coord_max_retries: 2,
            coord_max_concurrency: 5,
            coord_conv_grace_sec: 0.5,
            coord_df_mode: DfMode::Need,
            coord_history_len: 10,
            coord_kb_timeout: 5.0,
            need_cap: "ASK_EXPERT".to_string(),
            presenter_timeout: 15.0,
            df_heartbeat_sec: 30.0,
            df_ttl_multiplier: 3,
            df_cleanup_period: 10.0,
        }
    }
}

impl PlatformConfig {
    /// Environment-only load
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::load(None)
    }

    /// Optional TOML file layered under the environment
    pub fn load(file: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }
        builder
            .add_source(config::Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn req_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.coord_req_timeout)
    }

    pub fn kb_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.coord_kb_timeout)
    }

    pub fn conv_grace(&self) -> Duration {
        Duration::from_secs_f64(self.coord_conv_grace_sec)
    }

    pub fn presenter_wait(&self) -> Duration {
        Duration::from_secs_f64(self.presenter_timeout)
    }

    /// Correlation expectation TTL: request timeout plus slack
    pub fn corr_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.coord_req_timeout + 2.0)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs_f64(self.df_heartbeat_sec)
    }

    pub fn cleanup_period(&self) -> Duration {
        Duration::from_secs_f64(self.df_cleanup_period)
    }

    /// Seconds after the last heartbeat a profile still counts as alive
    pub fn alive_window_sec(&self) -> f64 {
        self.df_heartbeat_sec * 2.0
    }

    /// Seconds after the last heartbeat a profile is removed
    pub fn removal_ttl_sec(&self) -> f64 {
        self.df_heartbeat_sec * f64::from(self.df_ttl_multiplier)
    }
}
