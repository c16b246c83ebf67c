//! Configuration for the broker and worker processes
//!
//! Everything comes from environment variables per the deployment contract;
//! the broker additionally accepts its port as a positional argument. Timing
//! knobs are plain config fields with production defaults so tests can
//! shrink them.

use crate::domain_types::{AgentId, AgentName, PollIntervalMs};
use reqwest::Url;
use std::time::Duration;
use thiserror::Error;

/// Default broker listen port.
pub const DEFAULT_BROKER_PORT: u16 = 4800;

/// Default broker endpoint for workers.
pub const DEFAULT_BROKER_URL: &str = "http://localhost:4800";

/// Worker heartbeat period.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

/// Broker reaper tick period.
pub const REAPER_PERIOD: Duration = Duration::from_secs(30);

/// Staleness threshold for reaping: three heartbeat periods.
pub const STALE_AGENT_THRESHOLD: Duration = Duration::from_secs(90);

/// Hard timeout on every worker RPC.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Shorter timeout for the best-effort deregister during shutdown.
pub const DEREGISTER_TIMEOUT: Duration = Duration::from_secs(3);

/// How long shutdown waits for an in-flight processing pass.
pub const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

/// Worker configuration errors; all fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid broker url {url}: {reason}")]
    InvalidBrokerUrl { url: String, reason: String },
}

/// Broker process configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub port: u16,
    pub reaper_period: Duration,
    pub stale_threshold: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_BROKER_PORT,
            reaper_period: REAPER_PERIOD,
            stale_threshold: STALE_AGENT_THRESHOLD,
        }
    }
}

impl BrokerConfig {
    /// Resolves the port from `BROKER_PORT`, then the positional argument,
    /// then the default.
    pub fn from_env(port_arg: Option<u16>) -> Self {
        let port = std::env::var("BROKER_PORT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .or(port_arg)
            .unwrap_or(DEFAULT_BROKER_PORT);
        Self {
            port,
            ..Self::default()
        }
    }
}

/// Worker process configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub broker_url: Url,
    pub agent_id: AgentId,
    pub agent_name: AgentName,
    pub project: String,
    pub path: String,
    pub auto_process: bool,
    pub poll_interval: PollIntervalMs,
    pub heartbeat_period: Duration,
    pub fetch_timeout: Duration,
    pub deregister_timeout: Duration,
    pub shutdown_drain: Duration,
}

impl WorkerConfig {
    /// Reads the worker environment. Only a malformed `BROKER_URL` is
    /// fatal; every other variable falls back to its default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw_url =
            std::env::var("BROKER_URL").unwrap_or_else(|_| DEFAULT_BROKER_URL.to_string());
        let broker_url = parse_broker_url(&raw_url)?;

        let raw_id = std::env::var("AGENT_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(default_agent_id);
        let agent_id = AgentId::try_new(sanitize_agent_id(&raw_id))
            .unwrap_or_else(|_| AgentId::try_new("agent".to_string()).expect("literal id is valid"));

        let agent_name = std::env::var("AGENT_NAME")
            .ok()
            .and_then(|v| AgentName::try_new(v).ok())
            .unwrap_or_else(|| {
                AgentName::try_new(format!("SP-{agent_id}")).expect("derived name is non-empty")
            });

        let project = std::env::var("PROJECT_NAME").unwrap_or_else(|_| "unknown".to_string());
        let path = std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let auto_process = std::env::var("AUTO_PROCESS")
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        // Anything unparsable or below one second falls back to the default.
        let poll_interval = std::env::var("POLL_INTERVAL_MS")
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .and_then(|ms| PollIntervalMs::try_new(ms).ok())
            .unwrap_or_default();

        Ok(Self {
            broker_url,
            agent_id,
            agent_name,
            project,
            path,
            auto_process,
            poll_interval,
            heartbeat_period: HEARTBEAT_PERIOD,
            fetch_timeout: FETCH_TIMEOUT,
            deregister_timeout: DEREGISTER_TIMEOUT,
            shutdown_drain: SHUTDOWN_DRAIN,
        })
    }
}

/// Parses and validates the broker endpoint; only http/https are accepted.
pub fn parse_broker_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidBrokerUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::InvalidBrokerUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {other}"),
        }),
    }
}

/// Lowercases an agent id and replaces anything outside `[a-z0-9-]`.
pub fn sanitize_agent_id(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn default_agent_id() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "agent".to_string())
}
