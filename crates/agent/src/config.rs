//! Agent configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use telemetry_lib::collector::{MapsConfig, MAX_NODES};
use telemetry_lib::estimator::AgentLoopConfig;
use telemetry_lib::NodeId;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "NETSCHED_CONFIG";

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name from the downward API, falling back to the hostname
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Explicit node id, bypassing the persisted/derived one
    #[serde(default)]
    pub node_id: Option<u32>,

    /// Where the assigned node id is persisted
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// API server port for metrics and health
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_export_interval")]
    pub export_interval_secs: u64,

    /// Upper bound on one wait for diagnostic events
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,

    /// Capacity of the per-node tables
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,

    /// Age after which an unpaired wake-up is discarded
    #[serde(default = "default_wakeup_ttl")]
    pub wakeup_ttl_ms: u64,

    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,

    /// Which kernel telemetry source feeds the collector
    #[serde(default)]
    pub source: SourceKind,

    /// How often the procfs source re-reads its counters
    #[serde(default = "default_source_poll_interval")]
    pub source_poll_interval_ms: u64,

    /// Compiled kernel programs for the `bpf` source
    #[serde(default = "default_bpf_object")]
    pub bpf_object: PathBuf,

    /// Socket RTT sampling alongside the procfs source
    #[serde(default)]
    pub tcp_info: TcpInfoConfig,

    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Kernel counters under `proc_root`, plus `tcp_info` RTT sampling
    #[default]
    Procfs,
    /// In-kernel programs loaded from `bpf_object`
    Bpf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TcpInfoConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_ss_path")]
    pub ss_path: PathBuf,

    #[serde(default = "default_source_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for TcpInfoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ss_path: default_ss_path(),
            poll_interval_ms: default_source_poll_interval(),
        }
    }
}

impl TcpInfoConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_ss_path() -> PathBuf {
    PathBuf::from("ss")
}

fn default_bpf_object() -> PathBuf {
    PathBuf::from("/usr/lib/netsched/netsched.bpf.o")
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME")
        .ok()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/netsched")
}

fn default_api_port() -> u16 {
    9100
}

fn default_export_interval() -> u64 {
    5
}

fn default_poll_timeout() -> u64 {
    100
}

fn default_max_nodes() -> usize {
    MAX_NODES
}

fn default_wakeup_ttl() -> u64 {
    5000
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_source_poll_interval() -> u64 {
    1000
}

impl AgentConfig {
    /// Load configuration from the optional config file and `AGENT_*`
    /// environment variables, the latter taking precedence
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(&path));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("AGENT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read agent configuration")?;

        let config: AgentConfig = config
            .try_deserialize()
            .context("Invalid agent configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.max_nodes > 0, "max_nodes must be positive");
        anyhow::ensure!(
            self.export_interval_secs > 0,
            "export_interval_secs must be positive"
        );
        anyhow::ensure!(self.poll_timeout_ms > 0, "poll_timeout_ms must be positive");
        anyhow::ensure!(self.wakeup_ttl_ms > 0, "wakeup_ttl_ms must be positive");
        anyhow::ensure!(
            self.source_poll_interval_ms > 0,
            "source_poll_interval_ms must be positive"
        );
        anyhow::ensure!(
            !self.tcp_info.enabled || self.tcp_info.poll_interval_ms > 0,
            "tcp_info.poll_interval_ms must be positive"
        );
        if let Some(id) = self.node_id {
            anyhow::ensure!(
                (id as usize) < self.max_nodes,
                "node_id {} outside table capacity {}",
                id,
                self.max_nodes
            );
        }
        Ok(())
    }

    pub fn maps_config(&self) -> MapsConfig {
        MapsConfig {
            max_nodes: self.max_nodes,
            wakeup_ttl: Duration::from_millis(self.wakeup_ttl_ms),
            ..MapsConfig::default()
        }
    }

    pub fn loop_config(&self, local_node: NodeId) -> AgentLoopConfig {
        AgentLoopConfig {
            export_interval: Duration::from_secs(self.export_interval_secs),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            proc_root: self.proc_root.clone(),
            ..AgentLoopConfig::new(&self.node_name, local_node)
        }
    }

    pub fn source_poll_interval(&self) -> Duration {
        Duration::from_millis(self.source_poll_interval_ms)
    }

    pub fn log_filter(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }
}
