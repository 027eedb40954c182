//! Telemetry source selection

use crate::config::{AgentConfig, SourceKind};
use anyhow::Result;
use telemetry_lib::collector::{ProcfsSource, SourceSet, TcpInfoSource, TelemetrySource};
use tracing::{info, warn};

/// Build the source the collector attaches to
pub async fn build_source(config: &AgentConfig) -> Result<Box<dyn TelemetrySource>> {
    match config.source {
        SourceKind::Procfs => Ok(Box::new(procfs_sources(config).await)),
        SourceKind::Bpf => bpf_source(config),
    }
}

/// Procfs counters, plus socket RTT sampling when `ss` is usable.
/// Without it the node still reports retransmits, drops and runqueue
/// latency, but no RTT.
pub async fn procfs_sources(config: &AgentConfig) -> SourceSet {
    let mut set = SourceSet::new().with(Box::new(ProcfsSource::new(
        &config.proc_root,
        config.source_poll_interval(),
    )));

    if config.tcp_info.enabled {
        let sampler = TcpInfoSource::new(&config.tcp_info.ss_path, config.tcp_info.poll_interval());
        match sampler.probe().await {
            Ok(()) => set = set.with(Box::new(sampler)),
            Err(e) => warn!(
                ss_path = %config.tcp_info.ss_path.display(),
                error = %e,
                "Socket RTT sampling unavailable"
            ),
        }
    }

    info!(sources = ?set.names(), "Telemetry sources selected");
    set
}

#[cfg(feature = "bpf")]
fn bpf_source(config: &AgentConfig) -> Result<Box<dyn TelemetrySource>> {
    info!(object = %config.bpf_object.display(), "Using BPF telemetry source");
    Ok(Box::new(telemetry_lib::collector::BpfSource::new(
        &config.bpf_object,
    )))
}

#[cfg(not(feature = "bpf"))]
fn bpf_source(_config: &AgentConfig) -> Result<Box<dyn TelemetrySource>> {
    anyhow::bail!("source = \"bpf\" requires telemetry-agent built with the bpf feature")
}
