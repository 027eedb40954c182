//! Collector attach/detach lifecycle
//!
//! Attaching allocates a fresh set of maps, binds the handlers to them and
//! starts the instrumentation source. Detaching stops the source and
//! releases the maps; nothing relies on process exit for cleanup.

use super::maps::{MapsConfig, TelemetryMaps};
use super::probes::{KernelEvent, SamplingPolicy, TelemetryProgram};
use super::CollectorError;
use crate::health::{components, HealthRegistry};
use crate::models::{NodeId, TelemetryEvent};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Default diagnostic ring capacity in events
pub const DEFAULT_RING_CAPACITY: usize = 4096;

/// How often the agent checks that the source is still running
pub const SOURCE_WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Delivers raw kernel events into the collector program
#[async_trait]
pub trait TelemetrySource: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Verify the source can be attached; failures are setup errors
    async fn probe(&self) -> Result<(), CollectorError>;

    /// Feed events into `program` until `shutdown` fires
    async fn run(
        self: Box<Self>,
        program: Arc<TelemetryProgram>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), CollectorError>;
}

/// Configuration for one collector attachment
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub local_node: NodeId,
    pub maps: MapsConfig,
    pub ring_capacity: usize,
    pub sampling: SamplingPolicy,
}

impl CollectorConfig {
    pub fn new(local_node: NodeId) -> Self {
        Self {
            local_node,
            maps: MapsConfig::default(),
            ring_capacity: DEFAULT_RING_CAPACITY,
            sampling: SamplingPolicy::default(),
        }
    }
}

/// Entry point for attaching the collector
pub struct Collector;

impl Collector {
    /// Attach `source` to a freshly allocated set of maps.
    ///
    /// Returns the handle owning the attachment and the receiving end of
    /// the diagnostic event stream.
    pub async fn attach(
        config: CollectorConfig,
        source: Box<dyn TelemetrySource>,
    ) -> Result<(CollectorHandle, mpsc::Receiver<TelemetryEvent>), CollectorError> {
        let source_name = source.name();
        source.probe().await?;

        let maps = Arc::new(TelemetryMaps::new(&config.maps));
        let (ring_tx, ring_rx) = mpsc::channel(config.ring_capacity.max(1));
        let program = Arc::new(TelemetryProgram::new(
            maps.clone(),
            ring_tx,
            config.local_node,
            config.sampling,
        ));

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let liveness = SourceLiveness::new();
        let alive = liveness.guard();
        let task = tokio::spawn({
            let program = program.clone();
            async move {
                // Dropped on return and on panic alike
                let _alive = alive;
                source.run(program, shutdown_rx).await
            }
        });

        info!(
            source = source_name,
            node_id = %config.local_node,
            max_nodes = config.maps.max_nodes,
            "Collector attached"
        );

        Ok((
            CollectorHandle {
                maps,
                program,
                source_name,
                shutdown_tx,
                liveness,
                task: Some(task),
            },
            ring_rx,
        ))
    }
}

/// Owns one attachment; dropping it without `detach` aborts the source
pub struct CollectorHandle {
    maps: Arc<TelemetryMaps>,
    program: Arc<TelemetryProgram>,
    source_name: &'static str,
    shutdown_tx: broadcast::Sender<()>,
    liveness: SourceLiveness,
    task: Option<JoinHandle<Result<(), CollectorError>>>,
}

impl CollectorHandle {
    pub fn maps(&self) -> Arc<TelemetryMaps> {
        self.maps.clone()
    }

    pub fn program(&self) -> Arc<TelemetryProgram> {
        self.program.clone()
    }

    pub fn source_name(&self) -> &'static str {
        self.source_name
    }

    pub fn is_running(&self) -> bool {
        self.liveness.is_running()
    }

    /// Shareable view of whether the source task is still alive
    pub fn liveness(&self) -> SourceLiveness {
        self.liveness.clone()
    }

    /// Stop the source and release the maps
    pub async fn detach(mut self) -> Result<(), CollectorError> {
        let _ = self.shutdown_tx.send(());
        let result = match self.task.take() {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => Err(CollectorError::Source(format!("source task failed: {}", e))),
            },
            None => Ok(()),
        };
        match &result {
            Ok(()) => info!(source = self.source_name, "Collector detached"),
            Err(e) => warn!(source = self.source_name, error = %e, "Collector detached with error"),
        }
        result
    }
}

impl Drop for CollectorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            if !task.is_finished() {
                debug!(source = self.source_name, "Collector handle dropped, aborting source");
                task.abort();
            }
        }
    }
}

/// Tracks whether a source task is alive
#[derive(Debug, Clone)]
pub struct SourceLiveness(Arc<AtomicBool>);

struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SourceLiveness {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    fn guard(&self) -> AliveGuard {
        AliveGuard(self.0.clone())
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Mark the collector unhealthy as soon as its source stops.
///
/// Returns when the source stops or `shutdown` fires; a source stopping
/// after shutdown is expected and leaves health alone.
pub async fn watch_source(
    liveness: SourceLiveness,
    source_name: &'static str,
    health: HealthRegistry,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !liveness.is_running() {
                    error!(source = source_name, "Telemetry source stopped");
                    health
                        .set_unhealthy(
                            components::COLLECTOR,
                            format!("telemetry source {} stopped", source_name),
                        )
                        .await;
                    return;
                }
            }
            _ = shutdown.recv() => return,
        }
    }
}

/// Several sources feeding one program. Each must probe successfully;
/// the set stops as soon as any member stops.
#[derive(Default)]
pub struct SourceSet {
    sources: Vec<Box<dyn TelemetrySource>>,
}

impl SourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: Box<dyn TelemetrySource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[async_trait]
impl TelemetrySource for SourceSet {
    fn name(&self) -> &'static str {
        "source_set"
    }

    async fn probe(&self) -> Result<(), CollectorError> {
        if self.sources.is_empty() {
            return Err(CollectorError::Attach("no telemetry sources configured".to_string()));
        }
        for source in &self.sources {
            source.probe().await?;
        }
        Ok(())
    }

    async fn run(
        self: Box<Self>,
        program: Arc<TelemetryProgram>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), CollectorError> {
        let mut members = JoinSet::new();
        for source in self.sources {
            let name = source.name();
            let program = program.clone();
            let member_shutdown = shutdown.resubscribe();
            members.spawn(async move { (name, source.run(program, member_shutdown).await) });
        }

        let first = match members.join_next().await {
            Some(Ok((name, result))) => {
                debug!(source = name, "Source set member stopped");
                result
            }
            Some(Err(e)) => Err(CollectorError::Source(format!("source task failed: {}", e))),
            None => return Ok(()),
        };

        if shutdown.try_recv().is_ok() {
            while let Some(joined) = members.join_next().await {
                if let Ok((name, Err(e))) = joined {
                    warn!(source = name, error = %e, "Source stopped with error");
                }
            }
        } else {
            // One member gone means the set is no longer whole
            members.abort_all();
        }
        first
    }
}

/// Source fed through a channel, e.g. by an in-kernel probe loader
pub struct ChannelSource {
    rx: mpsc::Receiver<KernelEvent>,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<KernelEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { rx }, tx)
    }
}

#[async_trait]
impl TelemetrySource for ChannelSource {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn probe(&self) -> Result<(), CollectorError> {
        Ok(())
    }

    async fn run(
        mut self: Box<Self>,
        program: Arc<TelemetryProgram>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), CollectorError> {
        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => program.handle(&event),
                    None => {
                        debug!("Channel source closed by sender");
                        return Ok(());
                    }
                },
                _ = shutdown.recv() => return Ok(()),
            }
        }
    }
}
