//! Node score cache
//!
//! The cache is a sequence of immutable generations. A refresh builds a
//! complete new generation off to the side and swaps it in; readers hold
//! an `Arc` to whichever generation was current when they started, so
//! none of them ever sees a partial rebuild. Rebuilds are serialized by a
//! mutex taken with `try_lock`: a caller that finds a rebuild in flight
//! serves the current generation instead of waiting. Only `refresh` ever
//! touches that mutex; observers read the in-flight flag.

use super::filter::FilterChain;
use super::normalize::{ScoringModel, NEUTRAL_SCORE};
use super::protocol::{ExtenderArgs, ExtenderFilterResult, HostPriority, HostPriorityList};
use super::store::{fetch_node_metrics, MetricsStore};
use crate::health::{components, HealthRegistry};
use crate::models::NodeScoreEntry;
use crate::observability::{ExtenderMetrics, StructuredLogger};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    /// Nothing has ever been loaded
    Cold,
    /// First load in flight
    Warming,
    /// Current generation is within its TTL
    Warm,
    /// TTL expired; last refresh failed or has not run yet
    Stale,
}

impl CacheState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheState::Cold => "cold",
            CacheState::Warming => "warming",
            CacheState::Warm => "warm",
            CacheState::Stale => "stale",
        }
    }
}

/// One immutable cache generation
#[derive(Debug)]
pub struct CacheGeneration {
    pub entries: HashMap<String, NodeScoreEntry>,
    pub refreshed_at: DateTime<Utc>,
    loaded: Instant,
}

impl CacheGeneration {
    pub fn age(&self) -> Duration {
        self.loaded.elapsed()
    }
}

/// Result of one refresh attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Refreshed { nodes: usize },
    /// Another refresh held the lock; nothing was done
    InFlight,
    Failed(String),
}

/// Body of the cache introspection endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub state: CacheState,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub age_secs: Option<f64>,
    pub last_error: Option<String>,
    /// Sorted by node name
    pub entries: Vec<NodeScoreEntry>,
}

#[derive(Debug, Clone)]
pub struct ScorerConfig {
    pub ttl: Duration,
    pub refresh_timeout: Duration,
    pub model: ScoringModel,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            refresh_timeout: Duration::from_secs(5),
            model: ScoringModel::default(),
        }
    }
}

/// Clears the in-flight flag however the refresh ends
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn mark(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Scores nodes from a periodically refreshed view of the metrics store
pub struct NodeScorer {
    store: Arc<dyn MetricsStore>,
    config: ScorerConfig,
    current: RwLock<Option<Arc<CacheGeneration>>>,
    refresh_lock: Mutex<()>,
    refreshing: AtomicBool,
    last_attempt: RwLock<Option<Instant>>,
    last_error: RwLock<Option<String>>,
    health: HealthRegistry,
    metrics: ExtenderMetrics,
    logger: StructuredLogger,
}

impl NodeScorer {
    pub fn new(store: Arc<dyn MetricsStore>, config: ScorerConfig, health: HealthRegistry) -> Self {
        let logger = StructuredLogger::new(health.service(), "-");
        Self {
            store,
            config,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            refreshing: AtomicBool::new(false),
            last_attempt: RwLock::new(None),
            last_error: RwLock::new(None),
            health,
            metrics: ExtenderMetrics::new(),
            logger,
        }
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// The generation readers should use right now
    pub async fn generation(&self) -> Option<Arc<CacheGeneration>> {
        self.current.read().await.clone()
    }

    pub async fn state(&self) -> CacheState {
        let refreshing = self.refreshing.load(Ordering::Acquire);
        match self.generation().await {
            None if refreshing => CacheState::Warming,
            None => CacheState::Cold,
            Some(gen) if gen.age() <= self.config.ttl => CacheState::Warm,
            Some(_) => CacheState::Stale,
        }
    }

    /// Rebuild the cache from the store, bounded by the refresh timeout.
    ///
    /// On failure the current generation, including its timestamp, is left
    /// exactly as it was.
    pub async fn refresh(&self) -> RefreshOutcome {
        let Ok(_guard) = self.refresh_lock.try_lock() else {
            debug!("Cache refresh already in flight");
            return RefreshOutcome::InFlight;
        };
        let _in_flight = InFlight::mark(&self.refreshing);
        *self.last_attempt.write().await = Some(Instant::now());

        let started = Instant::now();
        let fetched = match timeout(
            self.config.refresh_timeout,
            fetch_node_metrics(self.store.as_ref()),
        )
        .await
        {
            Ok(Ok(nodes)) => nodes,
            Ok(Err(e)) => return self.refresh_failed(e.to_string()).await,
            Err(_) => {
                return self
                    .refresh_failed(format!(
                        "refresh timed out after {:?}",
                        self.config.refresh_timeout
                    ))
                    .await
            }
        };

        let now = Utc::now();
        let entries: HashMap<String, NodeScoreEntry> = fetched
            .into_iter()
            .map(|(node_name, raw)| {
                let normalized = self.config.model.normalize(&raw);
                let entry = NodeScoreEntry {
                    node_name: node_name.clone(),
                    raw,
                    normalized,
                    score: self.config.model.composite(&normalized),
                    cached_at: now,
                };
                (node_name, entry)
            })
            .collect();
        let nodes = entries.len();

        *self.current.write().await = Some(Arc::new(CacheGeneration {
            entries,
            refreshed_at: now,
            loaded: Instant::now(),
        }));
        *self.last_error.write().await = None;

        let elapsed = started.elapsed();
        self.metrics.observe_refresh(elapsed, nodes);
        self.logger.log_cache_refreshed(nodes, elapsed);
        self.health.set_healthy(components::SCORE_CACHE).await;
        self.health.set_healthy(components::METRICS_STORE).await;

        RefreshOutcome::Refreshed { nodes }
    }

    async fn refresh_failed(&self, error: String) -> RefreshOutcome {
        let age = self.generation().await.map(|g| g.age().as_secs() as i64);
        self.metrics.inc_refresh_failures();
        self.logger.log_cache_refresh_failed(&error, age);

        // Requests keep being served from the cache
        self.health
            .set_degraded(components::METRICS_STORE, error.clone())
            .await;
        let cache_health = if age.is_some() {
            "serving previous cache generation"
        } else {
            "no cache generation loaded"
        };
        self.health
            .set_degraded(components::SCORE_CACHE, cache_health)
            .await;

        *self.last_error.write().await = Some(error.clone());
        RefreshOutcome::Failed(error)
    }

    /// Whether a caller should trigger a refresh now. After a failed
    /// attempt the next one waits a full TTL.
    pub async fn needs_refresh(&self) -> bool {
        let since_load = self.generation().await.map(|g| g.age());
        let since_attempt = self.last_attempt.read().await.map(|t| t.elapsed());

        let freshest = match (since_load, since_attempt) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        freshest.map_or(true, |age| age > self.config.ttl)
    }

    /// Refresh inline if the TTL has run out and nobody else is refreshing
    pub async fn ensure_fresh(&self) {
        if self.needs_refresh().await {
            self.refresh().await;
        }
    }

    /// Composite score for `node`, or the neutral score without data
    pub fn score_in(generation: Option<&CacheGeneration>, node: &str) -> f64 {
        generation
            .and_then(|g| g.entries.get(node))
            .map_or(NEUTRAL_SCORE, |entry| entry.score)
    }

    pub async fn score(&self, node: &str) -> f64 {
        Self::score_in(self.generation().await.as_deref(), node)
    }

    /// Scores for every candidate, all from one generation
    pub async fn score_all(&self, nodes: &[String]) -> Vec<(String, f64)> {
        self.ensure_fresh().await;
        let generation = self.generation().await;
        nodes
            .iter()
            .map(|node| {
                let score = Self::score_in(generation.as_deref(), node);
                if generation.as_ref().is_some_and(|g| !g.entries.contains_key(node)) {
                    debug!(node = %node, "No metrics for node, using neutral score");
                }
                (node.clone(), score)
            })
            .collect()
    }

    /// Integer score per candidate, in request order
    pub async fn prioritize(&self, args: &ExtenderArgs) -> HostPriorityList {
        self.score_all(&args.candidate_names())
            .await
            .into_iter()
            .map(|(host, score)| HostPriority {
                host,
                score: score.round() as i64,
            })
            .collect()
    }

    /// Run `chain` over the candidates against one cache generation
    pub async fn filter(&self, chain: &FilterChain, args: &ExtenderArgs) -> ExtenderFilterResult {
        self.ensure_fresh().await;
        let generation = self.generation().await;

        let candidates = args.candidate_names();
        let outcome = chain.evaluate(&candidates, &args.workload(), |node| {
            generation.as_ref().and_then(|g| g.entries.get(node))
        });
        if !outcome.failed.is_empty() {
            debug!(
                workload = %args.workload().display_name(),
                rejected = outcome.failed.len(),
                "Filter rejected nodes"
            );
        }

        let (nodes, node_names) = args.retain(&outcome.eligible);
        ExtenderFilterResult {
            nodes,
            node_names,
            failed_nodes: outcome.failed,
            error: String::new(),
        }
    }

    pub async fn snapshot(&self) -> CacheSnapshot {
        let state = self.state().await;
        let generation = self.generation().await;
        let last_error = self.last_error.read().await.clone();

        let (refreshed_at, age_secs, mut entries) = match &generation {
            Some(gen) => (
                Some(gen.refreshed_at),
                Some(gen.age().as_secs_f64()),
                gen.entries.values().cloned().collect::<Vec<_>>(),
            ),
            None => (None, None, Vec::new()),
        };
        entries.sort_by(|a, b| a.node_name.cmp(&b.node_name));

        if let Some(age) = age_secs {
            self.metrics.set_cache_age(age);
        }

        CacheSnapshot {
            state,
            refreshed_at,
            age_secs,
            last_error,
            entries,
        }
    }

    /// Keep the cache warm independently of request traffic
    pub async fn run_refresher(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            ttl_secs = self.config.ttl.as_secs_f64(),
            refresh_timeout_secs = self.config.refresh_timeout.as_secs_f64(),
            "Starting cache refresher"
        );

        let mut ticker = interval(self.config.ttl);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down cache refresher");
                    break;
                }
            }
        }
    }
}
