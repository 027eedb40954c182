//! Node scorer
//!
//! Ranks candidate nodes for the placement orchestrator from a cached view
//! of the metrics store. Requests never wait on the store: they are served
//! from the current cache generation, stale or not.

mod cache;
mod filter;
mod normalize;
mod protocol;
mod store;

pub use cache::{
    CacheGeneration, CacheSnapshot, CacheState, NodeScorer, RefreshOutcome, ScorerConfig,
};
pub use filter::{AcceptAll, Admission, AdmissionPredicate, FilterChain, FilterOutcome, MinScore};
pub use normalize::{
    normalize, MetricRange, MetricRanges, ScoreWeights, ScoringModel, NEUTRAL_NORMALIZED,
    NEUTRAL_SCORE,
};
pub use protocol::{
    node_name, ExtenderArgs, ExtenderFilterResult, HostPriority, HostPriorityList, NodeList,
    WorkloadDescriptor,
};
pub use store::{
    fetch_node_metrics, group_by_node, MetricsStore, PrometheusStore, StoreError, VectorSample,
    NODE_LABEL,
};
