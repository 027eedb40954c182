//! Admission predicates for the filter call

use super::protocol::WorkloadDescriptor;
use crate::models::NodeScoreEntry;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Accept,
    Reject(String),
}

/// Decides whether one candidate node may run the workload
pub trait AdmissionPredicate: Send + Sync {
    fn name(&self) -> &'static str;

    /// `entry` is `None` when the cache holds nothing for the node
    fn admit(
        &self,
        node: &str,
        entry: Option<&NodeScoreEntry>,
        workload: &WorkloadDescriptor,
    ) -> Admission;
}

/// Default policy: every candidate is eligible
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl AdmissionPredicate for AcceptAll {
    fn name(&self) -> &'static str {
        "accept_all"
    }

    fn admit(&self, _: &str, _: Option<&NodeScoreEntry>, _: &WorkloadDescriptor) -> Admission {
        Admission::Accept
    }
}

/// Rejects nodes whose cached composite score is below `floor`.
/// Nodes without data are always admitted.
#[derive(Debug, Clone, Copy)]
pub struct MinScore {
    pub floor: f64,
}

impl AdmissionPredicate for MinScore {
    fn name(&self) -> &'static str {
        "min_score"
    }

    fn admit(
        &self,
        _node: &str,
        entry: Option<&NodeScoreEntry>,
        _workload: &WorkloadDescriptor,
    ) -> Admission {
        match entry {
            Some(entry) if entry.score < self.floor => Admission::Reject(format!(
                "node score {:.1} below minimum {:.1}",
                entry.score, self.floor
            )),
            _ => Admission::Accept,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterOutcome {
    pub eligible: Vec<String>,
    pub failed: BTreeMap<String, String>,
}

/// Ordered predicates; the first rejection decides
#[derive(Clone)]
pub struct FilterChain {
    predicates: Vec<Arc<dyn AdmissionPredicate>>,
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::accept_all()
    }
}

impl FilterChain {
    pub fn accept_all() -> Self {
        Self {
            predicates: vec![Arc::new(AcceptAll)],
        }
    }

    /// `AcceptAll`, or a score floor when one is configured
    pub fn from_min_score(min_score: Option<f64>) -> Self {
        match min_score {
            Some(floor) => Self::accept_all().with(MinScore { floor }),
            None => Self::accept_all(),
        }
    }

    pub fn with(mut self, predicate: impl AdmissionPredicate + 'static) -> Self {
        self.predicates.push(Arc::new(predicate));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.predicates.iter().map(|p| p.name()).collect()
    }

    pub fn evaluate<'a, F>(
        &self,
        candidates: &[String],
        workload: &WorkloadDescriptor,
        lookup: F,
    ) -> FilterOutcome
    where
        F: Fn(&str) -> Option<&'a NodeScoreEntry>,
    {
        let mut outcome = FilterOutcome::default();

        for node in candidates {
            let entry = lookup(node);
            let rejection = self.predicates.iter().find_map(|p| {
                match p.admit(node, entry, workload) {
                    Admission::Accept => None,
                    Admission::Reject(reason) => Some(reason),
                }
            });

            match rejection {
                Some(reason) => {
                    outcome.failed.insert(node.clone(), reason);
                }
                None => outcome.eligible.push(node.clone()),
            }
        }

        outcome
    }
}
