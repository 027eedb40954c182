//! Scheduler extender wire types
//!
//! Top-level keys follow the orchestrator's extender JSON, which has no
//! field tags and therefore uses the Go field names. Node and pod objects
//! are carried as opaque JSON and passed back untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

/// Request body of both `filter` and `prioritize`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtenderArgs {
    #[serde(rename = "Pod", alias = "pod", default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<Value>,

    #[serde(rename = "Nodes", alias = "nodes", default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<NodeList>,

    /// Set instead of `nodes` when the extender is node-cache capable
    #[serde(
        rename = "NodeNames",
        alias = "nodenames",
        alias = "nodeNames",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub node_names: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeList {
    #[serde(default)]
    pub items: Vec<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What the predicates get to know about the workload being placed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadDescriptor {
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl WorkloadDescriptor {
    pub fn display_name(&self) -> String {
        match (&self.namespace, &self.name) {
            (Some(ns), Some(name)) => format!("{}/{}", ns, name),
            (None, Some(name)) => name.clone(),
            _ => "<unnamed>".to_string(),
        }
    }
}

pub fn node_name(node: &Value) -> Option<&str> {
    node.pointer("/metadata/name").and_then(Value::as_str)
}

impl ExtenderArgs {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            node_names: Some(names.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    /// Candidate node names in request order, de-duplicated.
    ///
    /// Full node objects take precedence over the bare name list; objects
    /// without a name are skipped.
    pub fn candidate_names(&self) -> Vec<String> {
        let names: Vec<&str> = match (&self.nodes, &self.node_names) {
            (Some(list), _) if !list.items.is_empty() => {
                list.items.iter().filter_map(node_name).collect()
            }
            (_, Some(names)) => names.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        };

        let mut seen = HashSet::new();
        names
            .into_iter()
            .filter(|n| seen.insert(*n))
            .map(str::to_string)
            .collect()
    }

    pub fn workload(&self) -> WorkloadDescriptor {
        let Some(pod) = &self.pod else {
            return WorkloadDescriptor::default();
        };
        let text = |path: &str| pod.pointer(path).and_then(Value::as_str).map(str::to_string);

        let labels = pod
            .pointer("/metadata/labels")
            .and_then(Value::as_object)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        WorkloadDescriptor {
            namespace: text("/metadata/namespace"),
            name: text("/metadata/name"),
            labels,
        }
    }

    /// Node objects (or names) of the request restricted to `eligible`,
    /// in the shape the request used
    pub fn retain(&self, eligible: &[String]) -> (Option<NodeList>, Option<Vec<String>>) {
        let keep: HashSet<&str> = eligible.iter().map(String::as_str).collect();

        match &self.nodes {
            Some(list) if !list.items.is_empty() => {
                let items = list
                    .items
                    .iter()
                    .filter(|node| node_name(node).is_some_and(|n| keep.contains(n)))
                    .cloned()
                    .collect();
                let nodes = NodeList {
                    items,
                    extra: list.extra.clone(),
                };
                (Some(nodes), None)
            }
            _ => (None, Some(eligible.to_vec())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtenderFilterResult {
    #[serde(rename = "Nodes", alias = "nodes", default)]
    pub nodes: Option<NodeList>,

    #[serde(rename = "NodeNames", alias = "nodenames", alias = "nodeNames", default)]
    pub node_names: Option<Vec<String>>,

    /// Node name to rejection reason
    #[serde(rename = "FailedNodes", alias = "failedNodes", default)]
    pub failed_nodes: BTreeMap<String, String>,

    #[serde(rename = "Error", alias = "error", default)]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPriority {
    #[serde(rename = "Host", alias = "host")]
    pub host: String,

    #[serde(rename = "Score", alias = "score")]
    pub score: i64,
}

pub type HostPriorityList = Vec<HostPriority>;
