//! Metrics store client
//!
//! Instant queries return labelled vectors. Results are grouped by the
//! `node` label; series without it are ignored and several series for one
//! node collapse to their maximum, the worst case for lower-is-better
//! metrics.

use crate::models::{NodeMetrics, ScoringSeries};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Label carrying the node name on every scoring series
pub const NODE_LABEL: &str = "node";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid metrics store URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("metrics store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("metrics store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("query `{query}` failed: {error}")]
    Query { query: String, error: String },

    #[error("query `{query}` returned `{result_type}`, expected a vector")]
    ResultType { query: String, result_type: String },

    #[error("query `{query}` returned unparsable value `{value}`")]
    Value { query: String, value: String },
}

/// One element of an instant vector
#[derive(Debug, Clone, PartialEq)]
pub struct VectorSample {
    pub labels: BTreeMap<String, String>,
    pub timestamp: f64,
    pub value: f64,
}

/// Source of live per-node series
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn query_vector(&self, query: &str) -> Result<Vec<VectorSample>, StoreError>;
}

/// Collapse a vector to one value per node
pub fn group_by_node(samples: &[VectorSample]) -> HashMap<String, f64> {
    let mut by_node: HashMap<String, f64> = HashMap::new();
    for sample in samples {
        let Some(node) = sample.labels.get(NODE_LABEL) else {
            continue;
        };
        if sample.value.is_nan() {
            continue;
        }
        by_node
            .entry(node.clone())
            .and_modify(|v| *v = v.max(sample.value))
            .or_insert(sample.value);
    }
    by_node
}

/// Query all five scoring series and assemble per-node metrics.
///
/// Any failing query fails the whole fetch. A node missing from some
/// series reads 0 for it.
pub async fn fetch_node_metrics(
    store: &dyn MetricsStore,
) -> Result<HashMap<String, NodeMetrics>, StoreError> {
    let [rtt, retrans, drops, runqlat, cpu] = ScoringSeries::ALL;
    let (rtt, retrans, drops, runqlat, cpu) = tokio::try_join!(
        store.query_vector(rtt.metric_name()),
        store.query_vector(retrans.metric_name()),
        store.query_vector(drops.metric_name()),
        store.query_vector(runqlat.metric_name()),
        store.query_vector(cpu.metric_name()),
    )?;

    let mut nodes: HashMap<String, NodeMetrics> = HashMap::new();
    for (series, samples) in ScoringSeries::ALL
        .into_iter()
        .zip([rtt, retrans, drops, runqlat, cpu])
    {
        for (node, value) in group_by_node(&samples) {
            nodes.entry(node).or_default().set(series, value);
        }
    }
    Ok(nodes)
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    result_type: String,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawSample {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    value: (f64, String),
}

/// Prometheus HTTP API client
pub struct PrometheusStore {
    client: Client,
    query_url: Url,
}

impl PrometheusStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let query_url = base.join("api/v1/query")?;

        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, query_url })
    }

    pub fn query_url(&self) -> &Url {
        &self.query_url
    }

    fn decode(query: &str, response: ApiResponse) -> Result<Vec<VectorSample>, StoreError> {
        if response.status != "success" {
            return Err(StoreError::Query {
                query: query.to_string(),
                error: response
                    .error
                    .unwrap_or_else(|| format!("status {}", response.status)),
            });
        }

        let data = response.data.ok_or_else(|| StoreError::Query {
            query: query.to_string(),
            error: "response has no data".to_string(),
        })?;
        if data.result_type != "vector" {
            return Err(StoreError::ResultType {
                query: query.to_string(),
                result_type: data.result_type,
            });
        }

        let raw: Vec<RawSample> =
            serde_json::from_value(data.result).map_err(|e| StoreError::Query {
                query: query.to_string(),
                error: format!("malformed vector: {}", e),
            })?;

        raw.into_iter()
            .map(|sample| {
                let (timestamp, value) = sample.value;
                let value = value.parse::<f64>().map_err(|_| StoreError::Value {
                    query: query.to_string(),
                    value: value.clone(),
                })?;
                Ok(VectorSample {
                    labels: sample.metric,
                    timestamp,
                    value,
                })
            })
            .collect()
    }
}

#[async_trait]
impl MetricsStore for PrometheusStore {
    async fn query_vector(&self, query: &str) -> Result<Vec<VectorSample>, StoreError> {
        let response = self
            .client
            .get(self.query_url.clone())
            .query(&[("query", query)])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        match serde_json::from_str::<ApiResponse>(&body) {
            Ok(parsed) => Self::decode(query, parsed),
            Err(_) if !status.is_success() => Err(StoreError::Status {
                status: status.as_u16(),
                body,
            }),
            Err(e) => Err(StoreError::Query {
                query: query.to_string(),
                error: format!("malformed response: {}", e),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn sample(labels: &[(&str, &str)], value: f64) -> VectorSample {
        VectorSample {
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            timestamp: 0.0,
            value,
        }
    }

    fn vector(entries: &[(&str, &str)]) -> String {
        let result: Vec<_> = entries
            .iter()
            .map(|(node, value)| {
                json!({
                    "metric": {"__name__": "series", "node": node, "instance": "10.0.0.1:9100"},
                    "value": [1_700_000_000.5, value]
                })
            })
            .collect();
        json!({"status": "success", "data": {"resultType": "vector", "result": result}})
            .to_string()
    }

    #[test]
    fn test_group_by_node_takes_max_and_skips_unlabelled() {
        let samples = vec![
            sample(&[("node", "a"), ("instance", "x")], 10.0),
            sample(&[("node", "a"), ("instance", "y")], 30.0),
            sample(&[("node", "b")], 5.0),
            sample(&[("instance", "z")], 99.0),
            sample(&[("node", "c")], f64::NAN),
        ];

        let grouped = group_by_node(&samples);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["a"], 30.0);
        assert_eq!(grouped["b"], 5.0);
    }

    #[test]
    fn test_query_url_keeps_base_path() {
        let store = PrometheusStore::new("http://prom:9090/monitoring", Duration::from_secs(1))
            .unwrap();
        assert_eq!(
            store.query_url().as_str(),
            "http://prom:9090/monitoring/api/v1/query"
        );

        let store = PrometheusStore::new("http://prom:9090", Duration::from_secs(1)).unwrap();
        assert_eq!(store.query_url().as_str(), "http://prom:9090/api/v1/query");
    }

    #[test]
    fn test_invalid_url() {
        assert!(matches!(
            PrometheusStore::new("not a url", Duration::from_secs(1)),
            Err(StoreError::Url(_))
        ));
    }

    #[tokio::test]
    async fn test_query_vector_decodes_labelled_samples() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/query")
            .match_query(Matcher::UrlEncoded(
                "query".into(),
                "ebpf_cpu_utilization".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(vector(&[("node-a", "12.5"), ("node-b", "80")]))
            .create_async()
            .await;

        let store = PrometheusStore::new(&server.url(), Duration::from_secs(2)).unwrap();
        let samples = store.query_vector("ebpf_cpu_utilization").await.unwrap();

        mock.assert_async().await;
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].labels["node"], "node-a");
        assert_eq!(samples[0].value, 12.5);
        assert_eq!(samples[1].timestamp, 1_700_000_000.5);
    }

    #[tokio::test]
    async fn test_query_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/query")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(
                json!({"status": "error", "errorType": "bad_data", "error": "parse error"})
                    .to_string(),
            )
            .create_async()
            .await;

        let store = PrometheusStore::new(&server.url(), Duration::from_secs(2)).unwrap();
        let err = store.query_vector("up{").await.unwrap_err();
        assert!(matches!(err, StoreError::Query { ref error, .. } if error == "parse error"));
    }

    #[tokio::test]
    async fn test_non_json_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/query")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("upstream unavailable")
            .create_async()
            .await;

        let store = PrometheusStore::new(&server.url(), Duration::from_secs(2)).unwrap();
        let err = store.query_vector("up").await.unwrap_err();
        assert!(matches!(err, StoreError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_non_vector_result_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/query")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                json!({"status": "success", "data": {"resultType": "scalar", "result": [1.0, "1"]}})
                    .to_string(),
            )
            .create_async()
            .await;

        let store = PrometheusStore::new(&server.url(), Duration::from_secs(2)).unwrap();
        let err = store.query_vector("scalar(up)").await.unwrap_err();
        assert!(matches!(err, StoreError::ResultType { .. }));
    }

    #[tokio::test]
    async fn test_unparsable_value_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/query")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(vector(&[("node-a", "fast")]))
            .create_async()
            .await;

        let store = PrometheusStore::new(&server.url(), Duration::from_secs(2)).unwrap();
        let err = store.query_vector("up").await.unwrap_err();
        assert!(matches!(err, StoreError::Value { ref value, .. } if value == "fast"));
    }

    #[tokio::test]
    async fn test_fetch_node_metrics_assembles_all_series() {
        let mut server = mockito::Server::new_async().await;
        let series = [
            ("ebpf_rtt_p99_milliseconds", vec![("a", "10"), ("b", "500")]),
            ("ebpf_tcp_retrans_rate", vec![("a", "0"), ("b", "50")]),
            ("ebpf_drop_rate", vec![("b", "20")]),
            ("ebpf_runqlat_p95_milliseconds", vec![("a", "1"), ("b", "50")]),
            ("ebpf_cpu_utilization", vec![("a", "5"), ("b", "80")]),
        ];
        for (name, entries) in &series {
            server
                .mock("GET", "/api/v1/query")
                .match_query(Matcher::UrlEncoded("query".into(), name.to_string()))
                .with_status(200)
                .with_body(vector(entries))
                .create_async()
                .await;
        }

        let store = PrometheusStore::new(&server.url(), Duration::from_secs(2)).unwrap();
        let nodes = fetch_node_metrics(&store).await.unwrap();

        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes["a"].rtt_p99_ms, 10.0);
        assert_eq!(nodes["a"].drop_rate, 0.0);
        assert_eq!(nodes["b"].retrans_rate, 50.0);
        assert_eq!(nodes["b"].drop_rate, 20.0);
        assert_eq!(nodes["b"].cpu_util, 80.0);
    }
}
