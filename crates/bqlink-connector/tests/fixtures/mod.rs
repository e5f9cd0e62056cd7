//! Test fixtures for connector integration tests
//!
//! Reusable rows, schemas and connectors. The score rows mirror the
//! smallest useful event: a name and a number.

use bqlink_connector::{MemoryBackend, WarehouseConnector};
use bqlink_core::{Column, ConnectorConfig, LogicalType, Schema};
use serde::Serialize;
use std::sync::Arc;

/// Project every in-memory connector works in
pub const PROJECT: &str = "test-project";

/// A minimal event row
#[derive(Debug, Clone, Serialize)]
pub struct Score {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Num")]
    pub num: i64,
}

impl Score {
    pub fn new(name: impl Into<String>, num: i64) -> Self {
        Self {
            name: name.into(),
            num,
        }
    }
}

/// `n` distinct scores named `n0`, `n1`, ...
pub fn scores(n: usize) -> Vec<Score> {
    (0..n).map(|i| Score::new(format!("n{}", i), i as i64)).collect()
}

/// Sample row used for schema inference
pub fn score_sample() -> serde_json::Value {
    serde_json::json!({"Name": "n1", "Num": 12})
}

/// CSV text of `n` score rows
pub fn scores_csv(n: usize) -> String {
    scores(n)
        .iter()
        .map(|s| format!("{},{}\n", s.name, s.num))
        .collect()
}

/// A clickstream table with nested and repeated columns
///
/// Rows of this table can be streamed but not exported as CSV.
pub fn clicks_schema() -> Schema {
    Schema::from_columns(vec![
        Column::new("event_id", LogicalType::String).required(),
        Column::new("event_timestamp", LogicalType::Timestamp).required(),
        Column::new("user_id", LogicalType::Int),
        Column::new("properties", LogicalType::Json),
        Column::new("tags", LogicalType::String).repeated(),
        Column::new(
            "device",
            LogicalType::Struct {
                fields: vec![
                    Column::new("kind", LogicalType::String),
                    Column::new("width", LogicalType::Int),
                ],
            },
        ),
    ])
}

/// Connector config tuned for tests: fast job polling
pub fn test_config() -> ConnectorConfig {
    let mut config = ConnectorConfig::new(PROJECT);
    config.job.poll_interval_ms = 1;
    config
}

/// In-memory backend and a connector over it, sharing state
pub fn memory_connector(backend: MemoryBackend) -> (MemoryBackend, WarehouseConnector) {
    memory_connector_with(backend, test_config())
}

pub fn memory_connector_with(backend: MemoryBackend, config: ConnectorConfig) -> (MemoryBackend, WarehouseConnector) {
    let connector = WarehouseConnector::with_backend(&config, Arc::new(backend.clone()));
    (backend, connector)
}
