//! Integration tests for the warehouse connector
//!
//! These tests drive `WarehouseConnector` end to end over the in-memory
//! backend. Tests requiring actual warehouse credentials are marked with
//! `#[ignore]` and can be run with `cargo test -- --ignored`.
//!
//! ## Running Tests
//!
//! ```bash
//! # Run all non-ignored tests (no credentials required)
//! cargo test -p bqlink-connector --test integration_tests
//!
//! # Run BigQuery integration tests
//! BQLINK_BIGQUERY_PROJECT=my-project \
//! BQLINK_CREDENTIALS_DIR=/path/to/credentials \
//! cargo test -p bqlink-connector --features bigquery --test integration_tests -- --ignored
//! ```

mod fixtures;

use bqlink_connector::{ConnectorError, DatasetRef, MemoryBackend, Operation, TableRef, WarehouseBackend, WarehouseConnector};
use bqlink_core::{LogicalType, ObjectUri, Schema};
use fixtures::{clicks_schema, memory_connector, memory_connector_with, score_sample, scores, scores_csv, test_config, PROJECT};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

// =============================================================================
// Helper Functions
// =============================================================================

/// Check if BigQuery credentials are available
fn has_bigquery_credentials() -> bool {
    std::env::var("BQLINK_BIGQUERY_PROJECT").is_ok() && std::env::var("BQLINK_CREDENTIALS_DIR").is_ok()
}

fn uri(s: &str) -> ObjectUri {
    ObjectUri::parse(s).unwrap()
}

/// Connector with dataset `games` and an inferred `scores` table
async fn scores_connector(backend: MemoryBackend) -> (MemoryBackend, WarehouseConnector) {
    let (backend, connector) = memory_connector(backend);
    connector.add_dataset("games").await.unwrap();
    let schema = Schema::infer_from_json(&score_sample()).unwrap();
    connector
        .create_table_if_not_exists("games", "scores", &schema, 0)
        .await
        .unwrap();
    (backend, connector)
}

/// Write a file under the system temp dir, unique per test
fn temp_file(name: &str, contents: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("bqlink-{}-{}", std::process::id(), name));
    std::fs::write(&path, contents).unwrap();
    path
}

// =============================================================================
// Dataset Tests
// =============================================================================

#[tokio::test]
async fn test_added_dataset_is_listed() {
    let (_, connector) = memory_connector(MemoryBackend::new());

    connector.add_dataset("testdataset").await.unwrap();

    let datasets = connector.list_datasets().await.unwrap();
    assert!(datasets.contains(&"testdataset".to_string()));
}

#[tokio::test]
async fn test_list_datasets_error_propagates() {
    let (backend, connector) = memory_connector(MemoryBackend::new());
    backend
        .fail_on(
            Operation::ListDatasets,
            ConnectorError::PermissionDenied("Access Denied".to_string()),
        )
        .await;

    assert!(matches!(
        connector.list_datasets().await,
        Err(ConnectorError::PermissionDenied(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dataset_registration() {
    let (backend, connector) = memory_connector(MemoryBackend::new().with_latency(5));
    let connector = Arc::new(connector);

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let connector = Arc::clone(&connector);
            tokio::spawn(async move { connector.add_dataset(&format!("ds_{}", i)).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(connector.registered_datasets().await.len(), 8);
    assert_eq!(backend.dataset_count().await, 8);
}

#[tokio::test]
async fn test_independent_connectors() {
    let (_, first) = memory_connector(MemoryBackend::new());
    let (_, second) = memory_connector(MemoryBackend::new());

    first.add_dataset("only_here").await.unwrap();

    assert_eq!(first.list_datasets().await.unwrap(), vec!["only_here"]);
    assert!(second.list_datasets().await.unwrap().is_empty());
    assert!(second.registered_datasets().await.is_empty());
}

// =============================================================================
// Table Tests
// =============================================================================

#[tokio::test]
async fn test_inferred_table_is_listed_once() {
    let (_, connector) = scores_connector(MemoryBackend::new()).await;

    // Second creation is tolerated
    let schema = Schema::infer_from_json(&score_sample()).unwrap();
    connector
        .create_table_if_not_exists("games", "scores", &schema, 0)
        .await
        .unwrap();

    let tables = connector.list_tables("games").await.unwrap();
    assert_eq!(tables.iter().filter(|t| *t == "scores").count(), 1);

    let described = connector.describe_table("games", "scores").await.unwrap();
    assert_eq!(described.column_names(), vec!["Name", "Num"]);
    assert_eq!(described.columns[0].logical_type, LogicalType::String);
    assert_eq!(described.columns[1].logical_type, LogicalType::Int);
}

#[tokio::test]
async fn test_create_table_in_missing_dataset() {
    let (_, connector) = memory_connector(MemoryBackend::new());
    let schema = Schema::infer_from_json(&score_sample()).unwrap();

    let err = connector
        .create_table_if_not_exists("nowhere", "scores", &schema, 0)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_delete_nonexistent_table() {
    let (_, connector) = scores_connector(MemoryBackend::new()).await;

    let err = connector.delete_table("games", "missing").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_delete_table() {
    let (_, connector) = scores_connector(MemoryBackend::new()).await;

    connector.delete_table("games", "scores").await.unwrap();

    assert!(connector.list_tables("games").await.unwrap().is_empty());
    assert!(connector.browse_table("games", "scores").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_copy_table() {
    let (backend, connector) = scores_connector(MemoryBackend::new().with_job_polls(1)).await;
    connector.save_events("games", "scores", &scores(7)).await.unwrap();

    connector.copy_table("games", "scores", "scores_backup").await.unwrap();
    assert_eq!(backend.job_count().await, 1);

    assert_eq!(connector.browse_table("games", "scores_backup").await.unwrap(), 7);
    assert_eq!(
        connector.describe_table("games", "scores_backup").await.unwrap(),
        connector.describe_table("games", "scores").await.unwrap()
    );
}

// =============================================================================
// Streaming Insert Tests
// =============================================================================

#[tokio::test]
async fn test_insert_then_browse_counts_rows() {
    let (_, connector) = scores_connector(MemoryBackend::new().with_page_size(4)).await;

    let summary = connector.save_events("games", "scores", &scores(10)).await.unwrap();
    assert_eq!(summary.inserted, 10);
    assert_eq!(summary.failed, 0);

    assert_eq!(connector.browse_table("games", "scores").await.unwrap(), 10);
}

#[tokio::test]
async fn test_insert_all_rows_in_small_batches() {
    let mut config = test_config();
    config.insert.batch_size = 3;
    let (backend, connector) = memory_connector_with(MemoryBackend::new(), config);
    connector.add_dataset("games").await.unwrap();
    let schema = Schema::infer_from_json(&score_sample()).unwrap();
    connector
        .create_table_if_not_exists("games", "scores", &schema, 0)
        .await
        .unwrap();

    connector.save_events("games", "scores", &scores(8)).await.unwrap();

    let rows = backend
        .rows(&TableRef::new(PROJECT, "games", "scores"))
        .await
        .unwrap();
    let names: Vec<_> = rows.iter().map(|r| r[0].clone()).collect();
    assert_eq!(names, (0..8).map(|i| json!(format!("n{}", i))).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_insert_skip_invalid_rows() {
    let mut config = test_config();
    config.insert.skip_invalid_rows = true;
    let (_, connector) = memory_connector_with(MemoryBackend::new(), config);
    connector.add_dataset("games").await.unwrap();
    let schema = Schema::infer_from_json(&score_sample()).unwrap();
    connector
        .create_table_if_not_exists("games", "scores", &schema, 0)
        .await
        .unwrap();

    let rows = vec![
        json!({"Name": "a", "Num": 1}),
        json!({"Name": "b", "Num": "not a number"}),
        json!({"Name": "c", "Num": 3}),
    ];
    let err = connector.save_events("games", "scores", &rows).await.unwrap_err();

    assert!(matches!(err, ConnectorError::InsertFailed { failed: 1, total: 3, .. }));
    assert_eq!(connector.browse_table("games", "scores").await.unwrap(), 2);
}

#[tokio::test]
async fn test_insert_nested_rows() {
    let (_, connector) = memory_connector(MemoryBackend::new());
    connector.add_dataset("web").await.unwrap();
    connector
        .create_table_if_not_exists("web", "clicks", &clicks_schema(), 3600)
        .await
        .unwrap();

    let rows = vec![
        json!({
            "event_id": "e1",
            "event_timestamp": "2024-01-01T00:00:00Z",
            "properties": {"path": "/home"},
            "tags": ["new", "mobile"],
            "device": {"kind": "phone", "width": 390}
        }),
        json!({"event_id": "e2", "event_timestamp": 1704067200}),
    ];
    let summary = connector.save_events("web", "clicks", &rows).await.unwrap();

    assert_eq!(summary.inserted, 2);
    assert_eq!(connector.browse_table("web", "clicks").await.unwrap(), 2);
}

#[tokio::test]
async fn test_insert_missing_required_field() {
    let (_, connector) = memory_connector(MemoryBackend::new());
    connector.add_dataset("web").await.unwrap();
    connector
        .create_table_if_not_exists("web", "clicks", &clicks_schema(), 0)
        .await
        .unwrap();

    let err = connector
        .save_events("web", "clicks", &[json!({"event_id": "e1"})])
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectorError::InsertFailed { .. }));
}

// =============================================================================
// Import / Export Tests
// =============================================================================

#[tokio::test]
async fn test_export_then_import_round_trips() {
    let (backend, connector) = scores_connector(MemoryBackend::new().with_job_polls(2)).await;
    connector.save_events("games", "scores", &scores(12)).await.unwrap();

    let target = uri("gs://bqlink-test/exports/scores.csv");
    connector.export_to_uri("games", "scores", &target).await.unwrap();
    assert!(backend.object(&target).await.is_some());

    let schema = connector.describe_table("games", "scores").await.unwrap();
    connector
        .create_table_if_not_exists("games", "scores_restored", &schema, 0)
        .await
        .unwrap();
    connector
        .import_from_uri("games", "scores_restored", &target)
        .await
        .unwrap();

    assert_eq!(
        connector.browse_table("games", "scores_restored").await.unwrap(),
        connector.browse_table("games", "scores").await.unwrap()
    );
}

#[tokio::test]
async fn test_export_format() {
    let (backend, connector) = scores_connector(MemoryBackend::new()).await;
    connector.save_events("games", "scores", &scores(2)).await.unwrap();

    let target = uri("gs://bqlink-test/scores.csv");
    connector.export_to_uri("games", "scores", &target).await.unwrap();

    let csv = String::from_utf8(backend.object(&target).await.unwrap()).unwrap();
    assert_eq!(csv, "n0,0\nn1,1\n");
}

#[tokio::test]
async fn test_wildcard_export_and_import() {
    let (backend, connector) = scores_connector(MemoryBackend::new()).await;
    connector.save_events("games", "scores", &scores(3)).await.unwrap();

    let pattern = uri("gs://bqlink-test/shards/scores-*.csv");
    connector.export_to_uri("games", "scores", &pattern).await.unwrap();
    assert_eq!(
        backend.object_uris().await,
        vec!["gs://bqlink-test/shards/scores-000000000000.csv"]
    );

    backend
        .put_object(&uri("gs://bqlink-test/shards/scores-extra.csv"), scores_csv(2))
        .await;
    connector.import_from_uri("games", "scores", &pattern).await.unwrap();

    assert_eq!(connector.browse_table("games", "scores").await.unwrap(), 3 + 3 + 2);
}

#[tokio::test]
async fn test_header_round_trip() {
    let mut config = test_config();
    config.extract.print_header = true;
    config.extract.field_delimiter = "|".to_string();
    config.load.skip_leading_rows = 1;
    config.load.field_delimiter = "|".to_string();
    let (backend, connector) = memory_connector_with(MemoryBackend::new(), config);
    connector.add_dataset("games").await.unwrap();
    let schema = Schema::infer_from_json(&score_sample()).unwrap();
    connector.create_table_if_not_exists("games", "a", &schema, 0).await.unwrap();
    connector.create_table_if_not_exists("games", "b", &schema, 0).await.unwrap();
    connector.save_events("games", "a", &scores(4)).await.unwrap();

    let target = uri("gs://bqlink-test/a.csv");
    connector.export_to_uri("games", "a", &target).await.unwrap();
    let csv = String::from_utf8(backend.object(&target).await.unwrap()).unwrap();
    assert!(csv.starts_with("Name|Num\n"));

    connector.import_from_uri("games", "b", &target).await.unwrap();
    assert_eq!(connector.browse_table("games", "b").await.unwrap(), 4);
}

#[tokio::test]
async fn test_import_from_file_allows_jagged_rows() {
    let (backend, connector) = scores_connector(MemoryBackend::new()).await;
    let path = temp_file("jagged.csv", "n1,12\nn2\nn3,30\n");

    let result = connector.import_from_file("games", "scores", &path).await;
    let _ = std::fs::remove_file(&path);
    result.unwrap();

    let rows = backend
        .rows(&TableRef::new(PROJECT, "games", "scores"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[1], vec![json!("n2"), serde_json::Value::Null]);
}

#[tokio::test]
async fn test_import_from_file_bad_row_fails_job() {
    let (_, connector) = scores_connector(MemoryBackend::new()).await;
    let path = temp_file("bad.csv", "n1,12\nn2,twelve\n");

    let result = connector.import_from_file("games", "scores", &path).await;
    let _ = std::fs::remove_file(&path);

    assert!(matches!(result, Err(ConnectorError::JobFailed { .. })));
    // Load jobs are all-or-nothing
    assert_eq!(connector.browse_table("games", "scores").await.unwrap(), 0);
}

#[tokio::test]
async fn test_import_missing_object() {
    let (_, connector) = scores_connector(MemoryBackend::new()).await;

    let err = connector
        .import_from_uri("games", "scores", &uri("gs://bqlink-test/none.csv"))
        .await
        .unwrap_err();
    match err {
        ConnectorError::JobFailed { message, .. } => assert!(message.contains("Not found")),
        other => panic!("Expected JobFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_export_nested_table_fails() {
    let (_, connector) = memory_connector(MemoryBackend::new());
    connector.add_dataset("web").await.unwrap();
    connector
        .create_table_if_not_exists("web", "clicks", &clicks_schema(), 0)
        .await
        .unwrap();

    let err = connector
        .export_to_uri("web", "clicks", &uri("gs://bqlink-test/clicks.csv"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectorError::JobFailed { .. }));
}

// =============================================================================
// Memory Backend Tests
// =============================================================================

#[tokio::test]
async fn test_memory_backend_connection_failure_simulation() {
    let (_, connector) = memory_connector(MemoryBackend::new().with_connection_failure());
    assert!(matches!(
        connector.test_connection().await,
        Err(ConnectorError::Network(_))
    ));
}

#[tokio::test]
async fn test_memory_backend_latency_simulation() {
    let (_, connector) = memory_connector(MemoryBackend::new().with_latency(50));

    let start = std::time::Instant::now();
    connector.list_datasets().await.unwrap();
    let elapsed = start.elapsed();

    assert!(
        elapsed.as_millis() >= 50,
        "Expected at least 50ms latency, got {:?}",
        elapsed
    );
}

#[tokio::test]
async fn test_memory_backend_clone_shares_state() {
    let backend = MemoryBackend::new();
    let clone = backend.clone();

    backend
        .create_dataset(&DatasetRef::new(PROJECT, "shared"), None)
        .await
        .unwrap();

    assert_eq!(clone.list_datasets(PROJECT).await.unwrap(), vec!["shared"]);
}

// =============================================================================
// BigQuery Integration Tests (require credentials)
// =============================================================================

#[tokio::test]
#[ignore] // Run with: cargo test --features bigquery -- --ignored
async fn test_bigquery_connection() {
    if !has_bigquery_credentials() {
        eprintln!("Skipping BigQuery test: no credentials available");
        eprintln!("Set BQLINK_BIGQUERY_PROJECT and BQLINK_CREDENTIALS_DIR");
        return;
    }

    #[cfg(feature = "bigquery")]
    {
        let project_id = std::env::var("BQLINK_BIGQUERY_PROJECT").expect("BQLINK_BIGQUERY_PROJECT must be set");
        let credentials = std::env::var("BQLINK_CREDENTIALS_DIR").expect("BQLINK_CREDENTIALS_DIR must be set");

        let config = bqlink_core::ConnectorConfig::new(&project_id).with_credentials_dir(credentials);
        let connector = WarehouseConnector::connect(&config)
            .await
            .expect("Failed to connect to BigQuery");

        connector
            .test_connection()
            .await
            .expect("Connection test failed");

        println!("BigQuery connection successful for project: {}", project_id);
    }

    #[cfg(not(feature = "bigquery"))]
    {
        eprintln!("BigQuery feature not enabled. Rebuild with --features bigquery");
    }
}

#[tokio::test]
#[ignore]
async fn test_bigquery_table_lifecycle() {
    if !has_bigquery_credentials() {
        return;
    }

    #[cfg(feature = "bigquery")]
    {
        let project_id = std::env::var("BQLINK_BIGQUERY_PROJECT").expect("BQLINK_BIGQUERY_PROJECT must be set");
        let credentials = std::env::var("BQLINK_CREDENTIALS_DIR").expect("BQLINK_CREDENTIALS_DIR must be set");

        let config = bqlink_core::ConnectorConfig::new(&project_id).with_credentials_dir(credentials);
        let connector = WarehouseConnector::connect(&config)
            .await
            .expect("Failed to connect to BigQuery");

        connector.add_dataset("bqlink_it").await.expect("Failed to add dataset");
        assert!(connector.list_datasets().await.unwrap().contains(&"bqlink_it".to_string()));

        let schema = Schema::infer_from_json(&score_sample()).unwrap();
        connector
            .create_table_if_not_exists("bqlink_it", "scores", &schema, 0)
            .await
            .expect("Failed to create table");
        let tables = connector.list_tables("bqlink_it").await.unwrap();
        assert_eq!(tables.iter().filter(|t| *t == "scores").count(), 1);

        connector
            .save_events("bqlink_it", "scores", &scores(3))
            .await
            .expect("Failed to insert rows");
        // Streamed rows are not always visible to reads right away
        let count = connector.browse_table("bqlink_it", "scores").await.unwrap();
        println!("Browsed {} rows from bqlink_it.scores", count);

        connector.delete_table("bqlink_it", "scores").await.expect("Failed to delete table");
        assert!(connector
            .delete_table("bqlink_it", "scores")
            .await
            .unwrap_err()
            .is_not_found());
    }
}
