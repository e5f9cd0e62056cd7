//! Warehouse connector
//!
//! `WarehouseConnector` is the entry point for every operation. It is built
//! once from a [`ConnectorConfig`] and shared by reference; it keeps a
//! registry of the dataset handles it has opened and delegates each call to
//! a [`WarehouseBackend`].
//!
//! ```rust,ignore
//! let config = ConnectorConfig::from_file(Path::new("bqlink.toml"))?;
//! let connector = WarehouseConnector::connect(&config).await?;
//!
//! connector.add_dataset("events").await?;
//! connector.create_table_if_not_exists("events", "scores", &schema, 0).await?;
//! connector.save_events("events", "scores", &scores).await?;
//! let rows = connector.browse_table("events", "scores").await?;
//! ```

use crate::backend::{ConnectorError, DatasetRef, InsertOptions, InsertRow, TableDefinition, TableRef, WarehouseBackend};
use crate::bigquery::BigQueryBackend;
use crate::job::{ExtractOptions, JobHandle, JobSpec, LoadOptions, LoadSource, WriteDisposition};
use bqlink_core::{validate_dataset_id, validate_table_id, ConnectorConfig, ObjectUri, Schema};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Totals of a `save_events` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertSummary {
    /// Rows stored by the warehouse
    pub inserted: usize,

    /// Rows rejected, including valid rows dropped with a rejected request
    pub failed: usize,
}

/// Connector for one warehouse project
pub struct WarehouseConnector {
    config: ConnectorConfig,
    backend: Arc<dyn WarehouseBackend>,

    /// Dataset handles opened by this connector, keyed by dataset id
    datasets: RwLock<HashMap<String, DatasetRef>>,
}

impl WarehouseConnector {
    /// Authenticate with the service account key in the credentials directory
    pub async fn connect(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        config
            .validate()
            .map_err(|e| ConnectorError::Config(e.to_string()))?;

        let key_path = config
            .key_path()
            .ok_or_else(|| ConnectorError::Config("Missing BigQuery credentials path".to_string()))?;

        std::fs::metadata(&key_path).map_err(|e| {
            ConnectorError::Authentication(format!(
                "Cannot read key file '{}': {}",
                key_path.display(),
                e
            ))
        })?;

        let backend = BigQueryBackend::from_service_account_file(&config.project_id, &key_path).await?;
        tracing::info!("Connected to BigQuery project {}", config.project_id);

        Ok(Self::with_backend(config, Arc::new(backend)))
    }

    /// Build a connector over any backend
    pub fn with_backend(config: &ConnectorConfig, backend: Arc<dyn WarehouseBackend>) -> Self {
        Self {
            config: config.clone(),
            backend,
            datasets: RwLock::new(HashMap::new()),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.config.project_id
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Name of the backend in use
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Probe the warehouse with the configured credentials
    pub async fn test_connection(&self) -> Result<(), ConnectorError> {
        self.backend.test_connection().await
    }

    /// Register a dataset and create it remotely
    ///
    /// A dataset that already exists is not an error.
    pub async fn add_dataset(&self, dataset_id: &str) -> Result<DatasetRef, ConnectorError> {
        let dataset = self.open_dataset(dataset_id).await?;

        match self
            .backend
            .create_dataset(&dataset, self.config.location.as_deref())
            .await
        {
            Ok(()) => tracing::info!("Created dataset {}", dataset),
            Err(e) if e.is_already_exists() => tracing::warn!("Dataset {} already exists", dataset),
            Err(e) => return Err(e),
        }

        Ok(dataset)
    }

    /// Register a handle for an existing dataset without any remote call
    pub async fn open_dataset(&self, dataset_id: &str) -> Result<DatasetRef, ConnectorError> {
        validate_dataset_id(dataset_id)?;

        let dataset = DatasetRef::new(&self.config.project_id, dataset_id);
        self.datasets
            .write()
            .await
            .insert(dataset_id.to_string(), dataset.clone());
        Ok(dataset)
    }

    /// Ids of the datasets opened by this connector, sorted
    pub async fn registered_datasets(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.datasets.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// All datasets of the project
    pub async fn list_datasets(&self) -> Result<Vec<String>, ConnectorError> {
        let datasets = self.backend.list_datasets(&self.config.project_id).await?;
        tracing::debug!("Project {} has {} datasets", self.config.project_id, datasets.len());
        Ok(datasets)
    }

    /// Create a daily-partitioned table unless it already exists
    ///
    /// Partitions expire after `expiration_secs`; 0 keeps them forever.
    pub async fn create_table_if_not_exists(
        &self,
        dataset_id: &str,
        table_id: &str,
        schema: &Schema,
        expiration_secs: u64,
    ) -> Result<TableRef, ConnectorError> {
        schema.validate()?;
        let table = self.table_ref(dataset_id, table_id).await?;

        let definition = TableDefinition {
            schema: schema.clone(),
            partition_expiration: (expiration_secs > 0).then(|| Duration::from_secs(expiration_secs)),
        };

        match self.backend.create_table(&table, &definition).await {
            Ok(()) => tracing::info!("Created table {} with {} columns", table, schema.len()),
            Err(e) if e.is_already_exists() => tracing::warn!("Table {} already exists", table),
            Err(e) => return Err(e),
        }

        Ok(table)
    }

    /// Current schema of a table
    pub async fn describe_table(&self, dataset_id: &str, table_id: &str) -> Result<Schema, ConnectorError> {
        let table = self.table_ref(dataset_id, table_id).await?;
        self.backend.table_schema(&table).await
    }

    /// All tables of a dataset
    pub async fn list_tables(&self, dataset_id: &str) -> Result<Vec<String>, ConnectorError> {
        let dataset = self.dataset_ref(dataset_id).await?;
        let tables = self.backend.list_tables(&dataset).await?;
        tracing::debug!("Dataset {} has {} tables", dataset, tables.len());
        Ok(tables)
    }

    /// Read every row of a table and return the row count
    pub async fn browse_table(&self, dataset_id: &str, table_id: &str) -> Result<u64, ConnectorError> {
        let table = self.table_ref(dataset_id, table_id).await?;

        let mut count: u64 = 0;
        let mut page_token = None;
        loop {
            let page = self.backend.list_rows(&table, page_token).await?;
            for row in &page.rows {
                tracing::debug!("{}: {:?}", table, row);
                count += 1;
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        tracing::info!("Read {} rows from {}", count, table);
        Ok(count)
    }

    /// Replace `dst` with a copy of `src`, both in the same dataset
    pub async fn copy_table(&self, dataset_id: &str, src: &str, dst: &str) -> Result<(), ConnectorError> {
        let source = self.table_ref(dataset_id, src).await?;
        let destination = self.table_ref(dataset_id, dst).await?;

        self.run_job(JobSpec::Copy {
            source,
            destination,
            write_disposition: WriteDisposition::WriteTruncate,
        })
        .await?;
        Ok(())
    }

    pub async fn delete_table(&self, dataset_id: &str, table_id: &str) -> Result<(), ConnectorError> {
        let table = self.table_ref(dataset_id, table_id).await?;
        self.backend.delete_table(&table).await?;
        tracing::info!("Deleted table {}", table);
        Ok(())
    }

    /// Stream rows into a table
    ///
    /// Every row is sent, in order, in requests of at most
    /// `insert.batch_size` rows. Any rejected row makes the call fail with
    /// `InsertFailed` once all requests have been made.
    pub async fn save_events<T: Serialize>(
        &self,
        dataset_id: &str,
        table_id: &str,
        events: &[T],
    ) -> Result<InsertSummary, ConnectorError> {
        let table = self.table_ref(dataset_id, table_id).await?;
        if events.is_empty() {
            tracing::debug!("No rows to insert into {}", table);
            return Ok(InsertSummary::default());
        }

        let rows = events.iter().map(insert_row).collect::<Result<Vec<_>, _>>()?;
        let options = InsertOptions::from(&self.config.insert);
        let batch_size = self.config.insert.batch_size.max(1);

        let mut summary = InsertSummary::default();
        let mut first_error = None;
        for (batch, chunk) in rows.chunks(batch_size).enumerate() {
            let outcome = self.backend.insert_rows(&table, chunk.to_vec(), &options).await?;

            summary.inserted += outcome.inserted;
            summary.failed += chunk.len().saturating_sub(outcome.inserted);
            for row_error in &outcome.row_errors {
                let index = batch * batch_size + row_error.index;
                tracing::error!("Row {} rejected by {}: {}", index, table, row_error.message);
                first_error.get_or_insert_with(|| format!("row {}: {}", index, row_error.message));
            }
        }

        if summary.failed > 0 {
            return Err(ConnectorError::InsertFailed {
                table: table.fqn(),
                failed: summary.failed,
                total: rows.len(),
                message: first_error.unwrap_or_else(|| "rows were not stored".to_string()),
            });
        }

        tracing::info!("Inserted {} rows into {}", summary.inserted, table);
        Ok(summary)
    }

    /// Load a local CSV file into an existing table
    pub async fn import_from_file(
        &self,
        dataset_id: &str,
        table_id: &str,
        path: impl AsRef<Path>,
    ) -> Result<(), ConnectorError> {
        let path = path.as_ref();
        let destination = self.table_ref(dataset_id, table_id).await?;
        let data = tokio::fs::read(path).await.map_err(|e| {
            ConnectorError::Io(format!("Cannot read '{}': {}", path.display(), e))
        })?;

        self.run_job(JobSpec::Load {
            destination,
            source: LoadSource::Inline {
                name: path.display().to_string(),
                data,
            },
            options: LoadOptions::from(&self.config.load),
        })
        .await?;
        Ok(())
    }

    /// Load CSV objects into an existing table
    pub async fn import_from_uri(
        &self,
        dataset_id: &str,
        table_id: &str,
        uri: &ObjectUri,
    ) -> Result<(), ConnectorError> {
        let destination = self.table_ref(dataset_id, table_id).await?;

        self.run_job(JobSpec::Load {
            destination,
            source: LoadSource::Uri(uri.clone()),
            options: LoadOptions::from(&self.config.load),
        })
        .await?;
        Ok(())
    }

    /// Write a table out as CSV
    pub async fn export_to_uri(
        &self,
        dataset_id: &str,
        table_id: &str,
        uri: &ObjectUri,
    ) -> Result<(), ConnectorError> {
        let source = self.table_ref(dataset_id, table_id).await?;

        self.run_job(JobSpec::Extract {
            source,
            destination: uri.clone(),
            options: ExtractOptions::from(&self.config.extract),
        })
        .await?;
        Ok(())
    }

    /// Block until a job is done; its terminal error becomes `JobFailed`
    pub async fn wait_for_job(&self, handle: &JobHandle) -> Result<(), ConnectorError> {
        let interval = Duration::from_millis(self.config.job.poll_interval_ms);

        loop {
            let status = self.backend.job_status(handle).await?;
            if status.is_done() {
                return match status.error {
                    Some(message) => Err(ConnectorError::JobFailed {
                        job_id: handle.job_id.clone(),
                        message,
                    }),
                    None => Ok(()),
                };
            }

            tracing::debug!("Job {} is {:?}", handle.job_id, status.state);
            tokio::time::sleep(interval).await;
        }
    }

    async fn run_job(&self, spec: JobSpec) -> Result<JobHandle, ConnectorError> {
        let handle = JobHandle::generate(&self.config.project_id, spec.kind(), self.config.location.clone());
        let handle = self.backend.submit_job(handle, &spec).await?;
        tracing::debug!("Submitted {} job {}", spec.kind(), handle.job_id);

        if let Err(e) = self.wait_for_job(&handle).await {
            tracing::error!("{} job {} failed: {}", spec.kind(), handle.job_id, e);
            return Err(e);
        }

        tracing::info!("{} job {} done", spec.kind(), handle.job_id);
        Ok(handle)
    }

    /// Registered handle for a dataset, or a fresh one in this project
    async fn dataset_ref(&self, dataset_id: &str) -> Result<DatasetRef, ConnectorError> {
        if let Some(dataset) = self.datasets.read().await.get(dataset_id) {
            return Ok(dataset.clone());
        }

        validate_dataset_id(dataset_id)?;
        Ok(DatasetRef::new(&self.config.project_id, dataset_id))
    }

    async fn table_ref(&self, dataset_id: &str, table_id: &str) -> Result<TableRef, ConnectorError> {
        validate_table_id(table_id)?;
        Ok(self.dataset_ref(dataset_id).await?.table(table_id))
    }
}

/// Hex SHA-256 of a row's JSON text
pub fn insert_id(row: &serde_json::Value) -> String {
    hex::encode(Sha256::digest(row.to_string().as_bytes()))
}

fn insert_row<T: Serialize>(event: &T) -> Result<InsertRow, ConnectorError> {
    let json = serde_json::to_value(event)
        .map_err(|e| ConnectorError::InvalidRequest(format!("Cannot serialize row: {}", e)))?;
    if !json.is_object() {
        return Err(ConnectorError::InvalidRequest(format!(
            "Rows must serialize to JSON objects, got {}",
            json
        )));
    }

    Ok(InsertRow {
        insert_id: Some(insert_id(&json)),
        json,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBackend, Operation};
    use bqlink_core::{Column, LogicalType};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[derive(Serialize)]
    struct Score {
        #[serde(rename = "Name")]
        name: String,
        #[serde(rename = "Num")]
        num: i64,
    }

    fn score(i: i64) -> Score {
        Score {
            name: format!("n{}", i),
            num: i,
        }
    }

    fn schema() -> Schema {
        Schema::from_columns(vec![
            Column::new("Name", LogicalType::String),
            Column::new("Num", LogicalType::Int),
        ])
    }

    fn config() -> ConnectorConfig {
        let mut config = ConnectorConfig::new("test-project");
        config.job.poll_interval_ms = 1;
        config
    }

    fn connector(backend: &MemoryBackend) -> WarehouseConnector {
        WarehouseConnector::with_backend(&config(), Arc::new(backend.clone()))
    }

    #[tokio::test]
    async fn test_add_dataset_twice() {
        let backend = MemoryBackend::new();
        let connector = connector(&backend);

        let first = connector.add_dataset("events").await.unwrap();
        let second = connector.add_dataset("events").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.dataset_count().await, 1);
        assert_eq!(connector.registered_datasets().await, vec!["events"]);
    }

    #[tokio::test]
    async fn test_add_dataset_uses_location() {
        let backend = MemoryBackend::new();
        let connector = WarehouseConnector::with_backend(&config().with_location("EU"), Arc::new(backend.clone()));

        let dataset = connector.add_dataset("events").await.unwrap();
        assert_eq!(backend.dataset_location(&dataset).await.as_deref(), Some("EU"));
    }

    #[tokio::test]
    async fn test_add_dataset_propagates_other_errors() {
        let backend = MemoryBackend::new();
        backend
            .fail_on(
                Operation::CreateDataset,
                ConnectorError::PermissionDenied("Access Denied".to_string()),
            )
            .await;

        let result = connector(&backend).add_dataset("events").await;
        assert!(matches!(result, Err(ConnectorError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_invalid_identifiers() {
        let connector = connector(&MemoryBackend::new());

        assert!(matches!(
            connector.add_dataset("bad-name").await,
            Err(ConnectorError::InvalidRequest(_))
        ));
        assert!(matches!(
            connector.delete_table("events", "bad/table").await,
            Err(ConnectorError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_create_table_twice() {
        let backend = MemoryBackend::new();
        let connector = connector(&backend);
        connector.add_dataset("events").await.unwrap();

        connector.create_table_if_not_exists("events", "scores", &schema(), 0).await.unwrap();
        connector.create_table_if_not_exists("events", "scores", &schema(), 0).await.unwrap();

        assert_eq!(connector.list_tables("events").await.unwrap(), vec!["scores"]);
        assert_eq!(connector.describe_table("events", "scores").await.unwrap(), schema());
    }

    #[tokio::test]
    async fn test_partition_expiration() {
        let backend = MemoryBackend::new();
        let connector = connector(&backend);
        connector.add_dataset("events").await.unwrap();

        let forever = connector.create_table_if_not_exists("events", "a", &schema(), 0).await.unwrap();
        let daily = connector.create_table_if_not_exists("events", "b", &schema(), 86_400).await.unwrap();

        assert_eq!(backend.partition_expiration(&forever).await, None);
        assert_eq!(
            backend.partition_expiration(&daily).await,
            Some(Duration::from_secs(86_400))
        );
    }

    #[tokio::test]
    async fn test_create_table_rejects_empty_schema() {
        let connector = connector(&MemoryBackend::new());
        assert!(matches!(
            connector.create_table_if_not_exists("events", "t", &Schema::new(), 0).await,
            Err(ConnectorError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_save_events_in_batches() {
        let backend = MemoryBackend::new().with_page_size(3);
        let mut config = config();
        config.insert.batch_size = 2;
        let connector = WarehouseConnector::with_backend(&config, Arc::new(backend.clone()));
        connector.add_dataset("events").await.unwrap();
        connector.create_table_if_not_exists("events", "scores", &schema(), 0).await.unwrap();

        let scores: Vec<Score> = (0..5).map(score).collect();
        let summary = connector.save_events("events", "scores", &scores).await.unwrap();

        assert_eq!(summary, InsertSummary { inserted: 5, failed: 0 });
        assert_eq!(connector.browse_table("events", "scores").await.unwrap(), 5);

        let rows = backend.rows(&TableRef::new("test-project", "events", "scores")).await.unwrap();
        assert_eq!(rows[4], vec![json!("n4"), json!(4)]);
    }

    #[tokio::test]
    async fn test_save_events_empty_batch() {
        let backend = MemoryBackend::new();
        backend
            .fail_on(Operation::InsertRows, ConnectorError::Network("down".to_string()))
            .await;

        let scores: Vec<Score> = Vec::new();
        let summary = connector(&backend).save_events("events", "scores", &scores).await.unwrap();
        assert_eq!(summary, InsertSummary::default());
    }

    #[tokio::test]
    async fn test_save_events_reports_rejected_rows() {
        let backend = MemoryBackend::new();
        let connector = connector(&backend);
        connector.add_dataset("events").await.unwrap();
        connector.create_table_if_not_exists("events", "scores", &schema(), 0).await.unwrap();

        let rows = vec![json!({"Name": "ok", "Num": 1}), json!({"Name": "bad", "Num": "x"})];
        match connector.save_events("events", "scores", &rows).await {
            Err(ConnectorError::InsertFailed { table, failed, total, message }) => {
                assert_eq!(table, "test-project.events.scores");
                assert_eq!(failed, 2);
                assert_eq!(total, 2);
                assert!(message.starts_with("row 1:"));
            }
            other => panic!("Expected InsertFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_save_events_rejects_non_objects() {
        let connector = connector(&MemoryBackend::new());
        assert!(matches!(
            connector.save_events("events", "scores", &[1, 2, 3]).await,
            Err(ConnectorError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_insert_ids_are_deterministic() {
        let a = insert_id(&json!({"Name": "n1", "Num": 12}));
        assert_eq!(a.len(), 64);
        assert_eq!(a, insert_id(&json!({"Name": "n1", "Num": 12})));
        assert_ne!(a, insert_id(&json!({"Name": "n1", "Num": 13})));
        assert_eq!(
            insert_id(&json!({})),
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[tokio::test]
    async fn test_delete_missing_table() {
        let backend = MemoryBackend::new();
        let connector = connector(&backend);
        connector.add_dataset("events").await.unwrap();

        let err = connector.delete_table("events", "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_copy_table_truncates() {
        let backend = MemoryBackend::new().with_job_polls(2);
        let connector = connector(&backend);
        connector.add_dataset("events").await.unwrap();
        connector.create_table_if_not_exists("events", "a", &schema(), 0).await.unwrap();
        connector.create_table_if_not_exists("events", "b", &schema(), 0).await.unwrap();
        connector.save_events("events", "a", &[score(1), score(2)]).await.unwrap();
        connector.save_events("events", "b", &[score(9)]).await.unwrap();

        connector.copy_table("events", "a", "b").await.unwrap();

        assert_eq!(connector.browse_table("events", "b").await.unwrap(), 2);
        connector.copy_table("events", "a", "b").await.unwrap();
        assert_eq!(connector.browse_table("events", "b").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failed_job_surfaces_error() {
        let backend = MemoryBackend::new();
        let connector = connector(&backend);
        connector.add_dataset("events").await.unwrap();

        let err = connector.copy_table("events", "missing", "b").await.unwrap_err();
        match err {
            ConnectorError::JobFailed { job_id, message } => {
                assert!(job_id.starts_with("bqlink_copy_"));
                assert!(message.contains("Not found"));
            }
            other => panic!("Expected JobFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_job_status_errors_propagate() {
        let backend = MemoryBackend::new();
        let connector = connector(&backend);
        connector.add_dataset("events").await.unwrap();
        connector.create_table_if_not_exists("events", "a", &schema(), 0).await.unwrap();
        backend
            .fail_on(Operation::JobStatus, ConnectorError::Network("timeout".to_string()))
            .await;

        assert!(matches!(
            connector.copy_table("events", "a", "b").await,
            Err(ConnectorError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_import_missing_file() {
        let connector = connector(&MemoryBackend::new());
        let result = connector
            .import_from_file("events", "scores", "/nonexistent/bqlink/scores.csv")
            .await;
        assert!(matches!(result, Err(ConnectorError::Io(_))));
    }

    #[tokio::test]
    async fn test_import_requires_existing_table() {
        let backend = MemoryBackend::new();
        let connector = connector(&backend);
        connector.add_dataset("events").await.unwrap();

        let uri = ObjectUri::parse("gs://bucket/scores.csv").unwrap();
        backend.put_object(&uri, "n1,12\n").await;

        let err = connector.import_from_uri("events", "scores", &uri).await.unwrap_err();
        assert!(matches!(err, ConnectorError::JobFailed { .. }));
    }

    #[tokio::test]
    async fn test_unregistered_dataset_resolves_in_project() {
        let backend = MemoryBackend::new();
        let connector = connector(&backend);

        // Created behind the connector's back
        backend
            .create_dataset(&DatasetRef::new("test-project", "legacy"), None)
            .await
            .unwrap();

        let table = connector
            .create_table_if_not_exists("legacy", "scores", &schema(), 0)
            .await
            .unwrap();
        assert_eq!(table.fqn(), "test-project.legacy.scores");
        assert!(connector.registered_datasets().await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_requires_credentials_dir() {
        let result = WarehouseConnector::connect(&config()).await;
        assert!(matches!(result, Err(ConnectorError::Config(msg)) if msg == "Missing BigQuery credentials path"));
    }

    #[tokio::test]
    async fn test_connect_missing_key_file() {
        let config = config().with_credentials_dir("/nonexistent/bqlink-credentials");
        let result = WarehouseConnector::connect(&config).await;
        assert!(matches!(result, Err(ConnectorError::Authentication(_))));
    }
}
