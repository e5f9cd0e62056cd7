//! Warehouse backend trait and the identifiers and errors it works with

use crate::job::{JobHandle, JobSpec, JobStatus};
use bqlink_core::{IdentError, InsertSettings, Schema, SchemaError};
use std::fmt;
use std::time::Duration;

/// Identifies a dataset in a warehouse project
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatasetRef {
    /// Project id
    pub project: String,

    /// Dataset id
    pub dataset: String,
}

impl DatasetRef {
    pub fn new(project: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
        }
    }

    /// Reference to a table inside this dataset
    pub fn table(&self, table: impl Into<String>) -> TableRef {
        TableRef::new(&self.project, &self.dataset, table)
    }
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.project, self.dataset)
    }
}

/// Identifies a table in a warehouse
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    /// Project id
    pub project: String,

    /// Dataset id
    pub dataset: String,

    /// Table id
    pub table: String,
}

impl TableRef {
    /// Create a new table reference
    pub fn new(project: impl Into<String>, dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// Get fully qualified name
    pub fn fqn(&self) -> String {
        format!("{}.{}.{}", self.project, self.dataset, self.table)
    }

    /// The dataset holding this table
    pub fn dataset_ref(&self) -> DatasetRef {
        DatasetRef::new(&self.project, &self.dataset)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fqn())
    }
}

/// Everything needed to create a table
#[derive(Debug, Clone, PartialEq)]
pub struct TableDefinition {
    /// Column layout
    pub schema: Schema,

    /// Daily partitions older than this are dropped; `None` keeps them forever
    pub partition_expiration: Option<Duration>,
}

/// Streaming insert options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOptions {
    pub skip_invalid_rows: bool,
    pub ignore_unknown_values: bool,
}

impl From<&InsertSettings> for InsertOptions {
    fn from(settings: &InsertSettings) -> Self {
        Self {
            skip_invalid_rows: settings.skip_invalid_rows,
            ignore_unknown_values: settings.ignore_unknown_values,
        }
    }
}

/// One row of a streaming insert
#[derive(Debug, Clone, PartialEq)]
pub struct InsertRow {
    /// De-duplication id
    pub insert_id: Option<String>,

    /// Row as a JSON object keyed by column name
    pub json: serde_json::Value,
}

/// A row rejected by a streaming insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    /// Index of the row in the request
    pub index: usize,

    pub message: String,
}

/// Result of one streaming insert request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Rows stored by the warehouse
    pub inserted: usize,

    /// Rows rejected by the warehouse
    pub row_errors: Vec<RowError>,
}

/// One page of table rows, values in schema column order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowPage {
    pub rows: Vec<Vec<serde_json::Value>>,

    /// Token of the next page, `None` on the last page
    pub next_page_token: Option<String>,
}

/// Errors returned by backends and the connector
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectorError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Insert into {table} rejected {failed} of {total} rows: {message}")]
    InsertFailed {
        table: String,
        failed: usize,
        total: usize,
        message: String,
    },

    #[error("Job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },

    #[error("IO error: {0}")]
    Io(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Warehouse error: {0}")]
    Remote(String),
}

impl ConnectorError {
    /// Whether the remote object already existed
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// Whether the remote object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Classify an error message returned by the warehouse API
    pub fn from_remote(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if lower.contains("already exists") || message.contains("ALREADY_EXISTS") || message.contains("code: 409") {
            Self::AlreadyExists(message)
        } else if lower.contains("not found") || message.contains("NOT_FOUND") || message.contains("code: 404") {
            Self::NotFound(message)
        } else if lower.contains("access denied")
            || message.contains("PERMISSION_DENIED")
            || message.contains("code: 403")
        {
            Self::PermissionDenied(message)
        } else {
            Self::Remote(message)
        }
    }
}

impl From<IdentError> for ConnectorError {
    fn from(e: IdentError) -> Self {
        Self::InvalidRequest(e.to_string())
    }
}

impl From<SchemaError> for ConnectorError {
    fn from(e: SchemaError) -> Self {
        Self::InvalidRequest(e.to_string())
    }
}

impl From<std::io::Error> for ConnectorError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// A warehouse service the connector delegates to
///
/// Every method is a single remote call (or a cursor walked to completion for
/// the listing calls). Implementations never retry.
#[async_trait::async_trait]
pub trait WarehouseBackend: Send + Sync {
    /// Get the backend name (e.g., "BigQuery")
    fn name(&self) -> &'static str;

    /// Check that the service is reachable with the configured credentials
    async fn test_connection(&self) -> Result<(), ConnectorError>;

    /// Create a dataset; `AlreadyExists` if it is already there
    async fn create_dataset(&self, dataset: &DatasetRef, location: Option<&str>) -> Result<(), ConnectorError>;

    /// Ids of all datasets in a project
    async fn list_datasets(&self, project: &str) -> Result<Vec<String>, ConnectorError>;

    /// Create a table; `AlreadyExists` if it is already there
    async fn create_table(&self, table: &TableRef, definition: &TableDefinition) -> Result<(), ConnectorError>;

    /// Current schema of a table
    async fn table_schema(&self, table: &TableRef) -> Result<Schema, ConnectorError>;

    /// Ids of all tables in a dataset
    async fn list_tables(&self, dataset: &DatasetRef) -> Result<Vec<String>, ConnectorError>;

    /// Read one page of rows
    async fn list_rows(&self, table: &TableRef, page_token: Option<String>) -> Result<RowPage, ConnectorError>;

    async fn delete_table(&self, table: &TableRef) -> Result<(), ConnectorError>;

    /// Streaming insert of one request's worth of rows
    async fn insert_rows(
        &self,
        table: &TableRef,
        rows: Vec<InsertRow>,
        options: &InsertOptions,
    ) -> Result<InsertOutcome, ConnectorError>;

    /// Start a job under the id carried by `handle`
    ///
    /// Returns the handle to poll, which may carry the location the service
    /// chose for the job.
    async fn submit_job(&self, handle: JobHandle, spec: &JobSpec) -> Result<JobHandle, ConnectorError>;

    /// Current status of a job
    async fn job_status(&self, handle: &JobHandle) -> Result<JobStatus, ConnectorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_ref() {
        let table = TableRef::new("my_project", "my_dataset", "my_table");
        assert_eq!(table.project, "my_project");
        assert_eq!(table.dataset, "my_dataset");
        assert_eq!(table.table, "my_table");
        assert_eq!(table.fqn(), "my_project.my_dataset.my_table");
        assert_eq!(table.to_string(), "my_project.my_dataset.my_table");
        assert_eq!(table.dataset_ref(), DatasetRef::new("my_project", "my_dataset"));
    }

    #[test]
    fn test_dataset_ref_table() {
        let dataset = DatasetRef::new("p", "events");
        assert_eq!(dataset.to_string(), "p.events");
        assert_eq!(dataset.table("clicks").fqn(), "p.events.clicks");
    }

    #[test]
    fn test_remote_error_classification() {
        assert!(ConnectorError::from_remote("Already Exists: Dataset p:testdataset").is_already_exists());
        assert!(ConnectorError::from_remote("Response error (code: 409, status: \"ALREADY_EXISTS\")").is_already_exists());
        assert!(ConnectorError::from_remote("Not found: Table p:d.t").is_not_found());
        assert!(matches!(
            ConnectorError::from_remote("Access Denied: Dataset p:d"),
            ConnectorError::PermissionDenied(_)
        ));
        assert!(matches!(
            ConnectorError::from_remote("Backend error"),
            ConnectorError::Remote(_)
        ));
    }
}
