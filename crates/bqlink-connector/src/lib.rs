//! Data-warehouse connector
//!
//! Dataset and table management, streaming inserts and CSV import/export
//! jobs against Google BigQuery, behind a small backend trait.
//!
//! ## Features
//!
//! Enable warehouse support via Cargo features:
//! - `bigquery` - Google BigQuery support
//!
//! The in-memory backend is always available.
//!
//! ## Example
//!
//! ```rust,ignore
//! use bqlink_connector::WarehouseConnector;
//! use bqlink_core::{ConnectorConfig, Schema};
//!
//! let config = ConnectorConfig::new("my-project").with_credentials_dir("/etc/bqlink");
//! let connector = WarehouseConnector::connect(&config).await?;
//! connector.add_dataset("events").await?;
//! let tables = connector.list_tables("events").await?;
//! ```

pub mod backend;
pub mod job;
pub mod bigquery;
pub mod memory;
pub mod connector;

pub use backend::{
    WarehouseBackend, DatasetRef, TableRef, TableDefinition, InsertOptions, InsertRow,
    InsertOutcome, RowError, RowPage, ConnectorError,
};
pub use job::{
    JobSpec, JobHandle, JobState, JobStatus, LoadSource, LoadOptions, ExtractOptions,
    WriteDisposition, CreateDisposition,
};
pub use bigquery::BigQueryBackend;
pub use memory::{MemoryBackend, Operation};
pub use connector::{WarehouseConnector, InsertSummary, insert_id};
