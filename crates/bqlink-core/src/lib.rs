//! bqlink Core
//!
//! Domain model shared by the connector and the CLI: table schemas,
//! identifier validation and connector configuration.
//! Schema JSON is part of the public API - never rename serialized fields.

pub mod schema;
pub mod ident;
pub mod config;

pub use schema::{LogicalType, Column, Schema, Mode, SchemaError};
pub use ident::{ObjectUri, IdentError, validate_dataset_id, validate_table_id};
pub use config::{ConnectorConfig, JobSettings, InsertSettings, LoadSettings, ExtractSettings, ConfigError};
