//! In-memory warehouse backend
//!
//! This backend keeps datasets, tables, an object store and jobs in memory.
//! It follows the warehouse's semantics closely enough to exercise the
//! connector end to end:
//! - CSV load jobs with jagged-row tolerance and create dispositions
//! - CSV extract jobs into the in-memory object store
//! - Copy jobs with write dispositions
//! - Streaming inserts with `skip_invalid_rows` / `ignore_unknown_values`
//! - Paginated row reads
//!
//! ## Simulating Failures
//!
//! ```rust,ignore
//! // Simulate connection failure
//! let backend = MemoryBackend::new().with_connection_failure();
//! assert!(backend.test_connection().await.is_err());
//!
//! // Fail every table deletion
//! backend.fail_on(Operation::DeleteTable, ConnectorError::PermissionDenied("no".into())).await;
//!
//! // Jobs report RUNNING for three polls before finishing
//! let backend = MemoryBackend::new().with_job_polls(3);
//! ```

use crate::backend::{
    ConnectorError, DatasetRef, InsertOptions, InsertOutcome, InsertRow, RowError, RowPage,
    TableDefinition, TableRef, WarehouseBackend,
};
use crate::job::{CreateDisposition, ExtractOptions, JobHandle, JobSpec, JobStatus, LoadOptions, LoadSource, WriteDisposition};
use bqlink_core::{Column, LogicalType, Mode, ObjectUri, Schema};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Backend operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateDataset,
    ListDatasets,
    CreateTable,
    TableSchema,
    ListTables,
    ListRows,
    DeleteTable,
    InsertRows,
    SubmitJob,
    JobStatus,
}

struct TableState {
    schema: Schema,
    partition_expiration: Option<Duration>,
    rows: Vec<Vec<Value>>,
}

#[derive(Default)]
struct DatasetState {
    location: Option<String>,
    tables: BTreeMap<String, TableState>,
}

struct JobRecord {
    status: JobStatus,
    polls_remaining: u32,
}

#[derive(Default)]
struct WarehouseState {
    datasets: BTreeMap<(String, String), DatasetState>,
    objects: BTreeMap<String, Vec<u8>>,
    jobs: HashMap<String, JobRecord>,
}

impl WarehouseState {
    fn table(&self, table: &TableRef) -> Result<&TableState, String> {
        self.datasets
            .get(&(table.project.clone(), table.dataset.clone()))
            .and_then(|d| d.tables.get(&table.table))
            .ok_or_else(|| format!("Not found: Table {}", table.fqn()))
    }

    fn dataset_mut(&mut self, dataset: &DatasetRef) -> Result<&mut DatasetState, String> {
        self.datasets
            .get_mut(&(dataset.project.clone(), dataset.dataset.clone()))
            .ok_or_else(|| format!("Not found: Dataset {}", dataset))
    }
}

/// In-memory warehouse backend
///
/// Cloning shares the underlying warehouse, so a test can keep a handle for
/// inspection while the connector owns another.
#[derive(Clone)]
pub struct MemoryBackend {
    /// Datasets, tables, objects and jobs
    state: Arc<RwLock<WarehouseState>>,

    /// Errors to return for specific operations
    errors: Arc<RwLock<HashMap<Operation, ConnectorError>>>,

    /// Simulate connection failure
    fail_connection: bool,

    /// Simulate call latency (milliseconds)
    latency_ms: u64,

    /// Rows per `list_rows` page
    page_size: usize,

    /// Polls answered with RUNNING before a job reports DONE
    job_polls: u32,
}

impl MemoryBackend {
    /// Create an empty warehouse
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(WarehouseState::default())),
            errors: Arc::new(RwLock::new(HashMap::new())),
            fail_connection: false,
            latency_ms: 0,
            page_size: 1000,
            job_polls: 0,
        }
    }

    /// Configure to fail all connection tests
    pub fn with_connection_failure(mut self) -> Self {
        self.fail_connection = true;
        self
    }

    /// Configure simulated latency for all operations
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Configure the number of rows returned per page
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Configure how many status polls a job stays RUNNING
    pub fn with_job_polls(mut self, polls: u32) -> Self {
        self.job_polls = polls;
        self
    }

    /// Make every call of `operation` fail with `error`
    pub async fn fail_on(&self, operation: Operation, error: ConnectorError) {
        self.errors.write().await.insert(operation, error);
    }

    /// Clear all injected errors
    pub async fn clear_errors(&self) {
        self.errors.write().await.clear();
    }

    /// Store an object, as if uploaded to object storage
    pub async fn put_object(&self, uri: &ObjectUri, data: impl Into<Vec<u8>>) {
        self.state.write().await.objects.insert(uri.to_string(), data.into());
    }

    /// Read back a stored object
    pub async fn object(&self, uri: &ObjectUri) -> Option<Vec<u8>> {
        self.state.read().await.objects.get(&uri.to_string()).cloned()
    }

    /// URIs of all stored objects
    pub async fn object_uris(&self) -> Vec<String> {
        self.state.read().await.objects.keys().cloned().collect()
    }

    /// Rows of a table, values in schema column order
    pub async fn rows(&self, table: &TableRef) -> Option<Vec<Vec<Value>>> {
        self.state.read().await.table(table).ok().map(|t| t.rows.clone())
    }

    /// Partition expiration a table was created with
    pub async fn partition_expiration(&self, table: &TableRef) -> Option<Duration> {
        self.state
            .read()
            .await
            .table(table)
            .ok()
            .and_then(|t| t.partition_expiration)
    }

    /// Location a dataset was created in
    pub async fn dataset_location(&self, dataset: &DatasetRef) -> Option<String> {
        self.state
            .read()
            .await
            .datasets
            .get(&(dataset.project.clone(), dataset.dataset.clone()))
            .and_then(|d| d.location.clone())
    }

    /// Number of datasets across all projects
    pub async fn dataset_count(&self) -> usize {
        self.state.read().await.datasets.len()
    }

    /// Number of jobs ever submitted
    pub async fn job_count(&self) -> usize {
        self.state.read().await.jobs.len()
    }

    /// Simulate latency if configured
    async fn simulate_latency(&self) {
        if self.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.latency_ms)).await;
        }
    }

    /// Latency plus any injected error for `operation`
    async fn enter(&self, operation: Operation) -> Result<(), ConnectorError> {
        self.simulate_latency().await;

        match self.errors.read().await.get(&operation) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl WarehouseBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "Memory"
    }

    async fn test_connection(&self) -> Result<(), ConnectorError> {
        self.simulate_latency().await;

        if self.fail_connection {
            Err(ConnectorError::Network(
                "Simulated connection failure".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    async fn create_dataset(&self, dataset: &DatasetRef, location: Option<&str>) -> Result<(), ConnectorError> {
        self.enter(Operation::CreateDataset).await?;

        let mut state = self.state.write().await;
        let key = (dataset.project.clone(), dataset.dataset.clone());
        if state.datasets.contains_key(&key) {
            return Err(ConnectorError::AlreadyExists(format!("Dataset {}", dataset)));
        }
        state.datasets.insert(
            key,
            DatasetState {
                location: location.map(str::to_string),
                tables: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn list_datasets(&self, project: &str) -> Result<Vec<String>, ConnectorError> {
        self.enter(Operation::ListDatasets).await?;

        let state = self.state.read().await;
        Ok(state
            .datasets
            .keys()
            .filter(|(p, _)| p == project)
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn create_table(&self, table: &TableRef, definition: &TableDefinition) -> Result<(), ConnectorError> {
        self.enter(Operation::CreateTable).await?;
        definition.schema.validate()?;

        let mut state = self.state.write().await;
        let dataset = state
            .dataset_mut(&table.dataset_ref())
            .map_err(ConnectorError::NotFound)?;
        if dataset.tables.contains_key(&table.table) {
            return Err(ConnectorError::AlreadyExists(format!("Table {}", table.fqn())));
        }
        dataset.tables.insert(
            table.table.clone(),
            TableState {
                schema: definition.schema.clone(),
                partition_expiration: definition.partition_expiration,
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn table_schema(&self, table: &TableRef) -> Result<Schema, ConnectorError> {
        self.enter(Operation::TableSchema).await?;

        let state = self.state.read().await;
        state
            .table(table)
            .map(|t| t.schema.clone())
            .map_err(ConnectorError::NotFound)
    }

    async fn list_tables(&self, dataset: &DatasetRef) -> Result<Vec<String>, ConnectorError> {
        self.enter(Operation::ListTables).await?;

        let state = self.state.read().await;
        state
            .datasets
            .get(&(dataset.project.clone(), dataset.dataset.clone()))
            .map(|d| d.tables.keys().cloned().collect())
            .ok_or_else(|| ConnectorError::NotFound(format!("Dataset {}", dataset)))
    }

    async fn list_rows(&self, table: &TableRef, page_token: Option<String>) -> Result<RowPage, ConnectorError> {
        self.enter(Operation::ListRows).await?;

        let start = match page_token {
            Some(token) => token.parse::<usize>().map_err(|_| {
                ConnectorError::InvalidRequest(format!("Invalid page token '{}'", token))
            })?,
            None => 0,
        };

        let state = self.state.read().await;
        let rows = &state.table(table).map_err(ConnectorError::NotFound)?.rows;
        let end = start.saturating_add(self.page_size).min(rows.len());
        let page = rows.get(start..end).map(|r| r.to_vec()).unwrap_or_default();

        Ok(RowPage {
            rows: page,
            next_page_token: (end < rows.len()).then(|| end.to_string()),
        })
    }

    async fn delete_table(&self, table: &TableRef) -> Result<(), ConnectorError> {
        self.enter(Operation::DeleteTable).await?;

        let mut state = self.state.write().await;
        let dataset = state
            .dataset_mut(&table.dataset_ref())
            .map_err(ConnectorError::NotFound)?;
        dataset
            .tables
            .remove(&table.table)
            .map(|_| ())
            .ok_or_else(|| ConnectorError::NotFound(format!("Table {}", table.fqn())))
    }

    async fn insert_rows(
        &self,
        table: &TableRef,
        rows: Vec<InsertRow>,
        options: &InsertOptions,
    ) -> Result<InsertOutcome, ConnectorError> {
        self.enter(Operation::InsertRows).await?;

        let mut state = self.state.write().await;
        let schema = state.table(table).map_err(ConnectorError::NotFound)?.schema.clone();

        let mut accepted = Vec::with_capacity(rows.len());
        let mut row_errors = Vec::new();
        for (index, row) in rows.iter().enumerate() {
            let converted = match &row.json {
                Value::Object(object) => coerce_object(&schema.columns, object, options.ignore_unknown_values),
                other => Err(format!("Row must be a JSON object, got {}", other)),
            };
            match converted {
                Ok(values) => accepted.push(values),
                Err(message) => row_errors.push(RowError { index, message }),
            }
        }

        let inserted = if row_errors.is_empty() || options.skip_invalid_rows {
            accepted.len()
        } else {
            0
        };
        if inserted > 0 {
            let dataset = state
                .dataset_mut(&table.dataset_ref())
                .map_err(ConnectorError::NotFound)?;
            if let Some(target) = dataset.tables.get_mut(&table.table) {
                target.rows.extend(accepted);
            }
        }

        Ok(InsertOutcome { inserted, row_errors })
    }

    async fn submit_job(&self, handle: JobHandle, spec: &JobSpec) -> Result<JobHandle, ConnectorError> {
        self.enter(Operation::SubmitJob).await?;

        let mut state = self.state.write().await;
        if state.jobs.contains_key(&handle.job_id) {
            return Err(ConnectorError::AlreadyExists(format!("Job {}", handle.job_id)));
        }

        let status = match run_job(&mut state, spec) {
            Ok(()) => JobStatus::succeeded(),
            Err(message) => JobStatus::failed(message),
        };
        state.jobs.insert(
            handle.job_id.clone(),
            JobRecord {
                status,
                polls_remaining: self.job_polls,
            },
        );

        Ok(handle)
    }

    async fn job_status(&self, handle: &JobHandle) -> Result<JobStatus, ConnectorError> {
        self.enter(Operation::JobStatus).await?;

        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(&handle.job_id)
            .ok_or_else(|| ConnectorError::NotFound(format!("Job {}", handle.job_id)))?;

        if job.polls_remaining > 0 {
            job.polls_remaining -= 1;
            return Ok(JobStatus::running());
        }
        Ok(job.status.clone())
    }
}

/// Execute a job against the warehouse; the error is the job's terminal error
fn run_job(state: &mut WarehouseState, spec: &JobSpec) -> Result<(), String> {
    match spec {
        JobSpec::Copy { source, destination, write_disposition } => {
            let (schema, rows) = {
                let table = state.table(source)?;
                (table.schema.clone(), table.rows.clone())
            };
            let dataset = state.dataset_mut(&destination.dataset_ref())?;

            match dataset.tables.get_mut(&destination.table) {
                Some(target) => {
                    write_rows(target, rows, *write_disposition, destination)?;
                    if *write_disposition == WriteDisposition::WriteTruncate {
                        target.schema = schema;
                    }
                }
                None => {
                    dataset.tables.insert(
                        destination.table.clone(),
                        TableState {
                            schema,
                            partition_expiration: None,
                            rows,
                        },
                    );
                }
            }
            Ok(())
        }
        JobSpec::Load { destination, source, options } => {
            let schema = match state.table(destination) {
                Ok(table) => table.schema.clone(),
                Err(message) => {
                    return Err(match options.create_disposition {
                        CreateDisposition::CreateNever => message,
                        CreateDisposition::CreateIfNeeded => format!(
                            "Schema is required to create {} from CSV",
                            destination.fqn()
                        ),
                    });
                }
            };

            let mut rows = Vec::new();
            for (name, data) in load_inputs(state, source)? {
                rows.extend(parse_csv(&schema, &data, options).map_err(|e| format!("{}: {}", name, e))?);
            }

            let dataset = state.dataset_mut(&destination.dataset_ref())?;
            let target = dataset
                .tables
                .get_mut(&destination.table)
                .ok_or_else(|| format!("Not found: Table {}", destination.fqn()))?;
            write_rows(target, rows, options.write_disposition, destination)
        }
        JobSpec::Extract { source, destination, options } => {
            let table = state.table(source)?;
            let data = render_csv(&table.schema, &table.rows, options)?;

            // A wildcard destination is sharded; everything fits in the first shard
            let path = destination.path.replacen('*', "000000000000", 1);
            let uri = ObjectUri {
                path,
                ..destination.clone()
            };
            state.objects.insert(uri.to_string(), data);
            Ok(())
        }
    }
}

fn write_rows(
    target: &mut TableState,
    rows: Vec<Vec<Value>>,
    disposition: WriteDisposition,
    table: &TableRef,
) -> Result<(), String> {
    match disposition {
        WriteDisposition::WriteTruncate => target.rows = rows,
        WriteDisposition::WriteAppend => target.rows.extend(rows),
        WriteDisposition::WriteEmpty => {
            if !target.rows.is_empty() {
                return Err(format!("Already Exists: Table {} is not empty", table.fqn()));
            }
            target.rows = rows;
        }
    }
    Ok(())
}

/// Named inputs of a load job, in URI order for wildcard sources
fn load_inputs(state: &WarehouseState, source: &LoadSource) -> Result<Vec<(String, Vec<u8>)>, String> {
    match source {
        LoadSource::Inline { name, data } => Ok(vec![(name.clone(), data.clone())]),
        LoadSource::Uri(pattern) => {
            let inputs: Vec<(String, Vec<u8>)> = state
                .objects
                .iter()
                .filter(|(uri, _)| {
                    ObjectUri::parse(uri)
                        .map(|candidate| pattern.matches(&candidate))
                        .unwrap_or(false)
                })
                .map(|(uri, data)| (uri.clone(), data.clone()))
                .collect();

            if inputs.is_empty() {
                Err(format!("Not found: URI {}", pattern))
            } else {
                Ok(inputs)
            }
        }
    }
}

fn parse_csv(schema: &Schema, data: &[u8], options: &LoadOptions) -> Result<Vec<Vec<Value>>, String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(options.field_delimiter)
        .from_reader(data);

    let mut rows = Vec::new();
    for (line, record) in reader
        .records()
        .enumerate()
        .skip(options.skip_leading_rows as usize)
    {
        let record = record.map_err(|e| e.to_string())?;
        let line = line + 1;

        if record.len() > schema.len() {
            return Err(format!(
                "Too many values in row starting at line {}: expected {}, found {}",
                line,
                schema.len(),
                record.len()
            ));
        }
        if record.len() < schema.len() && !options.allow_jagged_rows {
            return Err(format!(
                "Missing values in row starting at line {}: expected {}, found {}",
                line,
                schema.len(),
                record.len()
            ));
        }

        let row = schema
            .columns
            .iter()
            .enumerate()
            .map(|(i, column)| from_csv_field(column, record.get(i).unwrap_or("")))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("line {}: {}", line, e))?;
        rows.push(row);
    }

    Ok(rows)
}

fn render_csv(schema: &Schema, rows: &[Vec<Value>], options: &ExtractOptions) -> Result<Vec<u8>, String> {
    if let Some(column) = schema
        .columns
        .iter()
        .find(|c| c.mode == Mode::Repeated || matches!(c.logical_type, LogicalType::Struct { .. }))
    {
        return Err(format!(
            "Operation cannot be performed on a nested schema. Field: {}",
            column.name
        ));
    }

    let mut writer = csv::WriterBuilder::new()
        .delimiter(options.field_delimiter)
        .from_writer(Vec::new());

    if options.print_header {
        writer.write_record(schema.column_names()).map_err(|e| e.to_string())?;
    }
    for row in rows {
        writer
            .write_record(row.iter().map(to_csv_field))
            .map_err(|e| e.to_string())?;
    }

    writer.into_inner().map_err(|e| e.to_string())
}

fn to_csv_field(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn from_csv_field(column: &Column, field: &str) -> Result<Value, String> {
    if column.mode == Mode::Repeated || matches!(column.logical_type, LogicalType::Struct { .. }) {
        return Err(format!("Cannot load {} column '{}' from CSV", column.logical_type, column.name));
    }
    if field.is_empty() {
        return null_for(column);
    }
    coerce_value(&column.logical_type, &Value::String(field.to_string()))
        .map_err(|e| format!("column '{}': {}", column.name, e))
}

fn null_for(column: &Column) -> Result<Value, String> {
    match column.mode {
        Mode::Required => Err(format!("Missing required field: {}", column.name)),
        Mode::Repeated => Ok(Value::Array(Vec::new())),
        Mode::Nullable => Ok(Value::Null),
    }
}

/// Convert a JSON object into values in column order
fn coerce_object(columns: &[Column], object: &Map<String, Value>, ignore_unknown: bool) -> Result<Vec<Value>, String> {
    if !ignore_unknown {
        if let Some(unknown) = object.keys().find(|k| !columns.iter().any(|c| &c.name == *k)) {
            return Err(format!("no such field: {}", unknown));
        }
    }

    columns
        .iter()
        .map(|column| match object.get(&column.name) {
            None | Some(Value::Null) => null_for(column),
            Some(value) => coerce_column(column, value, ignore_unknown),
        })
        .collect()
}

fn coerce_column(column: &Column, value: &Value, ignore_unknown: bool) -> Result<Value, String> {
    let convert = |v: &Value| -> Result<Value, String> {
        match &column.logical_type {
            LogicalType::Struct { fields } => {
                let object = v
                    .as_object()
                    .ok_or_else(|| format!("field {} must be an object", column.name))?;
                let values = coerce_object(fields, object, ignore_unknown)?;
                Ok(Value::Object(
                    fields.iter().map(|f| f.name.clone()).zip(values).collect(),
                ))
            }
            other => coerce_value(other, v).map_err(|e| format!("field {}: {}", column.name, e)),
        }
    };

    if column.mode == Mode::Repeated {
        let items = value
            .as_array()
            .ok_or_else(|| format!("field {} must be an array", column.name))?;
        if items.iter().any(Value::is_null) {
            return Err(format!("field {} contains a null element", column.name));
        }
        return items.iter().map(convert).collect::<Result<Vec<_>, _>>().map(Value::Array);
    }

    convert(value)
}

/// Normalize a scalar to its stored form
fn coerce_value(logical_type: &LogicalType, value: &Value) -> Result<Value, String> {
    match (logical_type, value) {
        (LogicalType::Json, v) => Ok(v.clone()),

        (LogicalType::Bool, Value::Bool(b)) => Ok(Value::Bool(*b)),
        (LogicalType::Bool, Value::String(s)) => match s.to_lowercase().as_str() {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(format!("invalid boolean '{}'", s)),
        },

        (LogicalType::Int, Value::Number(n)) => n
            .as_i64()
            .map(Value::from)
            .ok_or_else(|| format!("invalid integer {}", n)),
        (LogicalType::Int, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| format!("invalid integer '{}'", s)),

        (LogicalType::Float, Value::Number(n)) => n
            .as_f64()
            .map(Value::from)
            .ok_or_else(|| format!("invalid float {}", n)),
        (LogicalType::Float, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("invalid float '{}'", s)),

        // Decimals keep their textual form to stay exact
        (LogicalType::Decimal { .. }, Value::Number(n)) => Ok(Value::String(n.to_string())),
        (LogicalType::Decimal { .. }, Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.parse::<f64>().is_ok() {
                Ok(Value::String(trimmed.to_string()))
            } else {
                Err(format!("invalid numeric '{}'", s))
            }
        }

        (LogicalType::String, Value::String(s)) => Ok(Value::String(s.clone())),
        (LogicalType::String, Value::Number(n)) => Ok(Value::String(n.to_string())),
        (LogicalType::String, Value::Bool(b)) => Ok(Value::String(b.to_string())),

        (
            LogicalType::Bytes | LogicalType::Date | LogicalType::Time | LogicalType::Datetime,
            Value::String(s),
        ) => Ok(Value::String(s.clone())),
        (LogicalType::Timestamp, Value::String(s)) => Ok(Value::String(s.clone())),
        (LogicalType::Timestamp, Value::Number(n)) => Ok(Value::String(n.to_string())),

        (other, v) => Err(format!("cannot convert {} to {}", v, other)),
    }
}
