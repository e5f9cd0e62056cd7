//! BigQuery warehouse backend
//!
//! Talks to the BigQuery REST API through `gcp-bigquery-client`. It requires
//! the following IAM permissions:
//! - bigquery.datasets.create, bigquery.datasets.get
//! - bigquery.tables.create, bigquery.tables.get, bigquery.tables.list,
//!   bigquery.tables.delete, bigquery.tables.getData, bigquery.tables.updateData
//! - bigquery.jobs.create
//!
//! ## Authentication
//!
//! The backend supports multiple authentication methods:
//! 1. Service account JSON file (explicit path)
//! 2. Service account JSON content (inline)
//! 3. Application Default Credentials (ADC)
//!
//! Loading a local file uploads it with the load job, which needs a service
//! account key; with ADC only object-storage imports are available.
//!
//! ## Usage
//!
//! ```rust,ignore
//! // Using ADC
//! let backend = BigQueryBackend::with_adc("my-project").await?;
//!
//! // Using service account file
//! let backend = BigQueryBackend::from_service_account_file(
//!     "my-project",
//!     "/path/to/keyfile.json"
//! ).await?;
//! ```

use crate::backend::{ConnectorError, RowError, TableDefinition, TableRef};
use crate::job::{JobSpec, JobState, JobStatus, LoadSource};
use bqlink_core::{Column, LogicalType, Mode, Schema};
use serde_json::{json, Map, Value};

#[cfg(feature = "bigquery")]
use crate::backend::{DatasetRef, InsertOptions, InsertOutcome, InsertRow, RowPage, WarehouseBackend};
#[cfg(feature = "bigquery")]
use crate::job::JobHandle;
#[cfg(feature = "bigquery")]
use gcp_bigquery_client::{
    model::dataset::Dataset,
    model::job::Job,
    model::table::Table,
    model::table_data_insert_all_request::TableDataInsertAllRequest,
    model::table_data_insert_all_request_rows::TableDataInsertAllRequestRows,
    tabledata::ListQueryParameters,
    yup_oauth2::ServiceAccountKey,
    Client as BigQueryClient,
};

#[cfg(not(feature = "bigquery"))]
const NOT_COMPILED: &str = "BigQuery support not compiled. Rebuild with: cargo build --features bigquery";

/// OAuth scope for the BigQuery API
pub const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";

/// REST endpoint for project resources
pub const API_URL: &str = "https://bigquery.googleapis.com/bigquery/v2/projects";

/// Endpoint for load jobs that carry their data in the request
pub const UPLOAD_URL: &str = "https://bigquery.googleapis.com/upload/bigquery/v2/projects";

/// BigQuery warehouse backend
pub struct BigQueryBackend {
    /// Project ID
    project_id: String,

    /// BigQuery client (only available with bigquery feature)
    #[cfg(feature = "bigquery")]
    client: BigQueryClient,

    /// Key used to authorize media uploads
    #[cfg(feature = "bigquery")]
    service_account: Option<ServiceAccountKey>,

    #[cfg(feature = "bigquery")]
    http: reqwest::Client,

    /// Placeholder for when feature is disabled
    #[cfg(not(feature = "bigquery"))]
    _phantom: std::marker::PhantomData<()>,
}

impl BigQueryBackend {
    /// Create a new BigQuery backend using Application Default Credentials (ADC)
    ///
    /// ADC automatically detects credentials from:
    /// - GOOGLE_APPLICATION_CREDENTIALS environment variable
    /// - gcloud CLI default credentials
    /// - GCE/GKE metadata service
    #[cfg(feature = "bigquery")]
    pub async fn with_adc(project_id: impl Into<String>) -> Result<Self, ConnectorError> {
        let client = BigQueryClient::from_application_default_credentials()
            .await
            .map_err(|e| ConnectorError::Authentication(format!(
                "Failed to authenticate with ADC: {}. \
                 Ensure GOOGLE_APPLICATION_CREDENTIALS is set or run 'gcloud auth application-default login'",
                e
            )))?;

        Ok(Self {
            project_id: project_id.into(),
            client,
            service_account: None,
            http: reqwest::Client::new(),
        })
    }

    /// Create backend without bigquery feature (returns error)
    #[cfg(not(feature = "bigquery"))]
    pub async fn with_adc(project_id: impl Into<String>) -> Result<Self, ConnectorError> {
        let _ = project_id;
        Err(ConnectorError::Config(NOT_COMPILED.to_string()))
    }

    /// Create a new BigQuery backend using a service account key file
    #[cfg(feature = "bigquery")]
    pub async fn from_service_account_file(
        project_id: impl Into<String>,
        key_path: impl AsRef<std::path::Path>,
    ) -> Result<Self, ConnectorError> {
        let key_path = key_path.as_ref();

        let sa_key = gcp_bigquery_client::yup_oauth2::read_service_account_key(key_path)
            .await
            .map_err(|e| ConnectorError::Authentication(format!(
                "Failed to read service account key file '{}': {}",
                key_path.display(),
                e
            )))?;

        Self::from_service_account_key(project_id, sa_key).await
    }

    /// Create backend without bigquery feature (returns error)
    #[cfg(not(feature = "bigquery"))]
    pub async fn from_service_account_file(
        project_id: impl Into<String>,
        _key_path: impl AsRef<std::path::Path>,
    ) -> Result<Self, ConnectorError> {
        let _ = project_id;
        Err(ConnectorError::Config(NOT_COMPILED.to_string()))
    }

    /// Create a new BigQuery backend using service account JSON content
    #[cfg(feature = "bigquery")]
    pub async fn from_service_account_json(
        project_id: impl Into<String>,
        key_json: &str,
    ) -> Result<Self, ConnectorError> {
        let sa_key: ServiceAccountKey = serde_json::from_str(key_json)
            .map_err(|e| ConnectorError::Authentication(format!(
                "Failed to parse service account JSON: {}",
                e
            )))?;

        Self::from_service_account_key(project_id, sa_key).await
    }

    /// Create backend without bigquery feature (returns error)
    #[cfg(not(feature = "bigquery"))]
    pub async fn from_service_account_json(
        project_id: impl Into<String>,
        _key_json: &str,
    ) -> Result<Self, ConnectorError> {
        let _ = project_id;
        Err(ConnectorError::Config(NOT_COMPILED.to_string()))
    }

    #[cfg(feature = "bigquery")]
    async fn from_service_account_key(
        project_id: impl Into<String>,
        sa_key: ServiceAccountKey,
    ) -> Result<Self, ConnectorError> {
        let client = BigQueryClient::from_service_account_key(sa_key.clone(), false)
            .await
            .map_err(|e| ConnectorError::Authentication(format!(
                "Failed to authenticate with service account: {}",
                e
            )))?;

        Ok(Self {
            project_id: project_id.into(),
            client,
            service_account: Some(sa_key),
            http: reqwest::Client::new(),
        })
    }

    /// Project the backend was created for
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Convert BigQuery type to LogicalType
    ///
    /// Record types map to an empty struct; their fields come from the
    /// enclosing field definition.
    pub fn map_bigquery_type(bq_type: &str) -> LogicalType {
        // Handle parameterized types like NUMERIC(10,2)
        let base_type = bq_type.split('(').next()
            .unwrap_or(bq_type)
            .trim()
            .to_uppercase();

        match base_type.as_str() {
            "BOOL" | "BOOLEAN" => LogicalType::Bool,

            "INT64" | "INTEGER" | "INT" | "SMALLINT" | "TINYINT" | "BYTEINT" => LogicalType::Int,

            "FLOAT64" | "FLOAT" => LogicalType::Float,

            "NUMERIC" | "BIGNUMERIC" | "DECIMAL" => {
                // Extract precision and scale if present
                Self::parse_numeric_type(bq_type)
            }

            "BYTES" => LogicalType::Bytes,

            "DATE" => LogicalType::Date,
            "TIME" => LogicalType::Time,
            "DATETIME" => LogicalType::Datetime,
            "TIMESTAMP" => LogicalType::Timestamp,

            "JSON" => LogicalType::Json,

            "STRUCT" | "RECORD" => LogicalType::Struct { fields: vec![] },

            // STRING, GEOGRAPHY (GeoJSON text) and anything newer
            _ => LogicalType::String,
        }
    }

    /// Parse NUMERIC(precision, scale) type
    fn parse_numeric_type(type_str: &str) -> LogicalType {
        if let Some(params) = type_str.split('(').nth(1) {
            if let Some(params) = params.strip_suffix(')') {
                let parts: Vec<&str> = params.split(',').collect();
                if parts.len() == 2 {
                    let precision = parts[0].trim().parse().ok();
                    let scale = parts[1].trim().parse().ok();
                    return LogicalType::Decimal { precision, scale };
                } else if parts.len() == 1 {
                    let precision = parts[0].trim().parse().ok();
                    return LogicalType::Decimal { precision, scale: Some(0) };
                }
            }
        }

        LogicalType::Decimal {
            precision: None,
            scale: None,
        }
    }

    /// Legacy type name used in table definitions
    pub fn bigquery_type_name(logical_type: &LogicalType) -> &'static str {
        match logical_type {
            LogicalType::Bool => "BOOLEAN",
            LogicalType::Int => "INTEGER",
            LogicalType::Float => "FLOAT",
            LogicalType::Decimal { .. } => "NUMERIC",
            LogicalType::String => "STRING",
            LogicalType::Bytes => "BYTES",
            LogicalType::Date => "DATE",
            LogicalType::Time => "TIME",
            LogicalType::Datetime => "DATETIME",
            LogicalType::Timestamp => "TIMESTAMP",
            LogicalType::Json => "JSON",
            LogicalType::Struct { .. } => "RECORD",
        }
    }
}

/// Table field list in the REST representation
pub fn schema_to_api(schema: &Schema) -> Value {
    Value::Array(schema.columns.iter().map(column_to_api).collect())
}

fn column_to_api(column: &Column) -> Value {
    let mut field = Map::new();
    field.insert("name".to_string(), json!(column.name));
    field.insert(
        "type".to_string(),
        json!(BigQueryBackend::bigquery_type_name(&column.logical_type)),
    );
    field.insert("mode".to_string(), json!(column.mode.as_str()));

    if let Some(description) = &column.description {
        field.insert("description".to_string(), json!(description));
    }
    match &column.logical_type {
        LogicalType::Decimal { precision, scale } => {
            if let Some(precision) = precision {
                field.insert("precision".to_string(), json!(precision.to_string()));
            }
            if let Some(scale) = scale {
                field.insert("scale".to_string(), json!(scale.to_string()));
            }
        }
        LogicalType::Struct { fields } => {
            field.insert(
                "fields".to_string(),
                Value::Array(fields.iter().map(column_to_api).collect()),
            );
        }
        _ => {}
    }

    Value::Object(field)
}

/// Parse a REST field list back into a schema
pub fn schema_from_api(fields: &Value) -> Result<Schema, ConnectorError> {
    let fields = fields
        .as_array()
        .ok_or_else(|| ConnectorError::InvalidResponse("Table schema has no field list".to_string()))?;

    fields
        .iter()
        .map(column_from_api)
        .collect::<Result<Vec<_>, _>>()
        .map(Schema::from_columns)
}

fn column_from_api(field: &Value) -> Result<Column, ConnectorError> {
    let name = field["name"]
        .as_str()
        .ok_or_else(|| ConnectorError::InvalidResponse(format!("Field without name: {}", field)))?;
    let type_name = field["type"].as_str().unwrap_or("STRING");

    let logical_type = match BigQueryBackend::map_bigquery_type(type_name) {
        LogicalType::Struct { .. } => LogicalType::Struct {
            fields: schema_from_api(&field["fields"])?.columns,
        },
        LogicalType::Decimal { .. } if field.get("precision").is_some() => LogicalType::Decimal {
            precision: field["precision"].as_str().and_then(|p| p.parse().ok()),
            scale: field["scale"].as_str().and_then(|s| s.parse().ok()),
        },
        other => other,
    };

    let mode = match field["mode"].as_str().map(str::to_uppercase).as_deref() {
        Some("REQUIRED") => Mode::Required,
        Some("REPEATED") => Mode::Repeated,
        _ => Mode::Nullable,
    };

    let mut column = Column::new(name, logical_type).with_mode(mode);
    if let Some(description) = field["description"].as_str() {
        column = column.with_description(description);
    }
    Ok(column)
}

/// Flatten a `{"v": ...}` cell, unwrapping records and repeated values
pub fn decode_cell(cell: &Value) -> Value {
    match cell {
        Value::Object(object) if object.contains_key("f") => match &object["f"] {
            Value::Array(fields) => Value::Array(fields.iter().map(decode_cell).collect()),
            _ => Value::Null,
        },
        Value::Object(object) if object.contains_key("v") => decode_cell(&object["v"]),
        Value::Array(items) => Value::Array(items.iter().map(decode_cell).collect()),
        other => other.clone(),
    }
}

fn table_reference(table: &TableRef) -> Value {
    json!({
        "projectId": table.project,
        "datasetId": table.dataset,
        "tableId": table.table,
    })
}

/// Table resource for a daily-partitioned table
pub fn table_resource(table: &TableRef, definition: &TableDefinition) -> Value {
    let mut partitioning = json!({ "type": "DAY" });
    if let Some(expiration) = definition.partition_expiration {
        partitioning["expirationMs"] = json!(expiration.as_millis().to_string());
    }

    json!({
        "tableReference": table_reference(table),
        "schema": { "fields": schema_to_api(&definition.schema) },
        "timePartitioning": partitioning,
    })
}

/// Whether any column, nested ones included, is a decimal with precision or scale
pub fn has_decimal_parameters(columns: &[Column]) -> bool {
    columns.iter().any(|column| match &column.logical_type {
        LogicalType::Decimal { precision, scale } => precision.is_some() || scale.is_some(),
        LogicalType::Struct { fields } => has_decimal_parameters(fields),
        _ => false,
    })
}

/// Row errors of an `insertAll` response's `insertErrors` list
///
/// Entries whose only reason is `stopped` are valid rows dropped along with
/// a rejected request, not row errors.
pub fn row_errors_from_api(insert_errors: &Value) -> Vec<RowError> {
    let entries = match insert_errors.as_array() {
        Some(entries) => entries,
        None => return Vec::new(),
    };

    entries
        .iter()
        .filter_map(|entry| {
            let reasons: Vec<String> = entry["errors"]
                .as_array()
                .map(|errors| {
                    errors
                        .iter()
                        .filter(|e| e["reason"].as_str() != Some("stopped"))
                        .map(error_text)
                        .collect()
                })
                .unwrap_or_else(|| vec!["unknown error".to_string()]);

            if reasons.is_empty() {
                return None;
            }

            Some(RowError {
                index: entry["index"].as_u64().unwrap_or(0) as usize,
                message: reasons.join("; "),
            })
        })
        .collect()
}

fn error_text(error: &Value) -> String {
    match (error["reason"].as_str(), error["message"].as_str()) {
        (Some(reason), Some(message)) => format!("{}: {}", reason, message),
        (Some(text), None) | (None, Some(text)) => text.to_string(),
        (None, None) => "unknown error".to_string(),
    }
}

fn delimiter(byte: u8) -> String {
    (byte as char).to_string()
}

/// Job `configuration` object for a job spec
pub fn job_configuration(spec: &JobSpec) -> Value {
    match spec {
        JobSpec::Copy { source, destination, write_disposition } => json!({
            "copy": {
                "sourceTable": table_reference(source),
                "destinationTable": table_reference(destination),
                "writeDisposition": write_disposition.as_str(),
            }
        }),
        JobSpec::Load { destination, source, options } => {
            let mut load = json!({
                "destinationTable": table_reference(destination),
                "sourceFormat": "CSV",
                "allowJaggedRows": options.allow_jagged_rows,
                "skipLeadingRows": options.skip_leading_rows,
                "fieldDelimiter": delimiter(options.field_delimiter),
                "createDisposition": options.create_disposition.as_str(),
                "writeDisposition": options.write_disposition.as_str(),
            });
            if let LoadSource::Uri(uri) = source {
                load["sourceUris"] = json!([uri.to_string()]);
            }
            json!({ "load": load })
        }
        JobSpec::Extract { source, destination, options } => json!({
            "extract": {
                "sourceTable": table_reference(source),
                "destinationUris": [destination.to_string()],
                "destinationFormat": "CSV",
                "fieldDelimiter": delimiter(options.field_delimiter),
                "printHeader": options.print_header,
            }
        }),
    }
}

/// Read the status out of a REST job resource
pub fn job_status_from_api(job: &Value) -> Result<JobStatus, ConnectorError> {
    let status = &job["status"];
    let state = status["state"]
        .as_str()
        .and_then(JobState::from_api)
        .ok_or_else(|| ConnectorError::InvalidResponse(format!("Job has no valid state: {}", status)))?;

    let error = status["errorResult"].as_object().map(|e| {
        e.get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string()
    });

    Ok(JobStatus { state, error })
}

/// `multipart/related` body of a media upload: job metadata, then the data
pub fn multipart_body(boundary: &str, metadata: &Value, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(data.len() + 512);
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata.to_string().as_bytes());
    body.extend_from_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}

#[cfg(feature = "bigquery")]
fn remote<E: std::fmt::Display>(e: E) -> ConnectorError {
    ConnectorError::from_remote(e.to_string())
}

/// Query parameters for one page of `tabledata.list`
#[cfg(feature = "bigquery")]
fn list_parameters(page_token: Option<String>) -> ListQueryParameters {
    ListQueryParameters {
        start_index: None,
        max_results: None,
        page_token,
        selected_fields: None,
        format_options: None,
    }
}

#[cfg(feature = "bigquery")]
impl BigQueryBackend {
    fn job_resource(handle: &JobHandle, spec: &JobSpec) -> Value {
        let mut reference = json!({
            "projectId": handle.project,
            "jobId": handle.job_id,
        });
        if let Some(location) = &handle.location {
            reference["location"] = json!(location);
        }
        json!({
            "jobReference": reference,
            "configuration": job_configuration(spec),
        })
    }

    fn handle_from_job(job: &Value, fallback: JobHandle) -> JobHandle {
        let reference = &job["jobReference"];
        JobHandle {
            project: reference["projectId"].as_str().map(str::to_string).unwrap_or(fallback.project),
            job_id: reference["jobId"].as_str().map(str::to_string).unwrap_or(fallback.job_id),
            location: reference["location"].as_str().map(str::to_string).or(fallback.location),
        }
    }

    /// Bearer token minted from the service account key
    async fn access_token(key: &ServiceAccountKey) -> Result<String, ConnectorError> {
        let auth = gcp_bigquery_client::yup_oauth2::ServiceAccountAuthenticator::builder(key.clone())
            .build()
            .await
            .map_err(|e| ConnectorError::Authentication(e.to_string()))?;
        let token = auth
            .token(&[BIGQUERY_SCOPE])
            .await
            .map_err(|e| ConnectorError::Authentication(e.to_string()))?;

        token
            .token()
            .map(str::to_string)
            .ok_or_else(|| ConnectorError::Authentication("Empty access token".to_string()))
    }

    /// Send an authorized REST request and decode the JSON reply
    async fn send_json(&self, key: &ServiceAccountKey, request: reqwest::RequestBuilder) -> Result<Value, ConnectorError> {
        let token = Self::access_token(key).await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ConnectorError::Network(e.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ConnectorError::InvalidResponse(e.to_string()))?;

        if !status.is_success() {
            let message = body["error"]["message"].as_str().unwrap_or("request failed");
            return Err(ConnectorError::from_remote(format!("{} (code: {})", message, status.as_u16())));
        }

        Ok(body)
    }

    fn tables_url(project: &str, dataset: &str) -> String {
        format!("{}/{}/datasets/{}/tables", API_URL, project, dataset)
    }

    /// Load job whose data travels in the request body
    async fn upload_job(&self, handle: JobHandle, spec: &JobSpec, data: &[u8]) -> Result<JobHandle, ConnectorError> {
        let key = self.service_account.as_ref().ok_or_else(|| {
            ConnectorError::Config(
                "Loading local files requires a service account key file".to_string(),
            )
        })?;

        let boundary = format!("bqlink_{}", uuid::Uuid::new_v4().simple());
        let body = multipart_body(&boundary, &Self::job_resource(&handle, spec), data);

        let request = self
            .http
            .post(format!("{}/{}/jobs?uploadType=multipart", UPLOAD_URL, handle.project))
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body);

        let job = self.send_json(key, request).await?;
        Ok(Self::handle_from_job(&job, handle))
    }
}

#[cfg(feature = "bigquery")]
#[async_trait::async_trait]
impl WarehouseBackend for BigQueryBackend {
    fn name(&self) -> &'static str {
        "BigQuery"
    }

    async fn test_connection(&self) -> Result<(), ConnectorError> {
        self.client
            .dataset()
            .list(&self.project_id, gcp_bigquery_client::dataset::ListOptions::default())
            .await
            .map_err(|e| ConnectorError::Network(format!("Connection test failed: {}", e)))?;

        Ok(())
    }

    async fn create_dataset(&self, dataset: &DatasetRef, location: Option<&str>) -> Result<(), ConnectorError> {
        let mut definition = Dataset::new(&dataset.project, &dataset.dataset);
        if let Some(location) = location {
            definition = definition.location(location);
        }

        self.client.dataset().create(definition).await.map_err(remote)?;
        Ok(())
    }

    async fn list_datasets(&self, project: &str) -> Result<Vec<String>, ConnectorError> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut options = gcp_bigquery_client::dataset::ListOptions::default();
            if let Some(token) = page_token.take() {
                options = options.page_token(token);
            }

            let page = self.client.dataset().list(project, options).await.map_err(remote)?;
            ids.extend(
                page.datasets
                    .into_iter()
                    .map(|d| d.dataset_reference.dataset_id),
            );

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(ids),
            }
        }
    }

    async fn create_table(&self, table: &TableRef, definition: &TableDefinition) -> Result<(), ConnectorError> {
        let resource = table_resource(table, definition);

        // The client's field model has no precision or scale
        if let Some(key) = &self.service_account {
            let request = self
                .http
                .post(Self::tables_url(&table.project, &table.dataset))
                .json(&resource);
            self.send_json(key, request).await?;
            return Ok(());
        }

        if has_decimal_parameters(&definition.schema.columns) {
            return Err(ConnectorError::InvalidRequest(
                "NUMERIC precision and scale require a service account key file".to_string(),
            ));
        }

        let resource: Table = serde_json::from_value(resource)
            .map_err(|e| ConnectorError::InvalidRequest(format!("Invalid table definition: {}", e)))?;

        self.client.table().create(resource).await.map_err(remote)?;
        Ok(())
    }

    async fn table_schema(&self, table: &TableRef) -> Result<Schema, ConnectorError> {
        if let Some(key) = &self.service_account {
            let request = self.http.get(format!(
                "{}/{}",
                Self::tables_url(&table.project, &table.dataset),
                table.table
            ));
            let resource = self.send_json(key, request).await?;
            return schema_from_api(&resource["schema"]["fields"]);
        }

        let resource = self
            .client
            .table()
            .get(&table.project, &table.dataset, &table.table, None)
            .await
            .map_err(remote)?;

        let resource = serde_json::to_value(&resource)
            .map_err(|e| ConnectorError::InvalidResponse(e.to_string()))?;
        schema_from_api(&resource["schema"]["fields"])
    }

    async fn list_tables(&self, dataset: &DatasetRef) -> Result<Vec<String>, ConnectorError> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut options = gcp_bigquery_client::table::ListOptions::default();
            if let Some(token) = page_token.take() {
                options = options.page_token(token);
            }

            let page = self
                .client
                .table()
                .list(&dataset.project, &dataset.dataset, options)
                .await
                .map_err(remote)?;
            ids.extend(
                page.tables
                    .unwrap_or_default()
                    .into_iter()
                    .map(|t| t.table_reference.table_id),
            );

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(ids),
            }
        }
    }

    async fn list_rows(&self, table: &TableRef, page_token: Option<String>) -> Result<RowPage, ConnectorError> {
        let page = self
            .client
            .tabledata()
            .list(&table.project, &table.dataset, &table.table, list_parameters(page_token))
            .await
            .map_err(remote)?;

        let rows = page
            .rows
            .unwrap_or_default()
            .into_iter()
            .map(|row| {
                row.columns
                    .unwrap_or_default()
                    .into_iter()
                    .map(|cell| cell.value.as_ref().map(decode_cell).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        Ok(RowPage {
            rows,
            next_page_token: page.page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn delete_table(&self, table: &TableRef) -> Result<(), ConnectorError> {
        self.client
            .table()
            .delete(&table.project, &table.dataset, &table.table)
            .await
            .map_err(remote)
    }

    async fn insert_rows(
        &self,
        table: &TableRef,
        rows: Vec<InsertRow>,
        options: &InsertOptions,
    ) -> Result<InsertOutcome, ConnectorError> {
        let total = rows.len();
        let mut request = TableDataInsertAllRequest::new();
        request
            .add_rows(
                rows.into_iter()
                    .map(|row| TableDataInsertAllRequestRows {
                        insert_id: row.insert_id,
                        json: row.json,
                    })
                    .collect(),
            )
            .map_err(|e| ConnectorError::InvalidRequest(format!("Failed to add rows: {}", e)))?;

        if options.skip_invalid_rows {
            request.skip_invalid_rows();
        }
        if options.ignore_unknown_values {
            request.ignore_unknown_values();
        }

        let response = self
            .client
            .tabledata()
            .insert_all(&table.project, &table.dataset, &table.table, request)
            .await
            .map_err(remote)?;

        let insert_errors = serde_json::to_value(&response.insert_errors)
            .map_err(|e| ConnectorError::InvalidResponse(e.to_string()))?;
        let row_errors = row_errors_from_api(&insert_errors);

        // Without skip_invalid_rows a single bad row rejects the whole request
        let inserted = if row_errors.is_empty() || options.skip_invalid_rows {
            total.saturating_sub(row_errors.len())
        } else {
            0
        };

        Ok(InsertOutcome { inserted, row_errors })
    }

    async fn submit_job(&self, handle: JobHandle, spec: &JobSpec) -> Result<JobHandle, ConnectorError> {
        if let JobSpec::Load { source: LoadSource::Inline { data, .. }, .. } = spec {
            return self.upload_job(handle, spec, data).await;
        }

        let job: Job = serde_json::from_value(Self::job_resource(&handle, spec))
            .map_err(|e| ConnectorError::InvalidRequest(format!("Invalid job definition: {}", e)))?;

        let job = self
            .client
            .job()
            .insert(&handle.project, job)
            .await
            .map_err(remote)?;

        let job = serde_json::to_value(&job)
            .map_err(|e| ConnectorError::InvalidResponse(e.to_string()))?;
        Ok(Self::handle_from_job(&job, handle))
    }

    async fn job_status(&self, handle: &JobHandle) -> Result<JobStatus, ConnectorError> {
        let job = self
            .client
            .job()
            .get_job(&handle.project, &handle.job_id, handle.location.as_deref())
            .await
            .map_err(remote)?;

        let job = serde_json::to_value(&job)
            .map_err(|e| ConnectorError::InvalidResponse(e.to_string()))?;
        job_status_from_api(&job)
    }
}

#[cfg(not(feature = "bigquery"))]
#[async_trait::async_trait]
impl crate::backend::WarehouseBackend for BigQueryBackend {
    fn name(&self) -> &'static str {
        "BigQuery"
    }

    async fn test_connection(&self) -> Result<(), ConnectorError> {
        Err(ConnectorError::Config(NOT_COMPILED.to_string()))
    }

    async fn create_dataset(&self, _dataset: &crate::backend::DatasetRef, _location: Option<&str>) -> Result<(), ConnectorError> {
        Err(ConnectorError::Config(NOT_COMPILED.to_string()))
    }

    async fn list_datasets(&self, _project: &str) -> Result<Vec<String>, ConnectorError> {
        Err(ConnectorError::Config(NOT_COMPILED.to_string()))
    }

    async fn create_table(&self, _table: &TableRef, _definition: &crate::backend::TableDefinition) -> Result<(), ConnectorError> {
        Err(ConnectorError::Config(NOT_COMPILED.to_string()))
    }

    async fn table_schema(&self, _table: &TableRef) -> Result<Schema, ConnectorError> {
        Err(ConnectorError::Config(NOT_COMPILED.to_string()))
    }

    async fn list_tables(&self, _dataset: &crate::backend::DatasetRef) -> Result<Vec<String>, ConnectorError> {
        Err(ConnectorError::Config(NOT_COMPILED.to_string()))
    }

    async fn list_rows(&self, _table: &TableRef, _page_token: Option<String>) -> Result<crate::backend::RowPage, ConnectorError> {
        Err(ConnectorError::Config(NOT_COMPILED.to_string()))
    }

    async fn delete_table(&self, _table: &TableRef) -> Result<(), ConnectorError> {
        Err(ConnectorError::Config(NOT_COMPILED.to_string()))
    }

    async fn insert_rows(
        &self,
        _table: &TableRef,
        _rows: Vec<crate::backend::InsertRow>,
        _options: &crate::backend::InsertOptions,
    ) -> Result<crate::backend::InsertOutcome, ConnectorError> {
        Err(ConnectorError::Config(NOT_COMPILED.to_string()))
    }

    async fn submit_job(&self, _handle: crate::job::JobHandle, _spec: &JobSpec) -> Result<crate::job::JobHandle, ConnectorError> {
        Err(ConnectorError::Config(NOT_COMPILED.to_string()))
    }

    async fn job_status(&self, _handle: &crate::job::JobHandle) -> Result<JobStatus, ConnectorError> {
        Err(ConnectorError::Config(NOT_COMPILED.to_string()))
    }
}
