//! Job model shared by the connector and the backends

use crate::backend::TableRef;
use bqlink_core::{ExtractSettings, LoadSettings, ObjectUri};
use std::fmt;

/// What happens to existing rows in the destination table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDisposition {
    /// Replace the destination's rows
    WriteTruncate,

    /// Append to the destination's rows
    WriteAppend,

    /// Fail unless the destination is empty
    WriteEmpty,
}

impl WriteDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WriteTruncate => "WRITE_TRUNCATE",
            Self::WriteAppend => "WRITE_APPEND",
            Self::WriteEmpty => "WRITE_EMPTY",
        }
    }
}

/// Whether a job may create its destination table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateDisposition {
    CreateIfNeeded,

    /// The destination table must already exist
    CreateNever,
}

impl CreateDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateIfNeeded => "CREATE_IF_NEEDED",
            Self::CreateNever => "CREATE_NEVER",
        }
    }
}

/// Where a load job reads its CSV data from
#[derive(Debug, Clone, PartialEq)]
pub enum LoadSource {
    /// Object-storage URI, possibly with one wildcard
    Uri(ObjectUri),

    /// Bytes uploaded with the job, `name` is only used in messages
    Inline { name: String, data: Vec<u8> },
}

impl fmt::Display for LoadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uri(uri) => write!(f, "{}", uri),
            Self::Inline { name, data } => write!(f, "{} ({} bytes)", name, data.len()),
        }
    }
}

/// CSV load options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    pub allow_jagged_rows: bool,
    pub skip_leading_rows: u32,
    pub field_delimiter: u8,
    pub create_disposition: CreateDisposition,
    pub write_disposition: WriteDisposition,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self::from(&LoadSettings::default())
    }
}

impl From<&LoadSettings> for LoadOptions {
    fn from(settings: &LoadSettings) -> Self {
        Self {
            allow_jagged_rows: settings.allow_jagged_rows,
            skip_leading_rows: settings.skip_leading_rows,
            field_delimiter: settings.field_delimiter.bytes().next().unwrap_or(b','),
            create_disposition: CreateDisposition::CreateNever,
            write_disposition: WriteDisposition::WriteAppend,
        }
    }
}

/// CSV extract options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractOptions {
    pub field_delimiter: u8,
    pub print_header: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self::from(&ExtractSettings::default())
    }
}

impl From<&ExtractSettings> for ExtractOptions {
    fn from(settings: &ExtractSettings) -> Self {
        Self {
            field_delimiter: settings.field_delimiter.bytes().next().unwrap_or(b','),
            print_header: settings.print_header,
        }
    }
}

/// A unit of server-side work
#[derive(Debug, Clone, PartialEq)]
pub enum JobSpec {
    Copy {
        source: TableRef,
        destination: TableRef,
        write_disposition: WriteDisposition,
    },
    Load {
        destination: TableRef,
        source: LoadSource,
        options: LoadOptions,
    },
    Extract {
        source: TableRef,
        destination: ObjectUri,
        options: ExtractOptions,
    },
}

impl JobSpec {
    /// Short job kind, used in job ids and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Copy { .. } => "copy",
            Self::Load { .. } => "load",
            Self::Extract { .. } => "extract",
        }
    }
}

/// Identifies a submitted job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub project: String,
    pub job_id: String,
    pub location: Option<String>,
}

impl JobHandle {
    /// A handle with a fresh, unique job id
    pub fn generate(project: impl Into<String>, kind: &str, location: Option<String>) -> Self {
        Self {
            project: project.into(),
            job_id: format!("bqlink_{}_{}", kind, uuid::Uuid::new_v4().simple()),
            location,
        }
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Done,
}

impl JobState {
    /// Parse the API's state name
    pub fn from_api(state: &str) -> Option<Self> {
        match state.to_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "DONE" => Some(Self::Done),
            _ => None,
        }
    }
}

/// Status of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub state: JobState,

    /// Terminal error, only meaningful once `state` is `Done`
    pub error: Option<String>,
}

impl JobStatus {
    pub fn running() -> Self {
        Self {
            state: JobState::Running,
            error: None,
        }
    }

    pub fn succeeded() -> Self {
        Self {
            state: JobState::Done,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: JobState::Done,
            error: Some(message.into()),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == JobState::Done
    }
}
