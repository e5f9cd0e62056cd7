//! Dataset/table identifiers and object-storage URIs

use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Maximum length of dataset and table ids
pub const MAX_ID_LEN: usize = 1024;

fn dataset_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("valid dataset id pattern"))
}

// Table ids additionally allow dashes and spaces
fn table_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[\p{L}\p{N}_\- ]+$").expect("valid table id pattern"))
}

fn uri_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<scheme>[a-z][a-z0-9+.\-]*)://(?P<bucket>[^/]+)/(?P<path>.+)$")
            .expect("valid uri pattern")
    })
}

/// Check a dataset id: letters, digits and underscores
pub fn validate_dataset_id(id: &str) -> Result<(), IdentError> {
    if id.len() > MAX_ID_LEN || !dataset_id_pattern().is_match(id) {
        return Err(IdentError::InvalidDatasetId(id.to_string()));
    }
    Ok(())
}

/// Check a table id
pub fn validate_table_id(id: &str) -> Result<(), IdentError> {
    if id.len() > MAX_ID_LEN || !table_id_pattern().is_match(id) {
        return Err(IdentError::InvalidTableId(id.to_string()));
    }
    Ok(())
}

/// Object-storage URI of the form `scheme://bucket/path`
///
/// The path may contain a single `*` wildcard when used as an import source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectUri {
    /// URI scheme, e.g. `gs`
    pub scheme: String,

    /// Bucket name
    pub bucket: String,

    /// Object path inside the bucket
    pub path: String,
}

impl ObjectUri {
    /// Parse and validate a URI
    pub fn parse(uri: &str) -> Result<Self, IdentError> {
        let caps = uri_pattern()
            .captures(uri.trim())
            .ok_or_else(|| IdentError::InvalidUri(uri.to_string()))?;

        let parsed = Self {
            scheme: caps["scheme"].to_string(),
            bucket: caps["bucket"].to_string(),
            path: caps["path"].to_string(),
        };

        if parsed.path.matches('*').count() > 1 {
            return Err(IdentError::InvalidUri(format!(
                "{} (at most one wildcard is allowed)",
                uri
            )));
        }

        Ok(parsed)
    }

    /// Whether the path contains a wildcard
    pub fn has_wildcard(&self) -> bool {
        self.path.contains('*')
    }

    /// Whether a concrete URI is matched by this (possibly wildcard) URI
    pub fn matches(&self, other: &ObjectUri) -> bool {
        if self.scheme != other.scheme || self.bucket != other.bucket {
            return false;
        }
        match self.path.split_once('*') {
            Some((prefix, suffix)) => {
                other.path.len() >= prefix.len() + suffix.len()
                    && other.path.starts_with(prefix)
                    && other.path.ends_with(suffix)
            }
            None => self.path == other.path,
        }
    }
}

impl FromStr for ObjectUri {
    type Err = IdentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.path)
    }
}

/// Identifier errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentError {
    #[error("Invalid dataset id: '{0}'")]
    InvalidDatasetId(String),

    #[error("Invalid table id: '{0}'")]
    InvalidTableId(String),

    #[error("Invalid object URI: '{0}' (expected scheme://bucket/path)")]
    InvalidUri(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_ids() {
        assert!(validate_dataset_id("testdataset").is_ok());
        assert!(validate_dataset_id("events_2024").is_ok());
        assert!(validate_dataset_id("").is_err());
        assert!(validate_dataset_id("my-dataset").is_err());
        assert!(validate_dataset_id("a.b").is_err());
        assert!(validate_dataset_id(&"a".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn table_ids() {
        assert!(validate_table_id("test_table").is_ok());
        assert!(validate_table_id("daily-scores 2024").is_ok());
        assert!(validate_table_id("").is_err());
        assert!(validate_table_id("a.b").is_err());
    }

    #[test]
    fn parse_uri() {
        let uri: ObjectUri = "gs://data-bucket/path/to/data.csv".parse().unwrap();
        assert_eq!(uri.scheme, "gs");
        assert_eq!(uri.bucket, "data-bucket");
        assert_eq!(uri.path, "path/to/data.csv");
        assert_eq!(uri.to_string(), "gs://data-bucket/path/to/data.csv");
        assert!(!uri.has_wildcard());
    }

    #[test]
    fn reject_malformed_uris() {
        assert!(ObjectUri::parse("data.csv").is_err());
        assert!(ObjectUri::parse("gs://bucket").is_err());
        assert!(ObjectUri::parse("gs://bucket/").is_err());
        assert!(ObjectUri::parse("gs:///path").is_err());
        assert!(ObjectUri::parse("gs://bucket/a*b*c").is_err());
    }

    #[test]
    fn wildcard_matching() {
        let pattern = ObjectUri::parse("gs://bucket/export/part-*.csv").unwrap();
        let hit = ObjectUri::parse("gs://bucket/export/part-000.csv").unwrap();
        let miss = ObjectUri::parse("gs://bucket/other/part-000.csv").unwrap();
        let other_bucket = ObjectUri::parse("gs://elsewhere/export/part-000.csv").unwrap();

        assert!(pattern.has_wildcard());
        assert!(pattern.matches(&hit));
        assert!(!pattern.matches(&miss));
        assert!(!pattern.matches(&other_bucket));
    }
}
