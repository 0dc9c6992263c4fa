//! Where rule sets come from
//!
//! A [`RuleSource`] yields raw JSON records. Decoding and validation happen
//! per record in the engine, so one malformed entry never sinks a batch.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::RuleError;

/// Supplier of a full, ordered list of rule records
pub trait RuleSource: Send + Sync {
    /// Fetch every record.
    ///
    /// # Errors
    ///
    /// Returns an error if the source as a whole cannot be read or is not
    /// a JSON array. Individual bad records are not errors here.
    fn fetch(&self) -> Result<Vec<Value>, RuleError>;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// Rules stored as a JSON array in a file
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RuleSource for JsonFileSource {
    fn fetch(&self) -> Result<Vec<Value>, RuleError> {
        let content = fs::read_to_string(&self.path)
            .map_err(|e| RuleError::storage(self.path.display().to_string(), e.to_string()))?;
        parse_record_array(&content)
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

/// Records supplied in memory, e.g. from the config file or a control client
#[derive(Debug, Clone, Default)]
pub struct InlineSource {
    records: Vec<Value>,
}

impl InlineSource {
    #[must_use]
    pub const fn new(records: Vec<Value>) -> Self {
        Self { records }
    }
}

impl RuleSource for InlineSource {
    fn fetch(&self) -> Result<Vec<Value>, RuleError> {
        Ok(self.records.clone())
    }

    fn describe(&self) -> String {
        format!("inline ({} records)", self.records.len())
    }
}

/// Parse a JSON document that must be an array of records
///
/// # Errors
///
/// Returns `RuleError::Parse` for invalid JSON or a non-array document.
pub fn parse_record_array(content: &str) -> Result<Vec<Value>, RuleError> {
    match serde_json::from_str::<Value>(content) {
        Ok(Value::Array(records)) => Ok(records),
        Ok(other) => Err(RuleError::Parse(format!(
            "expected a JSON array of rules, found {}",
            json_type_name(&other)
        ))),
        Err(e) => Err(RuleError::Parse(e.to_string())),
    }
}

const fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
