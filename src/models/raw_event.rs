use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// A stable shard identifier for the input event stream (§Glossary "Partition").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionId(pub i32);

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `RawEvent.properties` values are restricted to string, integer, or
/// timestamp kinds; anything else is a classification error (§3).
#[derive(Debug, Clone)]
pub enum PropertyValue {
    Str(String),
    Int(i64),
    Timestamp(DateTime<Utc>),
}

/// An event as handed to the pipeline by the Consumer Host for exactly one
/// `process` call. The pipeline must not retain references past that call.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub body: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
    pub properties: HashMap<String, PropertyValue>,
}

impl RawEvent {
    /// Reads a property that must be a string when present.
    ///
    /// Returns `Err` (the property's name) if the property exists but isn't
    /// a string, matching the classifier's rule for `Type`/`MessageId`/
    /// `Timestamp`/`Source`.
    pub fn string_property(&self, key: &str) -> Result<Option<&str>, &'static str> {
        match self.properties.get(key) {
            None => Ok(None),
            Some(PropertyValue::Str(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(key_to_static(key)),
        }
    }
}

/// `string_property` needs a `'static` name for the error variant; the four
/// properties we ever read are known ahead of time.
fn key_to_static(key: &str) -> &'static str {
    match key {
        "Type" => "Type",
        "MessageId" => "MessageId",
        "Timestamp" => "Timestamp",
        "Source" => "Source",
        _ => "property",
    }
}
