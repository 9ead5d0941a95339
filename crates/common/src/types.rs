// Core domain types shared across all statesync crates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Server-assigned module identifier.
pub type ModuleId = String;

/// Identifier of a row inside one of the tracked entity tables.
pub type EntityId = String;

/// Naive layouts the server emits besides RFC 3339. Interpreted as UTC.
const NAIVE_LAYOUTS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// A wall-clock timestamp exactly as it travelled on the wire.
///
/// The raw string is kept so a stored value is echoed back byte-for-byte;
/// ordering always goes through [`Timestamp::parse`], never string comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(String);

impl Timestamp {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Render a UTC instant in RFC 3339 with millisecond precision.
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Parse into a UTC instant.
    pub fn parse(&self) -> Result<DateTime<Utc>, TimestampError> {
        let raw = self.0.trim();
        if raw.is_empty() {
            return Err(TimestampError::Empty);
        }

        if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
            return Ok(at.with_timezone(&Utc));
        }

        NAIVE_LAYOUTS
            .iter()
            .find_map(|layout| NaiveDateTime::parse_from_str(raw, layout).ok())
            .map(|naive| naive.and_utc())
            .ok_or_else(|| TimestampError::Invalid { raw: raw.to_string() })
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Timestamp {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for Timestamp {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimestampError {
    #[error("timestamp is empty")]
    Empty,
    #[error("`{raw}` is not a recognised timestamp")]
    Invalid { raw: String },
}

/// Entity tables whose rows carry a last-modification timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableName {
    Datasets,
    Modules,
    PresentationObjects,
    Reports,
    ReportItems,
    SlideDecks,
    Slides,
}

impl TableName {
    pub const ALL: [TableName; 7] = [
        Self::Datasets,
        Self::Modules,
        Self::PresentationObjects,
        Self::Reports,
        Self::ReportItems,
        Self::SlideDecks,
        Self::Slides,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Datasets => "datasets",
            Self::Modules => "modules",
            Self::PresentationObjects => "presentation_objects",
            Self::Reports => "reports",
            Self::ReportItems => "report_items",
            Self::SlideDecks => "slide_decks",
            Self::Slides => "slides",
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableName {
    type Err = UnknownTableName;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|table| table.as_str() == value)
            .ok_or_else(|| UnknownTableName(value.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown table name `{0}`")]
pub struct UnknownTableName(pub String);

/// Lifecycle stage of a module's background computation.
///
/// Transitions are decided by the server; the client only mirrors them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Dirty,
    Queued,
    Running,
    Ready,
}

impl RunStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dirty => "dirty",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Ready => "ready",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
