//! Source adapters
//!
//! One adapter per upstream feed, all polymorphic over the same
//! [`Extractor`] contract so the orchestrator can treat them uniformly.
//! The differences between feeds (payload shapes, timestamp encodings,
//! business-rule filters) are internal to each implementation. Adapters
//! share only the [`crate::http::ApiClient`] helper.

pub mod traffic;
pub mod transit;
pub mod weather;

pub use traffic::TrafficExtractor;
pub use transit::TransitExtractor;
pub use weather::WeatherExtractor;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tdp_common::types::Row;

use crate::http::HttpError;

/// Result type for extraction operations
pub type Result<T> = std::result::Result<T, ExtractError>;

/// The three ingested sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Transit,
    Weather,
    Traffic,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Transit, Source::Weather, Source::Traffic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Transit => "transit",
            Source::Weather => "weather",
            Source::Traffic => "traffic",
        }
    }

    /// Staging table this source's rows land in
    pub fn staging_table(&self) -> &'static str {
        match self {
            Source::Transit => "staging_stop_events",
            Source::Weather => "staging_weather",
            Source::Traffic => "staging_traffic",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source-level extraction failures
///
/// Record-level problems (a vehicle with a malformed timestamp, an incident
/// without a type) never surface here; the offending record is dropped with
/// a warning and the batch continues.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// Transport failure or retries exhausted against the upstream
    #[error("Upstream HTTP failure: {0}")]
    Http(#[from] HttpError),

    /// The upstream answered with an explicit error payload
    #[error("Upstream API error: {0}")]
    Api(String),

    /// A required top-level field is absent from the response
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// The response body has an unusable shape
    #[error("Malformed payload: {0}")]
    Decode(String),
}

impl From<regex::Error> for ExtractError {
    fn from(err: regex::Error) -> Self {
        ExtractError::Decode(err.to_string())
    }
}

/// Contract every source adapter implements
///
/// `since` lets a caller replay a window: adapters drop records older than
/// it where their feed carries a usable record timestamp, and ignore it
/// otherwise (the weather feed always reflects "now").
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Which source this adapter feeds
    fn source(&self) -> Source;

    /// Fetch and normalize one batch of rows
    async fn extract(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Row>>;
}
