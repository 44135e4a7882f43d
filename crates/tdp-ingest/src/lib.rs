//! TDP Ingest Library
//!
//! Extraction → staging → merge pipeline for campus transit telemetry.
//!
//! # Supported Data Sources
//!
//! - **Transit**: live vehicle positions plus per-vehicle next-stop ETAs
//! - **Weather**: NWS hourly forecast for a fixed campus point
//! - **Traffic**: area-bounded road incident feed
//!
//! Each source is an [`extract::Extractor`] producing uniform rows, which
//! the [`repository`] bulk-copies into a per-source staging table and then
//! merges into a business-key-deduplicated core table. One
//! [`pipeline::ForwardPipeline`] cycle runs all three sources, isolating
//! failures per source.
//!
//! # Example
//!
//! ```no_run
//! use tdp_ingest::config::IngestConfig;
//! use tdp_ingest::pipeline::ForwardPipeline;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::load()?;
//!     let pipeline = ForwardPipeline::connect(&config).await?;
//!     let report = pipeline.run_once(None).await;
//!     assert!(report.all_succeeded());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod extract;
pub mod http;
pub mod pipeline;
pub mod polyline;
pub mod repository;

pub use config::IngestConfig;
pub use pipeline::{CycleReport, ForwardPipeline, SourceReport};
pub use repository::{PgRepository, StagingStore};
