//! Pipeline orchestrator
//!
//! One run = one pass through the three source pipelines. Within a source
//! the steps are strictly sequential (extract → stage → merge); across
//! sources the pipelines run concurrently and independently, so a vehicle
//! feed outage never blocks weather ingestion. Every staging write in a
//! cycle carries the same batch id, minted once at the start of the run.

use crate::config::IngestConfig;
use crate::extract::{
    Extractor, Source, TrafficExtractor, TransitExtractor, WeatherExtractor,
};
use crate::repository::{PgRepository, StagingStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Which step of a source pipeline failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStep {
    Extract,
    Stage,
    Merge,
}

impl std::fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStep::Extract => f.write_str("extract"),
            PipelineStep::Stage => f.write_str("stage"),
            PipelineStep::Merge => f.write_str("merge"),
        }
    }
}

/// Outcome of one source's extract → stage → merge pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOutcome {
    Succeeded {
        rows_extracted: usize,
        rows_staged: u64,
        rows_merged: u64,
    },
    Failed {
        step: PipelineStep,
        error: String,
    },
    /// The run was cancelled before this source started extracting
    Cancelled,
}

/// Per-source result within one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceReport {
    pub source: Source,
    pub outcome: SourceOutcome,
}

impl SourceReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, SourceOutcome::Succeeded { .. })
    }
}

/// Result of one ingestion cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Batch id carried by every staging row written this cycle
    pub batch: String,
    pub sources: Vec<SourceReport>,
}

impl CycleReport {
    pub fn all_succeeded(&self) -> bool {
        self.sources.iter().all(SourceReport::succeeded)
    }

    pub fn failed_sources(&self) -> Vec<Source> {
        self.sources
            .iter()
            .filter(|r| matches!(r.outcome, SourceOutcome::Failed { .. }))
            .map(|r| r.source)
            .collect()
    }
}

/// Drives one ingestion cycle across all configured sources
pub struct ForwardPipeline {
    store: Arc<dyn StagingStore>,
    extractors: Vec<Arc<dyn Extractor>>,
    cancel: CancellationToken,
}

impl ForwardPipeline {
    /// Build the production pipeline: connect the database pool and
    /// construct the three source adapters from configuration
    pub async fn connect(config: &IngestConfig) -> anyhow::Result<Self> {
        let pool = config.database.connect().await?;
        let repository = PgRepository::new(pool);

        Ok(Self::new(
            Arc::new(repository),
            vec![
                Arc::new(TransitExtractor::new(&config.transit, config.http)?),
                Arc::new(WeatherExtractor::new(&config.weather, config.http)?),
                Arc::new(TrafficExtractor::new(&config.traffic, config.http)?),
            ],
        ))
    }

    /// Assemble a pipeline from explicit parts
    pub fn new(store: Arc<dyn StagingStore>, extractors: Vec<Arc<dyn Extractor>>) -> Self {
        Self {
            store,
            extractors,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops future per-source work. Sources that have already
    /// extracted still finish their staging and merge, so cancellation
    /// never strands a half-loaded batch.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one ingestion cycle
    pub async fn run_once(&self, since: Option<DateTime<Utc>>) -> CycleReport {
        let batch = mint_batch_id(Utc::now());
        info!(batch, "starting ingestion cycle");

        let reports = futures::future::join_all(
            self.extractors
                .iter()
                .map(|extractor| self.run_source(extractor.as_ref(), &batch, since)),
        )
        .await;

        for report in &reports {
            match &report.outcome {
                SourceOutcome::Succeeded {
                    rows_extracted,
                    rows_staged,
                    rows_merged,
                } => info!(
                    source = %report.source,
                    rows_extracted,
                    rows_staged,
                    rows_merged,
                    "source pipeline succeeded"
                ),
                SourceOutcome::Failed { step, error } => error!(
                    source = %report.source,
                    step = %step,
                    error = %error,
                    "source pipeline failed"
                ),
                SourceOutcome::Cancelled => {
                    info!(source = %report.source, "source pipeline cancelled")
                },
            }
        }

        let report = CycleReport {
            batch,
            sources: reports,
        };
        info!(
            batch = %report.batch,
            succeeded = report.sources.iter().filter(|r| r.succeeded()).count(),
            failed = report.failed_sources().len(),
            "ingestion cycle finished"
        );
        report
    }

    /// One source's extract → stage → merge, errors contained
    async fn run_source(
        &self,
        extractor: &dyn Extractor,
        batch: &str,
        since: Option<DateTime<Utc>>,
    ) -> SourceReport {
        let source = extractor.source();

        // Cancellation gates the start of new work only.
        if self.cancel.is_cancelled() {
            return SourceReport {
                source,
                outcome: SourceOutcome::Cancelled,
            };
        }

        let rows = match extractor.extract(since).await {
            Ok(rows) => rows,
            Err(e) => {
                return SourceReport {
                    source,
                    outcome: SourceOutcome::Failed {
                        step: PipelineStep::Extract,
                        error: e.to_string(),
                    },
                };
            },
        };

        if rows.is_empty() {
            info!(source = %source, "nothing extracted, skipping staging and merge");
            return SourceReport {
                source,
                outcome: SourceOutcome::Succeeded {
                    rows_extracted: 0,
                    rows_staged: 0,
                    rows_merged: 0,
                },
            };
        }

        let tags = vec![("source_batch".to_string(), batch.to_string())];

        let rows_staged = match self.store.load_staging(source, &rows, &tags).await {
            Ok(count) => count,
            Err(e) => {
                return SourceReport {
                    source,
                    outcome: SourceOutcome::Failed {
                        step: PipelineStep::Stage,
                        error: e.to_string(),
                    },
                };
            },
        };

        // A merge failure retains the staged batch for a later re-merge.
        let rows_merged = match self.store.merge_core(source).await {
            Ok(count) => count,
            Err(e) => {
                return SourceReport {
                    source,
                    outcome: SourceOutcome::Failed {
                        step: PipelineStep::Merge,
                        error: e.to_string(),
                    },
                };
            },
        };

        SourceReport {
            source,
            outcome: SourceOutcome::Succeeded {
                rows_extracted: rows.len(),
                rows_staged,
                rows_merged,
            },
        }
    }
}

/// Mint the cycle's batch id from the UTC wall clock. Lexicographic order
/// of batch ids equals chronological order, which the merge precedence
/// rule depends on.
pub fn mint_batch_id(now: DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%SZ").to_string()
}
