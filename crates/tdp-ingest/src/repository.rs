//! Staging loader and core merger
//!
//! Staging loads go through the bulk-copy path (`COPY ... FROM STDIN`),
//! never row-by-row inserts: a cycle can carry thousands of rows and the
//! merge step assumes the whole batch landed together. COPY is atomic, so
//! a failed load leaves no partial row set.
//!
//! Merges are predeclared, parameterless set-based upserts, one per
//! source. Each selects the newest staging row per business key and
//! inserts-or-updates the core table in a single statement, so a crash
//! leaves either the pre-merge or post-merge state and re-running a merge
//! is a no-op on core contents.

use crate::extract::Source;
use async_trait::async_trait;
use sqlx::postgres::PgPoolCopyExt;
use sqlx::PgPool;
use tdp_common::types::{Row, Value};
use tracing::{debug, info};

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Persistence-layer failures
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A row set cannot be represented in the staging format; nothing was
    /// written.
    #[error("Staging serialization error: {0}")]
    Serialize(String),

    /// Rows within one load disagree on schema; nothing was written.
    #[error("Schema mismatch in staging rows: {0}")]
    SchemaMismatch(String),
}

/// Store seam between the orchestrator and PostgreSQL
///
/// The production implementation is [`PgRepository`]; tests drive the
/// orchestrator against an in-memory fake.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Append `rows` to the source's staging table, injecting every tag as
    /// a trailing column on every row. Returns the number of rows written;
    /// zero rows is a no-op that never touches the database.
    async fn load_staging(
        &self,
        source: Source,
        rows: &[Row],
        tags: &[(String, String)],
    ) -> Result<u64>;

    /// Run the source's predeclared merge, returning core rows affected
    async fn merge_core(&self, source: Source) -> Result<u64>;
}

/// PostgreSQL-backed staging and core store
#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the schema migrations bundled with this crate
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl StagingStore for PgRepository {
    async fn load_staging(
        &self,
        source: Source,
        rows: &[Row],
        tags: &[(String, String)],
    ) -> Result<u64> {
        if rows.is_empty() {
            debug!(source = %source, "no rows to stage");
            return Ok(0);
        }

        let columns = staging_columns(rows, tags)?;
        let payload = encode_csv(rows, tags)?;

        let sql = build_copy_sql(source.staging_table(), &columns);
        debug!(source = %source, rows = rows.len(), "staging bulk copy");

        // The connection is held only for this one COPY.
        let mut copy = self.pool.copy_in_raw(&sql).await?;
        copy.send(payload).await?;
        let written = copy.finish().await?;

        info!(source = %source, rows = written, "staged rows");
        Ok(written)
    }

    async fn merge_core(&self, source: Source) -> Result<u64> {
        let result = sqlx::query(merge_statement(source))
            .execute(&self.pool)
            .await?;

        let affected = result.rows_affected();
        info!(source = %source, rows = affected, "merged staging into core");
        Ok(affected)
    }
}

/// Column list for a staging load: the row schema (validated uniform
/// across the row set) followed by the injected tag columns
fn staging_columns<'a>(rows: &'a [Row], tags: &'a [(String, String)]) -> Result<Vec<&'a str>> {
    let first = rows[0].columns();

    for (index, row) in rows.iter().enumerate().skip(1) {
        if row.columns() != first {
            return Err(RepositoryError::SchemaMismatch(format!(
                "row {index} columns {:?} differ from row 0 columns {first:?}",
                row.columns()
            )));
        }
    }

    let mut columns = first;
    columns.extend(tags.iter().map(|(key, _)| key.as_str()));
    Ok(columns)
}

/// Serialize the row set (plus tag columns) as CSV for COPY
fn encode_csv(rows: &[Row], tags: &[(String, String)]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());

    for row in rows {
        let mut record: Vec<String> = row
            .values()
            .map(encode_value)
            .collect::<Result<_>>()?;
        record.extend(tags.iter().map(|(_, value)| value.clone()));

        writer
            .write_record(&record)
            .map_err(|e| RepositoryError::Serialize(e.to_string()))?;
    }

    writer
        .into_inner()
        .map_err(|e| RepositoryError::Serialize(e.to_string()))
}

/// Render one scalar for the CSV COPY payload.
///
/// An empty unquoted field is the COPY NULL marker, which is how `Null`
/// (and only `Null`) must serialize. Text containing a NUL byte cannot be
/// represented in a Postgres text column and aborts the whole load.
fn encode_value(value: &Value) -> Result<String> {
    match value {
        Value::Text(text) => {
            if text.contains('\0') {
                return Err(RepositoryError::Serialize(
                    "text value contains a NUL byte".to_string(),
                ));
            }
            Ok(text.clone())
        },
        Value::Float(v) => Ok(v.to_string()),
        Value::Int(v) => Ok(v.to_string()),
        Value::Bool(v) => Ok(v.to_string()),
        Value::Timestamp(ts) => Ok(ts.to_rfc3339()),
        Value::Null => Ok(String::new()),
    }
}

/// Build the COPY statement for a staging load
///
/// ```sql
/// COPY staging_weather (recorded_at, ..., source_batch) FROM STDIN WITH (FORMAT csv)
/// ```
fn build_copy_sql(table: &str, columns: &[&str]) -> String {
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT csv)",
        table,
        columns.join(", ")
    )
}

/// The predeclared merge statement for a source.
///
/// Shape shared by all three: `DISTINCT ON (key) ... ORDER BY key,
/// source_batch DESC` picks the newest staging row per business key (and
/// keeps one statement from updating the same core row twice), and the
/// conflict guard `EXCLUDED.source_batch >= <core>.source_batch` makes
/// replaying an old batch a no-op instead of a regression.
pub fn merge_statement(source: Source) -> &'static str {
    match source {
        Source::Transit => MERGE_STOP_EVENTS,
        Source::Weather => MERGE_WEATHER,
        Source::Traffic => MERGE_TRAFFIC,
    }
}

const MERGE_STOP_EVENTS: &str = r#"
INSERT INTO core_stop_events (
    vehicle_id, route_id, observed_at, latitude, longitude,
    day_of_week, month, time_of_day, ground_speed,
    next_stop_id, eta_to_stop, source_batch
)
SELECT DISTINCT ON (vehicle_id, route_id, observed_at)
    vehicle_id, route_id, observed_at, latitude, longitude,
    day_of_week, month, time_of_day, ground_speed,
    next_stop_id, eta_to_stop, source_batch
FROM staging_stop_events
ORDER BY vehicle_id, route_id, observed_at, source_batch DESC
ON CONFLICT (vehicle_id, route_id, observed_at) DO UPDATE SET
    latitude = EXCLUDED.latitude,
    longitude = EXCLUDED.longitude,
    day_of_week = EXCLUDED.day_of_week,
    month = EXCLUDED.month,
    time_of_day = EXCLUDED.time_of_day,
    ground_speed = EXCLUDED.ground_speed,
    next_stop_id = EXCLUDED.next_stop_id,
    eta_to_stop = EXCLUDED.eta_to_stop,
    source_batch = EXCLUDED.source_batch
WHERE EXCLUDED.source_batch >= core_stop_events.source_batch
"#;

const MERGE_WEATHER: &str = r#"
INSERT INTO core_weather (
    recorded_at, fetched_at, temperature,
    precipitation_probability, wind_speed, conditions, source_batch
)
SELECT DISTINCT ON (recorded_at)
    recorded_at, fetched_at, temperature,
    precipitation_probability, wind_speed, conditions, source_batch
FROM staging_weather
ORDER BY recorded_at, source_batch DESC
ON CONFLICT (recorded_at) DO UPDATE SET
    fetched_at = EXCLUDED.fetched_at,
    temperature = EXCLUDED.temperature,
    precipitation_probability = EXCLUDED.precipitation_probability,
    wind_speed = EXCLUDED.wind_speed,
    conditions = EXCLUDED.conditions,
    source_batch = EXCLUDED.source_batch
WHERE EXCLUDED.source_batch >= core_weather.source_batch
"#;

const MERGE_TRAFFIC: &str = r#"
INSERT INTO core_traffic_incidents (
    incident_key, polylines, incident_type, road_closed,
    junctions_closed, start_time, end_time, comment, source_batch
)
SELECT DISTINCT ON (incident_key)
    incident_key, polylines, incident_type, road_closed,
    junctions_closed, start_time, end_time, comment, source_batch
FROM staging_traffic
ORDER BY incident_key, source_batch DESC
ON CONFLICT (incident_key) DO UPDATE SET
    polylines = EXCLUDED.polylines,
    incident_type = EXCLUDED.incident_type,
    road_closed = EXCLUDED.road_closed,
    junctions_closed = EXCLUDED.junctions_closed,
    start_time = EXCLUDED.start_time,
    end_time = EXCLUDED.end_time,
    comment = EXCLUDED.comment,
    source_batch = EXCLUDED.source_batch
WHERE EXCLUDED.source_batch >= core_traffic_incidents.source_batch
"#;
