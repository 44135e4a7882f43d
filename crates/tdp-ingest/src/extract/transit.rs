//! Transit vehicle-position adapter
//!
//! Two-step extraction: the vehicle-locations endpoint gives position,
//! speed, and a timestamp in the relay service's custom
//! `/Date(<epoch-ms>)<±HHMM>/` encoding; a per-vehicle stop-estimates
//! endpoint gives the next stop and its ETA. Stop-estimate lookups are
//! independent network calls and degrade to null columns, never errors.

use super::{ExtractError, Extractor, Result, Source};
use crate::config::{HttpConfig, TransitConfig};
use crate::http::ApiClient;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use futures::stream::{self, StreamExt};
use regex::Regex;
use serde::Deserialize;
use tdp_common::types::Row;
use tracing::{debug, info, warn};

const VEHICLE_POINTS_ENDPOINT: &str = "Services/JSONPRelay.svc/GetMapVehiclePoints";
const STOP_ESTIMATES_ENDPOINT: &str = "Services/JSONPRelay.svc/GetVehicleRouteStopEstimates";

/// Feed timestamps look like `/Date(1700000000000)-0500/`: epoch
/// milliseconds plus the feed's UTC offset. This is not ISO-8601; a fixed
/// grammar scan is the only safe way to read it.
const FEED_TIMESTAMP_PATTERN: &str = r"/Date\((\d+)([+-]\d{4})\)/";

/// Estimate timestamps carry no offset and are sometimes backslash-escaped
/// by the relay: `\/Date(1700000000000)\/`.
const ESTIMATE_TIMESTAMP_PATTERN: &str = r"\\?/Date\((\d+)\)\\?/";

/// One vehicle as reported by the locations endpoint
#[derive(Debug, Clone, Deserialize)]
struct VehiclePoint {
    #[serde(rename = "VehicleID")]
    vehicle_id: i64,
    #[serde(rename = "RouteID")]
    route_id: i64,
    #[serde(rename = "Latitude")]
    latitude: f64,
    #[serde(rename = "Longitude")]
    longitude: f64,
    #[serde(rename = "GroundSpeed")]
    ground_speed: f64,
    #[serde(rename = "TimeStamp")]
    timestamp: String,
}

/// Stop-estimate payload: one entry per requested vehicle, estimates
/// ordered current-stop-first
#[derive(Debug, Deserialize)]
struct VehicleEstimates {
    #[serde(rename = "Estimates", default)]
    estimates: Option<Vec<StopEstimate>>,
}

#[derive(Debug, Deserialize)]
struct StopEstimate {
    #[serde(rename = "RouteStopID")]
    route_stop_id: Option<i64>,
    #[serde(rename = "EstimateTime")]
    estimate_time: Option<String>,
}

/// A decoded feed timestamp plus the derived operational-timezone fields
#[derive(Debug, Clone, PartialEq, Eq)]
struct FeedInstant {
    /// Absolute UTC instant (business-key component)
    observed_at: DateTime<Utc>,
    day_of_week: String,
    month: String,
    time_of_day: String,
}

/// Adapter for the vehicle-position relay
pub struct TransitExtractor {
    client: ApiClient,
    api_key: String,
    estimate_concurrency: usize,
    timezone: Tz,
    feed_timestamp: Regex,
    estimate_timestamp: Regex,
}

impl TransitExtractor {
    pub fn new(config: &TransitConfig, http: HttpConfig) -> Result<Self> {
        Ok(TransitExtractor {
            client: ApiClient::new(&config.base_url, http)?,
            api_key: config.api_key.clone(),
            estimate_concurrency: config.estimate_concurrency.max(1),
            timezone: config.timezone,
            feed_timestamp: Regex::new(FEED_TIMESTAMP_PATTERN)?,
            estimate_timestamp: Regex::new(ESTIMATE_TIMESTAMP_PATTERN)?,
        })
    }

    async fn fetch_vehicles(&self) -> Result<Vec<VehiclePoint>> {
        let body = self
            .client
            .get_json(
                VEHICLE_POINTS_ENDPOINT,
                &[
                    ("apiKey", self.api_key.clone()),
                    ("isPublicMap", "true".to_string()),
                ],
            )
            .await?;

        serde_json::from_value(body)
            .map_err(|e| ExtractError::Decode(format!("vehicle feed: {e}")))
    }

    /// Fetch the next stop and ETA for one vehicle. Every failure mode
    /// degrades to `(None, None)`: a vehicle without an estimate is still a
    /// valid observation.
    async fn fetch_stop_estimate(&self, vehicle_id: i64) -> (Option<i64>, Option<String>) {
        let body = match self
            .client
            .get_json(
                STOP_ESTIMATES_ENDPOINT,
                &[
                    ("vehicleIdStrings", vehicle_id.to_string()),
                    ("quantity", "2".to_string()),
                ],
            )
            .await
        {
            Ok(body) => body,
            Err(e) => {
                warn!(vehicle_id, "stop-estimate lookup failed: {e}");
                return (None, None);
            },
        };

        let vehicles: Vec<VehicleEstimates> = match serde_json::from_value(body) {
            Ok(vehicles) => vehicles,
            Err(e) => {
                warn!(vehicle_id, "unexpected stop-estimate payload: {e}");
                return (None, None);
            },
        };

        // The relay returns the stop the vehicle is heading to first.
        let Some(estimate) = vehicles
            .into_iter()
            .next()
            .and_then(|v| v.estimates)
            .and_then(|estimates| estimates.into_iter().next())
        else {
            debug!(vehicle_id, "no stop estimate available");
            return (None, None);
        };

        let eta = estimate
            .estimate_time
            .as_deref()
            .and_then(|raw| self.decode_estimate_time(raw));

        (estimate.route_stop_id, eta)
    }

    /// Decode an estimate timestamp into an operational-timezone
    /// `%H:%M:%S` string
    fn decode_estimate_time(&self, raw: &str) -> Option<String> {
        let caps = self.estimate_timestamp.captures(raw)?;
        let epoch_ms: i64 = caps[1].parse().ok()?;
        let utc = Utc.timestamp_millis_opt(epoch_ms).single()?;
        Some(
            utc.with_timezone(&self.timezone)
                .format("%H:%M:%S")
                .to_string(),
        )
    }

    fn build_row(vehicle: &VehiclePoint, instant: &FeedInstant, stop_id: Option<i64>, eta: Option<String>) -> Row {
        let mut row = Row::with_capacity(11);
        row.push("vehicle_id", vehicle.vehicle_id);
        row.push("route_id", vehicle.route_id);
        row.push("latitude", vehicle.latitude);
        row.push("longitude", vehicle.longitude);
        row.push("observed_at", instant.observed_at);
        row.push("day_of_week", instant.day_of_week.clone());
        row.push("month", instant.month.clone());
        row.push("time_of_day", instant.time_of_day.clone());
        row.push("ground_speed", vehicle.ground_speed);
        row.push("next_stop_id", stop_id);
        row.push("eta_to_stop", eta);
        row
    }
}

#[async_trait]
impl Extractor for TransitExtractor {
    fn source(&self) -> Source {
        Source::Transit
    }

    async fn extract(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Row>> {
        let vehicles = self.fetch_vehicles().await?;
        info!(count = vehicles.len(), "fetched vehicle positions");

        let decoded: Vec<(VehiclePoint, FeedInstant)> = vehicles
            .into_iter()
            .filter_map(|vehicle| {
                match decode_feed_timestamp(&self.feed_timestamp, &vehicle.timestamp, self.timezone)
                {
                    Some(instant) => Some((vehicle, instant)),
                    None => {
                        warn!(
                            vehicle_id = vehicle.vehicle_id,
                            raw = %vehicle.timestamp,
                            "dropping vehicle with malformed timestamp"
                        );
                        None
                    },
                }
            })
            .filter(|(_, instant)| since.is_none_or(|cutoff| instant.observed_at >= cutoff))
            .collect();

        // Per-vehicle estimate lookups run concurrently with a bound, and
        // buffered() keeps output rows in feed order.
        let rows = stream::iter(decoded)
            .map(|(vehicle, instant)| async move {
                let (stop_id, eta) = self.fetch_stop_estimate(vehicle.vehicle_id).await;
                Self::build_row(&vehicle, &instant, stop_id, eta)
            })
            .buffered(self.estimate_concurrency)
            .collect::<Vec<Row>>()
            .await;

        info!(rows = rows.len(), "normalized vehicle positions");
        Ok(rows)
    }
}

/// Decode the relay's `/Date(<epoch-ms>)<±HHMM>/` grammar.
///
/// The epoch gives the absolute UTC instant. Applying the offset recovers
/// the feed's local wall time; that wall time, read as an instant and
/// converted to the operational timezone, yields the day-of-week / month /
/// time-of-day columns. Returns `None` when the grammar does not match;
/// callers drop the record.
fn decode_feed_timestamp(re: &Regex, raw: &str, tz: Tz) -> Option<FeedInstant> {
    let caps = re.captures(raw)?;
    let epoch_ms: i64 = caps[1].parse().ok()?;
    let offset = &caps[2];

    let offset_hours: i64 = offset[..3].parse().ok()?;
    let offset_minutes: i64 = format!("{}{}", &offset[..1], &offset[3..]).parse().ok()?;

    let observed_at = Utc.timestamp_millis_opt(epoch_ms).single()?;
    let adjusted =
        observed_at + Duration::hours(offset_hours) + Duration::minutes(offset_minutes);
    let local = adjusted.with_timezone(&tz);

    Some(FeedInstant {
        observed_at,
        day_of_week: local.format("%A").to_string(),
        month: local.format("%m").to_string(),
        time_of_day: local.format("%H:%M:%S").to_string(),
    })
}
