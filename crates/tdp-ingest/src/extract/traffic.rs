//! Traffic-incident adapter
//!
//! Queries an area-bounded incident feed and applies three business rules
//! before normalization: congestion sub-incidents (those declaring a
//! parent) are dropped to avoid double counting; lane restrictions are
//! kept only when they restrict buses; road closures additionally record
//! whether every junction along the closure is impassable.
//!
//! Upstream incident ids are not stable across fetches, so each incident's
//! identity is derived from what it describes: a hash over its encoded
//! geometry, type, and start time (truncated to the minute).

use super::{ExtractError, Extractor, Result, Source};
use crate::config::{HttpConfig, TrafficConfig};
use crate::http::ApiClient;
use crate::polyline;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use tdp_common::hash::sha256_hex_parts;
use tdp_common::types::Row;
use tracing::{debug, info, warn};

const INCIDENTS_ENDPOINT: &str = "v7/incidents";

/// Destination column width for the free-text comment.
const MAX_COMMENT_LEN: usize = 400;

/// One incident after filtering and normalization
#[derive(Debug, Clone, PartialEq)]
struct IncidentRecord {
    incident_key: String,
    /// One polyline per geometry sub-path, space-separated (space is
    /// outside the polyline alphabet)
    polylines: String,
    incident_type: String,
    road_closed: bool,
    junctions_closed: bool,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    comment: Option<String>,
}

impl IncidentRecord {
    fn into_row(self) -> Row {
        let mut row = Row::with_capacity(8);
        row.push("incident_key", self.incident_key);
        row.push("polylines", self.polylines);
        row.push("incident_type", self.incident_type);
        row.push("road_closed", self.road_closed);
        row.push("junctions_closed", self.junctions_closed);
        row.push("start_time", self.start_time);
        row.push("end_time", self.end_time);
        row.push("comment", self.comment);
        row
    }
}

/// Adapter for the area incident feed
pub struct TrafficExtractor {
    client: ApiClient,
    api_key: String,
    center_lat: f64,
    center_lng: f64,
    radius_m: u32,
}

impl TrafficExtractor {
    pub fn new(config: &TrafficConfig, http: HttpConfig) -> Result<Self> {
        Ok(TrafficExtractor {
            client: ApiClient::new(&config.base_url, http)?,
            api_key: config.api_key.clone(),
            center_lat: config.center_lat,
            center_lng: config.center_lng,
            radius_m: config.radius_m,
        })
    }
}

#[async_trait]
impl Extractor for TrafficExtractor {
    fn source(&self) -> Source {
        Source::Traffic
    }

    async fn extract(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Row>> {
        let area = format!(
            "circle:{},{};r={}",
            self.center_lat, self.center_lng, self.radius_m
        );
        let body = self
            .client
            .get_json(
                INCIDENTS_ENDPOINT,
                &[
                    ("in", area),
                    ("locationReferencing", "shape".to_string()),
                    ("apiKey", self.api_key.clone()),
                ],
            )
            .await?;

        // An error payload means the whole call is unusable.
        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            let message = error["message"]
                .as_str()
                .unwrap_or("unspecified upstream error");
            return Err(ExtractError::Api(message.to_string()));
        }

        let results = body
            .get("results")
            .and_then(Json::as_array)
            .ok_or(ExtractError::MissingField("results"))?;

        info!(count = results.len(), "fetched traffic incidents");

        let rows: Vec<Row> = results
            .iter()
            .filter_map(normalize_incident)
            .filter(|record| {
                // Incidents without a start time cannot be compared; keep them.
                match (since, record.start_time) {
                    (Some(cutoff), Some(start)) => start >= cutoff,
                    _ => true,
                }
            })
            .map(IncidentRecord::into_row)
            .collect();

        info!(rows = rows.len(), "normalized traffic incidents");
        Ok(rows)
    }
}

/// Parse and filter one incident. `None` means the record is either
/// filtered by a business rule or too malformed to process; neither is
/// fatal for the batch.
fn normalize_incident(incident: &Json) -> Option<IncidentRecord> {
    let details = &incident["incidentDetails"];

    let Some(incident_type) = details["type"].as_str() else {
        warn!("dropping incident without a type");
        return None;
    };

    // Congestion records that declare a parent are sub-incidents of one
    // already reported; counting both would double-count.
    if incident_type == "congestion" && !incident["parentID"].is_null() {
        debug!("skipping congestion sub-incident");
        return None;
    }

    // Lane restrictions only matter when buses are among the restricted
    // vehicle classes.
    if incident_type == "laneRestriction" {
        let restricted = vehicle_restriction_set(details);
        if !restricted.iter().any(|v| v == "bus") {
            debug!(?restricted, "skipping lane restriction that does not affect buses");
            return None;
        }
    }

    let Some(links) = incident["location"]["shape"]["links"].as_array() else {
        warn!(incident_type, "dropping incident without shape geometry");
        return None;
    };

    let polylines = encode_links(links);

    let road_closed = details["roadClosed"].as_bool().unwrap_or(false);
    // junctionTraversability is only reported for closures; anything short
    // of allClosed leaves some junction passable.
    let junctions_closed =
        road_closed && details["junctionTraversability"].as_str() == Some("allClosed");

    let start_time = parse_instant(&details["startTime"]);
    let end_time = parse_instant(&details["endTime"]);

    let comment = details["comment"]
        .as_str()
        .or_else(|| details["description"]["value"].as_str())
        .map(|text| text.chars().take(MAX_COMMENT_LEN).collect());

    let incident_key = derive_incident_key(&polylines, incident_type, start_time);

    Some(IncidentRecord {
        incident_key,
        polylines,
        incident_type: incident_type.to_string(),
        road_closed,
        junctions_closed,
        start_time,
        end_time,
        comment,
    })
}

/// Collect the restricted vehicle classes, tolerating both encodings the
/// feed has used: a list of `{"vehicleType": ..}` objects or one object
/// with a `vehicleType` list.
fn vehicle_restriction_set(details: &Json) -> Vec<String> {
    match &details["vehicleRestrictions"] {
        Json::Array(items) => items
            .iter()
            .filter_map(|item| item["vehicleType"].as_str())
            .map(String::from)
            .collect(),
        restrictions @ Json::Object(_) => match &restrictions["vehicleType"] {
            Json::Array(types) => types
                .iter()
                .filter_map(Json::as_str)
                .map(String::from)
                .collect(),
            Json::String(single) => vec![single.clone()],
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// Encode each geometry sub-path as a polyline, space-joined
fn encode_links(links: &[Json]) -> String {
    links
        .iter()
        .filter_map(|link| link["points"].as_array())
        .map(|points| {
            let coordinates: Vec<(f64, f64)> = points
                .iter()
                .filter_map(|pt| Some((pt["lat"].as_f64()?, pt["lng"].as_f64()?)))
                .collect();
            polyline::encode(&coordinates)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_instant(value: &Json) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            warn!(raw, "unparsable incident timestamp: {e}");
            None
        },
    }
}

/// Business key: geometry, type, and minute-truncated start time. The
/// polyline quantization makes re-fetched geometry byte-identical, and the
/// minute truncation absorbs sub-minute jitter in upstream start times.
fn derive_incident_key(
    polylines: &str,
    incident_type: &str,
    start_time: Option<DateTime<Utc>>,
) -> String {
    let start_minute = start_time
        .map(|ts| ts.format("%Y-%m-%dT%H:%MZ").to_string())
        .unwrap_or_default();

    sha256_hex_parts([polylines, incident_type, start_minute.as_str()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tdp_common::types::Value;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn incident(details: Json) -> Json {
        json!({
            "location": {
                "shape": {
                    "links": [
                        {"points": [
                            {"lat": 33.784562, "lng": -84.394732},
                            {"lat": 33.785, "lng": -84.395}
                        ]}
                    ]
                }
            },
            "incidentDetails": details
        })
    }

    #[test]
    fn test_congestion_with_parent_is_excluded() {
        let mut record = incident(json!({"type": "congestion", "roadClosed": false}));
        record["parentID"] = json!("parent-1");

        assert!(normalize_incident(&record).is_none());
    }

    #[test]
    fn test_congestion_without_parent_is_retained() {
        let record = incident(json!({"type": "congestion", "roadClosed": false}));
        let normalized = normalize_incident(&record).unwrap();
        assert_eq!(normalized.incident_type, "congestion");
    }

    #[test]
    fn test_lane_restriction_without_bus_is_excluded() {
        let record = incident(json!({
            "type": "laneRestriction",
            "roadClosed": false,
            "vehicleRestrictions": [{"vehicleType": "truck"}]
        }));

        assert!(normalize_incident(&record).is_none());
    }

    #[test]
    fn test_lane_restriction_with_bus_is_retained() {
        let record = incident(json!({
            "type": "laneRestriction",
            "roadClosed": false,
            "vehicleRestrictions": [{"vehicleType": "truck"}, {"vehicleType": "bus"}]
        }));

        assert!(normalize_incident(&record).is_some());
    }

    #[test]
    fn test_lane_restriction_object_encoding() {
        let record = incident(json!({
            "type": "laneRestriction",
            "roadClosed": false,
            "vehicleRestrictions": {"vehicleType": ["bus", "truck"]}
        }));

        assert!(normalize_incident(&record).is_some());
    }

    #[test]
    fn test_missing_type_drops_record() {
        let record = incident(json!({"roadClosed": true}));
        assert!(normalize_incident(&record).is_none());
    }

    #[test]
    fn test_junction_traversability() {
        let closed = incident(json!({
            "type": "roadClosure",
            "roadClosed": true,
            "junctionTraversability": "allClosed"
        }));
        assert!(normalize_incident(&closed).unwrap().junctions_closed);

        let partial = incident(json!({
            "type": "roadClosure",
            "roadClosed": true,
            "junctionTraversability": "intermediateClosedEdgeOpen"
        }));
        assert!(!normalize_incident(&partial).unwrap().junctions_closed);

        // junctionTraversability is meaningless without a closure.
        let open = incident(json!({
            "type": "accident",
            "roadClosed": false,
            "junctionTraversability": "allClosed"
        }));
        assert!(!normalize_incident(&open).unwrap().junctions_closed);
    }

    #[test]
    fn test_incident_key_is_stable_within_a_minute() {
        let base = Utc.with_ymd_and_hms(2026, 3, 10, 8, 30, 5).unwrap();
        let jittered = Utc.with_ymd_and_hms(2026, 3, 10, 8, 30, 48).unwrap();

        let a = derive_incident_key("abc def", "accident", Some(base));
        let b = derive_incident_key("abc def", "accident", Some(jittered));
        assert_eq!(a, b);

        let other_minute = Utc.with_ymd_and_hms(2026, 3, 10, 8, 31, 0).unwrap();
        assert_ne!(
            a,
            derive_incident_key("abc def", "accident", Some(other_minute))
        );
        assert_ne!(a, derive_incident_key("abc xyz", "accident", Some(base)));
        assert_ne!(a, derive_incident_key("abc def", "congestion", Some(base)));
    }

    #[test]
    fn test_encode_links_joins_subpaths_with_space() {
        let links = vec![
            json!({"points": [{"lat": 38.5, "lng": -120.2}]}),
            json!({"points": [{"lat": 40.7, "lng": -120.95}]}),
        ];

        let encoded = encode_links(&links);
        assert_eq!(encoded.split(' ').count(), 2);
        // Each sub-path decodes independently.
        for part in encoded.split(' ') {
            assert_eq!(polyline::decode(part).unwrap().len(), 1);
        }
    }

    fn test_config(base_url: String) -> TrafficConfig {
        TrafficConfig {
            base_url,
            api_key: "traffic-key".to_string(),
            center_lat: 33.784562,
            center_lng: -84.394732,
            radius_m: 1900,
        }
    }

    fn test_http() -> HttpConfig {
        HttpConfig {
            timeout_secs: 5,
            max_retries: 1,
        }
    }

    #[tokio::test]
    async fn test_extract_end_to_end() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v7/incidents"))
            .and(query_param("locationReferencing", "shape"))
            .and(query_param("apiKey", "traffic-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    {
                        "location": {"shape": {"links": [
                            {"points": [
                                {"lat": 33.784562, "lng": -84.394732},
                                {"lat": 33.785, "lng": -84.395}
                            ]}
                        ]}},
                        "incidentDetails": {
                            "type": "accident",
                            "roadClosed": true,
                            "junctionTraversability": "allClosed",
                            "startTime": "2026-08-06T08:15:30Z",
                            "endTime": "2026-08-06T10:00:00Z",
                            "comment": "multi-vehicle collision"
                        }
                    },
                    {
                        "parentID": "p1",
                        "location": {"shape": {"links": [
                            {"points": [{"lat": 33.786, "lng": -84.396}]}
                        ]}},
                        "incidentDetails": {"type": "congestion", "roadClosed": false}
                    }
                ]
            })))
            .mount(&server)
            .await;

        let extractor = TrafficExtractor::new(&test_config(server.uri()), test_http()).unwrap();
        let rows = extractor.extract(None).await.unwrap();

        // The congestion sub-incident is filtered out.
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.get("incident_type"), Some(&Value::Text("accident".to_string())));
        assert_eq!(row.get("road_closed"), Some(&Value::Bool(true)));
        assert_eq!(row.get("junctions_closed"), Some(&Value::Bool(true)));
        assert_eq!(
            row.get("comment"),
            Some(&Value::Text("multi-vehicle collision".to_string()))
        );

        let Some(Value::Text(key)) = row.get("incident_key") else {
            panic!("incident_key must be text");
        };
        assert_eq!(key.len(), 64);
    }

    #[tokio::test]
    async fn test_error_payload_is_fatal() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v7/incidents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "error": {"message": "apiKey invalid"}
            })))
            .mount(&server)
            .await;

        let extractor = TrafficExtractor::new(&test_config(server.uri()), test_http()).unwrap();
        let error = extractor.extract(None).await.unwrap_err();

        assert!(matches!(error, ExtractError::Api(message) if message == "apiKey invalid"));
    }
}
