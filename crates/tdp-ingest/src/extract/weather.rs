//! Weather adapter (NWS hourly forecast)
//!
//! Two sequential calls: the points endpoint resolves the fixed campus
//! coordinate to a forecast-grid URL, and the grid's hourly forecast gives
//! the periods, of which only the first (current hour) is kept. The
//! upstream authenticates with a contact-identifying `User-Agent` header
//! rather than an API key.
//!
//! Field encodings vary between deployments, so every optional field
//! degrades to a default instead of failing: only a missing grid URL,
//! missing periods, or an unreadable period start time abort the source.

use super::{ExtractError, Extractor, Result, Source};
use crate::config::{HttpConfig, WeatherConfig};
use crate::http::ApiClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use serde::Deserialize;
use tdp_common::types::Row;
use tracing::{info, warn};

/// Destination column width for the conditions text.
const MAX_CONDITIONS_LEN: usize = 100;

#[derive(Debug, Deserialize)]
struct PointsResponse {
    properties: Option<PointsProperties>,
}

#[derive(Debug, Deserialize)]
struct PointsProperties {
    #[serde(rename = "forecastHourly")]
    forecast_hourly: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    properties: Option<ForecastProperties>,
}

#[derive(Debug, Deserialize)]
struct ForecastProperties {
    /// Kept as raw JSON: period fields use several encodings across
    /// deployments and are normalized leniently below.
    periods: Option<Vec<serde_json::Value>>,
}

/// Adapter for the hourly weather feed
pub struct WeatherExtractor {
    client: ApiClient,
    latitude: f64,
    longitude: f64,
    wind_numbers: Regex,
}

impl WeatherExtractor {
    pub fn new(config: &WeatherConfig, http: HttpConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|e| ExtractError::Decode(format!("invalid user agent: {e}")))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/geo+json"));

        Ok(WeatherExtractor {
            client: ApiClient::with_default_headers(&config.base_url, http, headers)?,
            latitude: config.latitude,
            longitude: config.longitude,
            wind_numbers: Regex::new(r"\d+")?,
        })
    }

    /// Resolve the configured point to its hourly-forecast URL
    async fn resolve_forecast_url(&self) -> Result<String> {
        let path = format!("points/{},{}", self.latitude, self.longitude);
        let body = self.client.get_json(&path, &[]).await?;

        let points: PointsResponse = serde_json::from_value(body)
            .map_err(|e| ExtractError::Decode(format!("points response: {e}")))?;

        points
            .properties
            .and_then(|p| p.forecast_hourly)
            .ok_or(ExtractError::MissingField("properties.forecastHourly"))
    }

    async fn fetch_current_period(&self, forecast_url: &str) -> Result<serde_json::Value> {
        let body = self.client.get_json_url(forecast_url, &[]).await?;

        let forecast: ForecastResponse = serde_json::from_value(body)
            .map_err(|e| ExtractError::Decode(format!("forecast response: {e}")))?;

        let periods = forecast
            .properties
            .and_then(|p| p.periods)
            .ok_or(ExtractError::MissingField("properties.periods"))?;

        periods
            .into_iter()
            .next()
            .ok_or_else(|| ExtractError::Decode("no forecast periods returned".to_string()))
    }
}

#[async_trait]
impl Extractor for WeatherExtractor {
    fn source(&self) -> Source {
        Source::Weather
    }

    /// `since` is ignored: the forecast feed always reflects "now".
    async fn extract(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<Row>> {
        let forecast_url = self.resolve_forecast_url().await?;
        let period = self.fetch_current_period(&forecast_url).await?;

        let recorded_at = parse_recorded_at(&period)?;
        let temperature = parse_temperature(&period);
        let precipitation = parse_precipitation(&period);
        let wind_speed = parse_wind_speed(&self.wind_numbers, &period);
        let conditions = parse_conditions(&period);

        info!(
            %recorded_at,
            temperature,
            precipitation,
            wind_speed,
            conditions = %conditions,
            "extracted current weather"
        );

        let mut row = Row::with_capacity(6);
        row.push("recorded_at", recorded_at);
        row.push("fetched_at", Utc::now());
        row.push("temperature", temperature);
        row.push("precipitation_probability", precipitation);
        row.push("wind_speed", wind_speed);
        row.push("conditions", conditions);

        Ok(vec![row])
    }
}

/// Period start time is the business key; it must parse.
fn parse_recorded_at(period: &serde_json::Value) -> Result<DateTime<Utc>> {
    let raw = period["startTime"]
        .as_str()
        .ok_or(ExtractError::MissingField("periods[0].startTime"))?;

    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| ExtractError::Decode(format!("startTime {raw:?}: {e}")))
}

/// Absent temperature is a data-quality event, not an error.
fn parse_temperature(period: &serde_json::Value) -> f64 {
    match period["temperature"].as_f64() {
        Some(temp) => temp,
        None => {
            warn!("temperature missing from forecast period, defaulting to 0.0");
            0.0
        },
    }
}

/// Probability arrives as null, a bare number, or `{"value": n}`;
/// normalize all three to an integer percentage.
fn parse_precipitation(period: &serde_json::Value) -> i64 {
    let raw = &period["probabilityOfPrecipitation"];

    let value = if raw.is_null() {
        0
    } else if let Some(object_value) = raw.get("value") {
        object_value.as_f64().map(|v| v as i64).unwrap_or(0)
    } else {
        raw.as_f64().map(|v| v as i64).unwrap_or(0)
    };

    value.clamp(0, 100)
}

/// Wind speed is free text (`"10 mph"`, `"5 to 10 mph"`, `"Calm"`): the
/// mean of all embedded integers, 0.0 when none parse.
fn parse_wind_speed(numbers: &Regex, period: &serde_json::Value) -> f64 {
    let raw = period["windSpeed"].as_str().unwrap_or("");

    let values: Vec<f64> = numbers
        .find_iter(raw)
        .filter_map(|m| m.as_str().parse().ok())
        .collect();

    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn parse_conditions(period: &serde_json::Value) -> String {
    period["shortForecast"]
        .as_str()
        .unwrap_or("Unknown")
        .chars()
        .take(MAX_CONDITIONS_LEN)
        .collect()
}
