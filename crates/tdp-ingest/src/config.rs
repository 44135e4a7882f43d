//! Configuration management
//!
//! All runtime configuration is resolved once at startup from the
//! environment (a `.env` file is honored in development) into typed structs
//! that are passed explicitly to the component constructors. Nothing reads
//! the environment after startup.

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/tdp";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default outbound HTTP timeout in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;

/// Default retry attempts for transient upstream failures.
pub const DEFAULT_HTTP_MAX_RETRIES: u32 = 3;

/// Default bound on concurrent per-vehicle stop-estimate lookups.
pub const DEFAULT_ESTIMATE_CONCURRENCY: usize = 8;

/// Default operational timezone for derived day/time fields.
pub const DEFAULT_TIMEZONE: &str = "America/New_York";

/// Default NWS API base URL.
pub const DEFAULT_WEATHER_BASE_URL: &str = "https://api.weather.gov";

/// Default traffic incident API base URL.
pub const DEFAULT_TRAFFIC_BASE_URL: &str = "https://data.traffic.hereapi.com";

/// Default forecast point (campus center).
pub const DEFAULT_WEATHER_LATITUDE: f64 = 33.7756;
pub const DEFAULT_WEATHER_LONGITUDE: f64 = -84.3963;

/// Default incident query circle: center and radius in meters. The circle
/// covers every serviced route except the satellite campus shuttle.
pub const DEFAULT_TRAFFIC_CENTER_LAT: f64 = 33.784562;
pub const DEFAULT_TRAFFIC_CENTER_LNG: f64 = -84.394732;
pub const DEFAULT_TRAFFIC_RADIUS_M: u32 = 1900;

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    pub transit: TransitConfig,
    pub weather: WeatherConfig,
    pub traffic: TrafficConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Outbound HTTP behavior shared by all source adapters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
}

/// Transit feed configuration
#[derive(Debug, Clone)]
pub struct TransitConfig {
    pub base_url: String,
    pub api_key: String,
    /// Bound on concurrent stop-estimate lookups
    pub estimate_concurrency: usize,
    /// Timezone used for derived day-of-week/month/time-of-day columns
    pub timezone: chrono_tz::Tz,
}

/// Weather feed configuration. The upstream requires a contact-identifying
/// `User-Agent` header instead of an API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    pub base_url: String,
    pub user_agent: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Traffic incident feed configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficConfig {
    pub base_url: String,
    pub api_key: String,
    pub center_lat: f64,
    pub center_lng: f64,
    pub radius_m: u32,
}

impl IngestConfig {
    /// Load configuration from environment and defaults
    ///
    /// Required variables: `TRANSIT_API_URL`, `TRANSIT_API_KEY`,
    /// `WEATHER_USER_AGENT`, `TRAFFIC_API_KEY`. Everything else has a
    /// default.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = IngestConfig {
            database: DatabaseConfig::from_env(),
            http: HttpConfig {
                timeout_secs: env_parsed("HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS),
                max_retries: env_parsed("HTTP_MAX_RETRIES", DEFAULT_HTTP_MAX_RETRIES),
            },
            transit: TransitConfig {
                base_url: required_var("TRANSIT_API_URL")?,
                api_key: required_var("TRANSIT_API_KEY")?,
                estimate_concurrency: env_parsed(
                    "TRANSIT_ESTIMATE_CONCURRENCY",
                    DEFAULT_ESTIMATE_CONCURRENCY,
                ),
                timezone: std::env::var("TDP_TIMEZONE")
                    .unwrap_or_else(|_| DEFAULT_TIMEZONE.to_string())
                    .parse()
                    .map_err(|e| anyhow!("Invalid TDP_TIMEZONE: {e}"))?,
            },
            weather: WeatherConfig {
                base_url: std::env::var("WEATHER_API_URL")
                    .unwrap_or_else(|_| DEFAULT_WEATHER_BASE_URL.to_string()),
                user_agent: required_var("WEATHER_USER_AGENT")?,
                latitude: env_parsed("WEATHER_LATITUDE", DEFAULT_WEATHER_LATITUDE),
                longitude: env_parsed("WEATHER_LONGITUDE", DEFAULT_WEATHER_LONGITUDE),
            },
            traffic: TrafficConfig {
                base_url: std::env::var("TRAFFIC_API_URL")
                    .unwrap_or_else(|_| DEFAULT_TRAFFIC_BASE_URL.to_string()),
                api_key: required_var("TRAFFIC_API_KEY")?,
                center_lat: env_parsed("TRAFFIC_CENTER_LAT", DEFAULT_TRAFFIC_CENTER_LAT),
                center_lng: env_parsed("TRAFFIC_CENTER_LNG", DEFAULT_TRAFFIC_CENTER_LNG),
                radius_m: env_parsed("TRAFFIC_RADIUS_M", DEFAULT_TRAFFIC_RADIUS_M),
            },
        };

        Ok(config)
    }
}

impl DatabaseConfig {
    /// Load just the database settings from environment and defaults
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        DatabaseConfig {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            max_connections: env_parsed(
                "DATABASE_MAX_CONNECTIONS",
                DEFAULT_DATABASE_MAX_CONNECTIONS,
            ),
            min_connections: env_parsed(
                "DATABASE_MIN_CONNECTIONS",
                DEFAULT_DATABASE_MIN_CONNECTIONS,
            ),
            connect_timeout_secs: env_parsed(
                "DATABASE_CONNECT_TIMEOUT",
                DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            ),
        }
    }

    /// Create the connection pool described by this configuration
    pub async fn connect(&self) -> anyhow::Result<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(Duration::from_secs(self.connect_timeout_secs))
            .connect(&self.url)
            .await
            .context("Failed to connect to database")?;

        Ok(pool)
    }
}

fn required_var(name: &str) -> anyhow::Result<String> {
    let value = std::env::var(name).map_err(|_| anyhow!("Missing required env var {name}"))?;
    if value.trim().is_empty() {
        return Err(anyhow!("Env var {name} must not be empty"));
    }
    Ok(value)
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
