//! Remote fireball feed: HTTP retrieval and tabular payload decoding.
//!
//! # Responsibility
//! - Fetch the feed and normalize each row into `FireballData`.
//!
//! # Invariants
//! - Only HTTP 200 counts as success.
//! - Rows without a parseable date, or failing model validation, are dropped
//!   and counted; they never fail the whole payload.
//! - No store access happens here.

use crate::model::fireball::FireballData;
use chrono::{NaiveDateTime, TimeZone, Utc};
use log::{info, warn};
use serde::Deserialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

pub const DEFAULT_ENDPOINT: &str = "https://ssd-api.jpl.nasa.gov/fireball.api";

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DATE_COLUMN: &str = "date";
const SOUTH: &str = "S";
const WEST: &str = "W";

#[derive(Debug)]
pub enum FetchError {
    Client(reqwest::Error),
    Transport(reqwest::Error),
    Status(u16),
}

impl Display for FetchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client(err) => write!(f, "http client setup failed: {err}"),
            Self::Transport(err) => write!(f, "fireball feed request failed: {err}"),
            Self::Status(status) => write!(f, "fireball feed returned http status {status}"),
        }
    }
}

impl Error for FetchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Client(err) | Self::Transport(err) => Some(err),
            Self::Status(_) => None,
        }
    }
}

#[derive(Debug)]
pub enum DecodeError {
    Json(serde_json::Error),
    MissingColumn(&'static str),
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(err) => write!(f, "fireball payload is malformed: {err}"),
            Self::MissingColumn(name) => write!(f, "fireball payload has no `{name}` column"),
        }
    }
}

impl Error for DecodeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Json(err) => Some(err),
            Self::MissingColumn(_) => None,
        }
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

#[derive(Debug)]
pub enum SourceError {
    Fetch(FetchError),
    Decode(DecodeError),
}

impl Display for SourceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fetch(err) => write!(f, "{err}"),
            Self::Decode(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SourceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Fetch(err) => Some(err),
            Self::Decode(err) => Some(err),
        }
    }
}

impl From<FetchError> for SourceError {
    fn from(value: FetchError) -> Self {
        Self::Fetch(value)
    }
}

impl From<DecodeError> for SourceError {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Source of normalized remote records.
pub trait FireballSource: Send + Sync {
    fn fetch(&self) -> Result<Vec<FireballData>, SourceError>;
}

/// Blocking HTTP client for the fireball feed.
#[derive(Debug, Clone)]
pub struct HttpFireballSource {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl HttpFireballSource {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl FireballSource for HttpFireballSource {
    fn fetch(&self) -> Result<Vec<FireballData>, SourceError> {
        let started_at = Instant::now();
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .map_err(FetchError::Transport)?;
        let status = response.status().as_u16();
        if status != 200 {
            warn!(
                "event=feed_fetch module=sync status=error http_status={} duration_ms={}",
                status,
                started_at.elapsed().as_millis()
            );
            return Err(FetchError::Status(status).into());
        }
        let body = response.bytes().map_err(FetchError::Transport)?;
        let decoded = decode_payload(&body)?;
        info!(
            "event=feed_fetch module=sync status=ok records={} dropped_rows={} duration_ms={}",
            decoded.records.len(),
            decoded.dropped_rows,
            started_at.elapsed().as_millis()
        );
        Ok(decoded.records)
    }
}

/// Result of decoding one feed payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedPayload {
    pub records: Vec<FireballData>,
    pub dropped_rows: usize,
}

/// Feed body; `signature` and `count` are ignored.
#[derive(Debug, Deserialize)]
struct FeedPayload {
    fields: Vec<String>,
    #[serde(default)]
    data: Vec<Vec<Option<String>>>,
}

#[derive(Debug, Clone, Copy)]
struct Columns {
    date: usize,
    energy: Option<usize>,
    impact_energy: Option<usize>,
    latitude: Option<usize>,
    latitude_dir: Option<usize>,
    longitude: Option<usize>,
    longitude_dir: Option<usize>,
    altitude: Option<usize>,
    velocity: Option<usize>,
}

impl Columns {
    fn resolve(fields: &[String]) -> Result<Self, DecodeError> {
        let find = |name: &str| fields.iter().position(|field| field == name);
        Ok(Self {
            date: find(DATE_COLUMN).ok_or(DecodeError::MissingColumn(DATE_COLUMN))?,
            energy: find("energy"),
            impact_energy: find("impact-e"),
            latitude: find("lat"),
            latitude_dir: find("lat-dir"),
            longitude: find("lon"),
            longitude_dir: find("lon-dir"),
            altitude: find("alt"),
            velocity: find("vel"),
        })
    }
}

/// Decodes a feed body into normalized records.
pub fn decode_payload(body: &[u8]) -> Result<DecodedPayload, DecodeError> {
    let payload: FeedPayload = serde_json::from_slice(body)?;
    let columns = Columns::resolve(&payload.fields)?;

    let mut decoded = DecodedPayload::default();
    for row in &payload.data {
        match decode_row(&columns, row) {
            Some(record) => decoded.records.push(record),
            None => decoded.dropped_rows += 1,
        }
    }
    if decoded.dropped_rows > 0 {
        warn!(
            "event=feed_decode module=sync status=partial dropped_rows={} kept_rows={}",
            decoded.dropped_rows,
            decoded.records.len()
        );
    }
    Ok(decoded)
}

fn decode_row(columns: &Columns, row: &[Option<String>]) -> Option<FireballData> {
    let date = cell(row, Some(columns.date))?;
    let timestamp = Utc.from_utc_datetime(&NaiveDateTime::parse_from_str(date, DATE_FORMAT).ok()?);

    let mut latitude = number(row, columns.latitude);
    if cell(row, columns.latitude_dir) == Some(SOUTH) {
        latitude = -latitude;
    }
    let mut longitude = number(row, columns.longitude);
    if cell(row, columns.longitude_dir) == Some(WEST) {
        longitude = -longitude;
    }

    let record = FireballData {
        timestamp,
        latitude,
        longitude,
        altitude: number(row, columns.altitude),
        velocity: number(row, columns.velocity),
        radiated_energy: number(row, columns.energy),
        impact_energy: number(row, columns.impact_energy),
    };
    record.validate().ok()?;
    Some(record)
}

fn cell(row: &[Option<String>], index: Option<usize>) -> Option<&str> {
    row.get(index?)?.as_deref()
}

fn number(row: &[Option<String>], index: Option<usize>) -> f64 {
    cell(row, index)
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(0.0)
}
