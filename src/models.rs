use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ErrorInfo, FeatureError};

/// A typed scalar cell of a raw observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// One raw observation (a pitch, a play, a possession): column name → value.
///
/// `BTreeMap` keeps column order canonical, which the cache fingerprint
/// relies on.
pub type Record = BTreeMap<String, Value>;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view. Booleans count as 1/0 and numeric text is parsed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::Float(f) => Some(*f != 0.0),
            Value::Text(s) => match s.trim().to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Some(true),
                "false" | "f" | "no" | "n" | "0" => Some(false),
                _ => None,
            },
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Text used when the value identifies a group (player, team, lineup).
    pub fn key_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => s.clone(),
        }
    }

    /// Timestamp view: epoch seconds, RFC 3339, naive `YYYY-MM-DDTHH:MM:SS`
    /// (taken as UTC) or a bare date at midnight UTC.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Int(secs) => Utc.timestamp_opt(*secs, 0).single(),
            Value::Float(secs) if secs.is_finite() => {
                let whole = secs.floor();
                let nanos = ((secs - whole) * 1e9) as u32;
                Utc.timestamp_opt(whole as i64, nanos).single()
            }
            Value::Text(s) => {
                let s = s.trim();
                if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                    return Some(dt.with_timezone(&Utc));
                }
                for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
                    if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                        return Some(naive.and_utc());
                    }
                }
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|naive| naive.and_utc())
            }
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// A request to compute one feature over an ordered slice of observations.
///
/// Immutable once built: the builder methods consume and return `self`.
#[derive(Debug, Clone)]
pub struct FeatureRequest {
    feature_name: String,
    rows: Arc<Vec<Record>>,
    request_id: String,
    timeout: Option<Duration>,
    cache_ttl: Option<Duration>,
}

impl FeatureRequest {
    /// Build a request with a generated id. Timeout and cache TTL fall back
    /// to the feature's latency-class policy unless set explicitly.
    pub fn new(feature_name: impl Into<String>, rows: Vec<Record>) -> Self {
        Self::shared(feature_name, Arc::new(rows))
    }

    /// Like [`FeatureRequest::new`] but shares an existing row set, so one
    /// event can fan out to many features without copying its rows.
    pub fn shared(feature_name: impl Into<String>, rows: Arc<Vec<Record>>) -> Self {
        let feature_name = feature_name.into();
        let request_id = format!("{}-{:016x}", feature_name, rand::random::<u64>());
        FeatureRequest {
            feature_name,
            rows,
            request_id,
            timeout: None,
            cache_ttl: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn feature_name(&self) -> &str {
        &self.feature_name
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    pub(crate) fn shared_rows(&self) -> Arc<Vec<Record>> {
        Arc::clone(&self.rows)
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl
    }
}

/// The single response produced for a `FeatureRequest`.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureResponse {
    pub request_id: String,
    pub feature_name: String,
    /// Aligned 1:1 with the request rows on success, empty on failure.
    /// `None` marks a missing value, distinct from a clipped boundary.
    pub output_values: Vec<Option<f64>>,
    #[serde(rename = "computed_in_ms", serialize_with = "serialize_millis")]
    pub computed_in: Duration,
    pub cache_hit: bool,
    pub error: Option<ErrorInfo>,
}

impl FeatureResponse {
    pub fn success(
        request: &FeatureRequest,
        values: Vec<Option<f64>>,
        computed_in: Duration,
        cache_hit: bool,
    ) -> Self {
        FeatureResponse {
            request_id: request.request_id.clone(),
            feature_name: request.feature_name.clone(),
            output_values: values,
            computed_in,
            cache_hit,
            error: None,
        }
    }

    pub fn failure(request: &FeatureRequest, err: &FeatureError, computed_in: Duration) -> Self {
        FeatureResponse {
            request_id: request.request_id.clone(),
            feature_name: request.feature_name.clone(),
            output_values: Vec::new(),
            computed_in,
            cache_hit: false,
            error: Some(ErrorInfo::from(err)),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

/// Build a `Record` from `(column, value)` pairs.
pub fn record<I, K, V>(cells: I) -> Record
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    cells
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
