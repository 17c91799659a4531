//! Events carried by the framed stream and their resolution into request
//! records.
//!
//! An event is a flat field map. The client address, timestamp, endpoint
//! and user agent come from explicit fields when present; otherwise they
//! are derived by parsing the raw log line (`message`/`line` field) with
//! the configured log format.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

use cidrwarden::addr::{parse_addr, AddrError};
use cidrwarden::logfmt::{HttpRecord, LogFmtError, LogFormat};

const IP_KEYS: &[&str] = &["ip", "client", "client_ip"];
const TS_KEYS: &[&str] = &["timestamp", "@timestamp", "ts"];
const URI_KEYS: &[&str] = &["uri", "url", "path"];
const UA_KEYS: &[&str] = &["user_agent", "agent", "ua"];
const LINE_KEYS: &[&str] = &["message", "line"];

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("event has no usable client address")]
    NoAddress,
    #[error("{0}")]
    BadAddress(#[from] AddrError),
    #[error("event has no usable timestamp")]
    NoTimestamp,
    #[error("unparsable timestamp {0:?}")]
    BadTimestamp(String),
    #[error("{0}")]
    BadLine(#[from] LogFmtError),
}

impl ResolveError {
    /// Stable short label for reject aggregation in reports.
    pub fn kind_label(&self) -> &'static str {
        match self {
            ResolveError::NoAddress | ResolveError::BadAddress(_) => "invalid client address",
            ResolveError::NoTimestamp | ResolveError::BadTimestamp(_) => "unparsable timestamp",
            ResolveError::BadLine(err) => err.kind_label(),
        }
    }
}

/// One raw event from the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub seq: u32,
    pub fields: HashMap<String, String>,
}

/// A fully resolved request, ready for filtering and the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRequest {
    pub addr: u32,
    pub ts: DateTime<Utc>,
    pub endpoint: String,
    pub user_agent: String,
}

impl LogEvent {
    pub fn from_pairs(seq: u32, pairs: Vec<(String, String)>) -> Self {
        Self {
            seq,
            fields: pairs.into_iter().collect(),
        }
    }

    /// Flatten the top level of a JSON object into string fields. Nested
    /// values are ignored; events are expected to be flat.
    pub fn from_json(seq: u32, value: serde_json::Value) -> Self {
        let mut fields = HashMap::new();
        if let serde_json::Value::Object(map) = value {
            for (key, value) in map {
                let text = match value {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Number(n) => n.to_string(),
                    serde_json::Value::Bool(b) => b.to_string(),
                    _ => continue,
                };
                fields.insert(key, text);
            }
        }
        Self { seq, fields }
    }

    fn first_of(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .find_map(|k| self.fields.get(*k).map(String::as_str))
    }

    /// Resolve the address, timestamp, endpoint and user agent, falling
    /// back to the parsed log line for anything not carried explicitly.
    pub fn resolve(&self, format: Option<&LogFormat>) -> Result<ResolvedRequest, ResolveError> {
        let mut line_record: Option<HttpRecord> = None;
        if self.first_of(IP_KEYS).is_none() || self.first_of(TS_KEYS).is_none() {
            if let (Some(format), Some(line)) = (format, self.first_of(LINE_KEYS)) {
                line_record = Some(format.parse_line(line)?);
            }
        }

        let ip = match self.first_of(IP_KEYS) {
            Some(ip) => ip,
            None => line_record
                .as_ref()
                .map(|r| r.ip.as_str())
                .filter(|ip| !ip.is_empty())
                .ok_or(ResolveError::NoAddress)?,
        };
        let addr = parse_addr(ip)?;

        let ts = match self.first_of(TS_KEYS) {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map_err(|_| ResolveError::BadTimestamp(raw.to_string()))?
                .with_timezone(&Utc),
            None => line_record
                .as_ref()
                .and_then(|r| r.ts)
                .ok_or(ResolveError::NoTimestamp)?,
        };

        let endpoint = self
            .first_of(URI_KEYS)
            .map(str::to_string)
            .or_else(|| line_record.as_ref().map(|r| r.endpoint().to_string()))
            .unwrap_or_default();
        let user_agent = self
            .first_of(UA_KEYS)
            .map(str::to_string)
            .or_else(|| line_record.as_ref().map(|r| r.agent().to_string()))
            .unwrap_or_default();

        Ok(ResolvedRequest {
            addr,
            ts,
            endpoint,
            user_agent,
        })
    }
}
