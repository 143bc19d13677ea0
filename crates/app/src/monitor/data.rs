use std::{
    fmt,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Caller-supplied session identifier, kept in whichever JSON form it arrived.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum SessionId {
    Numeric(i64),
    Text(String),
}

impl SessionId {
    pub(crate) fn is_blank(&self) -> bool {
        matches!(self, SessionId::Text(text) if text.trim().is_empty())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionId::Numeric(value) => write!(f, "{value}"),
            SessionId::Text(value) => f.write_str(value),
        }
    }
}

impl From<i64> for SessionId {
    fn from(value: i64) -> Self {
        SessionId::Numeric(value)
    }
}

#[cfg(test)]
impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        SessionId::Text(value.to_string())
    }
}

/// Encoded, annotated frame published by the pipeline.
#[derive(Clone)]
pub(crate) struct FramePacket {
    pub(crate) jpeg: Arc<[u8]>,
    pub(crate) timestamp_ms: i64,
    pub(crate) frame_number: u64,
    pub(crate) fps: f32,
}

pub(crate) type SharedFrame = Mutex<Option<FramePacket>>;

/// Point-in-time view of the monitor returned by status queries.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct StatusSnapshot {
    pub(crate) session_id: Option<SessionId>,
    pub(crate) running: bool,
    pub(crate) fall_detected: bool,
    pub(crate) fall_time: Option<DateTime<Utc>>,
    pub(crate) consecutive_candidates: u32,
    pub(crate) timestamp: DateTime<Utc>,
}

impl StatusSnapshot {
    pub(crate) fn idle() -> Self {
        Self {
            session_id: None,
            running: false,
            fall_detected: false,
            fall_time: None,
            consecutive_candidates: 0,
            timestamp: Utc::now(),
        }
    }
}

/// Seconds since the epoch with sub-second precision.
pub(crate) fn unix_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}
