use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    #[must_use]
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Overlap with the half-open interval `[start, end)`.
    #[must_use]
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start < self.end && end > self.start
    }
}

/// One row from any shard, normalised across schema generations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub sequence: i64,
    pub time: DateTime<Utc>,
    pub talker: String,
    pub kind: i64,
    pub sub_kind: i64,
    pub server_id: i64,
    /// Legacy shards record direction directly; current shards only carry the sender id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_sender: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<i64>,
    pub content: Option<String>,
    pub shard: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    pub talker: String,
    pub range: TimeRange,
    /// Applied after merging across shards.
    pub offset: usize,
    pub limit: Option<usize>,
}

impl MessageQuery {
    #[must_use]
    pub fn new(talker: impl Into<String>, range: TimeRange) -> Self {
        Self { talker: talker.into(), range, offset: 0, limit: None }
    }

    #[must_use]
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
