//! On-disk schema generations.
//!
//! Every shard is tagged with the generation detected from its tables. All generation-specific SQL
//! sits behind [`ShardSchema`].

mod current;
mod legacy;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use crate::error::SchemaError;
use crate::message::{Message, TimeRange};

pub use current::table_name_for;

/// Conversation identifier to small integer id, legacy generation only.
pub type IdentityMap = HashMap<String, i64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaGeneration {
    Legacy,
    Current,
}

impl SchemaGeneration {
    /// # Errors
    /// Returns [`SchemaError::Unknown`] when neither marker table exists.
    pub fn detect(conn: &Connection) -> Result<Self, SchemaError> {
        if table_exists(conn, current::TIMESTAMP_TABLE)? {
            Ok(Self::Current)
        } else if table_exists(conn, legacy::DBINFO_TABLE)? {
            Ok(Self::Legacy)
        } else {
            Err(SchemaError::Unknown)
        }
    }

    #[must_use]
    pub fn schema(self) -> &'static dyn ShardSchema {
        match self {
            Self::Legacy => &legacy::LegacySchema,
            Self::Current => &current::CurrentSchema,
        }
    }
}

/// Where one shard's messages for a conversation live.
#[derive(Debug, Clone, Copy)]
pub struct TalkerRef<'a> {
    pub name: &'a str,
    pub id: Option<i64>,
}

pub trait ShardSchema: Send + Sync {
    fn generation(&self) -> SchemaGeneration;

    /// # Errors
    /// Fails when the metadata table is missing, empty or holds an unparseable value.
    fn read_start_time(&self, conn: &Connection) -> Result<DateTime<Utc>, SchemaError>;

    /// `None` for generations that address conversations by string only.
    ///
    /// # Errors
    /// Fails when the identity table exists but cannot be read.
    fn read_identity_map(&self, conn: &Connection) -> Result<Option<IdentityMap>, SchemaError>;

    /// Messages for one conversation in `range`, ordered by sequence.
    ///
    /// # Errors
    /// Fails on SQL errors. A conversation with no table or rows is an empty result.
    fn query_messages(
        &self,
        conn: &Connection,
        talker: TalkerRef<'_>,
        range: TimeRange,
    ) -> Result<Vec<Message>, SchemaError>;
}

pub(crate) fn table_exists(conn: &Connection, name: &str) -> Result<bool, SchemaError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn timestamp_from_secs(secs: i64) -> Result<DateTime<Utc>, SchemaError> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| SchemaError::InvalidTimestamp(secs.to_string()))
}
