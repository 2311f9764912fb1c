use std::path::PathBuf;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{
    table_exists, timestamp_from_secs, IdentityMap, SchemaGeneration, ShardSchema, TalkerRef,
};
use crate::error::SchemaError;
use crate::message::{Message, TimeRange};

pub(super) const TIMESTAMP_TABLE: &str = "Timestamp";

/// Per-conversation message table: `Msg_` followed by the lowercase hex MD5 of the identifier.
#[must_use]
pub fn table_name_for(talker: &str) -> String {
    format!("Msg_{}", hex::encode(Md5::digest(talker.as_bytes())))
}

pub(super) struct CurrentSchema;

impl ShardSchema for CurrentSchema {
    fn generation(&self) -> SchemaGeneration {
        SchemaGeneration::Current
    }

    fn read_start_time(&self, conn: &Connection) -> Result<DateTime<Utc>, SchemaError> {
        let secs: Option<i64> = conn
            .query_row("SELECT timestamp FROM Timestamp LIMIT 1", [], |row| row.get(0))
            .optional()?;
        timestamp_from_secs(secs.ok_or(SchemaError::MissingStartTime)?)
    }

    fn read_identity_map(&self, _conn: &Connection) -> Result<Option<IdentityMap>, SchemaError> {
        Ok(None)
    }

    fn query_messages(
        &self,
        conn: &Connection,
        talker: TalkerRef<'_>,
        range: TimeRange,
    ) -> Result<Vec<Message>, SchemaError> {
        let table = table_name_for(talker.name);
        if !table_exists(conn, &table)? {
            return Ok(Vec::new());
        }

        // The table name is a fixed prefix plus hex digits, never caller text.
        let sql = format!(
            "SELECT server_id, local_type, sort_seq, real_sender_id, create_time, message_content
             FROM {table}
             WHERE create_time >= ?1 AND create_time < ?2
             ORDER BY sort_seq"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![range.start.timestamp(), range.end.timestamp()], |row| {
            map_row(row, talker.name)
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (message, secs) = row?;
            messages.push(Message { time: timestamp_from_secs(secs)?, ..message });
        }
        Ok(messages)
    }
}

fn map_row(row: &Row<'_>, talker: &str) -> rusqlite::Result<(Message, i64)> {
    let local_type: i64 = row.get(1)?;
    let secs: i64 = row.get(4)?;
    let message = Message {
        sequence: row.get(2)?,
        time: DateTime::default(),
        talker: talker.to_owned(),
        // Low 32 bits carry the base type, the high bits the sub-type.
        kind: local_type & 0xFFFF_FFFF,
        sub_kind: local_type >> 32,
        server_id: row.get(0)?,
        is_sender: None,
        sender_id: row.get(3)?,
        content: text_content(row.get_ref(5)?),
        shard: PathBuf::new(),
    };
    Ok((message, secs))
}

/// Content is stored as TEXT or as a UTF-8 BLOB; anything else is not text.
fn text_content(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            std::str::from_utf8(bytes).ok().map(str::to_owned)
        }
        _ => None,
    }
}
