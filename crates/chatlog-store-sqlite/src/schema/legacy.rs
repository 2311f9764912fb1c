use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, Row};

use super::{
    table_exists, timestamp_from_secs, IdentityMap, SchemaGeneration, ShardSchema, TalkerRef,
};
use crate::error::SchemaError;
use crate::message::{Message, TimeRange};

pub(super) const DBINFO_TABLE: &str = "DBInfo";
const NAME2ID_TABLE: &str = "Name2ID";

const COLUMNS: &str =
    "Sequence, CreateTime, StrTalker, Type, SubType, MsgSvrID, IsSender, StrContent";

pub(super) struct LegacySchema;

impl ShardSchema for LegacySchema {
    fn generation(&self) -> SchemaGeneration {
        SchemaGeneration::Legacy
    }

    fn read_start_time(&self, conn: &Connection) -> Result<DateTime<Utc>, SchemaError> {
        let mut stmt = conn.prepare("SELECT tableDesc, tableValue FROM DBInfo")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let desc: Option<String> = row.get(0)?;
            if desc.is_some_and(|desc| desc.contains("Start Time")) {
                let millis = millis_value(row.get_ref(1)?)?;
                return DateTime::from_timestamp_millis(millis)
                    .ok_or_else(|| SchemaError::InvalidTimestamp(millis.to_string()));
            }
        }
        Err(SchemaError::MissingStartTime)
    }

    fn read_identity_map(&self, conn: &Connection) -> Result<Option<IdentityMap>, SchemaError> {
        if !table_exists(conn, NAME2ID_TABLE)? {
            return Ok(None);
        }
        let mut stmt =
            conn.prepare("SELECT rowid, UsrName FROM Name2ID WHERE UsrName IS NOT NULL")?;
        let ids = stmt
            .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, i64>(0)?)))?
            .collect::<rusqlite::Result<IdentityMap>>()?;
        Ok(Some(ids))
    }

    fn query_messages(
        &self,
        conn: &Connection,
        talker: TalkerRef<'_>,
        range: TimeRange,
    ) -> Result<Vec<Message>, SchemaError> {
        let bounds = (range.start.timestamp(), range.end.timestamp());
        let mut messages = Vec::new();

        let raw = match talker.id {
            Some(id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM MSG
                     WHERE TalkerId = ?1 AND CreateTime >= ?2 AND CreateTime < ?3
                     ORDER BY Sequence"
                ))?;
                let rows = stmt.query_map(params![id, bounds.0, bounds.1], raw_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM MSG
                     WHERE StrTalker = ?1 AND CreateTime >= ?2 AND CreateTime < ?3
                     ORDER BY Sequence"
                ))?;
                let rows = stmt.query_map(params![talker.name, bounds.0, bounds.1], raw_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };

        for row in raw {
            messages.push(Message {
                sequence: row.sequence,
                time: timestamp_from_secs(row.create_time)?,
                talker: row.talker.unwrap_or_else(|| talker.name.to_owned()),
                kind: row.kind,
                sub_kind: row.sub_kind,
                server_id: row.server_id,
                is_sender: Some(row.is_sender != 0),
                sender_id: None,
                content: row.content,
                shard: PathBuf::new(),
            });
        }
        Ok(messages)
    }
}

struct RawRow {
    sequence: i64,
    create_time: i64,
    talker: Option<String>,
    kind: i64,
    sub_kind: i64,
    server_id: i64,
    is_sender: i64,
    content: Option<String>,
}

fn raw_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        sequence: row.get(0)?,
        create_time: row.get(1)?,
        talker: row.get(2)?,
        kind: row.get(3)?,
        sub_kind: row.get::<_, Option<i64>>(4)?.unwrap_or_default(),
        server_id: row.get::<_, Option<i64>>(5)?.unwrap_or_default(),
        is_sender: row.get::<_, Option<i64>>(6)?.unwrap_or_default(),
        content: row.get(7)?,
    })
}

/// `tableValue` is untyped; older clients store the milliseconds as text.
fn millis_value(value: ValueRef<'_>) -> Result<i64, SchemaError> {
    match value {
        ValueRef::Integer(millis) => Ok(millis),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            text.trim().parse().map_err(|_| SchemaError::InvalidTimestamp(text.into_owned()))
        }
        other => Err(SchemaError::InvalidTimestamp(format!("{:?}", other.data_type()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn legacy_shard(start_value: &str) -> rusqlite::Result<Connection> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE DBInfo (tableIndex INTEGER, tableVersion INTEGER, tableDesc TEXT,
                 tableValue TEXT);
             INSERT INTO DBInfo VALUES (1, 1, 'Version', '3');
             CREATE TABLE Name2ID (UsrName TEXT);
             INSERT INTO Name2ID (UsrName) VALUES ('alice'), ('bob');
             CREATE TABLE MSG (localId INTEGER PRIMARY KEY, TalkerId INTEGER, MsgSvrID INTEGER,
                 Type INTEGER, SubType INTEGER, IsSender INTEGER, CreateTime INTEGER,
                 Sequence INTEGER, StrTalker TEXT, StrContent TEXT);
             INSERT INTO MSG (TalkerId, MsgSvrID, Type, SubType, IsSender, CreateTime, Sequence,
                 StrTalker, StrContent)
             VALUES (1, 11, 1, 0, 1, 1100, 2000, 'alice', 'later'),
                    (1, 10, 1, 0, 0, 1050, 1000, 'alice', 'earlier'),
                    (2, 12, 3, 0, 0, 1060, 1500, 'bob', 'photo');",
        )?;
        conn.execute("INSERT INTO DBInfo VALUES (2, 1, 'Start Time', ?1)", [start_value])?;
        Ok(conn)
    }

    #[test]
    fn start_time_is_milliseconds() -> TestResult {
        let conn = legacy_shard("1672531200000")?;
        let start = LegacySchema.read_start_time(&conn)?;
        assert_eq!(start.timestamp(), 1_672_531_200);
        Ok(())
    }

    #[test]
    fn garbage_start_time_is_invalid() -> TestResult {
        let conn = legacy_shard("soon")?;
        assert!(matches!(
            LegacySchema.read_start_time(&conn),
            Err(SchemaError::InvalidTimestamp(_))
        ));
        Ok(())
    }

    #[test]
    fn missing_start_row_is_reported() -> TestResult {
        let conn = legacy_shard("0")?;
        conn.execute("DELETE FROM DBInfo WHERE tableDesc = 'Start Time'", [])?;
        assert!(matches!(LegacySchema.read_start_time(&conn), Err(SchemaError::MissingStartTime)));
        Ok(())
    }

    #[test]
    fn identity_map_uses_rowids() -> TestResult {
        let conn = legacy_shard("0")?;
        let ids = LegacySchema.read_identity_map(&conn)?.unwrap_or_default();
        assert_eq!(ids.get("alice"), Some(&1));
        assert_eq!(ids.get("bob"), Some(&2));
        Ok(())
    }

    #[test]
    fn numeric_and_string_lookups_agree() -> TestResult {
        let conn = legacy_shard("0")?;
        let range = TimeRange::new(timestamp_from_secs(1_000)?, timestamp_from_secs(2_000)?);

        let by_id =
            LegacySchema.query_messages(&conn, TalkerRef { name: "alice", id: Some(1) }, range)?;
        let by_name =
            LegacySchema.query_messages(&conn, TalkerRef { name: "alice", id: None }, range)?;

        assert_eq!(by_id, by_name);
        let contents: Vec<_> = by_id.iter().filter_map(|m| m.content.as_deref()).collect();
        assert_eq!(contents, ["earlier", "later"]);
        assert_eq!(by_id[1].is_sender, Some(true));
        Ok(())
    }
}
