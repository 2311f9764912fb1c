//! Routing, role lookup and fan-out against on-disk plaintext shard fixtures.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use chatlog_core::{CancellationToken, Role};
use chatlog_store_sqlite::{
    table_name_for, ConnectionCache, MessageQuery, SchemaGeneration, StoreError, TimeRange,
    TimelineRouter,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{params, Connection};
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0)
        .single()
        .unwrap_or_else(|| panic!("valid timestamp {y}-{m}-{d}T{h}"))
}

type Row<'a> = (&'a str, i64, DateTime<Utc>, &'a str);

fn open(path: &Path) -> Connection {
    Connection::open(path).unwrap_or_else(|err| panic!("open {}: {err}", path.display()))
}

fn current_shard(path: &Path, start: DateTime<Utc>, messages: &[Row<'_>]) {
    let conn = open(path);
    conn.execute_batch("CREATE TABLE Timestamp (timestamp INTEGER);")
        .unwrap_or_else(|err| panic!("create Timestamp: {err}"));
    conn.execute("INSERT INTO Timestamp VALUES (?1)", [start.timestamp()])
        .unwrap_or_else(|err| panic!("insert Timestamp: {err}"));
    for (talker, seq, time, content) in messages {
        let table = table_name_for(talker);
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (local_id INTEGER PRIMARY KEY, server_id INTEGER,
             local_type INTEGER, sort_seq INTEGER, real_sender_id INTEGER, create_time INTEGER,
             status INTEGER, message_content TEXT);"
        ))
        .unwrap_or_else(|err| panic!("create {table}: {err}"));
        conn.execute(
            &format!(
                "INSERT INTO {table} (server_id, local_type, sort_seq, real_sender_id, create_time,
                 status, message_content) VALUES (?1, 1, ?1, 1, ?2, 2, ?3)"
            ),
            params![seq, time.timestamp(), content],
        )
        .unwrap_or_else(|err| panic!("insert into {table}: {err}"));
    }
}

fn legacy_shard(path: &Path, start: DateTime<Utc>, talkers: &[&str]) {
    let conn = open(path);
    conn.execute_batch(
        "CREATE TABLE DBInfo (tableIndex INTEGER, tableVersion INTEGER, tableDesc TEXT,
             tableValue TEXT);
         CREATE TABLE Name2ID (UsrName TEXT);
         CREATE TABLE MSG (localId INTEGER PRIMARY KEY, TalkerId INTEGER, MsgSvrID INTEGER,
             Type INTEGER, SubType INTEGER, IsSender INTEGER, CreateTime INTEGER,
             Sequence INTEGER, StrTalker TEXT, StrContent TEXT);",
    )
    .unwrap_or_else(|err| panic!("create legacy schema: {err}"));
    conn.execute(
        "INSERT INTO DBInfo VALUES (0, 1, 'Start Time', ?1)",
        [start.timestamp_millis().to_string()],
    )
    .unwrap_or_else(|err| panic!("insert DBInfo: {err}"));
    for talker in talkers {
        conn.execute("INSERT INTO Name2ID (UsrName) VALUES (?1)", [talker])
            .unwrap_or_else(|err| panic!("insert Name2ID: {err}"));
    }
}

struct Layout {
    dir: TempDir,
}

impl Layout {
    fn new() -> Self {
        Self { dir: TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}")) }
    }

    fn base(&self) -> &Path {
        self.dir.path()
    }

    fn subdir(&self, name: &str) -> PathBuf {
        let dir = self.base().join(name);
        fs::create_dir_all(&dir).unwrap_or_else(|err| panic!("mkdir {name}: {err}"));
        dir
    }

    fn router(&self) -> TimelineRouter {
        TimelineRouter::new(self.base(), Arc::new(ConnectionCache::new()))
            .unwrap_or_else(|err| panic!("router: {err}"))
    }
}

#[test]
fn two_shard_scenario_routes_by_start_time() -> TestResult {
    let layout = Layout::new();
    let message = layout.subdir("message");
    // Filename order deliberately disagrees with time order.
    current_shard(&message.join("message_0.db"), utc(2023, 2, 1, 0), &[]);
    current_shard(&message.join("message_1.db"), utc(2023, 1, 1, 0), &[]);

    let router = layout.router();
    let report = router.rebuild_index(&CancellationToken::new())?;
    assert_eq!(report.loaded, 2);
    assert!(report.skipped.is_empty());

    let both = router.resolve(TimeRange::new(utc(2023, 1, 1, 0), utc(2023, 2, 1, 1)), "alice");
    assert_eq!(both.len(), 2);
    assert_eq!(both[0].path, message.join("message_1.db"));
    assert!(both.iter().all(|t| t.talker == "alice" && t.talker_id.is_none()));

    let january = router.resolve(TimeRange::new(utc(2023, 1, 1, 0), utc(2023, 1, 1, 1)), "alice");
    assert_eq!(january.len(), 1);
    assert_eq!(january[0].path, message.join("message_1.db"));

    let february = router.resolve(TimeRange::new(utc(2023, 2, 1, 0), utc(2023, 2, 1, 1)), "alice");
    assert_eq!(february.len(), 1);
    assert_eq!(february[0].path, message.join("message_0.db"));
    Ok(())
}

#[test]
fn placeholder_and_foreign_files_are_dropped() -> TestResult {
    let layout = Layout::new();
    let message = layout.subdir("message");
    current_shard(&message.join("message_0.db"), utc(2023, 1, 1, 0), &[]);
    fs::write(message.join("message_1.db"), b"")?;
    fs::write(message.join("message_2.db"), vec![0x42; 4096])?;
    fs::write(message.join("message_fts.db"), b"not a shard")?;
    let foreign = message.join("message_3.db");
    Connection::open(&foreign)?.execute_batch("CREATE TABLE contact (username TEXT);")?;

    let router = layout.router();
    let report = router.rebuild_index(&CancellationToken::new())?;

    assert_eq!(report.loaded, 1);
    let skipped: Vec<_> = report.skipped.iter().map(|s| s.path.clone()).collect();
    assert_eq!(
        skipped,
        [message.join("message_1.db"), message.join("message_2.db"), foreign.clone()]
    );
    assert_eq!(router.snapshot().len(), 1);
    Ok(())
}

#[test]
fn skipped_shards_release_their_handles() -> TestResult {
    let layout = Layout::new();
    let message = layout.subdir("message");
    let shard = message.join("message_0.db");
    current_shard(&shard, utc(2023, 1, 1, 0), &[]);
    let foreign = message.join("message_1.db");
    Connection::open(&foreign)?.execute_batch("CREATE TABLE contact (username TEXT);")?;

    let router = layout.router();
    let report = router.rebuild_index(&CancellationToken::new())?;

    assert_eq!(report.skipped.len(), 1);
    assert!(report.skipped[0].reason.contains("schema"), "{}", report.skipped[0].reason);
    assert!(router.cache().contains(&shard));
    assert!(!router.cache().contains(&foreign));
    assert_eq!(router.cache().len(), 1);
    Ok(())
}

#[test]
fn flat_legacy_layout_attaches_talker_ids() -> TestResult {
    let layout = Layout::new();
    legacy_shard(&layout.base().join("MSG0.db"), utc(2022, 6, 1, 0), &["bob", "alice"]);
    legacy_shard(&layout.base().join("MSG1.db"), utc(2022, 9, 1, 0), &["alice"]);
    // Present but empty role subdirectory still falls back to the flat scan.
    layout.subdir("message");

    let router = layout.router();
    router.rebuild_index(&CancellationToken::new())?;

    let index = router.snapshot();
    assert_eq!(index.len(), 2);
    assert!(index.shards().iter().all(|s| s.generation == SchemaGeneration::Legacy));
    assert_eq!(index.shards()[0].shard_index, Some(0));

    let targets = router.resolve(TimeRange::new(utc(2022, 1, 1, 0), utc(2023, 1, 1, 0)), "alice");
    let ids: Vec<_> = targets.iter().map(|t| t.talker_id).collect();
    assert_eq!(ids, [Some(2), Some(1)]);

    let carol = router.resolve(TimeRange::new(utc(2022, 1, 1, 0), utc(2023, 1, 1, 0)), "carol");
    assert!(carol.iter().all(|t| t.talker_id.is_none()));
    Ok(())
}

#[test]
fn missing_base_dir_keeps_the_old_index() -> TestResult {
    let layout = Layout::new();
    let router = TimelineRouter::new(layout.base().join("gone"), Arc::new(ConnectionCache::new()))?;
    assert!(matches!(router.rebuild_index(&CancellationToken::new()), Err(StoreError::Io { .. })));
    assert!(router.snapshot().is_empty());
    Ok(())
}

#[test]
fn cancelled_rebuild_leaves_index_untouched() -> TestResult {
    let layout = Layout::new();
    let message = layout.subdir("message");
    current_shard(&message.join("message_0.db"), utc(2023, 1, 1, 0), &[]);

    let router = layout.router();
    router.rebuild_index(&CancellationToken::new())?;
    let before = router.snapshot();

    current_shard(&message.join("message_1.db"), utc(2023, 2, 1, 0), &[]);
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(router.rebuild_index(&cancel), Err(StoreError::Cancelled)));
    assert!(Arc::ptr_eq(&before, &router.snapshot()));
    Ok(())
}

#[test]
fn role_lookup_searches_subdir_then_base() -> TestResult {
    let layout = Layout::new();
    current_shard(&layout.base().join("contact.db"), utc(2023, 1, 1, 0), &[]);
    let router = layout.router();

    assert_eq!(router.find_one_by_role(Role::Contact), Some(layout.base().join("contact.db")));
    assert_eq!(router.find_one_by_role(Role::Session), None);
    assert!(router.find_all_by_role(Role::Voice).is_empty());

    let hardlink = layout.subdir("hardlink");
    fs::write(hardlink.join("hardlink.db"), b"")?;
    let media = layout.subdir("message");
    fs::write(media.join("media_0.db"), b"")?;
    fs::write(media.join("media_1.db"), b"")?;

    assert_eq!(router.find_one_by_role(Role::Video), Some(hardlink.join("hardlink.db")));
    assert_eq!(
        router.find_all_by_role(Role::Voice),
        [media.join("media_0.db"), media.join("media_1.db")]
    );
    Ok(())
}

#[test]
fn fan_out_merges_shards_and_reports_skips() -> TestResult {
    let layout = Layout::new();
    let message = layout.subdir("message");
    let jan = utc(2023, 1, 1, 0);
    let feb = utc(2023, 2, 1, 0);
    current_shard(
        &message.join("message_0.db"),
        jan,
        &[
            ("alice", 2, jan + Duration::hours(2), "jan-2"),
            ("alice", 1, jan + Duration::hours(1), "jan-1"),
        ],
    );
    current_shard(
        &message.join("message_1.db"),
        feb,
        &[
            ("alice", 1, feb + Duration::hours(1), "feb-1"),
            ("bob", 1, feb + Duration::hours(1), "bob"),
        ],
    );

    let router = layout.router();
    router.rebuild_index(&CancellationToken::new())?;

    let range = TimeRange::new(jan, feb + Duration::days(1));
    let all = router.query_messages(&MessageQuery::new("alice", range));
    assert!(all.is_complete());
    let contents: Vec<_> = all.data.iter().filter_map(|m| m.content.as_deref()).collect();
    assert_eq!(contents, ["jan-1", "jan-2", "feb-1"]);
    assert_eq!(all.data[2].shard, message.join("message_1.db"));

    let page =
        router.query_messages(&MessageQuery::new("alice", range).with_offset(1).with_limit(1));
    let contents: Vec<_> = page.data.iter().filter_map(|m| m.content.as_deref()).collect();
    assert_eq!(contents, ["jan-2"]);

    // Corrupt the second shard behind the cache's back.
    router.cache().close_all()?;
    fs::write(message.join("message_1.db"), vec![0x42; 4096])?;
    let partial = router.query_messages(&MessageQuery::new("alice", range));
    assert_eq!(partial.data.len(), 2);
    assert_eq!(partial.skipped.len(), 1);
    assert_eq!(partial.skipped[0].path, message.join("message_1.db"));
    Ok(())
}

#[test]
fn no_overlap_is_an_empty_result() -> TestResult {
    let layout = Layout::new();
    current_shard(&layout.subdir("message").join("message_0.db"), utc(2023, 1, 1, 0), &[]);
    let router = layout.router();
    router.rebuild_index(&CancellationToken::new())?;

    let before = TimeRange::new(utc(2022, 1, 1, 0), utc(2022, 6, 1, 0));
    assert!(router.resolve(before, "alice").is_empty());
    let fan_out = router.query_messages(&MessageQuery::new("alice", before));
    assert!(fan_out.data.is_empty() && fan_out.is_complete());
    Ok(())
}

#[test]
fn concurrent_readers_never_see_a_partial_index() -> TestResult {
    let layout = Layout::new();
    let message = layout.subdir("message");
    current_shard(&message.join("message_0.db"), utc(2023, 1, 1, 0), &[]);
    current_shard(&message.join("message_1.db"), utc(2023, 2, 1, 0), &[]);
    let parked = layout.base().join("parked.db");
    current_shard(&parked, utc(2023, 3, 1, 0), &[]);

    let router = Arc::new(layout.router());
    router.rebuild_index(&CancellationToken::new())?;
    let everything = TimeRange::new(utc(2020, 1, 1, 0), Utc::now() + Duration::days(1));

    thread::scope(|scope| {
        let writer_router = router.clone();
        let third = message.join("message_2.db");
        scope.spawn(move || {
            for round in 0..40 {
                let (from, to) = if round % 2 == 0 { (&parked, &third) } else { (&third, &parked) };
                fs::rename(from, to).unwrap_or_else(|err| panic!("rename: {err}"));
                writer_router
                    .rebuild_index(&CancellationToken::new())
                    .unwrap_or_else(|err| panic!("rebuild: {err}"));
            }
        });

        for _ in 0..4 {
            let router = router.clone();
            scope.spawn(move || {
                for _ in 0..200 {
                    let index = router.snapshot();
                    assert!(matches!(index.len(), 2 | 3), "partial index of {}", index.len());
                    for pair in index.shards().windows(2) {
                        assert_eq!(pair[0].end_time, Some(pair[1].start_time));
                    }
                    assert_eq!(index.shards().last().and_then(|s| s.end_time), None);

                    let targets = router.resolve(everything, "alice");
                    assert!(matches!(targets.len(), 2 | 3), "resolved {}", targets.len());
                }
            });
        }
    });
    Ok(())
}
