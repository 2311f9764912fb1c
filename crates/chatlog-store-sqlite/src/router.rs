//! Time-sharded routing over a directory of plaintext message databases.
//!
//! The shard index is an immutable snapshot behind a reader/writer lock. A rebuild assembles a
//! complete new index off to the side and swaps the pointer, so readers only ever see a whole
//! index.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chatlog_core::{CancellationToken, Role};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::cache::ConnectionCache;
use crate::error::{StoreError, StoreResult};
use crate::message::{Message, MessageQuery, TimeRange};
use crate::naming::NamingStrategy;
use crate::schema::{IdentityMap, SchemaGeneration, TalkerRef};

#[derive(Debug, Clone, Serialize)]
pub struct Shard {
    pub path: PathBuf,
    pub shard_index: Option<u32>,
    pub generation: SchemaGeneration,
    pub start_time: DateTime<Utc>,
    /// Start of the next shard. `None` for the newest shard, which stays open-ended.
    pub end_time: Option<DateTime<Utc>>,
    /// Read once at index time and not refreshed until the next rebuild.
    #[serde(skip)]
    pub identity_map: Option<Arc<IdentityMap>>,
}

impl Shard {
    #[must_use]
    pub fn end_or(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.end_time.unwrap_or(now)
    }

    #[must_use]
    pub fn talker_id(&self, talker: &str) -> Option<i64> {
        self.identity_map.as_ref()?.get(talker).copied()
    }
}

/// Shards sorted ascending by start time with chained end times.
#[derive(Debug, Clone, Serialize)]
pub struct ShardIndex {
    shards: Vec<Shard>,
    built_at: DateTime<Utc>,
}

impl ShardIndex {
    #[must_use]
    pub fn empty() -> Self {
        Self { shards: Vec::new(), built_at: DateTime::default() }
    }

    /// Sort by start time and derive each end time from the successor's start. Incoming
    /// `end_time` values are ignored.
    #[must_use]
    pub fn build(mut shards: Vec<Shard>, built_at: DateTime<Utc>) -> Self {
        shards.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.path.cmp(&b.path)));
        let next_starts: Vec<_> = shards.iter().skip(1).map(|s| Some(s.start_time)).collect();
        for (shard, end) in shards.iter_mut().zip(next_starts.into_iter().chain([None])) {
            shard.end_time = end;
        }
        Self { shards, built_at }
    }

    #[must_use]
    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    #[must_use]
    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Every shard whose `[start, end)` overlaps `range`, oldest first. The open-ended shard
    /// ends at `now`.
    #[must_use]
    pub fn resolve(&self, range: TimeRange, talker: &str, now: DateTime<Utc>) -> Vec<RouteTarget> {
        if range.is_empty() {
            return Vec::new();
        }
        self.shards
            .iter()
            .filter(|shard| range.overlaps(shard.start_time, shard.end_or(now)))
            .map(|shard| RouteTarget {
                path: shard.path.clone(),
                talker: talker.to_owned(),
                talker_id: shard.talker_id(talker),
                generation: shard.generation,
            })
            .collect()
    }
}

impl Default for ShardIndex {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteTarget {
    pub path: PathBuf,
    pub talker: String,
    /// Set only when the shard has a legacy identity table containing the talker.
    pub talker_id: Option<i64>,
    pub generation: SchemaGeneration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedShard {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RebuildReport {
    pub loaded: usize,
    pub skipped: Vec<SkippedShard>,
}

/// Best-effort result across shards: whatever was found plus every shard that was passed over.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FanOut<T> {
    pub data: T,
    pub skipped: Vec<SkippedShard>,
}

impl<T> FanOut<T> {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

pub struct TimelineRouter {
    base_dir: PathBuf,
    naming: NamingStrategy,
    cache: Arc<ConnectionCache>,
    index: RwLock<Arc<ShardIndex>>,
}

impl std::fmt::Debug for TimelineRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineRouter")
            .field("base_dir", &self.base_dir)
            .field("shards", &self.snapshot().len())
            .finish_non_exhaustive()
    }
}

impl TimelineRouter {
    /// Router with the standard filename rules and an empty index.
    ///
    /// # Errors
    /// Propagates [`NamingStrategy::standard`] failures.
    pub fn new(base_dir: impl Into<PathBuf>, cache: Arc<ConnectionCache>) -> StoreResult<Self> {
        Ok(Self::with_naming(base_dir, NamingStrategy::standard()?, cache))
    }

    #[must_use]
    pub fn with_naming(
        base_dir: impl Into<PathBuf>,
        naming: NamingStrategy,
        cache: Arc<ConnectionCache>,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            naming,
            cache,
            index: RwLock::new(Arc::new(ShardIndex::empty())),
        }
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[must_use]
    pub fn naming(&self) -> &NamingStrategy {
        &self.naming
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<ConnectionCache> {
        &self.cache
    }

    /// The current index. Holding it never blocks a rebuild.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ShardIndex> {
        self.index.read().clone()
    }

    /// Rediscover message shards and replace the index wholesale.
    ///
    /// Shards that cannot be opened or carry unreadable metadata are dropped and listed in the
    /// report.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] when the base directory cannot be listed and
    /// [`StoreError::Cancelled`] when `cancel` fires. The previous index stays in place on error.
    pub fn rebuild_index(&self, cancel: &CancellationToken) -> StoreResult<RebuildReport> {
        let candidates = self.discover_message_files()?;
        let mut shards = Vec::with_capacity(candidates.len());
        let mut report = RebuildReport::default();

        for path in candidates {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            match self.load_shard(&path) {
                Ok(shard) => {
                    tracing::debug!(
                        "Loaded shard {} starting {}",
                        path.display(),
                        shard.start_time
                    );
                    shards.push(shard);
                }
                Err(err) => {
                    tracing::warn!("Dropping shard {}: {err}", path.display());
                    // Junk files should not keep a pooled handle.
                    if let Err(close_err) = self.cache.close(&path) {
                        tracing::debug!("Could not release {}: {close_err}", path.display());
                    }
                    report.skipped.push(SkippedShard { path, reason: err.to_string() });
                }
            }
        }

        report.loaded = shards.len();
        *self.index.write() = Arc::new(ShardIndex::build(shards, Utc::now()));
        tracing::info!(
            "Shard index rebuilt: {} shard(s), {} skipped",
            report.loaded,
            report.skipped.len()
        );
        Ok(report)
    }

    /// Route targets for `talker` over `range`. Never fails; no overlap is an empty result.
    #[must_use]
    pub fn resolve(&self, range: TimeRange, talker: &str) -> Vec<RouteTarget> {
        self.snapshot().resolve(range, talker, Utc::now())
    }

    /// First file serving `role`, searching the role subdirectory before the base directory.
    #[must_use]
    pub fn find_one_by_role(&self, role: Role) -> Option<PathBuf> {
        self.find_all_by_role(role).into_iter().next()
    }

    /// All files serving `role` in the first directory that has any.
    #[must_use]
    pub fn find_all_by_role(&self, role: Role) -> Vec<PathBuf> {
        [self.base_dir.join(role.subdir()), self.base_dir.clone()]
            .iter()
            .map(|dir| self.matching_files(dir, role).unwrap_or_default())
            .find(|found| !found.is_empty())
            .unwrap_or_default()
    }

    /// Messages for one conversation merged across every overlapping shard, ordered by
    /// `(time, sequence)`. Offset and limit apply to the merged list.
    #[must_use]
    pub fn query_messages(&self, query: &MessageQuery) -> FanOut<Vec<Message>> {
        let mut fan_out = FanOut::<Vec<Message>>::default();

        for target in self.resolve(query.range, &query.talker) {
            match self.query_target(&target, query.range) {
                Ok(mut messages) => fan_out.data.append(&mut messages),
                Err(err) => {
                    tracing::warn!("Skipping shard {}: {err}", target.path.display());
                    fan_out
                        .skipped
                        .push(SkippedShard { path: target.path, reason: err.to_string() });
                }
            }
        }

        fan_out.data.sort_by(|a, b| (a.time, a.sequence).cmp(&(b.time, b.sequence)));
        if query.offset > 0 || query.limit.is_some() {
            fan_out.data = std::mem::take(&mut fan_out.data)
                .into_iter()
                .skip(query.offset)
                .take(query.limit.unwrap_or(usize::MAX))
                .collect();
        }
        fan_out
    }

    fn query_target(&self, target: &RouteTarget, range: TimeRange) -> StoreResult<Vec<Message>> {
        let conn = self.cache.get(&target.path)?;
        let conn = conn.lock();
        let talker = TalkerRef { name: &target.talker, id: target.talker_id };
        let mut messages = target
            .generation
            .schema()
            .query_messages(&conn, talker, range)
            .map_err(|err| StoreError::shard(&target.path, err))?;
        for message in &mut messages {
            message.shard.clone_from(&target.path);
        }
        Ok(messages)
    }

    fn load_shard(&self, path: &Path) -> StoreResult<Shard> {
        let conn = self.cache.get(path)?;
        let conn = conn.lock();
        let generation =
            SchemaGeneration::detect(&conn).map_err(|err| StoreError::shard(path, err))?;
        let schema = generation.schema();
        let start_time =
            schema.read_start_time(&conn).map_err(|err| StoreError::shard(path, err))?;
        let identity_map =
            schema.read_identity_map(&conn).map_err(|err| StoreError::shard(path, err))?;

        Ok(Shard {
            path: path.to_path_buf(),
            shard_index: self.naming.classify_path(path).and_then(|class| class.shard_index),
            generation,
            start_time,
            end_time: None,
            identity_map: identity_map.map(Arc::new),
        })
    }

    /// Message files under `message/`, or in the base directory when that yields none.
    fn discover_message_files(&self) -> StoreResult<Vec<PathBuf>> {
        let subdir = self.base_dir.join(Role::Message.subdir());
        let nested = self.matching_files(&subdir, Role::Message).unwrap_or_default();
        if !nested.is_empty() {
            return Ok(nested);
        }
        self.matching_files(&self.base_dir, Role::Message)
            .map_err(|source| StoreError::Io { path: self.base_dir.clone(), source })
    }

    fn matching_files(&self, dir: &Path, role: Role) -> std::io::Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            if self.naming.serves(&path, role) {
                found.push(path);
            }
        }
        found.sort();
        Ok(found)
    }
}
