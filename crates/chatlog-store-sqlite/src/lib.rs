//! Storage access over a directory of decrypted chat databases.
//!
//! [`NamingStrategy`] classifies files into roles, [`ConnectionCache`] pools SQLite handles,
//! [`TimelineRouter`] maps time ranges onto message shards and [`ChangeWatcher`] keeps the router
//! current as new shards land on disk.

mod cache;
mod error;
mod message;
pub mod naming;
mod router;
pub mod schema;
mod watcher;

pub use cache::{ConnectionCache, SharedConnection};
pub use error::{CloseFailure, SchemaError, StoreError, StoreResult};
pub use message::{Message, MessageQuery, TimeRange};
pub use naming::{FileClass, NameRule, NamingStrategy};
pub use router::{
    FanOut, RebuildReport, RouteTarget, Shard, ShardIndex, SkippedShard, TimelineRouter,
};
pub use schema::{table_name_for, SchemaGeneration, ShardSchema};
pub use watcher::{ChangeWatcher, WatchEvent, WatcherError, DEBOUNCE_DURATION};
