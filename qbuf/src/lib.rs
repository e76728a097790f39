//! qbuf: per-query result buffering.
//!
//! A qbuf absorbs result chunks streamed back from many shards for one `SELECT` with an
//! `ORDER BY` and/or `LIMIT`/`OFFSET`, merges them into global `ORDER BY` order, spills to an
//! embedded ordered KV store once an in-memory budget is exceeded, and serves paged reads from
//! the merged result until it idles out or a producer abandons it.
//!
//! The entry point is [`spawn_manager`], which starts the manager actor and hands back a
//! [`QBufManagerHandle`] - every other operation in this crate is a method on that handle.

#![warn(missing_debug_implementations, clippy::clone_on_ref_ptr)]

mod config;
mod entity;
mod error;
mod expiry;
mod key_codec;
mod kv_backend;
mod lifecycle;
mod manager;
mod value;

pub use config::ManagerConfig;
pub use error::Error;
pub use key_codec::QBufRef;
pub use manager::{spawn_manager, FetchResult, GetOrCreateOutcome, QBufManagerHandle};
pub use value::{
    ColumnType, ColumnValue, DdlField, Direction, NullsOrder, OrderByColumn, Row, SelectColumn,
};
