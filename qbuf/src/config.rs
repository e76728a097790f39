//! Manager tunables.

use std::{path::PathBuf, time::Duration};

/// Tunables the manager is constructed with. There is no hot-reload; changing any of these
/// requires restarting the manager, except `max_query_data_size`, which also has a runtime
/// setter (`set_max_query_data_size`).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Directory the embedded KV store lives under. Wiped and recreated on every manager start.
    pub root_path: PathBuf,
    /// Per-query cap on total accepted bytes; enforced by callers against `size_bytes`, not by
    /// the manager itself (the manager only tracks aggregate `total_size`).
    pub max_query_data_size: u64,
    /// Aggregate `total_size` above which `get_or_create` refuses new qbufs.
    pub soft_watermark: u64,
    /// Aggregate `total_size` above which `batch_put` refuses new chunks.
    pub hard_watermark: u64,
    /// Per-qbuf in-memory staging budget before it spills to the backend.
    pub inmem_max: u64,
    /// Default serving-phase idle timeout, in milliseconds, unless overridden per qbuf.
    pub default_expire_ms: u64,
    /// Idle timeout, in milliseconds, for a qbuf stuck in `collecting_chunks`.
    pub incomplete_release_ms: u64,
    /// How often the lifecycle ticker sweeps. Defaults to roughly once a second; exposed here
    /// because the ticker runs as a real tokio task and needs an explicit interval.
    pub tick_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("/tmp/qbuf"),
            max_query_data_size: 512 * 1024 * 1024,
            soft_watermark: 2 * 1024 * 1024 * 1024,
            hard_watermark: 3 * 1024 * 1024 * 1024,
            inmem_max: 64 * 1024 * 1024,
            default_expire_ms: 5 * 60 * 1000,
            incomplete_release_ms: 60 * 1000,
            tick_interval: Duration::from_secs(1),
        }
    }
}
