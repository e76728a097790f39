//! A thin adapter over an embedded ordered KV store.
//!
//! The manager is the only caller; this module knows nothing about qbufs, sort keys or rows -
//! just byte keys and byte values, an ordered range scan, and a destroy. `sled` is used as the
//! underlying engine: it is a pure-Rust ordered store with exactly the range-scan contract the
//! manager needs.

use observability_deps::tracing::info;
use snafu::{ResultExt, Snafu};
use std::path::{Path, PathBuf};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to remove existing store at {}: {source}", path.display()))]
    WipeExisting {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to open store at {}: {source}", path.display()))]
    Open {
        path: PathBuf,
        source: sled::Error,
    },

    #[snafu(display("failed to destroy store at {}: {source}", path.display()))]
    Destroy {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to encode row for storage: {source}"))]
    Encode { source: bincode::Error },

    #[snafu(display("put failed: {source}"))]
    Put { source: sled::Error },

    #[snafu(display("scan failed: {source}"))]
    Scan { source: sled::Error },
}

/// A handle to the one backend store shared by every qbuf in the process. Isolation between
/// qbufs is entirely a property of the key prefixes callers use; this type enforces none of it.
#[derive(Debug, Clone)]
pub struct Handle {
    db: sled::Db,
}

/// Roughly 10MiB of write buffering; sled calls this its page cache, there's no separate
/// write-buffer knob.
const CACHE_CAPACITY_BYTES: u64 = 10 * 1024 * 1024;

impl Handle {
    /// Create a fresh store at `path`, removing anything already there first. The manager always
    /// wants a clean store on startup, so the adapter performs the wipe itself up front rather
    /// than erroring on a pre-existing path and asking the caller to retry.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_dir_all(path).context(WipeExistingSnafu { path })?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(WipeExistingSnafu { path })?;
        }

        let db = sled::Config::new()
            .path(path)
            .cache_capacity(CACHE_CAPACITY_BYTES)
            .use_compression(false)
            .open()
            .context(OpenSnafu { path })?;

        info!(path = %path.display(), "kv backend opened");
        Ok(Self { db })
    }

    /// Release the handle without destroying the underlying files.
    pub fn close(self) {
        let _ = self.db.flush();
    }

    /// Wipe the store's files from disk entirely.
    pub fn destroy(path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_dir_all(path).context(DestroySnafu { path })?;
        }
        Ok(())
    }

    /// Store every `(key, value)` pair atomically: either all rows land, or a `Put` error is
    /// returned and nothing in this call is persisted.
    pub fn put(&self, rows: &[(Vec<u8>, Vec<u8>)]) -> Result<(), Error> {
        let mut batch = sled::Batch::default();
        for (key, value) in rows {
            batch.insert(key.as_slice(), value.as_slice());
        }
        self.db.apply_batch(batch).context(PutSnafu)?;
        Ok(())
    }

    /// Scan the half-open range `[start, end)` in ascending key order, skipping `offset` entries
    /// and yielding at most `limit` (or everything remaining if `limit` is `None`). Returns raw
    /// value bytes; decoding is the caller's job.
    pub fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<Vec<u8>>, Error> {
        let iter = self.db.range(start.to_vec()..end.to_vec()).skip(offset);
        let values: Vec<Vec<u8>> = match limit {
            Some(limit) => iter
                .take(limit)
                .map(|r| r.context(ScanSnafu).map(|(_, v)| v.to_vec()))
                .collect::<Result<_, _>>()?,
            None => iter
                .map(|r| r.context(ScanSnafu).map(|(_, v)| v.to_vec()))
                .collect::<Result<_, _>>()?,
        };
        Ok(values)
    }
}
