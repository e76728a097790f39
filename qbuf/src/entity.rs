//! In-memory state of one query buffer.

use crate::{
    key_codec::QBufRef,
    value::{OrderByField, Row, SelectColumn},
};
use iox_time::Time;
use tokio::sync::oneshot;

/// The four-state qbuf lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    CollectingChunks,
    ServingFetches,
    Expiring,
    Expired,
}

/// Column layout plus resolved `ORDER BY` positions, derived once at creation from the
/// construction inputs handed down by the compiler and DDL.
#[derive(Debug, Clone)]
pub struct Schema {
    pub columns: Vec<SelectColumn>,
    pub order_by: Vec<OrderByField>,
}

/// Where a qbuf's accepted rows currently live. A qbuf is always in exactly one of these states;
/// once `Spilled`, a qbuf never returns to `InMemory`.
#[derive(Debug)]
pub enum Staging {
    /// Rows kept in the process, sorted ascending by composite key. The key is retained even
    /// after the qbuf starts serving fetches, since stripping it buys nothing once storage is
    /// already cheap: `fetch` simply reads the row half of each entry.
    InMemory(Vec<(Vec<u8>, Row)>),
    /// Rows live in the shared backend store, under this qbuf's bucket.
    Spilled,
}

impl Staging {
    fn size_hint(&self) -> usize {
        match self {
            Staging::InMemory(rows) => rows.len(),
            Staging::Spilled => 0,
        }
    }
}

/// One query buffer.
#[derive(Debug)]
pub struct QBuf {
    pub qbuf_ref: QBufRef,
    pub display_name: String,
    pub status: Status,
    pub schema: Schema,
    pub expire_after_ms: u64,
    pub chunks_got: u64,
    pub chunks_need: u64,
    pub total_records: u64,
    pub size_bytes: u64,
    /// Estimated byte size of `staging`'s contents while `InMemory`; `0` once spilled. Tracked
    /// separately from `size_bytes` (which never shrinks) so the manager can subtract it from
    /// the process-wide in-memory budget the moment this qbuf spills or is removed.
    pub inmem_bytes: u64,
    pub last_accessed: Time,
    pub staging: Staging,
    pub ready_notifier: Option<oneshot::Sender<()>>,
}

impl QBuf {
    pub fn new(
        qbuf_ref: QBufRef,
        display_name: String,
        schema: Schema,
        chunks_need: u64,
        expire_after_ms: u64,
        now: Time,
    ) -> Self {
        Self {
            qbuf_ref,
            display_name,
            status: Status::CollectingChunks,
            schema,
            expire_after_ms,
            chunks_got: 0,
            chunks_need,
            total_records: 0,
            size_bytes: 0,
            inmem_bytes: 0,
            last_accessed: now,
            staging: Staging::InMemory(Vec::new()),
            ready_notifier: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.chunks_got >= self.chunks_need
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.staging, Staging::Spilled)
    }

    /// Number of rows currently held in memory (`0` once spilled).
    pub fn inmem_len(&self) -> usize {
        self.staging.size_hint()
    }

    /// Fire and clear the ready notifier, if one is registered. A no-op if none was set.
    pub fn fire_ready_notifier(&mut self) {
        if let Some(tx) = self.ready_notifier.take() {
            let _ = tx.send(());
        }
    }
}
