//! The error vocabulary returned across the manager boundary.

use crate::key_codec::QBufRef;
use snafu::Snafu;

/// Errors a [`crate::manager::QBufManagerHandle`] operation can return.
///
/// The manager never panics or propagates a raw backend error to a caller; it always maps into
/// one of these.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("manager is not ready yet"))]
    NotReady,

    #[snafu(display("backend initialization failed: {reason}"))]
    InitFailed { reason: String },

    #[snafu(display("no such qbuf: {qbuf_ref}"))]
    BadRef { qbuf_ref: QBufRef },

    #[snafu(display("qbuf {qbuf_ref} has already finished collecting chunks"))]
    AlreadyFinished { qbuf_ref: QBufRef },

    #[snafu(display("quota exceeded"))]
    QuotaExceeded,

    #[snafu(display("backend put failed: {source}"))]
    BackendPutFailed { source: crate::kv_backend::Error },

    #[snafu(display("bucket {bucket:?} is not a qbuf bucket"))]
    NotAQbuf { bucket: Vec<u8> },

    #[snafu(display("query is not pageable: {reason}"))]
    QueryNonPageable { reason: String },
}
