//! Byte-comparable composite key construction.
//!
//! A composite storage key is `bucket ++ sort_key ++ chunk_id ++ row_index`, where `bucket`
//! isolates one qbuf's rows from every other qbuf sharing the backend, and the rest is built so
//! that unsigned lexicographic byte order equals logical `ORDER BY` order. See the module-level
//! doc on [`encode_sort_key`] for the per-field transform.

use crate::value::{ColumnValue, Direction, NullsOrder, OrderByField, Row};
use uuid::Uuid;

/// The bucket-type literal the backend expiry subsystem matches on. Must appear at a fixed
/// position in every composite key this crate writes.
pub const BUCKET_TAG: &[u8] = b"$abuf";

/// Tag byte for a NULL that sorts before all non-null values of its field.
const NULL_FIRST_TAG: u8 = 0x00;
/// Tag byte for any non-null value.
const NON_NULL_TAG: u8 = 0x01;
/// Tag byte for a NULL that sorts after all non-null values of its field.
const NULL_LAST_TAG: u8 = 0x02;

/// An opaque, process-unique identifier for one qbuf.
///
/// Refs only need to be unique within a process lifetime; a random UUID satisfies that with no
/// coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct QBufRef(Uuid);

impl QBufRef {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }
}

impl Default for QBufRef {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for QBufRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The bucket prefix `(bucket_tag, qbuf_ref)` shared by every composite key belonging to one
/// qbuf.
pub fn bucket_prefix(qbuf_ref: QBufRef) -> Vec<u8> {
    let mut out = Vec::with_capacity(BUCKET_TAG.len() + 16);
    out.extend_from_slice(BUCKET_TAG);
    out.extend_from_slice(&qbuf_ref.as_bytes());
    out
}

/// The smallest key that could ever sort greater than any key under `prefix`, by incrementing
/// the last byte that isn't already `0xFF` and truncating the rest. Used as the exclusive upper
/// bound of a bucket-ranged scan.
pub fn prefix_upper_bound(prefix: &[u8]) -> Vec<u8> {
    let mut out = prefix.to_vec();
    while let Some(&last) = out.last() {
        if last == 0xFF {
            out.pop();
        } else {
            *out.last_mut().unwrap() += 1;
            return out;
        }
    }
    // All bytes were 0xFF (never happens for our fixed-width bucket prefix, which always ends in
    // 16 essentially-random UUID bytes): no finite upper bound exists, so scans should just run
    // to the end of the keyspace.
    out
}

fn encode_i64_asc(v: i64) -> [u8; 8] {
    ((v as u64) ^ 0x8000_0000_0000_0000).to_be_bytes()
}

fn encode_f64_asc(v: f64) -> [u8; 8] {
    let bits = v.to_bits();
    let mapped = if v.is_sign_negative() {
        !bits
    } else {
        bits | 0x8000_0000_0000_0000
    };
    mapped.to_be_bytes()
}

/// Memcomparable encoding of a byte string: escapes `0x00` as `0x00 0xFF` and terminates with
/// `0x00 0x00`, so that byte-wise comparison of the encoded form matches comparison of the
/// original strings (including prefix relationships - a string is always "less than" any string
/// it is a strict prefix of).
fn encode_bytes_asc(s: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() + 2);
    for &b in s {
        if b == 0x00 {
            out.push(0x00);
            out.push(0xFF);
        } else {
            out.push(b);
        }
    }
    out.push(0x00);
    out.push(0x00);
    out
}

fn bitwise_not(bytes: &mut [u8]) {
    for b in bytes.iter_mut() {
        *b = !*b;
    }
}

/// Encode one field's value under one `ORDER BY` field spec: `[tag_byte] ++ value_bytes`.
///
/// `tag_byte` is `NULL_FIRST_TAG`/`NON_NULL_TAG`/`NULL_LAST_TAG` depending only on whether the
/// value is null and whether this field is `NULLS FIRST` or `NULLS LAST` (independent of
/// direction). For non-null values, `value_bytes` is the ascending encoding, bitwise-complemented
/// in full (including any escape/terminator bytes) when the field is `DESC` - complementing an
/// order-preserving ascending encoding always yields a strictly order-reversing one.
fn encode_field(value: &ColumnValue, field: OrderByField) -> Vec<u8> {
    if value.is_null() {
        let tag = match field.nulls {
            NullsOrder::First => NULL_FIRST_TAG,
            NullsOrder::Last => NULL_LAST_TAG,
        };
        return vec![tag];
    }

    let mut value_bytes = match value {
        ColumnValue::Null => unreachable!(),
        ColumnValue::Int64(v) => encode_i64_asc(*v).to_vec(),
        ColumnValue::Float64(v) => encode_f64_asc(*v).to_vec(),
        ColumnValue::Bool(b) => vec![*b as u8],
        ColumnValue::Utf8(s) => encode_bytes_asc(s.as_bytes()),
        ColumnValue::Bytes(b) => encode_bytes_asc(b),
    };

    if field.direction == Direction::Desc {
        bitwise_not(&mut value_bytes);
    }

    let mut out = Vec::with_capacity(value_bytes.len() + 1);
    out.push(NON_NULL_TAG);
    out.extend(value_bytes);
    out
}

/// Encode the full sort key (concatenation of every resolved `ORDER BY` field's encoding, in
/// clause order) for one row.
pub fn encode_sort_key(row: &Row, order_by: &[OrderByField]) -> Vec<u8> {
    let mut out = Vec::new();
    for field in order_by {
        let value = row.0.get(field.position).unwrap_or(&ColumnValue::Null);
        out.extend(encode_field(value, *field));
    }
    out
}

/// Full composite key: `bucket ++ sort_key ++ chunk_id ++ row_index`, both tie-breakers encoded
/// big-endian ascending (arrival order is never inverted, regardless of any `DESC` clause).
pub fn encode_composite_key(
    qbuf_ref: QBufRef,
    sort_key: &[u8],
    chunk_id: u64,
    row_index: u32,
) -> Vec<u8> {
    let mut out = bucket_prefix(qbuf_ref);
    out.extend_from_slice(sort_key);
    out.extend_from_slice(&chunk_id.to_be_bytes());
    out.extend_from_slice(&row_index.to_be_bytes());
    out
}

/// Serialize a row for storage. Self-describing via bincode + serde, round-trips exactly.
pub fn encode_row(row: &Row) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(row)
}

/// Deserialize a row previously produced by [`encode_row`].
pub fn decode_row(bytes: &[u8]) -> Result<Row, bincode::Error> {
    bincode::deserialize(bytes)
}
