//! Row and column value types shared by the key codec and the row payload encoding.

use serde::{Deserialize, Serialize};

/// The closed set of column types construction inputs may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Int64,
    Float64,
    Bool,
    Utf8,
    Bytes,
}

/// A single column value, or the absence of one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnValue {
    Null,
    Int64(i64),
    Float64(f64),
    Bool(bool),
    Utf8(String),
    Bytes(Vec<u8>),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }
}

/// One row: a value per column, in schema order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row(pub Vec<ColumnValue>);

/// `ASC`/`DESC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Asc,
    Desc,
}

/// `NULLS FIRST`/`NULLS LAST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NullsOrder {
    First,
    Last,
}

/// One `SELECT` output column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectColumn {
    pub name: String,
    pub return_type: ColumnType,
}

/// One `ORDER BY` clause entry, as handed down by the compiler, before resolution against the
/// DDL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderByColumn {
    pub name: String,
    pub direction: Direction,
    pub nulls: NullsOrder,
}

/// One DDL field, used to resolve `OrderByColumn::name` to a position in the row tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DdlField {
    pub name: String,
    pub position: usize,
    pub column_type: ColumnType,
}

/// A resolved `ORDER BY` field: a row position plus the direction/nulls behavior to apply to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderByField {
    pub position: usize,
    pub direction: Direction,
    pub nulls: NullsOrder,
}
