//! This crate exists to pin a single version of the `tracing` ecosystem that every crate in
//! this workspace builds against, so that upgrading the logging stack is a one-crate change.
//!
//! Downstream crates should `use observability_deps::tracing::{...}` rather than depending on
//! `tracing` directly.

pub use tracing;
