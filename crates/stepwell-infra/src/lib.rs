//! Infrastructure layer for Stepwell.
//!
//! Contains implementations of the repository trait defined in
//! `stepwell-core` (SQLite with WAL mode and split read/write pools),
//! engine configuration loading, and the built-in HTTP webhook capability.

pub mod capability;
pub mod config;
pub mod sqlite;
