//! Shared domain types for Stepwell.
//!
//! This crate contains the core domain types used across the Stepwell
//! engine: workflow definitions, runs, dead letters, signals, engine events,
//! and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod run;
pub mod workflow;
