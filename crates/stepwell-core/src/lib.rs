//! Workflow execution engine and repository trait definitions for Stepwell.
//!
//! This crate defines the "ports" (the `EngineRepository` trait) that the
//! infrastructure layer implements, plus the engine itself: step executor,
//! timer scheduler, signal router, dead-letter manager, safety gate, and
//! the dry-run simulator. It depends only on `stepwell-types` -- never on
//! `stepwell-infra` or any database/IO crate.

pub mod engine;
pub mod event;
pub mod repository;
