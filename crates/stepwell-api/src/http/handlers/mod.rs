//! HTTP request handlers for the REST API.

pub mod dead_letter;
pub mod run;
pub mod workflow;
