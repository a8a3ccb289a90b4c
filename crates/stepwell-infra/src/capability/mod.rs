//! Built-in capability adapters.
//!
//! Concrete business actions are external collaborators; the engine ships
//! one generic side-effecting adapter (HTTP webhook) so workflows can call
//! out to anything with an endpoint.

pub mod http;
