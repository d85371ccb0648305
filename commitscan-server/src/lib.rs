//! # commitscan server
//!
//! Operator HTTP API over the scan job store, plus the process that hosts the
//! worker runtime. `main.rs` wires configuration, storage and the runtime;
//! this library exposes the router so tests can drive it in-process.

pub mod api;
pub mod errors;
pub mod handlers;
pub mod infra;
pub mod routes;

pub use infra::app_state::AppState;
