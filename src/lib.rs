//! Virtual bank relayer - library interface
//!
//! Re-exports internal modules for use in integration tests.

pub mod api;
pub mod chain;
pub mod config;
pub mod contracts;
pub mod engine;
pub mod error;
pub mod home;
pub mod metrics;
pub mod store;
pub mod types;
