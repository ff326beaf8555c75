//! Library entrypoint: re‑export modules

pub mod client;
pub mod config;
pub mod errors;
pub mod index;
pub mod metrics;
pub mod schema;
pub mod search;
pub mod server;
pub mod snapshot;
pub mod transport;
