//! Limes HTTP server.
//!
//! Wires the core library to `PostgreSQL` and serves the resource and rate
//! report API at `/v1/*` and `/rates/v1/*`, plus low-privilege-raise
//! metrics at `/metrics`.

pub mod config;
pub mod error;
pub mod middleware;
pub mod policy;
pub mod repository;
pub mod routes;
pub mod state;
