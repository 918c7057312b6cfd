//! Core library for Limes.
//!
//! Contains the identifiers and units, the cluster configuration, the name
//! mapping between backend and API identities, the report assemblers for
//! cluster, domain and project reports, quota constraints, low-privilege
//! raise limits, the quota and rate-limit updaters, and the audit trail.
//! This crate knows nothing about the database or HTTP: report assemblers
//! are fed with typed rows, and updaters with finished reports.

pub mod audit;
pub mod audit_file;
pub mod behavior;
pub mod cluster;
pub mod commitment;
pub mod config;
pub mod constraints;
pub mod error;
pub mod filter;
pub mod lowpriv_raise;
pub mod metrics;
pub mod name_mapping;
pub mod names;
pub mod report;
pub mod timeseries;
pub mod translation;
pub mod unit;
pub mod updater;
pub mod validation;
pub mod window;
