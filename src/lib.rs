//! promhook - Prometheus instrumentation hooks for web services
//!
//! Records request/response metrics through a before/after middleware pair,
//! wraps caches, database cursors and model stores with counting
//! pass-throughs, exports migration gauges, and serves everything in the
//! Prometheus text format from the host router or a standalone exporter.
//! Batch jobs and task workers push to a Prometheus push gateway instead.

pub mod auth;
pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod exporter;
pub mod handlers;
pub mod labels;
pub mod metrics;
pub mod middleware;
pub mod migrations;
pub mod models;
pub mod multiprocess;
pub mod pushgateway;
pub mod tasks;
pub mod telemetry;
pub mod testutils;
pub mod tracker;
