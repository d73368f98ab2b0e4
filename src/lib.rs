//! High-volume event ingestion service.
//!
//! Consumes at-least-once-delivered records from Kafka, applies each
//! logical message at most once (Redis fast cache + Postgres fallback,
//! guarded by a distributed lock), converts high-frequency audit writes
//! into periodic bulk writes under backpressure, and diverts unprocessable
//! records to a dead-letter topic.

pub mod app_state;
pub mod cache;
pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod producer;
pub mod routes;
pub mod services;
