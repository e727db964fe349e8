//! Envmon - telemetry ingestion with threshold alerting.
//!
//! # Overview
//!
//! Devices post periodic readings: ambient sensors report temperature,
//! humidity, air quality, pressure and light; system agents report battery,
//! CPU, memory and audio state. Every accepted reading is stored, pushed to
//! live viewers, and checked against configurable thresholds. Crossings are
//! throttled per device and alert kind, then broadcast and mailed to
//! everyone who opted in.
//!
//! # Modules
//!
//! - [`model`]: Reading, alert, request and response types
//! - [`config`]: Threshold and cooldown configuration
//! - [`rules`]: Threshold evaluation for both reading kinds
//! - [`cooldown`]: Per-device, per-alert notification throttling
//! - [`notify`]: Broadcast bus, email channel, reports and the dispatcher
//! - [`ingest`]: The persist, evaluate, gate and dispatch pipeline
//! - [`storage`]: SQLite storage layer
//! - [`api`]: HTTP API handlers
//! - [`live`]: WebSocket stream of live events

pub mod api;
pub mod config;
pub mod cooldown;
pub mod ingest;
pub mod live;
pub mod model;
pub mod notify;
pub mod rules;
pub mod storage;
