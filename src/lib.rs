//! # chunkmap
//!
//! Lease-coordinated parallel transform-and-load over a large ordered
//! dataset.
//!
//! The source is split into contiguous key-range chunks recorded in a shared
//! lease table. Workers, in one process or many, claim chunks, stream their
//! records through a user transform and bulk-write the outputs. A supervisor
//! reports progress and reopens chunks whose lease has expired.

pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod job;
pub mod lease;
pub mod model;
pub mod planner;
pub mod store;
pub mod telemetry;
pub mod transform;
