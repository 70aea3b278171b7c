//! Tokenhive - Distributed Token-Bucket Rate Limiting
//!
//! This crate implements per-client token buckets whose state lives in a
//! partitioned key-value store. Every consumption is an atomic entry
//! processor, idle buckets are expired with per-key jitter, and nodes back
//! up each other's entries over a gossip mesh.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod mesh;
pub mod ratelimit;
pub mod store;
