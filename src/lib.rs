#![forbid(unsafe_code)]

// Huddle library - selective-forwarding room and signaling manager

pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod room;
pub mod signaling;
pub mod worker_pool;
