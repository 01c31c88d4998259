//! Parley – activity scheduling and state-machine engine for asynchronous
//! peer conversations
//!
//! This crate implements the orchestration core of a distributed peer that
//! exchanges performative-tagged messages (request/propose/confirm/…) with
//! other peers:
//! - Activities: tracked units of distributed work with explicit workflow states
//! - Declarative transition tables driving FSM-style message handling
//! - Conversations: two-party request/reply protocol machines
//! - Task activities coordinating many conversations toward one outcome
//! - A fair scheduler that serializes each activity tree while running
//!   unrelated trees in parallel on a bounded worker pool
//! - Future-like completion handles whose waiting count boosts scheduling
//!   priority
//!
//! Wire transport, message encoding, and peer discovery are external
//! collaborators supplied through traits.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Engine core modules implementing activity scheduling and transitions
pub mod engine;

// Re-export key types for convenience
pub use engine::{ActivityManager, EngineConfig};

/// Current version of the Parley engine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
