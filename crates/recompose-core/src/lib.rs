//! recompose-core: Shared types and concurrency primitives for recompose
//!
//! This crate provides the wire types exchanged between the coordinator,
//! agents, and the admin CLI, plus the two primitives every long-lived
//! worker in the system is built from: a latest-value state container with
//! change notification, and a retry-with-backoff run loop.

pub mod api;
pub mod runloop;
pub mod state;

pub use runloop::{jitter, run_loop};
pub use state::StateContainer;
