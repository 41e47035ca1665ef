//! Core of the channel mirror: transform pipeline, album coalescing, mapping store,
//! delivery engine, comment mirroring and the past/live orchestration.
//!
//! This crate is framework-agnostic. The messaging platform lives behind the
//! `ChatClient` port, implemented in adapter crates.

pub mod coalescer;
pub mod comments;
pub mod config;
pub mod deadletter;
pub mod delivery;
pub mod domain;
pub mod envelope;
pub mod errors;
pub mod forward;
pub mod live;
pub mod logging;
pub mod mapping;
pub mod messaging;
pub mod past;
pub mod pipeline;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{Error, Result};
