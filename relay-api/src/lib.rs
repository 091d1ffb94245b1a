//! Client library for the Relay coordinator API.
//!
//! This crate provides everything a runner needs to talk to the
//! coordinator:
//! - Typed REST client with long-poll message batches
//! - Wire types for queue records and message envelopes
//! - The runner message catalogue (requests and responses)
//! - ECIES envelope crypto (P-256 + HKDF-SHA256 + AES-256-GCM)
//! - Runner token parsing

pub mod client;
pub mod ecies;
pub mod error;
pub mod messages;
pub mod token;
pub mod types;

// Queue keypairs surface in the public API; re-export the curve crate so
// consumers name the same types.
pub use p256;

pub use client::{Client, ClientOptions, CoordinatorApi};
pub use error::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;
