//! # peerlink-common
//!
//! Shared configuration and error handling used across all Peerlink crates.
//! Foundation layer: no negotiation logic, only primitives and contracts.

pub mod config;
pub mod error;

pub use error::{PeerlinkError, PeerlinkResult};
