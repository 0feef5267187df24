//! `bookspace-core` — shared building blocks for the event bus.
//!
//! This crate contains **pure** primitives (no broker or IO concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::CorrelationId;
