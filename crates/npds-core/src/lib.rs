//! npds core: transport-agnostic policy model, discovery wire messages,
//! version bookkeeping, and the flow evaluator.
//!
//! This crate carries no async runtime or transport dependencies. The agent
//! crate drives the discovery stream and owns the live policy store; everything
//! here is pure data and pure functions so it can be exercised without a
//! network.
//!
//! # Defensive guarantees
//! Panics, `unwrap`, and `expect` are compile-denied here
//! (`#![deny(clippy::panic, clippy::unwrap_used, clippy::expect_used)]`).
//! Malformed resources and flows surface as `NpdsError`/`Result`.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod evaluator;
pub mod flow;
pub mod model;
pub mod proto;
pub mod tracker;

/// Shared result type.
pub use error::{ErrorCode, NpdsError, Result};
