//! Top-level facade crate for npds.
//!
//! Re-exports the policy model and evaluator (`core`) and the discovery agent
//! runtime (`agent`) so users can depend on a single crate.

pub mod core {
    pub use npds_core::*;
}

pub mod agent {
    pub use npds_agent::*;
}
