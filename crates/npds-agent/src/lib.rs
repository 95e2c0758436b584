//! npds agent library.
//!
//! Wires the discovery client, the policy store and the admin server into a
//! running agent. Consumed by the binary (`main.rs`) and by integration tests.

pub mod agent;
pub mod api;
pub mod app_state;
pub mod config;
pub mod discovery;
pub mod obs;
pub mod ops;
pub mod router;
pub mod store;
