//! fedmon - observability and network-policy enforcement plane for a
//! federated-learning testbed.
//!
//! Exposes core modules for use by the binary and integration tests.

pub mod api;
pub mod clients;
pub mod collector;
pub mod flow;
pub mod models;
pub mod monitors;
pub mod storage;
