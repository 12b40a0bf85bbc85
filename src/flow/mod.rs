//! Policy-to-flow compilation and enforcement on the SDN fabric.

pub mod manager;
pub mod rules;

pub use manager::FlowManager;
