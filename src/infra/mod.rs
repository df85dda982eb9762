//! Infrastructure Adapters
//!
//! Implementations of [`InfrastructureProvider`](crate::domain::InfrastructureProvider).
//! The in-memory provider is fed through the instance observation endpoints
//! in standalone deployments and backs the reconciliation tests.

pub mod memory;

pub use memory::*;
