//! Domain layer - port definitions
//!
//! This module defines the traits (ports) that the reconciliation engine is
//! written against, following hexagonal architecture principles. Adapters
//! live in [`crate::store`], [`crate::infra`] and [`crate::reconcile::render`].

pub mod ports;

pub use ports::*;
