//! API Module
//!
//! REST API over the LBaaS service.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
