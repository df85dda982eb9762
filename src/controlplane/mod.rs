//! LBaaS Control Plane Module
//!
//! The request-facing side of the service: validated CRUD over the entity
//! graph, response views, declarative templates and the REST API.

pub mod api;
pub mod fields;
pub mod service;
pub mod template;
pub mod views;

pub use api::*;
pub use fields::*;
pub use service::*;
pub use template::*;
pub use views::*;
