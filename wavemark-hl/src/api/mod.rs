//! Operational HTTP surface
//!
//! Health and worker-status endpoints only; result presentation lives
//! with the external collaborators that consume the result sink.

pub mod health;
pub mod status;

pub use health::health_routes;
pub use status::status_routes;
