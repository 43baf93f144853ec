//! HTTP route handlers

pub mod admin;
pub mod health;
pub mod registry;

pub use admin::handle_admin_request;
pub use health::{health_check, readiness_check, version_info, HealthResponse};
pub use registry::handle_registry_request;
