//! HTTP servers
//!
//! hyper http1 on TokioIo, one task per connection. The registry server
//! exposes the registration API; the gateway server adds admin endpoints
//! and forwards everything else to upstream instances.

pub mod body;
pub mod gateway;
pub mod registry;
pub mod response;
pub mod sidecar;

use bytes::Bytes;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub use gateway::GatewayState;
pub use registry::RegistryState;
pub use sidecar::SidecarState;
