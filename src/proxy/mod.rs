//! Request forwarding: filters, circuit breakers, and the upstream call

pub mod circuit;
pub mod filters;
pub mod forwarder;

pub use circuit::{CircuitBreakers, CircuitConfig, CircuitPermit, CircuitState, CircuitStatus};
pub use forwarder::{
    strip_hop_by_hop, Forwarded, ForwarderConfig, HttpUpstream, ProxyRequest, RequestForwarder,
    Upstream, UpstreamRequest, UpstreamResponse, CLIENT_ID_HEADER,
};
