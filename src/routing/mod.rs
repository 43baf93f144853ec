//! Route table, matching, and instance selection

pub mod balancer;
pub mod reload;
pub mod resolver;
pub mod route;

pub use balancer::{client_hash, LoadBalancer};
pub use reload::{RouteTableHandle, DEFAULT_POLL_INTERVAL};
pub use resolver::{Resolution, RouteResolver};
pub use route::{Filter, LoadBalancePolicy, Route, RouteMatch, RouteTable};
