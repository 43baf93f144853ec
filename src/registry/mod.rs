//! Service registry
//!
//! Provides the instance store, the lease manager that evicts stale
//! registrations, and the instance data model shared with discovery clients.

pub mod instance;
pub mod lease;
pub mod store;

pub use instance::{
    normalize_service_name, InstanceKey, InstanceStatus, RegistrationRequest, RegistrySnapshot,
    ServiceInstance, ServiceSummary, SnapshotTag,
};
pub use lease::{LeaseConfig, LeaseManager, SweepReport};
pub use store::{EvictionOutcome, RegistryStore};
