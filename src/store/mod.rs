//! Store adapters
//!
//! - `kube`: Kubernetes API implementation of every port
//! - `memory`: in-memory implementation for standalone mode and tests
//! - `fixture`: YAML fleet snapshots that seed the memory store

pub mod fixture;
pub mod kube;
pub mod memory;

pub use fixture::FleetSnapshot;
pub use self::kube::KubeStore;
pub use memory::MemoryStore;
