//! Topology engine
//!
//! Node resolution, device claims, object construction and raid group
//! diffing shared by the reconciler and the validation gate.

pub mod builder;
pub mod claim;
pub mod differ;
pub mod node;

pub use builder::{build_instance, build_manager, effective_config, instance_name, InstanceParams, ManagerTemplate};
pub use claim::{check_tag, ClaimEngine};
pub use differ::{
    classify_group, diff_pool, diff_specs, raid_group_present, sync_config, GroupChange, GroupDiff,
    GroupKind, NewGroup, TopologyDiff,
};
pub use node::{format_selector, NodeResolver, NodeSelection, PendingPool};
