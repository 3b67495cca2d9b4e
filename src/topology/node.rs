//! Node resolution
//!
//! Every PoolSpec carries a label selector that must resolve to exactly one
//! node. Selection of pools still lacking an instance tracks the nodes seen
//! during the pass in an explicit set owned by the caller.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::crd::PoolSpec;
use crate::domain::ports::NodeDirectory;
use crate::error::{Error, Result};

/// Render a selector as `k=v,k2=v2`
pub fn format_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// A desired pool that has no instance yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPool {
    /// Index into `PoolClusterSpec::pools`
    pub index: usize,
    pub node_name: String,
}

/// Outcome of resolving every pool of a cluster in one pass
#[derive(Debug, Default)]
pub struct NodeSelection {
    /// Pool index -> resolved node
    pub resolved: BTreeMap<usize, String>,
    /// Pools without an instance on their node
    pub pending: Vec<PendingPool>,
    /// Pools whose selector did not resolve
    pub failures: Vec<(usize, Error)>,
    /// Nodes claimed during the pass, seeded with the observed hosts
    pub visited: BTreeSet<String>,
}

impl NodeSelection {
    /// Node names of every resolved pool
    pub fn desired_nodes(&self) -> BTreeSet<&str> {
        self.resolved.values().map(String::as_str).collect()
    }
}

/// Resolves pool node selectors against the node directory
#[derive(Clone)]
pub struct NodeResolver {
    nodes: Arc<dyn NodeDirectory>,
}

impl NodeResolver {
    pub fn new(nodes: Arc<dyn NodeDirectory>) -> Self {
        Self { nodes }
    }

    /// Resolve a selector to exactly one node name
    pub async fn resolve(&self, selector: &BTreeMap<String, String>) -> Result<String> {
        let mut matches = self.nodes.list_nodes(selector).await?;
        if matches.len() != 1 {
            return Err(Error::AmbiguousSelector {
                selector: format_selector(selector),
                matches: matches.len(),
            });
        }
        Ok(matches.remove(0))
    }

    /// Resolve every pool and pick those whose node has no instance yet.
    ///
    /// `observed_hosts` are the nodes already carrying an instance of the
    /// cluster. A node is handed out at most once per pass; a second pool
    /// resolving to an already visited node is left alone.
    pub async fn select(
        &self,
        pools: &[PoolSpec],
        observed_hosts: &BTreeSet<String>,
    ) -> NodeSelection {
        let mut selection = NodeSelection {
            visited: observed_hosts.clone(),
            ..Default::default()
        };

        for (index, pool) in pools.iter().enumerate() {
            let node_name = match self.resolve(&pool.node_selector).await {
                Ok(node) => node,
                Err(e) => {
                    warn!(pool = index, error = %e, "cannot resolve pool node");
                    selection.failures.push((index, e));
                    continue;
                }
            };
            selection.resolved.insert(index, node_name.clone());

            if selection.visited.insert(node_name.clone()) {
                debug!(pool = index, node = %node_name, "pool has no instance yet");
                selection.pending.push(PendingPool { index, node_name });
            }
        }
        selection
    }
}
