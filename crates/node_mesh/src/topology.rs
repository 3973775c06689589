//! Versioned membership table.
//!
//! One lock covers the node map, the version counter and the timestamp, so a
//! reader never sees a version that disagrees with the membership. Every
//! successful mutation bumps the version by exactly one. Merging is a whole
//! snapshot replacement gated on `other.version > self.version`.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use node_proto::mesh::{NodeDescriptor, TopologySnapshot};
use node_proto::now_ms;

use crate::error::{MeshError, Result};

#[derive(Debug, Default)]
struct TopologyState {
    nodes: HashMap<String, NodeDescriptor>,
    version: u64,
    updated_at_ms: u64,
}

impl TopologyState {
    fn bump(&mut self) -> u64 {
        self.version += 1;
        self.updated_at_ms = now_ms();
        self.version
    }
}

#[derive(Debug, Default)]
pub struct Topology {
    state: RwLock<TopologyState>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: TopologySnapshot) -> Self {
        Self {
            state: RwLock::new(state_from_snapshot(snapshot)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TopologyState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TopologyState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a new node. Returns the new version.
    pub fn add_node(&self, mut node: NodeDescriptor) -> Result<u64> {
        if !node.is_complete() {
            return Err(MeshError::InvalidDescriptor(format!(
                "node {:?} needs an id, name and address",
                node.id
            )));
        }
        let mut state = self.write();
        if state.nodes.contains_key(&node.id) {
            return Err(MeshError::AlreadyExists(format!("node {}", node.id)));
        }
        let now = now_ms();
        if node.joined_at_ms == 0 {
            node.joined_at_ms = now;
        }
        node.updated_at_ms = now;
        state.nodes.insert(node.id.clone(), node);
        Ok(state.bump())
    }

    /// Remove a node. Returns the removed descriptor.
    pub fn remove_node(&self, id: &str) -> Result<NodeDescriptor> {
        let mut state = self.write();
        let removed = state
            .nodes
            .remove(id)
            .ok_or_else(|| MeshError::NodeNotFound(id.to_string()))?;
        state.bump();
        Ok(removed)
    }

    /// Replace a node's descriptor, keeping its original join time.
    pub fn update_node(&self, mut node: NodeDescriptor) -> Result<u64> {
        let mut state = self.write();
        let existing = state
            .nodes
            .get(&node.id)
            .ok_or_else(|| MeshError::NodeNotFound(node.id.clone()))?;
        node.joined_at_ms = existing.joined_at_ms;
        node.updated_at_ms = now_ms();
        state.nodes.insert(node.id.clone(), node);
        Ok(state.bump())
    }

    pub fn get_node(&self, id: &str) -> Option<NodeDescriptor> {
        self.read().nodes.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().nodes.contains_key(id)
    }

    /// Detached copy of every node, ordered by id.
    pub fn get_all_nodes(&self) -> Vec<NodeDescriptor> {
        sorted(self.read().nodes.values().cloned().collect())
    }

    pub fn version(&self) -> u64 {
        self.read().version
    }

    pub fn node_count(&self) -> usize {
        self.read().nodes.len()
    }

    pub fn updated_at_ms(&self) -> u64 {
        self.read().updated_at_ms
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        let state = self.read();
        TopologySnapshot {
            nodes: sorted(state.nodes.values().cloned().collect()),
            version: state.version,
            updated_at_ms: state.updated_at_ms,
        }
    }

    /// Adopt `other` wholesale if it is strictly newer.
    pub fn merge(&self, other: &Topology) -> bool {
        self.merge_snapshot(other.snapshot())
    }

    pub fn merge_snapshot(&self, snapshot: TopologySnapshot) -> bool {
        let mut state = self.write();
        if snapshot.version <= state.version {
            return false;
        }
        *state = state_from_snapshot(snapshot);
        true
    }

    /// Nodes advertising exactly `(service, version)`, ordered by id.
    pub fn get_service_providers(&self, service: &str, version: &str) -> Vec<NodeDescriptor> {
        // linear scan; a service index is the upgrade path for large meshes
        sorted(
            self.read()
                .nodes
                .values()
                .filter(|n| n.provides(service, version))
                .cloned()
                .collect(),
        )
    }

    /// Nodes advertising `service` at any version, ordered by id.
    pub fn get_nodes_by_service(&self, service: &str) -> Vec<NodeDescriptor> {
        sorted(
            self.read()
                .nodes
                .values()
                .filter(|n| n.provides_service(service))
                .cloned()
                .collect(),
        )
    }
}

impl Clone for Topology {
    fn clone(&self) -> Self {
        Self::from_snapshot(self.snapshot())
    }
}

fn state_from_snapshot(snapshot: TopologySnapshot) -> TopologyState {
    TopologyState {
        nodes: snapshot
            .nodes
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect(),
        version: snapshot.version,
        updated_at_ms: snapshot.updated_at_ms,
    }
}

fn sorted(mut nodes: Vec<NodeDescriptor>) -> Vec<NodeDescriptor> {
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    nodes
}
