//! In-memory view of the nodes known to the main process.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Lifecycle of a node as seen by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Registering,
    Registered,
    Failed,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub mac: String,
    pub ip: Option<String>,
    pub image: Option<String>,
    pub state: NodeState,
    pub registered_at: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
    pub error: Option<String>,
}

impl NodeStatus {
    fn new(mac: &str, now: DateTime<Utc>) -> Self {
        Self {
            mac: mac.to_string(),
            ip: None,
            image: None,
            state: NodeState::Registering,
            registered_at: None,
            last_seen: now,
            error: None,
        }
    }
}

/// Node states keyed by MAC address. Clones share the table.
#[derive(Debug, Clone, Default)]
pub struct NodeStatusManager {
    nodes: Rc<RefCell<BTreeMap<String, NodeStatus>>>,
}

impl NodeStatusManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_registration(&self, mac: &str, ip: Option<&str>, image: Option<&str>) {
        let now = Utc::now();
        let mut nodes = self.nodes.borrow_mut();
        let node = nodes.entry(mac.to_string()).or_insert_with(|| NodeStatus::new(mac, now));
        node.state = NodeState::Registering;
        node.last_seen = now;
        node.error = None;
        if let Some(ip) = ip {
            node.ip = Some(ip.to_string());
        }
        if let Some(image) = image {
            node.image = Some(image.to_string());
        }
    }

    pub fn mark_registered(&self, mac: &str) {
        let now = Utc::now();
        let mut nodes = self.nodes.borrow_mut();
        let node = nodes.entry(mac.to_string()).or_insert_with(|| NodeStatus::new(mac, now));
        node.state = NodeState::Registered;
        node.registered_at = Some(now);
        node.last_seen = now;
        info!("Node {} registered", mac);
    }

    pub fn mark_failed(&self, mac: &str, error: &str) {
        if let Some(node) = self.nodes.borrow_mut().get_mut(mac) {
            node.state = NodeState::Failed;
            node.error = Some(error.to_string());
        }
    }

    /// Record a sign of life. Returns `false` for unknown nodes.
    pub fn heartbeat(&self, mac: &str, ip: Option<&str>) -> bool {
        let mut nodes = self.nodes.borrow_mut();
        let Some(node) = nodes.get_mut(mac) else {
            return false;
        };
        node.last_seen = Utc::now();
        if let Some(ip) = ip {
            node.ip = Some(ip.to_string());
        }
        if node.state == NodeState::Offline {
            debug!("Node {} back online", mac);
            node.state = NodeState::Registered;
        }
        true
    }

    /// Mark registered nodes silent for longer than `max_age` as offline.
    pub fn sweep(&self, now: DateTime<Utc>, max_age: Duration) -> Vec<String> {
        let mut swept = Vec::new();
        for node in self.nodes.borrow_mut().values_mut() {
            if node.state == NodeState::Registered && now - node.last_seen > max_age {
                node.state = NodeState::Offline;
                swept.push(node.mac.clone());
            }
        }
        if !swept.is_empty() {
            info!("Nodes offline: {:?}", swept);
        }
        swept
    }

    pub fn get(&self, mac: &str) -> Option<NodeStatus> {
        self.nodes.borrow().get(mac).cloned()
    }

    pub fn list(&self) -> Vec<NodeStatus> {
        self.nodes.borrow().values().cloned().collect()
    }

    pub fn in_state(&self, state: NodeState) -> Vec<NodeStatus> {
        self.nodes
            .borrow()
            .values()
            .filter(|n| n.state == state)
            .cloned()
            .collect()
    }

    pub fn remove(&self, mac: &str) -> Option<NodeStatus> {
        self.nodes.borrow_mut().remove(mac)
    }

    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.borrow().is_empty()
    }
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod tests;
