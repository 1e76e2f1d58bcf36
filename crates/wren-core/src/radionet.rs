//! Registry of radio peers
//!
//! [`RadioNet`] owns one [`Node`] record per known peer, created lazily the
//! first time a node is heard or addressed. The local node is always present.
//! The node map has its own mutex; per-node mutable state is interior so the
//! map lock is held only for lookup and never across window operations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::MonoTime;
use crate::types::{NodeId, Seq};

/// Pairs of (sender timestamp, local receive timestamp).
pub type TimestampVec = Vec<(MonoTime, MonoTime)>;

/// Per-peer node state.
#[derive(Debug)]
pub struct Node {
    /// Node ID.
    pub id: NodeId,
    is_gateway: AtomicBool,
    can_transmit: AtomicBool,
    /// Multiplicative TX gain as measured against 0 dBFS.
    g: Mutex<f64>,
    /// Current MCS index for traffic to this node.
    mcsidx: AtomicUsize,
    /// Next sequence number for traffic to this node.
    seq: Mutex<Seq>,
    /// Timestamps received from this node.
    timestamps: Mutex<TimestampVec>,
}

impl Node {
    fn new(id: NodeId) -> Node {
        Node {
            id,
            is_gateway: AtomicBool::new(false),
            can_transmit: AtomicBool::new(true),
            g: Mutex::new(1.0),
            mcsidx: AtomicUsize::new(0),
            seq: Mutex::new(Seq(0)),
            timestamps: Mutex::new(Vec::new()),
        }
    }

    pub fn is_gateway(&self) -> bool {
        self.is_gateway.load(Ordering::Relaxed)
    }

    pub fn set_gateway(&self, is_gateway: bool) {
        self.is_gateway.store(is_gateway, Ordering::Relaxed);
    }

    /// Whether this node is currently allowed to transmit (squelch).
    pub fn can_transmit(&self) -> bool {
        self.can_transmit.load(Ordering::Relaxed)
    }

    pub fn set_can_transmit(&self, can: bool) {
        self.can_transmit.store(can, Ordering::Relaxed);
    }

    /// Linear soft TX gain.
    pub fn gain(&self) -> f64 {
        *self.g.lock().unwrap()
    }

    pub fn set_gain(&self, g: f64) {
        *self.g.lock().unwrap() = g;
    }

    /// Soft TX gain in dBFS.
    pub fn soft_tx_gain_db(&self) -> f64 {
        20.0 * self.gain().log10()
    }

    /// Set soft TX gain from dBFS.
    pub fn set_soft_tx_gain_db(&self, db: f64) {
        self.set_gain(10.0_f64.powf(db / 20.0));
    }

    pub fn mcsidx(&self) -> usize {
        self.mcsidx.load(Ordering::Relaxed)
    }

    pub fn set_mcsidx(&self, mcsidx: usize) {
        self.mcsidx.store(mcsidx, Ordering::Relaxed);
    }

    /// Next sequence number that will be assigned to this node.
    pub fn seq(&self) -> Seq {
        *self.seq.lock().unwrap()
    }

    /// Assign and consume the next sequence number.
    pub fn assign_seq(&self) -> Seq {
        let mut seq = self.seq.lock().unwrap();
        let s = *seq;
        *seq += 1;
        s
    }

    /// Record a (sent, received) timestamp pair heard from this node.
    pub fn record_timestamp(&self, t_sent: MonoTime, t_recv: MonoTime) {
        self.timestamps.lock().unwrap().push((t_sent, t_recv));
    }

    /// The most recently recorded timestamp pair.
    pub fn last_timestamp(&self) -> Option<(MonoTime, MonoTime)> {
        self.timestamps.lock().unwrap().last().copied()
    }

    /// Number of recorded timestamp pairs.
    pub fn num_timestamps(&self) -> usize {
        self.timestamps.lock().unwrap().len()
    }
}

/// The set of known radio nodes.
pub struct RadioNet {
    this_node_id: NodeId,
    this_node: Arc<Node>,
    nodes: Mutex<HashMap<NodeId, Arc<Node>>>,
}

impl RadioNet {
    /// Create a registry whose local node is `this_node_id`.
    pub fn new(this_node_id: NodeId) -> RadioNet {
        let this_node = Arc::new(Node::new(this_node_id));
        let mut nodes = HashMap::new();
        nodes.insert(this_node_id, this_node.clone());

        RadioNet {
            this_node_id,
            this_node,
            nodes: Mutex::new(nodes),
        }
    }

    /// The local node's ID.
    pub fn this_node_id(&self) -> NodeId {
        self.this_node_id
    }

    /// The local node.
    pub fn this_node(&self) -> &Arc<Node> {
        &self.this_node
    }

    /// Return true if `node_id` is known.
    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.lock().unwrap().contains_key(&node_id)
    }

    /// Get a node, creating it if it is new.
    pub fn node(&self, node_id: NodeId) -> Arc<Node> {
        let mut nodes = self.nodes.lock().unwrap();
        nodes
            .entry(node_id)
            .or_insert_with(|| Arc::new(Node::new(node_id)))
            .clone()
    }

    /// Snapshot of all known nodes.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        let mut nodes: Vec<_> = self.nodes.lock().unwrap().values().cloned().collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    /// Apply `f` to every known node.
    pub fn foreach<F: FnMut(&Node)>(&self, mut f: F) {
        for node in self.nodes() {
            f(&node);
        }
    }

    /// The elected time master: the gateway node with the lowest ID.
    pub fn time_master(&self) -> Option<NodeId> {
        self.nodes()
            .iter()
            .filter(|n| n.is_gateway())
            .map(|n| n.id)
            .min()
    }
}
