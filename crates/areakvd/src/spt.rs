//! Flood topology: one spanning tree per flood root
//!
//! Nodes exchange distance vectors (`TopologyAdvert`) carrying their cost to
//! every root they can reach. Each node picks the cheapest peer as parent and
//! registers with it (`FloodTopoSet`). Adverts to the chosen parent are
//! poisoned with [`MAX_COST`] so two nodes never pick each other.

use areakv_core::{
    FloodTopoSetParams, MessageBody, NeighborCounters, NodeId, RootCost, RootCounters,
    SptCounters, SptInfo, SptInfos, SptState,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};

/// Unreachable
pub const MAX_COST: u32 = 64;

/// Outbound topology message
pub type TopoMessage = (NodeId, MessageBody);

/// Link metric used for parent selection
pub trait CostPolicy: Send + Sync + fmt::Debug {
    fn link_cost(&self, peer: &NodeId) -> u32;
}

/// Every link costs one hop
#[derive(Debug, Default, Clone, Copy)]
pub struct HopCount;

impl CostPolicy for HopCount {
    fn link_cost(&self, _peer: &NodeId) -> u32 {
        1
    }
}

#[derive(Debug, Clone)]
struct RootTree {
    state: SptState,
    cost: u32,
    /// `Some(self)` on the root itself
    parent: Option<NodeId>,
    children: BTreeSet<NodeId>,
}

impl RootTree {
    fn new() -> Self {
        Self {
            state: SptState::Computing,
            cost: MAX_COST,
            parent: None,
            children: BTreeSet::new(),
        }
    }
}

/// Per-area spanning tree builder
#[derive(Debug)]
pub struct SpanningTreeBuilder {
    node_id: NodeId,
    is_root_candidate: bool,
    root_override: Option<NodeId>,
    policy: Box<dyn CostPolicy>,
    peers: BTreeSet<NodeId>,
    /// peer -> root -> cost the peer advertised
    adverts: BTreeMap<NodeId, BTreeMap<NodeId, u32>>,
    trees: BTreeMap<NodeId, RootTree>,
    /// Last advert sent per peer, to suppress repeats
    advertised: BTreeMap<NodeId, Vec<RootCost>>,
    counters: SptCounters,
}

impl SpanningTreeBuilder {
    pub fn new(node_id: NodeId, is_root_candidate: bool, root_override: Option<NodeId>) -> Self {
        Self::with_policy(node_id, is_root_candidate, root_override, Box::new(HopCount))
    }

    pub fn with_policy(
        node_id: NodeId,
        is_root_candidate: bool,
        root_override: Option<NodeId>,
        policy: Box<dyn CostPolicy>,
    ) -> Self {
        let mut builder = Self {
            node_id,
            is_root_candidate,
            root_override,
            policy,
            peers: BTreeSet::new(),
            adverts: BTreeMap::new(),
            trees: BTreeMap::new(),
            advertised: BTreeMap::new(),
            counters: SptCounters::default(),
        };
        builder.recompute();
        builder
    }

    pub fn peer_up(&mut self, peer: &NodeId) -> Vec<TopoMessage> {
        self.peers.insert(peer.clone());
        self.counters.neighbor_counters.entry(peer.clone()).or_default();
        self.advertised.remove(peer);
        self.mark_computing();
        self.recompute()
    }

    pub fn peer_down(&mut self, peer: &NodeId) -> Vec<TopoMessage> {
        if !self.peers.remove(peer) {
            return Vec::new();
        }
        self.adverts.remove(peer);
        self.advertised.remove(peer);
        self.counters.neighbor_counters.remove(peer);
        for (root, tree) in self.trees.iter_mut() {
            if tree.children.remove(peer) {
                root_entry(&mut self.counters, root).children_removed += 1;
            }
        }
        self.mark_computing();
        self.recompute()
    }

    /// Resend our full vector to `peer`, e.g. when it may have dropped an
    /// earlier advert sent before it knew us.
    pub fn readvertise(&mut self, peer: &NodeId) -> Vec<TopoMessage> {
        if !self.peers.contains(peer) {
            return Vec::new();
        }
        self.advertised.remove(peer);
        self.recompute()
    }

    fn mark_computing(&mut self) {
        for tree in self.trees.values_mut() {
            tree.state = SptState::Computing;
        }
    }

    /// Apply a peer's distance vector
    pub fn handle_advert(&mut self, peer: &NodeId, costs: Vec<RootCost>) -> Vec<TopoMessage> {
        if !self.peers.contains(peer) {
            debug!("Ignoring topology advert from non-peer {}", peer);
            return Vec::new();
        }
        self.neighbor(peer).adverts_received += 1;

        let costs: BTreeMap<NodeId, u32> = costs
            .into_iter()
            .map(|rc| (rc.root_id, rc.cost.min(MAX_COST)))
            .collect();

        // A child always poisons its advert to us; anything else means it
        // moved to another parent.
        for (root, tree) in self.trees.iter_mut() {
            if tree.children.contains(peer) && costs.get(root) != Some(&MAX_COST) {
                debug!("Peer {} no longer a child for root {}", peer, root);
                tree.children.remove(peer);
                root_entry(&mut self.counters, root).children_removed += 1;
            }
        }

        self.adverts.insert(peer.clone(), costs);
        self.recompute()
    }

    /// Register or unregister `params.src_id` as our child. Returns whether
    /// anything changed.
    pub fn handle_set_child(&mut self, params: &FloodTopoSetParams) -> bool {
        let child = &params.src_id;
        if !self.peers.contains(child) {
            warn!("Flood topology request from non-peer {}", child);
            return false;
        }
        self.neighbor(child).topo_sets_received += 1;

        let roots: Vec<NodeId> = if params.all_roots {
            self.trees.keys().cloned().collect()
        } else {
            vec![params.root_id.clone()]
        };

        let mut changed = false;
        for root in roots {
            let Some(tree) = self.trees.get_mut(&root) else {
                debug!("Flood topology request for unknown root {}", root);
                continue;
            };

            if !params.become_child {
                if tree.children.remove(child) {
                    root_entry(&mut self.counters, &root).children_removed += 1;
                    changed = true;
                }
                continue;
            }

            let child_cost = self
                .adverts
                .get(child)
                .and_then(|costs| costs.get(&root))
                .copied()
                .unwrap_or(MAX_COST);
            if tree.parent.as_ref() == Some(child) || child_cost <= tree.cost {
                warn!(
                    "Rejecting child {} for root {}: cost {} not above ours ({})",
                    child, root, child_cost, tree.cost
                );
                continue;
            }
            if tree.children.insert(child.clone()) {
                info!("Peer {} became child for root {}", child, root);
                root_entry(&mut self.counters, &root).children_added += 1;
                changed = true;
            }
        }
        changed
    }

    fn best_parent(&self, root: &NodeId) -> Option<(u32, NodeId)> {
        self.peers
            .iter()
            .filter_map(|peer| {
                let advertised = *self.adverts.get(peer)?.get(root)?;
                if advertised >= MAX_COST {
                    return None;
                }
                let cost = advertised.saturating_add(self.policy.link_cost(peer));
                (cost < MAX_COST).then_some((cost, peer))
            })
            .min()
            .map(|(cost, peer)| (cost, peer.clone()))
    }

    fn awaiting_adverts(&self) -> bool {
        self.peers.iter().any(|p| !self.adverts.contains_key(p))
    }

    /// Re-run parent selection for every known root and return the adverts
    /// and child (un)registrations to send.
    fn recompute(&mut self) -> Vec<TopoMessage> {
        let mut roots: BTreeSet<NodeId> = self
            .adverts
            .values()
            .flat_map(|costs| {
                costs
                    .iter()
                    .filter(|(_, cost)| **cost < MAX_COST)
                    .map(|(root, _)| root.clone())
            })
            .collect();
        roots.extend(self.trees.keys().cloned());
        if self.is_root_candidate {
            roots.insert(self.node_id.clone());
        }
        if let Some(root) = &self.root_override {
            roots.insert(root.clone());
        }

        let awaiting = self.awaiting_adverts();
        let mut registrations = Vec::new();

        for root in roots {
            let selected = if root == self.node_id {
                self.is_root_candidate.then(|| (0, self.node_id.clone()))
            } else {
                self.best_parent(&root)
            };
            let parent = selected.as_ref().map(|(_, p)| p.clone());
            let previous = self.trees.get(&root).and_then(|t| t.parent.clone());

            if previous != parent {
                if parent.is_some() {
                    root_entry(&mut self.counters, &root).parent_changes += 1;
                }
                let old = previous.filter(|p| *p != self.node_id && self.peers.contains(p));
                if let Some(old) = old {
                    registrations.push((old, self.set_child(&root, false)));
                }
                if let Some(new) = parent.clone().filter(|p| *p != self.node_id) {
                    debug!("Root {}: parent now {}", root, new);
                    registrations.push((new, self.set_child(&root, true)));
                }
            }

            match selected {
                Some((cost, parent)) => {
                    let tree = self.trees.entry(root).or_insert_with(RootTree::new);
                    tree.cost = cost;
                    tree.parent = Some(parent);
                    tree.state = SptState::Stable;
                }
                None if self.root_override.as_ref() == Some(&root) => {
                    let tree = self.trees.entry(root).or_insert_with(RootTree::new);
                    tree.cost = MAX_COST;
                    tree.parent = None;
                    tree.state = if awaiting {
                        SptState::Computing
                    } else {
                        SptState::NoRoot
                    };
                }
                None => {
                    self.counters.root_counters.remove(&root);
                    if self.trees.remove(&root).is_some() {
                        debug!("Root {} unreachable", root);
                    }
                }
            }
        }

        let mut messages = Vec::new();
        for peer in &self.peers {
            let costs: Vec<RootCost> = self
                .trees
                .iter()
                .filter(|(_, tree)| tree.parent.is_some())
                .map(|(root, tree)| RootCost {
                    root_id: root.clone(),
                    cost: if tree.parent.as_ref() == Some(peer) {
                        MAX_COST
                    } else {
                        tree.cost
                    },
                })
                .collect();
            if self.advertised.get(peer) != Some(&costs) {
                self.advertised.insert(peer.clone(), costs.clone());
                messages.push((peer.clone(), MessageBody::TopologyAdvert { costs }));
            }
        }

        // Adverts first so a new parent sees our poisoned cost before the
        // registration.
        messages.extend(registrations);
        for (peer, body) in &messages {
            let counters = self.neighbor(peer);
            match body {
                MessageBody::TopologyAdvert { .. } => counters.adverts_sent += 1,
                MessageBody::FloodTopoSet(_) => counters.topo_sets_sent += 1,
                _ => {}
            }
        }
        messages
    }

    fn neighbor(&mut self, peer: &NodeId) -> &mut NeighborCounters {
        self.counters.neighbor_counters.entry(peer.clone()).or_default()
    }

    fn set_child(&self, root: &NodeId, become_child: bool) -> MessageBody {
        MessageBody::FloodTopoSet(FloodTopoSetParams {
            root_id: root.clone(),
            src_id: self.node_id.clone(),
            become_child,
            all_roots: false,
        })
    }

    /// Root used for flooding: the override when its tree is stable,
    /// otherwise the smallest stable root.
    pub fn flood_root(&self) -> Option<NodeId> {
        if let Some(root) = &self.root_override {
            return self
                .trees
                .get(root)
                .filter(|tree| tree.state == SptState::Stable)
                .map(|_| root.clone());
        }
        self.trees
            .iter()
            .find(|(_, tree)| tree.state == SptState::Stable)
            .map(|(root, _)| root.clone())
    }

    /// Tree neighbors for the flood root, or `None` while the tree cannot be
    /// trusted (no stable root, or peers that have not advertised yet).
    pub fn flood_peers(&self) -> Option<BTreeSet<NodeId>> {
        if self.awaiting_adverts() {
            return None;
        }
        let root = self.flood_root()?;
        let tree = self.trees.get(&root)?;

        let mut peers: BTreeSet<NodeId> = tree
            .children
            .iter()
            .filter(|child| self.peers.contains(*child))
            .cloned()
            .collect();
        if let Some(parent) = &tree.parent {
            if *parent != self.node_id {
                peers.insert(parent.clone());
            }
        }
        Some(peers)
    }

    pub fn state(&self, root: &NodeId) -> SptState {
        self.trees
            .get(root)
            .map(|tree| tree.state)
            .unwrap_or(SptState::NoRoot)
    }

    pub fn peers(&self) -> &BTreeSet<NodeId> {
        &self.peers
    }

    pub fn info(&self) -> SptInfos {
        SptInfos {
            infos: self
                .trees
                .iter()
                .map(|(root, tree)| {
                    (
                        root.clone(),
                        SptInfo {
                            state: tree.state,
                            cost: tree.cost,
                            parent: tree.parent.clone(),
                            children: tree.children.clone(),
                        },
                    )
                })
                .collect(),
            counters: SptCounters {
                neighbor_counters: self.counters.neighbor_counters.clone(),
                root_counters: self
                    .counters
                    .root_counters
                    .iter()
                    .filter(|(root, _)| self.trees.contains_key(*root))
                    .map(|(root, counters)| (root.clone(), counters.clone()))
                    .collect(),
            },
            flood_root_id: self.flood_root(),
            flood_peers: self.flood_peers().unwrap_or_else(|| self.peers.clone()),
        }
    }
}

fn root_entry<'a>(counters: &'a mut SptCounters, root: &NodeId) -> &'a mut RootCounters {
    counters.root_counters.entry(root.clone()).or_default()
}
