use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

use super::node::{GridPos, Node, NodeId, NodeKind};

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("board '{board}': two nodes at {position}")]
    DuplicatePosition { board: BoardId, position: GridPos },
    #[error("board '{board}': node '{node}' at {position} is outside the {size} grid")]
    OutOfBounds {
        board: BoardId,
        node: String,
        position: GridPos,
        size: BoardSize,
    },
    #[error("board '{board}': duplicate node id '{node}'")]
    DuplicateNodeId { board: BoardId, node: NodeId },
    #[error("board '{board}': edge {from} -> {to} targets a node that is not on this board")]
    UnknownConnection { board: BoardId, from: NodeId, to: NodeId },
    #[error("board '{board}': edge {from} -> {to} has no reverse edge")]
    AsymmetricConnection { board: BoardId, from: NodeId, to: NodeId },
    #[error("board '{board}': node '{node}' is connected to itself")]
    SelfConnection { board: BoardId, node: NodeId },
    #[error("board '{board}': node '{node}' has no connections")]
    OrphanNode { board: BoardId, node: NodeId },
    #[error("board '{board}': duplicate extension point '{point}'")]
    DuplicateExtensionPoint { board: BoardId, point: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
}

/// Newtype wrapper for board IDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoardId(pub String);

impl BoardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for BoardId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BoardId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for BoardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoardKind {
    Core,
    Extension,
    Keystone,
}

/// Grid dimensions in cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoardSize {
    pub width: u32,
    pub height: u32,
}

impl BoardSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn contains(&self, pos: GridPos) -> bool {
        pos.x >= 0 && pos.y >= 0 && (pos.x as u32) < self.width && (pos.y as u32) < self.height
    }
}

impl fmt::Display for BoardSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A named slot where another board may be attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionPoint {
    pub id: String,
    pub position: GridPos,
}

/// A fixed-size grid of optional nodes plus named attachment slots.
#[derive(Debug, Clone)]
pub struct Board {
    pub id: BoardId,
    pub kind: BoardKind,
    pub size: BoardSize,
    nodes: FxHashMap<GridPos, Node>,
    positions: FxHashMap<NodeId, GridPos>,
    pub extension_points: Vec<ExtensionPoint>,
}

impl Board {
    pub fn new(id: impl Into<String>, kind: BoardKind, size: BoardSize) -> Self {
        Self {
            id: BoardId::new(id),
            kind,
            size,
            nodes: FxHashMap::default(),
            positions: FxHashMap::default(),
            extension_points: Vec::new(),
        }
    }

    /// Place a node on the grid. Fails on a taken cell, a reused id, or a
    /// position outside the grid.
    pub fn insert_node(&mut self, node: Node) -> Result<(), BoardError> {
        if !self.size.contains(node.position) {
            return Err(BoardError::OutOfBounds {
                board: self.id.clone(),
                node: node.id.to_string(),
                position: node.position,
                size: self.size,
            });
        }
        if self.nodes.contains_key(&node.position) {
            return Err(BoardError::DuplicatePosition {
                board: self.id.clone(),
                position: node.position,
            });
        }
        if self.positions.contains_key(&node.id) {
            return Err(BoardError::DuplicateNodeId {
                board: self.id.clone(),
                node: node.id,
            });
        }
        self.positions.insert(node.id.clone(), node.position);
        self.nodes.insert(node.position, node);
        Ok(())
    }

    /// Add an undirected edge between two distinct nodes already on this
    /// board.
    pub fn connect(&mut self, a: &str, b: &str) -> Result<(), BoardError> {
        if a == b {
            return Err(BoardError::SelfConnection {
                board: self.id.clone(),
                node: NodeId::from(a),
            });
        }
        let (Some(&pa), Some(&pb)) = (self.positions.get(a), self.positions.get(b)) else {
            return Err(BoardError::UnknownConnection {
                board: self.id.clone(),
                from: NodeId::from(a),
                to: NodeId::from(b),
            });
        };
        if let Some(node) = self.nodes.get_mut(&pa) {
            node.connections.insert(NodeId::from(b));
        }
        if let Some(node) = self.nodes.get_mut(&pb) {
            node.connections.insert(NodeId::from(a));
        }
        Ok(())
    }

    pub fn add_extension_point(&mut self, id: impl Into<String>, position: GridPos) -> Result<(), BoardError> {
        let id = id.into();
        if self.extension_point(&id).is_some() {
            return Err(BoardError::DuplicateExtensionPoint {
                board: self.id.clone(),
                point: id,
            });
        }
        if !self.size.contains(position) {
            return Err(BoardError::OutOfBounds {
                board: self.id.clone(),
                node: id,
                position,
                size: self.size,
            });
        }
        self.extension_points.push(ExtensionPoint { id, position });
        Ok(())
    }

    pub fn extension_point(&self, id: &str) -> Option<&ExtensionPoint> {
        self.extension_points.iter().find(|p| p.id == id)
    }

    pub fn node_at(&self, pos: GridPos) -> Option<&Node> {
        self.nodes.get(&pos)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.positions.get(id).and_then(|pos| self.nodes.get(pos))
    }

    pub(crate) fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        let pos = *self.positions.get(id)?;
        self.nodes.get_mut(&pos)
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Nodes sorted row-major, for stable display and iteration order.
    pub fn nodes_sorted(&self) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self.nodes.values().collect();
        nodes.sort_by_key(|n| (n.position.y, n.position.x));
        nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes of kind `Main`: the root on the core board, entries elsewhere.
    pub fn main_nodes(&self) -> Vec<&Node> {
        self.nodes_sorted()
            .into_iter()
            .filter(|n| n.kind == NodeKind::Main)
            .collect()
    }

    pub(crate) fn reset_ranks(&mut self) {
        for node in self.nodes.values_mut() {
            node.set_rank(0);
        }
    }

    /// Check the structural invariants. Edges must stay on the board and be
    /// symmetric; only `Main` nodes may stand without an edge to another
    /// node.
    pub fn validate(&self) -> Result<(), BoardError> {
        for node in self.nodes_sorted() {
            for target in &node.connections {
                let Some(other) = self.node(target.as_str()) else {
                    return Err(BoardError::UnknownConnection {
                        board: self.id.clone(),
                        from: node.id.clone(),
                        to: target.clone(),
                    });
                };
                if !other.connections.contains(&node.id) {
                    return Err(BoardError::AsymmetricConnection {
                        board: self.id.clone(),
                        from: node.id.clone(),
                        to: target.clone(),
                    });
                }
            }
            let isolated = node.connections.iter().all(|c| *c == node.id);
            if isolated && node.kind != NodeKind::Main {
                return Err(BoardError::OrphanNode {
                    board: self.id.clone(),
                    node: node.id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Edges whose endpoints are not orthogonal grid neighbors, each
    /// reported once as `(lower id, higher id)`.
    pub fn non_orthogonal_edges(&self) -> Vec<(NodeId, NodeId)> {
        let mut edges = Vec::new();
        for node in self.nodes_sorted() {
            for target in &node.connections {
                if node.id >= *target {
                    continue;
                }
                if let Some(other) = self.node(target.as_str()) {
                    if !node.position.is_orthogonal_neighbor(&other.position) {
                        edges.push((node.id.clone(), target.clone()));
                    }
                }
            }
        }
        edges.sort();
        edges
    }

    /// Breadth-first walk over edges from `starts`, visiting only nodes for
    /// which `passable` holds. Start nodes are always included.
    pub fn reachable_from<'a, I, F>(&self, starts: I, mut passable: F) -> FxHashSet<NodeId>
    where
        I: IntoIterator<Item = &'a NodeId>,
        F: FnMut(&Node) -> bool,
    {
        let mut seen = FxHashSet::default();
        let mut queue = VecDeque::new();
        for start in starts {
            if self.contains_node(start.as_str()) && seen.insert(start.clone()) {
                queue.push_back(start.clone());
            }
        }
        while let Some(id) = queue.pop_front() {
            let Some(node) = self.node(id.as_str()) else {
                continue;
            };
            for next in &node.connections {
                if seen.contains(next) {
                    continue;
                }
                if let Some(n) = self.node(next.as_str()) {
                    if passable(n) {
                        seen.insert(next.clone());
                        queue.push_back(next.clone());
                    }
                }
            }
        }
        seen
    }

    /// Nodes that cannot be reached from any `Main` node, sorted by id.
    pub fn unreachable_nodes(&self) -> Vec<NodeId> {
        let starts: Vec<NodeId> = self.main_nodes().into_iter().map(|n| n.id.clone()).collect();
        let reached = self.reachable_from(&starts, |_| true);
        let mut missing: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| !reached.contains(&n.id))
            .map(|n| n.id.clone())
            .collect();
        missing.sort();
        missing
    }
}
