use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Id of the root node on the core board. It is always allocated.
pub const ROOT_NODE_ID: &str = "core_main";

/// Stat name to summed value.
pub type StatMap = FxHashMap<String, f64>;

/// Newtype wrapper for node IDs. Stable across saves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this is the core board's root node.
    pub fn is_root(&self) -> bool {
        self.0 == ROOT_NODE_ID
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Integer grid coordinate on a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridPos {
    pub x: i32,
    pub y: i32,
}

impl GridPos {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// The four orthogonal neighbor cells (right, up, left, down).
    pub fn orthogonal_neighbors(&self) -> [GridPos; 4] {
        [
            GridPos::new(self.x + 1, self.y),
            GridPos::new(self.x, self.y - 1),
            GridPos::new(self.x - 1, self.y),
            GridPos::new(self.x, self.y + 1),
        ]
    }

    /// Returns true if `other` is exactly one step away on one axis.
    pub fn is_orthogonal_neighbor(&self, other: &GridPos) -> bool {
        (self.x - other.x).abs() + (self.y - other.y).abs() == 1
    }
}

impl fmt::Display for GridPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// The role a node plays on its board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Board anchor. The core board's main node is the tree root; on
    /// attached boards it is the entry node.
    Main,
    /// Pathing node with little or no payoff.
    Travel,
    /// Build-defining node, usually with drawbacks.
    Keystone,
    /// Large named bonus.
    Notable,
    /// Small incremental bonus.
    Small,
}

impl NodeKind {
    /// Single-character glyph used by text renderers.
    pub fn glyph(&self) -> char {
        match self {
            Self::Main => 'M',
            Self::Travel => 't',
            Self::Keystone => 'K',
            Self::Notable => 'N',
            Self::Small => 's',
        }
    }
}

/// Why a node cannot currently take another rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockReason {
    /// `current_rank == max_rank`.
    MaxRank,
    /// Fewer points available than the node's cost.
    InsufficientPoints,
    /// No allocated neighbor, and the node is neither root nor an active entry.
    NotAdjacent,
    /// The node's board is not part of the current configuration.
    BoardDetached,
    /// The configured allocated-node limit has been reached.
    NodeLimit,
}

/// The smallest allocatable unit of a tree.
///
/// Identity, cost and edges are fixed once the owning board is built.
/// Only the allocation engine changes `current_rank`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub position: GridPos,
    pub kind: NodeKind,
    /// Points per rank.
    pub cost: u32,
    pub max_rank: u32,
    pub connections: FxHashSet<NodeId>,
    /// Stat deltas applied once per rank.
    pub modifiers: StatMap,
    current_rank: u32,
}

impl Node {
    pub fn new(id: impl Into<String>, position: GridPos, kind: NodeKind, cost: u32, max_rank: u32) -> Self {
        Self {
            id: NodeId::new(id),
            position,
            kind,
            cost,
            max_rank: max_rank.max(1),
            connections: FxHashSet::default(),
            modifiers: StatMap::default(),
            current_rank: 0,
        }
    }

    pub fn with_modifier(mut self, stat: &str, value: f64) -> Self {
        self.modifiers.insert(stat.to_string(), value);
        self
    }

    pub fn current_rank(&self) -> u32 {
        self.current_rank
    }

    pub(crate) fn set_rank(&mut self, rank: u32) {
        self.current_rank = rank.min(self.max_rank);
    }

    pub fn is_root(&self) -> bool {
        self.id.is_root()
    }

    pub fn is_allocated(&self) -> bool {
        self.current_rank > 0
    }

    pub fn is_maxed(&self) -> bool {
        self.current_rank >= self.max_rank
    }

    /// Returns true if any neighbor of this node is in `allocated`.
    pub fn has_allocated_neighbor<'a, I>(&self, allocated: I) -> bool
    where
        I: IntoIterator<Item = &'a NodeId>,
    {
        allocated
            .into_iter()
            .any(|id| self.connections.contains(id))
    }

    /// Whether this node can take another rank right now.
    ///
    /// True iff the node is below max rank, `available_points` covers the
    /// cost, and the node is either the root or adjacent to an allocated node.
    pub fn can_allocate<'a, I>(&self, allocated: I, available_points: u32) -> bool
    where
        I: IntoIterator<Item = &'a NodeId>,
    {
        self.current_rank < self.max_rank
            && available_points >= self.cost
            && (self.is_root() || self.has_allocated_neighbor(allocated))
    }

    /// Every reason `can_allocate` would fail, in a stable order.
    ///
    /// When `is_entry` is set the adjacency requirement is waived, as for
    /// the entry node of a connected board.
    pub fn block_reasons<'a, I>(&self, allocated: I, available_points: u32, is_entry: bool) -> Vec<BlockReason>
    where
        I: IntoIterator<Item = &'a NodeId>,
    {
        let mut reasons = Vec::new();
        if self.current_rank >= self.max_rank {
            reasons.push(BlockReason::MaxRank);
        }
        if available_points < self.cost {
            reasons.push(BlockReason::InsufficientPoints);
        }
        if !is_entry && !self.is_root() && !self.has_allocated_neighbor(allocated) {
            reasons.push(BlockReason::NotAdjacent);
        }
        reasons
    }
}
