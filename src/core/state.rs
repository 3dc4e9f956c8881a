/// Per-character progress: the allocation ledger, the point economy,
/// attached boards, and the cached stat totals.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::schema::board::BoardId;
use crate::schema::connection::BoardConnection;
use crate::schema::node::{NodeId, StatMap};

/// Ledger entry for one allocated node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub rank: u32,
    /// Points actually deducted for this node across all ranks.
    pub spent: u32,
}

/// Serialized form of a [`PlayerState`]. Cached stats are not stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub allocations: Vec<SavedAllocation>,
    pub available_points: u32,
    #[serde(default)]
    pub board_connections: Vec<BoardConnection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedAllocation {
    pub node_id: NodeId,
    pub rank: u32,
    pub spent: u32,
}

#[derive(Debug, Clone)]
pub struct PlayerState {
    allocations: FxHashMap<NodeId, Allocation>,
    available_points: u32,
    initial_points: u32,
    point_cap: Option<u32>,
    board_connections: Vec<BoardConnection>,
    stats_dirty: bool,
    cached_stats: StatMap,
}

impl PlayerState {
    pub fn new(initial_points: u32) -> Self {
        Self {
            allocations: FxHashMap::default(),
            available_points: initial_points,
            initial_points,
            point_cap: None,
            board_connections: Vec::new(),
            stats_dirty: true,
            cached_stats: StatMap::default(),
        }
    }

    /// Cap refunds so `available_points` never exceeds `cap`.
    pub fn with_point_cap(mut self, cap: Option<u32>) -> Self {
        self.point_cap = cap;
        self
    }

    /// Restore a saved state. The cache starts dirty.
    pub fn from_snapshot(snapshot: PlayerSnapshot, initial_points: u32, point_cap: Option<u32>) -> Self {
        let allocations = snapshot
            .allocations
            .into_iter()
            .filter(|a| a.rank > 0)
            .map(|a| {
                (
                    a.node_id,
                    Allocation {
                        rank: a.rank,
                        spent: a.spent,
                    },
                )
            })
            .collect();
        Self {
            allocations,
            available_points: snapshot.available_points,
            initial_points,
            point_cap,
            board_connections: snapshot.board_connections,
            stats_dirty: true,
            cached_stats: StatMap::default(),
        }
    }

    /// Capture the persistent part of this state, sorted by node id.
    pub fn snapshot(&self) -> PlayerSnapshot {
        let mut allocations: Vec<SavedAllocation> = self
            .allocations
            .iter()
            .map(|(id, a)| SavedAllocation {
                node_id: id.clone(),
                rank: a.rank,
                spent: a.spent,
            })
            .collect();
        allocations.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        PlayerSnapshot {
            allocations,
            available_points: self.available_points,
            board_connections: self.board_connections.clone(),
        }
    }

    // --- Ledger ---

    /// Allocate the first rank of a node. Fails without mutating if the
    /// node is already allocated or `cost` exceeds the available points.
    pub fn allocate_node(&mut self, id: &NodeId, cost: u32) -> bool {
        if self.allocations.contains_key(id) || self.available_points < cost {
            return false;
        }
        self.available_points -= cost;
        self.allocations
            .insert(id.clone(), Allocation { rank: 1, spent: cost });
        self.stats_dirty = true;
        true
    }

    /// Add one rank to an allocated node. Rank limits are the caller's concern.
    pub fn rank_up(&mut self, id: &NodeId, cost: u32) -> bool {
        if self.available_points < cost {
            return false;
        }
        let Some(allocation) = self.allocations.get_mut(id) else {
            return false;
        };
        allocation.rank += 1;
        allocation.spent += cost;
        self.available_points -= cost;
        self.stats_dirty = true;
        true
    }

    /// Remove a node from the ledger and refund what was spent on it,
    /// clamped to the point cap if one is set.
    pub fn deallocate_node(&mut self, id: &NodeId) -> bool {
        let Some(allocation) = self.allocations.remove(id) else {
            return false;
        };
        self.credit(allocation.spent);
        self.stats_dirty = true;
        true
    }

    fn credit(&mut self, points: u32) {
        let total = self.available_points.saturating_add(points);
        self.available_points = match self.point_cap {
            Some(cap) => total.min(cap.max(self.available_points)),
            None => total,
        };
    }

    pub fn is_allocated(&self, id: &str) -> bool {
        self.allocations.contains_key(id)
    }

    pub fn allocation(&self, id: &str) -> Option<&Allocation> {
        self.allocations.get(id)
    }

    pub fn allocations(&self) -> impl Iterator<Item = (&NodeId, &Allocation)> {
        self.allocations.iter()
    }

    pub fn allocated_node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.allocations.keys()
    }

    pub fn allocated_count(&self) -> usize {
        self.allocations.len()
    }

    pub fn available_points(&self) -> u32 {
        self.available_points
    }

    pub fn initial_points(&self) -> u32 {
        self.initial_points
    }

    pub fn point_cap(&self) -> Option<u32> {
        self.point_cap
    }

    /// Cap a node's rank at `max_rank`, keeping what was spent on it.
    /// Returns the previous rank when it had to be lowered.
    pub fn clamp_rank(&mut self, id: &str, max_rank: u32) -> Option<u32> {
        let allocation = self.allocations.get_mut(id)?;
        if allocation.rank <= max_rank {
            return None;
        }
        let previous = allocation.rank;
        allocation.rank = max_rank.max(1);
        self.stats_dirty = true;
        Some(previous)
    }

    /// Points currently locked in the ledger.
    pub fn spent_points(&self) -> u32 {
        self.allocations.values().map(|a| a.spent).sum()
    }

    // --- Board connections ---

    /// Attach a board at an extension point. Fails if the slot is taken or
    /// the board is already attached somewhere.
    pub fn connect_board(&mut self, extension_point_id: &str, board_id: &str) -> bool {
        if self.connection_at(extension_point_id).is_some() || self.is_board_connected(board_id) {
            return false;
        }
        self.board_connections
            .push(BoardConnection::new(extension_point_id, board_id));
        self.stats_dirty = true;
        true
    }

    /// Detach a board, returning the removed connection.
    pub fn disconnect_board(&mut self, board_id: &str) -> Option<BoardConnection> {
        let index = self
            .board_connections
            .iter()
            .position(|c| c.board_id.as_str() == board_id)?;
        self.stats_dirty = true;
        Some(self.board_connections.remove(index))
    }

    /// Detach every board at once, returning the connections in the order
    /// they were made.
    pub fn take_board_connections(&mut self) -> Vec<BoardConnection> {
        self.stats_dirty = true;
        std::mem::take(&mut self.board_connections)
    }

    pub fn board_connections(&self) -> &[BoardConnection] {
        &self.board_connections
    }

    pub fn connection_at(&self, extension_point_id: &str) -> Option<&BoardConnection> {
        self.board_connections
            .iter()
            .find(|c| c.extension_point_id == extension_point_id)
    }

    pub fn is_board_connected(&self, board_id: &str) -> bool {
        self.board_connections
            .iter()
            .any(|c| c.board_id.as_str() == board_id)
    }

    pub fn connected_board_ids(&self) -> impl Iterator<Item = &BoardId> {
        self.board_connections.iter().map(|c| &c.board_id)
    }

    // --- Stat cache ---

    /// Store freshly computed totals and clear the dirty flag.
    pub fn update_cached_stats(&mut self, stats: StatMap) {
        self.cached_stats = stats;
        self.stats_dirty = false;
    }

    /// Only trustworthy when [`PlayerState::are_stats_dirty`] is false.
    pub fn cached_stats(&self) -> &StatMap {
        &self.cached_stats
    }

    pub fn are_stats_dirty(&self) -> bool {
        self.stats_dirty
    }

    /// Clear all allocations and connections and restore the initial budget.
    pub fn reset(&mut self) {
        self.allocations.clear();
        self.board_connections.clear();
        self.available_points = self.initial_points;
        self.cached_stats.clear();
        self.stats_dirty = true;
    }
}
