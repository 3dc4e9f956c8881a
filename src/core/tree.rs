/// The tree aggregate: one core board plus every known extension and
/// keystone board, with global id lookup and stat aggregation.

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::core::definition::{BoardBuilder, TreeDefinition};
use crate::core::state::PlayerState;
use crate::schema::board::{Board, BoardError, BoardId, BoardKind};
use crate::schema::connection::BoardConnection;
use crate::schema::node::{Node, NodeId, NodeKind, StatMap, ROOT_NODE_ID};

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("node id '{node}' appears on both '{first}' and '{second}'")]
    DuplicateNodeId {
        node: NodeId,
        first: BoardId,
        second: BoardId,
    },
    #[error("extension point '{point}' appears on both '{first}' and '{second}'")]
    DuplicateExtensionPoint {
        point: String,
        first: BoardId,
        second: BoardId,
    },
    #[error("board id '{0}' is defined more than once")]
    DuplicateBoardId(BoardId),
    #[error("core board '{0}' has no 'core_main' node")]
    MissingRoot(BoardId),
    #[error("board '{0}' has the wrong kind for its slot")]
    CoreBoardKind(BoardId),
    #[error("board error: {0}")]
    Board(#[from] BoardError),
}

#[derive(Debug, Clone)]
pub struct Tree {
    core: Board,
    boards: FxHashMap<BoardId, Board>,
    node_index: FxHashMap<NodeId, BoardId>,
    max_connected_boards: usize,
}

impl Tree {
    /// Assemble a tree. The core board may be empty (see
    /// [`Tree::ensure_initialized`]); otherwise it must hold the root node.
    pub fn new(core: Board, boards: Vec<Board>, max_connected_boards: usize) -> Result<Tree, TreeError> {
        if core.kind != BoardKind::Core {
            return Err(TreeError::CoreBoardKind(core.id));
        }
        if !core.is_empty() && !core.contains_node(ROOT_NODE_ID) {
            return Err(TreeError::MissingRoot(core.id));
        }

        let mut by_id = FxHashMap::default();
        for board in boards {
            if board.kind == BoardKind::Core {
                return Err(TreeError::CoreBoardKind(board.id));
            }
            if board.id == core.id || by_id.contains_key(&board.id) {
                return Err(TreeError::DuplicateBoardId(board.id));
            }
            by_id.insert(board.id.clone(), board);
        }

        let node_index = build_index(&core, &by_id)?;
        Ok(Tree {
            core,
            boards: by_id,
            node_index,
            max_connected_boards,
        })
    }

    /// Build every board of a definition into a tree.
    pub fn from_definition(def: &TreeDefinition) -> Result<Tree, TreeError> {
        let core = def.core.build()?;
        let boards = def
            .boards
            .iter()
            .map(|b| b.build())
            .collect::<Result<Vec<_>, _>>()?;
        Tree::new(core, boards, def.max_connected_boards)
    }

    /// The default tree compiled into the crate.
    pub fn builtin() -> Result<Tree, TreeError> {
        Tree::from_definition(&TreeDefinition::builtin()?)
    }

    /// Regenerate the core board if it has no nodes. Idempotent; returns
    /// true when a repair happened.
    pub fn ensure_initialized(&mut self, builder: &dyn BoardBuilder) -> Result<bool, TreeError> {
        if !self.core.is_empty() {
            return Ok(false);
        }
        let core = builder.build_core_board()?;
        if core.kind != BoardKind::Core {
            return Err(TreeError::CoreBoardKind(core.id));
        }
        if !core.contains_node(ROOT_NODE_ID) {
            return Err(TreeError::MissingRoot(core.id));
        }
        let node_index = build_index(&core, &self.boards)?;
        tracing::info!(board = %core.id, nodes = core.node_count(), "regenerated empty core board");
        self.core = core;
        self.node_index = node_index;
        Ok(true)
    }

    pub fn core_board(&self) -> &Board {
        &self.core
    }

    pub fn max_connected_boards(&self) -> usize {
        self.max_connected_boards
    }

    pub fn root(&self) -> Option<&Node> {
        self.core.node(ROOT_NODE_ID)
    }

    /// Core board first, then the others sorted by id.
    pub fn boards(&self) -> Vec<&Board> {
        let mut others: Vec<&Board> = self.boards.values().collect();
        others.sort_by(|a, b| a.id.cmp(&b.id));
        std::iter::once(&self.core).chain(others).collect()
    }

    pub fn find_board_by_id(&self, id: &str) -> Option<&Board> {
        if self.core.id.as_str() == id {
            Some(&self.core)
        } else {
            self.boards.get(id)
        }
    }

    fn board_mut(&mut self, id: &str) -> Option<&mut Board> {
        if self.core.id.as_str() == id {
            Some(&mut self.core)
        } else {
            self.boards.get_mut(id)
        }
    }

    pub fn find_node_by_id(&self, id: &str) -> Option<&Node> {
        let board = self.node_index.get(id)?;
        self.find_board_by_id(board.as_str())?.node(id)
    }

    pub(crate) fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        let board = self.node_index.get(id)?.clone();
        self.board_mut(board.as_str())?.node_mut(id)
    }

    /// The board that owns a node.
    pub fn board_of_node(&self, id: &str) -> Option<&BoardId> {
        self.node_index.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.node_index.len()
    }

    /// The core board is always active; others only while connected.
    pub fn is_board_active(&self, board_id: &str, connections: &[BoardConnection]) -> bool {
        self.core.id.as_str() == board_id
            || connections.iter().any(|c| c.board_id.as_str() == board_id)
    }

    pub fn is_node_active(&self, node_id: &str, connections: &[BoardConnection]) -> bool {
        self.board_of_node(node_id)
            .is_some_and(|b| self.is_board_active(b.as_str(), connections))
    }

    /// Core board first, then connected boards in connection order.
    pub fn active_boards(&self, connections: &[BoardConnection]) -> Vec<&Board> {
        std::iter::once(&self.core)
            .chain(
                connections
                    .iter()
                    .filter_map(|c| self.boards.get(c.board_id.as_str())),
            )
            .collect()
    }

    /// True for a `Main` node on a connected non-core board.
    pub fn is_entry_node(&self, node_id: &str, connections: &[BoardConnection]) -> bool {
        let Some(board_id) = self.board_of_node(node_id) else {
            return false;
        };
        if *board_id == self.core.id || !self.is_board_active(board_id.as_str(), connections) {
            return false;
        }
        self.find_node_by_id(node_id)
            .is_some_and(|n| n.kind == NodeKind::Main)
    }

    /// The board that owns an extension point among the active boards.
    pub fn extension_point_host(&self, point_id: &str, connections: &[BoardConnection]) -> Option<&Board> {
        self.active_boards(connections)
            .into_iter()
            .find(|b| b.extension_point(point_id).is_some())
    }

    /// Sum the modifiers of every allocated node on an active board.
    ///
    /// Each modifier counts once per rank. Allocations on boards that are
    /// currently detached stay in the ledger but contribute nothing.
    pub fn total_stats(&self, state: &PlayerState) -> StatMap {
        let connections = state.board_connections();
        let mut totals = StatMap::default();
        for (id, allocation) in state.allocations() {
            if !self.is_node_active(id.as_str(), connections) {
                continue;
            }
            let Some(node) = self.find_node_by_id(id.as_str()) else {
                continue;
            };
            for (stat, value) in &node.modifiers {
                *totals.entry(stat.clone()).or_insert(0.0) += value * f64::from(allocation.rank);
            }
        }
        totals
    }

    /// Make every node's rank mirror the ledger.
    pub(crate) fn sync_ranks(&mut self, state: &PlayerState) {
        self.core.reset_ranks();
        for board in self.boards.values_mut() {
            board.reset_ranks();
        }
        for (id, allocation) in state.allocations() {
            if let Some(node) = self.node_mut(id.as_str()) {
                node.set_rank(allocation.rank);
            }
        }
    }
}

/// Map every node id to its board. Node ids and extension point ids must be
/// unique across the whole tree.
fn build_index(core: &Board, boards: &FxHashMap<BoardId, Board>) -> Result<FxHashMap<NodeId, BoardId>, TreeError> {
    let mut index: FxHashMap<NodeId, BoardId> = FxHashMap::default();
    let mut points: FxHashMap<&str, &BoardId> = FxHashMap::default();
    for board in std::iter::once(core).chain(boards.values()) {
        for node in board.nodes() {
            if let Some(first) = index.get(&node.id) {
                return Err(TreeError::DuplicateNodeId {
                    node: node.id.clone(),
                    first: first.clone(),
                    second: board.id.clone(),
                });
            }
            index.insert(node.id.clone(), board.id.clone());
        }
        for point in &board.extension_points {
            if let Some(first) = points.insert(point.id.as_str(), &board.id) {
                return Err(TreeError::DuplicateExtensionPoint {
                    point: point.id.clone(),
                    first: first.clone(),
                    second: board.id.clone(),
                });
            }
        }
    }
    Ok(index)
}
