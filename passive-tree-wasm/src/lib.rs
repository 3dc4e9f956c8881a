//! WASM bindings for passive-tree — powers the interactive web planner.

use wasm_bindgen::prelude::*;

use passive_tree::core::config::EngineConfig;
use passive_tree::core::definition::TreeDefinition;
use passive_tree::core::engine::AllocationEngine;
use passive_tree::core::persistence::{CharacterId, MemoryStore, PlayerStore};
use passive_tree::core::state::PlayerSnapshot;
use passive_tree::core::tree::Tree;
use passive_tree::schema::board::Board;
use passive_tree::schema::node::{BlockReason, Node};

// ---------------------------------------------------------------------------
// Embedded tree data — compiled into the WASM binary
// ---------------------------------------------------------------------------
mod data {
    pub const DEFAULT_TREE: &str = include_str!("../../tree_data/default_tree.ron");
}

const WEB_CHARACTER: &str = "web";

// ---------------------------------------------------------------------------
// JSON helper types for communication across the WASM boundary
// ---------------------------------------------------------------------------
#[derive(serde::Serialize)]
struct NodeInfo {
    id: String,
    x: i32,
    y: i32,
    kind: String,
    cost: u32,
    rank: u32,
    max_rank: u32,
    connections: Vec<String>,
    modifiers: Vec<(String, f64)>,
}

#[derive(serde::Serialize)]
struct ExtensionPointInfo {
    id: String,
    x: i32,
    y: i32,
    occupied_by: Option<String>,
}

#[derive(serde::Serialize)]
struct BoardInfo {
    id: String,
    kind: String,
    width: u32,
    height: u32,
    active: bool,
    nodes: Vec<NodeInfo>,
    extension_points: Vec<ExtensionPointInfo>,
}

#[derive(serde::Serialize)]
struct ConnectionInfo {
    extension_point: String,
    board: String,
}

fn js_err(context: &str, e: impl std::fmt::Display) -> JsError {
    JsError::new(&format!("{context}: {e}"))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, JsError> {
    serde_json::to_string(value).map_err(|e| js_err("Serialization error", e))
}

fn node_info(node: &Node) -> NodeInfo {
    let mut connections: Vec<String> = node.connections.iter().map(|c| c.to_string()).collect();
    connections.sort();
    let mut modifiers: Vec<(String, f64)> = node
        .modifiers
        .iter()
        .map(|(stat, value)| (stat.clone(), *value))
        .collect();
    modifiers.sort_by(|a, b| a.0.cmp(&b.0));
    NodeInfo {
        id: node.id.to_string(),
        x: node.position.x,
        y: node.position.y,
        kind: format!("{:?}", node.kind),
        cost: node.cost,
        rank: node.current_rank(),
        max_rank: node.max_rank,
        connections,
        modifiers,
    }
}

fn reason_label(reason: &BlockReason) -> &'static str {
    match reason {
        BlockReason::MaxRank => "max_rank",
        BlockReason::InsufficientPoints => "insufficient_points",
        BlockReason::NotAdjacent => "not_adjacent",
        BlockReason::BoardDetached => "board_detached",
        BlockReason::NodeLimit => "node_limit",
    }
}

// ---------------------------------------------------------------------------
// TreeSession — the main exported struct
// ---------------------------------------------------------------------------
#[wasm_bindgen]
pub struct TreeSession {
    engine: AllocationEngine,
}

#[wasm_bindgen]
impl TreeSession {
    /// Start a fresh session on the built-in tree.
    ///
    /// `config_ron` may be empty for defaults, or an engine config in RON.
    #[wasm_bindgen(constructor)]
    pub fn new(config_ron: &str) -> Result<TreeSession, JsError> {
        Self::start(config_ron, None)
    }

    /// Resume a session from JSON produced by [`TreeSession::export_progress`].
    pub fn restore(config_ron: &str, progress_json: &str) -> Result<TreeSession, JsError> {
        let snapshot: PlayerSnapshot =
            serde_json::from_str(progress_json).map_err(|e| js_err("Invalid progress JSON", e))?;
        Self::start(config_ron, Some(snapshot))
    }

    /// Raise a node by one rank. Returns the new rank.
    pub fn allocate(&mut self, node_id: &str) -> Result<u32, JsError> {
        self.engine
            .allocate_node(node_id)
            .map_err(|e| js_err("Allocation failed", e))
    }

    pub fn deallocate(&mut self, node_id: &str) -> Result<(), JsError> {
        self.engine
            .deallocate_node(node_id)
            .map_err(|e| js_err("Deallocation failed", e))
    }

    pub fn can_allocate(&self, node_id: &str) -> bool {
        self.engine.can_allocate_node(node_id)
    }

    /// JSON array of reasons the node cannot be allocated; empty when it can.
    pub fn blockers(&self, node_id: &str) -> Result<String, JsError> {
        let reasons = self
            .engine
            .allocation_blockers(node_id)
            .map_err(|e| js_err("Lookup failed", e))?;
        let labels: Vec<&str> = reasons.iter().map(reason_label).collect();
        to_json(&labels)
    }

    pub fn connect_board(&mut self, extension_point: &str, board_id: &str) -> Result<(), JsError> {
        self.engine
            .connect_board(extension_point, board_id)
            .map_err(|e| js_err("Connect failed", e))
    }

    pub fn disconnect_board(&mut self, board_id: &str) -> Result<(), JsError> {
        self.engine
            .disconnect_board(board_id)
            .map_err(|e| js_err("Disconnect failed", e))
    }

    /// JSON object of stat name to total.
    pub fn stats(&mut self) -> Result<String, JsError> {
        let stats = self
            .engine
            .current_stats()
            .map_err(|e| js_err("Stat calculation failed", e))?;
        let sorted: std::collections::BTreeMap<&String, &f64> = stats.iter().collect();
        to_json(&sorted)
    }

    pub fn available_points(&self) -> u32 {
        self.engine.available_points()
    }

    pub fn set_unlimited_points(&mut self, enabled: bool) {
        self.engine.set_unlimited_points(enabled);
    }

    /// JSON description of one board, including node ranks.
    pub fn board(&self, board_id: &str) -> Result<String, JsError> {
        let board = self
            .engine
            .find_board_by_id(board_id)
            .ok_or_else(|| JsError::new(&format!("Unknown board: {board_id}")))?;
        to_json(&self.board_info(board))
    }

    /// JSON array of every board, core first.
    pub fn boards(&self) -> Result<String, JsError> {
        let infos: Vec<BoardInfo> = self
            .engine
            .tree()
            .boards()
            .into_iter()
            .map(|b| self.board_info(b))
            .collect();
        to_json(&infos)
    }

    /// JSON array of current board connections.
    pub fn connections(&self) -> Result<String, JsError> {
        let infos: Vec<ConnectionInfo> = self
            .engine
            .connected_boards()
            .iter()
            .map(|c| ConnectionInfo {
                extension_point: c.extension_point_id.clone(),
                board: c.board_id.to_string(),
            })
            .collect();
        to_json(&infos)
    }

    /// Current progress as JSON, suitable for [`TreeSession::restore`].
    pub fn export_progress(&self) -> Result<String, JsError> {
        to_json(&self.engine.player().snapshot())
    }

    pub fn reset(&mut self) -> Result<(), JsError> {
        self.engine
            .reset_progress()
            .map_err(|e| js_err("Reset failed", e))
    }
}

// Private helpers
impl TreeSession {
    fn start(config_ron: &str, snapshot: Option<PlayerSnapshot>) -> Result<TreeSession, JsError> {
        let config = if config_ron.trim().is_empty() {
            EngineConfig::default()
        } else {
            EngineConfig::parse_ron(config_ron).map_err(|e| js_err("Config parse error", e))?
        };

        let mut store = MemoryStore::new();
        if let Some(snapshot) = snapshot {
            store
                .save(&CharacterId::from(WEB_CHARACTER), &snapshot)
                .map_err(|e| js_err("Progress error", e))?;
        }

        let definition = TreeDefinition::parse_ron(data::DEFAULT_TREE)
            .map_err(|e| js_err("Tree parse error", e))?;
        let tree = Tree::from_definition(&definition)
            .map_err(|e| js_err("Tree build error", e))?;

        let engine = AllocationEngine::builder()
            .tree(tree)
            .config(config)
            .character(WEB_CHARACTER)
            .store(Box::new(store))
            .board_builder(Box::new(definition))
            .build_ready()
            .map_err(|e| js_err("Engine build error", e))?;

        Ok(TreeSession { engine })
    }

    fn board_info(&self, board: &Board) -> BoardInfo {
        let connections = self.engine.connected_boards();
        BoardInfo {
            id: board.id.to_string(),
            kind: format!("{:?}", board.kind),
            width: board.size.width,
            height: board.size.height,
            active: self.engine.tree().is_board_active(board.id.as_str(), connections),
            nodes: board.nodes_sorted().into_iter().map(node_info).collect(),
            extension_points: board
                .extension_points
                .iter()
                .map(|p| ExtensionPointInfo {
                    id: p.id.clone(),
                    x: p.position.x,
                    y: p.position.y,
                    occupied_by: connections
                        .iter()
                        .find(|c| c.extension_point_id == p.id)
                        .map(|c| c.board_id.to_string()),
                })
                .collect(),
        }
    }
}
