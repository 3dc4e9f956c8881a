/// Static board and tree definitions, and construction of boards from them.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::schema::board::{Board, BoardError, BoardKind, BoardSize};
use crate::schema::node::{GridPos, Node, NodeKind, StatMap};

/// The tree that ships with the crate.
const BUILTIN_TREE: &str = include_str!("../../tree_data/default_tree.ron");

fn default_max_rank() -> u32 {
    1
}

fn default_max_connected_boards() -> usize {
    4
}

/// Design-time description of one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    pub position: GridPos,
    pub kind: NodeKind,
    #[serde(default)]
    pub cost: u32,
    #[serde(default = "default_max_rank")]
    pub max_rank: u32,
    #[serde(default)]
    pub modifiers: StatMap,
}

/// A named attachment slot in a board definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionPointDefinition {
    pub id: String,
    pub position: GridPos,
}

/// Design-time description of one board. Edges are undirected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardDefinition {
    pub id: String,
    pub kind: BoardKind,
    pub size: BoardSize,
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<(String, String)>,
    #[serde(default)]
    pub extension_points: Vec<ExtensionPointDefinition>,
}

/// Design-time description of a whole tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeDefinition {
    #[serde(default = "default_max_connected_boards")]
    pub max_connected_boards: usize,
    pub core: BoardDefinition,
    #[serde(default)]
    pub boards: Vec<BoardDefinition>,
}

/// Produces a fresh core board from static data. Used to repair a tree
/// whose core board came up empty.
pub trait BoardBuilder {
    fn build_core_board(&self) -> Result<Board, BoardError>;
}

impl Board {
    /// Build and validate a board from its definition.
    pub fn from_definition(def: &BoardDefinition) -> Result<Board, BoardError> {
        let mut board = Board::new(def.id.clone(), def.kind, def.size);

        for node_def in &def.nodes {
            let mut node = Node::new(
                node_def.id.clone(),
                node_def.position,
                node_def.kind,
                node_def.cost,
                node_def.max_rank,
            );
            node.modifiers = node_def.modifiers.clone();
            board.insert_node(node)?;
        }

        for (a, b) in &def.edges {
            board.connect(a, b)?;
        }

        for point in &def.extension_points {
            board.add_extension_point(point.id.clone(), point.position)?;
        }

        board.validate()?;

        for (a, b) in board.non_orthogonal_edges() {
            tracing::warn!(board = %board.id, from = %a, to = %b, "edge between non-adjacent cells");
        }

        Ok(board)
    }
}

impl BoardDefinition {
    pub fn build(&self) -> Result<Board, BoardError> {
        Board::from_definition(self)
    }
}

impl TreeDefinition {
    /// Load a tree definition from a RON file.
    pub fn load_from_ron(path: &Path) -> Result<TreeDefinition, BoardError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_ron(&contents)
    }

    /// Parse a tree definition from a RON string.
    pub fn parse_ron(input: &str) -> Result<TreeDefinition, BoardError> {
        Ok(ron::from_str(input)?)
    }

    /// The default tree compiled into the crate.
    pub fn builtin() -> Result<TreeDefinition, BoardError> {
        Self::parse_ron(BUILTIN_TREE)
    }

    /// Every board definition, core first.
    pub fn all_boards(&self) -> impl Iterator<Item = &BoardDefinition> {
        std::iter::once(&self.core).chain(self.boards.iter())
    }
}

impl BoardBuilder for TreeDefinition {
    fn build_core_board(&self) -> Result<Board, BoardError> {
        self.core.build()
    }
}
