/// The allocation engine: allocation, deallocation, board connection and
/// stat recomputation for one character session.
///
/// Wires together the tree, the player ledger, the optional persistence
/// store and the registered listeners.

use rustc_hash::FxHashSet;
use thiserror::Error;

use crate::core::config::{DeallocationPolicy, EngineConfig, UNLIMITED_POINT_BUDGET};
use crate::core::definition::{BoardBuilder, TreeDefinition};
use crate::core::events::{ListenerId, Listeners, TreeEvent, TreeListener};
use crate::core::persistence::{CharacterId, PersistenceError, PlayerStore};
use crate::core::state::PlayerState;
use crate::core::tree::{Tree, TreeError};
use crate::schema::board::{Board, BoardId, BoardKind};
use crate::schema::connection::BoardConnection;
use crate::schema::node::{BlockReason, GridPos, Node, NodeId, StatMap, ROOT_NODE_ID};

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("engine has not been initialized")]
    NotInitialized,
    #[error("unknown id '{0}'")]
    NotFound(String),
    #[error("node '{0}' cannot change rank right now")]
    Blocked(NodeId),
    #[error("extension point '{extension_point}' or board '{board}' is already in use")]
    AlreadyConnected {
        extension_point: String,
        board: BoardId,
    },
    #[error("board '{0}' is not connected")]
    NotConnected(BoardId),
    #[error("at most {0} boards may be connected")]
    LimitReached(usize),
    #[error("board '{0}' still hosts connected boards")]
    BoardInUse(BoardId),
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("tree error: {0}")]
    Tree(#[from] TreeError),
}

/// Session lifecycle. Every public operation except
/// [`AllocationEngine::initialize`] requires `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Ready,
}

/// One character's passive tree session. Built via `AllocationEngine::builder()`.
pub struct AllocationEngine {
    tree: Tree,
    player: PlayerState,
    config: EngineConfig,
    character: CharacterId,
    store: Option<Box<dyn PlayerStore>>,
    board_builder: Option<Box<dyn BoardBuilder>>,
    listeners: Listeners,
    state: EngineState,
    unlimited_points: bool,
}

/// Builder for constructing an `AllocationEngine`.
pub struct AllocationEngineBuilder {
    tree: Option<Tree>,
    config: EngineConfig,
    character: CharacterId,
    store: Option<Box<dyn PlayerStore>>,
    board_builder: Option<Box<dyn BoardBuilder>>,
}

impl AllocationEngine {
    pub fn builder() -> AllocationEngineBuilder {
        AllocationEngineBuilder {
            tree: None,
            config: EngineConfig::default(),
            character: CharacterId::from("default"),
            store: None,
            board_builder: None,
        }
    }

    /// Repair the tree if needed, load or create the character's progress,
    /// grant the root node and move to `Ready`. Calling it again is a no-op.
    ///
    /// A failed load leaves the engine uninitialized so a corrupt save is
    /// never overwritten by a fresh one.
    pub fn initialize(&mut self) -> Result<(), AllocationError> {
        if self.state == EngineState::Ready {
            return Ok(());
        }

        let repaired = match &self.board_builder {
            Some(builder) => self.tree.ensure_initialized(builder.as_ref())?,
            None => {
                let builtin = TreeDefinition::builtin().map_err(TreeError::from)?;
                self.tree.ensure_initialized(&builtin)?
            }
        };
        if self.tree.root().is_none() {
            return Err(TreeError::MissingRoot(self.tree.core_board().id.clone()).into());
        }

        let point_cap = self.config.point_cap();
        let mut player = match &self.store {
            Some(store) if store.has(&self.character) => {
                let snapshot = store.load(&self.character)?;
                let mut player =
                    PlayerState::from_snapshot(snapshot, self.config.initial_points, point_cap);
                repair_loaded_progress(&self.tree, &mut player);
                player
            }
            _ => PlayerState::new(self.config.initial_points).with_point_cap(point_cap),
        };
        grant_root(&mut player);

        self.tree.sync_ranks(&player);
        self.player = player;
        self.state = EngineState::Ready;

        tracing::info!(
            character = %self.character,
            repaired,
            allocated = self.player.allocated_count(),
            points = self.player.available_points(),
            "passive tree session ready"
        );
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), AllocationError> {
        match self.state {
            EngineState::Ready => Ok(()),
            EngineState::Uninitialized => Err(AllocationError::NotInitialized),
        }
    }

    // --- Allocation ---

    /// Raise a node by one rank.
    ///
    /// Fails with `Blocked` when the node is maxed, unaffordable, not
    /// adjacent to an allocated node, or on a detached board. Use
    /// [`AllocationEngine::allocation_blockers`] for the precise reason.
    pub fn allocate_node(&mut self, node_id: &str) -> Result<u32, AllocationError> {
        self.ensure_ready()?;
        let blockers = self.allocation_blockers(node_id)?;
        if !blockers.is_empty() {
            tracing::debug!(node = node_id, ?blockers, "allocation blocked");
            return Err(AllocationError::Blocked(NodeId::from(node_id)));
        }

        let (id, cost) = {
            let node = self.lookup_node(node_id)?;
            let cost = if self.unlimited_points { 0 } else { node.cost };
            (node.id.clone(), cost)
        };

        let applied = if self.player.is_allocated(node_id) {
            self.player.rank_up(&id, cost)
        } else {
            self.player.allocate_node(&id, cost)
        };
        if !applied {
            return Err(AllocationError::Blocked(id));
        }

        let rank = self.player.allocation(node_id).map_or(0, |a| a.rank);
        let node = self.set_node_rank(node_id, rank)?;
        tracing::debug!(node = node_id, rank, cost, points = self.player.available_points(), "node allocated");
        self.listeners.emit(&TreeEvent::NodeAllocated(node));
        self.after_mutation();
        Ok(rank)
    }

    /// Remove a node entirely, refunding what was spent on it. The root can
    /// never be removed.
    pub fn deallocate_node(&mut self, node_id: &str) -> Result<(), AllocationError> {
        self.ensure_ready()?;
        let id = self.lookup_node(node_id)?.id.clone();
        if id.is_root() || !self.player.is_allocated(node_id) {
            return Err(AllocationError::Blocked(id));
        }
        if self.config.deallocation_policy == DeallocationPolicy::PreserveConnectivity
            && self.would_strand_others(&id)
        {
            tracing::debug!(node = node_id, "deallocation would strand allocated nodes");
            return Err(AllocationError::Blocked(id));
        }
        if !self.player.deallocate_node(&id) {
            return Err(AllocationError::Blocked(id));
        }

        let node = self.set_node_rank(node_id, 0)?;
        tracing::debug!(node = node_id, points = self.player.available_points(), "node deallocated");
        self.listeners.emit(&TreeEvent::NodeDeallocated(node));
        self.after_mutation();
        Ok(())
    }

    /// Every reason the node cannot take another rank right now. Empty when
    /// [`AllocationEngine::allocate_node`] would succeed.
    pub fn allocation_blockers(&self, node_id: &str) -> Result<Vec<BlockReason>, AllocationError> {
        self.ensure_ready()?;
        let node = self.lookup_node(node_id)?;
        let connections = self.player.board_connections();

        let mut reasons = Vec::new();
        let active = self.tree.is_node_active(node_id, connections);
        if !active {
            reasons.push(BlockReason::BoardDetached);
        }
        // Adjacency is moot on a detached board.
        let waive_adjacency = !active || self.tree.is_entry_node(node_id, connections);
        reasons.extend(node.block_reasons(
            self.player.allocated_node_ids(),
            self.effective_points(),
            waive_adjacency,
        ));
        if let Some(limit) = self.config.max_allocated_nodes {
            if !self.player.is_allocated(node_id) && self.counted_allocations() >= limit {
                reasons.push(BlockReason::NodeLimit);
            }
        }
        Ok(reasons)
    }

    /// Whether [`AllocationEngine::allocate_node`] would succeed. Unknown
    /// ids and an uninitialized engine answer false.
    pub fn can_allocate_node(&self, node_id: &str) -> bool {
        self.allocation_blockers(node_id)
            .map(|reasons| reasons.is_empty())
            .unwrap_or(false)
    }

    fn counted_allocations(&self) -> usize {
        if self.config.count_detached_allocations {
            return self.player.allocated_count();
        }
        let connections = self.player.board_connections();
        self.player
            .allocated_node_ids()
            .filter(|id| self.tree.is_node_active(id.as_str(), connections))
            .count()
    }

    /// Allocated nodes on active boards with no allocated path back to the
    /// root or to an allocated entry node, pretending `removed` is gone.
    fn stranded_nodes(&self, removed: Option<&NodeId>) -> FxHashSet<NodeId> {
        let kept = |n: &Node| Some(&n.id) != removed && self.player.is_allocated(n.id.as_str());
        let mut stranded = FxHashSet::default();
        for board in self.tree.active_boards(self.player.board_connections()) {
            let starts: Vec<NodeId> = board
                .main_nodes()
                .into_iter()
                .filter(|n| kept(*n))
                .map(|n| n.id.clone())
                .collect();
            let reached = board.reachable_from(&starts, |n| kept(n));
            stranded.extend(
                board
                    .nodes()
                    .filter(|n| kept(*n) && !reached.contains(&n.id))
                    .map(|n| n.id.clone()),
            );
        }
        stranded
    }

    /// Would removing `removed` cut off a node that is connected now?
    fn would_strand_others(&self, removed: &NodeId) -> bool {
        let before = self.stranded_nodes(None);
        self.stranded_nodes(Some(removed))
            .iter()
            .any(|id| !before.contains(id))
    }

    // --- Board connections ---

    /// Attach a known extension or keystone board at an extension point on
    /// an active board.
    pub fn connect_board(&mut self, extension_point_id: &str, board_id: &str) -> Result<(), AllocationError> {
        self.ensure_ready()?;
        let board = self
            .tree
            .find_board_by_id(board_id)
            .ok_or_else(|| AllocationError::NotFound(board_id.to_string()))?;
        let connections = self.player.board_connections();
        if board.kind == BoardKind::Core
            || self.player.connection_at(extension_point_id).is_some()
            || self.player.is_board_connected(board_id)
        {
            return Err(AllocationError::AlreadyConnected {
                extension_point: extension_point_id.to_string(),
                board: board.id.clone(),
            });
        }
        if self
            .tree
            .extension_point_host(extension_point_id, connections)
            .is_none()
        {
            return Err(AllocationError::NotFound(extension_point_id.to_string()));
        }
        let limit = self.tree.max_connected_boards();
        if connections.len() >= limit {
            return Err(AllocationError::LimitReached(limit));
        }

        if !self.player.connect_board(extension_point_id, board_id) {
            return Err(AllocationError::AlreadyConnected {
                extension_point: extension_point_id.to_string(),
                board: BoardId::from(board_id),
            });
        }
        let connection = BoardConnection::new(extension_point_id, board_id);
        tracing::debug!(board = board_id, extension_point = extension_point_id, "board connected");
        self.listeners.emit(&TreeEvent::BoardConnected(connection));
        self.after_mutation();
        Ok(())
    }

    /// Detach a board. Its allocations stay in the ledger but stop
    /// contributing stats until it is connected again.
    pub fn disconnect_board(&mut self, board_id: &str) -> Result<(), AllocationError> {
        self.ensure_ready()?;
        let board = self
            .tree
            .find_board_by_id(board_id)
            .ok_or_else(|| AllocationError::NotFound(board_id.to_string()))?;
        if !self.player.is_board_connected(board_id) {
            return Err(AllocationError::NotConnected(board.id.clone()));
        }
        let hosts_others = board
            .extension_points
            .iter()
            .any(|p| self.player.connection_at(&p.id).is_some());
        if hosts_others {
            return Err(AllocationError::BoardInUse(board.id.clone()));
        }

        let connection = self
            .player
            .disconnect_board(board_id)
            .ok_or_else(|| AllocationError::NotConnected(BoardId::from(board_id)))?;
        tracing::debug!(board = board_id, "board disconnected");
        self.listeners.emit(&TreeEvent::BoardDisconnected(connection));
        self.after_mutation();
        Ok(())
    }

    // --- Stats ---

    /// Recompute totals from scratch and refresh the cache.
    pub fn recalculate_stats(&mut self) -> Result<StatMap, AllocationError> {
        self.ensure_ready()?;
        let stats = self.tree.total_stats(&self.player);
        self.player.update_cached_stats(stats.clone());
        tracing::debug!(stats = stats.len(), "stats recalculated");
        self.listeners.emit(&TreeEvent::StatsRecalculated);
        Ok(stats)
    }

    /// Current totals, recomputed first if anything changed since the last
    /// computation.
    pub fn current_stats(&mut self) -> Result<&StatMap, AllocationError> {
        self.ensure_ready()?;
        if self.player.are_stats_dirty() {
            self.recalculate_stats()?;
        }
        Ok(self.player.cached_stats())
    }

    fn after_mutation(&mut self) {
        if self.config.auto_recalculate {
            let stats = self.tree.total_stats(&self.player);
            self.player.update_cached_stats(stats);
            self.listeners.emit(&TreeEvent::StatsRecalculated);
        }
        if self.config.auto_save {
            if let Err(e) = self.write_snapshot() {
                tracing::error!(character = %self.character, error = %e, "failed to save passive tree progress");
            }
        }
    }

    // --- Persistence ---

    fn write_snapshot(&mut self) -> Result<(), PersistenceError> {
        match self.store.as_mut() {
            Some(store) => store.save(&self.character, &self.player.snapshot()),
            None => Ok(()),
        }
    }

    /// Snapshot the current progress to the store, reporting failures.
    pub fn save_progress(&mut self) -> Result<(), AllocationError> {
        self.ensure_ready()?;
        Ok(self.write_snapshot()?)
    }

    /// Remove this character's saved progress. In-memory state is untouched.
    pub fn clear_saved_progress(&mut self) -> Result<(), AllocationError> {
        match self.store.as_mut() {
            Some(store) => Ok(store.clear(&self.character)?),
            None => Ok(()),
        }
    }

    /// Clear every allocation and connection and restore the initial budget.
    /// The root stays allocated.
    pub fn reset_progress(&mut self) -> Result<(), AllocationError> {
        self.ensure_ready()?;
        self.player.reset();
        grant_root(&mut self.player);
        self.tree.sync_ranks(&self.player);
        tracing::info!(character = %self.character, points = self.player.available_points(), "passive tree reset");
        self.after_mutation();
        Ok(())
    }

    // --- Debug ---

    /// Toggle the unlimited-points debug mode. Stored points are never
    /// touched; allocations made in this mode cost nothing.
    pub fn set_unlimited_points(&mut self, enabled: bool) {
        if self.unlimited_points != enabled {
            tracing::info!(enabled, "unlimited points mode changed");
        }
        self.unlimited_points = enabled;
    }

    pub fn is_unlimited_points(&self) -> bool {
        self.unlimited_points
    }

    /// The budget allocation checks use: the stored points, or the fixed
    /// debug budget while unlimited mode is on.
    pub fn effective_points(&self) -> u32 {
        if self.unlimited_points {
            UNLIMITED_POINT_BUDGET
        } else {
            self.player.available_points()
        }
    }

    // --- Listeners ---

    pub fn subscribe(&mut self, listener: Box<dyn TreeListener>) -> ListenerId {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> Option<Box<dyn TreeListener>> {
        self.listeners.unsubscribe(id)
    }

    // --- Queries ---

    fn lookup_node(&self, node_id: &str) -> Result<&Node, AllocationError> {
        self.tree
            .find_node_by_id(node_id)
            .ok_or_else(|| AllocationError::NotFound(node_id.to_string()))
    }

    fn set_node_rank(&mut self, node_id: &str, rank: u32) -> Result<Node, AllocationError> {
        let node = self
            .tree
            .node_mut(node_id)
            .ok_or_else(|| AllocationError::NotFound(node_id.to_string()))?;
        node.set_rank(rank);
        Ok(node.clone())
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn character(&self) -> &CharacterId {
        &self.character
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn player(&self) -> &PlayerState {
        &self.player
    }

    /// Stored points; unaffected by the unlimited debug mode.
    pub fn available_points(&self) -> u32 {
        self.player.available_points()
    }

    /// Nodes on the core board and every connected board.
    pub fn all_nodes(&self) -> Vec<&Node> {
        self.tree
            .active_boards(self.player.board_connections())
            .into_iter()
            .flat_map(|b| b.nodes_sorted())
            .collect()
    }

    /// Node at a cell of the core board.
    pub fn node_at(&self, x: i32, y: i32) -> Option<&Node> {
        self.tree.core_board().node_at(GridPos::new(x, y))
    }

    pub fn node_at_on(&self, board_id: &str, x: i32, y: i32) -> Option<&Node> {
        self.tree.find_board_by_id(board_id)?.node_at(GridPos::new(x, y))
    }

    pub fn nodes_on_board(&self, board_id: &str) -> Option<Vec<&Node>> {
        Some(self.tree.find_board_by_id(board_id)?.nodes_sorted())
    }

    pub fn find_node_by_id(&self, node_id: &str) -> Option<&Node> {
        self.tree.find_node_by_id(node_id)
    }

    pub fn find_board_by_id(&self, board_id: &str) -> Option<&Board> {
        self.tree.find_board_by_id(board_id)
    }

    /// Every node in the ledger, sorted by id, including nodes on
    /// detached boards.
    pub fn allocated_nodes(&self) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self
            .player
            .allocated_node_ids()
            .filter_map(|id| self.tree.find_node_by_id(id.as_str()))
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn connected_boards(&self) -> &[BoardConnection] {
        self.player.board_connections()
    }
}

impl std::fmt::Debug for AllocationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationEngine")
            .field("character", &self.character)
            .field("state", &self.state)
            .field("points", &self.player.available_points())
            .field("allocated", &self.player.allocated_count())
            .field("listeners", &self.listeners)
            .finish()
    }
}

/// Put the root in the ledger for free if it is missing.
fn grant_root(player: &mut PlayerState) {
    let root = NodeId::from(ROOT_NODE_ID);
    if !player.is_allocated(ROOT_NODE_ID) {
        player.allocate_node(&root, 0);
    }
}

/// Bring loaded progress back in line with the tree.
///
/// Allocations for unknown nodes are refunded and dropped, and ranks above a
/// node's maximum are lowered. Connections are replayed in saved order under
/// the same rules as [`AllocationEngine::connect_board`]; any that fail are
/// dropped.
fn repair_loaded_progress(tree: &Tree, player: &mut PlayerState) {
    let stale_nodes: Vec<NodeId> = player
        .allocated_node_ids()
        .filter(|id| tree.find_node_by_id(id.as_str()).is_none())
        .cloned()
        .collect();
    for id in &stale_nodes {
        player.deallocate_node(id);
    }

    for node in tree.boards().into_iter().flat_map(|b| b.nodes()) {
        if let Some(previous) = player.clamp_rank(node.id.as_str(), node.max_rank) {
            tracing::warn!(node = %node.id, saved = previous, max = node.max_rank, "saved rank above maximum");
        }
    }

    let limit = tree.max_connected_boards();
    let mut rejected = Vec::new();
    for connection in player.take_board_connections() {
        let point = connection.extension_point_id.as_str();
        let board = connection.board_id.as_str();
        let attachable = tree
            .find_board_by_id(board)
            .is_some_and(|b| b.kind != BoardKind::Core);
        let hosted = tree
            .extension_point_host(point, player.board_connections())
            .is_some();
        let accepted = attachable
            && hosted
            && player.board_connections().len() < limit
            && player.connect_board(point, board);
        if !accepted {
            rejected.push(connection);
        }
    }

    if !stale_nodes.is_empty() || !rejected.is_empty() {
        tracing::warn!(
            nodes = ?stale_nodes,
            connections = ?rejected,
            "dropped saved entries that do not fit the tree"
        );
    }
}

impl AllocationEngineBuilder {
    pub fn tree(mut self, tree: Tree) -> Self {
        self.tree = Some(tree);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn character(mut self, character: impl Into<String>) -> Self {
        self.character = CharacterId::new(character);
        self
    }

    pub fn store(mut self, store: Box<dyn PlayerStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Source used to regenerate an empty core board. Defaults to the
    /// built-in tree definition.
    pub fn board_builder(mut self, builder: Box<dyn BoardBuilder>) -> Self {
        self.board_builder = Some(builder);
        self
    }

    /// Assemble an uninitialized engine. Uses the built-in tree when none
    /// was provided.
    pub fn build(self) -> Result<AllocationEngine, AllocationError> {
        let tree = match self.tree {
            Some(tree) => tree,
            None => Tree::builtin()?,
        };
        let unlimited_points = self.config.unlimited_points;
        let player = PlayerState::new(self.config.initial_points).with_point_cap(self.config.point_cap());
        Ok(AllocationEngine {
            tree,
            player,
            config: self.config,
            character: self.character,
            store: self.store,
            board_builder: self.board_builder,
            listeners: Listeners::new(),
            state: EngineState::Uninitialized,
            unlimited_points,
        })
    }

    /// Build and initialize in one step.
    pub fn build_ready(self) -> Result<AllocationEngine, AllocationError> {
        let mut engine = self.build()?;
        engine.initialize()?;
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RefundPolicy;
    use crate::core::persistence::MemoryStore;
    use crate::core::state::{PlayerSnapshot, SavedAllocation};
    use crate::schema::board::BoardSize;
    use crate::schema::node::NodeKind;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// core_main -> node_1 (cost 2) -> node_2 (cost 1), plus life (3 ranks)
    /// off the root, and two extension boards.
    fn test_tree() -> Tree {
        let mut core = Board::new("core", BoardKind::Core, BoardSize::new(3, 3));
        core.insert_node(Node::new(ROOT_NODE_ID, GridPos::new(1, 1), NodeKind::Main, 0, 1))
            .unwrap();
        core.insert_node(
            Node::new("node_1", GridPos::new(1, 0), NodeKind::Small, 2, 1).with_modifier("strength", 5.0),
        )
        .unwrap();
        core.insert_node(
            Node::new("node_2", GridPos::new(0, 0), NodeKind::Notable, 1, 1).with_modifier("strength", 10.0),
        )
        .unwrap();
        core.insert_node(
            Node::new("life", GridPos::new(1, 2), NodeKind::Small, 1, 3).with_modifier("life", 10.0),
        )
        .unwrap();
        core.connect(ROOT_NODE_ID, "node_1").unwrap();
        core.connect("node_1", "node_2").unwrap();
        core.connect(ROOT_NODE_ID, "life").unwrap();
        core.add_extension_point("ext_1", GridPos::new(2, 0)).unwrap();
        core.add_extension_point("ext_2", GridPos::new(2, 2)).unwrap();

        let board_a = extension("boardA", "a", Some("a_ext"));
        let board_b = extension("boardB", "b", None);
        Tree::new(core, vec![board_a, board_b], 2).unwrap()
    }

    fn extension(id: &str, prefix: &str, point: Option<&str>) -> Board {
        let mut board = Board::new(id, BoardKind::Extension, BoardSize::new(3, 3));
        board
            .insert_node(
                Node::new(format!("{prefix}_main"), GridPos::new(1, 1), NodeKind::Main, 1, 1)
                    .with_modifier("fire", 5.0),
            )
            .unwrap();
        board
            .insert_node(Node::new(format!("{prefix}_1"), GridPos::new(1, 0), NodeKind::Small, 1, 1))
            .unwrap();
        board
            .connect(&format!("{prefix}_main"), &format!("{prefix}_1"))
            .unwrap();
        if let Some(point) = point {
            board.add_extension_point(point, GridPos::new(0, 0)).unwrap();
        }
        board
    }

    fn engine_with(points: u32) -> AllocationEngine {
        let config = EngineConfig {
            initial_points: points,
            ..EngineConfig::default()
        };
        AllocationEngine::builder()
            .tree(test_tree())
            .config(config)
            .build_ready()
            .unwrap()
    }

    fn recorder(engine: &mut AllocationEngine) -> Rc<RefCell<Vec<String>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        engine.subscribe(Box::new(move |event: &TreeEvent| {
            let entry = match event {
                TreeEvent::NodeAllocated(n) => format!("alloc:{}:{}", n.id, n.current_rank()),
                TreeEvent::NodeDeallocated(n) => format!("dealloc:{}", n.id),
                TreeEvent::BoardConnected(c) => format!("connect:{}", c.board_id),
                TreeEvent::BoardDisconnected(c) => format!("disconnect:{}", c.board_id),
                TreeEvent::StatsRecalculated => "stats".to_string(),
            };
            sink.borrow_mut().push(entry);
        }));
        log
    }

    #[test]
    fn operations_require_initialization() {
        let mut engine = AllocationEngine::builder().tree(test_tree()).build().unwrap();
        assert_eq!(engine.state(), EngineState::Uninitialized);
        assert!(matches!(engine.allocate_node("node_1"), Err(AllocationError::NotInitialized)));
        assert!(matches!(engine.current_stats(), Err(AllocationError::NotInitialized)));
        assert!(!engine.can_allocate_node("node_1"));

        engine.initialize().unwrap();
        assert_eq!(engine.state(), EngineState::Ready);
        engine.initialize().unwrap();
    }

    #[test]
    fn root_is_allocated_and_locked() {
        let mut engine = engine_with(2);
        let root = engine.find_node_by_id(ROOT_NODE_ID).unwrap();
        assert_eq!(root.current_rank(), 1);
        assert!(engine.player().is_allocated(ROOT_NODE_ID));
        assert!(matches!(
            engine.deallocate_node(ROOT_NODE_ID),
            Err(AllocationError::Blocked(_))
        ));
        assert_eq!(engine.available_points(), 2);
    }

    #[test]
    fn allocate_spends_points_then_hits_max_rank() {
        let mut engine = engine_with(2);
        assert_eq!(engine.allocate_node("node_1").unwrap(), 1);
        assert_eq!(engine.available_points(), 0);
        assert_eq!(engine.find_node_by_id("node_1").unwrap().current_rank(), 1);

        engine.set_unlimited_points(true);
        assert!(matches!(engine.allocate_node("node_1"), Err(AllocationError::Blocked(_))));
        assert_eq!(
            engine.allocation_blockers("node_1").unwrap(),
            vec![BlockReason::MaxRank]
        );
    }

    #[test]
    fn insufficient_points_blocks_without_mutation() {
        let mut engine = engine_with(1);
        let log = recorder(&mut engine);
        assert!(matches!(engine.allocate_node("node_1"), Err(AllocationError::Blocked(_))));
        assert_eq!(engine.available_points(), 1);
        assert!(!engine.player().is_allocated("node_1"));
        assert_eq!(
            engine.allocation_blockers("node_1").unwrap(),
            vec![BlockReason::InsufficientPoints]
        );
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn non_adjacent_node_blocked_regardless_of_budget() {
        let mut engine = engine_with(50);
        assert!(matches!(engine.allocate_node("node_2"), Err(AllocationError::Blocked(_))));
        engine.set_unlimited_points(true);
        assert!(matches!(engine.allocate_node("node_2"), Err(AllocationError::Blocked(_))));
        assert_eq!(
            engine.allocation_blockers("node_2").unwrap(),
            vec![BlockReason::NotAdjacent]
        );
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let mut engine = engine_with(5);
        assert!(matches!(engine.allocate_node("ghost"), Err(AllocationError::NotFound(_))));
        assert!(matches!(engine.deallocate_node("ghost"), Err(AllocationError::NotFound(_))));
        assert!(matches!(engine.connect_board("ext_1", "ghost"), Err(AllocationError::NotFound(_))));
        assert!(matches!(engine.connect_board("ext_9", "boardA"), Err(AllocationError::NotFound(_))));
        assert!(matches!(engine.disconnect_board("ghost"), Err(AllocationError::NotFound(_))));
        assert!(!engine.can_allocate_node("ghost"));
    }

    #[test]
    fn allocate_deallocate_round_trip() {
        let mut engine = engine_with(5);
        let log = recorder(&mut engine);
        engine.allocate_node("node_1").unwrap();
        engine.deallocate_node("node_1").unwrap();
        assert_eq!(engine.available_points(), 5);
        assert!(!engine.player().is_allocated("node_1"));
        assert_eq!(engine.find_node_by_id("node_1").unwrap().current_rank(), 0);
        assert_eq!(
            *log.borrow(),
            vec!["alloc:node_1:1", "stats", "dealloc:node_1", "stats"]
        );
    }

    #[test]
    fn deallocating_unallocated_node_blocked() {
        let mut engine = engine_with(5);
        assert!(matches!(engine.deallocate_node("node_1"), Err(AllocationError::Blocked(_))));
    }

    #[test]
    fn multi_rank_nodes_stack_modifiers() {
        let mut engine = engine_with(5);
        assert_eq!(engine.allocate_node("life").unwrap(), 1);
        assert_eq!(engine.allocate_node("life").unwrap(), 2);
        assert_eq!(engine.current_stats().unwrap().get("life"), Some(&20.0));
        assert_eq!(engine.available_points(), 3);

        engine.deallocate_node("life").unwrap();
        assert_eq!(engine.available_points(), 5);
        assert!(engine.current_stats().unwrap().get("life").is_none());
    }

    #[test]
    fn stats_follow_every_mutation() {
        let mut engine = engine_with(5);
        assert!(engine.current_stats().unwrap().is_empty());
        engine.allocate_node("node_1").unwrap();
        engine.allocate_node("node_2").unwrap();
        assert_eq!(engine.current_stats().unwrap().get("strength"), Some(&15.0));

        let first = engine.current_stats().unwrap().clone();
        let second = engine.current_stats().unwrap().clone();
        assert_eq!(first, second);
        assert_eq!(first, engine.tree().total_stats(engine.player()));
    }

    #[test]
    fn lazy_recalculation_without_auto_recalculate() {
        let config = EngineConfig {
            initial_points: 5,
            auto_recalculate: false,
            ..EngineConfig::default()
        };
        let mut engine = AllocationEngine::builder()
            .tree(test_tree())
            .config(config)
            .build_ready()
            .unwrap();
        let log = recorder(&mut engine);

        engine.allocate_node("node_1").unwrap();
        assert!(engine.player().are_stats_dirty());
        assert_eq!(engine.current_stats().unwrap().get("strength"), Some(&5.0));
        assert!(!engine.player().are_stats_dirty());
        engine.current_stats().unwrap();
        assert_eq!(*log.borrow(), vec!["alloc:node_1:1", "stats"]);
    }

    #[test]
    fn occupied_extension_point_rejected() {
        let mut engine = engine_with(5);
        engine.connect_board("ext_1", "boardA").unwrap();
        assert!(matches!(
            engine.connect_board("ext_1", "boardB"),
            Err(AllocationError::AlreadyConnected { .. })
        ));
        assert_eq!(engine.connected_boards(), &[BoardConnection::new("ext_1", "boardA")]);
        assert!(matches!(
            engine.connect_board("ext_2", "boardA"),
            Err(AllocationError::AlreadyConnected { .. })
        ));
        assert!(matches!(
            engine.connect_board("ext_2", "core"),
            Err(AllocationError::AlreadyConnected { .. })
        ));
    }

    #[test]
    fn board_limit_enforced() {
        let core = test_tree().core_board().clone();
        let tree = Tree::new(
            core,
            vec![extension("boardA", "a", None), extension("boardB", "b", None)],
            1,
        )
        .unwrap();
        let mut engine = AllocationEngine::builder()
            .tree(tree)
            .build_ready()
            .unwrap();
        engine.connect_board("ext_1", "boardA").unwrap();
        assert!(matches!(
            engine.connect_board("ext_2", "boardB"),
            Err(AllocationError::LimitReached(1))
        ));
    }

    #[test]
    fn detached_board_keeps_ledger_but_not_stats() {
        let mut engine = engine_with(5);
        assert!(matches!(engine.allocate_node("a_main"), Err(AllocationError::Blocked(_))));
        assert_eq!(
            engine.allocation_blockers("a_main").unwrap(),
            vec![BlockReason::BoardDetached]
        );

        engine.connect_board("ext_1", "boardA").unwrap();
        engine.allocate_node("a_main").unwrap();
        engine.allocate_node("a_1").unwrap();
        assert_eq!(engine.current_stats().unwrap().get("fire"), Some(&5.0));
        let points = engine.available_points();

        engine.disconnect_board("boardA").unwrap();
        assert!(engine.player().is_allocated("a_main"));
        assert!(engine.current_stats().unwrap().get("fire").is_none());
        assert_eq!(engine.available_points(), points);

        engine.connect_board("ext_2", "boardA").unwrap();
        assert_eq!(engine.current_stats().unwrap().get("fire"), Some(&5.0));
        assert_eq!(engine.available_points(), points);
    }

    #[test]
    fn disconnect_unconnected_board_fails() {
        let mut engine = engine_with(5);
        assert!(matches!(
            engine.disconnect_board("boardA"),
            Err(AllocationError::NotConnected(_))
        ));
    }

    #[test]
    fn host_board_cannot_detach_while_hosting() {
        let mut engine = engine_with(5);
        engine.connect_board("ext_1", "boardA").unwrap();
        engine.connect_board("a_ext", "boardB").unwrap();
        assert!(matches!(
            engine.disconnect_board("boardA"),
            Err(AllocationError::BoardInUse(_))
        ));
        engine.disconnect_board("boardB").unwrap();
        engine.disconnect_board("boardA").unwrap();
        assert!(engine.connected_boards().is_empty());
    }

    #[test]
    fn unlimited_mode_leaves_stored_points_alone() {
        let mut engine = engine_with(0);
        assert!(!engine.can_allocate_node("node_1"));
        engine.set_unlimited_points(true);
        assert_eq!(engine.effective_points(), UNLIMITED_POINT_BUDGET);
        engine.allocate_node("node_1").unwrap();
        engine.allocate_node("node_2").unwrap();
        assert_eq!(engine.available_points(), 0);

        engine.set_unlimited_points(false);
        engine.deallocate_node("node_2").unwrap();
        assert_eq!(engine.available_points(), 0);
    }

    #[test]
    fn preserve_connectivity_blocks_stranding() {
        let config = EngineConfig {
            initial_points: 10,
            deallocation_policy: DeallocationPolicy::PreserveConnectivity,
            ..EngineConfig::default()
        };
        let mut engine = AllocationEngine::builder()
            .tree(test_tree())
            .config(config)
            .build_ready()
            .unwrap();
        engine.allocate_node("node_1").unwrap();
        engine.allocate_node("node_2").unwrap();
        assert!(matches!(engine.deallocate_node("node_1"), Err(AllocationError::Blocked(_))));
        engine.deallocate_node("node_2").unwrap();
        engine.deallocate_node("node_1").unwrap();
    }

    #[test]
    fn free_policy_allows_stranding() {
        let mut engine = engine_with(10);
        engine.allocate_node("node_1").unwrap();
        engine.allocate_node("node_2").unwrap();
        engine.deallocate_node("node_1").unwrap();
        assert!(engine.player().is_allocated("node_2"));
    }

    #[test]
    fn node_limit_counts_detached_when_configured() {
        for (count_detached, expect_blocked) in [(true, true), (false, false)] {
            let config = EngineConfig {
                initial_points: 10,
                max_allocated_nodes: Some(3),
                count_detached_allocations: count_detached,
                ..EngineConfig::default()
            };
            let mut engine = AllocationEngine::builder()
                .tree(test_tree())
                .config(config)
                .build_ready()
                .unwrap();
            engine.connect_board("ext_1", "boardA").unwrap();
            engine.allocate_node("a_main").unwrap();
            engine.allocate_node("a_1").unwrap();
            engine.disconnect_board("boardA").unwrap();

            let blocked = engine.allocate_node("node_1").is_err();
            assert_eq!(blocked, expect_blocked, "count_detached = {count_detached}");
        }
    }

    #[test]
    fn capped_refund_never_exceeds_initial() {
        let config = EngineConfig {
            initial_points: 3,
            refund_policy: RefundPolicy::CappedAtInitial,
            ..EngineConfig::default()
        };
        let mut engine = AllocationEngine::builder()
            .tree(test_tree())
            .config(config)
            .build_ready()
            .unwrap();
        engine.allocate_node("node_1").unwrap();
        engine.deallocate_node("node_1").unwrap();
        assert_eq!(engine.available_points(), 3);
    }

    #[test]
    fn mutations_are_saved_and_restored() {
        let mut engine = AllocationEngine::builder()
            .tree(test_tree())
            .config(EngineConfig {
                initial_points: 6,
                ..EngineConfig::default()
            })
            .character("hero")
            .store(Box::new(MemoryStore::new()))
            .build_ready()
            .unwrap();
        engine.allocate_node("node_1").unwrap();
        engine.connect_board("ext_1", "boardA").unwrap();

        let store = engine.store.take().unwrap();
        let snapshot = store.load(&CharacterId::from("hero")).unwrap();
        assert_eq!(snapshot.available_points, 4);
        assert_eq!(snapshot.board_connections.len(), 1);

        let mut restored = AllocationEngine::builder()
            .tree(test_tree())
            .character("hero")
            .store(store)
            .build_ready()
            .unwrap();
        assert_eq!(restored.available_points(), 4);
        assert_eq!(restored.find_node_by_id("node_1").unwrap().current_rank(), 1);
        assert!(restored.player().is_board_connected("boardA"));
        assert_eq!(restored.current_stats().unwrap().get("strength"), Some(&5.0));
    }

    #[test]
    fn stale_save_entries_are_dropped_and_refunded() {
        let mut store = MemoryStore::new();
        let snapshot = PlayerSnapshot {
            allocations: vec![
                SavedAllocation {
                    node_id: NodeId::from("node_1"),
                    rank: 1,
                    spent: 2,
                },
                SavedAllocation {
                    node_id: NodeId::from("removed_node"),
                    rank: 1,
                    spent: 3,
                },
            ],
            available_points: 1,
            board_connections: vec![BoardConnection::new("ext_1", "retired_board")],
        };
        store.save(&CharacterId::from("old"), &snapshot).unwrap();

        let engine = AllocationEngine::builder()
            .tree(test_tree())
            .character("old")
            .store(Box::new(store))
            .build_ready()
            .unwrap();
        assert_eq!(engine.available_points(), 4);
        assert!(engine.player().is_allocated("node_1"));
        assert!(engine.player().is_allocated(ROOT_NODE_ID));
        assert!(!engine.player().is_allocated("removed_node"));
        assert!(engine.connected_boards().is_empty());
    }

    fn engine_from_save(tree: Tree, snapshot: PlayerSnapshot) -> AllocationEngine {
        let mut store = MemoryStore::new();
        store.save(&CharacterId::from("saved"), &snapshot).unwrap();
        AllocationEngine::builder()
            .tree(tree)
            .character("saved")
            .store(Box::new(store))
            .build_ready()
            .unwrap()
    }

    #[test]
    fn saved_connections_replayed_under_connect_rules() {
        let core = test_tree().core_board().clone();
        let tree = Tree::new(
            core,
            vec![extension("boardA", "a", None), extension("boardB", "b", None)],
            1,
        )
        .unwrap();
        let snapshot = PlayerSnapshot {
            allocations: vec![],
            available_points: 5,
            board_connections: vec![
                BoardConnection::new("ext_1", "boardA"),
                BoardConnection::new("ext_1", "boardB"),
                BoardConnection::new("nowhere", "boardB"),
                BoardConnection::new("ext_2", "boardB"),
            ],
        };
        let engine = engine_from_save(tree, snapshot);
        assert_eq!(engine.connected_boards(), &[BoardConnection::new("ext_1", "boardA")]);
    }

    #[test]
    fn saved_connections_need_an_attached_host() {
        let snapshot = PlayerSnapshot {
            allocations: vec![],
            available_points: 5,
            board_connections: vec![
                BoardConnection::new("a_ext", "boardB"),
                BoardConnection::new("ext_1", "boardA"),
                BoardConnection::new("ext_2", "boardA"),
                BoardConnection::new("ext_2", "core"),
            ],
        };
        let mut engine = engine_from_save(test_tree(), snapshot);
        assert_eq!(engine.connected_boards(), &[BoardConnection::new("ext_1", "boardA")]);
        engine.disconnect_board("boardA").unwrap();
        assert!(engine.connected_boards().is_empty());
    }

    #[test]
    fn saved_rank_above_maximum_is_clamped() {
        let snapshot = PlayerSnapshot {
            allocations: vec![SavedAllocation {
                node_id: NodeId::from("life"),
                rank: 9,
                spent: 9,
            }],
            available_points: 1,
            board_connections: vec![],
        };
        let mut engine = engine_from_save(test_tree(), snapshot);
        assert_eq!(engine.find_node_by_id("life").unwrap().current_rank(), 3);
        assert_eq!(engine.player().allocation("life").unwrap().rank, 3);
        assert_eq!(engine.current_stats().unwrap().get("life"), Some(&30.0));

        engine.deallocate_node("life").unwrap();
        assert_eq!(engine.available_points(), 10);
    }

    /// Accepts nothing; every write fails.
    struct BrokenStore;

    impl PlayerStore for BrokenStore {
        fn has(&self, _: &CharacterId) -> bool {
            false
        }

        fn load(&self, character: &CharacterId) -> Result<PlayerSnapshot, PersistenceError> {
            Err(PersistenceError::NotFound(character.clone()))
        }

        fn save(&mut self, _: &CharacterId, _: &PlayerSnapshot) -> Result<(), PersistenceError> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into())
        }

        fn clear(&mut self, _: &CharacterId) -> Result<(), PersistenceError> {
            Ok(())
        }
    }

    #[test]
    fn failed_auto_save_keeps_mutation() {
        let mut engine = AllocationEngine::builder()
            .tree(test_tree())
            .config(EngineConfig {
                initial_points: 5,
                ..EngineConfig::default()
            })
            .store(Box::new(BrokenStore))
            .build_ready()
            .unwrap();
        let log = recorder(&mut engine);

        assert_eq!(engine.allocate_node("node_1").unwrap(), 1);
        assert!(engine.player().is_allocated("node_1"));
        assert_eq!(engine.available_points(), 3);
        assert_eq!(engine.current_stats().unwrap().get("strength"), Some(&5.0));
        assert_eq!(*log.borrow(), vec!["alloc:node_1:1", "stats"]);

        assert!(matches!(
            engine.save_progress(),
            Err(AllocationError::Persistence(PersistenceError::Io(_)))
        ));
        assert!(engine.player().is_allocated("node_1"));
    }

    #[test]
    fn reset_restores_initial_state() {
        let mut engine = engine_with(6);
        engine.allocate_node("node_1").unwrap();
        engine.connect_board("ext_1", "boardA").unwrap();
        engine.reset_progress().unwrap();
        assert_eq!(engine.available_points(), 6);
        assert!(engine.connected_boards().is_empty());
        assert_eq!(engine.allocated_nodes().len(), 1);
        assert_eq!(engine.find_node_by_id("node_1").unwrap().current_rank(), 0);
        assert!(engine.current_stats().unwrap().is_empty());
    }

    #[test]
    fn empty_core_is_regenerated_on_initialize() {
        let empty = Board::new("core", BoardKind::Core, BoardSize::new(7, 7));
        let tree = Tree::new(empty, vec![], 3).unwrap();
        let engine = AllocationEngine::builder()
            .tree(tree)
            .board_builder(Box::new(TreeDefinition::builtin().unwrap()))
            .build_ready()
            .unwrap();
        assert!(engine.find_node_by_id(ROOT_NODE_ID).is_some());
        assert!(engine.node_at(3, 3).unwrap().is_root());
    }

    #[test]
    fn query_surface() {
        let mut engine = engine_with(5);
        assert_eq!(engine.all_nodes().len(), 4);
        engine.connect_board("ext_1", "boardA").unwrap();
        assert_eq!(engine.all_nodes().len(), 6);
        assert_eq!(engine.node_at(1, 0).unwrap().id.as_str(), "node_1");
        assert!(engine.node_at(2, 2).is_none());
        assert_eq!(engine.node_at_on("boardA", 1, 1).unwrap().id.as_str(), "a_main");
        assert_eq!(engine.nodes_on_board("boardB").unwrap().len(), 2);
        assert!(engine.find_board_by_id("boardA").is_some());
        assert!(engine.can_allocate_node("node_1"));
        assert!(!engine.can_allocate_node("node_2"));
    }

    #[test]
    fn unsubscribed_listener_is_silent() {
        let mut engine = engine_with(5);
        let count = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&count);
        let id = engine.subscribe(Box::new(move |_: &TreeEvent| *counter.borrow_mut() += 1));
        engine.allocate_node("node_1").unwrap();
        assert!(engine.unsubscribe(id).is_some());
        engine.deallocate_node("node_1").unwrap();
        assert_eq!(*count.borrow(), 2);
    }
}
