/// Engine configuration, loadable from RON.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Budget used for checks while the unlimited-points debug mode is on.
pub const UNLIMITED_POINT_BUDGET: u32 = 999_999;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
}

/// How deallocation refunds interact with the point budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RefundPolicy {
    /// Refund everything that was spent on the node.
    #[default]
    Full,
    /// Refund, but never above `initial_points`.
    CappedAtInitial,
}

/// Whether a deallocation may strand other allocated nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeallocationPolicy {
    /// Any allocated node except the root may be removed.
    #[default]
    Free,
    /// Refuse removals that leave allocated nodes unreachable from the
    /// root or from an active board's entry node.
    PreserveConnectivity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Budget for a new character and after a full reset.
    pub initial_points: u32,
    pub refund_policy: RefundPolicy,
    pub deallocation_policy: DeallocationPolicy,
    /// Starting value of the unlimited-points debug mode.
    pub unlimited_points: bool,
    /// Recompute stats right after every successful mutation.
    pub auto_recalculate: bool,
    /// Snapshot to the store after every successful mutation.
    pub auto_save: bool,
    /// Cap on allocated nodes, root included. `None` means no cap.
    pub max_allocated_nodes: Option<usize>,
    /// Whether allocations on detached boards count toward the cap.
    pub count_detached_allocations: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_points: 20,
            refund_policy: RefundPolicy::Full,
            deallocation_policy: DeallocationPolicy::Free,
            unlimited_points: false,
            auto_recalculate: true,
            auto_save: true,
            max_allocated_nodes: None,
            count_detached_allocations: true,
        }
    }
}

impl EngineConfig {
    /// Load a config from a RON file.
    pub fn load_from_ron(path: &Path) -> Result<EngineConfig, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_ron(&contents)
    }

    /// Parse a config from a RON string. Missing fields take defaults.
    pub fn parse_ron(input: &str) -> Result<EngineConfig, ConfigError> {
        Ok(ron::from_str(input)?)
    }

    /// The refund ceiling the ledger should enforce.
    pub fn point_cap(&self) -> Option<u32> {
        match self.refund_policy {
            RefundPolicy::Full => None,
            RefundPolicy::CappedAtInitial => Some(self.initial_points),
        }
    }
}
