use serde::{Deserialize, Serialize};

use super::board::BoardId;

/// A board currently attached at an extension point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoardConnection {
    pub extension_point_id: String,
    pub board_id: BoardId,
}

impl BoardConnection {
    pub fn new(extension_point_id: impl Into<String>, board_id: impl Into<String>) -> Self {
        Self {
            extension_point_id: extension_point_id.into(),
            board_id: BoardId::new(board_id),
        }
    }
}
