/// Per-character storage of player progress.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::state::PlayerSnapshot;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("no saved progress for character '{0}'")]
    NotFound(CharacterId),
    #[error("invalid character id '{0}'")]
    InvalidCharacterId(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("RON serialization error: {0}")]
    Serialize(#[from] ron::Error),
}

/// Newtype wrapper for character keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CharacterId(pub String);

impl CharacterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CharacterId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for CharacterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Blocking storage for player snapshots, keyed by character.
pub trait PlayerStore {
    fn has(&self, character: &CharacterId) -> bool;
    fn load(&self, character: &CharacterId) -> Result<PlayerSnapshot, PersistenceError>;
    fn save(&mut self, character: &CharacterId, snapshot: &PlayerSnapshot) -> Result<(), PersistenceError>;
    fn clear(&mut self, character: &CharacterId) -> Result<(), PersistenceError>;
}

/// Keeps snapshots in memory. Useful for tests and short-lived sessions.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    snapshots: FxHashMap<CharacterId, PlayerSnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl PlayerStore for MemoryStore {
    fn has(&self, character: &CharacterId) -> bool {
        self.snapshots.contains_key(character)
    }

    fn load(&self, character: &CharacterId) -> Result<PlayerSnapshot, PersistenceError> {
        self.snapshots
            .get(character)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(character.clone()))
    }

    fn save(&mut self, character: &CharacterId, snapshot: &PlayerSnapshot) -> Result<(), PersistenceError> {
        self.snapshots.insert(character.clone(), snapshot.clone());
        Ok(())
    }

    fn clear(&mut self, character: &CharacterId) -> Result<(), PersistenceError> {
        self.snapshots.remove(character);
        Ok(())
    }
}

/// One pretty-printed RON file per character, `<dir>/<character>.ron`.
#[derive(Debug, Clone)]
pub struct RonFileStore {
    dir: PathBuf,
}

impl RonFileStore {
    /// Use `dir` for save files, creating it if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, character: &CharacterId) -> Result<PathBuf, PersistenceError> {
        let id = character.as_str();
        let valid = !id.is_empty()
            && id != "."
            && id != ".."
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return Err(PersistenceError::InvalidCharacterId(id.to_string()));
        }
        Ok(self.dir.join(format!("{}.ron", id)))
    }
}

impl PlayerStore for RonFileStore {
    fn has(&self, character: &CharacterId) -> bool {
        self.path_for(character).map(|p| p.is_file()).unwrap_or(false)
    }

    fn load(&self, character: &CharacterId) -> Result<PlayerSnapshot, PersistenceError> {
        let path = self.path_for(character)?;
        if !path.is_file() {
            return Err(PersistenceError::NotFound(character.clone()));
        }
        let contents = std::fs::read_to_string(&path)?;
        Ok(ron::from_str(&contents)?)
    }

    fn save(&mut self, character: &CharacterId, snapshot: &PlayerSnapshot) -> Result<(), PersistenceError> {
        let path = self.path_for(character)?;
        let serialized = ron::ser::to_string_pretty(snapshot, ron::ser::PrettyConfig::default())?;
        std::fs::write(path, serialized)?;
        Ok(())
    }

    fn clear(&mut self, character: &CharacterId) -> Result<(), PersistenceError> {
        let path = self.path_for(character)?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
