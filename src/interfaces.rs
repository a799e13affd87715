use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid database file (JSON): {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid database file: {0}")]
    InvalidArchive(String),
    #[error("no database path set")]
    NoPath,
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("address 0x{0:X} is not accessible")]
    NotAccessible(u64),
    #[error("OS error: {0}")]
    OsError(String),
}

#[derive(Debug, Error)]
pub enum PatchFileError {
    #[error("no patches to apply")]
    NoPatches,
    #[error("not all patches are in module {0}")]
    MixedModules(String),
    #[error("failed to get base of module {0}")]
    ModuleNotLoaded(String),
    #[error("failed to get module path of module {0}")]
    ModulePathUnknown(String),
    #[error("failed to make a copy of the original file (patch target is in use?): {0}")]
    CopyFailed(std::io::Error),
    #[error("failed to map the copied file: {0}")]
    MapFailed(std::io::Error),
    #[error("copied file is not a valid executable image")]
    InvalidImage,
}

/// Module enumeration lives in the debug-event loop; this layer only asks
/// where things are *right now*.
pub trait ModuleResolver: Send + Sync {
    /// Current load base of a module, `None` when it is not loaded.
    fn base_of(&self, name: &str) -> Option<u64>;
    /// Name of the module containing `va`, `None` for unmapped/anonymous memory.
    fn name_of(&self, va: u64) -> Option<String>;
    /// On-disk path of the module containing `va`.
    fn path_of(&self, va: u64) -> Option<PathBuf>;
}

pub trait MemoryAccess: Send + Sync {
    fn is_readable(&self, va: u64) -> bool;
    fn read(&self, va: u64, len: usize) -> Result<Vec<u8>, MemoryError>;
    fn write(&self, va: u64, data: &[u8]) -> Result<(), MemoryError>;
}

/// Save/load extension point for plugins. The returned tree is merged under
/// the document's `plugins` key and handed back verbatim on load.
pub trait PluginStorage: Send + Sync {
    fn save(&self) -> Option<serde_json::Value>;
    fn load(&self, plugins: &serde_json::Value);
}
