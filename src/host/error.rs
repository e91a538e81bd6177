use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced to the host. Nothing here ever crosses into a module.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Failed to load module '{path}': {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Symbol '{symbol}' not found in '{path}'")]
    SymbolNotFound { symbol: String, path: PathBuf },

    #[error("Module '{module}' was built against ABI v{found}, host speaks v{expected}")]
    IncompatibleAbi {
        module: String,
        expected: u32,
        found: u32,
    },

    #[error("Module '{module}' failed to initialize (OnLoad returned {code})")]
    InitFailed { module: String, code: i32 },

    #[error("Module '{0}' is already loaded")]
    AlreadyLoaded(String),

    #[error("Module '{0}' is shutting down")]
    ShuttingDown(String),

    #[error("Module '{module}' does not export {entry_point}")]
    EntryPointMissing {
        module: String,
        entry_point: &'static str,
    },
}

pub type HostResult<T> = Result<T, HostError>;
