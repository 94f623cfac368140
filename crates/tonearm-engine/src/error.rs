use std::path::PathBuf;

use thiserror::Error;
use tonearm_types::{ComponentKind, ComponentName};

/// Failures while opening or validating a plugin library.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to open plugin library {path:?}: {message}")]
    Open { path: PathBuf, message: String },

    #[error("plugin library {path:?} does not export `{symbol}`")]
    MissingSymbol { path: PathBuf, symbol: &'static str },

    #[error("plugin library {path:?} reports an empty identity")]
    EmptyIdentity { path: PathBuf },

    #[error("plugin library {path:?} targets ABI {found}, host supports {expected}")]
    AbiMismatch {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("plugin library {path:?} changed identity from `{expected}` to `{found}`")]
    IdentityChanged {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("module `{0}` is already registered")]
    DuplicateModule(String),
}

/// Misuse of the engine surface by a caller.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("component {name} is a {actual}, expected a {expected}")]
    WrongKind {
        name: ComponentName,
        expected: ComponentKind,
        actual: ComponentKind,
    },

    #[error("component {0} not found")]
    NotFound(ComponentName),

    #[error("no {0} configured")]
    NotConfigured(ComponentKind),
}
