//! Error types for qor-engine

use thiserror::Error;

/// Every failure mode the engine can return, matching the stable error
/// code list of the on-disk format and kernel contracts.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("null pointer passed where a value was required")]
    NullPointer,

    #[error("failed to open model file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("failed to stat model file")]
    FileStat,

    #[error("model file is smaller than the header size")]
    FileTooSmall,

    #[error("failed to memory-map model file: {0}")]
    MmapFailed(String),

    #[error("invalid magic number in model file header")]
    InvalidMagic,

    #[error("allocation failed")]
    AllocFailed,

    #[error("scratch arena exhausted")]
    ArenaOom,

    #[error("invalid model configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("output buffer aliases an input buffer")]
    Aliasing,

    #[error("arithmetic overflow computing tensor or offset size")]
    Overflow,

    #[error("buffer is not aligned to the required boundary")]
    Misaligned,

    #[error("unexpected tensor element type")]
    InvalidDtype,

    #[error("invalid tensor or vector size: {0}")]
    InvalidSize(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
