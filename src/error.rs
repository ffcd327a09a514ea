use thiserror::Error;

/// crate specific Result type
pub type Result<T> = std::result::Result<T, Error>;

/// crate specific Error enum
///
/// Variants are grouped by kind rather than by origin: configuration
/// problems are fatal and surfaced to the CLI, store I/O is retried before
/// becoming fatal, and per-input failures are recorded in the manifest
/// without stopping the build.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or inconsistent configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Object store or local filesystem failure that survived its retries
    #[error("i/o failure: {0}")]
    Io(String),

    /// Malformed chunk payload or mismatched point count on decode
    #[error("corrupt chunk data: {0}")]
    Decode(String),

    /// A single input file could not be read or its pipeline failed;
    /// recorded against that file and skipped
    #[error("input error: {0}")]
    Input(String),

    /// The scanner could not obtain a preview for an input
    #[error("no preview available: {0}")]
    ShallowInfo(String),

    /// Unrecoverable inconsistency
    #[error("fatal: {0}")]
    Fatal(String),

    /// [std::io::Error]
    #[error(transparent)]
    Std(#[from] std::io::Error),

    /// [las::Error]
    #[error(transparent)]
    Las(#[from] las::Error),

    /// [laz::LasZipError]
    #[error(transparent)]
    LasZip(#[from] laz::LasZipError),

    /// [serde_json::Error]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Collapse to the manifest error-list form.
    pub fn to_entry(&self) -> String {
        self.to_string()
    }
}
