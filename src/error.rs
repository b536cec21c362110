//! Error types at the library's module boundaries. The binary layer wraps
//! these in `anyhow::Context` the way the teacher crate does at its call
//! sites.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path} as JSON")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("region {0:?} not found in config")]
    UnknownRegion(String),

    #[error("source {0:?} not found in config")]
    UnknownSource(String),

    #[error("invalid bbox {0:?}: min must be <= max on each axis (lat may not cross itself)")]
    InvalidBBox([f64; 4]),

    #[error("invalid zoom range [{min}, {max}]: must satisfy 0 <= min <= max <= 22")]
    InvalidZoomRange { min: u8, max: u8 },

    #[error("no region or bbox selection given")]
    NoSelection,

    #[error("--region and --bbox are mutually exclusive")]
    ConflictingSelection,

    #[error("source {name:?} is of kind {kind} but is missing its required {field}")]
    MissingSourceField {
        name: String,
        kind: &'static str,
        field: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum TileForgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed writing tile store at {path}")]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open local tile archive at {path}")]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to initialize source {name:?}")]
    SourceInit {
        name: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("local tile archive manifest at {path} is malformed")]
    ArchiveManifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to build region metadata")]
    Metadata(#[source] std::io::Error),

    #[error("run was cancelled")]
    Cancelled,

    #[error("every tile in region {0:?} failed across all sources")]
    AllTilesFailed(String),
}

pub type Result<T> = std::result::Result<T, TileForgeError>;
