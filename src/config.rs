//! The immutable `Config` value and its JSON loader.
//!
//! Generalizes the teacher's single-URL, single-bbox CLI args (`src/config.rs`
//! in the original) into the multi-region, multi-source document this engine
//! needs, read once at startup and never mutated afterwards.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::geometry::BBox;

fn default_workers_per_source() -> usize {
    8
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_vector_first() -> bool {
    true
}

fn default_user_agent() -> String {
    format!("tile-forge/{}", env!("CARGO_PKG_VERSION"))
}

/// The built-in "known-empty tile" fingerprint set. Empty by default:
/// transparent PNGs are detected structurally by the validator (no single
/// byte sequence represents "transparent" across PNG encoders, so a
/// fingerprint can't cover them), and there's no other placeholder blob
/// common enough across tile servers to bundle as a default. Operators who
/// know their sources serve a specific blank-tile sentinel (a fixed JPEG or
/// WebP placeholder, say) can add its sha256 digest here.
pub(crate) fn default_empty_tile_fingerprints() -> Vec<String> {
    Vec::new()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileKind {
    Raster,
    Vector,
}

impl std::fmt::Display for TileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TileKind::Raster => write!(f, "raster"),
            TileKind::Vector => write!(f, "vector"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Http,
    Local,
}

/// A single configured tile source, in the order it should be tried.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    pub name: String,
    pub kind: SourceKind,
    pub tile_kind: TileKind,

    #[serde(default)]
    pub url_template: Option<String>,

    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub min_zoom: Option<u8>,

    #[serde(default)]
    pub max_zoom: Option<u8>,
}

impl SourceSpec {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.kind {
            SourceKind::Http if self.url_template.is_none() => Err(ConfigError::MissingSourceField {
                name: self.name.clone(),
                kind: "http",
                field: "urlTemplate",
            }),
            SourceKind::Local if self.path.is_none() => Err(ConfigError::MissingSourceField {
                name: self.name.clone(),
                kind: "local",
                field: "path",
            }),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionSpec {
    /// `[min_lng, min_lat, max_lng, max_lat]`
    pub bbox: [f64; 4],
    pub min_zoom: u8,
    pub max_zoom: u8,

    #[serde(default)]
    pub description: Option<String>,
}

impl RegionSpec {
    pub fn bbox(&self) -> BBox {
        BBox::new(self.bbox[0], self.bbox[1], self.bbox[2], self.bbox[3])
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let [min_lng, min_lat, max_lng, max_lat] = self.bbox;
        if min_lat > max_lat || !(-90.0..=90.0).contains(&min_lat) || !(-90.0..=90.0).contains(&max_lat) {
            return Err(ConfigError::InvalidBBox(self.bbox));
        }
        if !(-180.0..=180.0).contains(&min_lng) || !(-180.0..=180.0).contains(&max_lng) {
            return Err(ConfigError::InvalidBBox(self.bbox));
        }
        if self.min_zoom > self.max_zoom || self.max_zoom > 22 {
            return Err(ConfigError::InvalidZoomRange {
                min: self.min_zoom,
                max: self.max_zoom,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub regions: HashMap<String, RegionSpec>,
    pub sources: Vec<SourceSpec>,
    pub output_dir: PathBuf,

    #[serde(default = "default_workers_per_source")]
    pub workers_per_source: usize,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_vector_first")]
    pub vector_first: bool,

    #[serde(default = "default_empty_tile_fingerprints")]
    pub empty_tile_fingerprints: Vec<String>,
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for region in self.regions.values() {
            region.validate()?;
        }
        for source in &self.sources {
            source.validate()?;
        }
        Ok(())
    }
}

/// Reads and validates the config file at `path`. Unknown JSON fields are
/// ignored, matching spec.md §6.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;

    let config: Config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })?;

    config.validate()?;
    Ok(config)
}
