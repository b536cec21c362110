//! Uniform `Fetch(z, x, y) -> TileResult` facade over HTTP tile servers and
//! local tile archives.
//!
//! Grounded on `other_examples/.../martin-core-src-tiles-source.rs.rs`'s
//! boxed, `Send + Sync` async trait shape, adapted from martin's
//! `Result<TileData>` return to this engine's closed `TileResult` variant
//! set so the retry/fallback state machine in `pipeline.rs` can match
//! exhaustively.

pub mod http;
pub mod local;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::TileKind;
use crate::geometry::{BBox, TileCoord};

/// Outcome of a single fetch attempt against one source.
#[derive(Debug, Clone)]
pub enum TileResult {
    Got {
        bytes: Vec<u8>,
        content_type: Option<String>,
        source_name: String,
    },
    Empty,
    NotFound,
    Transient { reason: String },
    Invalid { reason: String },
}

impl TileResult {
    pub fn is_transient(&self) -> bool {
        matches!(self, TileResult::Transient { .. })
    }
}

/// A tile source: either a remote HTTP tile server or a local archive.
#[async_trait]
pub trait Source: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn tile_kind(&self) -> TileKind;
    fn min_zoom(&self) -> Option<u8>;
    fn max_zoom(&self) -> Option<u8>;
    fn bounds(&self) -> Option<BBox>;

    /// Whether this source could conceivably serve `coord`, based solely on
    /// its declared zoom range and bounds — used by the pipeline's prefilter
    /// so doomed requests are never issued.
    fn accepts(&self, coord: TileCoord) -> bool {
        if let Some(min) = self.min_zoom() {
            if coord.z < min {
                return false;
            }
        }
        if let Some(max) = self.max_zoom() {
            if coord.z > max {
                return false;
            }
        }
        if let Some(bounds) = self.bounds() {
            let tile_bounds = crate::geometry::tile_bounds(coord.x, coord.y, coord.z);
            let disjoint = tile_bounds.max_lng < bounds.min_lng
                || tile_bounds.min_lng > bounds.max_lng
                || tile_bounds.max_lat < bounds.min_lat
                || tile_bounds.min_lat > bounds.max_lat;
            if disjoint {
                return false;
            }
        }
        true
    }

    async fn fetch(&self, coord: TileCoord) -> TileResult;
}

pub type BoxedSource = Arc<dyn Source>;
