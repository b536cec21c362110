//! Local tile archive adapter.
//!
//! spec.md §6 treats the archive interface as opaque, requiring only
//! `Open`, `Bounds`, `ZoomRange`, `GetTile`, `LayerNames`. Rather than
//! fabricate a dependency on a full MBTiles/PMTiles crate the pack doesn't
//! otherwise carry, the archive here is a self-contained, read-only
//! directory-backed format: a `manifest.json` (declared bounds, zoom range,
//! layer names) alongside tiles laid out `<z>/<x>/<y>.<ext>`. The shape of
//! "open once, share a read-only handle across concurrent readers" is
//! grounded on `other_examples/.../versatiles_container-pmtiles-reader.rs.rs`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{SourceSpec, TileKind};
use crate::error::TileForgeError;
use crate::geometry::{BBox, TileCoord};
use crate::validator::{Classification, Validator};

use super::{Source, TileResult};

const RASTER_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];
const VECTOR_EXTENSIONS: &[&str] = &["pbf", "pbf.gz", "mvt"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveManifest {
    /// `[min_lng, min_lat, max_lng, max_lat]`
    pub bounds: [f64; 4],
    pub min_zoom: u8,
    pub max_zoom: u8,

    #[serde(default)]
    pub layer_names: Vec<String>,
}

/// A read-only, opened local tile archive. Safe to share across concurrent
/// readers because it never mutates after `open`.
#[derive(Debug)]
pub struct LocalArchive {
    root: PathBuf,
    manifest: ArchiveManifest,
}

impl LocalArchive {
    pub async fn open(path: &Path) -> Result<Self, TileForgeError> {
        let manifest_path = path.join("manifest.json");
        let raw = tokio::fs::read_to_string(&manifest_path)
            .await
            .map_err(|source| TileForgeError::Archive {
                path: path.to_owned(),
                source,
            })?;
        let manifest: ArchiveManifest =
            serde_json::from_str(&raw).map_err(|source| TileForgeError::ArchiveManifest {
                path: manifest_path.clone(),
                source,
            })?;

        Ok(LocalArchive {
            root: path.to_owned(),
            manifest,
        })
    }

    pub fn bounds(&self) -> BBox {
        let [min_lng, min_lat, max_lng, max_lat] = self.manifest.bounds;
        BBox::new(min_lng, min_lat, max_lng, max_lat)
    }

    pub fn zoom_range(&self) -> (u8, u8) {
        (self.manifest.min_zoom, self.manifest.max_zoom)
    }

    pub fn layer_names(&self) -> &[String] {
        &self.manifest.layer_names
    }

    /// Looks up a tile by trying each extension plausible for `kind` in turn.
    /// Returns `None` when no file is present for any extension.
    pub async fn get_tile(&self, coord: TileCoord, kind: TileKind) -> std::io::Result<Option<Vec<u8>>> {
        let extensions = match kind {
            TileKind::Raster => RASTER_EXTENSIONS,
            TileKind::Vector => VECTOR_EXTENSIONS,
        };

        for ext in extensions {
            let path = self
                .root
                .join(coord.z.to_string())
                .join(coord.x.to_string())
                .join(format!("{}.{}", coord.y, ext));

            match tokio::fs::read(&path).await {
                Ok(bytes) => return Ok(Some(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(None)
    }
}

#[derive(Debug)]
pub struct LocalSource {
    name: String,
    tile_kind: TileKind,
    min_zoom: Option<u8>,
    max_zoom: Option<u8>,
    archive: Arc<LocalArchive>,
    validator: Arc<Validator>,
}

impl LocalSource {
    pub fn new(spec: &SourceSpec, archive: Arc<LocalArchive>, validator: Arc<Validator>) -> Self {
        let (archive_min, archive_max) = archive.zoom_range();
        LocalSource {
            name: spec.name.clone(),
            tile_kind: spec.tile_kind,
            min_zoom: Some(spec.min_zoom.unwrap_or(archive_min)),
            max_zoom: Some(spec.max_zoom.unwrap_or(archive_max)),
            archive,
            validator,
        }
    }
}

#[async_trait]
impl Source for LocalSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn tile_kind(&self) -> TileKind {
        self.tile_kind
    }

    fn min_zoom(&self) -> Option<u8> {
        self.min_zoom
    }

    fn max_zoom(&self) -> Option<u8> {
        self.max_zoom
    }

    fn bounds(&self) -> Option<BBox> {
        Some(self.archive.bounds())
    }

    async fn fetch(&self, coord: TileCoord) -> TileResult {
        if !self.accepts(coord) {
            return TileResult::NotFound;
        }

        let bytes = match self.archive.get_tile(coord, self.tile_kind).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return TileResult::NotFound,
            Err(e) => {
                return TileResult::Transient {
                    reason: format!("archive read error: {e}"),
                }
            }
        };

        if bytes.is_empty() {
            return TileResult::Empty;
        }

        let gzipped = self.tile_kind == TileKind::Vector && looks_gzipped(&bytes);
        let bytes = match self.validator.maybe_decompress(bytes, gzipped) {
            Ok(b) => b,
            Err(e) => {
                return TileResult::Invalid {
                    reason: format!("gzip decode failed: {e}"),
                }
            }
        };

        match self.validator.classify(self.tile_kind, &bytes) {
            Classification::Valid { content_type } => TileResult::Got {
                bytes,
                content_type: Some(content_type.to_string()),
                source_name: self.name.clone(),
            },
            Classification::Empty => TileResult::Empty,
            Classification::Invalid { reason } => TileResult::Invalid { reason },
        }
    }
}

fn looks_gzipped(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1F && bytes[1] == 0x8B
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_manifest(dir: &Path, manifest: &ArchiveManifest) {
        let json = serde_json::to_string(manifest).unwrap();
        tokio::fs::write(dir.join("manifest.json"), json).await.unwrap();
    }

    #[tokio::test]
    async fn opens_and_reads_tile() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            &ArchiveManifest {
                bounds: [-10.0, -10.0, 10.0, 10.0],
                min_zoom: 0,
                max_zoom: 5,
                layer_names: vec!["roads".into()],
            },
        )
        .await;

        let tile_dir = dir.path().join("3").join("4");
        tokio::fs::create_dir_all(&tile_dir).await.unwrap();
        tokio::fs::write(tile_dir.join("5.png"), b"fake-png-bytes").await.unwrap();

        let archive = LocalArchive::open(dir.path()).await.unwrap();
        assert_eq!(archive.zoom_range(), (0, 5));
        assert_eq!(archive.layer_names(), &["roads".to_string()]);

        let tile = archive.get_tile(TileCoord::new(3, 4, 5), TileKind::Raster).await.unwrap();
        assert_eq!(tile, Some(b"fake-png-bytes".to_vec()));

        let missing = archive.get_tile(TileCoord::new(3, 4, 6), TileKind::Raster).await.unwrap();
        assert_eq!(missing, None);
    }
}
