//! Writes tiles to `<out>/<region>/<raster|vector>/<source>/<z>/<x>/<y>.<ext>`.
//! Idempotent and crash-safe: payloads are written to a `.tmp` sibling and
//! atomically renamed into place.
//!
//! Grounded on the teacher's `fetch_existing`/`output_file.exists()` skip
//! check and `fs::create_dir_all` directory-on-demand pattern in the
//! original `src/tile.rs`, extended with the tmp-then-rename discipline
//! spec.md §4.5 requires (the teacher writes directly to the final path,
//! which isn't crash-safe).

use std::path::{Path, PathBuf};

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use crate::config::TileKind;
use crate::error::TileForgeError;
use crate::geometry::TileCoord;

const PATH_UNSAFE: &AsciiSet = &CONTROLS.add(b'/').add(b'\\').add(b' ').add(b'?').add(b'#');

fn encode_component(raw: &str) -> String {
    utf8_percent_encode(raw, PATH_UNSAFE).to_string()
}

#[derive(Debug, Clone)]
pub struct TileStore {
    root: PathBuf,
}

impl TileStore {
    pub fn new(root: PathBuf) -> Self {
        TileStore { root }
    }

    fn kind_dir(kind: TileKind) -> &'static str {
        match kind {
            TileKind::Raster => "raster",
            TileKind::Vector => "vector",
        }
    }

    pub fn path_for(&self, region: &str, source: &str, kind: TileKind, coord: TileCoord, ext: &str) -> PathBuf {
        self.root
            .join(encode_component(region))
            .join(Self::kind_dir(kind))
            .join(encode_component(source))
            .join(coord.z.to_string())
            .join(coord.x.to_string())
            .join(format!("{}.{}", coord.y, ext))
    }

    pub fn region_kind_source_dir(&self, region: &str, source: &str, kind: TileKind) -> PathBuf {
        self.root
            .join(encode_component(region))
            .join(Self::kind_dir(kind))
            .join(encode_component(source))
    }

    pub async fn exists(&self, region: &str, source: &str, kind: TileKind, coord: TileCoord, ext: &str) -> bool {
        tokio::fs::metadata(self.path_for(region, source, kind, coord, ext))
            .await
            .is_ok()
    }

    /// Like `exists`, but tries every extension plausible for `kind` rather
    /// than one specific one. Used to resume a run without re-deriving the
    /// content-type a previous attempt stored the tile under.
    pub async fn exists_any_extension(&self, region: &str, source: &str, kind: TileKind, coord: TileCoord) -> bool {
        for ext in known_extensions(kind) {
            if self.exists(region, source, kind, coord, ext).await {
                return true;
            }
        }
        false
    }

    /// Writes `bytes` to the final tile path via a temp file + atomic rename.
    /// Creates parent directories on demand.
    pub async fn store(
        &self,
        region: &str,
        source: &str,
        kind: TileKind,
        coord: TileCoord,
        ext: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, TileForgeError> {
        let final_path = self.path_for(region, source, kind, coord, ext);
        let parent = final_path.parent().expect("tile path always has a parent");

        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| TileForgeError::Store {
                path: parent.to_owned(),
                source,
            })?;

        let tmp_path = final_path.with_extension(format!("{ext}.tmp"));
        tokio::fs::write(&tmp_path, bytes)
            .await
            .map_err(|source| TileForgeError::Store {
                path: tmp_path.clone(),
                source,
            })?;

        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|source| TileForgeError::Store {
                path: final_path.clone(),
                source,
            })?;

        Ok(final_path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Picks the on-disk extension for a stored tile. Raster extensions are
/// derived from content-type (defaulting to `png`); vector tiles are always
/// stored decompressed as `.pbf`, per spec.md §3.
pub fn extension_for(kind: TileKind, content_type: Option<&str>) -> &'static str {
    match kind {
        TileKind::Vector => "pbf",
        TileKind::Raster => match content_type {
            Some("image/jpeg") => "jpg",
            Some("image/webp") => "webp",
            _ => "png",
        },
    }
}

fn known_extensions(kind: TileKind) -> &'static [&'static str] {
    match kind {
        TileKind::Raster => &["png", "jpg", "webp"],
        TileKind::Vector => &["pbf"],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_then_exists_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path().to_owned());
        let coord = TileCoord::new(5, 10, 11);

        assert!(!store.exists("istanbul", "cdb", TileKind::Raster, coord, "png").await);

        let path = store
            .store("istanbul", "cdb", TileKind::Raster, coord, "png", b"tile-bytes")
            .await
            .unwrap();

        assert!(path.exists());
        assert!(store.exists("istanbul", "cdb", TileKind::Raster, coord, "png").await);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"tile-bytes");

        // no leftover temp file
        assert!(!path.with_extension("png.tmp").exists());
    }

    #[tokio::test]
    async fn exists_any_extension_finds_tile_stored_under_a_different_extension() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(dir.path().to_owned());
        let coord = TileCoord::new(5, 10, 11);

        assert!(!store.exists_any_extension("istanbul", "cdb", TileKind::Raster, coord).await);

        store
            .store("istanbul", "cdb", TileKind::Raster, coord, "jpg", b"tile-bytes")
            .await
            .unwrap();

        assert!(store.exists_any_extension("istanbul", "cdb", TileKind::Raster, coord).await);
        assert!(!store.exists("istanbul", "cdb", TileKind::Raster, coord, "png").await);
    }

    #[test]
    fn extension_defaults_to_png() {
        assert_eq!(extension_for(TileKind::Raster, None), "png");
        assert_eq!(extension_for(TileKind::Raster, Some("image/jpeg")), "jpg");
        assert_eq!(extension_for(TileKind::Raster, Some("image/webp")), "webp");
        assert_eq!(extension_for(TileKind::Vector, Some("application/x-protobuf")), "pbf");
    }

    #[test]
    fn path_components_are_percent_encoded() {
        let store = TileStore::new(PathBuf::from("/out"));
        let path = store.path_for("my region", "a/b", TileKind::Raster, TileCoord::new(1, 1, 1), "png");
        assert!(path.to_string_lossy().contains("my%20region"));
        assert!(path.to_string_lossy().contains("a%2Fb"));
    }
}
