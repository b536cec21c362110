//! After acquisition, walks the on-disk tile tree and emits a per-region
//! JSON summary. A pure function of the tile tree — metadata rebuilds never
//! depend on in-memory pipeline state, so a rebuild after a crash or a
//! manual edit to the tree reflects exactly what's on disk.
//!
//! No teacher equivalent exists (the teacher never summarizes its output);
//! the directory-walk approach is grounded on `walkdir` usage elsewhere in
//! the pack (see DESIGN.md).

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::config::RegionSpec;
use crate::error::TileForgeError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegionInfo {
    pub bbox: [f64; 4],
    pub center: [f64; 2],
    pub min_zoom: u8,
    pub max_zoom: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceTileStats {
    pub tile_count: usize,
    pub available_zooms: Vec<u8>,
    pub min_zoom: u8,
    pub max_zoom: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegionMetadata {
    pub region_info: RegionInfo,
    pub raster: HashMap<String, SourceTileStats>,
    pub vector: HashMap<String, SourceTileStats>,
}

/// Counts tiles and zoom levels present under `<output_dir>/<region>/<kind>/<source>/`.
fn scan_kind_dir(kind_dir: &Path) -> HashMap<String, SourceTileStats> {
    let mut stats = HashMap::new();

    let Ok(entries) = std::fs::read_dir(kind_dir) else {
        return stats;
    };

    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let source_name = entry.file_name().to_string_lossy().into_owned();
        let source_dir = entry.path();

        let mut zooms = BTreeSet::new();
        let mut tile_count = 0usize;

        for z_entry in WalkDir::new(&source_dir).min_depth(1).max_depth(1).into_iter().flatten() {
            if !z_entry.file_type().is_dir() {
                continue;
            }
            let Some(z) = z_entry.file_name().to_str().and_then(|s| s.parse::<u8>().ok()) else {
                continue;
            };

            let count = WalkDir::new(z_entry.path())
                .min_depth(2)
                .max_depth(2)
                .into_iter()
                .flatten()
                .filter(|e| e.file_type().is_file())
                .count();

            if count > 0 {
                zooms.insert(z);
                tile_count += count;
            }
        }

        if tile_count == 0 {
            continue;
        }

        let min_zoom = *zooms.iter().next().unwrap();
        let max_zoom = *zooms.iter().next_back().unwrap();

        stats.insert(
            source_name,
            SourceTileStats {
                tile_count,
                available_zooms: zooms.into_iter().collect(),
                min_zoom,
                max_zoom,
            },
        );
    }

    stats
}

pub fn build(output_dir: &Path, region_name: &str, region_spec: &RegionSpec) -> RegionMetadata {
    let region_dir = output_dir.join(region_name);
    let bbox = region_spec.bbox;
    let (center_lng, center_lat) = region_spec.bbox().center();

    RegionMetadata {
        region_info: RegionInfo {
            bbox,
            center: [center_lng, center_lat],
            min_zoom: region_spec.min_zoom,
            max_zoom: region_spec.max_zoom,
        },
        raster: scan_kind_dir(&region_dir.join("raster")),
        vector: scan_kind_dir(&region_dir.join("vector")),
    }
}

/// Writes `<output_dir>/metadata/regions/<region>.json` atomically (temp file
/// + rename), matching the tile store's write discipline.
pub async fn write_atomic(output_dir: &Path, region_name: &str, metadata: &RegionMetadata) -> Result<(), TileForgeError> {
    let dir = output_dir.join("metadata").join("regions");
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(TileForgeError::Metadata)?;

    let final_path = dir.join(format!("{region_name}.json"));
    let tmp_path = dir.join(format!("{region_name}.json.tmp"));

    let json = serde_json::to_vec_pretty(metadata).expect("RegionMetadata always serializes");
    tokio::fs::write(&tmp_path, &json).await.map_err(TileForgeError::Metadata)?;
    tokio::fs::rename(&tmp_path, &final_path).await.map_err(TileForgeError::Metadata)?;

    Ok(())
}
