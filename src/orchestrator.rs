//! Wires CLI selection and a loaded `Config` into one or more pipeline runs,
//! then triggers the metadata builder.
//!
//! Grounded on the teacher's `main.rs`, which built a single `Tile`/`UrlFormat`
//! pair from CLI args and drove one `fetch_all` call; generalized here to
//! resolve a `(RegionSpec, Vec<ConfiguredSource>)` pair from either a named
//! region or an ad hoc `--bbox`, and to run every selected region in turn.

use std::collections::HashSet;
use std::sync::Arc;

use log::{info, warn};

use crate::config::{Config, RegionSpec, SourceKind};
use crate::error::{ConfigError, TileForgeError};
use crate::metadata;
use crate::pipeline::{self, CancelToken, ConfiguredSource, RegionAcquisitionReport};
use crate::source::http::HttpSource;
use crate::source::local::{LocalArchive, LocalSource};
use crate::store::TileStore;
use crate::validator::Validator;

/// Resolves which `(region_name, RegionSpec)` to acquire from CLI selection.
pub fn resolve_region(
    config: &Config,
    region: Option<&str>,
    bbox: Option<[f64; 4]>,
    min_zoom: Option<u8>,
    max_zoom: Option<u8>,
) -> Result<(String, RegionSpec), ConfigError> {
    match (region, bbox) {
        (Some(_), Some(_)) => Err(ConfigError::ConflictingSelection),
        (Some(name), None) => {
            let spec = config.regions.get(name).cloned().ok_or_else(|| ConfigError::UnknownRegion(name.to_string()))?;
            Ok((name.to_string(), spec))
        }
        (None, Some(bbox)) => {
            let (min_zoom, max_zoom) = match (min_zoom, max_zoom) {
                (Some(min), Some(max)) => (min, max),
                _ => return Err(ConfigError::NoSelection),
            };
            let spec = RegionSpec {
                bbox,
                min_zoom,
                max_zoom,
                description: None,
            };
            Ok(("adhoc".to_string(), spec))
        }
        (None, None) => Err(ConfigError::NoSelection),
    }
}

/// Builds the candidate source list: every configured source whose name is
/// in `servers` (HTTP) or `sources` (local), or every configured source when
/// both selectors are empty.
pub async fn build_sources(
    config: &Config,
    servers: &[String],
    sources_sel: &[String],
) -> Result<Vec<ConfiguredSource>, TileForgeError> {
    let select_all = servers.is_empty() && sources_sel.is_empty();
    let wanted: HashSet<&str> = servers.iter().chain(sources_sel.iter()).map(String::as_str).collect();

    let validator = Arc::new(Validator::new(&config.empty_tile_fingerprints));
    let mut configured = Vec::new();

    for spec in &config.sources {
        if !select_all && !wanted.contains(spec.name.as_str()) {
            continue;
        }

        let adapter: Arc<dyn crate::source::Source> = match spec.kind {
            SourceKind::Http => {
                let http = HttpSource::new(spec, &config.user_agent, config.timeout(), validator.clone()).map_err(|source| {
                    TileForgeError::SourceInit {
                        name: spec.name.clone(),
                        source,
                    }
                })?;
                Arc::new(http)
            }
            SourceKind::Local => {
                let path = spec.path.clone().ok_or_else(|| {
                    TileForgeError::Config(ConfigError::MissingSourceField {
                        name: spec.name.clone(),
                        kind: "local",
                        field: "path",
                    })
                })?;
                let archive = Arc::new(LocalArchive::open(&path).await?);
                Arc::new(LocalSource::new(spec, archive, validator.clone()))
            }
        };

        configured.push(ConfiguredSource { spec: spec.clone(), adapter });
    }

    if configured.is_empty() {
        warn!("no configured source matched the requested selection");
    }

    Ok(configured)
}

pub struct RunOutcome {
    pub region_name: String,
    pub report: RegionAcquisitionReport,
}

/// Runs acquisition for a single resolved region, then writes its metadata.
pub async fn run_region(
    config: &Config,
    region_name: &str,
    region_spec: &RegionSpec,
    sources: Vec<ConfiguredSource>,
    cancel: CancelToken,
    progress: Option<indicatif::ProgressBar>,
) -> Result<RunOutcome, TileForgeError> {
    let store = Arc::new(TileStore::new(config.output_dir.clone()));
    let sources = Arc::new(sources);

    let report = pipeline::run_region(region_name, region_spec, config, sources, store, cancel, progress).await?;

    let metadata = metadata::build(&config.output_dir, region_name, region_spec);
    metadata::write_atomic(&config.output_dir, region_name, &metadata).await?;

    info!(
        "region {region_name}: metadata written ({} raster sources, {} vector sources)",
        metadata.raster.len(),
        metadata.vector.len()
    );

    Ok(RunOutcome {
        region_name: region_name.to_string(),
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with_region() -> Config {
        let mut regions = HashMap::new();
        regions.insert(
            "istanbul".to_string(),
            RegionSpec {
                bbox: [28.5, 40.8, 29.5, 41.2],
                min_zoom: 10,
                max_zoom: 11,
                description: None,
            },
        );
        Config {
            regions,
            sources: vec![],
            output_dir: std::env::temp_dir(),
            workers_per_source: 8,
            retry_attempts: 3,
            timeout_secs: 30,
            user_agent: "test".into(),
            vector_first: true,
            empty_tile_fingerprints: vec![],
        }
    }

    #[test]
    fn resolve_region_rejects_both_region_and_bbox() {
        let config = config_with_region();
        let result = resolve_region(&config, Some("istanbul"), Some([0.0, 0.0, 1.0, 1.0]), None, None);
        assert!(matches!(result, Err(ConfigError::ConflictingSelection)));
    }

    #[test]
    fn resolve_region_rejects_neither_region_nor_bbox() {
        let config = config_with_region();
        let result = resolve_region(&config, None, None, None, None);
        assert!(matches!(result, Err(ConfigError::NoSelection)));
    }

    #[test]
    fn resolve_region_looks_up_named_region() {
        let config = config_with_region();
        let (name, spec) = resolve_region(&config, Some("istanbul"), None, None, None).unwrap();
        assert_eq!(name, "istanbul");
        assert_eq!(spec.min_zoom, 10);
    }

    #[test]
    fn resolve_region_rejects_unknown_name() {
        let config = config_with_region();
        let result = resolve_region(&config, Some("nowhere"), None, None, None);
        assert!(matches!(result, Err(ConfigError::UnknownRegion(_))));
    }

    #[test]
    fn resolve_region_builds_adhoc_from_bbox_and_zooms() {
        let config = config_with_region();
        let (name, spec) = resolve_region(&config, None, Some([0.0, 0.0, 1.0, 1.0]), Some(5), Some(8)).unwrap();
        assert_eq!(name, "adhoc");
        assert_eq!(spec.min_zoom, 5);
        assert_eq!(spec.max_zoom, 8);
    }

    #[test]
    fn resolve_region_bbox_without_zoom_range_is_no_selection() {
        let config = config_with_region();
        let result = resolve_region(&config, None, Some([0.0, 0.0, 1.0, 1.0]), None, None);
        assert!(matches!(result, Err(ConfigError::NoSelection)));
    }
}
