//! CLI argument parsing.
//!
//! Grounded on the teacher's `args.rs`: a `clap` derive struct with the same
//! region/bbox/zoom-range flag family, extended with `--servers`/`--sources`
//! selection and verbosity flags spec.md §6 requires.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "tile-forge", about = "Bulk map-tile acquisition engine", version)]
pub struct Args {
    /// Named region from the config file. Mutually exclusive with --bbox.
    #[arg(long)]
    pub region: Option<String>,

    /// Ad hoc bounding box: minLng minLat maxLng maxLat.
    #[arg(long, num_args = 4, value_names = ["MIN_LNG", "MIN_LAT", "MAX_LNG", "MAX_LAT"])]
    pub bbox: Option<Vec<f64>>,

    /// Minimum zoom level, required alongside --bbox.
    #[arg(long = "min-zoom")]
    pub min_zoom: Option<u8>,

    /// Maximum zoom level, required alongside --bbox.
    #[arg(long = "max-zoom")]
    pub max_zoom: Option<u8>,

    /// Comma-separated remote HTTP source names to restrict acquisition to.
    #[arg(long, value_delimiter = ',')]
    pub servers: Vec<String>,

    /// Comma-separated local archive source names to restrict acquisition to.
    #[arg(long, value_delimiter = ',')]
    pub sources: Vec<String>,

    /// Path to the JSON config file.
    #[arg(long, default_value = "config.json")]
    pub config: PathBuf,

    /// Report coverage-set sizes per source without fetching.
    #[arg(long)]
    pub dry_run: bool,

    /// Increase log verbosity; repeatable (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all but warning/error logs.
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    pub fn bbox_array(&self) -> Option<[f64; 4]> {
        self.bbox.as_ref().map(|v| [v[0], v[1], v[2], v[3]])
    }
}
