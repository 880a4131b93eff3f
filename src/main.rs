/// Point cloud indexing command line entry point
use std::env;
use std::path::PathBuf;

use point_cloud_indexing::pipeline::{ingest, IngestReport};
use point_cloud_indexing::{
    IndexingConfig, LeafSummary, Octree, PointCloudBounds, SpillingOctree,
};

struct TreeStats {
    num_leaves: usize,
    tree_depth: u32,
    inserted: u64,
    rejected: u64,
    leaves: Vec<LeafSummary>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let mut paths: Vec<PathBuf> = Vec::new();
    let mut skip = 0u32;
    let mut spill_dir: Option<PathBuf> = None;
    let mut metadata_path: Option<PathBuf> = None;

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--skip" => {
                let value = iter.next().ok_or("--skip requires a value")?;
                skip = value.parse()?;
            }
            "--spill" => {
                let dir = iter.next().ok_or("--spill requires a directory")?;
                spill_dir = Some(PathBuf::from(dir));
            }
            "--metadata" => {
                let path = iter.next().ok_or("--metadata requires a path")?;
                metadata_path = Some(PathBuf::from(path));
            }
            _ => paths.push(PathBuf::from(arg)),
        }
    }

    if paths.is_empty() {
        eprintln!(
            "Usage: {} [--skip N] [--spill DIR] [--metadata OUT.json] <input.las>...",
            args[0]
        );
        std::process::exit(1);
    }

    let config = IndexingConfig::with_skip(skip);

    let (report, bounds, stats) = match &spill_dir {
        Some(dir) => {
            let mut tree = SpillingOctree::new(config.policy, dir)?;
            let (report, bounds) = ingest(&paths, &config, &mut tree)?;
            let stats = TreeStats {
                num_leaves: tree.num_leaves(),
                tree_depth: tree.max_node_depth(),
                inserted: tree.inserted(),
                rejected: tree.rejected(),
                leaves: tree.leaf_summaries().copied().collect(),
            };
            (report, bounds, stats)
        }
        None => {
            let mut tree = Octree::new(config.policy);
            let (report, bounds) = ingest(&paths, &config, &mut tree)?;
            let stats = TreeStats {
                num_leaves: tree.num_leaves(),
                tree_depth: tree.max_node_depth(),
                inserted: tree.inserted(),
                rejected: tree.rejected(),
                leaves: tree.leaf_summaries().copied().collect(),
            };
            (report, bounds, stats)
        }
    };

    println!(
        "Indexed {} of {} files: {} points in {} leaves, tree depth {}",
        report.files_indexed,
        paths.len(),
        stats.inserted,
        stats.num_leaves,
        stats.tree_depth
    );
    for fault in &report.faults {
        println!("  fault: {}: {}", fault.path.display(), fault.error);
    }

    if let Some(path) = metadata_path {
        save_metadata(&path, &report, &bounds, &stats)?;
    }

    Ok(())
}

/// Save indexing metadata as JSON for downstream rendering workflows.
fn save_metadata(
    path: &PathBuf,
    report: &IngestReport,
    bounds: &PointCloudBounds,
    stats: &TreeStats,
) -> Result<(), Box<dyn std::error::Error>> {
    let metadata = serde_json::json!({
        "files_indexed": report.files_indexed,
        "points_emitted": report.points_emitted,
        "points_inserted": stats.inserted,
        "points_rejected": stats.rejected,
        "num_leaves": stats.num_leaves,
        "tree_depth": stats.tree_depth,
        "bounds": {
            "min_x": bounds.min_x, "max_x": bounds.max_x,
            "min_y": bounds.min_y, "max_y": bounds.max_y,
            "min_z": bounds.min_z, "max_z": bounds.max_z
        },
        "leaves": stats.leaves,
    });
    std::fs::write(path, serde_json::to_string_pretty(&metadata)?)?;
    println!("Saved {}", path.display());
    Ok(())
}
