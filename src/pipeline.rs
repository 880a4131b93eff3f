//! Two-pass ingestion over a set of LAS files.
//!
//! The first pass reads only the 227-byte headers to learn the combined
//! extent of the dataset, since normalisation needs the global bounds
//! before any point can be placed. The second pass decodes the files in
//! parallel and streams batches of normalised elements through a bounded
//! channel into a single-writer tree.
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, SyncSender};
use std::thread;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rayon::prelude::*;

use crate::bounds::PointCloudBounds;
use crate::config::{IndexingConfig, BATCH_SIZE, CHANNEL_CAPACITY};
use crate::error::{IndexError, IndexResult};
use crate::header::{LasHeader, HEADER_SIZE};
use crate::octree::{Octree, OctreeElement};
use crate::record::RecordStream;
use crate::spill::SpillingOctree;

/// Colour given to points from formats without RGB channels.
const FALLBACK_COLOUR: (f32, f32, f32) = (1.0, 1.0, 1.0);

/// A file that passed header validation in the first pass.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub header: LasHeader,
}

/// A file the pipeline gave up on, and why.
#[derive(Debug)]
pub struct FileFault {
    pub path: PathBuf,
    pub error: IndexError,
}

/// Outcome of a full ingestion run.
#[derive(Debug, Default)]
pub struct IngestReport {
    /// Files whose points were fully decoded and handed to the tree.
    pub files_indexed: usize,
    /// Files rejected at the header pass or abandoned mid-decode.
    pub faults: Vec<FileFault>,
    /// Points emitted by the decoders after decimation.
    pub points_emitted: u64,
}

/// Destination of the decoded stream. Both tree variants accept elements
/// one at a time and finish with a finalisation pass; only the spilling
/// variant can actually fail.
pub trait PointSink {
    fn accept(&mut self, element: OctreeElement) -> IndexResult<()>;
    fn finish(&mut self) -> IndexResult<()>;
}

impl PointSink for Octree {
    fn accept(&mut self, element: OctreeElement) -> IndexResult<()> {
        self.add_element(element);
        Ok(())
    }

    fn finish(&mut self) -> IndexResult<()> {
        self.finalize();
        Ok(())
    }
}

impl PointSink for SpillingOctree {
    fn accept(&mut self, element: OctreeElement) -> IndexResult<()> {
        self.add_element(element)
    }

    fn finish(&mut self) -> IndexResult<()> {
        self.finalize()
    }
}

enum IngestMessage {
    Batch(Vec<OctreeElement>),
    FileDone { path: PathBuf, emitted: u64 },
    FileFault(FileFault),
}

/// Header pass: validate every file's header and fold the declared extents
/// into one global bounding box. Unreadable or malformed files become
/// faults; the pass never touches point data.
pub fn scan_headers(paths: &[PathBuf]) -> (Vec<SourceFile>, PointCloudBounds, Vec<FileFault>) {
    let mut sources = Vec::with_capacity(paths.len());
    let mut bounds = PointCloudBounds::new();
    let mut faults = Vec::new();

    for path in paths {
        match read_header(path) {
            Ok(header) => {
                debug!("{}:\n{header}", path.display());
                bounds.include_header(&header);
                sources.push(SourceFile {
                    path: path.clone(),
                    header,
                });
            }
            Err(error) => {
                warn!("skipping {}: {error}", path.display());
                faults.push(FileFault {
                    path: path.clone(),
                    error,
                });
            }
        }
    }

    (sources, bounds, faults)
}

fn read_header(path: &Path) -> IndexResult<LasHeader> {
    let mut block = [0u8; HEADER_SIZE];
    File::open(path)?
        .read_exact(&mut block)
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::UnexpectedEof => IndexError::MalformedHeader,
            _ => IndexError::Io(err),
        })?;
    LasHeader::parse(&block)
}

/// Decode one source file and push its batches through the channel.
/// Returns the number of points emitted, or the fault that stopped decoding.
fn decode_file(
    source: &SourceFile,
    bounds: &PointCloudBounds,
    skip: u32,
    sender: &SyncSender<IngestMessage>,
) -> IndexResult<u64> {
    let reader = BufReader::new(File::open(&source.path)?);
    let mut stream = RecordStream::new(reader, &source.header, skip)?;
    let mut batch = Vec::with_capacity(BATCH_SIZE);

    let mut fault = None;
    for point in &mut stream {
        let point = match point {
            Ok(point) => point,
            Err(error) => {
                fault = Some(error);
                break;
            }
        };
        let (x, y, z) = point.position;
        batch.push(OctreeElement {
            position: bounds.normalize(x, y, z),
            colour: point.colour.unwrap_or(FALLBACK_COLOUR),
        });
        if batch.len() == BATCH_SIZE {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(BATCH_SIZE));
            if sender.send(IngestMessage::Batch(full)).is_err() {
                // The inserter hung up, which means construction aborted.
                return Ok(stream.emitted());
            }
        }
    }

    // Points decoded before a mid-stream fault still count: a truncated
    // file contributes a partial trace rather than nothing.
    if !batch.is_empty() {
        let _ = sender.send(IngestMessage::Batch(batch));
    }
    match fault {
        Some(error) => Err(error),
        None => Ok(stream.emitted()),
    }
}

/// Decode `sources` in parallel and insert every batch into `sink`.
///
/// Decoder workers fan out over rayon; the tree stays single-writer on the
/// calling thread, fed through a channel bounded at [`CHANNEL_CAPACITY`]
/// batches so decoding cannot outrun insertion unboundedly. A sink fault
/// aborts the run; a decoder fault only abandons its file.
pub fn build_index(
    sources: Vec<SourceFile>,
    bounds: &PointCloudBounds,
    config: &IndexingConfig,
    sink: &mut dyn PointSink,
) -> IndexResult<IngestReport> {
    let mut report = IngestReport::default();
    if sources.is_empty() {
        sink.finish()?;
        return Ok(report);
    }
    // A zero (or NaN) span would normalise every coordinate to NaN and the
    // root would silently reject the whole dataset; fail loudly instead.
    if !(bounds.largest_span() > 0.0) {
        return Err(IndexError::DegenerateExtent);
    }

    let expected: u64 = sources
        .iter()
        .map(|source| expected_emissions(source.header.record_count as u64, config.skip))
        .sum();
    let pb = ProgressBar::new(expected);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{bar:40.cyan/blue}] {pos}/{len} points ({percent}%) {msg}")
            .unwrap()
            .progress_chars("▉▊▋▌▍▎▏ "),
    );
    pb.set_message("Indexing points");

    let (sender, receiver) = mpsc::sync_channel::<IngestMessage>(CHANNEL_CAPACITY);
    let skip = config.skip;
    let worker_bounds = bounds.clone();

    let decoder = thread::spawn(move || {
        sources.par_iter().for_each_with(sender, |sender, source| {
            match decode_file(source, &worker_bounds, skip, sender) {
                Ok(emitted) => {
                    let _ = sender.send(IngestMessage::FileDone {
                        path: source.path.clone(),
                        emitted,
                    });
                }
                Err(error) => {
                    let _ = sender.send(IngestMessage::FileFault(FileFault {
                        path: source.path.clone(),
                        error,
                    }));
                }
            }
        });
    });

    let mut sink_fault = None;
    for message in receiver {
        match message {
            IngestMessage::Batch(batch) => {
                if sink_fault.is_some() {
                    // Drain remaining messages so the decoders can exit.
                    continue;
                }
                pb.inc(batch.len() as u64);
                for element in batch {
                    if let Err(error) = sink.accept(element) {
                        sink_fault = Some(error);
                        break;
                    }
                }
            }
            IngestMessage::FileDone { path, emitted } => {
                info!("indexed {} ({emitted} points)", path.display());
                report.files_indexed += 1;
                report.points_emitted += emitted;
            }
            IngestMessage::FileFault(fault) => {
                warn!("abandoned {}: {}", fault.path.display(), fault.error);
                report.points_emitted += match &fault.error {
                    IndexError::TruncatedRecord { emitted } => *emitted,
                    _ => 0,
                };
                report.faults.push(fault);
            }
        }
    }

    // The channel is closed, so the workers are done.
    decoder.join().expect("decoder thread panicked");

    if let Some(error) = sink_fault {
        pb.abandon_with_message("Index construction failed");
        return Err(error);
    }

    sink.finish()?;
    pb.finish_with_message("Index complete");
    Ok(report)
}

/// Points a decimating stream emits for a file of `records` records:
/// every multiple of the period, plus the final record when it is not
/// itself a multiple.
fn expected_emissions(records: u64, skip: u32) -> u64 {
    if records == 0 {
        return 0;
    }
    let period = skip as u64 + 1;
    let multiples = records.div_ceil(period);
    if (records - 1) % period == 0 {
        multiples
    } else {
        multiples + 1
    }
}

/// Full run over `paths`: header pass, then parallel decode into `sink`.
pub fn ingest(
    paths: &[PathBuf],
    config: &IndexingConfig,
    sink: &mut dyn PointSink,
) -> IndexResult<(IngestReport, PointCloudBounds)> {
    let (sources, bounds, header_faults) = scan_headers(paths);
    info!(
        "header pass: {} of {} files usable",
        sources.len(),
        paths.len()
    );

    let mut report = build_index(sources, &bounds, config, sink)?;
    report.faults.extend(header_faults);
    Ok((report, bounds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TreePolicy;
    use crate::header::tests::encode_header;
    use crate::record::tests::{encode_file, encode_record};
    use crate::record::PointFormat;
    use std::fs;

    /// A complete file for `positions` in world coordinates, with unit
    /// scale so raw integer records reproduce them exactly. Declared
    /// extents are padded so every sample normalises strictly inside the
    /// root cube instead of onto its boundary.
    fn las_bytes(format_id: u8, positions: &[(f64, f64, f64)]) -> Vec<u8> {
        let mut min = (f64::INFINITY, f64::INFINITY, f64::INFINITY);
        let mut max = (f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
        for &(x, y, z) in positions {
            min = (min.0.min(x), min.1.min(y), min.2.min(z));
            max = (max.0.max(x), max.1.max(y), max.2.max(z));
        }
        min = (min.0 - 0.5, min.1 - 0.5, min.2 - 0.5);
        max = (max.0 + 0.5, max.1 + 0.5, max.2 + 0.5);
        let header = encode_header(
            format_id,
            positions.len() as u32,
            (1.0, 1.0, 1.0),
            (0.0, 0.0, 0.0),
            min,
            max,
        );
        let format = PointFormat::from_id(format_id).unwrap();
        let records: Vec<Vec<u8>> = positions
            .iter()
            .map(|&(x, y, z)| encode_record(format, (x as i32, y as i32, z as i32), None))
            .collect();
        encode_file(&header, &records)
    }

    fn temp_las(tag: &str, bytes: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "point-cloud-pipeline-{}-{}.las",
            tag,
            std::process::id()
        ));
        fs::write(&path, bytes).unwrap();
        path
    }

    fn small_config() -> IndexingConfig {
        IndexingConfig {
            skip: 0,
            policy: TreePolicy {
                max_elements_per_leaf: 8,
                min_forced_subdivision_depth: 1,
                max_depth: 6,
            },
        }
    }

    #[test]
    fn expected_emissions_counts_the_tail() {
        assert_eq!(expected_emissions(0, 9), 0);
        assert_eq!(expected_emissions(1, 9), 1);
        assert_eq!(expected_emissions(100, 9), 11);
        assert_eq!(expected_emissions(100_000, 9), 10_001);
        // Final record on the period boundary is not double counted.
        assert_eq!(expected_emissions(91, 9), 10);
        assert_eq!(expected_emissions(7, 0), 7);
    }

    #[test]
    fn header_pass_merges_extents_and_skips_bad_files() {
        let good = temp_las(
            "scan-good",
            &las_bytes(3, &[(0.0, 0.0, 0.0), (10.0, 20.0, 30.0)]),
        );
        let bad = temp_las("scan-bad", b"not a point cloud at all");

        let (sources, bounds, faults) =
            scan_headers(&[good.clone(), bad.clone()]);
        assert_eq!(sources.len(), 1);
        assert_eq!(faults.len(), 1);
        assert!(matches!(faults[0].error, IndexError::MalformedHeader));
        assert_eq!(bounds.min_x, -0.5);
        assert_eq!(bounds.max_z, 30.5);

        fs::remove_file(good).unwrap();
        fs::remove_file(bad).unwrap();
    }

    #[test]
    fn ingest_routes_every_surviving_point_into_the_tree() {
        let mut positions = Vec::new();
        for i in 0..40 {
            positions.push((i as f64, (i % 5) as f64 * 3.0, 100.0 - i as f64));
        }
        let path = temp_las("ingest", &las_bytes(1, &positions));

        let config = small_config();
        let mut tree = Octree::new(config.policy);
        let (report, bounds) = ingest(&[path.clone()], &config, &mut tree).unwrap();

        assert_eq!(report.files_indexed, 1);
        assert!(report.faults.is_empty());
        assert_eq!(report.points_emitted, 40);
        assert_eq!(tree.inserted(), 40);
        assert_eq!(tree.rejected(), 0);
        assert!(bounds.is_finite());

        let total: u64 = tree
            .leaf_summaries()
            .map(|summary| summary.point_count as u64)
            .sum();
        assert_eq!(total, 40);

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn zero_span_extents_abort_instead_of_rejecting_every_point() {
        // A single-location cloud declares identical min and max extents.
        let header = encode_header(
            0,
            3,
            (1.0, 1.0, 1.0),
            (0.0, 0.0, 0.0),
            (5.0, 5.0, 5.0),
            (5.0, 5.0, 5.0),
        );
        let records: Vec<Vec<u8>> = (0..3)
            .map(|_| encode_record(PointFormat::Format0, (5, 5, 5), None))
            .collect();
        let path = temp_las("degenerate", &encode_file(&header, &records));

        let config = small_config();
        let mut tree = Octree::new(config.policy);
        let fault = ingest(&[path.clone()], &config, &mut tree).unwrap_err();
        assert!(matches!(fault, IndexError::DegenerateExtent));

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn truncated_file_is_reported_but_does_not_stop_the_run() {
        let whole = las_bytes(0, &[(0.0, 0.0, 0.0), (1.0, 1.0, 1.0), (2.0, 2.0, 2.0)]);
        let cut = &whole[..whole.len() - 10];
        let truncated = temp_las("trunc-cut", cut);
        let intact = temp_las("trunc-ok", &las_bytes(0, &[(0.0, 0.0, 0.0), (2.0, 2.0, 2.0)]));

        let config = small_config();
        let mut tree = Octree::new(config.policy);
        let (report, _) =
            ingest(&[truncated.clone(), intact.clone()], &config, &mut tree).unwrap();

        assert_eq!(report.files_indexed, 1);
        assert_eq!(report.faults.len(), 1);
        assert!(matches!(
            report.faults[0].error,
            IndexError::TruncatedRecord { .. }
        ));
        // Two whole records decoded before the cut, two from the intact file.
        assert_eq!(report.points_emitted, 4);
        assert_eq!(tree.inserted(), 4);

        fs::remove_file(truncated).unwrap();
        fs::remove_file(intact).unwrap();
    }
}
