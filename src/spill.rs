//! Out-of-core octree with per-leaf spill files.
//!
//! Partitioning semantics are identical to the in-memory tree, but a leaf's
//! storage is a sequential on-disk record file instead of a vector, so the
//! aggregate dataset never has to fit in memory. Subdividing a leaf streams
//! its file back in, redistributes every record into lazily created child
//! files, and deletes the parent file. Peak memory is proportional to the
//! active partitioning frontier, not the dataset.
//!
//! Each spill file is exclusively owned by its node and deleted exactly
//! once, either on drain or at finalisation.
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use log::warn;

use crate::config::TreePolicy;
use crate::error::{IndexError, IndexResult};
use crate::octree::{
    aggregate_children, child_center, cube_contains, flatten_elements, octant_of, LeafPoints,
    LeafSummary, NodeId, OctreeElement,
};

/// One spill record: 3 x f64 position followed by 3 x f32 colour, all
/// little-endian.
const SPILL_RECORD_SIZE: usize = 36;

fn encode_spill_record(element: &OctreeElement) -> [u8; SPILL_RECORD_SIZE] {
    let mut raw = [0u8; SPILL_RECORD_SIZE];
    raw[0..8].copy_from_slice(&element.position.0.to_le_bytes());
    raw[8..16].copy_from_slice(&element.position.1.to_le_bytes());
    raw[16..24].copy_from_slice(&element.position.2.to_le_bytes());
    raw[24..28].copy_from_slice(&element.colour.0.to_le_bytes());
    raw[28..32].copy_from_slice(&element.colour.1.to_le_bytes());
    raw[32..36].copy_from_slice(&element.colour.2.to_le_bytes());
    raw
}

fn decode_spill_record(raw: &[u8; SPILL_RECORD_SIZE]) -> OctreeElement {
    OctreeElement {
        position: (
            f64::from_le_bytes(raw[0..8].try_into().unwrap()),
            f64::from_le_bytes(raw[8..16].try_into().unwrap()),
            f64::from_le_bytes(raw[16..24].try_into().unwrap()),
        ),
        colour: (
            f32::from_le_bytes(raw[24..28].try_into().unwrap()),
            f32::from_le_bytes(raw[28..32].try_into().unwrap()),
            f32::from_le_bytes(raw[32..36].try_into().unwrap()),
        ),
    }
}

/// Append-only backing storage of one leaf.
struct SpillLeaf {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    written: u64,
    /// Set once finalisation has summarised and deleted the file.
    discarded: bool,
}

impl SpillLeaf {
    fn create(path: PathBuf) -> IndexResult<Self> {
        let file = File::create(&path)?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            written: 0,
            discarded: false,
        })
    }

    fn append(&mut self, element: &OctreeElement) -> IndexResult<()> {
        let writer = self
            .writer
            .as_mut()
            .expect("append to a leaf whose writer was already closed");
        writer.write_all(&encode_spill_record(element))?;
        self.written += 1;
        Ok(())
    }

    /// Flush pending writes and open the file for sequential reads.
    fn open_for_drain(&mut self) -> IndexResult<BufReader<File>> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(BufReader::new(File::open(&self.path)?))
    }

    /// Stream every record written to this leaf, one at a time, so a leaf
    /// of any size is processed at constant memory. A short read means a
    /// previous write never reached the disk intact.
    fn stream_records(
        &mut self,
        mut f: impl FnMut(OctreeElement) -> IndexResult<()>,
    ) -> IndexResult<()> {
        let mut reader = self.open_for_drain()?;
        let mut raw = [0u8; SPILL_RECORD_SIZE];
        for _ in 0..self.written {
            reader.read_exact(&mut raw).map_err(|err| {
                if err.kind() == ErrorKind::UnexpectedEof {
                    IndexError::TruncatedSpill {
                        path: self.path.clone(),
                    }
                } else {
                    IndexError::Io(err)
                }
            })?;
            f(decode_spill_record(&raw))?;
        }
        Ok(())
    }

    /// Collect every record into memory. Only for the flat leaf buffers,
    /// which are inherently in-memory.
    fn read_elements(&mut self) -> IndexResult<Vec<OctreeElement>> {
        let mut elements = Vec::with_capacity(self.written as usize);
        self.stream_records(|element| {
            elements.push(element);
            Ok(())
        })?;
        Ok(elements)
    }

    fn delete(&mut self) -> IndexResult<()> {
        self.writer = None;
        fs::remove_file(&self.path)?;
        self.discarded = true;
        Ok(())
    }
}

enum SpillState {
    Leaf(SpillLeaf),
    Internal([Option<NodeId>; 8]),
}

struct SpillNode {
    center: (f64, f64, f64),
    rib_size: f64,
    depth: u32,
    state: SpillState,
    summary: Option<LeafSummary>,
    depth_warned: bool,
}

/// Disk-spilling octree over the canonical unit cube.
pub struct SpillingOctree {
    nodes: Vec<SpillNode>,
    policy: TreePolicy,
    spill_dir: PathBuf,
    inserted: u64,
    rejected: u64,
    finalized: bool,
}

impl SpillingOctree {
    /// Create the tree with its spill directory and the root leaf's file.
    pub fn new(policy: TreePolicy, spill_dir: &Path) -> IndexResult<Self> {
        fs::create_dir_all(spill_dir)?;
        let mut tree = Self {
            nodes: Vec::new(),
            policy,
            spill_dir: spill_dir.to_path_buf(),
            inserted: 0,
            rejected: 0,
            finalized: false,
        };
        tree.new_leaf((0.0, 0.0, 0.0), 2.0, 0)?;
        Ok(tree)
    }

    fn new_leaf(&mut self, center: (f64, f64, f64), rib_size: f64, depth: u32) -> IndexResult<NodeId> {
        let id = NodeId::new(self.nodes.len());
        let path = self.spill_dir.join(format!("node-{}.oct", self.nodes.len()));
        self.nodes.push(SpillNode {
            center,
            rib_size,
            depth,
            state: SpillState::Leaf(SpillLeaf::create(path)?),
            summary: None,
            depth_warned: false,
        });
        Ok(id)
    }

    /// Add an element, spilling it to the owning leaf's file. Fails only on
    /// I/O faults or corrupted spill state; domain violations are dropped
    /// with a warning like the in-memory tree.
    pub fn add_element(&mut self, element: OctreeElement) -> IndexResult<()> {
        let root = &self.nodes[NodeId::ROOT.index()];
        if !cube_contains(root.center, root.rib_size, element.position) {
            warn!(
                "element at {:?} is not within the governed domain of the root (centre {:?})",
                element.position, root.center
            );
            self.rejected += 1;
            return Ok(());
        }
        self.insert(NodeId::ROOT, element)?;
        self.inserted += 1;
        Ok(())
    }

    fn insert(&mut self, id: NodeId, element: OctreeElement) -> IndexResult<()> {
        match &mut self.nodes[id.index()].state {
            SpillState::Leaf(leaf) => {
                leaf.append(&element)?;
            }
            SpillState::Internal(_) => {
                return self.insert_subdivided(id, element);
            }
        }
        self.apply_subdivision_policy(id)
    }

    fn apply_subdivision_policy(&mut self, id: NodeId) -> IndexResult<()> {
        let (written, depth, warned) = {
            let node = &self.nodes[id.index()];
            let written = match &node.state {
                SpillState::Leaf(leaf) => leaf.written,
                SpillState::Internal(_) => return Ok(()),
            };
            (written as usize, node.depth, node.depth_warned)
        };

        if depth < self.policy.min_forced_subdivision_depth {
            self.subdivide(id)?;
        } else if written > self.policy.max_elements_per_leaf {
            if depth < self.policy.max_depth {
                self.subdivide(id)?;
            } else if !warned {
                self.nodes[id.index()].depth_warned = true;
                warn!(
                    "octree max division reached at depth {depth}; leaf keeps accepting elements"
                );
            }
        }
        Ok(())
    }

    /// Drain the leaf's file into newly created children's files, then
    /// delete it. After this the node only delegates.
    fn subdivide(&mut self, id: NodeId) -> IndexResult<()> {
        let mut leaf = match std::mem::replace(
            &mut self.nodes[id.index()].state,
            SpillState::Internal([None; 8]),
        ) {
            SpillState::Leaf(leaf) => leaf,
            SpillState::Internal(_) => unreachable!("subdivide called on internal node"),
        };

        leaf.stream_records(|element| self.insert_subdivided(id, element))?;
        leaf.delete()
    }

    fn insert_subdivided(&mut self, id: NodeId, element: OctreeElement) -> IndexResult<()> {
        let (center, rib_size, depth) = {
            let node = &self.nodes[id.index()];
            (node.center, node.rib_size, node.depth)
        };
        let octant = octant_of(center, element.position);

        let existing = match &self.nodes[id.index()].state {
            SpillState::Internal(children) => children[octant],
            SpillState::Leaf(_) => unreachable!("routing through a leaf"),
        };
        let child = match existing {
            Some(child) => child,
            None => {
                let child =
                    self.new_leaf(child_center(center, rib_size, octant), rib_size / 2.0, depth + 1)?;
                match &mut self.nodes[id.index()].state {
                    SpillState::Internal(children) => children[octant] = Some(child),
                    SpillState::Leaf(_) => unreachable!(),
                }
                child
            }
        };
        self.insert(child, element)
    }

    /// Finalise bottom-up: each populated leaf streams its file one last
    /// time to average colours, then closes and deletes it; internal nodes
    /// aggregate their children. Idempotent.
    pub fn finalize(&mut self) -> IndexResult<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalize_node(NodeId::ROOT)?;
        self.finalized = true;
        Ok(())
    }

    fn finalize_node(&mut self, id: NodeId) -> IndexResult<()> {
        let children = match &mut self.nodes[id.index()].state {
            SpillState::Internal(children) => *children,
            SpillState::Leaf(_) => {
                return self.finalize_leaf(id);
            }
        };

        for child in children.into_iter().flatten() {
            self.finalize_node(child)?;
        }

        let aggregate = {
            let child_summaries = children
                .into_iter()
                .flatten()
                .filter_map(|child| self.nodes[child.index()].summary.as_ref());
            let node = &self.nodes[id.index()];
            aggregate_children(node.center, node.rib_size, child_summaries)
        };
        if aggregate.is_some() {
            self.nodes[id.index()].summary = aggregate;
        }
        Ok(())
    }

    /// Summarise one leaf by streaming its file a final time; the leaf only
    /// needs a running colour sum, so even a depth-capped overflow leaf is
    /// finalised at constant memory.
    fn finalize_leaf(&mut self, id: NodeId) -> IndexResult<()> {
        let (sum, written) = {
            let leaf = match &mut self.nodes[id.index()].state {
                SpillState::Leaf(leaf) => leaf,
                SpillState::Internal(_) => unreachable!(),
            };
            if leaf.discarded {
                return Ok(());
            }
            if leaf.written == 0 {
                leaf.delete()?;
                return Ok(());
            }
            let mut sum = (0.0f64, 0.0f64, 0.0f64);
            leaf.stream_records(|element| {
                sum.0 += element.colour.0 as f64;
                sum.1 += element.colour.1 as f64;
                sum.2 += element.colour.2 as f64;
                Ok(())
            })?;
            let written = leaf.written;
            leaf.delete()?;
            (sum, written)
        };

        let node = &mut self.nodes[id.index()];
        node.summary = Some(LeafSummary {
            center: node.center,
            half_extent: node.rib_size / 2.0,
            point_count: written as u32,
            average_colour: (
                (sum.0 / written as f64) as f32,
                (sum.1 / written as f64) as f32,
                (sum.2 / written as f64) as f32,
            ),
        });
        Ok(())
    }

    /// Iterate the summaries of all populated leaves.
    pub fn leaf_summaries(&self) -> impl Iterator<Item = &LeafSummary> + '_ {
        self.nodes
            .iter()
            .filter(|node| matches!(node.state, SpillState::Leaf(_)))
            .filter_map(|node| node.summary.as_ref())
    }

    /// The aggregate summary for any node, leaf or internal.
    pub fn summary(&self, id: NodeId) -> Option<&LeafSummary> {
        self.nodes[id.index()].summary.as_ref()
    }

    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    /// Child ids per octant, or None if the node is a leaf.
    pub fn children(&self, id: NodeId) -> Option<[Option<NodeId>; 8]> {
        match &self.nodes[id.index()].state {
            SpillState::Internal(children) => Some(*children),
            SpillState::Leaf(_) => None,
        }
    }

    /// Flat position/colour buffers for one leaf, read back from its spill
    /// file. None for internal nodes, empty leaves, or once finalisation
    /// deleted the file.
    pub fn leaf_points(&mut self, id: NodeId) -> IndexResult<Option<LeafPoints>> {
        let leaf = match &mut self.nodes[id.index()].state {
            SpillState::Leaf(leaf) if !leaf.discarded && leaf.written > 0 => leaf,
            _ => return Ok(None),
        };
        let elements = leaf.read_elements()?;
        // Reopen the writer in append mode so later adds still work.
        leaf.writer = Some(BufWriter::new(
            fs::OpenOptions::new().append(true).open(&leaf.path)?,
        ));
        Ok(Some(flatten_elements(elements.into_iter())))
    }

    /// Number of leaf nodes in the tree.
    pub fn num_leaves(&self) -> usize {
        self.nodes
            .iter()
            .filter(|node| matches!(node.state, SpillState::Leaf(_)))
            .count()
    }

    /// Depth of the deepest node.
    pub fn max_node_depth(&self) -> u32 {
        self.nodes.iter().map(|node| node.depth).max().unwrap_or(0)
    }

    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

impl Drop for SpillingOctree {
    /// Best-effort sweep of any spill files still on disk, then remove the
    /// spill directory if it ended up empty.
    fn drop(&mut self) {
        for node in &mut self.nodes {
            if let SpillState::Leaf(leaf) = &mut node.state {
                if !leaf.discarded {
                    leaf.writer = None;
                    let _ = fs::remove_file(&leaf.path);
                }
            }
        }
        let _ = fs::remove_dir(&self.spill_dir);
    }
}
