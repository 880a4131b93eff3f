//! In-memory adaptive octree over normalised point cloud elements.
//!
//! Nodes live in a flat arena and reference children by index, one slot per
//! octant. A node starts as a leaf collecting elements and transitions to
//! internal exactly once, when the subdivision policy fires; children are
//! created lazily the first time an element routes into their octant.
//!
//! After all elements are added, `finalize` derives per-node summaries
//! (point count and average colour) bottom-up and discards raw element
//! storage. Only the summaries are exposed to the renderer.
use log::warn;
use serde::Serialize;

use crate::config::TreePolicy;

/// Index of a node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) const ROOT: NodeId = NodeId(0);

    pub(crate) fn new(index: usize) -> Self {
        Self(index as u32)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// One normalised point queued for insertion: canonical-cube position plus
/// colour in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OctreeElement {
    pub position: (f64, f64, f64),
    pub colour: (f32, f32, f32),
}

/// Finalised, read-only aggregate for one node. This is the only state the
/// rendering collaborator consumes per node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LeafSummary {
    pub center: (f64, f64, f64),
    pub half_extent: f64,
    pub point_count: u32,
    pub average_colour: (f32, f32, f32),
}

/// Flat per-point buffers for one leaf, for renderers that draw individual
/// points instead of one splat per leaf. Available until finalisation
/// discards the raw storage.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafPoints {
    /// Interleaved x, y, z per point.
    pub positions: Vec<f32>,
    /// Interleaved r, g, b per point.
    pub colours: Vec<f32>,
}

enum NodeState {
    Leaf(Vec<OctreeElement>),
    Internal([Option<NodeId>; 8]),
}

struct Node {
    center: (f64, f64, f64),
    rib_size: f64,
    depth: u32,
    state: NodeState,
    summary: Option<LeafSummary>,
    depth_warned: bool,
}

impl Node {
    fn new_leaf(center: (f64, f64, f64), rib_size: f64, depth: u32) -> Self {
        Self {
            center,
            rib_size,
            depth,
            state: NodeState::Leaf(Vec::new()),
            summary: None,
            depth_warned: false,
        }
    }
}

/// Octree covering the canonical unit cube: root centred at the origin with
/// rib size 2.
pub struct Octree {
    nodes: Vec<Node>,
    policy: TreePolicy,
    inserted: u64,
    rejected: u64,
    finalized: bool,
}

impl Octree {
    pub fn new(policy: TreePolicy) -> Self {
        Self {
            nodes: vec![Node::new_leaf((0.0, 0.0, 0.0), 2.0, 0)],
            policy,
            inserted: 0,
            rejected: 0,
            finalized: false,
        }
    }

    /// Add an element to the tree. The root is the only node that validates
    /// membership; elements outside the governed domain are dropped with a
    /// warning rather than inserted.
    pub fn add_element(&mut self, element: OctreeElement) {
        let root = &self.nodes[NodeId::ROOT.index()];
        if !cube_contains(root.center, root.rib_size, element.position) {
            warn!(
                "element at {:?} is not within the governed domain of the root (centre {:?})",
                element.position, root.center
            );
            self.rejected += 1;
            return;
        }
        self.insert(NodeId::ROOT, element);
        self.inserted += 1;
    }

    fn insert(&mut self, id: NodeId, element: OctreeElement) {
        match &mut self.nodes[id.index()].state {
            NodeState::Leaf(elements) => {
                elements.push(element);
            }
            NodeState::Internal(_) => {
                self.insert_subdivided(id, element);
                return;
            }
        }
        self.apply_subdivision_policy(id);
    }

    fn apply_subdivision_policy(&mut self, id: NodeId) {
        let (held, depth, warned) = {
            let node = &self.nodes[id.index()];
            let held = match &node.state {
                NodeState::Leaf(elements) => elements.len(),
                NodeState::Internal(_) => return,
            };
            (held, node.depth, node.depth_warned)
        };

        if depth < self.policy.min_forced_subdivision_depth {
            self.subdivide(id);
        } else if held > self.policy.max_elements_per_leaf {
            if depth < self.policy.max_depth {
                self.subdivide(id);
            } else if !warned {
                self.nodes[id.index()].depth_warned = true;
                warn!(
                    "octree max division reached at depth {depth}; leaf keeps accepting elements"
                );
            }
        }
    }

    /// Relocate the leaf's elements into the proper children. After this the
    /// node only delegates; it never reverts to a leaf.
    fn subdivide(&mut self, id: NodeId) {
        let elements = match std::mem::replace(
            &mut self.nodes[id.index()].state,
            NodeState::Internal([None; 8]),
        ) {
            NodeState::Leaf(elements) => elements,
            NodeState::Internal(_) => unreachable!("subdivide called on internal node"),
        };
        for element in elements {
            self.insert_subdivided(id, element);
        }
    }

    fn insert_subdivided(&mut self, id: NodeId, element: OctreeElement) {
        let (center, rib_size, depth) = {
            let node = &self.nodes[id.index()];
            (node.center, node.rib_size, node.depth)
        };
        let octant = octant_of(center, element.position);

        let existing = match &self.nodes[id.index()].state {
            NodeState::Internal(children) => children[octant],
            NodeState::Leaf(_) => unreachable!("routing through a leaf"),
        };
        let child = match existing {
            Some(child) => child,
            None => {
                let child = NodeId(self.nodes.len() as u32);
                self.nodes.push(Node::new_leaf(
                    child_center(center, rib_size, octant),
                    rib_size / 2.0,
                    depth + 1,
                ));
                match &mut self.nodes[id.index()].state {
                    NodeState::Internal(children) => children[octant] = Some(child),
                    NodeState::Leaf(_) => unreachable!(),
                }
                child
            }
        };
        self.insert(child, element);
    }

    /// Finalise the tree bottom-up: populated leaves get their element count
    /// and average colour, internal nodes a count-weighted aggregate of
    /// their children. Raw element storage is discarded. Idempotent.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalize_node(NodeId::ROOT);
        self.finalized = true;
    }

    fn finalize_node(&mut self, id: NodeId) {
        // Take leaf storage (or copy the child table) so the arena borrow
        // ends before recursing.
        let taken = match &mut self.nodes[id.index()].state {
            NodeState::Leaf(elements) => Ok(std::mem::take(elements)),
            NodeState::Internal(children) => Err(*children),
        };

        let children = match taken {
            Ok(elements) => {
                if !elements.is_empty() {
                    let count = elements.len();
                    let mut sum = (0.0f64, 0.0f64, 0.0f64);
                    for element in &elements {
                        sum.0 += element.colour.0 as f64;
                        sum.1 += element.colour.1 as f64;
                        sum.2 += element.colour.2 as f64;
                    }
                    let node = &mut self.nodes[id.index()];
                    node.summary = Some(LeafSummary {
                        center: node.center,
                        half_extent: node.rib_size / 2.0,
                        point_count: count as u32,
                        average_colour: (
                            (sum.0 / count as f64) as f32,
                            (sum.1 / count as f64) as f32,
                            (sum.2 / count as f64) as f32,
                        ),
                    });
                }
                return;
            }
            Err(children) => children,
        };

        for child in children.into_iter().flatten() {
            self.finalize_node(child);
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
    }

    /// Iterate the summaries of all populated leaves.
    pub fn leaf_summaries(&self) -> impl Iterator<Item = &LeafSummary> + '_ {
        self.nodes
            .iter()
            .filter(|node| matches!(node.state, NodeState::Leaf(_)))
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
            NodeState::Internal(children) => Some(*children),
            NodeState::Leaf(_) => None,
        }
    }

    /// Flat position/colour buffers for one leaf's raw points. None for
    /// internal nodes, empty leaves, or once finalisation discarded storage.
    pub fn leaf_points(&self, id: NodeId) -> Option<LeafPoints> {
        match &self.nodes[id.index()].state {
            NodeState::Leaf(elements) if !elements.is_empty() => {
                Some(flatten_elements(elements.iter().copied()))
            }
            _ => None,
        }
    }

    /// Number of leaf nodes in the tree.
    pub fn num_leaves(&self) -> usize {
        self.nodes
            .iter()
            .filter(|node| matches!(node.state, NodeState::Leaf(_)))
            .count()
    }

    /// Depth of the deepest node.
    pub fn max_node_depth(&self) -> u32 {
        self.nodes.iter().map(|node| node.depth).max().unwrap_or(0)
    }

    /// Elements accepted into the tree.
    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    /// Elements dropped at the root for falling outside the domain.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

/// Build interleaved f32 buffers from a run of elements.
pub(crate) fn flatten_elements(elements: impl Iterator<Item = OctreeElement>) -> LeafPoints {
    let mut positions = Vec::new();
    let mut colours = Vec::new();
    for element in elements {
        positions.push(element.position.0 as f32);
        positions.push(element.position.1 as f32);
        positions.push(element.position.2 as f32);
        colours.push(element.colour.0);
        colours.push(element.colour.1);
        colours.push(element.colour.2);
    }
    LeafPoints { positions, colours }
}

/// Count-weighted aggregate of child summaries for an internal node.
/// Children with no summary contribute zero weight; a node whose children
/// hold no points gets no summary.
pub(crate) fn aggregate_children<'a>(
    center: (f64, f64, f64),
    rib_size: f64,
    children: impl Iterator<Item = &'a LeafSummary>,
) -> Option<LeafSummary> {
    let mut count = 0u64;
    let mut sum = (0.0f64, 0.0f64, 0.0f64);
    for summary in children {
        let weight = summary.point_count as f64;
        count += summary.point_count as u64;
        sum.0 += summary.average_colour.0 as f64 * weight;
        sum.1 += summary.average_colour.1 as f64 * weight;
        sum.2 += summary.average_colour.2 as f64 * weight;
    }
    if count == 0 {
        return None;
    }
    Some(LeafSummary {
        center,
        half_extent: rib_size / 2.0,
        point_count: count as u32,
        average_colour: (
            (sum.0 / count as f64) as f32,
            (sum.1 / count as f64) as f32,
            (sum.2 / count as f64) as f32,
        ),
    })
}

/// Octant of a location relative to a node centre, as three independent
/// binary choices. The positive branch is taken only when the centre is
/// strictly below the coordinate, so an exact tie on any axis routes to the
/// negative child. This ordering must stay fixed for deterministic
/// partitioning.
pub(crate) fn octant_of(center: (f64, f64, f64), location: (f64, f64, f64)) -> usize {
    let px = (center.0 < location.0) as usize;
    let py = (center.1 < location.1) as usize;
    let pz = (center.2 < location.2) as usize;
    (px << 2) | (py << 1) | pz
}

/// Centre of the child cube for an octant: offset by a quarter rib along
/// each axis, rib size halved.
pub(crate) fn child_center(center: (f64, f64, f64), rib_size: f64, octant: usize) -> (f64, f64, f64) {
    let quarter = rib_size / 4.0;
    (
        if octant & 0b100 != 0 { center.0 + quarter } else { center.0 - quarter },
        if octant & 0b010 != 0 { center.1 + quarter } else { center.1 - quarter },
        if octant & 0b001 != 0 { center.2 + quarter } else { center.2 - quarter },
    )
}

/// Strict containment test for the cube spanned by a centre and rib size.
/// Only the root uses this; interior routing trusts the caller.
pub(crate) fn cube_contains(
    center: (f64, f64, f64),
    rib_size: f64,
    location: (f64, f64, f64),
) -> bool {
    let half = rib_size / 2.0;
    location.0 > center.0 - half
        && location.0 < center.0 + half
        && location.1 > center.1 - half
        && location.1 < center.1 + half
        && location.2 > center.2 - half
        && location.2 < center.2 + half
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(position: (f64, f64, f64), colour: (f32, f32, f32)) -> OctreeElement {
        OctreeElement { position, colour }
    }

    fn white(position: (f64, f64, f64)) -> OctreeElement {
        element(position, (1.0, 1.0, 1.0))
    }

    fn policy(max: usize, forced: u32, max_depth: u32) -> TreePolicy {
        TreePolicy {
            max_elements_per_leaf: max,
            min_forced_subdivision_depth: forced,
            max_depth,
        }
    }

    #[test]
    fn out_of_domain_elements_are_rejected_at_the_root() {
        let mut tree = Octree::new(policy(10, 0, 4));
        tree.add_element(white((0.5, 0.5, 0.5)));
        tree.add_element(white((1.5, 0.0, 0.0)));
        tree.add_element(white((0.0, -1.0, 0.0))); // boundary is outside
        assert_eq!(tree.inserted(), 1);
        assert_eq!(tree.rejected(), 2);
    }

    #[test]
    fn leaf_subdivides_past_element_cap() {
        let mut tree = Octree::new(policy(4, 0, 6));
        let locations = [
            (0.5, 0.5, 0.5),
            (-0.5, 0.5, 0.5),
            (0.5, -0.5, 0.5),
            (0.5, 0.5, -0.5),
            (-0.5, -0.5, -0.5),
        ];
        for location in locations {
            tree.add_element(white(location));
        }
        // 5 > 4 triggered subdivision of the root.
        assert!(tree.children(tree.root()).is_some());
        assert_eq!(tree.num_leaves(), 5);
        assert_eq!(tree.inserted(), 5);
    }

    #[test]
    fn forced_subdivision_splits_top_levels_even_when_sparse() {
        let mut tree = Octree::new(policy(1000, 3, 8));
        tree.add_element(white((0.3, 0.3, 0.3)));
        assert_eq!(tree.max_node_depth(), 3);
        assert_eq!(tree.inserted(), 1);
    }

    #[test]
    fn center_ties_route_to_the_negative_child() {
        assert_eq!(octant_of((0.0, 0.0, 0.0), (0.0, 0.0, 0.0)), 0);
        assert_eq!(octant_of((0.0, 0.0, 0.0), (1e-9, 0.0, 0.0)), 0b100);
        assert_eq!(octant_of((0.25, 0.25, 0.25), (0.25, 0.3, 0.2)), 0b010);

        // A point on the root centre routes to the nnn octant.
        let mut tree = Octree::new(policy(1000, 1, 8));
        tree.add_element(white((0.0, 0.0, 0.0)));
        let children = tree.children(tree.root()).unwrap();
        let populated: Vec<_> = (0..8).filter(|&i| children[i].is_some()).collect();
        assert_eq!(populated, vec![0], "only the nnn octant should exist");
    }

    #[test]
    fn child_geometry_halves_the_rib_and_offsets_a_quarter() {
        let center = child_center((0.0, 0.0, 0.0), 2.0, 0b101);
        assert_eq!(center, (0.5, -0.5, 0.5));
        let center = child_center((0.5, -0.5, 0.5), 1.0, 0b000);
        assert_eq!(center, (0.25, -0.75, 0.25));
    }

    #[test]
    fn dense_cluster_never_exceeds_max_depth() {
        let mut tree = Octree::new(policy(2, 0, 3));
        for _ in 0..100 {
            tree.add_element(white((0.1, 0.1, 0.1)));
        }
        assert_eq!(tree.inserted(), 100);
        assert!(tree.max_node_depth() <= 3);
        tree.finalize();
        let total: u64 = tree
            .leaf_summaries()
            .map(|summary| summary.point_count as u64)
            .sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn finalize_averages_leaf_colours_and_weights_internal_nodes() {
        let mut tree = Octree::new(policy(100, 1, 4));
        tree.add_element(element((0.5, 0.5, 0.5), (1.0, 0.0, 0.0)));
        tree.add_element(element((0.6, 0.6, 0.6), (0.0, 1.0, 0.0)));
        tree.add_element(element((-0.5, -0.5, -0.5), (0.0, 0.0, 1.0)));
        tree.finalize();

        let root_summary = tree.summary(tree.root()).unwrap();
        assert_eq!(root_summary.point_count, 3);
        let expected = (1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0);
        assert!((root_summary.average_colour.0 - expected.0).abs() < 1e-6);
        assert!((root_summary.average_colour.1 - expected.1).abs() < 1e-6);
        assert!((root_summary.average_colour.2 - expected.2).abs() < 1e-6);

        let leaf_total: u32 = tree.leaf_summaries().map(|s| s.point_count).sum();
        assert_eq!(leaf_total, 3);
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut tree = Octree::new(policy(10, 1, 4));
        for i in 0..20 {
            let v = -0.9 + i as f64 * 0.09;
            tree.add_element(white((v, v, v)));
        }
        tree.finalize();
        let first: Vec<LeafSummary> = tree.leaf_summaries().copied().collect();
        tree.finalize();
        let second: Vec<LeafSummary> = tree.leaf_summaries().copied().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn leaf_points_expose_raw_buffers_until_finalization() {
        let mut tree = Octree::new(policy(10, 0, 4));
        tree.add_element(element((0.5, -0.25, 0.75), (0.25, 0.5, 0.75)));
        let points = tree.leaf_points(tree.root()).unwrap();
        assert_eq!(points.positions, vec![0.5, -0.25, 0.75]);
        assert_eq!(points.colours, vec![0.25, 0.5, 0.75]);

        tree.finalize();
        assert!(tree.leaf_points(tree.root()).is_none());
    }

    #[test]
    fn every_inserted_point_lands_in_exactly_one_populated_leaf() {
        let mut tree = Octree::new(policy(5, 1, 6));
        let mut added = 0u64;
        for i in 0..9 {
            for j in 0..9 {
                let x = -0.88 + i as f64 * 0.22;
                let y = -0.88 + j as f64 * 0.22;
                tree.add_element(white((x, y, 0.11)));
                added += 1;
            }
        }
        assert_eq!(tree.rejected(), 0);
        tree.finalize();
        let total: u64 = tree
            .leaf_summaries()
            .map(|summary| summary.point_count as u64)
            .sum();
        assert_eq!(total, added);
    }
}
