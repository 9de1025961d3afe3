// src/skeleton.rs - Branch graph of a one-pixel-wide skeleton

use std::collections::HashSet;
use image::Luma;
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::Serialize;

use crate::image_utils::{is_on, set_mask, Mask};

/// Neighbour offsets in raster order
const NEIGHBOURS: [(i64, i64); 8] = [
    (-1, -1), (0, -1), (1, -1),
    (-1, 0), (1, 0),
    (-1, 1), (0, 1), (1, 1),
];

/// Branch classification by what the branch connects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BranchType {
    /// Isolated branch with two free ends
    EndpointToEndpoint,
    JunctionToEndpoint,
    JunctionToJunction,
    /// Closed loop without junctions
    Cycle,
}

impl BranchType {
    /// Numeric code: 0 endpoint-endpoint, 1 junction-endpoint, 2 junction-junction, 3 cycle
    pub fn code(self) -> u8 {
        match self {
            BranchType::EndpointToEndpoint => 0,
            BranchType::JunctionToEndpoint => 1,
            BranchType::JunctionToJunction => 2,
            BranchType::Cycle => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Endpoint,
    Junction,
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    pixels: Vec<(u32, u32)>,
}

/// One traced branch
#[derive(Debug, Clone)]
pub struct Branch {
    /// Ordered pixels as (row, col)
    pub path: Vec<(u32, u32)>,
    pub branch_type: BranchType,
    pub distance: f64,
    pub skeleton_id: u32,
    /// Start and end node, `None` for cycles
    ends: Option<(usize, usize)>,
}

/// Tabular view of a branch
#[derive(Debug, Clone, Serialize)]
pub struct BranchSummary {
    pub branch_id: usize,
    pub skeleton_id: u32,
    pub branch_type: u8,
    pub branch_distance: f64,
    pub euclidean_distance: f64,
    pub src_row: u32,
    pub src_col: u32,
    pub dst_row: u32,
    pub dst_col: u32,
}

/// Branches and nodes of an 8-connected skeleton
#[derive(Debug, Clone)]
pub struct SkeletonGraph {
    width: u32,
    height: u32,
    branches: Vec<Branch>,
    nodes: Vec<Node>,
    /// Skeleton pixels with exactly three on 8-neighbours
    degree_three_pixels: usize,
}

fn on_neighbours(mask: &Mask, x: u32, y: u32) -> Vec<(u32, u32)> {
    let (width, height) = mask.dimensions();
    NEIGHBOURS
        .iter()
        .filter_map(|&(dx, dy)| {
            let nx = x as i64 + dx;
            let ny = y as i64 + dy;
            let inside = nx >= 0 && ny >= 0 && nx < width as i64 && ny < height as i64;
            (inside && is_on(mask, nx as u32, ny as u32)).then_some((nx as u32, ny as u32))
        })
        .collect()
}

/// Length of a pixel path: 1 per axial step, sqrt(2) per diagonal step
pub fn path_length(path: &[(u32, u32)]) -> f64 {
    path.windows(2)
        .map(|w| {
            let dr = w[0].0 as f64 - w[1].0 as f64;
            let dc = w[0].1 as f64 - w[1].1 as f64;
            (dr * dr + dc * dc).sqrt()
        })
        .sum()
}

impl SkeletonGraph {
    /// Trace all branches of a skeleton mask
    pub fn from_mask(mask: &Mask) -> Self {
        let (width, height) = mask.dimensions();
        let index = |x: u32, y: u32| (y as usize) * width as usize + x as usize;

        let mut degree = vec![0usize; (width * height) as usize];
        let mut pixels = Vec::new();
        for y in 0..height {
            for x in 0..width {
                if is_on(mask, x, y) {
                    degree[index(x, y)] = on_neighbours(mask, x, y).len();
                    pixels.push((x, y));
                }
            }
        }

        // Endpoints are single-pixel nodes, touching junction pixels merge into one node
        let mut node_of: Vec<Option<usize>> = vec![None; degree.len()];
        let mut nodes: Vec<Node> = Vec::new();
        for &(x, y) in &pixels {
            let d = degree[index(x, y)];
            if node_of[index(x, y)].is_some() || d == 2 || d == 0 {
                continue;
            }

            let id = nodes.len();
            if d == 1 {
                nodes.push(Node { kind: NodeKind::Endpoint, pixels: vec![(x, y)] });
                node_of[index(x, y)] = Some(id);
                continue;
            }

            let mut cluster = vec![(x, y)];
            let mut stack = vec![(x, y)];
            node_of[index(x, y)] = Some(id);
            while let Some((cx, cy)) = stack.pop() {
                for (nx, ny) in on_neighbours(mask, cx, cy) {
                    let n = index(nx, ny);
                    if degree[n] >= 3 && node_of[n].is_none() {
                        node_of[n] = Some(id);
                        cluster.push((nx, ny));
                        stack.push((nx, ny));
                    }
                }
            }
            nodes.push(Node { kind: NodeKind::Junction, pixels: cluster });
        }

        let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));
        let skeleton_id = |x: u32, y: u32| labels.get_pixel(x, y)[0];

        let mut branches = Vec::new();
        let mut visited = vec![false; degree.len()];
        let mut direct_pairs: HashSet<(usize, usize)> = HashSet::new();

        let mut push_branch = |nodes: &[Node], path: Vec<(u32, u32)>, start: usize, end: usize| {
            let kinds = (nodes[start].kind, nodes[end].kind);
            let branch_type = match kinds {
                (NodeKind::Endpoint, NodeKind::Endpoint) => BranchType::EndpointToEndpoint,
                (NodeKind::Junction, NodeKind::Junction) => BranchType::JunctionToJunction,
                _ => BranchType::JunctionToEndpoint,
            };
            let (first_x, first_y) = path[0];
            let rc_path: Vec<(u32, u32)> = path.iter().map(|&(x, y)| (y, x)).collect();
            branches.push(Branch {
                distance: path_length(&rc_path),
                path: rc_path,
                branch_type,
                skeleton_id: skeleton_id(first_x, first_y),
                ends: Some((start, end)),
            });
        };

        for &(x, y) in &pixels {
            let Some(start) = node_of[index(x, y)] else { continue };

            for (qx, qy) in on_neighbours(mask, x, y) {
                let q = index(qx, qy);
                if let Some(other) = node_of[q] {
                    if other == start {
                        continue;
                    }
                    let p = index(x, y);
                    if direct_pairs.insert((p.min(q), p.max(q))) {
                        push_branch(&nodes, vec![(x, y), (qx, qy)], start, other);
                    }
                    continue;
                }
                if visited[q] {
                    continue;
                }

                visited[q] = true;
                let mut path = vec![(x, y), (qx, qy)];
                let mut prev = (x, y);
                let mut cur = (qx, qy);
                let mut end = None;
                loop {
                    let next = on_neighbours(mask, cur.0, cur.1)
                        .into_iter()
                        .find(|&n| n != prev);
                    let Some(n) = next else { break };
                    path.push(n);
                    if let Some(node) = node_of[index(n.0, n.1)] {
                        end = Some(node);
                        break;
                    }
                    if visited[index(n.0, n.1)] {
                        break;
                    }
                    visited[index(n.0, n.1)] = true;
                    prev = cur;
                    cur = n;
                }

                match end {
                    // A pixel bridging two pixels of the same junction is part of the junction
                    Some(end) if end == start && path.len() <= 3 => {}
                    Some(end) => push_branch(&nodes, path, start, end),
                    None => {}
                }
            }
        }

        // Whatever degree-2 pixels remain belong to junction-free loops
        for &(x, y) in &pixels {
            let s = index(x, y);
            if degree[s] != 2 || visited[s] {
                continue;
            }
            visited[s] = true;
            let mut path = vec![(x, y)];
            let mut prev = (x, y);
            let Some(mut cur) = on_neighbours(mask, x, y).into_iter().next() else { continue };
            loop {
                path.push(cur);
                if cur == (x, y) {
                    break;
                }
                let c = index(cur.0, cur.1);
                if visited[c] {
                    break;
                }
                visited[c] = true;
                let Some(next) = on_neighbours(mask, cur.0, cur.1)
                    .into_iter()
                    .find(|&n| n != prev)
                else {
                    break;
                };
                prev = cur;
                cur = next;
            }

            let rc_path: Vec<(u32, u32)> = path.iter().map(|&(px, py)| (py, px)).collect();
            branches.push(Branch {
                distance: path_length(&rc_path),
                path: rc_path,
                branch_type: BranchType::Cycle,
                skeleton_id: skeleton_id(x, y),
                ends: None,
            });
        }

        let degree_three_pixels = degree.iter().filter(|&&d| d == 3).count();
        Self { width, height, branches, nodes, degree_three_pixels }
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Ordered (row, col) pixels of a branch
    pub fn path_coordinates(&self, branch_id: usize) -> Option<&[(u32, u32)]> {
        self.branches.get(branch_id).map(|b| b.path.as_slice())
    }

    /// One row per branch
    pub fn summarize(&self) -> Vec<BranchSummary> {
        self.branches
            .iter()
            .enumerate()
            .map(|(branch_id, b)| {
                let src = b.path[0];
                let dst = b.path[b.path.len() - 1];
                let dr = src.0 as f64 - dst.0 as f64;
                let dc = src.1 as f64 - dst.1 as f64;
                BranchSummary {
                    branch_id,
                    skeleton_id: b.skeleton_id,
                    branch_type: b.branch_type.code(),
                    branch_distance: b.distance,
                    euclidean_distance: (dr * dr + dc * dc).sqrt(),
                    src_row: src.0,
                    src_col: src.1,
                    dst_row: dst.0,
                    dst_col: dst.1,
                }
            })
            .collect()
    }

    /// Sum of all branch lengths
    pub fn total_branch_distance(&self) -> f64 {
        self.branches.iter().map(|b| b.distance).sum()
    }

    /// Free ends: two per isolated branch, one per junction-to-endpoint branch
    pub fn endpoint_count(&self) -> usize {
        self.branches
            .iter()
            .map(|b| match b.branch_type {
                BranchType::EndpointToEndpoint => 2,
                BranchType::JunctionToEndpoint => 1,
                _ => 0,
            })
            .sum()
    }

    /// Branch points as skeleton pixels of pixel-graph degree 3.
    /// A junction cluster usually holds several of them.
    pub fn branch_point_count(&self) -> usize {
        self.degree_three_pixels
    }

    /// Rasterise a subset of branches back into a mask, with the full
    /// pixel clusters of the junctions they touch
    pub fn render<'a, I>(&self, branches: I) -> Mask
    where
        I: IntoIterator<Item = &'a Branch>,
    {
        let mut out = Mask::new(self.width, self.height);
        for branch in branches {
            for &(row, col) in &branch.path {
                set_mask(&mut out, col, row, true);
            }
            if let Some((start, end)) = branch.ends {
                for &(x, y) in self.nodes[start].pixels.iter().chain(&self.nodes[end].pixels) {
                    set_mask(&mut out, x, y, true);
                }
            }
        }
        out
    }
}

/// Drop short free-ended branches and short loops; junction-to-junction branches always stay
pub fn remove_short_components(skeleton: &Mask, min_len: f64) -> Mask {
    let graph = SkeletonGraph::from_mask(skeleton);
    if graph.is_empty() {
        return skeleton.clone();
    }

    graph.render(graph.branches().iter().filter(|b| {
        b.branch_type == BranchType::JunctionToJunction || b.distance >= min_len
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use crate::image_utils::count_on;

    fn mask_from(width: u32, height: u32, pixels: &[(u32, u32)]) -> Mask {
        let mut mask = Mask::new(width, height);
        for &(x, y) in pixels {
            set_mask(&mut mask, x, y, true);
        }
        mask
    }

    fn horizontal(y: u32, x0: u32, x1: u32) -> Vec<(u32, u32)> {
        (x0..=x1).map(|x| (x, y)).collect()
    }

    fn vertical(x: u32, y0: u32, y1: u32) -> Vec<(u32, u32)> {
        (y0..=y1).map(|y| (x, y)).collect()
    }

    #[test]
    fn straight_line_is_one_isolated_branch() {
        let graph = SkeletonGraph::from_mask(&mask_from(20, 5, &horizontal(2, 3, 12)));
        assert_eq!(graph.branches().len(), 1);
        let summary = &graph.summarize()[0];
        assert_eq!(summary.branch_type, 0);
        assert_approx_eq!(summary.branch_distance, 9.0);
        assert_eq!(graph.endpoint_count(), 2);
        assert_eq!(graph.branch_point_count(), 0);

        let path = graph.path_coordinates(0).unwrap();
        assert_eq!(path.len(), 10);
        assert_eq!(path[0], (2, 3));
        assert_eq!(path[9], (2, 12));
    }

    #[test]
    fn diagonal_steps_count_sqrt_two() {
        let pixels: Vec<_> = (0..5).map(|i| (i, i)).collect();
        let graph = SkeletonGraph::from_mask(&mask_from(6, 6, &pixels));
        assert_approx_eq!(graph.total_branch_distance(), 4.0 * 2f64.sqrt());
    }

    #[test]
    fn t_junction_has_three_branches() {
        // Horizontal bar with a stem hanging from its middle
        let mut pixels = horizontal(2, 2, 18);
        pixels.extend(vertical(10, 3, 12));
        let graph = SkeletonGraph::from_mask(&mask_from(21, 15, &pixels));

        assert_eq!(graph.branches().len(), 3);
        assert!(graph
            .branches()
            .iter()
            .all(|b| b.branch_type == BranchType::JunctionToEndpoint));
        assert_eq!(graph.endpoint_count(), 3);
        // (9, 2), (10, 2) and (11, 2) have three neighbours, the stem root (10, 3) has four
        assert_eq!(graph.branch_point_count(), 3);
        // Arms stop at the four-pixel junction cluster around (10, 2)
        assert_approx_eq!(graph.total_branch_distance(), 7.0 + 7.0 + 9.0);
    }

    #[test]
    fn closed_loop_is_a_cycle() {
        let mut pixels = horizontal(2, 2, 8);
        pixels.extend(horizontal(8, 2, 8));
        pixels.extend(vertical(2, 3, 7));
        pixels.extend(vertical(8, 3, 7));
        let graph = SkeletonGraph::from_mask(&mask_from(12, 12, &pixels));

        assert_eq!(graph.branches().len(), 1);
        let branch = &graph.branches()[0];
        assert_eq!(branch.branch_type, BranchType::Cycle);
        assert_eq!(branch.path.first(), branch.path.last());
        assert_approx_eq!(branch.distance, 24.0);
        assert_eq!(graph.endpoint_count(), 0);
    }

    #[test]
    fn separate_components_get_separate_ids() {
        let mut pixels = horizontal(1, 1, 6);
        pixels.extend(horizontal(8, 1, 6));
        let graph = SkeletonGraph::from_mask(&mask_from(10, 10, &pixels));
        let ids: HashSet<u32> = graph.branches().iter().map(|b| b.skeleton_id).collect();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn isolated_pixels_have_no_branches() {
        let graph = SkeletonGraph::from_mask(&mask_from(5, 5, &[(2, 2)]));
        assert!(graph.is_empty());
    }

    #[test]
    fn pruning_drops_short_spur_but_keeps_long_arms() {
        let mut pixels = horizontal(2, 2, 28);
        pixels.extend(vertical(15, 3, 5));
        let mask = mask_from(31, 10, &pixels);

        let pruned = remove_short_components(&mask, 8.0);
        assert!(is_on(&pruned, 2, 2));
        assert!(is_on(&pruned, 28, 2));
        assert!(is_on(&pruned, 15, 2));
        assert!(!is_on(&pruned, 15, 4));
        assert!(!is_on(&pruned, 15, 5));
        // Both arms plus the junction cluster
        assert_eq!(count_on(&pruned), 28);
    }

    #[test]
    fn pruning_removes_short_isolated_segments() {
        let mut pixels = horizontal(2, 2, 4);
        pixels.extend(horizontal(6, 2, 20));
        let pruned = remove_short_components(&mask_from(25, 10, &pixels), 5.0);
        assert!(!is_on(&pruned, 3, 2));
        assert!(is_on(&pruned, 10, 6));
    }
}
