// src/kdtree.rs - Two-dimensional k-d tree for nearest window-centre lookups

use std::cmp::Ordering;

#[derive(Debug, Clone)]
struct KdNode {
    index: usize,
    axis: usize,
    left: Option<Box<KdNode>>,
    right: Option<Box<KdNode>>,
}

/// Static k-d tree over 2-D points
#[derive(Debug, Clone)]
pub struct KdTree {
    points: Vec<[f64; 2]>,
    root: Option<Box<KdNode>>,
}

impl KdTree {
    /// Build a balanced tree; points with NaN coordinates are never returned
    pub fn new(points: Vec<[f64; 2]>) -> Self {
        let mut indices: Vec<usize> = (0..points.len())
            .filter(|&i| points[i].iter().all(|c| c.is_finite()))
            .collect();
        let root = Self::build(&points, &mut indices, 0);
        Self { points, root }
    }

    pub fn from_xy(x: &[f64], y: &[f64]) -> Self {
        Self::new(x.iter().zip(y).map(|(&a, &b)| [a, b]).collect())
    }

    fn build(points: &[[f64; 2]], indices: &mut [usize], depth: usize) -> Option<Box<KdNode>> {
        if indices.is_empty() {
            return None;
        }
        let axis = depth % 2;
        indices.sort_by(|&a, &b| {
            points[a][axis]
                .partial_cmp(&points[b][axis])
                .unwrap_or(Ordering::Equal)
                .then(a.cmp(&b))
        });
        let mid = indices.len() / 2;
        let index = indices[mid];
        let (left, rest) = indices.split_at_mut(mid);
        let right = &mut rest[1..];

        Some(Box::new(KdNode {
            index,
            axis,
            left: Self::build(points, left, depth + 1),
            right: Self::build(points, right, depth + 1),
        }))
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Nearest point as `(distance, index)`; equal distances resolve to the lower index.
    /// Non-finite queries match nothing.
    pub fn nearest(&self, query: [f64; 2]) -> Option<(f64, usize)> {
        if !query.iter().all(|c| c.is_finite()) {
            return None;
        }
        let root = self.root.as_deref()?;
        let mut best = (f64::INFINITY, usize::MAX);
        self.search(root, query, &mut best);
        if best.1 == usize::MAX {
            return None;
        }
        Some((best.0.sqrt(), best.1))
    }

    fn search(&self, node: &KdNode, query: [f64; 2], best: &mut (f64, usize)) {
        let p = self.points[node.index];
        let d2 = (p[0] - query[0]).powi(2) + (p[1] - query[1]).powi(2);
        if d2 < best.0 || (d2 == best.0 && node.index < best.1) {
            *best = (d2, node.index);
        }

        let diff = query[node.axis] - p[node.axis];
        let (near, far) = if diff < 0.0 {
            (&node.left, &node.right)
        } else {
            (&node.right, &node.left)
        };

        if let Some(n) = near.as_deref() {
            self.search(n, query, best);
        }
        // Equality keeps tied points on the far side reachable
        if diff * diff <= best.0 {
            if let Some(f) = far.as_deref() {
                self.search(f, query, best);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn brute_force(points: &[[f64; 2]], q: [f64; 2]) -> (f64, usize) {
        let mut best = (f64::INFINITY, usize::MAX);
        for (i, p) in points.iter().enumerate() {
            let d = ((p[0] - q[0]).powi(2) + (p[1] - q[1]).powi(2)).sqrt();
            if d < best.0 {
                best = (d, i);
            }
        }
        best
    }

    #[test]
    fn matches_brute_force_on_grid() {
        let points: Vec<[f64; 2]> = (0..12)
            .flat_map(|r| (0..9).map(move |c| [16.0 + 16.0 * c as f64, 16.0 + 16.0 * r as f64]))
            .collect();
        let tree = KdTree::new(points.clone());

        for q in [[0.0, 0.0], [37.3, 101.9], [150.0, 3.0], [500.0, 500.0], [61.0, 77.5]] {
            let (d, i) = tree.nearest(q).unwrap();
            let (bd, bi) = brute_force(&points, q);
            assert_approx_eq!(d, bd);
            assert_eq!(i, bi);
        }
    }

    #[test]
    fn ties_go_to_lower_index() {
        let tree = KdTree::new(vec![[10.0, 0.0], [0.0, 0.0], [5.0, 5.0]]);
        // (5, 0) is 5 from both index 0 and index 1, and from index 2
        let (d, i) = tree.nearest([5.0, 0.0]).unwrap();
        assert_approx_eq!(d, 5.0);
        assert_eq!(i, 0);
    }

    #[test]
    fn empty_tree_has_no_neighbour() {
        let tree = KdTree::new(Vec::new());
        assert!(tree.is_empty());
        assert!(tree.nearest([1.0, 1.0]).is_none());
    }

    #[test]
    fn exact_hit_has_zero_distance() {
        let tree = KdTree::from_xy(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]);
        assert_eq!(tree.nearest([2.0, 5.0]), Some((0.0, 1)));
    }

    #[test]
    fn non_finite_query_has_no_neighbour() {
        let tree = KdTree::from_xy(&[1.0, 2.0], &[4.0, 5.0]);
        assert!(tree.nearest([f64::NAN, 0.0]).is_none());
        assert!(tree.nearest([0.0, f64::INFINITY]).is_none());
    }
}
