use log::trace;

use crate::image_utils::{is_on, set_mask, Mask};

/// Offsets of the 8 neighbours in Zhang-Suen order: P2 (north) clockwise to P9 (north-west)
const RING: [(i64, i64); 8] = [
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
];

/// Neighbour states P2..P9; outside the image counts as off
fn ring_values(mask: &Mask, x: u32, y: u32) -> [bool; 8] {
    let (width, height) = mask.dimensions();
    let mut values = [false; 8];
    for (value, &(dx, dy)) in values.iter_mut().zip(RING.iter()) {
        let nx = x as i64 + dx;
        let ny = y as i64 + dy;
        if nx >= 0 && ny >= 0 && nx < width as i64 && ny < height as i64 {
            *value = is_on(mask, nx as u32, ny as u32);
        }
    }
    values
}

/// Number of off -> on transitions walking P2..P9 and back to P2
fn transitions(p: &[bool; 8]) -> usize {
    (0..8).filter(|&i| !p[i] && p[(i + 1) % 8]).count()
}

fn deletable(p: &[bool; 8], first_pass: bool) -> bool {
    let neighbours = p.iter().filter(|&&v| v).count();
    if !(2..=6).contains(&neighbours) || transitions(p) != 1 {
        return false;
    }

    let (p2, p4, p6, p8) = (p[0], p[2], p[4], p[6]);
    if first_pass {
        !(p2 && p4 && p6) && !(p4 && p6 && p8)
    } else {
        !(p2 && p4 && p8) && !(p2 && p6 && p8)
    }
}

/// Thin a binary mask to a one-pixel-wide skeleton (Zhang-Suen)
pub fn skeletonize(mask: &Mask) -> Mask {
    let mut skeleton = mask.clone();
    let (width, height) = skeleton.dimensions();
    let mut iterations = 0;

    loop {
        let mut changed = false;

        for first_pass in [true, false] {
            let mut to_delete = Vec::new();
            for y in 0..height {
                for x in 0..width {
                    if is_on(&skeleton, x, y) && deletable(&ring_values(&skeleton, x, y), first_pass) {
                        to_delete.push((x, y));
                    }
                }
            }

            changed |= !to_delete.is_empty();
            for (x, y) in to_delete {
                set_mask(&mut skeleton, x, y, false);
            }
        }

        iterations += 1;
        if !changed {
            break;
        }
    }

    let removed = remove_staircase_pixels(&mut skeleton);
    trace!(
        "Skeletonisation converged after {} iterations, {} staircase pixels removed",
        iterations, removed
    );
    skeleton
}

/// Yokoi 8-connectivity number; 1 means the pixel is simple
fn connectivity_number(p: &[bool; 8]) -> usize {
    // Reorder P2..P9 (N, NE, E, SE, S, SW, W, NW) to E, NE, N, NW, W, SW, S, SE
    let x = [p[2], p[1], p[0], p[7], p[6], p[5], p[4], p[3]];
    let off = |k: usize| !x[k % 8];
    [0, 2, 4, 6]
        .iter()
        .filter(|&&k| off(k) && !(off(k + 1) && off(k + 2)))
        .count()
}

/// Drop corner pixels of diagonal staircases, which would otherwise read as junctions.
/// Pixels are removed one at a time so connectivity is re-checked after each removal.
fn remove_staircase_pixels(skeleton: &mut Mask) -> usize {
    let (width, height) = skeleton.dimensions();
    let mut removed = 0;

    for y in 0..height {
        for x in 0..width {
            if !is_on(skeleton, x, y) {
                continue;
            }
            let p = ring_values(skeleton, x, y);
            let neighbours = p.iter().filter(|&&v| v).count();
            let (n, e, s, w) = (p[0], p[2], p[4], p[6]);
            let corner = (n || s) && (e || w);

            if neighbours >= 2 && corner && connectivity_number(&p) == 1 {
                set_mask(skeleton, x, y, false);
                removed += 1;
            }
        }
    }

    removed
}
