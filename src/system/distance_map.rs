//! Occupancy distance field used to spread point activation evenly over the
//! image.
//!
//! The field lives on pyramid level 1. It is seeded with the projected
//! positions of all active points in the newest keyframe and grown by
//! breadth-first expansion; a cell's value is its (chamfer) distance to the
//! nearest occupied cell.

use nalgebra::{Matrix3, Vector3};

use crate::calib::CalibHessian;
use crate::frame::FrameHessian;

/// Maximum grown distance; growth beyond this is irrelevant for the
/// activation thresholds.
const MAX_GROW: i32 = 40;

/// BFS distance field on pyramid level 1.
pub struct CoarseDistanceMap {
    pub w1: usize,
    pub h1: usize,
    /// Distance to the nearest occupied cell, clamped at `MAX_GROW`.
    pub dist: Vec<i32>,
    /// Level-1 intrinsics.
    pub k1: Matrix3<f32>,
    /// Inverse level-0 intrinsics.
    pub ki0: Matrix3<f32>,
}

impl CoarseDistanceMap {
    pub fn new(calib: &CalibHessian) -> Self {
        let w1 = calib.w[0] / 2;
        let h1 = calib.h[0] / 2;
        let mut dm = Self {
            w1,
            h1,
            dist: vec![MAX_GROW; w1 * h1],
            k1: Matrix3::identity(),
            ki0: Matrix3::identity(),
        };
        dm.make_k(calib);
        dm
    }

    /// Refresh the cached projection matrices from the calibration.
    pub fn make_k(&mut self, calib: &CalibHessian) {
        let fx1 = calib.fxl() * 0.5;
        let fy1 = calib.fyl() * 0.5;
        let cx1 = (calib.cxl() + 0.5) * 0.5 - 0.5;
        let cy1 = (calib.cyl() + 0.5) * 0.5 - 0.5;
        self.k1 = Matrix3::new(fx1, 0.0, cx1, 0.0, fy1, cy1, 0.0, 0.0, 1.0);
        self.ki0 = crate::frame::hessian::calib_ki(calib);
    }

    /// Rebuild the field: project every active point of every older window
    /// frame into the newest one and grow distances from those seeds.
    pub fn make_distance_map(&mut self, window: &[FrameHessian]) {
        self.dist.fill(MAX_GROW);
        let Some((newest, older)) = window.split_last() else {
            return;
        };

        let mut seeds = Vec::new();
        for fh in older {
            let fh_to_new = newest.pre_world_to_cam.compose(&fh.pre_cam_to_world);
            let r: Matrix3<f32> = fh_to_new.rotation_matrix().cast();
            let t: Vector3<f32> = fh_to_new.translation.cast();
            let krki = self.k1 * r * self.ki0;
            let kt = self.k1 * t;

            for ph in &fh.point_hessians {
                let ptp = krki * Vector3::new(ph.u, ph.v, 1.0) + kt * ph.idepth;
                let u = (ptp[0] / ptp[2] + 0.5) as i32;
                let v = (ptp[1] / ptp[2] + 0.5) as i32;
                if u > 0 && v > 0 && (u as usize) < self.w1 && (v as usize) < self.h1 {
                    let idx = u as usize + v as usize * self.w1;
                    if self.dist[idx] != 0 {
                        self.dist[idx] = 0;
                        seeds.push((u, v));
                    }
                }
            }
        }

        self.grow(seeds);
    }

    /// Stamp one more occupied cell and re-grow locally.
    pub fn add_into_dist(&mut self, u: i32, v: i32) {
        if u <= 0 || v <= 0 || u as usize >= self.w1 || v as usize >= self.h1 {
            return;
        }
        self.dist[u as usize + v as usize * self.w1] = 0;
        self.grow(vec![(u, v)]);
    }

    /// Distance value at a level-1 pixel.
    #[inline]
    pub fn value(&self, u: i32, v: i32) -> i32 {
        self.dist[u as usize + v as usize * self.w1]
    }

    /// Breadth-first growth, alternating 4- and 8-neighborhoods so the
    /// grown rings approximate Euclidean distance. Only lowers values.
    fn grow(&mut self, mut frontier: Vec<(i32, i32)>) {
        const N4: [(i32, i32); 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];
        const N8: [(i32, i32); 8] = [
            (1, 0),
            (-1, 0),
            (0, 1),
            (0, -1),
            (1, 1),
            (-1, 1),
            (1, -1),
            (-1, -1),
        ];

        for k in 1..MAX_GROW {
            if frontier.is_empty() {
                break;
            }
            let mut next = Vec::with_capacity(frontier.len() * 2);
            let neighbors: &[(i32, i32)] = if k % 2 == 0 { &N8 } else { &N4 };

            for &(x, y) in &frontier {
                for &(dx, dy) in neighbors {
                    let (nx, ny) = (x + dx, y + dy);
                    if nx < 0 || ny < 0 || nx as usize >= self.w1 || ny as usize >= self.h1 {
                        continue;
                    }
                    let idx = nx as usize + ny as usize * self.w1;
                    if self.dist[idx] > k {
                        self.dist[idx] = k;
                        next.push((nx, ny));
                    }
                }
            }
            frontier = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_map() -> CoarseDistanceMap {
        let calib = CalibHessian::new(128, 96, 80.0, 80.0, 64.0, 48.0);
        CoarseDistanceMap::new(&calib)
    }

    #[test]
    fn test_single_seed_distances() {
        let mut dm = test_map();
        dm.add_into_dist(32, 24);

        assert_eq!(dm.value(32, 24), 0);
        assert_eq!(dm.value(33, 24), 1);
        assert_eq!(dm.value(32, 25), 1);
        // Diagonal cell is reached on the second (8-neighborhood) ring.
        assert_eq!(dm.value(33, 25), 2);
        assert_eq!(dm.value(35, 24), 3);
    }

    #[test]
    fn test_growth_only_lowers() {
        let mut dm = test_map();
        dm.add_into_dist(32, 24);
        let before = dm.value(40, 24);
        dm.add_into_dist(48, 24);
        let after = dm.value(40, 24);
        assert!(after <= before);
        assert_eq!(dm.value(32, 24), 0);
    }

    #[test]
    fn test_empty_window_leaves_field_saturated() {
        let mut dm = test_map();
        dm.make_distance_map(&[]);
        assert!(dm.dist.iter().all(|&d| d == MAX_GROW));
    }
}
