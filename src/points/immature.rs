//! Immature points: pixel hypotheses whose inverse depth is still an
//! interval, narrowed by epipolar search against each new frame.

use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};

use crate::calib::{CalibHessian, PATTERN_NUM, PATTERN_P};
use crate::frame::hessian::FrameTargetPrecalc;
use crate::frame::image::{interpolated_element_31, interpolated_element_33, interpolated_element_33_bilin};
use crate::points::hessian::ResState;
use crate::points::projections::{derive_idepth, project_point_full};
use crate::settings::Settings;

/// Result of the last epipolar trace of an immature point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceStatus {
    /// Traced well and good.
    Good,
    /// Out of bounds: ended tracking, and will be removed.
    Oob,
    /// Energy too high: if happening many times in a row, an outlier.
    Outlier,
    /// Traced well, but the interval was too short to be worth updating.
    Skipped,
    /// Not traced because of bad angle between the gradient and the
    /// epipolar line.
    BadCondition,
    /// Not even traced once.
    Uninitialized,
}

/// A pixel hypothesis with an inverse-depth interval, owned by its host
/// frame until activated or discarded.
#[derive(Debug, Clone)]
pub struct ImmaturePoint {
    pub u: f32,
    pub v: f32,
    /// Selector class of the pixel (controls activation density).
    pub point_type: f32,

    /// Reference pattern intensities in the host frame.
    pub color: [f32; PATTERN_NUM],
    /// Gradient-dependent residual weights.
    pub weights: [f32; PATTERN_NUM],
    /// Accumulated 2x2 gradient outer product over the pattern.
    pub grad_h: Matrix2<f32>,

    /// Energy threshold for the outlier test.
    pub energy_th: f32,
    /// Best/second-best ratio of the last discrete search.
    pub quality: f32,

    pub idepth_min: f32,
    pub idepth_max: f32,

    pub last_trace_status: TraceStatus,
    pub last_trace_uv: Vector2<f32>,
    pub last_trace_pixel_interval: f32,
}

impl ImmaturePoint {
    /// Sample the pattern in the host frame and set up the hypothesis.
    /// Returns `None` if any pattern pixel has a non-finite intensity.
    pub fn new(
        u: f32,
        v: f32,
        point_type: f32,
        host_di: &[[f32; 3]],
        calib: &CalibHessian,
        settings: &Settings,
    ) -> Option<Self> {
        let w0 = calib.w[0];
        let mut color = [0f32; PATTERN_NUM];
        let mut weights = [0f32; PATTERN_NUM];
        let mut grad_h = Matrix2::zeros();

        for idx in 0..PATTERN_NUM {
            let dx = PATTERN_P[idx][0] as f32;
            let dy = PATTERN_P[idx][1] as f32;
            let ptc = interpolated_element_33_bilin(host_di, u + dx, v + dy, w0);

            color[idx] = ptc[0];
            if !color[idx].is_finite() {
                return None;
            }

            let g = Vector2::new(ptc[1], ptc[2]);
            grad_h += g * g.transpose();
            weights[idx] = (settings.outlier_th_sum_component
                / (settings.outlier_th_sum_component + g.norm_squared()))
            .sqrt();
        }

        let energy_th = PATTERN_NUM as f32
            * settings.outlier_th
            * settings.overall_energy_th_weight
            * settings.overall_energy_th_weight;

        Some(Self {
            u,
            v,
            point_type,
            color,
            weights,
            grad_h,
            energy_th,
            quality: 10000.0,
            idepth_min: 0.0,
            idepth_max: f32::NAN,
            last_trace_status: TraceStatus::Uninitialized,
            last_trace_uv: Vector2::new(-1.0, -1.0),
            last_trace_pixel_interval: 0.0,
        })
    }

    /// Epipolar search against a new frame: discrete sampling along the
    /// projected interval followed by 1-D Gauss-Newton refinement, updating
    /// `idepth_min`/`idepth_max` from the matched position.
    ///
    /// `krki` and `kt` are the pixel-space relative motion host -> frame;
    /// `aff` maps host intensities into the frame.
    pub fn trace_on(
        &mut self,
        target_di: &[[f32; 3]],
        krki: &Matrix3<f32>,
        kt: &Vector3<f32>,
        aff: [f32; 2],
        calib: &CalibHessian,
        settings: &Settings,
    ) -> TraceStatus {
        if self.last_trace_status == TraceStatus::Oob {
            return TraceStatus::Oob;
        }

        let w0 = calib.w[0];
        let wf = calib.w[0] as f32;
        let hf = calib.h[0] as f32;
        let max_pix_search = (wf + hf) * settings.max_pix_search;

        // Project at the near end of the interval.
        let pr = krki * Vector3::new(self.u, self.v, 1.0);
        let ptp_min = pr + kt * self.idepth_min;
        let u_min = ptp_min[0] / ptp_min[2];
        let v_min = ptp_min[1] / ptp_min[2];

        // The pattern rotates with the in-plane part of the motion; widen the
        // image margin accordingly.
        let rplane: Matrix2<f32> = krki.fixed_view::<2, 2>(0, 0).into_owned();
        let mut rotated_pattern = [Vector2::zeros(); PATTERN_NUM];
        let mut max_rot_pat_x = 0i32;
        let mut max_rot_pat_y = 0i32;
        for idx in 0..PATTERN_NUM {
            rotated_pattern[idx] =
                rplane * Vector2::new(PATTERN_P[idx][0] as f32, PATTERN_P[idx][1] as f32);
            max_rot_pat_x = max_rot_pat_x.max(rotated_pattern[idx][0].abs() as i32);
            max_rot_pat_y = max_rot_pat_y.max(rotated_pattern[idx][1].abs() as i32);
        }
        let bound_u = 4i32.max(max_rot_pat_x + 2) as f32;
        let bound_v = 4i32.max(max_rot_pat_y + 2) as f32;

        if !(u_min > bound_u
            && v_min > bound_v
            && u_min < wf - bound_u - 1.0
            && v_min < hf - bound_v - 1.0)
        {
            self.last_trace_uv = Vector2::new(-1.0, -1.0);
            self.last_trace_pixel_interval = 0.0;
            self.last_trace_status = TraceStatus::Oob;
            return self.last_trace_status;
        }

        let mut dist;
        let mut u_max;
        let mut v_max;
        if self.idepth_max.is_finite() {
            let ptp_max = pr + kt * self.idepth_max;
            u_max = ptp_max[0] / ptp_max[2];
            v_max = ptp_max[1] / ptp_max[2];

            if !(u_max > bound_u
                && v_max > bound_v
                && u_max < wf - bound_u - 1.0
                && v_max < hf - bound_v - 1.0)
            {
                self.last_trace_uv = Vector2::new(-1.0, -1.0);
                self.last_trace_pixel_interval = 0.0;
                self.last_trace_status = TraceStatus::Oob;
                return self.last_trace_status;
            }

            // Interval already narrow: no point in searching.
            dist = ((u_min - u_max) * (u_min - u_max) + (v_min - v_max) * (v_min - v_max)).sqrt();
            if dist < settings.trace_slack_interval {
                self.last_trace_uv = Vector2::new(u_max + u_min, v_max + v_min) * 0.5;
                self.last_trace_pixel_interval = dist;
                self.last_trace_status = TraceStatus::Skipped;
                return self.last_trace_status;
            }
        } else {
            // Unbounded interval: take the epipolar direction from a token
            // depth and search a fixed length.
            dist = max_pix_search;

            let ptp_max = pr + kt * 0.01;
            u_max = ptp_max[0] / ptp_max[2];
            v_max = ptp_max[1] / ptp_max[2];

            let dx = u_max - u_min;
            let dy = v_max - v_min;
            let d = 1.0 / (dx * dx + dy * dy).sqrt();

            u_max = u_min + dist * dx * d;
            v_max = v_min + dist * dy * d;

            if !(u_max > bound_u
                && v_max > bound_v
                && u_max < wf - bound_u - 1.0
                && v_max < hf - bound_v - 1.0)
            {
                self.last_trace_uv = Vector2::new(-1.0, -1.0);
                self.last_trace_pixel_interval = 0.0;
                self.last_trace_status = TraceStatus::Oob;
                return self.last_trace_status;
            }
        }

        // Scale change guard.
        if !(self.idepth_min < 0.0 || (ptp_min[2] > 0.75 && ptp_min[2] < 1.5)) {
            self.last_trace_uv = Vector2::new(-1.0, -1.0);
            self.last_trace_pixel_interval = 0.0;
            self.last_trace_status = TraceStatus::Oob;
            return self.last_trace_status;
        }

        // Attainable accuracy from the gradient along vs. across the
        // epipolar direction.
        let mut dx = settings.trace_stepsize * (u_max - u_min);
        let mut dy = settings.trace_stepsize * (v_max - v_min);

        let a = (Vector2::new(dx, dy).transpose() * self.grad_h * Vector2::new(dx, dy))[0];
        let b = (Vector2::new(dy, -dx).transpose() * self.grad_h * Vector2::new(dy, -dx))[0];
        let mut error_in_pixel = 0.2 + 0.2 * (a + b) / a;

        if error_in_pixel * settings.trace_min_improvement_factor > dist
            && self.idepth_max.is_finite()
        {
            self.last_trace_uv = Vector2::new(u_max + u_min, v_max + v_min) * 0.5;
            self.last_trace_pixel_interval = dist;
            self.last_trace_status = TraceStatus::BadCondition;
            return self.last_trace_status;
        }
        if error_in_pixel > 10.0 {
            error_in_pixel = 10.0;
        }

        // Discrete search along the segment.
        dx /= dist;
        dy /= dist;

        if dist > max_pix_search {
            dist = max_pix_search;
        }

        let mut num_steps = (1.9999f32 + dist / settings.trace_stepsize) as i32;

        // Deterministic sub-pixel jitter of the start position.
        let rand_shift = u_min * 1000.0 - (u_min * 1000.0).floor();
        let mut ptx = u_min - rand_shift * dx;
        let mut pty = v_min - rand_shift * dy;

        if !dx.is_finite() || !dy.is_finite() {
            self.last_trace_pixel_interval = 0.0;
            self.last_trace_uv = Vector2::new(-1.0, -1.0);
            self.last_trace_status = TraceStatus::Oob;
            return self.last_trace_status;
        }

        let mut errors = [0f32; 100];
        let mut best_u = 0.0;
        let mut best_v = 0.0;
        let mut best_energy = 1e10;
        let mut best_idx = -1i32;
        if num_steps >= 100 {
            num_steps = 99;
        }

        for i in 0..num_steps {
            let mut energy = 0.0;
            for idx in 0..PATTERN_NUM {
                let hit_color = interpolated_element_31(
                    target_di,
                    ptx + rotated_pattern[idx][0],
                    pty + rotated_pattern[idx][1],
                    w0,
                );
                if !hit_color.is_finite() {
                    energy += 1e5;
                    continue;
                }
                let residual = hit_color - (aff[0] * self.color[idx] + aff[1]);
                let hw = if residual.abs() < settings.huber_th {
                    1.0
                } else {
                    settings.huber_th / residual.abs()
                };
                energy += hw * residual * residual * (2.0 - hw);
            }

            errors[i as usize] = energy;
            if energy < best_energy {
                best_u = ptx;
                best_v = pty;
                best_energy = energy;
                best_idx = i;
            }

            ptx += dx;
            pty += dy;
        }

        // Best score outside a small radius around the best match.
        let mut second_best = 1e10f32;
        for i in 0..num_steps {
            if (i < best_idx - settings.min_trace_test_radius
                || i > best_idx + settings.min_trace_test_radius)
                && errors[i as usize] < second_best
            {
                second_best = errors[i as usize];
            }
        }
        let new_quality = second_best / best_energy;
        if new_quality < self.quality || num_steps > 10 {
            self.quality = new_quality;
        }

        // 1-D Gauss-Newton refinement along the epipolar direction.
        let mut u_bak = best_u;
        let mut v_bak = best_v;
        let gn_stepsize = 1.0f32;
        let mut step_back = 0.0f32;
        if settings.trace_gn_iterations > 0 {
            best_energy = 1e5;
        }
        for _ in 0..settings.trace_gn_iterations {
            let mut h_acc = 1.0f32;
            let mut b_acc = 0.0f32;
            let mut energy = 0.0f32;
            for idx in 0..PATTERN_NUM {
                let pos_u = best_u + rotated_pattern[idx][0];
                let pos_v = best_v + rotated_pattern[idx][1];
                if pos_u < 0.0 || pos_v < 0.0 || pos_u >= wf - 1.0 || pos_v >= hf - 1.0 {
                    self.last_trace_uv = Vector2::new(-1.0, -1.0);
                    self.last_trace_pixel_interval = 0.0;
                    self.last_trace_status = TraceStatus::Oob;
                    return self.last_trace_status;
                }

                let hit_color = interpolated_element_33(target_di, pos_u, pos_v, w0);
                if !hit_color[0].is_finite() {
                    energy += 1e5;
                    continue;
                }
                let residual = hit_color[0] - (aff[0] * self.color[idx] + aff[1]);
                let d_res_d_dist = dx * hit_color[1] + dy * hit_color[2];
                let hw = if residual.abs() < settings.huber_th {
                    1.0
                } else {
                    settings.huber_th / residual.abs()
                };

                h_acc += hw * d_res_d_dist * d_res_d_dist;
                b_acc += hw * residual * d_res_d_dist;
                energy += self.weights[idx]
                    * self.weights[idx]
                    * hw
                    * residual
                    * residual
                    * (2.0 - hw);
            }

            if energy > best_energy {
                // Worse: roll halfway back towards the previous position.
                step_back *= 0.5;
                best_u = u_bak + step_back * dx;
                best_v = v_bak + step_back * dy;
            } else {
                let mut step = -gn_stepsize * b_acc / h_acc;
                step = step.clamp(-0.5, 0.5);
                if !step.is_finite() {
                    step = 0.0;
                }

                u_bak = best_u;
                v_bak = best_v;
                step_back = step;

                best_u += step * dx;
                best_v += step * dy;
                best_energy = energy;
            }

            if step_back.abs() < settings.trace_gn_threshold {
                break;
            }
        }

        // Energy-based outlier check; a second strike ends the point.
        if !(best_energy < self.energy_th * settings.trace_extra_slack_on_th) {
            self.last_trace_pixel_interval = 0.0;
            self.last_trace_uv = Vector2::new(-1.0, -1.0);
            self.last_trace_status = if self.last_trace_status == TraceStatus::Outlier {
                TraceStatus::Oob
            } else {
                TraceStatus::Outlier
            };
            return self.last_trace_status;
        }

        // Invert the projection at both interval endpoints, along the
        // dominant epipolar axis.
        if dx * dx > dy * dy {
            self.idepth_min = (pr[2] * (best_u - error_in_pixel * dx) - pr[0])
                / (kt[0] - kt[2] * (best_u - error_in_pixel * dx));
            self.idepth_max = (pr[2] * (best_u + error_in_pixel * dx) - pr[0])
                / (kt[0] - kt[2] * (best_u + error_in_pixel * dx));
        } else {
            self.idepth_min = (pr[2] * (best_v - error_in_pixel * dy) - pr[1])
                / (kt[1] - kt[2] * (best_v - error_in_pixel * dy));
            self.idepth_max = (pr[2] * (best_v + error_in_pixel * dy) - pr[1])
                / (kt[1] - kt[2] * (best_v + error_in_pixel * dy));
        }
        if self.idepth_min > self.idepth_max {
            std::mem::swap(&mut self.idepth_min, &mut self.idepth_max);
        }

        if !self.idepth_min.is_finite() || !self.idepth_max.is_finite() || self.idepth_max < 0.0 {
            self.last_trace_pixel_interval = 0.0;
            self.last_trace_uv = Vector2::new(-1.0, -1.0);
            self.last_trace_status = TraceStatus::Outlier;
            return self.last_trace_status;
        }

        self.last_trace_pixel_interval = 2.0 * error_in_pixel;
        self.last_trace_uv = Vector2::new(best_u, best_v);
        self.last_trace_status = TraceStatus::Good;
        self.last_trace_status
    }

    /// Linearize the photometric residual of this point against one target
    /// frame at a fixed inverse depth, accumulating the 1-D normal equation.
    /// Used when optimizing the point for activation.
    pub fn linearize_residual(
        &self,
        calib: &CalibHessian,
        settings: &Settings,
        outlier_th_slack: f32,
        precalc: &FrameTargetPrecalc,
        target_di: &[[f32; 3]],
        tmp_res: &mut TemporaryResidual,
        hdd: &mut f32,
        bd: &mut f32,
        idepth: f32,
    ) -> f32 {
        if tmp_res.state == ResState::Oob {
            tmp_res.new_state = ResState::Oob;
            return tmp_res.energy;
        }

        let mut energy_left = 0.0f32;
        let aff = precalc.pre_aff_mode;

        for idx in 0..PATTERN_NUM {
            let dx = PATTERN_P[idx][0];
            let dy = PATTERN_P[idx][1];

            let proj = match project_point_full(
                self.u,
                self.v,
                idepth,
                dx,
                dy,
                calib,
                &precalc.pre_r_tll,
                &precalc.pre_t_tll,
            ) {
                Some(p) => p,
                None => {
                    tmp_res.new_state = ResState::Oob;
                    return tmp_res.energy;
                }
            };

            let hit_color = interpolated_element_33(target_di, proj.ku, proj.kv, calib.w[0]);
            if !hit_color[0].is_finite() {
                tmp_res.new_state = ResState::Oob;
                return tmp_res.energy;
            }
            let residual = hit_color[0] - (aff[0] * self.color[idx] + aff[1]);

            let mut hw = if residual.abs() < settings.huber_th {
                1.0
            } else {
                settings.huber_th / residual.abs()
            };
            energy_left +=
                self.weights[idx] * self.weights[idx] * hw * residual * residual * (2.0 - hw);

            let dx_interp = hit_color[1] * calib.fxl();
            let dy_interp = hit_color[2] * calib.fyl();
            let d_idepth = derive_idepth(
                &precalc.pre_t_tll,
                proj.u,
                proj.v,
                dx_interp,
                dy_interp,
                proj.drescale,
            );

            hw *= self.weights[idx] * self.weights[idx];
            *hdd += (hw * d_idepth) * d_idepth;
            *bd += (hw * residual) * d_idepth;
        }

        if energy_left > self.energy_th * outlier_th_slack {
            energy_left = self.energy_th * outlier_th_slack;
            tmp_res.new_state = ResState::Outlier;
        } else {
            tmp_res.new_state = ResState::In;
        }

        tmp_res.new_energy = energy_left;
        energy_left
    }
}

/// Scratch residual used while optimizing an immature point against the
/// window frames.
#[derive(Debug, Clone, Copy)]
pub struct TemporaryResidual {
    /// Window slot of the target frame.
    pub target_idx: usize,
    pub state: ResState,
    pub new_state: ResState,
    pub energy: f32,
    pub new_energy: f32,
}

impl TemporaryResidual {
    pub fn new(target_idx: usize) -> Self {
        Self {
            target_idx,
            state: ResState::In,
            new_state: ResState::Outlier,
            energy: 0.0,
            new_energy: 0.0,
        }
    }

    /// Accept the newly computed state.
    pub fn apply(&mut self) {
        self.state = self.new_state;
        self.energy = self.new_energy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::hessian::{calib_k, calib_ki};
    use nalgebra::Matrix3 as M3;

    const W: usize = 128;
    const H: usize = 96;

    fn test_calib() -> CalibHessian {
        CalibHessian::new(W, H, 80.0, 80.0, 64.0, 48.0)
    }

    /// Vertical stripes: strong gradient in x only.
    fn stripes_x(shift: f32) -> Vec<f32> {
        (0..W * H)
            .map(|i| {
                let x = (i % W) as f32 + shift;
                128.0 + 60.0 * (x * 0.55).sin()
            })
            .collect()
    }

    /// Horizontal stripes: strong gradient in y only.
    fn stripes_y() -> Vec<f32> {
        (0..W * H)
            .map(|i| {
                let y = (i / W) as f32;
                128.0 + 60.0 * (y * 0.55).sin()
            })
            .collect()
    }

    fn di_of(image: &[f32], calib: &CalibHessian) -> Vec<[f32; 3]> {
        crate::frame::image::Pyramid::build(image, calib).di[0].clone()
    }

    /// Pixel-space motion for a pure x-translation of the camera.
    fn motion_x(calib: &CalibHessian, tx: f32) -> (M3<f32>, Vector3<f32>) {
        let k = calib_k(calib);
        let ki = calib_ki(calib);
        let krki = k * M3::identity() * ki;
        let kt = k * Vector3::new(tx, 0.0, 0.0);
        (krki, kt)
    }

    fn make_point(calib: &CalibHessian, settings: &Settings, di: &[[f32; 3]]) -> ImmaturePoint {
        let mut p = ImmaturePoint::new(64.0, 48.0, 1.0, di, calib, settings).unwrap();
        p.idepth_min = 0.3;
        p.idepth_max = 2.5;
        p
    }

    #[test]
    fn test_trace_good_recovers_depth() {
        let calib = test_calib();
        let settings = Settings::default();
        let host = di_of(&stripes_x(0.0), &calib);

        // The scene is a fronto-parallel plane at depth 1; a camera shift of
        // tx moves every pixel by -fx * tx * idepth.
        let tx = -0.1f32;
        let true_idepth = 1.0f32;
        let disp = calib.fxl() * tx * true_idepth; // pixel shift at idepth 1
        let target = di_of(&stripes_x(-disp), &calib);

        let (krki, kt) = motion_x(&calib, tx);
        let mut p = make_point(&calib, &settings, &host);
        let status = p.trace_on(&target, &krki, &kt, [1.0, 0.0], &calib, &settings);

        assert_eq!(status, TraceStatus::Good);
        assert!(p.idepth_min <= p.idepth_max);
        assert!(
            p.idepth_min < true_idepth && p.idepth_max > true_idepth,
            "interval [{}, {}] should contain {}",
            p.idepth_min,
            p.idepth_max,
            true_idepth
        );
        assert_eq!(p.last_trace_pixel_interval, 2.0 * 0.4); // max gradient along search dir
    }

    #[test]
    fn test_trace_is_idempotent() {
        let calib = test_calib();
        let settings = Settings::default();
        let host = di_of(&stripes_x(0.0), &calib);
        let target = di_of(&stripes_x(8.0), &calib);
        let (krki, kt) = motion_x(&calib, -0.1);

        let mut a = make_point(&calib, &settings, &host);
        let mut b = a.clone();
        let sa = a.trace_on(&target, &krki, &kt, [1.0, 0.0], &calib, &settings);
        let sb = b.trace_on(&target, &krki, &kt, [1.0, 0.0], &calib, &settings);

        assert_eq!(sa, sb);
        assert_eq!(a.idepth_min, b.idepth_min);
        assert_eq!(a.idepth_max, b.idepth_max);
    }

    #[test]
    fn test_trace_bad_condition_on_orthogonal_gradient() {
        let calib = test_calib();
        let settings = Settings::default();
        // Host gradient purely in y, epipolar direction along x: no
        // information along the search direction.
        let host = di_of(&stripes_y(), &calib);
        let target = di_of(&stripes_y(), &calib);
        let (krki, kt) = motion_x(&calib, -0.1);

        let mut p = make_point(&calib, &settings, &host);
        let s1 = p.trace_on(&target, &krki, &kt, [1.0, 0.0], &calib, &settings);
        assert_eq!(s1, TraceStatus::BadCondition);
        // Same geometry again: still BADCONDITION, interval untouched.
        let s2 = p.trace_on(&target, &krki, &kt, [1.0, 0.0], &calib, &settings);
        assert_eq!(s2, TraceStatus::BadCondition);
        assert_eq!(p.idepth_min, 0.3);
        assert_eq!(p.idepth_max, 2.5);
    }

    #[test]
    fn test_trace_oob_is_terminal() {
        let calib = test_calib();
        let settings = Settings::default();
        let host = di_of(&stripes_x(0.0), &calib);
        let target = di_of(&stripes_x(0.0), &calib);
        let (krki, kt) = motion_x(&calib, -0.1);

        let mut p = ImmaturePoint::new(3.0, 3.0, 1.0, &host, &calib, &settings).unwrap();
        p.idepth_min = 0.3;
        p.idepth_max = 2.5;
        // Near the border: the min-depth projection violates the margin.
        assert_eq!(
            p.trace_on(&target, &krki, &kt, [1.0, 0.0], &calib, &settings),
            TraceStatus::Oob
        );
        // Terminal even with benign geometry afterwards.
        p.u = 64.0;
        p.v = 48.0;
        assert_eq!(
            p.trace_on(&target, &krki, &kt, [1.0, 0.0], &calib, &settings),
            TraceStatus::Oob
        );
    }

    #[test]
    fn test_trace_outlier_two_strikes_becomes_oob() {
        let calib = test_calib();
        let settings = Settings::default();
        let host = di_of(&stripes_x(0.0), &calib);
        // Target has completely different content: photometric error stays
        // above the energy threshold everywhere on the epipolar segment.
        let flat: Vec<f32> = vec![10.0; W * H];
        let target = di_of(&flat, &calib);
        let (krki, kt) = motion_x(&calib, -0.1);

        let mut p = make_point(&calib, &settings, &host);
        assert_eq!(
            p.trace_on(&target, &krki, &kt, [1.0, 0.0], &calib, &settings),
            TraceStatus::Outlier
        );
        assert_eq!(
            p.trace_on(&target, &krki, &kt, [1.0, 0.0], &calib, &settings),
            TraceStatus::Oob
        );
    }

    #[test]
    fn test_trace_uninitialized_never_skips() {
        let calib = test_calib();
        let settings = Settings::default();
        let host = di_of(&stripes_x(0.0), &calib);
        let target = di_of(&stripes_x(8.0), &calib);
        // Tiny translation: a bounded interval this short would be skipped.
        let (krki, kt) = motion_x(&calib, -1e-4);

        let mut p = ImmaturePoint::new(64.0, 48.0, 1.0, &host, &calib, &settings).unwrap();
        assert!(p.idepth_max.is_nan());
        let status = p.trace_on(&target, &krki, &kt, [1.0, 0.0], &calib, &settings);
        assert_ne!(status, TraceStatus::Skipped);
    }

    #[test]
    fn test_trace_skipped_on_narrow_interval() {
        let calib = test_calib();
        let settings = Settings::default();
        let host = di_of(&stripes_x(0.0), &calib);
        let target = di_of(&stripes_x(0.0), &calib);
        let (krki, kt) = motion_x(&calib, -0.1);

        let mut p = ImmaturePoint::new(64.0, 48.0, 1.0, &host, &calib, &settings).unwrap();
        // fx * |tx| * width(interval) = 8 * 0.01 < slack interval of 1.5 px.
        p.idepth_min = 1.0;
        p.idepth_max = 1.01;
        assert_eq!(
            p.trace_on(&target, &krki, &kt, [1.0, 0.0], &calib, &settings),
            TraceStatus::Skipped
        );
        // The interval is left untouched.
        assert_eq!(p.idepth_min, 1.0);
        assert_eq!(p.idepth_max, 1.01);
    }

    #[test]
    fn test_interval_ordering_invariant() {
        let calib = test_calib();
        let settings = Settings::default();
        let host = di_of(&stripes_x(0.0), &calib);
        let tx = 0.1f32; // positive translation flips the epipolar direction
        let disp = calib.fxl() * tx;
        let target = di_of(&stripes_x(-disp), &calib);
        let (krki, kt) = motion_x(&calib, tx);

        let mut p = make_point(&calib, &settings, &host);
        if p.trace_on(&target, &krki, &kt, [1.0, 0.0], &calib, &settings) == TraceStatus::Good {
            assert!(p.idepth_min <= p.idepth_max);
        }
    }
}
