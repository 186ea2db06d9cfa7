// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use log::info;
use ndarray::{s, Array2, Array3};

use crate::core::Simbox;
use crate::error::{InversionError, Result};
use crate::moments::power_mean;

/// Expected velocity `E[exp(x)]` of a log-velocity field with a stationary variance.
pub fn expected_velocity(log_mean: &Array3<f64>, log_variance: f64) -> Array3<f64> {
    log_mean.mapv(|m| power_mean(m, log_variance, 1.0))
}

/// Depth of every layer boundary of the model interval.
///
/// Depths come from integrating the expected interval velocity over one-way
/// time, `Δz = v · Δt / 2000` for two-way `Δt` in ms, from a datum at zero
/// time and zero depth.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeDepthMapping {
    /// `nx × ny × (nz + 1)`; index 0 is the top of the model interval.
    depths: Array3<f64>,
}

impl TimeDepthMapping {
    /// Integrate the interval above the model, then the model interval.
    ///
    /// - `above_velocity`: `nx × ny × n_above` expected velocities between the
    ///   datum and the top surface, in equal time steps.
    /// - `model_velocity`: `nx × ny × nz` expected velocities of the model.
    pub fn from_velocity(
        simbox: &Simbox,
        above_velocity: &Array3<f64>,
        model_velocity: &Array3<f64>,
    ) -> Result<Self> {
        let (nx, ny, nz) = (simbox.nx(), simbox.ny(), simbox.nz());
        check_lateral(above_velocity, nx, ny, None)?;
        check_lateral(model_velocity, nx, ny, Some(nz))?;
        let n_above = above_velocity.dim().2;

        let mut depths = Array3::zeros((nx, ny, nz + 1));
        for i in 0..nx {
            for j in 0..ny {
                let dt_above = if n_above > 0 {
                    simbox.top(i, j) / n_above as f64
                } else {
                    0.0
                };
                let mut z: f64 = above_velocity
                    .slice(s![i, j, ..])
                    .iter()
                    .map(|v| v * dt_above / 2000.0)
                    .sum();
                depths[[i, j, 0]] = z;
                let dz = simbox.dz(i, j);
                for k in 0..nz {
                    z += model_velocity[[i, j, k]] * dz / 2000.0;
                    depths[[i, j, k + 1]] = z;
                }
            }
        }
        let mapping = TimeDepthMapping { depths };
        let top = mapping.top_depth();
        let base = mapping.base_depth();
        info!(
            "time-depth mapping: top {:.1}..{:.1} m, base {:.1}..{:.1} m",
            top.fold(f64::INFINITY, |a, &b| a.min(b)),
            top.fold(f64::NEG_INFINITY, |a, &b| a.max(b)),
            base.fold(f64::INFINITY, |a, &b| a.min(b)),
            base.fold(f64::NEG_INFINITY, |a, &b| a.max(b)),
        );
        Ok(mapping)
    }

    /// Depths of all layer boundaries, `nx × ny × (nz + 1)`.
    pub fn depths(&self) -> &Array3<f64> {
        &self.depths
    }

    /// Depth of the top surface.
    pub fn top_depth(&self) -> Array2<f64> {
        self.depths.slice(s![.., .., 0]).to_owned()
    }

    /// Depth of the base surface.
    pub fn base_depth(&self) -> Array2<f64> {
        let nz = self.depths.dim().2 - 1;
        self.depths.slice(s![.., .., nz]).to_owned()
    }

    /// Depth at two-way time `t` in column `(i, j)`, linear within each layer.
    ///
    /// Returns `None` outside the model interval.
    pub fn depth_at(&self, simbox: &Simbox, i: usize, j: usize, t: f64) -> Option<f64> {
        let (top, base) = (simbox.top(i, j), simbox.base(i, j));
        if !(t >= top && t <= base) {
            return None;
        }
        let nz = simbox.nz();
        let pos = (t - top) / simbox.dz(i, j);
        let k = (pos.floor() as usize).min(nz - 1);
        let r = pos - k as f64;
        let (z0, z1) = (self.depths[[i, j, k]], self.depths[[i, j, k + 1]]);
        Some(z0 + r * (z1 - z0))
    }
}

fn check_lateral(values: &Array3<f64>, nx: usize, ny: usize, nz: Option<usize>) -> Result<()> {
    let (a, b, c) = values.dim();
    if a != nx || b != ny || nz.map_or(false, |n| n != c) {
        return Err(InversionError::ShapeMismatch {
            expected: vec![nx, ny, nz.unwrap_or(c)],
            got: vec![a, b, c],
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_velocity_gives_linear_depths() {
        // 1000 ms to the top, 40 ms interval, 2000 m/s everywhere
        let simbox = Simbox::constant([2, 3], 4, (25.0, 25.0), 1000.0, 40.0).unwrap();
        let above = Array3::from_elem((2, 3, 5), 2000.0);
        let model = Array3::from_elem((2, 3, 4), 2000.0);
        let mapping = TimeDepthMapping::from_velocity(&simbox, &above, &model).unwrap();
        for i in 0..2 {
            for j in 0..3 {
                for k in 0..=4 {
                    let expected = 1000.0 + 10.0 * k as f64;
                    assert!((mapping.depths()[[i, j, k]] - expected).abs() < 1e-9);
                }
            }
        }
        assert!(mapping.base_depth().iter().all(|&z| (z - 1040.0).abs() < 1e-9));
        let z = mapping.depth_at(&simbox, 1, 2, 1013.0).unwrap();
        assert!((z - 1013.0).abs() < 1e-9);
        assert_eq!(mapping.depth_at(&simbox, 0, 0, 999.0), None);
    }

    #[test]
    fn faster_layers_are_thicker() {
        let simbox = Simbox::constant([1, 1], 2, (25.0, 25.0), 100.0, 20.0).unwrap();
        let above = Array3::from_elem((1, 1, 2), 1500.0);
        let mut model = Array3::from_elem((1, 1, 2), 2000.0);
        model[[0, 0, 1]] = 4000.0;
        let mapping = TimeDepthMapping::from_velocity(&simbox, &above, &model).unwrap();
        let d = mapping.depths();
        assert!((d[[0, 0, 0]] - 75.0).abs() < 1e-9);
        assert!((d[[0, 0, 1]] - 85.0).abs() < 1e-9);
        assert!((d[[0, 0, 2]] - 105.0).abs() < 1e-9);
    }

    #[test]
    fn expected_velocity_includes_variance() {
        let mean = Array3::from_elem((1, 1, 1), 2000.0f64.ln());
        let v = expected_velocity(&mean, 0.02);
        assert!((v[[0, 0, 0]] - 2000.0 * 0.01f64.exp()).abs() < 1e-9);
    }

    #[test]
    fn wrong_shape_rejected() {
        let simbox = Simbox::constant([2, 2], 4, (25.0, 25.0), 100.0, 40.0).unwrap();
        let above = Array3::from_elem((2, 2, 3), 2000.0);
        let model = Array3::from_elem((2, 2, 5), 2000.0);
        assert!(matches!(
            TimeDepthMapping::from_velocity(&simbox, &above, &model),
            Err(InversionError::ShapeMismatch { .. })
        ));
    }
}
