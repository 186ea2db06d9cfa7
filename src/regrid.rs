// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use log::{debug, info};
use ndarray::{Array2, Array3, Zip};

use crate::core::Simbox;
use crate::error::{InversionError, Result};
use crate::field::{AccessMode, Field3D};
use crate::moments::power_mean;

/// Variance of a stationary covariance kernel, its value at zero lag.
pub fn kernel_variance(kernel: &mut Field3D) -> Result<f64> {
    kernel.ensure_space()?;
    let access = kernel.access(AccessMode::Read)?;
    Ok(access.real(0, 0, 0))
}

/// `E[Vp_prior] / E[Vp_post]` for log-velocity fields with stationary variances.
pub fn velocity_ratio(
    prior_mean: &Array3<f64>,
    prior_variance: f64,
    posterior_mean: &Array3<f64>,
    posterior_variance: f64,
) -> Result<Array3<f64>> {
    check_same_shape(prior_mean, posterior_mean)?;
    Ok(Zip::from(prior_mean)
        .and(posterior_mean)
        .map_collect(|&pri, &post| {
            power_mean(pri, prior_variance, 1.0) / power_mean(post, posterior_variance, 1.0)
        }))
}

/// `E[exp(−x)]` for a log velocity-change field `x = ln(Vp1 / Vp0)`, i.e. the
/// expected `Vp0 / Vp1`.
pub fn inverse_change_ratio(change_mean: &Array3<f64>, change_variance: f64) -> Array3<f64> {
    change_mean.mapv(|m| power_mean(m, change_variance, -1.0))
}

/// New layer thickness of every cell, measured in the old time axis.
pub fn distance_grid(ratio: &Array3<f64>, simbox: &Simbox) -> Result<Array3<f64>> {
    let expected = [simbox.nx(), simbox.ny(), simbox.nz()];
    if ratio.shape() != expected {
        return Err(InversionError::ShapeMismatch {
            expected: expected.to_vec(),
            got: ratio.shape().to_vec(),
        });
    }
    Ok(Array3::from_shape_fn(ratio.dim(), |(i, j, k)| {
        ratio[[i, j, k]] * simbox.dz(i, j)
    }))
}

/// Geometry with the same top and a base at `top + Σₖ distance`.
///
/// # Errors
/// Returns [`InversionError::InvalidGeometry`] if the new thickness ratio is
/// below `lz_limit`.
pub fn new_geometry(simbox: &Simbox, distance: &Array3<f64>, lz_limit: f64) -> Result<Simbox> {
    let (nx, ny) = (simbox.nx(), simbox.ny());
    let base = Array2::from_shape_fn((nx, ny), |(i, j)| {
        simbox.top(i, j) + distance.slice(ndarray::s![i, j, ..]).sum()
    });
    let derived = simbox.with_base(base, lz_limit)?;
    info!(
        "regridded simbox: layer thickness {:.3}..{:.3} ms (was {:.3}..{:.3})",
        derived.min_dz(),
        derived.max_dz(),
        simbox.min_dz(),
        simbox.max_dz()
    );
    Ok(derived)
}

/// Old-axis offset from the top of every new layer in one column.
///
/// `distance` holds the new thickness of each old layer, `dz_old` and
/// `dz_new` the old and new uniform layer thickness. The result is
/// non-decreasing whenever every distance is positive.
pub fn resample_column(distance: &[f64], dz_old: f64, dz_new: f64) -> Vec<f64> {
    let nz = distance.len();
    let mut cumulative = Vec::with_capacity(nz + 1);
    cumulative.push(0.0);
    for d in distance {
        let last = cumulative[cumulative.len() - 1];
        cumulative.push(last + d);
    }

    let mut l = 0;
    (0..nz)
        .map(|k| {
            let tk = k as f64 * dz_new;
            while l + 1 < nz && cumulative[l + 1] <= tk {
                l += 1;
            }
            let width = cumulative[l + 1] - cumulative[l];
            let r = if width > 0.0 {
                ((tk - cumulative[l]) / width).clamp(0.0, 1.0)
            } else {
                0.0
            };
            (l as f64 + r) * dz_old
        })
        .collect()
}

/// Fractional old-layer index of every new layer.
#[derive(Debug, Clone)]
pub struct ResampleMap {
    positions: Array3<f64>,
}

impl ResampleMap {
    /// Build the map between `old` and `new` from the distance grid.
    pub fn new(old: &Simbox, new: &Simbox, distance: &Array3<f64>) -> Result<Self> {
        let (nx, ny, nz) = (old.nx(), old.ny(), old.nz());
        if distance.shape() != [nx, ny, nz] || [new.nx(), new.ny(), new.nz()] != [nx, ny, nz] {
            return Err(InversionError::ShapeMismatch {
                expected: vec![nx, ny, nz],
                got: distance.shape().to_vec(),
            });
        }
        let mut positions = Array3::zeros((nx, ny, nz));
        for i in 0..nx {
            for j in 0..ny {
                let column: Vec<f64> = distance.slice(ndarray::s![i, j, ..]).to_vec();
                let d1 = old.dz(i, j);
                let offsets = resample_column(&column, d1, new.dz(i, j));
                for (k, t) in offsets.into_iter().enumerate() {
                    positions[[i, j, k]] = t / d1;
                }
            }
        }
        Ok(ResampleMap { positions })
    }

    /// Fractional source index of new cell `(i, j, k)`.
    pub fn position(&self, i: usize, j: usize, k: usize) -> f64 {
        self.positions[[i, j, k]]
    }

    /// Resample the physical block of `field` in place and refill its padding.
    ///
    /// The field ends in the space domain.
    pub fn apply(&self, field: &mut Field3D) -> Result<()> {
        let dims = field.dims();
        if dims.physical() != *self.positions.shape() {
            return Err(InversionError::ShapeMismatch {
                expected: self.positions.shape().to_vec(),
                got: dims.physical().to_vec(),
            });
        }
        field.ensure_space()?;
        let old = field.physical_values()?;
        let nz = dims.nz;
        {
            let mut out = field.access(AccessMode::Write)?;
            for ((i, j, k), &p) in self.positions.indexed_iter() {
                let p = p.clamp(0.0, (nz - 1) as f64);
                let l = (p.floor() as usize).min(nz - 1);
                let f = p - l as f64;
                let upper = old[[i, j, (l + 1).min(nz - 1)]];
                out.set_real(i, j, k, old[[i, j, l]] * (1.0 - f) + upper * f);
            }
        }
        field.repad()
    }

    /// Resample every field in `fields`.
    pub fn apply_all<'a, I>(&self, fields: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a mut Field3D>,
    {
        let mut n = 0;
        for field in fields {
            self.apply(field)?;
            n += 1;
        }
        debug!("resampled {} fields onto the new vertical axis", n);
        Ok(())
    }
}

fn check_same_shape(a: &Array3<f64>, b: &Array3<f64>) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(InversionError::ShapeMismatch {
            expected: a.shape().to_vec(),
            got: b.shape().to_vec(),
        });
    }
    Ok(())
}
