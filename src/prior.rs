// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use nalgebra::{DMatrix, DVector};

use crate::core::closest_factorable_number;
use crate::error::{InversionError, Result};
use crate::moments::{linear_to_log, Moments};

/// Correlation as a function of separation.
pub trait Variogram: Sync {
    /// Correlation at separation `h`, equal to one at `h = 0`.
    fn corr(&self, h: f64) -> f64;
}

/// Generalised exponential model `exp(-3 (h / range)^power)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialVariogram {
    power: f64,
    range: f64,
}

impl ExponentialVariogram {
    /// Create a model with the given power and effective range.
    pub fn new(power: f64, range: f64) -> Self {
        ExponentialVariogram { power, range }
    }

    /// Plain exponential model (`power = 1`).
    pub fn exponential(range: f64) -> Self {
        Self::new(1.0, range)
    }

    /// Effective range.
    pub fn range(&self) -> f64 {
        self.range
    }
}

impl Variogram for ExponentialVariogram {
    fn corr(&self, h: f64) -> f64 {
        if self.range <= 0.0 {
            return if h == 0.0 { 1.0 } else { 0.0 };
        }
        (-3.0 * (h.abs() / self.range).powf(self.power)).exp()
    }
}

/// Circulant correlation profile of length `n` sampled every `dt`.
///
/// `corr[0] = 1` and `corr[i] = corr[n - i] = ρ(i·dt)` for `1 ≤ i < n/2`;
/// the remaining lags (the middle one for even `n`) stay zero.
pub fn circulant_correlation<V: Variogram + ?Sized>(n: usize, dt: f64, variogram: &V) -> Vec<f64> {
    let mut corr = vec![0.0; n];
    if n == 0 {
        return corr;
    }
    corr[0] = 1.0;
    for i in 1..n / 2 {
        corr[i] = variogram.corr(i as f64 * dt);
        corr[n - i] = corr[i];
    }
    corr
}

/// Symmetric Toeplitz matrix `Σ(j, k) = profile[|k − j|]`.
pub fn toeplitz(profile: &[f64]) -> DMatrix<f64> {
    let n = profile.len();
    DMatrix::from_fn(n, n, |j, k| profile[j.abs_diff(k)])
}

/// Velocity covariance over `n` layers: `variance · toeplitz(circulant correlation)`.
pub fn velocity_covariance<V: Variogram + ?Sized>(
    dt: f64,
    n: usize,
    variance: f64,
    variogram: &V,
) -> DMatrix<f64> {
    toeplitz(&circulant_correlation(n, dt, variogram)) * variance
}

/// `n + 1` equally spaced values from `top` to `base` inclusive.
pub fn linear_trend(top: f64, base: f64, n: usize) -> Vec<f64> {
    if n == 0 {
        return vec![top];
    }
    (0..=n)
        .map(|j| top + j as f64 * (base - top) / n as f64)
        .collect()
}

/// Mean velocity of the interval below the model.
///
/// The trend runs from `top` (exclusive) to `base` (inclusive) over `n`
/// layers; the padding up to `n_pad` repeats the base value.
pub fn below_trend(top: f64, base: f64, n: usize, n_pad: usize) -> Vec<f64> {
    let trend = linear_trend(top, base, n);
    let last = *trend.last().unwrap_or(&top);
    let mut out = vec![last; n_pad.max(n)];
    for (i, v) in trend.iter().skip(1).take(n).enumerate() {
        out[i] = *v;
    }
    out
}

/// Padded length of an interval outside the model: room for `n` layers plus
/// one correlation range so the circulant wrap-around stays uncorrelated.
pub fn interval_padding(n: usize, range: f64, dt: f64) -> usize {
    let extra = if dt > 0.0 {
        (range / dt).ceil().max(0.0) as usize
    } else {
        0
    };
    closest_factorable_number(n + extra)
}

/// Stack independent blocks into one profile with a block-diagonal covariance.
pub fn block_diagonal(blocks: &[&Moments]) -> Moments {
    let n: usize = blocks.iter().map(|b| b.len()).sum();
    let mut mean = DVector::zeros(n);
    let mut cov = DMatrix::zeros(n, n);
    let mut offset = 0;
    for block in blocks {
        let m = block.len();
        mean.rows_mut(offset, m).copy_from(&block.mean);
        cov.view_mut((offset, offset), (m, m)).copy_from(&block.cov);
        offset += m;
    }
    Moments { mean, cov }
}

/// Parameters of a velocity interval outside the model (above or below).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalPrior {
    /// Number of physical layers.
    pub nz: usize,
    /// Velocity variance.
    pub variance: f64,
    /// Vertical correlation range in ms.
    pub range: f64,
}

impl IntervalPrior {
    /// Validate the parameters.
    pub fn new(nz: usize, variance: f64, range: f64) -> Result<Self> {
        if nz == 0 {
            return Err(InversionError::InvalidGridShape { axis: 2, size: nz });
        }
        if !variance.is_finite() || variance < 0.0 {
            return Err(InversionError::InvalidConfig(format!(
                "interval velocity variance must be non-negative, got {}",
                variance
            )));
        }
        if !range.is_finite() || range < 0.0 {
            return Err(InversionError::InvalidConfig(format!(
                "interval correlation range must be non-negative, got {}",
                range
            )));
        }
        Ok(IntervalPrior {
            nz,
            variance,
            range,
        })
    }

    /// Padded layer count when the thinnest layer is `dt_min` thick.
    pub fn padded(&self, dt_min: f64) -> usize {
        interval_padding(self.nz, self.range, dt_min)
    }

    /// Velocity covariance over `n_pad` layers of thickness `dt`.
    pub fn velocity_covariance(&self, dt: f64, n_pad: usize) -> DMatrix<f64> {
        let vario = ExponentialVariogram::exponential(self.range);
        velocity_covariance(dt, n_pad, self.variance, &vario)
    }
}

/// Log-velocity prior of the interval below the model, built from a linear
/// velocity trend starting at `top_velocity` and the interval's velocity
/// covariance.
pub fn below_log_prior(
    top_velocity: f64,
    base_velocity: f64,
    interval: &IntervalPrior,
    velocity_cov: &DMatrix<f64>,
) -> Result<Moments> {
    let n_pad = velocity_cov.nrows();
    let mean = below_trend(top_velocity, base_velocity, interval.nz, n_pad);
    let linear = Moments::new(DVector::from_vec(mean), velocity_cov.clone())?;
    linear_to_log(&linear)
}
