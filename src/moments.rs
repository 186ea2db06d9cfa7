// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use nalgebra::{DMatrix, DVector};

use crate::error::{InversionError, Result};

/// Mean vector and covariance matrix of a Gaussian or log-normal profile.
#[derive(Debug, Clone, PartialEq)]
pub struct Moments {
    /// Mean vector of length `n`.
    pub mean: DVector<f64>,
    /// Covariance matrix of size `n × n`.
    pub cov: DMatrix<f64>,
}

impl Moments {
    /// Bundle a mean and covariance.
    ///
    /// # Errors
    /// Returns an error if the covariance is not square with the mean's length.
    pub fn new(mean: DVector<f64>, cov: DMatrix<f64>) -> Result<Self> {
        let n = mean.len();
        if cov.nrows() != n || cov.ncols() != n {
            return Err(InversionError::ShapeMismatch {
                expected: vec![n, n],
                got: vec![cov.nrows(), cov.ncols()],
            });
        }
        Ok(Moments { mean, cov })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.mean.len()
    }

    /// True if the profile has no entries.
    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }

    /// Mean scaled by `factor`, covariance by `factor²`.
    pub fn scaled(&self, factor: f64) -> Moments {
        Moments {
            mean: &self.mean * factor,
            cov: &self.cov * (factor * factor),
        }
    }

    /// Marginal moments of the entries `start..start + len`.
    pub fn block(&self, start: usize, len: usize) -> Moments {
        Moments {
            mean: self.mean.rows(start, len).into_owned(),
            cov: self.cov.view((start, start), (len, len)).into_owned(),
        }
    }
}

/// Log-normal moments of `exp(x)` for `x ~ N(μ, Σ)`.
pub fn log_to_linear(log: &Moments) -> Moments {
    let n = log.len();
    let mean = DVector::from_fn(n, |i, _| (log.mean[i] + 0.5 * log.cov[(i, i)]).exp());
    let cov = DMatrix::from_fn(n, n, |i, j| mean[i] * mean[j] * (log.cov[(i, j)].exp() - 1.0));
    Moments { mean, cov }
}

/// Gaussian log-domain moments of a log-normal profile.
///
/// # Errors
/// Returns [`InversionError::NonPositiveMean`] if any mean is not strictly
/// positive. Callers floor their means before calling.
pub fn linear_to_log(linear: &Moments) -> Result<Moments> {
    if let Some((index, &value)) = linear
        .mean
        .iter()
        .enumerate()
        .find(|(_, &v)| !(v > 0.0))
    {
        return Err(InversionError::NonPositiveMean { index, value });
    }
    let n = linear.len();
    let m = &linear.mean;
    let cov = DMatrix::from_fn(n, n, |i, j| {
        (1.0 + linear.cov[(i, j)] / (m[i] * m[j])).ln()
    });
    let mean = DVector::from_fn(n, |i, _| m[i].ln() - 0.5 * cov[(i, i)]);
    Ok(Moments { mean, cov })
}

/// Moments of `exp(power · x)` for `x ~ N(μ, Σ)`.
pub fn log_to_power(log: &Moments, power: f64) -> Moments {
    log_to_linear(&log.scaled(power))
}

/// Inverse of [`log_to_power`].
pub fn power_to_log(transformed: &Moments, power: f64) -> Result<Moments> {
    Ok(linear_to_log(transformed)?.scaled(1.0 / power))
}

/// Moments of `Vp²` from log-Vp moments.
pub fn log_to_square(log: &Moments) -> Moments {
    log_to_power(log, 2.0)
}

/// Log-Vp moments from moments of `Vp²`.
pub fn square_to_log(square: &Moments) -> Result<Moments> {
    power_to_log(square, 2.0)
}

/// Moments of `Vp⁻¹` from log-Vp moments.
pub fn log_to_inverse(log: &Moments) -> Moments {
    log_to_power(log, -1.0)
}

/// Log-Vp moments from moments of `Vp⁻¹`.
pub fn inverse_to_log(inverse: &Moments) -> Result<Moments> {
    power_to_log(inverse, -1.0)
}

/// Mean of `exp(power · x)` for a scalar `x ~ N(mean, variance)`.
///
/// Equals the diagonal of [`log_to_power`] without forming a covariance.
pub fn power_mean(mean: f64, variance: f64, power: f64) -> f64 {
    (power * mean + 0.5 * power * power * variance).exp()
}

/// Replace means at or below zero with `floor`.
pub fn floor_positive(mean: &mut DVector<f64>, floor: f64) -> usize {
    let mut replaced = 0;
    for v in mean.iter_mut() {
        if !(*v > 0.0) {
            *v = floor;
            replaced += 1;
        }
    }
    replaced
}
