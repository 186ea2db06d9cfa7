// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use nalgebra::{DMatrix, DVector};

use crate::error::{InversionError, Result};
use crate::moments::Moments;

/// Linear observation `d = G m + e` with Gaussian noise.
#[derive(Debug, Clone)]
pub struct Observation {
    /// Observation operator, `D × L`.
    pub operator: DMatrix<f64>,
    /// Observed data, length `D`.
    pub data: DVector<f64>,
    /// Noise covariance, `D × D`.
    pub noise: DMatrix<f64>,
}

impl Observation {
    /// Bundle an observation after checking that the shapes agree.
    pub fn new(operator: DMatrix<f64>, data: DVector<f64>, noise: DMatrix<f64>) -> Result<Self> {
        let d = data.len();
        if operator.nrows() != d {
            return Err(InversionError::ShapeMismatch {
                expected: vec![d, operator.ncols()],
                got: vec![operator.nrows(), operator.ncols()],
            });
        }
        if noise.nrows() != d || noise.ncols() != d {
            return Err(InversionError::ShapeMismatch {
                expected: vec![d, d],
                got: vec![noise.nrows(), noise.ncols()],
            });
        }
        Ok(Observation {
            operator,
            data,
            noise,
        })
    }

    /// Number of observed samples.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if nothing was observed.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Posterior moments of the prior conditioned on `obs`.
///
/// # Errors
/// - [`InversionError::ShapeMismatch`] if the operator width differs from the prior length.
/// - [`InversionError::SingularSystem`] if `G Σ Gᵀ + Σd` is not positive definite.
pub fn condition(prior: &Moments, obs: &Observation) -> Result<Moments> {
    let l = prior.len();
    if obs.operator.ncols() != l {
        return Err(InversionError::ShapeMismatch {
            expected: vec![obs.len(), l],
            got: vec![obs.operator.nrows(), obs.operator.ncols()],
        });
    }
    if obs.is_empty() {
        return Ok(prior.clone());
    }

    let g = &obs.operator;
    let data_model_cov = g * &prior.cov;
    let innovation_cov = &data_model_cov * g.transpose() + &obs.noise;
    let chol = innovation_cov
        .cholesky()
        .ok_or(InversionError::SingularSystem { dim: obs.len() })?;

    let residual = &obs.data - g * &prior.mean;
    // (Σ Gᵀ C⁻¹)ᵀ = C⁻¹ G Σ
    let gain_t = chol.solve(&data_model_cov);
    let mean = &prior.mean + gain_t.tr_mul(&residual);
    let cov = &prior.cov - gain_t.tr_mul(&data_model_cov);

    Ok(Moments { mean, cov })
}
