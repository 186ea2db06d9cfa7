// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use num_complex::Complex64;

use crate::core::GridDims;
use crate::error::{InversionError, Result};
use crate::field::{AccessMode, Field3D, FieldAccess};
use crate::spectral::StationaryDistribution;

/// 3×3 Hermitian cross-spectral matrix of the joint fields at one cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointCovarianceCell(pub [[Complex64; 3]; 3]);

impl JointCovarianceCell {
    /// Assemble from the diagonal and the upper off-diagonal `[01, 02, 12]`.
    pub fn from_parts(variances: [Complex64; 3], cross: [Complex64; 3]) -> Self {
        let [c01, c02, c12] = cross;
        JointCovarianceCell([
            [variances[0], c01, c02],
            [c01.conj(), variances[1], c12],
            [c02.conj(), c12.conj(), variances[2]],
        ])
    }

    /// Diagonal entries.
    pub fn variances(&self) -> [Complex64; 3] {
        [self.0[0][0], self.0[1][1], self.0[2][2]]
    }

    /// Upper off-diagonal entries `[01, 02, 12]`.
    pub fn cross(&self) -> [Complex64; 3] {
        [self.0[0][1], self.0[0][2], self.0[1][2]]
    }

    /// Condition on `data = m[0] + e` with noise spectrum `noise`.
    pub fn condition(&mut self, mean: &mut [Complex64; 3], data: Complex64, noise: Complex64) {
        let s = self.0;
        let var_d = s[0][0] + noise;
        let scale = (data - mean[0]) / var_d;
        for a in 0..3 {
            mean[a] += s[a][0] * scale;
        }
        for a in 0..3 {
            for b in 0..3 {
                self.0[a][b] = s[a][b] - s[a][0] * s[0][b] / var_d;
            }
        }
    }
}

/// Scalar version of [`JointCovarianceCell::condition`].
pub fn condition_scalar(mean: &mut Complex64, var: &mut Complex64, data: Complex64, noise: Complex64) {
    let var_d = *var + noise;
    *mean += *var * (data - *mean) / var_d;
    *var -= *var * *var / var_d;
}

fn check_dims(expected: GridDims, fields: &[&Field3D]) -> Result<()> {
    for f in fields {
        if f.dims() != expected {
            return Err(InversionError::ShapeMismatch {
                expected: expected.padded_shape().to_vec(),
                got: f.dims().padded_shape().to_vec(),
            });
        }
    }
    Ok(())
}

fn check_filter(dims: GridDims, dist: &StationaryDistribution) -> Result<()> {
    check_dims(dims, &[&dist.observations, &dist.noise])?;
    if dist.filter.len() != dims.nzp {
        return Err(InversionError::ShapeMismatch {
            expected: vec![dims.nzp],
            got: vec![dist.filter.len()],
        });
    }
    Ok(())
}

fn open_all(fields: &mut [Field3D], mode: AccessMode) -> Result<Vec<FieldAccess<'_>>> {
    fields.iter_mut().map(|f| f.access(mode)).collect()
}

/// Mean and stationary covariance kernel of one field.
#[derive(Debug, Clone)]
pub struct SingleFieldModel {
    /// Mean field.
    pub mean: Field3D,
    /// Stationary covariance kernel.
    pub cov: Field3D,
}

impl SingleFieldModel {
    /// Pair a mean with its covariance kernel.
    pub fn new(mean: Field3D, cov: Field3D) -> Result<Self> {
        check_dims(mean.dims(), &[&cov])?;
        Ok(SingleFieldModel { mean, cov })
    }

    /// Grid dimensions.
    pub fn dims(&self) -> GridDims {
        self.mean.dims()
    }

    /// Transform both fields to the space domain.
    pub fn to_space(&mut self) -> Result<()> {
        self.mean.ensure_space()?;
        self.cov.ensure_space()
    }

    /// Spectral update from a stationary observation. Leaves both fields in
    /// the frequency domain.
    pub fn update(&mut self, dist: &mut StationaryDistribution) -> Result<()> {
        let dims = self.dims();
        check_filter(dims, dist)?;
        self.mean.ensure_frequency()?;
        self.cov.ensure_frequency()?;
        dist.observations.ensure_frequency()?;
        dist.noise.ensure_frequency()?;

        let data = dist.observations.access(AccessMode::Read)?;
        let noise = dist.noise.access(AccessMode::Read)?;
        let mut mean = self.mean.access(AccessMode::ReadWrite)?;
        let mut cov = self.cov.access(AccessMode::ReadWrite)?;
        for k in (0..dims.nzp).filter(|&k| dist.filter[k]) {
            for j in 0..dims.nyp {
                for i in 0..dims.nxp {
                    let mut m = mean.complex(i, j, k);
                    let mut v = cov.complex(i, j, k);
                    condition_scalar(&mut m, &mut v, data.complex(i, j, k), noise.complex(i, j, k));
                    mean.set_complex(i, j, k, m);
                    cov.set_complex(i, j, k, v);
                }
            }
        }
        Ok(())
    }
}

/// Means, variance kernels and cross-covariance kernels of three correlated
/// fields. The first field is the one observed.
#[derive(Debug, Clone)]
pub struct JointModel {
    /// Means of the three fields.
    pub means: [Field3D; 3],
    /// Covariance kernels of the three fields.
    pub variances: [Field3D; 3],
    /// Cross-covariance kernels in the order `[01, 02, 12]`.
    pub cross: [Field3D; 3],
}

impl JointModel {
    /// Bundle the nine fields after checking their dimensions agree.
    pub fn new(means: [Field3D; 3], variances: [Field3D; 3], cross: [Field3D; 3]) -> Result<Self> {
        let dims = means[0].dims();
        let all: Vec<&Field3D> = means.iter().chain(variances.iter()).chain(cross.iter()).collect();
        check_dims(dims, &all)?;
        Ok(JointModel {
            means,
            variances,
            cross,
        })
    }

    /// Grid dimensions.
    pub fn dims(&self) -> GridDims {
        self.means[0].dims()
    }

    /// All nine fields, means first.
    pub fn fields_mut(&mut self) -> impl Iterator<Item = &mut Field3D> {
        self.means
            .iter_mut()
            .chain(self.variances.iter_mut())
            .chain(self.cross.iter_mut())
    }

    /// Transform all fields to the space domain.
    pub fn to_space(&mut self) -> Result<()> {
        self.fields_mut().try_for_each(|f| f.ensure_space())
    }

    /// Transform all fields to the frequency domain.
    pub fn to_frequency(&mut self) -> Result<()> {
        self.fields_mut().try_for_each(|f| f.ensure_frequency())
    }

    /// Spectral joint update. Leaves all fields in the frequency domain.
    pub fn update(&mut self, dist: &mut StationaryDistribution) -> Result<()> {
        let dims = self.dims();
        check_filter(dims, dist)?;
        self.to_frequency()?;
        dist.observations.ensure_frequency()?;
        dist.noise.ensure_frequency()?;

        let data = dist.observations.access(AccessMode::Read)?;
        let noise = dist.noise.access(AccessMode::Read)?;
        let mut means = open_all(&mut self.means, AccessMode::ReadWrite)?;
        let mut vars = open_all(&mut self.variances, AccessMode::ReadWrite)?;
        let mut cross = open_all(&mut self.cross, AccessMode::ReadWrite)?;

        for k in (0..dims.nzp).filter(|&k| dist.filter[k]) {
            for j in 0..dims.nyp {
                for i in 0..dims.nxp {
                    let mut mean = [0, 1, 2].map(|a| means[a].complex(i, j, k));
                    let mut cell = JointCovarianceCell::from_parts(
                        [0, 1, 2].map(|a| vars[a].complex(i, j, k)),
                        [0, 1, 2].map(|a| cross[a].complex(i, j, k)),
                    );
                    cell.condition(&mut mean, data.complex(i, j, k), noise.complex(i, j, k));

                    let (v, c) = (cell.variances(), cell.cross());
                    for a in 0..3 {
                        means[a].set_complex(i, j, k, mean[a]);
                        vars[a].set_complex(i, j, k, v[a]);
                        cross[a].set_complex(i, j, k, c[a]);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::lateral_identity;
    use ndarray::Array3;

    fn c(re: f64) -> Complex64 {
        Complex64::new(re, 0.0)
    }

    #[test]
    fn scalar_update_matches_gaussian_formula() {
        let (mut m, mut v) = (c(1.0), c(2.0));
        condition_scalar(&mut m, &mut v, c(4.0), c(1.0));
        assert!((m - c(3.0)).norm() < 1e-15);
        assert!((v - c(2.0 / 3.0)).norm() < 1e-15);
    }

    #[test]
    fn joint_update_propagates_through_cross_covariance() {
        let mut cell = JointCovarianceCell::from_parts([c(2.0), c(1.0), c(1.0)], [c(1.0), c(0.0), c(0.5)]);
        let mut mean = [c(0.0), c(0.0), c(0.0)];
        cell.condition(&mut mean, c(3.0), c(1.0));
        // var_d = 3, scale = 1
        assert!((mean[0] - c(2.0)).norm() < 1e-15);
        assert!((mean[1] - c(1.0)).norm() < 1e-15);
        assert!(mean[2].norm() < 1e-15);
        assert!((cell.0[1][1] - c(1.0 - 1.0 / 3.0)).norm() < 1e-15);
        assert!((cell.0[0][1] - c(1.0 - 2.0 / 3.0)).norm() < 1e-15);
        assert!((cell.0[2][2] - c(1.0)).norm() < 1e-15);
    }

    #[test]
    fn joint_matches_scalar_on_first_field() {
        let mut cell = JointCovarianceCell::from_parts([c(2.5), c(1.0), c(3.0)], [c(0.7), c(-0.4), c(0.2)]);
        let mut mean = [c(1.0), c(2.0), c(3.0)];
        let (mut m, mut v) = (c(1.0), c(2.5));
        cell.condition(&mut mean, c(1.8), c(0.3));
        condition_scalar(&mut m, &mut v, c(1.8), c(0.3));
        assert!((mean[0] - m).norm() < 1e-14);
        assert!((cell.0[0][0] - v).norm() < 1e-14);
    }

    fn field(dims: GridDims, value: f64) -> Field3D {
        Field3D::constant(dims, value)
    }

    fn distribution(dims: GridDims, filter: Vec<bool>) -> StationaryDistribution {
        let mut observations = field(dims, 5.0);
        observations.fft_in_place().unwrap();
        let lateral = lateral_identity(dims.nxp, dims.nyp);
        let mut noise = Field3D::stationary_covariance(dims, &lateral, &vec![0.5; dims.nzp]).unwrap();
        noise.fft_in_place().unwrap();
        StationaryDistribution {
            observations,
            noise,
            filter,
        }
    }

    fn joint(dims: GridDims) -> JointModel {
        let lateral = lateral_identity(dims.nxp, dims.nyp);
        let kernel = |v: f64| {
            let mut profile = vec![0.0; dims.nzp];
            profile[0] = v;
            Field3D::stationary_covariance(dims, &lateral, &profile).unwrap()
        };
        JointModel::new(
            [field(dims, 1.0), field(dims, 2.0), field(dims, 3.0)],
            [kernel(1.0), kernel(1.0), kernel(1.0)],
            [kernel(0.5), kernel(0.2), kernel(0.1)],
        )
        .unwrap()
    }

    #[test]
    fn closed_filter_leaves_model_unchanged() {
        let dims = GridDims::new([3, 2, 4], [4, 2, 6]).unwrap();
        let mut model = joint(dims);
        let before: Vec<Array3<f64>> = model
            .fields_mut()
            .map(|f| f.padded_values().unwrap())
            .collect();
        let mut dist = distribution(dims, vec![false; dims.nzp]);
        model.update(&mut dist).unwrap();
        model.to_space().unwrap();
        for (f, b) in model.fields_mut().zip(before.iter()) {
            let after = f.padded_values().unwrap();
            for (x, y) in after.iter().zip(b.iter()) {
                assert!((x - y).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn open_filter_moves_mean_towards_data() {
        let dims = GridDims::new([2, 2, 3], [2, 2, 4]).unwrap();
        let mut model = joint(dims);
        let mut dist = distribution(dims, vec![true; dims.nzp]);
        model.update(&mut dist).unwrap();
        model.to_space().unwrap();
        let m0 = model.means[0].padded_values().unwrap();
        let m1 = model.means[1].padded_values().unwrap();
        // only the zero frequency carries a mean offset: 1 + 1/(1 + 0.5) * (5 - 1)
        let expected = 1.0 + 4.0 / 1.5;
        assert!(m0.iter().all(|v| (v - expected).abs() < 1e-10));
        assert!(m1.iter().all(|v| (v - (2.0 + 0.5 * 4.0 / 1.5)).abs() < 1e-10));
    }

    #[test]
    fn single_field_update_matches_joint_first_field() {
        let dims = GridDims::new([2, 2, 3], [2, 2, 4]).unwrap();
        let mut model = joint(dims);
        let mut single = SingleFieldModel::new(
            model.means[0].clone(),
            model.variances[0].clone(),
        )
        .unwrap();
        let filter = vec![true, false, true, false];
        let mut d1 = distribution(dims, filter.clone());
        let mut d2 = distribution(dims, filter);
        model.update(&mut d1).unwrap();
        single.update(&mut d2).unwrap();
        model.to_space().unwrap();
        single.to_space().unwrap();
        let a = model.means[0].padded_values().unwrap();
        let b = single.mean.padded_values().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn mismatched_dims_rejected() {
        let dims = GridDims::new([2, 2, 3], [2, 2, 4]).unwrap();
        let other = GridDims::new([2, 2, 3], [2, 2, 5]).unwrap();
        assert!(SingleFieldModel::new(field(dims, 0.0), field(other, 0.0)).is_err());
    }
}
