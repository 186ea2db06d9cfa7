// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use ndarray::{Array2, Array3, Axis};
use num_complex::Complex64;
use rustfft::FftPlanner;

use crate::core::GridDims;
use crate::error::{InversionError, Result};
use crate::prior::Variogram;

/// Access mode held by a [`Field3D`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// No stage holds the field.
    Idle,
    /// Reads only.
    Read,
    /// Writes only.
    Write,
    /// Reads and writes of the same cells.
    ReadWrite,
    /// Reads and writes in arbitrary order.
    Random,
}

impl AccessMode {
    fn can_read(self) -> bool {
        matches!(
            self,
            AccessMode::Read | AccessMode::ReadWrite | AccessMode::Random
        )
    }

    fn can_write(self) -> bool {
        matches!(
            self,
            AccessMode::Write | AccessMode::ReadWrite | AccessMode::Random
        )
    }
}

/// Transform domain of a field's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// Real values indexed by (x, y, layer).
    Space,
    /// Complex coefficients indexed by (kx, ky, kz).
    Frequency,
}

/// A padded 3D grid of real or spectral values.
#[derive(Debug, Clone)]
pub struct Field3D {
    dims: GridDims,
    data: Array3<Complex64>,
    domain: Domain,
    mode: AccessMode,
}

impl Field3D {
    /// Create a zero-filled space-domain field.
    pub fn zeros(dims: GridDims) -> Self {
        Field3D {
            dims,
            data: Array3::zeros((dims.nxp, dims.nyp, dims.nzp)),
            domain: Domain::Space,
            mode: AccessMode::Idle,
        }
    }

    /// Create a zero-filled frequency-domain field.
    pub fn zeros_frequency(dims: GridDims) -> Self {
        Field3D {
            domain: Domain::Frequency,
            ..Self::zeros(dims)
        }
    }

    /// Create a field with the same value in every cell, padding included.
    pub fn constant(dims: GridDims, value: f64) -> Self {
        Field3D {
            dims,
            data: Array3::from_elem((dims.nxp, dims.nyp, dims.nzp), Complex64::new(value, 0.0)),
            domain: Domain::Space,
            mode: AccessMode::Idle,
        }
    }

    /// Wrap a real array that already covers the padded extent.
    ///
    /// # Errors
    /// Returns an error if the array shape differs from the padded shape.
    pub fn from_padded(dims: GridDims, values: Array3<f64>) -> Result<Self> {
        check_shape(values.shape(), &dims.padded_shape())?;
        Ok(Field3D {
            dims,
            data: values.mapv(|v| Complex64::new(v, 0.0)),
            domain: Domain::Space,
            mode: AccessMode::Idle,
        })
    }

    /// Build a field from its physical block and fill the padding smoothly.
    ///
    /// # Errors
    /// Returns an error if the array shape differs from the physical shape.
    pub fn from_physical(dims: GridDims, values: &Array3<f64>) -> Result<Self> {
        check_shape(values.shape(), &dims.physical())?;
        let mut padded = Array3::zeros((dims.nxp, dims.nyp, dims.nzp));
        for ((i, j, k), &v) in values.indexed_iter() {
            padded[[i, j, k]] = v;
        }
        pad_smooth(&mut padded, &dims);
        Self::from_padded(dims, padded)
    }

    /// Fill a stationary covariance kernel as `lateral(i, j) * profile[k]`.
    ///
    /// `lateral` is an `nxp × nyp` lateral correlation and `profile` the
    /// vertical circulant covariance of length `nzp`.
    pub fn stationary_covariance(
        dims: GridDims,
        lateral: &Array2<f64>,
        profile: &[f64],
    ) -> Result<Self> {
        check_shape(lateral.shape(), &[dims.nxp, dims.nyp])?;
        check_shape(&[profile.len()], &[dims.nzp])?;
        let data = Array3::from_shape_fn((dims.nxp, dims.nyp, dims.nzp), |(i, j, k)| {
            Complex64::new(lateral[[i, j]] * profile[k], 0.0)
        });
        Ok(Field3D {
            dims,
            data,
            domain: Domain::Space,
            mode: AccessMode::Idle,
        })
    }

    /// Grid dimensions.
    pub fn dims(&self) -> GridDims {
        self.dims
    }

    /// Current transform domain.
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Access mode currently held.
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Enter an access mode and return a guard exposing element accessors.
    ///
    /// # Errors
    /// Returns an error if the field is already held in another mode or if
    /// `Idle` is requested.
    pub fn access(&mut self, mode: AccessMode) -> Result<FieldAccess<'_>> {
        if self.mode != AccessMode::Idle || mode == AccessMode::Idle {
            return Err(InversionError::AccessConflict {
                current: self.mode,
                requested: mode,
            });
        }
        self.mode = mode;
        Ok(FieldAccess { field: self, mode })
    }

    fn require_idle(&self) -> Result<()> {
        if self.mode != AccessMode::Idle {
            return Err(InversionError::AccessConflict {
                current: self.mode,
                requested: AccessMode::Idle,
            });
        }
        Ok(())
    }

    fn require_domain(&self, expected: Domain) -> Result<()> {
        if self.domain != expected {
            return Err(InversionError::WrongDomain { expected });
        }
        Ok(())
    }

    /// Forward 3D transform of the whole padded buffer.
    ///
    /// # Errors
    /// Returns an error if the field is held or already in the frequency domain.
    pub fn fft_in_place(&mut self) -> Result<()> {
        self.require_idle()?;
        self.require_domain(Domain::Space)?;
        transform_3d(&mut self.data, false);
        self.domain = Domain::Frequency;
        Ok(())
    }

    /// Inverse 3D transform, normalised by the number of cells.
    ///
    /// Imaginary round-off is discarded so the field is purely real afterwards.
    pub fn inv_fft_in_place(&mut self) -> Result<()> {
        self.require_idle()?;
        self.require_domain(Domain::Frequency)?;
        transform_3d(&mut self.data, true);
        self.data.mapv_inplace(|v| Complex64::new(v.re, 0.0));
        self.domain = Domain::Space;
        Ok(())
    }

    /// Transform to the frequency domain unless already there.
    pub fn ensure_frequency(&mut self) -> Result<()> {
        if self.domain == Domain::Space {
            self.fft_in_place()?;
        }
        Ok(())
    }

    /// Transform to the space domain unless already there.
    pub fn ensure_space(&mut self) -> Result<()> {
        if self.domain == Domain::Frequency {
            self.inv_fft_in_place()?;
        }
        Ok(())
    }

    /// Refill the padding from the current physical block.
    pub fn repad(&mut self) -> Result<()> {
        self.require_idle()?;
        self.require_domain(Domain::Space)?;
        let mut real = self.data.mapv(|v| v.re);
        pad_smooth(&mut real, &self.dims);
        self.data = real.mapv(|v| Complex64::new(v, 0.0));
        Ok(())
    }

    /// Copy out the physical block as real values.
    pub fn physical_values(&self) -> Result<Array3<f64>> {
        self.require_idle()?;
        self.require_domain(Domain::Space)?;
        let d = self.dims;
        Ok(Array3::from_shape_fn((d.nx, d.ny, d.nz), |(i, j, k)| {
            self.data[[i, j, k]].re
        }))
    }

    /// Copy out the whole padded buffer as real values.
    pub fn padded_values(&self) -> Result<Array3<f64>> {
        self.require_idle()?;
        self.require_domain(Domain::Space)?;
        Ok(self.data.mapv(|v| v.re))
    }
}

/// Guard over a [`Field3D`] held in a specific access mode.
///
/// Accessors not permitted by the mode panic: misuse is a programming error.
pub struct FieldAccess<'a> {
    field: &'a mut Field3D,
    mode: AccessMode,
}

impl FieldAccess<'_> {
    /// The mode this guard holds.
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Grid dimensions of the underlying field.
    pub fn dims(&self) -> GridDims {
        self.field.dims
    }

    fn check_read(&self) {
        assert!(
            self.mode.can_read(),
            "read access to a field held in {:?} mode",
            self.mode
        );
    }

    fn check_write(&self) {
        assert!(
            self.mode.can_write(),
            "write access to a field held in {:?} mode",
            self.mode
        );
    }

    fn check_space(&self) {
        assert!(
            self.field.domain == Domain::Space,
            "real-valued access to a frequency-domain field"
        );
    }

    /// Real value at `(i, j, k)` in the padded grid.
    pub fn real(&self, i: usize, j: usize, k: usize) -> f64 {
        self.check_read();
        self.check_space();
        self.field.data[[i, j, k]].re
    }

    /// Set the real value at `(i, j, k)`.
    pub fn set_real(&mut self, i: usize, j: usize, k: usize, value: f64) {
        self.check_write();
        self.check_space();
        self.field.data[[i, j, k]] = Complex64::new(value, 0.0);
    }

    /// Complex value at `(i, j, k)`; space-domain fields read back with zero imaginary part.
    pub fn complex(&self, i: usize, j: usize, k: usize) -> Complex64 {
        self.check_read();
        self.field.data[[i, j, k]]
    }

    /// Set the complex value at `(i, j, k)`.
    pub fn set_complex(&mut self, i: usize, j: usize, k: usize, value: Complex64) {
        self.check_write();
        self.field.data[[i, j, k]] = value;
    }

    /// Full padded vertical profile at lateral cell `(i, j)`.
    pub fn vertical_profile(&self, i: usize, j: usize) -> Vec<f64> {
        self.check_read();
        self.check_space();
        (0..self.field.dims.nzp)
            .map(|k| self.field.data[[i, j, k]].re)
            .collect()
    }

    /// Overwrite the padded vertical profile at lateral cell `(i, j)`.
    pub fn set_vertical_profile(&mut self, i: usize, j: usize, profile: &[f64]) {
        self.check_write();
        self.check_space();
        for (k, &v) in profile.iter().enumerate().take(self.field.dims.nzp) {
            self.field.data[[i, j, k]] = Complex64::new(v, 0.0);
        }
    }
}

impl Drop for FieldAccess<'_> {
    fn drop(&mut self) {
        self.field.mode = AccessMode::Idle;
    }
}

fn check_shape(got: &[usize], expected: &[usize]) -> Result<()> {
    if got != expected {
        return Err(InversionError::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
        });
    }
    Ok(())
}

/// Fill the padded region by blending linearly from the last physical value
/// back to the first, one axis at a time, so the field is smooth and periodic.
pub fn pad_smooth(values: &mut Array3<f64>, dims: &GridDims) {
    let GridDims {
        nx,
        ny,
        nz,
        nxp,
        nyp,
        nzp,
    } = *dims;

    for i in 0..nx {
        for j in 0..ny {
            let (first, last) = (values[[i, j, 0]], values[[i, j, nz - 1]]);
            for k in nz..nzp {
                values[[i, j, k]] = blend(last, first, k + 1 - nz, nzp + 1 - nz);
            }
        }
    }
    for i in 0..nx {
        for k in 0..nzp {
            let (first, last) = (values[[i, 0, k]], values[[i, ny - 1, k]]);
            for j in ny..nyp {
                values[[i, j, k]] = blend(last, first, j + 1 - ny, nyp + 1 - ny);
            }
        }
    }
    for j in 0..nyp {
        for k in 0..nzp {
            let (first, last) = (values[[0, j, k]], values[[nx - 1, j, k]]);
            for i in nx..nxp {
                values[[i, j, k]] = blend(last, first, i + 1 - nx, nxp + 1 - nx);
            }
        }
    }
}

#[inline]
fn blend(last: f64, first: f64, step: usize, steps: usize) -> f64 {
    last + (first - last) * step as f64 / steps as f64
}

fn transform_3d(data: &mut Array3<Complex64>, inverse: bool) {
    let mut planner = FftPlanner::<f64>::new();
    for axis in 0..3 {
        let n = data.len_of(Axis(axis));
        if n <= 1 {
            continue;
        }
        let fft = if inverse {
            planner.plan_fft_inverse(n)
        } else {
            planner.plan_fft_forward(n)
        };
        let mut buffer = vec![Complex64::new(0.0, 0.0); n];
        let mut scratch = vec![Complex64::new(0.0, 0.0); fft.get_inplace_scratch_len()];
        for mut lane in data.lanes_mut(Axis(axis)) {
            for (b, v) in buffer.iter_mut().zip(lane.iter()) {
                *b = *v;
            }
            fft.process_with_scratch(&mut buffer, &mut scratch);
            for (v, b) in lane.iter_mut().zip(buffer.iter()) {
                *v = *b;
            }
        }
    }
    if inverse {
        let scale = 1.0 / data.len() as f64;
        data.mapv_inplace(|v| v * scale);
    }
}

/// Lateral correlation over the padded lateral grid, using circulant
/// (wrap-around) distances so the kernel is periodic.
pub fn lateral_correlation<V: Variogram>(
    nxp: usize,
    nyp: usize,
    spacing: (f64, f64),
    variogram: &V,
) -> Array2<f64> {
    Array2::from_shape_fn((nxp, nyp), |(i, j)| {
        let di = i.min(nxp - i) as f64 * spacing.0;
        let dj = j.min(nyp - j) as f64 * spacing.1;
        variogram.corr((di * di + dj * dj).sqrt())
    })
}

/// Lateral correlation that couples nothing: one at the origin, zero elsewhere.
pub fn lateral_identity(nxp: usize, nyp: usize) -> Array2<f64> {
    let mut corr = Array2::zeros((nxp, nyp));
    corr[[0, 0]] = 1.0;
    corr
}
