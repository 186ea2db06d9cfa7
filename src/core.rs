// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use ndarray::Array2;

use crate::error::{InversionError, Result};

/// Sentinel marking a missing sample in surfaces, horizons and traces.
pub const MISSING: f64 = -99999.0;

/// Returns true if `value` is the missing-data sentinel.
#[inline]
pub fn is_missing(value: f64) -> bool {
    value == MISSING
}

/// Smallest `m >= n` whose prime factors are 2, 3, 5, 7 and at most one of 11 or 13.
///
/// Padded grid sizes are rounded up to such numbers so that every axis
/// transforms efficiently.
pub fn closest_factorable_number(n: usize) -> usize {
    let mut m = n.max(1);
    loop {
        if is_factorable(m) {
            return m;
        }
        m += 1;
    }
}

fn is_factorable(mut m: usize) -> bool {
    for p in [2usize, 3, 5, 7] {
        while m % p == 0 {
            m /= p;
        }
    }
    m == 1 || m == 11 || m == 13
}

/// Physical and padded dimensions of a 3D grid.
///
/// Axes are (lateral-x, lateral-y, vertical). The physical block
/// `nx × ny × nz` sits at the origin of the padded block `nxp × nyp × nzp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridDims {
    /// Physical cells along x.
    pub nx: usize,
    /// Physical cells along y.
    pub ny: usize,
    /// Physical layers.
    pub nz: usize,
    /// Padded cells along x.
    pub nxp: usize,
    /// Padded cells along y.
    pub nyp: usize,
    /// Padded layers.
    pub nzp: usize,
}

impl GridDims {
    /// Create dimensions with explicit padding.
    ///
    /// # Errors
    /// Returns an error if any physical size is zero or exceeds its padded size.
    pub fn new(physical: [usize; 3], padded: [usize; 3]) -> Result<Self> {
        for axis in 0..3 {
            if physical[axis] == 0 {
                return Err(InversionError::InvalidGridShape {
                    axis,
                    size: physical[axis],
                });
            }
            if padded[axis] < physical[axis] {
                return Err(InversionError::ShapeMismatch {
                    expected: physical.to_vec(),
                    got: padded.to_vec(),
                });
            }
        }
        Ok(GridDims {
            nx: physical[0],
            ny: physical[1],
            nz: physical[2],
            nxp: padded[0],
            nyp: padded[1],
            nzp: padded[2],
        })
    }

    /// Create dimensions with no padding at all.
    pub fn unpadded(physical: [usize; 3]) -> Result<Self> {
        Self::new(physical, physical)
    }

    /// Create dimensions padded to factorable sizes after adding `extra` cells per axis.
    pub fn padded(physical: [usize; 3], extra: [usize; 3]) -> Result<Self> {
        let mut padded = [0usize; 3];
        for axis in 0..3 {
            padded[axis] = closest_factorable_number(physical[axis] + extra[axis]);
        }
        Self::new(physical, padded)
    }

    /// Physical shape.
    pub fn physical(&self) -> [usize; 3] {
        [self.nx, self.ny, self.nz]
    }

    /// Padded shape.
    pub fn padded_shape(&self) -> [usize; 3] {
        [self.nxp, self.nyp, self.nzp]
    }

    /// Number of non-redundant vertical frequency bins, `nzp / 2 + 1`.
    pub fn cnzp(&self) -> usize {
        self.nzp / 2 + 1
    }

    /// Number of lateral cells in the physical block.
    pub fn lateral_cells(&self) -> usize {
        self.nx * self.ny
    }
}

/// Simulation box: a lateral grid bounded by a top and a base surface in time.
///
/// Each lateral column is divided into `nz` equal layers, so the layer
/// thickness `dz(i, j)` varies laterally. Surfaces are sampled at the
/// lateral cell centres. A `Simbox` is never mutated after construction;
/// regridding builds a new one with [`Simbox::with_base`].
#[derive(Debug, Clone, PartialEq)]
pub struct Simbox {
    nz: usize,
    x0: f64,
    y0: f64,
    dx: f64,
    dy: f64,
    top: Array2<f64>,
    base: Array2<f64>,
}

impl Simbox {
    /// Create a simbox from explicit surfaces.
    ///
    /// # Errors
    /// Returns an error if the surfaces differ in shape, if the spacing is not
    /// positive, or if the base is not strictly below the top everywhere.
    pub fn new(
        origin: (f64, f64),
        spacing: (f64, f64),
        top: Array2<f64>,
        base: Array2<f64>,
        nz: usize,
    ) -> Result<Self> {
        if top.shape() != base.shape() {
            return Err(InversionError::ShapeMismatch {
                expected: top.shape().to_vec(),
                got: base.shape().to_vec(),
            });
        }
        for (axis, &size) in top.shape().iter().enumerate() {
            if size == 0 {
                return Err(InversionError::InvalidGridShape { axis, size });
            }
        }
        if nz == 0 {
            return Err(InversionError::InvalidGridShape { axis: 2, size: nz });
        }
        for h in [spacing.0, spacing.1] {
            if !h.is_finite() || h <= 0.0 {
                return Err(InversionError::InvalidGridSpacing(h));
            }
        }
        for (t, b) in top.iter().zip(base.iter()) {
            let thickness = b - t;
            if !thickness.is_finite() || thickness <= 0.0 {
                return Err(InversionError::InvalidGridSpacing(thickness));
            }
        }
        Ok(Simbox {
            nz,
            x0: origin.0,
            y0: origin.1,
            dx: spacing.0,
            dy: spacing.1,
            top,
            base,
        })
    }

    /// Create a simbox with flat top and constant thickness.
    pub fn constant(
        lateral: [usize; 2],
        nz: usize,
        spacing: (f64, f64),
        top: f64,
        thickness: f64,
    ) -> Result<Self> {
        let top_surface = Array2::from_elem((lateral[0], lateral[1]), top);
        let base_surface = Array2::from_elem((lateral[0], lateral[1]), top + thickness);
        Self::new((0.0, 0.0), spacing, top_surface, base_surface, nz)
    }

    /// Cells along x.
    pub fn nx(&self) -> usize {
        self.top.nrows()
    }

    /// Cells along y.
    pub fn ny(&self) -> usize {
        self.top.ncols()
    }

    /// Number of layers.
    pub fn nz(&self) -> usize {
        self.nz
    }

    /// Lateral spacing along x.
    pub fn dx(&self) -> f64 {
        self.dx
    }

    /// Lateral spacing along y.
    pub fn dy(&self) -> f64 {
        self.dy
    }

    /// Top of the column at lateral cell `(i, j)`.
    pub fn top(&self, i: usize, j: usize) -> f64 {
        self.top[[i, j]]
    }

    /// Base of the column at lateral cell `(i, j)`.
    pub fn base(&self, i: usize, j: usize) -> f64 {
        self.base[[i, j]]
    }

    /// Layer thickness at lateral cell `(i, j)`.
    pub fn dz(&self, i: usize, j: usize) -> f64 {
        (self.base[[i, j]] - self.top[[i, j]]) / self.nz as f64
    }

    /// Top surface.
    pub fn top_surface(&self) -> &Array2<f64> {
        &self.top
    }

    /// Base surface.
    pub fn base_surface(&self) -> &Array2<f64> {
        &self.base
    }

    /// Coordinates of the centre of lateral cell `(i, j)`.
    pub fn xy_coord(&self, i: usize, j: usize) -> (f64, f64) {
        (
            self.x0 + (i as f64 + 0.5) * self.dx,
            self.y0 + (j as f64 + 0.5) * self.dy,
        )
    }

    /// Lateral cell containing `(x, y)`, or `None` outside the box.
    pub fn indexes(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let fi = (x - self.x0) / self.dx;
        let fj = (y - self.y0) / self.dy;
        if fi < 0.0 || fj < 0.0 {
            return None;
        }
        let (i, j) = (fi.floor() as usize, fj.floor() as usize);
        if i < self.nx() && j < self.ny() {
            Some((i, j))
        } else {
            None
        }
    }

    /// Smallest layer thickness over all columns.
    pub fn min_dz(&self) -> f64 {
        self.thicknesses().fold(f64::INFINITY, f64::min)
    }

    /// Largest layer thickness over all columns.
    pub fn max_dz(&self) -> f64 {
        self.thicknesses().fold(0.0, f64::max)
    }

    fn thicknesses(&self) -> impl Iterator<Item = f64> + '_ {
        let nz = self.nz as f64;
        self.top
            .iter()
            .zip(self.base.iter())
            .map(move |(t, b)| (b - t) / nz)
    }

    /// Ratio between the thinnest and the thickest layer.
    pub fn thickness_ratio(&self) -> f64 {
        self.min_dz() / self.max_dz()
    }

    /// Build a derived simbox with the same top, lateral grid and layer count
    /// but a new base surface.
    ///
    /// # Errors
    /// Returns an error if the new base is not below the top everywhere, or if
    /// the resulting thickness ratio falls below `lz_limit`.
    pub fn with_base(&self, base: Array2<f64>, lz_limit: f64) -> Result<Simbox> {
        let derived = Simbox::new(
            (self.x0, self.y0),
            (self.dx, self.dy),
            self.top.clone(),
            base,
            self.nz,
        )?;
        let ratio = derived.thickness_ratio();
        if ratio < lz_limit {
            return Err(InversionError::InvalidGeometry {
                ratio,
                limit: lz_limit,
            });
        }
        Ok(derived)
    }
}
