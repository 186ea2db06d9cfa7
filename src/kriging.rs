// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::collections::BTreeMap;

use log::{debug, warn};
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use ndarray::{s, Array3, ArrayViewMut2};

use crate::core::Simbox;
use crate::error::{InversionError, Result};
use crate::prior::Variogram;

/// Per-layer sparse data indexed by lateral cell.
///
/// Repeated samples at the same cell are averaged.
#[derive(Debug, Clone)]
pub struct KrigingData {
    layers: Vec<BTreeMap<(usize, usize), (f64, usize)>>,
}

impl KrigingData {
    /// Empty dataset with `n_layers` layers.
    pub fn new(n_layers: usize) -> Self {
        KrigingData {
            layers: vec![BTreeMap::new(); n_layers],
        }
    }

    /// Number of layers.
    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Add a full profile observed at cell `(i, j)`; extra entries beyond the
    /// layer count are ignored.
    pub fn add_profile(&mut self, i: usize, j: usize, profile: &[f64]) {
        for (layer, &value) in self.layers.iter_mut().zip(profile.iter()) {
            let entry = layer.entry((i, j)).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }

    /// Number of distinct cells with data in `layer`.
    pub fn count(&self, layer: usize) -> usize {
        self.layers[layer].len()
    }

    /// Averaged `(cell, value)` pairs of `layer`, ordered by cell.
    pub fn points(&self, layer: usize) -> Vec<((usize, usize), f64)> {
        self.layers[layer]
            .iter()
            .map(|(&cell, &(sum, n))| (cell, sum / n as f64))
            .collect()
    }
}

/// Factorised simple kriging system for one set of data locations.
struct KrigingSystem {
    cells: Vec<(usize, usize)>,
    coords: Vec<(f64, f64)>,
    chol: Option<Cholesky<f64, Dyn>>,
}

impl KrigingSystem {
    fn build<V: Variogram>(cells: Vec<(usize, usize)>, simbox: &Simbox, variogram: &V) -> Self {
        let n = cells.len();
        let coords: Vec<(f64, f64)> = cells.iter().map(|&(i, j)| simbox.xy_coord(i, j)).collect();
        let cov = DMatrix::from_fn(n, n, |a, b| variogram.corr(distance(coords[a], coords[b])));
        let chol = cov.cholesky();
        if chol.is_none() {
            warn!(
                "kriging system over {} points is singular; using the layer mean away from data",
                n
            );
        }
        KrigingSystem {
            cells,
            coords,
            chol,
        }
    }

    /// Kriged residual at every cell of `out`, which holds the layer mean.
    fn estimate<V: Variogram>(
        &self,
        residual: &DVector<f64>,
        simbox: &Simbox,
        variogram: &V,
        out: &mut ArrayViewMut2<f64>,
    ) {
        let Some(chol) = &self.chol else {
            return;
        };
        let w = chol.solve(residual);
        for ((i, j), v) in out.indexed_iter_mut() {
            let xy = simbox.xy_coord(i, j);
            *v += self
                .coords
                .iter()
                .zip(w.iter())
                .map(|(&c, &wa)| variogram.corr(distance(c, xy)) * wa)
                .sum::<f64>();
        }
    }
}

fn distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// Krige the first `nz` layers of `data` onto the simbox lateral grid.
///
/// Returns an `nx × ny × nz` array. Layers sharing the same data cells reuse
/// one factorisation.
///
/// # Errors
/// Returns [`InversionError::NoValidTraces`] if a layer has no data.
pub fn krige_layers<V: Variogram>(
    data: &KrigingData,
    simbox: &Simbox,
    nz: usize,
    variogram: &V,
) -> Result<Array3<f64>> {
    let (nx, ny) = (simbox.nx(), simbox.ny());
    if nz > data.n_layers() {
        return Err(InversionError::ShapeMismatch {
            expected: vec![nz],
            got: vec![data.n_layers()],
        });
    }
    let mut out = Array3::zeros((nx, ny, nz));
    let mut system: Option<KrigingSystem> = None;

    for k in 0..nz {
        let points = data.points(k);
        if points.is_empty() {
            return Err(InversionError::NoValidTraces);
        }
        let mean = points.iter().map(|(_, v)| v).sum::<f64>() / points.len() as f64;
        let cells: Vec<(usize, usize)> = points.iter().map(|(c, _)| *c).collect();

        out.slice_mut(s![.., .., k]).fill(mean);

        if cells.len() < nx * ny {
            let reuse = matches!(&system, Some(s) if s.cells == cells);
            if !reuse {
                debug!("factorising kriging system with {} points at layer {}", cells.len(), k);
                system = Some(KrigingSystem::build(cells.clone(), simbox, variogram));
            }
            if let Some(sys) = &system {
                let residual =
                    DVector::from_iterator(points.len(), points.iter().map(|(_, v)| v - mean));
                sys.estimate(&residual, simbox, variogram, &mut out.slice_mut(s![.., .., k]));
            }
        }

        for &((i, j), v) in &points {
            if i < nx && j < ny {
                out[[i, j, k]] = v;
            }
        }
    }
    Ok(out)
}
