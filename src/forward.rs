// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use nalgebra::{DMatrix, DVector};

use crate::conditioner::Observation;
use crate::core::is_missing;
use crate::error::{InversionError, Result};

/// Relative tolerance used when an RMS sample time lands on a layer boundary.
const BOUNDARY_TOLERANCE: f64 = 1e-9;

/// One horizon observed in a trace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HorizonSample {
    /// Two-way time of the horizon in the base survey (ms).
    pub initial_time: f64,
    /// Observed push-down of the horizon (ms).
    pub push_down: f64,
    /// Standard deviation of the push-down (ms).
    pub std_dev: f64,
}

impl HorizonSample {
    fn is_valid(&self) -> bool {
        !is_missing(self.initial_time) && !is_missing(self.push_down)
    }
}

/// Vertical sampling of the model interval at one trace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceColumn {
    /// Top of the model interval (ms).
    pub top: f64,
    /// Base of the model interval (ms).
    pub base: f64,
    /// Number of physical layers.
    pub nz: usize,
    /// Number of layers including padding.
    pub nzp: usize,
}

impl TraceColumn {
    /// Layer thickness.
    pub fn dt(&self) -> f64 {
        (self.base - self.top) / self.nz as f64
    }
}

/// Horizon operator with one row per horizon, over `column.nzp` layers.
///
/// A row holds `dt` for every layer fully above the horizon and the
/// fractional remainder in the layer containing it. Horizons below the base
/// are clamped to the base; rows for missing samples are zero.
pub fn horizon_operator(samples: &[HorizonSample], column: &TraceColumn) -> DMatrix<f64> {
    let dt = column.dt();
    let mut g = DMatrix::zeros(samples.len(), column.nzp);
    for (row, sample) in samples.iter().enumerate() {
        if !sample.is_valid() {
            continue;
        }
        let t0 = clamp_time(sample.initial_time, column);
        let full = (((t0 - column.top) / dt).floor().max(0.0) as usize).min(column.nz);
        for k in 0..full {
            g[(row, k)] = dt;
        }
        if full < column.nz {
            g[(row, full)] = t0 - column.top - dt * full as f64;
        }
    }
    g
}

fn clamp_time(t: f64, column: &TraceColumn) -> f64 {
    t.max(column.top).min(column.base)
}

/// Horizon observation with missing samples removed.
///
/// Data are `t0 + push_down − top` with `t0` clamped to the model interval,
/// noise is `diag(σ²)`. Returns `None` when no sample is valid.
pub fn horizon_observation(
    samples: &[HorizonSample],
    column: &TraceColumn,
) -> Result<Option<Observation>> {
    for s in samples {
        validate_std(s.std_dev)?;
    }
    let valid: Vec<usize> = (0..samples.len())
        .filter(|&k| samples[k].is_valid())
        .collect();
    if valid.is_empty() {
        return Ok(None);
    }

    let full = horizon_operator(samples, column);
    let operator = full.select_rows(valid.iter());
    let data = DVector::from_iterator(
        valid.len(),
        valid.iter().map(|&k| {
            let s = &samples[k];
            clamp_time(s.initial_time, column) + s.push_down - column.top
        }),
    );
    let noise = DMatrix::from_diagonal(&DVector::from_iterator(
        valid.len(),
        valid.iter().map(|&k| samples[k].std_dev.powi(2)),
    ));
    Observation::new(operator, data, noise).map(Some)
}

/// One contiguous block of layers in a layer stack.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerBlock {
    /// Time at the top of the first layer (ms).
    pub start: f64,
    /// Layer thickness (ms).
    pub dt: f64,
    /// Physical layers.
    pub n: usize,
    /// Layers including padding (`n_pad >= n`).
    pub n_pad: usize,
}

impl LayerBlock {
    /// Construct a block, checking that the padding covers the physical layers.
    pub fn new(start: f64, dt: f64, n: usize, n_pad: usize) -> Result<Self> {
        if !dt.is_finite() || dt <= 0.0 {
            return Err(InversionError::InvalidGridSpacing(dt));
        }
        if n_pad < n {
            return Err(InversionError::InvalidConfig(format!(
                "padded layer count {} is smaller than physical count {}",
                n_pad, n
            )));
        }
        Ok(LayerBlock { start, dt, n, n_pad })
    }
}

/// The above / model / below layer stack of an RMS trace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerStack {
    /// From the datum to the model top.
    pub above: LayerBlock,
    /// The model interval.
    pub model: LayerBlock,
    /// From the model base downwards.
    pub below: LayerBlock,
}

impl LayerStack {
    /// Total number of layers including padding.
    pub fn len(&self) -> usize {
        self.above.n_pad + self.model.n_pad + self.below.n_pad
    }

    /// True if the stack has no layers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offset of the model block in the stacked profile.
    pub fn model_offset(&self) -> usize {
        self.above.n_pad
    }

    /// Top time and thickness of every layer; padding layers have zero thickness.
    pub fn layer_times(&self) -> (Vec<f64>, Vec<f64>) {
        let n = self.len();
        let mut t = vec![0.0; n];
        let mut dt = vec![0.0; n];
        let mut offset = 0;
        for block in [&self.above, &self.model, &self.below] {
            for j in 0..block.n {
                t[offset + j] = block.start + j as f64 * block.dt;
                dt[offset + j] = block.dt;
            }
            offset += block.n_pad;
        }
        (t, dt)
    }
}

/// RMS operator mapping squared interval velocity to squared RMS velocity.
///
/// Row `j` walks the layers from the top, adding `dt / t_j` for every layer
/// whose base lies at or above `t_j`, then the remainder
/// `(t_j − previous base) / t_j` in the layer containing `t_j`. A sample on a
/// layer boundary belongs entirely to the layer above it. Padding layers
/// contribute nothing.
pub fn rms_operator(times: &[f64], stack: &LayerStack) -> DMatrix<f64> {
    let (t, dt) = stack.layer_times();
    let n = t.len();
    let first_top = t
        .iter()
        .zip(dt.iter())
        .find(|(_, &d)| d > 0.0)
        .map(|(&top, _)| top)
        .unwrap_or(0.0);

    let mut g = DMatrix::zeros(times.len(), n);
    for (row, &rms_time) in times.iter().enumerate() {
        if !(rms_time > 0.0) {
            continue;
        }
        let tol = BOUNDARY_TOLERANCE * rms_time.abs().max(1.0);
        let mut prev_base = first_top;
        let mut k = 0;
        while k < n && rms_time >= t[k] + dt[k] - tol {
            g[(row, k)] = dt[k] / rms_time;
            if dt[k] > 0.0 {
                prev_base = t[k] + dt[k];
            }
            k += 1;
        }
        if k < n {
            g[(row, k)] = (rms_time - prev_base).max(0.0) / rms_time;
        }
    }
    g
}

/// Squared RMS velocities with the noise bias `σ²` removed, since
/// `E[v²] = μ² + σ²`.
pub fn squared_data(velocity: &[f64], std_dev: f64) -> DVector<f64> {
    let variance = std_dev * std_dev;
    DVector::from_iterator(velocity.len(), velocity.iter().map(|v| v * v - variance))
}

/// Noise covariance of squared RMS data: `diag(4 v² σ² + 2 σ⁴)`.
pub fn squared_noise(velocity: &[f64], std_dev: f64) -> DMatrix<f64> {
    let variance = std_dev * std_dev;
    DMatrix::from_diagonal(&DVector::from_iterator(
        velocity.len(),
        velocity
            .iter()
            .map(|v| 4.0 * v * v * variance + 2.0 * variance * variance),
    ))
}

/// RMS velocity trace at one lateral cell.
#[derive(Debug, Clone, PartialEq)]
pub struct RmsTrace {
    /// Lateral x index.
    pub i: usize,
    /// Lateral y index.
    pub j: usize,
    /// Two-way times of the samples (ms).
    pub time: Vec<f64>,
    /// RMS velocities at those times.
    pub velocity: Vec<f64>,
}

impl RmsTrace {
    /// Create a trace, checking that times and velocities pair up.
    pub fn new(i: usize, j: usize, time: Vec<f64>, velocity: Vec<f64>) -> Result<Self> {
        if time.len() != velocity.len() {
            return Err(InversionError::ShapeMismatch {
                expected: vec![time.len()],
                got: vec![velocity.len()],
            });
        }
        Ok(RmsTrace {
            i,
            j,
            time,
            velocity,
        })
    }

    /// Samples with a positive time and a non-missing velocity.
    pub fn valid_samples(&self) -> (Vec<f64>, Vec<f64>) {
        self.time
            .iter()
            .zip(self.velocity.iter())
            .filter(|(&t, &v)| t > 0.0 && !is_missing(v))
            .map(|(&t, &v)| (t, v))
            .unzip()
    }
}

/// Squared-velocity observation of an RMS trace, or `None` if no sample is valid.
pub fn rms_observation(
    trace: &RmsTrace,
    stack: &LayerStack,
    std_dev: f64,
) -> Result<Option<Observation>> {
    validate_std(std_dev)?;
    let (time, velocity) = trace.valid_samples();
    if time.is_empty() {
        return Ok(None);
    }
    let operator = rms_operator(&time, stack);
    let data = squared_data(&velocity, std_dev);
    let noise = squared_noise(&velocity, std_dev);
    Observation::new(operator, data, noise).map(Some)
}

fn validate_std(std_dev: f64) -> Result<()> {
    if !std_dev.is_finite() || std_dev < 0.0 {
        return Err(InversionError::InvalidStandardDeviation(std_dev));
    }
    Ok(())
}
