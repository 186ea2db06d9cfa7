// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array2, Array3};
use rayon::prelude::*;

use crate::circulant::CirculantAccumulator;
use crate::conditioner::condition;
use crate::core::{GridDims, Simbox};
use crate::depth::{expected_velocity, TimeDepthMapping};
use crate::error::{InversionError, Result};
use crate::field::{lateral_correlation, lateral_identity, pad_smooth, AccessMode, Field3D};
use crate::forward::{
    horizon_observation, rms_observation, HorizonSample, LayerBlock, LayerStack, RmsTrace,
    TraceColumn,
};
use crate::joint::{JointModel, SingleFieldModel};
use crate::kriging::{krige_layers, KrigingData};
use crate::moments::{
    floor_positive, inverse_to_log, linear_to_log, log_to_inverse, log_to_square, square_to_log,
    Moments,
};
use crate::prior::{
    below_log_prior, block_diagonal, circulant_correlation, linear_trend, toeplitz,
    ExponentialVariogram, IntervalPrior,
};
use crate::regrid::{
    distance_grid, inverse_change_ratio, kernel_variance, new_geometry, velocity_ratio,
    ResampleMap,
};
use crate::spectral::StationaryDistribution;

/// Progress information passed to the optional callback.
pub struct ProgressInfo {
    /// Number of traces solved so far.
    pub traces_processed: u64,
    /// Number of traces in the pass.
    pub total_traces: usize,
    /// Elapsed time since the trace loop started.
    pub elapsed: Duration,
}

/// Tunable parameters shared by all passes.
#[derive(Debug, Clone, PartialEq)]
pub struct InversionConfig {
    num_threads: Option<usize>,
    kriging_range: f64,
    error_corr_range: Option<f64>,
    lz_limit: f64,
    mean_floor: f64,
    resample_covariances: bool,
}

impl Default for InversionConfig {
    fn default() -> Self {
        InversionConfig {
            num_threads: None,
            kriging_range: 2000.0,
            error_corr_range: None,
            lz_limit: 0.41,
            mean_floor: 1.0,
            resample_covariances: true,
        }
    }
}

impl InversionConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads (builder method).
    /// If not specified, defaults to the number of available CPU cores.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.num_threads = Some(threads);
        self
    }

    /// Set the lateral range of the kriging variogram (builder method). Default 2000.
    ///
    /// # Errors
    /// Returns an error if the range is not positive and finite.
    pub fn with_kriging_range(mut self, range: f64) -> Result<Self> {
        check_positive("kriging range", range)?;
        self.kriging_range = range;
        Ok(self)
    }

    /// Correlate the virtual-observation error laterally with this range
    /// (builder method). By default the error is laterally white.
    pub fn with_error_correlation_range(mut self, range: f64) -> Result<Self> {
        check_positive("error correlation range", range)?;
        self.error_corr_range = Some(range);
        Ok(self)
    }

    /// Smallest accepted ratio between the thinnest and thickest layer after
    /// regridding (builder method). Default 0.41.
    pub fn with_lz_limit(mut self, lz_limit: f64) -> Result<Self> {
        if !lz_limit.is_finite() || !(0.0..=1.0).contains(&lz_limit) {
            return Err(InversionError::InvalidConfig(format!(
                "lz limit must lie in [0, 1], got {}",
                lz_limit
            )));
        }
        self.lz_limit = lz_limit;
        Ok(self)
    }

    /// Value substituted for non-positive means before a log transform
    /// (builder method). Default 1.0.
    pub fn with_mean_floor(mut self, floor: f64) -> Result<Self> {
        check_positive("mean floor", floor)?;
        self.mean_floor = floor;
        Ok(self)
    }

    /// Whether covariance kernels are resampled along with the means when
    /// the geometry changes (builder method). Default true.
    pub fn with_resample_covariances(mut self, resample: bool) -> Self {
        self.resample_covariances = resample;
        self
    }

    /// Lateral kriging range.
    pub fn kriging_range(&self) -> f64 {
        self.kriging_range
    }

    /// Thickness-ratio limit used when regridding.
    pub fn lz_limit(&self) -> f64 {
        self.lz_limit
    }

    /// Floor used for non-positive means.
    pub fn mean_floor(&self) -> f64 {
        self.mean_floor
    }

    fn get_num_threads(&self) -> usize {
        self.num_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    fn error_lateral(&self, dims: GridDims, simbox: &Simbox) -> Array2<f64> {
        match self.error_corr_range {
            Some(range) => lateral_correlation(
                dims.nxp,
                dims.nyp,
                (simbox.dx(), simbox.dy()),
                &ExponentialVariogram::exponential(range),
            ),
            None => lateral_identity(dims.nxp, dims.nyp),
        }
    }
}

fn check_positive(what: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(InversionError::InvalidConfig(format!(
            "{} must be positive, got {}",
            what, value
        )));
    }
    Ok(())
}

/// A horizon picked in the base survey.
#[derive(Debug, Clone, PartialEq)]
pub struct Horizon {
    /// Horizon name.
    pub name: String,
    /// Two-way time per lateral cell (ms); missing cells hold the sentinel.
    pub times: Array2<f64>,
}

/// The push-down of a horizon in a monitor survey.
#[derive(Debug, Clone, PartialEq)]
pub struct PushDownHorizon {
    /// Name of the initial horizon it belongs to.
    pub name: String,
    /// Push-down per lateral cell (ms); missing cells hold the sentinel.
    pub push_down: Array2<f64>,
    /// Standard deviation of the push-down (ms).
    pub std_dev: f64,
}

/// Horizon data of one monitor survey.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HorizonData {
    /// Horizons of the base survey.
    pub initial: Vec<Horizon>,
    /// Push-downs observed in the monitor survey.
    pub push_down: Vec<PushDownHorizon>,
}

impl HorizonData {
    /// Pair every push-down with its initial horizon, in push-down order.
    ///
    /// # Errors
    /// Returns [`InversionError::MissingHorizon`] if a push-down names no
    /// initial horizon.
    pub fn matched(&self) -> Result<Vec<(&Horizon, &PushDownHorizon)>> {
        self.push_down
            .iter()
            .map(|p| {
                self.initial
                    .iter()
                    .find(|h| h.name == p.name)
                    .map(|h| (h, p))
                    .ok_or_else(|| InversionError::MissingHorizon(p.name.clone()))
            })
            .collect()
    }

    fn samples(pairs: &[(&Horizon, &PushDownHorizon)], i: usize, j: usize) -> Vec<HorizonSample> {
        pairs
            .iter()
            .map(|(h, p)| HorizonSample {
                initial_time: h.times[[i, j]],
                push_down: p.push_down[[i, j]],
                std_dev: p.std_dev,
            })
            .collect()
    }
}

/// RMS velocity traces with the priors of the intervals around the model.
#[derive(Debug, Clone, PartialEq)]
pub struct RmsSurvey {
    /// Traces located in the lateral grid.
    pub traces: Vec<RmsTrace>,
    /// Standard deviation of the RMS velocities.
    pub std_dev: f64,
    /// Interval from the datum down to the model top.
    pub above: IntervalPrior,
    /// Interval below the model base.
    pub below: IntervalPrior,
    /// Thickness of the interval below the model (ms).
    pub below_thickness: f64,
    /// Expected velocity at the datum.
    pub velocity_top: f64,
    /// Expected velocity at the base of the interval below the model.
    pub velocity_base: f64,
}

/// The observations of one survey.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SurveyData {
    /// Zero for the base survey, positive for monitors.
    pub time_lapse: usize,
    /// Push-down horizons, used for monitor surveys.
    pub horizons: Option<HorizonData>,
    /// RMS velocities.
    pub rms: Option<RmsSurvey>,
}

/// Everything a pass reads and updates.
#[derive(Debug, Clone)]
pub struct InversionState {
    /// Current geometry.
    pub simbox: Simbox,
    /// Log-Vp, log-Vs and log-density with their covariance kernels.
    pub joint: JointModel,
    /// Log velocity change `ln(Vp1 / Vp0)` updated by the horizon pass.
    pub dynamic: Option<SingleFieldModel>,
    /// Fields owned by the caller that follow the geometry.
    pub external: Vec<Field3D>,
    /// Depth of the model layers, set by the first base-survey RMS update.
    pub depth_mapping: Option<TimeDepthMapping>,
}

impl InversionState {
    /// Pair a joint model with its geometry.
    ///
    /// # Errors
    /// Returns an error if the physical grid of the model differs from the simbox.
    pub fn new(simbox: Simbox, joint: JointModel) -> Result<Self> {
        check_physical(&simbox, joint.dims())?;
        Ok(InversionState {
            simbox,
            joint,
            dynamic: None,
            external: Vec::new(),
            depth_mapping: None,
        })
    }

    /// Attach the velocity-change field (builder method).
    pub fn with_dynamic(mut self, dynamic: SingleFieldModel) -> Result<Self> {
        check_physical(&self.simbox, dynamic.dims())?;
        self.dynamic = Some(dynamic);
        Ok(self)
    }

    /// Attach fields that are resampled whenever the geometry changes (builder method).
    pub fn with_external(mut self, fields: Vec<Field3D>) -> Result<Self> {
        for f in &fields {
            check_physical(&self.simbox, f.dims())?;
        }
        self.external = fields;
        Ok(self)
    }
}

fn check_physical(simbox: &Simbox, dims: GridDims) -> Result<()> {
    let expected = [simbox.nx(), simbox.ny(), simbox.nz()];
    if dims.physical() != expected {
        return Err(InversionError::ShapeMismatch {
            expected: expected.to_vec(),
            got: dims.physical().to_vec(),
        });
    }
    Ok(())
}

/// How an RMS pass uses its posterior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmsMode {
    /// Joint update of the three fields.
    Update,
    /// Joint update, then the posterior of the interval above the model and
    /// the time-depth mapping.
    BaseUpdate,
    /// Regrid on the expected velocity ratio, leaving the fields otherwise unchanged.
    AxisShift,
}

/// Outcome of one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    /// Traces that contributed a posterior.
    pub traces: usize,
    /// Vertical frequencies where the correction was applied.
    pub trusted_frequencies: usize,
    /// Whether the geometry was replaced.
    pub regridded: bool,
}

#[derive(Debug, Clone)]
struct TracePosterior {
    i: usize,
    j: usize,
    moments: Moments,
    /// Log-Vp posterior of the interval above the model, padded.
    above: Option<Moments>,
}

impl TracePosterior {
    fn samples(posteriors: &[TracePosterior]) -> Vec<(usize, usize, &Moments)> {
        posteriors.iter().map(|p| (p.i, p.j, &p.moments)).collect()
    }

    fn above_samples(posteriors: &[TracePosterior]) -> Vec<(usize, usize, &Moments)> {
        posteriors
            .iter()
            .filter_map(|p| p.above.as_ref().map(|m| (p.i, p.j, m)))
            .collect()
    }
}

/// Per-pass geometry of the intervals around the model.
struct RmsLayout {
    n_pad_above: usize,
    above_cov: DMatrix<f64>,
    dt_below: f64,
    n_pad_below: usize,
    below_cov: DMatrix<f64>,
}

impl RmsLayout {
    fn new(simbox: &Simbox, survey: &RmsSurvey) -> Result<Self> {
        let (nx, ny) = (simbox.nx(), simbox.ny());
        let n_above = survey.above.nz;
        let mut dt_above = Vec::with_capacity(nx * ny);
        for i in 0..nx {
            for j in 0..ny {
                let dt = simbox.top(i, j) / n_above as f64;
                if !dt.is_finite() || dt <= 0.0 {
                    return Err(InversionError::InvalidGridSpacing(dt));
                }
                dt_above.push(dt);
            }
        }
        let min_dt = dt_above.iter().copied().fold(f64::INFINITY, f64::min);
        let n_pad_above = survey.above.padded(min_dt);

        // Laterally averaged correlation of the above interval.
        let vario = ExponentialVariogram::exponential(survey.above.range);
        let mut corr = vec![0.0; n_pad_above];
        for &dt in &dt_above {
            for (c, v) in corr.iter_mut().zip(circulant_correlation(n_pad_above, dt, &vario)) {
                *c += v;
            }
        }
        let scale = survey.above.variance / dt_above.len() as f64;
        let above_cov = toeplitz(&corr) * scale;

        let dt_below = survey.below_thickness / survey.below.nz as f64;
        if !dt_below.is_finite() || dt_below <= 0.0 {
            return Err(InversionError::InvalidGridSpacing(dt_below));
        }
        let n_pad_below = survey.below.padded(dt_below);
        let below_cov = survey.below.velocity_covariance(dt_below, n_pad_below);
        debug!(
            "rms layer stack: {} + {} + {} padded layers",
            n_pad_above,
            simbox.nz(),
            n_pad_below
        );
        Ok(RmsLayout {
            n_pad_above,
            above_cov,
            dt_below,
            n_pad_below,
            below_cov,
        })
    }

    /// Log-Vp prior of the interval above the model at one trace, a linear
    /// trend from the datum velocity to the velocity at the top of the model.
    fn above_prior(&self, survey: &RmsSurvey, model_top_log: f64, floor: f64) -> Result<Moments> {
        let n_above = survey.above.nz;
        let mut trend = linear_trend(survey.velocity_top, model_top_log.exp(), n_above);
        trend.truncate(n_above);
        let mut mean = DVector::from_vec(pad_profile(&trend, self.n_pad_above)?);
        floor_positive(&mut mean, floor);
        linear_to_log(&Moments::new(mean, self.above_cov.clone())?)
    }
}

/// Inputs shared by all trace solves of a pass.
struct TraceContext<'a> {
    simbox: &'a Simbox,
    dims: GridDims,
    /// Padded prior mean.
    mean: Array3<f64>,
    /// Toeplitz prior covariance of one column.
    cov: DMatrix<f64>,
    floor: f64,
}

impl<'a> TraceContext<'a> {
    fn new(simbox: &'a Simbox, mean: &Field3D, profile: &[f64], floor: f64) -> Result<Self> {
        Ok(TraceContext {
            simbox,
            dims: mean.dims(),
            mean: mean.padded_values()?,
            cov: toeplitz(profile),
            floor,
        })
    }

    fn column_prior(&self, i: usize, j: usize) -> Moments {
        let nzp = self.dims.nzp;
        Moments {
            mean: DVector::from_fn(nzp, |k, _| self.mean[[i, j, k]]),
            cov: self.cov.clone(),
        }
    }

    fn floor(&self, moments: &mut Moments, i: usize, j: usize) {
        let replaced = floor_positive(&mut moments.mean, self.floor);
        if replaced > 0 {
            debug!("trace ({}, {}): {} non-positive means floored", i, j, replaced);
        }
    }
}

/// Lateral correlation of a stationary covariance kernel, its zero-lag
/// vertical slice scaled to one at the origin.
fn kernel_lateral(kernel: &mut Field3D) -> Result<Array2<f64>> {
    kernel.ensure_space()?;
    let access = kernel.access(AccessMode::Read)?;
    let dims = access.dims();
    let variance = access.real(0, 0, 0);
    if !(variance > 0.0) {
        return Err(InversionError::InvalidConfig(format!(
            "covariance kernel variance must be positive, got {}",
            variance
        )));
    }
    Ok(Array2::from_shape_fn((dims.nxp, dims.nyp), |(i, j)| {
        access.real(i, j, 0) / variance
    }))
}

/// Copy out the padded vertical profile of a stationary covariance kernel.
fn kernel_profile(kernel: &mut Field3D) -> Result<Vec<f64>> {
    kernel.ensure_space()?;
    let access = kernel.access(AccessMode::Read)?;
    Ok(access.vertical_profile(0, 0))
}

/// Pad `values` to `n_pad` with the same smooth periodic blend used for fields.
fn pad_profile(values: &[f64], n_pad: usize) -> Result<Vec<f64>> {
    let dims = GridDims::new([1, 1, values.len()], [1, 1, n_pad])?;
    let mut padded = Array3::zeros((1, 1, n_pad));
    for (k, &v) in values.iter().enumerate() {
        padded[[0, 0, k]] = v;
    }
    pad_smooth(&mut padded, &dims);
    Ok(padded.iter().copied().collect())
}

/// Driver of the horizon and RMS inversion passes.
pub struct TravelTimeInversion {
    config: InversionConfig,
    progress_callback: Option<Box<dyn Fn(ProgressInfo) + Send + Sync>>,
}

impl TravelTimeInversion {
    /// Create a driver with the given configuration.
    pub fn new(config: InversionConfig) -> Self {
        TravelTimeInversion {
            config,
            progress_callback: None,
        }
    }

    /// Set a progress callback that will be invoked periodically while traces
    /// are solved (builder method).
    /// The callback receives progress information approximately every 500ms.
    pub fn with_progress(mut self, callback: Box<dyn Fn(ProgressInfo) + Send + Sync>) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// The configuration.
    pub fn config(&self) -> &InversionConfig {
        &self.config
    }

    /// Run every pass a survey calls for.
    ///
    /// Horizons are inverted for monitor surveys only. The RMS pass runs once
    /// for the base survey; for a monitor it first shifts the axis and then
    /// updates on the new geometry.
    pub fn run(&self, state: &mut InversionState, survey: &SurveyData) -> Result<Vec<PassSummary>> {
        let start = Instant::now();
        let mut summaries = Vec::new();
        if let Some(horizons) = &survey.horizons {
            if survey.time_lapse > 0 {
                let regrid = survey.rms.is_none();
                summaries.push(self.horizon_pass(state, horizons, regrid)?);
            } else {
                info!("base survey: push-down horizons ignored");
            }
        }
        if let Some(rms) = &survey.rms {
            let mode = if survey.time_lapse > 0 {
                summaries.push(self.rms_pass(state, rms, RmsMode::AxisShift)?);
                RmsMode::Update
            } else if state.depth_mapping.is_none() {
                RmsMode::BaseUpdate
            } else {
                RmsMode::Update
            };
            summaries.push(self.rms_pass(state, rms, mode)?);
        }
        info!(
            "traveltime inversion of survey {} finished in {:.2?}",
            survey.time_lapse,
            start.elapsed()
        );
        Ok(summaries)
    }

    /// Invert push-down horizons into the velocity-change field.
    ///
    /// With `regrid`, the geometry is then replaced using `E[Vp0 / Vp1]` as
    /// the thickness ratio.
    pub fn horizon_pass(
        &self,
        state: &mut InversionState,
        data: &HorizonData,
        regrid: bool,
    ) -> Result<PassSummary> {
        let pairs = data.matched()?;
        let simbox = &state.simbox;
        let (nx, ny) = (simbox.nx(), simbox.ny());
        for (h, p) in &pairs {
            for shape in [h.times.shape(), p.push_down.shape()] {
                if shape != [nx, ny] {
                    return Err(InversionError::ShapeMismatch {
                        expected: vec![nx, ny],
                        got: shape.to_vec(),
                    });
                }
            }
        }
        let dynamic = state.dynamic.as_mut().ok_or_else(|| {
            InversionError::InvalidConfig("horizon inversion needs a velocity-change field".into())
        })?;
        info!("horizon inversion: {} horizons over {}x{} traces", pairs.len(), nx, ny);

        dynamic.to_space()?;
        let prior_profile = kernel_profile(&mut dynamic.cov)?;
        let ctx = TraceContext::new(simbox, &dynamic.mean, &prior_profile, self.config.mean_floor)?;

        let cells: Vec<(usize, usize)> = (0..nx)
            .flat_map(|i| (0..ny).map(move |j| (i, j)))
            .collect();
        let posteriors = self.solve_traces(&cells, |&(i, j)| {
            let samples = HorizonData::samples(&pairs, i, j);
            let column = TraceColumn {
                top: ctx.simbox.top(i, j),
                base: ctx.simbox.base(i, j),
                nz: ctx.dims.nz,
                nzp: ctx.dims.nzp,
            };
            let obs = match horizon_observation(&samples, &column)? {
                Some(obs) => obs,
                None => return Ok(None),
            };
            let prior = log_to_inverse(&ctx.column_prior(i, j));
            let mut post = condition(&prior, &obs)?;
            ctx.floor(&mut post, i, j);
            Ok(Some(TracePosterior {
                i,
                j,
                moments: inverse_to_log(&post)?,
                above: None,
            }))
        })?;
        if posteriors.is_empty() {
            warn!("horizon inversion: no trace holds a valid push-down; field left unchanged");
            return Ok(PassSummary {
                traces: 0,
                trusted_frequencies: 0,
                regridded: false,
            });
        }

        let samples = TracePosterior::samples(&posteriors);
        let mut dist = self.stationary(simbox, &samples, &dynamic.mean, &prior_profile)?;
        let trusted = dist.filter.iter().filter(|&&f| f).count();
        dynamic.update(&mut dist)?;
        dynamic.to_space()?;

        let mut regridded = false;
        if regrid {
            let change = dynamic.mean.physical_values()?;
            let variance = kernel_variance(&mut dynamic.cov)?;
            let ratio = inverse_change_ratio(&change, variance);
            self.regrid(state, &ratio)?;
            regridded = true;
        }
        info!(
            "horizon inversion done: {} traces, {} trusted frequencies",
            posteriors.len(),
            trusted
        );
        Ok(PassSummary {
            traces: posteriors.len(),
            trusted_frequencies: trusted,
            regridded,
        })
    }

    /// Invert RMS velocities.
    pub fn rms_pass(
        &self,
        state: &mut InversionState,
        survey: &RmsSurvey,
        mode: RmsMode,
    ) -> Result<PassSummary> {
        let simbox = &state.simbox;
        for t in &survey.traces {
            if t.i >= simbox.nx() || t.j >= simbox.ny() {
                return Err(InversionError::ShapeMismatch {
                    expected: vec![simbox.nx(), simbox.ny()],
                    got: vec![t.i, t.j],
                });
            }
        }
        info!("rms inversion ({:?}): {} traces", mode, survey.traces.len());

        let layout = RmsLayout::new(simbox, survey)?;
        state.joint.to_space()?;
        let prior_profile = kernel_profile(&mut state.joint.variances[0])?;
        let ctx = TraceContext::new(
            simbox,
            &state.joint.means[0],
            &prior_profile,
            self.config.mean_floor,
        )?;

        let keep_above = mode == RmsMode::BaseUpdate;
        let posteriors = self.solve_traces(&survey.traces, |trace| {
            self.solve_rms_trace(trace, survey, &layout, &ctx, keep_above)
        })?;
        if posteriors.is_empty() {
            warn!("rms inversion: no trace holds valid samples; model left unchanged");
            return Ok(PassSummary {
                traces: 0,
                trusted_frequencies: 0,
                regridded: false,
            });
        }

        let samples = TracePosterior::samples(&posteriors);
        let mut dist = self.stationary(simbox, &samples, &state.joint.means[0], &prior_profile)?;
        let trusted = dist.filter.iter().filter(|&&f| f).count();

        let regridded = match mode {
            RmsMode::Update => {
                state.joint.update(&mut dist)?;
                state.joint.to_space()?;
                false
            }
            RmsMode::BaseUpdate => {
                let lateral = kernel_lateral(&mut state.joint.variances[0])?;
                state.joint.update(&mut dist)?;
                state.joint.to_space()?;
                let above = self.above_velocity(survey, &layout, &ctx, &posteriors, &lateral)?;
                let model = expected_velocity(
                    &state.joint.means[0].physical_values()?,
                    kernel_variance(&mut state.joint.variances[0])?,
                );
                let mapping = TimeDepthMapping::from_velocity(simbox, &above, &model)?;
                state.depth_mapping = Some(mapping);
                false
            }
            RmsMode::AxisShift => {
                let mut single = SingleFieldModel::new(
                    state.joint.means[0].clone(),
                    state.joint.variances[0].clone(),
                )?;
                let prior_mean = state.joint.means[0].physical_values()?;
                let prior_variance = kernel_variance(&mut state.joint.variances[0])?;
                single.update(&mut dist)?;
                single.to_space()?;
                let post_mean = single.mean.physical_values()?;
                let post_variance = kernel_variance(&mut single.cov)?;
                let ratio = velocity_ratio(&prior_mean, prior_variance, &post_mean, post_variance)?;
                self.regrid(state, &ratio)?;
                true
            }
        };
        info!(
            "rms inversion done: {} traces, {} trusted frequencies",
            posteriors.len(),
            trusted
        );
        Ok(PassSummary {
            traces: posteriors.len(),
            trusted_frequencies: trusted,
            regridded,
        })
    }

    fn solve_rms_trace(
        &self,
        trace: &RmsTrace,
        survey: &RmsSurvey,
        layout: &RmsLayout,
        ctx: &TraceContext,
        keep_above: bool,
    ) -> Result<Option<TracePosterior>> {
        let (i, j) = (trace.i, trace.j);
        let dims = ctx.dims;
        let simbox = ctx.simbox;
        let (top, base) = (simbox.top(i, j), simbox.base(i, j));
        let n_above = survey.above.nz;

        let stack = LayerStack {
            above: LayerBlock::new(0.0, top / n_above as f64, n_above, layout.n_pad_above)?,
            model: LayerBlock::new(top, simbox.dz(i, j), dims.nz, dims.nzp)?,
            below: LayerBlock::new(base, layout.dt_below, survey.below.nz, layout.n_pad_below)?,
        };
        let obs = match rms_observation(trace, &stack, survey.std_dev)? {
            Some(obs) => obs,
            None => return Ok(None),
        };

        let model = ctx.column_prior(i, j);
        let above = layout.above_prior(survey, model.mean[0], ctx.floor)?;
        let below = below_log_prior(
            model.mean[dims.nz - 1].exp(),
            survey.velocity_base,
            &survey.below,
            &layout.below_cov,
        )?;

        let prior = log_to_square(&block_diagonal(&[&above, &model, &below]));
        let mut post = condition(&prior, &obs)?;
        ctx.floor(&mut post, i, j);
        let post = square_to_log(&post)?;
        Ok(Some(TracePosterior {
            i,
            j,
            moments: post.block(stack.model_offset(), dims.nzp),
            above: keep_above.then(|| post.block(0, layout.n_pad_above)),
        }))
    }

    /// Solve every trace on the worker pool, keeping trace order.
    fn solve_traces<T, F>(&self, items: &[T], solve: F) -> Result<Vec<TracePosterior>>
    where
        T: Sync,
        F: Fn(&T) -> Result<Option<TracePosterior>> + Sync,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.get_num_threads())
            .build()
            .map_err(|e| InversionError::Other(e.to_string()))?;

        let total = items.len();
        let processed = AtomicU64::new(0);
        let last_progress = AtomicU64::new(0);
        let start_time = Instant::now();

        let results: Vec<Result<Option<TracePosterior>>> = pool.install(|| {
            items
                .par_iter()
                .map(|item| {
                    let result = solve(item);
                    let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
                    if let Some(cb) = &self.progress_callback {
                        let elapsed_ms = start_time.elapsed().as_millis() as u64;
                        let last = last_progress.load(Ordering::Relaxed);
                        if elapsed_ms >= last + 500
                            && last_progress
                                .compare_exchange(last, elapsed_ms, Ordering::Relaxed, Ordering::Relaxed)
                                .is_ok()
                        {
                            cb(ProgressInfo {
                                traces_processed: done,
                                total_traces: total,
                                elapsed: start_time.elapsed(),
                            });
                        }
                    }
                    result
                })
                .collect()
        });

        let mut posteriors = Vec::with_capacity(total);
        for result in results {
            if let Some(p) = result? {
                posteriors.push(p);
            }
        }
        debug!(
            "{} of {} traces solved in {:.2?}",
            posteriors.len(),
            total,
            start_time.elapsed()
        );
        Ok(posteriors)
    }

    /// Posterior expected velocity of the interval above the model,
    /// `nx × ny × n_above`.
    ///
    /// The prior is the trend of every lateral cell under the pass prior;
    /// the trace posteriors update it spectrally like the model interval.
    fn above_velocity(
        &self,
        survey: &RmsSurvey,
        layout: &RmsLayout,
        ctx: &TraceContext,
        posteriors: &[TracePosterior],
        lateral: &Array2<f64>,
    ) -> Result<Array3<f64>> {
        let simbox = ctx.simbox;
        let (nx, ny) = (simbox.nx(), simbox.ny());
        let n_above = survey.above.nz;
        let dims = GridDims::new(
            [nx, ny, n_above],
            [ctx.dims.nxp, ctx.dims.nyp, layout.n_pad_above],
        )?;

        let mut prior_mean = Array3::zeros((nx, ny, n_above));
        let mut prior_circulant = CirculantAccumulator::new(dims.nzp, n_above);
        for i in 0..nx {
            for j in 0..ny {
                let prior = layout.above_prior(survey, ctx.mean[[i, j, 0]], ctx.floor)?;
                for k in 0..n_above {
                    prior_mean[[i, j, k]] = prior.mean[k];
                }
                prior_circulant.add(&prior.cov)?;
            }
        }
        let prior_profile = prior_circulant.finalize()?;
        let prior_mean = Field3D::from_physical(dims, &prior_mean)?;
        let kernel = Field3D::stationary_covariance(dims, lateral, &prior_profile)?;

        let samples = TracePosterior::above_samples(posteriors);
        let mut dist = self.stationary(simbox, &samples, &prior_mean, &prior_profile)?;
        debug!(
            "above interval: {} traces, {} trusted frequencies",
            samples.len(),
            dist.filter.iter().filter(|&&f| f).count()
        );
        let mut above = SingleFieldModel::new(prior_mean, kernel)?;
        above.update(&mut dist)?;
        above.to_space()?;
        let variance = kernel_variance(&mut above.cov)?;
        Ok(expected_velocity(&above.mean.physical_values()?, variance))
    }

    /// Krige, aggregate and reduce trace posteriors to a stationary observation.
    fn stationary(
        &self,
        simbox: &Simbox,
        samples: &[(usize, usize, &Moments)],
        prior_mean: &Field3D,
        prior_profile: &[f64],
    ) -> Result<StationaryDistribution> {
        let dims = prior_mean.dims();
        let mut kriging = KrigingData::new(dims.nzp);
        let mut circulant = CirculantAccumulator::new(dims.nzp, dims.nz);
        for &(i, j, moments) in samples {
            kriging.add_profile(i, j, moments.mean.as_slice());
            circulant.add(&moments.cov)?;
        }
        let n_traces = circulant.traces();
        let posterior_profile = circulant.finalize()?;

        let variogram = ExponentialVariogram::exponential(self.config.kriging_range);
        let posterior_mean = krige_layers(&kriging, simbox, dims.nz, &variogram)?;
        let lateral = self.config.error_lateral(dims, simbox);
        let mut prior_mean = prior_mean.clone();
        StationaryDistribution::build(
            prior_profile,
            &posterior_profile,
            &mut prior_mean,
            &posterior_mean,
            n_traces,
            &lateral,
        )
    }

    /// Replace the geometry and resample every field that follows it.
    fn regrid(&self, state: &mut InversionState, ratio: &Array3<f64>) -> Result<()> {
        let distance = distance_grid(ratio, &state.simbox)?;
        let simbox = new_geometry(&state.simbox, &distance, self.config.lz_limit)?;
        let map = ResampleMap::new(&state.simbox, &simbox, &distance)?;

        map.apply_all(state.joint.means.iter_mut())?;
        if self.config.resample_covariances {
            map.apply_all(
                state
                    .joint
                    .variances
                    .iter_mut()
                    .chain(state.joint.cross.iter_mut()),
            )?;
        }
        if let Some(dynamic) = state.dynamic.as_mut() {
            map.apply(&mut dynamic.mean)?;
            if self.config.resample_covariances {
                map.apply(&mut dynamic.cov)?;
            }
        }
        map.apply_all(state.external.iter_mut())?;
        state.simbox = simbox;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MISSING;

    fn dims() -> GridDims {
        GridDims::padded([2, 2, 4], [0, 0, 4]).unwrap()
    }

    fn simbox() -> Simbox {
        Simbox::constant([2, 2], 4, (25.0, 25.0), 200.0, 40.0).unwrap()
    }

    fn kernel(dims: GridDims, variance: f64, range: f64, dt: f64) -> Field3D {
        let vario = ExponentialVariogram::exponential(range);
        let profile: Vec<f64> = circulant_correlation(dims.nzp, dt, &vario)
            .into_iter()
            .map(|c| c * variance)
            .collect();
        Field3D::stationary_covariance(dims, &lateral_identity(dims.nxp, dims.nyp), &profile)
            .unwrap()
    }

    fn joint(dims: GridDims) -> JointModel {
        JointModel::new(
            [
                Field3D::constant(dims, 2000.0f64.ln()),
                Field3D::constant(dims, 1000.0f64.ln()),
                Field3D::constant(dims, 2300.0f64.ln()),
            ],
            [
                kernel(dims, 0.01, 20.0, 10.0),
                kernel(dims, 0.01, 20.0, 10.0),
                kernel(dims, 0.01, 20.0, 10.0),
            ],
            [
                kernel(dims, 0.007, 20.0, 10.0),
                kernel(dims, 0.004, 20.0, 10.0),
                kernel(dims, 0.005, 20.0, 10.0),
            ],
        )
        .unwrap()
    }

    fn state() -> InversionState {
        let d = dims();
        let dynamic = SingleFieldModel::new(Field3D::constant(d, 0.0), kernel(d, 0.01, 20.0, 10.0))
            .unwrap();
        InversionState::new(simbox(), joint(d))
            .unwrap()
            .with_dynamic(dynamic)
            .unwrap()
    }

    fn horizons(push_down: f64) -> HorizonData {
        HorizonData {
            initial: vec![Horizon {
                name: "base".into(),
                times: Array2::from_elem((2, 2), 240.0),
            }],
            push_down: vec![PushDownHorizon {
                name: "base".into(),
                push_down: Array2::from_elem((2, 2), push_down),
                std_dev: 0.5,
            }],
        }
    }

    fn rms_survey(velocity: f64) -> RmsSurvey {
        let traces = [(0, 0), (1, 1)]
            .iter()
            .map(|&(i, j)| {
                RmsTrace::new(
                    i,
                    j,
                    vec![100.0, 220.0, 240.0, 280.0],
                    vec![velocity; 4],
                )
                .unwrap()
            })
            .collect();
        RmsSurvey {
            traces,
            std_dev: 20.0,
            above: IntervalPrior::new(5, 2500.0, 50.0).unwrap(),
            below: IntervalPrior::new(3, 2500.0, 50.0).unwrap(),
            below_thickness: 60.0,
            velocity_top: 2000.0,
            velocity_base: 2000.0,
        }
    }

    fn driver() -> TravelTimeInversion {
        TravelTimeInversion::new(InversionConfig::new().with_threads(2))
    }

    #[test]
    fn config_rejects_bad_values() {
        assert!(InversionConfig::new().with_kriging_range(0.0).is_err());
        assert!(InversionConfig::new().with_lz_limit(1.5).is_err());
        assert!(InversionConfig::new().with_mean_floor(-1.0).is_err());
        let c = InversionConfig::new().with_lz_limit(0.2).unwrap();
        assert_eq!(c.lz_limit(), 0.2);
        assert_eq!(c.kriging_range(), 2000.0);
    }

    #[test]
    fn unmatched_push_down_is_reported() {
        let mut data = horizons(2.0);
        data.push_down[0].name = "top".into();
        assert!(matches!(
            data.matched(),
            Err(InversionError::MissingHorizon(name)) if name == "top"
        ));
    }

    #[test]
    fn padded_profile_blends_back() {
        let p = pad_profile(&[1.0, 3.0], 4).unwrap();
        assert_eq!(p[..2], [1.0, 3.0]);
        assert!((p[2] - (3.0 - 2.0 / 3.0)).abs() < 1e-12);
    }

    #[test]
    fn delay_slows_the_velocity_change_field() {
        let mut st = state();
        let summary = driver().horizon_pass(&mut st, &horizons(2.0), false).unwrap();
        assert_eq!(summary.traces, 4);
        assert!(!summary.regridded);
        let change = st.dynamic.as_ref().unwrap().mean.physical_values().unwrap();
        assert!(change.iter().all(|v| v.is_finite()));
        let avg = change.iter().sum::<f64>() / change.len() as f64;
        assert!(avg < 0.0, "average change {}", avg);
    }

    #[test]
    fn missing_push_down_everywhere_leaves_field_alone() {
        let mut st = state();
        let summary = driver().horizon_pass(&mut st, &horizons(MISSING), true).unwrap();
        assert_eq!(summary.traces, 0);
        assert_eq!(st.simbox, simbox());
    }

    #[test]
    fn horizon_pass_without_change_field_fails() {
        let mut st = InversionState::new(simbox(), joint(dims())).unwrap();
        assert!(matches!(
            driver().horizon_pass(&mut st, &horizons(2.0), false),
            Err(InversionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rms_update_keeps_fields_finite_and_shrinks_variance() {
        let mut st = state();
        let prior_var = kernel_variance(&mut st.joint.variances[0]).unwrap();
        let summary = driver().rms_pass(&mut st, &rms_survey(1900.0), RmsMode::Update).unwrap();
        assert_eq!(summary.traces, 2);
        for f in st.joint.fields_mut() {
            assert!(f.padded_values().unwrap().iter().all(|v| v.is_finite()));
        }
        let post_var = kernel_variance(&mut st.joint.variances[0]).unwrap();
        assert!(post_var <= prior_var + 1e-12);
    }

    #[test]
    fn base_survey_maps_time_to_depth() {
        let mut st = state();
        let survey = SurveyData {
            time_lapse: 0,
            horizons: None,
            rms: Some(rms_survey(2000.0)),
        };
        let summaries = driver().run(&mut st, &survey).unwrap();
        assert_eq!(summaries.len(), 1);
        let mapping = st.depth_mapping.clone().unwrap();
        let depths = mapping.depths();
        assert_eq!(depths.dim(), (2, 2, 5));
        for i in 0..2 {
            for j in 0..2 {
                // 200 ms above the model at about 2000 m/s
                let top = depths[[i, j, 0]];
                assert!(top > 150.0 && top < 350.0, "top depth {}", top);
                for k in 0..4 {
                    assert!(depths[[i, j, k + 1]] > depths[[i, j, k]]);
                }
            }
        }

        // later base passes keep the first mapping
        driver().run(&mut st, &survey).unwrap();
        assert_eq!(st.depth_mapping.as_ref(), Some(&mapping));
    }

    #[test]
    fn monitor_survey_shifts_then_updates() {
        let mut st = state();
        let survey = SurveyData {
            time_lapse: 1,
            horizons: None,
            rms: Some(rms_survey(1900.0)),
        };
        let summaries = driver().run(&mut st, &survey).unwrap();
        assert_eq!(summaries.len(), 2);
        assert!(summaries[0].regridded);
        assert!(!summaries[1].regridded);
        assert_eq!(st.simbox.top_surface(), simbox().top_surface());
        assert!(st.simbox.base(0, 0).is_finite());
        assert!(st.depth_mapping.is_none());
    }

    #[test]
    fn trace_outside_grid_is_rejected() {
        let mut st = state();
        let mut survey = rms_survey(2000.0);
        survey.traces[0].i = 7;
        assert!(matches!(
            driver().rms_pass(&mut st, &survey, RmsMode::Update),
            Err(InversionError::ShapeMismatch { .. })
        ));
    }
}
