// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use log::{debug, warn};
use ndarray::{Array2, Array3};
use num_complex::Complex64;
use rustfft::FftPlanner;

use crate::core::GridDims;
use crate::error::{InversionError, Result};
use crate::field::{AccessMode, Domain, Field3D};

/// A bin is trusted when `|Ĉ_pri| > FILTER_THRESHOLD · |Ĉ_post|`.
///
/// 1.04 rejects bins where the implied noise standard deviation exceeds five
/// times the signal standard deviation (`5 = sqrt(1 / 0.04)`).
pub const FILTER_THRESHOLD: f64 = 1.04;

/// Forward DFT of a real sequence.
pub fn forward_fft(values: &[f64]) -> Vec<Complex64> {
    let mut buffer: Vec<Complex64> = values.iter().map(|&v| Complex64::new(v, 0.0)).collect();
    if buffer.len() > 1 {
        FftPlanner::<f64>::new()
            .plan_fft_forward(buffer.len())
            .process(&mut buffer);
    }
    buffer
}

/// Inverse DFT normalised by `1/n`, keeping the real part.
pub fn inverse_fft_real(spectrum: &[Complex64]) -> Vec<f64> {
    let mut buffer = spectrum.to_vec();
    let n = buffer.len();
    if n > 1 {
        FftPlanner::<f64>::new().plan_fft_inverse(n).process(&mut buffer);
    }
    buffer.iter().map(|v| v.re / n as f64).collect()
}

/// Spectrum of a circulant covariance profile with the imaginary part removed.
pub fn circulant_spectrum(profile: &[f64]) -> Vec<Complex64> {
    forward_fft(profile)
        .into_iter()
        .map(|v| Complex64::new(v.re, 0.0))
        .collect()
}

/// Number of independent bins of a real sequence of length `n`.
fn half_len(n: usize) -> usize {
    n / 2 + 1
}

/// Spectrum of the virtual observation noise.
///
/// `var_e = Ĉ_pri (conj(Ĉ_pri) − Ĉ_pri + Ĉ_post) / (Ĉ_pri − Ĉ_post)` per bin.
/// A negative (or undefined) value at bin 0 means the update has little or no
/// effect and is logged; higher bins that are not positive take the
/// previous bin's value. Imaginary parts are dropped and the result is
/// mirrored to the negative frequencies.
pub fn error_variance(prior: &[Complex64], posterior: &[Complex64]) -> Result<Vec<Complex64>> {
    check_len(prior.len(), posterior.len())?;
    let n = prior.len();
    let half = half_len(n).min(n);
    let mut var_e = vec![Complex64::new(0.0, 0.0); n];

    for f in 0..half {
        let (pri, post) = (prior[f], posterior[f]);
        var_e[f] = pri * (pri.conj() - pri + post) / (pri - post);
    }

    if half > 0 {
        let v0 = var_e[0];
        if !v0.re.is_finite() {
            warn!("travel-time update has no effect: error variance undefined at zero frequency");
            var_e[0] = Complex64::new(0.0, 0.0);
        } else if v0.re < 0.0 {
            warn!(
                "travel-time update has little or no effect: error variance {:.4e} at zero frequency",
                v0.re
            );
        }
    }
    let mut substituted = 0;
    for f in 1..half {
        let mut re = var_e[f].re;
        if !(re > 0.0 && re.is_finite()) {
            re = var_e[f - 1].re;
            substituted += 1;
        }
        var_e[f] = Complex64::new(re, 0.0);
    }
    if substituted > 0 {
        debug!("error variance substituted at {} of {} bins", substituted, half);
    }
    mirror_conj(&mut var_e);
    Ok(var_e)
}

/// Trust mask per vertical frequency, Hermitian-mirrored.
pub fn observation_filter(prior: &[Complex64], posterior: &[Complex64]) -> Result<Vec<bool>> {
    check_len(prior.len(), posterior.len())?;
    let n = prior.len();
    let half = half_len(n).min(n);
    let mut filter = vec![false; n];
    for f in 0..half {
        filter[f] = prior[f].norm() > posterior[f].norm() * FILTER_THRESHOLD;
    }
    for f in half..n {
        filter[f] = filter[n - f];
    }
    Ok(filter)
}

/// Per-bin multiplier `(Ĉ_pri + var_e) / conj(Ĉ_pri)`, conjugate-mirrored.
///
/// Bins where the multiplier is undefined are set to zero.
pub fn observation_gain(prior: &[Complex64], var_e: &[Complex64]) -> Result<Vec<Complex64>> {
    check_len(prior.len(), var_e.len())?;
    let n = prior.len();
    let mut gain: Vec<Complex64> = prior
        .iter()
        .zip(var_e.iter())
        .map(|(&pri, &e)| {
            let g = (pri + e) / pri.conj();
            if g.re.is_finite() && g.im.is_finite() {
                g
            } else {
                Complex64::new(0.0, 0.0)
            }
        })
        .collect();
    if n > 0 {
        mirror_conj(&mut gain);
    }
    Ok(gain)
}

fn mirror_conj(values: &mut [Complex64]) {
    let n = values.len();
    for f in half_len(n)..n {
        values[f] = values[n - f].conj();
    }
}

fn check_len(a: usize, b: usize) -> Result<()> {
    if a != b {
        return Err(InversionError::ShapeMismatch {
            expected: vec![a],
            got: vec![b],
        });
    }
    Ok(())
}

/// Virtual observation `d = μ_pri + gain[kz] · (μ_post − μ_pri)` per cell.
///
/// Both means must be in the frequency domain; the result is too.
pub fn stationary_observations(
    prior_mean: &mut Field3D,
    posterior_mean: &mut Field3D,
    gain: &[Complex64],
) -> Result<Field3D> {
    let dims = prior_mean.dims();
    if posterior_mean.dims() != dims {
        return Err(InversionError::ShapeMismatch {
            expected: dims.padded_shape().to_vec(),
            got: posterior_mean.dims().padded_shape().to_vec(),
        });
    }
    check_len(dims.nzp, gain.len())?;
    for f in [&*prior_mean, &*posterior_mean] {
        if f.domain() != Domain::Frequency {
            return Err(InversionError::WrongDomain {
                expected: Domain::Frequency,
            });
        }
    }

    let mut observations = Field3D::zeros_frequency(dims);
    {
        let pri = prior_mean.access(AccessMode::Read)?;
        let post = posterior_mean.access(AccessMode::Read)?;
        let mut out = observations.access(AccessMode::Write)?;
        for k in 0..dims.nzp {
            for j in 0..dims.nyp {
                for i in 0..dims.nxp {
                    let p = pri.complex(i, j, k);
                    let d = p + gain[k] * (post.complex(i, j, k) - p);
                    out.set_complex(i, j, k, d);
                }
            }
        }
    }
    Ok(observations)
}

/// Space-domain noise covariance kernel of the virtual observation.
///
/// The vertical profile is `ifft(var_e) · n_cells / n_traces`, inflating the
/// noise by how sparsely traces cover the lateral grid, and is spread
/// laterally with `lateral` (`nxp × nyp`).
pub fn noise_covariance(
    dims: GridDims,
    var_e: &[Complex64],
    n_traces: usize,
    lateral: &Array2<f64>,
) -> Result<Field3D> {
    if n_traces == 0 {
        return Err(InversionError::NoValidTraces);
    }
    check_len(dims.nzp, var_e.len())?;
    let factor = dims.lateral_cells() as f64 / n_traces as f64;
    let profile: Vec<f64> = inverse_fft_real(var_e)
        .into_iter()
        .map(|v| v * factor)
        .collect();
    Field3D::stationary_covariance(dims, lateral, &profile)
}

/// Everything the spectral update needs from the trace loop.
#[derive(Debug, Clone)]
pub struct StationaryDistribution {
    /// Virtual observation, frequency domain.
    pub observations: Field3D,
    /// Noise covariance kernel of the virtual observation, frequency domain.
    pub noise: Field3D,
    /// Trust mask over vertical frequencies.
    pub filter: Vec<bool>,
}

impl StationaryDistribution {
    /// Reduce the trace-loop results to a stationary observation.
    ///
    /// - `prior_profile`, `posterior_profile`: prior and averaged posterior
    ///   circulant covariance profiles (length `nzp`).
    /// - `prior_mean`: prior mean field, either domain; left in the frequency domain.
    /// - `posterior_mean`: kriged posterior means over the physical grid.
    /// - `n_traces`: traces that contributed a posterior.
    /// - `lateral`: lateral correlation of the observation error.
    pub fn build(
        prior_profile: &[f64],
        posterior_profile: &[f64],
        prior_mean: &mut Field3D,
        posterior_mean: &Array3<f64>,
        n_traces: usize,
        lateral: &Array2<f64>,
    ) -> Result<Self> {
        let dims = prior_mean.dims();
        check_len(dims.nzp, prior_profile.len())?;
        check_len(dims.nzp, posterior_profile.len())?;

        let prior = circulant_spectrum(prior_profile);
        let posterior = circulant_spectrum(posterior_profile);
        let var_e = error_variance(&prior, &posterior)?;
        let filter = observation_filter(&prior, &posterior)?;
        let gain = observation_gain(&prior, &var_e)?;
        debug!(
            "{} of {} vertical frequencies trusted",
            filter.iter().filter(|&&f| f).count(),
            filter.len()
        );

        let mut post_mean = Field3D::from_physical(dims, posterior_mean)?;
        post_mean.fft_in_place()?;
        prior_mean.ensure_frequency()?;
        let observations = stationary_observations(prior_mean, &mut post_mean, &gain)?;

        let mut noise = noise_covariance(dims, &var_e, n_traces, lateral)?;
        noise.fft_in_place()?;

        Ok(StationaryDistribution {
            observations,
            noise,
            filter,
        })
    }

    /// True if no frequency carries a trusted correction.
    pub fn is_inert(&self) -> bool {
        !self.filter.iter().any(|&f| f)
    }
}
