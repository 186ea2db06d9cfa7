// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use nalgebra::DMatrix;

use crate::error::{InversionError, Result};

/// Lag profile of a covariance matrix.
///
/// Entry `lag` averages `cov(i, i + lag)` over the rows `i < n_nopad` of the
/// upper triangle; lags `i` and `n − i` are then averaged together for
/// `1 ≤ i < n/2` so the profile is circulant.
pub fn circulant_profile(cov: &DMatrix<f64>, n_nopad: usize) -> Vec<f64> {
    let n = cov.nrows();
    let mut sum = vec![0.0; n];
    let mut count = vec![0usize; n];
    for i in 0..n_nopad.min(n) {
        for j in i..n {
            sum[j - i] += cov[(i, j)];
            count[j - i] += 1;
        }
    }
    let mut profile: Vec<f64> = sum
        .iter()
        .zip(count.iter())
        .map(|(&s, &c)| if c > 0 { s / c as f64 } else { 0.0 })
        .collect();
    for i in 1..(n + 1) / 2 {
        let avg = 0.5 * (profile[i] + profile[n - i]);
        profile[i] = avg;
        profile[n - i] = avg;
    }
    profile
}

/// Running sum of circulant profiles over traces.
///
/// The sum is divided by the number of traces once, in [`finalize`](Self::finalize).
#[derive(Debug, Clone)]
pub struct CirculantAccumulator {
    sum: Vec<f64>,
    n_nopad: usize,
    traces: usize,
}

impl CirculantAccumulator {
    /// Start an empty accumulator over `n` padded layers of which `n_nopad` are physical.
    pub fn new(n: usize, n_nopad: usize) -> Self {
        CirculantAccumulator {
            sum: vec![0.0; n],
            n_nopad,
            traces: 0,
        }
    }

    /// Add one trace's posterior covariance.
    ///
    /// # Errors
    /// Returns an error if the covariance is not `n × n`.
    pub fn add(&mut self, cov: &DMatrix<f64>) -> Result<()> {
        let n = self.sum.len();
        if cov.nrows() != n || cov.ncols() != n {
            return Err(InversionError::ShapeMismatch {
                expected: vec![n, n],
                got: vec![cov.nrows(), cov.ncols()],
            });
        }
        for (s, c) in self.sum.iter_mut().zip(circulant_profile(cov, self.n_nopad)) {
            *s += c;
        }
        self.traces += 1;
        Ok(())
    }

    /// Number of traces added so far.
    pub fn traces(&self) -> usize {
        self.traces
    }

    /// Average profile over all added traces.
    ///
    /// # Errors
    /// Returns [`InversionError::NoValidTraces`] if nothing was added.
    pub fn finalize(self) -> Result<Vec<f64>> {
        if self.traces == 0 {
            return Err(InversionError::NoValidTraces);
        }
        let n = self.traces as f64;
        Ok(self.sum.into_iter().map(|s| s / n).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prior::toeplitz;

    fn random_spd(n: usize, seed: u64) -> DMatrix<f64> {
        let mut state = seed;
        let a = DMatrix::from_fn(n, n, |_, _| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 33) as f64 / (1u64 << 31) as f64) - 0.5
        });
        &a * a.transpose()
    }

    #[test]
    fn profile_is_symmetric() {
        for n in [7, 8, 12] {
            let p = circulant_profile(&random_spd(n, n as u64), n - 2);
            for i in 1..n {
                assert!((p[i] - p[n - i]).abs() < 1e-15, "n = {}, lag {}", n, i);
            }
        }
    }

    #[test]
    fn stationary_input_is_reproduced() {
        let profile = [4.0, 2.0, 1.0, 0.5, 1.0, 2.0];
        let p = circulant_profile(&toeplitz(&profile), 6);
        for (a, b) in p.iter().zip(profile.iter()) {
            assert!((a - b).abs() < 1e-15);
        }
    }

    #[test]
    fn only_physical_rows_are_averaged() {
        let mut cov = DMatrix::zeros(4, 4);
        cov[(0, 0)] = 2.0;
        cov[(1, 1)] = 4.0;
        cov[(3, 3)] = 100.0;
        let p = circulant_profile(&cov, 2);
        assert_eq!(p[0], 3.0);
    }

    #[test]
    fn accumulator_averages_once() {
        let mut acc = CirculantAccumulator::new(4, 4);
        acc.add(&(DMatrix::identity(4, 4) * 2.0)).unwrap();
        acc.add(&(DMatrix::identity(4, 4) * 4.0)).unwrap();
        assert_eq!(acc.traces(), 2);
        let p = acc.finalize().unwrap();
        assert_eq!(p, vec![3.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn accumulation_order_does_not_matter() {
        let covs: Vec<_> = (0..5).map(|s| random_spd(6, 100 + s)).collect();
        let mut forward = CirculantAccumulator::new(6, 5);
        let mut backward = CirculantAccumulator::new(6, 5);
        for c in &covs {
            forward.add(c).unwrap();
        }
        for c in covs.iter().rev() {
            backward.add(c).unwrap();
        }
        let (a, b) = (forward.finalize().unwrap(), backward.finalize().unwrap());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn empty_accumulator_is_an_error() {
        let acc = CirculantAccumulator::new(4, 4);
        assert!(matches!(acc.finalize(), Err(InversionError::NoValidTraces)));
    }

    #[test]
    fn wrong_size_rejected() {
        let mut acc = CirculantAccumulator::new(4, 4);
        assert!(acc.add(&DMatrix::zeros(3, 3)).is_err());
    }
}
