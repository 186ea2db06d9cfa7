// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use nalgebra::{DMatrix, DVector};
use ndarray::Array3;

use traveltime_inversion::circulant::circulant_profile;
use traveltime_inversion::conditioner::{condition, Observation};
use traveltime_inversion::core::{GridDims, Simbox};
use traveltime_inversion::field::{lateral_identity, Field3D};
use traveltime_inversion::forward::{
    horizon_observation, rms_observation, rms_operator, squared_data, HorizonSample, LayerBlock,
    LayerStack, RmsTrace, TraceColumn,
};
use traveltime_inversion::joint::JointModel;
use traveltime_inversion::moments::{
    inverse_to_log, linear_to_log, log_to_inverse, log_to_linear, Moments,
};
use traveltime_inversion::prior::{circulant_correlation, ExponentialVariogram};
use traveltime_inversion::regrid::{distance_grid, new_geometry, resample_column, ResampleMap};
use traveltime_inversion::spectral::{circulant_spectrum, observation_filter, StationaryDistribution};

/// Deterministic pseudo-random numbers in [-0.5, 0.5).
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> f64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.0 >> 33) as f64 / (1u64 << 31) as f64) - 0.5
    }
}

fn random_spd(n: usize, rng: &mut Lcg) -> DMatrix<f64> {
    let a = DMatrix::from_fn(n, n, |_, _| rng.next());
    &a * a.transpose() + DMatrix::identity(n, n) * 0.1
}

/// A 20 ms push-down over ten 4 ms layers with a noise-free pick and a fully
/// correlated prior fixes every layer's slowness ratio at 60 / 40.
#[test]
fn horizon_delay_recovers_constant_velocity() {
    let n = 10;
    let sigma2 = 0.01;
    let prior_log = Moments::new(DVector::zeros(n), DMatrix::from_element(n, n, sigma2)).unwrap();
    let column = TraceColumn {
        top: 100.0,
        base: 140.0,
        nz: n,
        nzp: n,
    };
    let samples = [HorizonSample {
        initial_time: 140.0,
        push_down: 20.0,
        std_dev: 0.0,
    }];
    let obs = horizon_observation(&samples, &column).unwrap().unwrap();
    assert_eq!(obs.data[0], 60.0);

    let post = condition(&log_to_inverse(&prior_log), &obs).unwrap();
    for &y in post.mean.iter() {
        assert!((y - 1.5).abs() / 1.5 < 1e-6, "Vp0/Vp1 = {}", y);
    }

    let post_log = inverse_to_log(&post).unwrap();
    let vp0 = 2000.0;
    for &x in post_log.mean.iter() {
        let vp1 = vp0 * x.exp();
        assert!((vp1 - vp0 / 1.5).abs() / (vp0 / 1.5) < 1e-6, "vp1 = {}", vp1);
    }
}

/// With the data standard deviation equal to the RMS velocity, the unbiased
/// squared datum is exactly zero.
#[test]
fn rms_bias_correction_cancels() {
    assert_eq!(squared_data(&[30.0], 30.0)[0], 0.0);

    let stack = LayerStack {
        above: LayerBlock::new(0.0, 20.0, 5, 6).unwrap(),
        model: LayerBlock::new(100.0, 4.0, 10, 12).unwrap(),
        below: LayerBlock::new(140.0, 20.0, 3, 4).unwrap(),
    };
    let trace = RmsTrace::new(0, 0, vec![120.0], vec![1800.0]).unwrap();
    let obs = rms_observation(&trace, &stack, 1800.0).unwrap().unwrap();
    assert_eq!(obs.data[0], 0.0);
}

/// Identical prior and posterior spectra carry no information: nothing is
/// trusted and the joint model is left as it was.
#[test]
fn identical_spectra_leave_the_model_unchanged() {
    let dims = GridDims::padded([3, 2, 6], [1, 2, 4]).unwrap();
    let vario = ExponentialVariogram::exponential(12.0);
    let profile: Vec<f64> = circulant_correlation(dims.nzp, 4.0, &vario)
        .into_iter()
        .map(|c| 0.01 * c)
        .collect();
    let lateral = lateral_identity(dims.nxp, dims.nyp);
    let kernel = |scale: f64| {
        let p: Vec<f64> = profile.iter().map(|c| c * scale).collect();
        Field3D::stationary_covariance(dims, &lateral, &p).unwrap()
    };
    let mean = |v: f64| {
        let values = Array3::from_shape_fn((dims.nx, dims.ny, dims.nz), |(i, j, k)| {
            v + 0.01 * (i + 2 * j + 3 * k) as f64
        });
        Field3D::from_physical(dims, &values).unwrap()
    };
    let mut model = JointModel::new(
        [mean(7.6), mean(6.9), mean(7.7)],
        [kernel(1.0), kernel(1.0), kernel(0.5)],
        [kernel(0.7), kernel(0.3), kernel(0.4)],
    )
    .unwrap();
    let before: Vec<Array3<f64>> = model
        .fields_mut()
        .map(|f| f.padded_values().unwrap())
        .collect();

    let posterior_mean = Array3::from_elem((dims.nx, dims.ny, dims.nz), 7.0);
    let mut prior_mean = model.means[0].clone();
    let mut dist = StationaryDistribution::build(
        &profile,
        &profile,
        &mut prior_mean,
        &posterior_mean,
        dims.nx * dims.ny,
        &lateral,
    )
    .unwrap();
    assert!(dist.filter.iter().all(|&f| !f));
    assert!(dist.is_inert());

    model.update(&mut dist).unwrap();
    model.to_space().unwrap();
    for (field, b) in model.fields_mut().zip(before.iter()) {
        let after = field.padded_values().unwrap();
        for (x, y) in after.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-10);
        }
    }
}

#[test]
fn conditioning_limits() {
    let mut rng = Lcg(7);
    let n = 4;
    let prior = Moments::new(
        DVector::from_fn(n, |_, _| rng.next()),
        random_spd(n, &mut rng),
    )
    .unwrap();
    let g = random_spd(n, &mut rng);
    let d = DVector::from_fn(n, |_, _| rng.next() * 10.0);

    // tiny noise: the data are reproduced
    let exact = Observation::new(g.clone(), d.clone(), DMatrix::identity(n, n) * 1e-12).unwrap();
    let post = condition(&prior, &exact).unwrap();
    let expected = g.clone().lu().solve(&d).unwrap();
    for (a, b) in post.mean.iter().zip(expected.iter()) {
        assert!((a - b).abs() < 1e-5, "{} vs {}", a, b);
    }

    // huge noise: the prior survives
    let vague = Observation::new(g, d, DMatrix::identity(n, n) * 1e14).unwrap();
    let post = condition(&prior, &vague).unwrap();
    for (a, b) in post.mean.iter().zip(prior.mean.iter()) {
        assert!((a - b).abs() < 1e-8);
    }
    for (a, b) in post.cov.iter().zip(prior.cov.iter()) {
        assert!((a - b).abs() < 1e-8);
    }
}

#[test]
fn moment_transforms_invert_each_other() {
    let mut rng = Lcg(11);
    for n in [1, 3, 8] {
        let cov = random_spd(n, &mut rng) * 0.05;
        let log = Moments::new(DVector::from_fn(n, |_, _| 7.0 + rng.next()), cov).unwrap();
        let back = linear_to_log(&log_to_linear(&log)).unwrap();
        for (a, b) in back.mean.iter().zip(log.mean.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
        for (a, b) in back.cov.iter().zip(log.cov.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }
}

#[test]
fn circulant_profiles_are_symmetric() {
    let mut rng = Lcg(3);
    for n in [5, 6, 16, 25] {
        let p = circulant_profile(&random_spd(n, &mut rng), n - 1);
        for i in 1..n {
            assert_eq!(p[i], p[n - i]);
        }
    }
}

#[test]
fn trust_filter_is_hermitian() {
    for n in [8, 9, 12] {
        let pri = circulant_correlation(n, 4.0, &ExponentialVariogram::exponential(10.0));
        let post: Vec<f64> = circulant_correlation(n, 4.0, &ExponentialVariogram::exponential(3.0))
            .into_iter()
            .map(|c| 0.6 * c)
            .collect();
        let filter =
            observation_filter(&circulant_spectrum(&pri), &circulant_spectrum(&post)).unwrap();
        for f in 1..n {
            assert_eq!(filter[f], filter[n - f], "n = {}, f = {}", n, f);
        }
    }
}

#[test]
fn resample_map_is_monotone() {
    let mut rng = Lcg(13);
    for _ in 0..20 {
        let distance: Vec<f64> = (0..15).map(|_| 0.2 + 4.0 * (rng.next() + 0.5)).collect();
        let total: f64 = distance.iter().sum();
        let map = resample_column(&distance, 4.0, total / 15.0);
        for w in map.windows(2) {
            assert!(w[1] >= w[0]);
        }
    }
}

#[test]
fn regrid_resamples_onto_the_new_axis() {
    let simbox = Simbox::constant([2, 2], 6, (25.0, 25.0), 500.0, 24.0).unwrap();
    let ratio = Array3::from_shape_fn((2, 2, 6), |(i, _, _)| 1.0 + 0.1 * i as f64);
    let distance = distance_grid(&ratio, &simbox).unwrap();
    let derived = new_geometry(&simbox, &distance, 0.41).unwrap();
    assert!((derived.base(1, 0) - (500.0 + 24.0 * 1.1)).abs() < 1e-9);

    let map = ResampleMap::new(&simbox, &derived, &distance).unwrap();
    let dims = GridDims::padded([2, 2, 6], [0, 0, 2]).unwrap();
    let mut field = Field3D::constant(dims, 3.0);
    map.apply(&mut field).unwrap();
    // a constant stays constant
    assert!(field.physical_values().unwrap().iter().all(|&v| (v - 3.0).abs() < 1e-12));
}

#[test]
fn rms_boundary_samples_resolve_to_one_layer() {
    let stack = LayerStack {
        above: LayerBlock::new(0.0, 20.0, 5, 5).unwrap(),
        model: LayerBlock::new(100.0, 4.0, 10, 10).unwrap(),
        below: LayerBlock::new(140.0, 20.0, 3, 3).unwrap(),
    };
    // exactly on the base of the second model layer, and a hair above it
    let times = [108.0, 108.0 - 1e-12];
    let g = rms_operator(&times, &stack);
    for row in 0..2 {
        let t = times[row];
        for k in 0..5 {
            assert!((g[(row, k)] - 20.0 / t).abs() < 1e-12);
        }
        assert!((g[(row, 5)] - 4.0 / t).abs() < 1e-12);
        assert!((g[(row, 6)] - 4.0 / t).abs() < 1e-12);
        assert!(g[(row, 7)].abs() < 1e-9);
        let sum: f64 = g.row(row).iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }
}

#[test]
fn module_docs_are_declared_in_lib() {
    let src = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("src");
    for entry in std::fs::read_dir(&src).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().map_or(true, |e| e != "rs") || path.ends_with("lib.rs") {
            continue;
        }
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(
            !text.lines().any(|l| l.starts_with("//!")),
            "{} carries inner module docs",
            path.display()
        );
    }
}
