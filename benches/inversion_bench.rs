// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::Array2;

use traveltime_inversion::core::{GridDims, Simbox};
use traveltime_inversion::field::{lateral_identity, Field3D};
use traveltime_inversion::forward::RmsTrace;
use traveltime_inversion::inversion::{
    Horizon, HorizonData, InversionConfig, InversionState, PushDownHorizon, RmsMode, RmsSurvey,
    TravelTimeInversion,
};
use traveltime_inversion::joint::{JointModel, SingleFieldModel};
use traveltime_inversion::prior::{circulant_correlation, ExponentialVariogram, IntervalPrior};

const TOP: f64 = 1000.0;
const THICKNESS: f64 = 200.0;

fn kernel(dims: GridDims, variance: f64) -> Field3D {
    let dt = THICKNESS / dims.nz as f64;
    let vario = ExponentialVariogram::exponential(40.0);
    let profile: Vec<f64> = circulant_correlation(dims.nzp, dt, &vario)
        .into_iter()
        .map(|c| c * variance)
        .collect();
    Field3D::stationary_covariance(dims, &lateral_identity(dims.nxp, dims.nyp), &profile).unwrap()
}

fn make_state(n: usize, nz: usize) -> InversionState {
    let dims = GridDims::padded([n, n, nz], [n / 4, n / 4, nz / 2]).unwrap();
    let simbox = Simbox::constant([n, n], nz, (25.0, 25.0), TOP, THICKNESS).unwrap();
    let joint = JointModel::new(
        [
            Field3D::constant(dims, 2500.0f64.ln()),
            Field3D::constant(dims, 1200.0f64.ln()),
            Field3D::constant(dims, 2300.0f64.ln()),
        ],
        [kernel(dims, 0.01), kernel(dims, 0.01), kernel(dims, 0.005)],
        [kernel(dims, 0.007), kernel(dims, 0.004), kernel(dims, 0.005)],
    )
    .unwrap();
    let dynamic = SingleFieldModel::new(Field3D::constant(dims, 0.0), kernel(dims, 0.01)).unwrap();
    InversionState::new(simbox, joint)
        .unwrap()
        .with_dynamic(dynamic)
        .unwrap()
}

fn rms_survey(n: usize) -> RmsSurvey {
    let times: Vec<f64> = (1..=14).map(|k| 100.0 * k as f64).collect();
    let mut traces = Vec::with_capacity(n * n);
    for i in 0..n {
        for j in 0..n {
            let velocity = times
                .iter()
                .map(|t| 2000.0 + 0.4 * t + 5.0 * ((i + j) % 3) as f64)
                .collect();
            traces.push(RmsTrace::new(i, j, times.clone(), velocity).unwrap());
        }
    }
    RmsSurvey {
        traces,
        std_dev: 25.0,
        above: IntervalPrior::new(10, 4.0e4, 100.0).unwrap(),
        below: IntervalPrior::new(5, 4.0e4, 100.0).unwrap(),
        below_thickness: 200.0,
        velocity_top: 1800.0,
        velocity_base: 3000.0,
    }
}

fn horizon_data(n: usize) -> HorizonData {
    HorizonData {
        initial: vec![Horizon {
            name: "base".into(),
            times: Array2::from_elem((n, n), TOP + THICKNESS),
        }],
        push_down: vec![PushDownHorizon {
            name: "base".into(),
            push_down: Array2::from_shape_fn((n, n), |(i, j)| 2.0 + 0.05 * (i + j) as f64),
            std_dev: 0.5,
        }],
    }
}

fn driver(threads: usize) -> TravelTimeInversion {
    TravelTimeInversion::new(InversionConfig::new().with_threads(threads))
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// RMS update of a 16x16x40 model, one thread.
fn bench_rms_single_thread(c: &mut Criterion) {
    let survey = rms_survey(16);
    c.bench_function("rms_16x16x40_1thread", |b| {
        b.iter_with_setup(
            || make_state(16, 40),
            |mut state| {
                driver(1)
                    .rms_pass(&mut state, &survey, RmsMode::Update)
                    .unwrap();
                black_box(state)
            },
        );
    });
}

/// Thread scaling of the per-trace solves on a 32x32x40 model.
fn bench_rms_thread_scaling(c: &mut Criterion) {
    let cpus = num_cpus();
    let survey = rms_survey(32);
    let mut group = c.benchmark_group("rms_thread_scaling_32x32x40");
    group.sample_size(10);
    for &threads in &[1, 2, 4, 8] {
        if threads <= cpus {
            group.bench_function(format!("{}threads", threads), |b| {
                b.iter_with_setup(
                    || make_state(32, 40),
                    |mut state| {
                        driver(threads)
                            .rms_pass(&mut state, &survey, RmsMode::Update)
                            .unwrap();
                        black_box(state)
                    },
                );
            });
        }
    }
    group.finish();
}

/// Horizon pass with regridding on a 32x32x40 model.
fn bench_horizon_regrid(c: &mut Criterion) {
    let data = horizon_data(32);
    let cpus = num_cpus();
    c.bench_function("horizon_regrid_32x32x40", |b| {
        b.iter_with_setup(
            || make_state(32, 40),
            |mut state| {
                driver(cpus).horizon_pass(&mut state, &data, true).unwrap();
                black_box(state)
            },
        );
    });
}

criterion_group!(
    benches,
    bench_rms_single_thread,
    bench_rms_thread_scaling,
    bench_horizon_regrid
);
criterion_main!(benches);
