// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

//! Spectral Bayesian inversion of traveltime observations.
//!
//! Push-down horizons and RMS stacking velocities are inverted trace by
//! trace with exact linear-Gaussian updates. The per-trace posteriors are
//! then reduced to a depth-stationary virtual observation, kriged laterally,
//! and applied in the Fourier domain to the velocity field and two correlated
//! companion fields. When an inversion implies a shifted time axis, the
//! model is regridded onto a new vertical axis.

#![warn(missing_docs)]

/// Depth-stationary aggregation of per-trace posterior covariances.
pub mod circulant;
/// Linear-Gaussian conditioning.
pub mod conditioner;
/// Grid dimensions, geometry and shared helpers.
pub mod core;
/// Time-to-depth conversion from posterior velocities.
pub mod depth;
/// Error types for the library.
pub mod error;
/// Padded 3D fields with access-mode discipline and FFTs.
pub mod field;
/// Forward models of horizon and RMS observations.
pub mod forward;
/// Horizon and RMS inversion passes.
pub mod inversion;
/// File I/O for grids, surfaces and RMS cubes.
pub mod io;
/// Spectral updates of one field or three correlated fields.
pub mod joint;
/// Lateral kriging of per-trace posterior means.
pub mod kriging;
/// Log-normal moment transforms.
pub mod moments;
/// Prior assembly for per-trace solves.
pub mod prior;
/// Vertical regridding after an axis shift.
pub mod regrid;
/// Error spectra, trust filter and virtual observations.
pub mod spectral;

pub use crate::core::{GridDims, Simbox};
pub use crate::depth::TimeDepthMapping;
pub use crate::error::{InversionError, Result};
pub use crate::field::{AccessMode, Domain, Field3D};
pub use crate::inversion::{InversionConfig, InversionState, ProgressInfo, TravelTimeInversion};
pub use crate::joint::{JointModel, SingleFieldModel};
