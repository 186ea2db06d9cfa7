// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::fmt;

use crate::field::{AccessMode, Domain};

/// Errors that can occur while building or running a traveltime inversion.
#[derive(Debug)]
pub enum InversionError {
    /// The innovation covariance of a linear-Gaussian update is not positive definite.
    SingularSystem {
        /// Dimension of the matrix that failed to factorize.
        dim: usize,
    },
    /// Array shape does not match expected shape.
    ShapeMismatch {
        /// The expected shape.
        expected: Vec<usize>,
        /// The actual shape encountered.
        got: Vec<usize>,
    },
    /// Grid shape is invalid (dimension too small).
    InvalidGridShape {
        /// The axis index.
        axis: usize,
        /// The size provided.
        size: usize,
    },
    /// Grid spacing or layer thickness is not positive and finite.
    InvalidGridSpacing(f64),
    /// A mean that is about to be log-transformed is not strictly positive.
    NonPositiveMean {
        /// Index of the offending entry.
        index: usize,
        /// The offending value.
        value: f64,
    },
    /// Observation standard deviation is negative or not finite.
    InvalidStandardDeviation(f64),
    /// No trace produced a posterior estimate, so nothing can be aggregated.
    NoValidTraces,
    /// A field was asked to enter an access mode while another mode is active.
    AccessConflict {
        /// The mode currently held.
        current: AccessMode,
        /// The mode that was requested.
        requested: AccessMode,
    },
    /// A field is in the wrong transform domain for the requested operation.
    WrongDomain {
        /// The domain the operation needs.
        expected: Domain,
    },
    /// A derived geometry violates the thickness-ratio limit.
    InvalidGeometry {
        /// Smallest min/max layer thickness ratio found.
        ratio: f64,
        /// The configured limit.
        limit: f64,
    },
    /// A push-down horizon has no initial horizon with the same name.
    MissingHorizon(String),
    /// Configuration value is out of range.
    InvalidConfig(String),
    /// Unsupported data type in file.
    UnsupportedDtype(String),
    /// Unsupported file format (unrecognized extension).
    UnsupportedFileFormat(String),
    /// I/O error occurred.
    IoError(std::io::Error),
    /// Other error with a descriptive message.
    Other(String),
}

impl fmt::Display for InversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InversionError::SingularSystem { dim } => {
                write!(
                    f,
                    "singular system: {}x{} innovation covariance is not positive definite",
                    dim, dim
                )
            }
            InversionError::ShapeMismatch { expected, got } => {
                write!(f, "shape mismatch: expected {:?}, got {:?}", expected, got)
            }
            InversionError::InvalidGridShape { axis, size } => {
                write!(
                    f,
                    "invalid grid shape: axis {} has size {} (must be >= 1)",
                    axis, size
                )
            }
            InversionError::InvalidGridSpacing(h) => {
                write!(
                    f,
                    "invalid grid spacing: {} (must be positive and finite)",
                    h
                )
            }
            InversionError::NonPositiveMean { index, value } => {
                write!(
                    f,
                    "non-positive mean at index {}: {} (log transform needs a positive mean)",
                    index, value
                )
            }
            InversionError::InvalidStandardDeviation(s) => {
                write!(
                    f,
                    "invalid standard deviation: {} (must be non-negative and finite)",
                    s
                )
            }
            InversionError::NoValidTraces => {
                write!(f, "no trace produced a posterior estimate")
            }
            InversionError::AccessConflict { current, requested } => {
                write!(
                    f,
                    "access conflict: cannot enter {:?} while field is in {:?} mode",
                    requested, current
                )
            }
            InversionError::WrongDomain { expected } => {
                write!(f, "wrong domain: operation requires a {:?}-domain field", expected)
            }
            InversionError::InvalidGeometry { ratio, limit } => {
                write!(
                    f,
                    "invalid geometry: thickness ratio {} is below the limit {}",
                    ratio, limit
                )
            }
            InversionError::MissingHorizon(name) => {
                write!(f, "no initial horizon named '{}'", name)
            }
            InversionError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            InversionError::UnsupportedDtype(dtype) => {
                write!(f, "unsupported dtype: {}", dtype)
            }
            InversionError::UnsupportedFileFormat(ext) => {
                write!(f, "unsupported file format: {}", ext)
            }
            InversionError::IoError(e) => write!(f, "I/O error: {}", e),
            InversionError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for InversionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InversionError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for InversionError {
    fn from(e: std::io::Error) -> Self {
        InversionError::IoError(e)
    }
}

/// Convenience type alias for Results with InversionError.
pub type Result<T> = std::result::Result<T, InversionError>;
