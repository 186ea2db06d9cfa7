// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::path::Path;

use ndarray::{Array1, Array2, Array3, ArrayD, Dimension};

use crate::core::{is_missing, GridDims};
use crate::error::{InversionError, Result};
use crate::field::Field3D;
use crate::forward::RmsTrace;

/// Supported file formats for grid I/O.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FileFormat {
    /// NumPy .npy format.
    Npy,
}

/// Infer file format from extension.
pub fn infer_format(path: &Path) -> Result<FileFormat> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("npy") => Ok(FileFormat::Npy),
        Some(ext) => Err(InversionError::UnsupportedFileFormat(ext.to_string())),
        None => Err(InversionError::UnsupportedFileFormat(
            "(no extension)".to_string(),
        )),
    }
}

/// Read an f64 or f32 .npy array of any rank.
fn read_npy_any(path: &Path) -> Result<ArrayD<f64>> {
    let FileFormat::Npy = infer_format(path)?;
    let arr: ArrayD<f64> = match ndarray_npy::read_npy(path) {
        Ok(a) => a,
        Err(_) => {
            let arr32: ArrayD<f32> = ndarray_npy::read_npy(path)
                .map_err(|e| InversionError::UnsupportedDtype(format!("{}", e)))?;
            arr32.mapv(|v| v as f64)
        }
    };
    // Fortran-order files come back column-major otherwise.
    Ok(arr.as_standard_layout().to_owned())
}

/// Read an array and check its shape.
fn read_npy_f64(path: &Path, expected_shape: &[usize]) -> Result<ArrayD<f64>> {
    let arr = read_npy_any(path)?;
    if arr.shape() != expected_shape {
        return Err(InversionError::ShapeMismatch {
            expected: expected_shape.to_vec(),
            got: arr.shape().to_vec(),
        });
    }
    Ok(arr)
}

fn into_dim<D: Dimension>(arr: ArrayD<f64>) -> Result<ndarray::Array<f64, D>> {
    arr.into_dimensionality::<D>()
        .map_err(|e| InversionError::Other(format!("shape error: {}", e)))
}

/// Load a vector, e.g. the sample times of an RMS cube.
pub fn load_vector(path: &Path, len: usize) -> Result<Array1<f64>> {
    into_dim(read_npy_f64(path, &[len])?)
}

/// Load a vector of unknown length.
pub fn load_vector_any(path: &Path) -> Result<Array1<f64>> {
    into_dim(read_npy_any(path)?)
}

/// Load a lateral surface such as a horizon or a push-down map.
pub fn load_surface(path: &Path, shape: [usize; 2]) -> Result<Array2<f64>> {
    into_dim(read_npy_f64(path, &shape)?)
}

/// Load a 3D array with the given shape.
pub fn load_array3(path: &Path, shape: [usize; 3]) -> Result<Array3<f64>> {
    into_dim(read_npy_f64(path, &shape)?)
}

/// Load the physical block of a field and pad it to `dims`.
pub fn load_field(path: &Path, dims: GridDims) -> Result<Field3D> {
    let values = load_array3(path, dims.physical())?;
    Field3D::from_physical(dims, &values)
}

/// Load a velocity cube and return its natural log.
///
/// # Errors
/// Returns [`InversionError::NonPositiveMean`] for a velocity that is not
/// strictly positive.
pub fn load_log_velocity(path: &Path, dims: GridDims) -> Result<Field3D> {
    let velocity = load_array3(path, dims.physical())?;
    Field3D::from_physical(dims, &velocity_to_log(&velocity)?)
}

/// Element-wise `ln(v)`, rejecting non-positive velocities.
pub fn velocity_to_log(velocity: &Array3<f64>) -> Result<Array3<f64>> {
    if let Some((index, &value)) = velocity
        .iter()
        .enumerate()
        .find(|(_, &v)| !v.is_finite() || v <= 0.0)
    {
        return Err(InversionError::NonPositiveMean { index, value });
    }
    Ok(velocity.mapv(f64::ln))
}

/// Save an array to a file, inferring format from extension.
pub fn save_array3(array: &Array3<f64>, path: &Path) -> Result<()> {
    let FileFormat::Npy = infer_format(path)?;
    ndarray_npy::write_npy(path, array)
        .map_err(|e| InversionError::Other(format!("npy write error: {}", e)))
}

/// Save a lateral surface.
pub fn save_surface(surface: &Array2<f64>, path: &Path) -> Result<()> {
    let FileFormat::Npy = infer_format(path)?;
    ndarray_npy::write_npy(path, surface)
        .map_err(|e| InversionError::Other(format!("npy write error: {}", e)))
}

/// Save the physical block of a space-domain field.
pub fn save_field(field: &Field3D, path: &Path) -> Result<()> {
    save_array3(&field.physical_values()?, path)
}

/// Split an `nx × ny × n_samples` RMS velocity cube into traces.
///
/// Columns where every velocity is missing produce no trace.
pub fn rms_traces_from_cube(times: &[f64], cube: &Array3<f64>) -> Result<Vec<RmsTrace>> {
    let (nx, ny, ns) = cube.dim();
    if ns != times.len() {
        return Err(InversionError::ShapeMismatch {
            expected: vec![nx, ny, times.len()],
            got: vec![nx, ny, ns],
        });
    }
    let mut traces = Vec::new();
    for i in 0..nx {
        for j in 0..ny {
            let velocity: Vec<f64> = (0..ns).map(|k| cube[[i, j, k]]).collect();
            if velocity.iter().all(|&v| is_missing(v)) {
                continue;
            }
            traces.push(RmsTrace::new(i, j, times.to_vec(), velocity)?);
        }
    }
    Ok(traces)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MISSING;

    #[test]
    fn npy_roundtrip() {
        let values = Array3::from_shape_fn((3, 2, 4), |(i, j, k)| (i * 8 + j * 4 + k) as f64);
        let tmp = std::env::temp_dir().join("traveltime_test_roundtrip.npy");
        save_array3(&values, &tmp).unwrap();
        let loaded = load_array3(&tmp, [3, 2, 4]).unwrap();
        assert_eq!(loaded, values);
        std::fs::remove_file(&tmp).ok();
    }

    #[test]
    fn npy_shape_mismatch() {
        let values = Array3::<f64>::zeros((2, 2, 2));
        let tmp = std::env::temp_dir().join("traveltime_test_shape_mismatch.npy");
        save_array3(&values, &tmp).unwrap();
        let result = load_array3(&tmp, [2, 2, 3]);
        assert!(matches!(result, Err(InversionError::ShapeMismatch { .. })));
        std::fs::remove_file(&tmp).ok();
    }

    #[test]
    fn f32_files_are_promoted() {
        let values = Array2::<f32>::from_elem((2, 3), 1.5);
        let tmp = std::env::temp_dir().join("traveltime_test_f32.npy");
        ndarray_npy::write_npy(&tmp, &values).unwrap();
        let loaded = load_surface(&tmp, [2, 3]).unwrap();
        assert!(loaded.iter().all(|&v| v == 1.5));
        std::fs::remove_file(&tmp).ok();
    }

    #[test]
    fn field_roundtrip_keeps_physical_block() {
        let dims = GridDims::padded([2, 2, 3], [1, 1, 2]).unwrap();
        let values = Array3::from_shape_fn((2, 2, 3), |(i, j, k)| 1.0 + (i + j + k) as f64);
        let tmp = std::env::temp_dir().join("traveltime_test_field.npy");
        save_array3(&values, &tmp).unwrap();
        let field = load_field(&tmp, dims).unwrap();
        assert_eq!(field.physical_values().unwrap(), values);
        std::fs::remove_file(&tmp).ok();
    }

    #[test]
    fn log_velocity_rejects_non_positive() {
        let mut v = Array3::from_elem((1, 1, 3), 2000.0);
        v[[0, 0, 1]] = 0.0;
        assert!(matches!(
            velocity_to_log(&v),
            Err(InversionError::NonPositiveMean { index: 1, .. })
        ));
    }

    #[test]
    fn empty_columns_are_skipped() {
        let mut cube = Array3::from_elem((2, 1, 2), 2000.0);
        cube[[1, 0, 0]] = MISSING;
        cube[[1, 0, 1]] = MISSING;
        let traces = rms_traces_from_cube(&[100.0, 200.0], &cube).unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!((traces[0].i, traces[0].j), (0, 0));
        assert!(rms_traces_from_cube(&[100.0], &cube).is_err());
    }

    #[test]
    fn unsupported_format() {
        let result = infer_format(Path::new("cube.mat"));
        assert!(matches!(result, Err(InversionError::UnsupportedFileFormat(_))));
    }
}
