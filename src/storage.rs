//! Persistence of calibration coefficients.
//!
//! The on-disk format is a YAML mapping with two fixed keys: `K`, the 3x3
//! intrinsic matrix as nested row sequences, and `D`, the flat distortion
//! coefficient sequence. Loading is strict: a missing key or a `K` that is
//! not 3x3 is an error, never a default.

use nalgebra::{DVector, Matrix3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("IO error for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed coefficients file {path}: {message}")]
    Malformed { path: String, message: String },
}

#[derive(Serialize, Deserialize)]
struct CoefficientsFile {
    #[serde(rename = "K")]
    k: Vec<Vec<f64>>,
    #[serde(rename = "D")]
    d: Vec<f64>,
}

/// Write the intrinsic matrix and distortion coefficients to `path`,
/// overwriting any existing file.
pub fn save_coefficients(
    k: &Matrix3<f64>,
    d: &DVector<f64>,
    path: impl AsRef<Path>,
) -> Result<(), StorageError> {
    let path = path.as_ref();

    let file = CoefficientsFile {
        k: (0..3)
            .map(|r| (0..3).map(|c| k[(r, c)]).collect())
            .collect(),
        d: d.iter().copied().collect(),
    };

    let yaml = serde_yaml::to_string(&file).map_err(|e| StorageError::Malformed {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    fs::write(path, yaml).map_err(|source| StorageError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Read the intrinsic matrix and distortion coefficients from `path`.
///
/// # Errors
///
/// Fails when the file cannot be read, either key is absent, or `K` is not
/// a 3x3 matrix.
pub fn load_coefficients(
    path: impl AsRef<Path>,
) -> Result<(Matrix3<f64>, DVector<f64>), StorageError> {
    let path = path.as_ref();

    let contents = fs::read_to_string(path).map_err(|source| StorageError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let file: CoefficientsFile =
        serde_yaml::from_str(&contents).map_err(|e| StorageError::Malformed {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    if file.k.len() != 3 || file.k.iter().any(|row| row.len() != 3) {
        return Err(StorageError::Malformed {
            path: path.display().to_string(),
            message: format!(
                "K must be a 3x3 matrix, got {} rows of lengths {:?}",
                file.k.len(),
                file.k.iter().map(|r| r.len()).collect::<Vec<_>>()
            ),
        });
    }

    let mut k = Matrix3::zeros();
    for (r, row) in file.k.iter().enumerate() {
        for (c, value) in row.iter().enumerate() {
            k[(r, c)] = *value;
        }
    }

    Ok((k, DVector::from_vec(file.d)))
}
