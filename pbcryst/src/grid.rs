//! Uniform size grids for discretized crystal size distributions.
//!
//! A [`SizeGrid`] stores the cell-centre coordinates of a finite-volume
//! discretization of internal coordinate space. Coordinates are kept in
//! grid units (typically microns); conversion to meters happens where
//! moments feed kinetics, via the configured size scale.

use crate::config_error;
use crate::error::{ConfigError, CrystError};
use crate::scalar::Real;
use serde::{Deserialize, Serialize};

/// Relative tolerance used to accept a grid as uniformly spaced.
const UNIFORMITY_RTOL: f64 = 1e-8;

/// Cell-centred, uniformly spaced size grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeGrid {
    centers: Vec<f64>,
    dx: f64,
}

impl SizeGrid {
    /// Build a grid from explicit cell centres.
    ///
    /// The centres must be strictly increasing and uniformly spaced;
    /// the finite-volume fluxes assume a single cell width.
    pub fn new(centers: Vec<f64>) -> Result<Self, CrystError> {
        if centers.len() < 2 {
            return Err(ConfigError::GridTooSmall(centers.len()).into());
        }
        let dx = centers[1] - centers[0];
        if dx <= 0.0 {
            return Err(ConfigError::GridNotMonotone.into());
        }
        for win in centers.windows(2) {
            let step = win[1] - win[0];
            if step <= 0.0 {
                return Err(ConfigError::GridNotMonotone.into());
            }
            if (step - dx).abs() > UNIFORMITY_RTOL * dx {
                return Err(config_error!(
                    GridNotUniform,
                    format!("cell widths {dx} and {step} differ")
                ));
            }
        }
        Ok(Self { centers, dx })
    }

    /// Build a uniform grid of `n` cell centres spanning `[lower, upper]`.
    pub fn uniform(lower: f64, upper: f64, n: usize) -> Result<Self, CrystError> {
        if n < 2 {
            return Err(ConfigError::GridTooSmall(n).into());
        }
        if upper <= lower {
            return Err(ConfigError::GridNotMonotone.into());
        }
        let dx = (upper - lower) / (n - 1) as f64;
        let centers = (0..n).map(|i| lower + dx * i as f64).collect();
        Ok(Self { centers, dx })
    }

    /// Cell-centre coordinates in grid units.
    pub fn centers(&self) -> &[f64] {
        &self.centers
    }

    /// Cell width in grid units.
    pub fn dx(&self) -> f64 {
        self.dx
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.centers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centers.is_empty()
    }

    /// k-th raw moment of a cell-centred density, in grid units.
    ///
    /// Trapezoidal quadrature over the cell centres: interior cells carry
    /// full weight, the two end cells half weight. The density and the
    /// returned moment share the caller's number-per-length basis; callers
    /// converting to meter-based moments multiply by the size scale raised
    /// to `k`.
    pub fn moment_raw<S: Real>(&self, density: &[S], k: u32) -> S {
        debug_assert_eq!(density.len(), self.centers.len());
        let mut acc = S::zero();
        let last = self.centers.len() - 1;
        for (i, (&f, &x)) in density.iter().zip(self.centers.iter()).enumerate() {
            let weight = if i == 0 || i == last { 0.5 } else { 1.0 };
            acc = acc + f * S::from_f64(weight * x.powi(k as i32));
        }
        acc * S::from_f64(self.dx)
    }
}
