//! Crystal size distribution representations and state scaling.

use crate::error::{ConfigError, CrystError};
use crate::scalar::Real;
use serde::{Deserialize, Serialize};

/// How the crystal population is represented in the state vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscretizationMethod {
    /// Leading raw moments of the size distribution.
    Moments { n_moments: usize },
    /// Cell-averaged number density on a uniform size grid, advected by
    /// an upwind finite-volume scheme with a Van Leer limiter.
    FiniteVolume,
}

impl DiscretizationMethod {
    /// Moment representation with the four leading moments.
    pub fn moments() -> Self {
        Self::Moments { n_moments: 4 }
    }

    pub fn is_moments(&self) -> bool {
        matches!(self, Self::Moments { .. })
    }

    pub fn is_finite_volume(&self) -> bool {
        matches!(self, Self::FiniteVolume)
    }

    pub(crate) fn validate(&self) -> Result<(), CrystError> {
        match self {
            Self::Moments { n_moments } if *n_moments < 4 => {
                Err(ConfigError::TooFewMoments(*n_moments).into())
            }
            _ => Ok(()),
        }
    }
}

impl Default for DiscretizationMethod {
    fn default() -> Self {
        Self::moments()
    }
}

/// Flow configuration of the vessel.
///
/// Batch and semibatch track total crystal quantities and the liquid
/// volume; a continuous MSMPR tracks per-volume quantities at fixed
/// working volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatingMode {
    Batch,
    Msmpr,
    Semibatch,
}

impl OperatingMode {
    /// Whether the liquid volume is part of the integrated state.
    pub fn tracks_volume(&self) -> bool {
        matches!(self, Self::Batch | Self::Semibatch)
    }

    /// Whether the vessel exchanges material with an inlet stream.
    pub fn has_inlet(&self) -> bool {
        matches!(self, Self::Msmpr | Self::Semibatch)
    }
}

/// Units of the liquid composition states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompositionBasis {
    /// kg of species per m3 of liquid.
    #[default]
    MassConcentration,
    /// kg of species per kg of liquid.
    MassFraction,
}

/// Multiplicative scaling applied to population states before they enter
/// the integrator.
///
/// Number densities are huge compared to concentrations and temperatures;
/// scaling keeps the state vector well conditioned. Moment states are
/// scaled per order (`mu_k * s^k`), finite-volume densities linearly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleFactor(f64);

impl ScaleFactor {
    pub fn new(scale: f64) -> Result<Self, CrystError> {
        if scale <= 0.0 || !scale.is_finite() {
            return Err(ConfigError::ScaleNotPositive(scale).into());
        }
        Ok(Self(scale))
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Physical moment of order `k` to scaled state.
    pub fn scale_moment(&self, value: f64, k: usize) -> f64 {
        value * self.0.powi(k as i32)
    }

    /// Scaled moment state of order `k` back to physical units.
    pub fn unscale_moment(&self, value: f64, k: usize) -> f64 {
        value / self.0.powi(k as i32)
    }

    /// Physical number density to scaled state.
    pub fn scale_density(&self, value: f64) -> f64 {
        value * self.0
    }

    /// Scaled density state back to physical units.
    pub fn unscale_density<S: Real>(&self, value: S) -> S {
        value * S::from_f64(1.0 / self.0)
    }
}

impl Default for ScaleFactor {
    fn default() -> Self {
        Self(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn default_method_has_four_moments() {
        assert_eq!(
            DiscretizationMethod::default(),
            DiscretizationMethod::Moments { n_moments: 4 }
        );
    }

    #[test]
    fn rejects_three_moment_representation() {
        let err = DiscretizationMethod::Moments { n_moments: 3 }
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            CrystError::ConfigError(ConfigError::TooFewMoments(3))
        ));
    }

    #[test]
    fn mode_state_tracking() {
        assert!(OperatingMode::Batch.tracks_volume());
        assert!(OperatingMode::Semibatch.tracks_volume());
        assert!(!OperatingMode::Msmpr.tracks_volume());
        assert!(OperatingMode::Msmpr.has_inlet());
        assert!(!OperatingMode::Batch.has_inlet());
    }

    #[test]
    fn moment_scaling_roundtrip() {
        let scale = ScaleFactor::new(1e-9).unwrap();
        let mu2 = 3.5e12;
        let scaled = scale.scale_moment(mu2, 2);
        assert_relative_eq!(scaled, 3.5e-6);
        assert_relative_eq!(scale.unscale_moment(scaled, 2), mu2);
    }

    #[test]
    fn density_scaling_roundtrip() {
        let scale = ScaleFactor::new(1e-6).unwrap();
        let f = 2.0e9;
        assert_relative_eq!(scale.unscale_density(scale.scale_density(f)), f);
    }

    #[test]
    fn rejects_non_positive_scale() {
        assert!(ScaleFactor::new(0.0).is_err());
        assert!(ScaleFactor::new(-1.0).is_err());
        assert!(ScaleFactor::new(f64::NAN).is_err());
    }
}
