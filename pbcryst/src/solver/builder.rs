//! Crystallizer configuration.

use crate::balance::BalanceSettings;
use crate::distribution::{CompositionBasis, DiscretizationMethod, OperatingMode, ScaleFactor};
use crate::error::{ConfigError, CrystError};
use crate::inlet::{HeatTransferMedia, TemperatureProfile};
use crate::jacobian::JacobianStrategy;
use crate::kinetics::{CrystalKinetics, ParameterMask};
use crate::phase::{LiquidModel, SolidModel};

use super::Crystallizer;

/// Heat released per kilogram of crystallized solid, J/kg.
const HEAT_OF_CRYSTALLIZATION: f64 = -1.46e4;
/// Overall jacket heat transfer coefficient, W/m2/K.
const HEAT_TRANSFER_COEFF: f64 = 1000.0;
/// Jacket volume as a fraction of the vessel volume.
const JACKET_VOLUME_FRACTION: f64 = 0.14;

enum Thermal {
    /// Energy balance with jacket exchange; needs heat-transfer media.
    Jacketed,
    /// Tank temperature held at the attached liquid's value.
    Isothermal,
    /// Energy balance without heat exchange.
    Adiabatic,
    /// Tank temperature follows a prescribed trajectory.
    Prescribed(Box<dyn TemperatureProfile>),
}

/// Builder for a [`Crystallizer`].
///
/// Collects the operating configuration, validates it once, and produces
/// a crystallizer ready for phase attachment. Thermal operation defaults
/// to a jacketed energy balance; call [`CrystallizerBuilder::isothermal`],
/// [`CrystallizerBuilder::adiabatic`] or
/// [`CrystallizerBuilder::temperature_profile`] to select something else.
///
/// ```
/// use pbcryst::{
///     ConstantLiquid, ConstantSolid, CrystallizerBuilder, DiscretizationMethod, OperatingMode,
///     PowerLawKinetics,
/// };
///
/// let kinetics = PowerLawKinetics::new([0.3, 0.0, 0.0])
///     .with_primary_nucleation(1e8, 0.0, 2.0)
///     .with_growth(5.0, 0.0, 1.0);
/// let crystallizer =
///     CrystallizerBuilder::new(OperatingMode::Batch, DiscretizationMethod::moments())
///         .isothermal()
///         .scale(1e-3)
///         .build(
///             kinetics,
///             ConstantLiquid::new(1100.0, 4000.0),
///             ConstantSolid::new(1400.0, 1200.0),
///         )
///         .unwrap();
/// # let _ = crystallizer;
/// ```
pub struct CrystallizerBuilder {
    mode: OperatingMode,
    method: DiscretizationMethod,
    basis: CompositionBasis,
    strategy: JacobianStrategy,
    target_index: usize,
    scale: f64,
    size_scale: f64,
    nucleus_size: f64,
    eps: f64,
    thermal: Thermal,
    media: Option<HeatTransferMedia>,
    mask: Option<ParameterMask>,
    heat_of_crystallization: f64,
    heat_transfer_coeff: f64,
    jacket_volume_fraction: f64,
    jacket_volume: Option<f64>,
}

impl CrystallizerBuilder {
    pub fn new(mode: OperatingMode, method: DiscretizationMethod) -> Self {
        Self {
            mode,
            method,
            basis: CompositionBasis::default(),
            strategy: JacobianStrategy::default(),
            target_index: 0,
            scale: 1.0,
            size_scale: 1e-6,
            nucleus_size: 0.0,
            eps: f64::EPSILON,
            thermal: Thermal::Jacketed,
            media: None,
            mask: None,
            heat_of_crystallization: HEAT_OF_CRYSTALLIZATION,
            heat_transfer_coeff: HEAT_TRANSFER_COEFF,
            jacket_volume_fraction: JACKET_VOLUME_FRACTION,
            jacket_volume: None,
        }
    }

    /// Index of the crystallizing species in the liquid composition.
    pub fn target_species(mut self, index: usize) -> Self {
        self.target_index = index;
        self
    }

    pub fn composition_basis(mut self, basis: CompositionBasis) -> Self {
        self.basis = basis;
        self
    }

    pub fn jacobian(mut self, strategy: JacobianStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Multiplicative scaling of the population states inside the
    /// integrator.
    pub fn scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Grid unit in meters. Defaults to micrometers.
    pub fn size_scale(mut self, size_scale: f64) -> Self {
        self.size_scale = size_scale;
        self
    }

    /// Size at which nucleated crystals enter the population, grid units.
    pub fn nucleus_size(mut self, size: f64) -> Self {
        self.nucleus_size = size;
        self
    }

    /// Regularization floor of the flux limiter.
    pub fn epsilon(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Hold the tank temperature at the attached liquid's value.
    pub fn isothermal(mut self) -> Self {
        self.thermal = Thermal::Isothermal;
        self
    }

    /// Integrate the energy balance without jacket exchange.
    pub fn adiabatic(mut self) -> Self {
        self.thermal = Thermal::Adiabatic;
        self
    }

    /// Prescribe the tank temperature; the energy balance is dropped.
    pub fn temperature_profile<P: TemperatureProfile + 'static>(mut self, profile: P) -> Self {
        self.thermal = Thermal::Prescribed(Box::new(profile));
        self
    }

    /// Utility fluid circulating through the jacket. Required for
    /// jacketed operation.
    pub fn heat_transfer_media(mut self, media: HeatTransferMedia) -> Self {
        self.media = Some(media);
        self
    }

    /// Free/fixed partition of the kinetic parameters for sensitivity
    /// analysis. Defaults to all parameters fixed.
    pub fn parameter_mask(mut self, mask: ParameterMask) -> Self {
        self.mask = Some(mask);
        self
    }

    /// J/kg, negative for exothermic crystallization.
    pub fn heat_of_crystallization(mut self, dh: f64) -> Self {
        self.heat_of_crystallization = dh;
        self
    }

    /// Overall jacket heat transfer coefficient, W/m2/K.
    pub fn heat_transfer_coefficient(mut self, u: f64) -> Self {
        self.heat_transfer_coeff = u;
        self
    }

    /// Jacket volume as a fraction of the vessel volume.
    pub fn jacket_volume_fraction(mut self, fraction: f64) -> Self {
        self.jacket_volume_fraction = fraction;
        self
    }

    /// Explicit jacket volume in m3, overriding the fraction.
    pub fn jacket_volume(mut self, volume: f64) -> Self {
        self.jacket_volume = Some(volume);
        self
    }

    /// Validate the configuration and produce a crystallizer.
    pub fn build<K, L, SM>(
        self,
        kinetics: K,
        liquid: L,
        solid: SM,
    ) -> Result<Crystallizer<K, L, SM>, CrystError>
    where
        K: CrystalKinetics,
        L: LiquidModel,
        SM: SolidModel,
    {
        self.method.validate()?;
        let scale = ScaleFactor::new(self.scale)?;
        positive("size_scale", self.size_scale)?;
        positive("epsilon", self.eps)?;
        positive("jacket_volume_fraction", self.jacket_volume_fraction)?;
        if let Some(vol) = self.jacket_volume {
            positive("jacket_volume", vol)?;
        }

        let n_params = kinetics.params().len();
        let mask = match self.mask {
            Some(mask) => {
                mask.validate(n_params)?;
                mask
            }
            None => ParameterMask::all_fixed(n_params),
        };

        if matches!(self.strategy, JacobianStrategy::Autodiff) && !cfg!(feature = "autodiff") {
            return Err(ConfigError::AutodiffUnavailable.into());
        }
        if matches!(self.strategy, JacobianStrategy::Analytical) {
            let supported = self.mode == OperatingMode::Batch
                && self.method.is_moments()
                && self.basis == CompositionBasis::MassConcentration
                && matches!(self.thermal, Thermal::Isothermal | Thermal::Prescribed(_));
            if !supported {
                return Err(ConfigError::AnalyticalUnsupported(
                    "batch operation, moment representation, mass concentrations and a known \
                     temperature required"
                        .into(),
                )
                .into());
            }
            if !kinetics.has_rate_partials() {
                return Err(ConfigError::AnalyticalUnsupported(
                    "kinetics model provides no hand-derived partials".into(),
                )
                .into());
            }
        }

        let (track_temperature, track_jacket, adiabatic, profile) = match self.thermal {
            Thermal::Jacketed => {
                if self.media.is_none() {
                    return Err(ConfigError::JacketMediaRequired.into());
                }
                (true, true, false, None)
            }
            Thermal::Adiabatic => (true, false, true, None),
            Thermal::Isothermal => (false, false, false, None),
            Thermal::Prescribed(profile) => (false, false, false, Some(profile)),
        };

        let settings = BalanceSettings {
            mode: self.mode,
            method: self.method,
            basis: self.basis,
            target_index: self.target_index,
            scale,
            size_scale: self.size_scale,
            nucleus_size: self.nucleus_size,
            eps: self.eps,
            adiabatic,
            heat_of_crystallization: self.heat_of_crystallization,
            heat_transfer_coeff: self.heat_transfer_coeff,
            jacket_volume_fraction: self.jacket_volume_fraction,
            jacket_volume: self.jacket_volume,
        };

        Ok(Crystallizer {
            settings,
            strategy: self.strategy,
            mask,
            kinetics,
            liquid,
            solid,
            profile,
            media: self.media,
            track_temperature,
            track_jacket,
            inlet: None,
            slurry: None,
            initial: None,
            grid: None,
            layout: None,
            elapsed: 0.0,
        })
    }
}

fn positive(name: &'static str, value: f64) -> Result<(), CrystError> {
    if value <= 0.0 || !value.is_finite() {
        return Err(ConfigError::NonPositiveSetting { name, value }.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinetics::{power_law, PowerLawKinetics};
    use crate::phase::{ConstantLiquid, ConstantSolid};

    fn kinetics() -> PowerLawKinetics {
        PowerLawKinetics::new([0.3, 0.0, 0.0])
            .with_primary_nucleation(1e8, 0.0, 2.0)
            .with_growth(5.0, 0.0, 1.0)
    }

    fn liquid() -> ConstantLiquid {
        ConstantLiquid::new(1100.0, 4000.0)
    }

    fn solid() -> ConstantSolid {
        ConstantSolid::new(1400.0, 1200.0)
    }

    #[test]
    fn minimal_isothermal_batch_builds() {
        let result = CrystallizerBuilder::new(OperatingMode::Batch, DiscretizationMethod::moments())
            .isothermal()
            .build(kinetics(), liquid(), solid());
        assert!(result.is_ok());
    }

    #[test]
    fn jacketed_operation_requires_media() {
        let err = CrystallizerBuilder::new(OperatingMode::Batch, DiscretizationMethod::moments())
            .build(kinetics(), liquid(), solid())
            .unwrap_err();
        assert!(matches!(
            err,
            CrystError::ConfigError(ConfigError::JacketMediaRequired)
        ));

        let ok = CrystallizerBuilder::new(OperatingMode::Batch, DiscretizationMethod::moments())
            .heat_transfer_media(HeatTransferMedia::water(290.0, 1e-3))
            .build(kinetics(), liquid(), solid());
        assert!(ok.is_ok());
    }

    #[test]
    fn rejects_non_positive_settings() {
        let err = CrystallizerBuilder::new(OperatingMode::Batch, DiscretizationMethod::moments())
            .isothermal()
            .size_scale(0.0)
            .build(kinetics(), liquid(), solid())
            .unwrap_err();
        assert!(matches!(
            err,
            CrystError::ConfigError(ConfigError::NonPositiveSetting {
                name: "size_scale",
                ..
            })
        ));

        let err = CrystallizerBuilder::new(OperatingMode::Batch, DiscretizationMethod::moments())
            .isothermal()
            .scale(-1.0)
            .build(kinetics(), liquid(), solid())
            .unwrap_err();
        assert!(matches!(
            err,
            CrystError::ConfigError(ConfigError::ScaleNotPositive(_))
        ));
    }

    #[test]
    fn rejects_wrong_mask_length() {
        let err = CrystallizerBuilder::new(OperatingMode::Batch, DiscretizationMethod::moments())
            .isothermal()
            .parameter_mask(ParameterMask::all_free(3))
            .build(kinetics(), liquid(), solid())
            .unwrap_err();
        assert!(matches!(
            err,
            CrystError::ConfigError(ConfigError::MaskWrongLength {
                expected: power_law::N_PARAMS,
                found: 3,
            })
        ));
    }

    #[test]
    fn rejects_too_few_moments() {
        let err = CrystallizerBuilder::new(
            OperatingMode::Batch,
            DiscretizationMethod::Moments { n_moments: 2 },
        )
        .isothermal()
        .build(kinetics(), liquid(), solid())
        .unwrap_err();
        assert!(matches!(
            err,
            CrystError::ConfigError(ConfigError::TooFewMoments(2))
        ));
    }

    #[cfg(not(feature = "autodiff"))]
    #[test]
    fn autodiff_needs_the_feature() {
        let err = CrystallizerBuilder::new(OperatingMode::Batch, DiscretizationMethod::moments())
            .isothermal()
            .jacobian(JacobianStrategy::Autodiff)
            .build(kinetics(), liquid(), solid())
            .unwrap_err();
        assert!(matches!(
            err,
            CrystError::ConfigError(ConfigError::AutodiffUnavailable)
        ));
    }

    #[cfg(feature = "autodiff")]
    #[test]
    fn autodiff_builds_with_the_feature() {
        let ok = CrystallizerBuilder::new(OperatingMode::Batch, DiscretizationMethod::moments())
            .isothermal()
            .jacobian(JacobianStrategy::Autodiff)
            .build(kinetics(), liquid(), solid());
        assert!(ok.is_ok());
    }

    #[test]
    fn analytical_backend_is_restricted() {
        let err = CrystallizerBuilder::new(OperatingMode::Msmpr, DiscretizationMethod::moments())
            .isothermal()
            .jacobian(JacobianStrategy::Analytical)
            .build(kinetics(), liquid(), solid())
            .unwrap_err();
        assert!(matches!(
            err,
            CrystError::ConfigError(ConfigError::AnalyticalUnsupported(_))
        ));

        // Jacketed batch integrates the temperature, so the hand-derived
        // partials no longer cover the state.
        let err = CrystallizerBuilder::new(OperatingMode::Batch, DiscretizationMethod::moments())
            .heat_transfer_media(HeatTransferMedia::water(290.0, 1e-3))
            .jacobian(JacobianStrategy::Analytical)
            .build(kinetics(), liquid(), solid())
            .unwrap_err();
        assert!(matches!(
            err,
            CrystError::ConfigError(ConfigError::AnalyticalUnsupported(_))
        ));

        let ok = CrystallizerBuilder::new(OperatingMode::Batch, DiscretizationMethod::moments())
            .isothermal()
            .jacobian(JacobianStrategy::Analytical)
            .build(kinetics(), liquid(), solid());
        assert!(ok.is_ok());
    }
}
