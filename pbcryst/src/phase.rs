//! Phase property models and phase state containers.
//!
//! Property models are traits so the solver can be driven by anything
//! from the constant-property models here to full thermodynamic
//! packages. All property methods are generic over the scalar type; the
//! automatic differentiation backend relies on this to push dual numbers
//! through density and enthalpy evaluations.

use crate::attach_error;
use crate::error::{AttachError, CrystError};
use crate::grid::SizeGrid;
use crate::scalar::Real;
use serde::{Deserialize, Serialize};

/// Thermophysical properties of the mother liquor.
pub trait LiquidModel {
    /// Density in kg/m3 at the given composition and temperature.
    fn density<S: Real>(&self, mass_conc: &[S], temp: S) -> S;

    /// Specific heat capacity in J/kg/K.
    fn heat_capacity<S: Real>(&self, mass_conc: &[S], temp: S) -> S;

    /// Specific enthalpy in J/kg.
    fn enthalpy<S: Real>(&self, mass_conc: &[S], temp: S) -> S;
}

/// Thermophysical properties of the crystalline solid.
pub trait SolidModel {
    /// Crystal density in kg/m3.
    fn density<S: Real>(&self, temp: S) -> S;

    /// Specific heat capacity in J/kg/K.
    fn heat_capacity<S: Real>(&self, temp: S) -> S;

    /// Specific enthalpy in J/kg.
    fn enthalpy<S: Real>(&self, temp: S) -> S;
}

/// Liquid with composition- and temperature-independent properties.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConstantLiquid {
    pub density: f64,
    pub heat_capacity: f64,
    /// Reference temperature of the enthalpy datum, in K.
    pub temp_ref: f64,
}

impl ConstantLiquid {
    pub fn new(density: f64, heat_capacity: f64) -> Self {
        Self {
            density,
            heat_capacity,
            temp_ref: 298.15,
        }
    }
}

impl LiquidModel for ConstantLiquid {
    fn density<S: Real>(&self, _mass_conc: &[S], _temp: S) -> S {
        S::from_f64(self.density)
    }

    fn heat_capacity<S: Real>(&self, _mass_conc: &[S], _temp: S) -> S {
        S::from_f64(self.heat_capacity)
    }

    fn enthalpy<S: Real>(&self, _mass_conc: &[S], temp: S) -> S {
        (temp - S::from_f64(self.temp_ref)) * S::from_f64(self.heat_capacity)
    }
}

/// Solid with temperature-independent properties.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConstantSolid {
    pub density: f64,
    pub heat_capacity: f64,
    pub temp_ref: f64,
}

impl ConstantSolid {
    pub fn new(density: f64, heat_capacity: f64) -> Self {
        Self {
            density,
            heat_capacity,
            temp_ref: 298.15,
        }
    }
}

impl SolidModel for ConstantSolid {
    fn density<S: Real>(&self, _temp: S) -> S {
        S::from_f64(self.density)
    }

    fn heat_capacity<S: Real>(&self, _temp: S) -> S {
        S::from_f64(self.heat_capacity)
    }

    fn enthalpy<S: Real>(&self, temp: S) -> S {
        (temp - S::from_f64(self.temp_ref)) * S::from_f64(self.heat_capacity)
    }
}

/// State of the liquid phase in the vessel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidState {
    /// Species concentrations, kg/m3 of liquid (or kg/kg when the
    /// composition basis is mass fractions).
    pub mass_conc: Vec<f64>,
    /// Temperature in K.
    pub temp: f64,
    /// Liquid volume in m3.
    pub vol: f64,
}

/// Crystal population carried by a [`SolidState`].
///
/// Quantities are per unit slurry volume; batch operation converts to
/// totals when the state vector is assembled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SolidContents {
    /// Leading raw moments, grid-unit basis.
    Moments(Vec<f64>),
    /// Cell-centred number density on the state's grid.
    Distribution(Vec<f64>),
}

impl SolidContents {
    pub fn len(&self) -> usize {
        match self {
            Self::Moments(m) => m.len(),
            Self::Distribution(f) => f.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn values(&self) -> &[f64] {
        match self {
            Self::Moments(m) => m,
            Self::Distribution(f) => f,
        }
    }
}

/// State of the solid phase in the vessel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolidState {
    pub contents: SolidContents,
    /// Size grid, required for distribution contents.
    pub grid: Option<SizeGrid>,
    /// Volumetric shape factor relating length cubed to particle volume.
    pub shape_factor: f64,
    /// Temperature in K.
    pub temp: f64,
}

impl SolidState {
    pub fn from_moments(moments: Vec<f64>, shape_factor: f64, temp: f64) -> Self {
        Self {
            contents: SolidContents::Moments(moments),
            grid: None,
            shape_factor,
            temp,
        }
    }

    pub fn from_distribution(
        distrib: Vec<f64>,
        grid: SizeGrid,
        shape_factor: f64,
        temp: f64,
    ) -> Self {
        Self {
            contents: SolidContents::Distribution(distrib),
            grid: Some(grid),
            shape_factor,
            temp,
        }
    }

    /// k-th raw moment of the contents, grid units.
    pub fn moment(&self, k: usize) -> Result<f64, CrystError> {
        match &self.contents {
            SolidContents::Moments(m) => m.get(k).copied().ok_or_else(|| {
                attach_error!(Other, format!("moment of order {k} not tracked"))
            }),
            SolidContents::Distribution(f) => {
                let grid = self
                    .grid
                    .as_ref()
                    .ok_or_else(|| attach_error!(Other, "distribution state has no size grid"))?;
                Ok(grid.moment_raw(f.as_slice(), k as u32))
            }
        }
    }
}

/// A liquid and a crystal population sharing one vessel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slurry {
    pub liquid: LiquidState,
    pub solid: SolidState,
}

impl Slurry {
    pub fn new(liquid: LiquidState, solid: SolidState) -> Self {
        Self { liquid, solid }
    }

    /// Solid volume fraction, from the per-volume third moment converted
    /// to meter basis with the given size scale.
    pub fn solid_fraction(&self, size_scale: f64) -> Result<f64, CrystError> {
        let mu3 = self.solid.moment(3)? * size_scale.powi(3);
        Ok(self.solid.shape_factor * mu3)
    }

    /// Total slurry volume implied by the liquid volume and the solid
    /// fraction.
    pub fn total_volume(&self, size_scale: f64) -> Result<f64, CrystError> {
        let phi_solid = self.solid_fraction(size_scale)?;
        let phi_liq = 1.0 - phi_solid;
        if phi_liq <= 0.0 {
            return Err(AttachError::UnsupportedPhases(format!(
                "solid volume fraction {phi_solid} leaves no liquid"
            ))
            .into());
        }
        Ok(self.liquid.vol / phi_liq)
    }
}

/// Volumetric heat capacity of a suspension, J/m3/K.
pub fn volumetric_heat_capacity<S: Real>(
    phi_liq: S,
    rho_liq: S,
    cp_liq: S,
    rho_sol: S,
    cp_sol: S,
) -> S {
    phi_liq * rho_liq * cp_liq + (S::one() - phi_liq) * rho_sol * cp_sol
}

/// Volumetric enthalpy of a suspension, J/m3.
pub fn volumetric_enthalpy<S: Real>(
    phi_liq: S,
    rho_liq: S,
    h_liq: S,
    rho_sol: S,
    h_sol: S,
) -> S {
    phi_liq * rho_liq * h_liq + (S::one() - phi_liq) * rho_sol * h_sol
}
