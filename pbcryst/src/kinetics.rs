//! Crystallization kinetics: nucleation, growth and dissolution laws.
//!
//! The solver is generic over a [`CrystalKinetics`] implementation. Rate
//! laws are written once, generically over the scalar type, so the same
//! code evaluates plain `f64` rates, dual-number rates for automatic
//! differentiation, and stays consistent with any hand-derived partials
//! a model chooses to provide.

use crate::error::{ConfigError, CrystError};
use crate::scalar::Real;
use serde::{Deserialize, Serialize};

/// Universal gas constant, J/mol/K.
pub const GAS_CONSTANT: f64 = 8.314;

/// Rates of the four crystallization mechanisms at one set of conditions.
///
/// Nucleation rates are number per volume per second; growth and
/// dissolution are length (grid units) per second. Dissolution is stored
/// with its physical sign, zero or negative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KineticRates<S> {
    pub prim_nucl: S,
    pub sec_nucl: S,
    pub growth: S,
    pub dissol: S,
}

impl<S: Real> KineticRates<S> {
    pub fn zero() -> Self {
        Self {
            prim_nucl: S::zero(),
            sec_nucl: S::zero(),
            growth: S::zero(),
            dissol: S::zero(),
        }
    }

    /// Total nucleation rate.
    pub fn nucleation(&self) -> S {
        self.prim_nucl + self.sec_nucl
    }

    /// Net interface velocity, growth plus (negative) dissolution.
    pub fn net_growth(&self) -> S {
        self.growth + self.dissol
    }
}

/// Conditions a kinetics model is evaluated at.
#[derive(Debug, Clone, Copy)]
pub struct KineticConditions<S> {
    /// Concentration of the crystallizing species, in the model's basis.
    pub conc_target: S,
    /// Temperature in K.
    pub temp: S,
    /// Volumetric shape factor of the crystals.
    pub shape_factor: f64,
    /// Third raw moment of the population in meter basis, as consumed by
    /// secondary nucleation laws.
    pub mu3: S,
}

/// Hand-derived first-order partials of the kinetic rates.
///
/// `d_params` holds one entry per model parameter, in the model's
/// parameter order. Partials with respect to masked-out parameters are
/// discarded by the caller.
#[derive(Debug, Clone)]
pub struct RateJacobian {
    pub rates: KineticRates<f64>,
    /// Partials with respect to the target concentration.
    pub d_conc: KineticRates<f64>,
    /// Partial of secondary nucleation with respect to the third moment.
    pub d_mu3: f64,
    /// Partials with respect to each kinetic parameter.
    pub d_params: Vec<KineticRates<f64>>,
}

/// A crystallization kinetics model.
///
/// `rates` and `solubility` are generic over the scalar so the automatic
/// differentiation backend can push dual numbers through them unchanged.
/// Models that can differentiate themselves additionally implement
/// `rate_partials` and advertise it through `has_rate_partials`; the
/// analytical jacobian backend refuses models that do not.
pub trait CrystalKinetics {
    /// The model's current parameter values.
    fn params(&self) -> &[f64];

    /// Evaluate all rate laws at the given conditions.
    ///
    /// `params` carries the full parameter vector, fixed and free entries
    /// merged, in the order of [`CrystalKinetics::params`].
    fn rates<S: Real>(&self, params: &[S], cond: &KineticConditions<S>) -> KineticRates<S>;

    /// Saturation concentration at `temp`, in the model's basis.
    fn solubility<S: Real>(&self, params: &[S], temp: S) -> S;

    /// Multiplier applied to the growth rate, evaluated on the full
    /// liquid composition. Defaults to no attenuation; impurity models
    /// override it.
    fn growth_attenuation<S: Real>(&self, _params: &[S], _conc: &[S]) -> S {
        S::one()
    }

    /// Whether `rate_partials` returns `Some` for this model.
    fn has_rate_partials(&self) -> bool {
        false
    }

    /// Hand-derived rate partials, if the model provides them.
    fn rate_partials(
        &self,
        _params: &[f64],
        _cond: &KineticConditions<f64>,
    ) -> Option<RateJacobian> {
        None
    }
}

/// Marks which kinetic parameters are free for sensitivity analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterMask {
    free: Vec<bool>,
}

impl ParameterMask {
    pub fn new(free: Vec<bool>) -> Self {
        Self { free }
    }

    /// All parameters fixed; sensitivity analysis is unavailable.
    pub fn all_fixed(n: usize) -> Self {
        Self {
            free: vec![false; n],
        }
    }

    /// All parameters free.
    pub fn all_free(n: usize) -> Self {
        Self { free: vec![true; n] }
    }

    pub(crate) fn validate(&self, expected: usize) -> Result<(), CrystError> {
        if self.free.len() != expected {
            return Err(ConfigError::MaskWrongLength {
                expected,
                found: self.free.len(),
            }
            .into());
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    pub fn n_free(&self) -> usize {
        self.free.iter().filter(|&&f| f).count()
    }

    /// Indices of the free parameters, in parameter order.
    pub fn free_indices(&self) -> Vec<usize> {
        self.free
            .iter()
            .enumerate()
            .filter_map(|(i, &f)| f.then_some(i))
            .collect()
    }

    /// Split a full parameter vector into its free and fixed parts.
    pub fn split(&self, params: &[f64]) -> (Vec<f64>, Vec<f64>) {
        debug_assert_eq!(params.len(), self.free.len());
        let mut free = Vec::with_capacity(self.n_free());
        let mut fixed = Vec::with_capacity(params.len() - self.n_free());
        for (&value, &is_free) in params.iter().zip(&self.free) {
            if is_free {
                free.push(value);
            } else {
                fixed.push(value);
            }
        }
        (free, fixed)
    }

    /// Reassemble the full parameter vector from free values (possibly of
    /// a differentiating scalar type) and fixed values.
    pub fn merge<S: Real>(&self, free: &[S], fixed: &[f64]) -> Vec<S> {
        debug_assert_eq!(free.len() + fixed.len(), self.free.len());
        let mut free_it = free.iter();
        let mut fixed_it = fixed.iter();
        self.free
            .iter()
            .map(|&is_free| {
                if is_free {
                    *free_it.next().unwrap_or(&S::zero())
                } else {
                    S::from_f64(*fixed_it.next().unwrap_or(&0.0))
                }
            })
            .collect()
    }
}

/// Parameter indices of [`PowerLawKinetics`].
pub mod power_law {
    pub const KB_PRIM: usize = 0;
    pub const EA_PRIM: usize = 1;
    pub const EXP_PRIM: usize = 2;
    pub const KB_SEC: usize = 3;
    pub const EA_SEC: usize = 4;
    pub const EXP_SEC: usize = 5;
    pub const EXP_SEC_MU3: usize = 6;
    pub const KG: usize = 7;
    pub const EA_G: usize = 8;
    pub const EXP_G: usize = 9;
    pub const KD: usize = 10;
    pub const EA_D: usize = 11;
    pub const EXP_D: usize = 12;
    pub const N_PARAMS: usize = 13;
}

/// Power-law kinetics with Arrhenius temperature dependence.
///
/// Each mechanism follows `k * exp(-Ea/R * (1/T - 1/T_ref)) * sigma^n`,
/// where `sigma` is the positive part of the supersaturation for
/// nucleation and growth, and of the undersaturation for dissolution.
/// Secondary nucleation carries an additional `(kv * mu3)^n2` factor.
/// Solubility is a quadratic polynomial in temperature with fixed, not
/// estimable, coefficients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerLawKinetics {
    params: Vec<f64>,
    solubility: [f64; 3],
    temp_ref: f64,
    relative_supersaturation: bool,
}

impl PowerLawKinetics {
    /// A model with the given solubility polynomial `c_sat = a0 + a1*T +
    /// a2*T^2` and every rate constant zero. Chain the `with_*` builders
    /// to activate mechanisms.
    pub fn new(solubility: [f64; 3]) -> Self {
        Self {
            params: vec![0.0; power_law::N_PARAMS],
            solubility,
            temp_ref: 298.15,
            relative_supersaturation: false,
        }
    }

    pub fn with_primary_nucleation(mut self, kb: f64, ea: f64, exponent: f64) -> Self {
        self.params[power_law::KB_PRIM] = kb;
        self.params[power_law::EA_PRIM] = ea;
        self.params[power_law::EXP_PRIM] = exponent;
        self
    }

    pub fn with_secondary_nucleation(
        mut self,
        kb: f64,
        ea: f64,
        exponent: f64,
        mu3_exponent: f64,
    ) -> Self {
        self.params[power_law::KB_SEC] = kb;
        self.params[power_law::EA_SEC] = ea;
        self.params[power_law::EXP_SEC] = exponent;
        self.params[power_law::EXP_SEC_MU3] = mu3_exponent;
        self
    }

    pub fn with_growth(mut self, kg: f64, ea: f64, exponent: f64) -> Self {
        self.params[power_law::KG] = kg;
        self.params[power_law::EA_G] = ea;
        self.params[power_law::EXP_G] = exponent;
        self
    }

    pub fn with_dissolution(mut self, kd: f64, ea: f64, exponent: f64) -> Self {
        self.params[power_law::KD] = kd;
        self.params[power_law::EA_D] = ea;
        self.params[power_law::EXP_D] = exponent;
        self
    }

    /// Switch the driving force to `(c - c_sat) / c_sat`.
    pub fn with_relative_supersaturation(mut self) -> Self {
        self.relative_supersaturation = true;
        self
    }

    /// Reference temperature of the Arrhenius factors, in K.
    pub fn with_reference_temperature(mut self, temp_ref: f64) -> Self {
        self.temp_ref = temp_ref;
        self
    }

    /// Supersaturation driving force at the given conditions. Negative
    /// values mean the liquor is undersaturated.
    pub fn supersaturation<S: Real>(&self, params: &[S], conc: S, temp: S) -> S {
        let c_sat = self.solubility(params, temp);
        let sigma = conc - c_sat;
        if self.relative_supersaturation {
            sigma / c_sat
        } else {
            sigma
        }
    }

    fn arrhenius<S: Real>(&self, ea: S, temp: S) -> S {
        let inv_diff = S::one() / temp - S::from_f64(1.0 / self.temp_ref);
        (-(ea * inv_diff) * S::from_f64(1.0 / GAS_CONSTANT)).exp()
    }

    /// `d ln(arr) / d Ea` at the given temperature.
    fn arrhenius_log_slope(&self, temp: f64) -> f64 {
        -(1.0 / temp - 1.0 / self.temp_ref) / GAS_CONSTANT
    }

    /// `d sigma / d conc`, constant in the target concentration.
    fn sigma_slope(&self, params: &[f64], temp: f64) -> f64 {
        if self.relative_supersaturation {
            1.0 / self.solubility(params, temp)
        } else {
            1.0
        }
    }
}

impl CrystalKinetics for PowerLawKinetics {
    fn params(&self) -> &[f64] {
        &self.params
    }

    fn solubility<S: Real>(&self, _params: &[S], temp: S) -> S {
        let [a0, a1, a2] = self.solubility;
        S::from_f64(a0) + temp * S::from_f64(a1) + temp * temp * S::from_f64(a2)
    }

    fn rates<S: Real>(&self, p: &[S], cond: &KineticConditions<S>) -> KineticRates<S> {
        use power_law::*;

        let sigma = self.supersaturation(p, cond.conc_target, cond.temp);
        let s_pos = sigma.max(S::zero());
        let s_neg = (-sigma).max(S::zero());

        let prim_nucl = p[KB_PRIM] * self.arrhenius(p[EA_PRIM], cond.temp) * s_pos.pow(p[EXP_PRIM]);

        let vol_frac = S::from_f64(cond.shape_factor) * cond.mu3;
        let sec_nucl = p[KB_SEC]
            * self.arrhenius(p[EA_SEC], cond.temp)
            * s_pos.pow(p[EXP_SEC])
            * vol_frac.pow(p[EXP_SEC_MU3]);

        let growth = p[KG] * self.arrhenius(p[EA_G], cond.temp) * s_pos.pow(p[EXP_G]);

        let dissol = -(p[KD] * self.arrhenius(p[EA_D], cond.temp) * s_neg.pow(p[EXP_D]));

        KineticRates {
            prim_nucl,
            sec_nucl,
            growth,
            dissol,
        }
    }

    fn has_rate_partials(&self) -> bool {
        true
    }

    fn rate_partials(
        &self,
        params: &[f64],
        cond: &KineticConditions<f64>,
    ) -> Option<RateJacobian> {
        use power_law::*;

        let rates = self.rates(params, cond);
        let sigma = self.supersaturation(params, cond.conc_target, cond.temp);
        let s_pos = sigma.max(0.0);
        let s_neg = (-sigma).max(0.0);
        let ds_dc = self.sigma_slope(params, cond.temp);
        let log_slope = self.arrhenius_log_slope(cond.temp);
        let vol_frac = cond.shape_factor * cond.mu3;

        // d rate / d sigma, via rate = const * sigma^n. Zero driving force
        // pins the derivative to zero as well.
        let growth_family = |rate: f64, exponent: f64, driving: f64| {
            if driving > 0.0 {
                exponent * rate / driving
            } else {
                0.0
            }
        };

        let d_conc = KineticRates {
            prim_nucl: growth_family(rates.prim_nucl, params[EXP_PRIM], s_pos) * ds_dc,
            sec_nucl: growth_family(rates.sec_nucl, params[EXP_SEC], s_pos) * ds_dc,
            growth: growth_family(rates.growth, params[EXP_G], s_pos) * ds_dc,
            // undersaturation shrinks as concentration rises
            dissol: -growth_family(rates.dissol, params[EXP_D], s_neg) * ds_dc,
        };

        let d_mu3 = if cond.mu3 > 0.0 {
            params[EXP_SEC_MU3] * rates.sec_nucl / cond.mu3
        } else {
            0.0
        };

        let ln_or_zero = |x: f64| if x > 0.0 { x.ln() } else { 0.0 };

        let mut d_params = vec![KineticRates::<f64>::zero(); N_PARAMS];

        // Rate constants: the unit-rate with the constant divided out.
        d_params[KB_PRIM].prim_nucl =
            self.arrhenius(params[EA_PRIM], cond.temp) * s_pos.powf(params[EXP_PRIM]);
        d_params[KB_SEC].sec_nucl = self.arrhenius(params[EA_SEC], cond.temp)
            * s_pos.powf(params[EXP_SEC])
            * vol_frac.powf(params[EXP_SEC_MU3]);
        d_params[KG].growth =
            self.arrhenius(params[EA_G], cond.temp) * s_pos.powf(params[EXP_G]);
        d_params[KD].dissol =
            -(self.arrhenius(params[EA_D], cond.temp) * s_neg.powf(params[EXP_D]));

        // Activation energies: rate times d ln(arr) / d Ea.
        d_params[EA_PRIM].prim_nucl = rates.prim_nucl * log_slope;
        d_params[EA_SEC].sec_nucl = rates.sec_nucl * log_slope;
        d_params[EA_G].growth = rates.growth * log_slope;
        d_params[EA_D].dissol = rates.dissol * log_slope;

        // Order exponents: rate times the log of the driving force.
        d_params[EXP_PRIM].prim_nucl = rates.prim_nucl * ln_or_zero(s_pos);
        d_params[EXP_SEC].sec_nucl = rates.sec_nucl * ln_or_zero(s_pos);
        d_params[EXP_SEC_MU3].sec_nucl = rates.sec_nucl * ln_or_zero(vol_frac);
        d_params[EXP_G].growth = rates.growth * ln_or_zero(s_pos);
        d_params[EXP_D].dissol = rates.dissol * ln_or_zero(s_neg);

        Some(RateJacobian {
            rates,
            d_conc,
            d_mu3,
            d_params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn model() -> PowerLawKinetics {
        PowerLawKinetics::new([10.0, 0.05, 0.0])
            .with_primary_nucleation(2.0e6, 1.2e4, 2.0)
            .with_secondary_nucleation(4.0e9, 0.0, 1.5, 1.0)
            .with_growth(5.0, 8.0e3, 1.2)
            .with_dissolution(3.0, 0.0, 1.0)
            .with_reference_temperature(300.0)
    }

    fn conditions(conc: f64, temp: f64) -> KineticConditions<f64> {
        KineticConditions {
            conc_target: conc,
            temp,
            shape_factor: 0.52,
            mu3: 1.0e-4,
        }
    }

    #[test]
    fn rates_at_reference_temperature() {
        let kin = model();
        // c_sat(300) = 10 + 0.05 * 300 = 25, sigma = 3
        let cond = conditions(28.0, 300.0);
        let rates = kin.rates(kin.params(), &cond);

        assert_relative_eq!(rates.prim_nucl, 2.0e6 * 9.0);
        assert_relative_eq!(
            rates.sec_nucl,
            4.0e9 * 3.0_f64.powf(1.5) * (0.52 * 1.0e-4),
            max_relative = 1e-12
        );
        assert_relative_eq!(rates.growth, 5.0 * 3.0_f64.powf(1.2), max_relative = 1e-12);
        assert_relative_eq!(rates.dissol, 0.0);
    }

    #[test]
    fn dissolution_takes_over_when_undersaturated() {
        let kin = model();
        let cond = conditions(20.0, 300.0);
        let rates = kin.rates(kin.params(), &cond);

        assert_relative_eq!(rates.prim_nucl, 0.0);
        assert_relative_eq!(rates.growth, 0.0);
        assert_relative_eq!(rates.dissol, -3.0 * 5.0);
    }

    #[test]
    fn arrhenius_shifts_rates_off_reference() {
        let kin = model();
        let cond = conditions(28.0, 310.0);
        let rates = kin.rates(kin.params(), &cond);

        // c_sat(310) = 25.5, sigma = 2.5
        let arr = (-1.2e4 / GAS_CONSTANT * (1.0 / 310.0 - 1.0 / 300.0)).exp();
        assert_relative_eq!(
            rates.prim_nucl,
            2.0e6 * arr * 2.5_f64.powi(2),
            max_relative = 1e-12
        );
    }

    #[test]
    fn relative_supersaturation_divides_by_solubility() {
        let kin = model().with_relative_supersaturation();
        let sigma = kin.supersaturation(kin.params(), 28.0, 300.0);
        assert_relative_eq!(sigma, 3.0 / 25.0);
    }

    #[test]
    fn parameter_partials_match_finite_differences() {
        let kin = model();
        let cond = conditions(28.0, 305.0);
        let params = kin.params().to_vec();
        let jac = kin.rate_partials(&params, &cond).unwrap();

        for i in 0..power_law::N_PARAMS {
            let h = 1e-6 * params[i].abs().max(1.0);
            let mut up = params.clone();
            let mut down = params.clone();
            up[i] += h;
            down[i] -= h;
            let r_up = kin.rates(&up, &cond);
            let r_down = kin.rates(&down, &cond);

            let fd = KineticRates {
                prim_nucl: (r_up.prim_nucl - r_down.prim_nucl) / (2.0 * h),
                sec_nucl: (r_up.sec_nucl - r_down.sec_nucl) / (2.0 * h),
                growth: (r_up.growth - r_down.growth) / (2.0 * h),
                dissol: (r_up.dissol - r_down.dissol) / (2.0 * h),
            };

            assert_relative_eq!(
                jac.d_params[i].prim_nucl,
                fd.prim_nucl,
                max_relative = 1e-5,
                epsilon = 1e-8
            );
            assert_relative_eq!(
                jac.d_params[i].sec_nucl,
                fd.sec_nucl,
                max_relative = 1e-5,
                epsilon = 1e-8
            );
            assert_relative_eq!(
                jac.d_params[i].growth,
                fd.growth,
                max_relative = 1e-5,
                epsilon = 1e-8
            );
            assert_relative_eq!(
                jac.d_params[i].dissol,
                fd.dissol,
                max_relative = 1e-5,
                epsilon = 1e-8
            );
        }
    }

    #[test]
    fn concentration_partials_match_finite_differences() {
        for conc in [28.0, 20.0] {
            let kin = model();
            let cond = conditions(conc, 300.0);
            let params = kin.params().to_vec();
            let jac = kin.rate_partials(&params, &cond).unwrap();

            let h = 1e-6;
            let up = kin.rates(&params, &conditions(conc + h, 300.0));
            let down = kin.rates(&params, &conditions(conc - h, 300.0));

            assert_relative_eq!(
                jac.d_conc.prim_nucl,
                (up.prim_nucl - down.prim_nucl) / (2.0 * h),
                max_relative = 1e-4,
                epsilon = 1e-6
            );
            assert_relative_eq!(
                jac.d_conc.growth,
                (up.growth - down.growth) / (2.0 * h),
                max_relative = 1e-4,
                epsilon = 1e-6
            );
            assert_relative_eq!(
                jac.d_conc.dissol,
                (up.dissol - down.dissol) / (2.0 * h),
                max_relative = 1e-4,
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn mask_split_merge_roundtrip() {
        let mask = ParameterMask::new(vec![true, false, true, false]);
        let params = [1.0, 2.0, 3.0, 4.0];
        let (free, fixed) = mask.split(&params);
        assert_eq!(free, vec![1.0, 3.0]);
        assert_eq!(fixed, vec![2.0, 4.0]);
        assert_eq!(mask.merge(&free, &fixed), params.to_vec());
        assert_eq!(mask.free_indices(), vec![0, 2]);
        assert_eq!(mask.n_free(), 2);
    }

    #[test]
    fn mask_validates_length() {
        let mask = ParameterMask::all_free(3);
        assert!(mask.validate(power_law::N_PARAMS).is_err());
        assert!(ParameterMask::all_fixed(power_law::N_PARAMS)
            .validate(power_law::N_PARAMS)
            .is_ok());
    }
}
