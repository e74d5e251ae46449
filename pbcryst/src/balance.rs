//! Material and energy balances for the three operating modes.
//!
//! [`RhsContext`] bundles everything a right-hand-side evaluation needs:
//! configuration, state layout, kinetics, property models and the
//! attached feed. Its [`RhsContext::rhs`] method is the single source of
//! truth for the model equations; the integrator closures, the finite
//! difference and dual-number jacobians, and the sensitivity products
//! all call it, so every backend differentiates exactly the equations
//! being integrated.
//!
//! Scalar-generic throughout: `S = f64` for plain evaluation, a dual
//! number for forward-mode differentiation.

use crate::discretization::{fvm_rates, moment_rates, DiscretizationInput};
use crate::distribution::{CompositionBasis, DiscretizationMethod, OperatingMode, ScaleFactor};
use crate::grid::SizeGrid;
use crate::inlet::{FeedConditions, HeatTransferMedia, Inlet, TemperatureProfile};
use crate::kinetics::{CrystalKinetics, ParameterMask};
use crate::phase::{volumetric_enthalpy, volumetric_heat_capacity, LiquidModel, SolidModel};
use crate::scalar::Real;
use std::f64::consts::PI;

/// Static configuration of the balance equations.
#[derive(Debug, Clone)]
pub(crate) struct BalanceSettings {
    pub mode: OperatingMode,
    pub method: DiscretizationMethod,
    pub basis: CompositionBasis,
    pub target_index: usize,
    pub scale: ScaleFactor,
    /// Grid unit in meters.
    pub size_scale: f64,
    /// Size of nucleated crystals, grid units.
    pub nucleus_size: f64,
    /// Limiter regularization.
    pub eps: f64,
    pub adiabatic: bool,
    /// J/kg, negative for exothermic crystallization.
    pub heat_of_crystallization: f64,
    /// Overall jacket heat transfer coefficient, W/m2/K.
    pub heat_transfer_coeff: f64,
    /// Jacket volume as a fraction of the vessel volume.
    pub jacket_volume_fraction: f64,
    /// Explicit jacket volume override, m3.
    pub jacket_volume: Option<f64>,
}

/// Crystal population representation resolved against its grid.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Population<'a> {
    Moments,
    FiniteVolume(&'a SizeGrid),
}

/// Everything one right-hand-side evaluation reads.
pub(crate) struct RhsContext<'a, K, L, SM> {
    pub settings: &'a BalanceSettings,
    pub kinetics: &'a K,
    pub liquid: &'a L,
    pub solid: &'a SM,
    pub mask: &'a ParameterMask,
    pub fixed_params: Vec<f64>,
    pub population: Population<'a>,
    pub inlet: Option<&'a (dyn Inlet + 'a)>,
    pub profile: Option<&'a (dyn TemperatureProfile + 'a)>,
    pub media: Option<HeatTransferMedia>,
    pub shape_factor: f64,
    /// Start time of the current run.
    pub t_zero: f64,
    /// Liquid temperature at the start of the current run, K.
    pub temp_zero: f64,
    /// Working slurry volume, m3. Denominator of the residence time for
    /// continuous operation; ignored when the volume is a state.
    pub vol_slurry: f64,
    pub n_distr: usize,
    pub n_species: usize,
    pub vol_index: Option<usize>,
    pub temp_index: Option<usize>,
    pub ht_index: Option<usize>,
}

impl<K, L, SM> RhsContext<'_, K, L, SM>
where
    K: CrystalKinetics,
    L: LiquidModel,
    SM: SolidModel,
{
    /// Evaluate the model equations at state `x`, free parameters
    /// `p_free` and time `t`, writing the derivatives into `dxdt`.
    pub(crate) fn rhs<S: Real>(&self, x: &[S], p_free: &[S], t: f64, dxdt: &mut [S]) {
        let settings = self.settings;
        let params = self.mask.merge(p_free, &self.fixed_params);
        let scale = settings.scale.value();
        let sigma3 = settings.size_scale.powi(3);

        let distr = &x[..self.n_distr];
        let conc = &x[self.n_distr..self.n_distr + self.n_species];
        let (temp, temp_ht) = self.resolve_temperature(x, t);

        let rho_liq = self.liquid.density(conc, temp);
        let rho_sol = self.solid.density(temp);

        let conc_target = conc[settings.target_index];
        let conc_kinetics = match settings.basis {
            CompositionBasis::MassConcentration => conc_target,
            CompositionBasis::MassFraction => conc_target / rho_liq,
        };
        let attenuation = self.kinetics.growth_attenuation(&params, conc);

        // Third moment in meter basis, from the scaled state.
        let mu3_m: S = match self.population {
            Population::Moments => distr[3] * S::from_f64(sigma3 / scale.powi(3)),
            Population::FiniteVolume(grid) => {
                let physical: Vec<S> = distr
                    .iter()
                    .map(|&f| settings.scale.unscale_density(f))
                    .collect();
                grid.moment_raw(&physical, 3) * S::from_f64(sigma3)
            }
        };
        let vol_solid = S::from_f64(self.shape_factor) * mu3_m;

        let vol_liq = match self.vol_index {
            Some(i) => x[i],
            None => S::from_f64(self.vol_slurry),
        };

        // The population source for batch operation acts on the total
        // population, so nucleation sees the whole slurry volume.
        let discr_volume = match settings.mode {
            OperatingMode::Batch | OperatingMode::Semibatch => vol_liq + vol_solid,
            OperatingMode::Msmpr => S::one(),
        };

        let input = DiscretizationInput {
            params: &params,
            temp,
            conc_kinetics,
            attenuation,
            shape_factor: self.shape_factor,
            crystal_density: rho_sol,
            nucleus_size: settings.nucleus_size,
            size_scale: settings.size_scale,
            volume: discr_volume,
            eps: settings.eps,
            scale: settings.scale,
        };

        let transf = match self.population {
            Population::Moments => {
                let inv_scale = 1.0 / scale;
                let mut factor = 1.0;
                let mu_phys: Vec<S> = distr
                    .iter()
                    .map(|&m| {
                        let mu = m * S::from_f64(factor);
                        factor *= inv_scale;
                        mu
                    })
                    .collect();

                let pop = moment_rates(self.kinetics, &input, &mu_phys);
                let mut factor = 1.0;
                for (slot, &d) in dxdt[..self.n_distr].iter_mut().zip(&pop.d_distr) {
                    *slot = d * S::from_f64(factor);
                    factor *= scale;
                }
                pop.mass_transfer
            }
            Population::FiniteVolume(grid) => {
                let pop = fvm_rates(self.kinetics, &input, grid, distr);
                dxdt[..self.n_distr].copy_from_slice(&pop.d_distr);
                pop.mass_transfer
            }
        };

        let feed = match settings.mode {
            OperatingMode::Msmpr | OperatingMode::Semibatch => {
                self.inlet.map(|inlet| inlet.conditions(t))
            }
            OperatingMode::Batch => None,
        };

        match settings.mode {
            OperatingMode::Batch => {
                self.batch_material(conc, vol_liq, transf, rho_liq, dxdt);
            }
            OperatingMode::Msmpr => {
                if let Some(feed) = &feed {
                    self.msmpr_material(conc, distr, vol_solid, transf, rho_liq, rho_sol, feed, dxdt);
                }
            }
            OperatingMode::Semibatch => {
                if let Some(feed) = &feed {
                    self.semibatch_material(conc, vol_liq, transf, rho_liq, feed, dxdt);
                }
            }
        }

        if let Some(ti) = self.temp_index {
            let energy = self.energy(
                conc, vol_liq, vol_solid, transf, temp, temp_ht, rho_liq, rho_sol, feed.as_ref(),
            );
            dxdt[ti] = energy.d_temp;
            if let Some(hi) = self.ht_index {
                dxdt[hi] = energy.d_temp_ht;
            }
        }
    }

    fn resolve_temperature<S: Real>(&self, x: &[S], t: f64) -> (S, Option<S>) {
        match (self.temp_index, self.ht_index) {
            (Some(ti), Some(hi)) => (x[ti], Some(x[hi])),
            (Some(ti), None) => (x[ti], None),
            (None, _) => {
                let temp = match self.profile {
                    Some(profile) => profile.temperature(t, self.t_zero, self.temp_zero),
                    None => self.temp_zero,
                };
                (S::from_f64(temp), None)
            }
        }
    }

    fn batch_material<S: Real>(
        &self,
        conc: &[S],
        vol_liq: S,
        transf: S,
        rho_liq: S,
        dxdt: &mut [S],
    ) {
        let settings = self.settings;
        let inv_vol = S::one() / vol_liq;
        let basis_factor = self.composition_basis_factor(rho_liq);

        for (i, &c) in conc.iter().enumerate() {
            let kron = S::from_f64((i == settings.target_index) as u8 as f64);
            dxdt[self.n_distr + i] = -(transf * inv_vol) * (kron - c / rho_liq) * basis_factor;
        }
        if let Some(vi) = self.vol_index {
            dxdt[vi] = -(transf / rho_liq);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn msmpr_material<S: Real>(
        &self,
        conc: &[S],
        distr: &[S],
        vol_solid: S,
        transf: S,
        rho_liq: S,
        rho_sol: S,
        feed: &FeedConditions,
        dxdt: &mut [S],
    ) {
        let settings = self.settings;
        let tau_inv = S::from_f64(feed.vol_flow / self.vol_slurry);

        // Feed population enters in the scaled state basis.
        let feed_scaled = self.scaled_feed_distribution(feed);
        for (k, slot) in dxdt[..self.n_distr].iter_mut().enumerate() {
            let f_in = S::from_f64(feed_scaled.get(k).copied().unwrap_or(0.0));
            *slot = *slot + tau_inv * (f_in - distr[k]);
        }

        let phi = S::one() - vol_solid;
        let phi_in = S::from_f64(self.feed_liquid_fraction(feed));
        let basis_factor = self.composition_basis_factor(rho_liq);

        for (i, &c) in conc.iter().enumerate() {
            let kron = S::from_f64((i == settings.target_index) as u8 as f64);
            let c_in = S::from_f64(feed.mass_conc.get(i).copied().unwrap_or(0.0));
            let flow = tau_inv * (c_in * phi_in - c * phi);
            let transfer = transf * (kron - c / rho_sol);
            dxdt[self.n_distr + i] = (flow - transfer) / phi * basis_factor;
        }
    }

    fn semibatch_material<S: Real>(
        &self,
        conc: &[S],
        vol_liq: S,
        transf: S,
        rho_liq: S,
        feed: &FeedConditions,
        dxdt: &mut [S],
    ) {
        let settings = self.settings;
        let flow = S::from_f64(feed.vol_flow);

        let feed_scaled = self.scaled_feed_distribution(feed);
        for (k, slot) in dxdt[..self.n_distr].iter_mut().enumerate() {
            let f_in = S::from_f64(feed_scaled.get(k).copied().unwrap_or(0.0));
            *slot = *slot + flow * f_in;
        }

        let conc_in: Vec<S> = feed.mass_conc.iter().map(|&c| S::from_f64(c)).collect();
        let temp_in = S::from_f64(feed.temp);
        let rho_in = self.liquid.density(&conc_in, temp_in);

        let phi_in = S::from_f64(self.feed_liquid_fraction(feed));
        let inv_vol = S::one() / vol_liq;
        let basis_factor = self.composition_basis_factor(rho_liq);

        for (i, &c) in conc.iter().enumerate() {
            let kron = S::from_f64((i == settings.target_index) as u8 as f64);
            let c_in = S::from_f64(feed.mass_conc.get(i).copied().unwrap_or(0.0));
            let flow_term = phi_in * flow * (c_in - c * rho_in / rho_liq);
            let transfer = transf * (kron - c / rho_liq);
            dxdt[self.n_distr + i] = (flow_term - transfer) * inv_vol * basis_factor;
        }
        if let Some(vi) = self.vol_index {
            dxdt[vi] = (phi_in * flow * rho_in - transf) / rho_liq;
        }
    }

    fn composition_basis_factor<S: Real>(&self, rho_liq: S) -> S {
        match self.settings.basis {
            CompositionBasis::MassConcentration => S::one(),
            CompositionBasis::MassFraction => S::one() / rho_liq,
        }
    }

    /// Feed population converted to the scaled state basis.
    fn scaled_feed_distribution(&self, feed: &FeedConditions) -> Vec<f64> {
        let scale = self.settings.scale;
        match &feed.distrib {
            None => Vec::new(),
            Some(distrib) => match self.population {
                Population::Moments => distrib
                    .iter()
                    .enumerate()
                    .map(|(k, &m)| scale.scale_moment(m, k))
                    .collect(),
                Population::FiniteVolume(_) => {
                    distrib.iter().map(|&f| scale.scale_density(f)).collect()
                }
            },
        }
    }

    /// Liquid volume fraction of the feed, from its crystal content.
    fn feed_liquid_fraction(&self, feed: &FeedConditions) -> f64 {
        let mu3 = match &feed.distrib {
            None => return 1.0,
            Some(distrib) => match self.population {
                Population::Moments => distrib.get(3).copied().unwrap_or(0.0),
                Population::FiniteVolume(grid) => grid.moment_raw(distrib.as_slice(), 3),
            },
        };
        1.0 - self.shape_factor * mu3 * self.settings.size_scale.powi(3)
    }

    #[allow(clippy::too_many_arguments)]
    fn energy<S: Real>(
        &self,
        conc: &[S],
        vol_liq: S,
        vol_solid: S,
        transf: S,
        temp: S,
        temp_ht: Option<S>,
        rho_liq: S,
        rho_sol: S,
        feed: Option<&FeedConditions>,
    ) -> EnergyRates<S> {
        let settings = self.settings;
        let dh = S::from_f64(settings.heat_of_crystallization);
        let u_ht = S::from_f64(settings.heat_transfer_coeff);

        let cp_liq = self.liquid.heat_capacity(conc, temp);
        let cp_sol = self.solid.heat_capacity(temp);

        let (vol_total, phi) = match settings.mode {
            OperatingMode::Batch | OperatingMode::Semibatch => {
                let total = vol_liq + vol_solid;
                (total, vol_liq / total)
            }
            // per-volume states: vol_solid is already the solid fraction
            OperatingMode::Msmpr => (S::from_f64(self.vol_slurry), S::one() - vol_solid),
        };

        let capacitance = volumetric_heat_capacity(phi, rho_liq, cp_liq, rho_sol, cp_sol);
        let area = tank_area(vol_total);

        let ht_term = match temp_ht {
            Some(tht) if !settings.adiabatic => u_ht * area * (temp - tht),
            _ => S::zero(),
        };

        let flow_minus_accum = match (settings.mode, feed) {
            (OperatingMode::Batch, _) | (_, None) => S::zero(),
            (OperatingMode::Msmpr, Some(feed)) => {
                let h_sp = self.slurry_enthalpy(conc, temp, phi, rho_liq, rho_sol);
                let h_in: S = self.feed_enthalpy(feed);
                S::from_f64(feed.vol_flow) * (h_in - h_sp)
            }
            (OperatingMode::Semibatch, Some(feed)) => {
                let h_sp = self.slurry_enthalpy(conc, temp, phi, rho_liq, rho_sol);
                let h_in = self.feed_enthalpy(feed);
                let conc_in: Vec<S> = feed.mass_conc.iter().map(|&c| S::from_f64(c)).collect();
                let rho_in = self.liquid.density(&conc_in, S::from_f64(feed.temp));
                let rho_slurry = phi * rho_liq + (S::one() - phi) * rho_sol;
                let accum = S::from_f64(feed.vol_flow) * rho_in * h_sp / rho_slurry;
                S::from_f64(feed.vol_flow) * h_in - accum
            }
        };

        // Continuous operation reports a per-volume transfer rate.
        let source = match settings.mode {
            OperatingMode::Msmpr => dh * transf * vol_total,
            _ => dh * transf,
        };

        let d_temp = (flow_minus_accum - source - ht_term) / (capacitance * vol_total);

        let d_temp_ht = match temp_ht {
            None => S::zero(),
            Some(tht) => match self.media {
                None => S::zero(),
                Some(media) => {
                    let vol_ht = match settings.jacket_volume {
                        Some(v) => S::from_f64(v),
                        None => vol_total * S::from_f64(settings.jacket_volume_fraction),
                    };
                    let supply = S::from_f64(media.vol_flow) / vol_ht
                        * (S::from_f64(media.temp_in) - tht);
                    let exchange = u_ht * area * (tht - temp)
                        / (S::from_f64(media.density * media.heat_capacity) * vol_ht);
                    supply - exchange
                }
            },
        };

        EnergyRates { d_temp, d_temp_ht }
    }

    fn slurry_enthalpy<S: Real>(
        &self,
        conc: &[S],
        temp: S,
        phi: S,
        rho_liq: S,
        rho_sol: S,
    ) -> S {
        let h_liq = self.liquid.enthalpy(conc, temp);
        let h_sol = self.solid.enthalpy(temp);
        volumetric_enthalpy(phi, rho_liq, h_liq, rho_sol, h_sol)
    }

    /// Volumetric enthalpy of the feed at its own conditions, J/m3.
    fn feed_enthalpy<S: Real>(&self, feed: &FeedConditions) -> S {
        let conc_in: Vec<S> = feed.mass_conc.iter().map(|&c| S::from_f64(c)).collect();
        let temp_in = S::from_f64(feed.temp);
        let phi_in = S::from_f64(self.feed_liquid_fraction(feed));
        let rho_l = self.liquid.density(&conc_in, temp_in);
        let rho_s = self.solid.density(temp_in);
        let h_l = self.liquid.enthalpy(&conc_in, temp_in);
        let h_s = self.solid.enthalpy(temp_in);
        volumetric_enthalpy(phi_in, rho_l, h_l, rho_s, h_s)
    }
}

struct EnergyRates<S> {
    d_temp: S,
    d_temp_ht: S,
}

/// Heat transfer area of a cylindrical tank of aspect ratio one holding
/// `vol_total`.
fn tank_area<S: Real>(vol_total: S) -> S {
    let diam = (vol_total * S::from_f64(4.0 / PI)).powf(1.0 / 3.0);
    diam * diam * S::from_f64(PI)
}
