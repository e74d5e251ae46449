//! The crystallizer engine.
//!
//! [`Crystallizer`] owns the configuration, kinetics and property models
//! produced by [`CrystallizerBuilder`], plus the attached phases and
//! feed. Each solve assembles the initial state vector from the phases,
//! hands the balance equations to the integrator, decodes the trajectory
//! into [`SimulationResults`] and writes the final state back into the
//! phases, so consecutive runs resume where the previous one stopped.

mod builder;
mod results;
mod steady_state;

pub use builder::CrystallizerBuilder;
pub use results::SimulationResults;
pub use steady_state::SteadyStateResult;

use crate::attach_error;
use crate::balance::{BalanceSettings, Population, RhsContext};
use crate::distribution::{CompositionBasis, DiscretizationMethod, OperatingMode};
use crate::error::{AttachError, ConfigError, CrystError, SolveError};
use crate::grid::SizeGrid;
use crate::inlet::{HeatTransferMedia, Inlet, TemperatureProfile};
use crate::jacobian::{self, JacobianStrategy};
use crate::kinetics::{CrystalKinetics, ParameterMask};
use crate::layout::{Block, StateLayout};
use crate::phase::{LiquidModel, LiquidState, SolidContents, SolidModel, SolidState, Slurry};

use diffsol::{
    DenseMatrix, FaerSparseLU, FaerSparseMat, FaerVec, MatrixCommon, NalgebraLU, NalgebraMat,
    NalgebraVec, OdeBuilder, OdeSolverMethod, SensitivitiesOdeSolverMethod, VectorHost,
};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Integrator tolerances and stepping options, forwarded per run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    pub rtol: f64,
    pub atol: f64,
    /// Initial step size; `None` lets the integrator choose.
    pub h0: Option<f64>,
    /// Relative tolerance of the sensitivity error control; `None` keeps
    /// the integrator's default.
    pub sens_rtol: Option<f64>,
    /// Absolute tolerance of the sensitivity error control; `None` keeps
    /// the integrator's default.
    pub sens_atol: Option<f64>,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            rtol: 1e-6,
            atol: 1e-6,
            h0: None,
            sens_rtol: None,
            sens_atol: None,
        }
    }
}

/// What a run produces: adaptive output up to a final time, or dense
/// output on a caller-supplied grid.
#[derive(Clone, Copy)]
enum RunOutput<'a> {
    Duration(f64),
    Times(&'a [f64]),
}

/// A population balance crystallizer.
///
/// Built by [`CrystallizerBuilder`], then wired to its process material:
/// [`Crystallizer::attach_phases`] supplies the liquid and solid states,
/// [`Crystallizer::attach_inlet`] the feed for continuous and semibatch
/// operation. `solve` integrates forward from the current phase state;
/// the phases are updated in place afterwards, and the elapsed-time
/// clock advances, so a second `solve` continues the campaign.
/// [`Crystallizer::reset`] rewinds to the state originally attached.
pub struct Crystallizer<K, L, SM> {
    settings: BalanceSettings,
    strategy: JacobianStrategy,
    mask: ParameterMask,
    kinetics: K,
    liquid: L,
    solid: SM,
    profile: Option<Box<dyn TemperatureProfile>>,
    media: Option<HeatTransferMedia>,
    track_temperature: bool,
    track_jacket: bool,
    inlet: Option<Box<dyn Inlet>>,
    slurry: Option<Slurry>,
    initial: Option<Slurry>,
    grid: Option<SizeGrid>,
    layout: Option<StateLayout>,
    elapsed: f64,
}

impl<K, L, SM> core::fmt::Debug for Crystallizer<K, L, SM> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Crystallizer")
            .field("elapsed", &self.elapsed)
            .finish_non_exhaustive()
    }
}

impl<K, L, SM> Crystallizer<K, L, SM>
where
    K: CrystalKinetics,
    L: LiquidModel,
    SM: SolidModel,
{
    /// Attach the liquid and solid phase states.
    ///
    /// Validates the solid contents against the configured discretization
    /// and the target species against the liquid composition, fixes the
    /// state layout, and rewinds the elapsed-time clock.
    pub fn attach_phases(&mut self, liquid: LiquidState, solid: SolidState) -> Result<(), CrystError> {
        self.attach_slurry(Slurry::new(liquid, solid))
    }

    pub fn attach_slurry(&mut self, slurry: Slurry) -> Result<(), CrystError> {
        let n_distr = match (&self.settings.method, &slurry.solid.contents) {
            (DiscretizationMethod::Moments { n_moments }, SolidContents::Moments(m)) => {
                if m.len() != *n_moments {
                    return Err(AttachError::UnsupportedPhases(format!(
                        "{} moments attached, method tracks {n_moments}",
                        m.len()
                    ))
                    .into());
                }
                m.len()
            }
            (DiscretizationMethod::FiniteVolume, SolidContents::Distribution(f)) => {
                let grid = slurry.solid.grid.as_ref().ok_or_else(|| {
                    attach_error!(Other, "distribution phase carries no size grid")
                })?;
                if f.len() != grid.len() {
                    return Err(AttachError::UnsupportedPhases(format!(
                        "distribution has {} cells, grid has {}",
                        f.len(),
                        grid.len()
                    ))
                    .into());
                }
                f.len()
            }
            (DiscretizationMethod::Moments { .. }, SolidContents::Distribution(_)) => {
                return Err(AttachError::UnsupportedPhases(
                    "moment method needs a moment-based solid phase".into(),
                )
                .into());
            }
            (DiscretizationMethod::FiniteVolume, SolidContents::Moments(_)) => {
                return Err(AttachError::UnsupportedPhases(
                    "finite-volume method needs a distribution-based solid phase".into(),
                )
                .into());
            }
        };

        let n_species = slurry.liquid.mass_conc.len();
        if self.settings.target_index >= n_species {
            return Err(AttachError::TargetSpeciesOutOfRange {
                index: self.settings.target_index,
                species: n_species,
            }
            .into());
        }

        self.layout = Some(StateLayout::new(
            n_distr,
            n_species,
            self.settings.mode.tracks_volume(),
            self.track_temperature,
            self.track_jacket,
        ));
        self.grid = slurry.solid.grid.clone();
        self.initial = Some(slurry.clone());
        self.slurry = Some(slurry);
        self.elapsed = 0.0;
        Ok(())
    }

    /// Attach the feed stream for continuous or semibatch operation.
    pub fn attach_inlet<I: Inlet + 'static>(&mut self, inlet: I) -> Result<(), CrystError> {
        if !self.settings.mode.has_inlet() {
            return Err(attach_error!(Other, "batch operation takes no inlet"));
        }
        self.inlet = Some(Box::new(inlet));
        Ok(())
    }

    /// Restore the phases attached initially and rewind the clock.
    pub fn reset(&mut self) {
        self.slurry = self.initial.clone();
        self.elapsed = 0.0;
    }

    pub fn kinetics(&self) -> &K {
        &self.kinetics
    }

    /// Mutable access to the kinetics, e.g. for a parameter estimation
    /// loop updating parameters between runs.
    pub fn kinetics_mut(&mut self) -> &mut K {
        &mut self.kinetics
    }

    /// Simulated time consumed by previous runs, s.
    pub fn elapsed_time(&self) -> f64 {
        self.elapsed
    }

    /// The current phase states, once attached.
    pub fn slurry(&self) -> Option<&Slurry> {
        self.slurry.as_ref()
    }

    pub fn layout(&self) -> Option<&StateLayout> {
        self.layout.as_ref()
    }

    /// Integrate for `duration` seconds from the current phase state,
    /// with output times chosen by the integrator.
    pub fn solve(
        &mut self,
        duration: f64,
        options: &SolverOptions,
    ) -> Result<SimulationResults, CrystError> {
        if !duration.is_finite() || duration <= 0.0 {
            return Err(SolveError::NonPositiveDuration(duration).into());
        }
        self.run(RunOutput::Duration(duration), options, false)
    }

    /// Integrate with dense output at the given absolute times.
    ///
    /// The grid must be strictly increasing and start at or after the
    /// elapsed time of the crystallizer.
    pub fn solve_with_times(
        &mut self,
        times: &[f64],
        options: &SolverOptions,
    ) -> Result<SimulationResults, CrystError> {
        self.validate_time_grid(times)?;
        self.run(RunOutput::Times(times), options, false)
    }

    /// Integrate with dense output and forward sensitivities of the
    /// states with respect to the free kinetic parameters.
    pub fn solve_sensitivities(
        &mut self,
        times: &[f64],
        options: &SolverOptions,
    ) -> Result<SimulationResults, CrystError> {
        if self.mask.n_free() == 0 {
            return Err(ConfigError::NoFreeParameters.into());
        }
        self.validate_time_grid(times)?;
        self.run(RunOutput::Times(times), options, true)
    }

    /// Analytical steady state of a continuous crystallizer at the given
    /// temperature, seeded from `seed_frac`. Continuous operation with a
    /// finite-volume population only.
    pub fn solve_steady_state(
        &self,
        seed_frac: f64,
        temp: f64,
    ) -> Result<SteadyStateResult, CrystError> {
        if self.settings.mode != OperatingMode::Msmpr || !self.settings.method.is_finite_volume() {
            return Err(ConfigError::Other(
                "steady state solve needs continuous operation with a finite-volume population"
                    .into(),
            )
            .into());
        }
        let slurry = self.slurry.as_ref().ok_or(AttachError::PhasesNotAttached)?;
        let grid = self.grid.as_ref().ok_or(AttachError::PhasesNotAttached)?;
        let inlet = self.inlet.as_deref().ok_or(AttachError::InletNotAttached)?;

        let feed = inlet.conditions(self.elapsed);
        let vol_slurry = slurry.total_volume(self.settings.size_scale)?;
        let tau_inv = feed.vol_flow / vol_slurry;

        let target = self.settings.target_index;
        let w_raw = feed.mass_conc.get(target).copied().unwrap_or(0.0);
        // The balance is written in mass fractions.
        let w_in = match self.settings.basis {
            CompositionBasis::MassFraction => w_raw,
            CompositionBasis::MassConcentration => {
                let rho = self.liquid.density(&feed.mass_conc, feed.temp);
                w_raw / rho
            }
        };

        steady_state::solve_msmpr_steady_state(
            &self.kinetics,
            self.kinetics.params(),
            grid,
            slurry.solid.shape_factor,
            self.solid.density(temp),
            tau_inv,
            w_in,
            seed_frac,
            temp,
        )
    }

    fn validate_time_grid(&self, times: &[f64]) -> Result<(), CrystError> {
        if times.is_empty() || times[0] < self.elapsed {
            return Err(SolveError::InvalidTimeGrid.into());
        }
        if times.windows(2).any(|w| w[1] <= w[0]) {
            return Err(SolveError::InvalidTimeGrid.into());
        }
        Ok(())
    }

    fn validate_feed(&self, n_distr: usize, n_species: usize) -> Result<(), CrystError> {
        if !self.settings.mode.has_inlet() {
            return Ok(());
        }
        let inlet = self.inlet.as_deref().ok_or(AttachError::InletNotAttached)?;
        let feed = inlet.conditions(self.elapsed);
        if feed.mass_conc.len() != n_species {
            return Err(AttachError::FeedSpeciesMismatch {
                expected: n_species,
                found: feed.mass_conc.len(),
            }
            .into());
        }
        if let Some(distrib) = &feed.distrib {
            if distrib.len() != n_distr {
                return Err(AttachError::FeedDistributionMismatch {
                    expected: n_distr,
                    found: distrib.len(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Assemble the scaled initial state vector from the attached phases.
    ///
    /// Batch and semibatch integrate total crystal quantities; the
    /// per-volume phase contents are multiplied by the slurry volume, and
    /// the volume state starts at the total slurry volume.
    fn initial_state(&self, slurry: &Slurry, layout: &StateLayout, vol_total: f64) -> Vec<f64> {
        let settings = &self.settings;
        let mut x0 = Vec::with_capacity(layout.n_states());
        let values = slurry.solid.contents.values();
        match settings.method {
            DiscretizationMethod::Moments { .. } => {
                x0.extend(
                    values
                        .iter()
                        .enumerate()
                        .map(|(k, &m)| settings.scale.scale_moment(m, k)),
                );
            }
            DiscretizationMethod::FiniteVolume => {
                x0.extend(values.iter().map(|&f| settings.scale.scale_density(f)));
            }
        }
        if settings.mode.tracks_volume() {
            for state in x0.iter_mut() {
                *state *= vol_total;
            }
        }
        x0.extend_from_slice(&slurry.liquid.mass_conc);
        if layout.has(Block::Volume) {
            x0.push(vol_total);
        }
        if layout.has(Block::Temperature) {
            x0.push(slurry.liquid.temp);
        }
        if layout.has(Block::JacketTemperature) {
            x0.push(slurry.liquid.temp);
        }
        x0
    }

    fn run(
        &mut self,
        output: RunOutput<'_>,
        options: &SolverOptions,
        with_sens: bool,
    ) -> Result<SimulationResults, CrystError> {
        let layout = self
            .layout
            .clone()
            .ok_or(AttachError::PhasesNotAttached)?;
        let n_distr = layout.len(Block::Distribution).unwrap_or(0);
        let n_species = layout.len(Block::Composition).unwrap_or(0);
        self.validate_feed(n_distr, n_species)?;

        let slurry = self.slurry.as_ref().ok_or(AttachError::PhasesNotAttached)?;
        let t_zero = self.elapsed;
        let temp_zero = slurry.liquid.temp;
        let shape_factor = slurry.solid.shape_factor;
        let vol_slurry = slurry.total_volume(self.settings.size_scale)?;
        let x0 = self.initial_state(slurry, &layout, vol_slurry);
        let (p_free, fixed_params) = self.mask.split(self.kinetics.params());

        let (times, states, sens) = {
            let ctx = RhsContext {
                settings: &self.settings,
                kinetics: &self.kinetics,
                liquid: &self.liquid,
                solid: &self.solid,
                mask: &self.mask,
                fixed_params,
                population: match &self.grid {
                    Some(grid) => Population::FiniteVolume(grid),
                    None => Population::Moments,
                },
                inlet: self.inlet.as_deref(),
                profile: self.profile.as_deref(),
                media: self.media,
                shape_factor,
                t_zero,
                temp_zero,
                vol_slurry,
                n_distr,
                n_species,
                vol_index: layout.offset(Block::Volume),
                temp_index: layout.offset(Block::Temperature),
                ht_index: layout.offset(Block::JacketTemperature),
            };

            match (self.settings.method.is_moments(), with_sens) {
                (true, false) => {
                    let (t, s) =
                        integrate_moments(&ctx, self.strategy, &x0, &p_free, t_zero, output, options)?;
                    (t, s, None)
                }
                (true, true) => {
                    let RunOutput::Times(times) = output else {
                        unreachable!("sensitivity runs always carry a time grid");
                    };
                    let (t, s, g) = integrate_moments_sens(
                        &ctx,
                        self.strategy,
                        &x0,
                        &p_free,
                        t_zero,
                        times,
                        options,
                    )?;
                    (t, s, Some(g))
                }
                (false, false) => {
                    let (t, s) =
                        integrate_cells(&ctx, self.strategy, &x0, &p_free, t_zero, output, options)?;
                    (t, s, None)
                }
                (false, true) => {
                    let RunOutput::Times(times) = output else {
                        unreachable!("sensitivity runs always carry a time grid");
                    };
                    let (t, s, g) = integrate_cells_sens(
                        &ctx,
                        self.strategy,
                        &x0,
                        &p_free,
                        t_zero,
                        times,
                        options,
                    )?;
                    (t, s, Some(g))
                }
            }
        };

        // The sample at the run's starting instant is zero by convention,
        // whatever the integrator reports there.
        let sens = sens.map(|mut mats| {
            if times.first() == Some(&t_zero) {
                if let Some(first) = mats.first_mut() {
                    first.fill(0.0);
                }
            }
            mats
        });

        let t_final = times.last().copied().unwrap_or(t_zero);
        let final_raw = states.last().cloned().unwrap_or_default();
        let fallback = self.fallback_temperature(&layout, &times, t_zero, temp_zero);
        let results = SimulationResults::decode(
            &layout,
            self.settings.scale,
            self.settings.method,
            self.grid.as_ref(),
            times,
            states,
            fallback,
            sens,
        );
        self.update_phases(&layout, &final_raw, t_final, t_zero, temp_zero)?;
        self.elapsed = t_final;
        Ok(results)
    }

    /// Tank temperature series for runs where it is not a state.
    fn fallback_temperature(
        &self,
        layout: &StateLayout,
        times: &[f64],
        t_zero: f64,
        temp_zero: f64,
    ) -> Option<Vec<f64>> {
        if layout.has(Block::Temperature) {
            return None;
        }
        Some(
            times
                .iter()
                .map(|&t| match &self.profile {
                    Some(profile) => profile.temperature(t, t_zero, temp_zero),
                    None => temp_zero,
                })
                .collect(),
        )
    }

    /// Write the final integrator state back into the phases.
    ///
    /// Batch and semibatch states hold total crystal quantities; they are
    /// divided by the final slurry volume so the phases keep per-volume
    /// contents and a resumed run reassembles the same totals.
    fn update_phases(
        &mut self,
        layout: &StateLayout,
        final_raw: &[f64],
        t_final: f64,
        t_zero: f64,
        temp_zero: f64,
    ) -> Result<(), CrystError> {
        if final_raw.is_empty() {
            return Ok(());
        }
        let settings = &self.settings;
        let n_distr = layout.len(Block::Distribution).unwrap_or(0);
        let n_species = layout.len(Block::Composition).unwrap_or(0);

        let mut distr: Vec<f64> = match settings.method {
            DiscretizationMethod::Moments { .. } => final_raw[..n_distr]
                .iter()
                .enumerate()
                .map(|(k, &m)| settings.scale.unscale_moment(m, k))
                .collect(),
            DiscretizationMethod::FiniteVolume => final_raw[..n_distr]
                .iter()
                .map(|&f| settings.scale.unscale_density(f))
                .collect(),
        };
        let conc = final_raw[n_distr..n_distr + n_species].to_vec();

        let temp = match layout.offset(Block::Temperature) {
            Some(i) => final_raw[i],
            None => match &self.profile {
                Some(profile) => profile.temperature(t_final, t_zero, temp_zero),
                None => temp_zero,
            },
        };

        let grid = self.grid.as_ref();
        let slurry = self.slurry.as_mut().ok_or(AttachError::PhasesNotAttached)?;

        if settings.mode.tracks_volume() {
            let vol_liq = layout
                .offset(Block::Volume)
                .map(|i| final_raw[i])
                .unwrap_or(slurry.liquid.vol);
            let mu3 = match (settings.method, grid) {
                (DiscretizationMethod::Moments { .. }, _) => distr.get(3).copied().unwrap_or(0.0),
                (DiscretizationMethod::FiniteVolume, Some(grid)) => {
                    grid.moment_raw(distr.as_slice(), 3)
                }
                (DiscretizationMethod::FiniteVolume, None) => 0.0,
            };
            let vol_solid = slurry.solid.shape_factor * mu3 * settings.size_scale.powi(3);
            let vol_total = vol_liq + vol_solid;
            if vol_total > 0.0 {
                for value in distr.iter_mut() {
                    *value /= vol_total;
                }
            }
            slurry.liquid.vol = vol_liq;
        }

        slurry.liquid.mass_conc = conc;
        slurry.liquid.temp = temp;
        slurry.solid.temp = temp;
        slurry.solid.contents = match &slurry.solid.contents {
            SolidContents::Moments(_) => SolidContents::Moments(distr),
            SolidContents::Distribution(_) => SolidContents::Distribution(distr),
        };
        Ok(())
    }
}

/// `y = J v` with the configured backend, full parameters merged inside.
fn apply_jacobian<K, L, SM>(
    ctx: &RhsContext<'_, K, L, SM>,
    strategy: JacobianStrategy,
    rtol: f64,
    x: &[f64],
    p: &[f64],
    t: f64,
    v: &[f64],
    y: &mut [f64],
) where
    K: CrystalKinetics,
    L: LiquidModel,
    SM: SolidModel,
{
    match strategy {
        JacobianStrategy::FiniteDifference => {
            jacobian::fd_jacobian_product(ctx, x, p, t, v, rtol, y);
        }
        JacobianStrategy::Autodiff => {
            #[cfg(feature = "autodiff")]
            jacobian::ad_jacobian_product(ctx, x, p, t, v, y);
            #[cfg(not(feature = "autodiff"))]
            unreachable!("rejected when the crystallizer was built");
        }
        JacobianStrategy::Analytical => {
            let params = ctx.mask.merge(p, &ctx.fixed_params);
            let jac = jacobian::analytical_state_jacobian(ctx, x, &params, t);
            for (i, slot) in y.iter_mut().enumerate() {
                *slot = v
                    .iter()
                    .enumerate()
                    .map(|(j, &vj)| jac[(i, j)] * vj)
                    .sum();
            }
        }
    }
}

/// `y = (df/dp) v` over the free parameters.
fn apply_sensitivity<K, L, SM>(
    ctx: &RhsContext<'_, K, L, SM>,
    strategy: JacobianStrategy,
    rtol: f64,
    x: &[f64],
    p: &[f64],
    t: f64,
    v: &[f64],
    y: &mut [f64],
) where
    K: CrystalKinetics,
    L: LiquidModel,
    SM: SolidModel,
{
    match strategy {
        JacobianStrategy::FiniteDifference => {
            jacobian::fd_sens_product(ctx, x, p, t, v, rtol, y);
        }
        JacobianStrategy::Autodiff => {
            #[cfg(feature = "autodiff")]
            jacobian::ad_sens_product(ctx, x, p, t, v, y);
            #[cfg(not(feature = "autodiff"))]
            unreachable!("rejected when the crystallizer was built");
        }
        JacobianStrategy::Analytical => {
            let params = ctx.mask.merge(p, &ctx.fixed_params);
            let jac = jacobian::analytical_param_jacobian(ctx, x, &params, t);
            for (i, slot) in y.iter_mut().enumerate() {
                *slot = v
                    .iter()
                    .enumerate()
                    .map(|(j, &vj)| jac[(i, j)] * vj)
                    .sum();
            }
        }
    }
}

/// Moment systems are small and dense; integrate on a dense matrix with
/// a direct LU solve.
fn integrate_moments<K, L, SM>(
    ctx: &RhsContext<'_, K, L, SM>,
    strategy: JacobianStrategy,
    x0: &[f64],
    p_free: &[f64],
    t0: f64,
    output: RunOutput<'_>,
    options: &SolverOptions,
) -> Result<(Vec<f64>, Vec<Vec<f64>>), CrystError>
where
    K: CrystalKinetics,
    L: LiquidModel,
    SM: SolidModel,
{
    let n = x0.len();
    let x_init = x0.to_vec();
    let rtol = options.rtol;
    let rhs = move |x: &NalgebraVec<f64>, p: &NalgebraVec<f64>, t: f64, y: &mut NalgebraVec<f64>| {
        ctx.rhs(x.as_slice(), p.as_slice(), t, y.as_mut_slice());
    };
    let jac = move |x: &NalgebraVec<f64>,
                    p: &NalgebraVec<f64>,
                    t: f64,
                    v: &NalgebraVec<f64>,
                    y: &mut NalgebraVec<f64>| {
        apply_jacobian(
            ctx,
            strategy,
            rtol,
            x.as_slice(),
            p.as_slice(),
            t,
            v.as_slice(),
            y.as_mut_slice(),
        );
    };
    let init = move |_p: &NalgebraVec<f64>, _t: f64, y: &mut NalgebraVec<f64>| {
        y.as_mut_slice().copy_from_slice(&x_init);
    };

    let mut builder = OdeBuilder::<NalgebraMat<f64>>::new()
        .t0(t0)
        .rtol(options.rtol)
        .atol([options.atol])
        .p(p_free.to_vec());
    if let Some(h0) = options.h0 {
        builder = builder.h0(h0);
    }
    let problem = builder
        .rhs_implicit(rhs, jac)
        .init(init, n)
        .build()
        .map_err(SolveError::Integrator)?;
    let mut solver = problem.bdf::<NalgebraLU<f64>>().map_err(SolveError::Integrator)?;

    match output {
        RunOutput::Duration(duration) => {
            let (ys, ts) = solver
                .solve(t0 + duration)
                .map_err(SolveError::Integrator)?;
            Ok((ts, matrix_rows(&ys)))
        }
        RunOutput::Times(times) => {
            let ys = solver.solve_dense(times).map_err(SolveError::Integrator)?;
            Ok((times.to_vec(), matrix_rows(&ys)))
        }
    }
}

fn integrate_moments_sens<K, L, SM>(
    ctx: &RhsContext<'_, K, L, SM>,
    strategy: JacobianStrategy,
    x0: &[f64],
    p_free: &[f64],
    t0: f64,
    times: &[f64],
    options: &SolverOptions,
) -> Result<(Vec<f64>, Vec<Vec<f64>>, Vec<DMatrix<f64>>), CrystError>
where
    K: CrystalKinetics,
    L: LiquidModel,
    SM: SolidModel,
{
    let n = x0.len();
    let x_init = x0.to_vec();
    let rtol = options.rtol;
    let rhs = move |x: &NalgebraVec<f64>, p: &NalgebraVec<f64>, t: f64, y: &mut NalgebraVec<f64>| {
        ctx.rhs(x.as_slice(), p.as_slice(), t, y.as_mut_slice());
    };
    let jac = move |x: &NalgebraVec<f64>,
                    p: &NalgebraVec<f64>,
                    t: f64,
                    v: &NalgebraVec<f64>,
                    y: &mut NalgebraVec<f64>| {
        apply_jacobian(
            ctx,
            strategy,
            rtol,
            x.as_slice(),
            p.as_slice(),
            t,
            v.as_slice(),
            y.as_mut_slice(),
        );
    };
    let sens = move |x: &NalgebraVec<f64>,
                     p: &NalgebraVec<f64>,
                     t: f64,
                     v: &NalgebraVec<f64>,
                     y: &mut NalgebraVec<f64>| {
        apply_sensitivity(
            ctx,
            strategy,
            rtol,
            x.as_slice(),
            p.as_slice(),
            t,
            v.as_slice(),
            y.as_mut_slice(),
        );
    };
    let init = move |_p: &NalgebraVec<f64>, _t: f64, y: &mut NalgebraVec<f64>| {
        y.as_mut_slice().copy_from_slice(&x_init);
    };
    let init_sens =
        |_p: &NalgebraVec<f64>, _t: f64, _v: &NalgebraVec<f64>, y: &mut NalgebraVec<f64>| {
            y.as_mut_slice().fill(0.0);
        };

    let mut builder = OdeBuilder::<NalgebraMat<f64>>::new()
        .t0(t0)
        .rtol(options.rtol)
        .atol([options.atol])
        .p(p_free.to_vec());
    if let Some(h0) = options.h0 {
        builder = builder.h0(h0);
    }
    if let Some(sens_rtol) = options.sens_rtol {
        builder = builder.sens_rtol(sens_rtol);
    }
    if let Some(sens_atol) = options.sens_atol {
        builder = builder.sens_atol([sens_atol]);
    }
    let problem = builder
        .rhs_sens_implicit(rhs, jac, sens)
        .init_sens(init, init_sens, n)
        .build()
        .map_err(SolveError::Integrator)?;
    let mut solver = problem
        .bdf_sens::<NalgebraLU<f64>>()
        .map_err(SolveError::Integrator)?;

    let (ys, sens_mats) = solver
        .solve_dense_sensitivities(times)
        .map_err(SolveError::Integrator)?;
    Ok((
        times.to_vec(),
        matrix_rows(&ys),
        sensitivity_matrices(&sens_mats, n, times.len()),
    ))
}

/// Finite-volume systems have a banded population block; integrate on a
/// sparse matrix with coloring-assisted jacobian assembly.
fn integrate_cells<K, L, SM>(
    ctx: &RhsContext<'_, K, L, SM>,
    strategy: JacobianStrategy,
    x0: &[f64],
    p_free: &[f64],
    t0: f64,
    output: RunOutput<'_>,
    options: &SolverOptions,
) -> Result<(Vec<f64>, Vec<Vec<f64>>), CrystError>
where
    K: CrystalKinetics,
    L: LiquidModel,
    SM: SolidModel,
{
    let n = x0.len();
    let x_init = x0.to_vec();
    let rtol = options.rtol;
    let rhs = move |x: &FaerVec<f64>, p: &FaerVec<f64>, t: f64, y: &mut FaerVec<f64>| {
        ctx.rhs(x.as_slice(), p.as_slice(), t, y.as_mut_slice());
    };
    let jac = move |x: &FaerVec<f64>,
                    p: &FaerVec<f64>,
                    t: f64,
                    v: &FaerVec<f64>,
                    y: &mut FaerVec<f64>| {
        apply_jacobian(
            ctx,
            strategy,
            rtol,
            x.as_slice(),
            p.as_slice(),
            t,
            v.as_slice(),
            y.as_mut_slice(),
        );
    };
    let init = move |_p: &FaerVec<f64>, _t: f64, y: &mut FaerVec<f64>| {
        y.as_mut_slice().copy_from_slice(&x_init);
    };

    let mut builder = OdeBuilder::<FaerSparseMat<f64>>::new()
        .t0(t0)
        .rtol(options.rtol)
        .atol([options.atol])
        .p(p_free.to_vec())
        .use_coloring(true);
    if let Some(h0) = options.h0 {
        builder = builder.h0(h0);
    }
    let problem = builder
        .rhs_implicit(rhs, jac)
        .init(init, n)
        .build()
        .map_err(SolveError::Integrator)?;
    let mut solver = problem
        .bdf::<FaerSparseLU<f64>>()
        .map_err(SolveError::Integrator)?;

    match output {
        RunOutput::Duration(duration) => {
            let (ys, ts) = solver
                .solve(t0 + duration)
                .map_err(SolveError::Integrator)?;
            Ok((ts, matrix_rows(&ys)))
        }
        RunOutput::Times(times) => {
            let ys = solver.solve_dense(times).map_err(SolveError::Integrator)?;
            Ok((times.to_vec(), matrix_rows(&ys)))
        }
    }
}

fn integrate_cells_sens<K, L, SM>(
    ctx: &RhsContext<'_, K, L, SM>,
    strategy: JacobianStrategy,
    x0: &[f64],
    p_free: &[f64],
    t0: f64,
    times: &[f64],
    options: &SolverOptions,
) -> Result<(Vec<f64>, Vec<Vec<f64>>, Vec<DMatrix<f64>>), CrystError>
where
    K: CrystalKinetics,
    L: LiquidModel,
    SM: SolidModel,
{
    let n = x0.len();
    let x_init = x0.to_vec();
    let rtol = options.rtol;
    let rhs = move |x: &FaerVec<f64>, p: &FaerVec<f64>, t: f64, y: &mut FaerVec<f64>| {
        ctx.rhs(x.as_slice(), p.as_slice(), t, y.as_mut_slice());
    };
    let jac = move |x: &FaerVec<f64>,
                    p: &FaerVec<f64>,
                    t: f64,
                    v: &FaerVec<f64>,
                    y: &mut FaerVec<f64>| {
        apply_jacobian(
            ctx,
            strategy,
            rtol,
            x.as_slice(),
            p.as_slice(),
            t,
            v.as_slice(),
            y.as_mut_slice(),
        );
    };
    let sens = move |x: &FaerVec<f64>,
                     p: &FaerVec<f64>,
                     t: f64,
                     v: &FaerVec<f64>,
                     y: &mut FaerVec<f64>| {
        apply_sensitivity(
            ctx,
            strategy,
            rtol,
            x.as_slice(),
            p.as_slice(),
            t,
            v.as_slice(),
            y.as_mut_slice(),
        );
    };
    let init = move |_p: &FaerVec<f64>, _t: f64, y: &mut FaerVec<f64>| {
        y.as_mut_slice().copy_from_slice(&x_init);
    };
    let init_sens = |_p: &FaerVec<f64>, _t: f64, _v: &FaerVec<f64>, y: &mut FaerVec<f64>| {
        y.as_mut_slice().fill(0.0);
    };

    let mut builder = OdeBuilder::<FaerSparseMat<f64>>::new()
        .t0(t0)
        .rtol(options.rtol)
        .atol([options.atol])
        .p(p_free.to_vec())
        .use_coloring(true);
    if let Some(h0) = options.h0 {
        builder = builder.h0(h0);
    }
    if let Some(sens_rtol) = options.sens_rtol {
        builder = builder.sens_rtol(sens_rtol);
    }
    if let Some(sens_atol) = options.sens_atol {
        builder = builder.sens_atol([sens_atol]);
    }
    let problem = builder
        .rhs_sens_implicit(rhs, jac, sens)
        .init_sens(init, init_sens, n)
        .build()
        .map_err(SolveError::Integrator)?;
    let mut solver = problem
        .bdf_sens::<FaerSparseLU<f64>>()
        .map_err(SolveError::Integrator)?;

    let (ys, sens_mats) = solver
        .solve_dense_sensitivities(times)
        .map_err(SolveError::Integrator)?;
    Ok((
        times.to_vec(),
        matrix_rows(&ys),
        sensitivity_matrices(&sens_mats, n, times.len()),
    ))
}

/// Solver output columns as per-time state rows.
fn matrix_rows<D: DenseMatrix<T = f64>>(ys: &D) -> Vec<Vec<f64>> {
    (0..ys.ncols())
        .map(|j| (0..ys.nrows()).map(|i| ys.get_index(i, j)).collect())
        .collect()
}

/// Per-parameter solver output regrouped as one `n_states x n_free`
/// matrix per output time.
fn sensitivity_matrices<D: DenseMatrix<T = f64>>(
    sens: &[D],
    n_states: usize,
    n_times: usize,
) -> Vec<DMatrix<f64>> {
    (0..n_times)
        .map(|ti| DMatrix::from_fn(n_states, sens.len(), |i, j| sens[j].get_index(i, ti)))
        .collect()
}

#[cfg(test)]
mod sim_tests;
