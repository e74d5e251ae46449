//! Analytical MSMPR steady state.
//!
//! At steady state with size-independent growth, clear feed and
//! negligible secondary nucleation the population balance has the
//! closed-form solution `f(x) = (B/G) exp(-x / (G tau))`. What remains
//! is a scalar root find on the target-species balance, closed here
//! with a secant iteration.

use crate::error::{CrystError, SolveError};
use crate::grid::SizeGrid;
use crate::kinetics::{CrystalKinetics, KineticConditions};
use serde::Serialize;

/// Termination tolerance on successive secant iterates, roughly the
/// square root of machine epsilon.
const TOL: f64 = 1.48e-8;
const MAX_ITER: usize = 50;

/// Converged steady state of a continuous crystallizer.
#[derive(Debug, Clone, Serialize)]
pub struct SteadyStateResult {
    /// Mass fraction of the target species in the tank liquid.
    pub mass_frac: f64,
    /// Steady-state number density on the vessel's size grid.
    pub distribution: Vec<f64>,
    /// Residual of the species balance at the returned fraction.
    pub residual: f64,
    /// Secant iterations consumed.
    pub iterations: usize,
}

/// Solve the steady-state species balance
/// `-3 kv rho_c G mu_2 + (w_in - w) / tau = 0` for the tank fraction
/// `w`, starting the secant iteration from `seed_frac`.
///
/// Kinetics are evaluated at the prescribed temperature with a clear
/// tank (`mu_3 = 0`), so secondary nucleation laws contribute nothing.
#[allow(clippy::too_many_arguments)]
pub(crate) fn solve_msmpr_steady_state<K: CrystalKinetics>(
    kinetics: &K,
    params: &[f64],
    grid: &SizeGrid,
    shape_factor: f64,
    crystal_density: f64,
    tau_inv: f64,
    w_in: f64,
    seed_frac: f64,
    temp: f64,
) -> Result<SteadyStateResult, CrystError> {
    let evaluate = |w: f64| -> Result<(Vec<f64>, f64), CrystError> {
        let cond = KineticConditions {
            conc_target: w,
            temp,
            shape_factor,
            mu3: 0.0,
        };
        let rates = kinetics.rates(params, &cond);
        let growth = rates.growth;
        if growth <= 0.0 {
            return Err(SolveError::NonPositiveGrowth(growth).into());
        }
        let f_zero = rates.nucleation() / growth;
        let decay = tau_inv / growth;
        let density: Vec<f64> = grid
            .centers()
            .iter()
            .map(|&x| f_zero * (-decay * x).exp())
            .collect();
        let mu2 = grid.moment_raw(&density, 2);
        let kinetic_term = -3.0 * shape_factor * crystal_density * growth * mu2;
        let flow_term = tau_inv * (w_in - w);
        Ok((density, kinetic_term + flow_term))
    };

    let mut p0 = seed_frac;
    let delta = if p0 >= 0.0 { 1e-4 } else { -1e-4 };
    let mut p1 = p0 * (1.0 + 1e-4) + delta;
    let mut q0 = evaluate(p0)?.1;
    let mut q1 = evaluate(p1)?.1;

    let mut converged = None;
    for itr in 0..MAX_ITER {
        if q1 == q0 {
            if (p1 - p0).abs() > TOL {
                return Err(SolveError::SteadyStateDiverged {
                    iterations: itr,
                    residual: q1,
                }
                .into());
            }
            converged = Some((0.5 * (p0 + p1), itr + 1));
            break;
        }
        // Weighted secant update, stable when the residuals differ in
        // magnitude.
        let p = if q1.abs() > q0.abs() {
            (-q0 / q1 * p1 + p0) / (1.0 - q0 / q1)
        } else {
            (-q1 / q0 * p0 + p1) / (1.0 - q1 / q0)
        };
        if (p - p1).abs() <= TOL {
            converged = Some((p, itr + 1));
            break;
        }
        p0 = p1;
        q0 = q1;
        p1 = p;
        q1 = evaluate(p1)?.1;
    }

    let (mass_frac, iterations) = converged.ok_or(SolveError::SteadyStateDiverged {
        iterations: MAX_ITER,
        residual: q1,
    })?;
    let (distribution, residual) = evaluate(mass_frac)?;

    Ok(SteadyStateResult {
        mass_frac,
        distribution,
        residual,
        iterations,
    })
}
