//! Jacobian backends.
//!
//! The implicit integrator needs jacobian-vector products of the model
//! equations, and sensitivity runs additionally need products with the
//! parameter jacobian. Three interchangeable backends provide them:
//!
//! * [`JacobianStrategy::FiniteDifference`]: column-accumulated central
//!   differences of the right-hand side. Always available.
//! * [`JacobianStrategy::Autodiff`]: forward-mode dual numbers pushed
//!   through the generic right-hand side. Needs the `autodiff` feature.
//! * [`JacobianStrategy::Analytical`]: hand-assembled partials for
//!   batch moment models whose kinetics provide
//!   [`crate::kinetics::CrystalKinetics::rate_partials`].
//!
//! All three differentiate the same [`RhsContext::rhs`] the integrator
//! sees, so switching backends changes cost, not the model.

use crate::balance::{Population, RhsContext};
use crate::kinetics::{CrystalKinetics, KineticConditions};
use crate::phase::{LiquidModel, SolidModel};
use crate::scalar::Real;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// How jacobian-vector products are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JacobianStrategy {
    #[default]
    FiniteDifference,
    Autodiff,
    Analytical,
}

/// Step for a central difference in one coordinate, relative to the
/// coordinate's magnitude with a unit floor.
fn fd_step(value: f64, rtol: f64) -> f64 {
    rtol.max(f64::EPSILON).sqrt() * value.abs().max(1.0)
}

/// `y = J * v` by central differences in the state.
///
/// Accumulated column by column over the nonzero components of `v`, with
/// the step sized per coordinate. The integrator assembles the jacobian
/// matrix by probing with unit and summed-unit vectors; a single
/// directional step cannot be conditioned for such probes once state
/// magnitudes span decades.
pub(crate) fn fd_jacobian_product<K, L, SM>(
    ctx: &RhsContext<'_, K, L, SM>,
    x: &[f64],
    p: &[f64],
    t: f64,
    v: &[f64],
    rtol: f64,
    y: &mut [f64],
) where
    K: CrystalKinetics,
    L: LiquidModel,
    SM: SolidModel,
{
    y.fill(0.0);
    let mut shifted = x.to_vec();
    let mut up = vec![0.0; y.len()];
    let mut down = vec![0.0; y.len()];
    for (j, &vj) in v.iter().enumerate() {
        if vj == 0.0 {
            continue;
        }
        let h = fd_step(x[j], rtol);
        shifted[j] = x[j] + h;
        ctx.rhs(&shifted, p, t, &mut up);
        shifted[j] = x[j] - h;
        ctx.rhs(&shifted, p, t, &mut down);
        shifted[j] = x[j];

        let w = vj / (2.0 * h);
        for ((slot, &u), &d) in y.iter_mut().zip(&up).zip(&down) {
            *slot += w * (u - d);
        }
    }
}

/// `y = (df/dp) * v` by central differences in the free parameters.
pub(crate) fn fd_sens_product<K, L, SM>(
    ctx: &RhsContext<'_, K, L, SM>,
    x: &[f64],
    p: &[f64],
    t: f64,
    v: &[f64],
    rtol: f64,
    y: &mut [f64],
) where
    K: CrystalKinetics,
    L: LiquidModel,
    SM: SolidModel,
{
    y.fill(0.0);
    let mut shifted = p.to_vec();
    let mut up = vec![0.0; y.len()];
    let mut down = vec![0.0; y.len()];
    for (j, &vj) in v.iter().enumerate() {
        if vj == 0.0 {
            continue;
        }
        let h = fd_step(p[j], rtol);
        shifted[j] = p[j] + h;
        ctx.rhs(x, &shifted, t, &mut up);
        shifted[j] = p[j] - h;
        ctx.rhs(x, &shifted, t, &mut down);
        shifted[j] = p[j];

        let w = vj / (2.0 * h);
        for ((slot, &u), &d) in y.iter_mut().zip(&up).zip(&down) {
            *slot += w * (u - d);
        }
    }
}

/// `y = J * v` with a dual number seeded along `v`.
#[cfg(feature = "autodiff")]
pub(crate) fn ad_jacobian_product<K, L, SM>(
    ctx: &RhsContext<'_, K, L, SM>,
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
    use num_dual::Dual64;

    let xd: Vec<Dual64> = x
        .iter()
        .zip(v)
        .map(|(&xi, &vi)| Dual64::new(xi, vi))
        .collect();
    let pd: Vec<Dual64> = p.iter().map(|&pi| Dual64::from(pi)).collect();
    let mut yd = vec![Dual64::from(0.0); y.len()];
    ctx.rhs(&xd, &pd, t, &mut yd);
    for (slot, d) in y.iter_mut().zip(&yd) {
        *slot = d.eps;
    }
}

/// `y = (df/dp) * v` with a dual number seeded along `v` in the free
/// parameters.
#[cfg(feature = "autodiff")]
pub(crate) fn ad_sens_product<K, L, SM>(
    ctx: &RhsContext<'_, K, L, SM>,
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
    use num_dual::Dual64;

    let xd: Vec<Dual64> = x.iter().map(|&xi| Dual64::from(xi)).collect();
    let pd: Vec<Dual64> = p
        .iter()
        .zip(v)
        .map(|(&pi, &vi)| Dual64::new(pi, vi))
        .collect();
    let mut yd = vec![Dual64::from(0.0); y.len()];
    ctx.rhs(&xd, &pd, t, &mut yd);
    for (slot, d) in y.iter_mut().zip(&yd) {
        *slot = d.eps;
    }
}

/// Quantities shared by the two analytical assemblies.
struct AnalyticalSetup {
    temp: f64,
    rho_liq: f64,
    rho_sol: f64,
    attenuation: f64,
    /// Physical moments, grid units.
    mu: Vec<f64>,
    vol_liq: f64,
    vol_slurry: f64,
    /// `rho_c * kv * sigma^3`.
    mass_factor: f64,
}

impl AnalyticalSetup {
    fn new<K, L, SM>(ctx: &RhsContext<'_, K, L, SM>, x: &[f64], params: &[f64], t: f64) -> Self
    where
        K: CrystalKinetics,
        L: LiquidModel,
        SM: SolidModel,
    {
        let settings = ctx.settings;
        let scale = settings.scale.value();
        let sigma3 = settings.size_scale.powi(3);

        let temp = match ctx.profile {
            Some(profile) => profile.temperature(t, ctx.t_zero, ctx.temp_zero),
            None => ctx.temp_zero,
        };

        let conc = &x[ctx.n_distr..ctx.n_distr + ctx.n_species];
        let rho_liq = ctx.liquid.density(conc, temp);
        let rho_sol = ctx.solid.density(temp);
        let attenuation = ctx.kinetics.growth_attenuation(params, conc);

        let mut mu = Vec::with_capacity(ctx.n_distr);
        let mut factor = 1.0;
        for &m in &x[..ctx.n_distr] {
            mu.push(m * factor);
            factor /= scale;
        }

        let vol_liq = ctx.vol_index.map(|i| x[i]).unwrap_or(ctx.vol_slurry);
        let vol_slurry = vol_liq + ctx.shape_factor * mu[3] * sigma3;

        Self {
            temp,
            rho_liq,
            rho_sol,
            attenuation,
            mu,
            vol_liq,
            vol_slurry,
            mass_factor: rho_sol * ctx.shape_factor * sigma3,
        }
    }

    fn conditions(&self, ctx_shape: f64, size_scale: f64, conc_target: f64) -> KineticConditions<f64> {
        KineticConditions {
            conc_target,
            temp: self.temp,
            shape_factor: ctx_shape,
            mu3: self.mu[3] * size_scale.powi(3),
        }
    }
}

/// Dense state jacobian of the batch moment equations.
///
/// Valid only for the configuration the builder admits to this backend:
/// batch operation, moment representation, mass concentration basis and
/// a temperature known in closed form. Liquid density and growth
/// attenuation are treated as state-independent, which matches the
/// constant-property models.
pub(crate) fn analytical_state_jacobian<K, L, SM>(
    ctx: &RhsContext<'_, K, L, SM>,
    x: &[f64],
    params: &[f64],
    t: f64,
) -> DMatrix<f64>
where
    K: CrystalKinetics,
    L: LiquidModel,
    SM: SolidModel,
{
    let settings = ctx.settings;
    let n = x.len();
    let mut jac = DMatrix::zeros(n, n);

    let setup = AnalyticalSetup::new(ctx, x, params, t);
    let conc = &x[ctx.n_distr..ctx.n_distr + ctx.n_species];
    let conc_target = conc[settings.target_index];
    let cond = setup.conditions(ctx.shape_factor, settings.size_scale, conc_target);

    let Some(partials) = ctx.kinetics.rate_partials(params, &cond) else {
        return jac;
    };

    let scale = settings.scale.value();
    let sigma3 = settings.size_scale.powi(3);
    let r0 = settings.nucleus_size;
    let tg = ctx.n_distr + settings.target_index;
    let atten = setup.attenuation;

    let rates = &partials.rates;
    let nucl = rates.prim_nucl + rates.sec_nucl;
    let growth_eff = rates.growth * atten + rates.dissol;
    let db_dc = partials.d_conc.prim_nucl + partials.d_conc.sec_nucl;
    let dg_dc = partials.d_conc.growth * atten + partials.d_conc.dissol;
    // chain to the meter-basis third moment
    let db_dmu3 = partials.d_mu3 * sigma3;

    // ----- population rows
    // zeroth moment: nucleation over the slurry volume
    jac[(0, 3)] = (setup.vol_slurry * db_dmu3 + nucl * ctx.shape_factor * sigma3)
        * scale.powi(-3);
    jac[(0, tg)] = setup.vol_slurry * db_dc;
    if let Some(vi) = ctx.vol_index {
        jac[(0, vi)] = nucl;
    }

    for k in 1..ctx.n_distr {
        let sk = scale.powi(k as i32);
        jac[(k, k - 1)] += k as f64 * growth_eff * scale;
        jac[(k, 3)] += r0.powi(k as i32) * db_dmu3 * sk * scale.powi(-3);
        jac[(k, tg)] =
            (k as f64 * setup.mu[k - 1] * dg_dc + r0.powi(k as i32) * db_dc) * sk;
    }

    // ----- mass transfer partials
    let transf =
        setup.mass_factor * (3.0 * growth_eff * setup.mu[2] + nucl * r0.powi(3));
    let dtr_dm2 = setup.mass_factor * 3.0 * growth_eff * scale.powi(-2);
    let dtr_dm3 = setup.mass_factor * r0.powi(3) * db_dmu3 * scale.powi(-3);
    let dtr_dc = setup.mass_factor * (3.0 * setup.mu[2] * dg_dc + r0.powi(3) * db_dc);

    // ----- composition rows
    let inv_vol = 1.0 / setup.vol_liq;
    for (i, &c) in conc.iter().enumerate() {
        let row = ctx.n_distr + i;
        let kron = (i == settings.target_index) as u8 as f64;
        let selector = kron - c / setup.rho_liq;

        jac[(row, 2)] = -dtr_dm2 * selector * inv_vol;
        jac[(row, 3)] = -dtr_dm3 * selector * inv_vol;
        jac[(row, tg)] += -dtr_dc * selector * inv_vol;
        jac[(row, row)] += transf / setup.rho_liq * inv_vol;
        if let Some(vi) = ctx.vol_index {
            jac[(row, vi)] = transf * selector * inv_vol * inv_vol;
        }
    }

    // ----- volume row
    if let Some(vi) = ctx.vol_index {
        jac[(vi, 2)] = -dtr_dm2 / setup.rho_liq;
        jac[(vi, 3)] = -dtr_dm3 / setup.rho_liq;
        jac[(vi, tg)] = -dtr_dc / setup.rho_liq;
    }

    jac
}

/// Dense parameter jacobian of the batch moment equations, free columns
/// only.
pub(crate) fn analytical_param_jacobian<K, L, SM>(
    ctx: &RhsContext<'_, K, L, SM>,
    x: &[f64],
    params: &[f64],
    t: f64,
) -> DMatrix<f64>
where
    K: CrystalKinetics,
    L: LiquidModel,
    SM: SolidModel,
{
    let settings = ctx.settings;
    let n = x.len();
    let free = ctx.mask.free_indices();
    let mut jac = DMatrix::zeros(n, free.len());

    let setup = AnalyticalSetup::new(ctx, x, params, t);
    let conc = &x[ctx.n_distr..ctx.n_distr + ctx.n_species];
    let conc_target = conc[settings.target_index];
    let cond = setup.conditions(ctx.shape_factor, settings.size_scale, conc_target);

    let Some(partials) = ctx.kinetics.rate_partials(params, &cond) else {
        return jac;
    };

    let scale = settings.scale.value();
    let r0 = settings.nucleus_size;
    let atten = setup.attenuation;
    let inv_vol = 1.0 / setup.vol_liq;

    for (col, &theta) in free.iter().enumerate() {
        let d = &partials.d_params[theta];
        let db = d.prim_nucl + d.sec_nucl;
        let dg = d.growth * atten + d.dissol;

        jac[(0, col)] = setup.vol_slurry * db;
        for k in 1..ctx.n_distr {
            jac[(k, col)] = (k as f64 * setup.mu[k - 1] * dg + r0.powi(k as i32) * db)
                * scale.powi(k as i32);
        }

        let dtr = setup.mass_factor * (3.0 * setup.mu[2] * dg + r0.powi(3) * db);
        for (i, &c) in conc.iter().enumerate() {
            let kron = (i == settings.target_index) as u8 as f64;
            jac[(ctx.n_distr + i, col)] = -dtr * (kron - c / setup.rho_liq) * inv_vol;
        }
        if let Some(vi) = ctx.vol_index {
            jac[(vi, col)] = -dtr / setup.rho_liq;
        }
    }

    jac
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::BalanceSettings;
    use crate::distribution::{
        CompositionBasis, DiscretizationMethod, OperatingMode, ScaleFactor,
    };
    use crate::kinetics::{ParameterMask, PowerLawKinetics};
    use crate::phase::{ConstantLiquid, ConstantSolid};
    use approx::assert_relative_eq;

    fn batch_settings() -> BalanceSettings {
        BalanceSettings {
            mode: OperatingMode::Batch,
            method: DiscretizationMethod::moments(),
            basis: CompositionBasis::MassConcentration,
            target_index: 0,
            scale: ScaleFactor::default(),
            size_scale: 1e-6,
            nucleus_size: 0.5,
            eps: f64::EPSILON,
            adiabatic: false,
            heat_of_crystallization: -1.46e4,
            heat_transfer_coeff: 1000.0,
            jacket_volume_fraction: 0.14,
            jacket_volume: None,
        }
    }

    fn kinetics() -> PowerLawKinetics {
        PowerLawKinetics::new([5.0, 0.0, 0.0])
            .with_primary_nucleation(2.0e5, 1.0e4, 2.0)
            .with_secondary_nucleation(1.0e8, 0.0, 1.0, 1.0)
            .with_growth(0.6, 8.0e3, 1.3)
            .with_reference_temperature(300.0)
    }

    fn context<'a>(
        cfg: &'a BalanceSettings,
        kin: &'a PowerLawKinetics,
        liquid: &'a ConstantLiquid,
        solid: &'a ConstantSolid,
        mask: &'a ParameterMask,
    ) -> RhsContext<'a, PowerLawKinetics, ConstantLiquid, ConstantSolid> {
        let (_, fixed) = mask.split(kin.params());
        RhsContext {
            settings: cfg,
            kinetics: kin,
            liquid,
            solid,
            mask,
            fixed_params: fixed,
            population: Population::Moments,
            inlet: None,
            profile: None,
            media: None,
            shape_factor: 0.52,
            t_zero: 0.0,
            temp_zero: 300.0,
            vol_slurry: 0.02,
            n_distr: 4,
            n_species: 1,
            vol_index: Some(5),
            temp_index: None,
            ht_index: None,
        }
    }

    fn state() -> Vec<f64> {
        vec![2.0e8, 6.0e9, 4.0e11, 3.0e13, 42.0, 0.018]
    }

    #[test]
    fn fd_product_of_zero_direction_is_zero() {
        let cfg = batch_settings();
        let kin = kinetics();
        let liquid = ConstantLiquid::new(1000.0, 4000.0);
        let solid = ConstantSolid::new(1300.0, 900.0);
        let mask = ParameterMask::all_fixed(kin.params().len());
        let ctx = context(&cfg, &kin, &liquid, &solid, &mask);

        let x = state();
        let v = vec![0.0; 6];
        let mut y = vec![1.0; 6];
        fd_jacobian_product(&ctx, &x, &[], 0.0, &v, 1e-6, &mut y);
        assert_eq!(y, vec![0.0; 6]);
    }

    /// Central difference in a single state coordinate, with a step
    /// proportional to that coordinate.
    fn column_fd(
        ctx: &RhsContext<'_, PowerLawKinetics, ConstantLiquid, ConstantSolid>,
        x: &[f64],
        j: usize,
    ) -> Vec<f64> {
        let h = 1e-5 * x[j].abs().max(1e-3);
        let mut up_x = x.to_vec();
        let mut down_x = x.to_vec();
        up_x[j] += h;
        down_x[j] -= h;
        let mut up = vec![0.0; x.len()];
        let mut down = vec![0.0; x.len()];
        ctx.rhs(&up_x, &[], 0.0, &mut up);
        ctx.rhs(&down_x, &[], 0.0, &mut down);
        up.iter()
            .zip(&down)
            .map(|(u, d)| (u - d) / (2.0 * h))
            .collect()
    }

    #[test]
    fn analytical_state_jacobian_matches_per_column_differences() {
        let cfg = batch_settings();
        let kin = kinetics();
        let liquid = ConstantLiquid::new(1000.0, 4000.0);
        let solid = ConstantSolid::new(1300.0, 900.0);
        let mask = ParameterMask::all_fixed(kin.params().len());
        let ctx = context(&cfg, &kin, &liquid, &solid, &mask);

        let x = state();
        let params = kin.params().to_vec();
        let jac = analytical_state_jacobian(&ctx, &x, &params, 0.0);

        for j in 0..x.len() {
            let fd = column_fd(&ctx, &x, j);
            for i in 0..x.len() {
                assert_relative_eq!(
                    jac[(i, j)],
                    fd[i],
                    max_relative = 1e-4,
                    epsilon = 1e-10
                );
            }
        }
    }

    #[test]
    fn fd_product_matches_analytical_along_state_direction() {
        let cfg = batch_settings();
        let kin = kinetics();
        let liquid = ConstantLiquid::new(1000.0, 4000.0);
        let solid = ConstantSolid::new(1300.0, 900.0);
        let mask = ParameterMask::all_fixed(kin.params().len());
        let ctx = context(&cfg, &kin, &liquid, &solid, &mask);

        let x = state();
        let params = kin.params().to_vec();
        let jac = analytical_state_jacobian(&ctx, &x, &params, 0.0);
        // state-shaped direction, exercising every column at once
        let v = x.clone();
        let expected = &jac * nalgebra::DVector::from_vec(v.clone());

        let mut fd = vec![0.0; x.len()];
        fd_jacobian_product(&ctx, &x, &[], 0.0, &v, 1e-6, &mut fd);
        for i in 0..x.len() {
            assert_relative_eq!(fd[i], expected[i], max_relative = 1e-4, epsilon = 1e-10);
        }
    }

    #[test]
    fn analytical_param_jacobian_matches_per_column_differences() {
        let cfg = batch_settings();
        let kin = kinetics();
        let liquid = ConstantLiquid::new(1000.0, 4000.0);
        let solid = ConstantSolid::new(1300.0, 900.0);
        // free a cross-section: rate constants, one activation energy,
        // one order each for growth and secondary nucleation
        let mut free = vec![false; kin.params().len()];
        for idx in [
            crate::kinetics::power_law::KB_PRIM,
            crate::kinetics::power_law::KB_SEC,
            crate::kinetics::power_law::EA_G,
            crate::kinetics::power_law::EXP_G,
            crate::kinetics::power_law::EXP_SEC_MU3,
            crate::kinetics::power_law::KG,
        ] {
            free[idx] = true;
        }
        let mask = ParameterMask::new(free);
        let ctx = context(&cfg, &kin, &liquid, &solid, &mask);

        let x = state();
        let params = kin.params().to_vec();
        let (p_free, _) = mask.split(&params);
        let jac = analytical_param_jacobian(&ctx, &x, &params, 0.0);
        assert_eq!(jac.ncols(), 6);

        for col in 0..jac.ncols() {
            let h = 1e-6 * p_free[col].abs().max(1.0);
            let mut up_p = p_free.clone();
            let mut down_p = p_free.clone();
            up_p[col] += h;
            down_p[col] -= h;
            let mut up = vec![0.0; x.len()];
            let mut down = vec![0.0; x.len()];
            ctx.rhs(&x, &up_p, 0.0, &mut up);
            ctx.rhs(&x, &down_p, 0.0, &mut down);

            for i in 0..x.len() {
                let fd = (up[i] - down[i]) / (2.0 * h);
                assert_relative_eq!(jac[(i, col)], fd, max_relative = 1e-4, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn fd_sens_product_matches_analytical_along_parameter_direction() {
        let cfg = batch_settings();
        let kin = kinetics();
        let liquid = ConstantLiquid::new(1000.0, 4000.0);
        let solid = ConstantSolid::new(1300.0, 900.0);
        let mask = ParameterMask::all_free(kin.params().len());
        let ctx = context(&cfg, &kin, &liquid, &solid, &mask);

        let x = state();
        let params = kin.params().to_vec();
        let jac = analytical_param_jacobian(&ctx, &x, &params, 0.0);
        let v: Vec<f64> = params.iter().map(|p| p.abs().max(1.0)).collect();
        let expected = &jac * nalgebra::DVector::from_vec(v.clone());

        let mut fd = vec![0.0; x.len()];
        fd_sens_product(&ctx, &x, &params, 0.0, &v, 1e-6, &mut fd);
        for i in 0..x.len() {
            assert_relative_eq!(fd[i], expected[i], max_relative = 1e-3, epsilon = 1e-9);
        }
    }

    #[cfg(feature = "autodiff")]
    #[test]
    fn dual_numbers_match_analytical_product() {
        let cfg = batch_settings();
        let kin = kinetics();
        let liquid = ConstantLiquid::new(1000.0, 4000.0);
        let solid = ConstantSolid::new(1300.0, 900.0);
        let mask = ParameterMask::all_fixed(kin.params().len());
        let ctx = context(&cfg, &kin, &liquid, &solid, &mask);

        let x = state();
        let params = kin.params().to_vec();
        let jac = analytical_state_jacobian(&ctx, &x, &params, 0.0);
        let v = vec![0.3, -1.0, 2.0, 0.7, -0.2, 0.1];
        let expected = &jac * nalgebra::DVector::from_vec(v.clone());

        let mut ad = vec![0.0; 6];
        ad_jacobian_product(&ctx, &x, &[], 0.0, &v, &mut ad);
        for i in 0..x.len() {
            assert_relative_eq!(ad[i], expected[i], max_relative = 1e-9, epsilon = 1e-9);
        }
    }
}
