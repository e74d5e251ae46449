//! # Pbcryst
//!
//! Pbcryst is a library for simulating solution crystallization with population
//! balances. It models the coupled evolution of a crystal size distribution, the
//! liquid-phase composition and the vessel temperature for batch, continuous
//! (MSMPR) and semibatch operation, driven by supersaturation-dependent
//! nucleation, growth and dissolution kinetics.
//!
//! ## Building a crystallizer
//!
//! Configuration goes through the [CrystallizerBuilder] struct. You choose an
//! [OperatingMode] and a [DiscretizationMethod], then optionally set the target
//! species ([CrystallizerBuilder::target_species]), the composition basis
//! ([CrystallizerBuilder::composition_basis]), state scaling
//! ([CrystallizerBuilder::scale]) and the jacobian backend
//! ([CrystallizerBuilder::jacobian]). Thermal operation defaults to a jacketed
//! energy balance fed by [CrystallizerBuilder::heat_transfer_media]; call
//! [CrystallizerBuilder::isothermal], [CrystallizerBuilder::adiabatic] or
//! [CrystallizerBuilder::temperature_profile] to select something else. The
//! [CrystallizerBuilder::build] function validates the configuration against the
//! supplied kinetics and property models and produces a [Crystallizer].
//!
//! Crystallization kinetics implement the [CrystalKinetics] trait;
//! [PowerLawKinetics] provides the usual Arrhenius power laws for primary and
//! secondary nucleation, growth and dissolution. Liquid and solid phase
//! properties come from the [LiquidModel] and [SolidModel] traits, with
//! [ConstantLiquid] and [ConstantSolid] as ready-made constant-property models.
//!
//! ## Phases and feeds
//!
//! A crystallizer is wired to its process material after building:
//! [Crystallizer::attach_phases] takes a [LiquidState] (composition,
//! temperature, volume) and a [SolidState] holding either leading moments or a
//! discretized number density on a [SizeGrid]. Continuous and semibatch
//! operation additionally take a feed through [Crystallizer::attach_inlet];
//! [FeedStream] is a constant feed, and anything implementing [Inlet] can vary
//! in time.
//!
//! ## Solving
//!
//! [Crystallizer::solve] integrates for a duration with solver-chosen output
//! times, [Crystallizer::solve_with_times] produces dense output on a caller
//! grid, and [Crystallizer::solve_sensitivities] additionally carries forward
//! sensitivities with respect to the free kinetic parameters selected by a
//! [ParameterMask]. Results come back as [SimulationResults] with the state
//! trajectory decoded into physical quantities. After each run the attached
//! phases hold the final state and the elapsed-time clock has advanced, so
//! consecutive calls chain into a campaign; [Crystallizer::reset] rewinds to
//! the originally attached state.
//!
//! Continuous crystallizers with a finite-volume population also expose
//! [Crystallizer::solve_steady_state], which solves the analytical steady-state
//! distribution directly instead of integrating to it.
//!
//! ## Representations
//!
//! [DiscretizationMethod::Moments] tracks leading moments of the distribution,
//! giving a small dense system integrated with a direct LU solve.
//! [DiscretizationMethod::FiniteVolume] tracks the number density itself on a
//! [SizeGrid] using an upwind finite-volume scheme with Van Leer flux limiting,
//! giving a larger banded system integrated on sparse matrices. Jacobians come
//! from finite differences by default; [JacobianStrategy] selects dual-number
//! automatic differentiation (behind the `autodiff` feature) or hand-derived
//! analytical jacobians where supported.
//!
//! ```
//! use pbcryst::{
//!     ConstantLiquid, ConstantSolid, CrystallizerBuilder, DiscretizationMethod, LiquidState,
//!     OperatingMode, PowerLawKinetics, SolidState, SolverOptions,
//! };
//!
//! // Seeded isothermal batch with a moment representation.
//! let kinetics = PowerLawKinetics::new([0.3, 0.0, 0.0])
//!     .with_primary_nucleation(1e8, 0.0, 2.0)
//!     .with_growth(5.0, 0.0, 1.0);
//! let mut crystallizer =
//!     CrystallizerBuilder::new(OperatingMode::Batch, DiscretizationMethod::moments())
//!         .isothermal()
//!         .scale(1e-3)
//!         .build(
//!             kinetics,
//!             ConstantLiquid::new(1100.0, 4000.0),
//!             ConstantSolid::new(1400.0, 1200.0),
//!         )
//!         .unwrap();
//!
//! let liquid = LiquidState {
//!     mass_conc: vec![0.4],
//!     temp: 300.0,
//!     vol: 1e-3,
//! };
//! let seeds = SolidState::from_moments(vec![1e10, 5e11, 5e13, 8e15], 0.52, 300.0);
//! crystallizer.attach_phases(liquid, seeds).unwrap();
//!
//! let results = crystallizer.solve(600.0, &SolverOptions::default()).unwrap();
//! let c_final = results.concentration.last().unwrap()[0];
//! assert!(c_final < 0.4 && c_final > 0.29);
//! ```

mod balance;
pub mod discretization;
pub mod distribution;
pub mod error;
pub mod grid;
pub mod inlet;
pub mod jacobian;
pub mod kinetics;
pub mod layout;
pub mod phase;
pub mod scalar;
pub mod solver;

pub use distribution::{CompositionBasis, DiscretizationMethod, OperatingMode, ScaleFactor};
pub use error::{AttachError, ConfigError, CrystError, SolveError};
pub use grid::SizeGrid;
pub use inlet::{
    FeedConditions, FeedStream, HeatTransferMedia, Inlet, PolynomialProfile, TemperatureProfile,
};
pub use jacobian::JacobianStrategy;
pub use kinetics::{
    CrystalKinetics, KineticConditions, KineticRates, ParameterMask, PowerLawKinetics,
    RateJacobian, GAS_CONSTANT,
};
pub use layout::{Block, StateLayout};
pub use phase::{
    ConstantLiquid, ConstantSolid, LiquidModel, LiquidState, SolidContents, SolidModel, SolidState,
    Slurry,
};
pub use scalar::Real;
pub use solver::{
    Crystallizer, CrystallizerBuilder, SimulationResults, SolverOptions, SteadyStateResult,
};
