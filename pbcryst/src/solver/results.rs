//! Decoded simulation output.

use crate::distribution::{DiscretizationMethod, ScaleFactor};
use crate::grid::SizeGrid;
use crate::layout::{Block, StateLayout};
use nalgebra::DMatrix;
use serde::Serialize;

/// Time series produced by a solve, in physical units.
///
/// The integrator works on scaled population states; decoding divides
/// moment series by `s^k` per order and finite-volume densities by `s`.
/// Sensitivity matrices stay in the integrator basis (scaled states,
/// free parameters), which is what estimation routines consume.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationResults {
    /// Output times, s.
    pub time: Vec<f64>,
    /// Raw moments `mu_0..mu_{n-1}` per output time, grid units.
    /// Populated for the moment representation.
    pub moments: Option<Vec<Vec<f64>>>,
    /// Cell number densities per output time. Populated for the
    /// finite-volume representation.
    pub distribution: Option<Vec<Vec<f64>>>,
    /// Species concentrations per output time, in the configured
    /// composition basis.
    pub concentration: Vec<Vec<f64>>,
    /// Liquid volume in m3, when the volume is a state.
    pub volume: Option<Vec<f64>>,
    /// Tank temperature in K. Always populated: integrated, evaluated
    /// from the prescribed profile, or held at the starting value.
    pub temperature: Vec<f64>,
    /// Jacket temperature in K, when the jacket balance is integrated.
    pub jacket_temperature: Option<Vec<f64>>,
    /// Per-time sensitivities of the scaled states with respect to the
    /// free parameters, `n_states x n_free`.
    pub sensitivities: Option<Vec<DMatrix<f64>>>,
    /// Size grid the distribution columns live on.
    pub grid: Option<SizeGrid>,
    /// Final integrator state, scaled basis. Seeds a resumed run.
    #[serde(skip)]
    pub(crate) final_state: Vec<f64>,
}

impl SimulationResults {
    pub(crate) fn decode(
        layout: &StateLayout,
        scale: ScaleFactor,
        method: DiscretizationMethod,
        grid: Option<&SizeGrid>,
        time: Vec<f64>,
        states: Vec<Vec<f64>>,
        fallback_temperature: Option<Vec<f64>>,
        sensitivities: Option<Vec<DMatrix<f64>>>,
    ) -> Self {
        let final_state = states.last().cloned().unwrap_or_default();
        let n_times = states.len();

        let distr_range = layout.range(Block::Distribution).unwrap_or(0..0);
        let conc_range = layout.range(Block::Composition).unwrap_or(0..0);

        let mut distr_rows = Vec::with_capacity(n_times);
        let mut concentration = Vec::with_capacity(n_times);
        let mut volume = layout
            .has(Block::Volume)
            .then(|| Vec::with_capacity(n_times));
        let mut temp_states = layout
            .has(Block::Temperature)
            .then(|| Vec::with_capacity(n_times));
        let mut jacket_temperature = layout
            .has(Block::JacketTemperature)
            .then(|| Vec::with_capacity(n_times));

        for row in &states {
            let decoded: Vec<f64> = match method {
                DiscretizationMethod::Moments { .. } => row[distr_range.clone()]
                    .iter()
                    .enumerate()
                    .map(|(k, &m)| scale.unscale_moment(m, k))
                    .collect(),
                DiscretizationMethod::FiniteVolume => row[distr_range.clone()]
                    .iter()
                    .map(|&f| scale.unscale_density(f))
                    .collect(),
            };
            distr_rows.push(decoded);
            concentration.push(row[conc_range.clone()].to_vec());

            if let (Some(series), Some(i)) = (volume.as_mut(), layout.offset(Block::Volume)) {
                series.push(row[i]);
            }
            if let (Some(series), Some(i)) = (temp_states.as_mut(), layout.offset(Block::Temperature))
            {
                series.push(row[i]);
            }
            if let (Some(series), Some(i)) =
                (jacket_temperature.as_mut(), layout.offset(Block::JacketTemperature))
            {
                series.push(row[i]);
            }
        }

        let temperature = temp_states
            .or(fallback_temperature)
            .unwrap_or_default();

        let (moments, distribution) = match method {
            DiscretizationMethod::Moments { .. } => (Some(distr_rows), None),
            DiscretizationMethod::FiniteVolume => (None, Some(distr_rows)),
        };

        Self {
            time,
            moments,
            distribution,
            concentration,
            volume,
            temperature,
            jacket_temperature,
            sensitivities,
            grid: grid.cloned(),
            final_state,
        }
    }

    /// Number of stored output times.
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Raw moment of order `k` at output index `idx`, grid units.
    ///
    /// Read directly from the moment series, or by quadrature over the
    /// stored distribution. `None` when the order is not tracked or the
    /// index is out of range.
    pub fn moment(&self, idx: usize, k: usize) -> Option<f64> {
        if let Some(moments) = &self.moments {
            return moments.get(idx)?.get(k).copied();
        }
        let grid = self.grid.as_ref()?;
        let density = self.distribution.as_ref()?.get(idx)?;
        Some(grid.moment_raw(density.as_slice(), k as u32))
    }

    /// Volume-weighted mean crystal size `mu_4 / mu_3` at output index
    /// `idx`, grid units.
    pub fn volume_weighted_mean_size(&self, idx: usize) -> Option<f64> {
        let mu4 = self.moment(idx, 4)?;
        let mu3 = self.moment(idx, 3)?;
        (mu3 > 0.0).then(|| mu4 / mu3)
    }
}
