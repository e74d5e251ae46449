//! State vector layout.
//!
//! The integrator sees one flat vector; everything else addresses it
//! through named blocks with explicit offsets. Which blocks exist
//! depends on the operating mode and the thermal configuration, decided
//! once at build time.

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Named segments of the state vector, in storage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Block {
    /// Moments or cell densities of the crystal population.
    Distribution,
    /// Liquid-phase species composition.
    Composition,
    /// Liquid volume; batch and semibatch only.
    Volume,
    /// Tank temperature, when the energy balance is integrated.
    Temperature,
    /// Jacket temperature, when the jacket balance is integrated.
    JacketTemperature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateLayout {
    blocks: Vec<(Block, usize, usize)>,
    n_states: usize,
}

impl StateLayout {
    pub fn new(
        n_distr: usize,
        n_species: usize,
        track_volume: bool,
        track_temperature: bool,
        track_jacket: bool,
    ) -> Self {
        debug_assert!(track_temperature || !track_jacket);

        let mut blocks = Vec::with_capacity(5);
        let mut offset = 0;
        let mut push = |block: Block, len: usize| {
            blocks.push((block, offset, len));
            offset += len;
        };

        push(Block::Distribution, n_distr);
        push(Block::Composition, n_species);
        if track_volume {
            push(Block::Volume, 1);
        }
        if track_temperature {
            push(Block::Temperature, 1);
        }
        if track_jacket {
            push(Block::JacketTemperature, 1);
        }

        Self {
            n_states: offset,
            blocks,
        }
    }

    /// Total number of states.
    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn has(&self, block: Block) -> bool {
        self.blocks.iter().any(|&(b, _, _)| b == block)
    }

    /// Offset of a block, if present.
    pub fn offset(&self, block: Block) -> Option<usize> {
        self.blocks
            .iter()
            .find(|&&(b, _, _)| b == block)
            .map(|&(_, offset, _)| offset)
    }

    /// Length of a block, if present.
    pub fn len(&self, block: Block) -> Option<usize> {
        self.blocks
            .iter()
            .find(|&&(b, _, _)| b == block)
            .map(|&(_, _, len)| len)
    }

    /// Index range of a block, if present.
    pub fn range(&self, block: Block) -> Option<Range<usize>> {
        self.blocks
            .iter()
            .find(|&&(b, _, _)| b == block)
            .map(|&(_, offset, len)| offset..offset + len)
    }

    /// Blocks in storage order with their offsets and lengths.
    pub fn blocks(&self) -> impl Iterator<Item = (Block, usize, usize)> + '_ {
        self.blocks.iter().copied()
    }
}
