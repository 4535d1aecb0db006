// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Chain policy constants the checkers validate against. Values follow the
//! mainnet storage-miner actor policy at 30 second epochs.

use fvm_shared::clock::ChainEpoch;

pub const EPOCHS_IN_DAY: ChainEpoch = 2880;

/// Epochs after which a tipset is considered irreversible.
pub const CHAIN_FINALITY: ChainEpoch = 900;

/// Oldest epoch a pre-commit ticket may have been drawn at, relative to the
/// epoch the pre-commit message lands.
pub const MAX_PRE_COMMIT_RANDOMNESS_LOOKBACK: ChainEpoch = EPOCHS_IN_DAY + CHAIN_FINALITY;

/// Epochs between a pre-commit landing and the interactive challenge seed for
/// its proof becoming available.
pub const PRE_COMMIT_CHALLENGE_DELAY: ChainEpoch = 150;

/// Minimum commitment duration of a sector.
pub const MIN_SECTOR_LIFETIME: ChainEpoch = 180 * EPOCHS_IN_DAY;
