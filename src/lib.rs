// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Commitment manager for a Filecoin storage-miner sealing pipeline.
//!
//! Sealing a sector produces two on-chain messages: a *pre-commit* declaring
//! the sealed sector's replica and data commitments under a chain-sampled
//! ticket, and a *prove-commit* carrying the seal proof. This crate accepts
//! sector submissions, validates them against chain state, batches them per
//! miner, pushes the resulting messages through an external messager service
//! and maps the landed state back into a coarse lifecycle the caller polls.
//!
//! The entry point is [`CommitmentManager`]; everything it talks to (the
//! messager, the chain reader, the sector state store, the proof verifier and
//! prover) is injected through the traits in [`api`].

pub mod api;
pub mod batcher;
pub mod check;
pub mod config;
pub mod errors;
pub mod manager;
pub mod mid;
pub mod miner_actor;
pub mod policy;
pub mod processor;
pub mod test_api;
pub mod types;

pub use self::config::{CommitmentConfig, FeePolicy, MinerCommitConfig, StageConfig};
pub use self::manager::CommitmentManager;
pub use self::types::*;
