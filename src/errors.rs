// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Typed rejection taxonomy returned by the checkers. The façade
//! pattern-matches on these to decide between surfacing a transient failure,
//! treating an already-on-chain pre-commit as success, and rejecting the
//! submission outright.

use cid::Cid;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::sector::RegisteredSealProof;
use thiserror::Error;

/// Failure modes of the pre-commit checker.
#[derive(Debug, Error)]
pub enum PreCheckError {
    /// Transient chain/messager failure; surfaced to the caller untouched so
    /// it can retry.
    #[error("api error: {0}")]
    Api(#[source] anyhow::Error),

    /// The chain already records this sector's pre-commit. Treated as success
    /// by the façade; no new message is sent.
    #[error("pre-commit already on chain")]
    PrecommitOnChain,

    #[error("on-chain CommD {chain} differs from the submitted {local}")]
    BadCommD { chain: Cid, local: Cid },

    #[error("bad ticket: {0}")]
    BadTicket(String),

    #[error("sector expiration {expiration} is before the minimum {min}")]
    ExpirationTooSoon {
        expiration: ChainEpoch,
        min: ChainEpoch,
    },

    #[error("invalid deals: {0}")]
    DealsInvalid(String),

    #[error("seal proof type {submitted:?} does not match the miner's {expected:?}")]
    BadSealProofType {
        submitted: RegisteredSealProof,
        expected: RegisteredSealProof,
    },

    /// The sector number collides with an already-sealed sector.
    #[error("sector number is already allocated")]
    SectorAllocated,
}

/// Failure modes of the prove-commit checker.
#[derive(Debug, Error)]
pub enum ProofCheckError {
    /// Transient chain/messager failure; surfaced to the caller untouched.
    #[error("api error: {0}")]
    Api(#[source] anyhow::Error),

    #[error("no pre-commit record on chain")]
    NoPrecommit,

    #[error("invalid deals: {0}")]
    InvalidDeals(String),

    #[error("expired deals: {0}")]
    ExpiredDeals(String),

    #[error("sector number is already allocated")]
    SectorNumberAllocated,

    #[error("bad seed: {0}")]
    BadSeed(String),

    #[error("invalid proof: {0}")]
    InvalidProof(String),

    #[error("marshaling miner address: {0}")]
    MarshalAddr(#[source] fvm_ipld_encoding::Error),
}
