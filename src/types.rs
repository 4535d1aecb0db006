// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt;

use cid::Cid;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::randomness::Randomness;
use fvm_shared::sector::RegisteredSealProof;
use serde::{Deserialize, Serialize};

pub use fvm_shared::sector::{SectorID, SectorNumber};
pub use fvm_shared::ActorID;

/// Chain-sampled randomness the sealing algorithm bound the replica to,
/// together with the epoch it was drawn at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub epoch: ChainEpoch,
    pub ticket: Randomness,
}

/// Interactive randomness the seal proof was generated against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seed {
    pub epoch: ChainEpoch,
    pub seed: Randomness,
}

/// Everything a pre-commit message needs for one sector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreCommitInfo {
    pub comm_r: Cid,
    pub comm_d: Cid,
    pub ticket: Ticket,
    pub deals: Vec<DealID>,
    pub seal_proof: RegisteredSealProof,
    pub expiration: ChainEpoch,
}

/// The seal proof for one sector, bound to the interactive seed it was
/// generated against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofInfo {
    pub proof: Vec<u8>,
    pub seed: Seed,
}

/// Dispatch bookkeeping persisted alongside the sector.
///
/// `need_send` is the recovery anchor: it is raised atomically with accepting
/// a submission and lowered atomically with recording the message id the
/// submission was dispatched under. A crash between the two leaves the flag
/// raised, and the restart scan re-enqueues the sector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub pre_commit_cid: Option<Cid>,
    pub commit_cid: Option<Cid>,
    pub need_send: bool,
}

/// Store-owned, long-lived state of one sector inside the sealing pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorState {
    pub id: SectorID,
    pub pre: Option<PreCommitInfo>,
    pub proof: Option<ProofInfo>,
    pub message_info: MessageInfo,
}

impl SectorState {
    pub fn new(id: SectorID) -> Self {
        SectorState {
            id,
            pre: None,
            proof: None,
            message_info: MessageInfo::default(),
        }
    }
}

/// Coarse lifecycle of a dispatched commitment message, as seen by a caller
/// polling the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnChainState {
    Pending,
    Packed,
    Landed,
    Failed,
    ShouldAbort,
}

/// Verdict on a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitResult {
    Accepted,
    Rejected,
    /// The sector already holds a different commitment for this stage; the
    /// caller must assert a hard reset to replace it.
    MismatchedSubmission,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResp {
    pub res: SubmitResult,
    pub desc: Option<String>,
}

impl SubmitResp {
    pub fn accepted() -> Self {
        SubmitResp {
            res: SubmitResult::Accepted,
            desc: None,
        }
    }

    pub fn rejected(desc: impl Into<String>) -> Self {
        SubmitResp {
            res: SubmitResult::Rejected,
            desc: Some(desc.into()),
        }
    }

    pub fn mismatched() -> Self {
        SubmitResp {
            res: SubmitResult::MismatchedSubmission,
            desc: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollStateResp {
    pub state: OnChainState,
    pub desc: Option<String>,
}

/// The two commitment stages a sector passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    PreCommit,
    ProveCommit,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::PreCommit => "pre-commit",
            Stage::ProveCommit => "prove-commit",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
