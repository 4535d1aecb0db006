// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Traits over the external collaborators: the messager service, the chain
//! reader, the sector state store, the miner-info resolver and the proof
//! verifier/prover. The manager is written purely against these so that the
//! whole pipeline runs against the in-memory fakes in [`crate::test_api`].

use anyhow::Result;
use async_trait::async_trait;
use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::message::Message;
use fvm_shared::piece::PaddedPieceSize;
use fvm_shared::randomness::Randomness;
use fvm_shared::sector::{
    AggregateSealVerifyProofAndInfos, RegisteredSealProof, SealVerifyInfo, SectorNumber,
    SectorSize,
};
use fvm_shared::ActorID;
use serde::{Deserialize, Serialize};

use crate::config::FeePolicy;
use crate::miner_actor::SectorPreCommitOnChainInfo;
use crate::types::{MessageInfo, PreCommitInfo, ProofInfo, SectorID, SectorState};

/// Opaque reference to the tipset a query is answered against.
pub type TipsetToken = Vec<u8>;

/// Lifecycle of a message inside the messager service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageState {
    Unknown,
    Unfill,
    Fill,
    OnChain,
    Failed,
    Replaced,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Unknown => "unknown",
            MessageState::Unfill => "unfill",
            MessageState::Fill => "fill",
            MessageState::OnChain => "on-chain",
            MessageState::Failed => "failed",
            MessageState::Replaced => "replaced",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgReceipt {
    pub exit_code: ExitCode,
    pub ret: Vec<u8>,
    pub gas_used: u64,
}

/// A message as the messager reports it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgDetail {
    pub id: String,
    pub state: MessageState,
    /// Epochs since the containing tipset was included.
    pub confidence: i64,
    pub receipt: Option<MsgReceipt>,
    pub signed_cid: Option<Cid>,
}

/// Push spec handed to the messager alongside a message; bounds its gas
/// estimation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MsgSpec {
    pub gas_over_estimation: f64,
    pub gas_over_premium: f64,
    pub max_fee: Option<TokenAmount>,
}

impl From<&FeePolicy> for MsgSpec {
    fn from(fee: &FeePolicy) -> Self {
        MsgSpec {
            gas_over_estimation: fee.gas_over_estimation,
            gas_over_premium: fee.gas_over_premium,
            max_fee: fee.max_fee.clone(),
        }
    }
}

/// The external messager service: signs, nonces, sends and tracks chain
/// messages on our behalf.
#[async_trait]
pub trait Messager: Send + Sync {
    async fn has_message_by_uid(&self, id: &str) -> Result<bool>;

    /// Pushes `msg` under the caller-chosen uid. Returns the uid the message
    /// was actually registered under, which must equal `id`.
    async fn push_message_with_id(&self, id: &str, msg: &Message, spec: &MsgSpec)
        -> Result<String>;

    async fn get_message_by_uid(&self, id: &str) -> Result<MsgDetail>;
}

/// Outcome of a pre-commit record lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum PreCommitLookup {
    Found(SectorPreCommitOnChainInfo),
    NotFound,
    /// The sector number is taken by an already-proven sector, so no
    /// pre-commit record can ever appear for it.
    Allocated,
}

/// A proven sector as the chain reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorOnChainInfo {
    pub sector_number: SectorNumber,
    pub seal_proof: RegisteredSealProof,
    pub sealed_cid: Cid,
    pub activation: ChainEpoch,
    pub expiration: ChainEpoch,
}

/// The proposal half of a published storage deal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDeal {
    pub piece_cid: Cid,
    pub piece_size: PaddedPieceSize,
    pub provider: Address,
    pub start_epoch: ChainEpoch,
    pub end_epoch: ChainEpoch,
}

/// Domain separation tags for chain randomness draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum DomainSeparationTag {
    TicketProduction = 1,
    ElectionProofProduction = 2,
    WinningPoStChallengeSeed = 3,
    WindowedPoStChallengeSeed = 4,
    SealRandomness = 5,
    InteractiveSealChallengeSeed = 6,
    WindowedPoStDeadlineAssignment = 7,
    MarketDealCronSeed = 8,
    PoStChainCommit = 9,
}

/// Read-only chain state, scoped to what the checkers and processors need.
#[async_trait]
pub trait SealingApi: Send + Sync {
    /// The current head as an opaque token plus its epoch.
    async fn chain_head(&self) -> Result<(TipsetToken, ChainEpoch)>;

    async fn state_sector_precommit_info(
        &self,
        maddr: Address,
        number: SectorNumber,
        tok: &TipsetToken,
    ) -> Result<PreCommitLookup>;

    async fn state_sector_get_info(
        &self,
        maddr: Address,
        number: SectorNumber,
        tok: &TipsetToken,
    ) -> Result<Option<SectorOnChainInfo>>;

    /// CommD for the given deal layout under the given seal proof.
    async fn state_compute_data_commitment(
        &self,
        maddr: Address,
        seal_proof: RegisteredSealProof,
        deals: &[DealID],
        tok: &TipsetToken,
    ) -> Result<Cid>;

    async fn state_market_storage_deal(&self, deal: DealID, tok: &TipsetToken)
        -> Result<MarketDeal>;

    async fn state_miner_available_balance(
        &self,
        maddr: Address,
        tok: &TipsetToken,
    ) -> Result<TokenAmount>;

    async fn state_miner_pre_commit_deposit(
        &self,
        maddr: Address,
        info: &crate::miner_actor::SectorPreCommitInfo,
        tok: &TipsetToken,
    ) -> Result<TokenAmount>;

    async fn get_randomness_from_beacon(
        &self,
        tag: DomainSeparationTag,
        epoch: ChainEpoch,
        entropy: &[u8],
        tok: &TipsetToken,
    ) -> Result<Randomness>;
}

/// Address metadata of one miner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerInfo {
    pub owner: Address,
    pub worker: Address,
    pub seal_proof_type: RegisteredSealProof,
    pub sector_size: SectorSize,
}

#[async_trait]
pub trait MinerInfoApi: Send + Sync {
    async fn miner_info(&self, mid: ActorID) -> Result<MinerInfo>;
}

/// Worker liveness filter for the recovery scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Online,
    Offline,
}

/// Job-kind filter for the recovery scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorWorkerJob {
    Sealing,
    SnapUp,
}

/// Partial update applied to one sector. Fields left `None` are untouched;
/// the store applies the whole patch atomically per sector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SectorUpdate {
    pub pre: Option<PreCommitInfo>,
    pub proof: Option<ProofInfo>,
    pub message_info: Option<MessageInfo>,
}

impl SectorUpdate {
    pub fn message_info(info: MessageInfo) -> Self {
        SectorUpdate {
            message_info: Some(info),
            ..Default::default()
        }
    }
}

/// Persistent sector-state store. Serializes updates per sector id.
#[async_trait]
pub trait SectorStateStore: Send + Sync {
    async fn load(&self, id: SectorID) -> Result<SectorState>;

    async fn update(&self, id: SectorID, update: SectorUpdate) -> Result<()>;

    async fn all(&self, ws: WorkerState, job: SectorWorkerJob) -> Result<Vec<SectorState>>;
}

/// Seal proof verification.
#[async_trait]
pub trait SealVerifier: Send + Sync {
    async fn verify_seal(&self, info: SealVerifyInfo) -> Result<bool>;
}

/// Aggregation of individual seal proofs into one message-sized proof.
#[async_trait]
pub trait SealProver: Send + Sync {
    async fn aggregate_seal_proofs(
        &self,
        infos: AggregateSealVerifyProofAndInfos,
        proofs: Vec<Vec<u8>>,
    ) -> Result<Vec<u8>>;
}
