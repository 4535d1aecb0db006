// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! In-memory fakes of every collaborator, for unit, property and integration
//! tests. Behavior is deterministic; knobs on each fake inject the failure
//! modes the manager must survive.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use ahash::HashMap;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::message::Message;
use fvm_shared::randomness::Randomness;
use fvm_shared::sector::{
    AggregateSealVerifyProofAndInfos, RegisteredSealProof, SealVerifyInfo, SectorNumber,
    SectorSize,
};
use fvm_shared::ActorID;
use parking_lot::Mutex;

use crate::api::{
    DomainSeparationTag, MarketDeal, Messager, MinerInfo, MinerInfoApi, MsgDetail, MsgSpec,
    MessageState, PreCommitLookup, SealProver, SealVerifier, SealingApi, SectorOnChainInfo,
    SectorStateStore, SectorUpdate, SectorWorkerJob, TipsetToken, WorkerState,
};
use crate::miner_actor::{SectorPreCommitInfo, SectorPreCommitOnChainInfo};
use crate::types::{SectorID, SectorState};

/// A deterministic cid for test fixtures.
pub fn make_piece_cid(seed: &[u8]) -> Cid {
    crate::mid::new_mid_from_bytes(seed)
}

/// The beacon randomness the fake chain serves for `epoch`.
pub fn beacon_randomness(epoch: ChainEpoch) -> Randomness {
    Randomness(format!("beacon-{epoch}").into_bytes())
}

#[derive(Debug, Clone)]
pub struct PushedMessage {
    pub id: String,
    pub msg: Message,
    pub spec: MsgSpec,
}

/// Fake messager. Ids pushed once count as seen for later probes.
#[derive(Default)]
pub struct TestMessager {
    seen: Mutex<HashSet<String>>,
    pushed: Mutex<Vec<PushedMessage>>,
    states: Mutex<HashMap<String, MsgDetail>>,
    probes: AtomicUsize,
    uid_override: Mutex<Option<String>>,
    fail_push: AtomicBool,
}

impl TestMessager {
    pub fn mark_seen(&self, id: &str) {
        self.seen.lock().insert(id.to_string());
    }

    /// Makes the next pushes return this uid instead of the probed one.
    pub fn override_uid(&self, uid: &str) {
        *self.uid_override.lock() = Some(uid.to_string());
    }

    /// Makes pushes error without registering anything, as if the service
    /// went away mid-call.
    pub fn set_push_failure(&self, fail: bool) {
        self.fail_push.store(fail, Ordering::SeqCst);
    }

    pub fn pushed(&self) -> Vec<PushedMessage> {
        self.pushed.lock().clone()
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn set_message(&self, detail: MsgDetail) {
        self.states.lock().insert(detail.id.clone(), detail);
    }

    /// Marks a pushed message as on-chain with the given receipt.
    pub fn land_message(
        &self,
        id: &str,
        confidence: i64,
        exit_code: fvm_shared::error::ExitCode,
        ret: &[u8],
    ) {
        self.set_message(MsgDetail {
            id: id.to_string(),
            state: MessageState::OnChain,
            confidence,
            receipt: Some(crate::api::MsgReceipt {
                exit_code,
                ret: ret.to_vec(),
                gas_used: 1,
            }),
            signed_cid: None,
        });
    }
}

#[async_trait]
impl Messager for TestMessager {
    async fn has_message_by_uid(&self, id: &str) -> Result<bool> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(self.seen.lock().contains(id))
    }

    async fn push_message_with_id(
        &self,
        id: &str,
        msg: &Message,
        spec: &MsgSpec,
    ) -> Result<String> {
        if self.fail_push.load(Ordering::SeqCst) {
            bail!("messager unavailable");
        }
        self.seen.lock().insert(id.to_string());
        self.pushed.lock().push(PushedMessage {
            id: id.to_string(),
            msg: msg.clone(),
            spec: spec.clone(),
        });
        self.states.lock().entry(id.to_string()).or_insert(MsgDetail {
            id: id.to_string(),
            state: MessageState::Fill,
            confidence: 0,
            receipt: None,
            signed_cid: None,
        });
        Ok(self
            .uid_override
            .lock()
            .clone()
            .unwrap_or_else(|| id.to_string()))
    }

    async fn get_message_by_uid(&self, id: &str) -> Result<MsgDetail> {
        self.states
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("message {id} not found"))
    }
}

/// Fake chain reader backed by plain maps.
pub struct TestSealingApi {
    head: Mutex<ChainEpoch>,
    comm_d: Cid,
    precommits: Mutex<HashMap<(Address, SectorNumber), SectorPreCommitOnChainInfo>>,
    allocated: Mutex<HashSet<(Address, SectorNumber)>>,
    sector_infos: Mutex<HashMap<(Address, SectorNumber), SectorOnChainInfo>>,
    deals: Mutex<HashMap<DealID, MarketDeal>>,
    balance: Mutex<TokenAmount>,
    deposit: Mutex<TokenAmount>,
    fail: AtomicBool,
}

impl TestSealingApi {
    pub fn with_head(head: ChainEpoch) -> Self {
        TestSealingApi {
            head: Mutex::new(head),
            comm_d: make_piece_cid(b"test-comm-d"),
            precommits: Mutex::new(HashMap::default()),
            allocated: Mutex::new(HashSet::new()),
            sector_infos: Mutex::new(HashMap::default()),
            deals: Mutex::new(HashMap::default()),
            balance: Mutex::new(TokenAmount::from_whole(100)),
            deposit: Mutex::new(TokenAmount::from_whole(1)),
            fail: AtomicBool::new(false),
        }
    }

    /// The CommD this fake computes for every deal layout.
    pub fn comm_d(&self) -> Cid {
        self.comm_d
    }

    pub fn set_head(&self, head: ChainEpoch) {
        *self.head.lock() = head;
    }

    /// Makes every call error, as a transient api outage would.
    pub fn set_failure(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn put_deal(&self, id: DealID, deal: MarketDeal) {
        self.deals.lock().insert(id, deal);
    }

    pub fn mark_allocated(&self, maddr: Address, number: SectorNumber) {
        self.allocated.lock().insert((maddr, number));
    }

    /// Installs the pre-commit record the chain would hold for `sector` after
    /// its pre-commit landed at `epoch`.
    pub fn put_precommit_record(&self, maddr: Address, sector: &SectorState, epoch: ChainEpoch) {
        let info = crate::processor::precommit_params(sector)
            .expect("sector without pre-commit info");
        self.precommits.lock().insert(
            (maddr, sector.id.number),
            SectorPreCommitOnChainInfo {
                info,
                pre_commit_deposit: self.deposit.lock().clone(),
                pre_commit_epoch: epoch,
            },
        );
    }

    pub fn remove_precommit(&self, maddr: Address, number: SectorNumber) {
        self.precommits.lock().remove(&(maddr, number));
    }

    /// Installs the proven-sector record for `sector`.
    pub fn put_sector_info(&self, maddr: Address, sector: &SectorState) {
        let pre = sector.pre.as_ref().expect("sector without pre-commit info");
        self.sector_infos.lock().insert(
            (maddr, sector.id.number),
            SectorOnChainInfo {
                sector_number: sector.id.number,
                seal_proof: pre.seal_proof,
                sealed_cid: pre.comm_r,
                activation: *self.head.lock(),
                expiration: pre.expiration,
            },
        );
    }

    fn check_fail(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("chain api unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl SealingApi for TestSealingApi {
    async fn chain_head(&self) -> Result<(TipsetToken, ChainEpoch)> {
        self.check_fail()?;
        Ok((b"tok".to_vec(), *self.head.lock()))
    }

    async fn state_sector_precommit_info(
        &self,
        maddr: Address,
        number: SectorNumber,
        _tok: &TipsetToken,
    ) -> Result<PreCommitLookup> {
        self.check_fail()?;
        if self.allocated.lock().contains(&(maddr, number)) {
            return Ok(PreCommitLookup::Allocated);
        }
        Ok(match self.precommits.lock().get(&(maddr, number)) {
            Some(info) => PreCommitLookup::Found(info.clone()),
            None => PreCommitLookup::NotFound,
        })
    }

    async fn state_sector_get_info(
        &self,
        maddr: Address,
        number: SectorNumber,
        _tok: &TipsetToken,
    ) -> Result<Option<SectorOnChainInfo>> {
        self.check_fail()?;
        Ok(self.sector_infos.lock().get(&(maddr, number)).cloned())
    }

    async fn state_compute_data_commitment(
        &self,
        _maddr: Address,
        _seal_proof: RegisteredSealProof,
        _deals: &[DealID],
        _tok: &TipsetToken,
    ) -> Result<Cid> {
        self.check_fail()?;
        Ok(self.comm_d)
    }

    async fn state_market_storage_deal(
        &self,
        deal: DealID,
        _tok: &TipsetToken,
    ) -> Result<MarketDeal> {
        self.check_fail()?;
        self.deals
            .lock()
            .get(&deal)
            .cloned()
            .ok_or_else(|| anyhow!("deal {deal} not found"))
    }

    async fn state_miner_available_balance(
        &self,
        _maddr: Address,
        _tok: &TipsetToken,
    ) -> Result<TokenAmount> {
        self.check_fail()?;
        Ok(self.balance.lock().clone())
    }

    async fn state_miner_pre_commit_deposit(
        &self,
        _maddr: Address,
        _info: &SectorPreCommitInfo,
        _tok: &TipsetToken,
    ) -> Result<TokenAmount> {
        self.check_fail()?;
        Ok(self.deposit.lock().clone())
    }

    async fn get_randomness_from_beacon(
        &self,
        _tag: DomainSeparationTag,
        epoch: ChainEpoch,
        _entropy: &[u8],
        _tok: &TipsetToken,
    ) -> Result<Randomness> {
        self.check_fail()?;
        Ok(beacon_randomness(epoch))
    }
}

/// Fake miner-info resolver.
#[derive(Default)]
pub struct TestMinerInfoApi {
    infos: Mutex<HashMap<ActorID, MinerInfo>>,
}

impl TestMinerInfoApi {
    pub fn with_seal_proof(mid: ActorID, seal_proof: RegisteredSealProof) -> Self {
        let this = Self::default();
        this.put(
            mid,
            MinerInfo {
                owner: Address::new_id(mid + 1),
                worker: Address::new_id(mid + 2),
                seal_proof_type: seal_proof,
                sector_size: SectorSize::_32GiB,
            },
        );
        this
    }

    pub fn put(&self, mid: ActorID, info: MinerInfo) {
        self.infos.lock().insert(mid, info);
    }
}

#[async_trait]
impl MinerInfoApi for TestMinerInfoApi {
    async fn miner_info(&self, mid: ActorID) -> Result<MinerInfo> {
        self.infos
            .lock()
            .get(&mid)
            .cloned()
            .ok_or_else(|| anyhow!("no miner info for {mid}"))
    }
}

/// Fake sector store with per-sector patch semantics.
#[derive(Default)]
pub struct TestSectorStore {
    sectors: Mutex<HashMap<(ActorID, SectorNumber), SectorState>>,
}

impl TestSectorStore {
    pub fn insert(&self, sector: SectorState) {
        self.sectors
            .lock()
            .insert((sector.id.miner, sector.id.number), sector);
    }

    pub fn get(&self, id: SectorID) -> Option<SectorState> {
        self.sectors.lock().get(&(id.miner, id.number)).cloned()
    }
}

#[async_trait]
impl SectorStateStore for TestSectorStore {
    async fn load(&self, id: SectorID) -> Result<SectorState> {
        Ok(self
            .sectors
            .lock()
            .get(&(id.miner, id.number))
            .cloned()
            .unwrap_or_else(|| SectorState::new(id)))
    }

    async fn update(&self, id: SectorID, update: SectorUpdate) -> Result<()> {
        let mut sectors = self.sectors.lock();
        let sector = sectors
            .entry((id.miner, id.number))
            .or_insert_with(|| SectorState::new(id));
        if let Some(pre) = update.pre {
            sector.pre = Some(pre);
        }
        if let Some(proof) = update.proof {
            sector.proof = Some(proof);
        }
        if let Some(message_info) = update.message_info {
            sector.message_info = message_info;
        }
        Ok(())
    }

    async fn all(&self, _ws: WorkerState, _job: SectorWorkerJob) -> Result<Vec<SectorState>> {
        Ok(self.sectors.lock().values().cloned().collect())
    }
}

/// Fake seal verifier, accepting by default.
pub struct TestVerifier {
    accept: bool,
    calls: AtomicUsize,
}

impl Default for TestVerifier {
    fn default() -> Self {
        TestVerifier {
            accept: true,
            calls: AtomicUsize::new(0),
        }
    }
}

impl TestVerifier {
    pub fn rejecting() -> Self {
        TestVerifier {
            accept: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SealVerifier for TestVerifier {
    async fn verify_seal(&self, _info: SealVerifyInfo) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.accept)
    }
}

/// Fake prover returning a fixed aggregate.
#[derive(Default)]
pub struct TestProver {
    calls: Mutex<Vec<usize>>,
}

impl TestProver {
    /// Sizes of the proof sets aggregated so far.
    pub fn calls(&self) -> Vec<usize> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl SealProver for TestProver {
    async fn aggregate_seal_proofs(
        &self,
        _infos: AggregateSealVerifyProofAndInfos,
        proofs: Vec<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        self.calls.lock().push(proofs.len());
        Ok(b"aggregate-proof".to_vec())
    }
}
