// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The public façade. Routes accepted submissions to per-miner batchers,
//! re-enqueues unsent work after a restart and interprets messager state into
//! the coarse lifecycle callers poll.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::HashMap;
use anyhow::{anyhow, Result};
use fvm_shared::address::Address;
use fvm_shared::error::ExitCode;
use fvm_shared::ActorID;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{
    Messager, MinerInfoApi, MsgDetail, MessageState, PreCommitLookup, SealProver, SealVerifier,
    SealingApi, SectorStateStore, SectorUpdate, SectorWorkerJob, WorkerState,
};
use crate::batcher::Batcher;
use crate::check::{check_commit, check_precommit};
use crate::config::CommitmentConfig;
use crate::errors::{PreCheckError, ProofCheckError};
use crate::processor::{CommitProcessor, PreCommitProcessor};
use crate::types::{
    OnChainState, PollStateResp, PreCommitInfo, ProofInfo, SectorID, SectorState, SubmitResp,
};

const PENDING_CHAN_SIZE: usize = 1024;

const ERR_MSG_PUBLISH_ATTEMPT_FAILED: &str = "attempt to publish message but failed";
const ERR_MSG_RECEIPT_NOT_FOUND: &str = "receipt not found for on-chain message";
const ERR_MSG_SECTOR_ALLOCATED: &str = "sector already allocated";
const ERR_MSG_PRECOMMIT_NOT_FOUND: &str = "pre-commit info not found on chain";
const ERR_MSG_SECTOR_INFO_NOT_FOUND: &str = "sector info not found on chain";

pub struct CommitmentManager {
    msg_client: Arc<dyn Messager>,
    state: Arc<dyn SealingApi>,
    minfo: Arc<dyn MinerInfoApi>,
    store: Arc<dyn SectorStateStore>,
    config: Arc<CommitmentConfig>,
    verifier: Arc<dyn SealVerifier>,
    prover: Arc<dyn SealProver>,

    pre_batchers: Mutex<HashMap<ActorID, Arc<Batcher>>>,
    commit_batchers: Mutex<HashMap<ActorID, Arc<Batcher>>>,

    pre_tx: flume::Sender<SectorState>,
    pro_tx: flume::Sender<SectorState>,
    pre_rx: Mutex<Option<flume::Receiver<SectorState>>>,
    pro_rx: Mutex<Option<flume::Receiver<SectorState>>>,

    stop: CancellationToken,
    stopped: AtomicBool,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl CommitmentManager {
    pub fn new(
        msg_client: Arc<dyn Messager>,
        state: Arc<dyn SealingApi>,
        minfo: Arc<dyn MinerInfoApi>,
        store: Arc<dyn SectorStateStore>,
        config: Arc<CommitmentConfig>,
        verifier: Arc<dyn SealVerifier>,
        prover: Arc<dyn SealProver>,
    ) -> Self {
        let (pre_tx, pre_rx) = flume::bounded(PENDING_CHAN_SIZE);
        let (pro_tx, pro_rx) = flume::bounded(PENDING_CHAN_SIZE);
        CommitmentManager {
            msg_client,
            state,
            minfo,
            store,
            config,
            verifier,
            prover,
            pre_batchers: Mutex::new(HashMap::default()),
            commit_batchers: Mutex::new(HashMap::default()),
            pre_tx,
            pro_tx,
            pre_rx: Mutex::new(Some(pre_rx)),
            pro_rx: Mutex::new(Some(pro_rx)),
            stop: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the two dispatch loops and the restart recovery scan.
    pub fn run(self: &Arc<Self>) {
        let mut loops = self.loops.lock();
        if let Some(rx) = self.pre_rx.lock().take() {
            loops.push(tokio::spawn(self.clone().start_pre_loop(rx)));
        }
        if let Some(rx) = self.pro_rx.lock().take() {
            loops.push(tokio::spawn(self.clone().start_pro_loop(rx)));
        }
        loops.push(tokio::spawn(self.clone().restart_sectors()));
    }

    /// Idempotent shutdown: stops the dispatch loops, then waits for every
    /// batcher of both stages to finish its in-flight dispatch. Pending
    /// sectors are not drained; the restart scan picks them up.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stop commitment manager");
        self.stop.cancel();

        let loops: Vec<_> = std::mem::take(&mut *self.loops.lock());
        for handle in loops {
            let _ = handle.await;
        }

        let pre: Vec<_> = self.pre_batchers.lock().values().cloned().collect();
        for batcher in pre {
            batcher.wait_stop().await;
        }
        let commit: Vec<_> = self.commit_batchers.lock().values().cloned().collect();
        for batcher in commit {
            batcher.wait_stop().await;
        }
    }

    fn pre_sender(&self, mid: ActorID) -> Result<Address> {
        self.config
            .miner_config(mid)
            .pre
            .sender
            .ok_or_else(|| anyhow!("pre-commit sender not configured for miner {mid}"))
    }

    fn prove_sender(&self, mid: ActorID) -> Result<Address> {
        self.config
            .miner_config(mid)
            .prove
            .sender
            .ok_or_else(|| anyhow!("prove-commit sender not configured for miner {mid}"))
    }

    async fn start_pre_loop(self: Arc<Self>, rx: flume::Receiver<SectorState>) {
        info!(stage = "pre", "pending loop start");
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                recv = rx.recv_async() => match recv {
                    Ok(sector) => self.dispatch_pre(sector).await,
                    Err(_) => break,
                },
            }
        }
        info!(stage = "pre", "pending loop stop");
    }

    async fn start_pro_loop(self: Arc<Self>, rx: flume::Receiver<SectorState>) {
        info!(stage = "pro", "pending loop start");
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                recv = rx.recv_async() => match recv {
                    Ok(sector) => self.dispatch_pro(sector).await,
                    Err(_) => break,
                },
            }
        }
        info!(stage = "pro", "pending loop stop");
    }

    async fn dispatch_pre(self: &Arc<Self>, sector: SectorState) {
        let miner = sector.id.miner;
        let batcher = {
            let mut batchers = self.pre_batchers.lock();
            match batchers.get(&miner) {
                Some(b) => b.clone(),
                None => {
                    let sender = match self.pre_sender(miner) {
                        Ok(s) => s,
                        Err(e) => {
                            error!(miner, error = %e, "get sender address");
                            return;
                        }
                    };
                    let processor = Arc::new(PreCommitProcessor {
                        api: self.state.clone(),
                        minfo: self.minfo.clone(),
                        msg_client: self.msg_client.clone(),
                        store: self.store.clone(),
                        config: self.config.clone(),
                    });
                    let batcher = Arc::new(Batcher::new(
                        miner,
                        sender,
                        self.config.miner_config(miner).pre,
                        processor,
                        self.stop.child_token(),
                    ));
                    batchers.insert(miner, batcher.clone());
                    batcher
                }
            }
        };
        batcher.add(sector).await;
    }

    async fn dispatch_pro(self: &Arc<Self>, sector: SectorState) {
        let miner = sector.id.miner;
        let batcher = {
            let mut batchers = self.commit_batchers.lock();
            match batchers.get(&miner) {
                Some(b) => b.clone(),
                None => {
                    let sender = match self.prove_sender(miner) {
                        Ok(s) => s,
                        Err(e) => {
                            error!(miner, error = %e, "get sender address");
                            return;
                        }
                    };
                    let processor = Arc::new(CommitProcessor {
                        api: self.state.clone(),
                        msg_client: self.msg_client.clone(),
                        store: self.store.clone(),
                        config: self.config.clone(),
                        verifier: self.verifier.clone(),
                        prover: self.prover.clone(),
                    });
                    let batcher = Arc::new(Batcher::new(
                        miner,
                        sender,
                        self.config.miner_config(miner).prove,
                        processor,
                        self.stop.child_token(),
                    ));
                    batchers.insert(miner, batcher.clone());
                    batcher
                }
            }
        };
        batcher.add(sector).await;
    }

    /// Re-enqueues every sector whose submission was accepted but not yet
    /// dispatched. `need_send` in the store is the sole recovery anchor;
    /// in-memory queue contents from before the restart do not matter.
    async fn restart_sectors(self: Arc<Self>) {
        let sectors = match self
            .store
            .all(WorkerState::Online, SectorWorkerJob::Sealing)
            .await
        {
            Ok(sectors) => sectors,
            Err(e) => {
                error!(error = %e, "load sectors from the store");
                return;
            }
        };
        debug!(count = sectors.len(), "previous sectors loaded");

        for sector in sectors {
            if !sector.message_info.need_send {
                continue;
            }
            let tx = if sector.message_info.pre_commit_cid.is_none() {
                &self.pre_tx
            } else {
                &self.pro_tx
            };
            if tx.send_async(sector).await.is_err() {
                debug!("pending channel closed during recovery");
                return;
            }
        }
    }

    pub async fn submit_pre_commit(
        &self,
        id: SectorID,
        info: PreCommitInfo,
        hard_reset: bool,
    ) -> Result<SubmitResp> {
        if let Err(e) = self.pre_sender(id.miner) {
            return Ok(SubmitResp::rejected(e.to_string()));
        }
        let mut sector = self.store.load(id.clone()).await?;
        let maddr = Address::new_id(id.miner);

        if let Some(prev) = &sector.pre {
            if !hard_reset {
                let changed = prev.comm_d != info.comm_d
                    || prev.comm_r != info.comm_r
                    || prev.ticket.epoch != info.ticket.epoch
                    || prev.ticket.ticket != info.ticket.ticket;
                return Ok(if changed {
                    SubmitResp::mismatched()
                } else {
                    SubmitResp::accepted()
                });
            }
        }

        sector.pre = Some(info);
        match check_precommit(maddr, &sector, &*self.minfo, &*self.state).await {
            Ok(()) => {}
            Err(PreCheckError::Api(e)) => return Err(e),
            Err(PreCheckError::PrecommitOnChain) => return Ok(SubmitResp::accepted()),
            Err(
                e @ (PreCheckError::BadCommD { .. }
                | PreCheckError::BadTicket(_)
                | PreCheckError::ExpirationTooSoon { .. }
                | PreCheckError::DealsInvalid(_)
                | PreCheckError::BadSealProofType { .. }
                | PreCheckError::SectorAllocated),
            ) => return Ok(SubmitResp::rejected(e.to_string())),
        }

        sector.message_info.need_send = true;
        sector.message_info.pre_commit_cid = None;
        self.store
            .update(
                id,
                SectorUpdate {
                    pre: sector.pre.clone(),
                    message_info: Some(sector.message_info.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let tx = self.pre_tx.clone();
        tokio::spawn(async move {
            if tx.send_async(sector).await.is_err() {
                debug!("pre pending channel closed");
            }
        });
        Ok(SubmitResp::accepted())
    }

    pub async fn submit_proof(
        &self,
        id: SectorID,
        info: ProofInfo,
        hard_reset: bool,
    ) -> Result<SubmitResp> {
        if let Err(e) = self.prove_sender(id.miner) {
            return Ok(SubmitResp::rejected(e.to_string()));
        }
        let mut sector = self.store.load(id.clone()).await?;
        let maddr = Address::new_id(id.miner);

        if sector.pre.is_none() {
            return Ok(SubmitResp::rejected(ERR_MSG_PRECOMMIT_NOT_FOUND));
        }

        if let Some(prev) = &sector.proof {
            if !hard_reset {
                return Ok(if prev.proof != info.proof {
                    SubmitResp::mismatched()
                } else {
                    SubmitResp::accepted()
                });
            }
        }

        sector.proof = Some(info);
        let proof = sector
            .proof
            .as_ref()
            .map(|p| p.proof.clone())
            .unwrap_or_default();
        match check_commit(maddr, &sector, &proof, None, &*self.verifier, &*self.state).await {
            Ok(()) => {}
            Err(ProofCheckError::Api(e)) => return Err(e),
            Err(
                e @ (ProofCheckError::NoPrecommit
                | ProofCheckError::InvalidDeals(_)
                | ProofCheckError::ExpiredDeals(_)
                | ProofCheckError::SectorNumberAllocated
                | ProofCheckError::BadSeed(_)
                | ProofCheckError::InvalidProof(_)
                | ProofCheckError::MarshalAddr(_)),
            ) => return Ok(SubmitResp::rejected(e.to_string())),
        }

        sector.message_info.need_send = true;
        sector.message_info.commit_cid = None;
        self.store
            .update(
                id,
                SectorUpdate {
                    proof: sector.proof.clone(),
                    message_info: Some(sector.message_info.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let tx = self.pro_tx.clone();
        tokio::spawn(async move {
            if tx.send_async(sector).await.is_err() {
                debug!("pro pending channel closed");
            }
        });
        Ok(SubmitResp::accepted())
    }

    pub async fn pre_commit_state(&self, id: SectorID) -> Result<PollStateResp> {
        let maddr = Address::new_id(id.miner);
        let sector = self.store.load(id.clone()).await?;

        let mcid = match sector.message_info.pre_commit_cid {
            Some(mcid) => mcid,
            None => {
                if sector.message_info.need_send {
                    return Ok(PollStateResp {
                        state: OnChainState::Pending,
                        desc: None,
                    });
                }
                // No message was ever dispatched. The record may still exist
                // on chain (pre-commit accepted as already landed).
                let (tok, _) = self.state.chain_head().await?;
                return match self
                    .state
                    .state_sector_precommit_info(maddr, id.number, &tok)
                    .await?
                {
                    PreCommitLookup::Found(_) => Ok(PollStateResp {
                        state: OnChainState::Landed,
                        desc: None,
                    }),
                    PreCommitLookup::Allocated => {
                        // the pre-commit record is consumed once the sector
                        // is proven
                        if self
                            .state
                            .state_sector_get_info(maddr, id.number, &tok)
                            .await?
                            .is_some()
                        {
                            Ok(PollStateResp {
                                state: OnChainState::Landed,
                                desc: None,
                            })
                        } else {
                            Ok(PollStateResp {
                                state: OnChainState::ShouldAbort,
                                desc: Some(ERR_MSG_SECTOR_ALLOCATED.into()),
                            })
                        }
                    }
                    PreCommitLookup::NotFound => Ok(PollStateResp {
                        state: OnChainState::Failed,
                        desc: Some(ERR_MSG_PUBLISH_ATTEMPT_FAILED.into()),
                    }),
                };
            }
        };

        let msg = self.msg_client.get_message_by_uid(&mcid.to_string()).await?;
        let confidence = self.config.miner_config(id.miner).confidence;
        let (state, desc) = resolve_message_state(confidence, &msg);

        if state == OnChainState::Landed {
            let (tok, _) = self.state.chain_head().await?;
            match self
                .state
                .state_sector_precommit_info(maddr, id.number, &tok)
                .await?
            {
                PreCommitLookup::Allocated => {
                    return Ok(PollStateResp {
                        state: OnChainState::ShouldAbort,
                        desc: Some(ERR_MSG_SECTOR_ALLOCATED.into()),
                    });
                }
                PreCommitLookup::NotFound => {
                    return Ok(PollStateResp {
                        state: OnChainState::ShouldAbort,
                        desc: Some(ERR_MSG_PRECOMMIT_NOT_FOUND.into()),
                    });
                }
                PreCommitLookup::Found(_) => {}
            }
        }

        Ok(PollStateResp { state, desc })
    }

    pub async fn proof_state(&self, id: SectorID) -> Result<PollStateResp> {
        let maddr = Address::new_id(id.miner);
        let sector = self.store.load(id.clone()).await?;

        let mcid = match sector.message_info.commit_cid {
            Some(mcid) => mcid,
            None => {
                if sector.message_info.need_send {
                    return Ok(PollStateResp {
                        state: OnChainState::Pending,
                        desc: None,
                    });
                }
                let (tok, _) = self.state.chain_head().await?;
                if self
                    .state
                    .state_sector_get_info(maddr, id.number, &tok)
                    .await?
                    .is_some()
                {
                    return Ok(PollStateResp {
                        state: OnChainState::Landed,
                        desc: None,
                    });
                }
                return Ok(PollStateResp {
                    state: OnChainState::Failed,
                    desc: Some(ERR_MSG_PUBLISH_ATTEMPT_FAILED.into()),
                });
            }
        };

        let msg = self.msg_client.get_message_by_uid(&mcid.to_string()).await?;
        let confidence = self.config.miner_config(id.miner).confidence;
        let (state, desc) = resolve_message_state(confidence, &msg);

        if state == OnChainState::Landed {
            let (tok, _) = self.state.chain_head().await?;
            if self
                .state
                .state_sector_get_info(maddr, id.number, &tok)
                .await?
                .is_none()
            {
                return Ok(PollStateResp {
                    state: OnChainState::ShouldAbort,
                    desc: Some(ERR_MSG_SECTOR_INFO_NOT_FOUND.into()),
                });
            }
        }

        Ok(PollStateResp { state, desc })
    }
}

/// Maps a messager-reported message into the caller-visible lifecycle.
///
/// A receipt return on a message the messager does not consider on-chain is
/// not authoritative; it is logged and carried only as a description.
pub fn resolve_message_state(
    confidence_threshold: i64,
    msg: &MsgDetail,
) -> (OnChainState, Option<String>) {
    let mut desc = None;
    if let Some(receipt) = &msg.receipt {
        if !receipt.ret.is_empty() {
            let text = String::from_utf8_lossy(&receipt.ret).into_owned();
            if msg.state != MessageState::OnChain {
                warn!(
                    id = %msg.id,
                    state = msg.state.as_str(),
                    ret = %text,
                    "receipt return present on an off-chain message"
                );
            }
            desc = Some(text);
        }
    }

    let state = match msg.state {
        MessageState::OnChain => {
            let receipt = match &msg.receipt {
                Some(r) => r,
                None => return (OnChainState::Failed, Some(ERR_MSG_RECEIPT_NOT_FOUND.into())),
            };
            if receipt.exit_code != ExitCode::OK {
                OnChainState::ShouldAbort
            } else if msg.confidence < confidence_threshold {
                OnChainState::Packed
            } else {
                OnChainState::Landed
            }
        }
        MessageState::Failed => OnChainState::Failed,
        _ => OnChainState::Pending,
    };
    (state, desc)
}
