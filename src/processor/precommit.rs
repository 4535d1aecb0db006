// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use fvm_ipld_encoding::RawBytes;
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use fvm_shared::ActorID;
use num_traits::Zero;
use tracing::{debug, error, info, warn};

use super::{partition_precommits, persist_message_ids, precommit_params, Processor};
use crate::api::{Messager, MinerInfoApi, MsgSpec, SealingApi, SectorStateStore, SectorUpdate, TipsetToken};
use crate::check::check_precommit;
use crate::config::{CommitmentConfig, StageConfig};
use crate::errors::PreCheckError;
use crate::mid::push_message;
use crate::miner_actor::{Method, PreCommitSectorBatchParams};
use crate::types::{SectorState, Stage};

/// Builds `PreCommitSector` / `PreCommitSectorBatch` messages out of a batch.
pub struct PreCommitProcessor {
    pub api: Arc<dyn SealingApi>,
    pub minfo: Arc<dyn MinerInfoApi>,
    pub msg_client: Arc<dyn Messager>,
    pub store: Arc<dyn SectorStateStore>,
    pub config: Arc<CommitmentConfig>,
}

#[async_trait]
impl Processor for PreCommitProcessor {
    fn stage(&self) -> Stage {
        Stage::PreCommit
    }

    async fn process(
        &self,
        sectors: Vec<SectorState>,
        mid: ActorID,
        sender: Address,
    ) -> Result<()> {
        let maddr = Address::new_id(mid);
        let scfg = self.config.miner_config(mid).pre;
        let spec = MsgSpec::from(&scfg.fee);

        let mut eligible = Vec::with_capacity(sectors.len());
        for mut sector in sectors {
            match check_precommit(maddr, &sector, &*self.minfo, &*self.api).await {
                Ok(()) => eligible.push(sector),
                Err(PreCheckError::PrecommitOnChain) => {
                    info!(miner = mid, sector = sector.id.number, "pre-commit already on chain");
                    sector.message_info.need_send = false;
                    if let Err(e) = self
                        .store
                        .update(
                            sector.id.clone(),
                            SectorUpdate::message_info(sector.message_info.clone()),
                        )
                        .await
                    {
                        error!(sector = sector.id.number, error = %e, "update sector message info");
                    }
                }
                Err(e) => {
                    warn!(
                        miner = mid,
                        sector = sector.id.number,
                        error = %e,
                        "sector dropped from batch at dispatch recheck"
                    );
                }
            }
        }
        if eligible.is_empty() {
            return Ok(());
        }

        let (tok, _) = self.api.chain_head().await?;
        for group in partition_precommits(eligible, scfg.expiry_slack) {
            if scfg.enable_aggregate && group.len() >= scfg.min_aggregate {
                self.send_batch(group, mid, maddr, sender, &scfg, &spec, &tok)
                    .await;
            } else {
                for sector in group {
                    self.send_single(sector, mid, maddr, sender, &scfg, &spec, &tok)
                        .await;
                }
            }
        }
        Ok(())
    }
}

impl PreCommitProcessor {
    async fn deposit_for(
        &self,
        maddr: Address,
        params: &[crate::miner_actor::SectorPreCommitInfo],
        scfg: &StageConfig,
        tok: &TipsetToken,
    ) -> Result<TokenAmount> {
        if !scfg.send_fund {
            return Ok(TokenAmount::zero());
        }
        let mut deposit = TokenAmount::zero();
        for p in params {
            deposit = deposit + self.api.state_miner_pre_commit_deposit(maddr, p, tok).await?;
        }
        let available = self.api.state_miner_available_balance(maddr, tok).await?;
        if available < deposit {
            warn!(
                %available,
                %deposit,
                "miner balance below the pre-commit deposit, the message may fail"
            );
        }
        Ok(deposit)
    }

    async fn send_batch(
        &self,
        mut group: Vec<SectorState>,
        mid: ActorID,
        maddr: Address,
        sender: Address,
        scfg: &StageConfig,
        spec: &MsgSpec,
        tok: &TipsetToken,
    ) {
        let mut infos = Vec::with_capacity(group.len());
        for s in &group {
            match precommit_params(s) {
                Ok(p) => infos.push(p),
                Err(e) => {
                    error!(sector = s.id.number, error = %e, "build pre-commit params");
                    return;
                }
            }
        }

        let value = match self.deposit_for(maddr, &infos, scfg, tok).await {
            Ok(v) => v,
            Err(e) => {
                error!(miner = mid, error = %e, "compute pre-commit deposit");
                return;
            }
        };
        let params = match RawBytes::serialize(PreCommitSectorBatchParams { sectors: infos }) {
            Ok(p) => p,
            Err(e) => {
                error!(miner = mid, error = %e, "encode pre-commit batch params");
                return;
            }
        };

        debug!(miner = mid, count = group.len(), "pushing pre-commit batch");
        match push_message(
            &*self.msg_client,
            sender,
            mid,
            value,
            Method::PreCommitSectorBatch as u64,
            params,
            spec,
        )
        .await
        {
            Ok(mcid) => {
                persist_message_ids(&*self.store, Stage::PreCommit, &mut group, mcid).await;
            }
            Err(e) => {
                error!(miner = mid, count = group.len(), error = %e, "push pre-commit batch");
            }
        }
    }

    async fn send_single(
        &self,
        sector: SectorState,
        mid: ActorID,
        maddr: Address,
        sender: Address,
        scfg: &StageConfig,
        spec: &MsgSpec,
        tok: &TipsetToken,
    ) {
        let info = match precommit_params(&sector) {
            Ok(p) => p,
            Err(e) => {
                error!(sector = sector.id.number, error = %e, "build pre-commit params");
                return;
            }
        };
        let value = match self
            .deposit_for(maddr, std::slice::from_ref(&info), scfg, tok)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                error!(sector = sector.id.number, error = %e, "compute pre-commit deposit");
                return;
            }
        };
        let params = match RawBytes::serialize(&info) {
            Ok(p) => p,
            Err(e) => {
                error!(sector = sector.id.number, error = %e, "encode pre-commit params");
                return;
            }
        };

        match push_message(
            &*self.msg_client,
            sender,
            mid,
            value,
            Method::PreCommitSector as u64,
            params,
            spec,
        )
        .await
        {
            Ok(mcid) => {
                let mut one = [sector];
                persist_message_ids(&*self.store, Stage::PreCommit, &mut one, mcid).await;
            }
            Err(e) => {
                error!(sector = sector.id.number, error = %e, "push pre-commit");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_api::{
        make_piece_cid, TestMessager, TestMinerInfoApi, TestSealingApi, TestSectorStore,
    };
    use crate::types::{PreCommitInfo, SectorID, SectorState, Ticket};
    use fvm_shared::randomness::Randomness;
    use fvm_shared::sector::RegisteredSealProof;
    use std::sync::Arc;

    const MINER: u64 = 1000;
    const HEAD: fvm_shared::clock::ChainEpoch = 600_000;

    struct Fixture {
        processor: PreCommitProcessor,
        api: Arc<TestSealingApi>,
        messager: Arc<TestMessager>,
        store: Arc<TestSectorStore>,
    }

    fn fixture() -> Fixture {
        let api = Arc::new(TestSealingApi::with_head(HEAD));
        let messager = Arc::new(TestMessager::default());
        let store = Arc::new(TestSectorStore::default());
        let processor = PreCommitProcessor {
            api: api.clone(),
            minfo: Arc::new(TestMinerInfoApi::with_seal_proof(
                MINER,
                RegisteredSealProof::StackedDRG32GiBV1P1,
            )),
            msg_client: messager.clone(),
            store: store.clone(),
            config: Arc::new(crate::config::CommitmentConfig::default()),
        };
        Fixture {
            processor,
            api,
            messager,
            store,
        }
    }

    fn pending_sector(api: &TestSealingApi, number: u64) -> SectorState {
        let mut s = SectorState::new(SectorID {
            miner: MINER,
            number,
        });
        s.pre = Some(PreCommitInfo {
            comm_r: make_piece_cid(b"comm-r"),
            comm_d: api.comm_d(),
            ticket: Ticket {
                epoch: HEAD - 100,
                ticket: Randomness(b"t".to_vec()),
            },
            deals: vec![],
            seal_proof: RegisteredSealProof::StackedDRG32GiBV1P1,
            expiration: HEAD + crate::policy::MIN_SECTOR_LIFETIME + 1000,
        });
        s.message_info.need_send = true;
        s
    }

    #[tokio::test]
    async fn recheck_drops_invalid_sectors_but_sends_the_rest() {
        let f = fixture();
        let good = pending_sector(&f.api, 1);
        let mut bad = pending_sector(&f.api, 2);
        bad.pre.as_mut().unwrap().comm_d = make_piece_cid(b"stale");
        f.store.insert(good.clone());
        f.store.insert(bad.clone());

        f.processor
            .process(vec![good, bad], MINER, Address::new_id(10))
            .await
            .unwrap();

        assert_eq!(f.messager.pushed().len(), 1);
        let good_after = f.store.get(SectorID { miner: MINER, number: 1 }).unwrap();
        assert!(!good_after.message_info.need_send);
        assert!(good_after.message_info.pre_commit_cid.is_some());
        // the dropped sector stays flagged for recovery
        let bad_after = f.store.get(SectorID { miner: MINER, number: 2 }).unwrap();
        assert!(bad_after.message_info.need_send);
        assert!(bad_after.message_info.pre_commit_cid.is_none());
    }

    #[tokio::test]
    async fn already_on_chain_lowers_the_flag_without_a_push() {
        let f = fixture();
        let sector = pending_sector(&f.api, 3);
        f.store.insert(sector.clone());
        f.api
            .put_precommit_record(Address::new_id(MINER), &sector, HEAD - 50);

        f.processor
            .process(vec![sector], MINER, Address::new_id(10))
            .await
            .unwrap();

        assert!(f.messager.pushed().is_empty());
        let after = f.store.get(SectorID { miner: MINER, number: 3 }).unwrap();
        assert!(!after.message_info.need_send);
        assert!(after.message_info.pre_commit_cid.is_none());
    }

    #[tokio::test]
    async fn push_failure_leaves_sectors_flagged() {
        let f = fixture();
        let sector = pending_sector(&f.api, 4);
        f.store.insert(sector.clone());
        f.messager.set_push_failure(true);

        f.processor
            .process(vec![sector], MINER, Address::new_id(10))
            .await
            .unwrap();

        let after = f.store.get(SectorID { miner: MINER, number: 4 }).unwrap();
        assert!(after.message_info.need_send);
        assert!(after.message_info.pre_commit_cid.is_none());
    }
}
