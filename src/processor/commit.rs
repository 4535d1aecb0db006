// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_encoding::RawBytes;
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::{
    AggregateSealVerifyInfo, AggregateSealVerifyProofAndInfos, RegisteredAggregateProof,
    RegisteredSealProof,
};
use fvm_shared::ActorID;
use num_traits::Zero;
use tracing::{debug, error, warn};

use super::{partition_commits, persist_message_ids, pre_info, proof_info, Processor};
use crate::api::{Messager, MsgSpec, SealProver, SealVerifier, SealingApi, SectorStateStore};
use crate::check::check_commit;
use crate::config::CommitmentConfig;
use crate::mid::push_message;
use crate::miner_actor::{Method, ProveCommitAggregateParams, ProveCommitSectorParams};
use crate::types::{SectorState, Stage};

/// Builds `ProveCommitSector` / `ProveCommitAggregate` messages out of a
/// batch. Prove-commit messages carry no value.
pub struct CommitProcessor {
    pub api: Arc<dyn SealingApi>,
    pub msg_client: Arc<dyn Messager>,
    pub store: Arc<dyn SectorStateStore>,
    pub config: Arc<CommitmentConfig>,
    pub verifier: Arc<dyn SealVerifier>,
    pub prover: Arc<dyn SealProver>,
}

#[async_trait]
impl Processor for CommitProcessor {
    fn stage(&self) -> Stage {
        Stage::ProveCommit
    }

    async fn process(
        &self,
        sectors: Vec<SectorState>,
        mid: ActorID,
        sender: Address,
    ) -> Result<()> {
        let maddr = Address::new_id(mid);
        let scfg = self.config.miner_config(mid).prove;
        let spec = MsgSpec::from(&scfg.fee);

        for group in partition_commits(sectors) {
            let aggregate = scfg.enable_aggregate && group.len() >= scfg.min_aggregate;

            let mut eligible = Vec::with_capacity(group.len());
            for sector in group {
                let proof = match proof_info(&sector) {
                    Ok(p) => p.proof.clone(),
                    Err(e) => {
                        error!(sector = sector.id.number, error = %e, "missing proof info");
                        continue;
                    }
                };
                let marker = if aggregate { Some(&proof[..]) } else { None };
                match check_commit(maddr, &sector, &proof, marker, &*self.verifier, &*self.api)
                    .await
                {
                    Ok(()) => eligible.push(sector),
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
                continue;
            }

            if aggregate && eligible.len() >= scfg.min_aggregate {
                self.send_aggregate(eligible, mid, sender, &spec).await;
            } else {
                for sector in eligible {
                    self.send_single(sector, mid, sender, &spec).await;
                }
            }
        }
        Ok(())
    }
}

impl CommitProcessor {
    async fn send_aggregate(
        &self,
        mut group: Vec<SectorState>,
        mid: ActorID,
        sender: Address,
        spec: &MsgSpec,
    ) {
        let mut seal_proof = RegisteredSealProof::Invalid(0);
        let mut infos = Vec::with_capacity(group.len());
        let mut proofs = Vec::with_capacity(group.len());
        let mut numbers = Vec::with_capacity(group.len());
        for s in &group {
            let (pre, proof) = match (pre_info(s), proof_info(s)) {
                (Ok(pre), Ok(proof)) => (pre, proof),
                (Err(e), _) | (_, Err(e)) => {
                    error!(sector = s.id.number, error = %e, "build aggregate inputs");
                    return;
                }
            };
            seal_proof = pre.seal_proof;
            infos.push(AggregateSealVerifyInfo {
                sector_number: s.id.number,
                randomness: pre.ticket.ticket.clone(),
                interactive_randomness: proof.seed.seed.clone(),
                sealed_cid: pre.comm_r,
                unsealed_cid: pre.comm_d,
            });
            proofs.push(proof.proof.clone());
            numbers.push(s.id.number);
        }

        let inputs = AggregateSealVerifyProofAndInfos {
            miner: mid,
            seal_proof,
            aggregate_proof: RegisteredAggregateProof::SnarkPackV2,
            proof: vec![],
            infos,
        };
        let aggregated = match self.prover.aggregate_seal_proofs(inputs, proofs).await {
            Ok(p) => p,
            Err(e) => {
                error!(miner = mid, count = group.len(), error = %e, "aggregate seal proofs");
                return;
            }
        };

        let sector_numbers = match BitField::try_from_bits(numbers) {
            Ok(bf) => bf,
            Err(e) => {
                error!(miner = mid, error = %e, "build sector number bitfield");
                return;
            }
        };
        let params = match RawBytes::serialize(ProveCommitAggregateParams {
            sector_numbers,
            aggregate_proof: RawBytes::new(aggregated),
        }) {
            Ok(p) => p,
            Err(e) => {
                error!(miner = mid, error = %e, "encode prove-commit aggregate params");
                return;
            }
        };

        debug!(miner = mid, count = group.len(), "pushing prove-commit aggregate");
        match push_message(
            &*self.msg_client,
            sender,
            mid,
            TokenAmount::zero(),
            Method::ProveCommitAggregate as u64,
            params,
            spec,
        )
        .await
        {
            Ok(mcid) => {
                persist_message_ids(&*self.store, Stage::ProveCommit, &mut group, mcid).await;
            }
            Err(e) => {
                error!(miner = mid, count = group.len(), error = %e, "push prove-commit aggregate");
            }
        }
    }

    async fn send_single(&self, sector: SectorState, mid: ActorID, sender: Address, spec: &MsgSpec) {
        let proof = match proof_info(&sector) {
            Ok(p) => p.proof.clone(),
            Err(e) => {
                error!(sector = sector.id.number, error = %e, "missing proof info");
                return;
            }
        };
        let params = match RawBytes::serialize(ProveCommitSectorParams {
            sector_number: sector.id.number,
            proof: RawBytes::new(proof),
        }) {
            Ok(p) => p,
            Err(e) => {
                error!(sector = sector.id.number, error = %e, "encode prove-commit params");
                return;
            }
        };

        match push_message(
            &*self.msg_client,
            sender,
            mid,
            TokenAmount::zero(),
            Method::ProveCommitSector as u64,
            params,
            spec,
        )
        .await
        {
            Ok(mcid) => {
                let mut one = [sector];
                persist_message_ids(&*self.store, Stage::ProveCommit, &mut one, mcid).await;
            }
            Err(e) => {
                error!(sector = sector.id.number, error = %e, "push prove-commit");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommitmentConfig, MinerCommitConfig};
    use crate::policy::PRE_COMMIT_CHALLENGE_DELAY;
    use crate::test_api::{
        beacon_randomness, make_piece_cid, TestMessager, TestProver, TestSealingApi,
        TestSectorStore, TestVerifier,
    };
    use crate::types::{PreCommitInfo, ProofInfo, SectorID, SectorState, Seed, Ticket};
    use fvm_shared::clock::ChainEpoch;
    use fvm_shared::randomness::Randomness;
    use std::sync::Arc;

    const MINER: u64 = 1000;
    const HEAD: ChainEpoch = 600_000;
    const PRE_COMMIT_EPOCH: ChainEpoch = HEAD - 500;

    struct Fixture {
        processor: CommitProcessor,
        api: Arc<TestSealingApi>,
        messager: Arc<TestMessager>,
        store: Arc<TestSectorStore>,
        prover: Arc<TestProver>,
    }

    fn fixture(min_aggregate: usize) -> Fixture {
        let api = Arc::new(TestSealingApi::with_head(HEAD));
        let messager = Arc::new(TestMessager::default());
        let store = Arc::new(TestSectorStore::default());
        let prover = Arc::new(TestProver::default());
        let mut cfg = MinerCommitConfig::default();
        cfg.prove.min_aggregate = min_aggregate;
        let processor = CommitProcessor {
            api: api.clone(),
            msg_client: messager.clone(),
            store: store.clone(),
            config: Arc::new(CommitmentConfig::new(cfg)),
            verifier: Arc::new(TestVerifier::default()),
            prover: prover.clone(),
        };
        Fixture {
            processor,
            api,
            messager,
            store,
            prover,
        }
    }

    fn proven_sector(f: &Fixture, number: u64) -> SectorState {
        let mut s = SectorState::new(SectorID {
            miner: MINER,
            number,
        });
        s.pre = Some(PreCommitInfo {
            comm_r: make_piece_cid(b"comm-r"),
            comm_d: f.api.comm_d(),
            ticket: Ticket {
                epoch: HEAD - 100,
                ticket: Randomness(b"t".to_vec()),
            },
            deals: vec![],
            seal_proof: fvm_shared::sector::RegisteredSealProof::StackedDRG32GiBV1P1,
            expiration: HEAD + crate::policy::MIN_SECTOR_LIFETIME + 1000,
        });
        let seed_epoch = PRE_COMMIT_EPOCH + PRE_COMMIT_CHALLENGE_DELAY;
        s.proof = Some(ProofInfo {
            proof: format!("porep-{number}").into_bytes(),
            seed: Seed {
                epoch: seed_epoch,
                seed: beacon_randomness(seed_epoch),
            },
        });
        s.message_info.need_send = true;
        f.api
            .put_precommit_record(Address::new_id(MINER), &s, PRE_COMMIT_EPOCH);
        f.store.insert(s.clone());
        s
    }

    #[tokio::test]
    async fn aggregates_once_the_threshold_is_met() {
        let f = fixture(4);
        let batch: Vec<SectorState> = (1..=4).map(|n| proven_sector(&f, n)).collect();

        f.processor
            .process(batch, MINER, Address::new_id(11))
            .await
            .unwrap();

        let pushed = f.messager.pushed();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].msg.method_num, Method::ProveCommitAggregate as u64);
        assert_eq!(f.prover.calls(), vec![4]);
        for n in 1..=4u64 {
            let after = f.store.get(SectorID { miner: MINER, number: n }).unwrap();
            assert_eq!(after.message_info.commit_cid.unwrap().to_string(), pushed[0].id);
        }
    }

    #[tokio::test]
    async fn small_groups_go_out_individually() {
        let f = fixture(4);
        let batch: Vec<SectorState> = (1..=2).map(|n| proven_sector(&f, n)).collect();

        f.processor
            .process(batch, MINER, Address::new_id(11))
            .await
            .unwrap();

        let pushed = f.messager.pushed();
        assert_eq!(pushed.len(), 2);
        assert!(pushed
            .iter()
            .all(|p| p.msg.method_num == Method::ProveCommitSector as u64));
        assert!(f.prover.calls().is_empty());
    }

    #[tokio::test]
    async fn dropped_sector_shrinks_the_aggregate_to_individual_sends() {
        let f = fixture(4);
        let mut batch: Vec<SectorState> = (1..=4).map(|n| proven_sector(&f, n)).collect();
        // one sector's seed no longer matches the chain
        batch[0].proof.as_mut().unwrap().seed.epoch += 1;

        f.processor
            .process(batch, MINER, Address::new_id(11))
            .await
            .unwrap();

        let pushed = f.messager.pushed();
        assert_eq!(pushed.len(), 3);
        assert!(pushed
            .iter()
            .all(|p| p.msg.method_num == Method::ProveCommitSector as u64));
        assert!(f.prover.calls().is_empty());
        let dropped = f.store.get(SectorID { miner: MINER, number: 1 }).unwrap();
        assert!(dropped.message_info.need_send);
    }
}
