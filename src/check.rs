// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Pure validation of submissions against chain state. Both checkers are
//! side-effect free: they read the chain through [`SealingApi`] and report a
//! typed verdict the façade maps onto the caller-visible result.

use fvm_ipld_encoding::to_vec;
use fvm_shared::address::Address;
use fvm_shared::sector::SealVerifyInfo;

use crate::api::{
    DomainSeparationTag, MinerInfoApi, PreCommitLookup, SealVerifier, SealingApi,
};
use crate::errors::{PreCheckError, ProofCheckError};
use crate::policy::{
    MAX_PRE_COMMIT_RANDOMNESS_LOOKBACK, MIN_SECTOR_LIFETIME, PRE_COMMIT_CHALLENGE_DELAY,
};
use crate::types::SectorState;

/// Validates a sector's pre-commit. `sector.pre` must be populated.
pub async fn check_precommit(
    maddr: Address,
    sector: &SectorState,
    minfo_api: &dyn MinerInfoApi,
    api: &dyn SealingApi,
) -> Result<(), PreCheckError> {
    let pre = sector
        .pre
        .as_ref()
        .ok_or_else(|| PreCheckError::Api(anyhow::anyhow!("sector has no pre-commit info")))?;

    let (tok, head) = api.chain_head().await.map_err(PreCheckError::Api)?;

    let comm_d = api
        .state_compute_data_commitment(maddr, pre.seal_proof, &pre.deals, &tok)
        .await
        .map_err(PreCheckError::Api)?;
    if comm_d != pre.comm_d {
        return Err(PreCheckError::BadCommD {
            chain: comm_d,
            local: pre.comm_d,
        });
    }

    if pre.ticket.epoch + MAX_PRE_COMMIT_RANDOMNESS_LOOKBACK < head {
        return Err(PreCheckError::BadTicket(format!(
            "ticket epoch {} expired at head {}",
            pre.ticket.epoch, head
        )));
    }
    if pre.ticket.epoch > head {
        return Err(PreCheckError::BadTicket(format!(
            "ticket epoch {} is ahead of head {}",
            pre.ticket.epoch, head
        )));
    }

    let min = head + MIN_SECTOR_LIFETIME;
    if pre.expiration < min {
        return Err(PreCheckError::ExpirationTooSoon {
            expiration: pre.expiration,
            min,
        });
    }

    let minfo = minfo_api
        .miner_info(sector.id.miner)
        .await
        .map_err(PreCheckError::Api)?;
    if minfo.seal_proof_type != pre.seal_proof {
        return Err(PreCheckError::BadSealProofType {
            submitted: pre.seal_proof,
            expected: minfo.seal_proof_type,
        });
    }

    for deal_id in &pre.deals {
        let deal = api
            .state_market_storage_deal(*deal_id, &tok)
            .await
            .map_err(PreCheckError::Api)?;
        if deal.provider != maddr {
            return Err(PreCheckError::DealsInvalid(format!(
                "deal {deal_id} belongs to provider {}",
                deal.provider
            )));
        }
        if deal.start_epoch < head {
            return Err(PreCheckError::DealsInvalid(format!(
                "deal {deal_id} started at {} before head {head}",
                deal.start_epoch
            )));
        }
        if deal.end_epoch > pre.expiration {
            return Err(PreCheckError::DealsInvalid(format!(
                "deal {deal_id} outlives the sector: {} > {}",
                deal.end_epoch, pre.expiration
            )));
        }
    }

    match api
        .state_sector_precommit_info(maddr, sector.id.number, &tok)
        .await
        .map_err(PreCheckError::Api)?
    {
        PreCommitLookup::Allocated => Err(PreCheckError::SectorAllocated),
        PreCommitLookup::Found(chain_info) => {
            if chain_info.info.seal_rand_epoch != pre.ticket.epoch {
                return Err(PreCheckError::BadTicket(format!(
                    "on-chain pre-commit used ticket epoch {}, submitted {}",
                    chain_info.info.seal_rand_epoch, pre.ticket.epoch
                )));
            }
            Err(PreCheckError::PrecommitOnChain)
        }
        PreCommitLookup::NotFound => Ok(()),
    }
}

/// Validates a sector's seal proof. `sector.pre` and `sector.proof` must be
/// populated. With `aggregate` set the sector is bound for an aggregated
/// message whose proof stands in for the individual one, so per-sector
/// verification is skipped.
pub async fn check_commit(
    maddr: Address,
    sector: &SectorState,
    proof: &[u8],
    aggregate: Option<&[u8]>,
    verifier: &dyn SealVerifier,
    api: &dyn SealingApi,
) -> Result<(), ProofCheckError> {
    let pre = sector
        .pre
        .as_ref()
        .ok_or_else(|| ProofCheckError::Api(anyhow::anyhow!("sector has no pre-commit info")))?;
    let seed = &sector
        .proof
        .as_ref()
        .ok_or_else(|| ProofCheckError::Api(anyhow::anyhow!("sector has no proof info")))?
        .seed;

    let (tok, head) = api.chain_head().await.map_err(ProofCheckError::Api)?;

    let pci = match api
        .state_sector_precommit_info(maddr, sector.id.number, &tok)
        .await
        .map_err(ProofCheckError::Api)?
    {
        PreCommitLookup::Allocated => return Err(ProofCheckError::SectorNumberAllocated),
        PreCommitLookup::NotFound => return Err(ProofCheckError::NoPrecommit),
        PreCommitLookup::Found(pci) => pci,
    };

    for deal_id in &pre.deals {
        let deal = api
            .state_market_storage_deal(*deal_id, &tok)
            .await
            .map_err(ProofCheckError::Api)?;
        if deal.provider != maddr {
            return Err(ProofCheckError::InvalidDeals(format!(
                "deal {deal_id} belongs to provider {}",
                deal.provider
            )));
        }
        if deal.start_epoch < head {
            return Err(ProofCheckError::ExpiredDeals(format!(
                "deal {deal_id} started at {} before head {head}",
                deal.start_epoch
            )));
        }
    }

    let expected_seed_epoch = pci.pre_commit_epoch + PRE_COMMIT_CHALLENGE_DELAY;
    if seed.epoch != expected_seed_epoch {
        return Err(ProofCheckError::BadSeed(format!(
            "seed epoch {} does not match the chain's {expected_seed_epoch}",
            seed.epoch
        )));
    }

    let entropy = to_vec(&maddr).map_err(ProofCheckError::MarshalAddr)?;
    let sampled = api
        .get_randomness_from_beacon(
            DomainSeparationTag::InteractiveSealChallengeSeed,
            seed.epoch,
            &entropy,
            &tok,
        )
        .await
        .map_err(ProofCheckError::Api)?;
    if sampled != seed.seed {
        return Err(ProofCheckError::BadSeed(
            "seed differs from the chain-sampled randomness".into(),
        ));
    }

    if aggregate.is_none() {
        let ok = verifier
            .verify_seal(SealVerifyInfo {
                registered_proof: pre.seal_proof,
                sector_id: sector.id.clone(),
                deal_ids: pre.deals.clone(),
                randomness: pre.ticket.ticket.clone(),
                interactive_randomness: seed.seed.clone(),
                proof: proof.to_vec(),
                sealed_cid: pre.comm_r,
                unsealed_cid: pre.comm_d,
            })
            .await
            .map_err(|e| ProofCheckError::InvalidProof(e.to_string()))?;
        if !ok {
            return Err(ProofCheckError::InvalidProof(
                "verifier rejected the seal proof".into(),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_api::{
        beacon_randomness, make_piece_cid, TestMinerInfoApi, TestSealingApi, TestVerifier,
    };
    use crate::types::{PreCommitInfo, ProofInfo, SectorID, SectorState, Seed, Ticket};
    use fvm_shared::address::Address;
    use fvm_shared::clock::ChainEpoch;
    use fvm_shared::piece::PaddedPieceSize;
    use fvm_shared::randomness::Randomness;
    use fvm_shared::sector::RegisteredSealProof;

    const MINER: u64 = 1000;
    const HEAD: ChainEpoch = 600_000;

    fn maddr() -> Address {
        Address::new_id(MINER)
    }

    fn valid_sector(api: &TestSealingApi) -> SectorState {
        let mut sector = SectorState::new(SectorID {
            miner: MINER,
            number: 42,
        });
        sector.pre = Some(PreCommitInfo {
            comm_r: make_piece_cid(b"comm-r"),
            comm_d: api.comm_d(),
            ticket: Ticket {
                epoch: HEAD - 100,
                ticket: Randomness(b"ticket".to_vec()),
            },
            deals: vec![],
            seal_proof: RegisteredSealProof::StackedDRG32GiBV1P1,
            expiration: HEAD + crate::policy::MIN_SECTOR_LIFETIME + 1000,
        });
        sector
    }

    fn checker_env() -> (TestSealingApi, TestMinerInfoApi) {
        let api = TestSealingApi::with_head(HEAD);
        let minfo = TestMinerInfoApi::with_seal_proof(
            MINER,
            RegisteredSealProof::StackedDRG32GiBV1P1,
        );
        (api, minfo)
    }

    #[tokio::test]
    async fn precommit_ok() {
        let (api, minfo) = checker_env();
        let sector = valid_sector(&api);
        check_precommit(maddr(), &sector, &minfo, &api).await.unwrap();
    }

    #[tokio::test]
    async fn precommit_bad_comm_d() {
        let (api, minfo) = checker_env();
        let mut sector = valid_sector(&api);
        sector.pre.as_mut().unwrap().comm_d = make_piece_cid(b"other");
        let err = check_precommit(maddr(), &sector, &minfo, &api).await.unwrap_err();
        assert!(matches!(err, PreCheckError::BadCommD { .. }));
    }

    #[tokio::test]
    async fn precommit_expired_ticket() {
        let (api, minfo) = checker_env();
        let mut sector = valid_sector(&api);
        sector.pre.as_mut().unwrap().ticket.epoch =
            HEAD - MAX_PRE_COMMIT_RANDOMNESS_LOOKBACK - 1;
        let err = check_precommit(maddr(), &sector, &minfo, &api).await.unwrap_err();
        assert!(matches!(err, PreCheckError::BadTicket(_)));
    }

    #[tokio::test]
    async fn precommit_future_ticket() {
        let (api, minfo) = checker_env();
        let mut sector = valid_sector(&api);
        sector.pre.as_mut().unwrap().ticket.epoch = HEAD + 1;
        let err = check_precommit(maddr(), &sector, &minfo, &api).await.unwrap_err();
        assert!(matches!(err, PreCheckError::BadTicket(_)));
    }

    #[tokio::test]
    async fn precommit_expiration_too_soon() {
        let (api, minfo) = checker_env();
        let mut sector = valid_sector(&api);
        sector.pre.as_mut().unwrap().expiration = HEAD + 10;
        let err = check_precommit(maddr(), &sector, &minfo, &api).await.unwrap_err();
        assert!(matches!(err, PreCheckError::ExpirationTooSoon { .. }));
    }

    #[tokio::test]
    async fn precommit_wrong_seal_proof() {
        let (api, minfo) = checker_env();
        let mut sector = valid_sector(&api);
        sector.pre.as_mut().unwrap().seal_proof = RegisteredSealProof::StackedDRG2KiBV1P1;
        let err = check_precommit(maddr(), &sector, &minfo, &api).await.unwrap_err();
        assert!(matches!(err, PreCheckError::BadSealProofType { .. }));
    }

    #[tokio::test]
    async fn precommit_foreign_deal() {
        let (api, minfo) = checker_env();
        let mut sector = valid_sector(&api);
        sector.pre.as_mut().unwrap().deals = vec![7];
        api.put_deal(
            7,
            crate::api::MarketDeal {
                piece_cid: make_piece_cid(b"piece"),
                piece_size: PaddedPieceSize(2048),
                provider: Address::new_id(MINER + 1),
                start_epoch: HEAD + 100,
                end_epoch: HEAD + crate::policy::MIN_SECTOR_LIFETIME,
            },
        );
        let err = check_precommit(maddr(), &sector, &minfo, &api).await.unwrap_err();
        assert!(matches!(err, PreCheckError::DealsInvalid(_)));
    }

    #[tokio::test]
    async fn precommit_sector_allocated() {
        let (api, minfo) = checker_env();
        let sector = valid_sector(&api);
        api.mark_allocated(maddr(), 42);
        let err = check_precommit(maddr(), &sector, &minfo, &api).await.unwrap_err();
        assert!(matches!(err, PreCheckError::SectorAllocated));
    }

    #[tokio::test]
    async fn precommit_already_on_chain() {
        let (api, minfo) = checker_env();
        let sector = valid_sector(&api);
        api.put_precommit_record(maddr(), &sector, HEAD - 50);
        let err = check_precommit(maddr(), &sector, &minfo, &api).await.unwrap_err();
        assert!(matches!(err, PreCheckError::PrecommitOnChain));
    }

    #[tokio::test]
    async fn precommit_on_chain_with_other_ticket_is_bad_ticket() {
        let (api, minfo) = checker_env();
        let mut on_chain = valid_sector(&api);
        on_chain.pre.as_mut().unwrap().ticket.epoch = HEAD - 200;
        api.put_precommit_record(maddr(), &on_chain, HEAD - 50);
        let sector = valid_sector(&api);
        let err = check_precommit(maddr(), &sector, &minfo, &api).await.unwrap_err();
        assert!(matches!(err, PreCheckError::BadTicket(_)));
    }

    fn proven_sector(api: &TestSealingApi) -> SectorState {
        let mut sector = valid_sector(api);
        let pre_commit_epoch = HEAD - 500;
        let seed_epoch = pre_commit_epoch + PRE_COMMIT_CHALLENGE_DELAY;
        api.put_precommit_record(maddr(), &sector, pre_commit_epoch);
        sector.proof = Some(ProofInfo {
            proof: b"porep".to_vec(),
            seed: Seed {
                epoch: seed_epoch,
                seed: beacon_randomness(seed_epoch),
            },
        });
        sector
    }

    #[tokio::test]
    async fn commit_ok() {
        let (api, _) = checker_env();
        let verifier = TestVerifier::default();
        let sector = proven_sector(&api);
        check_commit(maddr(), &sector, b"porep", None, &verifier, &api)
            .await
            .unwrap();
        assert_eq!(verifier.calls(), 1);
    }

    #[tokio::test]
    async fn commit_in_aggregate_skips_verification() {
        let (api, _) = checker_env();
        let verifier = TestVerifier::default();
        let sector = proven_sector(&api);
        check_commit(maddr(), &sector, b"porep", Some(b"porep"), &verifier, &api)
            .await
            .unwrap();
        assert_eq!(verifier.calls(), 0);
    }

    #[tokio::test]
    async fn commit_no_precommit() {
        let (api, _) = checker_env();
        let verifier = TestVerifier::default();
        let mut sector = valid_sector(&api);
        sector.proof = Some(ProofInfo {
            proof: b"porep".to_vec(),
            seed: Seed {
                epoch: HEAD,
                seed: beacon_randomness(HEAD),
            },
        });
        let err = check_commit(maddr(), &sector, b"porep", None, &verifier, &api)
            .await
            .unwrap_err();
        assert!(matches!(err, ProofCheckError::NoPrecommit));
    }

    #[tokio::test]
    async fn commit_allocated_number() {
        let (api, _) = checker_env();
        let verifier = TestVerifier::default();
        let sector = proven_sector(&api);
        api.mark_allocated(maddr(), 42);
        let err = check_commit(maddr(), &sector, b"porep", None, &verifier, &api)
            .await
            .unwrap_err();
        assert!(matches!(err, ProofCheckError::SectorNumberAllocated));
    }

    #[tokio::test]
    async fn commit_bad_seed_epoch() {
        let (api, _) = checker_env();
        let verifier = TestVerifier::default();
        let mut sector = proven_sector(&api);
        sector.proof.as_mut().unwrap().seed.epoch += 1;
        let err = check_commit(maddr(), &sector, b"porep", None, &verifier, &api)
            .await
            .unwrap_err();
        assert!(matches!(err, ProofCheckError::BadSeed(_)));
    }

    #[tokio::test]
    async fn commit_bad_seed_bytes() {
        let (api, _) = checker_env();
        let verifier = TestVerifier::default();
        let mut sector = proven_sector(&api);
        sector.proof.as_mut().unwrap().seed.seed = Randomness(b"forged".to_vec());
        let err = check_commit(maddr(), &sector, b"porep", None, &verifier, &api)
            .await
            .unwrap_err();
        assert!(matches!(err, ProofCheckError::BadSeed(_)));
    }

    #[tokio::test]
    async fn commit_expired_deal() {
        let (api, _) = checker_env();
        let verifier = TestVerifier::default();
        let mut sector = proven_sector(&api);
        sector.pre.as_mut().unwrap().deals = vec![9];
        api.put_deal(
            9,
            crate::api::MarketDeal {
                piece_cid: make_piece_cid(b"piece"),
                piece_size: PaddedPieceSize(2048),
                provider: maddr(),
                start_epoch: HEAD - 1,
                end_epoch: HEAD + crate::policy::MIN_SECTOR_LIFETIME,
            },
        );
        let err = check_commit(maddr(), &sector, b"porep", None, &verifier, &api)
            .await
            .unwrap_err();
        assert!(matches!(err, ProofCheckError::ExpiredDeals(_)));
    }

    #[tokio::test]
    async fn commit_rejected_proof() {
        let (api, _) = checker_env();
        let verifier = TestVerifier::rejecting();
        let sector = proven_sector(&api);
        let err = check_commit(maddr(), &sector, b"porep", None, &verifier, &api)
            .await
            .unwrap_err();
        assert!(matches!(err, ProofCheckError::InvalidProof(_)));
    }
}
