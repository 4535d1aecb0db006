// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Per-miner dispatch policy. A processor takes the batch a
//! [`Batcher`](crate::batcher::Batcher) accumulated, rechecks it against
//! chain state, splits it into compatible groups, decides between individual
//! and aggregated messages and pushes them, recording the resulting message
//! id on every participating sector.

mod commit;
mod precommit;

pub use commit::CommitProcessor;
pub use precommit::PreCommitProcessor;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::ActorID;
use itertools::Itertools;
use tracing::{error, info};

use crate::api::{SectorStateStore, SectorUpdate};
use crate::miner_actor::SectorPreCommitInfo;
use crate::types::{PreCommitInfo, ProofInfo, SectorState, Stage};

/// Builds and dispatches the messages for one accumulated batch. Exactly one
/// `process` call runs at a time per batcher.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    fn stage(&self) -> Stage;

    /// On success every sector of the batch either carries a persisted
    /// message id with `need_send` lowered, or was dropped at the recheck and
    /// keeps `need_send` raised for recovery to resolve.
    async fn process(&self, sectors: Vec<SectorState>, mid: ActorID, sender: Address)
        -> Result<()>;
}

pub(crate) fn pre_info(s: &SectorState) -> Result<&PreCommitInfo> {
    s.pre
        .as_ref()
        .ok_or_else(|| anyhow!("sector {} has no pre-commit info", s.id.number))
}

pub(crate) fn proof_info(s: &SectorState) -> Result<&ProofInfo> {
    s.proof
        .as_ref()
        .ok_or_else(|| anyhow!("sector {} has no proof info", s.id.number))
}

pub(crate) fn precommit_params(s: &SectorState) -> Result<SectorPreCommitInfo> {
    let pre = pre_info(s)?;
    Ok(SectorPreCommitInfo {
        seal_proof: pre.seal_proof,
        sector_number: s.id.number,
        sealed_cid: pre.comm_r,
        seal_rand_epoch: pre.ticket.epoch,
        deal_ids: pre.deals.clone(),
        expiration: pre.expiration,
        replace_capacity: false,
        replace_sector_deadline: 0,
        replace_sector_partition: 0,
        replace_sector_number: 0,
    })
}

/// Splits pre-commits into maximal groups a single batch message may carry:
/// uniform proof type, expirations within the same `slack`-sized window.
pub(crate) fn partition_precommits(
    sectors: Vec<SectorState>,
    slack: ChainEpoch,
) -> Vec<Vec<SectorState>> {
    let slack = slack.max(1);
    let mut groups: Vec<((i64, ChainEpoch), Vec<SectorState>)> = sectors
        .into_iter()
        .into_group_map_by(|s| match s.pre.as_ref() {
            Some(pre) => (i64::from(pre.seal_proof), pre.expiration / slack),
            None => (i64::MIN, 0),
        })
        .into_iter()
        .collect();
    groups.sort_by_key(|(k, _)| *k);
    groups.into_iter().map(|(_, g)| g).collect()
}

/// Splits prove-commits into aggregation-compatible groups: uniform proof
/// type.
pub(crate) fn partition_commits(sectors: Vec<SectorState>) -> Vec<Vec<SectorState>> {
    let mut groups: Vec<(i64, Vec<SectorState>)> = sectors
        .into_iter()
        .into_group_map_by(|s| {
            s.pre
                .as_ref()
                .map(|pre| i64::from(pre.seal_proof))
                .unwrap_or(i64::MIN)
        })
        .into_iter()
        .collect();
    groups.sort_by_key(|(k, _)| *k);
    groups.into_iter().map(|(_, g)| g).collect()
}

/// Records `mcid` against every sector of a dispatched message and lowers
/// `need_send`, atomically per sector through the store.
pub(crate) async fn persist_message_ids(
    store: &dyn SectorStateStore,
    stage: Stage,
    sectors: &mut [SectorState],
    mcid: Cid,
) {
    let mut numbers = Vec::with_capacity(sectors.len());
    for s in sectors.iter_mut() {
        numbers.push(s.id.number);
        match stage {
            Stage::PreCommit => s.message_info.pre_commit_cid = Some(mcid),
            Stage::ProveCommit => s.message_info.commit_cid = Some(mcid),
        }
        s.message_info.need_send = false;
        if let Err(e) = store
            .update(s.id.clone(), SectorUpdate::message_info(s.message_info.clone()))
            .await
        {
            error!(sector = s.id.number, error = %e, "update sector message info");
        }
    }
    info!(stage = %stage, sectors = ?numbers, mcid = %mcid, "sectors dispatched");
}
