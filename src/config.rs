// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::time::Duration;

use ahash::HashMap;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::ActorID;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::policy::EPOCHS_IN_DAY;

const DEFAULT_BATCH_WAIT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(600);
const DEFAULT_MAX_PRE_BATCH: usize = 256;
const DEFAULT_MAX_PROVE_BATCH: usize = 819;
const DEFAULT_MIN_AGGREGATE: usize = 4;
const DEFAULT_CONFIDENCE: i64 = 10;
const DEFAULT_GAS_OVER_ESTIMATION: f64 = 1.2;

/// Fee parameters forwarded to the messager with every push. The messager
/// owns gas estimation; these only bound it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeePolicy {
    pub gas_over_estimation: f64,
    pub gas_over_premium: f64,
    pub max_fee: Option<TokenAmount>,
}

impl Default for FeePolicy {
    fn default() -> Self {
        FeePolicy {
            gas_over_estimation: DEFAULT_GAS_OVER_ESTIMATION,
            gas_over_premium: 0.0,
            max_fee: None,
        }
    }
}

/// Batching and dispatch policy for one commitment stage of one miner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Account the messages of this stage are sent from. Submissions for a
    /// miner without a configured sender are refused.
    pub sender: Option<Address>,
    /// How long a freshly arrived sector may sit before its batch is
    /// considered for dispatch.
    pub batch_wait: Duration,
    /// Hard age bound: once the oldest pending sector has waited this long
    /// the batch goes out regardless of size.
    pub max_wait: Duration,
    pub min_batch: usize,
    pub max_batch: usize,
    /// Smallest compatible group worth a batched/aggregated message; smaller
    /// groups are sent as individual messages.
    pub min_aggregate: usize,
    pub enable_aggregate: bool,
    /// Attach the pre-commit deposit to the message. Ignored for
    /// prove-commits, which carry no value.
    pub send_fund: bool,
    /// Pre-commits whose expirations differ by more than this are not packed
    /// into the same batch message.
    pub expiry_slack: ChainEpoch,
    pub fee: FeePolicy,
}

impl StageConfig {
    fn default_pre() -> Self {
        StageConfig {
            sender: None,
            batch_wait: DEFAULT_BATCH_WAIT,
            max_wait: DEFAULT_MAX_WAIT,
            min_batch: 1,
            max_batch: DEFAULT_MAX_PRE_BATCH,
            min_aggregate: DEFAULT_MIN_AGGREGATE,
            enable_aggregate: true,
            send_fund: true,
            expiry_slack: EPOCHS_IN_DAY,
            fee: FeePolicy::default(),
        }
    }

    fn default_prove() -> Self {
        StageConfig {
            max_batch: DEFAULT_MAX_PROVE_BATCH,
            send_fund: false,
            ..Self::default_pre()
        }
    }
}

/// Commitment policy of a single miner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerCommitConfig {
    pub pre: StageConfig,
    pub prove: StageConfig,
    /// Epochs past inclusion before a landed message is considered final.
    pub confidence: i64,
}

impl Default for MinerCommitConfig {
    fn default() -> Self {
        MinerCommitConfig {
            pre: StageConfig::default_pre(),
            prove: StageConfig::default_prove(),
            confidence: DEFAULT_CONFIDENCE,
        }
    }
}

/// Per-miner commitment policy table with a fallback default, safe to share
/// across the dispatch loops.
#[derive(Debug, Default)]
pub struct CommitmentConfig {
    default: MinerCommitConfig,
    miners: RwLock<HashMap<ActorID, MinerCommitConfig>>,
}

impl CommitmentConfig {
    pub fn new(default: MinerCommitConfig) -> Self {
        CommitmentConfig {
            default,
            miners: RwLock::new(HashMap::default()),
        }
    }

    pub fn set_miner(&self, mid: ActorID, cfg: MinerCommitConfig) {
        self.miners.write().insert(mid, cfg);
    }

    /// The policy for `mid`, falling back to the default when the miner has
    /// no dedicated entry.
    pub fn miner_config(&self, mid: ActorID) -> MinerCommitConfig {
        self.miners
            .read()
            .get(&mid)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}
