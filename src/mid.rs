// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Deterministic message ids.
//!
//! A message's uid is derived from its canonical bytes so that a submission
//! replayed after a crash resolves to the same id and the push stays
//! idempotent. A single salt byte is prepended and probed upward from zero:
//! if an earlier push landed under a lower salt without the id being
//! persisted locally, probing yields a fresh id instead of colliding with it.

use anyhow::{anyhow, bail, Context, Result};
use cid::multihash::{Code, MultihashDigest};
use cid::Cid;
use fvm_ipld_encoding::{to_vec, RawBytes, IPLD_RAW};
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use fvm_shared::message::Message;
use fvm_shared::{ActorID, MethodNum};
use num_traits::Zero;
use tracing::{debug, info};

use crate::api::{Messager, MsgSpec};

/// CIDv1, raw codec, BLAKE2b-512.
pub fn new_mid_from_bytes(seed: &[u8]) -> Cid {
    Cid::new_v1(IPLD_RAW, Code::Blake2b512.digest(seed))
}

/// Builds the message addressed to miner `mid`, probes for the first unseen
/// salted id and pushes under it. The gas fields are left zero for the
/// messager to estimate within `spec`.
pub async fn push_message(
    msg_client: &dyn Messager,
    from: Address,
    mid: ActorID,
    value: TokenAmount,
    method: MethodNum,
    params: RawBytes,
    spec: &MsgSpec,
) -> Result<Cid> {
    let to = Address::new_id(mid);
    let msg = Message {
        version: 0,
        from,
        to,
        sequence: 0,
        value,
        method_num: method,
        params,
        gas_limit: 0,
        gas_fee_cap: TokenAmount::zero(),
        gas_premium: TokenAmount::zero(),
    };
    let raw = to_vec(&msg).context("encode message")?;

    let mut mcid = None;
    for salt in 0..=u8::MAX {
        let mut seed = Vec::with_capacity(raw.len() + 1);
        seed.push(salt);
        seed.extend_from_slice(&raw);
        let candidate = new_mid_from_bytes(&seed);

        let has = msg_client
            .has_message_by_uid(&candidate.to_string())
            .await?;
        debug!(tried = salt, has, msgid = %candidate, "probed message id");
        if !has {
            mcid = Some(candidate);
            break;
        }
    }
    let mcid = mcid.ok_or_else(|| anyhow!("message id salt space exhausted"))?;

    let uid = msg_client
        .push_message_with_id(&mcid.to_string(), &msg, spec)
        .await
        .context("push message with id")?;
    if uid != mcid.to_string() {
        bail!("messager registered uid {uid} for pushed id {mcid}");
    }

    info!(%from, %to, method, mcid = %uid, "message sent");
    Ok(mcid)
}
