// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Per-(miner, stage) batching worker. Admitted sectors accumulate in a
//! pending list until the batch is dispatched: immediately once `max_batch`
//! is reached, on the `batch_wait` timer once `min_batch` is met, or when the
//! oldest pending sector has waited `max_wait`. Exactly one dispatch runs at
//! a time; on shutdown the in-flight dispatch finishes and whatever is still
//! pending is left for the restart scan to rediscover.

use std::sync::Arc;

use futures::future;
use fvm_shared::address::Address;
use fvm_shared::ActorID;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, Instrument};

use crate::config::StageConfig;
use crate::processor::Processor;
use crate::types::SectorState;

const INBOUND_QUEUE_SIZE: usize = 256;

pub struct Batcher {
    inbound: flume::Sender<SectorState>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Batcher {
    pub fn new(
        mid: ActorID,
        sender: Address,
        cfg: StageConfig,
        processor: Arc<dyn Processor>,
        stop: CancellationToken,
    ) -> Self {
        let (tx, rx) = flume::bounded(INBOUND_QUEUE_SIZE);
        let span = info_span!("batcher", miner = mid, stage = %processor.stage());
        let worker = BatcherLoop {
            mid,
            sender,
            cfg,
            processor,
            rx,
            stop,
            pending: Vec::new(),
            deadline: None,
        };
        let handle = tokio::spawn(worker.run().instrument(span));
        Batcher {
            inbound: tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub async fn add(&self, sector: SectorState) {
        if self.inbound.send_async(sector).await.is_err() {
            debug!("batcher inbound channel closed");
        }
    }

    /// Waits for the worker to finish its in-flight dispatch and exit.
    pub async fn wait_stop(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

struct PendingSector {
    sector: SectorState,
    arrival: Instant,
}

struct BatcherLoop {
    mid: ActorID,
    sender: Address,
    cfg: StageConfig,
    processor: Arc<dyn Processor>,
    rx: flume::Receiver<SectorState>,
    stop: CancellationToken,
    pending: Vec<PendingSector>,
    deadline: Option<Instant>,
}

impl BatcherLoop {
    async fn run(mut self) {
        debug!("batcher start");
        let rx = self.rx.clone();
        let stop = self.stop.clone();
        loop {
            let deadline = self.deadline;
            let timer = async move {
                match deadline {
                    Some(d) => sleep_until(d).await,
                    None => future::pending().await,
                }
            };

            tokio::select! {
                _ = stop.cancelled() => break,
                recv = rx.recv_async() => match recv {
                    Ok(sector) => self.on_arrival(sector).await,
                    Err(_) => break,
                },
                _ = timer => self.on_timer().await,
            }
        }
        debug!(pending = self.pending.len(), "batcher stop");
    }

    async fn on_arrival(&mut self, sector: SectorState) {
        let now = Instant::now();
        self.pending.push(PendingSector {
            sector,
            arrival: now,
        });
        if self.pending.len() >= self.cfg.max_batch {
            self.dispatch().await;
        } else {
            // an already-due deadline fires straight into the min_batch /
            // max_wait decision
            let earliest = self.pending.first().map(|p| p.arrival).unwrap_or(now);
            self.deadline = Some(earliest + self.cfg.batch_wait);
        }
    }

    async fn on_timer(&mut self) {
        self.deadline = None;
        let oldest = match self.pending.first() {
            Some(p) => p.arrival,
            None => return,
        };
        if self.pending.len() >= self.cfg.min_batch || oldest.elapsed() >= self.cfg.max_wait {
            self.dispatch().await;
        } else {
            self.deadline = Some(oldest + self.cfg.max_wait);
        }
    }

    async fn dispatch(&mut self) {
        self.deadline = None;
        if self.pending.is_empty() {
            return;
        }
        let batch: Vec<SectorState> = self.pending.drain(..).map(|p| p.sector).collect();
        debug!(count = batch.len(), "dispatching batch");
        if let Err(e) = self
            .processor
            .process(batch, self.mid, self.sender)
            .await
        {
            error!(error = %e, "batch dispatch failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SectorID, Stage};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Records every dispatched batch.
    #[derive(Default)]
    struct RecordingProcessor {
        batches: Mutex<Vec<Vec<u64>>>,
    }

    impl RecordingProcessor {
        fn batches(&self) -> Vec<Vec<u64>> {
            self.batches.lock().clone()
        }
    }

    #[async_trait]
    impl Processor for RecordingProcessor {
        fn stage(&self) -> Stage {
            Stage::PreCommit
        }

        async fn process(
            &self,
            sectors: Vec<SectorState>,
            _mid: ActorID,
            _sender: Address,
        ) -> Result<()> {
            self.batches
                .lock()
                .push(sectors.iter().map(|s| s.id.number).collect());
            Ok(())
        }
    }

    fn sector(number: u64) -> SectorState {
        SectorState::new(SectorID {
            miner: 1000,
            number,
        })
    }

    fn config(min_batch: usize, max_batch: usize) -> StageConfig {
        let mut cfg = crate::config::MinerCommitConfig::default().pre;
        cfg.batch_wait = Duration::from_secs(10);
        cfg.max_wait = Duration::from_secs(60);
        cfg.min_batch = min_batch;
        cfg.max_batch = max_batch;
        cfg
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_dispatches_immediately() {
        let processor = Arc::new(RecordingProcessor::default());
        let stop = CancellationToken::new();
        let batcher = Batcher::new(
            1000,
            Address::new_id(1),
            config(1, 3),
            processor.clone(),
            stop.clone(),
        );

        for n in 0..3 {
            batcher.add(sector(n)).await;
        }
        // no timer needed, the batch is full
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(processor.batches(), vec![vec![0, 1, 2]]);

        stop.cancel();
        batcher.wait_stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn batch_wait_timer_fires_dispatch() {
        let processor = Arc::new(RecordingProcessor::default());
        let stop = CancellationToken::new();
        let batcher = Batcher::new(
            1000,
            Address::new_id(1),
            config(1, 100),
            processor.clone(),
            stop.clone(),
        );

        batcher.add(sector(7)).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(processor.batches().is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(processor.batches(), vec![vec![7]]);

        stop.cancel();
        batcher.wait_stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn undersized_batch_waits_for_max_wait() {
        let processor = Arc::new(RecordingProcessor::default());
        let stop = CancellationToken::new();
        let batcher = Batcher::new(
            1000,
            Address::new_id(1),
            config(5, 100),
            processor.clone(),
            stop.clone(),
        );

        batcher.add(sector(1)).await;
        batcher.add(sector(2)).await;
        // batch_wait passes but min_batch is not met
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(processor.batches().is_empty());

        // max_wait forces the undersized batch out
        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(processor.batches(), vec![vec![1, 2]]);

        stop.cancel();
        batcher.wait_stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_does_not_drain_pending() {
        let processor = Arc::new(RecordingProcessor::default());
        let stop = CancellationToken::new();
        let batcher = Batcher::new(
            1000,
            Address::new_id(1),
            config(1, 100),
            processor.clone(),
            stop.clone(),
        );

        batcher.add(sector(1)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        stop.cancel();
        batcher.wait_stop().await;
        assert!(processor.batches().is_empty());
    }
}
