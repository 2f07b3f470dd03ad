// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Supervises the collector shards and keeps the output queue bounded.
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::defrag::collector::Collector;
use crate::defrag::element::{ElementPool, FragmentElement};
use crate::defrag::protocol::{DetectionInfo, FullPacket, GroupId};
use crate::defrag::queue::OutputQueue;
use crate::defrag::CollectorOptions;
use crate::errors::{Error, Result};
use crate::util::shard_index;

pub struct CollectorMgr {
    options: CollectorOptions,
    senders: Vec<mpsc::Sender<Box<FragmentElement>>>,
    idle: Mutex<Vec<Collector>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    output: Arc<OutputQueue>,
    pool: Arc<ElementPool>,
    cancel: CancellationToken,
}

impl CollectorMgr {
    pub fn new(options: CollectorOptions) -> Result<Self> {
        let pool = ElementPool::shared(options.pool_capacity);
        Self::with_pool(options, pool)
    }

    pub fn with_pool(options: CollectorOptions, pool: Arc<ElementPool>) -> Result<Self> {
        options.validate()?;

        let output = Arc::new(OutputQueue::new());
        let cancel = CancellationToken::new();
        let mut senders = Vec::with_capacity(options.collectors);
        let mut idle = Vec::with_capacity(options.collectors);
        for index in 0..options.collectors {
            let (tx, rx) = mpsc::channel(options.channel_capacity);
            senders.push(tx);
            idle.push(Collector::new(
                index,
                rx,
                &options,
                pool.clone(),
                output.clone(),
                cancel.child_token(),
            ));
        }

        Ok(Self {
            options,
            senders,
            idle: Mutex::new(idle),
            tasks: Mutex::new(Vec::new()),
            output,
            pool,
            cancel,
        })
    }

    pub fn options(&self) -> &CollectorOptions {
        &self.options
    }

    pub fn shards(&self) -> usize {
        self.senders.len()
    }

    pub fn output(&self) -> &Arc<OutputQueue> {
        &self.output
    }

    /// Spawns one task per collector plus the output queue valve on the current runtime.
    pub fn start(&self) -> Result<()> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Runtime(format!("collectors need a tokio runtime: {e}")))?;
        let idle = mem::take(&mut *lock(&self.idle));
        if idle.is_empty() {
            return Ok(());
        }

        let mut tasks = lock(&self.tasks);
        for collector in idle {
            tasks.push(handle.spawn(collector.run()));
        }
        tasks.push(handle.spawn(run_output_valve(
            self.output.clone(),
            self.options.output_queue_max_len,
            self.options.queue_check_interval,
            self.options.queue_trim_grace,
            self.cancel.child_token(),
        )));
        info!("started {} collectors", self.senders.len());
        Ok(())
    }

    /// Signals every task to exit. Does not wait.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Waits for every task spawned by [`start`](Self::start) to finish.
    pub async fn join(&self) {
        let tasks = mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                warn!("collector task failed: {e}");
            }
        }
        // collectors that were never started still hold their channel
        for mut collector in mem::take(&mut *lock(&self.idle)) {
            collector.release_all();
        }
    }

    fn prepare(
        &self,
        group_id: GroupId,
        info: &DetectionInfo<'_>,
        mark: u64,
    ) -> Option<(usize, Box<FragmentElement>)> {
        let mut elem = self.pool.acquire();
        if !elem.fill(group_id, info, mark) {
            self.pool.release(elem);
            return None;
        }
        Some((shard_index(&group_id, self.senders.len()), elem))
    }

    /// Copies the detected fragment into a pooled element and queues it on its shard.
    /// Waits while that shard's channel is full.
    pub async fn collect(
        &self,
        group_id: GroupId,
        info: &DetectionInfo<'_>,
        mark: u64,
    ) -> Result<()> {
        let Some((shard, elem)) = self.prepare(group_id, info, mark) else {
            return Ok(());
        };
        self.senders[shard]
            .send(elem)
            .await
            .map_err(|mpsc::error::SendError(elem)| {
                self.pool.release(elem);
                Error::Runtime(format!("collector {shard} is closed"))
            })
    }

    /// Same as [`collect`](Self::collect) for callers outside the runtime. Panics if
    /// called from within an async context.
    pub fn blocking_collect(
        &self,
        group_id: GroupId,
        info: &DetectionInfo<'_>,
        mark: u64,
    ) -> Result<()> {
        let Some((shard, elem)) = self.prepare(group_id, info, mark) else {
            return Ok(());
        };
        self.senders[shard]
            .blocking_send(elem)
            .map_err(|mpsc::error::SendError(elem)| {
                self.pool.release(elem);
                Error::Runtime(format!("collector {shard} is closed"))
            })
    }

    pub fn pop_full_packets(&self, count: usize) -> Vec<FullPacket> {
        self.output.pop(count)
    }
}

impl Drop for CollectorMgr {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Trims the output queue when the consumer falls behind. Once the queue is over
/// `max_len`, the consumer gets `grace` to catch up before twice the remaining excess
/// is dropped from the head.
async fn run_output_valve(
    output: Arc<OutputQueue>,
    max_len: usize,
    check_interval: Duration,
    grace: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + check_interval, check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let observed = output.len();
                if observed <= max_len {
                    continue;
                }
                warn!("output queue holds {observed} packets, limit is {max_len}");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = sleep(grace) => {}
                }
                let len = output.len();
                if len <= max_len {
                    debug!("output queue drained to {len} during grace period");
                    continue;
                }
                let excess = len - max_len;
                let dropped = output.trim(excess.saturating_mul(2));
                warn!(
                    "trimmed {dropped} packets from the output queue, {} remain",
                    output.len()
                );
            }
        }
    }
}
