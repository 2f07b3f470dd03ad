// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! One shard of the reassembly engine.
//!
//! A collector task owns its group map and header templates outright. Everything that
//! mutates them happens inside [`Collector::run`], so no locking is needed on the hot path.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::defrag::element::{ElementPool, FragmentElement};
use crate::defrag::group::{FragmentGroup, Insertion};
use crate::defrag::handler::Reassembled;
use crate::defrag::layers::SharedLayers;
use crate::defrag::protocol::{FullPacket, GroupId};
use crate::defrag::queue::OutputQueue;
use crate::defrag::CollectorOptions;
use crate::metrics;

pub struct Collector {
    index: usize,
    shard_label: String,
    rx: mpsc::Receiver<Box<FragmentElement>>,
    groups: HashMap<GroupId, FragmentGroup>,
    layers: SharedLayers,
    pool: Arc<ElementPool>,
    output: Arc<OutputQueue>,
    group_expiry: Duration,
    sweep_interval: Duration,
    layer_reset_interval: Duration,
    cancel: CancellationToken,
}

impl Collector {
    pub fn new(
        index: usize,
        rx: mpsc::Receiver<Box<FragmentElement>>,
        options: &CollectorOptions,
        pool: Arc<ElementPool>,
        output: Arc<OutputQueue>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            index,
            shard_label: index.to_string(),
            rx,
            groups: HashMap::new(),
            layers: SharedLayers::new(options.layer_reset_threshold),
            pool,
            output,
            group_expiry: options.group_expiry,
            sweep_interval: options.sweep_interval,
            layer_reset_interval: options.layer_reset_interval,
            cancel,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn active_groups(&self) -> usize {
        self.groups.len()
    }

    pub async fn run(mut self) {
        let start = Instant::now();
        let mut sweep = interval_at(start + self.sweep_interval, self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reset = interval_at(
            start + self.layer_reset_interval,
            self.layer_reset_interval,
        );
        reset.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!("collector {} running", self.index);
        loop {
            // due ticks win over a channel that never drains
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = sweep.tick() => {
                    self.sweep(Instant::now());
                }
                _ = reset.tick() => {
                    if self.layers.reset_if_used() {
                        trace!("collector {} reset shared layers", self.index);
                    }
                }
                received = self.rx.recv() => match received {
                    Some(elem) => self.process(elem),
                    None => break,
                },
            }
        }

        let abandoned = self.release_all();
        debug!(
            "collector {} stopped, released {} incomplete groups",
            self.index, abandoned
        );
    }

    /// Inserts one element and reassembles its group if that completed it.
    pub fn process(&mut self, elem: Box<FragmentElement>) {
        let id = elem.group_id;
        let mark = elem.mark;
        let frag_type = elem.frag_type;

        let group = self.groups.entry(id).or_insert_with(|| {
            metrics::GROUPS_CREATED.inc();
            trace!("new {} group {}", frag_type, id);
            FragmentGroup::new(id, frag_type)
        });
        match frag_type.handler().collect(elem, group) {
            Insertion::Inserted => metrics::FRAGMENTS_ACCEPTED.inc(),
            Insertion::Duplicate(dup) => {
                metrics::FRAGMENTS_DUPLICATE.inc();
                debug!(
                    "group {}: dropped duplicate fragment at offset {}",
                    id,
                    dup.byte_offset()
                );
                self.pool.release(dup);
                return;
            }
        }

        if group.is_complete() {
            if let Some(group) = self.groups.remove(&id) {
                self.finish(group, mark);
            }
        }
        self.update_gauge();
    }

    fn finish(&mut self, group: FragmentGroup, mark: u64) {
        let timer = metrics::REASSEMBLY_DURATION.start_timer();
        let result = group
            .frag_type()
            .handler()
            .reassemble(&group, &mut self.layers);
        timer.observe_duration();

        match result {
            Ok(Reassembled { data, view }) => {
                metrics::GROUPS_COMPLETED.inc();
                trace!(
                    "group {} reassembled from {} fragments into {} bytes",
                    group.id(),
                    group.len(),
                    data.len()
                );
                self.output.push(FullPacket {
                    mark,
                    group_id: *group.id(),
                    data,
                    view,
                });
            }
            Err(e) => {
                metrics::REASSEMBLY_ERRORS
                    .with_label_values(&[e.kind()])
                    .inc();
                warn!("collector {}: group {}: {}", self.index, group.id(), e);
            }
        }

        self.layers.note_use();
        group.release(&self.pool);
    }

    /// Releases groups older than the configured expiry. Returns how many were dropped.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let max_age = self.group_expiry;
        let expired: Vec<GroupId> = self
            .groups
            .iter()
            .filter(|(_, group)| group.is_expired(now, max_age))
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(group) = self.groups.remove(id) {
                debug!(
                    "group {} expired with {} of {} bytes",
                    id,
                    group.current_total_len(),
                    group.highest_offset_seen()
                );
                group.release(&self.pool);
            }
        }
        if !expired.is_empty() {
            metrics::GROUPS_EXPIRED.inc_by(expired.len() as f64);
            self.update_gauge();
        }
        expired.len()
    }

    /// Recycles every outstanding group and anything still queued on the channel.
    pub(crate) fn release_all(&mut self) -> usize {
        let abandoned = self.groups.len();
        for (_, group) in self.groups.drain() {
            group.release(&self.pool);
        }
        self.rx.close();
        while let Ok(elem) = self.rx.try_recv() {
            self.pool.release(elem);
        }
        metrics::GROUPS_ABANDONED.inc_by(abandoned as f64);
        self.update_gauge();
        abandoned
    }

    fn update_gauge(&self) {
        metrics::ACTIVE_GROUPS
            .with_label_values(&[&self.shard_label])
            .set(self.groups.len() as f64);
    }
}
