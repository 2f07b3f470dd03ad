// SPDX-License-Identifier: BSD-3-Clause-LBNL
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::defrag::protocol::FullPacket;
use crate::metrics;

/// FIFO of reassembled packets shared by every collector and the consumer.
#[derive(Debug, Default)]
pub struct OutputQueue {
    inner: Mutex<VecDeque<FullPacket>>,
}

impl OutputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<FullPacket>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, packet: FullPacket) {
        let mut queue = self.lock();
        queue.push_back(packet);
        metrics::FULL_PACKETS_PUSHED.inc();
        metrics::OUTPUT_QUEUE_LENGTH.set(queue.len() as f64);
    }

    /// Removes up to `max` of the oldest packets.
    pub fn pop(&self, max: usize) -> Vec<FullPacket> {
        let mut queue = self.lock();
        let n = max.min(queue.len());
        let out: Vec<FullPacket> = queue.drain(..n).collect();
        metrics::FULL_PACKETS_POPPED.inc_by(out.len() as f64);
        metrics::OUTPUT_QUEUE_LENGTH.set(queue.len() as f64);
        out
    }

    /// Discards up to `count` of the oldest packets, releasing their bytes. Returns how many were dropped.
    pub fn trim(&self, count: usize) -> usize {
        let mut dropped: Vec<FullPacket> = {
            let mut queue = self.lock();
            let n = count.min(queue.len());
            let dropped = queue.drain(..n).collect();
            metrics::OUTPUT_QUEUE_LENGTH.set(queue.len() as f64);
            dropped
        };
        for packet in dropped.iter_mut() {
            packet.release();
        }
        metrics::FULL_PACKETS_TRIMMED.inc_by(dropped.len() as f64);
        dropped.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drops everything without counting it as trimmed.
    pub fn clear(&self) {
        let mut queue = self.lock();
        queue.clear();
        metrics::OUTPUT_QUEUE_LENGTH.set(0.0);
    }
}
