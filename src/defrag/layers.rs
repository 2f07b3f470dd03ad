// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Per-collector header templates and scratch buffer reused across reassemblies.
use tokio::time::Instant;
use zerocopy::FromZeros;

use crate::constants::{DEFAULT_IPV4_TTL, DEFAULT_IPV6_HOP_LIMIT, ETH_IPV6_HEADER_SIZE};
use crate::defrag::protocol::{EthernetHeader, Ipv4Header, Ipv6Header};
use crate::metrics;

pub const DEFAULT_RESET_THRESHOLD: u32 = 100;

/// Owned by exactly one collector, so nothing here is shared between tasks.
#[derive(Debug)]
pub struct SharedLayers {
    pub(crate) eth: EthernetHeader,
    pub(crate) ipv4: Ipv4Header,
    pub(crate) ipv6: Ipv6Header,
    pub(crate) scratch: Vec<u8>,
    references: u32,
    last_used: Option<Instant>,
    reset_threshold: u32,
}

impl SharedLayers {
    pub fn new(reset_threshold: u32) -> Self {
        let mut layers = Self {
            eth: EthernetHeader::new_zeroed(),
            ipv4: Ipv4Header::new_zeroed(),
            ipv6: Ipv6Header::new_zeroed(),
            scratch: Vec::with_capacity(ETH_IPV6_HEADER_SIZE),
            references: 0,
            last_used: None,
            reset_threshold: reset_threshold.max(1),
        };
        layers.reset_templates();
        layers
    }

    fn reset_templates(&mut self) {
        self.eth = EthernetHeader::new_zeroed();
        self.ipv4 = Ipv4Header::new_zeroed();
        self.ipv4.version_ihl = 0x45;
        self.ipv4.ttl = DEFAULT_IPV4_TTL;
        self.ipv6 = Ipv6Header::new_zeroed();
        self.ipv6.set_version_traffic_flow(0, 0);
        self.ipv6.hop_limit = DEFAULT_IPV6_HOP_LIMIT;
    }

    pub fn references(&self) -> u32 {
        self.references
    }

    pub fn last_used(&self) -> Option<Instant> {
        self.last_used
    }

    /// Records one finished reassembly. Every `reset_threshold` uses the layers are reset.
    /// Returns true when a reset happened.
    pub fn note_use(&mut self) -> bool {
        self.last_used = Some(Instant::now());
        self.references += 1;
        if self.references >= self.reset_threshold {
            self.reset();
            return true;
        }
        false
    }

    /// Restores the templates to defaults, drops the scratch buffer and zeroes the counter.
    pub fn reset(&mut self) {
        metrics::LAYER_RESETS.inc();
        self.reset_templates();
        self.scratch = Vec::with_capacity(ETH_IPV6_HEADER_SIZE);
        self.references = 0;
    }

    /// Periodic variant of [`reset`](Self::reset): only resets layers that were used since the last one.
    pub fn reset_if_used(&mut self) -> bool {
        if self.references == 0 {
            return false;
        }
        self.reset();
        true
    }
}

impl Default for SharedLayers {
    fn default() -> Self {
        Self::new(DEFAULT_RESET_THRESHOLD)
    }
}
