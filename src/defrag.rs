// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! IPv4/IPv6 fragment detection and sharded reassembly.
use std::time::Duration;

use crate::errors::{Error, Result};

pub mod collector;
pub mod collector_mgr;
pub mod detector;
pub mod element;
pub mod group;
pub mod handler;
pub mod layers;
pub mod pcap;
pub mod protocol;
pub mod queue;

#[cfg(test)]
pub(crate) mod testutil;
#[cfg(test)]
mod tests;

pub use collector_mgr::CollectorMgr;
pub use detector::Detector;
pub use element::{ElementPool, FragmentElement};
pub use group::FragmentGroup;
pub use handler::FragmentHandler;
pub use layers::SharedLayers;
pub use protocol::{DetectionInfo, FragmentType, FullPacket, GroupId, PacketView};

#[derive(Debug, Clone)]
pub struct DefragOptions {
    pub pick_types: Vec<FragmentType>,
    pub collector: CollectorOptions,
}

impl Default for DefragOptions {
    fn default() -> Self {
        Self {
            pick_types: FragmentType::ALL.to_vec(),
            collector: CollectorOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectorOptions {
    /// Number of shards, each served by its own task.
    pub collectors: usize,
    pub channel_capacity: usize,
    pub output_queue_max_len: usize,
    pub group_expiry: Duration,
    pub sweep_interval: Duration,
    pub layer_reset_threshold: u32,
    pub layer_reset_interval: Duration,
    pub queue_check_interval: Duration,
    pub queue_trim_grace: Duration,
    pub pool_capacity: usize,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            collectors: 4,
            channel_capacity: 1024,
            output_queue_max_len: 4096,
            group_expiry: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(1),
            layer_reset_threshold: layers::DEFAULT_RESET_THRESHOLD,
            layer_reset_interval: Duration::from_secs(30),
            queue_check_interval: Duration::from_secs(5),
            queue_trim_grace: Duration::from_secs(10),
            pool_capacity: element::DEFAULT_POOL_CAPACITY,
        }
    }
}

impl CollectorOptions {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("collectors", self.collectors),
            ("channel_capacity", self.channel_capacity),
            ("output_queue_max_len", self.output_queue_max_len),
            ("layer_reset_threshold", self.layer_reset_threshold as usize),
            ("pool_capacity", self.pool_capacity),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::InvalidOption(format!("{name} must be greater than 0")));
            }
        }

        let durations = [
            ("group_expiry", self.group_expiry),
            ("sweep_interval", self.sweep_interval),
            ("layer_reset_interval", self.layer_reset_interval),
            ("queue_check_interval", self.queue_check_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(Error::InvalidOption(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}
