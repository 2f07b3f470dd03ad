// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! IPv4/IPv6 fragment reassembly.
//!
//! Frames are handed to a [`Manager`], which picks out fragments, routes them to a
//! sharded set of collector tasks and queues every datagram they complete. Callers
//! drain the queue with [`Manager::pop_full_packets`].
pub mod config;
pub mod constants;
pub mod defrag;
pub mod errors;
pub mod manager;
pub mod metrics;
pub mod util;

use std::path::Path;
use tracing::info;

use crate::config::Config;
use crate::defrag::pcap::{self, ReplayOptions, ReplayReport};
use crate::errors::Result;

pub use crate::defrag::{DefragOptions, FragmentType, FullPacket, GroupId};
pub use crate::manager::{LifecycleState, Manager};

/// Runs a capture file through a freshly started manager built from `config` and shuts it
/// down once the output has settled.
pub async fn replay_capture<P: AsRef<Path>>(
    config: &Config,
    path: P,
    options: &ReplayOptions,
) -> Result<ReplayReport> {
    let manager = Manager::new(config.to_options()?)?;
    manager.start()?;
    let report = pcap::replay(&manager, path, options).await;
    manager.shutdown().await;
    let report = report?;
    info!(
        "replay finished: {} records, {} reassembled, {} incomplete",
        report.records,
        report.reassembled.len(),
        report.incomplete.len()
    );
    Ok(report)
}
