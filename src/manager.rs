// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Entry point for callers: one detector in front of the collector shards.
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{debug, info};

use crate::defrag::{CollectorMgr, DefragOptions, DetectionInfo, Detector, FullPacket, GroupId};
use crate::errors::{Error, Result};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LifecycleState {
    Uninitialized = 0,
    Initialized = 1,
    Started = 2,
    Stopped = 3,
}

impl From<u8> for LifecycleState {
    fn from(value: u8) -> Self {
        match value {
            1 => LifecycleState::Initialized,
            2 => LifecycleState::Started,
            3 => LifecycleState::Stopped,
            _ => LifecycleState::Uninitialized,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Started => "started",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

pub struct Manager {
    detector: Detector,
    collectors: CollectorMgr,
    state: AtomicU8,
}

impl Manager {
    pub fn new(options: DefragOptions) -> Result<Self> {
        let detector = Detector::new(options.pick_types.iter().copied())?;
        let collectors = CollectorMgr::new(options.collector)?;
        Ok(Self {
            detector,
            collectors,
            state: AtomicU8::new(LifecycleState::Initialized as u8),
        })
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn ensure_started(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Started => Ok(()),
            other => Err(Error::NotStarted(other)),
        }
    }

    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    pub fn collectors(&self) -> &CollectorMgr {
        &self.collectors
    }

    /// Spawns the collector tasks. Must be called from within a tokio runtime.
    /// Calling it again, or after [`stop`](Self::stop), does nothing.
    pub fn start(&self) -> Result<()> {
        if !self.transition(LifecycleState::Initialized, LifecycleState::Started) {
            debug!("start ignored in state {}", self.state());
            return Ok(());
        }
        if let Err(e) = self.collectors.start() {
            self.transition(LifecycleState::Started, LifecycleState::Initialized);
            return Err(e);
        }
        metrics::init_metrics(self.collectors.shards());
        info!(
            "defrag manager started with {} collectors",
            self.collectors.shards()
        );
        Ok(())
    }

    /// Signals the collectors to release their groups and exit. Only acts when started.
    pub fn stop(&self) {
        if !self.transition(LifecycleState::Started, LifecycleState::Stopped) {
            debug!("stop ignored in state {}", self.state());
            return;
        }
        self.collectors.stop();
        info!("defrag manager stopping");
    }

    /// [`stop`](Self::stop), then wait for every collector to finish releasing.
    pub async fn shutdown(&self) {
        self.stop();
        self.collectors.join().await;
        info!("defrag manager shut down");
    }

    pub async fn process_packet(&self, frame: &[u8], mark: u64) -> Result<()> {
        self.process_packet_with(frame, mark, |_| {}).await
    }

    /// Like [`process_packet`](Self::process_packet), calling `on_detect` with the group id
    /// of every frame found to be a fragment.
    pub async fn process_packet_with<F>(
        &self,
        frame: &[u8],
        mark: u64,
        on_detect: F,
    ) -> Result<()>
    where
        F: FnOnce(&GroupId),
    {
        let mut info = DetectionInfo::default();
        let Some(group_id) = self.detect(frame, &mut info)? else {
            return Ok(());
        };
        on_detect(&group_id);
        self.collectors.collect(group_id, &info, mark).await
    }

    /// Blocking variant of [`process_packet`](Self::process_packet) for threads outside the runtime.
    pub fn blocking_process_packet(&self, frame: &[u8], mark: u64) -> Result<()> {
        let mut info = DetectionInfo::default();
        let Some(group_id) = self.detect(frame, &mut info)? else {
            return Ok(());
        };
        self.collectors.blocking_collect(group_id, &info, mark)
    }

    fn detect<'a>(
        &self,
        frame: &'a [u8],
        info: &mut DetectionInfo<'a>,
    ) -> Result<Option<GroupId>> {
        self.ensure_started()?;
        metrics::PACKETS_RECEIVED.inc();
        self.detector.fast_detect(frame, info)?;
        Ok(info.group_id())
    }

    /// Up to `max` reassembled packets, oldest first.
    pub fn pop_full_packets(&self, max: usize) -> Result<Vec<FullPacket>> {
        self.ensure_started()?;
        Ok(self.collectors.pop_full_packets(max))
    }

    pub fn pending_full_packets(&self) -> usize {
        self.collectors.output().len()
    }
}
