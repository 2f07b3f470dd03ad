// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Pooled per-fragment records.
//!
//! Elements are handed out by a process-wide [`ElementPool`] when a fragment is collected,
//! owned by exactly one `FragmentGroup` while it waits for its siblings, and given back when
//! that group is released. Release takes the element by value, so it cannot happen twice.
use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;
use std::sync::{Arc, OnceLock};

use crate::constants::FRAGMENT_OFFSET_UNIT;
use crate::defrag::protocol::{DetectionInfo, FragmentType, GroupId, HeaderSnapshot};
use crate::metrics;

pub const DEFAULT_POOL_CAPACITY: usize = 4096;
const INITIAL_PAYLOAD_CAPACITY: usize = 1500;

#[derive(Debug)]
pub struct FragmentElement {
    pub group_id: GroupId,
    pub frag_type: FragmentType,
    pub mark: u64,
    /// Only set on the terminal fragment.
    pub terminal: Option<HeaderSnapshot>,
    pub ip_protocol: u8,
    /// In 8-byte units.
    pub frag_offset: u16,
    pub more_frags: bool,
    pub identification: u32,
    pub payload: BytesMut,
}

impl FragmentElement {
    fn blank() -> Self {
        FragmentElement {
            group_id: GroupId::default(),
            frag_type: FragmentType::Ipv4,
            mark: 0,
            terminal: None,
            ip_protocol: 0,
            frag_offset: 0,
            more_frags: false,
            identification: 0,
            payload: BytesMut::with_capacity(INITIAL_PAYLOAD_CAPACITY),
        }
    }

    /// Copies everything the collector needs out of the borrowed detection result.
    /// Returns false when `info` does not describe a fragment.
    pub fn fill(&mut self, group_id: GroupId, info: &DetectionInfo<'_>, mark: u64) -> bool {
        let Some(frag_type) = info.frag_type else {
            return false;
        };
        self.group_id = group_id;
        self.frag_type = frag_type;
        self.mark = mark;
        self.terminal = if info.more_frags { None } else { info.terminal };
        self.ip_protocol = info.ip_protocol;
        self.frag_offset = info.frag_offset;
        self.more_frags = info.more_frags;
        self.identification = info.identification;
        self.payload.clear();
        self.payload.extend_from_slice(info.ip_payload);
        true
    }

    pub fn byte_offset(&self) -> usize {
        self.frag_offset as usize * FRAGMENT_OFFSET_UNIT
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// One past the last payload byte, relative to the start of the original datagram.
    pub fn end(&self) -> usize {
        self.byte_offset() + self.len()
    }

    pub fn is_terminal(&self) -> bool {
        !self.more_frags
    }

    fn clear(&mut self) {
        self.group_id = GroupId::default();
        self.mark = 0;
        self.terminal = None;
        self.ip_protocol = 0;
        self.frag_offset = 0;
        self.more_frags = false;
        self.identification = 0;
        self.payload.clear();
    }
}

/// Bounded lock-free freelist of fragment elements shared by every collector.
pub struct ElementPool {
    free: ArrayQueue<Box<FragmentElement>>,
}

static SHARED_POOL: OnceLock<Arc<ElementPool>> = OnceLock::new();

impl ElementPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// The process-wide pool. The first caller decides its capacity.
    pub fn shared(capacity: usize) -> Arc<Self> {
        SHARED_POOL
            .get_or_init(|| Arc::new(ElementPool::new(capacity)))
            .clone()
    }

    #[inline]
    pub fn acquire(&self) -> Box<FragmentElement> {
        match self.free.pop() {
            Some(elem) => elem,
            None => {
                metrics::ELEMENTS_ALLOCATED.inc();
                Box::new(FragmentElement::blank())
            }
        }
    }

    /// Returns an element to the freelist. Elements beyond the pool capacity are dropped.
    #[inline]
    pub fn release(&self, mut elem: Box<FragmentElement>) {
        metrics::ELEMENTS_RECYCLED.inc();
        elem.clear();
        let _ = self.free.push(elem);
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }
}

impl Default for ElementPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}
