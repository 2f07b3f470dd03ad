// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Per-flow fragment bookkeeping.
use std::time::Duration;
use tokio::time::Instant;

use crate::defrag::element::{ElementPool, FragmentElement};
use crate::defrag::protocol::{FragmentType, GroupId, HeaderSnapshot};

/// Outcome of offering an element to a group.
#[derive(Debug)]
pub enum Insertion {
    Inserted,
    /// An element with the same offset was already present. The first one wins and the
    /// rejected element is handed back so the caller can recycle it.
    Duplicate(Box<FragmentElement>),
}

/// All fragments seen so far for one datagram, kept sorted by offset.
#[derive(Debug)]
pub struct FragmentGroup {
    id: GroupId,
    frag_type: FragmentType,
    created: Instant,
    elements: Vec<Box<FragmentElement>>,
    highest_offset_seen: usize,
    current_total_len: usize,
    terminal: Option<HeaderSnapshot>,
    next_protocol: Option<u8>,
}

impl FragmentGroup {
    pub fn new(id: GroupId, frag_type: FragmentType) -> Self {
        Self {
            id,
            frag_type,
            created: Instant::now(),
            elements: Vec::new(),
            highest_offset_seen: 0,
            current_total_len: 0,
            terminal: None,
            next_protocol: None,
        }
    }

    pub fn id(&self) -> &GroupId {
        &self.id
    }

    pub fn frag_type(&self) -> FragmentType {
        self.frag_type
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn elements(&self) -> &[Box<FragmentElement>] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn highest_offset_seen(&self) -> usize {
        self.highest_offset_seen
    }

    pub fn current_total_len(&self) -> usize {
        self.current_total_len
    }

    pub fn terminal(&self) -> Option<&HeaderSnapshot> {
        self.terminal.as_ref()
    }

    pub fn next_protocol(&self) -> Option<u8> {
        self.next_protocol
    }

    /// Inserts in offset order. Arrivals at or past the highest offset seen go straight to
    /// the tail; anything earlier is placed before the first element with a greater offset.
    pub fn insert(&mut self, elem: Box<FragmentElement>) -> Insertion {
        let offset = elem.byte_offset();
        if offset >= self.highest_offset_seen {
            if self
                .elements
                .last()
                .is_some_and(|last| last.byte_offset() == offset)
            {
                return Insertion::Duplicate(elem);
            }
            self.record(&elem);
            self.elements.push(elem);
            return Insertion::Inserted;
        }

        match self.elements.iter().position(|e| e.byte_offset() >= offset) {
            Some(idx) if self.elements[idx].byte_offset() == offset => Insertion::Duplicate(elem),
            Some(idx) => {
                self.record(&elem);
                self.elements.insert(idx, elem);
                Insertion::Inserted
            }
            None => {
                self.record(&elem);
                self.elements.push(elem);
                Insertion::Inserted
            }
        }
    }

    fn record(&mut self, elem: &FragmentElement) {
        self.highest_offset_seen = self.highest_offset_seen.max(elem.end());
        self.current_total_len += elem.len();
        if elem.is_terminal() {
            if let Some(snapshot) = elem.terminal {
                self.next_protocol = Some(snapshot.next_protocol);
                self.terminal = Some(snapshot);
            }
        }
    }

    /// The terminal fragment has arrived and the payload bytes collected so far leave no gap.
    pub fn is_complete(&self) -> bool {
        self.terminal.is_some() && self.highest_offset_seen == self.current_total_len
    }

    pub fn is_expired(&self, now: Instant, max_age: Duration) -> bool {
        now.saturating_duration_since(self.created) > max_age
    }

    /// Hands every element back to the pool. Returns how many were released.
    pub fn release(self, pool: &ElementPool) -> usize {
        let count = self.elements.len();
        for elem in self.elements {
            pool.release(elem);
        }
        count
    }
}
