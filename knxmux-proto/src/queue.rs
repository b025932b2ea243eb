//! Fan-out queue: one entry per accepted telegram, completed per destination.
//!
//! An entry tracks the tunneling channels still owed a delivery as a typed
//! bit set, plus one pending flag per non-tunneling consumer class. It leaves
//! the queue only from the head, and only once both sets are empty; a later
//! entry that completes first simply waits. That discipline is what keeps
//! per-destination ordering intact without blocking destinations on each
//! other.

use std::collections::VecDeque;

use bytes::Bytes;
use thiserror::Error;

use crate::ChannelId;

/// Typed set of tunneling destinations still owed a delivery
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct DestSet(u64);

impl DestSet {
    /// The empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a destination
    pub fn insert(&mut self, ch: ChannelId) {
        debug_assert!((ch.0 as usize) < 64);
        self.0 |= 1 << ch.0;
    }

    /// Remove a destination, reporting whether it was present
    pub fn remove(&mut self, ch: ChannelId) -> bool {
        let present = self.contains(ch);
        self.0 &= !(1 << ch.0);
        present
    }

    /// Whether `ch` is still owed a delivery
    pub fn contains(&self, ch: ChannelId) -> bool {
        self.0 & (1 << ch.0) != 0
    }

    /// Whether every destination has been satisfied
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate over the contained destinations, lowest channel first
    pub fn iter(&self) -> impl Iterator<Item = ChannelId> + '_ {
        let bits = self.0;
        (0..64u8).filter(move |&i| bits & (1 << i) != 0).map(ChannelId)
    }
}

impl std::fmt::Debug for DestSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Non-tunneling consumer classes fed from the same queue
///
/// Each class is a front-end family with its own delivery loop; the core
/// does not know their wire formats, only that each clears its pending flag
/// independently.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConsumerClass {
    /// Clients of the proprietary socket protocol
    Socket = 0,
    /// Clients of the eibd-compatible protocol
    Eibd = 1,
}

impl ConsumerClass {
    pub(crate) const VALUES: [Self; 2] = [Self::Socket, Self::Eibd];
}

/// Pending flags, one per consumer class
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct ConsumerSet(u8);

impl ConsumerSet {
    /// The empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `class` as owing a pass over the entry
    pub fn insert(&mut self, class: ConsumerClass) {
        self.0 |= 1 << class as u8;
    }

    /// Clear `class`, reporting whether it was pending
    pub fn remove(&mut self, class: ConsumerClass) -> bool {
        let present = self.contains(class);
        self.0 &= !(1 << class as u8);
        present
    }

    /// Whether `class` still owes a pass
    pub fn contains(&self, class: ConsumerClass) -> bool {
        self.0 & (1 << class as u8) != 0
    }

    /// Whether every class has processed the entry
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Debug for ConsumerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set()
            .entries(ConsumerClass::VALUES.into_iter().filter(|&c| self.contains(c)))
            .finish()
    }
}

/// The queue rejected a new telegram
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum EnqueueError {
    /// The configured depth limit was reached
    #[error("telegram queue is full")]
    QueueFull,
    /// There is no live upstream session to relay through
    #[error("upstream session is not established")]
    UpstreamClosed,
    /// The telegram is not a well-formed bus frame
    #[error("malformed bus telegram")]
    MalformedFrame(#[from] crate::frame::FrameDecodeError),
}

/// One telegram and the deliveries still owed for it
#[derive(Debug)]
pub(crate) struct QueueEntry {
    pub(crate) serial: u64,
    pub(crate) payload: Bytes,
    pub(crate) dests: DestSet,
    pub(crate) pending: ConsumerSet,
}

impl QueueEntry {
    pub(crate) fn is_complete(&self) -> bool {
        self.dests.is_empty() && self.pending.is_empty()
    }
}

/// Ordered queue of in-flight telegrams shared by every consumer
#[derive(Debug)]
pub(crate) struct TelegramQueue {
    entries: VecDeque<QueueEntry>,
    next_serial: u64,
    max_depth: usize,
}

impl TelegramQueue {
    pub(crate) fn new(max_depth: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            next_serial: 0,
            max_depth,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Append a telegram; serials are monotonic and never reused
    pub(crate) fn enqueue(
        &mut self,
        payload: Bytes,
        dests: DestSet,
        pending: ConsumerSet,
    ) -> Result<u64, EnqueueError> {
        if self.entries.len() >= self.max_depth {
            return Err(EnqueueError::QueueFull);
        }
        let serial = self.next_serial;
        self.next_serial += 1;
        self.entries.push_back(QueueEntry {
            serial,
            payload,
            dests,
            pending,
        });
        Ok(serial)
    }

    /// The oldest entry still owing `ch` a delivery
    ///
    /// Entries are offered to each destination front to back; combined with
    /// one in-flight telegram per connection this is what preserves
    /// per-destination ordering.
    pub(crate) fn next_owed(&self, ch: ChannelId) -> Option<(u64, Bytes)> {
        self.entries
            .iter()
            .find(|e| e.dests.contains(ch))
            .map(|e| (e.serial, e.payload.clone()))
    }

    /// Clear `ch`'s bit on the entry with the given serial
    ///
    /// Returns whether the bit was set; a second clear for the same
    /// destination is a no-op, which is what makes delivery at-most-once.
    pub(crate) fn clear_dest(&mut self, serial: u64, ch: ChannelId) -> bool {
        self.entries
            .iter_mut()
            .find(|e| e.serial == serial)
            .map_or(false, |e| e.dests.remove(ch))
    }

    /// Force-clear `ch` from every entry, e.g. when its connection died
    ///
    /// Returns the serials that were still owed to it, oldest first.
    pub(crate) fn clear_dest_everywhere(&mut self, ch: ChannelId) -> Vec<u64> {
        self.entries
            .iter_mut()
            .filter_map(|e| e.dests.remove(ch).then_some(e.serial))
            .collect()
    }

    /// Clear a consumer class from every entry, e.g. when it unregisters
    pub(crate) fn clear_class_everywhere(&mut self, class: ConsumerClass) {
        for entry in &mut self.entries {
            entry.pending.remove(class);
        }
    }

    /// Hand the next entry pending for `class` to that consumer
    ///
    /// Clears the flag: handing over *is* the delivery as far as the queue
    /// is concerned, per the queue contract with the front ends.
    pub(crate) fn next_for_class(&mut self, class: ConsumerClass) -> Option<(u64, Bytes)> {
        let entry = self.entries.iter_mut().find(|e| e.pending.contains(class))?;
        entry.pending.remove(class);
        Some((entry.serial, entry.payload.clone()))
    }

    /// Whether any entry still owes `class` a pass
    pub(crate) fn has_work_for_class(&self, class: ConsumerClass) -> bool {
        self.entries.iter().any(|e| e.pending.contains(class))
    }

    /// Remove completed entries from the head, never from anywhere else
    ///
    /// Returns the number of entries removed. A complete entry behind an
    /// incomplete head stays where it is.
    pub(crate) fn pop_complete(&mut self) -> usize {
        let mut removed = 0;
        while let Some(head) = self.entries.front() {
            if !head.is_complete() {
                break;
            }
            let popped = self.entries.pop_front();
            // completion is re-checked on the owned entry; a mismatch here
            // means a consumer mutated a non-head entry out from under us
            assert!(popped.is_some_and(|e| e.is_complete()));
            removed += 1;
        }
        removed
    }
}
