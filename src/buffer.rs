//! Frame buffer pool shared between the video source and the buffer pump.
//!
//! Every buffer has exactly one holder at any time, tracked by its [`Ownership`] tag.
//! Tags advance strictly along the cycle
//! `Free → QueuedToSource → FilledBySource → QueuedToSink → InFlightAtSink → Free`.
//! The only other transition is [`BufferPool::reclaim`], which returns a buffer
//! that never reached the function node to `Free` while a session stops.

use std::time::Duration;

use crate::{Error, Result};

/// Holder of a buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Ownership {
    /// Not held by anyone.
    #[default]
    Free,
    /// Offered to the video source for filling.
    QueuedToSource,
    /// Filled by the video source and delivered to the pump.
    FilledBySource,
    /// Payloads are being queued to the function node.
    QueuedToSink,
    /// All payloads are queued, waiting for the function node to complete them.
    InFlightAtSink,
}

impl Ownership {
    /// The only tag that may follow this one.
    pub fn next(self) -> Self {
        match self {
            Self::Free => Self::QueuedToSource,
            Self::QueuedToSource => Self::FilledBySource,
            Self::FilledBySource => Self::QueuedToSink,
            Self::QueuedToSink => Self::InFlightAtSink,
            Self::InFlightAtSink => Self::Free,
        }
    }

    /// Whether the function node may still read from the buffer.
    pub fn is_at_sink(self) -> bool {
        matches!(self, Self::QueuedToSink | Self::InFlightAtSink)
    }
}

/// A frame delivered by the video source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filled {
    /// Buffer index.
    pub index: usize,
    /// Number of valid bytes.
    pub bytes_used: usize,
    /// Capture time.
    pub timestamp: Duration,
    /// The source flagged the frame as damaged.
    pub error: bool,
}

/// Number of buffers per holder.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipCounts {
    /// Free buffers.
    pub free: usize,
    /// Buffers offered to the source.
    pub queued_to_source: usize,
    /// Buffers filled by the source.
    pub filled_by_source: usize,
    /// Buffers being queued to the function node.
    pub queued_to_sink: usize,
    /// Buffers in flight at the function node.
    pub in_flight_at_sink: usize,
}

impl OwnershipCounts {
    /// Buffers the function node may still read from.
    pub fn at_sink(&self) -> usize {
        self.queued_to_sink + self.in_flight_at_sink
    }

    /// Total number of buffers.
    pub fn total(&self) -> usize {
        self.free + self.queued_to_source + self.filled_by_source + self.at_sink()
    }
}

#[derive(Debug)]
struct Slot {
    data: Vec<u8>,
    owner: Ownership,
    bytes_used: usize,
    timestamp: Duration,
    error: bool,
}

/// Fixed-size pool of frame buffers.
///
/// The pool is created when streaming starts and dropped when it stops.
#[derive(Debug)]
pub struct BufferPool {
    slots: Vec<Slot>,
    capacity: usize,
}

impl BufferPool {
    /// Allocates `count` buffers of `capacity` bytes each.
    ///
    /// Fails with [`Error::OutOfBuffers`] if the memory cannot be reserved.
    pub fn new(count: usize, capacity: usize) -> Result<Self> {
        if count == 0 || capacity == 0 {
            return Err(Error::OutOfBuffers);
        }

        let mut slots = Vec::new();
        slots.try_reserve_exact(count).map_err(|_| Error::OutOfBuffers)?;
        for _ in 0..count {
            let mut data = Vec::new();
            data.try_reserve_exact(capacity).map_err(|_| Error::OutOfBuffers)?;
            data.resize(capacity, 0);
            slots.push(Slot { data, owner: Ownership::Free, bytes_used: 0, timestamp: Duration::ZERO, error: false });
        }

        log::debug!("allocated {count} frame buffers of {capacity} bytes");
        Ok(Self { slots, capacity })
    }

    /// Number of buffers.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool has no buffers.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Capacity of each buffer in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current holder of a buffer.
    pub fn owner(&self, index: usize) -> Option<Ownership> {
        self.slots.get(index).map(|slot| slot.owner)
    }

    /// Indices of all buffers with the given holder.
    pub fn indices(&self, owner: Ownership) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().enumerate().filter(move |(_, slot)| slot.owner == owner).map(|(i, _)| i)
    }

    /// Moves a buffer to the next holder, provided it is currently held by `expected`.
    pub fn advance(&mut self, index: usize, expected: Ownership) -> Result<Ownership> {
        let slot = self.slot_mut(index, expected)?;
        slot.owner = slot.owner.next();
        log::trace!("buffer {index}: {expected} -> {}", slot.owner);
        Ok(slot.owner)
    }

    /// Offers a free buffer to the source and returns its memory for filling.
    pub fn claim(&mut self, index: usize) -> Result<&mut [u8]> {
        self.advance(index, Ownership::Free)?;
        let slot = &mut self.slots[index];
        slot.bytes_used = 0;
        slot.error = false;
        Ok(&mut slot.data)
    }

    /// Memory of a buffer currently offered to the source.
    pub fn source_buffer(&mut self, index: usize) -> Result<&mut [u8]> {
        Ok(&mut self.slot_mut(index, Ownership::QueuedToSource)?.data)
    }

    /// Marks a buffer offered to the source as filled.
    pub fn fill(&mut self, index: usize, bytes_used: usize, timestamp: Duration, error: bool) -> Result<Filled> {
        let capacity = self.capacity;
        let slot = self.slot_mut(index, Ownership::QueuedToSource)?;
        slot.bytes_used = bytes_used.min(capacity);
        slot.timestamp = timestamp;
        slot.error = error;
        slot.owner = slot.owner.next();
        Ok(Filled { index, bytes_used: slot.bytes_used, timestamp, error })
    }

    /// Valid data of a filled buffer, readable while the pump or function node holds it.
    pub fn frame(&self, index: usize) -> Result<&[u8]> {
        let slot = self.slots.get(index).ok_or(Error::Ownership {
            index,
            owner: Ownership::Free,
            expected: Ownership::FilledBySource,
        })?;
        match slot.owner {
            Ownership::FilledBySource | Ownership::QueuedToSink | Ownership::InFlightAtSink => {
                Ok(&slot.data[..slot.bytes_used])
            }
            owner => Err(Error::Ownership { index, owner, expected: Ownership::FilledBySource }),
        }
    }

    /// Returns a buffer that never reached the function node to the free state.
    ///
    /// Used while a session stops.
    /// Buffers the function node may still read from cannot be reclaimed.
    pub fn reclaim(&mut self, index: usize) -> Result<()> {
        let slot = self.slots.get_mut(index).ok_or(Error::Ownership {
            index,
            owner: Ownership::Free,
            expected: Ownership::QueuedToSource,
        })?;
        match slot.owner {
            Ownership::Free => Ok(()),
            owner if owner.is_at_sink() => Err(Error::Ownership { index, owner, expected: Ownership::QueuedToSource }),
            owner => {
                log::trace!("buffer {index}: {owner} -> {}", Ownership::Free);
                slot.owner = Ownership::Free;
                Ok(())
            }
        }
    }

    /// Number of buffers per holder.
    pub fn counts(&self) -> OwnershipCounts {
        let mut counts = OwnershipCounts::default();
        for slot in &self.slots {
            match slot.owner {
                Ownership::Free => counts.free += 1,
                Ownership::QueuedToSource => counts.queued_to_source += 1,
                Ownership::FilledBySource => counts.filled_by_source += 1,
                Ownership::QueuedToSink => counts.queued_to_sink += 1,
                Ownership::InFlightAtSink => counts.in_flight_at_sink += 1,
            }
        }
        counts
    }

    /// Whether every buffer is free.
    pub fn is_all_free(&self) -> bool {
        self.slots.iter().all(|slot| slot.owner == Ownership::Free)
    }

    fn slot_mut(&mut self, index: usize, expected: Ownership) -> Result<&mut Slot> {
        match self.slots.get_mut(index) {
            Some(slot) if slot.owner == expected => Ok(slot),
            Some(slot) => Err(Error::Ownership { index, owner: slot.owner, expected }),
            None => Err(Error::Ownership { index, owner: Ownership::Free, expected }),
        }
    }
}
