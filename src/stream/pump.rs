//! Buffer pump.
//!
//! Splits filled frames into payloads, each prefixed with a payload header,
//! queues them into the payload slots of the function node and tracks their completion.

use bytes::{BufMut, BytesMut};
use std::{
    collections::VecDeque,
    io::ErrorKind,
    time::{Duration, Instant},
};

use crate::{
    buffer::{BufferPool, Filled, Ownership},
    node::{Completion, VideoNode},
    uvc::{HeaderInfo, PayloadHeader},
    Error, Result,
};

/// Optional payload header fields.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HeaderFields {
    pub pts: bool,
    pub scr: bool,
}

/// A frame whose payloads are being transmitted.
#[derive(Debug)]
struct Transfer {
    index: usize,
    len: usize,
    offset: usize,
    info: HeaderInfo,
    pts: Option<u32>,
    submitted: bool,
    outstanding: usize,
}

/// Converts a duration into device clock ticks.
fn ticks(time: Duration, clock_frequency: u32) -> u32 {
    (time.as_nanos() * u128::from(clock_frequency) / 1_000_000_000) as u32
}

#[derive(Debug)]
pub(crate) struct Pump {
    max_payload: usize,
    fields: HeaderFields,
    clock_frequency: u32,
    fid: bool,
    transfers: VecDeque<Transfer>,
    free_slots: VecDeque<u32>,
    slots: Vec<Option<usize>>,
    scratch: BytesMut,
    epoch: Instant,
    frames: u64,
    payloads: u64,
}

impl Pump {
    /// Creates a pump for `slots` payload slots carrying up to `max_payload` bytes of frame data each.
    pub fn new(slots: u32, max_payload: usize, fields: HeaderFields, clock_frequency: u32) -> Self {
        let fields = if clock_frequency == 0 { HeaderFields::default() } else { fields };
        Self {
            max_payload: max_payload.max(1),
            fields,
            clock_frequency,
            fid: false,
            transfers: VecDeque::new(),
            free_slots: (0..slots).collect(),
            slots: vec![None; slots as usize],
            scratch: BytesMut::with_capacity(max_payload + PayloadHeader::MAX_LEN),
            epoch: Instant::now(),
            frames: 0,
            payloads: 0,
        }
    }

    /// Size of a payload slot for `max_payload` bytes of frame data.
    pub fn slot_size(max_payload: usize) -> usize {
        max_payload.max(1) + PayloadHeader::MAX_LEN
    }

    /// Number of frames accepted so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Number of payloads queued so far.
    pub fn payloads(&self) -> u64 {
        self.payloads
    }

    /// Accepts a filled frame for transmission.
    pub fn push(&mut self, filled: Filled, pool: &mut BufferPool) -> Result<()> {
        pool.advance(filled.index, Ownership::FilledBySource)?;

        let mut info = HeaderInfo::empty();
        info.set(HeaderInfo::FID, self.fid);
        info.set(HeaderInfo::ERR, filled.error);
        self.fid = !self.fid;
        self.frames += 1;

        let pts = self.fields.pts.then(|| ticks(filled.timestamp, self.clock_frequency));
        self.transfers.push_back(Transfer {
            index: filled.index,
            len: filled.bytes_used,
            offset: 0,
            info,
            pts,
            submitted: false,
            outstanding: 0,
        });
        Ok(())
    }

    fn header(&self, transfer: &Transfer, last: bool) -> PayloadHeader {
        let mut info = transfer.info;
        info.set(HeaderInfo::EOF, last);
        let scr = self.fields.scr.then(|| {
            let elapsed = self.epoch.elapsed();
            (ticks(elapsed, self.clock_frequency), (elapsed.as_millis() & 0x7ff) as u16)
        });
        PayloadHeader { info, pts: transfer.pts, scr }
    }

    /// Queues as many payloads as there are free slots.
    ///
    /// Payloads are queued strictly in frame order.
    pub fn submit(&mut self, pool: &mut BufferPool, node: &mut dyn VideoNode) -> Result<()> {
        while let Some(&slot) = self.free_slots.front() {
            let Some(pos) = self.transfers.iter().position(|transfer| !transfer.submitted) else { break };
            let transfer = &self.transfers[pos];

            let data = pool.frame(transfer.index)?;
            let end = transfer.len.min(transfer.offset + self.max_payload);
            let chunk = &data[transfer.offset..end];
            let last = end >= transfer.len;

            let header = self.header(transfer, last);
            self.scratch.clear();
            header.write((&mut self.scratch).writer())?;
            self.scratch.extend_from_slice(chunk);

            match node.queue(slot, &self.scratch) {
                Ok(()) => (),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => return Err(Error::Node(err)),
            }

            self.free_slots.pop_front();
            self.slots[slot as usize] = Some(transfer.index);
            self.payloads += 1;

            let transfer = &mut self.transfers[pos];
            transfer.offset = end;
            transfer.outstanding += 1;
            if last {
                transfer.submitted = true;
                pool.advance(transfer.index, Ownership::QueuedToSink)?;
            }
        }
        Ok(())
    }

    /// Handles a completed payload slot.
    ///
    /// Returns the buffer index if this completed the last payload of its frame.
    pub fn complete(&mut self, completion: Completion, pool: &mut BufferPool) -> Result<Option<usize>> {
        let Some(index) = self.slots.get_mut(completion.slot as usize).and_then(Option::take) else {
            log::warn!("completion for idle payload slot {}", completion.slot);
            return Ok(None);
        };
        self.free_slots.push_back(completion.slot);
        if completion.failed {
            log::warn!("payload of buffer {index} was not transmitted");
        }

        let Some(pos) = self.transfers.iter().position(|transfer| transfer.index == index) else {
            return Ok(None);
        };
        let transfer = &mut self.transfers[pos];
        transfer.outstanding -= 1;
        if !transfer.submitted || transfer.outstanding > 0 {
            return Ok(None);
        }

        self.transfers.remove(pos);
        pool.advance(index, Ownership::InFlightAtSink)?;
        Ok(Some(index))
    }

    /// Stops queuing payloads of partially or not yet transmitted frames.
    ///
    /// Frames without outstanding payloads become free.
    pub fn discard(&mut self, pool: &mut BufferPool) -> Result<()> {
        for transfer in &mut self.transfers {
            if !transfer.submitted {
                transfer.submitted = true;
                pool.advance(transfer.index, Ownership::QueuedToSink)?;
            }
        }
        self.release_idle(pool)
    }

    /// Treats every outstanding payload as completed.
    ///
    /// Called after the function node has stopped transmission.
    pub fn flush(&mut self, pool: &mut BufferPool) -> Result<()> {
        for slot in 0..self.slots.len() {
            if self.slots[slot].take().is_some() {
                self.free_slots.push_back(slot as u32);
            }
        }
        for transfer in &mut self.transfers {
            transfer.outstanding = 0;
        }
        self.release_idle(pool)
    }

    fn release_idle(&mut self, pool: &mut BufferPool) -> Result<()> {
        let mut result = Ok(());
        self.transfers.retain(|transfer| {
            if transfer.submitted && transfer.outstanding == 0 {
                if let Err(err) = pool.advance(transfer.index, Ownership::InFlightAtSink) {
                    result = Err(err);
                }
                false
            } else {
                true
            }
        });
        result
    }
}
