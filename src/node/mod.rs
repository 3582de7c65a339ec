//! Video function node.
//!
//! The function node is the kernel device representing the gadget's video
//! streaming endpoint. It delivers control events from the USB host and
//! transmits payload buffers to it.
//!
//! [`UvcDevice`] implements [`VideoNode`] for the Linux UVC gadget driver.
//! The driver exposes a V4L2 output device whose buffers each hold one complete
//! frame; it splits them into USB requests and prepends its own payload headers.
//! `UvcDevice` strips the headers of queued payloads, copies their data into the
//! current V4L2 buffer and queues that buffer on the payload marked end of frame.
//! Payload slots complete immediately after the copy, while a dequeued V4L2
//! buffer makes room for the next frame.

use std::{io::Result, os::fd::AsFd};

use crate::{source::StreamFormat, uvc::CtrlReq};

mod device;
pub use device::*;

/// Event delivered by the function node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// The host connected.
    Connect,
    /// The host disconnected.
    Disconnect,
    /// Setup stage of a control request.
    Setup(CtrlReq),
    /// Data stage of a SET request.
    Data(Vec<u8>),
    /// The host selected the streaming alternate setting.
    StreamOn,
    /// The host deselected the streaming alternate setting.
    StreamOff,
}

/// Answer to a control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Data stage of a GET request.
    Data(Vec<u8>),
    /// Accept the data stage of a SET request with the given length.
    Receive(u16),
    /// Stall the control endpoint.
    Stall,
}

/// A payload buffer the function node has finished with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Payload slot.
    pub slot: u32,
    /// The transfer failed.
    pub failed: bool,
}

/// Video function node.
///
/// The node's file descriptor signals pending events as priority readiness
/// and completed payload buffers as writable readiness.
pub trait VideoNode: AsFd {
    /// Subscribes to the UVC gadget events.
    fn subscribe(&mut self) -> Result<()>;

    /// Dequeues the next pending event.
    fn next_event(&mut self) -> Result<Option<NodeEvent>>;

    /// Answers the pending control request.
    fn respond(&mut self, response: &Response) -> Result<()>;

    /// Allocates payload slots of `size` bytes for streaming `format`.
    ///
    /// Returns the number of slots actually allocated.
    fn alloc_buffers(&mut self, format: &StreamFormat, count: u32, size: usize) -> Result<u32>;

    /// Releases all payload slots.
    fn free_buffers(&mut self) -> Result<()>;

    /// Queues a payload for transmission.
    ///
    /// Fails with [`WouldBlock`](std::io::ErrorKind::WouldBlock) if the node cannot accept it now.
    fn queue(&mut self, slot: u32, payload: &[u8]) -> Result<()>;

    /// Dequeues a completed payload slot.
    fn dequeue(&mut self) -> Result<Option<Completion>>;

    /// Starts transmission.
    fn stream_on(&mut self) -> Result<()>;

    /// Stops transmission.
    ///
    /// All queued slots are returned to the caller without completion.
    fn stream_off(&mut self) -> Result<()>;
}
