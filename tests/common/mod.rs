//! Common test functions.
#![allow(dead_code)]

use std::{
    cell::RefCell,
    collections::VecDeque,
    io::{Error, ErrorKind, Result},
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    rc::Rc,
    sync::Once,
    time::Duration,
};

use uvc_gadget::{
    buffer::{BufferPool, Filled, Ownership},
    node::{Completion, NodeEvent, Response, VideoNode},
    source::{SourceEvents, StreamFormat, VideoSource},
    uvc::{ControlRequest, CtrlReq, PayloadHeader, StreamingControl},
    Events, FormatConfig, FrameConfig, Readiness, StopHandle, StreamConfig, UvcFormat, UvcFunction, UvcStream,
};

pub const SET_CUR: u8 = 0x01;
pub const GET_CUR: u8 = 0x81;
pub const GET_MIN: u8 = 0x82;
pub const GET_MAX: u8 = 0x83;
pub const GET_RES: u8 = 0x84;
pub const GET_LEN: u8 = 0x85;
pub const GET_INFO: u8 = 0x86;
pub const GET_DEF: u8 = 0x87;

pub const VS_PROBE: u8 = 0x01;
pub const VS_COMMIT: u8 = 0x02;
pub const VS_STREAM_ERROR_CODE: u8 = 0x06;
pub const VC_REQUEST_ERROR_CODE: u8 = 0x02;

pub const CONTROL_IF: u8 = 0;
pub const STREAMING_IF: u8 = 1;

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Scripted state of a [`MockNode`].
#[derive(Debug, Default)]
pub struct NodeState {
    /// Events returned by `next_event`.
    pub events: VecDeque<NodeEvent>,
    /// Every answer to a control request.
    pub responses: Vec<Response>,
    /// Allocated payload slots.
    pub slots: u32,
    /// Maximum number of payloads queued at once.
    pub capacity: Option<usize>,
    /// Slots queued and not yet completed.
    pub queued: VecDeque<u32>,
    /// Completions returned by `dequeue`.
    pub completed: VecDeque<Completion>,
    /// Every payload ever queued.
    pub payloads: Vec<Vec<u8>>,
    pub streaming: bool,
    pub fail_alloc: bool,
    pub fail_stream_on: bool,
    pub fail_queue: bool,
    /// Complete every payload as soon as it is queued.
    pub auto_complete: bool,
    /// Stop the event loop after this many frames.
    pub stop_after: Option<(usize, StopHandle)>,
}

impl NodeState {
    /// Completes all queued payloads.
    pub fn complete_all(&mut self) {
        while let Some(slot) = self.queued.pop_front() {
            self.completed.push_back(Completion { slot, failed: false });
        }
    }

    /// Payload headers of all payloads.
    pub fn headers(&self) -> Vec<PayloadHeader> {
        self.payloads.iter().map(|p| PayloadHeader::parse(p).unwrap()).collect()
    }

    /// Number of payloads with the end-of-frame flag.
    pub fn frames(&self) -> usize {
        self.headers().iter().filter(|h| h.info.contains(uvc_gadget::uvc::HeaderInfo::EOF)).count()
    }
}

/// In-memory function node.
pub struct MockNode {
    fd: OwnedFd,
    state: Rc<RefCell<NodeState>>,
}

impl MockNode {
    pub fn new() -> (Self, Rc<RefCell<NodeState>>) {
        let fd = rustix::event::eventfd(0, rustix::event::EventfdFlags::CLOEXEC | rustix::event::EventfdFlags::NONBLOCK)
            .unwrap();
        let state = Rc::new(RefCell::new(NodeState::default()));
        (Self { fd, state: state.clone() }, state)
    }
}

impl AsFd for MockNode {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl VideoNode for MockNode {
    fn subscribe(&mut self) -> Result<()> {
        Ok(())
    }

    fn next_event(&mut self) -> Result<Option<NodeEvent>> {
        Ok(self.state.borrow_mut().events.pop_front())
    }

    fn respond(&mut self, response: &Response) -> Result<()> {
        self.state.borrow_mut().responses.push(response.clone());
        Ok(())
    }

    fn alloc_buffers(&mut self, _format: &StreamFormat, count: u32, _size: usize) -> Result<u32> {
        let mut state = self.state.borrow_mut();
        if state.fail_alloc {
            return Err(Error::from_raw_os_error(libc::ENOMEM));
        }
        state.slots = count;
        Ok(count)
    }

    fn free_buffers(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        assert!(!state.streaming, "buffers freed while streaming");
        state.slots = 0;
        Ok(())
    }

    fn queue(&mut self, slot: u32, payload: &[u8]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        assert!(slot < state.slots, "slot {slot} not allocated");
        assert!(!state.queued.contains(&slot), "slot {slot} queued twice");
        if state.fail_queue {
            return Err(Error::new(ErrorKind::BrokenPipe, "endpoint gone"));
        }
        if state.capacity.is_some_and(|capacity| state.queued.len() >= capacity) {
            return Err(ErrorKind::WouldBlock.into());
        }

        state.payloads.push(payload.to_vec());
        if state.auto_complete {
            state.completed.push_back(Completion { slot, failed: false });
        } else {
            state.queued.push_back(slot);
        }

        if let Some((frames, stop)) = &state.stop_after {
            if state.frames() >= *frames {
                stop.stop();
            }
        }
        Ok(())
    }

    fn dequeue(&mut self) -> Result<Option<Completion>> {
        Ok(self.state.borrow_mut().completed.pop_front())
    }

    fn stream_on(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_stream_on {
            return Err(Error::new(ErrorKind::Other, "stream on failed"));
        }
        state.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.streaming = false;
        state.queued.clear();
        state.completed.clear();
        Ok(())
    }
}

/// Scripted state of a [`MockSource`].
#[derive(Debug, Default)]
pub struct SourceState {
    /// Size of each produced frame.
    pub frame_len: usize,
    pub offered: VecDeque<usize>,
    pub format: Option<StreamFormat>,
    pub started: usize,
    pub stopped: usize,
    pub released: usize,
    pub produced: usize,
    pub fail_start: bool,
    pub fail_next: bool,
    /// Shortest frame interval the source delivers.
    pub min_interval: Option<u32>,
    /// Every format asked for during negotiation.
    pub negotiated: Vec<StreamFormat>,
}

/// Video source producing a frame whenever it is polled.
pub struct MockSource {
    state: Rc<RefCell<SourceState>>,
}

impl MockSource {
    pub fn new(frame_len: usize) -> (Self, Rc<RefCell<SourceState>>) {
        let state = Rc::new(RefCell::new(SourceState { frame_len, ..Default::default() }));
        (Self { state: state.clone() }, state)
    }
}

impl VideoSource for MockSource {
    fn name(&self) -> String {
        "mock source".to_string()
    }

    fn negotiate_format(&mut self, requested: &StreamFormat) -> StreamFormat {
        let mut state = self.state.borrow_mut();
        state.negotiated.push(*requested);
        match state.min_interval {
            Some(min) => StreamFormat { interval: requested.interval.max(min), ..*requested },
            None => *requested,
        }
    }

    fn start(&mut self, format: &StreamFormat, pool: &mut BufferPool, _events: &SourceEvents) -> uvc_gadget::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_start {
            return Err(uvc_gadget::Error::SourceUnavailable("scripted".to_string()));
        }
        state.format = Some(*format);
        state.started += 1;
        let free: Vec<_> = pool.indices(Ownership::Free).collect();
        for index in free {
            pool.claim(index)?;
            state.offered.push_back(index);
        }
        Ok(())
    }

    fn stop(&mut self, pool: &mut BufferPool, _events: &SourceEvents) -> uvc_gadget::Result<()> {
        let mut state = self.state.borrow_mut();
        state.stopped += 1;
        for index in state.offered.drain(..) {
            pool.reclaim(index)?;
        }
        Ok(())
    }

    fn on_ready(&mut self, pool: &mut BufferPool, _readiness: Readiness) -> uvc_gadget::Result<Option<Filled>> {
        let mut state = self.state.borrow_mut();
        if state.fail_next {
            state.fail_next = false;
            return Err(uvc_gadget::Error::SourceError("scripted".to_string()));
        }
        let Some(index) = state.offered.pop_front() else { return Ok(None) };

        let len = state.frame_len;
        let data = pool.source_buffer(index)?;
        for (i, byte) in data[..len].iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        state.produced += 1;
        Ok(Some(pool.fill(index, len, Duration::from_millis(state.produced as u64), false)?))
    }

    fn release(&mut self, pool: &mut BufferPool, index: usize) -> uvc_gadget::Result<()> {
        let mut state = self.state.borrow_mut();
        pool.claim(index)?;
        state.offered.push_back(index);
        state.released += 1;
        Ok(())
    }
}

/// YUYV function: 640x360 at 30 and 15 fps, 640x480 at 15 fps.
pub fn function() -> UvcFunction {
    UvcFunction::new(
        "/dev/video0",
        vec![FormatConfig::new(
            UvcFormat::Yuyv,
            vec![FrameConfig::new(640, 360, vec![333333, 666666]), FrameConfig::new(640, 480, vec![666666])],
        )],
    )
}

/// A class-specific request to the streaming or control interface.
pub fn request(request: u8, interface: u8, selector: u8, length: u16) -> ControlRequest {
    let req = CtrlReq {
        request_type: if request & 0x80 != 0 { 0xa1 } else { 0x21 },
        request,
        value: u16::from(selector) << 8,
        index: u16::from(interface),
        length,
    };
    ControlRequest::decode(&req, CONTROL_IF, STREAMING_IF)
}

/// Streaming control block requesting a format, frame and interval.
pub fn control(format_index: u8, frame_index: u8, frame_interval: u32) -> StreamingControl {
    StreamingControl { format_index, frame_index, frame_interval, ..Default::default() }
}

/// Performs a SET_CUR on the probe or commit control.
pub fn set_cur(stream: &UvcStream, selector: u8, ctrl: &StreamingControl) -> uvc_gadget::Result<()> {
    let response = stream.on_setup(request(SET_CUR, STREAMING_IF, selector, StreamingControl::SIZE as u16))?;
    assert_eq!(response, Response::Receive(StreamingControl::SIZE as u16));
    stream.on_data(&ctrl.to_vec())
}

/// Performs a GET request on a streaming control and parses the answer.
pub fn get(stream: &UvcStream, kind: u8, selector: u8) -> StreamingControl {
    match stream.on_setup(request(kind, STREAMING_IF, selector, StreamingControl::SIZE as u16)).unwrap() {
        Response::Data(data) => StreamingControl::parse(&data).unwrap(),
        other => panic!("unexpected response {other:?}"),
    }
}

/// Probes and commits a format.
pub fn commit(stream: &UvcStream, ctrl: &StreamingControl) {
    set_cur(stream, VS_PROBE, ctrl).unwrap();
    let probed = get(stream, GET_CUR, VS_PROBE);
    set_cur(stream, VS_COMMIT, &probed).unwrap();
}

/// Test harness: a stream with a mock node and a mock source.
pub struct Harness {
    pub events: Events,
    pub stream: UvcStream,
    pub node: Rc<RefCell<NodeState>>,
    pub source: Rc<RefCell<SourceState>>,
}

impl Harness {
    pub fn new(function: UvcFunction, config: StreamConfig, frame_len: usize) -> Self {
        init();
        let events = Events::new().unwrap();
        let (mock_node, node) = MockNode::new();
        let (mock_source, source) = MockSource::new(frame_len);
        let stream = UvcStream::new(mock_node, mock_source, function, config, &events).unwrap();
        Self { events, stream, node, source }
    }

    /// Commits a format and starts streaming.
    pub fn start(&self, ctrl: &StreamingControl) {
        commit(&self.stream, ctrl);
        self.stream.on_stream_on().unwrap();
    }

    /// Lets the source produce one frame.
    pub fn produce(&self) -> uvc_gadget::Result<()> {
        self.stream.source_ready(Readiness::READABLE)
    }

    /// Completes all queued payloads and lets the stream process them.
    pub fn complete(&self) -> uvc_gadget::Result<()> {
        self.node.borrow_mut().complete_all();
        self.stream.node_ready(Readiness::WRITABLE)
    }
}
