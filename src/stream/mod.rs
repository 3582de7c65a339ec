//! UVC stream.
//!
//! [`UvcStream`] connects a [`VideoNode`] with a [`VideoSource`]. It answers the
//! class-specific control requests of the host, negotiates the streaming parameters
//! through the probe and commit controls and transmits the frames of the source
//! while the host has the streaming interface selected.
//!
//! The stream moves through the states of [`StreamState`]:
//! `Idle → Negotiating → Committed → Streaming → Stopping → Idle`.
//! A probe after commit returns to `Negotiating`.

use std::{
    cell::RefCell,
    fmt,
    io::{self, ErrorKind},
    os::fd::AsFd,
    rc::{Rc, Weak},
};

use crate::{
    buffer::{BufferPool, OwnershipCounts},
    node::{NodeEvent, Response, VideoNode},
    source::{SourceEvents, StreamFormat, VideoSource},
    uvc::{
        ControlRequest, RequestErrorCode, RequestKind, StreamErrorCode, StreamingControl, Target, VcSelector,
        VsSelector, INFO_SUPPORTS_GET, INFO_SUPPORTS_SET,
    },
    Error, Events, Interest, Readiness, Result, UvcFunction,
};

mod negotiate;
mod pump;

use pump::{HeaderFields, Pump};

/// State of a [`UvcStream`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum StreamState {
    /// No streaming parameters have been probed.
    #[default]
    Idle,
    /// The host is probing streaming parameters.
    Negotiating,
    /// Streaming parameters are committed, ready to stream.
    Committed,
    /// Frames are being transmitted.
    Streaming,
    /// Transmission is winding down.
    Stopping,
}

/// Streaming configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct StreamConfig {
    /// Number of frame buffers shared between source and pump.
    pub buffers: usize,
    /// Number of payload slots requested from the function node.
    pub node_buffers: u32,
    /// Number of frames waiting for transmission above which
    /// transmitted buffers are held back from the source.
    pub max_pending: usize,
    /// Device clock frequency in Hz reported to the host and used for timestamps.
    pub clock_frequency: u32,
    /// Include a presentation time stamp in payload headers.
    pub pts: bool,
    /// Include a source clock reference in payload headers.
    pub scr: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { buffers: 4, node_buffers: 32, max_pending: 2, clock_frequency: 48_000_000, pts: false, scr: false }
    }
}

impl StreamConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of frame buffers.
    pub fn with_buffers(mut self, buffers: usize) -> Self {
        self.buffers = buffers;
        self
    }

    /// Sets the number of payload slots.
    pub fn with_node_buffers(mut self, node_buffers: u32) -> Self {
        self.node_buffers = node_buffers;
        self
    }

    /// Sets the pending frame threshold.
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Sets the device clock frequency.
    pub fn with_clock_frequency(mut self, clock_frequency: u32) -> Self {
        self.clock_frequency = clock_frequency;
        self
    }

    /// Enables timestamps in payload headers.
    pub fn with_timestamps(mut self, pts: bool, scr: bool) -> Self {
        self.pts = pts;
        self.scr = scr;
        self
    }
}

/// Resources of an active streaming session.
struct Session {
    format: StreamFormat,
    pool: BufferPool,
    pump: Pump,
    parked: Vec<usize>,
}

impl Session {
    /// Hands transmitted buffers back to the source unless too many frames are pending.
    fn recycle(&mut self, source: &mut dyn VideoSource, max_pending: usize) -> Result<()> {
        if self.parked.is_empty() {
            return Ok(());
        }

        let pending = self.pool.counts().queued_to_sink;
        if pending >= max_pending.max(1) {
            log::trace!("holding back {} buffers, {pending} frames pending", self.parked.len());
            return Ok(());
        }

        for index in self.parked.drain(..) {
            source.release(&mut self.pool, index)?;
        }
        Ok(())
    }
}

type Handler = fn(&mut Inner, &ControlRequest) -> Result<Response>;

/// Handler of a control request.
fn handler(target: Target, kind: RequestKind) -> Option<Handler> {
    use VsSelector::{Commit, Probe, StreamErrorCode as StreamError};

    let handler: Handler = match (target, kind) {
        (Target::Vs(Probe | Commit), RequestKind::SetCur) => Inner::set_streaming_control,
        (Target::Vs(Probe | Commit), RequestKind::GetCur) => Inner::get_streaming_control,
        (Target::Vs(Probe), RequestKind::GetMin | RequestKind::GetMax | RequestKind::GetRes | RequestKind::GetDef) => {
            Inner::get_streaming_bounds
        }
        (Target::Vs(Probe | Commit), RequestKind::GetLen) => |_, _| Ok(length(StreamingControl::SIZE)),
        (Target::Vs(Probe | Commit), RequestKind::GetInfo) => {
            |_, _| Ok(Response::Data(vec![INFO_SUPPORTS_GET | INFO_SUPPORTS_SET]))
        }
        (Target::Vs(StreamError), RequestKind::GetCur) => |inner, _| Ok(Response::Data(vec![inner.stream_error as u8])),
        (Target::Vc(VcSelector::RequestErrorCode), RequestKind::GetCur) => {
            |inner, _| Ok(Response::Data(vec![inner.request_error as u8]))
        }
        (Target::Vs(StreamError) | Target::Vc(VcSelector::RequestErrorCode), RequestKind::GetInfo) => {
            |_, _| Ok(Response::Data(vec![INFO_SUPPORTS_GET]))
        }
        (Target::Vs(StreamError) | Target::Vc(VcSelector::RequestErrorCode), RequestKind::GetLen) => {
            |_, _| Ok(length(1))
        }
        _ => return None,
    };
    Some(handler)
}

/// Answer to a GET_LEN request.
fn length(len: usize) -> Response {
    Response::Data((len as u16).to_le_bytes().to_vec())
}

/// Keeps the first error.
fn note(result: &mut Result<()>, res: Result<()>) {
    if let Err(err) = res {
        log::warn!("{err}");
        if result.is_ok() {
            *result = Err(err);
        }
    }
}

struct Inner {
    node: Box<dyn VideoNode>,
    source: Box<dyn VideoSource>,
    function: UvcFunction,
    config: StreamConfig,
    events: Events,
    source_events: SourceEvents,
    state: StreamState,
    probe: StreamingControl,
    commit: StreamingControl,
    probed: bool,
    committed: Option<StreamFormat>,
    pending: Option<ControlRequest>,
    request_error: RequestErrorCode,
    stream_error: StreamErrorCode,
    session: Option<Session>,
    last_session: Option<OwnershipCounts>,
}

impl Inner {
    fn set_state(&mut self, state: StreamState) {
        if self.state != state {
            log::debug!("stream state {} -> {state}", self.state);
            self.state = state;
        }
    }

    fn reset(&mut self) {
        self.probed = false;
        self.committed = None;
        self.pending = None;
        self.set_state(StreamState::Idle);
    }

    fn handle_event(&mut self, event: NodeEvent) -> Result<()> {
        match event {
            NodeEvent::Connect => {
                log::info!("host connected");
                Ok(())
            }
            NodeEvent::Disconnect => {
                log::info!("host disconnected");
                self.stream_off().map(|_| ())
            }
            NodeEvent::Setup(req) => {
                let request =
                    ControlRequest::decode(&req, self.function.control_interface, self.function.streaming_interface);
                let response = self.setup(request).unwrap_or(Response::Stall);
                if let Err(err) = self.node.respond(&response) {
                    log::warn!("answering control request failed: {err}");
                }
                Ok(())
            }
            NodeEvent::Data(data) => {
                if let Err(err) = self.data(&data) {
                    log::debug!("data stage of {} bytes rejected: {err}", data.len());
                }
                Ok(())
            }
            NodeEvent::StreamOn => match self.stream_on() {
                Err(err) if !err.is_session() => {
                    log::warn!("cannot start streaming: {err}");
                    Ok(())
                }
                res => res,
            },
            NodeEvent::StreamOff => self.stream_off().map(|_| ()),
        }
    }

    fn setup(&mut self, request: ControlRequest) -> Result<Response> {
        let result = self.dispatch(&request);
        match &result {
            Ok(_) if request.target == Target::Vc(VcSelector::RequestErrorCode) => (),
            Ok(_) => self.request_error = RequestErrorCode::NoError,
            Err(err) => {
                log::warn!("stalling {:?} request to {:?}: {err}", request.kind, request.target);
                self.request_error = err.request_error_code();
            }
        }

        result.map(|response| match response {
            Response::Data(mut data) => {
                data.truncate(request.length as usize);
                Response::Data(data)
            }
            other => other,
        })
    }

    fn dispatch(&mut self, request: &ControlRequest) -> Result<Response> {
        if matches!(request.target, Target::Vs(_))
            && matches!(self.state, StreamState::Streaming | StreamState::Stopping)
        {
            return Err(Error::InvalidStateForControl);
        }

        let handle = request.kind.and_then(|kind| handler(request.target, kind)).ok_or(Error::UnsupportedControl)?;
        handle(self, request)
    }

    fn set_streaming_control(&mut self, request: &ControlRequest) -> Result<Response> {
        if request.target == Target::Vs(VsSelector::Commit) && !self.probed {
            return Err(Error::NotCommitted);
        }

        if request.data.is_empty() {
            self.pending = Some(request.clone());
        } else {
            self.apply(request.target, &request.data)?;
        }
        Ok(Response::Receive(request.length))
    }

    fn get_streaming_control(&mut self, request: &ControlRequest) -> Result<Response> {
        let ctrl = match request.target {
            Target::Vs(VsSelector::Commit) => &self.commit,
            _ => &self.probe,
        };
        Ok(Response::Data(ctrl.to_vec()))
    }

    fn get_streaming_bounds(&mut self, request: &ControlRequest) -> Result<Response> {
        let clock = self.config.clock_frequency;
        let bound = match request.kind {
            Some(RequestKind::GetRes) => return Ok(Response::Data(StreamingControl::default().to_vec())),
            Some(RequestKind::GetMax) => negotiate::max_control(&self.function, &mut *self.source, clock),
            _ => negotiate::default_control(&self.function, &mut *self.source, clock),
        };
        let (ctrl, _) = bound.ok_or(Error::UnsupportedControl)?;
        Ok(Response::Data(ctrl.to_vec()))
    }

    fn data(&mut self, data: &[u8]) -> Result<()> {
        let Some(request) = self.pending.take() else {
            log::warn!("ignoring unexpected data stage of {} bytes", data.len());
            return Ok(());
        };

        let result = self.apply(request.target, data);
        if let Err(err) = &result {
            log::warn!("rejecting {:?} data: {err}", request.target);
            self.request_error = err.request_error_code();
        }
        result
    }

    /// Applies the data of a probe or commit SET_CUR request.
    fn apply(&mut self, target: Target, data: &[u8]) -> Result<()> {
        if matches!(self.state, StreamState::Streaming | StreamState::Stopping) {
            return Err(Error::InvalidStateForControl);
        }

        let requested = StreamingControl::parse(data)?;
        let (ctrl, format) = negotiate::negotiate_control(
            &self.function,
            &mut *self.source,
            self.config.clock_frequency,
            &requested,
        )
        .ok_or(Error::UnsupportedControl)?;

        match target {
            Target::Vs(VsSelector::Probe) => {
                log::debug!("probed {format}");
                self.probe = ctrl;
                self.probed = true;
                self.committed = None;
                self.set_state(StreamState::Negotiating);
            }
            Target::Vs(VsSelector::Commit) if self.probed => {
                log::info!("committed {format}");
                self.commit = ctrl;
                self.committed = Some(format);
                self.set_state(StreamState::Committed);
            }
            Target::Vs(VsSelector::Commit) => return Err(Error::NotCommitted),
            _ => return Err(Error::UnsupportedControl),
        }
        Ok(())
    }

    fn stream_on(&mut self) -> Result<()> {
        match self.state {
            StreamState::Committed => (),
            StreamState::Streaming => {
                log::debug!("already streaming");
                return Ok(());
            }
            _ => return Err(Error::NotCommitted),
        }
        let Some(format) = self.committed else { return Err(Error::NotCommitted) };

        let max_payload = self.commit.max_payload_transfer_size as usize;
        let mut pool = BufferPool::new(self.config.buffers, self.commit.max_video_frame_size as usize)?;

        let slots =
            match self.node.alloc_buffers(&format, self.config.node_buffers, Pump::slot_size(max_payload)) {
                Ok(0) => return Err(Error::OutOfBuffers),
                Ok(slots) => slots,
                Err(err) if err.raw_os_error() == Some(libc::ENOMEM) => return Err(Error::OutOfBuffers),
                Err(err) => return Err(Error::Node(err)),
            };
        let fields = HeaderFields { pts: self.config.pts, scr: self.config.scr };
        let pump = Pump::new(slots, max_payload, fields, self.config.clock_frequency);

        if let Err(err) = self.source.start(&format, &mut pool, &self.source_events) {
            self.unwind_start(&mut pool);
            return Err(err);
        }
        if let Err(err) = self.node.stream_on() {
            self.unwind_start(&mut pool);
            return Err(Error::Node(err));
        }
        if let Err(err) = self.events.modify(self.node.as_fd(), Interest::PRIORITY | Interest::WRITABLE) {
            let _ = self.node.stream_off();
            self.unwind_start(&mut pool);
            return Err(err);
        }

        log::info!("streaming {format} from {} with {slots} payload buffers", self.source.name());
        self.session = Some(Session { format, pool, pump, parked: Vec::new() });
        self.stream_error = StreamErrorCode::NoError;
        self.set_state(StreamState::Streaming);
        Ok(())
    }

    fn unwind_start(&mut self, pool: &mut BufferPool) {
        if let Err(err) = self.source.stop(pool, &self.source_events) {
            log::warn!("stopping {} failed: {err}", self.source.name());
        }
        for index in 0..pool.len() {
            let _ = pool.reclaim(index);
        }
        if let Err(err) = self.node.free_buffers() {
            log::warn!("releasing payload buffers failed: {err}");
        }
    }

    fn stream_off(&mut self) -> Result<OwnershipCounts> {
        let Some(session) = self.session.take() else {
            self.reset();
            return Ok(OwnershipCounts::default());
        };

        self.set_state(StreamState::Stopping);
        let result = self.stop_session(session);
        self.reset();
        result
    }

    fn stop_session(&mut self, session: Session) -> Result<OwnershipCounts> {
        let Session { format, mut pool, mut pump, .. } = session;
        let mut result = Ok(());

        note(&mut result, self.source.stop(&mut pool, &self.source_events));
        if let Err(err) = self.events.modify(self.node.as_fd(), Interest::PRIORITY) {
            log::debug!("removing writable interest failed: {err}");
        }

        note(&mut result, pump.discard(&mut pool));
        loop {
            match self.node.dequeue() {
                Ok(Some(completion)) => note(&mut result, pump.complete(completion, &mut pool).map(|_| ())),
                Ok(None) => break,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    note(&mut result, Err(Error::Node(err)));
                    break;
                }
            }
        }

        note(&mut result, self.node.stream_off().map_err(Error::Node));
        note(&mut result, pump.flush(&mut pool));
        note(&mut result, self.node.free_buffers().map_err(Error::Node));
        for index in 0..pool.len() {
            let _ = pool.reclaim(index);
        }

        let counts = pool.counts();
        self.last_session = Some(counts);
        log::info!("stopped streaming {format} after {} frames in {} payloads", pump.frames(), pump.payloads());
        result.map(|()| counts)
    }

    /// Ends the session after a fatal error.
    fn abort(&mut self, err: Error) -> Result<()> {
        log::error!("streaming failed: {err}");
        if let Some(session) = self.session.take() {
            self.set_state(StreamState::Stopping);
            if let Err(err) = self.stop_session(session) {
                log::warn!("cleaning up failed session: {err}");
            }
        }
        self.reset();
        self.stream_error = StreamErrorCode::DataDiscontinuity;
        Err(err)
    }

    fn node_ready(&mut self, readiness: Readiness) -> Result<()> {
        if readiness.contains(Readiness::PRIORITY) {
            while let Some(event) = self.node.next_event()? {
                log::trace!("node event {event:?}");
                self.handle_event(event)?;
            }
        }

        if self.state == StreamState::Streaming && readiness.intersects(Readiness::WRITABLE | Readiness::ERROR) {
            if let Err(err) = self.transmit() {
                return self.abort(err);
            }
        }
        Ok(())
    }

    /// Processes completed payloads and queues new ones.
    ///
    /// Repeats while the node completes payloads as they are queued.
    fn transmit(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else { return Ok(()) };

        loop {
            loop {
                let completion = match self.node.dequeue() {
                    Ok(Some(completion)) => completion,
                    Ok(None) => break,
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) => return Err(Error::Node(err)),
                };
                if let Some(index) = session.pump.complete(completion, &mut session.pool)? {
                    session.parked.push(index);
                }
            }

            let queued = session.pump.payloads();
            session.pump.submit(&mut session.pool, &mut *self.node)?;
            if session.pump.payloads() == queued {
                break;
            }
        }

        session.recycle(&mut *self.source, self.config.max_pending)
    }

    fn source_ready(&mut self, readiness: Readiness) -> Result<()> {
        if self.state != StreamState::Streaming {
            return Ok(());
        }
        match self.deliver(readiness) {
            Ok(()) => Ok(()),
            Err(err) => self.abort(err),
        }
    }

    fn deliver(&mut self, readiness: Readiness) -> Result<()> {
        let Some(session) = self.session.as_mut() else { return Ok(()) };
        let Some(filled) = self.source.on_ready(&mut session.pool, readiness)? else { return Ok(()) };

        session.pump.push(filled, &mut session.pool)?;
        self.transmit()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(err) = self.stop_session(session) {
                log::warn!("stopping stream failed: {err}");
            }
        }
        self.events.unregister(self.node.as_fd());
    }
}

/// A UVC video stream.
///
/// The stream registers its function node with the event loop and is driven
/// entirely by [`Events::run`]. The `on_*` methods expose the individual steps
/// for driving the stream without an event loop.
///
/// Clones refer to the same stream.
#[derive(Clone)]
pub struct UvcStream {
    inner: Rc<RefCell<Inner>>,
}

impl fmt::Debug for UvcStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("UvcStream")
            .field("function", &inner.function.name)
            .field("source", &inner.source.name())
            .field("state", &inner.state)
            .finish()
    }
}

impl UvcStream {
    /// Creates a stream and registers the function node with the event loop.
    ///
    /// The function must describe at least one format and each format at least one frame.
    pub fn new(
        node: impl VideoNode + 'static, source: impl VideoSource + 'static, function: UvcFunction,
        config: StreamConfig, events: &Events,
    ) -> Result<Self> {
        if function.formats.is_empty() || function.formats.iter().any(|format| format.frames.is_empty()) {
            return Err(Error::Io(io::Error::new(
                ErrorKind::InvalidInput,
                format!("UVC function {} lacks format or frame descriptors", function.name),
            )));
        }

        let mut node: Box<dyn VideoNode> = Box::new(node);
        node.subscribe()?;

        let mut source: Box<dyn VideoSource> = Box::new(source);
        let (probe, _) = negotiate::default_control(&function, &mut *source, config.clock_frequency)
            .ok_or(Error::UnsupportedControl)?;

        let inner = Rc::new_cyclic(|weak: &Weak<RefCell<Inner>>| {
            let weak = weak.clone();
            let source_events = SourceEvents::new(events.clone(), move |readiness| match weak.upgrade() {
                Some(inner) => UvcStream { inner }.source_ready(readiness),
                None => Ok(()),
            });
            RefCell::new(Inner {
                node,
                source,
                function,
                config,
                events: events.clone(),
                source_events,
                state: StreamState::Idle,
                probe,
                commit: probe,
                probed: false,
                committed: None,
                pending: None,
                request_error: RequestErrorCode::NoError,
                stream_error: StreamErrorCode::NoError,
                session: None,
                last_session: None,
            })
        });

        let weak = Rc::downgrade(&inner);
        events.register(inner.borrow().node.as_fd(), Interest::PRIORITY, move |readiness| match weak.upgrade() {
            Some(inner) => UvcStream { inner }.node_ready(readiness),
            None => Ok(()),
        })?;

        Ok(Self { inner })
    }

    /// Current state.
    pub fn state(&self) -> StreamState {
        self.inner.borrow().state
    }

    /// Current value of the probe control.
    pub fn probe(&self) -> StreamingControl {
        self.inner.borrow().probe
    }

    /// Current value of the commit control.
    pub fn commit(&self) -> StreamingControl {
        self.inner.borrow().commit
    }

    /// Committed stream format, if any.
    pub fn committed_format(&self) -> Option<StreamFormat> {
        self.inner.borrow().committed
    }

    /// Format of the active streaming session.
    pub fn streaming_format(&self) -> Option<StreamFormat> {
        self.inner.borrow().session.as_ref().map(|session| session.format)
    }

    /// Error code of the last control request.
    pub fn request_error_code(&self) -> RequestErrorCode {
        self.inner.borrow().request_error
    }

    /// Error code of the last streaming session.
    pub fn stream_error_code(&self) -> StreamErrorCode {
        self.inner.borrow().stream_error
    }

    /// Number of buffers per holder in the active streaming session.
    pub fn counts(&self) -> Option<OwnershipCounts> {
        self.inner.borrow().session.as_ref().map(|session| session.pool.counts())
    }

    /// Number of buffers per holder when the last streaming session ended.
    ///
    /// Also available after a fatal error ended the session.
    pub fn last_session_counts(&self) -> Option<OwnershipCounts> {
        self.inner.borrow().last_session
    }

    /// Name of the video source.
    pub fn source_name(&self) -> String {
        self.inner.borrow().source.name()
    }

    /// Handles the setup stage of a control request.
    ///
    /// Returns the answer for the host. A SET_CUR request without data is
    /// completed by [`on_data`](Self::on_data); one carrying data is applied immediately.
    /// On error the request must be stalled; the error code is then reported
    /// through the request error code control.
    pub fn on_setup(&self, request: ControlRequest) -> Result<Response> {
        self.inner.borrow_mut().setup(request)
    }

    /// Handles the data stage of the pending SET_CUR request.
    pub fn on_data(&self, data: &[u8]) -> Result<()> {
        self.inner.borrow_mut().data(data)
    }

    /// Starts streaming the committed format.
    ///
    /// On failure the stream stays in its previous state.
    pub fn on_stream_on(&self) -> Result<()> {
        self.inner.borrow_mut().stream_on()
    }

    /// Stops streaming and returns the buffer ownership at the end of the session.
    ///
    /// Every buffer is free afterwards.
    pub fn on_stream_off(&self) -> Result<OwnershipCounts> {
        self.inner.borrow_mut().stream_off()
    }

    /// Handles a disconnect of the host.
    pub fn on_disconnect(&self) -> Result<()> {
        self.inner.borrow_mut().stream_off().map(|_| ())
    }

    /// Handles readiness of the function node.
    ///
    /// Fails once if a fatal error ended the streaming session.
    pub fn node_ready(&self, readiness: Readiness) -> Result<()> {
        self.inner.borrow_mut().node_ready(readiness)
    }

    /// Handles readiness of a video source registration.
    ///
    /// Fails once if a fatal error ended the streaming session.
    pub fn source_ready(&self, readiness: Readiness) -> Result<()> {
        self.inner.borrow_mut().source_ready(readiness)
    }
}
