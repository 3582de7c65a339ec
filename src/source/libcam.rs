use libcamera::{
    camera::{ActiveCamera, Camera, CameraConfigurationStatus},
    camera_manager::CameraManager,
    control::{Control, ControlList},
    controls,
    framebuffer::AsFrameBuffer,
    framebuffer_allocator::{FrameBuffer, FrameBufferAllocator},
    framebuffer_map::MemoryMappedFrameBuffer,
    geometry::Size,
    pixel_format::PixelFormat,
    request::{Request, RequestStatus, ReuseFlag},
    stream::{Stream, StreamRole},
    utils::UniquePtr,
};
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use super::{
    camera::{copy_rows, AfRange, AfSpeed, AwbMode, CameraControls, CapturedFrame, ExposureMode, FrameMailbox},
    SourceEvents, StreamFormat, VideoSource,
};
use crate::{
    buffer::{BufferPool, Filled, Ownership},
    Error, Interest, Readiness, Result, UvcFormat,
};

/// Number of capture requests kept in flight.
const CAPTURE_REQUESTS: u32 = 4;

/// Time the camera thread waits for a completed request before checking for stop.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Interval of the camera debug report.
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Frames captured from a libcamera camera.
///
/// libcamera objects live on a dedicated camera thread that copies every
/// completed frame into a mailbox and wakes the event loop. A frame waiting in
/// the mailbox is replaced by the next one, so the host always receives the
/// newest frame.
pub struct LibcameraSource {
    camera: String,
    controls: CameraControls,
    mailbox: Option<Arc<FrameMailbox>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    offered: VecDeque<usize>,
    dropped: u64,
}

impl fmt::Debug for LibcameraSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LibcameraSource")
            .field("camera", &self.camera)
            .field("controls", &self.controls)
            .field("running", &self.worker.is_some())
            .finish()
    }
}

/// Looks up a camera by index or by id.
fn find_camera<'a>(mgr: &'a CameraManager, selector: &str) -> Option<Camera<'a>> {
    let cameras = mgr.cameras();
    match selector.parse::<usize>() {
        Ok(index) => cameras.get(index),
        Err(_) => (0..cameras.len()).filter_map(|i| cameras.get(i)).find(|cam| cam.id() == selector),
    }
}

impl LibcameraSource {
    /// Opens the camera with the given index or id.
    ///
    /// The controls are applied whenever streaming starts.
    pub fn open(camera: impl Into<String>, controls: CameraControls) -> Result<Self> {
        let camera = camera.into();
        controls.validate()?;

        let mgr = CameraManager::new()
            .map_err(|err| Error::SourceUnavailable(format!("cannot start camera manager: {err}")))?;
        let Some(cam) = find_camera(&mgr, &camera) else {
            let ids: Vec<_> =
                (0..mgr.cameras().len()).filter_map(|i| mgr.cameras().get(i)).map(|c| c.id().to_string()).collect();
            return Err(Error::SourceUnavailable(format!("camera {camera} not found, available: {}", ids.join(", "))));
        };
        log::info!("using camera {}", cam.id());

        Ok(Self {
            camera,
            controls,
            mailbox: None,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
            offered: VecDeque::new(),
            dropped: 0,
        })
    }

    fn join(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("camera thread of {} panicked", self.camera);
            }
        }
    }
}

impl VideoSource for LibcameraSource {
    fn name(&self) -> String {
        format!("camera {}", self.camera)
    }

    fn start(&mut self, format: &StreamFormat, pool: &mut BufferPool, events: &SourceEvents) -> Result<()> {
        let mailbox = Arc::new(FrameMailbox::new()?);
        events.register(&*mailbox, Interest::READABLE)?;

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        self.stop.store(false, Ordering::SeqCst);
        let capture = Capture {
            camera: self.camera.clone(),
            format: *format,
            controls: self.controls,
            mailbox: mailbox.clone(),
            stop: self.stop.clone(),
        };
        let worker = thread::Builder::new()
            .name("camera".to_string())
            .spawn(move || capture.run(ready_tx))
            .map_err(|err| Error::SourceUnavailable(format!("cannot spawn camera thread: {err}")));
        let worker = match worker {
            Ok(worker) => worker,
            Err(err) => {
                events.unregister(&*mailbox);
                return Err(err);
            }
        };
        self.worker = Some(worker);

        let started = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(Error::SourceUnavailable(format!("camera thread of {} ended", self.camera))));
        if let Err(err) = started {
            self.join();
            events.unregister(&*mailbox);
            return Err(err);
        }

        let free: Vec<_> = pool.indices(Ownership::Free).collect();
        for index in free {
            pool.claim(index)?;
            self.offered.push_back(index);
        }
        self.mailbox = Some(mailbox);
        self.dropped = 0;
        Ok(())
    }

    fn stop(&mut self, pool: &mut BufferPool, events: &SourceEvents) -> Result<()> {
        self.join();
        if let Some(mailbox) = self.mailbox.take() {
            events.unregister(&*mailbox);
            let dropped = self.dropped + mailbox.replaced();
            if dropped > 0 {
                log::info!("camera {} dropped {dropped} frames", self.camera);
            }
        }
        for index in self.offered.drain(..) {
            pool.reclaim(index)?;
        }
        Ok(())
    }

    fn on_ready(&mut self, pool: &mut BufferPool, _readiness: Readiness) -> Result<Option<Filled>> {
        let Some(mailbox) = &self.mailbox else { return Ok(None) };
        let Some(frame) = mailbox.take()? else { return Ok(None) };

        let Some(index) = self.offered.pop_front() else {
            self.dropped += 1;
            log::trace!("no buffer available, dropping camera frame");
            return Ok(None);
        };

        let dst = pool.source_buffer(index)?;
        let len = frame.data.len().min(dst.len());
        if len < frame.data.len() {
            log::warn!("camera frame of {} bytes truncated to {len} bytes", frame.data.len());
        }
        dst[..len].copy_from_slice(&frame.data[..len]);
        Ok(Some(pool.fill(index, len, frame.timestamp, frame.error || len < frame.data.len())?))
    }

    fn release(&mut self, pool: &mut BufferPool, index: usize) -> Result<()> {
        pool.claim(index)?;
        self.offered.push_back(index);
        Ok(())
    }
}

impl Drop for LibcameraSource {
    fn drop(&mut self) {
        self.join();
    }
}

/// State moved onto the camera thread.
struct Capture {
    camera: String,
    format: StreamFormat,
    controls: CameraControls,
    mailbox: Arc<FrameMailbox>,
    stop: Arc<AtomicBool>,
}

impl Capture {
    fn run(self, ready: mpsc::SyncSender<Result<()>>) {
        let mut ready = Some(ready);
        if let Err(err) = self.capture(&mut ready) {
            match ready.take() {
                Some(ready) => {
                    let _ = ready.send(Err(err));
                }
                None => {
                    log::error!("camera {} failed: {err}", self.camera);
                    self.mailbox.fail(err.to_string());
                }
            }
        }
    }

    fn capture(&self, ready: &mut Option<mpsc::SyncSender<Result<()>>>) -> Result<()> {
        let unavailable = |msg: String| Error::SourceUnavailable(format!("camera {}: {msg}", self.camera));

        let mgr = CameraManager::new().map_err(|err| unavailable(format!("cannot start camera manager: {err}")))?;
        let cam = find_camera(&mgr, &self.camera).ok_or_else(|| unavailable("not found".to_string()))?;
        let mut cam = cam.acquire().map_err(|err| unavailable(format!("cannot acquire: {err}")))?;

        let mut cfgs = cam
            .generate_configuration(&[StreamRole::VideoRecording])
            .ok_or_else(|| unavailable("no configuration for video recording".to_string()))?;
        let Some(mut cfg) = cfgs.get_mut(0) else { return Err(unavailable("no stream configuration".to_string())) };
        cfg.set_pixel_format(PixelFormat::new(self.format.format.fourcc(), 0));
        cfg.set_size(Size::new(self.format.width, self.format.height));
        cfg.set_buffer_count(CAPTURE_REQUESTS);

        match cfgs.validate() {
            CameraConfigurationStatus::Valid => (),
            CameraConfigurationStatus::Adjusted => log::warn!("camera {} adjusted the requested configuration", self.camera),
            CameraConfigurationStatus::Invalid => {
                return Err(unavailable(format!("cannot capture {}", self.format)));
            }
        }
        cam.configure(&mut cfgs).map_err(|err| unavailable(format!("cannot configure: {err}")))?;

        let Some(cfg) = cfgs.get(0) else { return Err(unavailable("no stream configuration".to_string())) };
        let size = cfg.get_size();
        let stride = cfg.get_stride() as usize;
        let row_len = match self.format.format {
            UvcFormat::Yuyv => size.width as usize * 2,
            _ => 0,
        };
        let rows = size.height as usize;
        let stream = cfg.stream().ok_or_else(|| unavailable("stream not configured".to_string()))?;

        let mut alloc = FrameBufferAllocator::new(&cam);
        let buffers = alloc.alloc(&stream).map_err(|err| unavailable(format!("cannot allocate buffers: {err}")))?;
        let mut requests = Vec::new();
        for (i, buf) in buffers.into_iter().enumerate() {
            let buf = MemoryMappedFrameBuffer::new(buf).map_err(|err| unavailable(format!("cannot map buffer: {err:?}")))?;
            let mut req =
                cam.create_request(Some(i as u64)).ok_or_else(|| unavailable("cannot create request".to_string()))?;
            req.add_buffer(&stream, buf).map_err(|err| unavailable(format!("cannot add buffer: {err}")))?;
            requests.push(req);
        }

        let (tx, rx) = mpsc::channel();
        cam.on_request_completed(move |req| {
            let _ = tx.send(req);
        });

        let startup = control_list(&self.controls, self.format.interval);
        cam.start(Some(&*startup)).map_err(|err| unavailable(format!("cannot start: {err}")))?;
        for req in requests {
            if cam.queue_request(req).is_err() {
                stop_camera(&mut cam);
                return Err(unavailable("cannot queue request".to_string()));
            }
        }
        log::info!("camera {} streaming {}x{} with {CAPTURE_REQUESTS} buffers", self.camera, size.width, size.height);
        if let Some(ready) = ready.take() {
            let _ = ready.send(Ok(()));
        }

        let mut last_report = Instant::now();
        let result = loop {
            if self.stop.load(Ordering::SeqCst) {
                break Ok(());
            }
            let mut req = match rx.recv_timeout(POLL_INTERVAL) {
                Ok(req) => req,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    break Err(Error::SourceError(format!("camera {} stopped delivering requests", self.camera)));
                }
            };

            if req.status() == RequestStatus::Cancelled {
                continue;
            }
            self.deliver(&req, &stream, stride, row_len, rows);

            if self.controls.debug_report && last_report.elapsed() >= REPORT_INTERVAL {
                report(&self.camera, &req);
                last_report = Instant::now();
            }

            req.reuse(ReuseFlag::REUSE_BUFFERS);
            if cam.queue_request(req).is_err() {
                break Err(Error::SourceError(format!("camera {} cannot requeue request", self.camera)));
            }
        };

        stop_camera(&mut cam);
        result
    }

    /// Copies the frame of a completed request into the mailbox.
    fn deliver(&self, req: &Request, stream: &Stream, stride: usize, row_len: usize, rows: usize) {
        let Some(fb) = req.buffer::<MemoryMappedFrameBuffer<FrameBuffer>>(stream) else {
            log::warn!("completed request without buffer");
            return;
        };
        let planes = fb.data();
        let Some(plane) = planes.first() else { return };
        let used = fb
            .metadata()
            .and_then(|m| m.planes().into_iter().next().map(|p| p.bytes_used as usize))
            .unwrap_or(plane.len());
        let plane = &plane[..used.min(plane.len())];
        let timestamp = fb.metadata().map(|m| Duration::from_nanos(m.timestamp())).unwrap_or_default();

        // Compressed frames are packed, uncompressed rows may be padded.
        let data = if row_len > 0 {
            let mut data = vec![0; row_len * rows];
            let len = copy_rows(plane, stride, row_len, rows, &mut data);
            data.truncate(len);
            data
        } else {
            plane.to_vec()
        };

        self.mailbox.post(CapturedFrame {
            data,
            timestamp,
            error: req.status() != RequestStatus::Complete,
        });
    }
}

fn stop_camera(cam: &mut ActiveCamera) {
    if let Err(err) = cam.stop() {
        log::warn!("stopping camera failed: {err}");
    }
}

/// Logs lens position and colour gains reported with a frame.
fn report(camera: &str, req: &Request) {
    let metadata = req.metadata();
    let lens = metadata.get::<controls::LensPosition>().ok().map(|p| p.0);
    let gains = metadata.get::<controls::ColourGains>().ok().map(|g| g.0);
    match (lens, gains) {
        (Some(lens), Some([red, blue])) => {
            log::info!("camera {camera}: lens position {lens:.2}, colour gains {red:.2},{blue:.2}")
        }
        (Some(lens), None) => log::info!("camera {camera}: lens position {lens:.2}"),
        (None, Some([red, blue])) => log::info!("camera {camera}: colour gains {red:.2},{blue:.2}"),
        (None, None) => log::info!("camera {camera}: no lens position or colour gains reported"),
    }
}

fn set<C: Control + fmt::Debug>(list: &mut ControlList, control: C) {
    let name = format!("{control:?}");
    if let Err(err) = list.set(control) {
        log::debug!("cannot set camera control {name}: {err}");
    }
}

/// Builds the controls applied when the camera starts.
fn control_list(controls: &CameraControls, interval: u32) -> UniquePtr<ControlList> {
    let mut list = ControlList::new();

    let duration = i64::from(interval) / 10;
    if duration > 0 {
        set(&mut list, controls::FrameDurationLimits([duration, duration]));
    }

    if let Some(position) = controls.lens_position {
        set(&mut list, controls::AfMode::AfModeManual);
        set(&mut list, controls::LensPosition(position));
    } else if controls.af_range.is_some() || controls.af_speed.is_some() {
        set(&mut list, controls::AfMode::AfModeContinuous);
    }
    if let Some(range) = controls.af_range {
        set(
            &mut list,
            match range {
                AfRange::Normal => controls::AfRange::AfRangeNormal,
                AfRange::Macro => controls::AfRange::AfRangeMacro,
            },
        );
    }
    if let Some(speed) = controls.af_speed {
        set(
            &mut list,
            match speed {
                AfSpeed::Normal => controls::AfSpeed::AfSpeedNormal,
                AfSpeed::Fast => controls::AfSpeed::AfSpeedFast,
            },
        );
    }

    if let Some(gains) = controls.colour_gains {
        set(&mut list, controls::AwbEnable(false));
        set(&mut list, controls::ColourGains([gains.red, gains.blue]));
    } else if let Some(awb) = controls.awb {
        set(
            &mut list,
            match awb {
                AwbMode::Auto => controls::AwbMode::AwbAuto,
                AwbMode::Incandescent => controls::AwbMode::AwbIncandescent,
                AwbMode::Tungsten => controls::AwbMode::AwbTungsten,
                AwbMode::Fluorescent => controls::AwbMode::AwbFluorescent,
                AwbMode::Indoor => controls::AwbMode::AwbIndoor,
                AwbMode::Daylight => controls::AwbMode::AwbDaylight,
                AwbMode::Cloudy => controls::AwbMode::AwbCloudy,
            },
        );
    }

    if let Some(exposure) = controls.exposure {
        set(
            &mut list,
            match exposure {
                ExposureMode::Normal => controls::AeExposureMode::ExposureNormal,
                ExposureMode::Short => controls::AeExposureMode::ExposureShort,
                ExposureMode::Long => controls::AeExposureMode::ExposureLong,
            },
        );
    }

    if let Some(v) = controls.brightness {
        set(&mut list, controls::Brightness(v));
    }
    if let Some(v) = controls.contrast {
        set(&mut list, controls::Contrast(v));
    }
    if let Some(v) = controls.saturation {
        set(&mut list, controls::Saturation(v));
    }
    if let Some(v) = controls.sharpness {
        set(&mut list, controls::Sharpness(v));
    }

    list
}
