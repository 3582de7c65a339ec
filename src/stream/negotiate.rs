//! Probe and commit negotiation.
//!
//! Requested streaming parameters are never rejected. Each field is clamped to
//! the nearest value the function descriptors and the video source support.

use crate::{
    configfs::{FormatConfig, FrameConfig, UvcFunction},
    source::{StreamFormat, VideoSource},
    uvc::StreamingControl,
};

/// Picks the first supported frame interval not shorter than `requested`,
/// or the longest one if all are shorter.
pub(crate) fn clamp_interval(intervals: &[u32], requested: u32) -> u32 {
    intervals.iter().copied().find(|&interval| interval >= requested).or(intervals.last().copied()).unwrap_or(requested)
}

type Selection<'a> = (&'a FormatConfig, &'a FrameConfig, u32);

/// Clamps format and frame indices to the descriptors and the interval to the frame.
fn select(function: &UvcFunction, format_index: u8, frame_index: u8, interval: u32) -> Option<Selection<'_>> {
    let nformats = function.formats.len();
    if nformats == 0 {
        return None;
    }
    let format = &function.formats[(format_index as usize).clamp(1, nformats) - 1];

    let nframes = format.frames.len();
    if nframes == 0 {
        return None;
    }
    let frame = &format.frames[(frame_index as usize).clamp(1, nframes) - 1];

    Some((format, frame, clamp_interval(&frame.intervals, interval)))
}

/// Descriptors matching a format offered by the video source.
fn find<'a>(function: &'a UvcFunction, offered: &StreamFormat) -> Option<Selection<'a>> {
    function.formats.iter().filter(|format| format.format == offered.format).find_map(|format| {
        let frame = format.frames.iter().find(|frame| frame.width == offered.width && frame.height == offered.height)?;
        Some((format, frame, clamp_interval(&frame.intervals, offered.interval)))
    })
}

fn fill(function: &UvcFunction, (format, frame, interval): Selection, clock_frequency: u32) -> StreamingControl {
    StreamingControl {
        hint: StreamingControl::HINT_FRAME_INTERVAL,
        format_index: format.index,
        frame_index: frame.index,
        frame_interval: interval,
        max_video_frame_size: format.format.max_frame_size(
            frame.width,
            frame.height,
            frame.max_video_frame_buffer_size,
        ),
        max_payload_transfer_size: function.streaming.max_payload_transfer_size(),
        clock_frequency,
        framing_info: StreamingControl::FRAMING_FID | StreamingControl::FRAMING_EOF,
        preferred_version: 1,
        min_version: 0,
        max_version: 1,
        ..Default::default()
    }
}

/// Negotiates streaming parameters.
///
/// Returns the parameters the device will use and the matching stream format,
/// or `None` if the function has no frame descriptors.
pub(crate) fn negotiate(
    function: &UvcFunction, source: &mut dyn VideoSource, clock_frequency: u32, format_index: u8,
    frame_index: u8, interval: u32,
) -> Option<(StreamingControl, StreamFormat)> {
    let selected = select(function, format_index, frame_index, interval)?;
    let (format, frame, interval) = selected;
    let requested = StreamFormat { format: format.format, width: frame.width, height: frame.height, interval };

    let offered = source.negotiate_format(&requested);
    let selected = if offered == requested {
        selected
    } else {
        match find(function, &offered) {
            Some(substitute) => {
                log::debug!("{} substitutes {offered} for {requested}", source.name());
                substitute
            }
            None => {
                log::warn!("{} offers {offered}, which no descriptor matches; keeping {requested}", source.name());
                selected
            }
        }
    };

    let (format, frame, interval) = selected;
    let stream = StreamFormat { format: format.format, width: frame.width, height: frame.height, interval };
    Some((fill(function, selected, clock_frequency), stream))
}

/// Clamps a control block sent by the host.
pub(crate) fn negotiate_control(
    function: &UvcFunction, source: &mut dyn VideoSource, clock_frequency: u32, requested: &StreamingControl,
) -> Option<(StreamingControl, StreamFormat)> {
    negotiate(
        function,
        source,
        clock_frequency,
        requested.format_index,
        requested.frame_index,
        requested.frame_interval,
    )
}

/// Default parameters, also reported as minimum.
pub(crate) fn default_control(
    function: &UvcFunction, source: &mut dyn VideoSource, clock_frequency: u32,
) -> Option<(StreamingControl, StreamFormat)> {
    negotiate(function, source, clock_frequency, 1, 1, 0)
}

/// Maximum parameters.
pub(crate) fn max_control(
    function: &UvcFunction, source: &mut dyn VideoSource, clock_frequency: u32,
) -> Option<(StreamingControl, StreamFormat)> {
    negotiate(function, source, clock_frequency, u8::MAX, u8::MAX, u32::MAX)
}
