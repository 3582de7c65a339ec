mod common;
use common::*;

use uvc_gadget::{
    node::{NodeEvent, Response},
    uvc::{CtrlReq, RequestErrorCode, StreamingControl},
    Error, FormatConfig, FrameConfig, Readiness, StreamConfig, StreamState, UvcFormat, UvcFunction,
};

fn harness() -> Harness {
    Harness::new(function(), StreamConfig::new(), 16)
}

#[test]
fn probe_clamps_frame_interval() {
    let h = harness();
    set_cur(&h.stream, VS_PROBE, &control(1, 2, 333333)).unwrap();
    assert_eq!(h.stream.state(), StreamState::Negotiating);

    let probe = get(&h.stream, GET_CUR, VS_PROBE);
    assert_eq!((probe.format_index, probe.frame_index, probe.frame_interval), (1, 2, 666666));
    assert_eq!(probe.max_video_frame_size, 640 * 480 * 2);
    assert_eq!(probe.max_payload_transfer_size, 1024);
    assert_eq!(probe.clock_frequency, 48_000_000);
}

#[test]
fn probe_clamps_indices() {
    let h = harness();
    set_cur(&h.stream, VS_PROBE, &control(0, 7, 0)).unwrap();
    let probe = get(&h.stream, GET_CUR, VS_PROBE);
    assert_eq!((probe.format_index, probe.frame_index, probe.frame_interval), (1, 2, 666666));

    set_cur(&h.stream, VS_PROBE, &control(5, 1, 500000)).unwrap();
    let probe = get(&h.stream, GET_CUR, VS_PROBE);
    assert_eq!((probe.format_index, probe.frame_index, probe.frame_interval), (1, 1, 666666));
}

#[test]
fn commit_without_probe_is_rejected() {
    let h = harness();
    let commit = request(SET_CUR, STREAMING_IF, VS_COMMIT, StreamingControl::SIZE as u16);
    assert!(matches!(h.stream.on_setup(commit), Err(Error::NotCommitted)));
    assert_eq!(h.stream.state(), StreamState::Idle);
    assert_eq!(h.stream.request_error_code(), RequestErrorCode::WrongState);

    let code = h.stream.on_setup(request(GET_CUR, CONTROL_IF, VC_REQUEST_ERROR_CODE, 1)).unwrap();
    assert_eq!(code, Response::Data(vec![0x02]));
}

#[test]
fn commit_and_stream_on() {
    let h = harness();
    assert!(matches!(h.stream.on_stream_on(), Err(Error::NotCommitted)));

    commit(&h.stream, &control(1, 1, 333333));
    assert_eq!(h.stream.state(), StreamState::Committed);
    let format = h.stream.committed_format().unwrap();
    assert_eq!((format.width, format.height, format.interval), (640, 360, 333333));
    assert_eq!(get(&h.stream, GET_CUR, VS_COMMIT), get(&h.stream, GET_CUR, VS_PROBE));

    h.stream.on_stream_on().unwrap();
    assert_eq!(h.stream.state(), StreamState::Streaming);
    assert_eq!(h.stream.streaming_format(), Some(format));
    assert_eq!(h.source.borrow().format, Some(format));
}

#[test]
fn probe_after_commit_renegotiates() {
    let h = harness();
    commit(&h.stream, &control(1, 1, 333333));
    set_cur(&h.stream, VS_PROBE, &control(1, 2, 666666)).unwrap();
    assert_eq!(h.stream.state(), StreamState::Negotiating);
    assert_eq!(h.stream.committed_format(), None);
    assert!(matches!(h.stream.on_stream_on(), Err(Error::NotCommitted)));

    let probe = get(&h.stream, GET_CUR, VS_PROBE);
    set_cur(&h.stream, VS_COMMIT, &probe).unwrap();
    assert_eq!(h.stream.committed_format().unwrap().height, 480);
}

#[test]
fn bounds_and_info() {
    let h = harness();

    let min = get(&h.stream, GET_MIN, VS_PROBE);
    assert_eq!((min.format_index, min.frame_index, min.frame_interval), (1, 1, 333333));
    assert_eq!(get(&h.stream, GET_DEF, VS_PROBE), min);

    let max = get(&h.stream, GET_MAX, VS_PROBE);
    assert_eq!((max.format_index, max.frame_index, max.frame_interval), (1, 2, 666666));

    assert_eq!(get(&h.stream, GET_RES, VS_PROBE), StreamingControl::default());

    let len = h.stream.on_setup(request(GET_LEN, STREAMING_IF, VS_PROBE, 2)).unwrap();
    assert_eq!(len, Response::Data(vec![34, 0]));
    let info = h.stream.on_setup(request(GET_INFO, STREAMING_IF, VS_COMMIT, 1)).unwrap();
    assert_eq!(info, Response::Data(vec![0x03]));
}

#[test]
fn answer_is_truncated_to_request_length() {
    let h = harness();
    match h.stream.on_setup(request(GET_CUR, STREAMING_IF, VS_PROBE, 26)).unwrap() {
        Response::Data(data) => assert_eq!(data.len(), 26),
        other => panic!("unexpected response {other:?}"),
    }
}

#[test]
fn uvc_1_0_probe_is_accepted() {
    let h = harness();
    let response = h.stream.on_setup(request(SET_CUR, STREAMING_IF, VS_PROBE, 26)).unwrap();
    assert_eq!(response, Response::Receive(26));
    h.stream.on_data(&control(1, 2, 666666).to_vec()[..26]).unwrap();
    assert_eq!(get(&h.stream, GET_CUR, VS_PROBE).frame_index, 2);
}

#[test]
fn short_probe_data_is_rejected() {
    let h = harness();
    h.stream.on_setup(request(SET_CUR, STREAMING_IF, VS_PROBE, 10)).unwrap();
    assert!(h.stream.on_data(&[0; 10]).is_err());
    assert_eq!(h.stream.state(), StreamState::Idle);
    assert_eq!(h.stream.request_error_code(), RequestErrorCode::InvalidValue);
}

#[test]
fn short_probe_with_data_stage_is_invalid_value() {
    let h = harness();
    let probe = request(SET_CUR, STREAMING_IF, VS_PROBE, 10).with_data(vec![0; 10]);
    assert!(matches!(h.stream.on_setup(probe), Err(Error::Io(_))));
    assert_eq!(h.stream.state(), StreamState::Idle);
    assert_eq!(h.stream.request_error_code(), RequestErrorCode::InvalidValue);

    let code = h.stream.on_setup(request(GET_CUR, CONTROL_IF, VC_REQUEST_ERROR_CODE, 1)).unwrap();
    assert_eq!(code, Response::Data(vec![0x08]));

    let probe = request(SET_CUR, STREAMING_IF, VS_PROBE, 34).with_data(control(1, 2, 0).to_vec());
    assert_eq!(h.stream.on_setup(probe).unwrap(), Response::Receive(34));
    assert_eq!(h.stream.state(), StreamState::Negotiating);
    assert_eq!(h.stream.request_error_code(), RequestErrorCode::NoError);
}

#[test]
fn source_limits_frame_interval() {
    let function = UvcFunction::new(
        "/dev/video0",
        vec![FormatConfig::new(
            UvcFormat::Yuyv,
            vec![FrameConfig::new(640, 360, vec![333333]), FrameConfig::new(640, 480, vec![333333, 666666])],
        )],
    );
    let h = Harness::new(function, StreamConfig::new(), 16);
    h.source.borrow_mut().min_interval = Some(666666);

    set_cur(&h.stream, VS_PROBE, &control(1, 2, 333333)).unwrap();
    let probe = get(&h.stream, GET_CUR, VS_PROBE);
    assert_eq!((probe.format_index, probe.frame_index, probe.frame_interval), (1, 2, 666666));

    let asked = h.source.borrow().negotiated.last().copied().unwrap();
    assert_eq!((asked.width, asked.height, asked.interval), (640, 480, 333333));

    set_cur(&h.stream, VS_COMMIT, &probe).unwrap();
    let format = h.stream.committed_format().unwrap();
    assert_eq!((format.height, format.interval), (480, 666666));
}

#[test]
fn unsupported_controls_stall() {
    let h = harness();

    // Processing unit 2 brightness.
    let req = CtrlReq { request_type: 0xa1, request: GET_CUR, value: 0x0200, index: 0x0200, length: 2 };
    let unit = uvc_gadget::uvc::ControlRequest::decode(&req, CONTROL_IF, STREAMING_IF);
    assert!(matches!(h.stream.on_setup(unit), Err(Error::UnsupportedControl)));
    assert_eq!(h.stream.request_error_code(), RequestErrorCode::InvalidControl);

    assert!(matches!(
        h.stream.on_setup(request(GET_MIN, STREAMING_IF, VS_COMMIT, 34)),
        Err(Error::UnsupportedControl)
    ));
    assert!(matches!(h.stream.on_setup(request(0x42, STREAMING_IF, VS_PROBE, 34)), Err(Error::UnsupportedControl)));

    // A successful request clears the error code.
    get(&h.stream, GET_CUR, VS_PROBE);
    assert_eq!(h.stream.request_error_code(), RequestErrorCode::NoError);
}

#[test]
fn streaming_controls_rejected_while_streaming() {
    let h = harness();
    h.start(&control(1, 1, 333333));

    assert!(matches!(
        h.stream.on_setup(request(GET_CUR, STREAMING_IF, VS_PROBE, 34)),
        Err(Error::InvalidStateForControl)
    ));
    assert!(matches!(
        h.stream.on_setup(request(SET_CUR, STREAMING_IF, VS_PROBE, 34)),
        Err(Error::InvalidStateForControl)
    ));
    assert_eq!(h.stream.request_error_code(), RequestErrorCode::WrongState);

    // Video control interface requests are still served.
    assert_eq!(h.stream.on_setup(request(GET_CUR, CONTROL_IF, VC_REQUEST_ERROR_CODE, 1)).unwrap(), Response::Data(vec![2]));
}

#[test]
fn node_events_drive_negotiation() {
    let h = harness();
    let setup = |request: u8, selector: u8| {
        NodeEvent::Setup(CtrlReq {
            request_type: if request & 0x80 != 0 { 0xa1 } else { 0x21 },
            request,
            value: u16::from(selector) << 8,
            index: u16::from(STREAMING_IF),
            length: 34,
        })
    };

    {
        let mut node = h.node.borrow_mut();
        node.events.push_back(NodeEvent::Connect);
        node.events.push_back(setup(SET_CUR, VS_COMMIT));
        node.events.push_back(setup(SET_CUR, VS_PROBE));
        node.events.push_back(NodeEvent::Data(control(1, 2, 0).to_vec()));
        node.events.push_back(setup(GET_CUR, VS_PROBE));
    }
    h.stream.node_ready(Readiness::PRIORITY).unwrap();

    let node = h.node.borrow();
    assert!(node.events.is_empty());
    assert_eq!(node.responses.len(), 3);
    assert_eq!(node.responses[0], Response::Stall);
    assert_eq!(node.responses[1], Response::Receive(34));
    match &node.responses[2] {
        Response::Data(data) => assert_eq!(StreamingControl::parse(data).unwrap().frame_index, 2),
        other => panic!("unexpected response {other:?}"),
    }
    assert_eq!(h.stream.state(), StreamState::Negotiating);
}

#[test]
fn function_without_frames_is_rejected() {
    init();
    let events = uvc_gadget::Events::new().unwrap();
    let (node, _) = MockNode::new();
    let (source, _) = MockSource::new(0);
    let function = uvc_gadget::UvcFunction::new("/dev/video0", Vec::new());
    assert!(uvc_gadget::UvcStream::new(node, source, function, StreamConfig::new(), &events).is_err());
}
