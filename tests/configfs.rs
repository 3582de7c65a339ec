mod common;
use common::init;

use std::{
    fs,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

use uvc_gadget::{Error, StreamingEndpoint, UvcFormat, UvcFunction};

/// Fake configfs mount and sysfs UDC class directory.
struct Tree {
    _dir: TempDir,
    configfs: PathBuf,
    udc_class: PathBuf,
}

fn write(path: &Path, contents: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

impl Tree {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let configfs = dir.path().join("config");
        let udc_class = dir.path().join("udc");
        fs::create_dir_all(configfs.join("usb_gadget")).unwrap();
        fs::create_dir_all(&udc_class).unwrap();
        Self { _dir: dir, configfs, udc_class }
    }

    fn gadget(&self, gadget: &str, udc: &str) {
        write(&self.configfs.join("usb_gadget").join(gadget).join("UDC"), &format!("{udc}\n"));
    }

    fn uvc(&self, gadget: &str, function: &str) -> PathBuf {
        let dir = self.configfs.join("usb_gadget").join(gadget).join("functions").join(function);
        write(&dir.join("function_name"), &format!("{function}\n"));
        write(&dir.join("control/bInterfaceNumber"), "0\n");
        write(&dir.join("streaming/bInterfaceNumber"), "1\n");
        write(&dir.join("streaming_maxpacket"), "1024\n");
        write(&dir.join("streaming_maxburst"), "0\n");
        write(&dir.join("streaming_interval"), "1\n");
        dir
    }

    fn format(&self, function: &Path, group: &str, name: &str, index: u8) -> PathBuf {
        let dir = function.join("streaming").join(group).join(name);
        write(&dir.join("bFormatIndex"), &format!("{index}\n"));
        dir
    }

    fn frame(&self, format: &Path, name: &str, index: u8, width: u32, height: u32, intervals: &[u32]) {
        let dir = format.join(name);
        let intervals: Vec<_> = intervals.iter().map(|i| i.to_string()).collect();
        write(&dir.join("bFrameIndex"), &format!("{index}\n"));
        write(&dir.join("wWidth"), &format!("{width}\n"));
        write(&dir.join("wHeight"), &format!("{height}\n"));
        write(&dir.join("dwMaxVideoFrameBufferSize"), &format!("{}\n", width * height * 2));
        write(&dir.join("dwFrameInterval"), &format!("{}\n", intervals.join("\n")));
    }

    /// Video device of a gadget bound to `udc`.
    fn video(&self, udc: &str, video: &str, function_name: Option<&str>) {
        let dir = self.udc_class.join(udc).join("device/gadget.0/video4linux").join(video);
        fs::create_dir_all(&dir).unwrap();
        if let Some(name) = function_name {
            write(&dir.join("function_name"), &format!("{name}\n"));
        }
    }

    fn resolve(&self, specifier: Option<&str>) -> uvc_gadget::Result<UvcFunction> {
        UvcFunction::resolve_in(Some(&self.configfs), &self.udc_class, specifier)
    }
}

/// Gadget `g1` on UDC `dummy_udc.0` with functions `uvc.0` and `uvc.1`.
fn webcam() -> Tree {
    init();
    let tree = Tree::new();
    tree.gadget("g1", "dummy_udc.0");

    let uvc0 = tree.uvc("g1", "uvc.0");
    let mjpeg = tree.format(&uvc0, "mjpeg", "m", 2);
    tree.frame(&mjpeg, "720p", 1, 1280, 720, &[333333]);
    let yuyv = tree.format(&uvc0, "uncompressed", "u", 1);
    tree.frame(&yuyv, "480p", 2, 640, 480, &[666666, 333333]);
    tree.frame(&yuyv, "360p", 1, 640, 360, &[333333]);

    let uvc1 = tree.uvc("g1", "uvc.1");
    let yuyv = tree.format(&uvc1, "uncompressed", "u", 1);
    tree.frame(&yuyv, "360p", 1, 640, 360, &[333333]);
    write(&uvc1.join("streaming_maxburst"), "2\n");

    tree.video("dummy_udc.0", "video0", Some("uvc.0"));
    tree.video("dummy_udc.0", "video1", Some("uvc.1"));
    tree
}

#[test]
fn default_function() {
    let tree = webcam();
    let func = tree.resolve(None).unwrap();

    assert_eq!(func.name, "g1/functions/uvc.0");
    assert_eq!(func.video, Path::new("/dev/video0"));
    assert_eq!((func.control_interface, func.streaming_interface), (0, 1));
    assert_eq!(func.streaming, StreamingEndpoint { maxpacket: 1024, maxburst: 0, interval: 1 });

    let formats: Vec<_> = func.formats.iter().map(|f| (f.index, f.format)).collect();
    assert_eq!(formats, vec![(1, UvcFormat::Yuyv), (2, UvcFormat::Mjpeg)]);

    let yuyv = func.format(1).unwrap();
    let frames: Vec<_> = yuyv.frames.iter().map(|f| (f.index, f.width, f.height)).collect();
    assert_eq!(frames, vec![(1, 640, 360), (2, 640, 480)]);
    assert_eq!(yuyv.frame(2).unwrap().intervals, vec![333333, 666666]);
    assert_eq!(yuyv.frame(2).unwrap().max_video_frame_buffer_size, 614400);
}

#[test]
fn function_by_name() {
    let tree = webcam();
    let func = tree.resolve(Some("uvc.1")).unwrap();

    assert_eq!(func.name, "g1/functions/uvc.1");
    assert_eq!(func.video, Path::new("/dev/video1"));
    assert_eq!(func.streaming.max_payload_transfer_size(), 3072);
    assert_eq!(func.formats.len(), 1);
}

#[test]
fn function_by_path() {
    let tree = webcam();
    let func = tree.resolve(Some("g1/functions/uvc.1")).unwrap();
    assert_eq!(func.video, Path::new("/dev/video1"));

    assert!(matches!(tree.resolve(Some("g1/functions/uvc.7")), Err(Error::FunctionNotFound(_))));
    assert!(matches!(tree.resolve(Some("g1/functions/ecm.0")), Err(Error::FunctionNotFound(_))));
}

#[test]
fn ambiguous_name() {
    let tree = webcam();
    tree.gadget("g2", "dummy_udc.1");
    tree.uvc("g2", "uvc.0");

    assert!(matches!(tree.resolve(Some("uvc.0")), Err(Error::FunctionNotFound(_))));
    assert_eq!(tree.resolve(Some("g2/functions/uvc.1")).ok(), None);
}

#[test]
fn unbound_gadget() {
    init();
    let tree = Tree::new();
    tree.gadget("g1", "");
    tree.uvc("g1", "uvc.0");

    match tree.resolve(None) {
        Err(Error::FunctionNotFound(msg)) => assert!(msg.contains("not bound")),
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn legacy_gadget() {
    init();
    let tree = Tree::new();
    tree.video("musb-hdrc.0", "video3", None);
    write(&tree.udc_class.join("musb-hdrc.0/function"), "g_webcam\n");

    let func = tree.resolve(Some("musb-hdrc.0")).unwrap();
    assert_eq!(func, UvcFunction::legacy("musb-hdrc.0", "/dev/video3"));

    assert!(matches!(tree.resolve(Some("musb-hdrc.1")), Err(Error::FunctionNotFound(_))));
    assert!(matches!(tree.resolve(None), Err(Error::FunctionNotFound(_))));
}

#[test]
fn without_configfs() {
    init();
    let tree = Tree::new();
    tree.video("musb-hdrc.0", "video0", None);

    let func = UvcFunction::resolve_in(None, &tree.udc_class, Some("musb-hdrc.0")).unwrap();
    assert_eq!(func.video, Path::new("/dev/video0"));
    assert!(matches!(UvcFunction::resolve_in(None, &tree.udc_class, None), Err(Error::FunctionNotFound(_))));
}
