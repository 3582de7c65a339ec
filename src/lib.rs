//! This library implements the device side of the **USB Video Class (UVC)** for
//! USB gadgets on Linux devices that have a USB device controller (UDC).
//!
//! It answers the control requests of the USB host, negotiates the streaming
//! parameters through UVC Probe/Commit and pumps video frames from a pluggable
//! [video source](source::VideoSource) into UVC payloads of the gadget's video
//! function node.
//!
//! ### Requirements
//!
//! The Linux kernel configuration options `CONFIG_USB_GADGET`, `CONFIG_USB_CONFIGFS`
//! and `CONFIG_USB_CONFIGFS_F_UVC` (or the legacy `g_webcam` module) need to be enabled.
//! The UVC function must already be described and bound to a UDC; this library
//! does not author USB descriptors.
//!
//! ### Usage
//!
//! Resolve the function with [`UvcFunction::resolve`], open its video node with
//! [`node::UvcDevice::open`], pick a [video source](source) and hand everything to
//! [`UvcStream::new`]. Then drive the [`Events`] loop until it is stopped.
//!
//! Everything runs on the thread calling [`Events::run`]; only the [`StopHandle`]
//! may be used from other threads or signal handlers.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

#[cfg(not(target_os = "linux"))]
compile_error!("uvc_gadget only supports Linux");

use proc_mounts::MountIter;
use std::{
    ffi::OsStr,
    io::{Error as IoError, ErrorKind, Result as IoResult},
    os::unix::prelude::OsStrExt,
    path::PathBuf,
};

mod error;
pub use error::*;

pub mod buffer;
pub mod events;
pub use events::{Events, Interest, Readiness, StopHandle};

mod configfs;
pub use configfs::*;

mod udc;
pub use udc::*;

pub mod node;
pub mod source;

mod stream;
pub use stream::*;

pub mod uvc;
mod v4l2;

/// Returns where configfs is mounted.
fn configfs_dir() -> IoResult<PathBuf> {
    for mount in MountIter::new()? {
        let Ok(mount) = mount else { continue };
        if mount.fstype == "configfs" {
            return Ok(mount.dest);
        }
    }

    Err(IoError::new(ErrorKind::NotFound, "configfs is not mounted"))
}

/// Trims an OsStr.
fn trim_os_str(value: &OsStr) -> &OsStr {
    let mut value = value.as_bytes();

    while value.first() == Some(&b'\n') || value.first() == Some(&b' ') || value.first() == Some(&b'\0') {
        value = &value[1..];
    }

    while value.last() == Some(&b'\n') || value.last() == Some(&b' ') || value.last() == Some(&b'\0') {
        value = &value[..value.len() - 1];
    }

    OsStr::from_bytes(value)
}

#[cfg(test)]
mod test {
    use std::ffi::OsStr;

    #[test]
    fn trim_os_str() {
        assert_eq!(super::trim_os_str(OsStr::new("  musb-hdrc.0\n\0")), OsStr::new("musb-hdrc.0"));
        assert_eq!(super::trim_os_str(OsStr::new("\n")), OsStr::new(""));
    }
}
