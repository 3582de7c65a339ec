//! USB device controller (UDC).

use std::{
    ffi::{OsStr, OsString},
    fmt, fs,
    io::{Error, ErrorKind, Result},
    os::unix::prelude::OsStringExt,
    path::{Path, PathBuf},
};

use crate::trim_os_str;

/// USB device controller (UDC).
///
/// Call [`udcs`] to obtain the controllers available on the system.
#[derive(Clone)]
pub struct Udc {
    dir: PathBuf,
}

impl fmt::Debug for Udc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Udc").field("name", &self.name()).finish()
    }
}

impl Udc {
    /// Device controller in a UDC class directory.
    pub(crate) fn in_class(class_dir: &Path, name: impl AsRef<OsStr>) -> Self {
        Self { dir: class_dir.join(name.as_ref()) }
    }

    /// The name of the USB device controller.
    pub fn name(&self) -> &OsStr {
        self.dir.file_name().unwrap_or_default()
    }

    /// Whether the device controller exists.
    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    /// Indicates current state of the USB Device Controller.
    ///
    /// However not all USB Device Controllers support reporting all states.
    pub fn state(&self) -> Result<UdcState> {
        Ok(fs::read_to_string(self.dir.join("state"))?.trim().parse().unwrap_or_default())
    }

    /// Name of currently running USB Gadget Driver.
    pub fn function(&self) -> Result<Option<OsString>> {
        let data = OsString::from_vec(fs::read(self.dir.join("function"))?);
        let data = trim_os_str(&data);
        if data.is_empty() {
            Ok(None)
        } else {
            Ok(Some(data.to_os_string()))
        }
    }

    /// Device node of the video function bound to this controller.
    ///
    /// With a `function_name`, only a video device reporting the same function name matches.
    /// Otherwise the first video device of the gadget in alphabetical order is returned.
    pub fn video_node(&self, function_name: Option<&OsStr>) -> Result<PathBuf> {
        let device_dir = self.dir.join("device");
        let mut candidates = Vec::new();

        for gadget in fs::read_dir(&device_dir)? {
            let Ok(gadget) = gadget else { continue };
            if !gadget.file_name().as_encoded_bytes().starts_with(b"gadget") {
                continue;
            }

            let v4l_dir = gadget.path().join("video4linux");
            let Ok(entries) = fs::read_dir(&v4l_dir) else { continue };
            for entry in entries {
                let Ok(entry) = entry else { continue };
                if entry.file_name().as_encoded_bytes().starts_with(b"video") {
                    candidates.push(entry.path());
                }
            }
        }
        candidates.sort();

        for candidate in candidates {
            if let Some(function_name) = function_name {
                let Ok(name) = fs::read(candidate.join("function_name")) else { continue };
                if trim_os_str(&OsString::from_vec(name)) != function_name {
                    continue;
                }
            }

            let Some(name) = candidate.file_name() else { continue };
            log::debug!("UDC {} has video device {}", self.name().to_string_lossy(), name.to_string_lossy());
            return Ok(Path::new("/dev").join(name));
        }

        Err(Error::new(ErrorKind::NotFound, "no video device found for UDC"))
    }
}

/// USB device controller (UDC) connection state.
#[derive(
    Default, Debug, strum::Display, strum::EnumString, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[non_exhaustive]
pub enum UdcState {
    /// Not attached.
    #[strum(serialize = "not attached")]
    NotAttached,
    /// Attached.
    #[strum(serialize = "attached")]
    Attached,
    /// Powered.
    #[strum(serialize = "powered")]
    Powered,
    /// Reconnecting.
    #[strum(serialize = "reconnecting")]
    Reconnecting,
    /// Unauthenticated.
    #[strum(serialize = "unauthenticated")]
    Unauthenticated,
    /// Default.
    #[strum(serialize = "default")]
    Default,
    /// Addressed.
    #[strum(serialize = "addressed")]
    Addressed,
    /// Configured.
    #[strum(serialize = "configured")]
    Configured,
    /// Suspended.
    #[strum(serialize = "suspended")]
    Suspended,
    /// Unknown state.
    #[default]
    #[strum(serialize = "UNKNOWN")]
    Unknown,
}

/// Directory of the UDC class in sysfs.
pub(crate) const UDC_CLASS_DIR: &str = "/sys/class/udc";

/// Gets the available USB device controllers (UDCs) in the system.
pub fn udcs() -> Result<Vec<Udc>> {
    let class_dir = Path::new("/sys/class");
    if !class_dir.is_dir() {
        return Err(Error::new(ErrorKind::NotFound, "sysfs is not available"));
    }

    let udc_dir = Path::new(UDC_CLASS_DIR);
    if !udc_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut udcs = Vec::new();
    for entry in fs::read_dir(udc_dir)? {
        let Ok(entry) = entry else { continue };
        udcs.push(Udc { dir: entry.path() });
    }
    udcs.sort_by_key(|udc| udc.name().to_os_string());

    Ok(udcs)
}
