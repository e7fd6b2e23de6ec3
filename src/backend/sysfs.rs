//! Legacy sysfs GPIO backend (`gpio<N>`).

use std::ffi::CString;
use std::fs::{self, File};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::debug;

use super::{Edges, EventSource, parse_decimal};
use crate::error::GatewayError;
use crate::registry::Registry;

pub const PIN_PREFIX: &str = "gpio";

const EXPORT_RETRIES: usize = 10;
const EXPORT_RETRY_DELAY: Duration = Duration::from_millis(50);

pub struct SysfsPin {
    name: String,
    number: u32,
    root: PathBuf,
    base: PathBuf,
    value: Option<File>,
}

impl SysfsPin {
    pub fn recognize(name: &str) -> bool {
        name.starts_with(PIN_PREFIX) && !name.starts_with(super::chardev::PIN_PREFIX)
    }

    pub fn create(name: &str, registry: &Registry) -> Result<Self, GatewayError> {
        let number = parse_name(name)?;
        let mut pin = Self::at(name, number, &registry.settings().sysfs_root);
        pin.export()?;
        Ok(pin)
    }

    fn at(name: &str, number: u32, root: &Path) -> Self {
        Self {
            name: name.to_string(),
            number,
            root: root.to_path_buf(),
            base: root.join(format!("gpio{number}")),
            value: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests the kernel to export the pin unless it already is, then waits
    /// for the device directory to become accessible.
    pub fn export(&mut self) -> Result<(), GatewayError> {
        if self.base.is_dir() {
            return Ok(());
        }

        let export = self.root.join("export");
        fs::write(&export, self.number.to_string())
            .map_err(|e| GatewayError::protocol(format!("write {}", export.display()), e))?;

        // udev populates the node asynchronously after the export write
        for attempt in 0..EXPORT_RETRIES {
            if accessible(&self.base) {
                return Ok(());
            }
            debug!("{}: waiting for export (attempt {})", self.name, attempt + 1);
            thread::sleep(EXPORT_RETRY_DELAY);
        }

        Err(GatewayError::protocol(
            format!("export {}", self.name),
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("{} not accessible", self.base.display()),
            ),
        ))
    }

    pub fn unexport(&mut self) -> Result<(), GatewayError> {
        if !self.base.is_dir() {
            return Ok(());
        }

        self.value = None;
        let unexport = self.root.join("unexport");
        fs::write(&unexport, self.number.to_string())
            .map_err(|e| GatewayError::protocol(format!("write {}", unexport.display()), e))?;

        if self.base.is_dir() {
            return Err(GatewayError::protocol(
                format!("unexport {}", self.name),
                std::io::Error::other("directory still present"),
            ));
        }
        Ok(())
    }

    fn write_attr(&self, attr: &str, value: &str) -> Result<(), GatewayError> {
        let path = self.base.join(attr);
        fs::write(&path, value)
            .map_err(|e| GatewayError::protocol(format!("write {}", path.display()), e))
    }

    fn read_attr(&self, attr: &str) -> Result<String, GatewayError> {
        let path = self.base.join(attr);
        fs::read_to_string(&path)
            .map(|v| v.trim().to_string())
            .map_err(|e| GatewayError::protocol(format!("read {}", path.display()), e))
    }

    pub fn set_input(&mut self) -> Result<(), GatewayError> {
        self.write_attr("direction", "in")
    }

    pub fn set_output(&mut self) -> Result<(), GatewayError> {
        self.write_attr("direction", "out")
    }

    pub fn is_input(&self) -> Result<bool, GatewayError> {
        Ok(self.read_attr("direction")? == "in")
    }

    pub fn set_active_low(&mut self) -> Result<(), GatewayError> {
        self.write_attr("active_low", "1")
    }

    pub fn is_active_low(&self) -> Result<bool, GatewayError> {
        Ok(self.read_attr("active_low")? == "1")
    }

    pub fn read_bool(&self) -> Result<bool, GatewayError> {
        parse_level(&self.name, &self.read_attr("value")?)
    }

    pub fn write_bool(&self, value: bool) -> Result<(), GatewayError> {
        self.write_attr("value", if value { "1" } else { "0" })
    }

    pub fn arm_edges(&mut self, rising: bool, falling: bool) -> Result<EventSource, GatewayError> {
        let edge = match (rising, falling) {
            (true, false) => "rising",
            (false, true) => "falling",
            (true, true) => "both",
            (false, false) => {
                return Err(GatewayError::Config(format!(
                    "{}: no edge requested",
                    self.name
                )));
            }
        };
        self.write_attr("edge", edge)?;

        let path = self.base.join("value");
        let file = File::open(&path)
            .map_err(|e| GatewayError::protocol(format!("open {}", path.display()), e))?;
        // consume the current state so the first notification is a real change
        read_value_at(&file, &self.name)?;

        let fd = file.as_raw_fd();
        self.value = Some(file);
        Ok(EventSource {
            fd,
            interest: (libc::EPOLLPRI | libc::EPOLLERR | libc::EPOLLET) as u32,
        })
    }

    /// Best effort: the kernel reports only that the value changed, so the
    /// direction is inferred from the level read back afterwards.
    pub fn identify_edge(&mut self) -> Result<Edges, GatewayError> {
        let file = self.value.as_ref().ok_or_else(|| {
            GatewayError::Config(format!("{} is not armed for events", self.name))
        })?;
        let level = parse_level(&self.name, &read_value_at(file, &self.name)?)?;
        debug!("{}: change notified, now {}", self.name, u8::from(level));

        Ok(if level { Edges::RISING } else { Edges::FALLING })
    }
}

fn read_value_at(file: &File, name: &str) -> Result<String, GatewayError> {
    let mut buf = [0u8; 8];
    let n = file
        .read_at(&mut buf, 0)
        .map_err(|e| GatewayError::protocol(format!("read {name} value"), e))?;
    Ok(String::from_utf8_lossy(&buf[..n]).trim().to_string())
}

fn parse_level(name: &str, text: &str) -> Result<bool, GatewayError> {
    match text {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(GatewayError::protocol(
            format!("read {name}"),
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unexpected value {other:?}"),
            ),
        )),
    }
}

fn accessible(path: &Path) -> bool {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string for the call's duration.
    unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::W_OK | libc::X_OK) == 0 }
}

fn parse_name(name: &str) -> Result<u32, GatewayError> {
    let number = name
        .strip_prefix(PIN_PREFIX)
        .ok_or_else(|| GatewayError::UnrecognizedPin(name.to_string()))?;
    parse_decimal(name, "pin number", number)
}
