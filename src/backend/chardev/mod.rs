//! GPIO character device backend (`gpiochip<C>:<O>`).

pub mod uapi;

use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use self::uapi::{
    ChipInfo, EVENT_DATA_SIZE, EventRecord, EventRequest, HandleRequest, LineInfo,
    GPIOEVENT_EVENT_FALLING_EDGE, GPIOEVENT_EVENT_RISING_EDGE, GPIOEVENT_REQUEST_FALLING_EDGE,
    GPIOEVENT_REQUEST_RISING_EDGE, GPIOHANDLE_REQUEST_ACTIVE_LOW, GPIOHANDLE_REQUEST_INPUT,
    GPIOHANDLE_REQUEST_OUTPUT,
};
use super::{EdgeDebouncer, Edges, EventSource, MIN_DEBOUNCE, parse_decimal};
use crate::error::GatewayError;
use crate::registry::Registry;

pub const PIN_PREFIX: &str = "gpiochip";

/// How request flags are derived when a line is (re)requested.
///
/// A chip picks one variant when it is opened and every pin on it uses that
/// variant for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiVariant {
    /// Flags are tracked by the pin and carried verbatim in each request.
    HandleFlags,
    /// Current flags are fetched with line-info and merged with the change.
    LineInfoMerge,
}

impl AbiVariant {
    pub fn merge(self, tracked: u32, line: Option<&LineInfo>, set: u32, clear: u32) -> u32 {
        let base = match (self, line) {
            (AbiVariant::LineInfoMerge, Some(info)) => info.request_flags(),
            _ => tracked,
        };
        (base & !clear) | set
    }
}

pub struct GpioChip {
    file: File,
    info: ChipInfo,
    abi: AbiVariant,
}

impl GpioChip {
    pub fn open(path: &Path) -> Result<Self, GatewayError> {
        let file = File::open(path)
            .map_err(|e| GatewayError::protocol(format!("open {}", path.display()), e))?;

        let mut buf = [0u8; uapi::CHIP_INFO_SIZE];
        uapi::ioctl_buf(file.as_raw_fd(), uapi::GPIO_GET_CHIPINFO_IOCTL, &mut buf)
            .map_err(|e| GatewayError::protocol(format!("chip info {}", path.display()), e))?;
        let info = ChipInfo::decode(&buf);

        let mut chip = Self {
            file,
            info,
            abi: AbiVariant::HandleFlags,
        };
        if chip.info.lines > 0 && chip.line_info(0).is_ok() {
            chip.abi = AbiVariant::LineInfoMerge;
        }
        Ok(chip)
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn label(&self) -> &str {
        &self.info.label
    }

    pub fn lines(&self) -> u32 {
        self.info.lines
    }

    pub fn abi(&self) -> AbiVariant {
        self.abi
    }

    pub fn line_info(&self, offset: u32) -> Result<LineInfo, GatewayError> {
        let mut buf = LineInfo::request(offset);
        uapi::ioctl_buf(self.file.as_raw_fd(), uapi::GPIO_GET_LINEINFO_IOCTL, &mut buf)
            .map_err(|e| GatewayError::protocol(format!("line info {}:{offset}", self.name()), e))?;
        Ok(LineInfo::decode(&buf))
    }

    pub fn request_handle(
        &self,
        offset: u32,
        flags: u32,
        consumer: &str,
    ) -> Result<OwnedFd, GatewayError> {
        let mut buf = HandleRequest {
            offsets: &[offset],
            flags,
            defaults: &[0],
            consumer,
        }
        .encode();
        uapi::ioctl_buf(self.file.as_raw_fd(), uapi::GPIO_GET_LINEHANDLE_IOCTL, &mut buf).map_err(
            |e| GatewayError::protocol(format!("line handle {}:{offset}", self.name()), e),
        )?;
        adopt_fd(HandleRequest::decode_fd(&buf), "line handle")
    }

    pub fn request_events(
        &self,
        offset: u32,
        handle_flags: u32,
        event_flags: u32,
        consumer: &str,
    ) -> Result<OwnedFd, GatewayError> {
        let mut buf = EventRequest {
            offset,
            handle_flags,
            event_flags,
            consumer,
        }
        .encode();
        uapi::ioctl_buf(self.file.as_raw_fd(), uapi::GPIO_GET_LINEEVENT_IOCTL, &mut buf).map_err(
            |e| GatewayError::protocol(format!("line event {}:{offset}", self.name()), e),
        )?;
        adopt_fd(EventRequest::decode_fd(&buf), "line event")
    }
}

fn adopt_fd(fd: RawFd, what: &str) -> Result<OwnedFd, GatewayError> {
    if fd <= 0 {
        return Err(GatewayError::protocol(
            what,
            std::io::Error::other(format!("kernel returned fd {fd}")),
        ));
    }
    // SAFETY: a successful request ioctl hands us sole ownership of this fd.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// The single kernel resource a chardev pin holds at any time.
enum LineResource {
    Released,
    Handle(File),
    Events(File),
}

impl LineResource {
    fn file(&self) -> Option<&File> {
        match self {
            LineResource::Released => None,
            LineResource::Handle(f) | LineResource::Events(f) => Some(f),
        }
    }
}

pub struct ChardevPin {
    name: String,
    chip: Arc<GpioChip>,
    offset: u32,
    flags: u32,
    consumer: String,
    line: LineResource,
    debouncer: EdgeDebouncer,
}

impl ChardevPin {
    pub fn recognize(name: &str) -> bool {
        name.starts_with(PIN_PREFIX)
    }

    pub fn create(name: &str, registry: &Registry) -> Result<Self, GatewayError> {
        let (chip_no, offset) = parse_name(name)?;
        let chip = registry.gpio_chip(chip_no)?;
        let consumer = registry.settings().consumer.clone();

        let line_info = match chip.abi() {
            AbiVariant::LineInfoMerge => Some(chip.line_info(offset)?),
            AbiVariant::HandleFlags => None,
        };
        let flags = chip.abi().merge(0, line_info.as_ref(), 0, 0);
        let handle = chip.request_handle(offset, flags, &consumer)?;
        info!("Requested {name} with flags {flags:#x}");

        Ok(Self {
            name: name.to_string(),
            chip,
            offset,
            flags,
            consumer,
            line: LineResource::Handle(File::from(handle)),
            debouncer: EdgeDebouncer::new(MIN_DEBOUNCE),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_output(&self) -> bool {
        self.flags & GPIOHANDLE_REQUEST_OUTPUT != 0
    }

    pub fn is_active_low(&self) -> bool {
        self.flags & GPIOHANDLE_REQUEST_ACTIVE_LOW != 0
    }

    pub fn set_input(&mut self) -> Result<(), GatewayError> {
        self.twiddle_flags(GPIOHANDLE_REQUEST_INPUT, GPIOHANDLE_REQUEST_OUTPUT)
    }

    pub fn set_output(&mut self) -> Result<(), GatewayError> {
        self.twiddle_flags(GPIOHANDLE_REQUEST_OUTPUT, GPIOHANDLE_REQUEST_INPUT)
    }

    pub fn set_active_low(&mut self) -> Result<(), GatewayError> {
        self.twiddle_flags(GPIOHANDLE_REQUEST_ACTIVE_LOW, 0)
    }

    pub fn set_debounce(&mut self, window: Duration) -> Result<(), GatewayError> {
        self.debouncer = EdgeDebouncer::checked(window)?;
        Ok(())
    }

    pub fn read_bool(&self) -> Result<bool, GatewayError> {
        let mut buf = [0u8; uapi::HANDLE_DATA_SIZE];
        uapi::ioctl_buf(
            self.line_fd()?,
            uapi::GPIOHANDLE_GET_LINE_VALUES_IOCTL,
            &mut buf,
        )
        .map_err(|e| GatewayError::protocol(format!("read {}", self.name), e))?;
        Ok(buf[0] != 0)
    }

    pub fn write_bool(&self, value: bool) -> Result<(), GatewayError> {
        let mut buf = uapi::encode_values(&[u8::from(value)]);
        uapi::ioctl_buf(
            self.line_fd()?,
            uapi::GPIOHANDLE_SET_LINE_VALUES_IOCTL,
            &mut buf,
        )
        .map_err(|e| GatewayError::protocol(format!("write {}", self.name), e))
    }

    pub fn arm_edges(&mut self, rising: bool, falling: bool) -> Result<EventSource, GatewayError> {
        let mut event_flags = 0;
        if rising {
            event_flags |= GPIOEVENT_REQUEST_RISING_EDGE;
        }
        if falling {
            event_flags |= GPIOEVENT_REQUEST_FALLING_EDGE;
        }

        self.line = LineResource::Released;
        let fd = self
            .chip
            .request_events(self.offset, self.flags, event_flags, &self.consumer)?;
        let file = File::from(fd);
        let raw = file.as_raw_fd();
        self.line = LineResource::Events(file);

        Ok(EventSource {
            fd: raw,
            interest: libc::EPOLLIN as u32,
        })
    }

    pub fn identify_edge(&mut self) -> Result<Edges, GatewayError> {
        let file = match &self.line {
            LineResource::Events(f) => f,
            _ => {
                return Err(GatewayError::Config(format!(
                    "{} is not armed for events",
                    self.name
                )));
            }
        };

        let mut buf = [0u8; EVENT_DATA_SIZE];
        let n = (&*file)
            .read(&mut buf)
            .map_err(|e| GatewayError::protocol(format!("event read {}", self.name), e))?;
        GatewayError::check_transfer("event read", EVENT_DATA_SIZE, n)?;

        let edges = classify_event(EventRecord::decode(&buf), &mut self.debouncer);
        if edges.is_none() {
            debug!("{}: edge suppressed by debounce", self.name);
        }
        Ok(edges)
    }

    fn line_fd(&self) -> Result<RawFd, GatewayError> {
        self.line.file().map(|f| f.as_raw_fd()).ok_or_else(|| {
            GatewayError::protocol(
                format!("{} has no line resource", self.name),
                std::io::Error::from_raw_os_error(libc::EBADF),
            )
        })
    }

    /// Re-requests the line with updated flags, closing the previous request
    /// first since the kernel allows only one per line.
    fn twiddle_flags(&mut self, set: u32, clear: u32) -> Result<(), GatewayError> {
        let line_info = match self.chip.abi() {
            AbiVariant::LineInfoMerge => Some(self.chip.line_info(self.offset)?),
            AbiVariant::HandleFlags => None,
        };
        self.flags = self
            .chip
            .abi()
            .merge(self.flags, line_info.as_ref(), set, clear);

        self.line = LineResource::Released;
        let fd = self
            .chip
            .request_handle(self.offset, self.flags, &self.consumer)?;
        self.line = LineResource::Handle(File::from(fd));
        Ok(())
    }
}

/// Turns a kernel event record into edge flags, applying the debounce window.
pub fn classify_event(record: EventRecord, debouncer: &mut EdgeDebouncer) -> Edges {
    if !debouncer.accept(record.timestamp_ns) {
        return Edges::default();
    }

    if record.id & GPIOEVENT_EVENT_RISING_EDGE != 0 {
        Edges::RISING
    } else if record.id & GPIOEVENT_EVENT_FALLING_EDGE != 0 {
        Edges::FALLING
    } else {
        Edges::default()
    }
}

fn parse_name(name: &str) -> Result<(u32, u32), GatewayError> {
    let rest = name
        .strip_prefix(PIN_PREFIX)
        .ok_or_else(|| GatewayError::UnrecognizedPin(name.to_string()))?;
    let (chip, offset) = rest
        .split_once(':')
        .ok_or_else(|| GatewayError::invalid_pin(name, "expected gpiochip<chip>:<offset>"))?;
    Ok((
        parse_decimal(name, "chip number", chip)?,
        parse_decimal(name, "line offset", offset)?,
    ))
}
