//! Fixed-layout payloads of the GPIO character device ioctls (linux/gpio.h, v1 ABI).
//!
//! Every struct is packed and unpacked field by field at documented byte
//! offsets in native endianness; nothing relies on Rust struct layout.

use std::io;
use std::os::fd::RawFd;

pub const GPIOHANDLES_MAX: usize = 64;
const NAME_LEN: usize = 32;

pub const GPIOLINE_FLAG_KERNEL: u32 = 1 << 0;
pub const GPIOLINE_FLAG_IS_OUT: u32 = 1 << 1;
pub const GPIOLINE_FLAG_ACTIVE_LOW: u32 = 1 << 2;
pub const GPIOLINE_FLAG_OPEN_DRAIN: u32 = 1 << 3;
pub const GPIOLINE_FLAG_OPEN_SOURCE: u32 = 1 << 4;

pub const GPIOHANDLE_REQUEST_INPUT: u32 = 1 << 0;
pub const GPIOHANDLE_REQUEST_OUTPUT: u32 = 1 << 1;
pub const GPIOHANDLE_REQUEST_ACTIVE_LOW: u32 = 1 << 2;
pub const GPIOHANDLE_REQUEST_OPEN_DRAIN: u32 = 1 << 3;
pub const GPIOHANDLE_REQUEST_OPEN_SOURCE: u32 = 1 << 4;

pub const GPIOEVENT_REQUEST_RISING_EDGE: u32 = 1 << 0;
pub const GPIOEVENT_REQUEST_FALLING_EDGE: u32 = 1 << 1;

pub const GPIOEVENT_EVENT_RISING_EDGE: u32 = 0x01;
pub const GPIOEVENT_EVENT_FALLING_EDGE: u32 = 0x02;

/// struct gpiochip_info: name[32] @0, label[32] @32, lines u32 @64.
pub const CHIP_INFO_SIZE: usize = 68;
/// struct gpioline_info: line_offset @0, flags @4, name[32] @8, consumer[32] @40.
pub const LINE_INFO_SIZE: usize = 72;
/// struct gpiohandle_request: lineoffsets[64] @0, flags @256,
/// default_values[64] @260, consumer_label[32] @324, lines @356, fd @360.
pub const HANDLE_REQUEST_SIZE: usize = 364;
/// struct gpiohandle_data: values[64] @0.
pub const HANDLE_DATA_SIZE: usize = 64;
/// struct gpioevent_request: lineoffset @0, handleflags @4, eventflags @8,
/// consumer_label[32] @12, fd @44.
pub const EVENT_REQUEST_SIZE: usize = 48;
/// struct gpioevent_data: timestamp u64 @0, id u32 @8, padding u32 @12.
pub const EVENT_DATA_SIZE: usize = 16;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;
const GPIO_IOC_MAGIC: u32 = 0xB4;

/// Standard Linux ioctl command encoding: dir[31:30] size[29:16] type[15:8] nr[7:0].
pub const fn ioc(dir: u32, ty: u32, nr: u32, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | (ty << 8) | nr
}

pub const GPIO_GET_CHIPINFO_IOCTL: u32 = ioc(IOC_READ, GPIO_IOC_MAGIC, 0x01, CHIP_INFO_SIZE);
pub const GPIO_GET_LINEINFO_IOCTL: u32 =
    ioc(IOC_READ | IOC_WRITE, GPIO_IOC_MAGIC, 0x02, LINE_INFO_SIZE);
pub const GPIO_GET_LINEHANDLE_IOCTL: u32 =
    ioc(IOC_READ | IOC_WRITE, GPIO_IOC_MAGIC, 0x03, HANDLE_REQUEST_SIZE);
pub const GPIO_GET_LINEEVENT_IOCTL: u32 =
    ioc(IOC_READ | IOC_WRITE, GPIO_IOC_MAGIC, 0x04, EVENT_REQUEST_SIZE);
pub const GPIOHANDLE_GET_LINE_VALUES_IOCTL: u32 =
    ioc(IOC_READ | IOC_WRITE, GPIO_IOC_MAGIC, 0x08, HANDLE_DATA_SIZE);
pub const GPIOHANDLE_SET_LINE_VALUES_IOCTL: u32 =
    ioc(IOC_READ | IOC_WRITE, GPIO_IOC_MAGIC, 0x09, HANDLE_DATA_SIZE);

/// Issues an ioctl whose argument is a pointer to `buf`.
pub fn ioctl_buf(fd: RawFd, request: u32, buf: &mut [u8]) -> io::Result<()> {
    // SAFETY: every request used with this helper is encoded with the exact
    // size of `buf`, so the kernel never touches memory past its end.
    let rc = unsafe { libc::ioctl(fd, request as _, buf.as_mut_ptr()) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[at..at + 4]);
    u32::from_ne_bytes(word)
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_ne_bytes());
}

fn get_str(buf: &[u8], at: usize) -> String {
    let field = &buf[at..at + NAME_LEN];
    let end = field.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Copies a label into a NUL-terminated 32-byte field, truncating if needed.
fn put_str(buf: &mut [u8], at: usize, value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(NAME_LEN - 1);
    buf[at..at + len].copy_from_slice(&bytes[..len]);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipInfo {
    pub name: String,
    pub label: String,
    pub lines: u32,
}

impl ChipInfo {
    pub fn decode(buf: &[u8; CHIP_INFO_SIZE]) -> Self {
        Self {
            name: get_str(buf, 0),
            label: get_str(buf, 32),
            lines: get_u32(buf, 64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInfo {
    pub offset: u32,
    pub flags: u32,
    pub name: String,
    pub consumer: String,
}

impl LineInfo {
    pub fn request(offset: u32) -> [u8; LINE_INFO_SIZE] {
        let mut buf = [0u8; LINE_INFO_SIZE];
        put_u32(&mut buf, 0, offset);
        buf
    }

    pub fn decode(buf: &[u8; LINE_INFO_SIZE]) -> Self {
        Self {
            offset: get_u32(buf, 0),
            flags: get_u32(buf, 4),
            name: get_str(buf, 8),
            consumer: get_str(buf, 40),
        }
    }

    /// Translates informational line flags into the equivalent request flags.
    pub fn request_flags(&self) -> u32 {
        let mut flags = if self.flags & GPIOLINE_FLAG_IS_OUT != 0 {
            GPIOHANDLE_REQUEST_OUTPUT
        } else {
            GPIOHANDLE_REQUEST_INPUT
        };
        if self.flags & GPIOLINE_FLAG_ACTIVE_LOW != 0 {
            flags |= GPIOHANDLE_REQUEST_ACTIVE_LOW;
        }
        if self.flags & GPIOLINE_FLAG_OPEN_DRAIN != 0 {
            flags |= GPIOHANDLE_REQUEST_OPEN_DRAIN;
        }
        if self.flags & GPIOLINE_FLAG_OPEN_SOURCE != 0 {
            flags |= GPIOHANDLE_REQUEST_OPEN_SOURCE;
        }
        flags
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleRequest<'a> {
    pub offsets: &'a [u32],
    pub flags: u32,
    pub defaults: &'a [u8],
    pub consumer: &'a str,
}

impl HandleRequest<'_> {
    pub fn encode(&self) -> [u8; HANDLE_REQUEST_SIZE] {
        let mut buf = [0u8; HANDLE_REQUEST_SIZE];
        let lines = self.offsets.len().min(GPIOHANDLES_MAX);
        for (i, offset) in self.offsets.iter().take(lines).enumerate() {
            put_u32(&mut buf, i * 4, *offset);
        }
        put_u32(&mut buf, 256, self.flags);
        for (i, value) in self.defaults.iter().take(GPIOHANDLES_MAX).enumerate() {
            buf[260 + i] = *value;
        }
        put_str(&mut buf, 324, self.consumer);
        put_u32(&mut buf, 356, lines as u32);
        buf
    }

    pub fn decode_fd(buf: &[u8; HANDLE_REQUEST_SIZE]) -> RawFd {
        get_u32(buf, 360) as RawFd
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRequest<'a> {
    pub offset: u32,
    pub handle_flags: u32,
    pub event_flags: u32,
    pub consumer: &'a str,
}

impl EventRequest<'_> {
    pub fn encode(&self) -> [u8; EVENT_REQUEST_SIZE] {
        let mut buf = [0u8; EVENT_REQUEST_SIZE];
        put_u32(&mut buf, 0, self.offset);
        put_u32(&mut buf, 4, self.handle_flags);
        put_u32(&mut buf, 8, self.event_flags);
        put_str(&mut buf, 12, self.consumer);
        buf
    }

    pub fn decode_fd(buf: &[u8; EVENT_REQUEST_SIZE]) -> RawFd {
        get_u32(buf, 44) as RawFd
    }
}

pub fn encode_values(values: &[u8]) -> [u8; HANDLE_DATA_SIZE] {
    let mut buf = [0u8; HANDLE_DATA_SIZE];
    for (slot, value) in buf.iter_mut().zip(values) {
        *slot = *value;
    }
    buf
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub timestamp_ns: u64,
    pub id: u32,
}

impl EventRecord {
    pub fn decode(buf: &[u8; EVENT_DATA_SIZE]) -> Self {
        let mut stamp = [0u8; 8];
        stamp.copy_from_slice(&buf[0..8]);
        Self {
            timestamp_ns: u64::from_ne_bytes(stamp),
            id: get_u32(buf, 8),
        }
    }
}
