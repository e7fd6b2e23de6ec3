pub mod ads1015;
pub mod chardev;
pub mod fakeio;
pub mod sysfs;

use std::os::fd::RawFd;
use std::time::Duration;

pub use ads1015::{AdcChannel, Ads1015};
pub use chardev::{AbiVariant, ChardevPin, GpioChip};
pub use fakeio::{FakeInjector, FakePin, ReadCount, WriteLog};
pub use sysfs::SysfsPin;

use crate::error::GatewayError;

pub const MIN_DEBOUNCE: Duration = Duration::from_millis(20);

/// Parses a decimal field of a pin name. Signs and whitespace are rejected.
pub(crate) fn parse_decimal(pin: &str, field: &str, text: &str) -> Result<u32, GatewayError> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(GatewayError::invalid_pin(
            pin,
            format!("{field} must be decimal digits"),
        ));
    }
    text.parse::<u32>()
        .map_err(|e| GatewayError::invalid_pin(pin, format!("{field}: {e}")))
}

/// Edge flags produced by interpreting one hardware event.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Edges {
    pub rising: bool,
    pub falling: bool,
}

impl Edges {
    pub const RISING: Edges = Edges {
        rising: true,
        falling: false,
    };
    pub const FALLING: Edges = Edges {
        rising: false,
        falling: true,
    };

    pub fn is_none(&self) -> bool {
        !self.rising && !self.falling
    }
}

/// A descriptor that becomes ready when an armed pin has an event pending,
/// with the epoll interest mask it must be watched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSource {
    pub fd: RawFd,
    pub interest: u32,
}

/// Suppresses edges closer than `window` to the last accepted one.
#[derive(Debug, Clone)]
pub struct EdgeDebouncer {
    window: Duration,
    last_ns: Option<u64>,
}

impl EdgeDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_ns: None,
        }
    }

    pub fn checked(window: Duration) -> Result<Self, GatewayError> {
        if window < MIN_DEBOUNCE {
            return Err(GatewayError::InvalidDuration(format!(
                "debounce too short ({window:?} < {MIN_DEBOUNCE:?})"
            )));
        }
        Ok(Self::new(window))
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Accepts an edge stamped `timestamp_ns`, recording it as the new
    /// reference. A rejected edge leaves the reference untouched.
    pub fn accept(&mut self, timestamp_ns: u64) -> bool {
        if let Some(last) = self.last_ns
            && u128::from(timestamp_ns.saturating_sub(last)) < self.window.as_nanos()
        {
            return false;
        }
        self.last_ns = Some(timestamp_ns);
        true
    }
}
