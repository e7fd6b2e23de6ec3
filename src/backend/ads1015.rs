//! TI ADS1015 12-bit, 4-channel ADC on an I2C bus (`ads1015:<ch>[@<addr>]`).
//!
//! See <http://www.ti.com/lit/ds/symlink/ads1015.pdf>.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::GatewayError;
use crate::registry::Registry;

pub const PIN_PREFIX: &str = "ads1015:";
pub const DEFAULT_ADDRESS: u8 = 0x48;
pub const MIN_VALUE: i32 = 0;
pub const MAX_VALUE: i32 = 4095;

const I2C_SLAVE: libc::c_ulong = 0x0703;

const REG_CONVERSION: u8 = 0x00;
const REG_CONFIG: u8 = 0x01;
/// OS=start single shot, MUX=AINx vs GND (bits 4-5 ORed in), PGA=4.096V, MODE=single.
const CONFIG_MSB: u8 = 0xC3;
/// DR=1600 SPS, comparator disabled with ALERT/RDY high-impedance.
const CONFIG_LSB: u8 = 0x83;
/// One sample period at 1600 SPS.
const CONVERSION_TIME: Duration = Duration::from_micros(625);

pub fn config_frame(channel: u8) -> [u8; 3] {
    [REG_CONFIG, CONFIG_MSB | ((channel << 4) & 0x30), CONFIG_LSB]
}

/// The result register is MSB first with the low four bits zero.
pub fn decode_conversion(raw: [u8; 2]) -> i32 {
    (i32::from(raw[0]) << 4) | i32::from(raw[1] >> 4)
}

/// Runs one configure, wait, select, read sequence on an already-addressed bus.
pub fn run_conversion<D: Read + Write>(dev: &mut D, channel: u8) -> Result<i32, GatewayError> {
    let config = config_frame(channel);
    let n = dev
        .write(&config)
        .map_err(|e| GatewayError::protocol("ads1015 config write", e))?;
    GatewayError::check_transfer("ads1015 config write", config.len(), n)?;

    thread::sleep(CONVERSION_TIME);

    let select = [REG_CONVERSION];
    let n = dev
        .write(&select)
        .map_err(|e| GatewayError::protocol("ads1015 register select", e))?;
    GatewayError::check_transfer("ads1015 register select", select.len(), n)?;

    let mut result = [0u8; 2];
    let n = dev
        .read(&mut result)
        .map_err(|e| GatewayError::protocol("ads1015 result read", e))?;
    GatewayError::check_transfer("ads1015 result read", result.len(), n)?;

    Ok(decode_conversion(result))
}

/// One physical converter. The bus lock is held for the whole conversion,
/// sleep included, so conversions on different channels never interleave.
pub struct Ads1015 {
    bus: Mutex<File>,
    address: u8,
}

impl Ads1015 {
    pub fn open(path: &Path, address: u8) -> Result<Self, GatewayError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| GatewayError::protocol(format!("open {}", path.display()), e))?;

        // SAFETY: I2C_SLAVE takes its argument by value, no memory is shared.
        let rc = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                I2C_SLAVE as _,
                libc::c_ulong::from(address),
            )
        };
        if rc < 0 {
            return Err(GatewayError::protocol(
                format!("set I2C slave address {address:#04x}"),
                std::io::Error::last_os_error(),
            ));
        }

        Ok(Self {
            bus: Mutex::new(file),
            address,
        })
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn convert(&self, channel: u8) -> Result<i32, GatewayError> {
        let mut bus = self.bus.lock();
        run_conversion(&mut *bus, channel)
    }
}

pub struct AdcChannel {
    name: String,
    channel: u8,
    adc: Arc<Ads1015>,
}

impl AdcChannel {
    pub fn recognize(name: &str) -> bool {
        name.starts_with(PIN_PREFIX)
    }

    pub fn create(name: &str, registry: &Registry) -> Result<Self, GatewayError> {
        let (channel, address) = parse_name(name)?;
        let adc = registry.converter(address)?;
        Ok(Self {
            name: name.to_string(),
            channel,
            adc,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn converter(&self) -> &Arc<Ads1015> {
        &self.adc
    }

    pub fn read_value(&self) -> Result<i32, GatewayError> {
        self.adc.convert(self.channel)
    }
}

fn parse_name(name: &str) -> Result<(u8, u8), GatewayError> {
    let rest = name
        .strip_prefix(PIN_PREFIX)
        .ok_or_else(|| GatewayError::UnrecognizedPin(name.to_string()))?;
    let (channel, address) = match rest.split_once('@') {
        Some((channel, address)) => (channel, Some(address)),
        None => (rest, None),
    };

    let channel = match channel {
        "0" | "1" | "2" | "3" => channel.as_bytes()[0] - b'0',
        _ => return Err(GatewayError::invalid_pin(name, "channel must be 0-3")),
    };

    let address = match address {
        None => DEFAULT_ADDRESS,
        Some(hex) if hex.len() == 2 && hex.bytes().all(|b| b.is_ascii_hexdigit()) => {
            u8::from_str_radix(hex, 16)
                .map_err(|e| GatewayError::invalid_pin(name, format!("address: {e}")))?
        }
        Some(_) => {
            return Err(GatewayError::invalid_pin(
                name,
                "address must be two hex digits",
            ));
        }
    };

    Ok((channel, address))
}
