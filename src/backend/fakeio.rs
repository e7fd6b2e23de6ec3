//! Hardware-free stand-in pin (`fakeio...`).
//!
//! When armed it produces an edge every `fake_tick_ms`, alternating rising
//! and falling, so trigger configuration can be exercised without wiring.

use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;

use super::{Edges, EventSource};
use crate::error::GatewayError;
use crate::registry::Registry;

pub const PIN_PREFIX: &str = "fakeio";

/// Every level written to a fake pin, with the time it was applied.
pub type WriteLog = Arc<Mutex<Vec<(Instant, bool)>>>;

/// Number of value reads served by a fake pin.
pub type ReadCount = Arc<AtomicUsize>;

pub struct FakePin {
    name: String,
    high: bool,
    output: bool,
    active_low: bool,
    tick: Option<Duration>,
    events: Option<UnixStream>,
    injector: Option<UnixStream>,
    writes: WriteLog,
    reads: ReadCount,
}

/// Signals an edge on an armed fake pin from outside the dispatcher.
pub struct FakeInjector(UnixStream);

impl FakeInjector {
    pub fn fire(&self) -> Result<(), GatewayError> {
        (&self.0)
            .write_all(&[1])
            .map_err(|e| GatewayError::protocol("fake edge", e))
    }
}

impl FakePin {
    pub fn recognize(name: &str) -> bool {
        name.starts_with(PIN_PREFIX)
    }

    pub fn create(name: &str, registry: &Registry) -> Result<Self, GatewayError> {
        Ok(Self::new(name, registry.settings().fake_tick()))
    }

    pub fn new(name: &str, tick: Option<Duration>) -> Self {
        Self {
            name: name.to_string(),
            high: false,
            output: false,
            active_low: false,
            tick,
            events: None,
            injector: None,
            writes: WriteLog::default(),
            reads: ReadCount::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_output(&self) -> bool {
        self.output
    }

    pub fn is_active_low(&self) -> bool {
        self.active_low
    }

    pub fn write_log(&self) -> WriteLog {
        Arc::clone(&self.writes)
    }

    pub fn read_count(&self) -> ReadCount {
        Arc::clone(&self.reads)
    }

    pub fn set_input(&mut self) -> Result<(), GatewayError> {
        info!("{} direction --> IN", self.name);
        self.output = false;
        Ok(())
    }

    pub fn set_output(&mut self) -> Result<(), GatewayError> {
        info!("{} direction --> OUT", self.name);
        self.output = true;
        Ok(())
    }

    pub fn set_active_low(&mut self) -> Result<(), GatewayError> {
        info!("{} set active low", self.name);
        self.active_low = true;
        Ok(())
    }

    pub fn read_bool(&self) -> Result<bool, GatewayError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.high)
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), GatewayError> {
        debug!("{} set output {value}", self.name);
        self.high = value;
        self.writes.lock().push((Instant::now(), value));
        Ok(())
    }

    pub fn injector(&self) -> Option<FakeInjector> {
        self.injector
            .as_ref()
            .and_then(|s| s.try_clone().ok())
            .map(FakeInjector)
    }

    pub fn arm_edges(&mut self, _rising: bool, _falling: bool) -> Result<EventSource, GatewayError> {
        let (events, injector) =
            UnixStream::pair().map_err(|e| GatewayError::protocol("fake event pair", e))?;

        if let Some(period) = self.tick {
            let ticker = injector
                .try_clone()
                .map_err(|e| GatewayError::protocol("fake ticker", e))?;
            let name = self.name.clone();
            thread::spawn(move || {
                let mut ticker = ticker;
                loop {
                    thread::sleep(period);
                    if let Err(e) = ticker.write_all(&[1]) {
                        warn!("Can't write from ticker for {name}: {e}");
                        break;
                    }
                }
            });
        }

        let fd = events.as_raw_fd();
        self.events = Some(events);
        self.injector = Some(injector);
        Ok(EventSource {
            fd,
            interest: libc::EPOLLIN as u32,
        })
    }

    pub fn identify_edge(&mut self) -> Result<Edges, GatewayError> {
        let events = self.events.as_mut().ok_or_else(|| {
            GatewayError::Config(format!("{} is not armed for events", self.name))
        })?;
        let mut buf = [0u8; 1];
        let n = events
            .read(&mut buf)
            .map_err(|e| GatewayError::protocol("fake event read", e))?;
        GatewayError::check_transfer("fake event read", 1, n)?;

        self.high = !self.high;
        Ok(if self.high { Edges::RISING } else { Edges::FALLING })
    }
}
