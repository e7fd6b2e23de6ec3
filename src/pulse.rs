//! Pulse outputs: a high write returns to low on its own after a fixed time.
//!
//! The wrapped pin is moved into the [`PulseOutput`] and only its worker thread
//! ever writes to it. Writers submit commands on a single-slot channel and wait
//! for the worker to apply them.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error};

use crate::config::parse_duration;
use crate::error::GatewayError;
use crate::pin::{Capability, Pin, SharedPin};

pub const MIN_PULSE: Duration = Duration::from_millis(5);
pub const MAX_PULSE: Duration = Duration::from_secs(300);

enum PulseCommand {
    Set {
        value: bool,
        reply: SyncSender<Result<(), GatewayError>>,
    },
    Shutdown,
}

/// Deadline-based one-shot timer. Stopping it discards any expiry that has
/// not been consumed yet, so a restart can never observe a stale one.
#[derive(Debug, Default)]
struct PulseTimer {
    deadline: Option<Instant>,
}

impl PulseTimer {
    fn restart(&mut self, period: Duration) {
        self.deadline = Some(Instant::now() + period);
    }

    fn stop(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

pub struct PulseOutput {
    name: String,
    period: Duration,
    pin: SharedPin,
    commands: SyncSender<PulseCommand>,
    worker: Option<JoinHandle<()>>,
}

impl PulseOutput {
    pub fn configure(pin: Pin, duration: &str) -> Result<Self, GatewayError> {
        let period = parse_duration(duration)?;
        if period < MIN_PULSE {
            return Err(GatewayError::InvalidDuration(format!(
                "pulse too short ({period:?}), minimum {MIN_PULSE:?}"
            )));
        }
        if period > MAX_PULSE {
            return Err(GatewayError::InvalidDuration(format!(
                "pulse too long ({period:?}), maximum {MAX_PULSE:?}"
            )));
        }
        pin.require(Capability::Output)?;
        pin.require(Capability::BooleanIo)?;

        let name = pin.name().to_string();
        let pin = pin.shared();
        let (commands, rx) = mpsc::sync_channel(1);
        let worker_pin = SharedPin::clone(&pin);
        let worker_name = name.clone();
        let worker = thread::Builder::new()
            .name(format!("pulse-{name}"))
            .spawn(move || pulse_worker(worker_name, worker_pin, period, rx))
            .map_err(|e| GatewayError::protocol("spawn pulse worker", e))?;

        Ok(Self {
            name,
            period,
            pin,
            commands,
            worker: Some(worker),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn read_bool(&self) -> Result<bool, GatewayError> {
        self.pin.lock().read_bool()
    }

    /// Hands `value` to the worker and waits until it has been written.
    pub fn write_bool(&self, value: bool) -> Result<(), GatewayError> {
        let (reply, result) = mpsc::sync_channel(1);
        self.commands
            .send(PulseCommand::Set { value, reply })
            .map_err(|_| self.worker_gone())?;
        result.recv().map_err(|_| self.worker_gone())?
    }

    fn worker_gone(&self) -> GatewayError {
        GatewayError::protocol(
            format!("pulse {}", self.name),
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "worker stopped"),
        )
    }
}

impl Drop for PulseOutput {
    fn drop(&mut self) {
        let _ = self.commands.send(PulseCommand::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

fn pulse_worker(name: String, pin: SharedPin, period: Duration, commands: Receiver<PulseCommand>) {
    let mut timer = PulseTimer::default();

    loop {
        let command = match timer.remaining() {
            Some(remaining) => match commands.recv_timeout(remaining) {
                Ok(command) => command,
                Err(RecvTimeoutError::Timeout) => {
                    timer.stop();
                    debug!("{name}: pulse expired");
                    if let Err(e) = pin.lock().write_bool(false) {
                        error!("{name}: failed to end pulse: {e}");
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match commands.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };

        match command {
            PulseCommand::Set { value, reply } => {
                let result = pin.lock().write_bool(value);
                timer.stop();
                match &result {
                    Ok(()) if value => timer.restart(period),
                    Ok(()) => {}
                    Err(e) => error!("{name}: write {value} failed: {e}"),
                }
                let _ = reply.send(result);
            }
            PulseCommand::Shutdown => break,
        }
    }

    if timer.stop() {
        if let Err(e) = pin.lock().write_bool(false) {
            error!("{name}: failed to end pulse on shutdown: {e}");
        }
    }
    debug!("{name}: pulse worker stopped");
}
