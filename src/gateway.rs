use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use serde::Serialize;

use crate::config::{GatewayConfig, InputConfig, OutputConfig, parse_duration};
use crate::error::GatewayError;
use crate::pin::{BackendKind, Capability, Pin, SharedPin, parse_level_text};
use crate::pulse::PulseOutput;
use crate::registry::Registry;
use crate::trigger::Dispatcher;

/// Where reads and writes for one endpoint go. Pulse outputs are only ever
/// written through their worker.
#[derive(Clone)]
pub enum PinHandle {
    Direct(SharedPin),
    Pulsed(Arc<PulseOutput>),
}

impl PinHandle {
    pub fn read(&self) -> Result<String, GatewayError> {
        match self {
            PinHandle::Direct(pin) => pin.lock().read(),
            PinHandle::Pulsed(pulse) => {
                Ok(if pulse.read_bool()? { "1" } else { "0" }.to_string())
            }
        }
    }

    pub fn write(&self, text: &str) -> Result<(), GatewayError> {
        match self {
            PinHandle::Direct(pin) => pin.lock().write(text),
            PinHandle::Pulsed(pulse) => pulse.write_bool(parse_level_text(text)),
        }
    }
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

pub struct Endpoint {
    pub name: String,
    pub pin_name: String,
    pub backend: BackendKind,
    pub direction: Direction,
    pub inverted: bool,
    pub exported: bool,
    pub pulse: Option<Duration>,
    pub handle: PinHandle,
}

/// One row of the status listing.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct PinSnapshot {
    pub endpoint: String,
    pub pin: String,
    pub backend: BackendKind,
    pub direction: Direction,
    pub inverted: bool,
    pub exported: bool,
    pub pulse: Option<String>,
    pub value: String,
}

pub const UNAVAILABLE: &str = "n/a";

pub struct Gateway {
    endpoints: BTreeMap<String, Endpoint>,
}

impl Gateway {
    /// Creates and configures every pin in `config`, registering triggered
    /// inputs with a new dispatcher. The first failure aborts the build.
    pub fn build(
        config: &GatewayConfig,
        registry: &Registry,
    ) -> Result<(Gateway, Dispatcher), GatewayError> {
        let mut dispatcher = Dispatcher::new()?;
        let mut endpoints = BTreeMap::new();

        for (name, cfg) in &config.outputs {
            let endpoint =
                build_output(name, cfg, registry).map_err(|e| naming("output", name, e))?;
            endpoints.insert(name.clone(), endpoint);
        }
        for (name, cfg) in &config.inputs {
            if endpoints.contains_key(name) {
                return Err(GatewayError::Config(format!(
                    "input {name}: name already used by an output"
                )));
            }
            let endpoint = build_input(name, cfg, registry, &mut dispatcher)
                .map_err(|e| naming("input", name, e))?;
            endpoints.insert(name.clone(), endpoint);
        }

        for endpoint in endpoints.values() {
            dispatcher.add_context(&endpoint.pin_name, endpoint.handle.clone());
        }

        info!(
            "Gateway ready: {} endpoints, {} triggers",
            endpoints.len(),
            dispatcher.len()
        );
        Ok((Gateway { endpoints }, dispatcher))
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values()
    }

    /// Looks up an endpoint reachable over HTTP. Hidden endpoints are not.
    pub fn endpoint(&self, name: &str) -> Result<&Endpoint, GatewayError> {
        self.endpoints
            .get(name)
            .filter(|e| e.exported)
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))
    }

    pub fn read(&self, name: &str) -> Result<String, GatewayError> {
        self.endpoint(name)?.handle.read()
    }

    pub fn write(&self, name: &str, text: &str) -> Result<(), GatewayError> {
        let endpoint = self.endpoint(name)?;
        if endpoint.direction == Direction::Input {
            return Err(GatewayError::MethodNotAllowed(format!(
                "{name} is an input"
            )));
        }
        endpoint.handle.write(text)
    }

    /// Status of every endpoint, hidden ones included. Read failures show as
    /// [`UNAVAILABLE`].
    pub fn snapshot(&self) -> Vec<PinSnapshot> {
        self.endpoints
            .values()
            .map(|e| PinSnapshot {
                endpoint: e.name.clone(),
                pin: e.pin_name.clone(),
                backend: e.backend,
                direction: e.direction,
                inverted: e.inverted,
                exported: e.exported,
                pulse: e
                    .pulse
                    .map(|d| humantime::format_duration(d).to_string()),
                value: e
                    .handle
                    .read()
                    .unwrap_or_else(|_| UNAVAILABLE.to_string()),
            })
            .collect()
    }
}

fn naming(kind: &str, name: &str, e: GatewayError) -> GatewayError {
    GatewayError::Config(format!("{kind} {name}: {e}"))
}

fn build_output(
    name: &str,
    cfg: &OutputConfig,
    registry: &Registry,
) -> Result<Endpoint, GatewayError> {
    let mut pin = Pin::create(&cfg.pin, registry)?;
    pin.require(Capability::Output)?;
    pin.set_output()?;
    if cfg.invert {
        pin.require(Capability::DigitalPolarity)?;
        pin.set_active_low()?;
    }
    let backend = pin.backend();

    let (handle, pulse) = match &cfg.pulse {
        Some(duration) => {
            pin.require(Capability::BooleanIo)?;
            let pulse = PulseOutput::configure(pin, duration)?;
            let period = pulse.period();
            (PinHandle::Pulsed(Arc::new(pulse)), Some(period))
        }
        None => (PinHandle::Direct(pin.shared()), None),
    };

    Ok(Endpoint {
        name: name.to_string(),
        pin_name: cfg.pin.clone(),
        backend,
        direction: Direction::Output,
        inverted: cfg.invert,
        exported: !cfg.hidden,
        pulse,
        handle,
    })
}

fn build_input(
    name: &str,
    cfg: &InputConfig,
    registry: &Registry,
    dispatcher: &mut Dispatcher,
) -> Result<Endpoint, GatewayError> {
    let mut pin = Pin::create(&cfg.pin, registry)?;
    pin.require(Capability::Input)?;
    pin.set_input()?;
    if cfg.invert {
        pin.require(Capability::DigitalPolarity)?;
        pin.set_active_low()?;
    }
    if let Some(debounce) = &cfg.debounce {
        pin.require(Capability::Debounce)?;
        pin.set_debounce(parse_duration(debounce)?)?;
    }

    let backend = pin.backend();
    let pin = pin.shared();
    if cfg.wants_trigger() {
        dispatcher.register(
            SharedPin::clone(&pin),
            &cfg.on_rising,
            &cfg.on_falling,
            cfg.method(),
            cfg.payload(),
        )?;
    }

    Ok(Endpoint {
        name: name.to_string(),
        pin_name: cfg.pin.clone(),
        backend,
        direction: Direction::Input,
        inverted: cfg.invert,
        exported: !cfg.hidden,
        pulse: None,
        handle: PinHandle::Direct(pin),
    })
}
