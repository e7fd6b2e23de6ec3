//! Capability model and pin factory.
//!
//! A [`Pin`] is a closed set of backend variants. What each variant can do is
//! fixed by [`BackendKind::capabilities`]; every operation checks that table
//! and fails with [`GatewayError::Unsupported`] instead of degrading.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use parking_lot::Mutex;
use serde::Serialize;

use crate::backend::{self, AdcChannel, ChardevPin, Edges, EventSource, FakePin, SysfsPin};
use crate::error::GatewayError;
use crate::registry::Registry;

pub type SharedPin = Arc<Mutex<Pin>>;

#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Input,
    Output,
    DigitalPolarity,
    Debounce,
    BooleanIo,
    AnalogueIo,
    EdgeTrigger,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::Input => "input",
            Capability::Output => "output",
            Capability::DigitalPolarity => "active-low polarity",
            Capability::Debounce => "debounce",
            Capability::BooleanIo => "boolean values",
            Capability::AnalogueIo => "analogue values",
            Capability::EdgeTrigger => "edge triggering",
        })
    }
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Chardev,
    Ads1015,
    Sysfs,
    Fake,
}

impl BackendKind {
    /// Order in which the factory offers a name to each backend.
    pub const PRIORITY: [BackendKind; 4] = [
        BackendKind::Chardev,
        BackendKind::Ads1015,
        BackendKind::Sysfs,
        BackendKind::Fake,
    ];

    pub fn capabilities(self) -> &'static [Capability] {
        use Capability::*;
        match self {
            BackendKind::Chardev => &[
                Input,
                Output,
                DigitalPolarity,
                Debounce,
                BooleanIo,
                EdgeTrigger,
            ],
            BackendKind::Ads1015 => &[Input, AnalogueIo],
            BackendKind::Sysfs => &[Input, Output, DigitalPolarity, BooleanIo, EdgeTrigger],
            BackendKind::Fake => &[Input, Output, DigitalPolarity, BooleanIo, EdgeTrigger],
        }
    }

    pub fn recognize(self, name: &str) -> bool {
        match self {
            BackendKind::Chardev => ChardevPin::recognize(name),
            BackendKind::Ads1015 => AdcChannel::recognize(name),
            BackendKind::Sysfs => SysfsPin::recognize(name),
            BackendKind::Fake => FakePin::recognize(name),
        }
    }

    pub fn create(self, name: &str, registry: &Registry) -> Result<Pin, GatewayError> {
        Ok(match self {
            BackendKind::Chardev => Pin::Chardev(ChardevPin::create(name, registry)?),
            BackendKind::Ads1015 => Pin::Ads1015(AdcChannel::create(name, registry)?),
            BackendKind::Sysfs => Pin::Sysfs(SysfsPin::create(name, registry)?),
            BackendKind::Fake => Pin::Fake(FakePin::create(name, registry)?),
        })
    }

    /// First backend, in priority order, that claims `name`.
    pub fn for_name(name: &str) -> Option<BackendKind> {
        Self::PRIORITY.into_iter().find(|kind| kind.recognize(name))
    }
}

pub enum Pin {
    Chardev(ChardevPin),
    Ads1015(AdcChannel),
    Sysfs(SysfsPin),
    Fake(FakePin),
}

impl std::fmt::Debug for Pin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pin")
            .field("name", &self.name())
            .field("backend", &self.backend())
            .finish()
    }
}

impl Pin {
    pub fn create(name: &str, registry: &Registry) -> Result<Pin, GatewayError> {
        let kind = BackendKind::for_name(name)
            .ok_or_else(|| GatewayError::UnrecognizedPin(name.to_string()))?;
        let pin = kind.create(name, registry)?;
        info!("Created {name} ({kind:?})");
        Ok(pin)
    }

    pub fn shared(self) -> SharedPin {
        Arc::new(Mutex::new(self))
    }

    pub fn name(&self) -> &str {
        match self {
            Pin::Chardev(p) => p.name(),
            Pin::Ads1015(p) => p.name(),
            Pin::Sysfs(p) => p.name(),
            Pin::Fake(p) => p.name(),
        }
    }

    pub fn backend(&self) -> BackendKind {
        match self {
            Pin::Chardev(_) => BackendKind::Chardev,
            Pin::Ads1015(_) => BackendKind::Ads1015,
            Pin::Sysfs(_) => BackendKind::Sysfs,
            Pin::Fake(_) => BackendKind::Fake,
        }
    }

    pub fn capabilities(&self) -> &'static [Capability] {
        self.backend().capabilities()
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    pub fn require(&self, capability: Capability) -> Result<(), GatewayError> {
        if self.supports(capability) {
            Ok(())
        } else {
            Err(GatewayError::Unsupported {
                pin: self.name().to_string(),
                capability,
            })
        }
    }

    fn unsupported(&self, capability: Capability) -> GatewayError {
        GatewayError::Unsupported {
            pin: self.name().to_string(),
            capability,
        }
    }

    pub fn set_input(&mut self) -> Result<(), GatewayError> {
        match self {
            Pin::Chardev(p) => p.set_input(),
            Pin::Sysfs(p) => p.set_input(),
            Pin::Fake(p) => p.set_input(),
            // converter channels are always inputs
            Pin::Ads1015(_) => Ok(()),
        }
    }

    pub fn set_output(&mut self) -> Result<(), GatewayError> {
        match self {
            Pin::Chardev(p) => p.set_output(),
            Pin::Sysfs(p) => p.set_output(),
            Pin::Fake(p) => p.set_output(),
            Pin::Ads1015(_) => Err(self.unsupported(Capability::Output)),
        }
    }

    pub fn set_active_low(&mut self) -> Result<(), GatewayError> {
        match self {
            Pin::Chardev(p) => p.set_active_low(),
            Pin::Sysfs(p) => p.set_active_low(),
            Pin::Fake(p) => p.set_active_low(),
            Pin::Ads1015(_) => Err(self.unsupported(Capability::DigitalPolarity)),
        }
    }

    pub fn set_debounce(&mut self, window: Duration) -> Result<(), GatewayError> {
        match self {
            Pin::Chardev(p) => p.set_debounce(window),
            _ => Err(self.unsupported(Capability::Debounce)),
        }
    }

    pub fn read_bool(&self) -> Result<bool, GatewayError> {
        match self {
            Pin::Chardev(p) => p.read_bool(),
            Pin::Sysfs(p) => p.read_bool(),
            Pin::Fake(p) => p.read_bool(),
            Pin::Ads1015(_) => Err(self.unsupported(Capability::BooleanIo)),
        }
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), GatewayError> {
        match self {
            Pin::Chardev(p) => p.write_bool(value),
            Pin::Sysfs(p) => p.write_bool(value),
            Pin::Fake(p) => p.write_bool(value),
            Pin::Ads1015(_) => Err(self.unsupported(Capability::BooleanIo)),
        }
    }

    pub fn read_value(&self) -> Result<i32, GatewayError> {
        match self {
            Pin::Ads1015(p) => p.read_value(),
            _ => Err(self.unsupported(Capability::AnalogueIo)),
        }
    }

    /// Inclusive bounds of [`Pin::read_value`].
    pub fn value_range(&self) -> Result<(i32, i32), GatewayError> {
        match self {
            Pin::Ads1015(_) => Ok((backend::ads1015::MIN_VALUE, backend::ads1015::MAX_VALUE)),
            _ => Err(self.unsupported(Capability::AnalogueIo)),
        }
    }

    pub fn arm_edges(&mut self, rising: bool, falling: bool) -> Result<EventSource, GatewayError> {
        match self {
            Pin::Chardev(p) => p.arm_edges(rising, falling),
            Pin::Sysfs(p) => p.arm_edges(rising, falling),
            Pin::Fake(p) => p.arm_edges(rising, falling),
            Pin::Ads1015(_) => Err(self.unsupported(Capability::EdgeTrigger)),
        }
    }

    pub fn identify_edge(&mut self) -> Result<Edges, GatewayError> {
        match self {
            Pin::Chardev(p) => p.identify_edge(),
            Pin::Sysfs(p) => p.identify_edge(),
            Pin::Fake(p) => p.identify_edge(),
            Pin::Ads1015(_) => Err(self.unsupported(Capability::EdgeTrigger)),
        }
    }

    /// Current value as text: the integer for analogue pins, `1`/`0` otherwise.
    pub fn read(&self) -> Result<String, GatewayError> {
        if self.supports(Capability::AnalogueIo) {
            Ok(self.read_value()?.to_string())
        } else {
            Ok(if self.read_bool()? { "1" } else { "0" }.to_string())
        }
    }

    pub fn write(&mut self, text: &str) -> Result<(), GatewayError> {
        self.write_bool(parse_level_text(text))
    }
}

/// `false`, `low` and `0` prefixes mean low; anything else means high.
pub fn parse_level_text(text: &str) -> bool {
    !["false", "low", "0"]
        .iter()
        .any(|prefix| text.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HardwareConfig;

    fn registry() -> Registry {
        Registry::new(HardwareConfig {
            fake_tick_ms: None,
            ..HardwareConfig::default()
        })
    }

    #[test]
    fn names_pick_backends_in_priority_order() {
        assert_eq!(BackendKind::for_name("gpiochip0:4"), Some(BackendKind::Chardev));
        assert_eq!(BackendKind::for_name("gpio4"), Some(BackendKind::Sysfs));
        assert_eq!(BackendKind::for_name("ads1015:2@49"), Some(BackendKind::Ads1015));
        assert_eq!(BackendKind::for_name("fakeio-door"), Some(BackendKind::Fake));
        assert_eq!(BackendKind::for_name("spi0.1"), None);
    }

    #[test]
    fn unknown_name_is_a_configuration_error() {
        let err = Pin::create("pwm3", &registry()).unwrap_err();
        assert!(matches!(err, GatewayError::UnrecognizedPin(_)));
    }

    #[test]
    fn fake_pin_declares_its_capability_set() {
        let pin = Pin::create("fakeio1", &registry()).unwrap();
        assert_eq!(pin.backend(), BackendKind::Fake);
        assert!(pin.supports(Capability::EdgeTrigger));
        assert!(pin.supports(Capability::BooleanIo));
        assert!(!pin.supports(Capability::Debounce));
        assert!(!pin.supports(Capability::AnalogueIo));
    }

    #[test]
    fn unsupported_operations_fail_explicitly() {
        let mut pin = Pin::create("fakeio2", &registry()).unwrap();
        let err = pin.set_debounce(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Unsupported {
                capability: Capability::Debounce,
                ..
            }
        ));
        assert!(pin.read_value().is_err());
        assert!(pin.value_range().is_err());
        assert!(pin.require(Capability::AnalogueIo).is_err());
        assert!(pin.require(Capability::Output).is_ok());
    }

    #[test]
    fn every_backend_accepts_input_direction() {
        for kind in BackendKind::PRIORITY {
            assert!(kind.capabilities().contains(&Capability::Input), "{kind:?}");
        }
        assert!(!BackendKind::Ads1015.capabilities().contains(&Capability::Output));
        assert!(BackendKind::Chardev.capabilities().contains(&Capability::Debounce));
    }

    #[test]
    fn text_values_round_through_fake_pin() {
        let mut pin = Pin::create("fakeio3", &registry()).unwrap();
        pin.set_output().unwrap();
        pin.write("high").unwrap();
        assert_eq!(pin.read().unwrap(), "1");
        pin.write("0\n").unwrap();
        assert_eq!(pin.read().unwrap(), "0");
    }

    #[test]
    fn level_text_parsing() {
        for low in ["0", "false", "low", "lowish", "0x1"] {
            assert!(!parse_level_text(low), "{low}");
        }
        for high in ["1", "true", "high", "on", ""] {
            assert!(parse_level_text(high), "{high}");
        }
    }
}
