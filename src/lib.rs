pub mod backend;
mod config;
pub mod delivery;
mod error;
pub mod gateway;
pub mod pin;
pub mod pulse;
pub mod registry;
mod routes;
pub mod trigger;

pub use config::{
    GatewayConfig, HardwareConfig, HttpConfig, InputConfig, OutputConfig, parse_duration,
};
pub use delivery::{Deliver, WebhookClient};
pub use error::GatewayError;
pub use gateway::{Direction, Gateway, PinHandle, PinSnapshot};
pub use pin::{BackendKind, Capability, Pin, SharedPin};
pub use pulse::PulseOutput;
pub use registry::Registry;
pub use routes::AppState;
pub use trigger::Dispatcher;
