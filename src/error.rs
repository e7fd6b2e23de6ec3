use std::io;

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

use crate::pin::Capability;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Unrecognised pin name: {0}")]
    UnrecognizedPin(String),
    #[error("Invalid pin name {pin}: {reason}")]
    InvalidPinName { pin: String, reason: String },
    #[error("Pin {pin} does not support {capability}")]
    Unsupported { pin: String, capability: Capability },
    #[error("Template error: {0}")]
    Template(String),
    #[error("Invalid duration: {0}")]
    InvalidDuration(String),
    #[error("{context}: {source}")]
    Protocol {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("{context}: transferred {actual} bytes, expected {expected}")]
    ShortTransfer {
        context: String,
        expected: usize,
        actual: usize,
    },
    #[error("Delivery failed: {0}")]
    Delivery(String),
    #[error("Endpoint not found: {0}")]
    NotFound(String),
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

impl GatewayError {
    pub fn protocol(context: impl Into<String>, source: io::Error) -> Self {
        GatewayError::Protocol {
            context: context.into(),
            source,
        }
    }

    pub fn invalid_pin(pin: &str, reason: impl Into<String>) -> Self {
        GatewayError::InvalidPinName {
            pin: pin.to_string(),
            reason: reason.into(),
        }
    }

    /// Checks a byte count returned by a single read or write syscall.
    pub fn check_transfer(
        context: &str,
        expected: usize,
        actual: usize,
    ) -> Result<(), GatewayError> {
        if expected == actual {
            Ok(())
        } else {
            Err(GatewayError::ShortTransfer {
                context: context.to_string(),
                expected,
                actual,
            })
        }
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::InvalidValue(_) => StatusCode::BAD_REQUEST,
            GatewayError::Delivery(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}
