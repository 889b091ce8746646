use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MeterError>;

/// Errors raised by the engine facade and the chipset drivers.
///
/// `UnsupportedModel` and `Connect` are fatal to the engine instance that
/// produced them. `Framing`, `Decode` and `Timeout` leave the driver in a
/// usable state, the caller may simply request another reading.
#[derive(Debug, Error)]
pub enum MeterError {
    /// Model name is not a registry key (case-sensitive match).
    #[error("Multimeter model not supported: {0}")]
    UnsupportedModel(String),

    /// The transport could not be opened or found.
    #[error("Unable to connect to multimeter: {message}")]
    Connect {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Packet resynchronization exhausted its retry ceiling.
    #[error("{0}")]
    Framing(String),

    /// A field's bit pattern matches none of the known encodings.
    #[error("{0}")]
    Decode(String),

    /// No bytes arrived within the read deadline.
    #[error("No bytes received. Multimeter connected and set to PC mode?")]
    Timeout,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("Serial port error")]
    Serial(#[from] tokio_serial::Error),

    // nusb's device-level error type is std::io::Error, so the Io variant
    // covers USB open/reset/claim failures as well.
    #[error("USB transfer error")]
    UsbTransfer(#[from] nusb::transfer::TransferError),
}

impl MeterError {
    pub(crate) fn connect(message: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn connect_caused_by(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connect {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether a follow-up `get_reading()` on the same engine is sensible.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Framing(_) | Self::Decode(_) | Self::Timeout | Self::UsbTransfer(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_error_carries_cause() {
        let cause = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err = MeterError::connect_caused_by("open /dev/ttyUSB0", cause);
        assert!(std::error::Error::source(&err).is_some());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn io_errors_convert_through_a_single_variant() {
        // Device-level USB failures arrive as std::io::Error too.
        let err = MeterError::from(io::Error::new(io::ErrorKind::NotFound, "no such device"));
        assert!(matches!(err, MeterError::Io(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn framing_error_is_recoverable() {
        assert!(MeterError::Framing("out of order".into()).is_recoverable());
        assert!(MeterError::Timeout.is_recoverable());
        assert!(!MeterError::UnsupportedModel("X".into()).is_recoverable());
    }
}
