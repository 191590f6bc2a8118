//! Error types for the ble-session crate.

use thiserror::Error;

use crate::ble::connection::ConnectionState;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The radio is missing, powered off, or in an unknown state.
    #[error("Bluetooth radio unavailable")]
    RadioUnavailable,

    /// A scan is already running on this adapter.
    #[error("A scan is already active")]
    ScanAlreadyActive,

    /// A name lookup was attempted before any scan completed.
    #[error("No scan has been performed yet")]
    ScanRequired,

    /// The specified device is not known to the registry.
    #[error("Device not found: {identifier}")]
    NotFound {
        /// The identifier or name that was searched for.
        identifier: String,
    },

    /// The requested connection state change is not in the transition table.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        /// The state the device was in.
        from: ConnectionState,
        /// The state that was requested.
        to: ConnectionState,
    },

    /// A connect is already in flight for this device.
    #[error("Device is already connecting")]
    AlreadyConnecting,

    /// The device already has an established session.
    #[error("Device is already connected")]
    AlreadyConnected,

    /// Failed to establish a connection to the device.
    #[error("Connection failed: {reason}")]
    ConnectFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// Operation requires a connection but the device is not connected.
    #[error("Device not connected")]
    NotConnected,

    /// Services were requested before discovery ran on the current session.
    #[error("Services have not been discovered on this connection")]
    ServicesNotDiscovered,

    /// The operation did not complete within its timeout.
    #[error("Operation timed out")]
    Timeout,

    /// The peer dropped the link while the operation was in flight.
    #[error("Link lost")]
    LinkLost,

    /// Another operation of the same kind is in flight for this resource.
    #[error("Operation already in progress: {operation}")]
    OperationInProgress {
        /// The operation that was rejected.
        operation: &'static str,
    },

    /// A device identifier string could not be parsed.
    #[error("Invalid device identifier: {input}")]
    InvalidIdentifier {
        /// The rejected input.
        input: String,
    },

    /// Malformed advertising data was received.
    #[error("Invalid data received: {context}")]
    InvalidData {
        /// Description of what was invalid about the data.
        context: String,
    },
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidStateTransition {
            from: ConnectionState::Disconnected,
            to: ConnectionState::Connected,
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition: Disconnected -> Connected"
        );

        let err = Error::ConnectFailed {
            reason: "peer rejected".to_string(),
        };
        assert_eq!(err.to_string(), "Connection failed: peer rejected");
    }
}
