use thiserror::Error;

use crate::types::CentralConnectionState;

/// Errors that can occur while bridging the bike to an FTMS consumer
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No Bluetooth adapter, or the configured bike was not found
    #[error("Bike device not found")]
    DeviceNotFound,

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// An operation required a live bike connection
    #[error("Not connected to bike")]
    NotConnected,

    /// Transport operation timeout
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// A required characteristic was not exposed by the remote device
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(String),

    /// Subscribing to a characteristic failed
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    /// The central lifecycle rejected an event in its current state
    #[error("Invalid transition from {from:?} on {event}")]
    InvalidTransition {
        /// State the lifecycle was in
        from: CentralConnectionState,
        /// Event that was rejected
        event: &'static str,
    },

    /// Failure reported by a transport collaborator
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::NotConnected
                | Self::DeviceNotFound
        )
    }

    /// Check if the bridge can carry on without operator action.
    ///
    /// Lifecycle rejections and timeouts leave the state machines intact; the
    /// rest drop the bike connection back to idle.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::InvalidTransition { .. }
                | Self::CharacteristicNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = BridgeError::ConnectionFailed("test".to_string());
        assert!(connection_error.is_connection_error());
        assert!(!connection_error.is_recoverable());

        let timeout_error = BridgeError::Timeout { timeout_ms: 10_000 };
        assert!(!timeout_error.is_connection_error());
        assert!(timeout_error.is_recoverable());

        let transition = BridgeError::InvalidTransition {
            from: CentralConnectionState::Idle,
            event: "connect",
        };
        assert!(!transition.is_connection_error());
        assert!(transition.is_recoverable());

        let subscription = BridgeError::SubscriptionFailed("0xFFF1".to_string());
        assert!(!subscription.is_connection_error());
        assert!(!subscription.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let error = BridgeError::InvalidTransition {
            from: CentralConnectionState::Scanning,
            event: "connect",
        };
        let error_string = format!("{error}");
        assert!(error_string.contains("Scanning"));
        assert!(error_string.contains("connect"));

        let error = BridgeError::CharacteristicNotFound("0000fff1".to_string());
        assert!(format!("{error}").contains("0000fff1"));
    }
}
