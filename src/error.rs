use std::time::Duration;

use derive_more::From;
use thiserror::Error;

use crate::protocol::ChannelId;
use crate::session::{SessionEvent, SessionState};

/// Errors returned by the radio transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("BLE operation failed")]
    Ble(#[from] btleplug::Error),
    #[error("no BLE adapters were found")]
    NoAdapters,
    #[error("device `{device_id}` is not known to the transport")]
    UnknownDevice { device_id: String },
    #[error("characteristic `{uuid}` was not found on the connected device")]
    MissingCharacteristic { uuid: String },
    #[error("the peripheral disconnected")]
    Disconnected,
    #[error("{operation} timed out after {after:?}")]
    TimedOut {
        operation: &'static str,
        after: Duration,
    },
    #[error("{operation} was rejected: {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },
}

impl TransportError {
    /// Returns whether the error reports loss of the link rather than a failed request.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

/// Errors returned by the permission gate.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
pub enum PermissionError {
    #[error("location access is unavailable on this device")]
    Unavailable,
    #[error("location access is blocked; allow it in system settings")]
    Blocked,
    #[error("location access was denied")]
    Denied,
}

impl PermissionError {
    /// Returns whether the user has to be sent to system settings.
    #[must_use]
    pub fn requires_settings_redirect(self) -> bool {
        matches!(self, Self::Blocked)
    }
}

/// Errors returned by a discovery sweep.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("no matching device was found within {timeout:?}")]
    NotFound { timeout: Duration },
    #[error("a scan is already in progress")]
    InProgress,
    #[error("the scan could not be started")]
    Unavailable(#[source] TransportError),
}

/// Errors returned while enumerating the peripheral's capabilities.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("service discovery failed")]
    Transport(#[from] TransportError),
    #[error("required characteristics are missing: {missing}")]
    MissingChannels { missing: String },
}

/// An event the session state machine does not accept in its current state.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
#[error("`{event}` is not a valid event while `{from}`")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub event: SessionEvent,
}

/// Errors returned by the device session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,
    #[error("a device is already connected")]
    AlreadyConnected,
    #[error("no device is connected")]
    NotConnected,
    #[error("connecting to the device failed")]
    Connect(#[source] TransportError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("initial read of the {channel} characteristic failed")]
    Sync {
        channel: ChannelId,
        #[source]
        source: TransportError,
    },
    #[error("{operation} on the {channel} characteristic failed")]
    Runtime {
        channel: ChannelId,
        operation: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("registering for disconnect notifications failed")]
    Watch(#[source] TransportError),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error("disconnecting from the device failed")]
    Disconnect(#[source] TransportError),
    #[error("the peripheral disconnected")]
    Disconnected,
    #[error("the device session has shut down")]
    Closed,
}

/// Error from one stage of the connect pipeline.
#[derive(Debug, Error, From)]
pub enum ConnectStageError {
    #[error(transparent)]
    #[from(PermissionError, Box<PermissionError>)]
    Permission(Box<PermissionError>),
    #[error(transparent)]
    #[from(ScanError, Box<ScanError>)]
    Scan(Box<ScanError>),
    #[error(transparent)]
    #[from(SessionError, Box<SessionError>)]
    Session(Box<SessionError>),
}

/// User-facing outcome of a failed connect request.
#[derive(Debug, Error)]
pub enum RequestConnectError {
    #[error("location access is blocked; open system settings to allow it")]
    SettingsRedirect,
    #[error("{status}")]
    NotConnected {
        status: String,
        #[source]
        source: ConnectStageError,
    },
}

impl RequestConnectError {
    /// Returns whether the presentation layer should offer to open system settings.
    #[must_use]
    pub fn requires_settings_redirect(&self) -> bool {
        matches!(self, Self::SettingsRedirect)
    }
}

/// Errors returned when parsing fake transport fixtures.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("the fake discovery fixture is empty")]
    EmptyFixture,
    #[error("fixture records must contain three pipe-delimited fields")]
    InvalidRecordFieldCount,
    #[error("fixture records cannot contain empty mandatory fields")]
    EmptyRecordField,
    #[error("failed to parse RSSI value")]
    InvalidRssi(#[from] std::num::ParseIntError),
    #[error("invalid box value `{value}`; expected 0 or 1")]
    InvalidBoxValue { value: String },
    #[error("invalid update `{record}`; expected `message:<text>`, `box:<0|1>` or `hex:<channel>:<bytes>`")]
    InvalidUpdate { record: String },
    #[error("invalid hex payload")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Errors returned when validating runtime backend options.
#[derive(Debug, Error)]
pub(crate) enum CliConfigError {
    #[error("missing fake scan fixture while fake mode is enabled")]
    MissingFakeScanFixture,
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}
