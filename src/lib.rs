//! Connection lifecycle and value synchronisation for a BLE peripheral that
//! publishes a text message and a two-state box value.

mod app;
mod cli;
mod codec;
mod controller;
mod error;
mod hw;
mod permission;
mod protocol;
mod scanner;
mod session;
mod telemetry;
mod terminal;

pub use app::{Clients, fake_clients, real_clients, run, run_with_clients};
pub use cli::{Args, Command, FakeArgs, LogLevel, OutputFormat, RunOptions, SetBoxArgs, WatchArgs};
pub use codec::{BoxState, ChannelValue, bool_to_string, decode_box, decode_message, encode_box, string_to_bool};
pub use controller::{ControllerConfig, DEFAULT_SCAN_TIMEOUT, SessionController};
pub use error::{
    ConnectStageError, DiscoveryError, FixtureError, InvalidTransition, PermissionError,
    RequestConnectError, ScanError, SessionError, TransportError,
};
pub use hw::{
    AdvertisementStream, BtleplugTransport, CharacteristicInfo, CharacteristicRef,
    DeviceIdentity, DisconnectStream, FakeTransport, FakeTransportConfig, FakeUpdate, FakeUpdates,
    NotificationStream, ScanFixture, ServiceInfo, Transport,
};
pub use permission::{
    FixedPermissions, PermissionKind, PermissionProvider, PermissionStatus, RequestOutcome,
    SystemPermissions, ensure_permission,
};
pub use protocol::{BOX_UUID, ChannelId, DEFAULT_DEVICE_NAME, MESSAGE_UUID, SERVICE_UUID};
pub use scanner::Scanner;
pub use session::{
    CharacteristicChannel, CharacteristicHandle, DEFAULT_MESSAGE, DeviceSession, ObservedValue,
    SessionConfig, SessionEvent, SessionSnapshot, SessionState, SubscriptionHandle, Subscriptions,
};
pub use terminal::{SystemTerminalClient, TerminalClient};
