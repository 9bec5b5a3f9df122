use std::fmt::Debug;
use std::pin::Pin;

use async_trait::async_trait;
use tokio_stream::Stream;

use super::model::{CharacteristicRef, DeviceIdentity, ServiceInfo};
use crate::error::TransportError;

/// Advertisement events produced by a running discovery sweep.
pub type AdvertisementStream =
    Pin<Box<dyn Stream<Item = Result<DeviceIdentity, TransportError>> + Send>>;

/// Value-change pushes for one characteristic, in the order the peripheral sent them.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Yields once per involuntary disconnect of one peripheral.
pub type DisconnectStream = Pin<Box<dyn Stream<Item = ()> + Send>>;

/// The radio stack, injected into the scanner and the device session.
#[async_trait]
pub trait Transport: Debug + Send + Sync {
    /// Starts an unfiltered discovery sweep.
    async fn start_scan(&self) -> Result<AdvertisementStream, TransportError>;

    /// Stops the discovery sweep.
    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Opens a link to a previously advertised peripheral.
    async fn connect(&self, device: &DeviceIdentity) -> Result<(), TransportError>;

    /// Enumerates services and characteristics on a connected peripheral.
    async fn discover(&self, device: &DeviceIdentity) -> Result<Vec<ServiceInfo>, TransportError>;

    /// Registers for involuntary disconnect notifications.
    async fn disconnect_events(
        &self,
        device: &DeviceIdentity,
    ) -> Result<DisconnectStream, TransportError>;

    /// Reads the current value of a characteristic.
    async fn read(
        &self,
        device: &DeviceIdentity,
        characteristic: &CharacteristicRef,
    ) -> Result<Vec<u8>, TransportError>;

    /// Writes with response and returns the bytes the peripheral acknowledged.
    async fn write_with_response(
        &self,
        device: &DeviceIdentity,
        characteristic: &CharacteristicRef,
        payload: &[u8],
    ) -> Result<Vec<u8>, TransportError>;

    /// Enables value-change pushes for a characteristic.
    async fn subscribe(
        &self,
        device: &DeviceIdentity,
        characteristic: &CharacteristicRef,
    ) -> Result<NotificationStream, TransportError>;

    /// Disables value-change pushes for a characteristic.
    async fn unsubscribe(
        &self,
        device: &DeviceIdentity,
        characteristic: &CharacteristicRef,
    ) -> Result<(), TransportError>;

    /// Tears down the link.
    async fn disconnect(&self, device: &DeviceIdentity) -> Result<(), TransportError>;
}
