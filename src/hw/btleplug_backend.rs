use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace};

use super::model::{CharacteristicInfo, CharacteristicRef, DeviceIdentity, ServiceInfo};
use super::transport::{AdvertisementStream, DisconnectStream, NotificationStream, Transport};
use crate::error::TransportError;

const ADVERTISEMENT_BUFFER: usize = 64;

/// Transport backed by `btleplug` and the platform Bluetooth stack.
#[derive(Debug)]
pub struct BtleplugTransport {
    adapters: Vec<AdapterHandle>,
    peripherals: Arc<Mutex<HashMap<String, KnownPeripheral>>>,
    sweep: Mutex<Option<CancellationToken>>,
}

#[derive(Debug)]
struct AdapterHandle {
    adapter: Adapter,
    name: String,
}

#[derive(Debug, Clone)]
struct KnownPeripheral {
    adapter_index: usize,
    peripheral: Peripheral,
}

impl BtleplugTransport {
    /// Opens every available adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform manager cannot be created or no adapter exists.
    #[instrument(level = "debug")]
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        if adapters.is_empty() {
            return Err(TransportError::NoAdapters);
        }

        let mut handles = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            let name = adapter.adapter_info().await?;
            handles.push(AdapterHandle { adapter, name });
        }
        info!(adapter_count = handles.len(), "opened BLE adapters");

        Ok(Self {
            adapters: handles,
            peripherals: Arc::default(),
            sweep: Mutex::new(None),
        })
    }

    async fn known(&self, device: &DeviceIdentity) -> Result<KnownPeripheral, TransportError> {
        self.peripherals
            .lock()
            .await
            .get(device.device_id())
            .cloned()
            .ok_or_else(|| TransportError::UnknownDevice {
                device_id: device.device_id().to_string(),
            })
    }

    async fn characteristic(
        &self,
        device: &DeviceIdentity,
        target: &CharacteristicRef,
    ) -> Result<(Peripheral, Characteristic), TransportError> {
        let known = self.known(device).await?;
        let characteristic = known
            .peripheral
            .characteristics()
            .into_iter()
            .find(|candidate| {
                candidate
                    .uuid
                    .to_string()
                    .eq_ignore_ascii_case(target.uuid())
                    && candidate
                        .service_uuid
                        .to_string()
                        .eq_ignore_ascii_case(target.service_uuid())
            })
            .ok_or_else(|| TransportError::MissingCharacteristic {
                uuid: target.uuid().to_string(),
            })?;
        Ok((known.peripheral, characteristic))
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    #[instrument(skip(self), level = "debug")]
    async fn start_scan(&self) -> Result<AdvertisementStream, TransportError> {
        let mut events = StreamMap::new();
        for (index, handle) in self.adapters.iter().enumerate() {
            events.insert(index, handle.adapter.events().await?);
        }
        for handle in &self.adapters {
            handle.adapter.start_scan(ScanFilter::default()).await?;
            debug!(adapter = %handle.name, "adapter scan started");
        }

        let cancel = CancellationToken::new();
        if let Some(previous) = self.sweep.lock().await.replace(cancel.clone()) {
            previous.cancel();
        }

        let (sender, receiver) = mpsc::channel(ADVERTISEMENT_BUFFER);
        let adapters: Vec<Adapter> = self
            .adapters
            .iter()
            .map(|handle| handle.adapter.clone())
            .collect();
        let registry = Arc::clone(&self.peripherals);
        tokio::spawn(async move {
            loop {
                let (adapter_index, event) = tokio::select! {
                    () = cancel.cancelled() => break,
                    next = events.next() => match next {
                        Some(item) => item,
                        None => break,
                    },
                };
                let (CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) = event
                else {
                    continue;
                };

                let identity = advertised_identity(&adapters[adapter_index], &id)
                    .await
                    .map(|(identity, peripheral)| {
                        (identity, KnownPeripheral { adapter_index, peripheral })
                    });
                let identity = match identity {
                    Ok((identity, known)) => {
                        registry
                            .lock()
                            .await
                            .insert(identity.device_id().to_string(), known);
                        Ok(identity)
                    }
                    Err(error) => Err(error),
                };
                if sender.send(identity).await.is_err() {
                    break;
                }
            }
            trace!("advertisement forwarder stopped");
        });

        Ok(Box::pin(ReceiverStream::new(receiver)))
    }

    #[instrument(skip(self), level = "debug")]
    async fn stop_scan(&self) -> Result<(), TransportError> {
        if let Some(cancel) = self.sweep.lock().await.take() {
            cancel.cancel();
        }
        for handle in &self.adapters {
            handle.adapter.stop_scan().await?;
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(device_id = device.device_id()))]
    async fn connect(&self, device: &DeviceIdentity) -> Result<(), TransportError> {
        let known = self.known(device).await?;
        if !known.peripheral.is_connected().await? {
            known.peripheral.connect().await?;
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(device_id = device.device_id()))]
    async fn discover(&self, device: &DeviceIdentity) -> Result<Vec<ServiceInfo>, TransportError> {
        let known = self.known(device).await?;
        known.peripheral.discover_services().await?;
        Ok(collect_services(&known.peripheral))
    }

    #[instrument(skip(self), level = "debug", fields(device_id = device.device_id()))]
    async fn disconnect_events(
        &self,
        device: &DeviceIdentity,
    ) -> Result<DisconnectStream, TransportError> {
        let known = self.known(device).await?;
        let target = known.peripheral.id();
        let events = self.adapters[known.adapter_index].adapter.events().await?;
        let disconnects = events.filter_map(move |event| match event {
            CentralEvent::DeviceDisconnected(id) if id == target => Some(()),
            _ => None,
        });
        Ok(Box::pin(disconnects))
    }

    #[instrument(skip(self), level = "trace", fields(uuid = characteristic.uuid()))]
    async fn read(
        &self,
        device: &DeviceIdentity,
        characteristic: &CharacteristicRef,
    ) -> Result<Vec<u8>, TransportError> {
        let (peripheral, resolved) = self.characteristic(device, characteristic).await?;
        Ok(peripheral.read(&resolved).await?)
    }

    #[instrument(
        skip(self, payload),
        level = "trace",
        fields(uuid = characteristic.uuid(), payload_len = payload.len())
    )]
    async fn write_with_response(
        &self,
        device: &DeviceIdentity,
        characteristic: &CharacteristicRef,
        payload: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        let (peripheral, resolved) = self.characteristic(device, characteristic).await?;
        peripheral
            .write(&resolved, payload, WriteType::WithResponse)
            .await?;
        // The platform stacks confirm the write without echoing a value back.
        Ok(payload.to_vec())
    }

    #[instrument(skip(self), level = "trace", fields(uuid = characteristic.uuid()))]
    async fn subscribe(
        &self,
        device: &DeviceIdentity,
        characteristic: &CharacteristicRef,
    ) -> Result<NotificationStream, TransportError> {
        let (peripheral, resolved) = self.characteristic(device, characteristic).await?;
        let notifications = peripheral.notifications().await?;
        peripheral.subscribe(&resolved).await?;

        let uuid = resolved.uuid;
        let values = notifications.filter_map(move |notification| {
            (notification.uuid == uuid).then_some(notification.value)
        });
        Ok(Box::pin(values))
    }

    #[instrument(skip(self), level = "trace", fields(uuid = characteristic.uuid()))]
    async fn unsubscribe(
        &self,
        device: &DeviceIdentity,
        characteristic: &CharacteristicRef,
    ) -> Result<(), TransportError> {
        let (peripheral, resolved) = self.characteristic(device, characteristic).await?;
        peripheral.unsubscribe(&resolved).await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(device_id = device.device_id()))]
    async fn disconnect(&self, device: &DeviceIdentity) -> Result<(), TransportError> {
        let known = self.known(device).await?;
        if known.peripheral.is_connected().await? {
            known.peripheral.disconnect().await?;
        }
        Ok(())
    }
}

async fn advertised_identity(
    adapter: &Adapter,
    id: &PeripheralId,
) -> Result<(DeviceIdentity, Peripheral), TransportError> {
    let peripheral = adapter.peripheral(id).await?;
    let properties = peripheral.properties().await?.unwrap_or_default();
    let identity = DeviceIdentity::new(
        peripheral.id().to_string(),
        properties.local_name,
        properties.rssi,
    );
    Ok((identity, peripheral))
}

fn collect_services(peripheral: &Peripheral) -> Vec<ServiceInfo> {
    let mut services: Vec<ServiceInfo> = peripheral
        .services()
        .into_iter()
        .map(|service| {
            let mut characteristics: Vec<CharacteristicInfo> = service
                .characteristics
                .iter()
                .map(|characteristic| {
                    CharacteristicInfo::new(
                        characteristic.uuid.to_string().to_lowercase(),
                        property_labels(characteristic.properties),
                    )
                })
                .collect();
            characteristics.sort_by(|left, right| left.uuid().cmp(right.uuid()));
            ServiceInfo::new(service.uuid.to_string().to_lowercase(), characteristics)
        })
        .collect();
    services.sort_by(|left, right| left.uuid().cmp(right.uuid()));
    services
}

fn property_labels(flags: CharPropFlags) -> Vec<String> {
    let mut labels = Vec::new();
    if flags.contains(CharPropFlags::READ) {
        labels.push("read".to_string());
    }
    if flags.contains(CharPropFlags::WRITE) {
        labels.push("write".to_string());
    }
    if flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
        labels.push("write_without_response".to_string());
    }
    if flags.contains(CharPropFlags::NOTIFY) {
        labels.push("notify".to_string());
    }
    if flags.contains(CharPropFlags::INDICATE) {
        labels.push("indicate".to_string());
    }
    labels
}
