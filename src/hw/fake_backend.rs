use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tracing::{debug, info, instrument};

use super::model::{CharacteristicInfo, CharacteristicRef, DeviceIdentity, ServiceInfo};
use super::transport::{AdvertisementStream, DisconnectStream, NotificationStream, Transport};
use crate::codec::{self, BoxState};
use crate::error::{FixtureError, TransportError};
use crate::protocol::{self, ChannelId};

const DEFAULT_MESSAGE: &str = "Hello";
const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(10);

/// Parsed fake scan fixture records.
#[derive(Debug, Clone, derive_more::Into)]
pub struct ScanFixture {
    devices: Vec<DeviceIdentity>,
}

impl FromStr for ScanFixture {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim().is_empty() {
            return Err(FixtureError::EmptyFixture);
        }
        let devices = value
            .split(';')
            .map(parse_scan_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { devices })
    }
}

/// One scripted value push from the fake peripheral.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FakeUpdate {
    channel: ChannelId,
    payload: Vec<u8>,
}

impl FakeUpdate {
    #[must_use]
    pub fn new(channel: ChannelId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }
}

impl FromStr for FakeUpdate {
    type Err = FixtureError;

    /// Parses `message:<text>`, `box:<0|1>` or `hex:<channel>:<bytes>`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || FixtureError::InvalidUpdate {
            record: value.to_string(),
        };
        let (kind, rest) = value.split_once(':').ok_or_else(invalid)?;
        match kind.trim() {
            "message" => Ok(Self::new(ChannelId::Message, rest.as_bytes())),
            "box" => Ok(Self::new(ChannelId::Box, codec::encode_box(parse_box(rest)?))),
            "hex" => {
                let (channel, bytes) = rest.split_once(':').ok_or_else(invalid)?;
                let channel = match channel.trim() {
                    "message" => ChannelId::Message,
                    "box" => ChannelId::Box,
                    _ => return Err(invalid()),
                };
                Ok(Self::new(channel, hex::decode(bytes.trim())?))
            }
            _ => Err(invalid()),
        }
    }
}

/// Parsed comma-separated list of scripted updates.
#[derive(Debug, Clone, Default, derive_more::Into)]
pub struct FakeUpdates {
    updates: Vec<FakeUpdate>,
}

impl FromStr for FakeUpdates {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim().is_empty() {
            return Ok(Self::default());
        }
        let updates = value
            .split(',')
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { updates })
    }
}

/// Parses a box fixture value (`0`/`1`, `on`/`off`).
pub(crate) fn parse_box(value: &str) -> Result<BoxState, FixtureError> {
    match value.trim() {
        "1" | "on" => Ok(BoxState::On),
        "0" | "off" => Ok(BoxState::Off),
        other => Err(FixtureError::InvalidBoxValue {
            value: other.to_string(),
        }),
    }
}

/// Settings for the fake peripheral and radio.
#[derive(Debug, Clone, Builder)]
pub struct FakeTransportConfig {
    scan_fixture: ScanFixture,
    /// Delay before the first advertisement is reported.
    #[builder(default)]
    advertise_delay: Duration,
    #[builder(into, default = DEFAULT_MESSAGE.to_string())]
    message: String,
    #[builder(default)]
    box_value: BoxState,
    /// Pushes emitted once the matching channel is observed.
    #[builder(default)]
    updates: Vec<FakeUpdate>,
    #[builder(default = DEFAULT_UPDATE_INTERVAL)]
    update_interval: Duration,
    /// Delay between a write reaching the peripheral and its acknowledgement.
    #[builder(default)]
    ack_delay: Duration,
    /// Whether accepted writes are echoed back as notifications.
    #[builder(default = true)]
    echo_writes: bool,
    #[builder(default)]
    fail_scan_start: bool,
    #[builder(default)]
    fail_scan_midway: bool,
    #[builder(default)]
    fail_connect: bool,
    /// Channel omitted from the discovered service table.
    missing_channel: Option<ChannelId>,
    /// Channel whose reads fail.
    failing_read: Option<ChannelId>,
    /// Delay before a read is answered.
    #[builder(default)]
    read_delay: Duration,
    #[builder(default)]
    fail_writes: bool,
    /// Delay before a platform subscription is released.
    #[builder(default)]
    unsubscribe_delay: Duration,
    /// Number of disconnect calls refused before one succeeds.
    #[builder(default)]
    refused_disconnects: usize,
}

/// Fake transport used in tests and non-hardware runs.
///
/// Clones share one simulated radio, so a test can keep a clone to inspect calls
/// while the session owns another.
#[derive(Debug, Clone)]
pub struct FakeTransport {
    config: Arc<FakeTransportConfig>,
    state: Arc<Mutex<FakeState>>,
}

#[derive(Debug, Default)]
struct FakeState {
    connected: Option<String>,
    values: HashMap<ChannelId, Vec<u8>>,
    subscribers: HashMap<ChannelId, mpsc::UnboundedSender<Vec<u8>>>,
    disconnect_listeners: Vec<mpsc::UnboundedSender<()>>,
    pending_updates: Vec<FakeUpdate>,
    written: HashMap<ChannelId, Vec<Vec<u8>>>,
    refused_disconnects: usize,
    start_scan_calls: usize,
    stop_scan_calls: usize,
    connect_calls: usize,
    disconnect_calls: usize,
}

impl FakeTransport {
    #[must_use]
    pub fn new(config: FakeTransportConfig) -> Self {
        let values = HashMap::from([
            (ChannelId::Message, config.message.as_bytes().to_vec()),
            (ChannelId::Box, codec::encode_box(config.box_value)),
        ]);
        let state = FakeState {
            values,
            pending_updates: config.updates.clone(),
            refused_disconnects: config.refused_disconnects,
            ..FakeState::default()
        };
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of `start_scan` calls observed.
    #[must_use]
    pub fn start_scan_calls(&self) -> usize {
        self.state().start_scan_calls
    }

    /// Number of `stop_scan` calls observed.
    #[must_use]
    pub fn stop_scan_calls(&self) -> usize {
        self.state().stop_scan_calls
    }

    /// Number of `connect` calls observed.
    #[must_use]
    pub fn connect_calls(&self) -> usize {
        self.state().connect_calls
    }

    /// Number of transport-level `disconnect` calls observed.
    #[must_use]
    pub fn disconnect_calls(&self) -> usize {
        self.state().disconnect_calls
    }

    /// Number of observation subscriptions still being consumed.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.state()
            .subscribers
            .values()
            .filter(|sender| !sender.is_closed())
            .count()
    }

    /// Whether the fake link is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().connected.is_some()
    }

    /// Payloads written to a channel, oldest first.
    #[must_use]
    pub fn written(&self, channel: ChannelId) -> Vec<Vec<u8>> {
        self.state()
            .written
            .get(&channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Pushes a value change as the peripheral would. Returns whether anyone was subscribed.
    pub fn push(&self, channel: ChannelId, payload: impl Into<Vec<u8>>) -> bool {
        let payload = payload.into();
        let mut state = self.state();
        if !payload.is_empty() {
            state.values.insert(channel, payload.clone());
        }
        state
            .subscribers
            .get(&channel)
            .is_some_and(|sender| sender.send(payload).is_ok())
    }

    /// Drops the link from the peripheral side.
    pub fn drop_link(&self) {
        let mut state = self.state();
        if state.connected.take().is_none() {
            return;
        }
        info!("fake peripheral dropped the link");
        state.subscribers.clear();
        state
            .disconnect_listeners
            .retain(|listener| listener.send(()).is_ok());
    }

    fn channel_for(characteristic: &CharacteristicRef) -> Result<ChannelId, TransportError> {
        protocol::channel_for_uuid(characteristic.uuid()).ok_or_else(|| {
            TransportError::MissingCharacteristic {
                uuid: characteristic.uuid().to_string(),
            }
        })
    }

    fn ensure_connected(&self, device: &DeviceIdentity) -> Result<(), TransportError> {
        match &self.state().connected {
            Some(device_id) if device_id == device.device_id() => Ok(()),
            _ => Err(TransportError::Disconnected),
        }
    }

    fn spawn_scripted_updates(&self, channel: ChannelId, sender: mpsc::UnboundedSender<Vec<u8>>) {
        let scripted: Vec<Vec<u8>> = {
            let mut state = self.state();
            let (matching, remaining) = std::mem::take(&mut state.pending_updates)
                .into_iter()
                .partition(|update| update.channel == channel);
            state.pending_updates = remaining;
            matching.into_iter().map(|update| update.payload).collect()
        };
        if scripted.is_empty() {
            return;
        }

        let interval = self.config.update_interval;
        let fake = self.clone();
        tokio::spawn(async move {
            for payload in scripted {
                sleep(interval).await;
                if sender.is_closed() {
                    return;
                }
                if !payload.is_empty() {
                    fake.state().values.insert(channel, payload.clone());
                }
                if sender.send(payload).is_err() {
                    return;
                }
            }
        });
    }
}

#[async_trait]
impl Transport for FakeTransport {
    #[instrument(skip(self), level = "debug")]
    async fn start_scan(&self) -> Result<AdvertisementStream, TransportError> {
        self.state().start_scan_calls += 1;
        if self.config.fail_scan_start {
            return Err(TransportError::Rejected {
                operation: "start scan",
                reason: "radio is powered off".to_string(),
            });
        }

        let devices: Vec<DeviceIdentity> = self.config.scan_fixture.clone().into();
        let delay = self.config.advertise_delay;
        let fail_midway = self.config.fail_scan_midway;
        let (sender, receiver) = mpsc::channel(devices.len().max(1));
        tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            if fail_midway {
                let error = TransportError::Rejected {
                    operation: "scan",
                    reason: "cannot start scanning operation".to_string(),
                };
                if sender.send(Err(error)).await.is_err() {
                    return;
                }
            }
            for device in devices {
                if sender.send(Ok(device)).await.is_err() {
                    return;
                }
            }
            sender.closed().await;
        });

        Ok(Box::pin(ReceiverStream::new(receiver)))
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.state().stop_scan_calls += 1;
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(device_id = device.device_id()))]
    async fn connect(&self, device: &DeviceIdentity) -> Result<(), TransportError> {
        let devices: Vec<DeviceIdentity> = self.config.scan_fixture.clone().into();
        let mut state = self.state();
        state.connect_calls += 1;
        if !devices
            .iter()
            .any(|known| known.device_id() == device.device_id())
        {
            return Err(TransportError::UnknownDevice {
                device_id: device.device_id().to_string(),
            });
        }
        if self.config.fail_connect {
            return Err(TransportError::Rejected {
                operation: "connect",
                reason: "peripheral refused the connection".to_string(),
            });
        }
        state.connected = Some(device.device_id().to_string());
        Ok(())
    }

    async fn discover(&self, device: &DeviceIdentity) -> Result<Vec<ServiceInfo>, TransportError> {
        self.ensure_connected(device)?;
        Ok(fake_services(self.config.missing_channel))
    }

    async fn disconnect_events(
        &self,
        device: &DeviceIdentity,
    ) -> Result<DisconnectStream, TransportError> {
        self.ensure_connected(device)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.state().disconnect_listeners.push(sender);
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    async fn read(
        &self,
        device: &DeviceIdentity,
        characteristic: &CharacteristicRef,
    ) -> Result<Vec<u8>, TransportError> {
        self.ensure_connected(device)?;
        let channel = Self::channel_for(characteristic)?;
        if self.config.failing_read == Some(channel) {
            return Err(TransportError::Rejected {
                operation: "read",
                reason: "attribute not readable".to_string(),
            });
        }
        if !self.config.read_delay.is_zero() {
            sleep(self.config.read_delay).await;
            self.ensure_connected(device)?;
        }
        Ok(self.state().values.get(&channel).cloned().unwrap_or_default())
    }

    async fn write_with_response(
        &self,
        device: &DeviceIdentity,
        characteristic: &CharacteristicRef,
        payload: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        self.ensure_connected(device)?;
        let channel = Self::channel_for(characteristic)?;
        self.state()
            .written
            .entry(channel)
            .or_default()
            .push(payload.to_vec());
        if self.config.fail_writes {
            return Err(TransportError::Rejected {
                operation: "write",
                reason: "write not permitted".to_string(),
            });
        }

        if !self.config.ack_delay.is_zero() {
            sleep(self.config.ack_delay).await;
        }
        self.ensure_connected(device)?;

        if self.config.echo_writes {
            self.push(channel, payload.to_vec());
        } else {
            self.state().values.insert(channel, payload.to_vec());
        }
        Ok(payload.to_vec())
    }

    async fn subscribe(
        &self,
        device: &DeviceIdentity,
        characteristic: &CharacteristicRef,
    ) -> Result<NotificationStream, TransportError> {
        self.ensure_connected(device)?;
        let channel = Self::channel_for(characteristic)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.state().subscribers.insert(channel, sender.clone());
        self.spawn_scripted_updates(channel, sender);
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    async fn unsubscribe(
        &self,
        device: &DeviceIdentity,
        characteristic: &CharacteristicRef,
    ) -> Result<(), TransportError> {
        self.ensure_connected(device)?;
        let channel = Self::channel_for(characteristic)?;
        if !self.config.unsubscribe_delay.is_zero() {
            sleep(self.config.unsubscribe_delay).await;
        }
        self.state().subscribers.remove(&channel);
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(device_id = device.device_id()))]
    async fn disconnect(&self, device: &DeviceIdentity) -> Result<(), TransportError> {
        let mut state = self.state();
        state.disconnect_calls += 1;
        if state.refused_disconnects > 0 && state.connected.is_some() {
            state.refused_disconnects -= 1;
            return Err(TransportError::Rejected {
                operation: "disconnect",
                reason: "peripheral is busy".to_string(),
            });
        }
        if state.connected.take().is_none() {
            debug!("fake link was already down");
            return Ok(());
        }
        state.subscribers.clear();
        // The platform stacks report local teardown through the same event feed.
        state
            .disconnect_listeners
            .retain(|listener| listener.send(()).is_ok());
        Ok(())
    }
}

fn parse_scan_record(raw_record: &str) -> Result<DeviceIdentity, FixtureError> {
    let fields: Vec<&str> = raw_record.split('|').map(str::trim).collect();
    if fields.len() != 3 {
        return Err(FixtureError::InvalidRecordFieldCount);
    }
    if fields.iter().any(|field| field.is_empty()) {
        return Err(FixtureError::EmptyRecordField);
    }

    let local_name = (fields[1] != "-").then(|| fields[1].to_string());
    let rssi = if fields[2] == "-" {
        None
    } else {
        Some(fields[2].parse::<i16>()?)
    };

    Ok(DeviceIdentity::new(fields[0], local_name, rssi))
}

fn fake_services(missing_channel: Option<ChannelId>) -> Vec<ServiceInfo> {
    let characteristics = protocol::known_channels()
        .filter(|channel| Some(*channel) != missing_channel)
        .map(|channel| {
            let metadata = protocol::channel_metadata(channel);
            let required = metadata.required();
            let mut properties = vec!["read".to_string(), "notify".to_string()];
            if required.write {
                properties.push("write".to_string());
            }
            CharacteristicInfo::new(metadata.characteristic_uuid(), properties)
        })
        .collect();

    vec![ServiceInfo::new(protocol::SERVICE_UUID, characteristics)]
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("AA:BB|BLEExample|-43", 1)]
    #[case("00:11|Speaker|-65;AA:BB|BLEExample|-", 2)]
    fn scan_fixture_parses_records(#[case] fixture: &str, #[case] expected_len: usize) {
        let parsed: ScanFixture = fixture.parse().expect("fixture should parse");
        let devices: Vec<DeviceIdentity> = parsed.into();
        assert_eq!(expected_len, devices.len());
        assert!(devices.iter().any(|device| device.is_named("BLEExample")));
    }

    #[test]
    fn scan_fixture_rejects_invalid_field_count() {
        let result = "AA:BB|BLEExample".parse::<ScanFixture>();
        assert_matches!(result, Err(FixtureError::InvalidRecordFieldCount));
    }

    #[test]
    fn scan_fixture_treats_dash_as_absent() {
        let record = parse_scan_record("AA:BB|-|-").expect("record should parse");
        assert_eq!(None, record.local_name());
        assert_eq!(None, record.rssi());
    }

    #[rstest]
    #[case("message:Hi there", FakeUpdate::new(ChannelId::Message, "Hi there"))]
    #[case("box:1", FakeUpdate::new(ChannelId::Box, "1"))]
    #[case("box:off", FakeUpdate::new(ChannelId::Box, "0"))]
    #[case("hex:box:", FakeUpdate::new(ChannelId::Box, Vec::new()))]
    #[case("hex:message:4869", FakeUpdate::new(ChannelId::Message, "Hi"))]
    fn updates_parse_from_fixture_text(#[case] raw: &str, #[case] expected: FakeUpdate) {
        assert_eq!(expected, raw.parse::<FakeUpdate>().expect("update should parse"));
    }

    #[rstest]
    #[case("light:1")]
    #[case("box:maybe")]
    #[case("hex:lamp:01")]
    fn invalid_updates_are_rejected(#[case] raw: &str) {
        assert!(raw.parse::<FakeUpdate>().is_err());
    }

    #[test]
    fn missing_channel_is_left_out_of_discovery() {
        let services = fake_services(Some(ChannelId::Box));
        assert_eq!(1, services[0].characteristics().len());
        assert_eq!(protocol::MESSAGE_UUID, services[0].characteristics()[0].uuid());
    }
}
