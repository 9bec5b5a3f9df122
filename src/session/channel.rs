//! One remote characteristic and the observations registered on it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::error::TransportError;
use crate::hw::{CharacteristicRef, DeviceIdentity, Transport};
use crate::protocol::ChannelId;

/// A live observation registered under a caller-chosen name.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    name: String,
    channel: ChannelId,
    token: CancellationToken,
}

impl SubscriptionHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Stops update delivery. Cancelling twice is a no-op.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Name-keyed registry of live observations for one connection.
#[derive(Debug, Clone, Default)]
pub struct Subscriptions {
    active: Arc<Mutex<HashMap<String, SubscriptionHandle>>>,
}

impl Subscriptions {
    fn active(&self) -> MutexGuard<'_, HashMap<String, SubscriptionHandle>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `handle`, cancelling any observation already using its name.
    fn register(&self, handle: SubscriptionHandle) {
        if let Some(replaced) = self.active().insert(handle.name.clone(), handle) {
            debug!(name = replaced.name(), "replacing observation");
            replaced.cancel();
        }
    }

    /// Cancels the observation registered as `name`, if there is one.
    pub fn cancel(&self, name: &str) {
        match self.active().remove(name) {
            Some(handle) => handle.cancel(),
            None => trace!(name, "no observation to cancel"),
        }
    }

    /// Cancels every registered observation.
    pub fn cancel_all(&self) {
        for (_name, handle) in self.active().drain() {
            handle.cancel();
        }
    }

    /// Names of live observations, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.active().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Read, write and observe access to one characteristic of a connected peripheral.
///
/// Reads and writes fail with [`TransportError::Disconnected`] as soon as the
/// link-lost token fires, even while the request is still pending.
#[derive(Debug, Clone)]
pub struct CharacteristicChannel {
    transport: Arc<dyn Transport>,
    device: DeviceIdentity,
    id: ChannelId,
    characteristic: CharacteristicRef,
    subscriptions: Subscriptions,
    link_lost: CancellationToken,
    io_timeout: Duration,
}

impl CharacteristicChannel {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        device: DeviceIdentity,
        id: ChannelId,
        characteristic: CharacteristicRef,
        subscriptions: Subscriptions,
        link_lost: CancellationToken,
        io_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            device,
            id,
            characteristic,
            subscriptions,
            link_lost,
            io_timeout,
        }
    }

    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    #[must_use]
    pub fn characteristic(&self) -> &CharacteristicRef {
        &self.characteristic
    }

    /// Reads the current value once.
    ///
    /// # Errors
    ///
    /// Returns the transport error, [`TransportError::Disconnected`] if the
    /// link drops first, or [`TransportError::TimedOut`].
    #[instrument(skip(self), level = "debug", fields(channel = %self.id))]
    pub async fn read_once(&self) -> Result<Vec<u8>, TransportError> {
        guarded(
            &self.link_lost,
            self.io_timeout,
            "read",
            self.transport.read(&self.device, &self.characteristic),
        )
        .await
    }

    /// Writes `payload` and waits for the peripheral to acknowledge it.
    ///
    /// The returned bytes are what the peripheral acknowledged; callers decode
    /// them instead of trusting the request.
    ///
    /// # Errors
    ///
    /// Same as [`Self::read_once`].
    #[instrument(skip(self, payload), level = "debug", fields(channel = %self.id, payload = %hex::encode(payload)))]
    pub async fn write_with_ack(&self, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        guarded(
            &self.link_lost,
            self.io_timeout,
            "write",
            self.transport
                .write_with_response(&self.device, &self.characteristic, payload),
        )
        .await
    }

    /// Delivers every non-empty value push to `on_update`, in arrival order,
    /// until the returned handle is cancelled or the link drops.
    ///
    /// Registering a name that is already in use replaces the older observation.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the subscription cannot be opened.
    #[instrument(skip(self, on_update), level = "debug", fields(channel = %self.id))]
    pub async fn observe<F>(&self, name: &str, mut on_update: F) -> Result<SubscriptionHandle, TransportError>
    where
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        let mut notifications = guarded(
            &self.link_lost,
            self.io_timeout,
            "subscribe",
            self.transport.subscribe(&self.device, &self.characteristic),
        )
        .await?;

        let handle = SubscriptionHandle {
            name: name.to_string(),
            channel: self.id,
            token: self.link_lost.child_token(),
        };
        let token = handle.token.clone();
        let channel = self.id;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    next = notifications.next() => match next {
                        Some(payload) if payload.is_empty() => {
                            trace!(%channel, "dropping empty notification");
                        }
                        Some(payload) => on_update(payload),
                        None => {
                            debug!(%channel, "notification stream ended");
                            break;
                        }
                    },
                }
            }
        });

        self.subscriptions.register(handle.clone());
        Ok(handle)
    }

    /// Cancels the observation registered as `name`; unknown names are ignored.
    pub fn cancel(&self, name: &str) {
        self.subscriptions.cancel(name);
    }

    /// Releases the platform-side subscription, best effort.
    pub(crate) async fn release(&self) {
        if let Err(error) = self
            .transport
            .unsubscribe(&self.device, &self.characteristic)
            .await
        {
            debug!(channel = %self.id, error = %error, "unsubscribe failed");
        }
    }
}

async fn guarded<T, F>(
    link_lost: &CancellationToken,
    timeout: Duration,
    operation: &'static str,
    request: F,
) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    tokio::select! {
        biased;
        () = link_lost.cancelled() => Err(TransportError::Disconnected),
        result = tokio::time::timeout(timeout, request) => {
            result.unwrap_or_else(|_elapsed| Err(TransportError::TimedOut { operation, after: timeout }))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::*;
    use crate::hw::{FakeTransport, FakeTransportConfig};
    use crate::protocol;

    const IO_TIMEOUT: Duration = Duration::from_secs(2);

    async fn connected_channel(
        config: FakeTransportConfig,
        channel: ChannelId,
    ) -> (FakeTransport, CharacteristicChannel) {
        let transport = FakeTransport::new(config);
        let device = DeviceIdentity::new("AA:BB", Some("BLEExample".to_string()), None);
        transport.connect(&device).await.expect("fake connect should succeed");
        let metadata = protocol::channel_metadata(channel);
        let characteristic =
            CharacteristicRef::new(metadata.service_uuid(), metadata.characteristic_uuid());
        let handle = CharacteristicChannel::new(
            Arc::new(transport.clone()),
            device,
            channel,
            characteristic,
            Subscriptions::default(),
            CancellationToken::new(),
            IO_TIMEOUT,
        );
        (transport, handle)
    }

    fn config() -> FakeTransportConfig {
        FakeTransportConfig::builder()
            .scan_fixture("AA:BB|BLEExample|-43".parse().expect("fixture should parse"))
            .message("Hello")
            .build()
    }

    #[tokio::test]
    async fn read_once_returns_current_value() {
        let (_transport, channel) = connected_channel(config(), ChannelId::Message).await;

        assert_eq!(b"Hello".to_vec(), channel.read_once().await.expect("read should succeed"));
    }

    #[tokio::test]
    async fn write_returns_acknowledged_bytes() {
        let (transport, channel) = connected_channel(config(), ChannelId::Box).await;

        let ack = channel.write_with_ack(b"1").await.expect("write should succeed");

        assert_eq!(b"1".to_vec(), ack);
        assert_eq!(vec![b"1".to_vec()], transport.written(ChannelId::Box));
    }

    #[tokio::test]
    async fn observe_drops_empty_payloads_and_keeps_order() {
        let (transport, channel) = connected_channel(config(), ChannelId::Message).await;
        let (sender, mut received) = mpsc::unbounded_channel();

        let _handle = channel
            .observe("messagetransaction", move |payload| {
                let _ignored = sender.send(payload);
            })
            .await
            .expect("observe should succeed");
        transport.push(ChannelId::Message, "first");
        transport.push(ChannelId::Message, Vec::new());
        transport.push(ChannelId::Message, "second");

        assert_eq!(Some(b"first".to_vec()), received.recv().await);
        assert_eq!(Some(b"second".to_vec()), received.recv().await);
    }

    #[tokio::test]
    async fn observing_same_name_replaces_previous_handle() {
        let (_transport, channel) = connected_channel(config(), ChannelId::Box).await;
        let calls = Arc::new(AtomicUsize::new(0));

        let first = channel
            .observe("boxtransaction", |_payload| {})
            .await
            .expect("observe should succeed");
        let counter = Arc::clone(&calls);
        let second = channel
            .observe("boxtransaction", move |_payload| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .expect("re-observe should succeed");

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(vec!["boxtransaction".to_string()], channel.subscriptions.names());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (_transport, channel) = connected_channel(config(), ChannelId::Box).await;
        let handle = channel
            .observe("boxtransaction", |_payload| {})
            .await
            .expect("observe should succeed");

        channel.cancel("boxtransaction");
        channel.cancel("boxtransaction");
        channel.cancel("never-registered");

        assert!(handle.is_cancelled());
        assert!(channel.subscriptions.names().is_empty());
    }

    #[tokio::test]
    async fn link_loss_fails_pending_write() {
        let slow = FakeTransportConfig::builder()
            .scan_fixture("AA:BB|BLEExample|-43".parse().expect("fixture should parse"))
            .ack_delay(Duration::from_millis(500))
            .build();
        let (_transport, channel) = connected_channel(slow, ChannelId::Box).await;
        let link_lost = channel.link_lost.clone();

        let (result, ()) = tokio::join!(channel.write_with_ack(b"1"), async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            link_lost.cancel();
        });

        assert_matches!(result, Err(TransportError::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_acknowledgement_times_out() {
        let slow = FakeTransportConfig::builder()
            .scan_fixture("AA:BB|BLEExample|-43".parse().expect("fixture should parse"))
            .ack_delay(IO_TIMEOUT * 2)
            .build();
        let (_transport, channel) = connected_channel(slow, ChannelId::Box).await;

        let result = channel.write_with_ack(b"0").await;

        assert_matches!(result, Err(TransportError::TimedOut { operation: "write", .. }));
    }
}
