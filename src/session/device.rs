//! The device session actor.
//!
//! All state changes happen on one task that drains a single queue of user
//! commands and link events, so no two transitions ever interleave.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, trace, warn};

use super::channel::{CharacteristicChannel, Subscriptions};
use super::observed::{CharacteristicHandle, SessionSnapshot};
use super::state::{SessionEvent, SessionState};
use crate::codec::{BoxState, ChannelValue};
use crate::error::{DiscoveryError, SessionError, TransportError};
use crate::hw::{self, CharacteristicRef, DeviceIdentity, Transport};
use crate::protocol::{self, ChannelId};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeouts applied by the session.
#[derive(Debug, Clone, Copy, Builder)]
pub struct SessionConfig {
    /// Bound on opening the link and enumerating services.
    #[builder(default = DEFAULT_CONNECT_TIMEOUT)]
    connect_timeout: Duration,
    /// Bound on each read, write and subscribe request.
    #[builder(default = DEFAULT_IO_TIMEOUT)]
    io_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    BeginScan { reply: Reply<()> },
    EndScan { reply: Reply<()> },
    Connect {
        device: DeviceIdentity,
        reply: Reply<SessionSnapshot>,
    },
    Disconnect { reply: Reply<()> },
    Write {
        channel: ChannelId,
        payload: Vec<u8>,
        reply: Reply<Vec<u8>>,
    },
    Reset { reply: Reply<()> },
    State { reply: Reply<SessionState> },
}

enum LinkEvent {
    Update {
        attempt: u64,
        channel: ChannelId,
        payload: Vec<u8>,
    },
    RemoteDisconnect {
        attempt: u64,
    },
}

enum Envelope {
    Command(Command),
    Link(LinkEvent),
}

/// Handle to the session actor for one peripheral.
///
/// Clones share the same actor. The actor stops, releasing any link, once the
/// last handle is dropped.
#[derive(Debug, Clone)]
pub struct DeviceSession {
    commands: mpsc::UnboundedSender<Envelope>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command(_command) => formatter.write_str("Command"),
            Self::Link(_event) => formatter.write_str("Link"),
        }
    }
}

impl DeviceSession {
    /// Starts the session actor on the current runtime.
    #[must_use]
    pub fn spawn(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let (commands, queue) = mpsc::unbounded_channel();
        let (publisher, snapshot) = watch::channel(SessionSnapshot::default());
        let actor = SessionActor {
            transport,
            config,
            state: SessionState::Idle,
            attempt: 0,
            link: None,
            publisher,
            events: commands.downgrade(),
        };
        tokio::spawn(actor.run(queue).instrument(info_span!("device_session")));
        Self { commands, snapshot }
    }

    /// Opens a link to `device`, discovers its channels, reads both values and
    /// starts observing them.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AlreadyConnecting`] or
    /// [`SessionError::AlreadyConnected`] if an attempt is running or done, and
    /// the failing stage's error otherwise.
    pub async fn connect(&self, device: DeviceIdentity) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| Command::Connect { device, reply }).await
    }

    /// Cancels every observation, then closes the link.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Disconnect`] if the transport refuses to close the link.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Writes `payload` to `channel` and returns the acknowledged bytes.
    ///
    /// The acknowledgement is accepted into the published snapshot before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConnected`] unless connected,
    /// [`SessionError::Disconnected`] if the link drops first, and
    /// [`SessionError::Runtime`] for other write failures.
    pub async fn write(&self, channel: ChannelId, payload: Vec<u8>) -> Result<Vec<u8>, SessionError> {
        self.request(|reply| Command::Write {
            channel,
            payload,
            reply,
        })
        .await
    }

    /// Forces the session back to idle, cancelling everything.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the actor has stopped.
    pub async fn reset(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Reset { reply }).await
    }

    pub(crate) async fn begin_scan(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::BeginScan { reply }).await
    }

    pub(crate) async fn end_scan(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::EndScan { reply }).await
    }

    /// Queues the end of a scan without waiting for the actor.
    pub(crate) fn abandon_scan(&self) {
        let (reply, _response) = oneshot::channel();
        if self
            .commands
            .send(Envelope::Command(Command::EndScan { reply }))
            .is_err()
        {
            trace!("session stopped; scan already over");
        }
    }

    /// State once every command queued before this call has been applied.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the actor has stopped.
    pub async fn settled_state(&self) -> Result<SessionState, SessionError> {
        self.request(|reply| Command::State { reply }).await
    }

    /// Latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.snapshot.borrow().state()
    }

    /// Receiver that is notified on every published change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Envelope::Command(command(reply)))
            .map_err(|_closed| SessionError::Closed)?;
        response.await.map_err(|_dropped| SessionError::Closed)?
    }
}

/// Resources that exist only while a link is open.
struct Link {
    device: DeviceIdentity,
    channels: HashMap<ChannelId, CharacteristicChannel>,
    subscriptions: Subscriptions,
    link_lost: CancellationToken,
    watcher: CancellationToken,
}

impl Link {
    /// Stops observation delivery and the disconnect watcher.
    fn cancel_observers(&self) {
        self.subscriptions.cancel_all();
        self.watcher.cancel();
    }
}

struct SessionActor {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    state: SessionState,
    attempt: u64,
    link: Option<Link>,
    publisher: watch::Sender<SessionSnapshot>,
    events: mpsc::WeakUnboundedSender<Envelope>,
}

impl SessionActor {
    async fn run(mut self, mut queue: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = queue.recv().await {
            match envelope {
                Envelope::Command(command) => self.handle_command(command).await,
                Envelope::Link(event) => self.handle_link_event(event),
            }
        }

        if let Some(link) = self.link.take() {
            debug!("last session handle dropped; closing link");
            link.cancel_observers();
            link.link_lost.cancel();
            if let Err(error) = self.transport.disconnect(&link.device).await {
                warn!(error = %error, "failed to close link on shutdown");
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        // A closed reply channel means the caller stopped waiting; the work is still done.
        match command {
            Command::BeginScan { reply } => {
                let _ignored = reply.send(self.begin_scan().await);
            }
            Command::EndScan { reply } => {
                let _ignored = reply.send(self.end_scan());
            }
            Command::Connect { device, reply } => {
                let _ignored = reply.send(self.connect(device).await);
            }
            Command::Disconnect { reply } => {
                let _ignored = reply.send(self.disconnect().await);
            }
            Command::Write {
                channel,
                payload,
                reply,
            } => {
                let _ignored = reply.send(self.write(channel, &payload).await);
            }
            Command::Reset { reply } => {
                let _ignored = reply.send(self.reset().await);
            }
            Command::State { reply } => {
                let _ignored = reply.send(Ok(self.state));
            }
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Update {
                attempt,
                channel,
                payload,
            } => {
                if attempt != self.attempt || !self.state.holds_subscriptions() {
                    trace!(attempt, %channel, "dropping stale update");
                    return;
                }
                self.accept(channel, &payload);
            }
            LinkEvent::RemoteDisconnect { attempt } => {
                if attempt != self.attempt || self.link.is_none() {
                    trace!(attempt, "ignoring stale disconnect notification");
                    return;
                }
                if let Err(error) = self.remote_disconnect() {
                    warn!(error = %error, "failed to apply remote disconnect");
                }
            }
        }
    }

    fn transition(&mut self, event: SessionEvent) -> Result<(), SessionError> {
        self.transition_with(event, |_snapshot| false)
    }

    /// Applies `event` and publishes the new state together with `update`.
    fn transition_with(
        &mut self,
        event: SessionEvent,
        update: impl FnOnce(&mut SessionSnapshot) -> bool,
    ) -> Result<(), SessionError> {
        let next = self.state.apply(event)?;
        debug!(from = %self.state, %event, to = %next, "session transition");
        self.state = next;
        self.publisher.send_if_modified(|snapshot| {
            let state = snapshot.set_state(next);
            let updated = update(snapshot);
            state || updated
        });
        Ok(())
    }

    /// Applies an event that leaves the link closed.
    fn close_with(&mut self, event: SessionEvent) -> Result<(), SessionError> {
        self.transition_with(event, SessionSnapshot::clear_link)
    }

    fn publish_handles(&self, observing: bool) {
        let Some(link) = &self.link else {
            return;
        };
        let handles = protocol::known_channels()
            .filter_map(|channel| {
                let resolved = link.channels.get(&channel)?;
                let subscription = observing
                    .then(|| protocol::channel_metadata(channel).subscription_name().to_string());
                Some(CharacteristicHandle::new(
                    channel,
                    resolved.characteristic().clone(),
                    subscription,
                ))
            })
            .collect();
        self.publisher
            .send_if_modified(|snapshot| snapshot.set_handles(handles));
    }

    /// Decodes and publishes one payload. Empty payloads are dropped.
    fn accept(&self, channel: ChannelId, payload: &[u8]) {
        match channel {
            ChannelId::Message => {
                let Some(message) = String::decode(payload) else {
                    trace!(%channel, "dropping empty payload");
                    return;
                };
                self.publisher
                    .send_modify(|snapshot| snapshot.message_mut().accept(message));
            }
            ChannelId::Box => {
                let Some(value) = BoxState::decode(payload) else {
                    trace!(%channel, "dropping empty payload");
                    return;
                };
                self.publisher
                    .send_modify(|snapshot| snapshot.box_value_mut().accept(value));
            }
        }
        debug!(%channel, payload = %hex::encode(payload), "accepted update");
    }

    /// Resets a failed session so a new attempt can start.
    ///
    /// A link whose disconnect was refused is closed first.
    async fn recover_from_failure(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Failed {
            return Ok(());
        }
        if let Some(link) = self.link.take() {
            self.close_transport(&link.device).await;
        }
        self.close_with(SessionEvent::Reset)
    }

    async fn begin_scan(&mut self) -> Result<(), SessionError> {
        self.recover_from_failure().await?;
        match self.state {
            SessionState::Idle => self.transition(SessionEvent::ScanStarted),
            state if state.is_connecting() => Err(SessionError::AlreadyConnecting),
            _ => Err(SessionError::AlreadyConnected),
        }
    }

    fn end_scan(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Scanning {
            self.transition(SessionEvent::ScanEnded)?;
        }
        Ok(())
    }

    #[instrument(skip(self, device), level = "info", fields(device_id = device.device_id(), attempt = self.attempt + 1))]
    async fn connect(&mut self, device: DeviceIdentity) -> Result<SessionSnapshot, SessionError> {
        self.recover_from_failure().await?;
        match self.state {
            SessionState::Idle | SessionState::Scanning => {}
            SessionState::Connecting | SessionState::Discovering | SessionState::Syncing => {
                return Err(SessionError::AlreadyConnecting);
            }
            SessionState::Connected | SessionState::Disconnecting | SessionState::Failed => {
                return Err(SessionError::AlreadyConnected);
            }
        }

        self.attempt += 1;
        let target = device.clone();
        self.transition_with(SessionEvent::ConnectRequested, |snapshot| {
            snapshot.set_device(Some(target))
        })?;

        let connected = tokio::time::timeout(self.config.connect_timeout, self.transport.connect(&device))
            .await
            .unwrap_or_else(|_elapsed| {
                Err(TransportError::TimedOut {
                    operation: "connect",
                    after: self.config.connect_timeout,
                })
            });
        if let Err(error) = connected {
            warn!(error = %error, "connect failed");
            self.close_with(SessionEvent::ConnectFailed)?;
            return Err(SessionError::Connect(error));
        }
        self.transition(SessionEvent::ConnectSucceeded)?;

        let resolved = match self.discover(&device).await {
            Ok(resolved) => resolved,
            Err(error) => {
                warn!(error = %error, "discovery failed");
                self.close_transport(&device).await;
                self.close_with(SessionEvent::DiscoveryFailed)?;
                return Err(error.into());
            }
        };
        self.transition(SessionEvent::DiscoverySucceeded)?;

        self.open_link(device, resolved);
        if let Err(error) = self.watch_disconnects().await {
            return self.abort_sync(SessionError::Watch(error)).await;
        }
        self.publish_handles(false);

        let channels: Vec<CharacteristicChannel> = self.link_channels();
        for channel in &channels {
            match channel.read_once().await {
                Ok(payload) => self.accept(channel.id(), &payload),
                Err(source) => {
                    return self
                        .abort_sync(SessionError::Sync {
                            channel: channel.id(),
                            source,
                        })
                        .await;
                }
            }
        }

        for channel in &channels {
            if let Err(source) = self.observe(channel).await {
                return self
                    .abort_sync(SessionError::Runtime {
                        channel: channel.id(),
                        operation: "subscribe",
                        source,
                    })
                    .await;
            }
        }
        self.publish_handles(true);

        self.transition_with(SessionEvent::InitialReadsComplete, |snapshot| {
            snapshot.set_connection_status(true)
        })?;
        info!("session connected");
        Ok(self.publisher.borrow().clone())
    }

    async fn discover(
        &self,
        device: &DeviceIdentity,
    ) -> Result<HashMap<ChannelId, CharacteristicRef>, DiscoveryError> {
        let services = tokio::time::timeout(self.config.connect_timeout, self.transport.discover(device))
            .await
            .unwrap_or_else(|_elapsed| {
                Err(TransportError::TimedOut {
                    operation: "discover",
                    after: self.config.connect_timeout,
                })
            })?;
        hw::resolve_channels(&services)
    }

    fn open_link(
        &mut self,
        device: DeviceIdentity,
        resolved: HashMap<ChannelId, CharacteristicRef>,
    ) {
        let subscriptions = Subscriptions::default();
        let link_lost = CancellationToken::new();
        let channels = resolved
            .into_iter()
            .map(|(id, characteristic)| {
                let channel = CharacteristicChannel::new(
                    Arc::clone(&self.transport),
                    device.clone(),
                    id,
                    characteristic,
                    subscriptions.clone(),
                    link_lost.clone(),
                    self.config.io_timeout,
                );
                (id, channel)
            })
            .collect();
        self.link = Some(Link {
            device,
            channels,
            subscriptions,
            link_lost,
            watcher: CancellationToken::new(),
        });
    }

    /// Channels of the open link in the fixed protocol order.
    fn link_channels(&self) -> Vec<CharacteristicChannel> {
        let Some(link) = &self.link else {
            return Vec::new();
        };
        protocol::known_channels()
            .filter_map(|channel| link.channels.get(&channel).cloned())
            .collect()
    }

    /// Registers the remote-disconnect handler for the open link.
    async fn watch_disconnects(&self) -> Result<(), TransportError> {
        let Some(link) = &self.link else {
            return Err(TransportError::Disconnected);
        };
        let mut disconnects = self.transport.disconnect_events(&link.device).await?;
        let watcher = link.watcher.clone();
        let link_lost = link.link_lost.clone();
        let events = self.events.clone();
        let attempt = self.attempt;
        tokio::spawn(async move {
            tokio::select! {
                () = watcher.cancelled() => {}
                notified = disconnects.next() => {
                    if notified.is_none() {
                        debug!("disconnect feed closed");
                        return;
                    }
                    info!(attempt, "peripheral disconnected");
                    link_lost.cancel();
                    if let Some(events) = events.upgrade() {
                        let _ignored = events.send(Envelope::Link(LinkEvent::RemoteDisconnect { attempt }));
                    }
                }
            }
        });
        Ok(())
    }

    async fn observe(&self, channel: &CharacteristicChannel) -> Result<(), TransportError> {
        let events = self.events.clone();
        let attempt = self.attempt;
        let id = channel.id();
        let name = protocol::channel_metadata(id).subscription_name();
        channel
            .observe(name, move |payload| {
                let Some(events) = events.upgrade() else {
                    return;
                };
                let update = LinkEvent::Update {
                    attempt,
                    channel: id,
                    payload,
                };
                if events.send(Envelope::Link(update)).is_err() {
                    trace!(channel = %id, "session stopped; dropping update");
                }
            })
            .await?;
        Ok(())
    }

    /// Ends a failed sync: observers first, then the transport.
    async fn abort_sync<T>(&mut self, error: SessionError) -> Result<T, SessionError> {
        let Some(link) = self.link.take() else {
            return Err(error);
        };
        link.cancel_observers();

        if link.link_lost.is_cancelled() {
            info!("link lost while syncing");
            self.close_with(SessionEvent::RemoteDisconnectNotified)?;
            return Err(SessionError::Disconnected);
        }

        warn!(error = %error, "sync failed");
        link.link_lost.cancel();
        self.close_transport(&link.device).await;
        self.close_with(SessionEvent::SyncFailed)?;
        Err(error)
    }

    fn remote_disconnect(&mut self) -> Result<(), SessionError> {
        let Some(link) = self.link.take() else {
            return Ok(());
        };
        link.cancel_observers();
        link.link_lost.cancel();
        // A link held after a refused disconnect is now confirmed closed.
        let event = if self.state == SessionState::Failed {
            SessionEvent::Reset
        } else {
            SessionEvent::RemoteDisconnectNotified
        };
        self.close_with(event)?;
        Ok(())
    }

    #[instrument(skip(self), level = "info", fields(state = %self.state))]
    async fn disconnect(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Idle | SessionState::Disconnecting => {
                debug!("nothing to disconnect");
                Ok(())
            }
            SessionState::Connected => self.close_link().await,
            SessionState::Failed if self.link.is_some() => self.retry_close().await,
            _ => self.reset().await,
        }
    }

    async fn close_link(&mut self) -> Result<(), SessionError> {
        let Some(link) = self.link.take() else {
            self.transition(SessionEvent::DisconnectRequested)?;
            self.close_with(SessionEvent::TransportDisconnected)?;
            return Ok(());
        };

        link.cancel_observers();
        self.transition_with(SessionEvent::DisconnectRequested, |snapshot| {
            snapshot.set_handles(Vec::new())
        })?;
        for channel in link.channels.values() {
            channel.release().await;
        }
        link.link_lost.cancel();

        match self.transport.disconnect(&link.device).await {
            Ok(()) => {
                self.close_with(SessionEvent::TransportDisconnected)?;
                info!("session disconnected");
                Ok(())
            }
            Err(error) => {
                warn!(error = %error, "transport refused to disconnect");
                // Kept for a later disconnect retry.
                self.link = Some(link);
                self.transition(SessionEvent::DisconnectFailed)?;
                Err(SessionError::Disconnect(error))
            }
        }
    }

    /// Retries the transport disconnect for a link that refused to close.
    async fn retry_close(&mut self) -> Result<(), SessionError> {
        let Some(link) = self.link.take() else {
            return self.reset().await;
        };
        match self.transport.disconnect(&link.device).await {
            Ok(()) => {
                self.close_with(SessionEvent::Reset)?;
                info!("session disconnected");
                Ok(())
            }
            Err(error) => {
                warn!(error = %error, "transport refused to disconnect again");
                self.link = Some(link);
                Err(SessionError::Disconnect(error))
            }
        }
    }

    #[instrument(skip(self), level = "debug", fields(state = %self.state))]
    async fn reset(&mut self) -> Result<(), SessionError> {
        self.attempt += 1;
        if let Some(link) = self.link.take() {
            link.cancel_observers();
            link.link_lost.cancel();
            self.close_transport(&link.device).await;
        }
        self.close_with(SessionEvent::Reset)?;
        Ok(())
    }

    #[instrument(skip(self, payload), level = "debug", fields(%channel))]
    async fn write(&mut self, channel: ChannelId, payload: &[u8]) -> Result<Vec<u8>, SessionError> {
        if self.state != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let Some(target) = self
            .link
            .as_ref()
            .and_then(|link| link.channels.get(&channel))
            .cloned()
        else {
            return Err(SessionError::NotConnected);
        };

        match target.write_with_ack(payload).await {
            Ok(ack) => {
                self.accept(channel, &ack);
                Ok(ack)
            }
            Err(error) if error.is_disconnect() => Err(SessionError::Disconnected),
            Err(source) => {
                warn!(error = %source, "write failed; session stays connected");
                Err(SessionError::Runtime {
                    channel,
                    operation: "write",
                    source,
                })
            }
        }
    }

    async fn close_transport(&self, device: &DeviceIdentity) {
        if let Err(error) = self.transport.disconnect(device).await {
            warn!(error = %error, "failed to close link");
        }
    }
}
