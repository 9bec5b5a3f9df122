//! Entry point used by the presentation layer.

use std::sync::Arc;
use std::time::Duration;

use boxsync_macros::progress;
use bon::Builder;
use owo_colors::OwoColorize;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::codec::{self, BoxState};
use crate::error::{ConnectStageError, RequestConnectError, SessionError};
use crate::hw::{DeviceIdentity, Transport};
use crate::permission::{self, PermissionKind, PermissionProvider};
use crate::protocol::{ChannelId, DEFAULT_DEVICE_NAME};
use crate::scanner::Scanner;
use crate::session::{DeviceSession, SessionConfig, SessionSnapshot, SessionState};

/// Default length of a discovery sweep.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(5);

/// Target and timing settings for a controller.
#[derive(Debug, Clone, Builder)]
pub struct ControllerConfig {
    /// Advertised name that identifies the peripheral.
    #[builder(into, default = DEFAULT_DEVICE_NAME.to_string())]
    device_name: String,
    #[builder(default = DEFAULT_SCAN_TIMEOUT)]
    scan_timeout: Duration,
    #[builder(default)]
    session: SessionConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ControllerConfig {
    #[must_use]
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    #[must_use]
    pub fn scan_timeout(&self) -> Duration {
        self.scan_timeout
    }
}

/// Composes the permission gate, the scanner and the device session.
#[derive(Debug)]
pub struct SessionController {
    config: ControllerConfig,
    permissions: Arc<dyn PermissionProvider>,
    scanner: Scanner,
    session: DeviceSession,
}

impl SessionController {
    /// Creates a controller and starts its device session.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        permissions: Arc<dyn PermissionProvider>,
        config: ControllerConfig,
    ) -> Self {
        let session = DeviceSession::spawn(Arc::clone(&transport), config.session);
        Self {
            config,
            permissions,
            scanner: Scanner::new(transport),
            session,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Latest published connection status and values.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    /// Receiver notified whenever the published snapshot changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.session.watch()
    }

    #[must_use]
    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    /// Checks permission, scans for the configured name and connects to the first match.
    ///
    /// # Errors
    ///
    /// Returns [`RequestConnectError::SettingsRedirect`] when the permission is
    /// blocked, and [`RequestConnectError::NotConnected`] for every other failure.
    #[progress(
        message = "Scanning for the peripheral and connecting",
        finished = format!("{} Connected", "✓".green()),
    )]
    #[instrument(skip(self), level = "info", fields(device_name = %self.config.device_name))]
    pub async fn request_connect(&self) -> Result<SessionSnapshot, RequestConnectError> {
        match self.connect_pipeline().await {
            Ok(snapshot) => Ok(snapshot),
            Err(error) => {
                let finish_message = format!("{} Connection failed", "✗".red());
                tracing::Span::current().pb_set_finish_message(&finish_message);
                Err(self.user_facing(error))
            }
        }
    }

    async fn connect_pipeline(&self) -> Result<SessionSnapshot, ConnectStageError> {
        match self.session.settled_state().await? {
            SessionState::Idle | SessionState::Failed => {}
            state if state.is_connecting() => return Err(SessionError::AlreadyConnecting.into()),
            _ => return Err(SessionError::AlreadyConnected.into()),
        }

        permission::ensure_permission(self.permissions.as_ref(), PermissionKind::Location).await?;

        let lease = ScanLease::new(&self.session);
        if let Err(error) = self.session.begin_scan().await {
            lease.release();
            return Err(error.into());
        }
        let scanned = self.scan().await;
        lease.release();
        let device = match scanned {
            Ok(device) => device,
            Err(error) => {
                self.session.end_scan().await?;
                return Err(error);
            }
        };

        Ok(self.session.connect(device).await?)
    }

    async fn scan(&self) -> Result<DeviceIdentity, ConnectStageError> {
        let name = self.config.device_name.as_str();
        let device = self
            .scanner
            .scan(|device| device.is_named(name), self.config.scan_timeout)
            .await?;
        Ok(device)
    }

    fn user_facing(&self, error: ConnectStageError) -> RequestConnectError {
        if matches!(&error, ConnectStageError::Permission(permission) if permission.requires_settings_redirect()) {
            warn!("permission blocked; settings redirect required");
            return RequestConnectError::SettingsRedirect;
        }
        warn!(error = %error, "connect request failed");
        RequestConnectError::NotConnected {
            status: format!("Unable to connect to `{}`", self.config.device_name),
            source: error,
        }
    }

    /// Disconnects the session. Safe to call in any state.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Disconnect`] if the transport refuses to close the link.
    #[instrument(skip(self), level = "info")]
    pub async fn request_disconnect(&self) -> Result<(), SessionError> {
        self.session.disconnect().await
    }

    /// Writes the box value and returns the value the peripheral acknowledged.
    ///
    /// The published box value only moves once the acknowledgement or a
    /// following push is accepted.
    ///
    /// # Errors
    ///
    /// Returns the session's write error.
    #[instrument(skip(self), level = "info")]
    pub async fn set_box_value(&self, value: bool) -> Result<BoxState, SessionError> {
        let payload = codec::encode_box(BoxState::from(value));
        let ack = self.session.write(ChannelId::Box, payload).await?;
        let acknowledged = codec::decode_box(&ack);
        info!(%acknowledged, "box value acknowledged");
        Ok(acknowledged)
    }

    /// Sends the user to system settings to lift a blocked permission.
    pub async fn open_settings(&self) {
        self.permissions.open_settings().await;
    }
}

/// Returns the session to idle if a request is dropped mid-scan.
struct ScanLease<'a> {
    session: &'a DeviceSession,
    armed: bool,
}

impl<'a> ScanLease<'a> {
    fn new(session: &'a DeviceSession) -> Self {
        Self {
            session,
            armed: true,
        }
    }

    fn release(mut self) {
        self.armed = false;
    }
}

impl Drop for ScanLease<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("connect request dropped while scanning");
            self.session.abandon_scan();
        }
    }
}
