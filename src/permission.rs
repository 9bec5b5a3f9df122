//! Radio permission gate run before every discovery sweep.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use clap::ValueEnum;
use tracing::{info, instrument, warn};

use crate::error::PermissionError;

/// Permission the radio stack needs before scanning.
#[derive(Debug, Clone, Copy, Eq, PartialEq, strum_macros::Display)]
pub enum PermissionKind {
    /// Location access, required for BLE discovery on mobile platforms.
    #[strum(to_string = "location")]
    Location,
}

/// Current status reported by the platform.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PermissionStatus {
    Granted,
    Blocked,
    Denied,
    Unavailable,
}

/// Outcome of asking the user for a permission.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RequestOutcome {
    Granted,
    Denied,
}

/// Platform permission service.
#[async_trait]
pub trait PermissionProvider: std::fmt::Debug + Send + Sync {
    async fn check(&self, kind: PermissionKind) -> PermissionStatus;

    async fn request(&self, kind: PermissionKind) -> RequestOutcome;

    /// Opens the platform settings page so the user can lift a block.
    async fn open_settings(&self);
}

/// Ensures `kind` is granted, asking once if it is merely denied.
///
/// # Errors
///
/// Returns [`PermissionError::Blocked`] when only system settings can grant the
/// permission, [`PermissionError::Unavailable`] when the platform cannot grant
/// it at all, and [`PermissionError::Denied`] when the user refuses the request.
#[instrument(skip(provider), level = "debug")]
pub async fn ensure_permission(
    provider: &dyn PermissionProvider,
    kind: PermissionKind,
) -> Result<(), PermissionError> {
    match provider.check(kind).await {
        PermissionStatus::Granted => Ok(()),
        PermissionStatus::Unavailable => Err(PermissionError::Unavailable),
        PermissionStatus::Blocked => {
            warn!(%kind, "permission is blocked");
            Err(PermissionError::Blocked)
        }
        PermissionStatus::Denied => match provider.request(kind).await {
            RequestOutcome::Granted => {
                info!(%kind, "permission granted on request");
                Ok(())
            }
            RequestOutcome::Denied => Err(PermissionError::Denied),
        },
    }
}

/// Desktop BLE stacks do not gate scanning behind a runtime prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPermissions;

#[async_trait]
impl PermissionProvider for SystemPermissions {
    async fn check(&self, _kind: PermissionKind) -> PermissionStatus {
        PermissionStatus::Granted
    }

    async fn request(&self, _kind: PermissionKind) -> RequestOutcome {
        RequestOutcome::Granted
    }

    async fn open_settings(&self) {
        info!("system settings are not needed for BLE access on this platform");
    }
}

/// Scripted permission answers for tests and fake runs.
#[derive(Debug, Clone)]
pub struct FixedPermissions {
    status: PermissionStatus,
    request_outcome: RequestOutcome,
    requests: Arc<AtomicUsize>,
    settings_opened: Arc<AtomicUsize>,
}

impl FixedPermissions {
    #[must_use]
    pub fn new(status: PermissionStatus, request_outcome: RequestOutcome) -> Self {
        Self {
            status,
            request_outcome,
            requests: Arc::new(AtomicUsize::new(0)),
            settings_opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn granted() -> Self {
        Self::new(PermissionStatus::Granted, RequestOutcome::Granted)
    }

    /// Number of times the user was asked.
    #[must_use]
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Number of times the settings page was opened.
    #[must_use]
    pub fn settings_opened(&self) -> usize {
        self.settings_opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionProvider for FixedPermissions {
    async fn check(&self, _kind: PermissionKind) -> PermissionStatus {
        self.status
    }

    async fn request(&self, _kind: PermissionKind) -> RequestOutcome {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.request_outcome
    }

    async fn open_settings(&self) {
        self.settings_opened.fetch_add(1, Ordering::SeqCst);
    }
}
