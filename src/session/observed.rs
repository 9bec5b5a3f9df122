use serde::Serialize;
use serde_with::skip_serializing_none;

use super::SessionState;
use crate::codec::BoxState;
use crate::hw::{CharacteristicRef, DeviceIdentity};
use crate::protocol::ChannelId;

/// Message shown before the first accepted read.
pub const DEFAULT_MESSAGE: &str = "Nothing Yet";

/// Last accepted value of a channel together with its revision.
///
/// The revision starts at zero and grows by one for every accepted update.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ObservedValue<T> {
    value: T,
    revision: u64,
}

impl<T> ObservedValue<T> {
    #[must_use]
    pub fn new(value: T) -> Self {
        Self { value, revision: 0 }
    }

    #[must_use]
    pub fn value(&self) -> &T {
        &self.value
    }

    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub(crate) fn accept(&mut self, value: T) {
        self.value = value;
        self.revision += 1;
    }
}

/// A resolved characteristic and the observation registered on it, if any.
#[skip_serializing_none]
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct CharacteristicHandle {
    channel: ChannelId,
    characteristic: CharacteristicRef,
    subscription: Option<String>,
}

impl CharacteristicHandle {
    pub(crate) fn new(
        channel: ChannelId,
        characteristic: CharacteristicRef,
        subscription: Option<String>,
    ) -> Self {
        Self {
            channel,
            characteristic,
            subscription,
        }
    }

    #[must_use]
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    #[must_use]
    pub fn characteristic(&self) -> &CharacteristicRef {
        &self.characteristic
    }

    /// Name of the live observation on this characteristic.
    #[must_use]
    pub fn subscription(&self) -> Option<&str> {
        self.subscription.as_deref()
    }
}

/// Everything the presentation layer reads from a session, published as one unit.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct SessionSnapshot {
    state: SessionState,
    connection_status: bool,
    device: Option<DeviceIdentity>,
    message: ObservedValue<String>,
    box_value: ObservedValue<BoxState>,
    handles: Vec<CharacteristicHandle>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            connection_status: false,
            device: None,
            message: ObservedValue::new(DEFAULT_MESSAGE.to_string()),
            box_value: ObservedValue::new(BoxState::Off),
            handles: Vec::new(),
        }
    }
}

impl SessionSnapshot {
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn connection_status(&self) -> bool {
        self.connection_status
    }

    #[must_use]
    pub fn device(&self) -> Option<&DeviceIdentity> {
        self.device.as_ref()
    }

    #[must_use]
    pub fn message(&self) -> &ObservedValue<String> {
        &self.message
    }

    #[must_use]
    pub fn box_value(&self) -> &ObservedValue<BoxState> {
        &self.box_value
    }

    #[must_use]
    pub fn handles(&self) -> &[CharacteristicHandle] {
        &self.handles
    }

    /// Sum of both revisions; grows whenever either value is accepted.
    #[must_use]
    pub fn total_revision(&self) -> u64 {
        self.message.revision + self.box_value.revision
    }

    pub(crate) fn set_state(&mut self, state: SessionState) -> bool {
        replace_if_changed(&mut self.state, state)
    }

    pub(crate) fn set_connection_status(&mut self, connected: bool) -> bool {
        replace_if_changed(&mut self.connection_status, connected)
    }

    pub(crate) fn set_device(&mut self, device: Option<DeviceIdentity>) -> bool {
        replace_if_changed(&mut self.device, device)
    }

    pub(crate) fn set_handles(&mut self, handles: Vec<CharacteristicHandle>) -> bool {
        replace_if_changed(&mut self.handles, handles)
    }

    /// Clears everything tied to an open link; values and revisions stay.
    pub(crate) fn clear_link(&mut self) -> bool {
        let status = self.set_connection_status(false);
        let handles = self.set_handles(Vec::new());
        let device = self.set_device(None);
        status || handles || device
    }

    pub(crate) fn message_mut(&mut self) -> &mut ObservedValue<String> {
        &mut self.message
    }

    pub(crate) fn box_value_mut(&mut self) -> &mut ObservedValue<BoxState> {
        &mut self.box_value
    }
}

fn replace_if_changed<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn accepted_values_advance_revision() {
        let mut observed = ObservedValue::new(BoxState::Off);

        observed.accept(BoxState::On);
        observed.accept(BoxState::On);

        assert_eq!(&BoxState::On, observed.value());
        assert_eq!(2, observed.revision());
    }

    #[test]
    fn default_snapshot_serialises_initial_values() {
        let json = serde_json::to_string(&SessionSnapshot::default())
            .expect("snapshot should serialise");

        assert_snapshot!(json, @r#"{"state":"idle","connection_status":false,"device":null,"message":{"value":"Nothing Yet","revision":0},"box_value":{"value":"off","revision":0},"handles":[]}"#);
    }

    #[test]
    fn unchanged_fields_do_not_report_modification() {
        let mut snapshot = SessionSnapshot::default();

        assert!(!snapshot.set_state(SessionState::Idle));
        assert!(snapshot.set_state(SessionState::Connecting));
        assert!(!snapshot.set_connection_status(false));
    }
}
