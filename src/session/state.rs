use serde::Serialize;
use strum_macros::{Display, EnumIter};

use crate::error::InvalidTransition;

/// Lifecycle state of a device session.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Display, EnumIter, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Discovering,
    Syncing,
    Connected,
    Disconnecting,
    Failed,
}

/// Inputs to the session state machine.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SessionEvent {
    ScanStarted,
    ScanEnded,
    ConnectRequested,
    ConnectSucceeded,
    ConnectFailed,
    DiscoverySucceeded,
    DiscoveryFailed,
    InitialReadsComplete,
    SyncFailed,
    RemoteDisconnectNotified,
    DisconnectRequested,
    TransportDisconnected,
    DisconnectFailed,
    Reset,
}

impl SessionState {
    /// Applies one event, returning the next state.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] when `event` is not legal in this state.
    pub fn apply(self, event: SessionEvent) -> Result<Self, InvalidTransition> {
        use SessionEvent as E;
        use SessionState as S;

        let next = match (self, event) {
            (_, E::Reset) => S::Idle,
            (S::Idle, E::ScanStarted) => S::Scanning,
            (S::Scanning, E::ScanEnded) => S::Idle,
            (S::Idle | S::Scanning, E::ConnectRequested) => S::Connecting,
            (S::Connecting, E::ConnectSucceeded) => S::Discovering,
            (S::Connecting, E::ConnectFailed) => S::Failed,
            (S::Discovering, E::DiscoverySucceeded) => S::Syncing,
            (S::Discovering, E::DiscoveryFailed) => S::Failed,
            (S::Syncing, E::InitialReadsComplete) => S::Connected,
            (S::Syncing, E::SyncFailed) => S::Failed,
            (S::Syncing | S::Connected, E::RemoteDisconnectNotified) => S::Idle,
            (S::Connected, E::DisconnectRequested) => S::Disconnecting,
            (S::Disconnecting, E::TransportDisconnected) => S::Idle,
            (S::Disconnecting, E::DisconnectFailed) => S::Failed,
            (from, event) => return Err(InvalidTransition { from, event }),
        };
        Ok(next)
    }

    /// Whether observation subscriptions may be live in this state.
    #[must_use]
    pub fn holds_subscriptions(self) -> bool {
        matches!(self, Self::Syncing | Self::Connected)
    }

    /// Whether a connect pipeline is running.
    #[must_use]
    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            Self::Scanning | Self::Connecting | Self::Discovering | Self::Syncing
        )
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use strum::IntoEnumIterator;

    use super::*;

    #[rstest]
    #[case(SessionState::Idle, SessionEvent::ConnectRequested, SessionState::Connecting)]
    #[case(SessionState::Idle, SessionEvent::ScanStarted, SessionState::Scanning)]
    #[case(SessionState::Scanning, SessionEvent::ConnectRequested, SessionState::Connecting)]
    #[case(SessionState::Scanning, SessionEvent::ScanEnded, SessionState::Idle)]
    #[case(SessionState::Connecting, SessionEvent::ConnectSucceeded, SessionState::Discovering)]
    #[case(SessionState::Connecting, SessionEvent::ConnectFailed, SessionState::Failed)]
    #[case(SessionState::Discovering, SessionEvent::DiscoverySucceeded, SessionState::Syncing)]
    #[case(SessionState::Discovering, SessionEvent::DiscoveryFailed, SessionState::Failed)]
    #[case(SessionState::Syncing, SessionEvent::InitialReadsComplete, SessionState::Connected)]
    #[case(SessionState::Syncing, SessionEvent::SyncFailed, SessionState::Failed)]
    #[case(SessionState::Syncing, SessionEvent::RemoteDisconnectNotified, SessionState::Idle)]
    #[case(SessionState::Connected, SessionEvent::RemoteDisconnectNotified, SessionState::Idle)]
    #[case(SessionState::Connected, SessionEvent::DisconnectRequested, SessionState::Disconnecting)]
    #[case(SessionState::Disconnecting, SessionEvent::TransportDisconnected, SessionState::Idle)]
    #[case(SessionState::Disconnecting, SessionEvent::DisconnectFailed, SessionState::Failed)]
    fn legal_transitions(
        #[case] from: SessionState,
        #[case] event: SessionEvent,
        #[case] expected: SessionState,
    ) {
        assert_eq!(Ok(expected), from.apply(event));
    }

    #[rstest]
    #[case(SessionState::Failed, SessionEvent::ConnectRequested)]
    #[case(SessionState::Connected, SessionEvent::ConnectRequested)]
    #[case(SessionState::Connecting, SessionEvent::ConnectRequested)]
    #[case(SessionState::Idle, SessionEvent::DisconnectRequested)]
    #[case(SessionState::Idle, SessionEvent::RemoteDisconnectNotified)]
    #[case(SessionState::Connected, SessionEvent::ScanStarted)]
    fn illegal_transitions_are_rejected(#[case] from: SessionState, #[case] event: SessionEvent) {
        assert_matches!(
            from.apply(event),
            Err(InvalidTransition { from: rejected, event: rejected_event })
                if rejected == from && rejected_event == event
        );
    }

    #[test]
    fn reset_returns_every_state_to_idle() {
        for state in SessionState::iter() {
            assert_eq!(Ok(SessionState::Idle), state.apply(SessionEvent::Reset));
        }
    }

    #[test]
    fn only_syncing_and_connected_hold_subscriptions() {
        let holding: Vec<SessionState> = SessionState::iter()
            .filter(|state| state.holds_subscriptions())
            .collect();
        assert_eq!(vec![SessionState::Syncing, SessionState::Connected], holding);
    }
}
