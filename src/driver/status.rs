use crate::{bridge::GatewayBridge, id::GuildId};
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tracing::debug;

/// State of a voice session, as reported to the bot gateway.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ConnectionStatus {
    /// No connection is active or being attempted.
    NotConnected,
    /// Opening the control websocket.
    AwaitingWebsocketConnect,
    /// IDENTIFY or RESUME has been sent.
    AwaitingAuthenticating,
    /// Negotiating the UDP media path with the voice server.
    AttemptingUdpDiscovery,
    /// SELECT_PROTOCOL has been sent, and the session key is awaited.
    AwaitingReady,
    /// Audio may be sent and received.
    Connected,
    /// The handshake did not complete in time.
    ErrorConnectionTimeout,
    /// UDP discovery failed after every attempt.
    ErrorUdpUnableToConnect,
    /// The server offered no supported encryption mode.
    ErrorUnsupportedEncryptionModes,
    /// The control websocket could not be opened.
    ErrorWebsocketUnableToConnect,
    /// An established connection was lost and not recovered.
    ErrorLostConnection,
    /// The session is no longer valid: a new one is needed.
    ErrorCannotResume,
    /// The voice server rejected the session token.
    DisconnectedAuthenticationFailure,
    /// The voice channel was deleted.
    DisconnectedChannelDeleted,
    /// This user was removed from the guild.
    DisconnectedRemovedFromGuild,
}

impl ConnectionStatus {
    /// Returns whether this status ends the session.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            Self::AwaitingWebsocketConnect
                | Self::AwaitingAuthenticating
                | Self::AttemptingUdpDiscovery
                | Self::AwaitingReady
                | Self::Connected
        )
    }

    /// Returns whether this status represents a failure.
    #[must_use]
    pub fn is_error(self) -> bool {
        self.is_terminal() && self != Self::NotConnected
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotConnected => "NOT_CONNECTED",
            Self::AwaitingWebsocketConnect => "AWAITING_WEBSOCKET_CONNECT",
            Self::AwaitingAuthenticating => "AWAITING_AUTHENTICATING",
            Self::AttemptingUdpDiscovery => "ATTEMPTING_UDP_DISCOVERY",
            Self::AwaitingReady => "AWAITING_READY",
            Self::Connected => "CONNECTED",
            Self::ErrorConnectionTimeout => "ERROR_CONNECTION_TIMEOUT",
            Self::ErrorUdpUnableToConnect => "ERROR_UDP_UNABLE_TO_CONNECT",
            Self::ErrorUnsupportedEncryptionModes => "ERROR_UNSUPPORTED_ENCRYPTION_MODES",
            Self::ErrorWebsocketUnableToConnect => "ERROR_WEBSOCKET_UNABLE_TO_CONNECT",
            Self::ErrorLostConnection => "ERROR_LOST_CONNECTION",
            Self::ErrorCannotResume => "ERROR_CANNOT_RESUME",
            Self::DisconnectedAuthenticationFailure => "DISCONNECTED_AUTHENTICATION_FAILURE",
            Self::DisconnectedChannelDeleted => "DISCONNECTED_CHANNEL_DELETED",
            Self::DisconnectedRemovedFromGuild => "DISCONNECTED_REMOVED_FROM_GUILD",
        };

        f.write_str(name)
    }
}

/// Shared view of a driver's [`ConnectionStatus`].
///
/// Only the driver's core task writes to this, so transitions are serialized.
/// Every change is forwarded to the [`GatewayBridge`].
#[derive(Clone)]
pub(crate) struct StatusTracker {
    current: Arc<Mutex<ConnectionStatus>>,
    bridge: Arc<dyn GatewayBridge>,
}

impl StatusTracker {
    pub(crate) fn new(bridge: Arc<dyn GatewayBridge>) -> Self {
        Self {
            current: Arc::new(Mutex::new(ConnectionStatus::NotConnected)),
            bridge,
        }
    }

    pub(crate) fn get(&self) -> ConnectionStatus {
        *self.current.lock()
    }

    pub(crate) fn bridge(&self) -> &Arc<dyn GatewayBridge> {
        &self.bridge
    }

    pub(crate) fn set(&self, guild_id: GuildId, status: ConnectionStatus) {
        let old = std::mem::replace(&mut *self.current.lock(), status);

        if old != status {
            debug!("Voice status {} -> {}.", old, status);
            self.bridge.on_status_change(guild_id, status);
        }
    }
}

impl fmt::Debug for StatusTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusTracker")
            .field("current", &self.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::test_impls::RecordingBridge;

    #[test]
    fn only_changes_are_reported() {
        let bridge = Arc::new(RecordingBridge::default());
        let tracker = StatusTracker::new(bridge.clone());

        tracker.set(GuildId(1), ConnectionStatus::AwaitingWebsocketConnect);
        tracker.set(GuildId(1), ConnectionStatus::AwaitingWebsocketConnect);
        tracker.set(GuildId(1), ConnectionStatus::Connected);

        assert_eq!(
            bridge.statuses(),
            vec![
                ConnectionStatus::AwaitingWebsocketConnect,
                ConnectionStatus::Connected
            ]
        );
        assert_eq!(tracker.get(), ConnectionStatus::Connected);
    }

    #[test]
    fn terminal_statuses() {
        assert!(ConnectionStatus::NotConnected.is_terminal());
        assert!(!ConnectionStatus::NotConnected.is_error());
        assert!(ConnectionStatus::ErrorCannotResume.is_error());
        assert!(!ConnectionStatus::AwaitingReady.is_terminal());
    }
}
