use crate::id::{ChannelId, GuildId, UserId};
use std::fmt;

/// Parameters and information needed to start communicating with a voice server.
///
/// These are supplied by the main bot gateway once it has been told which
/// voice server and session to use.
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct ConnectionInfo {
    /// ID of the voice channel being joined, if it is known.
    ///
    /// This is not needed to establish a connection, but is used to tell
    /// a deleted channel apart from other forced disconnects.
    pub channel_id: Option<ChannelId>,
    /// Host (and optional port) of the voice websocket gateway server assigned to this call.
    pub endpoint: String,
    /// ID of the target voice channel's parent guild.
    pub guild_id: GuildId,
    /// Unique string describing this session for validation/authentication purposes.
    pub session_id: String,
    /// Ephemeral secret used to validate the above session.
    pub token: String,
    /// ID of the user this driver connects as.
    pub user_id: UserId,
    /// Whether transient connection losses should be resumed automatically.
    pub auto_reconnect: bool,
}

impl ConnectionInfo {
    /// Creates connection info with automatic reconnection enabled.
    pub fn new(
        endpoint: impl Into<String>,
        guild_id: GuildId,
        user_id: UserId,
        session_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: None,
            endpoint: endpoint.into(),
            guild_id,
            session_id: session_id.into(),
            token: token.into(),
            user_id,
            auto_reconnect: true,
        }
    }

    /// Sets the voice channel this connection targets.
    #[must_use]
    pub fn channel_id(mut self, channel_id: ChannelId) -> Self {
        self.channel_id = Some(channel_id);
        self
    }

    /// Sets whether transient connection losses are resumed automatically.
    #[must_use]
    pub fn auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("channel_id", &self.channel_id)
            .field("endpoint", &self.endpoint)
            .field("guild_id", &self.guild_id)
            .field("session_id", &self.session_id)
            .field("token", &"<secret>")
            .field("user_id", &self.user_id)
            .field("auto_reconnect", &self.auto_reconnect)
            .finish()
    }
}
