//! The boundary between a voice driver and the main bot gateway.

use crate::{
    driver::ConnectionStatus,
    id::{ChannelId, GuildId},
};
use std::time::Duration;

/// Hooks into the bot gateway that owns a voice session.
///
/// The gateway supplies [`ConnectionInfo`] to start a session, and is told
/// about every status change in return. When a session ends in a way that
/// the driver cannot recover from alone, the gateway is asked to either fetch
/// a new session and reconnect, or to clean up its own voice state.
///
/// All methods are called from driver tasks, and must not block.
///
/// [`ConnectionInfo`]: crate::ConnectionInfo
pub trait GatewayBridge: Send + Sync {
    /// Called after every change of [`ConnectionStatus`].
    fn on_status_change(&self, _guild_id: GuildId, _status: ConnectionStatus) {}

    /// Called with the round-trip time of each acknowledged heartbeat.
    fn on_ping(&self, _guild_id: GuildId, _latency: Duration) {}

    /// The session cannot be resumed: a new session should be requested and
    /// passed to [`Driver::connect`].
    ///
    /// [`Driver::connect`]: crate::Driver::connect
    fn request_reconnect(&self, _guild_id: GuildId) {}

    /// The session has ended for good, and the gateway should leave the channel.
    fn request_disconnect(&self, _guild_id: GuildId) {}

    /// Returns whether a voice channel still exists.
    fn channel_exists(&self, _guild_id: GuildId, _channel_id: ChannelId) -> bool {
        true
    }

    /// Returns whether this user is still a member of the guild.
    fn is_guild_member(&self, _guild_id: GuildId) -> bool {
        true
    }
}

/// A bridge which ignores every notification.
impl GatewayBridge for () {}
