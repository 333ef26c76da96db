use crate::id::{GuildId, UserId};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Opens a fresh voice session.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Identify {
    pub server_id: GuildId,
    pub user_id: UserId,
    pub session_id: String,
    pub token: String,
}

/// Announces the client's external UDP address and chosen encryption mode.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SelectProtocol {
    pub protocol: String,
    pub data: ProtocolData,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProtocolData {
    pub address: IpAddr,
    pub port: u16,
    pub mode: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Ready {
    pub ssrc: u32,
    pub ip: IpAddr,
    pub port: u16,
    pub modes: Vec<String>,
    /// Sent by older gateway versions, and superseded by [`Hello`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<f64>,
}

/// Client keepalive, carrying a nonce the server must echo.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Heartbeat {
    pub nonce: u64,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct HeartbeatAck {
    pub nonce: u64,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SessionDescription {
    pub mode: String,
    pub secret_key: Vec<u8>,
}

/// Speaking state for one SSRC.
///
/// When sent by the server, this also binds `ssrc` to `user_id`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Speaking {
    pub speaking: SpeakingState,
    pub ssrc: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u32>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Resume {
    pub server_id: GuildId,
    pub session_id: String,
    pub token: String,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Hello {
    /// Milliseconds between heartbeats.
    pub heartbeat_interval: f64,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ClientDisconnect {
    pub user_id: UserId,
}

/// Bitflags describing how a user is transmitting audio.
///
/// Bits unknown to this crate are kept as sent.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SpeakingState(u8);

bitflags! {
    impl SpeakingState: u8 {
        /// Normal voice transmission.
        const MICROPHONE = 1;
        /// Context audio from a shared screen or video.
        const SOUNDSHARE = 1 << 1;
        /// Priority speaker, lowering the volume of other speakers.
        const PRIORITY = 1 << 2;
    }
}

impl SpeakingState {
    /// Returns whether any form of audio is being sent.
    #[must_use]
    pub const fn is_speaking(self) -> bool {
        !self.is_empty()
    }
}

impl From<bool> for SpeakingState {
    fn from(speaking: bool) -> Self {
        if speaking {
            Self::MICROPHONE
        } else {
            Self::empty()
        }
    }
}
