use std::fmt;

/// Close codes the voice gateway may attach when terminating a control connection.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum CloseCode {
    /// An invalid op code was sent.
    UnknownOpcode = 4001,
    /// An invalid payload was sent.
    InvalidPayload = 4002,
    /// A payload was sent prior to identifying.
    NotAuthenticated = 4003,
    /// The token sent in IDENTIFY was wrong.
    AuthenticationFailed = 4004,
    /// More than one IDENTIFY was sent.
    AlreadyAuthenticated = 4005,
    /// The session is no longer valid.
    SessionInvalid = 4006,
    /// The session has timed out.
    SessionTimeout = 4009,
    /// The requested voice server could not be found.
    ServerNotFound = 4011,
    /// The server did not recognise the protocol in SELECT_PROTOCOL.
    UnknownProtocol = 4012,
    /// Kicked from the channel, the channel was deleted, or the client was removed from the guild.
    Disconnected = 4014,
    /// The voice server crashed.
    VoiceServerCrash = 4015,
    /// The server did not recognise the requested encryption mode.
    UnknownEncryptionMode = 4016,
}

impl CloseCode {
    /// Maps a raw websocket close code onto a known voice close code.
    #[must_use]
    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            4001 => Self::UnknownOpcode,
            4002 => Self::InvalidPayload,
            4003 => Self::NotAuthenticated,
            4004 => Self::AuthenticationFailed,
            4005 => Self::AlreadyAuthenticated,
            4006 => Self::SessionInvalid,
            4009 => Self::SessionTimeout,
            4011 => Self::ServerNotFound,
            4012 => Self::UnknownProtocol,
            4014 => Self::Disconnected,
            4015 => Self::VoiceServerCrash,
            4016 => Self::UnknownEncryptionMode,
            _ => return None,
        })
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = match self {
            Self::UnknownOpcode => "unknown opcode",
            Self::InvalidPayload => "invalid payload",
            Self::NotAuthenticated => "not authenticated",
            Self::AuthenticationFailed => "authentication failed",
            Self::AlreadyAuthenticated => "already authenticated",
            Self::SessionInvalid => "session no longer valid",
            Self::SessionTimeout => "session timed out",
            Self::ServerNotFound => "server not found",
            Self::UnknownProtocol => "unknown protocol",
            Self::Disconnected => "disconnected",
            Self::VoiceServerCrash => "voice server crashed",
            Self::UnknownEncryptionMode => "unknown encryption mode",
        };

        write!(f, "{} ({})", desc, *self as u16)
    }
}
