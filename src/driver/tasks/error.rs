use super::message::*;
use crate::{codec::CodecError, driver::packet::PacketError, ws::Error as WsError};
use flume::SendError;
use std::{
    error::Error as StdError,
    fmt,
    io::{Error as IoError, ErrorKind as IoErrorKind},
};

#[derive(Debug)]
pub enum Recipient {
    AuxNetwork,
    Core,
    UdpRx,
    UdpTx,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised within a running voice session's tasks.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    Codec(CodecError),
    InterconnectFailure(Recipient),
    Io(IoError),
    Packet(PacketError),
    Ws(WsError),
}

impl Error {
    /// Returns whether a socket read simply timed out, rather than failing.
    pub(crate) fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Io(e) if matches!(e.kind(), IoErrorKind::WouldBlock | IoErrorKind::TimedOut)
        )
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Error::Codec(e)
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Error {
        Error::Io(e)
    }
}

impl From<PacketError> for Error {
    fn from(e: PacketError) -> Error {
        Error::Packet(e)
    }
}

impl From<WsError> for Error {
    fn from(e: WsError) -> Error {
        Error::Ws(e)
    }
}

impl From<SendError<WsMessage>> for Error {
    fn from(_e: SendError<WsMessage>) -> Error {
        Error::InterconnectFailure(Recipient::AuxNetwork)
    }
}

impl From<SendError<CoreMessage>> for Error {
    fn from(_e: SendError<CoreMessage>) -> Error {
        Error::InterconnectFailure(Recipient::Core)
    }
}

impl From<SendError<UdpRxMessage>> for Error {
    fn from(_e: SendError<UdpRxMessage>) -> Error {
        Error::InterconnectFailure(Recipient::UdpRx)
    }
}

impl From<SendError<UdpTxMessage>> for Error {
    fn from(_e: SendError<UdpTxMessage>) -> Error {
        Error::InterconnectFailure(Recipient::UdpTx)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(e) => e.fmt(f),
            Self::InterconnectFailure(r) => write!(f, "failed to contact other task ({r:?})"),
            Self::Io(e) => e.fmt(f),
            Self::Packet(e) => e.fmt(f),
            Self::Ws(e) => e.fmt(f),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Codec(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Packet(e) => Some(e),
            Self::Ws(e) => Some(e),
            Self::InterconnectFailure(_) => None,
        }
    }
}
