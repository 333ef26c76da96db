//! Connection errors and convenience types.

use crate::{
    driver::{tasks::message::*, ConnectionStatus},
    ws::Error as WsError,
};
use flume::SendError;
use serde_json::Error as JsonError;
use std::{error::Error as StdError, fmt, io::Error as IoError};
use tokio::time::error::Elapsed;

/// Errors encountered while connecting to a voice server.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The driver hung up an internal signaller, either due to another connection attempt
    /// or a crash.
    AttemptDiscarded,
    /// The session description held a key of the wrong length.
    CryptoInvalidLength,
    /// Server did not return the expected crypto mode during negotiation.
    CryptoModeInvalid,
    /// The server offered no encryption mode supported by this driver.
    CryptoModeUnavailable,
    /// No reply was received to any IP discovery attempt.
    DiscoveryFailed,
    /// An indicator that an endpoint URL was invalid.
    EndpointUrl,
    /// The voice server failed to correctly respond to IP discovery.
    IllegalDiscoveryResponse,
    /// Could not parse the voice server's view of our IP.
    IllegalIp,
    /// Miscellaneous I/O error.
    Io(IoError),
    /// JSON (de)serialization error.
    Json(JsonError),
    /// Failed to message other background tasks after connection establishment.
    InterconnectFailure,
    /// Error communicating with the voice gateway over an open websocket.
    Ws(WsError),
    /// The control websocket could not be opened.
    WsConnect(WsError),
    /// Connection attempt timed out.
    TimedOut,
}

impl Error {
    /// Returns the status reported when a connection attempt fails with this error.
    ///
    /// Websocket closures need the close code classified against the bot gateway,
    /// so they map to [`ConnectionStatus::ErrorLostConnection`] here.
    pub(crate) fn status(&self) -> ConnectionStatus {
        match self {
            Error::TimedOut => ConnectionStatus::ErrorConnectionTimeout,
            Error::DiscoveryFailed | Error::IllegalDiscoveryResponse | Error::IllegalIp =>
                ConnectionStatus::ErrorUdpUnableToConnect,
            Error::CryptoModeInvalid | Error::CryptoModeUnavailable =>
                ConnectionStatus::ErrorUnsupportedEncryptionModes,
            Error::WsConnect(_) | Error::EndpointUrl =>
                ConnectionStatus::ErrorWebsocketUnableToConnect,
            Error::AttemptDiscarded => ConnectionStatus::NotConnected,
            Error::CryptoInvalidLength
            | Error::Io(_)
            | Error::Json(_)
            | Error::InterconnectFailure
            | Error::Ws(_) => ConnectionStatus::ErrorLostConnection,
        }
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Error {
        Error::Io(e)
    }
}

impl From<JsonError> for Error {
    fn from(e: JsonError) -> Error {
        Error::Json(e)
    }
}

impl From<SendError<WsMessage>> for Error {
    fn from(_e: SendError<WsMessage>) -> Error {
        Error::InterconnectFailure
    }
}

impl From<SendError<UdpTxMessage>> for Error {
    fn from(_e: SendError<UdpTxMessage>) -> Error {
        Error::InterconnectFailure
    }
}

impl From<WsError> for Error {
    fn from(e: WsError) -> Error {
        Error::Ws(e)
    }
}

impl From<Elapsed> for Error {
    fn from(_e: Elapsed) -> Error {
        Error::TimedOut
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to connect to voice server: ")?;
        use Error::*;
        match self {
            AttemptDiscarded => write!(f, "connection attempt was aborted/discarded"),
            CryptoInvalidLength => write!(f, "session key had an invalid length"),
            CryptoModeInvalid => write!(f, "server changed negotiated encryption mode"),
            CryptoModeUnavailable => write!(f, "server offered no supported encryption mode"),
            DiscoveryFailed => write!(f, "no reply to IP discovery/NAT punching"),
            EndpointUrl => write!(f, "endpoint URL received from gateway was invalid"),
            IllegalDiscoveryResponse => write!(f, "IP discovery/NAT punching response was invalid"),
            IllegalIp => write!(f, "IP discovery/NAT punching response had bad IP value"),
            Io(e) => e.fmt(f),
            Json(e) => e.fmt(f),
            InterconnectFailure => write!(f, "failed to contact other task"),
            Ws(e) => write!(f, "websocket issue ({e})"),
            WsConnect(e) => write!(f, "could not open websocket ({e})"),
            TimedOut => write!(f, "connection attempt timed out"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Json(e) => Some(e),
            Error::Ws(e) | Error::WsConnect(e) => Some(e),
            _ => None,
        }
    }
}

/// Convenience type for voice connection error handling.
pub type Result<T> = std::result::Result<T, Error>;
