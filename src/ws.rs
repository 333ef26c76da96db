//! The voice gateway's control channel.
//!
//! Drivers talk to the control channel through [`ControlChannel`], and open new
//! channels with a [`Connector`]. The default connector uses a TLS websocket.

use crate::model::Event;
use async_trait::async_trait;
use async_tungstenite::{
    tokio::ConnectStream,
    tungstenite::{
        error::Error as TungsteniteError,
        protocol::{frame::coding::CloseCode, CloseFrame, WebSocketConfig},
        Message,
    },
    WebSocketStream,
};
use futures::{SinkExt, StreamExt, TryStreamExt};
use serde_json::Error as JsonError;
use std::{error::Error as StdError, fmt};
use tokio::time::{timeout, Duration};
use tracing::{debug, instrument};
use url::Url;

/// Websocket close code for a normal, client-initiated closure.
pub const NORMAL_CLOSURE: u16 = 1000;

/// A bidirectional JSON message stream to a voice gateway.
#[async_trait]
pub trait ControlChannel: Send {
    /// Sends one message.
    async fn send_json(&mut self, value: &Event) -> Result<()>;

    /// Waits a short time for one message.
    ///
    /// Returns `Ok(None)` if nothing usable arrived in time.
    async fn recv_json(&mut self) -> Result<Option<Event>>;

    /// Waits indefinitely for one message.
    ///
    /// Returns `Ok(None)` on frames which do not hold a known message.
    async fn recv_json_no_timeout(&mut self) -> Result<Option<Event>>;

    /// Closes the channel with the given close code.
    async fn close(&mut self, code: u16) -> Result<()>;
}

/// Opens control channels to voice gateway URLs.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new control channel to `url`.
    async fn connect(&self, url: Url) -> Result<Box<dyn ControlChannel>>;
}

/// Connector opening TLS websockets via `async-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: Url) -> Result<Box<dyn ControlChannel>> {
        Ok(Box::new(WsStream::connect(url).await?))
    }
}

/// A websocket connection to a voice gateway.
pub struct WsStream(WebSocketStream<ConnectStream>);

impl WsStream {
    #[instrument]
    pub(crate) async fn connect(url: Url) -> Result<Self> {
        let (stream, _) = async_tungstenite::tokio::connect_async_with_config::<Url>(
            url,
            Some(WebSocketConfig {
                max_message_size: None,
                max_frame_size: None,
                max_send_queue: None,
                ..Default::default()
            }),
        )
        .await?;

        Ok(Self(stream))
    }
}

#[async_trait]
impl ControlChannel for WsStream {
    async fn send_json(&mut self, value: &Event) -> Result<()> {
        let text = serde_json::to_string(value)?;
        Ok(self.0.send(Message::Text(text)).await?)
    }

    async fn recv_json(&mut self) -> Result<Option<Event>> {
        const TIMEOUT: Duration = Duration::from_millis(500);

        let ws_message = match timeout(TIMEOUT, self.0.next()).await {
            Ok(Some(Ok(v))) => Some(v),
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(None) => return Err(Error::WsClosed(None)),
            Err(_) => None,
        };

        convert_ws_message(ws_message)
    }

    async fn recv_json_no_timeout(&mut self) -> Result<Option<Event>> {
        match self.0.try_next().await? {
            Some(msg) => convert_ws_message(Some(msg)),
            None => Err(Error::WsClosed(None)),
        }
    }

    async fn close(&mut self, code: u16) -> Result<()> {
        Ok(self
            .0
            .close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: "".into(),
            }))
            .await?)
    }
}

/// Convenience type for control channel error handling.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors on the control channel.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A message could not be (de)serialized.
    Json(JsonError),

    /// The voice gateway does not support or offer zlib compression.
    /// As a result, only text messages are expected.
    UnexpectedBinaryMessage(Vec<u8>),

    /// Transport-level websocket failure.
    Ws(TungsteniteError),

    /// The remote end closed the connection, with an optional close code.
    WsClosed(Option<u16>),
}

impl Error {
    /// Returns the close code sent by the remote end, if any.
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::WsClosed(code) => *code,
            _ => None,
        }
    }
}

impl From<JsonError> for Error {
    fn from(e: JsonError) -> Error {
        Error::Json(e)
    }
}

impl From<TungsteniteError> for Error {
    fn from(e: TungsteniteError) -> Error {
        Error::Ws(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(e) => write!(f, "bad control message: {e}"),
            Self::UnexpectedBinaryMessage(b) => write!(f, "unexpected binary frame ({}B)", b.len()),
            Self::Ws(e) => write!(f, "websocket failure: {e}"),
            Self::WsClosed(Some(code)) => write!(f, "websocket closed with code {code}"),
            Self::WsClosed(None) => write!(f, "websocket closed"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            Self::Ws(e) => Some(e),
            _ => None,
        }
    }
}

#[inline]
pub(crate) fn convert_ws_message(message: Option<Message>) -> Result<Option<Event>> {
    Ok(match message {
        Some(Message::Text(payload)) => serde_json::from_str(&payload)
            .map_err(|e| {
                debug!("Unexpected JSON: {e}. Payload: {payload}");
                e
            })
            .ok(),
        Some(Message::Binary(bytes)) => {
            return Err(Error::UnexpectedBinaryMessage(bytes));
        },
        Some(Message::Close(frame)) => {
            return Err(Error::WsClosed(frame.map(|f| u16::from(f.code))));
        },
        // Ping/Pong message behaviour is internally handled by tungstenite.
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_frames_carry_their_code() {
        let msg = Message::Close(Some(CloseFrame {
            code: CloseCode::from(4004),
            reason: "".into(),
        }));

        match convert_ws_message(Some(msg)) {
            Err(e) => assert_eq!(e.close_code(), Some(4004)),
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[test]
    fn unknown_json_is_skipped() {
        let msg = Message::Text(r#"{"op":18,"d":{}}"#.into());
        assert!(matches!(convert_ws_message(Some(msg)), Ok(None)));
    }

    #[test]
    fn binary_frames_are_errors() {
        let msg = Message::Binary(vec![1, 2, 3]);
        assert!(matches!(
            convert_ws_message(Some(msg)),
            Err(Error::UnexpectedBinaryMessage(_))
        ));
    }
}
