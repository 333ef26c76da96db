#![allow(missing_docs)]

use crate::{
    driver::{connection::error::Error, tasks::ws::CloseKind, ConnectionStatus},
    ConnectionInfo,
};
use flume::Sender;

#[derive(Debug)]
pub enum CoreMessage {
    ConnectWithResult(ConnectionInfo, Sender<Result<(), Error>>),
    /// Tear down the session, then report the given status.
    Disconnect(ConnectionStatus),
    /// Resume the session, reporting the given status first.
    Reconnect(ConnectionStatus),
    Mute(bool),
    SinkChanged,
    /// The control channel of connection `usize` has closed.
    WsClosed(usize, CloseKind),
    Poison,
}
