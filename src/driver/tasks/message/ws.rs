#![allow(missing_docs)]

use crate::ws::ControlChannel;

pub enum WsMessage {
    /// Replaces the control channel after a successful resume.
    Ws(Box<dyn ControlChannel>),
    /// New heartbeat interval, in milliseconds.
    SetKeepalive(f64),
    Speaking(bool),
    StopHeartbeat,
    /// Closes the control channel with a normal close code and exits.
    Close,
}
