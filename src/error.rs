//! Driver and control channel error handling.

pub use crate::{
    codec::CodecError,
    driver::{
        connection::error::{Error as ConnectionError, Result as ConnectionResult},
        packet::PacketError,
    },
    ws::Error as WsError,
};
