//! Control-channel message types for the voice gateway.
//!
//! Every message travels as a JSON object of the form `{"op": <u8>, "d": <payload>}`.
//! [`Event`] wraps each payload, and handles the op-code envelope in both directions.

mod close_code;
#[allow(missing_docs)]
pub(crate) mod payload;

pub use self::{close_code::CloseCode, payload::*};

use serde::{
    de::Error as DeError,
    ser::SerializeStruct,
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
};
use serde_json::Value;

/// Op codes used by the voice gateway.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum OpCode {
    /// Client handshake for a fresh session.
    Identify = 0,
    /// Client reports its external address and chosen encryption mode.
    SelectProtocol = 1,
    /// Server assigns an SSRC and a UDP endpoint.
    Ready = 2,
    /// Client keepalive.
    Heartbeat = 3,
    /// Server shares the session's secret key.
    SessionDescription = 4,
    /// Speaking state of any user in the call.
    Speaking = 5,
    /// Server acknowledgement of a heartbeat.
    HeartbeatAck = 6,
    /// Client handshake to continue an existing session.
    Resume = 7,
    /// Server announces the heartbeat interval.
    Hello = 8,
    /// Server confirms a resumed session.
    Resumed = 9,
    /// A user has left the call.
    ClientDisconnect = 13,
}

impl OpCode {
    /// Maps a raw op code onto a known variant.
    #[must_use]
    pub fn from_u8(op: u8) -> Option<Self> {
        Some(match op {
            0 => Self::Identify,
            1 => Self::SelectProtocol,
            2 => Self::Ready,
            3 => Self::Heartbeat,
            4 => Self::SessionDescription,
            5 => Self::Speaking,
            6 => Self::HeartbeatAck,
            7 => Self::Resume,
            8 => Self::Hello,
            9 => Self::Resumed,
            13 => Self::ClientDisconnect,
            _ => return None,
        })
    }
}

/// A single control-channel message.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Event {
    /// See [`OpCode::Identify`].
    Identify(Identify),
    /// See [`OpCode::SelectProtocol`].
    SelectProtocol(SelectProtocol),
    /// See [`OpCode::Ready`].
    Ready(Ready),
    /// See [`OpCode::Heartbeat`].
    Heartbeat(Heartbeat),
    /// See [`OpCode::SessionDescription`].
    SessionDescription(SessionDescription),
    /// See [`OpCode::Speaking`].
    Speaking(Speaking),
    /// See [`OpCode::HeartbeatAck`].
    HeartbeatAck(HeartbeatAck),
    /// See [`OpCode::Resume`].
    Resume(Resume),
    /// See [`OpCode::Hello`].
    Hello(Hello),
    /// See [`OpCode::Resumed`].
    Resumed,
    /// See [`OpCode::ClientDisconnect`].
    ClientDisconnect(ClientDisconnect),
}

impl Event {
    /// Returns the op code this message is sent under.
    #[must_use]
    pub fn kind(&self) -> OpCode {
        match self {
            Self::Identify(_) => OpCode::Identify,
            Self::SelectProtocol(_) => OpCode::SelectProtocol,
            Self::Ready(_) => OpCode::Ready,
            Self::Heartbeat(_) => OpCode::Heartbeat,
            Self::SessionDescription(_) => OpCode::SessionDescription,
            Self::Speaking(_) => OpCode::Speaking,
            Self::HeartbeatAck(_) => OpCode::HeartbeatAck,
            Self::Resume(_) => OpCode::Resume,
            Self::Hello(_) => OpCode::Hello,
            Self::Resumed => OpCode::Resumed,
            Self::ClientDisconnect(_) => OpCode::ClientDisconnect,
        }
    }
}

macro_rules! impl_from_payload {
    ($($variant:ident),+ $(,)?) => {
        $(
            impl From<$variant> for Event {
                fn from(val: $variant) -> Self {
                    Event::$variant(val)
                }
            }
        )+
    };
}

impl_from_payload!(
    Identify,
    SelectProtocol,
    Ready,
    Heartbeat,
    SessionDescription,
    Speaking,
    HeartbeatAck,
    Resume,
    Hello,
    ClientDisconnect,
);

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Event", 2)?;
        s.serialize_field("op", &(self.kind() as u8))?;

        match self {
            Self::Identify(d) => s.serialize_field("d", d)?,
            Self::SelectProtocol(d) => s.serialize_field("d", d)?,
            Self::Ready(d) => s.serialize_field("d", d)?,
            Self::Heartbeat(d) => s.serialize_field("d", d)?,
            Self::SessionDescription(d) => s.serialize_field("d", d)?,
            Self::Speaking(d) => s.serialize_field("d", d)?,
            Self::HeartbeatAck(d) => s.serialize_field("d", d)?,
            Self::Resume(d) => s.serialize_field("d", d)?,
            Self::Hello(d) => s.serialize_field("d", d)?,
            Self::Resumed => s.serialize_field("d", &Value::Null)?,
            Self::ClientDisconnect(d) => s.serialize_field("d", d)?,
        }

        s.end()
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Envelope {
            op: u8,
            #[serde(default)]
            d: Value,
        }

        let Envelope { op, d } = Envelope::deserialize(deserializer)?;
        let kind = OpCode::from_u8(op)
            .ok_or_else(|| DeError::custom(format_args!("unknown voice op code {op}")))?;

        let out = match kind {
            OpCode::Identify => serde_json::from_value(d).map(Self::Identify),
            OpCode::SelectProtocol => serde_json::from_value(d).map(Self::SelectProtocol),
            OpCode::Ready => serde_json::from_value(d).map(Self::Ready),
            OpCode::Heartbeat => serde_json::from_value(d).map(Self::Heartbeat),
            OpCode::SessionDescription => serde_json::from_value(d).map(Self::SessionDescription),
            OpCode::Speaking => serde_json::from_value(d).map(Self::Speaking),
            OpCode::HeartbeatAck => serde_json::from_value(d).map(Self::HeartbeatAck),
            OpCode::Resume => serde_json::from_value(d).map(Self::Resume),
            OpCode::Hello => serde_json::from_value(d).map(Self::Hello),
            OpCode::Resumed => Ok(Self::Resumed),
            OpCode::ClientDisconnect => serde_json::from_value(d).map(Self::ClientDisconnect),
        };

        out.map_err(DeError::custom)
    }
}
