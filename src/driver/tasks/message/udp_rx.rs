#![allow(missing_docs)]

use crate::id::UserId;

#[derive(Debug)]
pub enum UdpRxMessage {
    /// The SSRC no longer belongs to this user: drop its decoder, unless the
    /// SSRC has since been handed to someone else.
    RemoveSsrc(u32, UserId),
    /// The user left the call: drop any audio queued for them.
    RemoveUser(UserId),
    Poison,
}
