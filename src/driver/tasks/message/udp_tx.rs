#![allow(missing_docs)]

#[derive(Debug)]
pub enum UdpTxMessage {
    SetMute(bool),
    Poison,
}
