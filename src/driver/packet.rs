//! Framing and parsing of RTP voice packets.
//!
//! Outgoing packets are laid out as a 12-byte RTP header, the sealed payload
//! (tag followed by ciphertext), and any mode-specific nonce bytes. Incoming
//! packets are opened in place of that layout, and any one-byte header
//! extension block at the start of the decrypted body is skipped.

use super::crypto::{CryptoMode, CryptoState, SecretKey};
use crate::constants::*;
use byteorder::{ByteOrder, NetworkEndian};
use discortp::{
    discord::MutableKeepalivePacket,
    rtp::{MutableRtpPacket, RtpExtensionPacket, RtpPacket},
    PacketSize,
};
use std::{error::Error as StdError, fmt};

/// One parsed voice packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AudioPacket {
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    /// Codec payload, with any header extension and nonce bytes removed.
    pub payload: Vec<u8>,
}

/// Reasons a single packet could not be handled.
#[derive(Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum PacketError {
    /// The packet is shorter than its header, extension, or nonce imply.
    TooShort,
    /// The packet does not declare RTP version 2.
    IllegalVersion(u8),
    /// An extension block was flagged but does not fit in the packet.
    IllegalExtension,
    /// Sealing or opening the payload failed.
    Crypto,
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal voice packet: ")?;
        match self {
            Self::TooShort => write!(f, "too short"),
            Self::IllegalVersion(v) => write!(f, "unexpected RTP version {v}"),
            Self::IllegalExtension => write!(f, "truncated header extension"),
            Self::Crypto => write!(f, "failed to seal/open payload"),
        }
    }
}

impl StdError for PacketError {}

impl From<crypto_secretbox::Error> for PacketError {
    fn from(_: crypto_secretbox::Error) -> Self {
        Self::Crypto
    }
}

/// Writes the fixed RTP header used by every outgoing voice packet.
#[must_use]
pub fn header(sequence: u16, timestamp: u32, ssrc: u32) -> [u8; RTP_HEADER_LEN] {
    let mut out = [0u8; RTP_HEADER_LEN];
    let mut rtp = MutableRtpPacket::new(&mut out[..]).expect(
        "FATAL: Too few bytes in header for RTP packet.\
            (Blame: RTP_HEADER_LEN?)",
    );

    rtp.set_version(RTP_VERSION);
    rtp.set_payload_type(RTP_PROFILE_TYPE);
    rtp.set_sequence(sequence.into());
    rtp.set_timestamp(timestamp.into());
    rtp.set_ssrc(ssrc);

    out
}

/// Frames a payload behind an RTP header, followed by `nonce_suffix`.
#[must_use]
pub fn frame(
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
    payload: &[u8],
    nonce_suffix: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(RTP_HEADER_LEN + payload.len() + nonce_suffix.len());

    out.extend_from_slice(&header(sequence, timestamp, ssrc));
    out.extend_from_slice(payload);
    out.extend_from_slice(nonce_suffix);

    out
}

/// Length of the fixed header plus any CSRC entries.
fn header_len(bytes: &[u8]) -> Result<usize, PacketError> {
    let rtp = RtpPacket::new(bytes).ok_or(PacketError::TooShort)?;

    let version = rtp.get_version();
    if version != RTP_VERSION {
        return Err(PacketError::IllegalVersion(version));
    }

    let len = RTP_HEADER_LEN + 4 * rtp.get_csrc_count() as usize;
    if len > bytes.len() {
        Err(PacketError::TooShort)
    } else {
        Ok(len)
    }
}

/// Parses a plaintext packet, removing `suffix_len` trailing nonce bytes and
/// skipping any header extension.
pub fn unframe(bytes: &[u8], suffix_len: usize) -> Result<AudioPacket, PacketError> {
    let start = header_len(bytes)?;
    let end = bytes
        .len()
        .checked_sub(suffix_len)
        .filter(|end| *end >= start)
        .ok_or(PacketError::TooShort)?;

    let extension = bytes[0] & 0x10 != 0;
    let body = &bytes[start..end];

    let skip = if extension && body.starts_with(&RTP_EXTENSION_MARKER) {
        RtpExtensionPacket::new(body)
            .map(|ext| ext.packet_size())
            .filter(|len| *len <= body.len())
            .ok_or(PacketError::IllegalExtension)?
    } else {
        0
    };

    Ok(AudioPacket {
        sequence: NetworkEndian::read_u16(&bytes[2..4]),
        timestamp: NetworkEndian::read_u32(&bytes[4..8]),
        ssrc: NetworkEndian::read_u32(&bytes[8..12]),
        payload: body[skip..].to_vec(),
    })
}

/// Encrypts and frames one outgoing payload, advancing the nonce state.
pub fn seal(
    state: &mut CryptoState,
    key: &SecretKey,
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
    payload: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let head = header(sequence, timestamp, ssrc);
    let nonce = state.next_nonce(&head);
    let sealed = key.seal(&nonce.nonce, payload)?;

    let out = frame(sequence, timestamp, ssrc, &sealed, nonce.suffix());
    if out.len() > VOICE_PACKET_MAX {
        tracing::warn!(
            "Voice packet of {} bytes exceeds the safe maximum of {}.",
            out.len(),
            VOICE_PACKET_MAX
        );
    }

    Ok(out)
}

/// Decrypts and parses one incoming datagram.
pub fn open(mode: CryptoMode, key: &SecretKey, raw: &[u8]) -> Result<AudioPacket, PacketError> {
    let start = header_len(raw)?;
    let suffix_len = mode.payload_suffix_len();
    let end = raw
        .len()
        .checked_sub(suffix_len)
        .filter(|end| *end >= start + mode.payload_prefix_len())
        .ok_or(PacketError::TooShort)?;

    let (header, rest) = raw.split_at(start);
    let (sealed, suffix) = rest.split_at(end - start);

    let nonce = mode.nonce_from_wire(header, suffix)?;
    let plain = key.open(&nonce, sealed)?;

    let mut rebuilt = Vec::with_capacity(header.len() + plain.len());
    rebuilt.extend_from_slice(header);
    rebuilt.extend_from_slice(&plain);

    unframe(&rebuilt, 0)
}

/// Builds the keepalive datagram tagged with `ssrc`.
#[must_use]
pub fn keepalive(ssrc: u32) -> [u8; MutableKeepalivePacket::minimum_packet_size()] {
    let mut out = [0u8; MutableKeepalivePacket::minimum_packet_size()];
    let mut ka = MutableKeepalivePacket::new(&mut out[..])
        .expect("FATAL: Insufficient bytes given to keepalive packet.");
    ka.set_ssrc(ssrc);

    out
}
