//! Encryption schemes supported by secure RTP negotiation on the voice gateway.
use crate::constants::RTP_HEADER_LEN;
use byteorder::{ByteOrder, NetworkEndian};
use crypto_secretbox::{
    AeadInPlace,
    Error as CryptoError,
    KeyInit,
    Nonce,
    SecretBox,
    Tag,
    XSalsa20Poly1305 as Cipher,
};
use parking_lot::RwLock;
use rand::Rng;
use std::{fmt, num::Wrapping};
use zeroize::Zeroize;

pub const TAG_SIZE: usize = SecretBox::<()>::TAG_SIZE;
pub const NONCE_SIZE: usize = SecretBox::<()>::NONCE_SIZE;
pub const KEY_SIZE: usize = SecretBox::<()>::KEY_SIZE;

/// Number of nonce bytes carried on the wire in [`CryptoMode::Lite`].
pub const LITE_NONCE_SIZE: usize = 4;

/// Variants of the XSalsa20Poly1305 encryption scheme.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CryptoMode {
    /// The RTP header is used as the source of nonce bytes for the packet.
    ///
    /// Equivalent to a nonce of at most 48b (6B) at no extra packet overhead:
    /// the RTP sequence number and timestamp are the varying quantities.
    Normal,
    /// An additional random 24B suffix is used as the source of nonce bytes for the packet.
    /// This is regenerated randomly for each packet.
    ///
    /// Full nonce width of 24B (192b), at an extra 24B per packet (~1.2 kB/s).
    Suffix,
    /// An incrementing 4B counter is used as the source of nonce bytes for the packet.
    ///
    /// Nonce width of 4B (32b), at an extra 4B per packet (~0.2 kB/s).
    Lite,
}

impl CryptoMode {
    /// Every supported mode, in order of preference.
    pub const PREFERENCE: [CryptoMode; 3] = [CryptoMode::Lite, CryptoMode::Suffix, CryptoMode::Normal];

    /// Returns the name of a mode as it will appear during negotiation.
    #[must_use]
    pub fn to_request_str(self) -> &'static str {
        match self {
            Self::Normal => "xsalsa20_poly1305",
            Self::Suffix => "xsalsa20_poly1305_suffix",
            Self::Lite => "xsalsa20_poly1305_lite",
        }
    }

    /// Picks the most preferred locally supported mode among those offered by a server.
    ///
    /// Returns `None` if no offered mode is supported.
    #[must_use]
    pub fn negotiate<S: AsRef<str>>(offered: &[S]) -> Option<Self> {
        Self::PREFERENCE.into_iter().find(|mode| {
            offered
                .iter()
                .any(|name| name.as_ref() == mode.to_request_str())
        })
    }

    /// Returns the number of nonce bytes appended after the encrypted payload.
    #[must_use]
    pub fn payload_suffix_len(self) -> usize {
        match self {
            Self::Normal => 0,
            Self::Suffix => NONCE_SIZE,
            Self::Lite => LITE_NONCE_SIZE,
        }
    }

    /// Returns the number of bytes occupied by the encryption scheme
    /// which fall before the payload.
    #[must_use]
    pub fn payload_prefix_len(self) -> usize {
        TAG_SIZE
    }

    /// Calculates the number of additional bytes required compared
    /// to an unencrypted payload.
    #[must_use]
    pub fn payload_overhead(self) -> usize {
        self.payload_prefix_len() + self.payload_suffix_len()
    }

    /// Rebuilds the full nonce for a received packet from its RTP header and
    /// the nonce bytes found after its payload.
    pub(crate) fn nonce_from_wire(self, header: &[u8], suffix: &[u8]) -> Result<Nonce, CryptoError> {
        let mut nonce = Nonce::default();

        let src = match self {
            Self::Normal => header.get(..RTP_HEADER_LEN),
            Self::Suffix | Self::Lite =>
                if suffix.len() == self.payload_suffix_len() {
                    Some(suffix)
                } else {
                    None
                },
        }
        .ok_or(CryptoError)?;

        nonce[..src.len()].copy_from_slice(src);
        Ok(nonce)
    }
}

impl fmt::Display for CryptoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_request_str())
    }
}

/// Nonce material for one outgoing packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PacketNonce {
    /// Full nonce handed to the cipher.
    pub nonce: [u8; NONCE_SIZE],
    suffix_len: usize,
}

impl PacketNonce {
    /// Bytes which must be appended after the ciphertext on the wire.
    #[must_use]
    pub fn suffix(&self) -> &[u8] {
        &self.nonce[..self.suffix_len]
    }
}

/// Per-session nonce state for outgoing packets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CryptoState {
    /// See [`CryptoMode::Normal`].
    Normal,
    /// See [`CryptoMode::Suffix`].
    Suffix,
    /// See [`CryptoMode::Lite`]: holds the counter for the next packet.
    Lite(Wrapping<u32>),
}

impl From<CryptoMode> for CryptoState {
    fn from(val: CryptoMode) -> Self {
        match val {
            CryptoMode::Normal => CryptoState::Normal,
            CryptoMode::Suffix => CryptoState::Suffix,
            CryptoMode::Lite => CryptoState::Lite(Wrapping(0)),
        }
    }
}

impl From<CryptoState> for CryptoMode {
    fn from(val: CryptoState) -> Self {
        match val {
            CryptoState::Normal => CryptoMode::Normal,
            CryptoState::Suffix => CryptoMode::Suffix,
            CryptoState::Lite(_) => CryptoMode::Lite,
        }
    }
}

impl CryptoState {
    /// Builds the nonce for the next outgoing packet, advancing any counter.
    ///
    /// `Normal` copies the RTP header into an otherwise zeroed nonce, `Suffix`
    /// draws 24 fresh random bytes, and `Lite` writes the big-endian counter into
    /// the first four bytes before incrementing (and wrapping) it.
    pub fn next_nonce(&mut self, header: &[u8; RTP_HEADER_LEN]) -> PacketNonce {
        let mut nonce = [0u8; NONCE_SIZE];

        match self {
            Self::Normal => {
                nonce[..RTP_HEADER_LEN].copy_from_slice(header);
            },
            Self::Suffix => {
                rand::thread_rng().fill(&mut nonce[..]);
            },
            Self::Lite(i) => {
                NetworkEndian::write_u32(&mut nonce[..LITE_NONCE_SIZE], i.0);
                *i += Wrapping(1);
            },
        }

        PacketNonce {
            nonce,
            suffix_len: self.kind().payload_suffix_len(),
        }
    }

    /// Returns the underlying (stateless) type of the active crypto mode.
    #[must_use]
    pub fn kind(&self) -> CryptoMode {
        CryptoMode::from(*self)
    }
}

/// The session's shared secret key.
///
/// This is published once per session and read by both media pipelines.
/// [`SecretKey::clear`] overwrites the key material, after which every
/// seal or open attempt fails.
pub struct SecretKey {
    key: RwLock<Option<[u8; KEY_SIZE]>>,
}

impl SecretKey {
    /// Wraps raw key bytes.
    #[must_use]
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self {
            key: RwLock::new(Some(key)),
        }
    }

    /// Builds a key from the bytes sent in a session description.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; KEY_SIZE]>::try_from(bytes).ok().map(Self::new)
    }

    fn cipher(&self) -> Result<Cipher, CryptoError> {
        let guard = self.key.read();
        let key = guard.as_ref().ok_or(CryptoError)?;
        Cipher::new_from_slice(&key[..]).map_err(|_| CryptoError)
    }

    /// Encrypts `plaintext`, returning the 16-byte tag followed by the ciphertext.
    pub fn seal(&self, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = self.cipher()?;

        let mut out = vec![0u8; TAG_SIZE + plaintext.len()];
        out[TAG_SIZE..].copy_from_slice(plaintext);

        let tag = cipher.encrypt_in_place_detached(
            Nonce::from_slice(&nonce[..]),
            b"",
            &mut out[TAG_SIZE..],
        )?;
        out[..TAG_SIZE].copy_from_slice(&tag[..]);

        Ok(out)
    }

    /// Decrypts a tag-prefixed ciphertext, failing if it does not authenticate.
    pub fn open(&self, nonce: &Nonce, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < TAG_SIZE {
            return Err(CryptoError);
        }

        let cipher = self.cipher()?;
        let (tag, body) = sealed.split_at(TAG_SIZE);
        let mut out = body.to_vec();

        cipher.decrypt_in_place_detached(nonce, b"", &mut out, Tag::from_slice(tag))?;

        Ok(out)
    }

    /// Zeroes and drops the key material.
    ///
    /// Returns `true` if this call removed a live key.
    pub fn clear(&self) -> bool {
        let mut guard = self.key.write();
        let live = guard.is_some();

        guard.zeroize();

        live
    }

    /// Returns whether the key has been cleared.
    #[must_use]
    pub fn is_cleared(&self) -> bool {
        self.key.read().is_none()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey")
            .field("cleared", &self.is_cleared())
            .finish_non_exhaustive()
    }
}
