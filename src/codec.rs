//! Seams around the audio codec used by both media pipelines.
//!
//! Audio is exchanged as 20ms frames of 48kHz interleaved stereo. By default
//! frames are coded with Opus via [audiopus]; tests and alternative backends can
//! substitute their own [`CodecFactory`] through [`Config::codec`].
//!
//! [audiopus]: https://github.com/lakelezz/audiopus
//! [`Config::codec`]: crate::Config::codec

use crate::constants::*;
use audiopus::{
    coder::{Decoder as OpusDecoder, Encoder as OpusEncoder},
    packet::Packet as OpusPacket,
    Application as CodingMode,
    Bitrate,
    Channels,
    Error as OpusError,
    SampleRate,
};
use once_cell::sync::OnceCell;
use std::{convert::TryInto, error::Error as StdError, fmt};
use tracing::error;

/// Encodes one 20ms frame of interleaved stereo PCM.
pub trait AudioEncoder: Send {
    /// Encodes `pcm`, which holds [`STEREO_FRAME_SIZE`] samples.
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError>;
}

/// Decodes compressed frames from a single speaker.
pub trait AudioDecoder: Send {
    /// Decodes one packet into interleaved stereo PCM.
    ///
    /// `None` asks the decoder to conceal a lost packet.
    fn decode(&mut self, packet: Option<&[u8]>) -> Result<Vec<i16>, CodecError>;
}

/// Builds encoders and decoders for each voice session.
pub trait CodecFactory: Send + Sync {
    /// Returns whether this codec can be used at all.
    ///
    /// If this is `false`, no audio is sent or received, though the voice
    /// connection itself is still maintained.
    fn is_available(&self) -> bool {
        true
    }

    /// Creates an encoder targeting `bitrate` bits per second.
    fn encoder(&self, bitrate: i32) -> Result<Box<dyn AudioEncoder>, CodecError>;

    /// Creates a decoder for one remote speaker.
    fn decoder(&self) -> Result<Box<dyn AudioDecoder>, CodecError>;
}

/// Errors raised by a codec.
#[derive(Debug)]
#[non_exhaustive]
pub enum CodecError {
    /// Opus library failure.
    Opus(OpusError),
    /// The input frame did not hold a full 20ms of audio.
    WrongFrameSize(usize),
    /// The codec could not be loaded in this process.
    Unavailable,
    /// Failure from a non-Opus codec backend.
    Other(String),
}

impl From<OpusError> for CodecError {
    fn from(e: OpusError) -> Self {
        CodecError::Opus(e)
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "codec failure: ")?;
        match self {
            Self::Opus(e) => e.fmt(f),
            Self::WrongFrameSize(n) => write!(f, "expected {STEREO_FRAME_SIZE} samples, got {n}"),
            Self::Unavailable => write!(f, "codec could not be loaded"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

impl StdError for CodecError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Opus(e) => Some(e),
            _ => None,
        }
    }
}

static OPUS_AVAILABLE: OnceCell<bool> = OnceCell::new();

/// Opus codec backed by libopus.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpusCodec;

impl CodecFactory for OpusCodec {
    fn is_available(&self) -> bool {
        *OPUS_AVAILABLE.get_or_init(|| {
            match OpusEncoder::new(SampleRate::Hz48000, Channels::Stereo, CodingMode::Audio) {
                Ok(_) => true,
                Err(e) => {
                    error!("Opus could not be initialised, audio is disabled: {:?}", e);
                    false
                },
            }
        })
    }

    fn encoder(&self, bitrate: i32) -> Result<Box<dyn AudioEncoder>, CodecError> {
        if !self.is_available() {
            return Err(CodecError::Unavailable);
        }

        let mut encoder = OpusEncoder::new(SampleRate::Hz48000, Channels::Stereo, CodingMode::Audio)?;
        encoder.set_bitrate(Bitrate::BitsPerSecond(bitrate))?;

        Ok(Box::new(OpusFrameEncoder {
            encoder,
            buffer: vec![0u8; VOICE_PACKET_MAX],
        }))
    }

    fn decoder(&self) -> Result<Box<dyn AudioDecoder>, CodecError> {
        if !self.is_available() {
            return Err(CodecError::Unavailable);
        }

        Ok(Box::new(OpusFrameDecoder {
            decoder: OpusDecoder::new(SampleRate::Hz48000, Channels::Stereo)?,
        }))
    }
}

struct OpusFrameEncoder {
    encoder: OpusEncoder,
    buffer: Vec<u8>,
}

impl AudioEncoder for OpusFrameEncoder {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        if pcm.len() != STEREO_FRAME_SIZE {
            return Err(CodecError::WrongFrameSize(pcm.len()));
        }

        let len = self.encoder.encode(pcm, &mut self.buffer[..])?;
        Ok(self.buffer[..len].to_vec())
    }
}

struct OpusFrameDecoder {
    decoder: OpusDecoder,
}

impl AudioDecoder for OpusFrameDecoder {
    fn decode(&mut self, packet: Option<&[u8]>) -> Result<Vec<i16>, CodecError> {
        let mut out = vec![0i16; STEREO_FRAME_SIZE];

        let packet: Option<OpusPacket<'_>> = match packet {
            Some(bytes) => Some(bytes.try_into()?),
            None => None,
        };
        let dest = (&mut out[..])
            .try_into()
            .expect("Decode buffer is a fixed, non-empty frame.");

        let len = self.decoder.decode(packet, dest, false)?;
        out.truncate(2 * len);

        Ok(out)
    }
}

/// Converts one frame of big-endian interleaved 16-bit PCM into samples.
pub(crate) fn pcm_from_be_bytes(bytes: &[u8]) -> Result<Vec<i16>, CodecError> {
    if bytes.len() != STEREO_FRAME_BYTE_SIZE {
        return Err(CodecError::WrongFrameSize(bytes.len() / 2));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}
