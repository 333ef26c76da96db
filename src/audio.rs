//! Interfaces between a voice driver and the application producing or consuming audio.

use crate::id::UserId;
use bytes::Bytes;

/// Source of outgoing audio, polled once per 20ms frame.
pub trait AudioSupplier: Send {
    /// Returns whether a frame is ready to be sent this tick.
    fn has_audio(&mut self) -> bool;

    /// Returns the next frame.
    ///
    /// Raw frames must hold 20ms of 48kHz stereo audio as interleaved
    /// big-endian `i16` samples (3840 bytes). If [`is_pre_encoded`] is `true`,
    /// frames are instead sent as-is, and must already be Opus packets.
    ///
    /// [`is_pre_encoded`]: AudioSupplier::is_pre_encoded
    fn next_frame(&mut self) -> Option<Bytes>;

    /// Returns whether frames are already Opus-encoded.
    fn is_pre_encoded(&self) -> bool {
        false
    }
}

/// Consumer of received audio.
///
/// Per-speaker frames are delivered from the receive thread as soon as they
/// are decoded, while combined frames arrive every 20ms from a mixing thread.
pub trait AudioSink: Send + Sync {
    /// Whether [`on_speaker_frame`] should be called.
    ///
    /// [`on_speaker_frame`]: AudioSink::on_speaker_frame
    fn can_receive_speaker(&self) -> bool {
        true
    }

    /// Whether [`on_combined_frame`] should be called.
    ///
    /// [`on_combined_frame`]: AudioSink::on_combined_frame
    fn can_receive_combined(&self) -> bool {
        false
    }

    /// Whether a given user's audio should be part of the combined mix.
    fn include_in_combined(&self, _user: UserId) -> bool {
        true
    }

    /// Receives one decoded frame of interleaved stereo PCM from a single user.
    fn on_speaker_frame(&self, _user: UserId, _pcm: &[i16]) {}

    /// Receives the mix of every user who spoke in the last 20ms.
    fn on_combined_frame(&self, _frame: &CombinedAudioFrame) {}

    /// Receives changes in another user's speaking state.
    fn on_speaking_update(&self, _user: UserId, _ssrc: u32, _speaking: bool) {}
}

/// One 20ms tick of mixed audio.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CombinedAudioFrame {
    /// Users whose audio contributed to this frame.
    pub users: Vec<UserId>,
    /// Interleaved 48kHz stereo PCM, 1920 samples long.
    pub audio: Vec<i16>,
}

impl CombinedAudioFrame {
    /// Returns whether nobody spoke during this tick.
    #[must_use]
    pub fn is_silent(&self) -> bool {
        self.users.is_empty()
    }
}
