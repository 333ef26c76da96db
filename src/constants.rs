//! Constants affecting driver function and API handling.

use discortp::rtp::RtpType;
use std::time::Duration;

/// The voice gateway version used by the library.
pub const VOICE_GATEWAY_VERSION: u8 = 4;

/// Sample rate of audio to be sent to the voice server.
pub const SAMPLE_RATE_RAW: usize = 48_000;

/// Number of audio frames/packets to be sent per second.
pub const AUDIO_FRAME_RATE: usize = 50;

/// Length of time between any two audio frames.
pub const TIMESTEP_LENGTH: Duration = Duration::from_millis(1000 / AUDIO_FRAME_RATE as u64);

/// Default bitrate for audio, in bits per second.
pub const DEFAULT_BITRATE: i32 = 128_000;

/// Number of samples in one complete frame of audio per channel.
///
/// This is equally the number of stereo (joint) samples in an audio frame,
/// and the amount the RTP timestamp advances with each packet.
pub const MONO_FRAME_SIZE: usize = SAMPLE_RATE_RAW / AUDIO_FRAME_RATE;

/// Number of individual samples in one complete frame of stereo audio.
pub const STEREO_FRAME_SIZE: usize = 2 * MONO_FRAME_SIZE;

/// Number of bytes in one complete frame of raw 16-bit stereo audio.
pub const STEREO_FRAME_BYTE_SIZE: usize = STEREO_FRAME_SIZE * std::mem::size_of::<i16>();

/// Maximum packet size for a voice packet.
///
/// Set a safe amount below the Ethernet MTU to avoid fragmentation/rejection.
pub const VOICE_PACKET_MAX: usize = 1460;

/// Delay between sends of UDP keepalive frames.
///
/// These fire every 5 seconds irrespective of outgoing UDP traffic.
pub const UDP_KEEPALIVE_GAP: Duration = Duration::from_secs(5);

/// Opus silent frame, used to signal speech start and end (and prevent audio glitching).
pub const SILENT_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

/// Number of silent frames sent after audio stops, before the driver goes idle.
pub const SILENT_FRAME_TAIL: u8 = 5;

/// The one (and only) RTP version.
pub const RTP_VERSION: u8 = 2;

/// Profile type used by the voice server's Opus audio traffic.
pub const RTP_PROFILE_TYPE: RtpType = RtpType::Dynamic(120);

/// Length of a fixed RTP header without CSRCs.
pub const RTP_HEADER_LEN: usize = 12;

/// Profile marker which opens a one-byte RTP header extension block.
pub const RTP_EXTENSION_MARKER: [u8; 2] = [0xbe, 0xde];

/// Size of both the IP discovery request and its response.
pub const IP_DISCOVERY_LEN: usize = 70;

/// Two packets whose sequence numbers are further apart than this are
/// assumed to straddle a wraparound of the 16-bit counter.
pub const SEQUENCE_WRAP_THRESHOLD: u16 = 0x8000;

/// Maximum number of loss-concealment frames decoded to bridge a sequence gap.
pub const MAX_CONCEALED_FRAMES: u16 = 5;
