//! Audio fixtures shared by warble's benchmarks.

use byteorder::{BigEndian, ByteOrder};

/// Samples in one 20ms frame of 48kHz interleaved stereo.
pub const STEREO_FRAME_SIZE: usize = 1920;

/// One frame of a stereo sine wave at `freq` Hz, starting at sample `offset`.
pub fn sine_frame(freq: f32, amplitude: i16, offset: usize) -> Vec<i16> {
    let step = std::f32::consts::TAU * freq / 48_000.0;

    (0..STEREO_FRAME_SIZE / 2)
        .flat_map(|i| {
            let s = ((offset + i) as f32 * step).sin() * f32::from(amplitude);
            let s = s as i16;
            [s, s]
        })
        .collect()
}

/// One frame of deterministic noise, seeded by `seed`.
pub fn noise_frame(seed: u32) -> Vec<i16> {
    // xorshift32
    let mut state = seed.max(1);

    (0..STEREO_FRAME_SIZE)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 16) as i16
        })
        .collect()
}

/// Serialises samples as big-endian bytes, as expected of raw audio suppliers.
pub fn to_be_bytes(pcm: &[i16]) -> Vec<u8> {
    let mut out = vec![0u8; pcm.len() * 2];
    BigEndian::write_i16_into(pcm, &mut out);
    out
}
