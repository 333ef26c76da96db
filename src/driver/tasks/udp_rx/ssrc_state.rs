use crate::{
    codec::AudioDecoder,
    constants::*,
    driver::{packet::AudioPacket, tasks::error::Result},
    id::UserId,
};
use tracing::trace;

/// How a packet's sequence number relates to the last one decoded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SequenceCheck {
    /// No packet has been decoded for this SSRC yet.
    First,
    /// The packet is newer, with `lost` packets missing in between.
    Next { lost: u16 },
    /// The packet is a duplicate, or arrived after a newer one.
    Stale,
}

/// Classifies `new` against the last accepted sequence number.
///
/// A packet is in order if it is strictly newer, or if it is older by more than
/// [`SEQUENCE_WRAP_THRESHOLD`], which can only mean the counter has wrapped.
pub(crate) fn sequence_check(last: Option<u16>, new: u16) -> SequenceCheck {
    let Some(last) = last else {
        return SequenceCheck::First;
    };

    if new > last || last - new > SEQUENCE_WRAP_THRESHOLD {
        SequenceCheck::Next {
            lost: new.wrapping_sub(last).wrapping_sub(1),
        }
    } else {
        SequenceCheck::Stale
    }
}

/// Decode state for one remote SSRC, while held by one user.
pub(crate) struct SsrcState {
    user: UserId,
    decoder: Box<dyn AudioDecoder>,
    last_sequence: Option<u16>,
    last_timestamp: Option<u32>,
}

impl SsrcState {
    pub(crate) fn new(decoder: Box<dyn AudioDecoder>, user: UserId) -> Self {
        Self {
            user,
            decoder,
            last_sequence: None,
            last_timestamp: None,
        }
    }

    pub(crate) fn user(&self) -> UserId {
        self.user
    }

    /// Decodes one packet, returning `None` if it arrived out of order.
    ///
    /// Gaps in the sequence are bridged with (at most [`MAX_CONCEALED_FRAMES`])
    /// loss-concealment decodes, whose output is discarded.
    pub(crate) fn decode(&mut self, pkt: &AudioPacket) -> Result<Option<Vec<i16>>> {
        match sequence_check(self.last_sequence, pkt.sequence) {
            SequenceCheck::Stale => {
                trace!(
                    "Dropping stale packet {} (last {:?}).",
                    pkt.sequence,
                    self.last_sequence
                );
                return Ok(None);
            },
            SequenceCheck::Next { lost } if lost > 0 => {
                trace!("Lost {} packet(s) before {}.", lost, pkt.sequence);

                for _ in 0..lost.min(MAX_CONCEALED_FRAMES) {
                    if let Err(e) = self.decoder.decode(None) {
                        trace!("Loss concealment failed: {}", e);
                        break;
                    }
                }
            },
            _ => {},
        }

        self.last_sequence = Some(pkt.sequence);
        self.last_timestamp = Some(pkt.timestamp);

        Ok(Some(self.decoder.decode(Some(&pkt.payload))?))
    }

    #[cfg(test)]
    pub(crate) fn last_timestamp(&self) -> Option<u32> {
        self.last_timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::CodecFactory, driver::test_impls::FakeCodec};

    fn pkt(sequence: u16) -> AudioPacket {
        AudioPacket {
            sequence,
            timestamp: u32::from(sequence) * 960,
            ssrc: 1,
            payload: FakeCodec::encoded_marker(1),
        }
    }

    #[test]
    fn gaps_are_loss_not_reordering() {
        assert_eq!(sequence_check(None, 7), SequenceCheck::First);
        assert_eq!(sequence_check(Some(1), 2), SequenceCheck::Next { lost: 0 });
        assert_eq!(sequence_check(Some(2), 5), SequenceCheck::Next { lost: 2 });
        assert_eq!(sequence_check(Some(5), 5), SequenceCheck::Stale);
        assert_eq!(sequence_check(Some(5), 3), SequenceCheck::Stale);
    }

    #[test]
    fn wraparound_is_in_order() {
        assert_eq!(sequence_check(Some(0xfffe), 0xffff), SequenceCheck::Next { lost: 0 });
        assert_eq!(sequence_check(Some(0xffff), 0), SequenceCheck::Next { lost: 0 });
        assert_eq!(sequence_check(Some(0), 1), SequenceCheck::Next { lost: 0 });
        assert_eq!(sequence_check(Some(0xfffe), 1), SequenceCheck::Next { lost: 2 });
    }

    #[test]
    fn decoder_accepts_in_order_and_drops_stale() {
        let codec = FakeCodec::default();
        let mut state = SsrcState::new(codec.decoder().unwrap(), UserId(1));

        for seq in [0xfffe, 0xffff, 0, 1] {
            assert!(state.decode(&pkt(seq)).unwrap().is_some());
        }
        assert_eq!(state.last_timestamp(), Some(960));

        assert!(state.decode(&pkt(0xffff)).unwrap().is_none());
        assert!(state.decode(&pkt(1)).unwrap().is_none());
        assert_eq!(codec.concealed(), 0);
    }

    #[test]
    fn gaps_are_concealed_up_to_a_limit() {
        let codec = FakeCodec::default();
        let mut state = SsrcState::new(codec.decoder().unwrap(), UserId(1));

        state.decode(&pkt(10)).unwrap();
        state.decode(&pkt(13)).unwrap();
        assert_eq!(codec.concealed(), 2);

        state.decode(&pkt(100)).unwrap();
        assert_eq!(codec.concealed(), 2 + usize::from(MAX_CONCEALED_FRAMES));
    }

    #[test]
    fn decode_errors_propagate() {
        let codec = FakeCodec::default();
        let mut state = SsrcState::new(codec.decoder().unwrap(), UserId(1));

        let mut bad = pkt(1);
        bad.payload = FakeCodec::corrupt_payload();
        assert!(state.decode(&bad).is_err());

        // The failed packet still counts as seen.
        assert!(state.decode(&pkt(1)).unwrap().is_none());
    }
}
