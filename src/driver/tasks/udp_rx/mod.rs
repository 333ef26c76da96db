mod ssrc_state;
mod ssrc_table;

pub(crate) use self::ssrc_table::SsrcTable;
use self::ssrc_state::SsrcState;

use super::{combine::SpeakerQueues, error::Error, message::*};
use crate::{
    codec::CodecFactory,
    constants::*,
    driver::{
        crypto::{CryptoMode, SecretKey},
        packet,
    },
    id::UserId,
};
use flume::{Receiver, TryRecvError};
use std::{
    collections::{hash_map::Entry, HashMap},
    io::ErrorKind as IoErrorKind,
    net::UdpSocket,
    sync::Arc,
    time::Instant,
};
use tracing::{debug, error, instrument, trace, warn};

/// What became of one received datagram.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RxOutcome {
    Delivered,
    /// Receive is disabled, or the datagram is not voice.
    Ignored,
    Undecryptable,
    /// No user is bound to the packet's SSRC.
    Unbound,
    OutOfOrder,
    DecodeFailed,
}

/// Receive-side state: owns every per-SSRC decoder.
pub(crate) struct UdpRx {
    mode: CryptoMode,
    key: Arc<SecretKey>,
    ssrc_table: Arc<SsrcTable>,
    decoders: HashMap<u32, SsrcState>,
    queues: Arc<SpeakerQueues>,
    sink: SinkSlot,
    codec: Option<Arc<dyn CodecFactory>>,
}

impl UdpRx {
    pub(crate) fn new(
        mode: CryptoMode,
        key: Arc<SecretKey>,
        ssrc_table: Arc<SsrcTable>,
        queues: Arc<SpeakerQueues>,
        sink: SinkSlot,
        codec: Option<Arc<dyn CodecFactory>>,
    ) -> Self {
        Self {
            mode,
            key,
            ssrc_table,
            decoders: HashMap::new(),
            queues,
            sink,
            codec,
        }
    }

    /// Destroys the decoder `user` held for `ssrc`.
    ///
    /// A decoder created since for a new owner of the SSRC is kept.
    pub(crate) fn remove_ssrc(&mut self, ssrc: u32, user: UserId) {
        if let Entry::Occupied(e) = self.decoders.entry(ssrc) {
            if e.get().user() == user {
                e.remove();
                trace!("Removed decoder for SSRC {}.", ssrc);
            }
        }
    }

    /// Forgets a user who left the call.
    pub(crate) fn remove_user(&mut self, user: UserId) {
        self.decoders.retain(|_, state| state.user() != user);
        self.queues.remove(user);
    }

    pub(crate) fn process_datagram(&mut self, raw: &[u8], now: Instant) -> RxOutcome {
        // Every failure here is contained to this packet.
        let Some(codec) = &self.codec else {
            return RxOutcome::Ignored;
        };

        let Some(sink) = self.sink.read().clone() else {
            return RxOutcome::Ignored;
        };

        let want_speaker = sink.can_receive_speaker();
        let want_combined = sink.can_receive_combined();

        if !(want_speaker || want_combined) || is_rtcp(raw) {
            return RxOutcome::Ignored;
        }

        let pkt = match packet::open(self.mode, &self.key, raw) {
            Ok(pkt) => pkt,
            Err(e) => {
                trace!("Dropping undecryptable packet: {}", e);
                return RxOutcome::Undecryptable;
            },
        };

        let Some(user) = self.ssrc_table.user(pkt.ssrc) else {
            if pkt.payload != SILENT_FRAME {
                debug!("Audio from unbound SSRC {}, dropping.", pkt.ssrc);
            }
            return RxOutcome::Unbound;
        };

        let state = match self.decoders.entry(pkt.ssrc) {
            Entry::Occupied(e) if e.get().user() == user => e.into_mut(),
            entry => {
                let state = match codec.decoder() {
                    Ok(decoder) => SsrcState::new(decoder, user),
                    Err(e) => {
                        warn!("Failed to create decoder for SSRC {}: {}", pkt.ssrc, e);
                        return RxOutcome::DecodeFailed;
                    },
                };

                match entry {
                    Entry::Occupied(mut e) => {
                        trace!("SSRC {} changed hands, resetting its decoder.", pkt.ssrc);
                        e.insert(state);
                        e.into_mut()
                    },
                    Entry::Vacant(e) => e.insert(state),
                }
            },
        };

        let pcm = match state.decode(&pkt) {
            Ok(Some(pcm)) => pcm,
            Ok(None) => return RxOutcome::OutOfOrder,
            Err(e) => {
                trace!("Decode error for SSRC {}: {}", pkt.ssrc, e);
                return RxOutcome::DecodeFailed;
            },
        };

        if want_speaker {
            sink.on_speaker_frame(user, &pcm);
        }

        if want_combined && sink.include_in_combined(user) {
            if pcm.len() == STEREO_FRAME_SIZE {
                self.queues.push(user, pcm, now);
            } else {
                debug!(
                    "Frame of {} samples from {} left out of combined audio.",
                    pcm.len(),
                    user
                );
            }
        }

        RxOutcome::Delivered
    }
}

/// RTCP shares the socket, and is marked by payload types 200 through 204.
fn is_rtcp(raw: &[u8]) -> bool {
    raw.get(1).map_or(false, |pt| (200..=204).contains(pt))
}

#[instrument(skip(udp, rx, state))]
pub(crate) fn runner(udp: UdpSocket, rx: Receiver<UdpRxMessage>, mut state: UdpRx) {
    trace!("UDP receive thread started.");

    let mut buf = [0u8; VOICE_PACKET_MAX];

    'runner: loop {
        loop {
            match rx.try_recv() {
                Ok(UdpRxMessage::RemoveSsrc(ssrc, user)) => state.remove_ssrc(ssrc, user),
                Ok(UdpRxMessage::RemoveUser(user)) => state.remove_user(user),
                Ok(UdpRxMessage::Poison) | Err(TryRecvError::Disconnected) => break 'runner,
                Err(TryRecvError::Empty) => break,
            }
        }

        match udp.recv(&mut buf) {
            Ok(len) => {
                state.process_datagram(&buf[..len], Instant::now());
            },
            Err(e) if e.kind() == IoErrorKind::ConnectionRefused => {
                trace!("Ignoring refused UDP read: {:?}", e);
            },
            Err(e) => {
                let e = Error::from(e);
                if !e.is_timeout() {
                    error!("Fatal UDP receive error: {}.", e);
                    break;
                }
            },
        }
    }

    trace!("UDP receive thread stopped.");
}
