use super::{error::Result, message::*};
use crate::{
    codec::{pcm_from_be_bytes, AudioEncoder},
    constants::*,
    driver::{
        crypto::{CryptoMode, CryptoState, SecretKey},
        packet,
    },
};
use flume::{Receiver, Sender, TryRecvError};
use rand::random;
use std::{
    io::ErrorKind as IoErrorKind,
    net::UdpSocket,
    sync::Arc,
    time::Instant,
};
use tracing::{debug, error, instrument, trace};

/// Builds one outgoing voice packet per 20ms tick.
///
/// Owns every counter of the send side: the RTP sequence and timestamp, the
/// nonce state, the silence tail, and the speaking flag.
pub(crate) struct PacketProvider {
    ssrc: u32,
    key: Arc<SecretKey>,
    crypto_state: CryptoState,
    encoder: Option<Box<dyn AudioEncoder>>,
    audio_enabled: bool,
    supplier: SupplierSlot,
    ws: Sender<WsMessage>,

    sequence: u16,
    timestamp: u32,
    silence_frames: u8,
    speaking: bool,
    muted: bool,
}

impl PacketProvider {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ssrc: u32,
        key: Arc<SecretKey>,
        mode: CryptoMode,
        encoder: Option<Box<dyn AudioEncoder>>,
        audio_enabled: bool,
        supplier: SupplierSlot,
        ws: Sender<WsMessage>,
        muted: bool,
    ) -> Self {
        Self {
            ssrc,
            key,
            crypto_state: mode.into(),
            encoder,
            audio_enabled,
            supplier,
            ws,

            sequence: random::<u16>(),
            timestamp: random::<u32>(),
            silence_frames: 0,
            speaking: false,
            muted,
        }
    }

    pub(crate) fn set_mute(&mut self, muted: bool) {
        self.muted = muted;
    }

    /// Pulls one frame from the supplier, if it has any.
    fn next_payload(&mut self) -> Option<FramePayload> {
        if self.muted || !self.audio_enabled {
            return None;
        }

        let mut slot = self.supplier.lock();
        let supplier = slot.as_mut()?;

        if !supplier.has_audio() {
            return None;
        }

        let frame = supplier.next_frame()?;

        Some(if supplier.is_pre_encoded() {
            FramePayload::Opus(frame.to_vec())
        } else {
            FramePayload::Pcm(frame)
        })
    }

    fn set_speaking(&mut self, speaking: bool) {
        if self.speaking != speaking {
            self.speaking = speaking;
            // The control task may be between channels: this is fine.
            drop(self.ws.send(WsMessage::Speaking(speaking)));
        }
    }

    /// Runs one tick, returning the packet to send (if any).
    ///
    /// A frame which fails to encode skips the tick entirely, and does not
    /// advance the sequence or timestamp.
    pub(crate) fn tick(&mut self) -> Result<Option<Vec<u8>>> {
        let opus = match self.next_payload() {
            Some(FramePayload::Opus(bytes)) => bytes,
            Some(FramePayload::Pcm(raw)) => {
                let encoder = self
                    .encoder
                    .as_mut()
                    .ok_or(crate::codec::CodecError::Unavailable)?;
                encoder.encode(&pcm_from_be_bytes(&raw)?)?
            },
            None if self.silence_frames > 0 => {
                self.silence_frames -= 1;
                return self.seal(&SILENT_FRAME).map(Some);
            },
            None => {
                self.set_speaking(false);
                return Ok(None);
            },
        };

        self.silence_frames = SILENT_FRAME_TAIL;
        self.set_speaking(true);

        self.seal(&opus).map(Some)
    }

    fn seal(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let out = packet::seal(
            &mut self.crypto_state,
            &self.key,
            self.sequence,
            self.timestamp,
            self.ssrc,
            payload,
        )?;

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(MONO_FRAME_SIZE as u32);

        Ok(out)
    }
}

enum FramePayload {
    Opus(Vec<u8>),
    Pcm(bytes::Bytes),
}

/// Falling further behind than this resets the send clock, rather than
/// bursting packets to catch up.
const MAX_LAG_FRAMES: u32 = 5;

#[instrument(skip(udp, rx, provider))]
pub(crate) fn runner(udp: UdpSocket, rx: Receiver<UdpTxMessage>, mut provider: PacketProvider) {
    trace!("UDP transmit thread started.");

    let keepalive = packet::keepalive(provider.ssrc);
    let mut next_keepalive = Instant::now() + UDP_KEEPALIVE_GAP;
    let mut deadline = Instant::now();

    'runner: loop {
        loop {
            match rx.try_recv() {
                Ok(UdpTxMessage::SetMute(muted)) => provider.set_mute(muted),
                Ok(UdpTxMessage::Poison) | Err(TryRecvError::Disconnected) => break 'runner,
                Err(TryRecvError::Empty) => break,
            }
        }

        match provider.tick() {
            Ok(Some(pkt)) =>
                if let Err(e) = send(&udp, &pkt) {
                    error!("Fatal UDP packet send error: {:?}.", e);
                    break;
                },
            Ok(None) => {},
            Err(e) => debug!("Skipping frame: {}", e),
        }

        let now = Instant::now();
        if now >= next_keepalive {
            trace!("Sending UDP Keepalive.");
            if let Err(e) = send(&udp, &keepalive) {
                error!("Fatal UDP keepalive send error: {:?}.", e);
                break;
            }
            next_keepalive = now + UDP_KEEPALIVE_GAP;
        }

        deadline += TIMESTEP_LENGTH;
        let now = Instant::now();
        if now > deadline + TIMESTEP_LENGTH * MAX_LAG_FRAMES {
            debug!("Send loop fell behind by {:?}.", now - deadline);
            deadline = now;
        }
        spin_sleep::sleep(deadline.saturating_duration_since(now));
    }

    trace!("UDP transmit thread stopped.");
}

/// Sends a datagram, tolerating refusals caused by ICMP noise.
fn send(udp: &UdpSocket, bytes: &[u8]) -> std::io::Result<()> {
    match udp.send(bytes) {
        Err(e) if e.kind() == IoErrorKind::ConnectionRefused => {
            debug!("UDP send refused: {:?}", e);
            Ok(())
        },
        res => res.map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{
        crypto::KEY_SIZE,
        packet::open,
        test_impls::{FakeCodec, ScriptedSupplier},
    };
    use crate::codec::CodecFactory;
    use bytes::Bytes;
    use parking_lot::Mutex;

    const MODE: CryptoMode = CryptoMode::Lite;

    fn provider(
        supplier: ScriptedSupplier,
    ) -> (PacketProvider, Receiver<WsMessage>, Arc<SecretKey>) {
        let key = Arc::new(SecretKey::new([3u8; KEY_SIZE]));
        let (ws_tx, ws_rx) = flume::unbounded();

        let mut p = PacketProvider::new(
            9,
            key.clone(),
            MODE,
            Some(FakeCodec::default().encoder(DEFAULT_BITRATE).unwrap()),
            true,
            Arc::new(Mutex::new(Some(Box::new(supplier)))),
            ws_tx,
            false,
        );
        p.sequence = 100;
        p.timestamp = 1000;

        (p, ws_rx, key)
    }

    fn speaking(rx: &Receiver<WsMessage>) -> Vec<bool> {
        rx.drain()
            .filter_map(|m| match m {
                WsMessage::Speaking(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    fn opus(n: u8) -> Bytes {
        Bytes::from(vec![n; 10])
    }

    #[test]
    fn audio_then_silence_tail_then_idle() {
        let supplier = ScriptedSupplier::pre_encoded(vec![opus(1), opus(2)]);
        let (mut p, ws_rx, key) = provider(supplier);

        let mut payloads = vec![];
        for _ in 0..10 {
            if let Some(pkt) = p.tick().unwrap() {
                payloads.push(open(MODE, &key, &pkt).unwrap());
            }
        }

        // Two audio frames, then exactly five silent frames.
        assert_eq!(payloads.len(), 7);
        assert_eq!(payloads[0].payload, vec![1; 10]);
        assert_eq!(payloads[1].payload, vec![2; 10]);
        assert!(payloads[2..].iter().all(|p| p.payload == SILENT_FRAME));

        for (i, pkt) in payloads.iter().enumerate() {
            assert_eq!(pkt.sequence, 100 + i as u16);
            assert_eq!(pkt.timestamp, 1000 + 960 * i as u32);
            assert_eq!(pkt.ssrc, 9);
        }

        // One transition each way, not one message per frame.
        assert_eq!(speaking(&ws_rx), vec![true, false]);
    }

    #[test]
    fn counters_wrap() {
        let supplier = ScriptedSupplier::pre_encoded(vec![opus(1), opus(2)]);
        let (mut p, _ws_rx, key) = provider(supplier);
        p.sequence = u16::MAX;
        p.timestamp = u32::MAX - 100;

        let first = open(MODE, &key, &p.tick().unwrap().unwrap()).unwrap();
        let second = open(MODE, &key, &p.tick().unwrap().unwrap()).unwrap();

        assert_eq!(first.sequence, u16::MAX);
        assert_eq!(second.sequence, 0);
        assert_eq!(second.timestamp, (u32::MAX - 100).wrapping_add(960));
    }

    #[test]
    fn raw_audio_is_encoded() {
        let mut pcm = vec![0u8; STEREO_FRAME_BYTE_SIZE];
        pcm[1] = 7;
        let supplier = ScriptedSupplier::raw(vec![Bytes::from(pcm)]);
        let (mut p, _ws_rx, key) = provider(supplier);

        let pkt = open(MODE, &key, &p.tick().unwrap().unwrap()).unwrap();
        assert_eq!(pkt.payload, FakeCodec::encoded_marker(7));
    }

    #[test]
    fn encode_failure_skips_tick_without_advancing() {
        let supplier = ScriptedSupplier::raw(vec![Bytes::from_static(&[0u8; 8]), opus(0)]);
        let (mut p, ws_rx, _key) = provider(supplier);

        assert!(p.tick().is_err());
        assert_eq!(p.sequence, 100);
        assert_eq!(p.timestamp, 1000);
        assert!(speaking(&ws_rx).is_empty());
    }

    #[test]
    fn mute_behaves_like_no_audio() {
        let supplier = ScriptedSupplier::pre_encoded(vec![opus(1); 20]);
        let (mut p, ws_rx, key) = provider(supplier);

        assert!(p.tick().unwrap().is_some());
        p.set_mute(true);

        for _ in 0..SILENT_FRAME_TAIL {
            let pkt = open(MODE, &key, &p.tick().unwrap().unwrap()).unwrap();
            assert_eq!(pkt.payload, SILENT_FRAME);
        }
        assert!(p.tick().unwrap().is_none());
        assert_eq!(speaking(&ws_rx), vec![true, false]);

        p.set_mute(false);
        let pkt = open(MODE, &key, &p.tick().unwrap().unwrap()).unwrap();
        assert_eq!(pkt.payload, vec![1; 10]);
    }

    #[test]
    fn no_supplier_sends_nothing() {
        let key = Arc::new(SecretKey::new([3u8; KEY_SIZE]));
        let (ws_tx, ws_rx) = flume::unbounded();
        let mut p = PacketProvider::new(
            9,
            key,
            MODE,
            None,
            true,
            SupplierSlot::default(),
            ws_tx,
            false,
        );

        assert!(p.tick().unwrap().is_none());
        assert!(ws_rx.is_empty());
    }
}
