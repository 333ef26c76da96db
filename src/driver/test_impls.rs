#![allow(missing_docs)]

use crate::{
    audio::{AudioSink, AudioSupplier, CombinedAudioFrame},
    bridge::GatewayBridge,
    codec::{AudioDecoder, AudioEncoder, CodecError, CodecFactory},
    constants::*,
    driver::ConnectionStatus,
    id::{ChannelId, GuildId, UserId},
    model::Event,
    ws::{self, ControlChannel, Connector},
};
use async_trait::async_trait;
use bytes::Bytes;
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{net::UdpSocket, task::JoinHandle, time::timeout};
use url::Url;

/// Bridge recording every call made by a driver.
#[derive(Debug)]
pub struct RecordingBridge {
    statuses: Mutex<Vec<ConnectionStatus>>,
    pings: Mutex<Vec<Duration>>,
    reconnects: AtomicUsize,
    disconnects: AtomicUsize,
    pub channel_exists: AtomicBool,
    pub is_member: AtomicBool,
}

impl Default for RecordingBridge {
    fn default() -> Self {
        Self {
            statuses: Mutex::default(),
            pings: Mutex::default(),
            reconnects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            channel_exists: AtomicBool::new(true),
            is_member: AtomicBool::new(true),
        }
    }
}

impl RecordingBridge {
    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        self.statuses.lock().clone()
    }

    pub fn pings(&self) -> Vec<Duration> {
        self.pings.lock().clone()
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Waits until `status` has been reported.
    pub async fn wait_for(&self, status: ConnectionStatus) {
        timeout(Duration::from_secs(5), async {
            while !self.statuses.lock().contains(&status) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never saw {status}; saw {:?}", self.statuses()));
    }
}

impl GatewayBridge for RecordingBridge {
    fn on_status_change(&self, _guild_id: GuildId, status: ConnectionStatus) {
        self.statuses.lock().push(status);
    }

    fn on_ping(&self, _guild_id: GuildId, latency: Duration) {
        self.pings.lock().push(latency);
    }

    fn request_reconnect(&self, _guild_id: GuildId) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn request_disconnect(&self, _guild_id: GuildId) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn channel_exists(&self, _guild_id: GuildId, _channel_id: ChannelId) -> bool {
        self.channel_exists.load(Ordering::SeqCst)
    }

    fn is_guild_member(&self, _guild_id: GuildId) -> bool {
        self.is_member.load(Ordering::SeqCst)
    }
}

/// Sink recording everything delivered to it.
#[derive(Debug, Default)]
pub struct RecordingSink {
    combined: bool,
    excluded: Option<UserId>,
    speaker_frames: Mutex<Vec<(UserId, Vec<i16>)>>,
    combined_frames: Mutex<Vec<CombinedAudioFrame>>,
    speaking: Mutex<Vec<(UserId, u32, bool)>>,
}

impl RecordingSink {
    pub fn with_combined() -> Self {
        Self {
            combined: true,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn excluding(mut self, user: UserId) -> Self {
        self.excluded = Some(user);
        self
    }

    pub fn speaker_frames(&self) -> Vec<(UserId, Vec<i16>)> {
        self.speaker_frames.lock().clone()
    }

    pub fn combined_frames(&self) -> Vec<CombinedAudioFrame> {
        self.combined_frames.lock().clone()
    }

    pub fn speaking_updates(&self) -> Vec<(UserId, u32, bool)> {
        self.speaking.lock().clone()
    }
}

impl AudioSink for RecordingSink {
    fn can_receive_combined(&self) -> bool {
        self.combined
    }

    fn include_in_combined(&self, user: UserId) -> bool {
        self.excluded != Some(user)
    }

    fn on_speaker_frame(&self, user: UserId, pcm: &[i16]) {
        self.speaker_frames.lock().push((user, pcm.to_vec()));
    }

    fn on_combined_frame(&self, frame: &CombinedAudioFrame) {
        self.combined_frames.lock().push(frame.clone());
    }

    fn on_speaking_update(&self, user: UserId, ssrc: u32, speaking: bool) {
        self.speaking.lock().push((user, ssrc, speaking));
    }
}

/// Supplier handing out a fixed list of frames, then running dry.
pub struct ScriptedSupplier {
    frames: VecDeque<Bytes>,
    pre_encoded: bool,
}

impl ScriptedSupplier {
    pub fn raw(frames: Vec<Bytes>) -> Self {
        Self {
            frames: frames.into(),
            pre_encoded: false,
        }
    }

    pub fn pre_encoded(frames: Vec<Bytes>) -> Self {
        Self {
            frames: frames.into(),
            pre_encoded: true,
        }
    }
}

impl AudioSupplier for ScriptedSupplier {
    fn has_audio(&mut self) -> bool {
        !self.frames.is_empty()
    }

    fn next_frame(&mut self) -> Option<Bytes> {
        self.frames.pop_front()
    }

    fn is_pre_encoded(&self) -> bool {
        self.pre_encoded
    }
}

const FAKE_MARKER: u8 = 0xec;
const FAKE_CORRUPT: u8 = 0xee;

/// Deterministic stand-in for Opus.
///
/// A frame "encodes" to a marker byte followed by its first sample, and
/// decodes back to a full frame of that sample.
#[derive(Clone, Debug)]
pub struct FakeCodec {
    available: bool,
    concealed: Arc<AtomicUsize>,
}

impl Default for FakeCodec {
    fn default() -> Self {
        Self {
            available: true,
            concealed: Arc::default(),
        }
    }
}

impl FakeCodec {
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Default::default()
        }
    }

    pub fn encoded_marker(sample: i16) -> Vec<u8> {
        let mut out = vec![FAKE_MARKER];
        out.extend_from_slice(&sample.to_be_bytes());
        out
    }

    pub fn corrupt_payload() -> Vec<u8> {
        vec![FAKE_CORRUPT, 0, 0]
    }

    /// Number of loss-concealment decodes performed by every decoder.
    pub fn concealed(&self) -> usize {
        self.concealed.load(Ordering::SeqCst)
    }
}

impl CodecFactory for FakeCodec {
    fn is_available(&self) -> bool {
        self.available
    }

    fn encoder(&self, _bitrate: i32) -> Result<Box<dyn AudioEncoder>, CodecError> {
        if self.available {
            Ok(Box::new(FakeEncoder))
        } else {
            Err(CodecError::Unavailable)
        }
    }

    fn decoder(&self) -> Result<Box<dyn AudioDecoder>, CodecError> {
        if self.available {
            Ok(Box::new(FakeDecoder {
                concealed: self.concealed.clone(),
            }))
        } else {
            Err(CodecError::Unavailable)
        }
    }
}

struct FakeEncoder;

impl AudioEncoder for FakeEncoder {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        if pcm.len() != STEREO_FRAME_SIZE {
            return Err(CodecError::WrongFrameSize(pcm.len()));
        }

        Ok(FakeCodec::encoded_marker(pcm[0]))
    }
}

struct FakeDecoder {
    concealed: Arc<AtomicUsize>,
}

impl AudioDecoder for FakeDecoder {
    fn decode(&mut self, packet: Option<&[u8]>) -> Result<Vec<i16>, CodecError> {
        match packet {
            None => {
                self.concealed.fetch_add(1, Ordering::SeqCst);
                Ok(vec![0; STEREO_FRAME_SIZE])
            },
            Some([FAKE_MARKER, hi, lo]) =>
                Ok(vec![i16::from_be_bytes([*hi, *lo]); STEREO_FRAME_SIZE]),
            Some(p) if p == SILENT_FRAME => Ok(vec![0; STEREO_FRAME_SIZE]),
            Some(_) => Err(CodecError::Other("corrupt packet".into())),
        }
    }
}

/// A message sent by the fake voice server.
#[derive(Debug)]
pub enum ServerFrame {
    Event(Event),
    Close(u16),
}

/// A message sent by the driver under test.
#[derive(Debug)]
pub enum ClientFrame {
    Event(Event),
    Close(u16),
}

/// In-memory control channel, driven by a test acting as the voice server.
pub struct MockChannel {
    incoming: Receiver<ServerFrame>,
    outgoing: Sender<ClientFrame>,
}

/// Creates a control channel, along with the server's ends of it.
pub fn mock_channel() -> (MockChannel, Sender<ServerFrame>, Receiver<ClientFrame>) {
    let (server_tx, incoming) = flume::unbounded();
    let (outgoing, client_rx) = flume::unbounded();

    (MockChannel { incoming, outgoing }, server_tx, client_rx)
}

impl MockChannel {
    fn convert(frame: Result<ServerFrame, flume::RecvError>) -> ws::Result<Option<Event>> {
        match frame {
            Ok(ServerFrame::Event(e)) => Ok(Some(e)),
            Ok(ServerFrame::Close(code)) => Err(ws::Error::WsClosed(Some(code))),
            Err(_) => Err(ws::Error::WsClosed(None)),
        }
    }
}

#[async_trait]
impl ControlChannel for MockChannel {
    async fn send_json(&mut self, value: &Event) -> ws::Result<()> {
        self.outgoing
            .send(ClientFrame::Event(value.clone()))
            .map_err(|_| ws::Error::WsClosed(None))
    }

    async fn recv_json(&mut self) -> ws::Result<Option<Event>> {
        match timeout(Duration::from_millis(500), self.incoming.recv_async()).await {
            Ok(frame) => Self::convert(frame),
            Err(_) => Ok(None),
        }
    }

    async fn recv_json_no_timeout(&mut self) -> ws::Result<Option<Event>> {
        Self::convert(self.incoming.recv_async().await)
    }

    async fn close(&mut self, code: u16) -> ws::Result<()> {
        self.outgoing
            .send(ClientFrame::Close(code))
            .map_err(|_| ws::Error::WsClosed(None))
    }
}

/// Connector handing out pre-made mock channels, in order.
///
/// Once every channel is used up, further connects fail.
#[derive(Default)]
pub struct MockConnector {
    channels: Mutex<VecDeque<MockChannel>>,
    urls: Mutex<Vec<Url>>,
}

impl MockConnector {
    /// Queues a channel, returning the server's ends of it.
    pub fn push(&self) -> (Sender<ServerFrame>, Receiver<ClientFrame>) {
        let (channel, tx, rx) = mock_channel();
        self.channels.lock().push_back(channel);
        (tx, rx)
    }

    pub fn urls(&self) -> Vec<Url> {
        self.urls.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: Url) -> ws::Result<Box<dyn ControlChannel>> {
        self.urls.lock().push(url);

        match self.channels.lock().pop_front() {
            Some(c) => Ok(Box::new(c)),
            None => Err(ws::Error::WsClosed(None)),
        }
    }
}

/// Answers IP discovery requests on localhost, claiming the client is at
/// `(ip, port)`. The first `drop_first` requests go unanswered.
pub async fn spawn_discovery_responder(
    ip: IpAddr,
    port: u16,
    drop_first: usize,
) -> (SocketAddr, JoinHandle<()>) {
    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = udp.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        let mut dropped = 0;

        while let Ok((len, from)) = udp.recv_from(&mut buf).await {
            if len != IP_DISCOVERY_LEN {
                continue;
            }

            if dropped < drop_first {
                dropped += 1;
                continue;
            }

            let _ = udp.send_to(&discovery_response(&buf, ip, port), from).await;
        }
    });

    (addr, handle)
}

fn discovery_response(request: &[u8], ip: IpAddr, port: u16) -> [u8; IP_DISCOVERY_LEN] {
    let mut resp = [0u8; IP_DISCOVERY_LEN];
    resp[..4].copy_from_slice(&request[..4]);
    let ip = ip.to_string();
    resp[4..4 + ip.len()].copy_from_slice(ip.as_bytes());
    resp[68..].copy_from_slice(&port.to_le_bytes());
    resp
}

/// The UDP side of a voice server on localhost.
///
/// Discovery requests are answered as by [`spawn_discovery_responder`], and
/// every other datagram is handed to the test.
pub struct MediaServer {
    pub addr: SocketAddr,
    udp: Arc<UdpSocket>,
    client: Arc<Mutex<Option<SocketAddr>>>,
    datagrams: Receiver<Vec<u8>>,
}

impl MediaServer {
    pub async fn spawn(ip: IpAddr, port: u16) -> Self {
        let udp = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = udp.local_addr().unwrap();
        let client = Arc::new(Mutex::new(None));
        let (tx, datagrams) = flume::unbounded();

        let task_udp = udp.clone();
        let task_client = client.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];

            while let Ok((len, from)) = task_udp.recv_from(&mut buf).await {
                if len == IP_DISCOVERY_LEN {
                    *task_client.lock() = Some(from);
                    let _ = task_udp
                        .send_to(&discovery_response(&buf, ip, port), from)
                        .await;
                } else if tx.send(buf[..len].to_vec()).is_err() {
                    break;
                }
            }
        });

        Self {
            addr,
            udp,
            client,
            datagrams,
        }
    }

    /// The socket address discovery was run from.
    pub fn client(&self) -> SocketAddr {
        self.client.lock().expect("client has not run discovery")
    }

    /// Waits for the next RTP packet from the client, skipping keepalives.
    pub async fn next_rtp(&self, within: Duration) -> Option<Vec<u8>> {
        timeout(within, async {
            loop {
                let pkt = self.datagrams.recv_async().await.ok()?;
                if pkt.len() > RTP_HEADER_LEN && pkt[0] & 0xc0 == 0x80 {
                    return Some(pkt);
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    pub async fn send_to_client(&self, bytes: &[u8]) {
        self.udp.send_to(bytes, self.client()).await.unwrap();
    }
}

/// Polls `cond` until it holds, panicking after a few seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

/// Receives the next event sent by a client, skipping heartbeats.
pub async fn next_client_event(rx: &Receiver<ClientFrame>) -> ClientFrame {
    loop {
        let frame = timeout(Duration::from_secs(5), rx.recv_async())
            .await
            .expect("client sent nothing")
            .expect("client hung up");

        if !matches!(frame, ClientFrame::Event(Event::Heartbeat(_))) {
            return frame;
        }
    }
}
