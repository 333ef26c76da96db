pub mod error;

use super::{
    crypto::{CryptoMode, SecretKey},
    discovery,
    tasks::{
        combine::{Mixer, SpeakerQueues},
        message::*,
        udp_rx::{self, SsrcTable, UdpRx},
        udp_tx::{self, PacketProvider},
        ws::{self as ws_task, AuxNetwork},
    },
    ConnectionStatus,
};
use crate::{
    constants::*,
    model::{
        payload::{Hello, Identify, Ready, Resume, SelectProtocol},
        Event as GatewayEvent,
        ProtocolData,
    },
    ws::ControlChannel,
    Config,
    ConnectionInfo,
};
use error::{Error, Result};
use flume::Sender;
use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{net::UdpSocket, spawn, time::timeout};
use tracing::{debug, info, instrument, warn};
use url::Url;

/// A live voice session and the handles needed to resume or end it.
pub(crate) struct Connection {
    pub(crate) info: ConnectionInfo,
    pub(crate) ssrc: u32,
    pub(crate) generation: usize,
    pub(crate) session: Arc<MediaSession>,
}

impl Connection {
    /// Runs a full handshake, bounded by the configured driver timeout.
    pub(crate) async fn new(
        info: ConnectionInfo,
        interconnect: &Interconnect,
        config: &Config,
        generation: usize,
        muted: bool,
    ) -> Result<Connection> {
        if let Some(t) = config.driver_timeout {
            timeout(
                t,
                Connection::new_inner(info, interconnect, config, generation, muted),
            )
            .await?
        } else {
            Connection::new_inner(info, interconnect, config, generation, muted).await
        }
    }

    #[instrument(skip(interconnect, config))]
    pub(crate) async fn new_inner(
        mut info: ConnectionInfo,
        interconnect: &Interconnect,
        config: &Config,
        generation: usize,
        muted: bool,
    ) -> Result<Connection> {
        let status = &interconnect.status;
        let guild_id = info.guild_id;

        status.set(guild_id, ConnectionStatus::AwaitingWebsocketConnect);

        let url = generate_url(&mut info.endpoint)?;
        let mut client = config.connector.connect(url).await.map_err(Error::WsConnect)?;

        client
            .send_json(&GatewayEvent::from(Identify {
                server_id: info.guild_id,
                session_id: info.session_id.clone(),
                token: info.token.clone(),
                user_id: info.user_id,
            }))
            .await?;

        status.set(guild_id, ConnectionStatus::AwaitingAuthenticating);

        let (hello, ready, mode) = await_ready(&mut *client).await?;

        status.set(guild_id, ConnectionStatus::AttemptingUdpDiscovery);

        let udp = match ready.ip {
            IpAddr::V4(_) => UdpSocket::bind("0.0.0.0:0").await?,
            IpAddr::V6(_) => UdpSocket::bind("[::]:0").await?,
        };
        udp.connect(SocketAddr::new(ready.ip, ready.port)).await?;

        let (address, port) = discovery::discover(
            &udp,
            ready.ssrc,
            config.discovery_attempts,
            config.discovery_timeout,
        )
        .await?;

        client
            .send_json(&GatewayEvent::from(SelectProtocol {
                protocol: "udp".into(),
                data: ProtocolData {
                    address,
                    mode: mode.to_request_str().into(),
                    port,
                },
            }))
            .await?;

        status.set(guild_id, ConnectionStatus::AwaitingReady);

        let key = Arc::new(init_key(&mut *client, mode).await?);

        info!("Connected to: {}", info.endpoint);
        info!("WS heartbeat duration {}ms.", hello.heartbeat_interval);

        let ssrc = ready.ssrc;
        let session = start_media(
            udp,
            client,
            MediaParams {
                info: &info,
                ssrc,
                mode,
                key,
                heartbeat_interval: hello.heartbeat_interval,
                generation,
                muted,
            },
            interconnect,
            config,
        )?;

        status.set(guild_id, ConnectionStatus::Connected);

        Ok(Connection {
            info,
            ssrc,
            generation,
            session,
        })
    }

    /// Resumes this session over a new control channel, bounded by the
    /// configured driver timeout.
    #[instrument(skip(self, interconnect, config))]
    pub(crate) async fn reconnect(
        &mut self,
        interconnect: &Interconnect,
        config: &Config,
    ) -> Result<()> {
        if let Some(t) = config.driver_timeout {
            timeout(t, self.reconnect_inner(interconnect, config)).await?
        } else {
            self.reconnect_inner(interconnect, config).await
        }
    }

    #[instrument(skip(self, interconnect, config))]
    pub(crate) async fn reconnect_inner(
        &mut self,
        interconnect: &Interconnect,
        config: &Config,
    ) -> Result<()> {
        if self.session.is_closed() {
            return Err(Error::AttemptDiscarded);
        }

        let status = &interconnect.status;
        let guild_id = self.info.guild_id;

        status.set(guild_id, ConnectionStatus::AwaitingWebsocketConnect);

        let url = generate_url(&mut self.info.endpoint)?;
        let mut client = config.connector.connect(url).await.map_err(Error::WsConnect)?;

        client
            .send_json(&GatewayEvent::from(Resume {
                server_id: self.info.guild_id,
                session_id: self.info.session_id.clone(),
                token: self.info.token.clone(),
            }))
            .await?;

        status.set(guild_id, ConnectionStatus::AwaitingAuthenticating);

        let mut hello = None;
        let mut resumed = false;

        while hello.is_none() || !resumed {
            let Some(value) = client.recv_json().await? else {
                continue;
            };

            match value {
                GatewayEvent::Resumed => resumed = true,
                GatewayEvent::Hello(h) => hello = Some(h),
                other => {
                    debug!("Expected resumed/hello; got: {:?}", other);
                },
            }
        }

        let hello = hello.expect("FATAL: Loop only exits once hello is received.");

        // A teardown may have begun while we waited on the server.
        if self.session.is_closed() {
            let _ = client.close(crate::ws::NORMAL_CLOSURE).await;
            return Err(Error::AttemptDiscarded);
        }

        self.session
            .ws
            .send(WsMessage::SetKeepalive(hello.heartbeat_interval))?;
        self.session.ws.send(WsMessage::Ws(client))?;

        status.set(guild_id, ConnectionStatus::Connected);

        info!("Reconnected to: {}", &self.info.endpoint);
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.session.shutdown() {
            info!("Disconnected");
        }
    }
}

/// Waits for both HELLO and READY, negotiating an encryption mode as soon as
/// READY arrives.
async fn await_ready(client: &mut dyn ControlChannel) -> Result<(Hello, Ready, CryptoMode)> {
    let mut hello = None;
    let mut ready = None;

    loop {
        let Some(value) = client.recv_json().await? else {
            continue;
        };

        match value {
            GatewayEvent::Ready(r) => {
                let mode = CryptoMode::negotiate(&r.modes).ok_or_else(|| {
                    warn!("Server offered no supported encryption mode: {:?}", r.modes);
                    Error::CryptoModeUnavailable
                })?;
                debug!("Negotiated encryption mode {}.", mode);
                ready = Some((r, mode));
            },
            GatewayEvent::Hello(h) => {
                hello = Some(h);
            },
            other => {
                debug!("Expected ready/hello; got: {:?}", other);
            },
        }

        match (hello, ready) {
            (Some(h), Some((r, mode))) => return Ok((h, r, mode)),
            (h, r) => {
                hello = h;
                ready = r;
            },
        }
    }
}

#[inline]
async fn init_key(client: &mut dyn ControlChannel, mode: CryptoMode) -> Result<SecretKey> {
    loop {
        let Some(value) = client.recv_json().await? else {
            continue;
        };

        match value {
            GatewayEvent::SessionDescription(desc) => {
                if desc.mode != mode.to_request_str() {
                    return Err(Error::CryptoModeInvalid);
                }

                return SecretKey::from_slice(&desc.secret_key).ok_or(Error::CryptoInvalidLength);
            },
            other => {
                debug!(
                    "Expected ready for key; got: op{}/v{:?}",
                    other.kind() as u8,
                    other
                );
            },
        }
    }
}

struct MediaParams<'a> {
    info: &'a ConnectionInfo,
    ssrc: u32,
    mode: CryptoMode,
    key: Arc<SecretKey>,
    heartbeat_interval: f64,
    generation: usize,
    muted: bool,
}

/// Hands the UDP socket to the send and receive threads, and the control
/// channel to its own task.
fn start_media(
    udp: UdpSocket,
    client: Box<dyn ControlChannel>,
    params: MediaParams<'_>,
    interconnect: &Interconnect,
    config: &Config,
) -> Result<Arc<MediaSession>> {
    let MediaParams {
        info,
        ssrc,
        mode,
        key,
        heartbeat_interval,
        generation,
        muted,
    } = params;

    // Both pipelines run on dedicated threads, so they receive blocking sockets.
    // The receive side wakes at least once per `receive_timeout` to check for
    // shutdown.
    let udp_tx_sock = udp.into_std()?;
    udp_tx_sock.set_nonblocking(false)?;
    let udp_rx_sock = udp_tx_sock.try_clone()?;
    udp_rx_sock.set_read_timeout(Some(config.receive_timeout))?;

    let (ws_msg_tx, ws_msg_rx) = flume::unbounded();
    let (udp_tx_msg_tx, udp_tx_msg_rx) = flume::unbounded();
    let (udp_rx_msg_tx, udp_rx_msg_rx) = flume::unbounded();

    let ssrc_table = Arc::new(SsrcTable::default());
    let queues = Arc::new(SpeakerQueues::new(config.speaker_queue_capacity));
    let mixer = Mixer::new(
        queues.clone(),
        interconnect.sink.clone(),
        config.combined_audio_timeout,
    );

    let codec_available = config.codec.is_available();
    let encoder = if codec_available {
        config
            .codec
            .encoder(config.bitrate)
            .map_err(|e| warn!("Failed to create encoder, only pre-encoded audio will be sent: {}", e))
            .ok()
    } else {
        None
    };

    let provider = PacketProvider::new(
        ssrc,
        key.clone(),
        mode,
        encoder,
        codec_available,
        interconnect.supplier.clone(),
        ws_msg_tx.clone(),
        muted,
    );

    std::thread::Builder::new()
        .name(format!("warble-udp-tx-{}", info.guild_id))
        .spawn(move || udp_tx::runner(udp_tx_sock, udp_tx_msg_rx, provider))?;

    let rx_state = UdpRx::new(
        mode,
        key.clone(),
        ssrc_table.clone(),
        queues,
        interconnect.sink.clone(),
        if codec_available {
            Some(config.codec.clone())
        } else {
            None
        },
    );

    std::thread::Builder::new()
        .name(format!("warble-udp-rx-{}", info.guild_id))
        .spawn(move || udp_rx::runner(udp_rx_sock, udp_rx_msg_rx, rx_state))?;

    let ws_state = AuxNetwork::new(
        ws_msg_rx,
        client,
        ssrc,
        heartbeat_interval,
        generation,
        info.guild_id,
        interconnect.clone(),
        ssrc_table,
        udp_rx_msg_tx.clone(),
    );

    spawn(ws_task::runner(ws_state));

    let session = Arc::new(MediaSession::new(
        ws_msg_tx,
        udp_tx_msg_tx,
        udp_rx_msg_tx,
        mixer,
        key,
    ));
    session.ensure_mixer();

    Ok(session)
}

/// Handles onto every task serving one negotiated media path.
///
/// Teardown happens at most once, however many callers race to end the session.
pub(crate) struct MediaSession {
    ws: Sender<WsMessage>,
    udp_tx: Sender<UdpTxMessage>,
    udp_rx: Sender<UdpRxMessage>,
    mixer: Mixer,
    key: Arc<SecretKey>,
    closed: AtomicBool,
}

impl MediaSession {
    pub(crate) fn new(
        ws: Sender<WsMessage>,
        udp_tx: Sender<UdpTxMessage>,
        udp_rx: Sender<UdpRxMessage>,
        mixer: Mixer,
        key: Arc<SecretKey>,
    ) -> Self {
        Self {
            ws,
            udp_tx,
            udp_rx,
            mixer,
            key,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_mute(&self, muted: bool) {
        // The send thread may already have exited: this is fine.
        let _ = self.udp_tx.send(UdpTxMessage::SetMute(muted));
    }

    /// Starts the combined mixer if the current sink wants combined audio.
    pub(crate) fn ensure_mixer(&self) {
        if !self.is_closed() {
            self.mixer.ensure();
        }
    }

    /// Tears down the session.
    ///
    /// Stops the heartbeat, closes both UDP pipelines, stops the mixer, closes
    /// the control channel, and clears the secret key, in that order. Returns
    /// `true` only for the call which performed the teardown.
    pub(crate) fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        // Every recipient may already have exited: this is fine.
        let _ = self.ws.send(WsMessage::StopHeartbeat);
        let _ = self.udp_tx.send(UdpTxMessage::Poison);
        let _ = self.udp_rx.send(UdpRxMessage::Poison);
        self.mixer.shutdown();
        let _ = self.ws.send(WsMessage::Close);

        self.key.clear();

        debug!("Media session torn down.");
        true
    }
}

fn generate_url(endpoint: &mut String) -> Result<Url> {
    if endpoint.ends_with(":80") {
        let len = endpoint.len();

        endpoint.truncate(len - 3);
    }

    Url::parse(&format!("wss://{endpoint}/?v={VOICE_GATEWAY_VERSION}")).or(Err(Error::EndpointUrl))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        driver::crypto::KEY_SIZE,
        driver::tasks::message::{UdpRxMessage, UdpTxMessage, WsMessage},
    };
    use std::time::Duration;

    fn session() -> (
        Arc<MediaSession>,
        flume::Receiver<WsMessage>,
        flume::Receiver<UdpTxMessage>,
        flume::Receiver<UdpRxMessage>,
    ) {
        let (ws_tx, ws_rx) = flume::unbounded();
        let (tx_tx, tx_rx) = flume::unbounded();
        let (rx_tx, rx_rx) = flume::unbounded();

        let mixer = Mixer::new(
            Arc::new(SpeakerQueues::new(4)),
            SinkSlot::default(),
            Duration::from_millis(100),
        );

        let key = Arc::new(SecretKey::new([1u8; KEY_SIZE]));
        let session = MediaSession::new(ws_tx, tx_tx, rx_tx, mixer, key);

        (Arc::new(session), ws_rx, tx_rx, rx_rx)
    }

    #[test]
    fn url_strips_port_80() {
        let mut endpoint = "voice.example.com:80".to_string();
        let url = generate_url(&mut endpoint).unwrap();

        assert_eq!(endpoint, "voice.example.com");
        assert_eq!(url.as_str(), "wss://voice.example.com/?v=4");

        let mut endpoint = "voice.example.com:443".to_string();
        let url = generate_url(&mut endpoint).unwrap();
        assert_eq!(url.port(), Some(443));
    }

    #[test]
    fn shutdown_happens_once() {
        let (session, ws_rx, tx_rx, rx_rx) = session();

        assert!(session.shutdown());
        assert!(!session.shutdown());
        assert!(session.is_closed());
        assert!(session.key.is_cleared());

        let ws_msgs: Vec<_> = ws_rx.drain().collect();
        assert_eq!(ws_msgs.len(), 2);
        assert!(matches!(ws_msgs[0], WsMessage::StopHeartbeat));
        assert!(matches!(ws_msgs[1], WsMessage::Close));

        assert_eq!(tx_rx.drain().count(), 1);
        assert_eq!(rx_rx.drain().count(), 1);
    }

    #[test]
    fn concurrent_shutdown_tears_down_once() {
        let (session, ws_rx, tx_rx, rx_rx) = session();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = session.clone();
                std::thread::spawn(move || session.shutdown())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(ws_rx.drain().count(), 2);
        assert_eq!(tx_rx.drain().count(), 1);
        assert_eq!(rx_rx.drain().count(), 1);
    }

    #[test]
    fn mute_is_forwarded_to_send_thread() {
        let (session, _ws_rx, tx_rx, _rx_rx) = session();

        session.set_mute(true);
        assert!(matches!(tx_rx.try_recv(), Ok(UdpTxMessage::SetMute(true))));
    }
}
