use super::{message::*, udp_rx::SsrcTable};
use crate::{
    id::GuildId,
    model::{
        payload::{Heartbeat, Speaking},
        CloseCode,
        Event as GatewayEvent,
        SpeakingState,
    },
    ws::{ControlChannel, Error as WsError, NORMAL_CLOSURE},
};
use flume::{Receiver, Sender};
use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::{
    select,
    time::{sleep_until, Instant},
};
use tracing::{debug, info, instrument, trace, warn};

/// How the core task should react to a closed control channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseKind {
    /// The session token was rejected: never retry.
    AuthenticationFailed,
    /// The session is gone, and a new one must be requested.
    CannotResume,
    /// We were disconnected from the channel by the server.
    Disconnected,
    /// The server rejected our encryption mode.
    UnsupportedMode,
    /// Anything else: the session may be resumed.
    Transient,
}

/// Maps a close code onto the reconnect policy.
///
/// Unrecognised codes, and closures without any code, are treated as transient.
/// Closes we start ourselves never get here: the control task stops without
/// reporting them.
#[must_use]
pub fn classify_close(code: Option<u16>) -> CloseKind {
    match code.and_then(CloseCode::from_u16) {
        Some(CloseCode::AuthenticationFailed) => CloseKind::AuthenticationFailed,
        Some(CloseCode::SessionInvalid | CloseCode::ServerNotFound | CloseCode::VoiceServerCrash) =>
            CloseKind::CannotResume,
        Some(CloseCode::Disconnected) => CloseKind::Disconnected,
        Some(CloseCode::UnknownEncryptionMode) => CloseKind::UnsupportedMode,
        _ => CloseKind::Transient,
    }
}

pub(crate) struct AuxNetwork {
    rx: Receiver<WsMessage>,
    ws_client: Box<dyn ControlChannel>,
    dont_send: bool,
    heartbeat_enabled: bool,

    ssrc: u32,
    heartbeat_interval: Duration,

    speaking: SpeakingState,
    last_heartbeat_nonce: Option<u64>,

    generation: usize,
    guild_id: GuildId,
    interconnect: Interconnect,

    ssrc_table: Arc<SsrcTable>,
    udp_rx: Sender<UdpRxMessage>,
}

impl AuxNetwork {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        evt_rx: Receiver<WsMessage>,
        ws_client: Box<dyn ControlChannel>,
        ssrc: u32,
        heartbeat_interval: f64,
        generation: usize,
        guild_id: GuildId,
        interconnect: Interconnect,
        ssrc_table: Arc<SsrcTable>,
        udp_rx: Sender<UdpRxMessage>,
    ) -> Self {
        Self {
            rx: evt_rx,
            ws_client,
            dont_send: false,
            heartbeat_enabled: true,

            ssrc,
            heartbeat_interval: interval_from_ms(heartbeat_interval),

            speaking: SpeakingState::empty(),
            last_heartbeat_nonce: None,

            generation,
            guild_id,
            interconnect,

            ssrc_table,
            udp_rx,
        }
    }

    #[instrument(skip(self))]
    async fn run(&mut self) {
        let mut next_heartbeat = self.next_heartbeat();

        loop {
            let mut ws_error = None;

            select! {
                () = sleep_until(next_heartbeat), if self.heartbeat_enabled => {
                    ws_error = self.send_heartbeat().await.err();
                    next_heartbeat = self.next_heartbeat();
                }
                ws_msg = self.ws_client.recv_json_no_timeout(), if !self.dont_send => {
                    match ws_msg {
                        Err(e) => ws_error = Some(e),
                        Ok(Some(msg)) => self.process_ws(msg),
                        Ok(None) => {},
                    }
                }
                inner_msg = self.rx.recv_async() => {
                    match inner_msg {
                        Ok(WsMessage::Ws(data)) => {
                            self.ws_client = data;
                            next_heartbeat = self.next_heartbeat();
                            self.dont_send = false;
                            self.heartbeat_enabled = true;
                            self.last_heartbeat_nonce = None;

                            // The new channel does not know our speaking state.
                            if self.speaking.is_speaking() {
                                ws_error = self.send_speaking().await.err();
                            }
                        },
                        Ok(WsMessage::SetKeepalive(keepalive)) => {
                            self.heartbeat_interval = interval_from_ms(keepalive);
                            next_heartbeat = self.next_heartbeat();
                        },
                        Ok(WsMessage::Speaking(is_speaking)) => {
                            if self.speaking.contains(SpeakingState::MICROPHONE) != is_speaking {
                                self.speaking = SpeakingState::from(is_speaking);
                                info!("Changing to {:?}", self.speaking);

                                if !self.dont_send {
                                    ws_error = self.send_speaking().await.err();
                                }
                            }
                        },
                        Ok(WsMessage::StopHeartbeat) => {
                            self.heartbeat_enabled = false;
                        },
                        Ok(WsMessage::Close) => {
                            if !self.dont_send {
                                if let Err(e) = self.ws_client.close(NORMAL_CLOSURE).await {
                                    debug!("Error while closing control channel: {}", e);
                                }
                            }
                            break;
                        },
                        Err(flume::RecvError::Disconnected) => {
                            break;
                        },
                    }
                }
            }

            if let Some(e) = ws_error {
                let kind = classify_close(e.close_code());
                warn!("Control channel failed ({}), treating as {:?}.", e, kind);

                self.dont_send = true;

                if self
                    .interconnect
                    .core
                    .send(CoreMessage::WsClosed(self.generation, kind))
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    fn next_heartbeat(&self) -> Instant {
        Instant::now() + self.heartbeat_interval
    }

    async fn send_heartbeat(&mut self) -> Result<(), WsError> {
        if self.dont_send {
            return Ok(());
        }

        let nonce = unix_millis();
        self.last_heartbeat_nonce = Some(nonce);

        trace!("Sent heartbeat {:?}", self.speaking);

        self.ws_client
            .send_json(&GatewayEvent::from(Heartbeat { nonce }))
            .await
    }

    async fn send_speaking(&mut self) -> Result<(), WsError> {
        self.ws_client
            .send_json(&GatewayEvent::from(Speaking {
                delay: Some(0),
                speaking: self.speaking,
                ssrc: self.ssrc,
                user_id: None,
            }))
            .await
    }

    fn process_ws(&mut self, value: GatewayEvent) {
        match value {
            GatewayEvent::Speaking(ev) => {
                let Some(user_id) = ev.user_id else {
                    trace!("Speaking update without a user: {:?}", ev);
                    return;
                };

                let displaced = self.ssrc_table.bind(user_id, ev.ssrc);

                if let Some(sink) = self.interconnect.sink() {
                    sink.on_speaking_update(user_id, ev.ssrc, ev.speaking.is_speaking());
                }

                for (ssrc, user) in displaced {
                    drop(self.udp_rx.send(UdpRxMessage::RemoveSsrc(ssrc, user)));
                }
            },
            GatewayEvent::ClientDisconnect(ev) => {
                debug!("User {} left the call.", ev.user_id);

                if let Some(ssrc) = self.ssrc_table.unbind_user(ev.user_id) {
                    drop(self.udp_rx.send(UdpRxMessage::RemoveSsrc(ssrc, ev.user_id)));
                }
                drop(self.udp_rx.send(UdpRxMessage::RemoveUser(ev.user_id)));
            },
            GatewayEvent::HeartbeatAck(ev) => match self.last_heartbeat_nonce {
                Some(nonce) if nonce == ev.nonce => {
                    self.last_heartbeat_nonce = None;

                    let latency = Duration::from_millis(unix_millis().saturating_sub(nonce));
                    trace!("Heartbeat ACK received after {:?}.", latency);
                    self.interconnect
                        .status
                        .bridge()
                        .on_ping(self.guild_id, latency);
                },
                Some(nonce) => {
                    warn!(
                        "Heartbeat nonce mismatch! Expected {}, saw {}.",
                        nonce, ev.nonce
                    );
                },
                None => trace!("Unsolicited heartbeat ACK: {:?}", ev),
            },
            other => {
                trace!("Received other websocket data: {:?}", other);
            },
        }
    }
}

#[instrument(skip(aux))]
pub(crate) async fn runner(mut aux: AuxNetwork) {
    trace!("WS thread started.");
    aux.run().await;
    trace!("WS thread finished.");
}

fn interval_from_ms(ms: f64) -> Duration {
    Duration::from_secs_f64(ms.max(1.0) / 1000.0)
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        driver::{
            status::StatusTracker,
            test_impls::{mock_channel, ClientFrame, RecordingBridge, RecordingSink, ServerFrame},
        },
        id::UserId,
        model::payload::{ClientDisconnect, HeartbeatAck},
    };
    use std::time::Duration;
    use tokio::time::timeout;

    struct Harness {
        ws_tx: Sender<WsMessage>,
        core_rx: Receiver<CoreMessage>,
        udp_rx_rx: Receiver<UdpRxMessage>,
        server_tx: Sender<ServerFrame>,
        client_rx: Receiver<ClientFrame>,
        table: Arc<SsrcTable>,
        bridge: Arc<RecordingBridge>,
        sink: Arc<RecordingSink>,
    }

    fn start(heartbeat_ms: f64) -> Harness {
        let (ws_tx, ws_rx) = flume::unbounded();
        let (core_tx, core_rx) = flume::unbounded();
        let (udp_rx_tx, udp_rx_rx) = flume::unbounded();
        let (channel, server_tx, client_rx) = mock_channel();

        let bridge = Arc::new(RecordingBridge::default());
        let interconnect = Interconnect::new(core_tx, StatusTracker::new(bridge.clone()));
        let sink = Arc::new(RecordingSink::default());
        *interconnect.sink.write() = Some(sink.clone());

        let table = Arc::new(SsrcTable::default());

        let aux = AuxNetwork::new(
            ws_rx,
            Box::new(channel),
            42,
            heartbeat_ms,
            3,
            GuildId(1),
            interconnect,
            table.clone(),
            udp_rx_tx,
        );
        tokio::spawn(runner(aux));

        Harness {
            ws_tx,
            core_rx,
            udp_rx_rx,
            server_tx,
            client_rx,
            table,
            bridge,
            sink,
        }
    }

    async fn next_event(rx: &Receiver<ClientFrame>) -> ClientFrame {
        timeout(Duration::from_secs(2), rx.recv_async())
            .await
            .expect("client sent nothing")
            .expect("client hung up")
    }

    #[test]
    fn close_codes_follow_reconnect_policy() {
        assert_eq!(classify_close(Some(4004)), CloseKind::AuthenticationFailed);
        assert_eq!(classify_close(Some(4006)), CloseKind::CannotResume);
        assert_eq!(classify_close(Some(4011)), CloseKind::CannotResume);
        assert_eq!(classify_close(Some(4015)), CloseKind::CannotResume);
        assert_eq!(classify_close(Some(4014)), CloseKind::Disconnected);
        assert_eq!(classify_close(Some(4016)), CloseKind::UnsupportedMode);

        assert_eq!(classify_close(Some(1006)), CloseKind::Transient);
        assert_eq!(classify_close(Some(4999)), CloseKind::Transient);
        assert_eq!(classify_close(None), CloseKind::Transient);
        assert_eq!(classify_close(Some(1000)), CloseKind::Transient);
    }

    #[tokio::test]
    async fn speaking_updates_bind_ssrcs_and_displace_old_ones() {
        let h = start(60_000.0);

        let speaking = |ssrc| {
            ServerFrame::Event(GatewayEvent::from(Speaking {
                speaking: SpeakingState::MICROPHONE,
                ssrc,
                user_id: Some(UserId(7)),
                delay: None,
            }))
        };

        h.server_tx.send(speaking(100)).unwrap();
        h.server_tx.send(speaking(200)).unwrap();

        let removed = timeout(Duration::from_secs(2), h.udp_rx_rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(removed, UdpRxMessage::RemoveSsrc(100, UserId(7))));
        assert_eq!(h.table.user(200), Some(UserId(7)));
        assert_eq!(h.table.user(100), None);
        assert_eq!(h.sink.speaking_updates().len(), 2);

        h.server_tx
            .send(ServerFrame::Event(GatewayEvent::from(ClientDisconnect {
                user_id: UserId(7),
            })))
            .unwrap();

        let removed = timeout(Duration::from_secs(2), h.udp_rx_rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(removed, UdpRxMessage::RemoveSsrc(200, UserId(7))));
        assert_eq!(h.table.user(200), None);

        let removed = timeout(Duration::from_secs(2), h.udp_rx_rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(removed, UdpRxMessage::RemoveUser(UserId(7))));
    }

    #[tokio::test]
    async fn outgoing_speaking_is_deduplicated() {
        let h = start(60_000.0);

        h.ws_tx.send(WsMessage::Speaking(true)).unwrap();
        h.ws_tx.send(WsMessage::Speaking(true)).unwrap();
        h.ws_tx.send(WsMessage::Speaking(false)).unwrap();

        match next_event(&h.client_rx).await {
            ClientFrame::Event(GatewayEvent::Speaking(s)) => {
                assert_eq!(s.speaking, SpeakingState::MICROPHONE);
                assert_eq!(s.ssrc, 42);
                assert_eq!(s.delay, Some(0));
            },
            other => panic!("expected speaking, got {other:?}"),
        }

        match next_event(&h.client_rx).await {
            ClientFrame::Event(GatewayEvent::Speaking(s)) => {
                assert!(!s.speaking.is_speaking());
            },
            other => panic!("expected speaking, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn heartbeat_acks_report_latency() {
        let h = start(20.0);

        let nonce = match next_event(&h.client_rx).await {
            ClientFrame::Event(GatewayEvent::Heartbeat(hb)) => hb.nonce,
            other => panic!("expected heartbeat, got {other:?}"),
        };

        h.server_tx
            .send(ServerFrame::Event(GatewayEvent::from(HeartbeatAck { nonce })))
            .unwrap();

        timeout(Duration::from_secs(2), async {
            while h.bridge.pings().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn mismatched_ack_does_not_discard_pending_heartbeat() {
        let h = start(100.0);

        let mut nonce = match next_event(&h.client_rx).await {
            ClientFrame::Event(GatewayEvent::Heartbeat(hb)) => hb.nonce,
            other => panic!("expected heartbeat, got {other:?}"),
        };
        h.ws_tx.send(WsMessage::SetKeepalive(60_000.0)).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        // Only the newest heartbeat can be acknowledged.
        while let Ok(frame) = h.client_rx.try_recv() {
            if let ClientFrame::Event(GatewayEvent::Heartbeat(hb)) = frame {
                nonce = hb.nonce;
            }
        }

        for ack in [nonce.wrapping_add(1), nonce] {
            h.server_tx
                .send(ServerFrame::Event(GatewayEvent::from(HeartbeatAck { nonce: ack })))
                .unwrap();
        }

        timeout(Duration::from_secs(2), async {
            while h.bridge.pings().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.bridge.pings().len(), 1);
    }

    #[tokio::test]
    async fn remote_close_is_reported_with_generation() {
        let h = start(60_000.0);

        h.server_tx.send(ServerFrame::Close(4004)).unwrap();

        let msg = timeout(Duration::from_secs(2), h.core_rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            msg,
            CoreMessage::WsClosed(3, CloseKind::AuthenticationFailed)
        ));
    }

    #[tokio::test]
    async fn close_sends_normal_closure() {
        let h = start(60_000.0);

        h.ws_tx.send(WsMessage::StopHeartbeat).unwrap();
        h.ws_tx.send(WsMessage::Close).unwrap();

        assert!(matches!(
            next_event(&h.client_rx).await,
            ClientFrame::Close(NORMAL_CLOSURE)
        ));

        // Our own close ends the task quietly, and is never classified.
        assert!(matches!(
            timeout(Duration::from_secs(2), h.core_rx.recv_async()).await,
            Ok(Err(flume::RecvError::Disconnected))
        ));
    }
}
