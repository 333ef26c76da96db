#![allow(missing_docs)]

pub(crate) mod combine;
pub mod error;
pub mod message;
pub(crate) mod udp_rx;
pub(crate) mod udp_tx;
pub(crate) mod ws;

use self::ws::{classify_close, CloseKind};
use super::{
    connection::{error::Error as ConnectionError, Connection},
    ConnectionStatus,
};
use crate::{id::GuildId, Config, ConnectionInfo};
use flume::{Receiver, Sender};
use message::*;
use std::{collections::VecDeque, future::Future};
use tokio::{select, spawn, time::sleep};
use tracing::{debug, error, info, instrument, trace, warn};

pub(crate) fn start(config: Config, rx: Receiver<CoreMessage>, interconnect: Interconnect) {
    spawn(async move {
        trace!("Driver started.");
        runner(config, rx, interconnect).await;
        trace!("Driver finished.");
    });
}

/// What the bot gateway should be asked to do after a session ends.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum BridgeRequest {
    Reconnect,
    Disconnect,
}

/// Reaction to a closed control channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ClosePolicy {
    Resume,
    Terminal(ConnectionStatus, Option<BridgeRequest>),
}

enum Raced<T> {
    Done(T),
    Interrupted(CoreMessage),
}

/// Drives `fut` to completion unless a message arrives which supersedes it.
///
/// Disconnects, new connection requests, and shutdown interrupt the attempt.
/// Every other message is held back until the attempt is over.
async fn race<T>(
    fut: impl Future<Output = T>,
    rx: &Receiver<CoreMessage>,
    deferred: &mut VecDeque<CoreMessage>,
) -> Raced<T> {
    tokio::pin!(fut);

    loop {
        select! {
            out = &mut fut => return Raced::Done(out),
            msg = rx.recv_async() => match msg {
                Ok(
                    m @ (CoreMessage::Disconnect(_)
                    | CoreMessage::ConnectWithResult(..)
                    | CoreMessage::Poison),
                ) => return Raced::Interrupted(m),
                Ok(m) => deferred.push_back(m),
                Err(_) => return Raced::Interrupted(CoreMessage::Poison),
            },
        }
    }
}

/// The single owner of a driver's connection and status.
struct Core {
    config: Config,
    rx: Receiver<CoreMessage>,
    interconnect: Interconnect,
    connection: Option<Connection>,
    deferred: VecDeque<CoreMessage>,
    generation: usize,
    last_guild: Option<GuildId>,
    muted: bool,
}

impl Core {
    async fn run(&mut self) {
        loop {
            let msg = match self.deferred.pop_front() {
                Some(m) => m,
                None => match self.rx.recv_async().await {
                    Ok(m) => m,
                    Err(_) => break,
                },
            };

            match msg {
                CoreMessage::ConnectWithResult(info, tx) => self.connect(info, tx).await,
                CoreMessage::Disconnect(reason) => self.disconnect(reason),
                CoreMessage::Reconnect(reason) => {
                    if let Some(guild) = self.connection.as_ref().map(|c| c.info.guild_id) {
                        self.interconnect.status.set(guild, reason);
                        self.resume().await;
                    } else {
                        debug!("No session to reconnect.");
                    }
                },
                CoreMessage::Mute(muted) => {
                    self.muted = muted;
                    if let Some(conn) = &self.connection {
                        conn.session.set_mute(muted);
                    }
                },
                CoreMessage::SinkChanged =>
                    if let Some(conn) = &self.connection {
                        conn.session.ensure_mixer();
                    },
                CoreMessage::WsClosed(generation, kind) => {
                    let current = self.connection.as_ref().map(|c| c.generation);

                    if current == Some(generation) {
                        self.on_ws_closed(kind).await;
                    } else {
                        trace!("Ignoring closure of stale control channel {}.", generation);
                    }
                },
                CoreMessage::Poison => break,
            }
        }

        if self.connection.is_some() {
            self.disconnect(ConnectionStatus::NotConnected);
        }
    }

    fn next_generation(&mut self) -> usize {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    #[instrument(skip(self, tx))]
    async fn connect(&mut self, info: ConnectionInfo, tx: Sender<Result<(), ConnectionError>>) {
        // Any existing session is replaced outright.
        self.connection = None;
        self.last_guild = Some(info.guild_id);

        let generation = self.next_generation();
        let attempt = Connection::new(
            info.clone(),
            &self.interconnect,
            &self.config,
            generation,
            self.muted,
        );

        let res = race(attempt, &self.rx, &mut self.deferred).await;

        match res {
            Raced::Done(Ok(conn)) => {
                self.connection = Some(conn);
                // Other side may not be listening: this is fine.
                let _ = tx.send(Ok(()));
            },
            Raced::Done(Err(e)) => {
                error!("Failed to connect: {}", e);

                let (status, request) = match &e {
                    ConnectionError::Ws(ws) if ws.close_code().is_some() =>
                        match self.close_policy(classify_close(ws.close_code()), &info) {
                            // Nothing exists yet to resume.
                            ClosePolicy::Resume => (ConnectionStatus::ErrorLostConnection, None),
                            ClosePolicy::Terminal(status, request) => (status, request),
                        },
                    _ => (e.status(), None),
                };

                self.finish(info.guild_id, status, request);
                let _ = tx.send(Err(e));
            },
            Raced::Interrupted(msg) => {
                debug!("Connection attempt superseded.");
                let _ = tx.send(Err(ConnectionError::AttemptDiscarded));
                self.deferred.push_front(msg);
            },
        }
    }

    fn disconnect(&mut self, reason: ConnectionStatus) {
        let guild = self
            .connection
            .as_ref()
            .map(|c| c.info.guild_id)
            .or(self.last_guild);

        if let Some(guild) = guild {
            self.finish(guild, reason, None);
        }
    }

    /// Tears down any session, then reports the outcome.
    fn finish(&mut self, guild: GuildId, status: ConnectionStatus, request: Option<BridgeRequest>) {
        drop(self.connection.take());

        self.interconnect.status.set(guild, status);

        let bridge = self.interconnect.status.bridge();
        match request {
            Some(BridgeRequest::Reconnect) => bridge.request_reconnect(guild),
            Some(BridgeRequest::Disconnect) => bridge.request_disconnect(guild),
            None => {},
        }
    }

    fn close_policy(&self, kind: CloseKind, info: &ConnectionInfo) -> ClosePolicy {
        use ConnectionStatus::*;

        let bridge = self.interconnect.status.bridge();

        match kind {
            CloseKind::AuthenticationFailed => ClosePolicy::Terminal(
                DisconnectedAuthenticationFailure,
                Some(BridgeRequest::Disconnect),
            ),
            CloseKind::CannotResume =>
                ClosePolicy::Terminal(ErrorCannotResume, Some(BridgeRequest::Reconnect)),
            CloseKind::UnsupportedMode => ClosePolicy::Terminal(
                ErrorUnsupportedEncryptionModes,
                Some(BridgeRequest::Disconnect),
            ),
            CloseKind::Disconnected => {
                let channel_gone = info
                    .channel_id
                    .map_or(false, |c| !bridge.channel_exists(info.guild_id, c));

                if channel_gone {
                    ClosePolicy::Terminal(DisconnectedChannelDeleted, Some(BridgeRequest::Disconnect))
                } else if !bridge.is_guild_member(info.guild_id) {
                    ClosePolicy::Terminal(
                        DisconnectedRemovedFromGuild,
                        Some(BridgeRequest::Disconnect),
                    )
                } else {
                    ClosePolicy::Terminal(NotConnected, None)
                }
            },
            CloseKind::Transient if info.auto_reconnect => ClosePolicy::Resume,
            CloseKind::Transient =>
                ClosePolicy::Terminal(ErrorLostConnection, Some(BridgeRequest::Disconnect)),
        }
    }

    async fn on_ws_closed(&mut self, kind: CloseKind) {
        let Some(info) = self.connection.as_ref().map(|c| c.info.clone()) else {
            return;
        };

        match self.close_policy(kind, &info) {
            ClosePolicy::Resume => {
                info!("Control channel lost ({:?}), resuming.", kind);
                self.resume().await;
            },
            ClosePolicy::Terminal(status, request) => {
                info!("Control channel closed ({:?}), session ended.", kind);
                self.finish(info.guild_id, status, request);
            },
        }
    }

    /// Resumes the current session, backing off between failed attempts.
    ///
    /// Once every resume has failed, one full connection is tried with the
    /// same session details.
    #[instrument(skip(self))]
    async fn resume(&mut self) {
        let Some(mut conn) = self.connection.take() else {
            return;
        };

        let mut last_wait = None;
        let mut attempt_idx = 0;

        loop {
            let res = race(
                conn.reconnect(&self.interconnect, &self.config),
                &self.rx,
                &mut self.deferred,
            )
            .await;

            match res {
                Raced::Done(Ok(())) => {
                    self.connection = Some(conn);
                    return;
                },
                Raced::Done(Err(e)) => {
                    if let ConnectionError::Ws(ws) = &e {
                        let kind = classify_close(ws.close_code());
                        if let ClosePolicy::Terminal(status, request) =
                            self.close_policy(kind, &conn.info)
                        {
                            let guild = conn.info.guild_id;
                            drop(conn);
                            self.finish(guild, status, request);
                            return;
                        }
                    }

                    warn!("Resume attempt {} failed: {}", attempt_idx + 1, e);

                    let Some(wait) = self.config.driver_retry.retry_in(last_wait, attempt_idx) else {
                        break;
                    };

                    attempt_idx += 1;
                    last_wait = Some(wait);

                    if let Raced::Interrupted(msg) =
                        race(sleep(wait), &self.rx, &mut self.deferred).await
                    {
                        drop(conn);
                        self.deferred.push_front(msg);
                        return;
                    }
                },
                Raced::Interrupted(msg) => {
                    drop(conn);
                    self.deferred.push_front(msg);
                    return;
                },
            }
        }

        let info = conn.info.clone();
        drop(conn);

        warn!("Could not resume session, attempting full connection.");

        let generation = self.next_generation();
        let attempt = Connection::new(
            info.clone(),
            &self.interconnect,
            &self.config,
            generation,
            self.muted,
        );

        let res = race(attempt, &self.rx, &mut self.deferred).await;

        match res {
            Raced::Done(Ok(conn)) => self.connection = Some(conn),
            Raced::Done(Err(e)) => {
                error!("Catastrophic connection failure. Stopping. {}", e);
                self.finish(
                    info.guild_id,
                    ConnectionStatus::ErrorCannotResume,
                    Some(BridgeRequest::Reconnect),
                );
            },
            Raced::Interrupted(msg) => self.deferred.push_front(msg),
        }
    }
}

#[instrument(skip(rx, interconnect))]
async fn runner(config: Config, rx: Receiver<CoreMessage>, interconnect: Interconnect) {
    let mut core = Core {
        config,
        rx,
        interconnect,
        connection: None,
        deferred: VecDeque::new(),
        generation: 0,
        last_guild: None,
        muted: false,
    };

    core.run().await;

    trace!("Main thread exited");
}
