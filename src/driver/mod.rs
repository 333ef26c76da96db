//! Runner for a voice connection.
//!
//! Warble's driver is a mixed-sync system, using:
//!  * Asynchronous connection management, control channel upkeep, and gateway integration.
//!  * Synchronous packet generation, encoding, decoding, and mixing of received audio.
//!
//! This splits up work according to its IO/compute bound nature, preventing packet
//! generation from being slowed down past its deadline, or from affecting other
//! asynchronous tasks your bot must handle.

#[cfg(feature = "internals")]
pub mod bench_internals;

pub(crate) mod connection;
mod crypto;
mod discovery;
pub(crate) mod packet;
mod retry;
mod status;
pub(crate) mod tasks;
#[cfg(test)]
pub(crate) mod test_impls;

use connection::error::{Error, Result};
pub use crypto::CryptoMode;
pub use retry::{ExponentialBackoff, Retry, Strategy};
pub use status::ConnectionStatus;

use crate::{
    audio::{AudioSink, AudioSupplier},
    bridge::GatewayBridge,
    Config,
    ConnectionInfo,
};
use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use flume::{r#async::RecvFut, SendError, Sender};
use status::StatusTracker;
use std::sync::Arc;
use tasks::message::{CoreMessage, Interconnect};
use tracing::instrument;

/// The control object for a voice connection, handling connection upkeep,
/// encoding, en/decryption, and mixing of received audio.
///
/// Audio to send is pulled from an [`AudioSupplier`], and received audio is
/// pushed to an [`AudioSink`]. Both may be swapped at any time, whether or not
/// a connection is live.
#[derive(Debug)]
pub struct Driver {
    config: Config,
    self_mute: bool,
    interconnect: Interconnect,
}

impl Driver {
    /// Creates a new voice driver, reporting to the given bot gateway.
    ///
    /// This will create the core voice task in the background, so must be
    /// called from within a Tokio runtime.
    #[inline]
    pub fn new(config: Config, bridge: Arc<dyn GatewayBridge>) -> Self {
        let (tx, rx) = flume::unbounded();
        let interconnect = Interconnect::new(tx, StatusTracker::new(bridge));

        tasks::start(config.clone(), rx, interconnect.clone());

        Driver {
            config,
            self_mute: false,
            interconnect,
        }
    }

    fn restart_inner(&mut self) {
        let (tx, rx) = flume::unbounded();
        self.interconnect.core = tx;

        tasks::start(self.config.clone(), rx, self.interconnect.clone());

        self.mute(self.self_mute);
    }

    /// Connects to a voice channel using the specified server.
    ///
    /// Any existing connection is replaced. This method instantly contacts
    /// the driver task, and does not need to be `await`ed to start the actual
    /// connection.
    #[instrument(skip(self))]
    pub fn connect(&mut self, info: ConnectionInfo) -> Connect {
        let (tx, rx) = flume::bounded(1);

        self.send(CoreMessage::ConnectWithResult(info, tx));

        Connect {
            inner: rx.into_recv_async(),
        }
    }

    /// Leaves the current voice channel, disconnecting from it.
    ///
    /// This does *not* forget settings, like whether to be self-muted, or the
    /// current audio supplier and sink.
    #[instrument(skip(self))]
    pub fn leave(&mut self) {
        self.disconnect(ConnectionStatus::NotConnected);
    }

    /// Tears down the current connection, then reports `reason` as the new status.
    #[instrument(skip(self))]
    pub fn disconnect(&mut self, reason: ConnectionStatus) {
        self.send(CoreMessage::Disconnect(reason));
    }

    /// Reports `reason`, then resumes the current session over a fresh
    /// control channel.
    ///
    /// Does nothing if there is no live connection.
    #[instrument(skip(self))]
    pub fn reconnect(&mut self, reason: ConnectionStatus) {
        self.send(CoreMessage::Reconnect(reason));
    }

    /// Sets whether the current connection is to be muted.
    ///
    /// If there is no live voice connection, then this only acts as a settings
    /// update for future connections.
    #[instrument(skip(self))]
    pub fn mute(&mut self, mute: bool) {
        self.self_mute = mute;
        self.send(CoreMessage::Mute(mute));
    }

    /// Returns whether the driver is muted (i.e., sends only silence).
    #[must_use]
    pub fn is_mute(&self) -> bool {
        self.self_mute
    }

    /// Sets the source of outgoing audio, replacing any existing one.
    pub fn set_supplier<S: AudioSupplier + 'static>(&mut self, supplier: S) {
        *self.interconnect.supplier.lock() = Some(Box::new(supplier));
    }

    /// Stops sending audio by removing the current supplier, if any.
    pub fn stop(&mut self) {
        *self.interconnect.supplier.lock() = None;
    }

    /// Sets the destination of received audio, or removes it with `None`.
    ///
    /// Received packets are only decoded while a sink wants them, and
    /// combined audio is only mixed while a sink asks for it.
    pub fn set_sink(&mut self, sink: Option<Arc<dyn AudioSink>>) {
        *self.interconnect.sink.write() = sink;
        self.send(CoreMessage::SinkChanged);
    }

    /// Returns the most recently reported connection status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.interconnect.status.get()
    }

    /// Returns this driver's configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Sends a message to the inner tasks, restarting it if necessary.
    fn send(&mut self, status: CoreMessage) {
        // Restart thread if it errored.
        if let Err(SendError(status)) = self.interconnect.core.send(status) {
            self.restart_inner();

            // A freshly started task holds its receiver until told to stop.
            let _ = self.interconnect.core.send(status);
        }
    }
}

impl Drop for Driver {
    /// Leaves the current connected voice channel, if connected to one, and
    /// stops the driver's background task.
    fn drop(&mut self) {
        let _ = self.interconnect.core.send(CoreMessage::Poison);
    }
}

/// Future for a call to [`Driver::connect`].
///
/// This future awaits the *result* of a connection; the driver
/// is messaged at the time of the call.
pub struct Connect {
    inner: RecvFut<'static, Result<()>>,
}

impl Future for Connect {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(r) => Poll::Ready(r.map_err(|_| Error::AttemptDiscarded).and_then(|x| x)),
            Poll::Pending => Poll::Pending,
        }
    }
}
