use crate::{
    codec::{CodecFactory, OpusCodec},
    constants::DEFAULT_BITRATE,
    driver::Retry,
    ws::{Connector, WsConnector},
};
use derivative::Derivative;
use std::{sync::Arc, time::Duration};

/// Configuration for voice drivers.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
#[non_exhaustive]
pub struct Config {
    /// Connection retry logic for the [`Driver`].
    ///
    /// This controls how many times the [`Driver`] will try to resume a lost
    /// connection, and how long it waits between attempts.
    ///
    /// [`Driver`]: crate::driver::Driver
    pub driver_retry: Retry,
    /// Configures the maximum amount of time to wait for an attempted voice
    /// connection or resume to complete.
    ///
    /// Defaults to 10 seconds. If set to `None`, connections will never time out.
    pub driver_timeout: Option<Duration>,
    /// Number of UDP discovery requests sent before giving up.
    ///
    /// Defaults to 5.
    pub discovery_attempts: usize,
    /// Time to wait for each UDP discovery reply.
    ///
    /// Defaults to 1 second.
    pub discovery_timeout: Duration,
    /// Read timeout of the receive thread's socket.
    ///
    /// This bounds how long the thread takes to notice that its session has
    /// ended. Defaults to 1 second.
    pub receive_timeout: Duration,
    /// Maximum age of a received frame before it is left out of combined audio.
    ///
    /// Defaults to 100ms.
    pub combined_audio_timeout: Duration,
    /// Number of frames buffered for each speaker awaiting the combined mixer.
    ///
    /// Defaults to 25 (500ms).
    pub speaker_queue_capacity: usize,
    /// Opus encoder bitrate, in bits per second.
    ///
    /// Defaults to 128kbps.
    pub bitrate: i32,
    /// Codec used to encode outgoing and decode incoming audio.
    ///
    /// Defaults to Opus.
    #[derivative(Debug = "ignore")]
    pub codec: Arc<dyn CodecFactory>,
    /// Opens control channels to voice gateways.
    ///
    /// Defaults to a TLS websocket.
    #[derivative(Debug = "ignore")]
    pub connector: Arc<dyn Connector>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver_retry: Retry::default(),
            driver_timeout: Some(Duration::from_secs(10)),
            discovery_attempts: 5,
            discovery_timeout: Duration::from_secs(1),
            receive_timeout: Duration::from_secs(1),
            combined_audio_timeout: Duration::from_millis(100),
            speaker_queue_capacity: 25,
            bitrate: DEFAULT_BITRATE,
            codec: Arc::new(OpusCodec),
            connector: Arc::new(WsConnector),
        }
    }
}

impl Config {
    /// Sets this `Config`'s connection retry configuration.
    #[must_use]
    pub fn driver_retry(mut self, driver_retry: Retry) -> Self {
        self.driver_retry = driver_retry;
        self
    }

    /// Sets this `Config`'s timeout for establishing a voice connection.
    #[must_use]
    pub fn driver_timeout(mut self, driver_timeout: Option<Duration>) -> Self {
        self.driver_timeout = driver_timeout;
        self
    }

    /// Sets this `Config`'s number of UDP discovery attempts.
    #[must_use]
    pub fn discovery_attempts(mut self, discovery_attempts: usize) -> Self {
        self.discovery_attempts = discovery_attempts;
        self
    }

    /// Sets this `Config`'s per-attempt UDP discovery timeout.
    #[must_use]
    pub fn discovery_timeout(mut self, discovery_timeout: Duration) -> Self {
        self.discovery_timeout = discovery_timeout;
        self
    }

    /// Sets this `Config`'s receive socket timeout.
    #[must_use]
    pub fn receive_timeout(mut self, receive_timeout: Duration) -> Self {
        self.receive_timeout = receive_timeout;
        self
    }

    /// Sets this `Config`'s staleness limit for combined audio.
    #[must_use]
    pub fn combined_audio_timeout(mut self, combined_audio_timeout: Duration) -> Self {
        self.combined_audio_timeout = combined_audio_timeout;
        self
    }

    /// Sets this `Config`'s per-speaker queue length for combined audio.
    #[must_use]
    pub fn speaker_queue_capacity(mut self, speaker_queue_capacity: usize) -> Self {
        self.speaker_queue_capacity = speaker_queue_capacity;
        self
    }

    /// Sets this `Config`'s Opus bitrate.
    #[must_use]
    pub fn bitrate(mut self, bitrate: i32) -> Self {
        self.bitrate = bitrate;
        self
    }

    /// Sets this `Config`'s audio codec.
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn CodecFactory>) -> Self {
        self.codec = codec;
        self
    }

    /// Sets this `Config`'s control channel connector.
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }
}
