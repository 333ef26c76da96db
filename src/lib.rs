#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
//! Warble is an async client driver for real-time voice gateways, written in Rust.
//!
//! A [`Driver`] takes the [`ConnectionInfo`] handed out by a bot's main gateway,
//! and then:
//!  * Runs the voice gateway handshake over a websocket control channel, including
//!  UDP IP discovery and encryption mode negotiation.
//!  * Sends 20ms frames from an [`AudioSupplier`] as encrypted RTP packets, encoding
//!  raw PCM with Opus where needed.
//!  * Decrypts and decodes incoming packets per speaker, delivering them to an
//!  [`AudioSink`] along with an optional combined mix of every speaker.
//!  * Keeps the control channel alive, resuming sessions after transient losses and
//!  reporting every [`ConnectionStatus`] to a [`GatewayBridge`].
//!
//! ## Codec support
//! Opus support is provided by [audiopus] (an FFI wrapper for libopus). If libopus
//! cannot be loaded, connections are still maintained but carry no audio.
//!
//! [audiopus]: https://github.com/lakelezz/audiopus
//! [`AudioSupplier`]: audio::AudioSupplier
//! [`AudioSink`]: audio::AudioSink
//! [`ConnectionStatus`]: driver::ConnectionStatus

#![warn(clippy::pedantic)]
#![allow(
    // Allowed as they are too pedantic
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::too_many_lines,
    clippy::cast_lossless,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    // TODO: would require significant rewriting of all existing docs
    clippy::missing_errors_doc,
)]

pub mod audio;
mod bridge;
pub mod codec;
mod config;
pub mod constants;
pub mod driver;
pub mod error;
pub mod id;
pub(crate) mod info;
pub mod model;
pub mod ws;

pub use discortp as packet;

pub use crate::{
    bridge::GatewayBridge,
    config::Config,
    driver::{ConnectionStatus, Driver},
    info::ConnectionInfo,
};
