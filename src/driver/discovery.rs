//! UDP hole-punching, used to learn this client's external address.
//!
//! Requests and replies are both fixed-size datagrams. A request holds our
//! SSRC as a big-endian `u32` in its first four bytes, followed by zeroes.
//! A reply holds a NUL-padded ASCII IP address after those four bytes, with
//! our external port as a little-endian `u16` in the final two.

use super::connection::error::{Error, Result};
use crate::constants::IP_DISCOVERY_LEN;
use byteorder::{ByteOrder, LittleEndian, NetworkEndian};
use std::{net::IpAddr, str::FromStr, time::Duration};
use tokio::{net::UdpSocket, time::timeout};
use tracing::{debug, instrument, warn};

const ADDRESS_START: usize = 4;
const PORT_START: usize = IP_DISCOVERY_LEN - 2;

/// Builds a discovery request for `ssrc`.
#[must_use]
pub(crate) fn request(ssrc: u32) -> [u8; IP_DISCOVERY_LEN] {
    let mut out = [0u8; IP_DISCOVERY_LEN];
    NetworkEndian::write_u32(&mut out[..ADDRESS_START], ssrc);
    out
}

/// Parses a discovery reply into our external address and port.
pub(crate) fn parse_response(bytes: &[u8]) -> Result<(IpAddr, u16)> {
    if bytes.len() < IP_DISCOVERY_LEN {
        return Err(Error::IllegalDiscoveryResponse);
    }

    let raw_address = &bytes[ADDRESS_START..PORT_START];

    // A spoofed reply may hold no NUL at all, so don't assume a "left edge" of '\0's.
    let nul_byte_index = raw_address
        .iter()
        .position(|&b| b == 0)
        .ok_or(Error::IllegalIp)?;

    let address_str =
        std::str::from_utf8(&raw_address[..nul_byte_index]).map_err(|_| Error::IllegalIp)?;
    let address = IpAddr::from_str(address_str).map_err(|_| Error::IllegalIp)?;

    let port = LittleEndian::read_u16(&bytes[PORT_START..IP_DISCOVERY_LEN]);

    Ok((address, port))
}

/// Runs IP discovery over a socket already connected to the voice server.
///
/// Each attempt waits up to `per_attempt` for a reply. The first valid reply
/// ends the search, and exhausting `attempts` yields [`Error::DiscoveryFailed`].
#[instrument(skip(udp))]
pub(crate) async fn discover(
    udp: &UdpSocket,
    ssrc: u32,
    attempts: usize,
    per_attempt: Duration,
) -> Result<(IpAddr, u16)> {
    let req = request(ssrc);
    let mut buf = [0u8; IP_DISCOVERY_LEN];

    for attempt in 1..=attempts {
        if let Err(e) = udp.send(&req).await {
            warn!("IP discovery attempt {}/{} failed to send: {:?}", attempt, attempts, e);
            continue;
        }

        match timeout(per_attempt, udp.recv(&mut buf)).await {
            Ok(Ok(len)) => match parse_response(&buf[..len]) {
                Ok(out) => {
                    debug!("Discovered external address {}:{}.", out.0, out.1);
                    return Ok(out);
                },
                Err(e) => warn!("IP discovery attempt {}/{}: {}", attempt, attempts, e),
            },
            Ok(Err(e)) => warn!("IP discovery attempt {}/{} failed: {:?}", attempt, attempts, e),
            Err(_) => debug!("IP discovery attempt {}/{} timed out.", attempt, attempts),
        }
    }

    Err(Error::DiscoveryFailed)
}
