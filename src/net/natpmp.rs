//! NAT-PMP port mapping (RFC 6886 subset).
//!
//! Runs once at startup on the serving role: ask the gateway for a TCP
//! mapping so a direct-connect candidate can be published to ACDS.

use super::transport::TransportError;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

const NATPMP_PORT: u16 = 5351;
const VERSION: u8 = 0;
const OP_EXTERNAL_ADDRESS: u8 = 0;
const OP_MAP_TCP: u8 = 2;
const RESULT_SUCCESS: u16 = 0;

/// A mapping the gateway granted us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub external_addr: SocketAddr,
    pub lifetime_secs: u32,
}

/// Request a TCP mapping for `internal_port`. The whole exchange shares
/// one budget; NAT-PMP gateways answer in milliseconds or not at all.
pub async fn request_mapping(
    gateway: Ipv4Addr,
    internal_port: u16,
    lifetime_secs: u32,
    budget: Duration,
) -> Result<PortMapping, TransportError> {
    let gateway_addr = SocketAddr::V4(SocketAddrV4::new(gateway, NATPMP_PORT));
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(gateway_addr).await?;

    let exchange = async {
        // External address first: the mapping reply only carries the port.
        socket.send(&[VERSION, OP_EXTERNAL_ADDRESS]).await?;
        let mut buf = [0u8; 16];
        let n = socket.recv(&mut buf).await?;
        let external_ip = parse_external_address(&buf[..n]).ok_or_else(gateway_error)?;

        let mut request = [0u8; 12];
        request[0] = VERSION;
        request[1] = OP_MAP_TCP;
        request[4..6].copy_from_slice(&internal_port.to_be_bytes());
        request[6..8].copy_from_slice(&internal_port.to_be_bytes());
        request[8..12].copy_from_slice(&lifetime_secs.to_be_bytes());
        socket.send(&request).await?;

        let n = socket.recv(&mut buf).await?;
        let (external_port, lifetime) = parse_mapping_reply(&buf[..n], internal_port).ok_or_else(gateway_error)?;

        debug!(
            "NAT-PMP mapping granted: {}:{} for {}s",
            external_ip, external_port, lifetime
        );
        Ok::<_, std::io::Error>(PortMapping {
            external_addr: SocketAddr::new(IpAddr::V4(external_ip), external_port),
            lifetime_secs: lifetime,
        })
    };

    match tokio::time::timeout(budget, exchange).await {
        Ok(Ok(mapping)) => Ok(mapping),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(TransportError::ConnectTimeout {
            addr: gateway_addr,
            budget_ms: budget.as_millis() as u64,
        }),
    }
}

fn gateway_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, "gateway refused or malformed reply")
}

fn parse_external_address(reply: &[u8]) -> Option<Ipv4Addr> {
    if reply.len() < 12 || reply[0] != VERSION || reply[1] != 128 + OP_EXTERNAL_ADDRESS {
        return None;
    }
    let result = u16::from_be_bytes([reply[2], reply[3]]);
    if result != RESULT_SUCCESS {
        return None;
    }
    let octets: [u8; 4] = reply[8..12].try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

fn parse_mapping_reply(reply: &[u8], internal_port: u16) -> Option<(u16, u32)> {
    if reply.len() < 16 || reply[0] != VERSION || reply[1] != 128 + OP_MAP_TCP {
        return None;
    }
    let result = u16::from_be_bytes([reply[2], reply[3]]);
    if result != RESULT_SUCCESS {
        return None;
    }
    let mapped_internal = u16::from_be_bytes([reply[8], reply[9]]);
    if mapped_internal != internal_port {
        return None;
    }
    let external_port = u16::from_be_bytes([reply[10], reply[11]]);
    let lifetime = u32::from_be_bytes(reply[12..16].try_into().ok()?);
    Some((external_port, lifetime))
}
