//! Minimal STUN binding client (RFC 5389 subset).
//!
//! One request, one response, one attribute we care about: the reflexive
//! address a NAT shows to the outside world.

use super::transport::TransportError;
use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

const MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// Ask a STUN server how it sees us. Returns the server-reflexive
/// address, the candidate published to ACDS for stage-2 connects.
pub async fn query_reflexive(server: SocketAddr, budget: Duration) -> Result<SocketAddr, TransportError> {
    let bind_addr: SocketAddr = match server {
        SocketAddr::V4(_) => "0.0.0.0:0".parse().unwrap(),
        SocketAddr::V6(_) => "[::]:0".parse().unwrap(),
    };
    let socket = UdpSocket::bind(bind_addr).await?;

    let mut transaction_id = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut transaction_id);
    let request = encode_binding_request(&transaction_id);

    let exchange = async {
        socket.send_to(&request, server).await?;
        let mut buf = [0u8; 576];
        loop {
            let (n, from) = socket.recv_from(&mut buf).await?;
            if from != server {
                continue;
            }
            if let Some(addr) = parse_binding_response(&buf[..n], &transaction_id) {
                return Ok::<_, std::io::Error>(addr);
            }
        }
    };

    match tokio::time::timeout(budget, exchange).await {
        Ok(Ok(addr)) => Ok(addr),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(TransportError::ConnectTimeout {
            addr: server,
            budget_ms: budget.as_millis() as u64,
        }),
    }
}

fn encode_binding_request(transaction_id: &[u8; 12]) -> [u8; 20] {
    let mut msg = [0u8; 20];
    msg[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // length 0: no attributes
    msg[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg[8..20].copy_from_slice(transaction_id);
    msg
}

fn parse_binding_response(msg: &[u8], transaction_id: &[u8; 12]) -> Option<SocketAddr> {
    if msg.len() < 20 {
        return None;
    }
    let msg_type = u16::from_be_bytes([msg[0], msg[1]]);
    let length = u16::from_be_bytes([msg[2], msg[3]]) as usize;
    let cookie = u32::from_be_bytes(msg[4..8].try_into().ok()?);
    if msg_type != BINDING_RESPONSE || cookie != MAGIC_COOKIE || &msg[8..20] != transaction_id {
        return None;
    }
    let mut attrs = msg.get(20..20 + length)?;

    let mut fallback = None;
    while attrs.len() >= 4 {
        let attr_type = u16::from_be_bytes([attrs[0], attrs[1]]);
        let attr_len = u16::from_be_bytes([attrs[2], attrs[3]]) as usize;
        let value = attrs.get(4..4 + attr_len)?;
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(addr) = decode_address(value, true, transaction_id) {
                    return Some(addr);
                }
            }
            ATTR_MAPPED_ADDRESS => {
                fallback = decode_address(value, false, transaction_id);
            }
            _ => {}
        }
        // Attributes are 32-bit aligned.
        let advance = 4 + attr_len.div_ceil(4) * 4;
        attrs = attrs.get(advance..)?;
    }
    fallback
}

fn decode_address(value: &[u8], xored: bool, transaction_id: &[u8; 12]) -> Option<SocketAddr> {
    let family = *value.get(1)?;
    let mut port = u16::from_be_bytes([*value.get(2)?, *value.get(3)?]);
    if xored {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }
    match family {
        0x01 => {
            let mut octets: [u8; 4] = value.get(4..8)?.try_into().ok()?;
            if xored {
                let cookie = MAGIC_COOKIE.to_be_bytes();
                for (o, c) in octets.iter_mut().zip(cookie) {
                    *o ^= c;
                }
            }
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        0x02 => {
            let mut octets: [u8; 16] = value.get(4..20)?.try_into().ok()?;
            if xored {
                let mut mask = [0u8; 16];
                mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                mask[4..].copy_from_slice(transaction_id);
                for (o, m) in octets.iter_mut().zip(mask) {
                    *o ^= m;
                }
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xor_response(transaction_id: &[u8; 12], addr: SocketAddr) -> Vec<u8> {
        let (family, ip_bytes): (u8, Vec<u8>) = match addr.ip() {
            IpAddr::V4(ip) => {
                let cookie = MAGIC_COOKIE.to_be_bytes();
                let mut o = ip.octets();
                for (b, c) in o.iter_mut().zip(cookie) {
                    *b ^= c;
                }
                (0x01, o.to_vec())
            }
            IpAddr::V6(ip) => {
                let mut mask = [0u8; 16];
                mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                mask[4..].copy_from_slice(transaction_id);
                let mut o = ip.octets();
                for (b, m) in o.iter_mut().zip(mask) {
                    *b ^= m;
                }
                (0x02, o.to_vec())
            }
        };
        let xport = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;

        let attr_len = 4 + ip_bytes.len();
        let mut msg = Vec::new();
        msg.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        msg.extend_from_slice(&((4 + attr_len) as u16).to_be_bytes());
        msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(transaction_id);
        msg.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        msg.extend_from_slice(&(attr_len as u16).to_be_bytes());
        msg.push(0);
        msg.push(family);
        msg.extend_from_slice(&xport.to_be_bytes());
        msg.extend_from_slice(&ip_bytes);
        msg
    }

    #[test]
    fn xor_mapped_v4_roundtrip() {
        let tid = [9u8; 12];
        let addr: SocketAddr = "203.0.113.7:54321".parse().unwrap();
        let msg = xor_response(&tid, addr);
        assert_eq!(parse_binding_response(&msg, &tid), Some(addr));
    }

    #[test]
    fn xor_mapped_v6_roundtrip() {
        let tid = [3u8; 12];
        let addr: SocketAddr = "[2001:db8::42]:4000".parse().unwrap();
        let msg = xor_response(&tid, addr);
        assert_eq!(parse_binding_response(&msg, &tid), Some(addr));
    }

    #[test]
    fn wrong_transaction_id_ignored() {
        let tid = [9u8; 12];
        let addr: SocketAddr = "203.0.113.7:54321".parse().unwrap();
        let msg = xor_response(&tid, addr);
        assert_eq!(parse_binding_response(&msg, &[8u8; 12]), None);
    }

    #[tokio::test]
    async fn end_to_end_against_mock_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let public: SocketAddr = "198.51.100.20:40000".parse().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, 20);
            let tid: [u8; 12] = buf[8..20].try_into().unwrap();
            let reply = xor_response(&tid, public);
            server.send_to(&reply, from).await.unwrap();
        });

        let got = query_reflexive(server_addr, Duration::from_secs(2)).await.unwrap();
        assert_eq!(got, public);
    }
}
