//! Relay bind handshake: the last-resort transport stage.
//!
//! Two participants each connect to the relay listener and send a bind
//! header naming the session and themselves; the relay pairs the two
//! streams and splices them. From then on the stream is an ordinary
//! ordered byte pipe carrying ACIP packets.

use crate::types::ParticipantId;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// First bytes on a relay connection, so the listener can reject strays.
pub const RELAY_MAGIC: &[u8; 8] = b"ACIPRELY";

/// Bind header: magic(8) + session_id(16) + participant_id(16).
pub const BIND_HEADER_LEN: usize = 8 + 16 + 16;

/// Ack byte once the relay has paired both ends.
pub const BIND_ACK_PAIRED: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayBind {
    pub session_id: [u8; 16],
    pub participant_id: ParticipantId,
}

impl RelayBind {
    pub fn encode(&self) -> [u8; BIND_HEADER_LEN] {
        let mut buf = [0u8; BIND_HEADER_LEN];
        buf[..8].copy_from_slice(RELAY_MAGIC);
        buf[8..24].copy_from_slice(&self.session_id);
        buf[24..40].copy_from_slice(self.participant_id.as_bytes());
        buf
    }

    pub fn decode(buf: &[u8; BIND_HEADER_LEN]) -> Option<Self> {
        if &buf[..8] != RELAY_MAGIC {
            return None;
        }
        let session_id: [u8; 16] = buf[8..24].try_into().ok()?;
        let pid: [u8; 16] = buf[24..40].try_into().ok()?;
        Some(Self {
            session_id,
            participant_id: ParticipantId(pid),
        })
    }
}

/// Client side: send the bind, wait for the paired ack.
pub async fn bind<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    bind: RelayBind,
) -> std::io::Result<bool> {
    stream.write_all(&bind.encode()).await?;
    stream.flush().await?;
    let mut ack = [0u8; 1];
    stream.read_exact(&mut ack).await?;
    Ok(ack[0] == BIND_ACK_PAIRED)
}

/// Listener side: read and validate a bind header.
pub async fn read_bind<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Option<RelayBind>> {
    let mut buf = [0u8; BIND_HEADER_LEN];
    stream.read_exact(&mut buf).await?;
    Ok(RelayBind::decode(&buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_header_roundtrip() {
        let bind = RelayBind {
            session_id: [7u8; 16],
            participant_id: ParticipantId([9u8; 16]),
        };
        let encoded = bind.encode();
        assert_eq!(RelayBind::decode(&encoded), Some(bind));

        let mut garbage = encoded;
        garbage[0] = b'X';
        assert_eq!(RelayBind::decode(&garbage), None);
    }
}
