pub mod codec;
pub mod consensus;
pub mod crypto;
pub mod discovery;
pub mod media;
pub mod net;
pub mod packet;
pub mod policy;
pub mod types;

pub use codec::{CodecError, MAX_DATACHANNEL_PAYLOAD, MAX_PAYLOAD_SIZE, PACKET_MAGIC};
pub use consensus::{ConsensusAction, ConsensusConfig, ConsensusEngine};
pub use crypto::{CryptoError, Handshake, HandshakeRole, Identity, KeySource, KnownHosts};
pub use discovery::{AcdsHandle, AcdsServer, DiscoveryError};
pub use net::{Connection, ConnectionConfig, SessionError, SessionEvent, Transport};
pub use packet::{Packet, PacketType, PROTOCOL_VERSION};
pub use policy::Policy;
pub use types::*;
