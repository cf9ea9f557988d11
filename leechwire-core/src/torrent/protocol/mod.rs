//! BitTorrent wire protocol abstractions and message types.
//!
//! BEP 3 peer wire protocol: the handshake frame, the length-prefixed
//! message codec and async helpers that read and write whole frames.

pub mod handshake;
pub mod messages;
pub mod types;

// Re-export public API
pub use handshake::{HandshakeCodec, HandshakeError, handshake};
pub use messages::{MessageCodec, read_message, write_message};
pub use types::{PeerHandshake, PeerId, PeerMessage, PeerState};
