//! Tether Signal Server
//!
//! Stateful relay that lets devices find each other by device key and
//! exchange WebRTC negotiation material over WebSocket.
//!
//! # Protocol
//!
//! 1. Each device registers the key it speaks for
//! 2. An initiator sends an offer (or connection request) to a target key
//! 3. The responder's answer is relayed back to the initiator
//! 4. ICE candidates sent before the answer are held and flushed after it
//! 5. When either side goes away its peers are told with `peer-disconnected`

pub mod channel;
pub mod messages;
pub mod negotiation;
pub mod reaper;
pub mod registry;
pub mod router;
pub mod server;

pub use channel::{Channel, ChannelId, Outbound};
pub use messages::{ClientMessage, ServerMessage};
pub use negotiation::{NegotiationTable, PairKey};
pub use reaper::Reaper;
pub use registry::DeviceRegistry;
pub use router::{Connection, SignalRouter};
pub use server::SignalServer;
