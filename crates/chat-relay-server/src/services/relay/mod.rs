//! Multi-party real-time relay
//!
//! Visitors, human agents and admin observers share rooms keyed by
//! conversation id. Messages fan out on two topics (the room and the global
//! admin stream); visitor messages trigger the AI fallback.

mod bus;
mod chat_relay;
mod registry;

pub use bus::{RelayBus, Topic};
pub use chat_relay::{AiReply, ChatRelay, PostReceipt};
pub use registry::{Participant, ParticipantHandle, SessionRegistry};
