//! Shared protocol for the shoal messaging core.
//!
//! The server and client both depend on this crate for the message data
//! model, the event vocabulary carried over the websocket, and the merge
//! rules for read receipts and reactions.

pub mod events;
pub mod model;

pub use events::{ClientEvent, MembershipOp, ReactionOp, ServerEvent, decode_client_event};
pub use model::{Attachment, ConversationPreview, Message, Reaction};
