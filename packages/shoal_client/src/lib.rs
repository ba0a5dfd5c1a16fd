//! Client-side synchronization: the state reconciler that merges
//! fetched, optimistic, and live-event message sources, the typing
//! indicator tracker, and a websocket connection helper.

pub mod connection;
pub mod reconciler;
pub mod typing;

pub use connection::EventStream;
pub use reconciler::{Effect, Reconciler};
pub use typing::TypingTracker;
