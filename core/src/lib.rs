/// SwapChat - realtime negotiation core for a book-swap app
///
/// Request inbox, per-session chat channels with optimistic send and echo
/// reconciliation, and the completion state machine of a negotiation.

pub mod error;
pub mod config;
pub mod negotiation_types;
pub mod timeline;
pub mod chat;
pub mod session;
pub mod inbox;
pub mod backend;
pub mod client;

pub use backend::{Backend, HttpBackend};
pub use client::{NegotiationClient, SessionView};
pub use config::Config;
pub use error::{Result, SwapError};
pub use inbox::{partition, Partitioned, RequestInbox};
pub use session::NegotiationSession;
pub use timeline::{Delivery, Reconciled, Timeline, TimelineEntry};
