//! Parley Client Library
//!
//! Client-side state for the Parley gateway: optimistic sends reconciled with
//! live and durable messages, self-expiring typing indicators, and a session
//! that routes server events to the right conversation.

pub mod reconcile;
pub mod session;
pub mod typing;

pub use reconcile::{ConversationView, Entry, EntryStatus, ReconcileError};
pub use session::{ClientSession, Submitted};
pub use typing::TypingIndicators;
