//! WebSocket support for real-time chat
//!
//! Provides the real-time side of the chat service:
//! - Identity-addressed delivery to every live connection (multi-device)
//! - Presence tracking with settle delay, debounced broadcasts and guest eviction
//! - Private and global message fan-out with background durability
//! - Typing indicators
//!
//! # Architecture
//!
//! - **Connection**: An authenticated WebSocket connection and its outbound queues
//! - **Gateway**: Identity-indexed set of live connections
//! - **Presence**: Actor owning the online set and every presence timer
//! - **Messaging**: Deliver-then-persist fan-out protocol
//! - **Durability**: Background worker writing messages to the record store
//! - **Typing**: Typing indicator relay
//! - **Handler**: Axum WebSocket route handler

pub mod connection;
pub mod durability;
pub mod gateway;
pub mod handler;
pub mod messaging;
pub mod presence;
pub mod typing;

pub use gateway::Gateway;
pub use handler::ws_handler;
pub use messaging::MessageRouter;
pub use presence::{PresenceConfig, PresenceHandle};
pub use typing::TypingRelay;
