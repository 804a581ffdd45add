//! Authentication module for Parley
//!
//! Connection credentials are validated once, before a WebSocket upgrade, and
//! resolved into a stable [`parley_shared::Identity`].

pub mod jwt;
pub mod resolver;

pub use jwt::{Claims, JwtError, JwtManager};
pub use resolver::{AuthError, IdentityResolver, JwtIdentityResolver};
