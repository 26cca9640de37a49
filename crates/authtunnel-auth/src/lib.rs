//! Bearer tokens for authenticated tunnels
//!
//! Two collaborators of the tunnel orchestrator live here:
//!
//! - [`JwtCache`] stores one raw JWT per proxy key. [`MemoryJwtCache`] keeps
//!   them in process, [`LocalJwtCache`] keeps them in the user cache
//!   directory so a login survives restarts.
//! - [`Authenticator`] mints a fresh JWT. [`AuthClient`] returns a configured
//!   service-account token or runs the browser login against the proxy's
//!   login API.

pub mod cache;
mod callback;
pub mod client;
pub mod error;

pub use cache::{default_cache, CacheError, JwtCache, LocalJwtCache, MemoryJwtCache};
pub use client::{AuthClient, Authenticator, OnOpenBrowser};
pub use error::AuthError;

// Re-export useful types
pub use async_trait::async_trait;
