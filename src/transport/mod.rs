//! Listener and dialer surfaces.
//!
//! Thin wrappers over the platform networking stack: they accept or dial TCP
//! connections, optionally run the TLS handshake, and hand the resulting
//! streams to [`Session`](crate::Session)s. Everything protocol-shaped lives
//! in the session/codec layers.

pub use client::Client;
pub use server::Server;

mod client;
mod server;
mod tls;
