//! A TLS-intercepting HTTP proxy.
//!
//! [`http::Server`] accepts plain HTTP and CONNECT tunnels. Tunnels carrying
//! TLS are terminated with leaves minted by a [`ca::Authority`], so every
//! exchange reaches a [`http::Handler`] as a [`http::Session`] whatever the
//! transport. [`rewrite`] provides a handler driven by regex rules.

pub mod ca;
pub mod http;
pub mod rewrite;
