//! CCS Client Library (ccsclient)
//!
//! This library provides the client side of the CCS protocol. It is used by
//! operator tooling and integration tests, and by the server itself when it
//! delegates work to the telescope interface and pipeline peers.

pub mod client;
pub mod connection;

pub use client::*;
pub use connection::*;
