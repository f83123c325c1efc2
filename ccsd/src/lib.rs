//! CCS camera control daemon
//!
//! ccsd accepts typed commands over TCP, drives the single shared CCD
//! controller through setup/exposure/readout, and cooperates with the
//! telescope interface and data-reduction pipeline peers.

pub mod commands;
pub mod config;
pub mod delegate;
pub mod exec;
pub mod frames;
pub mod handler;
pub mod hardware;
pub mod listener;
pub mod registry;
pub mod scheduler;
pub mod session;

pub use config::*;
pub use listener::*;
