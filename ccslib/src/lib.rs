//! CCS Shared Library (ccslib)
//!
//! This library contains definitions shared between the camera control
//! daemon (ccsd) and clients of it, including its peer subsystems (the
//! telescope interface and the data-reduction pipeline).

pub mod error;
pub mod messages;
pub mod recipe;
pub mod types;
pub mod wire;

pub use error::*;
pub use messages::*;
pub use recipe::*;
pub use types::*;
pub use wire::*;
