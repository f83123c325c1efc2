//! Type definitions shared between the camera server and its clients

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Timestamp type for server time
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Timestamp {
    /// Seconds since UNIX epoch
    pub seconds: u64,
    /// Nanoseconds within the current second
    pub nanoseconds: u32,
}

impl Timestamp {
    /// Create a new timestamp from the current system time
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            seconds: duration.as_secs(),
            nanoseconds: duration.subsec_nanos(),
        }
    }

    /// Milliseconds since UNIX epoch
    pub fn as_millis(&self) -> u64 {
        self.seconds * 1000 + u64::from(self.nanoseconds) / 1_000_000
    }
}

/// Session identifier assigned by the server to each accepted connection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// On-chip binning factor (applied identically to both axes)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Binning(pub u8);

impl Binning {
    /// Largest binning factor the controller supports
    pub const MAX: u8 = 8;

    pub fn new(factor: u8) -> Result<Self, String> {
        if factor == 0 || factor > Self::MAX {
            return Err(format!("Invalid binning factor: {}", factor));
        }
        Ok(Self(factor))
    }
}

impl Default for Binning {
    fn default() -> Self {
        Self(1)
    }
}

/// Readout amplifier selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum AmpSelect {
    /// Primary (science) amplifier
    #[default]
    Primary,
    /// Alternate amplifier
    Alternate,
}

impl AmpSelect {
    pub fn from_alt_flag(use_alt: bool) -> Self {
        if use_alt {
            AmpSelect::Alternate
        } else {
            AmpSelect::Primary
        }
    }
}

/// Phase the CCD controller is currently executing
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum CcdPhase {
    /// Not executing any operation
    Idle = 0,
    /// Configuring binning, amplifier, or DSP parameters
    Setup = 1,
    /// Integrating light (shutter open or dark integration)
    Expose = 2,
    /// Clocking charge off the chip
    Readout = 3,
}

impl CcdPhase {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => CcdPhase::Setup,
            2 => CcdPhase::Expose,
            3 => CcdPhase::Readout,
            _ => CcdPhase::Idle,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CcdPhase::Idle => "idle",
            CcdPhase::Setup => "setup",
            CcdPhase::Expose => "expose",
            CcdPhase::Readout => "readout",
        }
    }
}
