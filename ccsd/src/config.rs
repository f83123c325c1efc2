//! Configuration loading for ccsd

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use ccslib::{CcsError, CcsResult};

/// Server configuration, loaded from a JSON file at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the command listener binds to
    pub listen_addr: String,
    /// Telescope interface peer endpoint
    pub telescope_addr: String,
    /// Data-reduction pipeline peer endpoint
    pub pipeline_addr: String,
    /// Default acknowledge time advertised when a command's duration is unknown
    #[serde(default = "defaults::default_ack_ms")]
    pub default_ack_ms: u64,
    /// Floor for any advertised acknowledge time
    #[serde(default = "defaults::min_ack_ms")]
    pub min_ack_ms: u64,
    /// Per-frame readout cost used for recipe duration prediction
    #[serde(default = "defaults::readout_overhead_ms")]
    pub readout_overhead_ms: u64,
    /// Path to the order-preserving calibration recipe list
    pub recipe_path: PathBuf,
    /// Path to the persisted recipe run-history store
    pub schedule_state_path: PathBuf,
    /// Directory where raw frames are spooled for the pipeline
    pub frame_dir: PathBuf,
}

impl ServerConfig {
    pub fn validate(&self) -> CcsResult<()> {
        if self.min_ack_ms == 0 {
            return Err(CcsError::config("min_ack_ms must be nonzero"));
        }
        if self.default_ack_ms < self.min_ack_ms {
            return Err(CcsError::config(
                "default_ack_ms must be at least min_ack_ms",
            ));
        }
        if self.readout_overhead_ms == 0 {
            return Err(CcsError::config("readout_overhead_ms must be nonzero"));
        }
        Ok(())
    }
}

mod defaults {
    pub fn default_ack_ms() -> u64 {
        5_000
    }

    pub fn min_ack_ms() -> u64 {
        1_000
    }

    pub fn readout_overhead_ms() -> u64 {
        20_000
    }
}

/// Load and validate the server configuration from a JSON file
pub fn load_config<P: AsRef<Path>>(path: P) -> CcsResult<ServerConfig> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let config: ServerConfig = serde_json::from_reader(reader)?;
    config.validate()?;
    Ok(config)
}

/// Configuration constants
pub mod constants {
    use std::time::Duration;

    /// Poll tick for a delegated peer call; a local abort is observed
    /// within one tick.
    pub const DELEGATE_POLL_TICK: Duration = Duration::from_millis(100);

    /// Margin added when relaying a peer's Ack deadline to the original caller
    pub const ACK_RELAY_MARGIN_MS: u64 = 500;

    /// Accept-loop tick while checking the shutdown flag
    pub const ACCEPT_POLL_TICK: Duration = Duration::from_millis(100);

    /// Interrupt service thread receive tick
    pub const INTERRUPT_POLL_TICK: Duration = Duration::from_millis(100);

    /// Simulated controller phase tick (abort observation granularity)
    pub const SIM_PHASE_TICK: Duration = Duration::from_millis(20);

    /// Simulated readout duration
    pub const SIM_READOUT_MS: u64 = 200;

    /// Simulated frame dimensions
    pub const SIM_FRAME_WIDTH: u32 = 512;
    pub const SIM_FRAME_HEIGHT: u32 = 512;
}
