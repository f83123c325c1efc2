//! Hardware handle for the CCD controller
//!
//! The controller is a single-owner resource: every driver call goes
//! through a mutex-held token, so only one command implementation can be
//! mid-call at any instant. Abort is split out onto a separate handle that
//! is safe to use concurrently with a blocking driver call; the blocking
//! call observes the abort at its next internal tick and returns early.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use ccslib::{AmpSelect, Binning, CcdPhase, CcsError, CcsResult, SessionId};
use log::{debug, info};

use crate::config::constants::{
    SIM_FRAME_HEIGHT, SIM_FRAME_WIDTH, SIM_PHASE_TICK, SIM_READOUT_MS,
};

/// One raw frame as read off the controller
#[derive(Debug, Clone)]
pub struct FrameData {
    pub width: u32,
    pub height: u32,
    pub bin: Binning,
    pub amp: AmpSelect,
    pub exposure_ms: u64,
    pub pixels: Vec<u8>,
}

/// Blocking driver operations. Exactly one caller may be inside any of
/// these at a time; ownership is enforced by [`HardwareHandle`].
pub trait CcdDriver: Send {
    /// Configure binning and amplifier selection
    fn setup(&mut self, bin: Binning, amp: AmpSelect) -> CcsResult<()>;

    /// Integrate for the given time. Blocks for the full exposure unless
    /// aborted.
    fn expose(&mut self, exposure_ms: u64) -> CcsResult<()>;

    /// Clock the charge off the chip
    fn readout(&mut self) -> CcsResult<FrameData>;
}

/// Phase query and phase-specific abort primitives. Non-blocking and safe
/// to call from another thread while a driver call is in flight.
pub trait CcdAbort: Send + Sync {
    fn phase(&self) -> CcdPhase;
    fn abort_setup(&self) -> CcsResult<()>;
    fn abort_expose(&self) -> CcsResult<()>;
    fn abort_readout(&self) -> CcsResult<()>;
}

/// Session ids start at 1, so zero marks an unowned driver
const NO_OWNER: u64 = 0;

/// Single-owner wrapper around the CCD driver
pub struct HardwareHandle {
    driver: Mutex<Box<dyn CcdDriver>>,
    abort: Arc<dyn CcdAbort>,
    owner: AtomicU64,
}

/// The single-owner token. Records the owning session while held, so an
/// abort trigger can tell whose operation the active hardware phase
/// belongs to.
pub struct DriverGuard<'a> {
    guard: MutexGuard<'a, Box<dyn CcdDriver>>,
    owner: &'a AtomicU64,
}

impl Deref for DriverGuard<'_> {
    type Target = Box<dyn CcdDriver>;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for DriverGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl Drop for DriverGuard<'_> {
    fn drop(&mut self) {
        self.owner.store(NO_OWNER, Ordering::SeqCst);
    }
}

impl HardwareHandle {
    pub fn new(driver: Box<dyn CcdDriver>, abort: Arc<dyn CcdAbort>) -> Self {
        Self {
            driver: Mutex::new(driver),
            abort,
            owner: AtomicU64::new(NO_OWNER),
        }
    }

    /// Acquire the single-owner token for `session`. Blocks until the
    /// current owner finishes its driver call.
    pub fn driver(&self, session: SessionId) -> CcsResult<DriverGuard<'_>> {
        let guard = self
            .driver
            .lock()
            .map_err(|_| CcsError::hardware("Driver lock poisoned"))?;
        self.owner.store(session.0, Ordering::SeqCst);
        Ok(DriverGuard {
            guard,
            owner: &self.owner,
        })
    }

    /// Session holding the single-owner token right now, if any
    pub fn owner(&self) -> Option<SessionId> {
        match self.owner.load(Ordering::SeqCst) {
            NO_OWNER => None,
            id => Some(SessionId(id)),
        }
    }

    /// Phase the controller reports right now
    pub fn phase(&self) -> CcdPhase {
        self.abort.phase()
    }

    /// Route an abort to whichever phase is active at this instant.
    ///
    /// The phase is queried at abort time, not assumed by the caller.
    /// Returns the phase that was aborted; Idle means there was nothing
    /// to interrupt.
    pub fn abort_current(&self) -> CcsResult<CcdPhase> {
        let phase = self.abort.phase();
        match phase {
            CcdPhase::Idle => {}
            CcdPhase::Setup => self.abort.abort_setup()?,
            CcdPhase::Expose => self.abort.abort_expose()?,
            CcdPhase::Readout => self.abort.abort_readout()?,
        }
        if phase != CcdPhase::Idle {
            info!("hardware abort routed to {} phase", phase.name());
        }
        Ok(phase)
    }
}

/// Shared state between the simulated controller and its abort handle
pub struct SimState {
    phase: AtomicU8,
    abort_requested: AtomicBool,
}

impl SimState {
    fn new() -> Self {
        Self {
            phase: AtomicU8::new(CcdPhase::Idle as u8),
            abort_requested: AtomicBool::new(false),
        }
    }

    fn set_phase(&self, phase: CcdPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    fn take_abort(&self) -> bool {
        self.abort_requested.swap(false, Ordering::SeqCst)
    }

    fn request_abort_if(&self, phase: CcdPhase) {
        // Only honor an abort primitive matching the active phase; a stale
        // abort must not cancel the next operation.
        if CcdPhase::from_u8(self.phase.load(Ordering::SeqCst)) == phase {
            self.abort_requested.store(true, Ordering::SeqCst);
        }
    }
}

impl CcdAbort for SimState {
    fn phase(&self) -> CcdPhase {
        CcdPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn abort_setup(&self) -> CcsResult<()> {
        self.request_abort_if(CcdPhase::Setup);
        Ok(())
    }

    fn abort_expose(&self) -> CcsResult<()> {
        self.request_abort_if(CcdPhase::Expose);
        Ok(())
    }

    fn abort_readout(&self) -> CcsResult<()> {
        self.request_abort_if(CcdPhase::Readout);
        Ok(())
    }
}

/// Simulated CCD controller.
///
/// Stands in for the native driver wherever real hardware is absent. Each
/// blocking operation sleeps in small ticks and observes the abort handle
/// between ticks, mirroring the phase-granularity abort contract of the
/// real controller.
pub struct SimCcd {
    state: Arc<SimState>,
    bin: Binning,
    amp: AmpSelect,
    last_exposure_ms: u64,
    setup_ms: u64,
    readout_ms: u64,
}

impl SimCcd {
    pub fn new() -> (Self, Arc<SimState>) {
        Self::with_timing(50, SIM_READOUT_MS)
    }

    /// Create a simulator with explicit setup/readout durations (tests use
    /// short ones)
    pub fn with_timing(setup_ms: u64, readout_ms: u64) -> (Self, Arc<SimState>) {
        let state = Arc::new(SimState::new());
        let sim = Self {
            state: state.clone(),
            bin: Binning::default(),
            amp: AmpSelect::default(),
            last_exposure_ms: 0,
            setup_ms,
            readout_ms,
        };
        (sim, state)
    }

    /// Run one blocking phase, observing the abort handle each tick
    fn run_phase(&self, phase: CcdPhase, duration: Duration) -> CcsResult<()> {
        // Clear any abort left over from a previous phase boundary before
        // publishing the new phase; aborts gate on the published phase, so
        // none can be lost by this ordering.
        self.state.take_abort();
        self.state.set_phase(phase);

        let start = Instant::now();
        while start.elapsed() < duration {
            if self.state.take_abort() {
                self.state.set_phase(CcdPhase::Idle);
                debug!("simulated {} aborted", phase.name());
                return Err(CcsError::Aborted);
            }
            let remaining = duration.saturating_sub(start.elapsed());
            thread::sleep(remaining.min(SIM_PHASE_TICK));
        }

        let aborted = self.state.take_abort();
        self.state.set_phase(CcdPhase::Idle);
        if aborted {
            return Err(CcsError::Aborted);
        }
        Ok(())
    }
}

impl CcdDriver for SimCcd {
    fn setup(&mut self, bin: Binning, amp: AmpSelect) -> CcsResult<()> {
        self.run_phase(CcdPhase::Setup, Duration::from_millis(self.setup_ms))?;
        self.bin = bin;
        self.amp = amp;
        Ok(())
    }

    fn expose(&mut self, exposure_ms: u64) -> CcsResult<()> {
        self.run_phase(CcdPhase::Expose, Duration::from_millis(exposure_ms))?;
        self.last_exposure_ms = exposure_ms;
        Ok(())
    }

    fn readout(&mut self) -> CcsResult<FrameData> {
        self.run_phase(CcdPhase::Readout, Duration::from_millis(self.readout_ms))?;

        let width = SIM_FRAME_WIDTH / u32::from(self.bin.0);
        let height = SIM_FRAME_HEIGHT / u32::from(self.bin.0);
        Ok(FrameData {
            width,
            height,
            bin: self.bin,
            amp: self.amp,
            exposure_ms: self.last_exposure_ms,
            pixels: vec![0u8; (width * height) as usize],
        })
    }
}
