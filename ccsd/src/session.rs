//! Session state and abort coordination
//!
//! Each accepted connection owns one session. The abort flag is the only
//! session field another thread may touch: the handler of an ABORT/STOP
//! command looks the session up in the table and raises its flag. Long
//! running implementations poll the flag at their checkpoints.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ccslib::{tags, CcsError, CcsResult, SessionId};
use log::{info, warn};

use crate::config::ServerConfig;
use crate::hardware::HardwareHandle;

/// Per-session state owned by one connection handler
pub struct SessionHandle {
    pub id: SessionId,
    abort: Arc<AtomicBool>,
    pub default_ack_ms: u64,
    pub min_ack_ms: u64,
}

impl SessionHandle {
    pub fn new(id: u64, config: &ServerConfig) -> Self {
        Self {
            id: SessionId(id),
            abort: Arc::new(AtomicBool::new(false)),
            default_ack_ms: config.default_ack_ms,
            min_ack_ms: config.min_ack_ms,
        }
    }

    /// Checkpoint poll: has an abort been requested for this session?
    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }
}

struct SessionEntry {
    abort: Arc<AtomicBool>,
    command_id: u64,
    type_tag: String,
}

/// Snapshot of one in-flight command, reported by STATUS
#[derive(Debug, Clone)]
pub struct ActiveCommand {
    pub session: SessionId,
    pub command_id: u64,
    pub type_tag: String,
}

/// Routing table from session to abort flag.
///
/// All access goes through the table mutex; no shared session state is
/// reachable without it.
pub struct SessionTable {
    inner: Mutex<HashMap<u64, SessionEntry>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> CcsResult<std::sync::MutexGuard<'_, HashMap<u64, SessionEntry>>> {
        self.inner
            .lock()
            .map_err(|_| CcsError::protocol("Session table lock poisoned".to_string()))
    }

    /// Register the session as executing the given command
    pub fn register(
        &self,
        session: &SessionHandle,
        command_id: u64,
        type_tag: &str,
    ) -> CcsResult<()> {
        let mut table = self.lock()?;
        table.insert(
            session.id.0,
            SessionEntry {
                abort: session.abort_flag(),
                command_id,
                type_tag: type_tag.to_string(),
            },
        );
        Ok(())
    }

    /// Remove the session once its Done has been sent
    pub fn deregister(&self, id: SessionId) {
        if let Ok(mut table) = self.lock() {
            table.remove(&id.0);
        } else {
            warn!("session table poisoned while deregistering {}", id);
        }
    }

    /// Raise the abort flag on the session executing `target` (or on every
    /// active session when no target is given).
    ///
    /// With `interrupt_hardware`, additionally routes a phase-matched abort
    /// into the controller so a blocking driver call returns early; the
    /// hardware abort fires only when a flagged session currently owns the
    /// driver token, so a targeted abort never interrupts another session's
    /// in-flight operation. Flagged non-owners wind down at their next
    /// checkpoint. Interrupt class sessions (including the caller's own)
    /// are never flagged. Returns the number of sessions flagged. Never
    /// blocks on in-flight work.
    pub fn trigger_abort(
        &self,
        target: Option<u64>,
        hardware: &HardwareHandle,
        interrupt_hardware: bool,
    ) -> CcsResult<u32> {
        let mut flagged_ids = Vec::new();
        {
            let table = self.lock()?;
            for (session_id, entry) in table.iter() {
                if tags::is_interrupt(&entry.type_tag) {
                    continue;
                }
                let matches = match target {
                    Some(command_id) => entry.command_id == command_id,
                    None => true,
                };
                if matches {
                    entry.abort.store(true, Ordering::SeqCst);
                    info!(
                        "abort flagged for S{} ({} command {})",
                        session_id, entry.type_tag, entry.command_id
                    );
                    flagged_ids.push(*session_id);
                }
            }
        }

        if interrupt_hardware {
            if let Some(owner) = hardware.owner() {
                if flagged_ids.contains(&owner.0) {
                    hardware.abort_current()?;
                }
            }
        }
        Ok(flagged_ids.len() as u32)
    }

    /// Immutable snapshot of every in-flight command
    pub fn snapshot(&self) -> CcsResult<Vec<ActiveCommand>> {
        let table = self.lock()?;
        let mut active: Vec<ActiveCommand> = table
            .iter()
            .map(|(id, entry)| ActiveCommand {
                session: SessionId(*id),
                command_id: entry.command_id,
                type_tag: entry.type_tag.clone(),
            })
            .collect();
        active.sort_by_key(|entry| entry.session.0);
        Ok(active)
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}
