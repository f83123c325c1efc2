//! Command execution seam
//!
//! A command implementation is a per-invocation, single-use object bound to
//! a [`Context`] carrying the shared capabilities: the connection link, the
//! session (abort flag), the hardware handle, the session table, and the
//! frame writer. Shared behavior is plain helper calls, not inheritance.

use ccslib::{CcsError, CcsResult, Command, Done};

use crate::config::ServerConfig;
use crate::frames::FrameWriter;
use crate::handler::CommandLink;
use crate::hardware::HardwareHandle;
use crate::session::{SessionHandle, SessionTable};

/// Capabilities available to a running command implementation
pub struct Context<'a> {
    /// Id of the inbound command; every Ack and the Done echo it
    pub command_id: u64,
    /// The connection back to the original caller
    pub link: &'a mut CommandLink,
    /// The session owning this invocation
    pub session: &'a SessionHandle,
    pub hardware: &'a HardwareHandle,
    pub sessions: &'a SessionTable,
    pub config: &'a ServerConfig,
    pub frames: &'a FrameWriter,
}

/// One command implementation. Constructed fresh per dispatched command;
/// never shared or reused.
pub trait CommandExec: Send {
    /// Time-to-complete advertised in the initial Ack. Commands with a
    /// known duration add it to the session default.
    fn estimate_ack(&self, command: &Command, session: &SessionHandle) -> u64 {
        let _ = command;
        session.default_ack_ms.max(session.min_ack_ms)
    }

    /// Execute the command. Always produces the terminal Done; failures are
    /// encoded in it, never thrown past it.
    fn run(&mut self, command: &Command, ctx: &mut Context<'_>) -> Done;
}

/// Abort checkpoint. On observing the session flag, short-circuits the
/// implementation with `CcsError::Aborted`. A session at a checkpoint has
/// no driver call in flight; interrupting a blocking call is the abort
/// trigger's job, routed only to the session owning the hardware.
pub fn checkpoint(session: &SessionHandle) -> CcsResult<()> {
    if session.abort_requested() {
        return Err(CcsError::Aborted);
    }
    Ok(())
}

/// Map an implementation error onto the terminal Done for `id`
pub fn done_from_err(id: u64, err: &CcsError) -> Done {
    match err {
        CcsError::Aborted => Done::aborted(id),
        other => Done::failure(id, other.code(), other.to_string()),
    }
}
