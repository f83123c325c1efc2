//! Peer delegation client
//!
//! An implementation calls a peer (telescope interface or pipeline) over
//! the same Command/Ack/Done protocol, in a client role, without ever
//! giving up the liveness guarantees owed to the original caller: the wait
//! is a bounded poll, a local abort abandons it within one tick, and every
//! peer Ack is relayed to the original caller as a fresh Ack.

use serde_json::{Map, Value};

use ccslib::{codes, CcsError, CcsResult, Command, Done, ServerMessage};
use ccsclient::Connection;
use log::{debug, info};

use crate::config::constants::{ACK_RELAY_MARGIN_MS, DELEGATE_POLL_TICK};
use crate::exec::Context;

/// Command tags understood by the peers
pub mod peer_tags {
    /// Pipeline: reduce one spooled frame
    pub const REDUCE: &str = "REDUCE";
    /// Pipeline: combine recent bias frames into a master bias
    pub const BUILD_MASTER_BIAS: &str = "BUILD_MASTER_BIAS";
    /// Telescope interface: report current pointing
    pub const POINTING: &str = "POINTING";
}

/// Terminal result of a delegated command.
///
/// Distinguishes "peer replied unsuccessful" from "no reply because the
/// local abort fired while waiting"; the latter carries
/// ABORTED_WHILE_WAITING and is not a peer fault.
#[derive(Debug, Clone)]
pub struct PeerDone {
    pub successful: bool,
    pub error_code: u32,
    pub error_message: String,
    pub fields: Map<String, Value>,
}

impl PeerDone {
    fn aborted_while_waiting() -> Self {
        Self {
            successful: false,
            error_code: codes::ABORTED_WHILE_WAITING,
            error_message: "aborted while waiting for peer".to_string(),
            fields: Map::new(),
        }
    }

    pub fn is_local_abort(&self) -> bool {
        self.error_code == codes::ABORTED_WHILE_WAITING
    }
}

impl From<Done> for PeerDone {
    fn from(done: Done) -> Self {
        Self {
            successful: done.successful,
            error_code: done.error_code,
            error_message: done.error_message,
            fields: done.fields,
        }
    }
}

/// Send `peer_cmd` to the peer at `peer_addr` and wait for its result.
///
/// The wait loop ticks every [`DELEGATE_POLL_TICK`]: a finished peer
/// returns its Done; a set local abort flag abandons the wait with a
/// synthetic [`PeerDone::aborted_while_waiting`] (an unresponsive peer can
/// never block us past one tick); a peer Ack is relayed to the original
/// caller with the peer's deadline plus a local margin.
pub fn delegate(ctx: &mut Context<'_>, peer_addr: &str, peer_cmd: Command) -> CcsResult<PeerDone> {
    info!(
        "{}: delegating {} to {}",
        ctx.session.id, peer_cmd.type_tag, peer_addr
    );

    let mut conn = Connection::connect(peer_addr)
        .map_err(|e| CcsError::peer(format!("connect to {} failed: {}", peer_addr, e)))?;
    conn.send(&peer_cmd)
        .map_err(|e| CcsError::peer(format!("send to {} failed: {}", peer_addr, e)))?;

    loop {
        if ctx.session.abort_requested() {
            debug!("{}: abandoning delegated wait on abort", ctx.session.id);
            return Ok(PeerDone::aborted_while_waiting());
        }

        match conn.receive_tick(DELEGATE_POLL_TICK) {
            Ok(Some(ServerMessage::Ack(ack))) => {
                // Keep the original caller's clock alive while the peer works
                ctx.link
                    .send_ack(ctx.command_id, ack.time_to_complete_ms + ACK_RELAY_MARGIN_MS)?;
            }
            Ok(Some(ServerMessage::Done(done))) => {
                debug!(
                    "{}: peer {} done, successful={}",
                    ctx.session.id, peer_cmd.type_tag, done.successful
                );
                return Ok(done.into());
            }
            Ok(None) => continue,
            Err(e) => {
                return Err(CcsError::peer(format!(
                    "receive from {} failed: {}",
                    peer_addr, e
                )))
            }
        }
    }
}
