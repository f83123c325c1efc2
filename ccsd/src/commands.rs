//! Command implementations
//!
//! One strategy type per command tag. Each is constructed fresh per
//! invocation by the registry and bound to a Context for its single run.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use ccslib::{codes, AmpSelect, Binning, CcsError, CcsResult, Command, Done, Timestamp};

use crate::delegate::{delegate, peer_tags};
use crate::exec::{checkpoint, done_from_err, CommandExec, Context};
use crate::session::SessionHandle;

/// Deserialize a command's fields into its typed parameter struct
pub(crate) fn parse_params<T: DeserializeOwned>(command: &Command) -> CcsResult<T> {
    serde_json::from_value(Value::Object(command.fields.clone())).map_err(|e| {
        CcsError::Command(format!(
            "invalid {} parameters: {}",
            command.type_tag, e
        ))
    })
}

/// PING - verify the server is able to process commands
pub struct PingCommand;

impl PingCommand {
    pub fn new() -> Self {
        Self
    }
}

impl CommandExec for PingCommand {
    fn run(&mut self, command: &Command, _ctx: &mut Context<'_>) -> Done {
        Done::success(command.id).with_field("timestamp_ms", json!(Timestamp::now().as_millis()))
    }
}

/// STATUS - report controller phase and in-flight commands
pub struct StatusCommand;

impl StatusCommand {
    pub fn new() -> Self {
        Self
    }
}

impl CommandExec for StatusCommand {
    fn run(&mut self, command: &Command, ctx: &mut Context<'_>) -> Done {
        let active = match ctx.sessions.snapshot() {
            Ok(active) => active,
            Err(e) => return done_from_err(command.id, &e),
        };
        let list: Vec<Value> = active
            .iter()
            .map(|entry| {
                json!({
                    "session": entry.session.0,
                    "command_id": entry.command_id,
                    "type_tag": entry.type_tag,
                })
            })
            .collect();
        Done::success(command.id)
            .with_field("phase", json!(ctx.hardware.phase().name()))
            .with_field("active_commands", Value::Array(list))
    }
}

#[derive(Debug, Deserialize)]
struct SetupParams {
    bin: u8,
    #[serde(default)]
    use_alt_amplifier: bool,
}

/// SETUP - configure binning and amplifier selection
pub struct SetupCommand;

impl SetupCommand {
    pub fn new() -> Self {
        Self
    }

    fn run_inner(&mut self, command: &Command, ctx: &mut Context<'_>) -> CcsResult<Done> {
        let params: SetupParams = parse_params(command)?;
        let bin = Binning::new(params.bin).map_err(CcsError::Command)?;

        checkpoint(ctx.session)?;
        {
            let mut driver = ctx.hardware.driver(ctx.session.id)?;
            // Re-check after the lock wait: an abort raised while queued
            // must not start the operation
            checkpoint(ctx.session)?;
            driver.setup(bin, AmpSelect::from_alt_flag(params.use_alt_amplifier))?;
        }
        checkpoint(ctx.session)?;

        Ok(Done::success(command.id))
    }
}

impl CommandExec for SetupCommand {
    fn run(&mut self, command: &Command, ctx: &mut Context<'_>) -> Done {
        self.run_inner(command, ctx)
            .unwrap_or_else(|e| done_from_err(command.id, &e))
    }
}

#[derive(Debug, Deserialize)]
struct ExposeParams {
    exposure_ms: u64,
    #[serde(default)]
    bin: Option<u8>,
    #[serde(default)]
    use_alt_amplifier: Option<bool>,
    /// Ask the telescope interface for pointing metadata to attach to the
    /// frame
    #[serde(default)]
    query_telescope: bool,
}

/// EXPOSE - one setup/expose/readout cycle producing a spooled frame
pub struct ExposeCommand;

impl ExposeCommand {
    pub fn new() -> Self {
        Self
    }

    fn run_inner(&mut self, command: &Command, ctx: &mut Context<'_>) -> CcsResult<Done> {
        let params: ExposeParams = parse_params(command)?;

        checkpoint(ctx.session)?;

        if params.bin.is_some() || params.use_alt_amplifier.is_some() {
            let bin = match params.bin {
                Some(factor) => Binning::new(factor).map_err(CcsError::Command)?,
                None => Binning::default(),
            };
            let amp = AmpSelect::from_alt_flag(params.use_alt_amplifier.unwrap_or(false));
            {
                let mut driver = ctx.hardware.driver(ctx.session.id)?;
                checkpoint(ctx.session)?;
                driver.setup(bin, amp)?;
            }
            checkpoint(ctx.session)?;
        }

        let pointing = if params.query_telescope {
            let telescope_addr = ctx.config.telescope_addr.clone();
            let peer_cmd = Command::new(ctx.command_id, peer_tags::POINTING);
            let peer_done = delegate(ctx, &telescope_addr, peer_cmd)?;
            if peer_done.is_local_abort() {
                return Err(CcsError::Aborted);
            }
            if !peer_done.successful {
                return Ok(Done::failure(
                    command.id,
                    codes::PEER_FAILED,
                    format!(
                        "telescope pointing query failed: {} ({})",
                        peer_done.error_message, peer_done.error_code
                    ),
                ));
            }
            Some(peer_done.fields)
        } else {
            None
        };

        checkpoint(ctx.session)?;
        {
            let mut driver = ctx.hardware.driver(ctx.session.id)?;
            checkpoint(ctx.session)?;
            driver.expose(params.exposure_ms)?;
        }
        checkpoint(ctx.session)?;

        let frame = {
            let mut driver = ctx.hardware.driver(ctx.session.id)?;
            checkpoint(ctx.session)?;
            driver.readout()?
        };
        let path = ctx.frames.write(&frame)?;

        let mut done = Done::success(command.id)
            .with_field("frame_path", json!(path.display().to_string()))
            .with_field("width", json!(frame.width))
            .with_field("height", json!(frame.height));
        if let Some(fields) = pointing {
            done = done.with_field("pointing", Value::Object(fields));
        }
        Ok(done)
    }
}

impl CommandExec for ExposeCommand {
    fn estimate_ack(&self, command: &Command, session: &SessionHandle) -> u64 {
        // The exposure length is known up front; advertise it plus the
        // usual margin so the caller's clock covers the integration.
        match command.field_u64("exposure_ms") {
            Some(duration) => duration.saturating_add(session.default_ack_ms),
            None => session.default_ack_ms,
        }
        .max(session.min_ack_ms)
    }

    fn run(&mut self, command: &Command, ctx: &mut Context<'_>) -> Done {
        self.run_inner(command, ctx)
            .unwrap_or_else(|e| done_from_err(command.id, &e))
    }
}

/// ABORT - interrupt-class: flag the target session and interrupt the
/// active hardware phase immediately
pub struct AbortCommand;

impl AbortCommand {
    pub fn new() -> Self {
        Self
    }
}

impl CommandExec for AbortCommand {
    fn run(&mut self, command: &Command, ctx: &mut Context<'_>) -> Done {
        let target = command.field_u64("target_id");
        match ctx.sessions.trigger_abort(target, ctx.hardware, true) {
            Ok(flagged) => Done::success(command.id).with_field("aborted", json!(flagged)),
            Err(e) => done_from_err(command.id, &e),
        }
    }
}

/// STOP - interrupt-class: flag the target session only; the running
/// implementation winds down at its next checkpoint
pub struct StopCommand;

impl StopCommand {
    pub fn new() -> Self {
        Self
    }
}

impl CommandExec for StopCommand {
    fn run(&mut self, command: &Command, ctx: &mut Context<'_>) -> Done {
        let target = command.field_u64("target_id");
        match ctx.sessions.trigger_abort(target, ctx.hardware, false) {
            Ok(flagged) => Done::success(command.id).with_field("stopped", json!(flagged)),
            Err(e) => done_from_err(command.id, &e),
        }
    }
}
