//! Per-connection protocol engine
//!
//! A connection carries exactly one Command/Done exchange: read the
//! command, resolve its implementation, send the initial Ack, run the
//! implementation (which may send further Acks), send the Done, close.

use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ccslib::{read_frame, write_frame, Ack, CcsResult, Command, Done};
use log::{debug, info, warn};

use crate::config::ServerConfig;
use crate::exec::Context;
use crate::frames::FrameWriter;
use crate::hardware::HardwareHandle;
use crate::registry::CommandRegistry;
use crate::session::{SessionHandle, SessionTable};

/// The framed connection back to one caller. Owned by the dispatching
/// thread; implementations send mid-run Acks through it via the Context.
pub struct CommandLink {
    stream: TcpStream,
}

impl CommandLink {
    pub fn new(stream: TcpStream) -> CcsResult<Self> {
        // The accepted stream may inherit the listener's non-blocking mode
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Read the single command this connection carries
    pub fn read_command(&mut self) -> CcsResult<Command> {
        read_frame(&mut self.stream)
    }

    /// Send a liveness Ack; the only signal that keeps the caller waiting
    pub fn send_ack(&mut self, id: u64, time_to_complete_ms: u64) -> CcsResult<()> {
        debug!("command {}: ack {} ms", id, time_to_complete_ms);
        write_frame(
            &mut self.stream,
            &ccslib::ServerMessage::Ack(Ack::new(id, time_to_complete_ms)),
        )
    }

    /// Send the terminal Done
    pub fn send_done(&mut self, done: &Done) -> CcsResult<()> {
        write_frame(&mut self.stream, &ccslib::ServerMessage::Done(done.clone()))
    }
}

/// State shared by every connection handler
pub struct ServerShared {
    pub config: ServerConfig,
    pub hardware: Arc<HardwareHandle>,
    pub sessions: SessionTable,
    pub frames: FrameWriter,
    next_session: AtomicU64,
}

impl ServerShared {
    pub fn new(config: ServerConfig, hardware: HardwareHandle) -> CcsResult<Self> {
        let frames = FrameWriter::new(&config.frame_dir)?;
        Ok(Self {
            config,
            hardware: Arc::new(hardware),
            sessions: SessionTable::new(),
            frames,
            next_session: AtomicU64::new(1),
        })
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }
}

/// Drive one command to its Done.
///
/// Every accepted command yields exactly one Done: the implementation
/// returns it on every path, and failures to deliver it are logged (the
/// caller is gone; there is nobody left to tell).
pub fn dispatch(
    shared: &ServerShared,
    registry: &CommandRegistry,
    mut link: CommandLink,
    command: Command,
) {
    let session = SessionHandle::new(shared.next_session_id(), &shared.config);
    info!(
        "{}: dispatch {} (command {})",
        session.id, command.type_tag, command.id
    );

    let mut exec = registry.resolve(&command.type_tag);
    let ack_ms = exec
        .estimate_ack(&command, &session)
        .max(session.min_ack_ms);
    if let Err(e) = link.send_ack(command.id, ack_ms) {
        warn!("{}: failed to send initial ack: {}", session.id, e);
        return;
    }

    if let Err(e) = shared
        .sessions
        .register(&session, command.id, &command.type_tag)
    {
        warn!("{}: session registration failed: {}", session.id, e);
    }

    let done = {
        let mut ctx = Context {
            command_id: command.id,
            link: &mut link,
            session: &session,
            hardware: &shared.hardware,
            sessions: &shared.sessions,
            config: &shared.config,
            frames: &shared.frames,
        };
        exec.run(&command, &mut ctx)
    };

    shared.sessions.deregister(session.id);

    if let Err(e) = link.send_done(&done) {
        warn!("{}: failed to send done: {}", session.id, e);
    } else {
        info!(
            "{}: {} done, successful={} code={}",
            session.id, command.type_tag, done.successful, done.error_code
        );
    }
}
