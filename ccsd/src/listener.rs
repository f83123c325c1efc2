//! Connection listener and interrupt fast path
//!
//! One thread per active connection. Interrupt-class commands (ABORT,
//! STOP) are handed to a dedicated service thread over a channel, so they
//! are serviced promptly no matter how many long-running normal commands
//! are in flight; this is an admission-control guarantee, not a scheduler
//! hint.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use ccslib::{tags, CcsResult, Command};
use log::{debug, info, warn};

use crate::config::constants::{ACCEPT_POLL_TICK, INTERRUPT_POLL_TICK};
use crate::config::ServerConfig;
use crate::handler::{dispatch, CommandLink, ServerShared};
use crate::hardware::HardwareHandle;
use crate::registry::CommandRegistry;

/// An interrupt-class command waiting for the dedicated service thread
struct InterruptJob {
    link: CommandLink,
    command: Command,
}

/// The camera control server
pub struct Server {
    shared: Arc<ServerShared>,
    registry: Arc<CommandRegistry>,
    listener: TcpListener,
    running: Arc<AtomicBool>,
}

impl Server {
    /// Bind the listener and build the shared server state
    pub fn new(config: ServerConfig, hardware: HardwareHandle) -> CcsResult<Self> {
        let listener = TcpListener::bind(&config.listen_addr)?;
        listener.set_nonblocking(true)?;

        Ok(Self {
            shared: Arc::new(ServerShared::new(config, hardware)?),
            registry: Arc::new(CommandRegistry::standard()),
            listener,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The address actually bound (useful with an ephemeral port)
    pub fn local_addr(&self) -> CcsResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop until [`Server::stop`] is called
    pub fn run(&self) -> CcsResult<()> {
        self.running.store(true, Ordering::SeqCst);

        let (interrupt_tx, interrupt_rx) = mpsc::channel::<InterruptJob>();
        let interrupt_thread = self.spawn_interrupt_service(interrupt_rx);

        info!("listening on {}", self.listener.local_addr()?);

        let result = loop {
            if !self.running.load(Ordering::SeqCst) {
                break Ok(());
            }
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    debug!("accepted connection from {}", addr);
                    let shared = self.shared.clone();
                    let registry = self.registry.clone();
                    let tx = interrupt_tx.clone();
                    thread::spawn(move || serve_connection(shared, registry, stream, tx));
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_TICK);
                }
                Err(e) => {
                    self.running.store(false, Ordering::SeqCst);
                    break Err(e.into());
                }
            }
        };

        drop(interrupt_tx);
        if interrupt_thread.join().is_err() {
            warn!("interrupt service thread panicked");
        }
        result
    }

    /// Ask the accept loop to exit; in-flight commands finish normally
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn spawn_interrupt_service(&self, rx: Receiver<InterruptJob>) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let registry = self.registry.clone();
        let running = self.running.clone();

        thread::spawn(move || loop {
            match rx.recv_timeout(INTERRUPT_POLL_TICK) {
                Ok(job) => dispatch(&shared, &registry, job.link, job.command),
                Err(RecvTimeoutError::Timeout) => {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        })
    }
}

/// Read the one command this connection carries and route it
fn serve_connection(
    shared: Arc<ServerShared>,
    registry: Arc<CommandRegistry>,
    stream: TcpStream,
    interrupt_tx: Sender<InterruptJob>,
) {
    let mut link = match CommandLink::new(stream) {
        Ok(link) => link,
        Err(e) => {
            warn!("connection setup failed: {}", e);
            return;
        }
    };

    let command = match link.read_command() {
        Ok(command) => command,
        Err(e) => {
            debug!("connection closed without a command: {}", e);
            return;
        }
    };

    if tags::is_interrupt(&command.type_tag) {
        if let Err(send_err) = interrupt_tx.send(InterruptJob { link, command }) {
            // Fast path gone during shutdown; service inline instead
            let InterruptJob { link, command } = send_err.0;
            dispatch(&shared, &registry, link, command);
        }
    } else {
        dispatch(&shared, &registry, link, command);
    }
}
