//! High-level client interface for the CCS protocol
//!
//! Drives a full Command/Ack*/Done exchange over one connection, honoring
//! the deadline advertised by each Ack. A Done that does not arrive within
//! the latest advertised deadline (plus a fixed latency margin) is a
//! protocol violation and surfaces as a timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ccslib::{tags, Ack, CcsError, CcsResult, Command, Done, ServerMessage};
use log::debug;
use serde_json::json;

use crate::connection::Connection;

/// Poll tick while waiting for the next server message
const POLL_TICK: Duration = Duration::from_millis(100);

/// Grace period before the first Ack arrives
const INITIAL_GRACE: Duration = Duration::from_secs(10);

/// Fixed network-latency margin added to every advertised deadline
const LATENCY_MARGIN: Duration = Duration::from_millis(500);

/// The observable history of one command exchange
#[derive(Debug)]
pub struct Exchange {
    pub acks: Vec<Ack>,
    pub done: Done,
}

/// High-level client for communicating with the camera server
pub struct CcsClient {
    addr: String,
    sequence: AtomicU64,
}

impl CcsClient {
    /// Create a client addressing the given server
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            sequence: AtomicU64::new(1),
        }
    }

    /// Get the next command id
    pub fn next_id(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Execute one command over a fresh connection, collecting every Ack
    /// and the terminal Done.
    pub fn execute(&self, command: Command) -> CcsResult<Exchange> {
        let mut conn = Connection::connect(&self.addr)?;
        conn.send(&command)?;

        let mut acks = Vec::new();
        let mut deadline = Instant::now() + INITIAL_GRACE;

        loop {
            match conn.receive_tick(POLL_TICK)? {
                Some(ServerMessage::Ack(ack)) => {
                    if ack.id != command.id {
                        return Err(CcsError::protocol(format!(
                            "Ack for unexpected command id {}",
                            ack.id
                        )));
                    }
                    debug!("command {}: ack {} ms", command.id, ack.time_to_complete_ms);
                    deadline = Instant::now()
                        + Duration::from_millis(ack.time_to_complete_ms)
                        + LATENCY_MARGIN;
                    acks.push(ack);
                }
                Some(ServerMessage::Done(done)) => {
                    if done.id != command.id {
                        return Err(CcsError::protocol(format!(
                            "Done for unexpected command id {}",
                            done.id
                        )));
                    }
                    return Ok(Exchange { acks, done });
                }
                None => {
                    if Instant::now() > deadline {
                        return Err(CcsError::Timeout);
                    }
                }
            }
        }
    }

    /// Verify the server is able to process commands
    pub fn ping(&self) -> CcsResult<Done> {
        let cmd = Command::new(self.next_id(), tags::PING);
        Ok(self.execute(cmd)?.done)
    }

    /// Query controller phase and active commands
    pub fn status(&self) -> CcsResult<Done> {
        let cmd = Command::new(self.next_id(), tags::STATUS);
        Ok(self.execute(cmd)?.done)
    }

    /// Configure binning and amplifier selection
    pub fn setup(&self, bin: u8, use_alt_amplifier: bool) -> CcsResult<Done> {
        let cmd = Command::new(self.next_id(), tags::SETUP)
            .with_field("bin", json!(bin))
            .with_field("use_alt_amplifier", json!(use_alt_amplifier));
        Ok(self.execute(cmd)?.done)
    }

    /// Take one exposure and read it out
    pub fn expose(&self, exposure_ms: u64) -> CcsResult<Exchange> {
        let cmd = Command::new(self.next_id(), tags::EXPOSE)
            .with_field("exposure_ms", json!(exposure_ms));
        self.execute(cmd)
    }

    /// Run the calibration scheduler with the given time budget
    pub fn calibrate(&self, time_budget_ms: u64) -> CcsResult<Exchange> {
        let cmd = Command::new(self.next_id(), tags::CALIBRATE)
            .with_field("time_budget_ms", json!(time_budget_ms));
        self.execute(cmd)
    }

    /// Abort the command with the given id (or all active commands)
    pub fn abort(&self, target_id: Option<u64>) -> CcsResult<Done> {
        let mut cmd = Command::new(self.next_id(), tags::ABORT);
        if let Some(target) = target_id {
            cmd = cmd.with_field("target_id", json!(target));
        }
        Ok(self.execute(cmd)?.done)
    }

    /// Stop the command with the given id at its next checkpoint
    pub fn stop(&self, target_id: Option<u64>) -> CcsResult<Done> {
        let mut cmd = Command::new(self.next_id(), tags::STOP);
        if let Some(target) = target_id {
            cmd = cmd.with_field("target_id", json!(target));
        }
        Ok(self.execute(cmd)?.done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccslib::{read_frame, write_frame};
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_sequence_increment() {
        let client = CcsClient::new("127.0.0.1:0");
        let first = client.next_id();
        assert_eq!(client.next_id(), first + 1);
    }

    #[test]
    fn test_execute_collects_acks_and_done() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let cmd: Command = read_frame(&mut stream).unwrap();
            write_frame(&mut stream, &ServerMessage::Ack(Ack::new(cmd.id, 2000))).unwrap();
            write_frame(&mut stream, &ServerMessage::Ack(Ack::new(cmd.id, 2000))).unwrap();
            write_frame(&mut stream, &ServerMessage::Done(Done::success(cmd.id))).unwrap();
        });

        let client = CcsClient::new(addr.to_string());
        let exchange = client.ping().map(|done| done.successful);
        assert_eq!(exchange.unwrap(), true);

        server.join().unwrap();
    }

    #[test]
    fn test_mismatched_done_id_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let cmd: Command = read_frame(&mut stream).unwrap();
            write_frame(&mut stream, &ServerMessage::Done(Done::success(cmd.id + 1))).unwrap();
        });

        let client = CcsClient::new(addr.to_string());
        let result = client.ping();
        assert!(matches!(result, Err(CcsError::Protocol(_))));

        server.join().unwrap();
    }
}
