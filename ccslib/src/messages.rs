//! Message definitions for the CCS wire protocol
//!
//! A connection carries exactly one Command followed by zero or more Acks
//! and exactly one terminal Done. The same messages are used inbound (server
//! role) and outbound toward the telescope interface and pipeline peers
//! (client role).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Command type tags understood by the server.
///
/// Dispatch is by string tag so that an unknown tag can still be received,
/// parsed, and answered with an UNKNOWN_COMMAND result.
pub mod tags {
    /// Verify the server is able to process commands
    pub const PING: &str = "PING";
    /// Report controller phase and active commands
    pub const STATUS: &str = "STATUS";
    /// Configure binning and amplifier selection
    pub const SETUP: &str = "SETUP";
    /// Take one exposure and read it out
    pub const EXPOSE: &str = "EXPOSE";
    /// Run the time-budgeted calibration scheduler
    pub const CALIBRATE: &str = "CALIBRATE";
    /// Abort the targeted command, interrupting the active hardware phase
    pub const ABORT: &str = "ABORT";
    /// Stop the targeted command at its next checkpoint
    pub const STOP: &str = "STOP";

    /// Interrupt-class tags are serviced on a dedicated fast path, ahead of
    /// long-running normal commands.
    pub fn is_interrupt(tag: &str) -> bool {
        tag == ABORT || tag == STOP
    }
}

/// Stable numeric error codes carried in Done messages, namespaced per
/// command family. Callers branch on `successful` and `error_code`, never
/// on the message text.
pub mod codes {
    pub const OK: u32 = 0;

    // 1xx - protocol / dispatch
    pub const UNKNOWN_COMMAND: u32 = 100;
    pub const ABORTED: u32 = 101;
    pub const BAD_REQUEST: u32 = 102;
    pub const INTERNAL: u32 = 103;

    // 2xx - hardware
    pub const HW_FAULT: u32 = 200;
    pub const HW_BUSY: u32 = 201;

    // 3xx - peer communication
    pub const PEER_IO: u32 = 300;
    pub const PEER_REFUSED: u32 = 301;
    pub const ABORTED_WHILE_WAITING: u32 = 302;
    pub const PEER_FAILED: u32 = 303;

    // 4xx - calibration scheduler
    pub const SCHEDULE_PERSIST: u32 = 400;
    pub const RECIPE_CONFIG: u32 = 401;
}

/// A command as received from a client. Immutable once received; typed
/// parameter structs are deserialized from `fields` by each implementation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Command {
    /// Caller-chosen identifier echoed in every Ack and the Done
    pub id: u64,
    /// Command type tag, e.g. "EXPOSE"
    pub type_tag: String,
    /// Command-specific fields
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Command {
    pub fn new(id: u64, type_tag: impl Into<String>) -> Self {
        Self {
            id,
            type_tag: type_tag.into(),
            fields: Map::new(),
        }
    }

    /// Attach a command-specific field
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Fetch a field as an unsigned integer, if present
    pub fn field_u64(&self, key: &str) -> Option<u64> {
        self.fields.get(key).and_then(Value::as_u64)
    }

    /// Fetch a field as a boolean, if present
    pub fn field_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(Value::as_bool)
    }
}

/// Liveness acknowledgement: a deadline hint, not a payload. Each Ack resets
/// the caller's timeout clock to `time_to_complete_ms` from receipt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    pub id: u64,
    pub time_to_complete_ms: u64,
}

impl Ack {
    pub fn new(id: u64, time_to_complete_ms: u64) -> Self {
        Self {
            id,
            time_to_complete_ms,
        }
    }
}

/// Terminal result message. Exactly one Done is sent per Command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Done {
    pub id: u64,
    pub successful: bool,
    pub error_code: u32,
    pub error_message: String,
    /// Command-specific result fields
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Done {
    pub fn success(id: u64) -> Self {
        Self {
            id,
            successful: true,
            error_code: codes::OK,
            error_message: String::new(),
            fields: Map::new(),
        }
    }

    pub fn failure(id: u64, error_code: u32, error_message: impl Into<String>) -> Self {
        Self {
            id,
            successful: false,
            error_code,
            error_message: error_message.into(),
            fields: Map::new(),
        }
    }

    /// The distinguished abort outcome, not conflated with hardware faults
    pub fn aborted(id: u64) -> Self {
        Self::failure(id, codes::ABORTED, "command aborted")
    }

    /// Attach a result field
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// Union of messages flowing from server to client on one connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServerMessage {
    Ack(Ack),
    Done(Done),
}

impl ServerMessage {
    pub fn id(&self) -> u64 {
        match self {
            ServerMessage::Ack(ack) => ack.id,
            ServerMessage::Done(done) => done.id,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, ServerMessage::Done(_))
    }

    pub fn as_done(&self) -> Option<&Done> {
        match self {
            ServerMessage::Done(done) => Some(done),
            _ => None,
        }
    }
}
