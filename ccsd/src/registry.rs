//! Command-type dispatch registry
//!
//! A static mapping from command type tag to a constructor for its
//! implementation, built once at startup. `resolve` never fails: unknown
//! tags fall back to an implementation whose Done reports UNKNOWN_COMMAND.
//! Every dispatched resolve constructs a fresh instance, because
//! implementations hold per-invocation mutable state.

use std::collections::HashMap;

use ccslib::{codes, tags, Command, Done};
use log::warn;

use crate::commands::{
    AbortCommand, ExposeCommand, PingCommand, SetupCommand, StatusCommand, StopCommand,
};
use crate::exec::{CommandExec, Context};
use crate::scheduler::CalibrateCommand;

/// Constructor for a command implementation
pub type ExecConstructor = fn() -> Box<dyn CommandExec>;

/// Registry of known command type tags
pub struct CommandRegistry {
    map: HashMap<String, ExecConstructor>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// The full command set of the camera server
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(tags::PING, || Box::new(PingCommand::new()));
        registry.register(tags::STATUS, || Box::new(StatusCommand::new()));
        registry.register(tags::SETUP, || Box::new(SetupCommand::new()));
        registry.register(tags::EXPOSE, || Box::new(ExposeCommand::new()));
        registry.register(tags::CALIBRATE, || Box::new(CalibrateCommand::new()));
        registry.register(tags::ABORT, || Box::new(AbortCommand::new()));
        registry.register(tags::STOP, || Box::new(StopCommand::new()));
        registry
    }

    /// Register a constructor for a tag. A duplicate tag is a configuration
    /// conflict: it is logged, and the last registration wins.
    pub fn register(&mut self, tag: &str, constructor: ExecConstructor) {
        if self.map.insert(tag.to_string(), constructor).is_some() {
            warn!("duplicate registration for command tag {}; last wins", tag);
        }
    }

    /// Resolve a tag to a fresh implementation instance
    pub fn resolve(&self, tag: &str) -> Box<dyn CommandExec> {
        match self.map.get(tag) {
            Some(constructor) => constructor(),
            None => Box::new(UnknownCommand),
        }
    }

    /// Whether the tag is registered (the fallback does not count)
    pub fn contains(&self, tag: &str) -> bool {
        self.map.contains_key(tag)
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Fallback implementation for unknown tags
struct UnknownCommand;

impl CommandExec for UnknownCommand {
    fn run(&mut self, command: &Command, _ctx: &mut Context<'_>) -> Done {
        warn!("unknown command tag: {}", command.type_tag);
        Done::failure(
            command.id,
            codes::UNKNOWN_COMMAND,
            format!("Unknown command: {}", command.type_tag),
        )
    }
}
