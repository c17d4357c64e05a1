//! Debugger commands and command sources.
//!
//! The prompt loop consumes commands from a [`CommandSource`]; parsing user
//! input into commands is out of scope here, so sources are programmatic: a
//! scripted queue for tests and a channel fed by another thread.

use std::collections::VecDeque;
use std::sync::mpsc::Receiver;

use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::breakpoint::model::Breakpoint;

/// A debugger command, as consumed by the prompt loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Start the debugging session.
    Run,
    /// Register a breakpoint, optionally conditional.
    Break {
        /// Requested breakpoint.
        breakpoint: Breakpoint,
        /// Condition source text.
        condition: Option<String>,
    },
    /// Clear the breakpoint with this number.
    Clear(u32),
    /// Execute the next line, descending into calls.
    Step,
    /// Execute the next line, stepping over calls.
    Next,
    /// Resume until the next breakpoint.
    Continue,
    /// Report the current frame location.
    ListLines,
    /// Log the current unit's instruction stream.
    Disassemble,
    /// Evaluate an expression against the frame's locals.
    Evaluate(String),
    /// Report the frame chain.
    Traceback,
    /// Adjust a settings key.
    Set {
        /// Settings key.
        name: SmolStr,
        /// New value.
        value: String,
    },
    /// Tear the session down and resume the program.
    Quit,
}

impl Command {
    /// Whether the command is meaningless before `run`.
    #[must_use]
    pub fn requires_started(&self) -> bool {
        matches!(
            self,
            Command::Step
                | Command::Next
                | Command::Clear(_)
                | Command::ListLines
                | Command::Disassemble
                | Command::Evaluate(_)
                | Command::Traceback
        )
    }

    /// Whether the command arms line tracing before resuming.
    #[must_use]
    pub fn requires_tracing(&self) -> bool {
        matches!(self, Command::Step | Command::Next)
    }

    /// Whether the command ends the prompt loop and resumes the program.
    #[must_use]
    pub fn resumes(&self) -> bool {
        matches!(
            self,
            Command::Step | Command::Next | Command::Continue | Command::Quit
        )
    }
}

/// Where the prompt loop gets its commands.
pub trait CommandSource: Send + Sync {
    /// The next command. Sources with nothing left return [`Command::Continue`]
    /// so an interrupted program always resumes.
    fn next_command(&self) -> Command;
}

/// A fixed command script, consumed front to back.
#[derive(Debug, Default)]
pub struct ScriptedCommands {
    queue: Mutex<VecDeque<Command>>,
}

impl ScriptedCommands {
    /// Create a script from commands in prompt order.
    #[must_use]
    pub fn new(commands: impl IntoIterator<Item = Command>) -> Self {
        Self {
            queue: Mutex::new(commands.into_iter().collect()),
        }
    }
}

impl CommandSource for ScriptedCommands {
    fn next_command(&self) -> Command {
        self.queue.lock().pop_front().unwrap_or(Command::Continue)
    }
}

/// Commands fed from another thread over a channel. A closed channel reads
/// as [`Command::Continue`].
#[derive(Debug)]
pub struct ChannelCommands {
    receiver: Mutex<Receiver<Command>>,
}

impl ChannelCommands {
    /// Wrap the receiving end of a command channel.
    #[must_use]
    pub fn new(receiver: Receiver<Command>) -> Self {
        Self {
            receiver: Mutex::new(receiver),
        }
    }
}

impl CommandSource for ChannelCommands {
    fn next_command(&self) -> Command {
        self.receiver
            .lock()
            .recv()
            .unwrap_or(Command::Continue)
    }
}
