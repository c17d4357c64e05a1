//! In-process debugger for the mantis runtime.
//!
//! Breakpoints are installed by substituting instrumented copies of compiled
//! units, not by polling: a trap instruction is injected at the target line
//! and every holder of the old unit is repointed. Frames that were already
//! executing the old copy are covered by per-frame line tracing. A load
//! watchdog defers installation until the target module exists, and a
//! pre-execution transformer window makes module-entry breakpoints possible.
//!
//! The entry point is [`Debugger::attach`]; commands reach the prompt loop
//! through a [`command::CommandSource`].

#![warn(missing_docs)]

pub mod breakpoint;
pub mod command;
pub mod discovery;
pub mod error;
pub mod injection;
pub mod notify;
pub mod settings;
pub mod trace;
pub mod transform;
pub mod watchdog;

mod debugger;

pub use debugger::Debugger;
