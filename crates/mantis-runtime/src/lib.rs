//! A small managed runtime with dynamically compiled units.
//!
//! Modules are compiled to [`unit::CompiledUnit`]s and executed by a stack
//! interpreter. The runtime exposes the seams a debugger needs: a constant
//! container with atomic unit substitution, per-thread frame registries with
//! stack introspection, a loading pipeline with a pluggable participant, and
//! frame-local plus process-wide trace callbacks.

#![warn(missing_docs)]

pub mod error;
pub mod frame;
pub mod interp;
pub mod loader;
pub mod module;
pub mod unit;
pub mod value;

mod runtime;

pub use runtime::Runtime;
