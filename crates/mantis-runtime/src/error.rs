//! Runtime errors.

use smol_str::SmolStr;
use thiserror::Error;

/// Errors raised by module loading and unit execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// Undefined local variable.
    #[error("undefined variable '{0}'")]
    UndefinedVariable(SmolStr),

    /// Undefined function in the module namespace.
    #[error("undefined function '{0}'")]
    UndefinedFunction(SmolStr),

    /// No source registered under the module name.
    #[error("undefined module '{0}'")]
    UndefinedModule(SmolStr),

    /// A loader participant is already installed.
    #[error("loader participant already installed")]
    ParticipantInstalled,

    /// No loader participant to uninstall.
    #[error("no loader participant installed")]
    ParticipantMissing,

    /// Value stack underflow while executing a unit.
    #[error("value stack underflow in '{0}'")]
    StackUnderflow(SmolStr),

    /// Constant slot out of range or of the wrong kind.
    #[error("invalid constant slot {slot} in '{unit}'")]
    InvalidConst {
        /// Offending slot.
        slot: u32,
        /// Unit being executed.
        unit: SmolStr,
    },
}
