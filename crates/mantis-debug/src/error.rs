//! Debugger errors.

use std::path::PathBuf;

use mantis_runtime::error::RuntimeError;
use smol_str::SmolStr;
use thiserror::Error;

use crate::breakpoint::model::Breakpoint;

/// Errors raised by breakpoint registration, resolution, injection, and
/// condition evaluation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DebugError {
    /// The breakpoint is already registered with the same condition.
    #[error("breakpoint {0} already registered")]
    AlreadyRegistered(Breakpoint),

    /// No registered breakpoint carries this number.
    #[error("unknown breakpoint number {0}")]
    UnknownBreakpoint(u32),

    /// The line is not an instruction boundary of any unit in the source.
    // The field cannot be called `source`: thiserror reserves that name for
    // a causing error.
    #[error("no unit starts line {line} of {}", path.display())]
    NoSuchLine {
        /// Source file the line was resolved against.
        path: PathBuf,
        /// Requested line.
        line: i64,
    },

    /// The line cannot be targeted by post-load injection.
    #[error("line {0} cannot be injected into a loaded module")]
    InvalidLine(i64),

    /// The named function does not exist in the module namespace.
    #[error("no function '{function}' in module '{module}'")]
    FunctionNotFound {
        /// Module the lookup ran against.
        module: SmolStr,
        /// Dotted function path.
        function: SmolStr,
    },

    /// The hook id is not registered under the given key.
    #[error("hook is not registered")]
    HookNotFound,

    /// The transformer id is not registered under the given key.
    #[error("transformer is not registered")]
    TransformerNotFound,

    /// Condition text failed to parse.
    #[error("condition parse error: {0}")]
    Parse(String),

    /// A name used in a condition is not bound in the frame.
    #[error("undefined name '{0}' in condition")]
    UndefinedName(SmolStr),

    /// Operand types do not support the requested operation.
    #[error("type mismatch applying '{op}'")]
    TypeMismatch {
        /// Operator that failed.
        op: &'static str,
    },

    /// Unknown settings key.
    #[error("unknown setting '{0}'")]
    UnknownSetting(SmolStr),

    /// Settings value failed to parse for its key.
    #[error("invalid value '{value}' for setting '{name}'")]
    InvalidSettingValue {
        /// Settings key.
        name: SmolStr,
        /// Rejected value.
        value: String,
    },

    /// Error surfaced from the runtime.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}
