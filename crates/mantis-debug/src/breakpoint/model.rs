//! Breakpoint value types.

use std::fmt;
use std::path::PathBuf;

use mantis_runtime::value::Value;
use rustc_hash::FxHashMap;
use smol_str::SmolStr;

use crate::breakpoint::expr::CondExpr;
use crate::error::DebugError;

/// Sentinel line number selecting the first executable line of a module,
/// whichever that turns out to be. Satisfiable only before the module's top
/// unit runs.
pub const ENTRY_LINE: i64 = -1;

/// A breakpoint at a source line, or at module entry when `line` is
/// [`ENTRY_LINE`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LineBreakpoint {
    /// Resolved source file.
    pub source: PathBuf,
    /// Target line, or [`ENTRY_LINE`].
    pub line: i64,
}

impl LineBreakpoint {
    /// Create a line breakpoint.
    #[must_use]
    pub fn new(source: impl Into<PathBuf>, line: i64) -> Self {
        Self {
            source: source.into(),
            line,
        }
    }

    /// Whether this is a module-entry breakpoint.
    #[must_use]
    pub fn is_entry(&self) -> bool {
        self.line == ENTRY_LINE
    }
}

impl fmt::Display for LineBreakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_entry() {
            write!(f, "{}", self.source.display())
        } else {
            write!(f, "{}:{}", self.source.display(), self.line)
        }
    }
}

/// A breakpoint on a function, resolved at install time to the line
/// breakpoint at the function's first line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionBreakpoint {
    /// Module the function is looked up in.
    pub module: SmolStr,
    /// Dotted path of the function inside the module.
    pub function: SmolStr,
}

impl FunctionBreakpoint {
    /// Create a function breakpoint.
    #[must_use]
    pub fn new(module: impl Into<SmolStr>, function: impl Into<SmolStr>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
        }
    }
}

impl fmt::Display for FunctionBreakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.function)
    }
}

/// The breakpoint sum type. Identity is value equality, so re-requesting the
/// same location resolves to the same registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Breakpoint {
    /// Line (or module-entry) breakpoint.
    Line(LineBreakpoint),
    /// Function breakpoint.
    Function(FunctionBreakpoint),
}

impl Breakpoint {
    /// The line variant, if this is one.
    #[must_use]
    pub fn as_line(&self) -> Option<&LineBreakpoint> {
        match self {
            Breakpoint::Line(line) => Some(line),
            Breakpoint::Function(_) => None,
        }
    }
}

impl fmt::Display for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Breakpoint::Line(bp) => bp.fmt(f),
            Breakpoint::Function(bp) => bp.fmt(f),
        }
    }
}

impl From<LineBreakpoint> for Breakpoint {
    fn from(bp: LineBreakpoint) -> Self {
        Breakpoint::Line(bp)
    }
}

impl From<FunctionBreakpoint> for Breakpoint {
    fn from(bp: FunctionBreakpoint) -> Self {
        Breakpoint::Function(bp)
    }
}

/// A breakpoint condition: the source text plus its precompiled predicate.
///
/// Two conditions are equal when their source text is equal; the compiled
/// form carries no identity.
#[derive(Debug, Clone)]
pub struct BreakpointCondition {
    text: String,
    code: CondExpr,
}

impl BreakpointCondition {
    /// Compile `text` into a condition.
    ///
    /// # Errors
    /// Fails when the text does not parse as a condition expression.
    pub fn parse(text: &str) -> Result<Self, DebugError> {
        let code = CondExpr::parse(text)?;
        Ok(Self {
            text: text.to_owned(),
            code,
        })
    }

    /// Condition source text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Evaluate the condition against a frame's locals. The result is the
    /// truthiness of the expression value.
    ///
    /// # Errors
    /// Fails on undefined names or type mismatches; callers treat a failed
    /// evaluation as "do not interrupt".
    pub fn eval(&self, locals: &FxHashMap<SmolStr, Value>) -> Result<bool, DebugError> {
        Ok(self.code.eval(locals)?.is_truthy())
    }
}

impl PartialEq for BreakpointCondition {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for BreakpointCondition {}

impl fmt::Display for BreakpointCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_forms() {
        let line = LineBreakpoint::new("/p/mod.mt", 12);
        assert_eq!(line.to_string(), "/p/mod.mt:12");
        let entry = LineBreakpoint::new("/p/mod.mt", ENTRY_LINE);
        assert_eq!(entry.to_string(), "/p/mod.mt");
        let func = FunctionBreakpoint::new("app", "handler");
        assert_eq!(func.to_string(), "app:handler");
    }

    #[test]
    fn conditions_compare_by_text() {
        let a = BreakpointCondition::parse("a == 1").unwrap();
        let b = BreakpointCondition::parse("a == 1").unwrap();
        let c = BreakpointCondition::parse("a == 2").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
