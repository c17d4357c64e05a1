//! Pre-execution unit transformation.
//!
//! The only window in which a module's top-level lines (and the entry
//! sentinel) can be instrumented is between compilation and first execution.
//! The watchdog routes a module's top unit through here before the loader
//! runs it.

use std::sync::Arc;

use mantis_runtime::unit::{collect_units, replace_unit, CompiledUnit};

use crate::breakpoint::model::LineBreakpoint;
use crate::error::DebugError;
use crate::injection::{inject_hook, Trap};

/// Instrument `top` for `breakpoint` before it executes.
///
/// A module-entry breakpoint tries every line of the top unit in order and
/// takes the first that accepts a trap. A positive line is tried against the
/// top unit first, then against every nested unit; a nested hit patches the
/// parent's constant table in place and returns the unchanged top.
///
/// # Errors
/// Fails when no unit in the tree starts the requested line.
pub fn transform_unit(
    trap: &Trap,
    breakpoint: &LineBreakpoint,
    top: Arc<CompiledUnit>,
) -> Result<Arc<CompiledUnit>, DebugError> {
    if breakpoint.is_entry() {
        for line in top.line_starts().collect::<Vec<_>>() {
            if let Ok(patched) = inject_hook(&top, trap, i64::from(line), breakpoint) {
                tracing::debug!(
                    source = %top.source().display(),
                    line,
                    "module-entry breakpoint landed"
                );
                return Ok(patched);
            }
        }
        return Err(DebugError::NoSuchLine {
            path: top.source().to_path_buf(),
            line: breakpoint.line,
        });
    }

    match inject_hook(&top, trap, breakpoint.line, breakpoint) {
        Ok(patched) => Ok(patched),
        Err(DebugError::NoSuchLine { .. }) => {
            for (unit, parent) in collect_units(&top) {
                if let Ok(patched) = inject_hook(&unit, trap, breakpoint.line, breakpoint) {
                    replace_unit(parent.consts(), &unit, &patched);
                    return Ok(top);
                }
            }
            Err(DebugError::NoSuchLine {
                path: top.source().to_path_buf(),
                line: breakpoint.line,
            })
        }
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::model::ENTRY_LINE;
    use mantis_runtime::unit::{Const, Op, UnitBuilder};

    fn noop_trap() -> Trap {
        Arc::new(|_, _| {})
    }

    fn top_with_nested() -> Arc<CompiledUnit> {
        let body = {
            let mut builder = UnitBuilder::new("f", "/p/mod.mt");
            builder.instr(5, Op::Nop).instr(6, Op::Return);
            builder.build()
        };
        let mut builder = UnitBuilder::new("mod", "/p/mod.mt");
        let slot = builder.const_unit(body);
        builder
            .instr(2, Op::MakeFunction {
                name: "f".into(),
                unit: slot,
            })
            .instr(3, Op::Nop);
        builder.build()
    }

    #[test]
    fn entry_breakpoint_takes_first_line() {
        let top = top_with_nested();
        let entry = LineBreakpoint::new("/p/mod.mt", ENTRY_LINE);
        let patched = transform_unit(&noop_trap(), &entry, Arc::clone(&top)).unwrap();
        assert!(matches!(patched.code()[0].op, Op::Trap(_)));
        assert_eq!(patched.code()[0].line, 2);
    }

    #[test]
    fn nested_line_patches_parent_in_place() {
        let top = top_with_nested();
        let bp = LineBreakpoint::new("/p/mod.mt", 5);
        let returned = transform_unit(&noop_trap(), &bp, Arc::clone(&top)).unwrap();
        assert_eq!(returned.id(), top.id());

        let consts = top.consts().snapshot();
        let Const::Unit(body) = &consts[0] else {
            panic!("expected nested unit");
        };
        assert!(matches!(body.code()[0].op, Op::Trap(_)));
    }

    #[test]
    fn unknown_line_fails() {
        let top = top_with_nested();
        let bp = LineBreakpoint::new("/p/mod.mt", 42);
        assert!(matches!(
            transform_unit(&noop_trap(), &bp, top),
            Err(DebugError::NoSuchLine { line: 42, .. })
        ));
    }
}
