//! Breakpoint injection into compiled units.
//!
//! Injection never mutates a unit: it produces an instrumented copy with a
//! trap instruction inserted before the first instruction of the target line
//! and the trap hook appended to the constant table. Ejection produces the
//! inverse copy; a unit that went through both is indistinguishable from the
//! original in code and line table.

use std::sync::Arc;

use mantis_runtime::frame::Frame;
use mantis_runtime::module::ModuleTable;
use mantis_runtime::unit::{CompiledUnit, Const, Instr, Op, TrapHook};

use crate::breakpoint::model::LineBreakpoint;
use crate::error::DebugError;

/// The debugger's trap callback, invoked from an instrumented line with the
/// breakpoint it belongs to and the executing frame.
pub type Trap = Arc<dyn Fn(&LineBreakpoint, &Arc<Frame>) + Send + Sync>;

fn no_such_line(unit: &CompiledUnit, line: i64) -> DebugError {
    DebugError::NoSuchLine {
        path: unit.source().to_path_buf(),
        line,
    }
}

/// Build an instrumented copy of `unit` that invokes `trap(breakpoint,
/// frame)` when execution reaches `line`, before the line's own
/// instructions. Every other line is unchanged.
///
/// # Errors
/// Fails when `line` is not an instruction boundary of `unit`.
pub fn inject_hook(
    unit: &Arc<CompiledUnit>,
    trap: &Trap,
    line: i64,
    breakpoint: &LineBreakpoint,
) -> Result<Arc<CompiledUnit>, DebugError> {
    let target = u32::try_from(line).map_err(|_| no_such_line(unit, line))?;
    if !unit.starts_line(target) {
        return Err(no_such_line(unit, line));
    }
    let index = unit
        .code()
        .iter()
        .position(|instr| instr.line == target)
        .ok_or_else(|| no_such_line(unit, line))?;

    let mut code = unit.code().to_vec();
    let mut consts = unit.consts().snapshot().to_vec();
    let slot = u32::try_from(consts.len()).map_err(|_| no_such_line(unit, line))?;
    let hook: TrapHook = {
        let trap = Arc::clone(trap);
        let breakpoint = breakpoint.clone();
        Arc::new(move |frame| trap(&breakpoint, frame))
    };
    consts.push(Const::Hook(hook));
    code.insert(
        index,
        Instr {
            line: target,
            op: Op::Trap(slot),
        },
    );
    Ok(unit.rebuilt(code, consts))
}

/// Build a copy of `unit` with the trap at `line` removed, restoring the
/// pre-injection code and constant table.
///
/// # Errors
/// Fails when no trap is installed at `line`.
pub fn eject_hook(unit: &Arc<CompiledUnit>, line: i64) -> Result<Arc<CompiledUnit>, DebugError> {
    let target = u32::try_from(line).map_err(|_| no_such_line(unit, line))?;
    let consts_snapshot = unit.consts().snapshot();
    let index = unit
        .code()
        .iter()
        .position(|instr| {
            instr.line == target
                && matches!(
                    instr.op,
                    Op::Trap(slot) if matches!(consts_snapshot.get(slot as usize), Some(Const::Hook(_)))
                )
        })
        .ok_or_else(|| no_such_line(unit, line))?;
    let Op::Trap(removed_slot) = unit.code()[index].op else {
        return Err(no_such_line(unit, line));
    };

    let mut code = unit.code().to_vec();
    code.remove(index);
    let mut consts = consts_snapshot.to_vec();
    consts.remove(removed_slot as usize);

    // Every constant reference above the removed slot shifts down by one.
    for instr in &mut code {
        match &mut instr.op {
            Op::LoadConst(slot) | Op::Trap(slot) | Op::MakeFunction { unit: slot, .. } => {
                if *slot > removed_slot {
                    *slot -= 1;
                }
            }
            _ => {}
        }
    }
    Ok(unit.rebuilt(code, consts))
}

/// Repoint every live function whose body is `old` to `new`, through the
/// module table's reverse index. Best-effort: functions created concurrently
/// with the swap may still be found through a later pass.
pub fn repoint_functions(table: &ModuleTable, old: &Arc<CompiledUnit>, new: &Arc<CompiledUnit>) {
    for function in table.functions_of(old.id()) {
        function.set_unit(Arc::clone(new));
        table.record_function(&function);
        tracing::debug!(
            function = function.name().as_str(),
            "repointed function to instrumented unit"
        );
    }
}
