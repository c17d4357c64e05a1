//! Unit interpreter and line-tracing dispatch.

use std::cell::Cell;
use std::sync::Arc;

use crate::error::RuntimeError;
use crate::frame::Frame;
use crate::module::{Function, Module};
use crate::runtime::Runtime;
use crate::unit::{CompiledUnit, Const, Op};
use crate::value::Value;

/// Events delivered to trace callbacks, in execution order: one `Call` on
/// frame entry, a `Line` at every instruction-boundary line, one `Return`
/// carrying the value as the frame unwinds.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    /// A new frame started executing.
    Call,
    /// Execution reached the start of a source line.
    Line(u32),
    /// The frame is returning with the given value.
    Return(Value),
}

/// A trace callback. Invoked synchronously on the executing thread with the
/// frame the event belongs to.
pub type TraceFn = Arc<dyn Fn(&Arc<Frame>, &TraceEvent) + Send + Sync>;

thread_local! {
    static IN_TRACE: Cell<bool> = const { Cell::new(false) };
}

/// Dispatch a trace event for `frame`: the frame-local callback wins over the
/// process-wide one. Tracing is suppressed while a callback runs so the
/// callback's own work is never traced.
fn fire(runtime: &Runtime, frame: &Arc<Frame>, event: &TraceEvent) {
    if IN_TRACE.with(Cell::get) {
        return;
    }
    let Some(callback) = frame.trace().or_else(|| runtime.current_trace()) else {
        return;
    };
    IN_TRACE.with(|flag| flag.set(true));
    callback(frame, event);
    IN_TRACE.with(|flag| flag.set(false));
}

/// Execute `unit` in a fresh frame chained onto `back`.
pub(crate) fn run(
    runtime: &Arc<Runtime>,
    module: &Arc<Module>,
    unit: &Arc<CompiledUnit>,
    back: Option<Arc<Frame>>,
) -> Result<Value, RuntimeError> {
    let frame = Frame::new(Arc::clone(module), Arc::clone(unit), back);
    runtime.frames().enter(Arc::clone(&frame));
    let result = exec(runtime, module, &frame);
    runtime.frames().exit(&frame);
    result
}

fn exec(
    runtime: &Arc<Runtime>,
    module: &Arc<Module>,
    frame: &Arc<Frame>,
) -> Result<Value, RuntimeError> {
    let unit = Arc::clone(frame.unit());
    let consts = unit.consts().snapshot();
    fire(runtime, frame, &TraceEvent::Call);

    let mut prev_line = None;
    for instr in unit.code() {
        if prev_line != Some(instr.line) {
            prev_line = Some(instr.line);
            frame.set_line(instr.line);
            fire(runtime, frame, &TraceEvent::Line(instr.line));
        }
        match &instr.op {
            Op::Nop => {}
            Op::LoadConst(slot) => match consts.get(*slot as usize) {
                Some(Const::Value(value)) => frame.push(value.clone()),
                _ => {
                    return Err(RuntimeError::InvalidConst {
                        slot: *slot,
                        unit: unit.name().clone(),
                    })
                }
            },
            Op::LoadLocal(name) => {
                let value = frame
                    .local(name)
                    .ok_or_else(|| RuntimeError::UndefinedVariable(name.clone()))?;
                frame.push(value);
            }
            Op::StoreLocal(name) => {
                let value = frame
                    .pop()
                    .ok_or_else(|| RuntimeError::StackUnderflow(unit.name().clone()))?;
                frame.set_local(name.clone(), value);
            }
            Op::MakeFunction { name, unit: slot } => match consts.get(*slot as usize) {
                Some(Const::Unit(body)) => {
                    let function = Function::new(name.clone(), Arc::clone(body));
                    runtime.modules().record_function(&function);
                    module.bind_function(function);
                }
                _ => {
                    return Err(RuntimeError::InvalidConst {
                        slot: *slot,
                        unit: unit.name().clone(),
                    })
                }
            },
            Op::CallFunction(name) => {
                let function = module
                    .function(name)
                    .ok_or_else(|| RuntimeError::UndefinedFunction(name.clone()))?;
                let body = function.unit();
                let value = run(runtime, module, &body, Some(Arc::clone(frame)))?;
                frame.push(value);
            }
            Op::Trap(slot) => match consts.get(*slot as usize) {
                Some(Const::Hook(hook)) => hook(frame),
                _ => {
                    // A malformed trap must never take the program down.
                    tracing::warn!(
                        unit = unit.name().as_str(),
                        slot,
                        "trap instruction without a hook constant"
                    );
                }
            },
            Op::Return => {
                let value = frame.pop().unwrap_or(Value::Nil);
                fire(runtime, frame, &TraceEvent::Return(value.clone()));
                return Ok(value);
            }
        }
    }

    fire(runtime, frame, &TraceEvent::Return(Value::Nil));
    Ok(Value::Nil)
}
