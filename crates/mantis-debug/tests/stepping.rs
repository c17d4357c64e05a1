//! Step and step-over behavior from an interrupted frame.

use std::sync::Arc;

use mantis_debug::breakpoint::model::{Breakpoint, LineBreakpoint};
use mantis_debug::command::{Command, ScriptedCommands};
use mantis_debug::notify::DebugEvent;
use mantis_debug::Debugger;
use mantis_runtime::module::Module;
use mantis_runtime::unit::{CompiledUnit, Op, UnitBuilder};
use mantis_runtime::value::Value;
use mantis_runtime::Runtime;

const SRC: &str = "/proj/app.mt";

fn app_unit() -> Arc<CompiledUnit> {
    let g = {
        let mut b = UnitBuilder::new("g", SRC);
        let seven = b.const_value(Value::Int(7));
        b.instr(9, Op::LoadConst(seven))
            .instr(9, Op::StoreLocal("x".into()))
            .instr(10, Op::LoadLocal("x".into()))
            .instr(10, Op::Return);
        b.build()
    };
    let f = {
        let mut b = UnitBuilder::new("f", SRC);
        let answer = b.const_value(Value::Int(42));
        b.instr(5, Op::LoadConst(answer))
            .instr(5, Op::StoreLocal("a".into()))
            .instr(6, Op::CallFunction("g".into()))
            .instr(6, Op::StoreLocal("b".into()))
            .instr(7, Op::LoadLocal("a".into()))
            .instr(7, Op::Return);
        b.build()
    };
    let mut b = UnitBuilder::new("app", SRC);
    let g_slot = b.const_unit(g);
    let f_slot = b.const_unit(f);
    b.instr(1, Op::MakeFunction {
        name: "g".into(),
        unit: g_slot,
    })
    .instr(2, Op::MakeFunction {
        name: "f".into(),
        unit: f_slot,
    })
    .instr(3, Op::Nop);
    b.build()
}

fn scripted(commands: impl IntoIterator<Item = Command>) -> Arc<ScriptedCommands> {
    Arc::new(ScriptedCommands::new(commands))
}

fn setup(commands: Arc<ScriptedCommands>) -> (Arc<Runtime>, Arc<Debugger>, Arc<Module>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let runtime = Runtime::new();
    let debugger = Debugger::attach(Arc::clone(&runtime), commands).unwrap();
    debugger.start();
    runtime.register_module_source("app", SRC, app_unit());
    let module = runtime.load("app").unwrap();
    (runtime, debugger, module)
}

fn line_bp(line: i64) -> Breakpoint {
    Breakpoint::Line(LineBreakpoint::new(SRC, line))
}

fn locations(events: &[DebugEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|event| match event {
            DebugEvent::FrameLocation { line, .. } => Some(*line),
            _ => None,
        })
        .collect()
}

#[test]
fn step_stops_at_the_next_line() {
    let (runtime, debugger, module) = setup(scripted([Command::Step, Command::Continue]));
    debugger.set_breakpoint(line_bp(5), None).unwrap();

    assert_eq!(runtime.call_function(&module, "f").unwrap(), Value::Int(42));

    let events = debugger.drain_events();
    assert!(events.iter().any(|event| matches!(
        event,
        DebugEvent::Hit { breakpoint, .. } if *breakpoint == line_bp(5)
    )));
    // Stopped at line 5, stepped once, prompted at line 6.
    assert_eq!(locations(&events), vec![5, 6]);
}

#[test]
fn next_steps_over_the_call_and_reports_the_return() {
    let (runtime, debugger, module) = setup(scripted([Command::Next, Command::Next]));
    debugger.set_breakpoint(line_bp(6), None).unwrap();

    assert_eq!(runtime.call_function(&module, "f").unwrap(), Value::Int(42));

    let events = debugger.drain_events();
    // The call into g was transparent: no prompt at its lines and no report
    // of its return value.
    assert_eq!(locations(&events), vec![6, 7]);
    let returns: Vec<&DebugEvent> = events
        .iter()
        .filter(|event| matches!(event, DebugEvent::ReturnValue { .. }))
        .collect();
    assert_eq!(
        returns,
        vec![&DebugEvent::ReturnValue {
            unit: "f".into(),
            value: Value::Int(42),
        }]
    );
}

#[test]
fn step_descends_into_the_callee() {
    let (runtime, debugger, module) = setup(scripted([
        Command::Step,
        Command::Step,
        Command::Continue,
    ]));
    debugger.set_breakpoint(line_bp(6), None).unwrap();

    runtime.call_function(&module, "f").unwrap();

    // From line 6, one step lands on g's first line.
    let events = debugger.drain_events();
    assert_eq!(locations(&events), vec![6, 9, 10]);
}

#[test]
fn traceback_walks_the_frame_chain() {
    let (runtime, debugger, module) = setup(scripted([Command::Traceback, Command::Continue]));
    debugger.set_breakpoint(line_bp(9), None).unwrap();

    runtime.call_function(&module, "f").unwrap();

    let events = debugger.drain_events();
    // Interrupt location, then the traceback: g's frame and f's frame.
    assert_eq!(locations(&events), vec![9, 9, 6]);
    assert!(events
        .iter()
        .any(|event| matches!(event, DebugEvent::ValueStack { .. })));
}
