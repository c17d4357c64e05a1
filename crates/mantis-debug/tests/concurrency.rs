//! Cross-thread stopping behavior.

use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mantis_debug::breakpoint::model::{Breakpoint, LineBreakpoint};
use mantis_debug::command::{ChannelCommands, Command};
use mantis_debug::notify::DebugEvent;
use mantis_debug::Debugger;
use mantis_runtime::module::Module;
use mantis_runtime::unit::{CompiledUnit, Op, UnitBuilder};
use mantis_runtime::value::Value;
use mantis_runtime::Runtime;

const SRC: &str = "/proj/app.mt";
const WAIT: Duration = Duration::from_secs(5);

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

struct Session {
    runtime: Arc<Runtime>,
    debugger: Arc<Debugger>,
    module: Arc<Module>,
    commands: Sender<Command>,
    events: std::sync::mpsc::Receiver<DebugEvent>,
}

fn setup() -> Session {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let runtime = Runtime::new();
    let (cmd_tx, cmd_rx) = channel();
    let debugger =
        Debugger::attach(Arc::clone(&runtime), Arc::new(ChannelCommands::new(cmd_rx))).unwrap();
    let (event_tx, event_rx) = channel();
    debugger.install_event_sender(event_tx);
    runtime.register_module_source("app", SRC, app_unit());
    let module = runtime.load("app").unwrap();
    Session {
        runtime,
        debugger,
        module,
        commands: cmd_tx,
        events: event_rx,
    }
}

fn line_bp(line: i64) -> Breakpoint {
    Breakpoint::Line(LineBreakpoint::new(SRC, line))
}

fn next_hit(session: &Session) -> Breakpoint {
    loop {
        match session.events.recv_timeout(WAIT).unwrap() {
            DebugEvent::Hit { breakpoint, .. } => return breakpoint,
            _ => {}
        }
    }
}

#[test]
fn concurrent_hits_serialize_through_the_interrupt_lock() {
    let session = setup();
    session.debugger.set_breakpoint(line_bp(9), None).unwrap();

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let runtime = Arc::clone(&session.runtime);
            let module = Arc::clone(&session.module);
            thread::spawn(move || runtime.call_function(&module, "g").unwrap())
        })
        .collect();

    // Both threads trip the trap; the interrupt lock admits one at a time,
    // so each hit is fully reported before the next begins.
    for _ in 0..2 {
        assert_eq!(next_hit(&session), line_bp(9));
        match session.events.recv_timeout(WAIT).unwrap() {
            DebugEvent::FrameLocation { line, .. } => assert_eq!(line, 9),
            other => panic!("expected a frame location, got {other:?}"),
        }
        session.commands.send(Command::Continue).unwrap();
    }

    for worker in workers {
        assert_eq!(worker.join().unwrap(), Value::Int(7));
    }
    assert!(session
        .events
        .recv_timeout(Duration::from_millis(200))
        .is_err());
}

#[test]
fn running_frame_is_covered_by_traced_fallback() {
    let session = setup();
    session.debugger.set_breakpoint(line_bp(5), None).unwrap();

    let worker = {
        let runtime = Arc::clone(&session.runtime);
        let module = Arc::clone(&session.module);
        thread::spawn(move || runtime.call_function(&module, "f").unwrap())
    };

    // The worker is parked in the prompt at line 5. Its frame keeps
    // executing the unit it entered with, so the new breakpoint at line 7
    // cannot reach it through substitution; arming attaches a frame-local
    // trace instead.
    assert_eq!(next_hit(&session), line_bp(5));
    session.debugger.set_breakpoint(line_bp(7), None).unwrap();
    session.commands.send(Command::Continue).unwrap();

    assert_eq!(next_hit(&session), line_bp(7));
    session.commands.send(Command::Continue).unwrap();

    assert_eq!(worker.join().unwrap(), Value::Int(42));
}

#[test]
fn step_prompt_holds_the_interrupt_lock() {
    let session = setup();
    session.debugger.start();
    session.debugger.set_breakpoint(line_bp(9), None).unwrap();

    let worker1 = {
        let runtime = Arc::clone(&session.runtime);
        let module = Arc::clone(&session.module);
        thread::spawn(move || runtime.call_function(&module, "g").unwrap())
    };
    assert_eq!(next_hit(&session), line_bp(9));
    match session.events.recv_timeout(WAIT).unwrap() {
        DebugEvent::FrameLocation { line, .. } => assert_eq!(line, 9),
        other => panic!("expected a frame location, got {other:?}"),
    }
    session.commands.send(Command::Step).unwrap();
    match session.events.recv_timeout(WAIT).unwrap() {
        DebugEvent::FrameLocation { line, .. } => assert_eq!(line, 10),
        other => panic!("expected a frame location, got {other:?}"),
    }

    // worker1 is parked in the stepping prompt and holds the interrupt
    // lock, so a second thread reaching the breakpoint stays silent.
    let worker2 = {
        let runtime = Arc::clone(&session.runtime);
        let module = Arc::clone(&session.module);
        thread::spawn(move || runtime.call_function(&module, "g").unwrap())
    };
    assert!(session
        .events
        .recv_timeout(Duration::from_millis(300))
        .is_err());

    session.commands.send(Command::Continue).unwrap();
    // worker2 may prompt once through the not-yet-cleared step mode before
    // its trap fires; either way it now reports in order.
    loop {
        match session.events.recv_timeout(WAIT).unwrap() {
            DebugEvent::FrameLocation { line, .. } => {
                assert_eq!(line, 9);
                session.commands.send(Command::Continue).unwrap();
            }
            DebugEvent::Hit { breakpoint, .. } => {
                assert_eq!(breakpoint, line_bp(9));
                match session.events.recv_timeout(WAIT).unwrap() {
                    DebugEvent::FrameLocation { line, .. } => assert_eq!(line, 9),
                    other => panic!("expected a frame location, got {other:?}"),
                }
                session.commands.send(Command::Continue).unwrap();
                break;
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    assert_eq!(worker1.join().unwrap(), Value::Int(7));
    assert_eq!(worker2.join().unwrap(), Value::Int(7));
}

#[test]
fn breakpoint_set_during_a_racing_load_still_installs_and_retires_its_hook() {
    for _ in 0..50 {
        let runtime = Runtime::new();
        let (_commands, cmd_rx) = channel();
        let debugger =
            Debugger::attach(Arc::clone(&runtime), Arc::new(ChannelCommands::new(cmd_rx))).unwrap();
        debugger.start();
        runtime.register_module_source("app", SRC, app_unit());

        let loader = {
            let runtime = Arc::clone(&runtime);
            thread::spawn(move || runtime.load("app").unwrap())
        };
        debugger.set_breakpoint(line_bp(5), None).unwrap();
        loader.join().unwrap();

        // Whichever way the race went, the breakpoint ends up installed
        // with no pending load hook left behind.
        let registry = debugger.registry();
        let entry = registry.get(&line_bp(5)).unwrap();
        assert!(entry.installed());
        assert!(entry.hook().is_none());
    }
}

#[test]
fn breakpoint_cleared_while_a_thread_holds_the_old_unit_stays_quiet() {
    let session = setup();
    session.debugger.set_breakpoint(line_bp(5), None).unwrap();
    session.debugger.set_breakpoint(line_bp(7), None).unwrap();

    let worker = {
        let runtime = Arc::clone(&session.runtime);
        let module = Arc::clone(&session.module);
        thread::spawn(move || runtime.call_function(&module, "f").unwrap())
    };

    // While the worker is stopped at line 5, clear the breakpoint at line 7.
    // The worker's frame still contains the line-7 trap, but a cleared
    // breakpoint no longer exists for the registry and must not stop.
    assert_eq!(next_hit(&session), line_bp(5));
    let number = {
        let registry = session.debugger.registry();
        registry.entry_number(&line_bp(7)).unwrap()
    };
    session.debugger.clear_breakpoint(number).unwrap();
    session.commands.send(Command::Continue).unwrap();

    assert_eq!(worker.join().unwrap(), Value::Int(42));
    // Whatever is still queued, none of it is a hit.
    while let Ok(event) = session.events.recv_timeout(Duration::from_millis(200)) {
        assert!(!matches!(event, DebugEvent::Hit { .. }), "unexpected {event:?}");
    }
}
