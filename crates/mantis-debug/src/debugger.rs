//! The debugger orchestrator.
//!
//! Ties the registry, discovery, injection, watchdog, and tracing together
//! behind one object. All stopping funnels through [`Debugger::interrupt`]:
//! a re-entrant process-wide lock serializes concurrent hits, membership and
//! conditions are re-validated inside it, and the prompt loop consumes
//! commands until one resumes the program.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Weak};

use mantis_runtime::frame::{read_value_stack, Frame};
use mantis_runtime::interp::{TraceEvent, TraceFn};
use mantis_runtime::module::Module;
use mantis_runtime::unit::CompiledUnit;
use mantis_runtime::Runtime;
use parking_lot::{Mutex, MutexGuard, ReentrantMutex};
use rustc_hash::FxHashMap;

use crate::breakpoint::model::{
    Breakpoint, BreakpointCondition, FunctionBreakpoint, LineBreakpoint,
};
use crate::breakpoint::registry::{BreakpointRegistry, BreakpointRegistryEntry, Registered};
use crate::command::{Command, CommandSource};
use crate::discovery::DiscoveryTable;
use crate::error::DebugError;
use crate::injection::{eject_hook, inject_hook, repoint_functions, Trap};
use crate::notify::{DebugEvent, EventSink};
use crate::settings::DebugSettings;
use crate::trace::{TraceController, TraceOutcome};
use crate::transform::transform_unit;
use crate::watchdog::{HookId, ModuleHook, ModuleWatchdog, UnitTransformer};

/// The in-process debugger.
pub struct Debugger {
    runtime: Arc<Runtime>,
    watchdog: Arc<ModuleWatchdog>,
    registry: Mutex<BreakpointRegistry>,
    discovery: DiscoveryTable,
    trace: TraceController,
    sink: EventSink,
    settings: Mutex<DebugSettings>,
    commands: Arc<dyn CommandSource>,
    interrupt_lock: ReentrantMutex<()>,
    started: AtomicBool,
    trap: Trap,
    trace_fn: TraceFn,
    // One shared load hook per source with pending line breakpoints.
    pending_hooks: Mutex<FxHashMap<PathBuf, HookId>>,
}

impl std::fmt::Debug for Debugger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debugger")
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl Debugger {
    /// Attach a debugger to `runtime`, installing the load watchdog.
    ///
    /// # Errors
    /// Fails when another debugger (or loader participant) is already
    /// attached.
    pub fn attach(
        runtime: Arc<Runtime>,
        commands: Arc<dyn CommandSource>,
    ) -> Result<Arc<Self>, DebugError> {
        let watchdog = ModuleWatchdog::install(Arc::clone(&runtime))?;
        let debugger = Arc::new_cyclic(|weak: &Weak<Self>| {
            let trap: Trap = {
                let weak = weak.clone();
                Arc::new(move |breakpoint, frame| {
                    if let Some(debugger) = weak.upgrade() {
                        debugger.on_trap(breakpoint, frame);
                    }
                })
            };
            let trace_fn: TraceFn = {
                let weak = weak.clone();
                Arc::new(move |frame, event| {
                    if let Some(debugger) = weak.upgrade() {
                        debugger.on_trace(frame, event);
                    }
                })
            };
            Self {
                trace: TraceController::new(Arc::clone(&runtime)),
                runtime,
                watchdog,
                registry: Mutex::new(BreakpointRegistry::default()),
                discovery: DiscoveryTable::default(),
                sink: EventSink::default(),
                settings: Mutex::new(DebugSettings::default()),
                commands,
                interrupt_lock: ReentrantMutex::new(()),
                started: AtomicBool::new(false),
                trap,
                trace_fn,
                pending_hooks: Mutex::new(FxHashMap::default()),
            }
        });
        Ok(debugger)
    }

    /// Detach: restore the trace slot and remove the watchdog. Registered
    /// breakpoints are cleared first.
    ///
    /// # Errors
    /// Fails when the watchdog is no longer installed.
    pub fn detach(self: &Arc<Self>) -> Result<(), DebugError> {
        self.clear_breakpoints();
        self.trace.reset_tracing();
        self.watchdog.uninstall()
    }

    /// Mark the session started. Logged as an error when already running.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            tracing::error!("debugger session already started");
        } else {
            tracing::info!("debugger session started");
        }
    }

    /// Whether `start` has run.
    #[must_use]
    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// The breakpoint registry. Callers must not hold the guard across other
    /// debugger calls.
    #[must_use]
    pub fn registry(&self) -> MutexGuard<'_, BreakpointRegistry> {
        self.registry.lock()
    }

    /// Current settings snapshot.
    #[must_use]
    pub fn settings(&self) -> DebugSettings {
        self.settings.lock().clone()
    }

    /// Deliver future debug events into `sender`.
    pub fn install_event_sender(&self, sender: Sender<DebugEvent>) {
        self.sink.install_sender(sender);
    }

    /// Take the events buffered while no sender was installed.
    #[must_use]
    pub fn drain_events(&self) -> Vec<DebugEvent> {
        self.sink.drain()
    }

    /// Register a breakpoint and drive it to installed (or pending) state.
    ///
    /// # Errors
    /// Fails on duplicate registration with an identical condition, an
    /// unparsable condition, or an immediate installation failure.
    pub fn set_breakpoint(
        self: &Arc<Self>,
        breakpoint: Breakpoint,
        condition: Option<&str>,
    ) -> Result<(), DebugError> {
        let condition = condition.map(BreakpointCondition::parse).transpose()?;
        self.sink.emit(DebugEvent::Requested(breakpoint.clone()));
        match breakpoint {
            Breakpoint::Line(line) => self.set_line_breakpoint(&line, condition),
            Breakpoint::Function(function) => self.set_function_breakpoint(&function, condition),
        }
    }

    fn set_line_breakpoint(
        self: &Arc<Self>,
        line: &LineBreakpoint,
        condition: Option<BreakpointCondition>,
    ) -> Result<(), DebugError> {
        let breakpoint = Breakpoint::Line(line.clone());
        let outcome = self.registry.lock().register(breakpoint.clone(), condition)?;
        if let Registered::ConditionUpdated { cleared, .. } = outcome {
            self.sink.emit(if cleared {
                DebugEvent::ConditionRemoved(breakpoint)
            } else {
                DebugEvent::ConditionUpdated(breakpoint)
            });
            return Ok(());
        }
        self.install_line_breakpoint(line)
    }

    fn install_line_breakpoint(self: &Arc<Self>, line: &LineBreakpoint) -> Result<(), DebugError> {
        let breakpoint = Breakpoint::Line(line.clone());
        if let Some(module) = self.watchdog.get_by_origin(&line.source) {
            if line.is_entry() {
                let err = DebugError::InvalidLine(line.line);
                self.sink.emit(DebugEvent::BreakpointError {
                    breakpoint,
                    reason: err.to_string(),
                });
                return Err(err);
            }
            return self.inject_breakpoint(&module, line);
        }

        // Before the session starts, the pre-execution window is the only
        // chance to cover top-unit lines and anything the module executes
        // while loading; entry breakpoints are satisfiable nowhere else.
        if line.is_entry() || !self.started() {
            let transformer: UnitTransformer = {
                let weak = Arc::downgrade(self);
                let line = line.clone();
                Arc::new(move |unit| match weak.upgrade() {
                    Some(debugger) => debugger.transform_module_unit(&line, unit),
                    None => unit,
                })
            };
            let id = self.watchdog.register_transformer(&line.source, transformer);
            self.registry.lock().set_transformer(&breakpoint, Some(id));
        } else {
            let id = self.ensure_origin_hook(&line.source);
            let mut registry = self.registry.lock();
            // A load racing with the registration may already have fired
            // the hook and installed the breakpoint.
            if registry.get(&breakpoint).is_some_and(BreakpointRegistryEntry::installed) {
                return Ok(());
            }
            registry.set_hook(&breakpoint, Some(id));
        }
        self.sink.emit(DebugEvent::PendingInstall(breakpoint));
        Ok(())
    }

    fn set_function_breakpoint(
        self: &Arc<Self>,
        function: &FunctionBreakpoint,
        condition: Option<BreakpointCondition>,
    ) -> Result<(), DebugError> {
        let breakpoint = Breakpoint::Function(function.clone());
        let outcome = self.registry.lock().register(breakpoint.clone(), condition)?;
        if let Registered::ConditionUpdated { cleared, .. } = outcome {
            self.sink.emit(if cleared {
                DebugEvent::ConditionRemoved(breakpoint)
            } else {
                DebugEvent::ConditionUpdated(breakpoint)
            });
            return Ok(());
        }

        if let Some(module) = self.runtime.modules().get(&function.module) {
            return self.resolve_function_breakpoint(function, &module);
        }

        let hook: ModuleHook = {
            let weak = Arc::downgrade(self);
            let function = function.clone();
            Arc::new(move |module| {
                if let Some(debugger) = weak.upgrade() {
                    debugger.on_function_module_loaded(&function, module);
                }
            })
        };
        let id = self.watchdog.register_module_hook(&function.module, hook);
        self.registry.lock().set_hook(&breakpoint, Some(id));
        self.sink.emit(DebugEvent::PendingInstall(breakpoint));
        Ok(())
    }

    fn resolve_function_breakpoint(
        self: &Arc<Self>,
        function: &FunctionBreakpoint,
        module: &Arc<Module>,
    ) -> Result<(), DebugError> {
        let breakpoint = Breakpoint::Function(function.clone());
        let Some(target) = module.function(&function.function) else {
            let err = DebugError::FunctionNotFound {
                module: function.module.clone(),
                function: function.function.clone(),
            };
            self.sink.emit(DebugEvent::BreakpointError {
                breakpoint,
                reason: err.to_string(),
            });
            return Err(err);
        };
        let line = LineBreakpoint::new(module.origin(), i64::from(target.unit().first_line()));
        self.registry
            .lock()
            .replace_breakpoint(&breakpoint, Breakpoint::Line(line.clone()));
        self.inject_breakpoint(module, &line)
    }

    /// Inject `line` into its loaded module: resolve the unit, arm frames
    /// already executing it, substitute the instrumented copy, and repoint
    /// function objects.
    fn inject_breakpoint(
        &self,
        module: &Arc<Module>,
        line: &LineBreakpoint,
    ) -> Result<(), DebugError> {
        let breakpoint = Breakpoint::Line(line.clone());
        if line.is_entry() {
            let err = DebugError::InvalidLine(line.line);
            self.sink.emit(DebugEvent::BreakpointError {
                breakpoint,
                reason: err.to_string(),
            });
            return Err(err);
        }
        let result = self.discovery.with(module, |discovery| {
            let (old, _parent) = discovery.at_line(line.line)?;
            // Arm before substitution so a frame racing into the old unit
            // still stops at the target line.
            self.trace.set_traced_breakpoint(line, old.id(), &self.trace_fn);
            let patched = match inject_hook(&old, &self.trap, line.line, line) {
                Ok(patched) => patched,
                Err(err) => {
                    self.trace.clear_traced_breakpoint(line);
                    return Err(err);
                }
            };
            discovery.replace(&old, &patched);
            Ok((old, patched))
        });
        match result {
            Ok((old, patched)) => {
                repoint_functions(self.runtime.modules(), &old, &patched);
                self.registry.lock().mark_installed(&breakpoint);
                self.sink.emit(DebugEvent::Set(breakpoint));
                Ok(())
            }
            Err(err) => {
                self.sink.emit(DebugEvent::BreakpointError {
                    breakpoint,
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Clear the breakpoint with `number`: eject it if installed, release
    /// any pending hook or transformer, and free the number.
    ///
    /// # Errors
    /// Fails when the number is unknown.
    pub fn clear_breakpoint(self: &Arc<Self>, number: u32) -> Result<(), DebugError> {
        let entry = self.registry.lock().unregister(number)?;
        let breakpoint = entry.breakpoint().clone();
        match &breakpoint {
            Breakpoint::Line(line) => {
                self.trace.clear_traced_breakpoint(line);
                // Module-entry breakpoints are one-shot: the trap stays in
                // the unit and goes quiet now that the registry entry is
                // gone.
                if entry.installed() && !line.is_entry() {
                    self.eject_breakpoint(line);
                }
                if entry.hook().is_some() {
                    self.release_origin_hook(&line.source);
                }
                if let Some(id) = entry.transformer() {
                    if let Err(err) = self.watchdog.unregister_transformer(&line.source, id) {
                        tracing::warn!(breakpoint = %line, %err, "transformer already gone");
                    }
                }
            }
            Breakpoint::Function(function) => {
                if let Some(id) = entry.hook() {
                    if let Err(err) = self.watchdog.unregister_module_hook(&function.module, id) {
                        tracing::warn!(breakpoint = %function, %err, "module hook already gone");
                    }
                }
            }
        }
        self.sink.emit(DebugEvent::Cleared(breakpoint));
        Ok(())
    }

    fn eject_breakpoint(&self, line: &LineBreakpoint) {
        let Some(module) = self.watchdog.get_by_origin(&line.source) else {
            return;
        };
        let result = self.discovery.with(&module, |discovery| {
            let (old, _parent) = discovery.at_line(line.line)?;
            let restored = eject_hook(&old, line.line)?;
            discovery.replace(&old, &restored);
            Ok::<_, DebugError>((old, restored))
        });
        match result {
            Ok((old, restored)) => {
                repoint_functions(self.runtime.modules(), &old, &restored);
            }
            Err(err) => {
                tracing::warn!(breakpoint = %line, %err, "failed to eject breakpoint");
            }
        }
    }

    /// Clear every registered breakpoint.
    pub fn clear_breakpoints(self: &Arc<Self>) {
        let numbers = self.registry.lock().numbers();
        for number in numbers {
            if let Err(err) = self.clear_breakpoint(number) {
                tracing::warn!(number, %err, "failed to clear breakpoint");
            }
        }
    }

    // -- shared origin hook ------------------------------------------------

    fn ensure_origin_hook(self: &Arc<Self>, source: &Path) -> HookId {
        if let Some(id) = self.pending_hooks.lock().get(source) {
            return *id;
        }
        let hook: ModuleHook = {
            let weak = Arc::downgrade(self);
            let source = source.to_path_buf();
            Arc::new(move |module| {
                if let Some(debugger) = weak.upgrade() {
                    debugger.on_source_loaded(&source, module);
                }
            })
        };
        // Registered outside the pending-hooks lock: a racing load may fire
        // the hook synchronously, and the hook takes that lock itself.
        let id = self.watchdog.register_origin_hook(source, hook);
        self.pending_hooks.lock().insert(source.to_path_buf(), id);
        // If the module loaded between the caller's check and the
        // registration, the synchronous fire ran before the id was recorded
        // and could not retire the hook. Re-run the retirement now that it
        // can.
        if let Some(module) = self.watchdog.get_by_origin(source) {
            self.on_source_loaded(source, &module);
        }
        id
    }

    /// Install every still-pending line breakpoint for a freshly loaded
    /// source, then retire the shared hook once nothing is pending.
    fn on_source_loaded(self: &Arc<Self>, source: &Path, module: &Arc<Module>) {
        let pending = self.pending_line_breakpoints(source);
        for line in pending {
            if let Err(err) = self.inject_breakpoint(module, &line) {
                tracing::warn!(breakpoint = %line, %err, "pending install failed");
            }
        }
        if self.pending_line_breakpoints(source).is_empty() {
            let removed = self.pending_hooks.lock().remove(source);
            if let Some(id) = removed {
                if let Err(err) = self.watchdog.unregister_origin_hook(source, id) {
                    tracing::warn!(source = %source.display(), %err, "origin hook already gone");
                }
            }
            let mut registry = self.registry.lock();
            let installed: Vec<Breakpoint> = registry
                .entries()
                .iter()
                .filter(|entry| {
                    matches!(entry.breakpoint(), Breakpoint::Line(l) if l.source == source)
                })
                .map(|entry| entry.breakpoint().clone())
                .collect();
            for breakpoint in installed {
                registry.set_hook(&breakpoint, None);
            }
        }
    }

    fn pending_line_breakpoints(&self, source: &Path) -> Vec<LineBreakpoint> {
        self.registry
            .lock()
            .entries()
            .iter()
            .filter_map(|entry| match entry.breakpoint() {
                Breakpoint::Line(line)
                    if line.source == source && !line.is_entry() && !entry.installed() =>
                {
                    Some(line.clone())
                }
                _ => None,
            })
            .collect()
    }

    fn release_origin_hook(self: &Arc<Self>, source: &Path) {
        if !self.pending_line_breakpoints(source).is_empty() {
            return;
        }
        let removed = self.pending_hooks.lock().remove(source);
        if let Some(id) = removed {
            if let Err(err) = self.watchdog.unregister_origin_hook(source, id) {
                tracing::warn!(source = %source.display(), %err, "origin hook already gone");
            }
        }
    }

    // -- watchdog callbacks ------------------------------------------------

    fn on_function_module_loaded(self: &Arc<Self>, function: &FunctionBreakpoint, module: &Arc<Module>) {
        if let Err(err) = self.resolve_function_breakpoint(function, module) {
            tracing::warn!(breakpoint = %function, %err, "function breakpoint resolution failed");
        }
        let breakpoint = Breakpoint::Function(function.clone());
        let id = {
            let mut registry = self.registry.lock();
            let id = registry.get(&breakpoint).and_then(|entry| entry.hook());
            registry.set_hook(&breakpoint, None);
            id
        };
        if let Some(id) = id {
            if let Err(err) = self.watchdog.unregister_module_hook(&function.module, id) {
                tracing::warn!(breakpoint = %function, %err, "module hook already gone");
            }
        }
    }

    /// Pre-execution transformer body for a module-entry (or top-level line)
    /// breakpoint. Failures leave the unit untouched; the program must run.
    fn transform_module_unit(
        self: &Arc<Self>,
        line: &LineBreakpoint,
        unit: Arc<CompiledUnit>,
    ) -> Arc<CompiledUnit> {
        let breakpoint = Breakpoint::Line(line.clone());
        {
            let registry = self.registry.lock();
            match registry.get(&breakpoint) {
                Some(entry) if !entry.installed() => {}
                _ => return unit,
            }
        }
        match transform_unit(&self.trap, line, Arc::clone(&unit)) {
            Ok(patched) => {
                let transformer = {
                    let mut registry = self.registry.lock();
                    registry.mark_installed(&breakpoint);
                    let id = registry.get(&breakpoint).and_then(|entry| entry.transformer());
                    registry.set_transformer(&breakpoint, None);
                    id
                };
                if let Some(id) = transformer {
                    if let Err(err) = self.watchdog.unregister_transformer(&line.source, id) {
                        tracing::warn!(breakpoint = %line, %err, "transformer already gone");
                    }
                }
                self.sink.emit(DebugEvent::Set(breakpoint));
                patched
            }
            Err(err) => {
                self.sink.emit(DebugEvent::BreakpointError {
                    breakpoint,
                    reason: err.to_string(),
                });
                unit
            }
        }
    }

    // -- stopping ----------------------------------------------------------

    fn on_trap(self: &Arc<Self>, breakpoint: &LineBreakpoint, frame: &Arc<Frame>) {
        // Cleared breakpoints may still be embedded in live units; the
        // registry decides whether this trap means anything.
        if !self.registry.lock().contains(&Breakpoint::Line(breakpoint.clone())) {
            return;
        }
        self.interrupt(frame, Some(breakpoint));
    }

    /// The single stopping choke point. Serializes every prompt, breakpoint
    /// hit or step stop alike, behind the interrupt lock. With a breakpoint,
    /// registry membership and the condition are re-validated before the
    /// prompt loop runs; without one the frame prompts directly.
    pub fn interrupt(self: &Arc<Self>, frame: &Arc<Frame>, breakpoint: Option<&LineBreakpoint>) {
        let _guard = self.interrupt_lock.lock();
        if let Some(breakpoint) = breakpoint {
            let key = Breakpoint::Line(breakpoint.clone());
            let condition = {
                let registry = self.registry.lock();
                let Some(entry) = registry.get(&key) else {
                    return;
                };
                if !entry.enabled() {
                    return;
                }
                entry.condition().cloned()
            };
            if let Some(condition) = condition {
                match condition.eval(&frame.locals()) {
                    Ok(true) => {}
                    Ok(false) => return,
                    Err(err) => {
                        tracing::warn!(breakpoint = %breakpoint, %err, "condition evaluation failed");
                        self.sink.emit(DebugEvent::BreakpointError {
                            breakpoint: key,
                            reason: err.to_string(),
                        });
                        return;
                    }
                }
            }

            let thread = std::thread::current()
                .name()
                .map_or_else(|| format!("{:?}", std::thread::current().id()), str::to_owned);
            self.sink.emit(DebugEvent::Hit {
                breakpoint: key,
                thread,
            });
        }
        self.emit_location(frame);
        self.prompt_loop(frame);
    }

    fn emit_location(&self, frame: &Arc<Frame>) {
        self.sink.emit(DebugEvent::FrameLocation {
            source: frame.unit().source().to_path_buf(),
            line: frame.line(),
            unit: frame.unit().name().clone(),
        });
    }

    fn prompt_loop(self: &Arc<Self>, frame: &Arc<Frame>) {
        loop {
            let command = self.commands.next_command();
            if command.requires_started() && !self.started() {
                tracing::warn!(?command, "command requires a started session");
                continue;
            }
            let resumes = command.resumes();
            let arms_tracing = command.requires_tracing();
            match command {
                Command::Run => self.start(),
                Command::Break {
                    breakpoint,
                    condition,
                } => {
                    if let Err(err) = self.set_breakpoint(breakpoint, condition.as_deref()) {
                        tracing::warn!(%err, "break failed");
                    }
                }
                Command::Clear(number) => {
                    if let Err(err) = self.clear_breakpoint(number) {
                        tracing::warn!(number, %err, "clear failed");
                    }
                }
                Command::Step => self.trace.set_step(),
                Command::Next => self.trace.set_next(),
                Command::Continue => {
                    self.trace.clear_mode();
                    if !self.trace.any_traced() {
                        frame.set_trace(None);
                        self.trace.reset_tracing();
                    }
                }
                Command::ListLines => self.emit_location(frame),
                Command::Disassemble => {
                    for instr in frame.unit().code() {
                        tracing::info!(line = instr.line, op = ?instr.op, "instr");
                    }
                }
                Command::Evaluate(expr) => match BreakpointCondition::parse(&expr) {
                    Ok(compiled) => match compiled.eval(&frame.locals()) {
                        Ok(value) => self.sink.emit(DebugEvent::Evaluated {
                            expr,
                            value: mantis_runtime::value::Value::Bool(value),
                        }),
                        Err(err) => tracing::warn!(expr, %err, "evaluation failed"),
                    },
                    Err(err) => tracing::warn!(expr, %err, "parse failed"),
                },
                Command::Traceback => {
                    let mut current = Some(Arc::clone(frame));
                    while let Some(walked) = current {
                        self.emit_location(&walked);
                        current = walked.back().cloned();
                    }
                    let (values, depth) = read_value_stack(frame);
                    self.sink.emit(DebugEvent::ValueStack { values, depth });
                }
                Command::Set { name, value } => {
                    if let Err(err) = self.settings.lock().set(&name, &value) {
                        tracing::warn!(%err, "set failed");
                    }
                }
                Command::Quit => {
                    self.clear_breakpoints();
                    frame.set_trace(None);
                    self.trace.reset_tracing();
                }
            }
            if arms_tracing {
                self.arm_stepping(frame);
            }
            if resumes {
                break;
            }
        }
    }

    fn arm_stepping(&self, frame: &Arc<Frame>) {
        frame.set_trace(Some(Arc::clone(&self.trace_fn)));
        self.trace.set_tracing(&self.trace_fn);
    }

    /// Trace callback body: armed breakpoints first, then the step mode,
    /// then reassert or retire the callback.
    fn on_trace(self: &Arc<Self>, frame: &Arc<Frame>, event: &TraceEvent) {
        if self.settings.lock().trace_opcodes {
            tracing::trace!(?event, unit = frame.unit().name().as_str(), "trace event");
        }

        if let TraceEvent::Line(line) = event {
            // The traced path only covers frames still executing the
            // pre-injection unit; a frame with a trap at this line stops
            // through the trap instead.
            let has_trap = frame.unit().code().iter().any(|instr| {
                instr.line == *line && matches!(instr.op, mantis_runtime::unit::Op::Trap(_))
            });
            if !has_trap && self.trace.at_traced_breakpoint(frame, *line) {
                let hit = LineBreakpoint::new(frame.unit().source(), i64::from(*line));
                let registered = self
                    .registry
                    .lock()
                    .contains(&Breakpoint::Line(hit.clone()));
                if registered {
                    self.interrupt(frame, Some(&hit));
                }
            }
        }

        let outcome = self.trace.consult(frame, event, &self.sink);
        if outcome == TraceOutcome::Prompt {
            self.interrupt(frame, None);
        }

        self.trace.prune_stale();
        if self.trace.has_mode() || self.trace.any_traced() {
            frame.set_trace(Some(Arc::clone(&self.trace_fn)));
        } else {
            frame.set_trace(None);
            self.trace.reset_tracing();
        }
    }
}
