//! Line-tracing state machine.
//!
//! Two concerns share the trace callback. Armed breakpoints cover frames that
//! were already executing a unit when it was instrumented: those frames keep
//! running the old code, so the target line is watched through per-frame
//! tracing instead. Step modes drive `step` and `next` from the prompt.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mantis_runtime::frame::Frame;
use mantis_runtime::interp::{TraceEvent, TraceFn};
use mantis_runtime::unit::UnitId;
use mantis_runtime::Runtime;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::breakpoint::model::LineBreakpoint;
use crate::notify::{DebugEvent, EventSink};

/// What the trace callback should do after consulting the step mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceOutcome {
    /// No mode is active; the callback may detach.
    Done,
    /// Keep tracing without stopping.
    Continue,
    /// Stop and prompt at the current frame.
    Prompt,
}

#[derive(Debug, Clone, Copy)]
enum StepMode {
    Step,
    Next { depth: i64 },
}

/// Per-process tracing controller.
pub struct TraceController {
    runtime: Arc<Runtime>,
    // Armed breakpoint lines per source file.
    traced: Mutex<FxHashMap<PathBuf, Vec<i64>>>,
    mode: Mutex<Option<StepMode>>,
    original: Mutex<Option<TraceFn>>,
    active: AtomicBool,
}

impl std::fmt::Debug for TraceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceController")
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl TraceController {
    /// Create a controller over `runtime`.
    #[must_use]
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            traced: Mutex::new(FxHashMap::default()),
            mode: Mutex::new(None),
            original: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    /// Arm `breakpoint` against frames already executing the unit it targets:
    /// record the line as traced for its source and attach `callback` to
    /// every live frame running `target`.
    pub fn set_traced_breakpoint(
        &self,
        breakpoint: &LineBreakpoint,
        target: UnitId,
        callback: &TraceFn,
    ) {
        {
            let mut traced = self.traced.lock();
            let lines = traced.entry(breakpoint.source.clone()).or_default();
            if !lines.contains(&breakpoint.line) {
                lines.push(breakpoint.line);
            }
        }
        let mut armed = 0usize;
        for frame in self.runtime.frames().current_frames(None) {
            if frame.unit().id() == target {
                frame.set_trace(Some(Arc::clone(callback)));
                armed += 1;
            }
        }
        if armed > 0 {
            tracing::debug!(breakpoint = %breakpoint, armed, "armed running frames");
        }
    }

    /// Disarm `breakpoint`. Frame callbacks detach themselves on their next
    /// event once nothing remains armed.
    pub fn clear_traced_breakpoint(&self, breakpoint: &LineBreakpoint) {
        let mut traced = self.traced.lock();
        if let Some(lines) = traced.get_mut(&breakpoint.source) {
            lines.retain(|line| *line != breakpoint.line);
            if lines.is_empty() {
                traced.remove(&breakpoint.source);
            }
        }
    }

    /// Whether `frame` stands on an armed line.
    #[must_use]
    pub fn at_traced_breakpoint(&self, frame: &Frame, line: u32) -> bool {
        self.traced
            .lock()
            .get(frame.unit().source())
            .is_some_and(|lines| lines.contains(&i64::from(line)))
    }

    /// Whether any breakpoint is armed.
    #[must_use]
    pub fn any_traced(&self) -> bool {
        !self.traced.lock().is_empty()
    }

    /// Drop armed sources no live frame can reach anymore.
    pub fn prune_stale(&self) {
        let frames = self.runtime.frames().current_frames(None);
        let mut traced = self.traced.lock();
        traced.retain(|source, _| {
            frames
                .iter()
                .any(|frame| frame.unit().source() == source.as_path())
        });
    }

    /// Enter step mode: stop at the next line event anywhere.
    pub fn set_step(&self) {
        *self.mode.lock() = Some(StepMode::Step);
    }

    /// Enter step-over mode: stop at the next line at or above the current
    /// call depth.
    pub fn set_next(&self) {
        *self.mode.lock() = Some(StepMode::Next { depth: 0 });
    }

    /// Leave any step mode.
    pub fn clear_mode(&self) {
        *self.mode.lock() = None;
    }

    /// Whether a step mode is active.
    #[must_use]
    pub fn has_mode(&self) -> bool {
        self.mode.lock().is_some()
    }

    /// Advance the step mode for one trace event.
    pub fn consult(&self, frame: &Arc<Frame>, event: &TraceEvent, sink: &EventSink) -> TraceOutcome {
        let mut mode = self.mode.lock();
        match *mode {
            None => TraceOutcome::Done,
            Some(StepMode::Step) => match event {
                TraceEvent::Call => TraceOutcome::Continue,
                TraceEvent::Line(_) => TraceOutcome::Prompt,
                TraceEvent::Return(value) => {
                    sink.emit(DebugEvent::ReturnValue {
                        unit: frame.unit().name().clone(),
                        value: value.clone(),
                    });
                    TraceOutcome::Continue
                }
            },
            Some(StepMode::Next { depth }) => match event {
                TraceEvent::Call => {
                    *mode = Some(StepMode::Next { depth: depth + 1 });
                    TraceOutcome::Continue
                }
                TraceEvent::Line(_) => {
                    if depth <= 0 {
                        TraceOutcome::Prompt
                    } else {
                        TraceOutcome::Continue
                    }
                }
                TraceEvent::Return(value) => {
                    if depth <= 0 {
                        // Unwinding past the frame stepping started in:
                        // report the value, keep stepping from the caller.
                        sink.emit(DebugEvent::ReturnValue {
                            unit: frame.unit().name().clone(),
                            value: value.clone(),
                        });
                    }
                    *mode = Some(StepMode::Next { depth: depth - 1 });
                    TraceOutcome::Continue
                }
            },
        }
    }

    /// Install `callback` as the process trace function, remembering the one
    /// it displaces. New and already-running threads observe it at their
    /// next event.
    pub fn set_tracing(&self, callback: &TraceFn) {
        if !self.active.swap(true, Ordering::AcqRel) {
            *self.original.lock() = self.runtime.current_trace();
        }
        self.runtime.settrace(Some(Arc::clone(callback)));
        self.runtime.propagate_trace();
    }

    /// Restore the displaced trace function and leave step mode. Idempotent.
    pub fn reset_tracing(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            self.runtime.settrace(self.original.lock().take());
        }
        self.clear_mode();
    }

    /// Whether the controller currently owns the process trace slot.
    #[must_use]
    pub fn is_tracing(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}
