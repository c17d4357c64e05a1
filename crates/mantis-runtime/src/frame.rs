//! Execution frames and stack introspection.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smol_str::SmolStr;

use crate::interp::TraceFn;
use crate::module::Module;
use crate::unit::CompiledUnit;
use crate::value::Value;

/// A live execution frame.
///
/// Frames are shared by identity (`Arc`): the executing thread mutates the
/// line, locals, and value stack while the debugger may concurrently read
/// them or attach a frame-local trace callback. A frame keeps the unit it
/// started executing; replacing a unit in its module never retargets frames
/// already running the old one.
pub struct Frame {
    module: Arc<Module>,
    unit: Arc<CompiledUnit>,
    line: AtomicU32,
    locals: Mutex<FxHashMap<SmolStr, Value>>,
    stack: Mutex<Vec<Value>>,
    trace: Mutex<Option<TraceFn>>,
    back: Option<Arc<Frame>>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("unit", self.unit.name())
            .field("line", &self.line)
            .finish_non_exhaustive()
    }
}

impl Frame {
    /// Create a frame for `unit`, chained onto the caller frame.
    #[must_use]
    pub fn new(module: Arc<Module>, unit: Arc<CompiledUnit>, back: Option<Arc<Frame>>) -> Arc<Self> {
        let line = unit.first_line();
        Arc::new(Self {
            module,
            unit,
            line: AtomicU32::new(line),
            locals: Mutex::new(FxHashMap::default()),
            stack: Mutex::new(Vec::new()),
            trace: Mutex::new(None),
            back,
        })
    }

    /// Module this frame executes in.
    #[must_use]
    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    /// Unit this frame is executing (captured at entry).
    #[must_use]
    pub fn unit(&self) -> &Arc<CompiledUnit> {
        &self.unit
    }

    /// Current source line.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.line.load(Ordering::Acquire)
    }

    pub(crate) fn set_line(&self, line: u32) {
        self.line.store(line, Ordering::Release);
    }

    /// Snapshot of the frame's local variables.
    #[must_use]
    pub fn locals(&self) -> FxHashMap<SmolStr, Value> {
        self.locals.lock().clone()
    }

    /// Set a local variable.
    pub fn set_local(&self, name: impl Into<SmolStr>, value: Value) {
        self.locals.lock().insert(name.into(), value);
    }

    /// Read a local variable.
    #[must_use]
    pub fn local(&self, name: &str) -> Option<Value> {
        self.locals.lock().get(name).cloned()
    }

    pub(crate) fn push(&self, value: Value) {
        self.stack.lock().push(value);
    }

    pub(crate) fn pop(&self) -> Option<Value> {
        self.stack.lock().pop()
    }

    /// Caller frame, if any.
    #[must_use]
    pub fn back(&self) -> Option<&Arc<Frame>> {
        self.back.as_ref()
    }

    /// Frame-local trace callback, consulted before the process-wide one.
    #[must_use]
    pub fn trace(&self) -> Option<TraceFn> {
        self.trace.lock().clone()
    }

    /// Attach or detach the frame-local trace callback.
    pub fn set_trace(&self, callback: Option<TraceFn>) {
        *self.trace.lock() = callback;
    }
}

/// Stack introspection primitive: the frame's evaluation-stack contents and
/// depth. A negative depth signals an internal inconsistency; callers report
/// it rather than propagate.
#[must_use]
pub fn read_value_stack(frame: &Frame) -> (Vec<Value>, i64) {
    let stack = frame.stack.lock().clone();
    let depth = i64::try_from(stack.len()).unwrap_or(-1);
    (stack, depth)
}

/// Registry of each live thread's innermost frame.
#[derive(Debug, Default)]
pub struct ThreadFrames {
    tops: Mutex<FxHashMap<ThreadId, Arc<Frame>>>,
}

impl ThreadFrames {
    pub(crate) fn enter(&self, frame: Arc<Frame>) {
        self.tops.lock().insert(thread::current().id(), frame);
    }

    pub(crate) fn exit(&self, frame: &Arc<Frame>) {
        let mut tops = self.tops.lock();
        match frame.back() {
            Some(back) => {
                tops.insert(thread::current().id(), Arc::clone(back));
            }
            None => {
                tops.remove(&thread::current().id());
            }
        }
    }

    /// The calling thread's innermost frame, if it is executing.
    #[must_use]
    pub fn current(&self) -> Option<Arc<Frame>> {
        self.tops.lock().get(&thread::current().id()).cloned()
    }

    /// Walk every frame on every thread's call stack. When `seed` is given,
    /// only that frame's chain is walked. The snapshot is best-effort under
    /// concurrent mutation.
    #[must_use]
    pub fn current_frames(&self, seed: Option<&Arc<Frame>>) -> Vec<Arc<Frame>> {
        let tops: Vec<Arc<Frame>> = match seed {
            Some(frame) => vec![Arc::clone(frame)],
            None => self.tops.lock().values().cloned().collect(),
        };
        let mut frames = Vec::new();
        for top in tops {
            let mut next = Some(top);
            while let Some(frame) = next {
                next = frame.back().cloned();
                frames.push(frame);
            }
        }
        frames
    }
}
