//! Process-wide runtime context.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::frame::ThreadFrames;
use crate::interp::TraceFn;
use crate::module::{Module, ModuleTable};

/// Process trace slot. Running interpreter threads re-read the slot at every
/// event, so installing a callback takes effect on already-running threads at
/// their next event.
#[derive(Default)]
struct TraceSlot {
    callback: RwLock<Option<TraceFn>>,
    generation: AtomicU64,
}

/// The runtime context: loaded modules, live frames, the module-loading
/// pipeline, and the process trace slot.
///
/// Constructed once and passed by shared reference to everything that needs
/// it; there is no implicit global instance.
pub struct Runtime {
    pub(crate) modules: ModuleTable,
    pub(crate) frames: ThreadFrames,
    pub(crate) sources: RwLock<rustc_hash::FxHashMap<smol_str::SmolStr, crate::loader::PendingModule>>,
    pub(crate) participant: RwLock<Option<Arc<dyn crate::loader::LoaderParticipant>>>,
    pub(crate) entry: RwLock<Option<Arc<Module>>>,
    pub(crate) entry_running: AtomicBool,
    trace: TraceSlot,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("modules", &self.modules)
            .field("entry_running", &self.entry_running)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Create an empty runtime context.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            modules: ModuleTable::default(),
            frames: ThreadFrames::default(),
            sources: RwLock::new(rustc_hash::FxHashMap::default()),
            participant: RwLock::new(None),
            entry: RwLock::new(None),
            entry_running: AtomicBool::new(false),
            trace: TraceSlot::default(),
        })
    }

    /// The loaded-module table.
    #[must_use]
    pub fn modules(&self) -> &ModuleTable {
        &self.modules
    }

    /// The live-frame registry.
    #[must_use]
    pub fn frames(&self) -> &ThreadFrames {
        &self.frames
    }

    /// The program's entry module, once it has been run.
    #[must_use]
    pub fn entry_module(&self) -> Option<Arc<Module>> {
        self.entry.read().clone()
    }

    /// Whether the entry module is currently executing its top unit.
    #[must_use]
    pub fn entry_running(&self) -> bool {
        self.entry_running.load(Ordering::Acquire)
    }

    /// Install `callback` as the process trace function (`None` detaches).
    pub fn settrace(&self, callback: Option<TraceFn>) {
        *self.trace.callback.write() = callback;
        self.trace.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// The current process trace function, if any.
    #[must_use]
    pub fn current_trace(&self) -> Option<TraceFn> {
        self.trace.callback.read().clone()
    }

    /// Cross-thread trace propagation primitive: make a freshly installed
    /// trace callback observable on every already-running thread, not only
    /// new ones. Interpreters re-read the slot at each event; the generation
    /// bump publishes the store.
    pub fn propagate_trace(&self) {
        self.trace.generation.fetch_add(1, Ordering::AcqRel);
    }
}
