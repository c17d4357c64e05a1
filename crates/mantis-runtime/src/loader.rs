//! Module-loading pipeline.
//!
//! Loading runs in three stages: a registered source is resolved to its top
//! unit; the installed participant (if any) transforms the unit *before* it
//! executes; the unit runs on the calling thread; finally the participant is
//! notified with the finished module. The pre-execution transform stage is
//! the only point where module-entry instrumentation can take effect, since
//! by notification time the top unit has already run.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use smol_str::SmolStr;

use crate::error::RuntimeError;
use crate::interp;
use crate::module::Module;
use crate::runtime::Runtime;
use crate::unit::CompiledUnit;
use crate::value::Value;

/// A registered but not yet loaded module.
#[derive(Debug)]
pub struct PendingModule {
    pub(crate) origin: PathBuf,
    pub(crate) unit: Arc<CompiledUnit>,
}

/// The seam the debugger's watchdog occupies in the loading pipeline. At most
/// one participant is installed at a time, foremost in the pipeline.
pub trait LoaderParticipant: Send + Sync {
    /// Called once a module has finished loading and executing its top unit.
    fn after_load(&self, module: &Arc<Module>);

    /// Applied to a module's top unit before it executes for the first time.
    fn transform(&self, unit: Arc<CompiledUnit>) -> Arc<CompiledUnit>;
}

impl Runtime {
    /// Register a module source for later loading.
    pub fn register_module_source(
        &self,
        name: impl Into<SmolStr>,
        origin: impl Into<PathBuf>,
        unit: Arc<CompiledUnit>,
    ) {
        self.sources.write().insert(
            name.into(),
            PendingModule {
                origin: origin.into(),
                unit,
            },
        );
    }

    /// Install `participant` as the foremost module-resolution participant.
    ///
    /// # Errors
    /// Fails if a participant is already installed.
    pub fn install_participant(
        &self,
        participant: Arc<dyn LoaderParticipant>,
    ) -> Result<(), RuntimeError> {
        let mut slot = self.participant.write();
        if slot.is_some() {
            return Err(RuntimeError::ParticipantInstalled);
        }
        *slot = Some(participant);
        Ok(())
    }

    /// Remove the installed participant.
    ///
    /// # Errors
    /// Fails if none is installed.
    pub fn uninstall_participant(&self) -> Result<(), RuntimeError> {
        let mut slot = self.participant.write();
        if slot.take().is_none() {
            return Err(RuntimeError::ParticipantMissing);
        }
        Ok(())
    }

    fn current_participant(&self) -> Option<Arc<dyn LoaderParticipant>> {
        self.participant.read().clone()
    }

    /// Load a registered module, executing its top unit on the calling
    /// thread. Returns the existing module when already loaded.
    ///
    /// # Errors
    /// Fails when no source is registered under `name` or execution fails.
    pub fn load(self: &Arc<Self>, name: &str) -> Result<Arc<Module>, RuntimeError> {
        self.load_inner(name, false)
    }

    /// Load and execute the program's entry module through the same pipeline,
    /// marking it as the entry module while its top unit runs.
    ///
    /// # Errors
    /// Fails when no source is registered under `name` or execution fails.
    pub fn run_entry(self: &Arc<Self>, name: &str) -> Result<Arc<Module>, RuntimeError> {
        self.load_inner(name, true)
    }

    fn load_inner(self: &Arc<Self>, name: &str, is_entry: bool) -> Result<Arc<Module>, RuntimeError> {
        if let Some(existing) = self.modules.get(name) {
            return Ok(existing);
        }
        let (origin, unit) = {
            let sources = self.sources.read();
            let pending = sources
                .get(name)
                .ok_or_else(|| RuntimeError::UndefinedModule(name.into()))?;
            (pending.origin.clone(), Arc::clone(&pending.unit))
        };

        let participant = self.current_participant();
        let unit = match &participant {
            Some(participant) => participant.transform(unit),
            None => unit,
        };

        let module = Module::new(name, origin, Arc::clone(&unit));
        // The module is visible in the table while its top unit executes,
        // matching how a partially initialised module can be observed.
        self.modules.insert(Arc::clone(&module));
        if is_entry {
            *self.entry.write() = Some(Arc::clone(&module));
            self.entry_running.store(true, Ordering::Release);
        }

        let result = interp::run(self, &module, &unit, None);

        if is_entry {
            self.entry_running.store(false, Ordering::Release);
        }
        result?;

        if let Some(participant) = participant {
            participant.after_load(&module);
        }
        tracing::debug!(module = name, "module loaded");
        Ok(module)
    }

    /// Call a module-level function by name on the calling thread.
    ///
    /// # Errors
    /// Fails when the function is unknown or execution fails.
    pub fn call_function(
        self: &Arc<Self>,
        module: &Arc<Module>,
        name: &str,
    ) -> Result<Value, RuntimeError> {
        let function = module
            .function(name)
            .ok_or_else(|| RuntimeError::UndefinedFunction(name.into()))?;
        let unit = function.unit();
        interp::run(self, module, &unit, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Op, UnitBuilder};

    struct Recorder {
        loaded: parking_lot::Mutex<Vec<SmolStr>>,
    }

    impl LoaderParticipant for Recorder {
        fn after_load(&self, module: &Arc<Module>) {
            self.loaded.lock().push(module.name().clone());
        }

        fn transform(&self, unit: Arc<CompiledUnit>) -> Arc<CompiledUnit> {
            unit
        }
    }

    fn trivial_unit(name: &str, source: &str) -> Arc<CompiledUnit> {
        let mut builder = UnitBuilder::new(name, source);
        builder.instr(1, Op::Nop);
        builder.build()
    }

    #[test]
    fn load_registers_module_and_notifies_participant() {
        let runtime = Runtime::new();
        let recorder = Arc::new(Recorder {
            loaded: parking_lot::Mutex::new(Vec::new()),
        });
        runtime.install_participant(recorder.clone()).unwrap();
        runtime.register_module_source("app", "/proj/app.mt", trivial_unit("app", "/proj/app.mt"));

        let module = runtime.load("app").unwrap();
        assert_eq!(module.name(), "app");
        assert!(runtime.modules().contains("app"));
        assert_eq!(recorder.loaded.lock().as_slice(), &["app"]);

        // A second load returns the cached module without re-running hooks.
        runtime.load("app").unwrap();
        assert_eq!(recorder.loaded.lock().len(), 1);
    }

    #[test]
    fn second_participant_is_rejected() {
        let runtime = Runtime::new();
        let recorder = || {
            Arc::new(Recorder {
                loaded: parking_lot::Mutex::new(Vec::new()),
            })
        };
        runtime.install_participant(recorder()).unwrap();
        assert_eq!(
            runtime.install_participant(recorder()).unwrap_err(),
            RuntimeError::ParticipantInstalled
        );
        runtime.uninstall_participant().unwrap();
        assert_eq!(
            runtime.uninstall_participant().unwrap_err(),
            RuntimeError::ParticipantMissing
        );
    }

    #[test]
    fn entry_running_flag_brackets_entry_execution() {
        let runtime = Runtime::new();
        runtime.register_module_source("main", "/proj/main.mt", trivial_unit("main", "/proj/main.mt"));
        assert!(!runtime.entry_running());
        let module = runtime.run_entry("main").unwrap();
        assert!(!runtime.entry_running());
        assert_eq!(runtime.entry_module().unwrap().name(), module.name());
    }
}
