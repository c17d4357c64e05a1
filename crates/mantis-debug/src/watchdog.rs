//! Module load watchdog.
//!
//! A process-scoped loader participant that lets the debugger observe module
//! loads and rewrite top units before they run. Hooks are keyed by resolved
//! origin path or by module name and fire in registration order; registering
//! a hook for an already-loaded module fires it synchronously on the calling
//! thread.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use mantis_runtime::loader::LoaderParticipant;
use mantis_runtime::module::Module;
use mantis_runtime::unit::CompiledUnit;
use mantis_runtime::Runtime;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smol_str::SmolStr;

use crate::error::DebugError;

/// Identity of a registered hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Identity of a registered transformer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransformerId(u64);

fn next_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Hook fired with a module after it finishes loading.
pub type ModuleHook = Arc<dyn Fn(&Arc<Module>) + Send + Sync>;

/// Transformer applied to a module's top unit before it executes.
pub type UnitTransformer = Arc<dyn Fn(Arc<CompiledUnit>) -> Arc<CompiledUnit> + Send + Sync>;

struct RegisteredHook {
    id: HookId,
    hook: ModuleHook,
}

struct RegisteredTransformer {
    id: TransformerId,
    transform: UnitTransformer,
}

/// The watchdog. Installed once into the runtime's loading pipeline; a
/// second install fails, as does uninstalling when absent.
pub struct ModuleWatchdog {
    runtime: Arc<Runtime>,
    origin_hooks: Mutex<IndexMap<PathBuf, Vec<RegisteredHook>>>,
    name_hooks: Mutex<IndexMap<SmolStr, Vec<RegisteredHook>>>,
    transformers: Mutex<IndexMap<PathBuf, Vec<RegisteredTransformer>>>,
    // Lazily rebuilt reverse index; entries are revalidated against the
    // module table before use, so staleness is tolerated.
    by_origin: Mutex<FxHashMap<PathBuf, Weak<Module>>>,
}

impl std::fmt::Debug for ModuleWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleWatchdog").finish_non_exhaustive()
    }
}

impl ModuleWatchdog {
    /// Create the watchdog and install it into the runtime's loader.
    ///
    /// # Errors
    /// Fails when another participant is already installed.
    pub fn install(runtime: Arc<Runtime>) -> Result<Arc<Self>, DebugError> {
        let watchdog = Arc::new(Self {
            runtime: Arc::clone(&runtime),
            origin_hooks: Mutex::new(IndexMap::new()),
            name_hooks: Mutex::new(IndexMap::new()),
            transformers: Mutex::new(IndexMap::new()),
            by_origin: Mutex::new(FxHashMap::default()),
        });
        runtime.install_participant(Arc::clone(&watchdog) as Arc<dyn LoaderParticipant>)?;
        tracing::info!("module watchdog installed");
        Ok(watchdog)
    }

    /// Remove the watchdog from the loading pipeline.
    ///
    /// # Errors
    /// Fails when it is not installed.
    pub fn uninstall(&self) -> Result<(), DebugError> {
        self.runtime.uninstall_participant()?;
        tracing::info!("module watchdog uninstalled");
        Ok(())
    }

    /// Register a hook keyed by resolved origin path. If the module is
    /// already loaded the hook fires synchronously before registration
    /// returns.
    pub fn register_origin_hook(&self, origin: &Path, hook: ModuleHook) -> HookId {
        if let Some(module) = self.get_by_origin(origin) {
            hook(&module);
        }
        let id = HookId(next_id());
        self.origin_hooks
            .lock()
            .entry(origin.to_path_buf())
            .or_default()
            .push(RegisteredHook { id, hook });
        id
    }

    /// Unregister an origin hook by id.
    ///
    /// # Errors
    /// Fails when the id is not registered under `origin`.
    pub fn unregister_origin_hook(&self, origin: &Path, id: HookId) -> Result<(), DebugError> {
        let mut hooks = self.origin_hooks.lock();
        let Some(registered) = hooks.get_mut(origin) else {
            return Err(DebugError::HookNotFound);
        };
        let before = registered.len();
        registered.retain(|hook| hook.id != id);
        if registered.len() == before {
            return Err(DebugError::HookNotFound);
        }
        if registered.is_empty() {
            hooks.shift_remove(origin);
        }
        Ok(())
    }

    /// Register a hook keyed by module name, firing synchronously when the
    /// module is already loaded.
    pub fn register_module_hook(&self, name: &str, hook: ModuleHook) -> HookId {
        if let Some(module) = self.runtime.modules().get(name) {
            hook(&module);
        }
        let id = HookId(next_id());
        self.name_hooks
            .lock()
            .entry(SmolStr::new(name))
            .or_default()
            .push(RegisteredHook { id, hook });
        id
    }

    /// Unregister a module-name hook by id.
    ///
    /// # Errors
    /// Fails when the id is not registered under `name`.
    pub fn unregister_module_hook(&self, name: &str, id: HookId) -> Result<(), DebugError> {
        let mut hooks = self.name_hooks.lock();
        let Some(registered) = hooks.get_mut(name) else {
            return Err(DebugError::HookNotFound);
        };
        let before = registered.len();
        registered.retain(|hook| hook.id != id);
        if registered.len() == before {
            return Err(DebugError::HookNotFound);
        }
        if registered.is_empty() {
            hooks.shift_remove(name);
        }
        Ok(())
    }

    /// Register a pre-execution transformer for modules from `origin`.
    pub fn register_transformer(&self, origin: &Path, transform: UnitTransformer) -> TransformerId {
        let id = TransformerId(next_id());
        self.transformers
            .lock()
            .entry(origin.to_path_buf())
            .or_default()
            .push(RegisteredTransformer { id, transform });
        id
    }

    /// Unregister a transformer by id.
    ///
    /// # Errors
    /// Fails when the id is not registered under `origin`.
    pub fn unregister_transformer(&self, origin: &Path, id: TransformerId) -> Result<(), DebugError> {
        let mut transformers = self.transformers.lock();
        let Some(registered) = transformers.get_mut(origin) else {
            return Err(DebugError::TransformerNotFound);
        };
        let before = registered.len();
        registered.retain(|transformer| transformer.id != id);
        if registered.len() == before {
            return Err(DebugError::TransformerNotFound);
        }
        if registered.is_empty() {
            transformers.shift_remove(origin);
        }
        Ok(())
    }

    /// Find a loaded module by its resolved origin path.
    ///
    /// The weak reverse index answers most lookups; a hit is revalidated
    /// against the module table and the index is rebuilt on a miss. The
    /// entry module is checked explicitly so a lookup during its execution
    /// resolves even under a concurrently mutating table.
    #[must_use]
    pub fn get_by_origin(&self, origin: &Path) -> Option<Arc<Module>> {
        {
            let index = self.by_origin.lock();
            if let Some(module) = index.get(origin).and_then(Weak::upgrade) {
                let still_loaded = self
                    .runtime
                    .modules()
                    .get(module.name())
                    .is_some_and(|current| Arc::ptr_eq(&current, &module));
                if still_loaded {
                    return Some(module);
                }
            }
        }

        let mut index = self.by_origin.lock();
        index.clear();
        let mut found = None;
        for module in self.runtime.modules().all() {
            index.insert(module.origin().to_path_buf(), Arc::downgrade(&module));
            if module.origin() == origin {
                found = Some(module);
            }
        }
        found.or_else(|| {
            self.runtime
                .entry_module()
                .filter(|entry| entry.origin() == origin)
        })
    }
}

impl LoaderParticipant for ModuleWatchdog {
    fn after_load(&self, module: &Arc<Module>) {
        self.by_origin
            .lock()
            .insert(module.origin().to_path_buf(), Arc::downgrade(module));

        // Snapshot the hook lists so a hook can (un)register without
        // deadlocking against the tables.
        let mut hooks: Vec<ModuleHook> = Vec::new();
        {
            let origin_hooks = self.origin_hooks.lock();
            if let Some(registered) = origin_hooks.get(module.origin()) {
                hooks.extend(registered.iter().map(|hook| Arc::clone(&hook.hook)));
            }
        }
        {
            let name_hooks = self.name_hooks.lock();
            if let Some(registered) = name_hooks.get(module.name().as_str()) {
                hooks.extend(registered.iter().map(|hook| Arc::clone(&hook.hook)));
            }
        }
        for hook in hooks {
            hook(module);
        }
    }

    fn transform(&self, unit: Arc<CompiledUnit>) -> Arc<CompiledUnit> {
        let transforms: Vec<UnitTransformer> = {
            let transformers = self.transformers.lock();
            match transformers.get(unit.source()) {
                Some(registered) => registered
                    .iter()
                    .map(|transformer| Arc::clone(&transformer.transform))
                    .collect(),
                None => Vec::new(),
            }
        };
        transforms
            .into_iter()
            .fold(unit, |unit, transform| transform(unit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mantis_runtime::unit::{Op, UnitBuilder};

    fn unit(name: &str, source: &str) -> Arc<CompiledUnit> {
        let mut builder = UnitBuilder::new(name, source);
        builder.instr(1, Op::Nop);
        builder.build()
    }

    #[test]
    fn double_install_fails() {
        let runtime = Runtime::new();
        let watchdog = ModuleWatchdog::install(Arc::clone(&runtime)).unwrap();
        assert!(ModuleWatchdog::install(Arc::clone(&runtime)).is_err());
        watchdog.uninstall().unwrap();
        assert!(watchdog.uninstall().is_err());
    }

    #[test]
    fn hook_on_loaded_module_fires_synchronously() {
        let runtime = Runtime::new();
        let watchdog = ModuleWatchdog::install(Arc::clone(&runtime)).unwrap();
        runtime.register_module_source("app", "/p/app.mt", unit("app", "/p/app.mt"));
        runtime.load("app").unwrap();

        let fired = Arc::new(Mutex::new(0u32));
        let hook: ModuleHook = {
            let fired = Arc::clone(&fired);
            Arc::new(move |_| *fired.lock() += 1)
        };
        watchdog.register_origin_hook(Path::new("/p/app.mt"), Arc::clone(&hook));
        assert_eq!(*fired.lock(), 1);
        watchdog.register_module_hook("app", hook);
        assert_eq!(*fired.lock(), 2);
    }

    #[test]
    fn hooks_fire_in_registration_order_on_load() {
        let runtime = Runtime::new();
        let watchdog = ModuleWatchdog::install(Arc::clone(&runtime)).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in [1, 2, 3] {
            let order = Arc::clone(&order);
            watchdog.register_origin_hook(
                Path::new("/p/app.mt"),
                Arc::new(move |_| order.lock().push(tag)),
            );
        }
        runtime.register_module_source("app", "/p/app.mt", unit("app", "/p/app.mt"));
        runtime.load("app").unwrap();
        assert_eq!(order.lock().as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn unregistering_unknown_ids_fails_and_empty_keys_are_pruned() {
        let runtime = Runtime::new();
        let watchdog = ModuleWatchdog::install(Arc::clone(&runtime)).unwrap();
        let origin = Path::new("/p/app.mt");
        let id = watchdog.register_origin_hook(origin, Arc::new(|_| {}));

        assert_eq!(
            watchdog.unregister_origin_hook(Path::new("/p/other.mt"), id),
            Err(DebugError::HookNotFound)
        );
        watchdog.unregister_origin_hook(origin, id).unwrap();
        // The key is gone entirely, so the id is unknown now.
        assert_eq!(
            watchdog.unregister_origin_hook(origin, id),
            Err(DebugError::HookNotFound)
        );

        let tid = watchdog.register_transformer(origin, Arc::new(|unit| unit));
        watchdog.unregister_transformer(origin, tid).unwrap();
        assert_eq!(
            watchdog.unregister_transformer(origin, tid),
            Err(DebugError::TransformerNotFound)
        );
    }

    #[test]
    fn get_by_origin_survives_a_rebuilt_index() {
        let runtime = Runtime::new();
        let watchdog = ModuleWatchdog::install(Arc::clone(&runtime)).unwrap();
        runtime.register_module_source("app", "/p/app.mt", unit("app", "/p/app.mt"));
        assert!(watchdog.get_by_origin(Path::new("/p/app.mt")).is_none());
        runtime.load("app").unwrap();
        let module = watchdog.get_by_origin(Path::new("/p/app.mt")).unwrap();
        assert_eq!(module.name(), "app");
    }
}
