//! Modules, function objects, and the loaded-module table.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smol_str::SmolStr;

use crate::unit::{CompiledUnit, UnitId};

/// A function object: a named, repointable reference to a compiled unit.
///
/// More than one function may share a unit (aliasing, redefinition), and the
/// debugger repoints functions when it swaps an instrumented unit in.
#[derive(Debug)]
pub struct Function {
    name: SmolStr,
    unit: RwLock<Arc<CompiledUnit>>,
}

impl Function {
    /// Create a function over `unit`.
    #[must_use]
    pub fn new(name: impl Into<SmolStr>, unit: Arc<CompiledUnit>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            unit: RwLock::new(unit),
        })
    }

    /// Function name as bound in its module.
    #[must_use]
    pub fn name(&self) -> &SmolStr {
        &self.name
    }

    /// The unit currently serving as this function's body.
    #[must_use]
    pub fn unit(&self) -> Arc<CompiledUnit> {
        Arc::clone(&self.unit.read())
    }

    /// Repoint the function body to a different unit.
    pub fn set_unit(&self, unit: Arc<CompiledUnit>) {
        *self.unit.write() = unit;
    }
}

/// A loaded module: name, resolved origin path, top unit, and namespace.
#[derive(Debug)]
pub struct Module {
    name: SmolStr,
    origin: PathBuf,
    unit: RwLock<Arc<CompiledUnit>>,
    functions: RwLock<FxHashMap<SmolStr, Arc<Function>>>,
}

impl Module {
    /// Create a module around its top compiled unit.
    #[must_use]
    pub fn new(name: impl Into<SmolStr>, origin: impl Into<PathBuf>, unit: Arc<CompiledUnit>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            origin: origin.into(),
            unit: RwLock::new(unit),
            functions: RwLock::new(FxHashMap::default()),
        })
    }

    /// Module name.
    #[must_use]
    pub fn name(&self) -> &SmolStr {
        &self.name
    }

    /// Resolved origin source file of the module.
    #[must_use]
    pub fn origin(&self) -> &Path {
        &self.origin
    }

    /// Top compiled unit.
    #[must_use]
    pub fn unit(&self) -> Arc<CompiledUnit> {
        Arc::clone(&self.unit.read())
    }

    /// Bind a function into the module namespace.
    pub fn bind_function(&self, function: Arc<Function>) {
        self.functions
            .write()
            .insert(function.name().clone(), function);
    }

    /// Look up a function by (possibly dotted) name.
    #[must_use]
    pub fn function(&self, name: &str) -> Option<Arc<Function>> {
        self.functions.read().get(name).cloned()
    }

    /// All bound functions, unordered.
    #[must_use]
    pub fn functions(&self) -> Vec<Arc<Function>> {
        self.functions.read().values().cloned().collect()
    }
}

/// The runtime's loaded-module table, plus a reverse index from unit identity
/// to the function objects whose body it currently is.
///
/// The reverse index is updated on every function creation and rebinding so
/// that replacing a unit never requires a heap scan to find its holders.
#[derive(Debug, Default)]
pub struct ModuleTable {
    modules: RwLock<FxHashMap<SmolStr, Arc<Module>>>,
    by_unit: RwLock<FxHashMap<UnitId, Vec<Weak<Function>>>>,
}

impl ModuleTable {
    pub(crate) fn insert(&self, module: Arc<Module>) {
        self.modules.write().insert(module.name().clone(), module);
    }

    /// Look up a loaded module by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Module>> {
        self.modules.read().get(name).cloned()
    }

    /// Whether a module with this name is loaded.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.modules.read().contains_key(name)
    }

    /// Snapshot of every loaded module.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Module>> {
        self.modules.read().values().cloned().collect()
    }

    /// Record `function` as a holder of its current unit.
    pub fn record_function(&self, function: &Arc<Function>) {
        self.by_unit
            .write()
            .entry(function.unit().id())
            .or_default()
            .push(Arc::downgrade(function));
    }

    /// Every live function whose body is the unit with `id`. Dead references
    /// are pruned as a side effect.
    #[must_use]
    pub fn functions_of(&self, id: UnitId) -> Vec<Arc<Function>> {
        let mut index = self.by_unit.write();
        let Some(holders) = index.get_mut(&id) else {
            return Vec::new();
        };
        let mut live = Vec::new();
        holders.retain(|weak| match weak.upgrade() {
            Some(function) => {
                // A repointed function may linger under a stale id.
                if function.unit().id() == id {
                    live.push(function);
                }
                true
            }
            None => false,
        });
        if holders.is_empty() {
            index.remove(&id);
        }
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Op, UnitBuilder};

    fn leaf_unit(name: &str) -> Arc<CompiledUnit> {
        let mut builder = UnitBuilder::new(name, "/t/m.mt");
        builder.instr(1, Op::Nop);
        builder.build()
    }

    #[test]
    fn reverse_index_tracks_repointed_functions() {
        let table = ModuleTable::default();
        let old = leaf_unit("f");
        let new = leaf_unit("f");

        let func = Function::new("f", Arc::clone(&old));
        table.record_function(&func);
        assert_eq!(table.functions_of(old.id()).len(), 1);

        func.set_unit(Arc::clone(&new));
        table.record_function(&func);
        assert!(table.functions_of(old.id()).is_empty());
        assert_eq!(table.functions_of(new.id()).len(), 1);
    }

    #[test]
    fn dead_functions_are_pruned() {
        let table = ModuleTable::default();
        let unit = leaf_unit("g");
        {
            let func = Function::new("g", Arc::clone(&unit));
            table.record_function(&func);
        }
        assert!(table.functions_of(unit.id()).is_empty());
    }
}
