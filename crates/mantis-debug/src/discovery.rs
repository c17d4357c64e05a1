//! Unit discovery.
//!
//! Maps source lines to the nested unit that starts an instruction there and
//! every nested unit to its parent, so injection can locate both the target
//! and the constant table to patch. The module's top unit is deliberately
//! absent from the line index: it has no parent container, so its lines are
//! only reachable through the pre-execution transformer.

use std::path::PathBuf;
use std::sync::Arc;

use mantis_runtime::module::Module;
use mantis_runtime::unit::{collect_units, CompiledUnit, UnitId};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::DebugError;

/// Line and parent indexes over one module's nested units.
#[derive(Debug)]
pub struct UnitDiscovery {
    source: PathBuf,
    lines: FxHashMap<i64, Arc<CompiledUnit>>,
    parents: FxHashMap<UnitId, Arc<CompiledUnit>>,
}

impl UnitDiscovery {
    /// Index every unit nested inside `top`.
    #[must_use]
    pub fn index(top: &Arc<CompiledUnit>) -> Self {
        let mut lines = FxHashMap::default();
        let mut parents = FxHashMap::default();
        for (unit, parent) in collect_units(top) {
            for line in unit.line_starts() {
                lines.insert(i64::from(line), Arc::clone(&unit));
            }
            parents.insert(unit.id(), parent);
        }
        Self {
            source: top.source().to_path_buf(),
            lines,
            parents,
        }
    }

    /// The unit starting an instruction at `line`, with its parent.
    ///
    /// # Errors
    /// Fails when no nested unit starts the line.
    pub fn at_line(&self, line: i64) -> Result<(Arc<CompiledUnit>, Arc<CompiledUnit>), DebugError> {
        let unit = self.lines.get(&line).ok_or_else(|| DebugError::NoSuchLine {
            path: self.source.clone(),
            line,
        })?;
        let parent = self
            .parents
            .get(&unit.id())
            .ok_or_else(|| DebugError::NoSuchLine {
                path: self.source.clone(),
                line,
            })?;
        Ok((Arc::clone(unit), Arc::clone(parent)))
    }

    /// Whether any nested unit starts an instruction at `line`.
    #[must_use]
    pub fn has_line(&self, line: i64) -> bool {
        self.lines.contains_key(&line)
    }

    /// Every indexed nested unit, deduplicated by identity.
    #[must_use]
    pub fn units(&self) -> Vec<Arc<CompiledUnit>> {
        let mut seen = FxHashMap::default();
        for unit in self.lines.values() {
            seen.entry(unit.id()).or_insert_with(|| Arc::clone(unit));
        }
        seen.into_values().collect()
    }

    /// Substitute `new` for `old` in the indexes and atomically in the
    /// parent's constant table. Children of `old` are reparented to `new`
    /// (the instrumented copy holds the same child units).
    pub fn replace(&mut self, old: &Arc<CompiledUnit>, new: &Arc<CompiledUnit>) {
        for unit in self.lines.values_mut() {
            if unit.id() == old.id() {
                *unit = Arc::clone(new);
            }
        }
        if let Some(parent) = self.parents.remove(&old.id()) {
            mantis_runtime::unit::replace_unit(parent.consts(), old, new);
            self.parents.insert(new.id(), parent);
        }
        for parent in self.parents.values_mut() {
            if parent.id() == old.id() {
                *parent = Arc::clone(new);
            }
        }
    }
}

/// Process-wide discovery cache, keyed by module origin. Built lazily the
/// first time a module is targeted.
#[derive(Debug, Default)]
pub struct DiscoveryTable {
    inner: Mutex<FxHashMap<PathBuf, UnitDiscovery>>,
}

impl DiscoveryTable {
    /// Run `f` with the (possibly freshly built) discovery for `module`.
    pub fn with<R>(&self, module: &Module, f: impl FnOnce(&mut UnitDiscovery) -> R) -> R {
        let mut table = self.inner.lock();
        let discovery = table
            .entry(module.origin().to_path_buf())
            .or_insert_with(|| UnitDiscovery::index(&module.unit()));
        f(discovery)
    }
}
