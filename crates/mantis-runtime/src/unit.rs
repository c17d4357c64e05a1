//! Compiled units and their constant containers.
//!
//! A [`CompiledUnit`] is the runtime's immutable compiled representation of a
//! function or module body. Nested units (function definitions) live inside the
//! enclosing unit's constant table. The constant table is the substitution
//! point for breakpoint injection: [`replace_unit`] swaps one nested unit for
//! another atomically with respect to concurrent readers.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use smol_str::SmolStr;

use crate::frame::Frame;
use crate::value::Value;

/// Process-unique identity of a compiled unit. Instrumented copies get a fresh
/// id; identity comparisons never alias an old unit with its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(u64);

fn next_unit_id() -> UnitId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    UnitId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Callback embedded by the debugger at an instrumented line.
pub type TrapHook = Arc<dyn Fn(&Arc<Frame>) + Send + Sync>;

/// An entry in a unit's constant table.
#[derive(Clone)]
pub enum Const {
    /// Plain value constant.
    Value(Value),
    /// Nested compiled unit (function body).
    Unit(Arc<CompiledUnit>),
    /// Debugger trap hook installed by instrumentation.
    Hook(TrapHook),
}

impl fmt::Debug for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Const::Unit(unit) => f.debug_tuple("Unit").field(&unit.name()).finish(),
            Const::Hook(_) => f.write_str("Hook(..)"),
        }
    }
}

impl PartialEq for Const {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Const::Value(a), Const::Value(b)) => a == b,
            (Const::Unit(a), Const::Unit(b)) => Arc::ptr_eq(a, b),
            (Const::Hook(a), Const::Hook(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// One instruction with the source line it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    /// Source line of this instruction.
    pub line: u32,
    /// Operation.
    pub op: Op,
}

/// Instruction set. Deliberately small: enough to define functions, move
/// values between locals and the stack, call, return, and carry debugger
/// traps.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// No operation (placeholder statement).
    Nop,
    /// Push a value constant.
    LoadConst(u32),
    /// Push a local variable.
    LoadLocal(SmolStr),
    /// Pop into a local variable.
    StoreLocal(SmolStr),
    /// Bind a function object over the unit in the given constant slot.
    MakeFunction {
        /// Name to bind in the module namespace (may be dotted).
        name: SmolStr,
        /// Constant slot holding the function body unit.
        unit: u32,
    },
    /// Call a module-level function by name, pushing its return value.
    CallFunction(SmolStr),
    /// Invoke the trap hook in the given constant slot.
    Trap(u32),
    /// Return the top of stack (or nil when empty).
    Return,
}

/// Constant container with atomic whole-table substitution.
///
/// Readers take an `Arc` snapshot of the table; [`replace_unit`] installs a
/// fully rebuilt table under the write lock, so a concurrent reader observes
/// either the entirely old or entirely new contents, never a mixture.
#[derive(Debug)]
pub struct ConstTable {
    slots: RwLock<Arc<Vec<Const>>>,
}

impl ConstTable {
    /// Create a table over the given constants.
    #[must_use]
    pub fn new(consts: Vec<Const>) -> Self {
        Self {
            slots: RwLock::new(Arc::new(consts)),
        }
    }

    /// Snapshot of the current table contents.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Const>> {
        Arc::clone(&self.slots.read())
    }

    /// Clone the constant in `slot`, if present.
    #[must_use]
    pub fn get(&self, slot: u32) -> Option<Const> {
        self.slots.read().get(slot as usize).cloned()
    }

    /// Number of constants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Atomic unit-substitution primitive: replace every occurrence of `old`
/// inside `container` with `new`.
///
/// After the call the container is indistinguishable from one that never held
/// `old`. Safe under concurrent read access; see [`ConstTable`].
pub fn replace_unit(container: &ConstTable, old: &Arc<CompiledUnit>, new: &Arc<CompiledUnit>) {
    let mut slots = container.slots.write();
    let rebuilt: Vec<Const> = slots
        .iter()
        .map(|entry| match entry {
            Const::Unit(unit) if unit.id() == old.id() => Const::Unit(Arc::clone(new)),
            other => other.clone(),
        })
        .collect();
    *slots = Arc::new(rebuilt);
}

/// Immutable compiled representation of a function or module body.
#[derive(Debug)]
pub struct CompiledUnit {
    id: UnitId,
    name: SmolStr,
    source: PathBuf,
    first_line: u32,
    code: Vec<Instr>,
    consts: ConstTable,
}

impl CompiledUnit {
    fn new(name: SmolStr, source: PathBuf, code: Vec<Instr>, consts: Vec<Const>) -> Arc<Self> {
        let first_line = code.first().map_or(0, |instr| instr.line);
        Arc::new(Self {
            id: next_unit_id(),
            name,
            source,
            first_line,
            code,
            consts: ConstTable::new(consts),
        })
    }

    /// Process-unique identity.
    #[must_use]
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// Unit name (function name, or the module name for a top unit).
    #[must_use]
    pub fn name(&self) -> &SmolStr {
        &self.name
    }

    /// Resolved source file this unit was compiled from.
    #[must_use]
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// First source line of the unit.
    #[must_use]
    pub fn first_line(&self) -> u32 {
        self.first_line
    }

    /// Instruction stream.
    #[must_use]
    pub fn code(&self) -> &[Instr] {
        &self.code
    }

    /// Constant container.
    #[must_use]
    pub fn consts(&self) -> &ConstTable {
        &self.consts
    }

    /// Lines at which this unit starts an instruction, in code order.
    ///
    /// Not every source line is an instruction boundary; blank and comment
    /// lines never appear here.
    pub fn line_starts(&self) -> impl Iterator<Item = u32> + '_ {
        let mut prev = None;
        self.code.iter().filter_map(move |instr| {
            if prev == Some(instr.line) {
                None
            } else {
                prev = Some(instr.line);
                Some(instr.line)
            }
        })
    }

    /// Whether `line` is an instruction boundary of this unit.
    #[must_use]
    pub fn starts_line(&self, line: u32) -> bool {
        self.line_starts().any(|start| start == line)
    }

    /// Build a copy of this unit with new code and constants.
    ///
    /// The copy keeps the name and source but gets a fresh identity; callers
    /// are responsible for substituting it wherever the original is held.
    #[must_use]
    pub fn rebuilt(&self, code: Vec<Instr>, consts: Vec<Const>) -> Arc<Self> {
        let first_line = code.first().map_or(self.first_line, |instr| instr.line);
        Arc::new(Self {
            id: next_unit_id(),
            name: self.name.clone(),
            source: self.source.clone(),
            first_line,
            code,
            consts: ConstTable::new(consts),
        })
    }
}

/// Breadth-first walk of every unit nested inside `root`, yielding
/// `(unit, parent)` pairs. The root itself is not yielded.
#[must_use]
pub fn collect_units(root: &Arc<CompiledUnit>) -> Vec<(Arc<CompiledUnit>, Arc<CompiledUnit>)> {
    let mut pairs = Vec::new();
    let mut queue = VecDeque::from([Arc::clone(root)]);
    while let Some(parent) = queue.pop_front() {
        for entry in parent.consts().snapshot().iter() {
            if let Const::Unit(unit) = entry {
                queue.push_back(Arc::clone(unit));
                pairs.push((Arc::clone(unit), Arc::clone(&parent)));
            }
        }
    }
    pairs
}

/// Incremental builder for compiled units, used by tests and module sources.
#[derive(Debug)]
pub struct UnitBuilder {
    name: SmolStr,
    source: PathBuf,
    code: Vec<Instr>,
    consts: Vec<Const>,
}

impl UnitBuilder {
    /// Start a unit with the given name and source path.
    #[must_use]
    pub fn new(name: impl Into<SmolStr>, source: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            code: Vec::new(),
            consts: Vec::new(),
        }
    }

    /// Intern a value constant, returning its slot.
    pub fn const_value(&mut self, value: Value) -> u32 {
        self.consts.push(Const::Value(value));
        u32::try_from(self.consts.len() - 1).unwrap_or(u32::MAX)
    }

    /// Intern a nested unit constant, returning its slot.
    pub fn const_unit(&mut self, unit: Arc<CompiledUnit>) -> u32 {
        self.consts.push(Const::Unit(unit));
        u32::try_from(self.consts.len() - 1).unwrap_or(u32::MAX)
    }

    /// Append an instruction at the given line.
    pub fn instr(&mut self, line: u32, op: Op) -> &mut Self {
        self.code.push(Instr { line, op });
        self
    }

    /// Finish the unit.
    #[must_use]
    pub fn build(self) -> Arc<CompiledUnit> {
        CompiledUnit::new(self.name, self.source, self.code, self.consts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_with_lines(lines: &[u32]) -> Arc<CompiledUnit> {
        let mut builder = UnitBuilder::new("u", "/t/u.mt");
        for line in lines {
            builder.instr(*line, Op::Nop);
        }
        builder.build()
    }

    #[test]
    fn line_starts_skip_repeated_lines() {
        let unit = unit_with_lines(&[1, 1, 2, 2, 4]);
        assert_eq!(unit.line_starts().collect::<Vec<_>>(), vec![1, 2, 4]);
        assert!(unit.starts_line(2));
        assert!(!unit.starts_line(3));
    }

    #[test]
    fn collect_units_walks_nested_tables() {
        let inner = unit_with_lines(&[5]);
        let mid = {
            let mut builder = UnitBuilder::new("mid", "/t/u.mt");
            let slot = builder.const_unit(Arc::clone(&inner));
            builder.instr(3, Op::MakeFunction {
                name: "inner".into(),
                unit: slot,
            });
            builder.build()
        };
        let top = {
            let mut builder = UnitBuilder::new("top", "/t/u.mt");
            let slot = builder.const_unit(Arc::clone(&mid));
            builder.instr(1, Op::MakeFunction {
                name: "mid".into(),
                unit: slot,
            });
            builder.build()
        };

        let pairs = collect_units(&top);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0.id(), mid.id());
        assert_eq!(pairs[0].1.id(), top.id());
        assert_eq!(pairs[1].0.id(), inner.id());
        assert_eq!(pairs[1].1.id(), mid.id());
    }

    #[test]
    fn replace_unit_swaps_every_occurrence() {
        let old = unit_with_lines(&[2]);
        let new = old.rebuilt(old.code().to_vec(), old.consts().snapshot().to_vec());
        let table = ConstTable::new(vec![
            Const::Unit(Arc::clone(&old)),
            Const::Value(Value::Int(7)),
            Const::Unit(Arc::clone(&old)),
        ]);

        let before = table.snapshot();
        replace_unit(&table, &old, &new);

        for entry in table.snapshot().iter() {
            if let Const::Unit(unit) = entry {
                assert_eq!(unit.id(), new.id());
            }
        }
        // The pre-swap snapshot still sees the fully-old table.
        assert!(matches!(&before[0], Const::Unit(unit) if unit.id() == old.id()));
    }
}
