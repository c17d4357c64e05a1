//! Breakpoint registry.
//!
//! The registry owns every requested breakpoint, its user-facing number, its
//! condition, and its installation bookkeeping. Numbers are small positive
//! integers; a cleared breakpoint returns its number to a free pool and the
//! smallest free number is always handed out next.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::breakpoint::model::{Breakpoint, BreakpointCondition};
use crate::error::DebugError;
use crate::watchdog::{HookId, TransformerId};

/// One registered breakpoint.
#[derive(Debug)]
pub struct BreakpointRegistryEntry {
    breakpoint: Breakpoint,
    number: u32,
    condition: Option<BreakpointCondition>,
    installed: bool,
    enabled: bool,
    hook: Option<HookId>,
    transformer: Option<TransformerId>,
}

impl BreakpointRegistryEntry {
    /// The breakpoint as currently resolved. A function breakpoint is
    /// replaced here by its resolved line breakpoint at install time.
    #[must_use]
    pub fn breakpoint(&self) -> &Breakpoint {
        &self.breakpoint
    }

    /// User-facing breakpoint number.
    #[must_use]
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Current condition, if any.
    #[must_use]
    pub fn condition(&self) -> Option<&BreakpointCondition> {
        self.condition.as_ref()
    }

    /// Whether the breakpoint has been injected (or armed via tracing).
    #[must_use]
    pub fn installed(&self) -> bool {
        self.installed
    }

    /// Whether hits should interrupt.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Pending watchdog hook, when installation awaits a module load.
    #[must_use]
    pub fn hook(&self) -> Option<HookId> {
        self.hook
    }

    /// Pending pre-execution transformer, for module-entry breakpoints.
    #[must_use]
    pub fn transformer(&self) -> Option<TransformerId> {
        self.transformer
    }
}

/// Outcome of [`BreakpointRegistry::register`] when it does not fail.
#[derive(Debug, PartialEq, Eq)]
pub enum Registered {
    /// A new entry was created with this number; installation should follow.
    New(u32),
    /// The breakpoint already existed and only its condition changed; no
    /// installation work is needed.
    ConditionUpdated {
        /// Number of the existing entry.
        number: u32,
        /// Whether the condition was removed rather than replaced.
        cleared: bool,
    },
}

/// Registry of requested breakpoints, keyed by breakpoint value.
///
/// When a function breakpoint is resolved, the entry's breakpoint is
/// replaced in place by the line breakpoint but the original request stays
/// the map key; an alias records the resolved identity so hook callbacks
/// looking up the line form still find the entry.
#[derive(Debug, Default)]
pub struct BreakpointRegistry {
    entries: IndexMap<Breakpoint, BreakpointRegistryEntry>,
    aliases: FxHashMap<Breakpoint, Breakpoint>,
    free: BinaryHeap<Reverse<u32>>,
}

impl BreakpointRegistry {
    fn key(&self, breakpoint: &Breakpoint) -> Breakpoint {
        self.aliases
            .get(breakpoint)
            .unwrap_or(breakpoint)
            .clone()
    }

    fn next_number(&mut self) -> u32 {
        match self.free.pop() {
            Some(Reverse(number)) => number,
            None => u32::try_from(self.entries.len()).unwrap_or(u32::MAX - 1) + 1,
        }
    }

    /// Register `breakpoint`, or update the condition of an existing entry.
    ///
    /// # Errors
    /// Fails when the breakpoint is already registered with an identical
    /// condition.
    pub fn register(
        &mut self,
        breakpoint: Breakpoint,
        condition: Option<BreakpointCondition>,
    ) -> Result<Registered, DebugError> {
        let key = self.key(&breakpoint);
        if let Some(entry) = self.entries.get_mut(&key) {
            if entry.condition == condition {
                return Err(DebugError::AlreadyRegistered(entry.breakpoint.clone()));
            }
            let cleared = condition.is_none();
            entry.condition = condition;
            return Ok(Registered::ConditionUpdated {
                number: entry.number,
                cleared,
            });
        }

        let number = self.next_number();
        self.entries.insert(
            breakpoint.clone(),
            BreakpointRegistryEntry {
                breakpoint,
                number,
                condition,
                installed: false,
                enabled: true,
                hook: None,
                transformer: None,
            },
        );
        Ok(Registered::New(number))
    }

    /// Remove the entry with this number, returning it. Its number goes back
    /// to the free pool.
    ///
    /// # Errors
    /// Fails when no entry carries the number.
    pub fn unregister(&mut self, number: u32) -> Result<BreakpointRegistryEntry, DebugError> {
        let key = self
            .entries
            .iter()
            .find(|(_, entry)| entry.number == number)
            .map(|(key, _)| key.clone())
            .ok_or(DebugError::UnknownBreakpoint(number))?;
        // shift_remove keeps the remaining entries in registration order.
        let entry = self
            .entries
            .shift_remove(&key)
            .ok_or(DebugError::UnknownBreakpoint(number))?;
        self.aliases.retain(|_, original| *original != key);
        self.free.push(Reverse(number));
        Ok(entry)
    }

    /// Replace an entry's breakpoint in place (function-to-line resolution),
    /// keeping number, condition, and bookkeeping. The resolved form becomes
    /// an alias of the original key.
    pub fn replace_breakpoint(&mut self, original: &Breakpoint, resolved: Breakpoint) {
        let key = self.key(original);
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.breakpoint = resolved.clone();
            if resolved != key {
                self.aliases.insert(resolved, key);
            }
        }
    }

    /// Whether the breakpoint (under either identity) is registered.
    #[must_use]
    pub fn contains(&self, breakpoint: &Breakpoint) -> bool {
        self.entries.contains_key(&self.key(breakpoint))
    }

    /// Look up an entry by breakpoint.
    #[must_use]
    pub fn get(&self, breakpoint: &Breakpoint) -> Option<&BreakpointRegistryEntry> {
        self.entries.get(&self.key(breakpoint))
    }

    /// Look up an entry by number.
    #[must_use]
    pub fn by_number(&self, number: u32) -> Option<&BreakpointRegistryEntry> {
        self.entries.values().find(|entry| entry.number == number)
    }

    /// Number of the entry for `breakpoint`, if registered.
    #[must_use]
    pub fn entry_number(&self, breakpoint: &Breakpoint) -> Option<u32> {
        self.get(breakpoint).map(BreakpointRegistryEntry::number)
    }

    /// Mark the entry installed.
    pub fn mark_installed(&mut self, breakpoint: &Breakpoint) {
        let key = self.key(breakpoint);
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.installed = true;
        }
    }

    /// Record or clear the entry's pending watchdog hook.
    pub fn set_hook(&mut self, breakpoint: &Breakpoint, hook: Option<HookId>) {
        let key = self.key(breakpoint);
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.hook = hook;
        }
    }

    /// Record or clear the entry's pending transformer.
    pub fn set_transformer(&mut self, breakpoint: &Breakpoint, transformer: Option<TransformerId>) {
        let key = self.key(breakpoint);
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.transformer = transformer;
        }
    }

    /// All entries, sorted by number.
    #[must_use]
    pub fn entries(&self) -> Vec<&BreakpointRegistryEntry> {
        let mut all: Vec<_> = self.entries.values().collect();
        all.sort_by_key(|entry| entry.number);
        all
    }

    /// All registered numbers, ascending.
    #[must_use]
    pub fn numbers(&self) -> Vec<u32> {
        let mut numbers: Vec<_> = self.entries.values().map(|entry| entry.number).collect();
        numbers.sort_unstable();
        numbers
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::model::{FunctionBreakpoint, LineBreakpoint};

    fn line(line_no: i64) -> Breakpoint {
        Breakpoint::Line(LineBreakpoint::new("/p/mod.mt", line_no))
    }

    #[test]
    fn numbers_reuse_smallest_free() {
        let mut registry = BreakpointRegistry::default();
        assert_eq!(registry.register(line(1), None).unwrap(), Registered::New(1));
        assert_eq!(registry.register(line(2), None).unwrap(), Registered::New(2));
        assert_eq!(registry.register(line(3), None).unwrap(), Registered::New(3));

        registry.unregister(2).unwrap();
        registry.unregister(1).unwrap();
        assert_eq!(registry.register(line(4), None).unwrap(), Registered::New(1));
        assert_eq!(registry.register(line(5), None).unwrap(), Registered::New(2));
        assert_eq!(registry.register(line(6), None).unwrap(), Registered::New(4));
        assert_eq!(registry.numbers(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn duplicate_registration_updates_condition_or_fails() {
        let mut registry = BreakpointRegistry::default();
        let cond = BreakpointCondition::parse("a == 1").unwrap();
        registry.register(line(3), Some(cond.clone())).unwrap();

        assert_eq!(
            registry.register(line(3), Some(cond)).unwrap_err(),
            DebugError::AlreadyRegistered(line(3).clone())
        );
        assert_eq!(
            registry.register(line(3), None).unwrap(),
            Registered::ConditionUpdated {
                number: 1,
                cleared: true
            }
        );
        assert_eq!(
            registry.register(line(3), None).unwrap_err(),
            DebugError::AlreadyRegistered(line(3).clone())
        );
    }

    #[test]
    fn resolved_breakpoint_is_reachable_under_both_identities() {
        let mut registry = BreakpointRegistry::default();
        let requested = Breakpoint::Function(FunctionBreakpoint::new("app", "handler"));
        registry.register(requested.clone(), None).unwrap();

        let resolved = line(7);
        registry.replace_breakpoint(&requested, resolved.clone());
        assert!(registry.contains(&requested));
        assert!(registry.contains(&resolved));
        assert_eq!(registry.entry_number(&resolved), Some(1));
        assert_eq!(
            registry.get(&requested).unwrap().breakpoint(),
            &resolved
        );

        registry.mark_installed(&resolved);
        assert!(registry.get(&requested).unwrap().installed());

        let entry = registry.unregister(1).unwrap();
        assert_eq!(entry.breakpoint(), &resolved);
        assert!(!registry.contains(&resolved));
        assert!(!registry.contains(&requested));
    }
}
