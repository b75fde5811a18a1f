//! Compile-time environments.
//!
//! After the conversion passes every variable reference resolves to one of
//! three storage kinds: a machine register, a stack-local slot, or a global
//! slot. Register and local entries carry the binding's liveness interval
//! so the allocator can expire them; global entries persist for the process
//! lifetime.

use std::collections::HashMap;

use crate::instr::Reg;

/// The half-open scan-index interval during which a binding's storage must
/// not be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
    pub first: u32,
    pub last: u32,
}

impl LiveRange {
    pub fn new(first: u32, last: u32) -> LiveRange {
        LiveRange { first, last }
    }

    pub fn contains(&self, scan: u32) -> bool {
        self.first <= scan && scan <= self.last
    }
}

/// Where a resolved binding lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Register(Reg),
    Local(u16),
    Global(u32),
}

#[derive(Debug, Clone, Copy)]
pub struct EnvEntry {
    pub slot: Slot,
    pub range: LiveRange,
}

/// Per-function environment. Alpha conversion guarantees unique names, so
/// a flat map suffices; scoping is handled by insert/remove pairs around
/// each binding form.
#[derive(Debug, Default, Clone)]
pub struct Env {
    entries: HashMap<String, EnvEntry>,
}

impl Env {
    pub fn new() -> Env {
        Env::default()
    }

    pub fn insert(&mut self, name: &str, entry: EnvEntry) {
        let previous = self.entries.insert(name.to_string(), entry);
        debug_assert!(
            previous.is_none(),
            "alpha conversion violated: `{}` bound twice",
            name
        );
    }

    pub fn remove(&mut self, name: &str) -> Option<EnvEntry> {
        self.entries.remove(name)
    }

    pub fn lookup(&self, name: &str) -> Option<&EnvEntry> {
        self.entries.get(name)
    }

    /// Entries currently resident in registers or locals, for spilling
    /// around non-tail calls.
    pub fn resident(&self) -> Vec<(String, EnvEntry)> {
        let mut out: Vec<(String, EnvEntry)> = self
            .entries
            .iter()
            .filter(|(_, e)| !matches!(e.slot, Slot::Global(_)))
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::regs;

    #[test]
    fn test_live_range_contains() {
        let r = LiveRange::new(3, 9);
        assert!(!r.contains(2));
        assert!(r.contains(3));
        assert!(r.contains(9));
        assert!(!r.contains(10));
    }

    #[test]
    fn test_resident_excludes_globals() {
        let mut env = Env::new();
        env.insert(
            "a",
            EnvEntry {
                slot: Slot::Register(regs::ARG0),
                range: LiveRange::new(0, 5),
            },
        );
        env.insert(
            "g",
            EnvEntry {
                slot: Slot::Global(2),
                range: LiveRange::new(0, u32::MAX),
            },
        );
        let resident = env.resident();
        assert_eq!(resident.len(), 1);
        assert_eq!(resident[0].0, "a");
    }
}
