//! Global-variable slot allocation.
//!
//! One walk over the program assigns every top-level `define` the next
//! global slot and pre-initializes the corresponding context word to the
//! reserved sentinel, so the collector can scan globals that are defined
//! but not yet assigned. Bindings are recorded up front so forward
//! references inside mutually recursive definitions resolve. Variable
//! references that miss every environment at code-generation time allocate
//! a fresh slot lazily (unallocated sentinel), preserving REPL-style late
//! binding.

use std::collections::HashMap;

use crate::compiler::ast::{Expr, Program};
use crate::runtime::layout::Word;

#[derive(Debug)]
pub struct GlobalTable {
    slots: HashMap<String, u32>,
    image: Vec<u64>,
    capacity: u32,
}

impl GlobalTable {
    pub fn new(capacity: u32) -> GlobalTable {
        GlobalTable {
            slots: HashMap::new(),
            image: Vec::new(),
            capacity,
        }
    }

    /// Walk the program and allocate a reserved slot for every top-level
    /// define, including defines grouped under a top-level `begin`.
    pub fn allocate_defines(&mut self, program: &Program) -> Result<(), String> {
        fn walk(table: &mut GlobalTable, expr: &Expr) -> Result<(), String> {
            match expr {
                Expr::Define { name, .. } => {
                    table.define(name)?;
                }
                Expr::Begin(body) => {
                    for e in body {
                        walk(table, e)?;
                    }
                }
                _ => {}
            }
            Ok(())
        }
        for form in &program.forms {
            walk(self, form)?;
        }
        Ok(())
    }

    /// Allocate (or return) the slot for a top-level definition.
    pub fn define(&mut self, name: &str) -> Result<u32, String> {
        if let Some(&slot) = self.slots.get(name) {
            self.image[slot as usize] = Word::RESERVED.0;
            return Ok(slot);
        }
        let slot = self.push(name, Word::RESERVED.0)?;
        Ok(slot)
    }

    /// Allocate a slot lazily for a reference that missed every
    /// environment; the slot stays unallocated until something assigns it.
    pub fn allocate_lazy(&mut self, name: &str) -> Result<u32, String> {
        if let Some(&slot) = self.slots.get(name) {
            return Ok(slot);
        }
        self.push(name, Word::UNALLOCATED.0)
    }

    fn push(&mut self, name: &str, init: u64) -> Result<u32, String> {
        let slot = self.image.len() as u32;
        if slot >= self.capacity {
            return Err(format!(
                "too many global slots: `{}` would exceed the budget of {}",
                name, self.capacity
            ));
        }
        self.slots.insert(name.to_string(), slot);
        self.image.push(init);
        Ok(slot)
    }

    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.slots.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.slots.keys()
    }

    /// Initial global words, in slot order.
    pub fn image(&self) -> &[u64] {
        &self.image
    }

    pub fn len(&self) -> usize {
        self.image.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defines_get_sequential_reserved_slots() {
        let program = Program {
            forms: vec![
                Expr::Define {
                    name: "a".into(),
                    value: Box::new(Expr::Fixnum(1)),
                },
                Expr::Begin(vec![Expr::Define {
                    name: "b".into(),
                    value: Box::new(Expr::Fixnum(2)),
                }]),
            ],
        };
        let mut table = GlobalTable::new(16);
        table.allocate_defines(&program).unwrap();
        assert_eq!(table.lookup("a"), Some(0));
        assert_eq!(table.lookup("b"), Some(1));
        assert_eq!(table.image(), &[Word::RESERVED.0, Word::RESERVED.0]);
    }

    #[test]
    fn test_lazy_slot_is_unallocated() {
        let mut table = GlobalTable::new(16);
        let slot = table.allocate_lazy("future").unwrap();
        assert_eq!(table.image()[slot as usize], Word::UNALLOCATED.0);
        // A later define upgrades the same slot to reserved.
        let again = table.define("future").unwrap();
        assert_eq!(again, slot);
        assert_eq!(table.image()[slot as usize], Word::RESERVED.0);
    }

    #[test]
    fn test_capacity_overflow_is_fatal() {
        let mut table = GlobalTable::new(1);
        table.define("a").unwrap();
        assert!(table.define("b").is_err());
    }
}
