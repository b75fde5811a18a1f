//! Machine-independent instruction records and the emission buffer.
//!
//! The code generator never produces encoded bytes; it appends [`Instr`]
//! records to an [`Asm`] buffer and addresses positions through symbolic
//! [`Label`]s. A later link step resolves every label to an address:
//! code labels resolve to `8 * instruction_index`, data labels resolve to a
//! byte offset inside the context's constant-data region. Both address
//! spaces are 8-aligned, so a resolved address stored in a register or a
//! closure slot reads as a fixnum and is ignored by the collector.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;

use crate::runtime::context::ContextLayout;

/// A physical register of the abstract machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Reg(pub u8);

/// A symbolic code or data address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Label(pub u32);

/// Register conventions.
///
/// - `CTX`: context base address, set once at entry and never written after.
///   The context sits at address zero, so `CTX` doubles as a zero source.
/// - `RES`: expression result / callee value at dispatch points
/// - `NARGS`: raw (untagged) argument count, live at every entry point
/// - `SELF`: the active closure
/// - `CONT`: continuation address (CPS calling convention)
/// - `TMP0..TMP2`: code-generator scratch, never live across a statement
/// - `ARG0..ARG2`: the first three call arguments; the rest go to locals
/// - `GPR_FIRST..=GPR_LAST`: the allocator's general-purpose pool
pub mod regs {
    use super::Reg;

    pub const CTX: Reg = Reg(0);
    pub const RES: Reg = Reg(1);
    pub const NARGS: Reg = Reg(2);
    pub const SELF: Reg = Reg(3);
    pub const CONT: Reg = Reg(4);
    pub const TMP0: Reg = Reg(5);
    pub const TMP1: Reg = Reg(6);
    pub const TMP2: Reg = Reg(7);
    pub const ARG0: Reg = Reg(8);
    pub const ARG1: Reg = Reg(9);
    pub const ARG2: Reg = Reg(10);
    pub const GPR_FIRST: u8 = 11;
    pub const GPR_LAST: u8 = 25;

    pub const NUM_REGS: usize = 26;
    /// How many call arguments travel in registers.
    pub const ARG_REG_COUNT: usize = 3;

    pub const ARG_REGS: [Reg; ARG_REG_COUNT] = [ARG0, ARG1, ARG2];
}

/// Branch condition, signed comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// One abstract machine instruction.
///
/// Memory operands address the context arena: `mem[base + offset]` reads a
/// 64-bit little-endian word. `F*` variants reinterpret their operands as
/// IEEE-754 doubles. Control transfers use code addresses
/// (`8 * instruction_index`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Instr {
    /// Binds a code label at this position. Executes as a no-op.
    Label(Label),
    Nop,

    Mov { dst: Reg, src: Reg },
    MovImm { dst: Reg, imm: u64 },
    /// dst = resolved address of `label`.
    LoadLabel { dst: Reg, label: Label },

    Load { dst: Reg, base: Reg, offset: i32 },
    Store { src: Reg, base: Reg, offset: i32 },
    /// dst = mem[base + index], index in bytes.
    LoadIdx { dst: Reg, base: Reg, index: Reg },
    StoreIdx { src: Reg, base: Reg, index: Reg },

    Add { dst: Reg, a: Reg, b: Reg },
    AddImm { dst: Reg, a: Reg, imm: i64 },
    Sub { dst: Reg, a: Reg, b: Reg },
    Mul { dst: Reg, a: Reg, b: Reg },
    /// Signed division; generated code guards the zero divisor.
    Div { dst: Reg, a: Reg, b: Reg },
    Rem { dst: Reg, a: Reg, b: Reg },

    And { dst: Reg, a: Reg, b: Reg },
    AndImm { dst: Reg, a: Reg, imm: u64 },
    Or { dst: Reg, a: Reg, b: Reg },
    OrImm { dst: Reg, a: Reg, imm: u64 },
    Xor { dst: Reg, a: Reg, b: Reg },
    Shl { dst: Reg, a: Reg, amount: u8 },
    /// Logical right shift.
    Shr { dst: Reg, a: Reg, amount: u8 },
    /// Arithmetic right shift.
    Sar { dst: Reg, a: Reg, amount: u8 },

    FAdd { dst: Reg, a: Reg, b: Reg },
    FSub { dst: Reg, a: Reg, b: Reg },
    FMul { dst: Reg, a: Reg, b: Reg },
    FDiv { dst: Reg, a: Reg, b: Reg },
    /// dst = bit pattern of `a` (signed integer) converted to a double.
    Itof { dst: Reg, a: Reg },
    /// dst = double bit pattern in `a`, truncated to a signed integer.
    Ftoi { dst: Reg, a: Reg },

    Jmp { target: Label },
    JmpReg { target: Reg },
    Jcc { cond: Cond, a: Reg, b: Reg, target: Label },
    JccImm { cond: Cond, a: Reg, imm: i64, target: Label },
    /// Compare operands as doubles.
    FJcc { cond: Cond, a: Reg, b: Reg, target: Label },

    /// Call into the foreign-function registry. Raw arguments travel in the
    /// argument registers, the raw result comes back in `RES`.
    ForeignCall { index: u32 },

    /// Stop execution; `RES` holds the program result.
    Halt,

    /// Labeled constant data, copied into the context's constant region at
    /// load time. The label resolves to the region address of `words[0]`.
    Data { label: Label, words: Vec<u64> },
}

/// Shared label allocator. A single atomic counter partitions labels across
/// parallel per-form code generation without an offset-merge step.
#[derive(Debug, Default)]
pub struct LabelAlloc {
    next: AtomicU32,
}

impl LabelAlloc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&self) -> Label {
        Label(self.next.fetch_add(1, Ordering::Relaxed))
    }

    pub fn count(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }
}

/// An append-only instruction buffer.
pub struct Asm<'a> {
    labels: &'a LabelAlloc,
    instrs: Vec<Instr>,
}

impl<'a> Asm<'a> {
    pub fn new(labels: &'a LabelAlloc) -> Self {
        Self {
            labels,
            instrs: Vec::new(),
        }
    }

    pub fn fresh_label(&self) -> Label {
        self.labels.fresh()
    }

    pub fn push(&mut self, instr: Instr) {
        self.instrs.push(instr);
    }

    /// Binds `label` at the current position.
    pub fn bind(&mut self, label: Label) {
        self.instrs.push(Instr::Label(label));
    }

    /// Pads with no-ops so the next instruction index is a multiple of
    /// `boundary`. Entry labels are bound on aligned positions.
    pub fn align(&mut self, boundary: usize) {
        while self.instrs.len() % boundary != 0 {
            self.instrs.push(Instr::Nop);
        }
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn extend(&mut self, other: Asm<'_>) {
        self.instrs.extend(other.instrs);
    }

    pub fn into_instrs(self) -> Vec<Instr> {
        self.instrs
    }
}

/// Label resolution output: a dense label-id → address table plus the
/// constant-data image placed in the context region.
pub struct Linked {
    /// Indexed by `Label.0`; unresolved labels hold `u64::MAX`.
    pub label_addr: Vec<u64>,
    /// (region byte offset, words) pairs to copy into the constant region.
    pub data: Vec<(u64, Vec<u64>)>,
    /// Total constant-data bytes.
    pub data_bytes: u64,
}

impl Linked {
    pub fn addr_of(&self, label: Label) -> Option<u64> {
        match self.label_addr.get(label.0 as usize) {
            Some(&a) if a != u64::MAX => Some(a),
            _ => None,
        }
    }
}

/// Resolve every label in `instrs`. Code labels get `8 * index`; data labels
/// get `layout.fmt_base + running_offset`.
pub fn link(instrs: &[Instr], label_count: u32, layout: &ContextLayout) -> Linked {
    let mut label_addr = vec![u64::MAX; label_count as usize];
    let mut data = Vec::new();
    let mut data_off = 0u64;

    for (index, instr) in instrs.iter().enumerate() {
        match instr {
            Instr::Label(label) => {
                label_addr[label.0 as usize] = 8 * index as u64;
            }
            Instr::Data { label, words } => {
                label_addr[label.0 as usize] = layout.fmt_base + data_off;
                data.push((layout.fmt_base + data_off, words.clone()));
                data_off += 8 * words.len() as u64;
            }
            _ => {}
        }
    }

    Linked {
        label_addr,
        data,
        data_bytes: data_off,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerOptions;

    #[test]
    fn test_label_alloc_is_monotonic() {
        let alloc = LabelAlloc::new();
        let a = alloc.fresh();
        let b = alloc.fresh();
        assert_ne!(a, b);
        assert_eq!(alloc.count(), 2);
    }

    #[test]
    fn test_align_pads_with_nops() {
        let alloc = LabelAlloc::new();
        let mut asm = Asm::new(&alloc);
        asm.push(Instr::Halt);
        asm.align(4);
        assert_eq!(asm.len(), 4);
        asm.align(4);
        assert_eq!(asm.len(), 4);
    }

    #[test]
    fn test_link_resolves_code_and_data() {
        let options = CompilerOptions::default();
        let layout = ContextLayout::new(&options, 64);
        let alloc = LabelAlloc::new();
        let code = alloc.fresh();
        let blob = alloc.fresh();
        let mut asm = Asm::new(&alloc);
        asm.push(Instr::Nop);
        asm.bind(code);
        asm.push(Instr::Halt);
        asm.push(Instr::Data {
            label: blob,
            words: vec![1, 2, 3],
        });
        let instrs = asm.into_instrs();
        let linked = link(&instrs, alloc.count(), &layout);
        assert_eq!(linked.addr_of(code), Some(8));
        assert_eq!(linked.addr_of(blob), Some(layout.fmt_base));
        assert_eq!(linked.data_bytes, 24);
    }
}
