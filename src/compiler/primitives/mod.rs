//! The primitive library.
//!
//! Every primitive is a generator that appends its body at the current
//! stream position and records two entry labels: `checked` (validates the
//! argument count and tags, raising through the context error handler) and
//! `fast` (assumes well-formed input). Entries expect the standard calling
//! convention: tagged arguments in `ARG0..ARG2` with overflow in the locals
//! region, the raw count in `NARGS`, the return address in `CONT`.
//!
//! Primitive bodies own the general-purpose register pool: caller-resident
//! values are either dead (tail call) or spilled to the value stack before
//! the jump, so the pool is free scratch here. The aliases below fix which
//! scratch register carries which role across the shared stubs.

use std::collections::BTreeMap;

use crate::config::CompilerOptions;
use crate::instr::{regs, Asm, Cond, Instr, Label, Reg};
use crate::runtime::context::ContextLayout;
use crate::runtime::layout::{self, BlockType, ErrorCode, Word};

mod arith;
mod pairs;
mod ports;
mod predicates;
mod strings;
pub(crate) mod vectors;

use crate::compiler::foreign::{self, ForeignDecl};

/// Fold/pairwise accumulator.
pub(crate) const ACC: Reg = Reg(11);
/// Raw argument index for the fetch stub.
pub(crate) const IDX: Reg = Reg(13);
/// Binary-op return address.
pub(crate) const LNK_BIN: Reg = Reg(16);
/// Fetch-stub return address.
pub(crate) const LNK_FETCH: Reg = Reg(17);
/// Comparison-failure exit address.
pub(crate) const FAIL: Reg = Reg(18);
/// Fetched argument value.
pub(crate) const VAL: Reg = Reg(20);
pub(crate) const SCR0: Reg = Reg(21);
pub(crate) const SCR1: Reg = Reg(22);
pub(crate) const SCR2: Reg = Reg(23);

/// Untag mask for block pointers and code addresses.
pub(crate) const UNTAG: u64 = !7u64;
/// Header bits 3..8 select the block type.
pub(crate) const HEADER_TYPE_BITS: u64 = 0b1111_1000;

/// The two entry points of one primitive.
#[derive(Debug, Clone, Copy)]
pub struct PrimEntry {
    pub checked: Label,
    pub fast: Label,
}

/// Name → entry points, plus the stub labels the code generator and the
/// lambda prologue reuse.
pub struct PrimLibrary {
    entries: BTreeMap<String, PrimEntry>,
    pub fetch_arg: Label,
}

impl PrimLibrary {
    pub fn lookup(&self, name: &str) -> Option<PrimEntry> {
        self.entries.get(name).copied()
    }

    /// The entry the call generator should target under `options`.
    pub fn entry_for(&self, name: &str, options: &CompilerOptions) -> Option<Label> {
        self.lookup(name).map(|e| {
            if options.safe_primitives {
                e.checked
            } else {
                e.fast
            }
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &PrimEntry)> {
        self.entries.iter()
    }
}

/// Generate the whole library (plus marshalling entries for `foreigns`) at
/// the current position of `asm`.
pub fn generate(
    asm: &mut Asm,
    options: &CompilerOptions,
    layout: &ContextLayout,
    foreigns: &[ForeignDecl],
) -> Result<PrimLibrary, String> {
    let fetch_arg = asm.fresh_label();
    let mut g = PrimGen {
        asm,
        options,
        layout,
        fetch_arg,
        entries: BTreeMap::new(),
    };
    emit_fetch_arg(&mut g);
    arith::generate(&mut g);
    pairs::generate(&mut g);
    vectors::generate(&mut g);
    strings::generate(&mut g);
    predicates::generate(&mut g);
    ports::generate(&mut g);
    foreign::generate(&mut g, foreigns)?;
    Ok(PrimLibrary {
        entries: g.entries,
        fetch_arg,
    })
}

/// Shared generation state threaded through the per-family modules.
pub struct PrimGen<'a, 'l> {
    pub asm: &'a mut Asm<'l>,
    pub options: &'a CompilerOptions,
    pub layout: &'a ContextLayout,
    pub fetch_arg: Label,
    pub(crate) entries: BTreeMap<String, PrimEntry>,
}

impl PrimGen<'_, '_> {
    pub(crate) fn push(&mut self, instr: Instr) {
        self.asm.push(instr);
    }

    pub(crate) fn label(&self) -> Label {
        self.asm.fresh_label()
    }

    /// Open a primitive: align, allocate both entry labels, bind `checked`.
    pub(crate) fn begin(&mut self, name: &str) -> PrimEntry {
        self.asm.align(4);
        let entry = PrimEntry {
            checked: self.label(),
            fast: self.label(),
        };
        self.asm.bind(entry.checked);
        self.entries.insert(name.to_string(), entry);
        entry
    }

    /// Bind the fast entry; checked code above falls through into it.
    pub(crate) fn fast(&mut self, entry: PrimEntry) {
        self.asm.bind(entry.fast);
    }

    pub(crate) fn load_ctx(&mut self, dst: Reg, offset: u64) {
        self.push(Instr::Load {
            dst,
            base: regs::CTX,
            offset: offset as i32,
        });
    }

    pub(crate) fn store_ctx(&mut self, src: Reg, offset: u64) {
        self.push(Instr::Store {
            src,
            base: regs::CTX,
            offset: offset as i32,
        });
    }

    pub(crate) fn raise(&mut self, code: ErrorCode) {
        emit_raise(self.asm, self.layout, code);
    }

    /// `JmpReg CONT` — every primitive body ends with this.
    pub(crate) fn ret(&mut self) {
        self.push(Instr::JmpReg { target: regs::CONT });
    }

    /// Load an immediate into `RES` and return.
    pub(crate) fn give(&mut self, value: Word) {
        self.push(Instr::MovImm {
            dst: regs::RES,
            imm: value.0,
        });
        self.ret();
    }

    pub(crate) fn arity_exact(&mut self, n: i64) {
        let ok = self.label();
        self.push(Instr::JccImm {
            cond: Cond::Eq,
            a: regs::NARGS,
            imm: n,
            target: ok,
        });
        self.raise(ErrorCode::BadArgCount);
        self.asm.bind(ok);
    }

    pub(crate) fn arity_at_least(&mut self, n: i64) {
        let ok = self.label();
        self.push(Instr::JccImm {
            cond: Cond::Ge,
            a: regs::NARGS,
            imm: n,
            target: ok,
        });
        self.raise(ErrorCode::BadArgCount);
        self.asm.bind(ok);
    }

    pub(crate) fn arity_between(&mut self, lo: i64, hi: i64) {
        let bad = self.label();
        let ok = self.label();
        self.push(Instr::JccImm {
            cond: Cond::Lt,
            a: regs::NARGS,
            imm: lo,
            target: bad,
        });
        self.push(Instr::JccImm {
            cond: Cond::Le,
            a: regs::NARGS,
            imm: hi,
            target: ok,
        });
        self.asm.bind(bad);
        self.raise(ErrorCode::BadArgCount);
        self.asm.bind(ok);
    }

    /// Raise unless `r` holds a fixnum.
    pub(crate) fn check_fixnum(&mut self, r: Reg) {
        let ok = self.label();
        self.push(Instr::AndImm {
            dst: regs::TMP0,
            a: r,
            imm: 1,
        });
        self.push(Instr::JccImm {
            cond: Cond::Eq,
            a: regs::TMP0,
            imm: 0,
            target: ok,
        });
        self.raise(ErrorCode::BadArgType);
        self.asm.bind(ok);
    }

    /// Raise unless `r` holds a pointer to a block of type `ty`.
    pub(crate) fn check_block(&mut self, r: Reg, ty: BlockType) {
        let bad = self.label();
        let ok = self.label();
        self.push(Instr::AndImm {
            dst: regs::TMP0,
            a: r,
            imm: layout::TAG_MASK,
        });
        self.push(Instr::JccImm {
            cond: Cond::Ne,
            a: regs::TMP0,
            imm: layout::PTR_TAG as i64,
            target: bad,
        });
        self.push(Instr::AndImm {
            dst: regs::TMP0,
            a: r,
            imm: UNTAG,
        });
        self.push(Instr::Load {
            dst: regs::TMP1,
            base: regs::TMP0,
            offset: 0,
        });
        self.push(Instr::AndImm {
            dst: regs::TMP1,
            a: regs::TMP1,
            imm: HEADER_TYPE_BITS,
        });
        self.push(Instr::JccImm {
            cond: Cond::Eq,
            a: regs::TMP1,
            imm: ((ty as u64) << 3) as i64,
            target: ok,
        });
        self.asm.bind(bad);
        self.raise(ErrorCode::BadArgType);
        self.asm.bind(ok);
    }

    /// Raise unless `r` holds a character.
    pub(crate) fn check_char(&mut self, r: Reg) {
        let ok = self.label();
        self.push(Instr::AndImm {
            dst: regs::TMP0,
            a: r,
            imm: layout::TAG_MASK,
        });
        self.push(Instr::JccImm {
            cond: Cond::Eq,
            a: regs::TMP0,
            imm: layout::CHAR_TAG as i64,
            target: ok,
        });
        self.raise(ErrorCode::BadArgType);
        self.asm.bind(ok);
    }

    /// Emit `#t`/`#f` into `RES` from a branch the closure emits: the
    /// closure receives the label to jump to when the answer is true.
    pub(crate) fn bool_from(&mut self, branch: impl FnOnce(&mut Self, Label)) {
        let yes = self.label();
        let done = self.label();
        branch(self, yes);
        self.push(Instr::MovImm {
            dst: regs::RES,
            imm: Word::FALSE.0,
        });
        self.push(Instr::Jmp { target: done });
        self.asm.bind(yes);
        self.push(Instr::MovImm {
            dst: regs::RES,
            imm: Word::TRUE.0,
        });
        self.asm.bind(done);
        self.ret();
    }

    /// Call the fetch stub: `VAL = argument[IDX]`.
    pub(crate) fn fetch(&mut self) {
        let back = self.label();
        self.push(Instr::LoadLabel {
            dst: LNK_FETCH,
            label: back,
        });
        self.push(Instr::Jmp {
            target: self.fetch_arg,
        });
        self.asm.bind(back);
    }

    /// Call a binary-op subroutine: `ACC = ACC op VAL`.
    pub(crate) fn call_binop(&mut self, binop: Label) {
        let back = self.label();
        self.push(Instr::LoadLabel {
            dst: LNK_BIN,
            label: back,
        });
        self.push(Instr::Jmp { target: binop });
        self.asm.bind(back);
    }
}

/// Load the error word for `code` and jump through the context handler.
pub(crate) fn emit_raise(asm: &mut Asm, layout: &ContextLayout, code: ErrorCode) {
    asm.push(Instr::MovImm {
        dst: regs::RES,
        imm: Word::error(code).0,
    });
    asm.push(Instr::Load {
        dst: regs::TMP0,
        base: regs::CTX,
        offset: layout.error_handler as i32,
    });
    asm.push(Instr::JmpReg { target: regs::TMP0 });
}

/// Bump-allocate a block with a compile-time payload word count. Leaves the
/// untagged base address in `TMP0` with the header already written; the
/// caller stores the payload and tags the result. Clobbers `TMP1`/`TMP2`.
pub(crate) fn emit_alloc_fixed(
    asm: &mut Asm,
    layout: &ContextLayout,
    count: u64,
    ty: BlockType,
    safe: bool,
) {
    asm.push(Instr::Load {
        dst: regs::TMP0,
        base: regs::CTX,
        offset: layout.alloc_ptr as i32,
    });
    asm.push(Instr::AddImm {
        dst: regs::TMP1,
        a: regs::TMP0,
        imm: layout::block_size_bytes(count) as i64,
    });
    if safe {
        let ok = asm.fresh_label();
        asm.push(Instr::Load {
            dst: regs::TMP2,
            base: regs::CTX,
            offset: layout.from_end as i32,
        });
        asm.push(Instr::Jcc {
            cond: Cond::Le,
            a: regs::TMP1,
            b: regs::TMP2,
            target: ok,
        });
        emit_raise(asm, layout, ErrorCode::HeapOverflow);
        asm.bind(ok);
    }
    asm.push(Instr::Store {
        src: regs::TMP1,
        base: regs::CTX,
        offset: layout.alloc_ptr as i32,
    });
    asm.push(Instr::MovImm {
        dst: regs::TMP1,
        imm: layout::encode_header(count, ty),
    });
    asm.push(Instr::Store {
        src: regs::TMP1,
        base: regs::TMP0,
        offset: 0,
    });
}

/// Allocate a pair of (`car`, `cdr`) into `RES`. The operand registers must
/// not be temporaries.
pub(crate) fn emit_pair_from(
    asm: &mut Asm,
    layout: &ContextLayout,
    safe: bool,
    car: Reg,
    cdr: Reg,
) {
    emit_alloc_fixed(asm, layout, 2, BlockType::Pair, safe);
    asm.push(Instr::Store {
        src: car,
        base: regs::TMP0,
        offset: 8,
    });
    asm.push(Instr::Store {
        src: cdr,
        base: regs::TMP0,
        offset: 16,
    });
    asm.push(Instr::OrImm {
        dst: regs::RES,
        a: regs::TMP0,
        imm: layout::PTR_TAG,
    });
}

/// Box the double bit pattern in `bits` into a flonum block in `RES`.
pub(crate) fn emit_flonum_from(asm: &mut Asm, layout: &ContextLayout, safe: bool, bits: Reg) {
    emit_alloc_fixed(asm, layout, 1, BlockType::Flonum, safe);
    asm.push(Instr::Store {
        src: bits,
        base: regs::TMP0,
        offset: 8,
    });
    asm.push(Instr::OrImm {
        dst: regs::RES,
        a: regs::TMP0,
        imm: layout::PTR_TAG,
    });
}

/// `dst = vector[i]` with optional tag/bounds validation. `v` holds the
/// tagged vector, `i` the tagged index; both survive. Clobbers temporaries.
pub(crate) fn emit_vector_ref(
    asm: &mut Asm,
    layout: &ContextLayout,
    safe: bool,
    v: Reg,
    i: Reg,
    dst: Reg,
) {
    if safe {
        emit_vector_guard(asm, layout, v, i);
    }
    asm.push(Instr::AndImm {
        dst: regs::TMP0,
        a: v,
        imm: UNTAG,
    });
    asm.push(Instr::Sar {
        dst: regs::TMP2,
        a: i,
        amount: 1,
    });
    asm.push(Instr::Shl {
        dst: regs::TMP2,
        a: regs::TMP2,
        amount: 3,
    });
    asm.push(Instr::AddImm {
        dst: regs::TMP2,
        a: regs::TMP2,
        imm: 8,
    });
    asm.push(Instr::LoadIdx {
        dst,
        base: regs::TMP0,
        index: regs::TMP2,
    });
}

/// `vector[i] = x` with optional validation.
pub(crate) fn emit_vector_set(
    asm: &mut Asm,
    layout: &ContextLayout,
    safe: bool,
    v: Reg,
    i: Reg,
    x: Reg,
) {
    if safe {
        emit_vector_guard(asm, layout, v, i);
    }
    asm.push(Instr::AndImm {
        dst: regs::TMP0,
        a: v,
        imm: UNTAG,
    });
    asm.push(Instr::Sar {
        dst: regs::TMP2,
        a: i,
        amount: 1,
    });
    asm.push(Instr::Shl {
        dst: regs::TMP2,
        a: regs::TMP2,
        amount: 3,
    });
    asm.push(Instr::AddImm {
        dst: regs::TMP2,
        a: regs::TMP2,
        imm: 8,
    });
    asm.push(Instr::StoreIdx {
        src: x,
        base: regs::TMP0,
        index: regs::TMP2,
    });
}

/// Tag and bounds validation shared by the vector accessors: `v` must be a
/// vector block, `i` a fixnum in `0..count`.
fn emit_vector_guard(asm: &mut Asm, layout: &ContextLayout, v: Reg, i: Reg) {
    let bad_type = asm.fresh_label();
    let bad_index = asm.fresh_label();
    let ok = asm.fresh_label();

    asm.push(Instr::AndImm {
        dst: regs::TMP0,
        a: v,
        imm: layout::TAG_MASK,
    });
    asm.push(Instr::JccImm {
        cond: Cond::Ne,
        a: regs::TMP0,
        imm: layout::PTR_TAG as i64,
        target: bad_type,
    });
    asm.push(Instr::AndImm {
        dst: regs::TMP0,
        a: v,
        imm: UNTAG,
    });
    asm.push(Instr::Load {
        dst: regs::TMP1,
        base: regs::TMP0,
        offset: 0,
    });
    asm.push(Instr::AndImm {
        dst: regs::TMP2,
        a: regs::TMP1,
        imm: HEADER_TYPE_BITS,
    });
    asm.push(Instr::JccImm {
        cond: Cond::Ne,
        a: regs::TMP2,
        imm: ((BlockType::Vector as u64) << 3) as i64,
        target: bad_type,
    });
    asm.push(Instr::AndImm {
        dst: regs::TMP2,
        a: i,
        imm: 1,
    });
    asm.push(Instr::JccImm {
        cond: Cond::Ne,
        a: regs::TMP2,
        imm: 0,
        target: bad_type,
    });
    // TMP1 = payload count, TMP2 = raw index
    asm.push(Instr::Shr {
        dst: regs::TMP1,
        a: regs::TMP1,
        amount: 8,
    });
    asm.push(Instr::Sar {
        dst: regs::TMP2,
        a: i,
        amount: 1,
    });
    asm.push(Instr::Jcc {
        cond: Cond::Lt,
        a: regs::TMP2,
        b: regs::CTX,
        target: bad_index,
    });
    asm.push(Instr::Jcc {
        cond: Cond::Lt,
        a: regs::TMP2,
        b: regs::TMP1,
        target: ok,
    });
    asm.bind(bad_index);
    emit_raise(asm, layout, ErrorCode::IndexOutOfBounds);
    asm.bind(bad_type);
    emit_raise(asm, layout, ErrorCode::BadArgType);
    asm.bind(ok);
}

/// The argument-fetch stub: `VAL = argument[IDX]` (raw index), return
/// through `LNK_FETCH`. Arguments 3.. live in the locals region by the
/// calling convention.
fn emit_fetch_arg(g: &mut PrimGen) {
    let from_locals = g.label();
    let f = [g.label(), g.label(), g.label()];
    g.asm.align(4);
    let fetch_arg = g.fetch_arg;
    g.asm.bind(fetch_arg);
    for (n, target) in f.iter().enumerate() {
        g.push(Instr::JccImm {
            cond: Cond::Eq,
            a: IDX,
            imm: n as i64,
            target: *target,
        });
    }
    g.asm.bind(from_locals);
    g.push(Instr::AddImm {
        dst: SCR0,
        a: IDX,
        imm: -(regs::ARG_REG_COUNT as i64),
    });
    g.push(Instr::Shl {
        dst: SCR0,
        a: SCR0,
        amount: 3,
    });
    g.push(Instr::AddImm {
        dst: SCR0,
        a: SCR0,
        imm: g.layout.locals as i64,
    });
    g.push(Instr::LoadIdx {
        dst: VAL,
        base: regs::CTX,
        index: SCR0,
    });
    g.push(Instr::JmpReg { target: LNK_FETCH });
    for (n, target) in f.iter().enumerate() {
        g.asm.bind(*target);
        g.push(Instr::Mov {
            dst: VAL,
            src: regs::ARG_REGS[n],
        });
        g.push(Instr::JmpReg { target: LNK_FETCH });
    }
}

/// Fold loop over all arguments: `ACC = identity; for each arg: ACC = binop`.
pub(crate) fn emit_fold_loop(g: &mut PrimGen, identity: u64, binop: Label) {
    let head = g.label();
    let done = g.label();
    g.push(Instr::MovImm {
        dst: ACC,
        imm: identity,
    });
    g.push(Instr::MovImm { dst: IDX, imm: 0 });
    g.asm.bind(head);
    g.push(Instr::Jcc {
        cond: Cond::Ge,
        a: IDX,
        b: regs::NARGS,
        target: done,
    });
    g.fetch();
    g.call_binop(binop);
    g.push(Instr::AddImm {
        dst: IDX,
        a: IDX,
        imm: 1,
    });
    g.push(Instr::Jmp { target: head });
    g.asm.bind(done);
    g.push(Instr::Mov {
        dst: regs::RES,
        src: ACC,
    });
    g.ret();
}

/// Pairwise comparison loop: true iff `cmp` holds for every adjacent pair.
/// `cmp` returns through `LNK_BIN` on success and jumps through `FAIL`
/// otherwise.
pub(crate) fn emit_pairwise_loop(g: &mut PrimGen, cmp: Label) {
    let head = g.label();
    let success = g.label();
    let fail = g.label();
    g.push(Instr::LoadLabel {
        dst: FAIL,
        label: fail,
    });
    g.push(Instr::MovImm { dst: IDX, imm: 0 });
    g.fetch();
    g.push(Instr::Mov { dst: ACC, src: VAL });
    g.push(Instr::MovImm { dst: IDX, imm: 1 });
    g.asm.bind(head);
    g.push(Instr::Jcc {
        cond: Cond::Ge,
        a: IDX,
        b: regs::NARGS,
        target: success,
    });
    g.fetch();
    g.call_binop(cmp);
    g.push(Instr::Mov { dst: ACC, src: VAL });
    g.push(Instr::AddImm {
        dst: IDX,
        a: IDX,
        imm: 1,
    });
    g.push(Instr::Jmp { target: head });
    g.asm.bind(success);
    g.push(Instr::MovImm {
        dst: regs::RES,
        imm: Word::TRUE.0,
    });
    g.ret();
    g.asm.bind(fail);
    g.push(Instr::MovImm {
        dst: regs::RES,
        imm: Word::FALSE.0,
    });
    g.ret();
}
