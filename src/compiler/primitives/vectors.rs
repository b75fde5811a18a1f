//! Vector primitives.
//!
//! `vector` and `make-vector` need a payload count only known at run time,
//! so they share a dynamic variant of the bump allocator.

use crate::instr::{regs, Cond, Instr};
use crate::runtime::layout::{BlockType, ErrorCode, Word};

use super::{
    emit_raise, emit_vector_ref, emit_vector_set, PrimGen, IDX, SCR0, SCR1, SCR2, UNTAG, VAL,
};

/// Bump-allocate a block whose payload word count sits raw in `SCR0`.
/// Leaves the untagged base in `TMP0` and the total byte size in `TMP1`,
/// header written. Clobbers `TMP2` and `SCR1`.
pub(crate) fn emit_alloc_dynamic(g: &mut PrimGen, ty: BlockType, safe: bool) {
    g.load_ctx(regs::TMP0, g.layout.alloc_ptr);
    g.push(Instr::Shl {
        dst: regs::TMP1,
        a: SCR0,
        amount: 3,
    });
    g.push(Instr::AddImm {
        dst: regs::TMP1,
        a: regs::TMP1,
        imm: 8,
    });
    g.push(Instr::Add {
        dst: SCR1,
        a: regs::TMP0,
        b: regs::TMP1,
    });
    if safe {
        let ok = g.label();
        g.load_ctx(regs::TMP2, g.layout.from_end);
        g.push(Instr::Jcc {
            cond: Cond::Le,
            a: SCR1,
            b: regs::TMP2,
            target: ok,
        });
        emit_raise(g.asm, g.layout, ErrorCode::HeapOverflow);
        g.asm.bind(ok);
    }
    g.store_ctx(SCR1, g.layout.alloc_ptr);
    g.push(Instr::Shl {
        dst: regs::TMP2,
        a: SCR0,
        amount: 8,
    });
    g.push(Instr::OrImm {
        dst: regs::TMP2,
        a: regs::TMP2,
        imm: (ty as u64) << 3,
    });
    g.push(Instr::Store {
        src: regs::TMP2,
        base: regs::TMP0,
        offset: 0,
    });
}

fn emit_vector_body(g: &mut PrimGen, safe: bool) {
    let head = g.label();
    let done = g.label();
    g.push(Instr::Mov {
        dst: SCR0,
        src: regs::NARGS,
    });
    emit_alloc_dynamic(g, BlockType::Vector, safe);
    g.push(Instr::MovImm { dst: IDX, imm: 0 });
    g.asm.bind(head);
    g.push(Instr::Jcc {
        cond: Cond::Ge,
        a: IDX,
        b: regs::NARGS,
        target: done,
    });
    g.fetch();
    g.push(Instr::Shl {
        dst: regs::TMP2,
        a: IDX,
        amount: 3,
    });
    g.push(Instr::AddImm {
        dst: regs::TMP2,
        a: regs::TMP2,
        imm: 8,
    });
    g.push(Instr::StoreIdx {
        src: VAL,
        base: regs::TMP0,
        index: regs::TMP2,
    });
    g.push(Instr::AddImm {
        dst: IDX,
        a: IDX,
        imm: 1,
    });
    g.push(Instr::Jmp { target: head });
    g.asm.bind(done);
    g.push(Instr::OrImm {
        dst: regs::RES,
        a: regs::TMP0,
        imm: 1,
    });
    g.ret();
}

fn emit_make_vector_body(g: &mut PrimGen, safe: bool) {
    let skip = g.label();
    let head = g.label();
    let done = g.label();
    g.push(Instr::MovImm {
        dst: VAL,
        imm: Word::fixnum(0).0,
    });
    g.push(Instr::JccImm {
        cond: Cond::Lt,
        a: regs::NARGS,
        imm: 2,
        target: skip,
    });
    g.push(Instr::Mov {
        dst: VAL,
        src: regs::ARG1,
    });
    g.asm.bind(skip);
    g.push(Instr::Sar {
        dst: SCR0,
        a: regs::ARG0,
        amount: 1,
    });
    emit_alloc_dynamic(g, BlockType::Vector, safe);
    g.push(Instr::MovImm { dst: SCR2, imm: 8 });
    g.asm.bind(head);
    g.push(Instr::Jcc {
        cond: Cond::Ge,
        a: SCR2,
        b: regs::TMP1,
        target: done,
    });
    g.push(Instr::StoreIdx {
        src: VAL,
        base: regs::TMP0,
        index: SCR2,
    });
    g.push(Instr::AddImm {
        dst: SCR2,
        a: SCR2,
        imm: 8,
    });
    g.push(Instr::Jmp { target: head });
    g.asm.bind(done);
    g.push(Instr::OrImm {
        dst: regs::RES,
        a: regs::TMP0,
        imm: 1,
    });
    g.ret();
}

pub(super) fn generate(g: &mut PrimGen) {
    let safe = g.options.safe_primitives;

    let e = g.begin("vector");
    emit_vector_body(g, safe);
    g.fast(e);
    emit_vector_body(g, false);

    let e = g.begin("make-vector");
    g.arity_between(1, 2);
    g.check_fixnum(regs::ARG0);
    {
        let ok = g.label();
        g.push(Instr::Jcc {
            cond: Cond::Ge,
            a: regs::ARG0,
            b: regs::CTX,
            target: ok,
        });
        g.raise(ErrorCode::BadArgType);
        g.asm.bind(ok);
    }
    emit_make_vector_body(g, safe);
    g.fast(e);
    emit_make_vector_body(g, false);

    let e = g.begin("vector-ref");
    g.arity_exact(2);
    emit_vector_ref(g.asm, g.layout, true, regs::ARG0, regs::ARG1, regs::RES);
    g.ret();
    g.fast(e);
    emit_vector_ref(g.asm, g.layout, false, regs::ARG0, regs::ARG1, regs::RES);
    g.ret();

    let e = g.begin("vector-set!");
    g.arity_exact(3);
    emit_vector_set(g.asm, g.layout, true, regs::ARG0, regs::ARG1, regs::ARG2);
    g.give(Word::VOID);
    g.fast(e);
    emit_vector_set(g.asm, g.layout, false, regs::ARG0, regs::ARG1, regs::ARG2);
    g.give(Word::VOID);

    let e = g.begin("vector-length");
    g.arity_exact(1);
    g.check_block(regs::ARG0, BlockType::Vector);
    g.fast(e);
    g.push(Instr::AndImm {
        dst: regs::TMP0,
        a: regs::ARG0,
        imm: UNTAG,
    });
    g.push(Instr::Load {
        dst: regs::TMP1,
        base: regs::TMP0,
        offset: 0,
    });
    g.push(Instr::Shr {
        dst: regs::TMP1,
        a: regs::TMP1,
        amount: 8,
    });
    g.push(Instr::Shl {
        dst: regs::RES,
        a: regs::TMP1,
        amount: 1,
    });
    g.ret();
}
