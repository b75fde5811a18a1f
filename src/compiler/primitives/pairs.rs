//! Pair and list primitives.

use crate::instr::{regs, Cond, Instr};
use crate::runtime::layout::{BlockType, Word};

use super::{emit_pair_from, PrimGen, ACC, IDX, UNTAG, VAL};

/// Load car (`offset` 8) or cdr (`offset` 16) of the pair in `src` into
/// `dst`, via `TMP0`.
fn field(g: &mut PrimGen, src: crate::instr::Reg, dst: crate::instr::Reg, offset: i32) {
    g.push(Instr::AndImm {
        dst: regs::TMP0,
        a: src,
        imm: UNTAG,
    });
    g.push(Instr::Load {
        dst,
        base: regs::TMP0,
        offset,
    });
}

fn accessor(g: &mut PrimGen, name: &str, offset: i32) {
    let e = g.begin(name);
    g.arity_exact(1);
    g.check_block(regs::ARG0, BlockType::Pair);
    g.fast(e);
    field(g, regs::ARG0, regs::RES, offset);
    g.ret();
}

/// Two-step accessors: outer offset applied to the pair found at the inner
/// offset. The checked variant validates both hops.
fn accessor2(g: &mut PrimGen, name: &str, inner: i32, outer: i32) {
    let e = g.begin(name);
    g.arity_exact(1);
    g.check_block(regs::ARG0, BlockType::Pair);
    field(g, regs::ARG0, regs::TMP1, inner);
    g.push(Instr::Mov {
        dst: VAL,
        src: regs::TMP1,
    });
    g.check_block(VAL, BlockType::Pair);
    field(g, VAL, regs::RES, outer);
    g.ret();
    g.fast(e);
    field(g, regs::ARG0, VAL, inner);
    field(g, VAL, regs::RES, outer);
    g.ret();
}

fn mutator(g: &mut PrimGen, name: &str, offset: i32) {
    let e = g.begin(name);
    g.arity_exact(2);
    g.check_block(regs::ARG0, BlockType::Pair);
    g.fast(e);
    g.push(Instr::AndImm {
        dst: regs::TMP0,
        a: regs::ARG0,
        imm: UNTAG,
    });
    g.push(Instr::Store {
        src: regs::ARG1,
        base: regs::TMP0,
        offset,
    });
    g.give(Word::VOID);
}

/// Walk the list counting pairs; the checked variant validates every link.
fn emit_length_loop(g: &mut PrimGen, checked: bool) {
    let head = g.label();
    let done = g.label();
    g.push(Instr::MovImm { dst: ACC, imm: 0 });
    g.push(Instr::Mov {
        dst: VAL,
        src: regs::ARG0,
    });
    g.asm.bind(head);
    g.push(Instr::JccImm {
        cond: Cond::Eq,
        a: VAL,
        imm: Word::NIL.0 as i64,
        target: done,
    });
    if checked {
        g.check_block(VAL, BlockType::Pair);
    }
    field(g, VAL, VAL, 16);
    g.push(Instr::AddImm {
        dst: ACC,
        a: ACC,
        imm: Word::fixnum(1).0 as i64,
    });
    g.push(Instr::Jmp { target: head });
    g.asm.bind(done);
    g.push(Instr::Mov {
        dst: regs::RES,
        src: ACC,
    });
    g.ret();
}

/// Build an argument list right-to-left so each cons's tail already exists.
fn emit_list_loop(g: &mut PrimGen, safe: bool) {
    let head = g.label();
    let done = g.label();
    g.push(Instr::MovImm {
        dst: regs::RES,
        imm: Word::NIL.0,
    });
    g.push(Instr::Mov {
        dst: IDX,
        src: regs::NARGS,
    });
    g.asm.bind(head);
    g.push(Instr::JccImm {
        cond: Cond::Le,
        a: IDX,
        imm: 0,
        target: done,
    });
    g.push(Instr::AddImm {
        dst: IDX,
        a: IDX,
        imm: -1,
    });
    g.fetch();
    emit_pair_from(g.asm, g.layout, safe, VAL, regs::RES);
    g.push(Instr::Jmp { target: head });
    g.asm.bind(done);
    g.ret();
}

pub(super) fn generate(g: &mut PrimGen) {
    let e = g.begin("cons");
    g.arity_exact(2);
    let safe = g.options.safe_cons;
    emit_pair_from(g.asm, g.layout, safe, regs::ARG0, regs::ARG1);
    g.ret();
    g.fast(e);
    emit_pair_from(g.asm, g.layout, false, regs::ARG0, regs::ARG1);
    g.ret();

    accessor(g, "car", 8);
    accessor(g, "cdr", 16);
    accessor2(g, "caar", 8, 8);
    accessor2(g, "cadr", 16, 8);
    accessor2(g, "cdar", 8, 16);
    accessor2(g, "cddr", 16, 16);
    mutator(g, "set-car!", 8);
    mutator(g, "set-cdr!", 16);

    let e = g.begin("length");
    g.arity_exact(1);
    emit_length_loop(g, true);
    g.fast(e);
    emit_length_loop(g, false);

    let e = g.begin("list");
    let safe = g.options.safe_cons;
    emit_list_loop(g, safe);
    g.fast(e);
    emit_list_loop(g, false);
}
