//! String, character and symbol primitives.
//!
//! String and Symbol payloads store one raw code point per word, so the
//! accessors tag and untag characters at the boundary.

use crate::instr::{regs, Cond, Instr};
use crate::runtime::layout::{self, BlockType, ErrorCode, Word};

use super::{emit_raise, vectors::emit_alloc_dynamic, PrimGen, IDX, SCR0, SCR1, SCR2, UNTAG, VAL};

/// Block-type, index-type and bounds validation for `ARG0[ARG1]`.
fn indexed_guard(g: &mut PrimGen, ty: BlockType) {
    g.check_block(regs::ARG0, ty);
    g.check_fixnum(regs::ARG1);
    let bad = g.label();
    let ok = g.label();
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
    g.push(Instr::Sar {
        dst: regs::TMP2,
        a: regs::ARG1,
        amount: 1,
    });
    g.push(Instr::Jcc {
        cond: Cond::Lt,
        a: regs::TMP2,
        b: regs::CTX,
        target: bad,
    });
    g.push(Instr::Jcc {
        cond: Cond::Lt,
        a: regs::TMP2,
        b: regs::TMP1,
        target: ok,
    });
    g.asm.bind(bad);
    emit_raise(g.asm, g.layout, ErrorCode::IndexOutOfBounds);
    g.asm.bind(ok);
}

/// `TMP0` = untagged base of `ARG0`, `TMP2` = payload byte offset of the
/// index in `ARG1`.
fn index_operand(g: &mut PrimGen) {
    g.push(Instr::AndImm {
        dst: regs::TMP0,
        a: regs::ARG0,
        imm: UNTAG,
    });
    g.push(Instr::Sar {
        dst: regs::TMP2,
        a: regs::ARG1,
        amount: 1,
    });
    g.push(Instr::Shl {
        dst: regs::TMP2,
        a: regs::TMP2,
        amount: 3,
    });
    g.push(Instr::AddImm {
        dst: regs::TMP2,
        a: regs::TMP2,
        imm: 8,
    });
}

fn emit_string_ref_body(g: &mut PrimGen) {
    index_operand(g);
    g.push(Instr::LoadIdx {
        dst: regs::TMP1,
        base: regs::TMP0,
        index: regs::TMP2,
    });
    g.push(Instr::Shl {
        dst: regs::TMP1,
        a: regs::TMP1,
        amount: 3,
    });
    g.push(Instr::OrImm {
        dst: regs::RES,
        a: regs::TMP1,
        imm: layout::CHAR_TAG,
    });
    g.ret();
}

fn emit_string_set_body(g: &mut PrimGen) {
    index_operand(g);
    g.push(Instr::Shr {
        dst: regs::TMP1,
        a: regs::ARG2,
        amount: 3,
    });
    g.push(Instr::StoreIdx {
        src: regs::TMP1,
        base: regs::TMP0,
        index: regs::TMP2,
    });
    g.give(Word::VOID);
}

fn emit_make_string_body(g: &mut PrimGen, safe: bool) {
    let skip = g.label();
    let head = g.label();
    let done = g.label();
    g.push(Instr::MovImm {
        dst: VAL,
        imm: ' ' as u64,
    });
    g.push(Instr::JccImm {
        cond: Cond::Lt,
        a: regs::NARGS,
        imm: 2,
        target: skip,
    });
    g.push(Instr::Shr {
        dst: VAL,
        a: regs::ARG1,
        amount: 3,
    });
    g.asm.bind(skip);
    g.push(Instr::Sar {
        dst: SCR0,
        a: regs::ARG0,
        amount: 1,
    });
    emit_alloc_dynamic(g, BlockType::String, safe);
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

/// Copy the text block in `ARG0` into a fresh block of type `ty`.
fn emit_text_copy_body(g: &mut PrimGen, ty: BlockType, safe: bool) {
    let head = g.label();
    let done = g.label();
    g.push(Instr::AndImm {
        dst: SCR2,
        a: regs::ARG0,
        imm: UNTAG,
    });
    g.push(Instr::Load {
        dst: regs::TMP1,
        base: SCR2,
        offset: 0,
    });
    g.push(Instr::Shr {
        dst: SCR0,
        a: regs::TMP1,
        amount: 8,
    });
    emit_alloc_dynamic(g, ty, safe);
    g.push(Instr::MovImm { dst: IDX, imm: 8 });
    g.asm.bind(head);
    g.push(Instr::Jcc {
        cond: Cond::Ge,
        a: IDX,
        b: regs::TMP1,
        target: done,
    });
    g.push(Instr::LoadIdx {
        dst: VAL,
        base: SCR2,
        index: IDX,
    });
    g.push(Instr::StoreIdx {
        src: VAL,
        base: regs::TMP0,
        index: IDX,
    });
    g.push(Instr::AddImm {
        dst: IDX,
        a: IDX,
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

fn emit_string_eq_body(g: &mut PrimGen) {
    let head = g.label();
    let yes = g.label();
    let no = g.label();
    g.push(Instr::AndImm {
        dst: regs::TMP0,
        a: regs::ARG0,
        imm: UNTAG,
    });
    g.push(Instr::AndImm {
        dst: regs::TMP1,
        a: regs::ARG1,
        imm: UNTAG,
    });
    g.push(Instr::Load {
        dst: SCR0,
        base: regs::TMP0,
        offset: 0,
    });
    g.push(Instr::Load {
        dst: SCR1,
        base: regs::TMP1,
        offset: 0,
    });
    // Equal headers means equal lengths.
    g.push(Instr::Jcc {
        cond: Cond::Ne,
        a: SCR0,
        b: SCR1,
        target: no,
    });
    g.push(Instr::Shr {
        dst: regs::TMP2,
        a: SCR0,
        amount: 8,
    });
    g.push(Instr::Shl {
        dst: regs::TMP2,
        a: regs::TMP2,
        amount: 3,
    });
    g.push(Instr::AddImm {
        dst: regs::TMP2,
        a: regs::TMP2,
        imm: 8,
    });
    g.push(Instr::MovImm { dst: SCR2, imm: 8 });
    g.asm.bind(head);
    g.push(Instr::Jcc {
        cond: Cond::Ge,
        a: SCR2,
        b: regs::TMP2,
        target: yes,
    });
    g.push(Instr::LoadIdx {
        dst: VAL,
        base: regs::TMP0,
        index: SCR2,
    });
    g.push(Instr::LoadIdx {
        dst: SCR1,
        base: regs::TMP1,
        index: SCR2,
    });
    g.push(Instr::Jcc {
        cond: Cond::Ne,
        a: VAL,
        b: SCR1,
        target: no,
    });
    g.push(Instr::AddImm {
        dst: SCR2,
        a: SCR2,
        imm: 8,
    });
    g.push(Instr::Jmp { target: head });
    g.asm.bind(yes);
    g.push(Instr::MovImm {
        dst: regs::RES,
        imm: Word::TRUE.0,
    });
    g.ret();
    g.asm.bind(no);
    g.push(Instr::MovImm {
        dst: regs::RES,
        imm: Word::FALSE.0,
    });
    g.ret();
}

pub(super) fn generate(g: &mut PrimGen) {
    let safe = g.options.safe_primitives;

    let e = g.begin("string-length");
    g.arity_exact(1);
    g.check_block(regs::ARG0, BlockType::String);
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

    let e = g.begin("string-ref");
    g.arity_exact(2);
    indexed_guard(g, BlockType::String);
    emit_string_ref_body(g);
    g.fast(e);
    emit_string_ref_body(g);

    let e = g.begin("string-set!");
    g.arity_exact(3);
    indexed_guard(g, BlockType::String);
    g.check_char(regs::ARG2);
    emit_string_set_body(g);
    g.fast(e);
    emit_string_set_body(g);

    let e = g.begin("make-string");
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
    {
        let no_fill = g.label();
        g.push(Instr::JccImm {
            cond: Cond::Lt,
            a: regs::NARGS,
            imm: 2,
            target: no_fill,
        });
        g.check_char(regs::ARG1);
        g.asm.bind(no_fill);
    }
    emit_make_string_body(g, safe);
    g.fast(e);
    emit_make_string_body(g, false);

    let e = g.begin("string=?");
    g.arity_exact(2);
    g.check_block(regs::ARG0, BlockType::String);
    g.check_block(regs::ARG1, BlockType::String);
    g.fast(e);
    emit_string_eq_body(g);

    // No interning: each conversion copies, so converted symbols compare
    // with string=?/eqv? rather than eq?.
    let e = g.begin("symbol->string");
    g.arity_exact(1);
    g.check_block(regs::ARG0, BlockType::Symbol);
    emit_text_copy_body(g, BlockType::String, safe);
    g.fast(e);
    emit_text_copy_body(g, BlockType::String, false);

    let e = g.begin("string->symbol");
    g.arity_exact(1);
    g.check_block(regs::ARG0, BlockType::String);
    emit_text_copy_body(g, BlockType::Symbol, safe);
    g.fast(e);
    emit_text_copy_body(g, BlockType::Symbol, false);

    let e = g.begin("char->integer");
    g.arity_exact(1);
    g.check_char(regs::ARG0);
    g.fast(e);
    g.push(Instr::Shr {
        dst: regs::TMP0,
        a: regs::ARG0,
        amount: 3,
    });
    g.push(Instr::Shl {
        dst: regs::RES,
        a: regs::TMP0,
        amount: 1,
    });
    g.ret();

    let e = g.begin("integer->char");
    g.arity_exact(1);
    g.check_fixnum(regs::ARG0);
    g.fast(e);
    g.push(Instr::Sar {
        dst: regs::TMP0,
        a: regs::ARG0,
        amount: 1,
    });
    g.push(Instr::Shl {
        dst: regs::TMP0,
        a: regs::TMP0,
        amount: 3,
    });
    g.push(Instr::OrImm {
        dst: regs::RES,
        a: regs::TMP0,
        imm: layout::CHAR_TAG,
    });
    g.ret();
}
