//! Type and identity predicates. All of them answer `#t`/`#f` without
//! allocating, so the checked variants only add the arity check.

use crate::instr::{regs, Cond, Instr, Label, Reg};
use crate::runtime::layout::{self, BlockType, Word};

use super::{PrimGen, HEADER_TYPE_BITS, UNTAG};

/// Jump to `yes` when `r` holds a pointer to a block of type `ty`, fall
/// through otherwise.
fn block_type_branch(g: &mut PrimGen, r: Reg, ty: BlockType, yes: Label) {
    let no = g.label();
    g.push(Instr::AndImm {
        dst: regs::TMP0,
        a: r,
        imm: layout::TAG_MASK,
    });
    g.push(Instr::JccImm {
        cond: Cond::Ne,
        a: regs::TMP0,
        imm: layout::PTR_TAG as i64,
        target: no,
    });
    g.push(Instr::AndImm {
        dst: regs::TMP0,
        a: r,
        imm: UNTAG,
    });
    g.push(Instr::Load {
        dst: regs::TMP1,
        base: regs::TMP0,
        offset: 0,
    });
    g.push(Instr::AndImm {
        dst: regs::TMP1,
        a: regs::TMP1,
        imm: HEADER_TYPE_BITS,
    });
    g.push(Instr::JccImm {
        cond: Cond::Eq,
        a: regs::TMP1,
        imm: ((ty as u64) << 3) as i64,
        target: yes,
    });
    g.asm.bind(no);
}

/// A predicate on one tagged word.
fn unary(g: &mut PrimGen, name: &str, branch: impl FnOnce(&mut PrimGen, Label)) {
    let e = g.begin(name);
    g.arity_exact(1);
    g.fast(e);
    g.bool_from(branch);
}

fn immediate_eq(g: &mut PrimGen, name: &str, value: Word) {
    unary(g, name, |g, yes| {
        g.push(Instr::JccImm {
            cond: Cond::Eq,
            a: regs::ARG0,
            imm: value.0 as i64,
            target: yes,
        });
    });
}

fn block_type(g: &mut PrimGen, name: &str, ty: BlockType) {
    unary(g, name, |g, yes| {
        block_type_branch(g, regs::ARG0, ty, yes);
    });
}

fn tag_eq(g: &mut PrimGen, name: &str, tag: u64) {
    unary(g, name, move |g, yes| {
        g.push(Instr::AndImm {
            dst: regs::TMP0,
            a: regs::ARG0,
            imm: layout::TAG_MASK,
        });
        g.push(Instr::JccImm {
            cond: Cond::Eq,
            a: regs::TMP0,
            imm: tag as i64,
            target: yes,
        });
    });
}

fn fixnum_branch(g: &mut PrimGen, yes: Label) {
    let no = g.label();
    g.push(Instr::AndImm {
        dst: regs::TMP0,
        a: regs::ARG0,
        imm: 1,
    });
    g.push(Instr::JccImm {
        cond: Cond::Ne,
        a: regs::TMP0,
        imm: 0,
        target: no,
    });
    g.push(Instr::Jmp { target: yes });
    g.asm.bind(no);
}

pub(super) fn generate(g: &mut PrimGen) {
    let e = g.begin("eq?");
    g.arity_exact(2);
    g.fast(e);
    g.bool_from(|g, yes| {
        g.push(Instr::Jcc {
            cond: Cond::Eq,
            a: regs::ARG0,
            b: regs::ARG1,
            target: yes,
        });
    });

    // eqv? extends eq? with flonum payload comparison.
    let e = g.begin("eqv?");
    g.arity_exact(2);
    g.fast(e);
    g.bool_from(|g, yes| {
        let no = g.label();
        g.push(Instr::Jcc {
            cond: Cond::Eq,
            a: regs::ARG0,
            b: regs::ARG1,
            target: yes,
        });
        for r in [regs::ARG0, regs::ARG1] {
            g.push(Instr::AndImm {
                dst: regs::TMP0,
                a: r,
                imm: layout::TAG_MASK,
            });
            g.push(Instr::JccImm {
                cond: Cond::Ne,
                a: regs::TMP0,
                imm: layout::PTR_TAG as i64,
                target: no,
            });
            g.push(Instr::AndImm {
                dst: regs::TMP0,
                a: r,
                imm: UNTAG,
            });
            g.push(Instr::Load {
                dst: regs::TMP1,
                base: regs::TMP0,
                offset: 0,
            });
            g.push(Instr::AndImm {
                dst: regs::TMP1,
                a: regs::TMP1,
                imm: HEADER_TYPE_BITS,
            });
            g.push(Instr::JccImm {
                cond: Cond::Ne,
                a: regs::TMP1,
                imm: ((BlockType::Flonum as u64) << 3) as i64,
                target: no,
            });
        }
        g.push(Instr::AndImm {
            dst: regs::TMP0,
            a: regs::ARG0,
            imm: UNTAG,
        });
        g.push(Instr::Load {
            dst: regs::TMP1,
            base: regs::TMP0,
            offset: 8,
        });
        g.push(Instr::AndImm {
            dst: regs::TMP0,
            a: regs::ARG1,
            imm: UNTAG,
        });
        g.push(Instr::Load {
            dst: regs::TMP2,
            base: regs::TMP0,
            offset: 8,
        });
        g.push(Instr::Jcc {
            cond: Cond::Eq,
            a: regs::TMP1,
            b: regs::TMP2,
            target: yes,
        });
        g.asm.bind(no);
    });

    immediate_eq(g, "not", Word::FALSE);
    immediate_eq(g, "null?", Word::NIL);
    immediate_eq(g, "eof-object?", Word::EOF);
    immediate_eq(g, "void?", Word::VOID);

    unary(g, "boolean?", |g, yes| {
        g.push(Instr::JccImm {
            cond: Cond::Eq,
            a: regs::ARG0,
            imm: Word::FALSE.0 as i64,
            target: yes,
        });
        g.push(Instr::JccImm {
            cond: Cond::Eq,
            a: regs::ARG0,
            imm: Word::TRUE.0 as i64,
            target: yes,
        });
    });

    block_type(g, "pair?", BlockType::Pair);
    block_type(g, "vector?", BlockType::Vector);
    block_type(g, "string?", BlockType::String);
    block_type(g, "symbol?", BlockType::Symbol);
    block_type(g, "flonum?", BlockType::Flonum);

    tag_eq(g, "char?", layout::CHAR_TAG);

    unary(g, "fixnum?", fixnum_branch);
    unary(g, "integer?", fixnum_branch);

    unary(g, "number?", |g, yes| {
        fixnum_branch(g, yes);
        block_type_branch(g, regs::ARG0, BlockType::Flonum, yes);
    });

    unary(g, "procedure?", |g, yes| {
        g.push(Instr::AndImm {
            dst: regs::TMP0,
            a: regs::ARG0,
            imm: layout::TAG_MASK,
        });
        g.push(Instr::JccImm {
            cond: Cond::Eq,
            a: regs::TMP0,
            imm: layout::PRIM_TAG as i64,
            target: yes,
        });
        block_type_branch(g, regs::ARG0, BlockType::Closure, yes);
    });
}
