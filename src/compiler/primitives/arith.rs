//! Fixnum and flonum arithmetic, comparisons, bitwise operations.
//!
//! Variadic operators share the fold/pairwise loops from the parent module,
//! parameterized by a binary-op subroutine (checked or fast). Tagged fixnums
//! add, subtract and compare directly; multiplication re-normalizes with one
//! arithmetic shift.

use crate::instr::{regs, Cond, Instr, Label};
use crate::runtime::layout::{BlockType, ErrorCode, Word};

use super::{
    emit_flonum_from, emit_fold_loop, emit_pairwise_loop, PrimGen, ACC, FAIL, IDX, LNK_BIN,
    SCR0, SCR1, UNTAG, VAL,
};

struct Binop {
    checked: Label,
    fast: Label,
}

/// Emit a binary-op subroutine `ACC = ACC op VAL`, returning through
/// `LNK_BIN`. The checked entry validates both operands and falls through.
fn binop(g: &mut PrimGen, body: impl FnOnce(&mut PrimGen)) -> Binop {
    let checked = g.label();
    let fast = g.label();
    g.asm.bind(checked);
    g.check_fixnum(ACC);
    g.check_fixnum(VAL);
    g.asm.bind(fast);
    body(g);
    g.push(Instr::JmpReg { target: LNK_BIN });
    Binop { checked, fast }
}

/// A comparison subroutine: return through `LNK_BIN` when `ACC cond VAL`
/// holds, jump through `FAIL` otherwise.
fn cmp_binop(g: &mut PrimGen, cond: Cond) -> Binop {
    let checked = g.label();
    let fast = g.label();
    let hold = g.label();
    g.asm.bind(checked);
    g.check_fixnum(ACC);
    g.check_fixnum(VAL);
    g.asm.bind(fast);
    g.push(Instr::Jcc {
        cond,
        a: ACC,
        b: VAL,
        target: hold,
    });
    g.push(Instr::JmpReg { target: FAIL });
    g.asm.bind(hold);
    g.push(Instr::JmpReg { target: LNK_BIN });
    Binop { checked, fast }
}

/// Fold over the arguments with the first as seed: `(op a0 a1 a2 ...)`.
fn emit_seeded_fold(g: &mut PrimGen, binop: Label) {
    let head = g.label();
    let done = g.label();
    g.push(Instr::MovImm { dst: IDX, imm: 0 });
    g.fetch();
    g.push(Instr::Mov { dst: ACC, src: VAL });
    g.push(Instr::MovImm { dst: IDX, imm: 1 });
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

/// `(- a)` negates, `(- a b c ...)` folds subtraction left-to-right.
fn emit_minus(g: &mut PrimGen, sub: Label, checked: bool) {
    let many = g.label();
    let head = g.label();
    let done = g.label();
    g.push(Instr::MovImm { dst: IDX, imm: 0 });
    g.fetch();
    g.push(Instr::Mov { dst: ACC, src: VAL });
    if checked {
        g.check_fixnum(ACC);
    }
    g.push(Instr::JccImm {
        cond: Cond::Ne,
        a: regs::NARGS,
        imm: 1,
        target: many,
    });
    g.push(Instr::Sub {
        dst: regs::RES,
        a: regs::CTX,
        b: ACC,
    });
    g.ret();
    g.asm.bind(many);
    g.push(Instr::MovImm { dst: IDX, imm: 1 });
    g.asm.bind(head);
    g.push(Instr::Jcc {
        cond: Cond::Ge,
        a: IDX,
        b: regs::NARGS,
        target: done,
    });
    g.fetch();
    g.call_binop(sub);
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

fn division(g: &mut PrimGen, name: &str, body: impl FnOnce(&mut PrimGen)) {
    let e = g.begin(name);
    g.arity_exact(2);
    g.check_fixnum(regs::ARG0);
    g.check_fixnum(regs::ARG1);
    let ok = g.label();
    g.push(Instr::JccImm {
        cond: Cond::Ne,
        a: regs::ARG1,
        imm: 0,
        target: ok,
    });
    g.raise(ErrorCode::DivisionByZero);
    g.asm.bind(ok);
    g.fast(e);
    body(g);
    g.ret();
}

fn fl_binary(g: &mut PrimGen, name: &str, op: fn(&mut PrimGen)) {
    let e = g.begin(name);
    g.arity_exact(2);
    g.check_block(regs::ARG0, BlockType::Flonum);
    g.check_block(regs::ARG1, BlockType::Flonum);
    g.fast(e);
    load_flonum_payloads(g);
    op(g);
    let safe = g.options.safe_flonums;
    emit_flonum_from(g.asm, g.layout, safe, SCR0);
    g.ret();
}

fn fl_compare(g: &mut PrimGen, name: &str, cond: Cond) {
    let e = g.begin(name);
    g.arity_exact(2);
    g.check_block(regs::ARG0, BlockType::Flonum);
    g.check_block(regs::ARG1, BlockType::Flonum);
    g.fast(e);
    load_flonum_payloads(g);
    g.bool_from(|g, yes| {
        g.push(Instr::FJcc {
            cond,
            a: SCR0,
            b: SCR1,
            target: yes,
        });
    });
}

/// `SCR0`/`SCR1` = raw double bits of `ARG0`/`ARG1`.
fn load_flonum_payloads(g: &mut PrimGen) {
    g.push(Instr::AndImm {
        dst: regs::TMP0,
        a: regs::ARG0,
        imm: UNTAG,
    });
    g.push(Instr::Load {
        dst: SCR0,
        base: regs::TMP0,
        offset: 8,
    });
    g.push(Instr::AndImm {
        dst: regs::TMP0,
        a: regs::ARG1,
        imm: UNTAG,
    });
    g.push(Instr::Load {
        dst: SCR1,
        base: regs::TMP0,
        offset: 8,
    });
}

fn unary_fixnum_predicate(g: &mut PrimGen, name: &str, branch: fn(&mut PrimGen, Label)) {
    let e = g.begin(name);
    g.arity_exact(1);
    g.check_fixnum(regs::ARG0);
    g.fast(e);
    g.bool_from(|g, yes| branch(g, yes));
}

pub(super) fn generate(g: &mut PrimGen) {
    // Binary-op subroutines come first; the entries below jump into them.
    let add = binop(g, |g| {
        g.push(Instr::Add {
            dst: ACC,
            a: ACC,
            b: VAL,
        });
    });
    let sub = binop(g, |g| {
        g.push(Instr::Sub {
            dst: ACC,
            a: ACC,
            b: VAL,
        });
    });
    let mul = binop(g, |g| {
        g.push(Instr::Mul {
            dst: ACC,
            a: ACC,
            b: VAL,
        });
        g.push(Instr::Sar {
            dst: ACC,
            a: ACC,
            amount: 1,
        });
    });
    let min = binop(g, |g| {
        let keep = g.label();
        g.push(Instr::Jcc {
            cond: Cond::Le,
            a: ACC,
            b: VAL,
            target: keep,
        });
        g.push(Instr::Mov { dst: ACC, src: VAL });
        g.asm.bind(keep);
    });
    let max = binop(g, |g| {
        let keep = g.label();
        g.push(Instr::Jcc {
            cond: Cond::Ge,
            a: ACC,
            b: VAL,
            target: keep,
        });
        g.push(Instr::Mov { dst: ACC, src: VAL });
        g.asm.bind(keep);
    });
    let bit_and = binop(g, |g| {
        g.push(Instr::And {
            dst: ACC,
            a: ACC,
            b: VAL,
        });
    });
    let bit_or = binop(g, |g| {
        g.push(Instr::Or {
            dst: ACC,
            a: ACC,
            b: VAL,
        });
    });
    let bit_xor = binop(g, |g| {
        g.push(Instr::Xor {
            dst: ACC,
            a: ACC,
            b: VAL,
        });
    });
    let cmp_eq = cmp_binop(g, Cond::Eq);
    let cmp_lt = cmp_binop(g, Cond::Lt);
    let cmp_gt = cmp_binop(g, Cond::Gt);
    let cmp_le = cmp_binop(g, Cond::Le);
    let cmp_ge = cmp_binop(g, Cond::Ge);

    let e = g.begin("+");
    emit_fold_loop(g, Word::fixnum(0).0, add.checked);
    g.fast(e);
    emit_fold_loop(g, Word::fixnum(0).0, add.fast);

    let e = g.begin("*");
    emit_fold_loop(g, Word::fixnum(1).0, mul.checked);
    g.fast(e);
    emit_fold_loop(g, Word::fixnum(1).0, mul.fast);

    let e = g.begin("-");
    g.arity_at_least(1);
    emit_minus(g, sub.checked, true);
    g.fast(e);
    emit_minus(g, sub.fast, false);

    let e = g.begin("min");
    g.arity_at_least(1);
    emit_seeded_fold(g, min.checked);
    g.fast(e);
    emit_seeded_fold(g, min.fast);

    let e = g.begin("max");
    g.arity_at_least(1);
    emit_seeded_fold(g, max.checked);
    g.fast(e);
    emit_seeded_fold(g, max.fast);

    for (name, cmp) in [
        ("=", &cmp_eq),
        ("<", &cmp_lt),
        (">", &cmp_gt),
        ("<=", &cmp_le),
        (">=", &cmp_ge),
    ] {
        let e = g.begin(name);
        g.arity_at_least(1);
        emit_pairwise_loop(g, cmp.checked);
        g.fast(e);
        emit_pairwise_loop(g, cmp.fast);
    }

    let e = g.begin("bitwise-and");
    emit_fold_loop(g, Word::fixnum(-1).0, bit_and.checked);
    g.fast(e);
    emit_fold_loop(g, Word::fixnum(-1).0, bit_and.fast);

    let e = g.begin("bitwise-or");
    emit_fold_loop(g, Word::fixnum(0).0, bit_or.checked);
    g.fast(e);
    emit_fold_loop(g, Word::fixnum(0).0, bit_or.fast);

    let e = g.begin("bitwise-xor");
    emit_fold_loop(g, Word::fixnum(0).0, bit_xor.checked);
    g.fast(e);
    emit_fold_loop(g, Word::fixnum(0).0, bit_xor.fast);

    // not x = -x - 1, directly on the tagged representation.
    let e = g.begin("bitwise-not");
    g.arity_exact(1);
    g.check_fixnum(regs::ARG0);
    g.fast(e);
    g.push(Instr::Sub {
        dst: regs::TMP0,
        a: regs::CTX,
        b: regs::ARG0,
    });
    g.push(Instr::AddImm {
        dst: regs::RES,
        a: regs::TMP0,
        imm: -2,
    });
    g.ret();

    division(g, "quotient", |g| {
        g.push(Instr::Sar {
            dst: regs::TMP0,
            a: regs::ARG0,
            amount: 1,
        });
        g.push(Instr::Sar {
            dst: regs::TMP1,
            a: regs::ARG1,
            amount: 1,
        });
        g.push(Instr::Div {
            dst: regs::TMP0,
            a: regs::TMP0,
            b: regs::TMP1,
        });
        g.push(Instr::Shl {
            dst: regs::RES,
            a: regs::TMP0,
            amount: 1,
        });
    });

    division(g, "remainder", |g| {
        g.push(Instr::Sar {
            dst: regs::TMP0,
            a: regs::ARG0,
            amount: 1,
        });
        g.push(Instr::Sar {
            dst: regs::TMP1,
            a: regs::ARG1,
            amount: 1,
        });
        g.push(Instr::Rem {
            dst: regs::TMP0,
            a: regs::TMP0,
            b: regs::TMP1,
        });
        g.push(Instr::Shl {
            dst: regs::RES,
            a: regs::TMP0,
            amount: 1,
        });
    });

    division(g, "modulo", |g| {
        let done = g.label();
        g.push(Instr::Sar {
            dst: regs::TMP0,
            a: regs::ARG0,
            amount: 1,
        });
        g.push(Instr::Sar {
            dst: regs::TMP1,
            a: regs::ARG1,
            amount: 1,
        });
        g.push(Instr::Rem {
            dst: regs::TMP2,
            a: regs::TMP0,
            b: regs::TMP1,
        });
        // remainder and divisor disagree in sign: shift into the divisor's.
        g.push(Instr::JccImm {
            cond: Cond::Eq,
            a: regs::TMP2,
            imm: 0,
            target: done,
        });
        g.push(Instr::Xor {
            dst: regs::TMP0,
            a: regs::TMP2,
            b: regs::TMP1,
        });
        g.push(Instr::Jcc {
            cond: Cond::Ge,
            a: regs::TMP0,
            b: regs::CTX,
            target: done,
        });
        g.push(Instr::Add {
            dst: regs::TMP2,
            a: regs::TMP2,
            b: regs::TMP1,
        });
        g.asm.bind(done);
        g.push(Instr::Shl {
            dst: regs::RES,
            a: regs::TMP2,
            amount: 1,
        });
    });

    let e = g.begin("abs");
    g.arity_exact(1);
    g.check_fixnum(regs::ARG0);
    g.fast(e);
    let pos = g.label();
    g.push(Instr::Jcc {
        cond: Cond::Ge,
        a: regs::ARG0,
        b: regs::CTX,
        target: pos,
    });
    g.push(Instr::Sub {
        dst: regs::RES,
        a: regs::CTX,
        b: regs::ARG0,
    });
    g.ret();
    g.asm.bind(pos);
    g.push(Instr::Mov {
        dst: regs::RES,
        src: regs::ARG0,
    });
    g.ret();

    unary_fixnum_predicate(g, "zero?", |g, yes| {
        g.push(Instr::JccImm {
            cond: Cond::Eq,
            a: regs::ARG0,
            imm: 0,
            target: yes,
        });
    });
    unary_fixnum_predicate(g, "positive?", |g, yes| {
        g.push(Instr::Jcc {
            cond: Cond::Gt,
            a: regs::ARG0,
            b: regs::CTX,
            target: yes,
        });
    });
    unary_fixnum_predicate(g, "negative?", |g, yes| {
        g.push(Instr::Jcc {
            cond: Cond::Lt,
            a: regs::ARG0,
            b: regs::CTX,
            target: yes,
        });
    });
    unary_fixnum_predicate(g, "even?", |g, yes| {
        g.push(Instr::AndImm {
            dst: regs::TMP0,
            a: regs::ARG0,
            imm: 2,
        });
        g.push(Instr::JccImm {
            cond: Cond::Eq,
            a: regs::TMP0,
            imm: 0,
            target: yes,
        });
    });
    unary_fixnum_predicate(g, "odd?", |g, yes| {
        g.push(Instr::AndImm {
            dst: regs::TMP0,
            a: regs::ARG0,
            imm: 2,
        });
        g.push(Instr::JccImm {
            cond: Cond::Ne,
            a: regs::TMP0,
            imm: 0,
            target: yes,
        });
    });

    // No variable-amount shift in the instruction set; loop one bit at a
    // time on the untagged value.
    let e = g.begin("arithmetic-shift");
    g.arity_exact(2);
    g.check_fixnum(regs::ARG0);
    g.check_fixnum(regs::ARG1);
    g.fast(e);
    {
        let left = g.label();
        let left_head = g.label();
        let left_done = g.label();
        let right_head = g.label();
        let right_done = g.label();
        g.push(Instr::Sar {
            dst: regs::TMP1,
            a: regs::ARG1,
            amount: 1,
        });
        g.push(Instr::Mov {
            dst: regs::TMP0,
            src: regs::ARG0,
        });
        g.push(Instr::Jcc {
            cond: Cond::Ge,
            a: regs::TMP1,
            b: regs::CTX,
            target: left,
        });
        g.push(Instr::Sar {
            dst: regs::TMP0,
            a: regs::TMP0,
            amount: 1,
        });
        g.asm.bind(right_head);
        g.push(Instr::JccImm {
            cond: Cond::Eq,
            a: regs::TMP1,
            imm: 0,
            target: right_done,
        });
        g.push(Instr::Sar {
            dst: regs::TMP0,
            a: regs::TMP0,
            amount: 1,
        });
        g.push(Instr::AddImm {
            dst: regs::TMP1,
            a: regs::TMP1,
            imm: 1,
        });
        g.push(Instr::Jmp { target: right_head });
        g.asm.bind(right_done);
        g.push(Instr::Shl {
            dst: regs::RES,
            a: regs::TMP0,
            amount: 1,
        });
        g.ret();
        g.asm.bind(left);
        g.asm.bind(left_head);
        g.push(Instr::JccImm {
            cond: Cond::Eq,
            a: regs::TMP1,
            imm: 0,
            target: left_done,
        });
        g.push(Instr::Add {
            dst: regs::TMP0,
            a: regs::TMP0,
            b: regs::TMP0,
        });
        g.push(Instr::AddImm {
            dst: regs::TMP1,
            a: regs::TMP1,
            imm: -1,
        });
        g.push(Instr::Jmp { target: left_head });
        g.asm.bind(left_done);
        g.push(Instr::Mov {
            dst: regs::RES,
            src: regs::TMP0,
        });
        g.ret();
    }

    fl_binary(g, "fl+", |g| {
        g.push(Instr::FAdd {
            dst: SCR0,
            a: SCR0,
            b: SCR1,
        });
    });
    fl_binary(g, "fl-", |g| {
        g.push(Instr::FSub {
            dst: SCR0,
            a: SCR0,
            b: SCR1,
        });
    });
    fl_binary(g, "fl*", |g| {
        g.push(Instr::FMul {
            dst: SCR0,
            a: SCR0,
            b: SCR1,
        });
    });
    fl_binary(g, "fl/", |g| {
        g.push(Instr::FDiv {
            dst: SCR0,
            a: SCR0,
            b: SCR1,
        });
    });
    fl_compare(g, "fl=", Cond::Eq);
    fl_compare(g, "fl<", Cond::Lt);
    fl_compare(g, "fl>", Cond::Gt);
    fl_compare(g, "fl<=", Cond::Le);
    fl_compare(g, "fl>=", Cond::Ge);

    let e = g.begin("fixnum->flonum");
    g.arity_exact(1);
    g.check_fixnum(regs::ARG0);
    g.fast(e);
    g.push(Instr::Sar {
        dst: SCR0,
        a: regs::ARG0,
        amount: 1,
    });
    g.push(Instr::Itof { dst: SCR0, a: SCR0 });
    let safe = g.options.safe_flonums;
    emit_flonum_from(g.asm, g.layout, safe, SCR0);
    g.ret();

    let e = g.begin("flonum->fixnum");
    g.arity_exact(1);
    g.check_block(regs::ARG0, BlockType::Flonum);
    g.fast(e);
    g.push(Instr::AndImm {
        dst: regs::TMP0,
        a: regs::ARG0,
        imm: UNTAG,
    });
    g.push(Instr::Load {
        dst: SCR0,
        base: regs::TMP0,
        offset: 8,
    });
    g.push(Instr::Ftoi { dst: SCR0, a: SCR0 });
    g.push(Instr::Shl {
        dst: regs::RES,
        a: SCR0,
        amount: 1,
    });
    g.ret();
}
