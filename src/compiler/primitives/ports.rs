//! Output primitives. These call through the foreign-call table: the host
//! supplies the actual sinks, the library only marshals.

use crate::compiler::foreign::{FOREIGN_DISPLAY, FOREIGN_PUT_CHAR, FOREIGN_WRITE};
use crate::instr::{regs, Instr};
use crate::runtime::layout::Word;

use super::PrimGen;

pub(super) fn generate(g: &mut PrimGen) {
    let e = g.begin("display");
    g.arity_exact(1);
    g.fast(e);
    g.push(Instr::ForeignCall {
        index: FOREIGN_DISPLAY,
    });
    g.give(Word::VOID);

    let e = g.begin("write");
    g.arity_exact(1);
    g.fast(e);
    g.push(Instr::ForeignCall {
        index: FOREIGN_WRITE,
    });
    g.give(Word::VOID);

    let e = g.begin("write-char");
    g.arity_exact(1);
    g.check_char(regs::ARG0);
    g.fast(e);
    g.push(Instr::Shr {
        dst: regs::ARG0,
        a: regs::ARG0,
        amount: 3,
    });
    g.push(Instr::ForeignCall {
        index: FOREIGN_PUT_CHAR,
    });
    g.give(Word::VOID);

    let e = g.begin("newline");
    g.arity_exact(0);
    g.fast(e);
    g.push(Instr::MovImm {
        dst: regs::ARG0,
        imm: '\n' as u64,
    });
    g.push(Instr::ForeignCall {
        index: FOREIGN_PUT_CHAR,
    });
    g.give(Word::VOID);
}
