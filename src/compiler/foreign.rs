//! Foreign function declarations and marshalling.
//!
//! Generated code talks to the host through an indexed call table. Indices
//! 0..3 are the built-in output sinks; user declarations start at
//! [`FIRST_USER_INDEX`] in declaration order. Each declaration gets a
//! library entry that unmarshals the arguments in place, performs the call
//! and marshals the result back into a tagged word.

use serde::{Deserialize, Serialize};

use crate::compiler::primitives::{
    emit_flonum_from, vectors::emit_alloc_dynamic, PrimGen, IDX, SCR0, SCR1, UNTAG, VAL,
};
use crate::instr::{regs, Cond, Instr, Reg};
use crate::runtime::layout::{BlockType, ErrorCode, Word};

pub const FOREIGN_DISPLAY: u32 = 0;
pub const FOREIGN_WRITE: u32 = 1;
pub const FOREIGN_PUT_CHAR: u32 = 2;
pub const FIRST_USER_INDEX: u32 = 3;

/// How one foreign parameter or result crosses the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForeignType {
    /// `#f` maps to 0, everything else to 1.
    Bool,
    /// Fixnum, passed untagged.
    Int64,
    /// Any tagged word, passed through unchanged.
    Scheme,
    /// Flonum payload bits.
    Double,
    /// Parameter: payload address of a string block. Result: the host
    /// writes one code point per word into the context scratch region and
    /// returns the count.
    CString,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignDecl {
    pub name: String,
    pub params: Vec<ForeignType>,
    pub ret: ForeignType,
}

/// Raise `ForeignContract` unless `r` holds a fixnum.
fn contract_fixnum(g: &mut PrimGen, r: Reg) {
    let ok = g.label();
    g.push(Instr::AndImm {
        dst: regs::TMP0,
        a: r,
        imm: 1,
    });
    g.push(Instr::JccImm {
        cond: Cond::Eq,
        a: regs::TMP0,
        imm: 0,
        target: ok,
    });
    g.raise(ErrorCode::ForeignContract);
    g.asm.bind(ok);
}

/// Raise `ForeignContract` unless `r` points to a block of type `ty`.
fn contract_block(g: &mut PrimGen, r: Reg, ty: BlockType) {
    let bad = g.label();
    let ok = g.label();
    g.push(Instr::AndImm {
        dst: regs::TMP0,
        a: r,
        imm: crate::runtime::layout::TAG_MASK,
    });
    g.push(Instr::JccImm {
        cond: Cond::Ne,
        a: regs::TMP0,
        imm: crate::runtime::layout::PTR_TAG as i64,
        target: bad,
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
        imm: super::primitives::HEADER_TYPE_BITS,
    });
    g.push(Instr::JccImm {
        cond: Cond::Eq,
        a: regs::TMP1,
        imm: ((ty as u64) << 3) as i64,
        target: ok,
    });
    g.asm.bind(bad);
    g.raise(ErrorCode::ForeignContract);
    g.asm.bind(ok);
}

/// Rewrite the tagged argument in `r` into the host representation.
fn unmarshal_param(g: &mut PrimGen, r: Reg, ty: ForeignType, checked: bool) {
    match ty {
        ForeignType::Bool => {
            let f = g.label();
            let done = g.label();
            g.push(Instr::JccImm {
                cond: Cond::Eq,
                a: r,
                imm: Word::FALSE.0 as i64,
                target: f,
            });
            g.push(Instr::MovImm { dst: r, imm: 1 });
            g.push(Instr::Jmp { target: done });
            g.asm.bind(f);
            g.push(Instr::MovImm { dst: r, imm: 0 });
            g.asm.bind(done);
        }
        ForeignType::Int64 => {
            if checked {
                contract_fixnum(g, r);
            }
            g.push(Instr::Sar {
                dst: r,
                a: r,
                amount: 1,
            });
        }
        ForeignType::Scheme => {}
        ForeignType::Double => {
            if checked {
                contract_block(g, r, BlockType::Flonum);
            }
            g.push(Instr::AndImm {
                dst: regs::TMP0,
                a: r,
                imm: UNTAG,
            });
            g.push(Instr::Load {
                dst: r,
                base: regs::TMP0,
                offset: 8,
            });
        }
        ForeignType::CString => {
            if checked {
                contract_block(g, r, BlockType::String);
            }
            // Payload address; the header stays readable at offset -8.
            g.push(Instr::AndImm {
                dst: r,
                a: r,
                imm: UNTAG,
            });
            g.push(Instr::AddImm {
                dst: r,
                a: r,
                imm: 8,
            });
        }
    }
}

/// Rewrite the raw host result in `RES` into a tagged word.
fn marshal_result(g: &mut PrimGen, ty: ForeignType, safe: bool) {
    match ty {
        ForeignType::Bool => {
            let f = g.label();
            let done = g.label();
            g.push(Instr::JccImm {
                cond: Cond::Eq,
                a: regs::RES,
                imm: 0,
                target: f,
            });
            g.push(Instr::MovImm {
                dst: regs::RES,
                imm: Word::TRUE.0,
            });
            g.push(Instr::Jmp { target: done });
            g.asm.bind(f);
            g.push(Instr::MovImm {
                dst: regs::RES,
                imm: Word::FALSE.0,
            });
            g.asm.bind(done);
        }
        ForeignType::Int64 => {
            g.push(Instr::Shl {
                dst: regs::RES,
                a: regs::RES,
                amount: 1,
            });
        }
        ForeignType::Scheme => {}
        ForeignType::Double => {
            emit_flonum_from(g.asm, g.layout, safe, regs::RES);
        }
        ForeignType::CString => {
            let head = g.label();
            let done = g.label();
            g.push(Instr::Mov {
                dst: SCR0,
                src: regs::RES,
            });
            emit_alloc_dynamic(g, BlockType::String, safe);
            g.push(Instr::MovImm { dst: IDX, imm: 8 });
            g.asm.bind(head);
            g.push(Instr::Jcc {
                cond: Cond::Ge,
                a: IDX,
                b: regs::TMP1,
                target: done,
            });
            g.push(Instr::AddImm {
                dst: SCR1,
                a: IDX,
                imm: g.layout.scratch as i64 - 8,
            });
            g.push(Instr::LoadIdx {
                dst: VAL,
                base: regs::CTX,
                index: SCR1,
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
        }
    }
}

fn emit_body(g: &mut PrimGen, decl: &ForeignDecl, index: u32, checked: bool, safe: bool) {
    if checked {
        let ok = g.label();
        g.push(Instr::JccImm {
            cond: Cond::Eq,
            a: regs::NARGS,
            imm: decl.params.len() as i64,
            target: ok,
        });
        g.raise(ErrorCode::ForeignContract);
        g.asm.bind(ok);
    }
    for (i, ty) in decl.params.iter().enumerate() {
        unmarshal_param(g, regs::ARG_REGS[i], *ty, checked);
    }
    g.push(Instr::ForeignCall { index });
    marshal_result(g, decl.ret, safe);
    g.ret();
}

/// Append one marshalling entry per declaration to the primitive library.
pub fn generate(g: &mut PrimGen, decls: &[ForeignDecl]) -> Result<(), String> {
    let safe = g.options.safe_primitives;
    for (i, decl) in decls.iter().enumerate() {
        if decl.params.len() > regs::ARG_REG_COUNT {
            return Err(format!(
                "foreign function {} declares {} parameters, at most {} are supported",
                decl.name,
                decl.params.len(),
                regs::ARG_REG_COUNT
            ));
        }
        let index = FIRST_USER_INDEX + i as u32;
        let e = g.begin(&decl.name);
        emit_body(g, decl, index, true, safe);
        g.fast(e);
        emit_body(g, decl, index, false, false);
    }
    Ok(())
}
