//! The in-stream two-space copying collector.
//!
//! The collector is itself generated code. Call sites load a return label
//! into `TMP2` and jump to the check stub; the stub compares the bump
//! pointer against the soft limit and either returns immediately or runs a
//! full collection. Only `CTX`, `RES`, `SELF` and `CONT` may carry live
//! values at a checkpoint, so the stub zeroes every other register before
//! entering the collector. Any stale raw word whose low bits happen to read
//! as a pointer tag would otherwise be traced.
//!
//! Inside the collector the register file is split by role:
//!
//! - `r12` copy pointer, `r15` scan pointer
//! - `r13`/`r14` region bounds, `r17` region-walk link
//! - `r20` mark argument and result, `r16` mark link
//! - `r18`/`r19`/`r21`/`r22`/`r23` mark scratch, `r24` next-block cursor

use crate::instr::{regs, Asm, Cond, Instr, Label, Reg};
use crate::runtime::context::ContextLayout;
use crate::runtime::layout::{self, ErrorCode};

use super::primitives::{emit_raise, UNTAG};

const COPY: Reg = Reg(12);
const SCAN: Reg = Reg(15);
const REGION_PTR: Reg = Reg(13);
const REGION_END: Reg = Reg(14);
const LNK_REGION: Reg = Reg(17);
const MARK_VAL: Reg = Reg(20);
const LNK_MARK: Reg = Reg(16);
const BYTES: Reg = Reg(18);
const CURSOR: Reg = Reg(19);
const BASE: Reg = Reg(21);
const HDR: Reg = Reg(22);
const SCRATCH: Reg = Reg(23);
const NEXT: Reg = Reg(24);

pub struct GcLabels {
    pub check: Label,
}

/// Append the check stub and the collector at the current stream position.
pub fn generate(asm: &mut Asm, layout: &ContextLayout) -> GcLabels {
    let check = asm.fresh_label();
    let entry = asm.fresh_label();
    let mark_sub = asm.fresh_label();
    let region_sub = asm.fresh_label();

    // Check stub.
    asm.align(4);
    asm.bind(check);
    let run = asm.fresh_label();
    asm.push(Instr::Load {
        dst: regs::TMP0,
        base: regs::CTX,
        offset: layout.alloc_ptr as i32,
    });
    asm.push(Instr::Load {
        dst: regs::TMP1,
        base: regs::CTX,
        offset: layout.alloc_limit as i32,
    });
    asm.push(Instr::Jcc {
        cond: Cond::Ge,
        a: regs::TMP0,
        b: regs::TMP1,
        target: run,
    });
    asm.push(Instr::JmpReg { target: regs::TMP2 });
    asm.bind(run);
    asm.push(Instr::MovImm {
        dst: regs::NARGS,
        imm: 0,
    });
    asm.push(Instr::MovImm {
        dst: regs::TMP0,
        imm: 0,
    });
    asm.push(Instr::MovImm {
        dst: regs::TMP1,
        imm: 0,
    });
    for r in regs::ARG_REGS {
        asm.push(Instr::MovImm { dst: r, imm: 0 });
    }
    for n in regs::GPR_FIRST..=regs::GPR_LAST {
        asm.push(Instr::MovImm {
            dst: Reg(n),
            imm: 0,
        });
    }
    asm.push(Instr::Jmp { target: entry });

    // Collector entry: save the register file, then trace the roots.
    asm.align(4);
    asm.bind(entry);
    for n in 1..regs::NUM_REGS as u8 {
        asm.push(Instr::Store {
            src: Reg(n),
            base: regs::CTX,
            offset: (layout.saved_regs + 8 * n as u64) as i32,
        });
    }
    asm.push(Instr::Load {
        dst: COPY,
        base: regs::CTX,
        offset: layout.to_start as i32,
    });
    asm.push(Instr::Mov {
        dst: SCAN,
        src: COPY,
    });

    let call_region = |asm: &mut Asm| {
        let back = asm.fresh_label();
        asm.push(Instr::LoadLabel {
            dst: LNK_REGION,
            label: back,
        });
        asm.push(Instr::Jmp { target: region_sub });
        asm.bind(back);
    };

    // Saved registers r1..r25.
    asm.push(Instr::MovImm {
        dst: REGION_PTR,
        imm: layout.saved_regs + 8,
    });
    asm.push(Instr::MovImm {
        dst: REGION_END,
        imm: layout.saved_regs + 8 * regs::NUM_REGS as u64,
    });
    call_region(asm);

    // Locals.
    asm.push(Instr::MovImm {
        dst: REGION_PTR,
        imm: layout.locals,
    });
    asm.push(Instr::MovImm {
        dst: REGION_END,
        imm: layout.locals + 8 * layout.locals_count as u64,
    });
    call_region(asm);

    // Globals, up to the allocation watermark.
    asm.push(Instr::MovImm {
        dst: REGION_PTR,
        imm: layout.globals,
    });
    asm.push(Instr::Load {
        dst: REGION_END,
        base: regs::CTX,
        offset: layout.globals_end as i32,
    });
    call_region(asm);

    // Value stack.
    asm.push(Instr::Load {
        dst: REGION_PTR,
        base: regs::CTX,
        offset: layout.stack_save as i32,
    });
    asm.push(Instr::Load {
        dst: REGION_END,
        base: regs::CTX,
        offset: layout.stack_top as i32,
    });
    call_region(asm);

    // Cheney scan of the copied blocks.
    let scan_head = asm.fresh_label();
    let scan_done = asm.fresh_label();
    let scan_next = asm.fresh_label();
    let trace_all = asm.fresh_label();
    let trace_closure = asm.fresh_label();
    asm.bind(scan_head);
    asm.push(Instr::Jcc {
        cond: Cond::Ge,
        a: SCAN,
        b: COPY,
        target: scan_done,
    });
    asm.push(Instr::Load {
        dst: HDR,
        base: SCAN,
        offset: 0,
    });
    asm.push(Instr::Shr {
        dst: BYTES,
        a: HDR,
        amount: 8,
    });
    asm.push(Instr::AddImm {
        dst: BYTES,
        a: BYTES,
        imm: 1,
    });
    asm.push(Instr::Shl {
        dst: BYTES,
        a: BYTES,
        amount: 3,
    });
    asm.push(Instr::Add {
        dst: NEXT,
        a: SCAN,
        b: BYTES,
    });
    asm.push(Instr::Shr {
        dst: SCRATCH,
        a: HDR,
        amount: 3,
    });
    asm.push(Instr::AndImm {
        dst: SCRATCH,
        a: SCRATCH,
        imm: 31,
    });
    for ty in [
        layout::BlockType::Pair,
        layout::BlockType::Vector,
        layout::BlockType::Promise,
    ] {
        asm.push(Instr::JccImm {
            cond: Cond::Eq,
            a: SCRATCH,
            imm: ty as i64,
            target: trace_all,
        });
    }
    asm.push(Instr::JccImm {
        cond: Cond::Eq,
        a: SCRATCH,
        imm: layout::BlockType::Closure as i64,
        target: trace_closure,
    });
    asm.push(Instr::Jmp { target: scan_next });
    asm.bind(trace_all);
    asm.push(Instr::AddImm {
        dst: REGION_PTR,
        a: SCAN,
        imm: 8,
    });
    asm.push(Instr::Mov {
        dst: REGION_END,
        src: NEXT,
    });
    call_region(asm);
    asm.push(Instr::Jmp { target: scan_next });
    // Closure word 0 is a raw code address, skip it.
    asm.bind(trace_closure);
    asm.push(Instr::AddImm {
        dst: REGION_PTR,
        a: SCAN,
        imm: 16,
    });
    asm.push(Instr::Mov {
        dst: REGION_END,
        src: NEXT,
    });
    call_region(asm);
    asm.bind(scan_next);
    asm.push(Instr::Mov {
        dst: SCAN,
        src: NEXT,
    });
    asm.push(Instr::Jmp { target: scan_head });
    asm.bind(scan_done);

    // Swap the semispaces and recompute the soft limit.
    asm.push(Instr::Load {
        dst: BASE,
        base: regs::CTX,
        offset: layout.from_start as i32,
    });
    asm.push(Instr::Load {
        dst: HDR,
        base: regs::CTX,
        offset: layout.from_end as i32,
    });
    asm.push(Instr::Load {
        dst: SCRATCH,
        base: regs::CTX,
        offset: layout.to_start as i32,
    });
    asm.push(Instr::Load {
        dst: BYTES,
        base: regs::CTX,
        offset: layout.to_end as i32,
    });
    asm.push(Instr::Store {
        src: SCRATCH,
        base: regs::CTX,
        offset: layout.from_start as i32,
    });
    asm.push(Instr::Store {
        src: BYTES,
        base: regs::CTX,
        offset: layout.from_end as i32,
    });
    asm.push(Instr::Store {
        src: BASE,
        base: regs::CTX,
        offset: layout.to_start as i32,
    });
    asm.push(Instr::Store {
        src: HDR,
        base: regs::CTX,
        offset: layout.to_end as i32,
    });
    asm.push(Instr::Store {
        src: COPY,
        base: regs::CTX,
        offset: layout.alloc_ptr as i32,
    });
    asm.push(Instr::AddImm {
        dst: CURSOR,
        a: BYTES,
        imm: -(layout.heap_reserve_bytes() as i64),
    });
    asm.push(Instr::Store {
        src: CURSOR,
        base: regs::CTX,
        offset: layout.alloc_limit as i32,
    });
    let alive = asm.fresh_label();
    asm.push(Instr::Jcc {
        cond: Cond::Le,
        a: COPY,
        b: CURSOR,
        target: alive,
    });
    emit_raise(asm, layout, ErrorCode::HeapFull);
    asm.bind(alive);

    // Restore the register file and resume at the checkpoint.
    for n in 1..regs::NUM_REGS as u8 {
        asm.push(Instr::Load {
            dst: Reg(n),
            base: regs::CTX,
            offset: (layout.saved_regs + 8 * n as u64) as i32,
        });
    }
    asm.push(Instr::JmpReg { target: regs::TMP2 });

    // Region walk: mark every word in [REGION_PTR, REGION_END).
    let region_head = asm.fresh_label();
    let region_done = asm.fresh_label();
    asm.align(4);
    asm.bind(region_sub);
    asm.bind(region_head);
    asm.push(Instr::Jcc {
        cond: Cond::Ge,
        a: REGION_PTR,
        b: REGION_END,
        target: region_done,
    });
    asm.push(Instr::Load {
        dst: MARK_VAL,
        base: REGION_PTR,
        offset: 0,
    });
    let back = asm.fresh_label();
    asm.push(Instr::LoadLabel {
        dst: LNK_MARK,
        label: back,
    });
    asm.push(Instr::Jmp { target: mark_sub });
    asm.bind(back);
    asm.push(Instr::Store {
        src: MARK_VAL,
        base: REGION_PTR,
        offset: 0,
    });
    asm.push(Instr::AddImm {
        dst: REGION_PTR,
        a: REGION_PTR,
        imm: 8,
    });
    asm.push(Instr::Jmp { target: region_head });
    asm.bind(region_done);
    asm.push(Instr::JmpReg { target: LNK_REGION });

    // Mark one word: copy the block on first visit, chase the forwarding
    // word on later visits, leave non-pointers alone.
    let not_pointer = asm.fresh_label();
    let forwarded = asm.fresh_label();
    let copy_head = asm.fresh_label();
    let copy_done = asm.fresh_label();
    asm.align(4);
    asm.bind(mark_sub);
    asm.push(Instr::AndImm {
        dst: BASE,
        a: MARK_VAL,
        imm: layout::TAG_MASK,
    });
    asm.push(Instr::JccImm {
        cond: Cond::Ne,
        a: BASE,
        imm: layout::PTR_TAG as i64,
        target: not_pointer,
    });
    asm.push(Instr::AndImm {
        dst: BASE,
        a: MARK_VAL,
        imm: UNTAG,
    });
    asm.push(Instr::Load {
        dst: HDR,
        base: BASE,
        offset: 0,
    });
    asm.push(Instr::AndImm {
        dst: SCRATCH,
        a: HDR,
        imm: layout::TAG_MASK,
    });
    asm.push(Instr::JccImm {
        cond: Cond::Eq,
        a: SCRATCH,
        imm: layout::FORWARD_TAG as i64,
        target: forwarded,
    });
    asm.push(Instr::Shr {
        dst: BYTES,
        a: HDR,
        amount: 8,
    });
    asm.push(Instr::AddImm {
        dst: BYTES,
        a: BYTES,
        imm: 1,
    });
    asm.push(Instr::Shl {
        dst: BYTES,
        a: BYTES,
        amount: 3,
    });
    asm.push(Instr::MovImm {
        dst: CURSOR,
        imm: 0,
    });
    asm.bind(copy_head);
    asm.push(Instr::Jcc {
        cond: Cond::Ge,
        a: CURSOR,
        b: BYTES,
        target: copy_done,
    });
    asm.push(Instr::LoadIdx {
        dst: SCRATCH,
        base: BASE,
        index: CURSOR,
    });
    asm.push(Instr::StoreIdx {
        src: SCRATCH,
        base: COPY,
        index: CURSOR,
    });
    asm.push(Instr::AddImm {
        dst: CURSOR,
        a: CURSOR,
        imm: 8,
    });
    asm.push(Instr::Jmp { target: copy_head });
    asm.bind(copy_done);
    asm.push(Instr::OrImm {
        dst: SCRATCH,
        a: COPY,
        imm: layout::FORWARD_TAG,
    });
    asm.push(Instr::Store {
        src: SCRATCH,
        base: BASE,
        offset: 0,
    });
    asm.push(Instr::OrImm {
        dst: MARK_VAL,
        a: COPY,
        imm: layout::PTR_TAG,
    });
    asm.push(Instr::Add {
        dst: COPY,
        a: COPY,
        b: BYTES,
    });
    asm.push(Instr::JmpReg { target: LNK_MARK });
    asm.bind(forwarded);
    asm.push(Instr::AndImm {
        dst: HDR,
        a: HDR,
        imm: UNTAG,
    });
    asm.push(Instr::OrImm {
        dst: MARK_VAL,
        a: HDR,
        imm: layout::PTR_TAG,
    });
    asm.push(Instr::JmpReg { target: LNK_MARK });
    asm.bind(not_pointer);
    asm.push(Instr::JmpReg { target: LNK_MARK });

    GcLabels { check }
}
