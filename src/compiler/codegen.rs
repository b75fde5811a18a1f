//! Expression code generation.
//!
//! One generator instance compiles one top-level form. It advances a scan
//! counter through the exact traversal order of the liveness walker, so the
//! per-binding ranges computed there line up with the storage the allocator
//! hands out here.
//!
//! Calling convention at every entry point: tagged arguments in
//! `ARG0..ARG2` with overflow in the locals region, raw count in `NARGS`,
//! the callee value in `RES`, the active closure in `SELF`, the return
//! address in `CONT`. Around a non-tail call the generator pushes `CONT`,
//! `SELF` and every resident binding onto the value stack; at a collection
//! checkpoint only `CTX`, `RES`, `SELF` and `CONT` may carry live values,
//! everything else is zeroed by the check stub.

use std::sync::Mutex;

use crate::compiler::ast::{Datum, Expr, LambdaExpr};
use crate::compiler::env::{Env, EnvEntry, LiveRange, Slot};
use crate::compiler::globals::GlobalTable;
use crate::compiler::liveness::LivenessMap;
use crate::compiler::primitives::{
    emit_alloc_fixed, emit_pair_from, emit_raise, emit_vector_ref, emit_vector_set, PrimLibrary,
    HEADER_TYPE_BITS, IDX, LNK_FETCH, UNTAG, VAL,
};
use crate::compiler::regalloc::{Allocator, Storage};
use crate::config::CompilerOptions;
use crate::instr::{regs, Asm, Cond, Instr, Label, LabelAlloc, Reg};
use crate::runtime::context::{ContextLayout, VARSTACK_SLOTS};
use crate::runtime::layout::{self, BlockType, ErrorCode, Word};

/// Labels shared by every form of one program.
pub struct SharedLabels {
    pub dispatch: Label,
    /// Absent when collection is disabled; no checkpoints are emitted then.
    pub gc_check: Option<Label>,
}

/// The three instruction streams one form produces: the main-line code, the
/// lambda bodies, and the constant-data records.
pub struct FormArtifacts {
    pub main: Vec<Instr>,
    pub aux: Vec<Instr>,
    pub data: Vec<Instr>,
}

/// Compile one top-level form.
pub fn generate_form(
    form: &Expr,
    labels: &LabelAlloc,
    options: &CompilerOptions,
    layout: &ContextLayout,
    prims: &PrimLibrary,
    globals: &Mutex<GlobalTable>,
    shared: &SharedLabels,
    liveness: &LivenessMap,
) -> Result<FormArtifacts, String> {
    let mut cg = CodeGen {
        labels,
        options,
        layout,
        prims,
        globals,
        shared,
        liveness,
        env: Env::new(),
        alloc: Allocator::new(options.locals_count as u16),
        scan: 0,
        asm: Asm::new(labels),
        aux: Vec::new(),
        data: Vec::new(),
    };

    // Each form starts with the value stack unwound to the program base.
    cg.load_ctx(regs::TMP0, cg.layout.stack_save);
    cg.store_ctx(regs::TMP0, cg.layout.stack_top);

    cg.gen_expr(form, false)?;

    Ok(FormArtifacts {
        main: cg.asm.into_instrs(),
        aux: cg.aux,
        data: cg.data,
    })
}

/// The closure/primitive dispatch stub, shared by every computed call.
/// Expects the callee value in `RES` and jumps to its entry.
pub fn emit_dispatch(asm: &mut Asm, layout: &ContextLayout, options: &CompilerOptions) -> Label {
    let dispatch = asm.fresh_label();
    let prim = asm.fresh_label();
    let bad = asm.fresh_label();
    asm.align(4);
    asm.bind(dispatch);
    asm.push(Instr::AndImm {
        dst: regs::TMP0,
        a: regs::RES,
        imm: layout::TAG_MASK,
    });
    asm.push(Instr::JccImm {
        cond: Cond::Eq,
        a: regs::TMP0,
        imm: layout::PRIM_TAG as i64,
        target: prim,
    });
    asm.push(Instr::JccImm {
        cond: Cond::Ne,
        a: regs::TMP0,
        imm: layout::PTR_TAG as i64,
        target: bad,
    });
    asm.push(Instr::AndImm {
        dst: regs::TMP0,
        a: regs::RES,
        imm: UNTAG,
    });
    if options.safe_primitives {
        asm.push(Instr::Load {
            dst: regs::TMP1,
            base: regs::TMP0,
            offset: 0,
        });
        asm.push(Instr::AndImm {
            dst: regs::TMP1,
            a: regs::TMP1,
            imm: HEADER_TYPE_BITS,
        });
        asm.push(Instr::JccImm {
            cond: Cond::Ne,
            a: regs::TMP1,
            imm: ((BlockType::Closure as u64) << 3) as i64,
            target: bad,
        });
    }
    asm.push(Instr::Mov {
        dst: regs::SELF,
        src: regs::RES,
    });
    asm.push(Instr::Load {
        dst: regs::TMP1,
        base: regs::TMP0,
        offset: 8,
    });
    asm.push(Instr::JmpReg { target: regs::TMP1 });
    asm.bind(prim);
    asm.push(Instr::Shr {
        dst: regs::TMP0,
        a: regs::RES,
        amount: 3,
    });
    asm.push(Instr::JmpReg { target: regs::TMP0 });
    asm.bind(bad);
    emit_raise(asm, layout, ErrorCode::NotAProcedure);
    dispatch
}

struct CodeGen<'a, 'l> {
    labels: &'l LabelAlloc,
    options: &'a CompilerOptions,
    layout: &'a ContextLayout,
    prims: &'a PrimLibrary,
    globals: &'a Mutex<GlobalTable>,
    shared: &'a SharedLabels,
    liveness: &'a LivenessMap,
    env: Env,
    alloc: Allocator,
    scan: u32,
    asm: Asm<'l>,
    aux: Vec<Instr>,
    data: Vec<Instr>,
}

impl<'l> CodeGen<'_, 'l> {
    fn push(&mut self, instr: Instr) {
        self.asm.push(instr);
    }

    fn fresh(&self) -> Label {
        self.labels.fresh()
    }

    /// Advance the scan counter past the current node, expiring storage
    /// whose range ended strictly before it.
    fn bump(&mut self) -> u32 {
        let index = self.scan;
        self.alloc.release_dead(index);
        self.scan += 1;
        index
    }

    fn load_ctx(&mut self, dst: Reg, offset: u64) {
        self.push(Instr::Load {
            dst,
            base: regs::CTX,
            offset: offset as i32,
        });
    }

    fn store_ctx(&mut self, src: Reg, offset: u64) {
        self.push(Instr::Store {
            src,
            base: regs::CTX,
            offset: offset as i32,
        });
    }

    fn local_offset(&self, slot: u16) -> u64 {
        self.layout.locals + 8 * slot as u64
    }

    fn global_offset(&self, slot: u32) -> u64 {
        self.layout.globals + 8 * slot as u64
    }

    /// Push `src` onto the value stack. Clobbers `TMP0`; `src` must differ.
    fn stack_push(&mut self, src: Reg) {
        debug_assert_ne!(src, regs::TMP0);
        self.load_ctx(regs::TMP0, self.layout.stack_top);
        self.push(Instr::Store {
            src,
            base: regs::TMP0,
            offset: 0,
        });
        self.push(Instr::AddImm {
            dst: regs::TMP0,
            a: regs::TMP0,
            imm: 8,
        });
        self.store_ctx(regs::TMP0, self.layout.stack_top);
    }

    /// Pop the value stack into `dst`. Clobbers `TMP2`; `dst` must differ.
    fn stack_pop(&mut self, dst: Reg) {
        debug_assert_ne!(dst, regs::TMP2);
        self.load_ctx(regs::TMP2, self.layout.stack_top);
        self.push(Instr::AddImm {
            dst: regs::TMP2,
            a: regs::TMP2,
            imm: -8,
        });
        self.store_ctx(regs::TMP2, self.layout.stack_top);
        self.push(Instr::Load {
            dst,
            base: regs::TMP2,
            offset: 0,
        });
    }

    fn gc_checkpoint(&mut self) {
        if let Some(check) = self.shared.gc_check {
            let back = self.fresh();
            self.push(Instr::LoadLabel {
                dst: regs::TMP2,
                label: back,
            });
            self.push(Instr::Jmp { target: check });
            self.asm.bind(back);
        }
    }

    /// Spill every register- or local-resident binding to the value stack.
    /// Returns the spill list for the matching restore.
    fn spill_residents(&mut self) -> Vec<(String, EnvEntry)> {
        let residents = self.env.resident();
        for (_, entry) in &residents {
            match entry.slot {
                Slot::Register(r) => self.stack_push(r),
                Slot::Local(i) => {
                    self.load_ctx(regs::TMP1, self.local_offset(i));
                    self.stack_push(regs::TMP1);
                }
                Slot::Global(_) => unreachable!("globals are never resident"),
            }
        }
        residents
    }

    fn restore_residents(&mut self, spilled: &[(String, EnvEntry)]) {
        for (_, entry) in spilled.iter().rev() {
            match entry.slot {
                Slot::Register(r) => self.stack_pop(r),
                Slot::Local(i) => {
                    self.stack_pop(regs::TMP1);
                    self.store_ctx(regs::TMP1, self.local_offset(i));
                }
                Slot::Global(_) => unreachable!("globals are never resident"),
            }
        }
    }

    fn range_of(&self, name: &str) -> LiveRange {
        self.liveness
            .range_of(name)
            .unwrap_or(LiveRange::new(self.scan, self.scan))
    }

    /// A register if one is free, a local slot otherwise.
    fn alloc_storage(&mut self) -> Result<Storage, String> {
        match self.alloc.next_available_register() {
            Ok(r) => Ok(Storage::Register(r)),
            Err(_) => self
                .alloc
                .next_available_local()
                .map(Storage::Local)
                .map_err(|e| e.to_string()),
        }
    }

    fn store_to(&mut self, storage: Storage, src: Reg) {
        match storage {
            Storage::Register(r) => {
                if r != src {
                    self.push(Instr::Mov { dst: r, src });
                }
            }
            Storage::Local(i) => self.store_ctx(src, self.local_offset(i)),
        }
    }

    fn slot_of(storage: Storage) -> Slot {
        match storage {
            Storage::Register(r) => Slot::Register(r),
            Storage::Local(i) => Slot::Local(i),
        }
    }

    /// Record a read of global slot `slot` in the variable-stack ring.
    fn note_global_access(&mut self, slot: u32) {
        if !self.options.keep_variable_stack {
            return;
        }
        self.load_ctx(regs::TMP1, self.layout.varstack_index);
        self.push(Instr::AndImm {
            dst: regs::TMP2,
            a: regs::TMP1,
            imm: VARSTACK_SLOTS * 8 - 1,
        });
        self.push(Instr::AddImm {
            dst: regs::TMP2,
            a: regs::TMP2,
            imm: self.layout.varstack as i64,
        });
        self.push(Instr::MovImm {
            dst: regs::TMP0,
            imm: Word::fixnum(slot as i64).0,
        });
        self.push(Instr::StoreIdx {
            src: regs::TMP0,
            base: regs::CTX,
            index: regs::TMP2,
        });
        self.push(Instr::AddImm {
            dst: regs::TMP1,
            a: regs::TMP1,
            imm: 8,
        });
        self.store_ctx(regs::TMP1, self.layout.varstack_index);
    }

    fn gen_expr(&mut self, expr: &Expr, tail: bool) -> Result<(), String> {
        self.bump();
        match expr {
            Expr::Fixnum(n) => self.push(Instr::MovImm {
                dst: regs::RES,
                imm: Word::fixnum(*n).0,
            }),
            Expr::Flonum(f) => self.gen_flonum(f.to_bits()),
            Expr::Bool(b) => self.push(Instr::MovImm {
                dst: regs::RES,
                imm: Word::boolean(*b).0,
            }),
            Expr::Char(c) => self.push(Instr::MovImm {
                dst: regs::RES,
                imm: Word::character(*c).0,
            }),
            Expr::Str(s) => self.gen_text_literal(s, BlockType::String),
            Expr::Nil => self.push(Instr::MovImm {
                dst: regs::RES,
                imm: Word::NIL.0,
            }),
            Expr::Void => self.push(Instr::MovImm {
                dst: regs::RES,
                imm: Word::VOID.0,
            }),
            Expr::Quote(d) => self.gen_datum(d)?,
            Expr::Var(name) => self.gen_var(name)?,
            Expr::If { test, then, els } => {
                let otherwise = self.fresh();
                let done = self.fresh();
                self.gen_expr(test, false)?;
                self.push(Instr::JccImm {
                    cond: Cond::Eq,
                    a: regs::RES,
                    imm: Word::FALSE.0 as i64,
                    target: otherwise,
                });
                self.gen_expr(then, tail)?;
                self.push(Instr::Jmp { target: done });
                self.asm.bind(otherwise);
                match els {
                    Some(e) => self.gen_expr(e, tail)?,
                    None => self.push(Instr::MovImm {
                        dst: regs::RES,
                        imm: Word::VOID.0,
                    }),
                }
                self.asm.bind(done);
            }
            Expr::Lambda(lambda) => {
                // A bare lambda is a closure with no captures.
                let entry = self.gen_lambda(lambda)?;
                self.gen_closure_alloc(entry, 0)?;
            }
            Expr::Let { bindings, body } => {
                for b in bindings {
                    let range = self.range_of(&b.name);
                    let storage = self.alloc_storage()?;
                    let fast = self.options.fast_expression_targetting
                        && matches!(storage, Storage::Register(_));
                    let written = if fast {
                        let Storage::Register(r) = storage else {
                            unreachable!()
                        };
                        self.gen_simple_into(&b.init, r)?
                    } else {
                        false
                    };
                    if !written {
                        self.gen_expr(&b.init, false)?;
                        self.store_to(storage, regs::RES);
                    }
                    self.env.insert(
                        &b.name,
                        EnvEntry {
                            slot: Self::slot_of(storage),
                            range,
                        },
                    );
                    self.alloc.record_expiry(storage, range.last);
                }
                if body.is_empty() {
                    self.push(Instr::MovImm {
                        dst: regs::RES,
                        imm: Word::VOID.0,
                    });
                }
                let last = body.len().saturating_sub(1);
                for (k, e) in body.iter().enumerate() {
                    self.gen_expr(e, tail && k == last)?;
                }
                for b in bindings {
                    self.env.remove(&b.name);
                }
            }
            Expr::Begin(body) => {
                if body.is_empty() {
                    self.push(Instr::MovImm {
                        dst: regs::RES,
                        imm: Word::VOID.0,
                    });
                }
                let last = body.len().saturating_sub(1);
                for (k, e) in body.iter().enumerate() {
                    self.gen_expr(e, tail && k == last)?;
                }
            }
            Expr::Define { name, value } => {
                self.gen_expr(value, false)?;
                let slot = self.lock_globals()?.define(name)?;
                self.store_ctx(regs::RES, self.global_offset(slot));
                self.push(Instr::MovImm {
                    dst: regs::RES,
                    imm: Word::VOID.0,
                });
            }
            Expr::Set { name, value } => {
                self.gen_expr(value, false)?;
                if let Some(entry) = self.env.lookup(name).copied() {
                    match entry.slot {
                        Slot::Register(r) => self.push(Instr::Mov {
                            dst: r,
                            src: regs::RES,
                        }),
                        Slot::Local(i) => self.store_ctx(regs::RES, self.local_offset(i)),
                        Slot::Global(s) => self.store_ctx(regs::RES, self.global_offset(s)),
                    }
                } else {
                    let slot = {
                        let mut globals = self.lock_globals()?;
                        match globals.lookup(name) {
                            Some(s) => s,
                            None => globals.allocate_lazy(name)?,
                        }
                    };
                    self.store_ctx(regs::RES, self.global_offset(slot));
                }
                self.push(Instr::MovImm {
                    dst: regs::RES,
                    imm: Word::VOID.0,
                });
            }
            Expr::App { proc, args } => self.gen_app(proc, args, tail)?,
            Expr::PrimApp { name, args } => match name.as_str() {
                "##closure" => self.gen_closure(args)?,
                "##closure-ref" => self.gen_closure_ref(args)?,
                "##vector" => self.gen_inline_vector(args)?,
                "##vector-ref" => self.gen_inline_vector_ref(args)?,
                "##vector-set!" => self.gen_inline_vector_set(args)?,
                _ => self.gen_prim_call(name, args, tail)?,
            },
        }
        Ok(())
    }

    fn lock_globals(&self) -> Result<std::sync::MutexGuard<'_, GlobalTable>, String> {
        self.globals
            .lock()
            .map_err(|_| "global table lock poisoned".to_string())
    }

    /// Emit a simple expression straight into `dst`, bumping the scan as
    /// the normal path would. Returns false when the expression does not
    /// qualify and nothing was emitted.
    fn gen_simple_into(&mut self, expr: &Expr, dst: Reg) -> Result<bool, String> {
        let imm = match expr {
            Expr::Fixnum(n) => Some(Word::fixnum(*n).0),
            Expr::Bool(b) => Some(Word::boolean(*b).0),
            Expr::Char(c) => Some(Word::character(*c).0),
            Expr::Nil => Some(Word::NIL.0),
            Expr::Void => Some(Word::VOID.0),
            _ => None,
        };
        if let Some(imm) = imm {
            self.bump();
            self.push(Instr::MovImm { dst, imm });
            return Ok(true);
        }
        if let Expr::Var(name) = expr {
            if let Some(entry) = self.env.lookup(name).copied() {
                self.bump();
                match entry.slot {
                    Slot::Register(r) => {
                        if r != dst {
                            self.push(Instr::Mov { dst, src: r });
                        }
                    }
                    Slot::Local(i) => self.load_ctx(dst, self.local_offset(i)),
                    Slot::Global(s) => {
                        self.note_global_access(s);
                        self.load_ctx(dst, self.global_offset(s));
                    }
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn gen_var(&mut self, name: &str) -> Result<(), String> {
        if let Some(entry) = self.env.lookup(name).copied() {
            match entry.slot {
                Slot::Register(r) => self.push(Instr::Mov {
                    dst: regs::RES,
                    src: r,
                }),
                Slot::Local(i) => self.load_ctx(regs::RES, self.local_offset(i)),
                Slot::Global(s) => {
                    self.note_global_access(s);
                    self.load_ctx(regs::RES, self.global_offset(s));
                }
            }
            return Ok(());
        }
        let defined = self.lock_globals()?.lookup(name);
        if let Some(slot) = defined {
            self.note_global_access(slot);
            self.load_ctx(regs::RES, self.global_offset(slot));
            return Ok(());
        }
        if let Some(entry) = self.prims.entry_for(name, self.options) {
            self.push(Instr::LoadLabel {
                dst: regs::RES,
                label: entry,
            });
            self.push(Instr::Shl {
                dst: regs::RES,
                a: regs::RES,
                amount: 3,
            });
            self.push(Instr::OrImm {
                dst: regs::RES,
                a: regs::RES,
                imm: layout::PRIM_TAG,
            });
            return Ok(());
        }
        // Forward reference to a definition in a later form.
        let slot = self.lock_globals()?.allocate_lazy(name)?;
        self.note_global_access(slot);
        self.load_ctx(regs::RES, self.global_offset(slot));
        Ok(())
    }

    /// Pop the argument at position `i` into its convention slot.
    fn pop_arg(&mut self, i: usize) {
        if i < regs::ARG_REG_COUNT {
            self.stack_pop(regs::ARG_REGS[i]);
        } else {
            self.stack_pop(regs::TMP1);
            self.store_ctx(regs::TMP1, self.local_offset((i - regs::ARG_REG_COUNT) as u16));
        }
    }

    fn gen_app(&mut self, proc: &Expr, args: &[Expr], tail: bool) -> Result<(), String> {
        // A direct jump when the callee names an unshadowed primitive.
        let known = if let Expr::Var(name) = proc {
            if self.env.lookup(name).is_none() && self.lock_globals()?.lookup(name).is_none() {
                self.prims.entry_for(name, self.options)
            } else {
                None
            }
        } else {
            None
        };

        let mut spilled = Vec::new();
        if !tail {
            self.stack_push(regs::CONT);
            self.stack_push(regs::SELF);
            spilled = self.spill_residents();
        }
        for a in args.iter().rev() {
            self.gen_expr(a, false)?;
            self.stack_push(regs::RES);
        }
        match known {
            Some(_) => {
                // The callee node still occupies a scan slot.
                self.bump();
            }
            None => self.gen_expr(proc, false)?,
        }
        self.gc_checkpoint();
        for i in 0..args.len() {
            self.pop_arg(i);
        }
        self.push(Instr::MovImm {
            dst: regs::NARGS,
            imm: args.len() as u64,
        });
        let ret = self.fresh();
        if !tail {
            self.push(Instr::LoadLabel {
                dst: regs::CONT,
                label: ret,
            });
        }
        match known {
            Some(entry) => self.push(Instr::Jmp { target: entry }),
            None => self.push(Instr::Jmp {
                target: self.shared.dispatch,
            }),
        }
        if !tail {
            self.asm.bind(ret);
            self.restore_residents(&spilled);
            self.stack_pop(regs::SELF);
            self.stack_pop(regs::CONT);
        }
        Ok(())
    }

    /// A call to a library primitive. Arguments evaluate left to right,
    /// matching the liveness walk for primitive applications.
    fn gen_prim_call(&mut self, name: &str, args: &[Expr], tail: bool) -> Result<(), String> {
        let entry = self
            .prims
            .entry_for(name, self.options)
            .ok_or_else(|| format!("unknown primitive `{}`", name))?;
        let mut spilled = Vec::new();
        if !tail {
            self.stack_push(regs::CONT);
            self.stack_push(regs::SELF);
            spilled = self.spill_residents();
        }
        for a in args {
            self.gen_expr(a, false)?;
            self.stack_push(regs::RES);
        }
        self.gc_checkpoint();
        for i in (0..args.len()).rev() {
            self.pop_arg(i);
        }
        self.push(Instr::MovImm {
            dst: regs::NARGS,
            imm: args.len() as u64,
        });
        let ret = self.fresh();
        if !tail {
            self.push(Instr::LoadLabel {
                dst: regs::CONT,
                label: ret,
            });
        }
        self.push(Instr::Jmp { target: entry });
        if !tail {
            self.asm.bind(ret);
            self.restore_residents(&spilled);
            self.stack_pop(regs::SELF);
            self.stack_pop(regs::CONT);
        }
        Ok(())
    }

    /// `(##closure <lambda> cap...)`: generate the body, then allocate the
    /// closure block with the capture values in its payload.
    fn gen_closure(&mut self, args: &[Expr]) -> Result<(), String> {
        let Some((Expr::Lambda(lambda), caps)) = args.split_first() else {
            return Err("##closure expects a lambda in the first position".to_string());
        };
        // The lambda is a walked node of its own.
        self.bump();
        let entry = self.gen_lambda(lambda)?;
        let spilled = self.spill_residents();
        for cap in caps {
            self.gen_expr(cap, false)?;
            self.stack_push(regs::RES);
        }
        self.gc_checkpoint();
        self.emit_closure_block(entry, caps.len());
        self.restore_residents(&spilled);
        Ok(())
    }

    /// Closure allocation for a bare lambda: no captures to pop.
    fn gen_closure_alloc(&mut self, entry: Label, caps: usize) -> Result<(), String> {
        let spilled = self.spill_residents();
        self.gc_checkpoint();
        self.emit_closure_block(entry, caps);
        self.restore_residents(&spilled);
        Ok(())
    }

    /// The capture values sit on top of the value stack, last one on top.
    fn emit_closure_block(&mut self, entry: Label, caps: usize) {
        emit_alloc_fixed(
            &mut self.asm,
            self.layout,
            1 + caps as u64,
            BlockType::Closure,
            self.options.safe_primitives,
        );
        self.push(Instr::LoadLabel {
            dst: regs::TMP1,
            label: entry,
        });
        self.push(Instr::Store {
            src: regs::TMP1,
            base: regs::TMP0,
            offset: 8,
        });
        for i in (0..caps).rev() {
            self.stack_pop(regs::TMP1);
            self.push(Instr::Store {
                src: regs::TMP1,
                base: regs::TMP0,
                offset: (8 * (i + 2)) as i32,
            });
        }
        self.push(Instr::OrImm {
            dst: regs::RES,
            a: regs::TMP0,
            imm: layout::PTR_TAG,
        });
    }

    /// `(##closure-ref <closure> <index>)`.
    fn gen_closure_ref(&mut self, args: &[Expr]) -> Result<(), String> {
        let [clos, idx] = args else {
            return Err("##closure-ref expects two arguments".to_string());
        };
        self.gen_expr(clos, false)?;
        self.stack_push(regs::RES);
        self.gen_expr(idx, false)?;
        self.push(Instr::Mov {
            dst: regs::ARG1,
            src: regs::RES,
        });
        self.stack_pop(regs::ARG0);
        self.push(Instr::AndImm {
            dst: regs::TMP0,
            a: regs::ARG0,
            imm: UNTAG,
        });
        self.push(Instr::Sar {
            dst: regs::TMP2,
            a: regs::ARG1,
            amount: 1,
        });
        self.push(Instr::Shl {
            dst: regs::TMP2,
            a: regs::TMP2,
            amount: 3,
        });
        self.push(Instr::AddImm {
            dst: regs::TMP2,
            a: regs::TMP2,
            imm: 16,
        });
        self.push(Instr::LoadIdx {
            dst: regs::RES,
            base: regs::TMP0,
            index: regs::TMP2,
        });
        Ok(())
    }

    fn gen_inline_vector(&mut self, args: &[Expr]) -> Result<(), String> {
        let spilled = self.spill_residents();
        for a in args {
            self.gen_expr(a, false)?;
            self.stack_push(regs::RES);
        }
        self.gc_checkpoint();
        emit_alloc_fixed(
            &mut self.asm,
            self.layout,
            args.len() as u64,
            BlockType::Vector,
            self.options.safe_primitives,
        );
        for i in (0..args.len()).rev() {
            self.stack_pop(regs::TMP1);
            self.push(Instr::Store {
                src: regs::TMP1,
                base: regs::TMP0,
                offset: (8 * (i + 1)) as i32,
            });
        }
        self.push(Instr::OrImm {
            dst: regs::RES,
            a: regs::TMP0,
            imm: layout::PTR_TAG,
        });
        self.restore_residents(&spilled);
        Ok(())
    }

    fn gen_inline_vector_ref(&mut self, args: &[Expr]) -> Result<(), String> {
        let [vec, idx] = args else {
            return Err("##vector-ref expects two arguments".to_string());
        };
        self.gen_expr(vec, false)?;
        self.stack_push(regs::RES);
        self.gen_expr(idx, false)?;
        self.push(Instr::Mov {
            dst: regs::ARG1,
            src: regs::RES,
        });
        self.stack_pop(regs::ARG0);
        emit_vector_ref(
            &mut self.asm,
            self.layout,
            self.options.safe_primitives,
            regs::ARG0,
            regs::ARG1,
            regs::RES,
        );
        Ok(())
    }

    fn gen_inline_vector_set(&mut self, args: &[Expr]) -> Result<(), String> {
        let [vec, idx, value] = args else {
            return Err("##vector-set! expects three arguments".to_string());
        };
        self.gen_expr(vec, false)?;
        self.stack_push(regs::RES);
        self.gen_expr(idx, false)?;
        self.stack_push(regs::RES);
        self.gen_expr(value, false)?;
        self.push(Instr::Mov {
            dst: regs::ARG2,
            src: regs::RES,
        });
        self.stack_pop(regs::ARG1);
        self.stack_pop(regs::ARG0);
        emit_vector_set(
            &mut self.asm,
            self.layout,
            self.options.safe_primitives,
            regs::ARG0,
            regs::ARG1,
            regs::ARG2,
        );
        self.push(Instr::MovImm {
            dst: regs::RES,
            imm: Word::VOID.0,
        });
        Ok(())
    }

    /// Generate a lambda body into the auxiliary stream with a fresh
    /// environment and allocator; the scan counter is shared with the
    /// enclosing form so the liveness ranges stay aligned.
    fn gen_lambda(&mut self, lambda: &LambdaExpr) -> Result<Label, String> {
        let entry = self.fresh();

        let outer_env = std::mem::take(&mut self.env);
        let outer_alloc = std::mem::replace(
            &mut self.alloc,
            Allocator::new(self.options.locals_count as u16),
        );
        let outer_asm = std::mem::replace(&mut self.asm, Asm::new(self.labels));

        let result = self.gen_lambda_body(lambda, entry);

        let body_asm = std::mem::replace(&mut self.asm, outer_asm);
        self.env = outer_env;
        self.alloc = outer_alloc;
        result?;
        // Nested bodies were appended during generation, so inner lambdas
        // land before their enclosing one.
        self.aux.extend(body_asm.into_instrs());
        Ok(entry)
    }

    fn gen_lambda_body(&mut self, lambda: &LambdaExpr, entry: Label) -> Result<(), String> {
        self.asm.align(4);
        self.asm.bind(entry);

        // The closure-converted self parameter sits in front of the user
        // parameters and stays in its convention register.
        let fixed = lambda.params.len().saturating_sub(1);
        let ok = self.fresh();
        self.push(Instr::JccImm {
            cond: if lambda.rest.is_some() {
                Cond::Ge
            } else {
                Cond::Eq
            },
            a: regs::NARGS,
            imm: fixed as i64,
            target: ok,
        });
        emit_raise(&mut self.asm, self.layout, ErrorCode::BadArgCount);
        self.asm.bind(ok);

        if let Some(self_name) = lambda.params.first() {
            let range = self.range_of(self_name);
            self.env.insert(
                self_name,
                EnvEntry {
                    slot: Slot::Register(regs::SELF),
                    range,
                },
            );
        }

        // Collect the rest arguments before the fixed parameters claim any
        // storage; the fetch stub's scratch registers are all free here.
        // The list is stashed on the value stack until after seeding.
        if lambda.rest.is_some() {
            let head = self.fresh();
            let done = self.fresh();
            self.push(Instr::MovImm {
                dst: regs::RES,
                imm: Word::NIL.0,
            });
            self.push(Instr::Mov {
                dst: IDX,
                src: regs::NARGS,
            });
            self.asm.bind(head);
            self.push(Instr::JccImm {
                cond: Cond::Le,
                a: IDX,
                imm: fixed as i64,
                target: done,
            });
            self.push(Instr::AddImm {
                dst: IDX,
                a: IDX,
                imm: -1,
            });
            let back = self.fresh();
            self.push(Instr::LoadLabel {
                dst: LNK_FETCH,
                label: back,
            });
            self.push(Instr::Jmp {
                target: self.prims.fetch_arg,
            });
            self.asm.bind(back);
            emit_pair_from(
                &mut self.asm,
                self.layout,
                self.options.safe_cons,
                VAL,
                regs::RES,
            );
            self.push(Instr::Jmp { target: head });
            self.asm.bind(done);
            self.stack_push(regs::RES);
        }

        for (i, name) in lambda.params.iter().enumerate().skip(1) {
            let position = i - 1;
            let range = self.range_of(name);
            if position < regs::ARG_REG_COUNT {
                let storage = self.alloc_storage()?;
                self.store_to(storage, regs::ARG_REGS[position]);
                self.env.insert(
                    name,
                    EnvEntry {
                        slot: Self::slot_of(storage),
                        range,
                    },
                );
                self.alloc.record_expiry(storage, range.last);
            } else {
                let slot = (position - regs::ARG_REG_COUNT) as u16;
                self.alloc
                    .make_unavailable(Storage::Local(slot))
                    .map_err(|e| e.to_string())?;
                self.env.insert(
                    name,
                    EnvEntry {
                        slot: Slot::Local(slot),
                        range,
                    },
                );
                self.alloc.record_expiry(Storage::Local(slot), range.last);
            }
        }

        if let Some(rest_name) = &lambda.rest {
            let range = self.range_of(rest_name);
            let storage = self.alloc_storage()?;
            match storage {
                Storage::Register(r) => self.stack_pop(r),
                Storage::Local(i) => {
                    self.stack_pop(regs::TMP1);
                    self.store_ctx(regs::TMP1, self.local_offset(i));
                }
            }
            self.env.insert(
                rest_name,
                EnvEntry {
                    slot: Self::slot_of(storage),
                    range,
                },
            );
            self.alloc.record_expiry(storage, range.last);
        }

        if lambda.body.is_empty() {
            self.push(Instr::MovImm {
                dst: regs::RES,
                imm: Word::VOID.0,
            });
        }
        let last = lambda.body.len().saturating_sub(1);
        for (k, e) in lambda.body.iter().enumerate() {
            self.gen_expr(e, k == last)?;
        }

        self.push(Instr::JmpReg { target: regs::CONT });
        Ok(())
    }

    /// Box a flonum literal.
    fn gen_flonum(&mut self, bits: u64) {
        emit_alloc_fixed(
            &mut self.asm,
            self.layout,
            1,
            BlockType::Flonum,
            self.options.safe_flonums,
        );
        self.push(Instr::MovImm {
            dst: regs::TMP1,
            imm: bits,
        });
        self.push(Instr::Store {
            src: regs::TMP1,
            base: regs::TMP0,
            offset: 8,
        });
        self.push(Instr::OrImm {
            dst: regs::RES,
            a: regs::TMP0,
            imm: layout::PTR_TAG,
        });
    }

    /// Copy a string or symbol literal out of its constant-data template
    /// into a fresh heap block.
    fn gen_text_literal(&mut self, text: &str, ty: BlockType) {
        let count = text.chars().count() as u64;
        let template = self.fresh();
        let mut words = vec![layout::encode_header(count, ty)];
        words.extend(text.chars().map(|c| c as u64));
        self.data.push(Instr::Data {
            label: template,
            words,
        });

        emit_alloc_fixed(
            &mut self.asm,
            self.layout,
            count,
            ty,
            self.options.safe_primitives,
        );
        self.push(Instr::LoadLabel {
            dst: regs::TMP2,
            label: template,
        });
        let head = self.fresh();
        let done = self.fresh();
        self.push(Instr::MovImm {
            dst: regs::ARG0,
            imm: 8,
        });
        self.asm.bind(head);
        self.push(Instr::JccImm {
            cond: Cond::Ge,
            a: regs::ARG0,
            imm: layout::block_size_bytes(count) as i64,
            target: done,
        });
        self.push(Instr::LoadIdx {
            dst: regs::TMP1,
            base: regs::TMP2,
            index: regs::ARG0,
        });
        self.push(Instr::StoreIdx {
            src: regs::TMP1,
            base: regs::TMP0,
            index: regs::ARG0,
        });
        self.push(Instr::AddImm {
            dst: regs::ARG0,
            a: regs::ARG0,
            imm: 8,
        });
        self.push(Instr::Jmp { target: head });
        self.asm.bind(done);
        self.push(Instr::OrImm {
            dst: regs::RES,
            a: regs::TMP0,
            imm: layout::PTR_TAG,
        });
    }

    /// Build a quoted datum. Data construction relies on the heap reserve
    /// between checkpoints, so no scan indices are consumed here; the
    /// liveness walker treats `Quote` as a leaf.
    fn gen_datum(&mut self, datum: &Datum) -> Result<(), String> {
        match datum {
            Datum::Fixnum(n) => self.push(Instr::MovImm {
                dst: regs::RES,
                imm: Word::fixnum(*n).0,
            }),
            Datum::Flonum(f) => self.gen_flonum(f.to_bits()),
            Datum::Bool(b) => self.push(Instr::MovImm {
                dst: regs::RES,
                imm: Word::boolean(*b).0,
            }),
            Datum::Char(c) => self.push(Instr::MovImm {
                dst: regs::RES,
                imm: Word::character(*c).0,
            }),
            Datum::Str(s) => self.gen_text_literal(s, BlockType::String),
            Datum::Sym(s) => self.gen_text_literal(s, BlockType::Symbol),
            Datum::Nil => self.push(Instr::MovImm {
                dst: regs::RES,
                imm: Word::NIL.0,
            }),
            Datum::List(items) => {
                self.push(Instr::MovImm {
                    dst: regs::RES,
                    imm: Word::NIL.0,
                });
                for item in items.iter().rev() {
                    self.stack_push(regs::RES);
                    self.gen_datum(item)?;
                    self.push(Instr::Mov {
                        dst: regs::ARG0,
                        src: regs::RES,
                    });
                    self.stack_pop(regs::ARG1);
                    emit_pair_from(
                        &mut self.asm,
                        self.layout,
                        self.options.safe_cons,
                        regs::ARG0,
                        regs::ARG1,
                    );
                }
            }
            Datum::Vector(items) => {
                for item in items {
                    self.gen_datum(item)?;
                    self.stack_push(regs::RES);
                }
                emit_alloc_fixed(
                    &mut self.asm,
                    self.layout,
                    items.len() as u64,
                    BlockType::Vector,
                    self.options.safe_primitives,
                );
                for i in (0..items.len()).rev() {
                    self.stack_pop(regs::TMP1);
                    self.push(Instr::Store {
                        src: regs::TMP1,
                        base: regs::TMP0,
                        offset: (8 * (i + 1)) as i32,
                    });
                }
                self.push(Instr::OrImm {
                    dst: regs::RES,
                    a: regs::TMP0,
                    imm: layout::PTR_TAG,
                });
            }
        }
        Ok(())
    }
}
