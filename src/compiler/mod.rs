//! The compiler pipeline.
//!
//! `compile` runs one program through alpha checking, free-variable
//! annotation, assignable and closure conversion, liveness analysis and
//! code generation, then links the assembled stream against a context
//! layout. Forms are independent after global-slot assignment, so with
//! `parallel` enabled each form compiles on its own thread; the label
//! allocator and the global table are the only shared state.
//!
//! Stream order: program entry and prologue, the per-form main lines, the
//! termination sequence, the error handler, the dispatch and collector
//! stubs, the primitive library, the lambda bodies, and finally the
//! constant-data records.

pub mod assignable;
pub mod ast;
pub mod closure;
pub mod codegen;
pub mod env;
pub mod foreign;
pub mod gc;
pub mod globals;
pub mod liveness;
pub mod primitives;
pub mod regalloc;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use crate::compiler::ast::Program;
use crate::compiler::codegen::{FormArtifacts, SharedLabels};
use crate::compiler::foreign::ForeignDecl;
use crate::compiler::globals::GlobalTable;
use crate::compiler::primitives::emit_raise;
use crate::config::CompilerOptions;
use crate::instr::{link, regs, Asm, Instr, Label, LabelAlloc, Linked};
use crate::runtime::context::{Context, ContextLayout};
use crate::runtime::layout::{ErrorCode, Word};
use crate::runtime::machine::Machine;

/// Everything needed to instantiate and run a compiled program.
pub struct CompiledProgram {
    pub instrs: Vec<Instr>,
    pub entry: Label,
    pub label_count: u32,
    /// Initial global-slot image; `RESERVED` for compile-time defines,
    /// `UNALLOCATED` for lazily allocated slots.
    pub globals_image: Vec<u64>,
    /// Resolved entry address per primitive, under the compiled safety
    /// options. Lets embedders seed globals with primitive values.
    pub primitive_table: BTreeMap<String, u64>,
    /// Foreign functions in `ForeignCall` index order.
    pub foreign_names: Vec<String>,
    pub layout: ContextLayout,
    pub linked: Linked,
}

pub fn compile(program: &Program, options: &CompilerOptions) -> Result<CompiledProgram, String> {
    compile_with_foreigns(program, options, &[])
}

pub fn compile_with_foreigns(
    program: &Program,
    options: &CompilerOptions,
    foreigns: &[ForeignDecl],
) -> Result<CompiledProgram, String> {
    ast::check_alpha(program)?;
    let mut program = program.clone();
    ast::annotate_free_vars(&mut program);

    let labels = LabelAlloc::new();
    // Every offset the generated code bakes in sits below the constant
    // region, so a zero-data layout is valid for code generation; the
    // final layout is rebuilt once the data size is known.
    let prefix_layout = ContextLayout::new(options, 0);

    let mut table = GlobalTable::new(options.globals_count);
    table.allocate_defines(&program)?;
    let top_level: BTreeSet<String> = table.names().cloned().collect();
    let globals = Mutex::new(table);

    let mut stub_asm = Asm::new(&labels);
    let dispatch = codegen::emit_dispatch(&mut stub_asm, &prefix_layout, options);
    let gc_check = options
        .garbage_collection
        .then(|| gc::generate(&mut stub_asm, &prefix_layout).check);

    let mut prim_asm = Asm::new(&labels);
    let prims = primitives::generate(&mut prim_asm, options, &prefix_layout, foreigns)?;

    let known_globals: BTreeSet<String> = top_level
        .iter()
        .cloned()
        .chain(prims.names().cloned())
        .collect();

    let shared = SharedLabels { dispatch, gc_check };

    let process = |form: &ast::Expr| -> Result<FormArtifacts, String> {
        let form = assignable::convert(form.clone(), &top_level);
        let form = closure::convert(form, &known_globals)?;
        let live = liveness::analyze(&form, options.liveness);
        codegen::generate_form(
            &form,
            &labels,
            options,
            &prefix_layout,
            &prims,
            &globals,
            &shared,
            &live,
        )
    };

    let artifacts: Vec<FormArtifacts> = if options.parallel {
        std::thread::scope(|scope| {
            let process = &process;
            let handles: Vec<_> = program
                .forms
                .iter()
                .map(|form| scope.spawn(move || process(form)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err("form compilation panicked".to_string()))
                })
                .collect::<Result<Vec<_>, String>>()
        })?
    } else {
        program
            .forms
            .iter()
            .map(process)
            .collect::<Result<Vec<_>, String>>()?
    };

    // Assemble the full stream.
    let mut asm = Asm::new(&labels);
    let entry = labels.fresh();
    let handler = labels.fresh();
    asm.bind(entry);
    asm.push(Instr::LoadLabel {
        dst: regs::TMP0,
        label: handler,
    });
    asm.push(Instr::Store {
        src: regs::TMP0,
        base: regs::CTX,
        offset: prefix_layout.error_handler as i32,
    });
    asm.push(Instr::Load {
        dst: regs::TMP0,
        base: regs::CTX,
        offset: prefix_layout.stack_top as i32,
    });
    asm.push(Instr::Store {
        src: regs::TMP0,
        base: regs::CTX,
        offset: prefix_layout.stack_save as i32,
    });
    for art in &artifacts {
        asm.align(4);
        for i in &art.main {
            asm.push(i.clone());
        }
    }
    if options.do_cps_conversion {
        // Control must leave through a continuation, never off the end.
        emit_raise(&mut asm, &prefix_layout, ErrorCode::InvalidTermination);
    } else {
        asm.push(Instr::Halt);
    }
    asm.bind(handler);
    asm.push(Instr::Halt);

    asm.align(4);
    asm.extend(stub_asm);
    asm.align(4);
    asm.extend(prim_asm);
    for art in &artifacts {
        asm.align(4);
        for i in &art.aux {
            asm.push(i.clone());
        }
    }
    for art in &artifacts {
        for i in &art.data {
            asm.push(i.clone());
        }
    }

    let instrs = asm.into_instrs();
    let label_count = labels.count();
    let linked = link(&instrs, label_count, &prefix_layout);
    let layout = ContextLayout::new(options, linked.data_bytes);

    let mut primitive_table = BTreeMap::new();
    for (name, prim) in prims.entries() {
        let lbl = if options.safe_primitives {
            prim.checked
        } else {
            prim.fast
        };
        if let Some(addr) = linked.addr_of(lbl) {
            primitive_table.insert(name.clone(), addr);
        }
    }

    let mut foreign_names = vec![
        "sys/display".to_string(),
        "sys/write".to_string(),
        "sys/put-char".to_string(),
    ];
    foreign_names.extend(foreigns.iter().map(|d| d.name.clone()));

    let globals_image = globals
        .into_inner()
        .map_err(|_| "global table lock poisoned".to_string())?
        .image()
        .to_vec();

    Ok(CompiledProgram {
        instrs,
        entry,
        label_count,
        globals_image,
        primitive_table,
        foreign_names,
        layout,
        linked,
    })
}

/// Instantiate a machine for `compiled` with a fresh context.
pub fn instantiate(compiled: &CompiledProgram) -> Machine {
    let ctx = Context::new(compiled.layout.clone(), &compiled.globals_image);
    Machine::new(
        ctx,
        compiled.instrs.clone(),
        &compiled.linked,
        &compiled.foreign_names,
    )
}

/// Run a compiled program to completion. Error words raised through the
/// generated handler come back as `Err` with their description.
pub fn run(compiled: &CompiledProgram) -> Result<Word, String> {
    let mut machine = instantiate(compiled);
    let result = machine.run(compiled.entry)?;
    match result.error_code() {
        Some(code) => Err(code.describe().to_string()),
        None => Ok(result),
    }
}

pub fn compile_and_run(program: &Program, options: &CompilerOptions) -> Result<Word, String> {
    let compiled = compile(program, options)?;
    run(&compiled)
}
