//! End-to-end tests: build alpha-converted programs the way an external
//! front end would, compile them with the default (safe) options and run
//! them on the instruction-stream evaluator.

use std::io::Write;
use std::sync::{Arc, Mutex};

use skink::compiler::ast::{Binding, Datum, Expr, LambdaExpr, Program};
use skink::compiler::foreign::{ForeignDecl, ForeignType, FIRST_USER_INDEX};
use skink::runtime::layout::ErrorCode;
use skink::runtime::machine::render_word;
use skink::{compiler, CompilerOptions, Word};

fn fix(n: i64) -> Expr {
    Expr::Fixnum(n)
}

fn app(proc: Expr, args: Vec<Expr>) -> Expr {
    Expr::App {
        proc: Box::new(proc),
        args,
    }
}

fn call(name: &str, args: Vec<Expr>) -> Expr {
    app(Expr::var(name), args)
}

fn lambda(params: &[&str], body: Vec<Expr>) -> Expr {
    Expr::Lambda(LambdaExpr {
        params: params.iter().map(|p| p.to_string()).collect(),
        rest: None,
        free: Vec::new(),
        body,
    })
}

fn lambda_rest(params: &[&str], rest: &str, body: Vec<Expr>) -> Expr {
    Expr::Lambda(LambdaExpr {
        params: params.iter().map(|p| p.to_string()).collect(),
        rest: Some(rest.to_string()),
        free: Vec::new(),
        body,
    })
}

fn define(name: &str, value: Expr) -> Expr {
    Expr::Define {
        name: name.to_string(),
        value: Box::new(value),
    }
}

fn let1(name: &str, init: Expr, body: Vec<Expr>) -> Expr {
    Expr::Let {
        bindings: vec![Binding {
            name: name.to_string(),
            init,
        }],
        body,
    }
}

fn set(name: &str, value: Expr) -> Expr {
    Expr::Set {
        name: name.to_string(),
        value: Box::new(value),
    }
}

fn if3(test: Expr, then: Expr, els: Expr) -> Expr {
    Expr::If {
        test: Box::new(test),
        then: Box::new(then),
        els: Some(Box::new(els)),
    }
}

fn program(forms: Vec<Expr>) -> Program {
    Program { forms }
}

fn run_ok(forms: Vec<Expr>) -> Word {
    compiler::compile_and_run(&program(forms), &CompilerOptions::default())
        .expect("program should run")
}

fn run_err(forms: Vec<Expr>, options: &CompilerOptions) -> String {
    compiler::compile_and_run(&program(forms), options).expect_err("program should fail")
}

fn fixnum_result(forms: Vec<Expr>) -> i64 {
    let w = run_ok(forms);
    assert!(w.is_fixnum(), "expected a fixnum, got {:?}", w);
    w.as_fixnum()
}

#[test]
fn test_addition() {
    assert_eq!(fixnum_result(vec![call("+", vec![fix(3), fix(7)])]), 10);
}

#[test]
fn test_nested_arithmetic() {
    let e = call(
        "-",
        vec![
            call("*", vec![fix(6), fix(7)]),
            call("+", vec![fix(2), fix(2)]),
        ],
    );
    assert_eq!(fixnum_result(vec![e]), 38);
}

#[test]
fn test_if_and_comparison() {
    let e = if3(call("<", vec![fix(1), fix(2)]), fix(10), fix(20));
    assert_eq!(fixnum_result(vec![e]), 10);
}

#[test]
fn test_booleans_and_eq() {
    let w = run_ok(vec![call("eq?", vec![fix(5), fix(5)])]);
    assert_eq!(w, Word::TRUE);
    let w = run_ok(vec![call("not", vec![Expr::Bool(false)])]);
    assert_eq!(w, Word::TRUE);
}

#[test]
fn test_tail_recursive_sum() {
    // Runs 100 self-calls in tail position; the continuation register must
    // pass through unchanged the whole way down.
    let body = if3(
        call("zero?", vec![Expr::var("n")]),
        Expr::var("acc"),
        call(
            "sum-loop",
            vec![
                call("-", vec![Expr::var("n"), fix(1)]),
                call("+", vec![Expr::var("acc"), Expr::var("n")]),
            ],
        ),
    );
    let forms = vec![
        define("sum-loop", lambda(&["n", "acc"], vec![body])),
        call("sum-loop", vec![fix(100), fix(0)]),
    ];
    assert_eq!(fixnum_result(forms), 5050);
}

#[test]
fn test_counters_have_independent_state() {
    // Each call to make-counter boxes a fresh `n`; the two counters must
    // not share it.
    let counter_body = let1(
        "n",
        fix(0),
        vec![lambda(
            &[],
            vec![
                set("n", call("+", vec![Expr::var("n"), fix(1)])),
                Expr::var("n"),
            ],
        )],
    );
    let forms = vec![
        define("make-counter", lambda(&[], vec![counter_body])),
        define("c1", call("make-counter", vec![])),
        define("c2", call("make-counter", vec![])),
        call("c1", vec![]),
        call("c1", vec![]),
        call(
            "+",
            vec![
                call("*", vec![fix(10), call("c1", vec![])]),
                call("c2", vec![]),
            ],
        ),
    ];
    assert_eq!(fixnum_result(forms), 31);
}

#[test]
fn test_closures_snapshot_their_captures() {
    // No set! is involved, so each closure captures `n` by value; the two
    // adders must hold their own copies.
    let adder = lambda(
        &["n"],
        vec![lambda(
            &["x"],
            vec![call("+", vec![Expr::var("x"), Expr::var("n")])],
        )],
    );
    let forms = vec![
        define("make-adder", adder),
        define("add1", call("make-adder", vec![fix(1)])),
        define("add10", call("make-adder", vec![fix(10)])),
        call(
            "+",
            vec![
                call("add1", vec![fix(5)]),
                call("add10", vec![fix(5)]),
            ],
        ),
    ];
    assert_eq!(fixnum_result(forms), 21);
}

#[test]
fn test_rest_arguments_arrive_as_a_list() {
    let body = call(
        "+",
        vec![
            Expr::var("a"),
            call(
                "+",
                vec![
                    call("car", vec![Expr::var("r")]),
                    call("car", vec![call("cdr", vec![Expr::var("r")])]),
                ],
            ),
        ],
    );
    let e = app(lambda_rest(&["a"], "r", vec![body]), vec![fix(1), fix(2), fix(3)]);
    assert_eq!(fixnum_result(vec![e]), 6);
}

#[test]
fn test_set_on_global() {
    let forms = vec![
        define("cell", fix(1)),
        set("cell", fix(5)),
        call("+", vec![Expr::var("cell"), fix(1)]),
    ];
    assert_eq!(fixnum_result(forms), 6);
}

#[test]
fn test_variable_stack_records_global_slots() {
    let options = CompilerOptions {
        keep_variable_stack: true,
        ..Default::default()
    };
    // Two reads of the vcell global (slot 1); `vl` lives in a register and
    // must leave no trace in the ring.
    let forms = vec![
        define("vzero", fix(0)),
        define("vcell", fix(7)),
        let1(
            "vl",
            fix(1),
            vec![call("+", vec![Expr::var("vcell"), Expr::var("vl")])],
        ),
        Expr::var("vcell"),
    ];
    let compiled = compiler::compile(&program(forms), &options).expect("program should compile");
    let mut machine = compiler::instantiate(&compiled);
    let w = machine.run(compiled.entry).expect("program should run");
    assert_eq!(w.as_fixnum(), 7);

    let layout = &compiled.layout;
    assert_eq!(machine.ctx.read_u64(layout.varstack_index), 16);
    let first = Word(machine.ctx.read_u64(layout.varstack));
    let second = Word(machine.ctx.read_u64(layout.varstack + 8));
    assert_eq!(first.as_fixnum(), 1);
    assert_eq!(second.as_fixnum(), 1);
}

#[test]
fn test_vector_operations() {
    let body = vec![
        call("vector-set!", vec![Expr::var("v"), fix(1), fix(42)]),
        call(
            "+",
            vec![
                call("vector-ref", vec![Expr::var("v"), fix(1)]),
                call("vector-length", vec![Expr::var("v")]),
            ],
        ),
    ];
    let e = let1("v", call("make-vector", vec![fix(3), fix(0)]), body);
    assert_eq!(fixnum_result(vec![e]), 45);
}

#[test]
fn test_string_operations() {
    let e = call(
        "+",
        vec![
            call("string-length", vec![Expr::Str("hello".to_string())]),
            call("char->integer", vec![Expr::Char('A')]),
        ],
    );
    assert_eq!(fixnum_result(vec![e]), 70);
    let w = run_ok(vec![call(
        "string=?",
        vec![Expr::Str("abc".to_string()), Expr::Str("abc".to_string())],
    )]);
    assert_eq!(w, Word::TRUE);
}

#[test]
fn test_make_string_negative_length_is_caught() {
    // The allocation after the bad make-string must never run: a negative
    // count would move the allocation pointer backward.
    let forms = vec![Expr::Begin(vec![
        call("make-string", vec![fix(-2)]),
        call("cons", vec![fix(1), fix(2)]),
    ])];
    let err = run_err(forms, &CompilerOptions::default());
    assert_eq!(err, ErrorCode::BadArgType.describe());
}

#[test]
fn test_make_string_fill_must_be_a_character() {
    let err = run_err(
        vec![call("make-string", vec![fix(3), fix(5)])],
        &CompilerOptions::default(),
    );
    assert_eq!(err, ErrorCode::BadArgType.describe());
}

#[test]
fn test_vector_ref_out_of_bounds_is_caught() {
    let e = call(
        "vector-ref",
        vec![call("make-vector", vec![fix(2), fix(0)]), fix(5)],
    );
    let err = run_err(vec![e], &CompilerOptions::default());
    assert_eq!(err, ErrorCode::IndexOutOfBounds.describe());
}

#[test]
fn test_calling_a_non_procedure_is_caught() {
    let err = run_err(vec![app(fix(5), vec![fix(6)])], &CompilerOptions::default());
    assert_eq!(err, ErrorCode::NotAProcedure.describe());
}

#[test]
fn test_wrong_argument_count_is_caught() {
    let err = run_err(vec![call("car", vec![])], &CompilerOptions::default());
    assert_eq!(err, ErrorCode::BadArgCount.describe());
}

#[test]
fn test_division_by_zero_is_caught() {
    let err = run_err(
        vec![call("quotient", vec![fix(1), fix(0)])],
        &CompilerOptions::default(),
    );
    assert_eq!(err, ErrorCode::DivisionByZero.describe());
}

fn small_heap_options(bytes: u64) -> CompilerOptions {
    CompilerOptions {
        heap_semispace_bytes: bytes,
        ..Default::default()
    }
}

/// Builds `(grow k acc)`, consing `k` retained pairs.
fn grow_form(name: &str, n: &str, acc: &str, count: i64) -> Vec<Expr> {
    let body = if3(
        call("zero?", vec![Expr::var(n)]),
        Expr::var(acc),
        call(
            name,
            vec![
                call("-", vec![Expr::var(n), fix(1)]),
                call("cons", vec![Expr::var(n), Expr::var(acc)]),
            ],
        ),
    );
    vec![
        define(name, lambda(&[n, acc], vec![body])),
        call(name, vec![fix(count), Expr::Nil]),
    ]
}

#[test]
fn test_heap_full_when_live_data_exceeds_semispace() {
    // 500 live pairs need 8000 bytes; a 2 KiB semispace cannot hold them
    // no matter how often the collector runs.
    let err = run_err(
        grow_form("grow", "gn", "gacc", 500),
        &small_heap_options(2048),
    );
    assert_eq!(err, ErrorCode::HeapFull.describe());
}

#[test]
fn test_collector_reclaims_garbage() {
    // 2000 discarded pairs allocated through a 2 KiB semispace force many
    // collections; none of them is live at the checkpoints.
    let body = if3(
        call("zero?", vec![Expr::var("ck")]),
        fix(99),
        Expr::Begin(vec![
            call("cons", vec![Expr::var("ck"), Expr::var("ck")]),
            call("churn", vec![call("-", vec![Expr::var("ck"), fix(1)])]),
        ]),
    );
    let forms = vec![
        define("churn", lambda(&["ck"], vec![body])),
        call("churn", vec![fix(2000)]),
    ];
    let w = compiler::compile_and_run(&program(forms), &small_heap_options(2048))
        .expect("program should run");
    assert_eq!(w.as_fixnum(), 99);
}

#[test]
fn test_quoted_structure_survives_collection() {
    let body = if3(
        call("zero?", vec![Expr::var("qk")]),
        fix(0),
        Expr::Begin(vec![
            call("cons", vec![Expr::var("qk"), Expr::var("qk")]),
            call("qchurn", vec![call("-", vec![Expr::var("qk"), fix(1)])]),
        ]),
    );
    let forms = vec![
        define(
            "qdata",
            Expr::Quote(Datum::List(vec![
                Datum::Fixnum(1),
                Datum::Fixnum(2),
                Datum::Fixnum(3),
            ])),
        ),
        define("qchurn", lambda(&["qk"], vec![body])),
        call("qchurn", vec![fix(2000)]),
        call(
            "+",
            vec![
                call("car", vec![Expr::var("qdata")]),
                call(
                    "car",
                    vec![call("cdr", vec![call("cdr", vec![Expr::var("qdata")])])],
                ),
            ],
        ),
    ];
    let w = compiler::compile_and_run(&program(forms), &small_heap_options(2048))
        .expect("program should run");
    assert_eq!(w.as_fixnum(), 4);
}

#[test]
fn test_quoted_list_renders() {
    let compiled = compiler::compile(
        &program(vec![Expr::Quote(Datum::List(vec![
            Datum::Fixnum(1),
            Datum::Sym("two".to_string()),
            Datum::Fixnum(3),
        ]))]),
        &CompilerOptions::default(),
    )
    .expect("program should compile");
    let mut machine = compiler::instantiate(&compiled);
    let w = machine.run(compiled.entry).expect("program should run");
    assert_eq!(render_word(&machine.ctx, w, true), "(1 two 3)");
}

#[derive(Clone)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_display_writes_to_the_output_sink() {
    let forms = vec![Expr::Begin(vec![
        call("display", vec![fix(42)]),
        call("newline", vec![]),
        call("display", vec![Expr::Str("hi".to_string())]),
    ])];
    let compiled = compiler::compile(&program(forms), &CompilerOptions::default())
        .expect("program should compile");
    let buf = SharedBuf(Arc::new(Mutex::new(Vec::new())));
    let mut machine = compiler::instantiate(&compiled).with_output(Box::new(buf.clone()));
    machine.run(compiled.entry).expect("program should run");
    let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
    assert_eq!(out, "42\nhi");
}

#[test]
fn test_foreign_function_round_trip() {
    let decls = vec![ForeignDecl {
        name: "host/add".to_string(),
        params: vec![ForeignType::Int64, ForeignType::Int64],
        ret: ForeignType::Int64,
    }];
    let forms = vec![call("host/add", vec![fix(19), fix(23)])];
    let compiled =
        compiler::compile_with_foreigns(&program(forms), &CompilerOptions::default(), &decls)
            .expect("program should compile");
    let mut machine = compiler::instantiate(&compiled);
    machine.register_foreign(
        FIRST_USER_INDEX as usize,
        Box::new(|_, args| (args[0] as i64 + args[1] as i64) as u64),
    );
    let w = machine.run(compiled.entry).expect("program should run");
    assert_eq!(w.as_fixnum(), 42);
}

#[test]
fn test_unsafe_primitives_still_compute() {
    let options = CompilerOptions {
        safe_primitives: false,
        safe_flonums: false,
        safe_cons: false,
        ..Default::default()
    };
    let w = compiler::compile_and_run(&program(vec![call("+", vec![fix(3), fix(4)])]), &options)
        .expect("program should run");
    assert_eq!(w.as_fixnum(), 7);
}

#[test]
fn test_parallel_compilation_matches_sequential() {
    let forms = || {
        vec![
            define("pa", fix(30)),
            define("pb", call("+", vec![Expr::var("pa"), fix(12)])),
            call("-", vec![Expr::var("pb"), Expr::var("pa")]),
        ]
    };
    let sequential = compiler::compile_and_run(&program(forms()), &CompilerOptions::default())
        .expect("program should run");
    let options = CompilerOptions {
        parallel: true,
        ..Default::default()
    };
    let parallel =
        compiler::compile_and_run(&program(forms()), &options).expect("program should run");
    assert_eq!(sequential, parallel);
    assert_eq!(parallel.as_fixnum(), 12);
}

#[test]
fn test_program_loads_from_json_file() {
    // The driver path: a front end hands over a serialized AST on disk.
    let forms = vec![call("+", vec![fix(3), fix(7)])];
    let text = serde_json::to_string(&program(forms)).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("prog.json");
    std::fs::write(&path, text).unwrap();

    let loaded: Program = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let w = compiler::compile_and_run(&loaded, &CompilerOptions::default())
        .expect("program should run");
    assert_eq!(w.as_fixnum(), 10);
}
