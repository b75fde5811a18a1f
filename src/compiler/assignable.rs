//! Assignable-variable conversion.
//!
//! Register and stack storage cannot be shared between a closure and its
//! capturing scope once mutated after capture, so every variable that is
//! the target of a `set!` (other than a top-level definition) is boxed
//! into a one-element heap vector: the binding's initializer is wrapped in
//! a `##vector` allocation, reads become `##vector-ref`, writes become
//! `##vector-set!`. Requires alpha-converted input; each top-level form is
//! processed independently, so the pass parallelizes with no shared state.

use std::collections::BTreeSet;

use crate::compiler::ast::{Binding, Expr, LambdaExpr};

/// Convert one top-level form.
pub fn convert(form: Expr, top_level: &BTreeSet<String>) -> Expr {
    let mut mutated = BTreeSet::new();
    collect_mutated(&form, top_level, &mut mutated);
    if mutated.is_empty() {
        return form;
    }
    let mut fresh = 0u32;
    rewrite(form, &mutated, &mut fresh)
}

/// Names that are `set!` targets bound inside the form (top-level names
/// mutate their global slot instead and stay unboxed).
fn collect_mutated(expr: &Expr, top_level: &BTreeSet<String>, acc: &mut BTreeSet<String>) {
    match expr {
        Expr::Set { name, value } => {
            if !top_level.contains(name) {
                acc.insert(name.clone());
            }
            collect_mutated(value, top_level, acc);
        }
        Expr::If { test, then, els } => {
            collect_mutated(test, top_level, acc);
            collect_mutated(then, top_level, acc);
            if let Some(e) = els {
                collect_mutated(e, top_level, acc);
            }
        }
        Expr::Lambda(lambda) => {
            for e in &lambda.body {
                collect_mutated(e, top_level, acc);
            }
        }
        Expr::Let { bindings, body } => {
            for b in bindings {
                collect_mutated(&b.init, top_level, acc);
            }
            for e in body {
                collect_mutated(e, top_level, acc);
            }
        }
        Expr::Begin(body) => {
            for e in body {
                collect_mutated(e, top_level, acc);
            }
        }
        Expr::Define { value, .. } => collect_mutated(value, top_level, acc),
        Expr::App { proc, args } => {
            collect_mutated(proc, top_level, acc);
            for a in args {
                collect_mutated(a, top_level, acc);
            }
        }
        Expr::PrimApp { args, .. } => {
            for a in args {
                collect_mutated(a, top_level, acc);
            }
        }
        _ => {}
    }
}

fn boxed_read(name: &str) -> Expr {
    Expr::prim("##vector-ref", vec![Expr::var(name), Expr::Fixnum(0)])
}

fn rewrite(expr: Expr, mutated: &BTreeSet<String>, fresh: &mut u32) -> Expr {
    match expr {
        Expr::Var(name) => {
            if mutated.contains(&name) {
                boxed_read(&name)
            } else {
                Expr::Var(name)
            }
        }
        Expr::Set { name, value } => {
            let value = rewrite(*value, mutated, fresh);
            if mutated.contains(&name) {
                Expr::prim(
                    "##vector-set!",
                    vec![Expr::Var(name), Expr::Fixnum(0), value],
                )
            } else {
                Expr::Set {
                    name,
                    value: Box::new(value),
                }
            }
        }
        Expr::Let { bindings, body } => Expr::Let {
            bindings: bindings
                .into_iter()
                .map(|b| {
                    let init = rewrite(b.init, mutated, fresh);
                    let init = if mutated.contains(&b.name) {
                        Expr::prim("##vector", vec![init])
                    } else {
                        init
                    };
                    Binding { name: b.name, init }
                })
                .collect(),
            body: body.into_iter().map(|e| rewrite(e, mutated, fresh)).collect(),
        },
        Expr::Lambda(lambda) => Expr::Lambda(rewrite_lambda(lambda, mutated, fresh)),
        Expr::If { test, then, els } => Expr::If {
            test: Box::new(rewrite(*test, mutated, fresh)),
            then: Box::new(rewrite(*then, mutated, fresh)),
            els: els.map(|e| Box::new(rewrite(*e, mutated, fresh))),
        },
        Expr::Begin(body) => {
            Expr::Begin(body.into_iter().map(|e| rewrite(e, mutated, fresh)).collect())
        }
        Expr::Define { name, value } => Expr::Define {
            name,
            value: Box::new(rewrite(*value, mutated, fresh)),
        },
        Expr::App { proc, args } => Expr::App {
            proc: Box::new(rewrite(*proc, mutated, fresh)),
            args: args.into_iter().map(|a| rewrite(a, mutated, fresh)).collect(),
        },
        Expr::PrimApp { name, args } => Expr::PrimApp {
            name,
            args: args.into_iter().map(|a| rewrite(a, mutated, fresh)).collect(),
        },
        other => other,
    }
}

/// A mutated parameter cannot change the calling convention, so it is
/// received under a fresh raw name and immediately rebound to a box:
/// `(lambda (p) ...)` becomes `(lambda (#%raw0) (let ((p (##vector #%raw0))) ...))`.
fn rewrite_lambda(lambda: LambdaExpr, mutated: &BTreeSet<String>, fresh: &mut u32) -> LambdaExpr {
    let body: Vec<Expr> = lambda
        .body
        .into_iter()
        .map(|e| rewrite(e, mutated, fresh))
        .collect();

    let mut boxed_params = Vec::new();
    let rebind = |name: &mut String, boxed: &mut Vec<(String, String)>, fresh: &mut u32| {
        if mutated.contains(name.as_str()) {
            let raw = format!("#%raw{}", *fresh);
            *fresh += 1;
            boxed.push((name.clone(), raw.clone()));
            *name = raw;
        }
    };

    let mut params = lambda.params;
    for p in &mut params {
        rebind(p, &mut boxed_params, fresh);
    }
    let mut rest = lambda.rest;
    if let Some(r) = &mut rest {
        rebind(r, &mut boxed_params, fresh);
    }

    let body = if boxed_params.is_empty() {
        body
    } else {
        vec![Expr::Let {
            bindings: boxed_params
                .into_iter()
                .map(|(name, raw)| Binding {
                    name,
                    init: Expr::prim("##vector", vec![Expr::Var(raw)]),
                })
                .collect(),
            body,
        }]
    };

    LambdaExpr {
        params,
        rest,
        free: lambda.free,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert_form(form: Expr) -> Expr {
        convert(form, &BTreeSet::new())
    }

    #[test]
    fn test_unmutated_form_unchanged() {
        let form = Expr::Let {
            bindings: vec![Binding {
                name: "x".into(),
                init: Expr::Fixnum(1),
            }],
            body: vec![Expr::var("x")],
        };
        match convert_form(form) {
            Expr::Let { bindings, body } => {
                assert!(matches!(bindings[0].init, Expr::Fixnum(1)));
                assert!(matches!(&body[0], Expr::Var(n) if n == "x"));
            }
            other => panic!("expected let, got {:?}", other),
        }
    }

    #[test]
    fn test_mutated_let_binding_is_boxed() {
        // (let ((x 1)) (set! x 2) x)
        let form = Expr::Let {
            bindings: vec![Binding {
                name: "x".into(),
                init: Expr::Fixnum(1),
            }],
            body: vec![
                Expr::Set {
                    name: "x".into(),
                    value: Box::new(Expr::Fixnum(2)),
                },
                Expr::var("x"),
            ],
        };
        match convert_form(form) {
            Expr::Let { bindings, body } => {
                assert!(
                    matches!(&bindings[0].init, Expr::PrimApp { name, .. } if name == "##vector")
                );
                assert!(
                    matches!(&body[0], Expr::PrimApp { name, .. } if name == "##vector-set!")
                );
                assert!(
                    matches!(&body[1], Expr::PrimApp { name, .. } if name == "##vector-ref")
                );
            }
            other => panic!("expected let, got {:?}", other),
        }
    }

    #[test]
    fn test_top_level_set_stays_global() {
        let mut top = BTreeSet::new();
        top.insert("g".to_string());
        let form = Expr::Set {
            name: "g".into(),
            value: Box::new(Expr::Fixnum(3)),
        };
        match convert(form, &top) {
            Expr::Set { name, .. } => assert_eq!(name, "g"),
            other => panic!("expected set, got {:?}", other),
        }
    }

    #[test]
    fn test_mutated_parameter_rebound_through_box() {
        // (lambda (p) (set! p 1) p)
        let form = Expr::Lambda(LambdaExpr {
            params: vec!["p".into()],
            rest: None,
            free: vec![],
            body: vec![
                Expr::Set {
                    name: "p".into(),
                    value: Box::new(Expr::Fixnum(1)),
                },
                Expr::var("p"),
            ],
        });
        match convert_form(form) {
            Expr::Lambda(l) => {
                assert_eq!(l.params, vec!["#%raw0".to_string()]);
                match &l.body[0] {
                    Expr::Let { bindings, body } => {
                        assert_eq!(bindings[0].name, "p");
                        assert!(matches!(
                            &bindings[0].init,
                            Expr::PrimApp { name, .. } if name == "##vector"
                        ));
                        assert!(matches!(
                            &body[0],
                            Expr::PrimApp { name, .. } if name == "##vector-set!"
                        ));
                    }
                    other => panic!("expected let wrapper, got {:?}", other),
                }
            }
            other => panic!("expected lambda, got {:?}", other),
        }
    }
}
