//! Closure conversion.
//!
//! Requires free-variable annotations on every lambda. Each lambda is
//! replaced by a `##closure` construction primitive call carrying the
//! lambda (now prefixed with an implicit self-reference parameter) plus
//! one argument per captured variable, evaluated in the enclosing scope.
//! Inside the body every reference to a captured variable becomes a
//! `##closure-ref` through the self parameter. Self names are generated
//! deterministically (`#%self<N>`, N reset per top-level form) so output
//! is reproducible.

use std::collections::{BTreeSet, HashMap};

use crate::compiler::ast::{self, Binding, Expr, LambdaExpr};

/// Convert one top-level form. `known_globals` holds every name that
/// resolves to a global slot or primitive, used only to verify the
/// annotation precondition.
pub fn convert(form: Expr, known_globals: &BTreeSet<String>) -> Result<Expr, String> {
    verify_annotations(&form, known_globals)?;
    let mut counter = 0u32;
    Ok(rewrite(form, &HashMap::new(), &mut counter))
}

/// Assert the free-variable precondition: every lambda's annotation covers
/// its actual captures. A missing annotation is a compiler-internal error.
fn verify_annotations(expr: &Expr, known_globals: &BTreeSet<String>) -> Result<(), String> {
    fn check(lambda: &LambdaExpr, known_globals: &BTreeSet<String>) -> Result<(), String> {
        let mut bound: BTreeSet<String> = lambda.params.iter().cloned().collect();
        if let Some(rest) = &lambda.rest {
            bound.insert(rest.clone());
        }
        let mut actual = BTreeSet::new();
        for e in &lambda.body {
            ast::free_vars(e, &bound, &mut actual);
        }
        let annotated: BTreeSet<String> = lambda.free.iter().cloned().collect();
        for name in &actual {
            if !annotated.contains(name) && !known_globals.contains(name) {
                return Err(format!(
                    "free-variable analysis missing: lambda captures `{}` without annotation",
                    name
                ));
            }
        }
        Ok(())
    }
    fn walk(expr: &Expr, known_globals: &BTreeSet<String>) -> Result<(), String> {
        match expr {
            Expr::Lambda(lambda) => {
                check(lambda, known_globals)?;
                for e in &lambda.body {
                    walk(e, known_globals)?;
                }
            }
            Expr::If { test, then, els } => {
                walk(test, known_globals)?;
                walk(then, known_globals)?;
                if let Some(e) = els {
                    walk(e, known_globals)?;
                }
            }
            Expr::Let { bindings, body } => {
                for b in bindings {
                    walk(&b.init, known_globals)?;
                }
                for e in body {
                    walk(e, known_globals)?;
                }
            }
            Expr::Begin(body) => {
                for e in body {
                    walk(e, known_globals)?;
                }
            }
            Expr::Define { value, .. } | Expr::Set { value, .. } => walk(value, known_globals)?,
            Expr::App { proc, args } => {
                walk(proc, known_globals)?;
                for a in args {
                    walk(a, known_globals)?;
                }
            }
            Expr::PrimApp { args, .. } => {
                for a in args {
                    walk(a, known_globals)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
    walk(expr, known_globals)
}

/// Maps a captured name to (self parameter, capture index).
type CaptureMap = HashMap<String, (String, usize)>;

fn rewrite_var(name: String, captures: &CaptureMap) -> Expr {
    match captures.get(&name) {
        Some((self_name, index)) => Expr::prim(
            "##closure-ref",
            vec![Expr::var(self_name), Expr::Fixnum(*index as i64)],
        ),
        None => Expr::Var(name),
    }
}

fn rewrite(expr: Expr, captures: &CaptureMap, counter: &mut u32) -> Expr {
    match expr {
        Expr::Var(name) => rewrite_var(name, captures),
        Expr::Lambda(lambda) => {
            let self_name = format!("#%self{}", *counter);
            *counter += 1;

            let mut inner: CaptureMap = HashMap::new();
            for (index, name) in lambda.free.iter().enumerate() {
                inner.insert(name.clone(), (self_name.clone(), index));
            }

            let mut params = Vec::with_capacity(lambda.params.len() + 1);
            params.push(self_name);
            params.extend(lambda.params);

            let body = lambda
                .body
                .into_iter()
                .map(|e| rewrite(e, &inner, counter))
                .collect();

            // Capture arguments are evaluated in the enclosing scope and
            // therefore rewritten against the enclosing capture map.
            let mut args = Vec::with_capacity(lambda.free.len() + 1);
            args.push(Expr::Lambda(LambdaExpr {
                params,
                rest: lambda.rest,
                free: Vec::new(),
                body,
            }));
            for name in lambda.free {
                args.push(rewrite_var(name, captures));
            }
            Expr::prim("##closure", args)
        }
        Expr::If { test, then, els } => Expr::If {
            test: Box::new(rewrite(*test, captures, counter)),
            then: Box::new(rewrite(*then, captures, counter)),
            els: els.map(|e| Box::new(rewrite(*e, captures, counter))),
        },
        Expr::Let { bindings, body } => Expr::Let {
            bindings: bindings
                .into_iter()
                .map(|b| Binding {
                    name: b.name,
                    init: rewrite(b.init, captures, counter),
                })
                .collect(),
            body: body
                .into_iter()
                .map(|e| rewrite(e, captures, counter))
                .collect(),
        },
        Expr::Begin(body) => Expr::Begin(
            body.into_iter()
                .map(|e| rewrite(e, captures, counter))
                .collect(),
        ),
        Expr::Define { name, value } => Expr::Define {
            name,
            value: Box::new(rewrite(*value, captures, counter)),
        },
        Expr::Set { name, value } => Expr::Set {
            name,
            value: Box::new(rewrite(*value, captures, counter)),
        },
        Expr::App { proc, args } => Expr::App {
            proc: Box::new(rewrite(*proc, captures, counter)),
            args: args
                .into_iter()
                .map(|a| rewrite(a, captures, counter))
                .collect(),
        },
        Expr::PrimApp { name, args } => Expr::PrimApp {
            name,
            args: args
                .into_iter()
                .map(|a| rewrite(a, captures, counter))
                .collect(),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert_form(form: Expr) -> Expr {
        convert(form, &BTreeSet::new()).expect("conversion succeeds")
    }

    fn capturing_lambda() -> Expr {
        Expr::Lambda(LambdaExpr {
            params: vec!["b".into()],
            rest: None,
            free: vec!["a".into()],
            body: vec![Expr::prim("+", vec![Expr::var("a"), Expr::var("b")])],
        })
    }

    #[test]
    fn test_lambda_becomes_closure_construction() {
        let form = Expr::Let {
            bindings: vec![Binding {
                name: "a".into(),
                init: Expr::Fixnum(1),
            }],
            body: vec![capturing_lambda()],
        };
        let converted = convert_form(form);
        let Expr::Let { body, .. } = converted else {
            panic!("expected let");
        };
        let Expr::PrimApp { name, args } = &body[0] else {
            panic!("expected ##closure construction, got {:?}", body[0]);
        };
        assert_eq!(name, "##closure");
        assert_eq!(args.len(), 2);
        // Capture argument is the enclosing-scope variable itself.
        assert!(matches!(&args[1], Expr::Var(n) if n == "a"));
        // The lambda gained the self parameter.
        let Expr::Lambda(l) = &args[0] else {
            panic!("expected lambda, got {:?}", args[0]);
        };
        assert_eq!(l.params, vec!["#%self0".to_string(), "b".to_string()]);
        // The body reads the capture through the self parameter.
        let Expr::PrimApp { args: add_args, .. } = &l.body[0] else {
            panic!("expected primapp body");
        };
        assert!(matches!(
            &add_args[0],
            Expr::PrimApp { name, .. } if name == "##closure-ref"
        ));
    }

    #[test]
    fn test_self_names_deterministic_per_form() {
        let form = Expr::Begin(vec![
            Expr::Lambda(LambdaExpr {
                params: vec![],
                rest: None,
                free: vec![],
                body: vec![Expr::Fixnum(1)],
            }),
            Expr::Lambda(LambdaExpr {
                params: vec![],
                rest: None,
                free: vec![],
                body: vec![Expr::Fixnum(2)],
            }),
        ]);
        let Expr::Begin(body) = convert_form(form) else {
            panic!("expected begin");
        };
        for (i, e) in body.iter().enumerate() {
            let Expr::PrimApp { args, .. } = e else {
                panic!("expected closure construction");
            };
            let Expr::Lambda(l) = &args[0] else {
                panic!("expected lambda");
            };
            assert_eq!(l.params[0], format!("#%self{}", i));
        }
    }

    #[test]
    fn test_nested_capture_goes_through_outer_self() {
        // (lambda (x) (lambda () x)) — inner lambda captures x, which is a
        // parameter of the outer lambda.
        let inner = Expr::Lambda(LambdaExpr {
            params: vec![],
            rest: None,
            free: vec!["x".into()],
            body: vec![Expr::var("x")],
        });
        let outer = Expr::Lambda(LambdaExpr {
            params: vec!["x".into()],
            rest: None,
            free: vec![],
            body: vec![inner],
        });
        let converted = convert_form(outer);
        let Expr::PrimApp { args, .. } = &converted else {
            panic!("expected closure construction");
        };
        let Expr::Lambda(outer_l) = &args[0] else {
            panic!("expected outer lambda");
        };
        let Expr::PrimApp { name, args: inner_args } = &outer_l.body[0] else {
            panic!("expected inner closure construction");
        };
        assert_eq!(name, "##closure");
        // x is an outer parameter, so the capture argument stays Var(x).
        assert!(matches!(&inner_args[1], Expr::Var(n) if n == "x"));
    }

    #[test]
    fn test_missing_annotation_rejected() {
        let lambda = Expr::Lambda(LambdaExpr {
            params: vec![],
            rest: None,
            free: vec![],
            body: vec![Expr::var("mystery")],
        });
        assert!(convert(lambda, &BTreeSet::new()).is_err());
    }
}
