//! The input abstract syntax tree.
//!
//! The external front end (reader + macro expander) delivers a [`Program`]
//! whose expressions are already alpha-converted (every binder introduces a
//! unique name) and whose lambdas carry their free-variable sets. Both
//! preconditions are asserted by [`check_alpha`] and the closure-conversion
//! pass; violating them is a compiler-internal error, not a user-facing one.
//!
//! The serde derives let a driver accept a JSON-serialized AST from an
//! out-of-process front end.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A complete program: a sequence of top-level forms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub forms: Vec<Expr>,
}

/// A quoted datum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    Fixnum(i64),
    Flonum(f64),
    Bool(bool),
    Char(char),
    Str(String),
    Sym(String),
    Nil,
    List(Vec<Datum>),
    Vector(Vec<Datum>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub name: String,
    pub init: Expr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LambdaExpr {
    pub params: Vec<String>,
    /// Rest parameter for variable-arity lambdas.
    pub rest: Option<String>,
    /// Captured-variable set, annotated by the external free-variable
    /// analysis (or [`annotate_free_vars`]).
    #[serde(default)]
    pub free: Vec<String>,
    pub body: Vec<Expr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Expr {
    Fixnum(i64),
    Flonum(f64),
    Bool(bool),
    Char(char),
    Str(String),
    Nil,
    Void,
    Quote(Datum),
    Var(String),
    If {
        test: Box<Expr>,
        then: Box<Expr>,
        els: Option<Box<Expr>>,
    },
    Lambda(LambdaExpr),
    Let {
        bindings: Vec<Binding>,
        body: Vec<Expr>,
    },
    Begin(Vec<Expr>),
    /// Top-level definition. Only legal as (or directly inside a `Begin`
    /// at) a top-level form.
    Define {
        name: String,
        value: Box<Expr>,
    },
    Set {
        name: String,
        value: Box<Expr>,
    },
    App {
        proc: Box<Expr>,
        args: Vec<Expr>,
    },
    /// Direct primitive application. Introduced by the conversion passes
    /// (`##closure`, `##vector-ref`, ...) and accepted in input for
    /// front ends that resolve primitives themselves.
    PrimApp {
        name: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Convenience constructor for compiler-introduced primitive calls.
    pub fn prim(name: &str, args: Vec<Expr>) -> Expr {
        Expr::PrimApp {
            name: name.to_string(),
            args,
        }
    }

    pub fn var(name: &str) -> Expr {
        Expr::Var(name.to_string())
    }
}

/// Assert the alpha-conversion precondition: every binder in the program
/// introduces a distinct name.
pub fn check_alpha(program: &Program) -> Result<(), String> {
    fn bind(name: &str, seen: &mut BTreeSet<String>) -> Result<(), String> {
        if !seen.insert(name.to_string()) {
            return Err(format!(
                "input is not alpha-converted: binder `{}` occurs twice",
                name
            ));
        }
        Ok(())
    }
    fn walk(expr: &Expr, seen: &mut BTreeSet<String>) -> Result<(), String> {
        match expr {
            Expr::Lambda(lambda) => {
                for p in &lambda.params {
                    bind(p, seen)?;
                }
                if let Some(rest) = &lambda.rest {
                    bind(rest, seen)?;
                }
                for e in &lambda.body {
                    walk(e, seen)?;
                }
            }
            Expr::Let { bindings, body } => {
                for b in bindings {
                    walk(&b.init, seen)?;
                    bind(&b.name, seen)?;
                }
                for e in body {
                    walk(e, seen)?;
                }
            }
            Expr::If { test, then, els } => {
                walk(test, seen)?;
                walk(then, seen)?;
                if let Some(e) = els {
                    walk(e, seen)?;
                }
            }
            Expr::Begin(body) => {
                for e in body {
                    walk(e, seen)?;
                }
            }
            Expr::Define { value, .. } | Expr::Set { value, .. } => walk(value, seen)?,
            Expr::App { proc, args } => {
                walk(proc, seen)?;
                for a in args {
                    walk(a, seen)?;
                }
            }
            Expr::PrimApp { args, .. } => {
                for a in args {
                    walk(a, seen)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
    let mut seen = BTreeSet::new();
    for form in &program.forms {
        walk(form, &mut seen)?;
    }
    Ok(())
}

/// Accumulate the free variables of `expr` relative to `bound`.
pub fn free_vars(expr: &Expr, bound: &BTreeSet<String>, acc: &mut BTreeSet<String>) {
    match expr {
        Expr::Var(name) => {
            if !bound.contains(name) {
                acc.insert(name.clone());
            }
        }
        Expr::If { test, then, els } => {
            free_vars(test, bound, acc);
            free_vars(then, bound, acc);
            if let Some(e) = els {
                free_vars(e, bound, acc);
            }
        }
        Expr::Lambda(lambda) => {
            let mut inner = bound.clone();
            inner.extend(lambda.params.iter().cloned());
            if let Some(rest) = &lambda.rest {
                inner.insert(rest.clone());
            }
            for e in &lambda.body {
                free_vars(e, &inner, acc);
            }
        }
        Expr::Let { bindings, body } => {
            let mut inner = bound.clone();
            for b in bindings {
                free_vars(&b.init, &inner, acc);
                inner.insert(b.name.clone());
            }
            for e in body {
                free_vars(e, &inner, acc);
            }
        }
        Expr::Begin(body) => {
            for e in body {
                free_vars(e, bound, acc);
            }
        }
        Expr::Define { value, .. } => free_vars(value, bound, acc),
        Expr::Set { name, value } => {
            if !bound.contains(name) {
                acc.insert(name.clone());
            }
            free_vars(value, bound, acc);
        }
        Expr::App { proc, args } => {
            free_vars(proc, bound, acc);
            for a in args {
                free_vars(a, bound, acc);
            }
        }
        Expr::PrimApp { args, .. } => {
            for a in args {
                free_vars(a, bound, acc);
            }
        }
        _ => {}
    }
}

/// Annotate every lambda with its captured-variable set. Convenience for
/// drivers and tests whose front end does not carry the analysis. Top-level
/// names (defines) resolve to global slots and are never captured.
pub fn annotate_free_vars(program: &mut Program) {
    let mut top_level: BTreeSet<String> = BTreeSet::new();
    for form in &program.forms {
        collect_defines(form, &mut top_level);
    }
    for form in &mut program.forms {
        annotate_expr(form, &top_level);
    }
}

fn collect_defines(expr: &Expr, acc: &mut BTreeSet<String>) {
    match expr {
        Expr::Define { name, .. } => {
            acc.insert(name.clone());
        }
        Expr::Begin(body) => {
            for e in body {
                collect_defines(e, acc);
            }
        }
        _ => {}
    }
}

fn annotate_expr(expr: &mut Expr, top_level: &BTreeSet<String>) {
    match expr {
        Expr::Lambda(lambda) => {
            for e in &mut lambda.body {
                annotate_expr(e, top_level);
            }
            let mut bound: BTreeSet<String> = lambda.params.iter().cloned().collect();
            if let Some(rest) = &lambda.rest {
                bound.insert(rest.clone());
            }
            let mut acc = BTreeSet::new();
            for e in &lambda.body {
                free_vars(e, &bound, &mut acc);
            }
            lambda.free = acc
                .into_iter()
                .filter(|name| !top_level.contains(name))
                .collect();
        }
        Expr::If { test, then, els } => {
            annotate_expr(test, top_level);
            annotate_expr(then, top_level);
            if let Some(e) = els {
                annotate_expr(e, top_level);
            }
        }
        Expr::Let { bindings, body } => {
            for b in bindings {
                annotate_expr(&mut b.init, top_level);
            }
            for e in body {
                annotate_expr(e, top_level);
            }
        }
        Expr::Begin(body) => {
            for e in body {
                annotate_expr(e, top_level);
            }
        }
        Expr::Define { value, .. } | Expr::Set { value, .. } => annotate_expr(value, top_level),
        Expr::App { proc, args } => {
            annotate_expr(proc, top_level);
            for a in args {
                annotate_expr(a, top_level);
            }
        }
        Expr::PrimApp { args, .. } => {
            for a in args {
                annotate_expr(a, top_level);
            }
        }
        _ => {}
    }
}

/// Flatten single-expression `begin` forms iteratively (worklist, not
/// recursion, so pathological nesting cannot overflow the native stack).
pub fn remove_single_begins(expr: Expr) -> Expr {
    let mut current = expr;
    loop {
        match current {
            Expr::Begin(mut body) if body.len() == 1 => {
                current = body.pop().expect("length checked");
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lambda(params: &[&str], body: Vec<Expr>) -> Expr {
        Expr::Lambda(LambdaExpr {
            params: params.iter().map(|s| s.to_string()).collect(),
            rest: None,
            free: Vec::new(),
            body,
        })
    }

    #[test]
    fn test_check_alpha_accepts_unique_binders() {
        let program = Program {
            forms: vec![Expr::Let {
                bindings: vec![Binding {
                    name: "x1".into(),
                    init: Expr::Fixnum(1),
                }],
                body: vec![lambda(&["y2"], vec![Expr::var("x1")])],
            }],
        };
        assert!(check_alpha(&program).is_ok());
    }

    #[test]
    fn test_check_alpha_rejects_duplicates() {
        let program = Program {
            forms: vec![
                lambda(&["x"], vec![Expr::var("x")]),
                lambda(&["x"], vec![Expr::var("x")]),
            ],
        };
        assert!(check_alpha(&program).is_err());
    }

    #[test]
    fn test_annotate_free_vars_captures_outer_let_binding() {
        let mut program = Program {
            forms: vec![Expr::Let {
                bindings: vec![Binding {
                    name: "a1".into(),
                    init: Expr::Fixnum(1),
                }],
                body: vec![lambda(
                    &["b2"],
                    vec![Expr::prim("+", vec![Expr::var("a1"), Expr::var("b2")])],
                )],
            }],
        };
        annotate_free_vars(&mut program);
        match &program.forms[0] {
            Expr::Let { body, .. } => match &body[0] {
                Expr::Lambda(l) => assert_eq!(l.free, vec!["a1".to_string()]),
                other => panic!("expected lambda, got {:?}", other),
            },
            other => panic!("expected let, got {:?}", other),
        }
    }

    #[test]
    fn test_annotate_free_vars_skips_top_level_names() {
        let mut program = Program {
            forms: vec![
                Expr::Define {
                    name: "g".into(),
                    value: Box::new(Expr::Fixnum(1)),
                },
                lambda(
                    &["x3"],
                    vec![Expr::App {
                        proc: Box::new(Expr::var("g")),
                        args: vec![Expr::var("x3")],
                    }],
                ),
            ],
        };
        annotate_free_vars(&mut program);
        match &program.forms[1] {
            Expr::Lambda(l) => assert!(l.free.is_empty()),
            other => panic!("expected lambda, got {:?}", other),
        }
    }

    #[test]
    fn test_remove_single_begins() {
        let nested = Expr::Begin(vec![Expr::Begin(vec![Expr::Fixnum(3)])]);
        match remove_single_begins(nested) {
            Expr::Fixnum(3) => {}
            other => panic!("expected flattened fixnum, got {:?}", other),
        }
    }

    #[test]
    fn test_json_round_trip() {
        let program = Program {
            forms: vec![Expr::App {
                proc: Box::new(Expr::var("+")),
                args: vec![Expr::Fixnum(3), Expr::Fixnum(7)],
            }],
        };
        let json = serde_json::to_string(&program).unwrap();
        let back: Program = serde_json::from_str(&json).unwrap();
        assert_eq!(back.forms.len(), 1);
    }
}
