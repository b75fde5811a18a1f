//! Liveness computation.
//!
//! Every node receives a strictly increasing scan index as the AST is
//! walked; per binding we record the interval during which its storage
//! must remain live. The walk order here must mirror the evaluation order
//! of the code generator exactly (call arguments right-to-left, then the
//! callee; primitive-application arguments left-to-right), because the
//! generator advances its own scan counter through the same traversal and
//! expires allocations against these ranges.

use std::collections::HashMap;

use crate::compiler::ast::Expr;
use crate::compiler::env::LiveRange;
use crate::config::LivenessMode;

/// Per-top-level-form liveness results.
#[derive(Debug, Clone)]
pub struct LivenessMap {
    pub ranges: HashMap<String, LiveRange>,
    /// The scan index one past the last node of the form.
    pub end_index: u32,
}

impl LivenessMap {
    pub fn range_of(&self, name: &str) -> Option<LiveRange> {
        self.ranges.get(name).copied()
    }
}

struct Walker {
    scan: u32,
    first: HashMap<String, u32>,
    last_use: HashMap<String, u32>,
    naive_end: HashMap<String, u32>,
}

impl Walker {
    fn bump(&mut self) -> u32 {
        let index = self.scan;
        self.scan += 1;
        index
    }

    fn walk(&mut self, expr: &Expr) {
        let index = self.bump();
        match expr {
            Expr::Var(name) => {
                self.last_use.insert(name.clone(), index);
            }
            Expr::Set { name, value } => {
                self.last_use.insert(name.clone(), index);
                self.walk(value);
            }
            Expr::If { test, then, els } => {
                self.walk(test);
                self.walk(then);
                if let Some(e) = els {
                    self.walk(e);
                }
            }
            Expr::Lambda(lambda) => {
                // Parameters become live at the body's first instruction.
                for p in &lambda.params {
                    self.first.insert(p.clone(), self.scan);
                }
                if let Some(rest) = &lambda.rest {
                    self.first.insert(rest.clone(), self.scan);
                }
                for e in &lambda.body {
                    self.walk(e);
                }
                let end = self.scan.saturating_sub(1);
                for p in &lambda.params {
                    self.naive_end.insert(p.clone(), end);
                }
                if let Some(rest) = &lambda.rest {
                    self.naive_end.insert(rest.clone(), end);
                }
            }
            Expr::Let { bindings, body } => {
                for b in bindings {
                    self.first.insert(b.name.clone(), self.scan);
                    self.walk(&b.init);
                }
                for e in body {
                    self.walk(e);
                }
                let end = self.scan.saturating_sub(1);
                for b in bindings {
                    self.naive_end.insert(b.name.clone(), end);
                }
            }
            Expr::Begin(body) => {
                for e in body {
                    self.walk(e);
                }
            }
            Expr::Define { value, .. } => self.walk(value),
            Expr::App { proc, args } => {
                for a in args.iter().rev() {
                    self.walk(a);
                }
                self.walk(proc);
            }
            Expr::PrimApp { args, .. } => {
                for a in args {
                    self.walk(a);
                }
            }
            Expr::Fixnum(_)
            | Expr::Flonum(_)
            | Expr::Bool(_)
            | Expr::Char(_)
            | Expr::Str(_)
            | Expr::Nil
            | Expr::Void
            | Expr::Quote(_) => {}
        }
    }
}

/// Compute liveness for one top-level form.
pub fn analyze(form: &Expr, mode: LivenessMode) -> LivenessMap {
    let mut walker = Walker {
        scan: 0,
        first: HashMap::new(),
        last_use: HashMap::new(),
        naive_end: HashMap::new(),
    };
    walker.walk(form);

    let mut ranges = HashMap::new();
    for (name, &first) in &walker.first {
        let last = match mode {
            LivenessMode::Precise => walker.last_use.get(name).copied().unwrap_or(first),
            LivenessMode::Naive => walker.naive_end.get(name).copied().unwrap_or(first),
        };
        ranges.insert(name.clone(), LiveRange::new(first, last.max(first)));
    }

    LivenessMap {
        ranges,
        end_index: walker.scan,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ast::Binding;

    fn let_form(name: &str, init: Expr, body: Vec<Expr>) -> Expr {
        Expr::Let {
            bindings: vec![Binding {
                name: name.into(),
                init,
            }],
            body,
        }
    }

    #[test]
    fn test_scan_indices_are_strictly_increasing() {
        let form = Expr::Begin(vec![Expr::Fixnum(1), Expr::Fixnum(2), Expr::Fixnum(3)]);
        let map = analyze(&form, LivenessMode::Precise);
        // begin + three literals
        assert_eq!(map.end_index, 4);
    }

    #[test]
    fn test_precise_range_ends_at_last_use() {
        // (let ((x 1)) x 2 3) — x last used well before the form ends.
        let form = let_form(
            "x",
            Expr::Fixnum(1),
            vec![Expr::var("x"), Expr::Fixnum(2), Expr::Fixnum(3)],
        );
        let precise = analyze(&form, LivenessMode::Precise);
        let naive = analyze(&form, LivenessMode::Naive);
        let pr = precise.range_of("x").unwrap();
        let nr = naive.range_of("x").unwrap();
        assert_eq!(pr.first, nr.first);
        assert!(pr.last < nr.last);
        assert_eq!(nr.last, naive.end_index - 1);
    }

    #[test]
    fn test_unused_binding_gets_degenerate_range() {
        let form = let_form("x", Expr::Fixnum(1), vec![Expr::Fixnum(2)]);
        let map = analyze(&form, LivenessMode::Precise);
        let r = map.range_of("x").unwrap();
        assert_eq!(r.first, r.last);
    }

    #[test]
    fn test_call_arguments_walked_right_to_left() {
        // (f x y): y is walked before x, so x's last use has the larger
        // index even though it appears first.
        let form = Expr::App {
            proc: Box::new(Expr::var("f")),
            args: vec![Expr::var("x"), Expr::var("y")],
        };
        let outer = Expr::Let {
            bindings: vec![
                Binding {
                    name: "x".into(),
                    init: Expr::Fixnum(1),
                },
                Binding {
                    name: "y".into(),
                    init: Expr::Fixnum(2),
                },
            ],
            body: vec![form],
        };
        let map = analyze(&outer, LivenessMode::Precise);
        assert!(map.range_of("x").unwrap().last > map.range_of("y").unwrap().last);
    }

    #[test]
    fn test_lambda_parameter_live_from_body_start() {
        let form = Expr::Lambda(crate::compiler::ast::LambdaExpr {
            params: vec!["p".into()],
            rest: None,
            free: vec![],
            body: vec![Expr::Fixnum(1), Expr::var("p")],
        });
        let map = analyze(&form, LivenessMode::Precise);
        let r = map.range_of("p").unwrap();
        assert_eq!(r.first, 1);
        assert_eq!(r.last, 2);
    }
}
