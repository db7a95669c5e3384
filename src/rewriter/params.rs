//! Placeholder relabeling.
//!
//! MySQL `?` placeholders are indexed by their textual order in the input;
//! PostgreSQL `$n` placeholders are numbered in the output. Tagging happens
//! before the transform and relabeling after, so transforms that reorder or
//! duplicate placeholders are captured by the permutation map.

use std::ops::ControlFlow;

use sqlparser::ast::{visit_expressions_mut, Expr, Statement, Value};

/// Replace each bare `?` with an input-indexed marker. Returns the number of
/// input placeholders.
pub fn tag_placeholders(stmt: &mut Statement) -> usize {
    let mut next = 0usize;
    let _ = visit_expressions_mut(stmt, |expr| {
        if let Expr::Value(Value::Placeholder(text)) = expr {
            if text == "?" {
                *text = format!("?{next}");
                next += 1;
            }
        }
        ControlFlow::<()>::Continue(())
    });
    next
}

/// Replace markers with `$1..$n` in output order. Returns the output
/// parameter count and the permutation: `map[i]` is the input index whose
/// client-supplied value binds at `$i+1`.
pub fn relabel_placeholders(stmt: &mut Statement) -> (usize, Vec<usize>) {
    let mut map = Vec::new();
    let _ = visit_expressions_mut(stmt, |expr| {
        if let Expr::Value(Value::Placeholder(text)) = expr {
            if let Some(input_index) = text
                .strip_prefix('?')
                .and_then(|rest| rest.parse::<usize>().ok())
            {
                map.push(input_index);
                *text = format!("${}", map.len());
            }
        }
        ControlFlow::<()>::Continue(())
    });
    (map.len(), map)
}
