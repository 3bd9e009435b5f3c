//! Tail-call pass.
//!
//! Runs after compilation and flags every call in tail position of a lambda
//! body, walking forms structurally via their closing `End`s. The VM only
//! reuses the frame when a flagged call targets the executing function, so
//! over-flagging a call that turns out to target something else at runtime
//! costs nothing.

use crate::bytecode::{Op, Script};

pub fn mark_tail_calls(script: &mut Script) {
    let bodies: Vec<(usize, usize)> = script
        .funcs
        .iter()
        .map(|f| (f.entry as usize, f.end as usize))
        .collect();
    for (entry, end) in bodies {
        if let Some(last) = last_form(&script.code, entry, end) {
            mark_tail(&mut script.code, last);
        }
    }
}

/// Index just past the form starting at `at`.
fn skip_form(code: &[Op], at: usize) -> usize {
    if !code[at].is_compound() {
        return at + 1;
    }
    let mut i = at + 1;
    while !matches!(code[i], Op::End) {
        i = skip_form(code, i);
    }
    i + 1
}

/// Start of the last form in `from..limit`, if the range holds any.
fn last_form(code: &[Op], from: usize, limit: usize) -> Option<usize> {
    let mut i = from;
    let mut last = None;
    while i < limit {
        last = Some(i);
        i = skip_form(code, i);
    }
    last
}

fn mark_tail(code: &mut [Op], at: usize) {
    match code[at] {
        Op::Call { .. } => code[at] = Op::Call { tail: true },
        Op::Begin => {
            let end = skip_form(code, at) - 1;
            if let Some(last) = last_form(code, at + 1, end) {
                mark_tail(code, last);
            }
        }
        // either branch may run last, so both get the treatment
        Op::If { second, .. } => {
            let then_at = skip_form(code, at + 1);
            mark_tail(code, then_at);
            let else_at = second as usize;
            if !matches!(code[else_at], Op::End) {
                mark_tail(code, else_at);
            }
        }
        _ => {}
    }
}
