//! Loop execution strategy selection.
//!
//! A for-loop can be driven three ways, in ascending order of required
//! checking work:
//!
//! - **Shortcut.** Every iteration's wire expressions are linear in the
//!   loop's own iterator, consecutive iterations touch adjacent ranges,
//!   and the inputs were assigned before the loop. The body compiles
//!   once and iterations carry no data dependencies, so a backend may
//!   dispatch them in parallel (stream reads stay in iteration order).
//! - **Soft unroll.** The body still compiles once, but iterations run
//!   sequentially: typically each iteration's inputs are outputs of an
//!   earlier one.
//! - **Hard unroll.** The fallback: iteration extents vary, so the body
//!   is re-checked per iteration.
//!
//! Selection takes the first strategy whose preconditions hold; a
//! well-formed loop always lands somewhere.

use eyre::{bail, ensure, Result};
use log::debug;

use crate::circuit_ir::{ForLoopGate, IterRange, LoopBody, WireId};
use crate::iterexpr::{IterBoundsStack, IterExpr, IterMap};
use crate::skiplist::SkipList;

/// How a loop should be driven.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopStrategy {
    /// Compile once, dispatch with per-iteration offsets; iterations
    /// are independent.
    Shortcut,
    /// Compile once, drive sequentially.
    SoftUnroll,
    /// Re-check the body for every iteration.
    HardUnroll,
}

/// What the builder knows about the scope the loop runs in.
#[derive(Clone, Debug, Default)]
pub struct LoopContext {
    /// Wires assigned before the loop starts.
    pub assigned: SkipList,
    /// Wires deleted before the loop starts.
    pub deleted: SkipList,
    /// Enclosing loop bounds, outermost first.
    pub bounds: IterBoundsStack,
}

/// Analysis of one wire-range expression of the loop body.
struct ExprCtx {
    first: IterExpr,
    last: IterExpr,
    expected_span: u64,
    total_min: WireId,
    total_max: WireId,
    shortcut: bool,
    constant: bool,
}

/// Pick the execution strategy for `fl` given the surrounding scope.
pub fn classify(fl: &ForLoopGate, ctx: &LoopContext) -> Result<LoopStrategy> {
    ensure!(
        fl.first <= fl.last,
        "loop with negative iterations is undefined behavior"
    );
    ensure!(
        !ctx.bounds.contains(&fl.iterator),
        "loop iterator \"{}\" is already in use",
        fl.iterator
    );
    let loop_len = 1 + fl.last - fl.first;

    let mut loop_outs = SkipList::new();
    for &(f, l) in fl.outputs.iter() {
        ensure!(f <= l, "loop output wire list is invalid");
        loop_outs.insert_range(f, l);
    }

    let (dir_outputs, dir_inputs) = match &fl.body {
        LoopBody::Invoke {
            outputs, inputs, ..
        } => (outputs, inputs),
        LoopBody::Anon {
            outputs, inputs, ..
        } => (outputs, inputs),
    };

    let mut bounds = ctx.bounds.clone();
    bounds.push(fl.iterator.clone(), fl.first, fl.last);

    // The corner probe binds enclosing iterators to their bounds; point
    // evaluation fixes them at their first values.
    let at_iteration = |i: u64| -> IterMap {
        let mut iters: IterMap = ctx.bounds.names_firsts().into_iter().collect();
        iters.insert(fl.iterator.clone(), i);
        iters
    };

    /* Step 1. Attempt shortcut evaluation for output expressions. */
    let mut output_ctxs: Vec<ExprCtx> = Vec::with_capacity(dir_outputs.len());
    let mut iteration_outs = SkipList::new();
    let mut can_shortcut = true;
    for range in dir_outputs.iter() {
        let mut built =
            build_expr_ctx(range, &bounds, &fl.iterator, fl.first, loop_len, &at_iteration)?;
        can_shortcut = can_shortcut && built.shortcut;

        if built.shortcut {
            if !loop_outs.has_all(built.total_min, built.total_max)
                || !iteration_outs.insert_range(built.total_min, built.total_max)
            {
                bail!("shortcut iterator range is not valid for assignments");
            }
        } else {
            built.constant = false;
        }
        output_ctxs.push(built);
    }

    if can_shortcut && !SkipList::equivalent(&loop_outs, &iteration_outs) {
        bail!("loop outputs are not assigned by iterations");
    }

    /* Step 2. Attempt shortcut evaluation for input expressions. */
    let mut parallel = can_shortcut;
    let mut input_ctxs: Vec<ExprCtx> = Vec::with_capacity(dir_inputs.len());
    for range in dir_inputs.iter() {
        let mut built = build_input_ctx(range, &bounds, fl.first, &at_iteration)?;

        let assigned_before = built.total_max >= built.total_min
            && ctx.assigned.has_all(built.total_min, built.total_max)
            && !ctx.deleted.intersects(built.total_min, built.total_max);

        let linear_and_bounded = built.shortcut;
        built.shortcut = linear_and_bounded && assigned_before;
        parallel = parallel && built.shortcut;

        if built.shortcut {
            built.constant = built.first.is_constant() && built.last.is_constant();
        } else {
            // The inputs may instead be sequential: fed by outputs of
            // earlier iterations, far enough behind to be assigned in
            // time.
            let mut sequential = linear_and_bounded;
            for out in output_ctxs.iter_mut() {
                if !out.shortcut {
                    continue;
                }
                let overlaps = (built.total_min >= out.total_min
                    && built.total_min <= out.total_max)
                    || (built.total_max >= out.total_min && built.total_max <= out.total_max);
                if !overlaps {
                    continue;
                }
                let out_first = out.first.eval(&at_iteration(fl.first))?;
                let in_first = built.first.eval(&at_iteration(fl.first))?;
                let out_last = out.first.eval(&at_iteration(fl.last))?;
                let in_last = built.first.eval(&at_iteration(fl.last))?;

                let sole = built.first.sole_dependence(&fl.iterator)
                    && built.last.sole_dependence(&fl.iterator);
                // Same direction of travel, and the input trails the
                // output by at least one full span.
                let same_offset =
                    out_first != in_first && out_first.wrapping_sub(in_first) == out_last.wrapping_sub(in_last);
                let far_enough = if built.total_min < out.total_min {
                    ctx.assigned
                        .has_all(built.total_min, out.total_min - 1)
                        && !ctx.deleted.intersects(built.total_min, out.total_min - 1)
                        && out.total_min - built.total_min >= built.expected_span
                } else {
                    out.total_max + 1 <= built.total_max
                        && ctx.assigned.has_all(out.total_max + 1, built.total_max)
                        && !ctx.deleted.intersects(out.total_max + 1, built.total_max)
                        && built.total_max - out.total_max >= built.expected_span
                };

                if !(sole && same_offset && far_enough) {
                    // This output will be soft-unrolled with the input.
                    out.shortcut = false;
                    iteration_outs.remove_range(out.total_min, out.total_max);
                    sequential = false;
                }
            }
            built.shortcut = sequential;
        }

        can_shortcut = can_shortcut && built.shortcut;
        input_ctxs.push(built);
    }

    /* Step 3. Shortcut if everything held; parallelizable when no
     * input leans on another iteration's output. */
    if can_shortcut {
        let strategy = if parallel {
            LoopStrategy::Shortcut
        } else {
            LoopStrategy::SoftUnroll
        };
        debug!("loop over \"{}\": {:?}", fl.iterator, strategy);
        return Ok(strategy);
    }

    /* Step 4. Soft unrolling: walk the iterations, checking the
     * non-shortcut expressions one by one. */
    let mut unchecked_loop_outs = loop_outs.clone();
    iteration_outs.for_each(|f, l| {
        unchecked_loop_outs.remove_range(f, l);
    });

    match check_soft_unroll(
        fl,
        ctx,
        &output_ctxs,
        &input_ctxs,
        &unchecked_loop_outs,
    )? {
        SoftUnroll::Okay => {
            debug!("loop over \"{}\": SoftUnroll", fl.iterator);
            Ok(LoopStrategy::SoftUnroll)
        }
        SoftUnroll::Hard => {
            debug!("loop over \"{}\": HardUnroll", fl.iterator);
            Ok(LoopStrategy::HardUnroll)
        }
    }
}

fn build_expr_ctx(
    range: &IterRange,
    bounds: &IterBoundsStack,
    iterator: &str,
    first_value: u64,
    loop_len: u64,
    at_iteration: &dyn Fn(u64) -> IterMap,
) -> Result<ExprCtx> {
    let linear = range.first.is_linear() && range.last.is_linear();
    let local_only =
        range.first.sole_dependence(iterator) && range.last.sole_dependence(iterator);

    let first_first = range.first.eval(&at_iteration(first_value))?;
    let first_last = range.last.eval(&at_iteration(first_value))?;
    ensure!(first_first <= first_last, "iteration range is inverted");
    let expected_span = 1 + first_last - first_first;

    // Consecutive iterations must produce adjacent ranges.
    let adjacent = if loop_len > 1 {
        let second_first = range.first.eval(&at_iteration(first_value + 1))?;
        let second_last = range.last.eval(&at_iteration(first_value + 1))?;
        first_last == second_first.wrapping_sub(1) || first_first == second_last.wrapping_add(1)
    } else {
        true
    };

    let (bounds_okay, total_min, total_max) =
        match bounds.eval_corners(&range.first, &range.last, expected_span) {
            Ok((min, max)) => (true, min, max),
            Err(_) => (false, 0, 0),
        };

    Ok(ExprCtx {
        first: range.first.clone(),
        last: range.last.clone(),
        expected_span,
        total_min,
        total_max,
        shortcut: linear && local_only && adjacent && bounds_okay,
        constant: false,
    })
}

fn build_input_ctx(
    range: &IterRange,
    bounds: &IterBoundsStack,
    first_value: u64,
    at_iteration: &dyn Fn(u64) -> IterMap,
) -> Result<ExprCtx> {
    let linear = range.first.is_linear() && range.last.is_linear();
    let first_first = range.first.eval(&at_iteration(first_value))?;
    let first_last = range.last.eval(&at_iteration(first_value))?;
    ensure!(first_first <= first_last, "iteration range is inverted");
    let expected_span = 1 + first_last - first_first;

    let (bounds_okay, total_min, total_max) =
        match bounds.eval_corners(&range.first, &range.last, expected_span) {
            Ok((min, max)) => (true, min, max),
            Err(_) => (false, 0, 0),
        };

    Ok(ExprCtx {
        first: range.first.clone(),
        last: range.last.clone(),
        expected_span,
        total_min,
        total_max,
        // Inputs need not be local-only; the assignment test comes
        // later.
        shortcut: linear && bounds_okay,
        constant: false,
    })
}

enum SoftUnroll {
    Okay,
    Hard,
}

/// Walk every iteration (of this loop and of any enclosing loop whose
/// iterator the expressions mention), checking the non-shortcut
/// expressions in program order.
fn check_soft_unroll(
    fl: &ForLoopGate,
    ctx: &LoopContext,
    outputs: &[ExprCtx],
    inputs: &[ExprCtx],
    loop_outputs: &SkipList,
) -> Result<SoftUnroll> {
    let expected_outputs: u64 = outputs
        .iter()
        .filter(|o| !o.shortcut)
        .map(|o| o.expected_span)
        .sum();
    let expected_inputs: u64 = inputs
        .iter()
        .filter(|i| !i.shortcut)
        .map(|i| i.expected_span)
        .sum();

    // Which enclosing levels the expressions actually use.
    let mut used = vec![false; ctx.bounds.len()];
    for e in outputs.iter().chain(inputs.iter()) {
        e.first.mark_usage(&ctx.bounds, &mut used);
        e.last.mark_usage(&ctx.bounds, &mut used);
    }

    let mut assigned = ctx.assigned.clone();
    let mut unrolled = SkipList::new();
    let mut iters: IterMap = ctx.bounds.names_firsts().into_iter().collect();

    let status = walk_levels(
        fl,
        ctx,
        outputs,
        inputs,
        loop_outputs,
        expected_outputs,
        expected_inputs,
        &used,
        0,
        &mut iters,
        &mut assigned,
        &mut unrolled,
    )?;
    if let Some(status) = status {
        return Ok(status);
    }

    ensure!(
        SkipList::equivalent(&unrolled, loop_outputs),
        "loop outputs are not assigned in soft unroll"
    );
    Ok(SoftUnroll::Okay)
}

#[allow(clippy::too_many_arguments)]
fn walk_levels(
    fl: &ForLoopGate,
    ctx: &LoopContext,
    outputs: &[ExprCtx],
    inputs: &[ExprCtx],
    loop_outputs: &SkipList,
    expected_outputs: u64,
    expected_inputs: u64,
    used: &[bool],
    level: usize,
    iters: &mut IterMap,
    assigned: &mut SkipList,
    unrolled: &mut SkipList,
) -> Result<Option<SoftUnroll>> {
    if level < ctx.bounds.len() {
        let entries = ctx.bounds.names_firsts();
        let (name, _) = &entries[level];
        if !used[level] {
            // Unused level: one representative value suffices.
            return walk_levels(
                fl,
                ctx,
                outputs,
                inputs,
                loop_outputs,
                expected_outputs,
                expected_inputs,
                used,
                level + 1,
                iters,
                assigned,
                unrolled,
            );
        }
        let (first, last) = ctx.bounds.level_bounds(level);
        for v in first..=last {
            iters.insert(name.clone(), v);
            if let Some(status) = walk_levels(
                fl,
                ctx,
                outputs,
                inputs,
                loop_outputs,
                expected_outputs,
                expected_inputs,
                used,
                level + 1,
                iters,
                assigned,
                unrolled,
            )? {
                return Ok(Some(status));
            }
        }
        return Ok(None);
    }

    // Innermost: this loop's own iterations.
    for i in fl.first..=fl.last {
        iters.insert(fl.iterator.clone(), i);

        let mut iteration_inputs = 0u64;
        for input in inputs.iter().filter(|e| !e.shortcut) {
            let f = input.first.eval(iters)?;
            let l = input.last.eval(iters)?;
            ensure!(
                f <= l && assigned.has_all(f, l) && !ctx.deleted.intersects(f, l),
                "input expression is poorly formed in soft unroll"
            );
            iteration_inputs += 1 + l - f;
        }

        let mut iteration_outputs = 0u64;
        for output in outputs.iter().filter(|e| !e.shortcut) {
            let f = output.first.eval(iters)?;
            let l = output.last.eval(iters)?;
            ensure!(
                f <= l
                    && assigned.insert_range(f, l)
                    && unrolled.insert_range(f, l)
                    && loop_outputs.has_all(f, l),
                "output expression is poorly formed in soft unroll"
            );
            iteration_outputs += 1 + l - f;
        }

        if iteration_outputs != expected_outputs || iteration_inputs != expected_inputs {
            return Ok(Some(SoftUnroll::Hard));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_ir::Gate;

    fn anon_loop(
        first: u64,
        last: u64,
        outputs: Vec<(u64, u64)>,
        out_exprs: Vec<IterRange>,
        in_exprs: Vec<IterRange>,
    ) -> ForLoopGate {
        ForLoopGate {
            type_id: 0,
            iterator: "i".to_string(),
            first,
            last,
            outputs,
            body: LoopBody::Anon {
                outputs: out_exprs,
                inputs: in_exprs,
                public_counts: vec![],
                private_counts: vec![],
                body: vec![Gate::copy(0, 0, 1, 1)],
            },
        }
    }

    fn i() -> IterExpr {
        IterExpr::name("i")
    }

    fn i_plus(k: u64) -> IterExpr {
        IterExpr::add(i(), IterExpr::lit(k))
    }

    #[test]
    fn independent_iterations_shortcut() {
        // out $10+i <- in $100+i, inputs assigned before the loop.
        let fl = anon_loop(
            0,
            7,
            vec![(10, 17)],
            vec![IterRange::single(i_plus(10))],
            vec![IterRange::single(i_plus(100))],
        );
        let mut ctx = LoopContext::default();
        ctx.assigned.insert_range(100, 107);
        assert_eq!(classify(&fl, &ctx).unwrap(), LoopStrategy::Shortcut);
    }

    #[test]
    fn constant_inputs_shortcut() {
        let fl = anon_loop(
            0,
            3,
            vec![(10, 13)],
            vec![IterRange::single(i_plus(10))],
            vec![IterRange::single(IterExpr::lit(5))],
        );
        let mut ctx = LoopContext::default();
        ctx.assigned.insert(5);
        assert_eq!(classify(&fl, &ctx).unwrap(), LoopStrategy::Shortcut);
    }

    #[test]
    fn trailing_inputs_are_sequential() {
        // out $i+1 reads $i: each iteration consumes the previous one's
        // output, one span behind.
        let fl = anon_loop(
            0,
            7,
            vec![(1, 8)],
            vec![IterRange::single(i_plus(1))],
            vec![IterRange::single(i())],
        );
        let mut ctx = LoopContext::default();
        ctx.assigned.insert(0);
        assert_eq!(classify(&fl, &ctx).unwrap(), LoopStrategy::SoftUnroll);
    }

    #[test]
    fn varying_extents_hard_unroll() {
        // Inputs $0 ... $i grow with the iteration.
        let fl = anon_loop(
            1,
            4,
            vec![(10, 13)],
            vec![IterRange::single(i_plus(9))],
            vec![IterRange::range(IterExpr::lit(0), i())],
        );
        let mut ctx = LoopContext::default();
        ctx.assigned.insert_range(0, 4);
        assert_eq!(classify(&fl, &ctx).unwrap(), LoopStrategy::HardUnroll);
    }

    #[test]
    fn self_feeding_iteration_rejected() {
        // in $i == out $i: the value is read before it is written.
        let fl = anon_loop(
            0,
            3,
            vec![(0, 3)],
            vec![IterRange::single(i())],
            vec![IterRange::single(i())],
        );
        let ctx = LoopContext::default();
        assert!(classify(&fl, &ctx).is_err());
    }

    #[test]
    fn outputs_must_cover_declaration() {
        let fl = anon_loop(
            0,
            2,
            vec![(0, 3)],
            vec![IterRange::single(i())],
            vec![],
        );
        let ctx = LoopContext::default();
        assert!(classify(&fl, &ctx).is_err());
    }

    #[test]
    fn deleted_inputs_block_the_parallel_shortcut() {
        let fl = anon_loop(
            0,
            3,
            vec![(10, 13)],
            vec![IterRange::single(i_plus(10))],
            vec![IterRange::single(i_plus(100))],
        );
        let mut ctx = LoopContext::default();
        ctx.assigned.insert_range(100, 103);
        ctx.deleted.insert(101);
        // No longer assigned-before-the-loop, so the classification
        // demotes to sequential; evaluation reports the dead wire.
        assert_eq!(classify(&fl, &ctx).unwrap(), LoopStrategy::SoftUnroll);
    }

    #[test]
    fn nonlinear_expressions_fall_back() {
        // i*i is not linear; spans stay 1 so the walk accepts
        // sequential execution.
        let sq = IterExpr::mul(i(), i());
        let fl = anon_loop(
            1,
            3,
            vec![(1, 1), (4, 4), (9, 9)],
            vec![IterRange::single(sq)],
            vec![],
        );
        let ctx = LoopContext::default();
        assert_eq!(classify(&fl, &ctx).unwrap(), LoopStrategy::SoftUnroll);
    }

    fn two_i(offset: u64) -> IterExpr {
        IterExpr::add(IterExpr::mul(IterExpr::lit(2), i()), IterExpr::lit(offset))
    }

    #[test]
    fn distance_threshold_is_one_span() {
        // Iteration i writes $(2i+2, 2i+3) and reads $(2i, 2i+1): the
        // input trails the output by exactly one span, which the
        // geometric heuristic accepts as sequential.
        let fl = anon_loop(
            0,
            2,
            vec![(2, 7)],
            vec![IterRange::range(two_i(2), two_i(3))],
            vec![IterRange::range(two_i(0), two_i(1))],
        );
        let mut ctx = LoopContext::default();
        ctx.assigned.insert_range(0, 1);
        assert_eq!(classify(&fl, &ctx).unwrap(), LoopStrategy::SoftUnroll);
    }
}
