//! Arithmetic expressions over loop iterator names.
//!
//! A for-loop maps its iteration index to wire indices through these
//! expressions: sums, differences, products, and division by a literal.
//! Besides plain evaluation the module provides the analyses the loop
//! strategy builder and the switch-lowering pass rely on: constancy,
//! linearity, sole dependence on one iterator, and corner-point range
//! evaluation with overflow checking.

use eyre::{bail, ensure, eyre, Result};
use rustc_hash::FxHashMap;

/// Bindings of iterator names to their current values, innermost loops
/// shadowing nothing: names are required to be unique along a nest.
pub type IterMap = FxHashMap<String, u64>;

/// An iteration expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IterExpr {
    Literal(u64),
    Iterator(String),
    Add(Box<IterExpr>, Box<IterExpr>),
    Sub(Box<IterExpr>, Box<IterExpr>),
    Mul(Box<IterExpr>, Box<IterExpr>),
    /// Division by a literal; the only division form the language allows.
    Div(Box<IterExpr>, u64),
}

impl IterExpr {
    pub fn lit(value: u64) -> Self {
        IterExpr::Literal(value)
    }

    pub fn name(name: impl Into<String>) -> Self {
        IterExpr::Iterator(name.into())
    }

    pub fn add(lhs: IterExpr, rhs: IterExpr) -> Self {
        IterExpr::Add(Box::new(lhs), Box::new(rhs))
    }

    pub fn sub(lhs: IterExpr, rhs: IterExpr) -> Self {
        IterExpr::Sub(Box::new(lhs), Box::new(rhs))
    }

    pub fn mul(lhs: IterExpr, rhs: IterExpr) -> Self {
        IterExpr::Mul(Box::new(lhs), Box::new(rhs))
    }

    pub fn div(lhs: IterExpr, rhs: u64) -> Self {
        IterExpr::Div(Box::new(lhs), rhs)
    }

    /// Evaluate with wrapping arithmetic. Unknown iterator names and
    /// division by zero are errors.
    pub fn eval(&self, iters: &IterMap) -> Result<u64> {
        match self {
            IterExpr::Literal(v) => Ok(*v),
            IterExpr::Iterator(name) => iters
                .get(name)
                .copied()
                .ok_or_else(|| eyre!("loop iterator \"{name}\" not found")),
            IterExpr::Add(lhs, rhs) => {
                Ok(lhs.eval(iters)?.wrapping_add(rhs.eval(iters)?))
            }
            IterExpr::Sub(lhs, rhs) => {
                Ok(lhs.eval(iters)?.wrapping_sub(rhs.eval(iters)?))
            }
            IterExpr::Mul(lhs, rhs) => {
                Ok(lhs.eval(iters)?.wrapping_mul(rhs.eval(iters)?))
            }
            IterExpr::Div(lhs, rhs) => {
                ensure!(*rhs != 0, "constant division would divide by zero");
                Ok(lhs.eval(iters)? / rhs)
            }
        }
    }

    /// Evaluate with checked arithmetic; overflow is an error.
    pub fn eval_checked(&self, iters: &IterMap) -> Result<u64> {
        match self {
            IterExpr::Literal(v) => Ok(*v),
            IterExpr::Iterator(name) => iters
                .get(name)
                .copied()
                .ok_or_else(|| eyre!("loop iterator \"{name}\" not found")),
            IterExpr::Add(lhs, rhs) => lhs
                .eval_checked(iters)?
                .checked_add(rhs.eval_checked(iters)?)
                .ok_or_else(|| eyre!("iteration expression overflows")),
            IterExpr::Sub(lhs, rhs) => lhs
                .eval_checked(iters)?
                .checked_sub(rhs.eval_checked(iters)?)
                .ok_or_else(|| eyre!("iteration expression underflows")),
            IterExpr::Mul(lhs, rhs) => lhs
                .eval_checked(iters)?
                .checked_mul(rhs.eval_checked(iters)?)
                .ok_or_else(|| eyre!("iteration expression overflows")),
            IterExpr::Div(lhs, rhs) => {
                ensure!(*rhs != 0, "constant division would divide by zero");
                Ok(lhs.eval_checked(iters)? / rhs)
            }
        }
    }

    /// Whether the expression mentions no iterator at all.
    pub fn is_constant(&self) -> bool {
        match self {
            IterExpr::Literal(_) => true,
            IterExpr::Iterator(_) => false,
            IterExpr::Add(lhs, rhs) | IterExpr::Sub(lhs, rhs) | IterExpr::Mul(lhs, rhs) => {
                lhs.is_constant() && rhs.is_constant()
            }
            IterExpr::Div(lhs, _) => lhs.is_constant(),
        }
    }

    /// Whether the expression is linear in every iterator: products may
    /// involve at most one iterator-bearing operand, and division only
    /// applies to linear numerators.
    pub fn is_linear(&self) -> bool {
        match self {
            IterExpr::Literal(_) | IterExpr::Iterator(_) => true,
            IterExpr::Add(lhs, rhs) | IterExpr::Sub(lhs, rhs) => {
                lhs.is_linear() && rhs.is_linear()
            }
            IterExpr::Mul(lhs, rhs) => {
                (lhs.is_constant() && rhs.is_linear())
                    || (rhs.is_constant() && lhs.is_linear())
            }
            IterExpr::Div(lhs, _) => lhs.is_linear(),
        }
    }

    /// Whether every iterator mentioned is `name`.
    pub fn sole_dependence(&self, name: &str) -> bool {
        match self {
            IterExpr::Literal(_) => true,
            IterExpr::Iterator(n) => n == name,
            IterExpr::Add(lhs, rhs) | IterExpr::Sub(lhs, rhs) | IterExpr::Mul(lhs, rhs) => {
                lhs.sole_dependence(name) && rhs.sole_dependence(name)
            }
            IterExpr::Div(lhs, _) => lhs.sole_dependence(name),
        }
    }

    /// Record which iterator names the expression mentions.
    pub fn mark_usage(&self, bounds: &IterBoundsStack, used: &mut [bool]) {
        match self {
            IterExpr::Literal(_) => {}
            IterExpr::Iterator(n) => {
                if let Some(pos) = bounds.position(n) {
                    used[pos] = true;
                }
            }
            IterExpr::Add(lhs, rhs) | IterExpr::Sub(lhs, rhs) | IterExpr::Mul(lhs, rhs) => {
                lhs.mark_usage(bounds, used);
                rhs.mark_usage(bounds, used);
            }
            IterExpr::Div(lhs, _) => lhs.mark_usage(bounds, used),
        }
    }
}

/// Which side of a threshold every evaluation of a range expression
/// falls on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RangeSide {
    Below,
    AtOrAbove,
}

/// Exhaustive enumeration ceiling for the non-linear fallback of
/// [`IterBoundsStack::range_side`].
const SLOW_PATH_LIMIT: u128 = 1 << 20;

/// The stack of enclosing loop bounds, outermost first.
#[derive(Clone, Debug, Default)]
pub struct IterBoundsStack {
    names: Vec<String>,
    firsts: Vec<u64>,
    lasts: Vec<u64>,
}

impl IterBoundsStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, first: u64, last: u64) {
        self.names.push(name.into());
        self.firsts.push(first);
        self.lasts.push(last);
    }

    pub fn pop(&mut self) {
        self.names.pop();
        self.firsts.pop();
        self.lasts.pop();
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Each bound iterator paired with its first value.
    pub fn names_firsts(&self) -> Vec<(String, u64)> {
        self.names
            .iter()
            .cloned()
            .zip(self.firsts.iter().copied())
            .collect()
    }

    /// The inclusive bounds of one stack level.
    pub fn level_bounds(&self, level: usize) -> (u64, u64) {
        (self.firsts[level], self.lasts[level])
    }

    fn corner(&self, mask: usize) -> IterMap {
        let mut iters = IterMap::default();
        for (i, name) in self.names.iter().enumerate() {
            let v = if mask & (1 << i) != 0 {
                self.lasts[i]
            } else {
                self.firsts[i]
            };
            iters.insert(name.clone(), v);
        }
        iters
    }

    /// Evaluate a `(first, last)` expression pair at every corner of the
    /// bounds box with checked arithmetic. Requires the span
    /// `last - first + 1` to equal `expected_span` at each corner.
    /// Returns the overall `(min_first, max_last)`.
    ///
    /// Sound as an extreme-point probe only for linear expressions;
    /// callers gate on [`IterExpr::is_linear`].
    pub fn eval_corners(
        &self,
        first: &IterExpr,
        last: &IterExpr,
        expected_span: u64,
    ) -> Result<(u64, u64)> {
        let mut total_min = u64::MAX;
        let mut total_max = 0u64;
        for mask in 0..(1usize << self.names.len()) {
            let iters = self.corner(mask);
            let f = first.eval_checked(&iters)?;
            let l = last.eval_checked(&iters)?;
            ensure!(f <= l, "iteration range ${f} ... ${l} is inverted");
            ensure!(
                l - f + 1 == expected_span,
                "iteration range span varies across the loop (expected {expected_span}, \
                 found {})",
                l - f + 1
            );
            total_min = total_min.min(f);
            total_max = total_max.max(l);
        }
        Ok((total_min, total_max))
    }

    /// Decide whether every evaluation of `first..=last` over the bounds
    /// box stays below `threshold` or at-or-above it. Straddling the
    /// threshold is an error. Linear expressions are probed at the box
    /// corners; anything else falls back to exhaustive enumeration.
    pub fn range_side(
        &self,
        first: &IterExpr,
        last: &IterExpr,
        threshold: u64,
    ) -> Result<RangeSide> {
        let fast = first.is_linear() && last.is_linear();
        let mut side: Option<RangeSide> = None;

        let mut observe = |f: u64, l: u64| -> Result<()> {
            ensure!(f <= l, "iteration range ${f} ... ${l} is inverted");
            let here = if l < threshold {
                RangeSide::Below
            } else if f >= threshold {
                RangeSide::AtOrAbove
            } else {
                bail!("iteration range ${f} ... ${l} straddles wire ${threshold}");
            };
            match side {
                None => side = Some(here),
                Some(prev) => ensure!(
                    prev == here,
                    "iteration range crosses wire ${threshold} across iterations"
                ),
            }
            Ok(())
        };

        if fast {
            for mask in 0..(1usize << self.names.len()) {
                let iters = self.corner(mask);
                observe(first.eval_checked(&iters)?, last.eval_checked(&iters)?)?;
            }
        } else {
            let mut total: u128 = 1;
            for i in 0..self.names.len() {
                total = total.saturating_mul((self.lasts[i] - self.firsts[i]) as u128 + 1);
            }
            ensure!(
                total <= SLOW_PATH_LIMIT,
                "non-linear iteration expression over {total} iterations is too large to check"
            );
            let mut iters = IterMap::default();
            self.enumerate(0, &mut iters, &mut |iters| {
                observe(first.eval_checked(iters)?, last.eval_checked(iters)?)
            })?;
        }

        side.ok_or_else(|| eyre!("empty iteration space"))
    }

    fn enumerate(
        &self,
        depth: usize,
        iters: &mut IterMap,
        visit: &mut impl FnMut(&IterMap) -> Result<()>,
    ) -> Result<()> {
        if depth == self.names.len() {
            return visit(iters);
        }
        for v in self.firsts[depth]..=self.lasts[depth] {
            iters.insert(self.names[depth].clone(), v);
            self.enumerate(depth + 1, iters, visit)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iters(pairs: &[(&str, u64)]) -> IterMap {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), *v))
            .collect()
    }

    #[test]
    fn eval_basic() {
        // 2*i + 5
        let e = IterExpr::add(
            IterExpr::mul(IterExpr::lit(2), IterExpr::name("i")),
            IterExpr::lit(5),
        );
        assert_eq!(e.eval(&iters(&[("i", 3)])).unwrap(), 11);
        assert!(e.eval(&iters(&[("j", 3)])).is_err());
    }

    #[test]
    fn eval_division() {
        let e = IterExpr::div(IterExpr::name("i"), 2);
        assert_eq!(e.eval(&iters(&[("i", 7)])).unwrap(), 3);
        let bad = IterExpr::div(IterExpr::name("i"), 0);
        assert!(bad.eval(&iters(&[("i", 7)])).is_err());
    }

    #[test]
    fn wrapping_versus_checked() {
        let e = IterExpr::sub(IterExpr::lit(0), IterExpr::lit(1));
        assert_eq!(e.eval(&IterMap::default()).unwrap(), u64::MAX);
        assert!(e.eval_checked(&IterMap::default()).is_err());
    }

    #[test]
    fn linearity() {
        let i = IterExpr::name("i");
        let j = IterExpr::name("j");
        assert!(IterExpr::add(i.clone(), j.clone()).is_linear());
        assert!(IterExpr::mul(IterExpr::lit(4), i.clone()).is_linear());
        assert!(!IterExpr::mul(i.clone(), j.clone()).is_linear());
        assert!(IterExpr::div(IterExpr::mul(IterExpr::lit(3), i.clone()), 2).is_linear());
        assert!(i.sole_dependence("i"));
        assert!(!IterExpr::add(i, j).sole_dependence("i"));
    }

    #[test]
    fn corner_evaluation() {
        // outputs 10 + 2*i ..= 11 + 2*i over i in 0..=4: span 2, min 10, max 19
        let mut bounds = IterBoundsStack::new();
        bounds.push("i", 0, 4);
        let first = IterExpr::add(
            IterExpr::lit(10),
            IterExpr::mul(IterExpr::lit(2), IterExpr::name("i")),
        );
        let last = IterExpr::add(
            IterExpr::lit(11),
            IterExpr::mul(IterExpr::lit(2), IterExpr::name("i")),
        );
        assert_eq!(bounds.eval_corners(&first, &last, 2).unwrap(), (10, 19));
        assert!(bounds.eval_corners(&first, &last, 3).is_err());
    }

    #[test]
    fn corner_evaluation_rejects_overflow() {
        let mut bounds = IterBoundsStack::new();
        bounds.push("i", 0, 1);
        let first = IterExpr::mul(IterExpr::lit(u64::MAX), IterExpr::name("i"));
        let last = first.clone();
        assert!(bounds.eval_corners(&first, &last, 1).is_err());
    }

    #[test]
    fn threshold_sides() {
        let mut bounds = IterBoundsStack::new();
        bounds.push("i", 0, 3);
        let below = IterExpr::name("i");
        assert_eq!(
            bounds.range_side(&below, &below, 10).unwrap(),
            RangeSide::Below
        );
        let above = IterExpr::add(IterExpr::lit(10), IterExpr::name("i"));
        assert_eq!(
            bounds.range_side(&above, &above, 10).unwrap(),
            RangeSide::AtOrAbove
        );
        let straddling = IterExpr::add(IterExpr::lit(8), IterExpr::name("i"));
        assert!(bounds.range_side(&straddling, &straddling, 10).is_err());
    }

    #[test]
    fn threshold_slow_path() {
        // i*j is not linear, forcing enumeration.
        let mut bounds = IterBoundsStack::new();
        bounds.push("i", 1, 3);
        bounds.push("j", 1, 3);
        let e = IterExpr::mul(IterExpr::name("i"), IterExpr::name("j"));
        assert_eq!(bounds.range_side(&e, &e, 100).unwrap(), RangeSide::Below);
        assert_eq!(bounds.range_side(&e, &e, 1).unwrap(), RangeSide::AtOrAbove);
    }
}
