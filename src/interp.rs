//! The validating interpreter for hierarchical circuits.
//!
//! Interpretation runs in two passes. Pass 1 collects function
//! declarations into a [`FunStore`], rejecting duplicate names and any
//! call to a not-yet-declared function (which also rules out
//! recursion). Pass 2 walks the top-level gate list with one
//! [`TypeEvaluator`] per declared type, enforcing the wire discipline
//! (single assignment, activeness, contiguity, deletion), routing
//! arithmetic through the type's [`TypeBackend`], and feeding function
//! scopes bounded sub-streams so declared stream consumption is exact.
//!
//! Gate-level problems accumulate in [`Diags`] and checking continues;
//! a broken nesting directive (call, loop, switch) aborts eagerly.

use eyre::Result;
use log::{debug, warn};
use num_traits::Zero;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;

use crate::backend::{ConverterRegistry, FieldChecker, GateCounts, TypeBackend};
use crate::circuit_ir::{
    count_total, AnonCallGate, CaseBody, ConvGate, CountList, ForLoopGate, FunStore, FunctionBody,
    Gate, GateKind, IRTree, IterRange, LineNo, LoopBody, Number, SwitchGate, TypeId, TypeIdMapping,
    TypeStore, WireCount, WireId, WireRange,
};
use crate::error::{Diags, EvalError};
use crate::iterexpr::IterMap;
use crate::scope::{ScopeStack, WireFrame};
use crate::skiplist::SkipList;
use crate::stream::{CircuitInputs, InputStream, QueueStream, StreamBank, StreamRead};

/// What the evaluation is for. Verifier and preprocess runs have no
/// witness, so assertion failures are suppressed rather than reported.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    Prove,
    Verify,
    Preprocess,
}

/// Evaluation options.
#[derive(Clone, Debug)]
pub struct InterpOptions {
    pub mode: Mode,
    /// Reject switch cases whose declared stream counts fall short of
    /// the per-switch maxima, instead of silently skipping the excess.
    pub strict_switch_streams: bool,
    /// Log every gate result.
    pub trace: bool,
}

impl Default for InterpOptions {
    fn default() -> Self {
        InterpOptions {
            mode: Mode::Prove,
            strict_switch_streams: false,
            trace: false,
        }
    }
}

/// Summary of a completed evaluation.
#[derive(Clone, Debug)]
pub struct EvalReport {
    /// Gate tallies per type, indexed by [`TypeId`].
    pub counts: Vec<GateCounts>,
}

impl EvalReport {
    /// Tallies summed over all types.
    pub fn total(&self) -> GateCounts {
        let mut total = GateCounts::default();
        for c in self.counts.iter() {
            total.merge(c);
        }
        total
    }
}

/// Object-safe per-type evaluation surface.
///
/// One implementation exists per declared type; the interpreter
/// dispatches wire-level work here and keeps cross-type orchestration
/// (calls, loops, switches, conversions) to itself.
pub trait TypeEval {
    fn prime(&self) -> Number;

    fn is_boolean(&self) -> bool;

    /// Evaluate a single-output gate. Stream gates receive their value
    /// through `public`/`private`; `None` means the read failed and the
    /// output wire should still be defined to limit cascading errors.
    fn evaluate_gate(
        &mut self,
        gate: &Gate,
        public: Option<Number>,
        private: Option<Number>,
        enable: bool,
        diags: &mut Diags,
    );

    /// Range-output stream ingestion; one value per wire, in order.
    fn stream_multi(
        &mut self,
        range: WireRange,
        values: Vec<Option<Number>>,
        public: bool,
        line: LineNo,
        diags: &mut Diags,
    );

    /// Read a contiguous active range as numbers, for conversion.
    fn conv_inputs(&mut self, range: WireRange, line: LineNo) -> Result<Vec<Number>, EvalError>;

    /// Define a range with converted values.
    fn conv_outputs(
        &mut self,
        range: WireRange,
        values: &[Number],
        line: LineNo,
    ) -> Result<(), EvalError>;

    fn note_convert(&mut self);

    /// The plaintext value of an active wire.
    fn value_of(&self, w: WireId, line: LineNo) -> Result<Number, EvalError>;

    /// The plaintext value held by an arena slot.
    fn slot_value(&self, slot: usize) -> Number;

    /// Overwrite an active wire's value (switch output multiplexing).
    fn write_wire(&mut self, w: WireId, value: Number, line: LineNo) -> Result<(), EvalError>;

    /// Define a wire without giving it a value yet.
    fn insert_unset(&mut self, w: WireId, line: LineNo) -> Result<(), EvalError>;

    fn child_begin(&mut self);

    fn remap_outputs(&mut self, first: WireId, last: WireId, line: LineNo)
        -> Result<(), EvalError>;

    fn remap_inputs(&mut self, first: WireId, last: WireId, line: LineNo)
        -> Result<(), EvalError>;

    /// Give the pending child `count` dummy output slots; returns the
    /// base slot for reading the results back.
    fn map_dummies(&mut self, count: WireCount) -> usize;

    fn child_commit(&mut self);

    /// Verify the child assigned all its outputs, then pop it. Returns
    /// `false` if outputs were missing (reported to `diags`).
    fn child_end(&mut self, line: LineNo, what: &str, diags: &mut Diags) -> bool;

    /// Mark a caller range active once the callee assigned it.
    fn mark_active(&mut self, first: WireId, last: WireId);

    /// Back a declared loop output range with one allocation before
    /// iterations assign it piecewise.
    fn reserve_outputs(&mut self, first: WireId, last: WireId, line: LineNo)
        -> Result<(), EvalError>;

    fn set_depth(&mut self, depth: usize);

    fn counts(&self) -> GateCounts;

    /// End-of-evaluation backend validity.
    fn finalize(&mut self, diags: &mut Diags);
}

/// A circuit evaluator for a single [`TypeBackend`].
///
/// Pairs the backend with the type's [`ScopeStack`]: the backend does
/// arithmetic, the scope stack does wire bookkeeping.
pub struct TypeEvaluator<B: TypeBackend> {
    backend: B,
    scope: ScopeStack<B::Wire>,
    pending: Option<WireFrame>,
}

impl<B: TypeBackend> TypeEvaluator<B> {
    pub fn new(backend: B) -> Self {
        TypeEvaluator {
            backend,
            scope: ScopeStack::new(),
            pending: None,
        }
    }

    fn insert_out(&mut self, w: WireId, line: LineNo, diags: &mut Diags) -> Option<usize> {
        match self.scope.insert(w) {
            Ok(slot) => Some(slot),
            Err(fail) => {
                diags.push(EvalError::wire(
                    line,
                    format!("output wire ${w} is invalid: {}", fail.describe()),
                ));
                None
            }
        }
    }

    fn get_in(&mut self, w: WireId, what: &str, line: LineNo, diags: &mut Diags) -> Option<usize> {
        match self.scope.retrieve(w) {
            Ok(slot) => Some(slot),
            Err(fail) => {
                diags.push(EvalError::wire(
                    line,
                    format!("{what} wire ${w} is invalid: {}", fail.describe()),
                ));
                None
            }
        }
    }

    fn admit(&self, value: &Number, line: LineNo, diags: &mut Diags) -> Option<B::Wire> {
        match self.backend.from_number(value) {
            Ok(w) => Some(w),
            Err(e) => {
                diags.push(EvalError::value(line, e.to_string()));
                None
            }
        }
    }

    fn store(&mut self, slot: usize, result: Result<B::Wire>, diags: &mut Diags) {
        match result {
            Ok(w) => self.scope.set_slot(slot, w),
            Err(e) => diags.push(EvalError::backend(e.to_string())),
        }
    }
}

impl<B: TypeBackend> TypeEval for TypeEvaluator<B> {
    fn prime(&self) -> Number {
        self.backend.prime().clone()
    }

    fn is_boolean(&self) -> bool {
        self.backend.is_boolean()
    }

    fn evaluate_gate(
        &mut self,
        gate: &Gate,
        public: Option<Number>,
        private: Option<Number>,
        enable: bool,
        diags: &mut Diags,
    ) {
        use GateKind::*;
        let line = gate.line;
        match &gate.kind {
            Constant(_, out, value) => {
                let val = self.admit(value, line, diags);
                let slot = self.insert_out(*out, line, diags);
                if let (Some(v), Some(slot)) = (val, slot) {
                    let r = self.backend.assign(v);
                    self.store(slot, r, diags);
                }
            }

            AssertZero(_, wire) => {
                let slot = self.get_in(*wire, "assertion", line, diags);
                if let Some(slot) = slot {
                    if enable {
                        if let Err(e) = self.backend.assert_zero(self.scope.slot(slot)) {
                            diags.push(EvalError::assertion(
                                line,
                                format!("on wire ${wire}: {e}"),
                            ));
                        }
                    } else {
                        self.backend.note_disabled_assert();
                    }
                }
            }

            Copy(_, out, input) => {
                let is = self.get_in(*input, "input", line, diags);
                let os = self.insert_out(*out, line, diags);
                if let (Some(is), Some(os)) = (is, os) {
                    let r = self.backend.copy(self.scope.slot(is));
                    self.store(os, r, diags);
                }
            }

            CopyMulti(g) => {
                let mut values: Vec<B::Wire> = Vec::new();
                let mut ok = true;
                for &(f, l) in g.inputs.iter() {
                    if check_range((f, l), line, diags).is_none() {
                        ok = false;
                        continue;
                    }
                    match self.scope.range_slots(f, l) {
                        Ok(base) => {
                            for k in 0..(l - f + 1) as usize {
                                values.push(self.scope.slot(base + k).clone());
                            }
                        }
                        Err(fail) => {
                            diags.push(EvalError::wire(
                                line,
                                format!(
                                    "input range ${f} ... ${l} is invalid: {}",
                                    fail.describe()
                                ),
                            ));
                            ok = false;
                        }
                    }
                }
                let (of, ol) = g.output;
                if check_range((of, ol), line, diags).is_none() {
                    return;
                }
                if ok && values.len() as u64 != ol - of + 1 {
                    diags.push(EvalError::wire(
                        line,
                        format!(
                            "copy lengths must match: {} input wire(s) into {} output wire(s)",
                            values.len(),
                            ol - of + 1
                        ),
                    ));
                    ok = false;
                }
                for (k, w) in (of..=ol).enumerate() {
                    let slot = self.insert_out(w, line, diags);
                    if ok {
                        if let Some(slot) = slot {
                            let r = self.backend.copy(&values[k]);
                            self.store(slot, r, diags);
                        }
                    }
                }
            }

            Add(_, out, left, right) => {
                let ls = self.get_in(*left, "left input", line, diags);
                let rs = self.get_in(*right, "right input", line, diags);
                let os = self.insert_out(*out, line, diags);
                if let (Some(ls), Some(rs), Some(os)) = (ls, rs, os) {
                    let r = self.backend.add(self.scope.slot(ls), self.scope.slot(rs));
                    self.store(os, r, diags);
                }
            }

            Mul(_, out, left, right) => {
                let ls = self.get_in(*left, "left input", line, diags);
                let rs = self.get_in(*right, "right input", line, diags);
                let os = self.insert_out(*out, line, diags);
                if let (Some(ls), Some(rs), Some(os)) = (ls, rs, os) {
                    let r = self.backend.mul(self.scope.slot(ls), self.scope.slot(rs));
                    self.store(os, r, diags);
                }
            }

            AddConstant(_, out, left, constant) => {
                let ls = self.get_in(*left, "left input", line, diags);
                let c = self.admit(constant, line, diags);
                let os = self.insert_out(*out, line, diags);
                if let (Some(ls), Some(c), Some(os)) = (ls, c, os) {
                    let r = self.backend.add_constant(self.scope.slot(ls), c);
                    self.store(os, r, diags);
                }
            }

            MulConstant(_, out, left, constant) => {
                let ls = self.get_in(*left, "left input", line, diags);
                let c = self.admit(constant, line, diags);
                let os = self.insert_out(*out, line, diags);
                if let (Some(ls), Some(c), Some(os)) = (ls, c, os) {
                    let r = self.backend.mul_constant(self.scope.slot(ls), c);
                    self.store(os, r, diags);
                }
            }

            PublicIn(_, out) => {
                let val = public.and_then(|v| self.admit(&v, line, diags));
                let slot = self.insert_out(*out, line, diags);
                if let (Some(v), Some(slot)) = (val, slot) {
                    let r = self.backend.public_in(v);
                    self.store(slot, r, diags);
                }
            }

            PrivateIn(_, out) => {
                let val = private.and_then(|v| self.admit(&v, line, diags));
                let slot = self.insert_out(*out, line, diags);
                if let (Some(v), Some(slot)) = (val, slot) {
                    let r = self.backend.private_in(v);
                    self.store(slot, r, diags);
                }
            }

            New(_, first, last) => {
                if check_range((*first, *last), line, diags).is_none() {
                    return;
                }
                if let Err(fail) = self.scope.new_range(*first, *last) {
                    diags.push(EvalError::wire(
                        line,
                        format!(
                            "cannot allocate ${first} ... ${last}: {}",
                            fail.describe()
                        ),
                    ));
                }
            }

            Delete(_, first, last) => {
                if check_range((*first, *last), line, diags).is_none() {
                    return;
                }
                if let Err(fail) = self.scope.remove_range(*first, *last) {
                    diags.push(EvalError::wire(
                        line,
                        format!(
                            "cannot delete ${first} ... ${last}: {}",
                            fail.describe()
                        ),
                    ));
                }
            }

            PublicInMulti(..) | PrivateInMulti(..) | Conv(_) | Call(_) | AnonCall(_) | For(_)
            | Switch(_) => {
                unreachable!("directive intercepted by the interpreter")
            }
        }
    }

    fn stream_multi(
        &mut self,
        range: WireRange,
        values: Vec<Option<Number>>,
        public: bool,
        line: LineNo,
        diags: &mut Diags,
    ) {
        for (k, w) in (range.0..=range.1).enumerate() {
            let val = values[k]
                .as_ref()
                .and_then(|v| self.admit(v, line, diags));
            let slot = self.insert_out(w, line, diags);
            if let (Some(v), Some(slot)) = (val, slot) {
                let r = if public {
                    self.backend.public_in(v)
                } else {
                    self.backend.private_in(v)
                };
                self.store(slot, r, diags);
            }
        }
    }

    fn conv_inputs(&mut self, range: WireRange, line: LineNo) -> Result<Vec<Number>, EvalError> {
        let (f, l) = range;
        let base = self.scope.range_slots(f, l).map_err(|fail| {
            EvalError::wire(
                line,
                format!(
                    "conversion input range ${f} ... ${l} is invalid: {}",
                    fail.describe()
                ),
            )
        })?;
        Ok((0..(l - f + 1) as usize)
            .map(|k| self.backend.wire_value(self.scope.slot(base + k)))
            .collect())
    }

    fn conv_outputs(
        &mut self,
        range: WireRange,
        values: &[Number],
        line: LineNo,
    ) -> Result<(), EvalError> {
        let (f, l) = range;
        for (k, w) in (f..=l).enumerate() {
            let slot = self.scope.insert(w).map_err(|fail| {
                EvalError::wire(
                    line,
                    format!("conversion output wire ${w} is invalid: {}", fail.describe()),
                )
            })?;
            let wire = self
                .backend
                .from_number(&values[k])
                .map_err(|e| EvalError::backend(e.to_string()))?;
            self.scope.set_slot(slot, wire);
        }
        Ok(())
    }

    fn note_convert(&mut self) {
        self.backend.note_convert();
    }

    fn value_of(&self, w: WireId, line: LineNo) -> Result<Number, EvalError> {
        let slot = self.scope.retrieve(w).map_err(|fail| {
            EvalError::wire(line, format!("wire ${w} is invalid: {}", fail.describe()))
        })?;
        Ok(self.backend.wire_value(self.scope.slot(slot)))
    }

    fn slot_value(&self, slot: usize) -> Number {
        self.backend.wire_value(self.scope.slot(slot))
    }

    fn write_wire(&mut self, w: WireId, value: Number, line: LineNo) -> Result<(), EvalError> {
        let slot = self.scope.retrieve(w).map_err(|fail| {
            EvalError::wire(line, format!("wire ${w} is invalid: {}", fail.describe()))
        })?;
        let wire = self
            .backend
            .from_number(&value)
            .map_err(|e| EvalError::backend(e.to_string()))?;
        self.scope.set_slot(slot, wire);
        Ok(())
    }

    fn insert_unset(&mut self, w: WireId, line: LineNo) -> Result<(), EvalError> {
        self.scope.insert(w).map(|_| ()).map_err(|fail| {
            EvalError::wire(
                line,
                format!("output wire ${w} is invalid: {}", fail.describe()),
            )
        })
    }

    fn child_begin(&mut self) {
        debug_assert!(self.pending.is_none());
        self.pending = Some(self.scope.child_frame());
    }

    fn remap_outputs(
        &mut self,
        first: WireId,
        last: WireId,
        line: LineNo,
    ) -> Result<(), EvalError> {
        let child = self.pending.as_mut().expect("no child under construction");
        self.scope.remap_outputs(first, last, child).map_err(|fail| {
            EvalError::wire(
                line,
                format!(
                    "output range ${first} ... ${last} is invalid: {}",
                    fail.describe()
                ),
            )
        })
    }

    fn remap_inputs(
        &mut self,
        first: WireId,
        last: WireId,
        line: LineNo,
    ) -> Result<(), EvalError> {
        let child = self.pending.as_mut().expect("no child under construction");
        self.scope.remap_inputs(first, last, child).map_err(|fail| {
            EvalError::wire(
                line,
                format!(
                    "input range ${first} ... ${last} is invalid: {}",
                    fail.describe()
                ),
            )
        })
    }

    fn map_dummies(&mut self, count: WireCount) -> usize {
        let child = self.pending.as_mut().expect("no child under construction");
        self.scope.map_dummies(count, child)
    }

    fn child_commit(&mut self) {
        let child = self.pending.take().expect("no child under construction");
        self.scope.push_frame(child);
    }

    fn child_end(&mut self, line: LineNo, what: &str, diags: &mut Diags) -> bool {
        let missing = self.scope.frame().missing_outputs();
        for (f, l) in missing.iter() {
            diags.push(EvalError::wire(
                line,
                format!(
                    "{what} failed to assign its output wire(s) ${f} ... ${l} \
                     (sub-scope numbering)"
                ),
            ));
        }
        self.scope.pop_frame();
        missing.is_empty()
    }

    fn mark_active(&mut self, first: WireId, last: WireId) {
        self.scope.mark_active(first, last);
    }

    fn reserve_outputs(
        &mut self,
        first: WireId,
        last: WireId,
        line: LineNo,
    ) -> Result<(), EvalError> {
        self.scope.reserve_range(first, last).map_err(|fail| {
            EvalError::wire(
                line,
                format!(
                    "loop output range ${first} ... ${last} is invalid: {}",
                    fail.describe()
                ),
            )
        })
    }

    fn set_depth(&mut self, depth: usize) {
        self.backend.set_depth(depth);
    }

    fn counts(&self) -> GateCounts {
        self.backend.counts()
    }

    fn finalize(&mut self, diags: &mut Diags) {
        if let Err(e) = self.backend.check() {
            diags.push(EvalError::backend(e.to_string()));
        }
    }
}

/// Reject inverted ranges before they reach the wire bookkeeping.
fn check_range(range: WireRange, line: LineNo, diags: &mut Diags) -> Option<()> {
    if range.0 > range.1 {
        diags.push(EvalError::wire(
            line,
            format!(
                "wire range is invalid: first wire ${} exceeds last wire ${}",
                range.0, range.1
            ),
        ));
        None
    } else {
        Some(())
    }
}

fn range_err(range: WireRange, line: LineNo) -> Result<(), EvalError> {
    if range.0 > range.1 {
        Err(EvalError::wire(
            line,
            format!(
                "wire range is invalid: first wire ${} exceeds last wire ${}",
                range.0, range.1
            ),
        ))
    } else {
        Ok(())
    }
}

fn read_stream(
    stream: &mut dyn InputStream,
    prime: &Number,
    which: &str,
    line: LineNo,
) -> Result<Number, EvalError> {
    match stream.next() {
        StreamRead::Value(v) => {
            if &v >= prime {
                Err(EvalError::stream(
                    line,
                    format!(
                        "{which} input value {v} (position {}) exceeds the field modulus {prime}",
                        stream.position() - 1
                    ),
                ))
            } else {
                Ok(v)
            }
        }
        StreamRead::End => Err(EvalError::stream(
            line,
            format!("{which} input stream has reached its end"),
        )),
        StreamRead::Error(e) => Err(EvalError::stream(
            line,
            format!("error reading {which} input stream: {e}"),
        )),
    }
}

/// The interpreter: per-type evaluators plus the converter registry,
/// walking a tree of gates.
pub struct Interpreter {
    eval: Vec<Box<dyn TypeEval>>,
    converters: ConverterRegistry,
    options: InterpOptions,
    diags: Diags,
    depth: usize,
}

impl Interpreter {
    /// Build plaintext checking evaluators for every declared type.
    pub fn new(
        types: &TypeStore,
        converters: ConverterRegistry,
        options: InterpOptions,
    ) -> Result<Self> {
        let mut eval: Vec<Box<dyn TypeEval>> = Vec::new();
        for (idx, spec) in types.iter() {
            // Types load in declaration order.
            debug_assert_eq!(*idx as usize, eval.len());
            let mut checker = FieldChecker::from_spec(spec)?;
            if options.mode != Mode::Prove {
                checker.suppress_asserts(true);
            }
            if options.trace {
                checker.enable_trace();
            }
            eval.push(Box::new(TypeEvaluator::new(checker)));
        }
        Ok(Interpreter {
            eval,
            converters,
            options,
            diags: Diags::default(),
            depth: 0,
        })
    }

    /// Build over caller-supplied per-type evaluators (a ZK backend,
    /// say) instead of the plaintext checkers.
    pub fn from_backends(
        eval: Vec<Box<dyn TypeEval>>,
        converters: ConverterRegistry,
        options: InterpOptions,
    ) -> Self {
        Interpreter {
            eval,
            converters,
            options,
            diags: Diags::default(),
            depth: 0,
        }
    }

    fn asserts_suppressed(&self) -> bool {
        self.options.mode != Mode::Prove
    }

    fn check_type(&self, ty: TypeId, line: LineNo) -> Result<usize, EvalError> {
        let idx = ty as usize;
        if idx >= self.eval.len() {
            Err(EvalError::structural(
                line,
                format!("type index {ty} out of range ({} types declared)", self.eval.len()),
            ))
        } else {
            Ok(idx)
        }
    }

    /// Pass 2 over a top-level gate list.
    pub fn run(
        &mut self,
        gates: &[Gate],
        funs: &FunStore,
        inputs: &mut CircuitInputs,
    ) -> Result<EvalReport> {
        let num_types = self.eval.len();
        {
            let mut bank = inputs.bank(num_types);
            let mut iters = IterMap::default();
            self.eval_list(gates, funs, &mut bank, &mut iters, true)?;
        }

        // Every stream must be exactly drained.
        {
            let mut bank = inputs.bank(num_types);
            for idx in 0..num_types {
                if !matches!(bank.publics[idx].next(), StreamRead::End) {
                    self.diags.push(EvalError::stream(
                        0,
                        format!("public input stream {idx} has leftover values at end of proof"),
                    ));
                }
                if !matches!(bank.privates[idx].next(), StreamRead::End) {
                    self.diags.push(EvalError::stream(
                        0,
                        format!("private input stream {idx} has leftover values at end of proof"),
                    ));
                }
            }
        }

        for idx in 0..num_types {
            self.eval[idx].finalize(&mut self.diags);
        }

        let counts: Vec<GateCounts> = self.eval.iter().map(|e| e.counts()).collect();
        let diags = std::mem::take(&mut self.diags);
        match diags.finish() {
            Ok(()) => Ok(EvalReport { counts }),
            Err(first) => Err(first.into()),
        }
    }

    fn eval_list(
        &mut self,
        gates: &[Gate],
        funs: &FunStore,
        bank: &mut StreamBank<'_>,
        iters: &mut IterMap,
        enable: bool,
    ) -> Result<()> {
        for gate in gates.iter() {
            self.eval_gate(gate, funs, bank, iters, enable)?;
        }
        Ok(())
    }

    fn eval_gate(
        &mut self,
        gate: &Gate,
        funs: &FunStore,
        bank: &mut StreamBank<'_>,
        iters: &mut IterMap,
        enable: bool,
    ) -> Result<()> {
        debug!("GATE: {:?}", gate);
        let line = gate.line;
        match &gate.kind {
            GateKind::PublicIn(ty, _) | GateKind::PrivateIn(ty, _) => {
                let public = matches!(gate.kind, GateKind::PublicIn(..));
                let idx = match self.check_type(*ty, line) {
                    Ok(idx) => idx,
                    Err(e) => {
                        self.diags.push(e);
                        return Ok(());
                    }
                };
                let prime = self.eval[idx].prime();
                let which = if public { "public" } else { "private" };
                let stream = if public {
                    &mut bank.publics[idx]
                } else {
                    &mut bank.privates[idx]
                };
                let val = match read_stream(&mut **stream, &prime, which, line) {
                    Ok(v) => Some(v),
                    Err(e) => {
                        self.diags.push(e);
                        None
                    }
                };
                let (public_val, private_val) = if public { (val, None) } else { (None, val) };
                self.eval[idx].evaluate_gate(gate, public_val, private_val, enable, &mut self.diags);
            }

            GateKind::PublicInMulti(ty, range) | GateKind::PrivateInMulti(ty, range) => {
                let public = matches!(gate.kind, GateKind::PublicInMulti(..));
                let idx = match self.check_type(*ty, line) {
                    Ok(idx) => idx,
                    Err(e) => {
                        self.diags.push(e);
                        return Ok(());
                    }
                };
                if check_range(*range, line, &mut self.diags).is_none() {
                    return Ok(());
                }
                let prime = self.eval[idx].prime();
                let which = if public { "public" } else { "private" };
                let mut values = Vec::with_capacity((range.1 - range.0 + 1) as usize);
                for _ in range.0..=range.1 {
                    let stream = if public {
                        &mut bank.publics[idx]
                    } else {
                        &mut bank.privates[idx]
                    };
                    match read_stream(&mut **stream, &prime, which, line) {
                        Ok(v) => values.push(Some(v)),
                        Err(e) => {
                            self.diags.push(e);
                            values.push(None);
                        }
                    }
                }
                self.eval[idx].stream_multi(*range, values, public, line, &mut self.diags);
            }

            GateKind::Conv(conv) => {
                if let Err(e) = self.eval_conv(conv, line) {
                    self.diags.push(e);
                }
            }

            GateKind::Call(call) => {
                let (name, out_ranges, in_ranges) = call.as_ref();
                self.eval_call(name, out_ranges, in_ranges, line, funs, bank, enable)?;
            }

            GateKind::AnonCall(anon) => {
                self.eval_anon(anon, line, funs, bank, iters, enable)?;
            }

            GateKind::For(fl) => {
                self.eval_for(fl, line, funs, bank, iters, enable)?;
            }

            GateKind::Switch(sw) => {
                self.eval_switch(sw, line, funs, bank, iters, enable)?;
            }

            _ => {
                let ty = plain_type_of(&gate.kind);
                match self.check_type(ty, line) {
                    Ok(idx) => {
                        self.eval[idx].evaluate_gate(gate, None, None, enable, &mut self.diags)
                    }
                    Err(e) => self.diags.push(e),
                }
            }
        }
        Ok(())
    }

    fn eval_conv(&mut self, conv: &ConvGate, line: LineNo) -> Result<(), EvalError> {
        range_err(conv.out_range, line)?;
        range_err(conv.in_range, line)?;
        let out_idx = self.check_type(conv.out_type, line)?;
        let in_idx = self.check_type(conv.in_type, line)?;
        let out_len = conv.out_range.1 - conv.out_range.0 + 1;
        let in_len = conv.in_range.1 - conv.in_range.0 + 1;
        let key = (conv.out_type, out_len, conv.in_type, in_len);
        if !self.converters.contains(&key) {
            return Err(EvalError::structural(
                line,
                format!(
                    "no conversion declared from {} wire(s) of type {} to {} wire(s) of type {}",
                    in_len, conv.in_type, out_len, conv.out_type
                ),
            ));
        }
        let inputs = self.eval[in_idx].conv_inputs(conv.in_range, line)?;
        let mut outputs = vec![Number::zero(); out_len as usize];
        self.converters
            .get_mut(&key)
            .expect("registry checked above")
            .convert(&mut outputs, &inputs, conv.modulus)
            .map_err(|e| EvalError::backend(format!("conversion failed: {e}")))?;
        self.eval[out_idx].conv_outputs(conv.out_range, &outputs, line)?;
        self.eval[out_idx].note_convert();
        Ok(())
    }

    fn frames_begin(&mut self, type_ids: &[TypeId], line: LineNo) -> Result<(), EvalError> {
        for ty in type_ids.iter() {
            let idx = self.check_type(*ty, line)?;
            self.eval[idx].child_begin();
        }
        Ok(())
    }

    fn frames_commit(&mut self, type_ids: &[TypeId]) {
        for ty in type_ids.iter() {
            self.eval[*ty as usize].child_commit();
        }
        self.depth += 1;
        for e in self.eval.iter_mut() {
            e.set_depth(self.depth);
        }
    }

    /// Pop the involved frames, verifying output assignment, then mark
    /// the caller-side output ranges active.
    fn frames_end(
        &mut self,
        type_ids: &[TypeId],
        out_args: &[(TypeId, WireRange)],
        line: LineNo,
        what: &str,
    ) {
        for ty in type_ids.iter() {
            self.eval[*ty as usize].child_end(line, what, &mut self.diags);
        }
        self.depth -= 1;
        for e in self.eval.iter_mut() {
            e.set_depth(self.depth);
        }
        for (ty, (f, l)) in out_args.iter() {
            self.eval[*ty as usize].mark_active(*f, *l);
        }
    }

    /// Draw the declared counts out of the enclosing streams into
    /// per-type sub-queues.
    fn feed_streams(
        &mut self,
        bank: &mut StreamBank<'_>,
        public_counts: &CountList,
        private_counts: &CountList,
        line: LineNo,
    ) -> Result<(Vec<QueueStream>, Vec<QueueStream>), EvalError> {
        let n = self.eval.len();
        let mut publics = vec![QueueStream::new(); n];
        let mut privates = vec![QueueStream::new(); n];
        for (ty, count) in public_counts.iter() {
            let idx = self.check_type(*ty, line)?;
            let prime = self.eval[idx].prime();
            for _ in 0..*count {
                publics[idx].push(read_stream(&mut *bank.publics[idx], &prime, "public", line)?);
            }
        }
        for (ty, count) in private_counts.iter() {
            let idx = self.check_type(*ty, line)?;
            let prime = self.eval[idx].prime();
            for _ in 0..*count {
                privates[idx].push(read_stream(
                    &mut *bank.privates[idx],
                    &prime,
                    "private",
                    line,
                )?);
            }
        }
        Ok((publics, privates))
    }

    fn leftover_streams(
        &mut self,
        publics: &[QueueStream],
        privates: &[QueueStream],
        line: LineNo,
        what: &str,
    ) {
        for (idx, q) in publics.iter().enumerate() {
            if !q.is_empty() {
                self.diags.push(EvalError::stream(
                    line,
                    format!(
                        "public input stream {idx} has {} leftover value(s) after {what}",
                        q.len()
                    ),
                ));
            }
        }
        for (idx, q) in privates.iter().enumerate() {
            if !q.is_empty() {
                self.diags.push(EvalError::stream(
                    line,
                    format!(
                        "private input stream {idx} has {} leftover value(s) after {what}",
                        q.len()
                    ),
                ));
            }
        }
    }

    /// Remap caller argument ranges into the pending child frames:
    /// outputs first, then inputs, in signature order.
    fn remap_args(
        &mut self,
        outputs: &[(TypeId, WireRange, WireCount)],
        inputs: &[(TypeId, WireRange, WireCount)],
        line: LineNo,
        what: &str,
    ) -> Result<(), EvalError> {
        let mut seen: FxHashMap<TypeId, SkipList> = FxHashMap::default();
        for (ty, (f, l), count) in outputs.iter() {
            range_err((*f, *l), line)?;
            let span = l - f + 1;
            if span != *count {
                return Err(EvalError::structural(
                    line,
                    format!(
                        "{what} outputs size mismatch: expected {count} wire(s) \
                         but found {span}"
                    ),
                ));
            }
            if !seen.entry(*ty).or_default().insert_range(*f, *l) {
                warn!("line {line}: {what} output wires ${f} ... ${l} are duplicated");
            }
            let idx = self.check_type(*ty, line)?;
            self.eval[idx].remap_outputs(*f, *l, line)?;
        }
        for (ty, (f, l), count) in inputs.iter() {
            range_err((*f, *l), line)?;
            let span = l - f + 1;
            if span != *count {
                return Err(EvalError::structural(
                    line,
                    format!(
                        "{what} inputs size mismatch: expected {count} wire(s) \
                         but found {span}"
                    ),
                ));
            }
            let idx = self.check_type(*ty, line)?;
            self.eval[idx].remap_inputs(*f, *l, line)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn eval_call(
        &mut self,
        name: &str,
        out_ranges: &[WireRange],
        in_ranges: &[WireRange],
        line: LineNo,
        funs: &FunStore,
        bank: &mut StreamBank<'_>,
        enable: bool,
    ) -> Result<()> {
        if !funs.contains(name) {
            return Err(
                EvalError::structural(line, format!("function \"{name}\" was not previously defined"))
                    .into(),
            );
        }
        let func = funs.get(name)?;
        let sig = func.sig();
        if out_ranges.len() != sig.outputs.len() || in_ranges.len() != sig.inputs.len() {
            return Err(EvalError::structural(
                line,
                format!(
                    "call of \"{name}\" takes {} output / {} input range(s) \
                     but was given {} / {}",
                    sig.outputs.len(),
                    sig.inputs.len(),
                    out_ranges.len(),
                    in_ranges.len()
                ),
            )
            .into());
        }

        let outputs: Vec<(TypeId, WireRange, WireCount)> = sig
            .outputs
            .iter()
            .zip(out_ranges.iter())
            .map(|(&(ty, count), &range)| (ty, range, count))
            .collect();
        let inputs: Vec<(TypeId, WireRange, WireCount)> = sig
            .inputs
            .iter()
            .zip(in_ranges.iter())
            .map(|(&(ty, count), &range)| (ty, range, count))
            .collect();

        let involved = func.compiled_info.type_ids.clone();
        let what = format!("function \"{name}\"");
        self.frames_begin(&involved, line)?;
        self.remap_args(&outputs, &inputs, line, &what)?;
        self.frames_commit(&involved);

        let body = match func.body() {
            FunctionBody::Gates(gates) => gates,
            FunctionBody::Plugin(binding) => {
                return Err(EvalError::structural(
                    line,
                    format!(
                        "plugin {}::{} is not supported by this backend",
                        binding.name, binding.operation
                    ),
                )
                .into());
            }
        };

        let (mut sub_pub, mut sub_prv) =
            self.feed_streams(bank, &sig.public_counts, &sig.private_counts, line)?;
        {
            let mut sub_bank = StreamBank::from_queues(&mut sub_pub, &mut sub_prv);
            // Regular functions do not inherit loop iterators.
            let mut sub_iters = IterMap::default();
            self.eval_list(body, funs, &mut sub_bank, &mut sub_iters, enable)?;
        }

        let out_args: Vec<(TypeId, WireRange)> =
            outputs.iter().map(|&(ty, range, _)| (ty, range)).collect();
        self.frames_end(&involved, &out_args, line, &what);
        self.leftover_streams(&sub_pub, &sub_prv, line, &what);
        Ok(())
    }

    fn eval_anon(
        &mut self,
        anon: &AnonCallGate,
        line: LineNo,
        funs: &FunStore,
        bank: &mut StreamBank<'_>,
        iters: &mut IterMap,
        enable: bool,
    ) -> Result<()> {
        let involved = directive_types(
            &anon.body,
            anon.type_id,
            &anon.public_counts,
            &anon.private_counts,
        );
        let outputs: Vec<(TypeId, WireRange, WireCount)> = anon
            .outputs
            .iter()
            .map(|&(f, l)| (anon.type_id, (f, l), l.saturating_sub(f) + 1))
            .collect();
        let inputs: Vec<(TypeId, WireRange, WireCount)> = anon
            .inputs
            .iter()
            .map(|&(f, l)| (anon.type_id, (f, l), l.saturating_sub(f) + 1))
            .collect();

        self.frames_begin(&involved, line)?;
        self.remap_args(&outputs, &inputs, line, "anonymous function")?;
        self.frames_commit(&involved);

        let (mut sub_pub, mut sub_prv) =
            self.feed_streams(bank, &anon.public_counts, &anon.private_counts, line)?;
        {
            let mut sub_bank = StreamBank::from_queues(&mut sub_pub, &mut sub_prv);
            // Anonymous bodies see the enclosing iterators.
            self.eval_list(&anon.body, funs, &mut sub_bank, iters, enable)?;
        }

        let out_args: Vec<(TypeId, WireRange)> =
            outputs.iter().map(|&(ty, range, _)| (ty, range)).collect();
        self.frames_end(&involved, &out_args, line, "anonymous function");
        self.leftover_streams(&sub_pub, &sub_prv, line, "anonymous function");
        Ok(())
    }

    fn eval_for(
        &mut self,
        fl: &ForLoopGate,
        line: LineNo,
        funs: &FunStore,
        bank: &mut StreamBank<'_>,
        iters: &mut IterMap,
        enable: bool,
    ) -> Result<()> {
        if fl.first > fl.last {
            return Err(EvalError::structural(
                line,
                format!(
                    "loop bounds {} ... {} describe a negative iteration count",
                    fl.first, fl.last
                ),
            )
            .into());
        }
        if iters.contains_key(&fl.iterator) {
            return Err(EvalError::structural(
                line,
                format!("for-loop iterator \"{}\" is already in use", fl.iterator),
            )
            .into());
        }
        let ty_idx = self.check_type(fl.type_id, line)?;

        let mut outputs_all = SkipList::new();
        for &(f, l) in fl.outputs.iter() {
            range_err((f, l), line)?;
            if !outputs_all.insert_range(f, l) {
                warn!("line {line}: for-loop output wires ${f} ... ${l} are duplicated");
            }
            self.eval[ty_idx].reserve_outputs(f, l, line)?;
        }
        let mut outputs_used = SkipList::new();

        for i in fl.first..=fl.last {
            iters.insert(fl.iterator.clone(), i);
            let result = self.eval_iteration(
                fl,
                line,
                funs,
                bank,
                iters,
                enable,
                &outputs_all,
                &mut outputs_used,
            );
            if let Err(e) = result {
                iters.remove(&fl.iterator);
                return Err(e);
            }
        }
        iters.remove(&fl.iterator);

        if !SkipList::equivalent(&outputs_all, &outputs_used) {
            self.diags.push(EvalError::wire(
                line,
                "for-loop did not assign all of its output wires".to_string(),
            ));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn eval_iteration(
        &mut self,
        fl: &ForLoopGate,
        line: LineNo,
        funs: &FunStore,
        bank: &mut StreamBank<'_>,
        iters: &mut IterMap,
        enable: bool,
        outputs_all: &SkipList,
        outputs_used: &mut SkipList,
    ) -> Result<()> {
        let eval_range = |range: &IterRange, iters: &IterMap| -> Result<WireRange, EvalError> {
            let f = range
                .first
                .eval(iters)
                .map_err(|e| EvalError::structural(line, e.to_string()))?;
            let l = range
                .last
                .eval(iters)
                .map_err(|e| EvalError::structural(line, e.to_string()))?;
            range_err((f, l), line)?;
            Ok((f, l))
        };

        let mark_iteration_outputs = |(f, l): WireRange,
                                      outputs_used: &mut SkipList|
         -> Result<(), EvalError> {
            if !outputs_all.has_all(f, l) {
                return Err(EvalError::wire(
                    line,
                    format!(
                        "loop iteration outputs ${f} ... ${l} are not members of the \
                         loop's output list"
                    ),
                ));
            }
            if !outputs_used.insert_range(f, l) {
                warn!("line {line}: loop output wires ${f} ... ${l} are duplicated");
            }
            Ok(())
        };

        match &fl.body {
            LoopBody::Invoke {
                name,
                outputs,
                inputs,
            } => {
                if !funs.contains(name) {
                    return Err(EvalError::structural(
                        line,
                        format!("function \"{name}\" was not previously defined"),
                    )
                    .into());
                }
                let func = funs.get(name)?;
                let sig = func.sig();
                if sig
                    .outputs
                    .iter()
                    .chain(sig.inputs.iter())
                    .any(|&(ty, _)| ty != fl.type_id)
                {
                    return Err(EvalError::structural(
                        line,
                        format!(
                            "loop body function \"{name}\" spans types other than {}",
                            fl.type_id
                        ),
                    )
                    .into());
                }
                if outputs.len() != sig.outputs.len() || inputs.len() != sig.inputs.len() {
                    return Err(EvalError::structural(
                        line,
                        format!(
                            "loop invocation of \"{name}\" takes {} output / {} input \
                             range(s) but was given {} / {}",
                            sig.outputs.len(),
                            sig.inputs.len(),
                            outputs.len(),
                            inputs.len()
                        ),
                    )
                    .into());
                }

                let mut out_args = Vec::with_capacity(outputs.len());
                for (range, &(ty, count)) in outputs.iter().zip(sig.outputs.iter()) {
                    let r = eval_range(range, iters)?;
                    mark_iteration_outputs(r, outputs_used)?;
                    out_args.push((ty, r, count));
                }
                let mut in_args = Vec::with_capacity(inputs.len());
                for (range, &(ty, count)) in inputs.iter().zip(sig.inputs.iter()) {
                    let r = eval_range(range, iters)?;
                    in_args.push((ty, r, count));
                }

                let involved = func.compiled_info.type_ids.clone();
                let what = format!("function \"{name}\"");
                self.frames_begin(&involved, line)?;
                self.remap_args(&out_args, &in_args, line, &what)?;
                self.frames_commit(&involved);

                let body = match func.body() {
                    FunctionBody::Gates(gates) => gates,
                    FunctionBody::Plugin(binding) => {
                        return Err(EvalError::structural(
                            line,
                            format!(
                                "plugin {}::{} is not supported by this backend",
                                binding.name, binding.operation
                            ),
                        )
                        .into());
                    }
                };

                let (mut sub_pub, mut sub_prv) =
                    self.feed_streams(bank, &sig.public_counts, &sig.private_counts, line)?;
                {
                    let mut sub_bank = StreamBank::from_queues(&mut sub_pub, &mut sub_prv);
                    let mut sub_iters = IterMap::default();
                    self.eval_list(body, funs, &mut sub_bank, &mut sub_iters, enable)?;
                }

                let marks: Vec<(TypeId, WireRange)> =
                    out_args.iter().map(|&(ty, r, _)| (ty, r)).collect();
                self.frames_end(&involved, &marks, line, &what);
                self.leftover_streams(&sub_pub, &sub_prv, line, &what);
            }

            LoopBody::Anon {
                outputs,
                inputs,
                public_counts,
                private_counts,
                body,
            } => {
                let mut out_args = Vec::with_capacity(outputs.len());
                for range in outputs.iter() {
                    let r = eval_range(range, iters)?;
                    mark_iteration_outputs(r, outputs_used)?;
                    out_args.push((fl.type_id, r, r.1 - r.0 + 1));
                }
                let mut in_args = Vec::with_capacity(inputs.len());
                for range in inputs.iter() {
                    let r = eval_range(range, iters)?;
                    in_args.push((fl.type_id, r, r.1 - r.0 + 1));
                }

                let involved =
                    directive_types(body, fl.type_id, public_counts, private_counts);
                self.frames_begin(&involved, line)?;
                self.remap_args(&out_args, &in_args, line, "loop iteration")?;
                self.frames_commit(&involved);

                let (mut sub_pub, mut sub_prv) =
                    self.feed_streams(bank, public_counts, private_counts, line)?;
                {
                    let mut sub_bank = StreamBank::from_queues(&mut sub_pub, &mut sub_prv);
                    // The loop iterator stays visible inside the body.
                    self.eval_list(body, funs, &mut sub_bank, iters, enable)?;
                }

                let marks: Vec<(TypeId, WireRange)> =
                    out_args.iter().map(|&(ty, r, _)| (ty, r)).collect();
                self.frames_end(&involved, &marks, line, "loop iteration");
                self.leftover_streams(&sub_pub, &sub_prv, line, "loop iteration");
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn eval_switch(
        &mut self,
        sw: &SwitchGate,
        line: LineNo,
        funs: &FunStore,
        bank: &mut StreamBank<'_>,
        iters: &mut IterMap,
        enable: bool,
    ) -> Result<()> {
        let ty_idx = self.check_type(sw.type_id, line)?;
        let prime = self.eval[ty_idx].prime();
        if sw.cases.is_empty() {
            return Err(
                EvalError::structural(line, "switch statement has no cases".to_string()).into(),
            );
        }

        let cond_val = self.eval[ty_idx].value_of(sw.condition, line)?;

        // Define the output wires up front; their values arrive after
        // the cases run.
        let mut flat_outputs: Vec<WireId> = Vec::new();
        for &(f, l) in sw.outputs.iter() {
            range_err((f, l), line)?;
            for w in f..=l {
                if let Err(e) = self.eval[ty_idx].insert_unset(w, line) {
                    self.diags.push(e);
                }
                flat_outputs.push(w);
            }
        }
        let outputs_size = flat_outputs.len() as WireCount;

        // Case match values: field members, pairwise distinct.
        let mut seen = BTreeSet::new();
        for (m, _) in sw.cases.iter() {
            if m >= &prime {
                self.diags.push(EvalError::value(
                    line,
                    format!("case value {m} is not a member of the field (modulus {prime})"),
                ));
            }
            if !seen.insert(m.clone()) {
                self.diags.push(EvalError::structural(
                    line,
                    format!("case value {m} is duplicated"),
                ));
            }
        }

        // Per-type stream maxima across the cases; the streams are
        // buffered once so every case replays the same values.
        let n = self.eval.len();
        let mut max_pub = vec![0u64; n];
        let mut max_prv = vec![0u64; n];
        let mut case_counts: Vec<(CountList, CountList)> = Vec::with_capacity(sw.cases.len());
        for (_, case) in sw.cases.iter() {
            let (pubs, prvs) = match case {
                CaseBody::Invoke { name, .. } => {
                    if !funs.contains(name) {
                        return Err(EvalError::structural(
                            line,
                            format!("function \"{name}\" was not previously defined"),
                        )
                        .into());
                    }
                    let sig = funs.get(name)?.sig();
                    (sig.public_counts.clone(), sig.private_counts.clone())
                }
                CaseBody::Anon {
                    public_counts,
                    private_counts,
                    ..
                } => (public_counts.clone(), private_counts.clone()),
            };
            for (ty, c) in pubs.iter() {
                let idx = self.check_type(*ty, line)?;
                max_pub[idx] = max_pub[idx].max(*c);
            }
            for (ty, c) in prvs.iter() {
                let idx = self.check_type(*ty, line)?;
                max_prv[idx] = max_prv[idx].max(*c);
            }
            case_counts.push((pubs, prvs));
        }

        if self.options.strict_switch_streams {
            for (i, (pubs, prvs)) in case_counts.iter().enumerate() {
                let short = (0..n).any(|idx| {
                    count_for_idx(pubs, idx) < max_pub[idx]
                        || count_for_idx(prvs, idx) < max_prv[idx]
                });
                if short {
                    return Err(EvalError::stream(
                        line,
                        format!(
                            "case {i} declares fewer stream values than the switch maximum; \
                             the excess would be silently skipped"
                        ),
                    )
                    .into());
                }
            }
        }

        let mut pub_buf: Vec<Vec<Number>> = vec![Vec::new(); n];
        let mut prv_buf: Vec<Vec<Number>> = vec![Vec::new(); n];
        for idx in 0..n {
            let p = self.eval[idx].prime();
            for _ in 0..max_pub[idx] {
                pub_buf[idx].push(read_stream(&mut *bank.publics[idx], &p, "public", line)?);
            }
            for _ in 0..max_prv[idx] {
                prv_buf[idx].push(read_stream(&mut *bank.privates[idx], &p, "private", line)?);
            }
        }

        // Run every case into dummy outputs, oblivious of which one is
        // selected.
        let mut matched_case: Option<usize> = None;
        let mut dummy_values: Vec<Vec<Number>> = Vec::with_capacity(sw.cases.len());
        for (i, (m, case)) in sw.cases.iter().enumerate() {
            let yes_case = cond_val == *m;
            if yes_case && matched_case.is_none() {
                matched_case = Some(i);
            }
            let sub_enable = enable && yes_case;
            let (pubs, prvs) = &case_counts[i];

            // Replay the buffered prefix this case declares.
            let mut sub_pub = vec![QueueStream::new(); n];
            let mut sub_prv = vec![QueueStream::new(); n];
            for (ty, c) in pubs.iter() {
                let idx = *ty as usize;
                for k in 0..*c as usize {
                    sub_pub[idx].push(pub_buf[idx][k].clone());
                }
            }
            for (ty, c) in prvs.iter() {
                let idx = *ty as usize;
                for k in 0..*c as usize {
                    sub_prv[idx].push(prv_buf[idx][k].clone());
                }
            }

            let dummy_base;
            match case {
                CaseBody::Invoke { name, inputs } => {
                    let func = funs.get(name)?;
                    let sig = func.sig();
                    if sig
                        .outputs
                        .iter()
                        .chain(sig.inputs.iter())
                        .any(|&(ty, _)| ty != sw.type_id)
                    {
                        return Err(EvalError::structural(
                            line,
                            format!(
                                "case body function \"{name}\" spans types other than {}",
                                sw.type_id
                            ),
                        )
                        .into());
                    }
                    if count_total(&sig.outputs) != outputs_size
                        || inputs.len() != sig.inputs.len()
                    {
                        return Err(EvalError::structural(
                            line,
                            format!(
                                "case body function \"{name}\" does not fit the switch shape"
                            ),
                        )
                        .into());
                    }
                    let in_args: Vec<(TypeId, WireRange, WireCount)> = sig
                        .inputs
                        .iter()
                        .zip(inputs.iter())
                        .map(|(&(ty, count), &range)| (ty, range, count))
                        .collect();

                    let involved = func.compiled_info.type_ids.clone();
                    let what = format!("case function \"{name}\"");
                    self.frames_begin(&involved, line)?;
                    dummy_base = self.eval[ty_idx].map_dummies(outputs_size);
                    self.remap_args(&[], &in_args, line, &what)?;
                    self.frames_commit(&involved);

                    let body = match func.body() {
                        FunctionBody::Gates(gates) => gates,
                        FunctionBody::Plugin(binding) => {
                            return Err(EvalError::structural(
                                line,
                                format!(
                                    "plugin {}::{} is not supported by this backend",
                                    binding.name, binding.operation
                                ),
                            )
                            .into());
                        }
                    };
                    {
                        let mut sub_bank = StreamBank::from_queues(&mut sub_pub, &mut sub_prv);
                        let mut sub_iters = IterMap::default();
                        self.eval_list(body, funs, &mut sub_bank, &mut sub_iters, sub_enable)?;
                    }
                    self.frames_end(&involved, &[], line, &what);
                    self.leftover_streams(&sub_pub, &sub_prv, line, &what);
                }

                CaseBody::Anon {
                    inputs,
                    public_counts,
                    private_counts,
                    body,
                } => {
                    let in_args: Vec<(TypeId, WireRange, WireCount)> = inputs
                        .iter()
                        .map(|&(f, l)| (sw.type_id, (f, l), l.saturating_sub(f) + 1))
                        .collect();
                    let involved =
                        directive_types(body, sw.type_id, public_counts, private_counts);
                    self.frames_begin(&involved, line)?;
                    dummy_base = self.eval[ty_idx].map_dummies(outputs_size);
                    self.remap_args(&[], &in_args, line, "case body")?;
                    self.frames_commit(&involved);
                    {
                        let mut sub_bank = StreamBank::from_queues(&mut sub_pub, &mut sub_prv);
                        self.eval_list(body, funs, &mut sub_bank, iters, sub_enable)?;
                    }
                    self.frames_end(&involved, &[], line, "case body");
                    self.leftover_streams(&sub_pub, &sub_prv, line, "case body");
                }
            }

            dummy_values.push(
                (0..outputs_size as usize)
                    .map(|k| self.eval[ty_idx].slot_value(dummy_base + k))
                    .collect(),
            );
        }

        // Exactly one selector bit fires under the enable chain.
        if enable && matched_case.is_none() && !self.asserts_suppressed() {
            self.diags.push(EvalError::assertion(
                line,
                format!("no case of the switch statement matches condition value {cond_val}"),
            ));
        }

        // Multiplex: the selector-weighted sum of the dummy outputs.
        // With 0/1 selectors that is the matched case's values, or all
        // zeroes when the switch is disabled.
        for (j, &w) in flat_outputs.iter().enumerate() {
            let value = match matched_case {
                Some(i) => dummy_values[i][j].clone(),
                None => Number::zero(),
            };
            if let Err(e) = self.eval[ty_idx].write_wire(w, value, line) {
                self.diags.push(e);
            }
        }
        Ok(())
    }
}

fn plain_type_of(kind: &GateKind) -> TypeId {
    use GateKind::*;
    match kind {
        Constant(ty, _, _)
        | AssertZero(ty, _)
        | Copy(ty, _, _)
        | Add(ty, _, _, _)
        | Mul(ty, _, _, _)
        | AddConstant(ty, _, _, _)
        | MulConstant(ty, _, _, _)
        | New(ty, _, _)
        | Delete(ty, _, _) => *ty,
        CopyMulti(g) => g.type_id,
        _ => unreachable!("not a plain gate"),
    }
}

fn count_for_idx(list: &CountList, idx: usize) -> u64 {
    list.iter()
        .filter(|(t, _)| *t as usize == idx)
        .map(|(_, c)| c)
        .sum()
}

/// The types a directive body involves: its own wire type, the types
/// its gates touch, and the types it draws stream values from.
fn directive_types(
    body: &[Gate],
    wire_type: TypeId,
    public_counts: &CountList,
    private_counts: &CountList,
) -> Vec<TypeId> {
    let mut mapping = TypeIdMapping::default();
    mapping.set(wire_type);
    mapping.set_from_gates(body);
    for (ty, _) in public_counts.iter().chain(private_counts.iter()) {
        mapping.set(*ty);
    }
    mapping.to_type_ids()
}

/// Check and evaluate a relation against its input streams.
pub fn evaluate(
    tree: &IRTree,
    inputs: &mut CircuitInputs,
    options: InterpOptions,
) -> Result<EvalReport> {
    // Pass 1: declarations.
    let fun_store = FunStore::collect(tree)?;
    let converters = ConverterRegistry::from_specs(&tree.conversions, &tree.types)?;
    // Pass 2: the body.
    let mut interp = Interpreter::new(&tree.types, converters, options)?;
    interp.run(&tree.gates, &fun_store, inputs)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::circuit_ir::{FunctionSignature, FuncDecl, IRTree, Version};
    use crate::error::ErrorKind;
    use crate::iterexpr::IterExpr;
    use crate::stream::CircuitInputs;

    pub(crate) const FF0: TypeId = 0;
    const FF1: TypeId = 1;

    pub(crate) fn n(v: u64) -> Number {
        Number::from(v)
    }

    fn sig(
        name: &str,
        outputs: CountList,
        inputs: CountList,
        public_counts: CountList,
        private_counts: CountList,
    ) -> FunctionSignature {
        FunctionSignature {
            name: name.to_string(),
            outputs,
            inputs,
            public_counts,
            private_counts,
            line: 1,
        }
    }

    pub(crate) fn make_tree(
        fields: Vec<Number>,
        conversions: Vec<crate::circuit_ir::ConversionSpec>,
        functions: Vec<FuncDecl>,
        gates: Vec<Gate>,
    ) -> IRTree {
        IRTree {
            version: Version::new(2, 1, 0),
            plugins: vec![],
            types: TypeStore::try_from(fields).unwrap(),
            conversions,
            functions,
            gates,
        }
    }

    pub(crate) fn test_circuit(
        fields: Vec<Number>,
        functions: Vec<FuncDecl>,
        gates: Vec<Gate>,
        ins: Vec<Vec<u64>>,
        wit: Vec<Vec<u64>>,
    ) -> Result<EvalReport> {
        test_circuit_opts(
            fields,
            vec![],
            functions,
            gates,
            ins,
            wit,
            InterpOptions::default(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn test_circuit_opts(
        fields: Vec<Number>,
        conversions: Vec<crate::circuit_ir::ConversionSpec>,
        functions: Vec<FuncDecl>,
        gates: Vec<Gate>,
        ins: Vec<Vec<u64>>,
        wit: Vec<Vec<u64>>,
        options: InterpOptions,
    ) -> Result<EvalReport> {
        let tree = make_tree(fields, conversions, functions, gates);
        let mut inputs = CircuitInputs::default();
        for (id, values) in ins.into_iter().enumerate() {
            inputs.ingest_publics(id, values.into_iter().map(Number::from).collect());
        }
        for (id, values) in wit.into_iter().enumerate() {
            inputs.ingest_privates(id, values.into_iter().map(Number::from).collect());
        }
        evaluate(&tree, &mut inputs, options)
    }

    fn err_kind(report: &eyre::Report) -> ErrorKind {
        report
            .downcast_ref::<EvalError>()
            .expect("evaluation errors carry their kind")
            .kind()
    }

    #[test]
    fn private_square_identity() {
        // w1 = w0^2; w3 = w1 + 100*w1 == 0 mod 101
        let gates = vec![
            Gate::private_in(FF0, 0, 1),
            Gate::mul(FF0, 1, 0, 0, 2),
            Gate::mulc(FF0, 2, 1, n(100), 3),
            Gate::add(FF0, 3, 1, 2, 4),
            Gate::assert_zero(FF0, 3, 5),
        ];
        let report =
            test_circuit(vec![n(101)], vec![], gates, vec![], vec![vec![3]]).unwrap();
        let total = report.total();
        assert_eq!(total.mul, 1);
        assert_eq!(total.private_in, 1);
        assert_eq!(total.assert_zero, 1);
    }

    #[test]
    fn public_times_hundred_plus_itself() {
        // w0 + 100*w0 = 101*w0 == 0 mod 101 for any public w0.
        let gates = vec![
            Gate::public_in(FF0, 0, 1),
            Gate::constant(FF0, 1, n(100), 2),
            Gate::mul(FF0, 2, 1, 0, 3),
            Gate::add(FF0, 3, 0, 2, 4),
            Gate::assert_zero(FF0, 3, 5),
        ];
        test_circuit(vec![n(101)], vec![], gates, vec![vec![5]], vec![]).unwrap();
    }

    #[test]
    fn failed_assert_reports_and_verify_mode_suppresses() {
        let gates = vec![
            Gate::private_in(FF0, 0, 1),
            Gate::assert_zero(FF0, 0, 2),
        ];
        let err = test_circuit(vec![n(101)], vec![], gates.clone(), vec![], vec![vec![7]])
            .unwrap_err();
        assert_eq!(err_kind(&err), ErrorKind::AssertionFailed);

        let options = InterpOptions {
            mode: Mode::Verify,
            ..Default::default()
        };
        test_circuit_opts(
            vec![n(101)],
            vec![],
            vec![],
            gates,
            vec![],
            vec![vec![7]],
            options,
        )
        .unwrap();
    }

    fn copy_loop(first: u64, last: u64) -> Gate {
        Gate::new(
            GateKind::For(Box::new(ForLoopGate {
                type_id: FF0,
                iterator: "i".to_string(),
                first,
                last,
                outputs: vec![(first, last)],
                body: LoopBody::Anon {
                    outputs: vec![IterRange::single(IterExpr::name("i"))],
                    inputs: vec![IterRange::single(IterExpr::add(
                        IterExpr::name("i"),
                        IterExpr::lit(5),
                    ))],
                    public_counts: vec![],
                    private_counts: vec![],
                    body: vec![Gate::copy(FF0, 0, 1, 11)],
                },
            })),
            10,
        )
    }

    #[test]
    fn loop_copies_previously_assigned_range() {
        let mut gates = vec![
            Gate::new_range(FF0, 5, 8, 1),
            Gate::constant(FF0, 5, n(50), 2),
            Gate::constant(FF0, 6, n(60), 3),
            Gate::constant(FF0, 7, n(70), 4),
            Gate::constant(FF0, 8, n(80), 5),
        ];
        gates.push(copy_loop(0, 3));
        // $0 must now equal $5.
        gates.push(Gate::mulc(FF0, 9, 5, n(100), 12));
        gates.push(Gate::add(FF0, 10, 0, 9, 13));
        gates.push(Gate::assert_zero(FF0, 10, 14));
        test_circuit(vec![n(101)], vec![], gates, vec![], vec![]).unwrap();
    }

    #[test]
    fn loop_over_unassigned_inputs_is_a_wire_error() {
        let gates = vec![copy_loop(0, 3)];
        let err = test_circuit(vec![n(101)], vec![], gates, vec![], vec![]).unwrap_err();
        assert_eq!(err_kind(&err), ErrorKind::Wire);
    }

    #[test]
    fn loop_with_equal_bounds_runs_once() {
        let gates = vec![
            Gate::constant(FF0, 5, n(42), 1),
            copy_loop(0, 0),
            Gate::mulc(FF0, 9, 5, n(100), 3),
            Gate::add(FF0, 10, 0, 9, 4),
            Gate::assert_zero(FF0, 10, 5),
        ];
        test_circuit(vec![n(101)], vec![], gates, vec![], vec![]).unwrap();
    }

    #[test]
    fn loop_must_cover_declared_outputs() {
        // Declares outputs $0 ... $4 but iterations only assign $0 ... $3.
        let mut bad = copy_loop(0, 3);
        if let GateKind::For(fl) = &mut bad.kind {
            fl.outputs = vec![(0, 4)];
        }
        let gates = vec![
            Gate::new_range(FF0, 5, 8, 1),
            Gate::constant(FF0, 5, n(1), 2),
            Gate::constant(FF0, 6, n(2), 3),
            Gate::constant(FF0, 7, n(3), 4),
            Gate::constant(FF0, 8, n(4), 5),
            bad,
        ];
        let err = test_circuit(vec![n(101)], vec![], gates, vec![], vec![]).unwrap_err();
        assert_eq!(err_kind(&err), ErrorKind::Wire);
    }

    #[test]
    fn duplicate_loop_iterator_rejected() {
        let inner = copy_loop(0, 0);
        let outer = Gate::new(
            GateKind::For(Box::new(ForLoopGate {
                type_id: FF0,
                iterator: "i".to_string(),
                first: 0,
                last: 0,
                outputs: vec![],
                body: LoopBody::Anon {
                    outputs: vec![],
                    inputs: vec![],
                    public_counts: vec![],
                    private_counts: vec![],
                    body: vec![inner],
                },
            })),
            1,
        );
        let err = test_circuit(vec![n(101)], vec![], vec![outer], vec![], vec![])
            .unwrap_err();
        assert_eq!(err_kind(&err), ErrorKind::Structural);
    }

    fn two_case_switch(outputs: Vec<WireRange>, case0: Vec<Gate>, case1: Vec<Gate>) -> Gate {
        Gate::new(
            GateKind::Switch(Box::new(SwitchGate {
                type_id: FF0,
                condition: 0,
                outputs,
                cases: vec![
                    (
                        n(0),
                        CaseBody::Anon {
                            inputs: vec![(1, 1)],
                            public_counts: vec![],
                            private_counts: vec![],
                            body: case0,
                        },
                    ),
                    (
                        n(1),
                        CaseBody::Anon {
                            inputs: vec![(2, 2)],
                            public_counts: vec![],
                            private_counts: vec![],
                            body: case1,
                        },
                    ),
                ],
            })),
            20,
        )
    }

    #[test]
    fn switch_runs_only_the_matching_case() {
        // Case 0 asserts on 5 (would fail); case 1 asserts on 0. The
        // witness selects case 1, and its output value 9 reaches $3.
        let gates = vec![
            Gate::private_in(FF0, 0, 1),
            Gate::constant(FF0, 1, n(5), 2),
            Gate::constant(FF0, 2, n(0), 3),
            two_case_switch(
                vec![(3, 3)],
                vec![
                    Gate::assert_zero(FF0, 1, 21),
                    Gate::constant(FF0, 0, n(7), 22),
                ],
                vec![
                    Gate::assert_zero(FF0, 1, 23),
                    Gate::constant(FF0, 0, n(9), 24),
                ],
            ),
            Gate::addc(FF0, 4, 3, n(92), 30),
            Gate::assert_zero(FF0, 4, 31),
        ];
        let report =
            test_circuit(vec![n(101)], vec![], gates, vec![], vec![vec![1]]).unwrap();
        // Case 0's assert ran disabled.
        assert_eq!(report.total().assert_zero_disabled, 1);
    }

    #[test]
    fn switch_with_no_matching_case_fails() {
        let gates = vec![
            Gate::private_in(FF0, 0, 1),
            Gate::constant(FF0, 1, n(0), 2),
            Gate::constant(FF0, 2, n(0), 3),
            // With no switch outputs the case input lands at child wire 0.
            two_case_switch(
                vec![],
                vec![Gate::assert_zero(FF0, 0, 21)],
                vec![Gate::assert_zero(FF0, 0, 22)],
            ),
        ];
        let err = test_circuit(vec![n(101)], vec![], gates, vec![], vec![vec![3]])
            .unwrap_err();
        assert_eq!(err_kind(&err), ErrorKind::AssertionFailed);
    }

    #[test]
    fn switch_rejects_duplicate_case_values() {
        let mut sw = two_case_switch(
            vec![],
            vec![Gate::assert_zero(FF0, 0, 21)],
            vec![Gate::assert_zero(FF0, 0, 22)],
        );
        if let GateKind::Switch(s) = &mut sw.kind {
            s.cases[1].0 = n(0);
        }
        let gates = vec![
            Gate::private_in(FF0, 0, 1),
            Gate::constant(FF0, 1, n(0), 2),
            Gate::constant(FF0, 2, n(0), 3),
            sw,
        ];
        let err = test_circuit(vec![n(101)], vec![], gates, vec![], vec![vec![0]])
            .unwrap_err();
        assert_eq!(err_kind(&err), ErrorKind::Structural);
    }

    fn stream_hungry_switch() -> Vec<Gate> {
        // Case 0 declares two private values, case 1 only one; the
        // switch buffers the maximum so both cases replay the same
        // stream state.
        vec![
            Gate::private_in(FF0, 0, 1),
            Gate::new(
                GateKind::Switch(Box::new(SwitchGate {
                    type_id: FF0,
                    condition: 0,
                    outputs: vec![],
                    cases: vec![
                        (
                            n(0),
                            CaseBody::Anon {
                                inputs: vec![],
                                public_counts: vec![],
                                private_counts: vec![(FF0, 2)],
                                body: vec![
                                    Gate::private_in(FF0, 0, 21),
                                    Gate::private_in(FF0, 1, 22),
                                ],
                            },
                        ),
                        (
                            n(1),
                            CaseBody::Anon {
                                inputs: vec![],
                                public_counts: vec![],
                                private_counts: vec![(FF0, 1)],
                                body: vec![Gate::private_in(FF0, 0, 23)],
                            },
                        ),
                    ],
                })),
                20,
            ),
        ]
    }

    #[test]
    fn switch_buffers_the_maximum_stream_prefix() {
        // cond 1, then two buffered values; the lenient default lets
        // case 1 skip the second one.
        test_circuit(
            vec![n(101)],
            vec![],
            stream_hungry_switch(),
            vec![],
            vec![vec![1, 10, 20]],
        )
        .unwrap();
    }

    #[test]
    fn strict_switch_streams_reject_short_cases() {
        let options = InterpOptions {
            strict_switch_streams: true,
            ..Default::default()
        };
        let err = test_circuit_opts(
            vec![n(101)],
            vec![],
            vec![],
            stream_hungry_switch(),
            vec![],
            vec![vec![1, 10, 20]],
            options,
        )
        .unwrap_err();
        assert_eq!(err_kind(&err), ErrorKind::Stream);
    }

    #[test]
    fn conversion_needs_a_registered_shape() {
        let gates = vec![
            Gate::constant(FF0, 0, n(1), 1),
            Gate::new(
                GateKind::Conv(Box::new(ConvGate {
                    out_type: FF1,
                    out_range: (0, 1),
                    in_type: FF0,
                    in_range: (0, 0),
                    modulus: false,
                })),
                2,
            ),
        ];
        let err = test_circuit(vec![n(101), n(256)], vec![], gates, vec![], vec![])
            .unwrap_err();
        assert_eq!(err_kind(&err), ErrorKind::Structural);
    }

    #[test]
    fn registered_single_wire_conversion_reinterprets() {
        let conversions = vec![crate::circuit_ir::ConversionSpec {
            out_type: FF1,
            out_count: 1,
            in_type: FF0,
            in_count: 1,
        }];
        let gates = vec![
            Gate::constant(FF0, 0, n(1), 1),
            Gate::new(
                GateKind::Conv(Box::new(ConvGate {
                    out_type: FF1,
                    out_range: (0, 0),
                    in_type: FF0,
                    in_range: (0, 0),
                    modulus: false,
                })),
                2,
            ),
            Gate::addc(FF1, 1, 0, n(1), 3),
            Gate::assert_zero(FF1, 1, 4),
        ];
        test_circuit_opts(
            vec![n(101), n(2)],
            conversions,
            vec![],
            gates,
            vec![],
            vec![],
            InterpOptions::default(),
        )
        .unwrap();
    }

    #[test]
    fn recursive_function_is_structural() {
        let body = vec![Gate::call("omega", vec![], vec![], 2)];
        let func = FuncDecl::new_function(sig("omega", vec![], vec![], vec![], vec![]), body);
        let err = test_circuit(vec![n(101)], vec![func], vec![], vec![], vec![])
            .unwrap_err();
        assert_eq!(err_kind(&err), ErrorKind::Structural);
    }

    #[test]
    fn unknown_function_is_structural() {
        let gates = vec![Gate::call("missing", vec![], vec![], 1)];
        let err = test_circuit(vec![n(101)], vec![], gates, vec![], vec![]).unwrap_err();
        assert_eq!(err_kind(&err), ErrorKind::Structural);
    }

    #[test]
    fn function_call_round_trip() {
        // square(x) = x^2, with output written through the callee.
        let square = FuncDecl::new_function(
            sig("square", vec![(FF0, 1)], vec![(FF0, 1)], vec![], vec![]),
            vec![Gate::mul(FF0, 0, 1, 1, 2)],
        );
        let gates = vec![
            Gate::private_in(FF0, 0, 1),
            Gate::call("square", vec![(1, 1)], vec![(0, 0)], 3),
            // 3^2 = 9; 9 + 92 = 0 mod 101
            Gate::addc(FF0, 2, 1, n(92), 4),
            Gate::assert_zero(FF0, 2, 5),
        ];
        test_circuit(vec![n(101)], vec![square], gates, vec![], vec![vec![3]]).unwrap();
    }

    #[test]
    fn empty_function_accepted_iff_no_outputs() {
        let noop = FuncDecl::new_function(sig("noop", vec![], vec![], vec![], vec![]), vec![]);
        let gates = vec![Gate::call("noop", vec![], vec![], 1)];
        test_circuit(vec![n(101)], vec![noop], gates, vec![], vec![]).unwrap();

        let broken = FuncDecl::new_function(
            sig("broken", vec![(FF0, 1)], vec![], vec![], vec![]),
            vec![],
        );
        let gates = vec![Gate::call("broken", vec![(0, 0)], vec![], 1)];
        let err = test_circuit(vec![n(101)], vec![broken], gates, vec![], vec![])
            .unwrap_err();
        assert_eq!(err_kind(&err), ErrorKind::Wire);
    }

    #[test]
    fn call_argument_spans_must_match_declaration() {
        let pair = FuncDecl::new_function(
            sig("pair", vec![(FF0, 2)], vec![], vec![], vec![]),
            vec![
                Gate::constant(FF0, 0, n(1), 2),
                Gate::constant(FF0, 1, n(2), 3),
            ],
        );
        let gates = vec![Gate::call("pair", vec![(0, 0)], vec![], 4)];
        let err = test_circuit(vec![n(101)], vec![pair], gates, vec![], vec![])
            .unwrap_err();
        assert_eq!(err_kind(&err), ErrorKind::Structural);
    }

    #[test]
    fn function_stream_consumption_is_exact() {
        // Declares two private values but reads only one.
        let lazy = FuncDecl::new_function(
            sig("lazy", vec![], vec![], vec![], vec![(FF0, 2)]),
            vec![Gate::private_in(FF0, 0, 2)],
        );
        let gates = vec![Gate::call("lazy", vec![], vec![], 1)];
        let err = test_circuit(vec![n(101)], vec![lazy], gates, vec![], vec![vec![4, 5]])
            .unwrap_err();
        assert_eq!(err_kind(&err), ErrorKind::Stream);

        // Declares one but reads two.
        let greedy = FuncDecl::new_function(
            sig("greedy", vec![], vec![], vec![], vec![(FF0, 1)]),
            vec![
                Gate::private_in(FF0, 0, 2),
                Gate::private_in(FF0, 1, 3),
            ],
        );
        let gates = vec![Gate::call("greedy", vec![], vec![], 1)];
        let err = test_circuit(vec![n(101)], vec![greedy], gates, vec![], vec![vec![4]])
            .unwrap_err();
        assert_eq!(err_kind(&err), ErrorKind::Stream);
    }

    #[test]
    fn leftover_root_stream_values_are_an_error() {
        let gates = vec![Gate::private_in(FF0, 0, 1)];
        let err = test_circuit(vec![n(101)], vec![], gates, vec![], vec![vec![1, 2]])
            .unwrap_err();
        assert_eq!(err_kind(&err), ErrorKind::Stream);
    }

    #[test]
    fn stream_values_must_be_field_members() {
        let gates = vec![Gate::private_in(FF0, 0, 1)];
        let err = test_circuit(vec![n(101)], vec![], gates, vec![], vec![vec![101]])
            .unwrap_err();
        assert_eq!(err_kind(&err), ErrorKind::Stream);
    }

    #[test]
    fn constants_must_be_field_members() {
        let gates = vec![Gate::constant(FF0, 0, n(101), 1)];
        let err = test_circuit(vec![n(101)], vec![], gates, vec![], vec![]).unwrap_err();
        assert_eq!(err_kind(&err), ErrorKind::Value);
    }

    #[test]
    fn reassignment_is_a_wire_error() {
        let gates = vec![
            Gate::constant(FF0, 0, n(1), 1),
            Gate::constant(FF0, 0, n(2), 2),
        ];
        let err = test_circuit(vec![n(101)], vec![], gates, vec![], vec![]).unwrap_err();
        assert_eq!(err_kind(&err), ErrorKind::Wire);
    }

    #[test]
    fn use_before_assignment_is_a_wire_error() {
        let gates = vec![Gate::add(FF0, 2, 0, 1, 1)];
        let err = test_circuit(vec![n(101)], vec![], gates, vec![], vec![]).unwrap_err();
        assert_eq!(err_kind(&err), ErrorKind::Wire);
    }

    #[test]
    fn delete_discipline_is_enforced() {
        // Deleting the middle of a live allocation splits it.
        let gates = vec![
            Gate::new_range(FF0, 0, 4, 1),
            Gate::constant(FF0, 0, n(1), 2),
            Gate::constant(FF0, 1, n(2), 3),
            Gate::constant(FF0, 2, n(3), 4),
            Gate::constant(FF0, 3, n(4), 5),
            Gate::constant(FF0, 4, n(5), 6),
            Gate::delete_range(FF0, 1, 3, 7),
        ];
        let err = test_circuit(vec![n(101)], vec![], gates, vec![], vec![]).unwrap_err();
        assert_eq!(err_kind(&err), ErrorKind::Wire);

        // Deleting a suffix and then using it.
        let gates = vec![
            Gate::new_range(FF0, 0, 4, 1),
            Gate::constant(FF0, 0, n(1), 2),
            Gate::constant(FF0, 1, n(2), 3),
            Gate::constant(FF0, 2, n(3), 4),
            Gate::constant(FF0, 3, n(4), 5),
            Gate::constant(FF0, 4, n(5), 6),
            Gate::delete_range(FF0, 2, 4, 7),
            Gate::add(FF0, 5, 3, 0, 8),
        ];
        let err = test_circuit(vec![n(101)], vec![], gates, vec![], vec![]).unwrap_err();
        assert_eq!(err_kind(&err), ErrorKind::Wire);
    }

    #[test]
    fn type_index_out_of_range_is_structural() {
        let gates = vec![Gate::constant(5, 0, n(1), 1)];
        let err = test_circuit(vec![n(101)], vec![], gates, vec![], vec![]).unwrap_err();
        assert_eq!(err_kind(&err), ErrorKind::Structural);
    }

    #[test]
    fn loop_consumes_declared_streams_per_iteration() {
        let sum_loop = Gate::new(
            GateKind::For(Box::new(ForLoopGate {
                type_id: FF0,
                iterator: "i".to_string(),
                first: 0,
                last: 2,
                outputs: vec![(0, 2)],
                body: LoopBody::Anon {
                    outputs: vec![IterRange::single(IterExpr::name("i"))],
                    inputs: vec![],
                    public_counts: vec![],
                    private_counts: vec![(FF0, 1)],
                    body: vec![Gate::private_in(FF0, 0, 11)],
                },
            })),
            10,
        );
        test_circuit(
            vec![n(101)],
            vec![],
            vec![sum_loop.clone()],
            vec![],
            vec![vec![7, 8, 9]],
        )
        .unwrap();

        let err = test_circuit(vec![n(101)], vec![], vec![sum_loop], vec![], vec![vec![7, 8]])
            .unwrap_err();
        assert_eq!(err_kind(&err), ErrorKind::Stream);
    }

    #[test]
    fn copy_multi_concatenates_ranges() {
        let gates = vec![
            Gate::new_range(FF0, 0, 1, 1),
            Gate::constant(FF0, 0, n(4), 2),
            Gate::constant(FF0, 1, n(5), 3),
            Gate::constant(FF0, 4, n(6), 4),
            Gate::new(
                GateKind::CopyMulti(Box::new(crate::circuit_ir::CopyMultiGate {
                    type_id: FF0,
                    output: (10, 12),
                    inputs: vec![(0, 1), (4, 4)],
                })),
                5,
            ),
            Gate::addc(FF0, 13, 12, n(95), 6),
            Gate::assert_zero(FF0, 13, 7),
        ];
        test_circuit(vec![n(101)], vec![], gates, vec![], vec![]).unwrap();
    }
}
