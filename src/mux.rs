//! Switch-to-multiplexer lowering.
//!
//! Rebuilds a relation with every switch statement replaced by
//! arithmetic over the restricted gate set {add, mul, addc, mulc, copy,
//! assign, assert_zero, public_in, private_in, call, for-loop}:
//!
//! 1. The per-type stream maxima across the cases are ingested once
//!    into ephemeral wires, so every case sees the same stream state;
//!    case bodies draw from those wires by copy instead of reading the
//!    streams.
//! 2. Each case gets a selector bit `1 - (cond - match)^(p-1)` computed
//!    by a generated Fermat-chain helper function (negation and copy in
//!    boolean rings).
//! 3. Each case body runs as an anonymous call writing dummy outputs,
//!    with every `assert_zero(w)` rewritten to
//!    `assert_zero(w * selector)` so inactive cases cannot fail.
//! 4. The real outputs become the selector-weighted sums of the dummy
//!    outputs, and the selector sum is asserted to be exactly one
//!    (gated by any enclosing switch's selector).
//!
//! Ephemeral wires introduced by the pass start at `2^63`, far above
//! any circuit's own numbering.

use eyre::{bail, ensure, Result};
use log::debug;
use num_traits::{One, Zero};
use rustc_hash::FxHashMap;

use crate::circuit_ir::{
    count_total, AnonCallGate, CaseBody, CountList, ForLoopGate, FuncDecl, FunctionSignature,
    Gate, GateKind, IRTree, IterRange, LineNo, LoopBody, Number, SwitchGate, TypeId, TypeSpec,
    TypeStore, WireCount, WireId, WireRange,
};
use crate::iterexpr::{IterBoundsStack, IterExpr, RangeSide};

/// First wire index reserved for transformer-introduced wires.
pub const EPHEMERAL_BASE: WireId = 1 << 63;

const MUX_ITER: &str = "mux::i";

/// Replace every switch statement in `tree`, preserving semantics.
pub fn lower_switches(tree: &IRTree) -> Result<IRTree> {
    let mut lowering = Lowering {
        types: &tree.types,
        funs: FxHashMap::default(),
        out_functions: Vec::new(),
    };

    // Helper functions first, so everything after may call them.
    let mut checker_types = Vec::new();
    collect_checker_types(&tree.gates, &mut checker_types);
    for func in tree.functions.iter() {
        if let crate::circuit_ir::FunctionBody::Gates(gates) = func.body() {
            collect_checker_types(gates, &mut checker_types);
        }
    }
    checker_types.sort_unstable();
    checker_types.dedup();
    for ty in checker_types {
        let (prime, boolean) = lowering.field_of(ty)?;
        if !boolean {
            let checker = make_case_checker(ty, &prime);
            lowering
                .funs
                .insert(checker.name().to_string(), checker.clone());
            lowering.out_functions.push(checker);
        }
    }

    for func in tree.functions.iter() {
        let lowered = match func.body() {
            crate::circuit_ir::FunctionBody::Gates(gates) => {
                let mut bounds = IterBoundsStack::new();
                let body = lowering.transform(gates, &mut bounds, None)?;
                FuncDecl::new_function(func.sig().clone(), body)
            }
            crate::circuit_ir::FunctionBody::Plugin(binding) => {
                FuncDecl::new_plugin(func.sig().clone(), binding.clone())
            }
        };
        lowering.funs.insert(lowered.name().to_string(), lowered.clone());
        lowering.out_functions.push(lowered);
    }

    let mut bounds = IterBoundsStack::new();
    let gates = lowering.transform(&tree.gates, &mut bounds, None)?;

    Ok(IRTree {
        version: tree.version.clone(),
        plugins: tree.plugins.clone(),
        types: tree.types.clone(),
        conversions: tree.conversions.clone(),
        functions: lowering.out_functions,
        gates,
    })
}

/// Types whose switches need the Fermat case-checker helper.
fn collect_checker_types(gates: &[Gate], out: &mut Vec<TypeId>) {
    for gate in gates.iter() {
        match &gate.kind {
            GateKind::Switch(sw) => {
                if sw.cases.len() >= 2 {
                    out.push(sw.type_id);
                }
                for (_, case) in sw.cases.iter() {
                    if let CaseBody::Anon { body, .. } = case {
                        collect_checker_types(body, out);
                    }
                }
            }
            GateKind::AnonCall(anon) => collect_checker_types(&anon.body, out),
            GateKind::For(fl) => {
                if let LoopBody::Anon { body, .. } = &fl.body {
                    collect_checker_types(body, out);
                }
            }
            _ => {}
        }
    }
}

fn checker_name(ty: TypeId) -> String {
    format!("mux::check_case_{ty}")
}

/// Emit `mul` gates computing `$in_wire ^ exponent` by square and
/// multiply, returning through `curr` the wire carrying the result.
fn exponentiate(gates: &mut Vec<Gate>, ty: TypeId, exponent: &Number, in_wire: WireId, curr: &mut WireId) {
    if exponent.is_one() {
        return;
    }
    if (exponent % 2u8).is_one() {
        exponentiate(gates, ty, &(exponent - 1u8), in_wire, curr);
        gates.push(Gate::mul(ty, *curr + 1, *curr, in_wire, 0));
        *curr += 1;
    } else {
        exponentiate(gates, ty, &(exponent / 2u8), in_wire, curr);
        gates.push(Gate::mul(ty, *curr + 1, *curr, *curr, 0));
        *curr += 1;
    }
}

/// The selector helper: given the condition and the additive inverse of
/// a case match value, output `1 - (cond - match)^(p-1)`, which is 1
/// exactly when they are equal.
fn make_case_checker(ty: TypeId, prime: &Number) -> FuncDecl {
    let mut gates = Vec::new();
    // $1 is the condition, $2 is -match; $3 their sum.
    gates.push(Gate::add(ty, 3, 1, 2, 0));
    let mut wire = 3;
    exponentiate(&mut gates, ty, &(prime - 1u8), 3, &mut wire);
    gates.push(Gate::mulc(ty, wire + 1, wire, prime - 1u8, 0));
    gates.push(Gate::addc(ty, 0, wire + 1, Number::one(), 0));

    FuncDecl::new_function(
        FunctionSignature {
            name: checker_name(ty),
            outputs: vec![(ty, 1)],
            inputs: vec![(ty, 1), (ty, 1)],
            public_counts: vec![],
            private_counts: vec![],
            line: 0,
        },
        gates,
    )
}

/// Wire index translation for a case body hoisted into an anonymous
/// call whose inputs grew by the selector bit and the ephemeral stream
/// block.
struct Adjuster {
    num_output: WireCount,
    num_input: WireCount,
    num_instance: WireCount,
    num_witness: WireCount,
    curr_instance: WireCount,
    curr_witness: WireCount,
}

impl Adjuster {
    fn new(
        num_output: WireCount,
        num_input: WireCount,
        num_instance: WireCount,
        num_witness: WireCount,
    ) -> Self {
        Adjuster {
            num_output,
            num_input,
            num_instance,
            num_witness,
            curr_instance: 0,
            curr_witness: 0,
        }
    }

    fn io_end(&self) -> WireId {
        self.num_output + self.num_input
    }

    /// The child-local index of the selector bit input.
    fn selector(&self) -> WireId {
        self.io_end()
    }

    /// Locals shift past the selector and stream block; outputs and
    /// inputs keep their indices.
    fn shift(&self) -> u64 {
        self.num_instance + self.num_witness + 1
    }

    fn adjust(&self, w: WireId) -> WireId {
        if w < self.io_end() {
            w
        } else {
            w + self.shift()
        }
    }

    /// The next unconsumed ephemeral public input wire.
    fn next_instance(&mut self) -> WireId {
        let w = self.io_end() + 1 + self.curr_instance;
        self.curr_instance += 1;
        w
    }

    /// The next unconsumed ephemeral private input wire.
    fn next_witness(&mut self) -> WireId {
        let w = self.io_end() + 1 + self.num_instance + self.curr_witness;
        self.curr_witness += 1;
        w
    }

    /// Translate a whole range, splitting it when it straddles the
    /// io/local boundary.
    fn adjust_range(&self, (f, l): WireRange) -> Vec<WireRange> {
        let bound = self.io_end();
        if l < bound {
            vec![(f, l)]
        } else if f >= bound {
            vec![(f + self.shift(), l + self.shift())]
        } else {
            vec![(f, bound - 1), (bound + self.shift(), l + self.shift())]
        }
    }
}

struct Lowering<'a> {
    types: &'a TypeStore,
    /// Already-lowered declarations, for case and loop body lookups.
    funs: FxHashMap<String, FuncDecl>,
    out_functions: Vec<FuncDecl>,
}

impl<'a> Lowering<'a> {
    fn field_of(&self, ty: TypeId) -> Result<(Number, bool)> {
        match self.types.get(&ty)? {
            TypeSpec::Field { modulus } => {
                Ok((modulus.clone(), modulus == &Number::from(2u8)))
            }
            TypeSpec::Ring { bits } => Ok((Number::one() << *bits, *bits == 1)),
            TypeSpec::Plugin(plugin) => {
                bail!("cannot lower switches over plugin type {}", plugin.name)
            }
        }
    }

    fn lookup(&self, name: &str, line: LineNo) -> Result<&FuncDecl> {
        self.funs
            .get(name)
            .ok_or_else(|| eyre::eyre!("line {line}: could not find function \"{name}\""))
    }

    /// The per-type-`ty` stream counts a case declares. Cross-type
    /// stream consumption inside a case cannot be threaded through the
    /// single-type anonymous calls this pass emits.
    fn case_stream_counts(
        &self,
        case: &CaseBody,
        ty: TypeId,
        line: LineNo,
    ) -> Result<(u64, u64)> {
        let (pubs, prvs): (&CountList, &CountList) = match case {
            CaseBody::Invoke { name, .. } => {
                let sig = self.lookup(name, line)?.sig();
                (&sig.public_counts, &sig.private_counts)
            }
            CaseBody::Anon {
                public_counts,
                private_counts,
                ..
            } => (public_counts, private_counts),
        };
        for (t, c) in pubs.iter().chain(prvs.iter()) {
            ensure!(
                *t == ty || *c == 0,
                "line {line}: case consumes type {t} stream values; lowering supports \
                 only the switch's own type {ty}"
            );
        }
        Ok((
            crate::circuit_ir::count_for(pubs, ty),
            crate::circuit_ir::count_for(prvs, ty),
        ))
    }

    /// The shape of one case body: its input ranges (caller space), the
    /// callee body to adjust, and the sub-adjuster dimensions.
    fn case_parts<'b>(
        &'b self,
        case: &'b CaseBody,
        num_outputs: WireCount,
        ty: TypeId,
        line: LineNo,
    ) -> Result<(Vec<WireRange>, &'b [Gate], WireCount)> {
        match case {
            CaseBody::Invoke { name, inputs } => {
                let func = self.lookup(name, line)?;
                let sig = func.sig();
                ensure!(
                    sig.outputs.iter().chain(sig.inputs.iter()).all(|&(t, _)| t == ty),
                    "line {line}: case function \"{name}\" spans types other than {ty}"
                );
                ensure!(
                    count_total(&sig.outputs) == num_outputs,
                    "line {line}: case function \"{name}\" outputs do not fit the switch"
                );
                let body = match func.body() {
                    crate::circuit_ir::FunctionBody::Gates(gates) => gates.as_slice(),
                    crate::circuit_ir::FunctionBody::Plugin(_) => {
                        bail!("line {line}: cannot lower a switch over a plugin case body")
                    }
                };
                Ok((inputs.clone(), body, count_total(&sig.inputs)))
            }
            CaseBody::Anon { inputs, body, .. } => {
                let span: WireCount = inputs
                    .iter()
                    .map(|&(f, l)| l - f + 1)
                    .sum();
                Ok((inputs.clone(), body.as_slice(), span))
            }
        }
    }

    /// Copy a directive list, lowering switches. With `adj` set, the
    /// list is a case body being hoisted: wires are translated, stream
    /// reads become copies from the ephemeral block, and asserts are
    /// gated by the selector bit.
    fn transform(
        &self,
        gates: &[Gate],
        bounds: &mut IterBoundsStack,
        mut adj: Option<&mut Adjuster>,
    ) -> Result<Vec<Gate>> {
        let mut out = Vec::with_capacity(gates.len());
        let mut eph = EPHEMERAL_BASE;

        for gate in gates.iter() {
            let line = gate.line;
            match &gate.kind {
                GateKind::Constant(ty, w, v) => {
                    let w = adj.as_deref().map_or(*w, |a| a.adjust(*w));
                    out.push(Gate::constant(*ty, w, (**v).clone(), line));
                }
                GateKind::Copy(ty, o, i) => {
                    let (o, i) = match adj.as_deref() {
                        Some(a) => (a.adjust(*o), a.adjust(*i)),
                        None => (*o, *i),
                    };
                    out.push(Gate::copy(*ty, o, i, line));
                }
                GateKind::Add(ty, o, l, r) => {
                    let (o, l, r) = match adj.as_deref() {
                        Some(a) => (a.adjust(*o), a.adjust(*l), a.adjust(*r)),
                        None => (*o, *l, *r),
                    };
                    out.push(Gate::add(*ty, o, l, r, line));
                }
                GateKind::Mul(ty, o, l, r) => {
                    let (o, l, r) = match adj.as_deref() {
                        Some(a) => (a.adjust(*o), a.adjust(*l), a.adjust(*r)),
                        None => (*o, *l, *r),
                    };
                    out.push(Gate::mul(*ty, o, l, r, line));
                }
                GateKind::AddConstant(ty, o, l, v) => {
                    let (o, l) = match adj.as_deref() {
                        Some(a) => (a.adjust(*o), a.adjust(*l)),
                        None => (*o, *l),
                    };
                    out.push(Gate::addc(*ty, o, l, (**v).clone(), line));
                }
                GateKind::MulConstant(ty, o, l, v) => {
                    let (o, l) = match adj.as_deref() {
                        Some(a) => (a.adjust(*o), a.adjust(*l)),
                        None => (*o, *l),
                    };
                    out.push(Gate::mulc(*ty, o, l, (**v).clone(), line));
                }
                GateKind::CopyMulti(g) => match adj.as_deref() {
                    Some(a) => {
                        let mut inputs = Vec::new();
                        for r in g.inputs.iter() {
                            inputs.extend(a.adjust_range(*r));
                        }
                        let outs = a.adjust_range(g.output);
                        ensure!(
                            outs.len() == 1,
                            "line {line}: copy output range straddles the scope boundary"
                        );
                        out.push(Gate::new(
                            GateKind::CopyMulti(Box::new(crate::circuit_ir::CopyMultiGate {
                                type_id: g.type_id,
                                output: outs[0],
                                inputs,
                            })),
                            line,
                        ));
                    }
                    None => out.push(gate.clone()),
                },
                GateKind::New(ty, f, l) => {
                    let (f, l) = match adj.as_deref() {
                        Some(a) => (a.adjust(*f), a.adjust(*l)),
                        None => (*f, *l),
                    };
                    out.push(Gate::new_range(*ty, f, l, line));
                }
                GateKind::Delete(ty, f, l) => {
                    let (f, l) = match adj.as_deref() {
                        Some(a) => (a.adjust(*f), a.adjust(*l)),
                        None => (*f, *l),
                    };
                    out.push(Gate::delete_range(*ty, f, l, line));
                }

                GateKind::AssertZero(ty, w) => match adj.as_deref() {
                    Some(a) => {
                        // Inactive cases must not be able to fail.
                        out.push(Gate::mul(*ty, eph, a.selector(), a.adjust(*w), line));
                        out.push(Gate::assert_zero(*ty, eph, line));
                        eph += 1;
                    }
                    None => out.push(gate.clone()),
                },

                GateKind::PublicIn(ty, w) => match adj.as_deref_mut() {
                    Some(a) => {
                        let src = a.next_instance();
                        out.push(Gate::copy(*ty, a.adjust(*w), src, line));
                    }
                    None => out.push(gate.clone()),
                },
                GateKind::PrivateIn(ty, w) => match adj.as_deref_mut() {
                    Some(a) => {
                        let src = a.next_witness();
                        out.push(Gate::copy(*ty, a.adjust(*w), src, line));
                    }
                    None => out.push(gate.clone()),
                },
                GateKind::PublicInMulti(ty, range) | GateKind::PrivateInMulti(ty, range) => {
                    let public = matches!(gate.kind, GateKind::PublicInMulti(..));
                    match adj.as_deref_mut() {
                        Some(a) => {
                            let span = range.1 - range.0 + 1;
                            let first = if public {
                                a.next_instance()
                            } else {
                                a.next_witness()
                            };
                            for _ in 1..span {
                                if public {
                                    a.next_instance();
                                } else {
                                    a.next_witness();
                                }
                            }
                            let outs = a.adjust_range(*range);
                            ensure!(
                                outs.len() == 1,
                                "line {line}: input range straddles the scope boundary"
                            );
                            out.push(Gate::new(
                                GateKind::CopyMulti(Box::new(
                                    crate::circuit_ir::CopyMultiGate {
                                        type_id: *ty,
                                        output: outs[0],
                                        inputs: vec![(first, first + span - 1)],
                                    },
                                )),
                                line,
                            ));
                        }
                        None => out.push(gate.clone()),
                    }
                }

                GateKind::Conv(_) => match adj.as_deref() {
                    Some(_) => bail!(
                        "line {line}: cannot lower a switch whose case converts between types"
                    ),
                    None => out.push(gate.clone()),
                },

                GateKind::Call(call) => match adj.as_deref_mut() {
                    Some(a) => {
                        let (name, outs, ins) = call.as_ref();
                        let func = self.lookup(name, line)?;
                        let sig = func.sig().clone();
                        let body = match func.body() {
                            crate::circuit_ir::FunctionBody::Gates(g) => g.clone(),
                            crate::circuit_ir::FunctionBody::Plugin(_) => bail!(
                                "line {line}: cannot lower a switch calling a plugin function"
                            ),
                        };
                        let mut new_outs = Vec::new();
                        for r in outs.iter() {
                            new_outs.extend(a.adjust_range(*r));
                        }
                        let mut new_ins = Vec::new();
                        for r in ins.iter() {
                            new_ins.extend(a.adjust_range(*r));
                        }
                        new_ins.push((a.selector(), a.selector()));
                        let callee_ty = single_type(&sig, line)?;
                        for (t, c) in
                            sig.public_counts.iter().chain(sig.private_counts.iter())
                        {
                            ensure!(
                                *t == callee_ty || *c == 0,
                                "line {line}: called function consumes cross-type stream values"
                            );
                        }
                        let n_pub = count_total(&sig.public_counts);
                        let n_prv = count_total(&sig.private_counts);
                        if n_pub > 0 {
                            let first = a.next_instance();
                            for _ in 1..n_pub {
                                a.next_instance();
                            }
                            new_ins.push((first, first + n_pub - 1));
                        }
                        if n_prv > 0 {
                            let first = a.next_witness();
                            for _ in 1..n_prv {
                                a.next_witness();
                            }
                            new_ins.push((first, first + n_prv - 1));
                        }

                        let mut sub = Adjuster::new(
                            count_total(&sig.outputs),
                            count_total(&sig.inputs),
                            n_pub,
                            n_prv,
                        );
                        let mut sub_bounds = IterBoundsStack::new();
                        let body = self.transform(&body, &mut sub_bounds, Some(&mut sub))?;
                        out.push(Gate::new(
                            GateKind::AnonCall(Box::new(AnonCallGate {
                                type_id: single_type(&sig, line)?,
                                outputs: new_outs,
                                inputs: new_ins,
                                public_counts: vec![],
                                private_counts: vec![],
                                body,
                            })),
                            line,
                        ));
                    }
                    None => out.push(gate.clone()),
                },

                GateKind::AnonCall(anon) => match adj.as_deref_mut() {
                    Some(a) => {
                        let mut new_outs = Vec::new();
                        for r in anon.outputs.iter() {
                            new_outs.extend(a.adjust_range(*r));
                        }
                        let mut new_ins = Vec::new();
                        for r in anon.inputs.iter() {
                            new_ins.extend(a.adjust_range(*r));
                        }
                        new_ins.push((a.selector(), a.selector()));
                        let n_pub = count_total(&anon.public_counts);
                        let n_prv = count_total(&anon.private_counts);
                        if n_pub > 0 {
                            let first = a.next_instance();
                            for _ in 1..n_pub {
                                a.next_instance();
                            }
                            new_ins.push((first, first + n_pub - 1));
                        }
                        if n_prv > 0 {
                            let first = a.next_witness();
                            for _ in 1..n_prv {
                                a.next_witness();
                            }
                            new_ins.push((first, first + n_prv - 1));
                        }
                        let out_span: WireCount =
                            anon.outputs.iter().map(|&(f, l)| l - f + 1).sum();
                        let in_span: WireCount =
                            anon.inputs.iter().map(|&(f, l)| l - f + 1).sum();
                        let mut sub = Adjuster::new(out_span, in_span, n_pub, n_prv);
                        let body = self.transform(&anon.body, bounds, Some(&mut sub))?;
                        out.push(Gate::new(
                            GateKind::AnonCall(Box::new(AnonCallGate {
                                type_id: anon.type_id,
                                outputs: new_outs,
                                inputs: new_ins,
                                public_counts: vec![],
                                private_counts: vec![],
                                body,
                            })),
                            line,
                        ));
                    }
                    None => {
                        let body = self.transform(&anon.body, bounds, None)?;
                        out.push(Gate::new(
                            GateKind::AnonCall(Box::new(AnonCallGate {
                                type_id: anon.type_id,
                                outputs: anon.outputs.clone(),
                                inputs: anon.inputs.clone(),
                                public_counts: anon.public_counts.clone(),
                                private_counts: anon.private_counts.clone(),
                                body,
                            })),
                            line,
                        ));
                    }
                },

                GateKind::For(fl) => match adj.as_deref_mut() {
                    Some(a) => self.adjust_for_loop(fl, line, a, bounds, &mut out)?,
                    None => {
                        let body = match &fl.body {
                            LoopBody::Invoke { .. } => fl.body.clone(),
                            LoopBody::Anon {
                                outputs,
                                inputs,
                                public_counts,
                                private_counts,
                                body,
                            } => {
                                bounds.push(fl.iterator.clone(), fl.first, fl.last);
                                let body = self.transform(body, bounds, None)?;
                                bounds.pop();
                                LoopBody::Anon {
                                    outputs: outputs.clone(),
                                    inputs: inputs.clone(),
                                    public_counts: public_counts.clone(),
                                    private_counts: private_counts.clone(),
                                    body,
                                }
                            }
                        };
                        out.push(Gate::new(
                            GateKind::For(Box::new(ForLoopGate {
                                type_id: fl.type_id,
                                iterator: fl.iterator.clone(),
                                first: fl.first,
                                last: fl.last,
                                outputs: fl.outputs.clone(),
                                body,
                            })),
                            line,
                        ));
                    }
                },

                GateKind::Switch(sw) => {
                    self.lower_switch(sw, line, &mut eph, bounds, adj.as_deref_mut(), &mut out)?;
                }
            }
        }

        Ok(out)
    }

    /// A for-loop inside a hoisted case body: every wire expression
    /// must stay entirely on one side of the io/local boundary, locals
    /// are shifted, and the selector and per-iteration stream slices
    /// are threaded in as extra inputs.
    fn adjust_for_loop(
        &self,
        fl: &ForLoopGate,
        line: LineNo,
        adj: &mut Adjuster,
        bounds: &mut IterBoundsStack,
        out: &mut Vec<Gate>,
    ) -> Result<()> {
        let n_iters = fl
            .last
            .checked_sub(fl.first)
            .and_then(|d| d.checked_add(1))
            .ok_or_else(|| eyre::eyre!("line {line}: loop bounds are inverted"))?;

        // The loop's declared output list is concrete and adjusts like
        // any range.
        let mut loop_outputs = Vec::new();
        for r in fl.outputs.iter() {
            loop_outputs.extend(adj.adjust_range(*r));
        }

        let (body_outputs, body_inputs, n_pub, n_prv, raw_body, body_type) = match &fl.body {
            LoopBody::Invoke {
                name,
                outputs,
                inputs,
            } => {
                let func = self.lookup(name, line)?;
                let sig = func.sig();
                let body = match func.body() {
                    crate::circuit_ir::FunctionBody::Gates(g) => g.clone(),
                    crate::circuit_ir::FunctionBody::Plugin(_) => bail!(
                        "line {line}: cannot lower a switch whose loop invokes a plugin"
                    ),
                };
                for (t, c) in sig.public_counts.iter().chain(sig.private_counts.iter()) {
                    ensure!(
                        *t == fl.type_id || *c == 0,
                        "line {line}: loop body consumes cross-type stream values"
                    );
                }
                (
                    outputs.clone(),
                    inputs.clone(),
                    crate::circuit_ir::count_for(&sig.public_counts, fl.type_id),
                    crate::circuit_ir::count_for(&sig.private_counts, fl.type_id),
                    body,
                    single_type(sig, line)?,
                )
            }
            LoopBody::Anon {
                outputs,
                inputs,
                public_counts,
                private_counts,
                body,
            } => {
                for (t, c) in public_counts.iter().chain(private_counts.iter()) {
                    ensure!(
                        *t == fl.type_id || *c == 0,
                        "line {line}: loop body consumes cross-type stream values"
                    );
                }
                (
                    outputs.clone(),
                    inputs.clone(),
                    crate::circuit_ir::count_for(public_counts, fl.type_id),
                    crate::circuit_ir::count_for(private_counts, fl.type_id),
                    body.clone(),
                    fl.type_id,
                )
            }
        };

        bounds.push(fl.iterator.clone(), fl.first, fl.last);
        let shifted = |range: &IterRange, bounds: &IterBoundsStack| -> Result<IterRange> {
            match bounds.range_side(&range.first, &range.last, adj.io_end())? {
                RangeSide::Below => Ok(range.clone()),
                RangeSide::AtOrAbove => Ok(IterRange {
                    first: IterExpr::add(range.first.clone(), IterExpr::lit(adj.shift())),
                    last: IterExpr::add(range.last.clone(), IterExpr::lit(adj.shift())),
                }),
            }
        };

        let mut new_outputs = Vec::new();
        let mut out_span = 0u64;
        for range in body_outputs.iter() {
            out_span += range_span(range, bounds, line)?;
            new_outputs.push(shifted(range, bounds)?);
        }
        let mut new_inputs = Vec::new();
        let mut in_span = 0u64;
        for range in body_inputs.iter() {
            in_span += range_span(range, bounds, line)?;
            new_inputs.push(shifted(range, bounds)?);
        }

        // Selector bit, then this iteration's slices of the ephemeral
        // stream blocks.
        new_inputs.push(IterRange::single(IterExpr::lit(adj.selector())));
        let iter_offset = |per: u64, base: WireId| -> IterRange {
            let first = IterExpr::add(
                IterExpr::lit(base),
                IterExpr::mul(
                    IterExpr::sub(IterExpr::name(&fl.iterator), IterExpr::lit(fl.first)),
                    IterExpr::lit(per),
                ),
            );
            let last = IterExpr::add(first.clone(), IterExpr::lit(per - 1));
            IterRange { first, last }
        };
        if n_pub > 0 {
            let base = adj.next_instance();
            for _ in 1..n_pub * n_iters {
                adj.next_instance();
            }
            new_inputs.push(iter_offset(n_pub, base));
        }
        if n_prv > 0 {
            let base = adj.next_witness();
            for _ in 1..n_prv * n_iters {
                adj.next_witness();
            }
            new_inputs.push(iter_offset(n_prv, base));
        }

        let mut sub = Adjuster::new(out_span, in_span, n_pub, n_prv);
        let body = self.transform(&raw_body, bounds, Some(&mut sub))?;
        bounds.pop();

        debug_assert_eq!(body_type, fl.type_id);
        out.push(Gate::new(
            GateKind::For(Box::new(ForLoopGate {
                type_id: fl.type_id,
                iterator: fl.iterator.clone(),
                first: fl.first,
                last: fl.last,
                outputs: loop_outputs,
                body: LoopBody::Anon {
                    outputs: new_outputs,
                    inputs: new_inputs,
                    public_counts: vec![],
                    private_counts: vec![],
                    body,
                },
            })),
            line,
        ));
        Ok(())
    }

    /// Lower one switch statement in place.
    #[allow(clippy::too_many_arguments)]
    fn lower_switch(
        &self,
        sw: &SwitchGate,
        line: LineNo,
        eph: &mut WireId,
        bounds: &mut IterBoundsStack,
        mut adj: Option<&mut Adjuster>,
        out: &mut Vec<Gate>,
    ) -> Result<()> {
        let ty = sw.type_id;
        let (prime, boolean) = self.field_of(ty)?;
        ensure!(!sw.cases.is_empty(), "line {line}: switch has no cases");
        let cond = match adj.as_deref() {
            Some(a) => a.adjust(sw.condition),
            None => sw.condition,
        };

        // A single-case switch is an equality assertion plus the body
        // run unconditionally.
        if sw.cases.len() == 1 {
            let (m, case) = &sw.cases[0];
            let inverse = (m * (&prime - 1u8)) % &prime;
            out.push(Gate::addc(ty, *eph, cond, inverse, line));
            match adj.as_deref() {
                Some(a) => {
                    out.push(Gate::mul(ty, *eph + 1, a.selector(), *eph, line));
                    out.push(Gate::assert_zero(ty, *eph + 1, line));
                    *eph += 2;
                }
                None => {
                    out.push(Gate::assert_zero(ty, *eph, line));
                    *eph += 1;
                }
            }
            let single_case_gates = self.case_as_directive(sw, case, line, bounds, adj)?;
            out.extend(single_case_gates);
            return Ok(());
        }

        if boolean {
            ensure!(
                sw.cases.len() == 2,
                "line {line}: a boolean switch admits at most two distinct cases"
            );
        }

        let num_outputs: WireCount = sw.outputs.iter().map(|&(f, l)| l - f + 1).sum();

        // 1. Ingest the per-case stream maxima once.
        let mut max_pub = 0u64;
        let mut max_prv = 0u64;
        for (_, case) in sw.cases.iter() {
            let (p, v) = self.case_stream_counts(case, ty, line)?;
            max_pub = max_pub.max(p);
            max_prv = max_prv.max(v);
        }
        let ins_first = *eph;
        match adj.as_deref_mut() {
            Some(a) => {
                for k in 0..max_pub {
                    let src = a.next_instance();
                    out.push(Gate::copy(ty, ins_first + k, src, line));
                }
                *eph += max_pub;
            }
            None => {
                self.emit_ingest(ty, max_pub, true, eph, line, out);
            }
        }
        let wit_first = *eph;
        match adj.as_deref_mut() {
            Some(a) => {
                for k in 0..max_prv {
                    let src = a.next_witness();
                    out.push(Gate::copy(ty, wit_first + k, src, line));
                }
                *eph += max_prv;
            }
            None => {
                self.emit_ingest(ty, max_prv, false, eph, line, out);
            }
        }

        // 2. Selector bits, one per case.
        let first_selector = if boolean {
            let first_selector = *eph;
            for (m, _) in sw.cases.iter() {
                if m.is_zero() {
                    out.push(Gate::addc(ty, *eph, cond, Number::one(), line));
                } else {
                    out.push(Gate::copy(ty, *eph, cond, line));
                }
                *eph += 1;
            }
            first_selector
        } else {
            let first_case = *eph;
            for (m, _) in sw.cases.iter() {
                out.push(Gate::constant(
                    ty,
                    *eph,
                    (m * (&prime - 1u8)) % &prime,
                    line,
                ));
                *eph += 1;
            }
            let raw_selector = *eph;
            *eph += sw.cases.len() as u64;
            out.push(Gate::new(
                GateKind::For(Box::new(ForLoopGate {
                    type_id: ty,
                    iterator: MUX_ITER.to_string(),
                    first: 0,
                    last: sw.cases.len() as u64 - 1,
                    outputs: vec![(raw_selector, raw_selector + sw.cases.len() as u64 - 1)],
                    body: LoopBody::Invoke {
                        name: checker_name(ty),
                        outputs: vec![IterRange::single(IterExpr::add(
                            IterExpr::lit(raw_selector),
                            IterExpr::name(MUX_ITER),
                        ))],
                        inputs: vec![
                            IterRange::single(IterExpr::add(
                                IterExpr::lit(first_case),
                                IterExpr::name(MUX_ITER),
                            )),
                            IterRange::single(IterExpr::lit(cond)),
                        ],
                    },
                })),
                line,
            ));
            raw_selector
        };

        // A nested switch multiplies its selectors with the enclosing
        // one.
        let first_selector = match adj.as_deref() {
            Some(a) => {
                let actual = *eph;
                for j in 0..sw.cases.len() as u64 {
                    out.push(Gate::mul(
                        ty,
                        actual + j,
                        first_selector + j,
                        a.selector(),
                        line,
                    ));
                }
                *eph += sw.cases.len() as u64;
                actual
            }
            None => first_selector,
        };

        // 3. Every case writes a dense block of dummy outputs.
        let first_output = *eph;
        *eph += sw.cases.len() as u64 * num_outputs;
        for (j, (_, case)) in sw.cases.iter().enumerate() {
            let outputs = if num_outputs == 0 {
                vec![]
            } else {
                vec![(
                    first_output + j as u64 * num_outputs,
                    first_output + (j as u64 + 1) * num_outputs - 1,
                )]
            };
            let (case_inputs, raw_body, in_span) =
                self.case_parts(case, num_outputs, ty, line)?;
            let (n_pub, n_prv) = self.case_stream_counts(case, ty, line)?;

            let mut inputs = Vec::new();
            for r in case_inputs.iter() {
                match adj.as_deref() {
                    Some(a) => inputs.extend(a.adjust_range(*r)),
                    None => inputs.push(*r),
                }
            }
            inputs.push((first_selector + j as u64, first_selector + j as u64));
            if n_pub > 0 {
                inputs.push((ins_first, ins_first + n_pub - 1));
            }
            if n_prv > 0 {
                inputs.push((wit_first, wit_first + n_prv - 1));
            }

            let mut sub = Adjuster::new(num_outputs, in_span, n_pub, n_prv);
            let mut sub_bounds = IterBoundsStack::new();
            let body = self.transform(raw_body, &mut sub_bounds, Some(&mut sub))?;

            out.push(Gate::new(
                GateKind::AnonCall(Box::new(AnonCallGate {
                    type_id: ty,
                    outputs,
                    inputs,
                    public_counts: vec![],
                    private_counts: vec![],
                    body,
                })),
                line,
            ));
        }

        // 4. Assert exactly one selector fired, then multiplex.
        self.mux_finish(
            sw,
            ty,
            &prime,
            boolean,
            first_selector,
            first_output,
            num_outputs,
            adj.as_deref(),
            eph,
            line,
            out,
        );
        debug!(
            "lowered switch at line {line}: {} cases, {} outputs",
            sw.cases.len(),
            num_outputs
        );
        Ok(())
    }

    /// Run a single-case switch body directly against the switch's own
    /// outputs.
    fn case_as_directive(
        &self,
        sw: &SwitchGate,
        case: &CaseBody,
        line: LineNo,
        bounds: &mut IterBoundsStack,
        adj: Option<&mut Adjuster>,
    ) -> Result<Vec<Gate>> {
        let gate = match case {
            CaseBody::Invoke { name, inputs } => Gate::new(
                GateKind::Call(Box::new((
                    name.clone(),
                    sw.outputs.clone(),
                    inputs.clone(),
                ))),
                line,
            ),
            CaseBody::Anon {
                inputs,
                public_counts,
                private_counts,
                body,
            } => Gate::new(
                GateKind::AnonCall(Box::new(AnonCallGate {
                    type_id: sw.type_id,
                    outputs: sw.outputs.clone(),
                    inputs: inputs.clone(),
                    public_counts: public_counts.clone(),
                    private_counts: private_counts.clone(),
                    body: body.clone(),
                })),
                line,
            ),
        };
        self.transform(std::slice::from_ref(&gate), bounds, adj)
    }

    /// Ingest `count` stream values into ephemeral wires, with a loop
    /// once the count warrants one.
    fn emit_ingest(
        &self,
        ty: TypeId,
        count: u64,
        public: bool,
        eph: &mut WireId,
        line: LineNo,
        out: &mut Vec<Gate>,
    ) {
        if count == 0 {
            return;
        }
        let first = *eph;
        *eph += count;
        if count == 1 {
            out.push(if public {
                Gate::public_in(ty, first, line)
            } else {
                Gate::private_in(ty, first, line)
            });
            return;
        }
        let (public_counts, private_counts, body_gate) = if public {
            (vec![(ty, 1)], vec![], Gate::public_in(ty, 0, line))
        } else {
            (vec![], vec![(ty, 1)], Gate::private_in(ty, 0, line))
        };
        out.push(Gate::new(
            GateKind::For(Box::new(ForLoopGate {
                type_id: ty,
                iterator: MUX_ITER.to_string(),
                first,
                last: first + count - 1,
                outputs: vec![(first, first + count - 1)],
                body: LoopBody::Anon {
                    outputs: vec![IterRange::single(IterExpr::name(MUX_ITER))],
                    inputs: vec![],
                    public_counts,
                    private_counts,
                    body: vec![body_gate],
                },
            })),
            line,
        ));
    }

    /// Assert selector coverage and sum the dummy outputs into the real
    /// ones, keeping emitted code size sub-linear in
    /// `num_outputs * cases` via loops.
    #[allow(clippy::too_many_arguments)]
    fn mux_finish(
        &self,
        sw: &SwitchGate,
        ty: TypeId,
        prime: &Number,
        boolean: bool,
        first_selector: WireId,
        first_output: WireId,
        num_outputs: WireCount,
        adj: Option<&Adjuster>,
        eph: &mut WireId,
        line: LineNo,
        out: &mut Vec<Gate>,
    ) {
        let n = sw.cases.len() as u64;

        // Selector coverage. Boolean two-case switches cover the field
        // by construction, so only field switches assert it.
        if !boolean {
            out.push(Gate::add(
                ty,
                *eph,
                first_selector,
                first_selector + 1,
                line,
            ));
            *eph += 1;
            if n == 3 {
                out.push(Gate::add(ty, *eph, *eph - 1, first_selector + 2, line));
                *eph += 1;
            } else if n > 3 {
                let n_iters = n - 3;
                let base = *eph;
                out.push(Gate::new(
                    GateKind::For(Box::new(ForLoopGate {
                        type_id: ty,
                        iterator: MUX_ITER.to_string(),
                        first: 0,
                        last: n_iters,
                        outputs: vec![(base, base + n_iters)],
                        body: LoopBody::Anon {
                            outputs: vec![IterRange::single(IterExpr::add(
                                IterExpr::lit(base),
                                IterExpr::name(MUX_ITER),
                            ))],
                            inputs: vec![
                                IterRange::single(IterExpr::add(
                                    IterExpr::lit(base - 1),
                                    IterExpr::name(MUX_ITER),
                                )),
                                IterRange::single(IterExpr::add(
                                    IterExpr::lit(first_selector + 2),
                                    IterExpr::name(MUX_ITER),
                                )),
                            ],
                            public_counts: vec![],
                            private_counts: vec![],
                            body: vec![Gate::add(ty, 0, 1, 2, line)],
                        },
                    })),
                    line,
                ));
                *eph += n_iters + 1;
            }
            out.push(Gate::addc(ty, *eph, *eph - 1, prime - 1u8, line));
            *eph += 1;
            match adj {
                Some(a) => {
                    out.push(Gate::mul(ty, *eph, *eph - 1, a.selector(), line));
                    out.push(Gate::assert_zero(ty, *eph, line));
                    *eph += 1;
                }
                None => {
                    out.push(Gate::assert_zero(ty, *eph - 1, line));
                }
            }
        }

        if num_outputs == 0 {
            return;
        }

        // Weighted sums. The first two cases combine into an ephemeral
        // block (or straight into the outputs when there are only two
        // cases); each further case folds in with another block, the
        // last one landing on the real output list.
        let adjusted_outputs: Vec<WireRange> = match adj {
            Some(a) => sw
                .outputs
                .iter()
                .flat_map(|&r| a.adjust_range(r))
                .collect(),
            None => sw.outputs.clone(),
        };

        // In boolean rings mul and add are and and xor; the pairing
        // body reads the same either way.
        let pair_body = |l: LineNo| -> Vec<Gate> {
            vec![
                Gate::mul(ty, 5, 1, 3, l),
                Gate::mul(ty, 6, 2, 4, l),
                Gate::add(ty, 0, 5, 6, l),
            ]
        };
        let fold_body = |l: LineNo| -> Vec<Gate> {
            vec![Gate::mul(ty, 4, 1, 3, l), Gate::add(ty, 0, 4, 2, l)]
        };

        // Sum the first two cases.
        let emit_pair = |dest: &[WireRange], eph: &mut WireId, out: &mut Vec<Gate>| {
            let mut place = 0u64;
            for &(df, dl) in dest.iter() {
                let span = dl - df + 1;
                if span == 1 {
                    out.push(Gate::mul(ty, *eph, first_output + place, first_selector, line));
                    out.push(Gate::mul(
                        ty,
                        *eph + 1,
                        first_output + num_outputs + place,
                        first_selector + 1,
                        line,
                    ));
                    out.push(Gate::add(ty, df, *eph, *eph + 1, line));
                    *eph += 2;
                } else {
                    out.push(Gate::new(
                        GateKind::For(Box::new(ForLoopGate {
                            type_id: ty,
                            iterator: MUX_ITER.to_string(),
                            first: 0,
                            last: span - 1,
                            outputs: vec![(df, dl)],
                            body: LoopBody::Anon {
                                outputs: vec![IterRange::single(IterExpr::add(
                                    IterExpr::lit(df),
                                    IterExpr::name(MUX_ITER),
                                ))],
                                inputs: vec![
                                    IterRange::single(IterExpr::add(
                                        IterExpr::lit(first_output + place),
                                        IterExpr::name(MUX_ITER),
                                    )),
                                    IterRange::single(IterExpr::add(
                                        IterExpr::lit(first_output + num_outputs + place),
                                        IterExpr::name(MUX_ITER),
                                    )),
                                    IterRange::single(IterExpr::lit(first_selector)),
                                    IterRange::single(IterExpr::lit(first_selector + 1)),
                                ],
                                public_counts: vec![],
                                private_counts: vec![],
                                body: pair_body(line),
                            },
                        })),
                        line,
                    ));
                }
                place += span;
            }
        };

        if n == 2 {
            emit_pair(&adjusted_outputs, eph, out);
            return;
        }

        // More than two cases: accumulate through ephemeral blocks.
        let mut prev = *eph;
        *eph += num_outputs;
        emit_pair(&[(prev, prev + num_outputs - 1)], eph, out);

        for k in 2..n {
            let dummy_k = first_output + k * num_outputs;
            let sel_k = first_selector + k;
            let last_case = k == n - 1;
            let dests: Vec<WireRange> = if last_case {
                adjusted_outputs.clone()
            } else {
                let block = *eph;
                *eph += num_outputs;
                vec![(block, block + num_outputs - 1)]
            };
            let mut place = 0u64;
            for &(df, dl) in dests.iter() {
                let span = dl - df + 1;
                if span == 1 {
                    out.push(Gate::mul(ty, *eph, dummy_k + place, sel_k, line));
                    out.push(Gate::add(ty, df, *eph, prev + place, line));
                    *eph += 1;
                } else {
                    out.push(Gate::new(
                        GateKind::For(Box::new(ForLoopGate {
                            type_id: ty,
                            iterator: MUX_ITER.to_string(),
                            first: 0,
                            last: span - 1,
                            outputs: vec![(df, dl)],
                            body: LoopBody::Anon {
                                outputs: vec![IterRange::single(IterExpr::add(
                                    IterExpr::lit(df),
                                    IterExpr::name(MUX_ITER),
                                ))],
                                inputs: vec![
                                    IterRange::single(IterExpr::add(
                                        IterExpr::lit(dummy_k + place),
                                        IterExpr::name(MUX_ITER),
                                    )),
                                    IterRange::single(IterExpr::add(
                                        IterExpr::lit(prev + place),
                                        IterExpr::name(MUX_ITER),
                                    )),
                                    IterRange::single(IterExpr::lit(sel_k)),
                                ],
                                public_counts: vec![],
                                private_counts: vec![],
                                body: fold_body(line),
                            },
                        })),
                        line,
                    ));
                }
                place += span;
            }
            if !last_case {
                prev = dests[0].0;
            }
        }
    }
}

/// The single wire type a signature uses; lowering emits single-type
/// anonymous calls and cannot thread a multi-type signature through
/// them.
fn single_type(sig: &FunctionSignature, line: LineNo) -> Result<TypeId> {
    let mut ty = None;
    for &(t, _) in sig.outputs.iter().chain(sig.inputs.iter()) {
        match ty {
            None => ty = Some(t),
            Some(prev) => ensure!(
                prev == t,
                "line {line}: function \"{}\" spans wire types {prev} and {t}",
                sig.name
            ),
        }
    }
    Ok(ty.unwrap_or(0))
}

/// Span of an iteration range, probed at the box corners and required
/// constant.
fn range_span(range: &IterRange, bounds: &IterBoundsStack, line: LineNo) -> Result<u64> {
    // Evaluate at the all-firsts corner to learn the candidate span,
    // then let the corner sweep verify it holds everywhere.
    let mut iters = crate::iterexpr::IterMap::default();
    for (name, first) in bounds.names_firsts() {
        iters.insert(name, first);
    }
    let f = range
        .first
        .eval_checked(&iters)
        .map_err(|e| eyre::eyre!("line {line}: {e}"))?;
    let l = range
        .last
        .eval_checked(&iters)
        .map_err(|e| eyre::eyre!("line {line}: {e}"))?;
    ensure!(f <= l, "line {line}: iteration range is inverted");
    let span = l - f + 1;
    bounds
        .eval_corners(&range.first, &range.last, span)
        .map_err(|e| eyre::eyre!("line {line}: {e}"))?;
    Ok(span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_ir::{ConversionSpec, Version};
    use crate::error::{ErrorKind, EvalError};
    use crate::interp::{evaluate, InterpOptions};
    use crate::stream::CircuitInputs;

    const FF0: TypeId = 0;

    fn n(v: u64) -> Number {
        Number::from(v)
    }

    fn tree_of(fields: Vec<Number>, functions: Vec<FuncDecl>, gates: Vec<Gate>) -> IRTree {
        IRTree {
            version: Version::new(2, 1, 0),
            plugins: vec![],
            types: TypeStore::try_from(fields).unwrap(),
            conversions: Vec::<ConversionSpec>::new(),
            functions,
            gates,
        }
    }

    fn eval_tree(tree: &IRTree, ins: Vec<Vec<u64>>, wit: Vec<Vec<u64>>) -> Result<()> {
        let mut inputs = CircuitInputs::default();
        for (id, values) in ins.into_iter().enumerate() {
            inputs.ingest_publics(id, values.into_iter().map(Number::from).collect());
        }
        for (id, values) in wit.into_iter().enumerate() {
            inputs.ingest_privates(id, values.into_iter().map(Number::from).collect());
        }
        evaluate(tree, &mut inputs, InterpOptions::default()).map(|_| ())
    }

    fn assert_no_switches(gates: &[Gate]) {
        for gate in gates.iter() {
            match &gate.kind {
                GateKind::Switch(_) => panic!("switch survived lowering"),
                GateKind::AnonCall(anon) => assert_no_switches(&anon.body),
                GateKind::For(fl) => {
                    if let LoopBody::Anon { body, .. } = &fl.body {
                        assert_no_switches(body);
                    }
                }
                _ => {}
            }
        }
    }

    fn assert_switch_free(tree: &IRTree) {
        assert_no_switches(&tree.gates);
        for func in tree.functions.iter() {
            if let crate::circuit_ir::FunctionBody::Gates(gates) = func.body() {
                assert_no_switches(gates);
            }
        }
    }

    /// A four-case switch over prime 101 with two outputs, gated
    /// asserts, and one case drawing a private value.
    fn four_case_tree() -> IRTree {
        let case0 = CaseBody::Anon {
            inputs: vec![(1, 1)],
            public_counts: vec![],
            private_counts: vec![],
            body: vec![
                Gate::copy(FF0, 0, 2, 31),
                Gate::addc(FF0, 1, 2, n(1), 32),
                Gate::addc(FF0, 3, 2, n(91), 33),
                Gate::assert_zero(FF0, 3, 34),
            ],
        };
        let case1 = CaseBody::Anon {
            inputs: vec![(2, 2)],
            public_counts: vec![],
            private_counts: vec![],
            body: vec![
                Gate::addc(FF0, 0, 2, n(1), 41),
                Gate::copy(FF0, 1, 2, 42),
                Gate::addc(FF0, 3, 2, n(81), 43),
                Gate::assert_zero(FF0, 3, 44),
            ],
        };
        let case2 = CaseBody::Anon {
            inputs: vec![(1, 1), (2, 2)],
            public_counts: vec![],
            private_counts: vec![(FF0, 1)],
            body: vec![
                Gate::add(FF0, 0, 2, 3, 51),
                Gate::constant(FF0, 1, n(7), 52),
                Gate::private_in(FF0, 4, 53),
                Gate::mulc(FF0, 5, 4, n(0), 54),
                Gate::assert_zero(FF0, 5, 55),
            ],
        };
        let case3 = CaseBody::Anon {
            inputs: vec![(1, 1)],
            public_counts: vec![],
            private_counts: vec![],
            body: vec![Gate::copy(FF0, 0, 2, 61), Gate::copy(FF0, 1, 2, 62)],
        };
        let gates = vec![
            Gate::private_in(FF0, 0, 1),
            Gate::constant(FF0, 1, n(10), 2),
            Gate::constant(FF0, 2, n(20), 3),
            Gate::new(
                GateKind::Switch(Box::new(SwitchGate {
                    type_id: FF0,
                    condition: 0,
                    outputs: vec![(3, 4)],
                    cases: vec![
                        (n(0), case0),
                        (n(1), case1),
                        (n(2), case2),
                        (n(3), case3),
                    ],
                })),
                10,
            ),
            // With condition 1 the outputs are 21 and 20.
            Gate::addc(FF0, 5, 3, n(80), 70),
            Gate::assert_zero(FF0, 5, 71),
            Gate::addc(FF0, 6, 4, n(81), 72),
            Gate::assert_zero(FF0, 6, 73),
        ];
        tree_of(vec![n(101)], vec![], gates)
    }

    #[test]
    fn lowering_removes_every_switch() {
        let lowered = lower_switches(&four_case_tree()).unwrap();
        assert_switch_free(&lowered);
        // The Fermat helper was emitted for the field.
        assert!(lowered
            .functions
            .iter()
            .any(|f| f.name() == checker_name(FF0)));
    }

    #[test]
    fn lowering_preserves_success() {
        let tree = four_case_tree();
        let wit = vec![vec![1, 33]];
        eval_tree(&tree, vec![], wit.clone()).unwrap();
        let lowered = lower_switches(&tree).unwrap();
        eval_tree(&lowered, vec![], wit).unwrap();
    }

    #[test]
    fn lowering_preserves_failure() {
        let tree = four_case_tree();
        // Condition 7 matches no case.
        let wit = vec![vec![7, 33]];
        let orig = eval_tree(&tree, vec![], wit.clone()).unwrap_err();
        assert_eq!(
            orig.downcast_ref::<EvalError>().unwrap().kind(),
            ErrorKind::AssertionFailed
        );
        let lowered = lower_switches(&tree).unwrap();
        let low = eval_tree(&lowered, vec![], wit).unwrap_err();
        assert_eq!(
            low.downcast_ref::<EvalError>().unwrap().kind(),
            ErrorKind::AssertionFailed
        );
    }

    #[test]
    fn lowering_is_idempotent() {
        let lowered = lower_switches(&four_case_tree()).unwrap();
        let again = lower_switches(&lowered).unwrap();
        assert_eq!(format!("{lowered:?}"), format!("{again:?}"));
    }

    #[test]
    fn single_case_switch_becomes_equality_assert() {
        let gates = vec![
            Gate::private_in(FF0, 0, 1),
            Gate::new(
                GateKind::Switch(Box::new(SwitchGate {
                    type_id: FF0,
                    condition: 0,
                    outputs: vec![(1, 1)],
                    cases: vec![(
                        n(5),
                        CaseBody::Anon {
                            inputs: vec![],
                            public_counts: vec![],
                            private_counts: vec![],
                            body: vec![Gate::constant(FF0, 0, n(9), 11)],
                        },
                    )],
                })),
                10,
            ),
            Gate::addc(FF0, 2, 1, n(92), 20),
            Gate::assert_zero(FF0, 2, 21),
        ];
        let tree = tree_of(vec![n(101)], vec![], gates);
        let lowered = lower_switches(&tree).unwrap();
        assert_switch_free(&lowered);
        // No helper needed for a single case.
        assert!(lowered.functions.is_empty());

        eval_tree(&lowered, vec![], vec![vec![5]]).unwrap();
        let err = eval_tree(&lowered, vec![], vec![vec![6]]).unwrap_err();
        assert_eq!(
            err.downcast_ref::<EvalError>().unwrap().kind(),
            ErrorKind::AssertionFailed
        );
    }

    #[test]
    fn boolean_switch_lowers_to_not_and_copy() {
        let gates = vec![
            Gate::private_in(FF0, 0, 1),
            Gate::new(
                GateKind::Switch(Box::new(SwitchGate {
                    type_id: FF0,
                    condition: 0,
                    outputs: vec![(1, 1)],
                    cases: vec![
                        (
                            n(1),
                            CaseBody::Anon {
                                inputs: vec![],
                                public_counts: vec![],
                                private_counts: vec![],
                                body: vec![Gate::constant(FF0, 0, n(1), 11)],
                            },
                        ),
                        (
                            n(0),
                            CaseBody::Anon {
                                inputs: vec![],
                                public_counts: vec![],
                                private_counts: vec![],
                                body: vec![Gate::constant(FF0, 0, n(0), 12)],
                            },
                        ),
                    ],
                })),
                10,
            ),
            // Output equals the condition for this pair of cases.
            Gate::add(FF0, 2, 0, 1, 20),
            Gate::assert_zero(FF0, 2, 21),
        ];
        let tree = tree_of(vec![n(2)], vec![], gates);
        let lowered = lower_switches(&tree).unwrap();
        assert_switch_free(&lowered);
        assert!(lowered.functions.is_empty());
        eval_tree(&lowered, vec![], vec![vec![1]]).unwrap();
        eval_tree(&lowered, vec![], vec![vec![0]]).unwrap();
    }

    #[test]
    fn switch_inside_function_body_is_lowered() {
        let sig = crate::circuit_ir::FunctionSignature {
            name: "pick".to_string(),
            outputs: vec![(FF0, 1)],
            inputs: vec![(FF0, 1)],
            public_counts: vec![],
            private_counts: vec![],
            line: 1,
        };
        let body = vec![Gate::new(
            GateKind::Switch(Box::new(SwitchGate {
                type_id: FF0,
                condition: 1,
                outputs: vec![(0, 0)],
                cases: vec![
                    (
                        n(0),
                        CaseBody::Anon {
                            inputs: vec![],
                            public_counts: vec![],
                            private_counts: vec![],
                            body: vec![Gate::constant(FF0, 0, n(3), 11)],
                        },
                    ),
                    (
                        n(1),
                        CaseBody::Anon {
                            inputs: vec![],
                            public_counts: vec![],
                            private_counts: vec![],
                            body: vec![Gate::constant(FF0, 0, n(4), 12)],
                        },
                    ),
                ],
            })),
            10,
        )];
        let pick = FuncDecl::new_function(sig, body);
        let gates = vec![
            Gate::private_in(FF0, 0, 1),
            Gate::call("pick", vec![(1, 1)], vec![(0, 0)], 2),
            // cond 1 selects 4; 4 + 97 = 0 mod 101.
            Gate::addc(FF0, 2, 1, n(97), 3),
            Gate::assert_zero(FF0, 2, 4),
        ];
        let tree = tree_of(vec![n(101)], vec![pick], gates);
        let lowered = lower_switches(&tree).unwrap();
        assert_switch_free(&lowered);
        eval_tree(&lowered, vec![], vec![vec![1]]).unwrap();
    }

    proptest::proptest! {
        #[test]
        fn lowering_agrees_on_random_witnesses(cond in 0u64..6, extra in 0u64..101) {
            let tree = four_case_tree();
            let lowered = lower_switches(&tree).unwrap();
            let wit = vec![vec![cond, extra]];
            let orig = eval_tree(&tree, vec![], wit.clone());
            let low = eval_tree(&lowered, vec![], wit);
            // Equivalence on success; failures (unmatched condition,
            // downstream asserts) line up too.
            proptest::prop_assert_eq!(orig.is_ok(), low.is_ok());
        }
    }

    #[test]
    fn lowered_stream_consumption_matches_original() {
        // Every case sees the buffered maximum regardless of what it
        // declares, so total consumption is identical either way: one
        // condition plus one buffered private value.
        let tree = four_case_tree();
        let lowered = lower_switches(&tree).unwrap();
        // Too few private values fail both ways.
        assert!(eval_tree(&tree, vec![], vec![vec![1]]).is_err());
        assert!(eval_tree(&lowered, vec![], vec![vec![1]]).is_err());
        // Too many fail both ways.
        assert!(eval_tree(&tree, vec![], vec![vec![1, 33, 44]]).is_err());
        assert!(eval_tree(&lowered, vec![], vec![vec![1, 33, 44]]).is_err());
    }
}
