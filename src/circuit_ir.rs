//! This module contains types pertaining to the internal representation
//! of hierarchical circuits.
//!
//! A relation is a list of [`Gate`]s plus a set of named function
//! declarations. Gates cover plain arithmetic, stream ingestion, wire
//! memory management, and the nesting directives: function calls,
//! anonymous calls, for-loops, and switch statements.

use eyre::{ensure, Result};
use log::debug;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::EvalError;
use crate::iterexpr::IterExpr;

/// The wire index.
pub type WireId = u64;
/// A count of the number of wires.
pub type WireCount = u64;
/// The type index.
///
/// This is a value `< 256` that is associated with a specific circuit
/// type declared in the relation header.
pub type TypeId = u8;
/// An inclusive range of [`WireId`]s.
pub type WireRange = (WireId, WireId);
/// A source location, used only for diagnostics.
pub type LineNo = usize;
/// An arbitrary-precision field element or constant.
pub type Number = num_bigint::BigUint;

/// `(type, count)` pairs, as used by function signatures and stream
/// declarations. Order is significant: call arguments are remapped in
/// this order.
pub type CountList = Vec<(TypeId, WireCount)>;

/// Total wire count across a [`CountList`].
pub fn count_total(list: &[(TypeId, WireCount)]) -> WireCount {
    list.iter().map(|(_, c)| c).sum()
}

/// The count declared for `ty` in a [`CountList`], defaulting to zero.
pub fn count_for(list: &[(TypeId, WireCount)], ty: TypeId) -> WireCount {
    list.iter()
        .filter(|(t, _)| *t == ty)
        .map(|(_, c)| c)
        .sum()
}

/// The conversion gate representation. The first [`TypeId`]-[`WireRange`]
/// pairing denotes the _output_ of the conversion, and the second pairing
/// denotes the _input_ of the conversion.
#[derive(Clone, Debug)]
pub struct ConvGate {
    pub out_type: TypeId,
    pub out_range: WireRange,
    pub in_type: TypeId,
    pub in_range: WireRange,
    /// Wrapping (`true`) versus exact (`false`) conversion.
    pub modulus: bool,
}

/// The call gate representation. The [`String`] denotes the function
/// name, the first [`Vec`] denotes the _output_ wire ranges, and the
/// second [`Vec`] denotes the _input_ wire ranges, both in signature
/// order.
pub type CallGate = (String, Vec<WireRange>, Vec<WireRange>);

/// A multi-range copy: concatenate the inputs and copy them into the
/// output range. Lengths must match.
#[derive(Clone, Debug)]
pub struct CopyMultiGate {
    pub type_id: TypeId,
    pub output: WireRange,
    pub inputs: Vec<WireRange>,
}

/// An inclusive wire range written as iteration expressions.
#[derive(Clone, Debug)]
pub struct IterRange {
    pub first: IterExpr,
    pub last: IterExpr,
}

impl IterRange {
    pub fn single(expr: IterExpr) -> Self {
        IterRange {
            first: expr.clone(),
            last: expr,
        }
    }

    pub fn range(first: IterExpr, last: IterExpr) -> Self {
        IterRange { first, last }
    }
}

/// An anonymous call: a nested body with its own wire numbering, wired
/// to the parent through output and input ranges of one type.
#[derive(Clone, Debug)]
pub struct AnonCallGate {
    pub type_id: TypeId,
    pub outputs: Vec<WireRange>,
    pub inputs: Vec<WireRange>,
    pub public_counts: CountList,
    pub private_counts: CountList,
    pub body: Vec<Gate>,
}

/// The body of a for-loop: a named invocation or an inline anonymous
/// function, either way with iteration-expression wire lists.
#[derive(Clone, Debug)]
pub enum LoopBody {
    Invoke {
        name: String,
        outputs: Vec<IterRange>,
        inputs: Vec<IterRange>,
    },
    Anon {
        outputs: Vec<IterRange>,
        inputs: Vec<IterRange>,
        public_counts: CountList,
        private_counts: CountList,
        body: Vec<Gate>,
    },
}

/// A for-loop over an inclusive iterator range. The declared output
/// list is in parent wires and must be covered exactly by the union of
/// per-iteration outputs.
#[derive(Clone, Debug)]
pub struct ForLoopGate {
    pub type_id: TypeId,
    pub iterator: String,
    pub first: u64,
    pub last: u64,
    pub outputs: Vec<WireRange>,
    pub body: LoopBody,
}

/// One switch case body.
#[derive(Clone, Debug)]
pub enum CaseBody {
    Invoke {
        name: String,
        inputs: Vec<WireRange>,
    },
    Anon {
        inputs: Vec<WireRange>,
        public_counts: CountList,
        private_counts: CountList,
        body: Vec<Gate>,
    },
}

/// A switch statement: a condition wire, distinct case match values,
/// and an output list every case assigns obliviously.
#[derive(Clone, Debug)]
pub struct SwitchGate {
    pub type_id: TypeId,
    pub condition: WireId,
    pub outputs: Vec<WireRange>,
    pub cases: Vec<(Number, CaseBody)>,
}

/// The gate and directive taxonomy.
///
/// Most gates take a [`TypeId`] as their first argument, which denotes
/// the circuit type associated with the given gate. The [`WireId`]
/// ordering is generally `<out> <in> ...`; that is, the first [`WireId`]
/// denotes the _output_ of the gate. Large payloads are boxed to keep
/// the enum small.
#[derive(Clone, Debug)]
pub enum GateKind {
    /// Store the given constant in [`WireId`]; the constant must be a
    /// field member.
    Constant(TypeId, WireId, Box<Number>),
    /// Check that the element in [`WireId`] is zero; on mismatch the
    /// proof fails.
    AssertZero(TypeId, WireId),
    Copy(TypeId, WireId, WireId),
    CopyMulti(Box<CopyMultiGate>),
    /// Adds the elements in the latter two [`WireId`]s together, storing
    /// the result in the first [`WireId`].
    Add(TypeId, WireId, WireId, WireId),
    Mul(TypeId, WireId, WireId, WireId),
    AddConstant(TypeId, WireId, WireId, Box<Number>),
    MulConstant(TypeId, WireId, WireId, Box<Number>),
    /// Draw the next public input value of the type.
    PublicIn(TypeId, WireId),
    /// Draw the next private input (witness) value of the type.
    PrivateIn(TypeId, WireId),
    PublicInMulti(TypeId, WireRange),
    PrivateInMulti(TypeId, WireRange),
    /// Cross-type conversion of a fixed-shape wire tuple.
    Conv(Box<ConvGate>),
    /// Declare a contiguous wire range allocation.
    New(TypeId, WireId, WireId),
    /// Deactivate a wire range.
    Delete(TypeId, WireId, WireId),
    Call(Box<CallGate>),
    AnonCall(Box<AnonCallGate>),
    For(Box<ForLoopGate>),
    Switch(Box<SwitchGate>),
}

/// A gate together with its source location.
#[derive(Clone, Debug)]
pub struct Gate {
    pub kind: GateKind,
    pub line: LineNo,
}

impl Gate {
    pub fn new(kind: GateKind, line: LineNo) -> Self {
        Gate { kind, line }
    }

    pub fn constant(ty: TypeId, out: WireId, value: Number, line: LineNo) -> Self {
        Gate::new(GateKind::Constant(ty, out, Box::new(value)), line)
    }

    pub fn assert_zero(ty: TypeId, wire: WireId, line: LineNo) -> Self {
        Gate::new(GateKind::AssertZero(ty, wire), line)
    }

    pub fn copy(ty: TypeId, out: WireId, input: WireId, line: LineNo) -> Self {
        Gate::new(GateKind::Copy(ty, out, input), line)
    }

    pub fn add(ty: TypeId, out: WireId, left: WireId, right: WireId, line: LineNo) -> Self {
        Gate::new(GateKind::Add(ty, out, left, right), line)
    }

    pub fn mul(ty: TypeId, out: WireId, left: WireId, right: WireId, line: LineNo) -> Self {
        Gate::new(GateKind::Mul(ty, out, left, right), line)
    }

    pub fn addc(ty: TypeId, out: WireId, left: WireId, constant: Number, line: LineNo) -> Self {
        Gate::new(GateKind::AddConstant(ty, out, left, Box::new(constant)), line)
    }

    pub fn mulc(ty: TypeId, out: WireId, left: WireId, constant: Number, line: LineNo) -> Self {
        Gate::new(GateKind::MulConstant(ty, out, left, Box::new(constant)), line)
    }

    pub fn public_in(ty: TypeId, out: WireId, line: LineNo) -> Self {
        Gate::new(GateKind::PublicIn(ty, out), line)
    }

    pub fn private_in(ty: TypeId, out: WireId, line: LineNo) -> Self {
        Gate::new(GateKind::PrivateIn(ty, out), line)
    }

    pub fn new_range(ty: TypeId, first: WireId, last: WireId, line: LineNo) -> Self {
        Gate::new(GateKind::New(ty, first, last), line)
    }

    pub fn delete_range(ty: TypeId, first: WireId, last: WireId, line: LineNo) -> Self {
        Gate::new(GateKind::Delete(ty, first, last), line)
    }

    pub fn call(
        name: impl Into<String>,
        outputs: Vec<WireRange>,
        inputs: Vec<WireRange>,
        line: LineNo,
    ) -> Self {
        Gate::new(GateKind::Call(Box::new((name.into(), outputs, inputs))), line)
    }
}

/// A bitmap of the used [`TypeId`]s.
///
/// A [`TypeId`] is "used" if any gate in the body touches it; the
/// interpreter only pushes scope frames for used types.
pub(crate) struct TypeIdMapping([bool; 256]);

impl TypeIdMapping {
    pub(crate) fn set(&mut self, ty: TypeId) {
        self.0[ty as usize] = true;
    }

    pub(crate) fn set_from_gate(&mut self, gate: &Gate) {
        use GateKind::*;
        match &gate.kind {
            Constant(ty, _, _)
            | AssertZero(ty, _)
            | Copy(ty, _, _)
            | Add(ty, _, _, _)
            | Mul(ty, _, _, _)
            | AddConstant(ty, _, _, _)
            | MulConstant(ty, _, _, _)
            | PublicIn(ty, _)
            | PrivateIn(ty, _)
            | PublicInMulti(ty, _)
            | PrivateInMulti(ty, _)
            | New(ty, _, _)
            | Delete(ty, _, _) => self.set(*ty),
            CopyMulti(g) => self.set(g.type_id),
            Conv(g) => {
                self.set(g.out_type);
                self.set(g.in_type);
            }
            // A call's types come from the callee's own compiled info.
            Call(_) => {}
            AnonCall(g) => {
                self.set(g.type_id);
                self.set_from_gates(&g.body);
            }
            For(g) => {
                self.set(g.type_id);
                if let LoopBody::Anon { body, .. } = &g.body {
                    self.set_from_gates(body);
                }
            }
            Switch(g) => {
                self.set(g.type_id);
                for (_, case) in g.cases.iter() {
                    if let CaseBody::Anon { body, .. } = case {
                        self.set_from_gates(body);
                    }
                }
            }
        }
    }

    pub(crate) fn set_from_gates(&mut self, gates: &[Gate]) {
        for g in gates.iter() {
            self.set_from_gate(g);
        }
    }

    pub(crate) fn to_type_ids(&self) -> Vec<TypeId> {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(i, b)| if *b { Some(i as TypeId) } else { None })
            .collect()
    }
}

impl Default for TypeIdMapping {
    fn default() -> Self {
        Self([false; 256]) // There are only 256 possible `TypeId`s
    }
}

/// The [`TypeId`]s a directive body touches, callee frames excluded.
pub(crate) fn gates_type_ids(gates: &[Gate]) -> Vec<TypeId> {
    let mut mapping = TypeIdMapping::default();
    mapping.set_from_gates(gates);
    mapping.to_type_ids()
}

/// A circuit type declared in the relation header.
#[derive(Clone, Debug)]
pub enum TypeSpec {
    /// A prime field.
    Field { modulus: Number },
    /// The ring of integers modulo `2^bits`.
    Ring { bits: u32 },
    /// An opaque plugin type; only a recognizing backend can evaluate
    /// gates of this type.
    Plugin(PluginTypeSpec),
}

#[derive(Clone, Debug)]
pub struct PluginTypeSpec {
    pub name: String,
    pub operation: String,
    pub parameters: Vec<PluginArg>,
}

/// An argument to a plugin binding.
#[derive(Clone, Debug)]
pub enum PluginArg {
    Number(Number),
    Ident(String),
}

/// A plugin binding standing in for a function body.
#[derive(Clone, Debug)]
pub struct PluginBinding {
    pub name: String,
    pub operation: String,
    pub parameters: Vec<PluginArg>,
    pub public_counts: CountList,
    pub private_counts: CountList,
}

/// A mapping from [`TypeId`]s to their [`TypeSpec`]s.
#[derive(Clone, Default)]
pub struct TypeStore(BTreeMap<TypeId, TypeSpec>);

impl TypeStore {
    pub fn insert(&mut self, key: TypeId, value: TypeSpec) {
        self.0.insert(key, value);
    }

    pub fn get(&self, key: &TypeId) -> Result<&TypeSpec> {
        self.0.get(key).ok_or_else(|| {
            EvalError::structural(0, format!("type id {key} not found in type store")).into()
        })
    }

    pub fn iter(&self) -> std::collections::btree_map::Iter<'_, TypeId, TypeSpec> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<TypeSpec>> for TypeStore {
    type Error = eyre::Report;

    fn try_from(types: Vec<TypeSpec>) -> Result<Self> {
        debug!("converting type list to TypeStore");
        ensure!(
            types.len() <= 256,
            "too many types specified: {} > 256",
            types.len()
        );
        let mut store = TypeStore::default();
        for (i, ty) in types.into_iter().enumerate() {
            if let TypeSpec::Field { modulus } = &ty {
                ensure!(
                    *modulus >= Number::from(2u8),
                    "field modulus {modulus} is not a prime"
                );
            }
            store.insert(i as TypeId, ty);
        }
        Ok(store)
    }
}

impl TryFrom<Vec<Number>> for TypeStore {
    type Error = eyre::Report;

    fn try_from(fields: Vec<Number>) -> Result<Self> {
        TypeStore::try_from(
            fields
                .into_iter()
                .map(|modulus| TypeSpec::Field { modulus })
                .collect::<Vec<_>>(),
        )
    }
}

/// A declared cross-type conversion shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConversionSpec {
    pub out_type: TypeId,
    pub out_count: WireCount,
    pub in_type: TypeId,
    pub in_count: WireCount,
}

/// The signature of a function declaration.
#[derive(Clone, Debug)]
pub struct FunctionSignature {
    pub name: String,
    pub outputs: CountList,
    pub inputs: CountList,
    pub public_counts: CountList,
    pub private_counts: CountList,
    pub line: LineNo,
}

/// The body of a function: a gate list or a plugin binding.
#[derive(Clone, Debug)]
pub enum FunctionBody {
    Gates(Vec<Gate>),
    Plugin(PluginBinding),
}

/// Analysis collected once at declaration time.
#[derive(Clone, Debug)]
pub struct CompiledInfo {
    /// [`TypeId`]s the function touches (body plus signature).
    pub type_ids: Vec<TypeId>,
}

/// A function declaration. Created once during the declaration phase
/// and immutable thereafter.
#[derive(Clone, Debug)]
pub struct FuncDecl {
    sig: FunctionSignature,
    body: FunctionBody,
    pub(crate) compiled_info: CompiledInfo,
}

impl FuncDecl {
    /// Instantiate a regular function with a gate-list body.
    pub fn new_function(sig: FunctionSignature, gates: Vec<Gate>) -> Self {
        let mut presence = TypeIdMapping::default();
        presence.set_from_gates(&gates);
        for (ty, _) in sig.outputs.iter().chain(sig.inputs.iter()) {
            presence.set(*ty);
        }
        let type_ids = presence.to_type_ids();
        FuncDecl {
            sig,
            body: FunctionBody::Gates(gates),
            compiled_info: CompiledInfo { type_ids },
        }
    }

    /// Instantiate a plugin-bound function.
    pub fn new_plugin(sig: FunctionSignature, binding: PluginBinding) -> Self {
        let mut presence = TypeIdMapping::default();
        for (ty, _) in sig.outputs.iter().chain(sig.inputs.iter()) {
            presence.set(*ty);
        }
        let type_ids = presence.to_type_ids();
        FuncDecl {
            sig,
            body: FunctionBody::Plugin(binding),
            compiled_info: CompiledInfo { type_ids },
        }
    }

    pub fn sig(&self) -> &FunctionSignature {
        &self.sig
    }

    pub fn body(&self) -> &FunctionBody {
        &self.body
    }

    pub fn name(&self) -> &str {
        &self.sig.name
    }
}

/// A mapping of function names to their [`FuncDecl`]s, frozen after the
/// declaration pass.
#[derive(Clone, Default)]
pub struct FunStore(BTreeMap<String, FuncDecl>);

impl FunStore {
    /// Insert a declaration, enforcing name uniqueness and the
    /// no-recursion discipline: every call reachable from the body must
    /// name a function declared before this one.
    pub fn insert(&mut self, func: FuncDecl) -> Result<()> {
        ensure!(
            !self.0.contains_key(func.name()),
            EvalError::structural(
                func.sig().line,
                format!("function \"{}\" was previously defined", func.name()),
            )
        );
        if let FunctionBody::Gates(gates) = func.body() {
            let mut callees = Vec::new();
            collect_call_names(gates, &mut callees);
            for (name, line) in callees {
                ensure!(
                    self.0.contains_key(&name),
                    EvalError::structural(
                        line,
                        format!("function \"{name}\" was not previously defined"),
                    )
                );
            }
        }
        self.0.insert(func.name().to_string(), func);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&FuncDecl> {
        self.0.get(name).ok_or_else(|| {
            EvalError::structural(0, format!("function \"{name}\" was not previously defined"))
                .into()
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Declaration pass over a whole tree.
    pub fn collect(tree: &IRTree) -> Result<FunStore> {
        let mut store = FunStore::default();
        for func in tree.functions.iter() {
            store.insert(func.clone())?;
        }
        // Top-level calls must also resolve.
        let mut callees = Vec::new();
        collect_call_names(&tree.gates, &mut callees);
        for (name, line) in callees {
            ensure!(
                store.contains(&name),
                EvalError::structural(
                    line,
                    format!("function \"{name}\" was not previously defined"),
                )
            );
        }
        Ok(store)
    }
}

/// Every function name called anywhere under `gates`, with the call
/// site's line.
fn collect_call_names(gates: &[Gate], out: &mut Vec<(String, LineNo)>) {
    for gate in gates.iter() {
        match &gate.kind {
            GateKind::Call(call) => out.push((call.0.clone(), gate.line)),
            GateKind::AnonCall(anon) => collect_call_names(&anon.body, out),
            GateKind::For(fl) => match &fl.body {
                LoopBody::Invoke { name, .. } => out.push((name.clone(), gate.line)),
                LoopBody::Anon { body, .. } => collect_call_names(body, out),
            },
            GateKind::Switch(sw) => {
                for (_, case) in sw.cases.iter() {
                    match case {
                        CaseBody::Invoke { name, .. } => out.push((name.clone(), gate.line)),
                        CaseBody::Anon { body, .. } => collect_call_names(body, out),
                    }
                }
            }
            _ => {}
        }
    }
}

/// Identification of the toolchain or IR flavor that produced a
/// resource. Release ordering ignores the `extra` tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub extra: Option<String>,
}

impl Version {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Version {
            major,
            minor,
            patch,
            extra: None,
        }
    }

    pub fn with_extra(major: u32, minor: u32, patch: u32, extra: impl Into<String>) -> Self {
        Version {
            major,
            minor,
            patch,
            extra: Some(extra.into()),
        }
    }

    /// Ordering on the numeric triple alone.
    pub fn cmp_release(&self, other: &Version) -> std::cmp::Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(extra) = &self.extra {
            write!(f, "-{extra}")?;
        }
        Ok(())
    }
}

/// The kind of resource a stream of handler events describes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResourceType {
    Relation,
    PublicInputs,
    PrivateInputs,
}

/// A fully materialized relation: header, declarations, and the
/// top-level gate list. Owns all gates, functions, nested directive
/// lists, and iteration expressions from parse time until after
/// interpretation.
#[derive(Clone, Debug)]
pub struct IRTree {
    pub version: Version,
    pub plugins: Vec<String>,
    pub types: TypeStore,
    pub conversions: Vec<ConversionSpec>,
    pub functions: Vec<FuncDecl>,
    pub gates: Vec<Gate>,
}

impl fmt::Debug for TypeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(name: &str) -> FunctionSignature {
        FunctionSignature {
            name: name.to_string(),
            outputs: vec![],
            inputs: vec![],
            public_counts: vec![],
            private_counts: vec![],
            line: 1,
        }
    }

    #[test]
    fn fun_store_rejects_duplicates() {
        let mut store = FunStore::default();
        store
            .insert(FuncDecl::new_function(sig("square"), vec![]))
            .unwrap();
        let err = store
            .insert(FuncDecl::new_function(sig("square"), vec![]))
            .unwrap_err();
        assert!(err.to_string().contains("previously defined"));
    }

    #[test]
    fn fun_store_rejects_forward_and_self_calls() {
        let mut store = FunStore::default();
        // A function calling itself is just a call to a not-yet-declared
        // name at its own declaration point.
        let body = vec![Gate::call("omega", vec![], vec![], 3)];
        let err = store
            .insert(FuncDecl::new_function(sig("omega"), body))
            .unwrap_err();
        assert!(err.to_string().contains("not previously defined"));
    }

    #[test]
    fn fun_store_accepts_backward_calls() {
        let mut store = FunStore::default();
        store
            .insert(FuncDecl::new_function(sig("leaf"), vec![]))
            .unwrap();
        let body = vec![Gate::call("leaf", vec![], vec![], 7)];
        store
            .insert(FuncDecl::new_function(sig("stem"), body))
            .unwrap();
        assert!(store.get("stem").is_ok());
        assert!(store.get("missing").is_err());
    }

    #[test]
    fn type_store_limits() {
        let store =
            TypeStore::try_from(vec![Number::from(101u8), Number::from(2u8)]).unwrap();
        assert_eq!(store.len(), 2);
        assert!(matches!(
            store.get(&0).unwrap(),
            TypeSpec::Field { .. }
        ));
        assert!(store.get(&2).is_err());
        assert!(TypeStore::try_from(vec![Number::from(1u8)]).is_err());
    }

    #[test]
    fn type_usage_recurses_into_directives() {
        let body = vec![Gate::new(
            GateKind::Switch(Box::new(SwitchGate {
                type_id: 0,
                condition: 0,
                outputs: vec![],
                cases: vec![(
                    Number::from(0u8),
                    CaseBody::Anon {
                        inputs: vec![],
                        public_counts: vec![],
                        private_counts: vec![],
                        body: vec![Gate::add(3, 1, 0, 0, 9)],
                    },
                )],
            })),
            8,
        )];
        assert_eq!(gates_type_ids(&body), vec![0, 3]);
    }

    #[test]
    fn version_ordering_ignores_extra() {
        let a = Version::with_extra(2, 1, 0, "beta");
        let b = Version::new(2, 1, 0);
        assert_eq!(a.cmp_release(&b), std::cmp::Ordering::Equal);
        assert_eq!(a.to_string(), "2.1.0-beta");
        assert!(Version::new(1, 9, 9).cmp_release(&b).is_lt());
    }
}
