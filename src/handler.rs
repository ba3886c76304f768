//! The callback protocol between a parser and this toolkit.
//!
//! Surface syntax is somebody else's problem: a parser drives a
//! [`Handler`] in textual order and either streams straight into an
//! interpreter or materializes an [`IRTree`] through [`TreeSink`].
//!
//! The expected call order is:
//!
//! ```text
//! set_header
//! declare_plugin*            declare_type+          declare_conversion*
//! begin_body
//! [ start_function ( regular_function gate* end_function
//!                  | plugin_function ) ]*
//! gate*
//! end_body
//! ```

use eyre::{bail, ensure, Result};

use crate::circuit_ir::{
    ConvGate, ConversionSpec, CopyMultiGate, FuncDecl, FunctionSignature, Gate, GateKind, IRTree,
    LineNo, Number, PluginBinding, ResourceType, TypeId, TypeSpec, TypeStore, Version, WireId,
    WireRange,
};

/// Callbacks a parser invokes in textual order.
///
/// Only [`Handler::gate`] must be implemented for the gate stream; the
/// per-gate methods below exist so a parser can stay close to the
/// surface grammar, and default to wrapping the arguments into a
/// [`Gate`].
pub trait Handler {
    fn set_header(&mut self, version: Version, resource: ResourceType) -> Result<()>;

    fn declare_plugin(&mut self, name: &str) -> Result<()>;

    fn declare_type(&mut self, spec: TypeSpec) -> Result<()>;

    fn declare_conversion(&mut self, conv: ConversionSpec) -> Result<()>;

    fn begin_body(&mut self) -> Result<()>;

    fn start_function(&mut self, sig: FunctionSignature) -> Result<()>;

    /// The started function has a regular gate-list body; its gates
    /// follow until [`Handler::end_function`].
    fn regular_function(&mut self) -> Result<()>;

    /// The started function is bound to a plugin; no gates follow.
    fn plugin_function(&mut self, binding: PluginBinding) -> Result<()>;

    fn end_function(&mut self) -> Result<()>;

    fn gate(&mut self, gate: Gate) -> Result<()>;

    fn end_body(&mut self) -> Result<()>;

    fn add_gate(
        &mut self,
        out: WireId,
        left: WireId,
        right: WireId,
        ty: TypeId,
        line: LineNo,
    ) -> Result<()> {
        self.gate(Gate::add(ty, out, left, right, line))
    }

    fn mul_gate(
        &mut self,
        out: WireId,
        left: WireId,
        right: WireId,
        ty: TypeId,
        line: LineNo,
    ) -> Result<()> {
        self.gate(Gate::mul(ty, out, left, right, line))
    }

    fn addc_gate(
        &mut self,
        out: WireId,
        left: WireId,
        constant: Number,
        ty: TypeId,
        line: LineNo,
    ) -> Result<()> {
        self.gate(Gate::addc(ty, out, left, constant, line))
    }

    fn mulc_gate(
        &mut self,
        out: WireId,
        left: WireId,
        constant: Number,
        ty: TypeId,
        line: LineNo,
    ) -> Result<()> {
        self.gate(Gate::mulc(ty, out, left, constant, line))
    }

    fn copy(&mut self, out: WireId, input: WireId, ty: TypeId, line: LineNo) -> Result<()> {
        self.gate(Gate::copy(ty, out, input, line))
    }

    fn copy_multi(
        &mut self,
        output: WireRange,
        inputs: Vec<WireRange>,
        ty: TypeId,
        line: LineNo,
    ) -> Result<()> {
        self.gate(Gate::new(
            GateKind::CopyMulti(Box::new(CopyMultiGate {
                type_id: ty,
                output,
                inputs,
            })),
            line,
        ))
    }

    fn assign(&mut self, out: WireId, value: Number, ty: TypeId, line: LineNo) -> Result<()> {
        self.gate(Gate::constant(ty, out, value, line))
    }

    fn assert_zero(&mut self, wire: WireId, ty: TypeId, line: LineNo) -> Result<()> {
        self.gate(Gate::assert_zero(ty, wire, line))
    }

    fn public_in(&mut self, out: WireId, ty: TypeId, line: LineNo) -> Result<()> {
        self.gate(Gate::public_in(ty, out, line))
    }

    fn private_in(&mut self, out: WireId, ty: TypeId, line: LineNo) -> Result<()> {
        self.gate(Gate::private_in(ty, out, line))
    }

    fn public_in_multi(&mut self, outs: WireRange, ty: TypeId, line: LineNo) -> Result<()> {
        self.gate(Gate::new(GateKind::PublicInMulti(ty, outs), line))
    }

    fn private_in_multi(&mut self, outs: WireRange, ty: TypeId, line: LineNo) -> Result<()> {
        self.gate(Gate::new(GateKind::PrivateInMulti(ty, outs), line))
    }

    #[allow(clippy::too_many_arguments)]
    fn convert(
        &mut self,
        out_first: WireId,
        out_last: WireId,
        out_type: TypeId,
        in_first: WireId,
        in_last: WireId,
        in_type: TypeId,
        modulus: bool,
        line: LineNo,
    ) -> Result<()> {
        self.gate(Gate::new(
            GateKind::Conv(Box::new(ConvGate {
                out_type,
                out_range: (out_first, out_last),
                in_type,
                in_range: (in_first, in_last),
                modulus,
            })),
            line,
        ))
    }

    fn new_range(&mut self, first: WireId, last: WireId, ty: TypeId, line: LineNo) -> Result<()> {
        self.gate(Gate::new_range(ty, first, last, line))
    }

    fn delete_range(
        &mut self,
        first: WireId,
        last: WireId,
        ty: TypeId,
        line: LineNo,
    ) -> Result<()> {
        self.gate(Gate::delete_range(ty, first, last, line))
    }

    fn call(
        &mut self,
        name: &str,
        outputs: Vec<WireRange>,
        inputs: Vec<WireRange>,
        line: LineNo,
    ) -> Result<()> {
        self.gate(Gate::call(name, outputs, inputs, line))
    }
}

enum PendingBody {
    /// `start_function` seen, body form not yet announced.
    Undecided,
    /// `regular_function` seen; collecting gates.
    Gates(Vec<Gate>),
}

/// A [`Handler`] that materializes the event stream into an [`IRTree`].
pub struct TreeSink {
    version: Version,
    resource: ResourceType,
    plugins: Vec<String>,
    types: Vec<TypeSpec>,
    conversions: Vec<ConversionSpec>,
    functions: Vec<FuncDecl>,
    gates: Vec<Gate>,
    in_body: bool,
    done: bool,
    pending: Option<(FunctionSignature, PendingBody)>,
}

impl Default for TreeSink {
    fn default() -> Self {
        TreeSink {
            version: Version::new(0, 0, 0),
            resource: ResourceType::Relation,
            plugins: Vec::new(),
            types: Vec::new(),
            conversions: Vec::new(),
            functions: Vec::new(),
            gates: Vec::new(),
            in_body: false,
            done: false,
            pending: None,
        }
    }
}

impl TreeSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The resource kind announced by the header.
    pub fn resource(&self) -> ResourceType {
        self.resource
    }

    /// Consume the sink once `end_body` has been seen.
    pub fn finish(self) -> Result<IRTree> {
        ensure!(self.done, "relation body was never finished");
        Ok(IRTree {
            version: self.version,
            plugins: self.plugins,
            types: TypeStore::try_from(self.types)?,
            conversions: self.conversions,
            functions: self.functions,
            gates: self.gates,
        })
    }
}

impl Handler for TreeSink {
    fn set_header(&mut self, version: Version, resource: ResourceType) -> Result<()> {
        self.version = version;
        self.resource = resource;
        Ok(())
    }

    fn declare_plugin(&mut self, name: &str) -> Result<()> {
        ensure!(!self.in_body, "plugin declared after body start");
        self.plugins.push(name.to_string());
        Ok(())
    }

    fn declare_type(&mut self, spec: TypeSpec) -> Result<()> {
        ensure!(!self.in_body, "type declared after body start");
        self.types.push(spec);
        Ok(())
    }

    fn declare_conversion(&mut self, conv: ConversionSpec) -> Result<()> {
        ensure!(!self.in_body, "conversion declared after body start");
        self.conversions.push(conv);
        Ok(())
    }

    fn begin_body(&mut self) -> Result<()> {
        ensure!(!self.in_body, "body started twice");
        ensure!(!self.types.is_empty(), "no types declared");
        self.in_body = true;
        Ok(())
    }

    fn start_function(&mut self, sig: FunctionSignature) -> Result<()> {
        ensure!(self.in_body, "function declared outside body");
        ensure!(self.pending.is_none(), "function declarations cannot nest");
        self.pending = Some((sig, PendingBody::Undecided));
        Ok(())
    }

    fn regular_function(&mut self) -> Result<()> {
        match self.pending.as_mut() {
            Some((_, body @ PendingBody::Undecided)) => {
                *body = PendingBody::Gates(Vec::new());
                Ok(())
            }
            _ => bail!("regular_function without a started function"),
        }
    }

    fn plugin_function(&mut self, binding: PluginBinding) -> Result<()> {
        match self.pending.take() {
            Some((sig, PendingBody::Undecided)) => {
                self.functions.push(FuncDecl::new_plugin(sig, binding));
                Ok(())
            }
            _ => bail!("plugin_function without a started function"),
        }
    }

    fn end_function(&mut self) -> Result<()> {
        match self.pending.take() {
            Some((sig, PendingBody::Gates(gates))) => {
                self.functions.push(FuncDecl::new_function(sig, gates));
                Ok(())
            }
            _ => bail!("end_function without a regular function body"),
        }
    }

    fn gate(&mut self, gate: Gate) -> Result<()> {
        ensure!(self.in_body, "gate outside body");
        match self.pending.as_mut() {
            Some((_, PendingBody::Gates(gates))) => gates.push(gate),
            Some((_, PendingBody::Undecided)) => {
                bail!("gate between start_function and regular_function")
            }
            None => self.gates.push(gate),
        }
        Ok(())
    }

    fn end_body(&mut self) -> Result<()> {
        ensure!(self.in_body, "end_body before begin_body");
        ensure!(self.pending.is_none(), "unfinished function at end of body");
        self.done = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(sink: &mut TreeSink) {
        sink.set_header(Version::new(2, 1, 0), ResourceType::Relation)
            .unwrap();
        sink.declare_type(TypeSpec::Field {
            modulus: Number::from(101u8),
        })
        .unwrap();
    }

    #[test]
    fn materializes_top_level_gates() {
        let mut sink = TreeSink::new();
        header(&mut sink);
        sink.begin_body().unwrap();
        sink.private_in(0, 0, 1).unwrap();
        sink.mul_gate(1, 0, 0, 0, 2).unwrap();
        sink.assert_zero(1, 0, 3).unwrap();
        sink.end_body().unwrap();

        let tree = sink.finish().unwrap();
        assert_eq!(tree.gates.len(), 3);
        assert_eq!(tree.types.len(), 1);
        assert!(tree.functions.is_empty());
    }

    #[test]
    fn materializes_functions_in_order() {
        let mut sink = TreeSink::new();
        header(&mut sink);
        sink.begin_body().unwrap();
        sink.start_function(FunctionSignature {
            name: "square".to_string(),
            outputs: vec![(0, 1)],
            inputs: vec![(0, 1)],
            public_counts: vec![],
            private_counts: vec![],
            line: 4,
        })
        .unwrap();
        sink.regular_function().unwrap();
        sink.mul_gate(0, 1, 1, 0, 5).unwrap();
        sink.end_function().unwrap();
        sink.call("square", vec![(1, 1)], vec![(0, 0)], 7).unwrap();
        sink.end_body().unwrap();

        let tree = sink.finish().unwrap();
        assert_eq!(tree.functions.len(), 1);
        assert_eq!(tree.functions[0].name(), "square");
        assert_eq!(tree.gates.len(), 1);
    }

    #[test]
    fn rejects_out_of_order_events() {
        let mut sink = TreeSink::new();
        header(&mut sink);
        assert!(sink.add_gate(0, 1, 2, 0, 1).is_err());
        sink.begin_body().unwrap();
        assert!(sink
            .declare_type(TypeSpec::Field {
                modulus: Number::from(7u8)
            })
            .is_err());
        sink.start_function(FunctionSignature {
            name: "f".to_string(),
            outputs: vec![],
            inputs: vec![],
            public_counts: vec![],
            private_counts: vec![],
            line: 2,
        })
        .unwrap();
        // Gates are only legal once the body form is announced.
        assert!(sink.add_gate(0, 1, 2, 0, 3).is_err());
        sink.regular_function().unwrap();
        sink.end_function().unwrap();
        assert!(sink.end_function().is_err());
        sink.end_body().unwrap();
        assert!(sink.finish().is_ok());
    }
}
