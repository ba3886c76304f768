//! Firewatch: a validating interpreter and transformation toolkit for
//! the hierarchical SIEVE circuit IR.
//!
//! A relation declares wire types (prime fields or power-of-two
//! rings), connects wires with arithmetic gates, and organizes
//! repetition through named functions, anonymous calls, for-loops, and
//! switch statements. Two external value streams, the public inputs
//! and the private inputs (the witness), are consumed positionally as
//! the circuit executes.
//!
//! The crate is organized around three jobs:
//!
//! - **Checking and evaluating.** [`interp::evaluate`] walks a
//!   materialized [`circuit_ir::IRTree`] in two passes, enforcing the
//!   wire discipline (single assignment, activeness, allocation
//!   contiguity, deletion), exact stream consumption, and the scope
//!   remapping rules for calls, loops, and switch cases, while routing
//!   arithmetic through per-type [`backend::TypeBackend`]s.
//! - **Lowering.** [`mux::lower_switches`] rewrites switch statements
//!   into selector arithmetic and multiplexer loops over a restricted
//!   gate set, preserving semantics.
//! - **Analysis.** [`bolt::classify`] selects a for-loop execution
//!   strategy (shortcut, soft unroll, hard unroll) from the iteration
//!   expressions and the surrounding scope.
//!
//! Surface syntax is an external collaborator: a parser drives the
//! [`handler::Handler`] callbacks, typically through
//! [`handler::TreeSink`] to materialize a tree.

pub mod backend;
pub mod bolt;
pub mod circuit_ir;
pub mod error;
pub mod handler;
pub mod interp;
pub mod iterexpr;
pub mod mux;
pub mod scope;
pub mod skiplist;
pub mod stream;

pub use crate::backend::{FieldChecker, GateCounts, TypeBackend};
pub use crate::circuit_ir::{
    FunStore, Gate, GateKind, IRTree, LineNo, Number, TypeId, TypeStore, Version, WireCount,
    WireId, WireRange,
};
pub use crate::error::{ErrorKind, EvalError};
pub use crate::handler::{Handler, TreeSink};
pub use crate::interp::{evaluate, EvalReport, InterpOptions, Interpreter, Mode};
pub use crate::mux::lower_switches;
pub use crate::skiplist::SkipList;
pub use crate::stream::{CircuitInputs, InputStream, StreamRead};
