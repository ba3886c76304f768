//! The error taxonomy for relation checking and evaluation.
//!
//! Checking a relation can surface many independent problems; the
//! non-nesting checks keep going after a failure so that a user sees a
//! full report instead of one error at a time. [`Diags`] collects the
//! typed failures, logs each as it arrives, and converts to a single
//! [`EvalError`] (the first one found) when checking finishes.

use crate::circuit_ir::LineNo;

/// A classified failure found while checking or evaluating a relation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum EvalError {
    /// Malformed relation: duplicate or unknown function name, recursive
    /// call graph, duplicate case match, type index out of range.
    #[error("line {line}: {msg}")]
    Structural { line: LineNo, msg: String },

    /// Wire discipline violation: use before assignment, reassignment,
    /// range not contiguous, bad delete.
    #[error("line {line}: {msg}")]
    Wire { line: LineNo, msg: String },

    /// A constant exceeding its field, or a conversion with no registered
    /// converter.
    #[error("line {line}: {msg}")]
    Value { line: LineNo, msg: String },

    /// Reading past the end of an input stream, a stream value exceeding
    /// its field, or leftover values once evaluation is done.
    #[error("line {line}: {msg}")]
    Stream { line: LineNo, msg: String },

    /// An `assert_zero` saw a non-zero wire.
    #[error("line {line}: assertion failure: {msg}")]
    AssertionFailed { line: LineNo, msg: String },

    /// Opaque failure from a type backend or converter.
    #[error("backend failure: {msg}")]
    Backend { msg: String },
}

/// The kind of an [`EvalError`], for dispatch and for tests.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ErrorKind {
    Structural,
    Wire,
    Value,
    Stream,
    AssertionFailed,
    Backend,
}

impl EvalError {
    pub fn structural(line: LineNo, msg: impl Into<String>) -> Self {
        EvalError::Structural {
            line,
            msg: msg.into(),
        }
    }

    pub fn wire(line: LineNo, msg: impl Into<String>) -> Self {
        EvalError::Wire {
            line,
            msg: msg.into(),
        }
    }

    pub fn value(line: LineNo, msg: impl Into<String>) -> Self {
        EvalError::Value {
            line,
            msg: msg.into(),
        }
    }

    pub fn stream(line: LineNo, msg: impl Into<String>) -> Self {
        EvalError::Stream {
            line,
            msg: msg.into(),
        }
    }

    pub fn assertion(line: LineNo, msg: impl Into<String>) -> Self {
        EvalError::AssertionFailed {
            line,
            msg: msg.into(),
        }
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        EvalError::Backend { msg: msg.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EvalError::Structural { .. } => ErrorKind::Structural,
            EvalError::Wire { .. } => ErrorKind::Wire,
            EvalError::Value { .. } => ErrorKind::Value,
            EvalError::Stream { .. } => ErrorKind::Stream,
            EvalError::AssertionFailed { .. } => ErrorKind::AssertionFailed,
            EvalError::Backend { .. } => ErrorKind::Backend,
        }
    }
}

/// Accumulator for non-fatal diagnostics.
///
/// Gate-level checks push here and carry on; nesting directives (calls,
/// loops, switches) fail eagerly instead, since a broken scope makes
/// everything downstream meaningless.
#[derive(Default)]
pub struct Diags {
    errors: Vec<EvalError>,
}

impl Diags {
    pub fn push(&mut self, err: EvalError) {
        log::error!("{err}");
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EvalError> {
        self.errors.iter()
    }

    /// Resolve the accumulated diagnostics: `Ok` when nothing was
    /// reported, otherwise the first error (the rest were already
    /// logged).
    pub fn finish(self) -> Result<(), EvalError> {
        match self.errors.into_iter().next() {
            None => Ok(()),
            Some(first) => Err(first),
        }
    }
}
