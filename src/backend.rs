//! Abstract gate semantics for one circuit type, and the plaintext
//! checking backend.
//!
//! The interpreter never computes field arithmetic itself; it routes
//! every gate through a [`TypeBackend`]. The [`FieldChecker`] here
//! evaluates in the clear over a prime field or a power-of-two ring,
//! counts gates, and records assertion failures; a ZK backend would
//! implement the same trait over its own committed wire type.

use eyre::{bail, ensure, Result};
use log::info;
use num_traits::{One, Zero};
use rustc_hash::FxHashMap;
use std::fmt;

use crate::circuit_ir::{ConversionSpec, Number, TypeId, TypeSpec, TypeStore, WireCount};

/// Per-kind gate tallies for one backend.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GateCounts {
    pub add: u64,
    pub mul: u64,
    pub addc: u64,
    pub mulc: u64,
    pub copy: u64,
    pub assign: u64,
    pub assert_zero: u64,
    /// Asserts skipped because an enclosing switch case was inactive.
    pub assert_zero_disabled: u64,
    pub public_in: u64,
    pub private_in: u64,
    pub convert: u64,
}

impl GateCounts {
    pub fn total(&self) -> u64 {
        self.add
            + self.mul
            + self.addc
            + self.mulc
            + self.copy
            + self.assign
            + self.assert_zero
            + self.public_in
            + self.private_in
            + self.convert
    }

    pub fn merge(&mut self, other: &GateCounts) {
        self.add += other.add;
        self.mul += other.mul;
        self.addc += other.addc;
        self.mulc += other.mulc;
        self.copy += other.copy;
        self.assign += other.assign;
        self.assert_zero += other.assert_zero;
        self.assert_zero_disabled += other.assert_zero_disabled;
        self.public_in += other.public_in;
        self.private_in += other.private_in;
        self.convert += other.convert;
    }
}

impl fmt::Display for GateCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "add:         {}", self.add)?;
        writeln!(f, "mul:         {}", self.mul)?;
        writeln!(f, "addc:        {}", self.addc)?;
        writeln!(f, "mulc:        {}", self.mulc)?;
        writeln!(f, "copy:        {}", self.copy)?;
        writeln!(f, "assign:      {}", self.assign)?;
        writeln!(f, "assert_zero: {} ({} disabled)", self.assert_zero, self.assert_zero_disabled)?;
        writeln!(f, "public_in:   {}", self.public_in)?;
        writeln!(f, "private_in:  {}", self.private_in)?;
        writeln!(f, "convert:     {}", self.convert)?;
        write!(f, "total:       {}", self.total())
    }
}

/// Gate semantics for one ring or field.
pub trait TypeBackend {
    type Wire: Clone + Default + fmt::Debug;

    /// The modulus: the field prime, or `2^bits` for a ring type.
    fn prime(&self) -> &Number;

    fn is_boolean(&self) -> bool;

    /// Admit an externally supplied constant; fails if it is not a
    /// member of the field.
    fn from_number(&self, value: &Number) -> Result<Self::Wire>;

    /// The plaintext value carried by a wire, where the backend knows
    /// it.
    fn wire_value(&self, wire: &Self::Wire) -> Number;

    fn copy(&mut self, wire: &Self::Wire) -> Result<Self::Wire>;

    fn assign(&mut self, value: Self::Wire) -> Result<Self::Wire>;

    fn add(&mut self, a: &Self::Wire, b: &Self::Wire) -> Result<Self::Wire>;

    fn mul(&mut self, a: &Self::Wire, b: &Self::Wire) -> Result<Self::Wire>;

    fn add_constant(&mut self, a: &Self::Wire, b: Self::Wire) -> Result<Self::Wire>;

    fn mul_constant(&mut self, a: &Self::Wire, b: Self::Wire) -> Result<Self::Wire>;

    /// Check that the wire carries zero. Failure is reported to the
    /// caller and remembered for [`TypeBackend::check`]; in assert
    /// suppressing mode it is neither.
    fn assert_zero(&mut self, wire: &Self::Wire) -> Result<()>;

    fn public_in(&mut self, value: Self::Wire) -> Result<Self::Wire>;

    fn private_in(&mut self, value: Self::Wire) -> Result<Self::Wire>;

    /// End-of-evaluation validity.
    fn check(&mut self) -> Result<()>;

    /// Gate tallies, where the backend keeps them.
    fn counts(&self) -> GateCounts {
        GateCounts::default()
    }

    /// An assert was skipped because its switch case is inactive.
    fn note_disabled_assert(&mut self) {}

    /// A conversion routed values through this backend.
    fn note_convert(&mut self) {}

    /// Current scope nesting depth, for trace indentation.
    fn set_depth(&mut self, _depth: usize) {}

    fn enable_trace(&mut self) {}
}

/// The plaintext evaluating and checking backend.
pub struct FieldChecker {
    modulus: Number,
    boolean: bool,
    counts: GateCounts,
    /// Verifier and preprocess modes suppress assertion failures so an
    /// absent witness does not produce false rejections.
    suppress_asserts: bool,
    failed: u64,
    trace: bool,
    depth: usize,
}

impl FieldChecker {
    pub fn new(modulus: Number) -> Self {
        let boolean = modulus == Number::from(2u8);
        FieldChecker {
            modulus,
            boolean,
            counts: GateCounts::default(),
            suppress_asserts: false,
            failed: 0,
            trace: false,
            depth: 0,
        }
    }

    /// Build a checker for a declared type. Plugin types are opaque and
    /// have no plaintext semantics.
    pub fn from_spec(spec: &TypeSpec) -> Result<Self> {
        match spec {
            TypeSpec::Field { modulus } => Ok(FieldChecker::new(modulus.clone())),
            TypeSpec::Ring { bits } => {
                ensure!(*bits > 0 && *bits <= 256, "unsupported ring width {bits}");
                Ok(FieldChecker::new(Number::one() << *bits))
            }
            TypeSpec::Plugin(plugin) => {
                bail!("plugin type {} requires a recognizing backend", plugin.name)
            }
        }
    }

    pub fn suppress_asserts(&mut self, suppress: bool) {
        self.suppress_asserts = suppress;
    }

    fn traced(&self, value: &Number) {
        if self.trace {
            info!("{:indent$}-> {value}", "", indent = 2 * self.depth);
        }
    }
}

impl TypeBackend for FieldChecker {
    type Wire = Number;

    fn prime(&self) -> &Number {
        &self.modulus
    }

    fn is_boolean(&self) -> bool {
        self.boolean
    }

    fn from_number(&self, value: &Number) -> Result<Self::Wire> {
        ensure!(
            value < &self.modulus,
            "value {value} exceeds the field modulus {}",
            self.modulus
        );
        Ok(value.clone())
    }

    fn wire_value(&self, wire: &Self::Wire) -> Number {
        wire.clone()
    }

    fn copy(&mut self, wire: &Self::Wire) -> Result<Self::Wire> {
        self.counts.copy += 1;
        self.traced(wire);
        Ok(wire.clone())
    }

    fn assign(&mut self, value: Self::Wire) -> Result<Self::Wire> {
        self.counts.assign += 1;
        self.traced(&value);
        Ok(value)
    }

    fn add(&mut self, a: &Self::Wire, b: &Self::Wire) -> Result<Self::Wire> {
        self.counts.add += 1;
        let v = (a + b) % &self.modulus;
        self.traced(&v);
        Ok(v)
    }

    fn mul(&mut self, a: &Self::Wire, b: &Self::Wire) -> Result<Self::Wire> {
        self.counts.mul += 1;
        let v = (a * b) % &self.modulus;
        self.traced(&v);
        Ok(v)
    }

    fn add_constant(&mut self, a: &Self::Wire, b: Self::Wire) -> Result<Self::Wire> {
        self.counts.addc += 1;
        let v = (a + b) % &self.modulus;
        self.traced(&v);
        Ok(v)
    }

    fn mul_constant(&mut self, a: &Self::Wire, b: Self::Wire) -> Result<Self::Wire> {
        self.counts.mulc += 1;
        let v = (a * b) % &self.modulus;
        self.traced(&v);
        Ok(v)
    }

    fn assert_zero(&mut self, wire: &Self::Wire) -> Result<()> {
        self.counts.assert_zero += 1;
        if self.trace {
            info!("{:indent$}<- {wire}", "", indent = 2 * self.depth);
        }
        if !wire.is_zero() && !self.suppress_asserts {
            self.failed += 1;
            bail!("value {wire} is not zero");
        }
        Ok(())
    }

    fn public_in(&mut self, value: Self::Wire) -> Result<Self::Wire> {
        self.counts.public_in += 1;
        self.traced(&value);
        Ok(value)
    }

    fn private_in(&mut self, value: Self::Wire) -> Result<Self::Wire> {
        self.counts.private_in += 1;
        self.traced(&value);
        Ok(value)
    }

    fn check(&mut self) -> Result<()> {
        ensure!(
            self.failed == 0,
            "{} assertion(s) failed during evaluation",
            self.failed
        );
        Ok(())
    }

    fn counts(&self) -> GateCounts {
        self.counts.clone()
    }

    fn note_disabled_assert(&mut self) {
        self.counts.assert_zero_disabled += 1;
    }

    fn note_convert(&mut self) {
        self.counts.convert += 1;
    }

    fn set_depth(&mut self, depth: usize) {
        self.depth = depth;
    }

    fn enable_trace(&mut self) {
        self.trace = true;
    }
}

/// Backend-defined cross-type translation of a fixed-shape wire tuple.
pub trait Converter {
    /// Translate `input` into `output`. `modulus` selects wrapping
    /// semantics; exact conversion fails when the value does not fit.
    fn convert(&mut self, output: &mut [Number], input: &[Number], modulus: bool) -> Result<()>;
}

/// The stock field-to-field converter: inputs are digits of a big-endian
/// radix-`in_modulus` integer, outputs the same value in radix
/// `out_modulus`.
pub struct FieldConverter {
    out_modulus: Number,
    in_modulus: Number,
}

impl FieldConverter {
    pub fn new(out_modulus: Number, in_modulus: Number) -> Self {
        FieldConverter {
            out_modulus,
            in_modulus,
        }
    }
}

impl Converter for FieldConverter {
    fn convert(&mut self, output: &mut [Number], input: &[Number], modulus: bool) -> Result<()> {
        let mut value = Number::zero();
        for digit in input.iter() {
            ensure!(
                digit < &self.in_modulus,
                "conversion input {digit} exceeds the field modulus {}",
                self.in_modulus
            );
            value = value * &self.in_modulus + digit;
        }

        let capacity = num_traits::pow(self.out_modulus.clone(), output.len());
        if modulus {
            value %= &capacity;
        } else {
            ensure!(
                value < capacity,
                "conversion overflow: {value} does not fit {} output wire(s)",
                output.len()
            );
        }

        for slot in output.iter_mut().rev() {
            *slot = &value % &self.out_modulus;
            value /= &self.out_modulus;
        }
        Ok(())
    }
}

/// The exact-shape lookup key of a registered conversion.
pub type ConvKey = (TypeId, WireCount, TypeId, WireCount);

/// Registered converters, keyed by the exact `(out type, out length,
/// in type, in length)` tuple. Populated before evaluation and frozen
/// thereafter.
#[derive(Default)]
pub struct ConverterRegistry {
    converters: FxHashMap<ConvKey, Box<dyn Converter>>,
}

impl ConverterRegistry {
    pub fn register(&mut self, key: ConvKey, converter: Box<dyn Converter>) {
        self.converters.insert(key, converter);
    }

    pub fn contains(&self, key: &ConvKey) -> bool {
        self.converters.contains_key(key)
    }

    pub fn get_mut(&mut self, key: &ConvKey) -> Option<&mut Box<dyn Converter>> {
        self.converters.get_mut(key)
    }

    /// Build stock converters for the conversions a relation declares.
    pub fn from_specs(specs: &[ConversionSpec], types: &TypeStore) -> Result<Self> {
        let mut registry = ConverterRegistry::default();
        for spec in specs.iter() {
            let out_modulus = modulus_of(types.get(&spec.out_type)?)?;
            let in_modulus = modulus_of(types.get(&spec.in_type)?)?;
            registry.register(
                (spec.out_type, spec.out_count, spec.in_type, spec.in_count),
                Box::new(FieldConverter::new(out_modulus, in_modulus)),
            );
        }
        Ok(registry)
    }
}

fn modulus_of(spec: &TypeSpec) -> Result<Number> {
    match spec {
        TypeSpec::Field { modulus } => Ok(modulus.clone()),
        TypeSpec::Ring { bits } => Ok(Number::one() << *bits),
        TypeSpec::Plugin(plugin) => {
            bail!("conversions over plugin type {} are backend-defined", plugin.name)
        }
    }
}
