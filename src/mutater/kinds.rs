//! The closed set of mutation kinds and their opcode tables.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::classfile::opcode::*;

/// One kind of bytecode edit. The declaration order here is the tie-break
/// order when several kinds apply at one bytecode offset, so reordering
/// variants changes every mutation index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationKind {
    /// Flip a conditional branch predicate.
    NegateConditional,
    /// Swap an arithmetic operator for its opposite.
    SwapArith,
    /// Negate the constant of an in-place increment.
    Increments,
    /// Alter the value produced immediately before a return.
    ReturnValues,
    /// Perturb a small integer literal in the instruction stream.
    InlineConstants,
    /// Perturb a pool constant referenced only by the mutated method.
    ConstantPool,
    /// Rewire a jump-table target.
    Switch,
    /// Redirect a local-variable store to an adjacent slot.
    Stores,
}

impl MutationKind {
    pub const ALL: [MutationKind; 8] = [
        MutationKind::NegateConditional,
        MutationKind::SwapArith,
        MutationKind::Increments,
        MutationKind::ReturnValues,
        MutationKind::InlineConstants,
        MutationKind::ConstantPool,
        MutationKind::Switch,
        MutationKind::Stores,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MutationKind::NegateConditional => "negate-conditional",
            MutationKind::SwapArith => "swap-arith",
            MutationKind::Increments => "increments",
            MutationKind::ReturnValues => "return-values",
            MutationKind::InlineConstants => "inline-constants",
            MutationKind::ConstantPool => "constant-pool",
            MutationKind::Switch => "switch",
            MutationKind::Stores => "stores",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MutationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MutationKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| format!("unknown mutation kind: {s}"))
    }
}

/// Set of enabled kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindSet {
    bits: u8,
}

impl KindSet {
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    pub fn all() -> Self {
        let mut set = Self::empty();
        for kind in MutationKind::ALL {
            set.enable(kind);
        }
        set
    }

    /// The always-on default: conditionals and arithmetic.
    pub fn baseline() -> Self {
        let mut set = Self::empty();
        set.enable(MutationKind::NegateConditional);
        set.enable(MutationKind::SwapArith);
        set
    }

    pub fn enable(&mut self, kind: MutationKind) {
        self.bits |= 1 << kind as u8;
    }

    pub fn contains(&self, kind: MutationKind) -> bool {
        self.bits & (1 << kind as u8) != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = MutationKind> + '_ {
        MutationKind::ALL.into_iter().filter(|kind| self.contains(*kind))
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }
}

impl Default for KindSet {
    fn default() -> Self {
        Self::baseline()
    }
}

impl fmt::Display for KindSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(MutationKind::name).collect();
        f.write_str(&names.join(","))
    }
}

impl FromStr for KindSet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = KindSet::empty();
        for part in s.split(',').filter(|part| !part.is_empty()) {
            set.enable(part.parse()?);
        }
        Ok(set)
    }
}

/// Logical inverse of a conditional branch opcode.
pub(crate) fn negated_branch(op: u8) -> Option<u8> {
    Some(match op {
        IFEQ => IFNE,
        IFNE => IFEQ,
        IFLT => IFGE,
        IFGE => IFLT,
        IFGT => IFLE,
        IFLE => IFGT,
        IF_ICMPEQ => IF_ICMPNE,
        IF_ICMPNE => IF_ICMPEQ,
        IF_ICMPLT => IF_ICMPGE,
        IF_ICMPGE => IF_ICMPLT,
        IF_ICMPGT => IF_ICMPLE,
        IF_ICMPLE => IF_ICMPGT,
        IF_ACMPEQ => IF_ACMPNE,
        IF_ACMPNE => IF_ACMPEQ,
        IFNULL => IFNONNULL,
        IFNONNULL => IFNULL,
        _ => return None,
    })
}

/// Opposite arithmetic operator. Where an opcode belongs to two pairs the
/// earlier pair wins, so enumeration stays deterministic.
pub(crate) fn swapped_arith(op: u8) -> Option<u8> {
    Some(match op {
        IADD => ISUB,
        LADD => LSUB,
        FADD => FSUB,
        DADD => DSUB,
        ISUB => IADD,
        LSUB => LADD,
        FSUB => FADD,
        DSUB => DADD,
        IMUL => IDIV,
        LMUL => LDIV,
        FMUL => FDIV,
        DMUL => DDIV,
        IDIV => IMUL,
        LDIV => LMUL,
        FDIV => FMUL,
        DDIV => DMUL,
        IREM => IMUL,
        LREM => LMUL,
        FREM => FMUL,
        DREM => DMUL,
        ISHL => ISHR,
        LSHL => LSHR,
        ISHR => ISHL,
        LSHR => LSHL,
        IUSHR => ISHL,
        LUSHR => LSHL,
        IAND => IOR,
        LAND => LOR,
        IOR => IAND,
        LOR => LAND,
        IXOR => IOR,
        LXOR => LOR,
        _ => return None,
    })
}

/// Adjacent-set perturbation for the 1-byte small-int constants:
/// 0 -> 1, 1 -> 0, n -> n+1, wrapping 5 back to -1.
pub(crate) fn perturbed_iconst(op: u8) -> Option<(u8, i32, i32)> {
    Some(match op {
        ICONST_M1 => (ICONST_0, -1, 0),
        ICONST_0 => (ICONST_1, 0, 1),
        ICONST_1 => (ICONST_0, 1, 0),
        ICONST_2 => (ICONST_3, 2, 3),
        ICONST_3 => (ICONST_4, 3, 4),
        ICONST_4 => (ICONST_5, 4, 5),
        ICONST_5 => (ICONST_M1, 5, -1),
        _ => return None,
    })
}
