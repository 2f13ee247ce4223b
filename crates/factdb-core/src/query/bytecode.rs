//! # Bytecode
//!
//! Register-machine instructions executed by the evaluator.
//!
//! A [`Program`] is one [`Block`] per pipeline stage. Source instructions
//! (`Scan`, `Seek`, `LoadFact`, `Derive`) are choice points: the rest of the
//! block runs once per candidate. Test instructions backtrack to the nearest
//! choice point when they fail. A block ends with either a `Barrier`, which
//! hands the live registers to the next stage, or a `Yield`.

use super::ir::Prim;
use crate::{FactId, PredicateRef, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A register index.
pub type Reg = usize;

/// A constant or a register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    Const(Value),
    Reg(Reg),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Const(v) => write!(f, "{v}"),
            Self::Reg(r) => write!(f, "r{r}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Insn {
    // Choice points
    /// Every fact of `predicate`; `dst` receives the fact.
    Scan { predicate: PredicateRef, dst: Reg },
    /// Facts of `predicate` whose key equals `key`.
    Seek {
        predicate: PredicateRef,
        key: Operand,
        dst: Reg,
    },
    /// The fact `id`, then facts of the same predicate and key.
    LoadFact { id: FactId, dst: Reg },
    /// Every fact of a derived predicate.
    Derive { predicate: PredicateRef, dst: Reg },

    // Facts
    /// Load the fact referenced by `src` as `predicate`; fails if absent.
    Deref {
        src: Reg,
        predicate: PredicateRef,
        dst: Reg,
    },
    /// Key of the fact loaded in `src`.
    Key { src: Reg, dst: Reg },
    /// Value of the fact loaded in `src`.
    Value { src: Reg, dst: Reg },

    // Destructuring
    Field { src: Reg, index: usize, dst: Reg },
    /// Fails unless `src` holds alternative `index`; `dst` gets its payload.
    Alt { src: Reg, index: u32, dst: Reg },
    /// Fails unless `src` is an array of exactly `len` elements.
    ArrayLen { src: Reg, len: usize },
    Elem { src: Reg, index: usize, dst: Reg },

    // Tests
    EqConst { src: Reg, value: Value },
    Prefix { src: Reg, prefix: String },
    EqReg { a: Reg, b: Reg },

    // Construction
    Move { src: Reg, dst: Reg },
    Const { value: Value, dst: Reg },
    MakeArray { items: Vec<Reg>, dst: Reg },
    MakeRecord { fields: Vec<Reg>, dst: Reg },
    MakeAlt { index: u32, src: Reg, dst: Reg },
    CallPrim { prim: Prim, src: Reg, dst: Reg },

    // Stage boundaries
    /// End of a stage; `keep` are the registers later stages read.
    Barrier { keep: Vec<Reg> },
    /// End of the last stage; emit `src`.
    Yield { src: Reg },
}

fn regs(f: &mut fmt::Formatter<'_>, regs: &[Reg]) -> fmt::Result {
    for (i, r) in regs.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "r{r}")?;
    }
    Ok(())
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scan { predicate, dst } => write!(f, "scan {predicate} -> r{dst}"),
            Self::Seek { predicate, key, dst } => write!(f, "seek {predicate} {key} -> r{dst}"),
            Self::LoadFact { id, dst } => write!(f, "load ${id} -> r{dst}"),
            Self::Derive { predicate, dst } => write!(f, "derive {predicate} -> r{dst}"),
            Self::Deref { src, predicate, dst } => write!(f, "deref r{src} as {predicate} -> r{dst}"),
            Self::Key { src, dst } => write!(f, "key r{src} -> r{dst}"),
            Self::Value { src, dst } => write!(f, "value r{src} -> r{dst}"),
            Self::Field { src, index, dst } => write!(f, "field r{src}.{index} -> r{dst}"),
            Self::Alt { src, index, dst } => write!(f, "alt r{src}#{index} -> r{dst}"),
            Self::ArrayLen { src, len } => write!(f, "arraylen r{src} == {len}"),
            Self::Elem { src, index, dst } => write!(f, "elem r{src}[{index}] -> r{dst}"),
            Self::EqConst { src, value } => write!(f, "eq r{src} {value}"),
            Self::Prefix { src, prefix } => write!(f, "prefix r{src} {prefix:?}"),
            Self::EqReg { a, b } => write!(f, "eq r{a} r{b}"),
            Self::Move { src, dst } => write!(f, "move r{src} -> r{dst}"),
            Self::Const { value, dst } => write!(f, "const {value} -> r{dst}"),
            Self::MakeArray { items, dst } => {
                write!(f, "array [")?;
                regs(f, items)?;
                write!(f, "] -> r{dst}")
            }
            Self::MakeRecord { fields, dst } => {
                write!(f, "record {{")?;
                regs(f, fields)?;
                write!(f, "}} -> r{dst}")
            }
            Self::MakeAlt { index, src, dst } => write!(f, "alt #{index} r{src} -> r{dst}"),
            Self::CallPrim { prim, src, dst } => write!(f, "prim.{} r{src} -> r{dst}", prim.name()),
            Self::Barrier { keep } => {
                write!(f, "barrier [")?;
                regs(f, keep)?;
                write!(f, "]")
            }
            Self::Yield { src } => write!(f, "yield r{src}"),
        }
    }
}

/// The code of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub code: Vec<Insn>,
}

/// A compiled query or derived-predicate body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub registers: usize,
    pub blocks: Vec<Block>,
    /// Programs producing the keys of each derived predicate used.
    pub derived: BTreeMap<PredicateRef, Program>,
    /// Stored predicates whose facts the program reads.
    pub touches: BTreeSet<PredicateRef>,
}

impl Program {
    fn write_body(&self, f: &mut fmt::Formatter<'_>, indent: &str) -> fmt::Result {
        writeln!(f, "{indent}registers: {}", self.registers)?;
        for (i, block) in self.blocks.iter().enumerate() {
            writeln!(f, "{indent}block {i}:")?;
            for (pc, insn) in block.code.iter().enumerate() {
                writeln!(f, "{indent}  {pc:>3}: {insn}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "bytecode:")?;
        self.write_body(f, "  ")?;
        for (predicate, program) in &self.derived {
            writeln!(f, "  derived {predicate}:")?;
            program.write_body(f, "    ")?;
        }
        Ok(())
    }
}
