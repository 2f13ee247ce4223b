//! # Code Generation
//!
//! Lowers typed IR to bytecode. Variable `i` lives in register `i`; each
//! stage allocates its temporaries above the variables. Codegen is total:
//! anything that typechecked compiles.

use super::bytecode::{Block, Insn, Operand, Program, Reg};
use super::ir::{Ir, IrSource, IrStage, TExpr, TPat, VarId};
use crate::{FactId, PredicateRef};
use std::collections::{BTreeMap, BTreeSet};

/// Compile a typechecked query, including its derived predicates.
#[must_use]
pub fn codegen(ir: &Ir) -> Program {
    let mut program = lower(ir);
    program.derived = ir
        .derived
        .iter()
        .map(|(predicate, body)| (predicate.clone(), lower(body)))
        .collect();
    program
}

fn lower(ir: &Ir) -> Program {
    let mut lowering = Gen {
        registers: ir.vars.len(),
        next: ir.vars.len(),
        code: Vec::new(),
        touches: BTreeSet::new(),
    };
    let mut blocks = Vec::with_capacity(ir.stages.len());
    for (i, stage) in ir.stages.iter().enumerate() {
        lowering.next = ir.vars.len();
        let out = lowering.stage(stage);
        if i + 1 == ir.stages.len() {
            lowering.emit(Insn::Yield { src: out });
        } else {
            lowering.emit(Insn::Barrier {
                keep: live_after(&ir.stages, i),
            });
        }
        blocks.push(Block {
            code: std::mem::take(&mut lowering.code),
        });
    }
    Program {
        registers: lowering.registers,
        blocks,
        derived: BTreeMap::new(),
        touches: lowering.touches,
    }
}

/// Variables bound in stages `..=i` that stages after `i` read.
fn live_after(stages: &[IrStage], i: usize) -> Vec<Reg> {
    let mut bound = BTreeSet::new();
    for stage in &stages[..=i] {
        visit_stage(stage, &mut |v, binds| {
            if binds {
                bound.insert(v);
            }
        });
    }
    let mut used = BTreeSet::new();
    for stage in &stages[i + 1..] {
        visit_stage(stage, &mut |v, _| {
            used.insert(v);
        });
    }
    bound.intersection(&used).copied().collect()
}

fn visit_stage(stage: &IrStage, f: &mut impl FnMut(VarId, bool)) {
    match &stage.source {
        IrSource::Facts { key, value, .. } => {
            visit_pat(key, f);
            visit_pat(value, f);
        }
        IrSource::Prim { arg, .. } | IrSource::Expr(arg) => visit_expr(arg, f),
        IrSource::FactId(_) => {}
    }
    visit_pat(&stage.bind, f);
}

fn visit_pat(pat: &TPat, f: &mut impl FnMut(VarId, bool)) {
    match pat {
        TPat::Bind(v) => f(*v, true),
        TPat::Same(v) => f(*v, false),
        TPat::Array(items) => items.iter().for_each(|p| visit_pat(p, f)),
        TPat::Record(_, fields) => fields.iter().for_each(|(_, p)| visit_pat(p, f)),
        TPat::Alt(_, inner) => visit_pat(inner, f),
        TPat::Deref { key, .. } => visit_pat(key, f),
        TPat::Wild | TPat::Lit(_) | TPat::Prefix(_) => {}
    }
}

fn visit_expr(expr: &TExpr, f: &mut impl FnMut(VarId, bool)) {
    match expr {
        TExpr::Var(v) => f(*v, false),
        TExpr::Array(items) | TExpr::Record(items) => items.iter().for_each(|e| visit_expr(e, f)),
        TExpr::Alt(_, inner) => visit_expr(inner, f),
        TExpr::Lit(_) => {}
    }
}

struct Gen {
    registers: usize,
    next: Reg,
    code: Vec<Insn>,
    touches: BTreeSet<PredicateRef>,
}

impl Gen {
    fn emit(&mut self, insn: Insn) {
        self.code.push(insn);
    }

    fn temp(&mut self) -> Reg {
        let r = self.next;
        self.next += 1;
        self.registers = self.registers.max(self.next);
        r
    }

    /// Emit one stage; returns the register holding the stage's output.
    fn stage(&mut self, stage: &IrStage) -> Reg {
        let out = match &stage.source {
            IrSource::Facts {
                predicate,
                derived: true,
                key,
                ..
            } => {
                let dst = self.temp();
                self.emit(Insn::Derive {
                    predicate: predicate.clone(),
                    dst,
                });
                self.match_key(dst, key);
                dst
            }
            IrSource::Facts {
                predicate,
                derived: false,
                key,
                value,
            } => {
                self.touches.insert(predicate.clone());
                match key.as_expr() {
                    Some(expr) => {
                        let key = match expr.constant() {
                            Some(value) => Operand::Const(value),
                            None => Operand::Reg(self.build(&expr)),
                        };
                        let dst = self.temp();
                        self.emit(Insn::Seek {
                            predicate: predicate.clone(),
                            key,
                            dst,
                        });
                        self.match_value(dst, value);
                        dst
                    }
                    None => {
                        let dst = self.temp();
                        self.emit(Insn::Scan {
                            predicate: predicate.clone(),
                            dst,
                        });
                        self.match_key(dst, key);
                        self.match_value(dst, value);
                        dst
                    }
                }
            }
            IrSource::FactId(id) => {
                let dst = self.temp();
                self.emit(Insn::LoadFact { id: FactId(*id), dst });
                dst
            }
            IrSource::Prim { prim, arg } => {
                let src = self.build(arg);
                let dst = self.temp();
                self.emit(Insn::CallPrim { prim: *prim, src, dst });
                dst
            }
            IrSource::Expr(expr) => self.build(expr),
        };
        self.matches(out, &stage.bind);
        out
    }

    fn match_key(&mut self, fact: Reg, key: &TPat) {
        if *key != TPat::Wild {
            let k = self.temp();
            self.emit(Insn::Key { src: fact, dst: k });
            self.matches(k, key);
        }
    }

    fn match_value(&mut self, fact: Reg, value: &TPat) {
        if *value != TPat::Wild {
            let v = self.temp();
            self.emit(Insn::Value { src: fact, dst: v });
            self.matches(v, value);
        }
    }

    /// Emit tests matching the value in `src` against `pat`.
    fn matches(&mut self, src: Reg, pat: &TPat) {
        match pat {
            TPat::Wild => {}
            TPat::Bind(v) => {
                if *v != src {
                    self.emit(Insn::Move { src, dst: *v });
                }
            }
            TPat::Same(v) => self.emit(Insn::EqReg { a: src, b: *v }),
            TPat::Lit(value) => self.emit(Insn::EqConst {
                src,
                value: value.clone(),
            }),
            TPat::Prefix(prefix) => self.emit(Insn::Prefix {
                src,
                prefix: prefix.clone(),
            }),
            TPat::Array(items) => {
                self.emit(Insn::ArrayLen { src, len: items.len() });
                for (index, item) in items.iter().enumerate() {
                    if *item != TPat::Wild {
                        let dst = self.temp();
                        self.emit(Insn::Elem { src, index, dst });
                        self.matches(dst, item);
                    }
                }
            }
            TPat::Record(_, fields) => {
                for (index, field) in fields {
                    if *field != TPat::Wild {
                        let dst = self.temp();
                        self.emit(Insn::Field {
                            src,
                            index: *index,
                            dst,
                        });
                        self.matches(dst, field);
                    }
                }
            }
            TPat::Alt(index, inner) => {
                let dst = self.temp();
                self.emit(Insn::Alt {
                    src,
                    index: *index,
                    dst,
                });
                self.matches(dst, inner);
            }
            TPat::Deref { predicate, key } => {
                self.touches.insert(predicate.clone());
                let dst = self.temp();
                self.emit(Insn::Deref {
                    src,
                    predicate: predicate.clone(),
                    dst,
                });
                self.match_key(dst, key);
            }
        }
    }

    /// Emit code computing `expr`; returns its register.
    fn build(&mut self, expr: &TExpr) -> Reg {
        match expr {
            TExpr::Var(v) => *v,
            TExpr::Lit(value) => {
                let dst = self.temp();
                self.emit(Insn::Const {
                    value: value.clone(),
                    dst,
                });
                dst
            }
            TExpr::Array(items) => {
                let items = items.iter().map(|e| self.build(e)).collect();
                let dst = self.temp();
                self.emit(Insn::MakeArray { items, dst });
                dst
            }
            TExpr::Record(fields) => {
                let fields = fields.iter().map(|e| self.build(e)).collect();
                let dst = self.temp();
                self.emit(Insn::MakeRecord { fields, dst });
                dst
            }
            TExpr::Alt(index, inner) => {
                let src = self.build(inner);
                let dst = self.temp();
                self.emit(Insn::MakeAlt { index: *index, src, dst });
                dst
            }
        }
    }
}
