//! # Evaluator
//!
//! Runs compiled bytecode against a fact store.
//!
//! Each block is executed once per distinct environment handed over by the
//! previous stage. Choice-point instructions recurse into the rest of the
//! block once per candidate; failed tests return to the nearest choice point.
//!
//! Facts are read through the compiled query's schema: in current mode a fact
//! stored under an older version of a predicate is converted to the queried
//! version on read, with added fields backfilled. Every conversion a program
//! needs is built before the first instruction runs, so incompatible schema
//! changes fail before any result is produced.

use super::bytecode::{Insn, Operand, Program, Reg};
use super::ir::{Prim, ResultType};
use super::render::Renderer;
use super::{CompiledQuery, QueryOptions, SchemaMode};
use crate::schema::{Conversion, Schema};
use crate::store::{FactStore, StoreState};
use crate::system::Profile;
use crate::{Fact, FactDbError, FactId, PredicateRef, Value};
use serde_json::Value as Json;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

// =============================================================================
// RESULTS
// =============================================================================

/// One query result.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    /// Set when the result is a fact.
    pub id: Option<FactId>,
    pub predicate: Option<PredicateRef>,
    /// The fact's key, or the result value itself.
    pub key: Value,
    pub value: Option<Value>,
    /// `{"id", "key", "value"}` for facts, `{"key"}` otherwise.
    pub json: Json,
}

/// Everything a query produced.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResults {
    pub bindings: Vec<Binding>,
    /// More results existed beyond the limit.
    pub truncated: bool,
    /// Facts read while evaluating, including rejected candidates.
    pub facts_searched: u64,
    pub profile: Option<Profile>,
}

/// Evaluate a compiled query.
///
/// `stored` is the schema the store was built with; it describes the facts as
/// they were written.
pub fn execute(
    query: &CompiledQuery,
    store: &dyn FactStore,
    stored: &Schema,
    options: &QueryOptions,
) -> Result<QueryResults, FactDbError> {
    let started = Instant::now();
    let mut eval = Evaluator::new(query, store, stored, options.profile);

    let mut touches: BTreeSet<&PredicateRef> = query.bytecode().touches.iter().collect();
    for program in query.bytecode().derived.values() {
        touches.extend(program.touches.iter());
    }
    for predicate in touches {
        eval.prepare(predicate)?;
    }

    let (values, truncated) = eval.run(query.bytecode(), options.limit)?;
    let mut bindings = Vec::with_capacity(values.len());
    for value in values {
        bindings.push(eval.binding(query, value, options)?);
    }

    tracing::debug!(
        results = bindings.len(),
        truncated,
        facts_searched = eval.searched,
        elapsed_us = started.elapsed().as_micros() as u64,
        "query evaluated"
    );
    Ok(QueryResults {
        bindings,
        truncated,
        facts_searched: eval.searched,
        profile: eval.profile,
    })
}

// =============================================================================
// EVALUATOR
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Key and value conversion from a stored predicate to a queried one.
#[derive(Debug, Clone)]
struct FactConversion {
    key: Conversion,
    value: Conversion,
}

fn build_conversion(
    stored: &Schema,
    target: &Schema,
    mode: SchemaMode,
    from: &PredicateRef,
    to: &PredicateRef,
) -> Result<FactConversion, FactDbError> {
    if mode == SchemaMode::Stored && from == to {
        return Ok(FactConversion {
            key: Conversion::Identity,
            value: Conversion::Identity,
        });
    }
    let old = stored
        .get(from)
        .ok_or_else(|| FactDbError::type_error(format!("no stored definition of {from}")))?;
    let new = target
        .get(to)
        .ok_or_else(|| FactDbError::UnknownPredicate(to.to_string()))?;
    let convert = |a, b| {
        Conversion::new(a, b)
            .map_err(|e| FactDbError::type_error(format!("cannot read {from} as {to}: {e}")))
    };
    Ok(FactConversion {
        key: convert(&old.key_type, &new.key_type)?,
        value: convert(&old.value_type, &new.value_type)?,
    })
}

/// Registers of one execution path.
struct Frame {
    regs: Vec<Value>,
    /// Facts loaded by choice points and derefs, by register.
    facts: Vec<Option<Fact>>,
}

/// Collects the output of one block.
struct Sink {
    seen: BTreeSet<Vec<Value>>,
    out: Vec<Vec<Value>>,
    limit: Option<usize>,
    truncated: bool,
}

impl Sink {
    fn new(limit: Option<usize>) -> Self {
        Self {
            seen: BTreeSet::new(),
            out: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn barrier(&mut self, regs: &[Value], keep: &[Reg]) {
        let live: Vec<Value> = keep.iter().map(|r| regs[*r].clone()).collect();
        if self.seen.insert(live) {
            self.out.push(regs.to_vec());
        }
    }

    fn emit(&mut self, value: &Value) -> Flow {
        let key = vec![value.clone()];
        if self.seen.contains(&key) {
            return Flow::Continue;
        }
        if self.limit.is_some_and(|limit| self.out.len() >= limit) {
            self.truncated = true;
            return Flow::Stop;
        }
        self.seen.insert(key.clone());
        self.out.push(key);
        Flow::Continue
    }
}

fn loaded(frame: &Frame, src: Reg) -> Result<&Fact, FactDbError> {
    frame
        .facts
        .get(src)
        .and_then(Option::as_ref)
        .ok_or_else(|| FactDbError::Io(format!("bytecode: no fact loaded in r{src}")))
}

/// State of one query execution.
pub(crate) struct Evaluator<'a> {
    store: &'a dyn FactStore,
    stored: &'a Schema,
    target: &'a Schema,
    mode: SchemaMode,
    program: &'a Program,
    conversions: BTreeMap<(PredicateRef, PredicateRef), FactConversion>,
    /// Derived facts computed so far, by predicate.
    derived: BTreeMap<PredicateRef, Vec<FactId>>,
    overlay: BTreeMap<FactId, Fact>,
    next_ephemeral: FactId,
    searched: u64,
    profile: Option<Profile>,
}

impl<'a> Evaluator<'a> {
    fn new(query: &'a CompiledQuery, store: &'a dyn FactStore, stored: &'a Schema, profile: bool) -> Self {
        Self {
            store,
            stored,
            target: query.schema(),
            mode: query.mode(),
            program: query.bytecode(),
            conversions: BTreeMap::new(),
            derived: BTreeMap::new(),
            overlay: BTreeMap::new(),
            next_ephemeral: store.next_id(),
            searched: 0,
            profile: profile.then(Profile::default),
        }
    }

    /// The schema results are read through.
    pub(crate) fn target(&self) -> &'a Schema {
        self.target
    }

    fn examine(&mut self, predicate: &PredicateRef) {
        self.searched += 1;
        if let Some(profile) = &mut self.profile {
            profile.record(predicate);
        }
    }

    /// Stored predicates whose facts are read as `target`.
    fn sources(&self, target: &PredicateRef) -> Vec<PredicateRef> {
        match self.mode {
            SchemaMode::Stored => vec![target.clone()],
            SchemaMode::Current => self
                .store
                .predicates()
                .into_iter()
                .filter(|p| p.name == target.name && p.version <= target.version)
                .collect(),
        }
    }

    fn conversion(&mut self, from: &PredicateRef, to: &PredicateRef) -> Result<&FactConversion, FactDbError> {
        let (stored, target, mode) = (self.stored, self.target, self.mode);
        match self.conversions.entry((from.clone(), to.clone())) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => Ok(e.insert(build_conversion(stored, target, mode, from, to)?)),
        }
    }

    fn prepare(&mut self, target: &PredicateRef) -> Result<(), FactDbError> {
        for source in self.sources(target) {
            self.conversion(&source, target)?;
        }
        Ok(())
    }

    fn readable(&self, stored: &PredicateRef, target: &PredicateRef) -> bool {
        match self.mode {
            SchemaMode::Stored => stored == target,
            SchemaMode::Current => stored.name == target.name && stored.version <= target.version,
        }
    }

    fn convert(&mut self, fact: Fact, target: &PredicateRef) -> Result<Fact, FactDbError> {
        let conversion = self.conversion(&fact.predicate, target)?;
        Ok(Fact {
            id: fact.id,
            predicate: target.clone(),
            key: conversion.key.apply(fact.key)?,
            value: conversion.value.apply(fact.value)?,
        })
    }

    /// Read fact `id` as a fact of `target`. `None` if it does not exist or
    /// belongs to another predicate.
    pub(crate) fn read(&mut self, id: FactId, target: &PredicateRef) -> Result<Option<Fact>, FactDbError> {
        if let Some(fact) = self.overlay.get(&id) {
            return Ok((fact.predicate == *target).then(|| fact.clone()));
        }
        match self.store.lookup(id)? {
            Some(fact) if self.readable(&fact.predicate, target) => self.convert(fact, target).map(Some),
            _ => Ok(None),
        }
    }

    /// Read fact `id` as whichever predicate it belongs to.
    fn read_any(&mut self, id: FactId) -> Result<Option<Fact>, FactDbError> {
        if let Some(fact) = self.overlay.get(&id) {
            return Ok(Some(fact.clone()));
        }
        match self.store.lookup(id)? {
            Some(fact) => self.read_stored(fact).map(Some),
            None => Ok(None),
        }
    }

    /// Convert a stored fact to the version the query reads it as.
    fn read_stored(&mut self, fact: Fact) -> Result<Fact, FactDbError> {
        let target = match self.mode {
            SchemaMode::Stored => fact.predicate.clone(),
            SchemaMode::Current => self
                .target
                .latest(&fact.predicate.name)
                .filter(|latest| latest.version >= fact.predicate.version)
                .unwrap_or_else(|| fact.predicate.clone()),
        };
        self.convert(fact, &target)
    }

    fn scan_ids(&self, target: &PredicateRef) -> Vec<FactId> {
        let mut ids: Vec<FactId> = self
            .sources(target)
            .iter()
            .flat_map(|source| self.store.scan(source))
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Candidates for a key lookup. Sources whose key is converted on read
    /// cannot use the key index and fall back to a scan.
    fn seek_ids(&mut self, target: &PredicateRef, key: &Value) -> Result<Vec<FactId>, FactDbError> {
        let mut ids = Vec::new();
        for source in self.sources(target) {
            if self.conversion(&source, target)?.key.is_identity() {
                ids.extend(self.store.seek(&source, key)?);
            } else {
                ids.extend(self.store.scan(&source));
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Facts of a derived predicate, computed on first use.
    fn derive(&mut self, predicate: &PredicateRef) -> Result<Vec<FactId>, FactDbError> {
        if let Some(ids) = self.derived.get(predicate) {
            return Ok(ids.clone());
        }
        if self.store.state() != StoreState::Complete {
            return Err(FactDbError::Incomplete(format!(
                "derived predicate {predicate} needs a complete database"
            )));
        }
        let program: &'a Program = self.program;
        let body = program
            .derived
            .get(predicate)
            .ok_or_else(|| FactDbError::type_error(format!("no derivation compiled for {predicate}")))?;
        let (keys, _) = self.run(body, None)?;

        let mut ids = Vec::with_capacity(keys.len());
        for key in keys {
            let id = self.next_ephemeral;
            self.next_ephemeral = id.next();
            self.overlay.insert(
                id,
                Fact {
                    id,
                    predicate: predicate.clone(),
                    key,
                    value: Value::unit(),
                },
            );
            ids.push(id);
        }
        tracing::debug!(%predicate, facts = ids.len(), "derived predicate evaluated");
        self.derived.insert(predicate.clone(), ids.clone());
        Ok(ids)
    }

    /// Run every block of `program`; returns the yielded values.
    fn run(&mut self, program: &Program, limit: Option<usize>) -> Result<(Vec<Value>, bool), FactDbError> {
        let mut envs = vec![vec![Value::unit(); program.registers]];
        let last = program.blocks.len().saturating_sub(1);
        let mut sink = Sink::new(None);
        for (i, block) in program.blocks.iter().enumerate() {
            sink = Sink::new(if i == last { limit } else { None });
            for regs in envs {
                let mut frame = Frame {
                    regs,
                    facts: vec![None; program.registers],
                };
                if self.exec(&block.code, 0, &mut frame, &mut sink)? == Flow::Stop {
                    break;
                }
            }
            envs = std::mem::take(&mut sink.out);
        }
        let values = envs.into_iter().filter_map(|mut v| v.pop()).collect();
        Ok((values, sink.truncated))
    }

    /// Bind `fact` to `dst` and run the rest of the block.
    fn visit(
        &mut self,
        fact: Fact,
        dst: Reg,
        code: &[Insn],
        pc: usize,
        frame: &mut Frame,
        sink: &mut Sink,
    ) -> Result<Flow, FactDbError> {
        self.examine(&fact.predicate);
        frame.regs[dst] = Value::Fact(fact.id);
        frame.facts[dst] = Some(fact);
        self.exec(code, pc, frame, sink)
    }

    fn exec(&mut self, code: &[Insn], mut pc: usize, frame: &mut Frame, sink: &mut Sink) -> Result<Flow, FactDbError> {
        while let Some(insn) = code.get(pc) {
            pc += 1;
            match insn {
                Insn::Scan { predicate, dst } => {
                    for id in self.scan_ids(predicate) {
                        if let Some(fact) = self.read(id, predicate)? {
                            if self.visit(fact, *dst, code, pc, frame, sink)? == Flow::Stop {
                                return Ok(Flow::Stop);
                            }
                        }
                    }
                    return Ok(Flow::Continue);
                }
                Insn::Seek { predicate, key, dst } => {
                    let key = match key {
                        Operand::Const(v) => v.clone(),
                        Operand::Reg(r) => frame.regs[*r].clone(),
                    };
                    for id in self.seek_ids(predicate, &key)? {
                        let Some(fact) = self.read(id, predicate)? else {
                            continue;
                        };
                        if fact.key != key {
                            self.examine(predicate);
                            continue;
                        }
                        if self.visit(fact, *dst, code, pc, frame, sink)? == Flow::Stop {
                            return Ok(Flow::Stop);
                        }
                    }
                    return Ok(Flow::Continue);
                }
                Insn::LoadFact { id, dst } => {
                    // Derived facts have no stored siblings.
                    let (first, siblings) = match self.overlay.get(id) {
                        Some(fact) => (fact.clone(), Vec::new()),
                        None => {
                            let stored = self
                                .store
                                .lookup(*id)?
                                .ok_or_else(|| FactDbError::NotFound(format!("fact {id}")))?;
                            let siblings: Vec<FactId> = self
                                .store
                                .seek(&stored.predicate, &stored.key)?
                                .into_iter()
                                .filter(|sibling| sibling != id)
                                .collect();
                            (self.read_stored(stored)?, siblings)
                        }
                    };
                    if self.visit(first, *dst, code, pc, frame, sink)? == Flow::Stop {
                        return Ok(Flow::Stop);
                    }
                    for sibling in siblings {
                        if let Some(fact) = self.read_any(sibling)? {
                            if self.visit(fact, *dst, code, pc, frame, sink)? == Flow::Stop {
                                return Ok(Flow::Stop);
                            }
                        }
                    }
                    return Ok(Flow::Continue);
                }
                Insn::Derive { predicate, dst } => {
                    for id in self.derive(predicate)? {
                        if let Some(fact) = self.overlay.get(&id).cloned() {
                            if self.visit(fact, *dst, code, pc, frame, sink)? == Flow::Stop {
                                return Ok(Flow::Stop);
                            }
                        }
                    }
                    return Ok(Flow::Continue);
                }
                Insn::Deref { src, predicate, dst } => {
                    let Value::Fact(id) = &frame.regs[*src] else {
                        return Ok(Flow::Continue);
                    };
                    let id = *id;
                    let Some(fact) = self.read(id, predicate)? else {
                        return Ok(Flow::Continue);
                    };
                    self.examine(predicate);
                    frame.regs[*dst] = Value::Fact(id);
                    frame.facts[*dst] = Some(fact);
                }
                Insn::Key { src, dst } => {
                    let key = loaded(frame, *src)?.key.clone();
                    frame.regs[*dst] = key;
                }
                Insn::Value { src, dst } => {
                    let value = loaded(frame, *src)?.value.clone();
                    frame.regs[*dst] = value;
                }
                Insn::Field { src, index, dst } => {
                    let field = match &frame.regs[*src] {
                        Value::Record(fields) => fields.get(*index).cloned(),
                        _ => None,
                    };
                    let Some(field) = field else {
                        return Ok(Flow::Continue);
                    };
                    frame.regs[*dst] = field;
                }
                Insn::Alt { src, index, dst } => {
                    let payload = match &frame.regs[*src] {
                        Value::Alt(i, inner) if i == index => Some(inner.as_ref().clone()),
                        _ => None,
                    };
                    let Some(payload) = payload else {
                        return Ok(Flow::Continue);
                    };
                    frame.regs[*dst] = payload;
                }
                Insn::ArrayLen { src, len } => {
                    if !matches!(&frame.regs[*src], Value::Array(items) if items.len() == *len) {
                        return Ok(Flow::Continue);
                    }
                }
                Insn::Elem { src, index, dst } => {
                    let elem = match &frame.regs[*src] {
                        Value::Array(items) => items.get(*index).cloned(),
                        _ => None,
                    };
                    let Some(elem) = elem else {
                        return Ok(Flow::Continue);
                    };
                    frame.regs[*dst] = elem;
                }
                Insn::EqConst { src, value } => {
                    if frame.regs[*src] != *value {
                        return Ok(Flow::Continue);
                    }
                }
                Insn::Prefix { src, prefix } => {
                    if !matches!(&frame.regs[*src], Value::String(s) if s.starts_with(prefix.as_str())) {
                        return Ok(Flow::Continue);
                    }
                }
                Insn::EqReg { a, b } => {
                    if frame.regs[*a] != frame.regs[*b] {
                        return Ok(Flow::Continue);
                    }
                }
                Insn::Move { src, dst } => {
                    frame.regs[*dst] = frame.regs[*src].clone();
                    frame.facts[*dst] = frame.facts[*src].clone();
                }
                Insn::Const { value, dst } => frame.regs[*dst] = value.clone(),
                Insn::MakeArray { items, dst } => {
                    let array = items.iter().map(|r| frame.regs[*r].clone()).collect();
                    frame.regs[*dst] = Value::Array(array);
                }
                Insn::MakeRecord { fields, dst } => {
                    let record = fields.iter().map(|r| frame.regs[*r].clone()).collect();
                    frame.regs[*dst] = Value::Record(record);
                }
                Insn::MakeAlt { index, src, dst } => {
                    frame.regs[*dst] = Value::Alt(*index, Box::new(frame.regs[*src].clone()));
                }
                Insn::CallPrim { prim, src, dst } => {
                    frame.regs[*dst] = call_prim(*prim, &frame.regs[*src])?;
                }
                Insn::Barrier { keep } => {
                    sink.barrier(&frame.regs, keep);
                    return Ok(Flow::Continue);
                }
                Insn::Yield { src } => return Ok(sink.emit(&frame.regs[*src])),
            }
        }
        Ok(Flow::Continue)
    }

    // =========================================================================
    // RESULTS
    // =========================================================================

    fn binding(&mut self, query: &CompiledQuery, value: Value, options: &QueryOptions) -> Result<Binding, FactDbError> {
        let fact = match (&query.ir().result, &value) {
            (ResultType::Fact(p), Value::Fact(id)) => Some(
                self.read(*id, p)?
                    .ok_or_else(|| FactDbError::NotFound(format!("fact {id}")))?,
            ),
            (ResultType::AnyFact, Value::Fact(id)) => Some(
                self.read_any(*id)?
                    .ok_or_else(|| FactDbError::NotFound(format!("fact {id}")))?,
            ),
            _ => None,
        };
        let no_expand = &query.ir().no_expand;
        let mut renderer = Renderer::new(self, &options.expand, no_expand);
        match fact {
            Some(fact) => {
                let json = renderer.fact(&fact)?;
                Ok(Binding {
                    id: Some(fact.id),
                    predicate: Some(fact.predicate.clone()),
                    value: fact.value().cloned(),
                    key: fact.key,
                    json,
                })
            }
            None => {
                let ResultType::Value(ty) = &query.ir().result else {
                    return Err(FactDbError::type_error(format!("expected a fact result, found {value}")));
                };
                let json = renderer.value(&value, ty)?;
                Ok(Binding {
                    id: None,
                    predicate: None,
                    key: value,
                    value: None,
                    json,
                })
            }
        }
    }
}

fn call_prim(prim: Prim, arg: &Value) -> Result<Value, FactDbError> {
    match (prim, arg) {
        (Prim::ToLower, Value::String(s)) => Ok(Value::String(s.to_lowercase())),
        (Prim::ToUpper, Value::String(s)) => Ok(Value::String(s.to_uppercase())),
        (Prim::Length, Value::Array(items)) => Ok(Value::Nat(items.len() as u64)),
        _ => Err(FactDbError::type_error(format!(
            "prim.{} cannot be applied to {}",
            prim.name(),
            arg.kind()
        ))),
    }
}

// =============================================================================
// TESTS
// =============================================================================
