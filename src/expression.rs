//! Expression cells and their evaluation.
//!
//! Construct payloads are chains of expression cells kept in an
//! [`ExpressionArena`]. A cell has an optional argument list and an optional
//! next sibling, both given as [`ExprId`]s into the same arena. Callers build
//! payloads from the owned [`Expr`] tree form and get the same form back with
//! [`ExpressionArena::tree`].

use std::fmt;

use serde::Serialize;

use crate::error::{ImageError, Result};
use crate::symbol::{SymbolId, SymbolTable};

// ------------- Function -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    Add,
    Subtract,
    Multiply,
    StrCat,
}

impl Function {
    pub const ALL: [Function; 4] = [Function::Add, Function::Subtract, Function::Multiply, Function::StrCat];

    pub fn name(&self) -> &'static str {
        match self {
            Function::Add => "+",
            Function::Subtract => "-",
            Function::Multiply => "*",
            Function::StrCat => "str-cat",
        }
    }
    pub fn from_name(name: &str) -> Option<Function> {
        Self::ALL.iter().copied().find(|f| f.name() == name)
    }
}

// ------------- Values -------------
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Value {
    Symbol(String),
    Str(String),
    Integer(i64),
    Float(f64),
}
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Symbol(s) => write!(f, "{}", s),
            Value::Str(s) => write!(f, "\"{}\"", s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{:?}", x),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fact {
    pub relation: String,
    pub fields: Vec<Value>,
}
impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}", self.relation)?;
        for field in &self.fields {
            write!(f, " {}", field)?;
        }
        write!(f, ")")
    }
}

// ------------- Expr -------------
/// Owned form of an expression, used to define payloads and to inspect them.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Symbol(String),
    Str(String),
    Integer(i64),
    Float(f64),
    Call(Function, Vec<Expr>),
    Fact(String, Vec<Expr>),
}

impl Expr {
    pub fn symbol(name: &str) -> Expr {
        Expr::Symbol(name.to_owned())
    }
    pub fn string(text: &str) -> Expr {
        Expr::Str(text.to_owned())
    }
    pub fn fact(relation: &str, fields: Vec<Expr>) -> Expr {
        Expr::Fact(relation.to_owned(), fields)
    }
}

// ------------- Cells -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExprId(u32);

impl ExprId {
    pub fn new(index: usize) -> Self {
        Self(index as u32)
    }
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExprKind {
    Symbol(SymbolId),
    Str(SymbolId),
    Integer(i64),
    Float(f64),
    Call(Function),
    Fact(SymbolId),
}

impl ExprKind {
    /// The interned atom this cell holds a reference to, if any.
    pub fn symbol(&self) -> Option<SymbolId> {
        match self {
            ExprKind::Symbol(s) | ExprKind::Str(s) | ExprKind::Fact(s) => Some(*s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExprNode {
    pub kind: ExprKind,
    pub arg_list: Option<ExprId>,
    pub next_arg: Option<ExprId>,
}

/// Deepest argument nesting a chain may have. Every walk over the arena
/// recurses once per level, so this bounds their stack use.
pub const MAX_EXPRESSION_DEPTH: usize = 256;

/// Argument nesting of a chain; a chain of atoms has depth 1.
fn nesting(chain: &[Expr]) -> usize {
    let mut deepest = 0;
    let mut pending: Vec<(&[Expr], usize)> = vec![(chain, 1)];
    while let Some((chain, depth)) = pending.pop() {
        for expr in chain {
            deepest = deepest.max(depth);
            if let Expr::Call(_, args) | Expr::Fact(_, args) = expr {
                pending.push((args.as_slice(), depth + 1));
            }
        }
    }
    deepest
}

#[derive(Debug, Default)]
pub struct ExpressionArena {
    nodes: Vec<Option<ExprNode>>,
    free: Vec<usize>,
}

impl ExpressionArena {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn get(&self, id: ExprId) -> Option<&ExprNode> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }
    fn node(&self, id: ExprId) -> Result<&ExprNode> {
        self.get(id)
            .ok_or_else(|| ImageError::Invariant(format!("dangling expression reference {}", id.index())))
    }
    fn allocate(&mut self, node: ExprNode) -> ExprId {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                ExprId::new(slot)
            }
            None => {
                self.nodes.push(Some(node));
                ExprId::new(self.nodes.len() - 1)
            }
        }
    }
    /// Number of slots, including freed ones.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
    /// Installs a chain of expressions, retaining every atom it references.
    pub fn install(&mut self, symbols: &mut SymbolTable, chain: &[Expr]) -> Result<Option<ExprId>> {
        let depth = nesting(chain);
        if depth > MAX_EXPRESSION_DEPTH {
            return Err(ImageError::Evaluation(format!(
                "expression nests {} levels deep, the limit is {}",
                depth, MAX_EXPRESSION_DEPTH
            )));
        }
        self.install_chain(symbols, chain)
    }
    fn install_chain(&mut self, symbols: &mut SymbolTable, chain: &[Expr]) -> Result<Option<ExprId>> {
        let mut first = None;
        let mut previous: Option<ExprId> = None;
        for expr in chain {
            let (kind, args): (ExprKind, &[Expr]) = match expr {
                Expr::Symbol(s) => (ExprKind::Symbol(symbols.add_retained(s)), &[][..]),
                Expr::Str(s) => (ExprKind::Str(symbols.add_retained(s)), &[][..]),
                Expr::Integer(i) => (ExprKind::Integer(*i), &[][..]),
                Expr::Float(x) => (ExprKind::Float(*x), &[][..]),
                Expr::Call(function, args) => (ExprKind::Call(*function), args.as_slice()),
                Expr::Fact(relation, fields) => (ExprKind::Fact(symbols.add_retained(relation)), fields.as_slice()),
            };
            let arg_list = self.install_chain(symbols, args)?;
            let id = self.allocate(ExprNode { kind, arg_list, next_arg: None });
            match previous {
                Some(p) => {
                    if let Some(Some(node)) = self.nodes.get_mut(p.index()) {
                        node.next_arg = Some(id);
                    }
                }
                None => first = Some(id),
            }
            previous = Some(id);
        }
        Ok(first)
    }
    /// Frees a chain and gives back the atom references it held.
    pub fn release(&mut self, symbols: &mut SymbolTable, root: Option<ExprId>) {
        let mut current = root;
        while let Some(id) = current {
            let Some(node) = self.nodes.get_mut(id.index()).and_then(Option::take) else {
                return;
            };
            if let Some(symbol) = node.kind.symbol() {
                symbols.release(symbol);
            }
            self.release(symbols, node.arg_list);
            self.free.push(id.index());
            current = node.next_arg;
        }
    }
    /// Appends a block of cells that already reference each other by absolute id.
    /// Returns the first slot of the block.
    pub fn append_block(&mut self, block: Vec<ExprNode>) -> usize {
        let base = self.nodes.len();
        self.nodes.extend(block.into_iter().map(Some));
        base
    }
    /// Drops every slot from `base` on, releasing the atoms held there.
    pub fn truncate(&mut self, symbols: &mut SymbolTable, base: usize) {
        for node in self.nodes.drain(base.min(self.nodes.len())..).flatten() {
            if let Some(symbol) = node.kind.symbol() {
                symbols.release(symbol);
            }
        }
        self.free.retain(|slot| *slot < base);
    }
    /// Drops every slot without touching reference counts.
    pub fn discard_from(&mut self, base: usize) {
        self.nodes.truncate(base);
        self.free.retain(|slot| *slot < base);
    }
    /// Number of cells in a chain, counting nested argument lists.
    pub fn size(&self, root: Option<ExprId>) -> usize {
        let mut total = 0;
        let mut current = root;
        while let Some(node) = current.and_then(|id| self.get(id)) {
            total += 1 + self.size(node.arg_list);
            current = node.next_arg;
        }
        total
    }
    /// Visits every cell of a chain in prefix order.
    pub fn visit(&self, root: Option<ExprId>, visitor: &mut impl FnMut(&ExprNode)) {
        let mut current = root;
        while let Some(node) = current.and_then(|id| self.get(id)) {
            visitor(node);
            self.visit(node.arg_list, visitor);
            current = node.next_arg;
        }
    }
    /// Rebuilds the owned form of a chain.
    pub fn tree(&self, symbols: &SymbolTable, root: Option<ExprId>) -> Result<Vec<Expr>> {
        let mut chain = Vec::new();
        let mut current = root;
        while let Some(id) = current {
            let node = self.node(id)?;
            let name = |s: SymbolId| -> Result<String> {
                symbols
                    .name(s)
                    .map(str::to_owned)
                    .ok_or_else(|| ImageError::Invariant(format!("unknown symbol {}", s)))
            };
            chain.push(match node.kind {
                ExprKind::Symbol(s) => Expr::Symbol(name(s)?),
                ExprKind::Str(s) => Expr::Str(name(s)?),
                ExprKind::Integer(i) => Expr::Integer(i),
                ExprKind::Float(x) => Expr::Float(x),
                ExprKind::Call(function) => Expr::Call(function, self.tree(symbols, node.arg_list)?),
                ExprKind::Fact(s) => Expr::Fact(name(s)?, self.tree(symbols, node.arg_list)?),
            });
            current = node.next_arg;
        }
        Ok(chain)
    }

    // ------------- Evaluation -------------
    pub fn evaluate(&self, symbols: &SymbolTable, id: ExprId) -> Result<Value> {
        let node = self.node(id)?;
        let name = |s: SymbolId| -> Result<String> {
            symbols
                .name(s)
                .map(str::to_owned)
                .ok_or_else(|| ImageError::Evaluation(format!("unknown symbol {}", s)))
        };
        match node.kind {
            ExprKind::Symbol(s) => Ok(Value::Symbol(name(s)?)),
            ExprKind::Str(s) => Ok(Value::Str(name(s)?)),
            ExprKind::Integer(i) => Ok(Value::Integer(i)),
            ExprKind::Float(x) => Ok(Value::Float(x)),
            ExprKind::Call(function) => {
                let args = self.evaluate_chain(symbols, node.arg_list)?;
                apply(function, args)
            }
            ExprKind::Fact(s) => Err(ImageError::Evaluation(format!(
                "fact pattern ({} ...) is not a value",
                name(s)?
            ))),
        }
    }
    fn evaluate_chain(&self, symbols: &SymbolTable, root: Option<ExprId>) -> Result<Vec<Value>> {
        let mut values = Vec::new();
        let mut current = root;
        while let Some(id) = current {
            values.push(self.evaluate(symbols, id)?);
            current = self.node(id)?.next_arg;
        }
        Ok(values)
    }
    /// Evaluates an assertion list into the facts it describes.
    pub fn facts(&self, symbols: &SymbolTable, root: Option<ExprId>) -> Result<Vec<Fact>> {
        let mut facts = Vec::new();
        let mut current = root;
        while let Some(id) = current {
            let node = self.node(id)?;
            let ExprKind::Fact(relation) = node.kind else {
                return Err(ImageError::Evaluation(String::from("assertion list holds a non-fact expression")));
            };
            let relation = symbols
                .name(relation)
                .ok_or_else(|| ImageError::Evaluation(format!("unknown symbol {}", relation)))?
                .to_owned();
            facts.push(Fact { relation, fields: self.evaluate_chain(symbols, node.arg_list)? });
            current = node.next_arg;
        }
        Ok(facts)
    }
}

fn apply(function: Function, args: Vec<Value>) -> Result<Value> {
    match function {
        Function::StrCat => {
            let mut text = String::new();
            for arg in args {
                match arg {
                    Value::Symbol(s) | Value::Str(s) => text.push_str(&s),
                    other => text.push_str(&other.to_string()),
                }
            }
            Ok(Value::Str(text))
        }
        Function::Add | Function::Subtract | Function::Multiply => {
            let mut iter = args.into_iter();
            let mut acc = match iter.next() {
                Some(first) => number(function, first)?,
                None if function == Function::Multiply => Number::Integer(1),
                None => Number::Integer(0),
            };
            for arg in iter {
                let rhs = number(function, arg)?;
                acc = match function {
                    Function::Add => acc.combine(rhs, i64::checked_add, |a, b| a + b),
                    Function::Subtract => acc.combine(rhs, i64::checked_sub, |a, b| a - b),
                    _ => acc.combine(rhs, i64::checked_mul, |a, b| a * b),
                }
                .ok_or_else(|| ImageError::Evaluation(format!("integer overflow in ({} ...)", function.name())))?;
            }
            Ok(match acc {
                Number::Integer(i) => Value::Integer(i),
                Number::Float(x) => Value::Float(x),
            })
        }
    }
}

#[derive(Clone, Copy)]
enum Number {
    Integer(i64),
    Float(f64),
}

impl Number {
    fn as_float(self) -> f64 {
        match self {
            Number::Integer(i) => i as f64,
            Number::Float(x) => x,
        }
    }
    fn combine(self, rhs: Number, int: fn(i64, i64) -> Option<i64>, float: fn(f64, f64) -> f64) -> Option<Number> {
        match (self, rhs) {
            (Number::Integer(a), Number::Integer(b)) => int(a, b).map(Number::Integer),
            (a, b) => Some(Number::Float(float(a.as_float(), b.as_float()))),
        }
    }
}

fn number(function: Function, value: Value) -> Result<Number> {
    match value {
        Value::Integer(i) => Ok(Number::Integer(i)),
        Value::Float(x) => Ok(Number::Float(x)),
        other => Err(ImageError::Evaluation(format!(
            "({} ...) expects numbers, got {}",
            function.name(),
            other
        ))),
    }
}
