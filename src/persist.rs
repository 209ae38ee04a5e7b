//! Binary save and load of a whole environment.
//!
//! An image is one byte stream made of shared sections (symbols, functions,
//! expression cells) followed by one storage section and one record section
//! per registered [`BinaryItem`]. Everything that points at something else
//! is written as an index into the image; loading turns those indexes back
//! into ids that are only valid for the environment doing the load.
//!
//! ```text
//! magic | version
//! [u64 bytes][u64 n]{[u32 len][utf8]}*        symbols
//! [u64 bytes][u64 n]{[u32 len][utf8]}*        functions
//! [u64 n]{kind:u8 value:u64 args:i64 next:i64}*   expression cells
//! {[name][item storage]}* "end"
//! {[name][item records]}* "end"
//! [blake3 digest of everything above]
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::construct::{ConstructId, Deffacts, Defglobal};
use crate::environment::Environment;
use crate::error::{ImageError, Result};
use crate::expression::{ExprId, ExprKind, ExprNode, ExpressionArena, Function, MAX_EXPRESSION_DEPTH};
use crate::image::{ConstructBinaryItem, ModuleBinaryItem};
use crate::symbol::{IdHasher, SymbolId, SymbolTable};

pub const BINARY_PREFIX: &[u8; 8] = b"\x01\x02\x03\x04CBIN";
pub const BINARY_VERSION: &str = "CBIN-1.0";
pub const END_MARKER: &str = "end";
pub const DIGEST_BYTES: usize = 32;
/// kind + value + arg list + next arg
pub const EXPRESSION_RECORD_BYTES: u64 = 1 + 8 + 8 + 8;
/// Index written for "no such thing".
pub const NO_INDEX: i64 = -1;

// ------------- Writer -------------
#[derive(Debug, Default)]
pub struct ImageWriter {
    buffer: Vec<u8>,
}

impl ImageWriter {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }
    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }
    pub fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }
    pub fn write_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }
    pub fn write_str(&mut self, text: &str) {
        self.write_u32(text.len() as u32);
        self.write_bytes(text.as_bytes());
    }
    pub fn len(&self) -> usize {
        self.buffer.len()
    }
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
    /// Checks that what was written since `start` matches the announced size.
    pub fn expect_written(&self, start: usize, space: u64, what: &str) -> Result<()> {
        let written = (self.buffer.len() - start) as u64;
        if written != space {
            return Err(ImageError::Invariant(format!(
                "{} announced {} bytes but wrote {}",
                what, space, written
            )));
        }
        Ok(())
    }
}

/// Byte size of a length-prefixed string.
pub fn str_space(text: &str) -> u64 {
    4 + text.len() as u64
}

// ------------- Reader -------------
#[derive(Debug, Clone)]
pub struct ImageReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> ImageReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }
    pub fn position(&self) -> usize {
        self.position
    }
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }
    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        if count > self.remaining() {
            return Err(ImageError::corrupt(format!(
                "needed {} bytes at offset {} but only {} remain",
                count,
                self.position,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }
    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.read_bytes(N)?);
        Ok(array)
    }
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }
    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }
    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }
    pub fn read_str(&mut self) -> Result<&'a str> {
        let length = self.read_u32()? as usize;
        std::str::from_utf8(self.read_bytes(length)?)
            .map_err(|e| ImageError::corrupt(format!("string at offset {} is not utf-8: {}", self.position, e)))
    }
    /// Reads a u64 byte-count prefix and returns a reader bounded to that many bytes.
    pub fn section(&mut self) -> Result<ImageReader<'a>> {
        let space = self.read_u64()?;
        let space = usize::try_from(space)
            .map_err(|_| ImageError::corrupt(format!("section size {} does not fit in memory", space)))?;
        Ok(ImageReader::new(self.read_bytes(space)?))
    }
    /// With `strict`, fails if the section holds bytes nobody read.
    pub fn finish(&self, strict: bool, what: &str) -> Result<()> {
        if strict && self.remaining() != 0 {
            return Err(ImageError::corrupt(format!(
                "{} section has {} unread bytes",
                what,
                self.remaining()
            )));
        }
        Ok(())
    }
}

/// Turns an image index back into a position below `limit`; `-1` means none.
pub fn decode_index(raw: i64, limit: usize, what: &str) -> Result<Option<usize>> {
    if raw == NO_INDEX {
        return Ok(None);
    }
    match usize::try_from(raw) {
        Ok(index) if index < limit => Ok(Some(index)),
        _ => Err(ImageError::corrupt(format!(
            "{} index {} is outside 0..{}",
            what, raw, limit
        ))),
    }
}

// ------------- Save context -------------
/// Dense numbering of one construct kind for one save.
#[derive(Debug, Default, Clone)]
pub struct KindIndex {
    pub instances: u64,
    pub modules: u64,
    pub expression_cells: u64,
    dense: HashMap<ConstructId, u32, IdHasher>,
}

impl KindIndex {
    pub fn index_of(&self, id: ConstructId) -> Option<u32> {
        self.dense.get(&id).copied()
    }
    /// Image index of an optional link, `-1` when absent.
    pub fn link(&self, id: Option<ConstructId>) -> Result<i64> {
        match id {
            None => Ok(NO_INDEX),
            Some(id) => self
                .index_of(id)
                .map(i64::from)
                .ok_or_else(|| ImageError::Invariant(format!("construct {} was not counted", id.index()))),
        }
    }
}

/// Everything one save learns while counting. Built fresh for every save, so
/// the counts of a resident image are never borrowed as scratch space.
#[derive(Debug, Default)]
pub struct SaveContext {
    symbols: Vec<SymbolId>,
    symbol_index: HashMap<SymbolId, u32, IdHasher>,
    functions: Vec<Function>,
    kinds: HashMap<&'static str, KindIndex>,
    expression_count: u64,
}

impl SaveContext {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn mark_symbol(&mut self, symbol: SymbolId) {
        if !self.symbol_index.contains_key(&symbol) {
            self.symbol_index.insert(symbol, self.symbols.len() as u32);
            self.symbols.push(symbol);
        }
    }
    pub fn mark_function(&mut self, function: Function) {
        if !self.functions.contains(&function) {
            self.functions.push(function);
        }
    }
    /// Marks the atoms and functions of a chain and adds its cells to the
    /// global expression count. Returns the number of cells.
    pub fn mark_expression(&mut self, expressions: &ExpressionArena, root: Option<ExprId>) -> u64 {
        let mut cells = 0;
        expressions.visit(root, &mut |node| {
            cells += 1;
            if let Some(symbol) = node.kind.symbol() {
                self.mark_symbol(symbol);
            }
            if let ExprKind::Call(function) = node.kind {
                self.mark_function(function);
            }
        });
        self.expression_count += cells;
        cells
    }
    pub fn symbol_index(&self, symbol: SymbolId) -> Result<i64> {
        self.symbol_index
            .get(&symbol)
            .map(|i| i64::from(*i))
            .ok_or_else(|| ImageError::Invariant(format!("symbol {} was not marked as needed", symbol)))
    }
    pub fn function_index(&self, function: Function) -> Result<u64> {
        self.functions
            .iter()
            .position(|f| *f == function)
            .map(|i| i as u64)
            .ok_or_else(|| ImageError::Invariant(format!("function {} was not marked as needed", function.name())))
    }
    pub fn symbols(&self) -> &[SymbolId] {
        &self.symbols
    }
    pub fn functions(&self) -> &[Function] {
        &self.functions
    }
    pub fn expression_count(&self) -> u64 {
        self.expression_count
    }
    pub fn kind(&self, kind: &str) -> Option<&KindIndex> {
        self.kinds.get(kind)
    }
    pub fn kind_mut(&mut self, kind: &'static str) -> &mut KindIndex {
        self.kinds.entry(kind).or_default()
    }
    /// Gives `id` the next dense index of its kind.
    pub fn assign_index(&mut self, kind: &'static str, id: ConstructId) -> u32 {
        let entry = self.kind_mut(kind);
        let index = entry.instances as u32;
        entry.dense.insert(id, index);
        entry.instances += 1;
        index
    }
    pub fn instance_index(&self, kind: &str, id: ConstructId) -> Option<u32> {
        self.kind(kind).and_then(|k| k.index_of(id))
    }
}

/// Running position in the shared expression section.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExpressionCursor {
    pub next: u64,
}

impl ExpressionCursor {
    /// Hands out the offset for a chain of `cells` cells, or `-1` when it is empty.
    pub fn claim(&mut self, cells: u64) -> i64 {
        if cells == 0 {
            return NO_INDEX;
        }
        let offset = self.next as i64;
        self.next += cells;
        offset
    }
}

/// Writes a chain in prefix order: a cell, then its argument list, then its
/// next sibling. A cell at position p finds its arguments at p + 1 and its
/// sibling at p + 1 + size(arguments).
pub fn write_expression(
    expressions: &ExpressionArena,
    ctx: &SaveContext,
    root: Option<ExprId>,
    cursor: &mut ExpressionCursor,
    out: &mut ImageWriter,
) -> Result<()> {
    let mut current = root;
    while let Some(id) = current {
        let node = expressions
            .get(id)
            .ok_or_else(|| ImageError::Invariant(format!("dangling expression reference {}", id.index())))?;
        cursor.next += 1;
        let arg_list = match node.arg_list {
            Some(_) => cursor.next as i64,
            None => NO_INDEX,
        };
        let next_arg = match node.next_arg {
            Some(_) => (cursor.next + expressions.size(node.arg_list) as u64) as i64,
            None => NO_INDEX,
        };
        let (tag, value) = match node.kind {
            ExprKind::Symbol(s) => (0u8, ctx.symbol_index(s)? as u64),
            ExprKind::Str(s) => (1, ctx.symbol_index(s)? as u64),
            ExprKind::Integer(i) => (2, i as u64),
            ExprKind::Float(x) => (3, x.to_bits()),
            ExprKind::Call(function) => (4, ctx.function_index(function)?),
            ExprKind::Fact(s) => (5, ctx.symbol_index(s)? as u64),
        };
        out.write_u8(tag);
        out.write_u64(value);
        out.write_i64(arg_list);
        out.write_i64(next_arg);
        write_expression(expressions, ctx, node.arg_list, cursor, out)?;
        current = node.next_arg;
    }
    Ok(())
}

// ------------- Load state -------------
/// The loaded expression block, living at `base..base + count` of the arena.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExpressionImage {
    pub base: usize,
    pub count: usize,
}

impl ExpressionImage {
    /// Relocates an offset into the shared expression section.
    pub fn resolve(&self, raw: i64) -> Result<Option<ExprId>> {
        Ok(decode_index(raw, self.count, "expression")?.map(|offset| ExprId::new(self.base + offset)))
    }
}

/// Tables that only make sense while one image is being (or has been) loaded.
#[derive(Debug, Default)]
pub struct ImageState {
    pub symbol_map: Vec<SymbolId>,
    pub functions: Vec<Function>,
    pub expressions: ExpressionImage,
    pub module_count: usize,
}

impl ImageState {
    pub fn symbol(&self, raw: i64) -> Result<SymbolId> {
        decode_index(raw, self.symbol_map.len(), "symbol")?
            .map(|i| self.symbol_map[i])
            .ok_or_else(|| ImageError::corrupt("required symbol reference is missing"))
    }
}

fn read_expressions(
    input: &mut ImageReader,
    state: &ImageState,
    arena: &mut ExpressionArena,
    symbols: &mut SymbolTable,
) -> Result<ExpressionImage> {
    let count = input.read_u64()?;
    if count.saturating_mul(EXPRESSION_RECORD_BYTES) > input.remaining() as u64 {
        return Err(ImageError::corrupt(format!("{} expression cells do not fit in the image", count)));
    }
    let count = count as usize;
    let mut kinds = Vec::with_capacity(count);
    let mut links = Vec::with_capacity(count);
    for _ in 0..count {
        let tag = input.read_u8()?;
        let value = input.read_u64()?;
        let arg_list = decode_index(input.read_i64()?, count, "expression")?;
        let next_arg = decode_index(input.read_i64()?, count, "expression")?;
        let kind = match tag {
            0 => ExprKind::Symbol(state.symbol(value as i64)?),
            1 => ExprKind::Str(state.symbol(value as i64)?),
            2 => ExprKind::Integer(value as i64),
            3 => ExprKind::Float(f64::from_bits(value)),
            4 => {
                let index = decode_index(value as i64, state.functions.len(), "function")?
                    .ok_or_else(|| ImageError::corrupt("call without a function"))?;
                ExprKind::Call(state.functions[index])
            }
            5 => ExprKind::Fact(state.symbol(value as i64)?),
            other => return Err(ImageError::corrupt(format!("unknown expression kind {}", other))),
        };
        kinds.push(kind);
        links.push((arg_list, next_arg));
    }
    check_prefix_layout(&links)?;

    let base = arena.len();
    let block: Vec<ExprNode> = kinds
        .into_iter()
        .zip(links)
        .map(|(kind, (arg_list, next_arg))| ExprNode {
            kind,
            arg_list: arg_list.map(|offset| ExprId::new(base + offset)),
            next_arg: next_arg.map(|offset| ExprId::new(base + offset)),
        })
        .collect();
    for node in &block {
        if let Some(symbol) = node.kind.symbol() {
            symbols.retain(symbol);
        }
    }
    arena.append_block(block);
    Ok(ExpressionImage { base, count })
}

/// Checks that `(arg_list, next_arg)` offsets describe chains packed in prefix
/// order: the arguments of the cell at p start at p + 1 and its sibling sits
/// right after them. Chains can then neither cycle nor share cells, and no
/// chain nests deeper than [`MAX_EXPRESSION_DEPTH`].
pub(crate) fn check_prefix_layout(links: &[(Option<usize>, Option<usize>)]) -> Result<()> {
    // cells and nesting depth of the chain starting at each position
    let mut chain_cells = vec![0usize; links.len()];
    let mut chain_depth = vec![0usize; links.len()];
    for p in (0..links.len()).rev() {
        let (arg_list, next_arg) = links[p];
        let (arg_cells, arg_depth) = match arg_list {
            None => (0, 0),
            Some(a) if a == p + 1 => (chain_cells[a], chain_depth[a]),
            Some(a) => {
                return Err(ImageError::corrupt(format!(
                    "expression {} has its arguments at {} instead of {}",
                    p,
                    a,
                    p + 1
                )));
            }
        };
        let span = 1 + arg_cells;
        let (next_cells, next_depth) = match next_arg {
            None => (0, 0),
            Some(n) if n == p + span => (chain_cells[n], chain_depth[n]),
            Some(n) => {
                return Err(ImageError::corrupt(format!(
                    "expression {} has its sibling at {} instead of {}",
                    p,
                    n,
                    p + span
                )));
            }
        };
        chain_cells[p] = span + next_cells;
        chain_depth[p] = (1 + arg_depth).max(next_depth);
        if chain_depth[p] > MAX_EXPRESSION_DEPTH {
            return Err(ImageError::corrupt(format!(
                "expression {} nests deeper than {} levels",
                p, MAX_EXPRESSION_DEPTH
            )));
        }
    }
    Ok(())
}

// ------------- Binary items -------------
/// One participant in a whole-environment save or load.
///
/// Save calls `count` on every item, then `write_expressions`, then
/// `write_storage`, then `write_records`, each time in registry order. Load
/// calls `read_storage` for every item found in the image, then
/// `read_records` in registry order, so an item can rely on everything it
/// depends on being resident already.
pub trait BinaryItem: Send + Sync {
    fn name(&self) -> &'static str;
    fn depends_on(&self) -> &'static [&'static str] {
        &[]
    }
    fn count(&self, env: &Environment, ctx: &mut SaveContext) -> Result<()>;
    fn write_expressions(
        &self,
        env: &Environment,
        ctx: &SaveContext,
        cursor: &mut ExpressionCursor,
        out: &mut ImageWriter,
    ) -> Result<()>;
    fn write_storage(&self, env: &Environment, ctx: &SaveContext, out: &mut ImageWriter) -> Result<()>;
    fn write_records(
        &self,
        env: &Environment,
        ctx: &SaveContext,
        cursor: &mut ExpressionCursor,
        out: &mut ImageWriter,
    ) -> Result<()>;
    fn read_storage(&self, env: &mut Environment, input: &mut ImageReader) -> Result<()>;
    fn read_records(&self, env: &mut Environment, input: &mut ImageReader) -> Result<()>;
    /// Drops the resident image, giving back every reference it took.
    fn clear(&self, env: &mut Environment);
    /// Drops the resident image without any reference bookkeeping.
    fn teardown(&self, env: &mut Environment);
}

/// Registered items, kept sorted so that every item comes after the items it depends on.
#[derive(Clone, Default)]
pub struct BinaryRegistry {
    items: Vec<Arc<dyn BinaryItem>>,
}

impl BinaryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
    /// The module table followed by every construct kind this crate knows.
    pub fn builtin() -> Self {
        Self {
            items: vec![
                Arc::new(ModuleBinaryItem),
                Arc::new(ConstructBinaryItem::<Deffacts>::new()),
                Arc::new(ConstructBinaryItem::<Defglobal>::new()),
            ],
        }
    }
    pub fn register(&mut self, item: Arc<dyn BinaryItem>) -> Result<()> {
        if self.find(item.name()).is_some() {
            return Err(ImageError::DependencyCycle(format!("'{}' is registered twice", item.name())));
        }
        let mut items = self.items.clone();
        items.push(item);
        self.items = sort_items(items)?;
        Ok(())
    }
    pub fn items(&self) -> &[Arc<dyn BinaryItem>] {
        &self.items
    }
    pub fn find(&self, name: &str) -> Option<Arc<dyn BinaryItem>> {
        self.items.iter().find(|item| item.name() == name).cloned()
    }
    pub fn names(&self) -> Vec<&'static str> {
        self.items.iter().map(|item| item.name()).collect()
    }
}

/// Kahn's algorithm, keeping registration order among independent items.
fn sort_items(mut pending: Vec<Arc<dyn BinaryItem>>) -> Result<Vec<Arc<dyn BinaryItem>>> {
    for item in &pending {
        for dependency in item.depends_on() {
            if !pending.iter().any(|other| other.name() == *dependency) {
                return Err(ImageError::DependencyCycle(format!(
                    "'{}' depends on unregistered '{}'",
                    item.name(),
                    dependency
                )));
            }
        }
    }
    let mut sorted: Vec<Arc<dyn BinaryItem>> = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let ready = pending.iter().position(|item| {
            item.depends_on()
                .iter()
                .all(|dependency| sorted.iter().any(|done| done.name() == *dependency))
        });
        match ready {
            Some(position) => sorted.push(pending.remove(position)),
            None => {
                let names: Vec<&str> = pending.iter().map(|item| item.name()).collect();
                return Err(ImageError::DependencyCycle(format!("cycle among {}", names.join(", "))));
            }
        }
    }
    Ok(sorted)
}

// ------------- Save -------------
impl Environment {
    /// The counting pass of a save: numbers every construct densely and marks
    /// every symbol, function and expression cell the image will need.
    pub fn count(&self) -> Result<SaveContext> {
        let mut ctx = SaveContext::new();
        for item in self.registry.items() {
            item.count(self, &mut ctx)?;
        }
        Ok(ctx)
    }

    pub fn bsave_to_vec(&self) -> Result<Vec<u8>> {
        let ctx = self.count()?;
        let items = self.registry.items();
        let mut out = ImageWriter::new();
        out.write_bytes(BINARY_PREFIX);
        out.write_str(BINARY_VERSION);

        let names: Vec<&str> = ctx
            .symbols()
            .iter()
            .map(|s| {
                self.symbols
                    .name(*s)
                    .ok_or_else(|| ImageError::Invariant(format!("marked symbol {} has no name", s)))
            })
            .collect::<Result<_>>()?;
        write_names(&mut out, &names);
        let functions: Vec<&str> = ctx.functions().iter().map(Function::name).collect();
        write_names(&mut out, &functions);

        out.write_u64(ctx.expression_count());
        let mut cursor = ExpressionCursor::default();
        for item in items {
            item.write_expressions(self, &ctx, &mut cursor, &mut out)?;
        }
        expect_cursor(&cursor, &ctx, "expression")?;

        for item in items {
            out.write_str(item.name());
            item.write_storage(self, &ctx, &mut out)?;
        }
        out.write_str(END_MARKER);

        let mut cursor = ExpressionCursor::default();
        for item in items {
            out.write_str(item.name());
            item.write_records(self, &ctx, &mut cursor, &mut out)?;
        }
        out.write_str(END_MARKER);
        expect_cursor(&cursor, &ctx, "record")?;

        let digest = blake3::hash(&out.buffer);
        out.write_bytes(digest.as_bytes());
        info!(
            bytes = out.len(),
            symbols = ctx.symbols().len(),
            expressions = ctx.expression_count(),
            "binary image written"
        );
        Ok(out.into_inner())
    }

    pub fn bsave(&self, path: impl AsRef<Path>) -> Result<usize> {
        let image = self.bsave_to_vec()?;
        fs::write(path.as_ref(), &image)?;
        debug!(path = %path.as_ref().display(), "bsave complete");
        Ok(image.len())
    }

    // ------------- Load -------------
    pub fn bload(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = fs::read(path.as_ref())?;
        self.bload_from_slice(&bytes)
    }

    /// Replaces whatever the environment holds with the constructs in `bytes`.
    /// On failure the environment is left cleared.
    pub fn bload_from_slice(&mut self, bytes: &[u8]) -> Result<()> {
        self.clear();
        let result = self.load_image(bytes);
        self.image.symbol_map.clear();
        self.image.functions.clear();
        match result {
            Ok(()) => {
                info!(bytes = bytes.len(), modules = self.modules.len(), "binary image loaded");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "binary load failed, clearing environment");
                self.bloaded = true;
                self.clear();
                Err(e)
            }
        }
    }

    fn load_image(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() as u64 > self.settings.max_image_bytes {
            return Err(ImageError::corrupt(format!(
                "image of {} bytes exceeds the limit of {}",
                bytes.len(),
                self.settings.max_image_bytes
            )));
        }
        if bytes.len() < DIGEST_BYTES {
            return Err(ImageError::corrupt("image is shorter than its digest"));
        }
        let (body, digest) = bytes.split_at(bytes.len() - DIGEST_BYTES);
        if self.settings.verify_checksum && blake3::hash(body).as_bytes() != digest {
            return Err(ImageError::ChecksumMismatch);
        }
        let strict = self.settings.strict_lengths;
        let mut input = ImageReader::new(body);
        if input.read_bytes(BINARY_PREFIX.len())? != BINARY_PREFIX {
            return Err(ImageError::corrupt("not a binary construct image"));
        }
        let version = input.read_str()?;
        if version != BINARY_VERSION {
            return Err(ImageError::VersionMismatch { found: version.to_owned() });
        }

        let symbol_names = read_names(&mut input, strict, "symbol")?;
        self.image.symbol_map = symbol_names.iter().map(|name| self.symbols.add(name)).collect();
        let function_names = read_names(&mut input, strict, "function")?;
        self.image.functions = function_names
            .iter()
            .map(|name| Function::from_name(name).ok_or_else(|| ImageError::UnknownFunction(name.to_string())))
            .collect::<Result<_>>()?;
        // loaded from here on: a failure must clear the partial image
        self.bloaded = true;
        self.image.expressions = read_expressions(&mut input, &self.image, &mut self.expressions, &mut self.symbols)?;
        debug!(
            symbols = self.image.symbol_map.len(),
            expressions = self.image.expressions.count,
            "shared sections loaded"
        );

        loop {
            let name = input.read_str()?;
            if name == END_MARKER {
                break;
            }
            let mut section = input.section()?;
            match self.registry.find(name) {
                Some(item) => {
                    item.read_storage(self, &mut section)?;
                    section.finish(strict, name)?;
                }
                None => warn!(item = name, "skipping storage of unknown binary item"),
            }
        }

        let mut sections: HashMap<&str, ImageReader> = HashMap::new();
        loop {
            let name = input.read_str()?;
            if name == END_MARKER {
                break;
            }
            let section = input.section()?;
            if self.registry.find(name).is_none() {
                warn!(item = name, "skipping records of unknown binary item");
                continue;
            }
            sections.insert(name, section);
        }
        input.finish(strict, "image")?;

        for item in self.registry.items().to_vec() {
            if let Some(mut section) = sections.remove(item.name()) {
                item.read_records(self, &mut section)?;
                section.finish(strict, item.name())?;
                debug!(item = item.name(), "records relocated");
            }
        }
        Ok(())
    }
}

fn write_names(out: &mut ImageWriter, names: &[&str]) {
    let space = 8 + names.iter().map(|n| str_space(n)).sum::<u64>();
    out.write_u64(space);
    out.write_u64(names.len() as u64);
    for name in names {
        out.write_str(name);
    }
}

fn read_names<'a>(input: &mut ImageReader<'a>, strict: bool, what: &str) -> Result<Vec<&'a str>> {
    let mut section = input.section()?;
    let count = section.read_u64()?;
    let mut names = Vec::new();
    for _ in 0..count {
        names.push(section.read_str()?);
    }
    section.finish(strict, what)?;
    Ok(names)
}

fn expect_cursor(cursor: &ExpressionCursor, ctx: &SaveContext, pass: &str) -> Result<()> {
    if cursor.next != ctx.expression_count() {
        return Err(ImageError::Invariant(format!(
            "{} pass reached expression offset {} but {} cells were counted",
            pass,
            cursor.next,
            ctx.expression_count()
        )));
    }
    Ok(())
}
