//! Binary images of construct kinds.
//!
//! Every construct kind is saved the same way: a storage section holding the
//! instance and module counts, then a record section with one fixed-size
//! record per module followed by one per instance. Records refer to each
//! other by dense index. Loading reads the counts first, then relocates the
//! module records, then the instance records, which need the module array
//! to be resident.

use std::marker::PhantomData;

use tracing::debug;

use crate::construct::{
    Construct, ConstructHeader, ConstructId, ConstructView, Deffacts, Defglobal, Defmodule, ModuleId,
    ModuleItemHeader, Traversal,
};
use crate::environment::Environment;
use crate::error::{ImageError, Result};
use crate::expression::ExprId;
use crate::persist::{
    decode_index, write_expression, BinaryItem, ExpressionCursor, ImageReader, ImageWriter, SaveContext,
};
use crate::symbol::SymbolTable;

/// instance count + module count
pub const STORAGE_BYTES: u64 = 16;
/// module + first + last
pub const MODULE_ITEM_BYTES: u64 = 24;
/// name + owning module + next
pub const CONSTRUCT_HEADER_BYTES: u64 = 24;
pub const CONSTRUCT_RECORD_BYTES: u64 = CONSTRUCT_HEADER_BYTES + 8;

// ------------- Records -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BsaveModuleItem {
    pub module: i64,
    pub first: i64,
    pub last: i64,
}

impl BsaveModuleItem {
    pub fn encode(&self, out: &mut ImageWriter) {
        out.write_i64(self.module);
        out.write_i64(self.first);
        out.write_i64(self.last);
    }
    pub fn decode(input: &mut ImageReader) -> Result<Self> {
        Ok(Self {
            module: input.read_i64()?,
            first: input.read_i64()?,
            last: input.read_i64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BsaveConstructHeader {
    pub name: i64,
    pub which_module: i64,
    pub next: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BsaveConstruct {
    pub header: BsaveConstructHeader,
    /// Offset into the shared expression section, `-1` for none.
    pub payload: i64,
}

impl BsaveConstruct {
    pub fn encode(&self, out: &mut ImageWriter) {
        out.write_i64(self.header.name);
        out.write_i64(self.header.which_module);
        out.write_i64(self.header.next);
        out.write_i64(self.payload);
    }
    pub fn decode(input: &mut ImageReader) -> Result<Self> {
        let header = BsaveConstructHeader {
            name: input.read_i64()?,
            which_module: input.read_i64()?,
            next: input.read_i64()?,
        };
        Ok(Self { header, payload: input.read_i64()? })
    }
}

// ------------- Binary constructs -------------
/// A construct kind that can live in a binary image.
pub trait BinaryConstruct: Construct + Send + Sync + 'static {
    const DEPENDS_ON: &'static [&'static str] = &["defmodule"];
    /// Builds a loaded instance from its relocated header and payload.
    fn from_record(header: ConstructHeader, payload: Option<ExprId>) -> Self;
}

impl BinaryConstruct for Deffacts {
    fn from_record(header: ConstructHeader, payload: Option<ExprId>) -> Self {
        Deffacts { header, assert_list: payload }
    }
}

impl BinaryConstruct for Defglobal {
    fn from_record(header: ConstructHeader, payload: Option<ExprId>) -> Self {
        Defglobal { header, initial: payload, value: None }
    }
}

// ------------- Loaded image -------------
/// The instance and module arrays of one construct kind while an image is resident.
#[derive(Debug)]
pub struct ConstructImage<T> {
    instances: Vec<T>,
    modules: Vec<ModuleItemHeader>,
    instance_count: usize,
    module_count: usize,
}

impl<T> Default for ConstructImage<T> {
    fn default() -> Self {
        Self {
            instances: Vec::new(),
            modules: Vec::new(),
            instance_count: 0,
            module_count: 0,
        }
    }
}

impl<T> ConstructView<T> for ConstructImage<T> {
    fn construct(&self, id: ConstructId) -> Option<&T> {
        self.instances.get(id.index())
    }
    fn module_item(&self, module: ModuleId) -> Option<&ModuleItemHeader> {
        self.modules.get(module.index())
    }
}

impl<T: BinaryConstruct> ConstructImage<T> {
    /// `(instances, modules)` announced by the storage section.
    pub fn counts(&self) -> (usize, usize) {
        (self.instance_count, self.module_count)
    }
    pub fn instances(&self) -> &[T] {
        &self.instances
    }
    pub fn get_mut(&mut self, id: ConstructId) -> Option<&mut T> {
        self.instances.get_mut(id.index())
    }
    /// Per-module entry for the module at `index` in image order.
    pub fn module_reference(&self, index: usize) -> Option<&ModuleItemHeader> {
        self.modules.get(index)
    }

    /// Sizes the arrays for the counts of a storage section. Zero counts leave
    /// the arrays unallocated, which is a valid empty image.
    pub fn allocate(&mut self, instance_count: u64, module_count: u64, limit: u64) -> Result<()> {
        let needed = instance_count
            .saturating_mul(CONSTRUCT_RECORD_BYTES)
            .saturating_add(module_count.saturating_mul(MODULE_ITEM_BYTES));
        if needed > limit {
            return Err(ImageError::corrupt(format!(
                "{} storage for {} instances and {} modules exceeds the image limit",
                T::KIND,
                instance_count,
                module_count
            )));
        }
        self.instance_count = instance_count as usize;
        self.module_count = module_count as usize;
        self.instances = Vec::with_capacity(self.instance_count);
        self.modules = Vec::with_capacity(self.module_count);
        Ok(())
    }

    fn read_records(&mut self, env: &mut Environment, input: &mut ImageReader) -> Result<()> {
        let expected = self.module_count as u64 * MODULE_ITEM_BYTES + self.instance_count as u64 * CONSTRUCT_RECORD_BYTES;
        if env.settings.strict_lengths && input.remaining() as u64 != expected {
            return Err(ImageError::corrupt(format!(
                "{} records take {} bytes but the section holds {}",
                T::KIND,
                expected,
                input.remaining()
            )));
        }
        let mut modules = Vec::with_capacity(self.module_count);
        for _ in 0..self.module_count {
            modules.push(BsaveModuleItem::decode(input)?);
        }
        let mut records = Vec::with_capacity(self.instance_count);
        for _ in 0..self.instance_count {
            records.push(BsaveConstruct::decode(input)?);
        }
        self.relocate_modules(env, &modules)?;
        self.relocate_instances(env, &records)?;
        self.verify_lists()
    }

    pub(crate) fn relocate_modules(&mut self, env: &Environment, records: &[BsaveModuleItem]) -> Result<()> {
        for (index, record) in records.iter().enumerate() {
            let relocation = |message: String| ImageError::Relocation { kind: T::KIND, index, message };
            let module = decode_index(record.module, env.modules.len(), "module")?
                .ok_or_else(|| relocation(String::from("module item without a module")))?;
            if module != index {
                return Err(relocation(format!("module item names module {}", module)));
            }
            let first = decode_index(record.first, self.instance_count, "instance")?.map(ConstructId::new);
            let last = decode_index(record.last, self.instance_count, "instance")?.map(ConstructId::new);
            if first.is_some() != last.is_some() {
                return Err(relocation(String::from("module list has only one end")));
            }
            self.modules.push(ModuleItemHeader { module: ModuleId::new(module), first, last });
        }
        Ok(())
    }

    pub(crate) fn relocate_instances(&mut self, env: &mut Environment, records: &[BsaveConstruct]) -> Result<()> {
        for (index, record) in records.iter().enumerate() {
            let relocation = |message: &str| ImageError::Relocation { kind: T::KIND, index, message: message.to_owned() };
            if self.modules.len() != self.module_count {
                return Err(relocation("owning module item not resident"));
            }
            let which = decode_index(record.header.which_module, self.modules.len(), "module item")?
                .ok_or_else(|| relocation("instance without an owning module"))?;
            let module = self.modules[which].module;
            let next = decode_index(record.header.next, self.instance_count, "instance")?.map(ConstructId::new);
            let payload = env.image.expressions.resolve(record.payload)?;
            let name = env.image.symbol(record.header.name)?;
            env.symbols.retain(name);
            let mut header = ConstructHeader::new(name, module);
            header.next = next;
            self.instances.push(T::from_record(header, payload));
        }
        Ok(())
    }

    /// Every instance must sit on exactly one module list, the list of its
    /// own module, and each list must end at its module's `last`.
    pub(crate) fn verify_lists(&self) -> Result<()> {
        let mut reached = vec![false; self.instances.len()];
        for (index, entry) in self.modules.iter().enumerate() {
            let relocation = |message: String| ImageError::Relocation { kind: T::KIND, index, message };
            let mut tail = None;
            let mut current = entry.first;
            while let Some(id) = current {
                let seen = reached
                    .get_mut(id.index())
                    .ok_or_else(|| relocation(format!("list reaches missing instance {}", id.index())))?;
                if *seen {
                    return Err(relocation(format!("instance {} is reached twice", id.index())));
                }
                *seen = true;
                let instance = &self.instances[id.index()];
                if instance.header().module != entry.module {
                    return Err(relocation(format!("instance {} belongs to another module", id.index())));
                }
                tail = Some(id);
                current = instance.header().next;
            }
            if tail != entry.last {
                return Err(relocation(String::from("module list does not end at its last instance")));
            }
        }
        match reached.iter().position(|seen| !seen) {
            Some(orphan) => Err(ImageError::Relocation {
                kind: T::KIND,
                index: orphan,
                message: String::from("instance is on no module list"),
            }),
            None => Ok(()),
        }
    }

    /// Gives back the name references of every loaded instance, then drops both arrays.
    pub fn clear(&mut self, symbols: &mut SymbolTable) {
        for instance in &self.instances {
            symbols.release(instance.header().name);
        }
        self.teardown();
    }

    pub fn teardown(&mut self) {
        *self = Self::default();
    }
}

// ------------- Save passes -------------
fn count_constructs<T: BinaryConstruct>(env: &Environment, ctx: &mut SaveContext) {
    ctx.kind_mut(T::KIND).modules += env.modules.len() as u64;
    for (_, id, item) in Traversal::new(T::data(env).view(env.bloaded), env.modules.len()) {
        ctx.assign_index(T::KIND, id);
        ctx.mark_symbol(item.header().name);
        let cells = ctx.mark_expression(&env.expressions, item.payload());
        ctx.kind_mut(T::KIND).expression_cells += cells;
    }
}

fn write_records<T: BinaryConstruct>(
    env: &Environment,
    ctx: &SaveContext,
    cursor: &mut ExpressionCursor,
    out: &mut ImageWriter,
) -> Result<()> {
    let kind = ctx
        .kind(T::KIND)
        .ok_or_else(|| ImageError::Invariant(format!("{} was not counted", T::KIND)))?;
    let space = kind.modules * MODULE_ITEM_BYTES + kind.instances * CONSTRUCT_RECORD_BYTES;
    out.write_u64(space);
    let start = out.len();
    let view = T::data(env).view(env.bloaded);

    for (module, _) in env.modules.iter() {
        let entry = view.module_item(module).copied().unwrap_or(ModuleItemHeader::empty(module));
        BsaveModuleItem {
            module: module.index() as i64,
            first: kind.link(entry.first)?,
            last: kind.link(entry.last)?,
        }
        .encode(out);
    }
    for (module, _, item) in Traversal::new(view, env.modules.len()) {
        let header = item.header();
        let cells = env.expressions.size(item.payload()) as u64;
        BsaveConstruct {
            header: BsaveConstructHeader {
                name: ctx.symbol_index(header.name)?,
                which_module: module.index() as i64,
                next: kind.link(header.next)?,
            },
            payload: cursor.claim(cells),
        }
        .encode(out);
    }
    out.expect_written(start, space, T::KIND)
}

// ------------- Binary items -------------
/// Saves and loads one construct kind through its [`ConstructImage`].
pub struct ConstructBinaryItem<T>(PhantomData<fn() -> T>);

impl<T> ConstructBinaryItem<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for ConstructBinaryItem<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: BinaryConstruct> BinaryItem for ConstructBinaryItem<T> {
    fn name(&self) -> &'static str {
        T::KIND
    }
    fn depends_on(&self) -> &'static [&'static str] {
        T::DEPENDS_ON
    }
    fn count(&self, env: &Environment, ctx: &mut SaveContext) -> Result<()> {
        count_constructs::<T>(env, ctx);
        Ok(())
    }
    fn write_expressions(
        &self,
        env: &Environment,
        ctx: &SaveContext,
        cursor: &mut ExpressionCursor,
        out: &mut ImageWriter,
    ) -> Result<()> {
        for (_, _, item) in Traversal::new(T::data(env).view(env.bloaded), env.modules.len()) {
            write_expression(&env.expressions, ctx, item.payload(), cursor, out)?;
        }
        Ok(())
    }
    fn write_storage(&self, _env: &Environment, ctx: &SaveContext, out: &mut ImageWriter) -> Result<()> {
        let (instances, modules) = ctx.kind(T::KIND).map_or((0, 0), |k| (k.instances, k.modules));
        out.write_u64(STORAGE_BYTES);
        out.write_u64(instances);
        out.write_u64(modules);
        Ok(())
    }
    fn write_records(
        &self,
        env: &Environment,
        ctx: &SaveContext,
        cursor: &mut ExpressionCursor,
        out: &mut ImageWriter,
    ) -> Result<()> {
        write_records::<T>(env, ctx, cursor, out)
    }
    fn read_storage(&self, env: &mut Environment, input: &mut ImageReader) -> Result<()> {
        let instances = input.read_u64()?;
        let modules = input.read_u64()?;
        let limit = env.settings.max_image_bytes;
        T::data_mut(env).image.allocate(instances, modules, limit)?;
        debug!(item = T::KIND, instances, modules, "storage allocated");
        Ok(())
    }
    fn read_records(&self, env: &mut Environment, input: &mut ImageReader) -> Result<()> {
        let mut image = std::mem::take(&mut T::data_mut(env).image);
        let result = image.read_records(env, input);
        T::data_mut(env).image = image;
        result
    }
    fn clear(&self, env: &mut Environment) {
        let mut image = std::mem::take(&mut T::data_mut(env).image);
        image.clear(&mut env.symbols);
    }
    fn teardown(&self, env: &mut Environment) {
        T::data_mut(env).image.teardown();
    }
}

/// Saves and loads the module table. Every construct kind depends on it,
/// since their module records are indexed by module position.
#[derive(Debug, Default)]
pub struct ModuleBinaryItem;

impl BinaryItem for ModuleBinaryItem {
    fn name(&self) -> &'static str {
        "defmodule"
    }
    fn count(&self, env: &Environment, ctx: &mut SaveContext) -> Result<()> {
        for (_, module) in env.modules.iter() {
            ctx.mark_symbol(module.name);
        }
        let kind = ctx.kind_mut("defmodule");
        kind.instances += env.modules.len() as u64;
        kind.modules += env.modules.len() as u64;
        Ok(())
    }
    fn write_expressions(&self, _: &Environment, _: &SaveContext, _: &mut ExpressionCursor, _: &mut ImageWriter) -> Result<()> {
        Ok(())
    }
    fn write_storage(&self, env: &Environment, _ctx: &SaveContext, out: &mut ImageWriter) -> Result<()> {
        out.write_u64(8);
        out.write_u64(env.modules.len() as u64);
        Ok(())
    }
    fn write_records(&self, env: &Environment, ctx: &SaveContext, _: &mut ExpressionCursor, out: &mut ImageWriter) -> Result<()> {
        out.write_u64(env.modules.len() as u64 * 8);
        for (_, module) in env.modules.iter() {
            out.write_i64(ctx.symbol_index(module.name)?);
        }
        Ok(())
    }
    fn read_storage(&self, env: &mut Environment, input: &mut ImageReader) -> Result<()> {
        let count = input.read_u64()?;
        if count.saturating_mul(8) > env.settings.max_image_bytes {
            return Err(ImageError::corrupt(format!("{} modules exceed the image limit", count)));
        }
        env.image.module_count = count as usize;
        Ok(())
    }
    fn read_records(&self, env: &mut Environment, input: &mut ImageReader) -> Result<()> {
        let mut modules = Vec::with_capacity(env.image.module_count);
        for index in 0..env.image.module_count {
            let name = env.image.symbol(input.read_i64()?).map_err(|e| ImageError::Relocation {
                kind: "defmodule",
                index,
                message: e.to_string(),
            })?;
            env.symbols.retain(name);
            modules.push(Defmodule { name, pp_form: None });
        }
        if modules.is_empty() {
            env.modules.reset(&mut env.symbols);
        } else {
            env.modules.replace(&mut env.symbols, modules);
        }
        Ok(())
    }
    fn clear(&self, env: &mut Environment) {
        env.image.module_count = 0;
        env.modules.reset(&mut env.symbols);
    }
    fn teardown(&self, env: &mut Environment) {
        env.image.module_count = 0;
        env.modules.forget();
    }
}
