use std::any::Any;
use std::fmt;
use std::sync::Arc;

// our own stuff that we need
use crate::environment::Environment;
use crate::expression::{ExprId, ExpressionArena, Value};
use crate::image::ConstructImage;
use crate::symbol::{SymbolId, SymbolTable};

// ------------- Ids -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(u32);

impl ModuleId {
    pub fn new(index: usize) -> Self {
        Self(index as u32)
    }
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConstructId(u32);

impl ConstructId {
    pub fn new(index: usize) -> Self {
        Self(index as u32)
    }
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

// ------------- Headers -------------
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Fields shared by every construct regardless of its kind.
#[derive(Clone)]
pub struct ConstructHeader {
    pub name: SymbolId,
    pub module: ModuleId,
    pub pp_form: Option<String>,
    pub next: Option<ConstructId>,
    pub user_data: Option<UserData>,
}

impl ConstructHeader {
    pub fn new(name: SymbolId, module: ModuleId) -> Self {
        Self {
            name,
            module,
            pp_form: None,
            next: None,
            user_data: None,
        }
    }
}
impl fmt::Debug for ConstructHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConstructHeader")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("pp_form", &self.pp_form)
            .field("next", &self.next)
            .field("user_data", &self.user_data.is_some())
            .finish()
    }
}

/// Per-module entry point into the instance list of one construct kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleItemHeader {
    pub module: ModuleId,
    pub first: Option<ConstructId>,
    pub last: Option<ConstructId>,
}

impl ModuleItemHeader {
    pub fn empty(module: ModuleId) -> Self {
        Self { module, first: None, last: None }
    }
}

// ------------- Modules -------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defmodule {
    pub name: SymbolId,
    pub pp_form: Option<String>,
}

pub const MAIN_MODULE: &str = "MAIN";

/// Modules in definition order, which is also the order every traversal uses.
#[derive(Debug)]
pub struct ModuleTable {
    modules: Vec<Defmodule>,
}

impl ModuleTable {
    pub fn new(symbols: &mut SymbolTable) -> Self {
        Self {
            modules: vec![Defmodule { name: symbols.add_retained(MAIN_MODULE), pp_form: None }],
        }
    }
    pub fn define(&mut self, symbols: &mut SymbolTable, name: &str) -> ModuleId {
        if let Some(existing) = self.find(symbols, name) {
            return existing;
        }
        self.modules.push(Defmodule { name: symbols.add_retained(name), pp_form: None });
        ModuleId::new(self.modules.len() - 1)
    }
    pub fn find(&self, symbols: &SymbolTable, name: &str) -> Option<ModuleId> {
        let symbol = symbols.lookup(name)?;
        self.modules.iter().position(|m| m.name == symbol).map(ModuleId::new)
    }
    pub fn get(&self, module: ModuleId) -> Option<&Defmodule> {
        self.modules.get(module.index())
    }
    pub fn iter(&self) -> impl Iterator<Item = (ModuleId, &Defmodule)> {
        self.modules.iter().enumerate().map(|(i, m)| (ModuleId::new(i), m))
    }
    pub fn len(&self) -> usize {
        self.modules.len()
    }
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
    /// Swaps in a new table, giving back the references the old one held.
    /// The incoming modules must already be retained.
    pub fn replace(&mut self, symbols: &mut SymbolTable, modules: Vec<Defmodule>) {
        for old in self.modules.drain(..) {
            symbols.release(old.name);
        }
        self.modules = modules;
    }
    /// Drops every module without giving back their name references.
    pub fn forget(&mut self) {
        self.modules.clear();
    }
    /// Back to a table holding only `MAIN`.
    pub fn reset(&mut self, symbols: &mut SymbolTable) {
        let main = Defmodule { name: symbols.add_retained(MAIN_MODULE), pp_form: None };
        self.replace(symbols, vec![main]);
    }
}

// ------------- Constructs -------------
pub trait Construct: Sized {
    const KIND: &'static str;
    fn header(&self) -> &ConstructHeader;
    fn header_mut(&mut self) -> &mut ConstructHeader;
    /// The expression chain owned by this construct, if any.
    fn payload(&self) -> Option<ExprId>;
    fn data(env: &Environment) -> &ConstructData<Self>;
    fn data_mut(env: &mut Environment) -> &mut ConstructData<Self>;
}

/// Read access shared by parsed-in constructs and binary-loaded ones.
pub trait ConstructView<T> {
    fn construct(&self, id: ConstructId) -> Option<&T>;
    fn module_item(&self, module: ModuleId) -> Option<&ModuleItemHeader>;
}

/// Constructs defined at runtime, kept in an index arena with per-module lists.
#[derive(Debug)]
pub struct ConstructStore<T> {
    slots: Vec<Option<T>>,
    modules: Vec<ModuleItemHeader>,
}

impl<T> Default for ConstructStore<T> {
    fn default() -> Self {
        Self { slots: Vec::new(), modules: Vec::new() }
    }
}

impl<T: Construct> ConstructStore<T> {
    fn module_item_mut(&mut self, module: ModuleId) -> &mut ModuleItemHeader {
        while self.modules.len() <= module.index() {
            let next = ModuleId::new(self.modules.len());
            self.modules.push(ModuleItemHeader::empty(next));
        }
        &mut self.modules[module.index()]
    }
    /// Appends `item` to the end of its module's list.
    pub fn define(&mut self, mut item: T) -> ConstructId {
        item.header_mut().next = None;
        let module = item.header().module;
        self.slots.push(Some(item));
        let id = ConstructId::new(self.slots.len() - 1);
        let previous_last = self.module_item_mut(module).last;
        if let Some(last) = previous_last.and_then(|last| self.slots.get_mut(last.index())).and_then(Option::as_mut) {
            last.header_mut().next = Some(id);
        }
        let entry = self.module_item_mut(module);
        if entry.first.is_none() {
            entry.first = Some(id);
        }
        entry.last = Some(id);
        id
    }
    /// Unlinks and returns the construct at `id`.
    pub fn remove(&mut self, id: ConstructId) -> Option<T> {
        let removed = self.slots.get_mut(id.index())?.take()?;
        let module = removed.header().module;
        let successor = removed.header().next;
        let mut previous = None;
        let mut current = self.modules.get(module.index()).and_then(|m| m.first);
        while let Some(c) = current {
            if c == id {
                break;
            }
            previous = Some(c);
            current = self.construct(c).and_then(|item| item.header().next);
        }
        match previous.and_then(|p| self.slots.get_mut(p.index())).and_then(Option::as_mut) {
            Some(p) => p.header_mut().next = successor,
            None => self.module_item_mut(module).first = successor,
        }
        let entry = self.module_item_mut(module);
        if entry.last == Some(id) {
            entry.last = previous;
        }
        Some(removed)
    }
    pub fn get_mut(&mut self, id: ConstructId) -> Option<&mut T> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }
    pub fn find(&self, name: SymbolId) -> Option<ConstructId> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|item| item.header().name == name))
            .map(ConstructId::new)
    }
    /// Removes everything, handing the constructs back to the caller.
    pub fn drain(&mut self) -> Vec<T> {
        self.modules.clear();
        self.slots.drain(..).flatten().collect()
    }
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> ConstructView<T> for ConstructStore<T> {
    fn construct(&self, id: ConstructId) -> Option<&T> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }
    fn module_item(&self, module: ModuleId) -> Option<&ModuleItemHeader> {
        self.modules.get(module.index())
    }
}

/// Everything the environment keeps for one construct kind.
#[derive(Debug)]
pub struct ConstructData<T> {
    pub defined: ConstructStore<T>,
    pub image: ConstructImage<T>,
}

impl<T> Default for ConstructData<T> {
    fn default() -> Self {
        Self {
            defined: ConstructStore::default(),
            image: ConstructImage::default(),
        }
    }
}

impl<T: Construct> ConstructData<T> {
    /// The binary-loaded arrays while an image is resident, the defined store otherwise.
    pub fn view(&self, bloaded: bool) -> &dyn ConstructView<T> {
        if bloaded { &self.image } else { &self.defined }
    }
}

// ------------- Traversal -------------
/// Walks every construct of one kind, module by module, following each
/// module's list from its first entry.
pub struct Traversal<'a, T> {
    view: &'a dyn ConstructView<T>,
    module_count: usize,
    next_module: usize,
    current_module: ModuleId,
    next: Option<ConstructId>,
}

impl<'a, T: Construct> Traversal<'a, T> {
    pub fn new(view: &'a dyn ConstructView<T>, module_count: usize) -> Self {
        Self {
            view,
            module_count,
            next_module: 0,
            current_module: ModuleId::new(0),
            next: None,
        }
    }
    /// Only the constructs of `module`.
    pub fn module(view: &'a dyn ConstructView<T>, module: ModuleId) -> Self {
        Self {
            view,
            module_count: module.index() + 1,
            next_module: module.index() + 1,
            current_module: module,
            next: view.module_item(module).and_then(|m| m.first),
        }
    }
}

impl<'a, T: Construct> Iterator for Traversal<'a, T> {
    type Item = (ModuleId, ConstructId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(id) = self.next {
                let item = self.view.construct(id)?;
                self.next = item.header().next;
                return Some((self.current_module, id, item));
            }
            if self.next_module >= self.module_count {
                return None;
            }
            self.current_module = ModuleId::new(self.next_module);
            self.next = self.view.module_item(self.current_module).and_then(|m| m.first);
            self.next_module += 1;
        }
    }
}

// ------------- Deffacts -------------
#[derive(Debug, Clone)]
pub struct Deffacts {
    pub header: ConstructHeader,
    pub assert_list: Option<ExprId>,
}

impl Construct for Deffacts {
    const KIND: &'static str = "deffacts";
    fn header(&self) -> &ConstructHeader {
        &self.header
    }
    fn header_mut(&mut self) -> &mut ConstructHeader {
        &mut self.header
    }
    fn payload(&self) -> Option<ExprId> {
        self.assert_list
    }
    fn data(env: &Environment) -> &ConstructData<Self> {
        &env.deffacts
    }
    fn data_mut(env: &mut Environment) -> &mut ConstructData<Self> {
        &mut env.deffacts
    }
}

// ------------- Defglobal -------------
#[derive(Debug, Clone)]
pub struct Defglobal {
    pub header: ConstructHeader,
    pub initial: Option<ExprId>,
    /// Set by reset; never part of an image.
    pub value: Option<Value>,
}

impl Construct for Defglobal {
    const KIND: &'static str = "defglobal";
    fn header(&self) -> &ConstructHeader {
        &self.header
    }
    fn header_mut(&mut self) -> &mut ConstructHeader {
        &mut self.header
    }
    fn payload(&self) -> Option<ExprId> {
        self.initial
    }
    fn data(env: &Environment) -> &ConstructData<Self> {
        &env.defglobals
    }
    fn data_mut(env: &mut Environment) -> &mut ConstructData<Self> {
        &mut env.defglobals
    }
}

/// Releases everything a defined construct holds on to.
pub(crate) fn release_construct<T: Construct>(item: &T, symbols: &mut SymbolTable, expressions: &mut ExpressionArena) {
    symbols.release(item.header().name);
    expressions.release(symbols, item.payload());
}
