use std::sync::Arc;

use tracing::{debug, info};

// our own stuff that we need
use crate::construct::{
    release_construct, Construct, ConstructData, ConstructHeader, ConstructId, ConstructView, Deffacts,
    Defglobal, ModuleId, ModuleItemHeader, ModuleTable, Traversal,
};
use crate::error::{ImageError, Result};
use crate::expression::{Expr, ExprId, ExpressionArena, Fact, Value};
use crate::image::{BinaryConstruct, ConstructImage};
use crate::persist::{BinaryItem, BinaryRegistry, ImageState};
use crate::settings::Settings;
use crate::symbol::SymbolTable;

/// One rule-engine environment: its modules, constructs and the binary image
/// loaded into it, if any.
///
/// While an image is resident every construct kind reads from its loaded
/// arrays and nothing can be defined or undefined until [`Environment::clear`].
pub struct Environment {
    pub(crate) settings: Settings,
    pub(crate) symbols: SymbolTable,
    pub(crate) modules: ModuleTable,
    pub(crate) expressions: ExpressionArena,
    pub(crate) image: ImageState,
    pub(crate) deffacts: ConstructData<Deffacts>,
    pub(crate) defglobals: ConstructData<Defglobal>,
    pub(crate) facts: Vec<Fact>,
    pub(crate) bloaded: bool,
    pub(crate) registry: BinaryRegistry,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }
    pub fn with_settings(settings: Settings) -> Self {
        let mut symbols = SymbolTable::new();
        let modules = ModuleTable::new(&mut symbols);
        Self {
            settings,
            symbols,
            modules,
            expressions: ExpressionArena::new(),
            image: ImageState::default(),
            deffacts: ConstructData::default(),
            defglobals: ConstructData::default(),
            facts: Vec::new(),
            bloaded: false,
            registry: BinaryRegistry::builtin(),
        }
    }
    pub fn settings(&self) -> &Settings {
        &self.settings
    }
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }
    pub fn expressions(&self) -> &ExpressionArena {
        &self.expressions
    }
    pub fn is_bloaded(&self) -> bool {
        self.bloaded
    }
    /// Adds a binary item, keeping the registry in dependency order.
    pub fn register_item(&mut self, item: Arc<dyn BinaryItem>) -> Result<()> {
        self.registry.register(item)
    }
    pub fn registry(&self) -> &BinaryRegistry {
        &self.registry
    }

    fn ensure_unlocked(&self, kind: &'static str, name: &str) -> Result<()> {
        if self.bloaded {
            return Err(ImageError::ConstructLocked { kind, name: name.to_owned() });
        }
        Ok(())
    }

    // ------------- Modules -------------
    pub fn define_module(&mut self, name: &str) -> Result<ModuleId> {
        self.ensure_unlocked("defmodule", name)?;
        Ok(self.modules.define(&mut self.symbols, name))
    }
    pub fn find_module(&self, name: &str) -> Option<ModuleId> {
        self.modules.find(&self.symbols, name)
    }
    pub fn module_name(&self, module: ModuleId) -> Option<&str> {
        self.modules.get(module).and_then(|m| self.symbols.name(m.name))
    }
    pub fn module_names(&self) -> Vec<&str> {
        self.modules.iter().filter_map(|(_, m)| self.symbols.name(m.name)).collect()
    }

    // ------------- Constructs -------------
    fn define_construct<T: Construct>(
        &mut self,
        module: &str,
        name: &str,
        payload: &[Expr],
        build: impl FnOnce(ConstructHeader, Option<ExprId>) -> T,
    ) -> Result<ConstructId> {
        self.ensure_unlocked(T::KIND, name)?;
        let module = self
            .find_module(module)
            .ok_or_else(|| ImageError::UnknownModule(module.to_owned()))?;
        let payload = self.expressions.install(&mut self.symbols, payload)?;
        self.undefine::<T>(name)?;
        let header = ConstructHeader::new(self.symbols.add_retained(name), module);
        let id = T::data_mut(self).defined.define(build(header, payload));
        debug!(kind = T::KIND, name, "construct defined");
        Ok(id)
    }

    /// Removes the construct called `name`, returning whether there was one.
    pub fn undefine<T: Construct>(&mut self, name: &str) -> Result<bool> {
        self.ensure_unlocked(T::KIND, name)?;
        let Some(symbol) = self.symbols.lookup(name) else {
            return Ok(false);
        };
        let data = T::data_mut(self);
        let Some(removed) = data.defined.find(symbol).and_then(|id| data.defined.remove(id)) else {
            return Ok(false);
        };
        release_construct(&removed, &mut self.symbols, &mut self.expressions);
        Ok(true)
    }

    /// Defines a deffacts holding one fact pattern per entry of `facts`,
    /// replacing any deffacts of the same name.
    pub fn define_deffacts(&mut self, module: &str, name: &str, facts: Vec<Expr>) -> Result<ConstructId> {
        self.define_construct(module, name, &facts, |header, assert_list| Deffacts { header, assert_list })
    }
    pub fn undefine_deffacts(&mut self, name: &str) -> Result<bool> {
        self.undefine::<Deffacts>(name)
    }
    pub fn define_defglobal(&mut self, module: &str, name: &str, initial: Expr) -> Result<ConstructId> {
        self.define_construct(module, name, &[initial], |header, initial| Defglobal {
            header,
            initial,
            value: None,
        })
    }

    /// Every construct of one kind in module order, from the loaded image when one is resident.
    pub fn constructs<T: Construct>(&self) -> Traversal<'_, T> {
        Traversal::new(T::data(self).view(self.bloaded), self.modules.len())
    }
    pub fn module_constructs<T: Construct>(&self, module: ModuleId) -> Traversal<'_, T> {
        Traversal::module(T::data(self).view(self.bloaded), module)
    }
    pub fn deffacts(&self) -> Traversal<'_, Deffacts> {
        self.constructs::<Deffacts>()
    }
    pub fn defglobals(&self) -> Traversal<'_, Defglobal> {
        self.constructs::<Defglobal>()
    }
    pub fn find_construct<T: Construct>(&self, name: &str) -> Option<(ConstructId, &T)> {
        let symbol = self.symbols.lookup(name)?;
        self.constructs::<T>()
            .find(|(_, _, item)| item.header().name == symbol)
            .map(|(_, id, item)| (id, item))
    }
    pub fn find_deffacts(&self, name: &str) -> Option<(ConstructId, &Deffacts)> {
        self.find_construct(name)
    }
    pub fn construct_name<T: Construct>(&self, item: &T) -> Option<&str> {
        self.symbols.name(item.header().name)
    }
    /// Per-module list entry of one construct kind for `module`.
    pub fn module_item<'a, T: Construct + 'a>(&'a self, module: ModuleId) -> Option<&'a ModuleItemHeader> {
        T::data(self).view(self.bloaded).module_item(module)
    }
    /// The arrays of the loaded image of one construct kind.
    pub fn loaded_image<T: BinaryConstruct>(&self) -> &ConstructImage<T> {
        &T::data(self).image
    }
    /// The owned form of a construct's payload.
    pub fn payload<T: Construct>(&self, item: &T) -> Result<Vec<Expr>> {
        self.expressions.tree(&self.symbols, item.payload())
    }

    // ------------- Reset -------------
    /// Rebuilds the fact list from every deffacts and sets every defglobal to its initial value.
    pub fn reset(&mut self) -> Result<()> {
        let mut facts: Vec<Fact> = Vec::new();
        for (_, _, item) in self.deffacts() {
            for fact in self.expressions.facts(&self.symbols, item.assert_list)? {
                if !facts.contains(&fact) {
                    facts.push(fact);
                }
            }
        }
        let mut values: Vec<(ConstructId, Option<Value>)> = Vec::new();
        for (_, id, global) in self.defglobals() {
            let value = match global.initial {
                Some(initial) => Some(self.expressions.evaluate(&self.symbols, initial)?),
                None => None,
            };
            values.push((id, value));
        }
        for (id, value) in values {
            let global = if self.bloaded {
                self.defglobals.image.get_mut(id)
            } else {
                self.defglobals.defined.get_mut(id)
            };
            if let Some(global) = global {
                global.value = value;
            }
        }
        debug!(facts = facts.len(), "reset");
        self.facts = facts;
        Ok(())
    }
    pub fn facts(&self) -> &[Fact] {
        &self.facts
    }
    pub fn global_value(&self, name: &str) -> Option<&Value> {
        self.find_construct::<Defglobal>(name).and_then(|(_, global)| global.value.as_ref())
    }

    // ------------- Lifecycle -------------
    /// Removes every construct and module but `MAIN`. A resident image is
    /// cleared item by item in reverse dependency order, giving back every
    /// reference the load took.
    pub fn clear(&mut self) {
        if self.bloaded {
            for item in self.registry.items().to_vec().iter().rev() {
                item.clear(self);
            }
            if self.image.expressions.count > 0 {
                self.expressions.truncate(&mut self.symbols, self.image.expressions.base);
            }
            self.image = ImageState::default();
            self.bloaded = false;
        } else {
            for item in self.deffacts.defined.drain() {
                release_construct(&item, &mut self.symbols, &mut self.expressions);
            }
            for item in self.defglobals.defined.drain() {
                release_construct(&item, &mut self.symbols, &mut self.expressions);
            }
            self.modules.reset(&mut self.symbols);
        }
        self.facts.clear();
        let collected = self.symbols.collect();
        debug!(collected, "environment cleared");
    }

    /// Drops a resident image without reference bookkeeping and consumes the environment.
    pub fn shutdown(mut self) {
        for item in self.registry.items().to_vec().iter().rev() {
            item.teardown(&mut self);
        }
        if self.bloaded {
            self.expressions.discard_from(self.image.expressions.base);
        }
        info!("environment shut down");
    }
}
