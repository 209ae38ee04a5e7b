// used to keep the one-to-one mapping between symbol names and their assigned ids
use bimap::BiMap;

use core::hash::BuildHasherDefault;
use std::collections::HashMap;
use std::fmt;
use seahash::SeaHasher;

pub type IdHasher = BuildHasherDefault<SeaHasher>;

// ------------- Symbol -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SymbolId(u32);

impl SymbolId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}
impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Interning service for symbol and string atoms.
///
/// A symbol is created with a reference count of zero; every structure
/// that holds on to it calls [`SymbolTable::retain`] and gives it back with
/// [`SymbolTable::release`]. Symbols whose count is zero are only dropped
/// by an explicit [`SymbolTable::collect`], so ids handed out stay valid
/// while a save or load is in flight.
#[derive(Debug)]
pub struct SymbolTable {
    kept: BiMap<String, SymbolId>,
    counts: HashMap<SymbolId, u64, IdHasher>,
    lower_bound: u32,
    released: Vec<u32>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            kept: BiMap::new(),
            counts: HashMap::default(),
            lower_bound: 0,
            released: Vec::new(),
        }
    }
    /// Interns `name`, returning the existing id if it is already known.
    pub fn add(&mut self, name: &str) -> SymbolId {
        if let Some(id) = self.kept.get_by_left(name) {
            return *id;
        }
        let id = SymbolId(self.released.pop().unwrap_or_else(|| {
            let next = self.lower_bound;
            self.lower_bound += 1;
            next
        }));
        self.kept.insert(name.to_owned(), id);
        self.counts.insert(id, 0);
        id
    }
    /// Interns `name` and takes a reference to it in one step.
    pub fn add_retained(&mut self, name: &str) -> SymbolId {
        let id = self.add(name);
        self.retain(id);
        id
    }
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.kept.get_by_left(name).copied()
    }
    pub fn name(&self, id: SymbolId) -> Option<&str> {
        self.kept.get_by_right(&id).map(String::as_str)
    }
    pub fn retain(&mut self, id: SymbolId) {
        if let Some(count) = self.counts.get_mut(&id) {
            *count += 1;
        }
    }
    pub fn release(&mut self, id: SymbolId) {
        if let Some(count) = self.counts.get_mut(&id) {
            *count = count.saturating_sub(1);
        }
    }
    pub fn count(&self, id: SymbolId) -> u64 {
        self.counts.get(&id).copied().unwrap_or(0)
    }
    /// Drops every symbol nobody holds a reference to and returns how many went.
    pub fn collect(&mut self) -> usize {
        let orphans: Vec<SymbolId> = self
            .counts
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in &orphans {
            self.counts.remove(id);
            self.kept.remove_by_right(id);
            self.released.push(id.0);
        }
        orphans.len()
    }
    pub fn len(&self) -> usize {
        self.kept.len()
    }
    pub fn is_empty(&self) -> bool {
        self.kept.is_empty()
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}
