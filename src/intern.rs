//! Generation-scoped string interning.
//!
//! Every table in the crate stores names as [`Symbol`]s issued by an
//! [`Interner`]. Symbols are dense integers, so set and map operations compare
//! identities rather than strings. A symbol is only meaningful together with
//! the interner that issued it; crossing from one interner to another always
//! goes through the string (see [`Interner::lookup_from`] and
//! [`Interner::intern_from`]).
//!
//! Class names, field names and method signatures are interned separately,
//! bundled as [`Interners`].

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

impl Symbol {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Default)]
struct InternerInner {
    names: Vec<Arc<str>>,
    index: HashMap<Arc<str>, Symbol>,
}

#[derive(Debug)]
pub struct Interner {
    generation: u64,
    label: &'static str,
    inner: RwLock<InternerInner>,
}

impl Interner {
    pub fn new(label: &'static str) -> Self {
        Self {
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            label,
            inner: RwLock::new(InternerInner::default()),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// True when both interners issue the same symbols for the same strings.
    pub fn congruent(&self, other: &Interner) -> bool {
        self.generation == other.generation
    }

    /// Insert-if-absent. Always answers a symbol.
    pub fn intern(&self, name: &str) -> Symbol {
        if let Some(sym) = self.inner.read().index.get(name) {
            return *sym;
        }

        let mut inner = self.inner.write();
        if let Some(sym) = inner.index.get(name) {
            return *sym;
        }
        let sym = Symbol(inner.names.len() as u32);
        let shared: Arc<str> = Arc::from(name);
        inner.names.push(Arc::clone(&shared));
        inner.index.insert(shared, sym);
        sym
    }

    /// Lookup only: `None` when the name was never interned here.
    pub fn get(&self, name: &str) -> Option<Symbol> {
        self.inner.read().index.get(name).copied()
    }

    /// Combined form of [`intern`](Self::intern) and [`get`](Self::get).
    pub fn intern_with(&self, name: &str, force: bool) -> Option<Symbol> {
        if force {
            Some(self.intern(name))
        } else {
            self.get(name)
        }
    }

    pub fn resolve(&self, sym: Symbol) -> Option<Arc<str>> {
        self.inner.read().names.get(sym.index()).cloned()
    }

    /// Resolves a symbol that is known to come from this interner.
    pub fn name(&self, sym: Symbol) -> String {
        self.resolve(sym).map(|s| s.to_string()).unwrap_or_default()
    }

    pub fn names<'a>(&self, syms: impl IntoIterator<Item = &'a Symbol>) -> BTreeSet<String> {
        let inner = self.inner.read();
        syms.into_iter()
            .filter_map(|sym| inner.names.get(sym.index()))
            .map(|s| s.to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maps `sym`, issued by `other`, into this interner without inserting.
    pub fn lookup_from(&self, other: &Interner, sym: Symbol) -> Option<Symbol> {
        if self.congruent(other) {
            return Some(sym);
        }
        let name = other.resolve(sym)?;
        self.get(&name)
    }

    /// Maps `sym`, issued by `other`, into this interner, inserting if needed.
    pub fn intern_from(&self, other: &Interner, sym: Symbol) -> Symbol {
        if self.congruent(other) {
            return sym;
        }
        // Resolve before interning: the two locks are never held together.
        let name = other.resolve(sym).unwrap_or_else(|| Arc::from(""));
        self.intern(&name)
    }

    pub fn intern_set_from(&self, other: &Interner, syms: &HashSet<Symbol>) -> HashSet<Symbol> {
        if self.congruent(other) {
            return syms.clone();
        }
        syms.iter().map(|s| self.intern_from(other, *s)).collect()
    }
}

/// The three interning scopes used by one table generation.
#[derive(Debug, Clone)]
pub struct Interners {
    pub classes: Arc<Interner>,
    pub fields: Arc<Interner>,
    pub methods: Arc<Interner>,
}

impl Interners {
    pub fn new() -> Self {
        Self {
            classes: Arc::new(Interner::new("classes")),
            fields: Arc::new(Interner::new("fields")),
            methods: Arc::new(Interner::new("methods")),
        }
    }

    pub fn congruent(&self, other: &Interners) -> bool {
        self.classes.congruent(&other.classes)
            && self.fields.congruent(&other.fields)
            && self.methods.congruent(&other.methods)
    }
}

impl Default for Interners {
    fn default() -> Self {
        Self::new()
    }
}
