//! Many-to-many holder/held relation with lookup in both directions.
//!
//! Backs every annotation index: holders are annotated packages or classes,
//! held values are annotation class names. Both sides are symbols of the same
//! class-name interner.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::intern::{Interner, Symbol};

#[derive(Debug, Clone)]
pub struct AssociationIndex {
    interner: Arc<Interner>,
    held_by_holder: HashMap<Symbol, HashSet<Symbol>>,
    holders_by_held: HashMap<Symbol, HashSet<Symbol>>,
}

impl AssociationIndex {
    pub fn new(interner: Arc<Interner>) -> Self {
        Self {
            interner,
            held_by_holder: HashMap::new(),
            holders_by_held: HashMap::new(),
        }
    }

    pub fn interner(&self) -> &Arc<Interner> {
        &self.interner
    }

    pub fn record(&mut self, holder: Symbol, held: Symbol) {
        self.held_by_holder.entry(holder).or_default().insert(held);
        self.holders_by_held.entry(held).or_default().insert(holder);
    }

    pub fn record_names(&mut self, holder: &str, held: &str) {
        let holder = self.interner.intern(holder);
        let held = self.interner.intern(held);
        self.record(holder, held);
    }

    pub fn held_of(&self, holder: Symbol) -> Option<&HashSet<Symbol>> {
        self.held_by_holder.get(&holder)
    }

    pub fn holders_of(&self, held: Symbol) -> Option<&HashSet<Symbol>> {
        self.holders_by_held.get(&held)
    }

    pub fn holds(&self, holder: Symbol, held: Symbol) -> bool {
        self.held_by_holder
            .get(&holder)
            .is_some_and(|set| set.contains(&held))
    }

    pub fn holders(&self) -> impl Iterator<Item = &Symbol> {
        self.held_by_holder.keys()
    }

    pub fn held(&self) -> impl Iterator<Item = &Symbol> {
        self.holders_by_held.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.held_by_holder.is_empty()
    }

    pub fn len(&self) -> usize {
        self.held_by_holder.values().map(HashSet::len).sum()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (Symbol, Symbol)> + '_ {
        self.held_by_holder
            .iter()
            .flat_map(|(holder, held)| held.iter().map(move |h| (*holder, *h)))
    }

    /// Copies the associations of the selected holders of `other`.
    pub fn add_selected(&mut self, other: &AssociationIndex, holders: &HashSet<Symbol>) {
        for (holder, held) in other.held_by_holder.iter() {
            let Some(local_holder) = self.interner.lookup_from(&other.interner, *holder) else {
                continue;
            };
            if !holders.contains(&local_holder) {
                continue;
            }
            for h in held {
                let local_held = self.interner.intern_from(&other.interner, *h);
                self.record(local_holder, local_held);
            }
        }
    }

    /// Rebuilds this index against another interner.
    pub fn reinterned(&self, interner: Arc<Interner>) -> Self {
        let mut copy = Self::new(interner);
        for (holder, held) in self.pairs() {
            let holder = copy.interner.intern_from(&self.interner, holder);
            let held = copy.interner.intern_from(&self.interner, held);
            copy.record(holder, held);
        }
        copy
    }

    /// Content equality. When the two indexes do not share an interner
    /// (`congruent == false`) the other side's symbols are looked up by name.
    pub fn equals(&self, other: &AssociationIndex, congruent: bool) -> bool {
        if self.held_by_holder.len() != other.held_by_holder.len()
            || self.holders_by_held.len() != other.holders_by_held.len()
        {
            return false;
        }

        if congruent {
            return self.held_by_holder == other.held_by_holder;
        }

        for (holder, held) in other.held_by_holder.iter() {
            let Some(local_holder) = self.interner.lookup_from(&other.interner, *holder) else {
                return false;
            };
            let Some(local_held) = self.held_by_holder.get(&local_holder) else {
                return false;
            };
            if local_held.len() != held.len() {
                return false;
            }
            for h in held {
                match self.interner.lookup_from(&other.interner, *h) {
                    Some(local) if local_held.contains(&local) => {}
                    _ => return false,
                }
            }
        }
        true
    }

    /// Holder/held name pairs, sorted, for persistence.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .pairs()
            .map(|(holder, held)| (self.interner.name(holder), self.interner.name(held)))
            .collect();
        pairs.sort();
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(interner: Arc<Interner>, pairs: &[(&str, &str)]) -> AssociationIndex {
        let mut index = AssociationIndex::new(interner);
        for (holder, held) in pairs {
            index.record_names(holder, held);
        }
        index
    }

    #[test]
    fn record_maintains_both_directions() {
        let interner = Arc::new(Interner::new("classes"));
        let index = index_with(
            Arc::clone(&interner),
            &[("a.A", "x.Foo"), ("a.B", "x.Foo"), ("a.A", "x.Bar")],
        );

        let a = interner.intern("a.A");
        let foo = interner.intern("x.Foo");
        assert_eq!(index.held_of(a).map(HashSet::len), Some(2));
        assert_eq!(index.holders_of(foo).map(HashSet::len), Some(2));
        assert!(index.holds(a, foo));
        assert_eq!(index.holders().count(), 2);
        assert_eq!(index.held().count(), 2);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn equality_across_interners_uses_names() {
        let left = index_with(Arc::new(Interner::new("classes")), &[("a.A", "x.Foo")]);
        let right_interner = Arc::new(Interner::new("classes"));
        right_interner.intern("shifts.symbols");
        let right = index_with(right_interner, &[("a.A", "x.Foo")]);
        let other = index_with(Arc::new(Interner::new("classes")), &[("a.A", "x.Bar")]);

        assert!(left.equals(&right, false));
        assert!(right.equals(&left, false));
        assert!(!left.equals(&other, false));
    }

    #[test]
    fn add_selected_restricts_to_holders() {
        let source = index_with(
            Arc::new(Interner::new("classes")),
            &[("a.A", "x.Foo"), ("a.B", "x.Foo")],
        );
        let target_interner = Arc::new(Interner::new("classes"));
        let mut target = AssociationIndex::new(Arc::clone(&target_interner));
        let selected: HashSet<Symbol> = [target_interner.intern("a.B")].into_iter().collect();

        target.add_selected(&source, &selected);
        assert_eq!(target.to_pairs(), vec![("a.B".to_string(), "x.Foo".to_string())]);
    }
}
