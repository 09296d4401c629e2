//! Class relationship data for one table: packages, classes, superclass and
//! interface edges, and modifiers.
//!
//! Descendant and implementor closures are computed on first use and kept
//! until the table is next mutated. Published tables are not mutated, so in
//! practice each closure is computed once.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use crate::intern::{Interner, Symbol};
use crate::policy::Modifiers;

type Closure = HashMap<Symbol, HashSet<Symbol>>;

/// Names newly attributed by a [`ClassRelationTable::restricted_add`].
#[derive(Debug, Default, Clone)]
pub struct NewlyAdded {
    pub packages: HashSet<Symbol>,
    pub classes: HashSet<Symbol>,
}

impl NewlyAdded {
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty() && self.classes.is_empty()
    }

    /// Holders selectable by annotation merges: packages and classes alike.
    pub fn holders(&self) -> HashSet<Symbol> {
        self.packages.union(&self.classes).copied().collect()
    }
}

#[derive(Debug, Clone)]
pub struct ClassRelationTable {
    interner: Arc<Interner>,
    packages: HashSet<Symbol>,
    classes: HashSet<Symbol>,
    superclasses: HashMap<Symbol, Symbol>,
    interfaces: HashMap<Symbol, Vec<Symbol>>,
    modifiers: HashMap<Symbol, u32>,
    descendants: OnceLock<Closure>,
    implementors: OnceLock<Closure>,
}

impl ClassRelationTable {
    pub fn new(interner: Arc<Interner>) -> Self {
        Self {
            interner,
            packages: HashSet::new(),
            classes: HashSet::new(),
            superclasses: HashMap::new(),
            interfaces: HashMap::new(),
            modifiers: HashMap::new(),
            descendants: OnceLock::new(),
            implementors: OnceLock::new(),
        }
    }

    pub fn interner(&self) -> &Arc<Interner> {
        &self.interner
    }

    fn invalidate(&mut self) {
        self.descendants = OnceLock::new();
        self.implementors = OnceLock::new();
    }

    pub fn record_package(&mut self, name: Symbol) -> bool {
        self.invalidate();
        self.packages.insert(name)
    }

    /// Records a class. Answers false, leaving the table unchanged, when the
    /// class is already present.
    pub fn record(
        &mut self,
        name: Symbol,
        superclass: Option<Symbol>,
        interfaces: Vec<Symbol>,
        modifiers: u32,
    ) -> bool {
        if !self.classes.insert(name) {
            return false;
        }
        self.invalidate();
        if let Some(superclass) = superclass {
            self.superclasses.insert(name, superclass);
        }
        if !interfaces.is_empty() {
            self.interfaces.insert(name, interfaces);
        }
        self.modifiers.insert(name, modifiers);
        true
    }

    pub fn record_names(
        &mut self,
        name: &str,
        superclass: Option<&str>,
        interfaces: &[&str],
        modifiers: u32,
    ) -> bool {
        let name = self.interner.intern(name);
        let superclass = superclass.map(|s| self.interner.intern(s));
        let interfaces = interfaces.iter().map(|i| self.interner.intern(i)).collect();
        self.record(name, superclass, interfaces, modifiers)
    }

    pub fn packages(&self) -> &HashSet<Symbol> {
        &self.packages
    }

    pub fn classes(&self) -> &HashSet<Symbol> {
        &self.classes
    }

    pub fn contains_class(&self, name: Symbol) -> bool {
        self.classes.contains(&name)
    }

    pub fn contains_package(&self, name: Symbol) -> bool {
        self.packages.contains(&name)
    }

    pub fn superclass_of(&self, name: Symbol) -> Option<Symbol> {
        self.superclasses.get(&name).copied()
    }

    pub fn interfaces_of(&self, name: Symbol) -> &[Symbol] {
        self.interfaces.get(&name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn modifiers_of(&self, name: Symbol) -> Option<u32> {
        self.modifiers.get(&name).copied()
    }

    pub fn is_interface(&self, name: Symbol) -> bool {
        self.modifiers_of(name)
            .is_some_and(|m| Modifiers::from_bits_truncate(m).contains(Modifiers::INTERFACE))
    }

    /// Every superclass and interface name referenced by a recorded class.
    pub fn referenced(&self, name: Symbol) -> impl Iterator<Item = Symbol> + '_ {
        self.superclass_of(name)
            .into_iter()
            .chain(self.interfaces_of(name).iter().copied())
    }

    /// Transitive subclasses of `class`.
    pub fn descendants_of(&self, class: Symbol) -> Option<&HashSet<Symbol>> {
        self.descendants
            .get_or_init(|| self.compute_descendants())
            .get(&class)
    }

    /// Classes which implement `interface` directly, through a superclass, or
    /// through a sub-interface.
    pub fn implementors_of(&self, interface: Symbol) -> Option<&HashSet<Symbol>> {
        self.implementors
            .get_or_init(|| self.compute_implementors())
            .get(&interface)
    }

    fn compute_descendants(&self) -> Closure {
        let mut children: HashMap<Symbol, Vec<Symbol>> = HashMap::new();
        for (sub, sup) in self.superclasses.iter() {
            children.entry(*sup).or_default().push(*sub);
        }

        let mut closure = Closure::new();
        for root in children.keys() {
            let mut found = HashSet::new();
            let mut stack: Vec<Symbol> = children[root].clone();
            while let Some(next) = stack.pop() {
                if next == *root || !found.insert(next) {
                    continue;
                }
                if let Some(grand) = children.get(&next) {
                    stack.extend(grand.iter().copied());
                }
            }
            closure.insert(*root, found);
        }
        closure
    }

    fn compute_implementors(&self) -> Closure {
        let mut listers: HashMap<Symbol, Vec<Symbol>> = HashMap::new();
        for (class, interfaces) in self.interfaces.iter() {
            for interface in interfaces {
                listers.entry(*interface).or_default().push(*class);
            }
        }

        let descendants = self.descendants.get_or_init(|| self.compute_descendants());

        let mut closure = Closure::new();
        for root in listers.keys() {
            let mut found = HashSet::new();
            let mut visited_interfaces = HashSet::from([*root]);
            let mut stack: Vec<Symbol> = listers[root].clone();
            while let Some(next) = stack.pop() {
                if self.is_interface(next) {
                    if visited_interfaces.insert(next)
                        && let Some(sub) = listers.get(&next)
                    {
                        stack.extend(sub.iter().copied());
                    }
                    continue;
                }
                if found.insert(next)
                    && let Some(subclasses) = descendants.get(&next)
                {
                    found.extend(subclasses.iter().copied());
                }
            }
            closure.insert(*root, found);
        }
        closure
    }

    /// Walks the superclass chain of `candidate` looking for `target`. For an
    /// interface target each level's interfaces, and their super-interfaces,
    /// are checked as well.
    pub fn is_instance_of(&self, candidate: Symbol, target: Symbol, target_is_interface: bool) -> bool {
        let mut seen = HashSet::new();
        let mut current = Some(candidate);
        while let Some(class) = current {
            if class == target {
                return true;
            }
            if !seen.insert(class) {
                return false;
            }
            if target_is_interface && self.reaches_interface(class, target) {
                return true;
            }
            current = self.superclass_of(class);
        }
        false
    }

    fn reaches_interface(&self, class: Symbol, target: Symbol) -> bool {
        let mut visited = HashSet::new();
        let mut stack: Vec<Symbol> = self.interfaces_of(class).to_vec();
        while let Some(interface) = stack.pop() {
            if interface == target {
                return true;
            }
            if visited.insert(interface) {
                stack.extend(self.interfaces_of(interface).iter().copied());
            }
        }
        false
    }

    /// Merges `other` into this table, skipping every name already in the
    /// running `added_packages` / `added_classes` sets (which are in this
    /// table's interner). Answers the names this call added, so dependent
    /// merges can be restricted to them.
    pub fn restricted_add(
        &mut self,
        other: &ClassRelationTable,
        added_packages: &mut HashSet<Symbol>,
        added_classes: &mut HashSet<Symbol>,
    ) -> NewlyAdded {
        let mut newly = NewlyAdded::default();

        for package in other.packages.iter() {
            let local = self.interner.intern_from(&other.interner, *package);
            if added_packages.insert(local) {
                self.packages.insert(local);
                newly.packages.insert(local);
            }
        }

        for class in other.classes.iter() {
            let local = self.interner.intern_from(&other.interner, *class);
            if !added_classes.insert(local) {
                continue;
            }
            newly.classes.insert(local);
            self.copy_class(other, *class, local);
        }

        if !newly.is_empty() {
            self.invalidate();
        }
        newly
    }

    /// Copies exactly the selected names of `other`. Used to fill a policy
    /// bucket with the names a multi-table merge has just attributed.
    pub fn add_selected(&mut self, other: &ClassRelationTable, selected: &NewlyAdded) {
        for package in other.packages.iter() {
            if let Some(local) = self.interner.lookup_from(&other.interner, *package)
                && selected.packages.contains(&local)
            {
                self.packages.insert(local);
            }
        }
        for class in other.classes.iter() {
            if let Some(local) = self.interner.lookup_from(&other.interner, *class)
                && selected.classes.contains(&local)
                && !self.classes.contains(&local)
            {
                self.copy_class(other, *class, local);
            }
        }
        self.invalidate();
    }

    fn copy_class(&mut self, other: &ClassRelationTable, class: Symbol, local: Symbol) {
        self.classes.insert(local);
        if let Some(superclass) = other.superclasses.get(&class) {
            let superclass = self.interner.intern_from(&other.interner, *superclass);
            self.superclasses.insert(local, superclass);
        }
        if let Some(interfaces) = other.interfaces.get(&class) {
            let interfaces = interfaces
                .iter()
                .map(|i| self.interner.intern_from(&other.interner, *i))
                .collect();
            self.interfaces.insert(local, interfaces);
        }
        if let Some(modifiers) = other.modifiers.get(&class) {
            self.modifiers.insert(local, *modifiers);
        }
    }

    pub fn reinterned(&self, interner: Arc<Interner>) -> Self {
        let mut copy = Self::new(interner);
        for package in self.packages.iter() {
            let local = copy.interner.intern_from(&self.interner, *package);
            copy.packages.insert(local);
        }
        for class in self.classes.iter() {
            let local = copy.interner.intern_from(&self.interner, *class);
            copy.copy_class(self, *class, local);
        }
        copy
    }

    pub fn equals(&self, other: &ClassRelationTable, congruent: bool) -> bool {
        if self.packages.len() != other.packages.len()
            || self.classes.len() != other.classes.len()
            || self.superclasses.len() != other.superclasses.len()
            || self.interfaces.len() != other.interfaces.len()
        {
            return false;
        }

        if congruent {
            return self.packages == other.packages
                && self.classes == other.classes
                && self.superclasses == other.superclasses
                && self.interfaces == other.interfaces
                && self.modifiers == other.modifiers;
        }

        let map = |sym: Symbol| self.interner.lookup_from(&other.interner, sym);

        for package in other.packages.iter() {
            if !map(*package).is_some_and(|p| self.packages.contains(&p)) {
                return false;
            }
        }
        for class in other.classes.iter() {
            let Some(local) = map(*class) else {
                return false;
            };
            if !self.classes.contains(&local) {
                return false;
            }
            let other_super = other.superclasses.get(class).map(|s| map(*s));
            let local_super = self.superclasses.get(&local).map(|s| Some(*s));
            if other_super != local_super {
                return false;
            }
            let other_ifaces: Vec<Option<Symbol>> = other
                .interfaces_of(*class)
                .iter()
                .map(|i| map(*i))
                .collect();
            let local_ifaces: Vec<Option<Symbol>> =
                self.interfaces_of(local).iter().map(|i| Some(*i)).collect();
            if other_ifaces != local_ifaces {
                return false;
            }
            if other.modifiers.get(class) != self.modifiers.get(&local) {
                return false;
            }
        }
        true
    }

    pub fn to_data(&self) -> ClassTableData {
        let name = |sym: Symbol| self.interner.name(sym);
        let mut packages: Vec<String> = self.packages.iter().map(|p| name(*p)).collect();
        packages.sort();
        let mut classes: Vec<ClassData> = self
            .classes
            .iter()
            .map(|class| ClassData {
                name: name(*class),
                superclass: self.superclass_of(*class).map(name),
                interfaces: self.interfaces_of(*class).iter().map(|i| name(*i)).collect(),
                modifiers: self.modifiers_of(*class).unwrap_or(0),
            })
            .collect();
        classes.sort_by(|a, b| a.name.cmp(&b.name));
        ClassTableData { packages, classes }
    }

    pub fn from_data(data: &ClassTableData, interner: Arc<Interner>) -> Self {
        let mut table = Self::new(interner);
        for package in data.packages.iter() {
            let sym = table.interner.intern(package);
            table.packages.insert(sym);
        }
        for class in data.classes.iter() {
            let interfaces: Vec<&str> = class.interfaces.iter().map(String::as_str).collect();
            table.record_names(
                &class.name,
                class.superclass.as_deref(),
                &interfaces,
                class.modifiers,
            );
        }
        table
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassData {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superclass: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub modifiers: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassTableData {
    pub packages: Vec<String>,
    pub classes: Vec<ClassData>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const IFACE: u32 = 0x0601;

    fn table() -> ClassRelationTable {
        let mut t = ClassRelationTable::new(Arc::new(Interner::new("classes")));
        t.record_names("a.Base", Some("java.lang.Object"), &["a.Marker"], 0x0001);
        t.record_names("a.Mid", Some("a.Base"), &[], 0x0001);
        t.record_names("a.Leaf", Some("a.Mid"), &["a.Other"], 0x0011);
        t.record_names("a.Marker", Some("java.lang.Object"), &[], IFACE);
        t.record_names("a.SubMarker", Some("java.lang.Object"), &["a.Marker"], IFACE);
        t.record_names("a.Lone", Some("java.lang.Object"), &["a.SubMarker"], 0x0001);
        t
    }

    fn names(t: &ClassRelationTable, set: Option<&HashSet<Symbol>>) -> Vec<String> {
        let mut v: Vec<String> = set
            .map(|s| s.iter().map(|x| t.interner().name(*x)).collect())
            .unwrap_or_default();
        v.sort();
        v
    }

    #[test]
    fn descendants_are_transitive() {
        let t = table();
        let base = t.interner().intern("a.Base");
        assert_eq!(names(&t, t.descendants_of(base)), vec!["a.Leaf", "a.Mid"]);
        let leaf = t.interner().intern("a.Leaf");
        assert!(t.descendants_of(leaf).is_none());
    }

    #[test]
    fn implementors_follow_subclasses_and_subinterfaces() {
        let t = table();
        let marker = t.interner().intern("a.Marker");
        assert_eq!(
            names(&t, t.implementors_of(marker)),
            vec!["a.Base", "a.Leaf", "a.Lone", "a.Mid"]
        );
    }

    #[test]
    fn is_instance_of_walks_superclasses_and_interfaces() {
        let t = table();
        let i = |n: &str| t.interner().intern(n);
        assert!(t.is_instance_of(i("a.Leaf"), i("a.Base"), false));
        assert!(t.is_instance_of(i("a.Leaf"), i("java.lang.Object"), false));
        assert!(t.is_instance_of(i("a.Leaf"), i("a.Marker"), true));
        assert!(t.is_instance_of(i("a.Lone"), i("a.Marker"), true));
        assert!(!t.is_instance_of(i("a.Base"), i("a.Mid"), false));
        assert!(!t.is_instance_of(i("a.Lone"), i("a.Other"), true));
    }

    #[test]
    fn restricted_add_masks_names_already_added() {
        let mut first = ClassRelationTable::new(Arc::new(Interner::new("classes")));
        first.record_names("a.A", Some("java.lang.Object"), &[], 1);
        let mut second = ClassRelationTable::new(Arc::new(Interner::new("classes")));
        second.record_names("a.A", Some("a.Shadow"), &[], 1);
        second.record_names("a.B", Some("a.A"), &[], 1);

        let mut merged = ClassRelationTable::new(Arc::new(Interner::new("classes")));
        let mut packages = HashSet::new();
        let mut classes = HashSet::new();

        let one = merged.restricted_add(&first, &mut packages, &mut classes);
        assert_eq!(one.classes.len(), 1);
        let two = merged.restricted_add(&second, &mut packages, &mut classes);
        assert_eq!(names(&merged, Some(&two.classes)), vec!["a.B"]);

        let a = merged.interner().intern("a.A");
        let superclass = merged.superclass_of(a).map(|s| merged.interner().name(s));
        assert_eq!(superclass.as_deref(), Some("java.lang.Object"));
    }

    #[test]
    fn equality_survives_reinterning_and_data_round_trip() {
        let t = table();
        let copy = t.reinterned(Arc::new(Interner::new("classes")));
        assert!(t.equals(&copy, false));
        assert!(t.equals(&t.clone(), true));

        let restored = ClassRelationTable::from_data(&t.to_data(), Arc::new(Interner::new("classes")));
        assert!(restored.equals(&t, false));

        let mut changed = copy.clone();
        changed.record_names("a.New", None, &[], 0);
        assert!(!t.equals(&changed, false));
    }
}
