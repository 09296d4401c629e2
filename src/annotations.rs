//! Annotation associations of one table, split by where the annotation sits.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::assoc::AssociationIndex;
use crate::error::AnnoError;
use crate::intern::{Interners, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationCategory {
    Package,
    Class,
    Field,
    Method,
}

impl AnnotationCategory {
    pub const ALL: [AnnotationCategory; 4] = [
        AnnotationCategory::Package,
        AnnotationCategory::Class,
        AnnotationCategory::Field,
        AnnotationCategory::Method,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AnnotationCategory::Package => "package",
            AnnotationCategory::Class => "class",
            AnnotationCategory::Field => "field",
            AnnotationCategory::Method => "method",
        }
    }
}

impl fmt::Display for AnnotationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnnotationCategory {
    type Err = AnnoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "package" => Ok(AnnotationCategory::Package),
            "class" => Ok(AnnotationCategory::Class),
            "field" => Ok(AnnotationCategory::Field),
            "method" => Ok(AnnotationCategory::Method),
            other => Err(AnnoError::invalid(format!("unknown annotation category [ {other} ]"))),
        }
    }
}

/// Package, class, field and method annotation indexes.
///
/// Field and method indexes are keyed by the declaring class: they answer
/// "which classes have a field (method) carrying this annotation".
#[derive(Debug, Clone)]
pub struct AnnotationIndexTable {
    package: AssociationIndex,
    class: AssociationIndex,
    field: AssociationIndex,
    method: AssociationIndex,
}

impl AnnotationIndexTable {
    pub fn new(interners: &Interners) -> Self {
        let classes = &interners.classes;
        Self {
            package: AssociationIndex::new(Arc::clone(classes)),
            class: AssociationIndex::new(Arc::clone(classes)),
            field: AssociationIndex::new(Arc::clone(classes)),
            method: AssociationIndex::new(Arc::clone(classes)),
        }
    }

    pub fn index(&self, category: AnnotationCategory) -> &AssociationIndex {
        match category {
            AnnotationCategory::Package => &self.package,
            AnnotationCategory::Class => &self.class,
            AnnotationCategory::Field => &self.field,
            AnnotationCategory::Method => &self.method,
        }
    }

    pub fn index_mut(&mut self, category: AnnotationCategory) -> &mut AssociationIndex {
        match category {
            AnnotationCategory::Package => &mut self.package,
            AnnotationCategory::Class => &mut self.class,
            AnnotationCategory::Field => &mut self.field,
            AnnotationCategory::Method => &mut self.method,
        }
    }

    pub fn record(&mut self, category: AnnotationCategory, holder: Symbol, annotation: Symbol) {
        self.index_mut(category).record(holder, annotation);
    }

    pub fn is_empty(&self) -> bool {
        AnnotationCategory::ALL
            .iter()
            .all(|c| self.index(*c).is_empty())
    }

    /// Copies the associations whose holders were just attributed to this
    /// table's owner.
    pub fn add_selected(&mut self, other: &AnnotationIndexTable, holders: &HashSet<Symbol>) {
        for category in AnnotationCategory::ALL {
            self.index_mut(category)
                .add_selected(other.index(category), holders);
        }
    }

    pub fn reinterned(&self, interners: &Interners) -> Self {
        let classes = &interners.classes;
        Self {
            package: self.package.reinterned(Arc::clone(classes)),
            class: self.class.reinterned(Arc::clone(classes)),
            field: self.field.reinterned(Arc::clone(classes)),
            method: self.method.reinterned(Arc::clone(classes)),
        }
    }

    pub fn equals(&self, other: &AnnotationIndexTable, congruent: bool) -> bool {
        AnnotationCategory::ALL
            .iter()
            .all(|c| self.index(*c).equals(other.index(*c), congruent))
    }

    pub fn to_data(&self) -> AnnotationData {
        AnnotationData {
            package: self.package.to_pairs(),
            class: self.class.to_pairs(),
            field: self.field.to_pairs(),
            method: self.method.to_pairs(),
        }
    }

    pub fn from_data(data: &AnnotationData, interners: &Interners) -> Self {
        let mut table = Self::new(interners);
        for category in AnnotationCategory::ALL {
            let index = table.index_mut(category);
            for (holder, annotation) in data.pairs(category) {
                index.record_names(holder, annotation);
            }
        }
        table
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationData {
    #[serde(default)]
    pub package: Vec<(String, String)>,
    #[serde(default)]
    pub class: Vec<(String, String)>,
    #[serde(default)]
    pub field: Vec<(String, String)>,
    #[serde(default)]
    pub method: Vec<(String, String)>,
}

impl AnnotationData {
    pub fn pairs(&self, category: AnnotationCategory) -> &[(String, String)] {
        match category {
            AnnotationCategory::Package => &self.package,
            AnnotationCategory::Class => &self.class,
            AnnotationCategory::Field => &self.field,
            AnnotationCategory::Method => &self.method,
        }
    }
}

/// Where a detail text was recorded. `member` is a field-name symbol for
/// [`AnnotationCategory::Field`], a method-signature symbol for
/// [`AnnotationCategory::Method`], and absent otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DetailKey {
    pub category: AnnotationCategory,
    pub holder: Symbol,
    pub member: Option<Symbol>,
    pub annotation: Symbol,
}

/// Opaque annotation value text, kept only when detail recording is enabled.
#[derive(Debug, Clone)]
pub struct DetailStore {
    interners: Interners,
    entries: HashMap<DetailKey, String>,
}

impl DetailStore {
    pub fn new(interners: Interners) -> Self {
        Self {
            interners,
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn record(&mut self, key: DetailKey, text: impl Into<String>) {
        self.entries.entry(key).or_insert_with(|| text.into());
    }

    pub fn get(&self, key: &DetailKey) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Looks a detail up by name. Answers `None` if any name is unknown.
    pub fn lookup(
        &self,
        category: AnnotationCategory,
        holder: &str,
        member: Option<&str>,
        annotation: &str,
    ) -> Option<&str> {
        let member = match member {
            Some(m) => Some(self.member_interner(category)?.get(m)?),
            None => None,
        };
        let key = DetailKey {
            category,
            holder: self.interners.classes.get(holder)?,
            member,
            annotation: self.interners.classes.get(annotation)?,
        };
        self.get(&key)
    }

    fn member_interner(&self, category: AnnotationCategory) -> Option<&Arc<crate::intern::Interner>> {
        match category {
            AnnotationCategory::Field => Some(&self.interners.fields),
            AnnotationCategory::Method => Some(&self.interners.methods),
            AnnotationCategory::Package | AnnotationCategory::Class => None,
        }
    }

    fn translate(&self, other: &DetailStore, key: &DetailKey) -> DetailKey {
        let classes = &self.interners.classes;
        let member = match (key.member, self.member_interner(key.category), other.member_interner(key.category)) {
            (Some(m), Some(mine), Some(theirs)) => Some(mine.intern_from(theirs, m)),
            _ => None,
        };
        DetailKey {
            category: key.category,
            holder: classes.intern_from(&other.interners.classes, key.holder),
            member,
            annotation: classes.intern_from(&other.interners.classes, key.annotation),
        }
    }

    /// Copies the details of selected holders (holders in this store's
    /// class interner).
    pub fn add_selected(&mut self, other: &DetailStore, holders: &HashSet<Symbol>) {
        for (key, text) in other.entries.iter() {
            let Some(holder) = self
                .interners
                .classes
                .lookup_from(&other.interners.classes, key.holder)
            else {
                continue;
            };
            if !holders.contains(&holder) {
                continue;
            }
            let local = self.translate(other, key);
            self.entries.entry(local).or_insert_with(|| text.clone());
        }
    }

    pub fn reinterned(&self, interners: Interners) -> Self {
        let mut copy = Self::new(interners);
        for (key, text) in self.entries.iter() {
            let local = copy.translate(self, key);
            copy.entries.insert(local, text.clone());
        }
        copy
    }

    pub fn to_data(&self) -> Vec<DetailData> {
        let classes = &self.interners.classes;
        let mut data: Vec<DetailData> = self
            .entries
            .iter()
            .map(|(key, text)| DetailData {
                category: key.category,
                holder: classes.name(key.holder),
                member: match (key.member, self.member_interner(key.category)) {
                    (Some(m), Some(interner)) => Some(interner.name(m)),
                    _ => None,
                },
                annotation: classes.name(key.annotation),
                text: text.clone(),
            })
            .collect();
        data.sort_by(|a, b| {
            (a.category, &a.holder, &a.member, &a.annotation)
                .cmp(&(b.category, &b.holder, &b.member, &b.annotation))
        });
        data
    }

    pub fn from_data(data: &[DetailData], interners: Interners) -> Self {
        let mut store = Self::new(interners);
        for entry in data {
            let member = match (&entry.member, store.member_interner(entry.category)) {
                (Some(m), Some(interner)) => Some(interner.intern(m)),
                _ => None,
            };
            let key = DetailKey {
                category: entry.category,
                holder: store.interners.classes.intern(&entry.holder),
                member,
                annotation: store.interners.classes.intern(&entry.annotation),
            };
            store.entries.insert(key, entry.text.clone());
        }
        store
    }

    /// Details grouped by holder name, for display.
    pub fn by_holder(&self) -> BTreeMap<String, Vec<DetailData>> {
        let mut grouped: BTreeMap<String, Vec<DetailData>> = BTreeMap::new();
        for entry in self.to_data() {
            grouped.entry(entry.holder.clone()).or_default().push(entry);
        }
        grouped
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailData {
    pub category: AnnotationCategory,
    pub holder: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    pub annotation: String,
    pub text: String,
}
