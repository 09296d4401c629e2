//! The union class table across every layer, partitioned by layer.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::classes::{ClassRelationTable, ClassTableData, NewlyAdded};
use crate::intern::{Interner, Symbol};
use crate::policy::Policy;

#[derive(Debug, Clone)]
pub struct LayerPartition {
    pub name: String,
    pub policy: Policy,
    pub packages: HashSet<Symbol>,
    pub classes: HashSet<Symbol>,
}

#[derive(Debug, Clone)]
pub struct MultiClassTable {
    table: ClassRelationTable,
    added_packages: HashSet<Symbol>,
    added_classes: HashSet<Symbol>,
    layers: Vec<LayerPartition>,
}

impl MultiClassTable {
    pub fn new(interner: Arc<Interner>) -> Self {
        Self {
            table: ClassRelationTable::new(interner),
            added_packages: HashSet::new(),
            added_classes: HashSet::new(),
            layers: Vec::new(),
        }
    }

    pub fn table(&self) -> &ClassRelationTable {
        &self.table
    }

    pub fn interner(&self) -> &Arc<Interner> {
        self.table.interner()
    }

    pub fn layers(&self) -> &[LayerPartition] {
        &self.layers
    }

    pub fn layer(&self, name: &str) -> Option<&LayerPartition> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Name of the layer a class was attributed to.
    pub fn layer_of(&self, class: Symbol) -> Option<&str> {
        self.layers
            .iter()
            .find(|l| l.classes.contains(&class))
            .map(|l| l.name.as_str())
    }

    pub fn is_added(&self, class: Symbol) -> bool {
        self.added_classes.contains(&class)
    }

    /// Adds the next layer in declared order. Names already attributed to an
    /// earlier layer are masked. Answers the names this layer contributed.
    pub fn add_layer(&mut self, name: &str, policy: Policy, other: &ClassRelationTable) -> NewlyAdded {
        let newly = self
            .table
            .restricted_add(other, &mut self.added_packages, &mut self.added_classes);

        match self.layers.iter_mut().find(|l| l.name == name) {
            Some(partition) => {
                partition.packages.extend(newly.packages.iter().copied());
                partition.classes.extend(newly.classes.iter().copied());
            }
            None => self.layers.push(LayerPartition {
                name: name.to_string(),
                policy,
                packages: newly.packages.clone(),
                classes: newly.classes.clone(),
            }),
        }
        newly
    }

    pub fn class_names(&self, layer: &str) -> BTreeSet<String> {
        self.layer(layer)
            .map(|l| self.interner().names(l.classes.iter()))
            .unwrap_or_default()
    }

    pub fn to_data(&self) -> MultiClassData {
        let interner = self.interner();
        MultiClassData {
            classes: self.table.to_data(),
            layers: self
                .layers
                .iter()
                .map(|l| LayerPartitionData {
                    name: l.name.clone(),
                    policy: l.policy,
                    packages: interner.names(l.packages.iter()).into_iter().collect(),
                    classes: interner.names(l.classes.iter()).into_iter().collect(),
                })
                .collect(),
        }
    }

    pub fn from_data(data: &MultiClassData, interner: Arc<Interner>) -> Self {
        let table = ClassRelationTable::from_data(&data.classes, Arc::clone(&interner));
        let layers = data
            .layers
            .iter()
            .map(|l| LayerPartition {
                name: l.name.clone(),
                policy: l.policy,
                packages: l.packages.iter().map(|p| interner.intern(p)).collect(),
                classes: l.classes.iter().map(|c| interner.intern(c)).collect(),
            })
            .collect();
        Self {
            added_packages: table.packages().clone(),
            added_classes: table.classes().clone(),
            table,
            layers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerPartitionData {
    pub name: String,
    pub policy: Policy,
    pub packages: Vec<String>,
    pub classes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiClassData {
    pub classes: ClassTableData,
    pub layers: Vec<LayerPartitionData>,
}
