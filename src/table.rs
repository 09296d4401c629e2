//! The per-layer unit of scanning, caching and merging.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::annotations::{AnnotationData, AnnotationIndexTable, DetailData, DetailStore};
use crate::classes::{ClassRelationTable, ClassTableData, NewlyAdded};
use crate::intern::Interners;

/// Comparable fingerprint of a layer's content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stamp(String);

impl Stamp {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Stamp for content with no usable fingerprint. Never equal to a cached
    /// stamp, so such layers always re-decode.
    pub fn unknown() -> Self {
        Self(String::new())
    }

    pub fn is_unknown(&self) -> bool {
        self.0.is_empty()
    }

    pub fn from_modified(modified: SystemTime, len: u64) -> Self {
        let nanos = modified
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let nanos = u64::try_from(nanos).unwrap_or(u64::MAX);
        Self(format!("mtime:{nanos}:{len}"))
    }

    pub fn from_content<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Self(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Cached stamps compare equal only when both sides are known.
    pub fn matches(&self, other: &Stamp) -> bool {
        !self.is_unknown() && self == other
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            f.write_str("<unknown>")
        } else {
            f.write_str(&self.0)
        }
    }
}

#[derive(Debug, Clone)]
pub struct LayerTable {
    name: String,
    stamp: Stamp,
    interners: Interners,
    classes: ClassRelationTable,
    annotations: AnnotationIndexTable,
    details: Option<DetailStore>,
}

impl LayerTable {
    /// A fresh table with its own interners, for an isolated scan.
    pub fn new(name: impl Into<String>, stamp: Stamp, detail: bool) -> Self {
        Self::with_interners(name, stamp, Interners::new(), detail)
    }

    pub fn with_interners(
        name: impl Into<String>,
        stamp: Stamp,
        interners: Interners,
        detail: bool,
    ) -> Self {
        Self {
            name: name.into(),
            stamp,
            classes: ClassRelationTable::new(interners.classes.clone()),
            annotations: AnnotationIndexTable::new(&interners),
            details: detail.then(|| DetailStore::new(interners.clone())),
            interners,
        }
    }

    /// Rebuilds every map of this table against `interners`.
    pub fn reinterned(&self, interners: &Interners) -> Self {
        Self {
            name: self.name.clone(),
            stamp: self.stamp.clone(),
            classes: self.classes.reinterned(interners.classes.clone()),
            annotations: self.annotations.reinterned(interners),
            details: self.details.as_ref().map(|d| d.reinterned(interners.clone())),
            interners: interners.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stamp(&self) -> &Stamp {
        &self.stamp
    }

    pub fn set_stamp(&mut self, stamp: Stamp) {
        self.stamp = stamp;
    }

    pub fn interners(&self) -> &Interners {
        &self.interners
    }

    pub fn classes(&self) -> &ClassRelationTable {
        &self.classes
    }

    pub fn classes_mut(&mut self) -> &mut ClassRelationTable {
        &mut self.classes
    }

    pub fn annotations(&self) -> &AnnotationIndexTable {
        &self.annotations
    }

    pub fn annotations_mut(&mut self) -> &mut AnnotationIndexTable {
        &mut self.annotations
    }

    pub fn details(&self) -> Option<&DetailStore> {
        self.details.as_ref()
    }

    pub fn details_mut(&mut self) -> Option<&mut DetailStore> {
        self.details.as_mut()
    }

    pub fn is_congruent(&self, other: &LayerTable) -> bool {
        self.interners.congruent(&other.interners)
    }

    /// Content equality, ignoring the stamp. Distinguishes "only the stamp
    /// changed" from "the content changed".
    pub fn same_as(&self, other: &LayerTable, congruent: bool) -> bool {
        self.classes.equals(&other.classes, congruent)
            && self.annotations.equals(&other.annotations, congruent)
    }

    /// Copies the names a multi-table merge just attributed to this bucket,
    /// along with their annotations and details.
    pub fn add_selected(&mut self, other: &LayerTable, selected: &NewlyAdded) {
        self.classes.add_selected(&other.classes, selected);
        let holders = selected.holders();
        self.annotations.add_selected(&other.annotations, &holders);
        if let (Some(mine), Some(theirs)) = (self.details.as_mut(), other.details.as_ref()) {
            mine.add_selected(theirs, &holders);
        }
    }

    pub fn to_data(&self) -> LayerTableData {
        LayerTableData {
            name: self.name.clone(),
            stamp: self.stamp.clone(),
            classes: self.classes.to_data(),
            annotations: self.annotations.to_data(),
            details: self.details.as_ref().map(DetailStore::to_data),
        }
    }

    pub fn from_data(data: &LayerTableData, interners: Interners) -> Self {
        Self {
            name: data.name.clone(),
            stamp: data.stamp.clone(),
            classes: ClassRelationTable::from_data(&data.classes, interners.classes.clone()),
            annotations: AnnotationIndexTable::from_data(&data.annotations, &interners),
            details: data
                .details
                .as_ref()
                .map(|d| DetailStore::from_data(d, interners.clone())),
            interners,
        }
    }
}

/// Persisted form of a [`LayerTable`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerTableData {
    pub name: String,
    pub stamp: Stamp,
    pub classes: ClassTableData,
    pub annotations: AnnotationData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<DetailData>>,
}
