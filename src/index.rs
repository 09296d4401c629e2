//! Query surface over a scan.
//!
//! Queries over internal buckets bring the internal phase up to date first.
//! Queries that read the external bucket, or that need the complete class
//! hierarchy, also run external resolution. Either phase runs at most once
//! per index.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::annotations::AnnotationCategory;
use crate::engine::{Buckets, ScanStats};
use crate::error::{AnnoError, Result};
use crate::intern::Symbol;
use crate::orchestrator::{ScanOrchestrator, ScanState};
use crate::policy::{Modifiers, Policy, PolicySet};

pub struct AnnotationIndex {
    orchestrator: ScanOrchestrator,
}

/// Counts describing the current state of an index.
#[derive(Debug, Clone, Serialize)]
pub struct IndexSummary {
    pub module: String,
    pub state: String,
    pub layers: Vec<LayerSummary>,
    pub buckets: BTreeMap<String, BucketSummary>,
    pub resolved: usize,
    pub unresolved: usize,
    pub stats: ScanStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct LayerSummary {
    pub name: String,
    pub policy: String,
    pub packages: usize,
    pub classes: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BucketSummary {
    pub packages: usize,
    pub classes: usize,
    pub annotations: BTreeMap<String, usize>,
}

/// Internal content gained and lost between two scans, by bucket. Only
/// buckets with a change appear.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexDelta {
    pub buckets: BTreeMap<String, BucketDelta>,
}

impl IndexDelta {
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Annotation changes are `(holder, annotation)` pairs keyed by category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BucketDelta {
    pub added_classes: BTreeSet<String>,
    pub removed_classes: BTreeSet<String>,
    pub added_annotations: BTreeMap<String, BTreeSet<(String, String)>>,
    pub removed_annotations: BTreeMap<String, BTreeSet<(String, String)>>,
}

impl BucketDelta {
    pub fn is_empty(&self) -> bool {
        self.added_classes.is_empty()
            && self.removed_classes.is_empty()
            && self.added_annotations.is_empty()
            && self.removed_annotations.is_empty()
    }
}

type AnnotationPairs = BTreeMap<AnnotationCategory, BTreeSet<(String, String)>>;

impl AnnotationIndex {
    pub fn new(orchestrator: ScanOrchestrator) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &ScanOrchestrator {
        &self.orchestrator
    }

    pub fn into_orchestrator(self) -> ScanOrchestrator {
        self.orchestrator
    }

    pub fn module(&self) -> &str {
        self.orchestrator.module()
    }

    /// Runs the internal phase. Answers whether internal content changed
    /// since the cached run.
    pub fn ensure_internal(&self) -> Result<bool> {
        self.orchestrator.ensure_internal()
    }

    /// Runs external resolution, after the internal phase if needed.
    pub fn ensure_external(&self) -> Result<bool> {
        self.orchestrator.ensure_external()
    }

    fn ensure_for(&self, policies: PolicySet) -> Result<()> {
        if policies.touches_external() {
            self.orchestrator.ensure_external()?;
        } else {
            self.orchestrator.ensure_internal()?;
        }
        Ok(())
    }

    fn symbol(&self, name: &str) -> Option<Symbol> {
        self.orchestrator.interners().classes.get(name)
    }

    fn names<'a>(&self, syms: impl IntoIterator<Item = &'a Symbol>) -> BTreeSet<String> {
        self.orchestrator.interners().classes.names(syms)
    }

    // Classes

    /// Class names of every bucket selected by `policies`.
    pub fn class_names(&self, policies: PolicySet) -> Result<BTreeSet<String>> {
        self.ensure_for(policies)?;
        let buckets = self.orchestrator.buckets();
        Ok(self.names(selected_classes(&buckets, policies).iter()))
    }

    pub fn package_names(&self, policies: PolicySet) -> Result<BTreeSet<String>> {
        self.ensure_for(policies)?;
        let buckets = self.orchestrator.buckets();
        Ok(self.names(
            policies
                .policies()
                .flat_map(|p| buckets.get(p).classes().packages().iter()),
        ))
    }

    pub fn contains_class(&self, name: &str, policies: PolicySet) -> Result<bool> {
        self.ensure_for(policies)?;
        let Some(sym) = self.symbol(name) else {
            return Ok(false);
        };
        let buckets = self.orchestrator.buckets();
        Ok(policies
            .policies()
            .any(|p| buckets.get(p).classes().contains_class(sym)))
    }

    /// Bucket a class was attributed to, if any.
    pub fn policy_of(&self, name: &str) -> Result<Option<Policy>> {
        self.orchestrator.ensure_internal()?;
        let Some(sym) = self.symbol(name) else {
            return Ok(None);
        };
        let buckets = self.orchestrator.buckets();
        Ok(Policy::ALL
            .into_iter()
            .find(|p| buckets.get(*p).classes().contains_class(sym)))
    }

    /// Classes attributed to the named layer. Masked classes belong to the
    /// earlier layer and are not reported here.
    pub fn class_names_in_layer(&self, layer: &str) -> Result<BTreeSet<String>> {
        self.ensure_layer(layer)?;
        Ok(self.orchestrator.classes().class_names(layer))
    }

    fn ensure_layer(&self, layer: &str) -> Result<()> {
        let declared = self
            .orchestrator
            .layers()
            .iter()
            .find(|l| l.name == layer)
            .ok_or_else(|| AnnoError::invalid(format!("unknown layer [ {layer} ]")))?;
        self.ensure_for(declared.policy.into())
    }

    // Annotations

    /// Holders of `annotation` in the selected buckets, or every annotated
    /// holder when `annotation` is `None`.
    pub fn annotated(
        &self,
        category: AnnotationCategory,
        annotation: Option<&str>,
        policies: PolicySet,
    ) -> Result<BTreeSet<String>> {
        self.ensure_for(policies)?;
        let buckets = self.orchestrator.buckets();
        let mut holders: HashSet<Symbol> = HashSet::new();
        match annotation {
            Some(name) => {
                let Some(sym) = self.symbol(name) else {
                    return Ok(BTreeSet::new());
                };
                for policy in policies.policies() {
                    let index = buckets.get(policy).annotations().index(category);
                    if let Some(found) = index.holders_of(sym) {
                        holders.extend(found.iter().copied());
                    }
                }
            }
            None => {
                for policy in policies.policies() {
                    let index = buckets.get(policy).annotations().index(category);
                    holders.extend(index.holders().copied());
                }
            }
        }
        Ok(self.names(holders.iter()))
    }

    /// Classes annotated with `annotation` in the seed bucket.
    pub fn annotated_classes(&self, annotation: &str) -> Result<BTreeSet<String>> {
        self.annotated(AnnotationCategory::Class, Some(annotation), PolicySet::SEED)
    }

    /// Classes of one layer carrying `annotation` at class level.
    pub fn annotated_in_layer(&self, layer: &str, annotation: &str) -> Result<BTreeSet<String>> {
        self.ensure_layer(layer)?;
        let in_layer = self.orchestrator.classes().class_names(layer);
        let annotated = self.annotated(
            AnnotationCategory::Class,
            Some(annotation),
            PolicySet::INTERNAL,
        )?;
        Ok(annotated.intersection(&in_layer).cloned().collect())
    }

    /// Annotations recorded against `holder` in `category`. Holders sit in
    /// exactly one bucket, so the first bucket answering wins.
    pub fn annotations_of(
        &self,
        category: AnnotationCategory,
        holder: &str,
        policies: PolicySet,
    ) -> Result<BTreeSet<String>> {
        self.ensure_for(policies)?;
        let Some(sym) = self.symbol(holder) else {
            return Ok(BTreeSet::new());
        };
        let buckets = self.orchestrator.buckets();
        for policy in policies.policies() {
            let index = buckets.get(policy).annotations().index(category);
            if let Some(held) = index.held_of(sym)
                && !held.is_empty()
            {
                return Ok(self.names(held.iter()));
            }
        }
        Ok(BTreeSet::new())
    }

    /// Every annotation class recorded in `category` across the selected
    /// buckets.
    pub fn annotation_names(
        &self,
        category: AnnotationCategory,
        policies: PolicySet,
    ) -> Result<BTreeSet<String>> {
        self.ensure_for(policies)?;
        let buckets = self.orchestrator.buckets();
        Ok(self.names(
            policies
                .policies()
                .flat_map(|p| buckets.get(p).annotations().index(category).held()),
        ))
    }

    /// Value text of one annotation occurrence. Always `None` unless the
    /// scan recorded details.
    pub fn annotation_detail(
        &self,
        category: AnnotationCategory,
        holder: &str,
        member: Option<&str>,
        annotation: &str,
    ) -> Result<Option<String>> {
        self.orchestrator.ensure_internal()?;
        let buckets = self.orchestrator.buckets();
        Ok(Policy::INTERNAL.iter().find_map(|p| {
            buckets
                .get(*p)
                .details()
                .and_then(|d| d.lookup(category, holder, member, annotation))
                .map(str::to_string)
        }))
    }

    // Hierarchy

    pub fn superclass_name(&self, class: &str) -> Result<Option<String>> {
        self.orchestrator.ensure_internal()?;
        let Some(sym) = self.symbol(class) else {
            return Ok(None);
        };
        let classes = self.orchestrator.classes();
        let table = classes.table();
        Ok(table.superclass_of(sym).map(|s| table.interner().name(s)))
    }

    /// Directly implemented interfaces in declared order.
    pub fn interface_names(&self, class: &str) -> Result<Vec<String>> {
        self.orchestrator.ensure_internal()?;
        let Some(sym) = self.symbol(class) else {
            return Ok(Vec::new());
        };
        let classes = self.orchestrator.classes();
        let table = classes.table();
        Ok(table
            .interfaces_of(sym)
            .iter()
            .map(|s| table.interner().name(*s))
            .collect())
    }

    /// Transitive subclasses of `class`.
    pub fn subclass_names(&self, class: &str) -> Result<BTreeSet<String>> {
        self.orchestrator.ensure_external()?;
        let Some(sym) = self.symbol(class) else {
            return Ok(BTreeSet::new());
        };
        let classes = self.orchestrator.classes();
        Ok(classes
            .table()
            .descendants_of(sym)
            .map(|found| self.names(found.iter()))
            .unwrap_or_default())
    }

    /// Concrete and abstract classes implementing `interface`, directly,
    /// through a superclass, or through a sub-interface.
    pub fn all_implementors_of(&self, interface: &str) -> Result<BTreeSet<String>> {
        self.orchestrator.ensure_external()?;
        let Some(sym) = self.symbol(interface) else {
            return Ok(BTreeSet::new());
        };
        let classes = self.orchestrator.classes();
        Ok(classes
            .table()
            .implementors_of(sym)
            .map(|found| self.names(found.iter()))
            .unwrap_or_default())
    }

    /// Whether `candidate` is `target` or extends it. Interfaces are only
    /// searched when `target_is_interface` is set; the caller says so
    /// because the target need not be defined by any layer.
    pub fn is_instance_of(&self, candidate: &str, target: &str, target_is_interface: bool) -> Result<bool> {
        self.orchestrator.ensure_external()?;
        let (Some(candidate), Some(target)) = (self.symbol(candidate), self.symbol(target)) else {
            return Ok(false);
        };
        let classes = self.orchestrator.classes();
        Ok(classes
            .table()
            .is_instance_of(candidate, target, target_is_interface))
    }

    /// Raw JVM access flags of a class.
    pub fn modifiers(&self, class: &str) -> Result<Option<u32>> {
        self.orchestrator.ensure_external()?;
        let Some(sym) = self.symbol(class) else {
            return Ok(None);
        };
        Ok(self.orchestrator.classes().table().modifiers_of(sym))
    }

    pub fn modifier_flags(&self, class: &str) -> Result<Option<Modifiers>> {
        Ok(self.modifiers(class)?.map(Modifiers::from_bits_truncate))
    }

    pub fn is_abstract(&self, class: &str) -> Result<bool> {
        Ok(self
            .modifier_flags(class)?
            .is_some_and(|m| m.contains(Modifiers::ABSTRACT)))
    }

    pub fn is_interface(&self, class: &str) -> Result<bool> {
        Ok(self
            .modifier_flags(class)?
            .is_some_and(|m| m.contains(Modifiers::INTERFACE)))
    }

    // Inheritance

    /// Seed classes annotated with `annotation`, directly or through a
    /// superclass.
    pub fn all_inherited_annotated(&self, annotation: &str) -> Result<BTreeSet<String>> {
        self.all_inherited_annotated_with(annotation, PolicySet::SEED, PolicySet::SEED)
    }

    /// Classes of `declarers` annotated with `annotation` plus all their
    /// subclasses, limited to the classes of `inheritors`.
    pub fn all_inherited_annotated_with(
        &self,
        annotation: &str,
        declarers: PolicySet,
        inheritors: PolicySet,
    ) -> Result<BTreeSet<String>> {
        self.orchestrator.ensure_external()?;
        let Some(sym) = self.symbol(annotation) else {
            return Ok(BTreeSet::new());
        };

        let classes = self.orchestrator.classes();
        let buckets = self.orchestrator.buckets();
        let mut found: HashSet<Symbol> = HashSet::new();
        for policy in declarers.policies() {
            let index = buckets.get(policy).annotations().index(AnnotationCategory::Class);
            if let Some(holders) = index.holders_of(sym) {
                found.extend(holders.iter().copied());
            }
        }

        let table = classes.table();
        let declared: Vec<Symbol> = found.iter().copied().collect();
        for class in declared {
            if let Some(descendants) = table.descendants_of(class) {
                found.extend(descendants.iter().copied());
            }
        }

        let universe = selected_classes(&buckets, inheritors);
        Ok(self.names(found.intersection(&universe)))
    }

    // Summary

    /// Counts per layer and bucket. Runs the internal phase only; external
    /// counts reflect whatever resolution has already happened.
    pub fn summary(&self) -> Result<IndexSummary> {
        self.orchestrator.ensure_internal()?;
        let state = match self.orchestrator.state() {
            ScanState::Unscanned => "unscanned",
            ScanState::InternalValidated => "internal",
            ScanState::ExternalValidated => "external",
        };

        let layers = self
            .orchestrator
            .classes()
            .layers()
            .iter()
            .map(|l| LayerSummary {
                name: l.name.clone(),
                policy: l.policy.as_str().to_string(),
                packages: l.packages.len(),
                classes: l.classes.len(),
            })
            .collect();

        let buckets = self.orchestrator.buckets();
        let mut summaries = BTreeMap::new();
        for policy in Policy::ALL {
            let table = buckets.get(policy);
            let annotations = AnnotationCategory::ALL
                .iter()
                .map(|c| (c.as_str().to_string(), table.annotations().index(*c).len()))
                .collect();
            summaries.insert(
                policy.as_str().to_string(),
                BucketSummary {
                    packages: table.classes().packages().len(),
                    classes: table.classes().classes().len(),
                    annotations,
                },
            );
        }
        drop(buckets);

        Ok(IndexSummary {
            module: self.orchestrator.module().to_string(),
            state: state.to_string(),
            layers,
            buckets: summaries,
            resolved: self.orchestrator.resolved_names().len(),
            unresolved: self.orchestrator.unresolved_names().len(),
            stats: self.orchestrator.stats(),
        })
    }
}

impl AnnotationIndex {
    // Delta

    /// What the internal buckets gained and lost since `earlier`. Both
    /// indexes run their internal phase; names are compared, so the two
    /// need not share interners.
    pub fn delta(&self, earlier: &AnnotationIndex) -> Result<IndexDelta> {
        self.orchestrator.ensure_internal()?;
        earlier.orchestrator.ensure_internal()?;

        let mut delta = IndexDelta::default();
        for policy in Policy::INTERNAL {
            let (now_classes, now_pairs) = self.bucket_contents(policy);
            let (then_classes, then_pairs) = earlier.bucket_contents(policy);

            let mut bucket = BucketDelta {
                added_classes: now_classes.difference(&then_classes).cloned().collect(),
                removed_classes: then_classes.difference(&now_classes).cloned().collect(),
                ..Default::default()
            };
            for category in AnnotationCategory::ALL {
                let empty = BTreeSet::new();
                let now = now_pairs.get(&category).unwrap_or(&empty);
                let then = then_pairs.get(&category).unwrap_or(&empty);
                let added: BTreeSet<_> = now.difference(then).cloned().collect();
                let removed: BTreeSet<_> = then.difference(now).cloned().collect();
                if !added.is_empty() {
                    bucket.added_annotations.insert(category.as_str().to_string(), added);
                }
                if !removed.is_empty() {
                    bucket.removed_annotations.insert(category.as_str().to_string(), removed);
                }
            }
            if !bucket.is_empty() {
                delta.buckets.insert(policy.as_str().to_string(), bucket);
            }
        }
        tracing::debug!(
            module = %self.module(),
            buckets = delta.buckets.len(),
            "delta computed"
        );
        Ok(delta)
    }

    fn bucket_contents(&self, policy: Policy) -> (BTreeSet<String>, AnnotationPairs) {
        let buckets = self.orchestrator.buckets();
        let table = buckets.get(policy);
        let names = &self.orchestrator.interners().classes;
        let classes = names.names(table.classes().classes().iter());

        let mut pairs = AnnotationPairs::new();
        for category in AnnotationCategory::ALL {
            let index = table.annotations().index(category);
            let mut found = BTreeSet::new();
            for holder in index.holders() {
                for held in index.held_of(*holder).into_iter().flatten() {
                    found.insert((names.name(*holder), names.name(*held)));
                }
            }
            if !found.is_empty() {
                pairs.insert(category, found);
            }
        }
        (classes, pairs)
    }
}

fn selected_classes(buckets: &Buckets, policies: PolicySet) -> HashSet<Symbol> {
    policies
        .policies()
        .flat_map(|p| buckets.get(p).classes().classes().iter().copied())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanOptions;
    use crate::java::JavaSourceDecoder;
    use crate::source::{Layer, MemorySource};
    use std::sync::Arc;

    fn memory(name: &str, policy: Policy, files: &[(&str, &str)]) -> Layer {
        let mut source = MemorySource::new();
        for (path, text) in files {
            source.insert(*path, text.as_bytes().to_vec());
        }
        Layer::new(name, policy, Arc::new(source))
    }

    fn index(layers: Vec<Layer>, detail: bool) -> Result<AnnotationIndex> {
        let orch = ScanOrchestrator::new(
            "app",
            layers,
            Arc::new(JavaSourceDecoder),
            None,
            ScanOptions::default().with_detail(detail),
        )?;
        Ok(AnnotationIndex::new(orch))
    }

    fn jdk() -> Layer {
        memory(
            "jdk",
            Policy::External,
            &[
                ("java/lang/Object.java", "package java.lang; public class Object {}"),
                ("java/io/Serializable.java", "package java.io; public interface Serializable {}"),
            ],
        )
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn internal_queries_do_not_resolve_externals() -> anyhow::Result<()> {
        let idx = index(
            vec![
                memory("app", Policy::Seed, &[("a/A.java", "package a; @Entity class A {}")]),
                memory("lib", Policy::Partial, &[("b/B.java", "package b; @a.Entity class B {}")]),
                jdk(),
            ],
            false,
        )?;

        assert_eq!(idx.annotated_classes("a.Entity")?, set(&["a.A"]));
        assert_eq!(idx.orchestrator().state(), ScanState::InternalValidated);
        assert_eq!(
            idx.annotated(AnnotationCategory::Class, Some("a.Entity"), PolicySet::INTERNAL)?,
            set(&["a.A", "b.B"])
        );
        assert_eq!(idx.class_names(PolicySet::PARTIAL)?, set(&["b.B"]));
        assert!(idx.contains_class("a.A", PolicySet::SEED)?);
        assert!(!idx.contains_class("a.A", PolicySet::PARTIAL)?);
        assert_eq!(idx.policy_of("b.B")?, Some(Policy::Partial));
        assert_eq!(idx.orchestrator().state(), ScanState::InternalValidated);
        Ok(())
    }

    #[test]
    fn reverse_and_layer_queries() -> anyhow::Result<()> {
        let idx = index(
            vec![
                memory(
                    "app",
                    Policy::Seed,
                    &[
                        ("a/A.java", "package a; @Entity @Table class A { @Id long id; @Get long id() { return id; } }"),
                        ("a/package-info.java", "@Marker package a;"),
                    ],
                ),
                memory("lib", Policy::Seed, &[("b/B.java", "package b; @a.Entity class B {}")]),
            ],
            false,
        )?;

        assert_eq!(
            idx.annotations_of(AnnotationCategory::Class, "a.A", PolicySet::SEED)?,
            set(&["a.Entity", "a.Table"])
        );
        assert_eq!(
            idx.annotations_of(AnnotationCategory::Field, "a.A", PolicySet::SEED)?,
            set(&["a.Id"])
        );
        assert_eq!(
            idx.annotations_of(AnnotationCategory::Method, "a.A", PolicySet::SEED)?,
            set(&["a.Get"])
        );
        assert_eq!(
            idx.annotated(AnnotationCategory::Package, Some("a.Marker"), PolicySet::SEED)?,
            set(&["a"])
        );
        assert_eq!(idx.annotated_in_layer("lib", "a.Entity")?, set(&["b.B"]));
        assert_eq!(idx.class_names_in_layer("app")?, set(&["a.A"]));
        assert!(matches!(
            idx.class_names_in_layer("missing"),
            Err(AnnoError::InvalidArgument(_))
        ));
        assert!(idx.annotations_of(AnnotationCategory::Class, "z.Unknown", PolicySet::SEED)?.is_empty());
        Ok(())
    }

    #[test]
    fn hierarchy_queries_resolve_through_external() -> anyhow::Result<()> {
        let idx = index(
            vec![
                memory(
                    "app",
                    Policy::Seed,
                    &[
                        ("a/Shape.java", "package a; public interface Shape extends java.io.Serializable {}"),
                        ("a/Base.java", "package a; public abstract class Base implements Shape {}"),
                        ("a/Circle.java", "package a; public final class Circle extends Base {}"),
                    ],
                ),
                jdk(),
            ],
            false,
        )?;

        assert_eq!(idx.subclass_names("a.Base")?, set(&["a.Circle"]));
        assert_eq!(idx.all_implementors_of("a.Shape")?, set(&["a.Base", "a.Circle"]));
        assert!(idx.all_implementors_of("java.io.Serializable")?.contains("a.Circle"));
        assert!(idx.is_instance_of("a.Circle", "a.Shape", true)?);
        assert!(idx.is_instance_of("a.Circle", "java.io.Serializable", true)?);
        assert!(!idx.is_instance_of("a.Circle", "a.Shape", false)?);
        assert!(idx.is_instance_of("a.Circle", "a.Base", false)?);
        assert!(!idx.is_instance_of("a.Base", "a.Circle", false)?);
        assert!(!idx.is_instance_of("a.Circle", "z.Nowhere", true)?);
        assert!(idx.is_abstract("a.Base")?);
        assert!(idx.is_interface("a.Shape")?);
        assert!(!idx.is_interface("a.Circle")?);
        assert_eq!(idx.superclass_name("a.Circle")?.as_deref(), Some("a.Base"));
        assert_eq!(idx.interface_names("a.Base")?, vec!["a.Shape".to_string()]);
        assert!(idx.modifiers("java.lang.Object")?.is_some());
        assert_eq!(idx.orchestrator().state(), ScanState::ExternalValidated);
        Ok(())
    }

    #[test]
    fn instance_of_reaches_interfaces_no_layer_defines() -> anyhow::Result<()> {
        let idx = index(
            vec![
                memory(
                    "app",
                    Policy::Seed,
                    &[
                        ("a/A.java", "package a; public class A implements z.Gone {}"),
                        ("a/B.java", "package a; public class B extends A {}"),
                    ],
                ),
                jdk(),
            ],
            false,
        )?;

        assert_eq!(idx.interface_names("a.A")?, vec!["z.Gone".to_string()]);
        assert!(idx.is_instance_of("a.A", "z.Gone", true)?);
        assert!(idx.is_instance_of("a.B", "z.Gone", true)?);
        assert!(!idx.is_instance_of("a.A", "z.Gone", false)?);
        assert!(idx.orchestrator().unresolved_names().contains("z.Gone"));
        Ok(())
    }

    #[test]
    fn delta_reports_gained_and_lost_content_per_bucket() -> anyhow::Result<()> {
        let earlier = index(
            vec![
                memory(
                    "app",
                    Policy::Seed,
                    &[
                        ("a/A.java", "package a; @x.Entity public class A { @x.Id long id; }"),
                        ("a/Gone.java", "package a; public class Gone {}"),
                    ],
                ),
                memory("lib", Policy::Partial, &[("b/B.java", "package b; public class B {}")]),
            ],
            false,
        )?;
        let later = index(
            vec![
                memory(
                    "app",
                    Policy::Seed,
                    &[
                        ("a/A.java", "package a; @x.Entity @x.Cached public class A { long id; }"),
                        ("a/New.java", "package a; public class New {}"),
                    ],
                ),
                memory("lib", Policy::Partial, &[("b/B.java", "package b; public class B {}")]),
            ],
            false,
        )?;

        let delta = later.delta(&earlier)?;
        assert_eq!(delta.buckets.keys().map(String::as_str).collect::<Vec<_>>(), vec!["seed"]);
        let seed = &delta.buckets["seed"];
        assert_eq!(seed.added_classes, set(&["a.New"]));
        assert_eq!(seed.removed_classes, set(&["a.Gone"]));
        let pair = |h: &str, a: &str| (h.to_string(), a.to_string());
        assert_eq!(seed.added_annotations["class"], BTreeSet::from([pair("a.A", "x.Cached")]));
        assert_eq!(seed.removed_annotations["field"], BTreeSet::from([pair("a.A", "x.Id")]));
        assert!(!seed.added_annotations.contains_key("field"));

        assert!(later.delta(&later)?.is_empty());
        assert!(earlier.delta(&later)?.buckets["seed"].added_classes.contains("a.Gone"));
        Ok(())
    }

    #[test]
    fn hierarchy_queries_need_an_external_layer() -> anyhow::Result<()> {
        let idx = index(
            vec![memory("app", Policy::Seed, &[("a/A.java", "package a; class A {}")])],
            false,
        )?;
        assert!(matches!(idx.subclass_names("a.A"), Err(AnnoError::NoExternalLayer)));
        assert!(matches!(
            idx.class_names(PolicySet::EXTERNAL),
            Err(AnnoError::NoExternalLayer)
        ));
        assert_eq!(idx.class_names(PolicySet::SEED)?, set(&["a.A"]));
        Ok(())
    }

    #[test]
    fn inherited_annotations_follow_subclasses_within_inheritors() -> anyhow::Result<()> {
        let idx = index(
            vec![
                memory(
                    "app",
                    Policy::Seed,
                    &[
                        ("a/X.java", "package a; @Foo public class X {}"),
                        ("a/Y.java", "package a; public class Y extends X {}"),
                        ("a/Z.java", "package a; public class Z {}"),
                    ],
                ),
                memory("ext", Policy::Partial, &[("b/W.java", "package b; public class W extends a.X {}")]),
                jdk(),
            ],
            false,
        )?;

        assert_eq!(idx.all_inherited_annotated("a.Foo")?, set(&["a.X", "a.Y"]));
        assert_eq!(
            idx.all_inherited_annotated_with("a.Foo", PolicySet::SEED, PolicySet::INTERNAL)?,
            set(&["a.X", "a.Y", "b.W"])
        );
        assert!(idx.all_inherited_annotated("a.Missing")?.is_empty());
        Ok(())
    }

    #[test]
    fn details_are_recorded_on_request() -> anyhow::Result<()> {
        let files = [("a/A.java", "package a; @Table(name = \"t\") class A { @Column(length = 3) String n; }")];
        let idx = index(vec![memory("app", Policy::Seed, &files)], true)?;
        assert_eq!(
            idx.annotation_detail(AnnotationCategory::Class, "a.A", None, "a.Table")?
                .as_deref(),
            Some("(name = \"t\")")
        );
        assert_eq!(
            idx.annotation_detail(AnnotationCategory::Field, "a.A", Some("n"), "a.Column")?
                .as_deref(),
            Some("(length = 3)")
        );

        let plain = index(vec![memory("app", Policy::Seed, &files)], false)?;
        assert_eq!(
            plain.annotation_detail(AnnotationCategory::Class, "a.A", None, "a.Table")?,
            None
        );
        Ok(())
    }

    #[test]
    fn summary_counts_buckets() -> anyhow::Result<()> {
        let idx = index(
            vec![memory("app", Policy::Seed, &[("a/A.java", "package a; @Entity class A extends B {}")])],
            false,
        )?;
        let summary = idx.summary()?;
        assert_eq!(summary.state, "internal");
        assert_eq!(summary.buckets["seed"].classes, 1);
        assert_eq!(summary.buckets["seed"].annotations["class"], 1);
        assert_eq!(summary.layers.len(), 1);
        assert_eq!(summary.unresolved, 1);
        Ok(())
    }
}
