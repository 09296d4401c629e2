//! Scan primitives shared by every scan mode: decoding a layer into a
//! [`LayerTable`], scanning only named classes, and the first-wins merge of
//! layer tables into policy buckets.

use std::collections::{BTreeSet, HashSet};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::annotations::{AnnotationCategory, DetailKey};
use crate::decode::{
    ClassEvent, DecodeError, Decoder, EventSink, Interest, Owner, RecordHeader, is_module_info,
    package_of_info,
};
use crate::error::{AnnoError, Result};
use crate::intern::{Interner, Interners, Symbol};
use crate::multi::MultiClassTable;
use crate::policy::Policy;
use crate::source::Layer;
use crate::table::LayerTable;

/// Restricts what a scan records.
#[derive(Debug, Clone)]
pub struct ScanFilter {
    /// Only these class names are recorded.
    pub classes: Option<HashSet<String>>,
    /// Only these annotation classes are recorded.
    pub annotations: Option<HashSet<String>>,
    pub record_annotations: bool,
    pub detail: bool,
}

impl Default for ScanFilter {
    fn default() -> Self {
        Self {
            classes: None,
            annotations: None,
            record_annotations: true,
            detail: false,
        }
    }
}

impl ScanFilter {
    /// Filter for the external layer, which never contributes annotations.
    pub fn external(classes: HashSet<String>) -> Self {
        Self {
            classes: Some(classes),
            annotations: None,
            record_annotations: false,
            detail: false,
        }
    }

    fn accepts_class(&self, name: &str) -> bool {
        self.classes.as_ref().is_none_or(|c| c.contains(name))
    }

    fn accepts_annotation(&self, name: &str) -> bool {
        self.record_annotations && self.annotations.as_ref().is_none_or(|a| a.contains(name))
    }
}

/// Counters and phase timings for one orchestrator run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ScanStats {
    pub layers: usize,
    pub cache_hits: usize,
    pub stamp_only: usize,
    pub changed_layers: usize,
    pub decoded_layers: usize,
    pub decoded_resources: usize,
    pub recorded_classes: usize,
    pub failed_records: usize,
    pub external_passes: usize,
    pub cache_read: Duration,
    pub cache_write: Duration,
    pub decode: Duration,
}

impl ScanStats {
    pub fn absorb(&mut self, other: &ScanStats) {
        self.layers += other.layers;
        self.cache_hits += other.cache_hits;
        self.stamp_only += other.stamp_only;
        self.changed_layers += other.changed_layers;
        self.decoded_layers += other.decoded_layers;
        self.decoded_resources += other.decoded_resources;
        self.recorded_classes += other.recorded_classes;
        self.failed_records += other.failed_records;
        self.external_passes += other.external_passes;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
        self.decode += other.decode;
    }
}

#[derive(Debug)]
enum Member {
    Field(String),
    Method(String),
}

#[derive(Debug)]
struct PendingAnnotation {
    category: AnnotationCategory,
    member: Option<String>,
    annotation: String,
    detail: Option<String>,
}

#[derive(Debug)]
struct PendingRecord {
    name: String,
    package: Option<String>,
    superclass: Option<String>,
    interfaces: Vec<String>,
    modifiers: u32,
    annotations: Vec<PendingAnnotation>,
}

/// Event sink that buffers one record at a time and commits it to a layer
/// table on `EndRecord`. An unfinished record is dropped.
pub struct RecordCollector<'a> {
    table: &'a mut LayerTable,
    filter: &'a ScanFilter,
    resource: &'a str,
    expected: Option<String>,
    pending: Option<PendingRecord>,
    member: Option<Member>,
    recorded: usize,
    failed: usize,
}

impl<'a> RecordCollector<'a> {
    pub fn new(
        table: &'a mut LayerTable,
        filter: &'a ScanFilter,
        resource: &'a str,
        expected: Option<String>,
    ) -> Self {
        Self {
            table,
            filter,
            resource,
            expected,
            pending: None,
            member: None,
            recorded: 0,
            failed: 0,
        }
    }

    fn name_matches(&self, name: &str) -> bool {
        match &self.expected {
            None => true,
            Some(expected) => {
                name == expected
                    || name
                        .strip_prefix(expected.as_str())
                        .is_some_and(|rest| rest.starts_with('$'))
            }
        }
    }

    fn begin(&mut self, header: RecordHeader<'_>) -> Interest {
        if let Some(unfinished) = self.pending.take() {
            tracing::warn!(resource = self.resource, record = %unfinished.name, "record not closed; discarded");
            self.failed += 1;
        }
        self.member = None;

        if is_module_info(header.name) {
            return Interest::Skip;
        }
        if !self.name_matches(header.name) {
            tracing::warn!(
                resource = self.resource,
                expected = self.expected.as_deref().unwrap_or(""),
                found = header.name,
                "record name does not match its resource; skipped"
            );
            self.failed += 1;
            return Interest::Skip;
        }
        if !self.filter.accepts_class(header.name) {
            return Interest::Skip;
        }

        let package = package_of_info(header.name).map(str::to_string);
        let interner = &self.table.interners().classes;
        let duplicate = match &package {
            Some(p) => interner
                .get(p)
                .is_some_and(|s| self.table.classes().contains_package(s)),
            None => interner
                .get(header.name)
                .is_some_and(|s| self.table.classes().contains_class(s)),
        };
        if duplicate {
            tracing::debug!(resource = self.resource, record = header.name, "duplicate record in layer; first kept");
            return Interest::Skip;
        }

        self.pending = Some(PendingRecord {
            name: header.name.to_string(),
            package,
            superclass: header.superclass.map(str::to_string),
            interfaces: header.interfaces.iter().map(|i| i.to_string()).collect(),
            modifiers: header.modifiers,
            annotations: Vec::new(),
        });
        Interest::Wanted
    }

    fn annotation(&mut self, owner: Owner, annotation: &str, detail: Option<&str>) -> Interest {
        if !self.filter.accepts_annotation(annotation) {
            return Interest::Skip;
        }
        let Some(pending) = self.pending.as_mut() else {
            return Interest::Skip;
        };
        let (category, member) = match (owner, &self.member) {
            (Owner::Record, _) if pending.package.is_some() => (AnnotationCategory::Package, None),
            (Owner::Record, _) => (AnnotationCategory::Class, None),
            (Owner::Field, Some(Member::Field(name))) => (AnnotationCategory::Field, Some(name.clone())),
            (Owner::Method, Some(Member::Method(sig))) => (AnnotationCategory::Method, Some(sig.clone())),
            _ => return Interest::Skip,
        };
        pending.annotations.push(PendingAnnotation {
            category,
            member,
            annotation: annotation.to_string(),
            detail: detail.map(str::to_string),
        });
        Interest::Wanted
    }

    fn commit(&mut self) {
        let Some(record) = self.pending.take() else {
            return;
        };
        self.member = None;
        let interners = self.table.interners().clone();
        let classes = &interners.classes;

        let holder = match &record.package {
            Some(package) => {
                let symbol = classes.intern(package);
                self.table.classes_mut().record_package(symbol);
                symbol
            }
            None => {
                let symbol = classes.intern(&record.name);
                let superclass = record.superclass.as_deref().map(|s| classes.intern(s));
                let interfaces = record.interfaces.iter().map(|i| classes.intern(i)).collect();
                self.table
                    .classes_mut()
                    .record(symbol, superclass, interfaces, record.modifiers);
                symbol
            }
        };

        for pending in record.annotations {
            let annotation = classes.intern(&pending.annotation);
            self.table
                .annotations_mut()
                .record(pending.category, holder, annotation);
            let (Some(text), true) = (pending.detail, self.filter.detail) else {
                continue;
            };
            let member = pending.member.map(|m| match pending.category {
                AnnotationCategory::Method => interners.methods.intern(&m),
                _ => interners.fields.intern(&m),
            });
            if let Some(details) = self.table.details_mut() {
                details.record(
                    DetailKey {
                        category: pending.category,
                        holder,
                        member,
                        annotation,
                    },
                    text,
                );
            }
        }
        self.recorded += 1;
    }

    /// Closes the collection for one resource. Answers (recorded, failed).
    pub fn finish(mut self, outcome: std::result::Result<(), DecodeError>) -> (usize, usize) {
        if let Err(e) = outcome {
            tracing::warn!(resource = self.resource, error = %e, "decode failed; partial record discarded");
            self.pending = None;
            self.failed += 1;
        } else if let Some(unfinished) = self.pending.take() {
            tracing::warn!(resource = self.resource, record = %unfinished.name, "record not closed; discarded");
            self.failed += 1;
        }
        (self.recorded, self.failed)
    }
}

impl EventSink for RecordCollector<'_> {
    fn accept(&mut self, event: ClassEvent<'_>) -> Interest {
        match event {
            ClassEvent::BeginRecord(header) => self.begin(header),
            ClassEvent::Field { name } => {
                if self.pending.is_none() || !self.filter.record_annotations {
                    return Interest::Skip;
                }
                self.member = Some(Member::Field(name.to_string()));
                Interest::Wanted
            }
            ClassEvent::Method { signature } => {
                if self.pending.is_none() || !self.filter.record_annotations {
                    return Interest::Skip;
                }
                self.member = Some(Member::Method(signature.to_string()));
                Interest::Wanted
            }
            ClassEvent::Annotation {
                owner,
                annotation,
                detail,
            } => self.annotation(owner, annotation, detail),
            ClassEvent::EndRecord => {
                self.commit();
                Interest::Wanted
            }
        }
    }
}

fn decode_resource(
    decoder: &dyn Decoder,
    resource: &str,
    bytes: &[u8],
    table: &mut LayerTable,
    filter: &ScanFilter,
    stats: &mut ScanStats,
) {
    let expected = decoder.class_name_of(resource);
    let mut collector = RecordCollector::new(table, filter, resource, expected);
    let outcome = decoder.decode(resource, bytes, &mut collector);
    let (recorded, failed) = collector.finish(outcome);
    stats.decoded_resources += 1;
    stats.recorded_classes += recorded;
    stats.failed_records += failed;
}

fn source_error(layer: &Layer, source: anyhow::Error) -> AnnoError {
    AnnoError::Source {
        layer: layer.name.clone(),
        source,
    }
}

/// Decodes every resource of a layer into a fresh table with its own
/// interners.
pub fn scan_layer(
    layer: &Layer,
    decoder: &dyn Decoder,
    filter: &ScanFilter,
    stats: &mut ScanStats,
) -> Result<LayerTable> {
    let started = Instant::now();
    let stamp = layer.source.stamp().map_err(|e| source_error(layer, e))?;
    let mut table = LayerTable::new(&layer.name, stamp, filter.detail);

    let extension = decoder.extension().to_string();
    let mut visit = |resource: &str, bytes: &[u8]| {
        decode_resource(decoder, resource, bytes, &mut table, filter, stats);
    };
    layer
        .source
        .visit(&extension, &mut visit)
        .map_err(|e| source_error(layer, e))?;

    stats.decoded_layers += 1;
    stats.decode += started.elapsed();
    tracing::debug!(
        layer = %layer.name,
        classes = table.classes().classes().len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "layer decoded"
    );
    Ok(table)
}

/// Decodes only the resources holding the named classes. Names the layer
/// does not hold are ignored.
pub fn scan_specific(
    layer: &Layer,
    decoder: &dyn Decoder,
    names: &BTreeSet<String>,
    filter: &ScanFilter,
    stats: &mut ScanStats,
) -> Result<LayerTable> {
    let started = Instant::now();
    let stamp = layer.source.stamp().unwrap_or_else(|e| {
        tracing::debug!(layer = %layer.name, error = %e, "no stamp for specific scan");
        crate::table::Stamp::unknown()
    });
    let mut table = LayerTable::new(&layer.name, stamp, filter.detail);

    let mut seen = HashSet::new();
    for name in names {
        let resource = decoder.resource_for(name);
        if !seen.insert(resource.clone()) {
            continue;
        }
        let Some(bytes) = layer
            .source
            .read(&resource)
            .map_err(|e| source_error(layer, e))?
        else {
            continue;
        };
        decode_resource(decoder, &resource, &bytes, &mut table, filter, stats);
    }
    stats.decode += started.elapsed();
    Ok(table)
}

/// Resolved and unresolved class references across a whole run. The two
/// sets never intersect and a resolved name stays resolved.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTracker {
    resolved: HashSet<Symbol>,
    unresolved: HashSet<Symbol>,
}

impl ReferenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a name as defined. Answers true if it was not resolved before.
    pub fn record_defined(&mut self, name: Symbol) -> bool {
        self.unresolved.remove(&name);
        self.resolved.insert(name)
    }

    /// Marks a name as referenced. Answers true if the name is newly
    /// unresolved.
    pub fn record_referenced(&mut self, name: Symbol) -> bool {
        if self.resolved.contains(&name) {
            return false;
        }
        self.unresolved.insert(name)
    }

    pub fn resolved(&self) -> &HashSet<Symbol> {
        &self.resolved
    }

    pub fn unresolved(&self) -> &HashSet<Symbol> {
        &self.unresolved
    }

    pub fn is_resolved(&self, name: Symbol) -> bool {
        self.resolved.contains(&name)
    }

    pub fn from_names<'a>(
        interner: &Interner,
        resolved: impl IntoIterator<Item = &'a String>,
        unresolved: impl IntoIterator<Item = &'a String>,
    ) -> Self {
        let mut tracker = Self::new();
        for name in resolved {
            tracker.record_defined(interner.intern(name));
        }
        for name in unresolved {
            tracker.record_referenced(interner.intern(name));
        }
        tracker
    }
}

/// One merged table per policy. The external bucket is filled only by
/// external resolution.
#[derive(Debug, Clone)]
pub struct Buckets {
    seed: LayerTable,
    partial: LayerTable,
    excluded: LayerTable,
    external: LayerTable,
}

impl Buckets {
    /// Empty buckets sharing `interners`.
    pub fn new(interners: &Interners, detail: bool) -> Self {
        let bucket = |policy: Policy| {
            LayerTable::with_interners(
                policy.as_str(),
                crate::table::Stamp::unknown(),
                interners.clone(),
                detail,
            )
        };
        Self {
            seed: bucket(Policy::Seed),
            partial: bucket(Policy::Partial),
            excluded: bucket(Policy::Excluded),
            external: bucket(Policy::External),
        }
    }

    pub fn get(&self, policy: Policy) -> &LayerTable {
        match policy {
            Policy::Seed => &self.seed,
            Policy::Partial => &self.partial,
            Policy::Excluded => &self.excluded,
            Policy::External => &self.external,
        }
    }

    pub fn get_mut(&mut self, policy: Policy) -> &mut LayerTable {
        match policy {
            Policy::Seed => &mut self.seed,
            Policy::Partial => &mut self.partial,
            Policy::Excluded => &mut self.excluded,
            Policy::External => &mut self.external,
        }
    }

    /// Replaces an internal bucket with one read from the cache.
    pub fn set(&mut self, policy: Policy, table: LayerTable) {
        *self.get_mut(policy) = table;
    }

    /// Content equality of the internal buckets.
    pub fn same_internal(&self, other: &Buckets) -> bool {
        Policy::INTERNAL.iter().all(|p| {
            let (mine, theirs) = (self.get(*p), other.get(*p));
            mine.same_as(theirs, mine.is_congruent(theirs))
        })
    }
}

/// Merges layer tables, in declared order, into the buckets and the
/// aggregate class table. A name lands in the bucket of the first layer
/// defining it. With `force`, every layer lands in that bucket.
pub fn merge_into(
    buckets: &mut Buckets,
    multi: &mut MultiClassTable,
    tables: &[(Policy, &LayerTable)],
    force: Option<Policy>,
    refs: &mut ReferenceTracker,
) {
    for (policy, table) in tables {
        let target = force.unwrap_or(*policy);
        let newly = multi.add_layer(table.name(), target, table.classes());
        buckets.get_mut(target).add_selected(table, &newly);
        track_references(multi, &newly.classes, refs);
    }
}

/// Records `classes` as defined and answers the names they reference that
/// became unresolved.
pub fn track_references(
    multi: &MultiClassTable,
    classes: &HashSet<Symbol>,
    refs: &mut ReferenceTracker,
) -> HashSet<Symbol> {
    for class in classes {
        refs.record_defined(*class);
    }
    let mut newly_unresolved = HashSet::new();
    for class in classes {
        for referenced in multi.table().referenced(*class) {
            if refs.record_referenced(referenced) {
                newly_unresolved.insert(referenced);
            }
        }
    }
    newly_unresolved
}
