//! Drives a module's scan: validates each layer against the cache, merges
//! layer tables into policy buckets, and resolves outstanding references
//! through the external layer on demand.
//!
//! States advance `Unscanned -> InternalValidated -> ExternalValidated`.
//! Each transition runs at most once per orchestrator; later calls answer
//! the recorded "did anything change" flag.
//!
//! Locks, in acquisition order:
//! - `phase` serializes state transitions.
//! - `classes` guards the aggregate class table. Internal finalization and
//!   external resolution both mutate it.
//! - `references`, then `buckets`.
//!
//! Each layer additionally has its own lock held across its
//! validate-or-scan-and-write sequence, and `reintern` serializes folding a
//! worker's private tables into the shared interners. Workers only produce
//! tables; the merge runs on the calling thread in declared layer order, so
//! first-wins masking does not depend on worker timing.

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Instant;

use crate::cache::{AnnoCache, LayerEntry, ModuleCache};
use crate::config::ScanOptions;
use crate::decode::Decoder;
use crate::engine::{
    Buckets, ReferenceTracker, ScanFilter, ScanStats, merge_into, scan_layer, scan_specific,
    track_references,
};
use crate::error::{AnnoError, Result};
use crate::intern::Interners;
use crate::multi::MultiClassTable;
use crate::policy::Policy;
use crate::source::Layer;
use crate::table::{LayerTable, Stamp};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ScanMode {
    /// Cached scan partitioned by layer policy.
    #[default]
    Full,
    /// Uncached scan of every internal layer into the seed bucket.
    Limited,
    /// Uncached scan of only the named classes into the seed bucket,
    /// optionally recording only the named annotation classes.
    Specific {
        classes: BTreeSet<String>,
        annotations: Option<BTreeSet<String>>,
    },
}

impl ScanMode {
    pub fn uses_cache(&self) -> bool {
        matches!(self, ScanMode::Full)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScanState {
    Unscanned,
    InternalValidated,
    ExternalValidated,
}

#[derive(Debug, Clone, Copy)]
struct Phase {
    state: ScanState,
    internal_changed: bool,
    external_changed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayerStatus {
    Hit,
    StampOnly,
    Changed,
    Unreadable,
}

#[derive(Debug)]
struct LayerOutcome {
    slot: usize,
    status: LayerStatus,
    table: Option<LayerTable>,
    stats: ScanStats,
}

#[derive(Clone)]
enum JobKind {
    Validate { force_load: bool },
    Limited,
    Specific(Arc<ScanFilter>, Arc<BTreeSet<String>>),
}

/// One layer's unit of work. Runs on a pool worker or inline.
#[derive(Clone)]
struct LayerJob {
    slot: usize,
    layer: Layer,
    decoder: Arc<dyn Decoder>,
    cache: Option<ModuleCache>,
    lock: Arc<Mutex<()>>,
    reintern: Arc<Mutex<()>>,
    interners: Interners,
    detail: bool,
    always_invalid: bool,
    kind: JobKind,
}

impl LayerJob {
    fn run(self) -> LayerOutcome {
        let _held = self.lock.lock();
        let mut stats = ScanStats {
            layers: 1,
            ..Default::default()
        };
        let (status, table) = match &self.kind {
            JobKind::Validate { force_load } => self.validate(*force_load, &mut stats),
            JobKind::Limited => {
                let filter = ScanFilter {
                    detail: self.detail,
                    ..Default::default()
                };
                self.decode_or_empty(|layer, decoder, stats| scan_layer(layer, decoder, &filter, stats), &mut stats)
            }
            JobKind::Specific(filter, names) => self.decode_or_empty(
                |layer, decoder, stats| scan_specific(layer, decoder, names, filter, stats),
                &mut stats,
            ),
        };
        let table = table.map(|t| {
            let _serial = self.reintern.lock();
            t.reinterned(&self.interners)
        });
        LayerOutcome {
            slot: self.slot,
            status,
            table,
            stats,
        }
    }

    fn empty(&self) -> LayerTable {
        LayerTable::new(&self.layer.name, Stamp::unknown(), self.detail)
    }

    fn decode_or_empty(
        &self,
        scan: impl FnOnce(&Layer, &dyn Decoder, &mut ScanStats) -> Result<LayerTable>,
        stats: &mut ScanStats,
    ) -> (LayerStatus, Option<LayerTable>) {
        match scan(&self.layer, self.decoder.as_ref(), stats) {
            Ok(table) => (LayerStatus::Changed, Some(table)),
            Err(e) => {
                tracing::warn!(layer = %self.layer.name, error = %e, "layer unreadable; scanned as empty");
                (LayerStatus::Unreadable, Some(self.empty()))
            }
        }
    }

    fn read_cached(&self, cache: &ModuleCache, stats: &mut ScanStats) -> Option<LayerTable> {
        let started = Instant::now();
        let data = cache.read_layer(&self.layer.name).unwrap_or_else(|e| {
            tracing::warn!(layer = %self.layer.name, error = %e, "cached layer unreadable; treated as a miss");
            None
        });
        stats.cache_read += started.elapsed();
        data.map(|d| LayerTable::from_data(&d, Interners::new()))
    }

    fn validate(&self, force_load: bool, stats: &mut ScanStats) -> (LayerStatus, Option<LayerTable>) {
        let name = &self.layer.name;
        let current = match self.layer.source.stamp() {
            Ok(stamp) => stamp,
            Err(e) => {
                tracing::warn!(layer = %name, error = %e, "layer unreadable; scanned as empty");
                return (LayerStatus::Unreadable, Some(self.empty()));
            }
        };

        if let Some(cache) = self.cache.as_ref()
            && !self.always_invalid
        {
            let started = Instant::now();
            let cached = cache.read_stamp(name).unwrap_or_else(|e| {
                tracing::warn!(layer = %name, error = %e, "cached stamp unreadable; treated as a miss");
                None
            });
            stats.cache_read += started.elapsed();

            if cached.is_some_and(|c| current.matches(&c)) {
                if !force_load {
                    stats.cache_hits += 1;
                    return (LayerStatus::Hit, None);
                }
                if let Some(table) = self.read_cached(cache, stats) {
                    stats.cache_hits += 1;
                    return (LayerStatus::Hit, Some(table));
                }
            }
        }

        let filter = ScanFilter {
            detail: self.detail,
            ..Default::default()
        };
        let table = match scan_layer(&self.layer, self.decoder.as_ref(), &filter, stats) {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!(layer = %name, error = %e, "layer unreadable; scanned as empty");
                return (LayerStatus::Unreadable, Some(self.empty()));
            }
        };

        let Some(cache) = self.cache.as_ref() else {
            stats.changed_layers += 1;
            return (LayerStatus::Changed, Some(table));
        };

        let prior = self.read_cached(cache, stats);
        let started = Instant::now();
        let status = if prior.is_some_and(|p| p.same_as(&table, false)) {
            stats.stamp_only += 1;
            if let Err(e) = cache.write_stamp(name, table.stamp()) {
                tracing::warn!(layer = %name, error = %e, "cache write failed");
            }
            LayerStatus::StampOnly
        } else {
            stats.changed_layers += 1;
            if let Err(e) = cache.write_layer(name, &table.to_data()) {
                tracing::warn!(layer = %name, error = %e, "cache write failed");
            }
            LayerStatus::Changed
        };
        stats.cache_write += started.elapsed();
        (status, Some(table))
    }
}

/// What a completed internal phase produced.
struct Merged {
    buckets: Buckets,
    classes: MultiClassTable,
    references: ReferenceTracker,
}

pub struct ScanOrchestrator {
    module: String,
    layers: Vec<Layer>,
    decoder: Arc<dyn Decoder>,
    cache: Option<ModuleCache>,
    options: ScanOptions,
    mode: ScanMode,
    interners: Interners,
    span: tracing::Span,

    phase: Mutex<Phase>,
    classes: Mutex<MultiClassTable>,
    references: Mutex<ReferenceTracker>,
    buckets: RwLock<Buckets>,
    stats: Mutex<ScanStats>,
    layer_locks: Vec<Arc<Mutex<()>>>,
    reintern: Arc<Mutex<()>>,
}

impl ScanOrchestrator {
    /// Layers are searched in the order given. Layer names must be unique
    /// within a module; they key the cache.
    pub fn new(
        module: impl Into<String>,
        layers: Vec<Layer>,
        decoder: Arc<dyn Decoder>,
        cache: Option<AnnoCache>,
        options: ScanOptions,
    ) -> Result<Self> {
        let module = module.into();
        let mut seen = HashSet::new();
        for layer in layers.iter() {
            if !seen.insert(layer.name.as_str()) {
                return Err(AnnoError::invalid(format!("duplicate layer name: {}", layer.name)));
            }
        }

        let interners = Interners::new();
        let span = tracing::info_span!("anno_scan", module = %module);
        let cache = cache
            .filter(|_| options.cache.enabled)
            .map(|c| c.module(&module));
        Ok(Self {
            layer_locks: layers.iter().map(|_| Arc::new(Mutex::new(()))).collect(),
            classes: Mutex::new(MultiClassTable::new(interners.classes.clone())),
            buckets: RwLock::new(Buckets::new(&interners, options.detail)),
            references: Mutex::new(ReferenceTracker::new()),
            stats: Mutex::new(ScanStats::default()),
            reintern: Arc::new(Mutex::new(())),
            phase: Mutex::new(Phase {
                state: ScanState::Unscanned,
                internal_changed: false,
                external_changed: false,
            }),
            module,
            layers,
            decoder,
            cache,
            options,
            mode: ScanMode::Full,
            interners,
            span,
        })
    }

    pub fn with_mode(mut self, mode: ScanMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn mode(&self) -> &ScanMode {
        &self.mode
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn interners(&self) -> &Interners {
        &self.interners
    }

    pub fn state(&self) -> ScanState {
        self.phase.lock().state
    }

    pub fn stats(&self) -> ScanStats {
        self.stats.lock().clone()
    }

    pub fn has_external_layer(&self) -> bool {
        self.layers.iter().any(|l| l.policy == Policy::External)
    }

    pub fn buckets(&self) -> RwLockReadGuard<'_, Buckets> {
        self.buckets.read()
    }

    pub fn classes(&self) -> MutexGuard<'_, MultiClassTable> {
        self.classes.lock()
    }

    pub fn resolved_names(&self) -> BTreeSet<String> {
        self.interners.classes.names(self.references.lock().resolved().iter())
    }

    pub fn unresolved_names(&self) -> BTreeSet<String> {
        self.interners
            .classes
            .names(self.references.lock().unresolved().iter())
    }

    /// Brings the internal buckets up to date. Answers whether any internal
    /// content changed since the cached run.
    pub fn ensure_internal(&self) -> Result<bool> {
        let mut phase = self.phase.lock();
        if phase.state >= ScanState::InternalValidated {
            return Ok(phase.internal_changed);
        }
        let _entered = self.span.enter();
        let changed = self.run_internal()?;
        phase.state = ScanState::InternalValidated;
        phase.internal_changed = changed;
        Ok(changed)
    }

    /// Completes the class hierarchy through the external layer. Answers
    /// whether resolution added any class.
    pub fn ensure_external(&self) -> Result<bool> {
        let mut phase = self.phase.lock();
        if phase.state == ScanState::ExternalValidated {
            return Ok(phase.external_changed);
        }
        if !self.has_external_layer() {
            return Err(AnnoError::NoExternalLayer);
        }
        let _entered = self.span.enter();
        if phase.state == ScanState::Unscanned {
            phase.internal_changed = self.run_internal()?;
            phase.state = ScanState::InternalValidated;
        }
        let changed = self.run_external()?;
        phase.state = ScanState::ExternalValidated;
        phase.external_changed = changed;
        Ok(changed)
    }

    fn internal_slots(&self) -> Vec<usize> {
        self.layers
            .iter()
            .enumerate()
            .filter(|(_, l)| l.policy.is_internal())
            .map(|(i, _)| i)
            .collect()
    }

    fn job(&self, slot: usize, index: usize, kind: JobKind) -> LayerJob {
        LayerJob {
            slot,
            layer: self.layers[index].clone(),
            decoder: Arc::clone(&self.decoder),
            cache: self.cache.clone(),
            lock: Arc::clone(&self.layer_locks[index]),
            reintern: Arc::clone(&self.reintern),
            interners: self.interners.clone(),
            detail: self.options.detail,
            always_invalid: self.options.cache.always_invalid,
            kind,
        }
    }

    /// Runs one job per listed layer. Answers outcomes aligned with
    /// `indices`; a slot is `None` if its worker never reported.
    fn dispatch(&self, indices: &[usize], kind: &JobKind) -> Vec<Option<LayerOutcome>> {
        let jobs: Vec<LayerJob> = indices
            .iter()
            .enumerate()
            .map(|(slot, index)| self.job(slot, *index, kind.clone()))
            .collect();
        let workers = self.options.workers_for(jobs.len());
        let mut outcomes: Vec<Option<LayerOutcome>> = indices.iter().map(|_| None).collect();

        if workers <= 1 || jobs.len() <= 1 {
            for job in jobs {
                let outcome = job.run();
                let slot = outcome.slot;
                outcomes[slot] = Some(outcome);
            }
            return outcomes;
        }

        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("anno-scan-{i}"))
            .panic_handler(|_| tracing::error!("scan worker panicked"))
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                tracing::warn!(error = %e, "worker pool unavailable; scanning sequentially");
                for job in jobs {
                    let outcome = job.run();
                    let slot = outcome.slot;
                    outcomes[slot] = Some(outcome);
                }
                return outcomes;
            }
        };

        let expected = jobs.len();
        let (tx, rx) = mpsc::channel::<LayerOutcome>();
        for job in jobs {
            let tx = tx.clone();
            let span = self.span.clone();
            pool.spawn(move || {
                let _entered = span.enter();
                let _ = tx.send(job.run());
            });
        }
        drop(tx);

        for received in 0..expected {
            match rx.recv() {
                Ok(outcome) => {
                    let slot = outcome.slot;
                    outcomes[slot] = Some(outcome);
                }
                Err(_) => {
                    tracing::warn!(
                        completed = received,
                        expected,
                        "scan wait interrupted; continuing with completed layers"
                    );
                    break;
                }
            }
        }
        outcomes
    }

    fn absorb_stats(&self, outcomes: &[Option<LayerOutcome>]) {
        let mut stats = self.stats.lock();
        for outcome in outcomes.iter().flatten() {
            stats.absorb(&outcome.stats);
        }
    }

    fn run_internal(&self) -> Result<bool> {
        let started = Instant::now();
        let changed = match &self.mode {
            ScanMode::Full => self.internal_full()?,
            ScanMode::Limited => {
                self.internal_forced(JobKind::Limited);
                true
            }
            ScanMode::Specific {
                classes,
                annotations,
            } => {
                let filter = ScanFilter {
                    classes: Some(classes.iter().cloned().collect()),
                    annotations: annotations.as_ref().map(|a| a.iter().cloned().collect()),
                    record_annotations: true,
                    detail: self.options.detail,
                };
                self.internal_forced(JobKind::Specific(Arc::new(filter), Arc::new(classes.clone())));
                true
            }
        };
        let stats = self.stats();
        tracing::debug!(
            changed,
            layers = stats.layers,
            cache_hits = stats.cache_hits,
            decoded = stats.decoded_layers,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "internal phase complete"
        );
        Ok(changed)
    }

    /// Limited and specific scans: no cache, every layer into the seed bucket.
    fn internal_forced(&self, kind: JobKind) {
        let slots = self.internal_slots();
        let outcomes = self.dispatch(&slots, &kind);
        self.absorb_stats(&outcomes);
        let merged = self.merge(&slots, &outcomes, Some(Policy::Seed));
        self.install(merged);
    }

    fn internal_full(&self) -> Result<bool> {
        let slots = self.internal_slots();
        let entries: Vec<LayerEntry> = slots
            .iter()
            .map(|i| LayerEntry {
                name: self.layers[*i].name.clone(),
                policy: self.layers[*i].policy,
            })
            .collect();

        let cached_list = self.cache.as_ref().and_then(|c| {
            c.read_layers().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "cached layer list unreadable; treated as changed");
                None
            })
        });
        let list_changed = cached_list.as_ref() != Some(&entries);
        if list_changed && cached_list.is_some() {
            tracing::info!(module = %self.module, "layer list changed");
        }

        let mut outcomes = self.dispatch(
            &slots,
            &JobKind::Validate {
                force_load: list_changed,
            },
        );
        self.absorb_stats(&outcomes);

        let any_changed = outcomes.iter().any(|o| {
            o.as_ref()
                .is_none_or(|o| matches!(o.status, LayerStatus::Changed | LayerStatus::Unreadable))
        });
        let changed = any_changed || list_changed || self.cache.is_none();

        if !changed {
            if let Some(merged) = self.read_cached_results() {
                self.install(merged);
                return Ok(false);
            }
            tracing::warn!(module = %self.module, "cached results unavailable; merging layers");
        }

        let to_load: Vec<usize> = outcomes
            .iter()
            .enumerate()
            .filter(|(_, o)| o.as_ref().is_some_and(|o| o.table.is_none()))
            .map(|(slot, _)| slot)
            .collect();
        if !to_load.is_empty() {
            let indices: Vec<usize> = to_load.iter().map(|slot| slots[*slot]).collect();
            let loaded = self.dispatch(&indices, &JobKind::Validate { force_load: true });
            for (outcome, slot) in loaded.into_iter().zip(to_load) {
                if let Some(mut outcome) = outcome {
                    outcome.stats.layers = 0;
                    outcome.stats.cache_hits = 0;
                    self.stats.lock().absorb(&outcome.stats);
                    outcome.slot = slot;
                    outcomes[slot] = Some(outcome);
                }
            }
        }

        // An unreadable layer merged as empty must not be written as the
        // module's results: its cached stamp would still validate next run.
        let complete = outcomes.iter().all(|o| {
            o.as_ref()
                .is_some_and(|o| o.table.is_some() && o.status != LayerStatus::Unreadable)
        });
        let merged = self.merge(&slots, &outcomes, None);
        if complete {
            if let Some(cache) = self.cache.as_ref() {
                self.persist(cache, &merged, &entries, cached_list.as_deref());
            }
        } else {
            tracing::warn!(module = %self.module, "incomplete scan; results not cached");
        }
        self.install(merged);
        Ok(changed)
    }

    fn merge(&self, slots: &[usize], outcomes: &[Option<LayerOutcome>], force: Option<Policy>) -> Merged {
        let mut buckets = Buckets::new(&self.interners, self.options.detail);
        let mut classes = MultiClassTable::new(self.interners.classes.clone());
        let mut references = ReferenceTracker::new();

        let tables: Vec<(Policy, &LayerTable)> = slots
            .iter()
            .zip(outcomes.iter())
            .filter_map(|(index, outcome)| {
                let table = outcome.as_ref()?.table.as_ref()?;
                Some((self.layers[*index].policy, table))
            })
            .collect();
        merge_into(&mut buckets, &mut classes, &tables, force, &mut references);

        Merged {
            buckets,
            classes,
            references,
        }
    }

    fn install(&self, merged: Merged) {
        let mut classes = self.classes.lock();
        let mut references = self.references.lock();
        let mut buckets = self.buckets.write();
        *classes = merged.classes;
        *references = merged.references;
        *buckets = merged.buckets;
    }

    fn persist(&self, cache: &ModuleCache, merged: &Merged, entries: &[LayerEntry], previous: Option<&[LayerEntry]>) {
        let started = Instant::now();
        let names = &self.interners.classes;
        let write = || -> Result<()> {
            for policy in Policy::INTERNAL {
                cache.write_bucket(policy, &merged.buckets.get(policy).to_data())?;
            }
            cache.write_classes(&merged.classes.to_data())?;
            cache.write_references(
                &names.names(merged.references.resolved().iter()),
                &names.names(merged.references.unresolved().iter()),
            )?;
            cache.write_layers(entries)?;
            Ok(())
        };
        if let Err(e) = write() {
            tracing::warn!(module = %self.module, error = %e, "cache write failed");
        }

        for stale in previous.unwrap_or_default() {
            if entries.iter().any(|e| e.name == stale.name) {
                continue;
            }
            if let Err(e) = cache.remove_layer(&stale.name) {
                tracing::warn!(layer = %stale.name, error = %e, "stale cache entry not removed");
            }
        }
        self.stats.lock().cache_write += started.elapsed();
    }

    fn read_cached_results(&self) -> Option<Merged> {
        let cache = self.cache.as_ref()?;
        let started = Instant::now();
        let read = || -> Result<Option<Merged>> {
            let mut buckets = Buckets::new(&self.interners, self.options.detail);
            for policy in Policy::INTERNAL {
                let Some(data) = cache.read_bucket(policy)? else {
                    return Ok(None);
                };
                buckets.set(policy, LayerTable::from_data(&data, self.interners.clone()));
            }
            let Some(classes) = cache.read_classes()? else {
                return Ok(None);
            };
            let Some((resolved, unresolved)) = cache.read_references()? else {
                return Ok(None);
            };
            let classes = MultiClassTable::from_data(&classes, self.interners.classes.clone());
            let references =
                ReferenceTracker::from_names(&self.interners.classes, resolved.iter(), unresolved.iter());
            Ok(Some(Merged {
                buckets,
                classes,
                references,
            }))
        };
        let merged = read().unwrap_or_else(|e| {
            tracing::warn!(module = %self.module, error = %e, "cached results unreadable");
            None
        });
        self.stats.lock().cache_read += started.elapsed();
        merged
    }

    fn run_external(&self) -> Result<bool> {
        let started = Instant::now();
        let externals: Vec<&Layer> = self
            .layers
            .iter()
            .filter(|l| l.policy == Policy::External)
            .collect();
        if externals.is_empty() {
            return Err(AnnoError::NoExternalLayer);
        }

        let mut classes = self.classes.lock();
        let mut references = self.references.lock();
        let mut buckets = self.buckets.write();
        let mut stats = ScanStats::default();
        let names = &self.interners.classes;

        let mut working = names.names(references.unresolved().iter());
        let mut added = false;
        while !working.is_empty() {
            stats.external_passes += 1;
            let mut newly_unresolved = HashSet::new();
            for layer in externals.iter() {
                let filter = ScanFilter::external(working.iter().cloned().collect());
                let table = match scan_specific(layer, self.decoder.as_ref(), &working, &filter, &mut stats) {
                    Ok(table) => table,
                    Err(e) => {
                        tracing::warn!(layer = %layer.name, error = %e, "external layer unreadable");
                        continue;
                    }
                };
                let table = {
                    let _serial = self.reintern.lock();
                    table.reinterned(&self.interners)
                };
                let newly = classes.add_layer(&layer.name, Policy::External, table.classes());
                buckets.get_mut(Policy::External).add_selected(&table, &newly);
                added |= !newly.classes.is_empty();
                newly_unresolved.extend(track_references(&classes, &newly.classes, &mut references));
            }
            working = names.names(newly_unresolved.iter());
        }

        tracing::debug!(
            passes = stats.external_passes,
            resolved = references.resolved().len(),
            unresolved = references.unresolved().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "external phase complete"
        );
        self.stats.lock().absorb(&stats);
        Ok(added)
    }
}
