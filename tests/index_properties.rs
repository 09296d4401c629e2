use anno_index::annotations::AnnotationCategory;
use anno_index::cache::AnnoCache;
use anno_index::config::ScanOptions;
use anno_index::decode::{DecodeError, Decoder, EventSink};
use anno_index::index::AnnotationIndex;
use anno_index::java::JavaSourceDecoder;
use anno_index::orchestrator::ScanOrchestrator;
use anno_index::source::{ClassSource, Layer, MemorySource};
use anno_index::table::Stamp;
use anno_index::{Policy, PolicySet};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Java decoder that counts decode calls.
#[derive(Default)]
struct Counting {
    inner: JavaSourceDecoder,
    calls: AtomicUsize,
}

impl Counting {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Decoder for Counting {
    fn extension(&self) -> &str {
        self.inner.extension()
    }

    fn decode(&self, resource: &str, bytes: &[u8], sink: &mut dyn EventSink) -> Result<(), DecodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.decode(resource, bytes, sink)
    }

    fn resource_for(&self, class_name: &str) -> String {
        self.inner.resource_for(class_name)
    }

    fn class_name_of(&self, resource: &str) -> Option<String> {
        self.inner.class_name_of(resource)
    }
}

/// Java decoder that panics on any resource under `boom/`.
#[derive(Default)]
struct Exploding {
    inner: JavaSourceDecoder,
}

impl Decoder for Exploding {
    fn extension(&self) -> &str {
        self.inner.extension()
    }

    fn decode(&self, resource: &str, bytes: &[u8], sink: &mut dyn EventSink) -> Result<(), DecodeError> {
        if resource.starts_with("boom/") {
            panic!("decoder exploded on {resource}");
        }
        self.inner.decode(resource, bytes, sink)
    }

    fn resource_for(&self, class_name: &str) -> String {
        self.inner.resource_for(class_name)
    }

    fn class_name_of(&self, resource: &str) -> Option<String> {
        self.inner.class_name_of(resource)
    }
}

/// Memory source that can be taken offline: its stamp then fails.
struct Flaky {
    inner: MemorySource,
    offline: bool,
}

impl ClassSource for Flaky {
    fn stamp(&self) -> anyhow::Result<Stamp> {
        if self.offline {
            anyhow::bail!("layer offline");
        }
        self.inner.stamp()
    }

    fn resources(&self) -> anyhow::Result<Vec<String>> {
        self.inner.resources()
    }

    fn read(&self, resource: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.inner.read(resource)
    }

    fn describe(&self) -> String {
        format!("flaky {}", self.inner.describe())
    }
}

fn source(files: &[(&str, &str)]) -> MemorySource {
    let mut source = MemorySource::new();
    for (path, text) in files {
        source.insert(*path, text.as_bytes().to_vec());
    }
    source
}

fn layer(name: &str, policy: Policy, files: &[(&str, &str)]) -> Layer {
    Layer::new(name, policy, Arc::new(source(files)))
}

fn jdk() -> Layer {
    layer(
        "jdk",
        Policy::External,
        &[
            ("java/lang/Object.java", "package java.lang; public class Object {}"),
            ("java/lang/Enum.java", "package java.lang; public abstract class Enum {}"),
        ],
    )
}

fn orchestrator(
    layers: Vec<Layer>,
    decoder: Arc<dyn Decoder>,
    cache: Option<AnnoCache>,
    options: ScanOptions,
) -> anyhow::Result<ScanOrchestrator> {
    Ok(ScanOrchestrator::new("app", layers, decoder, cache, options)?)
}

fn index(layers: Vec<Layer>) -> anyhow::Result<AnnotationIndex> {
    let orch = orchestrator(layers, Arc::new(JavaSourceDecoder::new()), None, ScanOptions::default())?;
    Ok(AnnotationIndex::new(orch))
}

fn set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[test]
fn earlier_layer_masks_later_definitions() -> anyhow::Result<()> {
    let idx = index(vec![
        layer("first", Policy::Seed, &[("a/C.java", "package a; @Early public class C {}")]),
        layer(
            "second",
            Policy::Partial,
            &[
                ("a/C.java", "package a; @Late public class C implements Runnable {}"),
                ("a/D.java", "package a; @Late public class D {}"),
            ],
        ),
    ])?;

    assert_eq!(idx.policy_of("a.C")?, Some(Policy::Seed));
    assert_eq!(idx.class_names_in_layer("first")?, set(&["a.C"]));
    assert_eq!(idx.class_names_in_layer("second")?, set(&["a.D"]));
    assert_eq!(
        idx.annotations_of(AnnotationCategory::Class, "a.C", PolicySet::INTERNAL)?,
        set(&["a.Early"])
    );
    assert_eq!(
        idx.annotated(AnnotationCategory::Class, Some("a.Late"), PolicySet::INTERNAL)?,
        set(&["a.D"])
    );
    assert!(idx.interface_names("a.C")?.is_empty());
    Ok(())
}

#[test]
fn resolved_and_unresolved_stay_disjoint() -> anyhow::Result<()> {
    let idx = index(vec![
        layer(
            "app",
            Policy::Seed,
            &[
                ("a/A.java", "package a; public class A extends B implements z.Gone {}"),
                ("a/B.java", "package a; public class B {}"),
            ],
        ),
        layer("lib", Policy::Excluded, &[("a/E.java", "package a; public class E extends A {}")]),
        jdk(),
    ])?;

    idx.ensure_internal()?;
    let orch = idx.orchestrator();
    let (resolved, unresolved) = (orch.resolved_names(), orch.unresolved_names());
    assert!(resolved.is_disjoint(&unresolved));
    assert!(unresolved.contains("z.Gone"));
    assert!(unresolved.contains("java.lang.Object"));

    idx.ensure_external()?;
    let (resolved, unresolved) = (orch.resolved_names(), orch.unresolved_names());
    assert!(resolved.is_disjoint(&unresolved));
    assert!(resolved.contains("java.lang.Object"));
    assert_eq!(unresolved, set(&["z.Gone"]));
    Ok(())
}

#[test]
fn unchanged_layers_are_served_from_the_cache() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = AnnoCache::open_in(dir.path())?;
    let layers = || {
        vec![
            layer("app", Policy::Seed, &[("a/A.java", "package a; @Entity public class A {}")]),
            layer("lib", Policy::Partial, &[("b/B.java", "package b; @a.Entity public class B {}")]),
        ]
    };

    let first_decoder = Arc::new(Counting::default());
    let first = orchestrator(layers(), first_decoder.clone(), Some(cache.clone()), ScanOptions::default())?;
    assert!(first.ensure_internal()?);
    assert_eq!(first_decoder.calls(), 2);

    let second_decoder = Arc::new(Counting::default());
    let second = orchestrator(layers(), second_decoder.clone(), Some(cache.clone()), ScanOptions::default())?;
    assert!(!second.ensure_internal()?);
    assert_eq!(second_decoder.calls(), 0);
    assert_eq!(second.stats().cache_hits, 2);
    assert!(second.buckets().same_internal(&first.buckets()));

    let idx = AnnotationIndex::new(second);
    assert_eq!(
        idx.annotated(AnnotationCategory::Class, Some("a.Entity"), PolicySet::INTERNAL)?,
        set(&["a.A", "b.B"])
    );
    Ok(())
}

#[test]
fn stamp_only_change_is_not_a_content_change() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = AnnoCache::open_in(dir.path())?;
    let files = [("a/A.java", "package a; @Entity public class A {}")];
    let stamped = |stamp: &str| {
        vec![Layer::new(
            "app",
            Policy::Seed,
            Arc::new(source(&files).with_stamp(Stamp::new(stamp))),
        )]
    };

    let first = orchestrator(stamped("1"), Arc::new(JavaSourceDecoder::new()), Some(cache.clone()), ScanOptions::default())?;
    assert!(first.ensure_internal()?);

    let decoder = Arc::new(Counting::default());
    let second = orchestrator(stamped("2"), decoder.clone(), Some(cache.clone()), ScanOptions::default())?;
    assert!(!second.ensure_internal()?);
    assert_eq!(decoder.calls(), 1);
    assert_eq!(second.stats().stamp_only, 1);
    assert_eq!(second.stats().changed_layers, 0);

    let persisted = cache.module("app").read_stamp("app")?;
    assert_eq!(persisted.as_ref().map(Stamp::as_str), Some("2"));
    assert!(second.buckets().same_internal(&first.buckets()));
    Ok(())
}

#[test]
fn unreadable_layer_does_not_poison_the_cache() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = AnnoCache::open_in(dir.path())?;
    let run = |app: &[(&str, &str)], lib_offline: bool| -> anyhow::Result<BTreeSet<String>> {
        let lib = Flaky {
            inner: source(&[("b/B.java", "package b; public class B {}")]).with_stamp(Stamp::new("lib-1")),
            offline: lib_offline,
        };
        let layers = vec![
            layer("app", Policy::Seed, app),
            Layer::new("lib", Policy::Partial, Arc::new(lib)),
        ];
        let orch = orchestrator(layers, Arc::new(JavaSourceDecoder::new()), Some(cache.clone()), ScanOptions::default())?;
        Ok(AnnotationIndex::new(orch).class_names(PolicySet::INTERNAL)?)
    };
    let v1 = [("a/A.java", "package a; public class A {}")];
    let v2 = [("a/A2.java", "package a; public class A2 {}")];

    assert_eq!(run(&v1[..], false)?, set(&["a.A", "b.B"]));
    assert_eq!(run(&v1[..], true)?, set(&["a.A"]));
    assert!(cache.module("app").read_stamp("lib")?.is_some());
    assert_eq!(run(&v1[..], false)?, set(&["a.A", "b.B"]));

    // Content changes elsewhere while the layer is offline.
    assert_eq!(run(&v2[..], true)?, set(&["a.A2"]));
    assert_eq!(run(&v2[..], false)?, set(&["a.A2", "b.B"]));
    Ok(())
}

#[test]
fn content_change_is_merged_again_with_the_cache_enabled() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = AnnoCache::open_in(dir.path())?;
    let layers = |lib: &str| {
        vec![
            layer("app", Policy::Seed, &[("a/A.java", "package a; @x.Old public class A {}")]),
            layer("lib", Policy::Partial, &[("b/B.java", lib)]),
        ]
    };

    let first = orchestrator(
        layers("package b; @x.Old public class B {}"),
        Arc::new(JavaSourceDecoder::new()),
        Some(cache.clone()),
        ScanOptions::default(),
    )?;
    assert!(first.ensure_internal()?);

    let decoder = Arc::new(Counting::default());
    let second = orchestrator(
        layers("package b; @x.New public class B {}"),
        decoder.clone(),
        Some(cache.clone()),
        ScanOptions::default(),
    )?;
    assert!(second.ensure_internal()?);
    assert_eq!(decoder.calls(), 1);
    assert_eq!(second.stats().changed_layers, 1);
    assert_eq!(second.stats().cache_hits, 1);
    let idx = AnnotationIndex::new(second);
    assert_eq!(idx.annotated_classes("x.Old")?, set(&["a.A"]));
    assert_eq!(
        idx.annotated(AnnotationCategory::Class, Some("x.New"), PolicySet::INTERNAL)?,
        set(&["b.B"])
    );

    let decoder = Arc::new(Counting::default());
    let third = orchestrator(
        layers("package b; @x.New public class B {}"),
        decoder.clone(),
        Some(cache.clone()),
        ScanOptions::default(),
    )?;
    assert!(!third.ensure_internal()?);
    assert_eq!(decoder.calls(), 0);
    assert!(third.buckets().same_internal(&idx.orchestrator().buckets()));
    Ok(())
}

#[test]
fn layer_list_change_reloads_and_drops_stale_layers() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = AnnoCache::open_in(dir.path())?;
    let app = || layer("app", Policy::Partial, &[("a/S.java", "package a; @x.FromApp public class S {}")]);
    let lib = || layer("lib", Policy::Partial, &[("a/S.java", "package a; @x.FromLib public class S {}")]);
    let old = || layer("old", Policy::Excluded, &[("o/O.java", "package o; public class O {}")]);

    let first = orchestrator(
        vec![app(), lib(), old()],
        Arc::new(JavaSourceDecoder::new()),
        Some(cache.clone()),
        ScanOptions::default(),
    )?;
    assert!(first.ensure_internal()?);
    assert!(cache.module("app").read_layer("old")?.is_some());

    let decoder = Arc::new(Counting::default());
    let second = orchestrator(vec![lib(), app()], decoder.clone(), Some(cache.clone()), ScanOptions::default())?;
    assert!(second.ensure_internal()?);
    assert_eq!(decoder.calls(), 0);
    assert_eq!(second.stats().cache_hits, 2);

    let idx = AnnotationIndex::new(second);
    assert_eq!(idx.class_names_in_layer("lib")?, set(&["a.S"]));
    assert!(idx.class_names_in_layer("app")?.is_empty());
    assert_eq!(
        idx.annotations_of(AnnotationCategory::Class, "a.S", PolicySet::INTERNAL)?,
        set(&["x.FromLib"])
    );
    assert!(!idx.contains_class("o.O", PolicySet::INTERNAL)?);

    let module = cache.module("app");
    assert!(module.read_layer("old")?.is_none());
    assert!(module.read_stamp("old")?.is_none());
    let names: Vec<String> = module
        .read_layers()?
        .unwrap_or_default()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["lib", "app"]);
    Ok(())
}

#[test]
fn cache_write_failures_leave_results_intact() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = AnnoCache::open_in(dir.path())?;
    // LMDB rejects keys this long, so every record of this module fails to write.
    let module = "m".repeat(20_000);
    let run = || -> anyhow::Result<(bool, AnnotationIndex)> {
        let orch = ScanOrchestrator::new(
            module.as_str(),
            vec![
                layer("app", Policy::Seed, &[("a/A.java", "package a; @x.Entity public class A {}")]),
                layer("lib", Policy::Partial, &[("b/B.java", "package b; @x.Entity public class B {}")]),
            ],
            Arc::new(JavaSourceDecoder::new()),
            Some(cache.clone()),
            ScanOptions::default(),
        )?;
        let changed = orch.ensure_internal()?;
        Ok((changed, AnnotationIndex::new(orch)))
    };

    for _ in 0..2 {
        let (changed, idx) = run()?;
        assert!(changed);
        assert_eq!(idx.orchestrator().stats().cache_hits, 0);
        assert_eq!(
            idx.annotated(AnnotationCategory::Class, Some("x.Entity"), PolicySet::INTERNAL)?,
            set(&["a.A", "b.B"])
        );
    }
    assert_eq!(cache.stats()?.layer_entries, 0);
    Ok(())
}

#[test]
fn worker_panic_keeps_completed_layers_and_skips_the_cache() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = AnnoCache::open_in(dir.path())?;
    let layers = || {
        vec![
            layer("app", Policy::Seed, &[("a/A.java", "package a; public class A {}")]),
            layer("lib", Policy::Partial, &[("boom/B.java", "package boom; public class B {}")]),
        ]
    };

    let broken = orchestrator(
        layers(),
        Arc::new(Exploding::default()),
        Some(cache.clone()),
        ScanOptions::default().with_threads(2),
    )?;
    assert!(broken.ensure_internal()?);
    let idx = AnnotationIndex::new(broken);
    assert_eq!(idx.class_names(PolicySet::INTERNAL)?, set(&["a.A"]));

    let module = cache.module("app");
    assert!(module.read_layers()?.is_none());
    assert!(module.read_stamp("lib")?.is_none());

    let decoder = Arc::new(Counting::default());
    let recovered = orchestrator(layers(), decoder.clone(), Some(cache.clone()), ScanOptions::default())?;
    assert!(recovered.ensure_internal()?);
    assert_eq!(decoder.calls(), 1);
    let idx = AnnotationIndex::new(recovered);
    assert_eq!(idx.class_names(PolicySet::INTERNAL)?, set(&["a.A", "boom.B"]));
    Ok(())
}

#[test]
fn external_resolution_terminates_with_everything_resolvable_resolved() -> anyhow::Result<()> {
    let idx = index(vec![
        layer("app", Policy::Seed, &[("a/A.java", "package a; public class A extends b.B {}")]),
        layer(
            "jdk",
            Policy::External,
            &[
                ("b/B.java", "package b; public class B extends c.C {}"),
                ("c/C.java", "package c; public class C {}"),
                ("java/lang/Object.java", "package java.lang; public class Object {}"),
            ],
        ),
    ])?;

    assert!(idx.ensure_external()?);
    let resolved = idx.orchestrator().resolved_names();
    for name in ["a.A", "b.B", "c.C", "java.lang.Object"] {
        assert!(resolved.contains(name), "{name} unresolved");
    }
    assert!(idx.orchestrator().unresolved_names().is_empty());
    assert!(idx.orchestrator().stats().external_passes >= 3);

    assert_eq!(idx.class_names(PolicySet::EXTERNAL)?, set(&["b.B", "c.C", "java.lang.Object"]));
    assert!(idx.is_instance_of("a.A", "c.C", false)?);
    assert_eq!(idx.subclass_names("c.C")?, set(&["a.A", "b.B"]));
    Ok(())
}

#[test]
fn inherited_annotations_reach_unannotated_subclasses() -> anyhow::Result<()> {
    let idx = index(vec![
        layer(
            "app",
            Policy::Seed,
            &[
                ("a/X.java", "package a; @Foo public class X {}"),
                ("a/Y.java", "package a; public class Y extends X {}"),
                ("a/Other.java", "package a; public class Other {}"),
            ],
        ),
        jdk(),
    ])?;

    assert_eq!(idx.annotated_classes("a.Foo")?, set(&["a.X"]));
    assert_eq!(idx.all_inherited_annotated("a.Foo")?, set(&["a.X", "a.Y"]));
    Ok(())
}

#[test]
fn threaded_and_sequential_scans_agree() -> anyhow::Result<()> {
    let layers = || {
        vec![
            layer(
                "one",
                Policy::Seed,
                &[
                    ("a/A.java", "package a; @Entity public class A { @Id long id; }"),
                    ("a/Shared.java", "package a; @One public class Shared {}"),
                ],
            ),
            layer(
                "two",
                Policy::Partial,
                &[
                    ("a/Shared.java", "package a; @Two public class Shared {}"),
                    ("b/B.java", "package b; @a.Entity public class B extends a.A {}"),
                ],
            ),
            layer(
                "three",
                Policy::Excluded,
                &[
                    ("b/B.java", "package b; public class B {}"),
                    ("c/C.java", "package c; public enum C { X }"),
                    ("c/package-info.java", "@Api package c;"),
                ],
            ),
            layer("four", Policy::Seed, &[("d/D.java", "package d; public interface D {}")]),
        ]
    };

    let sequential = orchestrator(layers(), Arc::new(JavaSourceDecoder::new()), None, ScanOptions::default())?;
    let threaded = orchestrator(
        layers(),
        Arc::new(JavaSourceDecoder::new()),
        None,
        ScanOptions::default().with_threads(4),
    )?;
    sequential.ensure_internal()?;
    threaded.ensure_internal()?;

    assert!(threaded.buckets().same_internal(&sequential.buckets()));
    assert_eq!(threaded.resolved_names(), sequential.resolved_names());
    assert_eq!(threaded.unresolved_names(), sequential.unresolved_names());

    let idx = AnnotationIndex::new(threaded);
    assert_eq!(idx.policy_of("a.Shared")?, Some(Policy::Seed));
    assert_eq!(idx.policy_of("b.B")?, Some(Policy::Partial));
    assert_eq!(idx.class_names(PolicySet::SEED)?, set(&["a.A", "a.Shared", "d.D"]));
    Ok(())
}

#[test]
fn policy_selection_is_a_plain_union() -> anyhow::Result<()> {
    let idx = index(vec![
        layer("app", Policy::Seed, &[("a/A.java", "package a; @Entity public class A {}")]),
        layer(
            "lib",
            Policy::Partial,
            &[
                ("b/B.java", "package b; @a.Entity public class B {}"),
                ("a/A.java", "package a; @Entity public class A {}"),
            ],
        ),
        layer("skip", Policy::Excluded, &[("c/C.java", "package c; @a.Entity public class C {}")]),
    ])?;

    let seed = idx.annotated(AnnotationCategory::Class, Some("a.Entity"), PolicySet::SEED)?;
    let partial = idx.annotated(AnnotationCategory::Class, Some("a.Entity"), PolicySet::PARTIAL)?;
    let both = idx.annotated(
        AnnotationCategory::Class,
        Some("a.Entity"),
        PolicySet::SEED | PolicySet::PARTIAL,
    )?;

    assert_eq!(both, seed.union(&partial).cloned().collect());
    assert_eq!(both, set(&["a.A", "b.B"]));
    assert_eq!(
        idx.annotated(AnnotationCategory::Class, Some("a.Entity"), PolicySet::INTERNAL)?,
        set(&["a.A", "b.B", "c.C"])
    );
    Ok(())
}

#[test]
fn limited_mode_puts_every_internal_layer_in_seed() -> anyhow::Result<()> {
    let orch = orchestrator(
        vec![
            layer("app", Policy::Seed, &[("a/A.java", "package a; @Entity public class A {}")]),
            layer("skip", Policy::Excluded, &[("c/C.java", "package c; @a.Entity public class C {}")]),
        ],
        Arc::new(JavaSourceDecoder::new()),
        None,
        ScanOptions::default(),
    )?
    .with_mode(anno_index::ScanMode::Limited);
    let idx = AnnotationIndex::new(orch);

    assert_eq!(idx.annotated_classes("a.Entity")?, set(&["a.A", "c.C"]));
    assert!(idx.class_names(PolicySet::EXCLUDED)?.is_empty());
    Ok(())
}
