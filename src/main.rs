use anno_index::annotations::AnnotationCategory;
use anno_index::cache::AnnoCache;
use anno_index::cli::{Cli, Commands, OutputFormat};
use anno_index::config::{
    CacheOptions, LOG_ENV, ScanOptions, clear_cache, resolve_cache_dir, resolve_threads,
};
use anno_index::index::AnnotationIndex;
use anno_index::java::JavaSourceDecoder;
use anno_index::orchestrator::ScanOrchestrator;
use anno_index::source::Layer;
use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command.clone() {
        Commands::Clear { all } => {
            let dir = resolve_cache_dir(cli.cache.as_deref())?;
            if all {
                clear_cache(&dir)?;
                println!("cleared {}", dir.display());
            } else {
                let cache = AnnoCache::open_in(&dir)?;
                let removed = cache.module(&cli.module).clear()?;
                println!("cleared {removed} entries of module {}", cli.module);
            }
        }
        Commands::Scan => {
            let start = Instant::now();
            let index = build_index(&cli)?;
            let summary = index.summary()?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
                OutputFormat::Text => {
                    println!("module: {}", summary.module);
                    for layer in &summary.layers {
                        println!(
                            "- {} [{}]: {} classes, {} packages",
                            layer.name, layer.policy, layer.classes, layer.packages
                        );
                    }
                    for (policy, bucket) in &summary.buckets {
                        println!("{policy}: {} classes, {} packages", bucket.classes, bucket.packages);
                    }
                    println!(
                        "cache_hits: {}, decoded_layers: {}, failed_records: {}",
                        summary.stats.cache_hits, summary.stats.decoded_layers, summary.stats.failed_records
                    );
                    println!("unresolved: {}", summary.unresolved);
                    println!("duration_ms: {}", start.elapsed().as_millis());
                }
            }
        }
        Commands::Classes { policies, in_layer } => {
            let index = build_index(&cli)?;
            let names = match in_layer {
                Some(layer) => index.class_names_in_layer(&layer)?,
                None => index.class_names(policies)?,
            };
            write_names(cli.format, &names)?;
        }
        Commands::Annotated {
            annotation,
            category,
            policies,
            in_layer,
        } => {
            let index = build_index(&cli)?;
            let names = match (in_layer, annotation) {
                (Some(layer), Some(annotation)) => index.annotated_in_layer(&layer, &annotation)?,
                (Some(_), None) => anyhow::bail!("--in-layer needs an annotation class"),
                (None, annotation) => index.annotated(category, annotation.as_deref(), policies)?,
            };
            write_names(cli.format, &names)?;
        }
        Commands::Annotations {
            holder,
            category,
            policies,
        } => {
            let index = build_index(&cli)?;
            write_names(cli.format, &index.annotations_of(category, &holder, policies)?)?;
        }
        Commands::Detail {
            holder,
            annotation,
            category,
            member,
        } => {
            let index = build_index(&cli)?;
            let detail = index.annotation_detail(category, &holder, member.as_deref(), &annotation)?;
            let output = DetailOutput {
                category,
                holder,
                member,
                annotation,
                detail,
            };
            write_output(cli.format, &output, |o| o.detail.clone().unwrap_or_default())?;
        }
        Commands::Inherited {
            annotation,
            declarers,
            inheritors,
        } => {
            let index = build_index(&cli)?;
            let names = index.all_inherited_annotated_with(&annotation, declarers, inheritors)?;
            write_names(cli.format, &names)?;
        }
        Commands::Hierarchy { class_name } => {
            let index = build_index(&cli)?;
            let output = hierarchy_of(&index, &class_name)?;
            write_output(cli.format, &output, |o| {
                let mut out = String::new();
                out.push_str(&format!("class_name: {}\n", o.class_name));
                out.push_str(&format!("superclass: {}\n", o.superclass.as_deref().unwrap_or("-")));
                out.push_str(&format!("interfaces: {}\n", o.interfaces.join(", ")));
                out.push_str(&format!("modifiers: {}\n", o.modifiers.join(" ")));
                out.push_str(&format!("subclasses: {}", o.subclasses.len()));
                for sub in &o.subclasses {
                    out.push_str(&format!("\n- {sub}"));
                }
                out
            })?;
        }
        Commands::Implementors { interface } => {
            let index = build_index(&cli)?;
            write_names(cli.format, &index.all_implementors_of(&interface)?)?;
        }
        Commands::InstanceOf {
            candidate,
            target,
            interface,
        } => {
            let index = build_index(&cli)?;
            let answer = index.is_instance_of(&candidate, &target, interface)?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::json!({ "instance_of": answer })),
                OutputFormat::Text => println!("{answer}"),
            }
        }
    }

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_index(cli: &Cli) -> Result<AnnotationIndex> {
    if cli.layers.is_empty() {
        anyhow::bail!("no layers given; pass --layer POLICY=PATH at least once");
    }

    let layers: Vec<Layer> = cli
        .layers
        .iter()
        .map(|arg| Layer::from_path(arg.policy, &arg.path))
        .collect();

    let cache = if cli.no_cache {
        None
    } else {
        let dir = resolve_cache_dir(cli.cache.as_deref())?;
        Some(
            AnnoCache::open_in(&dir)
                .with_context(|| format!("Failed to open cache in {}", dir.display()))?,
        )
    };

    let options = ScanOptions::default()
        .with_threads(resolve_threads(cli.threads)?)
        .with_detail(cli.detail)
        .with_cache(CacheOptions {
            enabled: !cli.no_cache,
            always_invalid: cli.rescan,
        });

    let orchestrator = ScanOrchestrator::new(
        cli.module.clone(),
        layers,
        Arc::new(JavaSourceDecoder::new()),
        cache,
        options,
    )?;
    Ok(AnnotationIndex::new(orchestrator))
}

#[derive(Debug, Serialize)]
struct HierarchyOutput {
    class_name: String,
    superclass: Option<String>,
    interfaces: Vec<String>,
    modifiers: Vec<&'static str>,
    subclasses: BTreeSet<String>,
}

#[derive(Debug, Serialize)]
struct DetailOutput {
    category: AnnotationCategory,
    holder: String,
    member: Option<String>,
    annotation: String,
    detail: Option<String>,
}

fn hierarchy_of(index: &AnnotationIndex, class_name: &str) -> Result<HierarchyOutput> {
    let subclasses = index.subclass_names(class_name)?;
    let modifiers = index
        .modifier_flags(class_name)?
        .with_context(|| format!("class {class_name} is not indexed"))?;
    Ok(HierarchyOutput {
        class_name: class_name.to_string(),
        superclass: index.superclass_name(class_name)?,
        interfaces: index.interface_names(class_name)?,
        modifiers: modifiers.names(),
        subclasses,
    })
}

fn write_names(format: OutputFormat, names: &BTreeSet<String>) -> Result<()> {
    write_output(format, names, |names| {
        names.iter().cloned().collect::<Vec<_>>().join("\n")
    })
}

fn write_output<T: Serialize>(format: OutputFormat, value: &T, text: impl FnOnce(&T) -> String) -> Result<()> {
    let content = match format {
        OutputFormat::Json => serde_json::to_string_pretty(value)?,
        OutputFormat::Text => text(value),
    };
    print!("{content}");
    if !content.ends_with('\n') {
        println!();
    }
    Ok(())
}
