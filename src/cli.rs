use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::annotations::AnnotationCategory;
use crate::policy::{Policy, PolicySet};

#[derive(Debug, Clone, Parser)]
#[command(name = "anno-index")]
#[command(about = "Index classes and annotations across ordered source layers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Layer in search order, e.g. `seed=target/classes` or `external=jdk.jar`.
    #[arg(long = "layer", value_name = "POLICY=PATH", value_parser = parse_layer_arg, global = true)]
    pub layers: Vec<LayerArg>,

    #[arg(long, value_name = "DIR", global = true)]
    pub cache: Option<PathBuf>,

    #[arg(long, global = true)]
    pub no_cache: bool,

    /// Ignore cached layers; fresh results are still written.
    #[arg(long, global = true)]
    pub rescan: bool,

    #[arg(long, value_name = "N", global = true)]
    pub threads: Option<usize>,

    #[arg(long, value_name = "NAME", default_value = "default", global = true)]
    pub module: String,

    /// Keep annotation value text.
    #[arg(long, global = true)]
    pub detail: bool,

    #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Json, global = true)]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    Scan,
    Classes {
        #[arg(long, value_name = "POLICIES", default_value = "seed")]
        policies: PolicySet,

        #[arg(long, value_name = "LAYER", conflicts_with = "policies")]
        in_layer: Option<String>,
    },
    Annotated {
        annotation: Option<String>,

        #[arg(short = 'c', long, default_value = "class")]
        category: AnnotationCategory,

        #[arg(long, value_name = "POLICIES", default_value = "seed")]
        policies: PolicySet,

        #[arg(long, value_name = "LAYER")]
        in_layer: Option<String>,
    },
    Annotations {
        holder: String,

        #[arg(short = 'c', long, default_value = "class")]
        category: AnnotationCategory,

        #[arg(long, value_name = "POLICIES", default_value = "seed")]
        policies: PolicySet,
    },
    Detail {
        holder: String,
        annotation: String,

        #[arg(short = 'c', long, default_value = "class")]
        category: AnnotationCategory,

        #[arg(long, value_name = "NAME")]
        member: Option<String>,
    },
    Inherited {
        annotation: String,

        #[arg(long, value_name = "POLICIES", default_value = "seed")]
        declarers: PolicySet,

        #[arg(long, value_name = "POLICIES", default_value = "seed")]
        inheritors: PolicySet,
    },
    Hierarchy {
        class_name: String,
    },
    Implementors {
        interface: String,
    },
    InstanceOf {
        candidate: String,
        target: String,
        /// The target is an interface; search implemented interfaces too.
        #[arg(long)]
        interface: bool,
    },
    Clear {
        /// Remove the whole cache file instead of one module's records.
        #[arg(long)]
        all: bool,
    },
}

#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum OutputFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerArg {
    pub policy: Policy,
    pub path: PathBuf,
}

pub fn parse_layer_arg(raw: &str) -> Result<LayerArg, String> {
    let (policy, path) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected POLICY=PATH, got `{raw}`"))?;
    let policy = policy.parse::<Policy>().map_err(|e| e.to_string())?;
    if path.trim().is_empty() {
        return Err(format!("empty path in `{raw}`"));
    }
    Ok(LayerArg {
        policy,
        path: PathBuf::from(path),
    })
}
