//! # anno-index
//!
//! A layered class hierarchy and annotation index with a persistent,
//! incrementally validated cache.
//!
//! ## Architecture
//!
//! - **intern**: Per-generation symbol tables for class, field and method names
//! - **assoc**: Bidirectional many-to-many holder/held index
//! - **classes**: Class relations of one table with memoized descendant and implementor closures
//! - **multi**: Union class table partitioned by originating layer
//! - **annotations**: Package, class, field and method annotation indexes plus value text
//! - **policy**: Layer visibility policies, policy selections and JVM modifier flags
//! - **table**: Layer tables, change stamps and their persisted form
//! - **decode**: Record event stream contract between decoders and the scanner
//! - **java**: Java source decoder built on tree-sitter
//! - **source**: Directory, jar and in-memory layer sources
//! - **engine**: Record collection, first-wins merging and reference tracking
//! - **cache**: LMDB backed per-module cache of layers and merged buckets
//! - **orchestrator**: Two-phase scan state machine and worker pool
//! - **index**: Query surface over a scan
//! - **config**: Scan options and cache location resolution

pub mod annotations;
pub mod assoc;
pub mod cache;
pub mod classes;
pub mod cli;
pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod index;
pub mod intern;
pub mod java;
pub mod multi;
pub mod orchestrator;
pub mod policy;
pub mod source;
pub mod table;

pub use error::{AnnoError, Result};
pub use index::{AnnotationIndex, IndexDelta};
pub use orchestrator::{ScanMode, ScanOrchestrator, ScanState};
pub use policy::{Policy, PolicySet};
