//! Where a layer's resources come from: a directory tree, a jar, or memory.

use anyhow::{Context, Result};
use ignore::WalkBuilder;
use memmap2::Mmap;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;
use zip::ZipArchive;

use crate::policy::Policy;
use crate::table::Stamp;

/// A readable collection of resources, named with `/` separators relative to
/// the source root.
pub trait ClassSource: Send + Sync {
    /// Fingerprint of the current content.
    fn stamp(&self) -> Result<Stamp>;

    fn resources(&self) -> Result<Vec<String>>;

    /// Bytes of one resource; `None` when it is absent.
    fn read(&self, resource: &str) -> Result<Option<Vec<u8>>>;

    /// Visits every resource whose name ends with `extension`, in name order.
    fn visit(&self, extension: &str, f: &mut dyn FnMut(&str, &[u8])) -> Result<()> {
        for resource in self.resources()? {
            if !resource.ends_with(extension) {
                continue;
            }
            if let Some(bytes) = self.read(&resource)? {
                f(&resource, &bytes);
            }
        }
        Ok(())
    }

    fn describe(&self) -> String;
}

/// A named, ordered element of a module's search path.
#[derive(Clone)]
pub struct Layer {
    pub name: String,
    pub policy: Policy,
    pub source: Arc<dyn ClassSource>,
}

impl Layer {
    pub fn new(name: impl Into<String>, policy: Policy, source: Arc<dyn ClassSource>) -> Self {
        Self {
            name: name.into(),
            policy,
            source,
        }
    }

    /// A layer named after its path: a `.jar` file or a directory.
    pub fn from_path(policy: Policy, path: &Path) -> Self {
        let source: Arc<dyn ClassSource> = if path.extension().is_some_and(|e| e == "jar") {
            Arc::new(JarSource::new(path))
        } else {
            Arc::new(DirectorySource::new(path))
        };
        Self::new(path.to_string_lossy(), policy, source)
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("source", &self.source.describe())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn walk(&self) -> Vec<PathBuf> {
        let (tx, rx) = mpsc::channel();

        let walker = WalkBuilder::new(&self.root)
            .hidden(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .build_parallel();

        walker.run(|| {
            let tx = tx.clone();
            Box::new(move |entry| {
                if let Ok(entry) = entry {
                    if entry.file_type().is_some_and(|t| t.is_file()) {
                        let _ = tx.send(entry.into_path());
                    }
                }
                ignore::WalkState::Continue
            })
        });

        drop(tx);
        let mut files: Vec<PathBuf> = rx.iter().collect();
        files.sort();
        files
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        Some(rel.to_string_lossy().replace('\\', "/"))
    }
}

impl ClassSource for DirectorySource {
    /// Digest over every file's name, length and modification time.
    fn stamp(&self) -> Result<Stamp> {
        if !self.root.is_dir() {
            anyhow::bail!("not a directory: {}", self.root.display());
        }
        let mut listing = Vec::new();
        for path in self.walk() {
            let meta = path
                .metadata()
                .with_context(|| format!("cannot stat {}", path.display()))?;
            let modified = meta.modified().map(|m| Stamp::from_modified(m, meta.len()));
            let entry = match modified {
                Ok(stamp) => format!("{}={}", path.display(), stamp.as_str()),
                Err(_) => return Ok(Stamp::unknown()),
            };
            listing.push(entry);
        }
        Ok(Stamp::from_content(listing.iter().map(|e| e.as_bytes())))
    }

    fn resources(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            anyhow::bail!("not a directory: {}", self.root.display());
        }
        Ok(self.walk().iter().filter_map(|p| self.relative(p)).collect())
    }

    fn read(&self, resource: &str) -> Result<Option<Vec<u8>>> {
        let path = self.root.join(resource);
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path).with_context(|| format!("cannot read {}", path.display()))?;
        Ok(Some(bytes))
    }

    fn describe(&self) -> String {
        format!("dir:{}", self.root.display())
    }
}

#[derive(Debug, Clone)]
pub struct JarSource {
    path: PathBuf,
}

impl JarSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_archive<T>(&self, f: impl FnOnce(&mut ZipArchive<Cursor<&[u8]>>) -> Result<T>) -> Result<T> {
        let file = File::open(&self.path)
            .with_context(|| format!("cannot open jar: {}", self.path.display()))?;
        // SAFETY: The file is opened read-only and outlives the mapping.
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("cannot mmap jar: {}", self.path.display()))?;
        let mut archive = ZipArchive::new(Cursor::new(&mmap[..]))
            .with_context(|| format!("cannot read zip structure: {}", self.path.display()))?;
        f(&mut archive)
    }
}

impl ClassSource for JarSource {
    fn stamp(&self) -> Result<Stamp> {
        let meta = self
            .path
            .metadata()
            .with_context(|| format!("cannot stat jar: {}", self.path.display()))?;
        match meta.modified() {
            Ok(modified) => Ok(Stamp::from_modified(modified, meta.len())),
            Err(_) => Ok(Stamp::unknown()),
        }
    }

    fn resources(&self) -> Result<Vec<String>> {
        self.with_archive(|archive| {
            let mut names: Vec<String> = archive
                .file_names()
                .filter(|n| !n.ends_with('/'))
                .map(str::to_string)
                .collect();
            names.sort();
            Ok(names)
        })
    }

    fn read(&self, resource: &str) -> Result<Option<Vec<u8>>> {
        self.with_archive(|archive| {
            let mut entry = match archive.by_name(resource) {
                Ok(entry) => entry,
                Err(zip::result::ZipError::FileNotFound) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes)?;
            Ok(Some(bytes))
        })
    }

    /// Reads every matching entry from a single mapping of the jar.
    fn visit(&self, extension: &str, f: &mut dyn FnMut(&str, &[u8])) -> Result<()> {
        self.with_archive(|archive| {
            let mut names: Vec<String> = archive
                .file_names()
                .filter(|n| n.ends_with(extension))
                .map(str::to_string)
                .collect();
            names.sort();
            for name in names {
                let mut entry = archive.by_name(&name)?;
                let mut bytes = Vec::with_capacity(entry.size() as usize);
                entry
                    .read_to_end(&mut bytes)
                    .with_context(|| format!("cannot inflate {name} in {}", self.path.display()))?;
                drop(entry);
                f(&name, &bytes);
            }
            Ok(())
        })
    }

    fn describe(&self) -> String {
        format!("jar:{}", self.path.display())
    }
}

/// Resources held in memory. The stamp is either given or a digest of the
/// content.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    entries: BTreeMap<String, Vec<u8>>,
    stamp: Option<Stamp>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, resource: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(resource, bytes);
        self
    }

    pub fn with_stamp(mut self, stamp: Stamp) -> Self {
        self.stamp = Some(stamp);
        self
    }

    pub fn insert(&mut self, resource: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.entries.insert(resource.into(), bytes.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ClassSource for MemorySource {
    fn stamp(&self) -> Result<Stamp> {
        if let Some(stamp) = &self.stamp {
            return Ok(stamp.clone());
        }
        Ok(Stamp::from_content(
            self.entries
                .iter()
                .flat_map(|(name, bytes)| [name.as_bytes(), bytes.as_slice()]),
        ))
    }

    fn resources(&self) -> Result<Vec<String>> {
        Ok(self.entries.keys().cloned().collect())
    }

    fn read(&self, resource: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(resource).cloned())
    }

    fn visit(&self, extension: &str, f: &mut dyn FnMut(&str, &[u8])) -> Result<()> {
        for (name, bytes) in self.entries.iter().filter(|(n, _)| n.ends_with(extension)) {
            f(name, bytes);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("memory:{} entries", self.entries.len())
    }
}
