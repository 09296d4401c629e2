//! Persistent cache for per-layer tables and per-module scan results.
//!
//! Uses LMDB (via heed). Values are JSON documents. Per-layer entries are
//! keyed `"{module}::{layer}"`; module records are keyed
//! `"{module}::{record}"`. Results of external resolution are never stored.

use heed::types::Str;
use heed::{Database, Env, EnvFlags, EnvOpenOptions, RoTxn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;
use crate::multi::MultiClassData;
use crate::policy::Policy;
use crate::table::{LayerTableData, Stamp};

pub const DB_FILE: &str = "anno-index.lmdb";

pub const LAYER_STAMPS_DB: &str = "layer_stamps";
pub const LAYER_DATA_DB: &str = "layer_data";
pub const MODULE_DATA_DB: &str = "module_data";

pub const RECORD_LAYERS: &str = "layers";
pub const RECORD_CLASSES: &str = "classes";
pub const RECORD_RESOLVED: &str = "resolved";
pub const RECORD_UNRESOLVED: &str = "unresolved";

const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;
const DEFAULT_MAX_DBS: u32 = 8;

type StrDb = Database<Str, Str>;

/// One entry of a module's persisted layer list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerEntry {
    pub name: String,
    pub policy: Policy,
}

/// Handle on the cache environment. Cheap to clone; open it once per
/// process and share the handle.
#[derive(Debug, Clone)]
pub struct AnnoCache {
    env: Arc<Env>,
    db_path: PathBuf,
    layer_stamps: StrDb,
    layer_data: StrDb,
    module_data: StrDb,
}

impl AnnoCache {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let env = Arc::new(open_env(&db_path)?);

        let mut wtxn = env.write_txn()?;
        let layer_stamps = env.create_database::<Str, Str>(&mut wtxn, Some(LAYER_STAMPS_DB))?;
        let layer_data = env.create_database::<Str, Str>(&mut wtxn, Some(LAYER_DATA_DB))?;
        let module_data = env.create_database::<Str, Str>(&mut wtxn, Some(MODULE_DATA_DB))?;
        wtxn.commit()?;

        tracing::debug!(path = %db_path.display(), "cache opened");
        Ok(Self {
            env,
            db_path,
            layer_stamps,
            layer_data,
            module_data,
        })
    }

    /// Opens the cache file inside `dir`.
    pub fn open_in(dir: &Path) -> Result<Self> {
        Self::open(dir.join(DB_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn module(&self, module: &str) -> ModuleCache {
        ModuleCache {
            cache: self.clone(),
            module: module.to_string(),
        }
    }

    /// Names of every module with stored results.
    pub fn modules(&self) -> Result<BTreeSet<String>> {
        let rtxn = self.env.read_txn()?;
        let mut modules = BTreeSet::new();
        for item in self.module_data.iter(&rtxn)? {
            let (key, _) = item?;
            if let Some((module, _)) = key.split_once("::") {
                modules.insert(module.to_string());
            }
        }
        Ok(modules)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let rtxn = self.env.read_txn()?;
        Ok(CacheStats {
            db_path: self.db_path.to_string_lossy().to_string(),
            layer_stamps: table_len(&self.layer_stamps, &rtxn)?,
            layer_entries: table_len(&self.layer_data, &rtxn)?,
            module_records: table_len(&self.module_data, &rtxn)?,
        })
    }

    fn get_raw(&self, db: &StrDb, key: &str) -> Result<Option<String>> {
        let rtxn = self.env.read_txn()?;
        Ok(db.get(&rtxn, key)?.map(str::to_string))
    }

    fn get_json<T: DeserializeOwned>(&self, db: &StrDb, key: &str) -> Result<Option<T>> {
        match self.get_raw(db, key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, db: &StrDb, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        let mut wtxn = self.env.write_txn()?;
        db.put(&mut wtxn, key, &raw)?;
        wtxn.commit()?;
        Ok(())
    }

    fn delete_prefix(&self, db: &StrDb, prefix: &str) -> Result<usize> {
        let mut wtxn = self.env.write_txn()?;
        let keys: Vec<String> = {
            let mut keys = Vec::new();
            for item in db.prefix_iter(&wtxn, prefix)? {
                let (key, _) = item?;
                keys.push(key.to_string());
            }
            keys
        };
        for key in keys.iter() {
            db.delete(&mut wtxn, key)?;
        }
        wtxn.commit()?;
        Ok(keys.len())
    }
}

/// A module's view of the cache.
#[derive(Debug, Clone)]
pub struct ModuleCache {
    cache: AnnoCache,
    module: String,
}

impl ModuleCache {
    pub fn module(&self) -> &str {
        &self.module
    }

    fn key(&self, name: &str) -> String {
        format!("{}::{}", self.module, name)
    }

    pub fn read_stamp(&self, layer: &str) -> Result<Option<Stamp>> {
        let raw = self.cache.get_raw(&self.cache.layer_stamps, &self.key(layer))?;
        Ok(raw.map(Stamp::new))
    }

    pub fn write_stamp(&self, layer: &str, stamp: &Stamp) -> Result<()> {
        let mut wtxn = self.cache.env.write_txn()?;
        self.cache
            .layer_stamps
            .put(&mut wtxn, &self.key(layer), stamp.as_str())?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn read_layer(&self, layer: &str) -> Result<Option<LayerTableData>> {
        self.cache.get_json(&self.cache.layer_data, &self.key(layer))
    }

    /// Stores a layer's data and stamp in one transaction. The module's
    /// layer list is dropped in the same transaction, so merged results
    /// written before this content change are never served again.
    pub fn write_layer(&self, layer: &str, data: &LayerTableData) -> Result<()> {
        let raw = serde_json::to_string(data)?;
        let key = self.key(layer);
        let mut wtxn = self.cache.env.write_txn()?;
        self.cache.layer_data.put(&mut wtxn, &key, &raw)?;
        self.cache
            .layer_stamps
            .put(&mut wtxn, &key, data.stamp.as_str())?;
        self.cache
            .module_data
            .delete(&mut wtxn, &self.key(RECORD_LAYERS))?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn remove_layer(&self, layer: &str) -> Result<()> {
        let key = self.key(layer);
        let mut wtxn = self.cache.env.write_txn()?;
        self.cache.layer_data.delete(&mut wtxn, &key)?;
        self.cache.layer_stamps.delete(&mut wtxn, &key)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn read_layers(&self) -> Result<Option<Vec<LayerEntry>>> {
        self.cache
            .get_json(&self.cache.module_data, &self.key(RECORD_LAYERS))
    }

    pub fn write_layers(&self, layers: &[LayerEntry]) -> Result<()> {
        self.cache
            .put_json(&self.cache.module_data, &self.key(RECORD_LAYERS), &layers)
    }

    pub fn read_bucket(&self, policy: Policy) -> Result<Option<LayerTableData>> {
        self.cache
            .get_json(&self.cache.module_data, &self.key(policy.as_str()))
    }

    pub fn write_bucket(&self, policy: Policy, data: &LayerTableData) -> Result<()> {
        self.cache
            .put_json(&self.cache.module_data, &self.key(policy.as_str()), data)
    }

    pub fn read_classes(&self) -> Result<Option<MultiClassData>> {
        self.cache
            .get_json(&self.cache.module_data, &self.key(RECORD_CLASSES))
    }

    pub fn write_classes(&self, data: &MultiClassData) -> Result<()> {
        self.cache
            .put_json(&self.cache.module_data, &self.key(RECORD_CLASSES), data)
    }

    /// Both reference records, or `None` if either is missing.
    pub fn read_references(&self) -> Result<Option<(Vec<String>, Vec<String>)>> {
        let resolved: Option<Vec<String>> = self
            .cache
            .get_json(&self.cache.module_data, &self.key(RECORD_RESOLVED))?;
        let unresolved: Option<Vec<String>> = self
            .cache
            .get_json(&self.cache.module_data, &self.key(RECORD_UNRESOLVED))?;
        Ok(resolved.zip(unresolved))
    }

    pub fn write_references(&self, resolved: &BTreeSet<String>, unresolved: &BTreeSet<String>) -> Result<()> {
        let resolved = serde_json::to_string(resolved)?;
        let unresolved = serde_json::to_string(unresolved)?;
        let mut wtxn = self.cache.env.write_txn()?;
        self.cache
            .module_data
            .put(&mut wtxn, &self.key(RECORD_RESOLVED), &resolved)?;
        self.cache
            .module_data
            .put(&mut wtxn, &self.key(RECORD_UNRESOLVED), &unresolved)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Removes every entry of this module. Answers the number removed.
    pub fn clear(&self) -> Result<usize> {
        let prefix = self.key("");
        let mut removed = self.cache.delete_prefix(&self.cache.module_data, &prefix)?;
        removed += self.cache.delete_prefix(&self.cache.layer_data, &prefix)?;
        self.cache.delete_prefix(&self.cache.layer_stamps, &prefix)?;
        Ok(removed)
    }
}

fn open_env(db_path: &Path) -> Result<Env> {
    let mut options = EnvOpenOptions::new();
    options.map_size(DEFAULT_MAP_SIZE);
    options.max_dbs(DEFAULT_MAX_DBS);
    // SAFETY: Default LMDB locking stays on. NO_SUB_DIR keeps the cache a
    // single file beside its lock file.
    let env = unsafe {
        options.flags(EnvFlags::NO_SUB_DIR);
        options.open(db_path)?
    };
    Ok(env)
}

fn table_len(db: &StrDb, rtxn: &RoTxn<'_>) -> Result<u64> {
    Ok(db.len(rtxn)?)
}

#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub db_path: String,
    pub layer_stamps: u64,
    pub layer_entries: u64,
    pub module_records: u64,
}
