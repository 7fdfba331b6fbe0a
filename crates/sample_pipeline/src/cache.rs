use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::{
    config::CACHE_FORMAT_VERSION,
    error::{PipelineError, Result},
    record::{Field, Record, Value},
};

/// Fields every cache entry carries so a hit can be traced back to its source
pub const IDENTITY_FIELDS: [Field; 2] = [Field::ConceptName, Field::ImagePath];

/// Large per-sample values, stored with bincode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitEntry {
    pub version: u32,
    pub fingerprint: String,
    pub key: String,
    pub variation: u32,
    pub fields: BTreeMap<Field, Value>,
}

/// Small metadata needed for bucketing, stored as JSON and written last so
/// its presence marks a complete entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateEntry {
    pub version: u32,
    pub fingerprint: String,
    pub key: String,
    pub variation: u32,
    pub created_at: DateTime<Utc>,
    pub fields: BTreeMap<Field, Value>,
}

/// Content-keyed persistence between the expensive per-sample stages and
/// batch assembly.
///
/// Layout: `<cache_dir>/<fingerprint>/<key>.v<variation>.split.bin` and
/// `<key>.v<variation>.agg.json`.
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
    fingerprint: String,
    split_fields: Vec<Field>,
    aggregate_fields: Vec<Field>,
}

impl DiskCache {
    /// Open (creating if needed) the cache directory for `fingerprint`
    pub fn new(
        cache_dir: impl AsRef<Path>,
        fingerprint: impl Into<String>,
        split_fields: Vec<Field>,
        aggregate_fields: Vec<Field>,
    ) -> Result<Self> {
        let fingerprint = fingerprint.into();
        let root = cache_dir.as_ref().join(&fingerprint);
        fs::create_dir_all(&root).map_err(|e| {
            PipelineError::Config(format!("cannot create cache directory {}: {}", root.display(), e))
        })?;

        let mut aggregate = IDENTITY_FIELDS.to_vec();
        for field in aggregate_fields {
            if !aggregate.contains(&field) {
                aggregate.push(field);
            }
        }

        Ok(Self {
            root,
            fingerprint,
            split_fields,
            aggregate_fields: aggregate,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn split_fields(&self) -> &[Field] {
        &self.split_fields
    }

    /// Aggregate fields including the identity fields
    pub fn aggregate_fields(&self) -> &[Field] {
        &self.aggregate_fields
    }

    /// Every field a cache hit restores
    pub fn cached_fields(&self) -> Vec<Field> {
        let mut fields = self.aggregate_fields.clone();
        fields.extend(self.split_fields.iter().copied());
        fields
    }

    pub fn split_path(&self, key: &str, variation: u32) -> PathBuf {
        self.root.join(format!("{}.v{}.split.bin", key, variation))
    }

    pub fn aggregate_path(&self, key: &str, variation: u32) -> PathBuf {
        self.root.join(format!("{}.v{}.agg.json", key, variation))
    }

    /// The aggregate fields of a complete, current entry, or `None` on a miss.
    ///
    /// Unreadable or stale entries count as misses.
    pub fn lookup(&self, key: &str, variation: u32) -> Option<Record> {
        match self.read_aggregate(key, variation) {
            Ok(record) if self.split_path(key, variation).is_file() => Some(record),
            Ok(_) => {
                debug!("Cache miss for {}: split entry missing", key);
                None
            }
            Err(e) => {
                debug!("Cache miss for {}: {}", key, e);
                None
            }
        }
    }

    /// Every cached field of one entry
    pub fn read(&self, key: &str, variation: u32) -> Result<Record> {
        let mut record = self.read_aggregate(key, variation)?;

        let path = self.split_path(key, variation);
        let bytes = fs::read(&path).map_err(|e| corrupt(&path, e.to_string()))?;
        let (entry, _): (SplitEntry, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| corrupt(&path, e.to_string()))?;
        self.check_header(&path, entry.version, &entry.fingerprint, &entry.key, entry.variation, key, variation)?;

        let mut fields = entry.fields;
        for field in &self.split_fields {
            let value = fields
                .remove(field)
                .ok_or_else(|| corrupt(&path, format!("missing split field '{}'", field)))?;
            record.insert(*field, value);
        }
        Ok(record)
    }

    /// Persist the split and aggregate fields of `record`.
    ///
    /// Each file is written to a temporary sibling and renamed into place;
    /// the aggregate goes last.
    pub fn write(&self, record: &Record, variation: u32) -> Result<()> {
        let key = record.key();
        let split = SplitEntry {
            version: CACHE_FORMAT_VERSION,
            fingerprint: self.fingerprint.clone(),
            key: key.to_string(),
            variation,
            fields: self.collect_fields(record, &self.split_fields)?,
        };
        let aggregate = AggregateEntry {
            version: CACHE_FORMAT_VERSION,
            fingerprint: self.fingerprint.clone(),
            key: key.to_string(),
            variation,
            created_at: Utc::now(),
            fields: self.collect_fields(record, &self.aggregate_fields)?,
        };

        let split_path = self.split_path(key, variation);
        let bytes = bincode::serde::encode_to_vec(&split, bincode::config::standard())
            .map_err(|e| write_failed(&split_path, e.to_string()))?;
        let aggregate_path = self.aggregate_path(key, variation);
        let json = serde_json::to_vec_pretty(&aggregate)
            .map_err(|e| write_failed(&aggregate_path, e.to_string()))?;
        self.persist(&split_path, &bytes)?;
        self.persist(&aggregate_path, &json)?;
        debug!("Cached {} v{}", key, variation);
        Ok(())
    }

    /// A copy of `record` holding only what a cache hit would restore
    pub fn project(&self, record: &Record) -> Record {
        record.project(&self.cached_fields())
    }

    fn collect_fields(&self, record: &Record, fields: &[Field]) -> Result<BTreeMap<Field, Value>> {
        fields
            .iter()
            .map(|field| Ok((*field, record.require("disk_cache", *field)?.clone())))
            .collect()
    }

    fn persist(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut file = NamedTempFile::new_in(&self.root).map_err(PipelineError::io(&self.root))?;
        file.write_all(bytes).map_err(PipelineError::io(path))?;
        file.persist(path).map_err(|e| PipelineError::Io {
            path: path.to_path_buf(),
            source: e.error,
        })?;
        Ok(())
    }

    fn read_aggregate(&self, key: &str, variation: u32) -> Result<Record> {
        let path = self.aggregate_path(key, variation);
        let bytes = fs::read(&path).map_err(|e| corrupt(&path, e.to_string()))?;
        let entry: AggregateEntry =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(&path, e.to_string()))?;
        self.check_header(&path, entry.version, &entry.fingerprint, &entry.key, entry.variation, key, variation)?;

        let mut record = Record::new(key);
        let mut fields = entry.fields;
        for field in &self.aggregate_fields {
            let value = fields
                .remove(field)
                .ok_or_else(|| corrupt(&path, format!("missing aggregate field '{}'", field)))?;
            record.insert(*field, value);
        }
        Ok(record)
    }

    #[allow(clippy::too_many_arguments)]
    fn check_header(
        &self,
        path: &Path,
        version: u32,
        fingerprint: &str,
        stored_key: &str,
        stored_variation: u32,
        key: &str,
        variation: u32,
    ) -> Result<()> {
        if version != CACHE_FORMAT_VERSION {
            return Err(corrupt(path, format!("format version {} != {}", version, CACHE_FORMAT_VERSION)));
        }
        if fingerprint != self.fingerprint {
            return Err(corrupt(path, "written under a different configuration".to_string()));
        }
        if stored_key != key || stored_variation != variation {
            return Err(corrupt(path, format!("entry belongs to {} v{}", stored_key, stored_variation)));
        }
        Ok(())
    }
}

fn write_failed(path: &Path, reason: String) -> PipelineError {
    PipelineError::CacheWrite {
        path: path.to_path_buf(),
        reason,
    }
}

fn corrupt(path: &Path, reason: String) -> PipelineError {
    PipelineError::CacheCorrupt {
        path: path.to_path_buf(),
        reason,
    }
}
