use std::collections::HashSet;
use std::fs;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use mf_core::container::{write_atomic, ArrayContainer};
use mf_core::error::{DatasetIndexError, Error, Result};
use mf_core::record::{RecordId, TrainingRecord};

const MANIFEST_FILE: &str = "index.json";
const RECORDS_DIR: &str = "records";
const MANIFEST_VERSION: u32 = 1;

/// One catalogued record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub record_id: RecordId,
    pub scene_id: String,
    /// Payload path relative to the index root
    pub storage_path: PathBuf,
}

/// `(record_id, storage_path)` reference stored per partition
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub record_id: RecordId,
    pub storage_path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SavedSplit {
    pub seed: u64,
    pub train_fraction: f64,
    pub train: Vec<PartitionEntry>,
    pub test: Vec<PartitionEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    entries: Vec<IndexEntry>,
    split: Option<SavedSplit>,
}

struct IndexState {
    manifest: Manifest,
    scene_ids: HashSet<String>,
}

/// Append-only catalog of training records stored under one directory.
///
/// `add` is serialized behind a lock so ids stay unique and gap-free even when
/// several producers write concurrently.
pub struct DatasetIndex {
    root: PathBuf,
    state: Mutex<IndexState>,
}

impl DatasetIndex {
    /// Open the index at `root`, creating an empty one when none exists.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(RECORDS_DIR))?;

        let manifest_path = root.join(MANIFEST_FILE);
        let manifest = if manifest_path.exists() {
            let manifest: Manifest =
                serde_json::from_reader(BufReader::new(fs::File::open(&manifest_path)?))?;
            if manifest.version != MANIFEST_VERSION {
                return Err(Error::InvalidContainer(format!(
                    "unsupported index version {}",
                    manifest.version
                )));
            }
            manifest
        } else {
            Manifest {
                version: MANIFEST_VERSION,
                entries: Vec::new(),
                split: None,
            }
        };

        let scene_ids = manifest.entries.iter().map(|e| e.scene_id.clone()).collect();
        log::debug!(
            "Opened dataset index at {} ({} records)",
            root.display(),
            manifest.entries.len()
        );

        Ok(Self {
            root,
            state: Mutex::new(IndexState { manifest, scene_ids }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        // A poisoned lock only means a writer panicked; the manifest on disk is
        // still the last atomically written one.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Persist `record` and return its id.
    pub fn add(&self, record: &TrainingRecord) -> Result<RecordId> {
        let mut state = self.lock();

        if state.scene_ids.contains(&record.scene_id) {
            return Err(DatasetIndexError::DuplicateId(record.scene_id.clone()).into());
        }

        let record_id = state.manifest.entries.len() as RecordId;
        let storage_path = PathBuf::from(RECORDS_DIR).join(format!("{:08}.mfac", record_id));
        record.to_container()?.save(&self.root.join(&storage_path))?;

        state.manifest.entries.push(IndexEntry {
            record_id,
            scene_id: record.scene_id.clone(),
            storage_path,
        });
        if let Err(e) = self.write_manifest(&state.manifest) {
            state.manifest.entries.pop();
            return Err(e);
        }
        state.scene_ids.insert(record.scene_id.clone());

        Ok(record_id)
    }

    /// Load a record payload
    pub fn get(&self, record_id: RecordId) -> Result<TrainingRecord> {
        let path = {
            let state = self.lock();
            let entry = state
                .manifest
                .entries
                .get(record_id as usize)
                .ok_or(DatasetIndexError::NotFound(record_id))?;
            self.root.join(&entry.storage_path)
        };

        let container = ArrayContainer::load(&path).map_err(|e| match e {
            Error::IoError(io) if io.kind() == std::io::ErrorKind::NotFound => {
                DatasetIndexError::NotFound(record_id).into()
            }
            other => other,
        })?;
        TrainingRecord::from_container(&container)
    }

    pub fn len(&self) -> usize {
        self.lock().manifest.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<RecordId> {
        self.lock().manifest.entries.iter().map(|e| e.record_id).collect()
    }

    pub fn entries(&self) -> Vec<IndexEntry> {
        self.lock().manifest.entries.clone()
    }

    /// Deterministic train/test assignment keyed by `seed`.
    ///
    /// Each id is placed by hashing `(seed, record_id)`, so a record's side
    /// never depends on which other records exist or the order they arrived in.
    pub fn split(&self, seed: u64, train_fraction: f64) -> (Vec<RecordId>, Vec<RecordId>) {
        self.ids()
            .into_iter()
            .partition(|&id| assign_to_train(seed, id, train_fraction))
    }

    /// Compute the split and record it in the manifest.
    pub fn save_split(&self, seed: u64, train_fraction: f64) -> Result<(Vec<RecordId>, Vec<RecordId>)> {
        let mut state = self.lock();

        let mut train = Vec::new();
        let mut test = Vec::new();
        for entry in &state.manifest.entries {
            let reference = PartitionEntry {
                record_id: entry.record_id,
                storage_path: entry.storage_path.clone(),
            };
            if assign_to_train(seed, entry.record_id, train_fraction) {
                train.push(reference);
            } else {
                test.push(reference);
            }
        }

        let ids = |part: &[PartitionEntry]| part.iter().map(|e| e.record_id).collect::<Vec<_>>();
        let result = (ids(&train), ids(&test));

        let previous = state.manifest.split.replace(SavedSplit {
            seed,
            train_fraction,
            train,
            test,
        });
        if let Err(e) = self.write_manifest(&state.manifest) {
            state.manifest.split = previous;
            return Err(e);
        }

        log::info!(
            "Saved split seed={} fraction={:.2}: {} train / {} test",
            seed,
            train_fraction,
            result.0.len(),
            result.1.len()
        );
        Ok(result)
    }

    pub fn saved_split(&self) -> Option<SavedSplit> {
        self.lock().manifest.split.clone()
    }

    fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        write_atomic(&self.root.join(MANIFEST_FILE), |writer| {
            serde_json::to_writer_pretty(&mut *writer, manifest)?;
            writer.write_all(b"\n")?;
            Ok(())
        })
    }
}

fn assign_to_train(seed: u64, record_id: RecordId, train_fraction: f64) -> bool {
    let hash = splitmix64(seed ^ splitmix64(record_id));
    // top 53 bits give a uniform value in [0, 1)
    let unit = (hash >> 11) as f64 / (1u64 << 53) as f64;
    unit < train_fraction
}

pub(crate) fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}
