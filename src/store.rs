use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::{SpeechError, SpeechResult};
use crate::model::{Language, RecordId, SourceText, SpeechRecord};

/// Persistence surface the backfill job needs: "records missing audio for L"
/// and "write audio L for record id". Implementations decide the schema.
pub trait AudioStore: Send + Sync {
    /// Records whose `language` source text is non-empty and whose audio is
    /// absent, ordered by record id.
    fn records_missing(&self, language: Language) -> SpeechResult<Vec<SourceText>>;

    /// Write `artifact` as the `language` audio of `record_id` unless that
    /// field is already populated. Returns `false` when an existing artifact
    /// was kept; a populated field is never overwritten.
    fn store_artifact(
        &self,
        record_id: RecordId,
        language: Language,
        artifact: &[u8],
    ) -> SpeechResult<bool>;
}

/// Fill the field in place when absent; report whether it was written.
fn fill_absent(record: &mut SpeechRecord, language: Language, artifact: &[u8]) -> bool {
    if record.audio.contains_key(&language) {
        return false;
    }
    record.audio.insert(language, artifact.to_vec());
    true
}

fn missing_in<'a>(
    records: impl Iterator<Item = &'a SpeechRecord>,
    language: Language,
) -> Vec<SourceText> {
    records
        .filter_map(|record| {
            record.missing_source(language).map(|text| SourceText {
                record_id: record.id,
                text: text.to_owned(),
            })
        })
        .collect()
}

fn record_not_found(record_id: RecordId) -> SpeechError {
    SpeechError::Storage(format!("record {record_id} not found"))
}

/// Records held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<RecordId, SpeechRecord>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = SpeechRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.insert(record);
        }
        store
    }

    pub fn insert(&self, record: SpeechRecord) {
        self.lock().insert(record.id, record);
    }

    #[must_use]
    pub fn get(&self, record_id: RecordId) -> Option<SpeechRecord> {
        self.lock().get(&record_id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<RecordId, SpeechRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AudioStore for MemoryStore {
    fn records_missing(&self, language: Language) -> SpeechResult<Vec<SourceText>> {
        Ok(missing_in(self.lock().values(), language))
    }

    fn store_artifact(
        &self,
        record_id: RecordId,
        language: Language,
        artifact: &[u8],
    ) -> SpeechResult<bool> {
        let mut records = self.lock();
        let record = records
            .get_mut(&record_id)
            .ok_or_else(|| record_not_found(record_id))?;
        Ok(fill_absent(record, language, artifact))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    records: Vec<SpeechRecord>,
}

/// Records kept in a JSON document on disk, audio base64-encoded.
///
/// Every operation re-reads the file; writes go to a sibling temp file that
/// is renamed over the original.
pub struct JsonFileStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl std::fmt::Debug for JsonFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonFileStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl JsonFileStore {
    /// Open `path`, creating an empty document (and parent directories) when
    /// it does not exist yet.
    pub fn open(path: &Path) -> SpeechResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let store = Self {
            path: path.to_path_buf(),
            guard: Mutex::new(()),
        };
        if !path.exists() {
            store.save(&StoreDocument::default())?;
        }
        // Fail early on a corrupt document.
        store.load()?;
        Ok(store)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or replace a record.
    pub fn upsert(&self, record: SpeechRecord) -> SpeechResult<()> {
        let _guard = self.lock();
        let mut document = self.load()?;
        match document.records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => document.records.push(record),
        }
        self.save(&document)
    }

    pub fn get(&self, record_id: RecordId) -> SpeechResult<Option<SpeechRecord>> {
        let _guard = self.lock();
        Ok(self
            .load()?
            .records
            .into_iter()
            .find(|record| record.id == record_id))
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.guard.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self) -> SpeechResult<StoreDocument> {
        let raw = fs::read(&self.path)?;
        serde_json::from_slice(&raw).map_err(|error| {
            SpeechError::Storage(format!("{} is not a store document: {error}", self.path.display()))
        })
    }

    fn save(&self, document: &StoreDocument) -> SpeechResult<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, serde_json::to_vec_pretty(document)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl AudioStore for JsonFileStore {
    fn records_missing(&self, language: Language) -> SpeechResult<Vec<SourceText>> {
        let _guard = self.lock();
        let mut document = self.load()?;
        document.records.sort_by_key(|record| record.id);
        Ok(missing_in(document.records.iter(), language))
    }

    fn store_artifact(
        &self,
        record_id: RecordId,
        language: Language,
        artifact: &[u8],
    ) -> SpeechResult<bool> {
        let _guard = self.lock();
        let mut document = self.load()?;
        let record = document
            .records
            .iter_mut()
            .find(|record| record.id == record_id)
            .ok_or_else(|| record_not_found(record_id))?;
        if !fill_absent(record, language, artifact) {
            return Ok(false);
        }
        self.save(&document)?;
        Ok(true)
    }
}
