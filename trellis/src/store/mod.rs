use crate::error::Result;
use crate::provenance::ProvenanceRecord;
use crate::space::Coordinates;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod file_tree;
pub mod memory;

pub use file_tree::FileTreeStore;
pub use memory::MemoryStore;

/// Data quality as reported by the backing store. Ascending: anything
/// `>=` a column's threshold passes its gate. Quality never blocks
/// resolution, only default inclusion in pipeline runs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum DataQuality {
    Unusable,
    Artefactual,
    Questionable,
    Noisy,
    #[default]
    Usable,
}

/// One candidate entry in a row listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreEntry {
    /// Row-relative path (file or directory) or field name.
    pub name: String,
    pub kind: EntryKind,
    #[serde(default)]
    pub size: Option<u64>,
    /// Quality as recorded by the backend; `None` means unrated
    /// (treated as `Usable`).
    #[serde(default)]
    pub quality: Option<DataQuality>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory {
        /// Relative paths of all files beneath the directory, so format
        /// matching needs no further round-trips.
        contents: Vec<String>,
    },
    Field {
        value: serde_json::Value,
    },
}

impl StoreEntry {
    pub fn file(name: &str, size: u64) -> StoreEntry {
        StoreEntry {
            name: name.to_string(),
            kind: EntryKind::File,
            size: Some(size),
            quality: None,
        }
    }

    pub fn effective_quality(&self) -> DataQuality {
        self.quality.unwrap_or_default()
    }
}

/// Payload moved through `read`/`write`: raw bytes for file entries,
/// structured values for fields.
#[derive(Debug, Clone, PartialEq)]
pub enum StorePayload {
    Bytes(Vec<u8>),
    Value(serde_json::Value),
}

/// Everything a store needs to locate one row: the row's frequency (by
/// canonical name), the basis dimensions of that frequency in
/// declaration order, the explicit coordinates, and whether the row sits
/// at the space's span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowLocator {
    pub frequency: String,
    pub dimensions: Vec<String>,
    pub coordinates: Coordinates,
    pub leaf: bool,
}

impl RowLocator {
    pub fn dataset_row() -> RowLocator {
        RowLocator {
            frequency: "dataset".to_string(),
            dimensions: Vec::new(),
            coordinates: Coordinates::new(),
            leaf: false,
        }
    }
}

/// The narrow contract every backend implements. The resolution engine
/// consumes backends only through this trait; layout rules stay behind
/// it. Any call may fail with `StoreUnavailable` (transient, worth
/// retrying) or `StoreNotFound` (permanent).
pub trait DataStore: Send + Sync {
    /// Short name for log lines and error messages.
    fn name(&self) -> &str;

    /// All discovered values of one dimension. A dimension the store has
    /// no layout for yields an empty list (the dimension collapses to a
    /// single implicit coordinate).
    fn list_coordinates(&self, dataset_id: &str, dimension: &str) -> Result<Vec<String>>;

    /// All candidate entries of one row, quality included, in one
    /// round-trip.
    fn list_entries(&self, dataset_id: &str, row: &RowLocator) -> Result<Vec<StoreEntry>>;

    fn read(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        entry: &StoreEntry,
    ) -> Result<StorePayload>;

    fn write(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        name: &str,
        payload: &StorePayload,
    ) -> Result<()>;

    fn delete(&self, dataset_id: &str, row: &RowLocator, name: &str) -> Result<()>;

    fn read_provenance(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        stem: &str,
    ) -> Result<Option<ProvenanceRecord>>;

    fn write_provenance(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        stem: &str,
        record: &ProvenanceRecord,
    ) -> Result<()>;

    /// Persist a serialized dataset definition under a name.
    fn save_definition(&self, dataset_id: &str, name: &str, definition: &str) -> Result<()>;

    fn load_definition(&self, dataset_id: &str, name: &str) -> Result<Option<String>>;
}

// ── Retry ──────────────────────────────────────────────────────

/// Bounded exponential backoff applied to transient store failures.
/// Permanent failures (`StoreNotFound` and everything else) surface
/// immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut delay = self.base_delay;
        let mut attempt = 1;
        loop {
            match op() {
                Err(e) if e.is_transient() && attempt < self.max_attempts.max(1) => {
                    log::warn!(
                        "{what} failed (attempt {attempt}/{}), retrying in {delay:?}: {e}",
                        self.max_attempts
                    );
                    std::thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Decorates any store with a retry policy. Retrying lives at the
/// adapter layer; the resolution engine never retries.
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: DataStore> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> RetryingStore<S> {
        RetryingStore { inner, policy }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: DataStore> DataStore for RetryingStore<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn list_coordinates(&self, dataset_id: &str, dimension: &str) -> Result<Vec<String>> {
        self.policy.run("list_coordinates", || {
            self.inner.list_coordinates(dataset_id, dimension)
        })
    }

    fn list_entries(&self, dataset_id: &str, row: &RowLocator) -> Result<Vec<StoreEntry>> {
        self.policy
            .run("list_entries", || self.inner.list_entries(dataset_id, row))
    }

    fn read(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        entry: &StoreEntry,
    ) -> Result<StorePayload> {
        self.policy
            .run("read", || self.inner.read(dataset_id, row, entry))
    }

    fn write(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        name: &str,
        payload: &StorePayload,
    ) -> Result<()> {
        self.policy
            .run("write", || self.inner.write(dataset_id, row, name, payload))
    }

    fn delete(&self, dataset_id: &str, row: &RowLocator, name: &str) -> Result<()> {
        self.policy
            .run("delete", || self.inner.delete(dataset_id, row, name))
    }

    fn read_provenance(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        stem: &str,
    ) -> Result<Option<ProvenanceRecord>> {
        self.policy.run("read_provenance", || {
            self.inner.read_provenance(dataset_id, row, stem)
        })
    }

    fn write_provenance(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        stem: &str,
        record: &ProvenanceRecord,
    ) -> Result<()> {
        self.policy.run("write_provenance", || {
            self.inner.write_provenance(dataset_id, row, stem, record)
        })
    }

    fn save_definition(&self, dataset_id: &str, name: &str, definition: &str) -> Result<()> {
        self.policy.run("save_definition", || {
            self.inner.save_definition(dataset_id, name, definition)
        })
    }

    fn load_definition(&self, dataset_id: &str, name: &str) -> Result<Option<String>> {
        self.policy.run("load_definition", || {
            self.inner.load_definition(dataset_id, name)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrellisError;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails a scripted number of times before succeeding.
    struct FlakyStore {
        failures: AtomicU32,
        error: fn() -> TrellisError,
        calls: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32, error: fn() -> TrellisError) -> FlakyStore {
            FlakyStore {
                failures: AtomicU32::new(failures),
                error,
                calls: AtomicU32::new(0),
            }
        }

        fn attempt(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                Err((self.error)())
            } else {
                Ok(())
            }
        }
    }

    impl DataStore for FlakyStore {
        fn name(&self) -> &str {
            "flaky"
        }
        fn list_coordinates(&self, _: &str, _: &str) -> Result<Vec<String>> {
            self.attempt()?;
            Ok(vec!["01".into()])
        }
        fn list_entries(&self, _: &str, _: &RowLocator) -> Result<Vec<StoreEntry>> {
            self.attempt()?;
            Ok(Vec::new())
        }
        fn read(&self, _: &str, _: &RowLocator, _: &StoreEntry) -> Result<StorePayload> {
            self.attempt()?;
            Ok(StorePayload::Bytes(Vec::new()))
        }
        fn write(&self, _: &str, _: &RowLocator, _: &str, _: &StorePayload) -> Result<()> {
            self.attempt()
        }
        fn delete(&self, _: &str, _: &RowLocator, _: &str) -> Result<()> {
            self.attempt()
        }
        fn read_provenance(
            &self,
            _: &str,
            _: &RowLocator,
            _: &str,
        ) -> Result<Option<ProvenanceRecord>> {
            Ok(None)
        }
        fn write_provenance(
            &self,
            _: &str,
            _: &RowLocator,
            _: &str,
            _: &ProvenanceRecord,
        ) -> Result<()> {
            Ok(())
        }
        fn save_definition(&self, _: &str, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn load_definition(&self, _: &str, _: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: attempts,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_retry_recovers_from_transient_failures() {
        let store = RetryingStore::new(
            FlakyStore::new(2, || TrellisError::StoreUnavailable("blip".into())),
            fast_policy(3),
        );
        let values = store.list_coordinates("ds", "member").unwrap();
        assert_eq!(values, vec!["01".to_string()]);
        assert_eq!(store.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_gives_up_after_max_attempts() {
        let store = RetryingStore::new(
            FlakyStore::new(10, || TrellisError::StoreUnavailable("down".into())),
            fast_policy(3),
        );
        let err = store.list_coordinates("ds", "member").unwrap_err();
        assert!(matches!(err, TrellisError::StoreUnavailable(_)));
        assert_eq!(store.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_permanent_failures_not_retried() {
        let store = RetryingStore::new(
            FlakyStore::new(10, || TrellisError::StoreNotFound("gone".into())),
            fast_policy(5),
        );
        let err = store.list_coordinates("ds", "member").unwrap_err();
        assert!(matches!(err, TrellisError::StoreNotFound(_)));
        assert_eq!(store.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_none_policy_is_single_shot() {
        let store = RetryingStore::new(
            FlakyStore::new(1, || TrellisError::StoreUnavailable("blip".into())),
            RetryPolicy::none(),
        );
        assert!(store.list_coordinates("ds", "member").is_err());
        assert_eq!(store.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_quality_ordering() {
        assert!(DataQuality::Usable > DataQuality::Noisy);
        assert!(DataQuality::Noisy > DataQuality::Questionable);
        assert!(DataQuality::Questionable > DataQuality::Artefactual);
        assert!(DataQuality::Artefactual > DataQuality::Unusable);
        assert_eq!(DataQuality::default(), DataQuality::Usable);
    }
}
