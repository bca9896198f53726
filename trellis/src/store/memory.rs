use crate::error::{Result, TrellisError};
use crate::provenance::ProvenanceRecord;
use crate::space::Coordinates;
use crate::store::{DataQuality, DataStore, EntryKind, RowLocator, StoreEntry, StorePayload};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

type RowKey = (String, Coordinates);

#[derive(Default)]
struct RowData {
    /// Row-relative path -> bytes. Paths containing `/` surface as
    /// directory entries in listings.
    files: BTreeMap<String, Vec<u8>>,
    fields: BTreeMap<String, serde_json::Value>,
    /// Stem (or field name) -> recorded quality.
    quality: BTreeMap<String, DataQuality>,
    provenance: BTreeMap<String, ProvenanceRecord>,
}

#[derive(Default)]
struct DatasetData {
    dimensions: BTreeMap<String, Vec<String>>,
    rows: BTreeMap<RowKey, RowData>,
    definitions: BTreeMap<String, String>,
}

/// In-memory store for tests and fixtures. Fully implements the store
/// contract, including fields, quality ratings, provenance side records
/// and definition persistence.
#[derive(Default)]
pub struct MemoryStore {
    datasets: RwLock<HashMap<String, DatasetData>>,
}

fn row_key(row: &RowLocator) -> RowKey {
    (row.frequency.clone(), row.coordinates.clone())
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn create_dataset(&self, dataset_id: &str) {
        let mut datasets = self.write_lock();
        datasets.entry(dataset_id.to_string()).or_default();
    }

    /// Seed a file into a row, registering the row's coordinate values
    /// as discovered.
    pub fn seed_file(&self, dataset_id: &str, row: &RowLocator, name: &str, bytes: &[u8]) {
        let mut datasets = self.write_lock();
        let dataset = datasets.entry(dataset_id.to_string()).or_default();
        register_coordinates(dataset, row);
        dataset
            .rows
            .entry(row_key(row))
            .or_default()
            .files
            .insert(name.to_string(), bytes.to_vec());
    }

    pub fn seed_field(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        name: &str,
        value: serde_json::Value,
    ) {
        let mut datasets = self.write_lock();
        let dataset = datasets.entry(dataset_id.to_string()).or_default();
        register_coordinates(dataset, row);
        dataset
            .rows
            .entry(row_key(row))
            .or_default()
            .fields
            .insert(name.to_string(), value);
    }

    pub fn seed_coordinates(&self, dataset_id: &str, dimension: &str, values: &[&str]) {
        let mut datasets = self.write_lock();
        let dataset = datasets.entry(dataset_id.to_string()).or_default();
        let dim = dataset
            .dimensions
            .entry(dimension.to_string())
            .or_default();
        for value in values {
            if !dim.iter().any(|v| v == value) {
                dim.push(value.to_string());
            }
        }
    }

    pub fn set_quality(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        stem: &str,
        quality: DataQuality,
    ) {
        let mut datasets = self.write_lock();
        let dataset = datasets.entry(dataset_id.to_string()).or_default();
        dataset
            .rows
            .entry(row_key(row))
            .or_default()
            .quality
            .insert(stem.to_string(), quality);
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, DatasetData>> {
        self.datasets
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, DatasetData>> {
        self.datasets
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn register_coordinates(dataset: &mut DatasetData, row: &RowLocator) {
    for (dim, value) in row.coordinates.iter() {
        let values = dataset.dimensions.entry(dim.to_string()).or_default();
        if !values.iter().any(|v| v == value) {
            values.push(value.to_string());
        }
    }
}

impl DataStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn list_coordinates(&self, dataset_id: &str, dimension: &str) -> Result<Vec<String>> {
        let datasets = self.read_lock();
        let dataset = datasets
            .get(dataset_id)
            .ok_or_else(|| TrellisError::StoreNotFound(format!("dataset {dataset_id}")))?;
        Ok(dataset.dimensions.get(dimension).cloned().unwrap_or_default())
    }

    fn list_entries(&self, dataset_id: &str, row: &RowLocator) -> Result<Vec<StoreEntry>> {
        let datasets = self.read_lock();
        let dataset = datasets
            .get(dataset_id)
            .ok_or_else(|| TrellisError::StoreNotFound(format!("dataset {dataset_id}")))?;
        let Some(data) = dataset.rows.get(&row_key(row)) else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        let mut directories: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, bytes) in &data.files {
            match name.split_once('/') {
                None => entries.push(StoreEntry {
                    name: name.clone(),
                    kind: EntryKind::File,
                    size: Some(bytes.len() as u64),
                    quality: data.quality.get(crate::format::stem(name)).copied(),
                }),
                Some((dir, rest)) => directories
                    .entry(dir.to_string())
                    .or_default()
                    .push(rest.to_string()),
            }
        }
        for (dir, contents) in directories {
            let quality = data.quality.get(dir.as_str()).copied();
            entries.push(StoreEntry {
                name: dir,
                kind: EntryKind::Directory { contents },
                size: None,
                quality,
            });
        }
        for (name, value) in &data.fields {
            entries.push(StoreEntry {
                name: name.clone(),
                kind: EntryKind::Field {
                    value: value.clone(),
                },
                size: None,
                quality: data.quality.get(name.as_str()).copied(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn read(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        entry: &StoreEntry,
    ) -> Result<StorePayload> {
        let datasets = self.read_lock();
        let data = datasets
            .get(dataset_id)
            .and_then(|d| d.rows.get(&row_key(row)))
            .ok_or_else(|| {
                TrellisError::StoreNotFound(format!(
                    "row [{}] of dataset {dataset_id}",
                    row.coordinates
                ))
            })?;
        match &entry.kind {
            EntryKind::File => data
                .files
                .get(&entry.name)
                .map(|bytes| StorePayload::Bytes(bytes.clone()))
                .ok_or_else(|| TrellisError::StoreNotFound(entry.name.clone())),
            EntryKind::Field { .. } => data
                .fields
                .get(&entry.name)
                .map(|value| StorePayload::Value(value.clone()))
                .ok_or_else(|| TrellisError::StoreNotFound(entry.name.clone())),
            EntryKind::Directory { .. } => Err(TrellisError::Usage(format!(
                "cannot read directory entry {} directly; read its contents",
                entry.name
            ))),
        }
    }

    fn write(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        name: &str,
        payload: &StorePayload,
    ) -> Result<()> {
        let mut datasets = self.write_lock();
        let dataset = datasets.entry(dataset_id.to_string()).or_default();
        register_coordinates(dataset, row);
        let data = dataset.rows.entry(row_key(row)).or_default();
        match payload {
            StorePayload::Bytes(bytes) => {
                data.files.insert(name.to_string(), bytes.clone());
            }
            StorePayload::Value(value) => {
                data.fields.insert(name.to_string(), value.clone());
            }
        }
        Ok(())
    }

    fn delete(&self, dataset_id: &str, row: &RowLocator, name: &str) -> Result<()> {
        let mut datasets = self.write_lock();
        let data = datasets
            .get_mut(dataset_id)
            .and_then(|d| d.rows.get_mut(&row_key(row)))
            .ok_or_else(|| TrellisError::StoreNotFound(name.to_string()))?;
        let prefix = format!("{name}/");
        let before = data.files.len() + data.fields.len();
        data.files.retain(|n, _| n != name && !n.starts_with(&prefix));
        data.fields.remove(name);
        data.provenance.remove(crate::format::stem(name));
        if data.files.len() + data.fields.len() == before {
            return Err(TrellisError::StoreNotFound(name.to_string()));
        }
        Ok(())
    }

    fn read_provenance(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        stem: &str,
    ) -> Result<Option<ProvenanceRecord>> {
        let datasets = self.read_lock();
        Ok(datasets
            .get(dataset_id)
            .and_then(|d| d.rows.get(&row_key(row)))
            .and_then(|data| data.provenance.get(stem).cloned()))
    }

    fn write_provenance(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        stem: &str,
        record: &ProvenanceRecord,
    ) -> Result<()> {
        let mut datasets = self.write_lock();
        let dataset = datasets.entry(dataset_id.to_string()).or_default();
        dataset
            .rows
            .entry(row_key(row))
            .or_default()
            .provenance
            .insert(stem.to_string(), record.clone());
        Ok(())
    }

    fn save_definition(&self, dataset_id: &str, name: &str, definition: &str) -> Result<()> {
        let mut datasets = self.write_lock();
        let dataset = datasets.entry(dataset_id.to_string()).or_default();
        dataset
            .definitions
            .insert(name.to_string(), definition.to_string());
        Ok(())
    }

    fn load_definition(&self, dataset_id: &str, name: &str) -> Result<Option<String>> {
        let datasets = self.read_lock();
        let dataset = datasets
            .get(dataset_id)
            .ok_or_else(|| TrellisError::StoreNotFound(format!("dataset {dataset_id}")))?;
        Ok(dataset.definitions.get(name).cloned())
    }
}
