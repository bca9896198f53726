use crate::error::{Result, TrellisError};
use crate::format::{self, DataFormat, FieldKind};
use crate::provenance::{self, ProvenanceRecord};
use crate::store::{DataQuality, DataStore, EntryKind, RowLocator, StoreEntry, StorePayload};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Loaded content of an item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemContent {
    /// One blob per artifact, keyed by row-relative name.
    Files(BTreeMap<String, Vec<u8>>),
    /// A scalar or array field value.
    Value(serde_json::Value),
}

impl ItemContent {
    pub fn single_file(name: &str, bytes: &[u8]) -> ItemContent {
        let mut files = BTreeMap::new();
        files.insert(name.to_string(), bytes.to_vec());
        ItemContent::Files(files)
    }

    pub fn value(value: serde_json::Value) -> ItemContent {
        ItemContent::Value(value)
    }

    /// The bytes of the only file, when there is exactly one.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            ItemContent::Files(files) if files.len() == 1 => {
                files.values().next().map(Vec::as_slice)
            }
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&serde_json::Value> {
        match self {
            ItemContent::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn checksum(&self) -> String {
        match self {
            ItemContent::Files(files) => provenance::checksum_files(files),
            ItemContent::Value(value) => provenance::checksum_value(value),
        }
    }
}

#[derive(Debug, Clone)]
enum ItemLocation {
    Absent,
    FileGroup {
        primary: StoreEntry,
        side_cars: Vec<StoreEntry>,
    },
    Field {
        entry: StoreEntry,
    },
}

struct ItemState {
    location: ItemLocation,
    content: Option<Arc<ItemContent>>,
}

/// One logical item in one row: either a file group (primary artifact
/// plus side-cars), a scalar field, or nothing (absent). Content loads
/// lazily through the store and is cached; `put` and `get` on the same
/// item are serialized by its state lock, so a read after a write always
/// observes the written content.
pub struct DataItem {
    store: Arc<dyn DataStore>,
    dataset_id: String,
    row: RowLocator,
    column: String,
    format: DataFormat,
    quality: DataQuality,
    excluded_by_quality: bool,
    sink_stem: Option<String>,
    state: Mutex<ItemState>,
}

fn lock_state(state: &Mutex<ItemState>) -> MutexGuard<'_, ItemState> {
    state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl DataItem {
    pub(crate) fn resolved_file_group(
        store: Arc<dyn DataStore>,
        dataset_id: &str,
        row: RowLocator,
        column: &str,
        format: DataFormat,
        primary: StoreEntry,
        side_cars: Vec<StoreEntry>,
        excluded_by_quality: bool,
    ) -> DataItem {
        let quality = primary.effective_quality();
        DataItem {
            store,
            dataset_id: dataset_id.to_string(),
            row,
            column: column.to_string(),
            format,
            quality,
            excluded_by_quality,
            sink_stem: None,
            state: Mutex::new(ItemState {
                location: ItemLocation::FileGroup { primary, side_cars },
                content: None,
            }),
        }
    }

    pub(crate) fn resolved_field(
        store: Arc<dyn DataStore>,
        dataset_id: &str,
        row: RowLocator,
        column: &str,
        format: DataFormat,
        entry: StoreEntry,
        excluded_by_quality: bool,
    ) -> DataItem {
        let quality = entry.effective_quality();
        DataItem {
            store,
            dataset_id: dataset_id.to_string(),
            row,
            column: column.to_string(),
            format,
            quality,
            excluded_by_quality,
            sink_stem: None,
            state: Mutex::new(ItemState {
                location: ItemLocation::Field { entry },
                content: None,
            }),
        }
    }

    pub(crate) fn absent(
        store: Arc<dyn DataStore>,
        dataset_id: &str,
        row: RowLocator,
        column: &str,
        format: DataFormat,
    ) -> DataItem {
        DataItem {
            store,
            dataset_id: dataset_id.to_string(),
            row,
            column: column.to_string(),
            format,
            quality: DataQuality::default(),
            excluded_by_quality: false,
            sink_stem: None,
            state: Mutex::new(ItemState {
                location: ItemLocation::Absent,
                content: None,
            }),
        }
    }

    pub(crate) fn with_sink_stem(mut self, stem: &str) -> DataItem {
        self.sink_stem = Some(stem.to_string());
        self
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn format(&self) -> &DataFormat {
        &self.format
    }

    pub fn quality(&self) -> DataQuality {
        self.quality
    }

    /// True when the item resolved below its column's quality threshold.
    /// Resolution still succeeds; pipelines consult this flag.
    pub fn excluded_by_quality(&self) -> bool {
        self.excluded_by_quality
    }

    pub fn is_absent(&self) -> bool {
        matches!(lock_state(&self.state).location, ItemLocation::Absent)
    }

    /// All physical entries behind this item (primary first).
    pub fn entries(&self) -> Vec<StoreEntry> {
        match &lock_state(&self.state).location {
            ItemLocation::Absent => Vec::new(),
            ItemLocation::FileGroup { primary, side_cars } => {
                let mut all = vec![primary.clone()];
                all.extend(side_cars.iter().cloned());
                all
            }
            ItemLocation::Field { entry } => vec![entry.clone()],
        }
    }

    /// The stem provenance records are filed under.
    pub fn provenance_stem(&self) -> Option<String> {
        match &lock_state(&self.state).location {
            ItemLocation::FileGroup { primary, .. } => {
                Some(format::stem(&primary.name).to_string())
            }
            ItemLocation::Field { entry } => Some(entry.name.clone()),
            ItemLocation::Absent => self.sink_stem.clone(),
        }
    }

    /// Load (and cache) the item's content. Absent items fail with the
    /// resolution error their column would have raised.
    pub fn get(&self) -> Result<Arc<ItemContent>> {
        let mut state = lock_state(&self.state);
        if let Some(content) = &state.content {
            return Ok(Arc::clone(content));
        }
        let content = match &state.location {
            ItemLocation::Absent => {
                return Err(TrellisError::FileNotFound {
                    column: self.column.clone(),
                    coordinates: self.row.coordinates.to_string(),
                })
            }
            ItemLocation::FileGroup { primary, side_cars } => {
                let mut files = BTreeMap::new();
                self.load_entry(primary, &mut files)?;
                for car in side_cars {
                    self.load_entry(car, &mut files)?;
                }
                ItemContent::Files(files)
            }
            ItemLocation::Field { entry } => {
                match self.store.read(&self.dataset_id, &self.row, entry)? {
                    StorePayload::Value(value) => ItemContent::Value(value),
                    StorePayload::Bytes(_) => {
                        return Err(TrellisError::Usage(format!(
                            "field entry {} returned raw bytes",
                            entry.name
                        )))
                    }
                }
            }
        };
        let content = Arc::new(content);
        state.content = Some(Arc::clone(&content));
        Ok(content)
    }

    fn load_entry(&self, entry: &StoreEntry, files: &mut BTreeMap<String, Vec<u8>>) -> Result<()> {
        match &entry.kind {
            EntryKind::File => {
                match self.store.read(&self.dataset_id, &self.row, entry)? {
                    StorePayload::Bytes(bytes) => {
                        files.insert(entry.name.clone(), bytes);
                    }
                    StorePayload::Value(_) => {
                        return Err(TrellisError::Usage(format!(
                            "file entry {} returned a field value",
                            entry.name
                        )))
                    }
                }
            }
            EntryKind::Directory { contents } => {
                for rel in contents {
                    let nested = StoreEntry::file(&format!("{}/{rel}", entry.name), 0);
                    match self.store.read(&self.dataset_id, &self.row, &nested)? {
                        StorePayload::Bytes(bytes) => {
                            files.insert(nested.name.clone(), bytes);
                        }
                        StorePayload::Value(_) => {
                            return Err(TrellisError::Usage(format!(
                                "file entry {} returned a field value",
                                nested.name
                            )))
                        }
                    }
                }
            }
            EntryKind::Field { .. } => {
                return Err(TrellisError::Usage(format!(
                    "field entry {} inside a file group",
                    entry.name
                )))
            }
        }
        Ok(())
    }

    /// Persist content through the store. Only sink-bound items accept
    /// writes; the item then reflects the written content.
    pub fn put(&self, content: ItemContent) -> Result<()> {
        let stem = self.sink_stem.as_deref().ok_or_else(|| {
            TrellisError::Usage(format!(
                "column {} is not sink-bound in row [{}]",
                self.column, self.row.coordinates
            ))
        })?;
        let writes = plan_writes(&self.format, stem, &content)?;

        let mut state = lock_state(&self.state);
        let mut written = Vec::new();
        let mut normalized = BTreeMap::new();
        for (name, payload) in &writes {
            self.store.write(&self.dataset_id, &self.row, name, payload)?;
            match payload {
                StorePayload::Bytes(bytes) => {
                    normalized.insert(name.clone(), bytes.clone());
                    written.push((name.clone(), Some(bytes.len() as u64)));
                }
                StorePayload::Value(_) => written.push((name.clone(), None)),
            }
        }
        state.location = location_after_put(&self.format, stem, &content, &written);
        // Cache under the written names so a later fresh resolution loads
        // (and checksums) the exact same content.
        state.content = Some(Arc::new(match &self.format {
            DataFormat::Field(_) => content,
            _ => ItemContent::Files(normalized),
        }));
        Ok(())
    }

    pub fn checksum(&self) -> Result<String> {
        Ok(self.get()?.checksum())
    }

    pub fn read_provenance(&self) -> Result<Option<ProvenanceRecord>> {
        match self.provenance_stem() {
            Some(stem) => self
                .store
                .read_provenance(&self.dataset_id, &self.row, &stem),
            None => Ok(None),
        }
    }

    pub fn record_provenance(&self, record: &ProvenanceRecord) -> Result<()> {
        let stem = self.provenance_stem().ok_or_else(|| {
            TrellisError::Usage(format!(
                "no location to file provenance under for column {}",
                self.column
            ))
        })?;
        self.store
            .write_provenance(&self.dataset_id, &self.row, &stem, record)
    }

    /// Identity conversion or `UnsupportedConversion`; real converters
    /// are plugin territory.
    pub fn convert_to(&self, target: &DataFormat) -> Result<DataItem> {
        format::ensure_convertible(&self.format, target)?;
        let state = lock_state(&self.state);
        Ok(DataItem {
            store: Arc::clone(&self.store),
            dataset_id: self.dataset_id.clone(),
            row: self.row.clone(),
            column: self.column.clone(),
            format: target.clone(),
            quality: self.quality,
            excluded_by_quality: self.excluded_by_quality,
            sink_stem: self.sink_stem.clone(),
            state: Mutex::new(ItemState {
                location: state.location.clone(),
                content: state.content.clone(),
            }),
        })
    }
}

impl fmt::Debug for DataItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataItem")
            .field("column", &self.column)
            .field("dataset", &self.dataset_id)
            .field("coordinates", &self.row.coordinates)
            .field("format", &self.format)
            .field("quality", &self.quality)
            .finish_non_exhaustive()
    }
}

/// Map provided content onto the physical names this format writes.
fn plan_writes(
    format_: &DataFormat,
    stem: &str,
    content: &ItemContent,
) -> Result<Vec<(String, StorePayload)>> {
    match format_ {
        DataFormat::Field(f) => {
            let ItemContent::Value(value) = content else {
                return Err(TrellisError::Usage(
                    "field columns take value content".to_string(),
                ));
            };
            if FieldKind::of(value) != Some(f.kind) {
                return Err(TrellisError::Usage(format!(
                    "value {value} is not of kind {:?}",
                    f.kind
                )));
            }
            Ok(vec![(stem.to_string(), StorePayload::Value(value.clone()))])
        }
        DataFormat::File(f) => {
            let ItemContent::Files(files) = content else {
                return Err(TrellisError::Usage(
                    "file columns take file content".to_string(),
                ));
            };
            if files.len() != 1 {
                return Err(TrellisError::Usage(format!(
                    "format {format_} takes exactly one file, got {}",
                    files.len()
                )));
            }
            let bytes = files.values().next().cloned().unwrap_or_default();
            let name = match f.extensions.first() {
                Some(ext) => format!("{stem}.{ext}"),
                None => stem.to_string(),
            };
            Ok(vec![(name, StorePayload::Bytes(bytes))])
        }
        DataFormat::WithSideCars(s) => {
            let ItemContent::Files(files) = content else {
                return Err(TrellisError::Usage(
                    "file columns take file content".to_string(),
                ));
            };
            let mut by_ext: BTreeMap<String, &Vec<u8>> = BTreeMap::new();
            for (name, bytes) in files {
                let ext = format::extension(name).ok_or_else(|| {
                    TrellisError::Usage(format!("cannot infer extension from {name}"))
                })?;
                if by_ext.insert(ext.clone(), bytes).is_some() {
                    return Err(TrellisError::Usage(format!(
                        "duplicate {ext} member in side-car group"
                    )));
                }
            }
            let mut writes = Vec::new();
            let primary = by_ext.remove(&s.primary).ok_or_else(|| {
                TrellisError::Usage(format!("missing primary {} member", s.primary))
            })?;
            writes.push((
                format!("{stem}.{}", s.primary),
                StorePayload::Bytes(primary.clone()),
            ));
            for ext in &s.required {
                let bytes = by_ext.remove(ext).ok_or_else(|| {
                    TrellisError::Usage(format!("missing required {ext} side-car"))
                })?;
                writes.push((format!("{stem}.{ext}"), StorePayload::Bytes(bytes.clone())));
            }
            for ext in &s.optional {
                if let Some(bytes) = by_ext.remove(ext) {
                    writes.push((format!("{stem}.{ext}"), StorePayload::Bytes(bytes.clone())));
                }
            }
            if let Some(stray) = by_ext.keys().next() {
                return Err(TrellisError::Usage(format!(
                    "{stray} is not part of format {format_}"
                )));
            }
            Ok(writes)
        }
        DataFormat::Directory(d) => {
            let ItemContent::Files(files) = content else {
                return Err(TrellisError::Usage(
                    "directory columns take file content".to_string(),
                ));
            };
            if files.is_empty() {
                return Err(TrellisError::Usage(
                    "directory content must hold at least one file".to_string(),
                ));
            }
            for required in &d.required_contents {
                let covered = files.keys().any(|k| {
                    k == required || k.starts_with(&format!("{required}/"))
                });
                if !covered {
                    return Err(TrellisError::Usage(format!(
                        "directory content is missing required {required}"
                    )));
                }
            }
            Ok(files
                .iter()
                .map(|(rel, bytes)| {
                    (
                        format!("{stem}/{rel}"),
                        StorePayload::Bytes(bytes.clone()),
                    )
                })
                .collect())
        }
    }
}

fn location_after_put(
    format_: &DataFormat,
    stem: &str,
    content: &ItemContent,
    written: &[(String, Option<u64>)],
) -> ItemLocation {
    match format_ {
        DataFormat::Field(_) => {
            let value = match content {
                ItemContent::Value(v) => v.clone(),
                ItemContent::Files(_) => serde_json::Value::Null,
            };
            ItemLocation::Field {
                entry: StoreEntry {
                    name: stem.to_string(),
                    kind: EntryKind::Field { value },
                    size: None,
                    quality: None,
                },
            }
        }
        DataFormat::Directory(_) => {
            let contents = written
                .iter()
                .filter_map(|(name, _)| {
                    name.strip_prefix(&format!("{stem}/")).map(str::to_string)
                })
                .collect();
            ItemLocation::FileGroup {
                primary: StoreEntry {
                    name: stem.to_string(),
                    kind: EntryKind::Directory { contents },
                    size: None,
                    quality: None,
                },
                side_cars: Vec::new(),
            }
        }
        DataFormat::File(_) | DataFormat::WithSideCars(_) => {
            let mut entries = written
                .iter()
                .map(|(name, size)| StoreEntry {
                    name: name.clone(),
                    kind: EntryKind::File,
                    size: *size,
                    quality: None,
                });
            let primary = entries.next().unwrap_or_else(|| StoreEntry::file(stem, 0));
            ItemLocation::FileGroup {
                primary,
                side_cars: entries.collect(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::Coordinates;
    use crate::store::MemoryStore;

    fn row() -> RowLocator {
        RowLocator {
            frequency: "sample".to_string(),
            dimensions: vec!["sample".into()],
            coordinates: Coordinates::from_pairs([("sample", "s1")]),
            leaf: true,
        }
    }

    fn store_with_scan() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.seed_file("ds", &row(), "scan.nii.gz", b"imaging-bytes");
        store.seed_file("ds", &row(), "scan.json", b"{\"te\": 2.0}");
        store
    }

    #[test]
    fn test_get_loads_and_caches_file_group() {
        let store = store_with_scan();
        let entries = store.list_entries("ds", &row()).unwrap();
        let primary = entries.iter().find(|e| e.name == "scan.nii.gz").unwrap();
        let side = entries.iter().find(|e| e.name == "scan.json").unwrap();

        let item = DataItem::resolved_file_group(
            store.clone(),
            "ds",
            row(),
            "t1w",
            DataFormat::with_side_cars("nii.gz", &["json"], &[]),
            primary.clone(),
            vec![side.clone()],
            false,
        );
        let content = item.get().unwrap();
        match content.as_ref() {
            ItemContent::Files(files) => {
                assert_eq!(files.len(), 2);
                assert_eq!(files["scan.nii.gz"], b"imaging-bytes".to_vec());
            }
            other => panic!("expected files, got {other:?}"),
        }
        // Second get returns the cached Arc
        let again = item.get().unwrap();
        assert!(Arc::ptr_eq(&content, &again));
    }

    #[test]
    fn test_absent_item_get_fails() {
        let store = Arc::new(MemoryStore::new());
        store.create_dataset("ds");
        let item = DataItem::absent(
            store,
            "ds",
            row(),
            "t1w",
            DataFormat::file(&["nii.gz"]),
        );
        assert!(item.is_absent());
        let err = item.get().unwrap_err();
        assert!(matches!(err, TrellisError::FileNotFound { .. }));
    }

    #[test]
    fn test_put_requires_sink_binding() {
        let store = Arc::new(MemoryStore::new());
        store.create_dataset("ds");
        let item = DataItem::absent(
            store,
            "ds",
            row(),
            "mask",
            DataFormat::file(&["nii.gz"]),
        );
        let err = item
            .put(ItemContent::single_file("mask.nii.gz", b"m"))
            .unwrap_err();
        assert!(matches!(err, TrellisError::Usage(_)));
    }

    #[test]
    fn test_put_then_get_observes_written_content() {
        let store = Arc::new(MemoryStore::new());
        store.create_dataset("ds");
        let item = DataItem::absent(
            store.clone(),
            "ds",
            row(),
            "mask",
            DataFormat::file(&["nii.gz"]),
        )
        .with_sink_stem("mask");

        item.put(ItemContent::single_file("anything.nii.gz", b"mask-bytes"))
            .unwrap();
        assert!(!item.is_absent());
        let content = item.get().unwrap();
        assert_eq!(content.bytes(), Some(b"mask-bytes".as_slice()));

        // And the store really has it, under the sink stem
        let entries = store.list_entries("ds", &row()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "mask.nii.gz");
    }

    #[test]
    fn test_side_car_put_writes_all_members() {
        let store = Arc::new(MemoryStore::new());
        store.create_dataset("ds");
        let item = DataItem::absent(
            store.clone(),
            "ds",
            row(),
            "warped",
            DataFormat::with_side_cars("nii.gz", &["json"], &[]),
        )
        .with_sink_stem("warped");

        let mut files = BTreeMap::new();
        files.insert("out.nii.gz".to_string(), b"img".to_vec());
        files.insert("out.json".to_string(), b"{}".to_vec());
        item.put(ItemContent::Files(files)).unwrap();

        let names: Vec<String> = store
            .list_entries("ds", &row())
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["warped.json", "warped.nii.gz"]);

        // Missing required side-car rejected before any write
        let mut incomplete = BTreeMap::new();
        incomplete.insert("out.nii.gz".to_string(), b"img".to_vec());
        let err = item.put(ItemContent::Files(incomplete)).unwrap_err();
        assert!(matches!(err, TrellisError::Usage(_)));
    }

    #[test]
    fn test_directory_item_loads_nested_files() {
        let store = Arc::new(MemoryStore::new());
        store.seed_file("ds", &row(), "dicom/0001.dcm", b"a");
        store.seed_file("ds", &row(), "dicom/0002.dcm", b"b");
        let entries = store.list_entries("ds", &row()).unwrap();
        let dir = entries.iter().find(|e| e.name == "dicom").unwrap();

        let item = DataItem::resolved_file_group(
            store.clone(),
            "ds",
            row(),
            "dicom",
            DataFormat::directory(&[]),
            dir.clone(),
            Vec::new(),
            false,
        );
        let content = item.get().unwrap();
        match content.as_ref() {
            ItemContent::Files(files) => {
                assert_eq!(files.len(), 2);
                assert!(files.contains_key("dicom/0001.dcm"));
            }
            other => panic!("expected files, got {other:?}"),
        }
    }

    #[test]
    fn test_field_put_checks_kind() {
        let store = Arc::new(MemoryStore::new());
        store.create_dataset("ds");
        let item = DataItem::absent(
            store.clone(),
            "ds",
            row(),
            "volume",
            DataFormat::field(FieldKind::Number),
        )
        .with_sink_stem("volume");

        let err = item
            .put(ItemContent::value(serde_json::json!("not a number")))
            .unwrap_err();
        assert!(matches!(err, TrellisError::Usage(_)));

        item.put(ItemContent::value(serde_json::json!(1234.5)))
            .unwrap();
        let content = item.get().unwrap();
        assert_eq!(content.as_value(), Some(&serde_json::json!(1234.5)));
    }

    #[test]
    fn test_provenance_round_trip_through_item() {
        let store = Arc::new(MemoryStore::new());
        store.create_dataset("ds");
        let item = DataItem::absent(
            store.clone(),
            "ds",
            row(),
            "mask",
            DataFormat::file(&["nii.gz"]),
        )
        .with_sink_stem("mask");
        item.put(ItemContent::single_file("m.nii.gz", b"m")).unwrap();

        let mut record = ProvenanceRecord::new("segment");
        record.inputs.insert("t1w".into(), "abc".into());
        item.record_provenance(&record).unwrap();
        let loaded = item.read_provenance().unwrap().unwrap();
        assert!(loaded.matches(&record));
    }

    #[test]
    fn test_convert_identity_only() {
        let store = store_with_scan();
        let entries = store.list_entries("ds", &row()).unwrap();
        let primary = entries.iter().find(|e| e.name == "scan.nii.gz").unwrap();
        let fmt = DataFormat::file(&["nii.gz"]);
        let item = DataItem::resolved_file_group(
            store.clone(),
            "ds",
            row(),
            "t1w",
            fmt.clone(),
            primary.clone(),
            Vec::new(),
            false,
        );

        let same = item.convert_to(&fmt).unwrap();
        assert_eq!(same.format(), &fmt);
        let err = item.convert_to(&DataFormat::file(&["mgz"])).unwrap_err();
        assert!(matches!(err, TrellisError::UnsupportedConversion { .. }));
    }

    #[test]
    fn test_checksum_follows_content() {
        let store = Arc::new(MemoryStore::new());
        store.create_dataset("ds");
        let item = DataItem::absent(
            store.clone(),
            "ds",
            row(),
            "mask",
            DataFormat::file(&["nii.gz"]),
        )
        .with_sink_stem("mask");

        item.put(ItemContent::single_file("m.nii.gz", b"one")).unwrap();
        let first = item.checksum().unwrap();
        item.put(ItemContent::single_file("m.nii.gz", b"two")).unwrap();
        let second = item.checksum().unwrap();
        assert_ne!(first, second);
    }
}
