use crate::column::{SinkColumn, SourceColumn};
use crate::error::{Result, TrellisError};
use crate::item::DataItem;
use crate::space::{Coordinates, DataSpace, Frequency};
use crate::store::{DataStore, EntryKind, RowLocator, StoreEntry};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

mod definition;

pub use definition::{DatasetDefinition, SinkSpec, SourceSpec};

type RowKey = (Frequency, Coordinates);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ── Keyed single-flight cache ──────────────────────────────────

enum Slot<V> {
    InFlight,
    Ready(V),
}

/// Cache where at most one thread computes any key at a time. Later
/// requests for an in-flight key block on a condvar instead of repeating
/// the computation; a failed computation clears the marker so the next
/// caller starts fresh.
struct KeyedOnce<K, V> {
    map: Mutex<HashMap<K, Slot<V>>>,
    ready: Condvar,
}

impl<K: Eq + Hash + Clone, V: Clone> KeyedOnce<K, V> {
    fn new() -> KeyedOnce<K, V> {
        KeyedOnce {
            map: Mutex::new(HashMap::new()),
            ready: Condvar::new(),
        }
    }

    fn get_or_compute<F>(&self, key: K, compute: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        {
            let mut map = lock(&self.map);
            loop {
                match map.get(&key) {
                    Some(Slot::Ready(value)) => return Ok(value.clone()),
                    Some(Slot::InFlight) => {
                        map = self
                            .ready
                            .wait(map)
                            .unwrap_or_else(std::sync::PoisonError::into_inner);
                    }
                    None => {
                        map.insert(key.clone(), Slot::InFlight);
                        break;
                    }
                }
            }
        }

        // Marker is cleared on every exit path, including unwinding.
        let mut flight = Flight {
            cache: self,
            key: &key,
            armed: true,
        };
        let result = compute();
        {
            let mut map = lock(&self.map);
            map.remove(&key);
            if let Ok(value) = &result {
                map.insert(key.clone(), Slot::Ready(value.clone()));
            }
        }
        flight.armed = false;
        self.ready.notify_all();
        result
    }
}

struct Flight<'a, K: Eq + Hash + Clone, V: Clone> {
    cache: &'a KeyedOnce<K, V>,
    key: &'a K,
    armed: bool,
}

impl<K: Eq + Hash + Clone, V: Clone> Drop for Flight<'_, K, V> {
    fn drop(&mut self) {
        if self.armed {
            let mut map = lock(&self.cache.map);
            map.remove(self.key);
            drop(map);
            self.cache.ready.notify_all();
        }
    }
}

// ── Dataset ────────────────────────────────────────────────────

/// One dataset inside a store: a dimension space, declared source and
/// sink columns, and lazily discovered rows. Construction is cheap; the
/// first row enumeration triggers one coordinate listing per dimension.
pub struct Dataset {
    store: Arc<dyn DataStore>,
    id: String,
    space: DataSpace,
    sources: BTreeMap<String, SourceColumn>,
    sinks: BTreeMap<String, SinkColumn>,
    discovered: Mutex<Option<Arc<BTreeMap<String, Vec<String>>>>>,
    listings: KeyedOnce<RowKey, Arc<Vec<StoreEntry>>>,
    items: KeyedOnce<(RowKey, String), Arc<DataItem>>,
}

impl Dataset {
    pub fn open(store: Arc<dyn DataStore>, id: &str, space: DataSpace) -> Dataset {
        Dataset {
            store,
            id: id.to_string(),
            space,
            sources: BTreeMap::new(),
            sinks: BTreeMap::new(),
            discovered: Mutex::new(None),
            listings: KeyedOnce::new(),
            items: KeyedOnce::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn space(&self) -> &DataSpace {
        &self.space
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    /// Register a source column. Names are unique across sources and
    /// sinks together.
    pub fn add_source(&mut self, column: SourceColumn) -> Result<()> {
        self.space.validate(column.frequency)?;
        if self.sources.contains_key(&column.name) || self.sinks.contains_key(&column.name) {
            return Err(TrellisError::DuplicateColumn(column.name.clone()));
        }
        self.sources.insert(column.name.clone(), column);
        Ok(())
    }

    pub fn add_sink(&mut self, column: SinkColumn) -> Result<()> {
        self.space.validate(column.frequency)?;
        if self.sources.contains_key(&column.name) || self.sinks.contains_key(&column.name) {
            return Err(TrellisError::DuplicateColumn(column.name.clone()));
        }
        self.sinks.insert(column.name.clone(), column);
        Ok(())
    }

    pub fn source(&self, name: &str) -> Option<&SourceColumn> {
        self.sources.get(name)
    }

    pub fn sink(&self, name: &str) -> Option<&SinkColumn> {
        self.sinks.get(name)
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceColumn> {
        self.sources.values()
    }

    pub fn sinks(&self) -> impl Iterator<Item = &SinkColumn> {
        self.sinks.values()
    }

    /// Source columns a pipeline consumes when none are named explicitly
    /// (everything above `Checked`).
    pub fn default_source_set(&self) -> Vec<&SourceColumn> {
        self.sources
            .values()
            .filter(|c| c.salience.in_default_set())
            .collect()
    }

    /// Discovered coordinate values per dimension. Populated once; the
    /// populating thread holds the lock, so concurrent first readers
    /// block until the values are in rather than re-listing.
    fn discovered(&self) -> Result<Arc<BTreeMap<String, Vec<String>>>> {
        let mut guard = lock(&self.discovered);
        if let Some(values) = &*guard {
            return Ok(Arc::clone(values));
        }
        let mut map = BTreeMap::new();
        for dimension in self.space.dimensions() {
            let values = self.store.list_coordinates(&self.id, dimension)?;
            map.insert(dimension.clone(), values);
        }
        let values = Arc::new(map);
        *guard = Some(Arc::clone(&values));
        Ok(values)
    }

    /// All rows at a frequency, in deterministic coordinate-sorted
    /// order. An empty result is not an error.
    pub fn rows(&self, frequency: Frequency) -> Result<Vec<DataRow<'_>>> {
        self.space.validate(frequency)?;
        let discovered = self.discovered()?;
        let coords = self.space.enumerate(frequency, &discovered)?;
        Ok(coords
            .into_iter()
            .map(|coordinates| DataRow {
                dataset: self,
                frequency,
                coordinates,
            })
            .collect())
    }

    /// Direct lookup of one row by coordinates.
    pub fn row(&self, frequency: Frequency, coordinates: Coordinates) -> Result<DataRow<'_>> {
        self.space.validate(frequency)?;
        let discovered = self.discovered()?;
        let not_found = || TrellisError::RowNotFound {
            frequency: self.space.frequency_name(frequency),
            coordinates: coordinates.to_string(),
        };

        let mut explicit = 0;
        for dimension in self.space.basis_names(frequency) {
            let known = discovered.get(dimension).map(Vec::as_slice).unwrap_or(&[]);
            match coordinates.get(dimension) {
                Some(value) => {
                    if !known.iter().any(|v| v == value) {
                        return Err(not_found());
                    }
                    explicit += 1;
                }
                // Implicit dimensions carry no coordinate
                None if known.is_empty() => {}
                None => return Err(not_found()),
            }
        }
        if coordinates.len() != explicit {
            // Stray coordinates outside the frequency's dimensions
            return Err(not_found());
        }
        Ok(DataRow {
            dataset: self,
            frequency,
            coordinates,
        })
    }

    fn locator_for(&self, frequency: Frequency, coordinates: &Coordinates) -> RowLocator {
        RowLocator {
            frequency: self.space.frequency_name(frequency),
            dimensions: self
                .space
                .basis_names(frequency)
                .into_iter()
                .map(str::to_string)
                .collect(),
            coordinates: coordinates.clone(),
            leaf: frequency == self.space.span(),
        }
    }

    fn listing(&self, frequency: Frequency, coordinates: &Coordinates) -> Result<Arc<Vec<StoreEntry>>> {
        let key = (frequency, coordinates.clone());
        let locator = self.locator_for(frequency, coordinates);
        self.listings.get_or_compute(key, || {
            let entries = self.store.list_entries(&self.id, &locator)?;
            Ok(Arc::new(entries))
        })
    }

    /// Persist this dataset's definition (space, columns, and the store
    /// hierarchy used to lay rows out) under a name.
    pub fn save(&self, name: &str, hierarchy: &[String]) -> Result<()> {
        let definition = DatasetDefinition::from_dataset(self, hierarchy);
        let yaml = serde_yaml::to_string(&definition)?;
        self.store.save_definition(&self.id, name, &yaml)
    }

    /// Reopen a dataset from a saved definition.
    pub fn load(store: Arc<dyn DataStore>, id: &str, name: &str) -> Result<Dataset> {
        let yaml = store
            .load_definition(id, name)?
            .ok_or_else(|| {
                TrellisError::Definition(format!("dataset {id} has no definition named {name}"))
            })?;
        let definition = DatasetDefinition::from_yaml(&yaml)?;
        definition.instantiate(store, id)
    }
}

impl fmt::Debug for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("id", &self.id)
            .field("space", &self.space.name())
            .field("store", &self.store.name())
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .field("sinks", &self.sinks.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

// ── DataRow ────────────────────────────────────────────────────

/// Handle to one addressable row. Cheap to create; all caches live in
/// the owning dataset, keyed by the row's address.
pub struct DataRow<'a> {
    dataset: &'a Dataset,
    frequency: Frequency,
    coordinates: Coordinates,
}

impl<'a> DataRow<'a> {
    pub fn frequency(&self) -> Frequency {
        self.frequency
    }

    pub fn coordinates(&self) -> &Coordinates {
        &self.coordinates
    }

    pub fn locator(&self) -> RowLocator {
        self.dataset.locator_for(self.frequency, &self.coordinates)
    }

    /// The row's cached store listing (one round-trip per row).
    pub fn entries(&self) -> Result<Arc<Vec<StoreEntry>>> {
        self.dataset.listing(self.frequency, &self.coordinates)
    }

    /// Resolve a column against this row. Results are cached: resolving
    /// the same pair twice returns the identical item, and concurrent
    /// resolutions of one pair perform a single store query.
    pub fn item(&self, column: &str) -> Result<Arc<DataItem>> {
        if let Some(source) = self.dataset.sources.get(column) {
            return self.resolve_source(source);
        }
        if let Some(sink) = self.dataset.sinks.get(column) {
            return self.resolve_sink(sink);
        }
        Err(TrellisError::Usage(format!(
            "dataset {} has no column named {column}",
            self.dataset.id
        )))
    }

    fn check_frequency(&self, column: &str, frequency: Frequency) -> Result<()> {
        if frequency.is_parent(self.frequency) {
            Ok(())
        } else {
            Err(TrellisError::IncompatibleFrequency {
                column: column.to_string(),
                column_frequency: self.dataset.space.frequency_name(frequency),
                row_frequency: self.dataset.space.frequency_name(self.frequency),
            })
        }
    }

    /// Project this row's coordinates onto a coarser frequency: the
    /// address of the row that actually holds the column's item.
    fn project(&self, frequency: Frequency) -> Coordinates {
        let mut coords = Coordinates::new();
        for dimension in self.dataset.space.basis_names(frequency) {
            if let Some(value) = self.coordinates.get(dimension) {
                coords.set(dimension, value);
            }
        }
        coords
    }

    fn resolve_source(&self, source: &SourceColumn) -> Result<Arc<DataItem>> {
        self.check_frequency(&source.name, source.frequency)?;
        let coords = self.project(source.frequency);
        let key = ((source.frequency, coords.clone()), source.name.clone());
        self.dataset
            .items
            .get_or_compute(key, || self.resolve_source_uncached(source, coords))
    }

    fn resolve_source_uncached(
        &self,
        source: &SourceColumn,
        coords: Coordinates,
    ) -> Result<Arc<DataItem>> {
        let listing = self.dataset.listing(source.frequency, &coords)?;
        let locator = self.dataset.locator_for(source.frequency, &coords);

        // The path hint narrows candidacy itself, not just ties: an
        // entry the hint rejects is no match at all.
        let mut matching: Vec<&StoreEntry> = Vec::new();
        for entry in listing.iter() {
            if !source.format.matches(entry, &listing) {
                continue;
            }
            if !source
                .criteria
                .selects(&entry.name, crate::format::stem(&entry.name))?
            {
                continue;
            }
            matching.push(entry);
        }

        if matching.is_empty() {
            if source.salience.requires_presence() {
                return Err(TrellisError::FileNotFound {
                    column: source.name.clone(),
                    coordinates: coords.to_string(),
                });
            }
            log::debug!(
                "column {} absent in [{}] (salience {:?})",
                source.name,
                coords,
                source.salience
            );
            return Ok(Arc::new(DataItem::absent(
                Arc::clone(&self.dataset.store),
                &self.dataset.id,
                locator,
                &source.name,
                source.format.clone(),
            )));
        }
        if matching.len() == 1 {
            return Ok(Arc::new(self.build_item(source, matching[0], &listing, locator)));
        }
        Err(TrellisError::AmbiguousMatch {
            column: source.name.clone(),
            coordinates: coords.to_string(),
            candidates: matching
                .iter()
                .map(|e| e.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    fn build_item(
        &self,
        source: &SourceColumn,
        entry: &StoreEntry,
        listing: &[StoreEntry],
        locator: RowLocator,
    ) -> DataItem {
        let excluded = source
            .quality_threshold
            .map(|threshold| entry.effective_quality() < threshold)
            .unwrap_or(false);
        if excluded {
            log::warn!(
                "column {} in [{}] rated {:?}, below threshold {:?}",
                source.name,
                locator.coordinates,
                entry.effective_quality(),
                source.quality_threshold
            );
        }
        match &entry.kind {
            EntryKind::Field { .. } => DataItem::resolved_field(
                Arc::clone(&self.dataset.store),
                &self.dataset.id,
                locator,
                &source.name,
                source.format.clone(),
                entry.clone(),
                excluded,
            ),
            _ => {
                let side_cars = source.format.side_car_entries(entry, listing);
                DataItem::resolved_file_group(
                    Arc::clone(&self.dataset.store),
                    &self.dataset.id,
                    locator,
                    &source.name,
                    source.format.clone(),
                    entry.clone(),
                    side_cars,
                    excluded,
                )
            }
        }
    }

    fn resolve_sink(&self, sink: &SinkColumn) -> Result<Arc<DataItem>> {
        self.check_frequency(&sink.name, sink.frequency)?;
        let coords = self.project(sink.frequency);
        let key = ((sink.frequency, coords.clone()), sink.name.clone());
        self.dataset
            .items
            .get_or_compute(key, || self.resolve_sink_uncached(sink, coords))
    }

    fn resolve_sink_uncached(
        &self,
        sink: &SinkColumn,
        coords: Coordinates,
    ) -> Result<Arc<DataItem>> {
        let raw = self.dataset.listing(sink.frequency, &coords)?;
        let locator = self.dataset.locator_for(sink.frequency, &coords);
        let stem = sink.write_stem();

        // A sink stem may point inside a subdirectory; listings report
        // those as directory entries, so expand them before matching.
        let listing = expand_directories(&raw);
        let matching: Vec<&StoreEntry> = listing
            .iter()
            .filter(|entry| {
                crate::format::stem(&entry.name) == stem
                    && sink.format.matches(entry, &listing)
            })
            .collect();

        match matching.len() {
            // Not derived yet: an absent but writable item
            0 => Ok(Arc::new(
                DataItem::absent(
                    Arc::clone(&self.dataset.store),
                    &self.dataset.id,
                    locator,
                    &sink.name,
                    sink.format.clone(),
                )
                .with_sink_stem(stem),
            )),
            1 => {
                let entry = matching[0];
                let item = match &entry.kind {
                    EntryKind::Field { .. } => DataItem::resolved_field(
                        Arc::clone(&self.dataset.store),
                        &self.dataset.id,
                        locator,
                        &sink.name,
                        sink.format.clone(),
                        entry.clone(),
                        false,
                    ),
                    _ => {
                        let side_cars = sink.format.side_car_entries(entry, &listing);
                        DataItem::resolved_file_group(
                            Arc::clone(&self.dataset.store),
                            &self.dataset.id,
                            locator,
                            &sink.name,
                            sink.format.clone(),
                            entry.clone(),
                            side_cars,
                            false,
                        )
                    }
                };
                Ok(Arc::new(item.with_sink_stem(stem)))
            }
            _ => Err(TrellisError::AmbiguousMatch {
                column: sink.name.clone(),
                coordinates: coords.to_string(),
                candidates: matching
                    .iter()
                    .map(|e| e.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }
}

impl fmt::Debug for DataRow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataRow")
            .field("dataset", &self.dataset.id)
            .field(
                "frequency",
                &self.dataset.space.frequency_name(self.frequency),
            )
            .field("coordinates", &self.coordinates)
            .finish()
    }
}

fn expand_directories(listing: &[StoreEntry]) -> Vec<StoreEntry> {
    let mut expanded = Vec::with_capacity(listing.len());
    for entry in listing {
        expanded.push(entry.clone());
        if let EntryKind::Directory { contents } = &entry.kind {
            for rel in contents {
                expanded.push(StoreEntry {
                    name: format!("{}/{}", entry.name, rel),
                    kind: EntryKind::File,
                    size: None,
                    quality: entry.quality,
                });
            }
        }
    }
    expanded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{ColumnSalience, MatchCriteria};
    use crate::format::{DataFormat, FieldKind};
    use crate::item::ItemContent;
    use crate::provenance::ProvenanceRecord;
    use crate::store::{DataQuality, MemoryStore, StorePayload};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Wraps a store and counts listing/read traffic, for cache tests.
    struct CountingStore {
        inner: MemoryStore,
        listings: AtomicU32,
        coordinate_listings: AtomicU32,
    }

    impl CountingStore {
        fn new(inner: MemoryStore) -> CountingStore {
            CountingStore {
                inner,
                listings: AtomicU32::new(0),
                coordinate_listings: AtomicU32::new(0),
            }
        }
    }

    impl DataStore for CountingStore {
        fn name(&self) -> &str {
            "counting"
        }
        fn list_coordinates(&self, dataset_id: &str, dimension: &str) -> Result<Vec<String>> {
            self.coordinate_listings.fetch_add(1, Ordering::SeqCst);
            self.inner.list_coordinates(dataset_id, dimension)
        }
        fn list_entries(&self, dataset_id: &str, row: &RowLocator) -> Result<Vec<StoreEntry>> {
            self.listings.fetch_add(1, Ordering::SeqCst);
            self.inner.list_entries(dataset_id, row)
        }
        fn read(
            &self,
            dataset_id: &str,
            row: &RowLocator,
            entry: &StoreEntry,
        ) -> Result<StorePayload> {
            self.inner.read(dataset_id, row, entry)
        }
        fn write(
            &self,
            dataset_id: &str,
            row: &RowLocator,
            name: &str,
            payload: &StorePayload,
        ) -> Result<()> {
            self.inner.write(dataset_id, row, name, payload)
        }
        fn delete(&self, dataset_id: &str, row: &RowLocator, name: &str) -> Result<()> {
            self.inner.delete(dataset_id, row, name)
        }
        fn read_provenance(
            &self,
            dataset_id: &str,
            row: &RowLocator,
            stem: &str,
        ) -> Result<Option<ProvenanceRecord>> {
            self.inner.read_provenance(dataset_id, row, stem)
        }
        fn write_provenance(
            &self,
            dataset_id: &str,
            row: &RowLocator,
            stem: &str,
            record: &ProvenanceRecord,
        ) -> Result<()> {
            self.inner.write_provenance(dataset_id, row, stem, record)
        }
        fn save_definition(&self, dataset_id: &str, name: &str, definition: &str) -> Result<()> {
            self.inner.save_definition(dataset_id, name, definition)
        }
        fn load_definition(&self, dataset_id: &str, name: &str) -> Result<Option<String>> {
            self.inner.load_definition(dataset_id, name)
        }
    }

    fn clinical_locator(group: &str, member: &str, timepoint: &str) -> RowLocator {
        RowLocator {
            frequency: "session".to_string(),
            dimensions: vec!["group".into(), "member".into(), "timepoint".into()],
            coordinates: Coordinates::from_pairs([
                ("group", group),
                ("member", member),
                ("timepoint", timepoint),
            ]),
            leaf: true,
        }
    }

    /// Two groups x two members x one timepoint, a t1w scan per session.
    fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        for group in ["control", "test"] {
            for member in ["01", "02"] {
                let row = clinical_locator(group, member, "t1");
                store.seed_file("study", &row, "t1w.nii.gz", b"imaging");
                store.seed_file("study", &row, "t1w.json", b"{}");
            }
        }
        store
    }

    fn open_seeded() -> Dataset {
        Dataset::open(Arc::new(seeded_store()), "study", DataSpace::clinical())
    }

    #[test]
    fn test_rows_at_coarsest_and_finest() {
        let dataset = open_seeded();
        let space = dataset.space().clone();

        let leaves = dataset.rows(space.span()).unwrap();
        assert_eq!(leaves.len(), 4);

        let dataset_rows = dataset.rows(Frequency::DATASET).unwrap();
        assert_eq!(dataset_rows.len(), 1);
        assert!(dataset_rows[0].coordinates().is_empty());

        let subjects = dataset
            .rows(space.frequency("subject").unwrap())
            .unwrap();
        assert_eq!(subjects.len(), 4);
        // Deterministic ordering
        assert_eq!(subjects[0].coordinates().get("group"), Some("control"));
        assert_eq!(subjects[0].coordinates().get("member"), Some("01"));
    }

    #[test]
    fn test_rows_rejects_foreign_frequency() {
        let dataset = open_seeded();
        let err = dataset.rows(Frequency::from_bits(0b1000)).unwrap_err();
        assert!(matches!(err, TrellisError::InvalidFrequency { .. }));
    }

    #[test]
    fn test_row_lookup_and_not_found() {
        let dataset = open_seeded();
        let session = dataset.space().frequency("session").unwrap();

        let row = dataset
            .row(
                session,
                Coordinates::from_pairs([
                    ("group", "test"),
                    ("member", "01"),
                    ("timepoint", "t1"),
                ]),
            )
            .unwrap();
        assert_eq!(row.coordinates().get("member"), Some("01"));

        let err = dataset
            .row(
                session,
                Coordinates::from_pairs([
                    ("group", "test"),
                    ("member", "99"),
                    ("timepoint", "t1"),
                ]),
            )
            .unwrap_err();
        assert!(matches!(err, TrellisError::RowNotFound { .. }));

        // Missing a non-implicit coordinate
        let err = dataset
            .row(session, Coordinates::from_pairs([("member", "01")]))
            .unwrap_err();
        assert!(matches!(err, TrellisError::RowNotFound { .. }));

        // Stray coordinate outside the frequency
        let subject = dataset.space().frequency("subject").unwrap();
        let err = dataset
            .row(
                subject,
                Coordinates::from_pairs([
                    ("group", "test"),
                    ("member", "01"),
                    ("timepoint", "t1"),
                ]),
            )
            .unwrap_err();
        assert!(matches!(err, TrellisError::RowNotFound { .. }));
    }

    #[test]
    fn test_empty_dataset_is_not_an_error() {
        let store = MemoryStore::new();
        store.create_dataset("empty");
        let dataset = Dataset::open(Arc::new(store), "empty", DataSpace::clinical());
        let rows = dataset
            .rows(dataset.space().frequency("session").unwrap())
            .unwrap();
        // All dimensions implicit: the lone all-implicit row
        assert_eq!(rows.len(), 1);
        assert!(rows[0].entries().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let mut dataset = open_seeded();
        let session = dataset.space().frequency("session").unwrap();
        dataset
            .add_source(SourceColumn::new(
                "t1w",
                DataFormat::file(&["nii.gz"]),
                session,
            ))
            .unwrap();
        let err = dataset
            .add_source(SourceColumn::new(
                "t1w",
                DataFormat::file(&["nii.gz"]),
                session,
            ))
            .unwrap_err();
        assert!(matches!(err, TrellisError::DuplicateColumn(_)));
        // Sinks share the namespace
        let err = dataset
            .add_sink(SinkColumn::new(
                "t1w",
                DataFormat::file(&["nii.gz"]),
                session,
            ))
            .unwrap_err();
        assert!(matches!(err, TrellisError::DuplicateColumn(_)));
    }

    #[test]
    fn test_default_source_set_excludes_checked() {
        let mut dataset = open_seeded();
        let session = dataset.space().frequency("session").unwrap();
        dataset
            .add_source(SourceColumn::new(
                "t1w",
                DataFormat::file(&["nii.gz"]),
                session,
            ))
            .unwrap();
        dataset
            .add_source(
                SourceColumn::new("physio", DataFormat::file(&["tsv"]), session)
                    .salience(ColumnSalience::Checked),
            )
            .unwrap();

        let defaults: Vec<&str> = dataset
            .default_source_set()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(defaults, vec!["t1w"]);
    }

    #[test]
    fn test_add_column_validates_frequency() {
        let mut dataset = open_seeded();
        let err = dataset
            .add_source(SourceColumn::new(
                "weird",
                DataFormat::file(&["csv"]),
                Frequency::from_bits(0b10000),
            ))
            .unwrap_err();
        assert!(matches!(err, TrellisError::InvalidFrequency { .. }));
    }

    #[test]
    fn test_resolution_happy_path() {
        let mut dataset = open_seeded();
        let session = dataset.space().frequency("session").unwrap();
        dataset
            .add_source(SourceColumn::new(
                "t1w",
                DataFormat::with_side_cars("nii.gz", &["json"], &[]),
                session,
            ))
            .unwrap();

        let rows = dataset.rows(session).unwrap();
        let item = rows[0].item("t1w").unwrap();
        assert!(!item.is_absent());
        let content = item.get().unwrap();
        match content.as_ref() {
            ItemContent::Files(files) => assert_eq!(files.len(), 2),
            other => panic!("expected files, got {other:?}"),
        }
    }

    #[test]
    fn test_resolution_cache_returns_identical_item() {
        let counting = CountingStore::new(seeded_store());
        let store = Arc::new(counting);
        let mut dataset = Dataset::open(store.clone(), "study", DataSpace::clinical());
        let session = dataset.space().frequency("session").unwrap();
        dataset
            .add_source(SourceColumn::new(
                "t1w",
                DataFormat::file(&["nii.gz"]),
                session,
            ))
            .unwrap();

        let rows = dataset.rows(session).unwrap();
        let first = rows[0].item("t1w").unwrap();
        let listings_after_first = store.listings.load(Ordering::SeqCst);
        let second = rows[0].item("t1w").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.listings.load(Ordering::SeqCst), listings_after_first);

        // Coordinate metadata was listed exactly once per dimension
        assert_eq!(store.coordinate_listings.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_concurrent_resolution_single_listing() {
        let store = Arc::new(CountingStore::new(seeded_store()));
        let mut dataset = Dataset::open(store.clone(), "study", DataSpace::clinical());
        let session = dataset.space().frequency("session").unwrap();
        dataset
            .add_source(SourceColumn::new(
                "t1w",
                DataFormat::file(&["nii.gz"]),
                session,
            ))
            .unwrap();

        let rows = dataset.rows(session).unwrap();
        let row = &rows[0];
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| row.item("t1w").unwrap()))
                .collect();
            let items: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            for item in &items[1..] {
                assert!(Arc::ptr_eq(&items[0], item));
            }
        });
        assert_eq!(store.listings.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_incompatible_frequency() {
        let mut dataset = open_seeded();
        let space = dataset.space().clone();
        let session = space.frequency("session").unwrap();
        let subject = space.frequency("subject").unwrap();
        dataset
            .add_source(SourceColumn::new(
                "scan",
                DataFormat::file(&["nii.gz"]),
                session,
            ))
            .unwrap();

        // A session-frequency column cannot resolve from a subject row
        let rows = dataset.rows(subject).unwrap();
        let err = rows[0].item("scan").unwrap_err();
        assert!(matches!(err, TrellisError::IncompatibleFrequency { .. }));
    }

    #[test]
    fn test_coarser_column_resolves_from_finer_row() {
        let store = seeded_store();
        store.seed_file(
            "study",
            &RowLocator::dataset_row(),
            "participants.tsv",
            b"id\tage",
        );
        let mut dataset = Dataset::open(Arc::new(store), "study", DataSpace::clinical());
        let session = dataset.space().frequency("session").unwrap();
        dataset
            .add_source(SourceColumn::new(
                "participants",
                DataFormat::file(&["tsv"]),
                Frequency::DATASET,
            ))
            .unwrap();

        let rows = dataset.rows(session).unwrap();
        let item = rows[0].item("participants").unwrap();
        let content = item.get().unwrap();
        assert_eq!(content.bytes(), Some(b"id\tage".as_slice()));

        // Every session row shares the single dataset-level item
        let other = rows[3].item("participants").unwrap();
        assert!(Arc::ptr_eq(&item, &other));
    }

    #[test]
    fn test_missing_expected_vs_optional() {
        let store = seeded_store();
        let mut dataset = Dataset::open(Arc::new(store), "study", DataSpace::clinical());
        let session = dataset.space().frequency("session").unwrap();
        dataset
            .add_source(SourceColumn::new(
                "t2w",
                DataFormat::file(&["t2.nii.gz"]),
                session,
            ))
            .unwrap();
        dataset
            .add_source(
                SourceColumn::new("fmap", DataFormat::file(&["fmap.nii.gz"]), session)
                    .salience(ColumnSalience::Optional),
            )
            .unwrap();

        let rows = dataset.rows(session).unwrap();
        let err = rows[0].item("t2w").unwrap_err();
        assert!(matches!(err, TrellisError::FileNotFound { .. }));

        let item = rows[0].item("fmap").unwrap();
        assert!(item.is_absent());
        assert!(item.get().is_err());
    }

    #[test]
    fn test_failed_resolution_not_cached() {
        let store = Arc::new(CountingStore::new(seeded_store()));
        let mut dataset = Dataset::open(store.clone(), "study", DataSpace::clinical());
        let session = dataset.space().frequency("session").unwrap();
        dataset
            .add_source(SourceColumn::new(
                "t2w",
                DataFormat::file(&["t2.nii.gz"]),
                session,
            ))
            .unwrap();

        let rows = dataset.rows(session).unwrap();
        assert!(rows[0].item("t2w").is_err());
        // The miss is re-attempted (listing is cached, so no new store
        // traffic, but no poisoned marker either)
        assert!(rows[0].item("t2w").is_err());
    }

    #[test]
    fn test_ambiguous_match_and_criteria_disambiguation() {
        let store = seeded_store();
        let row = clinical_locator("control", "01", "t1");
        store.seed_file("study", &row, "t1w_repeat.nii.gz", b"imaging2");

        let mut dataset = Dataset::open(Arc::new(store), "study", DataSpace::clinical());
        let session = dataset.space().frequency("session").unwrap();
        dataset
            .add_source(SourceColumn::new(
                "ambiguous",
                DataFormat::file(&["nii.gz"]),
                session,
            ))
            .unwrap();
        dataset
            .add_source(
                SourceColumn::new("precise", DataFormat::file(&["nii.gz"]), session)
                    .criteria(MatchCriteria::path("t1w")),
            )
            .unwrap();

        let target = dataset
            .row(
                session,
                Coordinates::from_pairs([
                    ("group", "control"),
                    ("member", "01"),
                    ("timepoint", "t1"),
                ]),
            )
            .unwrap();

        let err = target.item("ambiguous").unwrap_err();
        match err {
            TrellisError::AmbiguousMatch { candidates, .. } => {
                assert!(candidates.contains("t1w.nii.gz"));
                assert!(candidates.contains("t1w_repeat.nii.gz"));
            }
            other => panic!("expected ambiguity, got {other}"),
        }

        let item = target.item("precise").unwrap();
        assert_eq!(
            crate::format::stem(&item.entries()[0].name),
            "t1w"
        );
    }

    #[test]
    fn test_hint_excluded_lone_match_is_absent() {
        let store = seeded_store();
        let mut dataset = Dataset::open(Arc::new(store), "study", DataSpace::clinical());
        let session = dataset.space().frequency("session").unwrap();
        // t1w.nii.gz is the only entry fitting the format; the hint
        // rules it out, so it must not resolve under another name.
        dataset
            .add_source(
                SourceColumn::new("t2w", DataFormat::file(&["nii.gz"]), session)
                    .criteria(MatchCriteria::path("t2w")),
            )
            .unwrap();
        dataset
            .add_source(
                SourceColumn::new("dwi", DataFormat::file(&["nii.gz"]), session)
                    .salience(ColumnSalience::Optional)
                    .criteria(MatchCriteria::path("dwi")),
            )
            .unwrap();

        let rows = dataset.rows(session).unwrap();
        let err = rows[0].item("t2w").unwrap_err();
        assert!(matches!(err, TrellisError::FileNotFound { .. }));

        let item = rows[0].item("dwi").unwrap();
        assert!(item.is_absent());
    }

    #[test]
    fn test_hint_filters_candidates_before_ambiguity() {
        let store = seeded_store();
        let row = clinical_locator("control", "01", "t1");
        store.seed_file("study", &row, "t1w_repeat.nii.gz", b"imaging2");
        store.seed_file("study", &row, "flair.nii.gz", b"imaging3");

        let mut dataset = Dataset::open(Arc::new(store), "study", DataSpace::clinical());
        let session = dataset.space().frequency("session").unwrap();
        dataset
            .add_source(
                SourceColumn::new("t1w", DataFormat::file(&["nii.gz"]), session)
                    .criteria(MatchCriteria::path("t1w*")),
            )
            .unwrap();
        dataset
            .add_source(
                SourceColumn::new("dwi", DataFormat::file(&["nii.gz"]), session)
                    .criteria(MatchCriteria::path("dwi")),
            )
            .unwrap();

        let target = dataset
            .row(
                session,
                Coordinates::from_pairs([
                    ("group", "control"),
                    ("member", "01"),
                    ("timepoint", "t1"),
                ]),
            )
            .unwrap();

        // Two hint survivors are still ambiguous, and the report names
        // only them, not every format match.
        let err = target.item("t1w").unwrap_err();
        match err {
            TrellisError::AmbiguousMatch { candidates, .. } => {
                assert!(candidates.contains("t1w.nii.gz"));
                assert!(candidates.contains("t1w_repeat.nii.gz"));
                assert!(!candidates.contains("flair"));
            }
            other => panic!("expected ambiguity, got {other}"),
        }

        // A hint matching none of the three is a missing item, not an
        // ambiguous one.
        let err = target.item("dwi").unwrap_err();
        assert!(matches!(err, TrellisError::FileNotFound { .. }));
    }

    #[test]
    fn test_quality_flags_but_does_not_block() {
        let store = seeded_store();
        let row = clinical_locator("control", "01", "t1");
        store.set_quality("study", &row, "t1w", DataQuality::Artefactual);

        let mut dataset = Dataset::open(Arc::new(store), "study", DataSpace::clinical());
        let session = dataset.space().frequency("session").unwrap();
        dataset
            .add_source(
                SourceColumn::new("t1w", DataFormat::file(&["nii.gz"]), session)
                    .quality_threshold(DataQuality::Questionable),
            )
            .unwrap();

        let flagged = dataset
            .row(
                session,
                Coordinates::from_pairs([
                    ("group", "control"),
                    ("member", "01"),
                    ("timepoint", "t1"),
                ]),
            )
            .unwrap()
            .item("t1w")
            .unwrap();
        assert!(flagged.excluded_by_quality());
        assert_eq!(flagged.quality(), DataQuality::Artefactual);
        // Content still loads
        assert!(flagged.get().is_ok());

        let clean = dataset
            .row(
                session,
                Coordinates::from_pairs([
                    ("group", "control"),
                    ("member", "02"),
                    ("timepoint", "t1"),
                ]),
            )
            .unwrap()
            .item("t1w")
            .unwrap();
        assert!(!clean.excluded_by_quality());
    }

    #[test]
    fn test_sink_resolution_before_and_after_put() {
        let mut dataset = open_seeded();
        let space = dataset.space().clone();
        let subject = space.frequency("subject").unwrap();
        dataset
            .add_sink(SinkColumn::new(
                "mask",
                DataFormat::file(&["nii.gz"]),
                subject,
            ))
            .unwrap();

        let rows = dataset.rows(subject).unwrap();
        let item = rows[0].item("mask").unwrap();
        assert!(item.is_absent());

        item.put(ItemContent::single_file("out.nii.gz", b"mask"))
            .unwrap();
        // The cached item reflects the write immediately
        let again = rows[0].item("mask").unwrap();
        assert!(Arc::ptr_eq(&item, &again));
        assert!(!again.is_absent());
        assert_eq!(again.get().unwrap().bytes(), Some(b"mask".as_slice()));
    }

    #[test]
    fn test_field_source_resolution() {
        let store = seeded_store();
        let row = clinical_locator("control", "01", "t1");
        store.seed_field("study", &row, "age", serde_json::json!(34));

        let mut dataset = Dataset::open(Arc::new(store), "study", DataSpace::clinical());
        let session = dataset.space().frequency("session").unwrap();
        dataset
            .add_source(SourceColumn::new(
                "age",
                DataFormat::field(FieldKind::Number),
                session,
            ))
            .unwrap();

        let target = dataset
            .row(
                session,
                Coordinates::from_pairs([
                    ("group", "control"),
                    ("member", "01"),
                    ("timepoint", "t1"),
                ]),
            )
            .unwrap();
        let item = target.item("age").unwrap();
        let content = item.get().unwrap();
        assert_eq!(content.as_value(), Some(&serde_json::json!(34)));
    }

    #[test]
    fn test_unknown_column() {
        let dataset = open_seeded();
        let session = dataset.space().frequency("session").unwrap();
        let rows = dataset.rows(session).unwrap();
        assert!(rows[0].item("nope").is_err());
    }

    #[test]
    fn test_debug_output_carries_addresses() {
        let mut dataset = open_seeded();
        let session = dataset.space().frequency("session").unwrap();
        dataset
            .add_source(SourceColumn::new(
                "t1w",
                DataFormat::file(&["nii.gz"]),
                session,
            ))
            .unwrap();
        assert!(format!("{dataset:?}").contains("study"));

        let rows = dataset.rows(session).unwrap();
        let row = format!("{:?}", rows[0]);
        assert!(row.contains("session"));
        assert!(row.contains("control"));

        let item = rows[0].item("t1w").unwrap();
        let item = format!("{item:?}");
        assert!(item.contains("t1w"));
        assert!(item.contains("Usable"));
    }

    #[test]
    fn test_definition_save_load_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let mut dataset = Dataset::open(store.clone(), "study", DataSpace::clinical());
        let space = dataset.space().clone();
        let session = space.frequency("session").unwrap();
        let subject = space.frequency("subject").unwrap();
        dataset
            .add_source(
                SourceColumn::new(
                    "t1w",
                    DataFormat::with_side_cars("nii.gz", &["json"], &[]),
                    session,
                )
                .salience(ColumnSalience::Required)
                .criteria(MatchCriteria::path("t1w"))
                .quality_threshold(DataQuality::Noisy),
            )
            .unwrap();
        dataset
            .add_sink(
                SinkColumn::new("mask", DataFormat::file(&["nii.gz"]), subject)
                    .path("derived/mask"),
            )
            .unwrap();

        dataset
            .save("default", &["group".to_string(), "member".to_string()])
            .unwrap();

        let loaded = Dataset::load(store, "study", "default").unwrap();
        assert_eq!(loaded.space(), dataset.space());
        let source = loaded.source("t1w").unwrap();
        assert_eq!(source.frequency, session);
        assert_eq!(source.salience, ColumnSalience::Required);
        assert_eq!(source.quality_threshold, Some(DataQuality::Noisy));
        assert_eq!(source.criteria, MatchCriteria::path("t1w"));
        let sink = loaded.sink("mask").unwrap();
        assert_eq!(sink.frequency, subject);
        assert_eq!(sink.write_stem(), "derived/mask");
    }
}
