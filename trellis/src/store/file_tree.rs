use crate::error::{Result, TrellisError};
use crate::format;
use crate::provenance::ProvenanceRecord;
use crate::store::{DataQuality, DataStore, EntryKind, RowLocator, StoreEntry, StorePayload};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Per-row fields live in one JSON document rather than one file each.
const FIELDS_FNAME: &str = "__fields__.json";
/// Per-row quality ratings, keyed by entry stem or field name.
const QUALITY_FNAME: &str = "__quality__.json";
/// Side file recording what produced the entry sharing its stem.
const PROV_SUFFIX: &str = ".prov.json";
/// Dataset definitions live under a hidden directory in the dataset root.
const DEFINITIONS_DIR: &str = ".trellis";

/// Store backed by a plain directory tree. One configured dimension per
/// directory layer; rows coarser than the layered leaf live in marker
/// directories named `__<frequency>__` so they never collide with layer
/// directories.
///
/// A three-layer clinical dataset looks like:
///
/// ```text
/// <base>/study/
///   .trellis/default.yaml
///   __dataset__/participants.tsv
///   control/
///     __group__/template.nii.gz
///     01/
///       __subject__/
///       t1/
///         t1w.nii.gz
///         t1w.json
///         mask.nii.gz
///         mask.prov.json
///         __fields__.json
/// ```
pub struct FileTreeStore {
    base_dir: PathBuf,
    hierarchy: Vec<String>,
}

impl FileTreeStore {
    /// `hierarchy` lists the dimensions laid out as directory layers,
    /// outermost first. It may be empty, in which case every row lives
    /// in a marker directory under the dataset root.
    pub fn new<P, I>(base_dir: P, hierarchy: I) -> Result<FileTreeStore>
    where
        P: Into<PathBuf>,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let hierarchy: Vec<String> = hierarchy.into_iter().map(Into::into).collect();
        for (i, layer) in hierarchy.iter().enumerate() {
            if layer.is_empty() || hierarchy[..i].contains(layer) {
                return Err(TrellisError::Definition(format!(
                    "invalid or duplicate hierarchy layer: {layer:?}"
                )));
            }
        }
        Ok(FileTreeStore {
            base_dir: base_dir.into(),
            hierarchy,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn hierarchy(&self) -> &[String] {
        &self.hierarchy
    }

    /// Create the dataset's root directory.
    pub fn create_dataset(&self, dataset_id: &str) -> Result<()> {
        fs::create_dir_all(self.dataset_root(dataset_id))?;
        Ok(())
    }

    /// Rate an entry (by stem) or field (by name) in a row.
    pub fn set_quality(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        stem: &str,
        quality: DataQuality,
    ) -> Result<()> {
        let dir = self.node_path(dataset_id, row);
        fs::create_dir_all(&dir)?;
        let mut ratings = read_quality(&dir)?;
        ratings.insert(stem.to_string(), quality);
        let json = serde_json::to_string_pretty(&ratings)?;
        fs::write(dir.join(QUALITY_FNAME), json)?;
        Ok(())
    }

    fn dataset_root(&self, dataset_id: &str) -> PathBuf {
        self.base_dir.join(dataset_id)
    }

    fn require_root(&self, dataset_id: &str) -> Result<PathBuf> {
        let root = self.dataset_root(dataset_id);
        if root.is_dir() {
            Ok(root)
        } else {
            Err(TrellisError::StoreNotFound(format!(
                "dataset directory {}",
                root.display()
            )))
        }
    }

    /// The directory holding a row's entries. Layer values are appended
    /// while the row spans them; what remains is addressed by a marker
    /// directory carrying the frequency name and any layer-less
    /// coordinate values.
    fn node_path(&self, dataset_id: &str, row: &RowLocator) -> PathBuf {
        let mut path = self.dataset_root(dataset_id);
        let mut accounted: BTreeSet<&str> = BTreeSet::new();
        for layer in &self.hierarchy {
            match row.coordinates.get(layer) {
                Some(value) => {
                    path.push(value);
                    accounted.insert(layer.as_str());
                }
                None => break,
            }
        }

        let direct = row.leaf
            && !row.coordinates.is_empty()
            && row.coordinates.iter().all(|(dim, _)| accounted.contains(dim));
        if direct {
            return path;
        }

        let ids: Vec<&str> = row
            .dimensions
            .iter()
            .filter(|dim| !accounted.contains(dim.as_str()))
            .filter_map(|dim| row.coordinates.get(dim))
            .collect();
        if ids.is_empty() {
            path.push(format!("__{}__", row.frequency));
        } else {
            path.push(format!("__{}_{}__", row.frequency, ids.join("_")));
        }
        path
    }
}

fn is_marker(name: &str) -> bool {
    name.starts_with("__") && name.ends_with("__")
}

/// Child directories that are layer or marker candidates: everything but
/// dotfiles and markers.
fn layer_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || is_marker(&name) {
            continue;
        }
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn read_fields(dir: &Path) -> Result<BTreeMap<String, serde_json::Value>> {
    let path = dir.join(FIELDS_FNAME);
    if !path.is_file() {
        return Ok(BTreeMap::new());
    }
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

fn write_fields(dir: &Path, fields: &BTreeMap<String, serde_json::Value>) -> Result<()> {
    fs::write(dir.join(FIELDS_FNAME), serde_json::to_string_pretty(fields)?)?;
    Ok(())
}

fn read_quality(dir: &Path) -> Result<BTreeMap<String, DataQuality>> {
    let path = dir.join(QUALITY_FNAME);
    if !path.is_file() {
        return Ok(BTreeMap::new());
    }
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

/// A stored field is either a bare JSON value or wrapped as
/// `{"value": ..., "quality": ...}`.
fn unwrap_field(raw: serde_json::Value) -> (serde_json::Value, Option<DataQuality>) {
    if let serde_json::Value::Object(map) = &raw {
        if map.contains_key("value") && map.keys().all(|k| k == "value" || k == "quality") {
            let quality = map
                .get("quality")
                .and_then(|q| serde_json::from_value(q.clone()).ok());
            return (map["value"].clone(), quality);
        }
    }
    (raw, None)
}

/// Relative paths of every file below `dir`, depth-first.
fn collect_contents(dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let relative = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        if entry.file_type()?.is_dir() {
            collect_contents(&entry.path(), &relative, out)?;
        } else {
            out.push(relative);
        }
    }
    Ok(())
}

impl DataStore for FileTreeStore {
    fn name(&self) -> &str {
        "file"
    }

    fn list_coordinates(&self, dataset_id: &str, dimension: &str) -> Result<Vec<String>> {
        let root = self.require_root(dataset_id)?;
        // Dimensions outside the hierarchy have no directory layer and
        // stay implicit.
        let Some(depth) = self.hierarchy.iter().position(|d| d == dimension) else {
            return Ok(Vec::new());
        };

        let mut level = vec![root];
        for _ in 0..depth {
            let mut next = Vec::new();
            for dir in &level {
                next.extend(layer_dirs(dir)?);
            }
            level = next;
        }
        let mut values = Vec::new();
        for dir in &level {
            for child in layer_dirs(dir)? {
                if let Some(name) = child.file_name() {
                    values.push(name.to_string_lossy().into_owned());
                }
            }
        }
        values.sort();
        values.dedup();
        Ok(values)
    }

    fn list_entries(&self, dataset_id: &str, row: &RowLocator) -> Result<Vec<StoreEntry>> {
        self.require_root(dataset_id)?;
        let dir = self.node_path(dataset_id, row);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let ratings = read_quality(&dir)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.')
                || is_marker(&name)
                || name == FIELDS_FNAME
                || name == QUALITY_FNAME
                || name.ends_with(PROV_SUFFIX)
            {
                continue;
            }
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                let mut contents = Vec::new();
                collect_contents(&entry.path(), "", &mut contents)?;
                contents.sort();
                entries.push(StoreEntry {
                    quality: ratings.get(&name).copied(),
                    name,
                    kind: EntryKind::Directory { contents },
                    size: None,
                });
            } else {
                entries.push(StoreEntry {
                    quality: ratings.get(format::stem(&name)).copied(),
                    size: Some(metadata.len()),
                    name,
                    kind: EntryKind::File,
                });
            }
        }
        for (name, raw) in read_fields(&dir)? {
            let (value, own_quality) = unwrap_field(raw);
            entries.push(StoreEntry {
                quality: own_quality.or_else(|| ratings.get(&name).copied()),
                name,
                kind: EntryKind::Field { value },
                size: None,
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
        let dir = self.node_path(dataset_id, row);
        match &entry.kind {
            EntryKind::File => {
                let path = dir.join(&entry.name);
                if !path.is_file() {
                    return Err(TrellisError::StoreNotFound(path.display().to_string()));
                }
                Ok(StorePayload::Bytes(fs::read(path)?))
            }
            EntryKind::Field { .. } => {
                let fields = read_fields(&dir)?;
                let raw = fields
                    .get(&entry.name)
                    .cloned()
                    .ok_or_else(|| TrellisError::StoreNotFound(entry.name.clone()))?;
                Ok(StorePayload::Value(unwrap_field(raw).0))
            }
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
        let dir = self.node_path(dataset_id, row);
        match payload {
            StorePayload::Bytes(bytes) => {
                let path = dir.join(name);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, bytes)?;
            }
            StorePayload::Value(value) => {
                fs::create_dir_all(&dir)?;
                let mut fields = read_fields(&dir)?;
                fields.insert(name.to_string(), value.clone());
                write_fields(&dir, &fields)?;
            }
        }
        Ok(())
    }

    fn delete(&self, dataset_id: &str, row: &RowLocator, name: &str) -> Result<()> {
        let dir = self.node_path(dataset_id, row);
        let target = dir.join(name);
        let mut removed = false;
        if target.is_dir() {
            fs::remove_dir_all(&target)?;
            removed = true;
        } else if target.is_file() {
            fs::remove_file(&target)?;
            removed = true;
        }
        let mut fields = read_fields(&dir)?;
        if fields.remove(name).is_some() {
            write_fields(&dir, &fields)?;
            removed = true;
        }
        if !removed {
            return Err(TrellisError::StoreNotFound(name.to_string()));
        }
        let prov = dir.join(format!("{}{PROV_SUFFIX}", format::stem(name)));
        if prov.is_file() {
            fs::remove_file(prov)?;
        }
        Ok(())
    }

    fn read_provenance(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        stem: &str,
    ) -> Result<Option<ProvenanceRecord>> {
        let path = self
            .node_path(dataset_id, row)
            .join(format!("{stem}{PROV_SUFFIX}"));
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&fs::read_to_string(path)?)?))
    }

    fn write_provenance(
        &self,
        dataset_id: &str,
        row: &RowLocator,
        stem: &str,
        record: &ProvenanceRecord,
    ) -> Result<()> {
        let dir = self.node_path(dataset_id, row);
        fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(record)?;
        fs::write(dir.join(format!("{stem}{PROV_SUFFIX}")), json)?;
        Ok(())
    }

    fn save_definition(&self, dataset_id: &str, name: &str, definition: &str) -> Result<()> {
        let dir = self.dataset_root(dataset_id).join(DEFINITIONS_DIR);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(format!("{name}.yaml")), definition)?;
        Ok(())
    }

    fn load_definition(&self, dataset_id: &str, name: &str) -> Result<Option<String>> {
        let path = self
            .dataset_root(dataset_id)
            .join(DEFINITIONS_DIR)
            .join(format!("{name}.yaml"));
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }
}
