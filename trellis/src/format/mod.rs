use crate::error::{Result, TrellisError};
use crate::store::{EntryKind, StoreEntry};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of a scalar field column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Number,
    Boolean,
    Array,
}

impl FieldKind {
    /// Classify a field value; objects and nulls have no field kind.
    pub fn of(value: &serde_json::Value) -> Option<FieldKind> {
        match value {
            serde_json::Value::String(_) => Some(FieldKind::Text),
            serde_json::Value::Number(_) => Some(FieldKind::Number),
            serde_json::Value::Bool(_) => Some(FieldKind::Boolean),
            serde_json::Value::Array(_) => Some(FieldKind::Array),
            _ => None,
        }
    }
}

/// A single file identified by extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFormat {
    /// Accepted extensions, canonical first (e.g. `["nii.gz", "nii"]`).
    pub extensions: Vec<String>,
}

/// A directory identified by required internal files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirFormat {
    /// Relative paths that must exist inside the directory.
    #[serde(default)]
    pub required_contents: Vec<String>,
}

/// A primary file plus co-located side-car files sharing its stem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideCarFormat {
    pub primary: String,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
}

/// A scalar value held in the row's field registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldFormat {
    /// Serialized as `field_kind`; the format tag below already claims
    /// `kind`.
    #[serde(rename = "field_kind")]
    pub kind: FieldKind,
}

/// The closed set of item formats. Matching is pure: it sees only the
/// entry under test and the row's full listing, never the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataFormat {
    File(FileFormat),
    Directory(DirFormat),
    WithSideCars(SideCarFormat),
    Field(FieldFormat),
}

/// Metadata reported for an entry that matched a format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatInfo {
    pub label: String,
    pub stem: String,
    pub extension: Option<String>,
}

impl DataFormat {
    pub fn file(extensions: &[&str]) -> DataFormat {
        DataFormat::File(FileFormat {
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
        })
    }

    pub fn directory(required_contents: &[&str]) -> DataFormat {
        DataFormat::Directory(DirFormat {
            required_contents: required_contents.iter().map(|c| c.to_string()).collect(),
        })
    }

    pub fn with_side_cars(primary: &str, required: &[&str], optional: &[&str]) -> DataFormat {
        DataFormat::WithSideCars(SideCarFormat {
            primary: primary.to_string(),
            required: required.iter().map(|e| e.to_string()).collect(),
            optional: optional.iter().map(|e| e.to_string()).collect(),
        })
    }

    pub fn field(kind: FieldKind) -> DataFormat {
        DataFormat::Field(FieldFormat { kind })
    }

    /// Whether `entry` is an instance of this format within `listing`
    /// (the full listing of the entry's row). Order-independent and free
    /// of side effects.
    pub fn matches(&self, entry: &StoreEntry, listing: &[StoreEntry]) -> bool {
        match self {
            DataFormat::File(f) => match &entry.kind {
                EntryKind::File => f
                    .extensions
                    .iter()
                    .any(|ext| extension(&entry.name).as_deref() == Some(ext)),
                _ => false,
            },
            DataFormat::Directory(d) => match &entry.kind {
                EntryKind::Directory { contents } => {
                    d.required_contents.iter().all(|required| {
                        contents.iter().any(|c| {
                            c == required || c.starts_with(&format!("{required}/"))
                        })
                    })
                }
                _ => false,
            },
            DataFormat::WithSideCars(s) => match &entry.kind {
                EntryKind::File => {
                    if extension(&entry.name).as_deref() != Some(s.primary.as_str()) {
                        return false;
                    }
                    let base = stem(&entry.name);
                    s.required.iter().all(|ext| {
                        listing.iter().any(|other| {
                            matches!(other.kind, EntryKind::File)
                                && stem(&other.name) == base
                                && extension(&other.name).as_deref() == Some(ext.as_str())
                        })
                    })
                }
                _ => false,
            },
            DataFormat::Field(f) => match &entry.kind {
                EntryKind::Field { value } => FieldKind::of(value) == Some(f.kind),
                _ => false,
            },
        }
    }

    /// Format metadata for a matching entry; `None` when the entry does
    /// not match.
    pub fn identify(&self, entry: &StoreEntry, listing: &[StoreEntry]) -> Option<FormatInfo> {
        if !self.matches(entry, listing) {
            return None;
        }
        let ext = extension(&entry.name);
        let label = match self {
            DataFormat::File(_) => format!("file/{}", ext.as_deref().unwrap_or("?")),
            DataFormat::Directory(_) => "directory".to_string(),
            DataFormat::WithSideCars(s) => format!("file/{}+side-cars", s.primary),
            DataFormat::Field(f) => format!("field/{:?}", f.kind).to_lowercase(),
        };
        Some(FormatInfo {
            label,
            stem: stem(&entry.name).to_string(),
            extension: ext,
        })
    }

    /// Side-car entries belonging to a matched primary: required plus any
    /// optional ones present, keyed by extension.
    pub fn side_car_entries(
        &self,
        primary: &StoreEntry,
        listing: &[StoreEntry],
    ) -> Vec<StoreEntry> {
        let DataFormat::WithSideCars(s) = self else {
            return Vec::new();
        };
        let base = stem(&primary.name);
        let mut cars = Vec::new();
        for ext in s.required.iter().chain(s.optional.iter()) {
            if let Some(found) = listing.iter().find(|other| {
                matches!(other.kind, EntryKind::File)
                    && stem(&other.name) == base
                    && extension(&other.name).as_deref() == Some(ext.as_str())
            }) {
                cars.push(found.clone());
            }
        }
        cars
    }

    /// The extension used when writing new items of this format.
    pub fn write_extension(&self) -> Option<&str> {
        match self {
            DataFormat::File(f) => f.extensions.first().map(String::as_str),
            DataFormat::WithSideCars(s) => Some(s.primary.as_str()),
            _ => None,
        }
    }

    pub fn is_field(&self) -> bool {
        matches!(self, DataFormat::Field(_))
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataFormat::File(ff) => write!(f, "file[{}]", ff.extensions.join("|")),
            DataFormat::Directory(_) => write!(f, "directory"),
            DataFormat::WithSideCars(s) => {
                write!(f, "file[{}]+[{}]", s.primary, s.required.join("|"))
            }
            DataFormat::Field(ff) => write!(f, "field[{:?}]", ff.kind),
        }
    }
}

/// Identity conversions only; anything else is plugin territory.
pub fn ensure_convertible(from: &DataFormat, to: &DataFormat) -> Result<()> {
    if from == to {
        Ok(())
    } else {
        Err(TrellisError::UnsupportedConversion {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Stem of an entry name: the final component up to its first dot,
/// prefixed by any directory part. `anat/t1w.nii.gz` -> `anat/t1w`.
pub fn stem(name: &str) -> &str {
    let start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name[start..].find('.') {
        Some(dot) => &name[..start + dot],
        None => name,
    }
}

/// Extension of an entry name: everything after the final component's
/// first dot. `t1w.nii.gz` -> `nii.gz`.
pub fn extension(name: &str) -> Option<String> {
    let start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    name[start..].find('.').map(|dot| name[start + dot + 1..].to_string())
}
