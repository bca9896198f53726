use crate::error::{Result, TrellisError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Hard cap on basis dimensions per space. Real spaces use two or three.
pub const MAX_DIMENSIONS: usize = 16;

/// A point density within a [`DataSpace`]: an OR-combination of basis
/// dimension flags. The all-zero value addresses the single dataset-wide
/// row; the all-ones value (the space's span) addresses leaf rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Frequency(u32);

impl Frequency {
    /// The dataset-wide frequency (no dimensions set).
    pub const DATASET: Frequency = Frequency(0);

    #[cfg(test)]
    pub(crate) fn from_bits(bits: u32) -> Frequency {
        Frequency(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_dataset(self) -> bool {
        self.0 == 0
    }

    /// Combination of both frequencies' dimensions.
    pub fn union(self, other: Frequency) -> Frequency {
        Frequency(self.0 | other.0)
    }

    /// Dimensions common to both frequencies.
    pub fn intersection(self, other: Frequency) -> Frequency {
        Frequency(self.0 & other.0)
    }

    /// True when `self`'s dimensions are a subset of `other`'s, i.e. one
    /// `self` row aggregates many `other` rows. Every frequency is a
    /// parent of itself.
    pub fn is_parent(self, other: Frequency) -> bool {
        self.0 & other.0 == self.0
    }

    /// Number of basis dimensions in this frequency.
    pub fn dimension_count(self) -> u32 {
        self.0.count_ones()
    }

    pub(crate) fn contains(self, flag: Frequency) -> bool {
        flag.is_parent(self)
    }
}

// ── DataSpace ──────────────────────────────────────────────────

/// A closed set of basis dimensions, declared coarse-to-fine. Dimension
/// `i` in declaration order carries bit `1 << i`. Aliases give names to
/// commonly used combinations ("session", "subject", ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSpace {
    name: String,
    dimensions: Vec<String>,
    #[serde(default)]
    aliases: BTreeMap<String, Vec<String>>,
}

impl DataSpace {
    /// Declare a new space from an ordered list of basis dimension names.
    pub fn new<S, I>(name: S, dimensions: I) -> Result<DataSpace>
    where
        S: Into<String>,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let space = DataSpace {
            name: name.into(),
            dimensions: dimensions.into_iter().map(Into::into).collect(),
            aliases: BTreeMap::new(),
        };
        space.ensure_valid()?;
        Ok(space)
    }

    /// Name a combination of basis dimensions, e.g.
    /// `.alias("session", &["group", "member", "timepoint"])`.
    pub fn alias(mut self, name: &str, members: &[&str]) -> Result<DataSpace> {
        if self.dimensions.iter().any(|d| d == name) || self.aliases.contains_key(name) {
            return Err(TrellisError::Definition(format!(
                "alias {name} collides with an existing name in space {}",
                self.name
            )));
        }
        for member in members {
            if self.dimension_flag(member).is_none() {
                return Err(TrellisError::InvalidFrequency {
                    name: (*member).to_string(),
                    space: self.name.clone(),
                });
            }
        }
        self.aliases
            .insert(name.to_string(), members.iter().map(|m| m.to_string()).collect());
        Ok(self)
    }

    /// The space of a typical clinical study: groups of subjects scanned
    /// over timepoints.
    pub fn clinical() -> DataSpace {
        let mut aliases = BTreeMap::new();
        aliases.insert("subject".to_string(), vec!["group".into(), "member".into()]);
        aliases.insert(
            "session".to_string(),
            vec!["group".into(), "member".into(), "timepoint".into()],
        );
        aliases.insert(
            "group_timepoint".to_string(),
            vec!["group".into(), "timepoint".into()],
        );
        aliases.insert(
            "subject_timepoint".to_string(),
            vec!["member".into(), "timepoint".into()],
        );
        DataSpace {
            name: "clinical".to_string(),
            dimensions: vec!["group".into(), "member".into(), "timepoint".into()],
            aliases,
        }
    }

    /// A flat space of independent samples.
    pub fn samples() -> DataSpace {
        DataSpace {
            name: "samples".to_string(),
            dimensions: vec!["sample".into()],
            aliases: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Basis dimension names in declaration order.
    pub fn dimensions(&self) -> &[String] {
        &self.dimensions
    }

    /// Alias name -> member dimensions.
    pub fn aliases(&self) -> &BTreeMap<String, Vec<String>> {
        &self.aliases
    }

    /// The leaf frequency: all basis dimensions set.
    pub fn span(&self) -> Frequency {
        Frequency((1u32 << self.dimensions.len()) - 1)
    }

    /// The flag of a single basis dimension, if declared.
    pub fn dimension_flag(&self, name: &str) -> Option<Frequency> {
        self.dimensions
            .iter()
            .position(|d| d == name)
            .map(|i| Frequency(1 << i))
    }

    /// Parse a frequency name: `dataset`, a basis dimension, an alias, or
    /// basis names joined with `_`.
    pub fn frequency(&self, name: &str) -> Result<Frequency> {
        if name == "dataset" {
            return Ok(Frequency::DATASET);
        }
        if let Some(flag) = self.dimension_flag(name) {
            return Ok(flag);
        }
        if let Some(members) = self.aliases.get(name) {
            let mut freq = Frequency::DATASET;
            for member in members {
                freq = freq.union(self.dimension_flag(member).ok_or_else(|| {
                    TrellisError::Definition(format!(
                        "alias {name} refers to unknown dimension {member}"
                    ))
                })?);
            }
            return Ok(freq);
        }
        // Fall back to underscore-joined basis names.
        let mut freq = Frequency::DATASET;
        for part in name.split('_') {
            match self.dimension_flag(part) {
                Some(flag) => freq = freq.union(flag),
                None => {
                    return Err(TrellisError::InvalidFrequency {
                        name: name.to_string(),
                        space: self.name.clone(),
                    })
                }
            }
        }
        Ok(freq)
    }

    /// Canonical name of a frequency: `dataset`, an alias, a basis name,
    /// or basis names joined with `_` in declaration order.
    pub fn frequency_name(&self, frequency: Frequency) -> String {
        if frequency.is_dataset() {
            return "dataset".to_string();
        }
        for (name, members) in &self.aliases {
            let mut bits = Frequency::DATASET;
            for member in members {
                if let Some(flag) = self.dimension_flag(member) {
                    bits = bits.union(flag);
                }
            }
            if bits == frequency {
                return name.clone();
            }
        }
        self.basis_names(frequency).join("_")
    }

    /// Ensure a frequency lies within this space.
    pub fn validate(&self, frequency: Frequency) -> Result<()> {
        if frequency.is_parent(self.span()) {
            Ok(())
        } else {
            Err(TrellisError::InvalidFrequency {
                name: format!("0b{:b}", frequency.bits()),
                space: self.name.clone(),
            })
        }
    }

    /// Basis dimension names present in a frequency, declaration-ordered.
    pub fn basis_names(&self, frequency: Frequency) -> Vec<&str> {
        self.dimensions
            .iter()
            .enumerate()
            .filter(|(i, _)| frequency.contains(Frequency(1 << i)))
            .map(|(_, d)| d.as_str())
            .collect()
    }

    /// Enumerate all coordinate tuples at `frequency` given the discovered
    /// values per dimension, in deterministic sorted order. A dimension
    /// with no discovered values collapses to a single implicit coordinate
    /// and contributes no entry to the tuples.
    pub fn enumerate(
        &self,
        frequency: Frequency,
        discovered: &BTreeMap<String, Vec<String>>,
    ) -> Result<Vec<Coordinates>> {
        self.validate(frequency)?;
        let mut axes: Vec<(&str, Vec<String>)> = Vec::new();
        for name in self.basis_names(frequency) {
            if let Some(values) = discovered.get(name) {
                if !values.is_empty() {
                    let mut sorted = values.clone();
                    sorted.sort();
                    sorted.dedup();
                    axes.push((name, sorted));
                }
            }
        }

        let mut rows = vec![Coordinates::new()];
        for (dim, values) in axes {
            let mut next = Vec::with_capacity(rows.len() * values.len());
            for row in &rows {
                for value in &values {
                    let mut coords = row.clone();
                    coords.set(dim, value);
                    next.push(coords);
                }
            }
            rows = next;
        }
        Ok(rows)
    }

    /// Validation shared by the constructor and definition loading
    /// (deserialized spaces bypass `new`).
    pub(crate) fn ensure_valid(&self) -> Result<()> {
        if self.dimensions.is_empty() {
            return Err(TrellisError::Definition(format!(
                "space {} declares no dimensions",
                self.name
            )));
        }
        if self.dimensions.len() > MAX_DIMENSIONS {
            return Err(TrellisError::Definition(format!(
                "space {} declares {} dimensions (max {MAX_DIMENSIONS})",
                self.name,
                self.dimensions.len()
            )));
        }
        for (i, dim) in self.dimensions.iter().enumerate() {
            if dim.is_empty() || dim == "dataset" || self.dimensions[..i].contains(dim) {
                return Err(TrellisError::Definition(format!(
                    "space {} has an invalid or duplicate dimension name: {dim:?}",
                    self.name
                )));
            }
        }
        for (alias, members) in &self.aliases {
            for member in members {
                if self.dimension_flag(member).is_none() {
                    return Err(TrellisError::Definition(format!(
                        "alias {alias} refers to unknown dimension {member}"
                    )));
                }
            }
        }
        Ok(())
    }
}

// ── Coordinates ────────────────────────────────────────────────

/// The concrete dimension-value tuple identifying one row. The empty
/// tuple addresses the dataset-wide row.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Coordinates(BTreeMap<String, String>);

impl Coordinates {
    pub fn new() -> Coordinates {
        Coordinates(BTreeMap::new())
    }

    pub fn from_pairs<'a, I>(pairs: I) -> Coordinates
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut coords = Coordinates::new();
        for (dim, value) in pairs {
            coords.set(dim, value);
        }
        coords
    }

    pub fn set(&mut self, dimension: &str, value: &str) {
        self.0.insert(dimension.to_string(), value.to_string());
    }

    pub fn get(&self, dimension: &str) -> Option<&str> {
        self.0.get(dimension).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(d, v)| (d.as_str(), v.as_str()))
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (dim, value) in &self.0 {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{dim}={value}")?;
            first = false;
        }
        Ok(())
    }
}
