use crate::error::{Result, TrellisError};
use crate::format::DataFormat;
use crate::space::Frequency;
use crate::store::DataQuality;
use serde::{Deserialize, Serialize};

/// How much a source column matters, ascending. Salience gates
/// *presence*: what it means when resolution finds nothing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum ColumnSalience {
    /// Only resolved when asked for by name; never part of a pipeline's
    /// default source set.
    Checked,
    /// Resolves to an absent item when nothing matches.
    Optional,
    /// Absence fails the row.
    #[default]
    Expected,
    /// Absence aborts a whole pipeline run.
    Required,
}

impl ColumnSalience {
    pub fn requires_presence(self) -> bool {
        self >= ColumnSalience::Expected
    }

    pub fn in_default_set(self) -> bool {
        self > ColumnSalience::Checked
    }

    pub fn aborts_run(self) -> bool {
        self == ColumnSalience::Required
    }
}

/// Salience ladder for pipeline parameters.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum ParameterSalience {
    Debug,
    #[default]
    Optional,
    Recommended,
    /// Must be supplied before a run starts.
    Required,
}

impl ParameterSalience {
    pub fn is_required(self) -> bool {
        self == ParameterSalience::Required
    }
}

/// Optional path hint a source column's candidates must satisfy, on top
/// of the format. Glob syntax unless `is_regex` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MatchCriteria {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub is_regex: bool,
}

impl MatchCriteria {
    pub fn path(pattern: &str) -> MatchCriteria {
        MatchCriteria {
            path: Some(pattern.to_string()),
            is_regex: false,
        }
    }

    pub fn regex(pattern: &str) -> MatchCriteria {
        MatchCriteria {
            path: Some(pattern.to_string()),
            is_regex: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_none()
    }

    /// Whether an entry name (or its stem) satisfies the hint. Empty
    /// criteria select everything.
    pub fn selects(&self, name: &str, stem: &str) -> Result<bool> {
        let Some(pattern) = &self.path else {
            return Ok(true);
        };
        if self.is_regex {
            let re = regex::Regex::new(pattern).map_err(|e| {
                TrellisError::Definition(format!("invalid regex criteria {pattern:?}: {e}"))
            })?;
            Ok(re.is_match(name) || re.is_match(stem))
        } else {
            let glob = glob::Pattern::new(pattern).map_err(|e| {
                TrellisError::Definition(format!("invalid glob criteria {pattern:?}: {e}"))
            })?;
            Ok(glob.matches(name) || glob.matches(stem))
        }
    }
}

/// A declared way of reading one item per row at a given frequency.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceColumn {
    pub name: String,
    pub format: DataFormat,
    pub frequency: Frequency,
    pub salience: ColumnSalience,
    pub criteria: MatchCriteria,
    /// Items rated below this are resolved but flagged for exclusion.
    pub quality_threshold: Option<DataQuality>,
}

impl SourceColumn {
    pub fn new(name: &str, format: DataFormat, frequency: Frequency) -> SourceColumn {
        SourceColumn {
            name: name.to_string(),
            format,
            frequency,
            salience: ColumnSalience::default(),
            criteria: MatchCriteria::default(),
            quality_threshold: None,
        }
    }

    pub fn salience(mut self, salience: ColumnSalience) -> SourceColumn {
        self.salience = salience;
        self
    }

    pub fn criteria(mut self, criteria: MatchCriteria) -> SourceColumn {
        self.criteria = criteria;
        self
    }

    pub fn quality_threshold(mut self, threshold: DataQuality) -> SourceColumn {
        self.quality_threshold = Some(threshold);
        self
    }
}

/// A declared way of writing one derived item per row.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkColumn {
    pub name: String,
    pub format: DataFormat,
    pub frequency: Frequency,
    /// Stem the written entry is stored under; defaults to the column
    /// name.
    pub path: Option<String>,
}

impl SinkColumn {
    pub fn new(name: &str, format: DataFormat, frequency: Frequency) -> SinkColumn {
        SinkColumn {
            name: name.to_string(),
            format,
            frequency,
            path: None,
        }
    }

    pub fn path(mut self, path: &str) -> SinkColumn {
        self.path = Some(path.to_string());
        self
    }

    pub fn write_stem(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.name)
    }
}
